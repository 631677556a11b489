// Copyright 2020 Joyent, Inc.

use std::fmt;

use base64;
use sha1::Sha1;

use derive_more::{Display, From, Into};

/// A base64 encoded identifier based on the endpoint url, username, and
/// password. Safe to log: the password only contributes to the digest.
#[derive(
    Clone, Debug, Display, Eq, From, Hash, Into, Ord, PartialOrd, PartialEq,
)]
pub struct EndpointKey(String);

/// The location of a database endpoint, usually a driver-specific url.
pub type EndpointUrl = String;
/// The user name presented to the endpoint.
pub type EndpointUser = String;

/// The identity of a set of pooled connections: every distinct
/// `(url, username, password)` triple gets its own pool.
///
/// Two endpoints are equal only if all three fields are byte-for-byte equal.
/// The password is never included in `Display` or `Debug` output.
#[derive(Clone, Eq, Hash, PartialEq)]
pub struct Endpoint {
    url: EndpointUrl,
    username: EndpointUser,
    password: String,
}

impl Endpoint {
    /// Return a new `Endpoint`.
    pub fn new<U, N, P>(url: U, username: N, password: P) -> Self
    where
        U: Into<EndpointUrl>,
        N: Into<EndpointUser>,
        P: Into<String>,
    {
        Endpoint {
            url: url.into(),
            username: username.into(),
            password: password.into(),
        }
    }

    pub fn url(&self) -> &str {
        &self.url
    }

    pub fn username(&self) -> &str {
        &self.username
    }

    pub fn password(&self) -> &str {
        &self.password
    }
}

impl fmt::Display for Endpoint {
    fn fmt(&self, fmt: &mut fmt::Formatter) -> fmt::Result {
        write!(fmt, "{} (user \"{}\")", self.url, self.username)
    }
}

impl fmt::Debug for Endpoint {
    fn fmt(&self, fmt: &mut fmt::Formatter) -> fmt::Result {
        fmt.debug_struct("Endpoint")
            .field("url", &self.url)
            .field("username", &self.username)
            .field("password", &"<redacted>")
            .finish()
    }
}

/// Return a base64 encoded identifier based on the fields of the endpoint.
pub fn endpoint_key(endpoint: &Endpoint) -> EndpointKey {
    let mut sha1 = Sha1::new();
    sha1.update(endpoint.url.as_bytes());
    sha1.update(b"||");
    sha1.update(endpoint.username.as_bytes());
    sha1.update(b"||");
    sha1.update(endpoint.password.as_bytes());

    base64::encode(&sha1.digest().bytes()).into()
}
