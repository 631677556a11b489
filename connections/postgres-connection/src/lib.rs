/*
 * Copyright 2020 Joyent, Inc.
 */

//! A poolroom `Connection` for PostgreSQL
//!
//! The url of an [`Endpoint`] is the `host` or `host:port` of the server; its
//! user name and password are the login credentials. Settings shared by every
//! endpoint, such as the database name and TLS mode, come from a
//! [`PostgresConnectionConfig`] captured by the connection creator.

use std::error::Error as StdError;
use std::fmt;
use std::ops::{Deref, DerefMut};

use native_tls::Certificate as NativeCertificate;
use native_tls::Error as NativeError;
use native_tls::TlsConnector;
use postgres::{Client, Config, NoTls};
use postgres_native_tls::MakeTlsConnector;
use serde_derive::Deserialize;

use poolroom::connection::Connection;
use poolroom::endpoint::Endpoint;

#[derive(Debug)]
pub enum PostgresConnectionError {
    Postgres(postgres::Error),
    Tls(NativeError),
    /// The TLS mode verifies the server certificate but no root certificate
    /// was configured.
    MissingCertificate(TlsConnectMode),
}

impl fmt::Display for PostgresConnectionError {
    fn fmt(&self, fmt: &mut fmt::Formatter) -> fmt::Result {
        match self {
            PostgresConnectionError::Postgres(e) => write!(fmt, "{}", e),
            PostgresConnectionError::Tls(e) => {
                write!(fmt, "TLS setup failed: {}", e)
            }
            PostgresConnectionError::MissingCertificate(mode) => write!(
                fmt,
                "a certificate is required for sslmode {}",
                mode
            ),
        }
    }
}

impl StdError for PostgresConnectionError {
    fn source(&self) -> Option<&(dyn StdError + 'static)> {
        match self {
            PostgresConnectionError::Postgres(e) => Some(e),
            PostgresConnectionError::Tls(e) => Some(e),
            PostgresConnectionError::MissingCertificate(_) => None,
        }
    }
}

impl From<postgres::Error> for PostgresConnectionError {
    fn from(e: postgres::Error) -> Self {
        PostgresConnectionError::Postgres(e)
    }
}

impl From<NativeError> for PostgresConnectionError {
    fn from(e: NativeError) -> Self {
        PostgresConnectionError::Tls(e)
    }
}

pub struct PostgresConnection {
    pub connection: Option<Client>,
    url: String,
    endpoint: Endpoint,
    config: PostgresConnectionConfig,
}

impl PostgresConnection {
    pub fn connection_creator(
        config: PostgresConnectionConfig,
    ) -> impl Fn(&Endpoint) -> PostgresConnection + Send + Sync + 'static {
        move |endpoint: &Endpoint| PostgresConnection {
            connection: None,
            url: connection_url(&config, endpoint),
            endpoint: endpoint.clone(),
            config: config.clone(),
        }
    }

    /// The server url. Credentials and session settings are not part of it.
    pub fn url(&self) -> &str {
        &self.url
    }
}

impl Connection for PostgresConnection {
    type Error = PostgresConnectionError;

    fn connect(&mut self) -> Result<(), Self::Error> {
        let pg_config =
            client_config(&self.url, &self.config, &self.endpoint)?;

        let connection = match make_tls_connector(&self.config.tls_config)? {
            Some(tls_connector) => pg_config.connect(tls_connector)?,
            None => pg_config.connect(NoTls)?,
        };
        self.connection = Some(connection);
        Ok(())
    }

    fn is_valid(&mut self) -> bool {
        match self.connection.as_mut() {
            Some(conn) => conn.simple_query("").is_ok(),
            None => false,
        }
    }

    fn has_broken(&self) -> bool {
        match &self.connection {
            Some(conn) => conn.is_closed(),
            None => false,
        }
    }

    fn close(&mut self) -> Result<(), Self::Error> {
        self.connection = None;
        Ok(())
    }
}

impl Deref for PostgresConnection {
    type Target = Client;

    fn deref(&self) -> &Client {
        self.connection
            .as_ref()
            .expect("postgres connection is not established")
    }
}

impl DerefMut for PostgresConnection {
    fn deref_mut(&mut self) -> &mut Client {
        self.connection
            .as_mut()
            .expect("postgres connection is not established")
    }
}

#[derive(Clone)]
pub struct PostgresConnectionConfig {
    pub database: Option<String>,
    pub application_name: Option<String>,
    pub tls_config: TlsConfig,
}

impl Default for PostgresConnectionConfig {
    fn default() -> Self {
        PostgresConnectionConfig {
            database: None,
            application_name: None,
            tls_config: TlsConfig::disable(),
        }
    }
}

// Build the server part of the url: host, port and TLS mode. Everything
// taken from user input that the url parser would interpret (user names,
// passwords, database and application names) is set on the parsed `Config`
// instead.
fn connection_url(
    config: &PostgresConnectionConfig,
    endpoint: &Endpoint,
) -> String {
    let host = endpoint.url();
    let host = if host.is_empty() { "localhost" } else { host };

    [
        "postgresql://",
        host,
        "?sslmode=",
        config.tls_config.mode.sslmode(),
    ]
    .concat()
}

fn client_config(
    url: &str,
    config: &PostgresConnectionConfig,
    endpoint: &Endpoint,
) -> Result<Config, postgres::Error> {
    let mut pg_config: Config = url.parse()?;

    if !endpoint.username().is_empty() {
        pg_config.user(endpoint.username());
    }
    if !endpoint.password().is_empty() {
        pg_config.password(endpoint.password());
    }
    if let Some(database) = config.database.as_ref().filter(|d| !d.is_empty())
    {
        pg_config.dbname(database);
    }
    if let Some(name) =
        config.application_name.as_ref().filter(|n| !n.is_empty())
    {
        pg_config.application_name(name);
    }

    Ok(pg_config)
}

#[derive(Debug, Clone, Copy, Deserialize, PartialEq)]
pub enum TlsConnectMode {
    #[serde(alias = "disable")]
    Disable,
    #[serde(alias = "allow")]
    Allow,
    #[serde(alias = "prefer")]
    Prefer,
    #[serde(alias = "require")]
    Require,
    #[serde(alias = "verify-ca")]
    VerifyCa,
    #[serde(alias = "verify-full")]
    VerifyFull,
}

impl TlsConnectMode {
    // The value of the `sslmode` url parameter. The postgres client only
    // negotiates TLS as disable, prefer, or require; the stricter modes are
    // enforced by the connector's certificate verification.
    fn sslmode(self) -> &'static str {
        match self {
            TlsConnectMode::Disable => "disable",
            TlsConnectMode::Allow | TlsConnectMode::Prefer => "prefer",
            TlsConnectMode::Require
            | TlsConnectMode::VerifyCa
            | TlsConnectMode::VerifyFull => "require",
        }
    }
}

impl fmt::Display for TlsConnectMode {
    fn fmt(&self, fmt: &mut fmt::Formatter) -> fmt::Result {
        let mode = match self {
            TlsConnectMode::Disable => "disable",
            TlsConnectMode::Allow => "allow",
            TlsConnectMode::Prefer => "prefer",
            TlsConnectMode::Require => "require",
            TlsConnectMode::VerifyCa => "verify-ca",
            TlsConnectMode::VerifyFull => "verify-full",
        };
        fmt.write_str(mode)
    }
}

/// An X509 certificate.
pub type Certificate = NativeCertificate;

/// An error returned from the TLS implementation.
pub type CertificateError = NativeError;

#[derive(Clone)]
pub struct TlsConfig {
    mode: TlsConnectMode,
    certificate: Option<Certificate>,
}

impl TlsConfig {
    pub fn disable() -> Self {
        TlsConfig {
            mode: TlsConnectMode::Disable,
            certificate: None,
        }
    }

    pub fn allow(certificate: Option<Certificate>) -> Self {
        TlsConfig {
            mode: TlsConnectMode::Allow,
            certificate,
        }
    }

    pub fn prefer(certificate: Option<Certificate>) -> Self {
        TlsConfig {
            mode: TlsConnectMode::Prefer,
            certificate,
        }
    }

    pub fn require(certificate: Option<Certificate>) -> Self {
        TlsConfig {
            mode: TlsConnectMode::Require,
            certificate,
        }
    }

    pub fn verify_ca(certificate: Certificate) -> Self {
        TlsConfig {
            mode: TlsConnectMode::VerifyCa,
            certificate: Some(certificate),
        }
    }

    pub fn verify_full(certificate: Certificate) -> Self {
        TlsConfig {
            mode: TlsConnectMode::VerifyFull,
            certificate: Some(certificate),
        }
    }

    pub fn mode(&self) -> TlsConnectMode {
        self.mode
    }
}

fn make_tls_connector(
    tls_config: &TlsConfig,
) -> Result<Option<MakeTlsConnector>, PostgresConnectionError> {
    let m_cert = tls_config.certificate.clone();
    let connector = match tls_config.mode {
        TlsConnectMode::Disable => return Ok(None),
        TlsConnectMode::Allow
        | TlsConnectMode::Prefer
        | TlsConnectMode::Require => match m_cert {
            // root cert supplied, use it to verify server certs
            Some(cert) => {
                TlsConnector::builder().add_root_certificate(cert).build()?
            }
            // no cert given, certificate verification is disabled
            None => TlsConnector::builder()
                .danger_accept_invalid_certs(true)
                .build()?,
        },
        TlsConnectMode::VerifyCa => match m_cert {
            Some(cert) => TlsConnector::builder()
                .add_root_certificate(cert)
                .danger_accept_invalid_hostnames(true)
                .build()?,
            None => {
                return Err(PostgresConnectionError::MissingCertificate(
                    tls_config.mode,
                ))
            }
        },
        TlsConnectMode::VerifyFull => match m_cert {
            Some(cert) => {
                TlsConnector::builder().add_root_certificate(cert).build()?
            }
            None => {
                return Err(PostgresConnectionError::MissingCertificate(
                    tls_config.mode,
                ))
            }
        },
    };

    Ok(Some(MakeTlsConnector::new(connector)))
}
