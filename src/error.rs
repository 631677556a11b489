// Copyright 2020 Joyent, Inc.

use std::error::Error as StdError;
use std::fmt;

#[derive(Debug)]
pub enum Error {
    /// A connection to the endpoint could not be established. `endpoint` is
    /// the display form of the endpoint (never including the password) and
    /// `source` the error reported by the connection implementation.
    ConnectionFailure {
        endpoint: String,
        source: Box<dyn StdError + Send + Sync>,
    },
    /// No connection became available within the configured claim timeout
    /// (milliseconds).
    ClaimTimeout(u64),
}

impl fmt::Display for Error {
    fn fmt(&self, fmt: &mut fmt::Formatter) -> fmt::Result {
        match self {
            Error::ConnectionFailure { endpoint, source } => write!(
                fmt,
                "failed to establish connection to {}: {}",
                endpoint, source
            ),
            Error::ClaimTimeout(timeout_ms) => write!(
                fmt,
                "timed out after {} ms waiting for a pool connection",
                timeout_ms
            ),
        }
    }
}

impl StdError for Error {
    fn source(&self) -> Option<&(dyn StdError + 'static)> {
        match self {
            Error::ConnectionFailure { source, .. } => Some(source.as_ref()),
            Error::ClaimTimeout(_) => None,
        }
    }
}
