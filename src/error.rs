//! Error Taxonomy
//!
//! Every fallible operation in the node returns `Result<T, Error>`. The HTTP
//! emitter and the binary protocol each map these kinds onto their own wire
//! representation (`Error::http_status`, connection close rules), so handlers
//! never write status codes themselves.

use thiserror::Error;

pub type Result<T> = std::result::Result<T, Error>;

#[derive(Debug, Error)]
pub enum Error {
    /// The peer went away mid-request. Not reported, just unwound.
    #[error("client disconnected: {0}")]
    ClientDisconnect(String),

    /// Malformed request surface: bad URL, bad query string, bad body.
    #[error("parse error: {0}")]
    ParseError(String),

    /// Binary framing violation: type out of range, truncated varint,
    /// unknown compressor tag. Always closes the connection.
    #[error("protocol violation: {0}")]
    ProtocolViolation(String),

    /// No operation for this (method, command) combination.
    #[error("routing error: {0}")]
    RoutingError(String),

    #[error("endpoint resolution failed: {0}")]
    EndpointResolution(String),

    /// Checkout failed or timed out waiting on the write-intent lock.
    #[error("database checkout failed: {0}")]
    DatabaseCheckout(String),

    #[error("storage error: {0}")]
    StorageError(String),

    #[error("serialisation error: {0}")]
    Serialisation(String),

    /// A bounded queue (thread pool, write queue) refused the work.
    #[error("quota exceeded: {0}")]
    QuotaExceeded(String),

    /// Request body over the hard limit, or the spill that would have
    /// accepted it failed.
    #[error("payload too large")]
    PayloadTooLarge,

    #[error("unsupported media type: {0}")]
    UnsupportedMediaType(String),

    #[error("shutting down")]
    ShutdownInProgress,
}

impl Error {
    /// HTTP status for this kind. The two 400 variants with special bodies
    /// (`Unknown Endpoint`, `Unknown host …`) are rendered by the emitter
    /// from the error message.
    pub fn http_status(&self) -> u16 {
        match self {
            Error::ParseError(_) | Error::RoutingError(_) => 400,
            Error::EndpointResolution(_) => 400,
            Error::UnsupportedMediaType(_) => 406,
            Error::DatabaseCheckout(_) => 502,
            Error::QuotaExceeded(_) => 503,
            Error::PayloadTooLarge => 413,
            Error::StorageError(_) | Error::Serialisation(_) => 500,
            Error::ShutdownInProgress => 503,
            Error::ClientDisconnect(_) | Error::ProtocolViolation(_) => 500,
        }
    }

    /// Whether a binary connection carrying this error must be dropped
    /// instead of replying with an error frame.
    pub fn closes_connection(&self) -> bool {
        matches!(
            self,
            Error::ProtocolViolation(_) | Error::ClientDisconnect(_)
        )
    }
}

impl From<serde_json::Error> for Error {
    fn from(e: serde_json::Error) -> Self {
        Error::Serialisation(e.to_string())
    }
}

impl From<rmp_serde::encode::Error> for Error {
    fn from(e: rmp_serde::encode::Error) -> Self {
        Error::Serialisation(e.to_string())
    }
}

impl From<rmp_serde::decode::Error> for Error {
    fn from(e: rmp_serde::decode::Error) -> Self {
        Error::Serialisation(e.to_string())
    }
}
