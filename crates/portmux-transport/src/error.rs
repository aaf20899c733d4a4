//! Transport error types

use thiserror::Error;

/// Transport errors
///
/// The `Display` text of these errors is what ends up in diagnostic lines,
/// so every variant carries enough context to stand on its own.
#[derive(Debug, Error)]
pub enum TransportError {
    #[error("Invalid descriptor '{descriptor}': {reason}")]
    InvalidDescriptor { descriptor: String, reason: String },

    #[error("Connection error: {0}")]
    ConnectionError(String),

    #[error("IO error: {0}")]
    IoError(#[from] std::io::Error),

    #[error("Timeout")]
    Timeout,

    #[error("Operation not supported")]
    NotSupported,

    #[error("Endpoint already open")]
    AlreadyOpen,

    #[error("Channel rejected by peer: {0}")]
    Rejected(String),

    #[error("Protocol error: {0}")]
    ProtocolError(String),

    #[error("Configuration error: {0}")]
    ConfigurationError(String),

    #[error("TLS error: {0}")]
    TlsError(String),

    #[error("Transport closed")]
    Closed,
}

pub type TransportResult<T> = Result<T, TransportError>;
