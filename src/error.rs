//! Error types for nodus

use thiserror::Error;

/// Main error type for nodus
#[derive(Error, Debug)]
pub enum Error {
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("Configuration error: {0}")]
    Config(String),

    #[error("Protocol error: {0}")]
    Protocol(String),

    #[error("Transport error: {0}")]
    Transport(String),

    #[error("Invalid address: {0}")]
    InvalidAddress(String),

    #[error("Invalid destination: {0}")]
    InvalidDestination(String),

    #[error("No routing rule matched")]
    NoRoute,

    #[error("Pipe closed")]
    Closed,

    #[error("Pipe interrupted")]
    Interrupted,

    #[error("Timeout")]
    Timeout,

    #[error("Sniffing failed: {0}")]
    Sniffing(#[from] crate::sniff::SniffError),
}

impl From<crate::common::pipe::PipeError> for Error {
    fn from(e: crate::common::pipe::PipeError) -> Self {
        use crate::common::pipe::PipeError;
        match e {
            PipeError::Closed => Error::Closed,
            PipeError::Interrupted => Error::Interrupted,
            PipeError::Timeout => Error::Timeout,
        }
    }
}

/// Result type alias for nodus
pub type Result<T> = std::result::Result<T, Error>;
