//! Relay-level errors.

use thiserror::Error;

#[derive(Debug, Error)]
pub enum RelayError {
    #[error("configuration: {0}")]
    Config(String),

    #[error("socket setup: {0}")]
    Socket(String),

    #[error("interface {0} has no IPv4 address")]
    Interface(String),

    #[error("i/o: {0}")]
    Io(#[from] std::io::Error),

    #[error(transparent)]
    Fec(#[from] sbr_fec::FecError),

    #[error("peer violated the protocol: {0}")]
    ProtocolViolation(String),
}

pub type RelayResult<T> = Result<T, RelayError>;
