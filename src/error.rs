use thiserror::Error;

use crate::bencode::BencodeError;

pub type Result<T> = std::result::Result<T, Error>;

/// Errors produced by the piece engine, the peer wire engine and the trackers.
#[derive(Debug, Error)]
pub enum Error {
    /// Malformed constructor or method input.
    #[error("invalid argument: {0}")]
    InvalidArgument(String),

    /// The operation is not valid for the current piece or session state.
    #[error("invalid state: {0}")]
    InvalidState(String),

    /// Malformed wire data. Fatal to the connection that produced it.
    #[error("protocol error: {0}")]
    Protocol(String),

    /// Socket level failure.
    #[error("transport error: {0}")]
    Transport(#[from] std::io::Error),

    #[error("operation timed out")]
    Timeout,

    #[error("http error: {0}")]
    Http(#[from] reqwest::Error),

    /// The tracker answered with an explicit failure.
    #[error("tracker failure: {0}")]
    Tracker(String),

    #[error("bencode error: {0}")]
    Bencode(#[from] BencodeError),
}

impl Error {
    pub(crate) fn invalid_argument(message: impl Into<String>) -> Self {
        Error::InvalidArgument(message.into())
    }

    pub(crate) fn invalid_state(message: impl Into<String>) -> Self {
        Error::InvalidState(message.into())
    }

    pub(crate) fn protocol(message: impl Into<String>) -> Self {
        Error::Protocol(message.into())
    }
}

impl From<tokio::time::error::Elapsed> for Error {
    fn from(_: tokio::time::error::Elapsed) -> Self {
        Error::Timeout
    }
}
