//! Error types for ringnet

use std::time::Duration;
use thiserror::Error;

#[derive(Error, Debug)]
pub enum Error {
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("Timed out after {0:?}")]
    Timeout(Duration),

    #[error("Malformed message: {0}")]
    Malformed(String),

    #[error("Protocol error: {0}")]
    Protocol(String),

    #[error("Rejected by bootstrap server (code {code})")]
    Rejected { code: u32 },

    #[error("Frame of {0} bytes exceeds the 4-digit length prefix")]
    FrameTooLarge(usize),

    #[error("Invalid address: {0}")]
    InvalidAddress(String),

    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),

    #[error("Client stopped")]
    Stopped,

    #[error("Gave up after {attempts} attempts: {last}")]
    RetriesExhausted {
        attempts: u32,
        #[source]
        last: Box<Error>,
    },
}

impl Error {
    /// Transport-level failures worth another attempt on a fresh socket
    pub fn is_retryable(&self) -> bool {
        matches!(self, Error::Io(_) | Error::Timeout(_) | Error::Malformed(_))
    }
}

pub type Result<T> = std::result::Result<T, Error>;
