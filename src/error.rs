//! Our error types for the instrument drivers.

use thiserror::Error;

use crate::{command::InvalidParameter, response::ResponseError};

pub type Result<T, I> = core::result::Result<T, Error<I>>;

/// Error type shared by every driver, generic over the transport's own error.
#[derive(Error, Debug)]
pub enum Error<I: embedded_io::Error> {
    /// Local validation failure. Nothing was sent.
    #[error(transparent)]
    InvalidParameter(#[from] InvalidParameter),
    #[error("unsupported transport mode {0:?}")]
    UnsupportedMode(String),
    /// The reply did not echo the noun that was asked for.
    #[error("expected a reply starting with {expected:?}, got {response:?}")]
    ProtocolMismatch { expected: String, response: String },
    #[error("invalid response received: {0:?}")]
    InvalidResponse(String),
    #[error("transport error: {0:?}")]
    Transport(I),
    #[error("reply did not fit in the receive buffer")]
    BufferOverflow,
    #[error("device fault: {0}")]
    DeviceFault(String),
    #[error("deadline exceeded after {attempts} attempts (last status {last_status:?})")]
    DeadlineExceeded {
        attempts: u32,
        last_status: Option<String>,
    },
    #[error("cancelled after {attempts} attempts")]
    Cancelled { attempts: u32 },
}

impl<I: embedded_io::Error> From<ResponseError> for Error<I> {
    fn from(err: ResponseError) -> Self {
        match err {
            ResponseError::Mismatch { expected, response } => {
                Error::ProtocolMismatch { expected, response }
            }
            ResponseError::Malformed(response) => Error::InvalidResponse(response),
        }
    }
}

impl<I: embedded_io::Error> Error<I> {
    /// Whether this error was raised before anything reached the wire.
    pub fn is_local(&self) -> bool {
        matches!(
            self,
            Error::InvalidParameter(_) | Error::UnsupportedMode(_)
        )
    }
}
