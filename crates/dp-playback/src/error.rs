//! Playback error taxonomy
//!
//! Validation failures leave state unchanged; device errors force the
//! transport to `Idle`; decoder errors mid-stream get one recovery
//! attempt before terminating playback.

use thiserror::Error;

use dp_core::ValidationError;
use dp_daq::DaqError;

#[derive(Error, Debug)]
pub enum PlaybackError {
    #[error(transparent)]
    Validation(#[from] ValidationError),

    #[error("Decoder error: {0}")]
    Decoder(String),

    #[error(transparent)]
    Device(#[from] DaqError),

    #[error("{0}")]
    InvalidState(String),

    #[error("Internal error: {0}")]
    Internal(String),
}

pub type PlaybackResult<T> = Result<T, PlaybackError>;
