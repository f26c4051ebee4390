//! Validation error types

use thiserror::Error;

/// Errors for requests rejected before touching any device or file.
///
/// Validation failures never change engine state.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum ValidationError {
    #[error("Audio file not found: {0}")]
    FileNotFound(String),

    #[error("Unsupported audio format: {0}")]
    UnsupportedFormat(String),

    #[error("Unknown device: {0}")]
    UnknownDevice(String),

    #[error("At least one analog output channel must be specified")]
    NoOutputChannels,

    #[error("Invalid channel name: {0}")]
    BadChannelName(String),

    #[error("Duplicate channel: {0}")]
    DuplicateChannel(String),

    #[error("Channel not present on device: {0}")]
    ChannelNotPresent(String),

    #[error("{field} must be between {min} and {max}")]
    OutOfRange {
        field: &'static str,
        min: i64,
        max: i64,
    },

    #[error("Missing required field: {0}")]
    MissingField(&'static str),
}
