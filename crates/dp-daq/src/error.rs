//! DAQ error types

use thiserror::Error;

#[derive(Error, Debug)]
pub enum DaqError {
    #[error("No DAQ device found")]
    NoDevice,

    #[error("Device not found: {0}")]
    DeviceNotFound(String),

    #[error("Failed to create task: {0}")]
    TaskCreation(String),

    #[error("Driver error: {0}")]
    Driver(String),

    #[error("Device disconnected: {0}")]
    Disconnected(String),

    #[error("Write timed out after {0} ms")]
    WriteTimeout(u64),

    #[error("Session is not running")]
    NotRunning,
}

pub type DaqResult<T> = Result<T, DaqError>;
