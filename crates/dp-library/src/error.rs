//! Library error types

use thiserror::Error;

#[derive(Error, Debug)]
pub enum LibraryError {
    #[error("Failed to read {path}: {message}")]
    Read { path: String, message: String },

    #[error("Failed to write {path}: {message}")]
    Write { path: String, message: String },

    #[error("Failed to parse metadata: {0}")]
    Metadata(String),

    #[error("Invalid playlist: {0}")]
    Playlist(String),

    #[error("Composition failed: {0}")]
    Compose(String),

    #[error("Cache error: {0}")]
    Cache(String),

    #[error(transparent)]
    Io(#[from] std::io::Error),
}

pub type LibraryResult<T> = Result<T, LibraryError>;
