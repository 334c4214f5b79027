//! Error types for the carrier-store crate.

use std::io;

use thiserror::Error;

#[derive(Debug, Error)]
pub enum StoreError {
    /// I/O operation failed (file read/write/delete).
    #[error("I/O error: {0}")]
    Io(#[from] io::Error),

    #[error("Serialization error: {0}")]
    Serialization(#[from] SerializationError),

    /// The body or artifact does not exist (or was already released).
    #[error("Not found: {0}")]
    NotFound(String),

    #[error("Storage validation error: {0}")]
    Validation(#[from] ValidationError),
}

#[derive(Debug, Error)]
pub enum SerializationError {
    #[error("Bincode encode error: {0}")]
    Encode(#[from] bincode::error::EncodeError),

    #[error("Bincode decode error: {0}")]
    Decode(#[from] bincode::error::DecodeError),
}

#[derive(Debug, Error)]
pub enum ValidationError {
    #[error("Storage path is not a directory: {0}")]
    NotDirectory(String),

    #[error("Storage path cannot contain '..' components: {0}")]
    ParentTraversal(String),

    #[error("Storage path must be absolute: {0}")]
    NotAbsolute(String),

    #[error("Storage path cannot be in system directory {prefix}: {path}")]
    SystemDirectory { prefix: String, path: String },

    /// Block names become directory names and are restricted accordingly.
    #[error("Invalid block name: {0:?}")]
    BlockName(String),
}

impl StoreError {
    /// Maps a `NotFound` I/O error onto [`StoreError::NotFound`] naming `what`.
    pub(crate) fn from_io(err: io::Error, what: impl FnOnce() -> String) -> Self {
        if err.kind() == io::ErrorKind::NotFound {
            Self::NotFound(what())
        } else {
            Self::Io(err)
        }
    }

    #[must_use]
    pub const fn is_not_found(&self) -> bool {
        matches!(self, Self::NotFound(_))
    }
}
