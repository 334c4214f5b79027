//! Durable storage for message bodies and other per-item artifacts.
//!
//! Bodies are written once and shared by every queue item that delivers
//! them; a reference count in a sidecar file decides when the bytes can be
//! removed. See [`Storage`].

mod body;
mod config;
mod error;
mod storage;

pub use body::{BodyId, BodyMetadata, BodyWriter};
pub use config::StoreConfig;
pub use error::{SerializationError, StoreError, ValidationError};
pub use storage::Storage;
