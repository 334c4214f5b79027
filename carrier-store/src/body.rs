use std::{
    fmt,
    io,
    path::PathBuf,
    pin::Pin,
    str::FromStr,
    task::{Context, Poll},
};

use serde::{Deserialize, Serialize};
use tokio::{
    fs::{self, File},
    io::{AsyncWrite, AsyncWriteExt},
};

use crate::{StoreError, storage::write_metadata};

pub(crate) const DATA_EXT: &str = "eml";
pub(crate) const META_EXT: &str = "bin";
pub(crate) const TEMP_PREFIX: &str = ".tmp_";

/// Identifier of a stored body.
///
/// A ULID, so identifiers sort by creation time and double as file names.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct BodyId(ulid::Ulid);

impl BodyId {
    #[must_use]
    pub fn generate() -> Self {
        Self(ulid::Ulid::new())
    }

    /// Parses `01ARZ3NDEKTSV4RRFFQ69G5FAV.eml` or `.bin` file names.
    ///
    /// Anything containing path separators or traversal patterns is
    /// rejected outright.
    #[must_use]
    pub fn from_filename(filename: &str) -> Option<Self> {
        if filename.contains(['/', '\\']) || filename.contains("..") {
            return None;
        }

        let (stem, ext) = filename.rsplit_once('.')?;
        if ext != DATA_EXT && ext != META_EXT {
            return None;
        }

        stem.parse().ok()
    }

    pub(crate) fn data_filename(self) -> String {
        format!("{}.{DATA_EXT}", self.0)
    }

    pub(crate) fn meta_filename(self) -> String {
        format!("{}.{META_EXT}", self.0)
    }
}

impl fmt::Display for BodyId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

impl FromStr for BodyId {
    type Err = ulid::DecodeError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        ulid::Ulid::from_string(s).map(Self)
    }
}

impl Serialize for BodyId {
    fn serialize<S>(&self, serializer: S) -> Result<S::Ok, S::Error>
    where
        S: serde::Serializer,
    {
        serializer.serialize_str(&self.0.to_string())
    }
}

impl<'de> Deserialize<'de> for BodyId {
    fn deserialize<D>(deserializer: D) -> Result<Self, D::Error>
    where
        D: serde::Deserializer<'de>,
    {
        let s = String::deserialize(deserializer)?;
        s.parse().map_err(serde::de::Error::custom)
    }
}

/// The sidecar persisted next to each body.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct BodyMetadata {
    pub ref_count: u64,
    pub size: u64,
}

/// Write side of a body that has not been committed yet.
///
/// Bytes go to a temporary file that is invisible to readers. [`commit`]
/// makes the body durable with a reference count of zero; dropping the
/// writer without committing discards it.
///
/// [`commit`]: BodyWriter::commit
pub struct BodyWriter {
    id: BodyId,
    dir: PathBuf,
    file: File,
    written: u64,
    committed: bool,
}

impl BodyWriter {
    pub(crate) async fn create(dir: PathBuf, id: BodyId) -> Result<Self, StoreError> {
        let file = File::create(dir.join(format!("{TEMP_PREFIX}{}", id.data_filename()))).await?;

        Ok(Self {
            id,
            dir,
            file,
            written: 0,
            committed: false,
        })
    }

    #[must_use]
    pub const fn id(&self) -> BodyId {
        self.id
    }

    fn temp_path(&self) -> PathBuf {
        self.dir
            .join(format!("{TEMP_PREFIX}{}", self.id.data_filename()))
    }

    /// Flushes, syncs and publishes the body.
    ///
    /// The metadata sidecar is published before the data file; a body is
    /// only considered present once both exist.
    pub async fn commit(mut self) -> Result<BodyId, StoreError> {
        self.file.flush().await?;
        self.file.sync_all().await?;

        write_metadata(
            &self.dir,
            self.id,
            BodyMetadata {
                ref_count: 0,
                size: self.written,
            },
        )
        .await?;
        fs::rename(self.temp_path(), self.dir.join(self.id.data_filename())).await?;

        self.committed = true;
        Ok(self.id)
    }
}

impl AsyncWrite for BodyWriter {
    fn poll_write(
        mut self: Pin<&mut Self>,
        cx: &mut Context<'_>,
        buf: &[u8],
    ) -> Poll<io::Result<usize>> {
        let poll = Pin::new(&mut self.file).poll_write(cx, buf);
        if let Poll::Ready(Ok(n)) = poll {
            self.written += n as u64;
        }
        poll
    }

    fn poll_flush(mut self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<io::Result<()>> {
        Pin::new(&mut self.file).poll_flush(cx)
    }

    fn poll_shutdown(mut self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<io::Result<()>> {
        Pin::new(&mut self.file).poll_shutdown(cx)
    }
}

impl Drop for BodyWriter {
    fn drop(&mut self) {
        if !self.committed {
            let _ = std::fs::remove_file(self.temp_path());
        }
    }
}
