use std::{
    collections::HashSet,
    io::ErrorKind,
    path::{Path, PathBuf},
};

use carrier_common::internal;
use tokio::{
    fs::{self, DirBuilder, File},
    sync::Mutex,
};

use crate::{
    BodyId, BodyMetadata, BodyWriter, SerializationError, StoreConfig, StoreError,
    ValidationError,
    body::{DATA_EXT, META_EXT, TEMP_PREFIX},
};

const BODIES: &str = "bodies";

/// File-backed store for bodies and block artifacts.
///
/// Layout under the root directory:
///
/// - `bodies/<id>.eml` holds the raw message bytes
/// - `bodies/<id>.bin` holds the bincode [`BodyMetadata`] sidecar
/// - `<block>/<id>` holds an artifact addressed by block name and number
///
/// Reference count updates are serialised by a single lock so concurrent
/// `add`/`release` calls never lose an update. Readers never take it.
#[derive(Debug)]
pub struct Storage {
    root: PathBuf,
    refs: Mutex<()>,
}

impl Storage {
    #[must_use]
    pub fn new(config: &StoreConfig) -> Self {
        Self::at(config.path.clone())
    }

    /// A store rooted at `root`, bypassing config validation.
    #[must_use]
    pub fn at(root: impl Into<PathBuf>) -> Self {
        Self {
            root: root.into(),
            refs: Mutex::new(()),
        }
    }

    #[must_use]
    pub fn root(&self) -> &Path {
        &self.root
    }

    fn bodies(&self) -> PathBuf {
        self.root.join(BODIES)
    }

    /// Creates the directory tree and removes leftovers from interrupted
    /// writes and releases.
    pub async fn init(&self) -> Result<(), StoreError> {
        internal!("Initialising storage at {}", self.root.display());

        match fs::metadata(&self.root).await {
            Ok(meta) if !meta.is_dir() => {
                return Err(ValidationError::NotDirectory(self.root.display().to_string()).into());
            }
            Ok(_) => {}
            Err(e) if e.kind() == ErrorKind::NotFound => {
                internal!("{} does not exist, creating...", self.root.display());
            }
            Err(e) => return Err(e.into()),
        }

        private_dir(&self.bodies()).await?;
        self.cleanup().await
    }

    /// A body is only live when both its data and metadata exist; anything
    /// else is debris from a crash.
    async fn cleanup(&self) -> Result<(), StoreError> {
        let dir = self.bodies();
        let mut entries = fs::read_dir(&dir).await?;
        let mut data = HashSet::new();
        let mut meta = HashSet::new();
        let mut cleaned = 0usize;

        while let Some(entry) = entries.next_entry().await? {
            let name = entry.file_name();
            let name = name.to_string_lossy();

            if name.starts_with(TEMP_PREFIX) {
                fs::remove_file(entry.path()).await?;
                cleaned += 1;
                continue;
            }

            if let Some(id) = BodyId::from_filename(&name) {
                if name.ends_with(DATA_EXT) {
                    data.insert(id);
                } else {
                    meta.insert(id);
                }
            }
        }

        for id in data.symmetric_difference(&meta) {
            remove_if_exists(&dir.join(id.data_filename())).await?;
            remove_if_exists(&dir.join(id.meta_filename())).await?;
            cleaned += 1;
        }

        if cleaned > 0 {
            internal!(
                level = INFO,
                "Cleaned up {cleaned} orphaned body files from storage"
            );
        }

        Ok(())
    }

    /// Starts a new body. Nothing is visible until the writer is committed.
    pub async fn new_body(&self) -> Result<(BodyWriter, BodyId), StoreError> {
        let id = BodyId::generate();
        let writer = BodyWriter::create(self.bodies(), id).await?;
        Ok((writer, id))
    }

    /// Takes a reference on a body and returns the new count.
    pub async fn add(&self, id: BodyId) -> Result<u64, StoreError> {
        self.add_references(id, 1).await
    }

    /// Takes `count` references in one step and returns the new count.
    pub async fn add_references(&self, id: BodyId, count: u64) -> Result<u64, StoreError> {
        let _guard = self.refs.lock().await;

        let mut meta = self.read_metadata(id).await?;
        meta.ref_count = meta.ref_count.saturating_add(count);
        write_metadata(&self.bodies(), id, meta).await?;

        tracing::trace!(body = %id, ref_count = meta.ref_count, "Body references added");
        Ok(meta.ref_count)
    }

    /// Drops a reference and returns the remaining count. The body is
    /// deleted when the count reaches zero.
    pub async fn release(&self, id: BodyId) -> Result<u64, StoreError> {
        let _guard = self.refs.lock().await;

        let mut meta = self.read_metadata(id).await?;
        meta.ref_count = meta.ref_count.saturating_sub(1);

        if meta.ref_count == 0 {
            let dir = self.bodies();
            fs::remove_file(dir.join(id.meta_filename())).await?;
            remove_if_exists(&dir.join(id.data_filename())).await?;
            internal!("Body {id} released and deleted");
        } else {
            write_metadata(&self.bodies(), id, meta).await?;
            tracing::trace!(body = %id, ref_count = meta.ref_count, "Body reference released");
        }

        Ok(meta.ref_count)
    }

    /// Returns references taken with [`add_references`] for items that
    /// were never queued. The body is kept even if no references remain,
    /// so the caller can try again.
    ///
    /// [`add_references`]: Storage::add_references
    pub async fn give_back(&self, id: BodyId, count: u64) -> Result<u64, StoreError> {
        let _guard = self.refs.lock().await;

        let mut meta = self.read_metadata(id).await?;
        meta.ref_count = meta.ref_count.saturating_sub(count);
        write_metadata(&self.bodies(), id, meta).await?;

        tracing::trace!(body = %id, ref_count = meta.ref_count, "Body references given back");
        Ok(meta.ref_count)
    }

    /// Current metadata of a body.
    pub async fn metadata(&self, id: BodyId) -> Result<BodyMetadata, StoreError> {
        self.read_metadata(id).await
    }

    /// Opens a committed body for reading. Any number of readers may be
    /// open at once.
    pub async fn open_body(&self, id: BodyId) -> Result<File, StoreError> {
        File::open(self.bodies().join(id.data_filename()))
            .await
            .map_err(|e| StoreError::from_io(e, || format!("body {id}")))
    }

    async fn read_metadata(&self, id: BodyId) -> Result<BodyMetadata, StoreError> {
        let dir = self.bodies();
        let bytes = fs::read(dir.join(id.meta_filename()))
            .await
            .map_err(|e| StoreError::from_io(e, || format!("body {id}")))?;

        if !fs::try_exists(dir.join(id.data_filename())).await? {
            return Err(StoreError::NotFound(format!("body {id}")));
        }

        let (meta, _) =
            bincode::serde::decode_from_slice(&bytes, bincode::config::standard())
                .map_err(SerializationError::from)?;
        Ok(meta)
    }

    fn artifact_path(&self, block: &str, id: i64) -> Result<PathBuf, StoreError> {
        let valid = !block.is_empty()
            && block != BODIES
            && block
                .bytes()
                .all(|b| b.is_ascii_alphanumeric() || b == b'-' || b == b'_');

        if valid {
            Ok(self.root.join(block).join(id.to_string()))
        } else {
            Err(ValidationError::BlockName(block.to_string()).into())
        }
    }

    /// Opens `<block>/<id>` for reading.
    pub async fn create_reader(&self, block: &str, id: i64) -> Result<File, StoreError> {
        let path = self.artifact_path(block, id)?;
        File::open(&path)
            .await
            .map_err(|e| StoreError::from_io(e, || format!("{block}/{id}")))
    }

    /// Creates (or truncates) `<block>/<id>`, creating the block directory
    /// owner-only if needed.
    pub async fn create_writer(&self, block: &str, id: i64) -> Result<File, StoreError> {
        let path = self.artifact_path(block, id)?;
        private_dir(&self.root.join(block)).await?;
        Ok(File::create(&path).await?)
    }

    /// Size in bytes of `<block>/<id>`.
    pub async fn size(&self, block: &str, id: i64) -> Result<u64, StoreError> {
        let path = self.artifact_path(block, id)?;
        let meta = fs::metadata(&path)
            .await
            .map_err(|e| StoreError::from_io(e, || format!("{block}/{id}")))?;
        Ok(meta.len())
    }

    pub async fn remove(&self, block: &str, id: i64) -> Result<(), StoreError> {
        let path = self.artifact_path(block, id)?;
        fs::remove_file(&path)
            .await
            .map_err(|e| StoreError::from_io(e, || format!("{block}/{id}")))
    }
}

/// Atomically replaces the metadata sidecar of `id` in `dir`.
pub(crate) async fn write_metadata(
    dir: &Path,
    id: BodyId,
    meta: BodyMetadata,
) -> Result<(), StoreError> {
    let bytes = bincode::serde::encode_to_vec(meta, bincode::config::standard())
        .map_err(SerializationError::from)?;

    let final_path = dir.join(id.meta_filename());
    let temp_path = dir.join(format!("{TEMP_PREFIX}{}", id.meta_filename()));
    fs::write(&temp_path, bytes).await?;
    fs::rename(&temp_path, &final_path).await?;
    Ok(())
}

async fn private_dir(path: &Path) -> Result<(), StoreError> {
    let mut builder = DirBuilder::new();
    builder.recursive(true);
    #[cfg(unix)]
    builder.mode(0o700);
    builder.create(path).await?;
    Ok(())
}

async fn remove_if_exists(path: &Path) -> Result<(), StoreError> {
    match fs::remove_file(path).await {
        Err(e) if e.kind() != ErrorKind::NotFound => Err(e.into()),
        _ => Ok(()),
    }
}

#[cfg(test)]
mod tests {
    use pretty_assertions::assert_eq;
    use tokio::io::{AsyncReadExt, AsyncWriteExt};

    use super::*;

    async fn store() -> (tempfile::TempDir, Storage) {
        let dir = tempfile::tempdir().unwrap();
        let storage = Storage::at(dir.path());
        storage.init().await.unwrap();
        (dir, storage)
    }

    async fn body(storage: &Storage, content: &[u8]) -> BodyId {
        let (mut writer, id) = storage.new_body().await.unwrap();
        writer.write_all(content).await.unwrap();
        assert_eq!(writer.commit().await.unwrap(), id);
        id
    }

    #[tokio::test]
    async fn committed_body_is_readable() {
        let (_dir, storage) = store().await;
        let id = body(&storage, b"Subject: hello\r\n\r\nworld\r\n").await;

        let mut content = String::new();
        storage
            .open_body(id)
            .await
            .unwrap()
            .read_to_string(&mut content)
            .await
            .unwrap();
        assert_eq!(content, "Subject: hello\r\n\r\nworld\r\n");
        assert_eq!(
            storage.metadata(id).await.unwrap(),
            BodyMetadata {
                ref_count: 0,
                size: 25
            }
        );
    }

    #[tokio::test]
    async fn uncommitted_body_is_invisible() {
        let (dir, storage) = store().await;
        let (mut writer, id) = storage.new_body().await.unwrap();
        writer.write_all(b"partial").await.unwrap();

        assert!(storage.open_body(id).await.unwrap_err().is_not_found());
        drop(writer);

        let leftovers = std::fs::read_dir(dir.path().join(BODIES)).unwrap().count();
        assert_eq!(leftovers, 0);
    }

    #[tokio::test]
    async fn reference_counting() {
        let (_dir, storage) = store().await;
        let id = body(&storage, b"shared").await;

        assert_eq!(storage.add(id).await.unwrap(), 1);
        assert_eq!(storage.add(id).await.unwrap(), 2);
        assert_eq!(storage.release(id).await.unwrap(), 1);
        assert!(storage.open_body(id).await.is_ok());

        assert_eq!(storage.release(id).await.unwrap(), 0);
        assert!(storage.open_body(id).await.unwrap_err().is_not_found());
        assert!(storage.release(id).await.unwrap_err().is_not_found());
        assert!(storage.add(id).await.unwrap_err().is_not_found());
    }

    #[tokio::test]
    async fn init_removes_debris() {
        let (dir, storage) = store().await;
        let live = body(&storage, b"keep").await;
        let orphan = BodyId::generate();
        let bodies = dir.path().join(BODIES);

        std::fs::write(bodies.join(".tmp_whatever.eml"), b"x").unwrap();
        std::fs::write(bodies.join(orphan.data_filename()), b"no metadata").unwrap();

        storage.init().await.unwrap();

        let mut names: Vec<_> = std::fs::read_dir(&bodies)
            .unwrap()
            .map(|e| e.unwrap().file_name().to_string_lossy().into_owned())
            .collect();
        names.sort();
        assert_eq!(names, vec![live.meta_filename(), live.data_filename()]);
    }

    #[tokio::test]
    async fn block_artifacts() {
        let (_dir, storage) = store().await;

        let mut writer = storage.create_writer("queue", 42).await.unwrap();
        writer.write_all(b"artifact bytes").await.unwrap();
        writer.flush().await.unwrap();
        drop(writer);

        assert_eq!(storage.size("queue", 42).await.unwrap(), 14);

        let mut content = Vec::new();
        storage
            .create_reader("queue", 42)
            .await
            .unwrap()
            .read_to_end(&mut content)
            .await
            .unwrap();
        assert_eq!(content, b"artifact bytes");

        assert!(storage.create_reader("queue", 7).await.unwrap_err().is_not_found());
        assert!(storage.size("queue", 7).await.unwrap_err().is_not_found());

        storage.remove("queue", 42).await.unwrap();
        assert!(storage.size("queue", 42).await.unwrap_err().is_not_found());
    }

    #[tokio::test]
    async fn block_names_are_validated() {
        let (_dir, storage) = store().await;
        for bad in ["", "..", "a/b", BODIES] {
            assert!(matches!(
                storage.create_writer(bad, 1).await,
                Err(StoreError::Validation(ValidationError::BlockName(_)))
            ));
        }
    }
}
