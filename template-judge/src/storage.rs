//! Local file storage with whole-file advisory locks
//!
//! Small metadata files (schemas, overrides, run handles) go through this
//! layer. Locks are held only for the duration of one read or write.

use std::fs::{File, OpenOptions};
use std::io::{ErrorKind, Read, Write};
use std::path::{Path, PathBuf};

use async_trait::async_trait;
use fs2::FileExt;
use tracing::debug;

use crate::error::{EngineError, Result};

/// File access used by the engine
#[async_trait]
pub trait Storage: Send + Sync {
    /// Read a whole file, `None` if it does not exist
    async fn read(&self, path: &Path) -> Result<Option<Vec<u8>>>;

    /// Atomically replace a file's contents
    async fn write(&self, path: &Path, data: &[u8]) -> Result<()>;

    /// List the entry names of a directory
    async fn list_dir(&self, path: &Path) -> Result<Vec<String>>;

    /// Read a file as UTF-8 text
    async fn read_string(&self, path: &Path) -> Result<Option<String>> {
        match self.read(path).await? {
            Some(bytes) => String::from_utf8(bytes)
                .map(Some)
                .map_err(|_| EngineError::Storage(format!("{} is not valid UTF-8", path.display()))),
            None => Ok(None),
        }
    }
}

/// Storage on the local filesystem
#[derive(Debug, Clone, Default)]
pub struct LocalStorage;

impl LocalStorage {
    pub fn new() -> Self {
        Self
    }
}

fn join_err(err: tokio::task::JoinError) -> EngineError {
    EngineError::Storage(format!("join storage task: {err}"))
}

/// Suffix of the sidecar file that carries a target's advisory lock
pub const LOCK_SUFFIX: &str = ".storage-lock";

/// `<dir>/<name>` -> `<dir>/<name>.storage-lock`.
///
/// The target itself is replaced by rename on every write, so the lock lives
/// on a sidecar whose inode never changes.
fn lock_path(path: &Path) -> PathBuf {
    let mut name = path.file_name().map(|n| n.to_os_string()).unwrap_or_default();
    name.push(LOCK_SUFFIX);
    path.with_file_name(name)
}

/// Held advisory lock, released on drop
struct LockGuard {
    file: File,
}

impl Drop for LockGuard {
    fn drop(&mut self) {
        let _ = self.file.unlock();
    }
}

fn lock_shared(path: &Path) -> Result<Option<LockGuard>> {
    // No sidecar means nothing was ever written through this layer
    let file = match File::open(lock_path(path)) {
        Ok(file) => file,
        Err(err) if err.kind() == ErrorKind::NotFound => return Ok(None),
        Err(err) => return Err(err.into()),
    };
    file.lock_shared()?;
    Ok(Some(LockGuard { file }))
}

fn lock_exclusive(path: &Path) -> Result<LockGuard> {
    let file = OpenOptions::new()
        .create(true)
        .read(true)
        .write(true)
        .truncate(false)
        .open(lock_path(path))?;
    file.lock_exclusive()?;
    Ok(LockGuard { file })
}

fn read_locked(path: &Path) -> Result<Option<Vec<u8>>> {
    let _guard = lock_shared(path)?;
    let mut file = match File::open(path) {
        Ok(file) => file,
        Err(err) if err.kind() == ErrorKind::NotFound => return Ok(None),
        Err(err) => return Err(err.into()),
    };
    let mut data = Vec::new();
    file.read_to_end(&mut data)?;
    Ok(Some(data))
}

fn write_locked(path: &Path, data: &[u8]) -> Result<()> {
    let dir = path.parent().unwrap_or_else(|| Path::new("."));
    std::fs::create_dir_all(dir)?;

    let _guard = lock_exclusive(path)?;
    let mut tmp = tempfile::NamedTempFile::new_in(dir)?;
    tmp.write_all(data)?;
    tmp.as_file().sync_all()?;
    tmp.persist(path).map_err(|e| EngineError::Io(e.error))?;
    Ok(())
}

#[async_trait]
impl Storage for LocalStorage {
    async fn read(&self, path: &Path) -> Result<Option<Vec<u8>>> {
        let path = path.to_path_buf();
        tokio::task::spawn_blocking(move || read_locked(&path))
            .await
            .map_err(join_err)?
    }

    async fn write(&self, path: &Path, data: &[u8]) -> Result<()> {
        debug!("Writing {} bytes to {:?}", data.len(), path);
        let path: PathBuf = path.to_path_buf();
        let data = data.to_vec();
        tokio::task::spawn_blocking(move || write_locked(&path, &data))
            .await
            .map_err(join_err)?
    }

    async fn list_dir(&self, path: &Path) -> Result<Vec<String>> {
        let mut entries = tokio::fs::read_dir(path).await?;
        let mut names = Vec::new();
        while let Some(entry) = entries.next_entry().await? {
            let name = entry.file_name().to_string_lossy().into_owned();
            if !name.ends_with(LOCK_SUFFIX) {
                names.push(name);
            }
        }
        names.sort();
        Ok(names)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_read_missing_is_none() {
        let dir = tempfile::tempdir().unwrap();
        let storage = LocalStorage::new();
        let got = storage.read(&dir.path().join("absent")).await.unwrap();
        assert!(got.is_none());
    }

    #[tokio::test]
    async fn test_write_then_read_and_list() {
        let dir = tempfile::tempdir().unwrap();
        let storage = LocalStorage::new();
        let path = dir.path().join("sub").join("a.json");

        storage.write(&path, b"{\"x\":1}").await.unwrap();
        storage.write(&path, b"{}").await.unwrap();

        let text = storage.read_string(&path).await.unwrap().unwrap();
        assert_eq!(text, "{}");

        let names = storage.list_dir(&dir.path().join("sub")).await.unwrap();
        assert_eq!(names, vec!["a.json".to_string()]);
    }

    #[tokio::test]
    async fn test_writer_waits_on_sidecar_lock() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("session.json");

        let holder = OpenOptions::new()
            .create(true)
            .read(true)
            .write(true)
            .truncate(false)
            .open(lock_path(&path))
            .unwrap();
        holder.lock_exclusive().unwrap();

        let target = path.clone();
        let writer = tokio::spawn(async move { LocalStorage::new().write(&target, b"{\"a\":1}").await });
        tokio::time::sleep(std::time::Duration::from_millis(150)).await;
        assert!(!writer.is_finished());
        assert!(!path.exists());

        holder.unlock().unwrap();
        writer.await.unwrap().unwrap();
        let text = LocalStorage::new().read_string(&path).await.unwrap().unwrap();
        assert_eq!(text, "{\"a\":1}");
    }

    #[tokio::test]
    async fn test_lock_survives_replacement() {
        let dir = tempfile::tempdir().unwrap();
        let storage = LocalStorage::new();
        let path = dir.path().join("a.json");

        storage.write(&path, b"1").await.unwrap();
        let before = lock_inode(&path);
        storage.write(&path, b"2").await.unwrap();
        assert_eq!(before, lock_inode(&path));
        assert_eq!(storage.read(&path).await.unwrap().unwrap(), b"2");
    }

    fn lock_inode(path: &Path) -> u64 {
        use std::os::unix::fs::MetadataExt;
        std::fs::metadata(lock_path(path)).unwrap().ino()
    }

    #[tokio::test]
    async fn test_list_missing_dir_errors() {
        let dir = tempfile::tempdir().unwrap();
        let storage = LocalStorage::new();
        assert!(storage.list_dir(&dir.path().join("nope")).await.is_err());
    }
}
