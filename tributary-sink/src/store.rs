use std::fmt::Debug;
use std::path::PathBuf;
use std::sync::Arc;

use async_trait::async_trait;
use tokio::fs::{File, OpenOptions};
use tokio::io::{AsyncWriteExt, BufWriter};
use tracing::{debug, info, warn};
use tributary_storage::{BackendConfig, StorageProvider, StorageProviderRef};

use crate::error::{SinkError, SinkResult};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CommitOutcome {
    Committed,
    /// The final file already existed and the in-progress one was gone.
    AlreadyCommitted,
}

/// Handle to one open in-progress part file.
#[async_trait]
pub trait PartWriter: Send {
    async fn write(&mut self, bytes: &[u8]) -> SinkResult<()>;

    /// Flushes and closes the file durably, returning its final size.
    async fn close(self: Box<Self>) -> SinkResult<u64>;

    /// Closes without keeping anything.
    async fn abort(self: Box<Self>) -> SinkResult<()>;
}

/// Where part files live. Paths are `/`-separated and relative to the table's base path.
#[async_trait]
pub trait PartStore: Send + Sync + Debug {
    /// Makes sure a bucket directory can be written to.
    async fn ensure_dir(&self, dir: &str) -> SinkResult<()>;

    /// Opens `path` for writing, replacing anything already there.
    async fn open(&self, path: &str) -> SinkResult<Box<dyn PartWriter>>;

    /// Publishes `in_progress` as `final_path`. Safe to call again after a crash.
    async fn commit(&self, in_progress: &str, final_path: &str) -> SinkResult<CommitOutcome>;

    async fn discard(&self, path: &str) -> SinkResult<()>;

    async fn exists(&self, path: &str) -> SinkResult<bool>;

    /// Names of the files directly inside `dir`; empty if it does not exist.
    async fn list_dir(&self, dir: &str) -> SinkResult<Vec<String>>;

    /// Absolute location of `path`, as reported in file metadata.
    fn qualified(&self, path: &str) -> String;
}

pub fn join_path(dir: &str, name: &str) -> String {
    if dir.is_empty() {
        name.to_string()
    } else {
        format!("{}/{}", dir, name)
    }
}

/// Picks the store for a table's base path. Local paths are written in place; anything else goes
/// through an object store.
pub async fn part_store_for(path: &str) -> SinkResult<Arc<dyn PartStore>> {
    if !path.contains(':') && !path.starts_with('/') {
        return Ok(Arc::new(LocalPartStore::new(path)));
    }
    match BackendConfig::parse_url(path)? {
        BackendConfig::Local(local) => Ok(Arc::new(LocalPartStore::new(local.path))),
        _ => {
            let storage = StorageProvider::for_url(path).await?;
            Ok(Arc::new(ObjectPartStore::new(Arc::new(storage))))
        }
    }
}

fn missing_in_progress(in_progress: &str) -> SinkError {
    SinkError::io(
        in_progress,
        std::io::Error::new(
            std::io::ErrorKind::NotFound,
            "in-progress file is missing and was never committed",
        ),
    )
}

/// Part files on a local filesystem. In-progress files are appended to on disk and committed by
/// rename.
#[derive(Debug, Clone)]
pub struct LocalPartStore {
    base: PathBuf,
}

impl LocalPartStore {
    pub fn new(base: impl Into<PathBuf>) -> Self {
        Self { base: base.into() }
    }

    fn full_path(&self, path: &str) -> PathBuf {
        if path.is_empty() {
            self.base.clone()
        } else {
            self.base.join(path)
        }
    }

    async fn path_exists(&self, path: &PathBuf) -> SinkResult<bool> {
        tokio::fs::try_exists(path)
            .await
            .map_err(|e| SinkError::io(path.to_string_lossy(), e))
    }
}

struct LocalPartWriter {
    path: PathBuf,
    file: BufWriter<File>,
}

#[async_trait]
impl PartWriter for LocalPartWriter {
    async fn write(&mut self, bytes: &[u8]) -> SinkResult<()> {
        self.file
            .write_all(bytes)
            .await
            .map_err(|e| SinkError::io(self.path.to_string_lossy(), e))
    }

    async fn close(self: Box<Self>) -> SinkResult<u64> {
        let Self { path, mut file } = *self;
        let path = path.to_string_lossy().to_string();
        file.flush().await.map_err(|e| SinkError::io(&path, e))?;
        let file = file.into_inner();
        file.sync_all().await.map_err(|e| SinkError::io(&path, e))?;
        let size = file
            .metadata()
            .await
            .map_err(|e| SinkError::io(&path, e))?
            .len();
        Ok(size)
    }

    async fn abort(self: Box<Self>) -> SinkResult<()> {
        let Self { path, file } = *self;
        drop(file);
        match tokio::fs::remove_file(&path).await {
            Ok(()) => Ok(()),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(()),
            Err(e) => Err(SinkError::io(path.to_string_lossy(), e)),
        }
    }
}

#[async_trait]
impl PartStore for LocalPartStore {
    async fn ensure_dir(&self, dir: &str) -> SinkResult<()> {
        let path = self.full_path(dir);
        tokio::fs::create_dir_all(&path)
            .await
            .map_err(|e| SinkError::io(path.to_string_lossy(), e))
    }

    async fn open(&self, path: &str) -> SinkResult<Box<dyn PartWriter>> {
        let full = self.full_path(path);
        let file = OpenOptions::new()
            .create(true)
            .write(true)
            .truncate(true)
            .open(&full)
            .await
            .map_err(|e| SinkError::io(full.to_string_lossy(), e))?;
        debug!("opened part file {}", full.to_string_lossy());
        Ok(Box::new(LocalPartWriter {
            path: full,
            file: BufWriter::new(file),
        }))
    }

    async fn commit(&self, in_progress: &str, final_path: &str) -> SinkResult<CommitOutcome> {
        let (tmp_file, destination) = (self.full_path(in_progress), self.full_path(final_path));
        if !self.path_exists(&tmp_file).await? {
            if self.path_exists(&destination).await? {
                warn!(
                    "{} was already committed, skipping",
                    destination.to_string_lossy()
                );
                return Ok(CommitOutcome::AlreadyCommitted);
            }
            return Err(missing_in_progress(&tmp_file.to_string_lossy()));
        }
        info!(
            "committing file {} to {}",
            tmp_file.to_string_lossy(),
            destination.to_string_lossy()
        );
        tokio::fs::rename(&tmp_file, &destination)
            .await
            .map_err(|e| SinkError::io(destination.to_string_lossy(), e))?;
        Ok(CommitOutcome::Committed)
    }

    async fn discard(&self, path: &str) -> SinkResult<()> {
        let full = self.full_path(path);
        match tokio::fs::remove_file(&full).await {
            Ok(()) => Ok(()),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(()),
            Err(e) => Err(SinkError::io(full.to_string_lossy(), e)),
        }
    }

    async fn exists(&self, path: &str) -> SinkResult<bool> {
        self.path_exists(&self.full_path(path)).await
    }

    async fn list_dir(&self, dir: &str) -> SinkResult<Vec<String>> {
        let full = self.full_path(dir);
        let mut entries = match tokio::fs::read_dir(&full).await {
            Ok(entries) => entries,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(vec![]),
            Err(e) => return Err(SinkError::io(full.to_string_lossy(), e)),
        };

        let mut names = vec![];
        while let Some(entry) = entries
            .next_entry()
            .await
            .map_err(|e| SinkError::io(full.to_string_lossy(), e))?
        {
            let is_file = entry
                .file_type()
                .await
                .map_err(|e| SinkError::io(full.to_string_lossy(), e))?
                .is_file();
            if is_file {
                names.push(entry.file_name().to_string_lossy().to_string());
            }
        }
        names.sort();
        Ok(names)
    }

    fn qualified(&self, path: &str) -> String {
        self.full_path(path).to_string_lossy().to_string()
    }
}

/// Part files in an object store. In-progress bytes are buffered in memory and uploaded when the
/// file is closed; commit is a server-side rename.
#[derive(Debug, Clone)]
pub struct ObjectPartStore {
    storage: StorageProviderRef,
}

impl ObjectPartStore {
    pub fn new(storage: StorageProviderRef) -> Self {
        Self { storage }
    }
}

struct ObjectPartWriter {
    storage: StorageProviderRef,
    path: String,
    buffer: Vec<u8>,
}

#[async_trait]
impl PartWriter for ObjectPartWriter {
    async fn write(&mut self, bytes: &[u8]) -> SinkResult<()> {
        self.buffer.extend_from_slice(bytes);
        Ok(())
    }

    async fn close(self: Box<Self>) -> SinkResult<u64> {
        let Self {
            storage,
            path,
            buffer,
        } = *self;
        let size = buffer.len() as u64;
        storage.put(path.as_str(), buffer).await?;
        Ok(size)
    }

    async fn abort(self: Box<Self>) -> SinkResult<()> {
        // nothing is uploaded before close, but a stale object from a previous attempt may exist
        self.storage.delete_if_present(self.path.as_str()).await?;
        Ok(())
    }
}

#[async_trait]
impl PartStore for ObjectPartStore {
    async fn ensure_dir(&self, _dir: &str) -> SinkResult<()> {
        // object stores have no directories
        Ok(())
    }

    async fn open(&self, path: &str) -> SinkResult<Box<dyn PartWriter>> {
        Ok(Box::new(ObjectPartWriter {
            storage: self.storage.clone(),
            path: path.to_string(),
            buffer: Vec::new(),
        }))
    }

    async fn commit(&self, in_progress: &str, final_path: &str) -> SinkResult<CommitOutcome> {
        if !self.storage.exists(in_progress).await? {
            if self.storage.exists(final_path).await? {
                warn!("{} was already committed, skipping", final_path);
                return Ok(CommitOutcome::AlreadyCommitted);
            }
            return Err(missing_in_progress(
                &self.storage.canonical_url_for(in_progress),
            ));
        }
        info!(
            "committing object {} to {}",
            self.storage.canonical_url_for(in_progress),
            self.storage.canonical_url_for(final_path)
        );
        self.storage.rename(in_progress, final_path).await?;
        Ok(CommitOutcome::Committed)
    }

    async fn discard(&self, path: &str) -> SinkResult<()> {
        self.storage.delete_if_present(path).await?;
        Ok(())
    }

    async fn exists(&self, path: &str) -> SinkResult<bool> {
        Ok(self.storage.exists(path).await?)
    }

    async fn list_dir(&self, dir: &str) -> SinkResult<Vec<String>> {
        let depth = dir.split('/').filter(|part| !part.is_empty()).count() + 1;
        let mut names: Vec<String> = self
            .storage
            .list(dir)
            .await?
            .into_iter()
            .filter(|path| path.parts().count() == depth)
            .filter_map(|path| path.filename().map(|name| name.to_string()))
            .collect();
        names.sort();
        Ok(names)
    }

    fn qualified(&self, path: &str) -> String {
        self.storage.canonical_url_for(path)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    async fn exercise_store(store: &dyn PartStore) {
        store.ensure_dir("p=1").await.unwrap();

        let mut writer = store.open("p=1/.part-0.inprogress").await.unwrap();
        writer.write(b"hello ").await.unwrap();
        writer.write(b"world\n").await.unwrap();
        assert_eq!(writer.close().await.unwrap(), 12);

        assert!(!store.exists("p=1/part-0").await.unwrap());
        assert_eq!(
            store
                .commit("p=1/.part-0.inprogress", "p=1/part-0")
                .await
                .unwrap(),
            CommitOutcome::Committed
        );
        assert!(store.exists("p=1/part-0").await.unwrap());
        assert!(!store.exists("p=1/.part-0.inprogress").await.unwrap());

        // a second commit finds the file already published
        assert_eq!(
            store
                .commit("p=1/.part-0.inprogress", "p=1/part-0")
                .await
                .unwrap(),
            CommitOutcome::AlreadyCommitted
        );

        // neither side present is data loss and must surface
        assert!(store
            .commit("p=1/.part-9.inprogress", "p=1/part-9")
            .await
            .is_err());

        let writer = store.open("p=1/.part-1.inprogress").await.unwrap();
        writer.abort().await.unwrap();
        assert!(!store.exists("p=1/.part-1.inprogress").await.unwrap());
        store.discard("p=1/.part-1.inprogress").await.unwrap();

        store.ensure_dir("p=1/q=2").await.unwrap();
        let mut writer = store.open("p=1/q=2/part-2").await.unwrap();
        writer.write(b"nested").await.unwrap();
        writer.close().await.unwrap();
        assert_eq!(store.list_dir("p=1").await.unwrap(), vec!["part-0"]);
        assert_eq!(store.list_dir("p=1/q=2").await.unwrap(), vec!["part-2"]);
        assert!(store.list_dir("p=9").await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn test_local_store() {
        let dir = tempfile::tempdir().unwrap();
        let store = LocalPartStore::new(dir.path());
        exercise_store(&store).await;

        let contents = std::fs::read_to_string(dir.path().join("p=1/part-0")).unwrap();
        assert_eq!(contents, "hello world\n");
        assert_eq!(
            store.qualified("p=1/part-0"),
            dir.path().join("p=1/part-0").to_string_lossy()
        );
    }

    #[tokio::test]
    async fn test_object_store() {
        let storage = Arc::new(StorageProvider::in_memory());
        let store = ObjectPartStore::new(storage.clone());
        exercise_store(&store).await;

        assert_eq!(
            storage.get("p=1/part-0").await.unwrap().as_ref(),
            b"hello world\n"
        );
        assert_eq!(store.qualified("p=1/part-0"), "memory:///p=1/part-0");
    }

    #[tokio::test]
    async fn test_object_store_keeps_escaped_names() {
        let storage = Arc::new(StorageProvider::in_memory());
        let store = ObjectPartStore::new(storage.clone());

        let mut writer = store.open("p=a%2Fb/.part-0.inprogress").await.unwrap();
        writer.write(b"x").await.unwrap();
        writer.close().await.unwrap();
        store
            .commit("p=a%2Fb/.part-0.inprogress", "p=a%2Fb/part-0")
            .await
            .unwrap();

        assert_eq!(store.list_dir("p=a%2Fb").await.unwrap(), vec!["part-0"]);
        let keys: Vec<String> = storage
            .list("")
            .await
            .unwrap()
            .into_iter()
            .map(|p| p.to_string())
            .collect();
        assert_eq!(keys, vec!["p=a%2Fb/part-0"]);
        assert_eq!(storage.get("p=a%2Fb/part-0").await.unwrap().as_ref(), b"x");
        assert_eq!(store.qualified("p=a%2Fb/part-0"), "memory:///p=a%2Fb/part-0");
    }

    #[tokio::test]
    async fn test_store_for_path() {
        let dir = tempfile::tempdir().unwrap();
        let base = dir.path().to_string_lossy().to_string();

        let local = part_store_for(&base).await.unwrap();
        assert_eq!(local.qualified("p=1/x"), format!("{}/p=1/x", base));

        let uri = part_store_for(&format!("file://{}", base)).await.unwrap();
        assert_eq!(uri.qualified("p=1/x"), format!("{}/p=1/x", base));

        let memory = part_store_for("memory://").await.unwrap();
        assert_eq!(memory.qualified("p=1/x"), "memory:///p=1/x");

        assert!(part_store_for("gopher://nowhere").await.is_err());
    }

    #[test]
    fn test_join_path() {
        assert_eq!(join_path("", "part-0"), "part-0");
        assert_eq!(join_path("a=1/b=2", "part-0"), "a=1/b=2/part-0");
    }
}
