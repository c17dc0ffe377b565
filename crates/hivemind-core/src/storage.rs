//! Document storage
//!
//! The sync core never touches the filesystem directly. It goes through a
//! [`DocumentStore`], keyed by relative `/`-separated paths.
//!
//! - [`FsStore`]: documents as files under a vault directory
//! - [`MemoryStore`]: in-process map, for tests and demos
//! - [`ChangeWatcher`]: polls a store and feeds modified paths to the
//!   coordinator

use std::collections::HashMap;
use std::future::Future;
use std::path::{Component, Path, PathBuf};
use std::sync::Arc;
use std::time::{Duration, SystemTime, UNIX_EPOCH};

use parking_lot::Mutex;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tracing::{debug, trace, warn};

use crate::error::{SyncError, SyncResult};
use crate::types::Timestamp;

/// Buffered change notifications before the watcher waits
const CHANGE_FEED_CAPACITY: usize = 256;

/// Persistent home of the shared documents
pub trait DocumentStore: Send + Sync + 'static {
    /// Plaintext of `path`; `DocumentNotFound` if missing
    fn read(&self, path: &str) -> impl Future<Output = SyncResult<String>> + Send;

    /// Overwrite `path` and stamp it with `mtime`
    fn write(
        &self,
        path: &str,
        text: &str,
        mtime: Timestamp,
    ) -> impl Future<Output = SyncResult<()>> + Send;

    /// Create `path`, failing if it exists
    fn create(
        &self,
        path: &str,
        text: &str,
        mtime: Timestamp,
    ) -> impl Future<Output = SyncResult<()>> + Send;

    fn exists(&self, path: &str) -> impl Future<Output = SyncResult<bool>> + Send;

    /// Modification time in epoch milliseconds
    fn mtime(&self, path: &str) -> impl Future<Output = SyncResult<Timestamp>> + Send;

    /// Every document path, sorted
    fn list_all(&self) -> impl Future<Output = SyncResult<Vec<String>>> + Send;
}

/// Documents stored as files below a root directory
#[derive(Debug, Clone)]
pub struct FsStore {
    root: PathBuf,
}

impl FsStore {
    /// Open a store rooted at `root`, creating the directory if needed
    pub fn open(root: impl Into<PathBuf>) -> SyncResult<Self> {
        let root = root.into();
        std::fs::create_dir_all(&root)?;
        Ok(Self { root })
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    /// Map a document path to a file below the root.
    ///
    /// Empty paths, absolute paths and `..` components are rejected.
    fn resolve(&self, path: &str) -> SyncResult<PathBuf> {
        if path.trim().is_empty() {
            return Err(SyncError::InvalidPath(path.to_string()));
        }
        let relative = Path::new(path);
        for component in relative.components() {
            match component {
                Component::Normal(_) | Component::CurDir => {}
                _ => return Err(SyncError::InvalidPath(path.to_string())),
            }
        }
        Ok(self.root.join(relative))
    }
}

fn not_found(path: &str, e: std::io::Error) -> SyncError {
    if e.kind() == std::io::ErrorKind::NotFound {
        SyncError::DocumentNotFound(path.to_string())
    } else {
        SyncError::Io(e)
    }
}

fn to_system_time(mtime: Timestamp) -> SystemTime {
    if mtime >= 0 {
        UNIX_EPOCH + Duration::from_millis(mtime as u64)
    } else {
        UNIX_EPOCH
    }
}

fn to_millis(time: SystemTime) -> Timestamp {
    time.duration_since(UNIX_EPOCH)
        .map(|d| d.as_millis() as Timestamp)
        .unwrap_or(0)
}

async fn set_mtime(file: PathBuf, mtime: Timestamp) -> SyncResult<()> {
    tokio::task::spawn_blocking(move || {
        let handle = std::fs::File::options().write(true).open(&file)?;
        handle.set_modified(to_system_time(mtime))
    })
    .await
    .map_err(|e| SyncError::Storage(format!("mtime task failed: {}", e)))??;
    Ok(())
}

impl DocumentStore for FsStore {
    async fn read(&self, path: &str) -> SyncResult<String> {
        let file = self.resolve(path)?;
        tokio::fs::read_to_string(&file)
            .await
            .map_err(|e| not_found(path, e))
    }

    async fn write(&self, path: &str, text: &str, mtime: Timestamp) -> SyncResult<()> {
        let file = self.resolve(path)?;
        if let Some(parent) = file.parent() {
            tokio::fs::create_dir_all(parent).await?;
        }
        tokio::fs::write(&file, text).await?;
        set_mtime(file, mtime).await?;
        trace!(path, mtime, "Wrote document");
        Ok(())
    }

    async fn create(&self, path: &str, text: &str, mtime: Timestamp) -> SyncResult<()> {
        if self.exists(path).await? {
            return Err(SyncError::Storage(format!("{} already exists", path)));
        }
        self.write(path, text, mtime).await
    }

    async fn exists(&self, path: &str) -> SyncResult<bool> {
        let file = self.resolve(path)?;
        Ok(tokio::fs::try_exists(&file).await?)
    }

    async fn mtime(&self, path: &str) -> SyncResult<Timestamp> {
        let file = self.resolve(path)?;
        let metadata = tokio::fs::metadata(&file)
            .await
            .map_err(|e| not_found(path, e))?;
        Ok(to_millis(metadata.modified()?))
    }

    async fn list_all(&self) -> SyncResult<Vec<String>> {
        let mut paths = Vec::new();
        let mut pending = vec![self.root.clone()];

        while let Some(dir) = pending.pop() {
            let mut entries = tokio::fs::read_dir(&dir).await?;
            while let Some(entry) = entries.next_entry().await? {
                let name = entry.file_name();
                // dot entries hold editor state, not documents
                if name.to_string_lossy().starts_with('.') {
                    continue;
                }
                let file_type = entry.file_type().await?;
                let full = entry.path();
                if file_type.is_dir() {
                    pending.push(full);
                } else if file_type.is_file() {
                    if let Ok(relative) = full.strip_prefix(&self.root) {
                        let key = relative
                            .components()
                            .map(|c| c.as_os_str().to_string_lossy().into_owned())
                            .collect::<Vec<_>>()
                            .join("/");
                        paths.push(key);
                    }
                }
            }
        }

        paths.sort();
        Ok(paths)
    }
}

/// In-memory document store
#[derive(Debug, Default)]
pub struct MemoryStore {
    documents: Mutex<HashMap<String, (String, Timestamp)>>,
}

impl MemoryStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// Body and mtime of `path`, if present
    pub fn get(&self, path: &str) -> Option<(String, Timestamp)> {
        self.documents.lock().get(path).cloned()
    }

    pub fn len(&self) -> usize {
        self.documents.lock().len()
    }

    pub fn is_empty(&self) -> bool {
        self.documents.lock().is_empty()
    }
}

impl DocumentStore for MemoryStore {
    async fn read(&self, path: &str) -> SyncResult<String> {
        self.documents
            .lock()
            .get(path)
            .map(|(text, _)| text.clone())
            .ok_or_else(|| SyncError::DocumentNotFound(path.to_string()))
    }

    async fn write(&self, path: &str, text: &str, mtime: Timestamp) -> SyncResult<()> {
        self.documents
            .lock()
            .insert(path.to_string(), (text.to_string(), mtime));
        Ok(())
    }

    async fn create(&self, path: &str, text: &str, mtime: Timestamp) -> SyncResult<()> {
        let mut documents = self.documents.lock();
        if documents.contains_key(path) {
            return Err(SyncError::Storage(format!("{} already exists", path)));
        }
        documents.insert(path.to_string(), (text.to_string(), mtime));
        Ok(())
    }

    async fn exists(&self, path: &str) -> SyncResult<bool> {
        Ok(self.documents.lock().contains_key(path))
    }

    async fn mtime(&self, path: &str) -> SyncResult<Timestamp> {
        self.documents
            .lock()
            .get(path)
            .map(|(_, mtime)| *mtime)
            .ok_or_else(|| SyncError::DocumentNotFound(path.to_string()))
    }

    async fn list_all(&self) -> SyncResult<Vec<String>> {
        let mut paths: Vec<String> = self.documents.lock().keys().cloned().collect();
        paths.sort();
        Ok(paths)
    }
}

/// Detects modified documents by polling their mtimes
pub struct ChangeWatcher<S> {
    store: Arc<S>,
    interval: Duration,
    seen: HashMap<String, Timestamp>,
}

impl<S: DocumentStore> ChangeWatcher<S> {
    pub fn new(store: Arc<S>, interval: Duration) -> Self {
        Self {
            store,
            interval,
            seen: HashMap::new(),
        }
    }

    /// Paths created or modified since the previous scan.
    ///
    /// The first scan reports every document.
    pub async fn scan(&mut self) -> SyncResult<Vec<String>> {
        let paths = self.store.list_all().await?;
        let mut changed = Vec::new();
        let mut current = HashMap::with_capacity(paths.len());

        for path in paths {
            let mtime = match self.store.mtime(&path).await {
                Ok(mtime) => mtime,
                Err(e) => {
                    debug!(path = %path, error = %e, "Skipping unreadable document");
                    continue;
                }
            };
            if self.seen.get(&path) != Some(&mtime) {
                changed.push(path.clone());
            }
            current.insert(path, mtime);
        }

        self.seen = current;
        Ok(changed)
    }

    /// Poll in the background, sending changed paths on the returned feed.
    ///
    /// Documents present at start-up are taken as the baseline and not
    /// reported. The task stops when the receiver is dropped.
    pub fn spawn(mut self) -> (mpsc::Receiver<String>, JoinHandle<()>) {
        let (tx, rx) = mpsc::channel(CHANGE_FEED_CAPACITY);
        let handle = tokio::spawn(async move {
            if let Err(e) = self.scan().await {
                warn!(error = %e, "Initial document scan failed");
            }
            let mut ticker = tokio::time::interval(self.interval);
            ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
            ticker.tick().await;

            loop {
                ticker.tick().await;
                let changed = match self.scan().await {
                    Ok(changed) => changed,
                    Err(e) => {
                        warn!(error = %e, "Document scan failed");
                        continue;
                    }
                };
                for path in changed {
                    if tx.send(path).await.is_err() {
                        debug!("Change feed closed, stopping watcher");
                        return;
                    }
                }
            }
        });
        (rx, handle)
    }
}
