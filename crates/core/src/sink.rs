use std::collections::{BTreeMap, HashMap};
use std::future::Future;
use std::path::{Path, PathBuf};
use std::pin::Pin;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};

use tokio::io::AsyncWriteExt;
use tokio::sync::Mutex;

use crate::{Error, Result};

/// Destination for reassembled submissions. The coordinator serializes calls
/// per (ts, field); implementations only need to guard their own handle
/// mapping against concurrent calls for distinct fields.
pub trait FileSink: Send + Sync {
    /// Establishes the per-ts container and opens the field's file.
    /// Idempotent per (ts, field).
    fn create<'a>(
        &'a self,
        ts: &'a str,
        field: &'a str,
        filename: &'a str,
    ) -> Pin<Box<dyn Future<Output = Result<PathBuf>> + Send + 'a>>;

    fn write<'a>(
        &'a self,
        ts: &'a str,
        field: &'a str,
        bytes: &'a [u8],
    ) -> Pin<Box<dyn Future<Output = Result<()>> + Send + 'a>>;

    fn close<'a>(
        &'a self,
        ts: &'a str,
        field: &'a str,
    ) -> Pin<Box<dyn Future<Output = Result<()>> + Send + 'a>>;

    /// Persists the simplified manifest as `<ts>.json` under the ts container.
    fn save_manifest<'a>(
        &'a self,
        ts: &'a str,
        manifest: &'a BTreeMap<String, String>,
    ) -> Pin<Box<dyn Future<Output = Result<()>> + Send + 'a>>;
}

type HandleKey = (String, String);

/// Directory-backed sink. Every ts gets `<root>/<ts>/` holding one regular
/// file per file field plus the `<ts>.json` manifest.
pub struct FsSink {
    root: PathBuf,
    handles: Mutex<HashMap<HandleKey, Arc<Mutex<tokio::fs::File>>>>,
}

impl FsSink {
    pub fn new(root: impl Into<PathBuf>) -> Result<Self> {
        let root = root.into();
        std::fs::create_dir_all(&root)?;
        Ok(Self {
            root,
            handles: Mutex::new(HashMap::new()),
        })
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    async fn ensure_ts_dir(&self, ts: &str) -> Result<PathBuf> {
        let dir = self.root.join(ts);
        tokio::fs::create_dir_all(&dir).await?;
        #[cfg(unix)]
        {
            use std::os::unix::fs::PermissionsExt;
            tokio::fs::set_permissions(&dir, std::fs::Permissions::from_mode(0o777)).await?;
        }
        Ok(dir)
    }
}

impl FileSink for FsSink {
    fn create<'a>(
        &'a self,
        ts: &'a str,
        field: &'a str,
        filename: &'a str,
    ) -> Pin<Box<dyn Future<Output = Result<PathBuf>> + Send + 'a>> {
        Box::pin(async move {
            let dir = self.ensure_ts_dir(ts).await?;
            let path = dir.join(filename);

            let mut handles = self.handles.lock().await;
            let key = (ts.to_string(), field.to_string());
            if handles.contains_key(&key) {
                return Ok(path);
            }
            let file = tokio::fs::File::create(&path).await?;
            handles.insert(key, Arc::new(Mutex::new(file)));
            Ok(path)
        })
    }

    fn write<'a>(
        &'a self,
        ts: &'a str,
        field: &'a str,
        bytes: &'a [u8],
    ) -> Pin<Box<dyn Future<Output = Result<()>> + Send + 'a>> {
        Box::pin(async move {
            // Clone the handle out so appends to distinct fields run in
            // parallel; the per-handle lock serializes appends to one file.
            let handle = {
                let handles = self.handles.lock().await;
                handles
                    .get(&(ts.to_string(), field.to_string()))
                    .cloned()
            };
            let Some(handle) = handle else {
                return Err(Error::MissingHandle {
                    ts: ts.to_string(),
                    field: field.to_string(),
                });
            };
            let mut file = handle.lock().await;
            file.write_all(bytes).await?;
            Ok(())
        })
    }

    fn close<'a>(
        &'a self,
        ts: &'a str,
        field: &'a str,
    ) -> Pin<Box<dyn Future<Output = Result<()>> + Send + 'a>> {
        Box::pin(async move {
            let handle = {
                let mut handles = self.handles.lock().await;
                handles.remove(&(ts.to_string(), field.to_string()))
            };
            if let Some(handle) = handle {
                let mut file = handle.lock().await;
                file.flush().await?;
            }
            Ok(())
        })
    }

    fn save_manifest<'a>(
        &'a self,
        ts: &'a str,
        manifest: &'a BTreeMap<String, String>,
    ) -> Pin<Box<dyn Future<Output = Result<()>> + Send + 'a>> {
        Box::pin(async move {
            let dir = self.ensure_ts_dir(ts).await?;
            let path = dir.join(format!("{ts}.json"));
            let data = serde_json::to_vec_pretty(manifest)?;

            // Write-then-rename so a concurrent reader never sees a torn file.
            let tmp = dir.join(format!("{ts}.json.tmp.{}", std::process::id()));
            tokio::fs::write(&tmp, &data).await?;
            tokio::fs::rename(&tmp, &path).await?;
            Ok(())
        })
    }
}

/// In-process sink for tests: records created files, the exact sequence of
/// appended segments per field, close events and saved manifests.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct MemoryFile {
    pub filename: String,
    pub segments: Vec<Vec<u8>>,
    pub closed: bool,
}

impl MemoryFile {
    pub fn bytes(&self) -> Vec<u8> {
        self.segments.concat()
    }
}

#[derive(Debug, Default)]
pub struct MemorySink {
    files: Mutex<HashMap<HandleKey, MemoryFile>>,
    manifests: Mutex<HashMap<String, BTreeMap<String, String>>>,
    pub writes: AtomicUsize,
    fail_writes: AtomicBool,
}

impl MemorySink {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn fail_writes(&self, fail: bool) {
        self.fail_writes.store(fail, Ordering::SeqCst);
    }

    pub async fn file(&self, ts: &str, field: &str) -> Option<MemoryFile> {
        self.files
            .lock()
            .await
            .get(&(ts.to_string(), field.to_string()))
            .cloned()
    }

    pub async fn file_count(&self) -> usize {
        self.files.lock().await.len()
    }

    pub async fn manifest(&self, ts: &str) -> Option<BTreeMap<String, String>> {
        self.manifests.lock().await.get(ts).cloned()
    }

    pub async fn manifest_count(&self) -> usize {
        self.manifests.lock().await.len()
    }
}

impl FileSink for MemorySink {
    fn create<'a>(
        &'a self,
        ts: &'a str,
        field: &'a str,
        filename: &'a str,
    ) -> Pin<Box<dyn Future<Output = Result<PathBuf>> + Send + 'a>> {
        Box::pin(async move {
            let mut files = self.files.lock().await;
            files
                .entry((ts.to_string(), field.to_string()))
                .or_insert_with(|| MemoryFile {
                    filename: filename.to_string(),
                    segments: Vec::new(),
                    closed: false,
                });
            Ok(PathBuf::from(format!("{ts}/{filename}")))
        })
    }

    fn write<'a>(
        &'a self,
        ts: &'a str,
        field: &'a str,
        bytes: &'a [u8],
    ) -> Pin<Box<dyn Future<Output = Result<()>> + Send + 'a>> {
        Box::pin(async move {
            if self.fail_writes.load(Ordering::SeqCst) {
                return Err(Error::Io(std::io::Error::other("injected write failure")));
            }
            let mut files = self.files.lock().await;
            let Some(file) = files.get_mut(&(ts.to_string(), field.to_string())) else {
                return Err(Error::MissingHandle {
                    ts: ts.to_string(),
                    field: field.to_string(),
                });
            };
            if file.closed {
                return Err(Error::MissingHandle {
                    ts: ts.to_string(),
                    field: field.to_string(),
                });
            }
            file.segments.push(bytes.to_vec());
            self.writes.fetch_add(1, Ordering::Relaxed);
            Ok(())
        })
    }

    fn close<'a>(
        &'a self,
        ts: &'a str,
        field: &'a str,
    ) -> Pin<Box<dyn Future<Output = Result<()>> + Send + 'a>> {
        Box::pin(async move {
            let mut files = self.files.lock().await;
            if let Some(file) = files.get_mut(&(ts.to_string(), field.to_string())) {
                file.closed = true;
            }
            Ok(())
        })
    }

    fn save_manifest<'a>(
        &'a self,
        ts: &'a str,
        manifest: &'a BTreeMap<String, String>,
    ) -> Pin<Box<dyn Future<Output = Result<()>> + Send + 'a>> {
        Box::pin(async move {
            self.manifests
                .lock()
                .await
                .insert(ts.to_string(), manifest.clone());
            Ok(())
        })
    }
}
