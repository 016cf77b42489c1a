//! Backing-store interface.

use std::{
    collections::HashMap,
    fmt, io,
    path::PathBuf,
    sync::{Arc, Mutex},
};

use async_trait::async_trait;
use mime::Mime;
use time::OffsetDateTime;
use tokio::{
    fs,
    io::{AsyncRead, AsyncReadExt},
};

/// A reader plus the metadata a store needs to persist one object.
pub struct UploadStream {
    /// Object bytes. The driver is the sole reader.
    pub reader: Box<dyn AsyncRead + Send + Unpin>,
    /// Base name of the object.
    pub name: String,
    /// Declared size in bytes.
    pub size: u64,
    /// Source modification time.
    pub modified: OffsetDateTime,
    /// Media type, usually derived from the name.
    pub content_type: Mime,
}

impl UploadStream {
    /// Wrap a reader with default metadata.
    #[must_use]
    pub fn new(
        reader: Box<dyn AsyncRead + Send + Unpin>,
        name: impl Into<String>,
        size: u64,
    ) -> Self {
        Self {
            reader,
            name: name.into(),
            size,
            modified: OffsetDateTime::now_utc(),
            content_type: mime::APPLICATION_OCTET_STREAM,
        }
    }
}

impl fmt::Debug for UploadStream {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("UploadStream")
            .field("name", &self.name)
            .field("size", &self.size)
            .field("modified", &self.modified)
            .field("content_type", &self.content_type)
            .finish_non_exhaustive()
    }
}

/// A pluggable backing store.
#[async_trait]
pub trait Driver: Send + Sync + 'static {
    /// Consume `stream` and persist it under `dir`, returning once the
    /// object is durable. Errors bubble up to the caller unchanged.
    async fn put(&self, dir: &str, stream: UploadStream) -> io::Result<()>;

    /// Does an object exist at `path`?
    async fn exists(&self, path: &str) -> io::Result<bool>;
}

/// Stores objects in a directory tree on the local filesystem.
#[derive(Debug, Clone)]
pub struct LocalDriver {
    root: PathBuf,
}

impl LocalDriver {
    /// Create a driver rooted at `root`. The directory is created
    /// lazily on the first put.
    #[must_use]
    pub fn new(root: impl Into<PathBuf>) -> Self {
        Self { root: root.into() }
    }

    fn resolve(&self, path: &str) -> PathBuf {
        self.root.join(path.trim_matches('/'))
    }
}

#[async_trait]
impl Driver for LocalDriver {
    async fn put(&self, dir: &str, mut stream: UploadStream) -> io::Result<()> {
        let dir = self.resolve(dir);
        fs::create_dir_all(&dir).await?;

        let path = dir.join(&stream.name);
        let mut file = fs::File::create(&path).await?;
        tokio::io::copy(&mut stream.reader, &mut file).await?;
        file.sync_all().await?;

        Ok(())
    }

    async fn exists(&self, path: &str) -> io::Result<bool> {
        match fs::metadata(self.resolve(path)).await {
            Ok(_) => Ok(true),
            Err(e) if e.kind() == io::ErrorKind::NotFound => Ok(false),
            Err(e) => Err(e),
        }
    }
}

/// Captures uploads in memory. Intended for tests and examples.
#[derive(Debug, Clone, Default)]
pub struct MemoryDriver {
    objects: Arc<Mutex<HashMap<String, Vec<u8>>>>,
}

impl MemoryDriver {
    /// Create an empty driver.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Bytes stored at `path`, if any.
    #[must_use]
    pub fn object(&self, path: &str) -> Option<Vec<u8>> {
        self.objects
            .lock()
            .unwrap()
            .get(path.trim_matches('/'))
            .cloned()
    }

    /// Number of stored objects.
    #[must_use]
    pub fn len(&self) -> usize {
        self.objects.lock().unwrap().len()
    }

    /// Is the store empty?
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Seed an object, e.g. to test overwrite handling.
    pub fn seed(&self, path: &str, bytes: impl Into<Vec<u8>>) {
        self.objects
            .lock()
            .unwrap()
            .insert(path.trim_matches('/').to_owned(), bytes.into());
    }
}

#[async_trait]
impl Driver for MemoryDriver {
    async fn put(&self, dir: &str, mut stream: UploadStream) -> io::Result<()> {
        let mut bytes = Vec::new();
        stream.reader.read_to_end(&mut bytes).await?;

        let key = if dir.trim_matches('/').is_empty() {
            stream.name.clone()
        } else {
            format!("{}/{}", dir.trim_matches('/'), stream.name)
        };

        self.objects.lock().unwrap().insert(key, bytes);

        Ok(())
    }

    async fn exists(&self, path: &str) -> io::Result<bool> {
        Ok(self
            .objects
            .lock()
            .unwrap()
            .contains_key(path.trim_matches('/')))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn local_driver_roundtrip() {
        let root = tempfile::tempdir().unwrap();
        let driver = LocalDriver::new(root.path());

        let stream = UploadStream::new(Box::new(&b"hello\n"[..]), "greeting.txt", 6);
        driver.put("inbox", stream).await.unwrap();

        assert!(driver.exists("inbox/greeting.txt").await.unwrap());
        assert!(!driver.exists("inbox/absent.txt").await.unwrap());

        let stored = std::fs::read(root.path().join("inbox/greeting.txt")).unwrap();
        assert_eq!(stored, b"hello\n");
    }

    #[tokio::test]
    async fn memory_driver_roundtrip() {
        let driver = MemoryDriver::new();

        let stream = UploadStream::new(Box::new(&b"abc"[..]), "a.bin", 3);
        driver.put("/x/", stream).await.unwrap();

        assert!(driver.exists("x/a.bin").await.unwrap());
        assert_eq!(driver.object("x/a.bin").unwrap(), b"abc");
    }
}
