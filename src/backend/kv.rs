//! Asynchronous key-value backend trait and development implementations.

use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::sync::Mutex;

use async_trait::async_trait;
use bytes::Bytes;
use thiserror::Error;
use tokio::{fs, io::AsyncWriteExt};

#[derive(Debug, Error)]
#[error("kv backend: {0}")]
pub struct KvError(pub String);

impl From<std::io::Error> for KvError {
    fn from(e: std::io::Error) -> Self {
        KvError(e.to_string())
    }
}

/// Minimal object-store surface the chunk-store VFS needs. `get` of a
/// missing key is `Ok(None)`, never an error.
#[async_trait]
pub trait KvBackend: Send + Sync + 'static {
    async fn get(&self, key: &str) -> Result<Option<Bytes>, KvError>;
    async fn put(&self, key: &str, value: Bytes) -> Result<(), KvError>;
    async fn delete(&self, key: &str) -> Result<(), KvError>;
}

/// In-memory backend for tests and throwaway databases.
#[derive(Default)]
pub struct InMemoryKvBackend {
    map: Mutex<HashMap<String, Bytes>>,
}

impl InMemoryKvBackend {
    pub fn new() -> Self {
        Self::default()
    }

    /// Number of stored keys; test observability only.
    pub fn len(&self) -> usize {
        self.map.lock().expect("kv map poisoned").len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

#[async_trait]
impl KvBackend for InMemoryKvBackend {
    async fn get(&self, key: &str) -> Result<Option<Bytes>, KvError> {
        Ok(self.map.lock().expect("kv map poisoned").get(key).cloned())
    }

    async fn put(&self, key: &str, value: Bytes) -> Result<(), KvError> {
        self.map
            .lock()
            .expect("kv map poisoned")
            .insert(key.to_string(), value);
        Ok(())
    }

    async fn delete(&self, key: &str) -> Result<(), KvError> {
        self.map.lock().expect("kv map poisoned").remove(key);
        Ok(())
    }
}

/// Local-directory backend: one file per key under `root`. Keys contain
/// `:` and `/`, so the filename is the hex of the key bytes.
pub struct LocalFsKvBackend {
    root: PathBuf,
}

impl LocalFsKvBackend {
    pub fn new<P: AsRef<Path>>(root: P) -> Self {
        Self {
            root: root.as_ref().to_path_buf(),
        }
    }

    fn path_for(&self, key: &str) -> PathBuf {
        self.root.join(hex::encode(key.as_bytes()))
    }
}

#[async_trait]
impl KvBackend for LocalFsKvBackend {
    async fn get(&self, key: &str) -> Result<Option<Bytes>, KvError> {
        match fs::read(self.path_for(key)).await {
            Ok(buf) => Ok(Some(Bytes::from(buf))),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(None),
            Err(e) => Err(e.into()),
        }
    }

    async fn put(&self, key: &str, value: Bytes) -> Result<(), KvError> {
        fs::create_dir_all(&self.root).await?;
        let mut f = fs::File::create(self.path_for(key)).await?;
        f.write_all(&value).await?;
        f.flush().await?;
        Ok(())
    }

    async fn delete(&self, key: &str) -> Result<(), KvError> {
        match fs::remove_file(self.path_for(key)).await {
            Ok(()) => Ok(()),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(()),
            Err(e) => Err(e.into()),
        }
    }
}
