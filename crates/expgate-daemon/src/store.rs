use std::collections::HashMap;
use std::fs;
use std::path::{Path, PathBuf};

use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use thiserror::Error;

#[derive(Debug, Error)]
pub enum StoreError {
    #[error("io failure: {0}")]
    Io(#[from] std::io::Error),
    #[error("encoding failure: {0}")]
    Encoding(#[from] serde_json::Error),
    #[error("invalid key: {0}")]
    InvalidKey(String),
}

/// Key-value collaborator holding token records. Values expire; expiry is
/// the store's concern, not the caller's.
pub trait RecordStore: Send + Sync {
    fn get(&self, key: &str, now_ms: u64) -> Result<Option<String>, StoreError>;
    fn put(&self, key: &str, value: &str, ttl_seconds: u64, now_ms: u64)
        -> Result<(), StoreError>;
}

#[derive(Debug, Clone)]
pub struct Blob {
    pub body: Vec<u8>,
    pub content_type: String,
}

/// Object/blob collaborator holding hosted experiment bundles and collected
/// telemetry files.
pub trait BlobStore: Send + Sync {
    fn get(&self, key: &str) -> Result<Option<Blob>, StoreError>;
    fn put(&self, key: &str, body: &[u8], content_type: &str) -> Result<(), StoreError>;
}

#[derive(Debug, Serialize, Deserialize)]
struct RecordEnvelope {
    expires_at_ms: u64,
    value: String,
}

/// File-backed record store under `<data-dir>/records/`. Keys are hex-encoded
/// into file names; TTLs are enforced lazily on read.
pub struct FsRecordStore {
    dir: PathBuf,
}

impl FsRecordStore {
    pub fn open(data_dir: &Path) -> Result<Self, StoreError> {
        let dir = data_dir.join("records");
        fs::create_dir_all(&dir)?;
        Ok(Self { dir })
    }

    fn path_for(&self, key: &str) -> PathBuf {
        self.dir.join(format!("{}.json", hex::encode(key)))
    }
}

impl RecordStore for FsRecordStore {
    fn get(&self, key: &str, now_ms: u64) -> Result<Option<String>, StoreError> {
        let path = self.path_for(key);
        let bytes = match fs::read(&path) {
            Ok(bytes) => bytes,
            Err(err) if err.kind() == std::io::ErrorKind::NotFound => return Ok(None),
            Err(err) => return Err(err.into()),
        };
        let envelope: RecordEnvelope = match serde_json::from_slice(&bytes) {
            Ok(envelope) => envelope,
            Err(_) => return Ok(None),
        };
        if now_ms > envelope.expires_at_ms {
            let _ = fs::remove_file(&path);
            return Ok(None);
        }
        Ok(Some(envelope.value))
    }

    fn put(
        &self,
        key: &str,
        value: &str,
        ttl_seconds: u64,
        now_ms: u64,
    ) -> Result<(), StoreError> {
        let envelope = RecordEnvelope {
            expires_at_ms: now_ms.saturating_add(ttl_seconds.saturating_mul(1000)),
            value: value.to_string(),
        };
        fs::write(self.path_for(key), serde_json::to_vec(&envelope)?)?;
        Ok(())
    }
}

/// File-backed blob store under `<data-dir>/blobs/`. Keys are slash-separated
/// relative paths; the content type is derived from the extension so bundles
/// can be dropped into the directory as plain files.
pub struct FsBlobStore {
    dir: PathBuf,
}

impl FsBlobStore {
    pub fn open(data_dir: &Path) -> Result<Self, StoreError> {
        let dir = data_dir.join("blobs");
        fs::create_dir_all(&dir)?;
        Ok(Self { dir })
    }

    fn path_for(&self, key: &str) -> Result<PathBuf, StoreError> {
        let mut path = self.dir.clone();
        for segment in key.split('/') {
            if segment.is_empty() || segment == "." || segment == ".." {
                return Err(StoreError::InvalidKey(key.to_string()));
            }
            path.push(segment);
        }
        Ok(path)
    }
}

impl BlobStore for FsBlobStore {
    fn get(&self, key: &str) -> Result<Option<Blob>, StoreError> {
        let path = match self.path_for(key) {
            Ok(path) => path,
            Err(_) => return Ok(None),
        };
        match fs::read(&path) {
            Ok(body) => Ok(Some(Blob {
                body,
                content_type: content_type_for(key).to_string(),
            })),
            Err(err) if err.kind() == std::io::ErrorKind::NotFound => Ok(None),
            Err(err) => Err(err.into()),
        }
    }

    fn put(&self, key: &str, body: &[u8], _content_type: &str) -> Result<(), StoreError> {
        let path = self.path_for(key)?;
        if let Some(parent) = path.parent() {
            fs::create_dir_all(parent)?;
        }
        fs::write(path, body)?;
        Ok(())
    }
}

pub fn content_type_for(key: &str) -> &'static str {
    let ext = key.rsplit('.').next().unwrap_or_default();
    match ext {
        "html" | "htm" => "text/html; charset=utf-8",
        "js" | "mjs" => "application/javascript; charset=utf-8",
        "css" => "text/css; charset=utf-8",
        "json" => "application/json",
        "png" => "image/png",
        "jpg" | "jpeg" => "image/jpeg",
        "gif" => "image/gif",
        "svg" => "image/svg+xml",
        "ico" => "image/x-icon",
        "woff" => "font/woff",
        "woff2" => "font/woff2",
        "wav" => "audio/wav",
        "mp3" => "audio/mpeg",
        "mp4" => "video/mp4",
        "csv" => "text/csv",
        "txt" => "text/plain; charset=utf-8",
        _ => "application/octet-stream",
    }
}

/// In-memory record store for tests.
#[derive(Default)]
pub struct MemoryRecordStore {
    entries: Mutex<HashMap<String, (u64, String)>>,
}

impl RecordStore for MemoryRecordStore {
    fn get(&self, key: &str, now_ms: u64) -> Result<Option<String>, StoreError> {
        let mut guard = self.entries.lock();
        if let Some((expires_at_ms, value)) = guard.get(key) {
            if now_ms > *expires_at_ms {
                guard.remove(key);
                return Ok(None);
            }
            return Ok(Some(value.clone()));
        }
        Ok(None)
    }

    fn put(
        &self,
        key: &str,
        value: &str,
        ttl_seconds: u64,
        now_ms: u64,
    ) -> Result<(), StoreError> {
        self.entries.lock().insert(
            key.to_string(),
            (
                now_ms.saturating_add(ttl_seconds.saturating_mul(1000)),
                value.to_string(),
            ),
        );
        Ok(())
    }
}

/// In-memory blob store for tests.
#[derive(Default)]
pub struct MemoryBlobStore {
    entries: Mutex<HashMap<String, Blob>>,
}

impl MemoryBlobStore {
    pub fn insert(&self, key: &str, body: &[u8], content_type: &str) {
        self.entries.lock().insert(
            key.to_string(),
            Blob {
                body: body.to_vec(),
                content_type: content_type.to_string(),
            },
        );
    }

    pub fn keys(&self) -> Vec<String> {
        self.entries.lock().keys().cloned().collect()
    }
}

impl BlobStore for MemoryBlobStore {
    fn get(&self, key: &str) -> Result<Option<Blob>, StoreError> {
        Ok(self.entries.lock().get(key).cloned())
    }

    fn put(&self, key: &str, body: &[u8], content_type: &str) -> Result<(), StoreError> {
        self.insert(key, body, content_type);
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    #[test]
    fn fs_record_store_round_trips_and_expires() {
        let dir = TempDir::new().unwrap();
        let store = FsRecordStore::open(dir.path()).unwrap();
        store.put("access:tok-1", "{\"a\":1}", 60, 1_000).unwrap();
        assert_eq!(
            store.get("access:tok-1", 2_000).unwrap().as_deref(),
            Some("{\"a\":1}")
        );
        // One millisecond past the TTL the record is gone.
        assert_eq!(store.get("access:tok-1", 61_001).unwrap(), None);
        assert_eq!(store.get("access:tok-1", 2_000).unwrap(), None);
    }

    #[test]
    fn fs_blob_store_rejects_traversal_keys() {
        let dir = TempDir::new().unwrap();
        let store = FsBlobStore::open(dir.path()).unwrap();
        assert!(store.put("../escape.txt", b"x", "text/plain").is_err());
        assert_eq!(store.get("../escape.txt").unwrap().map(|b| b.body), None);
    }

    #[test]
    fn fs_blob_store_serves_nested_keys_with_content_type() {
        let dir = TempDir::new().unwrap();
        let store = FsBlobStore::open(dir.path()).unwrap();
        store
            .put("study1/assets/app.js", b"console.log(1)", "ignored")
            .unwrap();
        let blob = store.get("study1/assets/app.js").unwrap().unwrap();
        assert_eq!(blob.body, b"console.log(1)");
        assert_eq!(blob.content_type, "application/javascript; charset=utf-8");
    }
}
