//! Content store seam (spec.md §6): an opaque, content-addressed blob store.
//!
//! The directory server stores one reference per directory block and never
//! interprets reference content. The real store is a separate networked
//! service; [`MemoryContentStore`] is the in-memory reference implementation
//! used by tests and the demonstration binary.

use std::collections::HashMap;
use std::sync::Mutex;
use std::time::Duration;

use async_trait::async_trait;
use thiserror::Error;

/// Opaque content reference, typically a cryptographic digest in the real
/// system. The directory core never inspects its bytes.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct Reference(pub Vec<u8>);

/// Metadata returned alongside a blob.
#[derive(Debug, Clone)]
pub struct RefData {
    pub reference: Reference,
    pub volatile: bool,
    pub duration: Option<Duration>,
}

#[derive(Debug, Error)]
pub enum StoreError {
    #[error("reference not found")]
    NotFound,
    #[error("store io error: {0}")]
    Io(String),
}

/// The content store's public interface (spec.md §6).
#[async_trait]
pub trait ContentStore: Send + Sync {
    async fn put(&self, bytes: Vec<u8>) -> Result<RefData, StoreError>;

    async fn get(&self, reference: &Reference) -> Result<(Vec<u8>, RefData), StoreError>;

    async fn delete(&self, reference: &Reference) -> Result<(), StoreError>;
}

/// In-memory, single-process content store keyed by a content hash.
///
/// This is reference/test scaffolding: the real content store is a
/// networked, replicated service (spec.md §1 Non-goals). The hash used here
/// (FNV-1a, widened to 16 bytes by doubling) is not cryptographic; it exists
/// only to give equal content equal references within one process.
#[derive(Debug, Default)]
pub struct MemoryContentStore {
    blobs: Mutex<HashMap<Vec<u8>, Vec<u8>>>,
}

impl MemoryContentStore {
    pub fn new() -> Self {
        Self { blobs: Mutex::new(HashMap::new()) }
    }

    fn digest(bytes: &[u8]) -> Vec<u8> {
        let mut hash: u64 = 0xcbf29ce484222325;
        for &b in bytes {
            hash ^= b as u64;
            hash = hash.wrapping_mul(0x100000001b3);
        }
        let mut out = hash.to_be_bytes().to_vec();
        out.extend_from_slice(&(bytes.len() as u64).to_be_bytes());
        out
    }
}

#[async_trait]
impl ContentStore for MemoryContentStore {
    async fn put(&self, bytes: Vec<u8>) -> Result<RefData, StoreError> {
        let reference = Reference(Self::digest(&bytes));
        self.blobs.lock().unwrap().insert(reference.0.clone(), bytes);
        Ok(RefData { reference, volatile: false, duration: None })
    }

    async fn get(&self, reference: &Reference) -> Result<(Vec<u8>, RefData), StoreError> {
        let blobs = self.blobs.lock().unwrap();
        let bytes = blobs.get(&reference.0).cloned().ok_or(StoreError::NotFound)?;
        Ok((
            bytes,
            RefData { reference: reference.clone(), volatile: false, duration: None },
        ))
    }

    async fn delete(&self, reference: &Reference) -> Result<(), StoreError> {
        self.blobs.lock().unwrap().remove(&reference.0);
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn put_get_round_trip() {
        let store = MemoryContentStore::new();
        let refdata = store.put(b"hello".to_vec()).await.unwrap();
        let (bytes, _) = store.get(&refdata.reference).await.unwrap();
        assert_eq!(bytes, b"hello");
    }

    #[tokio::test]
    async fn get_missing_is_not_found() {
        let store = MemoryContentStore::new();
        let err = store.get(&Reference(vec![0u8; 16])).await.unwrap_err();
        assert!(matches!(err, StoreError::NotFound));
    }

    #[tokio::test]
    async fn delete_removes_blob() {
        let store = MemoryContentStore::new();
        let refdata = store.put(b"bye".to_vec()).await.unwrap();
        store.delete(&refdata.reference).await.unwrap();
        assert!(store.get(&refdata.reference).await.is_err());
    }
}
