use async_trait::async_trait;
use chrono::{DateTime, Utc};
use imgpipe_common::checksum::sha256_bytes;
use std::collections::BTreeMap;
use std::sync::{Mutex, MutexGuard, PoisonError};

use super::{ObjectStat, ObjectStoreGateway, ObjectUri, StorageError, StorageResult};

/// Gateway operation, used to target injected faults
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum GatewayOp {
    Get,
    Put,
    List,
    Stat,
    Delete,
}

#[derive(Debug, Clone)]
struct StoredBlob {
    data: Vec<u8>,
    /// Checksum recorded at write time; survives [`InMemoryObjectStore::corrupt`]
    checksum: String,
    last_modified: DateTime<Utc>,
}

#[derive(Debug)]
struct Fault {
    op: GatewayOp,
    uri: Option<ObjectUri>,
    error: StorageError,
    remaining: usize,
}

#[derive(Debug, Default)]
struct Inner {
    objects: BTreeMap<ObjectUri, StoredBlob>,
    faults: Vec<Fault>,
    calls: BTreeMap<&'static str, usize>,
}

/// In-process object store for tests and dry runs
#[derive(Debug, Default)]
pub struct InMemoryObjectStore {
    inner: Mutex<Inner>,
}

impl InMemoryObjectStore {
    pub fn new() -> Self {
        Self::default()
    }

    fn lock(&self) -> MutexGuard<'_, Inner> {
        self.inner.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Seed an object without going through `put`
    pub fn insert(&self, uri: &ObjectUri, data: impl Into<Vec<u8>>) {
        let data = data.into();
        let blob = StoredBlob {
            checksum: sha256_bytes(&data),
            data,
            last_modified: Utc::now(),
        };
        self.lock().objects.insert(uri.clone(), blob);
    }

    /// Replace the bytes of an object while keeping its recorded checksum
    pub fn corrupt(&self, uri: &ObjectUri, data: impl Into<Vec<u8>>) {
        if let Some(blob) = self.lock().objects.get_mut(uri) {
            blob.data = data.into();
        }
    }

    pub fn contains(&self, uri: &ObjectUri) -> bool {
        self.lock().objects.contains_key(uri)
    }

    pub fn object(&self, uri: &ObjectUri) -> Option<Vec<u8>> {
        self.lock().objects.get(uri).map(|b| b.data.clone())
    }

    pub fn object_count(&self) -> usize {
        self.lock().objects.len()
    }

    /// Fail the next `times` calls of `op` (on `uri`, or on any URI)
    pub fn inject_fault(
        &self,
        op: GatewayOp,
        uri: Option<ObjectUri>,
        error: StorageError,
        times: usize,
    ) {
        self.lock().faults.push(Fault {
            op,
            uri,
            error,
            remaining: times,
        });
    }

    /// Number of calls made for an operation, faulted calls included
    pub fn call_count(&self, op: GatewayOp) -> usize {
        self.lock().calls.get(op_name(op)).copied().unwrap_or(0)
    }

    fn enter(&self, op: GatewayOp, uri: &ObjectUri) -> StorageResult<MutexGuard<'_, Inner>> {
        let mut inner = self.lock();
        *inner.calls.entry(op_name(op)).or_default() += 1;

        let hit = inner.faults.iter_mut().find(|f| {
            f.op == op && f.remaining > 0 && f.uri.as_ref().is_none_or(|target| target == uri)
        });
        if let Some(fault) = hit {
            fault.remaining -= 1;
            return Err(fault.error.clone());
        }

        Ok(inner)
    }
}

fn op_name(op: GatewayOp) -> &'static str {
    match op {
        GatewayOp::Get => "get",
        GatewayOp::Put => "put",
        GatewayOp::List => "list",
        GatewayOp::Stat => "stat",
        GatewayOp::Delete => "delete",
    }
}

#[async_trait]
impl ObjectStoreGateway for InMemoryObjectStore {
    async fn get(&self, uri: &ObjectUri) -> StorageResult<Vec<u8>> {
        let inner = self.enter(GatewayOp::Get, uri)?;
        inner
            .objects
            .get(uri)
            .map(|b| b.data.clone())
            .ok_or_else(|| StorageError::NotFound(uri.to_string()))
    }

    async fn put(&self, uri: &ObjectUri, data: Vec<u8>) -> StorageResult<ObjectStat> {
        let mut inner = self.enter(GatewayOp::Put, uri)?;
        let blob = StoredBlob {
            checksum: sha256_bytes(&data),
            data,
            last_modified: Utc::now(),
        };
        let stat = ObjectStat {
            size: blob.data.len() as u64,
            checksum: Some(blob.checksum.clone()),
            last_modified: Some(blob.last_modified),
        };
        inner.objects.insert(uri.clone(), blob);
        Ok(stat)
    }

    async fn list(&self, prefix: &ObjectUri) -> StorageResult<Vec<String>> {
        let inner = self.enter(GatewayOp::List, prefix)?;
        Ok(inner
            .objects
            .keys()
            .filter(|u| u.bucket == prefix.bucket && u.key.starts_with(&prefix.key))
            .map(|u| u.key.clone())
            .collect())
    }

    async fn stat(&self, uri: &ObjectUri) -> StorageResult<ObjectStat> {
        let inner = self.enter(GatewayOp::Stat, uri)?;
        inner
            .objects
            .get(uri)
            .map(|b| ObjectStat {
                size: b.data.len() as u64,
                checksum: Some(b.checksum.clone()),
                last_modified: Some(b.last_modified),
            })
            .ok_or_else(|| StorageError::NotFound(uri.to_string()))
    }

    async fn delete(&self, uri: &ObjectUri) -> StorageResult<()> {
        let mut inner = self.enter(GatewayOp::Delete, uri)?;
        inner.objects.remove(uri);
        Ok(())
    }
}

#[cfg(test)]
#[allow(clippy::unwrap_used)]
mod tests {
    use super::*;

    fn uri(s: &str) -> ObjectUri {
        s.parse().unwrap()
    }

    #[tokio::test]
    async fn test_put_get_stat_list() {
        let store = InMemoryObjectStore::new();
        let stat = store.put(&uri("s3://raw/a.jpg"), b"abc".to_vec()).await.unwrap();
        store.insert(&uri("s3://raw/b.png"), b"defg".to_vec());
        store.insert(&uri("s3://other/a.jpg"), b"x".to_vec());

        assert_eq!(stat.size, 3);
        assert_eq!(store.get(&uri("s3://raw/a.jpg")).await.unwrap(), b"abc");
        assert_eq!(store.stat(&uri("s3://raw/b.png")).await.unwrap().size, 4);
        assert_eq!(
            store.list(&uri("s3://raw/")).await.unwrap(),
            vec!["a.jpg".to_string(), "b.png".to_string()]
        );
    }

    #[tokio::test]
    async fn test_missing_object() {
        let store = InMemoryObjectStore::new();
        assert!(matches!(
            store.get(&uri("s3://raw/nope")).await,
            Err(StorageError::NotFound(_))
        ));
        assert!(store.try_stat(&uri("s3://raw/nope")).await.unwrap().is_none());
    }

    #[tokio::test]
    async fn test_injected_fault_is_consumed() {
        let store = InMemoryObjectStore::new();
        store.insert(&uri("s3://raw/a.jpg"), b"abc".to_vec());
        store.inject_fault(
            GatewayOp::Get,
            Some(uri("s3://raw/a.jpg")),
            StorageError::transient("s3://raw/a.jpg", "reset"),
            1,
        );

        assert!(store.get(&uri("s3://raw/a.jpg")).await.unwrap_err().is_retryable());
        assert!(store.get(&uri("s3://raw/a.jpg")).await.is_ok());
        assert_eq!(store.call_count(GatewayOp::Get), 2);
    }

    #[tokio::test]
    async fn test_corrupt_keeps_recorded_checksum() {
        let store = InMemoryObjectStore::new();
        let u = uri("s3://raw/a.jpg");
        store.insert(&u, b"abc".to_vec());
        store.corrupt(&u, b"abd".to_vec());

        let stat = store.stat(&u).await.unwrap();
        assert_eq!(stat.checksum.unwrap(), sha256_bytes(b"abc"));
        assert_eq!(store.object(&u).unwrap(), b"abd");
    }
}
