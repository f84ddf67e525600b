use std::collections::{HashMap, HashSet};

use bytes::Bytes;
use chrono::{DateTime, Utc};
use sha2::{Digest, Sha256};
use tokio::sync::RwLock;

use crate::error::{ProvisionerError, Result};
use crate::scheduler::ArchiveRef;

#[derive(Debug)]
struct StoredArchive {
    data: Bytes,
    uploaded_at: DateTime<Utc>,
}

/// Content-addressed, in-memory store for uploaded template archives.
///
/// Archives live until [`FileStore::remove_unreferenced`] finds them
/// unused by any tracked job.
#[derive(Debug)]
pub struct FileStore {
    files: RwLock<HashMap<String, StoredArchive>>,
    max_bytes: u64,
}

impl FileStore {
    pub fn new(max_bytes: u64) -> Self {
        Self {
            files: RwLock::new(HashMap::new()),
            max_bytes,
        }
    }

    pub fn max_bytes(&self) -> u64 {
        self.max_bytes
    }

    /// Store `data` under the hex sha256 of its contents. Uploading the
    /// same bytes again only refreshes the upload time.
    pub async fn put(&self, data: Bytes) -> Result<ArchiveRef> {
        let size = data.len() as u64;
        if size > self.max_bytes {
            return Err(ProvisionerError::ArchiveTooLarge {
                size,
                limit: self.max_bytes,
            });
        }
        let hash = hex::encode(Sha256::digest(&data));
        let now = Utc::now();
        self.files
            .write()
            .await
            .entry(hash.clone())
            .and_modify(|stored| stored.uploaded_at = now)
            .or_insert(StoredArchive {
                data,
                uploaded_at: now,
            });
        tracing::debug!(hash = %hash, size, "Stored template archive");
        Ok(ArchiveRef {
            hash,
            size_bytes: size,
        })
    }

    pub async fn get(&self, hash: &str) -> Option<Bytes> {
        self.files.read().await.get(hash).map(|s| s.data.clone())
    }

    /// Size of a stored archive.
    pub async fn size_of(&self, hash: &str) -> Option<u64> {
        self.files
            .read()
            .await
            .get(hash)
            .map(|s| s.data.len() as u64)
    }

    /// Drop archives uploaded before `cutoff` whose hash is not in
    /// `referenced`. Returns the number of archives removed.
    pub async fn remove_unreferenced(
        &self,
        referenced: &HashSet<String>,
        cutoff: DateTime<Utc>,
    ) -> usize {
        let mut files = self.files.write().await;
        let before = files.len();
        files.retain(|hash, stored| stored.uploaded_at >= cutoff || referenced.contains(hash));
        before - files.len()
    }
}
