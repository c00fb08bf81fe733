//! Storage engine: content-addressed blobs, the path index, and the keyed
//! locks that serialize writers.
//!
//! Duplicate payloads share one blob; a per-digest reference count in the
//! link database tracks sharing, and a blob file is removed only after the
//! transaction that dropped its count to zero has committed. Paths carry a
//! client-asserted version; an incoming write older than the stored version
//! is ignored rather than rejected.

use std::io::Read;
use std::path::Path;

use thiserror::Error;

pub mod blobs;
pub mod links;
pub mod locks;
pub mod sweep;

pub use blobs::{BlobStore, StagedBlob};
pub use links::{DeleteOutcome, LinkDb, LinkRecord, PutOutcome};
pub use locks::{LockHandle, LockMap, LockSpace};

/// Buffer size for all streaming copies.
pub const BUFFER_SIZE: usize = 64 * 1024;

#[derive(Debug, Error)]
pub enum StorageError {
    #[error("file not found: {0}")]
    NotFound(String),
    #[error("blob not found: {0}")]
    BlobMissing(String),
    #[error("bad payload: {0}")]
    BadPayload(String),
    #[error("corrupt metadata: {0}")]
    Corrupt(String),
    #[error("database error: {0}")]
    Db(#[from] sled::Error),
    #[error("i/o error: {0}")]
    Io(#[from] std::io::Error),
}

/// Result of a versioned delete.
#[derive(Debug, PartialEq, Eq)]
pub enum DeleteStatus {
    Deleted,
    /// The stored version was newer; the link was kept.
    Kept { version: i64 },
}

/// The whole storage engine, shared process-wide behind an `Arc`.
pub struct FileStorage {
    blobs: BlobStore,
    links: LinkDb,
    locks: LockMap,
}

impl FileStorage {
    /// Opens (creating if needed) a storage root with `blobs/`, `staging/`
    /// and `db/` underneath.
    pub fn open(root: &Path) -> Result<Self, StorageError> {
        std::fs::create_dir_all(root)?;
        let blobs = BlobStore::open(root)?;
        let links = LinkDb::open(&root.join("db"))?;
        Ok(Self {
            blobs,
            links,
            locks: LockMap::new(),
        })
    }

    /// Consumes an upload into the staging area. Takes no locks and touches
    /// no index state, so it must finish before [`store`](Self::store) —
    /// that way a slow client never holds a path lock.
    pub fn stage(&self, src: &mut dyn Read, compressed: bool) -> Result<StagedBlob, StorageError> {
        self.blobs.stage(src, compressed)
    }

    /// Links `path` to a staged payload at `version`, deduplicating the
    /// blob. Returns the effective stored version: `version` on success, or
    /// the newer stored version when the write lost the version race.
    pub async fn store(
        &self,
        path: &str,
        staged: StagedBlob,
        version: i64,
    ) -> Result<i64, StorageError> {
        let digest = staged.digest().to_string();
        let record = LinkRecord {
            digest: digest.clone(),
            version,
            logical_size: staged.logical_size(),
            compressed: true,
        };

        let _path_lock = self.locks.acquire(LockSpace::Path, path).await;
        let outcome = {
            // Promote and the index update form one critical section per
            // digest; a concurrent delete of the same digest cannot observe
            // the file without its refcount or vice versa.
            let _blob_lock = self.locks.acquire(LockSpace::Digest, &digest).await;
            let created = self.blobs.promote(staged)?;
            if created {
                tracing::debug!(%digest, "created new blob");
            }
            let outcome = self.links.put_if_newer(path, &record)?;
            if matches!(outcome, PutOutcome::Stale { .. })
                && self.links.ref_count(&digest)? == 0
                && self.blobs.contains(&digest)
            {
                // The upload lost the version race and nothing references
                // its payload.
                self.blobs.unlink(&digest)?;
            }
            outcome
        };

        match outcome {
            PutOutcome::Created => {
                self.links.flush().await?;
                tracing::info!(path, version, "stored new file");
                Ok(version)
            }
            PutOutcome::Replaced { old_digest, gc_old } => {
                self.links.flush().await?;
                tracing::info!(path, version, "overwrote existing file");
                if gc_old {
                    self.gc_blob(&old_digest).await?;
                }
                Ok(version)
            }
            PutOutcome::Stale { current_version } => {
                tracing::info!(
                    path,
                    version,
                    current_version,
                    "ignoring write of older version"
                );
                Ok(current_version)
            }
        }
    }

    /// Removes the link at `path` if `version` is at least the stored
    /// version, unlinking the blob once nothing references it.
    pub async fn delete(&self, path: &str, version: i64) -> Result<DeleteStatus, StorageError> {
        let _path_lock = self.locks.acquire(LockSpace::Path, path).await;
        let current = self
            .links
            .get(path)?
            .ok_or_else(|| StorageError::NotFound(path.to_string()))?;

        let outcome = {
            let _blob_lock = self.locks.acquire(LockSpace::Digest, &current.digest).await;
            let outcome = self.links.delete_if_newer(path, version)?;
            if let DeleteOutcome::Deleted { digest, gc } = &outcome {
                // Commit before unlink: a crash in between leaves an orphan
                // blob for the sweep, never a dangling link.
                self.links.flush().await?;
                if *gc {
                    self.blobs.unlink(digest)?;
                    tracing::debug!(digest = %digest, "deleted last link to blob");
                }
            }
            outcome
        };

        match outcome {
            DeleteOutcome::Deleted { .. } => {
                tracing::info!(path, version, "deleted file");
                Ok(DeleteStatus::Deleted)
            }
            DeleteOutcome::Stale { current_version } => {
                tracing::info!(
                    path,
                    version,
                    current_version,
                    "ignoring delete of older version"
                );
                Ok(DeleteStatus::Kept {
                    version: current_version,
                })
            }
            DeleteOutcome::NotFound => Err(StorageError::NotFound(path.to_string())),
        }
    }

    /// Point-in-time read of the link at `path`.
    pub fn lookup(&self, path: &str) -> Result<Option<LinkRecord>, StorageError> {
        self.links.get(path)
    }

    /// Opens the compressed blob behind `digest` for streaming.
    pub async fn open_blob(&self, digest: &str) -> Result<(tokio::fs::File, u64), StorageError> {
        self.blobs.open_blob(digest).await
    }

    /// Lazy enumeration of links under `dir` with versions strictly older
    /// than `cutoff`, directory prefix stripped.
    pub fn list(
        &self,
        dir: &str,
        cutoff: i64,
    ) -> impl Iterator<Item = Result<(String, i64), StorageError>> + Send {
        self.links.list(dir, cutoff)
    }

    /// Live reference count for a digest; mainly for diagnostics and tests.
    pub fn ref_count(&self, digest: &str) -> Result<u64, StorageError> {
        self.links.ref_count(digest)
    }

    /// Removes blob files with no live reference and clears leftover
    /// staging files. Meant to run before serving; see [`sweep`].
    pub fn sweep_orphans(&self) -> Result<usize, StorageError> {
        sweep::sweep_orphans(&self.blobs, &self.links)
    }

    async fn gc_blob(&self, digest: &str) -> Result<(), StorageError> {
        let _blob_lock = self.locks.acquire(LockSpace::Digest, digest).await;
        // A concurrent store may have resurrected the digest since the
        // count was observed at zero.
        if self.links.ref_count(digest)? == 0 && self.blobs.contains(digest) {
            self.blobs.unlink(digest)?;
            tracing::debug!(%digest, "unlinked unreferenced blob");
        }
        Ok(())
    }
}
