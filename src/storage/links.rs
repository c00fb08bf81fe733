//! The path → blob index and per-digest reference counts.
//!
//! Two sled trees back the index: `links` maps a canonical path to an
//! encoded [`LinkRecord`], and `refs` maps a digest to a 64-bit big-endian
//! reference count. Every mutation runs as a single transaction across both
//! trees, so a committed link always has a committed refcount behind it,
//! crash or not.

use std::path::Path;

use serde::{Deserialize, Serialize};
use sled::transaction::{
    ConflictableTransactionError, ConflictableTransactionResult, TransactionError,
    TransactionalTree,
};
use sled::Transactional;

use crate::storage::StorageError;

/// What a path currently points at.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct LinkRecord {
    /// Hex SHA-256 of the uncompressed payload.
    pub digest: String,
    /// Client-asserted modification time, Unix seconds.
    pub version: i64,
    /// Size of the payload before compression.
    pub logical_size: u64,
    /// Whether the stored blob is gzip-encoded.
    pub compressed: bool,
}

#[derive(Debug, PartialEq, Eq)]
pub enum PutOutcome {
    /// First link to this path.
    Created,
    /// The link was repointed; `gc_old` is set when the previous digest's
    /// refcount dropped to zero and its blob should be removed.
    Replaced { old_digest: String, gc_old: bool },
    /// The stored version is newer or equal; nothing changed.
    Stale { current_version: i64 },
}

#[derive(Debug, PartialEq, Eq)]
pub enum DeleteOutcome {
    Deleted { digest: String, gc: bool },
    Stale { current_version: i64 },
    NotFound,
}

#[derive(Clone)]
pub struct LinkDb {
    db: sled::Db,
    links: sled::Tree,
    refs: sled::Tree,
}

impl LinkDb {
    pub fn open(dir: &Path) -> Result<Self, StorageError> {
        let db = sled::open(dir)?;
        let links = db.open_tree("links")?;
        let refs = db.open_tree("refs")?;
        Ok(Self { db, links, refs })
    }

    pub fn get(&self, path: &str) -> Result<Option<LinkRecord>, StorageError> {
        match self.links.get(path.as_bytes())? {
            Some(raw) => Ok(Some(decode_record(&raw)?)),
            None => Ok(None),
        }
    }

    /// Current reference count for `digest`, zero when absent.
    pub fn ref_count(&self, digest: &str) -> Result<u64, StorageError> {
        match self.refs.get(digest.as_bytes())? {
            Some(raw) => decode_count(&raw),
            None => Ok(0),
        }
    }

    /// Points `path` at `record` unless the stored version is newer or
    /// equal. Refcounts for both the incoming and the displaced digest are
    /// adjusted in the same transaction.
    pub fn put_if_newer(&self, path: &str, record: &LinkRecord) -> Result<PutOutcome, StorageError> {
        let encoded = encode_record(record)?;
        let outcome = (&self.links, &self.refs).transaction(|(links, refs)| {
            let current = match links.get(path.as_bytes())? {
                Some(raw) => Some(decode_record(&raw).map_err(ConflictableTransactionError::Abort)?),
                None => None,
            };
            match current {
                Some(current) if current.version >= record.version => Ok(PutOutcome::Stale {
                    current_version: current.version,
                }),
                Some(current) => {
                    links.insert(path.as_bytes(), encoded.as_slice())?;
                    // Increment before decrement so a same-digest replace
                    // never transits through zero.
                    increment(refs, &record.digest)?;
                    let remaining = decrement(refs, &current.digest)?;
                    Ok(PutOutcome::Replaced {
                        old_digest: current.digest,
                        gc_old: remaining == 0,
                    })
                }
                None => {
                    links.insert(path.as_bytes(), encoded.as_slice())?;
                    increment(refs, &record.digest)?;
                    Ok(PutOutcome::Created)
                }
            }
        });
        unwrap_txn(outcome)
    }

    /// Removes the link at `path` unless the stored version is newer than
    /// `version`.
    pub fn delete_if_newer(&self, path: &str, version: i64) -> Result<DeleteOutcome, StorageError> {
        let outcome = (&self.links, &self.refs).transaction(|(links, refs)| {
            let current = match links.get(path.as_bytes())? {
                Some(raw) => decode_record(&raw).map_err(ConflictableTransactionError::Abort)?,
                None => return Ok(DeleteOutcome::NotFound),
            };
            if current.version > version {
                return Ok(DeleteOutcome::Stale {
                    current_version: current.version,
                });
            }
            links.remove(path.as_bytes())?;
            let remaining = decrement(refs, &current.digest)?;
            Ok(DeleteOutcome::Deleted {
                digest: current.digest,
                gc: remaining == 0,
            })
        });
        unwrap_txn(outcome)
    }

    /// Range scan of links under the directory `dir`, yielding paths with
    /// the directory prefix stripped and only versions strictly older than
    /// `cutoff`. Lazy; each item decodes one record.
    pub fn list(
        &self,
        dir: &str,
        cutoff: i64,
    ) -> impl Iterator<Item = Result<(String, i64), StorageError>> + Send {
        let prefix = if dir == "/" {
            "/".to_string()
        } else {
            format!("{dir}/")
        };
        let strip = prefix.len();
        self.links
            .scan_prefix(prefix.into_bytes())
            .filter_map(move |entry| match entry {
                Ok((key, raw)) => {
                    let record = match decode_record(&raw) {
                        Ok(record) => record,
                        Err(e) => return Some(Err(e)),
                    };
                    if record.version >= cutoff {
                        return None;
                    }
                    let path = String::from_utf8_lossy(&key[strip..]).into_owned();
                    Some(Ok((path, record.version)))
                }
                Err(e) => Some(Err(e.into())),
            })
    }

    /// Waits until every committed transaction is durable on disk.
    pub async fn flush(&self) -> Result<(), StorageError> {
        self.db.flush_async().await?;
        Ok(())
    }
}

fn increment(
    refs: &TransactionalTree,
    digest: &str,
) -> ConflictableTransactionResult<u64, StorageError> {
    let count = match refs.get(digest.as_bytes())? {
        Some(raw) => decode_count(&raw).map_err(ConflictableTransactionError::Abort)? + 1,
        None => 1,
    };
    refs.insert(digest.as_bytes(), &count.to_be_bytes()[..])?;
    Ok(count)
}

fn decrement(
    refs: &TransactionalTree,
    digest: &str,
) -> ConflictableTransactionResult<u64, StorageError> {
    let count = match refs.get(digest.as_bytes())? {
        Some(raw) => decode_count(&raw).map_err(ConflictableTransactionError::Abort)?,
        None => {
            return Err(ConflictableTransactionError::Abort(StorageError::Corrupt(
                format!("link exists but digest {digest} has no refcount"),
            )))
        }
    };
    let remaining = count.saturating_sub(1);
    if remaining == 0 {
        refs.remove(digest.as_bytes())?;
    } else {
        refs.insert(digest.as_bytes(), &remaining.to_be_bytes()[..])?;
    }
    Ok(remaining)
}

fn unwrap_txn<T>(result: Result<T, TransactionError<StorageError>>) -> Result<T, StorageError> {
    match result {
        Ok(value) => Ok(value),
        Err(TransactionError::Abort(e)) => Err(e),
        Err(TransactionError::Storage(e)) => Err(e.into()),
    }
}

fn encode_record(record: &LinkRecord) -> Result<Vec<u8>, StorageError> {
    bincode::serialize(record).map_err(|e| StorageError::Corrupt(e.to_string()))
}

fn decode_record(raw: &[u8]) -> Result<LinkRecord, StorageError> {
    bincode::deserialize(raw)
        .map_err(|e| StorageError::Corrupt(format!("undecodable link record: {e}")))
}

fn decode_count(raw: &[u8]) -> Result<u64, StorageError> {
    let bytes: [u8; 8] = raw
        .try_into()
        .map_err(|_| StorageError::Corrupt("refcount is not 8 bytes".to_string()))?;
    Ok(u64::from_be_bytes(bytes))
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::tempdir;

    fn record(digest: &str, version: i64) -> LinkRecord {
        LinkRecord {
            digest: digest.to_string(),
            version,
            logical_size: 5,
            compressed: true,
        }
    }

    #[test]
    fn put_creates_then_replaces() {
        let dir = tempdir().unwrap();
        let db = LinkDb::open(dir.path()).unwrap();

        assert_eq!(
            db.put_if_newer("/a/b", &record("d1", 100)).unwrap(),
            PutOutcome::Created
        );
        assert_eq!(db.ref_count("d1").unwrap(), 1);

        assert_eq!(
            db.put_if_newer("/a/b", &record("d2", 200)).unwrap(),
            PutOutcome::Replaced {
                old_digest: "d1".to_string(),
                gc_old: true,
            }
        );
        assert_eq!(db.ref_count("d1").unwrap(), 0);
        assert_eq!(db.ref_count("d2").unwrap(), 1);
        assert_eq!(db.get("/a/b").unwrap().unwrap().version, 200);
    }

    #[test]
    fn older_or_equal_put_is_stale() {
        let dir = tempdir().unwrap();
        let db = LinkDb::open(dir.path()).unwrap();
        db.put_if_newer("/a", &record("d1", 100)).unwrap();

        assert_eq!(
            db.put_if_newer("/a", &record("d2", 99)).unwrap(),
            PutOutcome::Stale { current_version: 100 }
        );
        assert_eq!(
            db.put_if_newer("/a", &record("d2", 100)).unwrap(),
            PutOutcome::Stale { current_version: 100 }
        );
        // The losing digest never entered the refs table.
        assert_eq!(db.ref_count("d2").unwrap(), 0);
    }

    #[test]
    fn same_digest_replace_keeps_refcount() {
        let dir = tempdir().unwrap();
        let db = LinkDb::open(dir.path()).unwrap();
        db.put_if_newer("/a", &record("d1", 100)).unwrap();

        assert_eq!(
            db.put_if_newer("/a", &record("d1", 200)).unwrap(),
            PutOutcome::Replaced {
                old_digest: "d1".to_string(),
                gc_old: false,
            }
        );
        assert_eq!(db.ref_count("d1").unwrap(), 1);
    }

    #[test]
    fn shared_digest_counts_links() {
        let dir = tempdir().unwrap();
        let db = LinkDb::open(dir.path()).unwrap();
        db.put_if_newer("/a", &record("d1", 100)).unwrap();
        db.put_if_newer("/b", &record("d1", 100)).unwrap();
        assert_eq!(db.ref_count("d1").unwrap(), 2);

        assert_eq!(
            db.delete_if_newer("/a", 100).unwrap(),
            DeleteOutcome::Deleted {
                digest: "d1".to_string(),
                gc: false,
            }
        );
        assert_eq!(
            db.delete_if_newer("/b", 100).unwrap(),
            DeleteOutcome::Deleted {
                digest: "d1".to_string(),
                gc: true,
            }
        );
        assert_eq!(db.ref_count("d1").unwrap(), 0);
    }

    #[test]
    fn delete_respects_versions() {
        let dir = tempdir().unwrap();
        let db = LinkDb::open(dir.path()).unwrap();
        db.put_if_newer("/a", &record("d1", 100)).unwrap();

        assert_eq!(
            db.delete_if_newer("/a", 99).unwrap(),
            DeleteOutcome::Stale { current_version: 100 }
        );
        assert_eq!(db.get("/a").unwrap().unwrap().digest, "d1");
        assert_eq!(db.delete_if_newer("/missing", 100).unwrap(), DeleteOutcome::NotFound);
    }

    #[test]
    fn list_strips_prefix_and_filters_by_cutoff() {
        let dir = tempdir().unwrap();
        let db = LinkDb::open(dir.path()).unwrap();
        db.put_if_newer("/a/b", &record("d1", 100)).unwrap();
        db.put_if_newer("/a/c/d", &record("d2", 200)).unwrap();
        db.put_if_newer("/ab", &record("d3", 100)).unwrap();

        let mut names: Vec<String> = db
            .list("/a", 150)
            .map(|entry| entry.unwrap().0)
            .collect();
        names.sort();
        assert_eq!(names, vec!["b"]);

        // "/ab" shares a byte prefix with "/a" but is not under it.
        let mut names: Vec<String> = db
            .list("/a", 201)
            .map(|entry| entry.unwrap().0)
            .collect();
        names.sort();
        assert_eq!(names, vec!["b", "c/d"]);

        let all: Vec<String> = db.list("/", 300).map(|entry| entry.unwrap().0).collect();
        assert_eq!(all.len(), 3);
    }
}
