// Copyright PingCAP Inc. 2025.
//
// This program is free software; you can redistribute it and/or modify
// it under the terms of the GNU General Public License as published by
// the Free Software Foundation; version 2 of the License.
//
// This program is distributed in the hope that it will be useful,
// but WITHOUT ANY WARRANTY; without even the implied warranty of
// MERCHANTABILITY or FITNESS FOR A PARTICULAR PURPOSE. See the
// GNU General Public License for more details.
//
// You should have received a copy of the GNU General Public License along
// with this program; if not, write to the Free Software Foundation, Inc.,
// 51 Franklin Street, Fifth Floor, Boston, MA 02110-1301 USA.

//! Storage engine laws exercised without the HTTP layer: deduplication,
//! reference counting, version monotonicity and crash-orphan recovery.

use std::fs;
use std::path::Path;
use std::sync::Arc;

use filetracker::storage::{DeleteStatus, FileStorage, StorageError};
use sha2::{Digest, Sha256};
use tempfile::tempdir;

const V0: i64 = 1_703_980_799;
const V1: i64 = 1_704_067_200;
const V2: i64 = 1_704_153_600;

async fn store_bytes(storage: &FileStorage, path: &str, bytes: &[u8], version: i64) -> i64 {
    let mut src: &[u8] = bytes;
    let staged = storage.stage(&mut src, false).unwrap();
    storage.store(path, staged, version).await.unwrap()
}

fn sha256_hex(bytes: &[u8]) -> String {
    hex::encode(Sha256::digest(bytes))
}

fn count_blob_files(root: &Path) -> usize {
    let mut count = 0;
    for prefix in fs::read_dir(root.join("blobs")).unwrap() {
        let prefix = prefix.unwrap();
        if prefix.file_type().unwrap().is_dir() {
            count += fs::read_dir(prefix.path()).unwrap().count();
        }
    }
    count
}

#[tokio::test]
async fn store_links_path_to_content_digest() {
    let dir = tempdir().unwrap();
    let storage = FileStorage::open(dir.path()).unwrap();

    let accepted = store_bytes(&storage, "/x/y", b"hello", V1).await;
    assert_eq!(accepted, V1);

    let record = storage.lookup("/x/y").unwrap().unwrap();
    assert_eq!(record.digest, sha256_hex(b"hello"));
    assert_eq!(record.version, V1);
    assert_eq!(record.logical_size, 5);
    assert!(record.compressed);
    assert_eq!(storage.ref_count(&record.digest).unwrap(), 1);
    assert_eq!(count_blob_files(dir.path()), 1);
}

#[tokio::test]
async fn repeated_store_is_idempotent() {
    let dir = tempdir().unwrap();
    let storage = FileStorage::open(dir.path()).unwrap();

    store_bytes(&storage, "/a", b"hello", V1).await;
    store_bytes(&storage, "/a", b"hello", V1).await;

    let record = storage.lookup("/a").unwrap().unwrap();
    assert_eq!(record.version, V1);
    assert_eq!(storage.ref_count(&record.digest).unwrap(), 1);
    assert_eq!(count_blob_files(dir.path()), 1);
}

#[tokio::test]
async fn duplicate_payloads_are_stored_once() {
    let dir = tempdir().unwrap();
    let storage = FileStorage::open(dir.path()).unwrap();

    store_bytes(&storage, "/p1", b"hello", V1).await;
    store_bytes(&storage, "/p2", b"hello", V1).await;

    let digest = sha256_hex(b"hello");
    assert_eq!(storage.ref_count(&digest).unwrap(), 2);
    assert_eq!(count_blob_files(dir.path()), 1);

    assert_eq!(
        storage.delete("/p1", V1).await.unwrap(),
        DeleteStatus::Deleted
    );
    assert_eq!(storage.ref_count(&digest).unwrap(), 1);
    assert_eq!(count_blob_files(dir.path()), 1);

    assert_eq!(
        storage.delete("/p2", V1).await.unwrap(),
        DeleteStatus::Deleted
    );
    assert_eq!(storage.ref_count(&digest).unwrap(), 0);
    assert_eq!(count_blob_files(dir.path()), 0);
}

#[tokio::test]
async fn losing_write_leaves_no_trace() {
    let dir = tempdir().unwrap();
    let storage = FileStorage::open(dir.path()).unwrap();

    store_bytes(&storage, "/a", b"newer", V2).await;
    let effective = store_bytes(&storage, "/a", b"older", V1).await;
    assert_eq!(effective, V2);

    let record = storage.lookup("/a").unwrap().unwrap();
    assert_eq!(record.digest, sha256_hex(b"newer"));
    // The rejected payload's blob must have been cleaned up.
    assert_eq!(count_blob_files(dir.path()), 1);
    assert_eq!(storage.ref_count(&sha256_hex(b"older")).unwrap(), 0);
}

#[tokio::test]
async fn overwrite_swaps_blobs() {
    let dir = tempdir().unwrap();
    let storage = FileStorage::open(dir.path()).unwrap();

    store_bytes(&storage, "/a", b"first", V1).await;
    store_bytes(&storage, "/a", b"second", V2).await;

    assert_eq!(storage.ref_count(&sha256_hex(b"first")).unwrap(), 0);
    assert_eq!(storage.ref_count(&sha256_hex(b"second")).unwrap(), 1);
    assert_eq!(count_blob_files(dir.path()), 1);
}

#[tokio::test]
async fn stale_delete_keeps_newer_link() {
    let dir = tempdir().unwrap();
    let storage = FileStorage::open(dir.path()).unwrap();

    store_bytes(&storage, "/a", b"hello", V1).await;
    assert_eq!(
        storage.delete("/a", V0).await.unwrap(),
        DeleteStatus::Kept { version: V1 }
    );
    assert!(storage.lookup("/a").unwrap().is_some());

    assert!(matches!(
        storage.delete("/missing", V1).await,
        Err(StorageError::NotFound(_))
    ));
}

#[tokio::test]
async fn list_reflects_links_under_a_directory() {
    let dir = tempdir().unwrap();
    let storage = FileStorage::open(dir.path()).unwrap();

    store_bytes(&storage, "/a/b", b"hello", V1).await;
    store_bytes(&storage, "/a/c", b"hello", V1).await;
    store_bytes(&storage, "/other", b"hello", V1).await;

    let mut names: Vec<String> = storage
        .list("/a", V2)
        .map(|entry| entry.unwrap().0)
        .collect();
    names.sort();
    assert_eq!(names, vec!["b", "c"]);
}

#[tokio::test(flavor = "multi_thread")]
async fn concurrent_writes_to_one_path_keep_the_newest() {
    let dir = tempdir().unwrap();
    let storage = Arc::new(FileStorage::open(dir.path()).unwrap());

    let mut tasks = Vec::new();
    for i in 0..8i64 {
        let storage = Arc::clone(&storage);
        tasks.push(tokio::spawn(async move {
            let payload = format!("payload-{i}");
            let mut src: &[u8] = payload.as_bytes();
            let staged = storage.stage(&mut src, false).unwrap();
            storage.store("/contended", staged, V1 + i).await.unwrap();
        }));
    }
    for task in tasks {
        task.await.unwrap();
    }

    // Whatever the arrival order, the highest version wins and no losing
    // payload leaves a blob behind.
    let record = storage.lookup("/contended").unwrap().unwrap();
    assert_eq!(record.version, V1 + 7);
    assert_eq!(record.digest, sha256_hex(b"payload-7"));
    assert_eq!(storage.ref_count(&record.digest).unwrap(), 1);
    assert_eq!(count_blob_files(dir.path()), 1);
}

#[tokio::test(flavor = "multi_thread")]
async fn concurrent_uploads_of_one_payload_share_a_blob() {
    let dir = tempdir().unwrap();
    let storage = Arc::new(FileStorage::open(dir.path()).unwrap());

    let mut tasks = Vec::new();
    for i in 0..8 {
        let storage = Arc::clone(&storage);
        tasks.push(tokio::spawn(async move {
            let mut src: &[u8] = b"shared";
            let staged = storage.stage(&mut src, false).unwrap();
            storage
                .store(&format!("/race/{i}"), staged, V1)
                .await
                .unwrap();
        }));
    }
    for task in tasks {
        task.await.unwrap();
    }

    assert_eq!(storage.ref_count(&sha256_hex(b"shared")).unwrap(), 8);
    assert_eq!(count_blob_files(dir.path()), 1);
    for i in 0..8 {
        assert!(storage.lookup(&format!("/race/{i}")).unwrap().is_some());
    }
}

#[tokio::test]
async fn sweep_removes_orphans_and_keeps_referenced_blobs() {
    let dir = tempdir().unwrap();
    let storage = FileStorage::open(dir.path()).unwrap();

    store_bytes(&storage, "/keep", b"hello", V1).await;

    // Fake a crash leftover: a blob file with no committed refcount and a
    // stale staging file.
    let orphan_dir = dir.path().join("blobs").join("ff");
    fs::create_dir_all(&orphan_dir).unwrap();
    fs::write(orphan_dir.join("ee".repeat(31)), b"junk").unwrap();
    fs::write(dir.path().join("staging").join("leftover.tmp"), b"junk").unwrap();

    let removed = storage.sweep_orphans().unwrap();
    assert_eq!(removed, 1);
    assert_eq!(count_blob_files(dir.path()), 1);
    assert_eq!(fs::read_dir(dir.path().join("staging")).unwrap().count(), 0);
    assert!(storage.lookup("/keep").unwrap().is_some());
}
