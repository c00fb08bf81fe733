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

//! Content-addressed blob storage.
//!
//! Blobs are gzip-compressed files named by the hex SHA-256 of their
//! uncompressed contents, fanned out as `blobs/xx/yyyy...`. Payloads are
//! staged under `staging/` with unique temp names and promoted with a
//! rename, so concurrent uploads of the same payload arbitrate on the
//! target filename and duplicates are only stored once.

use std::fs::{self, File};
use std::io::{self, Read, Write};
use std::path::{Path, PathBuf};

use flate2::write::{GzDecoder, GzEncoder};
use flate2::Compression;
use sha2::{Digest, Sha256};
use uuid::Uuid;

use crate::storage::{StorageError, BUFFER_SIZE};

#[derive(Debug, Clone)]
pub struct BlobStore {
    blobs_dir: PathBuf,
    staging_dir: PathBuf,
}

impl BlobStore {
    pub fn open(root: &Path) -> Result<Self, StorageError> {
        let blobs_dir = root.join("blobs");
        let staging_dir = root.join("staging");
        fs::create_dir_all(&blobs_dir)?;
        fs::create_dir_all(&staging_dir)?;
        Ok(Self {
            blobs_dir,
            staging_dir,
        })
    }

    pub fn blobs_dir(&self) -> &Path {
        &self.blobs_dir
    }

    pub fn staging_dir(&self) -> &Path {
        &self.staging_dir
    }

    /// On-disk location of the blob with `digest`: `blobs/xx/yyyy...`.
    pub fn blob_path(&self, digest: &str) -> PathBuf {
        self.blobs_dir.join(&digest[..2]).join(&digest[2..])
    }

    /// Consumes a payload stream into a staged temp file, computing the
    /// SHA-256 and length of the uncompressed contents in the same pass.
    ///
    /// For a raw stream the bytes are hashed and gzip-encoded on the way to
    /// the temp file. For a gzip stream the compressed bytes are written
    /// verbatim while a streaming decoder hashes and counts the plaintext.
    /// Either way the staged file holds the compressed form and memory use
    /// stays bounded by the copy buffer.
    pub fn stage(&self, src: &mut dyn Read, compressed: bool) -> Result<StagedBlob, StorageError> {
        let tmp_path = self.staging_dir.join(format!("{}.tmp", Uuid::new_v4()));
        let dst = File::create(&tmp_path)?;
        let mut staged = StagedBlob {
            tmp_path,
            digest: String::new(),
            logical_size: 0,
            promoted: false,
        };
        // On error `staged` is dropped here and the temp file removed.
        let (digest, logical_size) = if compressed {
            stage_compressed(src, dst)?
        } else {
            stage_raw(src, dst)?
        };
        staged.digest = digest;
        staged.logical_size = logical_size;
        Ok(staged)
    }

    /// Atomically installs a staged file at its digest's canonical path.
    /// Returns whether this call created the blob; an existing blob wins and
    /// the staged copy is discarded.
    pub fn promote(&self, mut staged: StagedBlob) -> Result<bool, StorageError> {
        let target = self.blob_path(&staged.digest);
        if target.exists() {
            return Ok(false);
        }
        if let Some(parent) = target.parent() {
            fs::create_dir_all(parent)?;
        }
        match fs::rename(&staged.tmp_path, &target) {
            Ok(()) => {
                staged.promoted = true;
                Ok(true)
            }
            // A concurrent promote of the same digest may have won the
            // rename; identical content, so nothing is lost.
            Err(_) if target.exists() => Ok(false),
            Err(e) => Err(e.into()),
        }
    }

    /// Opens the compressed blob for reading, returning its on-disk size.
    pub async fn open_blob(&self, digest: &str) -> Result<(tokio::fs::File, u64), StorageError> {
        let path = self.blob_path(digest);
        let file = match tokio::fs::File::open(&path).await {
            Ok(file) => file,
            Err(e) if e.kind() == io::ErrorKind::NotFound => {
                return Err(StorageError::BlobMissing(digest.to_string()))
            }
            Err(e) => return Err(e.into()),
        };
        let len = file.metadata().await?.len();
        Ok((file, len))
    }

    pub fn contains(&self, digest: &str) -> bool {
        self.blob_path(digest).exists()
    }

    /// Removes the blob file. Callers hold the digest lock and have
    /// confirmed the reference count is zero.
    pub fn unlink(&self, digest: &str) -> Result<(), StorageError> {
        match fs::remove_file(self.blob_path(digest)) {
            Ok(()) => Ok(()),
            Err(e) if e.kind() == io::ErrorKind::NotFound => {
                Err(StorageError::BlobMissing(digest.to_string()))
            }
            Err(e) => Err(e.into()),
        }
    }
}

fn stage_raw(src: &mut dyn Read, dst: File) -> Result<(String, u64), StorageError> {
    let mut hasher = Sha256::new();
    let mut logical_size = 0u64;
    let mut encoder = GzEncoder::new(dst, Compression::default());
    let mut buf = vec![0u8; BUFFER_SIZE];
    loop {
        let n = src.read(&mut buf)?;
        if n == 0 {
            break;
        }
        hasher.update(&buf[..n]);
        logical_size += n as u64;
        encoder.write_all(&buf[..n])?;
    }
    let file = encoder.finish()?;
    file.sync_all()?;
    Ok((hex::encode(hasher.finalize()), logical_size))
}

fn stage_compressed(src: &mut dyn Read, mut dst: File) -> Result<(String, u64), StorageError> {
    let mut decoder = GzDecoder::new(DigestSink::default());
    let mut buf = vec![0u8; BUFFER_SIZE];
    loop {
        let n = src.read(&mut buf)?;
        if n == 0 {
            break;
        }
        dst.write_all(&buf[..n])?;
        decoder
            .write_all(&buf[..n])
            .map_err(|e| StorageError::BadPayload(format!("invalid gzip stream: {e}")))?;
    }
    let sink = decoder
        .finish()
        .map_err(|e| StorageError::BadPayload(format!("truncated gzip stream: {e}")))?;
    dst.sync_all()?;
    Ok((hex::encode(sink.hasher.finalize()), sink.logical_size))
}

/// Write sink that hashes and counts the decompressed stream.
#[derive(Default)]
struct DigestSink {
    hasher: Sha256,
    logical_size: u64,
}

impl Write for DigestSink {
    fn write(&mut self, buf: &[u8]) -> io::Result<usize> {
        self.hasher.update(buf);
        self.logical_size += buf.len() as u64;
        Ok(buf.len())
    }

    fn flush(&mut self) -> io::Result<()> {
        Ok(())
    }
}

/// A fully received payload parked in the staging directory. The temp file
/// is removed on drop unless the blob was promoted.
#[derive(Debug)]
pub struct StagedBlob {
    tmp_path: PathBuf,
    digest: String,
    logical_size: u64,
    promoted: bool,
}

impl StagedBlob {
    /// Hex SHA-256 of the uncompressed payload.
    pub fn digest(&self) -> &str {
        &self.digest
    }

    /// Size of the payload before compression.
    pub fn logical_size(&self) -> u64 {
        self.logical_size
    }
}

impl Drop for StagedBlob {
    fn drop(&mut self) {
        if !self.promoted {
            let _ = fs::remove_file(&self.tmp_path);
        }
    }
}
