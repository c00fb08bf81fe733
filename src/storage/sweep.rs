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

//! Startup recovery sweep.
//!
//! The link database is the source of truth: a crash can leave blob files
//! whose refcount never committed (or committed to zero), and staged temp
//! files that were never promoted. Both are safe to remove while no
//! requests are being served.

use std::fs;

use crate::storage::{BlobStore, LinkDb, StorageError};

/// Walks the blob fan-out and removes files with no live reference, then
/// clears the staging directory. Returns the number of blob files removed.
pub fn sweep_orphans(blobs: &BlobStore, links: &LinkDb) -> Result<usize, StorageError> {
    let mut removed = 0;

    for prefix_entry in fs::read_dir(blobs.blobs_dir())? {
        let prefix_entry = prefix_entry?;
        if !prefix_entry.file_type()?.is_dir() {
            continue;
        }
        let prefix = prefix_entry.file_name().to_string_lossy().into_owned();
        for blob_entry in fs::read_dir(prefix_entry.path())? {
            let blob_entry = blob_entry?;
            let tail = blob_entry.file_name().to_string_lossy().into_owned();
            let digest = format!("{prefix}{tail}");
            if links.ref_count(&digest)? == 0 {
                fs::remove_file(blob_entry.path())?;
                removed += 1;
                tracing::warn!(%digest, "removed orphaned blob");
            }
        }
    }

    for staged in fs::read_dir(blobs.staging_dir())? {
        let staged = staged?;
        fs::remove_file(staged.path())?;
        tracing::debug!(file = %staged.path().display(), "removed leftover staging file");
    }

    Ok(removed)
}
