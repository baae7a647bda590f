// Copyright (C) 2022 Quickwit, Inc.
//
// Quickwit is offered under the AGPL v3.0 and as commercial software.
// For commercial licensing, contact us at hello@quickwit.io.
//
// AGPL:
// This program is free software: you can redistribute it and/or modify
// it under the terms of the GNU Affero General Public License as
// published by the Free Software Foundation, either version 3 of the
// License, or (at your option) any later version.
//
// This program is distributed in the hope that it will be useful,
// but WITHOUT ANY WARRANTY; without even the implied warranty of
// MERCHANTABILITY or FITNESS FOR A PARTICULAR PURPOSE. See the
// GNU Affero General Public License for more details.
//
// You should have received a copy of the GNU Affero General Public License
// along with this program. If not, see <http://www.gnu.org/licenses/>.

use std::io::{self, Write};
use std::path::{Path, PathBuf};

use serde::{Deserialize, Serialize};
use tempfile::NamedTempFile;

use crate::chunklog::{sync_dir, Position};

pub(crate) const INFO_FILENAME: &str = "info";

/// On-disk snapshot of the queue cursors.
///
/// `size` counts the records logically sitting between `tail` and `head`.
/// The snapshot on disk never references a chunk file that does not exist.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub(crate) struct QueueInfo {
    pub chunksize: u64,
    pub size: u64,
    pub head: Position,
    pub tail: Position,
    pub serializer: String,
}

/// Persists [`QueueInfo`] with an atomic-replace protocol: the snapshot is
/// written to a temporary sibling file, flushed and fsynced, then renamed
/// over the canonical `info` filename. Readers observe either the previous
/// snapshot or the new one, never a mix.
///
/// Caution: rename within a directory is atomic on POSIX and on recent
/// Windows; on legacy Windows platforms the replace is best effort.
pub(crate) struct InfoStore {
    queue_dir: PathBuf,
    staging_dir: PathBuf,
}

impl InfoStore {
    /// `staging_dir` must sit on the same filesystem as `queue_dir`, else
    /// the rename stops being atomic (the queue validates this at open).
    pub fn new(queue_dir: &Path, staging_dir: Option<&Path>) -> InfoStore {
        InfoStore {
            queue_dir: queue_dir.to_path_buf(),
            staging_dir: staging_dir.unwrap_or(queue_dir).to_path_buf(),
        }
    }

    pub fn info_path(&self) -> PathBuf {
        self.queue_dir.join(INFO_FILENAME)
    }

    pub fn load(&self) -> io::Result<Option<QueueInfo>> {
        let bytes = match std::fs::read(self.info_path()) {
            Ok(bytes) => bytes,
            Err(io_err) if io_err.kind() == io::ErrorKind::NotFound => {
                return Ok(None);
            }
            Err(io_err) => return Err(io_err),
        };
        let info = serde_json::from_slice(&bytes)
            .map_err(|json_err| io::Error::new(io::ErrorKind::InvalidData, json_err))?;
        Ok(Some(info))
    }

    /// A failed rename leaves the previous snapshot intact and unlinks the
    /// staging file; the call is safely retryable.
    pub fn save(&self, info: &QueueInfo) -> io::Result<()> {
        let bytes = serde_json::to_vec(info)
            .map_err(|json_err| io::Error::new(io::ErrorKind::InvalidData, json_err))?;
        let mut tmp_file = NamedTempFile::new_in(&self.staging_dir)?;
        tmp_file.write_all(&bytes)?;
        tmp_file.as_file().sync_all()?;
        tmp_file
            .persist(self.info_path())
            .map_err(|persist_err| persist_err.error)?;
        sync_dir(&self.queue_dir)
    }
}
