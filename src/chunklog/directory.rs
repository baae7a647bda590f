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

use std::collections::BTreeSet;
use std::fs::{File, OpenOptions};
use std::io;
use std::ops::Bound;
use std::path::{Path, PathBuf};

/// Tracks the set of chunk files present in the queue directory.
///
/// Chunk filenames are the letter `q` followed by the decimal chunk id
/// padded to at least five digits (`q00000`, `q00001`, ...).
pub(crate) struct Directory {
    dir: PathBuf,
    chunk_set: BTreeSet<u64>,
}

fn filename_to_chunk_id(file_name: &str) -> Option<u64> {
    if file_name.len() < 6 {
        return None;
    }
    if !file_name.starts_with('q') {
        return None;
    }
    let chunk_id_str = &file_name[1..];
    if !chunk_id_str
        .as_bytes()
        .iter()
        .all(|b| (b'0'..=b'9').contains(b))
    {
        return None;
    }
    chunk_id_str.parse::<u64>().ok()
}

impl Directory {
    pub fn open(dir_path: &Path) -> io::Result<Directory> {
        let mut chunk_set: BTreeSet<u64> = Default::default();
        for dir_entry_res in std::fs::read_dir(dir_path)? {
            let dir_entry = dir_entry_res?;
            if !dir_entry.file_type()?.is_file() {
                continue;
            }
            let file_name = if let Some(file_name) = dir_entry.file_name().to_str() {
                file_name.to_string()
            } else {
                continue;
            };
            if let Some(chunk_id) = filename_to_chunk_id(&file_name) {
                chunk_set.insert(chunk_id);
            }
        }
        Ok(Directory {
            dir: dir_path.to_path_buf(),
            chunk_set,
        })
    }

    pub fn num_chunks(&self) -> usize {
        self.chunk_set.len()
    }

    pub fn contains(&self, chunk_id: u64) -> bool {
        self.chunk_set.contains(&chunk_id)
    }

    pub fn chunk_ids(&self) -> impl Iterator<Item = u64> + '_ {
        self.chunk_set.iter().copied()
    }

    pub fn filepath(&self, chunk_id: u64) -> PathBuf {
        self.dir.join(format!("q{chunk_id:05}"))
    }

    /// Deletes every chunk file with an id strictly below `up_to_chunk_id`.
    pub fn reap(&mut self, up_to_chunk_id: u64) -> io::Result<()> {
        let doomed: Vec<u64> = self.chunk_set.range(..up_to_chunk_id).copied().collect();
        for chunk_id in doomed {
            match std::fs::remove_file(self.filepath(chunk_id)) {
                Ok(()) => {}
                Err(io_err) if io_err.kind() == io::ErrorKind::NotFound => {}
                Err(io_err) => return Err(io_err),
            }
            self.chunk_set.remove(&chunk_id);
        }
        Ok(())
    }

    /// Deletes every chunk file with an id strictly above `last_chunk_id`.
    /// Such files hold only records that were never committed.
    pub fn drop_above(&mut self, last_chunk_id: u64) -> io::Result<()> {
        let doomed: Vec<u64> = self
            .chunk_set
            .range((Bound::Excluded(last_chunk_id), Bound::Unbounded))
            .copied()
            .collect();
        for chunk_id in doomed {
            match std::fs::remove_file(self.filepath(chunk_id)) {
                Ok(()) => {}
                Err(io_err) if io_err.kind() == io::ErrorKind::NotFound => {}
                Err(io_err) => return Err(io_err),
            }
            self.chunk_set.remove(&chunk_id);
        }
        Ok(())
    }

    /// Creates the chunk file and registers it in the chunk set.
    pub fn create_chunk(&mut self, chunk_id: u64) -> io::Result<File> {
        assert!(self
            .chunk_set
            .iter()
            .last()
            .copied()
            .map(|last_chunk_id| last_chunk_id < chunk_id)
            .unwrap_or(true));
        let file = OpenOptions::new()
            .create_new(true)
            .write(true)
            .open(self.filepath(chunk_id))?;
        self.chunk_set.insert(chunk_id);
        // The directory entry has to hit the disk before records do.
        sync_dir(&self.dir)?;
        Ok(file)
    }

    /// Reopens an existing chunk file for writing, without truncating it.
    pub fn open_chunk_for_write(&self, chunk_id: u64) -> io::Result<File> {
        OpenOptions::new().write(true).open(self.filepath(chunk_id))
    }

    pub fn open_chunk_for_read(&self, chunk_id: u64) -> io::Result<File> {
        File::open(self.filepath(chunk_id))
    }
}

#[cfg(unix)]
pub(crate) fn sync_dir(dir: &Path) -> io::Result<()> {
    File::open(dir)?.sync_all()
}

#[cfg(not(unix))]
pub(crate) fn sync_dir(_dir: &Path) -> io::Result<()> {
    // Directory handles cannot be fsynced portably here.
    Ok(())
}
