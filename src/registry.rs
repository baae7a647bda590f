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

use std::collections::HashSet;
use std::path::{Path, PathBuf};
use std::sync::Mutex;

use once_cell::sync::Lazy;

use crate::errors::QueueError;

static OPEN_QUEUE_DIRS: Lazy<Mutex<HashSet<PathBuf>>> =
    Lazy::new(|| Mutex::new(HashSet::new()));

/// Exclusive in-process claim on a queue directory.
///
/// Two live queue instances over the same directory would race on the info
/// file; the second open fails instead. The claim is keyed by canonicalized
/// path and released when the guard drops.
pub(crate) struct DirectoryGuard {
    path: PathBuf,
}

impl DirectoryGuard {
    pub fn acquire(path: &Path) -> Result<DirectoryGuard, QueueError> {
        let mut open_dirs = OPEN_QUEUE_DIRS.lock().unwrap();
        if !open_dirs.insert(path.to_path_buf()) {
            return Err(QueueError::AlreadyOpen(path.to_path_buf()));
        }
        Ok(DirectoryGuard {
            path: path.to_path_buf(),
        })
    }
}

impl Drop for DirectoryGuard {
    fn drop(&mut self) {
        OPEN_QUEUE_DIRS.lock().unwrap().remove(&self.path);
    }
}
