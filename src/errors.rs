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

use std::io;
use std::path::PathBuf;

use thiserror::Error;

use crate::serializer::SerializationError;

#[derive(Error, Debug)]
pub enum QueueError {
    /// The queue held no item within the allotted wait.
    #[error("queue is empty")]
    Empty,
    /// The queue stayed at `maxsize` for the whole allotted wait.
    #[error("queue is full")]
    Full,
    /// A length prefix announced more bytes than the chunk file holds.
    #[error("torn record in chunk file {chunk_id} at offset {offset}")]
    TornRecord { chunk_id: u64, offset: u64 },
    #[error("io error: {0}")]
    Io(#[from] io::Error),
    #[error("serialization error: {0}")]
    Serialization(#[from] SerializationError),
    /// The directory was initialized with a different chunk capacity,
    /// serializer, or an unusable staging directory.
    #[error("configuration mismatch: {0}")]
    ConfigMismatch(String),
    #[error("queue is closed")]
    Closed,
    /// Another queue instance in this process already owns the directory.
    #[error("queue directory {0:?} is already open in this process")]
    AlreadyOpen(PathBuf),
    /// `task_done` was called more times than `get`.
    #[error("task_done() called with no outstanding task")]
    NoOutstandingTask,
}

pub type Result<T> = std::result::Result<T, QueueError>;
