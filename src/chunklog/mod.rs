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

//! Chunked record log: a sequence of append-only files (`q00000`, `q00001`,
//! ...) each holding up to `chunksize` records.
//!
//! On-disk record format: `<length_prefix><payload>`, where the prefix is a
//! 4-byte little-endian `u32`. The width is part of the format and frozen.
//! There is no per-record checksum: a record whose prefix announces more
//! bytes than the file holds is torn and was never committed.

mod directory;
mod reader;
mod writer;

use std::fs::{self, OpenOptions};

use serde::{Deserialize, Serialize};

pub(crate) use self::directory::{sync_dir, Directory};
pub(crate) use self::reader::{ChunkReader, ReadRecordError};
pub(crate) use self::writer::ChunkWriter;
use crate::errors::{QueueError, Result};

/// Width of the length prefix written before every record payload.
pub(crate) const RECORD_HEADER_LEN: usize = 4;

/// A location in the chunked log.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
pub(crate) struct Position {
    /// Numeric id of the chunk file.
    pub chunk: u64,
    /// Byte offset within the chunk file.
    pub offset: u64,
    /// Records already written to (or read from) this chunk.
    pub count: u64,
}

#[derive(Debug, Default, PartialEq, Eq)]
pub(crate) struct RebuiltLog {
    pub head: Position,
    pub tail: Position,
    pub size: u64,
}

/// Recomputes head, tail and size from the chunk files actually present.
///
/// `tail_hint` is the last tail position known to have reached disk:
/// records behind it were already confirmed and must not come back, so the
/// scan resumes there whenever the hinted chunk is still usable. Only when
/// the tail chunk itself is gone (or shorter than the hinted offset) does
/// the scan fall back to the start of the lowest present chunk.
///
/// A record cut short at the end of the highest chunk is trimmed away (a
/// crash interrupted the write that produced it). A short record anywhere
/// else means the log is damaged beyond what a crash can explain, and is
/// reported as torn.
pub(crate) fn rebuild_positions(
    directory: &Directory,
    tail_hint: Option<Position>,
) -> Result<RebuiltLog> {
    let chunk_ids: Vec<u64> = directory.chunk_ids().collect();
    let (first_chunk, last_chunk) = match (chunk_ids.first(), chunk_ids.last()) {
        (Some(&first_chunk), Some(&last_chunk)) => (first_chunk, last_chunk),
        _ => return Ok(RebuiltLog::default()),
    };
    let tail = tail_hint
        .filter(|tail| tail_position_usable(directory, *tail))
        .unwrap_or(Position {
            chunk: first_chunk,
            offset: 0,
            count: 0,
        });
    let mut reader = ChunkReader::new();
    let mut size = 0u64;
    let mut head = tail;
    for &chunk_id in chunk_ids.iter().filter(|&&chunk_id| chunk_id >= tail.chunk) {
        let (mut offset, mut count) = if chunk_id == tail.chunk {
            (tail.offset, tail.count)
        } else {
            (0u64, 0u64)
        };
        loop {
            match reader.read_at(directory, chunk_id, offset) {
                Ok((_payload, next_offset)) => {
                    offset = next_offset;
                    count += 1;
                    size += 1;
                }
                Err(ReadRecordError::EndOfChunk) => {
                    break;
                }
                Err(ReadRecordError::Torn) if chunk_id == last_chunk => {
                    let file = OpenOptions::new()
                        .write(true)
                        .open(directory.filepath(chunk_id))?;
                    file.set_len(offset)?;
                    file.sync_all()?;
                    break;
                }
                Err(ReadRecordError::Torn) => {
                    return Err(QueueError::TornRecord { chunk_id, offset });
                }
                Err(ReadRecordError::Io(io_err)) => {
                    return Err(QueueError::Io(io_err));
                }
            }
        }
        head = Position {
            chunk: chunk_id,
            offset,
            count,
        };
    }
    Ok(RebuiltLog { head, tail, size })
}

fn tail_position_usable(directory: &Directory, tail: Position) -> bool {
    if !directory.contains(tail.chunk) {
        return false;
    }
    match fs::metadata(directory.filepath(tail.chunk)) {
        Ok(metadata) => metadata.len() >= tail.offset,
        Err(_) => false,
    }
}
