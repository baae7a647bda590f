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

use std::fs::File;
use std::io::{self, BufWriter, Seek, SeekFrom, Write};

use super::{Directory, Position, RECORD_HEADER_LEN};

/// Largest payload representable by the length prefix.
pub(crate) const MAX_RECORD_LEN: usize = u32::MAX as usize;

struct OpenChunk {
    chunk_id: u64,
    wrt: BufWriter<File>,
    offset: u64,
}

/// Buffered writer over the head chunk.
///
/// A chunk that already holds `chunksize` records is full: the next append
/// flushes and fsyncs it, then opens the successor chunk before writing.
pub(crate) struct ChunkWriter {
    chunksize: u64,
    chunk_opt: Option<OpenChunk>,
}

impl ChunkWriter {
    pub fn new(chunksize: u64) -> ChunkWriter {
        ChunkWriter {
            chunksize,
            chunk_opt: None,
        }
    }

    /// Appends one length-prefixed record after `head` and returns the
    /// position of the next record.
    ///
    /// On failure the partial bytes are trimmed back (best effort) and the
    /// caller's position remains valid: retrying overwrites the same range.
    pub fn append(
        &mut self,
        directory: &mut Directory,
        head: Position,
        payload: &[u8],
        durable: bool,
    ) -> io::Result<Position> {
        if payload.len() > MAX_RECORD_LEN {
            return Err(io::Error::new(
                io::ErrorKind::InvalidInput,
                format!(
                    "record of {} bytes does not fit the {RECORD_HEADER_LEN}-byte length prefix",
                    payload.len()
                ),
            ));
        }
        let write_at = if head.count >= self.chunksize {
            Position {
                chunk: head.chunk + 1,
                offset: 0,
                count: 0,
            }
        } else {
            head
        };
        self.ensure_open_chunk(directory, write_at.chunk, write_at.offset)?;
        match self.write_record(payload, durable) {
            Ok(new_offset) => Ok(Position {
                chunk: write_at.chunk,
                offset: new_offset,
                count: write_at.count + 1,
            }),
            Err(io_err) => {
                self.trim_back_to(write_at.offset);
                Err(io_err)
            }
        }
    }

    /// Flushes the head chunk buffer; with `durable` the file is also
    /// fsynced.
    pub fn flush(&mut self, durable: bool) -> io::Result<()> {
        if let Some(chunk) = self.chunk_opt.as_mut() {
            chunk.wrt.flush()?;
            if durable {
                chunk.wrt.get_ref().sync_all()?;
            }
        }
        Ok(())
    }

    /// Releases the write handle on the head chunk.
    pub fn close(&mut self) {
        self.chunk_opt = None;
    }

    fn ensure_open_chunk(
        &mut self,
        directory: &mut Directory,
        chunk_id: u64,
        offset: u64,
    ) -> io::Result<()> {
        let reuse = matches!(&self.chunk_opt, Some(chunk) if chunk.chunk_id == chunk_id);
        if !reuse {
            // Rolling: the finished chunk becomes durable before its
            // successor takes records.
            if let Some(mut chunk) = self.chunk_opt.take() {
                chunk.wrt.flush()?;
                chunk.wrt.get_ref().sync_all()?;
            }
            let file = if directory.contains(chunk_id) {
                directory.open_chunk_for_write(chunk_id)?
            } else {
                directory.create_chunk(chunk_id)?
            };
            self.chunk_opt = Some(OpenChunk {
                chunk_id,
                wrt: BufWriter::new(file),
                offset: 0,
            });
        }
        let chunk = self.chunk_opt.as_mut().unwrap();
        if chunk.offset != offset {
            chunk.wrt.seek(SeekFrom::Start(offset))?;
            chunk.offset = offset;
        }
        Ok(())
    }

    fn write_record(&mut self, payload: &[u8], durable: bool) -> io::Result<u64> {
        let chunk = self.chunk_opt.as_mut().unwrap();
        let len_prefix = (payload.len() as u32).to_le_bytes();
        chunk.wrt.write_all(&len_prefix)?;
        chunk.wrt.write_all(payload)?;
        chunk.wrt.flush()?;
        if durable {
            chunk.wrt.get_ref().sync_all()?;
        }
        chunk.offset += (RECORD_HEADER_LEN + payload.len()) as u64;
        Ok(chunk.offset)
    }

    fn trim_back_to(&mut self, offset: u64) {
        // The buffer may hold a half-written record: take the file out
        // without flushing and cut it back. If the trim fails too, the
        // record is discarded as torn on the next open.
        if let Some(chunk) = self.chunk_opt.take() {
            let (file, _partial) = chunk.wrt.into_parts();
            let _ = file.set_len(offset);
        }
    }
}
