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
use std::io::{self, BufReader, Read, Seek, SeekFrom};

use thiserror::Error;

use super::{Directory, RECORD_HEADER_LEN};

#[derive(Error, Debug)]
pub(crate) enum ReadRecordError {
    #[error("io error: {0}")]
    Io(#[from] io::Error),
    /// No record starts at the requested offset.
    #[error("end of chunk")]
    EndOfChunk,
    /// A record starts at the requested offset but its bytes extend past the
    /// end of the chunk file.
    #[error("torn record")]
    Torn,
}

struct OpenChunk {
    chunk_id: u64,
    reader: BufReader<File>,
    offset: u64,
}

/// Buffered reader over chunk files, caching a single read handle.
///
/// Consecutive reads at increasing offsets in the same chunk reuse the
/// handle without seeking.
pub(crate) struct ChunkReader {
    chunk_opt: Option<OpenChunk>,
}

impl ChunkReader {
    pub fn new() -> ChunkReader {
        ChunkReader { chunk_opt: None }
    }

    /// Reads the record starting at `(chunk_id, offset)`. Returns the
    /// payload and the offset just past the record.
    pub fn read_at(
        &mut self,
        directory: &Directory,
        chunk_id: u64,
        offset: u64,
    ) -> Result<(Vec<u8>, u64), ReadRecordError> {
        self.ensure_open_chunk(directory, chunk_id, offset)?;
        match self.read_record() {
            Ok((payload, new_offset)) => Ok((payload, new_offset)),
            Err(read_err) => {
                // The cached handle sits at an unknown position now.
                self.chunk_opt = None;
                Err(read_err)
            }
        }
    }

    /// Releases the cached read handle.
    pub fn close(&mut self) {
        self.chunk_opt = None;
    }

    fn ensure_open_chunk(
        &mut self,
        directory: &Directory,
        chunk_id: u64,
        offset: u64,
    ) -> Result<(), ReadRecordError> {
        let reuse = matches!(&self.chunk_opt, Some(chunk) if chunk.chunk_id == chunk_id);
        if !reuse {
            let file = directory.open_chunk_for_read(chunk_id)?;
            self.chunk_opt = Some(OpenChunk {
                chunk_id,
                reader: BufReader::new(file),
                offset: 0,
            });
        }
        let chunk = self.chunk_opt.as_mut().unwrap();
        if chunk.offset != offset {
            chunk.reader.seek(SeekFrom::Start(offset))?;
            chunk.offset = offset;
        }
        Ok(())
    }

    fn read_record(&mut self) -> Result<(Vec<u8>, u64), ReadRecordError> {
        let chunk = self.chunk_opt.as_mut().unwrap();
        let mut len_prefix = [0u8; RECORD_HEADER_LEN];
        let num_read = read_full(&mut chunk.reader, &mut len_prefix)?;
        if num_read == 0 {
            return Err(ReadRecordError::EndOfChunk);
        }
        if num_read < RECORD_HEADER_LEN {
            return Err(ReadRecordError::Torn);
        }
        let payload_len = u32::from_le_bytes(len_prefix) as u64;
        let record_end = chunk.offset + RECORD_HEADER_LEN as u64 + payload_len;
        if record_end > chunk.reader.get_ref().metadata()?.len() {
            return Err(ReadRecordError::Torn);
        }
        let mut payload = vec![0u8; payload_len as usize];
        if read_full(&mut chunk.reader, &mut payload)? < payload.len() {
            return Err(ReadRecordError::Torn);
        }
        chunk.offset = record_end;
        Ok((payload, chunk.offset))
    }
}

fn read_full(reader: &mut impl Read, buf: &mut [u8]) -> io::Result<usize> {
    let mut num_read = 0;
    while num_read < buf.len() {
        match reader.read(&mut buf[num_read..]) {
            Ok(0) => break,
            Ok(n) => num_read += n,
            Err(io_err) if io_err.kind() == io::ErrorKind::Interrupted => {}
            Err(io_err) => return Err(io_err),
        }
    }
    Ok(num_read)
}
