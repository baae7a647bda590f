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

//! Crash-safe, multi-producer multi-consumer FIFO queue persisted on local
//! disk.
//!
//! A [`Queue`] is anchored at a directory. Every enqueued item is appended
//! to a log of fixed-capacity chunk files (`q00000`, `q00001`, ...) before
//! `put` returns, and a small `info` snapshot holding the read and write
//! cursors is maintained through an atomic-replace protocol (write a temp
//! file, fsync, rename). A consumer that comes back after a process restart
//! picks up exactly where the last persisted cursor left off.
//!
//! Records are length-prefixed (4-byte little-endian `u32`) user payloads,
//! encoded by a pluggable [`Serializer`]. A record cut short by a crash is
//! detected by its prefix overrunning the file and discarded on the next
//! open; items whose `put` completed are never lost.
//!
//! Delivery semantics are controlled by `autosave`
//! (see [`QueueConfig`]): with `autosave` off (the default), an item fetched
//! by [`get`](Queue::get) but not confirmed with
//! [`task_done`](Queue::task_done) before a crash is redelivered on restart
//! (at-least-once); with `autosave` on, every `get` durably advances the
//! read cursor and a fetched item is gone for good (at-most-once).
//!
//! Caution: the atomic replace relies on directory renames being atomic,
//! which holds on POSIX filesystems and recent Windows; on legacy Windows
//! platforms the metadata replace is best effort.

mod chunklog;
mod errors;
mod meta;
mod queue;
mod registry;
mod serializer;

pub use errors::{QueueError, Result};
pub use queue::{Queue, QueueConfig};
pub use serializer::{BytesSerializer, JsonSerializer, SerializationError, Serializer};
