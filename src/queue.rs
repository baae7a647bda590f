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

use std::fs::OpenOptions;
use std::io;
use std::path::{Path, PathBuf};
use std::sync::{Condvar, Mutex, MutexGuard};
use std::time::{Duration, Instant};

use tracing::{debug, warn};

use crate::chunklog::{
    self, ChunkReader, ChunkWriter, Directory, Position, ReadRecordError,
};
use crate::errors::{QueueError, Result};
use crate::meta::{InfoStore, QueueInfo};
use crate::registry::DirectoryGuard;
use crate::serializer::Serializer;

/// Queue tuning knobs. The defaults favor durability over throughput.
#[derive(Clone, Debug)]
pub struct QueueConfig {
    /// Soft cap on the logical queue length; 0 means unbounded.
    pub maxsize: u64,
    /// Records per chunk file. Strictly positive, and fixed for the lifetime
    /// of a queue directory.
    pub chunksize: u64,
    /// Staging directory for the atomic metadata replace. Must live on the
    /// same filesystem as the queue directory. Defaults to the queue
    /// directory itself.
    pub tempdir: Option<PathBuf>,
    /// When true, every `get` durably advances the read cursor on its own:
    /// a fetched item is never redelivered after a restart, even without
    /// `task_done`.
    pub autosave: bool,
    /// When true, `put` returns only after the record bytes are fsynced.
    /// Turning this off keeps the write buffered: faster, but a successful
    /// `put` may be lost if the machine (not just the process) goes down.
    pub fsync_on_put: bool,
}

impl Default for QueueConfig {
    fn default() -> QueueConfig {
        QueueConfig {
            maxsize: 0,
            chunksize: 100,
            tempdir: None,
            autosave: false,
            fsync_on_put: true,
        }
    }
}

#[derive(Clone, Copy)]
enum WaitPolicy {
    NonBlocking,
    Indefinite,
    Deadline(Instant),
}

struct State<S> {
    serializer: S,
    directory: Directory,
    writer: ChunkWriter,
    reader: ChunkReader,
    info_store: InfoStore,
    chunksize: u64,
    fsync_on_put: bool,
    /// Where the next record will be written.
    head: Position,
    /// Where the next record will be read.
    tail: Position,
    /// Records currently sitting between `tail` and `head`.
    size: u64,
    /// The last tail position that reached the info file. Reaping and the
    /// snapshots written by `put` are keyed to this, never to the live tail,
    /// so an unconfirmed `get` stays redeliverable after a crash.
    durable_tail: Position,
    /// `get`s whose tail advance has not been persisted yet.
    unsaved_gets: u64,
    /// Items handed out by `get` and not yet confirmed via `task_done`.
    outstanding: u64,
    closed: bool,
    dir_guard: Option<DirectoryGuard>,
}

/// A crash-safe FIFO queue persisted under a directory.
///
/// Items appended with [`put`](Queue::put) are on disk before the call
/// returns; consumers fetch them with [`get`](Queue::get) and confirm
/// processing with [`task_done`](Queue::task_done). With the default
/// `autosave = false`, an item fetched but never confirmed is delivered
/// again after a restart (at-least-once); with `autosave = true` the fetch
/// itself is durable (at-most-once across restarts).
///
/// The queue is safe to share across producer and consumer threads. Items
/// come out in the exact order their `put`s were serialized by the internal
/// lock.
pub struct Queue<S: Serializer> {
    state: Mutex<State<S>>,
    not_empty: Condvar,
    not_full: Condvar,
    all_tasks_done: Condvar,
    maxsize: u64,
    autosave: bool,
}

impl<S: Serializer> Queue<S> {
    /// Opens the queue rooted at `path` with the default configuration,
    /// creating the directory if needed.
    pub fn open<P: AsRef<Path>>(path: P, serializer: S) -> Result<Queue<S>> {
        Queue::open_with(path, serializer, QueueConfig::default())
    }

    /// Opens the queue rooted at `path`, recovering any state a previous
    /// process left behind.
    ///
    /// Fails with [`QueueError::ConfigMismatch`] when the directory was
    /// initialized with a different `chunksize` or serializer, and with
    /// [`QueueError::AlreadyOpen`] when another instance in this process
    /// already owns the directory.
    pub fn open_with<P: AsRef<Path>>(
        path: P,
        serializer: S,
        config: QueueConfig,
    ) -> Result<Queue<S>> {
        if config.chunksize == 0 {
            return Err(QueueError::ConfigMismatch(
                "chunksize must be strictly positive".to_string(),
            ));
        }
        let path = path.as_ref();
        std::fs::create_dir_all(path)?;
        let canonical_path = path.canonicalize()?;
        let dir_guard = DirectoryGuard::acquire(&canonical_path)?;
        if let Some(tempdir) = &config.tempdir {
            check_same_filesystem(&canonical_path, tempdir)?;
        }
        debug!(queue_path = ?canonical_path, "opening queue");

        let mut directory = Directory::open(&canonical_path)?;
        let info_store = InfoStore::new(&canonical_path, config.tempdir.as_deref());
        let mut must_save = false;
        let info = match info_store.load()? {
            Some(info) => {
                if info.chunksize != config.chunksize {
                    return Err(QueueError::ConfigMismatch(format!(
                        "queue was created with chunksize {}, reopened with {}",
                        info.chunksize, config.chunksize
                    )));
                }
                if info.serializer != serializer.version() {
                    return Err(QueueError::ConfigMismatch(format!(
                        "queue was created with serializer `{}`, reopened with `{}`",
                        info.serializer,
                        serializer.version()
                    )));
                }
                if snapshot_consistent(&info, &directory) {
                    info
                } else {
                    warn!(queue_path = ?canonical_path,
                        "queue snapshot out of sync with chunk files, rebuilding positions");
                    must_save = true;
                    // Confirmed records must stay consumed: the scan resumes
                    // at the snapshot's tail wherever that chunk survives.
                    rebuild_info(&directory, &config, serializer.version(), Some(info.tail))?
                }
            }
            None if directory.num_chunks() > 0 => {
                warn!(queue_path = ?canonical_path,
                    "queue snapshot missing, rebuilding positions from chunk files");
                must_save = true;
                rebuild_info(&directory, &config, serializer.version(), None)?
            }
            None => {
                must_save = true;
                QueueInfo {
                    chunksize: config.chunksize,
                    size: 0,
                    head: Position::default(),
                    tail: Position::default(),
                    serializer: serializer.version().to_string(),
                }
            }
        };
        // Bytes past the committed head belong to a put whose snapshot
        // never landed: cut them off, and drop whole uncommitted chunks.
        if directory.contains(info.head.chunk) {
            truncate_head_chunk(&directory, info.head)?;
        }
        directory.drop_above(info.head.chunk)?;
        if must_save {
            info_store.save(&info)?;
        }
        if let Err(io_err) = directory.reap(info.tail.chunk) {
            warn!(error = ?io_err, "failed to reap consumed chunk files");
        }

        let state = State {
            serializer,
            directory,
            writer: ChunkWriter::new(config.chunksize),
            reader: ChunkReader::new(),
            info_store,
            chunksize: config.chunksize,
            fsync_on_put: config.fsync_on_put,
            head: info.head,
            tail: info.tail,
            size: info.size,
            durable_tail: info.tail,
            unsaved_gets: 0,
            outstanding: 0,
            closed: false,
            dir_guard: Some(dir_guard),
        };
        Ok(Queue {
            state: Mutex::new(state),
            not_empty: Condvar::new(),
            not_full: Condvar::new(),
            all_tasks_done: Condvar::new(),
            maxsize: config.maxsize,
            autosave: config.autosave,
        })
    }

    /// Enqueues `item`, blocking while the queue sits at `maxsize`.
    ///
    /// When this returns `Ok`, the record and the advanced write cursor are
    /// on disk and the item survives a process crash.
    pub fn put(&self, item: &S::Item) -> Result<()> {
        self.put_with_policy(item, WaitPolicy::Indefinite)
    }

    /// Enqueues `item` if there is room, failing with [`QueueError::Full`]
    /// otherwise.
    pub fn try_put(&self, item: &S::Item) -> Result<()> {
        self.put_with_policy(item, WaitPolicy::NonBlocking)
    }

    /// Enqueues `item`, waiting at most `timeout` for room.
    pub fn put_timeout(&self, item: &S::Item, timeout: Duration) -> Result<()> {
        self.put_with_policy(item, WaitPolicy::Deadline(Instant::now() + timeout))
    }

    fn put_with_policy(&self, item: &S::Item, policy: WaitPolicy) -> Result<()> {
        let mut state = self.lock_state();
        state = self.wait_until(state, &self.not_full, policy, || QueueError::Full, |state| {
            self.maxsize == 0 || state.size < self.maxsize
        })?;
        let state_mut = &mut *state;
        let payload = state_mut.serializer.encode(item)?;
        let new_head = state_mut.writer.append(
            &mut state_mut.directory,
            state_mut.head,
            &payload,
            state_mut.fsync_on_put,
        )?;
        let snapshot = QueueInfo {
            chunksize: state_mut.chunksize,
            size: state_mut.size + state_mut.unsaved_gets + 1,
            head: new_head,
            tail: state_mut.durable_tail,
            serializer: state_mut.serializer.version().to_string(),
        };
        // If this fails, the in-memory head stays put and the next append
        // overwrites the orphaned bytes.
        state_mut.info_store.save(&snapshot)?;
        state_mut.head = new_head;
        state_mut.size += 1;
        self.not_empty.notify_one();
        Ok(())
    }

    /// Fetches the oldest item, blocking while the queue is empty.
    ///
    /// The item counts as outstanding until [`task_done`](Queue::task_done)
    /// confirms it. With `autosave` off, the read cursor advance stays in
    /// memory until then: crash first, and the item comes back.
    pub fn get(&self) -> Result<S::Item> {
        self.get_with_policy(WaitPolicy::Indefinite)
    }

    /// Fetches the oldest item, failing with [`QueueError::Empty`] when
    /// there is none.
    pub fn try_get(&self) -> Result<S::Item> {
        self.get_with_policy(WaitPolicy::NonBlocking)
    }

    /// Fetches the oldest item, waiting at most `timeout` for one to show up.
    pub fn get_timeout(&self, timeout: Duration) -> Result<S::Item> {
        self.get_with_policy(WaitPolicy::Deadline(Instant::now() + timeout))
    }

    fn get_with_policy(&self, policy: WaitPolicy) -> Result<S::Item> {
        let mut state = self.lock_state();
        state = self.wait_until(state, &self.not_empty, policy, || QueueError::Empty, |state| {
            state.size > 0
        })?;
        let state_mut = &mut *state;
        let mut read_at = state_mut.tail;
        if read_at.count >= state_mut.chunksize {
            // The tail chunk is exhausted: step into its successor.
            read_at = Position {
                chunk: read_at.chunk + 1,
                offset: 0,
                count: 0,
            };
        }
        let (payload, next_offset) =
            match state_mut
                .reader
                .read_at(&state_mut.directory, read_at.chunk, read_at.offset)
            {
                Ok(payload_and_offset) => payload_and_offset,
                Err(ReadRecordError::Io(io_err)) => return Err(QueueError::Io(io_err)),
                Err(ReadRecordError::EndOfChunk) | Err(ReadRecordError::Torn) => {
                    return Err(QueueError::TornRecord {
                        chunk_id: read_at.chunk,
                        offset: read_at.offset,
                    });
                }
            };
        let item = state_mut.serializer.decode(&payload)?;
        let previous_tail = state_mut.tail;
        state_mut.tail = Position {
            chunk: read_at.chunk,
            offset: next_offset,
            count: read_at.count + 1,
        };
        state_mut.size -= 1;
        state_mut.unsaved_gets += 1;
        state_mut.outstanding += 1;
        if self.autosave {
            if let Err(save_err) = persist_tail(state_mut) {
                state_mut.tail = previous_tail;
                state_mut.size += 1;
                state_mut.unsaved_gets -= 1;
                state_mut.outstanding -= 1;
                return Err(save_err);
            }
        }
        self.not_full.notify_one();
        Ok(item)
    }

    /// Confirms one previously fetched item.
    ///
    /// With `autosave` off this is also the point where the read cursor
    /// advances of all intervening `get`s become durable. Signals
    /// [`join`](Queue::join) when the last outstanding item is confirmed.
    pub fn task_done(&self) -> Result<()> {
        let mut state = self.lock_state();
        if state.closed {
            return Err(QueueError::Closed);
        }
        if state.outstanding == 0 {
            return Err(QueueError::NoOutstandingTask);
        }
        let state_mut = &mut *state;
        if !self.autosave && state_mut.unsaved_gets > 0 {
            persist_tail(state_mut)?;
        }
        state_mut.outstanding -= 1;
        if state_mut.outstanding == 0 {
            self.all_tasks_done.notify_all();
        }
        Ok(())
    }

    /// Blocks until every item handed out by `get` has been confirmed with
    /// `task_done`. Returns immediately when nothing is outstanding.
    pub fn join(&self) -> Result<()> {
        let mut state = self.lock_state();
        loop {
            if state.outstanding == 0 {
                return Ok(());
            }
            if state.closed {
                return Err(QueueError::Closed);
            }
            state = self.all_tasks_done.wait(state).unwrap();
        }
    }

    /// Durably checkpoints the queue: flushes the head chunk and persists
    /// the read cursor, including advances still waiting on a `task_done`.
    pub fn flush(&self) -> Result<()> {
        let mut state = self.lock_state();
        if state.closed {
            return Err(QueueError::Closed);
        }
        let state_mut = &mut *state;
        state_mut.writer.flush(true)?;
        persist_tail(state_mut)?;
        Ok(())
    }

    /// Number of items currently enqueued (committed and not yet fetched).
    pub fn size(&self) -> u64 {
        self.lock_state().size
    }

    pub fn is_empty(&self) -> bool {
        self.size() == 0
    }

    /// True when `maxsize` is non-zero and reached.
    pub fn is_full(&self) -> bool {
        self.maxsize > 0 && self.size() >= self.maxsize
    }

    /// Flushes the head chunk, persists the metadata snapshot and releases
    /// every file handle. Idempotent. Threads blocked in `put`, `get` or
    /// `join` wake up with [`QueueError::Closed`].
    ///
    /// Read cursor advances not yet confirmed by `task_done` are *not* made
    /// durable here: those items are redelivered on the next open, exactly
    /// as if the process had crashed.
    pub fn close(&self) -> Result<()> {
        let mut state = self.lock_state();
        if state.closed {
            return Ok(());
        }
        state.closed = true;
        let state_mut = &mut *state;
        let mut first_error: Option<QueueError> = None;
        if let Err(io_err) = state_mut.writer.flush(true) {
            first_error = Some(QueueError::Io(io_err));
        }
        let snapshot = QueueInfo {
            chunksize: state_mut.chunksize,
            size: state_mut.size + state_mut.unsaved_gets,
            head: state_mut.head,
            tail: state_mut.durable_tail,
            serializer: state_mut.serializer.version().to_string(),
        };
        if let Err(io_err) = state_mut.info_store.save(&snapshot) {
            if first_error.is_none() {
                first_error = Some(QueueError::Io(io_err));
            }
        }
        state_mut.writer.close();
        state_mut.reader.close();
        state_mut.dir_guard = None;
        drop(state);
        self.not_empty.notify_all();
        self.not_full.notify_all();
        self.all_tasks_done.notify_all();
        match first_error {
            Some(queue_err) => Err(queue_err),
            None => Ok(()),
        }
    }

    fn lock_state(&self) -> MutexGuard<'_, State<S>> {
        self.state.lock().unwrap()
    }

    fn wait_until<'a>(
        &self,
        mut state: MutexGuard<'a, State<S>>,
        condvar: &Condvar,
        policy: WaitPolicy,
        timeout_error: impl Fn() -> QueueError,
        ready: impl Fn(&State<S>) -> bool,
    ) -> Result<MutexGuard<'a, State<S>>> {
        loop {
            if state.closed {
                return Err(QueueError::Closed);
            }
            if ready(&state) {
                return Ok(state);
            }
            match policy {
                WaitPolicy::NonBlocking => {
                    return Err(timeout_error());
                }
                WaitPolicy::Indefinite => {
                    state = condvar.wait(state).unwrap();
                }
                WaitPolicy::Deadline(deadline) => {
                    let now = Instant::now();
                    if now >= deadline {
                        return Err(timeout_error());
                    }
                    let (guard, _) = condvar.wait_timeout(state, deadline - now).unwrap();
                    state = guard;
                }
            }
        }
    }
}

impl<S: Serializer> Drop for Queue<S> {
    fn drop(&mut self) {
        if let Err(queue_err) = self.close() {
            warn!(error = ?queue_err, "failed to close queue cleanly");
        }
    }
}

/// Persists the live tail (and everything else) and reaps chunk files the
/// durable tail has moved past. Cursors are only updated when the snapshot
/// actually lands.
fn persist_tail<S: Serializer>(state: &mut State<S>) -> Result<()> {
    let snapshot = QueueInfo {
        chunksize: state.chunksize,
        size: state.size,
        head: state.head,
        tail: state.tail,
        serializer: state.serializer.version().to_string(),
    };
    state.info_store.save(&snapshot)?;
    state.durable_tail = state.tail;
    state.unsaved_gets = 0;
    if let Err(io_err) = state.directory.reap(state.durable_tail.chunk) {
        warn!(error = ?io_err, "failed to reap consumed chunk files");
    }
    Ok(())
}

/// Whether the loaded snapshot can be taken at face value: every position it
/// references must be backed by bytes on disk.
fn snapshot_consistent(info: &QueueInfo, directory: &Directory) -> bool {
    if (info.tail.chunk, info.tail.count) > (info.head.chunk, info.head.count) {
        return false;
    }
    if info.head == Position::default() {
        // Nothing was ever committed; stray chunk files hold uncommitted
        // bytes and are dropped by the caller.
        return info.size == 0;
    }
    if !directory.contains(info.head.chunk) || !directory.contains(info.tail.chunk) {
        return false;
    }
    match std::fs::metadata(directory.filepath(info.head.chunk)) {
        Ok(metadata) => metadata.len() >= info.head.offset,
        Err(_) => false,
    }
}

fn truncate_head_chunk(directory: &Directory, head: Position) -> io::Result<()> {
    let head_path = directory.filepath(head.chunk);
    let metadata = std::fs::metadata(&head_path)?;
    if metadata.len() > head.offset {
        let file = OpenOptions::new().write(true).open(&head_path)?;
        file.set_len(head.offset)?;
        file.sync_all()?;
    }
    Ok(())
}

fn rebuild_info(
    directory: &Directory,
    config: &QueueConfig,
    serializer_version: &str,
    tail_hint: Option<Position>,
) -> Result<QueueInfo> {
    let rebuilt = chunklog::rebuild_positions(directory, tail_hint)?;
    Ok(QueueInfo {
        chunksize: config.chunksize,
        size: rebuilt.size,
        head: rebuilt.head,
        tail: rebuilt.tail,
        serializer: serializer_version.to_string(),
    })
}

#[cfg(unix)]
fn check_same_filesystem(queue_dir: &Path, tempdir: &Path) -> Result<()> {
    use std::os::unix::fs::MetadataExt;
    let queue_dev = std::fs::metadata(queue_dir)?.dev();
    let temp_dev = std::fs::metadata(tempdir)?.dev();
    if queue_dev != temp_dev {
        return Err(QueueError::ConfigMismatch(format!(
            "tempdir {tempdir:?} is not on the same filesystem as the queue directory \
             {queue_dir:?}"
        )));
    }
    Ok(())
}

#[cfg(not(unix))]
fn check_same_filesystem(_queue_dir: &Path, tempdir: &Path) -> Result<()> {
    // No portable device-id comparison here; a cross-filesystem rename will
    // surface as an io error from the info store instead.
    let _ = std::fs::metadata(tempdir)?;
    Ok(())
}
