//! Write-only virtual filesystem core.
//!
//! [`WriteOnlyFs`] is the backend-agnostic state machine behind the
//! output directory handed to child scripts: every create/open gets a
//! fresh in-memory buffer, writes land at arbitrary offsets, and the
//! final close snapshots the buffer and pushes a [`FileEmission`] onto a
//! bounded channel. That send blocks the closer — backpressure into the
//! resource ingester is the engine's only defense against an
//! overproducing script.
//!
//! The kernel-mount frontend lives in [`crate::mount`]; tests and the
//! spool sink drive this type directly.

use std::collections::HashMap;
use std::sync::{Arc, Condvar, Mutex, MutexGuard};
use std::time::{Duration, Instant};

use millrace_types::FileEmission;
use tokio::sync::mpsc;

/// Bound on in-flight emissions between output capture and the ingester.
pub const EMISSION_CAPACITY: usize = 10;

/// How long `stop` waits for open handles before force-draining.
const STOP_GRACE: Duration = Duration::from_secs(2);
/// Per-file budget when force-draining at shutdown.
const FORCE_DRAIN_PER_FILE: Duration = Duration::from_millis(500);
const DRAIN_RETRY: Duration = Duration::from_millis(10);

// POSIX errno values surfaced through the filesystem contract.
pub const EACCES: i32 = 13;
pub const EBADF: i32 = 9;
pub const EROFS: i32 = 30;

type Buffer = Arc<Mutex<Vec<u8>>>;

struct Handle {
    name: String,
    buf: Buffer,
}

struct FsInner {
    /// Buffer per basename; an open replaces the entry with fresh content.
    files: HashMap<String, Buffer>,
    handles: HashMap<u64, Handle>,
    next_fh: u64,
    /// Handles not yet fully released, including those mid-emission.
    open_count: usize,
    closed: bool,
    /// Snapshots from handles released after `closed` was set; flushed by
    /// the force-drain.
    pending: Vec<FileEmission>,
}

/// The write-only filesystem state shared by one task's output sink.
pub struct WriteOnlyFs {
    inner: Mutex<FsInner>,
    drained: Condvar,
    tx: mpsc::Sender<FileEmission>,
}

impl WriteOnlyFs {
    #[must_use]
    pub fn new(tx: mpsc::Sender<FileEmission>) -> Self {
        Self {
            inner: Mutex::new(FsInner {
                files: HashMap::new(),
                handles: HashMap::new(),
                next_fh: 1,
                open_count: 0,
                closed: false,
                pending: Vec::new(),
            }),
            drained: Condvar::new(),
            tx,
        }
    }

    fn lock(&self) -> MutexGuard<'_, FsInner> {
        self.inner.lock().unwrap_or_else(std::sync::PoisonError::into_inner)
    }

    fn register(inner: &mut FsInner, name: &str) -> u64 {
        let buf: Buffer = Arc::new(Mutex::new(Vec::new()));
        inner.files.insert(name.to_string(), buf.clone());
        let fh = inner.next_fh;
        inner.next_fh += 1;
        inner.handles.insert(
            fh,
            Handle {
                name: name.to_string(),
                buf,
            },
        );
        inner.open_count += 1;
        fh
    }

    /// Create a file, allocating a fresh buffer for `name`.
    ///
    /// # Errors
    ///
    /// `EROFS` once the filesystem has been stopped.
    pub fn create(&self, name: &str) -> Result<u64, i32> {
        let mut inner = self.lock();
        if inner.closed {
            return Err(EROFS);
        }
        tracing::trace!(file = name, "create");
        Ok(Self::register(&mut inner, name))
    }

    /// Open a file. Read intent is refused; write intent truncates —
    /// every open starts from empty content, exactly like `create`.
    ///
    /// # Errors
    ///
    /// `EACCES` for read intent, `EROFS` once stopped.
    pub fn open(&self, name: &str, read_intent: bool) -> Result<u64, i32> {
        if read_intent {
            tracing::debug!(file = name, "read-intent open refused");
            return Err(EACCES);
        }
        self.create(name)
    }

    /// Write `data` at `offset`, growing the buffer as needed.
    ///
    /// # Errors
    ///
    /// `EBADF` for an unknown handle.
    pub fn write(&self, fh: u64, offset: u64, data: &[u8]) -> Result<u32, i32> {
        let buf = {
            let inner = self.lock();
            inner.handles.get(&fh).ok_or(EBADF)?.buf.clone()
        };
        let mut content = buf.lock().unwrap_or_else(std::sync::PoisonError::into_inner);
        let offset = usize::try_from(offset).map_err(|_| EBADF)?;
        let end = offset + data.len();
        if end > content.len() {
            content.resize(end, 0);
        }
        content[offset..end].copy_from_slice(data);
        Ok(u32::try_from(data.len()).unwrap_or(u32::MAX))
    }

    /// Current size of `name`'s buffer, if the file exists.
    #[must_use]
    pub fn attr_size(&self, name: &str) -> Option<u64> {
        let inner = self.lock();
        let buf = inner.files.get(name)?.clone();
        drop(inner);
        let content = buf.lock().unwrap_or_else(std::sync::PoisonError::into_inner);
        Some(content.len() as u64)
    }

    /// Resize `name`'s buffer.
    ///
    /// # Errors
    ///
    /// `EBADF` when no such file exists.
    pub fn truncate(&self, name: &str, size: u64) -> Result<(), i32> {
        let buf = {
            let inner = self.lock();
            inner.files.get(name).ok_or(EBADF)?.clone()
        };
        let mut content = buf.lock().unwrap_or_else(std::sync::PoisonError::into_inner);
        let size = usize::try_from(size).map_err(|_| EBADF)?;
        content.resize(size, 0);
        Ok(())
    }

    /// Pre-grow a handle's buffer to cover `offset + size`.
    ///
    /// # Errors
    ///
    /// `EBADF` for an unknown handle.
    pub fn allocate(&self, fh: u64, offset: u64, size: u64) -> Result<(), i32> {
        let buf = {
            let inner = self.lock();
            inner.handles.get(&fh).ok_or(EBADF)?.buf.clone()
        };
        let mut content = buf.lock().unwrap_or_else(std::sync::PoisonError::into_inner);
        let required = usize::try_from(offset + size).map_err(|_| EBADF)?;
        if required > content.len() {
            content.resize(required, 0);
        }
        Ok(())
    }

    /// Register an empty file without an open handle (`mknod` path; the
    /// kernel opens it separately).
    ///
    /// # Errors
    ///
    /// `EROFS` once stopped.
    pub fn touch(&self, name: &str) -> Result<(), i32> {
        let mut inner = self.lock();
        if inner.closed {
            return Err(EROFS);
        }
        inner
            .files
            .entry(name.to_string())
            .or_insert_with(|| Arc::new(Mutex::new(Vec::new())));
        Ok(())
    }

    /// Forget any buffer for `name`. Never touches storage.
    pub fn unlink(&self, name: &str) -> bool {
        let mut inner = self.lock();
        tracing::trace!(file = name, "unlink");
        inner.files.remove(name).is_some()
    }

    /// Final close: snapshot the buffer and, if non-empty, emit it
    /// downstream. Blocks until the ingester accepts the emission.
    pub fn release(&self, fh: u64) {
        let (name, snapshot, closed) = {
            let mut inner = self.lock();
            let Some(handle) = inner.handles.remove(&fh) else {
                return;
            };
            let content = handle
                .buf
                .lock()
                .unwrap_or_else(std::sync::PoisonError::into_inner)
                .clone();
            (handle.name, content, inner.closed)
        };

        tracing::trace!(file = name.as_str(), bytes = snapshot.len(), "release");

        if !snapshot.is_empty() {
            let emission = FileEmission {
                name,
                payload: snapshot,
            };
            if closed {
                // Shutdown in progress: queue for the force-drain instead
                // of blocking a teardown path on the channel.
                self.lock().pending.push(emission);
            } else if self.tx.blocking_send(emission).is_err() {
                tracing::warn!("emission channel closed; output file dropped");
            }
        }

        let mut inner = self.lock();
        // A timed-out stop may already have zeroed the count.
        inner.open_count = inner.open_count.saturating_sub(1);
        if inner.open_count == 0 {
            self.drained.notify_all();
        }
    }

    /// Number of handles not yet released.
    #[must_use]
    pub fn open_files(&self) -> usize {
        self.lock().open_count
    }

    /// Block until every open handle has been released and its emission
    /// accepted downstream.
    pub fn wait_for_writes(&self) {
        let mut inner = self.lock();
        while inner.open_count > 0 {
            inner = self
                .drained
                .wait(inner)
                .unwrap_or_else(std::sync::PoisonError::into_inner);
        }
    }

    /// Mark the filesystem closed, wait a bounded grace period for open
    /// handles, then force-drain whatever is still buffered. Files whose
    /// emission cannot be accepted within the per-file budget are dropped
    /// and logged.
    pub fn stop(&self) {
        let mut inner = self.lock();
        if inner.closed {
            return;
        }
        inner.closed = true;

        let deadline = Instant::now() + STOP_GRACE;
        while inner.open_count > 0 {
            let now = Instant::now();
            if now >= deadline {
                tracing::warn!(
                    open_files = inner.open_count,
                    "timeout waiting for open files, continuing shutdown"
                );
                break;
            }
            let (guard, _timeout) = self
                .drained
                .wait_timeout(inner, deadline - now)
                .unwrap_or_else(std::sync::PoisonError::into_inner);
            inner = guard;
        }

        // Anything still open never got a release; snapshot it now.
        let mut leftovers = std::mem::take(&mut inner.pending);
        for handle in std::mem::take(&mut inner.handles).into_values() {
            let content = handle
                .buf
                .lock()
                .unwrap_or_else(std::sync::PoisonError::into_inner)
                .clone();
            if !content.is_empty() {
                leftovers.push(FileEmission {
                    name: handle.name,
                    payload: content,
                });
            }
        }
        inner.open_count = 0;
        self.drained.notify_all();
        drop(inner);

        for emission in leftovers {
            self.force_send(emission);
        }
    }

    fn force_send(&self, mut emission: FileEmission) {
        let deadline = Instant::now() + FORCE_DRAIN_PER_FILE;
        loop {
            match self.tx.try_send(emission) {
                Ok(()) => return,
                Err(mpsc::error::TrySendError::Closed(e)) => {
                    tracing::warn!(file = e.name.as_str(), "ingester gone; output file dropped");
                    return;
                }
                Err(mpsc::error::TrySendError::Full(e)) => {
                    if Instant::now() >= deadline {
                        tracing::warn!(
                            file = e.name.as_str(),
                            bytes = e.payload.len(),
                            "drain timeout; output file dropped"
                        );
                        return;
                    }
                    emission = e;
                    std::thread::sleep(DRAIN_RETRY);
                }
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicUsize, Ordering};

    fn fs_with_capacity(cap: usize) -> (Arc<WriteOnlyFs>, mpsc::Receiver<FileEmission>) {
        let (tx, rx) = mpsc::channel(cap);
        (Arc::new(WriteOnlyFs::new(tx)), rx)
    }

    #[test]
    fn write_release_emits_file() {
        let (fs, mut rx) = fs_with_capacity(EMISSION_CAPACITY);
        let fh = fs.create("out_1.txt").unwrap();
        fs.write(fh, 0, b"hello").unwrap();
        fs.release(fh);

        let emission = rx.blocking_recv().unwrap();
        assert_eq!(emission.name, "out_1.txt");
        assert_eq!(emission.payload, b"hello");
    }

    #[test]
    fn read_intent_open_refused() {
        let (fs, _rx) = fs_with_capacity(EMISSION_CAPACITY);
        assert_eq!(fs.open("anything", true), Err(EACCES));
    }

    #[test]
    fn sparse_write_zero_fills() {
        let (fs, mut rx) = fs_with_capacity(EMISSION_CAPACITY);
        let fh = fs.create("sparse").unwrap();
        fs.write(fh, 4, b"xy").unwrap();
        fs.release(fh);

        let emission = rx.blocking_recv().unwrap();
        assert_eq!(emission.payload, vec![0, 0, 0, 0, b'x', b'y']);
    }

    #[test]
    fn truncate_and_allocate_resize_buffer() {
        let (fs, _rx) = fs_with_capacity(EMISSION_CAPACITY);
        let fh = fs.create("grow").unwrap();
        fs.write(fh, 0, b"abcdef").unwrap();

        fs.truncate("grow", 3).unwrap();
        assert_eq!(fs.attr_size("grow"), Some(3));

        fs.allocate(fh, 2, 8).unwrap();
        assert_eq!(fs.attr_size("grow"), Some(10));
    }

    #[test]
    fn empty_file_not_emitted() {
        let (fs, mut rx) = fs_with_capacity(EMISSION_CAPACITY);
        let fh = fs.create("empty").unwrap();
        fs.release(fh);
        drop(fs);
        assert!(rx.blocking_recv().is_none());
    }

    #[test]
    fn unlink_forgets_buffer() {
        let (fs, _rx) = fs_with_capacity(EMISSION_CAPACITY);
        let fh = fs.create("gone").unwrap();
        fs.write(fh, 0, b"data").unwrap();
        assert!(fs.unlink("gone"));
        assert_eq!(fs.attr_size("gone"), None);
        // The open handle still releases its own buffer.
        fs.release(fh);
    }

    #[test]
    fn reopen_truncates_previous_content() {
        let (fs, mut rx) = fs_with_capacity(EMISSION_CAPACITY);
        let a = fs.create("same_1.txt").unwrap();
        fs.write(a, 0, b"first").unwrap();
        fs.release(a);
        let b = fs.open("same_1.txt", false).unwrap();
        fs.write(b, 0, b"2nd").unwrap();
        fs.release(b);

        assert_eq!(rx.blocking_recv().unwrap().payload, b"first");
        assert_eq!(rx.blocking_recv().unwrap().payload, b"2nd");
    }

    #[test]
    fn unknown_handle_is_ebadf() {
        let (fs, _rx) = fs_with_capacity(EMISSION_CAPACITY);
        assert_eq!(fs.write(99, 0, b"x"), Err(EBADF));
        assert_eq!(fs.allocate(99, 0, 1), Err(EBADF));
        assert_eq!(fs.truncate("nope", 0), Err(EBADF));
    }

    #[test]
    fn create_after_stop_is_erofs() {
        let (fs, _rx) = fs_with_capacity(EMISSION_CAPACITY);
        fs.stop();
        assert_eq!(fs.create("late"), Err(EROFS));
    }

    #[test]
    fn release_blocks_on_full_channel() {
        let (fs, mut rx) = fs_with_capacity(1);
        let released = Arc::new(AtomicUsize::new(0));

        let fs2 = fs.clone();
        let released2 = released.clone();
        let writer = std::thread::spawn(move || {
            for i in 0..3 {
                let fh = fs2.create(&format!("f_{i}.bin")).unwrap();
                fs2.write(fh, 0, &[i]).unwrap();
                fs2.release(fh);
                released2.fetch_add(1, Ordering::SeqCst);
            }
        });

        // Capacity 1: the writer gets at most two closes through (one in
        // the channel, one blocked in release) until we drain.
        std::thread::sleep(Duration::from_millis(150));
        assert!(released.load(Ordering::SeqCst) <= 2);

        let mut seen = Vec::new();
        for _ in 0..3 {
            seen.push(rx.blocking_recv().unwrap().payload[0]);
        }
        writer.join().unwrap();
        assert_eq!(seen, vec![0, 1, 2]);
        assert_eq!(released.load(Ordering::SeqCst), 3);
    }

    #[test]
    fn wait_for_writes_blocks_until_released() {
        let (fs, mut rx) = fs_with_capacity(EMISSION_CAPACITY);
        let fh = fs.create("slow_1.txt").unwrap();
        fs.write(fh, 0, b"slow").unwrap();

        let fs2 = fs.clone();
        let releaser = std::thread::spawn(move || {
            std::thread::sleep(Duration::from_millis(50));
            fs2.release(fh);
        });

        fs.wait_for_writes();
        assert_eq!(fs.open_files(), 0);
        releaser.join().unwrap();
        assert_eq!(rx.blocking_recv().unwrap().payload, b"slow");
    }

    #[test]
    fn stop_force_drains_unreleased_buffers() {
        let (fs, mut rx) = fs_with_capacity(EMISSION_CAPACITY);
        let fh = fs.create("orphan_1.txt").unwrap();
        fs.write(fh, 0, b"left behind").unwrap();
        // No release: the handle is still open when stop runs. The grace
        // wait times out, then the buffer is shoved onto the channel.
        let started = Instant::now();
        fs.stop();
        assert!(started.elapsed() >= Duration::from_secs(2));

        let emission = rx.blocking_recv().unwrap();
        assert_eq!(emission.name, "orphan_1.txt");
        assert_eq!(emission.payload, b"left behind");
    }

    #[test]
    fn stop_drops_files_when_ingester_never_drains() {
        let (fs, rx) = fs_with_capacity(1);
        // Fill the channel so the drain can never succeed, then hold the
        // receiver open without reading.
        let fh = fs.create("a_1.txt").unwrap();
        fs.write(fh, 0, b"a").unwrap();
        fs.release(fh);

        let fh = fs.create("b_1.txt").unwrap();
        fs.write(fh, 0, b"b").unwrap();
        // Unreleased; stop must give up on it within the per-file budget.
        fs.stop();
        drop(rx);
    }
}
