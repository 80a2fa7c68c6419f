//! Blocking reader over a file that another process is still appending to.
//!
//! The downloader publishes how many bytes are on disk; the transcoder feed
//! reads through [`SpoolReader`], which waits for more data instead of
//! reporting a premature EOF.

use std::fs::File;
use std::io::{self, Read, Seek, SeekFrom};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Condvar, Mutex, MutexGuard};
use std::time::Duration;

/// How often blocked readers re-check their cancel flag.
const CANCEL_POLL: Duration = Duration::from_millis(100);
/// Retry interval while reported bytes have not reached the file yet.
const DISK_LAG_POLL: Duration = Duration::from_millis(20);

/// Bytes written so far + done flag.
#[derive(Debug, Default)]
pub struct Progress {
    pub bytes_written: u64,
    pub done: bool,
}

/// Shared write progress of a spooling file.
#[derive(Clone, Debug, Default)]
pub struct SpoolProgress {
    inner: Arc<(Mutex<Progress>, Condvar)>,
}

impl SpoolProgress {
    pub fn new() -> Self {
        Self::default()
    }

    /// Progress of a file that is already complete.
    pub fn completed(len: u64) -> Self {
        let progress = Self::new();
        progress.set_written(len);
        progress.mark_done();
        progress
    }

    fn lock(&self) -> MutexGuard<'_, Progress> {
        self.inner.0.lock().unwrap_or_else(|e| e.into_inner())
    }

    /// Record that `bytes` are on disk. Never moves backwards.
    pub fn set_written(&self, bytes: u64) {
        let mut g = self.lock();
        if bytes > g.bytes_written {
            g.bytes_written = bytes;
            drop(g);
            self.inner.1.notify_all();
        }
    }

    /// Writer finished; readers see EOF once they catch up.
    pub fn mark_done(&self) {
        let mut g = self.lock();
        g.done = true;
        drop(g);
        self.inner.1.notify_all();
    }

    pub fn is_done(&self) -> bool {
        self.lock().done
    }

    pub fn bytes_written(&self) -> u64 {
        self.lock().bytes_written
    }

    /// Block until `want_pos` bytes exist, the writer is done, or `cancel` is set.
    ///
    /// Returns `(bytes_written, done)` as observed when the wait ended.
    fn wait_until_available(&self, want_pos: u64, cancel: &AtomicBool) -> (u64, bool) {
        let (_, cv) = &*self.inner;
        let mut g = self.lock();
        while !g.done && g.bytes_written < want_pos && !cancel.load(Ordering::Relaxed) {
            g = match cv.wait_timeout(g, CANCEL_POLL) {
                Ok((g, _)) => g,
                Err(e) => e.into_inner().0,
            };
        }
        (g.bytes_written, g.done)
    }

    /// Wait up to `timeout` for progress beyond `seen_written`, completion or cancel.
    fn wait_for_update(&self, seen_written: u64, cancel: &AtomicBool, timeout: Duration) {
        let (_, cv) = &*self.inner;
        let g = self.lock();
        if g.done || g.bytes_written != seen_written || cancel.load(Ordering::Relaxed) {
            return;
        }
        let _ = cv.wait_timeout(g, timeout);
    }
}

/// Sequential reader over a spooling file.
pub struct SpoolReader {
    file: File,
    progress: SpoolProgress,
    cancel: Arc<AtomicBool>,
    pos: u64,
}

impl SpoolReader {
    pub fn new(file: File, progress: SpoolProgress, cancel: Arc<AtomicBool>) -> Self {
        Self {
            file,
            progress,
            cancel,
            pos: 0,
        }
    }
}

impl Read for SpoolReader {
    fn read(&mut self, buf: &mut [u8]) -> io::Result<usize> {
        if buf.is_empty() {
            return Ok(0);
        }
        loop {
            let (written, done) = self
                .progress
                .wait_until_available(self.pos.saturating_add(1), &self.cancel);

            // Not `Interrupted`: `read_to_end`/`io::copy` would retry that forever.
            if self.cancel.load(Ordering::Relaxed) {
                return Err(io::Error::other("spool read cancelled"));
            }
            // The wait only ends short of new data when the writer is done.
            if written <= self.pos {
                return Ok(0);
            }

            let to_read = buf.len().min((written - self.pos) as usize);
            self.file.seek(SeekFrom::Start(self.pos))?;
            let n = self.file.read(&mut buf[..to_read])?;
            if n > 0 {
                self.pos += n as u64;
                return Ok(n);
            }
            // The writer reports bytes it has not flushed yet. Only a finished
            // writer's short file is a real EOF.
            if done {
                return Ok(0);
            }
            self.progress
                .wait_for_update(written, &self.cancel, DISK_LAG_POLL);
        }
    }
}
