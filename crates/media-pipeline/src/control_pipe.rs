//! Named-pipe command channel for the player, rotated between two paths.
//!
//! A dying player may still hold its pipe open while the next one starts, so
//! consecutive sessions never share a path.

use std::ffi::CString;
use std::fs::OpenOptions;
use std::io::{self, Write};
use std::os::unix::ffi::OsStrExt;
use std::os::unix::fs::{FileTypeExt, OpenOptionsExt};
use std::path::{Path, PathBuf};

use anyhow::{Context, Result};

/// Number of rotating pipe paths.
pub const PIPE_SLOTS: usize = 2;

/// Hands out `<base>.0`, `<base>.1`, `<base>.0`, ... creating fifos on demand.
#[derive(Debug)]
pub struct PipeRotation {
    base: PathBuf,
    next: usize,
}

impl PipeRotation {
    pub fn new(base: impl Into<PathBuf>) -> Self {
        Self {
            base: base.into(),
            next: 0,
        }
    }

    pub fn slot_path(&self, slot: usize) -> PathBuf {
        let mut name = self.base.as_os_str().to_owned();
        name.push(format!(".{}", slot % PIPE_SLOTS));
        PathBuf::from(name)
    }

    /// Path for the next session; the fifo is (re)created if missing.
    pub fn next_path(&mut self) -> Result<PathBuf> {
        let path = self.slot_path(self.next);
        self.next = (self.next + 1) % PIPE_SLOTS;
        ensure_fifo(&path)?;
        Ok(path)
    }
}

/// Make sure `path` is a fifo, replacing whatever else sits there.
pub fn ensure_fifo(path: &Path) -> Result<()> {
    match std::fs::symlink_metadata(path) {
        Ok(meta) if meta.file_type().is_fifo() => return Ok(()),
        Ok(_) => {
            tracing::warn!(path = %path.display(), "replacing non-fifo at command pipe path");
            std::fs::remove_file(path)
                .with_context(|| format!("remove stale command pipe {:?}", path))?;
        }
        Err(e) if e.kind() == io::ErrorKind::NotFound => {}
        Err(e) => return Err(e).with_context(|| format!("stat command pipe {:?}", path)),
    }
    if let Some(parent) = path.parent().filter(|p| !p.as_os_str().is_empty()) {
        std::fs::create_dir_all(parent)
            .with_context(|| format!("create command pipe dir {:?}", parent))?;
    }
    make_fifo(path).with_context(|| format!("mkfifo {:?}", path))
}

fn make_fifo(path: &Path) -> io::Result<()> {
    let c_path = CString::new(path.as_os_str().as_bytes())
        .map_err(|_| io::Error::new(io::ErrorKind::InvalidInput, "nul byte in pipe path"))?;
    // SAFETY: `c_path` is a valid NUL-terminated string for the duration of the call.
    let rc = unsafe { libc::mkfifo(c_path.as_ptr(), 0o600) };
    if rc == 0 {
        Ok(())
    } else {
        Err(io::Error::last_os_error())
    }
}

/// Whether some process currently has `path` open for reading.
pub fn has_reader(path: &Path) -> bool {
    open_writer(path).is_ok()
}

/// Write one newline-terminated command.
///
/// Returns `Ok(false)` when nobody is reading the pipe; the open never blocks.
pub fn write_command(path: &Path, command: &str) -> io::Result<bool> {
    let mut pipe = match open_writer(path) {
        Ok(pipe) => pipe,
        Err(e) if e.raw_os_error() == Some(libc::ENXIO) => return Ok(false),
        Err(e) => return Err(e),
    };
    let mut line = command.trim_end_matches('\n').to_string();
    line.push('\n');
    pipe.write_all(line.as_bytes())?;
    Ok(true)
}

fn open_writer(path: &Path) -> io::Result<std::fs::File> {
    OpenOptions::new()
        .write(true)
        .custom_flags(libc::O_NONBLOCK)
        .open(path)
}
