//! Content-addressed cache of transcoded tracks.
//!
//! Layout: `<cache_dir>/<artist>-<title>.mp3`. A transcode in flight writes
//! `<name>.mp3.part` and renames on success, so only the exact name counts
//! as resident.

use std::ffi::OsString;
use std::path::{Path, PathBuf};

use anyhow::{Context, Result};

use crate::track::Track;

/// Extension of finished cache artifacts.
pub const CACHE_EXT: &str = "mp3";
/// Suffix appended to an artifact while it is being written.
pub const PART_SUFFIX: &str = ".part";

/// Files found in the cache directory.
#[derive(Debug, Default)]
pub struct CacheEntries {
    /// Finished artifacts.
    pub resident: Vec<PathBuf>,
    /// Half-written or orphaned `.part` files.
    pub partial: Vec<PathBuf>,
}

/// Filesystem-backed cache lookup.
#[derive(Clone, Debug)]
pub struct CacheStore {
    dir: PathBuf,
}

impl CacheStore {
    pub fn new(dir: impl Into<PathBuf>) -> Self {
        Self { dir: dir.into() }
    }

    pub fn dir(&self) -> &Path {
        &self.dir
    }

    /// Create the cache directory if missing.
    pub fn ensure_dir(&self) -> Result<()> {
        std::fs::create_dir_all(&self.dir)
            .with_context(|| format!("create cache dir {:?}", self.dir))
    }

    /// Deterministic key derived from artist and title.
    ///
    /// Distinct tracks sharing artist and title map to the same key.
    pub fn cache_key(track: &Track) -> String {
        format!(
            "{}-{}",
            sanitize_component(&track.artist),
            sanitize_component(&track.title)
        )
    }

    /// Path the finished artifact for `track` lives at.
    pub fn path_for(&self, track: &Track) -> PathBuf {
        self.dir
            .join(format!("{}.{CACHE_EXT}", Self::cache_key(track)))
    }

    /// Whether the finished artifact for `track` exists.
    pub fn exists(&self, track: &Track) -> bool {
        self.path_for(track).is_file()
    }

    /// List finished artifacts and `.part` leftovers, sorted by path.
    pub fn entries(&self) -> Result<CacheEntries> {
        let mut out = CacheEntries::default();
        let dir = match std::fs::read_dir(&self.dir) {
            Ok(dir) => dir,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(out),
            Err(e) => return Err(e).with_context(|| format!("read cache dir {:?}", self.dir)),
        };
        for entry in dir {
            let entry = entry.with_context(|| format!("read cache dir {:?}", self.dir))?;
            let path = entry.path();
            if !path.is_file() {
                continue;
            }
            let name = entry.file_name();
            let name = name.to_string_lossy();
            if name.ends_with(PART_SUFFIX) {
                out.partial.push(path);
            } else if name.ends_with(&format!(".{CACHE_EXT}")) {
                out.resident.push(path);
            }
        }
        out.resident.sort();
        out.partial.sort();
        Ok(out)
    }
}

/// `output` with the `.part` suffix appended.
pub fn part_path(output: &Path) -> PathBuf {
    let mut name = OsString::from(output.as_os_str());
    name.push(PART_SUFFIX);
    PathBuf::from(name)
}

/// Replace characters that would escape the cache directory or break the path.
fn sanitize_component(raw: &str) -> String {
    let cleaned: String = raw
        .trim()
        .chars()
        .map(|c| if c == '/' || c == '\\' || c == '\0' { '_' } else { c })
        .collect();
    if cleaned.is_empty() || cleaned == "." || cleaned == ".." {
        "_".to_string()
    } else {
        cleaned
    }
}
