use std::fmt;
use std::path::PathBuf;

use playlist_types::SongId;

/// How the current session gets its audio.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum PlaybackMode {
    /// Reading the live stream of a transcode in progress.
    Live,
    /// Playing a finished cache artifact.
    Cache,
}

impl fmt::Display for PlaybackMode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            PlaybackMode::Live => f.write_str("live"),
            PlaybackMode::Cache => f.write_str("cache"),
        }
    }
}

/// Point-in-time view of the orchestrator.
#[derive(Clone, Debug, Default)]
pub struct OrchestratorStatus {
    pub current_track: Option<String>,
    pub current_track_id: Option<SongId>,
    pub decoding: bool,
    pub backlog_len: usize,
    pub backlog_running: usize,
    pub session_alive: bool,
    pub command_pipe: Option<PathBuf>,
    pub mode: Option<PlaybackMode>,
}

impl fmt::Display for OrchestratorStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match (&self.current_track, self.mode) {
            (Some(track), Some(mode)) => write!(f, "{track} ({mode})")?,
            (Some(track), None) => write!(f, "{track}")?,
            _ => f.write_str("nothing playing")?,
        }
        if self.decoding {
            f.write_str(", decoding")?;
        }
        if self.backlog_len > 0 {
            write!(
                f,
                ", backlog {}/{} running",
                self.backlog_running, self.backlog_len
            )?;
        }
        Ok(())
    }
}
