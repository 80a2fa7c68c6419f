use std::path::PathBuf;
use std::time::Duration;

/// Transcoder process settings.
#[derive(Clone, Debug)]
pub struct TranscoderConfig {
    /// Transcoder executable (ffmpeg-compatible command line).
    pub program: PathBuf,
    /// Arguments inserted before the generated ones.
    pub extra_args: Vec<String>,
    /// Keep transcoder diagnostics on stderr.
    pub debug_output: bool,
}

impl Default for TranscoderConfig {
    fn default() -> Self {
        Self {
            program: PathBuf::from("ffmpeg"),
            extra_args: Vec::new(),
            debug_output: false,
        }
    }
}

/// Player process settings.
#[derive(Clone, Debug)]
pub struct PlayerConfig {
    /// Player executable (mplayer-compatible command line).
    pub program: PathBuf,
    /// Arguments inserted before the generated ones.
    pub extra_args: Vec<String>,
    /// Keep player diagnostics on stderr.
    pub debug_output: bool,
    /// Max stdout lines inspected for an answer before giving up.
    pub query_max_lines: usize,
    /// Max wait for any single stdout line while answering a query.
    pub query_line_timeout: Duration,
    /// Max wait for a freshly spawned player to accept commands.
    pub ready_timeout: Duration,
}

impl Default for PlayerConfig {
    fn default() -> Self {
        Self {
            program: PathBuf::from("mplayer"),
            extra_args: Vec::new(),
            debug_output: false,
            query_max_lines: 20,
            query_line_timeout: Duration::from_millis(500),
            ready_timeout: Duration::from_secs(3),
        }
    }
}

/// Everything the orchestrator needs to cache, transcode and play.
#[derive(Clone, Debug)]
pub struct PipelineConfig {
    /// Directory holding finished (and orphaned `.part`) cache artifacts.
    pub cache_dir: PathBuf,
    /// Base path of the player command pipe; slots are suffixed `.0`, `.1`.
    pub control_pipe: PathBuf,
    pub transcoder: TranscoderConfig,
    pub player: PlayerConfig,
}

impl Default for PipelineConfig {
    fn default() -> Self {
        Self {
            cache_dir: PathBuf::from("./cache"),
            control_pipe: PathBuf::from("./cache/mplayer.fifo"),
            transcoder: TranscoderConfig::default(),
            player: PlayerConfig::default(),
        }
    }
}
