//! Configuration loading and parsing.
//!
//! The TOML file schema, where to find it, and how CLI flags and defaults
//! combine into a [`ClientConfig`].

use std::path::{Path, PathBuf};
use std::time::Duration;

use anyhow::{Context, Result};
use serde::Deserialize;

use media_pipeline::config::{PipelineConfig, PlayerConfig, TranscoderConfig};

use crate::cli::Args;

pub const DEFAULT_SERVER_URL: &str = "http://192.168.1.10:25222";
pub const DEFAULT_PLAYLIST: &str = "_sup_secrets_test_playlist_of_doom";
/// Roughly ten seconds of audio at 48 kB/s.
pub const DEFAULT_STREAM_START_BYTES: u64 = 48_000 * 10;

/// Client configuration loaded from TOML. Every field is optional.
#[derive(Debug, Default, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct FileConfig {
    /// Playlist server base URL (scheme, host and port).
    pub server_url: Option<String>,
    /// Playlist to follow; created on first contact if missing.
    pub playlist: Option<String>,
    /// Directory for transcoded tracks.
    pub cache_dir: Option<PathBuf>,
    /// Directory the downloader writes raw media into.
    pub download_dir: Option<PathBuf>,
    /// Base path of the player command pipe.
    pub control_pipe: Option<PathBuf>,
    /// Sync loop cadence in milliseconds.
    pub poll_interval_ms: Option<u64>,
    /// Downloaded bytes required before live playback starts.
    pub stream_start_bytes: Option<u64>,
    /// Give up on a download that never reaches `stream_start_bytes` (ms).
    pub stream_start_timeout_ms: Option<u64>,
    pub transcoder: Option<PathBuf>,
    pub player: Option<PathBuf>,
    pub downloader: Option<PathBuf>,
    /// Keep subprocess diagnostics on stderr.
    pub debug_output: Option<bool>,
    /// Arguments placed before the generated transcoder arguments.
    pub transcoder_args: Option<Vec<String>>,
    /// Arguments placed before the generated player arguments.
    pub player_args: Option<Vec<String>>,
    /// Arguments placed before the generated downloader arguments.
    pub downloader_args: Option<Vec<String>>,
    /// Player output lines inspected per query.
    pub query_max_lines: Option<usize>,
    /// Max wait for an idle player to open its command pipe (ms).
    pub player_ready_timeout_ms: Option<u64>,
}

impl FileConfig {
    pub fn load(path: &Path) -> Result<Self> {
        let raw =
            std::fs::read_to_string(path).with_context(|| format!("read config {:?}", path))?;
        toml::from_str::<FileConfig>(&raw).with_context(|| format!("parse config {:?}", path))
    }

    /// Load `explicit`, else `config.toml` next to the executable, else defaults.
    pub fn locate(explicit: Option<&Path>) -> Result<Self> {
        if let Some(path) = explicit {
            return Self::load(path);
        }
        let auto_path = std::env::current_exe()
            .ok()
            .and_then(|path| path.parent().map(|dir| dir.join("config.toml")));
        match auto_path {
            Some(path) if path.exists() => Self::load(&path),
            _ => Ok(Self::default()),
        }
    }
}

/// Fully resolved client settings.
#[derive(Clone, Debug)]
pub struct ClientConfig {
    pub server_url: String,
    pub playlist: String,
    pub download_dir: PathBuf,
    pub downloader: PathBuf,
    pub downloader_args: Vec<String>,
    pub poll_interval: Duration,
    pub stream_start_bytes: u64,
    pub stream_start_timeout: Duration,
    pub debug_output: bool,
    pub pipeline: PipelineConfig,
}

impl ClientConfig {
    /// CLI flag, then config file, then built-in default.
    pub fn resolve(file: FileConfig, args: &Args) -> Self {
        let debug_output = file.debug_output.unwrap_or(false);
        let cache_dir = args
            .cache_dir
            .clone()
            .or(file.cache_dir)
            .unwrap_or_else(|| PathBuf::from("./cache"));
        let download_dir = file
            .download_dir
            .unwrap_or_else(|| cache_dir.join("downloads"));
        let control_pipe = file
            .control_pipe
            .unwrap_or_else(|| cache_dir.join("mplayer.fifo"));

        let player_defaults = PlayerConfig::default();
        let pipeline = PipelineConfig {
            cache_dir,
            control_pipe,
            transcoder: TranscoderConfig {
                program: file
                    .transcoder
                    .unwrap_or_else(|| TranscoderConfig::default().program),
                extra_args: file.transcoder_args.unwrap_or_default(),
                debug_output,
            },
            player: PlayerConfig {
                program: file.player.unwrap_or(player_defaults.program),
                extra_args: file.player_args.unwrap_or_default(),
                debug_output,
                query_max_lines: file
                    .query_max_lines
                    .unwrap_or(player_defaults.query_max_lines),
                ready_timeout: file
                    .player_ready_timeout_ms
                    .map(Duration::from_millis)
                    .unwrap_or(player_defaults.ready_timeout),
                ..player_defaults
            },
        };

        Self {
            server_url: args
                .server
                .clone()
                .or(file.server_url)
                .unwrap_or_else(|| DEFAULT_SERVER_URL.to_string())
                .trim_end_matches('/')
                .to_string(),
            playlist: args
                .playlist
                .clone()
                .or(file.playlist)
                .unwrap_or_else(|| DEFAULT_PLAYLIST.to_string()),
            download_dir,
            downloader: file.downloader.unwrap_or_else(|| PathBuf::from("yt-dlp")),
            downloader_args: file.downloader_args.unwrap_or_default(),
            poll_interval: Duration::from_millis(file.poll_interval_ms.unwrap_or(1000)),
            stream_start_bytes: file
                .stream_start_bytes
                .unwrap_or(DEFAULT_STREAM_START_BYTES),
            stream_start_timeout: Duration::from_millis(
                file.stream_start_timeout_ms.unwrap_or(60_000),
            ),
            debug_output,
            pipeline,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use clap::Parser;

    #[test]
    fn defaults_without_file_or_flags() {
        let args = Args::parse_from(["openplug"]);
        let config = ClientConfig::resolve(FileConfig::default(), &args);
        assert_eq!(config.server_url, DEFAULT_SERVER_URL);
        assert_eq!(config.playlist, DEFAULT_PLAYLIST);
        assert_eq!(config.stream_start_bytes, 480_000);
        assert_eq!(config.poll_interval, Duration::from_secs(1));
        assert_eq!(config.pipeline.cache_dir, PathBuf::from("./cache"));
        assert_eq!(config.download_dir, PathBuf::from("./cache/downloads"));
        assert_eq!(
            config.pipeline.control_pipe,
            PathBuf::from("./cache/mplayer.fifo")
        );
        assert_eq!(config.pipeline.player.query_max_lines, 20);
        assert_eq!(config.pipeline.transcoder.program, PathBuf::from("ffmpeg"));
    }

    #[test]
    fn cli_overrides_file() {
        let file: FileConfig = toml::from_str(
            r#"
server_url = "http://files:1/"
playlist = "from-file"
cache_dir = "/srv/cache"
stream_start_bytes = 1000
player_args = ["--wrapper"]
debug_output = true
"#,
        )
        .unwrap();
        let args = Args::parse_from(["openplug", "--playlist", "from-cli"]);
        let config = ClientConfig::resolve(file, &args);

        assert_eq!(config.server_url, "http://files:1");
        assert_eq!(config.playlist, "from-cli");
        assert_eq!(config.stream_start_bytes, 1000);
        assert_eq!(config.download_dir, PathBuf::from("/srv/cache/downloads"));
        assert_eq!(config.pipeline.player.extra_args, vec!["--wrapper"]);
        assert!(config.pipeline.transcoder.debug_output);
        assert!(config.pipeline.player.debug_output);
    }

    #[test]
    fn unknown_keys_are_rejected() {
        assert!(toml::from_str::<FileConfig>("bogus = 1").is_err());
    }

    #[test]
    fn load_reports_missing_file() {
        let err = FileConfig::load(Path::new("/nonexistent/openplug.toml")).unwrap_err();
        assert!(format!("{err:#}").contains("read config"));
    }
}
