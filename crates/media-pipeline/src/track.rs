//! Track model and the playback offset law.

use std::path::PathBuf;

use playlist_types::{PlaylistState, SongId, SongInfo};

use crate::spool::SpoolProgress;

/// Server-relative timing attached when a song becomes current.
#[derive(Clone, Copy, Debug, Default, PartialEq)]
pub struct TrackTiming {
    pub song_start_time: f64,
    pub requested_time: f64,
}

impl TrackTiming {
    /// Seconds the server is already into the song.
    ///
    /// Clamped at zero: `requested_time` never precedes `song_start_time`.
    pub fn server_offset(&self) -> i64 {
        (self.requested_time - self.song_start_time).max(0.0) as i64
    }
}

/// A playable unit of audio with server-assigned identity and timing.
#[derive(Clone, Debug, PartialEq)]
pub struct Track {
    pub id: SongId,
    pub title: String,
    pub artist: String,
    pub length_seconds: Option<u64>,
    pub file_size_bytes: Option<u64>,
    pub source_url: String,
    pub timing: TrackTiming,
}

impl Track {
    /// Build a track from song metadata and the playlist state that made it current.
    pub fn from_song(info: SongInfo, state: &PlaylistState) -> Self {
        Self {
            id: info.id,
            title: info.title,
            artist: info.artist,
            length_seconds: info.length,
            file_size_bytes: info.filesize,
            source_url: info.youtube_url,
            timing: TrackTiming {
                song_start_time: state.song_start_time,
                requested_time: state.requested_time,
            },
        }
    }

    /// Human-readable label used in logs.
    pub fn label(&self) -> String {
        format!("{} - {}", self.artist, self.title)
    }
}

/// A track whose raw media is being downloaded and can already be streamed.
#[derive(Clone, Debug)]
pub struct StreamingTrack {
    pub track: Track,
    /// Seconds the downloader had been running when streaming became possible.
    pub local_elapsed_seconds: f64,
    /// Raw downloaded media file.
    pub local_file_path: PathBuf,
    /// Write progress of `local_file_path`, followed by the transcoder.
    pub spool: SpoolProgress,
}

/// What the orchestrator is asked to play.
#[derive(Clone, Debug)]
pub enum PlayableTrack {
    /// Metadata only; played from the cache.
    Raw(Track),
    /// Downloaded locally and possibly decoding right now.
    Streaming(StreamingTrack),
}

impl PlayableTrack {
    pub fn track(&self) -> &Track {
        match self {
            PlayableTrack::Raw(track) => track,
            PlayableTrack::Streaming(streaming) => &streaming.track,
        }
    }

    fn local_elapsed_seconds(&self) -> f64 {
        match self {
            PlayableTrack::Raw(_) => 0.0,
            PlayableTrack::Streaming(streaming) => streaming.local_elapsed_seconds,
        }
    }

    /// Seek position (seconds) that lines local playback up with the server.
    pub fn start_offset(&self) -> i64 {
        playback_offset(&self.track().timing, self.local_elapsed_seconds())
    }
}

/// Server offset plus local download latency, in whole seconds.
pub fn playback_offset(timing: &TrackTiming, local_elapsed_seconds: f64) -> i64 {
    timing.server_offset() + local_elapsed_seconds.max(0.0) as i64
}
