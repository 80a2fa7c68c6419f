//! Sync loop: follow the remote "now playing" state.
//!
//! Each tick starts playback of a newly current track (fetching and decoding
//! it first unless cached), then pings the server; when the server has moved
//! on, playback is muted, the orchestrator is told the song ended, and the
//! next track is loaded for the following tick.

use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use std::thread;
use std::time::{Duration, Instant};

use anyhow::{Result, bail};
use crossbeam_channel::RecvTimeoutError;

use media_pipeline::orchestrator::OrchestratorHandle;
use media_pipeline::track::{PlayableTrack, StreamingTrack, Track, playback_offset};
use playlist_types::SongId;

use crate::config::ClientConfig;
use crate::downloader::{DownloadEvent, FetchHandle, MediaFetcher};

const SLEEP_SLICE: Duration = Duration::from_millis(100);

/// Remote view of the playlist.
pub trait PlaylistSource {
    /// Id of the song currently playing on the server.
    fn ping_current_song(&mut self) -> Result<Option<SongId>>;
    /// Current song with metadata; refreshed only when the id changed.
    fn update_current_song(&mut self) -> Result<Option<Track>>;
}

#[derive(Clone, Debug)]
pub struct SyncOptions {
    pub poll_interval: Duration,
    pub stream_start_timeout: Duration,
}

impl From<&ClientConfig> for SyncOptions {
    fn from(config: &ClientConfig) -> Self {
        Self {
            poll_interval: config.poll_interval,
            stream_start_timeout: config.stream_start_timeout,
        }
    }
}

pub struct SyncLoop<P, F> {
    source: P,
    fetcher: F,
    orchestrator: OrchestratorHandle,
    options: SyncOptions,
    keep_alive: Arc<AtomicBool>,
    current: Option<Track>,
    last_played: Option<SongId>,
}

impl<P: PlaylistSource, F: MediaFetcher> SyncLoop<P, F> {
    pub fn new(
        source: P,
        fetcher: F,
        orchestrator: OrchestratorHandle,
        options: SyncOptions,
        keep_alive: Arc<AtomicBool>,
    ) -> Self {
        Self {
            source,
            fetcher,
            orchestrator,
            options,
            keep_alive,
            current: None,
            last_played: None,
        }
    }

    /// Run until the keep-alive flag is cleared.
    pub fn run(&mut self) {
        tracing::info!("getting current track");
        self.refresh();
        while self.keep_alive.load(Ordering::Relaxed) {
            self.tick();
            self.sleep_while_alive(self.options.poll_interval);
        }
        tracing::info!("sync loop stopped");
    }

    /// Id of the track most recently started (or dropped).
    pub fn last_played(&self) -> Option<SongId> {
        self.last_played
    }

    pub fn tick(&mut self) {
        if let Some(track) = self.current.clone() {
            if self.last_played != Some(track.id) {
                self.start_track(track);
            }
        }

        match self.source.ping_current_song() {
            Ok(id) if id != self.last_played => self.advance(),
            Ok(_) => {}
            Err(e) => tracing::warn!("playlist ping failed, skipping tick: {e:#}"),
        }
    }

    fn advance(&mut self) {
        tracing::info!("getting next track");
        match self.orchestrator.position_seconds() {
            Ok(Some(position)) => tracing::debug!(position, "leaving track"),
            Ok(None) => {}
            Err(e) => tracing::warn!("orchestrator unavailable: {e:#}"),
        }
        if let Err(e) = self.orchestrator.mute() {
            tracing::warn!("mute failed: {e:#}");
        }
        if let Err(e) = self.orchestrator.song_end() {
            tracing::warn!("song end failed: {e:#}");
        }
        self.refresh();
        if self.current.is_none() {
            self.last_played = None;
        }
    }

    fn refresh(&mut self) {
        match self.source.update_current_song() {
            Ok(track) => self.current = track,
            Err(e) => tracing::warn!("playlist update failed: {e:#}"),
        }
    }

    fn start_track(&mut self, track: Track) {
        // Marked up front so a failing track is dropped instead of retried every tick.
        self.last_played = Some(track.id);
        let label = track.label();
        let result = match self.orchestrator.is_cached(&track) {
            Ok(true) => {
                tracing::info!(track = %label, "playing song from cache");
                self.orchestrator
                    .play(PlayableTrack::Raw(track))
                    .map(|_| ())
            }
            Ok(false) => {
                tracing::info!(track = %label, "song not in cache, getting stream");
                self.stream_track(track)
            }
            Err(e) => Err(e),
        };
        if let Err(e) = result {
            tracing::warn!(track = %label, "dropping track: {e:#}");
        }
    }

    fn stream_track(&mut self, track: Track) -> Result<()> {
        if self.orchestrator.release(&track)? {
            tracing::info!(track = %track.label(), "stopped earlier decode of this track");
        }
        let fetch = self.fetcher.fetch(&track)?;
        let (filename, elapsed) = match self.wait_for_stream(&fetch) {
            Ok(started) => started,
            Err(e) => {
                fetch.cancel();
                return Err(e);
            }
        };
        let streaming = StreamingTrack {
            track,
            local_elapsed_seconds: elapsed,
            local_file_path: filename,
            spool: fetch.spool.clone(),
        };
        let offset = playback_offset(&streaming.track.timing, streaming.local_elapsed_seconds);
        tracing::info!(track = %streaming.track.label(), offset, "decoding stream");
        if let Err(e) = self.orchestrator.decode(streaming.clone()) {
            // No decode owns the raw media, so nothing else would reclaim it.
            fetch.cancel();
            discard_download(&streaming.local_file_path);
            return Err(e);
        }
        // From here the decode deletes the raw media once it exits.
        self.orchestrator.play(PlayableTrack::Streaming(streaming))?;
        Ok(())
    }

    fn wait_for_stream(&self, fetch: &FetchHandle) -> Result<(PathBuf, f64)> {
        let deadline = Instant::now() + self.options.stream_start_timeout;
        loop {
            if !self.keep_alive.load(Ordering::Relaxed) {
                bail!("shutting down");
            }
            let remaining = deadline.saturating_duration_since(Instant::now());
            if remaining.is_zero() {
                bail!(
                    "download did not start within {:?}",
                    self.options.stream_start_timeout
                );
            }
            match fetch.events.recv_timeout(remaining.min(SLEEP_SLICE)) {
                Ok(DownloadEvent::StreamStarted { filename, elapsed })
                | Ok(DownloadEvent::Finished { filename, elapsed }) => {
                    return Ok((filename, elapsed));
                }
                Ok(DownloadEvent::Failed { reason }) => bail!("download failed: {reason}"),
                Err(RecvTimeoutError::Timeout) => {}
                Err(RecvTimeoutError::Disconnected) => bail!("downloader ended without media"),
            }
        }
    }

    fn sleep_while_alive(&self, total: Duration) {
        let deadline = Instant::now() + total;
        while self.keep_alive.load(Ordering::Relaxed) {
            let now = Instant::now();
            if now >= deadline {
                break;
            }
            thread::sleep((deadline - now).min(SLEEP_SLICE));
        }
    }
}

fn discard_download(path: &Path) {
    match std::fs::remove_file(path) {
        Ok(()) => tracing::debug!(path = %path.display(), "discarded download"),
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => {}
        Err(e) => tracing::warn!(path = %path.display(), "remove download failed: {e}"),
    }
}
