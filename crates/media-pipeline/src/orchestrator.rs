//! Pipeline orchestrator.
//!
//! [`AudioManager`] decides per track between live decode-and-play and cache
//! playback, owns the active transcode and player session, and keeps a backlog
//! of superseded transcodes running until they publish their cache artifact.
//!
//! All state lives on one worker thread; callers talk to it through an
//! [`OrchestratorHandle`], so play/song-end ordering is the channel order.

use std::io;
use std::path::Path;
use std::thread;
use std::time::Duration;

use anyhow::{Context, Result, anyhow, bail};
use crossbeam_channel::{Receiver, Sender};

use crate::cache::CacheStore;
use crate::config::PipelineConfig;
use crate::control_pipe::PipeRotation;
use crate::player::{PlayerInput, PlayerSession};
use crate::status::{OrchestratorStatus, PlaybackMode};
use crate::track::{PlayableTrack, StreamingTrack, Track};
use crate::transcode::{DecodeTask, LiveStream, TranscodeInput};

/// How long a superseded decode may take to wind down.
const SUPERSEDE_TIMEOUT: Duration = Duration::from_secs(5);

struct ActiveDecode {
    task: DecodeTask,
    /// Taken by the first live play of this track.
    live: Option<LiveStream>,
}

/// Playback state machine; see the module docs.
pub struct AudioManager {
    config: PipelineConfig,
    cache: CacheStore,
    pipes: PipeRotation,
    current_track: Option<Track>,
    mode: Option<PlaybackMode>,
    active: Option<ActiveDecode>,
    session: Option<PlayerSession>,
    backlog: Vec<DecodeTask>,
}

impl AudioManager {
    pub fn new(config: PipelineConfig) -> Self {
        Self {
            cache: CacheStore::new(&config.cache_dir),
            pipes: PipeRotation::new(&config.control_pipe),
            config,
            current_track: None,
            mode: None,
            active: None,
            session: None,
            backlog: Vec::new(),
        }
    }

    pub fn cache(&self) -> &CacheStore {
        &self.cache
    }

    /// Start a dual-output transcode of the downloaded media into the cache.
    ///
    /// A parked decode writing the same cache artifact is stopped first; one
    /// still reading this very input is left alone and the call fails.
    pub fn decode(&mut self, track: &StreamingTrack) -> Result<()> {
        self.cache.ensure_dir()?;
        let output = self.cache.path_for(&track.track);
        if let Some(previous) = self.active.take() {
            self.retire(previous);
        }
        self.reclaim_backlog();
        if let Some(busy) = self.backlog.iter().find(|task| {
            task.output_path() == output && task.input_path() == track.local_file_path
        }) {
            bail!(
                "{} is still being decoded from {}",
                track.track.label(),
                busy.input_path().display()
            );
        }
        self.stop_writers_of(&output)?;
        let input = TranscodeInput::Spool {
            path: track.local_file_path.clone(),
            progress: track.spool.clone(),
        };
        let (live, task) = DecodeTask::start_dual_output(&self.config.transcoder, input, &output)
            .with_context(|| format!("decode {}", track.track.label()))?;
        self.active = Some(ActiveDecode {
            task,
            live: Some(live),
        });
        Ok(())
    }

    /// Replace whatever is playing with `playable`, live if its decode is
    /// running, from the cache otherwise.
    pub fn play(&mut self, playable: PlayableTrack) -> Result<PlaybackMode> {
        if let Some(mut session) = self.session.take() {
            session.stop();
        }
        self.mode = None;

        let track = playable.track().clone();
        let offset = playable.start_offset();
        let cache_path = self.cache.path_for(&track);

        let (session, mode) = match self.take_live_stream(&cache_path) {
            Some(live) => {
                let pipe = self.pipes.next_path()?;
                let session = PlayerSession::start(
                    &self.config.player,
                    &pipe,
                    PlayerInput::Stream(Box::new(live)),
                    Some(offset),
                )?;
                (session, PlaybackMode::Live)
            }
            None if self.cache.exists(&track) => {
                let pipe = self.pipes.next_path()?;
                let mut session =
                    PlayerSession::start(&self.config.player, &pipe, PlayerInput::Idle, None)?;
                session.wait_until_ready(self.config.player.ready_timeout)?;
                session.play(&cache_path, offset);
                (session, PlaybackMode::Cache)
            }
            None => bail!("{} is neither decoding nor cached", track.label()),
        };

        tracing::info!(track = %track.label(), offset, %mode, "playing");
        self.session = Some(session);
        self.current_track = Some(track);
        self.mode = Some(mode);
        Ok(mode)
    }

    fn take_live_stream(&mut self, cache_path: &Path) -> Option<LiveStream> {
        let active = self.active.as_mut()?;
        if active.task.is_running() && active.task.output_path() == cache_path {
            active.live.take()
        } else {
            None
        }
    }

    /// The remote track advanced: park a still-running decode in the backlog.
    pub fn song_end(&mut self) {
        self.reclaim_backlog();
        if let Some(active) = self.active.take() {
            self.retire(active);
        }
    }

    /// Stop any decode still writing `track`'s cache artifact.
    ///
    /// Returns whether one was stopped. Call before fetching the track again,
    /// so the old decode's input cleanup cannot hit the new download.
    pub fn release(&mut self, track: &Track) -> Result<bool> {
        let output = self.cache.path_for(track);
        let active = self
            .active
            .take_if(|a| a.task.output_path() == output && !a.task.is_finished());
        if let Some(active) = &active {
            stop_and_wait(&active.task)?;
        }
        self.reclaim_backlog();
        Ok(self.stop_writers_of(&output)? || active.is_some())
    }

    /// Stop backlog tasks targeting `output` and wait until none can still rename.
    fn stop_writers_of(&mut self, output: &Path) -> Result<bool> {
        let (writers, others): (Vec<_>, Vec<_>) = std::mem::take(&mut self.backlog)
            .into_iter()
            .partition(|task| task.output_path() == output);
        self.backlog = others;
        let mut result = Ok(!writers.is_empty());
        for task in &writers {
            tracing::info!(output = %output.display(), "superseding parked decode");
            if let Err(e) = stop_and_wait(task) {
                result = Err(e);
            }
        }
        result
    }

    /// Kill every transcode and the player. Used on shutdown.
    pub fn stop_all(&mut self) {
        self.reclaim_backlog();
        for task in self.backlog.drain(..) {
            task.stop();
        }
        if let Some(active) = self.active.take() {
            active.task.stop();
        }
        if let Some(mut session) = self.session.take() {
            session.stop();
        }
        self.mode = None;
    }

    pub fn mute(&mut self) {
        if let Some(session) = self.session.as_mut() {
            session.mute();
        }
    }

    pub fn is_decoding(&self) -> bool {
        self.active.as_ref().is_some_and(|a| a.task.is_running())
    }

    pub fn is_cached(&self, track: &Track) -> bool {
        self.cache.exists(track)
    }

    pub fn position_seconds(&mut self) -> Option<f64> {
        self.session.as_mut()?.position_seconds()
    }

    pub fn percent(&mut self) -> Option<u32> {
        self.session.as_mut()?.percent()
    }

    pub fn status(&mut self) -> OrchestratorStatus {
        let session_alive = self.session.as_mut().is_some_and(|s| s.is_alive());
        OrchestratorStatus {
            current_track: self.current_track.as_ref().map(Track::label),
            current_track_id: self.current_track.as_ref().map(|t| t.id),
            decoding: self.is_decoding(),
            backlog_len: self.backlog.len(),
            backlog_running: self.backlog.iter().filter(|t| t.is_running()).count(),
            session_alive,
            command_pipe: self.session.as_ref().map(|s| s.pipe_path().to_path_buf()),
            mode: self.mode,
        }
    }

    fn reclaim_backlog(&mut self) {
        let before = self.backlog.len();
        self.backlog.retain(|task| !task.is_finished());
        let reclaimed = before - self.backlog.len();
        if reclaimed > 0 {
            tracing::debug!(reclaimed, remaining = self.backlog.len(), "backlog reclaimed");
        }
    }

    fn retire(&mut self, active: ActiveDecode) {
        if let Some(mut live) = active.live {
            // Nobody will play it; keep the transcoder from stalling on stdout.
            thread::spawn(move || {
                if let Err(e) = io::copy(&mut live, &mut io::sink()) {
                    tracing::debug!("live stream drain ended: {e}");
                }
            });
        }
        if active.task.is_running() {
            tracing::info!(output = %active.task.output_path().display(), "decode moved to backlog");
            self.backlog.push(active.task);
        }
    }
}

/// Stop `task` and wait for its watcher, so it no longer touches its `.part` file.
fn stop_and_wait(task: &DecodeTask) -> Result<()> {
    task.stop();
    let state = task.wait(SUPERSEDE_TIMEOUT);
    if !state.is_terminal() {
        bail!(
            "decode of {} did not stop within {:?}",
            task.output_path().display(),
            SUPERSEDE_TIMEOUT
        );
    }
    Ok(())
}

impl Drop for AudioManager {
    fn drop(&mut self) {
        self.stop_all();
    }
}

enum OrchestratorCommand {
    Decode {
        track: StreamingTrack,
        reply: Sender<Result<()>>,
    },
    Play {
        track: PlayableTrack,
        reply: Sender<Result<PlaybackMode>>,
    },
    SongEnd {
        reply: Sender<()>,
    },
    Mute {
        reply: Sender<()>,
    },
    StopAll {
        reply: Sender<()>,
    },
    Release {
        track: Track,
        reply: Sender<Result<bool>>,
    },
    IsDecoding {
        reply: Sender<bool>,
    },
    IsCached {
        track: Track,
        reply: Sender<bool>,
    },
    Position {
        reply: Sender<Option<f64>>,
    },
    Percent {
        reply: Sender<Option<u32>>,
    },
    Status {
        reply: Sender<OrchestratorStatus>,
    },
    Shutdown {
        reply: Sender<()>,
    },
}

/// Cloneable front-end of the orchestrator thread.
#[derive(Clone)]
pub struct OrchestratorHandle {
    cmd_tx: Sender<OrchestratorCommand>,
}

/// Spawn the orchestrator thread.
pub fn spawn_orchestrator(config: PipelineConfig) -> Result<OrchestratorHandle> {
    let (cmd_tx, cmd_rx) = crossbeam_channel::unbounded();
    thread::Builder::new()
        .name("orchestrator".to_string())
        .spawn(move || orchestrator_thread_main(AudioManager::new(config), cmd_rx))
        .context("spawn orchestrator thread")?;
    Ok(OrchestratorHandle { cmd_tx })
}

fn orchestrator_thread_main(mut manager: AudioManager, cmd_rx: Receiver<OrchestratorCommand>) {
    while let Ok(cmd) = cmd_rx.recv() {
        match cmd {
            OrchestratorCommand::Decode { track, reply } => {
                let _ = reply.send(manager.decode(&track));
            }
            OrchestratorCommand::Play { track, reply } => {
                let _ = reply.send(manager.play(track));
            }
            OrchestratorCommand::SongEnd { reply } => {
                manager.song_end();
                let _ = reply.send(());
            }
            OrchestratorCommand::Mute { reply } => {
                manager.mute();
                let _ = reply.send(());
            }
            OrchestratorCommand::StopAll { reply } => {
                manager.stop_all();
                let _ = reply.send(());
            }
            OrchestratorCommand::Release { track, reply } => {
                let _ = reply.send(manager.release(&track));
            }
            OrchestratorCommand::IsDecoding { reply } => {
                let _ = reply.send(manager.is_decoding());
            }
            OrchestratorCommand::IsCached { track, reply } => {
                let _ = reply.send(manager.is_cached(&track));
            }
            OrchestratorCommand::Position { reply } => {
                let _ = reply.send(manager.position_seconds());
            }
            OrchestratorCommand::Percent { reply } => {
                let _ = reply.send(manager.percent());
            }
            OrchestratorCommand::Status { reply } => {
                let _ = reply.send(manager.status());
            }
            OrchestratorCommand::Shutdown { reply } => {
                manager.stop_all();
                let _ = reply.send(());
                break;
            }
        }
    }
    manager.stop_all();
    tracing::debug!("orchestrator thread exiting");
}

impl OrchestratorHandle {
    fn request<T>(&self, build: impl FnOnce(Sender<T>) -> OrchestratorCommand) -> Result<T> {
        let (reply_tx, reply_rx) = crossbeam_channel::bounded(1);
        self.cmd_tx
            .send(build(reply_tx))
            .map_err(|_| anyhow!("orchestrator stopped"))?;
        reply_rx.recv().map_err(|_| anyhow!("orchestrator stopped"))
    }

    pub fn decode(&self, track: StreamingTrack) -> Result<()> {
        self.request(|reply| OrchestratorCommand::Decode { track, reply })?
    }

    pub fn play(&self, track: PlayableTrack) -> Result<PlaybackMode> {
        self.request(|reply| OrchestratorCommand::Play { track, reply })?
    }

    pub fn song_end(&self) -> Result<()> {
        self.request(|reply| OrchestratorCommand::SongEnd { reply })
    }

    pub fn mute(&self) -> Result<()> {
        self.request(|reply| OrchestratorCommand::Mute { reply })
    }

    pub fn stop_all(&self) -> Result<()> {
        self.request(|reply| OrchestratorCommand::StopAll { reply })
    }

    pub fn release(&self, track: &Track) -> Result<bool> {
        let track = track.clone();
        self.request(|reply| OrchestratorCommand::Release { track, reply })?
    }

    pub fn is_decoding(&self) -> Result<bool> {
        self.request(|reply| OrchestratorCommand::IsDecoding { reply })
    }

    pub fn is_cached(&self, track: &Track) -> Result<bool> {
        let track = track.clone();
        self.request(|reply| OrchestratorCommand::IsCached { track, reply })
    }

    pub fn position_seconds(&self) -> Result<Option<f64>> {
        self.request(|reply| OrchestratorCommand::Position { reply })
    }

    pub fn percent(&self) -> Result<Option<u32>> {
        self.request(|reply| OrchestratorCommand::Percent { reply })
    }

    pub fn status(&self) -> Result<OrchestratorStatus> {
        self.request(|reply| OrchestratorCommand::Status { reply })
    }

    /// Stop everything and end the orchestrator thread.
    pub fn shutdown(&self) -> Result<()> {
        self.request(|reply| OrchestratorCommand::Shutdown { reply })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::spool::SpoolProgress;
    use crate::test_support::{
        hanging_transcoder, lingering_transcoder, ok_transcoder, pipeline_config, player_args,
        player_log, sample_track, scratch_dir, stub_player, wait_until,
    };

    const WAIT: Duration = Duration::from_secs(10);

    fn downloaded(root: &Path, track: Track) -> StreamingTrack {
        let name = format!("raw-{}.webm", track.id);
        downloaded_as(root, track, &name, b"downloaded media")
    }

    fn downloaded_as(root: &Path, track: Track, name: &str, bytes: &[u8]) -> StreamingTrack {
        let raw = root.join(name);
        std::fs::write(&raw, bytes).unwrap();
        StreamingTrack {
            track,
            local_elapsed_seconds: 0.0,
            local_file_path: raw,
            spool: SpoolProgress::completed(bytes.len() as u64),
        }
    }

    fn pid_alive(pid: u32) -> bool {
        // SAFETY: signal 0 only checks for existence.
        unsafe { libc::kill(pid as libc::pid_t, 0) == 0 }
    }

    #[test]
    fn song_end_moves_running_decode_to_backlog_and_stop_all_kills_it() {
        let root = scratch_dir("orch-backlog");
        let config = pipeline_config(&root, hanging_transcoder(&root), stub_player(&root));
        let mut manager = AudioManager::new(config);
        let streaming = downloaded(&root, sample_track(1, "Band", "Song"));
        let raw = streaming.local_file_path.clone();

        manager.decode(&streaming).unwrap();
        assert!(manager.is_decoding());

        manager.song_end();
        let status = manager.status();
        assert!(!status.decoding);
        assert_eq!(status.backlog_len, 1);
        assert_eq!(status.backlog_running, 1);

        manager.stop_all();
        assert_eq!(manager.status().backlog_len, 0);
        assert!(wait_until(WAIT, || !raw.exists()));
        assert!(!manager.is_cached(&streaming.track));
    }

    #[test]
    fn finished_backlog_entries_are_reclaimed() {
        let root = scratch_dir("orch-reclaim");
        let config = pipeline_config(&root, hanging_transcoder(&root), stub_player(&root));
        let mut manager = AudioManager::new(config);
        manager
            .decode(&downloaded(&root, sample_track(1, "Band", "One")))
            .unwrap();
        manager
            .decode(&downloaded(&root, sample_track(2, "Band", "Two")))
            .unwrap();
        assert_eq!(manager.status().backlog_len, 1);

        for task in &manager.backlog {
            task.stop();
        }
        assert!(wait_until(WAIT, || manager.backlog.iter().all(|t| t.is_finished())));
        manager.song_end();
        let status = manager.status();
        assert_eq!(status.backlog_len, 1);
        assert_eq!(status.backlog_running, 1);
    }

    #[test]
    fn redecode_supersedes_parked_decode_of_same_track() {
        let root = scratch_dir("orch-redecode");
        let config = pipeline_config(&root, lingering_transcoder(&root, 1), stub_player(&root));
        let mut manager = AudioManager::new(config);
        let track = sample_track(1, "Band", "Song");
        let first = downloaded_as(&root, track.clone(), "first.webm", b"first download");
        let first_raw = first.local_file_path.clone();

        manager.decode(&first).unwrap();
        manager.song_end();
        assert_eq!(manager.status().backlog_running, 1);

        let second = downloaded_as(&root, track.clone(), "second.webm", b"second download");
        manager.decode(&second).unwrap();
        let status = manager.status();
        assert_eq!(status.backlog_len, 0);
        assert!(status.decoding);
        assert!(!first_raw.exists());

        assert!(wait_until(WAIT, || manager.is_cached(&track) && !manager.is_decoding()));
        assert_eq!(
            std::fs::read(manager.cache().path_for(&track)).unwrap(),
            b"second download"
        );
    }

    #[test]
    fn redecode_from_input_still_in_use_is_refused() {
        let root = scratch_dir("orch-same-input");
        let config = pipeline_config(&root, hanging_transcoder(&root), stub_player(&root));
        let mut manager = AudioManager::new(config);
        let streaming = downloaded(&root, sample_track(1, "Band", "Song"));

        manager.decode(&streaming).unwrap();
        manager.song_end();
        let err = manager.decode(&streaming).unwrap_err();
        assert!(err.to_string().contains("still being decoded"));
        assert_eq!(manager.status().backlog_running, 1);
        assert!(!manager.is_decoding());
        manager.stop_all();
    }

    #[test]
    fn release_stops_parked_decode_of_track() {
        let root = scratch_dir("orch-release");
        let config = pipeline_config(&root, hanging_transcoder(&root), stub_player(&root));
        let mut manager = AudioManager::new(config);
        let track = sample_track(1, "Band", "Song");
        let other = downloaded(&root, sample_track(2, "Band", "Other"));
        let streaming = downloaded(&root, track.clone());
        let raw = streaming.local_file_path.clone();

        manager.decode(&other).unwrap();
        manager.decode(&streaming).unwrap();
        manager.song_end();
        assert_eq!(manager.status().backlog_len, 2);

        assert!(manager.release(&track).unwrap());
        assert_eq!(manager.status().backlog_len, 1);
        assert!(!raw.exists());
        assert!(!manager.is_cached(&track));
        assert!(!manager.release(&track).unwrap());
        manager.stop_all();
    }

    #[test]
    fn consecutive_plays_rotate_pipes_and_stop_previous_session() {
        let root = scratch_dir("orch-rotate");
        let config = pipeline_config(&root, ok_transcoder(&root), stub_player(&root));
        let mut manager = AudioManager::new(config);
        let track = sample_track(1, "Band", "Song");
        manager.cache().ensure_dir().unwrap();
        std::fs::write(manager.cache().path_for(&track), b"cached").unwrap();

        let mode = manager.play(PlayableTrack::Raw(track.clone())).unwrap();
        assert_eq!(mode, PlaybackMode::Cache);
        let first_pipe = manager.status().command_pipe.unwrap();
        let first_pid = manager.session.as_ref().map(|s| s.id()).unwrap();
        assert!(wait_until(WAIT, || player_log(&first_pipe)
            .contains(&"seek 30 2".to_string())));
        assert_eq!(
            player_log(&first_pipe)[0],
            format!("loadfile \"{}\"", manager.cache().path_for(&track).display())
        );

        manager.play(PlayableTrack::Raw(track)).unwrap();
        let status = manager.status();
        let second_pipe = status.command_pipe.unwrap();
        assert_ne!(first_pipe, second_pipe);
        assert!(status.session_alive);
        assert!(!pid_alive(first_pid));
    }

    #[test]
    fn decoding_track_plays_live_then_replays_from_cache() {
        let root = scratch_dir("orch-live");
        let config = pipeline_config(&root, lingering_transcoder(&root, 2), stub_player(&root));
        let mut manager = AudioManager::new(config);
        let track = sample_track(1, "Band", "Song");
        let streaming = downloaded(&root, track.clone());

        manager.decode(&streaming).unwrap();
        let mode = manager.play(PlayableTrack::Streaming(streaming)).unwrap();
        assert_eq!(mode, PlaybackMode::Live);
        let pipe = manager.status().command_pipe.unwrap();
        assert!(wait_until(WAIT, || !player_args(&pipe).is_empty()));
        let args = player_args(&pipe);
        assert!(args.windows(2).any(|w| w == ["-ss", "30"]));
        assert_eq!(args.last().map(String::as_str), Some("-"));

        assert!(wait_until(WAIT, || manager.is_cached(&track) && !manager.is_decoding()));
        manager.song_end();
        let mode = manager.play(PlayableTrack::Raw(track)).unwrap();
        assert_eq!(mode, PlaybackMode::Cache);
        let status = manager.status();
        assert!(!status.decoding);
        assert_eq!(status.backlog_len, 0);
    }

    #[test]
    fn play_without_decode_or_cache_fails_and_mute_is_noop() {
        let root = scratch_dir("orch-nothing");
        let config = pipeline_config(&root, ok_transcoder(&root), stub_player(&root));
        let mut manager = AudioManager::new(config);
        manager.mute();
        let err = manager
            .play(PlayableTrack::Raw(sample_track(1, "Band", "Song")))
            .unwrap_err();
        assert!(err.to_string().contains("neither decoding nor cached"));
        assert!(manager.status().current_track.is_none());
    }

    #[test]
    fn handle_round_trips_and_shuts_down() {
        let root = scratch_dir("orch-handle");
        let config = pipeline_config(&root, ok_transcoder(&root), stub_player(&root));
        let handle = spawn_orchestrator(config).unwrap();
        let track = sample_track(1, "Band", "Song");

        assert!(!handle.is_cached(&track).unwrap());
        assert!(!handle.is_decoding().unwrap());
        assert_eq!(handle.position_seconds().unwrap(), None);
        handle.mute().unwrap();
        handle.song_end().unwrap();
        assert!(!handle.release(&track).unwrap());
        assert!(handle.play(PlayableTrack::Raw(track)).is_err());
        assert_eq!(handle.status().unwrap().backlog_len, 0);

        handle.shutdown().unwrap();
        assert!(handle.status().is_err());
    }
}
