//! Transcode pipeline: one transcoder process per track.
//!
//! The process reads the raw download on stdin and writes the cache artifact to
//! `<output>.part`; in dual-output mode it also writes the same encoded bytes
//! to stdout as a live stream. A watcher thread per task:
//! - renames `<output>.part` to `<output>` on exit code 0,
//! - leaves the `.part` file behind otherwise,
//! - always deletes the raw input file.

use std::fs::File;
use std::io;
use std::path::{Path, PathBuf};
use std::process::{Child, ChildStdout, Command, Stdio};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Condvar, Mutex, MutexGuard};
use std::thread;
use std::time::{Duration, Instant};

use anyhow::{Context, Result};

use crate::cache::part_path;
use crate::config::TranscoderConfig;
use crate::spool::{SpoolProgress, SpoolReader};

/// How often the watcher checks whether the transcoder exited.
const WATCH_INTERVAL: Duration = Duration::from_millis(50);

/// Live encoded stream of a transcode in progress.
pub type LiveStream = ChildStdout;

/// Lifecycle of a decode task.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum DecodeState {
    Pending,
    Running,
    Finished,
    Failed,
}

impl DecodeState {
    pub fn is_terminal(self) -> bool {
        matches!(self, DecodeState::Finished | DecodeState::Failed)
    }
}

/// Where the transcoder reads raw media from.
#[derive(Clone, Debug)]
pub enum TranscodeInput {
    /// A complete file.
    File(PathBuf),
    /// A file the downloader is still appending to.
    Spool { path: PathBuf, progress: SpoolProgress },
}

impl TranscodeInput {
    pub fn path(&self) -> &Path {
        match self {
            TranscodeInput::File(path) => path,
            TranscodeInput::Spool { path, .. } => path,
        }
    }
}

struct TaskShared {
    state: Mutex<DecodeState>,
    state_cv: Condvar,
    child: Mutex<Child>,
    /// Set by `stop()`; also unblocks the spool feed.
    stopped: Arc<AtomicBool>,
}

impl TaskShared {
    fn state(&self) -> MutexGuard<'_, DecodeState> {
        self.state.lock().unwrap_or_else(|e| e.into_inner())
    }

    fn set_state(&self, state: DecodeState) {
        *self.state() = state;
        self.state_cv.notify_all();
    }
}

/// Handle to one running transcode.
pub struct DecodeTask {
    input: PathBuf,
    output: PathBuf,
    shared: Arc<TaskShared>,
}

impl DecodeTask {
    /// Start a transcode producing both the cache artifact and a live stream.
    pub fn start_dual_output(
        config: &TranscoderConfig,
        input: TranscodeInput,
        output: &Path,
    ) -> Result<(LiveStream, DecodeTask)> {
        let (task, live) = Self::start(config, input, output, true)?;
        let live = live.context("transcoder stdout was not captured")?;
        Ok((live, task))
    }

    /// Start a transcode producing only the cache artifact.
    pub fn start_cache_only(
        config: &TranscoderConfig,
        input: TranscodeInput,
        output: &Path,
    ) -> Result<DecodeTask> {
        let (task, _) = Self::start(config, input, output, false)?;
        Ok(task)
    }

    fn start(
        config: &TranscoderConfig,
        input: TranscodeInput,
        output: &Path,
        live: bool,
    ) -> Result<(DecodeTask, Option<LiveStream>)> {
        let part = part_path(output);
        let args = transcoder_args(config, &part, live);
        let stopped = Arc::new(AtomicBool::new(false));

        let mut cmd = Command::new(&config.program);
        cmd.args(&args)
            .stdout(if live { Stdio::piped() } else { Stdio::null() })
            .stderr(if config.debug_output {
                Stdio::inherit()
            } else {
                Stdio::null()
            });
        let spool_feed = match &input {
            TranscodeInput::File(path) => {
                let file =
                    File::open(path).with_context(|| format!("open transcode input {:?}", path))?;
                cmd.stdin(Stdio::from(file));
                None
            }
            TranscodeInput::Spool { path, progress } => {
                let file =
                    File::open(path).with_context(|| format!("open transcode input {:?}", path))?;
                cmd.stdin(Stdio::piped());
                Some(SpoolReader::new(file, progress.clone(), stopped.clone()))
            }
        };

        tracing::debug!(program = %config.program.display(), ?args, "spawning transcoder");
        let mut child = cmd
            .spawn()
            .with_context(|| format!("spawn transcoder {:?}", config.program))?;
        let live_stream = child.stdout.take();
        if let (Some(mut reader), Some(mut stdin)) = (spool_feed, child.stdin.take()) {
            thread::spawn(move || {
                // Dropping stdin at the end signals EOF to the transcoder.
                if let Err(e) = io::copy(&mut reader, &mut stdin) {
                    tracing::debug!("transcoder feed ended early: {e}");
                }
            });
        }

        let shared = Arc::new(TaskShared {
            state: Mutex::new(DecodeState::Running),
            state_cv: Condvar::new(),
            child: Mutex::new(child),
            stopped,
        });
        let task = DecodeTask {
            input: input.path().to_path_buf(),
            output: output.to_path_buf(),
            shared: shared.clone(),
        };
        tracing::info!(output = %output.display(), live, "transcode started");

        let input_path = task.input.clone();
        let output_path = task.output.clone();
        thread::spawn(move || watch_transcode(shared, input_path, output_path, part));

        Ok((task, live_stream))
    }

    pub fn input_path(&self) -> &Path {
        &self.input
    }

    pub fn output_path(&self) -> &Path {
        &self.output
    }

    pub fn state(&self) -> DecodeState {
        *self.shared.state()
    }

    pub fn is_running(&self) -> bool {
        self.state() == DecodeState::Running
    }

    pub fn is_finished(&self) -> bool {
        self.state().is_terminal()
    }

    /// Hard kill without draining; any `.part` artifact is left orphaned.
    pub fn stop(&self) {
        if self.is_finished() {
            return;
        }
        self.shared.stopped.store(true, Ordering::Relaxed);
        let mut child = self.shared.child.lock().unwrap_or_else(|e| e.into_inner());
        if let Err(e) = child.kill() {
            tracing::debug!("transcoder kill: {e}");
        }
        tracing::info!(output = %self.output.display(), "transcode stopped");
    }

    /// Wait for the watcher to finish, up to `timeout`; returns the state seen last.
    pub fn wait(&self, timeout: Duration) -> DecodeState {
        let deadline = Instant::now() + timeout;
        let mut state = self.shared.state();
        while !state.is_terminal() {
            let now = Instant::now();
            if now >= deadline {
                break;
            }
            state = match self.shared.state_cv.wait_timeout(state, deadline - now) {
                Ok((g, _)) => g,
                Err(e) => e.into_inner().0,
            };
        }
        *state
    }
}

impl std::fmt::Debug for DecodeTask {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("DecodeTask")
            .field("input", &self.input)
            .field("output", &self.output)
            .field("state", &self.state())
            .finish()
    }
}

/// Command line: `[extra] [-loglevel panic] -i - -f mp3 -y <part> [-f mp3 -]`.
fn transcoder_args(config: &TranscoderConfig, part: &Path, live: bool) -> Vec<String> {
    let mut args = config.extra_args.clone();
    if !config.debug_output {
        args.extend(["-loglevel", "panic"].map(String::from));
    }
    args.extend(["-i", "-", "-f", "mp3", "-y"].map(String::from));
    args.push(part.to_string_lossy().to_string());
    if live {
        args.extend(["-f", "mp3", "-"].map(String::from));
    }
    args
}

/// Block until the transcoder exits, then publish or discard and clean up.
fn watch_transcode(shared: Arc<TaskShared>, input: PathBuf, output: PathBuf, part: PathBuf) {
    let status = loop {
        let polled = {
            let mut child = shared.child.lock().unwrap_or_else(|e| e.into_inner());
            child.try_wait()
        };
        match polled {
            Ok(Some(status)) => break Some(status),
            Ok(None) => thread::sleep(WATCH_INTERVAL),
            Err(e) => {
                tracing::warn!(output = %output.display(), "transcoder wait failed: {e}");
                break None;
            }
        }
    };

    let stopped = shared.stopped.load(Ordering::Relaxed);
    let state = match status {
        Some(status) if status.success() && !stopped => match std::fs::rename(&part, &output) {
            Ok(()) => {
                tracing::info!(output = %output.display(), "cache artifact published");
                DecodeState::Finished
            }
            Err(e) => {
                tracing::warn!(output = %output.display(), "publish cache artifact failed: {e}");
                DecodeState::Failed
            }
        },
        Some(status) => {
            if !stopped {
                tracing::warn!(output = %output.display(), %status, "transcoder failed");
            }
            DecodeState::Failed
        }
        None => DecodeState::Failed,
    };

    match std::fs::remove_file(&input) {
        Ok(()) => {}
        Err(e) if e.kind() == io::ErrorKind::NotFound => {}
        Err(e) => tracing::warn!(input = %input.display(), "remove transcode input failed: {e}"),
    }
    shared.set_state(state);
}
