//! Player controller: one external player process per session.
//!
//! Commands go in through a named pipe; answers come back on the player's
//! stdout as lines containing [`ANSWER_SENTINEL`], usually `KEY=value`.

use std::io::{self, BufRead, BufReader, Read};
use std::path::{Path, PathBuf};
use std::process::{Child, ChildStdin, Command, Stdio};
use std::thread;
use std::time::{Duration, Instant};

use anyhow::{Context, Result, bail};
use crossbeam_channel::{Receiver, RecvTimeoutError};

use crate::config::PlayerConfig;
use crate::control_pipe;

/// Marker the player puts on every query answer.
pub const ANSWER_SENTINEL: &str = "ANS_";

const READY_BACKOFF_START: Duration = Duration::from_millis(5);
const READY_BACKOFF_MAX: Duration = Duration::from_millis(100);

/// What the player consumes when it starts.
pub enum PlayerInput {
    /// Start idle; media is loaded later with [`PlayerSession::play`].
    Idle,
    /// Play this byte stream from stdin.
    Stream(Box<dyn Read + Send>),
}

impl std::fmt::Debug for PlayerInput {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            PlayerInput::Idle => f.write_str("Idle"),
            PlayerInput::Stream(_) => f.write_str("Stream(..)"),
        }
    }
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum SessionState {
    Starting,
    Ready,
    Playing,
    Stopped,
}

/// A running player process bound to one command pipe path.
#[derive(Debug)]
pub struct PlayerSession {
    config: PlayerConfig,
    pipe: PathBuf,
    child: Child,
    state: SessionState,
    lines: Receiver<String>,
}

impl PlayerSession {
    /// Spawn the player reading commands from `pipe`.
    ///
    /// `seek` applies only to stream input; idle sessions seek via [`Self::play`].
    pub fn start(
        config: &PlayerConfig,
        pipe: &Path,
        input: PlayerInput,
        seek: Option<i64>,
    ) -> Result<Self> {
        let live = matches!(input, PlayerInput::Stream(_));
        let args = player_args(config, pipe, if live { seek } else { None }, live);

        let mut cmd = Command::new(&config.program);
        cmd.args(&args)
            .stdin(if live { Stdio::piped() } else { Stdio::null() })
            .stdout(Stdio::piped())
            .stderr(if config.debug_output {
                Stdio::inherit()
            } else {
                Stdio::null()
            });
        tracing::debug!(program = %config.program.display(), ?args, "spawning player");
        let mut child = cmd
            .spawn()
            .with_context(|| format!("spawn player {:?}", config.program))?;

        let (line_tx, lines) = crossbeam_channel::unbounded();
        if let Some(stdout) = child.stdout.take() {
            thread::spawn(move || {
                for line in BufReader::new(stdout).lines() {
                    let Ok(line) = line else { break };
                    if line_tx.send(line).is_err() {
                        break;
                    }
                }
            });
        }
        if let (PlayerInput::Stream(stream), Some(stdin)) = (input, child.stdin.take()) {
            thread::spawn(move || pump_live_input(stream, stdin));
        }

        tracing::info!(pid = child.id(), pipe = %pipe.display(), live, "player started");
        Ok(Self {
            config: config.clone(),
            pipe: pipe.to_path_buf(),
            child,
            state: if live {
                SessionState::Playing
            } else {
                SessionState::Starting
            },
            lines,
        })
    }

    pub fn pipe_path(&self) -> &Path {
        &self.pipe
    }

    pub fn id(&self) -> u32 {
        self.child.id()
    }

    pub fn state(&self) -> SessionState {
        self.state
    }

    pub fn is_alive(&mut self) -> bool {
        matches!(self.child.try_wait(), Ok(None))
    }

    /// Block until the player reads its command pipe, backing off between checks.
    pub fn wait_until_ready(&mut self, timeout: Duration) -> Result<()> {
        let deadline = Instant::now() + timeout;
        let mut backoff = READY_BACKOFF_START;
        loop {
            if !self.is_alive() {
                bail!("player exited before accepting commands");
            }
            if control_pipe::has_reader(&self.pipe) {
                if self.state == SessionState::Starting {
                    self.state = SessionState::Ready;
                }
                return Ok(());
            }
            if Instant::now() >= deadline {
                bail!("player not ready after {:?}", timeout);
            }
            thread::sleep(backoff);
            backoff = (backoff * 2).min(READY_BACKOFF_MAX);
        }
    }

    /// Write one command line. Dropped silently once the process has exited.
    pub fn send_command(&mut self, command: &str) -> bool {
        if !self.is_alive() {
            tracing::debug!(command, "player gone, command dropped");
            return false;
        }
        match control_pipe::write_command(&self.pipe, command) {
            Ok(true) => true,
            Ok(false) => {
                tracing::debug!(command, pipe = %self.pipe.display(), "no pipe reader, command dropped");
                false
            }
            Err(e) => {
                tracing::warn!(command, pipe = %self.pipe.display(), "command write failed: {e}");
                false
            }
        }
    }

    /// Send `command` and wait for a sentinel line.
    ///
    /// Gives up after `query_max_lines` non-matching lines or one line timeout.
    pub fn query(&mut self, command: &str) -> Option<String> {
        while self.lines.try_recv().is_ok() {}
        if !self.send_command(command) {
            return None;
        }
        for _ in 0..self.config.query_max_lines {
            match self.lines.recv_timeout(self.config.query_line_timeout) {
                Ok(line) => {
                    if line.contains(ANSWER_SENTINEL) {
                        return Some(answer_value(&line));
                    }
                }
                Err(RecvTimeoutError::Timeout) | Err(RecvTimeoutError::Disconnected) => {
                    return None;
                }
            }
        }
        tracing::debug!(command, "no answer within {} lines", self.config.query_max_lines);
        None
    }

    pub fn seek(&mut self, offset_seconds: i64) {
        self.send_command(&format!("seek {offset_seconds} 2"));
    }

    /// Load `path` and seek to `offset_seconds`.
    pub fn play(&mut self, path: &Path, offset_seconds: i64) {
        self.send_command(&format!("loadfile \"{}\"", path.display()));
        self.seek(offset_seconds);
        self.state = SessionState::Playing;
    }

    pub fn mute(&mut self) {
        self.send_command("mute");
    }

    pub fn position_seconds(&mut self) -> Option<f64> {
        self.query("get_time_pos")?.parse().ok()
    }

    pub fn percent(&mut self) -> Option<u32> {
        self.query("get_percent_pos")?.parse().ok()
    }

    /// Ask the player to quit, then kill it regardless.
    pub fn stop(&mut self) {
        if self.state == SessionState::Stopped {
            return;
        }
        self.send_command("quit");
        if let Err(e) = self.child.kill() {
            tracing::debug!("player kill: {e}");
        }
        if let Err(e) = self.child.wait() {
            tracing::debug!("player wait: {e}");
        }
        self.state = SessionState::Stopped;
        tracing::info!(pid = self.child.id(), "player stopped");
    }
}

impl Drop for PlayerSession {
    fn drop(&mut self) {
        self.stop();
    }
}

/// `[extra] -quiet -input file=<pipe> -idle -demuxer lavf -idx [-ss N] [-]`.
fn player_args(config: &PlayerConfig, pipe: &Path, seek: Option<i64>, live: bool) -> Vec<String> {
    let mut args = config.extra_args.clone();
    args.push("-quiet".to_string());
    args.push("-input".to_string());
    args.push(format!("file={}", pipe.display()));
    args.extend(["-idle", "-demuxer", "lavf", "-idx"].map(String::from));
    if let Some(offset) = seek.filter(|s| *s > 0) {
        args.push("-ss".to_string());
        args.push(offset.to_string());
    }
    if live {
        args.push("-".to_string());
    }
    args
}

fn answer_value(line: &str) -> String {
    match line.split_once('=') {
        Some((_, value)) => value.trim().to_string(),
        None => line.trim().to_string(),
    }
}

/// Feed the player's stdin; once the player is gone keep draining the source
/// so its producer is never blocked on a full pipe.
fn pump_live_input(mut input: Box<dyn Read + Send>, mut stdin: ChildStdin) {
    if let Err(e) = io::copy(&mut input, &mut stdin) {
        tracing::debug!("player input closed: {e}");
        drop(stdin);
        if let Err(e) = io::copy(&mut input, &mut io::sink()) {
            tracing::debug!("live stream drain ended: {e}");
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::control_pipe::ensure_fifo;
    use crate::test_support::{noisy_player, player_args as recorded_args, player_log, scratch_dir, stub_player, wait_until};

    fn fifo(root: &Path, name: &str) -> PathBuf {
        let path = root.join(name);
        ensure_fifo(&path).unwrap();
        path
    }

    #[test]
    fn args_idle_and_live() {
        let config = PlayerConfig::default();
        let pipe = Path::new("/c/mplayer.fifo.0");
        assert_eq!(
            player_args(&config, pipe, None, false),
            vec!["-quiet", "-input", "file=/c/mplayer.fifo.0", "-idle", "-demuxer", "lavf", "-idx"]
        );
        let live = player_args(&config, pipe, Some(35), true);
        assert_eq!(&live[live.len() - 3..], ["-ss", "35", "-"]);
        let zero = player_args(&config, pipe, Some(0), true);
        assert!(!zero.contains(&"-ss".to_string()));
    }

    #[test]
    fn answer_value_takes_text_after_separator() {
        assert_eq!(answer_value("ANS_TIME_POSITION=12.5"), "12.5");
        assert_eq!(answer_value("ANS_ERROR\n"), "ANS_ERROR");
    }

    #[test]
    fn idle_session_plays_and_answers_queries() {
        let root = scratch_dir("player-idle");
        let pipe = fifo(&root, "ctl.0");
        let mut session =
            PlayerSession::start(&stub_player(&root), &pipe, PlayerInput::Idle, None).unwrap();
        assert_eq!(session.state(), SessionState::Starting);
        session.wait_until_ready(Duration::from_secs(5)).unwrap();
        assert_eq!(session.state(), SessionState::Ready);

        session.play(Path::new("/music/Band-Song.mp3"), 30);
        assert_eq!(session.position_seconds(), Some(12.5));
        assert_eq!(session.percent(), Some(40));
        session.mute();

        assert!(wait_until(Duration::from_secs(5), || player_log(&pipe)
            .contains(&"mute".to_string())));
        let log = player_log(&pipe);
        assert_eq!(log[0], "loadfile \"/music/Band-Song.mp3\"");
        assert_eq!(log[1], "seek 30 2");
        assert_eq!(session.state(), SessionState::Playing);
    }

    #[test]
    fn query_gives_up_after_bounded_lines() {
        let root = scratch_dir("player-noisy");
        let pipe = fifo(&root, "ctl.0");
        let mut session =
            PlayerSession::start(&noisy_player(&root), &pipe, PlayerInput::Idle, None).unwrap();
        session.wait_until_ready(Duration::from_secs(5)).unwrap();

        let started = Instant::now();
        assert_eq!(session.query("get_time_pos"), None);
        assert!(started.elapsed() < Duration::from_secs(5));
    }

    #[test]
    fn commands_after_exit_are_dropped() {
        let root = scratch_dir("player-dead");
        let pipe = fifo(&root, "ctl.0");
        let mut session =
            PlayerSession::start(&stub_player(&root), &pipe, PlayerInput::Idle, None).unwrap();
        session.wait_until_ready(Duration::from_secs(5)).unwrap();
        session.stop();

        assert!(!session.is_alive());
        assert_eq!(session.state(), SessionState::Stopped);
        assert!(!session.send_command("mute"));
        assert_eq!(session.position_seconds(), None);
    }

    #[test]
    fn stream_session_seeks_on_start() {
        let root = scratch_dir("player-stream");
        let pipe = fifo(&root, "ctl.0");
        let input = PlayerInput::Stream(Box::new(io::Cursor::new(b"mp3 bytes".to_vec())));
        let mut session = PlayerSession::start(&stub_player(&root), &pipe, input, Some(35)).unwrap();
        assert_eq!(session.state(), SessionState::Playing);
        session.wait_until_ready(Duration::from_secs(5)).unwrap();

        let args = recorded_args(&pipe);
        assert!(args.windows(2).any(|w| w == ["-ss", "35"]));
        assert_eq!(args.last().map(String::as_str), Some("-"));
        assert!(session.is_alive());
    }

    #[test]
    fn missing_player_binary_fails_to_start() {
        let root = scratch_dir("player-missing");
        let pipe = fifo(&root, "ctl.0");
        let config = PlayerConfig {
            program: root.join("no-such-player"),
            ..PlayerConfig::default()
        };
        let err = PlayerSession::start(&config, &pipe, PlayerInput::Idle, None).unwrap_err();
        assert!(format!("{err:#}").contains("spawn player"));
    }
}
