//! Downloader driver.
//!
//! Runs a yt-dlp compatible binary, follows its progress on stdout and
//! reports when enough media is on disk to start streaming.

use std::io::{BufRead, BufReader};
use std::path::{Path, PathBuf};
use std::process::{Child, Command, ExitStatus, Stdio};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};
use std::thread;
use std::time::Duration;

use anyhow::{Context, Result, bail};
use crossbeam_channel::{Receiver, Sender};
use serde::Deserialize;

use media_pipeline::spool::SpoolProgress;
use media_pipeline::track::Track;
use playlist_types::NewSong;

use crate::config::ClientConfig;

/// Marks the progress lines this client asks the downloader to print.
pub const PROGRESS_TAG: &str = "openplug-progress";

const EXIT_POLL: Duration = Duration::from_millis(50);

const PROGRESS_TEMPLATE: &str = "download:openplug-progress|%(progress.status)s|%(progress.downloaded_bytes)s|%(progress.elapsed)s|%(progress.filename)s";

#[derive(Debug, Clone, PartialEq)]
pub enum DownloadEvent {
    /// Enough bytes are on disk to start a live decode.
    StreamStarted { filename: PathBuf, elapsed: f64 },
    /// The downloader wrote the last byte.
    Finished { filename: PathBuf, elapsed: f64 },
    /// The download ended without producing a usable file.
    Failed { reason: String },
}

/// An in-flight download as seen by the sync loop.
pub struct FetchHandle {
    pub events: Receiver<DownloadEvent>,
    pub spool: SpoolProgress,
    process: Option<Arc<Mutex<Child>>>,
    cancelled: Arc<AtomicBool>,
}

impl FetchHandle {
    pub fn new(events: Receiver<DownloadEvent>, spool: SpoolProgress) -> Self {
        Self {
            events,
            spool,
            process: None,
            cancelled: Arc::new(AtomicBool::new(false)),
        }
    }

    /// Kill the download; its partial file is removed.
    pub fn cancel(&self) {
        self.cancelled.store(true, Ordering::Relaxed);
        if let Some(process) = &self.process {
            if let Ok(mut child) = process.lock() {
                if let Err(e) = child.kill() {
                    tracing::debug!("downloader kill: {e}");
                }
            }
        }
    }
}

/// Source of raw media for tracks that are not cached yet.
pub trait MediaFetcher {
    fn fetch(&mut self, track: &Track) -> Result<FetchHandle>;
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ProgressStatus {
    Downloading,
    Finished,
    Error,
    Other,
}

/// One parsed progress line.
#[derive(Debug, Clone, PartialEq)]
pub struct ProgressLine {
    pub status: ProgressStatus,
    pub downloaded_bytes: Option<u64>,
    pub elapsed: Option<f64>,
    pub filename: PathBuf,
}

/// Parse `openplug-progress|status|bytes|elapsed|filename`; `NA` reads as unknown.
pub fn parse_progress_line(line: &str) -> Option<ProgressLine> {
    let mut parts = line.trim_end().splitn(5, '|');
    if parts.next()? != PROGRESS_TAG {
        return None;
    }
    let status = match parts.next()? {
        "downloading" => ProgressStatus::Downloading,
        "finished" => ProgressStatus::Finished,
        "error" => ProgressStatus::Error,
        _ => ProgressStatus::Other,
    };
    let downloaded_bytes = parts.next()?.parse().ok();
    let elapsed = parts.next()?.parse().ok();
    let filename = parts.next().filter(|f| !f.is_empty() && *f != "NA")?;
    Some(ProgressLine {
        status,
        downloaded_bytes,
        elapsed,
        filename: PathBuf::from(filename),
    })
}

/// Split `"Artist - Title"` on the first dash.
///
/// Without a dash the whole string is the title and the artist is unknown.
pub fn split_title(raw: &str) -> (String, String) {
    match raw.split_once('-') {
        Some((artist, title)) if !artist.trim().is_empty() && !title.trim().is_empty() => {
            (artist.trim().to_string(), title.trim().to_string())
        }
        _ => ("Unknown Artist".to_string(), raw.trim().to_string()),
    }
}

#[derive(Debug, Deserialize)]
struct MediaInfo {
    title: String,
    #[serde(default)]
    duration: Option<f64>,
    #[serde(default)]
    filesize: Option<u64>,
    #[serde(default)]
    filesize_approx: Option<u64>,
}

pub struct Downloader {
    program: PathBuf,
    extra_args: Vec<String>,
    download_dir: PathBuf,
    stream_start_bytes: u64,
    debug_output: bool,
}

impl Downloader {
    pub fn new(config: &ClientConfig) -> Self {
        Self {
            program: config.downloader.clone(),
            extra_args: config.downloader_args.clone(),
            download_dir: config.download_dir.clone(),
            stream_start_bytes: config.stream_start_bytes,
            debug_output: config.debug_output,
        }
    }

    fn command(&self) -> Command {
        let mut cmd = Command::new(&self.program);
        cmd.args(&self.extra_args).stderr(if self.debug_output {
            Stdio::inherit()
        } else {
            Stdio::null()
        });
        cmd
    }

    fn download_args(&self, track: &Track) -> Vec<String> {
        let mut args: Vec<String> = ["-f", "bestaudio/best", "--no-part", "--newline"]
            .map(String::from)
            .to_vec();
        if !self.debug_output {
            args.extend(["--quiet", "--progress"].map(String::from));
        }
        args.push("--progress-template".to_string());
        args.push(PROGRESS_TEMPLATE.to_string());
        args.push("-o".to_string());
        args.push(output_template(&self.download_dir, track));
        args.push(track.source_url.clone());
        args
    }

    /// Look up title, duration and size of `url` without downloading it.
    pub fn resolve_metadata(&self, url: &str) -> Result<NewSong> {
        let mut cmd = self.command();
        cmd.args(["--dump-single-json", "--no-playlist", "-f", "bestaudio/best", url])
            .stdin(Stdio::null());
        let out = cmd
            .output()
            .with_context(|| format!("spawn downloader {:?}", self.program))?;
        if !out.status.success() {
            bail!("downloader metadata lookup failed with {}", out.status);
        }
        let info: MediaInfo =
            serde_json::from_slice(&out.stdout).context("decode downloader metadata")?;
        let (artist, title) = split_title(&info.title);
        Ok(NewSong {
            title,
            artist,
            length: info.duration.map(|d| d.round() as u64),
            filesize: info.filesize.or(info.filesize_approx),
            youtube_url: url.to_string(),
        })
    }
}

impl MediaFetcher for Downloader {
    fn fetch(&mut self, track: &Track) -> Result<FetchHandle> {
        std::fs::create_dir_all(&self.download_dir)
            .with_context(|| format!("create download dir {:?}", self.download_dir))?;
        let args = self.download_args(track);
        tracing::debug!(program = %self.program.display(), ?args, "spawning downloader");
        let mut child = self
            .command()
            .args(&args)
            .stdin(Stdio::null())
            .stdout(Stdio::piped())
            .spawn()
            .with_context(|| format!("spawn downloader {:?}", self.program))?;
        let stdout = child
            .stdout
            .take()
            .context("downloader stdout was not captured")?;

        let (events_tx, events_rx) = crossbeam_channel::unbounded();
        let mut handle = FetchHandle::new(events_rx, SpoolProgress::new());
        let process = Arc::new(Mutex::new(child));
        handle.process = Some(process.clone());

        let watch = DownloadWatch {
            events: events_tx,
            spool: handle.spool.clone(),
            cancelled: handle.cancelled.clone(),
            stream_start_bytes: self.stream_start_bytes,
            label: track.label(),
        };
        thread::spawn(move || watch.run(BufReader::new(stdout), process));
        tracing::info!(track = %track.label(), "download started");
        Ok(handle)
    }
}

/// `<dir>/<title> <artist>.%(ext)s` with template and path metacharacters escaped.
fn output_template(dir: &Path, track: &Track) -> String {
    let name = format!("{} {}", track.title, track.artist)
        .replace(['/', '\\'], "_")
        .replace('%', "%%");
    format!("{}/{}.%(ext)s", dir.display(), name)
}

struct DownloadWatch {
    events: Sender<DownloadEvent>,
    spool: SpoolProgress,
    cancelled: Arc<AtomicBool>,
    stream_start_bytes: u64,
    label: String,
}

impl DownloadWatch {
    fn run(self, stdout: impl BufRead, process: Arc<Mutex<Child>>) {
        let mut started = false;
        let mut last_file: Option<PathBuf> = None;
        let mut last_elapsed = 0.0;

        for line in stdout.lines() {
            let Ok(line) = line else { break };
            let Some(progress) = parse_progress_line(&line) else {
                tracing::debug!(%line, "downloader output");
                continue;
            };
            let on_disk = progress
                .downloaded_bytes
                .or_else(|| std::fs::metadata(&progress.filename).map(|m| m.len()).ok())
                .unwrap_or(0);
            self.spool.set_written(on_disk);
            last_elapsed = progress.elapsed.unwrap_or(last_elapsed);
            last_file = Some(progress.filename.clone());

            match progress.status {
                ProgressStatus::Downloading if !started && on_disk > self.stream_start_bytes => {
                    started = true;
                    tracing::info!(track = %self.label, bytes = on_disk, "stream started");
                    let _ = self.events.send(DownloadEvent::StreamStarted {
                        filename: progress.filename,
                        elapsed: last_elapsed,
                    });
                }
                ProgressStatus::Finished => {
                    tracing::info!(track = %self.label, "media fully downloaded");
                    let _ = self.events.send(DownloadEvent::Finished {
                        filename: progress.filename,
                        elapsed: last_elapsed,
                    });
                }
                _ => {}
            }
        }

        let status = wait_exit(&process);
        if let Some(path) = &last_file {
            if let Ok(meta) = std::fs::metadata(path) {
                self.spool.set_written(meta.len());
            }
        }
        self.spool.mark_done();

        if self.cancelled.load(Ordering::Relaxed) {
            if let Some(path) = &last_file {
                let _ = std::fs::remove_file(path);
            }
            tracing::debug!(track = %self.label, "download cancelled");
            return;
        }
        match status {
            Some(status) if status.success() => {}
            Some(status) => {
                tracing::warn!(track = %self.label, %status, "downloader failed");
                let _ = self.events.send(DownloadEvent::Failed {
                    reason: format!("downloader exited with {status}"),
                });
            }
            None => {
                let _ = self.events.send(DownloadEvent::Failed {
                    reason: "downloader wait failed".to_string(),
                });
            }
        }
    }
}

/// Poll for exit without holding the lock, so `cancel` can still reach the child.
fn wait_exit(process: &Mutex<Child>) -> Option<ExitStatus> {
    loop {
        let polled = process.lock().ok()?.try_wait();
        match polled {
            Ok(Some(status)) => return Some(status),
            Ok(None) => thread::sleep(EXIT_POLL),
            Err(_) => return None,
        }
    }
}
