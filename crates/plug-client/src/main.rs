//! openplug: play a shared server playlist in sync with other listeners.
//!
//! ## Pipeline
//! 1. **Download**: the downloader writes raw media into the download dir.
//! 2. **Transcode**: once enough bytes have arrived, the transcoder follows the
//!    growing file and writes both a cache artifact and a live stream.
//! 3. **Playback**: the player reads the live stream (or the cached file),
//!    seeked to where the rest of the room is.
//!
//! ## Commands
//! - `run` (default): follow the playlist until Ctrl-C.
//! - `add <url>`: append a song to the playlist.
//! - `cache`: list cached tracks.

use std::sync::Arc;

use anyhow::Result;
use clap::Parser;
use tracing_subscriber::EnvFilter;
use tracing_subscriber::layer::SubscriberExt;
use tracing_subscriber::util::SubscriberInitExt;

use plug_client::cli::{Args, Command};
use plug_client::config::{ClientConfig, FileConfig};
use plug_client::events::{DEFAULT_CAPACITY, EventLayer, EventLog};
use plug_client::runtime;

fn main() -> Result<()> {
    let args = Args::parse();
    let events = Arc::new(EventLog::new(DEFAULT_CAPACITY));
    tracing_subscriber::registry()
        .with(EnvFilter::try_from_default_env().unwrap_or_else(|_| {
            EnvFilter::new("info,openplug=info,plug_client=info,media_pipeline=info")
        }))
        .with(tracing_subscriber::fmt::layer())
        .with(EventLayer::new(events.clone()))
        .init();

    let file = FileConfig::locate(args.config.as_deref())?;
    let config = ClientConfig::resolve(file, &args);

    match args.command() {
        Command::Run => runtime::run_sync(&config, events),
        Command::Add { url } => runtime::run_add(&config, &url),
        Command::Cache => runtime::list_cache(&config),
    }
}
