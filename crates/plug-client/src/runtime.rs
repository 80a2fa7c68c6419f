//! Client runtime helpers.
//!
//! One entry point per CLI command.

use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};

use anyhow::{Context, Result};

use media_pipeline::cache::CacheStore;
use media_pipeline::orchestrator::spawn_orchestrator;

use crate::config::ClientConfig;
use crate::downloader::Downloader;
use crate::events::EventLog;
use crate::server_api::PlaylistApi;
use crate::sync::{SyncLoop, SyncOptions};

/// Follow the playlist until Ctrl-C.
pub fn run_sync(config: &ClientConfig, events: Arc<EventLog>) -> Result<()> {
    let keep_alive = Arc::new(AtomicBool::new(true));
    {
        let keep_alive = keep_alive.clone();
        ctrlc::set_handler(move || {
            tracing::info!("interrupt received, stopping");
            keep_alive.store(false, Ordering::Relaxed);
        })
        .context("install interrupt handler")?;
    }

    tracing::info!(
        server = %config.server_url,
        playlist = %config.playlist,
        cache = ?config.pipeline.cache_dir,
        "starting sync"
    );
    let orchestrator = spawn_orchestrator(config.pipeline.clone())?;
    let api = PlaylistApi::new(&config.server_url, &config.playlist);
    let downloader = Downloader::new(config);

    let mut sync = SyncLoop::new(
        api,
        downloader,
        orchestrator.clone(),
        SyncOptions::from(config),
        keep_alive,
    );
    sync.run();

    let shutdown = orchestrator.shutdown();
    tracing::debug!(
        events = events.count(),
        last = %events.last_message(),
        "sync finished"
    );
    shutdown
}

/// Resolve `url` with the downloader and append it to the playlist.
pub fn run_add(config: &ClientConfig, url: &str) -> Result<()> {
    let song = Downloader::new(config)
        .resolve_metadata(url)
        .with_context(|| format!("resolve {url}"))?;
    tracing::info!(artist = %song.artist, title = %song.title, "adding song");
    PlaylistApi::new(&config.server_url, &config.playlist).add_song(&song)?;
    println!("added {} - {}", song.artist, song.title);
    Ok(())
}

/// Print cached tracks and leftover partial files.
pub fn list_cache(config: &ClientConfig) -> Result<()> {
    let cache = CacheStore::new(&config.pipeline.cache_dir);
    let entries = cache.entries()?;
    println!("cache: {}", cache.dir().display());
    for path in &entries.resident {
        println!("  {}", path.display());
    }
    if !entries.partial.is_empty() {
        println!("partial:");
        for path in &entries.partial {
            println!("  {}", path.display());
        }
    }
    println!(
        "{} cached, {} partial",
        entries.resident.len(),
        entries.partial.len()
    );
    Ok(())
}
