//! Playlist-following audio client.
//!
//! Polls a playlist server, downloads whatever it names, and plays it in
//! step with the other listeners.

pub mod cli;
pub mod config;
pub mod downloader;
pub mod events;
pub mod runtime;
pub mod server_api;
pub mod sync;

#[cfg(test)]
mod test_support;
