//! Media pipeline: cache lookup, transcoding and external player control.
//!
//! The [`orchestrator`] owns all mutable playback state on a single worker
//! thread; everything else is a building block it drives.

pub mod cache;
pub mod config;
pub mod control_pipe;
pub mod orchestrator;
pub mod player;
pub mod spool;
pub mod status;
pub mod track;
pub mod transcode;

#[cfg(test)]
mod test_support;
