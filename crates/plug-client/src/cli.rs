use std::path::PathBuf;

use clap::{Parser, Subcommand};

const VERSION: &str = concat!(
    env!("CARGO_PKG_VERSION"),
    " (",
    env!("GIT_SHA"),
    ", ",
    env!("BUILD_DATE"),
    ")"
);

#[derive(Parser, Debug)]
#[command(name = "openplug", version = VERSION)]
pub struct Args {
    #[command(subcommand)]
    pub cmd: Option<Command>,

    /// Optional client config file (TOML)
    #[arg(long, global = true)]
    pub config: Option<PathBuf>,

    /// Playlist server base URL, e.g. http://192.168.1.10:25222
    #[arg(long, global = true)]
    pub server: Option<String>,

    /// Playlist to follow
    #[arg(long, global = true)]
    pub playlist: Option<String>,

    /// Directory for transcoded tracks
    #[arg(long, global = true)]
    pub cache_dir: Option<PathBuf>,
}

#[derive(Subcommand, Debug, Clone, PartialEq)]
pub enum Command {
    /// Follow the playlist and play along (default)
    Run,

    /// Look up a media URL and add it to the playlist
    Add {
        /// Media page URL understood by the downloader
        url: String,
    },

    /// List cached tracks and leftover partial files
    Cache,
}

impl Args {
    pub fn command(&self) -> Command {
        self.cmd.clone().unwrap_or(Command::Run)
    }
}
