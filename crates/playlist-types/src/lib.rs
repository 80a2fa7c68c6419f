use serde::{Deserialize, Serialize};

/// Server-assigned song identifier.
pub type SongId = i64;

/// Playlist state returned by `GET /playlists/{name}`.
///
/// Only the fields the client acts on are modelled; anything else the server
/// sends is ignored.
#[derive(Clone, Debug, Default, Serialize, Deserialize, PartialEq)]
pub struct PlaylistState {
    /// Song currently playing on the server, if any.
    #[serde(default)]
    pub current_song: Option<SongId>,
    /// Server timestamp (seconds) when the current song started.
    #[serde(default)]
    pub song_start_time: f64,
    /// Server timestamp (seconds) at which this state was produced.
    #[serde(default)]
    pub requested_time: f64,
}

/// Song metadata returned by `GET /playlists/{name}/songs/{id}`.
#[derive(Clone, Debug, Default, Serialize, Deserialize, PartialEq)]
pub struct SongInfo {
    #[serde(default)]
    pub id: SongId,
    #[serde(default)]
    pub title: String,
    #[serde(default)]
    pub artist: String,
    /// Track length in seconds.
    #[serde(default)]
    pub length: Option<u64>,
    /// Source media size in bytes.
    #[serde(default)]
    pub filesize: Option<u64>,
    /// Source media URL handed to the downloader.
    #[serde(default)]
    pub youtube_url: String,
}

/// Request body for `POST /playlists/{name}/songs`.
#[derive(Clone, Debug, Serialize, Deserialize, PartialEq)]
pub struct NewSong {
    pub title: String,
    pub artist: String,
    pub length: Option<u64>,
    pub filesize: Option<u64>,
    pub youtube_url: String,
}
