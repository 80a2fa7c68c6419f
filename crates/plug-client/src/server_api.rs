//! Blocking client for the remote playlist service.

use std::time::Duration;

use anyhow::{Context, Result};
use serde::de::DeserializeOwned;

use media_pipeline::track::Track;
use playlist_types::{NewSong, PlaylistState, SongId, SongInfo};

use crate::sync::PlaylistSource;

const REQUEST_TIMEOUT: Duration = Duration::from_secs(5);

/// Current song as last seen by the client.
///
/// Timing is attached only when the id changes, so the offset refers to the
/// moment this client first saw the song.
#[derive(Debug, Default)]
pub struct CurrentSong {
    id: Option<SongId>,
    track: Option<Track>,
}

impl CurrentSong {
    pub fn track(&self) -> Option<&Track> {
        self.track.as_ref()
    }

    /// Apply a playlist response, looking up metadata when the id changed.
    pub fn observe(
        &mut self,
        state: &PlaylistState,
        lookup: impl FnOnce(SongId) -> Result<SongInfo>,
    ) -> Result<Option<Track>> {
        if state.current_song != self.id {
            let track = match state.current_song {
                Some(id) => Some(Track::from_song(lookup(id)?, state)),
                None => None,
            };
            self.id = state.current_song;
            self.track = track;
        }
        Ok(self.track.clone())
    }
}

/// HTTP access to one playlist.
pub struct PlaylistApi {
    base_url: String,
    playlist: String,
    agent: ureq::Agent,
    current: CurrentSong,
}

impl PlaylistApi {
    pub fn new(base_url: &str, playlist: &str) -> Self {
        let config = ureq::Agent::config_builder()
            .timeout_global(Some(REQUEST_TIMEOUT))
            .build();
        Self {
            base_url: base_url.trim_end_matches('/').to_string(),
            playlist: playlist.to_string(),
            agent: ureq::Agent::new_with_config(config),
            current: CurrentSong::default(),
        }
    }

    fn playlists_url(&self) -> String {
        format!("{}/playlists", self.base_url)
    }

    fn playlist_url(&self) -> String {
        format!(
            "{}/{}",
            self.playlists_url(),
            urlencoding::encode(&self.playlist)
        )
    }

    fn songs_url(&self) -> String {
        format!("{}/songs", self.playlist_url())
    }

    /// Fetch the playlist state, creating the playlist if the server has none.
    pub fn playlist_state(&self) -> Result<PlaylistState> {
        match self.agent.get(&self.playlist_url()).call() {
            Ok(resp) => read_json(resp, "playlist"),
            Err(ureq::Error::StatusCode(404)) => {
                tracing::info!(playlist = %self.playlist, "playlist not found, creating it");
                self.create_playlist()
            }
            Err(e) => Err(e).context("request playlist"),
        }
    }

    fn create_playlist(&self) -> Result<PlaylistState> {
        let url = format!(
            "{}?playlist_name={}",
            self.playlists_url(),
            urlencoding::encode(&self.playlist)
        );
        let resp = self
            .agent
            .post(&url)
            .send_empty()
            .context("request playlist creation")?;
        read_json(resp, "playlists")
    }

    pub fn lookup_song(&self, id: SongId) -> Result<SongInfo> {
        let url = format!("{}/{}", self.songs_url(), id);
        let resp = self
            .agent
            .get(&url)
            .call()
            .with_context(|| format!("request song {id}"))?;
        read_json(resp, "songs")
    }

    pub fn add_song(&self, song: &NewSong) -> Result<()> {
        let resp = self
            .agent
            .post(&self.songs_url())
            .send_json(song)
            .context("request song add")?;
        if !resp.status().is_success() {
            return Err(anyhow::anyhow!("song add failed with {}", resp.status()));
        }
        Ok(())
    }
}

impl PlaylistSource for PlaylistApi {
    fn ping_current_song(&mut self) -> Result<Option<SongId>> {
        Ok(self.playlist_state()?.current_song)
    }

    fn update_current_song(&mut self) -> Result<Option<Track>> {
        let state = self.playlist_state()?;
        let mut current = std::mem::take(&mut self.current);
        let track = current.observe(&state, |id| self.lookup_song(id));
        self.current = current;
        track
    }
}

fn read_json<T: DeserializeOwned>(
    mut resp: ureq::http::Response<ureq::Body>,
    label: &str,
) -> Result<T> {
    let body = resp
        .body_mut()
        .read_to_string()
        .with_context(|| format!("read /{label} response body"))?;
    serde_json::from_str(&body).with_context(|| format!("decode /{label} response"))
}
