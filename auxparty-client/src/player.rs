use async_trait::async_trait;
use auxparty_core::Track;
use serde::Deserialize;
use thiserror::Error;

pub type PlayerResult<T> = Result<T, PlayerError>;

#[derive(Debug, Error)]
pub enum PlayerError {
    #[error("playback request failed: {0}")]
    Network(String),
    #[error("playback provider rejected the request: {0}")]
    Rejected(String),
}

impl From<reqwest::Error> for PlayerError {
    fn from(err: reqwest::Error) -> Self {
        Self::Network(err.to_string())
    }
}

/// What the provider reports about the local player.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct PlaybackState {
    pub track: Option<Track>,
    pub position_ms: u64,
    pub is_playing: bool,
}

/// The capability set the session needs from the external playback provider.
///
/// Implementations are thin wrappers over the provider's own transport and
/// never hold session state.
#[async_trait]
pub trait PlaybackProvider: Send + Sync + 'static {
    /// The current local playback state, if the provider reports any.
    async fn current_playback(&self) -> PlayerResult<Option<PlaybackState>>;
    /// Starts playback of a track at the given position.
    async fn play(&self, uri: &str, position_ms: u64) -> PlayerResult<()>;
    /// Resumes whatever is currently loaded.
    async fn resume(&self) -> PlayerResult<()>;
    /// Pauses playback.
    async fn pause(&self) -> PlayerResult<()>;
}

const PLAYER_API: &str = "https://api.spotify.com/v1/me/player";

/// Drives a Spotify Connect device through the web api.
pub struct SpotifyPlayer {
    http: reqwest::Client,
    token: String,
    device_id: String,
}

#[derive(Deserialize)]
struct PlaybackBody {
    item: Option<ItemBody>,
    #[serde(default)]
    is_playing: bool,
    #[serde(default)]
    progress_ms: u64,
}

#[derive(Deserialize)]
struct ItemBody {
    id: String,
    name: String,
    artists: Vec<ArtistBody>,
    uri: String,
}

#[derive(Deserialize)]
struct ArtistBody {
    name: String,
}

impl SpotifyPlayer {
    pub fn new(token: impl Into<String>, device_id: impl Into<String>) -> Self {
        Self {
            http: reqwest::Client::new(),
            token: token.into(),
            device_id: device_id.into(),
        }
    }

    async fn put(&self, path: &str, body: Option<serde_json::Value>) -> PlayerResult<()> {
        let url = format!("{PLAYER_API}{path}?device_id={}", self.device_id);

        let mut request = self.http.put(url).bearer_auth(&self.token);

        if let Some(body) = body {
            request = request.json(&body);
        } else {
            // The player endpoints require a length even for empty bodies.
            request = request.header(reqwest::header::CONTENT_LENGTH, 0);
        }

        let response = request.send().await?;

        if response.status().is_success() {
            Ok(())
        } else {
            Err(PlayerError::Rejected(response.status().to_string()))
        }
    }
}

#[async_trait]
impl PlaybackProvider for SpotifyPlayer {
    async fn current_playback(&self) -> PlayerResult<Option<PlaybackState>> {
        let response = self
            .http
            .get(PLAYER_API)
            .bearer_auth(&self.token)
            .send()
            .await?;

        // No active device reports as an empty response.
        if response.status() == reqwest::StatusCode::NO_CONTENT {
            return Ok(None);
        }

        if !response.status().is_success() {
            return Err(PlayerError::Rejected(response.status().to_string()));
        }

        let body: PlaybackBody = response.json().await?;

        Ok(Some(PlaybackState {
            track: body.item.map(|item| Track {
                id: item.id,
                name: item.name,
                artists: item.artists.into_iter().map(|a| a.name).collect(),
                uri: item.uri,
            }),
            position_ms: body.progress_ms,
            is_playing: body.is_playing,
        }))
    }

    async fn play(&self, uri: &str, position_ms: u64) -> PlayerResult<()> {
        self.put(
            "/play",
            Some(serde_json::json!({
                "uris": [uri],
                "position_ms": position_ms,
            })),
        )
        .await
    }

    async fn resume(&self) -> PlayerResult<()> {
        self.put("/play", None).await
    }

    async fn pause(&self) -> PlayerResult<()> {
        self.put("/pause", None).await
    }
}
