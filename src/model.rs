use serde::Deserialize;
use time::OffsetDateTime;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AppScreen {
    Welcome,
    Login,
    Timer,
}

/// Messages from background tasks to the UI loop.
#[derive(Debug)]
pub enum AppEvent {
    LoggedIn,
    LoginFailed(String),
    ProfileLoaded(Profile),
    /// `snapshot` is None when there is no active device.
    PlaybackPolled {
        snapshot: Option<PlaybackSnapshot>,
        requested_at: OffsetDateTime,
    },
    PollFailed(String),
    CommandFailed(String),
    SessionExpired(String),
    Message(String),
}

/// Token endpoint response (both grant types).
#[derive(Debug, Clone, Deserialize)]
pub struct TokenResponse {
    pub access_token: String,
    pub expires_in: u64,
    pub refresh_token: Option<String>,
}

#[derive(Debug, Clone, PartialEq, Eq, Deserialize)]
pub struct Profile {
    pub id: String,
    pub display_name: Option<String>,
    pub product: Option<String>,
}

impl Profile {
    pub fn label(&self) -> &str {
        self.display_name.as_deref().unwrap_or(&self.id)
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Deserialize)]
pub struct Device {
    pub name: String,
    #[serde(rename = "type", default)]
    pub kind: String,
    pub volume_percent: Option<u32>,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Track {
    pub name: String,
    pub artists: Vec<String>,
    pub duration_ms: Option<u64>,
}

/// Read-only view of the remote player.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PlaybackSnapshot {
    pub device: Option<Device>,
    pub is_playing: bool,
    pub progress_ms: Option<u64>,
    pub track: Option<Track>,
}

impl PlaybackSnapshot {
    pub fn track_label(&self) -> Option<String> {
        self.track.as_ref().map(|t| {
            if t.artists.is_empty() {
                t.name.clone()
            } else {
                format!("{} ({})", t.name, t.artists.join(", "))
            }
        })
    }

    /// `m:ss / m:ss` position in the current track, when the player reports it.
    pub fn position_label(&self) -> Option<String> {
        let progress = self.progress_ms?;
        let duration = self.track.as_ref().and_then(|t| t.duration_ms)?;
        Some(format!("{} / {}", minutes_seconds(progress), minutes_seconds(duration)))
    }
}

fn minutes_seconds(ms: u64) -> String {
    let secs = ms / 1000;
    format!("{}:{:02}", secs / 60, secs % 60)
}

/// `GET /v1/me/player` body as sent by the service.
#[derive(Debug, Deserialize)]
pub(crate) struct PlayerResponse {
    device: Option<Device>,
    #[serde(default)]
    is_playing: bool,
    progress_ms: Option<u64>,
    item: Option<PlayerItem>,
}

#[derive(Debug, Deserialize)]
struct PlayerItem {
    name: String,
    #[serde(default)]
    artists: Vec<PlayerArtist>,
    duration_ms: Option<u64>,
}

#[derive(Debug, Deserialize)]
struct PlayerArtist {
    name: String,
}

impl From<PlayerResponse> for PlaybackSnapshot {
    fn from(r: PlayerResponse) -> Self {
        PlaybackSnapshot {
            device: r.device,
            is_playing: r.is_playing,
            progress_ms: r.progress_ms,
            track: r.item.map(|item| Track {
                name: item.name,
                artists: item.artists.into_iter().map(|a| a.name).collect(),
                duration_ms: item.duration_ms,
            }),
        }
    }
}
