use std::path::PathBuf;
use std::time::Duration;

use url::Url;

use crate::error::{Error, Result};
use crate::timer::TimerSettings;

const DEFAULT_REDIRECT_URI: &str = "http://127.0.0.1:8888/callback";
const DEFAULT_SCOPES: &str =
    "user-read-private user-read-playback-state user-modify-playback-state";
const DEFAULT_ACCOUNTS_URL: &str = "https://accounts.spotify.com";
const DEFAULT_API_URL: &str = "https://api.spotify.com";

/// Settings for the OAuth side of the session.
#[derive(Debug, Clone)]
pub struct AuthConfig {
    pub client_id: String,
    pub redirect_uri: Url,
    pub scopes: Vec<String>,
    /// Base of `/authorize` and `/api/token`.
    pub accounts_url: String,
}

#[derive(Debug, Clone)]
pub struct Config {
    pub auth: AuthConfig,
    /// Base of the `/v1/me...` endpoints.
    pub api_url: String,
    pub storage_path: PathBuf,
    pub timer: TimerSettings,
    pub poll_interval: Duration,
    /// Quiet window after our own play/pause during which polled snapshots
    /// are not mirrored into the timer.
    pub guard_window: Duration,
    pub http_timeout: Duration,
    pub login_timeout: Duration,
}

impl Config {
    /// Load `.env` (if any) and read the process environment.
    pub fn from_env() -> Result<Self> {
        let _ = dotenv::dotenv();
        Self::from_lookup(|key| std::env::var(key).ok())
    }

    pub fn from_lookup<F>(lookup: F) -> Result<Self>
    where
        F: Fn(&str) -> Option<String>,
    {
        let get = |key: &str| lookup(key).map(|v| v.trim().to_string()).filter(|v| !v.is_empty());

        let client_id = get("TOMATUNE_CLIENT_ID")
            .ok_or_else(|| Error::Config("TOMATUNE_CLIENT_ID is not set".into()))?;

        let redirect_raw = get("TOMATUNE_REDIRECT_URI").unwrap_or_else(|| DEFAULT_REDIRECT_URI.into());
        let redirect_uri = Url::parse(&redirect_raw)
            .map_err(|e| Error::Config(format!("invalid TOMATUNE_REDIRECT_URI: {}", e)))?;
        if redirect_uri.port().is_none() {
            return Err(Error::Config("TOMATUNE_REDIRECT_URI must contain a port".into()));
        }

        let scopes = get("TOMATUNE_SCOPES")
            .unwrap_or_else(|| DEFAULT_SCOPES.into())
            .split_whitespace()
            .map(|s| s.to_string())
            .collect();

        let storage_path = match get("TOMATUNE_STORAGE_PATH") {
            Some(p) => PathBuf::from(p),
            None => dirs::data_dir()
                .ok_or_else(|| Error::Config("could not determine data directory".into()))?
                .join("tomatune")
                .join("storage.json"),
        };

        let timer = TimerSettings {
            work_minutes: parse_number(&get, "TOMATUNE_WORK_MINUTES", 25)?,
            break_minutes: parse_number(&get, "TOMATUNE_BREAK_MINUTES", 5)?,
            total_cycles: parse_number(&get, "TOMATUNE_CYCLES", 4)?,
        };

        Ok(Self {
            auth: AuthConfig {
                client_id,
                redirect_uri,
                scopes,
                accounts_url: trim_base(get("TOMATUNE_ACCOUNTS_URL").unwrap_or_else(|| DEFAULT_ACCOUNTS_URL.into())),
            },
            api_url: trim_base(get("TOMATUNE_API_URL").unwrap_or_else(|| DEFAULT_API_URL.into())),
            storage_path,
            timer,
            poll_interval: Duration::from_secs(parse_number(&get, "TOMATUNE_POLL_SECS", 5)?.into()),
            guard_window: Duration::from_millis(parse_number(&get, "TOMATUNE_GUARD_MS", 1000)?.into()),
            http_timeout: Duration::from_secs(parse_number(&get, "TOMATUNE_HTTP_TIMEOUT_SECS", 10)?.into()),
            login_timeout: Duration::from_secs(parse_number(&get, "TOMATUNE_LOGIN_TIMEOUT_SECS", 300)?.into()),
        })
    }
}

fn parse_number<F>(get: &F, key: &str, default: u32) -> Result<u32>
where
    F: Fn(&str) -> Option<String>,
{
    match get(key) {
        None => Ok(default),
        Some(raw) => match raw.parse::<u32>() {
            Ok(n) if n >= 1 => Ok(n),
            _ => Err(Error::Config(format!("{} must be a positive integer, got '{}'", key, raw))),
        },
    }
}

fn trim_base(url: String) -> String {
    url.trim_end_matches('/').to_string()
}
