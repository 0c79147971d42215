//! Authenticated calls against the Web API.
//!
//! A 401 triggers one refresh through the [`AuthController`] and exactly one
//! retry with the new token. Anything else is reported as-is; retrying is up
//! to the caller.

use std::sync::Arc;

use reqwest::header::CONTENT_LENGTH;
use reqwest::{Client, RequestBuilder, Response, StatusCode};
use tracing::{debug, warn};

use crate::auth::AuthController;
use crate::error::{Error, Result};
use crate::model::{PlaybackSnapshot, PlayerResponse, Profile};
use crate::sync::PlaybackCommand;

pub struct SpotifyClient {
    http: Client,
    api_url: String,
    auth: Arc<AuthController>,
}

impl SpotifyClient {
    pub fn new(http: Client, api_url: impl Into<String>, auth: Arc<AuthController>) -> Self {
        Self { http, api_url: api_url.into(), auth }
    }

    pub async fn get_profile(&self, token: &str) -> Result<Profile> {
        let url = format!("{}/v1/me", self.api_url);
        let resp = self.send(token, |t| self.http.get(&url).bearer_auth(t)).await?;
        Ok(resp.json::<Profile>().await?)
    }

    /// `None` means the account has no active device.
    pub async fn get_playback_state(&self, token: &str) -> Result<Option<PlaybackSnapshot>> {
        let url = format!("{}/v1/me/player", self.api_url);
        let resp = self.send(token, |t| self.http.get(&url).bearer_auth(t)).await?;
        if resp.status() == StatusCode::NO_CONTENT {
            return Ok(None);
        }
        let raw: PlayerResponse = resp.json().await?;
        let snapshot = PlaybackSnapshot::from(raw);
        if snapshot.device.is_none() {
            return Ok(None);
        }
        Ok(Some(snapshot))
    }

    pub async fn set_playback(&self, token: &str, command: PlaybackCommand) -> Result<()> {
        let action = match command {
            PlaybackCommand::Play => "play",
            PlaybackCommand::Pause => "pause",
        };
        let url = format!("{}/v1/me/player/{}", self.api_url, action);
        self.send(token, |t| {
            self.http.put(&url).bearer_auth(t).header(CONTENT_LENGTH, "0")
        })
        .await?;
        debug!("Playback set to {}", action);
        Ok(())
    }

    async fn send<F>(&self, token: &str, build: F) -> Result<Response>
    where
        F: Fn(&str) -> RequestBuilder,
    {
        let resp = build(token).send().await.map_err(|e| Error::NetworkError(e.to_string()))?;
        if resp.status() != StatusCode::UNAUTHORIZED {
            return check_status(resp);
        }

        debug!("401 from API, refreshing token and retrying once");
        let fresh = self.auth.refresh().await.map_err(|e| {
            warn!("Refresh after 401 failed: {}", e);
            Error::Unauthorized
        })?;
        let retry = build(&fresh.access_token)
            .send()
            .await
            .map_err(|e| Error::NetworkError(e.to_string()))?;
        if retry.status() == StatusCode::UNAUTHORIZED {
            return Err(Error::Unauthorized);
        }
        check_status(retry)
    }
}

fn check_status(resp: Response) -> Result<Response> {
    let status = resp.status();
    if status.is_success() {
        Ok(resp)
    } else {
        Err(Error::RemoteError(status.as_u16()))
    }
}
