//! Per-process session context: owns the auth controller, the API client and
//! every background task, and reports back to the UI loop through
//! [`AppEvent`]s.
//!
//! Init happens once at startup ([`Session::init`]); a stored credential
//! resumes the session immediately. [`Session::teardown`] (also run on drop)
//! cancels the poll task, a pending login, in-flight requests and the
//! scheduled refresh, so no background work survives a logout.

use std::sync::Arc;

use reqwest::Client;
use tokio::sync::mpsc::UnboundedSender;
use tokio::task::{JoinHandle, JoinSet};
use tokio::time::MissedTickBehavior;
use time::OffsetDateTime;
use tracing::{debug, info, warn};

use crate::auth::{AuthController, AuthState};
use crate::callback::wait_for_code;
use crate::config::Config;
use crate::error::{Error, Result};
use crate::model::AppEvent;
use crate::spotify::SpotifyClient;
use crate::store::{CredentialStore, FileStore};
use crate::sync::PlaybackCommand;

pub struct Session {
    config: Arc<Config>,
    auth: Arc<AuthController>,
    api: Arc<SpotifyClient>,
    tx: UnboundedSender<AppEvent>,
    poller: Option<JoinHandle<()>>,
    login: Option<JoinHandle<()>>,
    /// One-off requests (profile, play/pause) that must not outlive a logout.
    requests: JoinSet<()>,
}

impl Session {
    pub fn init(config: Config, tx: UnboundedSender<AppEvent>) -> Result<Self> {
        let http = Client::builder()
            .timeout(config.http_timeout)
            .build()
            .map_err(|e| Error::Config(format!("HTTP client: {}", e)))?;
        let file_store = FileStore::open(&config.storage_path);
        debug!("Credential storage at {}", file_store.path().display());
        let store = CredentialStore::new(Box::new(file_store));
        let auth = Arc::new(AuthController::new(config.auth.clone(), http.clone(), store));
        let api = Arc::new(SpotifyClient::new(http, config.api_url.clone(), Arc::clone(&auth)));

        let mut session = Self {
            config: Arc::new(config),
            auth,
            api,
            tx,
            poller: None,
            login: None,
            requests: JoinSet::new(),
        };
        if session.is_logged_in() {
            info!("Resuming stored session");
            session.resume();
        }
        Ok(session)
    }

    pub fn is_logged_in(&self) -> bool {
        self.auth.state() != AuthState::LoggedOut
    }

    pub fn config(&self) -> &Config {
        &self.config
    }

    /// Start everything a logged-in session runs in the background.
    pub fn resume(&mut self) {
        if self.login.as_ref().is_some_and(|h| h.is_finished()) {
            self.login = None;
        }
        self.auth.arm_refresh();
        self.start_polling();
        self.fetch_profile();
    }

    /// Prepare the authorize URL and wait for the redirect in the background.
    /// Returns the URL the user has to open.
    pub fn begin_login(&mut self) -> Result<String> {
        let request = self.auth.start_login()?;
        if let Some(previous) = self.login.take() {
            previous.abort();
        }

        let auth = Arc::clone(&self.auth);
        let tx = self.tx.clone();
        let redirect_uri = self.config.auth.redirect_uri.clone();
        let timeout = self.config.login_timeout;
        let expected_state = request.state.clone();
        self.login = Some(tokio::spawn(async move {
            let outcome = match wait_for_code(&redirect_uri, &expected_state, timeout).await {
                Ok(code) => auth.complete_login(&code).await.map(|_| ()),
                Err(e) => Err(e),
            };
            match outcome {
                Ok(()) => {
                    let _ = tx.send(AppEvent::LoggedIn);
                }
                Err(e) => {
                    warn!("Login failed: {}", e);
                    let _ = tx.send(AppEvent::LoginFailed(e.to_string()));
                }
            }
        }));
        Ok(request.url)
    }

    pub fn start_polling(&mut self) {
        if let Some(previous) = self.poller.take() {
            previous.abort();
        }
        let auth = Arc::clone(&self.auth);
        let api = Arc::clone(&self.api);
        let tx = self.tx.clone();
        let period = self.config.poll_interval;
        self.poller = Some(tokio::spawn(async move {
            let mut ticker = tokio::time::interval(period);
            ticker.set_missed_tick_behavior(MissedTickBehavior::Skip);
            loop {
                ticker.tick().await;
                poll_once(&auth, &api, &tx).await;
            }
        }));
        debug!("Polling playback every {:?}", period);
    }

    pub fn fetch_profile(&mut self) {
        let auth = Arc::clone(&self.auth);
        let api = Arc::clone(&self.api);
        let tx = self.tx.clone();
        self.reap_requests();
        self.requests.spawn(async move {
            let result = match auth.valid_token().await {
                Ok(token) => api.get_profile(&token).await,
                Err(e) => Err(e),
            };
            match result {
                Ok(profile) => {
                    let _ = tx.send(AppEvent::ProfileLoaded(profile));
                }
                Err(e) => report(&tx, e, AppEvent::Message),
            }
        });
    }

    /// Fire a play/pause command; failures come back as events and never
    /// touch timer state.
    pub fn send_playback(&mut self, command: PlaybackCommand) {
        let auth = Arc::clone(&self.auth);
        let api = Arc::clone(&self.api);
        let tx = self.tx.clone();
        self.reap_requests();
        self.requests.spawn(async move {
            let result = match auth.valid_token().await {
                Ok(token) => api.set_playback(&token, command).await,
                Err(e) => Err(e),
            };
            if let Err(e) = result {
                warn!("Playback command {:?} failed: {}", command, e);
                report(&tx, e, AppEvent::CommandFailed);
            }
        });
    }

    pub fn logout(&mut self) -> Result<()> {
        self.teardown();
        self.auth.logout()
    }

    pub fn teardown(&mut self) {
        if let Some(poller) = self.poller.take() {
            poller.abort();
        }
        if let Some(login) = self.login.take() {
            login.abort();
        }
        self.requests.abort_all();
        self.requests.detach_all();
        self.auth.cancel_scheduled_refresh();
    }

    pub fn has_background_tasks(&self) -> bool {
        self.poller.is_some()
            || self.login.is_some()
            || !self.requests.is_empty()
            || self.auth.refresh_scheduled()
    }

    fn reap_requests(&mut self) {
        while self.requests.try_join_next().is_some() {}
    }
}

impl Drop for Session {
    fn drop(&mut self) {
        self.teardown();
    }
}

async fn poll_once(auth: &AuthController, api: &SpotifyClient, tx: &UnboundedSender<AppEvent>) {
    let requested_at = OffsetDateTime::now_utc();
    let result = match auth.valid_token().await {
        Ok(token) => api.get_playback_state(&token).await,
        Err(e) => Err(e),
    };
    match result {
        Ok(snapshot) => {
            let _ = tx.send(AppEvent::PlaybackPolled { snapshot, requested_at });
        }
        Err(e) => report(tx, e, AppEvent::PollFailed),
    }
}

/// Route an error to the UI: credential problems end the session, the rest
/// are transient.
fn report(tx: &UnboundedSender<AppEvent>, e: Error, transient: fn(String) -> AppEvent) {
    let event = if e.requires_login() {
        AppEvent::SessionExpired(e.to_string())
    } else {
        transient(e.to_string())
    };
    let _ = tx.send(event);
}
