//! OAuth authorization-code + PKCE login and the credential lifecycle.

use std::sync::Arc;
use std::time::Duration;

use parking_lot::Mutex;
use time::OffsetDateTime;
use tokio::sync::Notify;
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};
use url::Url;

use crate::config::AuthConfig;
use crate::error::{Error, Result};
use crate::model::TokenResponse;
use crate::pkce::{PkceChallenge, generate_state};
use crate::store::{Credential, CredentialStore};

/// A stored token is handed out only if it outlives this margin.
pub const SAFETY_MARGIN: time::Duration = time::Duration::seconds(5);
/// Proactive refresh fires this long before expiry...
const REFRESH_LEAD: time::Duration = time::Duration::seconds(60);
/// ...but never sooner than this.
const MIN_REFRESH_DELAY: Duration = Duration::from_secs(5);

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AuthState {
    LoggedOut,
    Authenticating,
    LoggedIn,
}

/// Everything the UI needs to send the user to the authorize page.
#[derive(Debug, Clone)]
pub struct LoginRequest {
    pub url: String,
    pub state: String,
}

pub struct AuthController {
    config: AuthConfig,
    http: reqwest::Client,
    store: Mutex<CredentialStore>,
    state: Mutex<AuthState>,
    /// Serialises refresh exchanges so a rotated refresh token is never reused.
    refresh_lock: tokio::sync::Mutex<()>,
    /// Signalled on every successful token issuance.
    issued: Notify,
    scheduler: Mutex<Option<JoinHandle<()>>>,
}

impl AuthController {
    pub fn new(config: AuthConfig, http: reqwest::Client, store: CredentialStore) -> Self {
        let state = if store.load().is_some() {
            AuthState::LoggedIn
        } else {
            AuthState::LoggedOut
        };
        Self {
            config,
            http,
            store: Mutex::new(store),
            state: Mutex::new(state),
            refresh_lock: tokio::sync::Mutex::new(()),
            issued: Notify::new(),
            scheduler: Mutex::new(None),
        }
    }

    pub fn state(&self) -> AuthState {
        *self.state.lock()
    }

    pub fn credential(&self) -> Option<Credential> {
        self.store.lock().load()
    }

    fn set_state(&self, state: AuthState) {
        let mut current = self.state.lock();
        if *current != state {
            debug!("Auth state {:?} -> {:?}", *current, state);
            *current = state;
        }
    }

    /// Generate a PKCE pair, remember the verifier and build the authorize URL.
    pub fn start_login(&self) -> Result<LoginRequest> {
        let pkce = PkceChallenge::generate();
        self.store.lock().save_verifier(&pkce.verifier)?;

        let state = generate_state();
        let mut url = Url::parse(&format!("{}/authorize", self.config.accounts_url))
            .map_err(|e| Error::Config(format!("invalid accounts URL: {}", e)))?;
        url.query_pairs_mut()
            .append_pair("client_id", &self.config.client_id)
            .append_pair("response_type", "code")
            .append_pair("redirect_uri", self.config.redirect_uri.as_str())
            .append_pair("scope", &self.config.scopes.join(" "))
            .append_pair("code_challenge_method", pkce.method())
            .append_pair("code_challenge", &pkce.challenge)
            .append_pair("state", &state);

        info!("Login started (verifier len={})", pkce.verifier.len());
        Ok(LoginRequest { url: url.into(), state })
    }

    /// Exchange the authorization code using the stored verifier.
    pub async fn complete_login(self: &Arc<Self>, code: &str) -> Result<Credential> {
        let verifier = self.store.lock().take_verifier()?.ok_or(Error::MissingVerifier)?;

        self.set_state(AuthState::Authenticating);
        let params = [
            ("grant_type", "authorization_code"),
            ("code", code),
            ("redirect_uri", self.config.redirect_uri.as_str()),
            ("client_id", self.config.client_id.as_str()),
            ("code_verifier", verifier.as_str()),
        ];
        let response = match self.request_token(&params).await {
            Ok(r) => r,
            Err(e) => {
                warn!("Code exchange failed: {}", e);
                self.set_state(AuthState::LoggedOut);
                return Err(e);
            }
        };
        let Some(refresh_token) = response.refresh_token.clone() else {
            self.set_state(AuthState::LoggedOut);
            return Err(Error::InvalidResponse("token response without refresh_token".into()));
        };

        let credential = Credential::issued(
            response.access_token,
            refresh_token,
            response.expires_in,
            OffsetDateTime::now_utc(),
        );
        if let Err(e) = self.store.lock().save(&credential) {
            self.set_state(AuthState::LoggedOut);
            return Err(e);
        }
        self.set_state(AuthState::LoggedIn);
        info!("Logged in, token expires in {}s", credential.expires_in);
        self.arm_refresh();
        Ok(credential)
    }

    /// Trade the stored refresh token for a new credential. On failure the
    /// stored credential is left as it was.
    pub async fn refresh(&self) -> Result<Credential> {
        let _guard = self.refresh_lock.lock().await;
        let refresh_token = self.store.lock().refresh_token().ok_or(Error::MissingRefreshToken)?;

        let previous = self.state();
        self.set_state(AuthState::Authenticating);
        let params = [
            ("grant_type", "refresh_token"),
            ("refresh_token", refresh_token.as_str()),
            ("client_id", self.config.client_id.as_str()),
        ];
        let response = match self.request_token(&params).await {
            Ok(r) => r,
            Err(e) => {
                warn!("Token refresh failed: {}", e);
                self.set_state(previous);
                return Err(e);
            }
        };

        let credential = Credential::issued(
            response.access_token,
            response.refresh_token.unwrap_or(refresh_token),
            response.expires_in,
            OffsetDateTime::now_utc(),
        );
        {
            let mut store = self.store.lock();
            // logged out while the exchange was in flight
            if store.refresh_token().is_none() {
                drop(store);
                self.set_state(AuthState::LoggedOut);
                return Err(Error::MissingRefreshToken);
            }
            if let Err(e) = store.save(&credential) {
                drop(store);
                self.set_state(previous);
                return Err(e);
            }
        }
        self.set_state(AuthState::LoggedIn);
        debug!("Token refreshed, expires in {}s", credential.expires_in);
        self.issued.notify_one();
        Ok(credential)
    }

    /// Stored access token if it is comfortably valid, else a refreshed one.
    pub async fn valid_token(&self) -> Result<String> {
        if let Some(credential) = self.credential() {
            if credential.remaining(OffsetDateTime::now_utc()) > SAFETY_MARGIN {
                return Ok(credential.access_token);
            }
            debug!("Access token within safety margin, refreshing");
        }
        self.refresh().await.map(|c| c.access_token)
    }

    pub fn logout(&self) -> Result<()> {
        self.cancel_scheduled_refresh();
        self.set_state(AuthState::LoggedOut);
        self.store.lock().clear()?;
        info!("Logged out");
        Ok(())
    }

    /// Delay until the proactive refresh should fire, if a credential exists.
    pub fn refresh_delay(&self, now: OffsetDateTime) -> Option<Duration> {
        let credential = self.credential()?;
        Some(refresh_delay_for(&credential, now))
    }

    /// Make sure the proactive refresh task runs and re-reads the current
    /// expiry.
    pub fn arm_refresh(self: &Arc<Self>) {
        let mut slot = self.scheduler.lock();
        if slot.as_ref().is_some_and(|h| !h.is_finished()) {
            self.issued.notify_one();
            return;
        }
        let auth = Arc::clone(self);
        *slot = Some(tokio::spawn(async move { auth.run_refresh_schedule().await }));
    }

    pub fn refresh_scheduled(&self) -> bool {
        self.scheduler.lock().as_ref().is_some_and(|h| !h.is_finished())
    }

    pub fn cancel_scheduled_refresh(&self) {
        if let Some(handle) = self.scheduler.lock().take() {
            handle.abort();
            debug!("Scheduled refresh cancelled");
        }
    }

    async fn run_refresh_schedule(&self) {
        loop {
            let Some(delay) = self.refresh_delay(OffsetDateTime::now_utc()) else {
                self.issued.notified().await;
                continue;
            };
            debug!("Next proactive refresh in {:?}", delay);
            tokio::select! {
                _ = tokio::time::sleep(delay) => {
                    if let Err(e) = self.refresh().await {
                        if e.requires_login() {
                            warn!("Proactive refresh gave up: {}", e);
                            break;
                        }
                    }
                }
                _ = self.issued.notified() => {}
            }
        }
    }

    async fn request_token(&self, params: &[(&str, &str)]) -> Result<TokenResponse> {
        let url = format!("{}/api/token", self.config.accounts_url);
        let resp = self
            .http
            .post(&url)
            .form(params)
            .send()
            .await
            .map_err(|e| Error::NetworkError(e.to_string()))?;
        let status = resp.status();
        if !status.is_success() {
            return Err(Error::TokenExchangeFailed(status.as_u16()));
        }
        Ok(resp.json::<TokenResponse>().await?)
    }
}

fn refresh_delay_for(credential: &Credential, now: OffsetDateTime) -> Duration {
    let until = credential.remaining(now) - REFRESH_LEAD;
    Duration::try_from(until).unwrap_or(Duration::ZERO).max(MIN_REFRESH_DELAY)
}

#[cfg(test)]
mod tests {
    use super::*;
    use wiremock::matchers::{body_string_contains, method, path};
    use crate::store::{
        ACCESS_TOKEN_KEY, EXPIRES_AT_KEY, EXPIRES_IN_KEY, KeyValueStore, MemoryStore, REFRESH_TOKEN_KEY,
        unix_millis,
    };
    use wiremock::{Mock, MockServer, ResponseTemplate};

    /// Serves what it was seeded with and refuses every write.
    struct FrozenStore(MemoryStore);

    impl KeyValueStore for FrozenStore {
        fn get(&self, key: &str) -> Option<String> {
            self.0.get(key)
        }

        fn set_all(&mut self, _entries: &[(&str, String)]) -> Result<()> {
            Err(Error::Storage("read-only".into()))
        }

        fn remove_all(&mut self, keys: &[&str]) -> Result<()> {
            self.0.remove_all(keys)
        }
    }

    fn frozen_store() -> CredentialStore {
        let mut kv = MemoryStore::default();
        let expires_at = unix_millis(OffsetDateTime::now_utc() + time::Duration::minutes(1));
        kv.set_all(&[
            (ACCESS_TOKEN_KEY, "old-access".into()),
            (REFRESH_TOKEN_KEY, "old-refresh".into()),
            (EXPIRES_IN_KEY, "3600".into()),
            (EXPIRES_AT_KEY, expires_at.to_string()),
        ])
        .unwrap();
        CredentialStore::new(Box::new(FrozenStore(kv)))
    }

    fn config(base: &str) -> AuthConfig {
        AuthConfig {
            client_id: "client-123".into(),
            redirect_uri: Url::parse("http://127.0.0.1:8888/callback").unwrap(),
            scopes: vec!["user-read-playback-state".into(), "user-modify-playback-state".into()],
            accounts_url: base.to_string(),
        }
    }

    fn controller(base: &str, store: CredentialStore) -> Arc<AuthController> {
        Arc::new(AuthController::new(config(base), reqwest::Client::new(), store))
    }

    fn store_with(expires_in_ms: i64) -> CredentialStore {
        let mut store = CredentialStore::in_memory();
        let now = OffsetDateTime::now_utc();
        let cred = Credential {
            access_token: "old-access".into(),
            refresh_token: "old-refresh".into(),
            expires_in: 3600,
            expires_at: now + time::Duration::milliseconds(expires_in_ms),
        };
        store.save(&cred).unwrap();
        store
    }

    fn token_body(access: &str, refresh: Option<&str>) -> serde_json::Value {
        let mut body = serde_json::json!({
            "access_token": access,
            "token_type": "Bearer",
            "expires_in": 3600,
            "scope": "user-read-playback-state"
        });
        if let Some(r) = refresh {
            body["refresh_token"] = serde_json::json!(r);
        }
        body
    }

    #[test]
    fn test_start_login_url_and_verifier() {
        let auth = controller("https://accounts.example.com", CredentialStore::in_memory());
        let req = auth.start_login().unwrap();
        let url = Url::parse(&req.url).unwrap();
        assert_eq!(url.path(), "/authorize");
        let q: std::collections::HashMap<_, _> = url.query_pairs().into_owned().collect();
        assert_eq!(q["client_id"], "client-123");
        assert_eq!(q["response_type"], "code");
        assert_eq!(q["redirect_uri"], "http://127.0.0.1:8888/callback");
        assert_eq!(q["scope"], "user-read-playback-state user-modify-playback-state");
        assert_eq!(q["code_challenge_method"], "S256");
        assert_eq!(q["state"], req.state);

        let verifier = auth.store.lock().take_verifier().unwrap().unwrap();
        assert_eq!(verifier.len(), 128);
        assert_eq!(q["code_challenge"], crate::pkce::derive_challenge(&verifier));
        assert_eq!(auth.state(), AuthState::LoggedOut);
    }

    #[tokio::test]
    async fn test_complete_login_without_verifier() {
        let server = MockServer::start().await;
        Mock::given(method("POST"))
            .and(path("/api/token"))
            .respond_with(ResponseTemplate::new(200).set_body_json(token_body("a", Some("r"))))
            .expect(0)
            .mount(&server)
            .await;

        let auth = controller(&server.uri(), CredentialStore::in_memory());
        let err = auth.complete_login("code").await.unwrap_err();
        assert!(matches!(err, Error::MissingVerifier));
    }

    #[tokio::test]
    async fn test_complete_login_exchanges_code() {
        let server = MockServer::start().await;
        let auth = controller(&server.uri(), CredentialStore::in_memory());
        auth.start_login().unwrap();
        let verifier = {
            let mut store = auth.store.lock();
            let v = store.take_verifier().unwrap().unwrap();
            store.save_verifier(&v).unwrap();
            v
        };
        let encoded: String = url::form_urlencoded::byte_serialize(verifier.as_bytes()).collect();

        Mock::given(method("POST"))
            .and(path("/api/token"))
            .and(body_string_contains("grant_type=authorization_code"))
            .and(body_string_contains("code=the-code"))
            .and(body_string_contains(format!("code_verifier={}", encoded)))
            .and(body_string_contains("client_id=client-123"))
            .respond_with(ResponseTemplate::new(200).set_body_json(token_body("new-access", Some("new-refresh"))))
            .expect(1)
            .mount(&server)
            .await;

        let cred = auth.complete_login("the-code").await.unwrap();
        assert_eq!(cred.access_token, "new-access");
        assert_eq!(auth.credential(), Some(cred));
        assert_eq!(auth.state(), AuthState::LoggedIn);
        assert!(auth.refresh_scheduled());

        // verifier is single-use
        let again = auth.complete_login("the-code").await.unwrap_err();
        assert!(matches!(again, Error::MissingVerifier));
        auth.cancel_scheduled_refresh();
    }

    #[tokio::test]
    async fn test_complete_login_http_failure() {
        let server = MockServer::start().await;
        Mock::given(method("POST"))
            .and(path("/api/token"))
            .respond_with(ResponseTemplate::new(400).set_body_json(serde_json::json!({"error": "invalid_grant"})))
            .mount(&server)
            .await;

        let auth = controller(&server.uri(), CredentialStore::in_memory());
        auth.start_login().unwrap();
        let err = auth.complete_login("bad").await.unwrap_err();
        assert!(matches!(err, Error::TokenExchangeFailed(400)));
        assert_eq!(auth.state(), AuthState::LoggedOut);
        assert!(auth.credential().is_none());
    }

    #[tokio::test]
    async fn test_refresh_without_token_does_no_io() {
        let server = MockServer::start().await;
        Mock::given(method("POST"))
            .respond_with(ResponseTemplate::new(200))
            .expect(0)
            .mount(&server)
            .await;

        let auth = controller(&server.uri(), CredentialStore::in_memory());
        assert!(matches!(auth.refresh().await, Err(Error::MissingRefreshToken)));
        assert_eq!(auth.valid_token().await.ok(), None);
    }

    #[tokio::test]
    async fn test_refresh_keeps_old_refresh_token_when_not_rotated() {
        let server = MockServer::start().await;
        Mock::given(method("POST"))
            .and(path("/api/token"))
            .and(body_string_contains("grant_type=refresh_token"))
            .and(body_string_contains("refresh_token=old-refresh"))
            .respond_with(ResponseTemplate::new(200).set_body_json(token_body("fresh", None)))
            .expect(1)
            .mount(&server)
            .await;

        let auth = controller(&server.uri(), store_with(60_000));
        let cred = auth.refresh().await.unwrap();
        assert_eq!(cred.access_token, "fresh");
        assert_eq!(cred.refresh_token, "old-refresh");
        assert_eq!(auth.credential(), Some(cred));
    }

    #[tokio::test]
    async fn test_refresh_rotates_refresh_token() {
        let server = MockServer::start().await;
        Mock::given(method("POST"))
            .and(path("/api/token"))
            .respond_with(ResponseTemplate::new(200).set_body_json(token_body("fresh", Some("rotated"))))
            .mount(&server)
            .await;

        let auth = controller(&server.uri(), store_with(60_000));
        auth.refresh().await.unwrap();
        assert_eq!(auth.credential().unwrap().refresh_token, "rotated");
    }

    #[tokio::test]
    async fn test_refresh_failure_leaves_credential() {
        let server = MockServer::start().await;
        Mock::given(method("POST"))
            .and(path("/api/token"))
            .respond_with(ResponseTemplate::new(503))
            .mount(&server)
            .await;

        let auth = controller(&server.uri(), store_with(60_000));
        let before = auth.credential();
        let err = auth.refresh().await.unwrap_err();
        assert!(matches!(err, Error::TokenExchangeFailed(503)));
        assert_eq!(auth.credential(), before);
        assert_eq!(auth.state(), AuthState::LoggedIn);
    }

    #[tokio::test]
    async fn test_refresh_save_failure_restores_state() {
        let server = MockServer::start().await;
        Mock::given(method("POST"))
            .and(path("/api/token"))
            .respond_with(ResponseTemplate::new(200).set_body_json(token_body("fresh", None)))
            .mount(&server)
            .await;

        let auth = controller(&server.uri(), frozen_store());
        let err = auth.refresh().await.unwrap_err();
        assert!(matches!(err, Error::Storage(_)));
        assert_eq!(auth.state(), AuthState::LoggedIn);
        assert_eq!(auth.credential().unwrap().access_token, "old-access");
    }

    #[tokio::test]
    async fn test_proactive_refresh_fires_and_rearms() {
        let server = MockServer::start().await;
        let mut body = token_body("fresh", None);
        body["expires_in"] = serde_json::json!(30);
        Mock::given(method("POST"))
            .and(path("/api/token"))
            .respond_with(ResponseTemplate::new(200).set_body_json(body))
            .mount(&server)
            .await;

        // 30 s left: the refresh is due at the 5 s floor, and again after each issuance
        let auth = controller(&server.uri(), store_with(30_000));
        auth.arm_refresh();
        tokio::time::sleep(Duration::from_millis(11_500)).await;

        let refreshes = server
            .received_requests()
            .await
            .unwrap()
            .iter()
            .filter(|r| r.url.path() == "/api/token")
            .count();
        assert!(refreshes >= 2, "only {} refreshes", refreshes);
        assert_eq!(auth.credential().unwrap().access_token, "fresh");
        assert!(auth.refresh_scheduled());
        auth.cancel_scheduled_refresh();
    }

    #[tokio::test]
    async fn test_valid_token_near_expiry_refreshes() {
        let server = MockServer::start().await;
        Mock::given(method("POST"))
            .and(path("/api/token"))
            .respond_with(ResponseTemplate::new(200).set_body_json(token_body("fresh", None)))
            .expect(1)
            .mount(&server)
            .await;

        // 3 s left is inside the 5 s safety margin
        let auth = controller(&server.uri(), store_with(3_000));
        assert_eq!(auth.valid_token().await.ok().as_deref(), Some("fresh"));
    }

    #[tokio::test]
    async fn test_valid_token_far_from_expiry_is_returned_as_is() {
        let server = MockServer::start().await;
        Mock::given(method("POST"))
            .respond_with(ResponseTemplate::new(200))
            .expect(0)
            .mount(&server)
            .await;

        let auth = controller(&server.uri(), store_with(600_000));
        assert_eq!(auth.valid_token().await.ok().as_deref(), Some("old-access"));
    }

    #[tokio::test]
    async fn test_logout_clears_and_cancels() {
        let auth = controller("http://127.0.0.1:9", store_with(600_000));
        assert_eq!(auth.state(), AuthState::LoggedIn);
        auth.arm_refresh();
        assert!(auth.refresh_scheduled());

        auth.logout().unwrap();
        assert!(!auth.refresh_scheduled());
        assert!(auth.credential().is_none());
        assert_eq!(auth.state(), AuthState::LoggedOut);
    }

    #[test]
    fn test_refresh_delay() {
        let now = OffsetDateTime::from_unix_timestamp(1_700_000_000).unwrap();
        let cred = Credential::issued("a".into(), "r".into(), 3600, now);
        assert_eq!(refresh_delay_for(&cred, now), Duration::from_secs(3540));

        let soon = Credential::issued("a".into(), "r".into(), 30, now);
        assert_eq!(refresh_delay_for(&soon, now), Duration::from_secs(5));

        let expired = Credential::issued("a".into(), "r".into(), 10, now - time::Duration::hours(1));
        assert_eq!(refresh_delay_for(&expired, now), Duration::from_secs(5));
    }
}
