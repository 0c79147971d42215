use thiserror::Error;

pub type Result<T> = std::result::Result<T, Error>;

#[derive(Debug, Error)]
pub enum Error {
    /// No PKCE verifier in storage when the callback arrived.
    #[error("login verifier missing; please start the login again")]
    MissingVerifier,
    #[error("token exchange failed (HTTP {0})")]
    TokenExchangeFailed(u16),
    #[error("no refresh token stored")]
    MissingRefreshToken,
    /// A 401 that a refresh could not fix.
    #[error("unauthorized; please log in again")]
    Unauthorized,
    #[error("remote service error (HTTP {0})")]
    RemoteError(u16),
    #[error("network error: {0}")]
    NetworkError(String),
    #[error("unexpected response: {0}")]
    InvalidResponse(String),
    #[error("authorization denied: {0}")]
    AuthorizationDenied(String),
    #[error("login callback failed: {0}")]
    Callback(String),
    #[error("storage error: {0}")]
    Storage(String),
    #[error("configuration error: {0}")]
    Config(String),
}

impl Error {
    /// Whether the stored credential can no longer be used and the user
    /// has to go through the login again.
    pub fn requires_login(&self) -> bool {
        matches!(
            self,
            Error::MissingRefreshToken
                | Error::Unauthorized
                | Error::TokenExchangeFailed(400 | 401)
        )
    }
}

impl From<reqwest::Error> for Error {
    fn from(e: reqwest::Error) -> Self {
        if e.is_decode() {
            Error::InvalidResponse(e.to_string())
        } else {
            Error::NetworkError(e.to_string())
        }
    }
}

impl From<std::io::Error> for Error {
    fn from(e: std::io::Error) -> Self {
        Error::Storage(e.to_string())
    }
}

impl From<serde_json::Error> for Error {
    fn from(e: serde_json::Error) -> Self {
        Error::Storage(e.to_string())
    }
}
