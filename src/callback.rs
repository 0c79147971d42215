//! One-shot loopback listener for the authorization redirect.
//!
//! Binds the host/port of the configured redirect URI, waits for the first
//! request on its path and shuts down again, so an authorization code is
//! read exactly once.

use std::net::SocketAddr;
use std::time::Duration;

use axum::Router;
use axum::extract::{Query, State};
use axum::response::Html;
use axum::routing::get;
use serde::Deserialize;
use tokio::net::TcpListener;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tracing::{debug, info};
use url::Url;

use crate::error::{Error, Result};

const DONE_PAGE: &str = "<!DOCTYPE html><html><head><meta charset=\"utf-8\"><title>tomatune</title></head>\
<body style=\"font-family: sans-serif; text-align: center; margin-top: 4em\">\
<h2>You can close this tab</h2><p>Return to the terminal to continue.</p></body></html>";

#[derive(Debug, Clone, Deserialize)]
pub struct CallbackParams {
    pub code: Option<String>,
    pub state: Option<String>,
    pub error: Option<String>,
}

async fn handle_callback(
    State(tx): State<mpsc::UnboundedSender<CallbackParams>>,
    Query(params): Query<CallbackParams>,
) -> Html<&'static str> {
    let _ = tx.send(params);
    Html(DONE_PAGE)
}

struct ServerGuard(JoinHandle<()>);

impl Drop for ServerGuard {
    fn drop(&mut self) {
        self.0.abort();
    }
}

/// Wait for the redirect and return the authorization code.
pub async fn wait_for_code(redirect_uri: &Url, expected_state: &str, timeout: Duration) -> Result<String> {
    let host = redirect_uri
        .host_str()
        .ok_or_else(|| Error::Config("redirect URI has no host".into()))?;
    let port = redirect_uri
        .port_or_known_default()
        .ok_or_else(|| Error::Config("redirect URI has no port".into()))?;
    let addr: SocketAddr = match host {
        "localhost" => SocketAddr::from(([127, 0, 0, 1], port)),
        other => format!("{}:{}", other, port)
            .parse()
            .map_err(|e| Error::Config(format!("redirect host must be a loopback address: {}", e)))?,
    };

    let listener = TcpListener::bind(addr)
        .await
        .map_err(|e| Error::Callback(format!("could not listen on {}: {}", addr, e)))?;
    wait_on_listener(listener, redirect_uri.path(), expected_state, timeout).await
}

async fn wait_on_listener(
    listener: TcpListener,
    route: &str,
    expected_state: &str,
    timeout: Duration,
) -> Result<String> {
    let (tx, mut rx) = mpsc::unbounded_channel();
    let app = Router::new().route(route, get(handle_callback)).with_state(tx);
    if let Ok(addr) = listener.local_addr() {
        info!("Waiting for login callback on http://{}{}", addr, route);
    }
    // stops the server however this future ends, including when it is aborted
    let _server = ServerGuard(tokio::spawn(async move {
        let _ = axum::serve(listener, app).await;
    }));

    let params = tokio::select! {
        params = rx.recv() => params.ok_or_else(|| Error::Callback("listener stopped".into())),
        _ = tokio::time::sleep(timeout) => Err(Error::Callback("timed out waiting for the browser".into())),
    }?;
    debug!("Callback received (code present: {})", params.code.is_some());

    if let Some(error) = params.error {
        return Err(Error::AuthorizationDenied(error));
    }
    if params.state.as_deref() != Some(expected_state) {
        return Err(Error::Callback("state mismatch".into()));
    }
    params
        .code
        .filter(|c| !c.is_empty())
        .ok_or_else(|| Error::Callback("no authorization code in callback".into()))
}
