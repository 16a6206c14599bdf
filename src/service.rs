//! HTTP endpoints serving the snapshot and hosting the authorization callback.
//!
//! | Route | Behaviour |
//! |---|---|
//! | `GET /` | informational text |
//! | `GET /auth` | redirect to the provider authorization page when unauthorized |
//! | `GET /stream-data` | snapshot (MessagePack), `302` to authorize, or `503` until ready |
//! | `POST /stream-data` | queue a forced poll cycle, `202` |
//! | `GET /oauth-callback` | exchange the authorization code and queue a forced cycle |
//!
//! Handlers hold the poller lock only to inspect credentials or copy the
//! snapshot; encoding and the code exchange happen after it is released.
use crate::auth::OAuthClient;
use crate::poller::{ForceCheck, SharedState};
use axum::extract::{Query, State};
use axum::http::{header, HeaderMap, StatusCode};
use axum::response::{IntoResponse, Response};
use axum::routing::get;
use axum::Router;
use serde::Deserialize;
use std::future::Future;
use std::time::Duration;
use tokio::net::TcpListener;
use tokio::sync::oneshot;
use tokio::task::JoinHandle;
use tower_http::trace::TraceLayer;

/// Media type of the encoded snapshot. Requests for `/stream-data` must
/// accept it; anything else gets the informational text.
pub const SNAPSHOT_CONTENT_TYPE: &str = "application/octet-stream";

/// Time allowed for in-flight requests once shutdown starts.
pub const SHUTDOWN_GRACE: Duration = Duration::from_secs(5);

const INFO_TEXT: &str = "This endpoint is meant to be used through the livewatch client";

#[derive(Clone)]
pub struct ServiceState {
    poller: SharedState,
    oauth: OAuthClient,
    redirect_uri: String,
    force: ForceCheck,
}

impl ServiceState {
    pub fn new(
        poller: SharedState,
        oauth: OAuthClient,
        redirect_uri: impl Into<String>,
        force: ForceCheck,
    ) -> Self {
        Self {
            poller,
            oauth,
            redirect_uri: redirect_uri.into(),
            force,
        }
    }

    fn authorization_required(&self) -> Response {
        let url = self.oauth.authorize_url(&self.redirect_uri);
        (
            StatusCode::FOUND,
            [(header::LOCATION, url.to_string())],
            "Authorization required",
        )
            .into_response()
    }
}

pub fn router(state: ServiceState) -> Router {
    Router::new()
        .route("/", get(index))
        .route("/auth", get(authorize))
        .route("/stream-data", get(fetch_snapshot).post(force_check))
        .route("/oauth-callback", get(oauth_callback))
        .layer(TraceLayer::new_for_http())
        .with_state(state)
}

/// Running service; dropping it leaves the server running detached.
pub struct ServiceHandle {
    shutdown_tx: oneshot::Sender<()>,
    join: JoinHandle<std::io::Result<()>>,
}

impl ServiceHandle {
    /// Stops accepting connections and waits up to `grace` for in-flight
    /// requests before aborting the server task.
    pub async fn shutdown(self, grace: Duration) {
        let _ = self.shutdown_tx.send(());
        let mut join = self.join;
        match tokio::time::timeout(grace, &mut join).await {
            Ok(Ok(Ok(()))) => tracing::info!("Snapshot service stopped"),
            Ok(Ok(Err(e))) => tracing::error!(error = %e, "Snapshot service failed"),
            Ok(Err(e)) => tracing::error!(error = %e, "Snapshot service task panicked"),
            Err(_) => {
                tracing::warn!(
                    grace_secs = grace.as_secs(),
                    "Grace period elapsed, aborting snapshot service"
                );
                join.abort();
            }
        }
    }
}

/// Serves on `listener` in a background task.
pub fn spawn(listener: TcpListener, state: ServiceState) -> ServiceHandle {
    let (shutdown_tx, shutdown_rx) = oneshot::channel::<()>();
    let join = tokio::spawn(serve(listener, state, async move {
        let _ = shutdown_rx.await;
    }));
    ServiceHandle { shutdown_tx, join }
}

pub async fn serve(
    listener: TcpListener,
    state: ServiceState,
    shutdown: impl Future<Output = ()> + Send + 'static,
) -> std::io::Result<()> {
    if let Ok(addr) = listener.local_addr() {
        tracing::info!(address = %addr, "Snapshot service listening");
    }
    axum::serve(listener, router(state))
        .with_graceful_shutdown(shutdown)
        .await
}

async fn index() -> &'static str {
    INFO_TEXT
}

async fn authorize(State(state): State<ServiceState>) -> Response {
    let authorized = state.poller.lock().await.tokens.has_user_credential();
    if authorized {
        "Authorization already granted.".into_response()
    } else {
        state.authorization_required()
    }
}

async fn fetch_snapshot(State(state): State<ServiceState>, headers: HeaderMap) -> Response {
    if !accepts_snapshot(&headers) {
        return INFO_TEXT.into_response();
    }

    tracing::info!(
        x_real_ip = header_str(&headers, "x-real-ip"),
        x_forwarded_for = header_str(&headers, "x-forwarded-for"),
        "Serving snapshot"
    );

    let snapshot = {
        let poller = state.poller.lock().await;
        if !poller.tokens.has_user_credential() {
            drop(poller);
            return state.authorization_required();
        }
        if !poller.is_ready() {
            let retry_after = poller.snapshot().refresh_interval.as_secs().max(1);
            return (
                StatusCode::SERVICE_UNAVAILABLE,
                [(header::RETRY_AFTER, retry_after.to_string())],
                "Snapshot not ready",
            )
                .into_response();
        }
        poller.snapshot().clone()
    };

    match snapshot.encode() {
        Ok(bytes) => ([(header::CONTENT_TYPE, SNAPSHOT_CONTENT_TYPE)], bytes).into_response(),
        Err(e) => {
            tracing::error!(error = %e, "Failed to encode snapshot");
            (StatusCode::INTERNAL_SERVER_ERROR, "Could not encode snapshot").into_response()
        }
    }
}

async fn force_check(State(state): State<ServiceState>) -> Response {
    let authorized = state.poller.lock().await.tokens.has_user_credential();
    if !authorized {
        return state.authorization_required();
    }
    if state.force.request() {
        (StatusCode::ACCEPTED, "Check queued").into_response()
    } else {
        (StatusCode::SERVICE_UNAVAILABLE, "Poller is not running").into_response()
    }
}

#[derive(Debug, Deserialize)]
struct CallbackParams {
    code: Option<String>,
    error: Option<String>,
    error_description: Option<String>,
}

async fn oauth_callback(
    State(state): State<ServiceState>,
    Query(params): Query<CallbackParams>,
) -> Response {
    let Some(code) = params.code.filter(|c| !c.is_empty()) else {
        if let Some(error) = params.error {
            tracing::warn!(
                error = %error,
                description = params.error_description.as_deref().unwrap_or_default(),
                "Authorization denied"
            );
        }
        return (StatusCode::BAD_REQUEST, "Authorization code not found").into_response();
    };
    tracing::info!("Received authorization code");

    let credential = match state
        .oauth
        .exchange_authorization_code(&code, &state.redirect_uri)
        .await
    {
        Ok(credential) => credential,
        Err(e) => {
            tracing::warn!(error = %e, "Could not exchange authorization code");
            return (
                StatusCode::BAD_GATEWAY,
                "Could not exchange the authorization code, please try again.",
            )
                .into_response();
        }
    };

    {
        let mut poller = state.poller.lock().await;
        poller.tokens.install_user_credential(credential);
        if let Err(e) = poller.tokens.persist_cached() {
            tracing::warn!(error = %e, "Failed to persist user credential");
        }
    }
    state.force.request();

    "Authentication successful! You can now close this page.".into_response()
}

fn accepts_snapshot(headers: &HeaderMap) -> bool {
    [header::ACCEPT, header::CONTENT_TYPE].iter().any(|name| {
        headers
            .get(name)
            .and_then(|v| v.to_str().ok())
            .is_some_and(|v| v.contains(SNAPSHOT_CONTENT_TYPE))
    })
}

fn header_str<'a>(headers: &'a HeaderMap, name: &str) -> &'a str {
    headers
        .get(name)
        .and_then(|v| v.to_str().ok())
        .unwrap_or_default()
}
