//! Shared fixture: a poller wired to a single `wiremock` server standing in
//! for the OAuth endpoint, the followed-channel API and the public list.
#![allow(dead_code)]

use chrono::Utc;
use livewatch::auth::{
    CredentialCache, OAuthClient, TokenExpiry, TokenManager, UserCredential, FOLLOWS_SCOPE,
};
use livewatch::follows::FollowsResolver;
use livewatch::http::endpoint;
use livewatch::poller::{
    ForceCheck, LiveEvent, LiveListener, LiveSetPoller, PollerConfig, PollerState, Providers,
    SharedState,
};
use livewatch::streams::{FollowedFeed, PublicFeed};
use secrecy::SecretString;
use serde_json::{json, Value};
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::mpsc;
use url::Url;
use wiremock::matchers::{method, path, query_param};
use wiremock::{Mock, MockServer, ResponseTemplate};

pub const INTERVAL: Duration = Duration::from_secs(30);
pub const CLIENT_ID: &str = "client";
pub const USER_ID: &str = "42";

/// Mock provider endpoints. Kept apart from the poller so tests can move the
/// poller into a task and keep remounting responses.
pub struct ProviderMocks {
    server: MockServer,
}

pub struct Fixture {
    pub mock: ProviderMocks,
    pub state: SharedState,
    pub poller: LiveSetPoller,
    pub force: ForceCheck,
    pub oauth: OAuthClient,
    pub events: mpsc::UnboundedReceiver<LiveEvent>,
}

pub fn user_credential() -> UserCredential {
    UserCredential {
        access_token: "user".into(),
        refresh_token: "refresh".into(),
        scope: vec![FOLLOWS_SCOPE.into()],
        token_type: "bearer".into(),
        expiry: TokenExpiry::new(Utc::now(), 14_400),
    }
}

impl Fixture {
    /// `authorized` installs a valid User credential and a known user id.
    pub async fn new(authorized: bool) -> Self {
        Self::build(authorized, authorized.then_some(USER_ID), None).await
    }

    /// Authorized, but with no user id and no login to look one up by.
    pub async fn without_user_id() -> Self {
        Self::build(true, None, None).await
    }

    /// Unauthorized with a known user id, persisting credentials under
    /// `cache_dir`.
    pub async fn with_cache(cache_dir: &Path) -> Self {
        Self::build(false, Some(USER_ID), Some(CredentialCache::new(cache_dir))).await
    }

    async fn build(
        authorized: bool,
        user_id: Option<&str>,
        cache: Option<CredentialCache>,
    ) -> Self {
        let server = MockServer::start().await;
        let base = Url::parse(&server.uri()).unwrap();
        let http = reqwest::Client::new();
        let api = endpoint(&base, &["helix"]);

        let oauth = OAuthClient::new(
            http.clone(),
            endpoint(&base, &["oauth2"]),
            api.clone(),
            CLIENT_ID,
            SecretString::from("secret"),
        );

        let mut tokens = TokenManager::new(oauth.clone(), cache, INTERVAL);
        if authorized {
            tokens.install_user_credential(user_credential());
        }
        if let Some(user_id) = user_id {
            tokens.set_user_id(user_id);
        }

        let providers = Providers {
            follows: FollowsResolver::new(http.clone(), api.clone(), CLIENT_ID),
            followed: FollowedFeed::new(http.clone(), api, CLIENT_ID),
            public: PublicFeed::new(http, endpoint(&base, &["api"])),
        };

        let state = PollerState::new(tokens, INTERVAL).shared();
        let (tx, events) = mpsc::unbounded_channel();
        let listener: Arc<dyn LiveListener> = Arc::new(tx);
        let (poller, force) = LiveSetPoller::new(
            state.clone(),
            PollerConfig::new(INTERVAL),
            providers,
            Some(listener),
        );

        Self {
            mock: ProviderMocks { server },
            state,
            poller,
            force,
            oauth,
            events,
        }
    }

    pub fn drain_events(&mut self) -> Vec<LiveEvent> {
        let mut events = Vec::new();
        while let Ok(event) = self.events.try_recv() {
            events.push(event);
        }
        events
    }
}

impl ProviderMocks {
    pub fn server(&self) -> &MockServer {
        &self.server
    }

    pub async fn reset(&self) {
        self.server.reset().await;
    }

    /// Replaces every mock: `follows` is the follow list, `live` the followed
    /// channels currently live, `public` the public list.
    pub async fn providers(&self, follows: &[&str], live: &[&str], public: &[&str]) {
        self.server.reset().await;
        self.mount_app_token().await;
        self.mount_follows(follows).await;
        self.mount_json("/helix/streams", followed_streams(live)).await;
        self.mount_json("/api", public_list(public)).await;
    }

    pub async fn mount_app_token(&self) {
        Mock::given(method("POST"))
            .and(path("/oauth2/token"))
            .and(query_param("grant_type", "client_credentials"))
            .respond_with(ResponseTemplate::new(200).set_body_json(json!({
                "access_token": "app",
                "expires_in": 3600,
                "token_type": "bearer"
            })))
            .mount(&self.server)
            .await;
    }

    pub async fn mount_follows(&self, names: &[&str]) {
        let data: Vec<Value> = names
            .iter()
            .map(|n| json!({ "broadcaster_id": id_of(n), "broadcaster_name": n }))
            .collect();
        self.mount_json(
            "/helix/channels/followed",
            json!({ "data": data, "pagination": {}, "total": names.len() }),
        )
        .await;
    }

    pub async fn mount_json(&self, route: &str, body: Value) {
        Mock::given(method("GET"))
            .and(path(route))
            .respond_with(ResponseTemplate::new(200).set_body_json(body))
            .mount(&self.server)
            .await;
    }

    pub async fn mount_status(&self, http_method: &str, route: &str, status: u16) {
        Mock::given(method(http_method))
            .and(path(route))
            .respond_with(ResponseTemplate::new(status))
            .mount(&self.server)
            .await;
    }

    /// Requests received on `route` since the last reset.
    pub async fn hits(&self, route: &str) -> usize {
        self.server
            .received_requests()
            .await
            .unwrap_or_default()
            .iter()
            .filter(|r| r.url.path() == route)
            .count()
    }
}

/// Per-test directory under the system temp dir, emptied first.
pub fn temp_dir(name: &str) -> PathBuf {
    let dir = std::env::temp_dir().join(format!("livewatch_it_{}", name));
    std::fs::remove_dir_all(&dir).ok();
    dir
}

pub fn id_of(name: &str) -> String {
    format!("id-{}", name.to_lowercase())
}

pub fn followed_streams(names: &[&str]) -> Value {
    let data: Vec<Value> = names
        .iter()
        .map(|n| {
            json!({
                "user_id": id_of(n),
                "user_login": n.to_lowercase(),
                "user_name": n,
                "game_name": "Chess",
                "type": "live",
                "title": format!("{} live", n),
                "viewer_count": 10,
                "started_at": "2024-03-01T10:00:00Z"
            })
        })
        .collect();
    json!({ "data": data, "pagination": {} })
}

pub fn public_list(channels: &[&str]) -> Value {
    let list: Vec<Value> = channels
        .iter()
        .map(|c| json!({ "channel": c, "service": "youtube", "live": true, "rustlers": 5 }))
        .collect();
    json!({ "stream_list": list })
}

/// Channel name of a live/offline event, tagged with its direction.
pub fn describe(event: &LiveEvent) -> String {
    match event {
        LiveEvent::Live(record) => format!("live:{}", record.name()),
        LiveEvent::Offline(record) => format!("offline:{}", record.name()),
    }
}
