use crate::follows::{FollowSet, PAGE_SIZE};
use crate::http::{endpoint, send_json, RequestError, PROVIDER_TIMEOUT};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use url::Url;

/// A live stream among the followed channels.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct FollowedStream {
    pub user_id: String,
    pub user_login: String,
    pub user_name: String,
    pub game_name: String,
    pub language: String,
    pub started_at: DateTime<Utc>,
    pub title: String,
    #[serde(rename = "type")]
    pub stream_type: String,
    pub viewer_count: u64,
}

#[derive(Debug, Deserialize)]
struct StreamsPage {
    data: Vec<FollowedStream>,
}

/// Queries which followed channels are live, [`PAGE_SIZE`] ids per request.
#[derive(Debug, Clone)]
pub struct FollowedFeed {
    http: reqwest::Client,
    api_base: Url,
    client_id: String,
}

impl FollowedFeed {
    pub fn new(http: reqwest::Client, api_base: Url, client_id: impl Into<String>) -> Self {
        Self {
            http,
            api_base,
            client_id: client_id.into(),
        }
    }

    /// Returns the live streams among `follows`, authenticated with the App
    /// credential's `token`. An empty follow scope issues no request.
    pub async fn live_streams(
        &self,
        token: &str,
        follows: &FollowSet,
    ) -> Result<Vec<FollowedStream>, RequestError> {
        let ids: Vec<&str> = follows.ids().collect();
        let mut streams = Vec::new();

        for chunk in ids.chunks(PAGE_SIZE) {
            let mut url = endpoint(&self.api_base, &["streams"]);
            {
                let mut query = url.query_pairs_mut();
                for id in chunk {
                    query.append_pair("user_id", id);
                }
                query.append_pair("first", &PAGE_SIZE.to_string());
            }

            let page: StreamsPage = send_json(
                self.http
                    .get(url)
                    .bearer_auth(token)
                    .header("Client-Id", &self.client_id),
                PROVIDER_TIMEOUT,
            )
            .await?;
            streams.extend(page.data);
        }

        tracing::debug!(
            follows = follows.len(),
            live = streams.len(),
            "Fetched followed streams"
        );
        Ok(streams)
    }
}
