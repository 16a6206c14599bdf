use crate::http::{send_json, RequestError, PROVIDER_TIMEOUT};
use serde::{Deserialize, Serialize};
use url::Url;

/// An entry in the public channel list.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct PublicStream {
    pub afk: bool,
    pub afk_rustlers: u64,
    pub channel: String,
    pub hidden: bool,
    pub live: bool,
    pub nsfw: bool,
    pub promoted: bool,
    /// Viewers currently in the room.
    pub rustlers: u64,
    pub service: String,
    pub thumbnail: String,
    pub title: String,
    pub url: String,
    pub viewers: u64,
}

#[derive(Debug, Deserialize)]
struct PublicList {
    #[serde(default)]
    stream_list: Vec<PublicStream>,
}

/// The unauthenticated public channel list.
#[derive(Debug, Clone)]
pub struct PublicFeed {
    http: reqwest::Client,
    url: Url,
}

impl PublicFeed {
    pub fn new(http: reqwest::Client, url: Url) -> Self {
        Self { http, url }
    }

    pub async fn live_streams(&self) -> Result<Vec<PublicStream>, RequestError> {
        let list: PublicList = send_json(self.http.get(self.url.clone()), PROVIDER_TIMEOUT).await?;
        tracing::debug!(streams = list.stream_list.len(), "Fetched public streams");
        Ok(list.stream_list)
    }
}
