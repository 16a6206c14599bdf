//! Paginated retrieval of the channels a user follows.
//!
//! The provider reports a `total` alongside each page and an opaque `after`
//! cursor. Pages are accumulated until the count reaches the total; a page
//! that adds nothing or hands back the same cursor is treated as a stall
//! instead of being requested again.
use crate::auth::UserCredential;
use crate::http::{endpoint, send_json, RequestError, PROVIDER_TIMEOUT};
use serde::{Deserialize, Serialize};
use thiserror::Error;
use url::Url;

/// Records requested per page.
pub const PAGE_SIZE: usize = 100;

#[derive(Debug, Error)]
pub enum FollowsError {
    #[error(transparent)]
    Request(#[from] RequestError),

    #[error("Pagination stalled after {pages} page(s): {accumulated} of {total} follows")]
    PaginationStalled {
        pages: usize,
        accumulated: usize,
        total: usize,
    },
}

impl FollowsError {
    pub fn is_unauthorized(&self) -> bool {
        matches!(self, FollowsError::Request(RequestError::Unauthorized))
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct FollowedChannel {
    pub broadcaster_id: String,
    #[serde(default)]
    pub broadcaster_name: String,
}

/// Channels a user follows, in the order the provider returned them.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct FollowSet {
    pub channels: Vec<FollowedChannel>,
    /// Total reported by the provider.
    pub total: usize,
}

impl FollowSet {
    pub fn ids(&self) -> impl Iterator<Item = &str> {
        self.channels.iter().map(|c| c.broadcaster_id.as_str())
    }

    pub fn len(&self) -> usize {
        self.channels.len()
    }

    pub fn is_empty(&self) -> bool {
        self.channels.is_empty()
    }
}

#[derive(Debug, Deserialize)]
struct FollowsPage {
    data: Vec<FollowedChannel>,
    #[serde(default)]
    pagination: Pagination,
    total: usize,
}

#[derive(Debug, Default, Deserialize)]
struct Pagination {
    cursor: Option<String>,
}

#[derive(Debug, Clone)]
pub struct FollowsResolver {
    http: reqwest::Client,
    api_base: Url,
    client_id: String,
}

impl FollowsResolver {
    pub fn new(http: reqwest::Client, api_base: Url, client_id: impl Into<String>) -> Self {
        Self {
            http,
            api_base,
            client_id: client_id.into(),
        }
    }

    /// Fetches every followed channel for `user_id`.
    ///
    /// # Errors
    ///
    /// - [`FollowsError::Request`] with [`RequestError::Unauthorized`] when any
    ///   page is rejected; the whole resolve is abandoned
    /// - [`FollowsError::PaginationStalled`] when a page adds no records or
    ///   repeats the previous cursor before the total is reached
    pub async fn resolve(
        &self,
        user_id: &str,
        credential: &UserCredential,
    ) -> Result<FollowSet, FollowsError> {
        let mut channels: Vec<FollowedChannel> = Vec::new();
        let mut cursor: Option<String> = None;
        let mut pages = 0usize;

        loop {
            let page = self
                .fetch_page(user_id, credential, cursor.as_deref())
                .await?;
            pages += 1;

            let total = page.total;
            let added = page.data.len();
            channels.extend(page.data);

            if channels.len() >= total {
                tracing::debug!(pages, follows = channels.len(), total, "Resolved follows");
                return Ok(FollowSet { channels, total });
            }

            let next = page.pagination.cursor.filter(|c| !c.is_empty());
            if added == 0 || next.is_none() || next == cursor {
                tracing::warn!(
                    pages,
                    accumulated = channels.len(),
                    total,
                    "Follows pagination made no progress"
                );
                return Err(FollowsError::PaginationStalled {
                    pages,
                    accumulated: channels.len(),
                    total,
                });
            }
            cursor = next;
        }
    }

    async fn fetch_page(
        &self,
        user_id: &str,
        credential: &UserCredential,
        cursor: Option<&str>,
    ) -> Result<FollowsPage, RequestError> {
        let mut url = endpoint(&self.api_base, &["channels", "followed"]);
        {
            let mut query = url.query_pairs_mut();
            query
                .append_pair("user_id", user_id)
                .append_pair("first", &PAGE_SIZE.to_string());
            if let Some(cursor) = cursor {
                query.append_pair("after", cursor);
            }
        }

        send_json(
            self.http
                .get(url)
                .bearer_auth(&credential.access_token)
                .header("Client-Id", &self.client_id),
            PROVIDER_TIMEOUT,
        )
        .await
    }
}
