//! Consumer side of the snapshot service.
//!
//! The service signals "authorize first" with a redirect to the provider's
//! authorization page, so the HTTP client here must not follow redirects:
//! the `Location` is surfaced as [`ClientError::AuthorizationRequired`] for
//! the caller to open in a browser.
use crate::http::{read_limited_bytes, RequestError, MAX_BODY_SIZE};
use crate::service::SNAPSHOT_CONTENT_TYPE;
use crate::streams::{Snapshot, SnapshotCodecError};
use reqwest::header::{ACCEPT, LOCATION, RETRY_AFTER};
use reqwest::StatusCode;
use std::time::Duration;
use thiserror::Error;
use url::Url;

const REQUEST_TIMEOUT: Duration = Duration::from_secs(30);

#[derive(Debug, Error)]
pub enum ClientError {
    /// The user has to visit `url` and grant access before data is served.
    #[error("Authorization required, visit {url}")]
    AuthorizationRequired { url: String },

    #[error("Snapshot not ready yet")]
    NotReady { retry_after: Option<Duration> },

    #[error("Redirect without a usable Location header")]
    BadRedirect,

    #[error("Unexpected HTTP status: {0}")]
    HttpStatus(u16),

    #[error("Request failed: {0}")]
    Network(#[from] reqwest::Error),

    #[error("Snapshot exceeds {0} bytes")]
    ResponseTooLarge(usize),

    #[error("Invalid service address: {0}")]
    InvalidAddress(#[from] url::ParseError),

    #[error(transparent)]
    Decode(#[from] SnapshotCodecError),
}

impl ClientError {
    /// Pending authorization, a bad address and an oversized snapshot are
    /// final; anything else is worth another attempt.
    pub fn is_retryable(&self) -> bool {
        !matches!(
            self,
            ClientError::AuthorizationRequired { .. }
                | ClientError::InvalidAddress(_)
                | ClientError::ResponseTooLarge(_)
        )
    }
}

#[derive(Debug, Clone)]
pub struct SnapshotClient {
    http: reqwest::Client,
    max_body: usize,
}

impl SnapshotClient {
    pub fn new() -> Result<Self, ClientError> {
        let http = reqwest::Client::builder()
            .redirect(reqwest::redirect::Policy::none())
            .timeout(REQUEST_TIMEOUT)
            .user_agent(concat!("livewatch/", env!("CARGO_PKG_VERSION")))
            .build()?;
        Ok(Self {
            http,
            max_body: MAX_BODY_SIZE,
        })
    }

    /// Caps the snapshot body size; the default is 10 MB.
    pub fn with_body_limit(mut self, limit: usize) -> Self {
        self.max_body = limit;
        self
    }

    /// Fetches and decodes the snapshot from `address`, the full URL of the
    /// `/stream-data` endpoint.
    pub async fn fetch_snapshot(&self, address: &str) -> Result<Snapshot, ClientError> {
        let url = Url::parse(address)?;
        let response = self
            .http
            .get(url.clone())
            .header(ACCEPT, SNAPSHOT_CONTENT_TYPE)
            .send()
            .await?;

        let response = check_status(&url, response)?;
        let bytes = read_limited_bytes(response, self.max_body)
            .await
            .map_err(|e| match e {
                RequestError::Network(e) => ClientError::Network(e),
                _ => ClientError::ResponseTooLarge(self.max_body),
            })?;
        let snapshot = Snapshot::decode(&bytes)?;
        tracing::debug!(
            followed = snapshot.followed.len(),
            public = snapshot.public.len(),
            "Fetched snapshot"
        );
        Ok(snapshot)
    }

    /// Asks the service to poll now. Returns once the request is queued.
    pub async fn request_check(&self, address: &str) -> Result<(), ClientError> {
        let url = Url::parse(address)?;
        let response = self
            .http
            .post(url.clone())
            .header(ACCEPT, SNAPSHOT_CONTENT_TYPE)
            .send()
            .await?;
        check_status(&url, response)?;
        Ok(())
    }
}

fn check_status(
    request_url: &Url,
    response: reqwest::Response,
) -> Result<reqwest::Response, ClientError> {
    let status = response.status();
    if status.is_success() {
        return Ok(response);
    }
    if status.is_redirection() {
        let location = response
            .headers()
            .get(LOCATION)
            .and_then(|v| v.to_str().ok())
            .ok_or(ClientError::BadRedirect)?;
        let url = request_url
            .join(location)
            .map_err(|_| ClientError::BadRedirect)?;
        return Err(ClientError::AuthorizationRequired {
            url: url.to_string(),
        });
    }
    if status == StatusCode::SERVICE_UNAVAILABLE {
        let retry_after = response
            .headers()
            .get(RETRY_AFTER)
            .and_then(|v| v.to_str().ok())
            .and_then(|v| v.trim().parse::<u64>().ok())
            .map(Duration::from_secs);
        return Err(ClientError::NotReady { retry_after });
    }
    Err(ClientError::HttpStatus(status.as_u16()))
}
