//! Shared request plumbing for provider calls.
//!
//! Every provider call goes through [`send_json`]: a bounded timeout around the
//! whole exchange, status mapping (401 is kept distinct so callers can
//! invalidate the credential that was rejected), a size-limited body read and
//! a `serde_json` decode.
use futures::StreamExt;
use serde::de::DeserializeOwned;
use std::time::Duration;
use thiserror::Error;
use url::Url;

/// Per-call timeout for provider requests.
pub const PROVIDER_TIMEOUT: Duration = Duration::from_secs(5);

pub(crate) const MAX_BODY_SIZE: usize = 10 * 1024 * 1024; // 10MB

/// Errors from a single provider request.
#[derive(Debug, Error)]
pub enum RequestError {
    /// Network-level error (DNS, connection, TLS, etc.)
    #[error("Request failed: {0}")]
    Network(#[from] reqwest::Error),
    /// The request did not complete within its timeout
    #[error("Request timed out after {0:?}")]
    Timeout(Duration),
    /// The provider rejected the credential (HTTP 401)
    #[error("Unauthorized")]
    Unauthorized,
    /// HTTP response with any other non-2xx status code
    #[error("HTTP error: status {0}")]
    HttpStatus(u16),
    /// Body could not be decoded into the expected shape
    #[error("Decode error: {0}")]
    Decode(String),
    /// Response body exceeded the size limit
    #[error("Response too large")]
    ResponseTooLarge,
}

impl RequestError {
    pub fn is_unauthorized(&self) -> bool {
        matches!(self, RequestError::Unauthorized)
    }
}

/// Appends path segments to a base URL (`https://host/api` + `users` ->
/// `https://host/api/users`), unlike `Url::join` which replaces the last one.
pub fn endpoint(base: &Url, segments: &[&str]) -> Url {
    let mut url = base.clone();
    if let Ok(mut path) = url.path_segments_mut() {
        path.pop_if_empty().extend(segments);
    }
    url
}

/// Sends `request` and decodes a JSON body into `T`.
pub async fn send_json<T: DeserializeOwned>(
    request: reqwest::RequestBuilder,
    timeout: Duration,
) -> Result<T, RequestError> {
    let bytes = tokio::time::timeout(timeout, async {
        let response = request.send().await?;
        let status = response.status();
        if status == reqwest::StatusCode::UNAUTHORIZED {
            return Err(RequestError::Unauthorized);
        }
        if !status.is_success() {
            return Err(RequestError::HttpStatus(status.as_u16()));
        }
        read_limited_bytes(response, MAX_BODY_SIZE).await
    })
    .await
    .map_err(|_| RequestError::Timeout(timeout))??;

    serde_json::from_slice(&bytes).map_err(|e| RequestError::Decode(e.to_string()))
}

/// Reads the body, giving up as soon as it is known to exceed `limit`.
pub(crate) async fn read_limited_bytes(
    response: reqwest::Response,
    limit: usize,
) -> Result<Vec<u8>, RequestError> {
    if let Some(len) = response.content_length() {
        if len as usize > limit {
            return Err(RequestError::ResponseTooLarge);
        }
    }

    let mut bytes = Vec::new();
    let mut stream = response.bytes_stream();
    while let Some(chunk) = stream.next().await {
        let chunk = chunk?;
        if bytes.len().saturating_add(chunk.len()) > limit {
            return Err(RequestError::ResponseTooLarge);
        }
        bytes.extend_from_slice(&chunk);
    }
    Ok(bytes)
}
