use super::token::{AppCredential, TokenExpiry, UserCredential};
use crate::http::{endpoint, send_json, RequestError, PROVIDER_TIMEOUT};
use chrono::Utc;
use secrecy::{ExposeSecret, SecretString};
use serde::Deserialize;
use std::sync::Arc;
use thiserror::Error;
use url::Url;

/// Scope requested in the authorization-code flow.
pub const FOLLOWS_SCOPE: &str = "user:read:follows";

#[derive(Debug, Error)]
pub enum AuthError {
    #[error(transparent)]
    Request(#[from] RequestError),

    #[error("Token response did not include a refresh token")]
    MissingRefreshToken,

    #[error("No user name configured to look up the user id")]
    MissingUserName,

    #[error("No user found for login '{0}'")]
    UserNotFound(String),
}

impl AuthError {
    /// True when the provider rejected the credential or grant.
    pub fn is_unauthorized(&self) -> bool {
        matches!(self, AuthError::Request(RequestError::Unauthorized))
    }
}

#[derive(Debug, Deserialize)]
struct TokenResponse {
    access_token: String,
    expires_in: u64,
    #[serde(default)]
    token_type: String,
    refresh_token: Option<String>,
    #[serde(default)]
    scope: Vec<String>,
}

#[derive(Debug, Deserialize)]
struct UsersResponse {
    data: Vec<UserData>,
}

#[derive(Debug, Deserialize)]
struct UserData {
    id: String,
}

/// Stateless token-endpoint and user-lookup calls.
///
/// Cheap to clone; the snapshot service keeps its own copy so the
/// authorization-code exchange never runs under the poller lock.
#[derive(Clone)]
pub struct OAuthClient {
    http: reqwest::Client,
    auth_base: Url,
    api_base: Url,
    client_id: String,
    client_secret: Arc<SecretString>,
}

impl std::fmt::Debug for OAuthClient {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("OAuthClient")
            .field("auth_base", &self.auth_base.as_str())
            .field("api_base", &self.api_base.as_str())
            .field("client_id", &self.client_id)
            .field("client_secret", &"[REDACTED]")
            .finish()
    }
}

impl OAuthClient {
    pub fn new(
        http: reqwest::Client,
        auth_base: Url,
        api_base: Url,
        client_id: impl Into<String>,
        client_secret: SecretString,
    ) -> Self {
        Self {
            http,
            auth_base,
            api_base,
            client_id: client_id.into(),
            client_secret: Arc::new(client_secret),
        }
    }

    pub fn client_id(&self) -> &str {
        &self.client_id
    }

    pub fn api_base(&self) -> &Url {
        &self.api_base
    }

    pub fn http(&self) -> &reqwest::Client {
        &self.http
    }

    /// Provider page the user is sent to for granting follow access.
    pub fn authorize_url(&self, redirect_uri: &str) -> Url {
        let mut url = endpoint(&self.auth_base, &["authorize"]);
        url.query_pairs_mut()
            .append_pair("client_id", &self.client_id)
            .append_pair("redirect_uri", redirect_uri)
            .append_pair("response_type", "code")
            .append_pair("scope", FOLLOWS_SCOPE);
        url
    }

    /// Client-credentials grant.
    pub async fn fetch_app_credential(&self) -> Result<AppCredential, AuthError> {
        let token = self
            .token_request(&[("grant_type", "client_credentials")])
            .await?;
        Ok(AppCredential {
            access_token: token.access_token,
            token_type: token.token_type,
            expiry: TokenExpiry::new(Utc::now(), token.expires_in),
        })
    }

    /// Authorization-code grant.
    pub async fn exchange_authorization_code(
        &self,
        code: &str,
        redirect_uri: &str,
    ) -> Result<UserCredential, AuthError> {
        let token = self
            .token_request(&[
                ("grant_type", "authorization_code"),
                ("code", code),
                ("redirect_uri", redirect_uri),
            ])
            .await?;
        user_credential_from(token, None)
    }

    /// Refresh-token grant.
    ///
    /// The provider answers a revoked or unknown refresh token with 400, so
    /// both 400 and 401 are reported as [`RequestError::Unauthorized`].
    pub async fn refresh_user_credential(
        &self,
        current: &UserCredential,
    ) -> Result<UserCredential, AuthError> {
        let token = self
            .token_request(&[
                ("grant_type", "refresh_token"),
                ("refresh_token", current.refresh_token.as_str()),
            ])
            .await
            .map_err(|e| match e {
                AuthError::Request(RequestError::HttpStatus(400)) => {
                    AuthError::Request(RequestError::Unauthorized)
                }
                other => other,
            })?;
        user_credential_from(token, Some(&current.refresh_token))
    }

    /// Resolves a login name to the provider's user id.
    pub async fn lookup_user_id(
        &self,
        app: &AppCredential,
        login: &str,
    ) -> Result<String, AuthError> {
        let mut url = endpoint(&self.api_base, &["users"]);
        url.query_pairs_mut().append_pair("login", login);

        let users: UsersResponse = send_json(
            self.http
                .get(url)
                .bearer_auth(&app.access_token)
                .header("Client-Id", &self.client_id),
            PROVIDER_TIMEOUT,
        )
        .await?;

        users
            .data
            .into_iter()
            .next()
            .map(|user| user.id)
            .ok_or_else(|| AuthError::UserNotFound(login.to_string()))
    }

    async fn token_request(&self, params: &[(&str, &str)]) -> Result<TokenResponse, AuthError> {
        let mut url = endpoint(&self.auth_base, &["token"]);
        {
            let mut query = url.query_pairs_mut();
            query
                .append_pair("client_id", &self.client_id)
                .append_pair("client_secret", self.client_secret.expose_secret());
            for (key, value) in params {
                query.append_pair(key, value);
            }
        }

        let request = self.http.post(url).header("Client-Id", &self.client_id);
        Ok(send_json(request, PROVIDER_TIMEOUT).await?)
    }
}

fn user_credential_from(
    token: TokenResponse,
    previous_refresh: Option<&str>,
) -> Result<UserCredential, AuthError> {
    // A refresh response may omit the refresh token; keep the one we have.
    let refresh_token = token
        .refresh_token
        .or_else(|| previous_refresh.map(str::to_string))
        .ok_or(AuthError::MissingRefreshToken)?;
    Ok(UserCredential {
        access_token: token.access_token,
        refresh_token,
        scope: token.scope,
        token_type: token.token_type,
        expiry: TokenExpiry::new(Utc::now(), token.expires_in),
    })
}
