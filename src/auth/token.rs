use chrono::{DateTime, TimeDelta, Utc};
use serde::{Deserialize, Serialize};
use std::time::Duration;

/// Issue time and lifetime of a credential.
///
/// Expiry is only ever asked with a buffer, so a credential can be replaced
/// before the next poll would find it dead.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct TokenExpiry {
    pub issued_at: DateTime<Utc>,
    /// Lifetime in seconds, as reported by the token endpoint.
    pub expires_in: u64,
}

impl TokenExpiry {
    pub fn new(issued_at: DateTime<Utc>, expires_in: u64) -> Self {
        Self {
            issued_at,
            expires_in,
        }
    }

    /// Instant after which the credential counts as expired for `buffer`.
    pub fn deadline(&self, buffer: Duration) -> DateTime<Utc> {
        let lifetime = TimeDelta::try_seconds(self.expires_in as i64).unwrap_or(TimeDelta::MAX);
        let buffer = TimeDelta::from_std(buffer).unwrap_or(TimeDelta::MAX);
        self.issued_at
            .checked_add_signed(lifetime)
            .unwrap_or(DateTime::<Utc>::MAX_UTC)
            .checked_sub_signed(buffer)
            .unwrap_or(DateTime::<Utc>::MIN_UTC)
    }

    pub fn is_expired_at(&self, now: DateTime<Utc>, buffer: Duration) -> bool {
        now > self.deadline(buffer)
    }

    pub fn is_expired(&self, buffer: Duration) -> bool {
        self.is_expired_at(Utc::now(), buffer)
    }
}

/// Which of the two credentials an operation targets.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CredentialKind {
    App,
    User,
}

impl std::fmt::Display for CredentialKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            CredentialKind::App => f.write_str("app"),
            CredentialKind::User => f.write_str("user"),
        }
    }
}

/// Service-to-service token from the client-credentials grant.
#[derive(Clone, Serialize, Deserialize)]
pub struct AppCredential {
    pub access_token: String,
    #[serde(default)]
    pub token_type: String,
    #[serde(flatten)]
    pub expiry: TokenExpiry,
}

impl AppCredential {
    pub fn is_expired(&self, buffer: Duration) -> bool {
        self.expiry.is_expired(buffer)
    }
}

/// Delegated token obtained through the authorization-code flow.
#[derive(Clone, Serialize, Deserialize)]
pub struct UserCredential {
    pub access_token: String,
    pub refresh_token: String,
    #[serde(default)]
    pub scope: Vec<String>,
    #[serde(default)]
    pub token_type: String,
    #[serde(flatten)]
    pub expiry: TokenExpiry,
}

impl UserCredential {
    pub fn is_expired(&self, buffer: Duration) -> bool {
        self.expiry.is_expired(buffer)
    }
}

// Token values stay out of logs.
impl std::fmt::Debug for AppCredential {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("AppCredential")
            .field("access_token", &"[REDACTED]")
            .field("token_type", &self.token_type)
            .field("expiry", &self.expiry)
            .finish()
    }
}

impl std::fmt::Debug for UserCredential {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("UserCredential")
            .field("access_token", &"[REDACTED]")
            .field("refresh_token", &"[REDACTED]")
            .field("scope", &self.scope)
            .field("token_type", &self.token_type)
            .field("expiry", &self.expiry)
            .finish()
    }
}
