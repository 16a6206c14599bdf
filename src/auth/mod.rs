//! Credential lifecycle for the followed-feed provider.
//!
//! - [`token`] - credential value types and the shared expiry arithmetic
//! - [`oauth`] - stateless token-endpoint and user-lookup calls
//! - [`manager`] - the App/User credential state machine
//! - [`cache`] - per-record on-disk persistence

mod cache;
mod manager;
mod oauth;
mod token;

pub use cache::{CacheError, CacheRecord, CredentialCache};
pub use manager::{TokenManager, UserCredentialStatus};
pub use oauth::{AuthError, OAuthClient, FOLLOWS_SCOPE};
pub use token::{AppCredential, CredentialKind, TokenExpiry, UserCredential};
