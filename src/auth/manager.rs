use super::cache::{CacheError, CacheRecord, CredentialCache};
use super::oauth::{AuthError, OAuthClient};
use super::token::{AppCredential, CredentialKind, UserCredential};
use std::time::Duration;

/// Outcome of [`TokenManager::ensure_user_credential`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum UserCredentialStatus {
    /// No credential; only the interactive flow can produce one.
    Absent,
    /// Present and not expired within the buffer.
    Valid,
    /// Was expired and has been refreshed.
    Refreshed,
    /// Refresh was rejected; the credential has been cleared.
    ReauthorizationRequired,
}

/// Owns the App and User credential lifecycle.
///
/// ```text
/// Absent --fetch/exchange--> Valid --time--> Expired --refresh--> Valid
///    ^                                          |
///    +-------------- rejected (401) ------------+
/// ```
///
/// Expiry checks use `buffer` (the poll interval) so a credential is replaced
/// one interval before it would actually lapse.
#[derive(Debug)]
pub struct TokenManager {
    oauth: OAuthClient,
    cache: Option<CredentialCache>,
    buffer: Duration,
    app: Option<AppCredential>,
    user: Option<UserCredential>,
    user_id: Option<String>,
    /// Set when a record changed since the last persist.
    dirty: bool,
}

impl TokenManager {
    pub fn new(oauth: OAuthClient, cache: Option<CredentialCache>, buffer: Duration) -> Self {
        Self {
            oauth,
            cache,
            buffer,
            app: None,
            user: None,
            user_id: None,
            dirty: false,
        }
    }

    pub fn oauth(&self) -> &OAuthClient {
        &self.oauth
    }

    pub fn app_credential(&self) -> Option<&AppCredential> {
        self.app.as_ref()
    }

    pub fn user_credential(&self) -> Option<&UserCredential> {
        self.user.as_ref()
    }

    pub fn has_user_credential(&self) -> bool {
        self.user.is_some()
    }

    pub fn user_id(&self) -> Option<&str> {
        self.user_id.as_deref()
    }

    pub fn set_user_id(&mut self, user_id: impl Into<String>) {
        self.user_id = Some(user_id.into());
        self.dirty = true;
    }

    /// Fetches a new App credential when absent or expired within the buffer.
    pub async fn ensure_app_credential(&mut self) -> Result<&AppCredential, AuthError> {
        let app = match self.app.take() {
            Some(app) if !app.is_expired(self.buffer) => app,
            _ => {
                tracing::info!("Fetching app credential");
                let fresh = self.oauth.fetch_app_credential().await?;
                self.dirty = true;
                fresh
            }
        };
        Ok(&*self.app.insert(app))
    }

    /// Refreshes the User credential when it is present and expired.
    ///
    /// A rejected refresh clears the credential and reports
    /// [`UserCredentialStatus::ReauthorizationRequired`]; other failures are
    /// returned as errors and leave the credential in place.
    pub async fn ensure_user_credential(&mut self) -> Result<UserCredentialStatus, AuthError> {
        let Some(current) = self.user.as_ref() else {
            return Ok(UserCredentialStatus::Absent);
        };
        if !current.is_expired(self.buffer) {
            return Ok(UserCredentialStatus::Valid);
        }

        tracing::info!("Refreshing user credential");
        let result = self.oauth.refresh_user_credential(current).await;
        match result {
            Ok(refreshed) => {
                self.user = Some(refreshed);
                self.dirty = true;
                Ok(UserCredentialStatus::Refreshed)
            }
            Err(e) if e.is_unauthorized() => {
                tracing::warn!("User credential refresh rejected, reauthorization required");
                self.invalidate(CredentialKind::User);
                Ok(UserCredentialStatus::ReauthorizationRequired)
            }
            Err(e) => Err(e),
        }
    }

    /// Exchanges an authorization code and stores the resulting credential.
    /// On failure the User credential stays absent.
    pub async fn exchange_authorization_code(
        &mut self,
        code: &str,
        redirect_uri: &str,
    ) -> Result<(), AuthError> {
        let credential = self
            .oauth
            .exchange_authorization_code(code, redirect_uri)
            .await?;
        self.install_user_credential(credential);
        Ok(())
    }

    /// Installs a User credential obtained elsewhere (the callback endpoint
    /// exchanges the code outside the shared lock).
    pub fn install_user_credential(&mut self, credential: UserCredential) {
        tracing::info!(scope = ?credential.scope, "User credential installed");
        self.user = Some(credential);
        self.dirty = true;
    }

    /// Clears the credential in memory. The cached record is left alone; a
    /// stale record is rejected by the expiry check on the next load.
    pub fn invalidate(&mut self, kind: CredentialKind) {
        tracing::debug!(credential = %kind, "Invalidating credential");
        match kind {
            CredentialKind::App => self.app = None,
            CredentialKind::User => self.user = None,
        }
    }

    /// Resolves the user id from the configured login when not yet known.
    pub async fn ensure_user_id(&mut self, user_name: Option<&str>) -> Result<&str, AuthError> {
        let id = match self.user_id.take() {
            Some(id) => id,
            None => {
                let login = user_name.ok_or(AuthError::MissingUserName)?;
                let app = self.ensure_app_credential().await?.clone();
                let id = self.oauth.lookup_user_id(&app, login).await?;
                tracing::info!(login = %login, user_id = %id, "Resolved user id");
                self.dirty = true;
                id
            }
        };
        Ok(self.user_id.insert(id).as_str())
    }

    /// Loads whatever cached records exist. Missing or corrupt records are a
    /// cold start for that record; credentials already expired are skipped.
    pub fn load_cached(&mut self) {
        let Some(cache) = self.cache.as_ref() else {
            return;
        };

        if self.app.is_none() {
            match load_record::<AppCredential>(cache, CacheRecord::AppCredential) {
                Some(app) if !app.is_expired(Duration::ZERO) => self.app = Some(app),
                Some(_) => tracing::debug!("Cached app credential expired, ignoring"),
                None => {}
            }
        }
        if self.user.is_none() {
            match load_record::<UserCredential>(cache, CacheRecord::UserCredential) {
                Some(user) if !user.is_expired(Duration::ZERO) => self.user = Some(user),
                Some(_) => tracing::debug!("Cached user credential expired, ignoring"),
                None => {}
            }
        }
        if self.user_id.is_none() {
            self.user_id = load_record::<String>(cache, CacheRecord::UserId);
        }
    }

    /// Saves every record currently held. Absent values are not written.
    pub fn persist_cached(&mut self) -> Result<(), CacheError> {
        let Some(cache) = self.cache.as_ref() else {
            self.dirty = false;
            return Ok(());
        };
        if let Some(app) = &self.app {
            cache.save(CacheRecord::AppCredential, app)?;
        }
        if let Some(user) = &self.user {
            cache.save(CacheRecord::UserCredential, user)?;
        }
        if let Some(user_id) = &self.user_id {
            cache.save(CacheRecord::UserId, user_id)?;
        }
        self.dirty = false;
        Ok(())
    }

    /// Persists only when something changed since the last save.
    pub fn persist_if_changed(&mut self) -> Result<(), CacheError> {
        if self.dirty {
            self.persist_cached()?;
        }
        Ok(())
    }
}

fn load_record<T: serde::de::DeserializeOwned>(
    cache: &CredentialCache,
    record: CacheRecord,
) -> Option<T> {
    match cache.load(record) {
        Ok(value) => value,
        Err(e) => {
            tracing::warn!(record = ?record, error = %e, "Ignoring unreadable cache record");
            None
        }
    }
}
