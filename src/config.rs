//! Configuration file parser for ~/.config/livewatch/config.toml.
//!
//! The file is optional; a missing file yields `Config::default()`. Unknown keys
//! are accepted but logged, since they are usually typos.
use secrecy::SecretString;
use serde::Deserialize;
use std::path::{Path, PathBuf};
use std::time::Duration;
use thiserror::Error;
use url::Url;

/// Overrides `client_secret` from the file.
pub const CLIENT_SECRET_ENV: &str = "LIVEWATCH_CLIENT_SECRET";

#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("Failed to read config file: {0}")]
    Io(#[from] std::io::Error),

    #[error("Invalid TOML in config file: {0}")]
    Parse(#[from] toml::de::Error),

    #[error("Config file too large: {0}")]
    TooLarge(String),

    #[error("Missing required setting: {0}")]
    Missing(&'static str),

    #[error("Invalid value for {key}: {reason}")]
    Invalid { key: &'static str, reason: String },
}

/// Provider base URLs. Overridable so tests and mirrors can redirect them.
#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct Endpoints {
    /// OAuth base; `/token` and `/authorize` are appended.
    pub auth: String,
    /// API base; `/users`, `/channels/followed` and `/streams` are appended.
    pub api: String,
    /// Full URL of the public channel list.
    pub public: String,
}

impl Default for Endpoints {
    fn default() -> Self {
        Self {
            auth: "https://id.twitch.tv/oauth2".to_string(),
            api: "https://api.twitch.tv/helix".to_string(),
            public: "https://strims.gg/api".to_string(),
        }
    }
}

/// Parsed form of [`Endpoints`].
#[derive(Debug, Clone)]
pub struct EndpointUrls {
    pub auth: Url,
    pub api: Url,
    pub public: Url,
}

impl Endpoints {
    pub fn parse(&self) -> Result<EndpointUrls, ConfigError> {
        Ok(EndpointUrls {
            auth: parse_url("endpoints.auth", &self.auth)?,
            api: parse_url("endpoints.api", &self.api)?,
            public: parse_url("endpoints.public", &self.public)?,
        })
    }
}

fn parse_url(key: &'static str, value: &str) -> Result<Url, ConfigError> {
    let url = Url::parse(value).map_err(|e| ConfigError::Invalid {
        key,
        reason: e.to_string(),
    })?;
    match url.scheme() {
        "http" | "https" => Ok(url),
        other => Err(ConfigError::Invalid {
            key,
            reason: format!("unsupported scheme '{}'", other),
        }),
    }
}

/// Top-level configuration.
///
/// Every field has a default so any subset of keys can be given. The client
/// secret is masked in `Debug` output.
#[derive(Clone, Deserialize)]
#[serde(default)]
pub struct Config {
    /// Address the snapshot service binds.
    pub listen_addr: String,

    /// Registered OAuth redirect; must route to this service's `/oauth-callback`.
    pub redirect_uri: String,

    /// Seconds between poll cycles. Also the credential expiry buffer.
    pub poll_interval_secs: u64,

    pub client_id: String,

    /// Prefer the `LIVEWATCH_CLIENT_SECRET` env var; it wins when both are set.
    pub client_secret: Option<String>,

    /// Login of the follower account, used to look up its id.
    pub user_name: Option<String>,

    /// Follower account id; skips the lookup when set.
    pub user_id: Option<String>,

    /// Credential cache directory. Defaults to the config directory.
    pub cache_dir: Option<PathBuf>,

    pub endpoints: Endpoints,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            listen_addr: "127.0.0.1:8080".to_string(),
            redirect_uri: "http://localhost:8080/oauth-callback".to_string(),
            poll_interval_secs: 30,
            client_id: String::new(),
            client_secret: None,
            user_name: None,
            user_id: None,
            cache_dir: None,
            endpoints: Endpoints::default(),
        }
    }
}

impl std::fmt::Debug for Config {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Config")
            .field("listen_addr", &self.listen_addr)
            .field("redirect_uri", &self.redirect_uri)
            .field("poll_interval_secs", &self.poll_interval_secs)
            .field("client_id", &self.client_id)
            .field(
                "client_secret",
                &self.client_secret.as_ref().map(|_| "[REDACTED]"),
            )
            .field("user_name", &self.user_name)
            .field("user_id", &self.user_id)
            .field("cache_dir", &self.cache_dir)
            .field("endpoints", &self.endpoints)
            .finish()
    }
}

const KNOWN_KEYS: [&str; 9] = [
    "listen_addr",
    "redirect_uri",
    "poll_interval_secs",
    "client_id",
    "client_secret",
    "user_name",
    "user_id",
    "cache_dir",
    "endpoints",
];

const KNOWN_ENDPOINT_KEYS: [&str; 3] = ["auth", "api", "public"];

impl Config {
    /// Maximum config file size (1 MB).
    const MAX_FILE_SIZE: u64 = 1_048_576;

    /// Load configuration from a TOML file.
    ///
    /// - Missing or empty file → `Ok(Config::default())`
    /// - Invalid TOML → `Err(ConfigError::Parse)` with line info
    /// - Unknown keys → accepted, logged as a warning
    pub fn load(path: &Path) -> Result<Self, ConfigError> {
        match std::fs::metadata(path) {
            Ok(meta) if meta.len() > Self::MAX_FILE_SIZE => {
                return Err(ConfigError::TooLarge(format!(
                    "Config file is {} bytes (max {} bytes)",
                    meta.len(),
                    Self::MAX_FILE_SIZE
                )));
            }
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => {
                tracing::debug!(path = %path.display(), "No config file found, using defaults");
                return Ok(Self::default());
            }
            Err(e) => return Err(ConfigError::Io(e)),
            Ok(_) => {}
        }

        let content = match std::fs::read_to_string(path) {
            Ok(c) => c,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => {
                tracing::debug!(path = %path.display(), "Config file disappeared, using defaults");
                return Ok(Self::default());
            }
            Err(e) => return Err(ConfigError::Io(e)),
        };

        if content.trim().is_empty() {
            tracing::debug!(path = %path.display(), "Config file is empty, using defaults");
            return Ok(Self::default());
        }

        if let Ok(raw) = content.parse::<toml::Table>() {
            warn_unknown_keys(&raw);
        }

        let config: Config = toml::from_str(&content)?;
        tracing::info!(
            path = %path.display(),
            listen_addr = %config.listen_addr,
            poll_interval_secs = config.poll_interval_secs,
            "Loaded configuration"
        );
        Ok(config)
    }

    pub fn poll_interval(&self) -> Result<Duration, ConfigError> {
        if self.poll_interval_secs == 0 {
            return Err(ConfigError::Invalid {
                key: "poll_interval_secs",
                reason: "must be at least 1".to_string(),
            });
        }
        Ok(Duration::from_secs(self.poll_interval_secs))
    }

    pub fn require_client_id(&self) -> Result<&str, ConfigError> {
        match self.client_id.trim() {
            "" => Err(ConfigError::Missing("client_id")),
            id => Ok(id),
        }
    }

    /// The follower account must be identified by id or by login.
    pub fn require_follower(&self) -> Result<(), ConfigError> {
        let present = |v: &Option<String>| v.as_deref().is_some_and(|v| !v.trim().is_empty());
        if present(&self.user_id) || present(&self.user_name) {
            Ok(())
        } else {
            Err(ConfigError::Missing("user_name or user_id"))
        }
    }

    /// Client secret from `LIVEWATCH_CLIENT_SECRET`, falling back to the file.
    pub fn client_secret(&self) -> Result<SecretString, ConfigError> {
        self.client_secret_with(std::env::var(CLIENT_SECRET_ENV).ok())
    }

    fn client_secret_with(&self, env_value: Option<String>) -> Result<SecretString, ConfigError> {
        env_value
            .filter(|v| !v.is_empty())
            .or_else(|| self.client_secret.clone().filter(|v| !v.is_empty()))
            .map(SecretString::from)
            .ok_or(ConfigError::Missing("client_secret"))
    }

    /// `cache_dir`, or `default_dir` when unset.
    pub fn cache_dir_or(&self, default_dir: &Path) -> PathBuf {
        self.cache_dir
            .clone()
            .unwrap_or_else(|| default_dir.to_path_buf())
    }
}

fn warn_unknown_keys(raw: &toml::Table) {
    for key in raw.keys() {
        if !KNOWN_KEYS.contains(&key.as_str()) {
            tracing::warn!(key = %key, "Unknown key in config file, ignoring");
        }
    }
    if let Some(toml::Value::Table(endpoints)) = raw.get("endpoints") {
        for key in endpoints.keys() {
            if !KNOWN_ENDPOINT_KEYS.contains(&key.as_str()) {
                tracing::warn!(key = %key, "Unknown key in [endpoints], ignoring");
            }
        }
    }
}
