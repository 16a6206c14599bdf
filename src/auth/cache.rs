//! On-disk records for credentials and the resolved user id.
//!
//! Each record is one JSON file in the cache directory and is loaded
//! independently; a missing or unreadable record is the caller's cold start.
use serde::de::DeserializeOwned;
use serde::Serialize;
use std::path::{Path, PathBuf};
use thiserror::Error;

#[derive(Debug, Error)]
pub enum CacheError {
    #[error("Cache I/O error: {0}")]
    Io(#[from] std::io::Error),

    #[error("Corrupt cache record: {0}")]
    Decode(#[from] serde_json::Error),

    #[error("Empty cache record: {0}")]
    Empty(String),
}

/// Names of the persisted records.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CacheRecord {
    AppCredential,
    UserCredential,
    UserId,
}

impl CacheRecord {
    fn file_name(self) -> &'static str {
        match self {
            CacheRecord::AppCredential => "app_credential.json",
            CacheRecord::UserCredential => "user_credential.json",
            CacheRecord::UserId => "user_id.json",
        }
    }
}

#[derive(Debug, Clone)]
pub struct CredentialCache {
    dir: PathBuf,
}

impl CredentialCache {
    pub fn new(dir: impl Into<PathBuf>) -> Self {
        Self { dir: dir.into() }
    }

    pub fn dir(&self) -> &Path {
        &self.dir
    }

    /// Reads a record. `Ok(None)` when the file does not exist.
    pub fn load<T: DeserializeOwned>(&self, record: CacheRecord) -> Result<Option<T>, CacheError> {
        let path = self.dir.join(record.file_name());
        let data = match std::fs::read(&path) {
            Ok(data) => data,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(None),
            Err(e) => return Err(CacheError::Io(e)),
        };
        if data.is_empty() {
            return Err(CacheError::Empty(record.file_name().to_string()));
        }
        Ok(Some(serde_json::from_slice(&data)?))
    }

    /// Writes a record through a temp file and rename so a crash never
    /// leaves a half-written record behind.
    pub fn save<T: Serialize>(&self, record: CacheRecord, value: &T) -> Result<(), CacheError> {
        std::fs::create_dir_all(&self.dir)?;
        let path = self.dir.join(record.file_name());
        let temp_path = path.with_extension("json.tmp");
        let data = serde_json::to_vec(value)?;
        std::fs::write(&temp_path, data)?;

        #[cfg(unix)]
        {
            use std::os::unix::fs::PermissionsExt;
            if let Err(e) =
                std::fs::set_permissions(&temp_path, std::fs::Permissions::from_mode(0o600))
            {
                tracing::warn!(
                    path = %temp_path.display(),
                    error = %e,
                    "Failed to restrict cache file permissions"
                );
            }
        }

        std::fs::rename(&temp_path, &path).inspect_err(|_| {
            let _ = std::fs::remove_file(&temp_path);
        })?;
        Ok(())
    }
}
