//! On-disk cache of access tokens, keyed by environment name.
//!
//! The file holds bearer credentials, so it is written owner-only (0600)
//! inside an owner-only directory (0700) on Unix.

use std::collections::HashMap;
use std::path::{Path, PathBuf};

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use tokio::fs;
use tokio::io::AsyncWriteExt;
use tracing::{debug, warn};

use crate::types::Result;

/// Seconds before expiry at which a cached token stops being served.
pub const REFRESH_BUFFER_SECS: i64 = 5 * 60;

const CACHE_DIR_NAME: &str = "courier";
const CACHE_FILE_NAME: &str = "tokens.json";

/// Default cache location under the user's config directory.
pub fn default_cache_path() -> Option<PathBuf> {
    dirs::config_dir().map(|dir| dir.join(CACHE_DIR_NAME).join(CACHE_FILE_NAME))
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CachedToken {
    pub access_token: String,
    pub expires_at: DateTime<Utc>,
}

impl CachedToken {
    /// Usable if it expires more than [`REFRESH_BUFFER_SECS`] after `now`.
    pub fn is_fresh(&self, now: DateTime<Utc>) -> bool {
        (self.expires_at - now).num_seconds() > REFRESH_BUFFER_SECS
    }
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct TokenCache {
    #[serde(default)]
    tokens: HashMap<String, CachedToken>,
}

impl TokenCache {
    /// Load the cache from `path`. A missing or unreadable file yields an
    /// empty cache.
    pub async fn load(path: &Path) -> Self {
        let raw = match fs::read_to_string(path).await {
            Ok(raw) => raw,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => {
                debug!(path = %path.display(), "No token cache yet");
                return Self::default();
            }
            Err(e) => {
                warn!(path = %path.display(), error = %e, "Token cache unreadable, starting empty");
                return Self::default();
            }
        };

        match serde_json::from_str(&raw) {
            Ok(cache) => cache,
            Err(e) => {
                warn!(path = %path.display(), error = %e, "Token cache corrupt, starting empty");
                Self::default()
            }
        }
    }

    /// Write the cache to `path`, replacing the previous file.
    pub async fn save(&self, path: &Path) -> Result<()> {
        if let Some(dir) = path.parent() {
            create_private_dir(dir).await?;
        }

        let json = serde_json::to_vec_pretty(self)?;
        let tmp = path.with_extension("json.tmp");
        {
            let mut file = open_private(&tmp).await?;
            file.write_all(&json).await?;
            file.sync_all().await?;
        }
        fs::rename(&tmp, path).await?;

        debug!(path = %path.display(), entries = self.tokens.len(), "Token cache saved");
        Ok(())
    }

    pub fn get(&self, env: &str) -> Option<&CachedToken> {
        self.tokens.get(env)
    }

    pub fn insert(&mut self, env: &str, token: CachedToken) {
        self.tokens.insert(env.to_string(), token);
    }

    pub fn remove(&mut self, env: &str) -> Option<CachedToken> {
        self.tokens.remove(env)
    }

    pub fn len(&self) -> usize {
        self.tokens.len()
    }

    pub fn is_empty(&self) -> bool {
        self.tokens.is_empty()
    }
}

#[cfg(unix)]
async fn create_private_dir(dir: &Path) -> std::io::Result<()> {
    use std::os::unix::fs::PermissionsExt;

    if dir.as_os_str().is_empty() {
        return Ok(());
    }
    if !fs::try_exists(dir).await? {
        fs::DirBuilder::new().recursive(true).mode(0o700).create(dir).await?;
    }
    let mut perms = fs::metadata(dir).await?.permissions();
    if perms.mode() & 0o777 != 0o700 {
        perms.set_mode(0o700);
        fs::set_permissions(dir, perms).await?;
    }
    Ok(())
}

#[cfg(not(unix))]
async fn create_private_dir(dir: &Path) -> std::io::Result<()> {
    if dir.as_os_str().is_empty() {
        return Ok(());
    }
    fs::create_dir_all(dir).await
}

#[cfg(unix)]
async fn open_private(path: &Path) -> std::io::Result<fs::File> {
    use std::os::unix::fs::PermissionsExt;

    let file = fs::OpenOptions::new()
        .write(true)
        .create(true)
        .truncate(true)
        .mode(0o600)
        .open(path)
        .await?;
    // mode() only applies on create
    file.set_permissions(std::fs::Permissions::from_mode(0o600))
        .await?;
    Ok(file)
}

#[cfg(not(unix))]
async fn open_private(path: &Path) -> std::io::Result<fs::File> {
    fs::OpenOptions::new()
        .write(true)
        .create(true)
        .truncate(true)
        .open(path)
        .await
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::Duration;
    use tokio_test::assert_ok;

    fn token(expires_in_secs: i64) -> CachedToken {
        CachedToken {
            access_token: "tok".into(),
            expires_at: Utc::now() + Duration::seconds(expires_in_secs),
        }
    }

    #[test]
    fn test_freshness_buffer() {
        let now = Utc::now();
        let ten_minutes = CachedToken {
            access_token: "a".into(),
            expires_at: now + Duration::minutes(10),
        };
        let three_minutes = CachedToken {
            access_token: "b".into(),
            expires_at: now + Duration::minutes(3),
        };
        let exactly_buffer = CachedToken {
            access_token: "c".into(),
            expires_at: now + Duration::seconds(REFRESH_BUFFER_SECS),
        };

        assert!(ten_minutes.is_fresh(now));
        assert!(!three_minutes.is_fresh(now));
        assert!(!exactly_buffer.is_fresh(now));
    }

    #[tokio::test]
    async fn test_save_and_load() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("nested").join("tokens.json");

        let mut cache = TokenCache::default();
        cache.insert("production", token(3600));
        cache.insert("staging", token(60));
        assert_ok!(cache.save(&path).await);

        let loaded = TokenCache::load(&path).await;
        assert_eq!(loaded, cache);
        assert_eq!(loaded.len(), 2);
    }

    #[tokio::test]
    async fn test_load_missing_or_corrupt_is_empty() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("tokens.json");
        assert!(TokenCache::load(&path).await.is_empty());

        std::fs::write(&path, "{not json").unwrap();
        assert!(TokenCache::load(&path).await.is_empty());
    }

    #[test]
    fn test_remove() {
        let mut cache = TokenCache::default();
        cache.insert("production", token(3600));
        assert!(cache.remove("production").is_some());
        assert!(cache.remove("production").is_none());
        assert!(cache.get("production").is_none());
    }

    #[cfg(unix)]
    #[tokio::test]
    async fn test_saved_file_is_owner_only() {
        use std::os::unix::fs::PermissionsExt;

        let dir = tempfile::tempdir().unwrap();
        let cache_dir = dir.path().join("courier");
        let path = cache_dir.join("tokens.json");

        // Pre-existing world-readable file gets tightened
        std::fs::create_dir_all(&cache_dir).unwrap();
        std::fs::write(&path, "{}").unwrap();
        std::fs::set_permissions(&path, std::fs::Permissions::from_mode(0o644)).unwrap();

        let mut cache = TokenCache::default();
        cache.insert("production", token(3600));
        cache.save(&path).await.unwrap();

        let file_mode = std::fs::metadata(&path).unwrap().permissions().mode() & 0o777;
        let dir_mode = std::fs::metadata(&cache_dir).unwrap().permissions().mode() & 0o777;
        assert_eq!(file_mode, 0o600);
        assert_eq!(dir_mode, 0o700);
    }
}
