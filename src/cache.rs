//! Profile storage settings and the consent cache.

use crate::discovery::BackendKind;
use serde::{Deserialize, Serialize};
use std::collections::BTreeSet;
use std::io;
use std::path::{Path, PathBuf};
use std::sync::{Mutex, PoisonError};

const CONSENT_FILE: &str = "consent.json";

/// Where a profile keeps state that outlives a session
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum CacheStorage {
    InMemory,
    OnDisk(PathBuf),
}

/// Storage and backend settings for a profile
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct StorageConfig {
    pub storage: CacheStorage,
    pub backend: BackendKind,
}

impl StorageConfig {
    pub fn in_memory() -> Self {
        Self {
            storage: CacheStorage::InMemory,
            backend: BackendKind::Cloud,
        }
    }

    pub fn on_disk(dir: impl Into<PathBuf>) -> Self {
        Self {
            storage: CacheStorage::OnDisk(dir.into()),
            backend: BackendKind::Cloud,
        }
    }

    #[must_use]
    pub fn with_backend(mut self, backend: BackendKind) -> Self {
        self.backend = backend;
        self
    }
}

impl Default for StorageConfig {
    fn default() -> Self {
        Self::in_memory()
    }
}

#[derive(Debug, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
struct ConsentRecord {
    accepted_endpoints: BTreeSet<String>,
}

/// Endpoints the user answered `AcceptAlways` for
pub(crate) struct ConsentCache {
    path: Option<PathBuf>,
    accepted: Mutex<BTreeSet<String>>,
}

impl ConsentCache {
    /// Open the cache, creating the cache directory for on-disk storage
    pub(crate) fn open(config: &StorageConfig) -> io::Result<Self> {
        let path = match &config.storage {
            CacheStorage::InMemory => None,
            CacheStorage::OnDisk(dir) => {
                std::fs::create_dir_all(dir)?;
                Some(dir.join(CONSENT_FILE))
            }
        };
        let accepted = match &path {
            Some(path) if path.exists() => load(path)?.accepted_endpoints,
            _ => BTreeSet::new(),
        };
        Ok(Self {
            path,
            accepted: Mutex::new(accepted),
        })
    }

    pub(crate) fn is_accepted(&self, url: &str) -> bool {
        self.accepted
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .contains(url)
    }

    /// Remember `url`; persisted immediately for on-disk storage
    pub(crate) fn remember(&self, url: &str) -> io::Result<()> {
        let mut accepted = self.accepted.lock().unwrap_or_else(PoisonError::into_inner);
        if !accepted.insert(url.to_string()) {
            return Ok(());
        }
        match &self.path {
            Some(path) => store(
                path,
                &ConsentRecord {
                    accepted_endpoints: accepted.clone(),
                },
            ),
            None => Ok(()),
        }
    }
}

fn load(path: &Path) -> io::Result<ConsentRecord> {
    let bytes = std::fs::read(path)?;
    Ok(serde_json::from_slice(&bytes)?)
}

fn store(path: &Path, record: &ConsentRecord) -> io::Result<()> {
    let tmp = path.with_extension("json.tmp");
    std::fs::write(&tmp, serde_json::to_vec_pretty(record)?)?;
    std::fs::rename(tmp, path)
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::tempdir;

    #[test]
    fn test_in_memory_cache() -> io::Result<()> {
        let cache = ConsentCache::open(&StorageConfig::in_memory())?;
        assert!(!cache.is_accepted("https://policy.contoso.com"));
        cache.remember("https://policy.contoso.com")?;
        assert!(cache.is_accepted("https://policy.contoso.com"));
        Ok(())
    }

    #[test]
    fn test_on_disk_cache_persists() -> io::Result<()> {
        let dir = tempdir()?;
        let cache_dir = dir.path().join("mip_data");
        let config = StorageConfig::on_disk(&cache_dir);

        let cache = ConsentCache::open(&config)?;
        cache.remember("https://policy.contoso.com")?;
        assert!(cache_dir.join(CONSENT_FILE).exists());

        let reopened = ConsentCache::open(&config)?;
        assert!(reopened.is_accepted("https://policy.contoso.com"));
        assert!(!reopened.is_accepted("https://policy.fabrikam.com"));
        Ok(())
    }

    #[test]
    fn test_corrupt_cache_file_is_an_error() -> io::Result<()> {
        let dir = tempdir()?;
        std::fs::write(dir.path().join(CONSENT_FILE), b"{not json")?;
        assert!(ConsentCache::open(&StorageConfig::on_disk(dir.path())).is_err());
        Ok(())
    }

    #[test]
    fn test_backend_selection() {
        let config = StorageConfig::in_memory().with_backend(BackendKind::OnPremises);
        assert_eq!(config.backend, BackendKind::OnPremises);
        assert_eq!(StorageConfig::default().backend, BackendKind::Cloud);
    }
}
