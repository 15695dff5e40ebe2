//! Disk-backed cache for platform API responses
//!
//! One file per cached API path. Entries carry the response payload, the
//! server `Date` header and the status code so conditional requests can
//! replay a `304` from cache. Two expiry classes: short (~60 s) for error
//! responses, long (~48 h) for successful ones. Reading a long entry resets
//! its expiry. Expired entries are removed lazily by the sweep at task
//! teardown.

use std::fs;
use std::path::{Path, PathBuf};
use std::time::{Duration, SystemTime};

use filetime::FileTime;
use serde::{Deserialize, Serialize};
use tracing::debug;

use crate::error::Result;

const SHORT_EXPIRY: Duration = Duration::from_secs(60);
const LONG_EXPIRY: Duration = Duration::from_secs(48 * 3600);

/// A cached API response.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CacheEntry {
    pub payload: serde_json::Value,
    /// Server `Date` header, fed back as `If-Modified-Since`
    pub date: Option<String>,
    pub status: u16,
}

/// Hash a cache key into a filesystem-safe name.
fn hashed(name: &str) -> String {
    blake3::hash(name.as_bytes()).to_hex().to_string()
}

pub struct Cache {
    dir: PathBuf,
}

impl Cache {
    pub fn new(dir: &Path) -> Cache {
        Cache {
            dir: dir.to_path_buf(),
        }
    }

    fn entry_path(&self, name: &str, long: bool) -> PathBuf {
        self.dir
            .join(format!("{}{}", hashed(name), if long { 'l' } else { 's' }))
    }

    /// Fetch a non-expired entry, trying the short class then the long one.
    pub fn get(&self, name: &str) -> Option<CacheEntry> {
        let hashed = hashed(name);
        for class in ['s', 'l'] {
            let path = self.dir.join(format!("{hashed}{class}"));
            let mtime = match fs::metadata(&path).and_then(|m| m.modified()) {
                Ok(mtime) => mtime,
                Err(_) => continue,
            };

            let expiry = if class == 'l' { LONG_EXPIRY } else { SHORT_EXPIRY };
            if mtime + expiry < SystemTime::now() {
                // Expired; drop it now rather than waiting for the sweep.
                let _ = fs::remove_file(&path);
                continue;
            }

            if class == 'l' {
                // Long entries stay fresh while they keep being used.
                let _ = filetime::set_file_mtime(&path, FileTime::now());
            }

            match fs::read(&path) {
                Ok(bytes) => match serde_json::from_slice(&bytes) {
                    Ok(entry) => return Some(entry),
                    Err(_) => {
                        let _ = fs::remove_file(&path);
                    }
                },
                Err(_) => continue,
            }
        }
        None
    }

    /// Store an entry under the given expiry class.
    pub fn set(&self, name: &str, entry: &CacheEntry, long: bool) -> Result<()> {
        let path = self.entry_path(name, long);
        let bytes =
            serde_json::to_vec(entry).map_err(|e| crate::error::Error::Other(e.into()))?;
        fs::write(&path, bytes)?;
        Ok(())
    }

    /// Remove every expired entry. Called once at task teardown.
    pub fn sweep(&self) {
        let entries = match fs::read_dir(&self.dir) {
            Ok(entries) => entries,
            Err(_) => return,
        };
        let now = SystemTime::now();
        for entry in entries.flatten() {
            let path = entry.path();
            let name = match path.file_name().and_then(|n| n.to_str()) {
                Some(name) => name,
                None => continue,
            };
            let expiry = match name.chars().last() {
                Some('l') => LONG_EXPIRY,
                Some('s') => SHORT_EXPIRY,
                _ => continue,
            };
            let expired = entry
                .metadata()
                .and_then(|m| m.modified())
                .map(|mtime| mtime + expiry < now)
                .unwrap_or(false);
            if expired {
                debug!(entry = name, "removing expired cache entry");
                let _ = fs::remove_file(&path);
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::tempdir;

    fn entry(status: u16) -> CacheEntry {
        CacheEntry {
            payload: serde_json::json!({"tag_name": "v1"}),
            date: Some("Mon, 27 Jul 2026 10:00:00 GMT".into()),
            status,
        }
    }

    #[test]
    fn set_then_get_roundtrips() {
        let tmp = tempdir().unwrap();
        let cache = Cache::new(tmp.path());

        cache.set("/repos/acme/proj", &entry(200), true).unwrap();
        let got = cache.get("/repos/acme/proj").unwrap();
        assert_eq!(got.status, 200);
        assert_eq!(got.payload["tag_name"], "v1");
    }

    #[test]
    fn miss_on_unknown_key() {
        let tmp = tempdir().unwrap();
        let cache = Cache::new(tmp.path());
        assert!(cache.get("/repos/none").is_none());
    }

    #[test]
    fn expired_short_entry_is_dropped_on_read() {
        let tmp = tempdir().unwrap();
        let cache = Cache::new(tmp.path());
        cache.set("/rate", &entry(403), false).unwrap();

        // Age the file past the short expiry.
        let path = cache.entry_path("/rate", false);
        let old = FileTime::from_unix_time(
            chrono::Utc::now().timestamp() - 3600,
            0,
        );
        filetime::set_file_mtime(&path, old).unwrap();

        assert!(cache.get("/rate").is_none());
        assert!(!path.exists());
    }

    #[test]
    fn sweep_removes_only_expired_files() {
        let tmp = tempdir().unwrap();
        let cache = Cache::new(tmp.path());
        cache.set("/fresh", &entry(200), true).unwrap();
        cache.set("/stale", &entry(404), false).unwrap();

        let stale = cache.entry_path("/stale", false);
        let old = FileTime::from_unix_time(
            chrono::Utc::now().timestamp() - 3600,
            0,
        );
        filetime::set_file_mtime(&stale, old).unwrap();

        cache.sweep();
        assert!(cache.entry_path("/fresh", true).exists());
        assert!(!stale.exists());
    }

    #[test]
    fn long_read_refreshes_expiry() {
        let tmp = tempdir().unwrap();
        let cache = Cache::new(tmp.path());
        cache.set("/repo", &entry(200), true).unwrap();

        let path = cache.entry_path("/repo", true);
        // One hour old, still within the long class.
        let old = FileTime::from_unix_time(
            chrono::Utc::now().timestamp() - 3600,
            0,
        );
        filetime::set_file_mtime(&path, old).unwrap();

        assert!(cache.get("/repo").is_some());
        let mtime = FileTime::from_last_modification_time(&fs::metadata(&path).unwrap());
        assert!(mtime.unix_seconds() > chrono::Utc::now().timestamp() - 60);
    }
}
