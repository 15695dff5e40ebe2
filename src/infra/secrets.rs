//! Secret storage
//!
//! Credentials (e.g. the GitHub API token) are looked up by name, preferring
//! the OS credential manager and falling back to a permission-600 JSON file
//! in the config directory. Names are hashed before use so neither backend
//! learns what the secret is for.

use std::collections::BTreeMap;
use std::fs;
use std::path::{Path, PathBuf};

use tracing::debug;

use crate::error::Result;
use crate::infra::config::APP_NAME;

fn hashed(name: &str) -> String {
    blake3::hash(name.as_bytes()).to_hex().to_string()
}

pub struct Secrets {
    store_file: PathBuf,
}

impl Secrets {
    pub fn new(config_dir: &Path) -> Secrets {
        Secrets {
            store_file: config_dir.join("store"),
        }
    }

    /// Look up a secret; `None` when it was never stored.
    pub fn get(&self, name: &str) -> Option<String> {
        let key = hashed(name);

        match keyring::Entry::new(APP_NAME, &key).and_then(|e| e.get_password()) {
            Ok(value) => return Some(value),
            Err(keyring::Error::NoEntry) => {}
            Err(err) => {
                // No usable credential manager on this host; use the file.
                debug!(%err, "keyring unavailable, using fallback store");
            }
        }

        self.read_store().remove(&key)
    }

    /// Store a secret, mirroring the lookup order.
    pub fn set(&self, name: &str, value: &str) -> Result<()> {
        let key = hashed(name);

        if let Ok(entry) = keyring::Entry::new(APP_NAME, &key) {
            if entry.set_password(value).is_ok() {
                return Ok(());
            }
        }

        let mut store = self.read_store();
        store.insert(key, value.to_owned());
        let bytes =
            serde_json::to_vec(&store).map_err(|e| crate::error::Error::Other(e.into()))?;
        fs::write(&self.store_file, bytes)?;
        restrict_to_owner(&self.store_file)?;
        Ok(())
    }

    fn read_store(&self) -> BTreeMap<String, String> {
        fs::read(&self.store_file)
            .ok()
            .and_then(|bytes| serde_json::from_slice(&bytes).ok())
            .unwrap_or_default()
    }
}

#[cfg(unix)]
fn restrict_to_owner(path: &Path) -> Result<()> {
    use std::os::unix::fs::PermissionsExt;
    fs::set_permissions(path, fs::Permissions::from_mode(0o600))?;
    Ok(())
}

#[cfg(not(unix))]
fn restrict_to_owner(_path: &Path) -> Result<()> {
    Ok(())
}
