//! Settings and on-disk layout
//!
//! Layered configuration (granary.toml + GRANARY_* environment) over serde
//! defaults, plus resolution of the per-OS config/data/cache directories the
//! engine stores its state in.

use std::fs;
use std::path::{Path, PathBuf};

use anyhow::{Context, Result};
use serde::{Deserialize, Serialize};

/// Application name; used for directory names, staging suffixes and the
/// keyring service.
pub const APP_NAME: &str = "granary";

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Settings {
    /// Default output directory for download/extract
    pub output_dir: PathBuf,

    /// HTTP settings
    pub http: HttpConfig,

    /// Worker pool cap (0 = rayon default)
    pub workers: usize,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct HttpConfig {
    /// Request timeout in seconds
    pub timeout_secs: u64,

    /// Retry attempts on 408/500/502/504
    pub retries: u32,
}

impl Default for Settings {
    fn default() -> Self {
        Self {
            output_dir: PathBuf::from("."),
            http: HttpConfig {
                timeout_secs: 300,
                retries: 3,
            },
            workers: 0,
        }
    }
}

pub fn load_settings() -> Result<Settings> {
    let mut builder = config::Config::builder();

    // Load from config files in priority order
    let config_paths = ["granary.toml", ".granary.toml"];

    for path in &config_paths {
        if Path::new(path).exists() {
            builder = builder.add_source(config::File::with_name(path));
            break;
        }
    }

    // Add environment variables with GRANARY_ prefix
    builder = builder.add_source(
        config::Environment::with_prefix("GRANARY").separator("_"),
    );

    let cfg = builder.build().context("Failed to load configuration")?;
    let parsed: Settings = cfg
        .try_deserialize()
        .unwrap_or_else(|_| Settings::default());

    Ok(parsed)
}

/// Per-OS state directories. Created on first resolution with owner-only
/// access on unix.
#[derive(Debug, Clone)]
pub struct AppDirs {
    /// Holds the fallback secret `store` file
    pub config_dir: PathBuf,
    /// Holds the relational store
    pub data_dir: PathBuf,
    /// Holds one file per cached API path
    pub cache_dir: PathBuf,
}

impl AppDirs {
    pub fn resolve() -> Result<Self> {
        let dirs = Self {
            config_dir: dirs::config_dir()
                .context("no config directory on this platform")?
                .join(APP_NAME),
            data_dir: dirs::data_dir()
                .context("no data directory on this platform")?
                .join(APP_NAME),
            cache_dir: dirs::cache_dir()
                .context("no cache directory on this platform")?
                .join(APP_NAME),
        };
        dirs.ensure()?;
        Ok(dirs)
    }

    /// Rooted under an arbitrary directory; used by tests to avoid touching
    /// real user state.
    pub fn rooted_at(root: &Path) -> Result<Self> {
        let dirs = Self {
            config_dir: root.join("config"),
            data_dir: root.join("data"),
            cache_dir: root.join("cache"),
        };
        dirs.ensure()?;
        Ok(dirs)
    }

    fn ensure(&self) -> Result<()> {
        for dir in [&self.config_dir, &self.data_dir, &self.cache_dir] {
            fs::create_dir_all(dir)
                .with_context(|| format!("Failed to create {}", dir.display()))?;
            restrict_to_owner(dir)?;
        }
        Ok(())
    }

    /// Path of the relational store file.
    pub fn store_path(&self) -> PathBuf {
        self.data_dir.join(format!("{APP_NAME}.sqlite"))
    }
}

#[cfg(unix)]
fn restrict_to_owner(path: &Path) -> Result<()> {
    use std::os::unix::fs::PermissionsExt;
    fs::set_permissions(path, fs::Permissions::from_mode(0o700))
        .with_context(|| format!("Failed to set permissions on {}", path.display()))?;
    Ok(())
}

#[cfg(not(unix))]
fn restrict_to_owner(_path: &Path) -> Result<()> {
    Ok(())
}
