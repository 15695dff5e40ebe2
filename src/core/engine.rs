//! Engine context
//!
//! The store, cache, secrets, HTTP session and platform registry are
//! process-wide collaborators; bundling them here makes every dependency
//! explicit and lets tests root the whole engine under a temp directory.

use std::path::Path;

use crate::core::store::Store;
use crate::error::Result;
use crate::infra::cache::Cache;
use crate::infra::config::{AppDirs, Settings};
use crate::infra::http::Http;
use crate::infra::secrets::Secrets;
use crate::platform::Registry;

pub struct Engine {
    pub store: Store,
    pub cache: Cache,
    pub secrets: Secrets,
    pub http: Http,
    pub settings: Settings,
    pub platforms: Registry,
}

impl Engine {
    pub fn new(settings: Settings) -> Result<Engine> {
        let dirs = AppDirs::resolve().map_err(crate::error::Error::Other)?;
        Self::with_dirs(settings, &dirs)
    }

    /// Engine rooted under an arbitrary directory; keeps tests away from
    /// real user state.
    pub fn rooted_at(root: &Path) -> Result<Engine> {
        let dirs = AppDirs::rooted_at(root).map_err(crate::error::Error::Other)?;
        Self::with_dirs(Settings::default(), &dirs)
    }

    fn with_dirs(settings: Settings, dirs: &AppDirs) -> Result<Engine> {
        Ok(Engine {
            store: Store::open(&dirs.store_path())?,
            cache: Cache::new(&dirs.cache_dir),
            secrets: Secrets::new(&dirs.config_dir),
            http: Http::new(&settings.http)?,
            settings,
            platforms: Registry::with_builtins(),
        })
    }
}
