//! Hosting platforms
//!
//! A platform resolves a resource name into the list of sources to fetch,
//! each carrying a stable revision. The registry is fixed at construction:
//! one adapter per scheme, looked up from the `<scheme>://` prefix of the
//! resource name.

pub mod github;

use std::collections::HashMap;

use crate::core::engine::Engine;
use crate::core::source::Source;
use crate::error::{Error, Result};

pub trait Platform: Send + Sync {
    /// Resolve `res_name` into fetchable sources with stable revisions.
    fn sources(&self, eng: &Engine, res_name: &str, res_id: i64) -> Result<Vec<Source>>;
}

/// Scheme of a resource name (`github://owner/repo/...` → `github`).
pub fn scheme_of(res_name: &str) -> Result<&str> {
    res_name
        .split_once("://")
        .map(|(scheme, _)| scheme)
        .ok_or_else(|| {
            Error::Invalid(format!(
                "resource name \"{res_name}\" has no <scheme>:// prefix"
            ))
        })
}

pub struct Registry {
    platforms: HashMap<&'static str, Box<dyn Platform>>,
}

impl Registry {
    pub fn with_builtins() -> Registry {
        let mut platforms: HashMap<&'static str, Box<dyn Platform>> = HashMap::new();
        platforms.insert("github", Box::new(github::GitHub::new()));
        Registry { platforms }
    }

    pub fn for_resource(&self, res_name: &str) -> Result<&dyn Platform> {
        let scheme = scheme_of(res_name)?;
        self.platforms
            .get(scheme)
            .map(|p| p.as_ref())
            .ok_or_else(|| Error::Invalid(format!("unknown platform \"{scheme}\"")))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn scheme_extraction() {
        assert_eq!(scheme_of("github://acme/proj/v1").unwrap(), "github");
        assert!(scheme_of("acme/proj").is_err());
    }

    #[test]
    fn registry_routes_by_scheme() {
        let registry = Registry::with_builtins();
        assert!(registry.for_resource("github://acme/proj/v1").is_ok());
        assert!(registry.for_resource("gitlab://acme/proj").is_err());
    }
}
