//! Install configuration.
//!
//! Precedence, lowest first: built-in defaults, `.npmrc` files, environment
//! variables, then explicit builder calls.

use crate::error::Error;
use crate::paths;
use crate::pkg::npmrc::{load_npmrc_files, CacheSetting, NpmrcConfig};
use crate::pkg::registry::{DEFAULT_REGISTRY, REGISTRY_ENV};
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use url::Url;

/// Environment variable overriding the cache directory.
pub const CACHE_DIR_ENV: &str = "FASTPKG_CACHE_DIR";

/// Environment variable disabling the persistent cache when truthy.
pub const NO_CACHE_ENV: &str = "FASTPKG_NO_CACHE";

/// Environment variable overriding download concurrency.
pub const CONCURRENCY_ENV: &str = "FASTPKG_CONCURRENCY";

/// Default number of concurrent manifest fetches and downloads.
pub const DEFAULT_CONCURRENCY: usize = 16;

/// Default retries for unavailable registries.
pub const DEFAULT_RETRIES: u32 = 2;

/// Configuration for one install run.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct InstallConfig {
    /// Default registry base URL.
    pub registry: Url,
    /// Keep tarballs in the persistent cache. When false they live in a
    /// per-run temporary directory.
    pub cache: bool,
    pub cache_dir: PathBuf,
    pub concurrency: usize,
    /// Retries for `PKG_REGISTRY_UNAVAILABLE`.
    pub retries: u32,
    pub include_optional: bool,
    /// Also install root `devDependencies`.
    pub include_dev: bool,
    /// Scoped registries and auth tokens.
    pub npmrc: NpmrcConfig,
}

impl Default for InstallConfig {
    fn default() -> Self {
        Self {
            registry: default_registry(),
            cache: true,
            cache_dir: paths::cache_dir().join("tarballs"),
            concurrency: DEFAULT_CONCURRENCY,
            retries: DEFAULT_RETRIES,
            include_optional: true,
            include_dev: false,
            npmrc: NpmrcConfig::default(),
        }
    }
}

impl InstallConfig {
    /// Load configuration for a project from `.npmrc` files and the environment.
    ///
    /// # Errors
    /// Returns an error if an environment variable holds an invalid value.
    pub fn load(project_dir: &Path) -> Result<Self, Error> {
        Self::from_sources(load_npmrc_files(project_dir), |key| std::env::var(key).ok())
    }

    /// Build configuration from parsed `.npmrc` settings and an environment lookup.
    ///
    /// # Errors
    /// Returns an error if an environment variable holds an invalid value.
    pub fn from_sources(
        npmrc: NpmrcConfig,
        env: impl Fn(&str) -> Option<String>,
    ) -> Result<Self, Error> {
        let mut config = Self::default();

        if let Some(registry) = &npmrc.registry {
            config.registry = registry.clone();
        }
        match &npmrc.cache {
            Some(CacheSetting::Disabled) => config.cache = false,
            Some(CacheSetting::Dir(dir)) => config.cache_dir.clone_from(dir),
            None => {}
        }
        config.npmrc = npmrc;

        if let Some(url) = env(REGISTRY_ENV).filter(|v| !v.is_empty()) {
            config = config.with_registry(&url)?;
        }
        if let Some(dir) = env(CACHE_DIR_ENV).filter(|v| !v.is_empty()) {
            config.cache_dir = PathBuf::from(dir);
        }
        if let Some(value) = env(NO_CACHE_ENV) {
            if parse_flag(NO_CACHE_ENV, &value)? {
                config.cache = false;
            }
        }
        if let Some(value) = env(CONCURRENCY_ENV) {
            config.concurrency = match value.trim().parse::<usize>() {
                Ok(n) if n > 0 => n,
                _ => {
                    return Err(Error::InvalidSetting {
                        key: CONCURRENCY_ENV.to_string(),
                        value,
                    })
                }
            };
        }

        Ok(config)
    }

    /// Use another default registry. A trailing slash is added if missing.
    ///
    /// # Errors
    /// Returns an error if `url` is not a valid URL.
    pub fn with_registry(mut self, url: &str) -> Result<Self, Error> {
        let with_slash = if url.ends_with('/') {
            url.to_string()
        } else {
            format!("{url}/")
        };
        self.registry = Url::parse(&with_slash).map_err(|source| Error::InvalidRegistry {
            url: url.to_string(),
            source,
        })?;
        Ok(self)
    }

    pub fn with_cache(mut self, enabled: bool) -> Self {
        self.cache = enabled;
        self
    }

    pub fn with_cache_dir(mut self, dir: impl Into<PathBuf>) -> Self {
        self.cache_dir = dir.into();
        self
    }

    /// Set concurrency; zero is treated as one.
    pub fn with_concurrency(mut self, concurrency: usize) -> Self {
        self.concurrency = concurrency.max(1);
        self
    }

    pub fn with_retries(mut self, retries: u32) -> Self {
        self.retries = retries;
        self
    }

    pub fn with_include_optional(mut self, include: bool) -> Self {
        self.include_optional = include;
        self
    }

    pub fn with_include_dev(mut self, include: bool) -> Self {
        self.include_dev = include;
        self
    }
}

fn default_registry() -> Url {
    // The constant is a valid absolute URL.
    Url::parse(DEFAULT_REGISTRY).unwrap_or_else(|_| unreachable!("invalid DEFAULT_REGISTRY"))
}

fn parse_flag(key: &str, value: &str) -> Result<bool, Error> {
    match value.trim().to_ascii_lowercase().as_str() {
        "1" | "true" | "yes" => Ok(true),
        "" | "0" | "false" | "no" => Ok(false),
        _ => Err(Error::InvalidSetting {
            key: key.to_string(),
            value: value.to_string(),
        }),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::pkg::npmrc::parse_npmrc;
    use serial_test::serial;
    use std::collections::HashMap;

    fn env(pairs: &[(&str, &str)]) -> impl Fn(&str) -> Option<String> {
        let map: HashMap<String, String> = pairs
            .iter()
            .map(|(k, v)| ((*k).to_string(), (*v).to_string()))
            .collect();
        move |key| map.get(key).cloned()
    }

    #[test]
    fn test_defaults() {
        let config = InstallConfig::default();
        assert_eq!(config.registry.as_str(), DEFAULT_REGISTRY);
        assert!(config.cache);
        assert_eq!(config.concurrency, 16);
        assert_eq!(config.retries, 2);
        assert!(config.include_optional);
        assert!(!config.include_dev);
    }

    #[test]
    fn test_npmrc_settings_apply() {
        let npmrc = parse_npmrc("registry=http://127.0.0.1:4873\ncache=false\n");
        let config = InstallConfig::from_sources(npmrc, env(&[])).unwrap();
        assert_eq!(config.registry.as_str(), "http://127.0.0.1:4873/");
        assert!(!config.cache);

        let npmrc = parse_npmrc("cache=/var/cache/pkgs\n");
        let config = InstallConfig::from_sources(npmrc, env(&[])).unwrap();
        assert!(config.cache);
        assert_eq!(config.cache_dir, PathBuf::from("/var/cache/pkgs"));
    }

    #[test]
    fn test_env_overrides_npmrc() {
        let npmrc = parse_npmrc("registry=http://from-npmrc.test/\n");
        let config = InstallConfig::from_sources(
            npmrc,
            env(&[
                (REGISTRY_ENV, "http://from-env.test"),
                (CACHE_DIR_ENV, "/tmp/fastpkg-cache"),
                (NO_CACHE_ENV, "1"),
                (CONCURRENCY_ENV, "4"),
            ]),
        )
        .unwrap();
        assert_eq!(config.registry.as_str(), "http://from-env.test/");
        assert_eq!(config.cache_dir, PathBuf::from("/tmp/fastpkg-cache"));
        assert!(!config.cache);
        assert_eq!(config.concurrency, 4);
    }

    #[test]
    fn test_invalid_env_values() {
        let err = InstallConfig::from_sources(NpmrcConfig::default(), env(&[(NO_CACHE_ENV, "maybe")]))
            .unwrap_err();
        assert!(matches!(err, Error::InvalidSetting { .. }));

        let err = InstallConfig::from_sources(NpmrcConfig::default(), env(&[(CONCURRENCY_ENV, "0")]))
            .unwrap_err();
        assert!(matches!(err, Error::InvalidSetting { .. }));

        let err = InstallConfig::from_sources(NpmrcConfig::default(), env(&[(REGISTRY_ENV, "nope")]))
            .unwrap_err();
        assert!(matches!(err, Error::InvalidRegistry { .. }));
    }

    #[test]
    fn test_builder_methods() {
        let config = InstallConfig::default()
            .with_registry("http://localhost:1234")
            .unwrap()
            .with_cache(false)
            .with_cache_dir("/x")
            .with_concurrency(0)
            .with_retries(5)
            .with_include_optional(false)
            .with_include_dev(true);
        assert_eq!(config.registry.as_str(), "http://localhost:1234/");
        assert!(!config.cache);
        assert_eq!(config.cache_dir, PathBuf::from("/x"));
        assert_eq!(config.concurrency, 1);
        assert_eq!(config.retries, 5);
        assert!(!config.include_optional);
        assert!(config.include_dev);
    }

    #[test]
    #[serial]
    fn test_load_reads_process_env_and_npmrc() {
        let dir = tempfile::tempdir().unwrap();
        std::fs::write(dir.path().join(".npmrc"), "cache=false\n").unwrap();
        std::env::set_var(REGISTRY_ENV, "http://127.0.0.1:9/");

        let config = InstallConfig::load(dir.path());
        std::env::remove_var(REGISTRY_ENV);

        let config = config.unwrap();
        assert_eq!(config.registry.as_str(), "http://127.0.0.1:9/");
        assert!(!config.cache);
    }
}
