//! Per-run install context.

use super::cache::PackageCache;
use super::cancel::CancelSignal;
use super::error::PkgError;
use super::fetch::Fetcher;
use super::graph::{GraphBuilder, GraphOptions};
use super::registry::RegistryClient;
use crate::InstallConfig;
use std::sync::Arc;
use tempfile::TempDir;
use tracing::debug;

/// Everything one install run shares: configuration, registry client, cache
/// and cancellation signal.
///
/// With the cache disabled, tarballs go to a scratch directory that is
/// removed when the context is dropped.
#[derive(Debug)]
pub struct InstallContext {
    config: InstallConfig,
    client: Arc<RegistryClient>,
    cache: PackageCache,
    cancel: CancelSignal,
    _scratch: Option<TempDir>,
}

impl InstallContext {
    /// Create a context and its registry client from `config`.
    ///
    /// # Errors
    /// Returns an error if the HTTP client or the scratch directory cannot be created.
    pub fn new(config: InstallConfig) -> Result<Self, PkgError> {
        let client = RegistryClient::from_config(&config)?;
        Self::with_client(config, client)
    }

    /// Create a context around an existing client.
    ///
    /// # Errors
    /// Returns an error if the scratch directory cannot be created.
    pub fn with_client(config: InstallConfig, client: RegistryClient) -> Result<Self, PkgError> {
        let (cache, scratch) = if config.cache {
            (PackageCache::new(&config.cache_dir), None)
        } else {
            let scratch = tempfile::Builder::new()
                .prefix("fastpkg-run-")
                .tempdir()
                .map_err(|e| PkgError::filesystem(format!("Failed to create scratch cache: {e}")))?;
            debug!(path = %scratch.path().display(), "cache disabled, using scratch directory");
            (PackageCache::new(scratch.path()), Some(scratch))
        };

        Ok(Self {
            config,
            client: Arc::new(client),
            cache,
            cancel: CancelSignal::new(),
            _scratch: scratch,
        })
    }

    #[must_use]
    pub fn config(&self) -> &InstallConfig {
        &self.config
    }

    #[must_use]
    pub fn client(&self) -> &Arc<RegistryClient> {
        &self.client
    }

    #[must_use]
    pub fn cache(&self) -> &PackageCache {
        &self.cache
    }

    #[must_use]
    pub fn cancel(&self) -> &CancelSignal {
        &self.cancel
    }

    #[must_use]
    pub fn graph_options(&self) -> GraphOptions {
        GraphOptions {
            concurrency: self.config.concurrency,
            include_optional: self.config.include_optional,
        }
    }

    /// A graph builder wired to this run's client and cancellation signal.
    #[must_use]
    pub fn graph_builder(&self) -> GraphBuilder<'_, RegistryClient> {
        GraphBuilder::new(self.client.as_ref(), self.graph_options())
            .with_cancel(self.cancel.clone())
    }

    /// A fetcher writing into this run's cache.
    #[must_use]
    pub fn fetcher(&self) -> Fetcher {
        Fetcher::new(
            Arc::clone(&self.client),
            self.cache.clone(),
            self.cancel.clone(),
        )
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_persistent_cache_uses_configured_dir() {
        let dir = tempfile::tempdir().unwrap();
        let config = InstallConfig::default().with_cache_dir(dir.path());
        let ctx = InstallContext::new(config).unwrap();
        assert_eq!(ctx.cache().root(), dir.path());
    }

    #[test]
    fn test_scratch_cache_removed_on_drop() {
        let config = InstallConfig::default().with_cache(false);
        let ctx = InstallContext::new(config).unwrap();
        let root = ctx.cache().root().to_path_buf();
        assert!(root.is_dir());

        drop(ctx);
        assert!(!root.exists());
    }

    #[test]
    fn test_graph_options_follow_config() {
        let config = InstallConfig::default()
            .with_concurrency(3)
            .with_include_optional(false);
        let ctx = InstallContext::new(config).unwrap();
        let options = ctx.graph_options();
        assert_eq!(options.concurrency, 3);
        assert!(!options.include_optional);
    }
}
