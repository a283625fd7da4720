//! npm registry client.

use super::error::PkgError;
use super::manifest::VersionManifest;
use super::npmrc::NpmrcConfig;
use super::spec::{scope_of, url_encoded_name, validate_full_name};
use super::tarball::{download_tarball, MAX_TARBALL_SIZE};
use bytes::Bytes;
use reqwest::{Client, Response, StatusCode};
use std::future::Future;
use std::sync::Arc;
use std::time::Duration;
use tracing::{debug, warn};
use url::Url;

/// Default npm registry URL.
pub const DEFAULT_REGISTRY: &str = "https://registry.npmjs.org/";

/// Environment variable to override registry URL.
pub const REGISTRY_ENV: &str = "FASTPKG_NPM_REGISTRY";

/// Accept header for manifest requests: abbreviated metadata first.
pub const ACCEPT_MANIFEST: &str =
    "application/vnd.npm.install-v1+json; q=1.0, application/json; q=0.8, */*";

/// Accept header used after a `406 Not Acceptable`.
pub const ACCEPT_FULL_MANIFEST: &str = "application/json";

/// Anything that can produce package manifests.
///
/// The graph builder only talks to registries through this trait.
pub trait ManifestSource: Send + Sync {
    /// Fetch the manifest of every published version of `name`.
    fn fetch_manifest(
        &self,
        name: &str,
    ) -> impl Future<Output = Result<Arc<VersionManifest>, PkgError>> + Send;
}

/// Bounded exponential backoff for `PKG_REGISTRY_UNAVAILABLE`.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RetryPolicy {
    /// Additional attempts after the first one.
    pub retries: u32,
    pub base_delay: Duration,
    pub max_delay: Duration,
}

impl RetryPolicy {
    /// No retries at all.
    #[must_use]
    pub fn none() -> Self {
        Self {
            retries: 0,
            ..Self::default()
        }
    }

    /// Delay before retry number `attempt` (zero-based).
    #[must_use]
    pub fn delay(&self, attempt: u32) -> Duration {
        let factor = 1u32.checked_shl(attempt).unwrap_or(u32::MAX);
        self.base_delay
            .checked_mul(factor)
            .map_or(self.max_delay, |d| d.min(self.max_delay))
    }
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            retries: 2,
            base_delay: Duration::from_millis(100),
            max_delay: Duration::from_secs(2),
        }
    }
}

/// Registry client for fetching package metadata and tarballs.
#[derive(Debug, Clone)]
pub struct RegistryClient {
    base_url: Url,
    npmrc: NpmrcConfig,
    http: Client,
    retry: RetryPolicy,
}

impl RegistryClient {
    /// Create a new registry client with the given base URL.
    ///
    /// # Errors
    /// Returns an error if the URL is invalid or the HTTP client cannot be created.
    pub fn new(base_url: &str) -> Result<Self, PkgError> {
        let with_slash = if base_url.ends_with('/') {
            base_url.to_string()
        } else {
            format!("{base_url}/")
        };
        let base_url = Url::parse(&with_slash)
            .map_err(|e| PkgError::registry(format!("Invalid registry URL '{base_url}': {e}")))?;

        let http = Client::builder()
            .connect_timeout(Duration::from_secs(5))
            .timeout(Duration::from_secs(15))
            .user_agent(crate::version::USER_AGENT)
            .build()
            .map_err(|e| PkgError::registry(format!("Failed to create HTTP client: {e}")))?;

        Ok(Self {
            base_url,
            npmrc: NpmrcConfig::default(),
            http,
            retry: RetryPolicy::default(),
        })
    }

    /// Create a client from an install configuration.
    ///
    /// # Errors
    /// Returns an error if the HTTP client cannot be created.
    pub fn from_config(config: &crate::InstallConfig) -> Result<Self, PkgError> {
        Ok(Self::new(config.registry.as_str())?
            .with_npmrc(config.npmrc.clone())
            .with_retry(RetryPolicy {
                retries: config.retries,
                ..RetryPolicy::default()
            }))
    }

    /// Use scoped registries and auth tokens from `.npmrc`.
    #[must_use]
    pub fn with_npmrc(mut self, npmrc: NpmrcConfig) -> Self {
        self.npmrc = npmrc;
        self
    }

    #[must_use]
    pub fn with_retry(mut self, retry: RetryPolicy) -> Self {
        self.retry = retry;
        self
    }

    /// Get the base URL.
    #[must_use]
    pub fn base_url(&self) -> &Url {
        &self.base_url
    }

    /// Registry that serves `name`: its scope's registry, else the default one.
    #[must_use]
    pub fn registry_for(&self, name: &str) -> &Url {
        scope_of(name)
            .and_then(|scope| self.npmrc.registry_for_scope(scope))
            .unwrap_or(&self.base_url)
    }

    /// Manifest URL for `name`, with scoped names encoded as `@scope%2Fname`.
    ///
    /// # Errors
    /// Returns `PKG_SPEC_INVALID` for an invalid name, or an error if the URL
    /// cannot be built.
    pub fn manifest_url(&self, name: &str) -> Result<Url, PkgError> {
        validate_full_name(name)?;
        self.registry_for(name)
            .join(&url_encoded_name(name))
            .map_err(|e| PkgError::registry(format!("Failed to build URL for '{name}': {e}")))
    }

    /// Fetch and validate the manifest for a package.
    ///
    /// # Errors
    /// Returns `PKG_NOT_FOUND`, `PKG_MALFORMED_MANIFEST`, `PKG_REGISTRY_UNAVAILABLE`
    /// (after retries) or `PKG_REGISTRY_ERROR`.
    pub async fn fetch_manifest(&self, name: &str) -> Result<Arc<VersionManifest>, PkgError> {
        let url = self.manifest_url(name)?;
        let body = self
            .with_retries(name, || self.fetch_manifest_body(name, &url))
            .await?;

        let manifest = VersionManifest::from_slice(name, &body)?;
        debug!(name, versions = manifest.versions.len(), "fetched manifest");
        Ok(Arc::new(manifest))
    }

    /// Download a tarball, attaching the auth token of its host if configured.
    ///
    /// # Errors
    /// Returns an error if the download fails or exceeds `MAX_TARBALL_SIZE`.
    pub async fn fetch_tarball(&self, url: &str) -> Result<Bytes, PkgError> {
        let parsed = Url::parse(url)
            .map_err(|e| PkgError::download_failed(format!("Invalid tarball URL '{url}': {e}")))?;
        let token = self.npmrc.auth_token_for(&parsed);

        self.with_retries(url, || {
            download_tarball(&self.http, url, MAX_TARBALL_SIZE, token)
        })
        .await
    }

    async fn fetch_manifest_body(&self, name: &str, url: &Url) -> Result<Bytes, PkgError> {
        let mut response = self.get(url, ACCEPT_MANIFEST).await?;

        if response.status() == StatusCode::NOT_ACCEPTABLE {
            debug!(name, "registry refused abbreviated metadata, retrying with full document");
            response = self.get(url, ACCEPT_FULL_MANIFEST).await?;
        }

        let status = response.status();
        if status == StatusCode::NOT_FOUND {
            return Err(PkgError::not_found(name));
        }
        if status.is_server_error() || status == StatusCode::TOO_MANY_REQUESTS {
            return Err(PkgError::registry_unavailable(format!(
                "Registry returned status {status} for '{name}'"
            )));
        }
        if !status.is_success() {
            return Err(PkgError::registry(format!(
                "Registry returned status {status} for '{name}'"
            )));
        }

        Ok(response.bytes().await?)
    }

    /// Plain GET with an empty body. `npm-auth-type` is never sent.
    async fn get(&self, url: &Url, accept: &str) -> Result<Response, PkgError> {
        let mut request = self
            .http
            .get(url.clone())
            .header(reqwest::header::ACCEPT, accept);

        if let Some(token) = self.npmrc.auth_token_for(url) {
            request = request.bearer_auth(token);
        }

        Ok(request.send().await?)
    }

    async fn with_retries<T, F, Fut>(&self, what: &str, mut op: F) -> Result<T, PkgError>
    where
        F: FnMut() -> Fut,
        Fut: Future<Output = Result<T, PkgError>>,
    {
        let mut attempt = 0;
        loop {
            match op().await {
                Err(e) if e.is_retryable() && attempt < self.retry.retries => {
                    let delay = self.retry.delay(attempt);
                    warn!(what, attempt = attempt + 1, delay_ms = delay.as_millis() as u64, error = %e, "retrying");
                    tokio::time::sleep(delay).await;
                    attempt += 1;
                }
                other => return other,
            }
        }
    }
}

impl ManifestSource for RegistryClient {
    async fn fetch_manifest(&self, name: &str) -> Result<Arc<VersionManifest>, PkgError> {
        RegistryClient::fetch_manifest(self, name).await
    }
}
