//! Tarball fetching through the cache.
//!
//! Concurrent requests for one artifact share a single in-flight download.

use super::cache::{CacheKey, PackageCache};
use super::cancel::CancelSignal;
use super::error::PkgError;
use super::graph::{InstallGraph, NodeId, ResolvedNode};
use super::registry::RegistryClient;
use futures::future::{BoxFuture, FutureExt, Shared};
use futures::stream::{self, StreamExt};
use std::collections::{BTreeMap, HashMap};
use std::path::PathBuf;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use tokio::sync::Mutex;
use tracing::{debug, info, warn};

type InFlight = Shared<BoxFuture<'static, Result<PathBuf, PkgError>>>;

#[derive(Debug, Default)]
struct FetchStats {
    downloads: AtomicUsize,
    cache_hits: AtomicUsize,
}

/// Downloads, verifies and caches tarballs.
pub struct Fetcher {
    client: Arc<RegistryClient>,
    cache: PackageCache,
    cancel: CancelSignal,
    in_flight: Mutex<HashMap<CacheKey, InFlight>>,
    stats: Arc<FetchStats>,
}

impl Fetcher {
    #[must_use]
    pub fn new(client: Arc<RegistryClient>, cache: PackageCache, cancel: CancelSignal) -> Self {
        Self {
            client,
            cache,
            cancel,
            in_flight: Mutex::new(HashMap::new()),
            stats: Arc::new(FetchStats::default()),
        }
    }

    #[must_use]
    pub fn cache(&self) -> &PackageCache {
        &self.cache
    }

    /// Tarballs actually downloaded so far.
    #[must_use]
    pub fn downloads(&self) -> usize {
        self.stats.downloads.load(Ordering::Relaxed)
    }

    /// Requests answered straight from the cache.
    #[must_use]
    pub fn cache_hits(&self) -> usize {
        self.stats.cache_hits.load(Ordering::Relaxed)
    }

    /// Make sure the tarball of `node` is in the cache and return its path.
    ///
    /// # Errors
    /// Returns `PKG_INTEGRITY_MISMATCH` if the download does not match the
    /// published integrity, `PKG_CANCELLED` if the install was cancelled, or
    /// the download error.
    pub async fn ensure_fetched(&self, node: &ResolvedNode) -> Result<PathBuf, PkgError> {
        if self.cancel.is_cancelled() {
            return Err(PkgError::cancelled(&node.to_string()));
        }

        let key = CacheKey::new(&node.name, node.version.clone(), node.integrity.clone());
        if let Some(entry) = self.cache.entry(&key) {
            self.stats.cache_hits.fetch_add(1, Ordering::Relaxed);
            debug!(package = %node, "cache hit");
            return Ok(entry.path);
        }

        let shared = {
            let mut in_flight = self.in_flight.lock().await;
            if let Some(existing) = in_flight.get(&key) {
                debug!(package = %node, "joining in-flight download");
                existing.clone()
            } else if let Some(entry) = self.cache.entry(&key) {
                // Finished between the first lookup and taking the lock.
                self.stats.cache_hits.fetch_add(1, Ordering::Relaxed);
                return Ok(entry.path);
            } else {
                let download = download(
                    Arc::clone(&self.client),
                    self.cache.clone(),
                    self.cancel.clone(),
                    Arc::clone(&self.stats),
                    key.clone(),
                    node.tarball_url.clone(),
                )
                .boxed()
                .shared();
                in_flight.insert(key.clone(), download.clone());
                download
            }
        };

        let result = shared.clone().await;

        let mut in_flight = self.in_flight.lock().await;
        if in_flight.get(&key).is_some_and(|f| f.ptr_eq(&shared)) {
            in_flight.remove(&key);
        }
        result
    }

    /// Fetch every node of `graph` with at most `concurrency` downloads at once.
    ///
    /// A graph-fatal error cancels the remaining downloads. The error reported
    /// is the first one that is not a cancellation.
    ///
    /// # Errors
    /// Returns the first fetch error.
    pub async fn fetch_all(
        &self,
        graph: &InstallGraph,
        concurrency: usize,
    ) -> Result<BTreeMap<NodeId, PathBuf>, PkgError> {
        let mut results = stream::iter(&graph.nodes)
            .map(|node| async move { (node.id, self.ensure_fetched(node).await) })
            .buffer_unordered(concurrency.max(1));

        let mut fetched = BTreeMap::new();
        let mut first_error: Option<PkgError> = None;

        while let Some((id, result)) = results.next().await {
            match result {
                Ok(path) => {
                    fetched.insert(id, path);
                }
                Err(e) => {
                    if e.is_graph_fatal() {
                        self.cancel.cancel();
                    }
                    let replace = first_error
                        .as_ref()
                        .map_or(true, |first| first.is_cancelled() && !e.is_cancelled());
                    if replace {
                        first_error = Some(e);
                    }
                }
            }
        }

        if let Some(e) = first_error {
            return Err(e);
        }

        info!(
            packages = fetched.len(),
            downloaded = self.downloads(),
            cache_hits = self.cache_hits(),
            "fetched tarballs"
        );
        Ok(fetched)
    }
}

async fn download(
    client: Arc<RegistryClient>,
    cache: PackageCache,
    cancel: CancelSignal,
    stats: Arc<FetchStats>,
    key: CacheKey,
    url: String,
) -> Result<PathBuf, PkgError> {
    let label = format!("{}@{}", key.name, key.version);
    debug!(package = %label, url = %url, "downloading");

    let bytes = tokio::select! {
        biased;
        () = cancel.cancelled() => return Err(PkgError::cancelled(&label)),
        bytes = client.fetch_tarball(&url) => bytes.map_err(|e| e.with_context(&label))?,
    };
    stats.downloads.fetch_add(1, Ordering::Relaxed);

    match &key.integrity {
        Some(expected) => expected.verify(&label, &bytes)?,
        None => warn!(package = %label, "no integrity published, storing unverified"),
    }

    let entry = tokio::task::spawn_blocking(move || cache.store(&key, &bytes))
        .await
        .map_err(|e| PkgError::filesystem(format!("Cache write for {label} failed: {e}")))??;

    Ok(entry.path)
}
