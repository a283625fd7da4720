//! End-to-end install: resolve, fetch, then materialize.

use super::context::InstallContext;
use super::deps::read_package_deps;
use super::error::PkgError;
use super::graph::{DepKind, InstallGraph};
use super::install::{install, plan_layout, InstallOutcome, Layout};
use super::spec::PackageSpec;
use fastpkg_util::fs::atomic_write;
use serde::Serialize;
use std::fs;
use std::path::{Path, PathBuf};
use std::time::Instant;
use tracing::{debug, info, warn};

/// Where a finished install records its graph, relative to the project.
pub const GRAPH_FILE: &str = "node_modules/.fastpkg-graph.json";

/// What an install run produced.
#[derive(Debug, Clone, Serialize)]
pub struct InstallReport {
    pub graph: InstallGraph,
    pub layout: Layout,
    pub outcome: InstallOutcome,
    /// Tarballs downloaded by this run.
    pub downloaded: usize,
    /// Tarballs served from the cache.
    pub cache_hits: usize,
}

/// Build the install graph for `roots`.
///
/// With `previous`, versions it chose are kept wherever they still satisfy.
///
/// # Errors
/// Returns the first fatal resolution error.
pub async fn resolve_graph(
    ctx: &InstallContext,
    roots: &[(PackageSpec, DepKind)],
    previous: Option<&InstallGraph>,
) -> Result<InstallGraph, PkgError> {
    let mut builder = ctx.graph_builder();
    if let Some(previous) = previous {
        builder = builder.prefer(previous);
    }
    builder.build_with_kinds(roots).await
}

/// Install `roots` into `project_dir/node_modules`.
///
/// # Errors
/// Returns the first fatal error of any stage. A cancellation caused by
/// another failure is never the reported error.
pub async fn run_install(
    ctx: &InstallContext,
    roots: &[(PackageSpec, DepKind)],
    project_dir: &Path,
    previous: Option<&InstallGraph>,
) -> Result<InstallReport, PkgError> {
    let started = Instant::now();

    let graph = resolve_graph(ctx, roots, previous).await?;

    let fetcher = ctx.fetcher();
    let tarballs = fetcher.fetch_all(&graph, ctx.config().concurrency).await?;

    let project_dir = project_dir.to_path_buf();
    let (graph, layout, outcome) = tokio::task::spawn_blocking(move || {
        let layout = plan_layout(&graph)?;
        let outcome = install(&graph, &layout, &tarballs, &project_dir)?;
        Ok::<_, PkgError>((graph, layout, outcome))
    })
    .await
    .map_err(|e| PkgError::filesystem(format!("Install task failed: {e}")))??;

    info!(
        packages = graph.len(),
        extracted = outcome.extracted,
        unchanged = outcome.unchanged,
        bins = outcome.bins.len(),
        elapsed_ms = started.elapsed().as_millis() as u64,
        "install complete"
    );

    Ok(InstallReport {
        graph,
        layout,
        outcome,
        downloaded: fetcher.downloads(),
        cache_hits: fetcher.cache_hits(),
    })
}

/// Install the dependencies declared in `project_dir/package.json`.
///
/// Unusable entries are logged and skipped.
///
/// # Errors
/// Returns an error if package.json is missing or invalid, or the install fails.
pub async fn install_project(
    ctx: &InstallContext,
    project_dir: &Path,
    previous: Option<&InstallGraph>,
) -> Result<InstallReport, PkgError> {
    let deps = read_package_deps(
        &project_dir.join("package.json"),
        ctx.config().include_dev,
        ctx.config().include_optional,
    )?;
    for error in &deps.errors {
        warn!(name = %error.name, code = error.code, "{}", error.message);
    }
    run_install(ctx, &deps.requests, project_dir, previous).await
}

fn graph_path(project_dir: &Path) -> PathBuf {
    project_dir.join(GRAPH_FILE)
}

/// Graph recorded by the last install in `project_dir`, if any.
///
/// An unreadable record is ignored so a fresh resolution takes over.
#[must_use]
pub fn read_previous_graph(project_dir: &Path) -> Option<InstallGraph> {
    let path = graph_path(project_dir);
    let content = fs::read(&path).ok()?;
    match serde_json::from_slice::<InstallGraph>(&content) {
        Ok(graph) if graph.is_well_formed() => Some(graph),
        Ok(_) => {
            debug!(path = %path.display(), "ignoring install graph with dangling node ids");
            None
        }
        Err(e) => {
            debug!(path = %path.display(), error = %e, "ignoring unreadable install graph");
            None
        }
    }
}

/// Record `graph` so the next install in `project_dir` can prefer it.
///
/// # Errors
/// Returns `PKG_FILESYSTEM_ERROR` if the record cannot be written.
pub fn write_graph(project_dir: &Path, graph: &InstallGraph) -> Result<(), PkgError> {
    let path = graph_path(project_dir);
    let content = serde_json::to_vec_pretty(graph)
        .map_err(|e| PkgError::filesystem(format!("Failed to encode install graph: {e}")))?;
    atomic_write(&path, &content)
        .map_err(|e| PkgError::filesystem(format!("Failed to write {}: {e}", path.display())))
}
