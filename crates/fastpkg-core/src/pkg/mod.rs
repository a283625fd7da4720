//! Package manager functionality.
//!
//! Provides utilities for:
//! - Parsing package specifications (name@range)
//! - Fetching package manifests from npm-compatible registries
//! - Resolving version ranges and dist-tags
//! - Building a deduplicated install graph
//! - Downloading, verifying and caching tarballs
//! - Laying out and extracting `node_modules`

pub mod cache;
pub mod cancel;
pub mod context;
pub mod deps;
pub mod error;
pub mod fetch;
pub mod graph;
pub mod install;
pub mod integrity;
pub mod manifest;
pub mod npmrc;
pub mod pipeline;
pub mod registry;
pub mod spec;
pub mod tarball;
pub mod version;

pub use cache::{CacheEntry, CacheKey, CachedArtifact, PackageCache};
pub use cancel::CancelSignal;
pub use context::InstallContext;
pub use deps::{read_package_deps, PackageDeps, PkgDepError};
pub use error::{codes as pkg_codes, PkgError};
pub use fetch::Fetcher;
pub use graph::{
    DepKind, Edge, GraphBuilder, GraphOptions, InstallGraph, NodeId, ResolvedNode,
};
pub use install::{install, plan_layout, InstallOutcome, Layout, Placement};
pub use integrity::{Algorithm, Integrity};
pub use manifest::{Descriptor, VersionManifest};
pub use npmrc::{CacheSetting, NpmrcConfig};
pub use pipeline::{
    install_project, read_previous_graph, resolve_graph, run_install, write_graph, InstallReport,
    GRAPH_FILE,
};
pub use registry::{ManifestSource, RegistryClient, RetryPolicy, DEFAULT_REGISTRY, REGISTRY_ENV};
pub use spec::PackageSpec;
pub use tarball::{extract_tgz_atomic, MAX_TARBALL_SIZE};
pub use version::{resolve, resolve_range, Range};
