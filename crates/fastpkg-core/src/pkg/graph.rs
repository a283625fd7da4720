//! Dependency graph construction.
//!
//! The graph is expanded breadth-first in waves. Every manifest a wave needs
//! is fetched concurrently, then the wave's requests are resolved one by one
//! in declared order, so the result never depends on network timing.
//! Nodes live in an arena and are referenced by [`NodeId`].

use super::cancel::CancelSignal;
use super::error::{codes, PkgError};
use super::integrity::Integrity;
use super::manifest::{Descriptor, VersionManifest};
use super::registry::ManifestSource;
use super::spec::PackageSpec;
use super::version::{resolve_range, Range};
use futures::stream::{self, StreamExt};
use semver::Version;
use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, BTreeSet, HashMap, HashSet};
use std::fmt;
use std::sync::Arc;
use tracing::{debug, info, warn};

/// Index of a node in [`InstallGraph::nodes`].
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct NodeId(pub usize);

/// Why a dependent needs a dependency.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum DepKind {
    Prod,
    Optional,
    Peer,
}

/// A resolved dependency request.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Edge {
    /// Dependency name as requested.
    pub name: String,
    /// Range as written by the dependent.
    pub range: String,
    pub kind: DepKind,
    pub target: NodeId,
    /// The target is an ancestor on the expansion path (a cycle).
    #[serde(default, skip_serializing_if = "std::ops::Not::not")]
    pub back_reference: bool,
}

/// One concrete package version in the graph.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ResolvedNode {
    pub id: NodeId,
    pub name: String,
    pub version: Version,
    pub tarball_url: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub integrity: Option<Integrity>,
    #[serde(default, skip_serializing_if = "BTreeMap::is_empty")]
    pub bins: BTreeMap<String, String>,
    /// Dependencies in declared order.
    pub children: Vec<Edge>,
}

impl fmt::Display for ResolvedNode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}@{}", self.name, self.version)
    }
}

/// A fully resolved installation graph.
///
/// Nodes are sorted by (name, version) and at most one node exists per
/// name+version. Two builds from identical inputs compare equal.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct InstallGraph {
    /// Edges from the project itself, in request order.
    pub roots: Vec<Edge>,
    pub nodes: Vec<ResolvedNode>,
    /// Each cycle as the path from the re-entered node to the node closing it.
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub cycles: Vec<Vec<NodeId>>,
}

impl InstallGraph {
    /// Get a node by id.
    ///
    /// # Panics
    /// Panics if `id` does not belong to this graph.
    #[must_use]
    pub fn node(&self, id: NodeId) -> &ResolvedNode {
        &self.nodes[id.0]
    }

    /// Find the node for an exact name and version.
    #[must_use]
    pub fn find(&self, name: &str, version: &Version) -> Option<&ResolvedNode> {
        self.nodes
            .binary_search_by(|n| (n.name.as_str(), &n.version).cmp(&(name, version)))
            .ok()
            .map(|i| &self.nodes[i])
    }

    /// All nodes with the given name, lowest version first.
    pub fn versions_of<'a>(&'a self, name: &'a str) -> impl Iterator<Item = &'a ResolvedNode> {
        self.nodes.iter().filter(move |n| n.name == name)
    }

    #[must_use]
    pub fn len(&self) -> usize {
        self.nodes.len()
    }

    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.nodes.is_empty()
    }

    /// Whether every node id and edge target refers into [`Self::nodes`].
    #[must_use]
    pub fn is_well_formed(&self) -> bool {
        let in_range = |id: NodeId| id.0 < self.nodes.len();
        self.nodes.iter().enumerate().all(|(i, n)| n.id.0 == i)
            && self
                .roots
                .iter()
                .chain(self.nodes.iter().flat_map(|n| n.children.iter()))
                .all(|e| in_range(e.target))
            && self.cycles.iter().flatten().all(|&id| in_range(id))
    }

    /// Mark every edge that closes a cycle and record the cycles.
    ///
    /// Iterative DFS from the roots in order; an edge into a node that is
    /// still on the DFS stack is a back reference.
    fn mark_back_references(&mut self) {
        #[derive(Clone, Copy, PartialEq, Eq)]
        enum Color {
            White,
            Gray,
            Black,
        }

        let mut color = vec![Color::White; self.nodes.len()];
        let mut back_edges: Vec<(NodeId, usize)> = Vec::new();
        let mut cycles: Vec<Vec<NodeId>> = Vec::new();

        for root in self.roots.iter().map(|e| e.target) {
            if color[root.0] != Color::White {
                continue;
            }
            color[root.0] = Color::Gray;
            let mut stack: Vec<(NodeId, usize)> = vec![(root, 0)];

            while let Some(frame) = stack.last_mut() {
                let (node, edge_idx) = *frame;
                let Some(edge) = self.nodes[node.0].children.get(edge_idx) else {
                    color[node.0] = Color::Black;
                    stack.pop();
                    continue;
                };
                frame.1 += 1;

                let target = edge.target;
                match color[target.0] {
                    Color::White => {
                        color[target.0] = Color::Gray;
                        stack.push((target, 0));
                    }
                    Color::Gray => {
                        back_edges.push((node, edge_idx));
                        let start = stack.iter().position(|(id, _)| *id == target).unwrap_or(0);
                        cycles.push(stack[start..].iter().map(|(id, _)| *id).collect());
                    }
                    Color::Black => {}
                }
            }
        }

        for (node, edge_idx) in back_edges {
            self.nodes[node.0].children[edge_idx].back_reference = true;
        }
        self.cycles = cycles;
    }
}

/// Options for graph construction.
#[derive(Debug, Clone)]
pub struct GraphOptions {
    /// Maximum concurrent manifest fetches per wave (default 16).
    pub concurrency: usize,
    /// Follow optionalDependencies (default true).
    pub include_optional: bool,
}

impl Default for GraphOptions {
    fn default() -> Self {
        Self {
            concurrency: 16,
            include_optional: true,
        }
    }
}

/// Builds an [`InstallGraph`] from root requests.
pub struct GraphBuilder<'a, S> {
    source: &'a S,
    options: GraphOptions,
    /// Exact choices of a previous graph, keyed by (name, range).
    locked: HashMap<(String, String), Version>,
    /// Every version of a name present in a previous graph.
    preferred: HashMap<String, Vec<Version>>,
    cancel: CancelSignal,
}

impl<'a, S: ManifestSource> GraphBuilder<'a, S> {
    #[must_use]
    pub fn new(source: &'a S, options: GraphOptions) -> Self {
        Self {
            source,
            options,
            locked: HashMap::new(),
            preferred: HashMap::new(),
            cancel: CancelSignal::new(),
        }
    }

    /// Prefer the versions chosen by `previous` when they still satisfy.
    ///
    /// Rebuilding against a registry that gained newer versions then yields
    /// the same graph.
    #[must_use]
    pub fn prefer(mut self, previous: &InstallGraph) -> Self {
        let edges = previous
            .roots
            .iter()
            .chain(previous.nodes.iter().flat_map(|n| n.children.iter()));
        for edge in edges {
            // A hand-edited record may point past the arena.
            let Some(target) = previous.nodes.get(edge.target.0) else {
                continue;
            };
            self.locked
                .insert((edge.name.clone(), edge.range.clone()), target.version.clone());
        }
        for node in &previous.nodes {
            self.preferred
                .entry(node.name.clone())
                .or_default()
                .push(node.version.clone());
        }
        self
    }

    /// Share a cancellation signal with the rest of the install.
    #[must_use]
    pub fn with_cancel(mut self, cancel: CancelSignal) -> Self {
        self.cancel = cancel;
        self
    }

    /// Build the graph for production dependencies.
    ///
    /// # Errors
    /// Fails with the first resolution error of a non-optional request.
    pub async fn build(&self, roots: &[PackageSpec]) -> Result<InstallGraph, PkgError> {
        let roots: Vec<(PackageSpec, DepKind)> =
            roots.iter().map(|s| (s.clone(), DepKind::Prod)).collect();
        self.build_with_kinds(&roots).await
    }

    /// Build the graph for root requests of mixed kinds.
    ///
    /// Optional roots that fail to resolve are skipped.
    ///
    /// # Errors
    /// Fails with the first resolution error of a non-optional request.
    /// Graph-fatal errors also trip the cancellation signal.
    pub async fn build_with_kinds(
        &self,
        roots: &[(PackageSpec, DepKind)],
    ) -> Result<InstallGraph, PkgError> {
        let result = self.expand(roots).await;
        if let Err(e) = &result {
            if e.is_graph_fatal() {
                self.cancel.cancel();
            }
        }
        result
    }

    async fn expand(&self, roots: &[(PackageSpec, DepKind)]) -> Result<InstallGraph, PkgError> {
        let mut state = BuildState::default();
        let mut wave: Vec<Request> = roots
            .iter()
            .map(|(spec, kind)| Request {
                parent: None,
                spec: spec.clone(),
                kind: *kind,
            })
            .collect();
        let mut depth = 0usize;

        while !wave.is_empty() {
            if self.cancel.is_cancelled() {
                return Err(PkgError::cancelled("dependency graph"));
            }
            debug!(depth, requests = wave.len(), "resolving wave");
            self.prefetch(&mut state, &wave).await?;

            let mut next = Vec::new();
            for request in wave {
                self.resolve_request(&mut state, request, &mut next).await?;
            }
            wave = next;
            depth += 1;
        }

        let manifests = state.manifest_fetches;
        let graph = state.finish();
        info!(
            packages = graph.len(),
            manifests,
            cycles = graph.cycles.len(),
            "resolved dependency graph"
        );
        Ok(graph)
    }

    /// Fetch, concurrently, every manifest the wave may need.
    async fn prefetch(&self, state: &mut BuildState, wave: &[Request]) -> Result<(), PkgError> {
        let names: BTreeSet<&str> = wave
            .iter()
            .filter(|r| !state.manifests.contains_key(&r.spec.name))
            .filter(|r| {
                Range::parse(&r.spec.range)
                    .map_or(true, |range| state.existing_match(&r.spec.name, &range).is_none())
            })
            .map(|r| r.spec.name.as_str())
            .collect();

        if names.is_empty() {
            return Ok(());
        }

        let fetches = stream::iter(names)
            .map(|name| async move { (name.to_string(), self.source.fetch_manifest(name).await) })
            .buffer_unordered(self.options.concurrency.max(1))
            .collect::<Vec<_>>();

        let results = tokio::select! {
            results = fetches => results,
            () = self.cancel.cancelled() => return Err(PkgError::cancelled("dependency graph")),
        };

        for (name, result) in results {
            state.manifest_fetches += 1;
            state.manifests.insert(name, result);
        }
        Ok(())
    }

    /// Manifest for `name`, from the per-run memo or the source.
    async fn manifest(
        &self,
        state: &mut BuildState,
        name: &str,
    ) -> Result<Arc<VersionManifest>, PkgError> {
        if let Some(result) = state.manifests.get(name) {
            return result.clone();
        }
        let result = self.source.fetch_manifest(name).await;
        state.manifest_fetches += 1;
        state.manifests.insert(name.to_string(), result.clone());
        result
    }

    async fn resolve_request(
        &self,
        state: &mut BuildState,
        request: Request,
        next: &mut Vec<Request>,
    ) -> Result<(), PkgError> {
        let Request { parent, spec, kind } = request;

        let target = match self.select(state, &spec).await {
            Ok(Selected::Existing(id)) => id,
            Ok(Selected::New(manifest, version)) => {
                let descriptor = manifest
                    .get(&version)
                    .ok_or_else(|| PkgError::no_matching_version(&spec.name, &spec.range))?;
                state.insert(&spec.name, descriptor, self.options.include_optional, next)
            }
            Err(e) if kind == DepKind::Optional && !e.is_cancelled() => {
                warn!(name = %spec.name, range = %spec.range, error = %e, "skipping optional dependency");
                return Ok(());
            }
            Err(e) => {
                return Err(match parent {
                    Some(p) => e.with_context(&state.nodes[p.0]),
                    None => e,
                });
            }
        };

        state
            .requested
            .entry(spec.name.clone())
            .or_default()
            .push(spec.range.clone());

        let edge = Edge {
            name: spec.name,
            range: spec.range,
            kind,
            target,
            back_reference: false,
        };
        match parent {
            Some(p) => state.nodes[p.0].children.push(edge),
            None => state.roots.push(edge),
        }
        Ok(())
    }

    /// Pick the node a request points at.
    ///
    /// Order of preference: a node already in the graph, the choice of a
    /// previous graph, the highest published match.
    async fn select(&self, state: &mut BuildState, spec: &PackageSpec) -> Result<Selected, PkgError> {
        let range = Range::parse(&spec.range).map_err(|e| e.with_context(&spec.name))?;

        if let Some(id) = state.existing_match(&spec.name, &range) {
            return Ok(Selected::Existing(id));
        }

        let manifest = self.manifest(state, &spec.name).await?;
        let version = match self.previous_choice(spec, &range, &manifest) {
            Some(version) => version,
            None => match resolve_range(&spec.name, &spec.range, &range, &manifest) {
                Ok(version) => version,
                Err(e) if e.code() == codes::PKG_NO_MATCHING_VERSION => {
                    return Err(match state.requested.get(&spec.name) {
                        Some(others) if !others.is_empty() => {
                            let mut ranges = others.clone();
                            ranges.push(spec.range.clone());
                            PkgError::unsatisfiable(&spec.name, &ranges)
                        }
                        _ => e,
                    });
                }
                Err(e) => return Err(e),
            },
        };

        if let Some(&id) = state.index.get(&(spec.name.clone(), version.clone())) {
            return Ok(Selected::Existing(id));
        }
        Ok(Selected::New(manifest, version))
    }

    fn previous_choice(
        &self,
        spec: &PackageSpec,
        range: &Range,
        manifest: &VersionManifest,
    ) -> Option<Version> {
        let published = |v: &&Version| manifest.versions.contains_key(*v);

        if let Some(locked) = self
            .locked
            .get(&(spec.name.clone(), spec.range.clone()))
            .filter(published)
        {
            if matches!(range, Range::Tag(_)) || range.satisfies(locked) {
                return Some(locked.clone());
            }
        }

        let candidates = self.preferred.get(&spec.name)?;
        range
            .max_satisfying(candidates.iter().filter(published))
            .cloned()
    }
}

/// A pending dependency request.
#[derive(Debug)]
struct Request {
    parent: Option<NodeId>,
    spec: PackageSpec,
    kind: DepKind,
}

enum Selected {
    Existing(NodeId),
    New(Arc<VersionManifest>, Version),
}

#[derive(Default)]
struct BuildState {
    /// Per-run manifest memo; failures are remembered too.
    manifests: HashMap<String, Result<Arc<VersionManifest>, PkgError>>,
    manifest_fetches: usize,
    nodes: Vec<ResolvedNode>,
    index: HashMap<(String, Version), NodeId>,
    by_name: HashMap<String, Vec<NodeId>>,
    /// Ranges that successfully requested each name so far.
    requested: HashMap<String, Vec<String>>,
    roots: Vec<Edge>,
}

impl BuildState {
    /// Highest existing node of `name` that satisfies `range`.
    fn existing_match(&self, name: &str, range: &Range) -> Option<NodeId> {
        self.by_name
            .get(name)?
            .iter()
            .copied()
            .filter(|id| range.satisfies(&self.nodes[id.0].version))
            .max_by(|a, b| self.nodes[a.0].version.cmp(&self.nodes[b.0].version))
    }

    /// Add a node and queue its dependencies for the next wave.
    fn insert(
        &mut self,
        name: &str,
        descriptor: &Descriptor,
        include_optional: bool,
        next: &mut Vec<Request>,
    ) -> NodeId {
        let id = NodeId(self.nodes.len());
        debug!(name, version = %descriptor.version, "adding package");

        self.nodes.push(ResolvedNode {
            id,
            name: name.to_string(),
            version: descriptor.version.clone(),
            tarball_url: descriptor.tarball_url.clone(),
            integrity: descriptor.integrity.clone(),
            bins: descriptor.bins.clone(),
            children: Vec::new(),
        });
        self.index
            .insert((name.to_string(), descriptor.version.clone()), id);
        self.by_name.entry(name.to_string()).or_default().push(id);

        // optionalDependencies override dependencies of the same name
        let optional: &[PackageSpec] = if include_optional {
            &descriptor.optional_dependencies
        } else {
            &[]
        };
        let optional_names: HashSet<&str> = descriptor
            .optional_dependencies
            .iter()
            .map(|s| s.name.as_str())
            .collect();
        let mut seen: HashSet<&str> = HashSet::new();

        let prod = descriptor
            .dependencies
            .iter()
            .filter(|s| !optional_names.contains(s.name.as_str()))
            .map(|s| (s, DepKind::Prod));
        let optional = optional.iter().map(|s| (s, DepKind::Optional));
        let peers = descriptor
            .peer_dependencies
            .iter()
            .map(|s| (s, DepKind::Peer));

        for (spec, kind) in prod.chain(optional).chain(peers) {
            if seen.insert(spec.name.as_str()) {
                next.push(Request {
                    parent: Some(id),
                    spec: spec.clone(),
                    kind,
                });
            }
        }

        id
    }

    /// Sort nodes by (name, version), remap ids and mark cycles.
    fn finish(self) -> InstallGraph {
        let mut order: Vec<usize> = (0..self.nodes.len()).collect();
        order.sort_by(|&a, &b| {
            let (a, b) = (&self.nodes[a], &self.nodes[b]);
            (&a.name, &a.version).cmp(&(&b.name, &b.version))
        });

        let mut remap = vec![NodeId(0); self.nodes.len()];
        for (new, &old) in order.iter().enumerate() {
            remap[old] = NodeId(new);
        }
        let remap_edge = |edge: Edge| Edge {
            target: remap[edge.target.0],
            ..edge
        };

        let mut slots: Vec<Option<ResolvedNode>> = self.nodes.into_iter().map(Some).collect();
        let nodes = order
            .iter()
            .filter_map(|&old| slots[old].take())
            .map(|mut node| {
                node.id = remap[node.id.0];
                node.children = node.children.into_iter().map(remap_edge).collect();
                node
            })
            .collect();
        let roots = self.roots.into_iter().map(remap_edge).collect();

        let mut graph = InstallGraph {
            roots,
            nodes,
            cycles: Vec::new(),
        };
        graph.mark_back_references();
        graph
    }
}
