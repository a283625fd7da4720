//! Materialize an install graph into `node_modules`.
//!
//! Placement follows Node's lookup rule: a package sees the first
//! `node_modules/<name>` found walking up from its own directory. A node is
//! hoisted to the top level when that slot is free; otherwise it is nested
//! under the dependent that needs it.

use super::error::PkgError;
use super::graph::{InstallGraph, NodeId, ResolvedNode};
use super::tarball::extract_tgz_atomic;
use serde::Serialize;
use serde_json::Value;
use std::collections::{BTreeMap, VecDeque};
use std::fs;
use std::path::{Component, Path, PathBuf};
use tracing::{debug, warn};

/// Deepest `node_modules` nesting the planner accepts.
const MAX_NESTING: usize = 128;

/// Where one instance of a node is installed, relative to the project.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct Placement {
    pub node: NodeId,
    /// Package directory, e.g. `node_modules/a/node_modules/b`.
    pub path: PathBuf,
    /// The `node_modules` directory holding it.
    pub node_modules: PathBuf,
}

/// A planned `node_modules` tree. Placements are sorted by path.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct Layout {
    pub placements: Vec<Placement>,
}

impl Layout {
    /// Placements of one node (a node may be installed in several places).
    pub fn placements_of(&self, node: NodeId) -> impl Iterator<Item = &Placement> {
        self.placements.iter().filter(move |p| p.node == node)
    }
}

/// Result of [`install`].
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct InstallOutcome {
    /// Packages extracted by this run.
    pub extracted: usize,
    /// Packages already present with the right version.
    pub unchanged: usize,
    /// Created `.bin` entries.
    pub bins: Vec<PathBuf>,
}

/// One `node_modules` directory in the plan.
struct Location {
    parent: Option<usize>,
    /// Package directory owning this `node_modules` (empty for the project).
    dir: PathBuf,
    entries: BTreeMap<String, NodeId>,
    depth: usize,
}

/// Compute the hoisted placement of every node reachable from the roots.
///
/// # Errors
/// Returns an error if nesting exceeds a sane depth.
pub fn plan_layout(graph: &InstallGraph) -> Result<Layout, PkgError> {
    let mut locations = vec![Location {
        parent: None,
        dir: PathBuf::new(),
        entries: BTreeMap::new(),
        depth: 0,
    }];
    let mut queue: VecDeque<(usize, NodeId)> = VecDeque::new();
    let mut placements = Vec::new();

    for edge in &graph.roots {
        match visible(&locations, 0, &edge.name) {
            Some(id) if id == edge.target => {}
            Some(other) => warn!(
                name = %edge.name,
                kept = %graph.node(other),
                dropped = %graph.node(edge.target),
                "two root requests for one name, keeping the first"
            ),
            None => place(&mut locations, 0, &edge.name, edge.target, &mut placements, &mut queue)?,
        }
    }

    while let Some((loc, node)) = queue.pop_front() {
        for edge in &graph.node(node).children {
            match visible(&locations, loc, &edge.name) {
                Some(id) if id == edge.target => {}
                // Shadowed by another version: nest under the dependent.
                Some(_) if !locations[loc].entries.contains_key(&edge.name) => {
                    place(&mut locations, loc, &edge.name, edge.target, &mut placements, &mut queue)?;
                }
                Some(_) => warn!(
                    dependent = %graph.node(node),
                    name = %edge.name,
                    "dependency slot already taken"
                ),
                // Nothing visible means the top-level slot is free.
                None => place(&mut locations, 0, &edge.name, edge.target, &mut placements, &mut queue)?,
            }
        }
    }

    placements.sort_by(|a: &Placement, b: &Placement| a.path.cmp(&b.path));
    Ok(Layout { placements })
}

/// The node that `name` resolves to from location `loc`.
fn visible(locations: &[Location], mut loc: usize, name: &str) -> Option<NodeId> {
    loop {
        let location = &locations[loc];
        if let Some(&id) = location.entries.get(name) {
            return Some(id);
        }
        loc = location.parent?;
    }
}

fn place(
    locations: &mut Vec<Location>,
    at: usize,
    name: &str,
    node: NodeId,
    placements: &mut Vec<Placement>,
    queue: &mut VecDeque<(usize, NodeId)>,
) -> Result<(), PkgError> {
    let depth = locations[at].depth + 1;
    if depth > MAX_NESTING {
        return Err(PkgError::filesystem(format!(
            "node_modules nesting deeper than {MAX_NESTING} levels while placing {name}"
        )));
    }

    let relative: PathBuf = name.split('/').collect();
    if name.is_empty()
        || !relative
            .components()
            .all(|c| matches!(c, Component::Normal(_)))
    {
        return Err(PkgError::filesystem(format!(
            "Refusing to place package with unsafe name '{name}'"
        )));
    }

    let node_modules = locations[at].dir.join("node_modules");
    let path = node_modules.join(relative);

    locations[at].entries.insert(name.to_string(), node);
    locations.push(Location {
        parent: Some(at),
        dir: path.clone(),
        entries: BTreeMap::new(),
        depth,
    });
    queue.push_back((locations.len() - 1, node));
    placements.push(Placement {
        node,
        path,
        node_modules,
    });
    Ok(())
}

/// Extract every placed package and link its binaries.
///
/// `tarballs` maps each node to its cached tarball. A package directory that
/// already holds the right name and version is left alone.
///
/// # Errors
/// Returns the first extraction or filesystem error.
pub fn install(
    graph: &InstallGraph,
    layout: &Layout,
    tarballs: &BTreeMap<NodeId, PathBuf>,
    project_dir: &Path,
) -> Result<InstallOutcome, PkgError> {
    let mut outcome = InstallOutcome::default();

    for placement in &layout.placements {
        let node = graph.node(placement.node);
        let dest = project_dir.join(&placement.path);

        if is_installed(&dest, node) {
            outcome.unchanged += 1;
        } else {
            if dest.exists() {
                fs::remove_dir_all(&dest).map_err(|e| {
                    PkgError::filesystem(format!("Failed to replace {}: {e}", dest.display()))
                })?;
            }
            let tarball = tarballs.get(&placement.node).ok_or_else(|| {
                PkgError::filesystem(format!("No fetched tarball for {node}"))
            })?;
            let bytes = fs::read(tarball).map_err(|e| {
                PkgError::filesystem(format!("Failed to read {}: {e}", tarball.display()))
            })?;
            extract_tgz_atomic(&bytes, &dest).map_err(|e| e.with_context(node))?;
            debug!(package = %node, path = %placement.path.display(), "extracted");
            outcome.extracted += 1;
        }

        let bin_dir = project_dir.join(&placement.node_modules).join(".bin");
        for (bin_name, target) in &node.bins {
            if let Some(link) = link_bin(&bin_dir, &node.name, bin_name, target, &dest)? {
                outcome.bins.push(link);
            }
        }
    }

    Ok(outcome)
}

/// Whether `dest` already holds exactly `node`.
fn is_installed(dest: &Path, node: &ResolvedNode) -> bool {
    let Ok(content) = fs::read_to_string(dest.join("package.json")) else {
        return false;
    };
    let Ok(manifest) = serde_json::from_str::<Value>(&content) else {
        return false;
    };
    let version = manifest.get("version").and_then(Value::as_str);
    let name = manifest.get("name").and_then(Value::as_str);
    name == Some(node.name.as_str()) && version == Some(node.version.to_string().as_str())
}

/// Only plain relative paths inside the package.
fn is_safe_relative(path: &Path) -> bool {
    path.components()
        .all(|c| matches!(c, Component::Normal(_) | Component::CurDir))
}

/// Link `<bin_dir>/<bin_name>` to `target` inside the package.
///
/// Unsafe names or targets are skipped.
fn link_bin(
    bin_dir: &Path,
    package: &str,
    bin_name: &str,
    target: &str,
    package_dir: &Path,
) -> Result<Option<PathBuf>, PkgError> {
    let target_rel = Path::new(target);
    if bin_name.is_empty()
        || bin_name.contains(['/', '\\'])
        || bin_name.starts_with('.')
        || !is_safe_relative(target_rel)
    {
        warn!(package, bin = bin_name, target, "skipping unsafe bin entry");
        return Ok(None);
    }

    let target_rel: PathBuf = target_rel
        .components()
        .filter(|c| matches!(c, Component::Normal(_)))
        .collect();
    let target_abs = package_dir.join(&target_rel);
    if !target_abs.is_file() {
        warn!(package, bin = bin_name, target, "bin target missing from package");
        return Ok(None);
    }

    fs::create_dir_all(bin_dir)?;
    let link = bin_dir.join(bin_name);
    if fs::symlink_metadata(&link).is_ok() {
        fs::remove_file(&link).map_err(|e| {
            PkgError::filesystem(format!("Failed to remove {}: {e}", link.display()))
        })?;
    }

    create_bin_link(&target_abs, &link, package, &target_rel)?;
    Ok(Some(link))
}

#[cfg(unix)]
fn create_bin_link(
    target_abs: &Path,
    link: &Path,
    package: &str,
    target_rel: &Path,
) -> Result<(), PkgError> {
    use std::os::unix::fs::PermissionsExt;

    // Relative so the tree stays valid when the project moves.
    let mut relative = PathBuf::from("..");
    for part in package.split('/') {
        relative.push(part);
    }
    relative.push(target_rel);

    std::os::unix::fs::symlink(&relative, link).map_err(|e| {
        PkgError::filesystem(format!(
            "Failed to link {} -> {}: {e}",
            link.display(),
            relative.display()
        ))
    })?;

    let mode = fs::metadata(target_abs)?.permissions().mode();
    fs::set_permissions(target_abs, fs::Permissions::from_mode(mode | 0o111))?;
    Ok(())
}

#[cfg(not(unix))]
fn create_bin_link(
    target_abs: &Path,
    link: &Path,
    _package: &str,
    _target_rel: &Path,
) -> Result<(), PkgError> {
    fs::copy(target_abs, link).map_err(|e| {
        PkgError::filesystem(format!("Failed to copy bin to {}: {e}", link.display()))
    })?;
    Ok(())
}
