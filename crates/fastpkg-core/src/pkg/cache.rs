//! Content-addressed tarball cache.
//!
//! Artifacts are stored as `<root>/<name>/<version>/<digest>.tgz`, where the
//! digest is derived from the expected integrity so that a republished
//! tarball never aliases an older one.

use super::error::PkgError;
use super::integrity::Integrity;
use fastpkg_util::fs::atomic_write;
use fastpkg_util::hash::short_digest;
use semver::Version;
use serde::{Deserialize, Serialize};
use std::fs;
use std::path::{Path, PathBuf};
use tracing::debug;

/// File stem used for artifacts published without any integrity.
const UNVERIFIED_STEM: &str = "unverified";

/// Identity of a cached artifact.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct CacheKey {
    pub name: String,
    pub version: Version,
    pub integrity: Option<Integrity>,
}

impl CacheKey {
    #[must_use]
    pub fn new(name: impl Into<String>, version: Version, integrity: Option<Integrity>) -> Self {
        Self {
            name: name.into(),
            version,
            integrity,
        }
    }

    fn file_name(&self) -> String {
        let stem = self
            .integrity
            .as_ref()
            .map_or_else(|| UNVERIFIED_STEM.to_string(), |i| short_digest(&i.to_string(), 16));
        format!("{stem}.tgz")
    }
}

/// A stored artifact. Never mutated once written.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct CacheEntry {
    pub key: CacheKey,
    pub path: PathBuf,
    pub size: u64,
}

/// An artifact found on disk by [`PackageCache::list`].
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct CachedArtifact {
    pub name: String,
    pub version: String,
    pub path: PathBuf,
    pub size: u64,
}

/// Tarball cache rooted at a directory.
#[derive(Debug, Clone)]
pub struct PackageCache {
    root: PathBuf,
}

impl PackageCache {
    #[must_use]
    pub fn new(root: impl Into<PathBuf>) -> Self {
        Self { root: root.into() }
    }

    /// Get the cache root directory.
    #[must_use]
    pub fn root(&self) -> &Path {
        &self.root
    }

    /// Path where the artifact for `key` lives (or would live).
    ///
    /// Scoped names nest as `@scope/name`.
    #[must_use]
    pub fn path_for(&self, key: &CacheKey) -> PathBuf {
        let mut path = self.root.clone();
        for part in key.name.split('/') {
            path.push(part);
        }
        path.push(key.version.to_string());
        path.push(key.file_name());
        path
    }

    /// Look up a stored artifact.
    #[must_use]
    pub fn entry(&self, key: &CacheKey) -> Option<CacheEntry> {
        let path = self.path_for(key);
        let meta = fs::metadata(&path).ok().filter(fs::Metadata::is_file)?;
        Some(CacheEntry {
            key: key.clone(),
            path,
            size: meta.len(),
        })
    }

    /// Store verified bytes for `key`.
    ///
    /// Written through a temp file in the destination directory and renamed,
    /// so readers never observe a partial artifact.
    ///
    /// # Errors
    /// Returns `PKG_FILESYSTEM_ERROR` if the write fails.
    pub fn store(&self, key: &CacheKey, bytes: &[u8]) -> Result<CacheEntry, PkgError> {
        let path = self.path_for(key);
        atomic_write(&path, bytes).map_err(|e| {
            PkgError::filesystem(format!("Failed to write {}: {e}", path.display()))
        })?;
        debug!(name = %key.name, version = %key.version, path = %path.display(), "cached artifact");

        Ok(CacheEntry {
            key: key.clone(),
            path,
            size: bytes.len() as u64,
        })
    }

    /// List every stored artifact, sorted by name then version directory.
    ///
    /// # Errors
    /// Returns an error if the cache directory cannot be read.
    pub fn list(&self) -> Result<Vec<CachedArtifact>, PkgError> {
        let mut result = Vec::new();

        if !self.root.exists() {
            return Ok(result);
        }

        for (name, name_dir) in package_dirs(&self.root)? {
            for version_dir in sorted_children(&name_dir)? {
                if !version_dir.is_dir() {
                    continue;
                }
                let version = file_name_string(&version_dir);
                for file in sorted_children(&version_dir)? {
                    if file.extension().is_some_and(|ext| ext == "tgz") && file.is_file() {
                        let size = fs::metadata(&file)?.len();
                        result.push(CachedArtifact {
                            name: name.clone(),
                            version: version.clone(),
                            path: file,
                            size,
                        });
                    }
                }
            }
        }

        Ok(result)
    }

    /// Remove every stored artifact. Returns how many were removed.
    ///
    /// # Errors
    /// Returns an error if the cache directory cannot be removed.
    pub fn clear(&self) -> Result<usize, PkgError> {
        if !self.root.exists() {
            return Ok(0);
        }

        let count = self.list()?.len();
        fs::remove_dir_all(&self.root).map_err(|e| {
            PkgError::filesystem(format!(
                "Failed to clear cache {}: {e}",
                self.root.display()
            ))
        })?;
        Ok(count)
    }
}

/// `(package name, directory)` pairs under the cache root, scopes expanded.
fn package_dirs(root: &Path) -> Result<Vec<(String, PathBuf)>, PkgError> {
    let mut dirs = Vec::new();
    for dir in sorted_children(root)? {
        if !dir.is_dir() {
            continue;
        }
        let name = file_name_string(&dir);
        if name.starts_with('@') {
            for scoped in sorted_children(&dir)? {
                if scoped.is_dir() {
                    dirs.push((format!("{name}/{}", file_name_string(&scoped)), scoped));
                }
            }
        } else if !name.starts_with('.') {
            dirs.push((name, dir));
        }
    }
    Ok(dirs)
}

fn sorted_children(dir: &Path) -> Result<Vec<PathBuf>, PkgError> {
    let mut children: Vec<PathBuf> = fs::read_dir(dir)?
        .filter_map(Result::ok)
        .map(|e| e.path())
        .collect();
    children.sort();
    Ok(children)
}

fn file_name_string(path: &Path) -> String {
    path.file_name()
        .map(|n| n.to_string_lossy().into_owned())
        .unwrap_or_default()
}
