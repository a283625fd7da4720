use crate::version::SCHEMA_VERSION;
use std::path::{Path, PathBuf};

/// Find the project root by walking up from `cwd` looking for `package.json`.
#[must_use]
pub fn project_root(cwd: &Path) -> Option<PathBuf> {
    let mut current = cwd.to_path_buf();

    loop {
        if current.join("package.json").exists() {
            return Some(current);
        }

        if !current.pop() {
            return None;
        }
    }
}

/// Get the tarball cache directory for fastpkg.
///
/// Uses platform-appropriate locations with versioning:
/// - Linux: `$XDG_CACHE_HOME/fastpkg/v{N}` or `~/.cache/fastpkg/v{N}`
/// - macOS: `~/Library/Caches/fastpkg/v{N}`
/// - Windows: `%LOCALAPPDATA%\fastpkg\v{N}`
#[must_use]
pub fn cache_dir() -> PathBuf {
    let base = dirs_next::cache_dir().map_or_else(
        || {
            dirs_next::home_dir().map_or_else(
                || PathBuf::from(".fastpkg-cache"),
                |p| p.join(".cache").join("fastpkg"),
            )
        },
        |p| p.join("fastpkg"),
    );

    base.join(format!("v{SCHEMA_VERSION}"))
}
