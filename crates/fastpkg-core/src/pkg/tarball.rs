//! Tarball download and extraction.

use super::error::PkgError;
use bytes::Bytes;
use flate2::read::GzDecoder;
use reqwest::Client;
use std::fs::{self, File};
use std::io;
use std::path::{Component, Path, PathBuf};
use std::time::Duration;
use tar::{Archive, EntryType};

/// Maximum tarball size (200 MB).
pub const MAX_TARBALL_SIZE: u64 = 200 * 1024 * 1024;

/// Download timeout in seconds.
const DOWNLOAD_TIMEOUT_SECS: u64 = 30;

/// Download a tarball from a URL.
///
/// If `auth_token` is provided, attaches a `Bearer` authorization header.
/// Connection failures and 5xx answers are reported as
/// `PKG_REGISTRY_UNAVAILABLE` so the caller may retry them.
///
/// # Errors
/// Returns an error if the download fails or exceeds the size limit.
pub async fn download_tarball(
    client: &Client,
    url: &str,
    max_bytes: u64,
    auth_token: Option<&str>,
) -> Result<Bytes, PkgError> {
    let mut request = client
        .get(url)
        .timeout(Duration::from_secs(DOWNLOAD_TIMEOUT_SECS));

    if let Some(token) = auth_token {
        request = request.bearer_auth(token);
    }

    let response = request.send().await.map_err(|e| {
        if e.is_connect() || e.is_timeout() {
            PkgError::registry_unavailable(format!("Failed to download '{url}': {e}"))
        } else {
            PkgError::download_failed(format!("Failed to download '{url}': {e}"))
        }
    })?;

    let status = response.status();
    if status.is_server_error() {
        return Err(PkgError::registry_unavailable(format!(
            "Download failed with status {status} for '{url}'"
        )));
    }
    if !status.is_success() {
        return Err(PkgError::download_failed(format!(
            "Download failed with status {status} for '{url}'"
        )));
    }

    if let Some(len) = response.content_length() {
        if len > max_bytes {
            return Err(PkgError::download_failed(format!(
                "Tarball too large: {len} bytes (max: {max_bytes})"
            )));
        }
    }

    let bytes = response
        .bytes()
        .await
        .map_err(|e| PkgError::download_failed(format!("Failed to read response body: {e}")))?;

    if bytes.len() as u64 > max_bytes {
        return Err(PkgError::download_failed(format!(
            "Tarball too large: {} bytes (max: {max_bytes})",
            bytes.len()
        )));
    }

    Ok(bytes)
}

/// Extract a tarball into `dest` atomically.
///
/// Entries are unpacked into a temp directory next to `dest`, and the single
/// top-level directory of the archive (usually `package/`) is renamed into
/// place. If `dest` already exists nothing is written.
///
/// # Errors
/// Returns an error if extraction fails or the tarball is invalid.
pub fn extract_tgz_atomic(bytes: &[u8], dest: &Path) -> Result<(), PkgError> {
    let parent = dest
        .parent()
        .ok_or_else(|| PkgError::extract_failed("Destination has no parent"))?;
    fs::create_dir_all(parent)?;

    if dest.exists() {
        return Ok(());
    }

    // Removed on drop, including every error path below.
    let staging = tempfile::Builder::new()
        .prefix(".fastpkg-extract-")
        .tempdir_in(parent)?;

    extract_tgz_to(bytes, staging.path())?;
    let extracted_root = find_extracted_root(staging.path())?;

    match fs::rename(&extracted_root, dest) {
        Ok(()) => Ok(()),
        // Another extraction won the race.
        Err(_) if dest.exists() => Ok(()),
        Err(rename_err) => copy_dir_all(&extracted_root, dest).map_err(|copy_err| {
            let _ = fs::remove_dir_all(dest);
            PkgError::extract_failed(format!(
                "Failed to move or copy extracted package: rename={rename_err}, copy={copy_err}"
            ))
        }),
    }
}

/// Find the single top-level directory in an extracted tarball.
///
/// npm tarballs usually contain `package/`, but some (e.g. `@types/*`) use
/// the bare package name instead.
fn find_extracted_root(staging: &Path) -> Result<PathBuf, PkgError> {
    let package_dir = staging.join("package");
    if package_dir.is_dir() {
        return Ok(package_dir);
    }

    let mut dirs: Vec<PathBuf> = fs::read_dir(staging)
        .map_err(|e| PkgError::extract_failed(format!("Failed to read extracted dir: {e}")))?
        .filter_map(Result::ok)
        .filter(|e| e.file_type().is_ok_and(|ft| ft.is_dir()))
        .map(|e| e.path())
        .collect();

    match dirs.len() {
        1 => Ok(dirs.remove(0)),
        0 => Err(PkgError::extract_failed(
            "Tarball does not contain any top-level directory",
        )),
        n => Err(PkgError::extract_failed(format!(
            "Tarball contains {n} top-level directories, expected 1"
        ))),
    }
}

fn extract_tgz_to(bytes: &[u8], dest: &Path) -> Result<(), PkgError> {
    let mut archive = Archive::new(GzDecoder::new(bytes));
    let entries = archive
        .entries()
        .map_err(|e| PkgError::extract_failed(format!("Failed to read tarball entries: {e}")))?;

    for entry in entries {
        let mut entry = entry
            .map_err(|e| PkgError::extract_failed(format!("Failed to read tarball entry: {e}")))?;
        let path = entry
            .path()
            .map_err(|e| PkgError::extract_failed(format!("Failed to read entry path: {e}")))?
            .into_owned();

        let target = sanitized_target(dest, &path)?;
        let kind = entry.header().entry_type();

        match kind {
            EntryType::Directory => fs::create_dir_all(&target)?,
            EntryType::Regular | EntryType::Continuous => {
                if let Some(parent) = target.parent() {
                    fs::create_dir_all(parent)?;
                }
                let mut file = File::create(&target)?;
                io::copy(&mut entry, &mut file).map_err(|e| {
                    PkgError::extract_failed(format!("Failed to unpack {}: {e}", path.display()))
                })?;

                #[cfg(unix)]
                {
                    use std::os::unix::fs::PermissionsExt;
                    if let Ok(mode) = entry.header().mode() {
                        // Always readable by the owner, keep the executable bits.
                        let perms = fs::Permissions::from_mode(mode | 0o600);
                        let _ = fs::set_permissions(&target, perms);
                    }
                }
            }
            // Links and device files are never materialized.
            _ => tracing::debug!(path = %path.display(), ?kind, "skipping tar entry"),
        }
    }

    Ok(())
}

/// Resolve an entry path under `dest`, rejecting absolute paths and `..`.
fn sanitized_target(dest: &Path, path: &Path) -> Result<PathBuf, PkgError> {
    let mut target = dest.to_path_buf();
    for component in path.components() {
        match component {
            Component::Normal(part) => target.push(part),
            Component::CurDir => {}
            Component::ParentDir => {
                return Err(PkgError::extract_failed(format!(
                    "Tarball contains path traversal: {}",
                    path.display()
                )))
            }
            Component::RootDir | Component::Prefix(_) => {
                return Err(PkgError::extract_failed(format!(
                    "Tarball contains absolute path: {}",
                    path.display()
                )))
            }
        }
    }
    Ok(target)
}

fn copy_dir_all(src: &Path, dst: &Path) -> io::Result<()> {
    fs::create_dir_all(dst)?;

    for entry in fs::read_dir(src)? {
        let entry = entry?;
        let ty = entry.file_type()?;
        let dst_path = dst.join(entry.file_name());

        if ty.is_dir() {
            copy_dir_all(&entry.path(), &dst_path)?;
        } else if ty.is_file() {
            fs::copy(entry.path(), &dst_path)?;
        }
    }

    Ok(())
}
