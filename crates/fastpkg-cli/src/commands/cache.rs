use super::format_bytes;
use fastpkg_core::pkg::{CachedArtifact, PackageCache};
use fastpkg_core::InstallConfig;
use miette::{IntoDiagnostic, Result};
use serde::Serialize;
use std::path::{Path, PathBuf};

#[derive(Serialize)]
struct CacheListResult {
    ok: bool,
    cache_dir: PathBuf,
    packages: Vec<CachedArtifact>,
    total_size_bytes: u64,
}

#[derive(Serialize)]
struct CacheClearResult {
    ok: bool,
    cache_dir: PathBuf,
    removed_count: usize,
}

fn open_cache(cwd: &Path) -> Result<PackageCache> {
    let config = InstallConfig::load(cwd).into_diagnostic()?;
    Ok(PackageCache::new(config.cache_dir))
}

pub fn list(cwd: &Path, json: bool) -> Result<()> {
    let cache = open_cache(cwd)?;
    let packages = cache.list().into_diagnostic()?;
    let total_size_bytes = packages.iter().map(|p| p.size).sum();

    if json {
        let result = CacheListResult {
            ok: true,
            cache_dir: cache.root().to_path_buf(),
            packages,
            total_size_bytes,
        };
        println!("{}", serde_json::to_string_pretty(&result).into_diagnostic()?);
        return Ok(());
    }

    if packages.is_empty() {
        println!("Cache is empty ({})", cache.root().display());
        return Ok(());
    }
    for package in &packages {
        println!(
            "{}@{}  {}",
            package.name,
            package.version,
            format_bytes(package.size)
        );
    }
    println!(
        "{} tarballs, {} in {}",
        packages.len(),
        format_bytes(total_size_bytes),
        cache.root().display()
    );
    Ok(())
}

pub fn clear(cwd: &Path, json: bool) -> Result<()> {
    let cache = open_cache(cwd)?;
    let removed_count = cache.clear().into_diagnostic()?;

    if json {
        let result = CacheClearResult {
            ok: true,
            cache_dir: cache.root().to_path_buf(),
            removed_count,
        };
        println!("{}", serde_json::to_string_pretty(&result).into_diagnostic()?);
    } else {
        println!("Removed {removed_count} cached tarballs");
    }
    Ok(())
}
