//! `.npmrc` file parser for registry and cache configuration.
//!
//! Parses `.npmrc` files to extract:
//! - `registry=URL` for the default registry
//! - `@scope:registry=URL` directives for routing scoped packages
//! - `//host/:_authToken=TOKEN` directives for registry authentication
//! - `cache=false` or `cache=<path>` for the tarball cache
//! - `${ENV_VAR}` expansion in token values

use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::path::{Path, PathBuf};
use url::Url;

/// What an `.npmrc` says about the tarball cache.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum CacheSetting {
    /// `cache=false`: artifacts go to a per-run temporary directory.
    Disabled,
    /// `cache=<path>`: persistent cache rooted at the given directory.
    Dir(PathBuf),
}

/// Parsed `.npmrc` configuration.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct NpmrcConfig {
    /// Default registry URL from `registry=`.
    pub registry: Option<Url>,
    /// Scope → registry URL mapping (e.g., `@acme` → `https://npm.acme.dev/`).
    pub scoped_registries: BTreeMap<String, Url>,
    /// Host (optionally with path) → auth token mapping.
    #[serde(skip_serializing)]
    pub auth_tokens: BTreeMap<String, String>,
    /// Cache directive from `cache=`.
    pub cache: Option<CacheSetting>,
}

impl NpmrcConfig {
    /// Registry configured for `@scope`, if any.
    #[must_use]
    pub fn registry_for_scope(&self, scope: &str) -> Option<&Url> {
        self.scoped_registries.get(&format!("@{scope}"))
    }

    /// Auth token configured for the host serving `url`.
    ///
    /// A `host/path` entry wins over a bare `host` entry.
    #[must_use]
    pub fn auth_token_for(&self, url: &Url) -> Option<&str> {
        let host = url.host_str()?;
        let host = match url.port() {
            Some(port) => format!("{host}:{port}"),
            None => host.to_string(),
        };

        let url_path = url.path().trim_end_matches('/');
        if !url_path.is_empty() {
            let mut prefix = url_path;
            // Longest configured path prefix first
            loop {
                if let Some(token) = self.auth_tokens.get(&format!("{host}{prefix}")) {
                    return Some(token);
                }
                match prefix.rfind('/') {
                    Some(0) | None => break,
                    Some(pos) => prefix = &prefix[..pos],
                }
            }
        }

        self.auth_tokens.get(&host).map(String::as_str)
    }
}

/// Parse a single `.npmrc` file's content.
///
/// Ignores comments (`#`, `;`), blank lines and unknown keys.
#[must_use]
pub fn parse_npmrc(content: &str) -> NpmrcConfig {
    let mut config = NpmrcConfig::default();

    for line in content.lines() {
        let line = line.trim();

        // Skip empty lines and comments
        if line.is_empty() || line.starts_with('#') || line.starts_with(';') {
            continue;
        }

        let Some((key, value)) = line.split_once('=') else {
            continue;
        };
        let key = key.trim();
        let value = value.trim();

        // @scope:registry=URL
        if key.starts_with('@') {
            if let Some((scope, "registry")) = key.split_once(':') {
                if let Some(url) = parse_registry_url(value) {
                    config.scoped_registries.insert(scope.to_string(), url);
                }
            }
            continue;
        }

        // //host/:_authToken=TOKEN  or  //host/path/:_authToken=TOKEN
        if key.starts_with("//") {
            if let Some(host_part) = key
                .strip_prefix("//")
                .and_then(|k| k.strip_suffix(":_authToken"))
            {
                let token = expand_env_vars(value);
                if !token.is_empty() {
                    config
                        .auth_tokens
                        .insert(host_part.trim_end_matches('/').to_string(), token);
                }
            }
            continue;
        }

        match key {
            "registry" => config.registry = parse_registry_url(value),
            "cache" => config.cache = Some(parse_cache_setting(value)),
            _ => {}
        }
    }

    config
}

/// Load and merge `.npmrc` files from project directory up to home.
///
/// Priority order (first wins, no overwrite):
/// 1. `project_dir/.npmrc`
/// 2. Parent directories up to filesystem root
/// 3. `$HOME/.npmrc`
#[must_use]
pub fn load_npmrc_files(project_dir: &Path) -> NpmrcConfig {
    let mut merged = NpmrcConfig::default();

    let mut dir = Some(project_dir);
    while let Some(d) = dir {
        merge_file(&mut merged, &d.join(".npmrc"));
        dir = d.parent();
    }

    // May already be covered by the walk, but handles project dirs outside HOME
    if let Some(home) = dirs_next::home_dir() {
        merge_file(&mut merged, &home.join(".npmrc"));
    }

    merged
}

fn merge_file(target: &mut NpmrcConfig, path: &Path) {
    if !path.is_file() {
        return;
    }
    match std::fs::read_to_string(path) {
        Ok(content) => merge_config(target, parse_npmrc(&content)),
        Err(e) => tracing::warn!(path = %path.display(), error = %e, "skipping unreadable .npmrc"),
    }
}

/// Merge `source` into `target`, keeping existing entries (first wins).
fn merge_config(target: &mut NpmrcConfig, source: NpmrcConfig) {
    if target.registry.is_none() {
        target.registry = source.registry;
    }
    if target.cache.is_none() {
        target.cache = source.cache;
    }
    for (scope, url) in source.scoped_registries {
        target.scoped_registries.entry(scope).or_insert(url);
    }
    for (host, token) in source.auth_tokens {
        target.auth_tokens.entry(host).or_insert(token);
    }
}

/// Parse a registry URL, ensuring a trailing slash for proper joining.
fn parse_registry_url(value: &str) -> Option<Url> {
    let url_str = if value.ends_with('/') {
        value.to_string()
    } else {
        format!("{value}/")
    };
    match Url::parse(&url_str) {
        Ok(url) => Some(url),
        Err(e) => {
            tracing::warn!(value, error = %e, "ignoring invalid registry URL in .npmrc");
            None
        }
    }
}

fn parse_cache_setting(value: &str) -> CacheSetting {
    match value {
        "false" => CacheSetting::Disabled,
        path => CacheSetting::Dir(PathBuf::from(expand_env_vars(path))),
    }
}

/// Expand `${ENV_VAR}` patterns in a string.
fn expand_env_vars(input: &str) -> String {
    let mut result = String::with_capacity(input.len());
    let mut chars = input.chars().peekable();

    while let Some(ch) = chars.next() {
        if ch == '$' && chars.peek() == Some(&'{') {
            chars.next(); // consume '{'
            let mut var_name = String::new();
            for ch in chars.by_ref() {
                if ch == '}' {
                    break;
                }
                var_name.push(ch);
            }
            // Missing variables expand to nothing, as npm does
            if let Ok(val) = std::env::var(&var_name) {
                result.push_str(&val);
            }
        } else {
            result.push(ch);
        }
    }

    result
}
