//! Package spec parsing.
//!
//! Parses package specifications like:
//! - `react` (same as `react@latest`)
//! - `react@18.2.0`
//! - `react@^18.0.0`
//! - `react@next`
//! - `@types/node@^20`

use super::error::PkgError;
use serde::{Deserialize, Serialize};
use std::fmt;

/// Range used when a spec names no version.
pub const DEFAULT_RANGE: &str = "latest";

/// A dependency request: a package name plus a version range or dist-tag.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct PackageSpec {
    /// Full package name (e.g., "@scope/name" or "name").
    pub name: String,
    /// Version range or dist-tag as written by the dependent.
    pub range: String,
}

impl PackageSpec {
    /// Build a spec from an already-split name and range.
    ///
    /// An empty range means `latest`, as in npm.
    ///
    /// # Errors
    /// Returns an error if the name is invalid.
    pub fn new(name: impl Into<String>, range: impl Into<String>) -> Result<Self, PkgError> {
        let name = name.into();
        validate_full_name(&name)?;

        let range = range.into();
        let range = if range.trim().is_empty() {
            DEFAULT_RANGE.to_string()
        } else {
            range.trim().to_string()
        };

        Ok(Self { name, range })
    }

    /// Parse a `name[@range]` specification string.
    ///
    /// # Errors
    /// Returns an error if the spec is invalid.
    pub fn parse(input: &str) -> Result<Self, PkgError> {
        let input = input.trim();

        if input.is_empty() {
            return Err(PkgError::spec_invalid("Empty package spec"));
        }

        // The version delimiter is the first '@' after position 0, so a
        // scope prefix is never mistaken for it.
        let delimiter = input
            .char_indices()
            .skip(1)
            .find(|&(_, c)| c == '@')
            .map(|(pos, _)| pos);

        let (name, range) = match delimiter {
            Some(pos) => {
                let name = &input[..pos];
                let range = &input[pos + 1..];
                if range.is_empty() {
                    return Err(PkgError::spec_invalid(format!(
                        "Invalid package spec: empty version range in '{input}'"
                    )));
                }
                (name, range)
            }
            None => (input, DEFAULT_RANGE),
        };

        Self::new(name, range)
    }

    /// Get the scope without the `@` prefix, if scoped.
    #[must_use]
    pub fn scope(&self) -> Option<&str> {
        scope_of(&self.name)
    }

    /// Check if this is a scoped package.
    #[must_use]
    pub fn is_scoped(&self) -> bool {
        self.scope().is_some()
    }

    /// Get the unscoped portion of the name.
    ///
    /// For `@scope/name`, returns `name`.
    /// For `react`, returns `react`.
    #[must_use]
    pub fn unscoped_name(&self) -> &str {
        unscoped_name(&self.name)
    }
}

impl fmt::Display for PackageSpec {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}@{}", self.name, self.range)
    }
}

/// Scope of a package name without the `@` prefix.
#[must_use]
pub fn scope_of(name: &str) -> Option<&str> {
    let rest = name.strip_prefix('@')?;
    rest.split_once('/').map(|(scope, _)| scope)
}

/// Name without its `@scope/` prefix.
#[must_use]
pub fn unscoped_name(name: &str) -> &str {
    if name.starts_with('@') {
        name.split_once('/').map_or(name, |(_, rest)| rest)
    } else {
        name
    }
}

/// URL-encode a package name for registry requests.
///
/// For scoped packages, encodes the `/` as `%2F`.
#[must_use]
pub fn url_encoded_name(name: &str) -> String {
    if name.starts_with('@') {
        name.replace('/', "%2F")
    } else {
        name.to_string()
    }
}

/// Check a full (possibly scoped) package name.
pub(crate) fn validate_full_name(name: &str) -> Result<(), PkgError> {
    if let Some(rest) = name.strip_prefix('@') {
        let Some((scope, pkg)) = rest.split_once('/') else {
            return Err(PkgError::spec_invalid(format!(
                "Invalid scoped package: missing '/' in '{name}'"
            )));
        };
        if scope.is_empty() {
            return Err(PkgError::spec_invalid(format!(
                "Invalid scoped package: empty scope in '{name}'"
            )));
        }
        if pkg.is_empty() {
            return Err(PkgError::spec_invalid(format!(
                "Invalid scoped package: empty name in '{name}'"
            )));
        }
        validate_name(scope)?;
        validate_name(pkg)
    } else {
        validate_name(name)
    }
}

fn validate_name(name: &str) -> Result<(), PkgError> {
    if name.is_empty() {
        return Err(PkgError::spec_invalid("Empty package name"));
    }

    // Covers `.` and `..`, which would escape node_modules and the cache.
    if name.starts_with('.') || name.starts_with('_') {
        return Err(PkgError::spec_invalid(format!(
            "Package name '{name}' cannot start with '.' or '_'"
        )));
    }

    for c in name.chars() {
        if !c.is_alphanumeric() && c != '-' && c != '_' && c != '.' {
            return Err(PkgError::spec_invalid(format!(
                "Invalid character '{c}' in package name '{name}'"
            )));
        }
    }

    Ok(())
}
