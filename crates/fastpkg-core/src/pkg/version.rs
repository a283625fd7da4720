//! Version resolution using semver.
//!
//! npm range syntax is translated into `semver::VersionReq` alternatives.
//! Anything that is not a range but is a valid identifier is a dist-tag.

use super::error::PkgError;
use super::manifest::VersionManifest;
use super::spec::PackageSpec;
use semver::{Version, VersionReq};

/// A parsed version constraint.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Range {
    /// A dist-tag such as `latest` or `next`.
    Tag(String),
    /// One or more `||` alternatives; a version matches if any alternative does.
    Semver(Vec<VersionReq>),
}

impl Range {
    /// Parse an npm range or dist-tag.
    ///
    /// # Rules
    /// - Empty string means `latest`
    /// - Exact versions (`1.2.3`, `=1.2.3`, `v1.2.3`) match only themselves
    /// - Partial versions (`1`, `1.2`) behave like x-ranges
    /// - Supports `^`, `~`, comparators, hyphen ranges, x-ranges, `*`
    /// - Supports OR ranges like `^1.0.0 || ^2.0.0`
    ///
    /// # Errors
    /// Returns an error if the input is neither a valid range nor a valid tag.
    pub fn parse(input: &str) -> Result<Self, PkgError> {
        let input = input.trim();

        if input.is_empty() {
            return Ok(Self::Tag("latest".to_string()));
        }

        if input.contains("||") {
            return parse_or_range(input);
        }

        match parse_range(input) {
            Ok(req) => Ok(Self::Semver(vec![req])),
            Err(_) if is_tag_name(input) => Ok(Self::Tag(input.to_string())),
            Err(e) => Err(e),
        }
    }

    /// Check whether a concrete version satisfies this range.
    ///
    /// Tags never match by themselves; they are resolved through the manifest.
    #[must_use]
    pub fn satisfies(&self, version: &Version) -> bool {
        match self {
            Self::Tag(_) => false,
            Self::Semver(reqs) => reqs.iter().any(|req| req.matches(version)),
        }
    }

    /// Highest version among `candidates` that satisfies this range.
    pub fn max_satisfying<'a>(
        &self,
        candidates: impl IntoIterator<Item = &'a Version>,
    ) -> Option<&'a Version> {
        candidates
            .into_iter()
            .filter(|v| self.satisfies(v))
            .max()
    }
}

/// Resolve a spec against a manifest.
///
/// Returns the highest version satisfying the range, or the version the
/// dist-tag points at.
///
/// # Errors
/// Returns `PKG_NO_MATCHING_VERSION` if nothing matches, or
/// `PKG_SPEC_INVALID` if the range cannot be parsed.
pub fn resolve(spec: &PackageSpec, manifest: &VersionManifest) -> Result<Version, PkgError> {
    let range = Range::parse(&spec.range)?;
    resolve_range(&spec.name, &spec.range, &range, manifest)
}

/// Resolve an already-parsed range against a manifest.
///
/// # Errors
/// Returns `PKG_NO_MATCHING_VERSION` if nothing matches.
pub fn resolve_range(
    name: &str,
    raw: &str,
    range: &Range,
    manifest: &VersionManifest,
) -> Result<Version, PkgError> {
    let found = match range {
        Range::Tag(tag) => manifest
            .dist_tag(tag)
            .filter(|v| manifest.versions.contains_key(*v)),
        Range::Semver(_) => range.max_satisfying(manifest.versions.keys()),
    };

    found
        .cloned()
        .ok_or_else(|| PkgError::no_matching_version(name, raw))
}

/// Parse an OR range like "^1.0.0 || ^2.0.0".
fn parse_or_range(range: &str) -> Result<Range, PkgError> {
    let mut reqs: Vec<VersionReq> = Vec::new();
    for alt in range.split("||").map(str::trim) {
        if alt.is_empty() {
            continue;
        }
        // Skip invalid alternatives, keep the others
        if let Ok(req) = parse_range(alt) {
            reqs.push(req);
        }
    }

    if reqs.is_empty() {
        return Err(PkgError::spec_invalid(format!(
            "Invalid version range '{range}': no valid alternatives"
        )));
    }

    Ok(Range::Semver(reqs))
}

/// Parse a single version range, handling npm-specific syntax.
///
/// Handles:
/// - Exact versions: 1.2.3, =1.2.3, v1.2.3
/// - Partial versions: 1, 1.2
/// - Standard semver ranges: ^1.0.0, ~1.0.0, >=1.0.0, etc.
/// - Hyphen ranges: 1.0.0 - 2.0.0
/// - X-ranges: 1.x, 1.0.x, *
/// - Space-separated comparators: >= 2.1.2 < 3.0.0
fn parse_range(range: &str) -> Result<VersionReq, PkgError> {
    let range = range.trim();
    let invalid = |e: semver::Error| PkgError::spec_invalid(format!("Invalid version range '{range}': {e}"));

    // npm treats a bare version as exact, Cargo-style semver as caret.
    let bare = range.strip_prefix('v').unwrap_or(range);
    if Version::parse(bare).is_ok() {
        return VersionReq::parse(&format!("={bare}")).map_err(invalid);
    }

    // "1" and "1.2" are x-ranges in npm.
    if is_partial_version(bare) {
        return VersionReq::parse(&format!("~{bare}")).map_err(invalid);
    }

    // Handle hyphen ranges: "1.0.0 - 2.0.0" -> ">=1.0.0, <=2.0.0"
    if let Some((start, end)) = parse_hyphen_range(range) {
        return VersionReq::parse(&format!(">={start}, <={end}")).map_err(invalid);
    }

    // Handle x-ranges: "1.x" -> ">=1.0.0, <2.0.0"
    if range
        .split(['.', ' '])
        .any(|part| matches!(part, "x" | "X" | "*"))
    {
        return VersionReq::parse(&convert_x_range(range)).map_err(invalid);
    }

    // npm allows spaces between comparators to mean AND
    VersionReq::parse(&convert_space_separated_comparators(range)).map_err(invalid)
}

/// `1` or `1.2`: one or two numeric components and nothing else.
fn is_partial_version(input: &str) -> bool {
    let parts: Vec<&str> = input.split('.').collect();
    (1..=2).contains(&parts.len())
        && parts
            .iter()
            .all(|p| !p.is_empty() && p.chars().all(|c| c.is_ascii_digit()))
}

/// Tags are identifiers that start with a letter, e.g. `latest`, `next`, `beta-2`.
fn is_tag_name(input: &str) -> bool {
    let mut chars = input.chars();
    chars.next().is_some_and(|c| c.is_ascii_alphabetic())
        && chars.all(|c| c.is_ascii_alphanumeric() || matches!(c, '-' | '_' | '.'))
}

/// Parse a hyphen range like "1.0.0 - 2.0.0".
fn parse_hyphen_range(range: &str) -> Option<(String, String)> {
    let (start, end) = range.split_once(" - ")?;
    let (start, end) = (start.trim(), end.trim());
    if start.is_empty() || end.is_empty() {
        return None;
    }
    Some((start.to_string(), end.to_string()))
}

/// Convert space-separated comparators to comma-separated.
///
/// npm allows: ">= 2.1.2 < 3.0.0" which means ">=2.1.2 AND <3.0.0"
/// Rust semver requires: ">=2.1.2, <3.0.0"
fn convert_space_separated_comparators(range: &str) -> String {
    let mut result = String::new();
    let mut need_comma = false;

    for token in range.split_whitespace() {
        if token_has_version(token) {
            // Operator-only tokens were already pushed; glue the version on.
            let glued = result.ends_with(|c: char| matches!(c, '>' | '<' | '=' | '~' | '^'));
            if need_comma && !glued {
                result.push_str(", ");
            }
            result.push_str(token);
            need_comma = true;
        } else {
            if need_comma {
                result.push_str(", ");
                need_comma = false;
            }
            result.push_str(token);
        }
    }

    if result.is_empty() {
        return range.to_string();
    }
    result
}

/// Check if a token contains a version number (has digits).
fn token_has_version(token: &str) -> bool {
    token.chars().any(|c| c.is_ascii_digit())
}

/// Convert x-range to semver range.
fn convert_x_range(range: &str) -> String {
    let range = range.trim();

    if range == "*" || range == "x" || range == "X" {
        return ">=0.0.0".to_string();
    }

    let parts: Vec<&str> = range.split('.').collect();

    match parts.as_slice() {
        [major, "x" | "X" | "*"] | [major, "x" | "X" | "*", "x" | "X" | "*"] => {
            if let Ok(m) = major.parse::<u64>() {
                return format!(">={m}.0.0, <{}.0.0", m + 1);
            }
        }
        [major, minor, "x" | "X" | "*"] => {
            if let (Ok(m), Ok(n)) = (major.parse::<u64>(), minor.parse::<u64>()) {
                return format!(">={m}.{n}.0, <{m}.{}.0", n + 1);
            }
        }
        _ => {}
    }

    // Fallback: just replace x with 0
    range.replace(['x', 'X', '*'], "0")
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::pkg::error::codes;
    use serde_json::json;

    fn make_manifest(versions: &[&str], latest: Option<&str>) -> VersionManifest {
        let versions_obj: serde_json::Map<String, serde_json::Value> = versions
            .iter()
            .map(|v| {
                (
                    (*v).to_string(),
                    json!({
                        "version": v,
                        "dist": { "tarball": format!("https://example.com/{v}.tgz") }
                    }),
                )
            })
            .collect();

        let mut doc = json!({ "name": "test-pkg", "versions": versions_obj });
        if let Some(latest) = latest {
            doc["dist-tags"] = json!({ "latest": latest, "next": "3.0.0" });
        }
        VersionManifest::from_value("test-pkg", doc).unwrap()
    }

    fn resolve_str(manifest: &VersionManifest, range: &str) -> Result<String, PkgError> {
        let spec = PackageSpec::new("test-pkg", range).unwrap();
        resolve(&spec, manifest).map(|v| v.to_string())
    }

    #[test]
    fn test_star_picks_only_version() {
        let manifest = make_manifest(&["0.0.2"], None);
        assert_eq!(resolve_str(&manifest, "*").unwrap(), "0.0.2");
    }

    #[test]
    fn test_resolve_latest_tag() {
        let manifest = make_manifest(&["1.0.0", "2.0.0", "3.0.0"], Some("2.0.0"));
        assert_eq!(resolve_str(&manifest, "latest").unwrap(), "2.0.0");
        assert_eq!(resolve_str(&manifest, "").unwrap(), "2.0.0");
        assert_eq!(resolve_str(&manifest, "next").unwrap(), "3.0.0");
    }

    #[test]
    fn test_tag_bypasses_range_filtering() {
        // A tag may point below the highest version.
        let manifest = make_manifest(&["1.0.0", "2.0.0", "3.0.0"], Some("1.0.0"));
        assert_eq!(resolve_str(&manifest, "latest").unwrap(), "1.0.0");
    }

    #[test]
    fn test_missing_tag_fails() {
        let manifest = make_manifest(&["1.0.0"], Some("1.0.0"));
        let err = resolve_str(&manifest, "canary").unwrap_err();
        assert_eq!(err.code(), codes::PKG_NO_MATCHING_VERSION);
    }

    #[test]
    fn test_resolve_exact_version() {
        let manifest = make_manifest(&["1.0.0", "1.0.1", "2.0.0"], None);
        assert_eq!(resolve_str(&manifest, "1.0.0").unwrap(), "1.0.0");
        assert_eq!(resolve_str(&manifest, "=1.0.1").unwrap(), "1.0.1");
        assert_eq!(resolve_str(&manifest, "v2.0.0").unwrap(), "2.0.0");
    }

    #[test]
    fn test_exact_version_missing_fails() {
        let manifest = make_manifest(&["1.0.0", "1.0.1"], None);
        let err = resolve_str(&manifest, "1.0.2").unwrap_err();
        assert_eq!(err.code(), codes::PKG_NO_MATCHING_VERSION);
    }

    #[test]
    fn test_resolve_caret_and_tilde() {
        let manifest = make_manifest(&["1.0.0", "1.0.5", "1.5.0", "2.0.0"], None);
        assert_eq!(resolve_str(&manifest, "^1.0.0").unwrap(), "1.5.0");
        assert_eq!(resolve_str(&manifest, "~1.0.0").unwrap(), "1.0.5");
    }

    #[test]
    fn test_partial_versions() {
        let manifest = make_manifest(&["1.0.0", "1.2.0", "1.2.9", "1.5.0", "2.5.0"], None);
        assert_eq!(resolve_str(&manifest, "1").unwrap(), "1.5.0");
        assert_eq!(resolve_str(&manifest, "1.2").unwrap(), "1.2.9");
    }

    #[test]
    fn test_prerelease_sorts_lower_and_is_excluded() {
        let manifest = make_manifest(&["1.0.0", "2.0.0-alpha.1", "2.0.0-beta.1"], None);
        assert_eq!(resolve_str(&manifest, "*").unwrap(), "1.0.0");
        assert_eq!(resolve_str(&manifest, ">=1.0.0").unwrap(), "1.0.0");
        // Naming the pre-release tuple opts in.
        assert_eq!(resolve_str(&manifest, "^2.0.0-alpha.0").unwrap(), "2.0.0-beta.1");
    }

    #[test]
    fn test_invalid_range() {
        let manifest = make_manifest(&["1.0.0"], None);
        let err = resolve_str(&manifest, "not-a-range!!!").unwrap_err();
        assert_eq!(err.code(), codes::PKG_SPEC_INVALID);
    }

    #[test]
    fn test_or_range_picks_highest() {
        let manifest = make_manifest(&["1.5.0", "2.5.0", "4.0.0"], None);
        assert_eq!(resolve_str(&manifest, "^1.0.0 || ^2.0.0").unwrap(), "2.5.0");
        assert_eq!(resolve_str(&manifest, "^1.0.0||^3.0.0").unwrap(), "1.5.0");
        assert!(resolve_str(&manifest, "^5.0.0 || ^6.0.0").is_err());
    }

    #[test]
    fn test_x_ranges() {
        let manifest = make_manifest(&["1.0.0", "1.1.3", "1.5.0", "2.0.0"], None);
        assert_eq!(resolve_str(&manifest, "1.x").unwrap(), "1.5.0");
        assert_eq!(resolve_str(&manifest, "1.1.x").unwrap(), "1.1.3");
        assert_eq!(resolve_str(&manifest, "x").unwrap(), "2.0.0");
    }

    #[test]
    fn test_hyphen_range() {
        let manifest = make_manifest(&["1.0.0", "1.5.0", "2.0.0", "3.0.0"], None);
        assert_eq!(resolve_str(&manifest, "1.0.0 - 2.0.0").unwrap(), "2.0.0");
    }

    #[test]
    fn test_space_separated_comparators() {
        let manifest = make_manifest(&["2.0.0", "2.1.2", "2.5.0", "3.0.0"], None);
        assert_eq!(resolve_str(&manifest, ">= 2.1.2 < 3.0.0").unwrap(), "2.5.0");
        assert_eq!(resolve_str(&manifest, ">=2.1.2 <3.0.0").unwrap(), "2.5.0");
        assert_eq!(resolve_str(&manifest, ">=2.0.0 <2.1.2").unwrap(), "2.0.0");
    }

    #[test]
    fn test_resolved_version_is_max_satisfying() {
        let manifest = make_manifest(
            &["0.1.0", "0.9.9", "1.0.0", "1.2.3", "1.10.0", "2.0.0", "2.0.1"],
            None,
        );
        for range in ["*", "^1.0.0", "~1.2.0", ">=0.5.0 <2.0.0", "1.x", "^0.1.0", ">1.2.3"] {
            let parsed = Range::parse(range).unwrap();
            let picked = resolve(&PackageSpec::new("test-pkg", range).unwrap(), &manifest).unwrap();
            assert!(parsed.satisfies(&picked), "{range} -> {picked}");
            for other in manifest.versions.keys() {
                if parsed.satisfies(other) {
                    assert!(other <= &picked, "{range}: {other} > {picked}");
                }
            }
        }
    }

    #[test]
    fn test_tag_detection() {
        assert_eq!(Range::parse("next").unwrap(), Range::Tag("next".to_string()));
        assert_eq!(Range::parse("beta-2").unwrap(), Range::Tag("beta-2".to_string()));
        assert!(matches!(Range::parse("x").unwrap(), Range::Semver(_)));
        assert!(matches!(Range::parse("^1").unwrap(), Range::Semver(_)));
    }
}
