//! Strongly-typed registry manifests.
//!
//! The registry answers `GET <registry>/<name>` with a loosely-typed JSON
//! document. It is validated once, here, and turned into a
//! [`VersionManifest`]; nothing past this module sees raw JSON.

use super::error::PkgError;
use super::integrity::Integrity;
use super::spec::{unscoped_name, PackageSpec};
use semver::Version;
use serde::Deserialize;
use serde_json::{Map, Value};
use std::collections::BTreeMap;

/// All known versions of one package, as published by a registry.
#[derive(Debug, Clone, PartialEq)]
pub struct VersionManifest {
    pub name: String,
    /// Versions in ascending semver order.
    pub versions: BTreeMap<Version, Descriptor>,
    pub dist_tags: BTreeMap<String, Version>,
}

/// Metadata for one concrete version.
#[derive(Debug, Clone, PartialEq)]
pub struct Descriptor {
    pub name: String,
    pub version: Version,
    pub tarball_url: String,
    pub integrity: Option<Integrity>,
    /// Declared dependencies, in the order the manifest lists them.
    pub dependencies: Vec<PackageSpec>,
    pub optional_dependencies: Vec<PackageSpec>,
    pub peer_dependencies: Vec<PackageSpec>,
    /// Executable name → path inside the package.
    pub bins: BTreeMap<String, String>,
    pub has_install_script: bool,
    pub deprecated: Option<String>,
}

#[derive(Deserialize)]
struct RawManifest {
    name: Option<String>,
    versions: Option<Map<String, Value>>,
    #[serde(rename = "dist-tags", default)]
    dist_tags: Map<String, Value>,
}

#[derive(Deserialize)]
#[serde(rename_all = "camelCase")]
struct RawDescriptor {
    version: Option<String>,
    dist: Option<RawDist>,
    #[serde(default)]
    dependencies: Option<Map<String, Value>>,
    #[serde(default)]
    optional_dependencies: Option<Map<String, Value>>,
    #[serde(default)]
    peer_dependencies: Option<Map<String, Value>>,
    #[serde(default)]
    bin: Option<Value>,
    #[serde(default)]
    has_install_script: bool,
    #[serde(default)]
    deprecated: Option<Value>,
}

#[derive(Deserialize)]
struct RawDist {
    tarball: Option<String>,
    integrity: Option<String>,
    shasum: Option<String>,
}

impl VersionManifest {
    /// Parse and validate a registry response body.
    ///
    /// `requested` is the name the client asked for; it is used when the
    /// document omits `name` and for error messages.
    ///
    /// # Errors
    /// Returns `PKG_MALFORMED_MANIFEST` for invalid JSON, a missing
    /// `versions` object, non-semver version keys, or descriptors without a
    /// tarball URL.
    pub fn from_slice(requested: &str, body: &[u8]) -> Result<Self, PkgError> {
        let value: Value = serde_json::from_slice(body)
            .map_err(|e| PkgError::malformed_manifest(requested, e))?;
        Self::from_value(requested, value)
    }

    /// Validate an already-decoded JSON document.
    ///
    /// # Errors
    /// See [`VersionManifest::from_slice`].
    pub fn from_value(requested: &str, value: Value) -> Result<Self, PkgError> {
        let raw: RawManifest = serde_json::from_value(value)
            .map_err(|e| PkgError::malformed_manifest(requested, e))?;

        let name = raw.name.unwrap_or_else(|| requested.to_string());
        let Some(raw_versions) = raw.versions else {
            return Err(PkgError::malformed_manifest(
                requested,
                "missing 'versions' field",
            ));
        };

        let mut versions = BTreeMap::new();
        for (key, body) in raw_versions {
            let version = Version::parse(&key).map_err(|e| {
                PkgError::malformed_manifest(requested, format!("version key '{key}': {e}"))
            })?;
            let descriptor = parse_descriptor(&name, version.clone(), body)?;
            versions.insert(version, descriptor);
        }

        let mut dist_tags = BTreeMap::new();
        for (tag, target) in raw.dist_tags {
            let Some(target) = target.as_str() else {
                return Err(PkgError::malformed_manifest(
                    requested,
                    format!("dist-tag '{tag}' is not a string"),
                ));
            };
            let version = Version::parse(target).map_err(|e| {
                PkgError::malformed_manifest(requested, format!("dist-tag '{tag}': {e}"))
            })?;
            dist_tags.insert(tag, version);
        }

        Ok(Self {
            name,
            versions,
            dist_tags,
        })
    }

    /// Descriptor for an exact version.
    #[must_use]
    pub fn get(&self, version: &Version) -> Option<&Descriptor> {
        self.versions.get(version)
    }

    /// Version a dist-tag points at.
    ///
    /// When `latest` is not published, falls back to the highest release
    /// version (or the highest pre-release if nothing else exists).
    #[must_use]
    pub fn dist_tag(&self, tag: &str) -> Option<&Version> {
        if let Some(version) = self.dist_tags.get(tag) {
            return Some(version);
        }
        if tag != "latest" {
            return None;
        }
        self.versions
            .keys()
            .rev()
            .find(|v| v.pre.is_empty())
            .or_else(|| self.versions.keys().next_back())
    }
}

fn parse_descriptor(name: &str, version: Version, body: Value) -> Result<Descriptor, PkgError> {
    let raw: RawDescriptor = serde_json::from_value(body)
        .map_err(|e| PkgError::malformed_manifest(name, format!("version {version}: {e}")))?;

    if let Some(declared) = raw.version.as_deref() {
        let matches = Version::parse(declared).is_ok_and(|v| v == version);
        if !matches {
            return Err(PkgError::malformed_manifest(
                name,
                format!("version {version} declares mismatching version '{declared}'"),
            ));
        }
    }

    let dist = raw.dist.ok_or_else(|| {
        PkgError::malformed_manifest(name, format!("version {version} has no 'dist'"))
    })?;
    let tarball_url = dist.tarball.ok_or_else(|| {
        PkgError::malformed_manifest(name, format!("version {version} has no 'dist.tarball'"))
    })?;
    let integrity = Integrity::from_dist(dist.integrity.as_deref(), dist.shasum.as_deref())
        .map_err(|e| PkgError::malformed_manifest(name, format!("version {version}: {}", e.message())))?;

    let context = format!("{name}@{version}");
    Ok(Descriptor {
        name: name.to_string(),
        dependencies: dependency_list(&context, "dependencies", raw.dependencies)?,
        optional_dependencies: dependency_list(
            &context,
            "optionalDependencies",
            raw.optional_dependencies,
        )?,
        peer_dependencies: dependency_list(&context, "peerDependencies", raw.peer_dependencies)?,
        bins: bin_map(&context, name, raw.bin)?,
        has_install_script: raw.has_install_script,
        deprecated: match raw.deprecated {
            Some(Value::String(msg)) if !msg.is_empty() => Some(msg),
            _ => None,
        },
        version,
        tarball_url,
        integrity,
    })
}

fn dependency_list(
    context: &str,
    section: &str,
    deps: Option<Map<String, Value>>,
) -> Result<Vec<PackageSpec>, PkgError> {
    let Some(deps) = deps else {
        return Ok(Vec::new());
    };

    deps.into_iter()
        .map(|(dep, range)| {
            let Value::String(range) = range else {
                return Err(PkgError::malformed_manifest(
                    context,
                    format!("{section}.{dep} must be a string"),
                ));
            };
            PackageSpec::new(dep, range).map_err(|e| {
                PkgError::malformed_manifest(context, format!("{section}: {}", e.message()))
            })
        })
        .collect()
}

fn bin_map(context: &str, name: &str, bin: Option<Value>) -> Result<BTreeMap<String, String>, PkgError> {
    match bin {
        None | Some(Value::Null) => Ok(BTreeMap::new()),
        Some(Value::String(path)) => Ok(BTreeMap::from([(unscoped_name(name).to_string(), path)])),
        Some(Value::Object(entries)) => entries
            .into_iter()
            .map(|(bin, path)| match path {
                Value::String(path) => Ok((bin, path)),
                _ => Err(PkgError::malformed_manifest(
                    context,
                    format!("bin.{bin} must be a string"),
                )),
            })
            .collect(),
        Some(_) => Err(PkgError::malformed_manifest(
            context,
            "'bin' must be a string or an object",
        )),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::pkg::error::codes;
    use serde_json::json;

    fn descriptor(name: &str, version: &str) -> Value {
        json!({
            "name": name,
            "version": version,
            "dist": { "tarball": format!("http://localhost/{name}-{version}.tgz") }
        })
    }

    #[test]
    fn test_parse_minimal_manifest() {
        let doc = json!({
            "name": "foo",
            "versions": { "0.0.2": descriptor("foo", "0.0.2") },
            "dist-tags": { "latest": "0.0.2" }
        });
        let manifest = VersionManifest::from_value("foo", doc).unwrap();
        assert_eq!(manifest.name, "foo");
        let v = Version::parse("0.0.2").unwrap();
        assert_eq!(
            manifest.get(&v).unwrap().tarball_url,
            "http://localhost/foo-0.0.2.tgz"
        );
        assert_eq!(manifest.dist_tag("latest"), Some(&v));
    }

    #[test]
    fn test_missing_versions_is_malformed() {
        let err = VersionManifest::from_value("foo", json!({ "name": "foo" })).unwrap_err();
        assert_eq!(err.code(), codes::PKG_MALFORMED_MANIFEST);
        assert!(err.message().contains("versions"));
    }

    #[test]
    fn test_non_semver_key_is_malformed() {
        let doc = json!({ "versions": { "one-point-oh": descriptor("foo", "1.0.0") } });
        let err = VersionManifest::from_value("foo", doc).unwrap_err();
        assert_eq!(err.code(), codes::PKG_MALFORMED_MANIFEST);
    }

    #[test]
    fn test_invalid_json_is_malformed() {
        let err = VersionManifest::from_slice("foo", b"{not json").unwrap_err();
        assert_eq!(err.code(), codes::PKG_MALFORMED_MANIFEST);
    }

    #[test]
    fn test_missing_tarball_is_malformed() {
        let doc = json!({ "versions": { "1.0.0": { "version": "1.0.0", "dist": {} } } });
        let err = VersionManifest::from_value("foo", doc).unwrap_err();
        assert_eq!(err.code(), codes::PKG_MALFORMED_MANIFEST);
    }

    #[test]
    fn test_dependencies_keep_declared_order() {
        let mut body = descriptor("app", "1.0.0");
        body["dependencies"] = json!({ "zeta": "^1.0.0", "alpha": "~2.0.0", "mid": "*" });
        let manifest =
            VersionManifest::from_value("app", json!({ "versions": { "1.0.0": body } })).unwrap();

        let deps = &manifest.versions.values().next().unwrap().dependencies;
        let names: Vec<&str> = deps.iter().map(|d| d.name.as_str()).collect();
        assert_eq!(names, ["zeta", "alpha", "mid"]);
        assert_eq!(deps[1].range, "~2.0.0");
    }

    #[test]
    fn test_non_string_dependency_is_malformed() {
        let mut body = descriptor("app", "1.0.0");
        body["dependencies"] = json!({ "bad": 1 });
        let err = VersionManifest::from_value("app", json!({ "versions": { "1.0.0": body } }))
            .unwrap_err();
        assert_eq!(err.code(), codes::PKG_MALFORMED_MANIFEST);
    }

    #[test]
    fn test_path_like_dependency_names_are_malformed() {
        for dep in ["..", ".", ".git", "_hidden", "@scope/.."] {
            let mut body = descriptor("app", "1.0.0");
            body["dependencies"] = Value::Object(Map::from_iter([(dep.to_string(), json!("*"))]));
            let err = VersionManifest::from_value("app", json!({ "versions": { "1.0.0": body } }))
                .unwrap_err();
            assert_eq!(err.code(), codes::PKG_MALFORMED_MANIFEST, "{dep}");
        }
    }

    #[test]
    fn test_bin_string_uses_unscoped_name() {
        let mut body = descriptor("@scope/tool", "1.0.0");
        body["bin"] = json!("cli.js");
        let manifest =
            VersionManifest::from_value("@scope/tool", json!({ "versions": { "1.0.0": body } }))
                .unwrap();
        let d = manifest.versions.values().next().unwrap();
        assert_eq!(d.bins.get("tool").map(String::as_str), Some("cli.js"));
    }

    #[test]
    fn test_shasum_becomes_integrity() {
        let mut body = descriptor("foo", "1.0.0");
        body["dist"]["shasum"] = json!("2aae6c35c94fcfb415dbe95f408b9ce91ee846ed");
        let manifest =
            VersionManifest::from_value("foo", json!({ "versions": { "1.0.0": body } })).unwrap();
        let d = manifest.versions.values().next().unwrap();
        assert!(d.integrity.as_ref().unwrap().to_string().starts_with("sha1-"));
    }

    #[test]
    fn test_sha384_integrity_accepted() {
        let sri = Integrity::compute(crate::pkg::integrity::Algorithm::Sha384, b"tgz").to_string();
        let mut body = descriptor("foo", "1.0.0");
        body["dist"]["integrity"] = json!(sri);
        let manifest =
            VersionManifest::from_value("foo", json!({ "versions": { "1.0.0": body } })).unwrap();
        let d = manifest.versions.values().next().unwrap();
        assert_eq!(d.integrity.as_ref().unwrap().to_string(), sri);
    }

    #[test]
    fn test_latest_fallback_ignores_key_order() {
        // Keys deliberately listed highest-first: the fallback must not
        // depend on which key came last.
        let doc = json!({
            "versions": {
                "2.0.0": descriptor("foo", "2.0.0"),
                "3.0.0-beta.1": descriptor("foo", "3.0.0-beta.1"),
                "1.0.0": descriptor("foo", "1.0.0")
            }
        });
        let manifest = VersionManifest::from_value("foo", doc).unwrap();
        assert_eq!(
            manifest.dist_tag("latest"),
            Some(&Version::parse("2.0.0").unwrap())
        );
        assert_eq!(manifest.dist_tag("next"), None);
    }

    #[test]
    fn test_latest_fallback_prerelease_only() {
        let doc = json!({ "versions": { "1.0.0-rc.1": descriptor("foo", "1.0.0-rc.1") } });
        let manifest = VersionManifest::from_value("foo", doc).unwrap();
        assert_eq!(
            manifest.dist_tag("latest"),
            Some(&Version::parse("1.0.0-rc.1").unwrap())
        );
    }
}
