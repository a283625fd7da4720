//! Package.json dependency extraction.
//!
//! Reads the root dependency requests of a project.

use super::error::{codes, PkgError};
use super::graph::DepKind;
use super::spec::PackageSpec;
use serde_json::{Map, Value};
use std::fs;
use std::path::Path;

/// Root requests extracted from package.json.
#[derive(Debug, Clone, Default)]
pub struct PackageDeps {
    /// Project name, if declared.
    pub name: Option<String>,
    /// Requests in declared order: dependencies, devDependencies, then optionalDependencies.
    pub requests: Vec<(PackageSpec, DepKind)>,
    /// Entries that could not be used.
    pub errors: Vec<PkgDepError>,
}

impl PackageDeps {
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.requests.is_empty()
    }
}

/// Error encountered while extracting a dependency.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PkgDepError {
    /// Package name or section name.
    pub name: String,
    pub code: &'static str,
    pub message: String,
}

impl PkgDepError {
    #[must_use]
    pub fn new(name: impl Into<String>, code: &'static str, message: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            code,
            message: message.into(),
        }
    }

    /// Create an invalid range error.
    #[must_use]
    pub fn invalid_range(name: &str, actual_type: &str) -> Self {
        Self::new(
            name,
            codes::PKG_DEP_RANGE_INVALID,
            format!("expected string, got {actual_type}"),
        )
    }

    /// Create an invalid section error.
    #[must_use]
    pub fn invalid_section(section: &str, actual_type: &str) -> Self {
        Self::new(
            section,
            codes::PKG_PACKAGE_JSON_INVALID,
            format!("'{section}' must be an object, got {actual_type}"),
        )
    }
}

/// Read root dependency requests from a package.json file.
///
/// An entry in `optionalDependencies` replaces a `dependencies` entry of the
/// same name, as npm does.
///
/// # Errors
/// Returns `PkgError` if the file cannot be read or parsed as a JSON object.
pub fn read_package_deps(
    package_json_path: &Path,
    include_dev: bool,
    include_optional: bool,
) -> Result<PackageDeps, PkgError> {
    if !package_json_path.exists() {
        return Err(PkgError::package_json_not_found(package_json_path));
    }

    let content = fs::read_to_string(package_json_path)
        .map_err(|e| PkgError::package_json_invalid(format!("Failed to read: {e}")))?;

    let pkg_json: Value = serde_json::from_str(&content)
        .map_err(|e| PkgError::package_json_invalid(format!("Invalid JSON: {e}")))?;

    let root = pkg_json
        .as_object()
        .ok_or_else(|| PkgError::package_json_invalid("package.json must be a JSON object"))?;

    let mut result = PackageDeps {
        name: root.get("name").and_then(Value::as_str).map(String::from),
        ..PackageDeps::default()
    };

    let optional = if include_optional {
        extract_section(root, "optionalDependencies", &mut result.errors)
    } else {
        Vec::new()
    };
    let overridden = |spec: &PackageSpec| optional.iter().any(|o| o.name == spec.name);

    let mut sections = vec![("dependencies", DepKind::Prod)];
    if include_dev {
        sections.push(("devDependencies", DepKind::Prod));
    }

    for (section, kind) in sections {
        for spec in extract_section(root, section, &mut result.errors) {
            let duplicate = result.requests.iter().any(|(s, _)| s.name == spec.name);
            if !duplicate && !overridden(&spec) {
                result.requests.push((spec, kind));
            }
        }
    }
    for spec in &optional {
        result.requests.push((spec.clone(), DepKind::Optional));
    }

    Ok(result)
}

/// Extract the specs of one section, in declared order.
fn extract_section(
    root: &Map<String, Value>,
    section: &str,
    errors: &mut Vec<PkgDepError>,
) -> Vec<PackageSpec> {
    let Some(section_value) = root.get(section) else {
        return Vec::new();
    };

    let Some(section_obj) = section_value.as_object() else {
        errors.push(PkgDepError::invalid_section(
            section,
            json_type_name(section_value),
        ));
        return Vec::new();
    };

    let mut specs = Vec::with_capacity(section_obj.len());
    for (name, range_value) in section_obj {
        let Some(range) = range_value.as_str() else {
            errors.push(PkgDepError::invalid_range(
                name,
                json_type_name(range_value),
            ));
            continue;
        };
        match PackageSpec::new(name.as_str(), range) {
            Ok(spec) => specs.push(spec),
            Err(e) => errors.push(PkgDepError::new(name.as_str(), e.code(), e.message())),
        }
    }
    specs
}

/// Get a human-readable type name for a JSON value.
fn json_type_name(value: &Value) -> &'static str {
    match value {
        Value::Null => "null",
        Value::Bool(_) => "boolean",
        Value::Number(_) => "number",
        Value::String(_) => "string",
        Value::Array(_) => "array",
        Value::Object(_) => "object",
    }
}
