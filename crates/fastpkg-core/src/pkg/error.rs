//! Package manager error types.

use std::fmt;
use std::io;

/// Package manager error codes.
pub mod codes {
    pub const PKG_SPEC_INVALID: &str = "PKG_SPEC_INVALID";
    pub const PKG_REGISTRY_UNAVAILABLE: &str = "PKG_REGISTRY_UNAVAILABLE";
    pub const PKG_REGISTRY_ERROR: &str = "PKG_REGISTRY_ERROR";
    pub const PKG_NOT_FOUND: &str = "PKG_NOT_FOUND";
    pub const PKG_MALFORMED_MANIFEST: &str = "PKG_MALFORMED_MANIFEST";
    pub const PKG_NO_MATCHING_VERSION: &str = "PKG_NO_MATCHING_VERSION";
    pub const PKG_UNSATISFIABLE_CONSTRAINT: &str = "PKG_UNSATISFIABLE_CONSTRAINT";
    pub const PKG_INTEGRITY_MISMATCH: &str = "PKG_INTEGRITY_MISMATCH";
    pub const PKG_DOWNLOAD_FAILED: &str = "PKG_DOWNLOAD_FAILED";
    pub const PKG_EXTRACT_FAILED: &str = "PKG_EXTRACT_FAILED";
    pub const PKG_FILESYSTEM_ERROR: &str = "PKG_FILESYSTEM_ERROR";
    pub const PKG_CANCELLED: &str = "PKG_CANCELLED";

    // package.json reading
    pub const PKG_PACKAGE_JSON_NOT_FOUND: &str = "PKG_PACKAGE_JSON_NOT_FOUND";
    pub const PKG_PACKAGE_JSON_INVALID: &str = "PKG_PACKAGE_JSON_INVALID";
    pub const PKG_DEP_RANGE_INVALID: &str = "PKG_DEP_RANGE_INVALID";
}

/// Package manager error.
///
/// Cheap to clone so one failure can be handed to every caller waiting on a
/// shared in-flight download.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PkgError {
    code: &'static str,
    message: String,
}

impl PkgError {
    /// Create a new error with the given code and message.
    #[must_use]
    pub fn new(code: &'static str, message: impl Into<String>) -> Self {
        Self {
            code,
            message: message.into(),
        }
    }

    /// Get the error code.
    #[must_use]
    pub fn code(&self) -> &'static str {
        self.code
    }

    /// Get the error message.
    #[must_use]
    pub fn message(&self) -> &str {
        &self.message
    }

    /// Prefix the message with the package that triggered the error.
    #[must_use]
    pub fn with_context(mut self, context: impl fmt::Display) -> Self {
        self.message = format!("{context}: {}", self.message);
        self
    }

    /// Whether the Registry Client should retry the request that produced this error.
    #[must_use]
    pub fn is_retryable(&self) -> bool {
        self.code == codes::PKG_REGISTRY_UNAVAILABLE
    }

    /// Whether this error must abort every sibling fetch of the install.
    #[must_use]
    pub fn is_graph_fatal(&self) -> bool {
        matches!(
            self.code,
            codes::PKG_UNSATISFIABLE_CONSTRAINT | codes::PKG_INTEGRITY_MISMATCH
        )
    }

    /// Whether this error is the by-product of another failure's cancellation.
    #[must_use]
    pub fn is_cancelled(&self) -> bool {
        self.code == codes::PKG_CANCELLED
    }

    /// Create a spec invalid error.
    pub fn spec_invalid(msg: impl Into<String>) -> Self {
        Self::new(codes::PKG_SPEC_INVALID, msg)
    }

    /// Create a registry unavailable error (connection, timeout, 5xx).
    pub fn registry_unavailable(msg: impl Into<String>) -> Self {
        Self::new(codes::PKG_REGISTRY_UNAVAILABLE, msg)
    }

    /// Create a registry error for unexpected, non-retryable responses.
    pub fn registry(msg: impl Into<String>) -> Self {
        Self::new(codes::PKG_REGISTRY_ERROR, msg)
    }

    /// Create a package not found error.
    #[must_use]
    pub fn not_found(name: &str) -> Self {
        Self::new(codes::PKG_NOT_FOUND, format!("Package not found: {name}"))
    }

    /// Create a malformed manifest error.
    #[must_use]
    pub fn malformed_manifest(name: &str, reason: impl fmt::Display) -> Self {
        Self::new(
            codes::PKG_MALFORMED_MANIFEST,
            format!("Malformed manifest for {name}: {reason}"),
        )
    }

    /// Create a no matching version error.
    #[must_use]
    pub fn no_matching_version(name: &str, range: &str) -> Self {
        Self::new(
            codes::PKG_NO_MATCHING_VERSION,
            format!("No version of {name} satisfies range: {range}"),
        )
    }

    /// Create an unsatisfiable constraint error.
    #[must_use]
    pub fn unsatisfiable(name: &str, ranges: &[String]) -> Self {
        Self::new(
            codes::PKG_UNSATISFIABLE_CONSTRAINT,
            format!(
                "No published version of {name} satisfies the ranges required in the graph: {}",
                ranges.join(", ")
            ),
        )
    }

    /// Create an integrity mismatch error.
    #[must_use]
    pub fn integrity_mismatch(package: &str, expected: &str, actual: &str) -> Self {
        Self::new(
            codes::PKG_INTEGRITY_MISMATCH,
            format!("Integrity check failed for {package}: expected {expected}, got {actual}"),
        )
    }

    /// Create a download failed error.
    pub fn download_failed(msg: impl Into<String>) -> Self {
        Self::new(codes::PKG_DOWNLOAD_FAILED, msg)
    }

    /// Create an extraction failed error.
    pub fn extract_failed(msg: impl Into<String>) -> Self {
        Self::new(codes::PKG_EXTRACT_FAILED, msg)
    }

    /// Create a filesystem error.
    pub fn filesystem(msg: impl Into<String>) -> Self {
        Self::new(codes::PKG_FILESYSTEM_ERROR, msg)
    }

    /// Create a cancellation error.
    #[must_use]
    pub fn cancelled(what: &str) -> Self {
        Self::new(codes::PKG_CANCELLED, format!("Cancelled: {what}"))
    }

    /// Create a package.json not found error.
    #[must_use]
    pub fn package_json_not_found(path: &std::path::Path) -> Self {
        Self::new(
            codes::PKG_PACKAGE_JSON_NOT_FOUND,
            format!("package.json not found: {}", path.display()),
        )
    }

    /// Create a package.json invalid error.
    pub fn package_json_invalid(msg: impl Into<String>) -> Self {
        Self::new(codes::PKG_PACKAGE_JSON_INVALID, msg)
    }
}

impl fmt::Display for PkgError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}: {}", self.code, self.message)
    }
}

impl std::error::Error for PkgError {}

impl From<io::Error> for PkgError {
    fn from(e: io::Error) -> Self {
        Self::new(codes::PKG_FILESYSTEM_ERROR, e.to_string())
    }
}

impl From<reqwest::Error> for PkgError {
    fn from(e: reqwest::Error) -> Self {
        if e.is_timeout() {
            Self::registry_unavailable(format!("Request timed out: {e}"))
        } else if e.is_connect() {
            Self::registry_unavailable(format!("Connection failed: {e}"))
        } else if e.is_decode() || e.is_body() {
            Self::registry_unavailable(format!("Failed to read response body: {e}"))
        } else {
            Self::registry(e.to_string())
        }
    }
}

impl From<serde_json::Error> for PkgError {
    fn from(e: serde_json::Error) -> Self {
        Self::new(codes::PKG_MALFORMED_MANIFEST, format!("Invalid JSON: {e}"))
    }
}
