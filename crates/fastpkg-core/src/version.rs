/// The current version, read from Cargo.toml at compile time.
pub const VERSION: &str = env!("CARGO_PKG_VERSION");

/// Schema version for the on-disk cache layout.
/// Bump this when changing formats that would break compatibility.
pub const SCHEMA_VERSION: u32 = 1;

/// User agent sent with every registry request.
pub const USER_AGENT: &str = concat!("fastpkg/", env!("CARGO_PKG_VERSION"));
