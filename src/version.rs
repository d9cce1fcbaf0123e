//! Crate version string.

/// The package version, stamped into `@PG` VN fields and `--version`.
pub const VERSION: &str = env!("CARGO_PKG_VERSION");
