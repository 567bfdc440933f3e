/// Crate version from Cargo.toml
pub const VERSION: &str = env!("CARGO_PKG_VERSION");

/// Git commit SHA (short)
pub const GIT_SHA: &str = env!("VERGEN_GIT_SHA");

pub const GIT_COMMIT_TIMESTAMP: &str = env!("VERGEN_GIT_COMMIT_TIMESTAMP");

pub const GIT_BRANCH: &str = env!("VERGEN_GIT_BRANCH");

/// Whether the working tree had uncommitted changes
pub const GIT_DIRTY: &str = env!("VERGEN_GIT_DIRTY");

pub const RUSTC_VERSION: &str = env!("VERGEN_RUSTC_SEMVER");

pub const BUILD_TIMESTAMP: &str = env!("VERGEN_BUILD_TIMESTAMP");

pub const TARGET: &str = env!("VERGEN_CARGO_TARGET_TRIPLE");

/// `<version> (<git_sha>[ dirty])`
pub fn full_version() -> String {
    let dirty = if GIT_DIRTY == "true" { " dirty" } else { "" };
    format!("{VERSION} ({GIT_SHA}{dirty})")
}

/// Multi-line build report printed by `kubecmdb-server version`.
pub fn build_info() -> String {
    format!(
        "kubecmdb-server {VERSION}\n\
         commit: {GIT_SHA} ({GIT_COMMIT_TIMESTAMP})\n\
         branch: {GIT_BRANCH}\n\
         built:  {BUILD_TIMESTAMP}\n\
         rustc:  {RUSTC_VERSION}\n\
         target: {TARGET}"
    )
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_full_version_starts_with_crate_version() {
        assert!(full_version().starts_with(VERSION));
        assert!(build_info().contains(GIT_SHA));
    }
}
