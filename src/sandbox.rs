//! Path sandbox seam (§6.4): every host filesystem primitive resolves a
//! requested path through here first. No filesystem access happens in
//! this crate; a host embedding this VM supplies the real policy.

use std::path::{Path, PathBuf};

pub trait PathSandbox {
    /// Resolves `requested` for a read, returning the canonical path to
    /// actually open or `None` if the sandbox denies access.
    fn resolve_read(&self, requested: &Path) -> Option<PathBuf>;

    /// Resolves `requested` for a write/create, returning the canonical
    /// path or `None` if denied.
    fn resolve_write(&self, requested: &Path) -> Option<PathBuf>;
}

/// A sandbox that denies everything — the safe default for an embedder
/// that hasn't configured filesystem access at all.
pub struct DenyAll;

impl PathSandbox for DenyAll {
    fn resolve_read(&self, _requested: &Path) -> Option<PathBuf> {
        None
    }

    fn resolve_write(&self, _requested: &Path) -> Option<PathBuf> {
        None
    }
}

/// Confines resolution to canonical descendants of a single root
/// directory — the common case for an embedder that wants "this block
/// may touch files under `root/`, nothing else."
pub struct RootConfined {
    pub root: PathBuf,
}

impl RootConfined {
    fn resolve(&self, requested: &Path) -> Option<PathBuf> {
        let joined = self.root.join(requested);
        let canonical = joined.canonicalize().ok()?;
        if canonical.starts_with(&self.root) {
            Some(canonical)
        } else {
            None
        }
    }
}

impl PathSandbox for RootConfined {
    fn resolve_read(&self, requested: &Path) -> Option<PathBuf> {
        self.resolve(requested)
    }

    fn resolve_write(&self, requested: &Path) -> Option<PathBuf> {
        self.resolve(requested)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn deny_all_denies_everything() {
        let sandbox = DenyAll;
        assert!(sandbox.resolve_read(Path::new("/etc/passwd")).is_none());
        assert!(sandbox.resolve_write(Path::new("anything")).is_none());
    }

    #[test]
    fn root_confined_rejects_nonexistent_path() {
        let sandbox = RootConfined { root: std::env::temp_dir() };
        assert!(sandbox.resolve_read(Path::new("does-not-exist-12345")).is_none());
    }

    #[test]
    fn root_confined_allows_descendant() {
        let root = std::env::temp_dir();
        let sandbox = RootConfined { root: root.clone() };
        assert_eq!(sandbox.resolve_read(Path::new(".")).unwrap(), root.canonicalize().unwrap());
    }
}
