use crate::app_log;
use crate::logger::LogLevel;
use std::path::{Path, PathBuf};

/// Ordered collection of files produced by a stage that are not part of its
/// result.
///
/// Paths are removed by `cleanup()` once the stage has fully succeeded. With
/// caching enabled the cache owns their lifetime and `cleanup()` keeps them.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct IntermediateArtifactSet {
    paths: Vec<PathBuf>,
}

/// Outcome of a cleanup pass
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct CleanupSummary {
    pub deleted: usize,
    pub missing: usize,
    pub failed: usize,
    pub kept: usize,
}

impl IntermediateArtifactSet {
    pub fn new() -> Self {
        Self::default()
    }

    /// Record an intermediate path; duplicates are ignored
    pub fn push(&mut self, path: impl Into<PathBuf>) {
        let path = path.into();
        if !self.paths.contains(&path) {
            self.paths.push(path);
        }
    }

    pub fn extend(&mut self, other: IntermediateArtifactSet) {
        for path in other.paths {
            self.push(path);
        }
    }

    pub fn paths(&self) -> &[PathBuf] {
        &self.paths
    }

    pub fn len(&self) -> usize {
        self.paths.len()
    }

    pub fn is_empty(&self) -> bool {
        self.paths.is_empty()
    }

    /// Delete every tracked file unless `caching` is set, then forget them.
    ///
    /// Files listed in `keep` are never deleted, even if tracked.
    pub fn cleanup(&mut self, caching: bool, keep: &[&Path], source: &str) -> CleanupSummary {
        let mut summary = CleanupSummary::default();
        let paths = std::mem::take(&mut self.paths);

        if caching {
            summary.kept = paths.len();
            app_log!(
                LogLevel::Debug,
                source,
                "Caching enabled, keeping {} intermediate file(s)",
                paths.len()
            );
            return summary;
        }

        for path in &paths {
            if keep.iter().any(|k| *k == path.as_path()) {
                summary.kept += 1;
                continue;
            }
            if !path.exists() {
                summary.missing += 1;
                continue;
            }
            match std::fs::remove_file(path) {
                Ok(_) => summary.deleted += 1,
                Err(e) => {
                    app_log!(
                        LogLevel::Warn,
                        source,
                        "Failed to delete intermediate {}: {}",
                        path.display(),
                        e
                    );
                    summary.failed += 1;
                }
            }
        }

        app_log!(
            LogLevel::Debug,
            source,
            "Cleanup complete: {} deleted, {} missing, {} failed",
            summary.deleted,
            summary.missing,
            summary.failed
        );
        summary
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::fs;
    use tempfile::TempDir;

    fn touch(dir: &TempDir, name: &str) -> PathBuf {
        let path = dir.path().join(name);
        fs::write(&path, b"x").unwrap();
        path
    }

    #[test]
    fn test_push_preserves_order_and_dedups() {
        let mut set = IntermediateArtifactSet::new();
        set.push("/o/b.nii");
        set.push("/o/a.nii");
        set.push("/o/b.nii");
        assert_eq!(
            set.paths(),
            &[PathBuf::from("/o/b.nii"), PathBuf::from("/o/a.nii")]
        );
    }

    #[test]
    fn test_cleanup_deletes_without_caching() {
        let dir = TempDir::new().unwrap();
        let a = touch(&dir, "a.nii");
        let b = touch(&dir, "b.nii");
        let mut set = IntermediateArtifactSet::new();
        set.push(&a);
        set.push(&b);
        set.push(dir.path().join("never_written.nii"));

        let summary = set.cleanup(false, &[], "test");
        assert_eq!(summary.deleted, 2);
        assert_eq!(summary.missing, 1);
        assert!(!a.exists());
        assert!(!b.exists());
        assert!(set.is_empty());
    }

    #[test]
    fn test_cleanup_keeps_with_caching() {
        let dir = TempDir::new().unwrap();
        let a = touch(&dir, "a.nii");
        let mut set = IntermediateArtifactSet::new();
        set.push(&a);

        let summary = set.cleanup(true, &[], "test");
        assert_eq!(summary.kept, 1);
        assert!(a.exists());
    }

    #[test]
    fn test_cleanup_respects_keep_list() {
        let dir = TempDir::new().unwrap();
        let a = touch(&dir, "a.nii");
        let b = touch(&dir, "b.nii");
        let mut set = IntermediateArtifactSet::new();
        set.push(&a);
        set.push(&b);

        set.cleanup(false, &[b.as_path()], "test");
        assert!(!a.exists());
        assert!(b.exists());
    }

    #[test]
    fn test_extend_skips_duplicates() {
        let mut first = IntermediateArtifactSet::new();
        first.push("/o/a.nii");
        let mut second = IntermediateArtifactSet::new();
        second.push("/o/a.nii");
        second.push("/o/c.nii");
        first.extend(second);
        assert_eq!(
            first.paths(),
            &[PathBuf::from("/o/a.nii"), PathBuf::from("/o/c.nii")]
        );
    }
}
