//! Deterministic artifact naming
//!
//! Every generated file name is derived from the path it originates from, so
//! an artifact can always be traced back to its input. Nothing here touches
//! the filesystem.

use crate::error::{CestError, CestResult};
use std::path::{Path, PathBuf};

/// Extensions made of several dot-separated parts
const COMPOUND_EXTENSIONS: &[&str] = &[".nii.gz", ".aff12.1D", ".niml.dset", ".tar.gz"];

/// Split a file name into `(stem, extension)`; the extension keeps its dot.
pub fn split_extension(file_name: &str) -> (&str, &str) {
    for ext in COMPOUND_EXTENSIONS {
        if file_name.len() > ext.len() && file_name.ends_with(ext) {
            let stem = &file_name[..file_name.len() - ext.len()];
            return (stem, &file_name[stem.len()..]);
        }
    }
    match file_name.rfind('.') {
        Some(0) | None => (file_name, ""),
        Some(idx) => (&file_name[..idx], &file_name[idx..]),
    }
}

/// Derive a new artifact path from `base`.
///
/// - `suffix` is appended to the stem
/// - `new_extension` replaces the extension (`Some("")` drops it, `None` keeps it)
/// - `directory` replaces the parent directory
///
/// # Errors
/// `CestError::InvalidPath` when `base` has no usable file name.
pub fn derive(
    base: &Path,
    suffix: Option<&str>,
    new_extension: Option<&str>,
    directory: Option<&Path>,
) -> CestResult<PathBuf> {
    let file_name = base
        .file_name()
        .and_then(|name| name.to_str())
        .filter(|name| !name.is_empty())
        .ok_or_else(|| CestError::InvalidPath(format!("no file name in {:?}", base)))?;

    let (stem, ext) = split_extension(file_name);
    let ext = match new_extension {
        Some("") => String::new(),
        Some(e) if e.starts_with('.') => e.to_string(),
        Some(e) => format!(".{}", e),
        None => ext.to_string(),
    };

    let name = format!("{}{}{}", stem, suffix.unwrap_or(""), ext);
    let parent = match directory {
        Some(dir) => dir.to_path_buf(),
        None => base.parent().map(Path::to_path_buf).unwrap_or_default(),
    };
    Ok(parent.join(name))
}

/// Shorthand for `derive(base, Some(suffix), None, None)`
pub fn with_suffix(base: &Path, suffix: &str) -> CestResult<PathBuf> {
    derive(base, Some(suffix), None, None)
}

/// Shorthand for moving a file name into `directory` unchanged
pub fn in_directory(base: &Path, directory: &Path) -> CestResult<PathBuf> {
    derive(base, None, None, Some(directory))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_split_simple_and_compound() {
        assert_eq!(split_extension("anat.nii"), ("anat", ".nii"));
        assert_eq!(split_extension("anat.nii.gz"), ("anat", ".nii.gz"));
        assert_eq!(split_extension("m.aff12.1D"), ("m", ".aff12.1D"));
        assert_eq!(split_extension("README"), ("README", ""));
        assert_eq!(split_extension(".hidden"), (".hidden", ""));
    }

    #[test]
    fn test_derive_suffix_keeps_extension() {
        let path = derive(Path::new("/data/anat.nii.gz"), Some("_unifized"), None, None).unwrap();
        assert_eq!(path, PathBuf::from("/data/anat_unifized.nii.gz"));
    }

    #[test]
    fn test_derive_new_extension_and_directory() {
        let path = derive(
            Path::new("/data/anat.nii.gz"),
            Some("_warp"),
            Some(".mat"),
            Some(Path::new("/out")),
        )
        .unwrap();
        assert_eq!(path, PathBuf::from("/out/anat_warp.mat"));

        let bare = derive(Path::new("/data/anat.nii"), Some("_x"), Some(""), None).unwrap();
        assert_eq!(bare, PathBuf::from("/data/anat_x"));

        let dotless = derive(Path::new("a.nii"), None, Some("1D"), None).unwrap();
        assert_eq!(dotless, PathBuf::from("a.1D"));
    }

    #[test]
    fn test_derive_is_deterministic() {
        let base = Path::new("/data/cest.nii");
        let first = derive(base, Some("_sl3"), None, Some(Path::new("/out/per_slice"))).unwrap();
        let second = derive(base, Some("_sl3"), None, Some(Path::new("/out/per_slice"))).unwrap();
        assert_eq!(first, second);
    }

    #[test]
    fn test_derive_never_touches_disk() {
        // Neither the base nor the directory exist
        let path = derive(
            Path::new("/nonexistent/x/anat.nii"),
            Some("_a"),
            None,
            Some(Path::new("/also/nonexistent")),
        )
        .unwrap();
        assert_eq!(path, PathBuf::from("/also/nonexistent/anat_a.nii"));
        assert!(!path.exists());
    }

    #[test]
    fn test_derive_rejects_malformed_base() {
        assert!(matches!(
            derive(Path::new(""), Some("_a"), None, None),
            Err(CestError::InvalidPath(_))
        ));
        assert!(derive(Path::new("/"), None, None, None).is_err());
        assert!(derive(Path::new("data/.."), None, None, None).is_err());
    }

    #[test]
    fn test_shorthands() {
        assert_eq!(
            with_suffix(Path::new("/d/a.nii"), "_b").unwrap(),
            PathBuf::from("/d/a_b.nii")
        );
        assert_eq!(
            in_directory(Path::new("/d/a.nii"), Path::new("/o")).unwrap(),
            PathBuf::from("/o/a.nii")
        );
    }
}
