//! Temporary mount points and overlay files.
//!
//! Everything this tool creates under the configured tmpdir carries the
//! `liveos-` name prefix. That prefix is the only marker the unmount path
//! has for telling tool-owned temporary mounts apart from user paths, so
//! creation and recognition live together here.

use anyhow::{Context, Result};
use std::fs;
use std::path::{Path, PathBuf};

/// Name prefix for every temporary path this tool creates.
pub const TEMP_PREFIX: &str = "liveos-";

/// Create a temporary directory under `tmpdir` named `liveos-<purpose>.XXXX`.
///
/// The directory is kept past process exit: `--persist` sessions leave it
/// behind for a later unmount invocation to find and remove.
pub fn make_temp_dir(tmpdir: &Path, purpose: &str) -> Result<PathBuf> {
    fs::create_dir_all(tmpdir)
        .with_context(|| format!("Failed to create tmpdir {}", tmpdir.display()))?;

    let dir = tempfile::Builder::new()
        .prefix(&format!("{TEMP_PREFIX}{purpose}."))
        .tempdir_in(tmpdir)
        .with_context(|| format!("Failed to create temp directory in {}", tmpdir.display()))?;

    Ok(dir.keep())
}

/// Create a sparse temporary file of `size_mib` MiB, named
/// `liveos-<purpose>.XXXX`, for use as a snapshot overlay.
pub fn make_sparse_temp_file(tmpdir: &Path, purpose: &str, size_mib: u64) -> Result<PathBuf> {
    fs::create_dir_all(tmpdir)
        .with_context(|| format!("Failed to create tmpdir {}", tmpdir.display()))?;

    let file = tempfile::Builder::new()
        .prefix(&format!("{TEMP_PREFIX}{purpose}."))
        .tempfile_in(tmpdir)
        .with_context(|| format!("Failed to create temp file in {}", tmpdir.display()))?;

    let (handle, path) = file
        .keep()
        .context("Failed to persist temp overlay file")?;
    handle
        .set_len(size_mib * 1024 * 1024)
        .with_context(|| format!("Failed to extend {} to {} MiB", path.display(), size_mib))?;

    Ok(path)
}

/// Whether a path was created by this tool's temp naming convention.
pub fn is_private_temp(path: &Path) -> bool {
    path.file_name()
        .and_then(|n| n.to_str())
        .map(|n| n.starts_with(TEMP_PREFIX))
        .unwrap_or(false)
}

/// Remove a temporary directory tree. Idempotent.
pub fn remove_temp_dir(path: &Path) {
    let _ = fs::remove_dir_all(path);
}

/// Remove a temporary file. Idempotent.
pub fn remove_temp_file(path: &Path) {
    let _ = fs::remove_file(path);
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    #[test]
    fn test_temp_dir_uses_prefix() {
        let base = TempDir::new().unwrap();
        let dir = make_temp_dir(base.path(), "mnt").unwrap();

        assert!(dir.is_dir());
        assert!(is_private_temp(&dir));
        assert!(dir
            .file_name()
            .unwrap()
            .to_str()
            .unwrap()
            .starts_with("liveos-mnt."));

        remove_temp_dir(&dir);
        assert!(!dir.exists());
    }

    #[test]
    fn test_sparse_file_has_requested_size() {
        let base = TempDir::new().unwrap();
        let file = make_sparse_temp_file(base.path(), "ovl", 4).unwrap();

        let meta = fs::metadata(&file).unwrap();
        assert_eq!(meta.len(), 4 * 1024 * 1024);
        assert!(is_private_temp(&file));

        remove_temp_file(&file);
        assert!(!file.exists());
    }

    #[test]
    fn test_foreign_paths_are_not_private() {
        assert!(!is_private_temp(Path::new("/mnt/usb")));
        assert!(!is_private_temp(Path::new("/var/tmp/other-tool.x1")));
        assert!(is_private_temp(Path::new("/var/tmp/liveos-mnt.x1")));
    }

    #[test]
    fn test_remove_is_idempotent() {
        let base = TempDir::new().unwrap();
        let dir = make_temp_dir(base.path(), "mnt").unwrap();

        remove_temp_dir(&dir);
        remove_temp_dir(&dir);
        assert!(!dir.exists());
    }
}
