//! Shared test utilities for liveimage-mount tests.

use std::fs;
use std::path::{Path, PathBuf};
use tempfile::TempDir;

use liveimage_mount::mount::MountRequest;

/// Test environment with a mock LiveOS source tree, a destination
/// mount point, and an isolated tmpdir for session-private paths.
pub struct TestEnv {
    /// Temporary directory (kept alive for lifetime of TestEnv)
    pub _temp_dir: TempDir,
    /// Source tree handed to the mount path.
    pub source: PathBuf,
    /// Destination mount point directory.
    pub dest: PathBuf,
    /// Parent for session-private temp dirs and overlay files.
    pub tmpdir: PathBuf,
}

impl TestEnv {
    /// Create a new test environment with empty directories.
    pub fn new() -> Self {
        let temp_dir = TempDir::new().expect("Failed to create temp dir");
        let base = temp_dir.path();

        let source = base.join("source");
        let dest = base.join("dest");
        let tmpdir = base.join("tmp");

        fs::create_dir_all(&source).expect("Failed to create source dir");
        fs::create_dir_all(&dest).expect("Failed to create dest dir");
        fs::create_dir_all(&tmpdir).expect("Failed to create tmpdir");

        Self {
            _temp_dir: temp_dir,
            source,
            dest,
            tmpdir,
        }
    }

    /// The conventional LiveOS directory inside the source tree.
    pub fn liveos_dir(&self) -> PathBuf {
        self.source.join("LiveOS")
    }

    /// A mount request over this environment with small overlay sizes.
    pub fn mount_request(&self) -> MountRequest {
        MountRequest {
            source: self.source.clone(),
            dest: self.dest.clone(),
            read_only: false,
            mount_hacks: false,
            overlay: None,
            dnf_cache: None,
            tmpdir: self.tmpdir.clone(),
            ovl_size_mib: 64,
            home_ovl_size_mib: 64,
        }
    }
}

/// Create a LiveOS tree holding a raw root image (no squashfs), the
/// layout that needs no mounting to discover. Returns the image path.
pub fn create_raw_live_tree(source: &Path) -> PathBuf {
    let liveos = source.join("LiveOS");
    fs::create_dir_all(&liveos).expect("Failed to create LiveOS dir");
    let image = liveos.join("rootfs.img");
    fs::write(&image, b"not a real filesystem").expect("Failed to create rootfs.img");
    image
}

/// Write a bootloader config that points `rd.live.dir=` at `dir`.
pub fn write_bootloader_config(source: &Path, config: &str, dir: &str) {
    let path = source.join(config);
    fs::create_dir_all(path.parent().unwrap()).expect("Failed to create config dir");
    fs::write(
        &path,
        format!(
            "menuentry 'Start' {{\n  linux /images/vmlinuz rd.live.image rd.live.dir={dir} quiet\n}}\n"
        ),
    )
    .expect("Failed to write bootloader config");
}

/// Entries under `tmpdir` carrying the tool's private temp prefix.
/// An empty result after teardown means no residue was left behind.
pub fn leftover_private_temps(tmpdir: &Path) -> Vec<PathBuf> {
    let Ok(entries) = fs::read_dir(tmpdir) else {
        return Vec::new();
    };
    entries
        .filter_map(|entry| entry.ok())
        .map(|entry| entry.path())
        .filter(|path| liveimage_mount::temp::is_private_temp(path))
        .collect()
}

/// Assert that a file exists.
pub fn assert_file_exists(path: &Path) {
    assert!(path.exists(), "Expected file to exist: {}", path.display());
}

/// Assert that a directory exists.
pub fn assert_dir_exists(path: &Path) {
    assert!(
        path.is_dir(),
        "Expected directory to exist: {}",
        path.display()
    );
}
