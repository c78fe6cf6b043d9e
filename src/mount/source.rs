//! Source classification and the working mount.
//!
//! The working mount is the directory tree the LiveOS images are read
//! from: the source itself for directories, an existing mount for
//! already-mounted partitions, or a fresh loop/device mount for ISO
//! files and unmounted block devices.

use anyhow::Result;
use std::fs;
use std::os::unix::fs::FileTypeExt;
use std::path::{Path, PathBuf};

use crate::error::LiveMountError;
use crate::introspect::{blockdev, mounts};
use crate::ledger::{Ledger, MountRecord};
use crate::temp;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SourceKind {
    BlockDevice,
    IsoFile,
    Directory,
}

/// The user-supplied origin, resolved and classified.
#[derive(Debug, Clone)]
pub struct LiveSource {
    /// Real path after symlink resolution.
    pub path: PathBuf,
    pub kind: SourceKind,
}

/// Resolve and classify a source path. Fails fast on anything that is
/// not a block device, regular file, or directory.
pub fn resolve(path: &Path) -> Result<LiveSource> {
    let invalid = |reason: &str| LiveMountError::InvalidSource {
        path: path.to_path_buf(),
        reason: reason.to_string(),
    };

    let real = path
        .canonicalize()
        .map_err(|e| invalid(&format!("cannot resolve path ({e})")))?;
    let meta = fs::metadata(&real)
        .map_err(|e| invalid(&format!("cannot stat ({e})")))?;

    let kind = if meta.file_type().is_block_device() {
        SourceKind::BlockDevice
    } else if meta.is_dir() {
        SourceKind::Directory
    } else if meta.is_file() {
        SourceKind::IsoFile
    } else {
        return Err(invalid("not a block device, image file, or directory").into());
    };

    Ok(LiveSource { path: real, kind })
}

/// The established working mount for a session.
#[derive(Debug, Clone)]
pub struct WorkingMount {
    /// Directory holding the LiveOS tree.
    pub path: PathBuf,
    /// Block device behind it, when one exists (used for the
    /// `livedev` symlink).
    pub device: Option<PathBuf>,
}

/// Mount (or reuse) the source so its LiveOS tree is reachable,
/// recording anything created in the ledger.
pub fn establish_working_mount(
    source: &LiveSource,
    read_only: bool,
    tmpdir: &Path,
    ledger: &mut Ledger,
) -> Result<WorkingMount> {
    match source.kind {
        SourceKind::Directory => {
            let device = mounts::mount_containing(&source.path)?
                .map(|entry| entry.source)
                .filter(|src| src.starts_with("/dev/"))
                .map(PathBuf::from);
            protect_if_read_only(&source.path, read_only, ledger)?;
            Ok(WorkingMount {
                path: source.path.clone(),
                device,
            })
        }
        SourceKind::BlockDevice => {
            if let Some(existing) = mounts::mount_of_device(&source.path)? {
                println!(
                    "  Reusing existing mount of {} at {}",
                    source.path.display(),
                    existing.target.display()
                );
                protect_if_read_only(&existing.target, read_only, ledger)?;
                return Ok(WorkingMount {
                    path: existing.target,
                    device: Some(source.path.clone()),
                });
            }

            // An iso9660 medium (optical disc, dd'd hybrid ISO) cannot
            // take writes; mount it read-only like an ISO file. A whole
            // disk usually means the user meant one of its partitions.
            let probed = blockdev::probe(&source.path)?;
            let iso_medium = probed.as_ref().map(|d| d.is_iso9660()).unwrap_or(false);
            if let Some(device) = &probed {
                if !device.is_partition() && !device.is_iso9660() {
                    eprintln!(
                        "  [WARN] {} is a whole '{}' device; the LiveOS filesystem usually lives on a partition",
                        source.path.display(),
                        device.kind
                    );
                }
            }

            let mountpoint = temp::make_temp_dir(tmpdir, "media")?;
            mounts::mount_device(&source.path, &mountpoint, read_only || iso_medium)?;
            ledger.record_mount(MountRecord::created_temp(mountpoint.clone()));
            Ok(WorkingMount {
                path: mountpoint,
                device: Some(source.path.clone()),
            })
        }
        SourceKind::IsoFile => {
            let mountpoint = temp::make_temp_dir(tmpdir, "iso")?;
            mounts::mount_loop_image(&source.path, &mountpoint, true)?;
            ledger.record_mount(MountRecord::created_temp(mountpoint.clone()));

            // The implicit loop device from `mount -o loop` is what a
            // booted system would call the live device.
            let device = mounts::mount_at(&mountpoint)?
                .map(|entry| entry.source)
                .filter(|src| src.starts_with("/dev/"))
                .map(PathBuf::from);
            Ok(WorkingMount {
                path: mountpoint,
                device,
            })
        }
    }
}

/// In read-only sessions a reused read-write source mount is remounted
/// read-only for the duration, and the ledger restores it afterwards.
fn protect_if_read_only(mountpoint: &Path, read_only: bool, ledger: &mut Ledger) -> Result<()> {
    if !read_only {
        return Ok(());
    }
    let Some(entry) = mounts::mount_at(mountpoint)? else {
        return Ok(());
    };
    if entry.read_only() {
        return Ok(());
    }
    println!(
        "  Remounting {} read-only for the session",
        mountpoint.display()
    );
    mounts::remount_read_only(mountpoint)?;
    ledger.restore_rw = Some(mountpoint.to_path_buf());
    Ok(())
}

/// Bootloader config fragments that may carry `rd.live.dir=`.
const BOOT_CONFIGS: [&str; 5] = [
    "EFI/BOOT/grub.cfg",
    "boot/grub/grub.cfg",
    "boot/grub2/grub.cfg",
    "isolinux/isolinux.cfg",
    "syslinux/syslinux.cfg",
];

/// Conventional LiveOS subdirectory name.
const LIVEOS_DIR: &str = "LiveOS";

/// Extract the `rd.live.dir=` value from bootloader config text.
pub fn parse_live_dir_param(config: &str) -> Option<String> {
    config
        .split_whitespace()
        .find_map(|token| token.strip_prefix("rd.live.dir="))
        .map(str::to_string)
}

/// Find the directory holding the root image(s): a bootloader-declared
/// directory, the conventional `LiveOS` subdirectory, or the working
/// mount root for flat layouts.
pub fn locate_liveos_dir(working: &Path) -> PathBuf {
    for config in BOOT_CONFIGS {
        let Ok(text) = fs::read_to_string(working.join(config)) else {
            continue;
        };
        if let Some(dir) = parse_live_dir_param(&text) {
            let candidate = working.join(&dir);
            if candidate.is_dir() {
                return candidate;
            }
            eprintln!(
                "  [WARN] Bootloader names live directory '{dir}' but it does not exist, probing instead"
            );
            break;
        }
    }

    let conventional = working.join(LIVEOS_DIR);
    if conventional.is_dir() {
        return conventional;
    }
    working.to_path_buf()
}

/// The directory reported back to the user as the live medium, given a
/// working mount. Used in progress output only.
pub fn describe(source: &LiveSource) -> &'static str {
    match source.kind {
        SourceKind::BlockDevice => "block device",
        SourceKind::IsoFile => "image file",
        SourceKind::Directory => "directory",
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    #[test]
    fn test_resolve_directory() {
        let dir = TempDir::new().unwrap();
        let source = resolve(dir.path()).unwrap();
        assert_eq!(source.kind, SourceKind::Directory);
    }

    #[test]
    fn test_resolve_regular_file() {
        let dir = TempDir::new().unwrap();
        let iso = dir.path().join("boot.iso");
        fs::write(&iso, b"not really an iso").unwrap();

        let source = resolve(&iso).unwrap();
        assert_eq!(source.kind, SourceKind::IsoFile);
        assert_eq!(source.path, iso.canonicalize().unwrap());
    }

    #[test]
    fn test_resolve_missing_path_is_invalid_source() {
        let err = resolve(Path::new("/no/such/liveos.iso")).unwrap_err();
        assert!(matches!(
            err.downcast_ref::<LiveMountError>(),
            Some(LiveMountError::InvalidSource { .. })
        ));
    }

    #[test]
    fn test_resolve_char_device_is_invalid_source() {
        let err = resolve(Path::new("/dev/null")).unwrap_err();
        assert!(matches!(
            err.downcast_ref::<LiveMountError>(),
            Some(LiveMountError::InvalidSource { .. })
        ));
    }

    #[test]
    fn test_parse_live_dir_param() {
        let config = "menuentry 'Start' {\n  linux /images/vmlinuz root=live:CDLABEL=Live \
                      rd.live.image rd.live.dir=Custom quiet\n  initrd /images/initrd.img\n}\n";
        assert_eq!(parse_live_dir_param(config), Some("Custom".to_string()));
    }

    #[test]
    fn test_parse_live_dir_param_absent() {
        assert_eq!(parse_live_dir_param("linux /vmlinuz quiet rhgb"), None);
    }

    #[test]
    fn test_locate_liveos_dir_conventional() {
        let dir = TempDir::new().unwrap();
        fs::create_dir(dir.path().join("LiveOS")).unwrap();

        assert_eq!(locate_liveos_dir(dir.path()), dir.path().join("LiveOS"));
    }

    #[test]
    fn test_locate_liveos_dir_flat_fallback() {
        let dir = TempDir::new().unwrap();
        assert_eq!(locate_liveos_dir(dir.path()), dir.path());
    }

    #[test]
    fn test_locate_liveos_dir_from_bootloader_config() {
        let dir = TempDir::new().unwrap();
        fs::create_dir_all(dir.path().join("isolinux")).unwrap();
        fs::create_dir(dir.path().join("Custom")).unwrap();
        fs::create_dir(dir.path().join("LiveOS")).unwrap();
        fs::write(
            dir.path().join("isolinux/isolinux.cfg"),
            "label linux\n  kernel vmlinuz\n  append initrd=initrd.img rd.live.dir=Custom\n",
        )
        .unwrap();

        // The bootloader-declared directory wins over the conventional one.
        assert_eq!(locate_liveos_dir(dir.path()), dir.path().join("Custom"));
    }

    #[test]
    fn test_locate_liveos_dir_ignores_bogus_bootloader_value() {
        let dir = TempDir::new().unwrap();
        fs::create_dir_all(dir.path().join("isolinux")).unwrap();
        fs::create_dir(dir.path().join("LiveOS")).unwrap();
        fs::write(
            dir.path().join("isolinux/isolinux.cfg"),
            "append rd.live.dir=DoesNotExist\n",
        )
        .unwrap();

        assert_eq!(locate_liveos_dir(dir.path()), dir.path().join("LiveOS"));
    }
}
