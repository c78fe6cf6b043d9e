//! Overlay strategy selection and materialization.
//!
//! Writes over the read-only base go either through OverlayFS (when
//! the writable layer is a directory) or through a device-mapper
//! snapshot (when it is a file exposed as a loop device). Read-only
//! sessions always put a discardable temporary layer on top, so the
//! persistent layer is never written.

use anyhow::{bail, Result};
use std::fs;
use std::path::{Path, PathBuf};

use crate::introspect::{devmapper, loopdev, mounts};
use crate::ledger::{Ledger, MountRecord};
use crate::mount::layout::RootImage;
use crate::temp;

/// Name prefix of persistent overlay files/directories in the LiveOS
/// directory, as written by the image creation tooling.
const OVERLAY_PREFIX: &str = "overlay-";

/// Subdirectory of a directory overlay holding the upper layer.
pub const OVERLAYFS_UPPER: &str = "overlayfs";

/// Subdirectory of a directory overlay used as the OverlayFS workdir.
pub const OVERLAYFS_WORK: &str = "ovlwork";

/// How this session's writes are captured.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum OverlayTarget {
    /// Temporary file-backed snapshot, discarded at unmount.
    TempSnapshot,
    /// Persistent file used as the copy-on-write store.
    FileSnapshot { file: PathBuf },
    /// Persistent file kept read-only under a chained temporary
    /// snapshot.
    ReadOnlyFileSnapshot { file: PathBuf },
    /// Persistent directory mounted as the OverlayFS upper layer.
    DirOverlay { dir: PathBuf },
    /// Persistent directory demoted to a lower layer under a
    /// temporary upper.
    ReadOnlyDirOverlay { dir: PathBuf },
    /// Temporary OverlayFS upper, discarded at unmount.
    TempOverlay,
}

/// First persistent overlay entry in the LiveOS directory, by name.
pub fn discover_persistent(liveos_dir: &Path) -> Option<PathBuf> {
    let entries = fs::read_dir(liveos_dir).ok()?;
    let mut candidates: Vec<PathBuf> = entries
        .filter_map(|entry| entry.ok())
        .filter(|entry| {
            entry
                .file_name()
                .to_string_lossy()
                .starts_with(OVERLAY_PREFIX)
        })
        .map(|entry| entry.path())
        .collect();
    candidates.sort();
    candidates.into_iter().next()
}

/// Pick the overlay strategy from the explicit option, the discovered
/// persistent overlay, and the root image shape.
pub fn determine(
    liveos_dir: &Path,
    root: &RootImage,
    explicit: Option<&Path>,
    read_only: bool,
) -> Result<OverlayTarget> {
    let persistent = match explicit {
        Some(path) => {
            if !path.exists() {
                bail!("Overlay path {} does not exist", path.display());
            }
            Some(path.to_path_buf())
        }
        None => {
            let found = discover_persistent(liveos_dir);
            if let Some(ref path) = found {
                println!("  Persistent overlay: {}", path.display());
            }
            found
        }
    };

    match persistent {
        Some(path) if path.is_dir() => {
            if read_only {
                Ok(OverlayTarget::ReadOnlyDirOverlay { dir: path })
            } else {
                Ok(OverlayTarget::DirOverlay { dir: path })
            }
        }
        Some(path) => {
            if root.block_image().is_none() {
                bail!(
                    "Overlay file {} needs a block-backed root image; \
                     this flattened squashfs can only take a directory overlay",
                    path.display()
                );
            }
            if read_only {
                Ok(OverlayTarget::ReadOnlyFileSnapshot { file: path })
            } else {
                Ok(OverlayTarget::FileSnapshot { file: path })
            }
        }
        None => {
            if root.block_image().is_some() {
                Ok(OverlayTarget::TempSnapshot)
            } else {
                Ok(OverlayTarget::TempOverlay)
            }
        }
    }
}

/// Build the chosen overlay on top of the root image and mount the
/// result at `dest`.
pub fn materialize(
    target: &OverlayTarget,
    root: &RootImage,
    dest: &Path,
    tmpdir: &Path,
    ovl_size_mib: u64,
    ledger: &mut Ledger,
) -> Result<()> {
    match target {
        OverlayTarget::DirOverlay { dir } => {
            let base = overlayfs_base(root, tmpdir, ledger)?;
            let upper = dir.join(OVERLAYFS_UPPER);
            let work = dir.join(OVERLAYFS_WORK);
            fs::create_dir_all(&upper)?;
            fs::create_dir_all(&work)?;
            mounts::mount_overlay(&[base], Some((&upper, &work)), dest)
        }
        OverlayTarget::ReadOnlyDirOverlay { dir } => {
            let base = overlayfs_base(root, tmpdir, ledger)?;
            let (upper, work) = temp_overlay_dirs(tmpdir, ledger)?;

            // The persistent upper joins the lower stack (topmost
            // first) so its state is visible but never written. A
            // fresh overlay directory has no upper yet; skip it rather
            // than create one on a medium we must not touch.
            let persistent_upper = dir.join(OVERLAYFS_UPPER);
            let lowerdirs = if persistent_upper.is_dir() {
                vec![persistent_upper, base]
            } else {
                vec![base]
            };
            mounts::mount_overlay(&lowerdirs, Some((&upper, &work)), dest)
        }
        OverlayTarget::TempOverlay => {
            let base = overlayfs_base(root, tmpdir, ledger)?;
            let (upper, work) = temp_overlay_dirs(tmpdir, ledger)?;
            mounts::mount_overlay(&[base], Some((&upper, &work)), dest)
        }
        OverlayTarget::TempSnapshot => {
            snapshot_mount(root, None, false, dest, tmpdir, ovl_size_mib, ledger)
        }
        OverlayTarget::FileSnapshot { file } => {
            snapshot_mount(root, Some(file), false, dest, tmpdir, ovl_size_mib, ledger)
        }
        OverlayTarget::ReadOnlyFileSnapshot { file } => {
            snapshot_mount(root, Some(file), true, dest, tmpdir, ovl_size_mib, ledger)
        }
    }
}

/// The directory used as the OverlayFS base layer. Flattened roots use
/// the squashfs mount directly; image-backed roots get a read-only
/// loop mount of their own.
fn overlayfs_base(root: &RootImage, tmpdir: &Path, ledger: &mut Ledger) -> Result<PathBuf> {
    match root {
        RootImage::Flattened { root } => Ok(root.clone()),
        RootImage::Nested { image } | RootImage::Raw { image } => {
            let base_mount = temp::make_temp_dir(tmpdir, "base")?;
            mounts::mount_loop_image(image, &base_mount, true)?;
            ledger.record_mount(MountRecord::created_temp(base_mount.clone()));
            Ok(base_mount)
        }
    }
}

/// A discardable upper/work pair under the private temp convention.
fn temp_overlay_dirs(tmpdir: &Path, ledger: &mut Ledger) -> Result<(PathBuf, PathBuf)> {
    let dir = temp::make_temp_dir(tmpdir, "ovl")?;
    ledger.record_temp_dir(dir.clone());

    let upper = dir.join(OVERLAYFS_UPPER);
    let work = dir.join(OVERLAYFS_WORK);
    fs::create_dir_all(&upper)?;
    fs::create_dir_all(&work)?;
    Ok((upper, work))
}

/// Stack device-mapper snapshots over the root image's loop device and
/// mount the top target at `dest`.
fn snapshot_mount(
    root: &RootImage,
    persistent: Option<&Path>,
    read_only: bool,
    dest: &Path,
    tmpdir: &Path,
    ovl_size_mib: u64,
    ledger: &mut Ledger,
) -> Result<()> {
    let Some(image) = root.block_image() else {
        bail!("A snapshot overlay needs a block-backed root image");
    };

    let names = super::ensure_dm_names(ledger)?;
    let base_loop = loopdev::attach(image, true)?;
    ledger.record_loop(base_loop.clone(), image.to_path_buf());

    let temp_cow = |ledger: &mut Ledger| -> Result<PathBuf> {
        let file = temp::make_sparse_temp_file(tmpdir, "overlay", ovl_size_mib)?;
        ledger.record_temp_file(file.clone());
        let device = loopdev::attach(&file, false)?;
        ledger.record_loop(device.clone(), file);
        Ok(device)
    };

    let device = match (persistent, read_only) {
        (None, _) => {
            let cow = temp_cow(ledger)?;
            devmapper::create_snapshot(&names.live_rw(), &base_loop, &cow, false)?
        }
        (Some(file), false) => {
            let cow = loopdev::attach(file, false)?;
            ledger.record_loop(cow.clone(), file.to_path_buf());
            devmapper::create_snapshot(&names.live_rw(), &base_loop, &cow, false)?
        }
        (Some(file), true) => {
            // Chain a writable temporary snapshot on a read-only view
            // of base plus persistent overlay.
            let persistent_cow = loopdev::attach(file, true)?;
            ledger.record_loop(persistent_cow.clone(), file.to_path_buf());
            let ro_device =
                devmapper::create_snapshot(&names.live_ro(), &base_loop, &persistent_cow, true)?;

            let cow = temp_cow(ledger)?;
            devmapper::create_snapshot(&names.live_rw(), &ro_device, &cow, false)?
        }
    };

    mounts::mount_device(&device, dest, false)?;
    println!("  Mounted {} at {}", device.display(), dest.display());
    Ok(())
}
