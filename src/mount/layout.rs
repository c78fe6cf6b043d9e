//! Root image discovery inside the LiveOS directory.
//!
//! Layout detection is by directory probing, in fixed order: a
//! `squashfs.img` wins, and its content either carries a nested raw
//! image under `LiveOS/` or is itself the root tree (flattened). With
//! no squashfs, a raw image sits directly in the LiveOS directory.

use anyhow::Result;
use std::path::{Path, PathBuf};

use crate::error::LiveMountError;
use crate::introspect::mounts;
use crate::ledger::{Ledger, MountRecord};
use crate::temp;

const SQUASHFS_IMAGE: &str = "squashfs.img";

/// Raw root image names, in probe order.
const ROOT_IMAGES: [&str; 2] = ["rootfs.img", "ext3fs.img"];

/// The filesystem image serving as the base layer.
#[derive(Debug, Clone)]
pub enum RootImage {
    /// Raw image found inside the mounted squashfs.
    Nested { image: PathBuf },
    /// Squashfs whose content is the root tree itself; carries the
    /// mount point holding that tree.
    Flattened { root: PathBuf },
    /// Raw image directly in the LiveOS directory.
    Raw { image: PathBuf },
}

impl RootImage {
    /// The image file to attach a loop device to, for the block-backed
    /// variants.
    pub fn block_image(&self) -> Option<&Path> {
        match self {
            RootImage::Nested { image } | RootImage::Raw { image } => Some(image),
            RootImage::Flattened { .. } => None,
        }
    }
}

/// First raw root image present in `dir`, if any.
pub fn find_raw_root_image(dir: &Path) -> Option<PathBuf> {
    ROOT_IMAGES
        .iter()
        .map(|name| dir.join(name))
        .find(|path| path.is_file())
}

/// Locate the root image for a LiveOS directory, mounting the squashfs
/// (read-only, recorded in the ledger) when one is present.
pub fn locate_root_image(
    liveos_dir: &Path,
    tmpdir: &Path,
    ledger: &mut Ledger,
) -> Result<RootImage> {
    let squashfs = liveos_dir.join(SQUASHFS_IMAGE);
    if !squashfs.is_file() {
        return match find_raw_root_image(liveos_dir) {
            Some(image) => {
                println!("  Root image: {}", image.display());
                Ok(RootImage::Raw { image })
            }
            None => Err(LiveMountError::NoRootImageFound(liveos_dir.to_path_buf()).into()),
        };
    }

    let squashfs_mount = temp::make_temp_dir(tmpdir, "squashfs")?;
    mounts::mount_loop_image(&squashfs, &squashfs_mount, true)?;
    ledger.record_mount(MountRecord::created_temp(squashfs_mount.clone()));

    let inner = squashfs_mount.join("LiveOS");
    if inner.is_dir() {
        return match find_raw_root_image(&inner) {
            Some(image) => {
                println!("  Root image: {} (inside squashfs)", image.display());
                Ok(RootImage::Nested { image })
            }
            None => Err(LiveMountError::NoRootImageFound(inner).into()),
        };
    }

    // No nested image directory: treat the squashfs content as the
    // root tree. A squashfs holding something else entirely also lands
    // here, so sanity-check the shape before committing to it.
    if !squashfs_mount.join("etc").is_dir() && !squashfs_mount.join("usr").is_dir() {
        eprintln!(
            "  [WARN] {} has neither a nested image nor a root-like tree; continuing anyway",
            squashfs.display()
        );
    }
    println!("  Root image: {} (flattened squashfs)", squashfs.display());
    Ok(RootImage::Flattened {
        root: squashfs_mount,
    })
}
