//! Mount-table queries and mount/unmount execution.
//!
//! Queries go through `findmnt --json` and are deserialized with serde;
//! JSON survives sources and options containing whitespace, which the
//! column output does not.

use anyhow::{Context, Result};
use serde::Deserialize;
use std::path::{Path, PathBuf};

use crate::process::Cmd;

/// Mount source name used for OverlayFS root mounts, matching what a
/// booted live system uses. The unmount path keys on this string.
pub const OVERLAY_SOURCE: &str = "LiveOS_rootfs";

/// One filesystem row of `findmnt --json` output.
#[derive(Debug, Clone, Deserialize)]
pub struct MountEntry {
    pub target: PathBuf,
    #[serde(default)]
    pub source: String,
    #[serde(default)]
    pub fstype: String,
    #[serde(default)]
    pub options: String,
}

impl MountEntry {
    /// Whether the mount carries the `ro` option.
    pub fn read_only(&self) -> bool {
        self.options.split(',').any(|opt| opt == "ro")
    }
}

#[derive(Debug, Deserialize)]
struct FindmntOutput {
    #[serde(default)]
    filesystems: Vec<MountEntry>,
}

/// Parse `findmnt --json` output into its filesystem rows.
pub fn parse_findmnt(json: &str) -> Result<Vec<MountEntry>> {
    if json.trim().is_empty() {
        return Ok(Vec::new());
    }
    let parsed: FindmntOutput =
        serde_json::from_str(json).context("Unparseable findmnt JSON output")?;
    Ok(parsed.filesystems)
}

fn query(flag: &str, path: &Path) -> Result<Option<MountEntry>> {
    let result = Cmd::new("findmnt")
        .args(["--json", "-o", "TARGET,SOURCE,FSTYPE,OPTIONS", flag])
        .arg_path(path)
        .allow_fail()
        .run()?;

    // findmnt exits non-zero when nothing matches.
    if !result.success() {
        return Ok(None);
    }
    Ok(parse_findmnt(&result.stdout)?.into_iter().next())
}

/// The mount entry whose mount point is exactly `path`, if any.
pub fn mount_at(path: &Path) -> Result<Option<MountEntry>> {
    query("--mountpoint", path)
}

/// The mount entry of the filesystem containing `path`.
pub fn mount_containing(path: &Path) -> Result<Option<MountEntry>> {
    query("--target", path)
}

/// The first mount entry whose source is the given block device, if any.
pub fn mount_of_device(device: &Path) -> Result<Option<MountEntry>> {
    query("--source", device)
}

/// Whether `path` is itself a mount point.
pub fn is_mountpoint(path: &Path) -> Result<bool> {
    Ok(mount_at(path)?.is_some())
}

/// OverlayFS mount options, parsed from a findmnt OPTIONS string.
#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub struct OverlayOptions {
    /// Lower layers, topmost first (the kernel's `lowerdir=` order).
    pub lowerdirs: Vec<PathBuf>,
    pub upperdir: Option<PathBuf>,
    pub workdir: Option<PathBuf>,
}

/// Pick `lowerdir=`/`upperdir=`/`workdir=` out of a comma-separated
/// options string. Unknown options are ignored.
pub fn parse_overlay_options(options: &str) -> OverlayOptions {
    let mut parsed = OverlayOptions::default();

    for opt in options.split(',') {
        if let Some(value) = opt.strip_prefix("lowerdir=") {
            parsed.lowerdirs = value.split(':').map(PathBuf::from).collect();
        } else if let Some(value) = opt.strip_prefix("upperdir=") {
            parsed.upperdir = Some(PathBuf::from(value));
        } else if let Some(value) = opt.strip_prefix("workdir=") {
            parsed.workdir = Some(PathBuf::from(value));
        }
    }

    parsed
}

// ---------------------------------------------------------------------------
// Mount execution
// ---------------------------------------------------------------------------

/// Mount a block device.
pub fn mount_device(device: &Path, target: &Path, read_only: bool) -> Result<()> {
    let mut cmd = Cmd::new("mount");
    if read_only {
        cmd = cmd.args(["-o", "ro"]);
    }
    cmd.arg_path(device)
        .arg_path(target)
        .error_msg(format!("Failed to mount {}", device.display()))
        .run()?;
    Ok(())
}

/// Mount an image file through an implicit loop device.
pub fn mount_loop_image(image: &Path, target: &Path, read_only: bool) -> Result<()> {
    let options = if read_only { "loop,ro" } else { "loop" };
    Cmd::new("mount")
        .args(["-o", options])
        .arg_path(image)
        .arg_path(target)
        .error_msg(format!("Failed to loop-mount {}", image.display()))
        .run()?;
    Ok(())
}

/// Mount an OverlayFS stack at `target`.
///
/// `lowerdirs` is topmost-first; a missing `upper` mounts the overlay
/// read-only.
pub fn mount_overlay(
    lowerdirs: &[PathBuf],
    upper: Option<(&Path, &Path)>,
    target: &Path,
) -> Result<()> {
    let lower = lowerdirs
        .iter()
        .map(|p| p.to_string_lossy().into_owned())
        .collect::<Vec<_>>()
        .join(":");

    let mut data = format!("lowerdir={}", lower);
    if let Some((upperdir, workdir)) = upper {
        data.push_str(&format!(
            ",upperdir={},workdir={}",
            upperdir.display(),
            workdir.display()
        ));
    }

    Cmd::new("mount")
        .args(["-t", "overlay", OVERLAY_SOURCE, "-o"])
        .arg(data)
        .arg_path(target)
        .error_msg("Failed to mount overlay")
        .run()?;
    Ok(())
}

/// Bind-mount `source` at `target` (works for files and directories).
pub fn bind_mount(source: &Path, target: &Path) -> Result<()> {
    Cmd::new("mount")
        .arg("--bind")
        .arg_path(source)
        .arg_path(target)
        .error_msg(format!("Failed to bind {}", source.display()))
        .run()?;
    Ok(())
}

/// Mount a fresh proc filesystem at `target`.
pub fn mount_proc(target: &Path) -> Result<()> {
    Cmd::new("mount")
        .args(["-t", "proc", "proc"])
        .arg_path(target)
        .error_msg("Failed to mount proc")
        .run()?;
    Ok(())
}

/// Mount a tmpfs at `target`.
pub fn mount_tmpfs(target: &Path) -> Result<()> {
    Cmd::new("mount")
        .args(["-t", "tmpfs", "tmpfs"])
        .arg_path(target)
        .error_msg("Failed to mount tmpfs")
        .run()?;
    Ok(())
}

/// Unmount a single mount point.
pub fn umount(target: &Path) -> Result<()> {
    Cmd::new("umount")
        .arg_path(target)
        .error_msg(format!("Failed to unmount {}", target.display()))
        .run()?;
    Ok(())
}

/// Recursively unmount everything under (and including) `target`.
pub fn umount_recursive(target: &Path) -> Result<()> {
    Cmd::new("umount")
        .arg("-R")
        .arg_path(target)
        .error_msg(format!("Failed to recursively unmount {}", target.display()))
        .run()?;
    Ok(())
}

/// Remount an existing mount read-only.
pub fn remount_read_only(target: &Path) -> Result<()> {
    Cmd::new("mount")
        .args(["-o", "remount,ro"])
        .arg_path(target)
        .error_msg(format!("Failed to remount {} read-only", target.display()))
        .run()?;
    Ok(())
}

/// Remount an existing mount read-write.
pub fn remount_read_write(target: &Path) -> Result<()> {
    Cmd::new("mount")
        .args(["-o", "remount,rw"])
        .arg_path(target)
        .error_msg(format!("Failed to remount {} read-write", target.display()))
        .run()?;
    Ok(())
}
