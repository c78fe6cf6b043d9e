//! Loop device management via losetup.

use anyhow::{bail, Result};
use std::path::{Path, PathBuf};

use crate::process::Cmd;

/// Major number the kernel assigns to loop block devices.
const LOOP_MAJOR: u32 = 7;

/// Attach a backing file to a free loop device and return its path.
pub fn attach(backing: &Path, read_only: bool) -> Result<PathBuf> {
    let mut cmd = Cmd::new("losetup").args(["--find", "--show"]);
    if read_only {
        cmd = cmd.arg("--read-only");
    }
    let result = cmd
        .arg_path(backing)
        .error_msg(format!(
            "Failed to attach loop device for {}",
            backing.display()
        ))
        .run()?;

    let device = result.stdout_trimmed();
    if device.is_empty() {
        bail!("losetup returned no device for {}", backing.display());
    }
    Ok(PathBuf::from(device))
}

/// Detach a loop device.
pub fn detach(device: &Path) -> Result<()> {
    Cmd::new("losetup")
        .arg("-d")
        .arg_path(device)
        .error_msg(format!("Failed to detach {}", device.display()))
        .run()?;
    Ok(())
}

/// The backing file of a loop device, or `None` if the device is not
/// currently attached.
pub fn backing_file(device: &Path) -> Result<Option<PathBuf>> {
    let result = Cmd::new("losetup")
        .args(["--list", "--noheadings", "--output", "BACK-FILE"])
        .arg_path(device)
        .allow_fail()
        .run()?;

    if !result.success() {
        return Ok(None);
    }
    Ok(parse_backing_file(&result.stdout))
}

/// Parse `losetup --output BACK-FILE` output. A loop device whose file
/// was unlinked reports `path (deleted)`; the suffix is stripped so the
/// caller sees the original path.
pub fn parse_backing_file(output: &str) -> Option<PathBuf> {
    let line = output.trim();
    if line.is_empty() {
        return None;
    }
    let path = line.strip_suffix(" (deleted)").unwrap_or(line);
    Some(PathBuf::from(path))
}

/// Map a `major:minor` device number pair to a loop device path, if the
/// major number is the loop major.
pub fn from_major_minor(majmin: &str) -> Option<PathBuf> {
    let (major, minor) = majmin.split_once(':')?;
    let major: u32 = major.trim().parse().ok()?;
    let minor: u32 = minor.trim().parse().ok()?;
    if major != LOOP_MAJOR {
        return None;
    }
    Some(PathBuf::from(format!("/dev/loop{minor}")))
}

/// Whether `device` names a loop device node (`/dev/loopN`).
pub fn is_loop_device(device: &Path) -> bool {
    device
        .file_name()
        .and_then(|n| n.to_str())
        .map(|n| {
            n.strip_prefix("loop")
                .map(|rest| !rest.is_empty() && rest.chars().all(|c| c.is_ascii_digit()))
                .unwrap_or(false)
        })
        .unwrap_or(false)
        && device.starts_with("/dev")
}
