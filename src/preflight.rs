//! Host environment checks run before any resource is created.

use anyhow::{bail, Result};

/// Tools every invocation needs, with package hints.
const REQUIRED_TOOLS: &[(&str, &str)] = &[
    ("mount", "util-linux"),
    ("umount", "util-linux"),
    ("losetup", "util-linux"),
    ("findmnt", "util-linux"),
    ("lsblk", "util-linux"),
    ("blockdev", "util-linux"),
    ("dmsetup", "device-mapper"),
];

/// Check that the required host tools resolve on PATH.
pub fn check_host_tools() -> Result<()> {
    let mut missing = Vec::new();

    for (tool, package) in REQUIRED_TOOLS {
        if which::which(tool).is_err() {
            missing.push(format!("{} (install '{}')", tool, package));
        }
    }

    if !missing.is_empty() {
        bail!("Required host tools not found: {}", missing.join(", "));
    }

    Ok(())
}

/// Demand cryptsetup, which is only needed once an encrypted home.img is
/// actually encountered.
pub fn require_cryptsetup() -> Result<()> {
    if which::which("cryptsetup").is_err() {
        bail!(
            "home.img is LUKS-encrypted but 'cryptsetup' was not found. \
             Install the 'cryptsetup' package."
        );
    }
    Ok(())
}

/// Loop devices, device-mapper, and the mount table all need root.
pub fn check_root() -> Result<()> {
    if unsafe { libc::geteuid() } != 0 {
        bail!("You must run liveimage-mount as root.");
    }
    Ok(())
}
