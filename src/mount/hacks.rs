//! Chroot conveniences: host filesystem binds and the booted-system
//! layout under `run/initramfs`.

use anyhow::{bail, Context, Result};
use std::fs;
use std::path::Path;

use crate::introspect::mounts;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum HackKind {
    /// Fresh proc filesystem.
    Proc,
    /// Bind of a host directory.
    BindDir,
    /// Bind of a host file.
    BindFile,
}

struct HackMount {
    source: &'static str,
    /// Target relative to the destination root.
    target: &'static str,
    kind: HackKind,
    /// Required mounts fail the whole setup; the rest are skipped
    /// with a warning (minimal hosts may lack them).
    required: bool,
}

/// Host pieces made visible inside the mounted root, in mount order.
/// `/dev` comes before `/dev/pts` and `/dev/shm` since a plain bind
/// does not carry nested mounts along.
const HACK_MOUNTS: [HackMount; 7] = [
    HackMount {
        source: "/proc",
        target: "proc",
        kind: HackKind::Proc,
        required: true,
    },
    HackMount {
        source: "/run",
        target: "run",
        kind: HackKind::BindDir,
        required: true,
    },
    HackMount {
        source: "/sys",
        target: "sys",
        kind: HackKind::BindDir,
        required: true,
    },
    HackMount {
        source: "/dev",
        target: "dev",
        kind: HackKind::BindDir,
        required: true,
    },
    HackMount {
        source: "/dev/pts",
        target: "dev/pts",
        kind: HackKind::BindDir,
        required: false,
    },
    HackMount {
        source: "/dev/shm",
        target: "dev/shm",
        kind: HackKind::BindDir,
        required: false,
    },
    HackMount {
        source: "/etc/resolv.conf",
        target: "etc/resolv.conf",
        kind: HackKind::BindFile,
        required: false,
    },
];

const DNF_CACHE_TARGET: &str = "var/cache/dnf";

/// Mount the host conveniences into the destination root. Everything
/// lands under the destination, so the recursive unmount at teardown
/// covers it without separate ledger entries.
pub fn apply_mount_hacks(dest: &Path, dnf_cache: Option<&Path>) -> Result<()> {
    println!("  Setting up chroot mounts...");

    for hack in &HACK_MOUNTS {
        let source = Path::new(hack.source);
        let target = dest.join(hack.target);

        if hack.kind != HackKind::Proc && !source.exists() {
            if hack.required {
                bail!("Required mount source {} does not exist", hack.source);
            }
            continue;
        }

        prepare_target(&target, hack.kind)?;

        let result = match hack.kind {
            HackKind::Proc => mounts::mount_proc(&target),
            HackKind::BindDir | HackKind::BindFile => mounts::bind_mount(source, &target),
        };
        if let Err(e) = result {
            if hack.required {
                return Err(e);
            }
            eprintln!("  [WARN] Skipping {}: {:#}", hack.source, e);
        }
    }

    let cache_target = dest.join(DNF_CACHE_TARGET);
    fs::create_dir_all(&cache_target)
        .with_context(|| format!("Failed to create {}", cache_target.display()))?;
    match dnf_cache {
        Some(cache) => {
            fs::create_dir_all(cache)
                .with_context(|| format!("Failed to create {}", cache.display()))?;
            mounts::bind_mount(cache, &cache_target)?;
        }
        None => mounts::mount_tmpfs(&cache_target)?,
    }

    Ok(())
}

/// Make sure the mount target exists in the right shape. A file bind
/// needs a plain file; a stale symlink there (resolv.conf on
/// systemd-resolved systems) is replaced.
fn prepare_target(target: &Path, kind: HackKind) -> Result<()> {
    match kind {
        HackKind::Proc | HackKind::BindDir => {
            fs::create_dir_all(target)
                .with_context(|| format!("Failed to create {}", target.display()))?;
        }
        HackKind::BindFile => {
            if let Some(parent) = target.parent() {
                fs::create_dir_all(parent)
                    .with_context(|| format!("Failed to create {}", parent.display()))?;
            }
            if fs::symlink_metadata(target)
                .map(|meta| meta.file_type().is_symlink())
                .unwrap_or(false)
            {
                fs::remove_file(target)
                    .with_context(|| format!("Failed to replace symlink {}", target.display()))?;
            }
            if !target.exists() {
                fs::write(target, b"")
                    .with_context(|| format!("Failed to create {}", target.display()))?;
            }
        }
    }
    Ok(())
}

/// Bind the working mount at `run/initramfs/live` and point the
/// `livedev` symlink at the block device behind it, matching the
/// layout a booted live system presents to its tooling.
pub fn bind_live_mount(dest: &Path, working: &Path, live_device: Option<&Path>) -> Result<()> {
    let live = dest.join("run/initramfs/live");
    fs::create_dir_all(&live)
        .with_context(|| format!("Failed to create {}", live.display()))?;
    mounts::bind_mount(working, &live)?;

    if let Some(device) = live_device {
        let link = dest.join("run/initramfs/livedev");
        if fs::symlink_metadata(&link).is_ok() {
            fs::remove_file(&link)
                .with_context(|| format!("Failed to replace {}", link.display()))?;
        }
        std::os::unix::fs::symlink(device, &link)
            .with_context(|| format!("Failed to link {}", link.display()))?;
    }
    Ok(())
}

/// The bind target under a destination, for the unmount path.
pub fn live_bind_target(dest: &Path) -> std::path::PathBuf {
    dest.join("run/initramfs/live")
}
