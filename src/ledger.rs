//! The resource ledger: everything one mount session created, in a
//! form the shared cleanup routine can undo.
//!
//! The mount path fills a ledger as it works; the unmount path rebuilds
//! an equivalent ledger from kernel state. Both hand it to [`cleanup`],
//! which undoes each entry behind an existence check so running it
//! twice (or over a half-built session) is safe.

use std::path::{Path, PathBuf};

use crate::introspect::{devmapper, loopdev, mounts};
use crate::introspect::devmapper::DmNames;
use crate::process::Cmd;
use crate::temp;

/// A mount point this session touched.
#[derive(Debug, Clone)]
pub struct MountRecord {
    pub path: PathBuf,
    /// Mounted by this session, so cleanup unmounts it. Pre-existing
    /// mounts are recorded only for reporting and left alone.
    pub created: bool,
    /// Lives under the private temp naming convention, so the
    /// directory itself is removed after unmounting.
    pub temporary: bool,
}

impl MountRecord {
    pub fn created_temp(path: PathBuf) -> Self {
        MountRecord {
            path,
            created: true,
            temporary: true,
        }
    }

    pub fn pre_existing(path: PathBuf) -> Self {
        MountRecord {
            path,
            created: false,
            temporary: false,
        }
    }
}

/// A loop device this session attached, with the backing file it had
/// at attach time.
#[derive(Debug, Clone)]
pub struct LoopRecord {
    pub device: PathBuf,
    pub backing: PathBuf,
}

/// Ordered record of undoable resources for one session.
#[derive(Debug, Default)]
pub struct Ledger {
    /// The destination root mount, unmounted recursively first.
    pub dest: Option<PathBuf>,
    /// The home mount under the destination, if one was created.
    pub home_mount: Option<PathBuf>,
    /// Device-mapper names for the session. Cleanup removes whichever
    /// of the four exist, dependents first.
    pub dm_names: Option<DmNames>,
    /// Loop devices attached with losetup. Detached after the mapper
    /// targets referencing them are gone.
    pub loops: Vec<LoopRecord>,
    /// Working/squashfs/base mounts in the order they were mounted;
    /// cleanup walks them in reverse.
    pub mounts: Vec<MountRecord>,
    /// Temporary files (overlay images) to delete.
    pub temp_files: Vec<PathBuf>,
    /// Temporary directories to delete.
    pub temp_dirs: Vec<PathBuf>,
    /// A pre-existing mount this session remounted read-only, to be
    /// remounted read-write once teardown is done.
    pub restore_rw: Option<PathBuf>,
}

impl Ledger {
    pub fn new() -> Self {
        Ledger::default()
    }

    pub fn record_loop(&mut self, device: PathBuf, backing: PathBuf) {
        self.loops.push(LoopRecord { device, backing });
    }

    pub fn record_mount(&mut self, record: MountRecord) {
        self.mounts.push(record);
    }

    pub fn record_temp_dir(&mut self, path: PathBuf) {
        self.temp_dirs.push(path);
    }

    pub fn record_temp_file(&mut self, path: PathBuf) {
        self.temp_files.push(path);
    }
}

fn warn(what: &str, err: &anyhow::Error) {
    eprintln!("  [WARN] {}: {:#}", what, err);
}

fn umount_if_mounted(path: &Path) {
    match mounts::is_mountpoint(path) {
        Ok(true) => {
            if let Err(e) = mounts::umount(path) {
                warn(&format!("Failed to unmount {}", path.display()), &e);
            }
        }
        Ok(false) => {}
        Err(e) => warn(&format!("Could not query {}", path.display()), &e),
    }
}

/// Undo everything the ledger records, in dependency order. Failures
/// are reported and skipped so the remaining entries still get their
/// chance; the routine never aborts a teardown half way.
pub fn cleanup(ledger: &Ledger) {
    // Flush pending writes before pulling devices out from under the
    // page cache.
    if let Err(e) = Cmd::new("sync").run() {
        warn("sync failed", &e);
    }

    if let Some(dest) = &ledger.dest {
        match mounts::is_mountpoint(dest) {
            Ok(true) => {
                if let Err(e) = mounts::umount_recursive(dest) {
                    warn(&format!("Failed to unmount {}", dest.display()), &e);
                }
            }
            Ok(false) => {}
            Err(e) => warn(&format!("Could not query {}", dest.display()), &e),
        }
    }

    // Normally covered by the recursive unmount above; guarded here
    // for sessions where the destination was already gone.
    if let Some(home) = &ledger.home_mount {
        umount_if_mounted(home);
    }

    if let Some(names) = &ledger.dm_names {
        for name in [
            names.home(),
            names.enc_home(),
            names.live_rw(),
            names.live_ro(),
        ] {
            match devmapper::remove_if_exists(&name) {
                Ok(_) => {}
                Err(e) => warn(&format!("Failed to remove {name}"), &e),
            }
        }
    }

    // Only detach a loop device that still carries the file we gave
    // it. A device released by the kernel (or re-used by another
    // process) is left alone.
    for record in &ledger.loops {
        match loopdev::backing_file(&record.device) {
            Ok(Some(backing)) if backing == record.backing => {
                if let Err(e) = loopdev::detach(&record.device) {
                    warn(&format!("Failed to detach {}", record.device.display()), &e);
                }
            }
            Ok(_) => {}
            Err(e) => warn(
                &format!("Could not query {}", record.device.display()),
                &e,
            ),
        }
    }

    for record in ledger.mounts.iter().rev() {
        if record.created {
            umount_if_mounted(&record.path);
        }
        if record.temporary {
            temp::remove_temp_dir(&record.path);
        }
    }

    for file in &ledger.temp_files {
        temp::remove_temp_file(file);
    }
    for dir in &ledger.temp_dirs {
        temp::remove_temp_dir(dir);
    }

    if let Some(source_mount) = &ledger.restore_rw {
        match mounts::is_mountpoint(source_mount) {
            Ok(true) => {
                if let Err(e) = mounts::remount_read_write(source_mount) {
                    warn(
                        &format!("Failed to restore {} read-write", source_mount.display()),
                        &e,
                    );
                }
            }
            Ok(false) => {}
            Err(e) => warn(
                &format!("Could not query {}", source_mount.display()),
                &e,
            ),
        }
    }
}
