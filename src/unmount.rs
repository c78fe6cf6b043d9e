//! The unmount path: rebuild a mount session from live kernel state
//! and tear it down.
//!
//! Nothing about a session is stored on disk. Everything the cleanup
//! needs is recovered by walking outward from the destination mount:
//! overlay options name the layer directories, device-mapper tables
//! name the loop devices, and loop backing files lead back through the
//! squashfs mount to the original medium.

use anyhow::Result;
use std::path::{Path, PathBuf};

use crate::error::LiveMountError;
use crate::introspect::devmapper::{self, DmNames, DmTable};
use crate::introspect::{loopdev, mounts};
use crate::ledger::{self, Ledger, MountRecord};
use crate::mount::hacks;
use crate::temp;

/// What the reconstructor recovered about the session's origin.
#[derive(Debug, Default)]
pub struct UnmountReport {
    /// The original LiveOS medium, as far back as it could be traced.
    pub source: Option<PathBuf>,
    /// A pre-existing mount the medium still sits on, and whether it
    /// is mounted read-only.
    pub remaining_mount: Option<(PathBuf, bool)>,
}

/// Legal top-level sources for a LiveOS destination mount.
#[derive(Debug, PartialEq, Eq)]
enum RootKind {
    Overlay,
    Snapshot(DmNames),
}

fn classify(source: &str) -> Option<RootKind> {
    if source == mounts::OVERLAY_SOURCE {
        return Some(RootKind::Overlay);
    }
    let name = devmapper::name_from_mapper_path(Path::new(source))?;
    DmNames::from_live_rw(name).map(RootKind::Snapshot)
}

fn warn(what: &str) {
    eprintln!("  [WARN] {what}");
}

/// Reconstruct the session behind `dest` and tear it down. Rejects
/// destinations that are not recognizably LiveOS mounts before
/// touching anything.
pub fn unmount(dest: &Path) -> Result<UnmountReport> {
    let dest = dest.canonicalize().unwrap_or_else(|_| dest.to_path_buf());

    let entry = mounts::mount_at(&dest)?.ok_or_else(|| LiveMountError::NotALiveMount {
        mountpoint: dest.clone(),
        source: "not a mount point".to_string(),
    })?;
    let kind = classify(&entry.source).ok_or_else(|| LiveMountError::NotALiveMount {
        mountpoint: dest.clone(),
        source: entry.source.clone(),
    })?;

    println!("Unmounting {} ({})", dest.display(), entry.source);

    let mut ledger = Ledger::new();
    ledger.dest = Some(dest.clone());
    let mut report = UnmountReport::default();

    match kind {
        RootKind::Overlay => reconstruct_overlay(&entry, &mut ledger, &mut report),
        RootKind::Snapshot(names) => reconstruct_snapshot(names, &mut ledger, &mut report),
    }
    recover_home(&dest, &mut ledger);

    // The live bind holds the working mount busy; drop it before the
    // recursive unmount.
    let live_bind = hacks::live_bind_target(&dest);
    if mounts::is_mountpoint(&live_bind).unwrap_or(false) {
        if let Err(e) = mounts::umount(&live_bind) {
            warn(&format!("Failed to unmount {}: {e:#}", live_bind.display()));
        }
    }

    ledger::cleanup(&ledger);

    println!("Unmounted {}", dest.display());
    if let Some(source) = &report.source {
        println!("  LiveOS source: {}", source.display());
    }
    if let Some((mountpoint, read_only)) = &report.remaining_mount {
        if *read_only {
            println!(
                "  Source mount {} remains mounted read-only",
                mountpoint.display()
            );
        }
    }
    Ok(report)
}

/// Record a loop device with its current backing file, returning the
/// backing path. A backing file under the private temp convention is
/// deleted after detach.
fn record_loop(device: PathBuf, ledger: &mut Ledger) -> Option<PathBuf> {
    if let Some(existing) = ledger.loops.iter().find(|r| r.device == device) {
        return Some(existing.backing.clone());
    }
    match loopdev::backing_file(&device) {
        Ok(Some(backing)) => {
            if temp::is_private_temp(&backing) {
                ledger.record_temp_file(backing.clone());
            }
            ledger.record_loop(device, backing.clone());
            Some(backing)
        }
        Ok(None) => None,
        Err(e) => {
            warn(&format!("Could not query {}: {e:#}", device.display()));
            None
        }
    }
}

/// Record the loop device named by a device-mapper table field, and
/// follow its backing file outward when asked.
fn record_table_loop(field: &str, follow: bool, ledger: &mut Ledger, report: &mut UnmountReport) {
    let Some(device) = devmapper::loop_device_from_field(field) else {
        return;
    };
    let backing = record_loop(device, ledger);
    if follow {
        if let Some(backing) = backing {
            record_outer_mounts(&backing, ledger, report);
        }
    }
}

/// Walk outward from a file toward the original medium, recording
/// every session-created (private temp) mount level on the way. Stops
/// at the first pre-existing mount, which is where the source lives.
fn record_outer_mounts(image: &Path, ledger: &mut Ledger, report: &mut UnmountReport) {
    let mut chain: Vec<MountRecord> = Vec::new();
    let mut current = image.to_path_buf();

    // At most: squashfs mount, working mount, then the boundary.
    for _ in 0..3 {
        let outer = match mounts::mount_containing(&current) {
            Ok(Some(entry)) => entry,
            Ok(None) => break,
            Err(e) => {
                warn(&format!("Could not query {}: {e:#}", current.display()));
                break;
            }
        };

        if !temp::is_private_temp(&outer.target) {
            report.source = Some(current);
            let read_only = outer.read_only();
            report.remaining_mount = Some((outer.target, read_only));
            break;
        }

        chain.push(MountRecord::created_temp(outer.target.clone()));
        let device = PathBuf::from(&outer.source);
        if !loopdev::is_loop_device(&device) {
            break;
        }
        match loopdev::backing_file(&device) {
            Ok(Some(backing)) => current = backing,
            Ok(None) => break,
            Err(e) => {
                warn(&format!("Could not query {}: {e:#}", device.display()));
                break;
            }
        }
    }

    // The ledger keeps mounts in creation order (outermost first) so
    // cleanup's reverse walk unmounts inner levels first.
    chain.reverse();
    chain.append(&mut ledger.mounts);
    ledger.mounts = chain;
}

/// Recover an OverlayFS session: layer directories from the mount
/// options, then the mount chain behind the base layer.
fn reconstruct_overlay(entry: &mounts::MountEntry, ledger: &mut Ledger, report: &mut UnmountReport) {
    let options = mounts::parse_overlay_options(&entry.options);
    if options.lowerdirs.is_empty() {
        warn("Overlay mount has no lowerdir; unmounting the destination only");
        return;
    }

    // Temporary upper/work directories share one private parent.
    for dir in options.upperdir.iter().chain(options.workdir.iter()) {
        if let Some(parent) = dir.parent() {
            if temp::is_private_temp(parent) && !ledger.temp_dirs.contains(&parent.to_path_buf()) {
                ledger.record_temp_dir(parent.to_path_buf());
            }
        }
    }

    // The base layer is the lowerdir component that is itself a mount
    // point; a persistent overlay lowered in front of it is a plain
    // directory.
    let mut base: Option<mounts::MountEntry> = None;
    for lower in &options.lowerdirs {
        match mounts::mount_at(lower) {
            Ok(Some(found)) => {
                base = Some(found);
                break;
            }
            Ok(None) => {}
            Err(e) => warn(&format!("Could not query {}: {e:#}", lower.display())),
        }
    }
    let Some(base) = base else {
        warn("Could not identify the overlay base layer");
        return;
    };

    if temp::is_private_temp(&base.target) {
        ledger.record_mount(MountRecord::created_temp(base.target.clone()));
    }
    let base_device = PathBuf::from(&base.source);
    if loopdev::is_loop_device(&base_device) {
        match loopdev::backing_file(&base_device) {
            Ok(Some(backing)) => record_outer_mounts(&backing, ledger, report),
            Ok(None) => {}
            Err(e) => warn(&format!("Could not query {}: {e:#}", base_device.display())),
        }
    }
}

/// Recover a snapshot session from its device-mapper tables: the
/// copy-on-write and base loop devices of `live-rw[.X]`, plus the
/// chained `live-ro[.X]` pair when the session was read-only over a
/// persistent overlay.
fn reconstruct_snapshot(names: DmNames, ledger: &mut Ledger, report: &mut UnmountReport) {
    ledger.dm_names = Some(names);

    let table = match devmapper::table(&names.live_rw()) {
        Ok(Some(line)) => line,
        Ok(None) => {
            warn(&format!("{} has no table; removing by name only", names.live_rw()));
            return;
        }
        Err(e) => {
            warn(&format!("Could not query {}: {e:#}", names.live_rw()));
            return;
        }
    };
    let Some(DmTable::Snapshot { origin, cow }) = devmapper::parse_table(&table) else {
        warn(&format!("{} is not a snapshot target; removing by name only", names.live_rw()));
        return;
    };

    record_table_loop(&cow, false, ledger, report);

    if devmapper::loop_device_from_field(&origin).is_some() {
        record_table_loop(&origin, true, ledger, report);
        return;
    }

    // Origin is not a loop device: a read-only session chains live-rw
    // on a live-ro snapshot of base plus persistent overlay.
    match devmapper::table(&names.live_ro()) {
        Ok(Some(line)) => match devmapper::parse_table(&line) {
            Some(DmTable::Snapshot {
                origin: base,
                cow: persistent,
            }) => {
                record_table_loop(&persistent, false, ledger, report);
                record_table_loop(&base, true, ledger, report);
            }
            _ => warn(&format!("Unrecognized {} table: {line}", names.live_ro())),
        },
        Ok(None) => warn(&format!(
            "{} origin {origin} is neither a loop device nor {}",
            names.live_rw(),
            names.live_ro()
        )),
        Err(e) => warn(&format!("Could not query {}: {e:#}", names.live_ro())),
    }
}

/// Recover the home mount and its devices, tolerating every legal
/// shape: absent, direct loop mount, direct encrypted mount, or
/// snapshot over either.
fn recover_home(dest: &Path, ledger: &mut Ledger) {
    // Tables first, by session names, when the root already gave us a
    // suffix.
    if let Some(names) = ledger.dm_names {
        recover_home_tables(names, ledger);
    }

    let home = dest.join("home");
    let entry = match mounts::mount_at(&home) {
        Ok(Some(entry)) => entry,
        Ok(None) => return,
        Err(e) => {
            warn(&format!("Could not query {}: {e:#}", home.display()));
            return;
        }
    };
    ledger.home_mount = Some(home);

    let device = PathBuf::from(&entry.source);
    if loopdev::is_loop_device(&device) {
        record_loop(device, ledger);
        return;
    }

    // An OverlayFS root session has no live-rw to take the suffix
    // from; recover it from the home device name instead.
    if ledger.dm_names.is_none() {
        if let Some(names) = devmapper::name_from_mapper_path(&device)
            .and_then(DmNames::from_home_device)
        {
            ledger.dm_names = Some(names);
            recover_home_tables(names, ledger);
        }
    }
}

fn recover_home_tables(names: DmNames, ledger: &mut Ledger) {
    let mut ignored = UnmountReport::default();

    if let Ok(Some(line)) = devmapper::table(&names.home()) {
        match devmapper::parse_table(&line) {
            Some(DmTable::Snapshot { origin, cow }) => {
                record_table_loop(&cow, false, ledger, &mut ignored);
                record_table_loop(&origin, false, ledger, &mut ignored);
            }
            _ => warn(&format!("Unrecognized {} table: {line}", names.home())),
        }
    }

    if let Ok(Some(line)) = devmapper::table(&names.enc_home()) {
        match devmapper::parse_table(&line) {
            Some(DmTable::Crypt { device }) => {
                record_table_loop(&device, false, ledger, &mut ignored);
            }
            _ => warn(&format!("Unrecognized {} table: {line}", names.enc_home())),
        }
    }
}
