//! The mount path: from a LiveOS source to a usable root filesystem.
//!
//! Stages run in dependency order, recording every created resource in
//! a [`Ledger`]. A failure at any stage hands the partial ledger to
//! the shared cleanup before the error surfaces.

pub mod hacks;
pub mod home;
pub mod layout;
pub mod overlay;
pub mod source;

use anyhow::{bail, Result};
use std::path::PathBuf;

use crate::error::LiveMountError;
use crate::introspect::devmapper::{self, DmNames};
use crate::introspect::mounts;
use crate::ledger::{self, Ledger};

/// Everything the planner needs to know, assembled from the command
/// line and the environment configuration.
#[derive(Debug, Clone)]
pub struct MountRequest {
    pub source: PathBuf,
    pub dest: PathBuf,
    pub read_only: bool,
    pub mount_hacks: bool,
    /// Explicit overlay path, overriding discovery.
    pub overlay: Option<PathBuf>,
    /// Host DNF cache to bind when mount hacks are applied.
    pub dnf_cache: Option<PathBuf>,
    pub tmpdir: PathBuf,
    pub ovl_size_mib: u64,
    pub home_ovl_size_mib: u64,
}

/// Allocate the session's device-mapper names on first use. Sessions
/// that never create a mapper target never query dmsetup.
pub(crate) fn ensure_dm_names(ledger: &mut Ledger) -> Result<DmNames> {
    if let Some(names) = ledger.dm_names {
        return Ok(names);
    }
    let names = devmapper::allocate_names(&devmapper::list_names()?);
    if names != DmNames::bare() {
        println!(
            "  Default device-mapper names taken, using {}",
            names.live_rw()
        );
    }
    ledger.dm_names = Some(names);
    Ok(names)
}

fn validate(request: &MountRequest) -> Result<()> {
    if !request.dest.is_dir() {
        bail!(
            "Mount point {} does not exist or is not a directory",
            request.dest.display()
        );
    }
    if mounts::is_mountpoint(&request.dest)? {
        return Err(LiveMountError::AlreadyMounted(request.dest.clone()).into());
    }
    Ok(())
}

fn plan(request: &MountRequest, ledger: &mut Ledger) -> Result<()> {
    let source = source::resolve(&request.source)?;
    println!(
        "Mounting {} ({})",
        source.path.display(),
        source::describe(&source)
    );

    let working =
        source::establish_working_mount(&source, request.read_only, &request.tmpdir, ledger)?;
    let liveos_dir = source::locate_liveos_dir(&working.path);
    println!("  LiveOS directory: {}", liveos_dir.display());

    let root = layout::locate_root_image(&liveos_dir, &request.tmpdir, ledger)?;
    let target = overlay::determine(
        &liveos_dir,
        &root,
        request.overlay.as_deref(),
        request.read_only,
    )?;

    overlay::materialize(
        &target,
        &root,
        &request.dest,
        &request.tmpdir,
        request.ovl_size_mib,
        ledger,
    )?;

    home::setup_home(
        &liveos_dir,
        &request.dest,
        request.read_only,
        &request.tmpdir,
        request.home_ovl_size_mib,
        ledger,
    )?;

    if request.mount_hacks {
        hacks::apply_mount_hacks(&request.dest, request.dnf_cache.as_deref())?;
    }
    hacks::bind_live_mount(&request.dest, &working.path, working.device.as_deref())?;

    println!(
        "Mounted {} at {}",
        source.path.display(),
        request.dest.display()
    );
    Ok(())
}

/// Mount a LiveOS source at the destination, returning the ledger of
/// everything created. On failure the partial state is undone before
/// the error is returned.
pub fn mount(request: &MountRequest) -> Result<Ledger> {
    validate(request)?;

    let mut ledger = Ledger::new();
    ledger.dest = Some(request.dest.clone());

    if let Err(e) = plan(request, &mut ledger) {
        eprintln!("Mount failed, undoing partial setup");
        ledger::cleanup(&ledger);
        return Err(e);
    }
    Ok(ledger)
}
