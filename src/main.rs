//! liveimage-mount - mount a LiveOS image into a usable root tree.
//!
//! Mounts an ISO, block device, or directory holding a LiveOS layout
//! (squashfs root image plus optional persistence overlay), optionally
//! runs a command or shell inside it, and tears the whole device stack
//! back down later by re-deriving it from live kernel state.

use anyhow::Result;
use clap::Parser;
use std::os::unix::process::ExitStatusExt;
use std::path::PathBuf;
use std::process::{ExitCode, ExitStatus};

use liveimage_mount::config::Config;
use liveimage_mount::ledger;
use liveimage_mount::mount::{self, MountRequest};
use liveimage_mount::preflight;
use liveimage_mount::shell;
use liveimage_mount::unmount;

#[derive(Parser)]
#[command(name = "liveimage-mount")]
#[command(about = "Mount a LiveOS image and run a command or shell inside it")]
#[command(
    after_help = "EXAMPLES:\n  liveimage-mount Live.iso /mnt/live\n  liveimage-mount --chroot --mount-hacks /dev/sdb1 /mnt/live dnf check-update\n  liveimage-mount --persist Live.iso /mnt/live\n  liveimage-mount -u /mnt/live"
)]
struct Cli {
    /// Unmount the LiveOS at MOUNTPOINT and tear down its devices
    #[arg(short = 'u', long, visible_alias = "umount")]
    unmount: bool,

    /// Never write the persistent overlay; writes go to a discarded
    /// temporary layer
    #[arg(short = 'r', long)]
    read_only: bool,

    /// Run the command (or shell) chrooted into the mount
    #[arg(long)]
    chroot: bool,

    /// Bind host /proc, /sys, /dev and friends into the mount
    #[arg(long)]
    mount_hacks: bool,

    /// Leave everything mounted on exit, for a later -u
    #[arg(long)]
    persist: bool,

    /// Overlay file or directory to persist writes into
    #[arg(short = 'o', long, value_name = "PATH")]
    overlay: Option<PathBuf>,

    /// Size of temporary overlay files, in MiB
    #[arg(short = 's', long = "ovlsize", value_name = "MIB")]
    ovlsize: Option<u64>,

    /// Host DNF cache directory to bind into the mount
    #[arg(short = 'f', long = "dnfcache", value_name = "PATH")]
    dnfcache: Option<PathBuf>,

    /// Directory for temporary mount points and overlay files
    #[arg(short = 't', long, value_name = "PATH")]
    tmpdir: Option<PathBuf>,

    /// LiveOS source: ISO file, block device, or directory
    source: Option<PathBuf>,

    /// Where to mount it
    mountpoint: Option<PathBuf>,

    /// Command to run inside the mount (default: an interactive shell)
    #[arg(trailing_var_arg = true, allow_hyphen_values = true)]
    command: Vec<String>,
}

/// The two invocation shapes, after positional validation.
enum Invocation {
    Mount {
        source: PathBuf,
        mountpoint: PathBuf,
        command: Vec<String>,
    },
    Unmount {
        mountpoint: PathBuf,
    },
}

impl Cli {
    /// Sort the loose positionals into an invocation. Missing
    /// positionals are a usage error, reported with exit code 2.
    fn invocation(self) -> Result<Invocation, String> {
        if self.unmount {
            let mountpoint = self
                .source
                .ok_or("the --unmount form needs a MOUNTPOINT argument")?;
            if self.mountpoint.is_some() || !self.command.is_empty() {
                return Err("the --unmount form takes exactly one MOUNTPOINT argument".to_string());
            }
            return Ok(Invocation::Unmount { mountpoint });
        }

        let source = self.source.ok_or("missing SOURCE argument")?;
        let mountpoint = self.mountpoint.ok_or("missing MOUNTPOINT argument")?;
        Ok(Invocation::Mount {
            source,
            mountpoint,
            command: self.command,
        })
    }
}

fn main() -> ExitCode {
    let cli = Cli::parse();

    // Load .env if present
    dotenvy::dotenv().ok();
    let config = Config::load();

    let read_only = cli.read_only;
    let chroot = cli.chroot;
    let mount_hacks = cli.mount_hacks;
    let persist = cli.persist;
    let overlay = cli.overlay.clone();
    let ovl_size_mib = cli.ovlsize.unwrap_or(config.ovl_size_mib);
    let dnf_cache = cli.dnfcache.clone();
    let tmpdir = cli.tmpdir.clone().unwrap_or_else(|| config.tmpdir.clone());

    let invocation = match cli.invocation() {
        Ok(invocation) => invocation,
        Err(message) => {
            eprintln!("error: {message}");
            eprintln!("Try 'liveimage-mount --help' for usage.");
            return ExitCode::from(2);
        }
    };

    let result = match invocation {
        Invocation::Unmount { mountpoint } => run_unmount(&mountpoint),
        Invocation::Mount {
            source,
            mountpoint,
            command,
        } => {
            let request = MountRequest {
                source,
                dest: mountpoint,
                read_only,
                mount_hacks,
                overlay,
                dnf_cache,
                tmpdir,
                ovl_size_mib,
                home_ovl_size_mib: config.home_ovl_size_mib,
            };
            run_mount(&request, chroot, persist, &command)
        }
    };

    match result {
        Ok(code) => code,
        Err(e) => {
            eprintln!("Error: {e:#}");
            ExitCode::FAILURE
        }
    }
}

fn run_unmount(mountpoint: &std::path::Path) -> Result<ExitCode> {
    preflight::check_root()?;
    preflight::check_host_tools()?;

    unmount::unmount(mountpoint)?;
    Ok(ExitCode::SUCCESS)
}

fn run_mount(
    request: &MountRequest,
    chroot: bool,
    persist: bool,
    command: &[String],
) -> Result<ExitCode> {
    preflight::check_root()?;
    preflight::check_host_tools()?;

    let session = mount::mount(request)?;

    // --persist with no command just leaves the mount in place.
    let status = if command.is_empty() && persist {
        None
    } else {
        Some(shell::run_inside(&request.dest, chroot, command))
    };

    if persist {
        println!(
            "Leaving {} mounted; run 'liveimage-mount -u {}' to unmount",
            request.dest.display(),
            request.dest.display()
        );
    } else {
        ledger::cleanup(&session);
    }

    match status {
        None => Ok(ExitCode::SUCCESS),
        Some(Ok(status)) => Ok(exit_code_for(status)),
        Some(Err(e)) => Err(e),
    }
}

/// Map the launched command's exit to our own, shell-style: its code
/// when it has one, 128 plus the signal number when it was killed.
fn exit_code_for(status: ExitStatus) -> ExitCode {
    if status.success() {
        return ExitCode::SUCCESS;
    }
    let code = status
        .code()
        .or_else(|| status.signal().map(|sig| 128 + sig))
        .unwrap_or(1);
    ExitCode::from(u8::try_from(code).unwrap_or(1))
}
