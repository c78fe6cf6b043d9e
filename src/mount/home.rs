//! Optional home image handling.
//!
//! A `home.img` in the LiveOS directory is mounted at `<dest>/home`,
//! opened through LUKS first when it is encrypted. Writable sessions
//! mount it directly so changes persist; read-only sessions put a
//! temporary snapshot in front of it.

use anyhow::{Context, Result};
use std::fs;
use std::io::Read;
use std::path::{Path, PathBuf};

use crate::introspect::{devmapper, loopdev, mounts};
use crate::ledger::Ledger;
use crate::preflight;
use crate::process::Cmd;
use crate::temp;

const HOME_IMAGE: &str = "home.img";

/// LUKS header magic, shared by LUKS1 and LUKS2.
const LUKS_MAGIC: [u8; 6] = [0x4c, 0x55, 0x4b, 0x53, 0xba, 0xbe];

/// Whether the file starts with a LUKS header. Detected from the file
/// itself so a missing cryptsetup only matters for images that
/// actually need it.
pub fn is_luks_image(path: &Path) -> Result<bool> {
    let mut file = fs::File::open(path)
        .with_context(|| format!("Failed to open {}", path.display()))?;
    let mut magic = [0u8; 6];
    match file.read_exact(&mut magic) {
        Ok(()) => Ok(magic == LUKS_MAGIC),
        // Shorter than a header cannot be LUKS.
        Err(e) if e.kind() == std::io::ErrorKind::UnexpectedEof => Ok(false),
        Err(e) => Err(e).with_context(|| format!("Failed to read {}", path.display())),
    }
}

/// Mount the home image under the destination if one exists.
pub fn setup_home(
    liveos_dir: &Path,
    dest: &Path,
    read_only: bool,
    tmpdir: &Path,
    home_ovl_size_mib: u64,
    ledger: &mut Ledger,
) -> Result<()> {
    let image = liveos_dir.join(HOME_IMAGE);
    if !image.is_file() {
        return Ok(());
    }
    println!("  Home image: {}", image.display());

    let home_loop = loopdev::attach(&image, read_only)?;
    ledger.record_loop(home_loop.clone(), image.clone());

    let base_device = if is_luks_image(&image)? {
        preflight::require_cryptsetup()?;
        let names = super::ensure_dm_names(ledger)?;
        open_encrypted(&home_loop, &names.enc_home(), read_only)?
    } else {
        home_loop
    };

    let device = if read_only {
        // Temporary snapshot so a read-only session never writes the
        // image. Home overlays get their own, larger default size.
        let names = super::ensure_dm_names(ledger)?;
        let cow_file = temp::make_sparse_temp_file(tmpdir, "home-overlay", home_ovl_size_mib)?;
        ledger.record_temp_file(cow_file.clone());
        let cow_loop = loopdev::attach(&cow_file, false)?;
        ledger.record_loop(cow_loop.clone(), cow_file);
        devmapper::create_snapshot(&names.home(), &base_device, &cow_loop, false)?
    } else {
        base_device
    };

    let home_mount = dest.join("home");
    fs::create_dir_all(&home_mount)
        .with_context(|| format!("Failed to create {}", home_mount.display()))?;
    mounts::mount_device(&device, &home_mount, false)?;
    ledger.home_mount = Some(home_mount.clone());
    println!("  Mounted home at {}", home_mount.display());
    Ok(())
}

/// Open a LUKS volume on `device` under the given mapper name. The
/// passphrase prompt goes straight to the terminal.
fn open_encrypted(device: &Path, name: &str, read_only: bool) -> Result<PathBuf> {
    let mut cmd = Cmd::new("cryptsetup").arg("open");
    if read_only {
        cmd = cmd.arg("--readonly");
    }
    cmd.arg_path(device)
        .arg(name)
        .error_msg(format!("Failed to open encrypted home as {name}"))
        .run_interactive()?;
    Ok(devmapper::mapper_path(name))
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    #[test]
    fn test_is_luks_image_detects_magic() {
        let dir = TempDir::new().unwrap();
        let image = dir.path().join("home.img");
        let mut content = LUKS_MAGIC.to_vec();
        content.extend_from_slice(&[0u8; 64]);
        fs::write(&image, content).unwrap();

        assert!(is_luks_image(&image).unwrap());
    }

    #[test]
    fn test_is_luks_image_plain_filesystem() {
        let dir = TempDir::new().unwrap();
        let image = dir.path().join("home.img");
        fs::write(&image, vec![0u8; 128]).unwrap();

        assert!(!is_luks_image(&image).unwrap());
    }

    #[test]
    fn test_is_luks_image_short_file() {
        let dir = TempDir::new().unwrap();
        let image = dir.path().join("home.img");
        fs::write(&image, b"LU").unwrap();

        assert!(!is_luks_image(&image).unwrap());
    }

    #[test]
    fn test_setup_home_without_image_is_noop() {
        let dir = TempDir::new().unwrap();
        let mut ledger = Ledger::new();

        setup_home(dir.path(), dir.path(), false, dir.path(), 64, &mut ledger).unwrap();
        assert!(ledger.loops.is_empty());
        assert!(ledger.home_mount.is_none());
    }
}
