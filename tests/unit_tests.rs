//! Unit tests for the liveimage-mount parsers and classifiers.
//!
//! These tests exercise pure functions in isolation: the kernel-state
//! parsers the unmount path is built from, name allocation, and the
//! error taxonomy. No root and no external tools required.

mod helpers;

use helpers::TestEnv;
use liveimage_mount::error::LiveMountError;
use liveimage_mount::introspect::{blockdev, devmapper, loopdev, mounts};
use liveimage_mount::introspect::devmapper::{DmNames, DmTable};
use liveimage_mount::mount::{home, source};
use liveimage_mount::temp;
use regex::Regex;
use std::fs;
use std::path::{Path, PathBuf};

// =============================================================================
// findmnt output parsing
// =============================================================================

#[test]
fn test_parse_findmnt_full_fixture() {
    // Shape of `findmnt --json -o TARGET,SOURCE,FSTYPE,OPTIONS` on a
    // mounted live session plus its home mount.
    let json = r#"{
   "filesystems": [
      {"target":"/mnt/live", "source":"/dev/mapper/live-rw", "fstype":"ext4", "options":"rw,relatime,seclabel"},
      {"target":"/mnt/live/home", "source":"/dev/mapper/Home", "fstype":"ext4", "options":"rw,relatime"}
   ]
}"#;

    let rows = mounts::parse_findmnt(json).unwrap();
    assert_eq!(rows.len(), 2);
    assert_eq!(rows[0].source, "/dev/mapper/live-rw");
    assert_eq!(rows[1].target, PathBuf::from("/mnt/live/home"));
    assert!(!rows[0].read_only());
}

#[test]
fn test_parse_findmnt_rejects_non_json() {
    assert!(mounts::parse_findmnt("findmnt: /mnt: not found").is_err());
}

#[test]
fn test_read_only_option_is_matched_exactly() {
    let entry = mounts::MountEntry {
        target: PathBuf::from("/mnt"),
        source: "/dev/sr0".to_string(),
        fstype: "iso9660".to_string(),
        options: "ro".to_string(),
    };
    assert!(entry.read_only());

    // "ro" embedded in another option must not count.
    let tricky = mounts::MountEntry {
        options: "rw,errors=remount-ro,norock".to_string(),
        ..entry
    };
    assert!(!tricky.read_only());
}

#[test]
fn test_parse_overlay_options_from_booted_system_line() {
    // A dracut-booted live root carries extra overlay flags around the
    // three directories; they must not confuse the extraction.
    let options = "rw,relatime,lowerdir=/run/rootfsbase,upperdir=/run/overlayfs,workdir=/run/ovlwork,index=off,metacopy=off";
    let parsed = mounts::parse_overlay_options(options);

    assert_eq!(parsed.lowerdirs, vec![PathBuf::from("/run/rootfsbase")]);
    assert_eq!(parsed.upperdir, Some(PathBuf::from("/run/overlayfs")));
    assert_eq!(parsed.workdir, Some(PathBuf::from("/run/ovlwork")));
}

// =============================================================================
// Device-mapper names and tables
// =============================================================================

#[test]
fn test_suffix_allocation_is_consistent_across_sessions() {
    // Each session takes the lowest free suffix and holds all four
    // names under it; later sessions step past every taken one.
    let mut existing: Vec<String> = vec!["vg0-root".to_string()];

    let first = devmapper::allocate_names(&existing);
    assert_eq!(first, DmNames::bare());
    existing.extend([first.live_rw(), first.live_ro()]);

    let second = devmapper::allocate_names(&existing);
    assert_eq!(second, DmNames::with_suffix(1));
    existing.extend([second.live_rw(), second.home()]);

    let third = devmapper::allocate_names(&existing);
    assert_eq!(third, DmNames::with_suffix(2));
}

#[test]
fn test_parse_table_with_device_paths() {
    // Tables written with device paths instead of major:minor pairs
    // resolve the same way.
    let table = devmapper::parse_table("0 4194304 snapshot /dev/loop3 /dev/loop4 P 8").unwrap();
    let DmTable::Snapshot { origin, cow } = table else {
        panic!("expected snapshot table");
    };

    assert_eq!(
        devmapper::loop_device_from_field(&origin),
        Some(PathBuf::from("/dev/loop3"))
    );
    assert_eq!(
        devmapper::loop_device_from_field(&cow),
        Some(PathBuf::from("/dev/loop4"))
    );
}

#[test]
fn test_mapper_name_recovery_from_mount_source() {
    // The unmount path reads findmnt SOURCE strings like these.
    let names = devmapper::name_from_mapper_path(Path::new("/dev/mapper/live-rw.3"))
        .and_then(DmNames::from_live_rw)
        .unwrap();
    assert_eq!(names, DmNames::with_suffix(3));
    assert_eq!(names.live_ro(), "live-ro.3");
    assert_eq!(names.home(), "Home.3");
}

// =============================================================================
// losetup output parsing
// =============================================================================

#[test]
fn test_backing_file_with_spaces_survives() {
    // Single-column BACK-FILE output keeps paths with spaces whole.
    assert_eq!(
        loopdev::parse_backing_file("/mnt/usb stick/live image.iso\n"),
        Some(PathBuf::from("/mnt/usb stick/live image.iso"))
    );
    assert_eq!(
        loopdev::parse_backing_file("/mnt/usb stick/live image.iso (deleted)\n"),
        Some(PathBuf::from("/mnt/usb stick/live image.iso"))
    );
}

#[test]
fn test_loop_major_minor_resolution() {
    assert_eq!(
        loopdev::from_major_minor("7:0"),
        Some(PathBuf::from("/dev/loop0"))
    );
    // Device-mapper targets (253) and SCSI disks (8) are not loops.
    assert_eq!(loopdev::from_major_minor("253:1"), None);
    assert_eq!(loopdev::from_major_minor("8:16"), None);
}

// =============================================================================
// lsblk output parsing
// =============================================================================

#[test]
fn test_parse_lsblk_classifies_media() {
    let json = r#"{
   "blockdevices": [
      {"name":"sdb", "type":"disk", "fstype":null},
      {"name":"sdb1", "type":"part", "fstype":"ext4"},
      {"name":"sr0", "type":"rom", "fstype":"iso9660"}
   ]
}"#;

    let devices = blockdev::parse_lsblk(json).unwrap();
    assert_eq!(devices.len(), 3);
    assert!(!devices[0].is_partition());
    assert!(devices[1].is_partition());
    assert!(devices[2].is_iso9660());
}

// =============================================================================
// Private temp naming
// =============================================================================

#[test]
fn test_temp_names_follow_the_private_convention() {
    let env = TestEnv::new();

    let dir = temp::make_temp_dir(&env.tmpdir, "squashfs").unwrap();
    let file = temp::make_sparse_temp_file(&env.tmpdir, "overlay", 1).unwrap();

    let pattern = Regex::new(r"^liveos-[a-z-]+\.[A-Za-z0-9]+$").unwrap();
    for path in [&dir, &file] {
        let name = path.file_name().unwrap().to_str().unwrap();
        assert!(
            pattern.is_match(name),
            "temp name '{name}' does not match the private convention"
        );
        assert!(temp::is_private_temp(path));
    }

    temp::remove_temp_dir(&dir);
    temp::remove_temp_file(&file);
}

// =============================================================================
// Source classification
// =============================================================================

#[test]
fn test_resolve_follows_symlinks() {
    let env = TestEnv::new();
    let real = env.source.join("live.iso");
    fs::write(&real, b"image").unwrap();
    let link = env.source.join("latest.iso");
    std::os::unix::fs::symlink(&real, &link).unwrap();

    let resolved = source::resolve(&link).unwrap();
    assert_eq!(resolved.kind, source::SourceKind::IsoFile);
    assert_eq!(resolved.path, real.canonicalize().unwrap());
}

#[test]
fn test_luks_magic_near_miss() {
    let env = TestEnv::new();
    let image = env.source.join("home.img");

    // First four bytes match, the tail does not.
    fs::write(&image, [0x4c, 0x55, 0x4b, 0x53, 0x00, 0x00, 0x00, 0x00]).unwrap();
    assert!(!home::is_luks_image(&image).unwrap());
}

// =============================================================================
// Error taxonomy
// =============================================================================

#[test]
fn test_error_messages_name_their_subjects() {
    let invalid = LiveMountError::InvalidSource {
        path: PathBuf::from("/dev/tty0"),
        reason: "not a block device, image file, or directory".to_string(),
    };
    assert!(invalid.to_string().contains("/dev/tty0"));

    let busy = LiveMountError::AlreadyMounted(PathBuf::from("/mnt/live"));
    assert!(busy.to_string().contains("already a mount point"));

    let missing = LiveMountError::NoRootImageFound(PathBuf::from("/mnt/usb/LiveOS"));
    assert!(missing.to_string().contains("/mnt/usb/LiveOS"));

    let foreign = LiveMountError::NotALiveMount {
        mountpoint: PathBuf::from("/mnt"),
        source: "/dev/mapper/vg0-root".to_string(),
    };
    assert!(foreign.to_string().contains("not a LiveOS mount"));
    assert!(foreign.to_string().contains("/dev/mapper/vg0-root"));
}
