//! Device-mapper target management via dmsetup.
//!
//! Mount sessions create `snapshot` targets named `live-rw`/`live-ro`
//! (and `Home`/`EncHome` for home images). When a name is taken by an
//! earlier session a numeric suffix keeps the new session's targets
//! apart, and the unmount path recovers the suffix from the mounted
//! device name.

use anyhow::{Context, Result};
use std::path::{Path, PathBuf};

use crate::introspect::loopdev;
use crate::process::Cmd;

pub const LIVE_RW: &str = "live-rw";
pub const LIVE_RO: &str = "live-ro";
pub const HOME: &str = "Home";
pub const ENC_HOME: &str = "EncHome";

/// Snapshot chunk size in 512-byte sectors.
const SNAPSHOT_CHUNK_SECTORS: u32 = 8;

/// The device-mapper names used by one mount session. All four share a
/// single collision-avoidance suffix so the unmount path can find the
/// session's targets from the root device name alone.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct DmNames {
    suffix: Option<u32>,
}

impl DmNames {
    pub fn bare() -> Self {
        DmNames { suffix: None }
    }

    pub fn with_suffix(suffix: u32) -> Self {
        DmNames {
            suffix: Some(suffix),
        }
    }

    /// Recover the session names from a `<base>[.X]` target name.
    /// Returns `None` for anything else (including `live-rwX` without
    /// the dot, which is some other device).
    pub fn from_name(base: &str, name: &str) -> Option<Self> {
        if name == base {
            return Some(DmNames::bare());
        }
        let suffix = name.strip_prefix(base)?.strip_prefix('.')?;
        suffix.parse().ok().map(DmNames::with_suffix)
    }

    pub fn from_live_rw(name: &str) -> Option<Self> {
        Self::from_name(LIVE_RW, name)
    }

    /// Recover the session names from a mounted home device, which is
    /// `Home[.X]` (snapshot) or `EncHome[.X]` (direct encrypted mount).
    pub fn from_home_device(name: &str) -> Option<Self> {
        Self::from_name(HOME, name).or_else(|| Self::from_name(ENC_HOME, name))
    }

    fn apply(&self, base: &str) -> String {
        match self.suffix {
            Some(n) => format!("{base}.{n}"),
            None => base.to_string(),
        }
    }

    pub fn live_rw(&self) -> String {
        self.apply(LIVE_RW)
    }

    pub fn live_ro(&self) -> String {
        self.apply(LIVE_RO)
    }

    pub fn home(&self) -> String {
        self.apply(HOME)
    }

    pub fn enc_home(&self) -> String {
        self.apply(ENC_HOME)
    }
}

/// Pick the lowest suffix (bare names first) at which none of the four
/// session names collides with an existing device-mapper target. Best
/// effort only; a concurrent invocation can still race to the same
/// suffix between this query and the create.
pub fn allocate_names(existing: &[String]) -> DmNames {
    let taken = |candidate: &DmNames| {
        [
            candidate.live_rw(),
            candidate.live_ro(),
            candidate.home(),
            candidate.enc_home(),
        ]
        .iter()
        .any(|name| existing.iter().any(|e| e == name))
    };

    let bare = DmNames::bare();
    if !taken(&bare) {
        return bare;
    }
    for suffix in 1.. {
        let candidate = DmNames::with_suffix(suffix);
        if !taken(&candidate) {
            return candidate;
        }
    }
    unreachable!()
}

/// The `/dev/mapper/<name>` node for a target.
pub fn mapper_path(name: &str) -> PathBuf {
    Path::new("/dev/mapper").join(name)
}

/// The target name of a `/dev/mapper/<name>` path, if it is one.
pub fn name_from_mapper_path(device: &Path) -> Option<&str> {
    let parent = device.parent()?;
    if parent != Path::new("/dev/mapper") {
        return None;
    }
    device.file_name()?.to_str()
}

// ---------------------------------------------------------------------------
// Table parsing
// ---------------------------------------------------------------------------

/// A parsed device-mapper table line. Device fields are kept verbatim
/// (`maj:min` pairs or device paths) for the caller to resolve.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum DmTable {
    /// `start len snapshot origin cow persistent chunksize`
    Snapshot { origin: String, cow: String },
    /// `start len linear device offset`
    Linear { device: String },
    /// `start len crypt cipher key iv_offset device offset ...`
    Crypt { device: String },
}

/// Parse one `dmsetup table` line. Returns `None` for target types the
/// tool never creates or for lines too short to carry their fields, so
/// the unmount path treats them as absent components.
pub fn parse_table(line: &str) -> Option<DmTable> {
    let fields: Vec<&str> = line.split_whitespace().collect();
    match fields.get(2)? {
        &"snapshot" if fields.len() >= 5 => Some(DmTable::Snapshot {
            origin: fields[3].to_string(),
            cow: fields[4].to_string(),
        }),
        &"linear" if fields.len() >= 4 => Some(DmTable::Linear {
            device: fields[3].to_string(),
        }),
        &"crypt" if fields.len() >= 7 => Some(DmTable::Crypt {
            device: fields[6].to_string(),
        }),
        _ => None,
    }
}

/// Resolve a table device field to a loop device path, if it names one
/// (either as a `7:N` pair or a `/dev/loopN` path).
pub fn loop_device_from_field(field: &str) -> Option<PathBuf> {
    if field.starts_with('/') {
        let path = PathBuf::from(field);
        return loopdev::is_loop_device(&path).then_some(path);
    }
    loopdev::from_major_minor(field)
}

/// Parse `dmsetup ls` output into target names. The no-devices case
/// prints a sentence instead of rows.
pub fn parse_ls(output: &str) -> Vec<String> {
    if output.trim() == "No devices found" {
        return Vec::new();
    }
    output
        .lines()
        .filter_map(|line| line.split_whitespace().next())
        .map(str::to_string)
        .collect()
}

// ---------------------------------------------------------------------------
// dmsetup execution
// ---------------------------------------------------------------------------

/// All current device-mapper target names.
pub fn list_names() -> Result<Vec<String>> {
    let result = Cmd::new("dmsetup")
        .arg("ls")
        .error_msg("Failed to list device-mapper targets")
        .run()?;
    Ok(parse_ls(&result.stdout))
}

/// Whether a target of this name exists.
pub fn exists(name: &str) -> Result<bool> {
    let result = Cmd::new("dmsetup")
        .args(["info", name])
        .allow_fail()
        .run()?;
    Ok(result.success())
}

/// The table line of a target, or `None` if it does not exist.
pub fn table(name: &str) -> Result<Option<String>> {
    let result = Cmd::new("dmsetup")
        .args(["table", name])
        .allow_fail()
        .run()?;
    if !result.success() {
        return Ok(None);
    }
    Ok(Some(result.stdout_trimmed().to_string()))
}

fn sectors_of(device: &Path) -> Result<u64> {
    let result = Cmd::new("blockdev")
        .arg("--getsz")
        .arg_path(device)
        .error_msg(format!("Failed to read size of {}", device.display()))
        .run()?;
    result
        .stdout_trimmed()
        .parse()
        .with_context(|| format!("Unparseable blockdev size for {}", device.display()))
}

/// Create a persistent snapshot target over `origin` with `cow` as the
/// copy-on-write store, sized to the origin device. A read-only target
/// never writes to its copy-on-write store.
pub fn create_snapshot(name: &str, origin: &Path, cow: &Path, read_only: bool) -> Result<PathBuf> {
    let sectors = sectors_of(origin)?;
    let table = format!(
        "0 {} snapshot {} {} P {}",
        sectors,
        origin.display(),
        cow.display(),
        SNAPSHOT_CHUNK_SECTORS
    );

    let mut cmd = Cmd::new("dmsetup").arg("create");
    if read_only {
        cmd = cmd.arg("--readonly");
    }
    cmd.arg(name)
        .stdin(table)
        .error_msg(format!("Failed to create snapshot target {name}"))
        .run()?;
    Ok(mapper_path(name))
}

/// Remove a target, retrying while the device is briefly in use.
pub fn remove(name: &str) -> Result<()> {
    Cmd::new("dmsetup")
        .args(["remove", "--retry", name])
        .error_msg(format!("Failed to remove device-mapper target {name}"))
        .run()?;
    Ok(())
}

/// Remove a target if it exists; reports whether a removal happened.
pub fn remove_if_exists(name: &str) -> Result<bool> {
    if !exists(name)? {
        return Ok(false);
    }
    remove(name)?;
    Ok(true)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_names_bare_and_suffixed() {
        let bare = DmNames::bare();
        assert_eq!(bare.live_rw(), "live-rw");
        assert_eq!(bare.enc_home(), "EncHome");

        let suffixed = DmNames::with_suffix(3);
        assert_eq!(suffixed.live_rw(), "live-rw.3");
        assert_eq!(suffixed.live_ro(), "live-ro.3");
        assert_eq!(suffixed.home(), "Home.3");
        assert_eq!(suffixed.enc_home(), "EncHome.3");
    }

    #[test]
    fn test_names_from_live_rw() {
        assert_eq!(DmNames::from_live_rw("live-rw"), Some(DmNames::bare()));
        assert_eq!(
            DmNames::from_live_rw("live-rw.2"),
            Some(DmNames::with_suffix(2))
        );
        assert_eq!(DmNames::from_live_rw("live-ro"), None);
        assert_eq!(DmNames::from_live_rw("live-rw2"), None);
        assert_eq!(DmNames::from_live_rw("live-rw.x"), None);
        assert_eq!(DmNames::from_live_rw("live-rw."), None);
    }

    #[test]
    fn test_names_from_home_device() {
        assert_eq!(DmNames::from_home_device("Home"), Some(DmNames::bare()));
        assert_eq!(
            DmNames::from_home_device("EncHome.4"),
            Some(DmNames::with_suffix(4))
        );
        assert_eq!(DmNames::from_home_device("HomeBrew"), None);
        assert_eq!(DmNames::from_home_device("live-rw"), None);
    }

    #[test]
    fn test_allocate_names_prefers_bare() {
        let existing = vec!["vg0-root".to_string(), "cryptswap".to_string()];
        assert_eq!(allocate_names(&existing), DmNames::bare());
    }

    #[test]
    fn test_allocate_names_skips_taken_suffixes() {
        let existing = vec![
            "live-rw".to_string(),
            "live-ro".to_string(),
            "live-rw.1".to_string(),
        ];
        assert_eq!(allocate_names(&existing), DmNames::with_suffix(2));
    }

    #[test]
    fn test_allocate_names_any_of_the_four_collides() {
        // A leftover Home target alone must still push the session to
        // a suffix, so all four names stay consistent.
        let existing = vec!["Home".to_string()];
        assert_eq!(allocate_names(&existing), DmNames::with_suffix(1));
    }

    #[test]
    fn test_parse_table_snapshot() {
        let table = parse_table("0 20971520 snapshot 7:3 7:4 P 8");
        assert_eq!(
            table,
            Some(DmTable::Snapshot {
                origin: "7:3".to_string(),
                cow: "7:4".to_string(),
            })
        );
    }

    #[test]
    fn test_parse_table_crypt_device_field() {
        let table =
            parse_table("0 409600 crypt aes-xts-plain64 00000000 0 7:5 4096 1 allow_discards");
        assert_eq!(
            table,
            Some(DmTable::Crypt {
                device: "7:5".to_string(),
            })
        );
    }

    #[test]
    fn test_parse_table_linear() {
        let table = parse_table("0 8388608 linear 7:2 0");
        assert_eq!(
            table,
            Some(DmTable::Linear {
                device: "7:2".to_string(),
            })
        );
    }

    #[test]
    fn test_parse_table_rejects_malformed() {
        assert_eq!(parse_table(""), None);
        assert_eq!(parse_table("0 1024"), None);
        assert_eq!(parse_table("0 1024 snapshot 7:3"), None);
        assert_eq!(parse_table("0 1024 mirror 7:3 7:4"), None);
    }

    #[test]
    fn test_loop_device_from_field() {
        assert_eq!(
            loop_device_from_field("7:4"),
            Some(PathBuf::from("/dev/loop4"))
        );
        assert_eq!(
            loop_device_from_field("/dev/loop9"),
            Some(PathBuf::from("/dev/loop9"))
        );
        assert_eq!(loop_device_from_field("253:0"), None);
        assert_eq!(loop_device_from_field("/dev/sda2"), None);
    }

    #[test]
    fn test_parse_ls() {
        let output = "live-rw\t(253, 0)\nlive-ro\t(253, 1)\nvg0-root\t(253, 2)\n";
        assert_eq!(parse_ls(output), vec!["live-rw", "live-ro", "vg0-root"]);
    }

    #[test]
    fn test_parse_ls_no_devices() {
        assert!(parse_ls("No devices found\n").is_empty());
        assert!(parse_ls("").is_empty());
    }

    #[test]
    fn test_mapper_paths() {
        assert_eq!(mapper_path("live-rw"), PathBuf::from("/dev/mapper/live-rw"));
        assert_eq!(
            name_from_mapper_path(Path::new("/dev/mapper/live-rw.2")),
            Some("live-rw.2")
        );
        assert_eq!(name_from_mapper_path(Path::new("/dev/sda1")), None);
        assert_eq!(name_from_mapper_path(Path::new("live-rw")), None);
    }
}
