//! Block device classification via lsblk.

use anyhow::{Context, Result};
use serde::Deserialize;
use std::path::Path;

use crate::process::Cmd;

/// One device row of `lsblk --json` output.
#[derive(Debug, Clone, Deserialize)]
pub struct BlockDevice {
    pub name: String,
    /// Device kind as lsblk reports it: `disk`, `part`, `rom`, `loop`.
    #[serde(rename = "type", default)]
    pub kind: String,
    #[serde(default)]
    pub fstype: Option<String>,
}

impl BlockDevice {
    pub fn is_partition(&self) -> bool {
        self.kind == "part"
    }

    pub fn is_iso9660(&self) -> bool {
        self.fstype.as_deref() == Some("iso9660")
    }
}

#[derive(Debug, Deserialize)]
struct LsblkOutput {
    #[serde(default)]
    blockdevices: Vec<BlockDevice>,
}

/// Parse `lsblk --json` output into its device rows.
pub fn parse_lsblk(json: &str) -> Result<Vec<BlockDevice>> {
    if json.trim().is_empty() {
        return Ok(Vec::new());
    }
    let parsed: LsblkOutput =
        serde_json::from_str(json).context("Unparseable lsblk JSON output")?;
    Ok(parsed.blockdevices)
}

/// Classify a block device node. Returns `None` if lsblk does not know
/// the device.
pub fn probe(device: &Path) -> Result<Option<BlockDevice>> {
    let result = Cmd::new("lsblk")
        .args(["--json", "--nodeps", "--output", "NAME,TYPE,FSTYPE"])
        .arg_path(device)
        .allow_fail()
        .run()?;

    if !result.success() {
        return Ok(None);
    }
    Ok(parse_lsblk(&result.stdout)?.into_iter().next())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parse_lsblk_partition() {
        let json = r#"{
            "blockdevices": [
                {"name": "sdb1", "type": "part", "fstype": "vfat"}
            ]
        }"#;

        let devices = parse_lsblk(json).unwrap();
        assert_eq!(devices.len(), 1);
        assert_eq!(devices[0].name, "sdb1");
        assert!(devices[0].is_partition());
        assert!(!devices[0].is_iso9660());
    }

    #[test]
    fn test_parse_lsblk_iso_device() {
        let json = r#"{
            "blockdevices": [
                {"name": "sr0", "type": "rom", "fstype": "iso9660"}
            ]
        }"#;

        let devices = parse_lsblk(json).unwrap();
        assert!(devices[0].is_iso9660());
        assert!(!devices[0].is_partition());
    }

    #[test]
    fn test_parse_lsblk_null_fstype() {
        // lsblk emits null for fields it cannot determine.
        let json = r#"{
            "blockdevices": [
                {"name": "loop3", "type": "loop", "fstype": null}
            ]
        }"#;

        let devices = parse_lsblk(json).unwrap();
        assert_eq!(devices[0].fstype, None);
    }

    #[test]
    fn test_parse_lsblk_empty() {
        assert!(parse_lsblk("").unwrap().is_empty());
    }
}
