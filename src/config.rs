//! Configuration management for liveimage-mount.
//!
//! Reads defaults from .env file and environment variables; command-line
//! flags override both. Environment variables take precedence over .env
//! (main loads .env into the environment via dotenvy before this runs).

use std::path::PathBuf;

/// Default size of a synthesized overlay file for the root image, in MiB.
pub const DEFAULT_OVL_SIZE_MIB: u64 = 32 * 1024;

/// Default size of a synthesized overlay file for home.img, in MiB.
///
/// Home overlays default larger than root overlays: a home filesystem is
/// where a live session actually accumulates writes.
pub const DEFAULT_HOME_OVL_SIZE_MIB: u64 = 64 * 1024;

/// Default parent directory for temporary mount points and overlay files.
///
/// /var/tmp rather than /tmp: sparse overlay files can grow large and /tmp
/// is commonly tmpfs-backed.
pub const DEFAULT_TMPDIR: &str = "/var/tmp";

/// Tool configuration.
#[derive(Debug, Clone)]
pub struct Config {
    /// Parent directory for temporary mount points and overlay files.
    pub tmpdir: PathBuf,
    /// Synthesized root overlay size in MiB.
    pub ovl_size_mib: u64,
    /// Synthesized home overlay size in MiB.
    pub home_ovl_size_mib: u64,
}

impl Config {
    /// Load configuration from the environment.
    pub fn load() -> Self {
        let tmpdir = std::env::var("LIVEIMAGE_TMPDIR")
            .map(PathBuf::from)
            .unwrap_or_else(|_| PathBuf::from(DEFAULT_TMPDIR));

        let ovl_size_mib = env_u64("LIVEIMAGE_OVLSIZE_MIB", DEFAULT_OVL_SIZE_MIB);
        let home_ovl_size_mib = env_u64("LIVEIMAGE_HOME_OVLSIZE_MIB", DEFAULT_HOME_OVL_SIZE_MIB);

        Self {
            tmpdir,
            ovl_size_mib,
            home_ovl_size_mib,
        }
    }
}

impl Default for Config {
    fn default() -> Self {
        Self {
            tmpdir: PathBuf::from(DEFAULT_TMPDIR),
            ovl_size_mib: DEFAULT_OVL_SIZE_MIB,
            home_ovl_size_mib: DEFAULT_HOME_OVL_SIZE_MIB,
        }
    }
}

fn env_u64(key: &str, default: u64) -> u64 {
    match std::env::var(key) {
        Ok(value) => match value.trim().parse() {
            Ok(parsed) => parsed,
            Err(_) => {
                eprintln!("  [WARN] {} is not a number ('{}'), using {}", key, value, default);
                default
            }
        },
        Err(_) => default,
    }
}
