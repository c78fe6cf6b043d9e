//! Error taxonomy for mount and unmount failures.
//!
//! Most failures travel as plain `anyhow` chains. These variants exist for
//! the cases where a caller (or a test) changes behavior on the *kind* of
//! failure rather than its text: validation before any resource exists,
//! unmount refusal, and wrapped command failures.

use std::path::PathBuf;

/// Failure kinds with meaning beyond their message text.
#[derive(Debug, thiserror::Error)]
pub enum LiveMountError {
    /// Source path missing, unreadable, or of an unusable type.
    #[error("invalid LiveOS source '{path}': {reason}")]
    InvalidSource { path: PathBuf, reason: String },

    /// The destination is already a mount target.
    #[error("'{0}' is already a mount point")]
    AlreadyMounted(PathBuf),

    /// Unmount was requested on a mount point this tool did not produce.
    #[error("'{mountpoint}' is not a LiveOS mount (source: {source})")]
    NotALiveMount {
        mountpoint: PathBuf,
        // The `r#` spelling stops thiserror from treating this mount-source
        // string as the Error::source(); to the compiler and all call sites
        // the field is plain `source`.
        r#source: String,
    },

    /// A wrapped OS command exited non-zero.
    #[error("'{command}' failed (exit code {code}){}", fmt_output(.output))]
    ExternalCommandFailure {
        /// Full command line as executed.
        command: String,
        /// Exit code, or -1 when terminated by signal.
        code: i32,
        /// Captured stderr (trimmed; may be empty).
        output: String,
    },

    /// Neither a squashfs nor a raw root image was located.
    #[error("no root filesystem image found under '{0}'")]
    NoRootImageFound(PathBuf),
}

fn fmt_output(output: &str) -> String {
    if output.is_empty() {
        String::new()
    } else {
        format!(":\n{output}")
    }
}
