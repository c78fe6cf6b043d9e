//! Kernel-state introspection primitives.
//!
//! Unmounting has no session file to read: everything the mount phase
//! created must be re-derivable from the live mount table, device-mapper
//! tables, and loop backing-file links. Each wire format gets its own
//! small parser here so the reconstruction logic stays free of inline
//! string slicing.

pub mod blockdev;
pub mod devmapper;
pub mod loopdev;
pub mod mounts;
