//! liveimage-mount library exports for testing.
//!
//! This module exposes internal components for integration testing.

pub mod config;
pub mod error;
pub mod introspect;
pub mod ledger;
pub mod mount;
pub mod preflight;
pub mod process;
pub mod shell;
pub mod temp;
pub mod unmount;
