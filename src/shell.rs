//! Launching the user's command or subshell inside the mounted root.

use anyhow::Result;
use std::env;
use std::path::Path;
use std::process::ExitStatus;

use crate::process::Cmd;

/// Shell used when nothing better is known. Inside a chroot the
/// host's $SHELL may not exist, so the chroot subshell always uses
/// this.
const FALLBACK_SHELL: &str = "/bin/bash";

/// Run a command (or an interactive subshell when `command` is empty)
/// inside the mounted tree, blocking until it exits. A non-zero exit
/// is reported through the status, not as an error.
pub fn run_inside(dest: &Path, chroot: bool, command: &[String]) -> Result<ExitStatus> {
    if command.is_empty() {
        println!("Starting a shell in {}; exit it to continue", dest.display());
    }

    let cmd = if chroot {
        let mut cmd = Cmd::new("chroot").arg_path(dest);
        if command.is_empty() {
            cmd = cmd.arg(FALLBACK_SHELL);
        } else {
            cmd = cmd.args(command);
        }
        cmd
    } else if command.is_empty() {
        let shell = env::var("SHELL").unwrap_or_else(|_| FALLBACK_SHELL.to_string());
        Cmd::new(shell).dir(dest)
    } else {
        Cmd::new(&command[0]).args(&command[1..]).dir(dest)
    };

    cmd.allow_fail().run_interactive()
}
