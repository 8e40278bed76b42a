/*
 * Failmail SMTP buffering relay
 * Copyright (C) 2022 the Failmail developers
 *
 * This program is free software: you can redistribute it and/or modify it under
 * the terms of the GNU General Public License as published by the Free Software
 * Foundation, either version 3 of the License, or any later version.
 *
 * This program is distributed in the hope that it will be useful, but WITHOUT
 * ANY WARRANTY; without even the implied warranty of MERCHANTABILITY or FITNESS
 * FOR A PARTICULAR PURPOSE.  See the GNU General Public License for more details.
 *
 * You should have received a copy of the GNU General Public License along with
 * this program. If not, see https://www.gnu.org/licenses/.
 *
*/

//! Zero-downtime reload.
//!
//! A reload runs as follows:
//!
//! * SIGUSR1 triggers the same graceful drain as a shutdown, except that
//!   the listener duplicates its socket descriptor (clearing close-on-exec
//!   on the duplicate) before closing the original.
//!
//! * Once every task has finished (all in-flight messages are committed to
//!   storage or summarized and sent), the supervisor re-executes the same
//!   binary with the same arguments, except that `--socket-fd` now names
//!   the duplicated descriptor.
//!
//! * The parent exits after the spawn; the child opens the inherited
//!   descriptor instead of binding, so no connection attempt ever sees a
//!   closed port.

/// The argument vector for the next process: the current arguments with any
/// previous `--socket-fd` stripped and the new descriptor appended.
#[must_use]
pub fn reload_args(
    args: impl Iterator<Item = String>,
    fd: std::os::unix::io::RawFd,
) -> Vec<String> {
    let mut out = Vec::new();
    let mut skip_value = false;
    for arg in args {
        if skip_value {
            skip_value = false;
            continue;
        }
        if arg == "--socket-fd" {
            skip_value = true;
            continue;
        }
        if arg.starts_with("--socket-fd=") {
            continue;
        }
        out.push(arg);
    }
    out.push(format!("--socket-fd={fd}"));
    out
}

/// Spawn the replacement process, handing it the duplicated listening
/// socket. Called only after every task has drained.
///
/// # Errors
///
/// * the executable path cannot be determined
/// * the spawn failed
pub fn respawn(fd: std::os::unix::io::RawFd) -> anyhow::Result<()> {
    let exe = std::env::current_exe()?;
    let args = reload_args(std::env::args().skip(1), fd);

    tracing::info!(target: "reload", fd, ?exe, ?args, "Passing the socket to a new process.");

    std::process::Command::new(exe)
        .args(args)
        .stdout(std::process::Stdio::inherit())
        .stderr(std::process::Stdio::inherit())
        .spawn()?;
    Ok(())
}
