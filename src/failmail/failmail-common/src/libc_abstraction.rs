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

/// Duplicate a file descriptor
///
/// # Errors
///
/// see dup(2) ERRORS
pub fn dup(fd: std::os::unix::io::RawFd) -> anyhow::Result<std::os::unix::io::RawFd> {
    #[allow(unsafe_code)]
    // SAFETY: ffi call
    match unsafe { libc::dup(fd) } {
        -1 => Err(anyhow::anyhow!(
            "dup: '{}'",
            std::io::Error::last_os_error()
        )),
        new_fd => Ok(new_fd),
    }
}

/// Clear the close-on-exec flag of a file descriptor, so a spawned child
/// process inherits it.
///
/// # Errors
///
/// see fcntl(2) ERRORS
pub fn clear_cloexec(fd: std::os::unix::io::RawFd) -> anyhow::Result<()> {
    #[allow(unsafe_code)]
    // SAFETY: ffi call
    let flags = unsafe { libc::fcntl(fd, libc::F_GETFD) };
    if flags == -1 {
        anyhow::bail!("fcntl(F_GETFD): '{}'", std::io::Error::last_os_error());
    }

    #[allow(unsafe_code)]
    // SAFETY: ffi call
    match unsafe { libc::fcntl(fd, libc::F_SETFD, flags & !libc::FD_CLOEXEC) } {
        -1 => Err(anyhow::anyhow!(
            "fcntl(F_SETFD): '{}'",
            std::io::Error::last_os_error()
        )),
        _ => Ok(()),
    }
}

/// Whether the close-on-exec flag is set on a file descriptor.
///
/// # Errors
///
/// see fcntl(2) ERRORS
pub fn get_cloexec(fd: std::os::unix::io::RawFd) -> anyhow::Result<bool> {
    #[allow(unsafe_code)]
    // SAFETY: ffi call
    match unsafe { libc::fcntl(fd, libc::F_GETFD) } {
        -1 => Err(anyhow::anyhow!(
            "fcntl(F_GETFD): '{}'",
            std::io::Error::last_os_error()
        )),
        flags => Ok(flags & libc::FD_CLOEXEC != 0),
    }
}

/// Set both timestamps of a file to `time`, like touch(1).
///
/// # Errors
///
/// * `path` contains an internal 0 byte
/// * the file's timestamp cannot be represented
/// * see utimensat(2) ERRORS
pub fn set_file_times(path: &std::path::Path, time: std::time::SystemTime) -> anyhow::Result<()> {
    let path = std::ffi::CString::new(path.to_string_lossy().as_bytes())?;
    let since_epoch = time
        .duration_since(std::time::SystemTime::UNIX_EPOCH)
        .map_err(|_| anyhow::anyhow!("timestamp is before the unix epoch"))?;

    let times = [
        libc::timespec {
            tv_sec: libc::time_t::try_from(since_epoch.as_secs())?,
            tv_nsec: libc::c_long::try_from(since_epoch.subsec_nanos())?,
        };
        2
    ];

    #[allow(unsafe_code)]
    // SAFETY: ffi call, `times` outlives it
    match unsafe { libc::utimensat(libc::AT_FDCWD, path.as_ptr(), times.as_ptr(), 0) } {
        0 => Ok(()),
        _ => Err(anyhow::anyhow!(
            "utimensat: '{}'",
            std::io::Error::last_os_error()
        )),
    }
}
