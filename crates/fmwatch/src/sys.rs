//! Safe wrappers for platform-specific unsafe operations
//!
//! Every `unsafe` block in the library lives here.

use std::io;

/// Ask process `pid` to terminate
///
/// Sends `SIGTERM`. A process which has already exited but
/// has not been reaped yet is not an error.
#[cfg(unix)]
pub fn terminate(pid: u32) -> io::Result<()> {
    let pid = libc::pid_t::try_from(pid)
        .map_err(|_| io::Error::new(io::ErrorKind::InvalidInput, "PID out of range"))?;

    // SAFETY: kill() has no memory-safety preconditions. The
    // caller still owns the un-reaped child, so the PID cannot
    // have been recycled.
    let rc = unsafe { libc::kill(pid, libc::SIGTERM) };
    if rc == 0 {
        return Ok(());
    }

    let err = io::Error::last_os_error();
    match err.raw_os_error() {
        Some(libc::ESRCH) => Ok(()),
        _ => Err(err),
    }
}

/// Ask process `pid` to terminate
///
/// Not supported on this platform. Callers fall back to
/// killing the process.
#[cfg(not(unix))]
pub fn terminate(_pid: u32) -> io::Result<()> {
    Err(io::Error::new(
        io::ErrorKind::Unsupported,
        "graceful termination is not supported",
    ))
}
