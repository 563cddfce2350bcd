//! Claims the process's stdio for the transport.
//!
//! The frame stream shares the child's stdin/stdout with whatever the
//! operations decide to print, so before anything else runs the agent
//! dups fds 0 and 1 onto private descriptors and points the public ones
//! at `/dev/null`. A stray `println!` in an operation then goes nowhere
//! instead of corrupting the protocol. Stderr is left alone — the
//! controller forwards it line by line with the host name prefixed.

#![allow(unsafe_code)]

use std::fs::File;
use std::io;
use std::os::fd::FromRawFd;

/// The private ends of the transport pipe.
#[derive(Debug)]
pub struct Transport {
    /// Frames from the controller (the original stdin).
    pub input: File,
    /// Frames to the controller (the original stdout).
    pub output: File,
}

/// Rewires stdio and returns the transport ends. Call once, before the
/// async runtime starts.
pub fn claim_stdio() -> io::Result<Transport> {
    // SAFETY: fds 0 and 1 are open on process entry; dup returns fresh
    // descriptors we immediately take ownership of.
    let input = unsafe {
        let fd = libc::dup(0);
        if fd < 0 {
            return Err(io::Error::last_os_error());
        }
        File::from_raw_fd(fd)
    };
    // SAFETY: as above, for fd 1.
    let output = unsafe {
        let fd = libc::dup(1);
        if fd < 0 {
            return Err(io::Error::last_os_error());
        }
        File::from_raw_fd(fd)
    };

    redirect_to_null(0, libc::O_RDONLY)?;
    redirect_to_null(1, libc::O_WRONLY)?;

    Ok(Transport { input, output })
}

/// Points `target_fd` at `/dev/null`.
fn redirect_to_null(target_fd: i32, flags: i32) -> io::Result<()> {
    // SAFETY: opening /dev/null and dup2-ing onto a known-open fd; the
    // temporary descriptor is closed on every path.
    unsafe {
        let null = libc::open(c"/dev/null".as_ptr(), flags);
        if null < 0 {
            return Err(io::Error::last_os_error());
        }
        let ret = libc::dup2(null, target_fd);
        libc::close(null);
        if ret < 0 {
            return Err(io::Error::last_os_error());
        }
    }
    Ok(())
}
