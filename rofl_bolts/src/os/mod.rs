//! Operating System specific abstractions
//!

pub mod timer;

use std::{
    io::{self, Write},
    os::fd::RawFd,
};

use libc::pid_t;
use nix::{
    sys::signal::{self, Signal},
    unistd::{getpid, Pid},
};

use crate::Error;

/// Child Process Handle
#[derive(Debug)]
pub struct ChildHandle {
    /// The process id
    pub pid: pid_t,
}

impl ChildHandle {
    /// Block until this specific child terminated or stopped, and return the raw wait status.
    ///
    /// Interrupted waits are retried.
    pub fn wait_status(&self) -> Result<i32, Error> {
        waitpid_raw(self.pid, 0)
    }

    /// The [`Pid`] of this child, for use with `nix`
    #[must_use]
    pub fn as_pid(&self) -> Pid {
        Pid::from_raw(self.pid)
    }
}

/// Waits for `pid` with the given `waitpid` options and returns the raw status.
///
/// The raw status is what a controller expects to read back, so it is not
/// decoded here.
pub fn waitpid_raw(pid: pid_t, options: libc::c_int) -> Result<i32, Error> {
    let mut status = 0;
    loop {
        let res = unsafe { libc::waitpid(pid, &raw mut status, options) };
        if res < 0 {
            let err = io::Error::last_os_error();
            if err.kind() == io::ErrorKind::Interrupted {
                continue;
            }
            return Err(Error::os_error(err, format!("waitpid({pid}) failed")));
        }
        return Ok(status);
    }
}

/// The `ForkResult` (result of a fork)
#[derive(Debug)]
pub enum ForkResult {
    /// The fork finished, we are the parent process.
    /// The child has the handle `ChildHandle`.
    Parent(ChildHandle),
    /// The fork finished, we are the child process.
    Child,
}

/// Unix has forks.
/// # Safety
/// A Normal fork. Runs on in two processes. Should be memory safe in general,
/// as long as the calling process is single-threaded.
pub unsafe fn fork() -> Result<ForkResult, Error> {
    match unsafe { libc::fork() } {
        pid if pid > 0 => Ok(ForkResult::Parent(ChildHandle { pid })),
        pid if pid < 0 => Err(Error::last_os_error("Fork failed")),
        _ => Ok(ForkResult::Child),
    }
}

/// Flushes the Rust-side buffers of `stdout` and `stderr`.
///
/// Call this before a fork, or the child inherits (and later re-emits) the
/// parent's pending output.
pub fn flush_std_streams() {
    let _ = io::stdout().flush();
    let _ = io::stderr().flush();
}

/// Stops the current process with `SIGSTOP`.
///
/// Returns once somebody sends `SIGCONT`.
pub fn stop_self() -> Result<(), Error> {
    signal::kill(getpid(), Signal::SIGSTOP)
        .map_err(|errno| Error::os_error(errno.into(), "Could not stop ourselves"))
}

/// "Safe" wrapper around dup2
///
/// # Safety
/// The fds need to be legal fds.
pub unsafe fn dup2(fd: RawFd, device: RawFd) -> Result<(), Error> {
    match unsafe { libc::dup2(fd, device) } {
        -1 => Err(Error::last_os_error(format!(
            "Error calling dup2({fd}, {device})"
        ))),
        _ => Ok(()),
    }
}

/// "Safe" wrapper around `dup`, duplicating the given file descriptor
///
/// # Safety
/// The fd need to be a legal fd.
pub unsafe fn dup(fd: RawFd) -> Result<RawFd, Error> {
    match unsafe { libc::dup(fd) } {
        -1 => Err(Error::last_os_error(format!("Error calling dup({fd})"))),
        new_fd => Ok(new_fd),
    }
}

/// Clears `FD_CLOEXEC` on `fd`, so it survives an `exec` into the target.
pub fn inherit_fd(fd: RawFd) -> Result<(), Error> {
    unsafe {
        let flags = libc::fcntl(fd, libc::F_GETFD);
        if flags == -1 {
            return Err(Error::last_os_error("Failed to retrieve FD flags"));
        }
        if libc::fcntl(fd, libc::F_SETFD, flags & !libc::FD_CLOEXEC) == -1 {
            return Err(Error::last_os_error("Failed to set FD flags"));
        }
    }
    Ok(())
}

/// Exits the current process right away, without running `atexit` handlers
/// or flushing buffers that belong to the target.
pub fn exit(code: i32) -> ! {
    unsafe { libc::_exit(code) }
}

#[cfg(test)]
mod tests {
    use std::{fs::File, io::Read, os::fd::AsRawFd};

    use super::{dup, dup2, fork, waitpid_raw, ChildHandle, ForkResult};

    #[test]
    #[cfg_attr(miri, ignore)]
    fn test_fork_wait_status() {
        match unsafe { fork() }.unwrap() {
            ForkResult::Child => super::exit(7),
            ForkResult::Parent(child) => {
                let status = child.wait_status().unwrap();
                assert!(libc::WIFEXITED(status));
                assert_eq!(libc::WEXITSTATUS(status), 7);
            }
        }
    }

    #[test]
    fn test_wait_unknown_child() {
        let child = ChildHandle { pid: i32::MAX };
        assert!(child.wait_status().is_err());
        assert!(waitpid_raw(i32::MAX, libc::WNOHANG).is_err());
    }

    #[test]
    #[cfg_attr(miri, ignore)]
    fn test_dup2_redirects() {
        let dir = std::env::temp_dir();
        let path = dir.join(format!("rofl_bolts_dup2_{}", std::process::id()));
        let target = File::create(&path).unwrap();
        let scratch = File::open("/dev/null").unwrap();

        let fd = unsafe { dup(scratch.as_raw_fd()) }.unwrap();
        unsafe { dup2(target.as_raw_fd(), fd) }.unwrap();
        let written = unsafe { libc::write(fd, b"rofl".as_ptr().cast(), 4) };
        assert_eq!(written, 4);
        unsafe { libc::close(fd) };

        let mut content = String::new();
        File::open(&path)
            .unwrap()
            .read_to_string(&mut content)
            .unwrap();
        assert_eq!(content, "rofl");
        std::fs::remove_file(path).unwrap();
    }
}
