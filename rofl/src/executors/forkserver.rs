//! The controller side of the fork server.
//!
//! The target must link `rofl_targets`. It maps the segment named by
//! `ROFL_SHM_FD` and stops itself; every [`Forkserver::run`] resumes it for
//! exactly one forked execution.

use core::{mem::size_of, ptr, time::Duration};
use std::{
    ffi::{OsStr, OsString},
    io,
    os::{fd::RawFd, unix::process::CommandExt},
    path::{Path, PathBuf},
    process::{Command, Stdio},
};

use nix::{
    sys::signal::{self, Signal},
    unistd::Pid,
};
use rofl_bolts::{
    os::{inherit_fd, waitpid_raw},
    shmem::{FdShMem, ShMem},
    Error,
};
use rofl_targets::{
    config::{DEBUG_ENV_VAR, ERR_PATH_ENV_VAR, OUT_PATH_ENV_VAR, SHM_FD_ENV_VAR, TIMEOUT_ENV_VAR},
    FeedbackChannel,
};

use super::ExitReason;

/// Configure the target, `setsid` and fd inheritance.
pub trait ConfigTarget {
    /// Run the target in its own session, away from our terminal's signals
    fn setsid(&mut self) -> &mut Self;
    /// Keep `fd` open across the `exec` into the target
    fn inherit_fd(&mut self, fd: RawFd) -> &mut Self;
}

impl ConfigTarget for Command {
    fn setsid(&mut self) -> &mut Self {
        let func = move || {
            unsafe {
                libc::setsid();
            };
            Ok(())
        };
        unsafe { self.pre_exec(func) }
    }

    fn inherit_fd(&mut self, fd: RawFd) -> &mut Self {
        let func = move || inherit_fd(fd).map_err(|_| io::Error::last_os_error());
        unsafe { self.pre_exec(func) }
    }
}

/// The [`Forkserver`] is the controller's handle on a running target.
#[derive(Debug)]
pub struct Forkserver {
    /// The resident parent in the target
    pid: Pid,
    /// The shared feedback segment, alive as long as we are
    shmem: FdShMem,
    channel: *mut FeedbackChannel,
    last_status: Option<i32>,
    alive: bool,
}

impl Forkserver {
    /// A builder for a [`Forkserver`]
    #[must_use]
    pub fn builder() -> ForkserverBuilder {
        ForkserverBuilder::new()
    }

    /// Request one execution and wait for it to finish.
    pub fn run(&mut self) -> Result<ExitReason, Error> {
        if !self.alive {
            return Err(Error::illegal_state("The forkserver is gone"));
        }
        unsafe { ptr::write_volatile(&raw mut (*self.channel).magic, 0) };

        signal::kill(self.pid, Signal::SIGCONT)
            .map_err(|errno| Error::os_error(errno.into(), "Could not resume the forkserver"))?;
        let status = waitpid_raw(self.pid.as_raw(), libc::WUNTRACED)?;
        if !is_self_stop(status) {
            self.alive = libc::WIFSTOPPED(status);
            return Err(Error::illegal_state(format!(
                "Forkserver {} {} during a run",
                self.pid,
                ExitReason::from_status(status)
            )));
        }

        let feedback = self.feedback();
        if !feedback.has_result() {
            return Err(Error::illegal_state(
                "Forkserver stopped without reporting a child, fork failed?",
            ));
        }
        let status = feedback.status;
        self.last_status = Some(status);
        let exit_reason = ExitReason::from_status(status);
        log::debug!("Execution {exit_reason} (status {status:#x})");
        Ok(exit_reason)
    }

    /// The feedback of the last execution
    #[must_use]
    pub fn feedback(&self) -> &FeedbackChannel {
        // # Safety
        // The channel lives in `shmem`, and the target only writes to it
        // while `run` waits.
        unsafe { &*self.channel }
    }

    /// The coverage map of the last execution
    #[must_use]
    pub fn coverage_map(&self) -> &[u8] {
        &self.feedback().coverage_map
    }

    /// The raw wait status of the last execution
    #[must_use]
    pub fn last_status(&self) -> Option<i32> {
        self.last_status
    }

    /// The pid of the resident parent
    #[must_use]
    pub fn pid(&self) -> Pid {
        self.pid
    }

    /// The fd of the shared feedback segment
    #[must_use]
    pub fn shm_fd(&self) -> RawFd {
        self.shmem.id().map_or(-1, |id| id.fd())
    }
}

impl Drop for Forkserver {
    fn drop(&mut self) {
        if !self.alive {
            return;
        }
        log::debug!("Killing forkserver {}", self.pid);
        if let Err(err) = signal::kill(self.pid, Signal::SIGKILL) {
            log::warn!("Could not kill forkserver {}: {err}", self.pid);
            return;
        }
        let _ = waitpid_raw(self.pid.as_raw(), 0);
    }
}

fn is_self_stop(status: i32) -> bool {
    libc::WIFSTOPPED(status) && libc::WSTOPSIG(status) == libc::SIGSTOP
}

/// The builder for [`Forkserver`]
#[derive(Debug, Clone, Default)]
pub struct ForkserverBuilder {
    program: Option<PathBuf>,
    arguments: Vec<OsString>,
    envs: Vec<(OsString, OsString)>,
    out_path: Option<PathBuf>,
    err_path: Option<PathBuf>,
    timeout: Option<Duration>,
    debug: bool,
    setsid: bool,
}

impl ForkserverBuilder {
    /// Create a new [`ForkserverBuilder`]
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// The target binary
    #[must_use]
    pub fn program<P: AsRef<Path>>(mut self, program: P) -> Self {
        self.program = Some(program.as_ref().to_path_buf());
        self
    }

    /// Adds an argument to the target's arguments
    #[must_use]
    pub fn arg<O: AsRef<OsStr>>(mut self, arg: O) -> Self {
        self.arguments.push(arg.as_ref().to_owned());
        self
    }

    /// Adds arguments to the target's arguments
    #[must_use]
    pub fn args<IT, O>(mut self, args: IT) -> Self
    where
        IT: IntoIterator<Item = O>,
        O: AsRef<OsStr>,
    {
        self.arguments
            .extend(args.into_iter().map(|arg| arg.as_ref().to_owned()));
        self
    }

    /// Adds an environment variable for the target
    #[must_use]
    pub fn env<K: AsRef<OsStr>, V: AsRef<OsStr>>(mut self, key: K, val: V) -> Self {
        self.envs
            .push((key.as_ref().to_owned(), val.as_ref().to_owned()));
        self
    }

    /// Each execution's stdout lands in this file
    #[must_use]
    pub fn out_path<P: AsRef<Path>>(mut self, path: P) -> Self {
        self.out_path = Some(path.as_ref().to_path_buf());
        self
    }

    /// Each execution's stderr lands in this file
    #[must_use]
    pub fn err_path<P: AsRef<Path>>(mut self, path: P) -> Self {
        self.err_path = Some(path.as_ref().to_path_buf());
        self
    }

    /// The CPU time budget of each execution, at least a millisecond
    #[must_use]
    pub fn timeout(mut self, timeout: Duration) -> Self {
        self.timeout = Some(timeout);
        self
    }

    /// Let the target's runtime log at debug level
    #[must_use]
    pub fn debug(mut self, debug: bool) -> Self {
        self.debug = debug;
        self
    }

    /// Start the target in a new session
    #[must_use]
    pub fn setsid(mut self, setsid: bool) -> Self {
        self.setsid = setsid;
        self
    }

    /// Spawn the target and wait until its fork server is ready.
    pub fn build(&self) -> Result<Forkserver, Error> {
        let Some(program) = &self.program else {
            return Err(Error::illegal_argument(
                "ForkserverBuilder: program needs to be set",
            ));
        };
        if let Some(timeout) = self.timeout {
            if timeout.as_millis() == 0 {
                return Err(Error::illegal_argument(format!(
                    "ForkserverBuilder: timeout of {timeout:?} is below the 1 ms timer resolution"
                )));
            }
        }

        let mut shmem = FdShMem::new(size_of::<FeedbackChannel>())?;
        let channel = shmem.as_mut_ptr_of::<FeedbackChannel>().ok_or_else(|| {
            Error::illegal_state("Shared segment cannot hold the feedback channel")
        })?;
        let shm_fd = shmem
            .id()
            .ok_or_else(|| Error::empty_optional("shared segment id"))?
            .fd();

        let mut command = Command::new(program);
        command
            .args(&self.arguments)
            .stdin(Stdio::null())
            .env("LD_BIND_NOW", "1")
            .env(SHM_FD_ENV_VAR, shm_fd.to_string())
            .inherit_fd(shm_fd);
        if let Some(out_path) = &self.out_path {
            command.env(OUT_PATH_ENV_VAR, out_path);
        }
        if let Some(err_path) = &self.err_path {
            command.env(ERR_PATH_ENV_VAR, err_path);
        }
        if let Some(timeout) = self.timeout {
            command.env(TIMEOUT_ENV_VAR, timeout.as_millis().to_string());
        }
        if self.debug {
            command.env(DEBUG_ENV_VAR, "1");
        }
        if self.setsid {
            ConfigTarget::setsid(&mut command);
        }
        command.envs(self.envs.iter().cloned());

        let child = command.spawn().map_err(|err| {
            Error::os_error(err, format!("Could not spawn {}", program.display()))
        })?;
        #[expect(clippy::cast_possible_wrap)]
        let pid = Pid::from_raw(child.id() as i32);

        // The runtime stops itself once it is ready.
        let status = waitpid_raw(pid.as_raw(), libc::WUNTRACED)?;
        if !is_self_stop(status) {
            if libc::WIFSTOPPED(status) {
                let _ = signal::kill(pid, Signal::SIGKILL);
                let _ = waitpid_raw(pid.as_raw(), 0);
            }
            return Err(Error::illegal_state(format!(
                "{} {} before its forkserver came up, is it linked against rofl_targets?",
                program.display(),
                ExitReason::from_status(status)
            )));
        }
        log::info!("Forkserver {pid} is up, feedback on fd {shm_fd}");

        Ok(Forkserver {
            pid,
            shmem,
            channel,
            last_status: None,
            alive: true,
        })
    }
}
