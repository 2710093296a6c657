//! Runtime configuration, read from the environment the controller sets up.

use core::time::Duration;
use std::{
    env,
    ffi::OsString,
    os::fd::RawFd,
    path::{Path, PathBuf},
};

use log::LevelFilter;
use rofl_bolts::{shmem::ShMemId, Error};

/// The env var holding the fd of the shared feedback segment. Enables fork-server mode.
pub const SHM_FD_ENV_VAR: &str = "ROFL_SHM_FD";
/// The env var naming the file each child's stdout is redirected to
pub const OUT_PATH_ENV_VAR: &str = "ROFL_OUT_PATH";
/// The env var naming the file each child's stderr is redirected to
pub const ERR_PATH_ENV_VAR: &str = "ROFL_ERR_PATH";
/// The env var holding the per-execution CPU time budget, in milliseconds
pub const TIMEOUT_ENV_VAR: &str = "ROFL_TIMEOUT_MS";
/// If set, the runtime logs at `Debug` level instead of `Warn`
pub const DEBUG_ENV_VAR: &str = "ROFL_DEBUG";

/// The default per-execution CPU time budget
pub const DEFAULT_TIMEOUT: Duration = Duration::from_millis(70);

/// Everything the runtime reads from its environment, once, at bootstrap.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RuntimeConfig {
    shm_fd: Option<RawFd>,
    out_path: Option<PathBuf>,
    err_path: Option<PathBuf>,
    timeout: Duration,
    debug: bool,
}

impl Default for RuntimeConfig {
    fn default() -> Self {
        Self {
            shm_fd: None,
            out_path: None,
            err_path: None,
            timeout: DEFAULT_TIMEOUT,
            debug: false,
        }
    }
}

impl RuntimeConfig {
    /// A config for standalone runs: no shared segment, no redirects, default timeout.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Read the config from the process environment, logging and ignoring
    /// malformed values.
    #[must_use]
    pub fn from_env_lossy() -> Self {
        let (config, errors) = Self::from_lookup(|name| env::var_os(name));
        for err in errors {
            log::error!("Ignoring malformed runtime option: {err}");
        }
        config
    }

    /// Build a config from any variable lookup. Malformed options keep their
    /// default and are returned as errors next to the config.
    pub fn from_lookup<F>(lookup: F) -> (Self, Vec<Error>)
    where
        F: Fn(&str) -> Option<OsString>,
    {
        let mut config = Self::default();
        let mut errors = vec![];

        if let Some(val) = lookup(SHM_FD_ENV_VAR) {
            match parse_str(SHM_FD_ENV_VAR, &val).and_then(ShMemId::from_string) {
                Ok(id) => config.shm_fd = Some(id.fd()),
                Err(err) => errors.push(option_error(SHM_FD_ENV_VAR, &err)),
            }
        }
        config.out_path = lookup(OUT_PATH_ENV_VAR)
            .filter(|p| !p.is_empty())
            .map(PathBuf::from);
        config.err_path = lookup(ERR_PATH_ENV_VAR)
            .filter(|p| !p.is_empty())
            .map(PathBuf::from);
        if let Some(val) = lookup(TIMEOUT_ENV_VAR) {
            match parse_timeout(&val) {
                Ok(timeout) => config.timeout = timeout,
                Err(err) => errors.push(option_error(TIMEOUT_ENV_VAR, &err)),
            }
        }
        config.debug = lookup(DEBUG_ENV_VAR).is_some_and(|v| !v.is_empty() && v != "0");

        (config, errors)
    }

    /// Set the fd of the shared feedback segment
    #[must_use]
    pub fn with_shm_fd(mut self, shm_fd: Option<RawFd>) -> Self {
        self.shm_fd = shm_fd;
        self
    }

    /// Redirect each child's stdout to `path`
    #[must_use]
    pub fn with_out_path<P: Into<PathBuf>>(mut self, path: P) -> Self {
        self.out_path = Some(path.into());
        self
    }

    /// Redirect each child's stderr to `path`
    #[must_use]
    pub fn with_err_path<P: Into<PathBuf>>(mut self, path: P) -> Self {
        self.err_path = Some(path.into());
        self
    }

    /// Set the per-execution CPU time budget
    #[must_use]
    pub fn with_timeout(mut self, timeout: Duration) -> Self {
        self.timeout = timeout;
        self
    }

    /// Enable debug logging
    #[must_use]
    pub fn with_debug(mut self, debug: bool) -> Self {
        self.debug = debug;
        self
    }

    /// The fd of the shared feedback segment, if the controller supplied one
    #[must_use]
    pub fn shm_fd(&self) -> Option<RawFd> {
        self.shm_fd
    }

    /// Where each child's stdout goes
    #[must_use]
    pub fn out_path(&self) -> Option<&Path> {
        self.out_path.as_deref()
    }

    /// Where each child's stderr goes
    #[must_use]
    pub fn err_path(&self) -> Option<&Path> {
        self.err_path.as_deref()
    }

    /// The per-execution CPU time budget
    #[must_use]
    pub fn timeout(&self) -> Duration {
        self.timeout
    }

    /// Whether debug logging is on
    #[must_use]
    pub fn debug(&self) -> bool {
        self.debug
    }

    /// The maximum log level the runtime logger should use
    #[must_use]
    pub fn log_level(&self) -> LevelFilter {
        if self.debug {
            LevelFilter::Debug
        } else {
            LevelFilter::Warn
        }
    }
}

fn parse_str<'a>(name: &str, val: &'a OsString) -> Result<&'a str, Error> {
    val.to_str()
        .ok_or_else(|| Error::illegal_argument(format!("{name} is not valid UTF-8")))
}

fn parse_timeout(val: &OsString) -> Result<Duration, Error> {
    let millis: u64 = parse_str(TIMEOUT_ENV_VAR, val)?.trim().parse()?;
    if millis == 0 {
        return Err(Error::illegal_argument("a timeout of 0 ms would never fire"));
    }
    Ok(Duration::from_millis(millis))
}

fn option_error(name: &str, err: &Error) -> Error {
    Error::illegal_argument(format!("{name}: {err}"))
}
