/*!
* `rofl_bolts`: the operating-system plumbing shared by the rofl fork-server runtime
* (`rofl_targets`) and its controller peer (`rofl`).
*/
#![doc = include_str!("../../README.md")]
/*! */
#![deny(rustdoc::broken_intra_doc_links)]
#![deny(clippy::all)]
#![deny(clippy::pedantic)]
#![allow(
    clippy::unreadable_literal,
    clippy::missing_errors_doc,
    clippy::cast_possible_truncation,
    clippy::ptr_as_ptr,
    clippy::missing_panics_doc,
    clippy::module_name_repetitions
)]
#![cfg_attr(not(test), warn(
    missing_debug_implementations,
    missing_docs,
    trivial_numeric_casts,
    unused_extern_crates,
    unused_import_braces,
    unused_qualifications,
))]
#![cfg_attr(test, deny(
    missing_debug_implementations,
    missing_docs,
    trivial_numeric_casts,
    unused_extern_crates,
    unused_import_braces,
    unused_qualifications,
    unused_must_use,
))]
#![cfg_attr(
    test,
    deny(
        bad_style,
        dead_code,
        improper_ctypes,
        non_shorthand_field_patterns,
        no_mangle_generic_items,
        overflowing_literals,
        path_statements,
        patterns_in_fns_without_body,
        unconditional_recursion,
        unused,
        unused_allocation,
        unused_comparisons,
        unused_parens,
        while_true
    )
)]

#[cfg(unix)]
pub mod os;
#[cfg(unix)]
pub mod shmem;

use core::{
    fmt::{self, Display},
    num::{ParseIntError, TryFromIntError},
    time,
};
use std::{
    io,
    time::{SystemTime, UNIX_EPOCH},
};

use log::{Metadata, Record};

/// Main error struct for `rofl`
#[derive(Debug)]
pub enum Error {
    /// File related error
    File(io::Error),
    /// An OS call failed, with the operation that failed
    OsError(io::Error, String),
    /// Optional val was supposed to be set, but isn't.
    EmptyOptional(String),
    /// You're holding it wrong
    IllegalState(String),
    /// The argument passed to this method or function is not valid
    IllegalArgument(String),
    /// Something else happened
    Unknown(String),
}

impl Error {
    /// File related error
    #[must_use]
    pub fn file(arg: io::Error) -> Self {
        Error::File(arg)
    }
    /// An OS call failed
    #[must_use]
    pub fn os_error<S>(err: io::Error, msg: S) -> Self
    where
        S: Into<String>,
    {
        Error::OsError(err, msg.into())
    }
    /// Wraps the last OS error (`errno`) together with the operation that failed
    #[must_use]
    pub fn last_os_error<S>(msg: S) -> Self
    where
        S: Into<String>,
    {
        Error::OsError(io::Error::last_os_error(), msg.into())
    }
    /// Optional val was supposed to be set, but isn't.
    #[must_use]
    pub fn empty_optional<S>(arg: S) -> Self
    where
        S: Into<String>,
    {
        Error::EmptyOptional(arg.into())
    }
    /// You're holding it wrong
    #[must_use]
    pub fn illegal_state<S>(arg: S) -> Self
    where
        S: Into<String>,
    {
        Error::IllegalState(arg.into())
    }
    /// The argument passed to this method or function is not valid
    #[must_use]
    pub fn illegal_argument<S>(arg: S) -> Self
    where
        S: Into<String>,
    {
        Error::IllegalArgument(arg.into())
    }
    /// Something else happened
    #[must_use]
    pub fn unknown<S>(arg: S) -> Self
    where
        S: Into<String>,
    {
        Error::Unknown(arg.into())
    }
}

impl Display for Error {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        match self {
            Self::File(err) => write!(f, "File IO failed: {:?}", &err),
            Self::OsError(err, s) => write!(f, "{s}: {err}"),
            Self::EmptyOptional(s) => write!(f, "Optional value `{0}` was not set", &s),
            Self::IllegalState(s) => write!(f, "Illegal state: {0}", &s),
            Self::IllegalArgument(s) => write!(f, "Illegal argument: {0}", &s),
            Self::Unknown(s) => write!(f, "Unknown error: {0}", &s),
        }
    }
}

#[cfg(unix)]
impl From<nix::Error> for Error {
    fn from(err: nix::Error) -> Self {
        Self::os_error(io::Error::from(err), "Unix error")
    }
}

/// Create a rofl Error from io Error
impl From<io::Error> for Error {
    fn from(err: io::Error) -> Self {
        Self::file(err)
    }
}

impl From<ParseIntError> for Error {
    fn from(err: ParseIntError) -> Self {
        Self::illegal_argument(format!("Failed to parse Int: {err:?}"))
    }
}

impl From<TryFromIntError> for Error {
    fn from(err: TryFromIntError) -> Self {
        Self::illegal_state(format!("Expected conversion failed: {err:?}"))
    }
}

impl std::error::Error for Error {}

/// Current time
#[must_use]
#[inline]
pub fn current_time() -> time::Duration {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .unwrap_or_default()
}

/// Stderr logger
pub static ROFL_STDERR_LOGGER: SimpleStderrLogger = SimpleStderrLogger::new();

/// A simple logger struct that logs to stderr when used with [`log::set_logger`].
///
/// Every line carries the pid, since parent and children of a fork server
/// usually share one stderr.
#[derive(Debug)]
pub struct SimpleStderrLogger {}

impl Default for SimpleStderrLogger {
    fn default() -> Self {
        Self::new()
    }
}

impl SimpleStderrLogger {
    /// Create a new [`log::Log`] logger that will write log to stderr
    #[must_use]
    pub const fn new() -> Self {
        Self {}
    }

    /// register stderr logger
    pub fn set_logger() -> Result<(), Error> {
        log::set_logger(&ROFL_STDERR_LOGGER)
            .map_err(|_| Error::illegal_state("Failed to register logger"))
    }
}

impl log::Log for SimpleStderrLogger {
    #[inline]
    fn enabled(&self, _metadata: &Metadata) -> bool {
        true
    }

    fn log(&self, record: &Record) {
        eprintln!(
            "[{:?}] [rofl {}] {}: {}",
            current_time(),
            std::process::id(),
            record.level(),
            record.args()
        );
    }

    fn flush(&self) {}
}
