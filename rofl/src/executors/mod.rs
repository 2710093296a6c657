//! Executors run the target and report how each execution ended.

pub mod forkserver;
pub use forkserver::{ConfigTarget, Forkserver, ForkserverBuilder};

use core::fmt::{self, Display};

use serde::{Deserialize, Serialize};

/// How an execution finished, decoded from a raw `waitpid` status.
#[derive(Debug, Copy, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum ExitReason {
    /// The run exited with this code.
    Normal(u8),
    /// The run used up its CPU time budget and was killed by `SIGVTALRM`.
    Timeout,
    /// The run was killed by this signal.
    Signaled(i32),
    /// The run was stopped by this signal.
    Stopped(i32),
}

impl ExitReason {
    /// Decode a raw wait status
    #[must_use]
    pub fn from_status(status: i32) -> Self {
        if libc::WIFSIGNALED(status) {
            match libc::WTERMSIG(status) {
                libc::SIGVTALRM => ExitReason::Timeout,
                sig => ExitReason::Signaled(sig),
            }
        } else if libc::WIFSTOPPED(status) {
            ExitReason::Stopped(libc::WSTOPSIG(status))
        } else {
            ExitReason::Normal(libc::WEXITSTATUS(status) as u8)
        }
    }

    /// Whether the target was killed by a signal other than the timeout
    #[must_use]
    pub fn is_crash(&self) -> bool {
        matches!(self, ExitReason::Signaled(_))
    }
}

impl Display for ExitReason {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Normal(code) => write!(f, "exited with code {code}"),
            Self::Timeout => write!(f, "timed out"),
            Self::Signaled(sig) => write!(f, "killed by signal {sig}"),
            Self::Stopped(sig) => write!(f, "stopped by signal {sig}"),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::ExitReason;

    // Raw statuses as laid out by Linux: exit code in bits 8..16, a signal in
    // the low 7 bits, 0x7f in the low byte for a stop.
    #[test]
    #[cfg(target_os = "linux")]
    fn test_from_status() {
        assert_eq!(ExitReason::from_status(0), ExitReason::Normal(0));
        assert_eq!(ExitReason::from_status(7 << 8), ExitReason::Normal(7));
        assert_eq!(
            ExitReason::from_status(libc::SIGVTALRM),
            ExitReason::Timeout
        );
        assert_eq!(
            ExitReason::from_status(libc::SIGSEGV),
            ExitReason::Signaled(libc::SIGSEGV)
        );
        // a core dump flag does not change the signal
        assert_eq!(
            ExitReason::from_status(0x80 | libc::SIGABRT),
            ExitReason::Signaled(libc::SIGABRT)
        );
        assert_eq!(
            ExitReason::from_status((libc::SIGSTOP << 8) | 0x7f),
            ExitReason::Stopped(libc::SIGSTOP)
        );
    }

    #[test]
    fn test_display() {
        assert_eq!(ExitReason::Normal(3).to_string(), "exited with code 3");
        assert_eq!(ExitReason::Timeout.to_string(), "timed out");
        assert!(ExitReason::Signaled(11).is_crash());
        assert!(!ExitReason::Timeout.is_crash());
    }
}
