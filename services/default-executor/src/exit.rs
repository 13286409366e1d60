//! POSIX wait-status decoding.
//!
//! The agent reports a child container's termination as a raw wait status.
//! Anything other than a normal exit or a termination signal violates the
//! nested-container contract.

use nix::sys::signal::Signal;
use nix::sys::wait::WaitStatus;
use nix::unistd::Pid;

/// Decoded termination of a child container.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ExitReason {
    /// Normal exit with a status code.
    Exited(i32),

    /// Terminated by a signal.
    Signaled(Signal),
}

impl ExitReason {
    /// Decodes a raw wait status.
    ///
    /// Panics on statuses that encode neither an exit nor a termination
    /// signal; the agent never reports stop/continue states for a reaped
    /// container.
    #[must_use]
    pub fn from_raw(status: i32) -> Self {
        match WaitStatus::from_raw(Pid::from_raw(0), status) {
            Ok(WaitStatus::Exited(_, code)) => ExitReason::Exited(code),
            Ok(WaitStatus::Signaled(_, signal, _)) => ExitReason::Signaled(signal),
            other => panic!("unexpected wait status {status}: {other:?}"),
        }
    }

    /// Whether the status represents a clean exit.
    #[must_use]
    pub fn is_success(&self) -> bool {
        matches!(self, ExitReason::Exited(0))
    }
}

impl std::fmt::Display for ExitReason {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            ExitReason::Exited(code) => write!(f, "exited with status {}", code),
            ExitReason::Signaled(signal) => {
                write!(f, "terminated with signal {}", signal.as_str())
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_clean_exit() {
        let reason = ExitReason::from_raw(0);
        assert_eq!(reason, ExitReason::Exited(0));
        assert!(reason.is_success());
        assert_eq!(reason.to_string(), "exited with status 0");
    }

    #[test]
    fn test_nonzero_exit() {
        // Exit code lives in bits 8..16 of the wait status.
        let reason = ExitReason::from_raw(1 << 8);
        assert_eq!(reason, ExitReason::Exited(1));
        assert!(!reason.is_success());
        assert_eq!(reason.to_string(), "exited with status 1");
    }

    #[test]
    fn test_sigterm() {
        let reason = ExitReason::from_raw(libc_sigterm());
        assert_eq!(reason, ExitReason::Signaled(Signal::SIGTERM));
        assert!(!reason.is_success());
        assert_eq!(reason.to_string(), "terminated with signal SIGTERM");
    }

    #[test]
    fn test_sigkill() {
        let reason = ExitReason::from_raw(Signal::SIGKILL as i32);
        assert_eq!(reason, ExitReason::Signaled(Signal::SIGKILL));
    }

    #[test]
    #[should_panic(expected = "unexpected wait status")]
    fn test_stopped_status_is_contract_violation() {
        // 0x7f in the low byte encodes a stopped (not terminated) process.
        ExitReason::from_raw(0x137f);
    }

    fn libc_sigterm() -> i32 {
        Signal::SIGTERM as i32
    }
}
