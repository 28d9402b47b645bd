//! Retry policy for daemon-facing calls
//!
//! The mapping daemon is the one collaborator the middleware will try to
//! revive on its own: when a connection fails because the daemon is not
//! running, the service is started once and the connection retried
//! exactly once before the error surfaces.

use crate::error::Error;

/// Bounded retry policy scoped to a single error kind
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RetryPolicy {
    /// Total connection attempts, including the first
    pub max_attempts: u32,
}

impl RetryPolicy {
    /// The policy for daemon unavailability: start the service once, then
    /// retry exactly once
    pub fn daemon_unavailable() -> Self {
        Self { max_attempts: 2 }
    }

    /// No retries at all
    pub fn none() -> Self {
        Self { max_attempts: 1 }
    }

    /// Whether another attempt is permitted after `attempt` (zero-based)
    /// failed with `err`
    pub fn should_retry(&self, attempt: u32, err: &Error) -> bool {
        attempt + 1 < self.max_attempts && err.is_daemon_unavailable()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_retries_only_daemon_unavailable() {
        let policy = RetryPolicy::daemon_unavailable();
        let unavailable = Error::DaemonUnavailable {
            service: "idmap".into(),
        };
        let protocol = Error::DaemonProtocol {
            code: 2,
            message: "failed".into(),
        };

        assert!(policy.should_retry(0, &unavailable));
        assert!(!policy.should_retry(1, &unavailable));
        assert!(!policy.should_retry(0, &protocol));
    }

    #[test]
    fn test_none_never_retries() {
        let policy = RetryPolicy::none();
        let unavailable = Error::DaemonUnavailable {
            service: "idmap".into(),
        };
        assert!(!policy.should_retry(0, &unavailable));
    }
}
