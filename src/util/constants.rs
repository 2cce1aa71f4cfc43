//! Centralized timeout/limit constants for Stratum runtime configuration.

use std::time::Duration;

/// Grace period between SIGINT and SIGKILL when a run is cancelled.
pub const CANCEL_GRACE_PERIOD: Duration = Duration::from_secs(30);

/// Timeout for a single `run_cmd` invocation inside expression evaluation.
pub const RUN_CMD_TIMEOUT: Duration = Duration::from_secs(60);

/// Timeout for establishing a state-read HTTP connection (remote state shortcut).
pub const CONNECT_TIMEOUT: Duration = Duration::from_secs(10);

/// Timeout for a state-read HTTP request.
pub const STATE_READ_TIMEOUT: Duration = Duration::from_secs(30);

/// Maximum number of HTTP redirects to follow for OTLP-HTTP export and state reads.
pub const REDIRECT_LIMIT: usize = 5;

/// Default bound on directories inspected during discovery, before
/// `--max-folders-to-check` is applied explicitly.
pub const DEFAULT_MAX_FOLDERS_TO_CHECK: usize = 100_000;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn timeouts_are_positive() {
        assert!(RUN_CMD_TIMEOUT.as_secs() > 0);
        assert!(STATE_READ_TIMEOUT.as_secs() > 0);
        assert!(CONNECT_TIMEOUT.as_secs() > 0);
        assert!(CANCEL_GRACE_PERIOD.as_secs() > 0);
    }

    #[test]
    fn connect_timeout_is_shortest() {
        assert!(CONNECT_TIMEOUT < STATE_READ_TIMEOUT);
        assert!(CONNECT_TIMEOUT < RUN_CMD_TIMEOUT);
    }
}
