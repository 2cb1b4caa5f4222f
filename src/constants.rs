//! Application-wide constants for orca.
//!
//! This module centralizes magic numbers so the protocol, pool, and agent
//! agree on timing without hunting through call sites. Constants are grouped
//! by domain with documentation explaining their purpose.

use std::time::Duration;

// ============================================================================
// Wire protocol
// ============================================================================

/// Maximum accepted length of a single JSON frame line (8 MiB).
///
/// A frame carries at most one read chunk of process output plus framing
/// overhead, so real frames stay far below this. The cap bounds memory when
/// a peer misbehaves.
pub const MAX_LINE_BYTES: usize = 8 * 1024 * 1024;

/// Read chunk size for child stdout/stderr streaming.
///
/// Output is forwarded in chunks of at most this size, one frame per chunk.
pub const STREAM_CHUNK_BYTES: usize = 4096;

// ============================================================================
// Agent
// ============================================================================

/// Interval between agent heartbeats.
///
/// The controller marks a worker stale after [`STALE_AFTER`], so several
/// heartbeats must fit inside that window.
pub const HEARTBEAT_INTERVAL: Duration = Duration::from_secs(5);

/// Exit code reported for a job killed by the timeout deadline.
///
/// Matches the convention of coreutils `timeout(1)`.
pub const EXIT_CODE_TIMEOUT: i32 = 124;

/// `PATH` injected into a child when the job environment does not set one.
pub const DEFAULT_CHILD_PATH: &str =
    "/usr/local/sbin:/usr/local/bin:/usr/sbin:/usr/bin:/sbin:/bin";

// ============================================================================
// Worker pool
// ============================================================================

/// Interval between health-check sweeps over the worker map.
pub const HEALTH_CHECK_INTERVAL: Duration = Duration::from_secs(10);

/// A worker whose last heartbeat is older than this is marked stale.
pub const STALE_AFTER: Duration = Duration::from_secs(60);

/// Total budget for connecting to a freshly booted agent.
pub const AGENT_CONNECT_BUDGET: Duration = Duration::from_secs(60);

/// Poll interval while waiting for the agent endpoint to appear.
pub const AGENT_CONNECT_POLL: Duration = Duration::from_millis(100);

/// Backoff between retries when a targeted worker exists but is not
/// yet reachable.
pub const TARGETED_RETRY_BACKOFF: Duration = Duration::from_millis(200);

/// Capacity of the dispatch queue. Submissions beyond this back-pressure
/// the client connection.
pub const JOB_QUEUE_CAPACITY: usize = 1000;

// ============================================================================
// Client
// ============================================================================

/// How long the client waits for an auto-started daemon's control socket.
pub const DAEMON_START_BUDGET: Duration = Duration::from_secs(10);

/// A job is considered timed out when its measured duration exceeds this
/// fraction of its nominal timeout, even if the agent reported a normal
/// exit. Guards against an agent whose deadline never fired.
pub const TIMEOUT_SAFETY_FACTOR: f64 = 0.94;

/// Default per-test timeout when a script declares none.
pub const DEFAULT_TEST_TIMEOUT: Duration = Duration::from_secs(30);

/// Floor for dynamically derived timeouts.
pub const DYNAMIC_TIMEOUT_FLOOR: Duration = Duration::from_secs(5);

/// Multiplier applied to the historical expected duration when deriving a
/// dynamic timeout.
pub const DYNAMIC_TIMEOUT_MULTIPLIER: f64 = 2.5;

/// Exit code for a client interrupted by SIGINT (128 + 2).
pub const EXIT_CODE_INTERRUPTED: i32 = 130;

// ============================================================================
// History
// ============================================================================

/// Executions retained per test path before eviction.
pub const MAX_HISTORY_RUNS: usize = 20;

/// Recent job paths remembered per worker for `orca status`.
pub const WORKER_JOB_HISTORY: usize = 8;

// ============================================================================
// Server
// ============================================================================

/// Interval between resource samples appended to `orca-resources.log`.
pub const RESOURCE_SAMPLE_INTERVAL: Duration = Duration::from_secs(30);

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_heartbeats_fit_inside_stale_window() {
        // Several heartbeats must arrive before a worker can go stale.
        assert!(STALE_AFTER >= HEARTBEAT_INTERVAL * 4);
    }

    #[test]
    fn test_safety_factor_below_one() {
        assert!(TIMEOUT_SAFETY_FACTOR > 0.5 && TIMEOUT_SAFETY_FACTOR < 1.0);
    }
}
