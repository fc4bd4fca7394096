//! Application-wide constants for taskmill.
//!
//! This module centralizes operational magic numbers. Wire-level codes
//! (packet types, command and response codes) live in [`crate::protocol`]
//! next to the codec; what remains here are timings and capacity limits
//! shared by broker, node, and client.

use std::time::Duration;

// ============================================================================
// Timeouts
// ============================================================================

/// Per-socket idle timeout applied to every protocol read and write.
///
/// A peer that goes silent for longer than this is treated as disconnected.
/// This is the only liveness mechanism in the system — there are no
/// per-subtask watchdogs — so it also bounds how long a dead connection can
/// hold broker state.
pub const IDLE_TIMEOUT: Duration = Duration::from_secs(10);

/// Back-off used by nodes and clients when the broker reports no work
/// (`NONEWTASKS`, `NONEWSUBTASKS`, `NONEWRESULTS`) and between keepalive
/// pings. Half the idle timeout keeps an otherwise-quiet connection alive.
pub const POLL_BACKOFF: Duration = Duration::from_secs(5);

// ============================================================================
// Capacity
// ============================================================================

/// Maximum number of subtasks queued in broker memory per client.
///
/// Submissions beyond this are refused with `NOTENOUGHSPACE` and the client
/// backs off until a node drains the queue. The check is a strict
/// greater-than against the current length, so the queue can momentarily
/// hold one entry more than this. Reclaimed subtasks from a dead node are
/// requeued regardless of the bound.
pub const MAX_PENDING_SUBTASKS: usize = 10;

// ============================================================================
// Status reporting
// ============================================================================

/// Interval between broker status summary log lines.
pub const STATUS_INTERVAL: Duration = Duration::from_secs(10);

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_backoff_stays_under_idle_timeout() {
        // A peer sleeping one backoff between exchanges must never trip the
        // idle timeout on the other side.
        assert!(POLL_BACKOFF < IDLE_TIMEOUT);
    }
}
