//! Connection lifecycle state and retry policy.
//!
//! The session drives a small state machine:
//!
//! ```text
//! Idle ──open()──► Connecting ──handshake ok──► Ready
//!  ▲                   │                          │
//!  └──attempts spent───┘        close() ──► Disconnecting ──┐
//!  ▲                                                        │
//!  └────────────── disconnect event ────────────────────────┘
//! ```
//!
//! Requested and external disconnects drive the same Ready → Idle
//! transition, which fails any pending response waiters as an exit action.

use std::time::Duration;

/// Connection lifecycle states.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LinkState {
    /// No peripheral link; `open()` starts from device selection.
    Idle,
    /// Inside the bounded retry loop (selection, GATT setup, handshake).
    Connecting,
    /// Link established and transmission ceiling negotiated.
    Ready,
    /// `close()` requested; waiting for the disconnect event.
    Disconnecting,
}

impl LinkState {
    /// Whether awaited commands may be issued in this state.
    #[inline]
    pub fn is_ready(&self) -> bool {
        matches!(self, LinkState::Ready)
    }
}

/// Link-layer error messages that mark a connection attempt as transient.
///
/// Platform BLE stacks report these for races that usually resolve on a
/// fresh attempt (stale bonding caches, slow supervision timeouts). Any
/// other failure aborts the retry loop on the spot.
pub const RETRYABLE_CONNECTION_ERRORS: [&str; 4] = [
    "connection attempt failed",
    "GATT operation failed for unknown reason",
    "GATT server is disconnected",
    "device already connected",
];

/// Default number of connection attempts.
pub const DEFAULT_ATTEMPTS: u32 = 5;

/// Default delay between connection attempts.
pub const DEFAULT_RETRY_DELAY: Duration = Duration::from_millis(1000);

/// Bounded retry policy for `open()`.
#[derive(Debug, Clone)]
pub struct RetryPolicy {
    /// Total attempts, including the first (minimum 1).
    pub attempts: u32,
    /// Delay between attempts.
    pub delay: Duration,
}

impl RetryPolicy {
    /// Create a policy with explicit attempt count and delay.
    pub fn new(attempts: u32, delay: Duration) -> Self {
        Self {
            attempts: attempts.max(1),
            delay,
        }
    }
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            attempts: DEFAULT_ATTEMPTS,
            delay: DEFAULT_RETRY_DELAY,
        }
    }
}
