//! Cancellation Gate
//!
//! The only state shared between a session's inbound reader and its
//! streaming loop. The gate moves through three states:
//!
//! ```text
//!  arm_if_idle()          signal()            disarm()
//! Idle ─────────► Armed ─────────► Cancelled ───────► Idle
//!                   └──────────────────────────────────┘
//!                                 disarm()
//! ```
//!
//! `signal()` only succeeds while a request is armed, so a cancel that lands
//! after the request finished (or before any request started) is a no-op and
//! cannot leak into the next request. All transitions are sequentially
//! consistent atomics.

use std::sync::atomic::{AtomicU8, Ordering};

use tokio::sync::Notify;

const IDLE: u8 = 0;
const ARMED: u8 = 1;
const CANCELLED: u8 = 2;

/// Shared cancellation flag for one session
#[derive(Debug, Default)]
pub struct CancellationGate {
    state: AtomicU8,
    notify: Notify,
}

impl CancellationGate {
    /// Create an idle gate
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Arm the gate unless a request already holds it
    ///
    /// A cancellation that landed on an already armed gate is kept. Returns
    /// whether the gate moved from idle to armed.
    pub fn arm_if_idle(&self) -> bool {
        self.state
            .compare_exchange(IDLE, ARMED, Ordering::SeqCst, Ordering::SeqCst)
            .is_ok()
    }

    /// Request cancellation of the armed request
    ///
    /// Returns `false` (and changes nothing) when no request is armed or the
    /// request was already cancelled.
    pub fn signal(&self) -> bool {
        let accepted = self
            .state
            .compare_exchange(ARMED, CANCELLED, Ordering::SeqCst, Ordering::SeqCst)
            .is_ok();
        if accepted {
            self.notify.notify_waiters();
        }
        accepted
    }

    /// Whether the armed request has been cancelled
    #[must_use]
    pub fn is_cancelled(&self) -> bool {
        self.state.load(Ordering::SeqCst) == CANCELLED
    }

    /// Stop accepting cancellation, returning whether a cancel won the race
    pub fn disarm(&self) -> bool {
        self.state.swap(IDLE, Ordering::SeqCst) == CANCELLED
    }

    /// Wait until the armed request is cancelled
    ///
    /// Never resolves for a request that is not cancelled.
    pub async fn cancelled(&self) {
        loop {
            let notified = self.notify.notified();
            tokio::pin!(notified);
            notified.as_mut().enable();
            if self.is_cancelled() {
                return;
            }
            notified.await;
        }
    }
}
