//! Graceful shutdown coordination.
//!
//! Tracks in-flight RPC work so shutdown can stop admissions, drain what
//! is already running within a bounded wait, and only then tear the
//! subsystems down.

use std::sync::atomic::{AtomicU32, AtomicU8, Ordering};
use std::sync::Arc;
use std::time::Duration;

use tokio::sync::Notify;

const STATE_RUNNING: u8 = 0;
const STATE_DRAINING: u8 = 1;
const STATE_STOPPED: u8 = 2;

/// Shutdown state machine.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ShutdownState {
    Running,
    Draining,
    Stopped,
}

/// Result of a drain attempt.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DrainResult {
    Complete,
    Timeout { remaining: u32 },
}

/// Coordinates graceful shutdown across runtime components.
pub struct ShutdownCoordinator {
    state: AtomicU8,
    in_flight: AtomicU32,
    drained: Notify,
}

impl ShutdownCoordinator {
    pub fn new() -> Self {
        Self {
            state: AtomicU8::new(STATE_RUNNING),
            in_flight: AtomicU32::new(0),
            drained: Notify::new(),
        }
    }

    pub fn state(&self) -> ShutdownState {
        match self.state.load(Ordering::SeqCst) {
            STATE_RUNNING => ShutdownState::Running,
            STATE_DRAINING => ShutdownState::Draining,
            _ => ShutdownState::Stopped,
        }
    }

    /// True while new work may be admitted.
    pub fn is_accepting(&self) -> bool {
        self.state.load(Ordering::SeqCst) == STATE_RUNNING
    }

    /// Track one in-flight unit of work. `None` once draining started.
    pub fn track(self: &Arc<Self>) -> Option<InFlightGuard> {
        if !self.is_accepting() {
            return None;
        }
        self.in_flight.fetch_add(1, Ordering::SeqCst);
        Some(InFlightGuard { coordinator: self.clone() })
    }

    pub fn in_flight(&self) -> u32 {
        self.in_flight.load(Ordering::SeqCst)
    }

    /// Stop admissions and wait (bounded) for in-flight work to finish.
    pub async fn drain(&self, timeout: Duration) -> DrainResult {
        self.state.store(STATE_DRAINING, Ordering::SeqCst);
        let deadline = tokio::time::Instant::now() + timeout;

        let result = loop {
            let remaining_work = self.in_flight();
            if remaining_work == 0 {
                break DrainResult::Complete;
            }
            let remaining_time = deadline.saturating_duration_since(tokio::time::Instant::now());
            if remaining_time.is_zero() {
                break DrainResult::Timeout { remaining: remaining_work };
            }
            tokio::select! {
                () = self.drained.notified() => {}
                () = tokio::time::sleep(remaining_time) => {}
            }
        };

        self.state.store(STATE_STOPPED, Ordering::SeqCst);
        result
    }
}

impl Default for ShutdownCoordinator {
    fn default() -> Self {
        Self::new()
    }
}

/// RAII guard for in-flight work tracking.
pub struct InFlightGuard {
    coordinator: Arc<ShutdownCoordinator>,
}

impl Drop for InFlightGuard {
    fn drop(&mut self) {
        self.coordinator.in_flight.fetch_sub(1, Ordering::SeqCst);
        self.coordinator.drained.notify_waiters();
    }
}
