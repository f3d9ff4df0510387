//! Single-flight guard around the producer tick, with a stuck-tick watchdog.
//!
//! A tick that arrives while the previous one is still running is skipped and
//! counted. Once `skipping_counter_limit` consecutive ticks have been skipped
//! the process is considered wedged and the terminator is invoked, exactly once.
use std::future::Future;
use std::sync::atomic::{AtomicBool, AtomicU32, Ordering};
use std::sync::Arc;

use thiserror::Error;
use tracing::{error, info, warn};

/// Reason handed to the terminator when the watchdog fires.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Error)]
#[error("tick still running after {skipped} skipped ticks (limit {limit})")]
pub struct WatchdogTriggered {
    pub skipped: u32,
    pub limit: u32,
}

/// Process-level "give up" action. An external supervisor restarts us.
pub trait ProcessTerminator: Send + Sync {
    fn terminate(&self, reason: &WatchdogTriggered);
}

/// Exits the process with a fixed status code.
#[derive(Debug, Clone, Copy)]
pub struct ExitTerminator {
    pub code: i32,
}

impl Default for ExitTerminator {
    fn default() -> Self {
        Self { code: 1 }
    }
}

impl ProcessTerminator for ExitTerminator {
    fn terminate(&self, reason: &WatchdogTriggered) {
        error!(%reason, code = self.code, "watchdog triggered; terminating process");
        std::process::exit(self.code);
    }
}

/// Result of offering one scheduler tick to the guard.
#[derive(Debug)]
pub enum TickOutcome<T> {
    /// The tick ran to completion (successfully or not).
    Ran(T),
    /// Previous tick still busy; this one was dropped.
    Skipped { consecutive: u32 },
    /// Skip limit reached; the terminator has been invoked.
    WatchdogTriggered(WatchdogTriggered),
}

impl<T> TickOutcome<T> {
    pub fn ran(&self) -> bool {
        matches!(self, TickOutcome::Ran(_))
    }
}

pub struct TickGuard {
    busy: AtomicBool,
    skipped: AtomicU32,
    tripped: AtomicBool,
    limit: u32,
    terminator: Arc<dyn ProcessTerminator>,
}

/// Clears `busy` on every exit path, including unwinding.
struct BusyLease<'a> {
    busy: &'a AtomicBool,
}

impl Drop for BusyLease<'_> {
    fn drop(&mut self) {
        self.busy.store(false, Ordering::Release);
    }
}

impl TickGuard {
    pub fn new(skipping_counter_limit: u32, terminator: Arc<dyn ProcessTerminator>) -> Self {
        Self {
            busy: AtomicBool::new(false),
            skipped: AtomicU32::new(0),
            tripped: AtomicBool::new(false),
            limit: skipping_counter_limit.max(1),
            terminator,
        }
    }

    pub fn is_busy(&self) -> bool {
        self.busy.load(Ordering::Acquire)
    }

    pub fn skipped_ticks(&self) -> u32 {
        self.skipped.load(Ordering::Acquire)
    }

    /// True once the watchdog has fired.
    pub fn is_tripped(&self) -> bool {
        self.tripped.load(Ordering::Acquire)
    }

    pub fn limit(&self) -> u32 {
        self.limit
    }

    /// Offer one tick. Runs `task` only if no other tick is in flight.
    pub async fn run<F, Fut, T>(&self, task: F) -> TickOutcome<T>
    where
        F: FnOnce() -> Fut,
        Fut: Future<Output = T>,
    {
        if self.is_tripped() {
            return TickOutcome::WatchdogTriggered(WatchdogTriggered {
                skipped: self.skipped_ticks(),
                limit: self.limit,
            });
        }

        let Some(_lease) = self.try_acquire() else {
            return self.skip();
        };
        self.skipped.store(0, Ordering::Release);

        TickOutcome::Ran(task().await)
    }

    fn try_acquire(&self) -> Option<BusyLease<'_>> {
        self.busy
            .compare_exchange(false, true, Ordering::AcqRel, Ordering::Acquire)
            .ok()
            .map(|_| BusyLease { busy: &self.busy })
    }

    fn skip<T>(&self) -> TickOutcome<T> {
        let consecutive = self.skipped.fetch_add(1, Ordering::AcqRel) + 1;
        if consecutive < self.limit {
            info!(consecutive, limit = self.limit, "previous tick still running; skipping");
            return TickOutcome::Skipped { consecutive };
        }

        let reason = WatchdogTriggered {
            skipped: consecutive,
            limit: self.limit,
        };
        if !self.tripped.swap(true, Ordering::AcqRel) {
            warn!(%reason, "skip limit reached");
            self.terminator.terminate(&reason);
        }
        TickOutcome::WatchdogTriggered(reason)
    }
}

impl std::fmt::Debug for TickGuard {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("TickGuard")
            .field("busy", &self.is_busy())
            .field("skipped", &self.skipped_ticks())
            .field("limit", &self.limit)
            .finish_non_exhaustive()
    }
}
