//! Fixed-interval driver that feeds producer ticks through the guard.
use std::sync::Arc;
use std::time::Duration;

use tokio::sync::watch;
use tokio::task::JoinSet;
use tokio::time::MissedTickBehavior;
use tracing::{debug, error, info, instrument, warn};

use crate::db::RepositoryError;
use crate::guard::{TickGuard, TickOutcome};
use crate::producer::{MediaProducer, TickReport};

pub type GuardedTick = TickOutcome<Result<TickReport, RepositoryError>>;

/// How the scheduler ended.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Drain {
    /// Every in-flight tick finished on its own.
    Clean,
    /// Ticks were still running when the drain deadline passed and were aborted.
    Abandoned { aborted: usize },
}

/// Fixed-interval driver. Every beat spawns a guarded tick so a slow tick
/// shows up as skipped beats rather than a delayed timer.
#[derive(Debug, Clone)]
pub struct Scheduler {
    producer: Arc<MediaProducer>,
    guard: Arc<TickGuard>,
    every: Duration,
}

impl Scheduler {
    pub fn new(producer: Arc<MediaProducer>, guard: Arc<TickGuard>, every: Duration) -> Self {
        Self {
            producer,
            guard,
            every,
        }
    }

    /// Offer a single tick to the guard and log how it went.
    pub async fn tick(&self) -> GuardedTick {
        run_guarded_tick(&self.producer, &self.guard).await
    }

    /// Longest wait for in-flight ticks once the loop stops: the same span the
    /// watchdog would tolerate (`every * skipping_counter_limit`).
    pub fn drain_timeout(&self) -> Duration {
        self.every.saturating_mul(self.guard.limit())
    }

    /// Run until `shutdown` flips to true or the watchdog trips, then wait for
    /// the in-flight tick, aborting it after `drain_timeout`.
    #[instrument(skip_all, fields(every_ms = self.every.as_millis() as u64))]
    pub async fn run(self, mut shutdown: watch::Receiver<bool>) -> Drain {
        let mut interval = tokio::time::interval(self.every);
        interval.set_missed_tick_behavior(MissedTickBehavior::Skip);
        let mut in_flight: JoinSet<()> = JoinSet::new();

        info!(source = %self.producer.settings().source, "scheduler started");
        loop {
            tokio::select! {
                _ = interval.tick() => {
                    reap(&mut in_flight);
                    if self.guard.is_tripped() {
                        warn!("watchdog tripped; scheduler stops issuing ticks");
                        break;
                    }
                    let producer = self.producer.clone();
                    let guard = self.guard.clone();
                    in_flight.spawn(async move {
                        run_guarded_tick(&producer, &guard).await;
                    });
                }
                changed = shutdown.changed() => {
                    if changed.is_err() || *shutdown.borrow() {
                        info!("shutdown requested");
                        break;
                    }
                }
            }
        }

        let drain = self.drain(&mut in_flight).await;
        info!(?drain, "scheduler stopped");
        drain
    }

    async fn drain(&self, in_flight: &mut JoinSet<()>) -> Drain {
        let deadline = self.drain_timeout();
        let finished = tokio::time::timeout(deadline, async {
            while let Some(joined) = in_flight.join_next().await {
                if let Err(err) = joined {
                    error!(?err, "tick task aborted");
                }
            }
        })
        .await;
        if finished.is_ok() {
            return Drain::Clean;
        }

        let aborted = in_flight.len();
        error!(
            aborted,
            timeout_ms = deadline.as_millis() as u64,
            "in-flight tick did not finish before shutdown deadline; aborting"
        );
        in_flight.abort_all();
        while in_flight.join_next().await.is_some() {}
        Drain::Abandoned { aborted }
    }
}

fn reap(in_flight: &mut JoinSet<()>) {
    while let Some(joined) = in_flight.try_join_next() {
        if let Err(err) = joined {
            error!(?err, "tick task aborted");
        }
    }
}

pub async fn run_guarded_tick(producer: &MediaProducer, guard: &TickGuard) -> GuardedTick {
    let outcome = guard.run(|| producer.run_tick()).await;
    match &outcome {
        TickOutcome::Ran(Ok(report)) if report.is_idle() => debug!("tick idle"),
        TickOutcome::Ran(Ok(report)) => info!(
            fetched = report.fetched,
            sent = report.sent,
            failed = report.failed,
            "tick completed"
        ),
        TickOutcome::Ran(Err(err)) => error!(%err, "tick failed"),
        TickOutcome::Skipped { .. } => {}
        TickOutcome::WatchdogTriggered(reason) => error!(%reason, "tick refused; watchdog tripped"),
    }
    outcome
}
