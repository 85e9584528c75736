//! # Poll Fallback Scheduler
//!
//! One repeating timer per watched entity, running the same
//! fetch-and-reconcile path as a push while the watch condition holds. Push
//! and poll never coordinate directly; the reconciler's stamp ordering keeps
//! them from overwriting each other.
//!
//! ## Watch lifecycle
//! - `Idle -> Watching` on [`PollScheduler::watch`].
//! - `Watching -> Idle` when the condition clears (the reconciler cancels the
//!   token, or a tick finds the condition false), on `unwatch`, or when the
//!   entity is closed.
//!
//! A failed fetch is not retried; the next tick runs at the normal interval.

use std::collections::HashMap;
use std::sync::{Arc, Mutex};
use std::time::Duration;

use tokio::time::{interval_at, Instant, MissedTickBehavior};
use tokio_util::sync::CancellationToken;

use super::fetcher::EntityFetcher;
use super::lock;
use super::reconciler::{Reconciler, WatchCondition};
use crate::models::EntityId;

/// State of one entity's poll watch.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum WatchPhase {
    /// No timer is running.
    Idle,
    /// A timer is scheduled.
    Watching,
}

struct PollWatch {
    token: CancellationToken,
    interval: Duration,
}

/// Owns the poll timers.
pub struct PollScheduler<F: EntityFetcher> {
    reconciler: Arc<Reconciler<F>>,
    watches: Mutex<HashMap<EntityId, PollWatch>>,
}

impl<F: EntityFetcher> PollScheduler<F> {
    /// Scheduler feeding `reconciler`.
    pub fn new(reconciler: Arc<Reconciler<F>>) -> Self {
        Self {
            reconciler,
            watches: Mutex::new(HashMap::new()),
        }
    }

    /// Starts polling `entity_id` every `interval` while `condition` holds.
    ///
    /// The entity must be tracked by the reconciler. An existing watch for
    /// the same entity is replaced, so there is never more than one timer.
    pub fn watch(&self, entity_id: &EntityId, interval: Duration, condition: WatchCondition<F::Payload>) {
        let token = CancellationToken::new();
        {
            let mut watches = lock(&self.watches);
            watches.retain(|_, w| !w.token.is_cancelled());
            let previous = watches.insert(
                entity_id.clone(),
                PollWatch {
                    token: token.clone(),
                    interval,
                },
            );
            if let Some(previous) = previous {
                log::debug!("Replacing poll watch for {} ({:?})", entity_id, previous.interval);
                previous.token.cancel();
            }
        }

        if !self.reconciler.register_poll_token(entity_id, token.clone()) {
            log::debug!("Not polling {}: untracked or condition already cleared", entity_id);
            return;
        }

        log::info!("Polling {} every {:?}", entity_id, interval);
        tokio::spawn(poll_loop(
            Arc::clone(&self.reconciler),
            entity_id.clone(),
            interval,
            condition,
            token,
        ));
    }

    /// Cancels the timer for `entity_id`. No-op when nothing is watched.
    pub fn unwatch(&self, entity_id: &EntityId) -> bool {
        match lock(&self.watches).remove(entity_id) {
            Some(watch) => {
                let was_running = !watch.token.is_cancelled();
                watch.token.cancel();
                if was_running {
                    log::debug!("Stopped polling {}", entity_id);
                }
                was_running
            }
            None => false,
        }
    }

    /// Whether a timer is scheduled for `entity_id`.
    pub fn is_watching(&self, entity_id: &EntityId) -> bool {
        self.phase(entity_id) == WatchPhase::Watching
    }

    /// Current phase of the watch for `entity_id`.
    pub fn phase(&self, entity_id: &EntityId) -> WatchPhase {
        match lock(&self.watches).get(entity_id) {
            Some(watch) if !watch.token.is_cancelled() => WatchPhase::Watching,
            _ => WatchPhase::Idle,
        }
    }
}

impl<F: EntityFetcher> Drop for PollScheduler<F> {
    fn drop(&mut self) {
        for (_, watch) in lock(&self.watches).drain() {
            watch.token.cancel();
        }
    }
}

async fn poll_loop<F: EntityFetcher>(
    reconciler: Arc<Reconciler<F>>,
    entity_id: EntityId,
    interval: Duration,
    condition: WatchCondition<F::Payload>,
    token: CancellationToken,
) {
    let mut ticker = interval_at(Instant::now() + interval, interval);
    ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);

    loop {
        tokio::select! {
            biased;
            _ = token.cancelled() => break,
            _ = ticker.tick() => {}
        }

        // --- Phase 1: Re-check the watch condition ---
        match reconciler.evaluate(&entity_id, &condition) {
            None => {
                log::debug!("{} is no longer tracked, stopping poll", entity_id);
                token.cancel();
                break;
            }
            Some(false) => {
                log::info!("Watch condition for {} no longer holds, stopping poll", entity_id);
                token.cancel();
                break;
            }
            Some(true) => {}
        }

        // --- Phase 2: Fetch and reconcile ---
        let stamp = reconciler.begin_fetch(&entity_id);
        match reconciler.complete_fetch(&entity_id, stamp).await {
            Ok(outcome) => log::debug!("Poll of {}: {:?}", entity_id, outcome),
            Err(e) => log::warn!("Poll of {} failed, waiting for next tick: {}", entity_id, e),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::FetchError;
    use crate::test_support::{order, rounded_secs, while_unassigned, ScriptedFetcher};
    use tokio::time::sleep;

    fn setup(id: u64) -> (Arc<ScriptedFetcher>, Arc<Reconciler<ScriptedFetcher>>, EntityId) {
        let fetcher = ScriptedFetcher::new();
        fetcher.set_fallback(order(id, false));
        let reconciler = Arc::new(Reconciler::new(Arc::clone(&fetcher), None));
        let entity_id = EntityId::from(id);
        reconciler.track(&entity_id, while_unassigned());
        (fetcher, reconciler, entity_id)
    }

    fn offsets(fetcher: &ScriptedFetcher, start: Instant) -> Vec<u64> {
        fetcher
            .call_times()
            .into_iter()
            .map(|t| rounded_secs(t - start))
            .collect()
    }

    #[tokio::test(start_paused = true)]
    async fn ticks_run_at_the_interval() {
        let start = Instant::now();
        let (fetcher, reconciler, id) = setup(1);
        let scheduler = PollScheduler::new(Arc::clone(&reconciler));

        scheduler.watch(&id, Duration::from_secs(20), while_unassigned());
        assert_eq!(scheduler.phase(&id), WatchPhase::Watching);
        sleep(Duration::from_secs(61)).await;

        assert_eq!(offsets(&fetcher, start), vec![20, 40, 60]);
        assert_eq!(reconciler.snapshot(&id).unwrap().payload, Some(order(1, false)));
    }

    #[tokio::test(start_paused = true)]
    async fn unwatch_stops_all_fetches() {
        let (fetcher, reconciler, id) = setup(1);
        let scheduler = PollScheduler::new(reconciler);

        scheduler.watch(&id, Duration::from_secs(20), while_unassigned());
        assert!(scheduler.unwatch(&id));
        sleep(Duration::from_secs(300)).await;

        assert_eq!(fetcher.calls(), 0);
        assert_eq!(scheduler.phase(&id), WatchPhase::Idle);
        assert!(!scheduler.unwatch(&id));
        assert!(!scheduler.unwatch(&EntityId::from(404u64)));
    }

    #[tokio::test(start_paused = true)]
    async fn failed_tick_keeps_payload_and_interval() {
        let start = Instant::now();
        let (fetcher, reconciler, id) = setup(1);
        reconciler.reconcile(&id, order(1, false), reconciler.begin_fetch(&id));
        fetcher.push_err(FetchError::Network("connection refused".into()));
        let scheduler = PollScheduler::new(Arc::clone(&reconciler));

        scheduler.watch(&id, Duration::from_secs(20), while_unassigned());
        sleep(Duration::from_secs(21)).await;
        let view = reconciler.snapshot(&id).unwrap();
        assert_eq!(view.payload, Some(order(1, false)));
        assert_eq!(view.version, 1);
        assert!(view.error.is_some());

        sleep(Duration::from_secs(20)).await;
        assert_eq!(offsets(&fetcher, start), vec![20, 40]);
        assert!(reconciler.snapshot(&id).unwrap().error.is_none());
        assert!(scheduler.is_watching(&id));
    }

    #[tokio::test(start_paused = true)]
    async fn poll_that_clears_condition_stops_itself() {
        let (fetcher, reconciler, id) = setup(1);
        fetcher.push_ok(order(1, true));
        let scheduler = PollScheduler::new(reconciler);

        scheduler.watch(&id, Duration::from_secs(20), while_unassigned());
        sleep(Duration::from_secs(200)).await;

        assert_eq!(fetcher.calls(), 1);
        assert!(!scheduler.is_watching(&id));
    }

    #[tokio::test(start_paused = true)]
    async fn no_timer_when_condition_already_false() {
        let (fetcher, reconciler, id) = setup(1);
        reconciler.reconcile(&id, order(1, true), reconciler.begin_fetch(&id));
        let scheduler = PollScheduler::new(Arc::clone(&reconciler));

        scheduler.watch(&id, Duration::from_secs(20), while_unassigned());
        sleep(Duration::from_secs(100)).await;

        assert!(!scheduler.is_watching(&id));
        assert_eq!(fetcher.calls(), 0);
    }

    #[tokio::test(start_paused = true)]
    async fn rewatch_replaces_the_timer() {
        let start = Instant::now();
        let (fetcher, reconciler, id) = setup(1);
        let scheduler = PollScheduler::new(reconciler);

        scheduler.watch(&id, Duration::from_secs(20), while_unassigned());
        scheduler.watch(&id, Duration::from_secs(30), while_unassigned());
        sleep(Duration::from_secs(61)).await;

        assert_eq!(offsets(&fetcher, start), vec![30, 60]);
    }

    #[tokio::test(start_paused = true)]
    async fn untracked_entity_ends_the_watch() {
        let (fetcher, reconciler, id) = setup(1);
        let scheduler = PollScheduler::new(Arc::clone(&reconciler));

        scheduler.watch(&id, Duration::from_secs(20), while_unassigned());
        reconciler.untrack(&id);
        sleep(Duration::from_secs(100)).await;

        assert_eq!(fetcher.calls(), 0);
        assert!(!scheduler.is_watching(&id));
    }
}
