//! # State Reconciler
//!
//! Every fetch result, push-triggered or poll-triggered, is merged here. A
//! result carries the [`FetchStamp`] issued when its fetch *started*; it is
//! committed only if that stamp is newer than the last committed one, so the
//! arrival order of responses never matters. Discarded results are logged,
//! never reported as errors.

use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use tokio::sync::watch;
use tokio_util::sync::CancellationToken;

use super::fetcher::EntityFetcher;
use super::lock;
use crate::error::{FetchError, WatchError, WatchResult};
use crate::models::{EntityId, FetchStamp};

/// Predicate over a payload deciding whether the watch should keep polling.
pub type WatchCondition<T> = Arc<dyn Fn(&T) -> bool + Send + Sync>;

/// What the presentation layer sees for one watched entity.
#[derive(Debug, Clone, PartialEq)]
pub struct EntityView<T> {
    /// The watched entity.
    pub entity_id: EntityId,
    /// Last committed payload, `None` until the first commit.
    pub payload: Option<T>,
    /// A fetch newer than the last settled one is outstanding.
    pub is_loading: bool,
    /// Most recent fetch error, cleared by the next commit.
    pub error: Option<WatchError>,
    /// Bumped every time the committed payload changes.
    pub version: u64,
    /// Watch condition evaluated on `payload`; true while nothing is loaded.
    pub condition_holds: bool,
    /// The hub connection is gone for good; only polling can refresh `payload`.
    pub offline: bool,
}

/// Result of offering a payload to the reconciler.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ReconcileOutcome {
    /// The payload was accepted.
    Committed {
        /// The payload differs from the previous one.
        changed: bool,
        /// The watch condition flipped from true to false with this commit.
        condition_cleared: bool,
    },
    /// A newer fetch already committed; the payload was dropped.
    Stale,
    /// The entity is not watched (never opened or already closed).
    Untracked,
}

struct WatchedEntity<T> {
    opened_at: FetchStamp,
    last_committed: Option<FetchStamp>,
    latest_issued: Option<FetchStamp>,
    payload: Option<T>,
    version: u64,
    is_loading: bool,
    error: Option<WatchError>,
    condition: WatchCondition<T>,
    condition_holds: bool,
    offline: bool,
    poll_token: Option<CancellationToken>,
    view_tx: watch::Sender<EntityView<T>>,
}

impl<T: Clone + PartialEq> WatchedEntity<T> {
    /// Results must come from fetches issued after this point.
    fn floor(&self) -> FetchStamp {
        self.last_committed.unwrap_or(self.opened_at)
    }

    fn settle(&mut self, stamp: FetchStamp) {
        if self.latest_issued.map_or(true, |latest| !latest.is_newer_than(&stamp)) {
            self.is_loading = false;
        }
    }

    fn view(&self, entity_id: &EntityId) -> EntityView<T> {
        EntityView {
            entity_id: entity_id.clone(),
            payload: self.payload.clone(),
            is_loading: self.is_loading,
            error: self.error.clone(),
            version: self.version,
            condition_holds: self.condition_holds,
            offline: self.offline,
        }
    }

    fn publish(&self, entity_id: &EntityId) {
        let next = self.view(entity_id);
        self.view_tx.send_if_modified(|current| {
            if *current == next {
                false
            } else {
                *current = next;
                true
            }
        });
    }
}

/// Stale-write-safe store of watched entities.
pub struct Reconciler<F: EntityFetcher> {
    fetcher: Arc<F>,
    fetch_timeout: Option<Duration>,
    entities: Mutex<HashMap<EntityId, WatchedEntity<F::Payload>>>,
    offline: AtomicBool,
}

impl<F: EntityFetcher> Reconciler<F> {
    /// Creates a reconciler fetching through `fetcher`.
    pub fn new(fetcher: Arc<F>, fetch_timeout: Option<Duration>) -> Self {
        Self {
            fetcher,
            fetch_timeout,
            entities: Mutex::new(HashMap::new()),
            offline: AtomicBool::new(false),
        }
    }

    /// Starts tracking `entity_id`. Re-tracking resets the entity.
    pub fn track(
        &self,
        entity_id: &EntityId,
        condition: WatchCondition<F::Payload>,
    ) -> watch::Receiver<EntityView<F::Payload>> {
        let mut entities = lock(&self.entities);
        let offline = self.offline.load(Ordering::Acquire);
        let initial = EntityView {
            entity_id: entity_id.clone(),
            payload: None,
            is_loading: false,
            error: None,
            version: 0,
            condition_holds: true,
            offline,
        };
        let (view_tx, view_rx) = watch::channel(initial);
        let entity = WatchedEntity {
            opened_at: FetchStamp::issue(),
            last_committed: None,
            latest_issued: None,
            payload: None,
            version: 0,
            is_loading: false,
            error: None,
            condition,
            condition_holds: true,
            offline,
            poll_token: None,
            view_tx,
        };
        if let Some(previous) = entities.insert(entity_id.clone(), entity) {
            if let Some(token) = previous.poll_token {
                token.cancel();
            }
        }
        drop(entities);
        log::debug!("Tracking {}", entity_id);
        view_rx
    }

    /// Stops tracking. Later results for the entity are discarded.
    pub fn untrack(&self, entity_id: &EntityId) -> bool {
        let removed = lock(&self.entities).remove(entity_id);
        match removed {
            Some(entity) => {
                if let Some(token) = entity.poll_token {
                    token.cancel();
                }
                log::debug!("Untracked {}", entity_id);
                true
            }
            None => false,
        }
    }

    /// Whether `entity_id` is currently tracked.
    pub fn is_tracked(&self, entity_id: &EntityId) -> bool {
        lock(&self.entities).contains_key(entity_id)
    }

    /// Issues the stamp for a fetch about to start and marks the entity loading.
    pub fn begin_fetch(&self, entity_id: &EntityId) -> FetchStamp {
        let stamp = FetchStamp::issue();
        let mut entities = lock(&self.entities);
        if let Some(entity) = entities.get_mut(entity_id) {
            entity.latest_issued = Some(stamp);
            entity.is_loading = true;
            entity.publish(entity_id);
        }
        stamp
    }

    /// Offers a fetched payload. Commits only if `fetch_started_at` is newer
    /// than the last committed fetch and than the moment the watch opened.
    pub fn reconcile(
        &self,
        entity_id: &EntityId,
        payload: F::Payload,
        fetch_started_at: FetchStamp,
    ) -> ReconcileOutcome {
        let mut entities = lock(&self.entities);
        let Some(entity) = entities.get_mut(entity_id) else {
            log::debug!("Dropping result for untracked {}", entity_id);
            return ReconcileOutcome::Untracked;
        };

        let floor = entity.floor();
        if !fetch_started_at.is_newer_than(&floor) {
            log::debug!(
                "Discarding stale result for {} (fetch #{} not newer than #{})",
                entity_id,
                fetch_started_at.seq(),
                floor.seq()
            );
            return ReconcileOutcome::Stale;
        }

        entity.last_committed = Some(fetch_started_at);
        let changed = entity.payload.as_ref() != Some(&payload);
        if changed {
            entity.payload = Some(payload);
            entity.version += 1;
        }
        entity.error = None;
        entity.settle(fetch_started_at);

        let holds = entity.payload.as_ref().map_or(true, |p| (entity.condition)(p));
        let condition_cleared = entity.condition_holds && !holds;
        entity.condition_holds = holds;
        if condition_cleared {
            log::info!("Watch condition cleared for {}, stopping poll", entity_id);
            if let Some(token) = entity.poll_token.take() {
                token.cancel();
            }
        }

        entity.publish(entity_id);
        ReconcileOutcome::Committed {
            changed,
            condition_cleared,
        }
    }

    /// Records a failed fetch. The committed payload is left untouched.
    pub fn reject(
        &self,
        entity_id: &EntityId,
        error: FetchError,
        fetch_started_at: FetchStamp,
    ) -> WatchError {
        let error = WatchError::Fetch(error);
        let mut entities = lock(&self.entities);
        if let Some(entity) = entities.get_mut(entity_id) {
            if fetch_started_at.is_newer_than(&entity.floor()) {
                entity.error = Some(error.clone());
            }
            entity.settle(fetch_started_at);
            entity.publish(entity_id);
        }
        log::warn!("Fetch for {} failed: {}", entity_id, error);
        error
    }

    /// Runs the fetch for an already issued stamp and merges the outcome.
    pub async fn complete_fetch(
        &self,
        entity_id: &EntityId,
        stamp: FetchStamp,
    ) -> WatchResult<ReconcileOutcome> {
        let request = self.fetcher.fetch(entity_id);
        let result = match self.fetch_timeout {
            Some(limit) => match tokio::time::timeout(limit, request).await {
                Ok(result) => result,
                Err(_) => Err(FetchError::Timeout(limit)),
            },
            None => request.await,
        };
        match result {
            Ok(payload) => Ok(self.reconcile(entity_id, payload, stamp)),
            Err(e) => Err(self.reject(entity_id, e, stamp)),
        }
    }

    /// Fetch-and-reconcile in one call.
    pub async fn refresh(&self, entity_id: &EntityId) -> WatchResult<ReconcileOutcome> {
        let stamp = self.begin_fetch(entity_id);
        self.complete_fetch(entity_id, stamp).await
    }

    /// Hands the reconciler the token that stops the entity's poll watch.
    ///
    /// The token is cancelled right away if the entity is gone or its
    /// condition already failed. Returns whether the token was kept.
    pub fn register_poll_token(&self, entity_id: &EntityId, token: CancellationToken) -> bool {
        let mut entities = lock(&self.entities);
        match entities.get_mut(entity_id) {
            Some(entity) if entity.condition_holds => {
                if let Some(previous) = entity.poll_token.replace(token) {
                    if !previous.is_cancelled() {
                        previous.cancel();
                    }
                }
                true
            }
            _ => {
                token.cancel();
                false
            }
        }
    }

    /// Evaluates `condition` against the current payload. An unloaded
    /// payload counts as holding. `None` if the entity is not tracked.
    pub fn evaluate(
        &self,
        entity_id: &EntityId,
        condition: &WatchCondition<F::Payload>,
    ) -> Option<bool> {
        let entities = lock(&self.entities);
        let entity = entities.get(entity_id)?;
        Some(entity.payload.as_ref().map_or(true, |p| condition(p)))
    }

    /// Current view of `entity_id`.
    pub fn snapshot(&self, entity_id: &EntityId) -> Option<EntityView<F::Payload>> {
        lock(&self.entities)
            .get(entity_id)
            .map(|entity| entity.view(entity_id))
    }

    /// Flags every view, current and future, as offline or back online and
    /// republishes the ones that changed. Returns how many were republished.
    pub fn set_offline(&self, offline: bool) -> usize {
        let mut entities = lock(&self.entities);
        self.offline.store(offline, Ordering::Release);
        let mut republished = 0;
        for (entity_id, entity) in entities.iter_mut() {
            if entity.offline != offline {
                entity.offline = offline;
                entity.publish(entity_id);
                republished += 1;
            }
        }
        republished
    }

    /// Whether views are currently flagged offline.
    pub fn is_offline(&self) -> bool {
        self.offline.load(Ordering::Acquire)
    }

    /// Ids of every tracked entity.
    pub fn tracked(&self) -> Vec<EntityId> {
        lock(&self.entities).keys().cloned().collect()
    }
}
