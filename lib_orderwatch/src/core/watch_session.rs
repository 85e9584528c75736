//! # Watch Session
//!
//! Presentation-facing facade. `open_watch` wires one order into the push
//! path (dispatcher subscription), the poll path (scheduler timer) and the
//! reconciler, and returns a [`WatchHandle`] exposing the reconciled view.
//! `close_watch` tears all three down synchronously; a fetch already in
//! flight is left to finish and its result is discarded by the reconciler.
//!
//! Once the connection manager gives up reconnecting, every open view is
//! republished with `offline` set. A later successful connect clears it.

use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex, Weak};

use tokio::sync::watch;
use tokio_util::sync::{CancellationToken, DropGuard};

use super::connection_manager::{ConnectionHandle, ConnectionState};
use super::dispatcher::{Dispatcher, SubscriptionHandle};
use super::fetcher::EntityFetcher;
use super::lock;
use super::poll_scheduler::PollScheduler;
use super::reconciler::{EntityView, Reconciler, WatchCondition};
use crate::configs::WatchConfig;
use crate::error::WatchResult;
use crate::models::{AssignOrderEvent, EntityId, ASSIGN_ORDER};

struct OpenWatch {
    generation: u64,
    subscription: SubscriptionHandle,
}

/// Shared by every open detail view of one process.
pub struct WatchSession<F: EntityFetcher> {
    connection: ConnectionHandle,
    dispatcher: Arc<Dispatcher>,
    reconciler: Arc<Reconciler<F>>,
    scheduler: PollScheduler<F>,
    config: WatchConfig,
    open: Mutex<HashMap<EntityId, OpenWatch>>,
    next_generation: AtomicU64,
    _resync: DropGuard,
}

impl<F: EntityFetcher> WatchSession<F> {
    /// Builds the session on an established connection and hooks the
    /// dispatcher into `AssignOrder` once. Must be called inside a tokio runtime.
    pub fn new(connection: ConnectionHandle, fetcher: Arc<F>, config: WatchConfig) -> WatchResult<Arc<Self>> {
        config.validate()?;

        let dispatcher = Arc::new(Dispatcher::new(config.dedupe_window()));
        dispatcher.attach(&connection, ASSIGN_ORDER);
        let reconciler = Arc::new(Reconciler::new(fetcher, config.fetch_timeout()));
        let scheduler = PollScheduler::new(Arc::clone(&reconciler));

        let resync = CancellationToken::new();
        let states = connection.state_changes();
        let reconnects = connection.reconnect_count();

        let session = Arc::new(Self {
            connection,
            dispatcher,
            reconciler,
            scheduler,
            config,
            open: Mutex::new(HashMap::new()),
            next_generation: AtomicU64::new(1),
            _resync: resync.clone().drop_guard(),
        });

        tokio::spawn(resync_after_reconnect(
            Arc::downgrade(&session),
            states,
            reconnects,
            resync,
        ));
        Ok(session)
    }

    /// Opens a watch on `entity_id`, replacing any open watch for it.
    ///
    /// The poll timer runs while `condition` holds on the latest payload.
    /// An initial fetch is issued right away.
    pub fn open_watch(
        self: &Arc<Self>,
        entity_id: impl Into<EntityId>,
        condition: WatchCondition<F::Payload>,
    ) -> WatchHandle<F> {
        let entity_id = entity_id.into();
        self.close_watch(&entity_id);

        let view_rx = self.reconciler.track(&entity_id, Arc::clone(&condition));

        let reconciler = Arc::clone(&self.reconciler);
        let subscription = self
            .dispatcher
            .subscribe(ASSIGN_ORDER, entity_id.clone(), move |subject, args| {
                if let Some(event) = AssignOrderEvent::from_args(args) {
                    log::info!(
                        "AssignOrder push for {} (isAssigned: {:?})",
                        event.order_id,
                        event.is_assigned
                    );
                }
                spawn_fetch(&reconciler, subject.clone(), "push");
            });

        let generation = self.next_generation.fetch_add(1, Ordering::Relaxed);
        self.register_open(
            &entity_id,
            OpenWatch {
                generation,
                subscription,
            },
        );

        self.scheduler
            .watch(&entity_id, self.config.poll_interval(), condition);
        spawn_fetch(&self.reconciler, entity_id.clone(), "initial");
        log::info!("Opened watch for {}", entity_id);

        WatchHandle {
            entity_id,
            generation,
            view_rx,
            session: Arc::downgrade(self),
        }
    }

    /// Records `watch` as the open watch for `entity_id`. A watch displaced by
    /// a concurrent `open_watch` only loses its subscription; the entity is
    /// already tracked again for the newer watch.
    fn register_open(&self, entity_id: &EntityId, watch: OpenWatch) {
        let displaced = lock(&self.open).insert(entity_id.clone(), watch);
        if let Some(mut displaced) = displaced {
            displaced.subscription.release();
            log::debug!(
                "Watch generation {} for {} displaced by a concurrent open",
                displaced.generation,
                entity_id
            );
        }
    }

    /// Closes the watch: unsubscribe, stop polling, stop tracking.
    /// Returns false if nothing was open.
    pub fn close_watch(&self, entity_id: &EntityId) -> bool {
        let removed = lock(&self.open).remove(entity_id);
        match removed {
            Some(open) => {
                self.teardown(entity_id, open);
                true
            }
            None => false,
        }
    }

    fn close_generation(&self, entity_id: &EntityId, generation: u64) -> bool {
        let removed = {
            let mut open = lock(&self.open);
            match open.get(entity_id) {
                Some(watch) if watch.generation == generation => open.remove(entity_id),
                _ => None,
            }
        };
        match removed {
            Some(open) => {
                self.teardown(entity_id, open);
                true
            }
            None => false,
        }
    }

    fn teardown(&self, entity_id: &EntityId, mut open: OpenWatch) {
        open.subscription.release();
        self.scheduler.unwatch(entity_id);
        self.reconciler.untrack(entity_id);
        log::info!("Closed watch for {}", entity_id);
    }

    /// Closes every open watch.
    pub fn close_all(&self) {
        let drained: Vec<(EntityId, OpenWatch)> = lock(&self.open).drain().collect();
        for (entity_id, open) in drained {
            self.teardown(&entity_id, open);
        }
    }

    /// Re-fetches every open watch once.
    pub fn refresh_all(&self) -> usize {
        let ids: Vec<EntityId> = lock(&self.open).keys().cloned().collect();
        for entity_id in &ids {
            spawn_fetch(&self.reconciler, entity_id.clone(), "resync");
        }
        ids.len()
    }

    /// Whether a watch is open for `entity_id`.
    pub fn is_watching(&self, entity_id: &EntityId) -> bool {
        lock(&self.open).contains_key(entity_id)
    }

    /// Whether the poll fallback is still running for `entity_id`.
    pub fn is_polling(&self, entity_id: &EntityId) -> bool {
        self.scheduler.is_watching(entity_id)
    }

    /// Current view of `entity_id`, if open.
    pub fn view(&self, entity_id: &EntityId) -> Option<EntityView<F::Payload>> {
        self.reconciler.snapshot(entity_id)
    }

    /// Number of open watches.
    pub fn open_count(&self) -> usize {
        lock(&self.open).len()
    }

    /// The shared hub connection.
    pub fn connection(&self) -> &ConnectionHandle {
        &self.connection
    }

    /// The reconciler behind this session.
    pub fn reconciler(&self) -> &Arc<Reconciler<F>> {
        &self.reconciler
    }

    #[cfg(test)]
    pub(crate) fn dispatcher(&self) -> &Arc<Dispatcher> {
        &self.dispatcher
    }
}

impl<F: EntityFetcher> Drop for WatchSession<F> {
    fn drop(&mut self) {
        self.dispatcher.detach_all(&self.connection);
    }
}

/// Issues the stamp now, on the caller's turn, and runs the fetch in the background.
fn spawn_fetch<F: EntityFetcher>(reconciler: &Arc<Reconciler<F>>, entity_id: EntityId, origin: &'static str) {
    let stamp = reconciler.begin_fetch(&entity_id);
    let reconciler = Arc::clone(reconciler);
    tokio::spawn(async move {
        match reconciler.complete_fetch(&entity_id, stamp).await {
            Ok(outcome) => log::debug!("{} fetch of {}: {:?}", origin, entity_id, outcome),
            Err(e) => log::warn!("{} fetch of {} failed: {}", origin, entity_id, e),
        }
    });
}

async fn resync_after_reconnect<F: EntityFetcher>(
    session: Weak<WatchSession<F>>,
    mut states: watch::Receiver<ConnectionState>,
    mut seen_reconnects: u64,
    stop: CancellationToken,
) {
    loop {
        tokio::select! {
            biased;
            _ = stop.cancelled() => break,
            changed = states.changed() => {
                if changed.is_err() {
                    break;
                }
            }
        }
        let state = *states.borrow_and_update();
        let Some(session) = session.upgrade() else {
            break;
        };
        match state {
            ConnectionState::Connected => {
                if session.reconciler.set_offline(false) > 0 {
                    log::info!("Hub back online");
                }
                let reconnects = session.connection.reconnect_count();
                if reconnects > seen_reconnects {
                    seen_reconnects = reconnects;
                    let refreshed = session.refresh_all();
                    log::info!("Hub reconnected, refreshed {} open watch(es)", refreshed);
                }
            }
            ConnectionState::Disconnected if session.connection.is_offline() => {
                let flagged = session.reconciler.set_offline(true);
                log::warn!("Hub connection lost, {} open view(s) marked offline", flagged);
            }
            _ => {}
        }
    }
}

/// A caller's view of one open watch. Dropping it closes the watch.
pub struct WatchHandle<F: EntityFetcher> {
    entity_id: EntityId,
    generation: u64,
    view_rx: watch::Receiver<EntityView<F::Payload>>,
    session: Weak<WatchSession<F>>,
}

impl<F: EntityFetcher> WatchHandle<F> {
    /// The watched entity.
    pub fn entity_id(&self) -> &EntityId {
        &self.entity_id
    }

    /// Latest view: payload, loading flag and last error.
    pub fn view(&self) -> EntityView<F::Payload> {
        self.view_rx.borrow().clone()
    }

    /// A receiver of view updates, independent of this handle.
    pub fn subscribe(&self) -> watch::Receiver<EntityView<F::Payload>> {
        self.view_rx.clone()
    }

    /// Whether the hub is gone for good and only polling keeps this view fresh.
    pub fn is_offline(&self) -> bool {
        self.view_rx.borrow().offline
    }

    /// Waits for the next view change. `None` once the watch is closed.
    pub async fn changed(&mut self) -> Option<EntityView<F::Payload>> {
        self.view_rx.changed().await.ok()?;
        Some(self.view_rx.borrow_and_update().clone())
    }

    /// Closes the watch now.
    pub fn close(self) {}
}

impl<F: EntityFetcher> Drop for WatchHandle<F> {
    fn drop(&mut self) {
        if let Some(session) = self.session.upgrade() {
            session.close_generation(&self.entity_id, self.generation);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::core::connection_manager::ConnectionManager;
    use crate::test_support::{
        invocation, order, rounded_secs, test_config, while_unassigned, FakeConnector, ScriptedFetcher,
    };
    use serde_json::json;
    use std::time::Duration;
    use tokio::sync::mpsc;
    use tokio::time::{sleep, Instant};

    use crate::core::HubFrame;

    struct Harness {
        hub: mpsc::UnboundedSender<HubFrame>,
        connector: Arc<FakeConnector>,
        fetcher: Arc<ScriptedFetcher>,
        session: Arc<WatchSession<ScriptedFetcher>>,
    }

    async fn harness(config: WatchConfig) -> Harness {
        let connector = FakeConnector::new();
        let hub = connector.accept();
        let connection = ConnectionManager::new(connector.clone(), &config)
            .connect("ws://hub/OrdersHub")
            .await
            .unwrap();
        let fetcher = ScriptedFetcher::new();
        let session = WatchSession::new(connection, Arc::clone(&fetcher), config).unwrap();
        Harness {
            hub,
            connector,
            fetcher,
            session,
        }
    }

    #[tokio::test(start_paused = true)]
    async fn push_before_first_tick_cancels_polling() {
        let start = Instant::now();
        let h = harness(test_config()).await;
        h.fetcher.push_ok(order(42, false));
        h.fetcher.push_ok(order(42, true));
        let id = EntityId::from(42u64);

        let handle = h.session.open_watch(42u64, while_unassigned());
        sleep(Duration::from_secs(5)).await;
        assert!(h.session.is_polling(&id));
        h.hub.send(invocation(ASSIGN_ORDER, vec![json!(42), json!(true)])).unwrap();
        sleep(Duration::from_secs(100)).await;

        let offsets: Vec<u64> = h
            .fetcher
            .call_times()
            .into_iter()
            .map(|t| rounded_secs(t - start))
            .collect();
        assert_eq!(offsets, vec![0, 5]);
        assert_eq!(handle.view().payload, Some(order(42, true)));
        assert!(!handle.view().condition_holds);
        assert!(!h.session.is_polling(&id));
        assert!(h.session.is_watching(&id));
    }

    #[tokio::test(start_paused = true)]
    async fn repeated_push_gives_the_same_result_as_one() {
        let h = harness(test_config()).await;
        h.fetcher.push_ok(order(42, false));
        h.fetcher.set_fallback(order(42, true));

        let handle = h.session.open_watch(42u64, while_unassigned());
        sleep(Duration::from_secs(1)).await;
        let push = invocation(ASSIGN_ORDER, vec![json!(42), json!(true)]);
        h.hub.send(push.clone()).unwrap();
        h.hub.send(push).unwrap();
        sleep(Duration::from_secs(1)).await;

        let view = handle.view();
        assert_eq!(h.fetcher.calls(), 3);
        assert_eq!(view.payload, Some(order(42, true)));
        assert_eq!(view.version, 2);
    }

    #[tokio::test(start_paused = true)]
    async fn every_push_triggers_a_refetch() {
        let h = harness(test_config()).await;
        h.fetcher.push_ok(order(42, false));
        h.fetcher.push_ok(order(42, true));
        h.fetcher.set_fallback(order(42, false));
        let id = EntityId::from(42u64);

        let handle = h.session.open_watch(42u64, while_unassigned());
        sleep(Duration::from_millis(100)).await;
        h.hub.send(invocation(ASSIGN_ORDER, vec![json!(42)])).unwrap();
        sleep(Duration::from_secs(1)).await;
        assert_eq!(handle.view().payload, Some(order(42, true)));
        assert!(!h.session.is_polling(&id));

        h.hub.send(invocation(ASSIGN_ORDER, vec![json!(42)])).unwrap();
        sleep(Duration::from_millis(100)).await;

        assert_eq!(h.fetcher.calls(), 3);
        assert_eq!(handle.view().payload, Some(order(42, false)));
        assert_eq!(handle.view().version, 3);
    }

    #[tokio::test(start_paused = true)]
    async fn exhausted_reconnects_mark_open_views_offline() {
        let mut config = test_config();
        config.reconnect.max_attempts = 2;
        let h = harness(config).await;
        h.fetcher.set_fallback(order(42, false));

        let mut handle = h.session.open_watch(42u64, while_unassigned());
        sleep(Duration::from_millis(500)).await;
        assert!(!handle.is_offline());
        handle.view_rx.borrow_and_update();

        drop(h.hub);
        sleep(Duration::from_secs(10)).await;

        assert!(h.session.connection().is_offline());
        let view = handle.changed().await.unwrap();
        assert!(view.offline);
        assert_eq!(view.payload, Some(order(42, false)));
        assert!(handle.is_offline());

        let later = h.session.open_watch(43u64, while_unassigned());
        assert!(later.view().offline);
    }

    #[tokio::test(start_paused = true)]
    async fn dropping_the_session_detaches_from_the_hub() {
        let h = harness(test_config()).await;
        let connection = h.session.connection().clone();
        assert_eq!(connection.handler_count(ASSIGN_ORDER), 1);

        let second = WatchSession::new(connection.clone(), Arc::clone(&h.fetcher), test_config()).unwrap();
        assert_eq!(connection.handler_count(ASSIGN_ORDER), 2);

        drop(second);
        assert_eq!(connection.handler_count(ASSIGN_ORDER), 1);
        drop(h.session);
        assert_eq!(connection.handler_count(ASSIGN_ORDER), 0);
    }

    #[tokio::test(start_paused = true)]
    async fn displaced_watch_releases_its_subscription() {
        let h = harness(test_config()).await;
        h.fetcher.set_fallback(order(42, false));
        let id = EntityId::from(42u64);

        let _handle = h.session.open_watch(42u64, while_unassigned());
        let stray = h.session.dispatcher().subscribe(ASSIGN_ORDER, id.clone(), |_, _| {});
        assert_eq!(h.session.dispatcher().subscription_count(ASSIGN_ORDER, &id), 2);

        h.session.register_open(
            &id,
            OpenWatch {
                generation: 999,
                subscription: stray,
            },
        );

        assert_eq!(h.session.dispatcher().subscription_count(ASSIGN_ORDER, &id), 1);
        assert!(h.session.is_watching(&id));
    }

    #[tokio::test(start_paused = true)]
    async fn close_discards_in_flight_fetch_and_later_pushes() {
        let h = harness(test_config()).await;
        h.fetcher.push_ok_after(Duration::from_secs(3), order(42, false));
        h.fetcher.set_fallback(order(42, false));
        let id = EntityId::from(42u64);

        let mut handle = h.session.open_watch(42u64, while_unassigned());
        assert!(h.session.close_watch(&id));
        assert!(!h.session.close_watch(&id));
        assert!(!h.session.is_watching(&id));
        assert!(!h.session.is_polling(&id));
        assert_eq!(h.session.dispatcher().subscription_count(ASSIGN_ORDER, &id), 0);

        h.hub.send(invocation(ASSIGN_ORDER, vec![json!(42)])).unwrap();
        sleep(Duration::from_secs(60)).await;

        assert_eq!(h.fetcher.calls(), 1);
        assert!(h.session.view(&id).is_none());
        while handle.changed().await.is_some() {}
    }

    #[tokio::test(start_paused = true)]
    async fn dropping_the_handle_closes_only_its_own_watch() {
        let h = harness(test_config()).await;
        h.fetcher.set_fallback(order(42, false));
        let id = EntityId::from(42u64);

        let first = h.session.open_watch(42u64, while_unassigned());
        let second = h.session.open_watch(42u64, while_unassigned());
        drop(first);
        assert!(h.session.is_watching(&id));
        assert_eq!(h.session.dispatcher().subscription_count(ASSIGN_ORDER, &id), 1);

        second.close();
        assert!(!h.session.is_watching(&id));
        assert_eq!(h.session.open_count(), 0);
    }

    #[tokio::test(start_paused = true)]
    async fn reconnect_refreshes_open_watches() {
        let h = harness(test_config()).await;
        let _second = h.connector.accept();
        h.fetcher.set_fallback(order(42, false));

        let _handle = h.session.open_watch(42u64, while_unassigned());
        sleep(Duration::from_millis(500)).await;
        assert_eq!(h.fetcher.calls(), 1);

        drop(h.hub);
        sleep(Duration::from_secs(3)).await;

        assert_eq!(h.session.connection().reconnect_count(), 1);
        assert_eq!(h.fetcher.calls(), 2);
    }

    #[tokio::test(start_paused = true)]
    async fn handle_observes_view_changes() {
        let h = harness(test_config()).await;
        h.fetcher.push_ok_after(Duration::from_millis(200), order(42, false));

        let mut handle = h.session.open_watch(42u64, while_unassigned());
        assert_eq!(handle.entity_id().as_str(), "42");
        assert!(handle.view().is_loading);

        let loaded = loop {
            let view = handle.changed().await.unwrap();
            if view.payload.is_some() {
                break view;
            }
        };
        assert_eq!(loaded.payload, Some(order(42, false)));
        assert!(!loaded.is_loading);
        assert_eq!(loaded.version, 1);
    }
}
