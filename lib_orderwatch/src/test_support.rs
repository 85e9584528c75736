//! Fakes shared by the unit tests.

use std::collections::VecDeque;
use std::sync::{Arc, Mutex};
use std::time::Duration;

use futures_util::future::BoxFuture;
use serde_json::Value;
use tokio::sync::mpsc;
use tokio::time::{sleep, Instant};

use crate::configs::WatchConfig;
use crate::core::{lock, EntityFetcher, HubConnector, HubFrame, HubTransport, WatchCondition};
use crate::error::{FetchError, WatchError, WatchResult};
use crate::models::EntityId;

#[derive(Debug, Clone, PartialEq)]
pub(crate) struct TestOrder {
    pub id: u64,
    pub is_assigned: bool,
}

pub(crate) fn order(id: u64, is_assigned: bool) -> TestOrder {
    TestOrder { id, is_assigned }
}

pub(crate) fn while_unassigned() -> WatchCondition<TestOrder> {
    Arc::new(|o: &TestOrder| !o.is_assigned)
}

/// Timers far enough out that auto-advancing paused time never hits them.
pub(crate) fn test_config() -> WatchConfig {
    WatchConfig {
        keep_alive_interval_ms: 3_600_000,
        server_timeout_ms: 7_200_000,
        ..WatchConfig::default()
    }
}

pub(crate) fn rounded_secs(elapsed: Duration) -> u64 {
    ((elapsed.as_millis() + 500) / 1000) as u64
}

pub(crate) fn invocation(target: &str, arguments: Vec<Value>) -> HubFrame {
    HubFrame::Invocation {
        target: target.to_string(),
        arguments,
    }
}

type Scripted = (Duration, Result<TestOrder, FetchError>);

/// Fetcher answering from a script, then from an optional fallback.
#[derive(Default)]
pub(crate) struct ScriptedFetcher {
    script: Mutex<VecDeque<Scripted>>,
    fallback: Mutex<Option<TestOrder>>,
    calls: Mutex<Vec<(EntityId, Instant)>>,
}

impl ScriptedFetcher {
    pub fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }

    pub fn push_ok(&self, order: TestOrder) {
        self.push_ok_after(Duration::ZERO, order);
    }

    pub fn push_ok_after(&self, delay: Duration, order: TestOrder) {
        lock(&self.script).push_back((delay, Ok(order)));
    }

    pub fn push_err(&self, error: FetchError) {
        lock(&self.script).push_back((Duration::ZERO, Err(error)));
    }

    pub fn set_fallback(&self, order: TestOrder) {
        *lock(&self.fallback) = Some(order);
    }

    pub fn calls(&self) -> usize {
        lock(&self.calls).len()
    }

    pub fn call_times(&self) -> Vec<Instant> {
        lock(&self.calls).iter().map(|(_, at)| *at).collect()
    }
}

impl EntityFetcher for ScriptedFetcher {
    type Payload = TestOrder;

    fn fetch(&self, entity_id: &EntityId) -> BoxFuture<'static, Result<TestOrder, FetchError>> {
        lock(&self.calls).push((entity_id.clone(), Instant::now()));
        let next = lock(&self.script)
            .pop_front()
            .or_else(|| lock(&self.fallback).clone().map(|o| (Duration::ZERO, Ok(o))));
        Box::pin(async move {
            match next {
                Some((delay, result)) => {
                    if !delay.is_zero() {
                        sleep(delay).await;
                    }
                    result
                }
                None => Err(FetchError::Network("no scripted response".into())),
            }
        })
    }
}

type Session = Result<mpsc::UnboundedReceiver<HubFrame>, String>;

/// Connector handing out scripted sessions in order.
#[derive(Default)]
pub(crate) struct FakeConnector {
    sessions: Mutex<VecDeque<Session>>,
    attempts: Mutex<Vec<Instant>>,
}

impl FakeConnector {
    pub fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }

    /// Queues a successful session. Dropping the sender drops the transport.
    pub fn accept(&self) -> mpsc::UnboundedSender<HubFrame> {
        let (tx, rx) = mpsc::unbounded_channel();
        lock(&self.sessions).push_back(Ok(rx));
        tx
    }

    pub fn refuse(&self, reason: &str) {
        lock(&self.sessions).push_back(Err(reason.to_string()));
    }

    pub fn attempt_times(&self) -> Vec<Instant> {
        lock(&self.attempts).clone()
    }
}

impl HubConnector for FakeConnector {
    fn connect(&self, _url: &str) -> BoxFuture<'static, WatchResult<Box<dyn HubTransport>>> {
        lock(&self.attempts).push(Instant::now());
        let next = lock(&self.sessions).pop_front();
        Box::pin(async move {
            match next {
                Some(Ok(frames)) => Ok(Box::new(FakeTransport { frames }) as Box<dyn HubTransport>),
                Some(Err(reason)) => Err(WatchError::Connection(reason)),
                None => Err(WatchError::Connection("connection refused".into())),
            }
        })
    }
}

struct FakeTransport {
    frames: mpsc::UnboundedReceiver<HubFrame>,
}

impl HubTransport for FakeTransport {
    fn next_frame(&mut self) -> BoxFuture<'_, Option<WatchResult<HubFrame>>> {
        Box::pin(async move { self.frames.recv().await.map(Ok) })
    }

    fn send_ping(&mut self) -> BoxFuture<'_, WatchResult<()>> {
        Box::pin(async { Ok(()) })
    }

    fn close(&mut self) -> BoxFuture<'_, ()> {
        Box::pin(async {})
    }
}
