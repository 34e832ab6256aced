// Copyright 2025-Present Datadog, Inc. https://www.datadoghq.com/
// SPDX-License-Identifier: Apache-2.0

//! In-memory backend fixtures shared by the unit and engine tests.

use std::collections::HashMap;
use std::future::Future;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use async_trait::async_trait;
use serde_json::{Map, Value};
use tokio_util::sync::CancellationToken;

use crate::document::DocumentChange;
use crate::error::{AuthError, StoreError, TransportError};
use crate::lifecycle::LifecycleHooks;
use crate::tracker::UpdateSink;
use crate::transport::{
    Backend, ChangeSink, ChangeStreamTransport, ClientHandle, CollectionPath, Credentials,
    DeviceRecordStore, Liveness, Subscription, UpdatableServices,
};

pub(crate) const USER_ID: &str = "user-1";
pub(crate) const DEVICE_ID: &str = "device-1";

pub(crate) fn fields(value: Value) -> Map<String, Value> {
    match value {
        Value::Object(map) => map,
        other => panic!("fixture must be an object, got {other}"),
    }
}

/// Polls `check` on a short virtual-time cadence until it holds.
pub(crate) async fn eventually<F, Fut>(mut check: F)
where
    F: FnMut() -> Fut,
    Fut: Future<Output = bool>,
{
    for _ in 0..2_000 {
        if check().await {
            return;
        }
        tokio::time::sleep(Duration::from_millis(1)).await;
    }
    panic!("condition not reached in time");
}

pub(crate) async fn wait_for(mut check: impl FnMut() -> bool) {
    eventually(|| std::future::ready(check())).await;
}

struct Registration {
    token: CancellationToken,
    sink: Arc<dyn ChangeSink>,
}

/// Transport whose batches are pushed by the test.
#[derive(Default)]
pub(crate) struct MemoryTransport {
    registrations: Mutex<HashMap<CollectionPath, Vec<Registration>>>,
    liveness: Liveness,
    shutdowns: AtomicUsize,
}

impl MemoryTransport {
    pub(crate) fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }

    pub(crate) fn as_dyn(self: &Arc<Self>) -> Arc<dyn ChangeStreamTransport> {
        Arc::clone(self) as Arc<dyn ChangeStreamTransport>
    }

    pub(crate) fn liveness_signal(&self) -> Liveness {
        self.liveness.clone()
    }

    fn sinks(&self, path: &CollectionPath, include_cancelled: bool) -> Vec<Arc<dyn ChangeSink>> {
        let registrations = self.registrations.lock().unwrap();
        registrations
            .get(path)
            .map(|entries| {
                entries
                    .iter()
                    .filter(|entry| include_cancelled || !entry.token.is_cancelled())
                    .map(|entry| Arc::clone(&entry.sink))
                    .collect()
            })
            .unwrap_or_default()
    }

    /// Hands `changes` to every active subscription of `path`.
    pub(crate) async fn deliver(&self, path: &CollectionPath, changes: Vec<DocumentChange>) {
        for sink in self.sinks(path, false) {
            sink.on_batch(changes.clone()).await;
        }
    }

    /// Also hands `changes` to cancelled subscriptions, like a batch that was
    /// already in flight when the subscriber went away.
    pub(crate) async fn deliver_including_cancelled(
        &self,
        path: &CollectionPath,
        changes: Vec<DocumentChange>,
    ) {
        for sink in self.sinks(path, true) {
            sink.on_batch(changes.clone()).await;
        }
    }

    pub(crate) fn active_subscriptions(&self, path: &CollectionPath) -> usize {
        self.registrations
            .lock()
            .unwrap()
            .get(path)
            .map_or(0, |entries| {
                entries
                    .iter()
                    .filter(|entry| !entry.token.is_cancelled())
                    .count()
            })
    }

    pub(crate) fn total_active_subscriptions(&self) -> usize {
        self.registrations
            .lock()
            .unwrap()
            .values()
            .flatten()
            .filter(|entry| !entry.token.is_cancelled())
            .count()
    }

    pub(crate) fn is_shut_down(&self) -> bool {
        self.shutdowns.load(Ordering::SeqCst) > 0
    }
}

impl ChangeStreamTransport for MemoryTransport {
    fn subscribe(
        &self,
        path: CollectionPath,
        sink: Arc<dyn ChangeSink>,
    ) -> Result<Subscription, TransportError> {
        let token = CancellationToken::new();
        self.registrations
            .lock()
            .unwrap()
            .entry(path.clone())
            .or_default()
            .push(Registration {
                token: token.clone(),
                sink,
            });
        Ok(Subscription::new(path, token))
    }

    fn liveness(&self) -> Liveness {
        self.liveness.clone()
    }

    fn shutdown(&self) {
        self.shutdowns.fetch_add(1, Ordering::SeqCst);
        for entry in self.registrations.lock().unwrap().values().flatten() {
            entry.token.cancel();
        }
    }
}

/// Device record kept in memory, with every successful write recorded.
#[derive(Default)]
pub(crate) struct MemoryStore {
    record: Mutex<UpdatableServices>,
    writes: Mutex<Vec<UpdatableServices>>,
    failing_reads: AtomicUsize,
    failing_writes: AtomicBool,
}

impl MemoryStore {
    pub(crate) fn seed(&self, services: UpdatableServices) {
        *self.record.lock().unwrap() = services;
    }

    pub(crate) fn record(&self) -> UpdatableServices {
        self.record.lock().unwrap().clone()
    }

    pub(crate) fn writes(&self) -> Vec<UpdatableServices> {
        self.writes.lock().unwrap().clone()
    }

    pub(crate) fn write_count(&self) -> usize {
        self.writes.lock().unwrap().len()
    }

    pub(crate) fn fail_next_reads(&self, count: usize) {
        self.failing_reads.store(count, Ordering::SeqCst);
    }

    pub(crate) fn fail_writes(&self, fail: bool) {
        self.failing_writes.store(fail, Ordering::SeqCst);
    }
}

#[async_trait]
impl DeviceRecordStore for MemoryStore {
    async fn read_updatable_services(&self) -> Result<UpdatableServices, StoreError> {
        let failing = self
            .failing_reads
            .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |left| left.checked_sub(1))
            .is_ok();
        if failing {
            return Err(StoreError::Status(503));
        }
        Ok(self.record())
    }

    async fn write_updatable_services(
        &self,
        services: &UpdatableServices,
    ) -> Result<(), StoreError> {
        // A remote round-trip suspends the writer; verdicts racing on the
        // index get a chance to interleave here.
        tokio::task::yield_now().await;
        if self.failing_writes.load(Ordering::SeqCst) {
            return Err(StoreError::Status(503));
        }
        *self.record.lock().unwrap() = services.clone();
        self.writes.lock().unwrap().push(services.clone());
        Ok(())
    }
}

/// Backend handing out the same in-memory transport and store to every session.
pub(crate) struct FakeBackend {
    transport: Arc<MemoryTransport>,
    store: Arc<MemoryStore>,
    user_id: Mutex<String>,
    failing_exchanges: AtomicUsize,
    exchanges: AtomicUsize,
    exchange_delay: Mutex<Duration>,
}

impl FakeBackend {
    pub(crate) fn new() -> Arc<Self> {
        Arc::new(Self {
            transport: MemoryTransport::new(),
            store: Arc::new(MemoryStore::default()),
            user_id: Mutex::new(USER_ID.to_string()),
            failing_exchanges: AtomicUsize::new(0),
            exchanges: AtomicUsize::new(0),
            exchange_delay: Mutex::new(Duration::ZERO),
        })
    }

    pub(crate) fn transport(&self) -> Arc<MemoryTransport> {
        Arc::clone(&self.transport)
    }

    pub(crate) fn store(&self) -> Arc<MemoryStore> {
        Arc::clone(&self.store)
    }

    pub(crate) fn fail_next_exchanges(&self, count: usize) {
        self.failing_exchanges.store(count, Ordering::SeqCst);
    }

    pub(crate) fn set_user_id(&self, user_id: &str) {
        *self.user_id.lock().unwrap() = user_id.to_string();
    }

    /// Makes every later token exchange take `delay` before answering.
    pub(crate) fn delay_exchanges(&self, delay: Duration) {
        *self.exchange_delay.lock().unwrap() = delay;
    }

    pub(crate) fn exchanges(&self) -> usize {
        self.exchanges.load(Ordering::SeqCst)
    }
}

#[async_trait]
impl Backend for FakeBackend {
    async fn exchange_token(&self) -> Result<Credentials, AuthError> {
        self.exchanges.fetch_add(1, Ordering::SeqCst);
        let delay = *self.exchange_delay.lock().unwrap();
        if !delay.is_zero() {
            tokio::time::sleep(delay).await;
        }
        let failing = self
            .failing_exchanges
            .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |left| left.checked_sub(1))
            .is_ok();
        if failing {
            return Err(AuthError::Status(503));
        }
        Ok(Credentials {
            user_id: self.user_id.lock().unwrap().clone(),
            id_token: "id-token".to_string(),
            refresh_token: "refresh-token".to_string(),
        })
    }

    fn connect(&self, credentials: Credentials) -> ClientHandle {
        ClientHandle {
            credentials,
            device_id: DEVICE_ID.to_string(),
            transport: self.transport.as_dyn(),
            store: Arc::clone(&self.store) as Arc<dyn DeviceRecordStore>,
        }
    }
}

#[derive(Debug, Default)]
pub(crate) struct RecordingHooks {
    ready: AtomicUsize,
    unhealthy: AtomicUsize,
    token_expired: AtomicUsize,
}

impl RecordingHooks {
    pub(crate) fn ready(&self) -> usize {
        self.ready.load(Ordering::SeqCst)
    }

    pub(crate) fn unhealthy(&self) -> usize {
        self.unhealthy.load(Ordering::SeqCst)
    }

    pub(crate) fn token_expired(&self) -> usize {
        self.token_expired.load(Ordering::SeqCst)
    }
}

impl LifecycleHooks for RecordingHooks {
    fn on_ready(&self) {
        self.ready.fetch_add(1, Ordering::SeqCst);
    }

    fn on_unhealthy(&self) {
        self.unhealthy.fetch_add(1, Ordering::SeqCst);
    }

    fn on_token_expired(&self) {
        self.token_expired.fetch_add(1, Ordering::SeqCst);
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub(crate) enum Verdict {
    Updatable(String, String),
    Updated(String),
}

#[derive(Debug, Default)]
pub(crate) struct RecordingSink {
    verdicts: Mutex<Vec<Verdict>>,
}

impl RecordingSink {
    pub(crate) fn verdicts(&self) -> Vec<Verdict> {
        self.verdicts.lock().unwrap().clone()
    }
}

#[async_trait]
impl UpdateSink for RecordingSink {
    async fn mark_updatable(&self, service: &str, version: &str) {
        self.verdicts
            .lock()
            .unwrap()
            .push(Verdict::Updatable(service.to_string(), version.to_string()));
    }

    async fn mark_updated(&self, service: &str) {
        self.verdicts
            .lock()
            .unwrap()
            .push(Verdict::Updated(service.to_string()));
    }
}
