// Copyright 2025-Present Datadog, Inc. https://www.datadoghq.com/
// SPDX-License-Identifier: Apache-2.0

//! Device-level synchronisation.
//!
//! [`DeviceSyncCoordinator`] follows the device's installed services, keeps
//! one [`ServiceUpdateTracker`] per installed service and owns the
//! [`UpdatableServicesIndex`] the trackers report into.
//!
//! Locks are always taken in the order table, tracker, index. The index lock
//! also covers the remote write so that concurrent verdicts cannot lose each
//! other's updates.

use std::collections::HashMap;
use std::sync::{Arc, Weak};

use async_trait::async_trait;
use semver::Version;
use tokio::sync::Mutex;
use tracing::{debug, info, warn};

use crate::config::SyncConfig;
use crate::document::{ChangeType, DocumentChange, InstalledService};
use crate::index::UpdatableServicesIndex;
use crate::lifecycle::{ConnectionLifecycleManager, LifecycleHooks, RestartDebouncer, RestartFn};
use crate::tracker::{ServiceUpdateTracker, UpdateSink};
use crate::transport::{
    Backend, ChangeSink, ClientHandle, DeviceRecordStore, Subscription, UpdatableServices,
};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SyncStatus {
    Stopped,
    /// Waiting for the connection to become ready.
    Starting,
    Running,
}

struct DeviceTable {
    status: SyncStatus,
    /// Bumped by every stop; installed-services batches carry the value
    /// their subscription was opened under.
    generation: u64,
    client: Option<ClientHandle>,
    subscription: Option<Subscription>,
    trackers: HashMap<String, ServiceUpdateTracker>,
}

struct IndexState {
    index: UpdatableServicesIndex,
    /// Present only while running; verdicts without a store are dropped.
    store: Option<Arc<dyn DeviceRecordStore>>,
}

struct CoordinatorShared {
    lifecycle: ConnectionLifecycleManager,
    debouncer: RestartDebouncer,
    table: Mutex<DeviceTable>,
    index: Mutex<IndexState>,
    self_ref: Weak<CoordinatorShared>,
}

/// Keeps the device record's `updatable_services` in line with the marketplace.
pub struct DeviceSyncCoordinator {
    shared: Arc<CoordinatorShared>,
}

impl std::fmt::Debug for DeviceSyncCoordinator {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("DeviceSyncCoordinator")
            .field("lifecycle", &self.shared.lifecycle)
            .finish_non_exhaustive()
    }
}

impl DeviceSyncCoordinator {
    pub fn new(backend: Arc<dyn Backend>, config: SyncConfig) -> Self {
        let shared = Arc::new_cyclic(|weak: &Weak<CoordinatorShared>| {
            let hooks = Arc::new(CoordinatorHooks {
                coordinator: weak.clone(),
            });
            let restart_target = weak.clone();
            let restart: RestartFn = Arc::new(move || {
                let target = restart_target.clone();
                Box::pin(async move {
                    if let Some(coordinator) = target.upgrade() {
                        coordinator.restart().await;
                    }
                })
            });
            CoordinatorShared {
                lifecycle: ConnectionLifecycleManager::new(backend, config.clone(), hooks),
                debouncer: RestartDebouncer::new(config.restart_delay, restart),
                table: Mutex::new(DeviceTable {
                    status: SyncStatus::Stopped,
                    generation: 0,
                    client: None,
                    subscription: None,
                    trackers: HashMap::new(),
                }),
                index: Mutex::new(IndexState {
                    index: UpdatableServicesIndex::new(),
                    store: None,
                }),
                self_ref: weak.clone(),
            }
        });
        Self { shared }
    }

    /// Starts the connection; streams open once it is ready.
    pub async fn start(&self) {
        self.shared.debouncer.reopen();
        self.shared.start().await;
    }

    /// Tears down every tracker and the connection.
    ///
    /// Once this returns no verdict reaches the index, including verdicts
    /// from batches that were already in flight.
    pub async fn stop(&self) {
        self.shared.debouncer.close().await;
        self.shared.stop().await;
    }

    pub async fn restart(&self) {
        self.shared.restart().await;
    }

    pub async fn status(&self) -> SyncStatus {
        self.shared.table.lock().await.status
    }

    pub fn lifecycle(&self) -> &ConnectionLifecycleManager {
        &self.shared.lifecycle
    }

    /// Local copy of the index, as last persisted.
    pub async fn updatable_services(&self) -> UpdatableServices {
        self.shared.index.lock().await.index.as_map().clone()
    }

    pub async fn tracked_services(&self) -> Vec<String> {
        let table = self.shared.table.lock().await;
        let mut services: Vec<String> = table.trackers.keys().cloned().collect();
        services.sort();
        services
    }

    pub async fn installed_version(&self, service: &str) -> Option<Version> {
        let table = self.shared.table.lock().await;
        match table.trackers.get(service) {
            Some(tracker) => tracker.installed_version().await,
            None => None,
        }
    }
}

impl CoordinatorShared {
    async fn start(&self) {
        {
            let mut table = self.table.lock().await;
            if table.status != SyncStatus::Stopped {
                debug!("marketplace-sync: coordinator already started");
                return;
            }
            table.status = SyncStatus::Starting;
        }
        info!("marketplace-sync: starting device sync");
        self.lifecycle.initialize(true).await;
    }

    async fn stop(&self) {
        {
            let mut table = self.table.lock().await;
            table.status = SyncStatus::Stopped;
            table.generation = table.generation.wrapping_add(1);
            if let Some(subscription) = table.subscription.take() {
                subscription.unsubscribe();
            }
            for (_, tracker) in table.trackers.drain() {
                tracker.stop().await;
            }
            table.client = None;
        }
        self.index.lock().await.store = None;
        self.lifecycle.stop().await;
        info!("marketplace-sync: device sync stopped");
    }

    async fn restart(&self) {
        info!("marketplace-sync: restarting device sync");
        self.stop().await;
        self.start().await;
    }

    /// Loads the index and subscribes to the installed services. Runs after
    /// every ready notification; a second call while subscribed does nothing.
    async fn open_streams(&self) {
        let mut table = self.table.lock().await;
        if table.status == SyncStatus::Stopped || table.subscription.is_some() {
            return;
        }
        let Some(client) = self.lifecycle.client() else {
            debug!("marketplace-sync: connection not ready; streams stay closed");
            return;
        };

        match client.store.read_updatable_services().await {
            Ok(remote) => {
                let mut index = self.index.lock().await;
                debug!(services = remote.len(), "marketplace-sync: loaded updatable services");
                index.index.replace(remote);
                index.store = Some(Arc::clone(&client.store));
            }
            Err(err) => {
                warn!(%err, "marketplace-sync: failed to load device record; scheduling restart");
                drop(table);
                self.debouncer.trigger();
                return;
            }
        }

        let sink = Arc::new(InstalledServicesSink {
            coordinator: self.self_ref.clone(),
            generation: table.generation,
        });
        let path = client.installed_services_path();
        match client.transport.subscribe(path.clone(), sink) {
            Ok(subscription) => {
                table.subscription = Some(subscription);
                table.client = Some(client);
                table.status = SyncStatus::Running;
                info!(path = %path, "marketplace-sync: following installed services");
            }
            Err(err) => {
                self.index.lock().await.store = None;
                warn!(%err, "marketplace-sync: failed to subscribe to installed services; scheduling restart");
                drop(table);
                self.debouncer.trigger();
            }
        }
    }

    async fn apply_installed_batch(&self, generation: u64, changes: Vec<DocumentChange>) {
        let mut table = self.table.lock().await;
        if table.generation != generation || table.status != SyncStatus::Running {
            debug!("marketplace-sync: discarding late installed-services batch");
            return;
        }
        let Some(client) = table.client.clone() else {
            return;
        };
        for change in changes {
            match change.change_type {
                ChangeType::Added => self.service_added(&mut table, &client, &change).await,
                ChangeType::Modified => self.service_modified(&mut table, &client, &change).await,
                ChangeType::Removed => self.service_removed(&mut table, &change.id).await,
            }
        }
    }

    async fn service_added(&self, table: &mut DeviceTable, client: &ClientHandle, change: &DocumentChange) {
        let service = match InstalledService::from_change(change) {
            Ok(service) => service,
            Err(err) => {
                warn!(%err, "marketplace-sync: skipping installed-services event");
                return;
            }
        };
        if let Some(tracker) = table.trackers.get(&service.name) {
            debug!(service = %service.name, "marketplace-sync: service already tracked");
            tracker.update_installed_version(service.version, service.env).await;
            return;
        }

        debug!(service = %service.name, version = %service.version, "marketplace-sync: service installed");
        let sink: Weak<dyn UpdateSink> = self.self_ref.clone();
        let tracker = ServiceUpdateTracker::new(service.name.clone(), sink);
        tracker.update_installed_version(service.version, service.env).await;
        if let Err(err) = tracker.start(&client.transport).await {
            warn!(service = %service.name, %err, "marketplace-sync: failed to follow service versions; scheduling restart");
            self.debouncer.trigger();
        }
        table.trackers.insert(service.name, tracker);
    }

    async fn service_modified(&self, table: &mut DeviceTable, client: &ClientHandle, change: &DocumentChange) {
        match table.trackers.get(&change.id) {
            Some(tracker) => match InstalledService::from_change(change) {
                Ok(service) => {
                    debug!(service = %service.name, version = %service.version, "marketplace-sync: installed version changed");
                    tracker.update_installed_version(service.version, service.env).await;
                }
                Err(err) => warn!(%err, "marketplace-sync: skipping installed-services event"),
            },
            // The ADDED event was skipped (malformed) or lost; adopt the service now.
            None => self.service_added(table, client, change).await,
        }
    }

    async fn service_removed(&self, table: &mut DeviceTable, service: &str) {
        match table.trackers.remove(service) {
            Some(tracker) => {
                debug!(service, "marketplace-sync: service uninstalled");
                tracker.stop().await;
            }
            None => debug!(service, "marketplace-sync: removal of an untracked service"),
        }
        self.mark_updated(service).await;
    }
}

#[async_trait]
impl UpdateSink for CoordinatorShared {
    async fn mark_updatable(&self, service: &str, version: &str) {
        let mut state = self.index.lock().await;
        let Some(store) = state.store.clone() else {
            debug!(service, "marketplace-sync: not running; dropping updatable verdict");
            return;
        };
        let Some(next) = state.index.with_updatable(service, version) else {
            return;
        };
        match store.write_updatable_services(&next).await {
            Ok(()) => {
                state.index.commit(next);
                info!(service, version, "marketplace-sync: update available");
            }
            Err(err) => {
                warn!(service, version, %err, "marketplace-sync: failed to persist updatable service");
            }
        }
    }

    async fn mark_updated(&self, service: &str) {
        let mut state = self.index.lock().await;
        let Some(store) = state.store.clone() else {
            debug!(service, "marketplace-sync: not running; dropping up-to-date verdict");
            return;
        };
        let Some(next) = state.index.without(service) else {
            return;
        };
        match store.write_updatable_services(&next).await {
            Ok(()) => {
                state.index.commit(next);
                info!(service, "marketplace-sync: service up to date");
            }
            Err(err) => {
                warn!(service, %err, "marketplace-sync: failed to persist up-to-date service");
            }
        }
    }
}

struct CoordinatorHooks {
    coordinator: Weak<CoordinatorShared>,
}

impl LifecycleHooks for CoordinatorHooks {
    fn on_ready(&self) {
        if let Some(coordinator) = self.coordinator.upgrade() {
            tokio::spawn(async move {
                coordinator.open_streams().await;
            });
        }
    }

    fn on_unhealthy(&self) {
        if let Some(coordinator) = self.coordinator.upgrade() {
            warn!("marketplace-sync: connection unhealthy; scheduling restart");
            coordinator.debouncer.trigger();
        }
    }

    fn on_token_expired(&self) {
        if let Some(coordinator) = self.coordinator.upgrade() {
            info!("marketplace-sync: token expired; scheduling restart");
            coordinator.debouncer.trigger();
        }
    }
}

struct InstalledServicesSink {
    coordinator: Weak<CoordinatorShared>,
    generation: u64,
}

#[async_trait]
impl ChangeSink for InstalledServicesSink {
    async fn on_batch(&self, changes: Vec<DocumentChange>) {
        if let Some(coordinator) = self.coordinator.upgrade() {
            coordinator.apply_installed_batch(self.generation, changes).await;
        }
    }
}
