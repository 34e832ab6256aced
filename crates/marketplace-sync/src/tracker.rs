// Copyright 2025-Present Datadog, Inc. https://www.datadoghq.com/
// SPDX-License-Identifier: Apache-2.0

//! Per-service tracking of published versions.
//!
//! A [`ServiceUpdateTracker`] follows `services/{name}/versions`, keeps the
//! [`VersionCatalog`] of that service and, after every event, tells its
//! [`UpdateSink`] whether the installed version is behind the latest one.

use std::sync::{Arc, Weak};

use async_trait::async_trait;
use semver::Version;
use serde_json::{Map, Value};
use tokio::sync::Mutex;
use tracing::{debug, warn};

use crate::document::{ChangeType, DocumentChange};
use crate::error::TransportError;
use crate::transport::{ChangeSink, ChangeStreamTransport, CollectionPath, Subscription};
use crate::version::{is_newer, VersionCatalog};

/// Receiver of a tracker's verdicts; implemented by the coordinator.
#[async_trait]
pub trait UpdateSink: Send + Sync {
    /// `service` has `version` available, newer than what is installed.
    async fn mark_updatable(&self, service: &str, version: &str);

    /// `service` is up to date or gone.
    async fn mark_updated(&self, service: &str);
}

struct TrackerState {
    installed: Option<Version>,
    env: Map<String, Value>,
    catalog: VersionCatalog,
    /// Bumped on every start and stop; batches carry the value they were
    /// subscribed under.
    generation: u64,
    subscription: Option<Subscription>,
}

struct TrackerShared {
    service: String,
    sink: Weak<dyn UpdateSink>,
    state: Mutex<TrackerState>,
}

/// Tracks the published versions of one installed service.
///
/// The tracker only holds a [`Weak`] handle to its sink; once the owner is
/// gone, verdicts are dropped silently.
pub struct ServiceUpdateTracker {
    shared: Arc<TrackerShared>,
}

impl std::fmt::Debug for ServiceUpdateTracker {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ServiceUpdateTracker")
            .field("service", &self.shared.service)
            .finish_non_exhaustive()
    }
}

impl ServiceUpdateTracker {
    pub fn new(service: impl Into<String>, sink: Weak<dyn UpdateSink>) -> Self {
        Self {
            shared: Arc::new(TrackerShared {
                service: service.into(),
                sink,
                state: Mutex::new(TrackerState {
                    installed: None,
                    env: Map::new(),
                    catalog: VersionCatalog::new(),
                    generation: 0,
                    subscription: None,
                }),
            }),
        }
    }

    pub fn service(&self) -> &str {
        &self.shared.service
    }

    /// Opens the version subscription. A running tracker is left as is.
    pub async fn start(&self, transport: &Arc<dyn ChangeStreamTransport>) -> Result<(), TransportError> {
        let mut state = self.shared.state.lock().await;
        if state.subscription.is_some() {
            return Ok(());
        }
        state.generation = state.generation.wrapping_add(1);
        let sink = Arc::new(VersionStreamSink {
            tracker: Arc::downgrade(&self.shared),
            generation: state.generation,
        });
        let path = CollectionPath::service_versions(&self.shared.service);
        state.subscription = Some(transport.subscribe(path, sink)?);
        debug!(service = %self.shared.service, "marketplace-sync: tracking service versions");
        Ok(())
    }

    /// Closes the version subscription.
    ///
    /// Waits for a batch that is being applied; batches delivered afterwards
    /// are discarded. The catalog is cleared since a new subscription replays
    /// every version anyway.
    pub async fn stop(&self) {
        let mut state = self.shared.state.lock().await;
        state.generation = state.generation.wrapping_add(1);
        if let Some(subscription) = state.subscription.take() {
            subscription.unsubscribe();
            debug!(service = %self.shared.service, "marketplace-sync: stopped tracking service versions");
        }
        state.catalog = VersionCatalog::new();
    }

    pub async fn restart(&self, transport: &Arc<dyn ChangeStreamTransport>) -> Result<(), TransportError> {
        self.stop().await;
        self.start(transport).await
    }

    pub async fn is_running(&self) -> bool {
        self.shared.state.lock().await.subscription.is_some()
    }

    /// Records the installed version and re-runs the comparison.
    pub async fn update_installed_version(&self, version: Version, env: Map<String, Value>) {
        let mut state = self.shared.state.lock().await;
        debug!(
            service = %self.shared.service,
            version = %version,
            "marketplace-sync: installed version updated"
        );
        state.installed = Some(version);
        state.env = env;
        self.shared.evaluate(&state).await;
    }

    pub async fn installed_version(&self) -> Option<Version> {
        self.shared.state.lock().await.installed.clone()
    }

    pub async fn environment(&self) -> Map<String, Value> {
        self.shared.state.lock().await.env.clone()
    }

    /// Id of the highest known version.
    pub async fn latest_version(&self) -> Option<String> {
        let state = self.shared.state.lock().await;
        state.catalog.latest().map(|(id, _)| id.to_string())
    }

    pub async fn known_versions(&self) -> usize {
        self.shared.state.lock().await.catalog.len()
    }
}

impl TrackerShared {
    async fn apply_batch(&self, generation: u64, changes: Vec<DocumentChange>) {
        let mut state = self.state.lock().await;
        if state.generation != generation || state.subscription.is_none() {
            debug!(service = %self.service, "marketplace-sync: discarding late version batch");
            return;
        }
        for change in changes {
            match change.change_type {
                ChangeType::Added | ChangeType::Modified => match state.catalog.insert(&change.id) {
                    Ok(true) => {
                        debug!(service = %self.service, version = %change.id, "marketplace-sync: version published");
                    }
                    Ok(false) => {}
                    Err(err) => {
                        warn!(service = %self.service, %err, "marketplace-sync: skipping version event");
                        continue;
                    }
                },
                ChangeType::Removed => {
                    if state.catalog.remove(&change.id) {
                        debug!(service = %self.service, version = %change.id, "marketplace-sync: version withdrawn");
                    }
                }
            }
            self.evaluate(&state).await;
        }
    }

    /// Reports the verdict for the current state; silent while either side is unknown.
    async fn evaluate(&self, state: &TrackerState) {
        let (Some((latest_id, latest)), Some(installed)) =
            (state.catalog.latest(), state.installed.as_ref())
        else {
            return;
        };
        let Some(sink) = self.sink.upgrade() else {
            return;
        };
        if is_newer(latest, installed) {
            sink.mark_updatable(&self.service, latest_id).await;
        } else {
            sink.mark_updated(&self.service).await;
        }
    }
}

struct VersionStreamSink {
    tracker: Weak<TrackerShared>,
    generation: u64,
}

#[async_trait]
impl ChangeSink for VersionStreamSink {
    async fn on_batch(&self, changes: Vec<DocumentChange>) {
        if let Some(tracker) = self.tracker.upgrade() {
            tracker.apply_batch(self.generation, changes).await;
        }
    }
}
