// Copyright 2025-Present Datadog, Inc. https://www.datadoghq.com/
// SPDX-License-Identifier: Apache-2.0

//! Interfaces the engine consumes from its backend.
//!
//! The engine never talks to the network directly. A [`Backend`] exchanges
//! the refresh token for [`Credentials`] and builds a [`ClientHandle`], which
//! bundles the change-stream transport, the device record store and the
//! liveness signal the watchdog listens to.

use std::collections::BTreeMap;
use std::fmt;
use std::sync::Arc;

use async_trait::async_trait;
use tokio::sync::watch;
use tokio_util::sync::CancellationToken;

use crate::document::DocumentChange;
use crate::error::{AuthError, StoreError, TransportError};

/// Mapping of service name to the newer version available for it.
pub type UpdatableServices = BTreeMap<String, String>;

/// Slash-separated path of a document collection.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct CollectionPath(String);

impl CollectionPath {
    pub fn new(path: impl Into<String>) -> Self {
        Self(path.into())
    }

    /// `users/{user}/devices/{device}/installed_services`
    pub fn installed_services(user_id: &str, device_id: &str) -> Self {
        Self(format!(
            "users/{user_id}/devices/{device_id}/installed_services"
        ))
    }

    /// `services/{service}/versions`
    pub fn service_versions(service: &str) -> Self {
        Self(format!("services/{service}/versions"))
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for CollectionPath {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

/// Receiver of change batches for one subscription.
///
/// Transports await `on_batch` before delivering the next batch of the same
/// subscription, which is what keeps per-subscription ordering.
#[async_trait]
pub trait ChangeSink: Send + Sync {
    async fn on_batch(&self, changes: Vec<DocumentChange>);
}

/// Live subscription returned by [`ChangeStreamTransport::subscribe`].
///
/// Dropping the subscription unsubscribes it.
#[derive(Debug)]
pub struct Subscription {
    path: CollectionPath,
    token: CancellationToken,
}

impl Subscription {
    pub fn new(path: CollectionPath, token: CancellationToken) -> Self {
        Self { path, token }
    }

    pub fn path(&self) -> &CollectionPath {
        &self.path
    }

    pub fn is_active(&self) -> bool {
        !self.token.is_cancelled()
    }

    /// Stops delivery of new batches. Batches already handed to the sink
    /// may still complete; sinks discard those themselves.
    pub fn unsubscribe(self) {
        self.token.cancel();
    }
}

impl Drop for Subscription {
    fn drop(&mut self) {
        self.token.cancel();
    }
}

/// Monotonic heartbeat counter shared between a transport and the watchdog.
#[derive(Debug, Clone)]
pub struct Liveness {
    tx: Arc<watch::Sender<u64>>,
}

impl Default for Liveness {
    fn default() -> Self {
        Self::new()
    }
}

impl Liveness {
    pub fn new() -> Self {
        let (tx, _rx) = watch::channel(0);
        Self { tx: Arc::new(tx) }
    }

    /// Records that the backend answered.
    pub fn beat(&self) {
        self.tx.send_modify(|beats| *beats = beats.wrapping_add(1));
    }

    pub fn beats(&self) -> u64 {
        *self.tx.borrow()
    }

    pub fn subscribe(&self) -> watch::Receiver<u64> {
        self.tx.subscribe()
    }
}

/// Delivers batched ADDED/REMOVED/MODIFIED events per subscribed collection.
pub trait ChangeStreamTransport: Send + Sync {
    fn subscribe(
        &self,
        path: CollectionPath,
        sink: Arc<dyn ChangeSink>,
    ) -> Result<Subscription, TransportError>;

    /// Liveness signal beaten whenever the backend proves responsive.
    fn liveness(&self) -> Liveness;

    /// Releases every subscription and background resource.
    fn shutdown(&self) {}
}

/// Read/merge-write access to this device's record.
#[async_trait]
pub trait DeviceRecordStore: Send + Sync {
    /// Current `updatable_services` of the device record (empty when absent).
    async fn read_updatable_services(&self) -> Result<UpdatableServices, StoreError>;

    /// Replaces the `updatable_services` field, leaving other fields untouched.
    async fn write_updatable_services(&self, services: &UpdatableServices)
        -> Result<(), StoreError>;
}

/// Result of a successful token exchange.
#[derive(Clone, PartialEq, Eq)]
pub struct Credentials {
    pub user_id: String,
    pub id_token: String,
    pub refresh_token: String,
}

impl fmt::Debug for Credentials {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Credentials")
            .field("user_id", &self.user_id)
            .field("id_token", &"<redacted>")
            .field("refresh_token", &"<redacted>")
            .finish()
    }
}

/// Usable connection to the backend for one credential lifetime.
#[derive(Clone)]
pub struct ClientHandle {
    pub credentials: Credentials,
    pub device_id: String,
    pub transport: Arc<dyn ChangeStreamTransport>,
    pub store: Arc<dyn DeviceRecordStore>,
}

impl fmt::Debug for ClientHandle {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ClientHandle")
            .field("credentials", &self.credentials)
            .field("device_id", &self.device_id)
            .finish_non_exhaustive()
    }
}

impl ClientHandle {
    pub fn installed_services_path(&self) -> CollectionPath {
        CollectionPath::installed_services(&self.credentials.user_id, &self.device_id)
    }
}

/// Credential endpoint plus client factory.
#[async_trait]
pub trait Backend: Send + Sync {
    /// Exchanges the configured refresh token for fresh credentials.
    async fn exchange_token(&self) -> Result<Credentials, AuthError>;

    /// Builds a client handle bound to `credentials`.
    fn connect(&self, credentials: Credentials) -> ClientHandle;
}
