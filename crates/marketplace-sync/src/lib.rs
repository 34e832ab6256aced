// Copyright 2025-Present Datadog, Inc. https://www.datadoghq.com/
// SPDX-License-Identifier: Apache-2.0

//! Device-side marketplace update synchronisation.
//!
//! The crate keeps a device's `updatable_services` record in line with the
//! marketplace catalog. [`DeviceSyncCoordinator`] follows the services
//! installed on the device, runs one [`ServiceUpdateTracker`] per service and
//! persists which of them have a newer published version. The connection
//! underneath is owned by a [`ConnectionLifecycleManager`], which handles
//! authentication retries, token refresh and a liveness watchdog.
//!
//! The engine only depends on the traits in [`transport`]; [`firestore`]
//! provides the Firebase-backed implementation used by the agent binary.

#![cfg_attr(not(test), deny(clippy::panic))]
#![cfg_attr(not(test), deny(clippy::unwrap_used))]
#![cfg_attr(not(test), deny(clippy::expect_used))]
#![cfg_attr(not(test), deny(clippy::todo))]
#![cfg_attr(not(test), deny(clippy::unimplemented))]

pub mod config;
pub mod coordinator;
pub mod document;
pub mod error;
pub mod firestore;
pub mod index;
pub mod lifecycle;
pub mod task;
pub mod tracker;
pub mod transport;
pub mod version;
pub mod watchdog;

#[cfg(test)]
mod test_support;

pub use config::{AgentConfig, DeviceCredentials, Secret, SyncConfig};
pub use coordinator::{DeviceSyncCoordinator, SyncStatus};
pub use document::{ChangeType, DocumentChange, InstalledService};
pub use error::{AuthError, ConfigError, DocumentError, StoreError, TransportError};
pub use firestore::{FirebaseBackend, FirebaseEndpoints};
pub use index::UpdatableServicesIndex;
pub use lifecycle::{
    ConnectionLifecycleManager, ConnectionState, CredentialSession, LifecycleHooks, LoggingHooks,
    RestartDebouncer,
};
pub use task::ScheduledTask;
pub use tracker::{ServiceUpdateTracker, UpdateSink};
pub use transport::{
    Backend, ChangeSink, ChangeStreamTransport, ClientHandle, CollectionPath, Credentials,
    DeviceRecordStore, Liveness, Subscription, UpdatableServices,
};
pub use version::{is_newer, parse_version, VersionCatalog};
