// Copyright 2025-Present Datadog, Inc. https://www.datadoghq.com/
// SPDX-License-Identifier: Apache-2.0

//! Local copy of the device's `updatable_services` index.
//!
//! Mutations are split into a plan and a commit: the coordinator computes the
//! next index, writes it to the device record and only then commits it
//! locally, so a failed write leaves local and remote state in agreement.

use crate::transport::UpdatableServices;

#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct UpdatableServicesIndex {
    services: UpdatableServices,
}

impl UpdatableServicesIndex {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn from_remote(services: UpdatableServices) -> Self {
        Self { services }
    }

    /// Overwrites local state with what the device record holds.
    pub fn replace(&mut self, services: UpdatableServices) {
        self.services = services;
    }

    pub fn get(&self, service: &str) -> Option<&str> {
        self.services.get(service).map(String::as_str)
    }

    pub fn contains(&self, service: &str) -> bool {
        self.services.contains_key(service)
    }

    pub fn len(&self) -> usize {
        self.services.len()
    }

    pub fn is_empty(&self) -> bool {
        self.services.is_empty()
    }

    pub fn as_map(&self) -> &UpdatableServices {
        &self.services
    }

    /// Index after mapping `service` to `version`, or `None` if it already does.
    pub fn with_updatable(&self, service: &str, version: &str) -> Option<UpdatableServices> {
        if self.get(service) == Some(version) {
            return None;
        }
        let mut next = self.services.clone();
        next.insert(service.to_string(), version.to_string());
        Some(next)
    }

    /// Index after removing `service`, or `None` if it is absent.
    pub fn without(&self, service: &str) -> Option<UpdatableServices> {
        if !self.contains(service) {
            return None;
        }
        let mut next = self.services.clone();
        next.remove(service);
        Some(next)
    }

    /// Adopts a planned index once it has been persisted.
    pub fn commit(&mut self, next: UpdatableServices) {
        self.services = next;
    }
}
