// Copyright 2025-Present Datadog, Inc. https://www.datadoghq.com/
// SPDX-License-Identifier: Apache-2.0

//! Device record access through the Firestore REST API.

use async_trait::async_trait;
use reqwest::{Method, StatusCode};
use serde_json::{json, Value};
use tracing::{debug, warn};

use super::value::{decode_value, encode_string_map, Document};
use super::FirestoreClient;
use crate::error::StoreError;
use crate::transport::{DeviceRecordStore, UpdatableServices};

/// Field of the device record holding the index.
pub const UPDATABLE_SERVICES_FIELD: &str = "updatable_services";

/// The `users/{user}/devices/{device}` document.
#[derive(Debug, Clone)]
pub struct FirestoreDeviceStore {
    client: FirestoreClient,
    record_url: String,
}

impl FirestoreDeviceStore {
    pub fn new(client: FirestoreClient, user_id: &str, device_id: &str) -> Self {
        let record_url = client.document_url(&format!("users/{user_id}/devices/{device_id}"));
        Self { client, record_url }
    }

    pub fn record_url(&self) -> &str {
        &self.record_url
    }
}

fn classify(status: StatusCode) -> Result<(), StoreError> {
    if status.is_success() {
        return Ok(());
    }
    if status == StatusCode::UNAUTHORIZED || status == StatusCode::FORBIDDEN {
        return Err(StoreError::Unauthorized);
    }
    Err(StoreError::Status(status.as_u16()))
}

/// Extracts the index from a device document; non-string entries are dropped.
pub fn updatable_services_from(document: &Document) -> Result<UpdatableServices, StoreError> {
    let Some(typed) = document.fields.get(UPDATABLE_SERVICES_FIELD) else {
        return Ok(UpdatableServices::new());
    };
    let decoded = decode_value(typed).map_err(StoreError::Decode)?;
    let entries = match decoded {
        Value::Null => return Ok(UpdatableServices::new()),
        Value::Object(entries) => entries,
        other => {
            return Err(StoreError::Decode(format!(
                "`{UPDATABLE_SERVICES_FIELD}` is not a map: {other}"
            )))
        }
    };
    let mut services = UpdatableServices::new();
    for (service, version) in entries {
        match version {
            Value::String(version) => {
                services.insert(service, version);
            }
            other => warn!(
                service = %service,
                value = %other,
                "marketplace-sync: ignoring non-string updatable service entry"
            ),
        }
    }
    Ok(services)
}

#[async_trait]
impl DeviceRecordStore for FirestoreDeviceStore {
    async fn read_updatable_services(&self) -> Result<UpdatableServices, StoreError> {
        let response = self
            .client
            .request(Method::GET, &self.record_url)
            .send()
            .await?;
        if response.status() == StatusCode::NOT_FOUND {
            debug!("marketplace-sync: device record does not exist yet");
            return Ok(UpdatableServices::new());
        }
        classify(response.status())?;
        let body = response.bytes().await?;
        let document: Document =
            serde_json::from_slice(&body).map_err(|err| StoreError::Decode(err.to_string()))?;
        updatable_services_from(&document)
    }

    async fn write_updatable_services(
        &self,
        services: &UpdatableServices,
    ) -> Result<(), StoreError> {
        let body = json!({
            "fields": { UPDATABLE_SERVICES_FIELD: encode_string_map(services) }
        });
        // The mask limits the write to one field; the map itself is replaced whole.
        let response = self
            .client
            .request(Method::PATCH, &self.record_url)
            .query(&[("updateMask.fieldPaths", UPDATABLE_SERVICES_FIELD)])
            .json(&body)
            .send()
            .await?;
        classify(response.status())?;
        debug!(services = services.len(), "marketplace-sync: device record updated");
        Ok(())
    }
}
