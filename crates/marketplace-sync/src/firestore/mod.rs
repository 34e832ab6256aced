// Copyright 2025-Present Datadog, Inc. https://www.datadoghq.com/
// SPDX-License-Identifier: Apache-2.0

//! Firebase-backed implementation of the engine's backend traits.
//!
//! Credentials come from the secure-token endpoint, the device record is read
//! and merge-written through the Firestore REST API, and change streams are
//! produced by polling collection listings.

pub mod auth;
pub mod listen;
pub mod store;
pub mod value;

use std::sync::{Arc, Mutex, PoisonError};
use std::time::Duration;

use async_trait::async_trait;
use reqwest::{Client, Method, RequestBuilder};
use tracing::debug;

use crate::config::DeviceCredentials;
use crate::error::AuthError;
use crate::transport::{Backend, ClientHandle, Credentials};

pub use auth::SecureTokenClient;
pub use listen::PollingTransport;
pub use store::FirestoreDeviceStore;

pub const DEFAULT_SECURE_TOKEN_URL: &str = "https://securetoken.googleapis.com";
pub const DEFAULT_FIRESTORE_URL: &str = "https://firestore.googleapis.com";

/// Upper bound for one backend round-trip.
pub const REQUEST_TIMEOUT: Duration = Duration::from_secs(60);

/// Base URLs of the Firebase services.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct FirebaseEndpoints {
    pub secure_token_url: String,
    pub firestore_url: String,
}

impl Default for FirebaseEndpoints {
    fn default() -> Self {
        Self {
            secure_token_url: DEFAULT_SECURE_TOKEN_URL.to_string(),
            firestore_url: DEFAULT_FIRESTORE_URL.to_string(),
        }
    }
}

impl FirebaseEndpoints {
    /// Points both services at one base URL, e.g. an emulator or a test server.
    pub fn single(base_url: &str) -> Self {
        let base_url = base_url.trim_end_matches('/').to_string();
        Self {
            secure_token_url: base_url.clone(),
            firestore_url: base_url,
        }
    }
}

pub fn http_client() -> Result<Client, reqwest::Error> {
    Client::builder().timeout(REQUEST_TIMEOUT).build()
}

/// Authenticated access to one project's document tree.
#[derive(Clone)]
pub struct FirestoreClient {
    http: Client,
    documents_root: String,
    id_token: String,
}

impl std::fmt::Debug for FirestoreClient {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("FirestoreClient")
            .field("documents_root", &self.documents_root)
            .finish_non_exhaustive()
    }
}

impl FirestoreClient {
    pub fn new(http: Client, firestore_url: &str, project_id: &str, id_token: impl Into<String>) -> Self {
        Self {
            http,
            documents_root: format!(
                "{}/v1/projects/{project_id}/databases/(default)/documents",
                firestore_url.trim_end_matches('/')
            ),
            id_token: id_token.into(),
        }
    }

    pub fn document_url(&self, path: &str) -> String {
        format!("{}/{}", self.documents_root, path.trim_matches('/'))
    }

    pub fn request(&self, method: Method, url: &str) -> RequestBuilder {
        self.http.request(method, url).bearer_auth(&self.id_token)
    }
}

/// [`Backend`] talking to Firebase on behalf of one device.
pub struct FirebaseBackend {
    http: Client,
    endpoints: FirebaseEndpoints,
    device: DeviceCredentials,
    poll_interval: Duration,
    tokens: SecureTokenClient,
    /// Starts as the configured token; replaced when the endpoint rotates it.
    refresh_token: Mutex<String>,
}

impl std::fmt::Debug for FirebaseBackend {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("FirebaseBackend")
            .field("endpoints", &self.endpoints)
            .field("device", &self.device)
            .field("poll_interval", &self.poll_interval)
            .finish_non_exhaustive()
    }
}

impl FirebaseBackend {
    pub fn new(device: DeviceCredentials, poll_interval: Duration) -> Result<Self, reqwest::Error> {
        Self::with_endpoints(device, poll_interval, FirebaseEndpoints::default())
    }

    pub fn with_endpoints(
        device: DeviceCredentials,
        poll_interval: Duration,
        endpoints: FirebaseEndpoints,
    ) -> Result<Self, reqwest::Error> {
        let http = http_client()?;
        let tokens = SecureTokenClient::new(http.clone(), &endpoints.secure_token_url, &device.api_key);
        let refresh_token = Mutex::new(device.refresh_token.clone());
        Ok(Self {
            http,
            endpoints,
            device,
            poll_interval,
            tokens,
            refresh_token,
        })
    }

    fn current_refresh_token(&self) -> String {
        self.refresh_token
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .clone()
    }
}

#[async_trait]
impl Backend for FirebaseBackend {
    async fn exchange_token(&self) -> Result<Credentials, AuthError> {
        let refresh_token = self.current_refresh_token();
        let credentials = self.tokens.exchange(&refresh_token).await?;
        if credentials.refresh_token != refresh_token {
            debug!("marketplace-sync: refresh token rotated");
            *self
                .refresh_token
                .lock()
                .unwrap_or_else(PoisonError::into_inner) = credentials.refresh_token.clone();
        }
        Ok(credentials)
    }

    fn connect(&self, credentials: Credentials) -> ClientHandle {
        let client = FirestoreClient::new(
            self.http.clone(),
            &self.endpoints.firestore_url,
            &self.device.project_id,
            credentials.id_token.clone(),
        );
        let store = FirestoreDeviceStore::new(client.clone(), &credentials.user_id, &self.device.device_id);
        let transport = PollingTransport::new(client, self.poll_interval);
        ClientHandle {
            credentials,
            device_id: self.device.device_id.clone(),
            transport: Arc::new(transport),
            store: Arc::new(store),
        }
    }
}
