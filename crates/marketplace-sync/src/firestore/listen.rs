// Copyright 2025-Present Datadog, Inc. https://www.datadoghq.com/
// SPDX-License-Identifier: Apache-2.0

//! Change streams produced by polling collection listings.
//!
//! Each subscription owns a task that lists its collection every poll
//! interval and diffs the listing against the previous one by document id
//! and `updateTime`. The first successful poll reports every document as
//! ADDED. Successful polls beat the transport's liveness signal; failed ones
//! do not, which lets the watchdog notice a backend that stopped answering.

use std::collections::BTreeMap;
use std::sync::Arc;
use std::time::Duration;

use reqwest::Method;
use serde::Deserialize;
use tokio::time::{interval, MissedTickBehavior};
use tokio_util::sync::CancellationToken;
use tracing::{debug, warn};

use super::value::Document;
use super::FirestoreClient;
use crate::document::DocumentChange;
use crate::error::TransportError;
use crate::transport::{ChangeSink, ChangeStreamTransport, CollectionPath, Liveness, Subscription};

const PAGE_SIZE: &str = "300";

#[derive(Debug, Default, Deserialize)]
#[serde(rename_all = "camelCase")]
struct ListDocumentsResponse {
    #[serde(default)]
    documents: Vec<Document>,
    #[serde(default)]
    next_page_token: Option<String>,
}

#[derive(Debug)]
pub struct PollingTransport {
    client: FirestoreClient,
    poll_interval: Duration,
    liveness: Liveness,
    shutdown: CancellationToken,
}

impl PollingTransport {
    pub fn new(client: FirestoreClient, poll_interval: Duration) -> Self {
        Self {
            client,
            poll_interval,
            liveness: Liveness::new(),
            shutdown: CancellationToken::new(),
        }
    }
}

impl ChangeStreamTransport for PollingTransport {
    fn subscribe(
        &self,
        path: CollectionPath,
        sink: Arc<dyn ChangeSink>,
    ) -> Result<Subscription, TransportError> {
        if self.shutdown.is_cancelled() {
            return Err(TransportError::Closed);
        }
        let token = self.shutdown.child_token();
        tokio::spawn(poll_collection(
            self.client.clone(),
            path.clone(),
            sink,
            self.poll_interval,
            self.liveness.clone(),
            token.clone(),
        ));
        Ok(Subscription::new(path, token))
    }

    fn liveness(&self) -> Liveness {
        self.liveness.clone()
    }

    fn shutdown(&self) {
        self.shutdown.cancel();
    }
}

async fn poll_collection(
    client: FirestoreClient,
    path: CollectionPath,
    sink: Arc<dyn ChangeSink>,
    poll_interval: Duration,
    liveness: Liveness,
    token: CancellationToken,
) {
    let mut snapshot = Snapshot::default();
    let mut ticker = interval(poll_interval);
    ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
    debug!(path = %path, "marketplace-sync: polling collection");
    loop {
        tokio::select! {
            biased;
            () = token.cancelled() => break,
            _ = ticker.tick() => {}
        }
        let listing = tokio::select! {
            biased;
            () = token.cancelled() => break,
            listing = list_documents(&client, &path) => listing,
        };
        match listing {
            Ok(documents) => {
                liveness.beat();
                let changes = snapshot.apply(documents);
                if changes.is_empty() || token.is_cancelled() {
                    continue;
                }
                debug!(path = %path, changes = changes.len(), "marketplace-sync: delivering changes");
                sink.on_batch(changes).await;
            }
            Err(err) => warn!(path = %path, %err, "marketplace-sync: failed to poll collection"),
        }
    }
    debug!(path = %path, "marketplace-sync: stopped polling collection");
}

async fn list_documents(
    client: &FirestoreClient,
    path: &CollectionPath,
) -> Result<Vec<Document>, TransportError> {
    let url = client.document_url(path.as_str());
    let mut documents = Vec::new();
    let mut page_token: Option<String> = None;
    loop {
        let mut request = client
            .request(Method::GET, &url)
            .query(&[("pageSize", PAGE_SIZE)]);
        if let Some(page_token) = &page_token {
            request = request.query(&[("pageToken", page_token.as_str())]);
        }
        let response = request.send().await?;
        let status = response.status();
        if !status.is_success() {
            return Err(TransportError::Status(status.as_u16()));
        }
        let body = response.bytes().await?;
        // An empty collection may come back as `{}`.
        let page: ListDocumentsResponse = serde_json::from_slice(&body)
            .map_err(|err| TransportError::Decode(err.to_string()))?;
        documents.extend(page.documents);
        match page.next_page_token.filter(|token| !token.is_empty()) {
            Some(next) => page_token = Some(next),
            None => return Ok(documents),
        }
    }
}

/// Last observed listing of one collection: document id to `updateTime`.
#[derive(Debug, Default)]
pub struct Snapshot {
    seen: BTreeMap<String, String>,
}

impl Snapshot {
    /// Diffs `documents` against the previous listing and remembers them.
    ///
    /// Documents whose fields cannot be decoded are left out of the
    /// snapshot, so they are retried on the next poll.
    pub fn apply(&mut self, documents: Vec<Document>) -> Vec<DocumentChange> {
        let mut next = BTreeMap::new();
        let mut changes = Vec::new();
        for document in documents {
            let id = document.id().to_string();
            let update_time = document.update_time.clone().unwrap_or_default();
            let previous = self.seen.get(&id);
            if previous == Some(&update_time) {
                next.insert(id, update_time);
                continue;
            }
            let fields = match document.plain_fields() {
                Ok(fields) => fields,
                Err(reason) => {
                    warn!(document = %document.name, %reason, "marketplace-sync: skipping undecodable document");
                    if let Some(previous) = previous {
                        next.insert(id, previous.clone());
                    }
                    continue;
                }
            };
            changes.push(if previous.is_some() {
                DocumentChange::modified(id.clone(), fields)
            } else {
                DocumentChange::added(id.clone(), fields)
            });
            next.insert(id, update_time);
        }
        for id in self.seen.keys() {
            if !next.contains_key(id) {
                changes.push(DocumentChange::removed(id.clone()));
            }
        }
        self.seen = next;
        changes
    }

    pub fn len(&self) -> usize {
        self.seen.len()
    }

    pub fn is_empty(&self) -> bool {
        self.seen.is_empty()
    }
}
