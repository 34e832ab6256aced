// Copyright 2025-Present Datadog, Inc. https://www.datadoghq.com/
// SPDX-License-Identifier: Apache-2.0

use std::sync::Arc;

use async_trait::async_trait;
use marketplace_sync::firestore::{
    http_client, FirebaseEndpoints, FirestoreClient, FirestoreDeviceStore, PollingTransport,
    SecureTokenClient,
};
use marketplace_sync::{
    AuthError, Backend, ChangeSink, ChangeStreamTransport, ChangeType, CollectionPath,
    DeviceCredentials, DeviceRecordStore, DocumentChange, FirebaseBackend, UpdatableServices,
};
use mockito::{Matcher, Server};
use serde_json::json;
use tokio::sync::mpsc;
use tokio::time::{sleep, timeout, Duration};

const RECORD_PATH: &str = "/v1/projects/proj/databases/(default)/documents/users/u1/devices/d1";
const INSTALLED_PATH: &str =
    "/v1/projects/proj/databases/(default)/documents/users/u1/devices/d1/installed_services";

fn device() -> DeviceCredentials {
    DeviceCredentials {
        api_key: "api-key".to_string(),
        project_id: "proj".to_string(),
        refresh_token: "refresh-1".to_string(),
        device_id: "d1".to_string(),
    }
}

struct ChannelSink(mpsc::UnboundedSender<Vec<DocumentChange>>);

#[async_trait]
impl ChangeSink for ChannelSink {
    async fn on_batch(&self, changes: Vec<DocumentChange>) {
        let _ = self.0.send(changes);
    }
}

#[tokio::test]
async fn token_exchange_returns_credentials() {
    let mut server = Server::new_async().await;
    let mock = server
        .mock("POST", "/v1/token")
        .match_query(Matcher::UrlEncoded("key".into(), "api-key".into()))
        .match_body(Matcher::Json(json!({
            "grantType": "refresh_token",
            "refreshToken": "refresh-1"
        })))
        .with_status(200)
        .with_header("content-type", "application/json")
        .with_body(r#"{"user_id":"u1","id_token":"id-1","refresh_token":"refresh-2","expires_in":"3600"}"#)
        .create_async()
        .await;

    let client = SecureTokenClient::new(http_client().unwrap(), &server.url(), "api-key");
    let credentials = client.exchange("refresh-1").await.unwrap();
    assert_eq!(credentials.user_id, "u1");
    assert_eq!(credentials.id_token, "id-1");
    assert_eq!(credentials.refresh_token, "refresh-2");
    mock.assert_async().await;
}

#[tokio::test]
async fn token_exchange_reports_status_and_missing_fields() {
    let mut server = Server::new_async().await;
    let rejected = server
        .mock("POST", "/v1/token")
        .match_query(Matcher::Any)
        .with_status(400)
        .with_body(r#"{"error":{"message":"INVALID_REFRESH_TOKEN"}}"#)
        .expect(1)
        .create_async()
        .await;
    let client = SecureTokenClient::new(http_client().unwrap(), &server.url(), "api-key");
    let err = client.exchange("refresh-1").await.unwrap_err();
    assert!(matches!(err, AuthError::Status(400)));
    rejected.assert_async().await;
    rejected.remove_async().await;

    server
        .mock("POST", "/v1/token")
        .match_query(Matcher::Any)
        .with_status(200)
        .with_body(r#"{"user_id":"u1"}"#)
        .create_async()
        .await;
    let err = client.exchange("refresh-1").await.unwrap_err();
    assert!(matches!(err, AuthError::MissingField("id_token")));
}

#[tokio::test]
async fn token_exchange_rejects_non_json_body() {
    let mut server = Server::new_async().await;
    server
        .mock("POST", "/v1/token")
        .match_query(Matcher::Any)
        .with_status(200)
        .with_body("<html>maintenance</html>")
        .create_async()
        .await;
    let client = SecureTokenClient::new(http_client().unwrap(), &server.url(), "api-key");
    let err = client.exchange("refresh-1").await.unwrap_err();
    assert!(matches!(err, AuthError::MalformedResponse(_)));
}

#[tokio::test]
async fn backend_exchanges_the_rotated_refresh_token_next_time() {
    let mut server = Server::new_async().await;
    let first = server
        .mock("POST", "/v1/token")
        .match_query(Matcher::Any)
        .match_body(Matcher::PartialJson(json!({"refreshToken": "refresh-1"})))
        .with_status(200)
        .with_body(r#"{"user_id":"u1","id_token":"id-1","refresh_token":"refresh-2"}"#)
        .expect(1)
        .create_async()
        .await;
    let second = server
        .mock("POST", "/v1/token")
        .match_query(Matcher::Any)
        .match_body(Matcher::PartialJson(json!({"refreshToken": "refresh-2"})))
        .with_status(200)
        .with_body(r#"{"user_id":"u1","id_token":"id-2"}"#)
        .expect(2)
        .create_async()
        .await;

    let backend = FirebaseBackend::with_endpoints(
        device(),
        Duration::from_secs(10),
        FirebaseEndpoints::single(&server.url()),
    )
    .unwrap();
    assert_eq!(backend.exchange_token().await.unwrap().id_token, "id-1");
    assert_eq!(backend.exchange_token().await.unwrap().id_token, "id-2");
    // Without a new rotation the last rotated token stays in use.
    assert_eq!(backend.exchange_token().await.unwrap().refresh_token, "refresh-2");
    first.assert_async().await;
    second.assert_async().await;
}

#[tokio::test]
async fn backend_reads_and_merge_writes_the_device_record() {
    let mut server = Server::new_async().await;
    server
        .mock("POST", "/v1/token")
        .match_query(Matcher::Any)
        .with_status(200)
        .with_body(r#"{"user_id":"u1","id_token":"id-1"}"#)
        .create_async()
        .await;
    let read = server
        .mock("GET", RECORD_PATH)
        .match_header("authorization", "Bearer id-1")
        .with_status(200)
        .with_body(
            json!({
                "name": "projects/proj/databases/(default)/documents/users/u1/devices/d1",
                "fields": {
                    "name": {"stringValue": "kitchen"},
                    "updatable_services": {"mapValue": {"fields": {
                        "web": {"stringValue": "2.0.0"}
                    }}}
                }
            })
            .to_string(),
        )
        .create_async()
        .await;
    let write = server
        .mock("PATCH", RECORD_PATH)
        .match_query(Matcher::UrlEncoded(
            "updateMask.fieldPaths".into(),
            "updatable_services".into(),
        ))
        .match_header("authorization", "Bearer id-1")
        .match_body(Matcher::Json(json!({
            "fields": {"updatable_services": {"mapValue": {"fields": {
                "db": {"stringValue": "1.1.0"}
            }}}}
        })))
        .with_status(200)
        .with_body("{}")
        .create_async()
        .await;

    let backend = FirebaseBackend::with_endpoints(
        device(),
        Duration::from_secs(10),
        FirebaseEndpoints::single(&server.url()),
    )
    .unwrap();
    let credentials = backend.exchange_token().await.unwrap();
    // The refresh token is kept when the endpoint does not rotate it.
    assert_eq!(credentials.refresh_token, "refresh-1");
    let client = backend.connect(credentials);
    assert_eq!(
        client.installed_services_path().as_str(),
        "users/u1/devices/d1/installed_services"
    );

    let services = client.store.read_updatable_services().await.unwrap();
    assert_eq!(
        services,
        UpdatableServices::from([("web".to_string(), "2.0.0".to_string())])
    );
    client
        .store
        .write_updatable_services(&UpdatableServices::from([(
            "db".to_string(),
            "1.1.0".to_string(),
        )]))
        .await
        .unwrap();
    read.assert_async().await;
    write.assert_async().await;
}

#[tokio::test]
async fn missing_device_record_reads_as_empty_index() {
    let mut server = Server::new_async().await;
    server
        .mock("GET", RECORD_PATH)
        .with_status(404)
        .with_body(r#"{"error":{"code":404,"status":"NOT_FOUND"}}"#)
        .create_async()
        .await;
    let client = FirestoreClient::new(http_client().unwrap(), &server.url(), "proj", "id-1");
    let store = FirestoreDeviceStore::new(client, "u1", "d1");
    assert!(store.read_updatable_services().await.unwrap().is_empty());
}

#[tokio::test]
async fn polling_transport_delivers_listing_and_beats() {
    let mut server = Server::new_async().await;
    server
        .mock("GET", INSTALLED_PATH)
        .match_query(Matcher::Any)
        .with_status(200)
        .with_body(
            json!({
                "documents": [{
                    "name": "projects/proj/databases/(default)/documents/users/u1/devices/d1/installed_services/web",
                    "fields": {
                        "version": {"stringValue": "1.0.0"},
                        "env": {"mapValue": {"fields": {"PORT": {"integerValue": "8080"}}}}
                    },
                    "updateTime": "2024-05-01T10:00:00Z"
                }]
            })
            .to_string(),
        )
        .create_async()
        .await;

    let client = FirestoreClient::new(http_client().unwrap(), &server.url(), "proj", "id-1");
    let transport = PollingTransport::new(client, Duration::from_millis(50));
    let liveness = transport.liveness();
    let (tx, mut rx) = mpsc::unbounded_channel();
    let subscription = transport
        .subscribe(
            CollectionPath::installed_services("u1", "d1"),
            Arc::new(ChannelSink(tx)),
        )
        .unwrap();

    let batch = timeout(Duration::from_secs(5), rx.recv())
        .await
        .expect("first batch")
        .expect("sink open");
    assert_eq!(batch.len(), 1);
    assert_eq!(batch[0].change_type, ChangeType::Added);
    assert_eq!(batch[0].id, "web");
    assert_eq!(batch[0].fields["env"], json!({"PORT": 8080}));

    // Unchanged listings produce no further batches but keep beating.
    sleep(Duration::from_millis(200)).await;
    assert!(rx.try_recv().is_err());
    assert!(liveness.beats() >= 2);

    subscription.unsubscribe();
    transport.shutdown();
    assert!(transport
        .subscribe(
            CollectionPath::service_versions("web"),
            Arc::new(ChannelSink(mpsc::unbounded_channel().0)),
        )
        .is_err());
}

#[tokio::test]
async fn failed_polls_do_not_beat() {
    let mut server = Server::new_async().await;
    server
        .mock("GET", INSTALLED_PATH)
        .match_query(Matcher::Any)
        .with_status(503)
        .create_async()
        .await;

    let client = FirestoreClient::new(http_client().unwrap(), &server.url(), "proj", "id-1");
    let transport = PollingTransport::new(client, Duration::from_millis(20));
    let (tx, mut rx) = mpsc::unbounded_channel();
    let _subscription = transport
        .subscribe(
            CollectionPath::installed_services("u1", "d1"),
            Arc::new(ChannelSink(tx)),
        )
        .unwrap();

    sleep(Duration::from_millis(200)).await;
    assert_eq!(transport.liveness().beats(), 0);
    assert!(rx.try_recv().is_err());
    transport.shutdown();
}
