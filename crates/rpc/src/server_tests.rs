//! Router-level tests for the coordinator API.

use std::sync::atomic::AtomicUsize;
use std::sync::Arc;
use std::time::{Duration, Instant};

use axum::body::Body;
use axum::http::{header, Request, StatusCode};
use http_body_util::BodyExt;
use serde_json::{json, Value};
use tower::ServiceExt;
use tracker_index::ContentIndex;
use tracker_registry::PeerRegistry;
use tracker_relay::SignalRelay;
use tracker_storage::{MemoryStorage, Storage};
use tracker_transfer::{TransferConfig, TransferOrchestrator};
use tracker_vault::FileVault;

use crate::fileserver::build_file_router;
use crate::server::{build_router, AppState, SharedState};

struct Fixture {
    _dir: tempfile::TempDir,
    state: SharedState,
    vault: FileVault,
}

fn fixture_with_file_port(file_port: u16) -> Fixture {
    let dir = tempfile::tempdir().unwrap();
    let storage: Arc<dyn Storage> = Arc::new(MemoryStorage::new());
    let vault = FileVault::new(dir.path());
    let registry = Arc::new(PeerRegistry::new(storage.clone(), vault.clone()).unwrap());
    let index = Arc::new(ContentIndex::new(storage));
    let orchestrator = Arc::new(
        TransferOrchestrator::new(
            registry.clone(),
            index.clone(),
            vault.clone(),
            TransferConfig {
                file_port,
                fetch_timeout: Duration::from_secs(5),
            },
        )
        .unwrap(),
    );

    let state = Arc::new(AppState {
        registry,
        index,
        orchestrator,
        relay: Arc::new(SignalRelay::new()),
        node_id: "test-node".to_string(),
        start_time: Instant::now(),
        req_count: Arc::new(AtomicUsize::new(0)),
        transfer_count: Arc::new(AtomicUsize::new(0)),
    });

    Fixture {
        _dir: dir,
        state,
        vault,
    }
}

fn fixture() -> Fixture {
    fixture_with_file_port(0)
}

async fn response_json(response: axum::response::Response) -> Value {
    let bytes = response.into_body().collect().await.unwrap().to_bytes();
    serde_json::from_slice(&bytes).unwrap()
}

fn json_request(uri: &str, method: &str, body: Value) -> Request<Body> {
    Request::builder()
        .method(method)
        .uri(uri)
        .header(header::CONTENT_TYPE, "application/json")
        .body(Body::from(body.to_string()))
        .unwrap()
}

fn get_request(uri: &str) -> Request<Body> {
    Request::builder().uri(uri).body(Body::empty()).unwrap()
}

fn multipart_upload_request(peer_id: u64, filename: &str, bytes: &[u8]) -> Request<Body> {
    let boundary = "tracker-test-boundary";
    let mut body = Vec::new();
    body.extend_from_slice(
        format!(
            "--{boundary}\r\nContent-Disposition: form-data; name=\"peer_id\"\r\n\r\n{peer_id}\r\n"
        )
        .as_bytes(),
    );
    body.extend_from_slice(
        format!(
            "--{boundary}\r\nContent-Disposition: form-data; name=\"file\"; filename=\"{filename}\"\r\nContent-Type: application/octet-stream\r\n\r\n"
        )
        .as_bytes(),
    );
    body.extend_from_slice(bytes);
    body.extend_from_slice(format!("\r\n--{boundary}--\r\n").as_bytes());

    Request::builder()
        .method("POST")
        .uri("/upload")
        .header(
            header::CONTENT_TYPE,
            format!("multipart/form-data; boundary={boundary}"),
        )
        .body(Body::from(body))
        .unwrap()
}

#[tokio::test]
async fn test_health_reports_counts() {
    let fixture = fixture();
    let app = build_router(fixture.state.clone());

    let response = app.oneshot(get_request("/health")).await.unwrap();
    assert_eq!(response.status(), StatusCode::OK);

    let body = response_json(response).await;
    assert_eq!(body["status"], "ok");
    assert_eq!(body["node_id"], "test-node");
    assert_eq!(body["peer_count"], 0);
    assert_eq!(body["file_count"], 0);
    assert_eq!(body["open_connections"], 0);
}

#[tokio::test]
async fn test_metrics_exposition_format() {
    let fixture = fixture();
    let app = build_router(fixture.state.clone());

    let response = app.oneshot(get_request("/metrics")).await.unwrap();
    assert_eq!(response.status(), StatusCode::OK);

    let bytes = response.into_body().collect().await.unwrap().to_bytes();
    let text = String::from_utf8(bytes.to_vec()).unwrap();
    assert!(text.contains("tracker_http_requests_total 1"));
    assert!(text.contains("# TYPE tracker_registered_peers gauge"));
}

#[tokio::test]
async fn test_register_assigns_sequential_identity() {
    let fixture = fixture();
    let app = build_router(fixture.state.clone());

    let response = app
        .clone()
        .oneshot(json_request(
            "/register",
            "POST",
            json!({ "address": "10.0.0.1" }),
        ))
        .await
        .unwrap();
    assert_eq!(response.status(), StatusCode::OK);
    let peer = response_json(response).await;
    assert_eq!(peer["id"], 1);
    assert_eq!(peer["port"], 9000);

    let response = app
        .oneshot(json_request(
            "/register",
            "POST",
            json!({ "address": "10.0.0.2" }),
        ))
        .await
        .unwrap();
    let peer = response_json(response).await;
    assert_eq!(peer["id"], 2);
    assert_eq!(peer["port"], 9001);
}

#[tokio::test]
async fn test_register_rejects_blank_address() {
    let fixture = fixture();
    let app = build_router(fixture.state.clone());

    let response = app
        .oneshot(json_request("/register", "POST", json!({ "address": "  " })))
        .await
        .unwrap();
    assert_eq!(response.status(), StatusCode::BAD_REQUEST);

    let body = response_json(response).await;
    assert!(body["error"].as_str().unwrap().contains("address"));
}

#[tokio::test]
async fn test_upload_indexes_content_and_listings_agree() {
    let fixture = fixture();
    let app = build_router(fixture.state.clone());

    let peer = fixture.state.registry.register("10.0.0.1").unwrap();

    let response = app
        .clone()
        .oneshot(multipart_upload_request(peer.id, "a.txt", b"hello"))
        .await
        .unwrap();
    assert_eq!(response.status(), StatusCode::OK);
    let record = response_json(response).await;
    assert_eq!(
        record["hash"],
        "2cf24dba5fb0a30e26e83b2ac5b9e29e1b161e5c1fa7425e73043362938b9824"
    );
    assert_eq!(record["display_name"], "a.txt");
    assert_eq!(record["size"], 5);

    let response = app.clone().oneshot(get_request("/files")).await.unwrap();
    let files = response_json(response).await;
    assert_eq!(files.as_array().unwrap().len(), 1);

    let uri = format!("/peer_files/{}", peer.id);
    let response = app.oneshot(get_request(&uri)).await.unwrap();
    let files = response_json(response).await;
    assert_eq!(files[0]["display_name"], "a.txt");
}

#[tokio::test]
async fn test_upload_for_unknown_peer_is_404() {
    let fixture = fixture();
    let app = build_router(fixture.state.clone());

    let response = app
        .oneshot(multipart_upload_request(404, "a.txt", b"hello"))
        .await
        .unwrap();
    assert_eq!(response.status(), StatusCode::NOT_FOUND);
}

#[tokio::test]
async fn test_upload_missing_file_field_is_400() {
    let fixture = fixture();
    let app = build_router(fixture.state.clone());

    let boundary = "tracker-test-boundary";
    let body = format!(
        "--{boundary}\r\nContent-Disposition: form-data; name=\"peer_id\"\r\n\r\n1\r\n--{boundary}--\r\n"
    );
    let request = Request::builder()
        .method("POST")
        .uri("/upload")
        .header(
            header::CONTENT_TYPE,
            format!("multipart/form-data; boundary={boundary}"),
        )
        .body(Body::from(body))
        .unwrap();

    let response = app.oneshot(request).await.unwrap();
    assert_eq!(response.status(), StatusCode::BAD_REQUEST);
}

#[tokio::test]
async fn test_sources_of_unknown_hash_is_empty_list() {
    let fixture = fixture();
    let app = build_router(fixture.state.clone());

    let absent = "a".repeat(64);
    let response = app
        .oneshot(get_request(&format!("/sources/{absent}")))
        .await
        .unwrap();
    assert_eq!(response.status(), StatusCode::OK);
    assert_eq!(response_json(response).await, json!([]));
}

#[tokio::test]
async fn test_sources_rejects_malformed_hash() {
    let fixture = fixture();
    let app = build_router(fixture.state.clone());

    let response = app
        .oneshot(get_request("/sources/not-a-hash"))
        .await
        .unwrap();
    assert_eq!(response.status(), StatusCode::BAD_REQUEST);
}

#[tokio::test]
async fn test_download_from_unknown_source_is_404() {
    let fixture = fixture();
    let app = build_router(fixture.state.clone());

    let requester = fixture.state.registry.register("127.0.0.1").unwrap();
    let response = app
        .oneshot(json_request(
            "/download",
            "POST",
            json!({
                "peer_id": requester.id,
                "source_peer_id": 99,
                "filename": "a.txt",
            }),
        ))
        .await
        .unwrap();
    assert_eq!(response.status(), StatusCode::NOT_FOUND);
}

#[tokio::test]
async fn test_download_from_unreachable_source_is_502() {
    // Grab a port nothing listens on.
    let dead_port = {
        let listener = std::net::TcpListener::bind("127.0.0.1:0").unwrap();
        listener.local_addr().unwrap().port()
    };
    let fixture = fixture_with_file_port(dead_port);
    let app = build_router(fixture.state.clone());

    let source = fixture.state.registry.register("127.0.0.1").unwrap();
    let requester = fixture.state.registry.register("127.0.0.1").unwrap();

    let response = app
        .oneshot(json_request(
            "/download",
            "POST",
            json!({
                "peer_id": requester.id,
                "source_peer_id": source.id,
                "filename": "a.txt",
            }),
        ))
        .await
        .unwrap();
    assert_eq!(response.status(), StatusCode::BAD_GATEWAY);
}

#[tokio::test]
async fn test_file_server_serves_persisted_blob() {
    let fixture = fixture();
    fixture.vault.persist(7, "a.txt", b"hello").await.unwrap();

    let app = build_file_router(fixture.vault.clone());
    let response = app
        .clone()
        .oneshot(get_request("/files/7/a.txt"))
        .await
        .unwrap();
    assert_eq!(response.status(), StatusCode::OK);
    assert_eq!(
        response.headers()[header::CONTENT_TYPE],
        "application/octet-stream"
    );
    let bytes = response.into_body().collect().await.unwrap().to_bytes();
    assert_eq!(&bytes[..], b"hello");

    let response = app.oneshot(get_request("/files/7/missing.txt")).await.unwrap();
    assert_eq!(response.status(), StatusCode::NOT_FOUND);
}

/// End to end: two peers register, one uploads, the other downloads through
/// the coordinator, and afterwards both appear as sources for the hash.
#[tokio::test]
async fn test_share_cycle_over_both_routers() {
    // Bind the blob server first so its ephemeral port can be wired into the
    // orchestrator.
    let dir = tempfile::tempdir().unwrap();
    let shared_vault = FileVault::new(dir.path());
    let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
    let file_port = listener.local_addr().unwrap().port();
    let file_app = build_file_router(shared_vault.clone());
    tokio::spawn(async move {
        axum::serve(listener, file_app).await.unwrap();
    });

    let storage: Arc<dyn Storage> = Arc::new(MemoryStorage::new());
    let registry = Arc::new(PeerRegistry::new(storage.clone(), shared_vault.clone()).unwrap());
    let index = Arc::new(ContentIndex::new(storage));
    let orchestrator = Arc::new(
        TransferOrchestrator::new(
            registry.clone(),
            index.clone(),
            shared_vault.clone(),
            TransferConfig {
                file_port,
                fetch_timeout: Duration::from_secs(5),
            },
        )
        .unwrap(),
    );
    let state = Arc::new(AppState {
        registry,
        index,
        orchestrator,
        relay: Arc::new(SignalRelay::new()),
        node_id: "test-node".to_string(),
        start_time: Instant::now(),
        req_count: Arc::new(AtomicUsize::new(0)),
        transfer_count: Arc::new(AtomicUsize::new(0)),
    });
    let app = build_router(state.clone());

    let response = app
        .clone()
        .oneshot(json_request(
            "/register",
            "POST",
            json!({ "address": "127.0.0.1" }),
        ))
        .await
        .unwrap();
    let source = response_json(response).await;
    let source_id = source["id"].as_u64().unwrap();

    let response = app
        .clone()
        .oneshot(json_request(
            "/register",
            "POST",
            json!({ "address": "127.0.0.1" }),
        ))
        .await
        .unwrap();
    let requester = response_json(response).await;
    let requester_id = requester["id"].as_u64().unwrap();

    let response = app
        .clone()
        .oneshot(multipart_upload_request(source_id, "shared.txt", b"hello"))
        .await
        .unwrap();
    assert_eq!(response.status(), StatusCode::OK);
    let record = response_json(response).await;
    let hash = record["hash"].as_str().unwrap().to_string();

    let response = app
        .clone()
        .oneshot(json_request(
            "/download",
            "POST",
            json!({
                "peer_id": requester_id,
                "source_peer_id": source_id,
                "filename": "shared.txt",
            }),
        ))
        .await
        .unwrap();
    assert_eq!(response.status(), StatusCode::OK);
    let fetched = response_json(response).await;
    assert_eq!(fetched["hash"].as_str().unwrap(), hash);

    // Sources expose address and port only, so compare on the assigned ports.
    let response = app
        .oneshot(get_request(&format!("/sources/{hash}")))
        .await
        .unwrap();
    let sources = response_json(response).await;
    let mut ports: Vec<u64> = sources
        .as_array()
        .unwrap()
        .iter()
        .map(|p| p["port"].as_u64().unwrap())
        .collect();
    ports.sort_unstable();
    assert_eq!(ports, vec![9000, 9001]);
    assert!(sources[0].get("id").is_none());
}
