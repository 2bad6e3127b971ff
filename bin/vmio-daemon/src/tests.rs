//! End-to-end handler tests
//!
//! Drive the data and control routers with in-process requests against
//! a file-backed ticket.

use std::path::{Path, PathBuf};

use axum::Router;
use axum::body::Body;
use axum::http::{Method, Request, Response, StatusCode, header};
use bytes::Bytes;
use http_body_util::BodyExt;
use serde_json::{Value, json};
use tempfile::TempDir;
use tower::ServiceExt;

use vmio_common::blkhash::{Algorithm, Hash};

use crate::config::Config;
use crate::routes::{control_router, data_router};
use crate::state::{AppState, SharedState};

// /tmp is usually tmpfs which rejects O_DIRECT; create images on a
// real filesystem instead.
fn temp_dir() -> TempDir {
    TempDir::new_in(env!("CARGO_MANIFEST_DIR")).unwrap()
}

fn test_state() -> SharedState {
    let mut config = Config::default();
    config.local.enable = false;
    AppState::new(config)
}

fn temp_image(dir: &TempDir, size: usize, fill: u8) -> PathBuf {
    let path = dir.path().join("disk.raw");
    std::fs::write(&path, vec![fill; size]).unwrap();
    path
}

fn add_ticket(state: &SharedState, uuid: &str, path: &Path, size: u64, ops: Value) {
    state
        .auth
        .add(&json!({
            "uuid": uuid,
            "size": size,
            "url": format!("file:{}", path.display()),
            "ops": ops,
            "timeout": 300,
            "transfer_id": format!("transfer-{uuid}"),
        }))
        .unwrap();
}

async fn request(
    router: &Router,
    method: Method,
    uri: &str,
    headers: &[(&str, &str)],
    body: Body,
) -> Response<axum::body::Body> {
    let mut builder = Request::builder().method(method).uri(uri);
    for (name, value) in headers {
        builder = builder.header(*name, *value);
    }
    router
        .clone()
        .oneshot(builder.body(body).unwrap())
        .await
        .unwrap()
}

async fn body_bytes(response: Response<axum::body::Body>) -> Bytes {
    response.into_body().collect().await.unwrap().to_bytes()
}

async fn body_json(response: Response<axum::body::Body>) -> Value {
    serde_json::from_slice(&body_bytes(response).await).unwrap()
}

// ── Images ────────────────────────────────────────────────────────────────────

#[tokio::test]
async fn test_put_and_get_range_round_trip() {
    let dir = temp_dir();
    let path = temp_image(&dir, 4096, 0xaa);
    let state = test_state();
    add_ticket(&state, "t1", &path, 4096, json!(["read", "write"]));
    let router = data_router(state);

    // Replace 512 bytes at offset 1024.
    let response = request(
        &router,
        Method::PUT,
        "/images/t1",
        &[
            ("content-length", "512"),
            ("content-range", "bytes 1024-1535/*"),
        ],
        Body::from(vec![0x55; 512]),
    )
    .await;
    assert_eq!(response.status(), StatusCode::OK);

    // Read the written range back.
    let response = request(
        &router,
        Method::GET,
        "/images/t1",
        &[("range", "bytes=1024-1535")],
        Body::empty(),
    )
    .await;
    assert_eq!(response.status(), StatusCode::PARTIAL_CONTENT);
    assert_eq!(
        response.headers()[header::CONTENT_RANGE],
        "bytes 1024-1535/4096"
    );
    assert_eq!(response.headers()[header::CONTENT_LENGTH], "512");
    assert_eq!(
        response.headers()[header::CONTENT_DISPOSITION],
        "attachment"
    );
    assert_eq!(body_bytes(response).await.as_ref(), &[0x55; 512][..]);

    // The rest of the image is unchanged.
    let response = request(&router, Method::GET, "/images/t1", &[], Body::empty()).await;
    assert_eq!(response.status(), StatusCode::OK);
    let data = body_bytes(response).await;
    assert_eq!(data.len(), 4096);
    assert!(data[..1024].iter().all(|&b| b == 0xaa));
    assert!(data[1024..1536].iter().all(|&b| b == 0x55));
    assert!(data[1536..].iter().all(|&b| b == 0xaa));
}

#[tokio::test]
async fn test_get_suffix_range_rejected() {
    let dir = temp_dir();
    let path = temp_image(&dir, 4096, 0);
    let state = test_state();
    add_ticket(&state, "t1", &path, 4096, json!(["read"]));
    let router = data_router(state);

    let response = request(
        &router,
        Method::GET,
        "/images/t1",
        &[("range", "bytes=-512")],
        Body::empty(),
    )
    .await;
    assert_eq!(response.status(), StatusCode::RANGE_NOT_SATISFIABLE);
}

#[tokio::test]
async fn test_get_range_after_eof_rejected() {
    let dir = temp_dir();
    let path = temp_image(&dir, 4096, 0);
    let state = test_state();
    add_ticket(&state, "t1", &path, 8192, json!(["read"]));
    let router = data_router(state);

    // Inside the ticket window but past the image end.
    let response = request(
        &router,
        Method::GET,
        "/images/t1",
        &[("range", "bytes=4096-8191")],
        Body::empty(),
    )
    .await;
    assert_eq!(response.status(), StatusCode::RANGE_NOT_SATISFIABLE);
}

#[tokio::test]
async fn test_authorization_failures() {
    let dir = temp_dir();
    let path = temp_image(&dir, 4096, 0);
    let state = test_state();
    add_ticket(&state, "read-only", &path, 4096, json!(["read"]));
    let router = data_router(state);

    // Writing with a read ticket.
    let response = request(
        &router,
        Method::PUT,
        "/images/read-only",
        &[("content-length", "16")],
        Body::from(vec![0; 16]),
    )
    .await;
    assert_eq!(response.status(), StatusCode::FORBIDDEN);
    assert_eq!(response.headers()[header::CONNECTION], "close");
    assert_eq!(
        response.headers()[header::CONTENT_TYPE],
        "text/plain; charset=UTF-8"
    );
    let message = body_bytes(response).await;
    assert!(message.ends_with(b"\n"));

    // Unknown ticket.
    let response = request(&router, Method::GET, "/images/missing", &[], Body::empty()).await;
    assert_eq!(response.status(), StatusCode::FORBIDDEN);

    // Range outside the ticket window.
    let response = request(
        &router,
        Method::GET,
        "/images/read-only",
        &[("range", "bytes=0-4096")],
        Body::empty(),
    )
    .await;
    assert_eq!(response.status(), StatusCode::FORBIDDEN);
}

#[tokio::test]
async fn test_put_requires_content_length_match() {
    let dir = temp_dir();
    let path = temp_image(&dir, 4096, 0);
    let state = test_state();
    add_ticket(&state, "t1", &path, 4096, json!(["write"]));
    let router = data_router(state);

    // The body ends before the promised size.
    let response = request(
        &router,
        Method::PUT,
        "/images/t1",
        &[("content-length", "1024")],
        Body::from(vec![0x55; 512]),
    )
    .await;
    assert_eq!(response.status(), StatusCode::BAD_REQUEST);
}

#[tokio::test]
async fn test_patch_zero_and_flush() {
    let dir = temp_dir();
    let path = temp_image(&dir, 8192, 0xaa);
    let state = test_state();
    add_ticket(&state, "t1", &path, 8192, json!(["read", "write"]));
    let router = data_router(state);

    let msg = json!({"op": "zero", "offset": 4096, "size": 4096, "flush": true});
    let response = request(
        &router,
        Method::PATCH,
        "/images/t1",
        &[("content-type", "application/json")],
        Body::from(msg.to_string()),
    )
    .await;
    assert_eq!(response.status(), StatusCode::OK);

    let response = request(
        &router,
        Method::GET,
        "/images/t1",
        &[("range", "bytes=4096-8191")],
        Body::empty(),
    )
    .await;
    let data = body_bytes(response).await;
    assert!(data.iter().all(|&b| b == 0));

    let response = request(
        &router,
        Method::PATCH,
        "/images/t1",
        &[],
        Body::from(json!({"op": "flush"}).to_string()),
    )
    .await;
    assert_eq!(response.status(), StatusCode::OK);
}

#[tokio::test]
async fn test_patch_validation() {
    let dir = temp_dir();
    let path = temp_image(&dir, 4096, 0);
    let state = test_state();
    add_ticket(&state, "t1", &path, 4096, json!(["write"]));
    let router = data_router(state);

    // Unknown op.
    let response = request(
        &router,
        Method::PATCH,
        "/images/t1",
        &[],
        Body::from(json!({"op": "discard"}).to_string()),
    )
    .await;
    assert_eq!(response.status(), StatusCode::BAD_REQUEST);

    // Zero without size.
    let response = request(
        &router,
        Method::PATCH,
        "/images/t1",
        &[],
        Body::from(json!({"op": "zero"}).to_string()),
    )
    .await;
    assert_eq!(response.status(), StatusCode::BAD_REQUEST);

    // Not JSON at all.
    let response = request(
        &router,
        Method::PATCH,
        "/images/t1",
        &[],
        Body::from("not json"),
    )
    .await;
    assert_eq!(response.status(), StatusCode::BAD_REQUEST);
}

#[tokio::test]
async fn test_options_meta_capabilities() {
    let state = test_state();
    let router = data_router(state);

    let response = request(&router, Method::OPTIONS, "/images/*", &[], Body::empty()).await;
    assert_eq!(response.status(), StatusCode::OK);
    let options = body_json(response).await;
    assert_eq!(
        options["features"],
        json!(["checksum", "extents", "flush", "zero"])
    );
    assert!(options.get("max_readers").is_none());
}

#[tokio::test]
async fn test_options_for_ticket() {
    let dir = temp_dir();
    let path = temp_image(&dir, 4096, 0);
    let state = test_state();
    add_ticket(&state, "rw", &path, 4096, json!(["read", "write"]));
    add_ticket(&state, "ro", &path, 4096, json!(["read"]));
    let router = data_router(state);

    let response = request(&router, Method::OPTIONS, "/images/rw", &[], Body::empty()).await;
    assert_eq!(response.status(), StatusCode::OK);
    let allow = response.headers()[header::ALLOW].to_str().unwrap().to_string();
    assert!(allow.contains("PUT"));
    let options = body_json(response).await;
    assert_eq!(
        options["features"],
        json!(["checksum", "extents", "flush", "zero"])
    );
    assert_eq!(options["max_readers"], 8);
    // Regular files support a single writer.
    assert_eq!(options["max_writers"], 1);

    let response = request(&router, Method::OPTIONS, "/images/ro", &[], Body::empty()).await;
    let allow = response.headers()[header::ALLOW].to_str().unwrap().to_string();
    assert!(!allow.contains("PUT"));
    let options = body_json(response).await;
    assert_eq!(options["features"], json!(["checksum", "extents"]));
}

#[tokio::test]
async fn test_extents() {
    let dir = temp_dir();
    let path = temp_image(&dir, 8192, 0);
    let state = test_state();
    add_ticket(&state, "t1", &path, 8192, json!(["read"]));
    let router = data_router(state);

    let response = request(
        &router,
        Method::GET,
        "/images/t1/extents",
        &[],
        Body::empty(),
    )
    .await;
    assert_eq!(response.status(), StatusCode::OK);
    let extents = body_json(response).await;
    assert_eq!(
        extents,
        json!([{"start": 0, "length": 8192, "zero": false, "hole": false}])
    );

    // The ticket did not request dirty extents.
    let response = request(
        &router,
        Method::GET,
        "/images/t1/extents?context=dirty",
        &[],
        Body::empty(),
    )
    .await;
    assert_eq!(response.status(), StatusCode::NOT_FOUND);

    let response = request(
        &router,
        Method::GET,
        "/images/t1/extents?context=bogus",
        &[],
        Body::empty(),
    )
    .await;
    assert_eq!(response.status(), StatusCode::BAD_REQUEST);
}

#[tokio::test]
async fn test_checksum() {
    let dir = temp_dir();
    let path = temp_image(&dir, 8192, 0xaa);
    let state = test_state();
    add_ticket(&state, "t1", &path, 8192, json!(["read"]));
    let router = data_router(state);

    let response = request(
        &router,
        Method::GET,
        "/images/t1/checksum?algorithm=sha256&block_size=1048576",
        &[],
        Body::empty(),
    )
    .await;
    assert_eq!(response.status(), StatusCode::OK);
    let result = body_json(response).await;

    // The image is one data block shorter than the block size.
    let mut hash = Hash::new(Algorithm::Sha256);
    hash.update(&vec![0xaa; 8192]);
    assert_eq!(result["algorithm"], "sha256");
    assert_eq!(result["block_size"], 1_048_576);
    assert_eq!(result["checksum"], json!(hash.hexdigest()));
}

#[tokio::test]
async fn test_checksum_validation() {
    let dir = temp_dir();
    let path = temp_image(&dir, 4096, 0);
    let state = test_state();
    add_ticket(&state, "t1", &path, 4096, json!(["read"]));
    let router = data_router(state);

    for uri in [
        "/images/t1/checksum?algorithm=md5",
        "/images/t1/checksum?block_size=123",
        "/images/t1/checksum?block_size=4096",
    ] {
        let response = request(&router, Method::GET, uri, &[], Body::empty()).await;
        assert_eq!(response.status(), StatusCode::BAD_REQUEST, "uri {uri}");
    }
}

#[tokio::test]
async fn test_checksum_algorithms() {
    let state = test_state();
    let router = data_router(state);
    let response = request(
        &router,
        Method::GET,
        "/images/t1/checksum/algorithms",
        &[],
        Body::empty(),
    )
    .await;
    assert_eq!(response.status(), StatusCode::OK);
    assert_eq!(
        body_json(response).await,
        json!({"algorithms": ["sha1", "sha256", "sha512"]})
    );
}

// ── Tickets control API ───────────────────────────────────────────────────────

#[tokio::test]
async fn test_ticket_lifecycle() {
    let dir = temp_dir();
    let path = temp_image(&dir, 4096, 0);
    let state = test_state();
    let router = control_router(state);

    let ticket = json!({
        "uuid": "t1",
        "size": 4096,
        "url": format!("file:{}", path.display()),
        "ops": ["read", "write"],
        "timeout": 300,
        "transfer_id": "transfer-t1",
    });
    let response = request(
        &router,
        Method::PUT,
        "/tickets/t1",
        &[],
        Body::from(ticket.to_string()),
    )
    .await;
    assert_eq!(response.status(), StatusCode::OK);

    let response = request(&router, Method::GET, "/tickets/t1", &[], Body::empty()).await;
    assert_eq!(response.status(), StatusCode::OK);
    let info = body_json(response).await;
    assert_eq!(info["uuid"], "t1");
    assert_eq!(info["transfer_id"], "transfer-t1");
    assert_eq!(info["active"], false);

    let response = request(
        &router,
        Method::PATCH,
        "/tickets/t1",
        &[],
        Body::from(json!({"timeout": 600}).to_string()),
    )
    .await;
    assert_eq!(response.status(), StatusCode::OK);

    let response = request(&router, Method::DELETE, "/tickets/t1", &[], Body::empty()).await;
    assert_eq!(response.status(), StatusCode::NO_CONTENT);

    // DELETE is idempotent.
    let response = request(&router, Method::DELETE, "/tickets/t1", &[], Body::empty()).await;
    assert_eq!(response.status(), StatusCode::NO_CONTENT);

    let response = request(&router, Method::GET, "/tickets/t1", &[], Body::empty()).await;
    assert_eq!(response.status(), StatusCode::NOT_FOUND);
}

#[tokio::test]
async fn test_ticket_validation_errors() {
    let state = test_state();
    let router = control_router(state);

    let response = request(
        &router,
        Method::PUT,
        "/tickets/t1",
        &[],
        Body::from("not json"),
    )
    .await;
    assert_eq!(response.status(), StatusCode::BAD_REQUEST);

    // Missing url.
    let response = request(
        &router,
        Method::PUT,
        "/tickets/t1",
        &[],
        Body::from(json!({"uuid": "t1", "size": 100, "ops": ["read"]}).to_string()),
    )
    .await;
    assert_eq!(response.status(), StatusCode::BAD_REQUEST);

    let response = request(
        &router,
        Method::PATCH,
        "/tickets/t1",
        &[],
        Body::from(json!({}).to_string()),
    )
    .await;
    assert_eq!(response.status(), StatusCode::BAD_REQUEST);
}

#[tokio::test]
async fn test_tickets_not_served_on_data_router() {
    let state = test_state();
    let router = data_router(state);
    let response = request(&router, Method::GET, "/tickets/t1", &[], Body::empty()).await;
    assert_eq!(response.status(), StatusCode::NOT_FOUND);
}
