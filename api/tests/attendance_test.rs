mod helpers;

use axum::http::StatusCode;
use chrono::{DateTime, Duration, Utc};
use helpers::{body_json, empty_request, json_request, make_test_app, spawn_server, with_connect_info, TestApp};
use serde_json::{Value, json};
use serial_test::serial;
use services::local_cache::{LocalCache, SqlLocalCache};
use services::offline_queue::OfflineQueue;
use services::sync_reconciler::SyncReconciler;
use services::token;
use services::validation::HttpValidationClient;
use std::sync::Arc;
use tower::ServiceExt;
use util::clock::Clock;

async fn start(app: &TestApp, body: Value) -> Value {
    let res = app
        .router
        .clone()
        .oneshot(json_request("POST", "/api/sessions", &body))
        .await
        .unwrap();
    assert_eq!(res.status(), StatusCode::CREATED);
    body_json(res).await["data"].clone()
}

fn claim(token: &str, student: &str, scanned_at: DateTime<Utc>, online: bool) -> Value {
    json!({
        "token": token,
        "claim": {
            "student_id": student,
            "scanned_at": scanned_at,
            "is_online": online,
            "device_id": "device-1"
        }
    })
}

async fn validate(app: &TestApp, body: &Value, ip: [u8; 4]) -> (StatusCode, Value) {
    let req = with_connect_info(json_request("POST", "/api/attendance/validate", body), ip);
    let res = app.router.clone().oneshot(req).await.unwrap();
    let status = res.status();
    (status, body_json(res).await)
}

#[tokio::test]
#[serial]
async fn live_scan_is_recorded_once() {
    let app = make_test_app().await;
    let session = start(&app, json!({"course_code": "COS301", "course_name": "SE", "duration_minutes": 60})).await;
    let token = session["encoded_token"].as_str().unwrap();

    let body = claim(token, "21/0042", app.clock.now(), true);
    let (status, json) = validate(&app, &body, [127, 0, 0, 1]).await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(json["data"]["success"], true);
    assert_eq!(json["data"]["session"]["course_code"], "COS301");

    let (status, json) = validate(&app, &body, [127, 0, 0, 1]).await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(json["data"]["error_code"], "AlreadyScanned");
}

#[tokio::test]
#[serial]
async fn rotated_key_makes_old_code_stale() {
    let app = make_test_app().await;
    let session = start(&app, json!({"course_code": "COS301", "course_name": "SE", "duration_minutes": 60})).await;
    let id = session["id"].as_str().unwrap();
    let old_token = session["encoded_token"].as_str().unwrap().to_string();

    let rotated = body_json(
        app.router
            .clone()
            .oneshot(empty_request("POST", &format!("/api/sessions/{id}/rotate")))
            .await
            .unwrap(),
    )
    .await;
    let new_token = rotated["data"]["encoded_token"].as_str().unwrap().to_string();

    let (status, json) = validate(&app, &claim(&old_token, "21/0042", app.clock.now(), true), [127, 0, 0, 1]).await;
    assert_eq!(status, StatusCode::CONFLICT);
    assert_eq!(json["success"], false);
    assert_eq!(json["data"]["error_code"], "StaleToken");

    let (status, _) = validate(&app, &claim(&new_token, "21/0042", app.clock.now(), true), [127, 0, 0, 1]).await;
    assert_eq!(status, StatusCode::OK);
}

#[tokio::test]
#[serial]
async fn ended_session_refuses_live_scans() {
    let app = make_test_app().await;
    let session = start(&app, json!({"course_code": "COS301", "course_name": "SE", "duration_minutes": 60})).await;
    let id = session["id"].as_str().unwrap();
    let token = session["encoded_token"].as_str().unwrap().to_string();

    app.clock.advance(Duration::minutes(5));
    let res = app
        .router
        .clone()
        .oneshot(empty_request("POST", &format!("/api/sessions/{id}/end")))
        .await
        .unwrap();
    assert_eq!(res.status(), StatusCode::OK);

    let (status, json) = validate(&app, &claim(&token, "21/0042", app.clock.now(), true), [127, 0, 0, 1]).await;
    assert_eq!(status, StatusCode::GONE);
    assert_eq!(json["data"]["error_code"], "SessionExpired");
}

#[tokio::test]
#[serial]
async fn ip_restriction_uses_connection_address() {
    let app = make_test_app().await;
    let session = start(
        &app,
        json!({
            "course_code": "COS301",
            "course_name": "SE",
            "duration_minutes": 60,
            "restrict_by_ip": true,
            "allowed_ip_cidr": "10.0.0.0/8"
        }),
    )
    .await;
    let token = session["encoded_token"].as_str().unwrap();

    let (status, json) = validate(&app, &claim(token, "21/0042", app.clock.now(), true), [192, 168, 1, 5]).await;
    assert_eq!(status, StatusCode::FORBIDDEN);
    assert_eq!(json["data"]["error_code"], "IpNotPermitted");

    let (status, _) = validate(&app, &claim(token, "21/0042", app.clock.now(), true), [10, 1, 2, 3]).await;
    assert_eq!(status, StatusCode::OK);
}

#[tokio::test]
#[serial]
async fn unknown_session_and_garbage_token() {
    let app = make_test_app().await;
    let stray = token::encode("missing", "COS999", "k", app.clock.now());

    let (status, json) = validate(&app, &claim(&stray, "21/0042", app.clock.now(), true), [127, 0, 0, 1]).await;
    assert_eq!(status, StatusCode::NOT_FOUND);
    assert_eq!(json["data"]["error_code"], "UnknownSession");

    let (status, json) = validate(&app, &claim("not-a-token", "21/0042", app.clock.now(), true), [127, 0, 0, 1]).await;
    assert_eq!(status, StatusCode::BAD_REQUEST);
    assert_eq!(json["data"]["error_code"], "InvalidPayload");
}

#[tokio::test]
#[serial]
async fn offline_queue_syncs_over_http() {
    let app = make_test_app().await;
    let session = start(&app, json!({"course_code": "COS301", "course_name": "SE", "duration_minutes": 60})).await;
    let token = session["encoded_token"].as_str().unwrap().to_string();
    let addr = spawn_server(app.router.clone()).await;

    // Device side: its own cache, same clock.
    let device_cache: Arc<dyn LocalCache> =
        Arc::new(SqlLocalCache::new(db::test_utils::setup_test_db().await));
    let queue = Arc::new(OfflineQueue::new(device_cache, Arc::new(app.clock.clone())));
    let captured_at = app.clock.now() + Duration::minutes(5);
    queue.enqueue(&token, "21/0042", Some("device-1"), captured_at).await.unwrap();
    queue
        .enqueue(
            &token::encode("missing", "COS301", "k", captured_at),
            "21/0043",
            Some("device-2"),
            captured_at,
        )
        .await
        .unwrap();

    app.clock.advance(Duration::minutes(20));
    let client = HttpValidationClient::new(
        &format!("http://{addr}"),
        std::time::Duration::from_secs(5),
    )
    .unwrap();
    let reconciler = SyncReconciler::new(Arc::new(client), queue.clone(), Arc::new(app.clock.clone()));

    assert!(reconciler.try_sync_all().await);
    let status = reconciler.status().await.unwrap();
    assert_eq!(status.counts.pending, 0);
    assert_eq!(status.counts.failed, 1);
    assert_eq!(status.last_sync_at, Some(app.clock.now()));

    // The synced scan is already on record for a later live attempt.
    let (status, json) = validate(&app, &claim(&token, "21/0042", app.clock.now(), true), [127, 0, 0, 1]).await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(json["data"]["error_code"], "AlreadyScanned");
}
