//! HTTP surface: gateway callbacks and settlement endpoints

mod common;

use axum::body::{to_bytes, Body};
use axum::Router;
use http::{Request, StatusCode};
use rust_decimal_macros::dec;
use serde_json::{json, Value as JsonValue};
use tower::util::ServiceExt;

use booking_settlement::database::booking_repository::BookingStatus;

use common::*;

async fn send(app: Router, request: Request<Body>) -> (StatusCode, Option<String>, JsonValue) {
    let response = app.oneshot(request).await.unwrap();
    let status = response.status();
    let request_id = response
        .headers()
        .get("x-request-id")
        .and_then(|v| v.to_str().ok())
        .map(str::to_string);
    let bytes = to_bytes(response.into_body(), usize::MAX).await.unwrap();
    let body = serde_json::from_slice(&bytes).unwrap_or(JsonValue::Null);
    (status, request_id, body)
}

fn post_json(uri: &str, body: &JsonValue) -> Request<Body> {
    Request::builder()
        .method("POST")
        .uri(uri)
        .header("content-type", "application/json")
        .body(Body::from(body.to_string()))
        .unwrap()
}

#[tokio::test]
async fn collection_callback_is_acknowledged_and_applied() {
    let h = Harness::new();
    h.insert(booking(1, BookingStatus::Pending, dec!(5000))).await;
    h.orchestrator.collect(1, GUEST_PHONE, None).await.unwrap();

    let (status, request_id, body) = send(
        h.router(None),
        post_json(
            "/webhooks/mpesa/collection/result",
            &stk_success("ws_CO_0001", "29115-1", 5000, "QGR7XK2P1M"),
        ),
    )
    .await;

    assert_eq!(status, StatusCode::OK);
    assert_eq!(body, json!({"ResultCode": 0, "ResultDesc": "Accepted"}));
    assert!(request_id.is_some());
    assert_eq!(h.booking(1).await.status, BookingStatus::Confirmed);
}

#[tokio::test]
async fn callback_for_unknown_intent_is_still_acknowledged() {
    let h = Harness::new();

    let (status, _, body) = send(
        h.router(None),
        post_json(
            "/webhooks/mpesa/disbursement/result",
            &b2c_result("not-registered", "AG_2026_0001", 0, "ok"),
        ),
    )
    .await;

    assert_eq!(status, StatusCode::OK);
    assert_eq!(body["ResultCode"], 0);
    assert_eq!(h.inbox.len().await, 1);
}

#[tokio::test]
async fn invalid_json_is_a_bad_request() {
    let h = Harness::new();
    let request = Request::builder()
        .method("POST")
        .uri("/webhooks/mpesa/collection/result")
        .header("content-type", "application/json")
        .body(Body::from("{not json"))
        .unwrap();

    let (status, _, body) = send(h.router(None), request).await;

    assert_eq!(status, StatusCode::BAD_REQUEST);
    assert_eq!(body["ResultCode"], 1);
    assert!(h.inbox.is_empty().await);
}

#[tokio::test]
async fn callback_token_is_enforced_when_configured() {
    let h = Harness::new();
    let payload = queue_timeout("AG_2026_0001");

    let (status, _, _) = send(
        h.router(Some("s3cret")),
        post_json("/webhooks/mpesa/disbursement/timeout?token=wrong", &payload),
    )
    .await;
    assert_eq!(status, StatusCode::UNAUTHORIZED);

    let (status, _, _) = send(
        h.router(Some("s3cret")),
        post_json("/webhooks/mpesa/disbursement/timeout", &payload),
    )
    .await;
    assert_eq!(status, StatusCode::UNAUTHORIZED);
    assert!(h.inbox.is_empty().await);

    let (status, _, _) = send(
        h.router(Some("s3cret")),
        post_json("/webhooks/mpesa/disbursement/timeout?token=s3cret", &payload),
    )
    .await;
    assert_eq!(status, StatusCode::OK);
}

#[tokio::test]
async fn collection_request_is_accepted_pending_callback() {
    let h = Harness::new();
    h.insert(booking(2, BookingStatus::Pending, dec!(7500))).await;

    let (status, _, body) = send(
        h.router(None),
        post_json(
            "/api/settlements/collections",
            &json!({"booking_id": 2, "phone": "0712345678"}),
        ),
    )
    .await;

    assert_eq!(status, StatusCode::ACCEPTED);
    assert_eq!(body["success"], true);
    assert_eq!(body["status"], "awaiting_callback");
    assert_eq!(body["kind"], "collection");
    assert_eq!(body["booking_id"], 2);
    assert_eq!(h.gateway.collection_count(), 1);
}

#[tokio::test]
async fn ineligible_collection_uses_error_envelope() {
    let h = Harness::new();
    h.insert(booking(3, BookingStatus::Confirmed, dec!(7500))).await;

    let (status, _, body) = send(
        h.router(None),
        post_json(
            "/api/settlements/collections",
            &json!({"booking_id": 3, "phone": GUEST_PHONE}),
        ),
    )
    .await;

    assert_eq!(status, StatusCode::UNPROCESSABLE_ENTITY);
    assert_eq!(body["success"], false);
    assert_eq!(body["status"], "NOT_ELIGIBLE");
    assert!(body["request_id"].is_string());
}

#[tokio::test]
async fn rejected_payout_names_the_intent() {
    let h = Harness::new();
    h.insert(booking(4, BookingStatus::Confirmed, dec!(10000))).await;
    h.gateway.script_disbursement(Err(rejected(
        "2001",
        "The initiator information is invalid.",
    )));

    let (status, _, body) = send(
        h.router(None),
        post_json(
            "/api/settlements/payouts",
            &json!({"booking_id": 4, "owner_phone": OWNER_PHONE}),
        ),
    )
    .await;

    assert_eq!(status, StatusCode::BAD_GATEWAY);
    assert_eq!(body["status"], "GATEWAY_REJECTED");
    assert!(body["details"]["intent_id"].is_string());
}

#[tokio::test]
async fn settlement_status_reports_latest_attempts() {
    let h = Harness::new();
    h.insert(booking(5, BookingStatus::Pending, dec!(5000))).await;
    h.orchestrator.collect(5, GUEST_PHONE, None).await.unwrap();

    let request = Request::builder()
        .uri("/api/settlements/bookings/5")
        .body(Body::empty())
        .unwrap();
    let (status, _, body) = send(h.router(None), request).await;

    assert_eq!(status, StatusCode::OK);
    assert_eq!(body["success"], true);
    assert_eq!(body["booking_status"], "pending");
    assert_eq!(body["collection"]["state"], "awaiting_callback");
    assert!(body["owner_payout"].is_null());
    assert_eq!(body["history"].as_array().unwrap().len(), 1);
}

#[tokio::test]
async fn unknown_booking_is_not_found() {
    let h = Harness::new();
    let request = Request::builder()
        .uri("/api/settlements/bookings/404")
        .body(Body::empty())
        .unwrap();

    let (status, _, body) = send(h.router(None), request).await;
    assert_eq!(status, StatusCode::NOT_FOUND);
    assert_eq!(body["status"], "BOOKING_NOT_FOUND");
}

#[tokio::test]
async fn liveness_probe_answers() {
    let h = Harness::new();
    let request = Request::builder()
        .uri("/health/live")
        .body(Body::empty())
        .unwrap();

    let response = h.router(None).oneshot(request).await.unwrap();
    assert_eq!(response.status(), StatusCode::OK);
}
