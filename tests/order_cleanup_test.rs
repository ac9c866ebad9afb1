mod common;

use axum::http::{Method, StatusCode};
use chrono::{Duration, Utc};
use common::*;
use serde_json::json;
use storefront_api::{
    entities::{OrderStatus, PaymentStatus},
    services::order_cleanup::{cancel_expired_orders, SchedulerState, PAYMENT_TIMEOUT_REASON},
};
use uuid::Uuid;

async fn place(app: &TestApp, uri: &str) -> (Uuid, Option<String>) {
    let (status, body) = app
        .as_user(
            SHOPPER,
            Method::POST,
            uri,
            Some(json!({ "items": [tee(1, "600")], "shippingInfo": shipping_info() })),
        )
        .await;
    assert_eq!(status, StatusCode::CREATED, "{body}");
    let mtid = body["data"]["merchantTransactionId"]
        .as_str()
        .map(str::to_string);
    (order_id(&body), mtid)
}

#[tokio::test]
async fn sweep_cancels_only_expired_gateway_orders() {
    let app = TestApp::new().await;
    let (expired, _) = place(&app, "/api/v1/orders/gateway").await;
    let (recent, _) = place(&app, "/api/v1/orders/gateway").await;
    let (cod, _) = place(&app, "/api/v1/orders").await;
    app.backdate_order(expired, 31).await;
    app.backdate_order(recent, 10).await;
    app.backdate_order(cod, 120).await;

    let (status, body) = app
        .as_user(ADMIN, Method::POST, "/api/v1/admin/orders/cleanup", None)
        .await;
    assert_eq!(status, StatusCode::OK, "{body}");
    assert_eq!(body["data"]["success"], true);
    assert_eq!(body["data"]["cancelledCount"], 1);

    let cancelled = app.load_order(expired).await;
    assert_eq!(cancelled.status, OrderStatus::Cancelled);
    assert_eq!(
        cancelled.cancellation_reason.as_deref(),
        Some(PAYMENT_TIMEOUT_REASON)
    );
    assert!(cancelled.cancelled_at.is_some());

    assert_eq!(app.load_order(recent).await.status, OrderStatus::Pending);
    // Cash on delivery is confirmed at placement and never swept
    assert_eq!(app.load_order(cod).await.status, OrderStatus::Confirmed);

    let (_, body) = app
        .as_user(ADMIN, Method::POST, "/api/v1/admin/orders/cleanup", None)
        .await;
    assert_eq!(body["data"]["cancelledCount"], 0);
}

#[tokio::test]
async fn flagged_orders_wait_for_review() {
    let app = TestApp::new().await;
    let (id, mtid) = place(&app, "/api/v1/orders/gateway").await;
    let mtid = mtid.expect("gateway order has a transaction id");
    let (_, body) = app
        .callback(
            &json!({ "merchantTransactionId": mtid, "state": "SUCCESS", "amountMinor": 1 }),
            None,
        )
        .await;
    assert_eq!(body["data"]["outcome"], "flagged");
    app.backdate_order(id, 90).await;

    let cancelled = cancel_expired_orders(&app.state.db, Utc::now() - Duration::minutes(30))
        .await
        .expect("sweep");
    assert_eq!(cancelled, 0);
    let order = app.load_order(id).await;
    assert_eq!(order.status, OrderStatus::Pending);
    assert_eq!(order.payment_status, PaymentStatus::Flagged);
}

#[tokio::test]
async fn late_success_after_sweep_is_orphaned() {
    let app = TestApp::new().await;
    let (id, mtid) = place(&app, "/api/v1/orders/gateway").await;
    let mtid = mtid.expect("gateway order has a transaction id");
    app.backdate_order(id, 45).await;

    let report = app.state.services.cleanup.run_now().await;
    assert_eq!(report.cancelled_count, 1);

    let (status, body) = app
        .callback(
            &json!({ "merchantTransactionId": mtid, "state": "SUCCESS", "amountMinor": 69_900 }),
            None,
        )
        .await;
    assert_eq!(status, StatusCode::OK, "{body}");
    assert_eq!(body["data"]["outcome"], "orphaned");
    assert_eq!(body["data"]["transactionStatus"], "success");
    assert_eq!(body["data"]["orderStatus"], "cancelled");
    assert_eq!(app.load_order(id).await.status, OrderStatus::Cancelled);
}

#[tokio::test]
async fn scheduler_start_and_stop_are_idempotent() {
    let app = TestApp::with_config(|cfg| cfg.cleanup.grace_delay_secs = 3600).await;
    let scheduler = &app.state.services.cleanup;

    assert!(!scheduler.is_running());
    assert!(scheduler.start());
    assert!(!scheduler.start());
    assert_eq!(scheduler.status().state, SchedulerState::Running);

    let (status, body) = app
        .as_user(ADMIN, Method::GET, "/api/v1/admin/orders/cleanup", None)
        .await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(body["data"]["state"], "running");
    assert_eq!(body["data"]["pendingTimeoutSecs"], 1800);

    assert!(scheduler.stop());
    assert!(!scheduler.stop());
    assert_eq!(scheduler.status().state, SchedulerState::Stopped);

    // Restartable after a stop
    assert!(scheduler.start());
    assert!(scheduler.stop());
}

#[tokio::test]
async fn status_records_the_last_manual_sweep() {
    let app = TestApp::new().await;
    assert!(app.state.services.cleanup.status().last_sweep_at.is_none());

    app.state.services.cleanup.run_now().await;
    let status = app.state.services.cleanup.status();
    assert!(status.last_sweep_at.is_some());
    assert_eq!(status.last_report.map(|r| r.success), Some(true));
}

#[tokio::test]
async fn cleanup_endpoints_require_admin() {
    let app = TestApp::new().await;
    let (status, _) = app
        .as_user(SHOPPER, Method::POST, "/api/v1/admin/orders/cleanup", None)
        .await;
    assert_eq!(status, StatusCode::FORBIDDEN);
    let (status, _) = app
        .request(Method::GET, "/api/v1/admin/orders/cleanup", None, None)
        .await;
    assert_eq!(status, StatusCode::UNAUTHORIZED);
}
