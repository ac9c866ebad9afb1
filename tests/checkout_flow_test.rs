mod common;

use axum::http::{Method, StatusCode};
use common::*;
use serde_json::json;

fn assert_total_invariant(order: &serde_json::Value) {
    let subtotal = order["subtotal"].as_f64().unwrap();
    let discount = order["couponDiscount"].as_f64().unwrap();
    let shipping = order["shippingCost"].as_f64().unwrap();
    let total = order["total"].as_f64().unwrap();
    assert!((total - (subtotal - discount + shipping)).abs() < 1e-9);
    assert!(total >= 0.0);
}

#[tokio::test]
async fn cod_checkout_confirms_with_free_shipping() {
    let app = TestApp::new().await;
    let items = json!([tee(2, "₹500")]);

    let (status, _) = app
        .as_user(SHOPPER, Method::PUT, "/api/v1/cart", Some(json!({ "items": items })))
        .await;
    assert_eq!(status, StatusCode::OK);

    let (status, body) = app
        .as_user(
            SHOPPER,
            Method::POST,
            "/api/v1/orders",
            Some(json!({
                "items": items,
                "shippingInfo": shipping_info(),
                "paymentMethod": "COD"
            })),
        )
        .await;
    assert_eq!(status, StatusCode::CREATED, "{body}");
    let order = &body["data"];
    assert_eq!(order["status"], "confirmed");
    assert_eq!(order["paymentStatus"], "cod_pending");
    assert_eq!(order["subtotal"], 1000.0);
    assert_eq!(order["shippingCost"], 0.0);
    assert_eq!(order["total"], 1000.0);
    assert!(order["orderNumber"].as_str().unwrap().starts_with("ORD-"));
    assert_eq!(order["items"][0]["size"], "M");
    assert_eq!(order["items"][0]["color"], "Black");
    assert_total_invariant(order);

    // Checkout leaves the cart alone
    let (_, cart) = app.as_user(SHOPPER, Method::GET, "/api/v1/cart", None).await;
    assert_eq!(cart["data"]["items"].as_array().unwrap().len(), 1);
}

#[tokio::test]
async fn flat_fee_applies_below_threshold() {
    let app = TestApp::new().await;
    let (status, body) = app
        .as_user(
            SHOPPER,
            Method::POST,
            "/api/v1/orders",
            Some(json!({ "items": [mug(1, "200")], "shippingInfo": shipping_info() })),
        )
        .await;
    assert_eq!(status, StatusCode::CREATED, "{body}");
    assert_eq!(body["data"]["shippingCost"], 99.0);
    assert_eq!(body["data"]["total"], 299.0);
    assert_total_invariant(&body["data"]);
}

#[tokio::test]
async fn insufficient_stock_rejects_without_writing() {
    let app = TestApp::new().await;
    let (status, body) = app
        .as_user(
            SHOPPER,
            Method::POST,
            "/api/v1/orders",
            Some(json!({ "items": [tee(5, "500")], "shippingInfo": shipping_info() })),
        )
        .await;
    assert_eq!(status, StatusCode::UNPROCESSABLE_ENTITY);
    assert_eq!(body["code"], "insufficient_stock");
    assert!(body["message"].as_str().unwrap().contains("Only 3 left"));
    assert_eq!(app.order_count().await, 0);
}

#[tokio::test]
async fn same_variant_across_lines_is_summed() {
    let app = TestApp::new().await;
    let mut second = tee(2, "500");
    second["id"] = json!("p1_Color:Black|Size:M|gift");
    let (status, body) = app
        .as_user(
            SHOPPER,
            Method::POST,
            "/api/v1/orders",
            Some(json!({ "items": [tee(2, "500"), second], "shippingInfo": shipping_info() })),
        )
        .await;
    assert_eq!(status, StatusCode::UNPROCESSABLE_ENTITY, "{body}");
    assert_eq!(app.order_count().await, 0);
}

#[tokio::test]
async fn variant_absent_from_stock_data_is_out_of_stock() {
    let app = TestApp::new().await;
    let mut unlisted = tee(50, "500");
    unlisted["id"] = json!("p1_Size:XL|Color:Green");
    unlisted["variants"] = json!({ "Size": "XL", "Color": "Green" });

    let (status, body) = app
        .as_user(
            SHOPPER,
            Method::POST,
            "/api/v1/orders",
            Some(json!({ "items": [unlisted], "shippingInfo": shipping_info() })),
        )
        .await;
    assert_eq!(status, StatusCode::UNPROCESSABLE_ENTITY, "{body}");
    assert_eq!(body["code"], "insufficient_stock");
    assert!(body["message"].as_str().unwrap().contains("XL-Green"));
    assert_eq!(app.order_count().await, 0);
}

#[tokio::test]
async fn oversized_price_or_quantity_is_a_field_error() {
    let app = TestApp::new().await;
    let (status, body) = app
        .as_user(
            SHOPPER,
            Method::POST,
            "/api/v1/orders",
            Some(json!({
                "items": [mug(2, "79228162514264337593543950335")],
                "shippingInfo": shipping_info()
            })),
        )
        .await;
    assert_eq!(status, StatusCode::BAD_REQUEST, "{body}");
    assert_eq!(body["code"], "validation_error");
    assert!(body["details"]["items[0].price"].is_array());

    let (status, body) = app
        .as_user(
            SHOPPER,
            Method::POST,
            "/api/v1/orders/gateway",
            Some(json!({ "items": [mug(4_000_000_000, "100")], "shippingInfo": shipping_info() })),
        )
        .await;
    assert_eq!(status, StatusCode::BAD_REQUEST, "{body}");
    assert!(body["details"]["items[0].quantity"].is_array());
    assert_eq!(app.order_count().await, 0);
}

#[tokio::test]
async fn missing_stock_snapshot_fails_closed_for_variants_only() {
    let app = TestApp::new().await;
    app.stock.replace(None).await;

    let (status, body) = app
        .as_user(
            SHOPPER,
            Method::POST,
            "/api/v1/orders",
            Some(json!({ "items": [tee(1, "500")], "shippingInfo": shipping_info() })),
        )
        .await;
    assert_eq!(status, StatusCode::BAD_GATEWAY);
    assert_eq!(body["code"], "external_service_error");

    let (status, _) = app
        .as_user(
            SHOPPER,
            Method::POST,
            "/api/v1/orders",
            Some(json!({ "items": [mug(1, "250")], "shippingInfo": shipping_info() })),
        )
        .await;
    assert_eq!(status, StatusCode::CREATED);
    assert_eq!(app.order_count().await, 1);
}

#[tokio::test]
async fn blank_shipping_fields_are_reported_per_field() {
    let app = TestApp::new().await;
    let mut info = shipping_info();
    info["fullName"] = json!("  ");
    info["email"] = json!("not-an-email");

    let (status, body) = app
        .as_user(
            SHOPPER,
            Method::POST,
            "/api/v1/orders",
            Some(json!({ "items": [], "shippingInfo": info })),
        )
        .await;
    assert_eq!(status, StatusCode::BAD_REQUEST);
    assert_eq!(body["code"], "validation_error");
    let details = &body["details"];
    assert!(details["shippingInfo.fullName"].is_array());
    assert!(details["shippingInfo.email"].is_array());
    assert!(details["items"].is_array());
    assert_eq!(app.order_count().await, 0);
}

#[tokio::test]
async fn zero_quantity_line_is_rejected() {
    let app = TestApp::new().await;
    let (status, body) = app
        .as_user(
            SHOPPER,
            Method::POST,
            "/api/v1/orders",
            Some(json!({ "items": [mug(0, "100")], "shippingInfo": shipping_info() })),
        )
        .await;
    assert_eq!(status, StatusCode::BAD_REQUEST);
    assert!(body["details"]["items[0].quantity"].is_array());
}

#[tokio::test]
async fn stale_client_total_is_rejected() {
    let app = TestApp::new().await;
    let (status, body) = app
        .as_user(
            SHOPPER,
            Method::POST,
            "/api/v1/orders",
            Some(json!({
                "items": [mug(1, "200")],
                "shippingInfo": shipping_info(),
                "total": 200.0
            })),
        )
        .await;
    assert_eq!(status, StatusCode::CONFLICT);
    assert_eq!(body["code"], "conflict");
    assert_eq!(app.order_count().await, 0);

    let (status, _) = app
        .as_user(
            SHOPPER,
            Method::POST,
            "/api/v1/orders",
            Some(json!({
                "items": [mug(1, "200")],
                "shippingInfo": shipping_info(),
                "total": 299.0
            })),
        )
        .await;
    assert_eq!(status, StatusCode::CREATED);
}

#[tokio::test]
async fn coupon_discount_is_recomputed_on_the_server() {
    let app = TestApp::new().await;
    let mut flat = coupon("FLAT100");
    flat.discount_amount_minor = Some(10_000);
    app.seed_coupon(flat).await;

    let (status, body) = app
        .as_user(
            SHOPPER,
            Method::POST,
            "/api/v1/orders",
            Some(json!({
                "items": [tee(2, "500")],
                "shippingInfo": shipping_info(),
                "couponCode": "flat100",
                "couponDiscount": 900
            })),
        )
        .await;
    assert_eq!(status, StatusCode::CREATED, "{body}");
    assert_eq!(body["data"]["couponCode"], "FLAT100");
    assert_eq!(body["data"]["couponDiscount"], 100.0);
    assert_eq!(body["data"]["total"], 900.0);
    assert_total_invariant(&body["data"]);
}

#[tokio::test]
async fn rejected_coupon_blocks_checkout() {
    let app = TestApp::new().await;
    let (status, body) = app
        .as_user(
            SHOPPER,
            Method::POST,
            "/api/v1/orders",
            Some(json!({
                "items": [mug(1, "200")],
                "shippingInfo": shipping_info(),
                "couponCode": "NOPE"
            })),
        )
        .await;
    assert_eq!(status, StatusCode::UNPROCESSABLE_ENTITY);
    assert_eq!(body["code"], "coupon_rejected");
    assert_eq!(app.order_count().await, 0);
}

#[tokio::test]
async fn disabled_method_is_refused() {
    let app = TestApp::new().await;
    let (status, body) = app
        .as_user(
            ADMIN,
            Method::PUT,
            "/api/v1/admin/payment-methods",
            Some(json!({ "method": "COD", "enabled": false })),
        )
        .await;
    assert_eq!(status, StatusCode::OK, "{body}");
    assert_eq!(body["data"]["cod"], false);

    let (_, methods) = app
        .as_user(SHOPPER, Method::GET, "/api/v1/payment-methods", None)
        .await;
    assert_eq!(methods["data"], json!({ "cod": false, "gateway": true }));

    let (status, body) = app
        .as_user(
            SHOPPER,
            Method::POST,
            "/api/v1/orders",
            Some(json!({ "items": [mug(1, "200")], "shippingInfo": shipping_info() })),
        )
        .await;
    assert_eq!(status, StatusCode::CONFLICT);
    assert_eq!(body["code"], "payment_method_disabled");
    assert_eq!(app.order_count().await, 0);
}

#[tokio::test]
async fn gateway_checkout_needs_gateway_credentials() {
    let app = TestApp::with_gateway(MockGateway {
        unconfigured: true,
        ..MockGateway::default()
    })
    .await;

    let (_, methods) = app
        .as_user(SHOPPER, Method::GET, "/api/v1/payment-methods", None)
        .await;
    assert_eq!(methods["data"], json!({ "cod": true, "gateway": false }));

    let (status, body) = app
        .as_user(
            SHOPPER,
            Method::POST,
            "/api/v1/orders/gateway",
            Some(json!({ "items": [mug(1, "200")], "shippingInfo": shipping_info() })),
        )
        .await;
    assert_eq!(status, StatusCode::SERVICE_UNAVAILABLE, "{body}");
    assert_eq!(body["code"], "gateway_not_configured");
    assert_eq!(app.order_count().await, 0);

    // Cash on delivery is unaffected
    let (status, _) = app
        .as_user(
            SHOPPER,
            Method::POST,
            "/api/v1/orders",
            Some(json!({ "items": [mug(1, "200")], "shippingInfo": shipping_info() })),
        )
        .await;
    assert_eq!(status, StatusCode::CREATED);
}

#[tokio::test]
async fn anonymous_calls_are_rejected() {
    let app = TestApp::new().await;
    let (status, body) = app.request(Method::GET, "/api/v1/orders", None, None).await;
    assert_eq!(status, StatusCode::UNAUTHORIZED);
    assert_eq!(body["code"], "unauthorized");

    let (status, _) = app
        .request(Method::GET, "/api/v1/cart", None, Some("garbage"))
        .await;
    assert_eq!(status, StatusCode::UNAUTHORIZED);
}

#[tokio::test]
async fn orders_are_private_to_their_owner() {
    let app = TestApp::new().await;
    let (_, first) = app
        .as_user(
            SHOPPER,
            Method::POST,
            "/api/v1/orders",
            Some(json!({ "items": [mug(1, "200")], "shippingInfo": shipping_info() })),
        )
        .await;
    let (_, second) = app
        .as_user(
            SHOPPER,
            Method::POST,
            "/api/v1/orders",
            Some(json!({ "items": [mug(2, "200")], "shippingInfo": shipping_info() })),
        )
        .await;
    let first_id = order_id(&first);

    let (status, list) = app
        .as_user(SHOPPER, Method::GET, "/api/v1/orders?page=1&limit=10", None)
        .await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(list["data"]["total"], 2);
    assert_eq!(list["data"]["items"][0]["orderId"], second["data"]["orderId"]);

    let (status, _) = app
        .as_user(OTHER_SHOPPER, Method::GET, &format!("/api/v1/orders/{first_id}"), None)
        .await;
    assert_eq!(status, StatusCode::NOT_FOUND);

    let (status, _) = app
        .as_user(ADMIN, Method::GET, &format!("/api/v1/orders/{first_id}"), None)
        .await;
    assert_eq!(status, StatusCode::OK);
}

#[tokio::test]
async fn status_changes_follow_the_state_machine() {
    let app = TestApp::new().await;
    let (_, created) = app
        .as_user(
            SHOPPER,
            Method::POST,
            "/api/v1/orders",
            Some(json!({ "items": [mug(1, "200")], "shippingInfo": shipping_info() })),
        )
        .await;
    let uri = format!("/api/v1/orders/{}", order_id(&created));

    let (status, _) = app
        .as_user(SHOPPER, Method::PATCH, &uri, Some(json!({ "status": "shipped" })))
        .await;
    assert_eq!(status, StatusCode::FORBIDDEN);

    let (status, body) = app
        .as_user(
            ADMIN,
            Method::PATCH,
            &uri,
            Some(json!({ "status": "shipped", "trackingNumber": "TRK-1" })),
        )
        .await;
    assert_eq!(status, StatusCode::OK, "{body}");
    assert_eq!(body["data"]["status"], "shipped");
    assert_eq!(body["data"]["trackingNumber"], "TRK-1");

    let (status, body) = app
        .as_user(ADMIN, Method::PATCH, &uri, Some(json!({ "status": "delivered" })))
        .await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(body["data"]["paymentStatus"], "paid");

    let (status, body) = app
        .as_user(ADMIN, Method::PATCH, &uri, Some(json!({ "status": "cancelled" })))
        .await;
    assert_eq!(status, StatusCode::BAD_REQUEST);
    assert_eq!(body["code"], "invalid_status_transition");
}

#[tokio::test]
async fn shopper_may_cancel_own_confirmed_order() {
    let app = TestApp::new().await;
    let (_, created) = app
        .as_user(
            SHOPPER,
            Method::POST,
            "/api/v1/orders",
            Some(json!({ "items": [mug(1, "200")], "shippingInfo": shipping_info() })),
        )
        .await;
    let id = order_id(&created);

    let (status, body) = app
        .as_user(
            SHOPPER,
            Method::PATCH,
            &format!("/api/v1/orders/{id}"),
            Some(json!({ "status": "cancelled", "notes": "changed my mind" })),
        )
        .await;
    assert_eq!(status, StatusCode::OK, "{body}");
    assert_eq!(body["data"]["status"], "cancelled");
    assert_eq!(body["data"]["notes"], "changed my mind");
    let stored = app.load_order(id).await;
    assert_eq!(stored.cancellation_reason.as_deref(), Some("cancelled_by_customer"));
    assert!(stored.cancelled_at.is_some());
}

#[tokio::test]
async fn stock_data_is_reexposed() {
    let app = TestApp::new().await;
    let (status, body) = app
        .as_user(SHOPPER, Method::GET, "/api/v1/stock-data", None)
        .await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(body["data"]["types"]["tees"]["stock"]["M-Black"]["quantity"], 3);
    assert_eq!(body["data"]["entries"].as_array().unwrap().len(), 2);
}

#[tokio::test]
async fn health_is_public() {
    let app = TestApp::new().await;
    let (status, body) = app.request(Method::GET, "/api/v1/health", None, None).await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(body["status"], "up");

    let (status, body) = app
        .request(Method::GET, "/api/v1/health/detailed", None, None)
        .await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(body["details"]["database"]["status"], "up");
    assert_eq!(body["details"]["payment_gateway"]["status"], "up");
}
