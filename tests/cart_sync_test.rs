mod common;

use std::sync::Arc;

use axum::http::{Method, StatusCode};
use common::*;
use serde_json::json;
use storefront_api::{
    models::CartItem,
    services::cart_sync::{
        CartStore, CartSyncError, HttpRemoteCart, InMemoryCartCache, LocalCartCache, RemoteCart,
        ServiceRemoteCart,
    },
};

fn item(value: serde_json::Value) -> CartItem {
    serde_json::from_value(value).expect("cart item")
}

#[tokio::test]
async fn cart_endpoints_replace_merge_and_remove() {
    let app = TestApp::new().await;

    let (status, body) = app
        .as_user(
            SHOPPER,
            Method::PUT,
            "/api/v1/cart",
            Some(json!({ "items": [mug(1, "300")] })),
        )
        .await;
    assert_eq!(status, StatusCode::OK, "{body}");
    assert_eq!(body["data"]["version"], 1);

    // Adding the same line merges quantities
    let (_, body) = app
        .as_user(
            SHOPPER,
            Method::POST,
            "/api/v1/cart",
            Some(json!({ "item": mug(1, "300"), "quantity": 2 })),
        )
        .await;
    let items = body["data"]["items"].as_array().unwrap();
    assert_eq!(items.len(), 1);
    assert_eq!(items[0]["quantity"], 3);

    let (_, body) = app
        .as_user(
            SHOPPER,
            Method::POST,
            "/api/v1/cart",
            Some(json!({ "item": tee(1, "600") })),
        )
        .await;
    assert_eq!(body["data"]["items"].as_array().unwrap().len(), 2);

    // Quantity zero drops the line
    let (_, body) = app
        .as_user(
            SHOPPER,
            Method::PATCH,
            "/api/v1/cart/m1",
            Some(json!({ "quantity": 0 })),
        )
        .await;
    let items = body["data"]["items"].as_array().unwrap();
    assert_eq!(items.len(), 1);
    assert_eq!(items[0]["id"], "p1_Size:M|Color:Black");

    let (_, body) = app
        .as_user(SHOPPER, Method::DELETE, "/api/v1/cart/p1_Size:M%7CColor:Black", None)
        .await;
    assert!(body["data"]["items"].as_array().unwrap().is_empty());

    app.as_user(
        SHOPPER,
        Method::PUT,
        "/api/v1/cart",
        Some(json!({ "items": [mug(4, "300")] })),
    )
    .await;
    let (status, body) = app.as_user(SHOPPER, Method::DELETE, "/api/v1/cart", None).await;
    assert_eq!(status, StatusCode::OK);
    assert!(body["data"]["items"].as_array().unwrap().is_empty());
}

#[tokio::test]
async fn carts_are_private_to_each_identity() {
    let app = TestApp::new().await;
    app.as_user(
        SHOPPER,
        Method::PUT,
        "/api/v1/cart",
        Some(json!({ "items": [mug(2, "300")] })),
    )
    .await;

    let (_, body) = app.as_user(OTHER_SHOPPER, Method::GET, "/api/v1/cart", None).await;
    assert!(body["data"]["items"].as_array().unwrap().is_empty());

    let (status, _) = app.request(Method::GET, "/api/v1/cart", None, None).await;
    assert_eq!(status, StatusCode::UNAUTHORIZED);
}

#[tokio::test]
async fn login_replaces_stale_local_cart_with_durable_cart() {
    let app = TestApp::new().await;
    app.state
        .services
        .carts
        .replace(SHOPPER, vec![item(mug(2, "300"))])
        .await
        .expect("seed durable cart");

    let local = Arc::new(InMemoryCartCache::new());
    local.store(SHOPPER, &[item(tee(1, "600"))]).await;

    let store = CartStore::new(
        Arc::new(ServiceRemoteCart::new((*app.state.services.carts).clone())),
        local.clone(),
    );
    store.switch_identity(Some(SHOPPER.to_string())).await;

    let items = store.items().await;
    assert_eq!(items.len(), 1);
    assert_eq!(items[0].id, "m1");
    assert_eq!(items[0].quantity, 2);
    assert_eq!(local.load(SHOPPER).await.map(|i| i.len()), Some(1));

    // Mutations write through to the durable cart
    store.add(item(tee(1, "600")), 1).await;
    let durable = app.state.services.carts.get(SHOPPER).await.expect("cart");
    assert_eq!(durable.items.len(), 2);
    assert!(!store.sync_state().await.is_degraded());

    store.switch_identity(None).await;
    assert!(store.items().await.is_empty());
}

#[tokio::test]
async fn http_remote_cart_round_trips_through_the_cart_endpoints() {
    let app = TestApp::new().await;
    let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
    let base = format!("http://{}/", listener.local_addr().unwrap());
    let router = storefront_api::app_router(app.state.clone());
    tokio::spawn(async move {
        axum::serve(listener, router).await.unwrap();
    });

    let remote = HttpRemoteCart::new(base.clone(), token(SHOPPER, &[]));
    remote
        .save(SHOPPER, &[item(mug(3, "300"))])
        .await
        .expect("save over http");
    let durable = app.state.services.carts.get(SHOPPER).await.expect("cart");
    assert_eq!(durable.items.len(), 1);
    assert_eq!(durable.items[0].quantity, 3);

    let loaded = remote.load(SHOPPER).await.expect("load over http");
    assert_eq!(loaded.len(), 1);
    assert_eq!(loaded[0].id, "m1");

    let anonymous = HttpRemoteCart::new(base, "garbage");
    let err = anonymous.load(SHOPPER).await.unwrap_err();
    assert!(
        matches!(err, CartSyncError::Rejected { status: 401, .. }),
        "{err}"
    );
}
