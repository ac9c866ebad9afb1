//! Storefront API Library
//!
//! Cart, checkout, order lifecycle and payment reconciliation for a retail
//! storefront.
#![forbid(unsafe_code)]
#![deny(rust_2018_idioms)]
#![allow(elided_lifetimes_in_paths)]
#![warn(clippy::all, clippy::perf, clippy::dbg_macro)]

// Core modules
pub mod auth;
pub mod config;
pub mod db;
pub mod entities;
pub mod errors;
pub mod events;
pub mod handlers;
pub mod middleware_helpers;
pub mod migrator;
pub mod models;
pub mod services;

use axum::{
    extract::FromRef,
    routing::{get, patch, post},
    Router,
};
use sea_orm::DatabaseConnection;
use std::sync::Arc;
use std::time::Duration;
use tower_http::{timeout::TimeoutLayer, trace::TraceLayer};

use crate::auth::JwtVerifier;
use crate::middleware_helpers::{request_id_middleware, RequestSpanMaker};

pub use handlers::common::{ApiResponse, ApiResult, ListQuery, PaginatedResponse};

const REQUEST_TIMEOUT: Duration = Duration::from_secs(30);

// App state definition
#[derive(Clone)]
pub struct AppState {
    pub db: Arc<DatabaseConnection>,
    pub config: Arc<config::AppConfig>,
    pub event_sender: Arc<events::EventSender>,
    pub verifier: Arc<JwtVerifier>,
    pub services: handlers::AppServices,
}

impl FromRef<AppState> for Arc<JwtVerifier> {
    fn from_ref(state: &AppState) -> Self {
        state.verifier.clone()
    }
}

/// Every route under `/api/v1`. All handlers except the gateway callback and
/// health take an [`auth::AuthUser`], so they reject anonymous calls.
pub fn api_v1_routes() -> Router<AppState> {
    let cart = Router::new()
        .route(
            "/cart",
            get(handlers::carts::get_cart)
                .put(handlers::carts::replace_cart)
                .post(handlers::carts::add_item)
                .delete(handlers::carts::clear_cart),
        )
        .route(
            "/cart/:id",
            patch(handlers::carts::update_item).delete(handlers::carts::remove_item),
        );

    let catalog = Router::new()
        .route("/coupons/validate", post(handlers::coupons::validate_coupon))
        .route("/stock-data", get(handlers::stock::get_stock_data))
        .route("/payment-methods", get(handlers::payments::payment_methods));

    let orders = Router::new()
        .route(
            "/orders",
            get(handlers::orders::list_orders).post(handlers::orders::create_order),
        )
        .route("/orders/gateway", post(handlers::orders::create_gateway_order))
        .route(
            "/orders/success/validate",
            get(handlers::orders::validate_success),
        )
        .route(
            "/orders/:id",
            get(handlers::orders::get_order).patch(handlers::orders::update_order),
        );

    let payments = Router::new()
        .route("/initiate", post(handlers::payments::initiate_payment))
        // Signature-verified instead of bearer-authenticated
        .route("/callback", post(handlers::payments::gateway_callback))
        .route(
            "/status/:merchant_transaction_id",
            get(handlers::payments::payment_status),
        )
        .route("/refund", post(handlers::payments::refund_payment))
        .route("/refund/:refund_id", get(handlers::payments::refund_status));

    let admin = Router::new()
        .route(
            "/orders/cleanup",
            get(handlers::admin::cleanup_status).post(handlers::admin::run_cleanup),
        )
        .route(
            "/payment-methods",
            axum::routing::put(handlers::admin::set_payment_method),
        );

    Router::new()
        .merge(cart)
        .merge(catalog)
        .merge(orders)
        .nest("/payments/gateway", payments)
        .nest("/admin", admin)
        .nest("/health", handlers::health::health_routes())
}

/// Full application router with request ids, tracing and timeouts applied.
/// CORS is left to the binary since it depends on deployment.
pub fn app_router(state: AppState) -> Router {
    Router::new()
        .nest("/api/v1", api_v1_routes())
        .layer(TimeoutLayer::new(REQUEST_TIMEOUT))
        .layer(TraceLayer::new_for_http().make_span_with(RequestSpanMaker))
        // Outermost so the id exists before the trace span is made
        .layer(axum::middleware::from_fn(request_id_middleware))
        .with_state(state)
}
