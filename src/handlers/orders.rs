use axum::{
    extract::{Path, Query, State},
    http::StatusCode,
    Json,
};
use rust_decimal::Decimal;
use serde::Deserialize;
use uuid::Uuid;

use super::common::{ApiResponse, ApiResult, ListQuery, PaginatedResponse};
use crate::{
    auth::AuthUser,
    entities::PaymentMethod,
    errors::ServiceError,
    models::{CartItem, OrderView, ShippingInfo},
    services::orders::{CreateOrderInput, UpdateOrderInput},
    AppState,
};

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct CreateOrderRequest {
    #[serde(default)]
    pub items: Vec<CartItem>,
    pub shipping_info: ShippingInfo,
    #[serde(default)]
    pub payment_method: Option<PaymentMethod>,
    #[serde(default)]
    pub coupon_code: Option<String>,
    /// Total shown to the shopper; rejected when it differs from the server total
    #[serde(default, with = "rust_decimal::serde::float_option")]
    pub total: Option<Decimal>,
    #[serde(default)]
    pub merchant_transaction_id: Option<String>,
}

impl CreateOrderRequest {
    fn into_input(self, payment_method: PaymentMethod) -> CreateOrderInput {
        CreateOrderInput {
            items: self.items.into_iter().map(CartItem::normalized).collect(),
            shipping_info: self.shipping_info,
            payment_method,
            coupon_code: self.coupon_code,
            client_total: self.total,
            merchant_transaction_id: self.merchant_transaction_id,
        }
    }
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ValidateSuccessQuery {
    pub order_id: Uuid,
    pub transaction_id: String,
}

/// `POST /orders`. Defaults to cash on delivery.
pub async fn create_order(
    State(state): State<AppState>,
    user: AuthUser,
    Json(request): Json<CreateOrderRequest>,
) -> Result<(StatusCode, Json<ApiResponse<OrderView>>), ServiceError> {
    let method = request.payment_method.unwrap_or(PaymentMethod::Cod);
    let order = state
        .services
        .orders
        .create_order(&user.user_id, request.into_input(method))
        .await?;
    Ok((StatusCode::CREATED, Json(ApiResponse::success(order))))
}

/// `POST /orders/gateway`. Creates a pending order awaiting gateway payment.
pub async fn create_gateway_order(
    State(state): State<AppState>,
    user: AuthUser,
    Json(request): Json<CreateOrderRequest>,
) -> Result<(StatusCode, Json<ApiResponse<OrderView>>), ServiceError> {
    let order = state
        .services
        .orders
        .create_order(&user.user_id, request.into_input(PaymentMethod::Gateway))
        .await?;
    Ok((StatusCode::CREATED, Json(ApiResponse::success(order))))
}

pub async fn list_orders(
    State(state): State<AppState>,
    user: AuthUser,
    Query(query): Query<ListQuery>,
) -> ApiResult<PaginatedResponse<OrderView>> {
    let limit = query.limit.clamp(1, 100);
    let page = query.page.max(1);
    let (orders, total) = state
        .services
        .orders
        .list_orders(&user.user_id, page, limit)
        .await?;
    Ok(Json(ApiResponse::success(PaginatedResponse::new(
        orders, total, page, limit,
    ))))
}

pub async fn get_order(
    State(state): State<AppState>,
    user: AuthUser,
    Path(order_id): Path<Uuid>,
) -> ApiResult<OrderView> {
    let order = state.services.orders.get_order(&user, order_id).await?;
    Ok(Json(ApiResponse::success(order)))
}

pub async fn update_order(
    State(state): State<AppState>,
    user: AuthUser,
    Path(order_id): Path<Uuid>,
    Json(request): Json<UpdateOrderInput>,
) -> ApiResult<OrderView> {
    let order = state
        .services
        .orders
        .update_order(&user, order_id, request)
        .await?;
    Ok(Json(ApiResponse::success(order)))
}

/// Backs the post-payment landing page.
pub async fn validate_success(
    State(state): State<AppState>,
    user: AuthUser,
    Query(query): Query<ValidateSuccessQuery>,
) -> ApiResult<OrderView> {
    let order = state
        .services
        .payments
        .validate_success(&user, query.order_id, &query.transaction_id)
        .await?;
    Ok(Json(ApiResponse::success(order)))
}
