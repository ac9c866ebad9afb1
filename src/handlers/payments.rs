use axum::{
    body::Bytes,
    extract::{Path, State},
    http::HeaderMap,
    Json,
};

use super::common::{ApiResponse, ApiResult};
use crate::{
    auth::AuthUser,
    services::{
        gateway::{RefundStatus, SIGNATURE_HEADER},
        payment_methods::PaymentMethodsView,
        payments::{InitiatePaymentInput, InitiatePaymentResponse, ReconcileResult, RefundInput},
    },
    AppState,
};

pub async fn initiate_payment(
    State(state): State<AppState>,
    user: AuthUser,
    Json(request): Json<InitiatePaymentInput>,
) -> ApiResult<InitiatePaymentResponse> {
    let response = state.services.payments.initiate(&user, request).await?;
    Ok(Json(ApiResponse::success(response)))
}

/// Gateway server-to-server callback. Unauthenticated; trust comes from the
/// body signature, so the raw bytes are taken before any JSON parsing.
pub async fn gateway_callback(
    State(state): State<AppState>,
    headers: HeaderMap,
    body: Bytes,
) -> ApiResult<ReconcileResult> {
    let signature = headers
        .get(SIGNATURE_HEADER)
        .and_then(|v| v.to_str().ok());
    let result = state
        .services
        .payments
        .handle_callback(&body, signature)
        .await?;
    Ok(Json(ApiResponse::success(result)))
}

pub async fn payment_status(
    State(state): State<AppState>,
    user: AuthUser,
    Path(merchant_transaction_id): Path<String>,
) -> ApiResult<ReconcileResult> {
    let result = state
        .services
        .payments
        .check_status(&user, &merchant_transaction_id)
        .await?;
    Ok(Json(ApiResponse::success(result)))
}

pub async fn refund_payment(
    State(state): State<AppState>,
    user: AuthUser,
    Json(request): Json<RefundInput>,
) -> ApiResult<RefundStatus> {
    let status = state.services.payments.refund(&user, request).await?;
    Ok(Json(ApiResponse::success(status)))
}

pub async fn refund_status(
    State(state): State<AppState>,
    user: AuthUser,
    Path(refund_id): Path<String>,
) -> ApiResult<RefundStatus> {
    let status = state
        .services
        .payments
        .check_refund_status(&user, &refund_id)
        .await?;
    Ok(Json(ApiResponse::success(status)))
}

/// Which payment methods checkout currently offers.
pub async fn payment_methods(
    State(state): State<AppState>,
    _user: AuthUser,
) -> ApiResult<PaymentMethodsView> {
    Ok(Json(ApiResponse::success(
        state.services.payment_methods.view(),
    )))
}
