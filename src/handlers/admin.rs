use axum::{extract::State, Json};
use serde::Deserialize;
use tracing::info;

use super::common::{ApiResponse, ApiResult};
use crate::{
    auth::AuthUser,
    entities::PaymentMethod,
    services::{
        order_cleanup::{SchedulerStatus, SweepReport},
        payment_methods::{store_setting, PaymentMethodsView},
    },
    AppState,
};

#[derive(Debug, Deserialize)]
pub struct PaymentMethodToggle {
    pub method: PaymentMethod,
    pub enabled: bool,
}

/// Manual sweep; waits for any sweep already running.
pub async fn run_cleanup(State(state): State<AppState>, user: AuthUser) -> ApiResult<SweepReport> {
    user.require_admin()?;
    let report = state.services.cleanup.run_now().await;
    info!(
        user_id = %user.user_id,
        cancelled = report.cancelled_count,
        "manual order cleanup"
    );
    Ok(Json(ApiResponse::success(report)))
}

pub async fn cleanup_status(
    State(state): State<AppState>,
    user: AuthUser,
) -> ApiResult<SchedulerStatus> {
    user.require_admin()?;
    Ok(Json(ApiResponse::success(state.services.cleanup.status())))
}

/// Persists a toggle and applies it locally right away; other instances pick
/// it up on their next refresh.
pub async fn set_payment_method(
    State(state): State<AppState>,
    user: AuthUser,
    Json(request): Json<PaymentMethodToggle>,
) -> ApiResult<PaymentMethodsView> {
    user.require_admin()?;
    store_setting(&state.db, request.method, request.enabled).await?;
    state
        .services
        .payment_methods
        .set(request.method, request.enabled);
    info!(method = %request.method, enabled = request.enabled, "payment method toggled");
    Ok(Json(ApiResponse::success(
        state.services.payment_methods.view(),
    )))
}
