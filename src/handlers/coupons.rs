use axum::{extract::State, Json};
use serde::Deserialize;

use super::common::{ApiResponse, ApiResult};
use crate::{
    auth::AuthUser, models::CartItem, services::coupons::CouponValidation, AppState,
};

#[derive(Debug, Deserialize)]
pub struct ValidateCouponRequest {
    pub code: String,
    /// Cart lines to price against; the stored cart is used when omitted
    #[serde(default, alias = "cartItems")]
    pub items: Option<Vec<CartItem>>,
    /// Accepted for compatibility; the total is always recomputed from the lines.
    #[serde(default, rename = "cartTotal")]
    pub cart_total: Option<serde_json::Value>,
}

/// Rejections come back as `valid: false` with a 200, never as an error.
pub async fn validate_coupon(
    State(state): State<AppState>,
    user: AuthUser,
    Json(request): Json<ValidateCouponRequest>,
) -> ApiResult<CouponValidation> {
    let items = match request.items {
        Some(items) => items,
        None => state.services.carts.get(&user.user_id).await?.items,
    };
    let result = state
        .services
        .coupons
        .validate(&request.code, &items, &user.user_id)
        .await?;
    Ok(Json(ApiResponse::success(result)))
}
