use axum::{
    extract::{Path, State},
    Json,
};
use serde::Deserialize;

use super::common::{ApiResponse, ApiResult};
use crate::{auth::AuthUser, models::CartItem, services::carts::CartDocument, AppState};

#[derive(Debug, Deserialize)]
pub struct ReplaceCartRequest {
    #[serde(default)]
    pub items: Vec<CartItem>,
}

#[derive(Debug, Deserialize)]
pub struct AddCartItemRequest {
    pub item: CartItem,
    /// Overrides `item.quantity` when present
    #[serde(default)]
    pub quantity: Option<i64>,
}

#[derive(Debug, Deserialize)]
pub struct UpdateCartItemRequest {
    pub quantity: i64,
}

pub async fn get_cart(State(state): State<AppState>, user: AuthUser) -> ApiResult<CartDocument> {
    let cart = state.services.carts.get(&user.user_id).await?;
    Ok(Json(ApiResponse::success(cart)))
}

/// Whole-cart replace; the submitted items become the durable cart.
pub async fn replace_cart(
    State(state): State<AppState>,
    user: AuthUser,
    Json(request): Json<ReplaceCartRequest>,
) -> ApiResult<CartDocument> {
    let cart = state
        .services
        .carts
        .replace(&user.user_id, request.items)
        .await?;
    Ok(Json(ApiResponse::success(cart)))
}

pub async fn add_item(
    State(state): State<AppState>,
    user: AuthUser,
    Json(request): Json<AddCartItemRequest>,
) -> ApiResult<CartDocument> {
    let quantity = request
        .quantity
        .unwrap_or_else(|| i64::from(request.item.quantity));
    let cart = state
        .services
        .carts
        .add(&user.user_id, request.item, quantity)
        .await?;
    Ok(Json(ApiResponse::success(cart)))
}

pub async fn update_item(
    State(state): State<AppState>,
    user: AuthUser,
    Path(item_id): Path<String>,
    Json(request): Json<UpdateCartItemRequest>,
) -> ApiResult<CartDocument> {
    let cart = state
        .services
        .carts
        .set_quantity(&user.user_id, &item_id, request.quantity)
        .await?;
    Ok(Json(ApiResponse::success(cart)))
}

pub async fn remove_item(
    State(state): State<AppState>,
    user: AuthUser,
    Path(item_id): Path<String>,
) -> ApiResult<CartDocument> {
    let cart = state.services.carts.remove(&user.user_id, &item_id).await?;
    Ok(Json(ApiResponse::success(cart)))
}

pub async fn clear_cart(State(state): State<AppState>, user: AuthUser) -> ApiResult<CartDocument> {
    let cart = state.services.carts.clear(&user.user_id).await?;
    Ok(Json(ApiResponse::success(cart)))
}
