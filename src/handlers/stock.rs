use axum::{extract::State, Json};
use serde::Serialize;

use super::common::{ApiResponse, ApiResult};
use crate::{
    auth::AuthUser,
    errors::ServiceError,
    models::{StockEntry, StockSnapshot},
    AppState,
};

#[derive(Debug, Serialize)]
pub struct StockDataResponse {
    #[serde(flatten)]
    pub snapshot: StockSnapshot,
    pub entries: Vec<StockEntry>,
}

/// Re-exposes the current stock snapshot. A missing snapshot is a 502 so the
/// storefront can tell "no data" apart from "out of stock".
pub async fn get_stock_data(
    State(state): State<AppState>,
    _user: AuthUser,
) -> ApiResult<StockDataResponse> {
    let snapshot = state
        .services
        .stock
        .fetch_snapshot()
        .await
        .ok_or_else(|| ServiceError::ExternalServiceError("stock data is unavailable".into()))?;
    let entries = snapshot.entries();
    Ok(Json(ApiResponse::success(StockDataResponse {
        snapshot,
        entries,
    })))
}
