use axum::{
    extract::State,
    http::StatusCode,
    response::{IntoResponse, Json},
    routing::get,
    Router,
};
use serde::{Deserialize, Serialize};
use serde_json::json;
use std::time::Instant;

use crate::{handlers::AppState, services::order_cleanup::SchedulerState};

/// Component health status
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ComponentStatus {
    Up,
    Down,
    Degraded,
}

/// Individual component health details
#[derive(Debug, Clone, Serialize)]
pub struct ComponentHealth {
    pub status: ComponentStatus,
    pub message: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub latency_ms: Option<u64>,
}

/// Full health check response
#[derive(Debug, Clone, Serialize)]
pub struct HealthResponse {
    pub status: ComponentStatus,
    pub version: String,
    pub timestamp: String,
    pub uptime_secs: u64,
    pub details: HealthDetails,
    pub response_time_ms: u128,
}

#[derive(Debug, Clone, Serialize)]
pub struct HealthDetails {
    pub database: ComponentHealth,
    pub payment_gateway: ComponentHealth,
    pub stock_data: ComponentHealth,
    pub order_cleanup: ComponentHealth,
}

/// Tracks application start time for uptime calculation
static START_TIME: std::sync::OnceLock<Instant> = std::sync::OnceLock::new();

/// Initialize the start time (call this on application startup)
pub fn init_start_time() {
    let _ = START_TIME.get_or_init(Instant::now);
}

fn get_uptime_secs() -> u64 {
    START_TIME.get().map(|t| t.elapsed().as_secs()).unwrap_or(0)
}

/// Liveness probe
async fn liveness_check() -> impl IntoResponse {
    Json(json!({
        "status": "up",
        "version": env!("CARGO_PKG_VERSION"),
        "timestamp": chrono::Utc::now().to_rfc3339()
    }))
}

/// Readiness probe: database only
async fn readiness_check(State(state): State<AppState>) -> impl IntoResponse {
    let start = Instant::now();
    match crate::db::check_connection(&state.db).await {
        Ok(()) => (
            StatusCode::OK,
            Json(json!({
                "status": "ready",
                "checks": { "database": { "status": "up" } },
                "response_time_ms": start.elapsed().as_millis()
            })),
        ),
        Err(e) => (
            StatusCode::SERVICE_UNAVAILABLE,
            Json(json!({
                "status": "not_ready",
                "checks": { "database": { "status": "down", "error": e.to_string() } },
                "response_time_ms": start.elapsed().as_millis()
            })),
        ),
    }
}

/// Database is critical; gateway demo mode, missing stock data and a stopped
/// sweep only degrade.
async fn detailed_health_check(State(state): State<AppState>) -> impl IntoResponse {
    let start = Instant::now();

    let db_start = Instant::now();
    let db_result = crate::db::check_connection(&state.db).await;
    let database = ComponentHealth {
        status: if db_result.is_ok() {
            ComponentStatus::Up
        } else {
            ComponentStatus::Down
        },
        message: db_result.map_or_else(
            |e| format!("Connection failed: {}", e),
            |_| "Connection successful".to_string(),
        ),
        latency_ms: Some(db_start.elapsed().as_millis() as u64),
    };

    let payment_gateway = if state.services.payments.is_gateway_configured() {
        ComponentHealth {
            status: ComponentStatus::Up,
            message: "Gateway configured".to_string(),
            latency_ms: None,
        }
    } else {
        ComponentHealth {
            status: ComponentStatus::Degraded,
            message: "Gateway not configured; demo mode".to_string(),
            latency_ms: None,
        }
    };

    let stock_start = Instant::now();
    let stock_available = state.services.stock.fetch_snapshot().await.is_some();
    let stock_data = ComponentHealth {
        status: if stock_available {
            ComponentStatus::Up
        } else {
            ComponentStatus::Degraded
        },
        message: if stock_available {
            "Snapshot available".to_string()
        } else {
            "No stock snapshot; variant checkouts are rejected".to_string()
        },
        latency_ms: Some(stock_start.elapsed().as_millis() as u64),
    };

    let cleanup = state.services.cleanup.status();
    let order_cleanup = ComponentHealth {
        status: match cleanup.state {
            SchedulerState::Running => ComponentStatus::Up,
            SchedulerState::Stopped => ComponentStatus::Degraded,
        },
        message: format!("Scheduler {:?}", cleanup.state).to_lowercase(),
        latency_ms: None,
    };

    let overall = if database.status == ComponentStatus::Down {
        ComponentStatus::Down
    } else if [&payment_gateway, &stock_data, &order_cleanup]
        .iter()
        .all(|c| c.status == ComponentStatus::Up)
    {
        ComponentStatus::Up
    } else {
        ComponentStatus::Degraded
    };
    let status_code = match overall {
        ComponentStatus::Down => StatusCode::SERVICE_UNAVAILABLE,
        _ => StatusCode::OK,
    };

    let response = HealthResponse {
        status: overall,
        version: env!("CARGO_PKG_VERSION").to_string(),
        timestamp: chrono::Utc::now().to_rfc3339(),
        uptime_secs: get_uptime_secs(),
        details: HealthDetails {
            database,
            payment_gateway,
            stock_data,
            order_cleanup,
        },
        response_time_ms: start.elapsed().as_millis(),
    };
    (status_code, Json(response))
}

/// Creates the router for health check endpoints
///
/// Endpoints:
/// - GET /health          - Liveness probe
/// - GET /health/ready    - Readiness probe (database connectivity)
/// - GET /health/detailed - Status of every dependency
pub fn health_routes() -> Router<AppState> {
    Router::new()
        .route("/", get(liveness_check))
        .route("/ready", get(readiness_check))
        .route("/detailed", get(detailed_health_check))
}
