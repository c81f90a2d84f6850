use axum::{
    extract::{Path, State},
    http::StatusCode,
    response::Json,
    routing::get,
    Router,
};
use serde::Serialize;
use std::sync::Arc;
use tower_http::trace::TraceLayer;

use crate::{
    config::Config,
    prices::{
        store::PersistedState,
        types::{DayDataset, Field},
    },
    scheduler::UpdateCoordinator,
    sensors::{read_all, read_sensor, SensorReading},
};

// Shared application state
#[derive(Clone)]
pub struct AppState {
    pub config: Arc<Config>,
    pub coordinator: Arc<UpdateCoordinator>,
}

#[derive(Debug, Serialize)]
pub struct HealthResponse {
    pub status: String,
    pub timestamp: chrono::DateTime<chrono::Utc>,
    pub version: String,
    pub available: bool,
    pub last_update: Option<chrono::DateTime<chrono::FixedOffset>>,
    /// Delivery date and hour of the last successful fetch.
    pub last_success: Option<(chrono::NaiveDate, u32)>,
}

pub async fn health(State(state): State<AppState>) -> Json<HealthResponse> {
    let snapshot = state.coordinator.snapshot();
    Json(HealthResponse {
        status: "healthy".to_string(),
        timestamp: chrono::Utc::now(),
        version: env!("CARGO_PKG_VERSION").to_string(),
        available: snapshot.is_available(),
        last_update: snapshot.updated_at,
        last_success: state.coordinator.last_success(),
    })
}

pub async fn get_sensors(State(state): State<AppState>) -> Json<Vec<SensorReading>> {
    let snapshot = state.coordinator.snapshot();
    Json(read_all(&snapshot, state.config.unit, state.config.zone.now()))
}

pub async fn get_sensor(
    State(state): State<AppState>,
    Path(key): Path<String>,
) -> Result<Json<SensorReading>, StatusCode> {
    let Some(field) = Field::from_key(&key) else {
        tracing::debug!("Unknown sensor requested: {}", key);
        return Err(StatusCode::NOT_FOUND);
    };
    let snapshot = state.coordinator.snapshot();
    Ok(Json(read_sensor(
        &snapshot,
        field,
        state.config.unit,
        state.config.zone.now(),
    )))
}

/// Raw cached data, before templates and unit conversion.
pub async fn get_raw_prices(State(state): State<AppState>) -> Json<PersistedState> {
    Json(state.coordinator.snapshot().cache.snapshot())
}

pub async fn get_raw_day(
    State(state): State<AppState>,
    Path(date): Path<String>,
) -> Result<Json<DayDataset>, StatusCode> {
    let date = chrono::NaiveDate::parse_from_str(&date, "%Y-%m-%d")
        .map_err(|_| StatusCode::BAD_REQUEST)?;
    state
        .coordinator
        .snapshot()
        .cache
        .day(date)
        .cloned()
        .map(Json)
        .ok_or(StatusCode::NOT_FOUND)
}

pub fn create_router(state: AppState) -> Router {
    Router::new()
        .route("/health", get(health))
        .route("/api/sensors", get(get_sensors))
        .route("/api/sensors/:field", get(get_sensor))
        .route("/api/prices/raw", get(get_raw_prices))
        .route("/api/prices/raw/:date", get(get_raw_day))
        .layer(TraceLayer::new_for_http())
        .with_state(state)
}
