use crate::config::ApiConfig;
use crate::directory::{Controller, Coordinates, DirectoryStore, Sensor};
use crate::kv::{KvStore, StoreError};
use crate::oplog::OpLog;
use crate::readings::{ControllerReading, ReadingStore};
use crate::tick::PaginatedTicks;
use crate::timeseries::{TickRange, TimeSeriesStore};
use anyhow::{Context, Result};
use axum::{
    extract::{Path, Query, Request, State},
    http::{header, StatusCode},
    middleware::{self, Next},
    response::{IntoResponse, Response},
    routing::{get, put},
    Json, Router,
};
use serde::{Deserialize, Serialize};
use std::sync::Arc;
use tower_http::cors::{Any, CorsLayer};
use tower_http::trace::TraceLayer;
use tracing::{error, info, instrument};

/// Application state shared across handlers
#[derive(Clone)]
pub struct AppState {
    pub store: Arc<dyn KvStore>,
    pub timeseries: TimeSeriesStore,
    pub directory: DirectoryStore,
    pub readings: ReadingStore,
    pub oplog: OpLog,
}

/// Error response
#[derive(Debug, Serialize)]
pub struct ErrorResponse {
    pub error: String,
    pub code: String,
}

type ApiError = (StatusCode, Json<ErrorResponse>);

/// Range selection for a sensor's ticks.
///
/// `start`/`end` select by epoch seconds and take precedence over the index
/// window. Without them, `start_index`..=`stop_index` counts from the newest
/// tick.
#[derive(Debug, Default, Deserialize)]
pub struct TickQuery {
    pub start_index: Option<usize>,
    pub stop_index: Option<usize>,
    pub start: Option<i64>,
    pub end: Option<i64>,
}

impl TickQuery {
    fn range(&self) -> Result<TickRange, ApiError> {
        match (self.start, self.end) {
            (Some(start), Some(end)) => Ok(TickRange::Time { start, end }),
            (None, None) => Ok(TickRange::Rank {
                start: self.start_index.unwrap_or(0),
                stop: self.stop_index,
            }),
            _ => Err(bad_request("Both start and end are required for a time range")),
        }
    }
}

/// Index window over a controller's readings
#[derive(Debug, Default, Deserialize)]
pub struct ReadingQuery {
    pub start_index: Option<usize>,
    pub stop_index: Option<usize>,
}

/// Body of a controller update
#[derive(Debug, Deserialize)]
pub struct ControllerUpdate {
    #[serde(alias = "name")]
    pub label: String,
}

/// Body of a coordinates update
#[derive(Debug, Deserialize)]
pub struct CoordinatesUpdate {
    pub lat: String,
    pub lng: String,
}

/// Create the API router
pub fn create_router(state: AppState, config: &ApiConfig) -> Router {
    let cors = if config.cors_enabled {
        if config.cors_origins.is_empty() {
            CorsLayer::new()
                .allow_origin(Any)
                .allow_methods(Any)
                .allow_headers(Any)
        } else {
            let origins: Vec<_> = config
                .cors_origins
                .iter()
                .filter_map(|o| o.parse().ok())
                .collect();
            CorsLayer::new()
                .allow_origin(origins)
                .allow_methods(Any)
                .allow_headers(Any)
        }
    } else {
        CorsLayer::new()
    };

    Router::new()
        .route("/health", get(health_check))
        .route("/ready", get(readiness_check))
        .route("/api/controllers", get(list_controllers))
        .route(
            "/api/controllers/:controller_id",
            get(get_controller).put(put_controller).post(put_controller),
        )
        .route(
            "/api/controllers/:controller_id/sensors",
            get(list_controller_sensors),
        )
        .route(
            "/api/controllers/:controller_id/readings",
            get(list_controller_readings),
        )
        .route("/api/sensors/:sensor_id/ticks", get(get_sensor_ticks))
        .route(
            "/api/sensors/:sensor_id/coordinates",
            put(put_sensor_coordinates).get(get_sensor_coordinates),
        )
        .route("/api/logs", get(get_logs))
        .route("/api/log", get(get_logs))
        .layer(middleware::from_fn(count_requests))
        .layer(TraceLayer::new_for_http())
        .layer(cors)
        .with_state(state)
}

async fn count_requests(request: Request, next: Next) -> Response {
    let response = next.run(request).await;
    metrics::counter!(
        "storage.api.requests",
        "status" => response.status().as_u16().to_string()
    )
    .increment(1);
    response
}

/// Health check endpoint
async fn health_check() -> impl IntoResponse {
    Json(serde_json::json!({
        "status": "healthy",
        "service": "osp-storage"
    }))
}

/// Readiness check endpoint
async fn readiness_check(State(state): State<AppState>) -> impl IntoResponse {
    match state.store.ping().await {
        Ok(()) => (
            StatusCode::OK,
            Json(serde_json::json!({
                "status": "ready",
                "store": "connected"
            })),
        ),
        Err(e) => (
            StatusCode::SERVICE_UNAVAILABLE,
            Json(serde_json::json!({
                "status": "not_ready",
                "store": "disconnected",
                "error": e.to_string()
            })),
        ),
    }
}

#[instrument(skip(state))]
async fn list_controllers(State(state): State<AppState>) -> Result<Json<Vec<Controller>>, ApiError> {
    let controllers = state
        .directory
        .list_controllers()
        .await
        .map_err(|e| store_failure("Failed to list controllers", e))?;

    Ok(Json(controllers))
}

#[instrument(skip(state))]
async fn get_controller(
    State(state): State<AppState>,
    Path(controller_id): Path<String>,
) -> Result<Json<Controller>, ApiError> {
    let controller = state
        .directory
        .get_controller(&controller_id)
        .await
        .map_err(|e| store_failure("Failed to get controller", e))?;

    controller.map(Json).ok_or_else(|| not_found("Controller not found"))
}

#[instrument(skip(state, update))]
async fn put_controller(
    State(state): State<AppState>,
    Path(controller_id): Path<String>,
    Json(update): Json<ControllerUpdate>,
) -> Result<StatusCode, ApiError> {
    state
        .directory
        .set_controller_label(&controller_id, &update.label)
        .await
        .map_err(|e| store_failure("Failed to update controller", e))?;

    info!(controller_id = %controller_id, label = %update.label, "Controller label updated");

    Ok(StatusCode::NO_CONTENT)
}

#[instrument(skip(state))]
async fn list_controller_sensors(
    State(state): State<AppState>,
    Path(controller_id): Path<String>,
) -> Result<Json<Vec<Sensor>>, ApiError> {
    let sensors = state
        .directory
        .list_sensors_of_controller(&controller_id)
        .await
        .map_err(|e| store_failure("Failed to list sensors", e))?;

    Ok(Json(sensors))
}

#[instrument(skip(state))]
async fn list_controller_readings(
    State(state): State<AppState>,
    Path(controller_id): Path<String>,
    Query(params): Query<ReadingQuery>,
) -> Result<Json<Vec<ControllerReading>>, ApiError> {
    let readings = state
        .readings
        .query_by_rank(
            &controller_id,
            params.start_index.unwrap_or(0),
            params.stop_index,
        )
        .await
        .map_err(|e| store_failure("Failed to query readings", e))?;

    Ok(Json(readings))
}

#[instrument(skip(state))]
async fn get_sensor_ticks(
    State(state): State<AppState>,
    Path(sensor_id): Path<i64>,
    Query(params): Query<TickQuery>,
) -> Result<Json<PaginatedTicks>, ApiError> {
    let range = params.range()?;

    let page = state
        .timeseries
        .page(sensor_id, range)
        .await
        .map_err(|e| store_failure("Failed to query ticks", e))?;

    Ok(Json(page))
}

#[instrument(skip(state))]
async fn get_sensor_coordinates(
    State(state): State<AppState>,
    Path(sensor_id): Path<i64>,
) -> Result<Json<Coordinates>, ApiError> {
    let coordinates = state
        .directory
        .get_sensor_coordinates(sensor_id)
        .await
        .map_err(|e| store_failure("Failed to get coordinates", e))?;

    coordinates.map(Json).ok_or_else(|| not_found("Sensor has no coordinates"))
}

#[instrument(skip(state, update))]
async fn put_sensor_coordinates(
    State(state): State<AppState>,
    Path(sensor_id): Path<i64>,
    Json(update): Json<CoordinatesUpdate>,
) -> Result<StatusCode, ApiError> {
    state
        .directory
        .set_sensor_coordinates(sensor_id, &update.lat, &update.lng)
        .await
        .map_err(|e| store_failure("Failed to update coordinates", e))?;

    Ok(StatusCode::NO_CONTENT)
}

/// Recent raw payloads, one quoted entry per line
async fn get_logs(State(state): State<AppState>) -> Result<impl IntoResponse, ApiError> {
    let entries = state
        .oplog
        .recent()
        .await
        .map_err(|e| store_failure("Failed to read logs", e))?;

    let body: String = entries
        .iter()
        .map(|entry| format!("{entry:?}\n"))
        .collect();

    Ok(([(header::CONTENT_TYPE, "text/plain; charset=utf-8")], body))
}

fn store_failure(message: &str, e: StoreError) -> ApiError {
    error!(error = %e, "{}", message);
    metrics::counter!("storage.api.errors").increment(1);
    (
        StatusCode::INTERNAL_SERVER_ERROR,
        Json(ErrorResponse {
            error: message.to_string(),
            code: "STORE_ERROR".to_string(),
        }),
    )
}

fn bad_request(message: &str) -> ApiError {
    (
        StatusCode::BAD_REQUEST,
        Json(ErrorResponse {
            error: message.to_string(),
            code: "BAD_REQUEST".to_string(),
        }),
    )
}

fn not_found(message: &str) -> ApiError {
    (
        StatusCode::NOT_FOUND,
        Json(ErrorResponse {
            error: message.to_string(),
            code: "NOT_FOUND".to_string(),
        }),
    )
}

/// Start the query API server
pub async fn start_api_server(state: AppState, config: &ApiConfig) -> Result<()> {
    let router = create_router(state, config);
    let addr = format!("{}:{}", config.host, config.port);

    info!(address = %addr, "Starting query API server");

    let listener = tokio::net::TcpListener::bind(&addr)
        .await
        .context("Failed to bind to address")?;

    axum::serve(listener, router)
        .await
        .context("API server error")?;

    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::codec::RecordZone;
    use crate::kv::MockKvStore;
    use crate::memory_store::MemoryStore;
    use axum::body::{to_bytes, Body};
    use axum::http::Request;
    use tower::ServiceExt;

    fn state_with(store: Arc<dyn KvStore>) -> AppState {
        let timeseries = TimeSeriesStore::new(store.clone());
        AppState {
            store: store.clone(),
            directory: DirectoryStore::new(store.clone(), timeseries.clone(), "http://view.test"),
            timeseries,
            readings: ReadingStore::new(store.clone()),
            oplog: OpLog::new(store, 10),
        }
    }

    fn router(state: AppState) -> Router {
        create_router(state, &ApiConfig::default())
    }

    async fn body_json(response: axum::response::Response) -> serde_json::Value {
        let bytes = to_bytes(response.into_body(), usize::MAX).await.unwrap();
        serde_json::from_slice(&bytes).unwrap()
    }

    async fn seeded_state() -> AppState {
        let state = state_with(Arc::new(MemoryStore::new()));
        let zone = RecordZone::from_offset_minutes(0).unwrap();
        for second in 0..3 {
            let raw = format!("[1970-1-1 0:0:{second};42;60;3300;128;0;255]");
            state
                .timeseries
                .append(42, &zone.decode(&raw).unwrap())
                .await
                .unwrap();
        }
        state
    }

    #[tokio::test]
    async fn test_ticks_by_rank_window() {
        let app = router(seeded_state().await);

        let response = app
            .oneshot(
                Request::get("/api/sensors/42/ticks?start_index=0&stop_index=1")
                    .body(Body::empty())
                    .unwrap(),
            )
            .await
            .unwrap();

        assert_eq!(response.status(), StatusCode::OK);
        let json = body_json(response).await;
        assert_eq!(json["total"], 3);
        assert_eq!(json["ticks"].as_array().unwrap().len(), 2);
        assert_eq!(json["ticks"][0]["temperature"], 0.5);
        assert_eq!(json["ticks"][0]["battery_voltage_visual"], 3.3);
    }

    #[tokio::test]
    async fn test_ticks_by_time_range() {
        let app = router(seeded_state().await);

        let response = app
            .oneshot(
                Request::get("/api/sensors/42/ticks?start=1&end=2")
                    .body(Body::empty())
                    .unwrap(),
            )
            .await
            .unwrap();

        assert_eq!(response.status(), StatusCode::OK);
        let json = body_json(response).await;
        assert_eq!(json["ticks"].as_array().unwrap().len(), 2);
    }

    #[tokio::test]
    async fn test_malformed_range_is_client_error() {
        let state = seeded_state().await;

        for uri in [
            "/api/sensors/42/ticks?start_index=-1",
            "/api/sensors/42/ticks?stop_index=many",
            "/api/sensors/42/ticks?start=5",
            "/api/sensors/abc/ticks",
        ] {
            let response = router(state.clone())
                .oneshot(Request::get(uri).body(Body::empty()).unwrap())
                .await
                .unwrap();
            assert_eq!(response.status(), StatusCode::BAD_REQUEST, "{uri}");
        }
    }

    #[tokio::test]
    async fn test_store_failure_is_server_error() {
        let mut mock = MockKvStore::new();
        mock.expect_smembers()
            .returning(|_| Err(StoreError::Unavailable("down".to_string())));

        let response = router(state_with(Arc::new(mock)))
            .oneshot(Request::get("/api/controllers").body(Body::empty()).unwrap())
            .await
            .unwrap();

        assert_eq!(response.status(), StatusCode::INTERNAL_SERVER_ERROR);
        let json = body_json(response).await;
        assert_eq!(json["code"], "STORE_ERROR");
    }

    #[tokio::test]
    async fn test_controller_label_round_trip() {
        let state = state_with(Arc::new(MemoryStore::new()));

        let response = router(state.clone())
            .oneshot(
                Request::put("/api/controllers/9")
                    .header(header::CONTENT_TYPE, "application/json")
                    .body(Body::from(r#"{"label":"North field"}"#))
                    .unwrap(),
            )
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::NO_CONTENT);

        let response = router(state.clone())
            .oneshot(Request::get("/api/controllers/9").body(Body::empty()).unwrap())
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::OK);
        let json = body_json(response).await;
        assert_eq!(json["label"], "North field");

        let response = router(state)
            .oneshot(Request::get("/api/controllers/10").body(Body::empty()).unwrap())
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::NOT_FOUND);
    }

    #[tokio::test]
    async fn test_logs_are_plain_text() {
        let state = state_with(Arc::new(MemoryStore::new()));
        state.oplog.record("[2024-1-1 10:0:0;42]").await.unwrap();

        let response = router(state)
            .oneshot(Request::get("/api/logs").body(Body::empty()).unwrap())
            .await
            .unwrap();

        assert_eq!(response.status(), StatusCode::OK);
        let bytes = to_bytes(response.into_body(), usize::MAX).await.unwrap();
        let text = String::from_utf8(bytes.to_vec()).unwrap();
        assert!(text.starts_with('"'));
        assert!(text.trim_end().ends_with("[2024-1-1 10:0:0;42]\""));
    }
}
