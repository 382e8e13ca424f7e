#![deny(unsafe_code)]

pub mod config;
pub mod fraud;
pub mod publisher;

use std::sync::Arc;

use axum::extract::{Path, Query, State};
use axum::http::{HeaderMap, StatusCode};
use axum::middleware::{self, Next};
use axum::response::{IntoResponse, Response};
use axum::routing::{get, post};
use axum::{Json, Router};
use ledgersim_adapters::EventStream;
use ledgersim_core::{
    IncidentActionRequest, LedgerEngine, LedgerError, LedgerSnapshot, ReplayRequest,
    SetControlsRequest, SetZoneStatusRequest, TransferOutcome, TransferRequest,
};
use serde::{Deserialize, Serialize};
use thiserror::Error;
use tower_http::cors::{AllowOrigin, CorsLayer};
use tower_http::trace::TraceLayer;

#[derive(Clone)]
pub struct ServiceState {
    pub engine: Arc<LedgerEngine>,
    pub event_stream: Arc<dyn EventStream>,
    pub admin_key: Option<String>,
}

pub fn build_router(state: ServiceState, cors_origins: &[String]) -> Router {
    let cors = build_cors_layer(cors_origins);

    let admin_routes = Router::new()
        .route("/v1/sim/snapshot", post(create_snapshot))
        .route("/v1/sim/restore", post(restore_snapshot))
        .layer(middleware::from_fn_with_state(state.clone(), require_admin_key));

    Router::new()
        .route("/healthz", get(healthz))
        .route("/v1/version", get(version))
        .route("/v1/zones", get(list_zones))
        .route("/v1/transfers", post(create_transfer))
        .route("/v1/balances", get(list_balances))
        .route("/v1/transactions", get(list_transactions))
        .route("/v1/transactions/:id", get(get_transaction))
        .route("/v1/zones/:id/status", post(set_zone_status))
        .route(
            "/v1/zones/:id/controls",
            get(get_zone_controls).post(set_zone_controls),
        )
        .route("/v1/zones/:id/spool", get(zone_spool_summary))
        .route("/v1/zones/:id/spool/replay", post(replay_zone_spool))
        .route("/v1/zones/:id/audit", get(zone_audit))
        .route("/v1/zones/:id/incidents", get(zone_incidents))
        .route("/v1/incidents", get(list_incidents))
        .route("/v1/incidents/:id", get(get_incident))
        .route("/v1/incidents/:id/action", post(apply_incident_action))
        .merge(admin_routes)
        .layer(TraceLayer::new_for_http())
        .layer(cors)
        .with_state(state)
}

fn build_cors_layer(origins: &[String]) -> CorsLayer {
    let layer = CorsLayer::new().allow_methods(tower_http::cors::Any).allow_headers(tower_http::cors::Any);
    if origins.iter().any(|o| o == "*") {
        layer.allow_origin(tower_http::cors::Any)
    } else if origins.is_empty() {
        layer
    } else {
        let parsed: Vec<axum::http::HeaderValue> = origins
            .iter()
            .filter_map(|o| o.parse().ok())
            .collect();
        layer.allow_origin(AllowOrigin::list(parsed))
    }
}

async fn require_admin_key(
    State(state): State<ServiceState>,
    headers: HeaderMap,
    request: axum::extract::Request,
    next: Next,
) -> Result<Response, ApiError> {
    let configured = state.admin_key.as_deref().ok_or(ApiError::Core(LedgerError::Forbidden))?;
    let provided = headers.get("X-Admin-Key").and_then(|v| v.to_str().ok()).unwrap_or("");
    if provided != configured {
        return Err(ApiError::Core(LedgerError::Forbidden));
    }
    Ok(next.run(request).await)
}

#[derive(Debug, Error)]
pub enum ApiError {
    #[error("{message}")]
    Http { status: StatusCode, message: String },
    #[error(transparent)]
    Core(#[from] LedgerError),
}

impl ApiError {
    fn bad_request(message: impl Into<String>) -> Self {
        Self::Http { status: StatusCode::BAD_REQUEST, message: message.into() }
    }
}

impl IntoResponse for ApiError {
    fn into_response(self) -> Response {
        let (status, message) = match &self {
            ApiError::Http { status, message } => (*status, message.clone()),
            ApiError::Core(err) => (status_for(err), err.to_string()),
        };
        (status, Json(serde_json::json!({ "error": message }))).into_response()
    }
}

fn status_for(err: &LedgerError) -> StatusCode {
    match err {
        LedgerError::BadRequest(_) => StatusCode::BAD_REQUEST,
        LedgerError::IdempotencyConflict { .. } => StatusCode::CONFLICT,
        LedgerError::ZoneUnknown { .. } => StatusCode::INTERNAL_SERVER_ERROR,
        LedgerError::ZoneDown { .. } | LedgerError::ZoneBlocked { .. } => StatusCode::SERVICE_UNAVAILABLE,
        LedgerError::NotReady { .. } => StatusCode::CONFLICT,
        LedgerError::NotFound(_) => StatusCode::NOT_FOUND,
        LedgerError::Forbidden => StatusCode::FORBIDDEN,
        LedgerError::Internal(_) => StatusCode::INTERNAL_SERVER_ERROR,
    }
}

async fn healthz() -> &'static str {
    "ok"
}

#[derive(Debug, Serialize)]
struct VersionResponse {
    name: &'static str,
    version: &'static str,
}

async fn version() -> Json<VersionResponse> {
    Json(VersionResponse { name: env!("CARGO_PKG_NAME"), version: env!("CARGO_PKG_VERSION") })
}

#[derive(Debug, Serialize)]
struct ZonesResponse {
    zones: Vec<ledgersim_core::Zone>,
}

async fn list_zones(State(state): State<ServiceState>) -> Result<Json<ZonesResponse>, ApiError> {
    Ok(Json(ZonesResponse { zones: state.engine.list_zones().await? }))
}

#[derive(Debug, Serialize)]
#[serde(tag = "status")]
enum TransferResponse {
    #[serde(rename = "APPLIED")]
    Applied { transaction_id: uuid::Uuid, request_id: String, created_at: chrono::DateTime<chrono::Utc> },
    #[serde(rename = "SPOOLED")]
    Spooled { spool_id: uuid::Uuid, request_id: String },
}

async fn create_transfer(
    State(state): State<ServiceState>,
    Json(req): Json<TransferRequest>,
) -> Result<(StatusCode, Json<TransferResponse>), ApiError> {
    match state.engine.create_transfer(req).await? {
        TransferOutcome::Applied(txn) => Ok((
            StatusCode::OK,
            Json(TransferResponse::Applied {
                transaction_id: txn.id,
                request_id: txn.request_id,
                created_at: txn.created_at,
            }),
        )),
        TransferOutcome::Spooled { spool_id, request_id } => {
            Ok((StatusCode::ACCEPTED, Json(TransferResponse::Spooled { spool_id, request_id })))
        }
    }
}

#[derive(Debug, Deserialize)]
struct LimitQuery {
    #[serde(default = "default_limit")]
    limit: i64,
}

fn default_limit() -> i64 {
    100
}

#[derive(Debug, Serialize)]
struct BalancesResponse {
    balances: Vec<ledgersim_core::Balance>,
}

async fn list_balances(
    State(state): State<ServiceState>,
    Query(query): Query<LimitQuery>,
) -> Result<Json<BalancesResponse>, ApiError> {
    Ok(Json(BalancesResponse { balances: state.engine.list_balances(query.limit).await? }))
}

#[derive(Debug, Serialize)]
struct TransactionsResponse {
    transactions: Vec<ledgersim_core::Transaction>,
}

async fn list_transactions(
    State(state): State<ServiceState>,
    Query(query): Query<LimitQuery>,
) -> Result<Json<TransactionsResponse>, ApiError> {
    Ok(Json(TransactionsResponse { transactions: state.engine.list_transactions(query.limit).await? }))
}

async fn get_transaction(
    State(state): State<ServiceState>,
    Path(id): Path<uuid::Uuid>,
) -> Result<Json<ledgersim_core::TransactionDetail>, ApiError> {
    Ok(Json(state.engine.get_transaction(id).await?))
}

async fn set_zone_status(
    State(state): State<ServiceState>,
    Path(zone_id): Path<String>,
    Json(req): Json<SetZoneStatusRequest>,
) -> Result<Json<ledgersim_core::Zone>, ApiError> {
    Ok(Json(
        state
            .engine
            .set_zone_status(&zone_id, &req.status, &req.actor, req.reason.as_deref())
            .await?,
    ))
}

async fn get_zone_controls(
    State(state): State<ServiceState>,
    Path(zone_id): Path<String>,
) -> Result<Json<ledgersim_core::ZoneControls>, ApiError> {
    Ok(Json(state.engine.get_zone_controls(&zone_id).await?))
}

async fn set_zone_controls(
    State(state): State<ServiceState>,
    Path(zone_id): Path<String>,
    Json(req): Json<SetControlsRequest>,
) -> Result<Json<ledgersim_core::ZoneControls>, ApiError> {
    if !(0..=100).contains(&req.cross_zone_throttle) {
        return Err(ApiError::bad_request("cross_zone_throttle must be in [0,100]"));
    }
    Ok(Json(state.engine.set_zone_controls(&zone_id, &req).await?))
}

async fn zone_spool_summary(
    State(state): State<ServiceState>,
    Path(zone_id): Path<String>,
) -> Result<Json<ledgersim_core::SpoolSummary>, ApiError> {
    Ok(Json(state.engine.spool_summary(&zone_id).await?))
}

async fn replay_zone_spool(
    State(state): State<ServiceState>,
    Path(zone_id): Path<String>,
    Json(req): Json<ReplayRequest>,
) -> Result<Json<ledgersim_core::ReplaySummary>, ApiError> {
    Ok(Json(
        state
            .engine
            .replay_spool(&zone_id, req.limit, &req.actor, req.reason.as_deref())
            .await?,
    ))
}

async fn zone_audit(
    State(state): State<ServiceState>,
    Path(zone_id): Path<String>,
    Query(query): Query<LimitQuery>,
) -> Result<Json<Vec<ledgersim_core::AuditEntry>>, ApiError> {
    Ok(Json(state.engine.list_audit(&zone_id, query.limit).await?))
}

async fn zone_incidents(
    State(state): State<ServiceState>,
    Path(zone_id): Path<String>,
) -> Result<Json<Vec<ledgersim_core::Incident>>, ApiError> {
    Ok(Json(state.engine.list_incidents_for_zone(&zone_id).await?))
}

async fn list_incidents(
    State(state): State<ServiceState>,
    Query(query): Query<LimitQuery>,
) -> Result<Json<Vec<ledgersim_core::Incident>>, ApiError> {
    Ok(Json(state.engine.list_incidents(query.limit).await?))
}

async fn get_incident(
    State(state): State<ServiceState>,
    Path(id): Path<uuid::Uuid>,
) -> Result<Json<ledgersim_core::Incident>, ApiError> {
    Ok(Json(state.engine.get_incident(id).await?))
}

async fn apply_incident_action(
    State(state): State<ServiceState>,
    Path(id): Path<uuid::Uuid>,
    Json(req): Json<IncidentActionRequest>,
) -> Result<Json<ledgersim_core::Incident>, ApiError> {
    Ok(Json(state.engine.apply_incident_action(id, &req).await?))
}

async fn create_snapshot(State(state): State<ServiceState>) -> Result<Json<LedgerSnapshot>, ApiError> {
    Ok(Json(state.engine.snapshot().await?))
}

#[derive(Debug, Serialize)]
struct RestoreResponse {
    status: &'static str,
}

async fn restore_snapshot(
    State(state): State<ServiceState>,
    Json(snapshot): Json<LedgerSnapshot>,
) -> Result<Json<RestoreResponse>, ApiError> {
    state.engine.restore(&snapshot).await?;
    Ok(Json(RestoreResponse { status: "ok" }))
}

#[cfg(test)]
mod tests {
    use super::*;
    use axum::body::{to_bytes, Body};
    use axum::http::Request;
    use ledgersim_adapters::InMemoryEventStream;
    use ledgersim_core::Store;
    use tower::ServiceExt;

    async fn test_state() -> ServiceState {
        let database_url = std::env::var("TEST_DATABASE_URL")
            .unwrap_or_else(|_| "postgres://localhost/ledgersim_test".to_string());
        let store = Store::connect(&database_url).await.expect("connect test db");
        store.ensure_schema().await.expect("ensure schema");
        ServiceState {
            engine: Arc::new(LedgerEngine::new(store)),
            event_stream: Arc::new(InMemoryEventStream::new()),
            admin_key: Some("test-admin-key".to_string()),
        }
    }

    #[tokio::test]
    #[ignore = "requires a reachable Postgres at TEST_DATABASE_URL"]
    async fn healthz_reports_ok() {
        let state = test_state().await;
        let app = build_router(state, &[]);

        let response = app
            .oneshot(Request::builder().uri("/healthz").body(Body::empty()).unwrap())
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::OK);
        let bytes = to_bytes(response.into_body(), usize::MAX).await.unwrap();
        assert_eq!(&bytes[..], b"ok");
    }

    #[tokio::test]
    #[ignore = "requires a reachable Postgres at TEST_DATABASE_URL"]
    async fn admin_routes_are_forbidden_without_key() {
        let state = test_state().await;
        let app = build_router(state, &[]);

        let response = app
            .oneshot(
                Request::builder()
                    .method("POST")
                    .uri("/v1/sim/snapshot")
                    .body(Body::empty())
                    .unwrap(),
            )
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::FORBIDDEN);
    }

    #[tokio::test]
    #[ignore = "requires a reachable Postgres at TEST_DATABASE_URL"]
    async fn happy_apply_flow_matches_scenario_s1() {
        let state = test_state().await;
        let app = build_router(state, &[]);

        let payload = serde_json::json!({
            "request_id": "r1",
            "from_account": "a",
            "to_account": "b",
            "amount_units": 120,
            "zone_id": "zone-eu",
            "metadata": {}
        });

        let response = app
            .oneshot(
                Request::builder()
                    .method("POST")
                    .uri("/v1/transfers")
                    .header("content-type", "application/json")
                    .body(Body::from(payload.to_string()))
                    .unwrap(),
            )
            .await
            .unwrap();

        assert_eq!(response.status(), StatusCode::OK);
        let bytes = to_bytes(response.into_body(), usize::MAX).await.unwrap();
        let body: serde_json::Value = serde_json::from_slice(&bytes).unwrap();
        assert_eq!(body.get("status").and_then(|v| v.as_str()), Some("APPLIED"));
        assert_eq!(body.get("request_id").and_then(|v| v.as_str()), Some("r1"));
    }
}
