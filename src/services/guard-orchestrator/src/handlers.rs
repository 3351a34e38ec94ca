//! API Handlers Module
//!
//! HTTP handlers for the guard orchestrator REST API.
//! Provides the orchestration endpoint plus service, health, circuit breaker
//! and discovery administration.

use crate::error::{OrchestratorError, Result};
use crate::health::HealthMonitoringStats;
use crate::models::{
    CircuitBreakerSnapshot, GuardServiceType, OrchestrationRequest, OrchestrationResponse,
    OrchestratorStats, ServiceConfig, ServiceHealth, UpdateServiceRequest,
};
use crate::orchestrator::Orchestrator;

use axum::{
    extract::{DefaultBodyLimit, Path, Query, State},
    http::StatusCode,
    response::Json,
    routing::{get, post},
    Router,
};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::sync::Arc;
use tower_http::trace::TraceLayer;
use tracing::{debug, info};

/// Application state shared across handlers
#[derive(Clone)]
pub struct AppState {
    pub orchestrator: Arc<Orchestrator>,
}

/// Standard API response wrapper
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ApiResponse<T> {
    pub success: bool,
    pub data: Option<T>,
    pub error: Option<String>,
    pub timestamp: chrono::DateTime<chrono::Utc>,
}

impl<T> ApiResponse<T> {
    pub fn success(data: T) -> Self {
        Self {
            success: true,
            data: Some(data),
            error: None,
            timestamp: chrono::Utc::now(),
        }
    }

    pub fn error(error: String) -> Self {
        Self {
            success: false,
            data: None,
            error: Some(error),
            timestamp: chrono::Utc::now(),
        }
    }
}

/// Liveness response
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct HealthResponse {
    pub status: String,
    pub timestamp: chrono::DateTime<chrono::Utc>,
    pub version: String,
    pub registered_services: u64,
}

/// Health overview of every tracked service
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct HealthOverview {
    pub services: BTreeMap<String, ServiceHealth>,
    pub stats: HealthMonitoringStats,
}

/// Combined counters
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct StatsResponse {
    pub orchestrator: OrchestratorStats,
    pub health: HealthMonitoringStats,
}

/// Discovery run result
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DiscoveryRunResponse {
    pub applied: usize,
    pub registered_services: usize,
}

/// Query parameters for listing services
#[derive(Debug, Default, Deserialize)]
pub struct ListServicesQuery {
    pub service_type: Option<String>,
    #[serde(default)]
    pub include_disabled: bool,
}

/// Create the main router with all API routes
pub fn create_router(state: AppState) -> Router {
    let body_limit = state.orchestrator.config().server.body_limit_bytes;

    Router::new()
        // Orchestration
        .route("/api/v1/orchestrate", post(orchestrate))
        // Service management routes
        .route("/api/v1/services", get(list_services).post(register_service))
        .route(
            "/api/v1/services/:name",
            get(get_service)
                .patch(update_service)
                .delete(unregister_service),
        )
        // Health routes
        .route("/api/v1/health", get(get_all_health))
        .route("/api/v1/health/refresh", post(refresh_health))
        .route("/api/v1/health/:name", get(get_service_health))
        .route("/api/v1/health/:name/refresh", post(refresh_service_health))
        // Circuit breaker routes
        .route("/api/v1/circuit-breakers", get(get_circuit_breakers))
        .route(
            "/api/v1/circuit-breakers/:name/reset",
            post(reset_circuit_breaker),
        )
        // Administrative routes
        .route("/api/v1/discovery/run", post(run_discovery))
        .route("/api/v1/stats", get(get_stats))
        // System routes
        .route("/health", get(health_check))
        .layer(DefaultBodyLimit::max(body_limit))
        .layer(TraceLayer::new_for_http())
        .with_state(state)
}

/// Route a request to a guard service.
///
/// A failed orchestration still carries the full response body; the status
/// code reflects the last attempt's failure kind.
pub async fn orchestrate(
    State(state): State<AppState>,
    Json(request): Json<OrchestrationRequest>,
) -> Result<(StatusCode, Json<OrchestrationResponse>)> {
    debug!(
        request_id = %request.request_id,
        service_type = %request.service_type,
        "Orchestrating request"
    );

    let response = state.orchestrator.orchestrate(request).await?;

    let status = match response.error_kind {
        Some(kind) if !response.success => kind.status_code(),
        _ if !response.success => StatusCode::BAD_GATEWAY,
        _ => StatusCode::OK,
    };

    Ok((status, Json(response)))
}

/// List services, optionally filtered by type
pub async fn list_services(
    State(state): State<AppState>,
    Query(query): Query<ListServicesQuery>,
) -> Result<Json<ApiResponse<Vec<ServiceConfig>>>> {
    let service_type = query
        .service_type
        .as_deref()
        .map(str::parse::<GuardServiceType>)
        .transpose()?;

    let services = if query.include_disabled {
        state
            .orchestrator
            .list_all_services()
            .into_iter()
            .filter(|s| service_type.map_or(true, |t| s.service_type == t))
            .collect()
    } else {
        state.orchestrator.list_services(service_type)
    };

    Ok(Json(ApiResponse::success(services)))
}

/// Register or overwrite a service
pub async fn register_service(
    State(state): State<AppState>,
    Json(config): Json<ServiceConfig>,
) -> Result<(StatusCode, Json<ApiResponse<ServiceConfig>>)> {
    debug!(service = %config.name, "Registering service");

    let name = config.name.clone();
    state.orchestrator.register_service(config)?;
    let registered = state.orchestrator.get_service(&name)?;

    info!(service = %name, "Service registered via API");
    Ok((StatusCode::CREATED, Json(ApiResponse::success(registered))))
}

/// Get a service by name
pub async fn get_service(
    State(state): State<AppState>,
    Path(name): Path<String>,
) -> Result<Json<ApiResponse<ServiceConfig>>> {
    Ok(Json(ApiResponse::success(
        state.orchestrator.get_service(&name)?,
    )))
}

/// Update enabled flag, priority or credential of a service
pub async fn update_service(
    State(state): State<AppState>,
    Path(name): Path<String>,
    Json(update): Json<UpdateServiceRequest>,
) -> Result<Json<ApiResponse<ServiceConfig>>> {
    debug!(service = %name, "Updating service");

    // Reject unknown names before applying any field
    state.orchestrator.get_service(&name)?;

    if let Some(enabled) = update.enabled {
        state.orchestrator.set_service_enabled(&name, enabled)?;
    }
    if let Some(priority) = update.priority {
        state.orchestrator.set_service_priority(&name, priority)?;
    }
    if let Some(token) = update.auth_token {
        let token = (!token.is_empty()).then_some(token);
        state.orchestrator.set_service_auth_token(&name, token)?;
    }

    Ok(Json(ApiResponse::success(
        state.orchestrator.get_service(&name)?,
    )))
}

/// Remove a service
pub async fn unregister_service(
    State(state): State<AppState>,
    Path(name): Path<String>,
) -> Result<Json<ApiResponse<String>>> {
    if !state.orchestrator.unregister_service(&name) {
        return Err(OrchestratorError::not_found(name));
    }

    info!(service = %name, "Service unregistered via API");
    Ok(Json(ApiResponse::success(format!(
        "Service {} unregistered",
        name
    ))))
}

/// Cached health of every service
pub async fn get_all_health(State(state): State<AppState>) -> Json<ApiResponse<HealthOverview>> {
    Json(ApiResponse::success(health_overview(&state.orchestrator)))
}

/// Cached health of one service
pub async fn get_service_health(
    State(state): State<AppState>,
    Path(name): Path<String>,
) -> Result<Json<ApiResponse<ServiceHealth>>> {
    Ok(Json(ApiResponse::success(
        state.orchestrator.get_health(&name)?,
    )))
}

/// Probe every enabled service now
pub async fn refresh_health(State(state): State<AppState>) -> Json<ApiResponse<HealthOverview>> {
    state.orchestrator.refresh_health().await;
    Json(ApiResponse::success(health_overview(&state.orchestrator)))
}

/// Probe one service now
pub async fn refresh_service_health(
    State(state): State<AppState>,
    Path(name): Path<String>,
) -> Result<Json<ApiResponse<ServiceHealth>>> {
    Ok(Json(ApiResponse::success(
        state.orchestrator.refresh_service_health(&name).await?,
    )))
}

fn health_overview(orchestrator: &Orchestrator) -> HealthOverview {
    HealthOverview {
        services: orchestrator.get_all_health(),
        stats: orchestrator.health_stats(),
    }
}

/// Snapshot of every circuit breaker
pub async fn get_circuit_breakers(
    State(state): State<AppState>,
) -> Json<ApiResponse<BTreeMap<String, CircuitBreakerSnapshot>>> {
    Json(ApiResponse::success(
        state.orchestrator.get_circuit_breaker_states(),
    ))
}

/// Force a breaker back to closed
pub async fn reset_circuit_breaker(
    State(state): State<AppState>,
    Path(name): Path<String>,
) -> Result<Json<ApiResponse<String>>> {
    state.orchestrator.reset_circuit_breaker(&name)?;
    Ok(Json(ApiResponse::success(format!(
        "Circuit breaker for {} reset",
        name
    ))))
}

/// Run discovery now
pub async fn run_discovery(State(state): State<AppState>) -> Json<ApiResponse<DiscoveryRunResponse>> {
    let applied = state.orchestrator.discover().await;
    Json(ApiResponse::success(DiscoveryRunResponse {
        applied,
        registered_services: state.orchestrator.list_all_services().len(),
    }))
}

/// Request and health counters
pub async fn get_stats(State(state): State<AppState>) -> Json<ApiResponse<StatsResponse>> {
    Json(ApiResponse::success(StatsResponse {
        orchestrator: state.orchestrator.stats(),
        health: state.orchestrator.health_stats(),
    }))
}

/// Liveness check
pub async fn health_check(State(state): State<AppState>) -> Json<ApiResponse<HealthResponse>> {
    Json(ApiResponse::success(HealthResponse {
        status: "healthy".to_string(),
        timestamp: chrono::Utc::now(),
        version: crate::VERSION.to_string(),
        registered_services: state.orchestrator.stats().registered_services,
    }))
}
