//! HTTP API Server
//!
//! REST API over the admin service: backend management, group listing,
//! sharding metadata and settings persistence.

use std::sync::Arc;
use std::time::Instant;

use axum::{
    extract::{Json, Path, State},
    http::StatusCode,
    response::{IntoResponse, Response},
    routing::{get, patch, post},
    Router,
};
use serde::{Deserialize, Serialize};
use tower_http::cors::CorsLayer;
use tower_http::trace::TraceLayer;

use crate::admin::{AdminService, BackendSelector, ConnectionStats, Outcome};
use crate::backend::{BackendState, BackendType};
use crate::config::ApiConfig;
use crate::error::{Error, Result};
use crate::monitor::{MonitorStats, MonitorStatsSnapshot};

/// Shared application state
pub struct AppState {
    /// Node ID
    pub node_id: String,
    /// Admin operations
    pub admin: AdminService,
    /// Health monitor counters, when the monitor runs
    pub monitor: Option<Arc<MonitorStats>>,
    /// Process start, for uptime
    pub started_at: Instant,
}

/// HTTP API server
pub struct HttpServer {
    config: ApiConfig,
    state: Arc<AppState>,
}

impl HttpServer {
    /// Create a new HTTP server
    pub fn new(
        config: ApiConfig,
        node_id: String,
        admin: AdminService,
        monitor: Option<Arc<MonitorStats>>,
    ) -> Self {
        let state = Arc::new(AppState {
            node_id,
            admin,
            monitor,
            started_at: Instant::now(),
        });

        Self { config, state }
    }

    /// Get the state for sharing with other components
    pub fn state(&self) -> Arc<AppState> {
        Arc::clone(&self.state)
    }

    /// Create the router
    fn create_router(state: Arc<AppState>) -> Router {
        Router::new()
            // Status
            .route("/health", get(handle_health))
            .route("/stats", get(handle_stats))
            // Backends
            .route("/backends", get(handle_list_backends).post(handle_insert_backend))
            .route(
                "/backends/:ndx",
                patch(handle_update_backend).delete(handle_delete_backend),
            )
            .route("/groups", get(handle_groups))
            // Sharding
            .route("/sharding/vdbs", get(handle_list_vdbs).post(handle_create_vdb))
            .route(
                "/sharding/tables",
                get(handle_list_tables).post(handle_create_table),
            )
            .route(
                "/sharding/single-tables",
                get(handle_list_single_tables).post(handle_create_single_table),
            )
            .route("/sharding/reload", post(handle_reload_sharding))
            // Persistence
            .route("/settings/save", post(handle_save_settings))
            .with_state(state)
    }

    /// Start the HTTP server
    pub async fn start(&self) -> Result<()> {
        if !self.config.enabled {
            tracing::info!("HTTP API disabled");
            return Ok(());
        }

        let mut app = Self::create_router(Arc::clone(&self.state)).layer(TraceLayer::new_for_http());
        if self.config.cors_enabled {
            app = app.layer(CorsLayer::permissive());
        }

        let listener = tokio::net::TcpListener::bind(&self.config.bind_address).await?;
        tracing::info!("HTTP API listening on {}", self.config.bind_address);

        axum::serve(listener, app)
            .await
            .map_err(|e| Error::Network(format!("HTTP server error: {}", e)))?;

        Ok(())
    }
}

// ============ Request/Response Types ============

/// Insert backend request
#[derive(Debug, Deserialize, Serialize)]
pub struct InsertBackendRequest {
    /// "addr[#weight][@group]"
    pub address: String,
    #[serde(rename = "type")]
    pub kind: String,
    pub state: Option<String>,
}

/// Update backend request
#[derive(Debug, Default, Deserialize, Serialize)]
pub struct UpdateBackendRequest {
    #[serde(rename = "type")]
    pub kind: Option<String>,
    pub state: Option<String>,
}

/// Sharded table request
#[derive(Debug, Deserialize, Serialize)]
pub struct CreateTableRequest {
    pub db: String,
    pub table: String,
    pub pkey: String,
    pub vdb: i64,
}

/// Single table request
#[derive(Debug, Deserialize, Serialize)]
pub struct CreateSingleTableRequest {
    pub db: String,
    pub table: String,
    pub group: String,
}

/// Health response
#[derive(Debug, Serialize)]
pub struct HealthResponse {
    pub healthy: bool,
    pub node_id: String,
    pub backends: usize,
    pub has_writer: bool,
}

/// Stats response
#[derive(Debug, Serialize)]
pub struct StatsResponse {
    pub node_id: String,
    pub uptime_seconds: u64,
    pub backends: usize,
    pub ro_backends: usize,
    pub groups: usize,
    pub connections: ConnectionStats,
    pub vdbs: usize,
    pub sharded_tables: usize,
    pub monitor: Option<MonitorStatsSnapshot>,
}

/// Error response
#[derive(Debug, Serialize)]
pub struct ErrorResponse {
    pub error: String,
    pub code: String,
}

fn status_of(error: &Error) -> StatusCode {
    match error {
        Error::BackendNotFound(_) | Error::UnknownVdb(_) => StatusCode::NOT_FOUND,
        Error::DuplicateBackend(_)
        | Error::SecondMaster(_)
        | Error::StateConflict(_)
        | Error::DuplicateVdb(_)
        | Error::DuplicateTable(_) => StatusCode::CONFLICT,
        Error::InvalidParameter(_)
        | Error::InvalidVdb { .. }
        | Error::UnknownGroup(_)
        | Error::Sharding(_)
        | Error::Json(_)
        | Error::AddressResolution(_) => StatusCode::BAD_REQUEST,
        Error::Timeout(_) => StatusCode::GATEWAY_TIMEOUT,
        _ => StatusCode::INTERNAL_SERVER_ERROR,
    }
}

fn error_response(error: Error) -> Response {
    tracing::warn!("Admin request failed: {}", error);
    (
        status_of(&error),
        Json(ErrorResponse {
            error: error.to_string(),
            code: error.code().to_string(),
        }),
    )
        .into_response()
}

fn reply<T: Serialize>(result: Result<T>) -> Response {
    match result {
        Ok(body) => Json(body).into_response(),
        Err(e) => error_response(e),
    }
}

// ============ Handlers ============

async fn handle_health(State(state): State<Arc<AppState>>) -> impl IntoResponse {
    let ctx = state.admin.context();
    Json(HealthResponse {
        healthy: true,
        node_id: state.node_id.clone(),
        backends: ctx.registry().count(),
        has_writer: ctx.registry().pick_rw().is_some(),
    })
}

async fn handle_stats(State(state): State<Arc<AppState>>) -> impl IntoResponse {
    let ctx = state.admin.context();
    Json(StatsResponse {
        node_id: state.node_id.clone(),
        uptime_seconds: state.started_at.elapsed().as_secs(),
        backends: ctx.registry().count(),
        ro_backends: ctx.registry().ro_count(),
        groups: ctx.registry().group_count(),
        connections: state.admin.connection_stats(),
        vdbs: ctx.sharding().vdbs().len(),
        sharded_tables: ctx.sharding().sharded_tables().len(),
        monitor: state.monitor.as_ref().map(|m| m.snapshot()),
    })
}

async fn handle_list_backends(State(state): State<Arc<AppState>>) -> impl IntoResponse {
    Json(state.admin.select_all_backends())
}

async fn handle_insert_backend(
    State(state): State<Arc<AppState>>,
    Json(req): Json<InsertBackendRequest>,
) -> Response {
    let parsed = (|| -> Result<(BackendType, BackendState)> {
        let kind: BackendType = req.kind.parse()?;
        let backend_state = match &req.state {
            Some(s) => s.parse()?,
            None => BackendState::Unknown,
        };
        Ok((kind, backend_state))
    })();
    let result = match parsed {
        Ok((kind, backend_state)) => state.admin.insert_backend(&req.address, kind, backend_state).await,
        Err(e) => Err(e),
    };

    match result {
        Ok(outcome) => (StatusCode::CREATED, Json(outcome)).into_response(),
        Err(e) => error_response(e),
    }
}

async fn handle_update_backend(
    State(state): State<Arc<AppState>>,
    Path(ndx): Path<String>,
    Json(req): Json<UpdateBackendRequest>,
) -> Response {
    reply((|| -> Result<Outcome> {
        let selector: BackendSelector = ndx.parse()?;
        let kind = req.kind.as_deref().map(str::parse::<BackendType>).transpose()?;
        let backend_state = req.state.as_deref().map(str::parse::<BackendState>).transpose()?;
        state.admin.update_backend(&selector, kind, backend_state)
    })())
}

async fn handle_delete_backend(
    State(state): State<Arc<AppState>>,
    Path(ndx): Path<String>,
) -> Response {
    reply(ndx.parse::<BackendSelector>().and_then(|selector| state.admin.delete_backend(&selector)))
}

async fn handle_groups(State(state): State<Arc<AppState>>) -> impl IntoResponse {
    Json(state.admin.select_all_groups())
}

async fn handle_list_vdbs(State(state): State<Arc<AppState>>) -> impl IntoResponse {
    Json(state.admin.select_vdb())
}

async fn handle_create_vdb(
    State(state): State<Arc<AppState>>,
    Json(definition): Json<serde_json::Value>,
) -> Response {
    reply(state.admin.create_vdb(&definition))
}

async fn handle_list_tables(State(state): State<Arc<AppState>>) -> impl IntoResponse {
    Json(state.admin.select_sharded_tables())
}

async fn handle_create_table(
    State(state): State<Arc<AppState>>,
    Json(req): Json<CreateTableRequest>,
) -> Response {
    reply(
        state
            .admin
            .create_sharded_table(&req.db, &req.table, &req.pkey, req.vdb),
    )
}

async fn handle_list_single_tables(State(state): State<Arc<AppState>>) -> impl IntoResponse {
    Json(state.admin.select_single_tables())
}

async fn handle_create_single_table(
    State(state): State<Arc<AppState>>,
    Json(req): Json<CreateSingleTableRequest>,
) -> Response {
    reply(state.admin.create_single_table(&req.db, &req.table, &req.group))
}

async fn handle_reload_sharding(State(state): State<Arc<AppState>>) -> Response {
    reply(state.admin.reload_sharding().await)
}

async fn handle_save_settings(State(state): State<Arc<AppState>>) -> Response {
    reply(state.admin.save_settings().await)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::backend::BackendRegistry;
    use crate::context::{ContextSettings, ProxyContext};
    use crate::pool::PoolLimits;
    use crate::sharding::ShardingConfig;
    use crate::store::{ObjectStore, SqliteStore};
    use axum::body::Body;
    use axum::http::{Method, Request};
    use http_body_util::BodyExt;
    use serde_json::{json, Value};
    use tower::ServiceExt;

    fn router() -> Router {
        let registry = Arc::new(BackendRegistry::new(false, PoolLimits::default()));
        let sharding = Arc::new(ShardingConfig::new(false));
        let store: Arc<dyn ObjectStore> = Arc::new(SqliteStore::in_memory().unwrap());
        let ctx = ProxyContext::new(registry, sharding, store, ContextSettings::default());
        let server = HttpServer::new(
            ApiConfig::default(),
            "gate-1".into(),
            AdminService::new(Arc::new(ctx)),
            Some(Arc::new(MonitorStats::default())),
        );
        HttpServer::create_router(server.state())
    }

    async fn call(app: &Router, method: Method, uri: &str, body: Option<Value>) -> (StatusCode, Value) {
        let request = Request::builder().method(method).uri(uri);
        let request = match body {
            Some(json) => request
                .header("content-type", "application/json")
                .body(Body::from(json.to_string()))
                .unwrap(),
            None => request.body(Body::empty()).unwrap(),
        };
        let response = app.clone().oneshot(request).await.unwrap();
        let status = response.status();
        let bytes = response.into_body().collect().await.unwrap().to_bytes();
        let value = if bytes.is_empty() {
            Value::Null
        } else {
            serde_json::from_slice(&bytes).unwrap()
        };
        (status, value)
    }

    #[tokio::test]
    async fn test_health_and_stats() {
        let app = router();
        let (status, body) = call(&app, Method::GET, "/health", None).await;
        assert_eq!(status, StatusCode::OK);
        assert_eq!(body["node_id"], "gate-1");
        assert_eq!(body["has_writer"], false);

        let (status, body) = call(&app, Method::GET, "/stats", None).await;
        assert_eq!(status, StatusCode::OK);
        assert_eq!(body["backends"], 0);
        assert_eq!(body["monitor"]["ticks"], 0);
    }

    #[tokio::test]
    async fn test_backend_lifecycle() {
        let app = router();
        let (status, _) = call(
            &app,
            Method::POST,
            "/backends",
            Some(json!({"address": "127.0.0.1:3306@g1", "type": "RW", "state": "up"})),
        )
        .await;
        assert_eq!(status, StatusCode::CREATED);

        let (status, body) = call(
            &app,
            Method::POST,
            "/backends",
            Some(json!({"address": "127.0.0.1:3307@g1", "type": "rw"})),
        )
        .await;
        assert_eq!(status, StatusCode::CONFLICT);
        assert_eq!(body["code"], "SECOND_MASTER");

        let (status, body) = call(
            &app,
            Method::PATCH,
            "/backends/1",
            Some(json!({"state": "Maintaining"})),
        )
        .await;
        assert_eq!(status, StatusCode::OK);
        assert_eq!(body["affected_rows"], 1);

        let (_, body) = call(&app, Method::GET, "/backends", None).await;
        assert_eq!(body["rows"][0][2], "maintaining");

        let (status, _) = call(&app, Method::DELETE, "/backends/127.0.0.1:3306", None).await;
        assert_eq!(status, StatusCode::OK);
        let (status, body) = call(&app, Method::DELETE, "/backends/1", None).await;
        assert_eq!(status, StatusCode::NOT_FOUND);
        assert_eq!(body["code"], "NO_SUCH_BACKEND");
    }

    #[tokio::test]
    async fn test_bad_state_rejected() {
        let app = router();
        let (status, body) = call(
            &app,
            Method::POST,
            "/backends",
            Some(json!({"address": "127.0.0.1:3306", "type": "ro", "state": "sleepy"})),
        )
        .await;
        assert_eq!(status, StatusCode::BAD_REQUEST);
        assert_eq!(body["code"], "PARAMETER");
    }

    #[tokio::test]
    async fn test_sharding_routes() {
        let app = router();
        call(
            &app,
            Method::POST,
            "/backends",
            Some(json!({"address": "127.0.0.1:3306@g1", "type": "rw"})),
        )
        .await;

        let vdb = json!({"id": 1, "type": "int", "method": "hash", "num": 2, "partitions": {"g1": [0]}});
        let (status, _) = call(&app, Method::POST, "/sharding/vdbs", Some(vdb)).await;
        assert_eq!(status, StatusCode::BAD_REQUEST);

        let vdb = json!({"id": 1, "type": "int", "method": "hash", "num": 2, "partitions": {"g1": [0, 1]}});
        let (status, _) = call(&app, Method::POST, "/sharding/vdbs", Some(vdb)).await;
        assert_eq!(status, StatusCode::OK);

        let table = json!({"db": "shop", "table": "orders", "pkey": "id", "vdb": 1});
        let (status, _) = call(&app, Method::POST, "/sharding/tables", Some(table)).await;
        assert_eq!(status, StatusCode::OK);

        let single = json!({"db": "shop", "table": "config", "group": "g1"});
        let (status, _) = call(&app, Method::POST, "/sharding/single-tables", Some(single)).await;
        assert_eq!(status, StatusCode::OK);

        let (_, body) = call(&app, Method::GET, "/sharding/tables", None).await;
        assert_eq!(body["rows"][0][0], "shop.orders");
        let (_, body) = call(&app, Method::GET, "/sharding/vdbs", None).await;
        assert_eq!(body["rows"][0][1], "hash");

        // Nothing saved yet
        let (status, _) = call(&app, Method::POST, "/sharding/reload", None).await;
        assert_eq!(status, StatusCode::BAD_REQUEST);

        let (status, body) = call(&app, Method::POST, "/settings/save", None).await;
        assert_eq!(status, StatusCode::OK);
        assert_eq!(body["affected_rows"], 1);
    }
}
