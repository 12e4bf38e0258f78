use std::sync::Arc;
use std::time::Instant;

use axum::{
    extract::{Path, State},
    response::{IntoResponse, Json},
    routing::{get, post},
    Router,
};
use serde::Serialize;
use serde_json::json;
use tokio::net::TcpListener;
use tracing::{info, warn};

use crate::config::{AdminConfig, Config};
use crate::error::{GatewayError, Result as GatewayResult};
use crate::proxy::{Gateway, RouteTable};

/// Admin server: read-only status endpoints plus a route reload
/// trigger, served on its own listener.
pub struct AdminServer {
    config: AdminConfig,
    config_path: String,
    gateway: Arc<Gateway>,
}

#[derive(Clone)]
struct AdminState {
    config_path: String,
    gateway: Arc<Gateway>,
    started_at: Instant,
}

#[derive(Debug, Serialize)]
struct ApiResponse<T> {
    success: bool,
    data: Option<T>,
    message: Option<String>,
    timestamp: chrono::DateTime<chrono::Utc>,
}

impl<T> ApiResponse<T> {
    fn success(data: T) -> Self {
        Self {
            success: true,
            data: Some(data),
            message: None,
            timestamp: chrono::Utc::now(),
        }
    }

    fn error(message: String) -> Self {
        Self {
            success: false,
            data: None,
            message: Some(message),
            timestamp: chrono::Utc::now(),
        }
    }
}

#[derive(Debug, Serialize)]
struct RouteEntry {
    prefix: String,
    backend: String,
    rewrite: Option<String>,
}

impl AdminServer {
    pub fn new(config: &AdminConfig, config_path: String, gateway: Arc<Gateway>) -> Self {
        Self {
            config: config.clone(),
            config_path,
            gateway,
        }
    }

    pub fn router(&self) -> Router {
        let state = AdminState {
            config_path: self.config_path.clone(),
            gateway: self.gateway.clone(),
            started_at: Instant::now(),
        };

        Router::new()
            .route("/api/health", get(health_check))
            .route("/api/status", get(get_status))
            .route("/api/routes", get(get_routes))
            .route("/api/backends", get(get_backends))
            .route("/api/backends/:name", get(get_backend))
            .route("/api/reload", post(reload_routes))
            .with_state(state)
    }

    /// Start the admin server
    pub async fn start(&self) -> GatewayResult<()> {
        let app = self.router();
        let addr = format!("{}:{}", self.config.host, self.config.port);
        let listener = TcpListener::bind(&addr)
            .await
            .map_err(|e| GatewayError::Internal(format!("Failed to bind admin server: {}", e)))?;

        info!("Admin server listening on {}", addr);

        axum::serve(listener, app)
            .await
            .map_err(|e| GatewayError::Internal(format!("Admin server error: {}", e)))?;

        Ok(())
    }
}

async fn health_check() -> impl IntoResponse {
    Json(json!({
        "status": "healthy",
        "timestamp": chrono::Utc::now(),
    }))
}

async fn get_status(State(state): State<AdminState>) -> impl IntoResponse {
    let status = json!({
        "service": "api-gateway",
        "version": env!("CARGO_PKG_VERSION"),
        "status": "running",
        "uptime_seconds": state.started_at.elapsed().as_secs(),
        "routes": state.gateway.route_snapshot().len(),
        "backends": state.gateway.upstreams().backend_names(),
    });
    Json(ApiResponse::success(status))
}

async fn get_routes(State(state): State<AdminState>) -> impl IntoResponse {
    let routes: Vec<RouteEntry> = state
        .gateway
        .route_snapshot()
        .routes()
        .iter()
        .map(|r| RouteEntry {
            prefix: r.prefix.clone(),
            backend: r.backend.clone(),
            rewrite: r.rewrite.clone(),
        })
        .collect();
    Json(ApiResponse::success(routes))
}

async fn get_backends(State(state): State<AdminState>) -> impl IntoResponse {
    Json(ApiResponse::success(state.gateway.upstreams().snapshot_all()))
}

async fn get_backend(
    State(state): State<AdminState>,
    Path(name): Path<String>,
) -> impl IntoResponse {
    match state.gateway.upstreams().snapshot(&name) {
        Some(snapshot) => Json(ApiResponse::success(snapshot)),
        None => Json(ApiResponse::error(format!("Unknown backend: {}", name))),
    }
}

/// Re-read the config file and swap in a fresh route table. The
/// backend set is fixed at startup, so a reload that maps a route to
/// a backend the gateway does not know is rejected as a whole.
async fn reload_routes(State(state): State<AdminState>) -> impl IntoResponse {
    let config = match Config::load(&state.config_path).await {
        Ok(config) => config,
        Err(e) => {
            warn!("Route reload rejected: {:#}", e);
            return Json(ApiResponse::error(format!("Reload failed: {:#}", e)));
        }
    };

    for route in &config.routes {
        if state.gateway.upstreams().get(&route.backend).is_none() {
            warn!(
                prefix = %route.prefix,
                backend = %route.backend,
                "Route reload rejected: backend not present at startup"
            );
            return Json(ApiResponse::error(format!(
                "Route '{}' references backend '{}' which was not configured at startup",
                route.prefix, route.backend
            )));
        }
    }

    let count = state
        .gateway
        .reload_routes(RouteTable::from_config(&config.routes));
    state.gateway.metrics().record_reload();

    info!(routes = count, "Route table reloaded via admin API");
    Json(ApiResponse::success(json!({ "routes": count })))
}
