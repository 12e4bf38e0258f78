use anyhow::Result;
use axum::{routing::get, Router};
use metrics::{counter, describe_counter, describe_histogram, histogram};
use metrics_exporter_prometheus::{PrometheusBuilder, PrometheusHandle};
use tokio::net::TcpListener;
use tracing::info;

use crate::config::MetricsConfig;
use crate::error::{GatewayError, Result as GatewayResult};

/// Metrics collector that handles all application metrics
pub struct MetricsCollector {
    config: MetricsConfig,
    prometheus_handle: Option<PrometheusHandle>,
}

impl MetricsCollector {
    pub fn new(config: &MetricsConfig) -> Result<Self> {
        let prometheus_handle = if config.enabled {
            let handle = PrometheusBuilder::new()
                .install_recorder()
                .map_err(|e| anyhow::anyhow!("Failed to install Prometheus recorder: {}", e))?;

            Self::register_metrics();
            Some(handle)
        } else {
            None
        };

        Ok(Self {
            config: config.clone(),
            prometheus_handle,
        })
    }

    fn register_metrics() {
        describe_counter!(
            "gateway_requests_total",
            "Requests relayed to a backend, by method, backend and status class"
        );
        describe_histogram!(
            "gateway_request_duration_seconds",
            "End-to-end request duration in seconds, by backend"
        );
        describe_counter!(
            "gateway_errors_total",
            "Requests answered with a gateway-generated error, by code"
        );
        describe_counter!(
            "gateway_upstream_failures_total",
            "Forward attempts that failed, by backend and failure kind"
        );
        describe_counter!(
            "gateway_retries_total",
            "Forward attempts retried after a connect failure, by backend"
        );
        describe_counter!(
            "gateway_short_circuits_total",
            "Requests refused while the backend cooled down, by backend"
        );
        describe_counter!(
            "gateway_route_reloads_total",
            "Route table reloads through the admin API"
        );
    }

    /// Start the metrics server
    pub async fn start_server(&self) -> GatewayResult<()> {
        if !self.config.enabled {
            return Ok(());
        }

        let handle = match &self.prometheus_handle {
            Some(handle) => handle.clone(),
            None => {
                return Err(GatewayError::Internal(
                    "Prometheus handle not available".to_string(),
                ))
            }
        };

        let app = Router::new()
            .route(&self.config.path, get(move || async move { handle.render() }))
            .route("/health", get(|| async { "OK" }));

        let addr = format!("{}:{}", self.config.host, self.config.port);
        let listener = TcpListener::bind(&addr)
            .await
            .map_err(|e| GatewayError::Internal(format!("Failed to bind metrics server: {}", e)))?;

        info!("Metrics server listening on {}{}", addr, self.config.path);

        axum::serve(listener, app)
            .await
            .map_err(|e| GatewayError::Internal(format!("Metrics server error: {}", e)))?;

        Ok(())
    }

    /// Record a relayed request
    pub fn record_request(&self, method: &str, backend: &str, status: u16, duration: f64) {
        if !self.config.enabled {
            return;
        }

        let status_class = match status {
            200..=299 => "2xx",
            300..=399 => "3xx",
            400..=499 => "4xx",
            500..=599 => "5xx",
            _ => "unknown",
        };

        counter!(
            "gateway_requests_total",
            "method" => method.to_string(),
            "backend" => backend.to_string(),
            "status" => status_class
        )
        .increment(1);

        histogram!(
            "gateway_request_duration_seconds",
            "backend" => backend.to_string()
        )
        .record(duration);
    }

    /// Record a gateway-generated error response
    pub fn record_error(&self, code: &'static str) {
        if !self.config.enabled {
            return;
        }

        counter!("gateway_errors_total", "code" => code).increment(1);
    }

    /// Record a failed forward attempt
    pub fn record_upstream_failure(&self, backend: &str, kind: &'static str) {
        if !self.config.enabled {
            return;
        }

        counter!(
            "gateway_upstream_failures_total",
            "backend" => backend.to_string(),
            "kind" => kind
        )
        .increment(1);
    }

    /// Record a retried forward attempt
    pub fn record_retry(&self, backend: &str) {
        if !self.config.enabled {
            return;
        }

        counter!("gateway_retries_total", "backend" => backend.to_string()).increment(1);
    }

    /// Record a request refused during cool-down
    pub fn record_short_circuit(&self, backend: &str) {
        if !self.config.enabled {
            return;
        }

        counter!(
            "gateway_short_circuits_total",
            "backend" => backend.to_string()
        )
        .increment(1);
    }

    /// Record a route table reload
    pub fn record_reload(&self) {
        if !self.config.enabled {
            return;
        }

        counter!("gateway_route_reloads_total").increment(1);
    }
}
