use std::net::{IpAddr, SocketAddr};
use std::sync::Arc;
use std::time::{Duration, Instant};

use anyhow::Result;
use arc_swap::ArcSwap;
use axum::{
    body::Body,
    extract::{ConnectInfo, Request, State},
    http::{header, HeaderMap, HeaderName, Method, StatusCode},
    response::{IntoResponse, Response},
    routing::any,
    Router,
};
use bytes::Bytes;
use http_body_util::BodyExt;
use tokio::net::TcpListener;
use tower::ServiceBuilder;
use tower_http::trace::TraceLayer;
use tracing::{debug, error, info, instrument, warn};
use uuid::Uuid;

use super::{router::RouteTable, upstream::UpstreamTable, ForwardContext, UpstreamResponse};
use crate::config::Config;
use crate::error::{GatewayError, Result as GatewayResult};
use crate::observability::MetricsCollector;

/// Main gateway engine: resolves routes, forwards requests over a
/// pooled client, and relays responses.
pub struct Gateway {
    routes: ArcSwap<RouteTable>,
    upstreams: Arc<UpstreamTable>,
    metrics: Arc<MetricsCollector>,
    http_client: reqwest::Client,
}

#[derive(Clone)]
struct AppState {
    gateway: Arc<Gateway>,
}

/// Why a single forward attempt did not produce a relayable response.
enum ForwardFailure {
    /// Connection could not be established. Retryable.
    Connect(String),
    /// Per-request deadline expired.
    Timeout(String),
    /// Response started but the backend dropped the connection.
    Reset(String),
    /// Anything else the client reported.
    Other(String),
}

impl Gateway {
    pub fn new(config: &Config, metrics: Arc<MetricsCollector>) -> Result<Self> {
        let routes = RouteTable::from_config(&config.routes);
        let upstreams = Arc::new(UpstreamTable::new(&config.backends));

        // Redirect responses are relayed to the client as-is, never
        // followed on their behalf.
        let http_client = reqwest::Client::builder()
            .redirect(reqwest::redirect::Policy::none())
            .connect_timeout(config.client.connect_timeout)
            .pool_idle_timeout(config.client.pool_idle_timeout)
            .pool_max_idle_per_host(config.client.pool_max_idle_per_host)
            .build()
            .map_err(|e| anyhow::anyhow!("Failed to create HTTP client: {}", e))?;

        Ok(Self {
            routes: ArcSwap::from_pointee(routes),
            upstreams,
            metrics,
            http_client,
        })
    }

    /// Build the axum application handled by this gateway.
    pub fn router(self: &Arc<Self>) -> Router {
        let state = AppState {
            gateway: self.clone(),
        };

        // The wildcard route does not match "/", the fallback does.
        Router::new()
            .route("/*path", any(handle_request))
            .fallback(handle_request)
            .layer(
                ServiceBuilder::new()
                    .layer(TraceLayer::new_for_http())
                    .into_inner(),
            )
            .with_state(state)
    }

    /// Bind and serve the proxy listener until the task is cancelled.
    pub async fn start(self: Arc<Self>, host: &str, port: u16) -> GatewayResult<()> {
        let app = self.router();
        let addr = format!("{}:{}", host, port);
        let listener = TcpListener::bind(&addr)
            .await
            .map_err(|e| GatewayError::Internal(format!("Failed to bind to {}: {}", addr, e)))?;

        info!("Gateway listening on {}", addr);

        axum::serve(
            listener,
            app.into_make_service_with_connect_info::<SocketAddr>(),
        )
        .await
        .map_err(|e| GatewayError::Internal(format!("Server error: {}", e)))?;

        Ok(())
    }

    /// Swap in a new route table. Requests already in flight keep the
    /// snapshot they resolved against.
    pub fn reload_routes(&self, table: RouteTable) -> usize {
        let len = table.len();
        self.routes.store(Arc::new(table));
        len
    }

    pub fn route_snapshot(&self) -> Arc<RouteTable> {
        self.routes.load_full()
    }

    pub fn upstreams(&self) -> &UpstreamTable {
        &self.upstreams
    }

    pub fn metrics(&self) -> &MetricsCollector {
        &self.metrics
    }

    /// Process a single inbound request end to end.
    #[instrument(skip_all, fields(request_id))]
    pub async fn handle(&self, req: Request, client_ip: IpAddr) -> GatewayResult<Response> {
        let request_id = Uuid::new_v4().to_string();
        let start_time = Instant::now();
        tracing::Span::current().record("request_id", request_id.as_str());

        let (parts, body) = req.into_parts();
        let path = parts.uri.path().to_string();
        let query = parts.uri.query().map(str::to_string);

        // Resolve against the current route snapshot; the guard is
        // dropped before any await point.
        let (backend_name, outbound_path) = {
            let routes = self.routes.load();
            let route = routes
                .resolve(&path)
                .ok_or_else(|| GatewayError::NoRouteFound(path.clone()))?;
            (route.backend.clone(), route.rewrite_path(&path))
        };

        let backend = self
            .upstreams
            .get(&backend_name)
            .ok_or_else(|| {
                GatewayError::Internal(format!("Route references unknown backend: {}", backend_name))
            })?
            .clone();

        // Admission: refuse without forwarding while the backend cools
        // down.
        if !self.upstreams.is_admitted(&backend.name) {
            self.upstreams.record_short_circuit(&backend.name);
            self.metrics.record_short_circuit(&backend.name);
            warn!(
                request_id = %request_id,
                backend = %backend.name,
                "Short-circuited request, backend cooling down"
            );
            return Err(GatewayError::BackendUnavailable(format!(
                "Backend '{}' is cooling down",
                backend.name
            )));
        }

        let outbound_url = build_outbound_url(&backend.base_url, &outbound_path, query.as_deref());

        let context = ForwardContext {
            request_id,
            client_ip,
            method: parts.method.clone(),
            inbound_path: path,
            backend: backend.name.clone(),
            outbound_url,
            start_time,
        };

        debug!(
            request_id = %context.request_id,
            method = %context.method,
            outbound_url = %context.outbound_url,
            "Forwarding request"
        );

        // Buffer the body up front so a retry can resend it.
        let body_bytes = body
            .collect()
            .await
            .map_err(|e| GatewayError::BadRequest(format!("Failed to read request body: {}", e)))?
            .to_bytes();

        let upstream_response = self
            .forward(&context, &backend, &parts.headers, body_bytes)
            .await?;

        let elapsed = context.start_time.elapsed();
        self.metrics.record_request(
            context.method.as_str(),
            &context.backend,
            upstream_response.status.as_u16(),
            elapsed.as_secs_f64(),
        );

        info!(
            request_id = %context.request_id,
            client_ip = %context.client_ip,
            method = %context.method,
            path = %context.inbound_path,
            backend = %context.backend,
            status = upstream_response.status.as_u16(),
            attempts = upstream_response.attempts,
            elapsed_ms = elapsed.as_millis() as u64,
            "Request completed"
        );

        Ok(relay_response(upstream_response))
    }

    /// Forward with the backend's retry policy under a single deadline
    /// shared by all attempts.
    async fn forward(
        &self,
        context: &ForwardContext,
        backend: &super::upstream::Backend,
        headers: &HeaderMap,
        body: Bytes,
    ) -> GatewayResult<UpstreamResponse> {
        let deadline = Instant::now() + backend.timeout;
        let max_attempts = if is_idempotent(&context.method) {
            backend.retry + 1
        } else {
            1
        };

        let mut attempt = 0u32;
        loop {
            attempt += 1;
            let remaining = deadline.saturating_duration_since(Instant::now());
            if remaining.is_zero() {
                // The attempt that exhausted the deadline already
                // recorded its failure.
                return Err(GatewayError::RequestTimeout(backend.name.clone()));
            }

            match self.send_once(context, headers, body.clone(), remaining).await {
                Ok(mut response) => {
                    self.upstreams.record_success(&backend.name);
                    response.attempts = attempt;
                    return Ok(response);
                }
                Err(ForwardFailure::Connect(reason)) => {
                    self.upstreams.record_failure(&backend.name);
                    self.metrics.record_upstream_failure(&backend.name, "connect");

                    if attempt < max_attempts && self.upstreams.is_admitted(&backend.name) {
                        self.metrics.record_retry(&backend.name);
                        debug!(
                            request_id = %context.request_id,
                            backend = %backend.name,
                            attempt,
                            reason = %reason,
                            "Connect failed, retrying"
                        );
                        continue;
                    }

                    return Err(GatewayError::BackendUnavailable(format!(
                        "{}: {}",
                        backend.name, reason
                    )));
                }
                Err(ForwardFailure::Timeout(_)) => {
                    self.upstreams.record_failure(&backend.name);
                    self.metrics.record_upstream_failure(&backend.name, "timeout");
                    return Err(GatewayError::RequestTimeout(backend.name.clone()));
                }
                Err(ForwardFailure::Reset(reason)) => {
                    // The backend was reachable, so this does not count
                    // toward the failure threshold.
                    self.metrics.record_upstream_failure(&backend.name, "reset");
                    return Err(GatewayError::UpstreamReset(format!(
                        "{}: {}",
                        backend.name, reason
                    )));
                }
                Err(ForwardFailure::Other(reason)) => {
                    self.metrics.record_upstream_failure(&backend.name, "other");
                    return Err(GatewayError::BackendUnavailable(format!(
                        "{}: {}",
                        backend.name, reason
                    )));
                }
            }
        }
    }

    /// One attempt against the backend: build the outbound request,
    /// send it, and buffer the response.
    async fn send_once(
        &self,
        context: &ForwardContext,
        headers: &HeaderMap,
        body: Bytes,
        remaining: Duration,
    ) -> std::result::Result<UpstreamResponse, ForwardFailure> {
        let mut request = self
            .http_client
            .request(context.method.clone(), &context.outbound_url)
            .timeout(remaining);

        // Relay end-to-end headers. Host and Content-Length are
        // regenerated by the client for the outbound connection.
        for (name, value) in headers.iter() {
            if is_hop_by_hop_header(name)
                || name == header::HOST
                || name == header::CONTENT_LENGTH
                || is_forwarding_header(name)
            {
                continue;
            }
            request = request.header(name.clone(), value.clone());
        }

        let client_ip = context.client_ip.to_string();
        request = request
            .header("x-forwarded-for", forwarded_for_value(headers, &client_ip))
            .header("x-forwarded-proto", "http")
            .header("x-real-ip", &client_ip)
            .header("x-request-id", &context.request_id);

        if !body.is_empty() {
            request = request.body(body);
        }

        let response = request.send().await.map_err(classify_send_error)?;

        let status = response.status();
        let headers = filter_response_headers(response.headers());

        // The per-request timeout keeps running while the body streams
        // in, so a stalled body still surfaces as a timeout.
        let body = response.bytes().await.map_err(|e| {
            if e.is_timeout() {
                ForwardFailure::Timeout(e.to_string())
            } else {
                ForwardFailure::Reset(e.to_string())
            }
        })?;

        Ok(UpstreamResponse {
            status,
            headers,
            body,
            attempts: 0,
        })
    }
}

async fn handle_request(
    State(state): State<AppState>,
    ConnectInfo(addr): ConnectInfo<SocketAddr>,
    req: Request,
) -> Response {
    match state.gateway.handle(req, addr.ip()).await {
        Ok(response) => response,
        Err(e) => {
            state.gateway.metrics().record_error(e.error_code());
            warn!(code = e.error_code(), "{}", e);
            e.into_response()
        }
    }
}

fn classify_send_error(e: reqwest::Error) -> ForwardFailure {
    // Connect timeouts report both is_connect and is_timeout; they are
    // connection-establishment failures, so check is_connect first.
    if e.is_connect() {
        ForwardFailure::Connect(e.to_string())
    } else if e.is_timeout() {
        ForwardFailure::Timeout(e.to_string())
    } else {
        ForwardFailure::Other(e.to_string())
    }
}

/// Build the relayed response from a buffered upstream response.
fn relay_response(upstream: UpstreamResponse) -> Response {
    let mut builder = Response::builder().status(upstream.status);

    for (name, value) in upstream.headers.iter() {
        builder = builder.header(name, value);
    }

    builder
        .body(Body::from(upstream.body))
        .unwrap_or_else(|e| {
            error!("Failed to build response: {}", e);
            StatusCode::INTERNAL_SERVER_ERROR.into_response()
        })
}

fn build_outbound_url(base_url: &str, path: &str, query: Option<&str>) -> String {
    match query {
        Some(q) => format!("{}{}?{}", base_url, path, q),
        None => format!("{}{}", base_url, path),
    }
}

/// Existing X-Forwarded-For chain with the connecting client appended.
fn forwarded_for_value(headers: &HeaderMap, client_ip: &str) -> String {
    match headers
        .get("x-forwarded-for")
        .and_then(|v| v.to_str().ok())
        .filter(|v| !v.is_empty())
    {
        Some(existing) => format!("{}, {}", existing, client_ip),
        None => client_ip.to_string(),
    }
}

/// Drop connection-level headers from a response before relaying it.
/// Content-Length is recomputed for the buffered body.
fn filter_response_headers(headers: &HeaderMap) -> HeaderMap {
    let mut filtered = HeaderMap::with_capacity(headers.len());
    for (name, value) in headers.iter() {
        if is_hop_by_hop_header(name) || name == header::CONTENT_LENGTH {
            continue;
        }
        filtered.append(name.clone(), value.clone());
    }
    filtered
}

/// Hop-by-hop headers (RFC 7230 §6.1) that describe a single
/// connection and must not cross the proxy.
fn is_hop_by_hop_header(name: &HeaderName) -> bool {
    matches!(
        name.as_str(),
        "connection"
            | "keep-alive"
            | "proxy-authenticate"
            | "proxy-authorization"
            | "te"
            | "trailer"
            | "trailers"
            | "transfer-encoding"
            | "upgrade"
    )
}

/// Headers the gateway owns on the outbound leg.
fn is_forwarding_header(name: &HeaderName) -> bool {
    matches!(
        name.as_str(),
        "x-forwarded-for" | "x-forwarded-proto" | "x-real-ip" | "x-request-id"
    )
}

/// Methods safe to retry after a connection-establishment failure.
fn is_idempotent(method: &Method) -> bool {
    matches!(
        method.as_str(),
        "GET" | "HEAD" | "PUT" | "DELETE" | "OPTIONS"
    )
}

#[cfg(test)]
mod tests {
    use super::*;
    use axum::http::HeaderValue;

    #[test]
    fn hop_by_hop_headers_are_recognized() {
        for name in [
            "connection",
            "keep-alive",
            "proxy-authenticate",
            "proxy-authorization",
            "te",
            "trailer",
            "trailers",
            "transfer-encoding",
            "upgrade",
        ] {
            assert!(
                is_hop_by_hop_header(&HeaderName::from_static(name)),
                "{name} should be hop-by-hop"
            );
        }

        for name in ["content-type", "authorization", "accept", "set-cookie"] {
            assert!(
                !is_hop_by_hop_header(&HeaderName::from_static(name)),
                "{name} should be relayed"
            );
        }
    }

    #[test]
    fn idempotent_methods() {
        assert!(is_idempotent(&Method::GET));
        assert!(is_idempotent(&Method::HEAD));
        assert!(is_idempotent(&Method::PUT));
        assert!(is_idempotent(&Method::DELETE));
        assert!(is_idempotent(&Method::OPTIONS));

        assert!(!is_idempotent(&Method::POST));
        assert!(!is_idempotent(&Method::PATCH));
    }

    #[test]
    fn outbound_url_preserves_query_verbatim() {
        assert_eq!(
            build_outbound_url("http://tasks:8081", "/7", Some("page=2&q=a%20b")),
            "http://tasks:8081/7?page=2&q=a%20b"
        );
        assert_eq!(
            build_outbound_url("http://tasks:8081", "/", None),
            "http://tasks:8081/"
        );
    }

    #[test]
    fn forwarded_for_appends_to_existing_chain() {
        let mut headers = HeaderMap::new();
        headers.insert(
            "x-forwarded-for",
            HeaderValue::from_static("10.0.0.1, 10.0.0.2"),
        );
        assert_eq!(
            forwarded_for_value(&headers, "192.168.1.9"),
            "10.0.0.1, 10.0.0.2, 192.168.1.9"
        );
    }

    #[test]
    fn forwarded_for_starts_new_chain() {
        let headers = HeaderMap::new();
        assert_eq!(forwarded_for_value(&headers, "192.168.1.9"), "192.168.1.9");
    }

    #[test]
    fn response_filter_drops_connection_headers() {
        let mut headers = HeaderMap::new();
        headers.insert("content-type", HeaderValue::from_static("application/json"));
        headers.insert("connection", HeaderValue::from_static("keep-alive"));
        headers.insert("transfer-encoding", HeaderValue::from_static("chunked"));
        headers.insert("content-length", HeaderValue::from_static("42"));
        headers.insert("x-service-version", HeaderValue::from_static("1.2.3"));

        let filtered = filter_response_headers(&headers);
        assert_eq!(
            filtered.get("content-type").unwrap(),
            &HeaderValue::from_static("application/json")
        );
        assert_eq!(
            filtered.get("x-service-version").unwrap(),
            &HeaderValue::from_static("1.2.3")
        );
        assert!(filtered.get("connection").is_none());
        assert!(filtered.get("transfer-encoding").is_none());
        assert!(filtered.get("content-length").is_none());
    }

    #[test]
    fn response_filter_keeps_repeated_headers() {
        let mut headers = HeaderMap::new();
        headers.append("set-cookie", HeaderValue::from_static("a=1"));
        headers.append("set-cookie", HeaderValue::from_static("b=2"));

        let filtered = filter_response_headers(&headers);
        let cookies: Vec<_> = filtered.get_all("set-cookie").iter().collect();
        assert_eq!(cookies.len(), 2);
    }
}
