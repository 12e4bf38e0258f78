pub mod engine;
pub mod router;
pub mod upstream;

pub use engine::Gateway;
pub use router::{Route, RouteTable};
pub use upstream::{Backend, BackendSnapshot, HealthStatus, UpstreamTable};

/// Per-request context threaded through the forwarding path, mostly
/// for logging.
#[derive(Debug, Clone)]
pub struct ForwardContext {
    pub request_id: String,
    pub client_ip: std::net::IpAddr,
    pub method: axum::http::Method,
    pub inbound_path: String,
    pub backend: String,
    pub outbound_url: String,
    pub start_time: std::time::Instant,
}

/// Upstream response after header filtering, ready to relay.
#[derive(Debug)]
pub struct UpstreamResponse {
    pub status: axum::http::StatusCode,
    pub headers: axum::http::HeaderMap,
    pub body: bytes::Bytes,
    pub attempts: u32,
}
