#![allow(dead_code)]

use std::collections::HashMap;
use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;

use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::TcpListener;

use api_gateway::config::{
    AdminConfig, BackendConfig, ClientConfig, Config, MetricsConfig, RouteConfig, ServerConfig,
};
use api_gateway::{Gateway, MetricsCollector};

pub fn backend(base_url: &str) -> BackendConfig {
    BackendConfig {
        base_url: base_url.to_string(),
        timeout: Duration::from_secs(5),
        retry: 1,
        failure_threshold: 3,
        cooldown: Duration::from_secs(30),
    }
}

pub fn route(prefix: &str, backend: &str) -> RouteConfig {
    RouteConfig {
        prefix: prefix.to_string(),
        backend: backend.to_string(),
        rewrite: None,
    }
}

pub fn config(backends: Vec<(&str, BackendConfig)>, routes: Vec<RouteConfig>) -> Config {
    Config {
        server: ServerConfig {
            host: "127.0.0.1".to_string(),
            port: 8080,
        },
        client: ClientConfig::default(),
        backends: backends
            .into_iter()
            .map(|(name, backend)| (name.to_string(), backend))
            .collect::<HashMap<_, _>>(),
        routes,
        metrics: MetricsConfig::default(),
        admin: AdminConfig::default(),
    }
}

/// Serve a gateway built from `config` on an ephemeral port.
pub async fn spawn_gateway(config: &Config) -> (SocketAddr, Arc<Gateway>) {
    let metrics = Arc::new(MetricsCollector::new(&config.metrics).expect("metrics collector"));
    let gateway = Arc::new(Gateway::new(config, metrics).expect("gateway"));

    let listener = TcpListener::bind("127.0.0.1:0").await.expect("bind");
    let addr = listener.local_addr().expect("local addr");
    let app = gateway.router();
    tokio::spawn(async move {
        axum::serve(
            listener,
            app.into_make_service_with_connect_info::<SocketAddr>(),
        )
        .await
        .expect("serve");
    });

    (addr, gateway)
}

/// A base URL nothing listens on: bound, resolved, released.
pub async fn unreachable_url() -> String {
    let listener = TcpListener::bind("127.0.0.1:0").await.expect("bind");
    let addr = listener.local_addr().expect("local addr");
    drop(listener);
    format!("http://{}", addr)
}

/// Minimal HTTP/1.1 backend that answers every connection with a
/// canned byte response and closes the socket. For behaviors wiremock
/// cannot express (hop-by-hop response headers, truncated bodies).
pub async fn spawn_raw_backend(response: &'static [u8]) -> SocketAddr {
    let listener = TcpListener::bind("127.0.0.1:0").await.expect("bind");
    let addr = listener.local_addr().expect("local addr");
    tokio::spawn(async move {
        loop {
            let Ok((mut socket, _)) = listener.accept().await else {
                return;
            };
            tokio::spawn(async move {
                if read_request_head(&mut socket).await.is_err() {
                    return;
                }
                let _ = socket.write_all(response).await;
                let _ = socket.shutdown().await;
            });
        }
    });
    addr
}

/// Read from the socket until the end of the request headers.
pub async fn read_request_head(socket: &mut tokio::net::TcpStream) -> std::io::Result<Vec<u8>> {
    let mut head = Vec::new();
    let mut chunk = [0u8; 1024];
    loop {
        let n = socket.read(&mut chunk).await?;
        if n == 0 {
            return Err(std::io::ErrorKind::UnexpectedEof.into());
        }
        head.extend_from_slice(&chunk[..n]);
        if head.windows(4).any(|w| w == b"\r\n\r\n") {
            return Ok(head);
        }
    }
}

/// Write `config` to a unique file under the system temp directory.
pub fn write_temp_config(config: &Config) -> String {
    let path = std::env::temp_dir().join(format!(
        "api-gateway-test-{}.yaml",
        uuid::Uuid::new_v4()
    ));
    std::fs::write(&path, serde_yaml::to_string(config).expect("serialize config"))
        .expect("write config");
    path.to_str().expect("utf-8 path").to_string()
}
