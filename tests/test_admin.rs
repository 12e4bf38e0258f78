//! Admin surface: status endpoints and atomic route reload.

mod common;

use std::net::SocketAddr;
use std::sync::Arc;

use api_gateway::config::AdminConfig;
use api_gateway::{AdminServer, Gateway};
use tokio::net::TcpListener;
use wiremock::matchers::method;
use wiremock::{Mock, MockServer, ResponseTemplate};

async fn spawn_admin(config_path: String, gateway: Arc<Gateway>) -> SocketAddr {
    let admin = AdminServer::new(&AdminConfig::default(), config_path, gateway);
    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let addr = listener.local_addr().unwrap();
    let app = admin.router();
    tokio::spawn(async move {
        axum::serve(listener, app).await.unwrap();
    });
    addr
}

#[tokio::test]
async fn health_and_status_endpoints() {
    let config = common::config(
        vec![
            ("tasks", common::backend("http://127.0.0.1:9")),
            ("users", common::backend("http://127.0.0.1:9")),
        ],
        vec![
            common::route("/api/tasks", "tasks"),
            common::route("/api/users", "users"),
        ],
    );
    let (_addr, gateway) = common::spawn_gateway(&config).await;
    let admin = spawn_admin("unused.yaml".to_string(), gateway).await;

    let body: serde_json::Value = reqwest::get(format!("http://{}/api/health", admin))
        .await
        .unwrap()
        .json()
        .await
        .unwrap();
    assert_eq!(body["status"], "healthy");

    let body: serde_json::Value = reqwest::get(format!("http://{}/api/status", admin))
        .await
        .unwrap()
        .json()
        .await
        .unwrap();
    assert_eq!(body["success"], true);
    assert_eq!(body["data"]["service"], "api-gateway");
    assert_eq!(body["data"]["routes"], 2);
    assert_eq!(
        body["data"]["backends"],
        serde_json::json!(["tasks", "users"])
    );
}

#[tokio::test]
async fn routes_endpoint_lists_longest_prefix_first() {
    let config = common::config(
        vec![("tasks", common::backend("http://127.0.0.1:9"))],
        vec![
            common::route("/api", "tasks"),
            common::route("/api/tasks", "tasks"),
        ],
    );
    let (_addr, gateway) = common::spawn_gateway(&config).await;
    let admin = spawn_admin("unused.yaml".to_string(), gateway).await;

    let body: serde_json::Value = reqwest::get(format!("http://{}/api/routes", admin))
        .await
        .unwrap()
        .json()
        .await
        .unwrap();
    let prefixes: Vec<&str> = body["data"]
        .as_array()
        .unwrap()
        .iter()
        .map(|r| r["prefix"].as_str().unwrap())
        .collect();
    assert_eq!(prefixes, vec!["/api/tasks", "/api"]);
}

#[tokio::test]
async fn backends_endpoint_reflects_health_transitions() {
    let mut dead = common::backend(&common::unreachable_url().await);
    dead.retry = 0;
    dead.failure_threshold = 1;

    let config = common::config(
        vec![("tasks", dead)],
        vec![common::route("/api/tasks", "tasks")],
    );
    let (addr, gateway) = common::spawn_gateway(&config).await;
    let admin = spawn_admin("unused.yaml".to_string(), gateway).await;

    let body: serde_json::Value = reqwest::get(format!("http://{}/api/backends", admin))
        .await
        .unwrap()
        .json()
        .await
        .unwrap();
    assert_eq!(body["data"][0]["status"], "unknown");

    // Trip the backend through the proxy surface.
    let resp = reqwest::get(format!("http://{}/api/tasks/1", addr))
        .await
        .unwrap();
    assert_eq!(resp.status(), 502);

    let body: serde_json::Value =
        reqwest::get(format!("http://{}/api/backends/tasks", admin))
            .await
            .unwrap()
            .json()
            .await
            .unwrap();
    assert_eq!(body["success"], true);
    assert_eq!(body["data"]["status"], "unhealthy");
    assert_eq!(body["data"]["consecutive_failures"], 1);

    let body: serde_json::Value =
        reqwest::get(format!("http://{}/api/backends/nope", admin))
            .await
            .unwrap()
            .json()
            .await
            .unwrap();
    assert_eq!(body["success"], false);
}

#[tokio::test]
async fn reload_swaps_in_new_routes() {
    let users = MockServer::start().await;
    Mock::given(method("GET"))
        .respond_with(ResponseTemplate::new(200).set_body_string("users"))
        .mount(&users)
        .await;

    // Both backends exist from the start; only the tasks route does.
    let mut config = common::config(
        vec![
            ("tasks", common::backend("http://127.0.0.1:9")),
            ("users", common::backend(&users.uri())),
        ],
        vec![common::route("/api/tasks", "tasks")],
    );
    let path = common::write_temp_config(&config);
    let (addr, gateway) = common::spawn_gateway(&config).await;
    let admin = spawn_admin(path.clone(), gateway).await;
    let client = reqwest::Client::new();

    let resp = client
        .get(format!("http://{}/api/users/1", addr))
        .send()
        .await
        .unwrap();
    assert_eq!(resp.status(), 404);

    // Add the users route on disk and reload.
    config.routes.push(common::route("/api/users", "users"));
    std::fs::write(&path, serde_yaml::to_string(&config).unwrap()).unwrap();

    let body: serde_json::Value = client
        .post(format!("http://{}/api/reload", admin))
        .send()
        .await
        .unwrap()
        .json()
        .await
        .unwrap();
    assert_eq!(body["success"], true);
    assert_eq!(body["data"]["routes"], 2);

    let resp = client
        .get(format!("http://{}/api/users/1", addr))
        .send()
        .await
        .unwrap();
    assert_eq!(resp.status(), 200);
    assert_eq!(resp.text().await.unwrap(), "users");

    let _ = std::fs::remove_file(&path);
}

#[tokio::test]
async fn reload_rejects_routes_to_unknown_backends() {
    let mut config = common::config(
        vec![("tasks", common::backend("http://127.0.0.1:9"))],
        vec![common::route("/api/tasks", "tasks")],
    );
    let path = common::write_temp_config(&config);
    let (addr, gateway) = common::spawn_gateway(&config).await;
    let admin = spawn_admin(path.clone(), gateway).await;
    let client = reqwest::Client::new();

    // The new file is self-consistent but names a backend the running
    // gateway was never given.
    config.backends.insert(
        "billing".to_string(),
        common::backend("http://127.0.0.1:9"),
    );
    config.routes.push(common::route("/api/billing", "billing"));
    std::fs::write(&path, serde_yaml::to_string(&config).unwrap()).unwrap();

    let body: serde_json::Value = client
        .post(format!("http://{}/api/reload", admin))
        .send()
        .await
        .unwrap()
        .json()
        .await
        .unwrap();
    assert_eq!(body["success"], false);
    assert!(body["message"].as_str().unwrap().contains("billing"));

    // The old table is still in effect, untouched by the rejection.
    let resp = client
        .get(format!("http://{}/api/billing/1", addr))
        .send()
        .await
        .unwrap();
    assert_eq!(resp.status(), 404);

    let _ = std::fs::remove_file(&path);
}
