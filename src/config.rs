use anyhow::{Context, Result};
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::time::Duration;

/// Main configuration structure
#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct Config {
    pub server: ServerConfig,
    #[serde(default)]
    pub client: ClientConfig,
    pub backends: HashMap<String, BackendConfig>,
    pub routes: Vec<RouteConfig>,
    #[serde(default)]
    pub metrics: MetricsConfig,
    #[serde(default)]
    pub admin: AdminConfig,
}

#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct ServerConfig {
    pub host: String,
    pub port: u16,
}

/// Outbound HTTP client settings, shared by all backends.
#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct ClientConfig {
    #[serde(default = "default_connect_timeout", with = "duration_serde")]
    pub connect_timeout: Duration,
    #[serde(default = "default_pool_max_idle_per_host")]
    pub pool_max_idle_per_host: usize,
    #[serde(default = "default_pool_idle_timeout", with = "duration_serde")]
    pub pool_idle_timeout: Duration,
}

impl Default for ClientConfig {
    fn default() -> Self {
        Self {
            connect_timeout: default_connect_timeout(),
            pool_max_idle_per_host: default_pool_max_idle_per_host(),
            pool_idle_timeout: default_pool_idle_timeout(),
        }
    }
}

/// A single upstream service the gateway can forward to.
#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct BackendConfig {
    pub base_url: String,
    /// Overall deadline for one inbound request against this backend,
    /// shared across retries.
    #[serde(default = "default_timeout", with = "duration_serde")]
    pub timeout: Duration,
    /// Extra attempts after a connection-establishment failure.
    /// Only idempotent methods are retried.
    #[serde(default = "default_retry")]
    pub retry: u32,
    /// Consecutive failures before the backend is marked unhealthy.
    #[serde(default = "default_failure_threshold")]
    pub failure_threshold: u32,
    /// How long an unhealthy backend is short-circuited before re-probing.
    #[serde(default = "default_cooldown", with = "duration_serde")]
    pub cooldown: Duration,
}

#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct RouteConfig {
    /// Path prefix matched against the inbound request path (plain string
    /// prefix; the longest configured prefix wins).
    pub prefix: String,
    /// Name of the backend in `backends`.
    pub backend: String,
    /// Replacement for the matched prefix on the outbound path.
    /// Absent means the prefix is stripped.
    #[serde(default)]
    pub rewrite: Option<String>,
}

#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct MetricsConfig {
    #[serde(default)]
    pub enabled: bool,
    #[serde(default = "default_aux_host")]
    pub host: String,
    #[serde(default = "default_metrics_port")]
    pub port: u16,
    #[serde(default = "default_metrics_path")]
    pub path: String,
}

impl Default for MetricsConfig {
    fn default() -> Self {
        Self {
            enabled: false,
            host: default_aux_host(),
            port: default_metrics_port(),
            path: default_metrics_path(),
        }
    }
}

#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct AdminConfig {
    #[serde(default)]
    pub enabled: bool,
    #[serde(default = "default_aux_host")]
    pub host: String,
    #[serde(default = "default_admin_port")]
    pub port: u16,
}

impl Default for AdminConfig {
    fn default() -> Self {
        Self {
            enabled: false,
            host: default_aux_host(),
            port: default_admin_port(),
        }
    }
}

fn default_connect_timeout() -> Duration {
    Duration::from_secs(5)
}

fn default_pool_max_idle_per_host() -> usize {
    16
}

fn default_pool_idle_timeout() -> Duration {
    Duration::from_secs(90)
}

fn default_timeout() -> Duration {
    Duration::from_secs(10)
}

fn default_retry() -> u32 {
    1
}

fn default_failure_threshold() -> u32 {
    3
}

fn default_cooldown() -> Duration {
    Duration::from_secs(30)
}

fn default_aux_host() -> String {
    "0.0.0.0".to_string()
}

fn default_metrics_port() -> u16 {
    9090
}

fn default_metrics_path() -> String {
    "/metrics".to_string()
}

fn default_admin_port() -> u16 {
    9901
}

impl Config {
    /// Load configuration from file
    pub async fn load(path: &str) -> Result<Self> {
        let content = tokio::fs::read_to_string(path)
            .await
            .with_context(|| format!("Failed to read config file: {}", path))?;

        let config: Config = serde_yaml::from_str(&content)
            .with_context(|| format!("Failed to parse config file: {}", path))?;

        config.validate()?;
        Ok(config)
    }

    /// Validate configuration
    pub fn validate(&self) -> Result<()> {
        if self.server.port == 0 {
            anyhow::bail!("Server port cannot be zero");
        }

        if self.backends.is_empty() {
            anyhow::bail!("At least one backend must be configured");
        }

        for (name, backend) in &self.backends {
            let url = reqwest::Url::parse(&backend.base_url)
                .with_context(|| format!("Invalid base_url for backend '{}'", name))?;
            if !matches!(url.scheme(), "http" | "https") {
                anyhow::bail!(
                    "Backend '{}' base_url must be http or https, got '{}'",
                    name,
                    url.scheme()
                );
            }
            if url.host_str().is_none() {
                anyhow::bail!("Backend '{}' base_url is missing a host", name);
            }
            if backend.timeout.is_zero() {
                anyhow::bail!("Backend '{}' timeout cannot be zero", name);
            }
            if backend.failure_threshold == 0 {
                anyhow::bail!("Backend '{}' failure_threshold cannot be zero", name);
            }
        }

        if self.routes.is_empty() {
            anyhow::bail!("At least one route must be configured");
        }

        let mut seen = std::collections::HashSet::new();
        for route in &self.routes {
            if !route.prefix.starts_with('/') {
                anyhow::bail!("Route prefix '{}' must start with '/'", route.prefix);
            }
            if !seen.insert(route.prefix.as_str()) {
                anyhow::bail!("Duplicate route prefix: {}", route.prefix);
            }
            if !self.backends.contains_key(&route.backend) {
                anyhow::bail!(
                    "Route '{}' references unknown backend: {}",
                    route.prefix,
                    route.backend
                );
            }
            if let Some(rewrite) = &route.rewrite {
                if !rewrite.starts_with('/') {
                    anyhow::bail!(
                        "Route '{}' rewrite '{}' must start with '/'",
                        route.prefix,
                        rewrite
                    );
                }
            }
        }

        Ok(())
    }
}

mod duration_serde {
    use serde::{Deserialize, Deserializer, Serializer};
    use std::time::Duration;

    pub fn serialize<S>(duration: &Duration, serializer: S) -> Result<S::Ok, S::Error>
    where
        S: Serializer,
    {
        if duration.subsec_millis() > 0 {
            serializer.serialize_str(&format!("{}ms", duration.as_millis()))
        } else {
            serializer.serialize_str(&format!("{}s", duration.as_secs()))
        }
    }

    pub fn deserialize<'de, D>(deserializer: D) -> Result<Duration, D::Error>
    where
        D: Deserializer<'de>,
    {
        let s = String::deserialize(deserializer)?;
        parse_duration(&s).map_err(serde::de::Error::custom)
    }

    pub(super) fn parse_duration(
        s: &str,
    ) -> std::result::Result<Duration, Box<dyn std::error::Error + Send + Sync>> {
        if let Some(num) = s.strip_suffix("ms") {
            Ok(Duration::from_millis(num.parse()?))
        } else if let Some(num) = s.strip_suffix('s') {
            Ok(Duration::from_secs(num.parse()?))
        } else if let Some(num) = s.strip_suffix('m') {
            Ok(Duration::from_secs(num.parse::<u64>()? * 60))
        } else if let Some(num) = s.strip_suffix('h') {
            Ok(Duration::from_secs(num.parse::<u64>()? * 3600))
        } else {
            Ok(Duration::from_secs(s.parse()?))
        }
    }
}
