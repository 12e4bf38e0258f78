pub mod admin;
pub mod config;
pub mod error;
pub mod observability;
pub mod proxy;

pub use admin::AdminServer;
pub use config::Config;
pub use error::{GatewayError, Result};
pub use observability::MetricsCollector;
pub use proxy::{Gateway, Route, RouteTable, UpstreamTable};
