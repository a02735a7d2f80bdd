//! OpenAperture Router: an HTTP/1.1 reverse proxy whose route table is
//! reconciled from a remote control-plane service.

pub mod config;
pub mod error;
pub mod health;
pub mod observability;
pub mod proxy;
pub mod routes;

pub use config::Config;
pub use error::RouterError;
pub use proxy::{AppState, ProxyEngine};
pub use routes::{RouteCache, RouteRefresher};
