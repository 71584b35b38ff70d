/* src/state.rs */

use crate::auth::AuthVerifier;
use crate::balancer::Balancer;
use crate::breaker::{BreakerParams, BreakerStore};
use crate::config::AppConfig;
use crate::metrics::Metrics;
use crate::ratelimit::RateLimiterStore;
use crate::registry::Registry;
use crate::routing::RouteTable;
use arc_swap::ArcSwap;
use std::sync::Arc;

pub type HttpClient = hyper_util::client::legacy::Client<
    hyper_rustls::HttpsConnector<hyper_util::client::legacy::connect::HttpConnector>,
    axum::body::Body,
>;

pub struct AppState {
    pub config: Arc<AppConfig>,
    /// Immutable route-table snapshot, atomically swapped on reload.
    pub routes: ArcSwap<RouteTable>,
    pub registry: Arc<Registry>,
    pub balancer: Balancer,
    pub limiter: RateLimiterStore,
    pub breakers: BreakerStore,
    pub breaker_params: BreakerParams,
    /// Present whenever any route requires authentication; enforced at
    /// startup before the server binds.
    pub auth: Option<AuthVerifier>,
    pub metrics: Arc<Metrics>,
    pub http_client: HttpClient,
}
