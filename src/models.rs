/* src/models.rs */

use serde::Deserialize;

/// How a route's `path` is interpreted when matching requests.
#[derive(Debug, Deserialize, Clone, Copy, PartialEq, Eq)]
#[serde(rename_all = "lowercase")]
pub enum MatchKind {
    Exact,
    Prefix,
    Regex,
}

impl Default for MatchKind {
    fn default() -> Self {
        MatchKind::Prefix
    }
}

/// What a rate-limit bucket is keyed by.
#[derive(Debug, Deserialize, Clone, Copy, PartialEq, Eq)]
#[serde(rename_all = "lowercase")]
pub enum RateKey {
    /// One bucket per route pattern and client IP.
    Ip,
    /// One bucket shared by all clients of the route.
    Route,
}

impl Default for RateKey {
    fn default() -> Self {
        RateKey::Ip
    }
}

/// A rate-limit rule: `requests` per `period`, with an optional burst
/// capacity above the sustained rate. `requests = 0` disables the limit.
#[derive(Debug, Deserialize, Clone)]
pub struct RateLimitRule {
    pub requests: u32,
    #[serde(default = "default_period")]
    pub period: String,
    pub burst: Option<u32>,
    #[serde(default)]
    pub key: RateKey,
}

fn default_period() -> String {
    "1s".to_string()
}

/// Circuit-breaker thresholds, applied per backend address.
#[derive(Debug, Deserialize, Clone)]
pub struct BreakerRule {
    #[serde(default = "default_breaker_window")]
    pub window: usize,
    #[serde(default = "default_breaker_threshold")]
    pub failure_threshold: u32,
    #[serde(default = "default_breaker_cooldown")]
    pub cooldown_secs: u64,
    #[serde(default = "default_breaker_trials")]
    pub trial_limit: u32,
}

impl Default for BreakerRule {
    fn default() -> Self {
        BreakerRule {
            window: default_breaker_window(),
            failure_threshold: default_breaker_threshold(),
            cooldown_secs: default_breaker_cooldown(),
            trial_limit: default_breaker_trials(),
        }
    }
}

fn default_breaker_window() -> usize {
    10
}

fn default_breaker_threshold() -> u32 {
    5
}

fn default_breaker_cooldown() -> u64 {
    30
}

fn default_breaker_trials() -> u32 {
    1
}

/// Gateway-wide defaults, overridable per route.
#[derive(Debug, Deserialize, Clone)]
pub struct DefaultsConfig {
    pub rate_limit: Option<RateLimitRule>,
    #[serde(default)]
    pub breaker: BreakerRule,
    #[serde(default = "default_timeout_ms")]
    pub timeout_ms: u64,
    #[serde(default = "default_retries")]
    pub retries: u32,
    /// Request bodies above this many bytes stream through without
    /// buffering and are dispatched exactly once.
    #[serde(default = "default_stream_threshold")]
    pub stream_threshold: u64,
}

impl Default for DefaultsConfig {
    fn default() -> Self {
        DefaultsConfig {
            rate_limit: None,
            breaker: BreakerRule::default(),
            timeout_ms: default_timeout_ms(),
            retries: default_retries(),
            stream_threshold: default_stream_threshold(),
        }
    }
}

fn default_timeout_ms() -> u64 {
    10_000
}

fn default_retries() -> u32 {
    1
}

fn default_stream_threshold() -> u64 {
    256 * 1024
}

/// How the registry learns about backend instances.
#[derive(Debug, Deserialize, Clone, Copy, PartialEq, Eq)]
#[serde(rename_all = "lowercase")]
pub enum RegistryMode {
    /// Instances come from `[[services]]`; the refresher health-probes them.
    Static,
    /// Instances are pulled from a discovery endpoint as a JSON snapshot.
    Http,
}

#[derive(Debug, Deserialize, Clone)]
pub struct RegistryConfig {
    pub mode: RegistryMode,
    /// Discovery endpoint, required in `http` mode.
    pub endpoint: Option<String>,
    #[serde(default = "default_heartbeat_secs")]
    pub heartbeat_secs: u64,
    /// Consecutive missed heartbeats before an instance goes DOWN.
    #[serde(default = "default_miss_threshold")]
    pub miss_threshold: u32,
    #[serde(default = "default_health_path")]
    pub health_path: String,
}

fn default_heartbeat_secs() -> u64 {
    10
}

fn default_miss_threshold() -> u32 {
    3
}

fn default_health_path() -> String {
    "/health".to_string()
}

/// A statically configured backend instance.
#[derive(Debug, Deserialize, Clone)]
pub struct InstanceConfig {
    pub address: String,
    #[serde(default = "default_weight")]
    pub weight: u32,
}

fn default_weight() -> u32 {
    1
}

#[derive(Debug, Deserialize, Clone)]
pub struct ServiceConfig {
    pub name: String,
    pub instances: Vec<InstanceConfig>,
}

/// A single routing rule.
#[derive(Debug, Deserialize, Clone)]
pub struct RouteConfig {
    pub path: String,
    #[serde(rename = "match", default)]
    pub match_kind: MatchKind,
    /// Empty means all methods.
    #[serde(default)]
    pub methods: Vec<String>,
    /// Logical service name the route dispatches to.
    pub service: String,
    #[serde(default = "default_auth")]
    pub auth: bool,
    pub timeout_ms: Option<u64>,
    pub retries: Option<u32>,
    /// Overrides the method-based idempotency heuristic for retries.
    pub retry_safe: Option<bool>,
    pub rate_limit: Option<RateLimitRule>,
}

fn default_auth() -> bool {
    true
}

/// Top-level structure of `config.toml`.
#[derive(Debug, Deserialize, Clone)]
pub struct MainConfig {
    pub registry: RegistryConfig,
    #[serde(default)]
    pub services: Vec<ServiceConfig>,
    #[serde(default)]
    pub defaults: DefaultsConfig,
    #[serde(default)]
    pub routes: Vec<RouteConfig>,
}
