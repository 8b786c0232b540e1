//! Configuration data structures for portcullis.
//!
//! These types map directly to TOML (also JSON / YAML) configuration files. They are
//! intentionally serde‑friendly and include defaults so that minimal configs remain concise.
//! Durations (`period`, `timeout`, `sleep_window`, ...) are humantime strings such as
//! `"250ms"`, `"1s"` or `"5m"` and are parsed when the route table is built.
use std::net::IpAddr;

use serde::{Deserialize, Serialize};

/// Top level gateway configuration: one listener, an ordered list of backend
/// endpoints and an optional static token set for the bundled authenticator.
///
/// Endpoint order is significant: route matching scans endpoints (and the
/// routes inside each endpoint) in configured order and the first match wins,
/// so more specific patterns must be listed first.
#[derive(Debug, Serialize, Deserialize, Clone)]
pub struct GatewayConfig {
    pub listen_addr: String,
    #[serde(default)]
    pub endpoints: Vec<EndpointConfig>,
    #[serde(default)]
    pub auth: Option<AuthConfig>,
    #[serde(default)]
    pub logging: LoggingConfig,
}

impl Default for GatewayConfig {
    fn default() -> Self {
        Self {
            listen_addr: "127.0.0.1:8080".to_string(),
            endpoints: Vec::new(),
            auth: None,
            logging: LoggingConfig::default(),
        }
    }
}

/// Log output configuration.
#[derive(Debug, Serialize, Deserialize, Clone)]
#[serde(default)]
pub struct LoggingConfig {
    /// Filter directive, e.g. `"info"` or `"portcullis=debug,info"`.
    pub level: String,
    /// Emit JSON lines instead of the pretty console format.
    pub json: bool,
}

impl Default for LoggingConfig {
    fn default() -> Self {
        Self {
            level: "info".to_string(),
            json: false,
        }
    }
}

/// One backend service: a network address plus the ordered routes served by it.
#[derive(Debug, Serialize, Deserialize, Clone, Default)]
pub struct EndpointConfig {
    /// Backend base URL, e.g. `http://orders.internal:8080`.
    pub addr: String,
    /// Display name, unique within the configuration.
    pub name: String,
    /// Client IPs rejected before any other policy runs.
    #[serde(default)]
    pub black_ips: Vec<IpAddr>,
    /// Endpoint-wide rate limit applied to every route of this endpoint.
    #[serde(default)]
    pub rate_limit: Option<RateLimitConfig>,
    /// Routes in match order.
    #[serde(default)]
    pub routes: Vec<RouteConfig>,
}

/// One routable unit inside an endpoint.
#[derive(Debug, Serialize, Deserialize, Clone)]
pub struct RouteConfig {
    /// Identifier, unique across the whole route table.
    pub id: String,
    pub name: String,
    /// HTTP method this route answers to (`GET`, `POST`, ...).
    pub method: String,
    /// Inbound pattern: an exact path, or a prefix ending in `/*`.
    pub path: String,
    /// Outbound path sent to the backend.
    pub proxy_path: String,
    #[serde(default)]
    pub auth: AuthMode,
    #[serde(default)]
    pub rate_limit: Option<RateLimitConfig>,
    #[serde(default)]
    pub circuit_breaker: Option<CircuitBreakerConfig>,
}

impl Default for RouteConfig {
    fn default() -> Self {
        Self {
            id: String::new(),
            name: String::new(),
            method: "GET".to_string(),
            path: String::new(),
            proxy_path: String::new(),
            auth: AuthMode::None,
            rate_limit: None,
            circuit_breaker: None,
        }
    }
}

/// Authentication requirement of a route.
#[derive(Debug, Serialize, Deserialize, Clone, Copy, PartialEq, Eq, Default)]
#[serde(rename_all = "snake_case")]
pub enum AuthMode {
    /// No credential required.
    #[default]
    None,
    /// Credential must be valid and the caller authorized for the route.
    VerifyAndAuthorize,
    /// Credential must be valid; authorization is not checked.
    VerifyOnly,
}

/// Algorithm used to enforce the quota semantics.
#[derive(Debug, Serialize, Deserialize, Clone, Copy, PartialEq, Eq, Default)]
#[serde(rename_all = "snake_case")]
pub enum RateLimitAlgorithm {
    #[default]
    TokenBucket,
    FixedWindow,
    SlidingWindow,
}

fn default_enabled() -> bool {
    true
}

fn default_rl_status_code() -> u16 {
    429
}

fn default_rl_message() -> String {
    "Too Many Requests".to_string()
}

/// Rate limit rule attached to a route or an endpoint.
#[derive(Debug, Serialize, Deserialize, Clone)]
pub struct RateLimitConfig {
    /// A disabled rule always admits and never mutates counter state.
    #[serde(default = "default_enabled")]
    pub enabled: bool,
    #[serde(default)]
    pub algorithm: RateLimitAlgorithm,
    pub requests: u64,
    /// Window / replenish period, humantime string.
    pub period: String,
    #[serde(default = "default_rl_status_code")]
    pub status_code: u16,
    /// Returned verbatim as the response body on rejection.
    #[serde(default = "default_rl_message")]
    pub message: String,
}

impl Default for RateLimitConfig {
    fn default() -> Self {
        Self {
            enabled: true,
            algorithm: RateLimitAlgorithm::default(),
            requests: 100,
            period: "1s".to_string(),
            status_code: 429,
            message: default_rl_message(),
        }
    }
}

fn default_max_concurrent() -> u32 {
    10
}

fn default_error_percent() -> u8 {
    50
}

fn default_cb_timeout() -> String {
    "1s".to_string()
}

fn default_volume_threshold() -> u64 {
    20
}

fn default_sleep_window() -> String {
    "5s".to_string()
}

fn default_tracking_window() -> String {
    "10s".to_string()
}

fn default_cb_message() -> String {
    "Service Unavailable".to_string()
}

/// Circuit breaker policy of a route.
#[derive(Debug, Serialize, Deserialize, Clone)]
#[serde(default)]
pub struct CircuitBreakerConfig {
    pub enabled: bool,
    /// Concurrency cap: requests in flight beyond this are shed immediately.
    pub max_concurrent: u32,
    /// Failure percentage at which the breaker trips.
    pub error_percent: u8,
    /// Upper bound on the backend call, humantime string.
    pub timeout: String,
    /// Minimum rolling request count before the trip decision is evaluated.
    pub volume_threshold: u64,
    /// Cooldown after a trip before probe requests are admitted.
    pub sleep_window: String,
    /// Horizon of the rolling success/failure counters.
    pub tracking_window: String,
    /// Manual override: reject everything until unset.
    pub force_open: bool,
    /// Returned verbatim as the response body on open / forced-open rejection.
    pub message: String,
}

impl Default for CircuitBreakerConfig {
    fn default() -> Self {
        Self {
            enabled: true,
            max_concurrent: default_max_concurrent(),
            error_percent: default_error_percent(),
            timeout: default_cb_timeout(),
            volume_threshold: default_volume_threshold(),
            sleep_window: default_sleep_window(),
            tracking_window: default_tracking_window(),
            force_open: false,
            message: default_cb_message(),
        }
    }
}

/// Static token set consumed by the bundled bearer-token authenticator.
#[derive(Debug, Serialize, Deserialize, Clone, Default)]
pub struct AuthConfig {
    /// Token value → grant.
    #[serde(default)]
    pub tokens: std::collections::HashMap<String, TokenGrant>,
}

/// What a known token is allowed to do.
#[derive(Debug, Serialize, Deserialize, Clone)]
pub struct TokenGrant {
    /// Identity reported on the request span.
    pub identity: String,
    /// Whether the token passes `verify_and_authorize` routes.
    #[serde(default)]
    pub authorized: bool,
}
