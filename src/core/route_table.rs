//! The route table: an immutable-per-request mapping from (method, path) to a
//! route and its policy bundle.
//!
//! The table owns the per-route mutable state (rate limiter counters, breaker
//! counters) as an arena keyed by table position: every entry carries its own
//! synchronization, so one hot route never stalls another. A configuration
//! reload builds a fresh table and swaps the `Arc` atomically; requests that
//! already loaded the old table keep using it until they finish.
use std::{collections::HashSet, net::IpAddr, sync::Arc};

use http::Method;
use url::Url;

use crate::{
    config::models::{EndpointConfig, GatewayConfig, RouteConfig},
    core::{circuit_breaker::CircuitBreaker, rate_limiter::RouteRateLimiter},
};

/// Inbound path pattern: exact, or a trailing `/*` prefix wildcard.
#[derive(Debug, Clone, PartialEq, Eq)]
enum PathPattern {
    Exact(String),
    /// `/api/*` matches `/api` and anything under `/api/`.
    Prefix(String),
}

impl PathPattern {
    fn parse(pattern: &str) -> Self {
        match pattern.strip_suffix("/*") {
            Some(base) => PathPattern::Prefix(base.to_string()),
            None => PathPattern::Exact(pattern.to_string()),
        }
    }

    fn matches(&self, path: &str) -> bool {
        match self {
            PathPattern::Exact(p) => path == p,
            PathPattern::Prefix(base) => {
                path == base
                    || path
                        .strip_prefix(base.as_str())
                        .is_some_and(|rest| rest.starts_with('/'))
            }
        }
    }
}

/// One backend endpoint with its routes and endpoint-wide policy.
pub struct EndpointEntry {
    pub name: String,
    /// Parsed backend base URL.
    pub addr: Url,
    pub black_ips: HashSet<IpAddr>,
    /// Endpoint-wide limiter, checked before the route-level one.
    pub rate_limiter: Option<RouteRateLimiter>,
    routes: Vec<Arc<RouteEntry>>,
}

/// One routable unit plus its owned policy state.
pub struct RouteEntry {
    pub id: String,
    pub name: String,
    pub method: Method,
    pattern: PathPattern,
    pub proxy_path: String,
    pub auth: crate::config::models::AuthMode,
    pub rate_limiter: Option<RouteRateLimiter>,
    pub breaker: Option<CircuitBreaker>,
}

impl RouteEntry {
    /// Outbound path for a matched inbound path. Exact routes forward the
    /// configured proxy path as-is; wildcard routes carry the matched
    /// remainder over onto it.
    pub fn proxy_path_for(&self, path: &str) -> String {
        match &self.pattern {
            PathPattern::Exact(_) => self.proxy_path.clone(),
            PathPattern::Prefix(base) => {
                let rest = path.strip_prefix(base.as_str()).unwrap_or("");
                let joined = format!("{}{rest}", self.proxy_path.trim_end_matches('/'));
                if joined.is_empty() {
                    "/".to_string()
                } else {
                    joined
                }
            }
        }
    }
}

pub struct RouteTable {
    endpoints: Vec<EndpointEntry>,
}

/// Result of a successful match: the route and its owning endpoint.
pub struct RouteMatch<'a> {
    pub endpoint: &'a EndpointEntry,
    pub route: &'a Arc<RouteEntry>,
}

impl RouteTable {
    /// Build the table, instantiating per-route limiters and breakers.
    /// The configuration is expected to have passed validation already; this
    /// still fails cleanly on anything unparseable.
    pub fn from_config(config: &GatewayConfig) -> Result<Self, String> {
        let endpoints = config
            .endpoints
            .iter()
            .map(Self::build_endpoint)
            .collect::<Result<Vec<_>, _>>()?;
        Ok(Self { endpoints })
    }

    fn build_endpoint(endpoint: &EndpointConfig) -> Result<EndpointEntry, String> {
        let addr = Url::parse(&endpoint.addr)
            .map_err(|e| format!("endpoint '{}': bad addr '{}': {e}", endpoint.name, endpoint.addr))?;

        let rate_limiter = build_limiter(&endpoint.rate_limit)
            .map_err(|e| format!("endpoint '{}': {e}", endpoint.name))?;

        let routes = endpoint
            .routes
            .iter()
            .map(|route| {
                Self::build_route(route)
                    .map(Arc::new)
                    .map_err(|e| format!("route '{}': {e}", route.id))
            })
            .collect::<Result<Vec<_>, _>>()?;

        Ok(EndpointEntry {
            name: endpoint.name.clone(),
            addr,
            black_ips: endpoint.black_ips.iter().copied().collect(),
            rate_limiter,
            routes,
        })
    }

    fn build_route(route: &RouteConfig) -> Result<RouteEntry, String> {
        let method = route
            .method
            .parse::<Method>()
            .map_err(|_| format!("'{}' is not an HTTP method", route.method))?;

        let breaker = match &route.circuit_breaker {
            Some(cb) if cb.enabled => Some(CircuitBreaker::new(cb)?),
            _ => None,
        };

        Ok(RouteEntry {
            id: route.id.clone(),
            name: route.name.clone(),
            method,
            pattern: PathPattern::parse(&route.path),
            proxy_path: route.proxy_path.clone(),
            auth: route.auth,
            rate_limiter: build_limiter(&route.rate_limit)?,
            breaker,
        })
    }

    /// First-match-wins scan: endpoints in configured order, routes within an
    /// endpoint in configured order. Deterministic and read-only; overlapping
    /// patterns are resolved purely by configuration order.
    pub fn match_route(&self, method: &Method, path: &str) -> Option<RouteMatch<'_>> {
        for endpoint in &self.endpoints {
            for route in &endpoint.routes {
                if route.method == *method && route.pattern.matches(path) {
                    return Some(RouteMatch { endpoint, route });
                }
            }
        }
        None
    }

    /// Look a route up by its unique id (used for runtime breaker overrides).
    pub fn route_by_id(&self, id: &str) -> Option<&Arc<RouteEntry>> {
        self.endpoints
            .iter()
            .flat_map(|e| e.routes.iter())
            .find(|r| r.id == id)
    }

    pub fn endpoint_count(&self) -> usize {
        self.endpoints.len()
    }

    pub fn route_count(&self) -> usize {
        self.endpoints.iter().map(|e| e.routes.len()).sum()
    }
}

fn build_limiter(
    config: &Option<crate::config::models::RateLimitConfig>,
) -> Result<Option<RouteRateLimiter>, String> {
    match config {
        Some(rule) if rule.enabled => RouteRateLimiter::new(rule).map(Some),
        _ => Ok(None),
    }
}
