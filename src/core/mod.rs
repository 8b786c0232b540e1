//! Core business logic: route matching and the policy-enforcement pipeline.
//! This layer does no I/O of its own apart from the backend call made
//! through the `HttpClient` port, so it stays easy to test in isolation.

pub mod circuit_breaker;
pub mod dispatcher;
pub mod rate_limiter;
pub mod route_table;

pub use circuit_breaker::{BreakerRejection, BreakerState, CircuitBreaker};
pub use dispatcher::Dispatcher;
pub use rate_limiter::RouteRateLimiter;
pub use route_table::{RouteMatch, RouteTable};
