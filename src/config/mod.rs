pub mod loader;
pub mod models;
pub mod validation;

pub use models::{
    AuthConfig, AuthMode, CircuitBreakerConfig, EndpointConfig, GatewayConfig, LoggingConfig,
    RateLimitAlgorithm, RateLimitConfig, RouteConfig, TokenGrant,
};
