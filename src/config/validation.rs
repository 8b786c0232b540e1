use std::{collections::HashSet, net::SocketAddr};

use crate::config::models::{
    CircuitBreakerConfig, EndpointConfig, GatewayConfig, RateLimitConfig, RouteConfig,
};

/// Validation result type alias
pub type ValidationResult<T> = Result<T, ValidationError>;

/// Validation error types
#[derive(Debug, thiserror::Error, Clone)]
pub enum ValidationError {
    #[error("Missing required field: {field}")]
    MissingField { field: String },

    #[error("Invalid field '{field}': {message}")]
    InvalidField { field: String, message: String },

    #[error("Invalid listen address '{address}': {reason}")]
    InvalidListenAddress { address: String, reason: String },

    #[error("Duplicate {kind} '{value}'")]
    Duplicate { kind: String, value: String },

    #[error("Validation failed: {message}")]
    ValidationFailed { message: String },
}

/// Gateway configuration validator.
///
/// Collects every problem instead of stopping at the first one so that a
/// broken config file can be fixed in a single pass.
pub struct GatewayConfigValidator;

impl GatewayConfigValidator {
    /// Validate the entire gateway configuration
    pub fn validate(config: &GatewayConfig) -> ValidationResult<()> {
        let mut errors = Vec::new();

        if let Err(e) = Self::validate_listen_address(&config.listen_addr) {
            errors.push(e);
        }

        if config.endpoints.is_empty() {
            errors.push(ValidationError::MissingField {
                field: "endpoints".to_string(),
            });
        }

        let mut endpoint_names = HashSet::new();
        let mut route_ids = HashSet::new();

        for endpoint in &config.endpoints {
            if !endpoint_names.insert(endpoint.name.clone()) {
                errors.push(ValidationError::Duplicate {
                    kind: "endpoint name".to_string(),
                    value: endpoint.name.clone(),
                });
            }
            Self::validate_endpoint(endpoint, &mut route_ids, &mut errors);
        }

        if errors.is_empty() {
            Ok(())
        } else {
            Err(ValidationError::ValidationFailed {
                message: Self::format_multiple_errors(errors),
            })
        }
    }

    /// Validate listen address format
    fn validate_listen_address(address: &str) -> ValidationResult<()> {
        if address.parse::<SocketAddr>().is_err() {
            return Err(ValidationError::InvalidListenAddress {
                address: address.to_string(),
                reason: "Must be in format 'IP:PORT' (e.g., '127.0.0.1:3000' or '0.0.0.0:8080')"
                    .to_string(),
            });
        }
        Ok(())
    }

    fn validate_endpoint(
        endpoint: &EndpointConfig,
        route_ids: &mut HashSet<String>,
        errors: &mut Vec<ValidationError>,
    ) {
        if endpoint.name.is_empty() {
            errors.push(ValidationError::MissingField {
                field: "endpoint.name".to_string(),
            });
        }

        match url::Url::parse(&endpoint.addr) {
            Ok(parsed) => {
                if parsed.scheme() != "http" && parsed.scheme() != "https" {
                    errors.push(ValidationError::InvalidField {
                        field: format!("endpoint '{}' addr", endpoint.name),
                        message: format!("Unsupported scheme '{}'", parsed.scheme()),
                    });
                }
            }
            Err(e) => errors.push(ValidationError::InvalidField {
                field: format!("endpoint '{}' addr", endpoint.name),
                message: format!("'{}' is not a valid URL: {e}", endpoint.addr),
            }),
        }

        if let Some(rl) = &endpoint.rate_limit {
            Self::validate_rate_limit(&endpoint.name, rl, errors);
        }

        if endpoint.routes.is_empty() {
            errors.push(ValidationError::MissingField {
                field: format!("endpoint '{}' routes", endpoint.name),
            });
        }

        for route in &endpoint.routes {
            if !route_ids.insert(route.id.clone()) {
                errors.push(ValidationError::Duplicate {
                    kind: "route id".to_string(),
                    value: route.id.clone(),
                });
            }
            Self::validate_route(&endpoint.name, route, errors);
        }
    }

    fn validate_route(endpoint: &str, route: &RouteConfig, errors: &mut Vec<ValidationError>) {
        let field = |name: &str| format!("endpoint '{endpoint}' route '{}' {name}", route.id);

        if route.id.is_empty() {
            errors.push(ValidationError::MissingField {
                field: field("id"),
            });
        }

        if route.method.parse::<http::Method>().is_err() {
            errors.push(ValidationError::InvalidField {
                field: field("method"),
                message: format!("'{}' is not an HTTP method", route.method),
            });
        }

        for (name, path) in [("path", &route.path), ("proxy_path", &route.proxy_path)] {
            if !path.starts_with('/') {
                errors.push(ValidationError::InvalidField {
                    field: field(name),
                    message: "must start with '/'".to_string(),
                });
            }
        }

        // A wildcard is only meaningful as a trailing "/*" segment.
        if route.path.contains('*') && !route.path.ends_with("/*") {
            errors.push(ValidationError::InvalidField {
                field: field("path"),
                message: "wildcard is only supported as a trailing '/*'".to_string(),
            });
        }

        if let Some(rl) = &route.rate_limit {
            Self::validate_rate_limit(&route.id, rl, errors);
        }

        if let Some(cb) = &route.circuit_breaker {
            Self::validate_circuit_breaker(&route.id, cb, errors);
        }
    }

    fn validate_rate_limit(owner: &str, rl: &RateLimitConfig, errors: &mut Vec<ValidationError>) {
        if rl.requests == 0 {
            errors.push(ValidationError::InvalidField {
                field: format!("'{owner}' rate_limit.requests"),
                message: "must be greater than 0".to_string(),
            });
        }
        if let Err(e) = humantime::parse_duration(&rl.period) {
            errors.push(ValidationError::InvalidField {
                field: format!("'{owner}' rate_limit.period"),
                message: format!("'{}' is not a duration: {e}", rl.period),
            });
        }
        if http::StatusCode::from_u16(rl.status_code).is_err() {
            errors.push(ValidationError::InvalidField {
                field: format!("'{owner}' rate_limit.status_code"),
                message: format!("{} is not a valid status code", rl.status_code),
            });
        }
    }

    fn validate_circuit_breaker(
        owner: &str,
        cb: &CircuitBreakerConfig,
        errors: &mut Vec<ValidationError>,
    ) {
        if cb.max_concurrent == 0 {
            errors.push(ValidationError::InvalidField {
                field: format!("'{owner}' circuit_breaker.max_concurrent"),
                message: "must be greater than 0".to_string(),
            });
        }
        if cb.error_percent > 100 {
            errors.push(ValidationError::InvalidField {
                field: format!("'{owner}' circuit_breaker.error_percent"),
                message: "must be between 0 and 100".to_string(),
            });
        }
        if cb.volume_threshold == 0 {
            errors.push(ValidationError::InvalidField {
                field: format!("'{owner}' circuit_breaker.volume_threshold"),
                message: "must be greater than 0".to_string(),
            });
        }
        for (name, value) in [
            ("timeout", &cb.timeout),
            ("sleep_window", &cb.sleep_window),
            ("tracking_window", &cb.tracking_window),
        ] {
            if let Err(e) = humantime::parse_duration(value) {
                errors.push(ValidationError::InvalidField {
                    field: format!("'{owner}' circuit_breaker.{name}"),
                    message: format!("'{value}' is not a duration: {e}"),
                });
            }
        }
    }

    fn format_multiple_errors(errors: Vec<ValidationError>) -> String {
        errors
            .iter()
            .map(|e| e.to_string())
            .collect::<Vec<_>>()
            .join("; ")
    }
}
