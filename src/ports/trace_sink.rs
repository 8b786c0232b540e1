use chrono::{DateTime, Utc};
use http::StatusCode;

/// TraceSink is the port for the span-export collaborator. The recovery
/// middleware opens one span per request and finalizes it exactly once. When
/// no sink is configured the middleware falls back to diagnostic logging.
pub trait TraceSink: Send + Sync + 'static {
    fn start_span(&self, method: &str, path: &str) -> Box<dyn RequestSpan>;
}

/// Handle to one in-flight request span.
pub trait RequestSpan: Send {
    /// Normal completion: status plus the (decompressed) response body as a
    /// diagnostic attribute.
    fn record_success(&mut self, status: StatusCode, response_body: &str);

    /// Contained fault: description, formatted stack capture, and the instant
    /// the fault was observed.
    fn record_error(&mut self, description: &str, stack: &str, at: DateTime<Utc>);

    /// Called exactly once after one of the record methods.
    fn finish(&mut self);
}
