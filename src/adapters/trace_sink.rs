use chrono::{DateTime, Utc};
use http::StatusCode;

use crate::ports::trace_sink::{RequestSpan, TraceSink};

/// Span exporter backed by the `tracing` subscriber. Each request span is
/// emitted as structured events under an `info_span`, so the JSON log layer
/// (or any subscriber installed by the binary) receives the same fields an
/// external trace collector would.
pub struct TracingSink;

impl TraceSink for TracingSink {
    fn start_span(&self, method: &str, path: &str) -> Box<dyn RequestSpan> {
        let span = tracing::info_span!(
            "request",
            http.method = %method,
            http.path = %path,
        );
        Box::new(TracingRequestSpan {
            span,
            finished: false,
        })
    }
}

struct TracingRequestSpan {
    span: tracing::Span,
    finished: bool,
}

impl RequestSpan for TracingRequestSpan {
    fn record_success(&mut self, status: StatusCode, response_body: &str) {
        let _guard = self.span.enter();
        tracing::info!(
            http.status_code = status.as_u16(),
            response.body = %response_body,
            description = "ok",
            "request completed"
        );
    }

    fn record_error(&mut self, description: &str, stack: &str, at: DateTime<Utc>) {
        let _guard = self.span.enter();
        tracing::error!(
            description = %description,
            stack = %stack,
            observed_at = %at.to_rfc3339(),
            "request faulted"
        );
    }

    fn finish(&mut self) {
        self.finished = true;
    }
}

impl Drop for TracingRequestSpan {
    fn drop(&mut self) {
        if !self.finished {
            let _guard = self.span.enter();
            tracing::warn!("request span dropped without finish");
        }
    }
}
