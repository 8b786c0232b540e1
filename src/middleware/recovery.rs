//! Panic containment for the request pipeline.
//!
//! Every request runs under `catch_unwind`: a panicking handler produces a
//! generic 500 for the client while the process keeps serving. The panic
//! description and formatted stack go to the request span (when a trace sink
//! is configured) or to the diagnostic log, never to the client.
use std::{io::Read, panic::AssertUnwindSafe, sync::Arc};

use axum::{
    body::Body,
    extract::Request,
    http::header,
    middleware::Next,
    response::{IntoResponse, Response},
};
use futures_util::FutureExt;
use http_body_util::BodyExt;

use crate::{
    diagnostics::{self, StackCapture},
    error::GatewayError,
    ports::trace_sink::TraceSink,
};

/// Run one request under panic containment, finalizing the request span
/// exactly once on every path.
pub async fn recovery_middleware(
    req: Request,
    next: Next,
    sink: Option<Arc<dyn TraceSink>>,
) -> Response {
    let method = req.method().to_string();
    let path = req.uri().path().to_string();

    let mut span = sink.as_ref().map(|s| s.start_span(&method, &path));

    let outcome = AssertUnwindSafe(next.run(req)).catch_unwind().await;

    match outcome {
        Ok(response) => {
            let response = match span.as_mut() {
                Some(span) => {
                    // Body attachment requires buffering, so only pay for it
                    // when a sink is actually installed.
                    let (parts, body) = response.into_parts();
                    match body.collect().await {
                        Ok(collected) => {
                            let bytes = collected.to_bytes();
                            let text = readable_body(&parts.headers, &bytes);
                            span.record_success(parts.status, &text);
                            Response::from_parts(parts, Body::from(bytes))
                        }
                        Err(e) => {
                            span.record_success(parts.status, &format!("<unreadable body: {e}>"));
                            Response::from_parts(parts, Body::empty())
                        }
                    }
                }
                None => response,
            };
            if let Some(span) = span.as_mut() {
                span.finish();
            }
            response
        }
        Err(payload) => {
            let (description, stack) = match diagnostics::take_last_panic() {
                Some(report) => (report.description, report.stack),
                // The hook should have fired; fall back to the payload alone.
                None => (describe_payload(payload.as_ref()), StackCapture::default()),
            };

            match span.as_mut() {
                Some(span) => {
                    span.record_error(&description, &stack.to_string(), chrono::Utc::now());
                    span.finish();
                }
                None => {
                    tracing::error!(
                        description = %description,
                        stack = %stack,
                        "contained a panicking handler"
                    );
                }
            }

            GatewayError::UnhandledFault.into_response()
        }
    }
}

/// Cloneable closure wrapping [`recovery_middleware`] for `from_fn`.
pub fn create_recovery_middleware(
    sink: Option<Arc<dyn TraceSink>>,
) -> impl Fn(Request, Next) -> std::pin::Pin<Box<dyn std::future::Future<Output = Response> + Send>>
+ Clone {
    move |req, next| {
        let sink = sink.clone();
        Box::pin(async move { recovery_middleware(req, next, sink).await })
    }
}

/// Response body as text for span attachment, transparently inflating
/// gzip-encoded payloads.
fn readable_body(headers: &http::HeaderMap, bytes: &[u8]) -> String {
    let gzipped = headers
        .get(header::CONTENT_ENCODING)
        .and_then(|v| v.to_str().ok())
        .is_some_and(|v| v.eq_ignore_ascii_case("gzip"));

    if gzipped {
        let mut inflated = String::new();
        let mut decoder = flate2::read::GzDecoder::new(bytes);
        if decoder.read_to_string(&mut inflated).is_ok() {
            return inflated;
        }
        return "<undecodable gzip body>".to_string();
    }

    String::from_utf8_lossy(bytes).into_owned()
}

fn describe_payload(payload: &(dyn std::any::Any + Send)) -> String {
    if let Some(s) = payload.downcast_ref::<&str>() {
        (*s).to_string()
    } else if let Some(s) = payload.downcast_ref::<String>() {
        s.clone()
    } else {
        "panic with non-string payload".to_string()
    }
}

#[cfg(test)]
mod tests {
    use std::{
        io::Write,
        sync::{Arc, Mutex},
    };

    use axum::{Router, http::StatusCode, middleware, routing::get};
    use chrono::{DateTime, Utc};
    use tower::ServiceExt;

    use super::*;
    use crate::{error::GENERIC_FAULT_BODY, ports::trace_sink::RequestSpan};

    #[derive(Default)]
    struct Recorded {
        success: Option<(StatusCode, String)>,
        error: Option<(String, String)>,
        finished: bool,
    }

    struct RecordingSink(Arc<Mutex<Recorded>>);

    impl TraceSink for RecordingSink {
        fn start_span(&self, _method: &str, _path: &str) -> Box<dyn RequestSpan> {
            Box::new(RecordingSpan(self.0.clone()))
        }
    }

    struct RecordingSpan(Arc<Mutex<Recorded>>);

    impl RequestSpan for RecordingSpan {
        fn record_success(&mut self, status: StatusCode, response_body: &str) {
            self.0.lock().unwrap().success = Some((status, response_body.to_string()));
        }

        fn record_error(&mut self, description: &str, stack: &str, _at: DateTime<Utc>) {
            self.0.lock().unwrap().error = Some((description.to_string(), stack.to_string()));
        }

        fn finish(&mut self) {
            self.0.lock().unwrap().finished = true;
        }
    }

    fn app_with_sink(
        handler_router: Router,
        recorded: Arc<Mutex<Recorded>>,
    ) -> Router {
        let sink: Arc<dyn TraceSink> = Arc::new(RecordingSink(recorded));
        handler_router.layer(middleware::from_fn(create_recovery_middleware(Some(sink))))
    }

    // Panicking handlers are plain `async fn`s: a diverging closure body has
    // no inferable response type.
    async fn exploding() -> &'static str {
        panic!("handler exploded")
    }

    async fn quiet_fault() -> &'static str {
        panic!("quiet fault")
    }

    #[tokio::test]
    async fn panicking_handler_becomes_generic_500() {
        crate::diagnostics::install_panic_capture();
        let recorded = Arc::new(Mutex::new(Recorded::default()));
        let app = app_with_sink(
            Router::new().route("/boom", get(exploding)),
            recorded.clone(),
        );

        let response = app
            .oneshot(Request::builder().uri("/boom").body(Body::empty()).unwrap())
            .await
            .unwrap();

        assert_eq!(response.status(), StatusCode::INTERNAL_SERVER_ERROR);
        let body = response.into_body().collect().await.unwrap().to_bytes();
        assert_eq!(&body[..], GENERIC_FAULT_BODY.as_bytes());

        let recorded = recorded.lock().unwrap();
        let (description, _stack) = recorded.error.as_ref().expect("error recorded");
        assert!(description.contains("handler exploded"));
        assert!(recorded.finished);
        assert!(recorded.success.is_none());
    }

    #[tokio::test]
    async fn success_records_status_and_body() {
        let recorded = Arc::new(Mutex::new(Recorded::default()));
        let app = app_with_sink(
            Router::new().route("/ok", get(|| async { "hello there" })),
            recorded.clone(),
        );

        let response = app
            .oneshot(Request::builder().uri("/ok").body(Body::empty()).unwrap())
            .await
            .unwrap();

        assert_eq!(response.status(), StatusCode::OK);
        // The buffered body is re-attached unchanged.
        let body = response.into_body().collect().await.unwrap().to_bytes();
        assert_eq!(&body[..], b"hello there");

        let recorded = recorded.lock().unwrap();
        let (status, body) = recorded.success.as_ref().expect("success recorded");
        assert_eq!(*status, StatusCode::OK);
        assert_eq!(body, "hello there");
        assert!(recorded.finished);
    }

    #[tokio::test]
    async fn gzip_bodies_are_inflated_for_the_span() {
        let recorded = Arc::new(Mutex::new(Recorded::default()));
        let app = app_with_sink(
            Router::new().route(
                "/gz",
                get(|| async {
                    let mut encoder =
                        flate2::write::GzEncoder::new(Vec::new(), flate2::Compression::default());
                    encoder.write_all(b"compressed payload").unwrap();
                    Response::builder()
                        .header(header::CONTENT_ENCODING, "gzip")
                        .body(Body::from(encoder.finish().unwrap()))
                        .unwrap()
                }),
            ),
            recorded.clone(),
        );

        let response = app
            .oneshot(Request::builder().uri("/gz").body(Body::empty()).unwrap())
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::OK);

        let recorded = recorded.lock().unwrap();
        let (_, body) = recorded.success.as_ref().expect("success recorded");
        assert_eq!(body, "compressed payload");
    }

    #[tokio::test]
    async fn no_sink_means_no_buffering_and_still_contains_panics() {
        crate::diagnostics::install_panic_capture();
        let app = Router::new()
            .route("/ok", get(|| async { "fine" }))
            .route("/boom", get(quiet_fault))
            .layer(middleware::from_fn(create_recovery_middleware(None)));

        let ok = app
            .clone()
            .oneshot(Request::builder().uri("/ok").body(Body::empty()).unwrap())
            .await
            .unwrap();
        assert_eq!(ok.status(), StatusCode::OK);

        let boom = app
            .oneshot(Request::builder().uri("/boom").body(Body::empty()).unwrap())
            .await
            .unwrap();
        assert_eq!(boom.status(), StatusCode::INTERNAL_SERVER_ERROR);
    }
}
