//! Request dispatch: route match, policy enforcement, proxy call.
//!
//! Every inbound request walks the same pipeline. Steps 1-5 produce typed
//! rejections that are never retried; only step 6 talks to the network:
//!
//! 1. match a route (404 on miss, nothing else runs)
//! 2. reject clients on the owning endpoint's black list
//! 3. auth, when the route requires it
//! 4. rate limit, endpoint-wide first, then per route
//! 5. circuit breaker admission (state + concurrency cap)
//! 6. forward to the backend, bounded by the breaker timeout
//! 7. record the outcome into the breaker
//!
//! A rate-limit or capacity rejection never touches breaker statistics; a
//! cancelled call (client gone before the backend answered) releases its
//! permit without recording, keeping the trip decision unskewed.
use std::{net::IpAddr, sync::Arc};

use arc_swap::ArcSwap;
use axum::body::Body;
use http::{HeaderValue, Request, Response, Uri};
use tokio::time::timeout;

use crate::{
    config::models::AuthMode,
    core::route_table::{RouteMatch, RouteTable},
    error::GatewayError,
    ports::{auth::Authenticator, http_client::HttpClient},
};

pub struct Dispatcher {
    table: Arc<ArcSwap<RouteTable>>,
    http_client: Arc<dyn HttpClient>,
    authenticator: Arc<dyn Authenticator>,
}

impl Dispatcher {
    pub fn new(
        table: Arc<ArcSwap<RouteTable>>,
        http_client: Arc<dyn HttpClient>,
        authenticator: Arc<dyn Authenticator>,
    ) -> Self {
        Self {
            table,
            http_client,
            authenticator,
        }
    }

    /// Run the pipeline and always produce a response; typed rejections are
    /// converted here, logged at a level matching their severity.
    pub async fn dispatch(&self, req: Request<Body>, client_ip: Option<IpAddr>) -> Response<Body> {
        let method = req.method().clone();
        let path = req.uri().path().to_string();

        match self.dispatch_inner(req, client_ip).await {
            Ok(response) => response,
            Err(err) => {
                match &err {
                    GatewayError::BackendTimeout { .. } | GatewayError::BackendConnection(_) => {
                        tracing::warn!(%method, %path, error = %err, "backend call failed");
                    }
                    _ => {
                        tracing::debug!(%method, %path, rejection = %err, "request rejected");
                    }
                }
                axum::response::IntoResponse::into_response(err)
            }
        }
    }

    async fn dispatch_inner(
        &self,
        req: Request<Body>,
        client_ip: Option<IpAddr>,
    ) -> Result<Response<Body>, GatewayError> {
        // The table reference is immutable for the whole request; a reload
        // swaps the Arc without disturbing requests already in flight.
        let table = self.table.load_full();

        let method = req.method().clone();
        let path = req.uri().path().to_string();

        let matched = table
            .match_route(&method, &path)
            .ok_or(GatewayError::RouteNotFound)?;

        if let Some(ip) = client_ip
            && matched.endpoint.black_ips.contains(&ip)
        {
            return Err(GatewayError::BlockedClient(ip));
        }

        if matched.route.auth != AuthMode::None {
            let decision = self
                .authenticator
                .authenticate(req.headers(), matched.route.auth)
                .await;
            if !decision.valid {
                return Err(GatewayError::InvalidCredential);
            }
            if !decision.satisfies(matched.route.auth) {
                return Err(GatewayError::NotAuthorized);
            }
            if let Some(identity) = &decision.identity {
                tracing::debug!(route = %matched.route.id, %identity, "authenticated");
            }
        }

        // Endpoint-wide limit first, then the route's own. A rejection here
        // is not a backend failure: breaker state stays untouched.
        for limiter in [
            matched.endpoint.rate_limiter.as_ref(),
            matched.route.rate_limiter.as_ref(),
        ]
        .into_iter()
        .flatten()
        {
            if !limiter.allow() {
                return Err(limiter.rejection());
            }
        }

        let backend_req = build_backend_request(req, &matched, client_ip)?;
        self.forward(backend_req, &matched).await
    }

    async fn forward(
        &self,
        req: Request<Body>,
        matched: &RouteMatch<'_>,
    ) -> Result<Response<Body>, GatewayError> {
        let Some(breaker) = &matched.route.breaker else {
            return self
                .http_client
                .send_request(req)
                .await
                .map_err(|e| GatewayError::BackendConnection(e.to_string()));
        };

        let permit = breaker
            .try_acquire()
            .map_err(|why| breaker.rejection(why))?;
        let bound = breaker.timeout();

        match timeout(bound, self.http_client.send_request(req)).await {
            Ok(Ok(response)) => {
                permit.record_success();
                Ok(response)
            }
            Ok(Err(e)) => {
                permit.record_failure();
                Err(GatewayError::BackendConnection(e.to_string()))
            }
            Err(_elapsed) => {
                permit.record_timeout();
                Err(GatewayError::BackendTimeout {
                    timeout_ms: bound.as_millis() as u64,
                })
            }
        }
    }
}

/// Rewrite the request toward the backend: endpoint address, route proxy
/// path (wildcard remainder preserved), original query string, forwarded-for
/// header. The Host header is set by the client adapter from the URI.
fn build_backend_request(
    mut req: Request<Body>,
    matched: &RouteMatch<'_>,
    client_ip: Option<IpAddr>,
) -> Result<Request<Body>, GatewayError> {
    let addr = &matched.endpoint.addr;
    let proxy_path = matched.route.proxy_path_for(req.uri().path());

    let mut target = format!("{}://{}{}", addr.scheme(), addr.authority(), proxy_path);
    if let Some(query) = req.uri().query() {
        target.push('?');
        target.push_str(query);
    }

    let uri: Uri = target
        .parse()
        .map_err(|e| GatewayError::BackendConnection(format!("invalid backend uri: {e}")))?;
    *req.uri_mut() = uri;

    if let Some(ip) = client_ip
        && let Ok(value) = HeaderValue::from_str(&ip.to_string())
    {
        req.headers_mut().insert("X-Forwarded-For", value);
    }

    Ok(req)
}

#[cfg(test)]
mod tests {
    use std::sync::atomic::{AtomicUsize, Ordering};

    use async_trait::async_trait;
    use http::{HeaderMap, Method, StatusCode};
    use http_body_util::BodyExt;

    use super::*;
    use crate::{
        config::models::{
            CircuitBreakerConfig, EndpointConfig, GatewayConfig, RateLimitConfig, RouteConfig,
        },
        core::circuit_breaker::BreakerState,
        ports::{auth::AuthDecision, http_client::HttpClientError},
    };

    enum Behavior {
        Respond(StatusCode, &'static str),
        Refuse,
        Hang,
    }

    struct MockBackend {
        behavior: Behavior,
        calls: AtomicUsize,
    }

    impl MockBackend {
        fn new(behavior: Behavior) -> Arc<Self> {
            Arc::new(Self {
                behavior,
                calls: AtomicUsize::new(0),
            })
        }

        fn calls(&self) -> usize {
            self.calls.load(Ordering::SeqCst)
        }
    }

    #[async_trait]
    impl HttpClient for MockBackend {
        async fn send_request(
            &self,
            _req: Request<Body>,
        ) -> Result<Response<Body>, HttpClientError> {
            self.calls.fetch_add(1, Ordering::SeqCst);
            match self.behavior {
                Behavior::Respond(status, body) => Ok(Response::builder()
                    .status(status)
                    .body(Body::from(body))
                    .unwrap()),
                Behavior::Refuse => Err(HttpClientError::ConnectionError(
                    "connection refused".to_string(),
                )),
                Behavior::Hang => {
                    tokio::time::sleep(std::time::Duration::from_secs(3600)).await;
                    unreachable!()
                }
            }
        }
    }

    struct StaticAuth {
        decision: AuthDecision,
    }

    #[async_trait]
    impl Authenticator for StaticAuth {
        async fn authenticate(&self, _headers: &HeaderMap, _mode: AuthMode) -> AuthDecision {
            self.decision.clone()
        }
    }

    fn allow_all_auth() -> Arc<dyn Authenticator> {
        Arc::new(StaticAuth {
            decision: AuthDecision {
                valid: true,
                authorized: true,
                identity: Some("tester".to_string()),
            },
        })
    }

    fn config_with_route(route: RouteConfig) -> GatewayConfig {
        GatewayConfig {
            endpoints: vec![EndpointConfig {
                addr: "http://backend:9000".to_string(),
                name: "backend".to_string(),
                routes: vec![route],
                ..Default::default()
            }],
            ..Default::default()
        }
    }

    fn basic_route() -> RouteConfig {
        RouteConfig {
            id: "r1".to_string(),
            name: "things".to_string(),
            method: "GET".to_string(),
            path: "/api/things".to_string(),
            proxy_path: "/things".to_string(),
            ..Default::default()
        }
    }

    fn dispatcher_for(
        config: GatewayConfig,
        backend: Arc<MockBackend>,
        auth: Arc<dyn Authenticator>,
    ) -> (Dispatcher, Arc<ArcSwap<RouteTable>>) {
        let table = Arc::new(ArcSwap::from_pointee(
            RouteTable::from_config(&config).unwrap(),
        ));
        (
            Dispatcher::new(table.clone(), backend, auth),
            table,
        )
    }

    fn get(path: &str) -> Request<Body> {
        Request::builder()
            .method(Method::GET)
            .uri(path)
            .body(Body::empty())
            .unwrap()
    }

    async fn body_string(response: Response<Body>) -> String {
        let bytes = response.into_body().collect().await.unwrap().to_bytes();
        String::from_utf8(bytes.to_vec()).unwrap()
    }

    #[tokio::test]
    async fn unmatched_request_is_404_and_skips_backend() {
        let backend = MockBackend::new(Behavior::Respond(StatusCode::OK, "ok"));
        let (dispatcher, _) =
            dispatcher_for(config_with_route(basic_route()), backend.clone(), allow_all_auth());

        let response = dispatcher.dispatch(get("/nope"), None).await;
        assert_eq!(response.status(), StatusCode::NOT_FOUND);
        assert_eq!(backend.calls(), 0);
    }

    #[tokio::test]
    async fn blocked_ip_is_403() {
        let mut config = config_with_route(basic_route());
        config.endpoints[0].black_ips = vec!["10.1.2.3".parse().unwrap()];
        let backend = MockBackend::new(Behavior::Respond(StatusCode::OK, "ok"));
        let (dispatcher, _) = dispatcher_for(config, backend.clone(), allow_all_auth());

        let blocked = dispatcher
            .dispatch(get("/api/things"), Some("10.1.2.3".parse().unwrap()))
            .await;
        assert_eq!(blocked.status(), StatusCode::FORBIDDEN);
        assert_eq!(backend.calls(), 0);

        let allowed = dispatcher
            .dispatch(get("/api/things"), Some("10.1.2.4".parse().unwrap()))
            .await;
        assert_eq!(allowed.status(), StatusCode::OK);
    }

    #[tokio::test]
    async fn auth_modes_map_to_401_and_403() {
        let mut route = basic_route();
        route.auth = AuthMode::VerifyAndAuthorize;
        let config = config_with_route(route);
        let backend = MockBackend::new(Behavior::Respond(StatusCode::OK, "ok"));

        let invalid = Arc::new(StaticAuth {
            decision: AuthDecision::default(),
        });
        let (dispatcher, _) = dispatcher_for(config.clone(), backend.clone(), invalid);
        let response = dispatcher.dispatch(get("/api/things"), None).await;
        assert_eq!(response.status(), StatusCode::UNAUTHORIZED);

        let unauthorized = Arc::new(StaticAuth {
            decision: AuthDecision {
                valid: true,
                authorized: false,
                identity: None,
            },
        });
        let (dispatcher, _) = dispatcher_for(config.clone(), backend.clone(), unauthorized);
        let response = dispatcher.dispatch(get("/api/things"), None).await;
        assert_eq!(response.status(), StatusCode::FORBIDDEN);
        assert_eq!(backend.calls(), 0);

        // verify_only is satisfied by a valid-but-unauthorized credential.
        let mut route = basic_route();
        route.auth = AuthMode::VerifyOnly;
        let verify_only = config_with_route(route);
        let unauthorized = Arc::new(StaticAuth {
            decision: AuthDecision {
                valid: true,
                authorized: false,
                identity: None,
            },
        });
        let (dispatcher, _) = dispatcher_for(verify_only, backend.clone(), unauthorized);
        let response = dispatcher.dispatch(get("/api/things"), None).await;
        assert_eq!(response.status(), StatusCode::OK);
    }

    #[tokio::test]
    async fn rate_limit_rejection_uses_configured_message_and_spares_breaker() {
        let mut route = basic_route();
        route.rate_limit = Some(RateLimitConfig {
            requests: 2,
            period: "1h".to_string(),
            status_code: 429,
            message: r#"{"error":"throttled"}"#.to_string(),
            ..Default::default()
        });
        route.circuit_breaker = Some(CircuitBreakerConfig {
            volume_threshold: 1,
            error_percent: 1,
            ..Default::default()
        });
        let backend = MockBackend::new(Behavior::Respond(StatusCode::OK, "ok"));
        let (dispatcher, table) =
            dispatcher_for(config_with_route(route), backend.clone(), allow_all_auth());

        for _ in 0..2 {
            let ok = dispatcher.dispatch(get("/api/things"), None).await;
            assert_eq!(ok.status(), StatusCode::OK);
        }
        let limited = dispatcher.dispatch(get("/api/things"), None).await;
        assert_eq!(limited.status(), StatusCode::TOO_MANY_REQUESTS);
        assert_eq!(body_string(limited).await, r#"{"error":"throttled"}"#);
        assert_eq!(backend.calls(), 2);

        let breaker = table.load().route_by_id("r1").unwrap().breaker.clone().unwrap();
        assert_eq!(breaker.state(), BreakerState::Closed);
        assert_eq!(breaker.in_flight(), 0);
    }

    #[tokio::test]
    async fn forced_open_breaker_rejects_with_message() {
        let mut route = basic_route();
        route.circuit_breaker = Some(CircuitBreakerConfig {
            force_open: true,
            message: "orders shed".to_string(),
            ..Default::default()
        });
        let backend = MockBackend::new(Behavior::Respond(StatusCode::OK, "ok"));
        let (dispatcher, _) =
            dispatcher_for(config_with_route(route), backend.clone(), allow_all_auth());

        for _ in 0..5 {
            let response = dispatcher.dispatch(get("/api/things"), None).await;
            assert_eq!(response.status(), StatusCode::SERVICE_UNAVAILABLE);
            assert_eq!(body_string(response).await, "orders shed");
        }
        assert_eq!(backend.calls(), 0);
    }

    #[tokio::test]
    async fn connection_errors_feed_the_breaker_until_it_opens() {
        let mut route = basic_route();
        route.circuit_breaker = Some(CircuitBreakerConfig {
            volume_threshold: 3,
            error_percent: 50,
            ..Default::default()
        });
        let backend = MockBackend::new(Behavior::Refuse);
        let (dispatcher, _) =
            dispatcher_for(config_with_route(route), backend.clone(), allow_all_auth());

        for _ in 0..3 {
            let response = dispatcher.dispatch(get("/api/things"), None).await;
            assert_eq!(response.status(), StatusCode::BAD_GATEWAY);
        }
        assert_eq!(backend.calls(), 3);

        // Tripped: the next request is shed without reaching the backend.
        let shed = dispatcher.dispatch(get("/api/things"), None).await;
        assert_eq!(shed.status(), StatusCode::SERVICE_UNAVAILABLE);
        assert_eq!(backend.calls(), 3);
    }

    #[tokio::test]
    async fn slow_backend_times_out_as_504() {
        let mut route = basic_route();
        route.circuit_breaker = Some(CircuitBreakerConfig {
            timeout: "20ms".to_string(),
            ..Default::default()
        });
        let backend = MockBackend::new(Behavior::Hang);
        let (dispatcher, table) =
            dispatcher_for(config_with_route(route), backend, allow_all_auth());

        let response = dispatcher.dispatch(get("/api/things"), None).await;
        assert_eq!(response.status(), StatusCode::GATEWAY_TIMEOUT);

        let breaker = table.load().route_by_id("r1").unwrap().breaker.clone().unwrap();
        assert_eq!(breaker.in_flight(), 0);
    }

    #[tokio::test]
    async fn backend_response_passes_through() {
        let backend = MockBackend::new(Behavior::Respond(StatusCode::CREATED, "made"));
        let (dispatcher, _) =
            dispatcher_for(config_with_route(basic_route()), backend, allow_all_auth());

        let response = dispatcher.dispatch(get("/api/things"), None).await;
        assert_eq!(response.status(), StatusCode::CREATED);
        assert_eq!(body_string(response).await, "made");
    }

    #[test]
    fn backend_request_rewrite_preserves_query_and_wildcard_suffix() {
        let mut route = basic_route();
        route.path = "/api/*".to_string();
        route.proxy_path = "/internal".to_string();
        let config = config_with_route(route);
        let table = RouteTable::from_config(&config).unwrap();
        let matched = table.match_route(&Method::GET, "/api/things/7").unwrap();

        let req = Request::builder()
            .method(Method::GET)
            .uri("/api/things/7?page=2")
            .body(Body::empty())
            .unwrap();
        let rewritten =
            build_backend_request(req, &matched, Some("192.0.2.1".parse().unwrap())).unwrap();

        assert_eq!(
            rewritten.uri().to_string(),
            "http://backend:9000/internal/things/7?page=2"
        );
        assert_eq!(
            rewritten.headers().get("X-Forwarded-For").unwrap(),
            "192.0.2.1"
        );
    }
}
