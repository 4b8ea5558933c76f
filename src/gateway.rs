/// Core gateway implementation: the request dispatcher on Pingora
use anyhow::Result;
use async_trait::async_trait;
use bytes::Bytes;
use chrono::Utc;
use log::{debug, error, info, warn};
use pingora_core::{
    server::{configuration::Opt, Server},
    upstreams::peer::HttpPeer,
    Result as PingoraResult,
};
use pingora_http::ResponseHeader;
use pingora_proxy::{ProxyHttp, Session};
use serde_json::json;
use std::sync::atomic::{AtomicU32, AtomicU64, Ordering};
use std::{net::SocketAddr, sync::Arc, time::Instant};

use crate::{
    auth::{TokenAuthenticator, TokenClaims},
    breaker::{Admission, BreakerRegistry, CircuitState},
    config::Config,
    cors::{CorsPolicy, PreflightDecision},
    fallback::{FallbackResponder, UNKNOWN_SERVICE},
    metrics::MetricsCollector,
    proxy::{self, UpstreamClient, UpstreamRequest, UpstreamResponse},
    ratelimit::RateLimiter,
    retry,
    routes::{CompiledRoute, RouteTable},
};

const X_REQUEST_ID: &str = "X-Request-ID";
const X_FORWARDED_FOR: &str = "X-Forwarded-For";
const HEALTH_PATH: &str = "/health";

/// Request context that carries information throughout the request lifecycle
#[derive(Debug)]
pub struct RequestContext {
    /// Request start time
    pub start_time: Instant,
    /// Route ID that matched this request
    pub route_id: Option<String>,
    /// Client IP address
    pub client_ip: SocketAddr,
    /// Unique request ID for tracing
    pub request_id: String,
    /// Verified caller identity; dropped with the context when the
    /// request completes
    pub claims: Option<TokenClaims>,
}

impl RequestContext {
    pub fn new(client_ip: SocketAddr, request_counter: u64) -> Self {
        let request_id = format!(
            "req-{:016x}-{:08x}",
            std::time::SystemTime::now()
                .duration_since(std::time::UNIX_EPOCH)
                .unwrap_or_default()
                .as_nanos() as u64,
            request_counter
        );

        Self {
            start_time: Instant::now(),
            route_id: None,
            client_ip,
            request_id,
            claims: None,
        }
    }

    /// Get request duration
    pub fn duration(&self) -> std::time::Duration {
        self.start_time.elapsed()
    }
}

/// Edge gateway dispatching inbound requests to upstream services
#[derive(Clone)]
pub struct ApiGateway {
    /// Configuration
    config: Arc<Config>,
    /// Compiled route table
    routes: Arc<RouteTable>,
    /// Bearer token authenticator
    authenticator: Arc<TokenAuthenticator>,
    /// Global CORS policy
    cors: Arc<CorsPolicy>,
    /// Per-route circuit breakers
    breakers: Arc<BreakerRegistry>,
    /// Per-client rate limiter
    limiter: Arc<RateLimiter>,
    /// Upstream HTTP client
    upstream: Arc<UpstreamClient>,
    /// Fallback response builder
    fallback: Arc<FallbackResponder>,
    /// Metrics collector
    metrics: Arc<MetricsCollector>,
    /// Request ID counter
    request_counter: Arc<AtomicU64>,
}

impl ApiGateway {
    /// Create a new gateway instance from validated configuration
    pub fn new(config: Arc<Config>) -> Result<Self> {
        config.validate()?;

        let routes = Arc::new(RouteTable::new(&config.routes)?);
        let authenticator = Arc::new(TokenAuthenticator::new(&config.auth));
        let cors = Arc::new(CorsPolicy::new(config.cors.clone()));
        let limiter = Arc::new(RateLimiter::new(config.rate_limit.clone()));
        let metrics = Arc::new(MetricsCollector::new(&config.metrics)?);

        Ok(Self {
            config,
            routes,
            authenticator,
            cors,
            breakers: Arc::new(BreakerRegistry::new()),
            limiter,
            upstream: Arc::new(UpstreamClient::new()?),
            fallback: Arc::new(FallbackResponder::new(HEALTH_PATH)),
            metrics,
            request_counter: Arc::new(AtomicU64::new(0)),
        })
    }

    /// Start the gateway server
    pub fn run(&self) -> Result<()> {
        info!("Starting edge gateway");

        let opt = Opt::default();
        let mut server = Server::new(Some(opt))?;
        server.bootstrap();

        let mut proxy_service =
            pingora_proxy::http_proxy_service(&server.configuration, self.clone());
        proxy_service.add_tcp(&self.config.server.http_addr.to_string());
        info!("HTTP server listening on {}", self.config.server.http_addr);

        server.add_service(proxy_service);

        if self.config.metrics.prometheus {
            if let Some(metrics_addr) = &self.config.metrics.metrics_addr {
                let mut metrics_service =
                    pingora_core::services::listening::Service::prometheus_http_service();
                metrics_service.add_tcp(&metrics_addr.to_string());
                server.add_service(metrics_service);
                info!("Metrics server listening on {}", metrics_addr);
            }
        }

        info!(
            "Gateway ready: {} routes loaded, auth {}",
            self.routes.route_count(),
            if self.authenticator.is_enabled() {
                "enabled"
            } else {
                "disabled"
            }
        );

        // Run the server (this blocks forever)
        server.run_forever();
    }

    fn is_public_path(&self, path: &str) -> bool {
        self.config
            .public_paths
            .iter()
            .any(|prefix| path.starts_with(prefix.as_str()))
    }

    /// Liveness view: the gateway itself is UP regardless of breaker
    /// states; downstream services are summarized per route
    fn health_body(&self) -> serde_json::Value {
        let states = self.breakers.states();
        let degraded = states
            .iter()
            .any(|(_, state)| *state != CircuitState::Closed);

        let mut services = serde_json::Map::new();
        for (route_id, state) in &states {
            services.insert(
                route_id.clone(),
                json!({
                    "status": if *state == CircuitState::Closed { "UP" } else { "DEGRADED" },
                    "breaker": state.as_str(),
                }),
            );
        }

        json!({
            "status": "UP",
            "timestamp": Utc::now().to_rfc3339(),
            "details": {
                "gateway": "UP",
                "downstream-services": if degraded { "PARTIAL" } else { "UP" },
            },
            "services": services,
        })
    }

    /// The full dispatch pipeline. Every request is answered here; no
    /// request reaches Pingora's own upstream machinery.
    async fn dispatch(&self, session: &mut Session, ctx: &mut RequestContext) -> PingoraResult<()> {
        let (method, path, query) = {
            let req = session.req_header();
            (
                req.method.as_str().to_string(),
                req.uri.path().to_string(),
                req.uri.query().map(|q| q.to_string()),
            )
        };
        let origin = header_value(session, "origin");

        // CORS pre-flight is answered before anything else
        if method == "OPTIONS" {
            let requested_method = header_value(session, "access-control-request-method");
            let requested_headers = header_value(session, "access-control-request-headers");
            let decision = self.cors.preflight(
                origin.as_deref(),
                requested_method.as_deref(),
                requested_headers.as_deref(),
            );
            return match decision {
                PreflightDecision::Allowed(headers) => {
                    self.respond_empty(session, 204, &headers, ctx).await
                }
                PreflightDecision::NoOrigin => self.respond_empty(session, 204, &[], ctx).await,
                PreflightDecision::Denied => {
                    debug!(
                        "Request {} pre-flight denied for origin {:?}",
                        ctx.request_id, origin
                    );
                    self.respond_error(session, 403, "CORS_DENIED", "Origin not allowed", &[], ctx)
                        .await
                }
            };
        }

        // Actual requests from a disallowed origin are refused locally
        if self.cors.denies_actual(origin.as_deref()) {
            return self
                .respond_error(session, 403, "CORS_DENIED", "Origin not allowed", &[], ctx)
                .await;
        }
        let cors_headers = self.cors.response_headers(origin.as_deref());

        // The gateway answers its own health endpoint
        if path == HEALTH_PATH {
            return self
                .respond_json(session, 200, &self.health_body(), &cors_headers, ctx)
                .await;
        }

        // Authentication, unless the path is on the public allowlist
        if self.authenticator.is_enabled() && !self.is_public_path(&path) {
            let auth_header = header_value(session, &self.config.auth.header);
            match self.authenticator.authenticate(auth_header.as_deref()) {
                Ok(claims) => ctx.claims = claims,
                Err(reason) => {
                    // The precise reason stays in the logs; callers get
                    // one opaque outcome
                    debug!("Request {} auth rejected: {}", ctx.request_id, reason);
                    self.metrics.record_auth_failure();
                    return self
                        .respond_error(
                            session,
                            401,
                            "AUTH_FAILED",
                            "Authentication failed",
                            &cors_headers,
                            ctx,
                        )
                        .await;
                }
            }
        }

        // Rate limiting (no-op unless enabled)
        if self.limiter.is_enabled() {
            let key = ctx.client_ip.ip().to_string();
            if !self.limiter.check(&key) {
                warn!("Request {} rate limited for {}", ctx.request_id, key);
                let mut headers = cors_headers.clone();
                headers.push(("retry-after".to_string(), "1".to_string()));
                return self
                    .respond_error(
                        session,
                        429,
                        "RATE_LIMITED",
                        "Too many requests",
                        &headers,
                        ctx,
                    )
                    .await;
            }
        }

        // Route matching, most specific pattern first
        let route = match self.routes.find_route(&path) {
            Some(route) => route,
            None => {
                warn!("No route found for {} {}", method, path);
                return self
                    .respond_error(
                        session,
                        404,
                        "ROUTE_NOT_FOUND",
                        &format!("No route matches {} {}", method, path),
                        &cors_headers,
                        ctx,
                    )
                    .await;
            }
        };
        ctx.route_id = Some(route.config.id.clone());

        // Circuit breaker admission before any upstream traffic
        let breaker = self
            .breakers
            .get_or_create(&route.config.id, &route.config.circuit_breaker);
        match breaker.try_admit() {
            Admission::Reject => {
                info!(
                    "Request {} rejected by open breaker for route '{}'",
                    ctx.request_id, route.config.id
                );
                return self.respond_fallback(session, &route, &cors_headers, ctx).await;
            }
            Admission::AdmitProbe => {
                debug!(
                    "Request {} admitted as recovery probe for route '{}'",
                    ctx.request_id, route.config.id
                );
            }
            Admission::Admit => {}
        }

        // Proxied call under the route's retry policy
        let body = read_full_body(session).await?;
        let upstream_request = self.build_upstream_request(session, &route, &method, &path, query.as_deref(), body, ctx);

        let policy = &route.config.retry;
        let deadline = Instant::now() + retry::deadline_budget(policy);
        let attempts_made = AtomicU32::new(0);

        let result = retry::execute(policy, deadline, |attempt| {
            attempts_made.store(attempt, Ordering::Relaxed);
            self.upstream.call(&upstream_request, policy.attempt_timeout)
        })
        .await;

        self.metrics
            .record_retries(attempts_made.load(Ordering::Relaxed).saturating_sub(1) as u64);

        let outcome = match result {
            Ok(response) => {
                // 4xx is the caller's mistake: passed through, counted
                // against nobody. Everything else reaching here succeeded.
                if !response.is_client_error() {
                    breaker.record_success();
                }
                self.write_upstream_response(session, &route, response, &cors_headers, ctx)
                    .await
            }
            Err(err) => {
                warn!(
                    "Request {} to route '{}' failed: {}",
                    ctx.request_id, route.config.id, err
                );
                breaker.record_failure();
                self.respond_fallback(session, &route, &cors_headers, ctx).await
            }
        };

        self.metrics.set_degraded_routes(self.breakers.degraded_count());
        outcome
    }

    /// Assemble the outbound request: rewritten path, filtered headers,
    /// per-route injected headers, tracing headers
    fn build_upstream_request(
        &self,
        session: &Session,
        route: &CompiledRoute,
        method: &str,
        path: &str,
        query: Option<&str>,
        body: Bytes,
        ctx: &RequestContext,
    ) -> UpstreamRequest {
        let upstream_path = route.upstream_path(path);
        let url = proxy::target_url(&route.config.target_base_url, &upstream_path, query);

        let injected = &route.config.request_headers_add;
        let mut headers: Vec<(String, Vec<u8>)> = session
            .req_header()
            .headers
            .iter()
            .filter(|(name, _)| {
                let name = name.as_str();
                !proxy::is_hop_by_hop(name)
                    && !name.eq_ignore_ascii_case("host")
                    && !injected.keys().any(|k| k.eq_ignore_ascii_case(name))
            })
            .map(|(name, value)| (name.as_str().to_string(), value.as_bytes().to_vec()))
            .collect();

        for (name, value) in injected {
            headers.push((name.clone(), value.as_bytes().to_vec()));
        }
        headers.push((X_REQUEST_ID.to_string(), ctx.request_id.as_bytes().to_vec()));
        headers.push((
            X_FORWARDED_FOR.to_string(),
            ctx.client_ip.ip().to_string().into_bytes(),
        ));

        UpstreamRequest {
            method: method.to_string(),
            url,
            headers,
            body,
        }
    }

    /// Pass an upstream response through, adding the route's response
    /// headers and CORS headers
    async fn write_upstream_response(
        &self,
        session: &mut Session,
        route: &CompiledRoute,
        response: UpstreamResponse,
        cors_headers: &[(String, String)],
        ctx: &RequestContext,
    ) -> PingoraResult<()> {
        let mut header = ResponseHeader::build(response.status, None)?;

        let mut has_length = false;
        for (name, value) in &response.headers {
            if proxy::is_hop_by_hop(name) {
                continue;
            }
            if name.eq_ignore_ascii_case("content-length") {
                has_length = true;
            }
            header.insert_header(name.clone(), value.as_slice())?;
        }
        if !has_length {
            header.insert_header("content-length", response.body.len().to_string())?;
        }

        for (name, value) in &route.config.response_headers_add {
            header.insert_header(name.clone(), value.clone())?;
        }
        for (name, value) in cors_headers {
            header.insert_header(name.clone(), value.clone())?;
        }
        header.insert_header(X_REQUEST_ID, &ctx.request_id)?;

        session
            .write_response_header(Box::new(header), false)
            .await?;
        session
            .write_response_body(Some(response.body), true)
            .await?;
        Ok(())
    }

    /// Serve the degraded response for a route whose upstream is
    /// unavailable, always with HTTP 503
    async fn respond_fallback(
        &self,
        session: &mut Session,
        route: &CompiledRoute,
        cors_headers: &[(String, String)],
        ctx: &RequestContext,
    ) -> PingoraResult<()> {
        self.metrics.record_fallback();
        let service = route.config.fallback_service();
        let body = self.fallback.body_for(service);
        self.respond_json(session, 503, &body, cors_headers, ctx).await
    }

    /// Structured error response in the gateway's own error schema
    async fn respond_error(
        &self,
        session: &mut Session,
        status: u16,
        code: &str,
        message: &str,
        extra_headers: &[(String, String)],
        ctx: &RequestContext,
    ) -> PingoraResult<()> {
        let body = json!({
            "error": {
                "code": code,
                "message": message,
                "timestamp": Utc::now().to_rfc3339(),
            },
        });
        self.respond_json(session, status, &body, extra_headers, ctx).await
    }

    async fn respond_json(
        &self,
        session: &mut Session,
        status: u16,
        body: &serde_json::Value,
        extra_headers: &[(String, String)],
        ctx: &RequestContext,
    ) -> PingoraResult<()> {
        let payload = Bytes::from(body.to_string());

        let mut header = ResponseHeader::build(status, None)?;
        header.insert_header("content-type", "application/json")?;
        header.insert_header("content-length", payload.len().to_string())?;
        for (name, value) in extra_headers {
            header.insert_header(name.clone(), value.clone())?;
        }
        header.insert_header(X_REQUEST_ID, &ctx.request_id)?;

        session
            .write_response_header(Box::new(header), false)
            .await?;
        session.write_response_body(Some(payload), true).await?;
        Ok(())
    }

    async fn respond_empty(
        &self,
        session: &mut Session,
        status: u16,
        extra_headers: &[(String, String)],
        ctx: &RequestContext,
    ) -> PingoraResult<()> {
        let mut header = ResponseHeader::build(status, None)?;
        header.insert_header("content-length", "0")?;
        for (name, value) in extra_headers {
            header.insert_header(name.clone(), value.clone())?;
        }
        header.insert_header(X_REQUEST_ID, &ctx.request_id)?;

        session
            .write_response_header(Box::new(header), false)
            .await?;
        session.write_response_body(None, true).await?;
        Ok(())
    }
}

/// Read a request header value as a string
fn header_value(session: &Session, name: &str) -> Option<String> {
    session
        .req_header()
        .headers
        .get(name)
        .and_then(|v| v.to_str().ok())
        .map(|s| s.to_string())
}

/// Drain the inbound request body into memory
async fn read_full_body(session: &mut Session) -> PingoraResult<Bytes> {
    let mut body = Vec::new();
    while let Some(chunk) = session.read_request_body().await? {
        body.extend_from_slice(&chunk);
    }
    Ok(Bytes::from(body))
}

#[async_trait]
impl ProxyHttp for ApiGateway {
    type CTX = RequestContext;

    /// Create a new request context
    fn new_ctx(&self) -> Self::CTX {
        // Updated with the actual client IP in early_request_filter
        let request_counter = self.request_counter.fetch_add(1, Ordering::Relaxed);
        RequestContext::new("0.0.0.0:0".parse().unwrap(), request_counter)
    }

    /// Early request filter - runs before dispatch
    async fn early_request_filter(
        &self,
        session: &mut Session,
        ctx: &mut Self::CTX,
    ) -> PingoraResult<()> {
        if let Some(client_addr) = session.client_addr() {
            if let Some(inet_addr) = client_addr.as_inet() {
                ctx.client_ip = *inet_addr;
            }
        }

        session
            .req_header_mut()
            .insert_header(X_REQUEST_ID, &ctx.request_id)
            .map_err(|e| {
                error!("Failed to add request ID header: {}", e);
                pingora_core::Error::new_str("Failed to add request ID header")
            })?;

        debug!(
            "Processing request {} from {}",
            ctx.request_id, ctx.client_ip
        );

        Ok(())
    }

    /// The entire dispatch happens here; `true` tells Pingora the
    /// response was already written
    async fn request_filter(
        &self,
        session: &mut Session,
        ctx: &mut Self::CTX,
    ) -> PingoraResult<bool> {
        self.metrics.record_request();
        self.dispatch(session, ctx).await?;
        Ok(true)
    }

    /// Never reached: every request is answered in request_filter
    async fn upstream_peer(
        &self,
        _session: &mut Session,
        ctx: &mut Self::CTX,
    ) -> PingoraResult<Box<HttpPeer>> {
        error!(
            "Request {} unexpectedly reached upstream selection",
            ctx.request_id
        );
        Err(pingora_core::Error::new_str(
            "all requests are answered by the dispatcher",
        ))
    }

    /// Log request completion and record duration metrics
    async fn logging(
        &self,
        session: &mut Session,
        e: Option<&pingora_core::Error>,
        ctx: &mut Self::CTX,
    ) {
        let status_code = session
            .response_written()
            .map(|resp| resp.status.as_u16())
            .unwrap_or(0);

        let duration = ctx.duration();
        self.metrics.record_response(status_code, duration);

        let log_level = if status_code >= 500 {
            log::Level::Error
        } else if status_code >= 400 {
            log::Level::Warn
        } else {
            log::Level::Info
        };

        log::log!(
            log_level,
            "Request {} completed: {} {} -> {} ({}ms) [{}]",
            ctx.request_id,
            session.req_header().method,
            session.req_header().uri.path(),
            status_code,
            duration.as_millis(),
            ctx.route_id.as_deref().unwrap_or(UNKNOWN_SERVICE)
        );

        if let Some(error) = e {
            error!("Request {} encountered error: {}", ctx.request_id, error);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::{
        AuthConfig, BreakerConfig, CorsConfig, MetricsConfig, RateLimitConfig, RetryPolicyConfig,
        RouteConfig, ServerConfig,
    };
    use std::collections::HashMap;
    use std::time::Duration;

    fn test_config() -> Arc<Config> {
        Arc::new(Config {
            server: ServerConfig {
                http_addr: "127.0.0.1:8080".parse().unwrap(),
            },
            routes: vec![RouteConfig {
                id: "patient-service".to_string(),
                path: "/api/v1/patients/**".to_string(),
                target_base_url: "http://patient-service:8081".to_string(),
                strip_prefix_segments: 0,
                request_headers_add: HashMap::new(),
                response_headers_add: HashMap::new(),
                retry: RetryPolicyConfig::default(),
                circuit_breaker: BreakerConfig::default(),
                fallback: None,
            }],
            auth: AuthConfig {
                enabled: true,
                ..AuthConfig::default()
            },
            cors: CorsConfig::default(),
            rate_limit: RateLimitConfig::default(),
            public_paths: vec![
                "/health".to_string(),
                "/docs".to_string(),
                "/auth".to_string(),
                "/fallback".to_string(),
            ],
            metrics: MetricsConfig::default(),
        })
    }

    #[test]
    fn test_public_path_allowlist() {
        let gateway = ApiGateway::new(test_config()).unwrap();
        assert!(gateway.is_public_path("/health"));
        assert!(gateway.is_public_path("/docs/patient/openapi.json"));
        assert!(gateway.is_public_path("/auth/login"));
        assert!(gateway.is_public_path("/fallback/patient-service"));
        assert!(!gateway.is_public_path("/api/v1/patients/123"));
    }

    #[test]
    fn test_health_reports_up_with_degraded_downstream() {
        let gateway = ApiGateway::new(test_config()).unwrap();

        let breaker = gateway.breakers.get_or_create(
            "patient-service",
            &BreakerConfig {
                window_size: 4,
                failure_rate_threshold: 0.5,
                min_samples: 2,
                open_duration: Duration::from_secs(3600),
                half_open_trials: 1,
            },
        );
        breaker.record_failure();
        breaker.record_failure();

        let body = gateway.health_body();
        // Gateway liveness is independent of downstream breaker states
        assert_eq!(body["status"], "UP");
        assert_eq!(body["details"]["gateway"], "UP");
        assert_eq!(body["details"]["downstream-services"], "PARTIAL");
        assert_eq!(body["services"]["patient-service"]["status"], "DEGRADED");
        assert_eq!(body["services"]["patient-service"]["breaker"], "OPEN");
    }

    #[test]
    fn test_health_all_up_when_breakers_closed() {
        let gateway = ApiGateway::new(test_config()).unwrap();
        let body = gateway.health_body();
        assert_eq!(body["status"], "UP");
        assert_eq!(body["details"]["downstream-services"], "UP");
    }
}
