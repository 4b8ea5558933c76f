//! Triage - Edge API gateway for clinical microservices
//!
//! Triage provides a single ingress point in front of a multi-service
//! deployment, built on Cloudflare's Pingora framework:
//! - Request routing with glob patterns, most specific route first
//! - Per-route circuit breakers over a rolling outcome window
//! - Bounded upstream retries with exponential backoff and jitter
//! - Bearer token (JWT) authentication with a public-path allowlist
//! - Global CORS policy for pre-flight and actual requests
//! - Structured fallback responses when an upstream is unavailable
//! - Prometheus metrics collection

pub mod auth;
pub mod breaker;
pub mod config;
pub mod cors;
pub mod fallback;
pub mod gateway;
pub mod metrics;
pub mod proxy;
pub mod ratelimit;
pub mod retry;
pub mod routes;

pub use breaker::{Admission, BreakerRegistry, CircuitBreaker, CircuitState};
pub use config::*;
pub use gateway::{ApiGateway, RequestContext};
pub use routes::{CompiledRoute, RouteTable};
