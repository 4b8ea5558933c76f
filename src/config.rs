/// Configuration management for the edge gateway
use anyhow::{Context, Result};
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::net::SocketAddr;
use std::time::Duration;
use url::Url;

/// Main configuration structure for the gateway
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Config {
    /// Server configuration
    pub server: ServerConfig,
    /// Route configurations, evaluated in specificity order
    pub routes: Vec<RouteConfig>,
    /// Bearer token authentication
    #[serde(default)]
    pub auth: AuthConfig,
    /// Global CORS policy
    #[serde(default)]
    pub cors: CorsConfig,
    /// Per-client rate limiting (disabled by default)
    #[serde(default)]
    pub rate_limit: RateLimitConfig,
    /// Path prefixes that bypass authentication
    #[serde(default = "default_public_paths")]
    pub public_paths: Vec<String>,
    /// Metrics and monitoring configuration
    #[serde(default)]
    pub metrics: MetricsConfig,
}

/// Server configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ServerConfig {
    /// HTTP listening address
    pub http_addr: SocketAddr,
}

/// Route configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RouteConfig {
    /// Route identifier, also the default fallback service name
    pub id: String,
    /// Glob path pattern (`*` matches one segment, `**` matches the rest)
    pub path: String,
    /// Upstream base URL requests are forwarded to
    pub target_base_url: String,
    /// Leading path segments removed before forwarding (0 = forward full path)
    #[serde(default)]
    pub strip_prefix_segments: usize,
    /// Headers added to the upstream request
    #[serde(default)]
    pub request_headers_add: HashMap<String, String>,
    /// Headers added to the downstream response
    #[serde(default)]
    pub response_headers_add: HashMap<String, String>,
    /// Retry policy for upstream calls
    #[serde(default)]
    pub retry: RetryPolicyConfig,
    /// Circuit breaker settings
    #[serde(default)]
    pub circuit_breaker: BreakerConfig,
    /// Fallback service name (defaults to the route id)
    pub fallback: Option<String>,
}

impl RouteConfig {
    /// Service name used when building fallback responses for this route
    pub fn fallback_service(&self) -> &str {
        self.fallback.as_deref().unwrap_or(&self.id)
    }
}

/// Retry policy for a single route
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RetryPolicyConfig {
    /// Maximum number of attempts, including the first call
    #[serde(default = "default_max_attempts")]
    pub max_attempts: u32,
    /// Delay before the first retry
    #[serde(with = "humantime_serde", default = "default_base_delay")]
    pub base_delay: Duration,
    /// Upper bound on any single backoff delay
    #[serde(with = "humantime_serde", default = "default_max_delay")]
    pub max_delay: Duration,
    /// Multiplier applied to the delay between consecutive retries
    #[serde(default = "default_multiplier")]
    pub multiplier: f64,
    /// Jitter each delay uniformly within [0, delay]
    #[serde(default = "default_jitter")]
    pub jitter: bool,
    /// Timeout for each individual upstream attempt
    #[serde(with = "humantime_serde", default = "default_attempt_timeout")]
    pub attempt_timeout: Duration,
}

impl Default for RetryPolicyConfig {
    fn default() -> Self {
        Self {
            max_attempts: default_max_attempts(),
            base_delay: default_base_delay(),
            max_delay: default_max_delay(),
            multiplier: default_multiplier(),
            jitter: default_jitter(),
            attempt_timeout: default_attempt_timeout(),
        }
    }
}

/// Circuit breaker settings for a single route
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct BreakerConfig {
    /// Number of outcomes kept in the rolling window
    #[serde(default = "default_window_size")]
    pub window_size: usize,
    /// Failure rate in (0, 1] at which the breaker opens
    #[serde(default = "default_failure_rate_threshold")]
    pub failure_rate_threshold: f64,
    /// Minimum outcomes in the window before the rate is evaluated
    #[serde(default = "default_min_samples")]
    pub min_samples: usize,
    /// How long the breaker stays open before probing
    #[serde(with = "humantime_serde", default = "default_open_duration")]
    pub open_duration: Duration,
    /// Concurrent probe calls admitted while half-open
    #[serde(default = "default_half_open_trials")]
    pub half_open_trials: u32,
}

impl Default for BreakerConfig {
    fn default() -> Self {
        Self {
            window_size: default_window_size(),
            failure_rate_threshold: default_failure_rate_threshold(),
            min_samples: default_min_samples(),
            open_duration: default_open_duration(),
            half_open_trials: default_half_open_trials(),
        }
    }
}

/// Bearer token authentication configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AuthConfig {
    /// When disabled, every request is admitted as anonymous
    #[serde(default)]
    pub enabled: bool,
    /// HMAC secret the token signature is verified against
    #[serde(default = "default_auth_secret")]
    pub secret: String,
    /// Header carrying the bearer token
    #[serde(default = "default_auth_header")]
    pub header: String,
}

impl Default for AuthConfig {
    fn default() -> Self {
        Self {
            enabled: false,
            secret: default_auth_secret(),
            header: default_auth_header(),
        }
    }
}

/// Global CORS policy configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CorsConfig {
    /// Allowed origins (`*` allows any)
    #[serde(default = "default_allowed_origins")]
    pub allowed_origins: Vec<String>,
    /// Allowed methods
    #[serde(default = "default_allowed_methods")]
    pub allowed_methods: Vec<String>,
    /// Allowed request headers
    #[serde(default = "default_allowed_headers")]
    pub allowed_headers: Vec<String>,
    /// Whether credentialed requests are allowed
    #[serde(default = "default_allow_credentials")]
    pub allow_credentials: bool,
    /// Maximum age for preflight responses
    #[serde(with = "humantime_serde", default = "default_cors_max_age")]
    pub max_age: Duration,
}

impl Default for CorsConfig {
    fn default() -> Self {
        Self {
            allowed_origins: default_allowed_origins(),
            allowed_methods: default_allowed_methods(),
            allowed_headers: default_allowed_headers(),
            allow_credentials: default_allow_credentials(),
            max_age: default_cors_max_age(),
        }
    }
}

/// Per-client rate limiting configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RateLimitConfig {
    /// When disabled, every admission check passes
    #[serde(default)]
    pub enabled: bool,
    /// Token bucket capacity per client key
    #[serde(default = "default_bucket_capacity")]
    pub capacity: u64,
    /// Tokens replenished per second
    #[serde(default = "default_refill_per_second")]
    pub refill_per_second: f64,
}

impl Default for RateLimitConfig {
    fn default() -> Self {
        Self {
            enabled: false,
            capacity: default_bucket_capacity(),
            refill_per_second: default_refill_per_second(),
        }
    }
}

/// Metrics and monitoring configuration
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct MetricsConfig {
    /// Enable Prometheus metrics
    #[serde(default)]
    pub prometheus: bool,
    /// Metrics server address
    pub metrics_addr: Option<SocketAddr>,
}

impl Config {
    /// Load configuration from a file
    pub fn from_file(path: &str) -> Result<Self> {
        let content = std::fs::read_to_string(path)
            .with_context(|| format!("Failed to read config file: {}", path))?;

        let config: Config = if path.ends_with(".yaml") || path.ends_with(".yml") {
            serde_yaml::from_str(&content)
                .with_context(|| format!("Failed to parse YAML config file: {}", path))?
        } else if path.ends_with(".toml") {
            toml::from_str(&content)
                .with_context(|| format!("Failed to parse TOML config file: {}", path))?
        } else if path.ends_with(".json") {
            serde_json::from_str(&content)
                .with_context(|| format!("Failed to parse JSON config file: {}", path))?
        } else {
            return Err(anyhow::anyhow!(
                "Unsupported config file format. Supported formats: .yaml, .yml, .toml, .json"
            ));
        };

        Ok(config)
    }

    /// Validate the configuration
    pub fn validate(&self) -> Result<()> {
        let mut seen = std::collections::HashSet::new();
        for route in &self.routes {
            if !seen.insert(route.id.as_str()) {
                return Err(anyhow::anyhow!("Duplicate route ID: {}", route.id));
            }

            let url = Url::parse(&route.target_base_url).with_context(|| {
                format!(
                    "Route '{}' has an invalid target base URL '{}'",
                    route.id, route.target_base_url
                )
            })?;
            if url.scheme() != "http" && url.scheme() != "https" {
                return Err(anyhow::anyhow!(
                    "Route '{}' target must use http or https, got '{}'",
                    route.id,
                    url.scheme()
                ));
            }

            if route.retry.max_attempts == 0 {
                return Err(anyhow::anyhow!(
                    "Route '{}' retry policy must allow at least one attempt",
                    route.id
                ));
            }
            if route.retry.multiplier < 1.0 {
                return Err(anyhow::anyhow!(
                    "Route '{}' retry multiplier must be >= 1.0",
                    route.id
                ));
            }

            let cb = &route.circuit_breaker;
            if cb.failure_rate_threshold <= 0.0 || cb.failure_rate_threshold > 1.0 {
                return Err(anyhow::anyhow!(
                    "Route '{}' failure rate threshold must be in (0, 1]",
                    route.id
                ));
            }
            if cb.window_size == 0 || cb.min_samples == 0 {
                return Err(anyhow::anyhow!(
                    "Route '{}' breaker window and minimum sample size must be non-zero",
                    route.id
                ));
            }
            if cb.min_samples > cb.window_size {
                return Err(anyhow::anyhow!(
                    "Route '{}' breaker minimum sample size exceeds its window",
                    route.id
                ));
            }
            if cb.half_open_trials == 0 {
                return Err(anyhow::anyhow!(
                    "Route '{}' breaker must admit at least one half-open probe",
                    route.id
                ));
            }
        }

        if self.metrics.prometheus && self.metrics.metrics_addr.is_none() {
            return Err(anyhow::anyhow!(
                "metrics_addr must be set when Prometheus metrics are enabled"
            ));
        }

        Ok(())
    }
}

// Default value functions
fn default_max_attempts() -> u32 {
    3
}

fn default_base_delay() -> Duration {
    Duration::from_millis(100)
}

fn default_max_delay() -> Duration {
    Duration::from_secs(1)
}

fn default_multiplier() -> f64 {
    2.0
}

fn default_jitter() -> bool {
    true
}

fn default_attempt_timeout() -> Duration {
    Duration::from_secs(30)
}

fn default_window_size() -> usize {
    20
}

fn default_failure_rate_threshold() -> f64 {
    0.5
}

fn default_min_samples() -> usize {
    10
}

fn default_open_duration() -> Duration {
    Duration::from_secs(30)
}

fn default_half_open_trials() -> u32 {
    1
}

fn default_auth_secret() -> String {
    "default-secret-key-change-in-production".to_string()
}

fn default_auth_header() -> String {
    "Authorization".to_string()
}

fn default_allowed_origins() -> Vec<String> {
    vec!["*".to_string()]
}

fn default_allowed_methods() -> Vec<String> {
    ["GET", "POST", "PUT", "DELETE", "OPTIONS", "PATCH"]
        .iter()
        .map(|m| m.to_string())
        .collect()
}

fn default_allowed_headers() -> Vec<String> {
    [
        "Authorization",
        "Cache-Control",
        "Content-Type",
        "X-Requested-With",
        "Accept",
        "Origin",
        "X-Session-Token",
        "X-CSRF-Token",
    ]
    .iter()
    .map(|h| h.to_string())
    .collect()
}

fn default_allow_credentials() -> bool {
    true
}

fn default_cors_max_age() -> Duration {
    Duration::from_secs(3600)
}

fn default_bucket_capacity() -> u64 {
    20
}

fn default_refill_per_second() -> f64 {
    10.0
}

fn default_public_paths() -> Vec<String> {
    vec![
        "/health".to_string(),
        "/docs".to_string(),
        "/auth".to_string(),
        "/login".to_string(),
        "/logout".to_string(),
        "/fallback".to_string(),
    ]
}

#[cfg(test)]
mod tests {
    use super::*;

    fn minimal_route(id: &str, path: &str) -> RouteConfig {
        RouteConfig {
            id: id.to_string(),
            path: path.to_string(),
            target_base_url: "http://patient-service:8081".to_string(),
            strip_prefix_segments: 0,
            request_headers_add: HashMap::new(),
            response_headers_add: HashMap::new(),
            retry: RetryPolicyConfig::default(),
            circuit_breaker: BreakerConfig::default(),
            fallback: None,
        }
    }

    fn minimal_config(routes: Vec<RouteConfig>) -> Config {
        Config {
            server: ServerConfig {
                http_addr: "127.0.0.1:8080".parse().unwrap(),
            },
            routes,
            auth: AuthConfig::default(),
            cors: CorsConfig::default(),
            rate_limit: RateLimitConfig::default(),
            public_paths: default_public_paths(),
            metrics: MetricsConfig::default(),
        }
    }

    #[test]
    fn test_defaults() {
        let retry = RetryPolicyConfig::default();
        assert_eq!(retry.max_attempts, 3);
        assert_eq!(retry.base_delay, Duration::from_millis(100));
        assert_eq!(retry.max_delay, Duration::from_secs(1));
        assert!(retry.jitter);

        let cb = BreakerConfig::default();
        assert_eq!(cb.window_size, 20);
        assert_eq!(cb.min_samples, 10);
        assert_eq!(cb.failure_rate_threshold, 0.5);
        assert_eq!(cb.half_open_trials, 1);

        assert!(!AuthConfig::default().enabled);
        assert!(!RateLimitConfig::default().enabled);
    }

    #[test]
    fn test_validate_rejects_duplicate_ids() {
        let config = minimal_config(vec![
            minimal_route("patient-service", "/api/v1/patients/**"),
            minimal_route("patient-service", "/api/v1/other/**"),
        ]);
        assert!(config.validate().is_err());
    }

    #[test]
    fn test_validate_rejects_bad_target() {
        let mut route = minimal_route("patient-service", "/api/v1/patients/**");
        route.target_base_url = "ftp://patient-service".to_string();
        assert!(minimal_config(vec![route]).validate().is_err());
    }

    #[test]
    fn test_validate_rejects_bad_breaker_settings() {
        let mut route = minimal_route("patient-service", "/api/v1/patients/**");
        route.circuit_breaker.failure_rate_threshold = 1.5;
        assert!(minimal_config(vec![route]).validate().is_err());

        let mut route = minimal_route("patient-service", "/api/v1/patients/**");
        route.circuit_breaker.min_samples = 50;
        assert!(minimal_config(vec![route]).validate().is_err());
    }

    #[test]
    fn test_parse_yaml_route() {
        let yaml = r#"
server:
  http_addr: "0.0.0.0:8080"
routes:
  - id: patient-service
    path: "/api/v1/patients/**"
    target_base_url: "http://patient-service:8081"
    request_headers_add:
      X-Gateway-Request: patient-service
    response_headers_add:
      X-Gateway-Response: patient-service
    retry:
      max_attempts: 3
      base_delay: 100ms
      max_delay: 1s
    circuit_breaker:
      window_size: 4
      min_samples: 2
      open_duration: 10s
"#;
        let config: Config = serde_yaml::from_str(yaml).unwrap();
        assert_eq!(config.routes.len(), 1);
        let route = &config.routes[0];
        assert_eq!(route.fallback_service(), "patient-service");
        assert_eq!(route.circuit_breaker.window_size, 4);
        assert_eq!(route.retry.base_delay, Duration::from_millis(100));
        assert_eq!(
            route.request_headers_add.get("X-Gateway-Request").unwrap(),
            "patient-service"
        );
        config.validate().unwrap();
    }
}
