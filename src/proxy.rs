/// Upstream HTTP client performing single proxied call attempts
use anyhow::{anyhow, Result};
use bytes::Bytes;
use log::debug;
use std::time::Duration;

/// One failed call attempt, classified for the retry executor.
///
/// 4xx and other upstream statuses are not errors at this layer; any
/// response the upstream produced is returned as an `UpstreamResponse`.
#[derive(Debug, Clone)]
pub enum CallError {
    /// Connection or transport failure before a response arrived
    Connect(String),
    /// The attempt exceeded its per-call timeout
    Timeout,
    /// The upstream answered with a 5xx status
    Status(u16),
}

impl std::fmt::Display for CallError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            CallError::Connect(msg) => write!(f, "connection failed: {}", msg),
            CallError::Timeout => write!(f, "call timed out"),
            CallError::Status(code) => write!(f, "upstream returned {}", code),
        }
    }
}

/// A fully buffered upstream response
#[derive(Debug, Clone)]
pub struct UpstreamResponse {
    pub status: u16,
    /// Header name/value pairs in upstream order
    pub headers: Vec<(String, Vec<u8>)>,
    pub body: Bytes,
}

impl UpstreamResponse {
    pub fn is_server_error(&self) -> bool {
        self.status >= 500
    }

    pub fn is_client_error(&self) -> bool {
        (400..500).contains(&self.status)
    }
}

/// Outbound request assembled by the dispatcher
#[derive(Debug, Clone)]
pub struct UpstreamRequest {
    pub method: String,
    pub url: String,
    /// Header name/value pairs after hop-by-hop filtering and injection
    pub headers: Vec<(String, Vec<u8>)>,
    pub body: Bytes,
}

/// Build the target URL from a route's base URL and the rewritten path
pub fn target_url(base_url: &str, path: &str, query: Option<&str>) -> String {
    let base = base_url.trim_end_matches('/');
    match query {
        Some(query) if !query.is_empty() => format!("{}{}?{}", base, path, query),
        _ => format!("{}{}", base, path),
    }
}

/// Headers that must not be forwarded through a proxy
pub fn is_hop_by_hop(name: &str) -> bool {
    name.eq_ignore_ascii_case("connection")
        || name.eq_ignore_ascii_case("keep-alive")
        || name.eq_ignore_ascii_case("proxy-authenticate")
        || name.eq_ignore_ascii_case("proxy-authorization")
        || name.eq_ignore_ascii_case("proxy-connection")
        || name.eq_ignore_ascii_case("te")
        || name.eq_ignore_ascii_case("trailer")
        || name.eq_ignore_ascii_case("transfer-encoding")
        || name.eq_ignore_ascii_case("upgrade")
}

/// HTTP client for forwarding requests to upstream services
pub struct UpstreamClient {
    client: reqwest::Client,
}

impl UpstreamClient {
    /// Create a client with connection pooling and keep-alive tuned for
    /// long-lived service-to-service traffic
    pub fn new() -> Result<Self> {
        let client = reqwest::Client::builder()
            .tcp_keepalive(Duration::from_secs(30))
            .pool_max_idle_per_host(10)
            .pool_idle_timeout(Duration::from_secs(90))
            .build()
            .map_err(|e| anyhow!("Failed to create upstream HTTP client: {}", e))?;
        Ok(Self { client })
    }

    /// Perform one proxied call attempt.
    ///
    /// Any status the upstream produced, 5xx included, comes back as a
    /// response; the retry executor decides what is retryable.
    pub async fn call(
        &self,
        request: &UpstreamRequest,
        timeout: Duration,
    ) -> Result<UpstreamResponse, CallError> {
        let method = reqwest::Method::from_bytes(request.method.as_bytes())
            .map_err(|e| CallError::Connect(format!("invalid method: {}", e)))?;

        let mut outbound = self.client.request(method, &request.url).timeout(timeout);

        for (name, value) in &request.headers {
            let name = reqwest::header::HeaderName::from_bytes(name.as_bytes())
                .map_err(|e| CallError::Connect(format!("invalid header name: {}", e)))?;
            let value = reqwest::header::HeaderValue::from_bytes(value)
                .map_err(|e| CallError::Connect(format!("invalid header value: {}", e)))?;
            outbound = outbound.header(name, value);
        }

        if !request.body.is_empty() {
            outbound = outbound.body(request.body.clone());
        }

        debug!("Forwarding {} {}", request.method, request.url);

        let response = outbound.send().await.map_err(|e| {
            if e.is_timeout() {
                CallError::Timeout
            } else {
                CallError::Connect(e.to_string())
            }
        })?;

        let status = response.status().as_u16();
        let headers = response
            .headers()
            .iter()
            .map(|(name, value)| (name.as_str().to_string(), value.as_bytes().to_vec()))
            .collect();
        let body = response.bytes().await.map_err(|e| {
            if e.is_timeout() {
                CallError::Timeout
            } else {
                CallError::Connect(e.to_string())
            }
        })?;

        Ok(UpstreamResponse {
            status,
            headers,
            body,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_target_url() {
        assert_eq!(
            target_url("http://patient-service:8081", "/api/v1/patients/123", None),
            "http://patient-service:8081/api/v1/patients/123"
        );
        assert_eq!(
            target_url("http://patient-service:8081/", "/health", None),
            "http://patient-service:8081/health"
        );
        assert_eq!(
            target_url("http://patient-service:8081", "/api/v1/patients", Some("page=2")),
            "http://patient-service:8081/api/v1/patients?page=2"
        );
        assert_eq!(
            target_url("http://patient-service:8081", "/api/v1/patients", Some("")),
            "http://patient-service:8081/api/v1/patients"
        );
    }

    #[test]
    fn test_hop_by_hop_headers() {
        assert!(is_hop_by_hop("Connection"));
        assert!(is_hop_by_hop("transfer-encoding"));
        assert!(is_hop_by_hop("Keep-Alive"));
        assert!(!is_hop_by_hop("Authorization"));
        assert!(!is_hop_by_hop("Content-Type"));
    }

    #[test]
    fn test_response_classification() {
        let resp = |status| UpstreamResponse {
            status,
            headers: Vec::new(),
            body: Bytes::new(),
        };
        assert!(resp(502).is_server_error());
        assert!(!resp(502).is_client_error());
        assert!(resp(404).is_client_error());
        assert!(!resp(200).is_server_error());
        assert!(!resp(200).is_client_error());
    }
}
