/// Global CORS policy evaluation for pre-flight and actual requests
use crate::config::CorsConfig;

/// Outcome of evaluating an `OPTIONS` pre-flight request
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum PreflightDecision {
    /// Origin, method and headers are allowed; respond with these headers
    Allowed(Vec<(String, String)>),
    /// No Origin header present, so this is not a CORS request
    NoOrigin,
    /// Origin, method or a requested header is not allowed. The response
    /// carries no Access-Control-Allow-Origin header.
    Denied,
}

/// Evaluates the gateway-wide CORS configuration against requests
pub struct CorsPolicy {
    config: CorsConfig,
}

impl CorsPolicy {
    pub fn new(config: CorsConfig) -> Self {
        Self { config }
    }

    /// Check if an origin is allowed
    pub fn is_origin_allowed(&self, origin: &str) -> bool {
        self.config
            .allowed_origins
            .iter()
            .any(|allowed| allowed == "*" || allowed == origin)
    }

    fn is_method_allowed(&self, method: &str) -> bool {
        self.config
            .allowed_methods
            .iter()
            .any(|m| m.eq_ignore_ascii_case(method))
    }

    fn are_headers_allowed(&self, requested: &str) -> bool {
        requested
            .split(',')
            .map(|h| h.trim())
            .filter(|h| !h.is_empty())
            .all(|header| {
                self.config
                    .allowed_headers
                    .iter()
                    .any(|allowed| allowed.eq_ignore_ascii_case(header))
            })
    }

    /// The Access-Control-Allow-Origin value for an allowed origin.
    /// Credentialed responses must echo the origin instead of `*`.
    fn allow_origin_value(&self, origin: &str) -> String {
        if !self.config.allow_credentials && self.config.allowed_origins.iter().any(|o| o == "*") {
            "*".to_string()
        } else {
            origin.to_string()
        }
    }

    /// Evaluate a pre-flight request given the Origin,
    /// Access-Control-Request-Method and Access-Control-Request-Headers
    /// header values
    pub fn preflight(
        &self,
        origin: Option<&str>,
        requested_method: Option<&str>,
        requested_headers: Option<&str>,
    ) -> PreflightDecision {
        let origin = match origin {
            Some(origin) => origin,
            None => return PreflightDecision::NoOrigin,
        };

        if !self.is_origin_allowed(origin) {
            return PreflightDecision::Denied;
        }
        if let Some(method) = requested_method {
            if !self.is_method_allowed(method) {
                return PreflightDecision::Denied;
            }
        }
        if let Some(headers) = requested_headers {
            if !self.are_headers_allowed(headers) {
                return PreflightDecision::Denied;
            }
        }

        let mut headers = vec![
            (
                "access-control-allow-origin".to_string(),
                self.allow_origin_value(origin),
            ),
            (
                "access-control-allow-methods".to_string(),
                self.config.allowed_methods.join(", "),
            ),
            (
                "access-control-allow-headers".to_string(),
                self.config.allowed_headers.join(", "),
            ),
            (
                "access-control-max-age".to_string(),
                self.config.max_age.as_secs().to_string(),
            ),
        ];
        if self.config.allow_credentials {
            headers.push((
                "access-control-allow-credentials".to_string(),
                "true".to_string(),
            ));
        }
        headers.push(("vary".to_string(), "Origin".to_string()));

        PreflightDecision::Allowed(headers)
    }

    /// True when an actual (non-OPTIONS) request carries a disallowed origin
    pub fn denies_actual(&self, origin: Option<&str>) -> bool {
        match origin {
            Some(origin) => !self.is_origin_allowed(origin),
            None => false,
        }
    }

    /// CORS headers to attach to an actual request's response
    pub fn response_headers(&self, origin: Option<&str>) -> Vec<(String, String)> {
        let origin = match origin {
            Some(origin) if self.is_origin_allowed(origin) => origin,
            _ => return Vec::new(),
        };

        let mut headers = vec![(
            "access-control-allow-origin".to_string(),
            self.allow_origin_value(origin),
        )];
        if self.config.allow_credentials {
            headers.push((
                "access-control-allow-credentials".to_string(),
                "true".to_string(),
            ));
        }
        headers.push(("vary".to_string(), "Origin".to_string()));
        headers
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::Duration;

    fn policy(origins: &[&str]) -> CorsPolicy {
        CorsPolicy::new(CorsConfig {
            allowed_origins: origins.iter().map(|o| o.to_string()).collect(),
            allowed_methods: vec!["GET".to_string(), "POST".to_string(), "OPTIONS".to_string()],
            allowed_headers: vec!["Authorization".to_string(), "Content-Type".to_string()],
            allow_credentials: true,
            max_age: Duration::from_secs(3600),
        })
    }

    fn header<'a>(headers: &'a [(String, String)], name: &str) -> Option<&'a str> {
        headers
            .iter()
            .find(|(n, _)| n == name)
            .map(|(_, v)| v.as_str())
    }

    #[test]
    fn test_preflight_allowed_origin() {
        let decision = policy(&["https://app.example.com"]).preflight(
            Some("https://app.example.com"),
            Some("POST"),
            Some("Authorization, Content-Type"),
        );

        match decision {
            PreflightDecision::Allowed(headers) => {
                assert_eq!(
                    header(&headers, "access-control-allow-origin"),
                    Some("https://app.example.com")
                );
                assert_eq!(
                    header(&headers, "access-control-allow-credentials"),
                    Some("true")
                );
                assert_eq!(header(&headers, "access-control-max-age"), Some("3600"));
            }
            other => panic!("expected Allowed, got {:?}", other),
        }
    }

    #[test]
    fn test_preflight_disallowed_origin_has_no_allow_origin() {
        let decision = policy(&["https://app.example.com"]).preflight(
            Some("https://evil.example.com"),
            Some("GET"),
            None,
        );
        assert_eq!(decision, PreflightDecision::Denied);
    }

    #[test]
    fn test_preflight_disallowed_method() {
        let decision = policy(&["*"]).preflight(
            Some("https://app.example.com"),
            Some("DELETE"),
            None,
        );
        assert_eq!(decision, PreflightDecision::Denied);
    }

    #[test]
    fn test_preflight_disallowed_header() {
        let decision = policy(&["*"]).preflight(
            Some("https://app.example.com"),
            Some("POST"),
            Some("X-Custom-Secret"),
        );
        assert_eq!(decision, PreflightDecision::Denied);
    }

    #[test]
    fn test_preflight_without_origin_is_not_cors() {
        assert_eq!(
            policy(&["*"]).preflight(None, None, None),
            PreflightDecision::NoOrigin
        );
    }

    #[test]
    fn test_wildcard_with_credentials_echoes_origin() {
        let decision =
            policy(&["*"]).preflight(Some("https://app.example.com"), Some("GET"), None);
        match decision {
            PreflightDecision::Allowed(headers) => {
                assert_eq!(
                    header(&headers, "access-control-allow-origin"),
                    Some("https://app.example.com")
                );
            }
            other => panic!("expected Allowed, got {:?}", other),
        }
    }

    #[test]
    fn test_actual_request_headers() {
        let policy = policy(&["https://app.example.com"]);

        let headers = policy.response_headers(Some("https://app.example.com"));
        assert_eq!(
            header(&headers, "access-control-allow-origin"),
            Some("https://app.example.com")
        );

        assert!(policy.response_headers(None).is_empty());
        assert!(policy
            .response_headers(Some("https://evil.example.com"))
            .is_empty());
    }

    #[test]
    fn test_denies_actual() {
        let policy = policy(&["https://app.example.com"]);
        assert!(policy.denies_actual(Some("https://evil.example.com")));
        assert!(!policy.denies_actual(Some("https://app.example.com")));
        assert!(!policy.denies_actual(None));
    }
}
