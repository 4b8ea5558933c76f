/// Degraded responses served when a route's upstream is unavailable
use chrono::Utc;
use serde_json::{json, Value};

/// Service name used when no route matched the failed request
pub const UNKNOWN_SERVICE: &str = "unknown";

/// Builds the stable fallback payload returned with HTTP 503.
///
/// This responder never contacts an upstream and cannot fail.
pub struct FallbackResponder {
    health_path: String,
}

impl Default for FallbackResponder {
    fn default() -> Self {
        Self::new("/health")
    }
}

impl FallbackResponder {
    pub fn new(health_path: &str) -> Self {
        Self {
            health_path: health_path.to_string(),
        }
    }

    /// Fallback body for a failed route
    pub fn body_for(&self, service: &str) -> Value {
        json!({
            "error": {
                "code": error_code(service),
                "message": message_for(service),
                "service": service,
                "timestamp": Utc::now().to_rfc3339(),
                "type": "CircuitBreakerFallback",
            },
            "status": "SERVICE_UNAVAILABLE",
            "recommendations": {
                "retry": "Please try again in a few moments",
                "alternative": format!("Check service status at {}", self.health_path),
                "support": "Contact system administrator if problem persists",
            },
        })
    }
}

/// Error code derived from a service name:
/// `patient-service` -> `PATIENT_SERVICE_UNAVAILABLE`
fn error_code(service: &str) -> String {
    if service == UNKNOWN_SERVICE {
        return "SERVICE_UNAVAILABLE".to_string();
    }
    let mut code: String = service
        .chars()
        .map(|c| match c {
            '-' | ' ' | '.' => '_',
            c => c.to_ascii_uppercase(),
        })
        .collect();
    code.push_str("_UNAVAILABLE");
    code
}

fn message_for(service: &str) -> String {
    if service == UNKNOWN_SERVICE {
        return "The requested service is currently unavailable. Please try again later."
            .to_string();
    }
    format!(
        "{} is currently unavailable. Please try again later.",
        humanize(service)
    )
}

/// `patient-service` -> `Patient service`
fn humanize(service: &str) -> String {
    let spaced = service.replace('-', " ");
    let mut chars = spaced.chars();
    match chars.next() {
        Some(first) => first.to_uppercase().collect::<String>() + chars.as_str(),
        None => spaced,
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_error_code_derivation() {
        assert_eq!(error_code("patient-service"), "PATIENT_SERVICE_UNAVAILABLE");
        assert_eq!(
            error_code("encounter-service"),
            "ENCOUNTER_SERVICE_UNAVAILABLE"
        );
        assert_eq!(error_code(UNKNOWN_SERVICE), "SERVICE_UNAVAILABLE");
    }

    #[test]
    fn test_body_schema() {
        let body = FallbackResponder::default().body_for("patient-service");

        let error = body.get("error").unwrap();
        assert_eq!(
            error.get("code").unwrap(),
            "PATIENT_SERVICE_UNAVAILABLE"
        );
        assert_eq!(error.get("service").unwrap(), "patient-service");
        assert_eq!(error.get("type").unwrap(), "CircuitBreakerFallback");
        assert!(error.get("timestamp").unwrap().as_str().is_some());
        assert_eq!(
            error.get("message").unwrap(),
            "Patient service is currently unavailable. Please try again later."
        );

        assert_eq!(body.get("status").unwrap(), "SERVICE_UNAVAILABLE");

        let recs = body.get("recommendations").unwrap();
        assert_eq!(recs.get("retry").unwrap(), "Please try again in a few moments");
        assert_eq!(
            recs.get("alternative").unwrap(),
            "Check service status at /health"
        );
        assert!(recs.get("support").unwrap().as_str().is_some());
    }

    #[test]
    fn test_unknown_service_body() {
        let body = FallbackResponder::default().body_for(UNKNOWN_SERVICE);
        let error = body.get("error").unwrap();
        assert_eq!(error.get("code").unwrap(), "SERVICE_UNAVAILABLE");
        assert_eq!(error.get("service").unwrap(), UNKNOWN_SERVICE);
    }

    #[test]
    fn test_timestamp_is_rfc3339() {
        let body = FallbackResponder::default().body_for("patient-service");
        let ts = body["error"]["timestamp"].as_str().unwrap();
        assert!(chrono::DateTime::parse_from_rfc3339(ts).is_ok());
    }
}
