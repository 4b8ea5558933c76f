/// Metrics collection and monitoring for the edge gateway
use anyhow::Result;
use prometheus::{Histogram, HistogramOpts, IntCounter, IntCounterVec, IntGauge, Opts};
use std::time::Duration;

use crate::config::MetricsConfig;

/// Prometheus collectors for gateway traffic.
///
/// Collectors are registered in the default registry so Pingora's
/// Prometheus listener exports them without extra wiring.
pub struct MetricsCollector {
    /// Total number of requests received
    requests_total: IntCounter,
    /// Responses by status class (2xx/3xx/4xx/5xx)
    responses_total: IntCounterVec,
    /// Request duration histogram
    request_duration: Histogram,
    /// Retries performed beyond the first attempt
    upstream_retries_total: IntCounter,
    /// Fallback responses served
    fallback_total: IntCounter,
    /// Rejected authentication attempts
    auth_failures_total: IntCounter,
    /// Breakers currently not closed
    degraded_routes: IntGauge,
    /// Whether recording is active
    enabled: bool,
}

impl MetricsCollector {
    /// Create the collector, registering collectors when metrics are enabled
    pub fn new(config: &MetricsConfig) -> Result<Self> {
        let requests_total = IntCounter::with_opts(Opts::new(
            "gateway_requests_total",
            "Total number of requests received",
        ))?;
        let responses_total = IntCounterVec::new(
            Opts::new("gateway_responses_total", "Responses by status class"),
            &["class"],
        )?;
        let request_duration = Histogram::with_opts(HistogramOpts::new(
            "gateway_request_duration_seconds",
            "Request duration in seconds",
        ))?;
        let upstream_retries_total = IntCounter::with_opts(Opts::new(
            "gateway_upstream_retries_total",
            "Upstream retries performed beyond the first attempt",
        ))?;
        let fallback_total = IntCounter::with_opts(Opts::new(
            "gateway_fallback_responses_total",
            "Fallback responses served",
        ))?;
        let auth_failures_total = IntCounter::with_opts(Opts::new(
            "gateway_auth_failures_total",
            "Rejected authentication attempts",
        ))?;
        let degraded_routes = IntGauge::with_opts(Opts::new(
            "gateway_degraded_routes",
            "Routes whose circuit breaker is not closed",
        ))?;

        if config.prometheus {
            let registry = prometheus::default_registry();
            registry.register(Box::new(requests_total.clone()))?;
            registry.register(Box::new(responses_total.clone()))?;
            registry.register(Box::new(request_duration.clone()))?;
            registry.register(Box::new(upstream_retries_total.clone()))?;
            registry.register(Box::new(fallback_total.clone()))?;
            registry.register(Box::new(auth_failures_total.clone()))?;
            registry.register(Box::new(degraded_routes.clone()))?;
        }

        Ok(Self {
            requests_total,
            responses_total,
            request_duration,
            upstream_retries_total,
            fallback_total,
            auth_failures_total,
            degraded_routes,
            enabled: config.prometheus,
        })
    }

    pub fn record_request(&self) {
        if self.enabled {
            self.requests_total.inc();
        }
    }

    pub fn record_response(&self, status_code: u16, duration: Duration) {
        if !self.enabled {
            return;
        }
        let class = match status_code {
            200..=299 => "2xx",
            300..=399 => "3xx",
            400..=499 => "4xx",
            500..=599 => "5xx",
            _ => "other",
        };
        self.responses_total.with_label_values(&[class]).inc();
        self.request_duration.observe(duration.as_secs_f64());
    }

    pub fn record_retries(&self, retries: u64) {
        if self.enabled && retries > 0 {
            self.upstream_retries_total.inc_by(retries);
        }
    }

    pub fn record_fallback(&self) {
        if self.enabled {
            self.fallback_total.inc();
        }
    }

    pub fn record_auth_failure(&self) {
        if self.enabled {
            self.auth_failures_total.inc();
        }
    }

    pub fn set_degraded_routes(&self, count: usize) {
        if self.enabled {
            self.degraded_routes.set(count as i64);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_disabled_collector_records_nothing() {
        let collector = MetricsCollector::new(&MetricsConfig {
            prometheus: false,
            metrics_addr: None,
        })
        .unwrap();

        collector.record_request();
        collector.record_response(200, Duration::from_millis(5));
        collector.record_retries(2);

        assert_eq!(collector.requests_total.get(), 0);
        assert_eq!(collector.upstream_retries_total.get(), 0);
    }

    #[test]
    fn test_response_classes() {
        let collector = MetricsCollector::new(&MetricsConfig::default()).unwrap();
        // Force recording without touching the global registry
        let collector = MetricsCollector {
            enabled: true,
            ..collector
        };

        collector.record_response(204, Duration::from_millis(1));
        collector.record_response(404, Duration::from_millis(1));
        collector.record_response(503, Duration::from_millis(1));

        assert_eq!(collector.responses_total.with_label_values(&["2xx"]).get(), 1);
        assert_eq!(collector.responses_total.with_label_values(&["4xx"]).get(), 1);
        assert_eq!(collector.responses_total.with_label_values(&["5xx"]).get(), 1);
    }
}
