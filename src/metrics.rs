//! Prometheus metrics for handoff monitoring.
//!
//! This module provides Prometheus metrics exposition for the handoff
//! service, covering request outcomes, verification attempts and code
//! generation behavior.
//!
//! Metrics are organized into two categories:
//! - **Counters**: Cumulative totals (requests by outcome, validations by
//!   stage and outcome, generator re-draws)
//! - **Histograms**: Distributions (attempts needed per successful
//!   verification)
//!
//! All metrics use labels for drill-down by stage and outcome.

#[cfg(feature = "metrics")]
use prometheus::{CounterVec, HistogramVec, Opts, Registry};

#[cfg(feature = "metrics")]
use crate::error::Result;
#[cfg(feature = "metrics")]
use crate::request::CodeStage;

/// Prometheus metrics registry for the handoff service.
#[cfg(feature = "metrics")]
#[derive(Clone)]
pub struct HandoffMetrics {
    registry: Registry,

    // Counters (cumulative totals)
    requests_total: CounterVec,
    verifications_total: CounterVec,
    code_redraws_total: CounterVec,

    // Histograms (distributions)
    attempts_per_verification: HistogramVec,
}

#[cfg(feature = "metrics")]
impl HandoffMetrics {
    /// Create a new HandoffMetrics instance with the given registry.
    ///
    /// Registers all metrics with the provided Prometheus registry.
    ///
    /// # Errors
    ///
    /// Returns an error if metrics fail to register (e.g., duplicate
    /// registration).
    pub fn new(registry: Registry) -> Result<Self> {
        let requests_total = CounterVec::new(
            Opts::new(
                "handoff_requests_total",
                "Total number of requests by lifecycle outcome",
            ),
            &["outcome"],
        )
        .map_err(|e| anyhow::anyhow!("Failed to create requests_total counter: {}", e))?;

        let verifications_total = CounterVec::new(
            Opts::new(
                "handoff_verifications_total",
                "Total number of code validations by stage and outcome",
            ),
            &["stage", "outcome"],
        )
        .map_err(|e| anyhow::anyhow!("Failed to create verifications_total counter: {}", e))?;

        let code_redraws_total = CounterVec::new(
            Opts::new(
                "handoff_code_redraws_total",
                "Total number of generator re-draws caused by active-code collisions",
            ),
            &["stage"],
        )
        .map_err(|e| anyhow::anyhow!("Failed to create code_redraws_total counter: {}", e))?;

        let attempts_per_verification = HistogramVec::new(
            prometheus::HistogramOpts::new(
                "handoff_attempts_per_verification",
                "Attempts consumed before a stage verified successfully",
            )
            .buckets(vec![1.0, 2.0, 3.0, 4.0, 5.0]),
            &["stage"],
        )
        .map_err(|e| {
            anyhow::anyhow!("Failed to create attempts_per_verification histogram: {}", e)
        })?;

        registry
            .register(Box::new(requests_total.clone()))
            .map_err(|e| anyhow::anyhow!("Failed to register requests_total: {}", e))?;
        registry
            .register(Box::new(verifications_total.clone()))
            .map_err(|e| anyhow::anyhow!("Failed to register verifications_total: {}", e))?;
        registry
            .register(Box::new(code_redraws_total.clone()))
            .map_err(|e| anyhow::anyhow!("Failed to register code_redraws_total: {}", e))?;
        registry
            .register(Box::new(attempts_per_verification.clone()))
            .map_err(|e| anyhow::anyhow!("Failed to register attempts_per_verification: {}", e))?;

        Ok(Self {
            registry,
            requests_total,
            verifications_total,
            code_redraws_total,
            attempts_per_verification,
        })
    }

    /// Get the underlying Prometheus registry.
    ///
    /// Useful for exporting metrics via HTTP endpoint.
    pub fn registry(&self) -> &Registry {
        &self.registry
    }

    /// Record a request reaching a lifecycle outcome
    /// (accepted/rejected/completed).
    pub fn record_request(&self, outcome: &str) {
        self.requests_total.with_label_values(&[outcome]).inc();
    }

    /// Record a validation outcome for a stage
    /// (verified/mismatch/exhausted).
    pub fn record_verification(&self, stage: CodeStage, outcome: &str) {
        self.verifications_total
            .with_label_values(&[stage.as_str(), outcome])
            .inc();
    }

    /// Record a generator re-draw caused by a collision.
    pub fn record_redraw(&self, stage: CodeStage) {
        self.code_redraws_total
            .with_label_values(&[stage.as_str()])
            .inc();
    }

    /// Record how many attempts a successful verification consumed.
    pub fn observe_attempts(&self, stage: CodeStage, attempts: u32) {
        self.attempts_per_verification
            .with_label_values(&[stage.as_str()])
            .observe(attempts as f64);
    }
}

#[cfg(all(test, feature = "metrics"))]
mod tests {
    use super::*;

    #[test]
    fn test_metrics_creation() {
        let registry = Registry::new();
        let _metrics = HandoffMetrics::new(registry.clone()).unwrap();

        let families = registry.gather();
        assert!(families.len() >= 4);

        let metric_names: Vec<String> = families.iter().map(|f| f.get_name().to_string()).collect();
        assert!(metric_names.contains(&"handoff_requests_total".to_string()));
        assert!(metric_names.contains(&"handoff_verifications_total".to_string()));
        assert!(metric_names.contains(&"handoff_code_redraws_total".to_string()));
    }

    #[test]
    fn test_record_verification_metrics() {
        let registry = Registry::new();
        let metrics = HandoffMetrics::new(registry.clone()).unwrap();

        metrics.record_verification(CodeStage::Pickup, "mismatch");
        metrics.record_verification(CodeStage::Pickup, "verified");
        metrics.observe_attempts(CodeStage::Pickup, 2);

        let families = registry.gather();
        let verifications = families
            .iter()
            .find(|f| f.get_name() == "handoff_verifications_total")
            .expect("verifications_total metric not found");

        let verified = verifications
            .get_metric()
            .iter()
            .find(|m| {
                m.get_label()
                    .iter()
                    .any(|l| l.get_name() == "outcome" && l.get_value() == "verified")
            })
            .expect("verified outcome not found");

        assert_eq!(verified.get_counter().get_value(), 1.0);
    }

    #[test]
    fn test_redraw_metrics() {
        let registry = Registry::new();
        let metrics = HandoffMetrics::new(registry.clone()).unwrap();

        metrics.record_redraw(CodeStage::Pickup);
        metrics.record_redraw(CodeStage::Pickup);
        metrics.record_redraw(CodeStage::Delivery);

        let families = registry.gather();
        let redraws = families
            .iter()
            .find(|f| f.get_name() == "handoff_code_redraws_total")
            .expect("code_redraws_total metric not found");

        // Two stages tracked separately
        assert_eq!(redraws.get_metric().len(), 2);
    }
}
