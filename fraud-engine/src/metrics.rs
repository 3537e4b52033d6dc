//! Metrics collection for observability
//!
//! # Metrics
//!
//! - `fraud_evaluations_total{status, decision}` - Completed and failed evaluations
//! - `fraud_rule_matches_total{rule_type}` - Matched rule executions
//! - `fraud_degraded_calls_total{source}` - Assessor errors, timeouts and unresolved lookups
//! - `fraud_alerts_total` - Alerts raised
//! - `fraud_evaluation_duration_seconds` - Evaluation latency

use prometheus::{Histogram, HistogramOpts, IntCounter, IntCounterVec, Opts, Registry};
use std::sync::Arc;

/// Metrics collector, registered on its own registry
#[derive(Clone)]
pub struct Metrics {
    /// Evaluations by terminal status and decision
    pub evaluations_total: IntCounterVec,
    /// Matched rules by rule type
    pub rule_matches_total: IntCounterVec,
    /// Degraded calls by source
    pub degraded_calls_total: IntCounterVec,
    /// Alerts raised
    pub alerts_total: IntCounter,
    /// Evaluation latency in seconds
    pub evaluation_duration: Histogram,
    /// Registry owning the collectors
    pub registry: Arc<Registry>,
}

impl Metrics {
    /// Create new metrics collector
    pub fn new() -> prometheus::Result<Self> {
        let registry = Arc::new(Registry::new());

        let evaluations_total = IntCounterVec::new(
            Opts::new("fraud_evaluations_total", "Fraud evaluations by status and decision"),
            &["status", "decision"],
        )?;
        registry.register(Box::new(evaluations_total.clone()))?;

        let rule_matches_total = IntCounterVec::new(
            Opts::new("fraud_rule_matches_total", "Matched rule executions by rule type"),
            &["rule_type"],
        )?;
        registry.register(Box::new(rule_matches_total.clone()))?;

        let degraded_calls_total = IntCounterVec::new(
            Opts::new("fraud_degraded_calls_total", "Degraded assessor calls by source"),
            &["source"],
        )?;
        registry.register(Box::new(degraded_calls_total.clone()))?;

        let alerts_total = IntCounter::new("fraud_alerts_total", "Fraud alerts raised")?;
        registry.register(Box::new(alerts_total.clone()))?;

        let evaluation_duration = Histogram::with_opts(
            HistogramOpts::new("fraud_evaluation_duration_seconds", "Evaluation latency").buckets(vec![
                0.001, 0.005, 0.010, 0.025, 0.050, 0.100, 0.250, 0.500, 1.0, 2.5,
            ]),
        )?;
        registry.register(Box::new(evaluation_duration.clone()))?;

        Ok(Self {
            evaluations_total,
            rule_matches_total,
            degraded_calls_total,
            alerts_total,
            evaluation_duration,
            registry,
        })
    }

    /// Record a finished evaluation; failed checks use decision "NONE"
    pub fn record_evaluation(&self, status: &str, decision: &str, duration_seconds: f64) {
        self.evaluations_total.with_label_values(&[status, decision]).inc();
        self.evaluation_duration.observe(duration_seconds);
    }

    /// Count a matched rule
    pub fn record_rule_match(&self, rule_type: &str) {
        self.rule_matches_total.with_label_values(&[rule_type]).inc();
    }

    /// Count a degraded call
    pub fn record_degraded(&self, source: &str) {
        self.degraded_calls_total.with_label_values(&[source]).inc();
    }

    /// Count a raised alert
    pub fn record_alert(&self) {
        self.alerts_total.inc();
    }

    /// Get metrics registry
    pub fn registry(&self) -> &Registry {
        &self.registry
    }
}
