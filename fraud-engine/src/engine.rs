//! Evaluation orchestration
//!
//! Ties the velocity, device, pattern and geolocation components to the rule
//! engine and decision aggregator behind a single `evaluate` call.
//!
//! # Example
//!
//! ```no_run
//! use fraud_engine::{EngineConfig, FraudEngine, InMemoryStore, RequestContext, StaticIpIntelligence};
//! use std::collections::HashMap;
//! use std::sync::Arc;
//!
//! # async fn run(ctx: RequestContext) -> fraud_engine::Result<()> {
//! let store = Arc::new(InMemoryStore::new());
//! let engine = FraudEngine::new(
//!     EngineConfig::default(),
//!     store.clone(),
//!     store,
//!     Arc::new(StaticIpIntelligence::new(HashMap::new())),
//! )?;
//!
//! let outcome = engine.evaluate(ctx).await?;
//! println!("{:?}", outcome.check.decision);
//! # Ok(())
//! # }
//! ```

use crate::config::EngineConfig;
use crate::device::DeviceReputationTracker;
use crate::geolocation::{GeolocationAssessor, IpIntelligence};
use crate::metrics::Metrics;
use crate::patterns::PatternMatcher;
use crate::rules::{prepare_rules, EvaluationScope, ParsedRule, RuleEngine};
use crate::scoring::DecisionAggregator;
use crate::store::{PatternStore, RuleStore};
use crate::types::{
    DeviceFingerprint, EntityType, EvaluationOutcome, FraudCheck, FraudRuleExecution, GeolocationCheck,
    RequestContext, VelocityCheck,
};
use crate::velocity::VelocityTracker;
use crate::{Error, Result};
use chrono::{DateTime, Utc};
use parking_lot::RwLock;
use std::sync::Arc;
use std::time::Duration;
use tokio::time::{timeout_at, Instant};
use tracing::{error, info, warn};

struct RuleSnapshot {
    rules: Arc<Vec<ParsedRule>>,
    loaded_at: Instant,
}

/// Parts gathered before a check reaches a terminal state
struct Partial {
    executions: Vec<FraudRuleExecution>,
    geolocation: GeolocationCheck,
    velocity_checks: Vec<VelocityCheck>,
}

/// Fraud decision engine; share via `Arc` across request handlers
pub struct FraudEngine {
    config: EngineConfig,
    rule_store: Arc<dyn RuleStore>,
    rule_cache: RwLock<Option<RuleSnapshot>>,
    rules: RuleEngine,
    aggregator: DecisionAggregator,
    velocity: Arc<VelocityTracker>,
    devices: Arc<DeviceReputationTracker>,
    patterns: Arc<PatternMatcher>,
    metrics: Metrics,
}

impl FraudEngine {
    /// Build an engine from configuration and its collaborators
    pub fn new(
        config: EngineConfig,
        rule_store: Arc<dyn RuleStore>,
        pattern_store: Arc<dyn PatternStore>,
        intel: Arc<dyn IpIntelligence>,
    ) -> Result<Self> {
        config.validate()?;

        let velocity = Arc::new(VelocityTracker::new(chrono::Duration::seconds(
            config.velocity.max_window_secs,
        )));
        let devices = Arc::new(DeviceReputationTracker::new(config.device.clone()));
        let patterns = Arc::new(PatternMatcher::new(
            pattern_store,
            Duration::from_secs(config.patterns.refresh_interval_secs),
        ));
        let geolocation = Arc::new(GeolocationAssessor::new(
            intel,
            config.geolocation.clone(),
            config.timeouts.per_call(),
        ));

        let rules = RuleEngine::new(
            velocity.clone(),
            geolocation,
            devices.clone(),
            patterns.clone(),
            config.scoring.clone(),
        );
        let aggregator = DecisionAggregator::new(config.scoring.thresholds, config.alerting.clone());

        Ok(Self {
            config,
            rule_store,
            rule_cache: RwLock::new(None),
            rules,
            aggregator,
            velocity,
            devices,
            patterns,
            metrics: Metrics::new()?,
        })
    }

    /// Evaluate a payment attempt now
    pub async fn evaluate(&self, ctx: RequestContext) -> Result<EvaluationOutcome> {
        self.evaluate_at(ctx, Utc::now()).await
    }

    /// Evaluate a payment attempt at an explicit instant.
    ///
    /// Structural failures come back as a FAILED check, not as `Err`.
    pub async fn evaluate_at(&self, ctx: RequestContext, at: DateTime<Utc>) -> Result<EvaluationOutcome> {
        let started = Instant::now();
        let deadline = started + self.config.timeouts.overall();

        let mut check = FraudCheck::new(&ctx, at);
        check.start_processing()?;
        info!(
            check_id = %check.id,
            payment_id = %ctx.payment_id,
            amount = ctx.amount,
            currency = %ctx.currency,
            "fraud evaluation started"
        );

        // The attempt counts towards its own velocity and device history
        for entity in EntityType::ALL {
            if let Some(value) = ctx.entity_value(entity) {
                self.velocity.observe(entity, &value, ctx.amount, at);
            }
        }
        let device = ctx
            .entity_value(EntityType::Device)
            .map(|hash| self.devices.touch(&hash, &ctx.user_agent, &ctx.device, at, false));

        let scope = EvaluationScope::new(check.id, &ctx, at, device.clone());

        let rules = match self.active_rules(deadline).await {
            Ok(rules) => rules,
            Err(e) => {
                // Every check carries a geolocation record, failed ones included
                let partial = Partial {
                    executions: Vec::new(),
                    geolocation: self.rules.final_geolocation(&scope, deadline).await,
                    velocity_checks: Vec::new(),
                };
                return self.fail(check, device, partial, e, at, started);
            }
        };

        let refresh_deadline = (Instant::now() + self.config.timeouts.per_call()).min(deadline);
        if timeout_at(refresh_deadline, self.patterns.ensure_fresh())
            .await
            .is_err()
        {
            warn!("pattern refresh timed out");
            self.metrics.record_degraded("patterns");
        }

        let evaluation = self.rules.evaluate(&scope, &rules, deadline).await;
        let geolocation = self.rules.final_geolocation(&scope, deadline).await;

        let mut notes = Vec::new();
        if !geolocation.resolved {
            self.metrics.record_degraded("geolocation");
            if let Some(note) = &geolocation.note {
                notes.push(note.clone());
            }
        }
        for execution in &evaluation.executions {
            if execution.matched {
                self.metrics.record_rule_match(&execution.rule_type.to_string());
            } else if execution.details.get("timeout").is_some() {
                self.metrics.record_degraded("rule_timeout");
            } else if execution.details.get("error").is_some() {
                self.metrics.record_degraded("rule_error");
            }
        }
        notes.extend(evaluation.notes);

        let partial = Partial {
            executions: evaluation.executions,
            geolocation,
            velocity_checks: evaluation.velocity_checks,
        };

        let verdict = match self.aggregator.aggregate(&partial.executions, &notes) {
            Ok(verdict) => verdict,
            Err(e) => return self.fail(check, device, partial, e, at, started),
        };

        check.complete(
            verdict.risk_score,
            verdict.risk_level,
            verdict.decision,
            verdict.reasons,
            at.max(Utc::now()),
        )?;

        let alerts: Vec<_> = self.aggregator.alert_for(&check).into_iter().collect();
        for alert in &alerts {
            self.metrics.record_alert();
            warn!(
                check_id = %check.id,
                alert_type = %alert.alert_type,
                severity = ?alert.severity,
                "fraud alert raised"
            );
        }

        let elapsed = started.elapsed();
        self.metrics.record_evaluation(
            &check.status.to_string(),
            &verdict.decision.to_string(),
            elapsed.as_secs_f64(),
        );
        info!(
            check_id = %check.id,
            decision = %verdict.decision,
            risk_level = ?verdict.risk_level,
            risk_score = verdict.risk_score.value(),
            elapsed_ms = elapsed.as_millis() as u64,
            "fraud evaluation completed"
        );

        Ok(EvaluationOutcome {
            check,
            executions: partial.executions,
            geolocation: partial.geolocation,
            device,
            velocity_checks: partial.velocity_checks,
            alerts,
        })
    }

    fn fail(
        &self,
        mut check: FraudCheck,
        device: Option<DeviceFingerprint>,
        partial: Partial,
        cause: Error,
        at: DateTime<Utc>,
        started: Instant,
    ) -> Result<EvaluationOutcome> {
        if cause.is_structural() {
            error!(check_id = %check.id, "fraud evaluation failed: {}", cause);
        } else {
            warn!(check_id = %check.id, "fraud evaluation failed: {}", cause);
        }
        check.fail(cause.to_string(), at.max(Utc::now()))?;
        self.metrics
            .record_evaluation(&check.status.to_string(), "NONE", started.elapsed().as_secs_f64());

        Ok(EvaluationOutcome {
            check,
            executions: partial.executions,
            geolocation: partial.geolocation,
            device,
            velocity_checks: partial.velocity_checks,
            alerts: Vec::new(),
        })
    }

    /// Parsed active rules, served from the snapshot while it is fresh.
    ///
    /// A store that fails or does not answer before `deadline` falls back to
    /// the previous snapshot when there is one.
    async fn active_rules(&self, deadline: Instant) -> Result<Arc<Vec<ParsedRule>>> {
        let ttl = Duration::from_secs(self.config.rules.cache_ttl_secs);
        let cached = self
            .rule_cache
            .read()
            .as_ref()
            .map(|s| (s.rules.clone(), s.loaded_at));
        if let Some((rules, loaded_at)) = &cached {
            if loaded_at.elapsed() < ttl {
                return Ok(rules.clone());
            }
        }

        let listed = match timeout_at(deadline, self.rule_store.list_active_rules()).await {
            Ok(listed) => listed,
            Err(_) => Err(Error::Timeout(self.config.timeouts.overall_ms)),
        };
        let loaded = match listed {
            Ok(rules) => rules,
            Err(e) => match cached {
                Some((rules, _)) => {
                    warn!("Rule store unavailable, serving previous rule snapshot: {}", e);
                    return Ok(rules);
                }
                None => return Err(e),
            },
        };

        let rules = Arc::new(prepare_rules(loaded)?);
        info!("Loaded {} active fraud rules", rules.len());
        *self.rule_cache.write() = Some(RuleSnapshot {
            rules: rules.clone(),
            loaded_at: Instant::now(),
        });
        Ok(rules)
    }

    /// Drop the rule snapshot so the next evaluation reloads
    pub fn invalidate_rules(&self) {
        *self.rule_cache.write() = None;
    }

    /// Effective configuration
    pub fn config(&self) -> &EngineConfig {
        &self.config
    }

    /// Prometheus collectors for this engine
    pub fn metrics(&self) -> &Metrics {
        &self.metrics
    }

    /// Velocity state, for manual resets
    pub fn velocity_tracker(&self) -> &Arc<VelocityTracker> {
        &self.velocity
    }

    /// Device state, for fraud feedback and moderation
    pub fn device_tracker(&self) -> &Arc<DeviceReputationTracker> {
        &self.devices
    }

    /// Pattern snapshot, for manual loads and refreshes
    pub fn pattern_matcher(&self) -> &Arc<PatternMatcher> {
        &self.patterns
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::geolocation::StaticIpIntelligence;
    use crate::store::InMemoryStore;
    use crate::types::{DeviceAttributes, FraudCheckStatus, FraudRule, RuleAction, RuleType};
    use async_trait::async_trait;
    use serde_json::json;
    use std::collections::HashMap;
    use uuid::Uuid;

    fn ctx() -> RequestContext {
        RequestContext {
            payment_id: Uuid::new_v4(),
            merchant_id: Uuid::new_v4(),
            customer_id: Uuid::new_v4(),
            amount: 20_000,
            currency: "USD".into(),
            ip_address: "10.0.0.1".into(),
            country: "US".into(),
            user_agent: "ua".into(),
            email: "a@example.com".into(),
            phone_number: None,
            device_fingerprint: Some("fp-1".into()),
            device: DeviceAttributes::default(),
            card_token: None,
            billing_address: None,
            shipping_address: None,
            metadata: HashMap::new(),
        }
    }

    fn amount_rule() -> FraudRule {
        FraudRule {
            id: Uuid::new_v4(),
            name: "big".into(),
            description: String::new(),
            rule_type: RuleType::Amount,
            conditions: json!({ "above": 10_000 }),
            action: RuleAction::Review,
            weight: 30.0,
            is_active: true,
            priority: 1,
        }
    }

    /// Rule store that never answers in time
    struct StalledRules(Duration);

    #[async_trait]
    impl RuleStore for StalledRules {
        async fn list_active_rules(&self) -> Result<Vec<FraudRule>> {
            tokio::time::sleep(self.0).await;
            Ok(vec![amount_rule()])
        }
    }

    fn engine(store: Arc<InMemoryStore>) -> FraudEngine {
        FraudEngine::new(
            EngineConfig::default(),
            store.clone(),
            store,
            Arc::new(StaticIpIntelligence::new(HashMap::new())),
        )
        .unwrap()
    }

    #[tokio::test]
    async fn test_no_rules_fails_without_decision() {
        let engine = engine(Arc::new(InMemoryStore::new()));
        let outcome = engine.evaluate(ctx()).await.unwrap();
        assert_eq!(outcome.check.status, FraudCheckStatus::Failed);
        assert!(outcome.check.decision.is_none());
        assert!(outcome.check.failure_reason.unwrap().contains("No active fraud rules"));
        assert_eq!(
            engine
                .metrics()
                .evaluations_total
                .with_label_values(&["FAILED", "NONE"])
                .get(),
            1
        );
    }

    #[tokio::test]
    async fn test_rule_snapshot_is_cached_until_invalidated() {
        let store = Arc::new(InMemoryStore::new());
        let rule = FraudRule {
            id: Uuid::new_v4(),
            name: "big".into(),
            description: String::new(),
            rule_type: RuleType::Amount,
            conditions: json!({ "above": 10_000 }),
            action: RuleAction::Review,
            weight: 30.0,
            is_active: true,
            priority: 1,
        };
        store.upsert_rule(rule.clone());
        let engine = engine(store.clone());

        let first = engine.evaluate(ctx()).await.unwrap();
        assert_eq!(first.check.decision, Some(crate::types::Decision::Review));

        store.remove_rule(rule.id);
        let cached = engine.evaluate(ctx()).await.unwrap();
        assert_eq!(cached.check.status, FraudCheckStatus::Completed);

        engine.invalidate_rules();
        let reloaded = engine.evaluate(ctx()).await.unwrap();
        assert_eq!(reloaded.check.status, FraudCheckStatus::Failed);
    }

    #[tokio::test]
    async fn test_evaluation_touches_device_and_velocity() {
        let store = Arc::new(InMemoryStore::new());
        store.upsert_rule(FraudRule {
            id: Uuid::new_v4(),
            name: "small".into(),
            description: String::new(),
            rule_type: RuleType::Amount,
            conditions: json!({ "below": 100 }),
            action: RuleAction::Review,
            weight: 10.0,
            is_active: true,
            priority: 1,
        });
        let engine = engine(store);

        engine.evaluate(ctx()).await.unwrap();
        let outcome = engine.evaluate(ctx()).await.unwrap();
        assert_eq!(outcome.device.unwrap().transaction_count, 2);
        assert!(engine.velocity_tracker().tracked_entities() > 0);
        // Unknown IP in the static table degrades geolocation
        let geo = outcome.geolocation;
        assert!(!geo.resolved);
        assert_eq!(outcome.check.reasons.last(), geo.note.as_ref());
    }

    #[tokio::test(start_paused = true)]
    async fn test_stalled_rule_store_is_bounded_by_overall_deadline() {
        let config = EngineConfig::default();
        let overall = config.timeouts.overall();
        let engine = FraudEngine::new(
            config,
            Arc::new(StalledRules(Duration::from_secs(30))),
            Arc::new(InMemoryStore::new()),
            Arc::new(StaticIpIntelligence::new(HashMap::new())),
        )
        .unwrap();

        let started = Instant::now();
        let outcome = engine.evaluate(ctx()).await.unwrap();

        assert!(started.elapsed() <= overall);
        assert_eq!(outcome.check.status, FraudCheckStatus::Failed);
        assert!(outcome.check.failure_reason.unwrap().contains("Timed out"));
    }

    #[tokio::test]
    async fn test_replayed_evaluation_never_finishes_before_it_started() {
        let store = Arc::new(InMemoryStore::new());
        store.upsert_rule(amount_rule());
        let engine = engine(store);

        let future = Utc::now() + chrono::Duration::days(1);
        let outcome = engine.evaluate_at(ctx(), future).await.unwrap();
        assert_eq!(outcome.check.status, FraudCheckStatus::Completed);
        assert!(outcome.check.processed_at.unwrap() >= outcome.check.created_at);
    }
}
