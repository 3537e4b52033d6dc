//! Rule evaluation
//!
//! Rules are parsed into typed conditions up front (a bad condition fails the
//! whole check), then evaluated concurrently against the request. Each rule
//! yields exactly one execution record; a failing or slow assessor only
//! costs its own rule.

use crate::config::ScoringConfig;
use crate::device::DeviceReputationTracker;
use crate::geolocation::GeolocationAssessor;
use crate::patterns::PatternMatcher;
use crate::types::{
    DeviceFingerprint, EntityType, FraudRule, FraudRuleExecution, GeolocationCheck,
    RequestContext, RiskLevel, RuleType, ThresholdKind, VelocityCheck, VelocityWindow,
};
use crate::velocity::VelocityTracker;
use crate::{Error, Result};
use chrono::{DateTime, Utc};
use futures::future::join_all;
use serde::{Deserialize, Serialize};
use serde_json::json;
use std::sync::Arc;
use tokio::sync::OnceCell;
use tokio::time::{timeout_at, Instant};
use tracing::{debug, info, warn};
use uuid::Uuid;

/// VELOCITY condition
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct VelocityCondition {
    /// Entity whose history is counted
    pub entity: EntityType,
    /// Window length label
    pub window: VelocityWindow,
    /// Limit on the observed value
    pub threshold: i64,
    /// Compare count or total amount
    #[serde(default)]
    pub threshold_kind: ThresholdKind,
}

/// Flags a GEOLOCATION rule can fire on
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum GeoFlag {
    /// Proxy IP
    Proxy,
    /// VPN IP
    Vpn,
    /// Tor exit node
    Tor,
    /// High-risk country
    HighRiskCountry,
}

impl GeoFlag {
    fn is_set(&self, check: &GeolocationCheck) -> bool {
        match self {
            GeoFlag::Proxy => check.is_proxy,
            GeoFlag::Vpn => check.is_vpn,
            GeoFlag::Tor => check.is_tor,
            GeoFlag::HighRiskCountry => check.is_high_risk_country,
        }
    }
}

/// GEOLOCATION condition
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct GeolocationCondition {
    /// Any one of these flags matches
    pub flags: Vec<GeoFlag>,
}

/// PATTERN condition
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PatternCondition {
    /// Entity looked up in the pattern snapshot
    pub entity: EntityType,
    /// Ignore patterns below this severity
    #[serde(default)]
    pub min_severity: Option<RiskLevel>,
    /// Only match blacklisted rows
    #[serde(default)]
    pub blacklisted_only: bool,
}

/// DEVICE condition; thresholds fall back to the device config
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DeviceCondition {
    /// Match blacklisted devices
    #[serde(default = "default_true")]
    pub blacklisted: bool,
    /// Match devices over the fraud-rate threshold
    #[serde(default = "default_true")]
    pub fraud_rate: bool,
    /// Override for the configured fraud-rate threshold
    #[serde(default)]
    pub max_fraud_rate: Option<f64>,
    /// Override for the minimum transaction count
    #[serde(default)]
    pub min_sample: Option<u64>,
}

fn default_true() -> bool {
    true
}

/// AMOUNT condition, amounts in minor units
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AmountCondition {
    /// Match amounts strictly above
    #[serde(default)]
    pub above: Option<i64>,
    /// Match amounts strictly below
    #[serde(default)]
    pub below: Option<i64>,
    /// Round-amount detection: amount is a positive multiple of this
    #[serde(default)]
    pub round_multiple: Option<i64>,
    /// Only applies to this currency when set
    #[serde(default)]
    pub currency: Option<String>,
}

/// Typed condition per rule type
#[derive(Debug, Clone)]
pub enum RuleCondition {
    /// VELOCITY rule
    Velocity(VelocityCondition),
    /// GEOLOCATION rule
    Geolocation(GeolocationCondition),
    /// AMOUNT rule
    Amount(AmountCondition),
    /// PATTERN rule
    Pattern(PatternCondition),
    /// DEVICE rule
    Device(DeviceCondition),
    /// Type this engine cannot evaluate
    Unsupported,
}

impl RuleCondition {
    /// Parse a rule's stored conditions for its type
    pub fn parse(rule: &FraudRule) -> Result<Self> {
        let invalid = |reason: String| Error::InvalidCondition {
            rule: rule.name.clone(),
            reason,
        };
        let raw = rule.conditions.clone();

        let condition = match rule.rule_type {
            RuleType::Velocity => {
                let c: VelocityCondition =
                    serde_json::from_value(raw).map_err(|e| invalid(e.to_string()))?;
                if c.threshold < 0 {
                    return Err(invalid("threshold must be non-negative".to_string()));
                }
                RuleCondition::Velocity(c)
            }
            RuleType::Geolocation => {
                let c: GeolocationCondition =
                    serde_json::from_value(raw).map_err(|e| invalid(e.to_string()))?;
                if c.flags.is_empty() {
                    return Err(invalid("at least one flag is required".to_string()));
                }
                RuleCondition::Geolocation(c)
            }
            RuleType::Amount => {
                let c: AmountCondition =
                    serde_json::from_value(raw).map_err(|e| invalid(e.to_string()))?;
                if c.above.is_none() && c.below.is_none() && c.round_multiple.is_none() {
                    return Err(invalid(
                        "one of above, below or round_multiple is required".to_string(),
                    ));
                }
                if c.round_multiple.map_or(false, |m| m <= 0) {
                    return Err(invalid("round_multiple must be positive".to_string()));
                }
                RuleCondition::Amount(c)
            }
            RuleType::Pattern => RuleCondition::Pattern(
                serde_json::from_value(raw).map_err(|e| invalid(e.to_string()))?,
            ),
            RuleType::Device => {
                let c: DeviceCondition =
                    serde_json::from_value(raw).map_err(|e| invalid(e.to_string()))?;
                if c.max_fraud_rate.map_or(false, |r| !(0.0..=1.0).contains(&r)) {
                    return Err(invalid("max_fraud_rate must be within [0, 1]".to_string()));
                }
                RuleCondition::Device(c)
            }
            RuleType::Unknown => RuleCondition::Unsupported,
        };
        Ok(condition)
    }
}

/// A rule with its parsed condition
#[derive(Debug, Clone)]
pub struct ParsedRule {
    /// Rule as stored
    pub rule: FraudRule,
    /// Its parsed condition
    pub condition: RuleCondition,
}

/// Keep active rules, order by (priority, id), parse conditions
pub fn prepare_rules(rules: Vec<FraudRule>) -> Result<Vec<ParsedRule>> {
    let mut active: Vec<FraudRule> = rules.into_iter().filter(|r| r.is_active).collect();
    if active.is_empty() {
        return Err(Error::NoActiveRules);
    }
    active.sort_by(|a, b| a.priority.cmp(&b.priority).then(a.id.cmp(&b.id)));

    active
        .into_iter()
        .map(|rule| {
            let condition = RuleCondition::parse(&rule)?;
            Ok(ParsedRule { rule, condition })
        })
        .collect()
}

/// Uniform result of evaluating one rule
#[derive(Debug, Clone)]
pub struct RuleOutcome {
    /// Whether the rule fired
    pub matched: bool,
    /// Match strength in [0, 1]
    pub strength: f64,
    /// Human readable reason
    pub reason: String,
    /// Structured evidence
    pub details: serde_json::Value,
    /// Window observation, VELOCITY rules only
    pub velocity: Option<VelocityCheck>,
}

impl RuleOutcome {
    fn hit(strength: f64, reason: String, details: serde_json::Value) -> Self {
        Self {
            matched: true,
            strength: strength.clamp(0.0, 1.0),
            reason,
            details,
            velocity: None,
        }
    }

    fn miss(reason: String, details: serde_json::Value) -> Self {
        Self {
            matched: false,
            strength: 0.0,
            reason,
            details,
            velocity: None,
        }
    }

    fn signal_missing(entity: EntityType) -> Self {
        Self::miss(
            format!("No {} supplied; neutral", entity),
            json!({ "signal_missing": entity }),
        )
    }
}

/// Overshoot of an observed value past its threshold, capped at 1.0
fn overshoot_strength(observed: i64, threshold: i64) -> f64 {
    if threshold <= 0 {
        return 1.0;
    }
    ((observed - threshold) as f64 / threshold as f64).clamp(0.0, 1.0)
}

/// State shared by every rule within one evaluation
pub struct EvaluationScope<'a> {
    /// Fraud check being evaluated
    pub check_id: Uuid,
    /// Payment attempt
    pub ctx: &'a RequestContext,
    /// Evaluation instant
    pub at: DateTime<Utc>,
    /// Device record after this evaluation's touch
    pub device: Option<DeviceFingerprint>,
    geolocation: OnceCell<GeolocationCheck>,
}

impl<'a> EvaluationScope<'a> {
    /// Scope with no geolocation resolved yet
    pub fn new(
        check_id: Uuid,
        ctx: &'a RequestContext,
        at: DateTime<Utc>,
        device: Option<DeviceFingerprint>,
    ) -> Self {
        Self {
            check_id,
            ctx,
            at,
            device,
            geolocation: OnceCell::new(),
        }
    }
}

/// Executions plus the side records produced while evaluating
#[derive(Debug, Default)]
pub struct RuleEvaluation {
    /// One execution per rule, in rule order
    pub executions: Vec<FraudRuleExecution>,
    /// Window observations from VELOCITY rules
    pub velocity_checks: Vec<VelocityCheck>,
    /// Degradation notes for the reasons list
    pub notes: Vec<String>,
}

/// RuleEngine dispatches each rule type to its assessor
pub struct RuleEngine {
    velocity: Arc<VelocityTracker>,
    geolocation: Arc<GeolocationAssessor>,
    devices: Arc<DeviceReputationTracker>,
    patterns: Arc<PatternMatcher>,
    scoring: ScoringConfig,
}

impl RuleEngine {
    /// Wire the engine to its assessors
    pub fn new(
        velocity: Arc<VelocityTracker>,
        geolocation: Arc<GeolocationAssessor>,
        devices: Arc<DeviceReputationTracker>,
        patterns: Arc<PatternMatcher>,
        scoring: ScoringConfig,
    ) -> Self {
        Self {
            velocity,
            geolocation,
            devices,
            patterns,
            scoring,
        }
    }

    /// Evaluate all rules concurrently. Executions come back in rule order;
    /// rules still running at `deadline` are recorded as timed out.
    pub async fn evaluate(
        &self,
        scope: &EvaluationScope<'_>,
        rules: &[ParsedRule],
        deadline: Instant,
    ) -> RuleEvaluation {
        let runs = rules.iter().map(|parsed| async move {
            let outcome = timeout_at(deadline, self.evaluate_rule(scope, parsed)).await;
            (parsed, outcome)
        });
        let results = join_all(runs).await;

        let mut evaluation = RuleEvaluation::default();
        for (parsed, outcome) in results {
            let rule = &parsed.rule;
            let outcome = match outcome {
                Ok(Ok(outcome)) => outcome,
                Ok(Err(e)) => {
                    warn!(rule = %rule.name, "rule assessor failed: {}", e);
                    evaluation
                        .notes
                        .push(format!("Rule {} not evaluated: {}", rule.name, e));
                    RuleOutcome::miss(format!("Assessor error: {}", e), json!({ "error": e.to_string() }))
                }
                Err(_) => {
                    warn!(rule = %rule.name, "rule timed out at evaluation deadline");
                    evaluation
                        .notes
                        .push(format!("Rule {} timed out before the evaluation deadline", rule.name));
                    RuleOutcome::miss("Evaluation deadline reached".to_string(), json!({ "timeout": true }))
                }
            };

            if outcome.matched {
                info!(rule = %rule.name, action = %rule.action, "fraud rule matched");
            }
            if let Some(check) = outcome.velocity.clone() {
                evaluation.velocity_checks.push(check);
            }
            evaluation.executions.push(self.execution(scope, rule, outcome));
        }
        evaluation
    }

    /// The per-evaluation geolocation check, assessed at most once
    pub async fn geolocation<'s>(&self, scope: &'s EvaluationScope<'_>) -> &'s GeolocationCheck {
        scope
            .geolocation
            .get_or_init(|| {
                self.geolocation
                    .assess(scope.check_id, &scope.ctx.ip_address, &scope.ctx.country)
            })
            .await
    }

    /// Geolocation check for the outcome record; degraded if the deadline
    /// passes before an assessment is available
    pub async fn final_geolocation(&self, scope: &EvaluationScope<'_>, deadline: Instant) -> GeolocationCheck {
        match timeout_at(deadline, self.geolocation(scope)).await {
            Ok(check) => check.clone(),
            Err(_) => self.geolocation.unresolved(
                scope.check_id,
                &scope.ctx.ip_address,
                &scope.ctx.country,
                Some(format!(
                    "Geolocation unresolved for IP {}: evaluation deadline reached",
                    scope.ctx.ip_address
                )),
            ),
        }
    }

    fn execution(&self, scope: &EvaluationScope<'_>, rule: &FraudRule, outcome: RuleOutcome) -> FraudRuleExecution {
        let score = if outcome.matched {
            rule.weight * self.scoring.type_weight(rule.rule_type) * outcome.strength
        } else {
            0.0
        };
        FraudRuleExecution {
            id: Uuid::new_v4(),
            fraud_check_id: scope.check_id,
            rule_id: rule.id,
            rule_name: rule.name.clone(),
            rule_type: rule.rule_type,
            action: rule.action,
            weight: rule.weight,
            matched: outcome.matched,
            score,
            reason: outcome.reason,
            details: outcome.details,
            executed_at: Utc::now(),
        }
    }

    async fn evaluate_rule(&self, scope: &EvaluationScope<'_>, parsed: &ParsedRule) -> Result<RuleOutcome> {
        let outcome = match &parsed.condition {
            RuleCondition::Velocity(c) => self.evaluate_velocity(scope, c),
            RuleCondition::Geolocation(c) => self.evaluate_geolocation(scope, c).await,
            RuleCondition::Amount(c) => evaluate_amount(scope.ctx, c),
            RuleCondition::Pattern(c) => self.evaluate_pattern(scope, c)?,
            RuleCondition::Device(c) => self.evaluate_device(scope, c),
            RuleCondition::Unsupported => RuleOutcome::miss(
                format!("Rule type {} is not supported", parsed.rule.rule_type),
                json!({ "unsupported_rule_type": true }),
            ),
        };
        debug!(rule = %parsed.rule.name, matched = outcome.matched, "rule evaluated");
        Ok(outcome)
    }

    fn evaluate_velocity(&self, scope: &EvaluationScope<'_>, c: &VelocityCondition) -> RuleOutcome {
        let Some(value) = scope.ctx.entity_value(c.entity) else {
            return RuleOutcome::signal_missing(c.entity);
        };
        let check = self
            .velocity
            .evaluate(c.entity, &value, &c.window, c.threshold, c.threshold_kind, scope.at);

        let details = json!({
            "entity_type": c.entity,
            "window": c.window.label(),
            "count": check.count,
            "total_amount": check.total_amount,
            "threshold": c.threshold,
            "threshold_kind": c.threshold_kind,
        });
        let kind = match c.threshold_kind {
            ThresholdKind::Count => "payments",
            ThresholdKind::Amount => "amount",
        };

        let mut outcome = if check.exceeded {
            RuleOutcome::hit(
                overshoot_strength(check.observed(), c.threshold),
                format!(
                    "{} velocity exceeded: {} payments totalling {} in {} (max {} {})",
                    c.entity,
                    check.count,
                    check.total_amount,
                    c.window.label(),
                    c.threshold,
                    kind
                ),
                details,
            )
        } else {
            RuleOutcome::miss(
                format!("{} velocity within limit ({} in {})", c.entity, check.observed(), c.window.label()),
                details,
            )
        };
        outcome.velocity = Some(check);
        outcome
    }

    async fn evaluate_geolocation(&self, scope: &EvaluationScope<'_>, c: &GeolocationCondition) -> RuleOutcome {
        let geo = self.geolocation(scope).await;
        if !geo.resolved {
            return RuleOutcome::miss(
                "Geolocation unavailable; neutral".to_string(),
                json!({ "degraded": true, "note": geo.note }),
            );
        }

        let hits: Vec<GeoFlag> = c.flags.iter().copied().filter(|f| f.is_set(geo)).collect();
        let details = json!({
            "ip_address": geo.ip_address,
            "country": geo.country,
            "flags": hits,
            "geo_score": geo.risk_score,
        });
        if hits.is_empty() {
            return RuleOutcome::miss("No geolocation risk flags".to_string(), details);
        }

        let names: Vec<&str> = hits
            .iter()
            .map(|f| match f {
                GeoFlag::Proxy => "proxy",
                GeoFlag::Vpn => "VPN",
                GeoFlag::Tor => "Tor exit node",
                GeoFlag::HighRiskCountry => "high-risk country",
            })
            .collect();
        RuleOutcome::hit(
            1.0,
            format!(
                "Geolocation risk for IP {} ({}): {}",
                geo.ip_address,
                geo.country,
                names.join(", ")
            ),
            details,
        )
    }

    fn evaluate_pattern(&self, scope: &EvaluationScope<'_>, c: &PatternCondition) -> Result<RuleOutcome> {
        let Some(value) = scope.ctx.entity_value(c.entity) else {
            return Ok(RuleOutcome::signal_missing(c.entity));
        };
        let result = self.patterns.match_pattern(c.entity, &value, scope.at)?;

        let pattern = match result.pattern {
            Some(p)
                if c.min_severity.map_or(true, |min| p.severity >= min)
                    && (!c.blacklisted_only || p.is_blacklisted) =>
            {
                p
            }
            _ => {
                return Ok(RuleOutcome::miss(
                    format!("No qualifying {} pattern", c.entity),
                    json!({ "found": result.found }),
                ))
            }
        };

        Ok(RuleOutcome::hit(
            1.0,
            format!(
                "{} {} matches known fraud pattern (severity {:?}, blacklisted: {}){}",
                c.entity,
                value,
                pattern.severity,
                pattern.is_blacklisted,
                if pattern.reason.is_empty() {
                    String::new()
                } else {
                    format!(": {}", pattern.reason)
                }
            ),
            json!({
                "pattern_id": pattern.id,
                "severity": pattern.severity,
                "is_blacklisted": pattern.is_blacklisted,
                "expires_at": pattern.expires_at,
            }),
        ))
    }

    fn evaluate_device(&self, scope: &EvaluationScope<'_>, c: &DeviceCondition) -> RuleOutcome {
        let Some(fingerprint) = scope.device.clone() else {
            return RuleOutcome::signal_missing(EntityType::Device);
        };
        let config = self.devices.config();
        let threshold = c.max_fraud_rate.unwrap_or(config.fraud_rate_threshold);
        let min_sample = c.min_sample.unwrap_or(config.min_sample);
        let signal = self.devices.signal(fingerprint, threshold, min_sample);
        let fp = &signal.fingerprint;

        let details = json!({
            "fingerprint_hash": fp.fingerprint_hash,
            "transaction_count": fp.transaction_count,
            "fraud_count": fp.fraud_count,
            "fraud_rate": signal.fraud_rate,
            "is_blacklisted": fp.is_blacklisted,
        });

        if c.blacklisted && fp.is_blacklisted {
            return RuleOutcome::hit(1.0, format!("Device {} is blacklisted", fp.fingerprint_hash), details);
        }
        if c.fraud_rate && signal.high_fraud_rate {
            return RuleOutcome::hit(
                1.0,
                format!(
                    "Device {} fraud rate {:.2} over {} transactions (threshold {:.2})",
                    fp.fingerprint_hash, signal.fraud_rate, fp.transaction_count, threshold
                ),
                details,
            );
        }
        RuleOutcome::miss("Device reputation acceptable".to_string(), details)
    }
}

fn evaluate_amount(ctx: &RequestContext, c: &AmountCondition) -> RuleOutcome {
    let amount = ctx.amount;
    let details = json!({
        "amount": amount,
        "currency": ctx.currency,
        "above": c.above,
        "below": c.below,
        "round_multiple": c.round_multiple,
    });

    if let Some(currency) = &c.currency {
        if !currency.eq_ignore_ascii_case(&ctx.currency) {
            return RuleOutcome::miss(format!("Rule applies to {} only", currency), details);
        }
    }

    let mut strength: f64 = 0.0;
    let mut findings = Vec::new();
    if let Some(above) = c.above {
        if amount > above {
            strength = strength.max(overshoot_strength(amount, above));
            findings.push(format!("amount {} {} exceeds {}", amount, ctx.currency, above));
        }
    }
    if let Some(below) = c.below {
        if amount < below {
            strength = 1.0;
            findings.push(format!("amount {} {} below {}", amount, ctx.currency, below));
        }
    }
    if let Some(multiple) = c.round_multiple {
        if amount >= multiple && amount % multiple == 0 {
            strength = 1.0;
            findings.push(format!("round amount {} (multiple of {})", amount, multiple));
        }
    }

    if findings.is_empty() {
        RuleOutcome::miss("Amount within bounds".to_string(), details)
    } else {
        RuleOutcome::hit(strength, format!("Amount rule: {}", findings.join("; ")), details)
    }
}
