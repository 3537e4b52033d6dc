//! Decision aggregation
//!
//! Folds rule executions into a score, risk level, decision and reasons,
//! and decides whether a completed check raises an alert.

use crate::config::{AlertingConfig, RiskThresholds};
use crate::types::{Decision, FraudAlert, FraudCheck, FraudRuleExecution, RiskLevel, RiskScore};
use crate::{Error, Result};
use chrono::Utc;
use serde::{Deserialize, Serialize};
use serde_json::json;
use uuid::Uuid;

/// Aggregated verdict for one evaluation
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Verdict {
    /// Capped sum of contributions
    pub risk_score: RiskScore,
    /// Level bucket for the score
    pub risk_level: RiskLevel,
    /// Most severe matched action
    pub decision: Decision,
    /// Matched reasons then degradation notes
    pub reasons: Vec<String>,
}

/// Decision aggregator
pub struct DecisionAggregator {
    thresholds: RiskThresholds,
    alerting: AlertingConfig,
}

impl DecisionAggregator {
    /// Aggregator with explicit thresholds
    pub fn new(thresholds: RiskThresholds, alerting: AlertingConfig) -> Self {
        Self {
            thresholds,
            alerting,
        }
    }

    /// Aggregate executions (in evaluation order) plus degradation notes
    pub fn aggregate(&self, executions: &[FraudRuleExecution], notes: &[String]) -> Result<Verdict> {
        let matched: Vec<&FraudRuleExecution> = executions.iter().filter(|e| e.matched).collect();

        let mut total = 0.0;
        for execution in &matched {
            if !execution.score.is_finite() || execution.score < 0.0 {
                return Err(Error::InvariantViolation(format!(
                    "rule {} contributed score {}",
                    execution.rule_name, execution.score
                )));
            }
            total += execution.score;
        }
        let risk_score = RiskScore::new(total.min(100.0))?;
        let risk_level = RiskLevel::from_score(risk_score, &self.thresholds);

        let mut decision = Decision::Approve;
        for execution in &matched {
            decision = decision.max(execution.action);
            if decision == Decision::Block {
                break;
            }
        }

        // Stable sort keeps evaluation order among equal weights
        let mut ranked = matched;
        ranked.sort_by(|a, b| b.weight.total_cmp(&a.weight));
        let mut reasons: Vec<String> = ranked.iter().map(|e| e.reason.clone()).collect();
        reasons.extend(notes.iter().cloned());

        Ok(Verdict {
            risk_score,
            risk_level,
            decision,
            reasons,
        })
    }

    /// Alert for a completed check, if it warrants one
    pub fn alert_for(&self, check: &FraudCheck) -> Option<FraudAlert> {
        let (Some(score), Some(level), Some(decision)) = (check.risk_score, check.risk_level, check.decision) else {
            return None;
        };
        if level < self.alerting.min_risk_level && !self.alerting.decisions.contains(&decision) {
            return None;
        }

        let alert_type = match decision {
            Decision::Block => "BLOCKED_PAYMENT",
            Decision::Decline => "DECLINED_PAYMENT",
            _ => "HIGH_RISK_PAYMENT",
        };

        Some(FraudAlert {
            id: Uuid::new_v4(),
            fraud_check_id: check.id,
            payment_id: check.payment_id,
            alert_type: alert_type.to_string(),
            severity: level,
            message: format!(
                "Payment {} {}: risk score {:.1} ({:?})",
                check.payment_id,
                decision,
                score.value(),
                level
            ),
            details: json!({
                "merchant_id": check.merchant_id,
                "customer_id": check.customer_id,
                "amount": check.amount,
                "currency": check.currency,
                "reasons": check.reasons,
            }),
            is_resolved: false,
            resolved_by: None,
            resolved_at: None,
            notes: None,
            created_at: Utc::now(),
        })
    }
}

impl Default for DecisionAggregator {
    fn default() -> Self {
        Self::new(RiskThresholds::default(), AlertingConfig::default())
    }
}
