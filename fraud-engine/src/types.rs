//! Core types for the fraud engine

use crate::config::RiskThresholds;
use crate::{Error, Result};
use chrono::{DateTime, Duration, Utc};
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::fmt;
use uuid::Uuid;

/// Risk score (0-100 inclusive)
#[derive(Debug, Clone, Copy, PartialEq, PartialOrd, Serialize, Deserialize)]
#[serde(try_from = "f64", into = "f64")]
pub struct RiskScore(f64);

impl RiskScore {
    /// Create a risk score, rejecting values outside [0, 100]
    pub fn new(score: f64) -> Result<Self> {
        if !score.is_finite() || !(0.0..=100.0).contains(&score) {
            return Err(Error::InvariantViolation(format!(
                "risk score {} outside [0, 100]",
                score
            )));
        }
        Ok(Self(score))
    }

    /// Zero score
    pub fn zero() -> Self {
        Self(0.0)
    }

    /// Get raw score
    pub fn value(&self) -> f64 {
        self.0
    }
}

impl TryFrom<f64> for RiskScore {
    type Error = Error;

    fn try_from(value: f64) -> Result<Self> {
        Self::new(value)
    }
}

impl From<RiskScore> for f64 {
    fn from(score: RiskScore) -> Self {
        score.0
    }
}

/// Risk level
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum RiskLevel {
    /// Low risk
    Low,
    /// Medium risk
    Medium,
    /// High risk
    High,
    /// Critical risk
    Critical,
}

impl RiskLevel {
    /// Bucket a score. Buckets are inclusive-low / exclusive-high except the
    /// top one, which runs to 100 inclusive.
    pub fn from_score(score: RiskScore, thresholds: &RiskThresholds) -> Self {
        let s = score.value();
        if s >= thresholds.critical {
            RiskLevel::Critical
        } else if s >= thresholds.high {
            RiskLevel::High
        } else if s >= thresholds.medium {
            RiskLevel::Medium
        } else {
            RiskLevel::Low
        }
    }
}

impl From<RiskScore> for RiskLevel {
    fn from(score: RiskScore) -> Self {
        RiskLevel::from_score(score, &RiskThresholds::default())
    }
}

/// Decision / rule action, ordered by severity
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum Decision {
    /// Let the payment through
    Approve,
    /// Hold for manual review
    Review,
    /// Decline the payment
    Decline,
    /// Hard block
    Block,
}

/// Action configured on a rule
pub type RuleAction = Decision;

impl fmt::Display for Decision {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            Decision::Approve => "APPROVE",
            Decision::Review => "REVIEW",
            Decision::Decline => "DECLINE",
            Decision::Block => "BLOCK",
        };
        f.write_str(s)
    }
}

/// Fraud check lifecycle status
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum FraudCheckStatus {
    /// Created, not started
    Pending,
    /// Rules being evaluated
    Processing,
    /// Decision produced
    Completed,
    /// No valid record could be produced
    Failed,
}

impl FraudCheckStatus {
    /// Terminal states never change again
    pub fn is_terminal(&self) -> bool {
        matches!(self, FraudCheckStatus::Completed | FraudCheckStatus::Failed)
    }

    fn can_transition_to(&self, next: FraudCheckStatus) -> bool {
        matches!(
            (self, next),
            (FraudCheckStatus::Pending, FraudCheckStatus::Processing)
                | (FraudCheckStatus::Processing, FraudCheckStatus::Completed)
                | (FraudCheckStatus::Processing, FraudCheckStatus::Failed)
        )
    }
}

impl fmt::Display for FraudCheckStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            FraudCheckStatus::Pending => "PENDING",
            FraudCheckStatus::Processing => "PROCESSING",
            FraudCheckStatus::Completed => "COMPLETED",
            FraudCheckStatus::Failed => "FAILED",
        };
        f.write_str(s)
    }
}

/// Correlatable entity used for velocity tracking and pattern lookups
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum EntityType {
    /// Card token
    Card,
    /// Email address
    Email,
    /// IP address
    Ip,
    /// Device fingerprint hash
    Device,
    /// Phone number
    Phone,
    /// Customer id
    Customer,
    /// Merchant id
    Merchant,
}

/// Pattern types share the entity vocabulary
pub type PatternType = EntityType;

impl EntityType {
    /// All entity types, in a stable order
    pub const ALL: [EntityType; 7] = [
        EntityType::Card,
        EntityType::Email,
        EntityType::Ip,
        EntityType::Device,
        EntityType::Phone,
        EntityType::Customer,
        EntityType::Merchant,
    ];

    /// Normalize a value for comparison. Email and IP compare
    /// case-insensitively.
    pub fn normalize(&self, value: &str) -> String {
        match self {
            EntityType::Email | EntityType::Ip => value.trim().to_lowercase(),
            _ => value.to_string(),
        }
    }
}

impl fmt::Display for EntityType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            EntityType::Card => "CARD",
            EntityType::Email => "EMAIL",
            EntityType::Ip => "IP",
            EntityType::Device => "DEVICE",
            EntityType::Phone => "PHONE",
            EntityType::Customer => "CUSTOMER",
            EntityType::Merchant => "MERCHANT",
        };
        f.write_str(s)
    }
}

/// Postal address
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Address {
    /// Street line
    pub line1: String,
    /// Second line
    #[serde(default)]
    pub line2: Option<String>,
    /// City
    pub city: String,
    /// Region or state
    #[serde(default)]
    pub region: Option<String>,
    /// Postal code
    pub postal_code: String,
    /// ISO country code
    pub country: String,
}

/// Optional device attributes reported alongside the fingerprint
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct DeviceAttributes {
    /// Screen resolution, e.g. 1920x1080
    #[serde(default)]
    pub screen_resolution: Option<String>,
    /// IANA timezone
    #[serde(default)]
    pub timezone: Option<String>,
    /// Browser language
    #[serde(default)]
    pub language: Option<String>,
}

/// Payment attempt under evaluation
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RequestContext {
    /// Payment ID
    pub payment_id: Uuid,

    /// Merchant ID
    pub merchant_id: Uuid,

    /// Customer ID
    pub customer_id: Uuid,

    /// Amount in minor currency units
    pub amount: i64,

    /// ISO 4217 currency code
    pub currency: String,

    /// Client IP address
    pub ip_address: String,

    /// Declared country (ISO 3166 alpha-2)
    pub country: String,

    /// Client user agent
    pub user_agent: String,

    /// Customer email
    pub email: String,

    /// Customer phone
    #[serde(default)]
    pub phone_number: Option<String>,

    /// Device fingerprint hash
    #[serde(default)]
    pub device_fingerprint: Option<String>,

    /// Reported device attributes
    #[serde(default)]
    pub device: DeviceAttributes,

    /// Card token, when paying by card
    #[serde(default)]
    pub card_token: Option<String>,

    /// Billing address
    #[serde(default)]
    pub billing_address: Option<Address>,

    /// Shipping address
    #[serde(default)]
    pub shipping_address: Option<Address>,

    /// Unstructured metadata, passed through unchanged
    #[serde(default)]
    pub metadata: HashMap<String, serde_json::Value>,
}

impl RequestContext {
    /// Value of the given entity for this request, if present
    pub fn entity_value(&self, entity: EntityType) -> Option<String> {
        let value = match entity {
            EntityType::Card => self.card_token.clone(),
            EntityType::Email => Some(self.email.clone()),
            EntityType::Ip => Some(self.ip_address.clone()),
            EntityType::Device => self.device_fingerprint.clone(),
            EntityType::Phone => self.phone_number.clone(),
            EntityType::Customer => Some(self.customer_id.to_string()),
            EntityType::Merchant => Some(self.merchant_id.to_string()),
        };
        value.filter(|v| !v.trim().is_empty())
    }
}

/// Rule type; dispatches to an assessor
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum RuleType {
    /// Velocity window rule
    Velocity,
    /// IP geolocation rule
    Geolocation,
    /// Amount threshold rule
    Amount,
    /// Blacklist / greylist rule
    Pattern,
    /// Device reputation rule
    Device,
    /// Any type this engine does not know how to evaluate
    #[serde(other)]
    Unknown,
}

impl fmt::Display for RuleType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            RuleType::Velocity => "VELOCITY",
            RuleType::Geolocation => "GEOLOCATION",
            RuleType::Amount => "AMOUNT",
            RuleType::Pattern => "PATTERN",
            RuleType::Device => "DEVICE",
            RuleType::Unknown => "UNKNOWN",
        };
        f.write_str(s)
    }
}

/// Fraud rule, owned by the rule-management collaborator
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct FraudRule {
    /// Rule id
    pub id: Uuid,
    /// Rule name
    pub name: String,
    /// Free text description
    #[serde(default)]
    pub description: String,
    /// Rule type
    pub rule_type: RuleType,
    /// Condition parameters as stored; parsed per rule type on evaluation
    pub conditions: serde_json::Value,
    /// Action when matched
    pub action: RuleAction,
    /// Contribution to the risk score when fully matched
    pub weight: f64,
    /// Inactive rules are skipped
    pub is_active: bool,
    /// Evaluation order, lower first
    pub priority: i32,
}

/// Audit record of one rule evaluated against one fraud check
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct FraudRuleExecution {
    /// Execution id
    pub id: Uuid,
    /// Owning fraud check
    pub fraud_check_id: Uuid,
    /// Evaluated rule
    pub rule_id: Uuid,
    /// Rule name at evaluation time
    pub rule_name: String,
    /// Rule type
    pub rule_type: RuleType,
    /// Rule action
    pub action: RuleAction,
    /// Rule weight
    pub weight: f64,
    /// Whether the rule fired
    pub matched: bool,
    /// Score contribution
    pub score: f64,
    /// Reason text
    pub reason: String,
    /// Structured evidence
    pub details: serde_json::Value,
    /// Evaluation instant
    pub executed_at: DateTime<Utc>,
}

/// Known fraud pattern (blacklist / greylist entry)
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct FraudPattern {
    /// Pattern id
    pub id: Uuid,
    /// Entity type matched
    pub pattern_type: PatternType,
    /// Value matched
    pub pattern_value: String,
    /// Why the value is listed
    #[serde(default)]
    pub reason: String,
    /// Severity
    pub severity: RiskLevel,
    /// Blacklist when true, greylist otherwise
    pub is_blacklisted: bool,
    /// Expiry; never expires when unset
    #[serde(default)]
    pub expires_at: Option<DateTime<Utc>>,
    /// Creation instant
    pub created_at: DateTime<Utc>,
}

impl FraudPattern {
    /// Expired patterns are inert but not deleted
    pub fn is_live_at(&self, now: DateTime<Utc>) -> bool {
        self.expires_at.map_or(true, |expires| expires > now)
    }
}

/// Velocity threshold kind
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum ThresholdKind {
    /// Compare event count
    #[default]
    Count,
    /// Compare summed amount
    Amount,
}

/// Velocity window such as "30s", "15m", "1h", "24h", "7d"
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(try_from = "String", into = "String")]
pub struct VelocityWindow {
    label: String,
    seconds: i64,
}

impl VelocityWindow {
    /// Longest window a rule may ask for (one leap year)
    pub const MAX_SECS: i64 = 366 * 86_400;

    /// Parse a window label
    pub fn parse(label: &str) -> Result<Self> {
        let label = label.trim();
        let split = label
            .find(|c: char| !c.is_ascii_digit())
            .ok_or_else(|| Error::InvalidWindow(label.to_string()))?;
        let (num, unit) = label.split_at(split);
        let n: i64 = num
            .parse()
            .map_err(|_| Error::InvalidWindow(label.to_string()))?;
        let multiplier = match unit {
            "s" => 1,
            "m" => 60,
            "h" => 3_600,
            "d" => 86_400,
            _ => return Err(Error::InvalidWindow(label.to_string())),
        };
        let seconds = n
            .checked_mul(multiplier)
            .filter(|s| (1..=Self::MAX_SECS).contains(s))
            .ok_or_else(|| Error::InvalidWindow(label.to_string()))?;
        Ok(Self {
            label: label.to_string(),
            seconds,
        })
    }

    /// Window label as configured
    pub fn label(&self) -> &str {
        &self.label
    }

    /// Window length
    pub fn duration(&self) -> Duration {
        Duration::seconds(self.seconds)
    }
}

impl TryFrom<String> for VelocityWindow {
    type Error = Error;

    fn try_from(value: String) -> Result<Self> {
        Self::parse(&value)
    }
}

impl From<VelocityWindow> for String {
    fn from(window: VelocityWindow) -> Self {
        window.label
    }
}

/// Materialized window observation
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct VelocityCheck {
    /// Observation id
    pub id: Uuid,
    /// Entity type
    pub entity_type: EntityType,
    /// Normalized entity value
    pub entity_value: String,
    /// Window label
    pub time_window: String,
    /// Events in the window
    pub count: u64,
    /// Sum of amounts in the window
    pub total_amount: i64,
    /// Configured threshold
    pub threshold: i64,
    /// Count or amount
    pub threshold_kind: ThresholdKind,
    /// Observed value above threshold
    pub exceeded: bool,
    /// Window start, inclusive
    pub window_start: DateTime<Utc>,
    /// Window end, inclusive
    pub window_end: DateTime<Utc>,
}

impl VelocityCheck {
    /// The observed value compared against the threshold
    pub fn observed(&self) -> i64 {
        match self.threshold_kind {
            ThresholdKind::Count => i64::try_from(self.count).unwrap_or(i64::MAX),
            ThresholdKind::Amount => self.total_amount,
        }
    }
}

/// Per-evaluation geolocation assessment
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct GeolocationCheck {
    /// Record id
    pub id: Uuid,
    /// Owning fraud check
    pub fraud_check_id: Uuid,
    /// Assessed IP
    pub ip_address: String,
    /// Resolved or declared country
    pub country: String,
    /// City
    pub city: Option<String>,
    /// Latitude
    pub latitude: Option<f64>,
    /// Longitude
    pub longitude: Option<f64>,
    /// Proxy IP
    pub is_proxy: bool,
    /// VPN IP
    pub is_vpn: bool,
    /// Tor exit node
    pub is_tor: bool,
    /// Country is on the high-risk list
    pub is_high_risk_country: bool,
    /// Geolocation risk in [0, 100]
    pub risk_score: f64,
    /// False when IP intelligence was unavailable
    pub resolved: bool,
    /// Why the lookup could not be resolved
    pub note: Option<String>,
    /// Creation instant
    pub created_at: DateTime<Utc>,
}

/// Long-lived device reputation record
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct DeviceFingerprint {
    /// Record id
    pub id: Uuid,
    /// Fingerprint hash
    pub fingerprint_hash: String,
    /// Latest user agent
    pub user_agent: String,
    /// Screen resolution
    pub screen_resolution: Option<String>,
    /// Timezone
    pub timezone: Option<String>,
    /// Language
    pub language: Option<String>,
    /// First observation
    pub first_seen: DateTime<Utc>,
    /// Latest observation
    pub last_seen: DateTime<Utc>,
    /// Evaluated transactions
    pub transaction_count: u64,
    /// Confirmed fraud
    pub fraud_count: u64,
    /// Moderated as fraudulent
    pub is_blacklisted: bool,
}

impl DeviceFingerprint {
    /// Confirmed fraud per transaction seen
    pub fn fraud_rate(&self) -> f64 {
        if self.transaction_count == 0 {
            0.0
        } else {
            self.fraud_count as f64 / self.transaction_count as f64
        }
    }
}

/// Evaluation record for one payment attempt
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct FraudCheck {
    /// Check id
    pub id: Uuid,
    /// Payment under evaluation
    pub payment_id: Uuid,
    /// Merchant
    pub merchant_id: Uuid,
    /// Customer
    pub customer_id: Uuid,
    /// Amount in minor units
    pub amount: i64,
    /// ISO currency
    pub currency: String,
    /// Lifecycle status
    pub status: FraudCheckStatus,
    /// Set on completion
    pub decision: Option<Decision>,
    /// Set on completion
    pub risk_level: Option<RiskLevel>,
    /// Set on completion
    pub risk_score: Option<RiskScore>,
    /// Matched reasons then degradation notes
    pub reasons: Vec<String>,
    /// Set only when FAILED
    pub failure_reason: Option<String>,
    /// Terminal transition instant
    pub processed_at: Option<DateTime<Utc>>,
    /// Creation instant
    pub created_at: DateTime<Utc>,
}

impl FraudCheck {
    /// New PENDING check with a fresh identity
    pub fn new(ctx: &RequestContext, now: DateTime<Utc>) -> Self {
        Self {
            id: Uuid::new_v4(),
            payment_id: ctx.payment_id,
            merchant_id: ctx.merchant_id,
            customer_id: ctx.customer_id,
            amount: ctx.amount,
            currency: ctx.currency.clone(),
            status: FraudCheckStatus::Pending,
            decision: None,
            risk_level: None,
            risk_score: None,
            reasons: Vec::new(),
            failure_reason: None,
            processed_at: None,
            created_at: now,
        }
    }

    /// PENDING -> PROCESSING
    pub fn start_processing(&mut self) -> Result<()> {
        self.transition(FraudCheckStatus::Processing)
    }

    /// PROCESSING -> COMPLETED
    pub fn complete(
        &mut self,
        risk_score: RiskScore,
        risk_level: RiskLevel,
        decision: Decision,
        reasons: Vec<String>,
        at: DateTime<Utc>,
    ) -> Result<()> {
        self.transition(FraudCheckStatus::Completed)?;
        self.risk_score = Some(risk_score);
        self.risk_level = Some(risk_level);
        self.decision = Some(decision);
        self.reasons = reasons;
        self.processed_at = Some(at);
        Ok(())
    }

    /// PROCESSING -> FAILED; carries no decision
    pub fn fail(&mut self, reason: impl Into<String>, at: DateTime<Utc>) -> Result<()> {
        self.transition(FraudCheckStatus::Failed)?;
        self.failure_reason = Some(reason.into());
        self.processed_at = Some(at);
        Ok(())
    }

    fn transition(&mut self, next: FraudCheckStatus) -> Result<()> {
        if !self.status.can_transition_to(next) {
            return Err(Error::InvalidTransition {
                from: self.status.to_string(),
                to: next.to_string(),
            });
        }
        self.status = next;
        Ok(())
    }
}

/// Alert raised for high-risk or declined checks
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct FraudAlert {
    /// Alert id
    pub id: Uuid,
    /// Owning fraud check
    pub fraud_check_id: Uuid,
    /// Payment
    pub payment_id: Uuid,
    /// Alert kind
    pub alert_type: String,
    /// Severity
    pub severity: RiskLevel,
    /// Summary
    pub message: String,
    /// Structured details
    pub details: serde_json::Value,
    /// Resolution fields belong to case management
    pub is_resolved: bool,
    /// Reviewer
    pub resolved_by: Option<Uuid>,
    /// Resolution instant
    pub resolved_at: Option<DateTime<Utc>>,
    /// Reviewer notes
    pub notes: Option<String>,
    /// Creation instant
    pub created_at: DateTime<Utc>,
}

/// Everything one evaluation emits for the persistence collaborator
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct EvaluationOutcome {
    /// Terminal fraud check
    pub check: FraudCheck,
    /// Rule executions in rule order
    pub executions: Vec<FraudRuleExecution>,
    /// Geolocation assessment
    pub geolocation: GeolocationCheck,
    /// Device record, when a fingerprint was sent
    pub device: Option<DeviceFingerprint>,
    /// Velocity observations
    pub velocity_checks: Vec<VelocityCheck>,
    /// Alerts raised
    pub alerts: Vec<FraudAlert>,
}
