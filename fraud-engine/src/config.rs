//! Configuration for the fraud engine
//!
//! Supplied by an external configuration collaborator at startup or reload.
//! Every section has defaults so a partial TOML file is enough.

use crate::types::{Decision, RiskLevel, RuleType, VelocityWindow};
use crate::{Error, Result};
use serde::{Deserialize, Serialize};
use std::collections::{HashMap, HashSet};
use std::time::Duration;

/// Engine configuration
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct EngineConfig {
    /// Score weights and risk-level thresholds
    pub scoring: ScoringConfig,

    /// Geolocation flag weights and high-risk countries
    pub geolocation: GeolocationConfig,

    /// Device reputation thresholds
    pub device: DeviceConfig,

    /// Velocity retention
    pub velocity: VelocityConfig,

    /// Alert thresholds
    pub alerting: AlertingConfig,

    /// Per-call and overall time budgets
    pub timeouts: TimeoutConfig,

    /// Pattern cache
    pub patterns: PatternCacheConfig,

    /// Rule-set snapshot cache
    pub rules: RuleCacheConfig,

    /// Log output for the binary
    pub logging: LoggingConfig,
}

/// Risk-level thresholds, lower bounds of each bucket
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct RiskThresholds {
    /// Score at which risk becomes MEDIUM
    pub medium: f64,
    /// Score at which risk becomes HIGH
    pub high: f64,
    /// Score at which risk becomes CRITICAL
    pub critical: f64,
}

impl Default for RiskThresholds {
    fn default() -> Self {
        Self {
            medium: 25.0,
            high: 60.0,
            critical: 85.0,
        }
    }
}

/// Scoring configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct ScoringConfig {
    /// Multiplier applied to a matched rule's weight, per rule type
    pub type_weights: HashMap<RuleType, f64>,

    /// Risk-level bucket boundaries
    pub thresholds: RiskThresholds,
}

impl Default for ScoringConfig {
    fn default() -> Self {
        Self {
            type_weights: HashMap::new(),
            thresholds: RiskThresholds::default(),
        }
    }
}

impl ScoringConfig {
    /// Multiplier for a rule type (1.0 unless configured)
    pub fn type_weight(&self, rule_type: RuleType) -> f64 {
        self.type_weights.get(&rule_type).copied().unwrap_or(1.0)
    }
}

/// Geolocation configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct GeolocationConfig {
    /// Contribution of a proxy IP
    pub proxy_weight: f64,
    /// Contribution of a VPN IP
    pub vpn_weight: f64,
    /// Contribution of a Tor exit node
    pub tor_weight: f64,
    /// Contribution of a high-risk country
    pub high_risk_country_weight: f64,

    /// ISO 3166 alpha-2 codes, matched case-insensitively
    pub high_risk_countries: HashSet<String>,

    /// Keep the declared-country flag when the IP lookup fails
    pub degraded_keeps_country_flag: bool,
}

impl Default for GeolocationConfig {
    fn default() -> Self {
        Self {
            proxy_weight: 20.0,
            vpn_weight: 15.0,
            tor_weight: 40.0,
            high_risk_country_weight: 25.0,
            high_risk_countries: ["KP", "IR", "SY", "CU"]
                .iter()
                .map(|c| c.to_string())
                .collect(),
            degraded_keeps_country_flag: false,
        }
    }
}

/// Device reputation configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct DeviceConfig {
    /// Fraud rate at or above which a device is flagged
    pub fraud_rate_threshold: f64,

    /// Minimum transactions before the fraud rate counts
    pub min_sample: u64,
}

impl Default for DeviceConfig {
    fn default() -> Self {
        Self {
            fraud_rate_threshold: 0.2,
            min_sample: 5,
        }
    }
}

/// Velocity configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct VelocityConfig {
    /// Events are retained at least this long (seconds)
    pub max_window_secs: i64,
}

impl Default for VelocityConfig {
    fn default() -> Self {
        Self {
            max_window_secs: 7 * 24 * 3_600,
        }
    }
}

/// Alerting configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct AlertingConfig {
    /// Alert when the risk level is at least this
    pub min_risk_level: RiskLevel,

    /// Alert on these decisions regardless of level
    pub decisions: Vec<Decision>,
}

impl Default for AlertingConfig {
    fn default() -> Self {
        Self {
            min_risk_level: RiskLevel::High,
            decisions: vec![Decision::Decline, Decision::Block],
        }
    }
}

/// Timeout configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct TimeoutConfig {
    /// Budget for a single assessor call (milliseconds)
    pub per_call_ms: u64,

    /// Budget for the whole evaluation (milliseconds)
    pub overall_ms: u64,
}

impl Default for TimeoutConfig {
    fn default() -> Self {
        Self {
            per_call_ms: 500,
            overall_ms: 1_500,
        }
    }
}

impl TimeoutConfig {
    /// Budget for a single external call
    pub fn per_call(&self) -> Duration {
        Duration::from_millis(self.per_call_ms)
    }

    /// Budget for a whole evaluation
    pub fn overall(&self) -> Duration {
        Duration::from_millis(self.overall_ms)
    }
}

/// Pattern cache configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct PatternCacheConfig {
    /// Maximum staleness of the pattern snapshot (seconds)
    pub refresh_interval_secs: u64,
}

impl Default for PatternCacheConfig {
    fn default() -> Self {
        Self {
            refresh_interval_secs: 60,
        }
    }
}

/// Rule-set cache configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct RuleCacheConfig {
    /// Maximum staleness of the rule snapshot (seconds); 0 disables caching
    pub cache_ttl_secs: u64,
}

impl Default for RuleCacheConfig {
    fn default() -> Self {
        Self { cache_ttl_secs: 30 }
    }
}

/// Logging configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct LoggingConfig {
    /// Default filter directive when RUST_LOG is unset
    pub level: String,

    /// Emit JSON lines
    pub json: bool,
}

impl Default for LoggingConfig {
    fn default() -> Self {
        Self {
            level: "info".to_string(),
            json: false,
        }
    }
}

impl EngineConfig {
    /// Load from a TOML file
    pub fn from_file(path: impl AsRef<std::path::Path>) -> Result<Self> {
        let content = std::fs::read_to_string(path)?;
        Self::from_toml_str(&content)
    }

    /// Parse TOML and validate
    pub fn from_toml_str(content: &str) -> Result<Self> {
        let config: EngineConfig = toml::from_str(content)
            .map_err(|e| Error::InvalidConfig(format!("Failed to parse config: {}", e)))?;
        config.validate()?;
        Ok(config)
    }

    /// Override selected fields from environment variables
    pub fn from_env() -> Result<Self> {
        let mut config = EngineConfig::default();

        if let Ok(v) = std::env::var("FRAUD_ENGINE_PER_CALL_TIMEOUT_MS") {
            config.timeouts.per_call_ms = parse_env("FRAUD_ENGINE_PER_CALL_TIMEOUT_MS", &v)?;
        }

        if let Ok(v) = std::env::var("FRAUD_ENGINE_OVERALL_TIMEOUT_MS") {
            config.timeouts.overall_ms = parse_env("FRAUD_ENGINE_OVERALL_TIMEOUT_MS", &v)?;
        }

        if let Ok(v) = std::env::var("FRAUD_ENGINE_HIGH_RISK_COUNTRIES") {
            config.geolocation.high_risk_countries = v
                .split(',')
                .map(|c| c.trim().to_uppercase())
                .filter(|c| !c.is_empty())
                .collect();
        }

        if let Ok(v) = std::env::var("FRAUD_ENGINE_LOG_JSON") {
            config.logging.json = parse_env("FRAUD_ENGINE_LOG_JSON", &v)?;
        }

        config.validate()?;
        Ok(config)
    }

    /// Reject configurations the engine cannot honour
    pub fn validate(&self) -> Result<()> {
        let t = &self.scoring.thresholds;
        if !(0.0 < t.medium && t.medium < t.high && t.high < t.critical && t.critical <= 100.0) {
            return Err(Error::InvalidConfig(format!(
                "risk thresholds must satisfy 0 < medium < high < critical <= 100, got {}/{}/{}",
                t.medium, t.high, t.critical
            )));
        }
        if self.timeouts.per_call_ms == 0 || self.timeouts.overall_ms == 0 {
            return Err(Error::InvalidConfig("timeouts must be non-zero".to_string()));
        }
        if !(1..=VelocityWindow::MAX_SECS).contains(&self.velocity.max_window_secs) {
            return Err(Error::InvalidConfig(format!(
                "velocity.max_window_secs must be within [1, {}]",
                VelocityWindow::MAX_SECS
            )));
        }
        if !(0.0..=1.0).contains(&self.device.fraud_rate_threshold) {
            return Err(Error::InvalidConfig(
                "device.fraud_rate_threshold must be within [0, 1]".to_string(),
            ));
        }
        if self.scoring.type_weights.values().any(|w| !w.is_finite() || *w < 0.0) {
            return Err(Error::InvalidConfig("type weights must be finite and non-negative".to_string()));
        }
        Ok(())
    }
}

fn parse_env<T: std::str::FromStr>(name: &str, value: &str) -> Result<T> {
    value
        .parse()
        .map_err(|_| Error::InvalidConfig(format!("{} has invalid value {:?}", name, value)))
}
