//! Error types for the fraud engine

use thiserror::Error;

/// Fraud engine error
#[derive(Debug, Error)]
pub enum Error {
    /// No active rules available for evaluation
    #[error("No active fraud rules available")]
    NoActiveRules,

    /// Rule condition could not be parsed for its rule type
    #[error("Invalid condition for rule {rule}: {reason}")]
    InvalidCondition {
        /// Rule name
        rule: String,
        /// Parse failure
        reason: String,
    },

    /// Internal invariant violated (score range, decision value)
    #[error("Invariant violation: {0}")]
    InvariantViolation(String),

    /// Illegal fraud check status transition
    #[error("Invalid status transition: {from} -> {to}")]
    InvalidTransition {
        /// Current status
        from: String,
        /// Requested status
        to: String,
    },

    /// Pattern cache has never been loaded
    #[error("Pattern cache unavailable: {0}")]
    PatternCacheUnavailable(String),

    /// IP intelligence lookup failed
    #[error("IP lookup failed: {0}")]
    IpLookup(String),

    /// Assessor call exceeded its time budget
    #[error("Timed out after {0}ms")]
    Timeout(u64),

    /// Rule or pattern store failure
    #[error("Store error: {0}")]
    Store(String),

    /// Invalid configuration
    #[error("Invalid configuration: {0}")]
    InvalidConfig(String),

    /// Invalid velocity window label
    #[error("Invalid velocity window: {0}")]
    InvalidWindow(String),

    /// Metrics registration failure
    #[error("Metrics error: {0}")]
    Metrics(#[from] prometheus::Error),

    /// IO error
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),
}

impl Error {
    /// Structural failures and invariant violations fail the whole check;
    /// everything else degrades locally.
    pub fn is_structural(&self) -> bool {
        matches!(
            self,
            Error::NoActiveRules | Error::InvalidCondition { .. } | Error::InvariantViolation(_)
        )
    }
}

/// Result type
pub type Result<T> = std::result::Result<T, Error>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_structural_classification() {
        assert!(Error::NoActiveRules.is_structural());
        assert!(Error::InvariantViolation("score 120".into()).is_structural());
        assert!(!Error::Timeout(500).is_structural());
        assert!(!Error::IpLookup("refused".into()).is_structural());
    }
}
