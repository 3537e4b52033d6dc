//! Read interfaces onto rule and pattern management
//!
//! The engine never writes through these; persistence of evaluation
//! outcomes is the caller's job.

use crate::types::{FraudPattern, FraudRule};
use crate::Result;
use async_trait::async_trait;
use parking_lot::RwLock;
use uuid::Uuid;

/// Source of the active rule set
#[async_trait]
pub trait RuleStore: Send + Sync {
    /// Rules currently marked active. Callers must still filter and order.
    async fn list_active_rules(&self) -> Result<Vec<FraudRule>>;
}

/// Source of blacklist / greylist patterns
#[async_trait]
pub trait PatternStore: Send + Sync {
    /// Every pattern row, including expired ones
    async fn list_patterns(&self) -> Result<Vec<FraudPattern>>;
}

/// In-memory store for tests and the demo binary
#[derive(Default)]
pub struct InMemoryStore {
    rules: RwLock<Vec<FraudRule>>,
    patterns: RwLock<Vec<FraudPattern>>,
}

impl InMemoryStore {
    /// Empty store
    pub fn new() -> Self {
        Self::default()
    }

    /// Store seeded with rules and patterns
    pub fn with_data(rules: Vec<FraudRule>, patterns: Vec<FraudPattern>) -> Self {
        Self {
            rules: RwLock::new(rules),
            patterns: RwLock::new(patterns),
        }
    }

    /// Insert or replace a rule by id
    pub fn upsert_rule(&self, rule: FraudRule) {
        let mut rules = self.rules.write();
        match rules.iter_mut().find(|r| r.id == rule.id) {
            Some(existing) => *existing = rule,
            None => rules.push(rule),
        }
    }

    /// Delete a rule by id
    pub fn remove_rule(&self, id: Uuid) {
        self.rules.write().retain(|r| r.id != id);
    }

    /// Append a pattern row
    pub fn add_pattern(&self, pattern: FraudPattern) {
        self.patterns.write().push(pattern);
    }
}

#[async_trait]
impl RuleStore for InMemoryStore {
    async fn list_active_rules(&self) -> Result<Vec<FraudRule>> {
        Ok(self
            .rules
            .read()
            .iter()
            .filter(|r| r.is_active)
            .cloned()
            .collect())
    }
}

#[async_trait]
impl PatternStore for InMemoryStore {
    async fn list_patterns(&self) -> Result<Vec<FraudPattern>> {
        Ok(self.patterns.read().clone())
    }
}
