//! Blacklist / greylist pattern matching
//!
//! A read-only cache over the external pattern store. Lookups are exact
//! (case-insensitive for email and IP) and ignore expired rows.

use crate::store::PatternStore;
use crate::types::{FraudPattern, PatternType};
use crate::{Error, Result};
use chrono::{DateTime, Utc};
use parking_lot::RwLock;
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;
use tokio::time::Instant;
use tracing::{debug, info, warn};

/// Result of a pattern lookup
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PatternMatch {
    /// A live pattern matched
    pub found: bool,
    /// The winning pattern row
    pub pattern: Option<FraudPattern>,
}

impl PatternMatch {
    fn none() -> Self {
        Self {
            found: false,
            pattern: None,
        }
    }
}

struct PatternIndex {
    // Map: (type, normalized value) -> rows
    entries: HashMap<(PatternType, String), Vec<FraudPattern>>,
    loaded_at: Instant,
}

impl PatternIndex {
    fn build(patterns: Vec<FraudPattern>) -> Self {
        let mut entries: HashMap<(PatternType, String), Vec<FraudPattern>> = HashMap::new();
        for pattern in patterns {
            let key = (
                pattern.pattern_type,
                pattern.pattern_type.normalize(&pattern.pattern_value),
            );
            entries.entry(key).or_default().push(pattern);
        }
        Self {
            entries,
            loaded_at: Instant::now(),
        }
    }

    fn len(&self) -> usize {
        self.entries.values().map(Vec::len).sum()
    }
}

/// PatternMatcher serves lookups from a periodically refreshed snapshot
pub struct PatternMatcher {
    store: Arc<dyn PatternStore>,
    refresh_interval: Duration,
    index: RwLock<Option<Arc<PatternIndex>>>,
    refresh_lock: tokio::sync::Mutex<()>,
}

impl PatternMatcher {
    /// Create a matcher with no snapshot loaded
    pub fn new(store: Arc<dyn PatternStore>, refresh_interval: Duration) -> Self {
        Self {
            store,
            refresh_interval,
            index: RwLock::new(None),
            refresh_lock: tokio::sync::Mutex::new(()),
        }
    }

    /// Replace the snapshot with the given patterns
    pub fn load(&self, patterns: Vec<FraudPattern>) {
        let index = PatternIndex::build(patterns);
        info!("Loaded pattern snapshot with {} entries", index.len());
        *self.index.write() = Some(Arc::new(index));
    }

    /// Reload from the store. On failure the previous snapshot stays.
    pub async fn refresh(&self) -> Result<()> {
        let patterns = self.store.list_patterns().await?;
        self.load(patterns);
        Ok(())
    }

    /// Refresh if the snapshot is missing or older than the refresh interval
    pub async fn ensure_fresh(&self) {
        if !self.is_stale() {
            return;
        }
        let _guard = self.refresh_lock.lock().await;
        // Another evaluation may have refreshed while we waited
        if !self.is_stale() {
            return;
        }
        if let Err(e) = self.refresh().await {
            warn!("Pattern refresh failed, serving previous snapshot: {}", e);
        }
    }

    fn is_stale(&self) -> bool {
        match self.index.read().as_ref() {
            Some(index) => index.loaded_at.elapsed() >= self.refresh_interval,
            None => true,
        }
    }

    /// Look up a live pattern for an entity value.
    ///
    /// Highest severity wins; ties go to the most recently created row.
    pub fn match_pattern(
        &self,
        pattern_type: PatternType,
        value: &str,
        now: DateTime<Utc>,
    ) -> Result<PatternMatch> {
        let index = self.index.read().clone().ok_or_else(|| {
            Error::PatternCacheUnavailable("pattern snapshot never loaded".to_string())
        })?;

        let key = (pattern_type, pattern_type.normalize(value));
        let best = index.entries.get(&key).and_then(|rows| {
            rows.iter()
                .filter(|p| p.is_live_at(now))
                .max_by(|a, b| {
                    a.severity
                        .cmp(&b.severity)
                        .then(a.created_at.cmp(&b.created_at))
                })
                .cloned()
        });

        match best {
            Some(pattern) => {
                debug!(pattern_type = %pattern_type, severity = ?pattern.severity, "pattern match");
                Ok(PatternMatch {
                    found: true,
                    pattern: Some(pattern),
                })
            }
            None => Ok(PatternMatch::none()),
        }
    }

    /// Rows in the current snapshot, expired included
    pub fn total_entries(&self) -> usize {
        self.index.read().as_ref().map_or(0, |i| i.len())
    }
}
