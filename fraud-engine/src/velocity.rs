//! Velocity tracking for payment entities
//!
//! Sliding windows of (timestamp, amount) events per (entity type, value).
//! Windows are closed `[at - window, at]`: an event exactly one window old
//! still counts.

use crate::types::{EntityType, ThresholdKind, VelocityCheck, VelocityWindow};
use chrono::{DateTime, Duration, Utc};
use dashmap::DashMap;
use std::collections::VecDeque;
use std::sync::Arc;
use tracing::debug;
use uuid::Uuid;

/// Single observed payment
#[derive(Debug, Clone, Copy)]
struct VelocityEvent {
    amount: i64,
    timestamp: DateTime<Utc>,
}

/// Event history for one entity
struct EntityVelocity {
    events: VecDeque<VelocityEvent>,
    retention: Duration,
}

impl EntityVelocity {
    fn new(retention: Duration) -> Self {
        Self {
            events: VecDeque::new(),
            retention,
        }
    }

    /// Drop events older than `now - retention`
    fn evict(&mut self, now: DateTime<Utc>) {
        let horizon = clamped_start(now, self.retention);
        while self.events.front().map_or(false, |e| e.timestamp < horizon) {
            self.events.pop_front();
        }
    }

    /// Insert keeping timestamp order; late arrivals are rare
    fn record(&mut self, amount: i64, timestamp: DateTime<Utc>) {
        let event = VelocityEvent { amount, timestamp };
        match self.events.back() {
            Some(last) if last.timestamp > timestamp => {
                let idx = self.events.partition_point(|e| e.timestamp <= timestamp);
                self.events.insert(idx, event);
            }
            _ => self.events.push_back(event),
        }
    }

    /// Count and total of events in `[start, end]`
    fn window_totals(&self, start: DateTime<Utc>, end: DateTime<Utc>) -> (u64, i64) {
        self.events
            .iter()
            .filter(|e| e.timestamp >= start && e.timestamp <= end)
            .fold((0u64, 0i64), |(count, total), e| {
                (count + 1, total.saturating_add(e.amount))
            })
    }
}

/// Start of a window ending at `at`, clamped to the earliest representable instant
fn clamped_start(at: DateTime<Utc>, window: Duration) -> DateTime<Utc> {
    at.checked_sub_signed(window).unwrap_or(DateTime::<Utc>::MIN_UTC)
}

/// Velocity tracker shared across concurrent evaluations
pub struct VelocityTracker {
    max_window: Duration,
    // Map: (entity type, normalized value) -> history
    entities: Arc<DashMap<(EntityType, String), EntityVelocity>>,
}

impl VelocityTracker {
    /// Create a tracker retaining events for at least `max_window`
    pub fn new(max_window: Duration) -> Self {
        Self {
            max_window,
            entities: Arc::new(DashMap::new()),
        }
    }

    /// Record one payment for an entity
    pub fn observe(&self, entity_type: EntityType, entity_value: &str, amount: i64, at: DateTime<Utc>) {
        let key = (entity_type, entity_type.normalize(entity_value));
        let mut entry = self
            .entities
            .entry(key)
            .or_insert_with(|| EntityVelocity::new(self.max_window));
        let entity = entry.value_mut();
        entity.evict(at);
        entity.record(amount, at);
    }

    /// Materialize a window observation for an entity
    pub fn evaluate(
        &self,
        entity_type: EntityType,
        entity_value: &str,
        window: &VelocityWindow,
        threshold: i64,
        threshold_kind: ThresholdKind,
        at: DateTime<Utc>,
    ) -> VelocityCheck {
        let normalized = entity_type.normalize(entity_value);
        let window_start = clamped_start(at, window.duration());

        let (count, total_amount) = match self.entities.get_mut(&(entity_type, normalized.clone())) {
            Some(mut entry) => {
                let entity = entry.value_mut();
                if window.duration() > entity.retention {
                    entity.retention = window.duration();
                }
                entity.evict(at);
                entity.window_totals(window_start, at)
            }
            None => (0, 0),
        };

        let observed = match threshold_kind {
            ThresholdKind::Count => i64::try_from(count).unwrap_or(i64::MAX),
            ThresholdKind::Amount => total_amount,
        };
        let exceeded = observed > threshold;

        debug!(
            entity_type = %entity_type,
            window = window.label(),
            count,
            total_amount,
            threshold,
            exceeded,
            "velocity window evaluated"
        );

        VelocityCheck {
            id: Uuid::new_v4(),
            entity_type,
            entity_value: normalized,
            time_window: window.label().to_string(),
            count,
            total_amount,
            threshold,
            threshold_kind,
            exceeded,
            window_start,
            window_end: at,
        }
    }

    /// Clear history for an entity (manual reset)
    pub fn reset(&self, entity_type: EntityType, entity_value: &str) {
        self.entities
            .remove(&(entity_type, entity_type.normalize(entity_value)));
    }

    /// Number of tracked entities
    pub fn tracked_entities(&self) -> usize {
        self.entities.len()
    }
}
