//! Device reputation tracking keyed by fingerprint hash

use crate::config::DeviceConfig;
use crate::types::{DeviceAttributes, DeviceFingerprint};
use chrono::{DateTime, Utc};
use dashmap::DashMap;
use serde::{Deserialize, Serialize};
use std::sync::Arc;
use tracing::{debug, info};
use uuid::Uuid;

/// Reputation signal handed to the rule engine
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DeviceSignal {
    /// Device record after the touch
    pub fingerprint: DeviceFingerprint,
    /// Confirmed fraud over transactions, 0 for unseen devices
    pub fraud_rate: f64,
    /// Fraud rate reached the threshold with enough sample; never blacklists
    pub high_fraud_rate: bool,
}

/// Per-fingerprint counters shared across concurrent evaluations
pub struct DeviceReputationTracker {
    config: DeviceConfig,
    devices: Arc<DashMap<String, DeviceFingerprint>>,
}

impl DeviceReputationTracker {
    /// Create an empty tracker
    pub fn new(config: DeviceConfig) -> Self {
        Self {
            config,
            devices: Arc::new(DashMap::new()),
        }
    }

    /// Seed records from the store
    pub fn load(&self, records: Vec<DeviceFingerprint>) {
        let count = records.len();
        for record in records {
            self.devices.insert(record.fingerprint_hash.clone(), record);
        }
        info!("Loaded {} device fingerprints", count);
    }

    /// Record a transaction from a device, creating it on first sight.
    /// Read-modify-write is atomic per fingerprint.
    pub fn touch(
        &self,
        fingerprint_hash: &str,
        user_agent: &str,
        attrs: &DeviceAttributes,
        at: DateTime<Utc>,
        was_fraud: bool,
    ) -> DeviceFingerprint {
        let fraud_increment = u64::from(was_fraud);
        let mut entry = self
            .devices
            .entry(fingerprint_hash.to_string())
            .and_modify(|device| {
                if at > device.last_seen {
                    device.last_seen = at;
                }
                if !user_agent.is_empty() {
                    device.user_agent = user_agent.to_string();
                }
                if attrs.screen_resolution.is_some() {
                    device.screen_resolution = attrs.screen_resolution.clone();
                }
                if attrs.timezone.is_some() {
                    device.timezone = attrs.timezone.clone();
                }
                if attrs.language.is_some() {
                    device.language = attrs.language.clone();
                }
                device.transaction_count += 1;
                device.fraud_count += fraud_increment;
            })
            .or_insert_with(|| DeviceFingerprint {
                id: Uuid::new_v4(),
                fingerprint_hash: fingerprint_hash.to_string(),
                user_agent: user_agent.to_string(),
                screen_resolution: attrs.screen_resolution.clone(),
                timezone: attrs.timezone.clone(),
                language: attrs.language.clone(),
                first_seen: at,
                last_seen: at,
                transaction_count: 1,
                fraud_count: fraud_increment,
                is_blacklisted: false,
            });

        let device = entry.value_mut().clone();
        debug!(
            transactions = device.transaction_count,
            frauds = device.fraud_count,
            "device touched"
        );
        device
    }

    /// Confirmed-fraud feedback; counts fraud without a new transaction
    pub fn confirm_fraud(&self, fingerprint_hash: &str) -> Option<DeviceFingerprint> {
        self.devices.get_mut(fingerprint_hash).map(|mut device| {
            device.fraud_count += 1;
            device.clone()
        })
    }

    /// Moderation action
    pub fn set_blacklisted(&self, fingerprint_hash: &str, blacklisted: bool) -> Option<DeviceFingerprint> {
        self.devices.get_mut(fingerprint_hash).map(|mut device| {
            device.is_blacklisted = blacklisted;
            info!(blacklisted, "device moderation updated");
            device.clone()
        })
    }

    /// Current record for a fingerprint
    pub fn get(&self, fingerprint_hash: &str) -> Option<DeviceFingerprint> {
        self.devices.get(fingerprint_hash).map(|d| d.clone())
    }

    /// Reputation signal using the configured fraud-rate threshold
    pub fn reputation(&self, fingerprint_hash: &str) -> Option<DeviceSignal> {
        self.get(fingerprint_hash)
            .map(|d| self.signal(d, self.config.fraud_rate_threshold, self.config.min_sample))
    }

    /// Build a signal for a record with explicit thresholds
    pub fn signal(&self, fingerprint: DeviceFingerprint, rate_threshold: f64, min_sample: u64) -> DeviceSignal {
        let fraud_rate = fingerprint.fraud_rate();
        let high_fraud_rate = fingerprint.transaction_count >= min_sample && fraud_rate >= rate_threshold;
        DeviceSignal {
            fingerprint,
            fraud_rate,
            high_fraud_rate,
        }
    }

    /// Moderation and signal thresholds
    pub fn config(&self) -> &DeviceConfig {
        &self.config
    }

    /// Number of known devices
    pub fn tracked_devices(&self) -> usize {
        self.devices.len()
    }
}
