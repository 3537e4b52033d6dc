//! Fraud Engine
//!
//! Real-time fraud decisioning for payment attempts.
//!
//! # Architecture
//!
//! - **Rule Engine**: typed rule conditions evaluated concurrently under a deadline
//! - **Signals**: velocity windows, geolocation, device reputation, blacklist patterns
//! - **Aggregation**: score, risk level and decision with an ordered reason list
//!
//! # Invariants
//!
//! - Risk score stays within [0, 100]
//! - A check moves PENDING -> PROCESSING -> COMPLETED | FAILED and never back
//! - A matched BLOCK rule always yields BLOCK, whatever the score

#![forbid(unsafe_code)]
#![warn(missing_docs)]

pub mod config;
pub mod device;
pub mod engine;
pub mod error;
pub mod geolocation;
pub mod metrics;
pub mod patterns;
pub mod rules;
pub mod scoring;
pub mod store;
pub mod types;
pub mod velocity;

pub use config::EngineConfig;
pub use device::{DeviceReputationTracker, DeviceSignal};
pub use engine::FraudEngine;
pub use error::{Error, Result};
pub use geolocation::{GeolocationAssessor, IpInfo, IpIntelligence, StaticIpIntelligence};
pub use metrics::Metrics;
pub use patterns::{PatternMatch, PatternMatcher};
pub use rules::{RuleCondition, RuleEngine};
pub use scoring::{DecisionAggregator, Verdict};
pub use store::{InMemoryStore, PatternStore, RuleStore};
pub use types::*;
pub use velocity::VelocityTracker;
