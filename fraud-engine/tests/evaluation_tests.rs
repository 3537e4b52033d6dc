//! End-to-end evaluation tests against in-memory collaborators

use async_trait::async_trait;
use chrono::{DateTime, Duration as ChronoDuration, Utc};
use fraud_engine::{
    Decision, DeviceAttributes, EngineConfig, EntityType, Error, FraudCheckStatus, FraudEngine,
    FraudPattern, FraudRule, InMemoryStore, IpInfo, IpIntelligence, PatternStore, RequestContext,
    RiskLevel, RuleAction, RuleStore, RuleType, StaticIpIntelligence,
};
use serde_json::json;
use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;
use uuid::Uuid;

fn rule(
    name: &str,
    rule_type: RuleType,
    priority: i32,
    action: RuleAction,
    weight: f64,
    conditions: serde_json::Value,
) -> FraudRule {
    FraudRule {
        id: Uuid::new_v4(),
        name: name.to_string(),
        description: format!("{} rule", name),
        rule_type,
        conditions,
        action,
        weight,
        is_active: true,
        priority,
    }
}

fn request(amount: i64) -> RequestContext {
    RequestContext {
        payment_id: Uuid::new_v4(),
        merchant_id: Uuid::from_u128(7),
        customer_id: Uuid::from_u128(42),
        amount,
        currency: "USD".to_string(),
        ip_address: "203.0.113.9".to_string(),
        country: "US".to_string(),
        user_agent: "Mozilla/5.0".to_string(),
        email: "shopper@example.com".to_string(),
        phone_number: None,
        device_fingerprint: Some("fp-shopper".to_string()),
        device: DeviceAttributes::default(),
        card_token: Some("tok_visa_4242".to_string()),
        billing_address: None,
        shipping_address: None,
        metadata: HashMap::new(),
    }
}

fn clean_intel() -> Arc<StaticIpIntelligence> {
    let mut table = HashMap::new();
    table.insert(
        "203.0.113.9".to_string(),
        IpInfo {
            country: Some("US".to_string()),
            ..IpInfo::default()
        },
    );
    Arc::new(StaticIpIntelligence::new(table))
}

fn engine_with(store: Arc<InMemoryStore>, intel: Arc<dyn IpIntelligence>, config: EngineConfig) -> FraudEngine {
    FraudEngine::new(config, store.clone(), store, intel).unwrap()
}

fn t(secs: i64) -> DateTime<Utc> {
    DateTime::from_timestamp(1_700_000_000 + secs, 0).unwrap()
}

struct StallingIntel(Duration);

#[async_trait]
impl IpIntelligence for StallingIntel {
    async fn lookup_ip(&self, _ip: &str) -> fraud_engine::Result<IpInfo> {
        tokio::time::sleep(self.0).await;
        Ok(IpInfo {
            is_tor: true,
            ..IpInfo::default()
        })
    }
}

/// Store that can be switched into an outage
struct FlakyStore {
    inner: InMemoryStore,
    down: AtomicBool,
}

impl FlakyStore {
    fn new(inner: InMemoryStore) -> Arc<Self> {
        Arc::new(Self {
            inner,
            down: AtomicBool::new(false),
        })
    }

    fn set_down(&self, down: bool) {
        self.down.store(down, Ordering::SeqCst);
    }

    fn check(&self) -> fraud_engine::Result<()> {
        if self.down.load(Ordering::SeqCst) {
            return Err(Error::Store("connection refused".to_string()));
        }
        Ok(())
    }
}

#[async_trait]
impl RuleStore for FlakyStore {
    async fn list_active_rules(&self) -> fraud_engine::Result<Vec<FraudRule>> {
        self.check()?;
        self.inner.list_active_rules().await
    }
}

#[async_trait]
impl PatternStore for FlakyStore {
    async fn list_patterns(&self) -> fraud_engine::Result<Vec<FraudPattern>> {
        self.check()?;
        self.inner.list_patterns().await
    }
}

fn flaky_engine(store: Arc<FlakyStore>, config: EngineConfig) -> FraudEngine {
    FraudEngine::new(config, store.clone(), store, clean_intel()).unwrap()
}

#[tokio::test]
async fn test_block_rule_overrides_low_score() {
    let store = Arc::new(InMemoryStore::with_data(
        vec![
            rule("blocked email", RuleType::Pattern, 1, RuleAction::Block, 1.0, json!({ "entity": "EMAIL" })),
            rule("medium ticket", RuleType::Amount, 2, RuleAction::Review, 9.0, json!({ "above": 10_000 })),
        ],
        vec![FraudPattern {
            id: Uuid::new_v4(),
            pattern_type: EntityType::Email,
            pattern_value: "shopper@example.com".to_string(),
            reason: "confirmed account takeover".to_string(),
            severity: RiskLevel::Critical,
            is_blacklisted: true,
            expires_at: None,
            created_at: Utc::now(),
        }],
    ));
    let engine = engine_with(store, clean_intel(), EngineConfig::default());

    // 20_000 against 10_000 gives full overshoot on the amount rule
    let outcome = engine.evaluate(request(20_000)).await.unwrap();
    let check = &outcome.check;

    assert_eq!(check.status, FraudCheckStatus::Completed);
    assert_eq!(check.decision, Some(Decision::Block));
    assert_eq!(check.risk_score.unwrap().value(), 10.0);
    assert_eq!(check.risk_level, Some(RiskLevel::Low));
    assert_eq!(outcome.alerts.len(), 1);
    assert_eq!(outcome.alerts[0].alert_type, "BLOCKED_PAYMENT");
    assert_eq!(outcome.alerts[0].severity, RiskLevel::Low);
}

#[tokio::test]
async fn test_reasons_follow_priority_on_equal_weight() {
    let r1 = rule("first", RuleType::Amount, 1, RuleAction::Review, 20.0, json!({ "above": 1_000 }));
    let r2 = rule("second", RuleType::Amount, 2, RuleAction::Review, 20.0, json!({ "round_multiple": 1_000 }));
    // Insert in reverse to show store order does not matter
    let store = Arc::new(InMemoryStore::with_data(vec![r2, r1], vec![]));
    let engine = engine_with(store, clean_intel(), EngineConfig::default());

    let outcome = engine.evaluate(request(5_000)).await.unwrap();
    let names: Vec<_> = outcome.executions.iter().map(|e| e.rule_name.as_str()).collect();
    assert_eq!(names, vec!["first", "second"]);

    let reasons = &outcome.check.reasons;
    assert_eq!(reasons.len(), 2);
    assert!(reasons[0].contains("exceeds 1000"));
    assert!(reasons[1].contains("round amount"));
}

#[tokio::test]
async fn test_no_active_rules_fails() {
    let mut inactive = rule("off", RuleType::Amount, 1, RuleAction::Decline, 50.0, json!({ "above": 1 }));
    inactive.is_active = false;
    let store = Arc::new(InMemoryStore::with_data(vec![inactive], vec![]));
    let engine = engine_with(store, clean_intel(), EngineConfig::default());

    let outcome = engine.evaluate(request(100)).await.unwrap();
    assert_eq!(outcome.check.status, FraudCheckStatus::Failed);
    assert!(outcome.check.decision.is_none());
    assert!(outcome.check.risk_score.is_none());
    assert!(outcome.alerts.is_empty());
}

#[tokio::test]
async fn test_unparseable_condition_fails_check() {
    let store = Arc::new(InMemoryStore::with_data(
        vec![
            rule("fine", RuleType::Amount, 1, RuleAction::Review, 10.0, json!({ "above": 1 })),
            rule("broken", RuleType::Velocity, 2, RuleAction::Review, 10.0, json!({ "entity": "CARD" })),
        ],
        vec![],
    ));
    let engine = engine_with(store, clean_intel(), EngineConfig::default());

    let outcome = engine.evaluate(request(100)).await.unwrap();
    assert_eq!(outcome.check.status, FraudCheckStatus::Failed);
    assert!(outcome.check.failure_reason.unwrap().contains("broken"));
}

#[tokio::test]
async fn test_velocity_window_counts_lower_edge() {
    let store = Arc::new(InMemoryStore::with_data(
        vec![rule(
            "card burst",
            RuleType::Velocity,
            1,
            RuleAction::Review,
            30.0,
            json!({ "entity": "CARD", "window": "30s", "threshold": 10 }),
        )],
        vec![],
    ));
    let engine = engine_with(store, clean_intel(), EngineConfig::default());

    let mut last = None;
    for secs in [0, 10, 20, 30, 40] {
        last = Some(engine.evaluate_at(request(100), t(secs)).await.unwrap());
    }
    let outcome = last.unwrap();

    assert_eq!(outcome.velocity_checks.len(), 1);
    let check = &outcome.velocity_checks[0];
    assert_eq!(check.count, 4);
    assert_eq!(check.total_amount, 400);
    assert!(!check.exceeded);
    assert_eq!(outcome.check.decision, Some(Decision::Approve));
}

#[tokio::test]
async fn test_expired_pattern_does_not_match() {
    let now = Utc::now();
    let store = Arc::new(InMemoryStore::with_data(
        vec![rule("card blacklist", RuleType::Pattern, 1, RuleAction::Decline, 90.0, json!({ "entity": "CARD" }))],
        vec![FraudPattern {
            id: Uuid::new_v4(),
            pattern_type: EntityType::Card,
            pattern_value: "tok_visa_4242".to_string(),
            reason: "stolen card".to_string(),
            severity: RiskLevel::High,
            is_blacklisted: true,
            expires_at: Some(now - ChronoDuration::hours(1)),
            created_at: now - ChronoDuration::days(30),
        }],
    ));
    let engine = engine_with(store, clean_intel(), EngineConfig::default());

    let outcome = engine.evaluate_at(request(100), now).await.unwrap();
    assert!(!outcome.executions[0].matched);
    assert_eq!(outcome.check.decision, Some(Decision::Approve));
    assert!(outcome.check.reasons.is_empty());
}

#[tokio::test(start_paused = true)]
async fn test_stalled_ip_lookup_completes_neutral() {
    let store = Arc::new(InMemoryStore::with_data(
        vec![
            rule("tor exit", RuleType::Geolocation, 1, RuleAction::Decline, 80.0, json!({ "flags": ["TOR"] })),
            rule("amount", RuleType::Amount, 2, RuleAction::Review, 5.0, json!({ "above": 1_000_000 })),
        ],
        vec![],
    ));
    let engine = engine_with(
        store,
        Arc::new(StallingIntel(Duration::from_secs(2))),
        EngineConfig::default(),
    );

    let outcome = engine.evaluate(request(100)).await.unwrap();
    assert_eq!(outcome.check.status, FraudCheckStatus::Completed);
    assert_eq!(outcome.check.decision, Some(Decision::Approve));

    let geo = outcome.geolocation;
    assert!(!geo.resolved);
    assert!(!geo.is_tor);
    assert_eq!(geo.risk_score, 0.0);

    let tor = &outcome.executions[0];
    assert!(!tor.matched);
    assert_eq!(tor.details["degraded"], json!(true));
    assert!(outcome.check.reasons.iter().any(|r| r.contains("Timed out after 500ms")));
}

#[tokio::test(start_paused = true)]
async fn test_overall_deadline_bounds_slow_rules() {
    let mut config = EngineConfig::default();
    config.timeouts.per_call_ms = 5_000;
    config.timeouts.overall_ms = 1_000;

    let store = Arc::new(InMemoryStore::with_data(
        vec![
            rule("tor exit", RuleType::Geolocation, 1, RuleAction::Decline, 80.0, json!({ "flags": ["TOR"] })),
            rule("big ticket", RuleType::Amount, 2, RuleAction::Review, 30.0, json!({ "above": 50 })),
        ],
        vec![],
    ));
    let engine = engine_with(store, Arc::new(StallingIntel(Duration::from_secs(3))), config);

    let outcome = engine.evaluate(request(100)).await.unwrap();
    assert_eq!(outcome.check.status, FraudCheckStatus::Completed);

    let tor = &outcome.executions[0];
    assert!(!tor.matched);
    assert_eq!(tor.details["timeout"], json!(true));
    assert!(outcome.executions[1].matched);
    assert_eq!(outcome.check.decision, Some(Decision::Review));

    let reasons = &outcome.check.reasons;
    assert!(reasons[0].contains("exceeds 50"));
    assert!(reasons.iter().any(|r| r.contains("evaluation deadline reached")));
    assert!(reasons.iter().any(|r| r.contains("tor exit timed out")));
}

#[tokio::test]
async fn test_device_moderation_feeds_next_evaluation() {
    let store = Arc::new(InMemoryStore::with_data(
        vec![rule("bad device", RuleType::Device, 1, RuleAction::Decline, 70.0, json!({}))],
        vec![],
    ));
    let engine = engine_with(store, clean_intel(), EngineConfig::default());

    let first = engine.evaluate(request(100)).await.unwrap();
    assert_eq!(first.check.decision, Some(Decision::Approve));
    let device = first.device.unwrap();
    assert_eq!(device.transaction_count, 1);
    assert_eq!(device.fraud_count, 0);

    engine.device_tracker().set_blacklisted("fp-shopper", true);
    let second = engine.evaluate(request(100)).await.unwrap();
    assert_eq!(second.check.decision, Some(Decision::Decline));
    assert_eq!(second.check.risk_level, Some(RiskLevel::High));
    assert_eq!(second.device.unwrap().transaction_count, 2);
    assert_eq!(second.alerts[0].alert_type, "DECLINED_PAYMENT");
}

#[tokio::test]
async fn test_unknown_rule_type_completes() {
    let store = Arc::new(InMemoryStore::new());
    let mut ml = rule("model score", RuleType::Amount, 1, RuleAction::Block, 100.0, json!({}));
    ml.rule_type = serde_json::from_value(json!("ML_MODEL")).unwrap();
    store.upsert_rule(ml);
    let engine = engine_with(store, clean_intel(), EngineConfig::default());

    let outcome = engine.evaluate(request(100)).await.unwrap();
    assert_eq!(outcome.check.status, FraudCheckStatus::Completed);
    assert_eq!(outcome.check.decision, Some(Decision::Approve));
    assert_eq!(outcome.executions[0].rule_type, RuleType::Unknown);
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn test_concurrent_evaluations_share_velocity_state() {
    let store = Arc::new(InMemoryStore::with_data(
        vec![rule(
            "customer burst",
            RuleType::Velocity,
            1,
            RuleAction::Review,
            10.0,
            json!({ "entity": "CUSTOMER", "window": "1h", "threshold": 1_000 }),
        )],
        vec![],
    ));
    let engine = Arc::new(engine_with(store, clean_intel(), EngineConfig::default()));
    let at = Utc::now();

    let handles: Vec<_> = (0..50)
        .map(|_| {
            let engine = engine.clone();
            tokio::spawn(async move { engine.evaluate_at(request(10), at).await })
        })
        .collect();
    for handle in handles {
        let outcome = handle.await.unwrap().unwrap();
        assert_eq!(outcome.check.status, FraudCheckStatus::Completed);
    }

    let outcome = engine.evaluate_at(request(10), at).await.unwrap();
    assert_eq!(outcome.velocity_checks[0].count, 51);
    assert_eq!(outcome.velocity_checks[0].total_amount, 510);
    assert_eq!(
        engine
            .device_tracker()
            .get("fp-shopper")
            .unwrap()
            .transaction_count,
        51
    );
}

#[tokio::test]
async fn test_oversized_velocity_window_fails_check() {
    let store = Arc::new(InMemoryStore::with_data(
        vec![rule(
            "ancient history",
            RuleType::Velocity,
            1,
            RuleAction::Review,
            10.0,
            json!({ "entity": "CARD", "window": "100000000d", "threshold": 1 }),
        )],
        vec![],
    ));
    let engine = engine_with(store, clean_intel(), EngineConfig::default());

    let outcome = engine.evaluate(request(100)).await.unwrap();
    assert_eq!(outcome.check.status, FraudCheckStatus::Failed);
    assert!(outcome.check.failure_reason.unwrap().contains("ancient history"));
}

#[tokio::test]
async fn test_rule_store_outage_serves_previous_snapshot() {
    let store = FlakyStore::new(InMemoryStore::with_data(
        vec![rule("big ticket", RuleType::Amount, 1, RuleAction::Review, 30.0, json!({ "above": 1_000 }))],
        vec![],
    ));
    let mut config = EngineConfig::default();
    // Reload on every evaluation
    config.rules.cache_ttl_secs = 0;
    let engine = flaky_engine(store.clone(), config);

    let before = engine.evaluate(request(5_000)).await.unwrap();
    assert_eq!(before.check.decision, Some(Decision::Review));

    store.set_down(true);
    let during = engine.evaluate(request(5_000)).await.unwrap();
    assert_eq!(during.check.status, FraudCheckStatus::Completed);
    assert_eq!(during.check.decision, Some(Decision::Review));
    assert_eq!(during.executions.len(), 1);
}

#[tokio::test]
async fn test_rule_store_outage_without_snapshot_fails() {
    let store = FlakyStore::new(InMemoryStore::with_data(
        vec![rule("big ticket", RuleType::Amount, 1, RuleAction::Review, 30.0, json!({ "above": 1_000 }))],
        vec![],
    ));
    store.set_down(true);
    let engine = flaky_engine(store, EngineConfig::default());

    let outcome = engine.evaluate(request(5_000)).await.unwrap();
    assert_eq!(outcome.check.status, FraudCheckStatus::Failed);
    assert!(outcome.check.decision.is_none());
    assert!(outcome.check.failure_reason.unwrap().contains("connection refused"));
}

#[tokio::test]
async fn test_pattern_store_outage_keeps_previous_snapshot() {
    let store = FlakyStore::new(InMemoryStore::with_data(
        vec![rule("blocked email", RuleType::Pattern, 1, RuleAction::Block, 50.0, json!({ "entity": "EMAIL" }))],
        vec![FraudPattern {
            id: Uuid::new_v4(),
            pattern_type: EntityType::Email,
            pattern_value: "shopper@example.com".to_string(),
            reason: "chargeback ring".to_string(),
            severity: RiskLevel::High,
            is_blacklisted: true,
            expires_at: None,
            created_at: Utc::now(),
        }],
    ));
    let mut config = EngineConfig::default();
    // Snapshot is stale on every evaluation
    config.patterns.refresh_interval_secs = 0;
    let engine = flaky_engine(store.clone(), config);

    let before = engine.evaluate(request(100)).await.unwrap();
    assert_eq!(before.check.decision, Some(Decision::Block));

    store.set_down(true);
    let during = engine.evaluate(request(100)).await.unwrap();
    assert_eq!(during.check.status, FraudCheckStatus::Completed);
    assert_eq!(during.check.decision, Some(Decision::Block));
    assert_eq!(engine.pattern_matcher().total_entries(), 1);
}
