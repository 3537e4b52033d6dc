//! Geolocation assessment of the client IP / declared country pair

use crate::config::GeolocationConfig;
use crate::types::GeolocationCheck;
use crate::{Error, Result};
use async_trait::async_trait;
use chrono::Utc;
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;
use tokio::time::timeout;
use tracing::{debug, warn};
use uuid::Uuid;

/// IP intelligence record
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct IpInfo {
    /// Known anonymising proxy
    pub is_proxy: bool,
    /// Known VPN endpoint
    pub is_vpn: bool,
    /// Tor exit node
    pub is_tor: bool,
    /// ISO country code
    pub country: Option<String>,
    /// City, when known
    pub city: Option<String>,
    /// Latitude
    pub latitude: Option<f64>,
    /// Longitude
    pub longitude: Option<f64>,
}

/// External IP intelligence capability
#[async_trait]
pub trait IpIntelligence: Send + Sync {
    /// Resolve intelligence for one IP address
    async fn lookup_ip(&self, ip: &str) -> Result<IpInfo>;
}

/// Fixed lookup table; unknown IPs fail the lookup
#[derive(Debug, Default)]
pub struct StaticIpIntelligence {
    table: HashMap<String, IpInfo>,
}

impl StaticIpIntelligence {
    /// Serve lookups from a fixed table
    pub fn new(table: HashMap<String, IpInfo>) -> Self {
        Self { table }
    }
}

#[async_trait]
impl IpIntelligence for StaticIpIntelligence {
    async fn lookup_ip(&self, ip: &str) -> Result<IpInfo> {
        self.table
            .get(ip.trim())
            .cloned()
            .ok_or_else(|| Error::IpLookup(format!("no intelligence for {}", ip)))
    }
}

/// Classifies proxy / VPN / Tor / high-risk-country status
pub struct GeolocationAssessor {
    intel: Arc<dyn IpIntelligence>,
    config: GeolocationConfig,
    per_call_timeout: Duration,
}

impl GeolocationAssessor {
    /// Wrap an IP intelligence source with a per-call timeout
    pub fn new(intel: Arc<dyn IpIntelligence>, config: GeolocationConfig, per_call_timeout: Duration) -> Self {
        Self {
            intel,
            config,
            per_call_timeout,
        }
    }

    /// Assess an IP / country pair. Lookup failures and timeouts produce a
    /// zero-confidence check with `resolved = false` and a note.
    pub async fn assess(&self, fraud_check_id: Uuid, ip: &str, country: &str) -> GeolocationCheck {
        let lookup = timeout(self.per_call_timeout, self.intel.lookup_ip(ip)).await;

        let (info, note) = match lookup {
            Ok(Ok(info)) => (Some(info), None),
            Ok(Err(e)) => {
                warn!(ip, "IP intelligence lookup failed: {}", e);
                (None, Some(format!("Geolocation unresolved for IP {}: {}", ip, e)))
            }
            Err(_) => {
                let e = Error::Timeout(self.per_call_timeout.as_millis() as u64);
                warn!(ip, "IP intelligence lookup timed out");
                (None, Some(format!("Geolocation unresolved for IP {}: {}", ip, e)))
            }
        };

        let check = match info {
            Some(info) => self.classify(fraud_check_id, ip, country, info),
            None => self.unresolved(fraud_check_id, ip, country, note),
        };

        debug!(
            ip,
            proxy = check.is_proxy,
            vpn = check.is_vpn,
            tor = check.is_tor,
            high_risk_country = check.is_high_risk_country,
            score = check.risk_score,
            "geolocation assessed"
        );
        check
    }

    fn classify(&self, fraud_check_id: Uuid, ip: &str, country: &str, info: IpInfo) -> GeolocationCheck {
        let is_high_risk_country = self.is_high_risk(country)
            || info.country.as_deref().map_or(false, |c| self.is_high_risk(c));

        let mut score = 0.0;
        if info.is_proxy {
            score += self.config.proxy_weight;
        }
        if info.is_vpn {
            score += self.config.vpn_weight;
        }
        if info.is_tor {
            score += self.config.tor_weight;
        }
        if is_high_risk_country {
            score += self.config.high_risk_country_weight;
        }

        let resolved_country = if country.trim().is_empty() {
            info.country.clone().unwrap_or_default()
        } else {
            country.to_string()
        };

        GeolocationCheck {
            id: Uuid::new_v4(),
            fraud_check_id,
            ip_address: ip.to_string(),
            country: resolved_country,
            city: info.city,
            latitude: info.latitude,
            longitude: info.longitude,
            is_proxy: info.is_proxy,
            is_vpn: info.is_vpn,
            is_tor: info.is_tor,
            is_high_risk_country,
            risk_score: score.min(100.0),
            resolved: true,
            note: None,
            created_at: Utc::now(),
        }
    }

    /// Zero-confidence check for an IP that could not be assessed
    pub fn unresolved(&self, fraud_check_id: Uuid, ip: &str, country: &str, note: Option<String>) -> GeolocationCheck {
        let is_high_risk_country = self.config.degraded_keeps_country_flag && self.is_high_risk(country);
        let risk_score = if is_high_risk_country {
            self.config.high_risk_country_weight.min(100.0)
        } else {
            0.0
        };

        GeolocationCheck {
            id: Uuid::new_v4(),
            fraud_check_id,
            ip_address: ip.to_string(),
            country: country.to_string(),
            city: None,
            latitude: None,
            longitude: None,
            is_proxy: false,
            is_vpn: false,
            is_tor: false,
            is_high_risk_country,
            risk_score,
            resolved: false,
            note,
            created_at: Utc::now(),
        }
    }

    fn is_high_risk(&self, country: &str) -> bool {
        let upper = country.trim().to_uppercase();
        !upper.is_empty()
            && self
                .config
                .high_risk_countries
                .iter()
                .any(|c| c.to_uppercase() == upper)
    }
}
