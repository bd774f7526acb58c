//! Policy engine over verified claims.
//!
//! Evaluation is a pure function of the claims and the rules loaded at
//! construction. It is fail-closed: when an active rule depends on a field
//! that is missing or unusable, the decision is a denial naming that rule.
//! Rules run in a fixed order and the first failing rule decides.

use serde::{Deserialize, Serialize};
use std::fmt;

use sovereign_core::PolicyConfig;

use crate::claims::{IntegrityStatus, VerifiedClaims};
use crate::error::{IdentityError, IdentityResult};

/// GPU status string the `GpuHealth` rule requires.
pub const HEALTHY_GPU_STATUS: &str = "healthy";

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum PolicyRule {
    HostIntegrity,
    Geofence,
    GpuHealth,
    GpuUtilization,
    GpuMemory,
}

impl PolicyRule {
    pub fn as_str(&self) -> &'static str {
        match self {
            PolicyRule::HostIntegrity => "host_integrity",
            PolicyRule::Geofence => "geofence",
            PolicyRule::GpuHealth => "gpu_health",
            PolicyRule::GpuUtilization => "gpu_utilization",
            PolicyRule::GpuMemory => "gpu_memory",
        }
    }
}

impl fmt::Display for PolicyRule {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Outcome of one evaluation. Never persisted.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PolicyDecision {
    pub allowed: bool,
    pub reason: String,
    /// Rule that denied, if any
    pub rule: Option<PolicyRule>,
}

impl PolicyDecision {
    fn allow() -> Self {
        Self {
            allowed: true,
            reason: "all policy checks passed".to_string(),
            rule: None,
        }
    }

    fn deny(rule: PolicyRule, reason: impl Into<String>) -> Self {
        Self {
            allowed: false,
            reason: reason.into(),
            rule: Some(rule),
        }
    }

    /// Convert a denial into [`IdentityError::PolicyDenial`].
    pub fn into_result(self) -> IdentityResult<()> {
        match (self.allowed, self.rule) {
            (true, _) => Ok(()),
            (false, Some(rule)) => Err(IdentityError::PolicyDenial {
                rule,
                reason: self.reason,
            }),
            (false, None) => Err(IdentityError::InvalidState(
                "policy denial without a rule".to_string(),
            )),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
enum GeoPattern {
    Any,
    Exact(String),
    Country(String),
}

impl GeoPattern {
    fn parse(raw: &str) -> IdentityResult<Self> {
        let pattern = raw.trim();
        if pattern.is_empty() {
            return Err(IdentityError::InvalidRequest(
                "empty geolocation pattern".to_string(),
            ));
        }
        if pattern == "*" {
            return Ok(GeoPattern::Any);
        }
        if let Some(country) = pattern.strip_suffix('*') {
            let country = country.trim_end().strip_suffix(':').ok_or_else(|| {
                IdentityError::InvalidRequest(format!(
                    "wildcard pattern {raw:?} must look like \"Country: *\""
                ))
            })?;
            let country = country.trim();
            if country.is_empty() {
                return Err(IdentityError::InvalidRequest(format!(
                    "wildcard pattern {raw:?} names no country"
                )));
            }
            return Ok(GeoPattern::Country(country.to_string()));
        }
        Ok(GeoPattern::Exact(pattern.to_string()))
    }

    fn matches(&self, location: &str) -> bool {
        let location = location.trim();
        match self {
            GeoPattern::Any => !location.is_empty(),
            GeoPattern::Exact(expected) => location.eq_ignore_ascii_case(expected),
            GeoPattern::Country(country) => {
                let head = location.split(':').next().unwrap_or_default().trim();
                head.eq_ignore_ascii_case(country)
            }
        }
    }
}

/// Evaluates verified claims against operator rules.
#[derive(Debug, Clone)]
pub struct PolicyEngine {
    allowed_geolocations: Vec<GeoPattern>,
    require_host_integrity: bool,
    require_healthy_gpu: bool,
    min_gpu_utilization_pct: Option<f64>,
    max_gpu_utilization_pct: Option<f64>,
    min_gpu_memory_mb: Option<i64>,
}

impl PolicyEngine {
    /// Load rules. Rejects configurations evaluation could not apply.
    pub fn new(config: &PolicyConfig) -> IdentityResult<Self> {
        let allowed_geolocations = config
            .allowed_geolocations
            .iter()
            .map(|p| GeoPattern::parse(p))
            .collect::<IdentityResult<Vec<_>>>()?;

        for bound in [config.min_gpu_utilization_pct, config.max_gpu_utilization_pct]
            .into_iter()
            .flatten()
        {
            if !bound.is_finite() {
                return Err(IdentityError::InvalidRequest(
                    "GPU utilization bounds must be finite".to_string(),
                ));
            }
        }
        if let (Some(min), Some(max)) = (config.min_gpu_utilization_pct, config.max_gpu_utilization_pct) {
            if min > max {
                return Err(IdentityError::InvalidRequest(format!(
                    "GPU utilization minimum {min} exceeds maximum {max}"
                )));
            }
        }

        Ok(Self {
            allowed_geolocations,
            require_host_integrity: config.require_host_integrity,
            require_healthy_gpu: config.require_healthy_gpu,
            min_gpu_utilization_pct: config.min_gpu_utilization_pct,
            max_gpu_utilization_pct: config.max_gpu_utilization_pct,
            min_gpu_memory_mb: config.min_gpu_memory_mb,
        })
    }

    /// Which rules are active, in evaluation order.
    pub fn active_rules(&self) -> Vec<PolicyRule> {
        let mut rules = Vec::new();
        if self.require_host_integrity {
            rules.push(PolicyRule::HostIntegrity);
        }
        if !self.allowed_geolocations.is_empty() {
            rules.push(PolicyRule::Geofence);
        }
        if self.require_healthy_gpu {
            rules.push(PolicyRule::GpuHealth);
        }
        if self.min_gpu_utilization_pct.is_some() || self.max_gpu_utilization_pct.is_some() {
            rules.push(PolicyRule::GpuUtilization);
        }
        if self.min_gpu_memory_mb.is_some() {
            rules.push(PolicyRule::GpuMemory);
        }
        rules
    }

    pub fn evaluate(&self, claims: &VerifiedClaims) -> PolicyDecision {
        for rule in self.active_rules() {
            if let Err(reason) = self.check(rule, claims) {
                return PolicyDecision::deny(rule, reason);
            }
        }
        PolicyDecision::allow()
    }

    fn check(&self, rule: PolicyRule, claims: &VerifiedClaims) -> Result<(), String> {
        match rule {
            PolicyRule::HostIntegrity => match claims.host_integrity_status {
                IntegrityStatus::PassedAllChecks => Ok(()),
                IntegrityStatus::Unspecified => {
                    Err("host integrity rule requires an integrity status, none present".to_string())
                }
                other => Err(format!(
                    "host integrity status {:?} is not passed_all_checks",
                    other.as_str()
                )),
            },
            PolicyRule::Geofence => {
                let geo = claims.geolocation.as_ref().ok_or_else(|| {
                    "geofence rule requires a geolocation claim, none present".to_string()
                })?;
                let location = geo
                    .value
                    .as_deref()
                    .map(str::trim)
                    .filter(|v| !v.is_empty())
                    .ok_or_else(|| {
                        format!(
                            "geofence rule requires a location value, sensor {:?} reported none",
                            geo.sensor_id
                        )
                    })?;
                if self.allowed_geolocations.iter().any(|p| p.matches(location)) {
                    Ok(())
                } else {
                    Err(format!("geolocation {location:?} not in allowed list"))
                }
            }
            PolicyRule::GpuHealth => {
                let status = claims
                    .gpu_metrics
                    .as_ref()
                    .and_then(|gpu| gpu.status.as_deref())
                    .ok_or_else(|| "GPU health rule requires GPU status, none present".to_string())?;
                if status.eq_ignore_ascii_case(HEALTHY_GPU_STATUS) {
                    Ok(())
                } else {
                    Err(format!("GPU status {status:?} is not healthy"))
                }
            }
            PolicyRule::GpuUtilization => {
                let utilization = claims
                    .gpu_metrics
                    .as_ref()
                    .and_then(|gpu| gpu.utilization_pct)
                    .ok_or_else(|| {
                        "GPU utilization rule requires utilization, none present".to_string()
                    })?;
                if !utilization.is_finite() {
                    return Err("GPU utilization is not a finite number".to_string());
                }
                if let Some(min) = self.min_gpu_utilization_pct {
                    if utilization < min {
                        return Err(format!("GPU utilization {utilization}% below minimum {min}%"));
                    }
                }
                if let Some(max) = self.max_gpu_utilization_pct {
                    if utilization > max {
                        return Err(format!("GPU utilization {utilization}% above maximum {max}%"));
                    }
                }
                Ok(())
            }
            PolicyRule::GpuMemory => {
                let memory = claims
                    .gpu_metrics
                    .as_ref()
                    .and_then(|gpu| gpu.memory_mb)
                    .ok_or_else(|| "GPU memory rule requires memory size, none present".to_string())?;
                match self.min_gpu_memory_mb {
                    Some(min) if memory < min => {
                        Err(format!("GPU memory {memory}MB below minimum {min}MB"))
                    }
                    _ => Ok(()),
                }
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::claims::{Geolocation, GpuMetrics};
    use proptest::prelude::*;

    fn config(geos: &[&str]) -> PolicyConfig {
        PolicyConfig {
            allowed_geolocations: geos.iter().map(|g| g.to_string()).collect(),
            ..PolicyConfig::default()
        }
    }

    fn claims_at(location: Option<&str>) -> VerifiedClaims {
        VerifiedClaims {
            geolocation: Some(Geolocation {
                kind: "gnss".to_string(),
                sensor_id: "gps-0".to_string(),
                value: location.map(str::to_string),
            }),
            host_integrity_status: IntegrityStatus::PassedAllChecks,
            gpu_metrics: None,
        }
    }

    #[test]
    fn test_allows_listed_location() {
        let engine = PolicyEngine::new(&config(&["US", "EU"])).unwrap();
        let decision = engine.evaluate(&claims_at(Some("US")));
        assert!(decision.allowed);
        assert_eq!(decision.reason, "all policy checks passed");
        assert!(decision.into_result().is_ok());
    }

    #[test]
    fn test_denies_unlisted_location_naming_geofence() {
        let engine = PolicyEngine::new(&config(&["US", "EU"])).unwrap();
        let decision = engine.evaluate(&claims_at(Some("CN")));
        assert!(!decision.allowed);
        assert_eq!(decision.rule, Some(PolicyRule::Geofence));
        assert!(decision.reason.contains("\"CN\""));

        let err = decision.into_result().unwrap_err();
        assert_eq!(err.reason_code(), "policy_denial.geofence");
    }

    #[test]
    fn test_country_wildcards() {
        let engine = PolicyEngine::new(&config(&["Spain: *", "France:*"])).unwrap();
        assert!(engine.evaluate(&claims_at(Some("Spain: Madrid"))).allowed);
        assert!(engine.evaluate(&claims_at(Some("spain"))).allowed);
        assert!(engine.evaluate(&claims_at(Some("France:Paris"))).allowed);
        assert!(!engine.evaluate(&claims_at(Some("Spainland: X"))).allowed);
    }

    #[test]
    fn test_star_matches_any_present_location() {
        let engine = PolicyEngine::new(&config(&["*"])).unwrap();
        assert!(engine.evaluate(&claims_at(Some("Anywhere"))).allowed);
        assert!(!engine.evaluate(&claims_at(None)).allowed);
    }

    #[test]
    fn test_rejects_bad_patterns() {
        assert!(PolicyEngine::new(&config(&["Spain*"])).is_err());
        assert!(PolicyEngine::new(&config(&[": *"])).is_err());
        assert!(PolicyEngine::new(&config(&[" "])).is_err());
    }

    #[test]
    fn test_missing_geolocation_denies() {
        let engine = PolicyEngine::new(&config(&["US"])).unwrap();
        let mut claims = claims_at(Some("US"));
        claims.geolocation = None;
        let decision = engine.evaluate(&claims);
        assert_eq!(decision.rule, Some(PolicyRule::Geofence));
        assert!(decision.reason.contains("none present"));

        assert!(!engine.evaluate(&claims_at(None)).allowed);
        assert!(!engine.evaluate(&claims_at(Some("   "))).allowed);
    }

    #[test]
    fn test_integrity_rule() {
        let engine = PolicyEngine::new(&config(&[])).unwrap();
        let mut claims = claims_at(Some("US"));
        for status in [
            IntegrityStatus::Unspecified,
            IntegrityStatus::Failed,
            IntegrityStatus::Partial,
        ] {
            claims.host_integrity_status = status;
            let decision = engine.evaluate(&claims);
            assert_eq!(decision.rule, Some(PolicyRule::HostIntegrity));
        }

        let relaxed = PolicyEngine::new(&PolicyConfig {
            require_host_integrity: false,
            ..PolicyConfig::default()
        })
        .unwrap();
        assert!(relaxed.evaluate(&claims).allowed);
        assert!(relaxed.active_rules().is_empty());
    }

    #[test]
    fn test_integrity_checked_before_geofence() {
        let engine = PolicyEngine::new(&config(&["US"])).unwrap();
        let mut claims = claims_at(Some("CN"));
        claims.host_integrity_status = IntegrityStatus::Failed;
        assert_eq!(engine.evaluate(&claims).rule, Some(PolicyRule::HostIntegrity));
    }

    #[test]
    fn test_gpu_rules_fail_closed() {
        let engine = PolicyEngine::new(&PolicyConfig {
            require_healthy_gpu: true,
            min_gpu_utilization_pct: Some(10.0),
            max_gpu_utilization_pct: Some(90.0),
            min_gpu_memory_mb: Some(8192),
            ..PolicyConfig::default()
        })
        .unwrap();

        let mut claims = claims_at(Some("US"));
        assert_eq!(engine.evaluate(&claims).rule, Some(PolicyRule::GpuHealth));

        claims.gpu_metrics = Some(GpuMetrics {
            status: Some("healthy".to_string()),
            utilization_pct: None,
            memory_mb: Some(16384),
        });
        assert_eq!(engine.evaluate(&claims).rule, Some(PolicyRule::GpuUtilization));

        claims.gpu_metrics = Some(GpuMetrics {
            status: Some("healthy".to_string()),
            utilization_pct: Some(f64::NAN),
            memory_mb: Some(16384),
        });
        assert_eq!(engine.evaluate(&claims).rule, Some(PolicyRule::GpuUtilization));

        claims.gpu_metrics = Some(GpuMetrics {
            status: Some("healthy".to_string()),
            utilization_pct: Some(50.0),
            memory_mb: Some(4096),
        });
        assert_eq!(engine.evaluate(&claims).rule, Some(PolicyRule::GpuMemory));

        claims.gpu_metrics = Some(GpuMetrics {
            status: Some("healthy".to_string()),
            utilization_pct: Some(50.0),
            memory_mb: Some(16384),
        });
        assert!(engine.evaluate(&claims).allowed);
    }

    #[test]
    fn test_rejects_inverted_bounds() {
        assert!(PolicyEngine::new(&PolicyConfig {
            min_gpu_utilization_pct: Some(60.0),
            max_gpu_utilization_pct: Some(40.0),
            ..PolicyConfig::default()
        })
        .is_err());
    }

    proptest! {
        #[test]
        fn prop_geofence_without_geolocation_always_denies(
            patterns in proptest::collection::vec("[A-Z]{2}", 1..5),
            require_integrity in any::<bool>(),
        ) {
            let engine = PolicyEngine::new(&PolicyConfig {
                allowed_geolocations: patterns,
                require_host_integrity: require_integrity,
                ..PolicyConfig::default()
            }).unwrap();
            let claims = VerifiedClaims {
                geolocation: None,
                host_integrity_status: IntegrityStatus::PassedAllChecks,
                gpu_metrics: None,
            };
            prop_assert!(!engine.evaluate(&claims).allowed);
        }

        #[test]
        fn prop_evaluation_is_deterministic(location in "[A-Za-z: ]{0,12}") {
            let engine = PolicyEngine::new(&config(&["US", "Spain: *"])).unwrap();
            let claims = claims_at(Some(&location));
            prop_assert_eq!(engine.evaluate(&claims), engine.evaluate(&claims));
        }
    }
}
