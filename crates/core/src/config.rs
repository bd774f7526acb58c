//! Configuration management for the identity broker.
//!
//! Every section carries `#[serde(default)]`, so a TOML file only needs the
//! keys an operator wants to override. [`BrokerConfig::validate`] rejects
//! settings that would make the broker fail open or misbehave at runtime.

use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use std::time::Duration;

use crate::error::{CoreError, CoreResult};

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct BrokerConfig {
    pub server: ServerConfig,
    pub nonce: NonceConfig,
    pub verifier: VerifierConfig,
    pub policy: PolicyConfig,
    pub issuance: IssuanceConfig,
    pub datastore: DatastoreConfig,
    pub logging: LoggingConfig,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct ServerConfig {
    pub trust_domain: String,
    /// Enables hardware-evidence attestation. Join tokens are unaffected.
    pub unified_identity_enabled: bool,
    pub allow_join_tokens: bool,
    /// Return human-readable denial detail to callers, not just the reason code.
    pub expose_denial_details: bool,
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            trust_domain: "example.org".to_string(),
            unified_identity_enabled: true,
            allow_join_tokens: true,
            expose_denial_details: false,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct NonceConfig {
    pub ttl_secs: u64,
    pub max_pending: usize,
}

impl Default for NonceConfig {
    fn default() -> Self {
        Self {
            ttl_secs: 60,
            max_pending: 10_000,
        }
    }
}

impl NonceConfig {
    pub fn ttl(&self) -> Duration {
        Duration::from_secs(self.ttl_secs)
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct VerifierConfig {
    /// Base URL of the evidence verifier, e.g. `https://verifier:8881`.
    pub url: Option<String>,
    pub timeout_secs: u64,
    pub max_quote_bytes: usize,
    pub max_certificate_bytes: usize,
}

impl Default for VerifierConfig {
    fn default() -> Self {
        Self {
            url: None,
            timeout_secs: 30,
            max_quote_bytes: 64 * 1024,
            max_certificate_bytes: 16 * 1024,
        }
    }
}

impl VerifierConfig {
    pub fn timeout(&self) -> Duration {
        Duration::from_secs(self.timeout_secs)
    }
}

/// Operator rules applied to verified claims.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct PolicyConfig {
    /// Geofence patterns: `US`, `Spain: *`, `Spain:*` or `*`. Empty disables the rule.
    pub allowed_geolocations: Vec<String>,
    pub require_host_integrity: bool,
    pub require_healthy_gpu: bool,
    pub min_gpu_utilization_pct: Option<f64>,
    pub max_gpu_utilization_pct: Option<f64>,
    pub min_gpu_memory_mb: Option<i64>,
}

impl Default for PolicyConfig {
    fn default() -> Self {
        Self {
            allowed_geolocations: Vec::new(),
            require_host_integrity: true,
            require_healthy_gpu: false,
            min_gpu_utilization_pct: None,
            max_gpu_utilization_pct: None,
            min_gpu_memory_mb: None,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct IssuanceConfig {
    pub agent_svid_ttl_secs: u64,
    pub workload_svid_ttl_secs: u64,
    /// Oldest parent claims a subordinate may inherit without the parent re-attesting.
    pub max_inherited_claims_age_secs: u64,
    pub ca_validity_secs: u64,
}

impl Default for IssuanceConfig {
    fn default() -> Self {
        Self {
            agent_svid_ttl_secs: 3600,
            workload_svid_ttl_secs: 600,
            max_inherited_claims_age_secs: 3600,
            ca_validity_secs: 86_400 * 365,
        }
    }
}

impl IssuanceConfig {
    pub fn agent_svid_ttl(&self) -> Duration {
        Duration::from_secs(self.agent_svid_ttl_secs)
    }

    pub fn workload_svid_ttl(&self) -> Duration {
        Duration::from_secs(self.workload_svid_ttl_secs)
    }

    pub fn max_inherited_claims_age(&self) -> Duration {
        Duration::from_secs(self.max_inherited_claims_age_secs)
    }

    pub fn ca_validity(&self) -> Duration {
        Duration::from_secs(self.ca_validity_secs)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum DatastoreBackend {
    #[default]
    Memory,
    Sqlite,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct DatastoreConfig {
    pub backend: DatastoreBackend,
    pub path: Option<PathBuf>,
    pub timeout_secs: u64,
}

impl Default for DatastoreConfig {
    fn default() -> Self {
        Self {
            backend: DatastoreBackend::Memory,
            path: None,
            timeout_secs: 5,
        }
    }
}

impl DatastoreConfig {
    pub fn timeout(&self) -> Duration {
        Duration::from_secs(self.timeout_secs)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum LogFormat {
    #[default]
    Pretty,
    Json,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct LoggingConfig {
    /// Fallback filter when `RUST_LOG` is unset.
    pub level: String,
    pub format: LogFormat,
}

impl Default for LoggingConfig {
    fn default() -> Self {
        Self {
            level: "info".to_string(),
            format: LogFormat::Pretty,
        }
    }
}

impl BrokerConfig {
    #[cfg(feature = "toml")]
    pub fn from_file<P: AsRef<Path>>(path: P) -> anyhow::Result<Self> {
        let path = path.as_ref();
        let content = std::fs::read_to_string(path).map_err(CoreError::from)?;
        let config = Self::from_toml_str(&content)?;
        tracing::debug!(path = %path.display(), "Loaded broker configuration");
        Ok(config)
    }

    /// Parse and validate a TOML document.
    #[cfg(feature = "toml")]
    pub fn from_toml_str(content: &str) -> anyhow::Result<Self> {
        let config: Self = toml::from_str(content)?;
        config.validate()?;
        Ok(config)
    }

    pub fn validate(&self) -> CoreResult<()> {
        validate_trust_domain(&self.server.trust_domain)?;

        if self.nonce.ttl_secs == 0 {
            return Err(config_err("nonce.ttl_secs must be greater than zero"));
        }
        if self.nonce.max_pending == 0 {
            return Err(config_err("nonce.max_pending must be greater than zero"));
        }

        if let Some(url) = &self.verifier.url {
            if !(url.starts_with("http://") || url.starts_with("https://")) {
                return Err(config_err(format!(
                    "verifier.url must be an http(s) URL, got {url:?}"
                )));
            }
        }
        if self.verifier.timeout_secs == 0 {
            return Err(config_err("verifier.timeout_secs must be greater than zero"));
        }
        if self.verifier.max_quote_bytes == 0 || self.verifier.max_certificate_bytes == 0 {
            return Err(config_err("verifier payload bounds must be greater than zero"));
        }

        self.validate_policy()?;

        if self.issuance.agent_svid_ttl_secs == 0 || self.issuance.workload_svid_ttl_secs == 0 {
            return Err(config_err("issuance TTLs must be greater than zero"));
        }
        if self.issuance.ca_validity_secs < self.issuance.agent_svid_ttl_secs {
            return Err(config_err(
                "issuance.ca_validity_secs must cover at least one agent SVID lifetime",
            ));
        }

        if self.datastore.backend == DatastoreBackend::Sqlite && self.datastore.path.is_none() {
            return Err(config_err("datastore.path is required for the sqlite backend"));
        }
        if self.datastore.timeout_secs == 0 {
            return Err(config_err("datastore.timeout_secs must be greater than zero"));
        }

        if self.logging.level.trim().is_empty() {
            return Err(config_err("logging.level must not be empty"));
        }

        Ok(())
    }

    fn validate_policy(&self) -> CoreResult<()> {
        let policy = &self.policy;
        if policy
            .allowed_geolocations
            .iter()
            .any(|pattern| pattern.trim().is_empty())
        {
            return Err(config_err("policy.allowed_geolocations contains an empty pattern"));
        }

        for (name, bound) in [
            ("min_gpu_utilization_pct", policy.min_gpu_utilization_pct),
            ("max_gpu_utilization_pct", policy.max_gpu_utilization_pct),
        ] {
            if let Some(value) = bound {
                if !value.is_finite() || !(0.0..=100.0).contains(&value) {
                    return Err(config_err(format!(
                        "policy.{name} must be between 0 and 100, got {value}"
                    )));
                }
            }
        }

        if let (Some(min), Some(max)) = (
            policy.min_gpu_utilization_pct,
            policy.max_gpu_utilization_pct,
        ) {
            if min > max {
                return Err(config_err(
                    "policy.min_gpu_utilization_pct exceeds policy.max_gpu_utilization_pct",
                ));
            }
        }

        if matches!(policy.min_gpu_memory_mb, Some(m) if m < 0) {
            return Err(config_err("policy.min_gpu_memory_mb must not be negative"));
        }

        Ok(())
    }
}

fn validate_trust_domain(trust_domain: &str) -> CoreResult<()> {
    let valid = !trust_domain.is_empty()
        && trust_domain.chars().all(|c| {
            c.is_ascii_lowercase() || c.is_ascii_digit() || matches!(c, '.' | '-' | '_')
        });
    if valid {
        Ok(())
    } else {
        Err(config_err(format!(
            "server.trust_domain {trust_domain:?} must be non-empty lowercase [a-z0-9._-]"
        )))
    }
}

fn config_err(message: impl Into<String>) -> CoreError {
    CoreError::Config(message.into())
}
