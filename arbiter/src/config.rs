use crate::{
    tiebreak::{Lexicographic, TieBreak},
    token::{LeaseToken, NameGenerator, UuidNames},
    Error, ResourceId, Result,
};
use serde::{Deserialize, Serialize};
use std::{fmt, path::Path, sync::Arc};
use tokio::time::Duration;

/// Upper bound for every millisecond setting: one week.
pub const MAX_INTERVAL_MS: u64 = 7 * 24 * 60 * 60 * 1_000;

/// Tunables of one arbiter instance. Durations are in milliseconds so the
/// struct maps one-to-one onto a JSON config file.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct ArbiterConfig {
    pub resource_id: ResourceId,
    /// Shared prefix of every candidate token name.
    pub name_prefix: String,
    /// How often an unowned instance looks for a chance to claim.
    pub poll_interval_ms: u64,
    /// Wait between creating a candidate and checking whether it won. Must
    /// exceed the store's write-propagation delay.
    pub settle_delay_ms: u64,
    pub renewal_interval_ms: u64,
    /// How far past "now" each renewal pushes the owner's token.
    pub lease_extension_ms: u64,
    /// Lifetime of a fresh candidate. Defaults to twice the settle delay.
    pub claim_ttl_ms: Option<u64>,
    /// Fraction by which every timer interval is randomized, in `[0, 1)`.
    pub jitter: f64,
    /// Skip creating a candidate while any live token is visible.
    pub defer_to_live_tokens: bool,
    /// Re-list before each renewal and step down if no longer the winner.
    pub verify_on_renew: bool,
}

impl Default for ArbiterConfig {
    fn default() -> Self {
        Self {
            resource_id: ResourceId::default(),
            name_prefix: "baton-".to_string(),
            poll_interval_ms: 1_000,
            settle_delay_ms: 500,
            renewal_interval_ms: 2_000,
            lease_extension_ms: 5_000,
            claim_ttl_ms: None,
            jitter: 0.0,
            defer_to_live_tokens: true,
            verify_on_renew: true,
        }
    }
}

impl ArbiterConfig {
    pub fn new(resource_id: impl Into<ResourceId>) -> Self {
        Self {
            resource_id: resource_id.into(),
            ..Self::default()
        }
    }

    pub fn from_json_file(path: impl AsRef<Path>) -> Result<Self> {
        let raw = std::fs::read_to_string(path)?;
        Self::from_json(&raw)
    }

    pub fn from_json(raw: &str) -> Result<Self> {
        let config: Self = serde_json::from_str(raw)?;
        config.validate()?;
        Ok(config)
    }

    pub fn poll_interval(&self) -> Duration {
        Duration::from_millis(self.poll_interval_ms)
    }

    pub fn settle_delay(&self) -> Duration {
        Duration::from_millis(self.settle_delay_ms)
    }

    pub fn renewal_interval(&self) -> Duration {
        Duration::from_millis(self.renewal_interval_ms)
    }

    pub fn lease_extension(&self) -> Duration {
        Duration::from_millis(self.lease_extension_ms)
    }

    pub fn claim_ttl(&self) -> Duration {
        Duration::from_millis(self.claim_ttl_ms.unwrap_or(self.settle_delay_ms.saturating_mul(2)))
    }

    /// Rejects settings under which the protocol cannot hold a lease.
    pub fn validate(&self) -> Result<()> {
        if self.resource_id.is_empty() {
            return Err(Error::invalid_config("resource_id must not be empty"));
        }
        if self.poll_interval_ms == 0 || self.settle_delay_ms == 0 || self.renewal_interval_ms == 0 {
            return Err(Error::invalid_config("timer intervals must be positive"));
        }
        let settings = [
            ("poll_interval_ms", self.poll_interval_ms),
            ("settle_delay_ms", self.settle_delay_ms),
            ("renewal_interval_ms", self.renewal_interval_ms),
            ("lease_extension_ms", self.lease_extension_ms),
            ("claim_ttl_ms", self.claim_ttl_ms.unwrap_or(0)),
        ];
        if let Some((field, value)) = settings.iter().find(|(_, value)| *value > MAX_INTERVAL_MS) {
            return Err(Error::invalid_config(format!(
                "{field} ({value}ms) exceeds the {MAX_INTERVAL_MS}ms limit"
            )));
        }
        if !(0.0..1.0).contains(&self.jitter) {
            return Err(Error::invalid_config(format!(
                "jitter must be in [0, 1), got {}",
                self.jitter
            )));
        }
        if self.claim_ttl() <= self.settle_delay() {
            return Err(Error::invalid_config(format!(
                "claim_ttl ({}ms) must exceed settle_delay ({}ms)",
                self.claim_ttl().as_millis(),
                self.settle_delay_ms
            )));
        }
        // The slowest jittered renewal must still land before the lease runs out.
        let slowest_renewal = self.renewal_interval().mul_f64(1.0 + self.jitter);
        if slowest_renewal >= self.lease_extension() {
            return Err(Error::invalid_config(format!(
                "renewal_interval ({}ms, jitter {}) must stay below lease_extension ({}ms)",
                self.renewal_interval_ms, self.jitter, self.lease_extension_ms
            )));
        }
        Ok(())
    }
}

/// Callback fired with the token that was gained or lost.
pub type OwnershipCallback = Arc<dyn Fn(&LeaseToken) + Send + Sync>;

/// Behavior plugged into an arbiter: naming, tie-break and ownership callbacks.
#[derive(Clone)]
pub struct Hooks {
    pub name_generator: Arc<dyn NameGenerator>,
    pub tie_break: Arc<dyn TieBreak>,
    pub on_gained_ownership: Option<OwnershipCallback>,
    pub on_lost_ownership: Option<OwnershipCallback>,
}

impl Default for Hooks {
    fn default() -> Self {
        Self {
            name_generator: Arc::new(UuidNames),
            tie_break: Arc::new(Lexicographic),
            on_gained_ownership: None,
            on_lost_ownership: None,
        }
    }
}

impl Hooks {
    #[must_use]
    pub fn name_generator(mut self, generator: impl NameGenerator + 'static) -> Self {
        self.name_generator = Arc::new(generator);
        self
    }

    #[must_use]
    pub fn tie_break(mut self, tie_break: impl TieBreak + 'static) -> Self {
        self.tie_break = Arc::new(tie_break);
        self
    }

    #[must_use]
    pub fn on_gained(mut self, callback: impl Fn(&LeaseToken) + Send + Sync + 'static) -> Self {
        self.on_gained_ownership = Some(Arc::new(callback));
        self
    }

    #[must_use]
    pub fn on_lost(mut self, callback: impl Fn(&LeaseToken) + Send + Sync + 'static) -> Self {
        self.on_lost_ownership = Some(Arc::new(callback));
        self
    }
}

impl fmt::Debug for Hooks {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Hooks")
            .field("on_gained_ownership", &self.on_gained_ownership.is_some())
            .field("on_lost_ownership", &self.on_lost_ownership.is_some())
            .finish_non_exhaustive()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_defaults_are_valid() {
        let config = ArbiterConfig::new("fishtank");
        config.validate().unwrap();
        assert_eq!(config.claim_ttl(), Duration::from_millis(1_000));
    }

    #[test]
    fn test_empty_resource_rejected() {
        let result = ArbiterConfig::default().validate();
        assert!(matches!(result, Err(Error::InvalidConfig(_))));
    }

    #[test]
    fn test_renewal_must_beat_extension() {
        let config = ArbiterConfig {
            renewal_interval_ms: 5_000,
            lease_extension_ms: 5_000,
            ..ArbiterConfig::new("fishtank")
        };
        assert!(config.validate().is_err());

        // Jitter can push an otherwise valid renewal past the extension
        let config = ArbiterConfig {
            renewal_interval_ms: 4_500,
            jitter: 0.2,
            ..ArbiterConfig::new("fishtank")
        };
        assert!(config.validate().is_err());
    }

    #[test]
    fn test_jitter_range() {
        for jitter in [-0.1, 1.0, 2.5] {
            let config = ArbiterConfig {
                jitter,
                ..ArbiterConfig::new("fishtank")
            };
            assert!(config.validate().is_err(), "jitter {jitter} accepted");
        }
    }

    #[test]
    fn test_claim_ttl_must_cover_settle() {
        let config = ArbiterConfig {
            claim_ttl_ms: Some(500),
            ..ArbiterConfig::new("fishtank")
        };
        assert!(config.validate().is_err());
    }

    #[test]
    fn test_oversized_settings_rejected() {
        let result = ArbiterConfig::from_json(
            r#"{ "resource_id": "x", "settle_delay_ms": 18446744073709551615 }"#,
        );
        assert!(matches!(result, Err(Error::InvalidConfig(_))));

        for config in [
            ArbiterConfig {
                lease_extension_ms: u64::MAX,
                ..ArbiterConfig::new("fishtank")
            },
            ArbiterConfig {
                renewal_interval_ms: u64::MAX,
                ..ArbiterConfig::new("fishtank")
            },
            ArbiterConfig {
                claim_ttl_ms: Some(u64::MAX),
                ..ArbiterConfig::new("fishtank")
            },
        ] {
            assert!(matches!(config.validate(), Err(Error::InvalidConfig(_))));
        }
    }

    #[test]
    fn test_from_json_fills_defaults() {
        let config = ArbiterConfig::from_json(
            r#"{ "resource_id": "io.highfidelity.fishtank", "poll_interval_ms": 250 }"#,
        )
        .unwrap();

        assert_eq!(config.resource_id.as_str(), "io.highfidelity.fishtank");
        assert_eq!(config.poll_interval(), Duration::from_millis(250));
        assert_eq!(config.settle_delay_ms, 500);
        assert!(config.verify_on_renew);
    }

    #[test]
    fn test_from_json_validates() {
        let result = ArbiterConfig::from_json(r#"{ "poll_interval_ms": 250 }"#);
        assert!(matches!(result, Err(Error::InvalidConfig(_))));

        let result = ArbiterConfig::from_json("{ not json");
        assert!(matches!(result, Err(Error::Json(_))));
    }
}
