//! User tiers and per-tier rate limit configuration

use parking_lot::RwLock;
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use tracing::info;

/// Coarse user classification driving rate limit generosity and queue
/// priority.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum UserTier {
    Anonymous,
    Registered,
    Donor,
}

impl UserTier {
    pub fn as_str(&self) -> &'static str {
        match self {
            UserTier::Anonymous => "anonymous",
            UserTier::Registered => "registered",
            UserTier::Donor => "donor",
        }
    }
}

/// Rate limit configuration for a tier.
///
/// Lower `queue_priority` means served first.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TierLimits {
    pub per_minute: u32,
    pub per_hour: u32,
    pub per_day: u32,
    pub queue_priority: u8,
    pub grace_requests: u32,
}

impl TierLimits {
    pub fn anonymous() -> Self {
        Self {
            per_minute: 3,
            per_hour: 60,
            per_day: 100,
            queue_priority: 3,
            grace_requests: 5,
        }
    }

    pub fn registered() -> Self {
        Self {
            per_minute: 5,
            per_hour: 120,
            per_day: 300,
            queue_priority: 2,
            grace_requests: 10,
        }
    }

    pub fn donor() -> Self {
        Self {
            per_minute: 10,
            per_hour: 300,
            per_day: 1000,
            queue_priority: 1,
            grace_requests: 20,
        }
    }
}

/// Per-request identity descriptor.
///
/// Re-derived on every call from the caller's auth flags; never persisted.
/// Anonymous callers are keyed by IP.
#[derive(Debug, Clone)]
pub struct Identity {
    pub subject_id: Option<String>,
    pub ip: String,
    pub tier: UserTier,
}

impl Identity {
    /// Key used for rate limit buckets and grace period tracking.
    pub fn key(&self) -> String {
        match &self.subject_id {
            Some(id) => id.clone(),
            None => format!("ip:{}", self.ip),
        }
    }
}

/// Resolves identities to tiers and effective limits.
///
/// Holds admin-set tier pins and per-identity limit overrides on top of the
/// configured tier defaults.
pub struct TierRegistry {
    anonymous: TierLimits,
    registered: TierLimits,
    donor: TierLimits,
    tier_pins: RwLock<HashMap<String, UserTier>>,
    overrides: RwLock<HashMap<String, TierLimits>>,
}

impl TierRegistry {
    pub fn new(anonymous: TierLimits, registered: TierLimits, donor: TierLimits) -> Self {
        Self {
            anonymous,
            registered,
            donor,
            tier_pins: RwLock::new(HashMap::new()),
            overrides: RwLock::new(HashMap::new()),
        }
    }

    /// Build an identity from the caller's auth flags, honoring any explicit
    /// tier pin for the subject.
    pub fn identify(
        &self,
        subject_id: Option<&str>,
        ip: &str,
        authenticated: bool,
        donor: bool,
    ) -> Identity {
        let pinned = subject_id.and_then(|id| self.tier_pins.read().get(id).copied());
        let tier = pinned.unwrap_or(if donor {
            UserTier::Donor
        } else if authenticated {
            UserTier::Registered
        } else {
            UserTier::Anonymous
        });

        Identity {
            subject_id: subject_id.map(String::from),
            ip: ip.to_string(),
            tier,
        }
    }

    /// Pin a subject to an explicit tier, overriding flag-based derivation.
    pub fn set_tier(&self, subject_id: &str, tier: UserTier) {
        self.tier_pins.write().insert(subject_id.to_string(), tier);
        info!(subject = %subject_id, tier = tier.as_str(), "Pinned subject tier");
    }

    /// Set custom limits for a specific subject.
    pub fn set_custom_limits(&self, subject_id: &str, limits: TierLimits) {
        self.overrides.write().insert(subject_id.to_string(), limits);
        info!(subject = %subject_id, "Set custom rate limits");
    }

    pub fn limits_for(&self, tier: UserTier) -> TierLimits {
        match tier {
            UserTier::Anonymous => self.anonymous.clone(),
            UserTier::Registered => self.registered.clone(),
            UserTier::Donor => self.donor.clone(),
        }
    }

    /// Effective limits for an identity: subject override if present,
    /// otherwise the tier default.
    pub fn effective_limits(&self, identity: &Identity) -> TierLimits {
        if let Some(id) = &identity.subject_id {
            if let Some(limits) = self.overrides.read().get(id) {
                return limits.clone();
            }
        }
        self.limits_for(identity.tier)
    }
}

impl Default for TierRegistry {
    fn default() -> Self {
        Self::new(
            TierLimits::anonymous(),
            TierLimits::registered(),
            TierLimits::donor(),
        )
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn tier_derivation_from_flags() {
        let registry = TierRegistry::default();
        assert_eq!(
            registry.identify(None, "10.0.0.1", false, false).tier,
            UserTier::Anonymous
        );
        assert_eq!(
            registry.identify(Some("u1"), "10.0.0.1", true, false).tier,
            UserTier::Registered
        );
        assert_eq!(
            registry.identify(Some("u2"), "10.0.0.1", true, true).tier,
            UserTier::Donor
        );
    }

    #[test]
    fn pinned_tier_wins_over_flags() {
        let registry = TierRegistry::default();
        registry.set_tier("u1", UserTier::Donor);
        assert_eq!(
            registry.identify(Some("u1"), "10.0.0.1", false, false).tier,
            UserTier::Donor
        );
    }

    #[test]
    fn anonymous_identity_keys_by_ip() {
        let registry = TierRegistry::default();
        let identity = registry.identify(None, "10.0.0.9", false, false);
        assert_eq!(identity.key(), "ip:10.0.0.9");

        let identity = registry.identify(Some("u1"), "10.0.0.9", true, false);
        assert_eq!(identity.key(), "u1");
    }

    #[test]
    fn custom_limits_override_tier_defaults() {
        let registry = TierRegistry::default();
        let custom = TierLimits {
            per_minute: 100,
            ..TierLimits::anonymous()
        };
        registry.set_custom_limits("u1", custom);

        let identity = registry.identify(Some("u1"), "10.0.0.1", true, false);
        assert_eq!(registry.effective_limits(&identity).per_minute, 100);

        let other = registry.identify(Some("u2"), "10.0.0.1", true, false);
        assert_eq!(
            registry.effective_limits(&other).per_minute,
            TierLimits::registered().per_minute
        );
    }
}
