//! Process-level tunables, read once and passed down explicitly.

use crate::native::UsmKind;
use crate::usm::config::DisjointPoolConfigs;
use crate::utils::{KIB, parse_int_auto_radix};

pub const ENV_TRACK_INDIRECT_ACCESS: &str = "USM_TRACK_INDIRECT_ACCESS";
pub const ENV_DISABLE_ALLOCATOR: &str = "USM_DISABLE_ALLOCATOR";
pub const ENV_FORCE_RESIDENCY: &str = "USM_FORCE_RESIDENCY";
pub const ENV_POOL_CONFIG: &str = "USM_POOL_CONFIG";
pub const ENV_POOL_TRACE: &str = "USM_POOL_TRACE";

/// Device allocations are made resident on peers by default.
pub const DEFAULT_FORCE_RESIDENCY: u32 = 0x2;

pub const DEFAULT_ALIGNMENT_CEILING: usize = 64 * KIB;

/// Where freshly allocated memory is made resident.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum ForceResidency {
    #[default]
    None,
    /// The owning device only.
    Device,
    /// The owning device and every device with peer access to it.
    PeerDevices,
}

impl ForceResidency {
    #[must_use]
    pub const fn from_nibble(bits: u32) -> Self {
        match bits & 0xF {
            1 => Self::Device,
            2 => Self::PeerDevices,
            _ => Self::None,
        }
    }
}

/// Residency policy per allocation kind, encoded as `0xHSD`.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ResidencyPolicy {
    pub host: ForceResidency,
    pub shared: ForceResidency,
    pub device: ForceResidency,
}

impl ResidencyPolicy {
    #[must_use]
    pub const fn from_bits(bits: u32) -> Self {
        Self {
            host: ForceResidency::from_nibble(bits >> 8),
            shared: ForceResidency::from_nibble(bits >> 4),
            device: ForceResidency::from_nibble(bits),
        }
    }

    #[must_use]
    pub const fn none() -> Self {
        Self::from_bits(0)
    }

    #[must_use]
    pub const fn for_kind(&self, kind: UsmKind) -> ForceResidency {
        match kind {
            UsmKind::Host => self.host,
            UsmKind::Shared => self.shared,
            UsmKind::Device => self.device,
        }
    }
}

impl Default for ResidencyPolicy {
    fn default() -> Self {
        Self::from_bits(DEFAULT_FORCE_RESIDENCY)
    }
}

/// Immutable runtime configuration.
///
/// Built once by [`RuntimeConfig::from_env`] (or a custom lookup in tests) and
/// shared by every platform, context and pool created from it.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RuntimeConfig {
    /// Reference-count allocations so frees are deferred while kernels may
    /// still reach them indirectly.
    pub indirect_access_tracking: bool,
    /// When `false` every pool is a pass-through to its provider.
    pub use_usm_allocator: bool,
    pub residency: ResidencyPolicy,
    pub pool_trace: u32,
    /// Disjoint pool configuration string, see [`DisjointPoolConfigs::parse`].
    pub pool_config: Option<String>,
    /// Largest alignment a USM allocation may request.
    pub alignment_ceiling: usize,
}

impl Default for RuntimeConfig {
    fn default() -> Self {
        Self {
            indirect_access_tracking: false,
            use_usm_allocator: true,
            residency: ResidencyPolicy::default(),
            pool_trace: 0,
            pool_config: None,
            alignment_ceiling: DEFAULT_ALIGNMENT_CEILING,
        }
    }
}

impl RuntimeConfig {
    #[must_use]
    pub fn from_env() -> Self {
        Self::from_lookup(|name| std::env::var(name).ok())
    }

    /// Builds the configuration from an arbitrary variable lookup.
    pub fn from_lookup<F>(lookup: F) -> Self
    where
        F: Fn(&str) -> Option<String>,
    {
        let mut config = Self::default();

        if let Some(value) = lookup(ENV_TRACK_INDIRECT_ACCESS) {
            config.indirect_access_tracking = value.trim() == "1";
        }

        if lookup(ENV_DISABLE_ALLOCATOR).is_some() {
            config.use_usm_allocator = false;
        }

        if let Some(value) = lookup(ENV_FORCE_RESIDENCY) {
            match parse_int_auto_radix(&value).and_then(|v| u32::try_from(v).ok()) {
                Some(bits) => config.residency = ResidencyPolicy::from_bits(bits),
                None => tracing::warn!(
                    value = %value,
                    "ignoring malformed {ENV_FORCE_RESIDENCY}"
                ),
            }
        }

        if let Some(value) = lookup(ENV_POOL_TRACE) {
            config.pool_trace = value.trim().parse().unwrap_or(0);
        }

        config.pool_config = lookup(ENV_POOL_CONFIG);
        config
    }

    #[must_use]
    pub const fn with_indirect_access_tracking(mut self, enabled: bool) -> Self {
        self.indirect_access_tracking = enabled;
        self
    }

    #[must_use]
    pub const fn with_usm_allocator(mut self, enabled: bool) -> Self {
        self.use_usm_allocator = enabled;
        self
    }

    #[must_use]
    pub const fn with_residency(mut self, residency: ResidencyPolicy) -> Self {
        self.residency = residency;
        self
    }

    #[must_use]
    pub const fn with_pool_trace(mut self, trace: u32) -> Self {
        self.pool_trace = trace;
        self
    }

    #[must_use]
    pub fn with_pool_config(mut self, config: impl Into<String>) -> Self {
        self.pool_config = Some(config.into());
        self
    }

    /// Disjoint pool settings after applying [`Self::pool_config`].
    #[must_use]
    pub fn disjoint_pool_configs(&self) -> DisjointPoolConfigs {
        let mut configs = self
            .pool_config
            .as_deref()
            .map_or_else(DisjointPoolConfigs::default, DisjointPoolConfigs::parse);
        configs.trace = self.pool_trace;

        if self.pool_trace > 0 {
            configs.trace();
        }
        configs
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashMap;

    fn lookup(vars: &[(&str, &str)]) -> impl Fn(&str) -> Option<String> {
        let vars: HashMap<String, String> = vars
            .iter()
            .map(|(k, v)| ((*k).to_string(), (*v).to_string()))
            .collect();
        move |name| vars.get(name).cloned()
    }

    #[test]
    fn test_defaults() {
        let config = RuntimeConfig::from_lookup(lookup(&[]));
        assert_eq!(config, RuntimeConfig::default());
        assert_eq!(config.residency.device, ForceResidency::PeerDevices);
        assert_eq!(config.residency.host, ForceResidency::None);
        assert_eq!(config.residency.shared, ForceResidency::None);
        assert!(config.use_usm_allocator);
    }

    #[test]
    fn test_residency_nibbles() {
        let policy = ResidencyPolicy::from_bits(0x120);
        assert_eq!(policy.host, ForceResidency::Device);
        assert_eq!(policy.shared, ForceResidency::PeerDevices);
        assert_eq!(policy.device, ForceResidency::None);
        assert_eq!(policy.for_kind(UsmKind::Shared), ForceResidency::PeerDevices);

        // Unknown encodings fall back to no residency.
        assert_eq!(ForceResidency::from_nibble(0x7), ForceResidency::None);
    }

    #[test]
    fn test_from_lookup() {
        let config = RuntimeConfig::from_lookup(lookup(&[
            (ENV_TRACK_INDIRECT_ACCESS, "1"),
            (ENV_DISABLE_ALLOCATOR, ""),
            (ENV_FORCE_RESIDENCY, "0x211"),
            (ENV_POOL_TRACE, "2"),
            (ENV_POOL_CONFIG, "1;32M"),
        ]));

        assert!(config.indirect_access_tracking);
        assert!(!config.use_usm_allocator);
        assert_eq!(config.residency.host, ForceResidency::PeerDevices);
        assert_eq!(config.residency.device, ForceResidency::Device);
        assert_eq!(config.pool_trace, 2);
        assert_eq!(config.pool_config.as_deref(), Some("1;32M"));
    }

    #[test]
    fn test_malformed_residency_keeps_default() {
        let config = RuntimeConfig::from_lookup(lookup(&[(ENV_FORCE_RESIDENCY, "peer")]));
        assert_eq!(config.residency, ResidencyPolicy::default());
    }
}
