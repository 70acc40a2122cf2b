//! Disjoint pool settings and the `USM_POOL_CONFIG` grammar:
//!
//! ```text
//! [EnableBuffers][;[MaxPoolSize][;memtypelimits]...]
//! memtypelimits: [<memtype>:]<limits>
//! memtype:       host|device|shared|read_only_shared
//! limits:        [MaxPoolableSize][,[Capacity][,SlabMinSize]]
//! ```
//!
//! Sizes accept `k`, `m` and `g` suffixes. Limits without a memory type apply
//! to every kind and later entries override earlier ones.

use super::PoolKind;
use crate::error::{UsmError, UsmResult};
use crate::utils::{KIB, MIB, parse_size};

pub const DEFAULT_MAX_POOL_SIZE: usize = 16 * MIB;

/// Largest bucket or slab size a disjoint pool can have.
pub const MAX_POOLABLE_SIZE_LIMIT: usize = 1 << (usize::BITS - 1);

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct DisjointPoolConfig {
    pub name: &'static str,
    /// Smallest bucket. Host uses a cache line, device kinds the compression
    /// granule.
    pub min_bucket_size: usize,
    /// Requests above this go straight to the provider. Zero disables pooling.
    pub max_poolable_size: usize,
    /// Empty slabs retained per bucket.
    pub capacity: usize,
    /// Smallest provider allocation made for a slab.
    pub slab_min_size: usize,
}

impl DisjointPoolConfig {
    #[must_use]
    pub const fn default_for(kind: PoolKind) -> Self {
        match kind {
            PoolKind::Host => Self {
                name: "Host",
                min_bucket_size: 64,
                max_poolable_size: 2 * MIB,
                capacity: 4,
                slab_min_size: 64 * KIB,
            },
            PoolKind::Device => Self {
                name: "Device",
                min_bucket_size: 512,
                max_poolable_size: 4 * MIB,
                capacity: 4,
                slab_min_size: 64 * KIB,
            },
            PoolKind::Shared => Self {
                name: "Shared",
                min_bucket_size: 512,
                max_poolable_size: 0,
                capacity: 0,
                slab_min_size: 2 * MIB,
            },
            PoolKind::SharedReadOnly => Self {
                name: "SharedReadOnly",
                min_bucket_size: 512,
                max_poolable_size: 4 * MIB,
                capacity: 4,
                slab_min_size: 2 * MIB,
            },
        }
    }

    #[must_use]
    pub const fn pooling_enabled(&self) -> bool {
        self.max_poolable_size > 0
    }
}

/// Overrides passed at pool creation. They apply to every kind.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct PoolLimits {
    pub max_poolable_size: usize,
    pub min_driver_alloc_size: usize,
}

impl PoolLimits {
    /// # Errors
    /// `InvalidValue` if either size exceeds [`MAX_POOLABLE_SIZE_LIMIT`].
    pub const fn validate(&self) -> UsmResult<()> {
        if self.max_poolable_size > MAX_POOLABLE_SIZE_LIMIT
            || self.min_driver_alloc_size > MAX_POOLABLE_SIZE_LIMIT
        {
            return Err(UsmError::InvalidValue);
        }
        Ok(())
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DisjointPoolConfigs {
    /// `false` routes every kind through a pass-through pool.
    pub enable_buffers: bool,
    /// Ceiling on empty-slab bytes retained across all kinds of one pool.
    pub max_pool_size: usize,
    pub trace: u32,
    configs: [DisjointPoolConfig; 4],
}

impl Default for DisjointPoolConfigs {
    fn default() -> Self {
        Self {
            enable_buffers: true,
            max_pool_size: DEFAULT_MAX_POOL_SIZE,
            trace: 0,
            configs: PoolKind::ALL.map(DisjointPoolConfig::default_for),
        }
    }
}

impl DisjointPoolConfigs {
    #[must_use]
    pub const fn get(&self, kind: PoolKind) -> &DisjointPoolConfig {
        &self.configs[kind.index()]
    }

    pub fn get_mut(&mut self, kind: PoolKind) -> &mut DisjointPoolConfig {
        &mut self.configs[kind.index()]
    }

    /// Parses a configuration string. A malformed string yields the defaults.
    #[must_use]
    pub fn parse(text: &str) -> Self {
        Self::try_parse(text).unwrap_or_else(|| {
            tracing::warn!(config = text, "malformed USM pool configuration, using defaults");
            Self::default()
        })
    }

    fn try_parse(text: &str) -> Option<Self> {
        let mut configs = Self::default();
        if text.trim().is_empty() {
            return Some(configs);
        }

        let mut fields = text.split(';');

        let enable = fields.next().unwrap_or_default().trim();
        if !enable.is_empty() {
            configs.enable_buffers = enable.parse::<u32>().ok()? != 0;
        }

        if let Some(max_pool_size) = fields.next().map(str::trim) {
            if !max_pool_size.is_empty() {
                configs.max_pool_size = parse_size(max_pool_size)?;
            }
        }

        for entry in fields.map(str::trim).filter(|e| !e.is_empty()) {
            configs.apply_entry(entry)?;
        }

        Some(configs)
    }

    fn apply_entry(&mut self, entry: &str) -> Option<()> {
        let (kinds, limits) = match entry.split_once(':') {
            Some((name, limits)) => {
                let kind = PoolKind::ALL
                    .into_iter()
                    .find(|k| k.config_name() == name.trim())?;
                (vec![kind], limits)
            }
            None => (PoolKind::ALL.to_vec(), entry),
        };

        let values = limits
            .split(',')
            .map(str::trim)
            .map(|v| if v.is_empty() { Some(None) } else { parse_size(v).map(Some) })
            .collect::<Option<Vec<Option<usize>>>>()?;
        if values.len() > 3 {
            return None;
        }

        let value = |i: usize| values.get(i).copied().flatten();
        if [value(0), value(2)]
            .into_iter()
            .flatten()
            .any(|size| size > MAX_POOLABLE_SIZE_LIMIT)
        {
            return None;
        }
        for kind in kinds {
            let config = self.get_mut(kind);
            if let Some(max_poolable_size) = value(0) {
                config.max_poolable_size = max_poolable_size;
            }
            if let Some(capacity) = value(1) {
                config.capacity = capacity;
            }
            if let Some(slab_min_size) = value(2) {
                config.slab_min_size = slab_min_size;
            }
        }
        Some(())
    }

    /// Applies pool-create limits to every kind.
    pub fn apply_limits(&mut self, limits: &PoolLimits) {
        for config in &mut self.configs {
            config.max_poolable_size = limits.max_poolable_size;
            config.slab_min_size = limits.min_driver_alloc_size;
        }
    }

    /// Logs the effective settings as a table.
    pub fn trace(&self) {
        tracing::info!("USM pool settings (built-in or adjusted by environment variable)");
        tracing::info!(
            "{:>15}{:>12}{:>12}{:>12}{:>16}",
            "Parameter",
            "Host",
            "Device",
            "Shared RW",
            "Shared RO"
        );
        let row = |name: &str, field: fn(&DisjointPoolConfig) -> usize| {
            tracing::info!(
                "{:>15}{:>12}{:>12}{:>12}{:>16}",
                name,
                field(self.get(PoolKind::Host)),
                field(self.get(PoolKind::Device)),
                field(self.get(PoolKind::Shared)),
                field(self.get(PoolKind::SharedReadOnly))
            );
        };
        row("SlabMinSize", |c| c.slab_min_size);
        row("MaxPoolableSize", |c| c.max_poolable_size);
        row("Capacity", |c| c.capacity);
        tracing::info!("{:>15}{:>12}", "MaxPoolSize", self.max_pool_size);
        tracing::info!("{:>15}{:>12}", "EnableBuffers", u8::from(self.enable_buffers));
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn assert_defaults(configs: &DisjointPoolConfigs) {
        assert_eq!(configs, &DisjointPoolConfigs::default());
    }

    #[test]
    fn test_defaults() {
        let configs = DisjointPoolConfigs::default();
        assert_eq!(configs.get(PoolKind::Host).max_poolable_size, 2 * MIB);
        assert_eq!(configs.get(PoolKind::Host).min_bucket_size, 64);
        assert_eq!(configs.get(PoolKind::Device).max_poolable_size, 4 * MIB);
        assert_eq!(configs.get(PoolKind::Device).slab_min_size, 64 * KIB);
        assert!(!configs.get(PoolKind::Shared).pooling_enabled());
        assert_eq!(configs.get(PoolKind::Shared).slab_min_size, 2 * MIB);
        assert_eq!(configs.get(PoolKind::SharedReadOnly).capacity, 4);
        assert_eq!(configs.max_pool_size, 16 * MIB);
        assert!(configs.enable_buffers);
    }

    #[test]
    fn test_parse_full_string() {
        let configs = DisjointPoolConfigs::parse(
            "1;32M;host:1M,3,32k;device:1m,2,32m;shared:2m,3,1M;read_only_shared:0,0,3M",
        );

        let host = configs.get(PoolKind::Host);
        assert_eq!((host.max_poolable_size, host.capacity, host.slab_min_size), (MIB, 3, 32 * KIB));

        let device = configs.get(PoolKind::Device);
        assert_eq!((device.max_poolable_size, device.capacity, device.slab_min_size), (MIB, 2, 32 * MIB));

        let shared = configs.get(PoolKind::Shared);
        assert_eq!((shared.max_poolable_size, shared.capacity, shared.slab_min_size), (2 * MIB, 3, MIB));

        let read_only = configs.get(PoolKind::SharedReadOnly);
        assert_eq!((read_only.max_poolable_size, read_only.capacity, read_only.slab_min_size), (0, 0, 3 * MIB));

        assert_eq!(configs.max_pool_size, 32 * MIB);
        assert!(configs.enable_buffers);
    }

    #[test]
    fn test_parse_partial_string() {
        let configs = DisjointPoolConfigs::parse("1;32M;host:1M,2,16k;shared:64k,3,1M;");

        assert_eq!(configs.get(PoolKind::Host).slab_min_size, 16 * KIB);
        assert_eq!(configs.get(PoolKind::Shared).max_poolable_size, 64 * KIB);
        assert_eq!(
            *configs.get(PoolKind::Device),
            DisjointPoolConfig::default_for(PoolKind::Device)
        );
        assert_eq!(
            *configs.get(PoolKind::SharedReadOnly),
            DisjointPoolConfig::default_for(PoolKind::SharedReadOnly)
        );
    }

    #[test]
    fn test_parse_untyped_limits_apply_to_all() {
        let configs = DisjointPoolConfigs::parse("1;;,8;device:2M");
        for kind in PoolKind::ALL {
            assert_eq!(configs.get(kind).capacity, 8);
        }
        assert_eq!(configs.get(PoolKind::Device).max_poolable_size, 2 * MIB);
        assert_eq!(configs.max_pool_size, DEFAULT_MAX_POOL_SIZE);
    }

    #[test]
    fn test_parse_disabled_buffers() {
        let configs = DisjointPoolConfigs::parse("0;32M;host:1M,4,64k;device:1m,4,64K;shared:0,0,2M");
        assert!(!configs.enable_buffers);

        assert!(!DisjointPoolConfigs::parse("0").enable_buffers);
        assert_eq!(DisjointPoolConfigs::parse("1;64M").max_pool_size, 64 * MIB);
    }

    #[test]
    fn test_parse_malformed_strings_keep_defaults() {
        for text in [
            "",
            "ab12cdefghi34jk56lmn78opr910",
            "1;32M;foo:0,3,2m;device:1M,4,64k",
            "132M;host:4m,3,2m,4m;device:1M,4,64k",
            "1;32M;abdc123;;;device:1M,4,64k",
            "1;32M;host:0,3,2m,4;device:1M,4,64k,5;host:1,8,4m,100",
            "32M;1;host:1M,4,64k;device:1m,4,64K;shared:0,3,1M",
        ] {
            assert_defaults(&DisjointPoolConfigs::parse(text));
        }
    }

    #[test]
    fn test_oversized_limits() {
        assert_defaults(&DisjointPoolConfigs::parse("1;;host:18446744073709551615"));
        assert_defaults(&DisjointPoolConfigs::parse("1;;device:1M,4,9223372036854775809"));

        let limits = PoolLimits {
            max_poolable_size: usize::MAX,
            min_driver_alloc_size: 64 * KIB,
        };
        assert!(matches!(limits.validate(), Err(UsmError::InvalidValue)));
        let limits = PoolLimits {
            max_poolable_size: MAX_POOLABLE_SIZE_LIMIT,
            min_driver_alloc_size: usize::MAX,
        };
        assert!(matches!(limits.validate(), Err(UsmError::InvalidValue)));
        let limits = PoolLimits {
            max_poolable_size: MAX_POOLABLE_SIZE_LIMIT,
            min_driver_alloc_size: 64 * KIB,
        };
        assert!(limits.validate().is_ok());
    }

    #[test]
    fn test_apply_limits() {
        let mut configs = DisjointPoolConfigs::default();
        configs.apply_limits(&PoolLimits {
            max_poolable_size: 128 * KIB,
            min_driver_alloc_size: 256 * KIB,
        });
        for kind in PoolKind::ALL {
            assert_eq!(configs.get(kind).max_poolable_size, 128 * KIB);
            assert_eq!(configs.get(kind).slab_min_size, 256 * KIB);
        }
    }
}
