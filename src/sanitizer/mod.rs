//! Sanitizer support for USM allocations.
//!
//! Every allocation made through the [`interceptor::SanitizerInterceptor`] is
//! padded with redzones. One shadow byte describes eight application bytes:
//! zero means all eight are addressable, `1..=7` means only the first `n`
//! are, and the magic values below mark redzones and freed memory.
//!
//! The [`msan::MsanInterceptor`] tracks initialisation instead. One shadow
//! byte covers two application bytes and is [`MSAN_UNINITIALIZED_MAGIC`]
//! until the memory is written.

pub mod interceptor;
pub mod msan;
pub mod quarantine;
pub mod shadow;

use crate::native::UsmKind;
use crate::utils::MIB;

pub use interceptor::{AllocInfo, SanitizerInterceptor, SanitizerStats};
pub use msan::{HeapType, MsanAllocInfo, MsanInterceptor, MsanOptions, Origin};
pub use quarantine::Quarantine;
pub use shadow::{DeviceShadow, HostShadow, ShadowKind, ShadowMemory, ShadowRegistry};

pub const SHADOW_SCALE: u32 = 3;
pub const SHADOW_GRANULARITY: usize = 1 << SHADOW_SCALE;

pub const MSAN_SHADOW_SCALE: u32 = 1;
/// Smallest alignment of a memory-sanitized allocation.
pub const MSAN_ORIGIN_GRANULARITY: usize = 4;
pub const MSAN_UNINITIALIZED_MAGIC: u8 = 0xff;

pub const USM_DEVICE_REDZONE_MAGIC: u8 = 0x81;
pub const USM_HOST_REDZONE_MAGIC: u8 = 0x82;
pub const USM_SHARED_REDZONE_MAGIC: u8 = 0x83;
pub const USM_DEVICE_DEALLOCATED_MAGIC: u8 = 0x91;
pub const USM_HOST_DEALLOCATED_MAGIC: u8 = 0x92;
pub const USM_SHARED_DEALLOCATED_MAGIC: u8 = 0x93;
pub const NULL_POINTER_REDZONE_MAGIC: u8 = 0x86;

pub const ENV_REDZONE: &str = "USM_SANITIZER_REDZONE";
pub const ENV_MAX_REDZONE: &str = "USM_SANITIZER_MAX_REDZONE";
pub const ENV_QUARANTINE_SIZE_MB: &str = "USM_SANITIZER_QUARANTINE_SIZE_MB";
pub const ENV_POISON_ON_FREE: &str = "USM_SANITIZER_POISON_ON_FREE";
pub const ENV_MSAN_CHECK_HOST_AND_SHARED: &str = "USM_SANITIZER_MSAN_CHECK_HOST_AND_SHARED_USM";

pub const MIN_REDZONE_SIZE: usize = 16;
pub const MAX_REDZONE_SIZE: usize = 2048;

#[must_use]
pub const fn redzone_magic(kind: UsmKind) -> u8 {
    match kind {
        UsmKind::Device => USM_DEVICE_REDZONE_MAGIC,
        UsmKind::Host => USM_HOST_REDZONE_MAGIC,
        UsmKind::Shared => USM_SHARED_REDZONE_MAGIC,
    }
}

#[must_use]
pub const fn deallocated_magic(kind: UsmKind) -> u8 {
    match kind {
        UsmKind::Device => USM_DEVICE_DEALLOCATED_MAGIC,
        UsmKind::Host => USM_HOST_DEALLOCATED_MAGIC,
        UsmKind::Shared => USM_SHARED_DEALLOCATED_MAGIC,
    }
}

const fn redzone_log(size: usize) -> u32 {
    let size = if size < MIN_REDZONE_SIZE { MIN_REDZONE_SIZE } else { size };
    size.ilog2() - 4
}

/// Redzone placed on each side of a `size` byte allocation. Grows with the
/// allocation and is clamped to `[min_redzone, max_redzone]`.
#[must_use]
pub const fn compute_redzone_size(size: usize, min_redzone: usize, max_redzone: usize) -> usize {
    let log = if size <= 64 - 16 {
        0
    } else if size <= 128 - 32 {
        1
    } else if size <= 512 - 64 {
        2
    } else if size <= 4096 - 128 {
        3
    } else if size <= (1 << 14) - 256 {
        4
    } else if size <= (1 << 15) - 512 {
        5
    } else if size <= (1 << 16) - 1024 {
        6
    } else {
        7
    };

    let min_log = redzone_log(min_redzone);
    let max_log = redzone_log(max_redzone);
    let log = if log < min_log { min_log } else { log };
    let log = if log > max_log { max_log } else { log };
    MIN_REDZONE_SIZE << log
}

/// Sanitizer tunables.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct SanitizerOptions {
    pub min_redzone: usize,
    pub max_redzone: usize,
    /// Bytes of freed memory held back per device. Zero frees immediately.
    pub quarantine_size: usize,
    /// Mark freed memory with the deallocated magic.
    pub poison_on_free: bool,
}

impl Default for SanitizerOptions {
    fn default() -> Self {
        Self {
            min_redzone: MIN_REDZONE_SIZE,
            max_redzone: MAX_REDZONE_SIZE,
            quarantine_size: 0,
            poison_on_free: true,
        }
    }
}

impl SanitizerOptions {
    #[must_use]
    pub fn from_env() -> Self {
        Self::from_lookup(|name| std::env::var(name).ok())
    }

    /// Redzone sizes are rounded to powers of two within
    /// [`MIN_REDZONE_SIZE`]`..=`[`MAX_REDZONE_SIZE`].
    pub fn from_lookup<F>(lookup: F) -> Self
    where
        F: Fn(&str) -> Option<String>,
    {
        let parse = |name: &str| {
            let value = lookup(name)?;
            let parsed = value.trim().parse::<usize>().ok();
            if parsed.is_none() {
                tracing::warn!(%value, "ignoring malformed {name}");
            }
            parsed
        };
        let clamp = |size: usize| {
            size.clamp(MIN_REDZONE_SIZE, MAX_REDZONE_SIZE)
                .next_power_of_two()
        };

        let mut options = Self::default();
        if let Some(size) = parse(ENV_REDZONE) {
            options.min_redzone = clamp(size);
        }
        if let Some(size) = parse(ENV_MAX_REDZONE) {
            options.max_redzone = clamp(size);
        }
        if options.max_redzone < options.min_redzone {
            tracing::warn!(
                min = options.min_redzone,
                max = options.max_redzone,
                "maximum redzone below minimum, raising it"
            );
            options.max_redzone = options.min_redzone;
        }
        if let Some(megabytes) = parse(ENV_QUARANTINE_SIZE_MB) {
            options.quarantine_size = megabytes.saturating_mul(MIB);
        }
        if let Some(value) = lookup(ENV_POISON_ON_FREE) {
            options.poison_on_free = value.trim() != "0";
        }
        options
    }
}
