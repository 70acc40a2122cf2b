pub mod config;
pub mod descriptor;
pub mod disjoint;
pub mod manager;
pub mod pool;
pub mod provider;
pub mod proxy;

use crate::native::UsmKind;
use std::fmt;

pub use descriptor::{PoolDescriptor, PoolId};
pub use disjoint::DisjointPool;
pub use manager::PoolManager;
pub use pool::{
    PoolAllocation, PoolAllocator, PoolCreateDesc, PoolFlags, PoolInfo, PoolInfoValue, UsmAllocDesc,
    UsmPool,
};
pub use provider::{IpcData, MemoryProvider, PeerAccessCache, ProviderContext};
pub use proxy::ProxyPool;

/// Pool flavours. Read-only shared memory is pooled on its own because it is
/// never migrated back from the device.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub enum PoolKind {
    Host,
    Device,
    Shared,
    SharedReadOnly,
}

impl PoolKind {
    pub const ALL: [Self; 4] = [Self::Host, Self::Device, Self::Shared, Self::SharedReadOnly];

    #[must_use]
    pub const fn new(kind: UsmKind, device_read_only: bool) -> Self {
        match kind {
            UsmKind::Host => Self::Host,
            UsmKind::Device => Self::Device,
            UsmKind::Shared if device_read_only => Self::SharedReadOnly,
            UsmKind::Shared => Self::Shared,
        }
    }

    #[must_use]
    pub const fn usm_kind(self) -> UsmKind {
        match self {
            Self::Host => UsmKind::Host,
            Self::Device => UsmKind::Device,
            Self::Shared | Self::SharedReadOnly => UsmKind::Shared,
        }
    }

    #[must_use]
    pub const fn is_read_only(self) -> bool {
        matches!(self, Self::SharedReadOnly)
    }

    #[must_use]
    pub const fn index(self) -> usize {
        self as usize
    }

    /// The memory type name used in pool configuration strings.
    #[must_use]
    pub const fn config_name(self) -> &'static str {
        match self {
            Self::Host => "host",
            Self::Device => "device",
            Self::Shared => "shared",
            Self::SharedReadOnly => "read_only_shared",
        }
    }
}

impl fmt::Display for PoolKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(match self {
            Self::Host => "Host",
            Self::Device => "Device",
            Self::Shared => "Shared",
            Self::SharedReadOnly => "SharedReadOnly",
        })
    }
}
