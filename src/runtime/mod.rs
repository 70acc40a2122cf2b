//! Platforms, contexts and devices, and the USM calls made against them.

pub mod context;
pub mod device;
pub mod platform;
pub mod tracker;
pub mod usm;

pub use context::Context;
pub use device::Device;
pub use platform::Platform;
pub use tracker::{AllocationRecord, AllocationTracker, TrackerRelease};
pub use usm::{
    AllocInfoQuery, AllocInfoValue, AllocProperties, context_release, context_retain, usm_alloc,
    usm_device_alloc, usm_free, usm_get_alloc_properties, usm_get_mem_alloc_info, usm_host_alloc,
    usm_pool_create, usm_pool_get_info, usm_pool_release, usm_pool_retain, usm_shared_alloc,
};
