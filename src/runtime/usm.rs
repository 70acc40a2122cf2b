//! Public USM entry points.
//!
//! With indirect access tracking enabled every allocation is recorded in its
//! context and holds a reference on it. Frees are then deferred until the
//! last reference to the allocation is dropped, and the final free may tear
//! the context down. Those paths take the platform registry lock before the
//! context lock.

use super::context::Context;
use super::device::Device;
use super::tracker::{AllocationRecord, TrackerRelease};
use crate::error::{UsmError, UsmResult};
use crate::native::{DeviceHandle, UsmKind};
use crate::usm::{PoolCreateDesc, PoolId, PoolInfo, PoolInfoValue, UsmAllocDesc, UsmPool};
use std::sync::Arc;

// ===============================================================================================
// Allocation
// ===============================================================================================

fn resolve_pool(context: &Context, pool: Option<&Arc<UsmPool>>) -> UsmResult<Arc<UsmPool>> {
    let Some(pool) = pool else {
        return context.default_pool();
    };
    if pool.context() != context.handle() {
        return Err(UsmError::InvalidContext);
    }
    // A released pool no longer belongs to the context.
    context.pool(pool.id()).ok_or(UsmError::InvalidValue)
}

/// Allocates through `pool`, or the context's default pool.
///
/// # Errors
/// See [`UsmPool::allocate`]. `InvalidContext` for a pool of another context.
pub fn usm_alloc(
    context: &Context,
    kind: UsmKind,
    device: Option<&Arc<Device>>,
    desc: &UsmAllocDesc,
    pool: Option<&Arc<UsmPool>>,
    size: usize,
) -> UsmResult<usize> {
    let pool = resolve_pool(context, pool)?;

    if !context.config().indirect_access_tracking {
        return pool.allocate(kind, device, desc, size);
    }

    let platform = context.platform()?;
    let _registry = platform.lock_contexts();
    let mut state = context.state().write();

    let ptr = pool.allocate(kind, device, desc, size)?;
    state.tracker.insert(AllocationRecord::new(
        ptr,
        kind,
        device.map(|d| d.handle()),
        pool.id(),
        size,
    ));
    context.retain();
    Ok(ptr)
}

/// # Errors
/// See [`usm_alloc`].
pub fn usm_host_alloc(
    context: &Context,
    desc: &UsmAllocDesc,
    pool: Option<&Arc<UsmPool>>,
    size: usize,
) -> UsmResult<usize> {
    usm_alloc(context, UsmKind::Host, None, desc, pool, size)
}

/// # Errors
/// See [`usm_alloc`].
pub fn usm_device_alloc(
    context: &Context,
    device: &Arc<Device>,
    desc: &UsmAllocDesc,
    pool: Option<&Arc<UsmPool>>,
    size: usize,
) -> UsmResult<usize> {
    usm_alloc(context, UsmKind::Device, Some(device), desc, pool, size)
}

/// # Errors
/// See [`usm_alloc`].
pub fn usm_shared_alloc(
    context: &Context,
    device: &Arc<Device>,
    desc: &UsmAllocDesc,
    pool: Option<&Arc<UsmPool>>,
    size: usize,
) -> UsmResult<usize> {
    usm_alloc(context, UsmKind::Shared, Some(device), desc, pool, size)
}

/// Frees `ptr`, or drops one reference to it while tracking is enabled.
///
/// # Errors
/// * `InvalidMemObject` if `ptr` is not the start of an allocation from a
///   pool of `context`.
/// * Provider errors, or the driver error destroying the context when the
///   last tracked allocation releases it.
///
/// # Panics
/// Panics if tracking is enabled and a pooled pointer has no allocation record.
pub fn usm_free(context: &Context, ptr: usize) -> UsmResult<()> {
    if !context.config().indirect_access_tracking {
        let pool = context
            .state()
            .read()
            .pool_owning(ptr)
            .ok_or(UsmError::InvalidMemObject(ptr))?;
        return pool.free(ptr);
    }

    let platform = context.platform()?;
    let mut registry = platform.lock_contexts();
    let mut state = context.state().write();

    let (pool, allocation) = state
        .find_allocation(ptr)
        .ok_or(UsmError::InvalidMemObject(ptr))?;
    // Interior pointers are not allocations.
    if allocation.base != ptr {
        return Err(UsmError::InvalidMemObject(ptr));
    }
    match state.tracker.release(ptr) {
        Some(TrackerRelease::Deferred { remaining }) => {
            tracing::trace!(ptr = format_args!("0x{ptr:x}"), remaining, "free deferred");
            return Ok(());
        }
        Some(TrackerRelease::Last(_)) => {}
        None => panic!("All memory allocations must be tracked!"),
    }

    pool.free(ptr)?;
    drop(state);
    drop(pool);
    context.release_locked(&mut registry)
}

// ===============================================================================================
// Queries
// ===============================================================================================

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AllocInfoQuery {
    Type,
    BasePtr,
    Size,
    Device,
    Pool,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AllocInfoValue {
    Type(UsmKind),
    BasePtr(usize),
    Size(usize),
    Device(Option<DeviceHandle>),
    Pool(PoolId),
}

/// Everything known about a live allocation.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct AllocProperties {
    pub kind: UsmKind,
    pub base: usize,
    pub size: usize,
    /// The device the owning allocator is bound to, `None` for host memory.
    pub device: Option<DeviceHandle>,
    pub pool: PoolId,
}

/// # Errors
/// `InvalidValue` for pointers that are not inside a live allocation.
pub fn usm_get_alloc_properties(context: &Context, ptr: usize) -> UsmResult<AllocProperties> {
    let (pool, allocation) = context
        .state()
        .read()
        .find_allocation(ptr)
        .ok_or(UsmError::InvalidValue)?;
    let provider = allocation.allocator.provider();

    Ok(AllocProperties {
        kind: provider.kind().usm_kind(),
        base: allocation.base,
        size: allocation.size,
        device: provider.device().map(|d| d.handle()),
        pool: pool.id(),
    })
}

/// # Errors
/// `InvalidValue` for pointers that are not inside a live allocation.
pub fn usm_get_mem_alloc_info(
    context: &Context,
    ptr: usize,
    query: AllocInfoQuery,
) -> UsmResult<AllocInfoValue> {
    let properties = usm_get_alloc_properties(context, ptr)?;
    Ok(match query {
        AllocInfoQuery::Type => AllocInfoValue::Type(properties.kind),
        AllocInfoQuery::BasePtr => AllocInfoValue::BasePtr(properties.base),
        AllocInfoQuery::Size => AllocInfoValue::Size(properties.size),
        AllocInfoQuery::Device => AllocInfoValue::Device(properties.device),
        AllocInfoQuery::Pool => AllocInfoValue::Pool(properties.pool),
    })
}

// ===============================================================================================
// Pools and Contexts
// ===============================================================================================

/// # Errors
/// Returns the error building the pool.
pub fn usm_pool_create(context: &Context, desc: &PoolCreateDesc) -> UsmResult<Arc<UsmPool>> {
    context.create_pool(desc)
}

/// Returns the new reference count.
pub fn usm_pool_retain(pool: &UsmPool) -> u32 {
    pool.retain()
}

/// Drops one reference. At zero the pool leaves its context and is destroyed
/// once the last handle goes away.
///
/// # Errors
/// * `InvalidContext` if `pool` does not belong to `context`.
/// * `InvalidValue` if `pool` was already released.
pub fn usm_pool_release(context: &Context, pool: &UsmPool) -> UsmResult<()> {
    if pool.context() != context.handle() {
        return Err(UsmError::InvalidContext);
    }
    if pool.release()? == 0 {
        context.remove_pool(pool.id());
        tracing::debug!(pool = pool.id().raw(), "pool released");
    }
    Ok(())
}

#[must_use]
pub fn usm_pool_get_info(pool: &UsmPool, query: PoolInfo) -> PoolInfoValue {
    pool.info(query)
}

/// Returns the new reference count.
pub fn context_retain(context: &Context) -> u32 {
    context.retain()
}

/// # Errors
/// See [`Context::release`].
pub fn context_release(context: &Context) -> UsmResult<()> {
    context.release()
}
