use super::device::{self, Device};
use super::platform::{ContextRegistry, Platform};
use super::tracker::AllocationTracker;
use crate::config::RuntimeConfig;
use crate::error::{UsmError, UsmResult};
use crate::native::{ContextHandle, DeviceHandle, NativeDriver};
use crate::usm::{PeerAccessCache, PoolAllocation, PoolCreateDesc, PoolId, ProviderContext, UsmPool};
use parking_lot::RwLock;
use std::collections::HashMap;
use std::sync::atomic::{AtomicU32, Ordering};
use std::sync::{Arc, Weak};

/// Everything guarded by the context lock.
#[derive(Debug, Default)]
pub(crate) struct ContextState {
    pub(crate) default_pool: Option<Arc<UsmPool>>,
    pub(crate) pools: HashMap<PoolId, Arc<UsmPool>>,
    pub(crate) tracker: AllocationTracker,
}

impl ContextState {
    fn all_pools(&self) -> impl Iterator<Item = &Arc<UsmPool>> {
        self.default_pool.iter().chain(self.pools.values())
    }

    /// The pool and allocation holding `ptr`.
    pub(crate) fn find_allocation(&self, ptr: usize) -> Option<(Arc<UsmPool>, PoolAllocation)> {
        self.all_pools()
            .find_map(|pool| pool.find_allocation(ptr).map(|a| (Arc::clone(pool), a)))
    }

    /// The pool that handed out `ptr`.
    pub(crate) fn pool_owning(&self, ptr: usize) -> Option<Arc<UsmPool>> {
        self.all_pools().find(|pool| pool.owns(ptr)).map(Arc::clone)
    }

    pub(crate) fn pool(&self, id: PoolId) -> Option<Arc<UsmPool>> {
        self.all_pools().find(|pool| pool.id() == id).map(Arc::clone)
    }
}

/// A set of devices sharing allocations, with its pools and allocation
/// records.
#[derive(Debug)]
pub struct Context {
    handle: ContextHandle,
    platform: Weak<Platform>,
    config: Arc<RuntimeConfig>,
    devices: Vec<Arc<Device>>,
    binding: ProviderContext,
    ref_count: AtomicU32,
    state: RwLock<ContextState>,
}

impl Context {
    pub(crate) fn new(
        platform: &Arc<Platform>,
        handle: ContextHandle,
        devices: Vec<Arc<Device>>,
    ) -> UsmResult<Arc<Self>> {
        let config = Arc::clone(platform.config());
        let binding = ProviderContext {
            driver: Arc::clone(platform.driver()),
            context: handle,
            residency: config.residency,
            peers: Arc::new(PeerAccessCache::new(devices.iter().map(|d| d.handle()).collect())),
        };

        let default_pool = UsmPool::new(binding.clone(), devices.clone(), &config, &PoolCreateDesc::default())?;

        Ok(Arc::new(Self {
            handle,
            platform: Arc::downgrade(platform),
            config,
            devices,
            binding,
            ref_count: AtomicU32::new(1),
            state: RwLock::new(ContextState {
                default_pool: Some(Arc::new(default_pool)),
                ..ContextState::default()
            }),
        }))
    }

    #[must_use]
    pub const fn handle(&self) -> ContextHandle {
        self.handle
    }

    #[must_use]
    pub fn devices(&self) -> &[Arc<Device>] {
        &self.devices
    }

    #[must_use]
    pub fn find_device(&self, handle: DeviceHandle) -> Option<Arc<Device>> {
        device::find_device(&self.devices, handle)
    }

    #[must_use]
    pub const fn config(&self) -> &Arc<RuntimeConfig> {
        &self.config
    }

    #[must_use]
    pub fn driver(&self) -> &Arc<dyn NativeDriver> {
        &self.binding.driver
    }

    pub(crate) const fn state(&self) -> &RwLock<ContextState> {
        &self.state
    }

    /// # Errors
    /// `InvalidContext` once the platform is gone.
    pub fn platform(&self) -> UsmResult<Arc<Platform>> {
        self.platform.upgrade().ok_or(UsmError::InvalidContext)
    }

    /// # Errors
    /// `InvalidContext` after the context was torn down.
    pub fn default_pool(&self) -> UsmResult<Arc<UsmPool>> {
        self.state
            .read()
            .default_pool
            .as_ref()
            .map(Arc::clone)
            .ok_or(UsmError::InvalidContext)
    }

    /// A pool created on this context, or its default pool.
    #[must_use]
    pub fn pool(&self, id: PoolId) -> Option<Arc<UsmPool>> {
        self.state.read().pool(id)
    }

    /// Creates an explicit pool owned by this context.
    ///
    /// # Errors
    /// Returns the error building the pool's allocators.
    pub fn create_pool(&self, desc: &PoolCreateDesc) -> UsmResult<Arc<UsmPool>> {
        let pool = Arc::new(UsmPool::new(
            self.binding.clone(),
            self.devices.clone(),
            &self.config,
            desc,
        )?);
        self.state.write().pools.insert(pool.id(), Arc::clone(&pool));
        Ok(pool)
    }

    pub(crate) fn remove_pool(&self, id: PoolId) -> Option<Arc<UsmPool>> {
        self.state.write().pools.remove(&id)
    }

    #[must_use]
    pub fn pool_count(&self) -> usize {
        self.state.read().pools.len()
    }

    #[must_use]
    pub fn tracked_allocations(&self) -> usize {
        self.state.read().tracker.len()
    }

    /// Adds a reference to a tracked allocation for a kernel that reaches it
    /// indirectly.
    ///
    /// # Errors
    /// `InvalidMemObject` if `ptr` is not tracked.
    pub fn retain_allocation(&self, ptr: usize) -> UsmResult<u32> {
        self.state.write().tracker.retain(ptr)
    }

    /// Returns the new reference count.
    pub fn retain(&self) -> u32 {
        self.ref_count.fetch_add(1, Ordering::AcqRel) + 1
    }

    #[must_use]
    pub fn ref_count(&self) -> u32 {
        self.ref_count.load(Ordering::Acquire)
    }

    /// Drops one reference and tears the context down at zero.
    ///
    /// # Errors
    /// * `InvalidValue` if the context was already released.
    /// * The driver error destroying the native context.
    pub fn release(&self) -> UsmResult<()> {
        let platform = self.platform()?;
        let mut registry = platform.lock_contexts();
        self.release_locked(&mut registry)
    }

    /// As [`Self::release`], for callers already holding the registry lock.
    pub(crate) fn release_locked(&self, registry: &mut ContextRegistry) -> UsmResult<()> {
        let previous = self
            .ref_count
            .fetch_update(Ordering::AcqRel, Ordering::Acquire, |count| count.checked_sub(1))
            .map_err(|_| UsmError::InvalidValue)?;
        if previous != 1 {
            return Ok(());
        }

        // 1. Unregister so no new lookups find the context.
        registry.remove(&self.handle);

        // 2. Drop every pool, returning slabs to the driver.
        let (default_pool, pools) = {
            let mut state = self.state.write();
            if !state.tracker.is_empty() {
                tracing::warn!(
                    context = %self.handle,
                    records = state.tracker.len(),
                    "tearing down context with tracked allocations"
                );
            }
            (state.default_pool.take(), std::mem::take(&mut state.pools))
        };
        drop(pools);
        drop(default_pool);

        // 3. Destroy the native context.
        self.binding.driver.context_destroy(self.handle)?;
        tracing::debug!(context = %self.handle, "context destroyed");
        Ok(())
    }
}
