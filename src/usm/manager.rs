use super::descriptor::PoolDescriptor;
use super::pool::PoolAllocator;
use crate::error::{UsmError, UsmResult};
use std::collections::HashMap;
use std::sync::Arc;

/// Registry of the allocators of one [`super::UsmPool`], one per distinct
/// descriptor.
///
/// The manager itself is not synchronized. Its owner wraps it in a lock and
/// must hold that lock exclusively across [`PoolManager::get_or_create_pool`].
#[derive(Debug, Default)]
pub struct PoolManager {
    pools: HashMap<PoolDescriptor, Arc<PoolAllocator>>,
}

impl PoolManager {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// # Errors
    /// `PoolAlreadyRegistered` if an equal descriptor is already present.
    pub fn add_pool(&mut self, descriptor: PoolDescriptor, allocator: Arc<PoolAllocator>) -> UsmResult<()> {
        if self.pools.contains_key(&descriptor) {
            return Err(UsmError::PoolAlreadyRegistered);
        }
        tracing::debug!(
            kind = %descriptor.pool_kind(),
            device = ?descriptor.device.as_ref().map(|d| d.handle()),
            "pool registered"
        );
        self.pools.insert(descriptor, allocator);
        Ok(())
    }

    #[must_use]
    pub fn get_pool(&self, descriptor: &PoolDescriptor) -> Option<Arc<PoolAllocator>> {
        self.pools.get(descriptor).map(Arc::clone)
    }

    /// Returns the registered allocator, or registers the one `create` builds.
    ///
    /// # Errors
    /// Returns the error from `create`.
    pub fn get_or_create_pool<F>(&mut self, descriptor: &PoolDescriptor, create: F) -> UsmResult<Arc<PoolAllocator>>
    where
        F: FnOnce(&PoolDescriptor) -> UsmResult<PoolAllocator>,
    {
        if let Some(allocator) = self.get_pool(descriptor) {
            return Ok(allocator);
        }
        let allocator = Arc::new(create(descriptor)?);
        self.add_pool(descriptor.clone(), Arc::clone(&allocator))?;
        Ok(allocator)
    }

    /// The allocator holding a live allocation at `ptr`.
    #[must_use]
    pub fn pool_by_ptr(&self, ptr: usize) -> Option<Arc<PoolAllocator>> {
        self.pools
            .values()
            .find(|allocator| allocator.owns(ptr))
            .map(Arc::clone)
    }

    pub fn pools(&self) -> impl Iterator<Item = (&PoolDescriptor, &Arc<PoolAllocator>)> {
        self.pools.iter()
    }

    #[must_use]
    pub fn len(&self) -> usize {
        self.pools.len()
    }

    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.pools.is_empty()
    }
}
