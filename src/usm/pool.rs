use super::config::{DisjointPoolConfigs, PoolLimits};
use super::descriptor::{PoolDescriptor, PoolId};
use super::disjoint::{DisjointPool, SharedLimits};
use super::manager::PoolManager;
use super::provider::{MemoryProvider, ProviderContext};
use super::proxy::ProxyPool;
use super::PoolKind;
use crate::config::RuntimeConfig;
use crate::error::{UsmError, UsmResult};
use crate::native::{ContextHandle, UsmKind};
use crate::runtime::device::{Device, find_device};
use crate::utils::is_valid_alignment;
use parking_lot::RwLock;
use std::sync::Arc;
use std::sync::atomic::{AtomicU32, Ordering};

// ===============================================================================================
// Descriptors
// ===============================================================================================

/// Per-request allocation properties.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct UsmAllocDesc {
    /// Zero lets the allocator choose.
    pub alignment: usize,
    /// Shared memory the device only reads.
    pub device_read_only: bool,
}

impl UsmAllocDesc {
    #[must_use]
    pub const fn aligned(alignment: usize) -> Self {
        Self {
            alignment,
            device_read_only: false,
        }
    }
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct PoolFlags {
    /// Zero-fill every fresh provider allocation.
    pub zero_initialize_block: bool,
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct PoolCreateDesc {
    pub flags: PoolFlags,
    pub limits: Option<PoolLimits>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u32)]
pub enum PoolInfo {
    ReferenceCount = 0,
    Context = 1,
}

impl TryFrom<u32> for PoolInfo {
    type Error = UsmError;

    fn try_from(value: u32) -> Result<Self, Self::Error> {
        match value {
            0 => Ok(Self::ReferenceCount),
            1 => Ok(Self::Context),
            other => Err(UsmError::UnsupportedEnumeration(other)),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PoolInfoValue {
    ReferenceCount(u32),
    Context(ContextHandle),
}

// ===============================================================================================
// Pool Allocators
// ===============================================================================================

/// The allocator behind one descriptor.
#[derive(Debug)]
pub enum PoolAllocator {
    Disjoint(DisjointPool),
    Proxy(ProxyPool),
}

impl PoolAllocator {
    /// # Errors
    /// Returns the allocator's error.
    pub fn alloc(&self, size: usize, alignment: usize) -> UsmResult<usize> {
        match self {
            Self::Disjoint(pool) => pool.alloc(size, alignment),
            Self::Proxy(pool) => pool.alloc(size, alignment),
        }
    }

    /// # Errors
    /// `InvalidMemObject` for pointers this allocator does not hold.
    pub fn free(&self, ptr: usize) -> UsmResult<()> {
        match self {
            Self::Disjoint(pool) => pool.free(ptr),
            Self::Proxy(pool) => pool.free(ptr),
        }
    }

    /// Start and requested size of the live allocation containing `ptr`.
    #[must_use]
    pub fn find_allocation(&self, ptr: usize) -> Option<(usize, usize)> {
        match self {
            Self::Disjoint(pool) => pool.find_allocation(ptr),
            Self::Proxy(pool) => pool.find_allocation(ptr),
        }
    }

    #[must_use]
    pub fn owns(&self, ptr: usize) -> bool {
        self.find_allocation(ptr).is_some()
    }

    #[must_use]
    pub const fn provider(&self) -> &MemoryProvider {
        match self {
            Self::Disjoint(pool) => pool.provider(),
            Self::Proxy(pool) => pool.provider(),
        }
    }

    #[must_use]
    pub const fn kind(&self) -> PoolKind {
        self.provider().kind()
    }
}

// ===============================================================================================
// USM Pool
// ===============================================================================================

/// A live allocation as seen by its pool.
#[derive(Debug, Clone)]
pub struct PoolAllocation {
    pub allocator: Arc<PoolAllocator>,
    pub base: usize,
    pub size: usize,
}

/// A USM pool: one allocator per (kind, device, read-only) combination of its
/// context, created eagerly for the context's devices.
///
/// The pool refers to its context by handle only. The context owns the pool.
#[derive(Debug)]
pub struct UsmPool {
    id: PoolId,
    binding: ProviderContext,
    devices: Vec<Arc<Device>>,
    configs: DisjointPoolConfigs,
    limits: Arc<SharedLimits>,
    use_allocator: bool,
    flags: PoolFlags,
    alignment_ceiling: usize,
    manager: RwLock<PoolManager>,
    ref_count: AtomicU32,
}

impl UsmPool {
    /// # Errors
    /// * `InvalidValue` for limits no disjoint pool can honour.
    /// * The error building a default allocator.
    pub fn new(
        binding: ProviderContext,
        devices: Vec<Arc<Device>>,
        config: &RuntimeConfig,
        desc: &PoolCreateDesc,
    ) -> UsmResult<Self> {
        let mut configs = config.disjoint_pool_configs();
        if let Some(limits) = desc.limits.as_ref() {
            limits.validate()?;
            configs.apply_limits(limits);
        }

        let pool = Self {
            id: PoolId::next(),
            use_allocator: config.use_usm_allocator && configs.enable_buffers,
            limits: Arc::new(SharedLimits::new(configs.max_pool_size)),
            configs,
            binding,
            devices,
            flags: desc.flags,
            alignment_ceiling: config.alignment_ceiling,
            manager: RwLock::new(PoolManager::new()),
            ref_count: AtomicU32::new(1),
        };

        {
            let mut manager = pool.manager.write();
            for descriptor in PoolDescriptor::create_defaults(pool.id, pool.binding.context, &pool.devices) {
                // Sub-devices resolve to their root's descriptor.
                if manager.get_pool(&descriptor).is_some() {
                    continue;
                }
                let allocator = Arc::new(pool.make_allocator(&descriptor)?);
                manager.add_pool(descriptor, allocator)?;
            }
            tracing::debug!(
                pool = pool.id.raw(),
                allocators = manager.len(),
                pooled = pool.use_allocator,
                "USM pool created"
            );
        }

        Ok(pool)
    }

    fn make_allocator(&self, descriptor: &PoolDescriptor) -> UsmResult<PoolAllocator> {
        let kind = descriptor.pool_kind();
        let provider = MemoryProvider::initialize(
            kind,
            &self.binding,
            descriptor.device.clone(),
            self.flags.zero_initialize_block,
        )?;

        Ok(if self.use_allocator {
            PoolAllocator::Disjoint(DisjointPool::new(
                provider,
                *self.configs.get(kind),
                Arc::clone(&self.limits),
                self.configs.trace,
            ))
        } else {
            PoolAllocator::Proxy(ProxyPool::new(provider))
        })
    }

    #[must_use]
    pub const fn id(&self) -> PoolId {
        self.id
    }

    #[must_use]
    pub const fn context(&self) -> ContextHandle {
        self.binding.context
    }

    #[must_use]
    pub const fn configs(&self) -> &DisjointPoolConfigs {
        &self.configs
    }

    #[must_use]
    pub const fn flags(&self) -> PoolFlags {
        self.flags
    }

    /// Whether requests go through disjoint pools rather than straight to
    /// providers.
    #[must_use]
    pub const fn is_pooling(&self) -> bool {
        self.use_allocator
    }

    /// Resolves the allocator for `descriptor`, creating it on first use.
    ///
    /// # Errors
    /// Returns the error building a new allocator.
    pub fn allocator_for(&self, descriptor: &PoolDescriptor) -> UsmResult<Arc<PoolAllocator>> {
        if let Some(allocator) = self.manager.read().get_pool(descriptor) {
            return Ok(allocator);
        }
        // Re-checked under the write lock, so racing creators agree.
        self.manager
            .write()
            .get_or_create_pool(descriptor, |d| self.make_allocator(d))
    }

    /// Allocates `size` bytes of `kind` memory.
    ///
    /// # Errors
    /// * `InvalidUsmSize` for a zero size.
    /// * `InvalidValue` for an alignment that is not a power of two or is
    ///   above the backend ceiling.
    /// * `InvalidArgument` for a read-only request on non-shared memory or a
    ///   host request naming a device.
    /// * `InvalidDevice` when device memory names no device of this context.
    /// * Provider errors verbatim.
    pub fn allocate(
        &self,
        kind: UsmKind,
        device: Option<&Arc<Device>>,
        desc: &UsmAllocDesc,
        size: usize,
    ) -> UsmResult<usize> {
        if size == 0 {
            return Err(UsmError::InvalidUsmSize);
        }
        if !is_valid_alignment(desc.alignment) || desc.alignment > self.alignment_ceiling {
            return Err(UsmError::InvalidValue);
        }
        if desc.device_read_only && kind != UsmKind::Shared {
            return Err(UsmError::InvalidArgument("device read-only requires shared memory"));
        }

        let device = match (kind, device) {
            (UsmKind::Host, Some(_)) => {
                return Err(UsmError::InvalidArgument("host allocations take no device"));
            }
            (UsmKind::Host, None) => None,
            (_, None) => return Err(UsmError::InvalidDevice),
            (_, Some(device)) => {
                if find_device(&self.devices, device.handle()).is_none() {
                    return Err(UsmError::InvalidDevice);
                }
                Some(Arc::clone(device))
            }
        };

        let descriptor = PoolDescriptor::new(self.id, self.binding.context, device, kind, desc.device_read_only);
        let ptr = self.allocator_for(&descriptor)?.alloc(size, desc.alignment)?;

        tracing::trace!(pool = self.id.raw(), ?kind, size, ptr = format_args!("0x{ptr:x}"), "usm alloc");
        Ok(ptr)
    }

    /// # Errors
    /// See [`Self::allocate`].
    pub fn allocate_host(&self, desc: &UsmAllocDesc, size: usize) -> UsmResult<usize> {
        self.allocate(UsmKind::Host, None, desc, size)
    }

    /// # Errors
    /// See [`Self::allocate`].
    pub fn allocate_device(&self, device: &Arc<Device>, desc: &UsmAllocDesc, size: usize) -> UsmResult<usize> {
        self.allocate(UsmKind::Device, Some(device), desc, size)
    }

    /// # Errors
    /// See [`Self::allocate`].
    pub fn allocate_shared(&self, device: &Arc<Device>, desc: &UsmAllocDesc, size: usize) -> UsmResult<usize> {
        self.allocate(UsmKind::Shared, Some(device), desc, size)
    }

    /// Frees a pointer returned by this pool.
    ///
    /// # Errors
    /// `InvalidMemObject` if no allocator of this pool holds `ptr`.
    pub fn free(&self, ptr: usize) -> UsmResult<()> {
        let allocator = self
            .manager
            .read()
            .pool_by_ptr(ptr)
            .ok_or(UsmError::InvalidMemObject(ptr))?;
        allocator.free(ptr)?;
        tracing::trace!(pool = self.id.raw(), ptr = format_args!("0x{ptr:x}"), "usm free");
        Ok(())
    }

    #[must_use]
    pub fn find_allocation(&self, ptr: usize) -> Option<PoolAllocation> {
        let manager = self.manager.read();
        manager.pools().find_map(|(_, allocator)| {
            allocator.find_allocation(ptr).map(|(base, size)| PoolAllocation {
                allocator: Arc::clone(allocator),
                base,
                size,
            })
        })
    }

    #[must_use]
    pub fn owns(&self, ptr: usize) -> bool {
        self.manager.read().pool_by_ptr(ptr).is_some()
    }

    #[must_use]
    pub fn allocator_count(&self) -> usize {
        self.manager.read().len()
    }

    /// Returns the new reference count.
    pub fn retain(&self) -> u32 {
        self.ref_count.fetch_add(1, Ordering::AcqRel) + 1
    }

    /// Returns the remaining reference count. The owner drops the pool at
    /// zero.
    ///
    /// # Errors
    /// `InvalidValue` if the pool was already released.
    pub fn release(&self) -> UsmResult<u32> {
        self.ref_count
            .fetch_update(Ordering::AcqRel, Ordering::Acquire, |count| count.checked_sub(1))
            .map(|previous| previous - 1)
            .map_err(|_| UsmError::InvalidValue)
    }

    #[must_use]
    pub fn ref_count(&self) -> u32 {
        self.ref_count.load(Ordering::Acquire)
    }

    #[must_use]
    pub fn info(&self, query: PoolInfo) -> PoolInfoValue {
        match query {
            PoolInfo::ReferenceCount => PoolInfoValue::ReferenceCount(self.ref_count()),
            PoolInfo::Context => PoolInfoValue::Context(self.binding.context),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::ResidencyPolicy;
    use crate::native::mock::MockDriver;
    use crate::native::DeviceFamily;
    use crate::usm::provider::tests::test_binding;
    use crate::utils::{KIB, MIB};

    fn pool_with(driver: &Arc<MockDriver>, config: &RuntimeConfig, desc: &PoolCreateDesc) -> (UsmPool, Vec<Arc<Device>>) {
        let (binding, devices) = test_binding(driver, ResidencyPolicy::none());
        let pool = UsmPool::new(binding, devices.clone(), config, desc).unwrap();
        (pool, devices)
    }

    fn pool(driver: &Arc<MockDriver>) -> (UsmPool, Vec<Arc<Device>>) {
        pool_with(driver, &RuntimeConfig::default(), &PoolCreateDesc::default())
    }

    #[test]
    fn test_defaults_collapse_sub_devices() {
        let driver = MockDriver::builder().gpu(DeviceFamily::GpuPvc, 2).build();
        let (pool, _) = pool(&driver);
        // Host + Device, Shared and read-only Shared for the single card.
        assert_eq!(pool.allocator_count(), 4);
        assert!(pool.is_pooling());
    }

    #[test]
    fn test_invalid_alignment_makes_no_driver_call() {
        let driver = MockDriver::builder().gpu(DeviceFamily::GpuPvc, 0).build();
        let (pool, devices) = pool(&driver);

        for alignment in [100, 3, 128 * KIB] {
            let result = pool.allocate_device(&devices[0], &UsmAllocDesc::aligned(alignment), 64);
            assert!(matches!(result, Err(UsmError::InvalidValue)), "alignment {alignment}");
        }
        assert_eq!(driver.stats().allocs, 0);
    }

    #[test]
    fn test_argument_validation() {
        let driver = MockDriver::builder().gpu(DeviceFamily::GpuPvc, 0).build();
        let (pool, devices) = pool(&driver);
        let read_only = UsmAllocDesc {
            alignment: 0,
            device_read_only: true,
        };

        assert!(matches!(
            pool.allocate_device(&devices[0], &read_only, 64),
            Err(UsmError::InvalidArgument(_))
        ));
        assert!(matches!(
            pool.allocate(UsmKind::Host, Some(&devices[0]), &UsmAllocDesc::default(), 64),
            Err(UsmError::InvalidArgument(_))
        ));
        assert!(matches!(
            pool.allocate(UsmKind::Shared, None, &UsmAllocDesc::default(), 64),
            Err(UsmError::InvalidDevice)
        ));
        assert!(matches!(
            pool.allocate_host(&UsmAllocDesc::default(), 0),
            Err(UsmError::InvalidUsmSize)
        ));
        assert!(pool.allocate_shared(&devices[0], &read_only, 64).is_ok());
    }

    #[test]
    fn test_device_outside_context_is_rejected() {
        let driver = MockDriver::builder()
            .gpu(DeviceFamily::GpuPvc, 0)
            .gpu(DeviceFamily::GpuPvc, 0)
            .build();
        let (binding, devices) = test_binding(&driver, ResidencyPolicy::none());
        let pool = UsmPool::new(
            binding,
            vec![Arc::clone(&devices[0])],
            &RuntimeConfig::default(),
            &PoolCreateDesc::default(),
        )
        .unwrap();

        assert!(matches!(
            pool.allocate_device(&devices[1], &UsmAllocDesc::default(), 64),
            Err(UsmError::InvalidDevice)
        ));
    }

    #[test]
    fn test_sub_devices_share_allocator() {
        let driver = MockDriver::builder().gpu(DeviceFamily::GpuPvc, 2).build();
        let (pool, devices) = pool(&driver);
        let subs = devices[0].sub_devices();

        let a = pool.allocate_device(&subs[0], &UsmAllocDesc::default(), 256).unwrap();
        let b = pool.allocate_device(&subs[1], &UsmAllocDesc::default(), 256).unwrap();
        let c = pool.allocate_device(&devices[0], &UsmAllocDesc::default(), 256).unwrap();

        let owner_a = pool.find_allocation(a).unwrap().allocator;
        let owner_b = pool.find_allocation(b).unwrap().allocator;
        let owner_c = pool.find_allocation(c).unwrap().allocator;
        assert!(Arc::ptr_eq(&owner_a, &owner_b));
        assert!(Arc::ptr_eq(&owner_a, &owner_c));
        // All three share one slab.
        assert_eq!(driver.stats().allocs, 1);
    }

    #[test]
    fn test_concurrent_lookup_agrees() {
        let driver = MockDriver::builder().gpu(DeviceFamily::GpuDg2, 0).build();
        let (pool, devices) = pool(&driver);
        let descriptor = PoolDescriptor::new(
            pool.id(),
            pool.context(),
            Some(Arc::clone(&devices[0])),
            UsmKind::Shared,
            true,
        );

        let allocators: Vec<Arc<PoolAllocator>> = std::thread::scope(|scope| {
            let handles: Vec<_> = (0..8)
                .map(|_| scope.spawn(|| pool.allocator_for(&descriptor).unwrap()))
                .collect();
            handles.into_iter().map(|h| h.join().unwrap()).collect()
        });

        for allocator in &allocators[1..] {
            assert!(Arc::ptr_eq(allocator, &allocators[0]));
        }
        assert_eq!(pool.allocator_count(), 4);
    }

    #[test]
    fn test_free_round_trip() {
        let driver = MockDriver::builder().gpu(DeviceFamily::GpuPvc, 0).build();
        let (pool, _) = pool(&driver);

        let ptr = pool.allocate_host(&UsmAllocDesc::default(), 64).unwrap();
        assert!(pool.owns(ptr));
        pool.free(ptr).unwrap();
        assert!(!pool.owns(ptr));
        assert!(matches!(pool.free(ptr), Err(UsmError::InvalidMemObject(_))));
    }

    #[test]
    fn test_disabled_allocator_uses_proxies() {
        let driver = MockDriver::builder().gpu(DeviceFamily::GpuPvc, 0).build();
        let config = RuntimeConfig::default().with_usm_allocator(false);
        let (pool, _) = pool_with(&driver, &config, &PoolCreateDesc::default());
        assert!(!pool.is_pooling());

        let ptr = pool.allocate_host(&UsmAllocDesc::default(), 64).unwrap();
        let allocation = pool.find_allocation(ptr).unwrap();
        assert!(matches!(*allocation.allocator, PoolAllocator::Proxy(_)));
        pool.free(ptr).unwrap();
        assert_eq!(driver.stats().frees, 1);

        let config = RuntimeConfig::default().with_pool_config("0");
        let (pool, _) = pool_with(&driver, &config, &PoolCreateDesc::default());
        assert!(!pool.is_pooling());
    }

    #[test]
    fn test_create_limits_apply_to_every_kind() {
        let driver = MockDriver::builder().gpu(DeviceFamily::GpuPvc, 0).build();
        let desc = PoolCreateDesc {
            flags: PoolFlags::default(),
            limits: Some(PoolLimits {
                max_poolable_size: 256,
                min_driver_alloc_size: 4 * KIB,
            }),
        };
        let (pool, devices) = pool_with(&driver, &RuntimeConfig::default(), &desc);

        for kind in PoolKind::ALL {
            assert_eq!(pool.configs().get(kind).max_poolable_size, 256);
        }

        // Above the limit: one driver call per allocation.
        pool.allocate_device(&devices[0], &UsmAllocDesc::default(), 512).unwrap();
        pool.allocate_device(&devices[0], &UsmAllocDesc::default(), 512).unwrap();
        assert_eq!(driver.stats().allocs, 2);
        // Shared pooling is enabled by the override.
        pool.allocate_shared(&devices[0], &UsmAllocDesc::default(), 64).unwrap();
        pool.allocate_shared(&devices[0], &UsmAllocDesc::default(), 64).unwrap();
        assert_eq!(driver.stats().allocs, 3);
    }

    #[test]
    fn test_zero_initialize_flag_reaches_provider() {
        let driver = MockDriver::builder().gpu(DeviceFamily::GpuPvc, 0).build();
        let desc = PoolCreateDesc {
            flags: PoolFlags {
                zero_initialize_block: true,
            },
            limits: None,
        };
        let (pool, _) = pool_with(&driver, &RuntimeConfig::default(), &desc);
        pool.allocate_host(&UsmAllocDesc::default(), MIB).unwrap();
        assert_eq!(driver.stats().fills, 1);
    }

    #[test]
    fn test_reference_count_and_info() {
        let driver = MockDriver::builder().gpu(DeviceFamily::GpuPvc, 0).build();
        let (pool, _) = pool(&driver);

        assert_eq!(pool.info(PoolInfo::ReferenceCount), PoolInfoValue::ReferenceCount(1));
        assert_eq!(pool.retain(), 2);
        assert_eq!(pool.release().unwrap(), 1);
        assert_eq!(pool.info(PoolInfo::Context), PoolInfoValue::Context(pool.context()));

        assert_eq!(PoolInfo::try_from(1).unwrap(), PoolInfo::Context);
        assert!(matches!(PoolInfo::try_from(7), Err(UsmError::UnsupportedEnumeration(7))));
    }
}
