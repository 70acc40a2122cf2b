//! Redzone-padded USM allocation and checked release.

use super::quarantine::Quarantine;
use super::shadow::{HostShadow, ShadowKind, ShadowMemory, ShadowRegistry};
use super::{
    SHADOW_GRANULARITY, SanitizerOptions, compute_redzone_size, deallocated_magic, redzone_magic,
};
use crate::error::{UsmError, UsmResult};
use crate::native::{ContextHandle, DeviceFamily, DeviceHandle, UsmKind};
use crate::runtime::{Context, Device, Platform, usm_alloc, usm_free};
use crate::usm::{UsmAllocDesc, UsmPool};
use crate::utils::{align_up, is_valid_alignment, round_up};
use parking_lot::{Mutex, RwLock};
use std::collections::{BTreeMap, HashMap};
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};

// ===============================================================================================
// Allocation Records
// ===============================================================================================

/// One sanitized allocation.
///
/// ```text
/// alloc_begin      user_begin          user_end        alloc_end
///     | left redzone  |    user bytes     | right redzone  |
/// ```
#[derive(Debug)]
pub struct AllocInfo {
    pub alloc_begin: usize,
    pub user_begin: usize,
    pub user_end: usize,
    pub alloc_size: usize,
    pub kind: UsmKind,
    pub context: ContextHandle,
    pub device: Option<DeviceHandle>,
    released: AtomicBool,
}

impl AllocInfo {
    #[must_use]
    pub const fn new(
        alloc_begin: usize,
        user_begin: usize,
        size: usize,
        alloc_size: usize,
        kind: UsmKind,
        context: ContextHandle,
        device: Option<DeviceHandle>,
    ) -> Self {
        Self {
            alloc_begin,
            user_begin,
            user_end: user_begin + size,
            alloc_size,
            kind,
            context,
            device,
            released: AtomicBool::new(false),
        }
    }

    #[must_use]
    pub const fn alloc_end(&self) -> usize {
        self.alloc_begin + self.alloc_size
    }

    #[must_use]
    pub const fn user_size(&self) -> usize {
        self.user_end - self.user_begin
    }

    #[must_use]
    pub const fn contains(&self, addr: usize) -> bool {
        addr >= self.alloc_begin && addr < self.alloc_end()
    }

    #[must_use]
    pub fn is_released(&self) -> bool {
        self.released.load(Ordering::Acquire)
    }
}

/// Byte counters per context.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct SanitizerStats {
    pub usm_malloced: usize,
    pub usm_malloced_redzones: usize,
    pub usm_freed: usize,
    pub usm_freed_redzones: usize,
}

impl SanitizerStats {
    /// Bytes still held from the driver, quarantined allocations included.
    #[must_use]
    pub const fn live_bytes(&self) -> usize {
        self.usm_malloced.saturating_sub(self.usm_freed)
    }
}

// ===============================================================================================
// Interceptor
// ===============================================================================================

/// Wraps the USM path of one platform with shadow bookkeeping.
#[derive(Debug)]
pub struct SanitizerInterceptor {
    platform: Arc<Platform>,
    options: SanitizerOptions,
    shadows: ShadowRegistry,
    // Keyed by alloc_begin
    allocations: RwLock<BTreeMap<usize, Arc<AllocInfo>>>,
    quarantine: Option<Quarantine>,
    stats: Mutex<HashMap<ContextHandle, SanitizerStats>>,
}

impl SanitizerInterceptor {
    #[must_use]
    pub fn new(platform: Arc<Platform>, options: SanitizerOptions) -> Self {
        let quarantine = (options.quarantine_size > 0).then(|| Quarantine::new(options.quarantine_size));
        Self {
            platform,
            options,
            shadows: ShadowRegistry::new(ShadowKind::Address),
            allocations: RwLock::new(BTreeMap::new()),
            quarantine,
            stats: Mutex::new(HashMap::new()),
        }
    }

    /// Uses `shadow` for CPU targets instead of the process-wide one.
    #[must_use]
    pub fn with_host_shadow(self, shadow: Arc<HostShadow>) -> Self {
        if let Err(e) = self.shadows.set_host_shadow(shadow) {
            tracing::warn!("host shadow not installed: {e}");
        }
        self
    }

    #[must_use]
    pub const fn options(&self) -> &SanitizerOptions {
        &self.options
    }

    #[must_use]
    pub const fn quarantine(&self) -> Option<&Quarantine> {
        self.quarantine.as_ref()
    }

    /// The shadow of `context` for the family of `device`, set up on first use.
    ///
    /// # Errors
    /// Returns the error reserving the shadow.
    pub fn shadow_for(&self, context: &Context, device: &Arc<Device>) -> UsmResult<Arc<ShadowMemory>> {
        self.shadows.shadow_for(context, device)
    }

    /// An existing shadow, without creating one.
    #[must_use]
    pub fn shadow(&self, context: ContextHandle, family: DeviceFamily) -> Option<Arc<ShadowMemory>> {
        self.shadows.shadow(context, family)
    }

    fn shadows_for(&self, context: &Context, device: Option<&Arc<Device>>) -> UsmResult<Vec<Arc<ShadowMemory>>> {
        self.shadows.shadows_for(context, device)
    }

    /// Drops the shadows of a context that is about to be released.
    pub fn remove_context_shadows(&self, context: ContextHandle) {
        self.shadows.remove_context(context);
        self.stats.lock().remove(&context);
    }

    // --- allocation ---

    #[allow(clippy::cast_possible_truncation)]
    fn poison_allocation(shadows: &[Arc<ShadowMemory>], info: &AllocInfo) -> UsmResult<()> {
        let magic = redzone_magic(info.kind);
        let right_redzone = align_up(info.user_end, SHADOW_GRANULARITY);

        for shadow in shadows {
            // 1. Everything addressable, registering the allocation on its pages
            shadow.poison(info.alloc_begin, info.alloc_size, 0, Some(info.alloc_begin))?;

            // 2. Partially addressable tail granule
            let tail = info.user_end % SHADOW_GRANULARITY;
            if tail != 0 {
                shadow.poison(info.user_end, 1, tail as u8, None)?;
            }

            // 3. Left redzone
            shadow.poison(info.alloc_begin, info.user_begin - info.alloc_begin, magic, None)?;

            // 4. Right redzone
            shadow.poison(right_redzone, info.alloc_end() - right_redzone, magic, None)?;
        }
        Ok(())
    }

    /// Allocates `size` bytes between two redzones and returns the user
    /// pointer.
    ///
    /// # Errors
    /// * `InvalidArgument` for an alignment that is neither zero nor a power
    ///   of two.
    /// * `InvalidUsmSize` for an empty request.
    /// * Errors of [`usm_alloc`], and shadow errors. The allocation is freed
    ///   again if its shadow cannot be written.
    pub fn allocate(
        &self,
        context: &Context,
        kind: UsmKind,
        device: Option<&Arc<Device>>,
        desc: &UsmAllocDesc,
        pool: Option<&Arc<UsmPool>>,
        size: usize,
    ) -> UsmResult<usize> {
        if !is_valid_alignment(desc.alignment) {
            return Err(UsmError::InvalidArgument("alignment must be zero or a power of two"));
        }
        if size == 0 {
            return Err(UsmError::InvalidUsmSize);
        }

        let alignment = desc.alignment.max(SHADOW_GRANULARITY);
        let redzone = compute_redzone_size(size, self.options.min_redzone, self.options.max_redzone);
        let mut needed = round_up(size, alignment) + 2 * redzone;
        if alignment > SHADOW_GRANULARITY {
            needed += alignment;
        }

        let alloc_begin = usm_alloc(context, kind, device, desc, pool, needed)?;
        let user_begin = align_up(alloc_begin + redzone, alignment);
        let info = Arc::new(AllocInfo::new(
            alloc_begin,
            user_begin,
            size,
            needed,
            kind,
            context.handle(),
            device.map(|d| d.handle()),
        ));

        let poisoned = self
            .shadows_for(context, device)
            .and_then(|shadows| Self::poison_allocation(&shadows, &info).map(|()| shadows));
        if let Err(e) = poisoned {
            tracing::error!(
                ptr = format_args!("0x{alloc_begin:x}"),
                size = needed,
                "failed to poison allocation: {e}"
            );
            if let Ok(shadows) = self.shadows_for(context, device) {
                for shadow in shadows {
                    if let Err(release) = shadow.release(alloc_begin, needed, alloc_begin) {
                        tracing::warn!("failed to release shadow: {release}");
                    }
                }
            }
            if let Err(free) = usm_free(context, alloc_begin) {
                tracing::warn!(ptr = format_args!("0x{alloc_begin:x}"), "failed to free allocation: {free}");
            }
            return Err(e);
        }

        self.allocations.write().insert(alloc_begin, info);
        {
            let mut stats = self.stats.lock();
            let stats = stats.entry(context.handle()).or_default();
            stats.usm_malloced += needed;
            stats.usm_malloced_redzones += needed - size;
        }

        tracing::trace!(
            ?kind,
            ptr = format_args!("0x{user_begin:x}"),
            size,
            redzone,
            "sanitized allocation"
        );
        Ok(user_begin)
    }

    /// # Errors
    /// See [`Self::allocate`].
    pub fn host_alloc(
        &self,
        context: &Context,
        desc: &UsmAllocDesc,
        pool: Option<&Arc<UsmPool>>,
        size: usize,
    ) -> UsmResult<usize> {
        self.allocate(context, UsmKind::Host, None, desc, pool, size)
    }

    /// # Errors
    /// See [`Self::allocate`].
    pub fn device_alloc(
        &self,
        context: &Context,
        device: &Arc<Device>,
        desc: &UsmAllocDesc,
        pool: Option<&Arc<UsmPool>>,
        size: usize,
    ) -> UsmResult<usize> {
        self.allocate(context, UsmKind::Device, Some(device), desc, pool, size)
    }

    /// # Errors
    /// See [`Self::allocate`].
    pub fn shared_alloc(
        &self,
        context: &Context,
        device: &Arc<Device>,
        desc: &UsmAllocDesc,
        pool: Option<&Arc<UsmPool>>,
        size: usize,
    ) -> UsmResult<usize> {
        self.allocate(context, UsmKind::Shared, Some(device), desc, pool, size)
    }

    // --- release ---

    /// The allocation whose redzones or user bytes contain `addr`.
    #[must_use]
    pub fn find_alloc_info_by_address(&self, addr: usize) -> Option<Arc<AllocInfo>> {
        self.allocations
            .read()
            .range(..=addr)
            .next_back()
            .filter(|(_, info)| info.contains(addr))
            .map(|(_, info)| Arc::clone(info))
    }

    /// Checks and releases a user pointer returned by [`Self::allocate`].
    ///
    /// # Errors
    /// * `BadFree` for a pointer that is not the start of a live allocation
    ///   of `context`.
    /// * `DoubleFree` for an allocation released before.
    /// * Shadow and [`usm_free`] errors.
    pub fn release(&self, context: &Context, ptr: usize) -> UsmResult<()> {
        let Some(info) = self.find_alloc_info_by_address(ptr) else {
            tracing::error!(ptr = format_args!("0x{ptr:x}"), "bad free: unknown pointer");
            return Err(UsmError::BadFree { addr: ptr });
        };
        if info.context != context.handle() || ptr != info.user_begin {
            tracing::error!(
                ptr = format_args!("0x{ptr:x}"),
                user_begin = format_args!("0x{:x}", info.user_begin),
                "bad free: not the start of an allocation of this context"
            );
            return Err(UsmError::BadFree { addr: ptr });
        }
        if info.released.swap(true, Ordering::AcqRel) {
            tracing::error!(ptr = format_args!("0x{ptr:x}"), "double free");
            return Err(UsmError::DoubleFree { addr: ptr });
        }

        if self.options.poison_on_free {
            let device = info.device.and_then(|d| context.find_device(d));
            let magic = deallocated_magic(info.kind);
            for shadow in self.shadows_for(context, device.as_ref())? {
                shadow.poison(info.alloc_begin, info.alloc_size, magic, None)?;
            }
        }

        let Some(quarantine) = &self.quarantine else {
            return self.free_now(context, &info);
        };

        for evicted in quarantine.put(info.device, info) {
            if evicted.context == context.handle() {
                self.free_now(context, &evicted)?;
                continue;
            }
            match self.platform.context(evicted.context) {
                Some(owner) => self.free_now(&owner, &evicted)?,
                None => {
                    tracing::warn!(
                        context = %evicted.context,
                        ptr = format_args!("0x{:x}", evicted.user_begin),
                        "dropping quarantined allocation of a released context"
                    );
                    self.allocations.write().remove(&evicted.alloc_begin);
                }
            }
        }
        Ok(())
    }

    fn free_now(&self, context: &Context, info: &AllocInfo) -> UsmResult<()> {
        let device = info.device.and_then(|d| context.find_device(d));
        for shadow in self.shadows_for(context, device.as_ref())? {
            shadow.release(info.alloc_begin, info.alloc_size, info.alloc_begin)?;
        }

        self.allocations.write().remove(&info.alloc_begin);
        {
            let mut stats = self.stats.lock();
            let stats = stats.entry(info.context).or_default();
            stats.usm_freed += info.alloc_size;
            stats.usm_freed_redzones += info.alloc_size - info.user_size();
        }

        tracing::trace!(ptr = format_args!("0x{:x}", info.user_begin), "sanitized allocation freed");
        usm_free(context, info.alloc_begin)
    }

    #[must_use]
    pub fn stats(&self, context: ContextHandle) -> SanitizerStats {
        self.stats.lock().get(&context).copied().unwrap_or_default()
    }

    #[must_use]
    pub fn live_allocations(&self) -> usize {
        self.allocations.read().len()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::RuntimeConfig;
    use crate::native::NativeDriver;
    use crate::native::mock::MockDriver;
    use crate::sanitizer::{USM_DEVICE_DEALLOCATED_MAGIC, USM_DEVICE_REDZONE_MAGIC};
    use crate::utils::MIB;

    fn setup(options: SanitizerOptions) -> (Arc<MockDriver>, Arc<Context>, SanitizerInterceptor) {
        let driver = MockDriver::builder().gpu(DeviceFamily::GpuPvc, 0).build();
        let platform = Platform::new(Arc::clone(&driver) as Arc<dyn NativeDriver>, RuntimeConfig::default());
        let context = platform.create_context(platform.devices()).unwrap();
        (driver, context, SanitizerInterceptor::new(platform, options))
    }

    #[test]
    fn test_layout_and_redzones() {
        let (_driver, context, sanitizer) = setup(SanitizerOptions::default());
        let device = Arc::clone(&context.devices()[0]);

        let ptr = sanitizer
            .device_alloc(&context, &device, &UsmAllocDesc::default(), None, 13)
            .unwrap();
        let info = sanitizer.find_alloc_info_by_address(ptr).unwrap();
        assert_eq!(ptr, info.alloc_begin + 16);
        assert_eq!(info.alloc_size, 16 + 32);
        assert_eq!(info.user_end, ptr + 13);

        let shadow = sanitizer.shadow(context.handle(), DeviceFamily::GpuPvc).unwrap();
        let bytes = shadow.read(info.alloc_begin, 6).unwrap();
        let rz = USM_DEVICE_REDZONE_MAGIC;
        assert_eq!(bytes, [rz, rz, 0, 5, rz, rz]);
    }

    #[test]
    fn test_aligned_user_pointer() {
        let (_driver, context, sanitizer) = setup(SanitizerOptions::default());
        let ptr = sanitizer
            .host_alloc(&context, &UsmAllocDesc::aligned(256), None, 100)
            .unwrap();
        assert_eq!(ptr % 256, 0);
        let info = sanitizer.find_alloc_info_by_address(ptr).unwrap();
        assert!(info.user_begin - info.alloc_begin >= 32);
        assert!(info.alloc_end() - info.user_end >= 32);
    }

    #[test]
    fn test_bad_alignment() {
        let (driver, context, sanitizer) = setup(SanitizerOptions::default());
        let before = driver.stats().allocs;
        assert!(matches!(
            sanitizer.host_alloc(&context, &UsmAllocDesc::aligned(24), None, 64),
            Err(UsmError::InvalidArgument(_))
        ));
        assert_eq!(driver.stats().allocs, before);
    }

    #[test]
    fn test_bad_and_double_free() {
        let (_driver, context, sanitizer) = setup(SanitizerOptions {
            quarantine_size: MIB,
            ..SanitizerOptions::default()
        });
        let ptr = sanitizer
            .host_alloc(&context, &UsmAllocDesc::default(), None, 64)
            .unwrap();

        assert!(matches!(
            sanitizer.release(&context, ptr + 8),
            Err(UsmError::BadFree { .. })
        ));
        assert!(matches!(
            sanitizer.release(&context, 0x10),
            Err(UsmError::BadFree { addr: 0x10 })
        ));

        sanitizer.release(&context, ptr).unwrap();
        assert!(sanitizer.find_alloc_info_by_address(ptr).unwrap().is_released());
        assert!(matches!(
            sanitizer.release(&context, ptr),
            Err(UsmError::DoubleFree { .. })
        ));
    }

    #[test]
    fn test_release_poisons_freed_memory() {
        let (_driver, context, sanitizer) = setup(SanitizerOptions {
            quarantine_size: MIB,
            ..SanitizerOptions::default()
        });
        let device = Arc::clone(&context.devices()[0]);
        let ptr = sanitizer
            .device_alloc(&context, &device, &UsmAllocDesc::default(), None, 32)
            .unwrap();
        sanitizer.release(&context, ptr).unwrap();

        let shadow = sanitizer.shadow(context.handle(), DeviceFamily::GpuPvc).unwrap();
        let bytes = shadow.read(ptr, 4).unwrap();
        assert_eq!(bytes, [USM_DEVICE_DEALLOCATED_MAGIC; 4]);
        assert_eq!(sanitizer.stats(context.handle()).usm_freed, 0);
    }

    #[test]
    fn test_immediate_free_updates_stats() {
        let (driver, context, sanitizer) = setup(SanitizerOptions::default());
        let ptr = sanitizer
            .host_alloc(&context, &UsmAllocDesc::default(), None, 48)
            .unwrap();
        let stats = sanitizer.stats(context.handle());
        assert_eq!(stats.usm_malloced, 80);
        assert_eq!(stats.usm_malloced_redzones, 32);

        sanitizer.release(&context, ptr).unwrap();
        let stats = sanitizer.stats(context.handle());
        assert_eq!(stats.usm_freed, 80);
        assert_eq!(stats.live_bytes(), 0);
        assert_eq!(sanitizer.live_allocations(), 0);
        assert!(sanitizer.find_alloc_info_by_address(ptr).is_none());
        assert!(driver.stats().fills > 0);
    }
}
