//! Uninitialised-value tracking for USM allocations.
//!
//! Allocations are handed out unpadded. Their shadow starts out as
//! [`MSAN_UNINITIALIZED_MAGIC`] and is cleared as the memory is written.
//! Host and shared memory is touched by host code the shadow never sees, so
//! it is only checked when [`MsanOptions::check_host_and_shared`] is set.

use super::shadow::{HostShadow, ShadowKind, ShadowMemory, ShadowRegistry};
use super::{ENV_MSAN_CHECK_HOST_AND_SHARED, MSAN_ORIGIN_GRANULARITY, MSAN_SHADOW_SCALE, MSAN_UNINITIALIZED_MAGIC};
use crate::error::{UsmError, UsmResult};
use crate::native::{ContextHandle, DeviceFamily, DeviceHandle, UsmKind};
use crate::runtime::{Context, Device, Platform, usm_alloc, usm_free};
use crate::usm::{UsmAllocDesc, UsmPool};
use crate::utils::is_valid_alignment;
use parking_lot::{Mutex, RwLock};
use std::collections::{BTreeMap, HashMap};
use std::sync::Arc;
use std::sync::atomic::{AtomicU32, Ordering};

// ===============================================================================================
// Origins
// ===============================================================================================

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum HeapType {
    DeviceUsm,
    HostUsm,
    SharedUsm,
}

impl From<UsmKind> for HeapType {
    fn from(kind: UsmKind) -> Self {
        match kind {
            UsmKind::Device => Self::DeviceUsm,
            UsmKind::Host => Self::HostUsm,
            UsmKind::Shared => Self::SharedUsm,
        }
    }
}

/// Identifies where uninitialised bytes came from.
///
/// ```text
/// 31      29 28                              0
/// | heap+1  |           sequence id           |
/// ```
///
/// A raw value of zero is no origin.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default)]
pub struct Origin(u32);

impl Origin {
    pub const NONE: Self = Self(0);

    const ID_BITS: u32 = 29;
    const ID_MASK: u32 = (1 << Self::ID_BITS) - 1;

    #[must_use]
    pub const fn heap(id: u32, heap: HeapType) -> Self {
        let tag = match heap {
            HeapType::DeviceUsm => 1,
            HeapType::HostUsm => 2,
            HeapType::SharedUsm => 3,
        };
        Self((tag << Self::ID_BITS) | (id & Self::ID_MASK))
    }

    #[must_use]
    pub const fn from_raw(raw: u32) -> Self {
        Self(raw)
    }

    #[must_use]
    pub const fn raw(self) -> u32 {
        self.0
    }

    #[must_use]
    pub const fn id(self) -> u32 {
        self.0 & Self::ID_MASK
    }

    #[must_use]
    pub const fn heap_type(self) -> Option<HeapType> {
        match self.0 >> Self::ID_BITS {
            1 => Some(HeapType::DeviceUsm),
            2 => Some(HeapType::HostUsm),
            3 => Some(HeapType::SharedUsm),
            _ => None,
        }
    }

    #[must_use]
    pub const fn is_none(self) -> bool {
        self.0 == 0
    }
}

// ===============================================================================================
// Options and Records
// ===============================================================================================

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct MsanOptions {
    /// Track host and shared USM as well as device USM.
    pub check_host_and_shared: bool,
}

impl MsanOptions {
    #[must_use]
    pub fn from_env() -> Self {
        Self::from_lookup(|name| std::env::var(name).ok())
    }

    pub fn from_lookup<F>(lookup: F) -> Self
    where
        F: Fn(&str) -> Option<String>,
    {
        let mut options = Self::default();
        if let Some(value) = lookup(ENV_MSAN_CHECK_HOST_AND_SHARED) {
            match value.trim().to_ascii_lowercase().as_str() {
                "1" | "true" | "on" | "yes" => options.check_host_and_shared = true,
                "0" | "false" | "off" | "no" => options.check_host_and_shared = false,
                _ => tracing::warn!(%value, "ignoring malformed {ENV_MSAN_CHECK_HOST_AND_SHARED}"),
            }
        }
        options
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct MsanAllocInfo {
    pub alloc_begin: usize,
    pub alloc_size: usize,
    pub kind: UsmKind,
    pub context: ContextHandle,
    pub device: Option<DeviceHandle>,
    pub origin: Origin,
}

impl MsanAllocInfo {
    #[must_use]
    pub const fn alloc_end(&self) -> usize {
        self.alloc_begin + self.alloc_size
    }

    #[must_use]
    pub const fn contains(&self, addr: usize) -> bool {
        addr >= self.alloc_begin && addr < self.alloc_end()
    }
}

// ===============================================================================================
// Interceptor
// ===============================================================================================

#[derive(Debug)]
pub struct MsanInterceptor {
    platform: Arc<Platform>,
    options: MsanOptions,
    shadows: ShadowRegistry,
    allocations: RwLock<BTreeMap<usize, Arc<MsanAllocInfo>>>,
    /// Largest allocation per context. Kernels get a zeroed shadow this big.
    clean_shadow_size: Mutex<HashMap<ContextHandle, usize>>,
    next_origin: AtomicU32,
}

impl MsanInterceptor {
    #[must_use]
    pub fn new(platform: Arc<Platform>, options: MsanOptions) -> Self {
        Self {
            platform,
            options,
            shadows: ShadowRegistry::new(ShadowKind::Memory),
            allocations: RwLock::new(BTreeMap::new()),
            clean_shadow_size: Mutex::new(HashMap::new()),
            next_origin: AtomicU32::new(1),
        }
    }

    /// Uses `shadow`, a [`ShadowKind::Memory`] host shadow, for CPU targets.
    #[must_use]
    pub fn with_host_shadow(self, shadow: Arc<HostShadow>) -> Self {
        if let Err(e) = self.shadows.set_host_shadow(shadow) {
            tracing::warn!("host shadow not installed: {e}");
        }
        self
    }

    #[must_use]
    pub const fn options(&self) -> &MsanOptions {
        &self.options
    }

    #[must_use]
    pub const fn platform(&self) -> &Arc<Platform> {
        &self.platform
    }

    #[must_use]
    pub fn shadow(&self, context: ContextHandle, family: DeviceFamily) -> Option<Arc<ShadowMemory>> {
        self.shadows.shadow(context, family)
    }

    pub fn remove_context_shadows(&self, context: ContextHandle) {
        self.shadows.remove_context(context);
        self.clean_shadow_size.lock().remove(&context);
    }

    const fn checks(&self, kind: UsmKind) -> bool {
        matches!(kind, UsmKind::Device) || self.options.check_host_and_shared
    }

    fn shadows_of(&self, context: &Context, info: &MsanAllocInfo) -> UsmResult<Vec<Arc<ShadowMemory>>> {
        let device = info.device.and_then(|d| context.find_device(d));
        self.shadows.shadows_for(context, device.as_ref())
    }

    // --- allocation ---

    /// Allocates `size` bytes and marks them uninitialised.
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
        let desc = UsmAllocDesc {
            alignment: desc.alignment.max(MSAN_ORIGIN_GRANULARITY),
            ..*desc
        };

        let ptr = usm_alloc(context, kind, device, &desc, pool, size)?;
        {
            let mut sizes = self.clean_shadow_size.lock();
            let clean = sizes.entry(context.handle()).or_default();
            *clean = (*clean).max(size);
        }

        let checked = self.checks(kind);
        let origin = if checked {
            Origin::heap(self.next_origin.fetch_add(1, Ordering::Relaxed), kind.into())
        } else {
            Origin::NONE
        };
        let info = Arc::new(MsanAllocInfo {
            alloc_begin: ptr,
            alloc_size: size,
            kind,
            context: context.handle(),
            device: device.map(|d| d.handle()),
            origin,
        });

        // Unchecked memory still gets a clean shadow so kernels read it as
        // initialised.
        let value = if checked { MSAN_UNINITIALIZED_MAGIC } else { 0 };
        let poisoned = self.shadows.shadows_for(context, device).and_then(|shadows| {
            shadows
                .iter()
                .filter(|shadow| shadow.covers(ptr))
                .try_for_each(|shadow| shadow.poison(ptr, size, value, Some(ptr)))
        });
        if let Err(e) = poisoned {
            tracing::error!(ptr = format_args!("0x{ptr:x}"), size, "failed to poison allocation: {e}");
            self.release_shadow(context, &info);
            if let Err(free) = usm_free(context, ptr) {
                tracing::warn!(ptr = format_args!("0x{ptr:x}"), "failed to free allocation: {free}");
            }
            return Err(e);
        }

        self.allocations.write().insert(ptr, info);
        tracing::trace!(
            ?kind,
            ptr = format_args!("0x{ptr:x}"),
            size,
            origin = origin.raw(),
            "memory-sanitized allocation"
        );
        Ok(ptr)
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

    fn release_shadow(&self, context: &Context, info: &MsanAllocInfo) {
        let shadows = match self.shadows_of(context, info) {
            Ok(shadows) => shadows,
            Err(e) => {
                tracing::warn!("failed to look up shadow: {e}");
                return;
            }
        };
        for shadow in shadows.iter().filter(|shadow| shadow.covers(info.alloc_begin)) {
            if let Err(e) = shadow.release(info.alloc_begin, info.alloc_size, info.alloc_begin) {
                tracing::warn!(ptr = format_args!("0x{:x}", info.alloc_begin), "failed to release shadow: {e}");
            }
        }
    }

    /// Frees an allocation made by [`Self::allocate`] and gives back its
    /// shadow pages.
    ///
    /// # Errors
    /// * `InvalidMemObject` if `ptr` is not the start of a live allocation of
    ///   `context`.
    /// * Errors of [`usm_free`].
    pub fn release(&self, context: &Context, ptr: usize) -> UsmResult<()> {
        let info = {
            let mut allocations = self.allocations.write();
            match allocations.get(&ptr) {
                Some(info) if info.context == context.handle() => allocations.remove(&ptr),
                _ => None,
            }
        };
        let Some(info) = info else {
            tracing::error!(ptr = format_args!("0x{ptr:x}"), "release of an unknown pointer");
            return Err(UsmError::InvalidMemObject(ptr));
        };

        self.release_shadow(context, &info);
        usm_free(context, ptr)
    }

    // --- shadow state ---

    fn write_shadow(&self, context: &Context, ptr: usize, size: usize, value: u8) -> UsmResult<()> {
        if size == 0 {
            return Ok(());
        }
        let info = self
            .find_alloc_info_by_address(ptr)
            .filter(|info| info.context == context.handle())
            .ok_or(UsmError::InvalidValue)?;
        let in_bounds = ptr.checked_add(size).is_some_and(|end| end <= info.alloc_end());
        if !in_bounds {
            return Err(UsmError::InvalidValue);
        }

        for shadow in self.shadows_of(context, &info)? {
            if shadow.covers(ptr) {
                shadow.poison(ptr, size, value, None)?;
            }
        }
        Ok(())
    }

    /// Marks `[ptr, ptr + size)` as written.
    ///
    /// The shadow covers two bytes per entry, so a range with an odd edge
    /// also clears its neighbour.
    ///
    /// # Errors
    /// * `InvalidValue` if the range is not inside one live allocation of
    ///   `context`.
    /// * Shadow errors.
    pub fn unpoison(&self, context: &Context, ptr: usize, size: usize) -> UsmResult<()> {
        self.write_shadow(context, ptr, size, 0)
    }

    /// Marks `[ptr, ptr + size)` as uninitialised again.
    ///
    /// # Errors
    /// See [`Self::unpoison`].
    pub fn poison(&self, context: &Context, ptr: usize, size: usize) -> UsmResult<()> {
        self.write_shadow(context, ptr, size, MSAN_UNINITIALIZED_MAGIC)
    }

    /// The first address in `[ptr, ptr + size)` that is not initialised.
    ///
    /// # Errors
    /// * `InvalidValue` if the range is not inside one live allocation of
    ///   `context`.
    /// * Shadow errors.
    pub fn first_uninitialized(&self, context: &Context, ptr: usize, size: usize) -> UsmResult<Option<usize>> {
        if size == 0 {
            return Ok(None);
        }
        let info = self
            .find_alloc_info_by_address(ptr)
            .filter(|info| info.context == context.handle())
            .ok_or(UsmError::InvalidValue)?;
        let end = ptr
            .checked_add(size)
            .filter(|&end| end <= info.alloc_end())
            .ok_or(UsmError::InvalidValue)?;

        let shadows = self.shadows_of(context, &info)?;
        let Some(shadow) = shadows.iter().find(|shadow| shadow.covers(ptr)) else {
            return Ok(None);
        };

        let first = ptr >> MSAN_SHADOW_SCALE;
        let last = (end - 1) >> MSAN_SHADOW_SCALE;
        let bytes = shadow.read(ptr, last - first + 1)?;
        Ok(bytes
            .iter()
            .position(|&b| b != 0)
            .map(|i| ((first + i) << MSAN_SHADOW_SCALE).max(ptr)))
    }

    /// # Errors
    /// See [`Self::first_uninitialized`].
    pub fn is_initialized(&self, context: &Context, ptr: usize, size: usize) -> UsmResult<bool> {
        Ok(self.first_uninitialized(context, ptr, size)?.is_none())
    }

    /// The allocation containing `addr`.
    #[must_use]
    pub fn find_alloc_info_by_address(&self, addr: usize) -> Option<Arc<MsanAllocInfo>> {
        self.allocations
            .read()
            .range(..=addr)
            .next_back()
            .filter(|(_, info)| info.contains(addr))
            .map(|(_, info)| Arc::clone(info))
    }

    /// The origin reported for uninitialised bytes at `addr`.
    #[must_use]
    pub fn origin_of(&self, addr: usize) -> Option<Origin> {
        self.find_alloc_info_by_address(addr)
            .map(|info| info.origin)
            .filter(|origin| !origin.is_none())
    }

    #[must_use]
    pub fn clean_shadow_size(&self, context: ContextHandle) -> usize {
        self.clean_shadow_size.lock().get(&context).copied().unwrap_or_default()
    }

    #[must_use]
    pub fn live_allocations(&self) -> usize {
        self.allocations.read().len()
    }
}
