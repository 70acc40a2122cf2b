//! Shadow memory for CPU and GPU targets.
//!
//! The host shadow is one flat anonymous mapping shared by the process. The
//! kernel provides its pages on first touch. Device shadows reserve a virtual
//! range per context and back it with physical pages on demand. Each backing
//! page remembers which allocations poisoned it and is unmapped when the last
//! of them is released.
//!
//! Address and memory sanitizing use the same machinery with different
//! [`ShadowKind`] layouts.

use super::{MSAN_SHADOW_SCALE, NULL_POINTER_REDZONE_MAGIC, SHADOW_SCALE};
use crate::error::{UsmError, UsmResult};
use crate::native::{
    ContextHandle, DeviceFamily, DeviceHandle, NativeDriver, PhysicalMemHandle, QueueHandle,
    VirtualAccess,
};
use crate::runtime::{Context, Device};
use crate::utils::{align_down, align_up};
use once_cell::sync::OnceCell;
use parking_lot::Mutex;
use std::collections::btree_map::Entry;
use std::collections::{BTreeMap, HashMap, HashSet};
use std::ptr;
use std::sync::Arc;

/// Application addresses covered by the process-wide host shadow.
pub const HOST_SHADOW_LIMIT: usize = 1 << 47;

pub const PVC_SHADOW_SIZE: usize = 0x1800_0000_0000;
pub const DG2_SHADOW_SIZE: usize = 0x1000_0000_0000;
pub const MSAN_PVC_SHADOW_SIZE: usize = 0x8000_0000_0000;
pub const MSAN_DG2_SHADOW_SIZE: usize = 0x4000_0000_0000;
const DEVICE_SHADOW_HALF: usize = 0x800_0000_0000;

static HOST_SHADOW: OnceCell<Arc<HostShadow>> = OnceCell::new();
static MSAN_HOST_SHADOW: OnceCell<Arc<HostShadow>> = OnceCell::new();

/// What the shadow bytes describe.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ShadowKind {
    /// One byte per eight application bytes: addressability and redzones.
    Address,
    /// One byte per two application bytes: initialisation state.
    Memory,
}

impl ShadowKind {
    #[must_use]
    pub const fn scale(self) -> u32 {
        match self {
            Self::Address => SHADOW_SCALE,
            Self::Memory => MSAN_SHADOW_SCALE,
        }
    }

    /// Size of the device reservation, `None` for CPU targets.
    #[must_use]
    pub const fn device_shadow_size(self, family: DeviceFamily) -> Option<usize> {
        match (self, family) {
            (_, DeviceFamily::Cpu) => None,
            (Self::Address, DeviceFamily::GpuPvc) => Some(PVC_SHADOW_SIZE),
            (Self::Address, DeviceFamily::GpuDg2) => Some(DG2_SHADOW_SIZE),
            (Self::Memory, DeviceFamily::GpuPvc) => Some(MSAN_PVC_SHADOW_SIZE),
            (Self::Memory, DeviceFamily::GpuDg2) => Some(MSAN_DG2_SHADOW_SIZE),
        }
    }
}

/// Shadow byte range `[begin, end)` relative to the shadow base.
const fn shadow_span(ptr: usize, size: usize, scale: u32) -> (usize, usize) {
    (ptr >> scale, ((ptr + size - 1) >> scale) + 1)
}

/// Folds a device address into a device shadow at `base`.
///
/// PVC and DG2 place device USM in the upper half of the address space with
/// different tag widths. Host and shared pointers map into the lower half.
#[must_use]
pub const fn device_mem_to_shadow(family: DeviceFamily, base: usize, ptr: usize) -> usize {
    match family {
        DeviceFamily::GpuPvc => {
            if ptr & 0xFF00_0000_0000_0000 != 0 {
                base + DEVICE_SHADOW_HALF + ((ptr & 0xFFFF_FFFF_FFFF) >> SHADOW_SCALE)
            } else {
                base + ((ptr & 0x7FFF_FFFF_FFFF) >> SHADOW_SCALE)
            }
        }
        DeviceFamily::GpuDg2 => {
            if ptr & 0xFFFF_0000_0000_0000 != 0 {
                base + DEVICE_SHADOW_HALF + ((ptr & 0x7FFF_FFFF_FFFF) >> SHADOW_SCALE)
            } else {
                base + (ptr >> SHADOW_SCALE)
            }
        }
        DeviceFamily::Cpu => base + (ptr >> SHADOW_SCALE),
    }
}

/// Whether the memory shadow of `family` describes `ptr`. PVC only tracks
/// device USM.
#[must_use]
pub const fn msan_covers(family: DeviceFamily, ptr: usize) -> bool {
    match family {
        DeviceFamily::GpuPvc => ptr & 0xFF00_0000_0000_0000 != 0,
        DeviceFamily::GpuDg2 | DeviceFamily::Cpu => true,
    }
}

/// Folds an address into a memory shadow at `base`.
#[must_use]
pub const fn msan_mem_to_shadow(family: DeviceFamily, base: usize, ptr: usize) -> usize {
    match family {
        DeviceFamily::GpuPvc => base + ((ptr & 0xFF_FFFF_FFFF) >> MSAN_SHADOW_SCALE),
        DeviceFamily::GpuDg2 => {
            if ptr & 0xFFFF_0000_0000_0000 != 0 {
                base + DEVICE_SHADOW_HALF + ((ptr & 0x7FFF_FFFF_FFFF) >> MSAN_SHADOW_SCALE)
            } else {
                base + (ptr >> MSAN_SHADOW_SCALE)
            }
        }
        DeviceFamily::Cpu => base + (ptr >> MSAN_SHADOW_SCALE),
    }
}

fn os_page_size() -> usize {
    // SAFETY: sysconf has no memory-safety preconditions.
    let page = unsafe { libc::sysconf(libc::_SC_PAGESIZE) };
    usize::try_from(page).unwrap_or(4096)
}

// ===============================================================================================
// Host Shadow
// ===============================================================================================

#[derive(Debug)]
pub struct HostShadow {
    kind: ShadowKind,
    base: usize,
    size: usize,
    limit: usize,
}

impl HostShadow {
    /// Maps an address shadow for application addresses below `limit` and
    /// poisons the null granule.
    ///
    /// # Errors
    /// Returns the OS error if the reservation fails.
    pub fn reserve(limit: usize) -> UsmResult<Self> {
        Self::reserve_for(ShadowKind::Address, limit)
    }

    /// # Errors
    /// Returns the OS error if the reservation fails.
    pub fn reserve_for(kind: ShadowKind, limit: usize) -> UsmResult<Self> {
        let size = align_up(limit >> kind.scale(), os_page_size());

        // SAFETY: a fresh anonymous mapping at a kernel-chosen address.
        let base = unsafe {
            libc::mmap(
                ptr::null_mut(),
                size,
                libc::PROT_READ | libc::PROT_WRITE,
                libc::MAP_PRIVATE | libc::MAP_ANONYMOUS | libc::MAP_NORESERVE,
                -1,
                0,
            )
        };
        if base == libc::MAP_FAILED {
            let err = std::io::Error::last_os_error();
            tracing::error!(size, "host shadow reservation failed: {err}");
            return Err(err.into());
        }

        #[cfg(target_os = "linux")]
        {
            // SAFETY: `base..base + size` is the mapping created above.
            if unsafe { libc::madvise(base, size, libc::MADV_DONTDUMP) } != 0 {
                tracing::warn!(
                    "failed to exclude host shadow from core dumps: {}",
                    std::io::Error::last_os_error()
                );
            }
        }

        let shadow = Self {
            kind,
            base: base as usize,
            size,
            limit,
        };
        if kind == ShadowKind::Address {
            shadow.poison(0, 1, NULL_POINTER_REDZONE_MAGIC)?;
        }
        tracing::debug!(
            ?kind,
            base = format_args!("0x{:x}", shadow.base),
            size,
            "host shadow reserved"
        );
        Ok(shadow)
    }

    /// The process-wide address shadow, reserved on first use.
    ///
    /// # Errors
    /// Returns the reservation error. A later call retries.
    pub fn global() -> UsmResult<Arc<Self>> {
        Self::global_for(ShadowKind::Address)
    }

    /// The process-wide host shadow of `kind`.
    ///
    /// # Errors
    /// Returns the reservation error. A later call retries.
    pub fn global_for(kind: ShadowKind) -> UsmResult<Arc<Self>> {
        let cell = match kind {
            ShadowKind::Address => &HOST_SHADOW,
            ShadowKind::Memory => &MSAN_HOST_SHADOW,
        };
        cell.get_or_try_init(|| Self::reserve_for(kind, HOST_SHADOW_LIMIT).map(Arc::new))
            .map(Arc::clone)
    }

    #[must_use]
    pub const fn kind(&self) -> ShadowKind {
        self.kind
    }

    #[must_use]
    pub const fn base(&self) -> usize {
        self.base
    }

    #[must_use]
    pub const fn size(&self) -> usize {
        self.size
    }

    #[must_use]
    pub const fn limit(&self) -> usize {
        self.limit
    }

    #[must_use]
    pub const fn mem_to_shadow(&self, ptr: usize) -> usize {
        self.base + (ptr >> self.kind.scale())
    }

    fn check_bounds(&self, ptr: usize, size: usize) -> UsmResult<()> {
        match ptr.checked_add(size) {
            Some(end) if end <= self.limit => Ok(()),
            _ => Err(UsmError::InvalidValue),
        }
    }

    /// # Errors
    /// `InvalidValue` if the range lies beyond the covered limit.
    pub fn poison(&self, ptr: usize, size: usize, value: u8) -> UsmResult<()> {
        if size == 0 {
            return Ok(());
        }
        self.check_bounds(ptr, size)?;
        let (begin, end) = shadow_span(ptr, size, self.kind.scale());
        // SAFETY: the bounds check keeps the span inside the mapping.
        unsafe {
            ptr::write_bytes((self.base + begin) as *mut u8, value, end - begin);
        }
        Ok(())
    }

    /// Copies `len` shadow bytes starting at the shadow of `ptr`.
    ///
    /// # Errors
    /// `InvalidValue` if the range lies beyond the covered limit.
    pub fn read(&self, ptr: usize, len: usize) -> UsmResult<Vec<u8>> {
        let begin = ptr >> self.kind.scale();
        if begin + len > self.size {
            return Err(UsmError::InvalidValue);
        }
        let mut out = vec![0u8; len];
        // SAFETY: `begin + len` is inside the mapping.
        unsafe {
            ptr::copy_nonoverlapping((self.base + begin) as *const u8, out.as_mut_ptr(), len);
        }
        Ok(out)
    }
}

impl Drop for HostShadow {
    fn drop(&mut self) {
        // SAFETY: the mapping is owned by `self` and no longer referenced.
        if unsafe { libc::munmap(self.base as *mut libc::c_void, self.size) } != 0 {
            tracing::warn!(
                "failed to unmap host shadow: {}",
                std::io::Error::last_os_error()
            );
        }
    }
}

// ===============================================================================================
// Device Shadow
// ===============================================================================================

#[derive(Debug)]
struct ShadowPage {
    physical: PhysicalMemHandle,
    /// Allocations whose shadow bytes live on this page.
    owners: HashSet<usize>,
}

/// Shadow of one context on one GPU family.
#[derive(Debug)]
pub struct DeviceShadow {
    driver: Arc<dyn NativeDriver>,
    context: ContextHandle,
    device: DeviceHandle,
    kind: ShadowKind,
    family: DeviceFamily,
    base: usize,
    size: usize,
    granularity: usize,
    queue: QueueHandle,
    pages: Mutex<BTreeMap<usize, ShadowPage>>,
}

impl DeviceShadow {
    /// Reserves an address shadow and poisons the null granule.
    ///
    /// # Errors
    /// * `InvalidArgument` for CPU targets.
    /// * Driver errors reserving the range or creating the queue.
    pub fn setup(
        driver: Arc<dyn NativeDriver>,
        context: ContextHandle,
        device: DeviceHandle,
        family: DeviceFamily,
    ) -> UsmResult<Self> {
        Self::setup_for(ShadowKind::Address, driver, context, device, family)
    }

    /// # Errors
    /// See [`Self::setup`].
    pub fn setup_for(
        kind: ShadowKind,
        driver: Arc<dyn NativeDriver>,
        context: ContextHandle,
        device: DeviceHandle,
        family: DeviceFamily,
    ) -> UsmResult<Self> {
        let size = kind
            .device_shadow_size(family)
            .ok_or(UsmError::InvalidArgument("CPU targets use the host shadow"))?;

        // 1. Reserve the virtual range
        let base = driver.virtual_mem_reserve(context, size)?;

        // 2. Page size and a queue for fills
        let setup = driver
            .virtual_mem_granularity(context, Some(device))
            .and_then(|granularity| {
                driver
                    .queue_create(context, device)
                    .map(|queue| (granularity, queue))
            });
        let (granularity, queue) = match setup {
            Ok(setup) => setup,
            Err(e) => {
                if let Err(free) = driver.virtual_mem_free(context, base, size) {
                    tracing::warn!("failed to free shadow reservation: {free}");
                }
                return Err(e);
            }
        };

        let shadow = Self {
            driver,
            context,
            device,
            kind,
            family,
            base,
            size,
            granularity,
            queue,
            pages: Mutex::new(BTreeMap::new()),
        };

        // 3. Null pointer guard
        if kind == ShadowKind::Address {
            shadow.poison(0, 1, NULL_POINTER_REDZONE_MAGIC, None)?;
        }

        tracing::debug!(
            context = %context,
            ?kind,
            ?family,
            base = format_args!("0x{base:x}"),
            size,
            "device shadow reserved"
        );
        Ok(shadow)
    }

    #[must_use]
    pub const fn kind(&self) -> ShadowKind {
        self.kind
    }

    #[must_use]
    pub const fn family(&self) -> DeviceFamily {
        self.family
    }

    #[must_use]
    pub const fn base(&self) -> usize {
        self.base
    }

    #[must_use]
    pub const fn size(&self) -> usize {
        self.size
    }

    #[must_use]
    pub const fn mem_to_shadow(&self, ptr: usize) -> usize {
        match self.kind {
            ShadowKind::Address => device_mem_to_shadow(self.family, self.base, ptr),
            ShadowKind::Memory => msan_mem_to_shadow(self.family, self.base, ptr),
        }
    }

    /// Whether this shadow describes `ptr` at all.
    #[must_use]
    pub const fn covers(&self, ptr: usize) -> bool {
        match self.kind {
            ShadowKind::Address => true,
            ShadowKind::Memory => msan_covers(self.family, ptr),
        }
    }

    /// The shadow span of `[ptr, ptr + size)`, which must fold into the
    /// reservation as one run.
    fn shadow_range(&self, ptr: usize, size: usize) -> UsmResult<(usize, usize)> {
        let last = ptr.checked_add(size - 1).ok_or(UsmError::InvalidValue)?;
        let (begin, end) = (self.mem_to_shadow(ptr), self.mem_to_shadow(last) + 1);
        self.check_span(begin, end)?;
        Ok((begin, end))
    }

    fn check_span(&self, begin: usize, end: usize) -> UsmResult<()> {
        if begin < self.base || begin >= end || end > self.base + self.size {
            tracing::error!(
                begin = format_args!("0x{begin:x}"),
                end = format_args!("0x{end:x}"),
                "shadow span outside the reservation"
            );
            return Err(UsmError::InvalidValue);
        }
        Ok(())
    }

    /// Number of backing pages currently mapped.
    #[must_use]
    pub fn mapped_pages(&self) -> usize {
        self.pages.lock().len()
    }

    /// `true` if the shadow byte of `ptr` is backed.
    #[must_use]
    pub fn is_backed(&self, ptr: usize) -> bool {
        let page = align_down(self.mem_to_shadow(ptr), self.granularity);
        self.pages.lock().contains_key(&page)
    }

    fn map_page(&self, page: usize) -> UsmResult<ShadowPage> {
        let physical = self
            .driver
            .physical_mem_create(self.context, self.device, self.granularity)?;

        if let Err(e) = self.driver.virtual_mem_map(
            self.context,
            page,
            self.granularity,
            physical,
            0,
            VirtualAccess::ReadWrite,
        ) {
            tracing::error!(page = format_args!("0x{page:x}"), "failed to map shadow page: {e}");
            if let Err(release) = self.driver.physical_mem_release(physical) {
                tracing::warn!("failed to release physical memory: {release}");
            }
            return Err(e);
        }

        if let Err(e) = self
            .driver
            .enqueue_fill_blocking(self.queue, page, 0, self.granularity)
        {
            if let Err(unmap) = self.unmap_page(page, physical) {
                tracing::warn!("failed to unmap shadow page: {unmap}");
            }
            return Err(e);
        }

        tracing::debug!(page = format_args!("0x{page:x}"), "shadow page mapped");
        Ok(ShadowPage {
            physical,
            owners: HashSet::new(),
        })
    }

    fn unmap_page(&self, page: usize, physical: PhysicalMemHandle) -> UsmResult<()> {
        self.driver
            .virtual_mem_unmap(self.context, page, self.granularity)?;
        self.driver.physical_mem_release(physical)?;
        tracing::debug!(page = format_args!("0x{page:x}"), "shadow page unmapped");
        Ok(())
    }

    /// Writes `value` over the shadow of `[ptr, ptr + size)`, backing any
    /// missing page first. `owner` is recorded on every touched page.
    ///
    /// A failure leaves pages mapped earlier in the call in place.
    ///
    /// # Errors
    /// * `InvalidValue` if the range folds outside the shadow reservation.
    /// * The driver error creating, mapping or filling a page.
    pub fn poison(&self, ptr: usize, size: usize, value: u8, owner: Option<usize>) -> UsmResult<()> {
        if size == 0 {
            return Ok(());
        }
        let (begin, end) = self.shadow_range(ptr, size)?;

        let mut pages = self.pages.lock();
        let mut page = align_down(begin, self.granularity);
        while page < end {
            let entry = match pages.entry(page) {
                Entry::Occupied(entry) => entry.into_mut(),
                Entry::Vacant(entry) => entry.insert(self.map_page(page)?),
            };
            if let Some(owner) = owner {
                entry.owners.insert(owner);
            }
            page += self.granularity;
        }

        self.driver
            .enqueue_fill_blocking(self.queue, begin, value, end - begin)
    }

    /// Drops `owner` from the pages under `[ptr, ptr + size)` and reclaims
    /// the ones nobody else uses.
    ///
    /// # Errors
    /// * `InvalidValue` if the range folds outside the shadow reservation.
    /// * The driver error unmapping or releasing a page.
    pub fn release(&self, ptr: usize, size: usize, owner: usize) -> UsmResult<()> {
        if size == 0 {
            return Ok(());
        }
        let (begin, end) = self.shadow_range(ptr, size)?;

        let mut pages = self.pages.lock();
        let mut page = align_down(begin, self.granularity);
        while page < end {
            let reclaim = pages
                .get_mut(&page)
                .is_some_and(|entry| entry.owners.remove(&owner) && entry.owners.is_empty());
            if reclaim {
                if let Some(entry) = pages.remove(&page) {
                    self.unmap_page(page, entry.physical)?;
                }
            }
            page += self.granularity;
        }
        Ok(())
    }

    /// Copies `len` shadow bytes starting at the shadow of `ptr`.
    ///
    /// # Errors
    /// `InvalidValue` past the reservation, otherwise the driver error,
    /// including reads of unbacked pages.
    pub fn read(&self, ptr: usize, len: usize) -> UsmResult<Vec<u8>> {
        let begin = self.mem_to_shadow(ptr);
        if len > 0 {
            self.check_span(begin, begin.checked_add(len).ok_or(UsmError::InvalidValue)?)?;
        }
        let mut out = vec![0u8; len];
        self.driver.enqueue_copy_blocking(self.queue, &mut out, begin)?;
        Ok(out)
    }
}

impl Drop for DeviceShadow {
    fn drop(&mut self) {
        let pages = std::mem::take(self.pages.get_mut());
        for (page, entry) in pages {
            if let Err(e) = self.unmap_page(page, entry.physical) {
                tracing::warn!(page = format_args!("0x{page:x}"), "failed to reclaim shadow page: {e}");
            }
        }
        if let Err(e) = self.driver.virtual_mem_free(self.context, self.base, self.size) {
            tracing::warn!(context = %self.context, "failed to free shadow reservation: {e}");
        }
        if let Err(e) = self.driver.queue_release(self.queue) {
            tracing::warn!(context = %self.context, "failed to release shadow queue: {e}");
        }
    }
}

// ===============================================================================================
// Dispatch
// ===============================================================================================

/// The shadow used for one target.
#[derive(Debug)]
pub enum ShadowMemory {
    Cpu(Arc<HostShadow>),
    Gpu(DeviceShadow),
}

impl ShadowMemory {
    #[must_use]
    pub fn mem_to_shadow(&self, ptr: usize) -> usize {
        match self {
            Self::Cpu(shadow) => shadow.mem_to_shadow(ptr),
            Self::Gpu(shadow) => shadow.mem_to_shadow(ptr),
        }
    }

    /// # Errors
    /// See [`HostShadow::poison`] and [`DeviceShadow::poison`].
    pub fn poison(&self, ptr: usize, size: usize, value: u8, owner: Option<usize>) -> UsmResult<()> {
        match self {
            Self::Cpu(shadow) => shadow.poison(ptr, size, value),
            Self::Gpu(shadow) => shadow.poison(ptr, size, value, owner),
        }
    }

    /// Host shadow pages are never reclaimed.
    ///
    /// # Errors
    /// See [`DeviceShadow::release`].
    pub fn release(&self, ptr: usize, size: usize, owner: usize) -> UsmResult<()> {
        match self {
            Self::Cpu(_) => Ok(()),
            Self::Gpu(shadow) => shadow.release(ptr, size, owner),
        }
    }

    /// # Errors
    /// See [`HostShadow::read`] and [`DeviceShadow::read`].
    pub fn read(&self, ptr: usize, len: usize) -> UsmResult<Vec<u8>> {
        match self {
            Self::Cpu(shadow) => shadow.read(ptr, len),
            Self::Gpu(shadow) => shadow.read(ptr, len),
        }
    }

    #[must_use]
    pub const fn covers(&self, ptr: usize) -> bool {
        match self {
            Self::Cpu(_) => true,
            Self::Gpu(shadow) => shadow.covers(ptr),
        }
    }

    #[must_use]
    pub const fn as_device(&self) -> Option<&DeviceShadow> {
        match self {
            Self::Cpu(_) => None,
            Self::Gpu(shadow) => Some(shadow),
        }
    }
}

// ===============================================================================================
// Registry
// ===============================================================================================

/// Lazily created shadows of one kind, one per (context, target family).
#[derive(Debug)]
pub struct ShadowRegistry {
    kind: ShadowKind,
    host: OnceCell<Arc<HostShadow>>,
    shadows: Mutex<HashMap<(ContextHandle, DeviceFamily), Arc<ShadowMemory>>>,
}

impl ShadowRegistry {
    #[must_use]
    pub fn new(kind: ShadowKind) -> Self {
        Self {
            kind,
            host: OnceCell::new(),
            shadows: Mutex::new(HashMap::new()),
        }
    }

    /// Uses `shadow` for CPU targets instead of the process-wide one.
    ///
    /// # Errors
    /// `InvalidArgument` if `shadow` is of another kind or a host shadow is
    /// already in use.
    pub fn set_host_shadow(&self, shadow: Arc<HostShadow>) -> UsmResult<()> {
        if shadow.kind() != self.kind {
            return Err(UsmError::InvalidArgument("host shadow of another kind"));
        }
        self.host
            .set(shadow)
            .map_err(|_| UsmError::InvalidArgument("host shadow already in use"))
    }

    #[must_use]
    pub const fn kind(&self) -> ShadowKind {
        self.kind
    }

    fn host_shadow(&self) -> UsmResult<Arc<HostShadow>> {
        let kind = self.kind;
        self.host
            .get_or_try_init(|| HostShadow::global_for(kind))
            .map(Arc::clone)
    }

    /// The shadow of `context` for the family of `device`, set up on first use.
    ///
    /// # Errors
    /// Returns the error reserving the shadow.
    pub fn shadow_for(&self, context: &Context, device: &Arc<Device>) -> UsmResult<Arc<ShadowMemory>> {
        let family = device.family();
        let key = (context.handle(), family);

        let mut shadows = self.shadows.lock();
        if let Some(shadow) = shadows.get(&key) {
            return Ok(Arc::clone(shadow));
        }

        let shadow = if family.is_gpu() {
            // Backing pages come from a device the context was created with.
            let owner = context
                .devices()
                .iter()
                .find(|d| d.family() == family)
                .unwrap_or(device);
            ShadowMemory::Gpu(DeviceShadow::setup_for(
                self.kind,
                Arc::clone(context.driver()),
                context.handle(),
                owner.handle(),
                family,
            )?)
        } else {
            ShadowMemory::Cpu(self.host_shadow()?)
        };

        let shadow = Arc::new(shadow);
        shadows.insert(key, Arc::clone(&shadow));
        Ok(shadow)
    }

    /// An existing shadow, without creating one.
    #[must_use]
    pub fn shadow(&self, context: ContextHandle, family: DeviceFamily) -> Option<Arc<ShadowMemory>> {
        self.shadows.lock().get(&(context, family)).map(Arc::clone)
    }

    /// The shadows describing memory of `device`. Host memory is visible to
    /// every device of the context, so it is shadowed once per family.
    ///
    /// # Errors
    /// Returns the error reserving a shadow.
    pub fn shadows_for(&self, context: &Context, device: Option<&Arc<Device>>) -> UsmResult<Vec<Arc<ShadowMemory>>> {
        if let Some(device) = device {
            return Ok(vec![self.shadow_for(context, device)?]);
        }
        let mut families = HashSet::new();
        context
            .devices()
            .iter()
            .filter(|d| families.insert(d.family()))
            .map(|d| self.shadow_for(context, d))
            .collect()
    }

    /// Drops the shadows of `context`.
    pub fn remove_context(&self, context: ContextHandle) {
        self.shadows.lock().retain(|&(owner, _), _| owner != context);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::native::mock::MockDriver;

    fn gpu_shadow(family: DeviceFamily) -> (Arc<MockDriver>, DeviceShadow) {
        let driver = MockDriver::builder().gpu(family, 0).build();
        let device = driver.devices()[0];
        let context = driver.context_create(&[device]).unwrap();
        let shadow =
            DeviceShadow::setup(Arc::clone(&driver) as Arc<dyn NativeDriver>, context, device, family)
                .unwrap();
        (driver, shadow)
    }

    #[test]
    fn test_device_folding() {
        let base = 0x2000_0000_0000;
        let device_ptr = 0xFF00_0000_1000_0000;
        assert_eq!(
            device_mem_to_shadow(DeviceFamily::GpuPvc, base, device_ptr),
            base + 0x800_0000_0000 + (0x1000_0000 >> 3)
        );
        assert_eq!(
            device_mem_to_shadow(DeviceFamily::GpuPvc, base, 0x8000_1000_0000),
            base + (0x1000_0000 >> 3)
        );
        assert_eq!(
            device_mem_to_shadow(DeviceFamily::GpuDg2, base, 0xFFFF_8000_0000_0040),
            base + 0x800_0000_0000 + 8
        );
        assert_eq!(device_mem_to_shadow(DeviceFamily::GpuDg2, base, 0x4000), base + 0x800);
    }

    #[test]
    fn test_null_granule_is_poisoned() {
        let (_driver, shadow) = gpu_shadow(DeviceFamily::GpuPvc);
        assert_eq!(shadow.mapped_pages(), 1);
        assert_eq!(shadow.read(0, 2).unwrap(), [NULL_POINTER_REDZONE_MAGIC, 0]);
    }

    #[test]
    fn test_pages_are_reclaimed_with_last_owner() {
        let (driver, shadow) = gpu_shadow(DeviceFamily::GpuDg2);
        let a = 0x1000_0000;
        let b = a + 256;

        shadow.poison(a, 128, 0x81, Some(a)).unwrap();
        shadow.poison(b, 128, 0x81, Some(b)).unwrap();
        assert_eq!(shadow.mapped_pages(), 2);
        assert_eq!(shadow.read(a, 2).unwrap(), [0x81, 0x81]);

        shadow.release(a, 128, a).unwrap();
        assert!(shadow.is_backed(b));

        shadow.release(b, 128, b).unwrap();
        assert!(!shadow.is_backed(b));
        assert_eq!(shadow.mapped_pages(), 1);

        drop(shadow);
        assert_eq!(driver.mapped_pages(), 0);
        assert_eq!(driver.reservations(), 0);
    }

    #[test]
    fn test_fresh_page_is_zeroed() {
        let (_driver, shadow) = gpu_shadow(DeviceFamily::GpuPvc);
        let ptr = 0x2000_0000;
        shadow.poison(ptr, 16, 0x82, Some(ptr)).unwrap();
        assert_eq!(shadow.read(ptr, 4).unwrap(), [0x82, 0x82, 0, 0]);
    }

    #[test]
    fn test_page_creation_failure_is_propagated() {
        let (driver, shadow) = gpu_shadow(DeviceFamily::GpuPvc);
        driver.context_destroy(shadow.context).unwrap();

        let ptr = 0x3000_0000;
        assert!(matches!(
            shadow.poison(ptr, 64, 0x81, Some(ptr)),
            Err(UsmError::InvalidDevice)
        ));
        assert_eq!(shadow.mapped_pages(), 1);
        assert!(!shadow.is_backed(ptr));
    }

    #[test]
    fn test_span_outside_reservation_is_rejected() {
        let (driver, shadow) = gpu_shadow(DeviceFamily::GpuDg2);
        let maps = driver.stats().maps;

        // Below the high bits DG2 shadows `ptr >> 3` unmasked.
        let past_end = 0x8000_0000_0000;
        assert!(matches!(
            shadow.poison(past_end, 64, 0x81, Some(past_end)),
            Err(UsmError::InvalidValue)
        ));
        assert!(matches!(shadow.read(past_end, 8), Err(UsmError::InvalidValue)));
        assert!(matches!(
            shadow.poison(usize::MAX - 15, 32, 0x81, None),
            Err(UsmError::InvalidValue)
        ));
        assert!(matches!(shadow.release(past_end, 64, past_end), Err(UsmError::InvalidValue)));

        assert_eq!(driver.stats().maps, maps);
        assert_eq!(shadow.mapped_pages(), 1);
    }

    #[test]
    fn test_memory_shadow_layouts() {
        assert_eq!(ShadowKind::Memory.scale(), 1);
        assert_eq!(
            ShadowKind::Memory.device_shadow_size(DeviceFamily::GpuDg2),
            Some(MSAN_DG2_SHADOW_SIZE)
        );
        assert_eq!(ShadowKind::Memory.device_shadow_size(DeviceFamily::Cpu), None);
        assert!(msan_covers(DeviceFamily::GpuPvc, 0xFF00_0000_1000_0000));
        assert!(!msan_covers(DeviceFamily::GpuPvc, 0x1000_0000));
        assert!(msan_covers(DeviceFamily::GpuDg2, 0x1000_0000));
    }

    #[test]
    fn test_memory_shadow_has_no_null_guard() {
        let driver = MockDriver::builder().gpu(DeviceFamily::GpuPvc, 0).build();
        let device = driver.devices()[0];
        let context = driver.context_create(&[device]).unwrap();
        let shadow = DeviceShadow::setup_for(
            ShadowKind::Memory,
            Arc::clone(&driver) as Arc<dyn NativeDriver>,
            context,
            device,
            DeviceFamily::GpuPvc,
        )
        .unwrap();
        assert_eq!(shadow.kind(), ShadowKind::Memory);
        assert_eq!(shadow.size(), MSAN_PVC_SHADOW_SIZE);
        assert_eq!(shadow.mapped_pages(), 0);

        let ptr = 0xFFFF_0000_1000_0000;
        assert_eq!(shadow.mem_to_shadow(ptr), shadow.base() + 0x800_0000);
        shadow.poison(ptr, 8, 0xff, Some(ptr)).unwrap();
        assert_eq!(shadow.read(ptr, 5).unwrap(), [0xff, 0xff, 0xff, 0xff, 0]);
    }

    #[test]
    fn test_memory_host_shadow_halves_addresses() {
        let shadow = HostShadow::reserve_for(ShadowKind::Memory, 1 << 36).unwrap();
        assert_eq!(shadow.mem_to_shadow(0x4000), shadow.base() + 0x2000);
        assert_eq!(shadow.read(0, 1).unwrap(), [0]);

        shadow.poison(0x1000_0000, 6, 0xff).unwrap();
        assert_eq!(shadow.read(0x1000_0000, 4).unwrap(), [0xff, 0xff, 0xff, 0]);
    }

    #[test]
    fn test_release_of_unknown_owner_keeps_pages() {
        let (_driver, shadow) = gpu_shadow(DeviceFamily::GpuPvc);
        let ptr = 0x3000_0000;
        shadow.poison(ptr, 64, 0x81, Some(ptr)).unwrap();
        shadow.release(ptr, 64, ptr + 64).unwrap();
        assert!(shadow.is_backed(ptr));
        shadow.release(0, 1, 0).unwrap();
        assert_eq!(shadow.mapped_pages(), 2);
    }

    #[test]
    fn test_cpu_family_uses_host_shadow() {
        let driver = MockDriver::builder().cpu().build();
        let device = driver.devices()[0];
        let context = driver.context_create(&[device]).unwrap();
        assert!(matches!(
            DeviceShadow::setup(driver, context, device, DeviceFamily::Cpu),
            Err(UsmError::InvalidArgument(_))
        ));
    }

    #[test]
    fn test_host_shadow_poison_and_read() {
        let shadow = HostShadow::reserve(1 << 36).unwrap();
        assert_eq!(shadow.read(0, 1).unwrap(), [NULL_POINTER_REDZONE_MAGIC]);

        shadow.poison(0x1000_0000, 32, 0x82).unwrap();
        shadow.poison(0x1000_0008, 8, 0).unwrap();
        assert_eq!(shadow.read(0x1000_0000, 5).unwrap(), [0x82, 0, 0x82, 0x82, 0]);

        assert!(matches!(
            shadow.poison(1 << 36, 8, 0x82),
            Err(UsmError::InvalidValue)
        ));
    }
}
