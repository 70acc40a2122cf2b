//! An in-process driver for tests and demos.
//!
//! Addresses come from three apertures (host/shared, device and virtual
//! reservations) that never overlap. Physical memory objects carry real byte
//! storage so fills through mapped virtual ranges can be read back.

use super::aperture::{Aperture, ApertureAllocator};
use super::{
    ContextHandle, DeviceFamily, DeviceHandle, IPC_HANDLE_SIZE, NativeAllocProperties,
    NativeAllocRequest, NativeDeviceId, NativeDriver, NativeIpcHandle, PhysicalMemHandle,
    QueueHandle, UsmKind, VirtualAccess,
};
use crate::error::{UsmError, UsmResult};
use crate::utils::{KIB, align_down, align_up, is_valid_alignment};
use parking_lot::Mutex;
use std::collections::{BTreeMap, HashMap, HashSet};
use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};

const HOST_APERTURE_BASE: usize = 0x1000_0000;
const HOST_APERTURE_LIMIT: usize = 0x10_0000_0000;
// High bits set, as device USM pointers are on real hardware.
const DEVICE_APERTURE_BASE: usize = 0xFFFF_0000_1000_0000;
const DEVICE_APERTURE_LIMIT: usize = 0xFFFF_0010_0000_0000;
const RESERVE_APERTURE_BASE: usize = 0x2000_0000_0000;
const RESERVE_APERTURE_LIMIT: usize = 0xF000_0000_0000;

pub const DEFAULT_PAGE_SIZE: usize = 4 * KIB;
pub const DEFAULT_GRANULARITY: usize = 64 * KIB;

/// Call counters, snapshotted by [`MockDriver::stats`].
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct MockStats {
    pub allocs: usize,
    pub frees: usize,
    pub resident_calls: usize,
    pub fills: usize,
    pub copies: usize,
    pub reserves: usize,
    pub maps: usize,
    pub unmaps: usize,
    pub physical_creates: usize,
    pub physical_releases: usize,
    pub ipc_opens: usize,
    pub ipc_closes: usize,
}

#[derive(Debug)]
struct MockDevice {
    handle: DeviceHandle,
    native_id: NativeDeviceId,
    family: DeviceFamily,
    sub_devices: Vec<DeviceHandle>,
}

#[derive(Debug)]
struct MockAllocation {
    va: usize,
    kind: UsmKind,
    /// Device memory of a GPU, carved from the device aperture.
    on_device_aperture: bool,
    device: Option<DeviceHandle>,
    size: usize,
}

#[derive(Debug)]
struct Physical {
    bytes: Vec<u8>,
}

#[derive(Debug, Clone, Copy)]
struct Mapping {
    physical: PhysicalMemHandle,
    offset: usize,
    access: VirtualAccess,
}

#[derive(Debug)]
struct MockState {
    contexts: HashMap<ContextHandle, Vec<DeviceHandle>>,
    host_aperture: Aperture,
    device_aperture: Aperture,
    reserve_aperture: Aperture,
    allocations: BTreeMap<usize, MockAllocation>,
    reservations: BTreeMap<usize, usize>,
    physical: HashMap<PhysicalMemHandle, Physical>,
    // Granularity-aligned page -> backing
    mappings: BTreeMap<usize, Mapping>,
    queues: HashMap<QueueHandle, ContextHandle>,
    resident: HashMap<usize, Vec<DeviceHandle>>,
    opened_ipc: HashMap<usize, usize>,
    denied_peers: HashSet<(DeviceHandle, DeviceHandle)>,
    pending_alloc_failure: Option<UsmError>,
    pending_residency_failure: Option<UsmError>,
    misalign_next: bool,
    unloaded: bool,
    stats: MockStats,
}

/// Builder for [`MockDriver`] topologies.
#[derive(Debug, Clone)]
pub struct MockDriverBuilder {
    devices: Vec<(DeviceFamily, usize)>,
    page_size: usize,
    granularity: usize,
    ipc_put_supported: bool,
}

impl Default for MockDriverBuilder {
    fn default() -> Self {
        Self {
            devices: Vec::new(),
            page_size: DEFAULT_PAGE_SIZE,
            granularity: DEFAULT_GRANULARITY,
            ipc_put_supported: false,
        }
    }
}

impl MockDriverBuilder {
    /// Adds a root GPU with `sub_devices` partitions.
    #[must_use]
    pub fn gpu(mut self, family: DeviceFamily, sub_devices: usize) -> Self {
        self.devices.push((family, sub_devices));
        self
    }

    #[must_use]
    pub fn cpu(mut self) -> Self {
        self.devices.push((DeviceFamily::Cpu, 0));
        self
    }

    #[must_use]
    pub const fn page_size(mut self, page_size: usize) -> Self {
        self.page_size = page_size;
        self
    }

    #[must_use]
    pub const fn granularity(mut self, granularity: usize) -> Self {
        self.granularity = granularity;
        self
    }

    #[must_use]
    pub const fn ipc_put_supported(mut self, supported: bool) -> Self {
        self.ipc_put_supported = supported;
        self
    }

    #[must_use]
    pub fn build(self) -> Arc<MockDriver> {
        let mut devices = Vec::new();
        let mut roots = Vec::new();
        let mut next_handle = 0x100;

        for (index, &(family, sub_count)) in self.devices.iter().enumerate() {
            let native_id = NativeDeviceId(index as u64 + 1);
            let root = DeviceHandle(next_handle);
            next_handle += 1;

            let sub_devices: Vec<DeviceHandle> = (0..sub_count)
                .map(|_| {
                    let handle = DeviceHandle(next_handle);
                    next_handle += 1;
                    handle
                })
                .collect();

            devices.extend(sub_devices.iter().map(|&handle| MockDevice {
                handle,
                native_id,
                family,
                sub_devices: Vec::new(),
            }));
            devices.push(MockDevice {
                handle: root,
                native_id,
                family,
                sub_devices,
            });
            roots.push(root);
        }

        let page_size = self.page_size;
        Arc::new(MockDriver {
            devices,
            roots,
            page_size,
            granularity: self.granularity,
            ipc_put_supported: self.ipc_put_supported,
            next_handle: AtomicU64::new(1),
            state: Mutex::new(MockState {
                contexts: HashMap::new(),
                host_aperture: Aperture::new(HOST_APERTURE_BASE, HOST_APERTURE_LIMIT, page_size, 0),
                device_aperture: Aperture::new(
                    DEVICE_APERTURE_BASE,
                    DEVICE_APERTURE_LIMIT,
                    page_size,
                    0,
                ),
                reserve_aperture: Aperture::new(
                    RESERVE_APERTURE_BASE,
                    RESERVE_APERTURE_LIMIT,
                    self.granularity,
                    0,
                ),
                allocations: BTreeMap::new(),
                reservations: BTreeMap::new(),
                physical: HashMap::new(),
                mappings: BTreeMap::new(),
                queues: HashMap::new(),
                resident: HashMap::new(),
                opened_ipc: HashMap::new(),
                denied_peers: HashSet::new(),
                pending_alloc_failure: None,
                pending_residency_failure: None,
                misalign_next: false,
                unloaded: false,
                stats: MockStats::default(),
            }),
        })
    }
}

#[derive(Debug)]
pub struct MockDriver {
    devices: Vec<MockDevice>,
    roots: Vec<DeviceHandle>,
    page_size: usize,
    granularity: usize,
    ipc_put_supported: bool,
    next_handle: AtomicU64,
    state: Mutex<MockState>,
}

impl MockDriver {
    #[must_use]
    pub fn builder() -> MockDriverBuilder {
        MockDriverBuilder::default()
    }

    #[must_use]
    pub const fn page_size(&self) -> usize {
        self.page_size
    }

    #[must_use]
    pub const fn granularity(&self) -> usize {
        self.granularity
    }

    #[must_use]
    pub fn stats(&self) -> MockStats {
        self.state.lock().stats
    }

    /// The next `mem_alloc` fails with `error`.
    pub fn inject_alloc_failure(&self, error: UsmError) {
        self.state.lock().pending_alloc_failure = Some(error);
    }

    /// The next `make_memory_resident` fails with `error`.
    pub fn inject_residency_failure(&self, error: UsmError) {
        self.state.lock().pending_residency_failure = Some(error);
    }

    /// The next allocation is returned 8 bytes past its aligned start.
    pub fn misalign_next_alloc(&self) {
        self.state.lock().misalign_next = true;
    }

    /// Simulates the native runtime being torn down.
    pub fn set_unloaded(&self, unloaded: bool) {
        self.state.lock().unloaded = unloaded;
    }

    pub fn deny_peer_access(&self, device: DeviceHandle, peer: DeviceHandle) {
        self.state.lock().denied_peers.insert((device, peer));
    }

    #[must_use]
    pub fn live_allocations(&self) -> usize {
        self.state.lock().allocations.len()
    }

    #[must_use]
    pub fn is_live(&self, ptr: usize) -> bool {
        self.state.lock().allocations.contains_key(&ptr)
    }

    #[must_use]
    pub fn is_mapped(&self, addr: usize) -> bool {
        let page = align_down(addr, self.granularity);
        self.state.lock().mappings.contains_key(&page)
    }

    #[must_use]
    pub fn mapped_pages(&self) -> usize {
        self.state.lock().mappings.len()
    }

    #[must_use]
    pub fn reservations(&self) -> usize {
        self.state.lock().reservations.len()
    }

    /// Devices `ptr` was made resident on, in call order.
    #[must_use]
    pub fn resident_devices(&self, ptr: usize) -> Vec<DeviceHandle> {
        self.state.lock().resident.get(&ptr).cloned().unwrap_or_default()
    }

    fn device(&self, handle: DeviceHandle) -> Option<&MockDevice> {
        self.devices.iter().find(|d| d.handle == handle)
    }

    fn next_id(&self) -> u64 {
        self.next_handle.fetch_add(1, Ordering::Relaxed)
    }

    fn context_has_device(state: &MockState, context: ContextHandle, device: DeviceHandle) -> bool {
        state
            .contexts
            .get(&context)
            .is_some_and(|devices| devices.contains(&device))
    }

    fn find_allocation(state: &MockState, ptr: usize) -> Option<(usize, &MockAllocation)> {
        let (&start, alloc) = state.allocations.range(..=ptr).next_back()?;
        (ptr < start + alloc.size).then_some((start, alloc))
    }

    /// Visits the mapped pieces of `[ptr, ptr + size)`.
    fn for_each_mapped<F>(&self, state: &mut MockState, ptr: usize, size: usize, mut f: F) -> UsmResult<()>
    where
        F: FnMut(&mut [u8], usize),
    {
        let mut addr = ptr;
        let end = ptr + size;
        while addr < end {
            let page = align_down(addr, self.granularity);
            let chunk = (page + self.granularity).min(end) - addr;
            let mapping = *state.mappings.get(&page).ok_or_else(|| {
                UsmError::Driver(format!("access to unmapped virtual address 0x{addr:x}"))
            })?;
            let physical = state
                .physical
                .get_mut(&mapping.physical)
                .ok_or_else(|| UsmError::Driver("mapping without physical memory".into()))?;
            let offset = mapping.offset + (addr - page);
            f(&mut physical.bytes[offset..offset + chunk], addr - ptr);
            addr += chunk;
        }
        Ok(())
    }
}

impl NativeDriver for MockDriver {
    fn devices(&self) -> Vec<DeviceHandle> {
        self.roots.clone()
    }

    fn sub_devices(&self, device: DeviceHandle) -> Vec<DeviceHandle> {
        self.device(device)
            .map(|d| d.sub_devices.clone())
            .unwrap_or_default()
    }

    fn device_native_id(&self, device: DeviceHandle) -> NativeDeviceId {
        self.device(device)
            .map_or(NativeDeviceId(device.0), |d| d.native_id)
    }

    fn device_family(&self, device: DeviceHandle) -> DeviceFamily {
        self.device(device).map_or(DeviceFamily::Cpu, |d| d.family)
    }

    fn can_access_peer(&self, device: DeviceHandle, peer: DeviceHandle) -> bool {
        if device == peer {
            return true;
        }
        let both_gpus = self.device_family(device).is_gpu() && self.device_family(peer).is_gpu();
        both_gpus && !self.state.lock().denied_peers.contains(&(device, peer))
    }

    fn context_create(&self, devices: &[DeviceHandle]) -> UsmResult<ContextHandle> {
        if devices.is_empty() || devices.iter().any(|d| self.device(*d).is_none()) {
            return Err(UsmError::InvalidDevice);
        }
        let handle = ContextHandle(self.next_id());
        let mut all = Vec::new();
        for &device in devices {
            all.push(device);
            all.extend(self.sub_devices(device));
        }
        self.state.lock().contexts.insert(handle, all);
        Ok(handle)
    }

    fn context_destroy(&self, context: ContextHandle) -> UsmResult<()> {
        self.state
            .lock()
            .contexts
            .remove(&context)
            .map(|_| ())
            .ok_or(UsmError::InvalidContext)
    }

    fn mem_alloc(&self, request: &NativeAllocRequest) -> UsmResult<usize> {
        let mut state = self.state.lock();
        state.stats.allocs += 1;

        if state.unloaded {
            return Err(UsmError::Uninitialized);
        }
        if !state.contexts.contains_key(&request.context) {
            return Err(UsmError::InvalidContext);
        }
        if request.kind != UsmKind::Host {
            match request.device {
                Some(device) if Self::context_has_device(&state, request.context, device) => {}
                _ => return Err(UsmError::InvalidDevice),
            }
        }
        if request.size == 0 {
            return Err(UsmError::InvalidUsmSize);
        }
        if !is_valid_alignment(request.alignment) {
            return Err(UsmError::UnsupportedAlignment);
        }
        if let Some(error) = state.pending_alloc_failure.take() {
            return Err(error);
        }

        let size = align_up(request.size, self.page_size);
        let align = request.alignment.max(self.page_size);
        // CPU devices allocate device memory from host memory.
        let on_device_aperture = request.kind == UsmKind::Device
            && request.device.is_some_and(|d| self.device_family(d).is_gpu());
        let va = if on_device_aperture {
            state
                .device_aperture
                .allocate_va(size, align)
                .ok_or(UsmError::OutOfDeviceMemory)?
        } else {
            state
                .host_aperture
                .allocate_va(size, align)
                .ok_or(UsmError::OutOfHostMemory)?
        };

        let ptr = if std::mem::take(&mut state.misalign_next) {
            va + 8
        } else {
            va
        };

        state.allocations.insert(
            ptr,
            MockAllocation {
                va,
                kind: request.kind,
                on_device_aperture,
                device: request.device.filter(|_| request.kind != UsmKind::Host),
                size: size - (ptr - va),
            },
        );
        Ok(ptr)
    }

    fn mem_free(&self, _context: ContextHandle, ptr: usize) -> UsmResult<()> {
        let mut state = self.state.lock();
        state.stats.frees += 1;

        if state.unloaded {
            return Err(UsmError::Uninitialized);
        }

        let alloc = state
            .allocations
            .remove(&ptr)
            .ok_or(UsmError::InvalidValue)?;
        state.resident.remove(&ptr);
        if alloc.on_device_aperture {
            state.device_aperture.free_va(alloc.va);
        } else {
            state.host_aperture.free_va(alloc.va);
        }
        Ok(())
    }

    fn alloc_properties(
        &self,
        _context: ContextHandle,
        ptr: usize,
    ) -> UsmResult<NativeAllocProperties> {
        let state = self.state.lock();
        let (base, alloc) = Self::find_allocation(&state, ptr).ok_or(UsmError::InvalidValue)?;
        Ok(NativeAllocProperties {
            kind: alloc.kind,
            device: alloc.device,
            base,
            size: alloc.size,
            page_size: self.page_size,
        })
    }

    fn make_memory_resident(
        &self,
        context: ContextHandle,
        device: DeviceHandle,
        ptr: usize,
        size: usize,
    ) -> UsmResult<()> {
        let mut state = self.state.lock();
        state.stats.resident_calls += 1;

        if let Some(error) = state.pending_residency_failure.take() {
            return Err(error);
        }
        if !Self::context_has_device(&state, context, device) {
            return Err(UsmError::InvalidDevice);
        }
        match Self::find_allocation(&state, ptr) {
            Some((base, alloc)) if ptr + size <= base + alloc.size => {}
            _ => return Err(UsmError::InvalidValue),
        }
        state.resident.entry(ptr).or_default().push(device);
        Ok(())
    }

    fn ipc_get_handle(&self, _context: ContextHandle, ptr: usize) -> UsmResult<NativeIpcHandle> {
        let state = self.state.lock();
        if !state.allocations.contains_key(&ptr) {
            return Err(UsmError::InvalidValue);
        }
        let mut handle = NativeIpcHandle([0; IPC_HANDLE_SIZE]);
        handle.set_fd(-1);
        handle.0[8..16].copy_from_slice(&(ptr as u64).to_ne_bytes());
        Ok(handle)
    }

    fn ipc_put_handle(&self, _context: ContextHandle, _handle: &NativeIpcHandle) -> UsmResult<()> {
        if self.ipc_put_supported {
            Ok(())
        } else {
            Err(UsmError::UnsupportedFeature("IPC handle release"))
        }
    }

    fn ipc_open_handle(
        &self,
        _context: ContextHandle,
        _device: Option<DeviceHandle>,
        handle: &NativeIpcHandle,
    ) -> UsmResult<usize> {
        let mut raw = [0u8; 8];
        raw.copy_from_slice(&handle.0[8..16]);
        let ptr = u64::from_ne_bytes(raw) as usize;

        let mut state = self.state.lock();
        state.stats.ipc_opens += 1;
        if !state.allocations.contains_key(&ptr) {
            return Err(UsmError::InvalidValue);
        }
        *state.opened_ipc.entry(ptr).or_default() += 1;
        Ok(ptr)
    }

    fn ipc_close_handle(&self, _context: ContextHandle, ptr: usize) -> UsmResult<()> {
        let mut state = self.state.lock();
        state.stats.ipc_closes += 1;
        let count = state.opened_ipc.get_mut(&ptr).ok_or(UsmError::InvalidValue)?;
        *count -= 1;
        if *count == 0 {
            state.opened_ipc.remove(&ptr);
        }
        Ok(())
    }

    fn virtual_mem_granularity(
        &self,
        _context: ContextHandle,
        _device: Option<DeviceHandle>,
    ) -> UsmResult<usize> {
        Ok(self.granularity)
    }

    fn virtual_mem_reserve(&self, context: ContextHandle, size: usize) -> UsmResult<usize> {
        let mut state = self.state.lock();
        state.stats.reserves += 1;
        if !state.contexts.contains_key(&context) {
            return Err(UsmError::InvalidContext);
        }
        let size = align_up(size, self.granularity);
        let base = state
            .reserve_aperture
            .allocate_va(size, self.granularity)
            .ok_or(UsmError::OutOfHostMemory)?;
        state.reservations.insert(base, size);
        Ok(base)
    }

    fn virtual_mem_free(&self, _context: ContextHandle, ptr: usize, _size: usize) -> UsmResult<()> {
        let mut state = self.state.lock();
        let size = *state.reservations.get(&ptr).ok_or(UsmError::InvalidValue)?;
        if state.mappings.range(ptr..ptr + size).next().is_some() {
            return Err(UsmError::Driver(format!(
                "reservation 0x{ptr:x} still has mapped pages"
            )));
        }
        state.reservations.remove(&ptr);
        state.reserve_aperture.free_va(ptr);
        Ok(())
    }

    fn virtual_mem_map(
        &self,
        _context: ContextHandle,
        ptr: usize,
        size: usize,
        physical: PhysicalMemHandle,
        offset: usize,
        access: VirtualAccess,
    ) -> UsmResult<()> {
        let mut state = self.state.lock();
        state.stats.maps += 1;

        if ptr % self.granularity != 0 || size % self.granularity != 0 || size == 0 {
            return Err(UsmError::InvalidValue);
        }
        let reserved = state
            .reservations
            .range(..=ptr)
            .next_back()
            .is_some_and(|(&base, &len)| ptr + size <= base + len);
        if !reserved {
            return Err(UsmError::InvalidValue);
        }
        let backing_len = state
            .physical
            .get(&physical)
            .map(|p| p.bytes.len())
            .ok_or(UsmError::InvalidValue)?;
        if offset + size > backing_len {
            return Err(UsmError::InvalidValue);
        }
        if state.mappings.range(ptr..ptr + size).next().is_some() {
            return Err(UsmError::Driver(format!("0x{ptr:x} is already mapped")));
        }

        for page in (0..size).step_by(self.granularity) {
            state.mappings.insert(
                ptr + page,
                Mapping {
                    physical,
                    offset: offset + page,
                    access,
                },
            );
        }
        Ok(())
    }

    fn virtual_mem_unmap(&self, _context: ContextHandle, ptr: usize, size: usize) -> UsmResult<()> {
        let mut state = self.state.lock();
        state.stats.unmaps += 1;
        for page in (ptr..ptr + size).step_by(self.granularity) {
            state
                .mappings
                .remove(&page)
                .ok_or_else(|| UsmError::Driver(format!("0x{page:x} is not mapped")))?;
        }
        Ok(())
    }

    fn physical_mem_create(
        &self,
        context: ContextHandle,
        device: DeviceHandle,
        size: usize,
    ) -> UsmResult<PhysicalMemHandle> {
        let mut state = self.state.lock();
        state.stats.physical_creates += 1;
        if !Self::context_has_device(&state, context, device) {
            return Err(UsmError::InvalidDevice);
        }
        if size == 0 || size % self.granularity != 0 {
            return Err(UsmError::InvalidValue);
        }
        let handle = PhysicalMemHandle(self.next_id());
        state.physical.insert(
            handle,
            Physical {
                bytes: vec![0xCD; size],
            },
        );
        Ok(handle)
    }

    fn physical_mem_release(&self, physical: PhysicalMemHandle) -> UsmResult<()> {
        let mut state = self.state.lock();
        state.stats.physical_releases += 1;
        if state.mappings.values().any(|m| m.physical == physical) {
            return Err(UsmError::Driver("physical memory is still mapped".into()));
        }
        state
            .physical
            .remove(&physical)
            .map(|_| ())
            .ok_or(UsmError::InvalidValue)
    }

    fn queue_create(&self, context: ContextHandle, device: DeviceHandle) -> UsmResult<QueueHandle> {
        let mut state = self.state.lock();
        if !Self::context_has_device(&state, context, device) {
            return Err(UsmError::InvalidDevice);
        }
        let handle = QueueHandle(self.next_id());
        state.queues.insert(handle, context);
        Ok(handle)
    }

    fn queue_release(&self, queue: QueueHandle) -> UsmResult<()> {
        self.state
            .lock()
            .queues
            .remove(&queue)
            .map(|_| ())
            .ok_or(UsmError::InvalidValue)
    }

    fn enqueue_fill_blocking(
        &self,
        queue: QueueHandle,
        ptr: usize,
        value: u8,
        size: usize,
    ) -> UsmResult<()> {
        let mut state = self.state.lock();
        state.stats.fills += 1;
        if !state.queues.contains_key(&queue) {
            return Err(UsmError::InvalidValue);
        }

        // USM allocations carry no byte storage.
        if let Some((base, alloc)) = Self::find_allocation(&state, ptr) {
            return if ptr + size <= base + alloc.size {
                Ok(())
            } else {
                Err(UsmError::InvalidValue)
            };
        }

        let read_only = state
            .mappings
            .get(&align_down(ptr, self.granularity))
            .is_some_and(|page| page.access == VirtualAccess::ReadOnly);
        if read_only {
            return Err(UsmError::Driver(format!("0x{ptr:x} is mapped read-only")));
        }
        self.for_each_mapped(&mut state, ptr, size, |bytes, _| bytes.fill(value))
    }

    fn enqueue_copy_blocking(
        &self,
        queue: QueueHandle,
        dst: &mut [u8],
        src: usize,
    ) -> UsmResult<()> {
        let mut state = self.state.lock();
        state.stats.copies += 1;
        if !state.queues.contains_key(&queue) {
            return Err(UsmError::InvalidValue);
        }
        self.for_each_mapped(&mut state, src, dst.len(), |bytes, at| {
            dst[at..at + bytes.len()].copy_from_slice(bytes);
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn request(context: ContextHandle, kind: UsmKind, device: Option<DeviceHandle>) -> NativeAllocRequest {
        NativeAllocRequest {
            kind,
            context,
            device,
            size: 100,
            alignment: 0,
            device_read_only: false,
        }
    }

    #[test]
    fn test_topology() {
        let driver = MockDriver::builder()
            .gpu(DeviceFamily::GpuPvc, 2)
            .cpu()
            .build();
        let roots = driver.devices();
        assert_eq!(roots.len(), 2);

        let subs = driver.sub_devices(roots[0]);
        assert_eq!(subs.len(), 2);
        assert_eq!(driver.device_native_id(subs[0]), driver.device_native_id(roots[0]));
        assert_eq!(driver.device_native_id(subs[1]), driver.device_native_id(roots[0]));
        assert_ne!(driver.device_native_id(roots[1]), driver.device_native_id(roots[0]));
        assert_eq!(driver.device_family(subs[1]), DeviceFamily::GpuPvc);
        assert!(!driver.can_access_peer(roots[0], roots[1]));
    }

    #[test]
    fn test_alloc_rounds_to_pages() {
        let driver = MockDriver::builder().gpu(DeviceFamily::GpuDg2, 0).build();
        let device = driver.devices()[0];
        let context = driver.context_create(&[device]).unwrap();

        let ptr = driver
            .mem_alloc(&request(context, UsmKind::Device, Some(device)))
            .unwrap();
        assert_eq!(ptr % DEFAULT_PAGE_SIZE, 0);
        assert!(ptr >= DEVICE_APERTURE_BASE);

        let props = driver.alloc_properties(context, ptr + 10).unwrap();
        assert_eq!(props.base, ptr);
        assert_eq!(props.size, DEFAULT_PAGE_SIZE);
        assert_eq!(props.kind, UsmKind::Device);

        driver.mem_free(context, ptr).unwrap();
        assert!(matches!(driver.mem_free(context, ptr), Err(UsmError::InvalidValue)));
        assert_eq!(driver.stats().frees, 2);
    }

    #[test]
    fn test_device_alloc_requires_context_device() {
        let driver = MockDriver::builder()
            .gpu(DeviceFamily::GpuPvc, 0)
            .gpu(DeviceFamily::GpuPvc, 0)
            .build();
        let devices = driver.devices();
        let context = driver.context_create(&devices[..1]).unwrap();

        let result = driver.mem_alloc(&request(context, UsmKind::Device, Some(devices[1])));
        assert!(matches!(result, Err(UsmError::InvalidDevice)));
    }

    #[test]
    fn test_unloaded_free() {
        let driver = MockDriver::builder().cpu().build();
        let context = driver.context_create(&driver.devices()).unwrap();
        let ptr = driver.mem_alloc(&request(context, UsmKind::Host, None)).unwrap();

        driver.set_unloaded(true);
        assert!(matches!(driver.mem_free(context, ptr), Err(UsmError::Uninitialized)));
    }

    #[test]
    fn test_virtual_memory_round_trip() {
        let driver = MockDriver::builder().gpu(DeviceFamily::GpuPvc, 0).build();
        let device = driver.devices()[0];
        let context = driver.context_create(&[device]).unwrap();
        let queue = driver.queue_create(context, device).unwrap();
        let page = driver.granularity();

        let base = driver.virtual_mem_reserve(context, 4 * page).unwrap();
        let physical = driver.physical_mem_create(context, device, page).unwrap();
        driver
            .virtual_mem_map(context, base + page, page, physical, 0, VirtualAccess::ReadWrite)
            .unwrap();

        driver.enqueue_fill_blocking(queue, base + page + 16, 0x5A, 4).unwrap();
        let mut out = [0u8; 6];
        driver.enqueue_copy_blocking(queue, &mut out, base + page + 15).unwrap();
        assert_eq!(out, [0xCD, 0x5A, 0x5A, 0x5A, 0x5A, 0xCD]);

        // Unmapped pages fault.
        assert!(driver.enqueue_fill_blocking(queue, base, 0, 1).is_err());
        // The reservation cannot go while a page is mapped.
        assert!(driver.virtual_mem_free(context, base, 4 * page).is_err());

        driver.virtual_mem_unmap(context, base + page, page).unwrap();
        driver.physical_mem_release(physical).unwrap();
        driver.virtual_mem_free(context, base, 4 * page).unwrap();
        assert_eq!(driver.reservations(), 0);
    }
}
