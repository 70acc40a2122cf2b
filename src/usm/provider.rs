#![allow(clippy::cast_possible_truncation, clippy::cast_possible_wrap)]

use super::PoolKind;
use crate::config::{ForceResidency, ResidencyPolicy};
use crate::error::{UsmError, UsmResult};
use crate::native::{
    ContextHandle, DeviceHandle, IPC_HANDLE_SIZE, NativeAllocRequest, NativeDriver,
    NativeIpcHandle, QueueHandle,
};
use crate::runtime::device::Device;
use crate::utils::{is_aligned, is_valid_alignment};
use once_cell::sync::OnceCell;
use parking_lot::Mutex;
use std::collections::HashMap;
use std::os::fd::{AsRawFd, OwnedFd};
use std::sync::Arc;

// ===============================================================================================
// Context Binding
// ===============================================================================================

/// Devices of one context that can reach each device, computed on first use.
#[derive(Debug)]
pub struct PeerAccessCache {
    devices: Vec<DeviceHandle>,
    peers: Mutex<HashMap<DeviceHandle, Arc<[DeviceHandle]>>>,
}

impl PeerAccessCache {
    #[must_use]
    pub fn new(devices: Vec<DeviceHandle>) -> Self {
        Self {
            devices,
            peers: Mutex::new(HashMap::new()),
        }
    }

    #[must_use]
    pub fn devices(&self) -> &[DeviceHandle] {
        &self.devices
    }

    /// Context devices, other than `device` itself, with peer access to it.
    pub fn peers_of(&self, driver: &dyn NativeDriver, device: DeviceHandle) -> Arc<[DeviceHandle]> {
        let mut peers = self.peers.lock();
        Arc::clone(peers.entry(device).or_insert_with(|| {
            self.devices
                .iter()
                .copied()
                .filter(|&peer| peer != device && driver.can_access_peer(peer, device))
                .collect()
        }))
    }
}

/// Everything a provider needs from its owning context.
#[derive(Debug, Clone)]
pub struct ProviderContext {
    pub driver: Arc<dyn NativeDriver>,
    pub context: ContextHandle,
    pub residency: ResidencyPolicy,
    pub peers: Arc<PeerAccessCache>,
}

// ===============================================================================================
// Per-kind Capabilities
// ===============================================================================================

struct ProviderOps {
    /// Device and Shared memory is bound to a device, Host memory is not.
    device_bound: bool,
    make_resident: fn(&MemoryProvider, usize, usize) -> UsmResult<()>,
}

// Indexed by `PoolKind::index`.
static PROVIDER_OPS: [ProviderOps; 4] = [
    ProviderOps {
        device_bound: false,
        make_resident: resident_on_context_devices,
    },
    ProviderOps {
        device_bound: true,
        make_resident: resident_on_owner,
    },
    ProviderOps {
        device_bound: true,
        make_resident: resident_on_owner,
    },
    ProviderOps {
        device_bound: true,
        make_resident: resident_on_owner,
    },
];

fn resident_on_context_devices(provider: &MemoryProvider, ptr: usize, size: usize) -> UsmResult<()> {
    if provider.residency == ForceResidency::None {
        return Ok(());
    }
    for &device in provider.binding.peers.devices() {
        provider.make_resident(device, ptr, size)?;
    }
    Ok(())
}

fn resident_on_owner(provider: &MemoryProvider, ptr: usize, size: usize) -> UsmResult<()> {
    let Some(device) = provider.device.as_ref().map(|d| d.handle()) else {
        return Ok(());
    };

    match provider.residency {
        ForceResidency::None => Ok(()),
        ForceResidency::Device => provider.make_resident(device, ptr, size),
        ForceResidency::PeerDevices => {
            provider.make_resident(device, ptr, size)?;
            let peers = provider
                .binding
                .peers
                .peers_of(provider.binding.driver.as_ref(), device);
            for &peer in peers.iter() {
                provider.make_resident(peer, ptr, size)?;
            }
            Ok(())
        }
    }
}

// ===============================================================================================
// Memory Provider
// ===============================================================================================

/// Exported allocation, tagged with the exporting process.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct IpcData {
    pub pid: u32,
    pub handle: NativeIpcHandle,
}

/// Binds one pool kind on one device (or on the host) to the native
/// allocation calls.
#[derive(Debug)]
pub struct MemoryProvider {
    kind: PoolKind,
    ops: &'static ProviderOps,
    binding: ProviderContext,
    device: Option<Arc<Device>>,
    residency: ForceResidency,
    zero_initialize: bool,
    fill_queue: OnceCell<QueueHandle>,
    min_page_size: OnceCell<usize>,
}

impl std::fmt::Debug for ProviderOps {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ProviderOps")
            .field("device_bound", &self.device_bound)
            .finish_non_exhaustive()
    }
}

impl MemoryProvider {
    /// # Errors
    /// Returns `InvalidDevice` when a device-bound kind is given no device.
    pub fn initialize(
        kind: PoolKind,
        binding: &ProviderContext,
        device: Option<Arc<Device>>,
        zero_initialize: bool,
    ) -> UsmResult<Self> {
        let ops = &PROVIDER_OPS[kind.index()];
        let device = if ops.device_bound {
            Some(device.ok_or(UsmError::InvalidDevice)?)
        } else {
            None
        };

        Ok(Self {
            kind,
            ops,
            binding: binding.clone(),
            device,
            residency: binding.residency.for_kind(kind.usm_kind()),
            zero_initialize,
            fill_queue: OnceCell::new(),
            min_page_size: OnceCell::new(),
        })
    }

    #[must_use]
    pub const fn kind(&self) -> PoolKind {
        self.kind
    }

    #[must_use]
    pub fn device(&self) -> Option<&Arc<Device>> {
        self.device.as_ref()
    }

    #[must_use]
    pub const fn context(&self) -> ContextHandle {
        self.binding.context
    }

    fn request(&self, size: usize, alignment: usize) -> NativeAllocRequest {
        NativeAllocRequest {
            kind: self.kind.usm_kind(),
            context: self.binding.context,
            device: self.device.as_ref().map(|d| d.handle()),
            size,
            alignment,
            device_read_only: self.kind.is_read_only(),
        }
    }

    fn make_resident(&self, device: DeviceHandle, ptr: usize, size: usize) -> UsmResult<()> {
        self.binding
            .driver
            .make_memory_resident(self.binding.context, device, ptr, size)
            .inspect_err(|e| {
                tracing::error!(%device, ptr = format_args!("0x{ptr:x}"), "make resident failed: {e}");
            })
    }

    fn fill_queue(&self) -> UsmResult<QueueHandle> {
        self.fill_queue
            .get_or_try_init(|| {
                let device = self
                    .device
                    .as_ref()
                    .map(|d| d.handle())
                    .or_else(|| self.binding.peers.devices().first().copied())
                    .ok_or(UsmError::InvalidDevice)?;
                self.binding.driver.queue_create(self.binding.context, device)
            })
            .copied()
    }

    /// Allocates directly from the driver.
    ///
    /// # Errors
    /// * `InvalidUsmSize` for a zero size.
    /// * `UnsupportedAlignment` for an alignment that is not a power of two.
    /// * `InvalidValue` when the driver returned a misaligned address.
    /// * Driver errors, including forced residency failures, verbatim.
    pub fn alloc(&self, size: usize, alignment: usize) -> UsmResult<usize> {
        if size == 0 {
            return Err(UsmError::InvalidUsmSize);
        }
        if !is_valid_alignment(alignment) {
            return Err(UsmError::UnsupportedAlignment);
        }

        let ptr = self
            .binding
            .driver
            .mem_alloc(&self.request(size, alignment))
            .inspect_err(|e| tracing::error!(kind = %self.kind, size, "native alloc failed: {e}"))?;

        if !is_aligned(ptr, alignment) {
            tracing::error!(
                ptr = format_args!("0x{ptr:x}"),
                alignment,
                "native alloc returned a misaligned address"
            );
            self.release_after_failure(ptr, size);
            return Err(UsmError::InvalidValue);
        }

        if let Err(e) = (self.ops.make_resident)(self, ptr, size) {
            self.release_after_failure(ptr, size);
            return Err(e);
        }

        if self.zero_initialize {
            let filled = self
                .fill_queue()
                .and_then(|queue| self.binding.driver.enqueue_fill_blocking(queue, ptr, 0, size));
            if let Err(e) = filled {
                self.release_after_failure(ptr, size);
                return Err(e);
            }
        }

        tracing::trace!(kind = %self.kind, size, ptr = format_args!("0x{ptr:x}"), "provider alloc");
        Ok(ptr)
    }

    fn release_after_failure(&self, ptr: usize, size: usize) {
        if let Err(e) = self.free(ptr, size) {
            tracing::warn!(ptr = format_args!("0x{ptr:x}"), "leaking allocation: {e}");
        }
    }

    /// Returns memory to the driver. A driver that was already unloaded has
    /// nothing left to free and reports success.
    ///
    /// # Errors
    /// Other driver errors are returned verbatim.
    pub fn free(&self, ptr: usize, size: usize) -> UsmResult<()> {
        match self.binding.driver.mem_free(self.binding.context, ptr) {
            Ok(()) | Err(UsmError::Uninitialized) => {
                tracing::trace!(kind = %self.kind, size, ptr = format_args!("0x{ptr:x}"), "provider free");
                Ok(())
            }
            Err(e) => {
                tracing::error!(ptr = format_args!("0x{ptr:x}"), "native free failed: {e}");
                Err(e)
            }
        }
    }

    /// Page size backing `ptr`. Without a pointer a one byte allocation is
    /// made the first time and the answer is cached.
    ///
    /// # Errors
    /// Returns the driver error.
    pub fn min_page_size(&self, ptr: Option<usize>) -> UsmResult<usize> {
        let driver = &self.binding.driver;
        let context = self.binding.context;

        if let Some(ptr) = ptr {
            return Ok(driver.alloc_properties(context, ptr)?.page_size);
        }

        self.min_page_size
            .get_or_try_init(|| {
                let scratch = driver.mem_alloc(&self.request(1, 0))?;
                let page_size = driver.alloc_properties(context, scratch).map(|p| p.page_size);
                self.free(scratch, 1)?;
                page_size
            })
            .copied()
    }

    #[must_use]
    pub const fn ipc_handle_size(&self) -> usize {
        std::mem::size_of::<u32>() + IPC_HANDLE_SIZE
    }

    /// # Errors
    /// Returns the driver error.
    pub fn get_ipc_handle(&self, ptr: usize) -> UsmResult<IpcData> {
        let handle = self.binding.driver.ipc_get_handle(self.binding.context, ptr)?;
        Ok(IpcData {
            pid: std::process::id(),
            handle,
        })
    }

    /// # Errors
    /// Returns `UnsupportedFeature` on drivers that cannot release handles.
    pub fn put_ipc_handle(&self, data: &IpcData) -> UsmResult<()> {
        self.binding
            .driver
            .ipc_put_handle(self.binding.context, &data.handle)
    }

    /// Opens a handle exported by this or another process. A foreign
    /// descriptor is duplicated into this process for the open and closed
    /// again afterwards.
    ///
    /// # Errors
    /// Returns the driver error or the error duplicating the descriptor.
    pub fn open_ipc_handle(&self, data: &IpcData) -> UsmResult<usize> {
        let device = self.device.as_ref().map(|d| d.handle());
        let driver = &self.binding.driver;

        if data.pid == std::process::id() {
            return driver.ipc_open_handle(self.binding.context, device, &data.handle);
        }

        let local_fd = duplicate_remote_fd(data.pid, data.handle.fd())?;
        let mut handle = data.handle;
        handle.set_fd(local_fd.as_raw_fd());

        let opened = driver.ipc_open_handle(self.binding.context, device, &handle);
        drop(local_fd);
        opened
    }

    /// # Errors
    /// Returns the driver error.
    pub fn close_ipc_handle(&self, ptr: usize) -> UsmResult<()> {
        self.binding.driver.ipc_close_handle(self.binding.context, ptr)
    }
}

impl Drop for MemoryProvider {
    fn drop(&mut self) {
        if let Some(&queue) = self.fill_queue.get() {
            if let Err(e) = self.binding.driver.queue_release(queue) {
                tracing::warn!(%queue, "failed to release fill queue: {e}");
            }
        }
    }
}

#[cfg(target_os = "linux")]
fn duplicate_remote_fd(pid: u32, remote_fd: i32) -> UsmResult<OwnedFd> {
    use std::os::fd::{FromRawFd, RawFd};

    let pid = libc::pid_t::try_from(pid).map_err(|_| UsmError::InvalidValue)?;

    // SAFETY: plain syscall, the result is checked before use.
    let pid_fd = unsafe { libc::syscall(libc::SYS_pidfd_open, pid, 0) };
    if pid_fd < 0 {
        return Err(std::io::Error::last_os_error().into());
    }
    // SAFETY: the kernel just handed us this descriptor.
    let pid_fd = unsafe { OwnedFd::from_raw_fd(pid_fd as RawFd) };

    // SAFETY: plain syscall, the result is checked before use.
    let local_fd = unsafe { libc::syscall(libc::SYS_pidfd_getfd, pid_fd.as_raw_fd(), remote_fd, 0) };
    if local_fd < 0 {
        return Err(std::io::Error::last_os_error().into());
    }
    // SAFETY: as above, the new descriptor is owned by this process.
    Ok(unsafe { OwnedFd::from_raw_fd(local_fd as RawFd) })
}

#[cfg(not(target_os = "linux"))]
fn duplicate_remote_fd(_pid: u32, _remote_fd: i32) -> UsmResult<OwnedFd> {
    Err(UsmError::UnsupportedFeature("cross-process IPC handles"))
}

#[cfg(test)]
pub(crate) mod tests {
    use super::*;
    use crate::native::mock::MockDriver;
    use crate::native::DeviceFamily;

    pub(crate) fn test_binding(
        driver: &Arc<MockDriver>,
        residency: ResidencyPolicy,
    ) -> (ProviderContext, Vec<Arc<Device>>) {
        let devices: Vec<Arc<Device>> = driver
            .devices()
            .into_iter()
            .map(|handle| Device::discover(driver.as_ref(), handle))
            .collect();
        let handles: Vec<DeviceHandle> = devices.iter().map(|d| d.handle()).collect();
        let context = driver.context_create(&handles).unwrap();
        let binding = ProviderContext {
            driver: Arc::clone(driver) as Arc<dyn NativeDriver>,
            context,
            residency,
            peers: Arc::new(PeerAccessCache::new(handles)),
        };
        (binding, devices)
    }

    fn two_gpus() -> Arc<MockDriver> {
        MockDriver::builder()
            .gpu(DeviceFamily::GpuPvc, 0)
            .gpu(DeviceFamily::GpuPvc, 0)
            .build()
    }

    #[test]
    fn test_device_kind_requires_device() {
        let driver = two_gpus();
        let (binding, _) = test_binding(&driver, ResidencyPolicy::none());
        let result = MemoryProvider::initialize(PoolKind::Device, &binding, None, false);
        assert!(matches!(result, Err(UsmError::InvalidDevice)));

        let host = MemoryProvider::initialize(PoolKind::Host, &binding, None, false).unwrap();
        assert!(host.device().is_none());
    }

    #[test]
    fn test_misaligned_result_is_rejected_and_freed() {
        let driver = two_gpus();
        let (binding, devices) = test_binding(&driver, ResidencyPolicy::none());
        let provider =
            MemoryProvider::initialize(PoolKind::Device, &binding, Some(Arc::clone(&devices[0])), false)
                .unwrap();

        driver.misalign_next_alloc();
        assert!(matches!(provider.alloc(256, 64), Err(UsmError::InvalidValue)));
        assert_eq!(driver.live_allocations(), 0);

        let ptr = provider.alloc(256, 64).unwrap();
        assert_eq!(ptr % 64, 0);
        provider.free(ptr, 256).unwrap();
    }

    #[test]
    fn test_out_of_memory_is_not_translated() {
        let driver = two_gpus();
        let (binding, devices) = test_binding(&driver, ResidencyPolicy::none());
        let provider =
            MemoryProvider::initialize(PoolKind::Device, &binding, Some(Arc::clone(&devices[0])), false)
                .unwrap();

        driver.inject_alloc_failure(UsmError::OutOfDeviceMemory);
        assert!(matches!(provider.alloc(64, 0), Err(UsmError::OutOfDeviceMemory)));
        driver.inject_alloc_failure(UsmError::OutOfHostMemory);
        assert!(matches!(provider.alloc(64, 0), Err(UsmError::OutOfHostMemory)));
    }

    #[test]
    fn test_peer_residency() {
        let driver = two_gpus();
        let (binding, devices) = test_binding(&driver, ResidencyPolicy::from_bits(0x2));
        let provider =
            MemoryProvider::initialize(PoolKind::Device, &binding, Some(Arc::clone(&devices[0])), false)
                .unwrap();

        let ptr = provider.alloc(4096, 0).unwrap();
        assert_eq!(
            driver.resident_devices(ptr),
            vec![devices[0].handle(), devices[1].handle()]
        );
    }

    #[test]
    fn test_peer_list_is_cached() {
        let driver = two_gpus();
        let (binding, devices) = test_binding(&driver, ResidencyPolicy::from_bits(0x2));
        let provider =
            MemoryProvider::initialize(PoolKind::Device, &binding, Some(Arc::clone(&devices[0])), false)
                .unwrap();

        let first = provider.alloc(4096, 0).unwrap();
        // Denying access afterwards does not change the cached list.
        driver.deny_peer_access(devices[1].handle(), devices[0].handle());
        let second = provider.alloc(4096, 0).unwrap();
        assert_eq!(driver.resident_devices(first), driver.resident_devices(second));
    }

    #[test]
    fn test_host_residency_covers_context_devices() {
        let driver = two_gpus();
        let (binding, devices) = test_binding(&driver, ResidencyPolicy::from_bits(0x100));
        let provider = MemoryProvider::initialize(PoolKind::Host, &binding, None, false).unwrap();

        let ptr = provider.alloc(64, 0).unwrap();
        assert_eq!(
            driver.resident_devices(ptr),
            vec![devices[0].handle(), devices[1].handle()]
        );
    }

    #[test]
    fn test_residency_failure_propagates_and_frees() {
        let driver = two_gpus();
        let (binding, devices) = test_binding(&driver, ResidencyPolicy::from_bits(0x1));
        let provider =
            MemoryProvider::initialize(PoolKind::Device, &binding, Some(Arc::clone(&devices[0])), false)
                .unwrap();

        driver.inject_residency_failure(UsmError::Driver("device lost".into()));
        assert!(matches!(provider.alloc(4096, 0), Err(UsmError::Driver(_))));
        assert_eq!(driver.live_allocations(), 0);
    }

    #[test]
    fn test_free_after_unload_succeeds() {
        let driver = two_gpus();
        let (binding, _) = test_binding(&driver, ResidencyPolicy::none());
        let provider = MemoryProvider::initialize(PoolKind::Host, &binding, None, false).unwrap();

        let ptr = provider.alloc(64, 0).unwrap();
        driver.set_unloaded(true);
        provider.free(ptr, 64).unwrap();
    }

    #[test]
    fn test_min_page_size_is_cached() {
        let driver = two_gpus();
        let (binding, _) = test_binding(&driver, ResidencyPolicy::none());
        let provider = MemoryProvider::initialize(PoolKind::Host, &binding, None, false).unwrap();

        assert_eq!(provider.min_page_size(None).unwrap(), driver.page_size());
        assert_eq!(provider.min_page_size(None).unwrap(), driver.page_size());
        let stats = driver.stats();
        assert_eq!((stats.allocs, stats.frees), (1, 1));

        let ptr = provider.alloc(64, 0).unwrap();
        assert_eq!(provider.min_page_size(Some(ptr)).unwrap(), driver.page_size());
    }

    #[test]
    fn test_zero_initialize_fills_fresh_memory() {
        let driver = two_gpus();
        let (binding, devices) = test_binding(&driver, ResidencyPolicy::none());
        let provider =
            MemoryProvider::initialize(PoolKind::Device, &binding, Some(Arc::clone(&devices[0])), true)
                .unwrap();

        provider.alloc(4096, 0).unwrap();
        provider.alloc(4096, 0).unwrap();
        assert_eq!(driver.stats().fills, 2);
    }

    #[test]
    fn test_ipc_in_process() {
        let driver = two_gpus();
        let (binding, devices) = test_binding(&driver, ResidencyPolicy::none());
        let provider =
            MemoryProvider::initialize(PoolKind::Device, &binding, Some(Arc::clone(&devices[0])), false)
                .unwrap();

        let ptr = provider.alloc(4096, 0).unwrap();
        let data = provider.get_ipc_handle(ptr).unwrap();
        assert_eq!(data.pid, std::process::id());
        assert_eq!(provider.ipc_handle_size(), 4 + IPC_HANDLE_SIZE);

        let opened = provider.open_ipc_handle(&data).unwrap();
        assert_eq!(opened, ptr);
        provider.close_ipc_handle(opened).unwrap();

        assert!(matches!(
            provider.put_ipc_handle(&data),
            Err(UsmError::UnsupportedFeature(_))
        ));
    }
}
