//! The boundary to the native driver stack.
//!
//! Everything above this module talks to the hardware through [`NativeDriver`];
//! backend call translation lives behind it.

pub mod aperture;
pub mod mock;

use crate::error::UsmResult;
use std::fmt;

// ===============================================================================================
// Handles
// ===============================================================================================

macro_rules! native_handle {
    ($(#[$meta:meta])* $name:ident) => {
        $(#[$meta])*
        #[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
        pub struct $name(pub u64);

        impl fmt::Display for $name {
            fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
                write!(f, "{}(0x{:x})", stringify!($name), self.0)
            }
        }
    };
}

native_handle!(
    /// A native context.
    ContextHandle
);
native_handle!(
    /// A root device or sub-device.
    DeviceHandle
);
native_handle!(
    /// Identity of the physical device a handle resolves to. Sub-devices of one
    /// card share the identity of their root device.
    NativeDeviceId
);
native_handle!(PhysicalMemHandle);
native_handle!(QueueHandle);

// ===============================================================================================
// Descriptors
// ===============================================================================================

/// The three USM allocation kinds.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum UsmKind {
    Host,
    Device,
    Shared,
}

/// Target families with distinct shadow memory layouts.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum DeviceFamily {
    Cpu,
    GpuPvc,
    GpuDg2,
}

impl DeviceFamily {
    #[must_use]
    pub const fn is_gpu(self) -> bool {
        !matches!(self, Self::Cpu)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct NativeAllocRequest {
    pub kind: UsmKind,
    pub context: ContextHandle,
    /// `None` for host allocations.
    pub device: Option<DeviceHandle>,
    pub size: usize,
    /// Zero lets the driver choose.
    pub alignment: usize,
    pub device_read_only: bool,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct NativeAllocProperties {
    pub kind: UsmKind,
    pub device: Option<DeviceHandle>,
    pub base: usize,
    pub size: usize,
    pub page_size: usize,
}

pub const IPC_HANDLE_SIZE: usize = 64;

/// Opaque exported memory handle. The first four bytes carry the file
/// descriptor of the exporting process.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct NativeIpcHandle(pub [u8; IPC_HANDLE_SIZE]);

impl NativeIpcHandle {
    #[must_use]
    pub fn fd(&self) -> i32 {
        let mut raw = [0u8; 4];
        raw.copy_from_slice(&self.0[..4]);
        i32::from_ne_bytes(raw)
    }

    pub fn set_fd(&mut self, fd: i32) {
        self.0[..4].copy_from_slice(&fd.to_ne_bytes());
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum VirtualAccess {
    ReadOnly,
    ReadWrite,
}

// ===============================================================================================
// Driver Interface
// ===============================================================================================

/// Native driver capabilities consumed by the USM and sanitizer layers.
///
/// Addresses are plain `usize` values in the driver's unified address space.
pub trait NativeDriver: Send + Sync + fmt::Debug {
    /// Root devices visible to the driver.
    fn devices(&self) -> Vec<DeviceHandle>;

    fn sub_devices(&self, device: DeviceHandle) -> Vec<DeviceHandle>;

    fn device_native_id(&self, device: DeviceHandle) -> NativeDeviceId;

    fn device_family(&self, device: DeviceHandle) -> DeviceFamily;

    fn can_access_peer(&self, device: DeviceHandle, peer: DeviceHandle) -> bool;

    /// # Errors
    /// Fails with `InvalidDevice` if a device is unknown.
    fn context_create(&self, devices: &[DeviceHandle]) -> UsmResult<ContextHandle>;

    /// # Errors
    /// Fails with `InvalidContext` if the context is unknown.
    fn context_destroy(&self, context: ContextHandle) -> UsmResult<()>;

    // --- memory ---

    /// # Errors
    /// Returns the driver's out-of-memory or alignment error.
    fn mem_alloc(&self, request: &NativeAllocRequest) -> UsmResult<usize>;

    /// # Errors
    /// Returns `Uninitialized` once the driver has been unloaded.
    fn mem_free(&self, context: ContextHandle, ptr: usize) -> UsmResult<()>;

    /// # Errors
    /// Fails with `InvalidValue` for addresses outside any allocation.
    fn alloc_properties(
        &self,
        context: ContextHandle,
        ptr: usize,
    ) -> UsmResult<NativeAllocProperties>;

    /// # Errors
    /// Returns the driver error.
    fn make_memory_resident(
        &self,
        context: ContextHandle,
        device: DeviceHandle,
        ptr: usize,
        size: usize,
    ) -> UsmResult<()>;

    // --- ipc ---

    /// # Errors
    /// Returns the driver error.
    fn ipc_get_handle(&self, context: ContextHandle, ptr: usize) -> UsmResult<NativeIpcHandle>;

    /// # Errors
    /// Returns `UnsupportedFeature` on drivers without handle release.
    fn ipc_put_handle(&self, context: ContextHandle, handle: &NativeIpcHandle) -> UsmResult<()>;

    /// # Errors
    /// Returns the driver error.
    fn ipc_open_handle(
        &self,
        context: ContextHandle,
        device: Option<DeviceHandle>,
        handle: &NativeIpcHandle,
    ) -> UsmResult<usize>;

    /// # Errors
    /// Returns the driver error.
    fn ipc_close_handle(&self, context: ContextHandle, ptr: usize) -> UsmResult<()>;

    // --- virtual and physical memory ---

    /// # Errors
    /// Returns the driver error.
    fn virtual_mem_granularity(
        &self,
        context: ContextHandle,
        device: Option<DeviceHandle>,
    ) -> UsmResult<usize>;

    /// # Errors
    /// Returns the driver error.
    fn virtual_mem_reserve(&self, context: ContextHandle, size: usize) -> UsmResult<usize>;

    /// # Errors
    /// Returns the driver error.
    fn virtual_mem_free(&self, context: ContextHandle, ptr: usize, size: usize) -> UsmResult<()>;

    /// # Errors
    /// Returns the driver error.
    fn virtual_mem_map(
        &self,
        context: ContextHandle,
        ptr: usize,
        size: usize,
        physical: PhysicalMemHandle,
        offset: usize,
        access: VirtualAccess,
    ) -> UsmResult<()>;

    /// # Errors
    /// Returns the driver error.
    fn virtual_mem_unmap(&self, context: ContextHandle, ptr: usize, size: usize) -> UsmResult<()>;

    /// # Errors
    /// Returns the driver error.
    fn physical_mem_create(
        &self,
        context: ContextHandle,
        device: DeviceHandle,
        size: usize,
    ) -> UsmResult<PhysicalMemHandle>;

    /// # Errors
    /// Returns the driver error.
    fn physical_mem_release(&self, physical: PhysicalMemHandle) -> UsmResult<()>;

    // --- queues ---

    /// # Errors
    /// Returns the driver error.
    fn queue_create(&self, context: ContextHandle, device: DeviceHandle) -> UsmResult<QueueHandle>;

    /// # Errors
    /// Returns the driver error.
    fn queue_release(&self, queue: QueueHandle) -> UsmResult<()>;

    /// Fills `size` bytes at `ptr` with `value` and waits for completion.
    ///
    /// # Errors
    /// Returns the driver error.
    fn enqueue_fill_blocking(
        &self,
        queue: QueueHandle,
        ptr: usize,
        value: u8,
        size: usize,
    ) -> UsmResult<()>;

    /// Copies `dst.len()` bytes from device-visible `src` into a host buffer
    /// and waits for completion.
    ///
    /// # Errors
    /// Returns the driver error.
    fn enqueue_copy_blocking(&self, queue: QueueHandle, dst: &mut [u8], src: usize)
    -> UsmResult<()>;
}
