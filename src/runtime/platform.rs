use super::context::Context;
use super::device::{self, Device};
use crate::config::RuntimeConfig;
use crate::error::{UsmError, UsmResult};
use crate::native::{ContextHandle, DeviceHandle, NativeDriver};
use parking_lot::{Mutex, MutexGuard};
use std::collections::HashMap;
use std::sync::Arc;

pub type ContextRegistry = HashMap<ContextHandle, Arc<Context>>;

/// One driver, its devices and every context created on them.
///
/// The registry lock is the outermost lock of the runtime. It is taken
/// before any context lock whenever a context may be torn down.
#[derive(Debug)]
pub struct Platform {
    driver: Arc<dyn NativeDriver>,
    config: Arc<RuntimeConfig>,
    devices: Vec<Arc<Device>>,
    contexts: Mutex<ContextRegistry>,
}

impl Platform {
    /// Discovers the device tree of `driver`.
    #[must_use]
    pub fn new(driver: Arc<dyn NativeDriver>, config: RuntimeConfig) -> Arc<Self> {
        let devices: Vec<Arc<Device>> = driver
            .devices()
            .into_iter()
            .map(|handle| Device::discover(driver.as_ref(), handle))
            .collect();

        tracing::debug!(
            devices = devices.len(),
            tracking = config.indirect_access_tracking,
            pooling = config.use_usm_allocator,
            "platform initialized"
        );

        Arc::new(Self {
            driver,
            config: Arc::new(config),
            devices,
            contexts: Mutex::new(HashMap::new()),
        })
    }

    #[must_use]
    pub const fn driver(&self) -> &Arc<dyn NativeDriver> {
        &self.driver
    }

    #[must_use]
    pub const fn config(&self) -> &Arc<RuntimeConfig> {
        &self.config
    }

    #[must_use]
    pub fn devices(&self) -> &[Arc<Device>] {
        &self.devices
    }

    #[must_use]
    pub fn find_device(&self, handle: DeviceHandle) -> Option<Arc<Device>> {
        device::find_device(&self.devices, handle)
    }

    /// Creates a context over `devices` and registers it.
    ///
    /// # Errors
    /// * `InvalidDevice` for an empty list or a device of another platform.
    /// * Driver errors creating the context or its default pool.
    pub fn create_context(self: &Arc<Self>, devices: &[Arc<Device>]) -> UsmResult<Arc<Context>> {
        if devices.is_empty() {
            return Err(UsmError::InvalidDevice);
        }
        for device in devices {
            if self.find_device(device.handle()).is_none() {
                return Err(UsmError::InvalidDevice);
            }
        }

        let handles: Vec<DeviceHandle> = devices.iter().map(|d| d.handle()).collect();
        let handle = self.driver.context_create(&handles)?;
        let context = match Context::new(self, handle, devices.to_vec()) {
            Ok(context) => context,
            Err(e) => {
                if let Err(destroy) = self.driver.context_destroy(handle) {
                    tracing::warn!(context = %handle, "failed to destroy context: {destroy}");
                }
                return Err(e);
            }
        };

        self.contexts.lock().insert(handle, Arc::clone(&context));
        tracing::debug!(context = %handle, devices = devices.len(), "context created");
        Ok(context)
    }

    #[must_use]
    pub fn context(&self, handle: ContextHandle) -> Option<Arc<Context>> {
        self.contexts.lock().get(&handle).map(Arc::clone)
    }

    #[must_use]
    pub fn context_count(&self) -> usize {
        self.contexts.lock().len()
    }

    pub(crate) fn lock_contexts(&self) -> MutexGuard<'_, ContextRegistry> {
        self.contexts.lock()
    }
}
