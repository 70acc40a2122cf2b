use crate::native::{DeviceFamily, DeviceHandle, NativeDeviceId, NativeDriver};
use std::sync::Arc;

/// A root device or one of its partitions, as reported by the driver.
#[derive(Debug)]
pub struct Device {
    handle: DeviceHandle,
    /// Shared by a root device and all of its sub-devices.
    native_id: NativeDeviceId,
    family: DeviceFamily,
    parent: Option<DeviceHandle>,
    sub_devices: Vec<Arc<Device>>,
}

impl Device {
    /// Queries `handle` and, recursively, its sub-devices.
    pub fn discover(driver: &dyn NativeDriver, handle: DeviceHandle) -> Arc<Self> {
        Self::discover_with_parent(driver, handle, None)
    }

    fn discover_with_parent(
        driver: &dyn NativeDriver,
        handle: DeviceHandle,
        parent: Option<DeviceHandle>,
    ) -> Arc<Self> {
        let sub_devices = driver
            .sub_devices(handle)
            .into_iter()
            .map(|sub| Self::discover_with_parent(driver, sub, Some(handle)))
            .collect();

        Arc::new(Self {
            handle,
            native_id: driver.device_native_id(handle),
            family: driver.device_family(handle),
            parent,
            sub_devices,
        })
    }

    #[must_use]
    pub const fn handle(&self) -> DeviceHandle {
        self.handle
    }

    #[must_use]
    pub const fn native_id(&self) -> NativeDeviceId {
        self.native_id
    }

    #[must_use]
    pub const fn family(&self) -> DeviceFamily {
        self.family
    }

    #[must_use]
    pub const fn parent(&self) -> Option<DeviceHandle> {
        self.parent
    }

    #[must_use]
    pub fn sub_devices(&self) -> &[Arc<Device>] {
        &self.sub_devices
    }
}

/// Depth-first search through `devices` and their sub-devices.
#[must_use]
pub fn find_device(devices: &[Arc<Device>], handle: DeviceHandle) -> Option<Arc<Device>> {
    devices.iter().find_map(|device| {
        if device.handle == handle {
            Some(Arc::clone(device))
        } else {
            find_device(&device.sub_devices, handle)
        }
    })
}

/// Every device in the trees rooted at `devices`, parents before children.
#[must_use]
pub fn flatten(devices: &[Arc<Device>]) -> Vec<Arc<Device>> {
    let mut all = Vec::new();
    for device in devices {
        all.push(Arc::clone(device));
        all.extend(flatten(&device.sub_devices));
    }
    all
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::native::mock::MockDriver;

    #[test]
    fn test_discover_tree() {
        let driver = MockDriver::builder().gpu(DeviceFamily::GpuPvc, 2).build();
        let root = Device::discover(driver.as_ref(), driver.devices()[0]);

        assert_eq!(root.sub_devices().len(), 2);
        let sub = &root.sub_devices()[1];
        assert_eq!(sub.parent(), Some(root.handle()));
        assert_eq!(sub.native_id(), root.native_id());
        assert_eq!(sub.family(), DeviceFamily::GpuPvc);

        let roots = [Arc::clone(&root)];
        assert_eq!(flatten(&roots).len(), 3);
        let found = find_device(&roots, sub.handle()).unwrap();
        assert!(Arc::ptr_eq(&found, sub));
        assert!(find_device(&roots, DeviceHandle(0xdead)).is_none());
    }
}
