use super::PoolKind;
use crate::native::{ContextHandle, NativeDeviceId, UsmKind};
use crate::runtime::device::Device;
use std::hash::{Hash, Hasher};
use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};

static NEXT_POOL_ID: AtomicU64 = AtomicU64::new(1);

/// Identity of a [`super::UsmPool`].
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct PoolId(u64);

impl PoolId {
    #[must_use]
    pub fn next() -> Self {
        Self(NEXT_POOL_ID.fetch_add(1, Ordering::Relaxed))
    }

    #[must_use]
    pub const fn raw(self) -> u64 {
        self.0
    }
}

/// Which logical pool a request maps to.
///
/// Devices compare by native identity, so sub-devices of one card resolve to
/// the same descriptor as their root device. The context takes no part in
/// equality.
#[derive(Debug, Clone)]
pub struct PoolDescriptor {
    pub pool: PoolId,
    pub context: ContextHandle,
    /// `None` for host memory.
    pub device: Option<Arc<Device>>,
    pub kind: UsmKind,
    pub device_read_only: bool,
}

impl PoolDescriptor {
    #[must_use]
    pub const fn new(
        pool: PoolId,
        context: ContextHandle,
        device: Option<Arc<Device>>,
        kind: UsmKind,
        device_read_only: bool,
    ) -> Self {
        Self {
            pool,
            context,
            device,
            kind,
            device_read_only,
        }
    }

    #[must_use]
    pub const fn pool_kind(&self) -> PoolKind {
        PoolKind::new(self.kind, self.device_read_only)
    }

    fn native_id(&self) -> Option<NativeDeviceId> {
        self.device.as_ref().map(|d| d.native_id())
    }

    /// Descriptors for every pool a context needs up front: Host once, then
    /// Device, Shared and read-only Shared for each device and sub-device.
    #[must_use]
    pub fn create_defaults(
        pool: PoolId,
        context: ContextHandle,
        devices: &[Arc<Device>],
    ) -> Vec<Self> {
        fn push_device(
            out: &mut Vec<PoolDescriptor>,
            pool: PoolId,
            context: ContextHandle,
            device: &Arc<Device>,
        ) {
            for (kind, read_only) in [
                (UsmKind::Device, false),
                (UsmKind::Shared, false),
                (UsmKind::Shared, true),
            ] {
                out.push(PoolDescriptor::new(
                    pool,
                    context,
                    Some(Arc::clone(device)),
                    kind,
                    read_only,
                ));
            }
            for sub in device.sub_devices() {
                push_device(out, pool, context, sub);
            }
        }

        let mut descriptors = vec![Self::new(pool, context, None, UsmKind::Host, false)];
        for device in devices {
            push_device(&mut descriptors, pool, context, device);
        }
        descriptors
    }
}

impl PartialEq for PoolDescriptor {
    fn eq(&self, other: &Self) -> bool {
        self.pool == other.pool
            && self.kind == other.kind
            && self.device_read_only == other.device_read_only
            && self.native_id() == other.native_id()
    }
}

impl Eq for PoolDescriptor {}

impl Hash for PoolDescriptor {
    fn hash<H: Hasher>(&self, state: &mut H) {
        self.pool.hash(state);
        self.kind.hash(state);
        self.device_read_only.hash(state);
        self.native_id().hash(state);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::native::mock::MockDriver;
    use crate::native::{DeviceFamily, NativeDriver};
    use std::collections::HashSet;

    fn devices(driver: &MockDriver) -> Vec<Arc<Device>> {
        driver
            .devices()
            .into_iter()
            .map(|handle| Device::discover(driver, handle))
            .collect()
    }

    #[test]
    fn test_sub_devices_share_descriptor() {
        let driver = MockDriver::builder().gpu(DeviceFamily::GpuPvc, 2).build();
        let roots = devices(&driver);
        let subs = roots[0].sub_devices();
        let pool = PoolId::next();
        let context = ContextHandle(1);

        let d1 = PoolDescriptor::new(pool, context, Some(Arc::clone(&subs[0])), UsmKind::Device, false);
        let d2 = PoolDescriptor::new(pool, context, Some(Arc::clone(&subs[1])), UsmKind::Device, false);
        let root = PoolDescriptor::new(pool, context, Some(Arc::clone(&roots[0])), UsmKind::Device, false);
        assert_eq!(d1, d2);
        assert_eq!(d1, root);

        let set: HashSet<_> = [d1, d2, root].into_iter().collect();
        assert_eq!(set.len(), 1);
    }

    #[test]
    fn test_distinct_fields_break_equality() {
        let driver = MockDriver::builder()
            .gpu(DeviceFamily::GpuPvc, 0)
            .gpu(DeviceFamily::GpuPvc, 0)
            .build();
        let roots = devices(&driver);
        let pool = PoolId::next();
        let context = ContextHandle(1);
        let base = PoolDescriptor::new(pool, context, Some(Arc::clone(&roots[0])), UsmKind::Shared, false);

        let mut other = base.clone();
        other.device_read_only = true;
        assert_ne!(base, other);

        let mut other = base.clone();
        other.device = Some(Arc::clone(&roots[1]));
        assert_ne!(base, other);

        let mut other = base.clone();
        other.pool = PoolId::next();
        assert_ne!(base, other);

        let mut other = base.clone();
        other.context = ContextHandle(2);
        assert_eq!(base, other);
    }

    #[test]
    fn test_create_defaults() {
        let driver = MockDriver::builder().gpu(DeviceFamily::GpuDg2, 2).build();
        let roots = devices(&driver);
        let descriptors = PoolDescriptor::create_defaults(PoolId::next(), ContextHandle(1), &roots);

        // Host + 3 per device for the root and both sub-devices.
        assert_eq!(descriptors.len(), 1 + 3 * 3);
        assert_eq!(descriptors[0].pool_kind(), PoolKind::Host);
        assert!(descriptors[0].device.is_none());
        assert_eq!(descriptors[3].pool_kind(), PoolKind::SharedReadOnly);

        // Sub-device entries collapse onto the root's.
        let unique: HashSet<_> = descriptors.into_iter().collect();
        assert_eq!(unique.len(), 4);
    }
}
