use crate::error::{UsmError, UsmResult};
use crate::native::{DeviceHandle, UsmKind};
use crate::usm::PoolId;
use std::collections::HashMap;

/// Metadata kept for a live allocation while indirect access tracking is on.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct AllocationRecord {
    pub ptr: usize,
    pub kind: UsmKind,
    pub device: Option<DeviceHandle>,
    pub pool: PoolId,
    pub size: usize,
    ref_count: u32,
}

impl AllocationRecord {
    #[must_use]
    pub const fn new(
        ptr: usize,
        kind: UsmKind,
        device: Option<DeviceHandle>,
        pool: PoolId,
        size: usize,
    ) -> Self {
        Self {
            ptr,
            kind,
            device,
            pool,
            size,
            ref_count: 1,
        }
    }

    #[must_use]
    pub const fn ref_count(&self) -> u32 {
        self.ref_count
    }
}

/// Outcome of dropping one reference to a tracked allocation.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum TrackerRelease {
    /// Other holders remain; the memory must stay allocated.
    Deferred { remaining: u32 },
    /// The record is gone and the memory may be freed.
    Last(AllocationRecord),
}

/// Live pointer -> record map of one context.
#[derive(Debug, Default)]
pub struct AllocationTracker {
    records: HashMap<usize, AllocationRecord>,
}

impl AllocationTracker {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    pub fn insert(&mut self, record: AllocationRecord) {
        if let Some(stale) = self.records.insert(record.ptr, record) {
            tracing::warn!(ptr = format_args!("0x{:x}", stale.ptr), "replaced a stale allocation record");
        }
    }

    #[must_use]
    pub fn get(&self, ptr: usize) -> Option<&AllocationRecord> {
        self.records.get(&ptr)
    }

    /// Adds a reference on behalf of a kernel that may reach `ptr` indirectly.
    ///
    /// # Errors
    /// `InvalidMemObject` if `ptr` is not tracked.
    pub fn retain(&mut self, ptr: usize) -> UsmResult<u32> {
        let record = self
            .records
            .get_mut(&ptr)
            .ok_or(UsmError::InvalidMemObject(ptr))?;
        record.ref_count += 1;
        Ok(record.ref_count)
    }

    /// Drops one reference. `None` if `ptr` is not tracked.
    pub fn release(&mut self, ptr: usize) -> Option<TrackerRelease> {
        let record = self.records.get_mut(&ptr)?;
        record.ref_count -= 1;
        if record.ref_count > 0 {
            return Some(TrackerRelease::Deferred {
                remaining: record.ref_count,
            });
        }
        self.records.remove(&ptr).map(TrackerRelease::Last)
    }

    #[must_use]
    pub fn len(&self) -> usize {
        self.records.len()
    }

    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.records.is_empty()
    }
}
