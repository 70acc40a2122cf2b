use super::interceptor::AllocInfo;
use crate::native::DeviceHandle;
use parking_lot::Mutex;
use std::collections::{HashMap, VecDeque};
use std::sync::Arc;

#[derive(Debug, Default)]
struct QuarantineQueue {
    entries: VecDeque<Arc<AllocInfo>>,
    size: usize,
}

/// Freed allocations held back so late accesses still hit poisoned shadow.
///
/// Each device (and host memory, keyed by `None`) has its own FIFO with a
/// budget of `max_size` bytes.
#[derive(Debug)]
pub struct Quarantine {
    max_size: usize,
    queues: Mutex<HashMap<Option<DeviceHandle>, QuarantineQueue>>,
}

impl Quarantine {
    #[must_use]
    pub fn new(max_size: usize) -> Self {
        Self {
            max_size,
            queues: Mutex::new(HashMap::new()),
        }
    }

    #[must_use]
    pub const fn max_size(&self) -> usize {
        self.max_size
    }

    /// Queues `info` and returns the oldest entries evicted to make room.
    ///
    /// An entry larger than the whole budget is still queued once everything
    /// older has been evicted.
    pub fn put(&self, device: Option<DeviceHandle>, info: Arc<AllocInfo>) -> Vec<Arc<AllocInfo>> {
        let mut queues = self.queues.lock();
        let queue = queues.entry(device).or_default();

        let mut evicted = Vec::new();
        while queue.size + info.alloc_size > self.max_size {
            let Some(oldest) = queue.entries.pop_front() else {
                break;
            };
            queue.size -= oldest.alloc_size;
            evicted.push(oldest);
        }

        queue.size += info.alloc_size;
        queue.entries.push_back(info);
        evicted
    }

    /// Bytes currently held for `device`.
    #[must_use]
    pub fn size_of(&self, device: Option<DeviceHandle>) -> usize {
        self.queues.lock().get(&device).map_or(0, |q| q.size)
    }

    #[must_use]
    pub fn len_of(&self, device: Option<DeviceHandle>) -> usize {
        self.queues.lock().get(&device).map_or(0, |q| q.entries.len())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::native::{ContextHandle, UsmKind};

    fn info(alloc_begin: usize, alloc_size: usize) -> Arc<AllocInfo> {
        Arc::new(AllocInfo::new(
            alloc_begin,
            alloc_begin + 16,
            alloc_size - 32,
            alloc_size,
            UsmKind::Host,
            ContextHandle(1),
            None,
        ))
    }

    #[test]
    fn test_fifo_eviction() {
        let quarantine = Quarantine::new(256);
        assert!(quarantine.put(None, info(0x1000, 128)).is_empty());
        assert!(quarantine.put(None, info(0x2000, 128)).is_empty());
        assert_eq!(quarantine.size_of(None), 256);

        let evicted = quarantine.put(None, info(0x3000, 64));
        assert_eq!(evicted.len(), 1);
        assert_eq!(evicted[0].alloc_begin, 0x1000);
        assert_eq!(quarantine.size_of(None), 192);
        assert_eq!(quarantine.len_of(None), 2);
    }

    #[test]
    fn test_devices_have_separate_budgets() {
        let quarantine = Quarantine::new(128);
        let device = Some(DeviceHandle(0x100));
        assert!(quarantine.put(None, info(0x1000, 128)).is_empty());
        assert!(quarantine.put(device, info(0x2000, 128)).is_empty());
        assert_eq!(quarantine.size_of(device), 128);
    }

    #[test]
    fn test_oversized_entry_flushes_queue() {
        let quarantine = Quarantine::new(128);
        quarantine.put(None, info(0x1000, 64));
        quarantine.put(None, info(0x2000, 64));

        let evicted = quarantine.put(None, info(0x3000, 512));
        let begins: Vec<usize> = evicted.iter().map(|i| i.alloc_begin).collect();
        assert_eq!(begins, [0x1000, 0x2000]);
        assert_eq!(quarantine.size_of(None), 512);

        assert_eq!(quarantine.put(None, info(0x4000, 64)).len(), 1);
    }
}
