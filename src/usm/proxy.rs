use super::PoolKind;
use super::provider::MemoryProvider;
use crate::error::{UsmError, UsmResult};
use parking_lot::Mutex;
use std::collections::BTreeMap;

/// Pass-through pool used when the USM allocator is switched off. Every
/// request reaches the provider. Live pointers are remembered so reverse
/// lookups keep working.
#[derive(Debug)]
pub struct ProxyPool {
    provider: MemoryProvider,
    live: Mutex<BTreeMap<usize, usize>>,
}

impl ProxyPool {
    #[must_use]
    pub fn new(provider: MemoryProvider) -> Self {
        Self {
            provider,
            live: Mutex::new(BTreeMap::new()),
        }
    }

    #[must_use]
    pub const fn kind(&self) -> PoolKind {
        self.provider.kind()
    }

    #[must_use]
    pub const fn provider(&self) -> &MemoryProvider {
        &self.provider
    }

    /// # Errors
    /// Returns the provider's error.
    pub fn alloc(&self, size: usize, alignment: usize) -> UsmResult<usize> {
        let ptr = self.provider.alloc(size, alignment)?;
        self.live.lock().insert(ptr, size);
        Ok(ptr)
    }

    /// # Errors
    /// `InvalidMemObject` for pointers this pool did not hand out.
    pub fn free(&self, ptr: usize) -> UsmResult<()> {
        let size = self
            .live
            .lock()
            .remove(&ptr)
            .ok_or(UsmError::InvalidMemObject(ptr))?;
        self.provider.free(ptr, size)
    }

    #[must_use]
    pub fn find_allocation(&self, ptr: usize) -> Option<(usize, usize)> {
        let live = self.live.lock();
        let (&base, &size) = live.range(..=ptr).next_back()?;
        (ptr < base + size).then_some((base, size))
    }
}

impl Drop for ProxyPool {
    fn drop(&mut self) {
        for (ptr, size) in std::mem::take(self.live.get_mut()) {
            tracing::warn!(ptr = format_args!("0x{ptr:x}"), size, "releasing leaked allocation");
            if let Err(e) = self.provider.free(ptr, size) {
                tracing::error!(ptr = format_args!("0x{ptr:x}"), "release failed: {e}");
            }
        }
    }
}
