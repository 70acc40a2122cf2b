//! The disjoint pool: power-of-two buckets of slabs carved from coarse
//! provider allocations.
//!
//! Every chunk size between the kind's minimum bucket and its largest
//! poolable size has its own bucket. A bucket owns the slabs of its size
//! class. Requests above the poolable limit (or with an alignment no slab can
//! satisfy) go straight to the provider and are tracked separately.
//!
//! Lock order is bucket before slab index. The index is never held while a
//! bucket lock is acquired.

use super::PoolKind;
use super::config::{DisjointPoolConfig, MAX_POOLABLE_SIZE_LIMIT};
use super::provider::MemoryProvider;
use crate::error::{UsmError, UsmResult};
use crate::utils::{KIB, round_up};
use parking_lot::{Mutex, RwLock};
use std::collections::BTreeMap;
use std::sync::Arc;
use std::sync::atomic::{AtomicUsize, Ordering};

/// Slabs are never aligned beyond this. Larger alignments bypass the pool.
pub const MAX_SLAB_ALIGNMENT: usize = 64 * KIB;

// ===============================================================================================
// Shared Limits
// ===============================================================================================

/// Byte budget for empty slabs retained by every allocator of one pool.
#[derive(Debug)]
pub struct SharedLimits {
    max_size: usize,
    total_size: AtomicUsize,
}

impl SharedLimits {
    #[must_use]
    pub const fn new(max_size: usize) -> Self {
        Self {
            max_size,
            total_size: AtomicUsize::new(0),
        }
    }

    #[must_use]
    pub const fn max_size(&self) -> usize {
        self.max_size
    }

    #[must_use]
    pub fn total_size(&self) -> usize {
        self.total_size.load(Ordering::Acquire)
    }

    /// Claims `size` bytes of the budget if they fit.
    pub fn try_reserve(&self, size: usize) -> bool {
        self.total_size
            .fetch_update(Ordering::AcqRel, Ordering::Acquire, |total| {
                total
                    .checked_add(size)
                    .filter(|&next| next <= self.max_size)
            })
            .is_ok()
    }

    pub fn release(&self, size: usize) {
        self.total_size.fetch_sub(size, Ordering::AcqRel);
    }
}

// ===============================================================================================
// Slabs and Buckets
// ===============================================================================================

#[derive(Debug)]
struct Slab {
    base: usize,
    size: usize,
    chunk_size: usize,
    used: usize,
    /// One bit per chunk, set while the chunk is free.
    free_map: Vec<u64>,
    /// Requested size of each allocated chunk.
    requested: Vec<usize>,
    /// Chunk index freed most recently.
    hint: usize,
}

impl Slab {
    /// A new slab with its first chunk handed to a request of `requested`
    /// bytes.
    fn carve(base: usize, size: usize, chunk_size: usize, requested: usize) -> Self {
        let chunks = size / chunk_size;
        let mut free_map = vec![u64::MAX; chunks.div_ceil(64)];
        if chunks % 64 != 0 {
            if let Some(last) = free_map.last_mut() {
                *last = (1u64 << (chunks % 64)) - 1;
            }
        }
        let mut slab = Self {
            base,
            size,
            chunk_size,
            used: 0,
            free_map,
            requested: vec![0; chunks],
            hint: 0,
        };
        slab.claim(0, requested);
        slab
    }

    const fn chunk_count(&self) -> usize {
        self.size / self.chunk_size
    }

    const fn is_full(&self) -> bool {
        self.used == self.chunk_count()
    }

    const fn is_empty(&self) -> bool {
        self.used == 0
    }

    fn is_free(&self, index: usize) -> bool {
        self.free_map[index / 64] & (1 << (index % 64)) != 0
    }

    fn claim(&mut self, index: usize, requested: usize) -> usize {
        self.free_map[index / 64] &= !(1 << (index % 64));
        self.requested[index] = requested;
        self.used += 1;
        self.base + index * self.chunk_size
    }

    fn take_chunk(&mut self, requested: usize) -> Option<usize> {
        if self.is_full() {
            return None;
        }
        let index = if self.is_free(self.hint) {
            self.hint
        } else {
            self.free_map
                .iter()
                .enumerate()
                .find(|(_, word)| **word != 0)
                .map(|(i, word)| i * 64 + word.trailing_zeros() as usize)?
        };
        Some(self.claim(index, requested))
    }

    /// Returns `false` for addresses that are not the start of a live chunk.
    fn release_chunk(&mut self, ptr: usize) -> bool {
        let offset = ptr - self.base;
        let index = offset / self.chunk_size;
        if offset % self.chunk_size != 0 || index >= self.chunk_count() || self.is_free(index) {
            return false;
        }
        self.free_map[index / 64] |= 1 << (index % 64);
        self.requested[index] = 0;
        self.used -= 1;
        self.hint = index;
        true
    }

    /// Start and requested size of the live chunk containing `ptr`.
    fn live_chunk(&self, ptr: usize) -> Option<(usize, usize)> {
        let index = (ptr - self.base) / self.chunk_size;
        if index >= self.chunk_count() || self.is_free(index) {
            return None;
        }
        let start = self.base + index * self.chunk_size;
        (ptr < start + self.requested[index]).then_some((start, self.requested[index]))
    }
}

/// Counters for one size class.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct BucketStats {
    pub chunk_size: usize,
    pub allocs: usize,
    pub frees: usize,
    pub slab_allocs: usize,
    pub slab_frees: usize,
    /// Allocations served from a retained empty slab.
    pub pooled_hits: usize,
    pub peak_slabs: usize,
}

#[derive(Debug)]
struct Bucket {
    chunk_size: usize,
    slabs: BTreeMap<usize, Slab>,
    /// Base of the slab that last had a chunk freed.
    last_freed: Option<usize>,
    empty_slabs: usize,
    stats: BucketStats,
}

impl Bucket {
    fn new(chunk_size: usize) -> Self {
        Self {
            chunk_size,
            slabs: BTreeMap::new(),
            last_freed: None,
            empty_slabs: 0,
            stats: BucketStats {
                chunk_size,
                ..BucketStats::default()
            },
        }
    }

    fn take_chunk(&mut self, requested: usize, limits: &SharedLimits) -> Option<usize> {
        let base = self
            .last_freed
            .filter(|base| self.slabs.get(base).is_some_and(|s| !s.is_full()))
            .or_else(|| {
                self.slabs
                    .iter()
                    .find(|(_, slab)| !slab.is_full())
                    .map(|(&base, _)| base)
            })?;

        let slab = self.slabs.get_mut(&base)?;
        if slab.is_empty() {
            self.empty_slabs -= 1;
            self.stats.pooled_hits += 1;
            limits.release(slab.size);
        }
        slab.take_chunk(requested)
    }
}

// ===============================================================================================
// Disjoint Pool
// ===============================================================================================

/// Aggregate counters for a whole allocator.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct PoolStats {
    pub allocs: usize,
    pub frees: usize,
    pub slab_allocs: usize,
    pub slab_frees: usize,
    pub large_allocs: usize,
    pub large_frees: usize,
    pub live_slabs: usize,
    pub retained_slabs: usize,
}

#[derive(Debug, Default)]
struct LargeAllocations {
    live: BTreeMap<usize, usize>,
    allocs: usize,
    frees: usize,
}

/// Slab allocator for one pool kind on one device.
#[derive(Debug)]
pub struct DisjointPool {
    provider: MemoryProvider,
    config: DisjointPoolConfig,
    limits: Arc<SharedLimits>,
    trace: u32,
    min_chunk_size: usize,
    buckets: Vec<Mutex<Bucket>>,
    /// Slab base -> (bucket index, slab size).
    slab_index: RwLock<BTreeMap<usize, (usize, usize)>>,
    large: Mutex<LargeAllocations>,
}

impl DisjointPool {
    #[must_use]
    pub fn new(
        provider: MemoryProvider,
        mut config: DisjointPoolConfig,
        limits: Arc<SharedLimits>,
        trace: u32,
    ) -> Self {
        config.max_poolable_size = config.max_poolable_size.min(MAX_POOLABLE_SIZE_LIMIT);
        config.slab_min_size = config.slab_min_size.min(MAX_POOLABLE_SIZE_LIMIT);
        let min_chunk_size = config.min_bucket_size.next_power_of_two();
        let mut buckets = Vec::new();
        if config.pooling_enabled() {
            let top = config.max_poolable_size.next_power_of_two().max(min_chunk_size);
            let mut chunk_size = min_chunk_size;
            loop {
                buckets.push(Mutex::new(Bucket::new(chunk_size)));
                if chunk_size >= top {
                    break;
                }
                chunk_size <<= 1;
            }
        }

        tracing::debug!(
            pool = config.name,
            buckets = buckets.len(),
            max_poolable = config.max_poolable_size,
            "disjoint pool created"
        );

        Self {
            provider,
            config,
            limits,
            trace,
            min_chunk_size,
            buckets,
            slab_index: RwLock::new(BTreeMap::new()),
            large: Mutex::new(LargeAllocations::default()),
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

    #[must_use]
    pub const fn config(&self) -> &DisjointPoolConfig {
        &self.config
    }

    fn bucket_for(&self, size: usize, alignment: usize) -> Option<usize> {
        if !self.config.pooling_enabled()
            || size > self.config.max_poolable_size
            || alignment > MAX_SLAB_ALIGNMENT
        {
            return None;
        }
        let chunk_size = size
            .next_power_of_two()
            .max(self.min_chunk_size)
            .max(alignment);
        let index = (chunk_size.trailing_zeros() - self.min_chunk_size.trailing_zeros()) as usize;
        (index < self.buckets.len()).then_some(index)
    }

    /// # Errors
    /// * `InvalidUsmSize` for a zero size.
    /// * The provider's error, untranslated, when a new slab cannot be made.
    pub fn alloc(&self, size: usize, alignment: usize) -> UsmResult<usize> {
        if size == 0 {
            return Err(UsmError::InvalidUsmSize);
        }
        match self.bucket_for(size, alignment) {
            Some(index) => self.alloc_chunk(index, size),
            None => self.alloc_large(size, alignment),
        }
    }

    fn alloc_large(&self, size: usize, alignment: usize) -> UsmResult<usize> {
        let ptr = self.provider.alloc(size, alignment)?;
        let mut large = self.large.lock();
        large.live.insert(ptr, size);
        large.allocs += 1;
        Ok(ptr)
    }

    fn alloc_chunk(&self, index: usize, size: usize) -> UsmResult<usize> {
        let mut bucket = self.buckets[index].lock();

        if let Some(ptr) = bucket.take_chunk(size, &self.limits) {
            bucket.stats.allocs += 1;
            return Ok(ptr);
        }

        // 1. Size the slab so it holds whole chunks and is never below the
        //    minimum provider allocation.
        let chunk_size = bucket.chunk_size;
        let slab_size = round_up(self.config.slab_min_size.max(chunk_size), chunk_size);
        let slab_alignment = chunk_size.min(MAX_SLAB_ALIGNMENT);

        // 2. Ask the provider. Failures surface untranslated.
        let base = self.provider.alloc(slab_size, slab_alignment)?;

        // 3. Register the slab and hand out its first chunk.
        self.slab_index.write().insert(base, (index, slab_size));
        bucket.slabs.insert(base, Slab::carve(base, slab_size, chunk_size, size));
        bucket.stats.allocs += 1;
        bucket.stats.slab_allocs += 1;
        bucket.stats.peak_slabs = bucket.stats.peak_slabs.max(bucket.slabs.len());

        tracing::debug!(
            pool = self.config.name,
            base = format_args!("0x{base:x}"),
            slab_size,
            chunk_size,
            "slab allocated"
        );
        Ok(base)
    }

    fn slab_containing(&self, ptr: usize) -> Option<(usize, usize)> {
        let index = self.slab_index.read();
        let (&base, &(bucket, size)) = index.range(..=ptr).next_back()?;
        (ptr < base + size).then_some((base, bucket))
    }

    /// # Errors
    /// * `InvalidMemObject` if `ptr` is not a live allocation of this pool.
    /// * The provider's error when releasing memory fails.
    pub fn free(&self, ptr: usize) -> UsmResult<()> {
        {
            let mut large = self.large.lock();
            if let Some(size) = large.live.remove(&ptr) {
                large.frees += 1;
                drop(large);
                return self.provider.free(ptr, size);
            }
        }

        let (base, index) = self
            .slab_containing(ptr)
            .ok_or(UsmError::InvalidMemObject(ptr))?;

        let mut bucket = self.buckets[index].lock();
        let slab = bucket
            .slabs
            .get_mut(&base)
            .ok_or(UsmError::InvalidMemObject(ptr))?;
        if !slab.release_chunk(ptr) {
            return Err(UsmError::InvalidMemObject(ptr));
        }
        let (now_empty, slab_size) = (slab.is_empty(), slab.size);

        bucket.stats.frees += 1;
        bucket.last_freed = Some(base);

        if !now_empty {
            return Ok(());
        }

        if bucket.empty_slabs < self.config.capacity && self.limits.try_reserve(slab_size) {
            bucket.empty_slabs += 1;
            return Ok(());
        }

        bucket.slabs.remove(&base);
        bucket.last_freed = None;
        bucket.stats.slab_frees += 1;
        self.slab_index.write().remove(&base);
        drop(bucket);

        tracing::debug!(
            pool = self.config.name,
            base = format_args!("0x{base:x}"),
            slab_size,
            "slab released"
        );
        self.provider.free(base, slab_size)
    }

    /// Start and requested size of the live allocation containing `ptr`.
    #[must_use]
    pub fn find_allocation(&self, ptr: usize) -> Option<(usize, usize)> {
        {
            let large = self.large.lock();
            if let Some((&base, &size)) = large.live.range(..=ptr).next_back() {
                if ptr < base + size {
                    return Some((base, size));
                }
            }
        }

        let (base, index) = self.slab_containing(ptr)?;
        let bucket = self.buckets[index].lock();
        bucket.slabs.get(&base)?.live_chunk(ptr)
    }

    #[must_use]
    pub fn owns(&self, ptr: usize) -> bool {
        self.find_allocation(ptr).is_some()
    }

    #[must_use]
    pub fn bucket_stats(&self) -> Vec<BucketStats> {
        self.buckets.iter().map(|b| b.lock().stats).collect()
    }

    #[must_use]
    pub fn stats(&self) -> PoolStats {
        let mut stats = PoolStats::default();
        for bucket in &self.buckets {
            let bucket = bucket.lock();
            stats.allocs += bucket.stats.allocs;
            stats.frees += bucket.stats.frees;
            stats.slab_allocs += bucket.stats.slab_allocs;
            stats.slab_frees += bucket.stats.slab_frees;
            stats.live_slabs += bucket.slabs.len();
            stats.retained_slabs += bucket.empty_slabs;
        }
        let large = self.large.lock();
        stats.allocs += large.allocs;
        stats.frees += large.frees;
        stats.large_allocs = large.allocs;
        stats.large_frees = large.frees;
        stats
    }

    /// `(base, size, chunk_size)` of every slab currently held.
    #[must_use]
    pub fn slab_ranges(&self) -> Vec<(usize, usize, usize)> {
        self.buckets
            .iter()
            .flat_map(|bucket| {
                let bucket = bucket.lock();
                bucket
                    .slabs
                    .values()
                    .map(|s| (s.base, s.size, s.chunk_size))
                    .collect::<Vec<_>>()
            })
            .collect()
    }

    fn print_stats(&self) {
        tracing::info!(pool = self.config.name, "disjoint pool statistics");
        tracing::info!(
            "{:>14}{:>10}{:>10}{:>12}{:>12}{:>12}{:>12}",
            "Bucket",
            "Allocs",
            "Frees",
            "SlabAllocs",
            "SlabFrees",
            "PooledHits",
            "PeakSlabs"
        );
        for stats in self.bucket_stats().iter().filter(|s| s.allocs > 0) {
            tracing::info!(
                "{:>14}{:>10}{:>10}{:>12}{:>12}{:>12}{:>12}",
                stats.chunk_size,
                stats.allocs,
                stats.frees,
                stats.slab_allocs,
                stats.slab_frees,
                stats.pooled_hits,
                stats.peak_slabs
            );
        }
        let large = self.large.lock();
        tracing::info!(allocs = large.allocs, frees = large.frees, "unpooled allocations");
    }
}

impl Drop for DisjointPool {
    fn drop(&mut self) {
        if self.trace >= 2 {
            self.print_stats();
        }

        for bucket in &self.buckets {
            let mut bucket = bucket.lock();
            let chunk_size = bucket.chunk_size;
            for (base, slab) in std::mem::take(&mut bucket.slabs) {
                if slab.is_empty() {
                    self.limits.release(slab.size);
                } else {
                    tracing::warn!(
                        pool = self.config.name,
                        chunk_size,
                        live = slab.used,
                        "releasing slab with live chunks"
                    );
                }
                if let Err(e) = self.provider.free(base, slab.size) {
                    tracing::error!(base = format_args!("0x{base:x}"), "slab release failed: {e}");
                }
            }
            bucket.empty_slabs = 0;
        }

        for (ptr, size) in std::mem::take(&mut self.large.lock().live) {
            if let Err(e) = self.provider.free(ptr, size) {
                tracing::error!(ptr = format_args!("0x{ptr:x}"), "release failed: {e}");
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::ResidencyPolicy;
    use crate::native::DeviceFamily;
    use crate::native::mock::MockDriver;
    use crate::usm::provider::tests::test_binding;
    use crate::utils::MIB;

    fn host_pool(driver: &Arc<MockDriver>, config: DisjointPoolConfig, max_pool: usize) -> DisjointPool {
        let (binding, _) = test_binding(driver, ResidencyPolicy::none());
        let provider = MemoryProvider::initialize(PoolKind::Host, &binding, None, false).unwrap();
        DisjointPool::new(provider, config, Arc::new(SharedLimits::new(max_pool)), 0)
    }

    fn gpu() -> Arc<MockDriver> {
        MockDriver::builder().gpu(DeviceFamily::GpuPvc, 0).build()
    }

    fn host_config() -> DisjointPoolConfig {
        DisjointPoolConfig::default_for(PoolKind::Host)
    }

    #[test]
    fn test_freed_chunk_is_reused() {
        let driver = gpu();
        let pool = host_pool(&driver, host_config(), 16 * MIB);

        let a = pool.alloc(64, 0).unwrap();
        pool.free(a).unwrap();
        let b = pool.alloc(64, 0).unwrap();
        assert_eq!(a, b);
        assert_eq!(driver.stats().allocs, 1);
    }

    #[test]
    fn test_oversized_config_is_clamped() {
        let driver = gpu();
        let config = DisjointPoolConfig {
            max_poolable_size: usize::MAX,
            slab_min_size: usize::MAX,
            ..host_config()
        };
        let pool = host_pool(&driver, config, 16 * MIB);
        assert_eq!(pool.config().max_poolable_size, MAX_POOLABLE_SIZE_LIMIT);
        assert_eq!(pool.buckets.len(), 58);

        let ptr = pool.alloc(64, 0);
        assert!(ptr.is_err());
        assert_eq!(driver.live_allocations(), 0);
    }

    #[test]
    fn test_size_classes_round_up() {
        let driver = gpu();
        let pool = host_pool(&driver, host_config(), 16 * MIB);

        let a = pool.alloc(100, 0).unwrap();
        let b = pool.alloc(100, 0).unwrap();
        assert_eq!(b - a, 128);
        assert_eq!(pool.find_allocation(a + 99), Some((a, 100)));
        assert_eq!(pool.find_allocation(a + 100), None);
    }

    #[test]
    fn test_alignment_is_honoured() {
        let driver = gpu();
        let pool = host_pool(&driver, host_config(), 16 * MIB);

        for alignment in [0, 8, 64, 256, 4096, 64 * KIB] {
            let ptr = pool.alloc(24, alignment).unwrap();
            if alignment > 0 {
                assert_eq!(ptr % alignment, 0, "alignment {alignment}");
            }
        }

        let ptr = pool.alloc(24, 128 * KIB).unwrap();
        assert_eq!(ptr % (128 * KIB), 0);
        assert_eq!(pool.stats().large_allocs, 1);
    }

    #[test]
    fn test_large_requests_bypass_slabs() {
        let driver = gpu();
        let pool = host_pool(&driver, host_config(), 16 * MIB);

        let ptr = pool.alloc(3 * MIB, 0).unwrap();
        assert!(pool.slab_ranges().is_empty());
        assert_eq!(pool.find_allocation(ptr + MIB), Some((ptr, 3 * MIB)));

        pool.free(ptr).unwrap();
        assert!(!driver.is_live(ptr));
        let stats = pool.stats();
        assert_eq!((stats.large_allocs, stats.large_frees), (1, 1));
    }

    #[test]
    fn test_disabled_pooling_forwards_everything() {
        let driver = gpu();
        let pool = host_pool(&driver, DisjointPoolConfig::default_for(PoolKind::Shared), 16 * MIB);

        let a = pool.alloc(64, 0).unwrap();
        let b = pool.alloc(64, 0).unwrap();
        assert_eq!(driver.live_allocations(), 2);
        pool.free(a).unwrap();
        pool.free(b).unwrap();
        assert_eq!(driver.live_allocations(), 0);
    }

    #[test]
    fn test_live_chunks_fall_in_one_slab() {
        let driver = gpu();
        let pool = host_pool(&driver, host_config(), 16 * MIB);

        let ptrs: Vec<usize> = [64, 200, 4000, 70_000, 64, 1024]
            .into_iter()
            .cycle()
            .take(600)
            .map(|size| pool.alloc(size, 0).unwrap())
            .collect();

        let slabs = pool.slab_ranges();
        for ptr in ptrs {
            let owners = slabs
                .iter()
                .filter(|(base, size, _)| *base <= ptr && ptr < base + size)
                .count();
            assert_eq!(owners, 1, "chunk 0x{ptr:x}");
        }
    }

    #[test]
    fn test_empty_slabs_retained_up_to_capacity() {
        let driver = gpu();
        let config = DisjointPoolConfig {
            capacity: 1,
            ..host_config()
        };
        let pool = host_pool(&driver, config, 16 * MIB);

        // One 64 KiB chunk per slab.
        let a = pool.alloc(64 * KIB, 0).unwrap();
        let b = pool.alloc(64 * KIB, 0).unwrap();
        assert_eq!(driver.live_allocations(), 2);

        pool.free(a).unwrap();
        pool.free(b).unwrap();
        assert_eq!(driver.live_allocations(), 1);
        assert_eq!(pool.stats().retained_slabs, 1);
        assert_eq!(pool.limits.total_size(), 64 * KIB);

        let allocs = driver.stats().allocs;
        pool.alloc(64 * KIB, 0).unwrap();
        assert_eq!(driver.stats().allocs, allocs);
        assert_eq!(pool.limits.total_size(), 0);
    }

    #[test]
    fn test_shared_limit_caps_retention() {
        let driver = gpu();
        let pool = host_pool(&driver, host_config(), 0);

        let ptr = pool.alloc(64, 0).unwrap();
        pool.free(ptr).unwrap();
        assert_eq!(driver.live_allocations(), 0);
        assert_eq!(pool.stats().retained_slabs, 0);
    }

    #[test]
    fn test_foreign_and_double_free() {
        let driver = gpu();
        let pool = host_pool(&driver, host_config(), 16 * MIB);

        assert!(matches!(pool.free(0x1234), Err(UsmError::InvalidMemObject(0x1234))));

        let a = pool.alloc(64, 0).unwrap();
        let _keep = pool.alloc(64, 0).unwrap();
        pool.free(a).unwrap();
        assert!(matches!(pool.free(a), Err(UsmError::InvalidMemObject(_))));
        assert!(!pool.owns(a));
        assert!(matches!(pool.free(a + 8), Err(UsmError::InvalidMemObject(_))));
    }

    #[test]
    fn test_provider_failure_propagates() {
        let driver = gpu();
        let pool = host_pool(&driver, host_config(), 16 * MIB);

        driver.inject_alloc_failure(UsmError::OutOfHostMemory);
        assert!(matches!(pool.alloc(64, 0), Err(UsmError::OutOfHostMemory)));
        assert!(pool.slab_ranges().is_empty());
    }

    #[test]
    fn test_drop_returns_everything() {
        let driver = gpu();
        let limits = Arc::new(SharedLimits::new(16 * MIB));
        {
            let (binding, _) = test_binding(&driver, ResidencyPolicy::none());
            let provider = MemoryProvider::initialize(PoolKind::Host, &binding, None, false).unwrap();
            let pool = DisjointPool::new(provider, host_config(), Arc::clone(&limits), 2);
            let a = pool.alloc(64, 0).unwrap();
            pool.alloc(4 * MIB, 0).unwrap();
            pool.free(a).unwrap();
            assert!(limits.total_size() > 0);
        }
        assert_eq!(driver.live_allocations(), 0);
        assert_eq!(limits.total_size(), 0);
    }

    #[test]
    fn test_shared_limits_reserve() {
        let limits = SharedLimits::new(100);
        assert!(limits.try_reserve(60));
        assert!(!limits.try_reserve(60));
        assert!(limits.try_reserve(40));
        limits.release(100);
        assert_eq!(limits.total_size(), 0);
    }
}
