use std::collections::BTreeMap;

/// Virtual address range allocation strategy.
pub trait ApertureAllocator {
    /// Reserve a virtual address range within this aperture.
    fn allocate_va(&mut self, size: usize, align: usize) -> Option<usize>;

    /// Release a range returned by [`Self::allocate_va`]. Returns `false` if
    /// `addr` was not tracked.
    fn free_va(&mut self, addr: usize) -> bool;

    /// Get the aperture's base and limit.
    fn bounds(&self) -> (usize, usize);
}

/// A managed range of virtual address space.
///
/// Occupied ranges are tracked in an ordered map and new ranges are placed in
/// the first hole that fits, optionally surrounded by guard pages.
#[derive(Debug)]
pub struct Aperture {
    base: usize,
    limit: usize,
    align: usize,
    guard_size: usize,

    // Tracks occupied ranges: Start Address -> Size (guards included)
    allocations: BTreeMap<usize, usize>,
}

impl Aperture {
    #[must_use]
    pub const fn new(base: usize, limit: usize, align: usize, guard_size: usize) -> Self {
        Self {
            base,
            limit,
            align,
            guard_size,
            allocations: BTreeMap::new(),
        }
    }

    #[must_use]
    pub fn contains(&self, addr: usize) -> bool {
        (self.base..self.limit).contains(&addr)
    }

    #[must_use]
    pub fn len(&self) -> usize {
        self.allocations.len()
    }

    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.allocations.is_empty()
    }
}

impl ApertureAllocator for Aperture {
    fn bounds(&self) -> (usize, usize) {
        (self.base, self.limit)
    }

    fn allocate_va(&mut self, size: usize, align: usize) -> Option<usize> {
        let align = align.max(self.align);
        let request_size = size.checked_add(self.guard_size * 2)?;

        // The user address, not the guard, has to honour the alignment.
        let place = |start: usize| -> usize {
            crate::utils::align_up(start + self.guard_size, align) - self.guard_size
        };

        let mut candidate_start = place(self.base);

        for (&alloc_start, &alloc_size) in &self.allocations {
            if alloc_start >= candidate_start && alloc_start - candidate_start >= request_size {
                break;
            }
            candidate_start = candidate_start.max(place(alloc_start + alloc_size));
        }

        if candidate_start.checked_add(request_size)? > self.limit {
            return None; // Out of virtual address space
        }

        self.allocations.insert(candidate_start, request_size);
        Some(candidate_start + self.guard_size)
    }

    fn free_va(&mut self, addr: usize) -> bool {
        let tracked_start = addr - self.guard_size;

        if self.allocations.remove(&tracked_start).is_none() {
            tracing::error!(addr = format_args!("0x{addr:x}"), "freeing untracked VA");
            return false;
        }
        true
    }
}
