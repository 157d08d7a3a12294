use super::ApertureAllocator;
use crate::utils::memory_constants::PAGE_SIZE;
use crate::utils::align_up_u64;
use log::error;
use std::collections::BTreeMap;

/// A managed range of GPU virtual address space.
///
/// Ranges are handed out first-fit. Optional guard pages on both sides keep
/// neighbouring allocations from touching, so an address one past the end
/// of a range never lands inside the next one.
#[derive(Debug)]
pub struct Aperture {
    base: u64,
    limit: u64,
    align: u64,
    guard_pages: u64,

    // Occupied ranges including guards: start -> size
    reservations: BTreeMap<u64, u64>,
}

impl Aperture {
    #[must_use]
    pub fn new(base: u64, limit: u64, align: u64, guard_pages: u64) -> Self {
        Self {
            base,
            limit,
            align,
            guard_pages,
            reservations: BTreeMap::new(),
        }
    }

    const fn guard_size(&self) -> u64 {
        self.guard_pages * PAGE_SIZE as u64
    }

    #[must_use]
    pub fn contains(&self, addr: u64) -> bool {
        addr >= self.base && addr < self.limit
    }

    /// Bytes reserved, guards included.
    #[must_use]
    pub fn reserved_bytes(&self) -> u64 {
        self.reservations.values().sum()
    }
}

impl ApertureAllocator for Aperture {
    fn bounds(&self) -> (u64, u64) {
        (self.base, self.limit)
    }

    fn allocate_va(&mut self, size: usize, align: usize) -> Option<u64> {
        let align = std::cmp::max(align as u64, self.align);
        let guard = self.guard_size();
        let request = align_up_u64(size as u64, PAGE_SIZE as u64) + guard * 2;

        // The returned address (candidate + guard) must honour `align`.
        let mut candidate = align_up_u64(self.base + guard, align) - guard;

        for (&start, &len) in &self.reservations {
            if start >= candidate && start - candidate >= request {
                break;
            }
            let end = start + len;
            if end > candidate {
                candidate = align_up_u64(end + guard, align) - guard;
            }
        }

        if candidate + request <= self.limit {
            self.reservations.insert(candidate, request);
            return Some(candidate + guard);
        }

        None
    }

    fn free_va(&mut self, addr: u64, _size: usize) {
        let tracked_start = addr - self.guard_size();

        if self.reservations.remove(&tracked_start).is_none() {
            error!("[Aperture] tried to free VA 0x{addr:x} which was not reserved");
        }
    }
}
