//! Cursor-based byte streams over graphics allocations.
//!
//! The bytes are opaque here; an external encoder fills them. The streams only
//! track backing memory and how much of it has been consumed.

use crate::error::{NeoError, NeoResult};
use crate::memory::AllocationRef;
use crate::utils::align_up;

#[derive(Debug, Default)]
pub struct LinearStream {
    allocation: Option<AllocationRef>,
    max_available: usize,
    used: usize,
}

impl LinearStream {
    #[must_use]
    pub fn new(allocation: AllocationRef) -> Self {
        let max_available = allocation.underlying_buffer_size();
        Self::with_size(allocation, max_available)
    }

    /// Stream over the first `max_available` bytes of `allocation`.
    #[must_use]
    pub const fn with_size(allocation: AllocationRef, max_available: usize) -> Self {
        Self {
            allocation: Some(allocation),
            max_available,
            used: 0,
        }
    }

    #[must_use]
    pub const fn graphics_allocation(&self) -> Option<&AllocationRef> {
        self.allocation.as_ref()
    }

    #[must_use]
    pub const fn max_available_space(&self) -> usize {
        self.max_available
    }

    #[must_use]
    pub const fn available_space(&self) -> usize {
        self.max_available - self.used
    }

    #[must_use]
    pub const fn used(&self) -> usize {
        self.used
    }

    #[must_use]
    pub fn gpu_base(&self) -> u64 {
        self.allocation.as_ref().map_or(0, |a| a.gpu_address())
    }

    /// Reserves `size` bytes and returns their offset from the stream start.
    pub fn get_space(&mut self, size: usize) -> NeoResult<usize> {
        if size > self.available_space() {
            return Err(NeoError::InvalidSize(size));
        }
        let offset = self.used;
        self.used += size;
        Ok(offset)
    }

    /// Appends `data` and returns the offset it was written at.
    pub fn write(&mut self, data: &[u8]) -> NeoResult<usize> {
        let allocation = self
            .allocation
            .clone()
            .ok_or_else(|| NeoError::InvalidAllocation("stream has no backing".into()))?;
        let offset = self.get_space(data.len())?;
        allocation.write(offset, data)?;
        Ok(offset)
    }

    /// Switches to a new backing buffer and rewinds.
    pub fn replace_buffer(&mut self, allocation: AllocationRef, max_available: usize) {
        self.allocation = Some(allocation);
        self.max_available = max_available;
        self.used = 0;
    }

    /// Swaps the allocation without touching the cursor; returns the previous one.
    pub fn replace_graphics_allocation(&mut self, allocation: Option<AllocationRef>) -> Option<AllocationRef> {
        std::mem::replace(&mut self.allocation, allocation)
    }

    pub fn rewind(&mut self) {
        self.used = 0;
    }

    /// Drops everything written past `offset`.
    pub fn rewind_to(&mut self, offset: usize) {
        self.used = self.used.min(offset);
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum HeapType {
    DynamicState,
    IndirectObject,
    SurfaceState,
}

impl HeapType {
    pub const COUNT: usize = 3;
    pub const ALL: [Self; Self::COUNT] = [Self::DynamicState, Self::IndirectObject, Self::SurfaceState];

    #[must_use]
    pub const fn index(self) -> usize {
        match self {
            Self::DynamicState => 0,
            Self::IndirectObject => 1,
            Self::SurfaceState => 2,
        }
    }

    #[must_use]
    pub const fn dirty_bit(self) -> u32 {
        1 << self.index()
    }
}

/// Stream whose base address is programmed into the engine; commands refer
/// to heap contents by offset.
#[derive(Debug)]
pub struct IndirectHeap {
    heap_type: HeapType,
    stream: LinearStream,
}

impl IndirectHeap {
    #[must_use]
    pub fn new(heap_type: HeapType, allocation: AllocationRef) -> Self {
        Self {
            heap_type,
            stream: LinearStream::new(allocation),
        }
    }

    /// Heap with no backing yet.
    #[must_use]
    pub fn empty(heap_type: HeapType) -> Self {
        Self {
            heap_type,
            stream: LinearStream::default(),
        }
    }

    #[must_use]
    pub const fn heap_type(&self) -> HeapType {
        self.heap_type
    }

    #[must_use]
    pub const fn stream(&self) -> &LinearStream {
        &self.stream
    }

    pub const fn stream_mut(&mut self) -> &mut LinearStream {
        &mut self.stream
    }

    #[must_use]
    pub fn heap_gpu_base(&self) -> u64 {
        self.stream.gpu_base()
    }

    #[must_use]
    pub const fn available_space(&self) -> usize {
        self.stream.available_space()
    }

    #[must_use]
    pub const fn used(&self) -> usize {
        self.stream.used()
    }

    #[must_use]
    pub const fn graphics_allocation(&self) -> Option<&AllocationRef> {
        self.stream.graphics_allocation()
    }

    /// Advances the cursor to the next multiple of `alignment`.
    pub fn align(&mut self, alignment: usize) -> NeoResult<()> {
        let aligned = align_up(self.stream.used(), alignment);
        let pad = aligned - self.stream.used();
        self.stream.get_space(pad).map(|_| ())
    }

    pub fn get_space(&mut self, size: usize) -> NeoResult<usize> {
        self.stream.get_space(size)
    }

    pub fn replace_buffer(&mut self, allocation: AllocationRef) {
        let size = allocation.underlying_buffer_size();
        self.stream.replace_buffer(allocation, size);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::memory::manager::{MemoryConfig, MemoryManager};
    use crate::memory::AllocationType;

    #[test]
    fn space_is_consumed_until_exhausted() {
        let mm = MemoryManager::new(MemoryConfig::default());
        let alloc = mm.allocate(256, AllocationType::LinearStream).unwrap();
        let mut stream = LinearStream::with_size(alloc.clone(), 128);
        assert_eq!(stream.get_space(100).unwrap(), 0);
        assert_eq!(stream.write(&[7; 8]).unwrap(), 100);
        assert_eq!(stream.available_space(), 20);
        assert!(matches!(stream.get_space(21), Err(NeoError::InvalidSize(21))));

        let mut byte = [0u8];
        alloc.read(107, &mut byte).unwrap();
        assert_eq!(byte, [7]);

        stream.rewind();
        assert_eq!(stream.available_space(), 128);
    }

    #[test]
    fn heap_alignment_pads_cursor() {
        let mm = MemoryManager::new(MemoryConfig::default());
        let alloc = mm.allocate(4096, AllocationType::InternalHeap).unwrap();
        let mut heap = IndirectHeap::new(HeapType::DynamicState, alloc);
        heap.get_space(10).unwrap();
        heap.align(64).unwrap();
        assert_eq!(heap.used(), 64);
        assert_eq!(heap.heap_gpu_base() % 4096, 0);
    }
}
