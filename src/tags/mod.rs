//! Pools of small GPU-visible records (fences, timestamps).
//!
//! Records are carved out of chunk allocations and addressed by slot index.
//! Every hand-out bumps the slot's generation, so a stale handle can never
//! return a slot that has since been given to someone else.

pub mod timestamp;

use crate::error::NeoResult;
use crate::memory::{AllocationProperties, AllocationRef, AllocationType, MemoryManager};
use crate::utils::align_up;
use crate::utils::memory_constants::CACHE_LINE_SIZE;
use log::{debug, error};
use std::fmt;
use std::marker::PhantomData;
use std::sync::atomic::{AtomicU32, Ordering};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};

pub use timestamp::{HwTimeStamps, TimestampPacketContainer, TimestampPacketStorage};

/// Layout and release policy of one kind of tag record.
pub trait TagPayload: Send + Sync + 'static {
    /// Bytes of GPU-visible data per record; a multiple of 4.
    const RECORD_SIZE: usize;
    const ALLOCATION_TYPE: AllocationType;

    /// Resets the record before it is handed out.
    fn initialize(record: &TagRecord);

    /// Whether the GPU is done with the record.
    fn can_be_released(record: &TagRecord) -> bool;

    /// Distance between consecutive records in a chunk.
    #[must_use]
    fn stride() -> usize {
        align_up(Self::RECORD_SIZE, CACHE_LINE_SIZE)
    }
}

/// Location of one record inside its chunk allocation.
#[derive(Debug, Clone)]
pub struct TagRecord {
    allocation: AllocationRef,
    offset: usize,
    dwords: usize,
}

impl TagRecord {
    #[must_use]
    pub const fn allocation(&self) -> &AllocationRef {
        &self.allocation
    }

    /// Byte offset of the record in its allocation.
    #[must_use]
    pub const fn offset(&self) -> usize {
        self.offset
    }

    #[must_use]
    pub fn gpu_address(&self) -> u64 {
        self.allocation.gpu_address() + self.offset as u64
    }

    /// Atomic view of the `index`th dword of the record.
    #[must_use]
    pub fn dword(&self, index: usize) -> &AtomicU32 {
        debug_assert!(index < self.dwords, "dword {index} outside tag record");
        // Chunk bounds and alignment were checked when the record was carved.
        unsafe {
            &*self
                .allocation
                .cpu_ptr()
                .add(self.offset + index * 4)
                .cast::<AtomicU32>()
        }
    }

    pub fn load(&self, index: usize) -> u32 {
        self.dword(index).load(Ordering::Acquire)
    }

    pub fn store(&self, index: usize, value: u32) {
        self.dword(index).store(value, Ordering::Release);
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum NodeState {
    Free,
    Used,
    Deferred,
}

#[derive(Debug)]
struct Slot {
    record: TagRecord,
    state: NodeState,
    generation: u32,
    ref_count: Arc<AtomicU32>,
}

#[derive(Debug, Default)]
struct Pool {
    slots: Vec<Slot>,
    free: Vec<usize>,
    deferred: Vec<usize>,
    chunks: Vec<AllocationRef>,
}

/// Occupancy snapshot of a pool.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct TagPoolStats {
    pub free: usize,
    pub used: usize,
    pub deferred: usize,
    pub chunks: usize,
}

struct Inner<T: TagPayload> {
    memory_manager: Arc<MemoryManager>,
    root_device_index: u32,
    tags_per_chunk: usize,
    pool: Mutex<Pool>,
    _payload: PhantomData<fn() -> T>,
}

impl<T: TagPayload> fmt::Debug for Inner<T> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("TagAllocator")
            .field("payload", &std::any::type_name::<T>())
            .field("tags_per_chunk", &self.tags_per_chunk)
            .finish_non_exhaustive()
    }
}

impl<T: TagPayload> Inner<T> {
    fn lock(&self) -> MutexGuard<'_, Pool> {
        self.pool.lock().unwrap_or_else(PoisonError::into_inner)
    }

    fn populate(&self, pool: &mut Pool) -> NeoResult<()> {
        let stride = T::stride();
        let props = AllocationProperties::new(
            self.root_device_index,
            stride * self.tags_per_chunk,
            T::ALLOCATION_TYPE,
        )
        .multi_os_context(true);
        let chunk = self.memory_manager.allocate_graphics_memory_with_properties(&props)?;

        let first = pool.slots.len();
        for i in 0..self.tags_per_chunk {
            pool.slots.push(Slot {
                record: TagRecord {
                    allocation: chunk.clone(),
                    offset: i * stride,
                    dwords: T::RECORD_SIZE / 4,
                },
                state: NodeState::Free,
                generation: 0,
                ref_count: Arc::new(AtomicU32::new(0)),
            });
        }
        // Lowest index on top of the stack.
        pool.free.extend((first..pool.slots.len()).rev());
        pool.chunks.push(chunk);
        debug!(
            "[TagAllocator] {} grew to {} records",
            std::any::type_name::<T>(),
            pool.slots.len()
        );
        Ok(())
    }

    fn release_deferred(pool: &mut Pool) {
        let Pool {
            slots,
            free,
            deferred,
            ..
        } = pool;
        deferred.retain(|&index| {
            let slot = &mut slots[index];
            if T::can_be_released(&slot.record) {
                slot.state = NodeState::Free;
                free.push(index);
                false
            } else {
                true
            }
        });
    }

    fn return_slot(&self, index: usize, generation: u32) {
        let mut pool = self.lock();
        let pool = &mut *pool;
        let Some(slot) = pool.slots.get_mut(index) else {
            error!("[TagAllocator] returned unknown slot {index}");
            return;
        };
        if slot.generation != generation || slot.state != NodeState::Used {
            error!(
                "[TagAllocator] stale return of slot {index} (generation {generation}, current {})",
                slot.generation
            );
            return;
        }
        if T::can_be_released(&slot.record) {
            slot.state = NodeState::Free;
            pool.free.push(index);
        } else {
            slot.state = NodeState::Deferred;
            pool.deferred.push(index);
        }
    }
}

impl<T: TagPayload> Drop for Inner<T> {
    fn drop(&mut self) {
        let pool = self.pool.get_mut().unwrap_or_else(PoisonError::into_inner);
        for chunk in pool.chunks.drain(..) {
            self.memory_manager.check_gpu_usage_and_destroy(chunk);
        }
    }
}

/// Pool allocator for `T` records. Cloning shares the pool.
pub struct TagAllocator<T: TagPayload> {
    inner: Arc<Inner<T>>,
}

impl<T: TagPayload> Clone for TagAllocator<T> {
    fn clone(&self) -> Self {
        Self {
            inner: self.inner.clone(),
        }
    }
}

impl<T: TagPayload> fmt::Debug for TagAllocator<T> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        self.inner.fmt(f)
    }
}

impl<T: TagPayload> TagAllocator<T> {
    #[must_use]
    pub fn new(memory_manager: Arc<MemoryManager>, root_device_index: u32, tags_per_chunk: usize) -> Self {
        Self {
            inner: Arc::new(Inner {
                memory_manager,
                root_device_index,
                tags_per_chunk: tags_per_chunk.max(1),
                pool: Mutex::new(Pool::default()),
                _payload: PhantomData,
            }),
        }
    }

    /// Hands out a record with a reference count of one.
    ///
    /// Reclaims released deferred records before growing the pool.
    ///
    /// # Errors
    /// Propagates the memory manager's error when a new chunk cannot be allocated.
    pub fn get_tag(&self) -> NeoResult<TagNode<T>> {
        let mut pool = self.inner.lock();
        if pool.free.is_empty() {
            Inner::<T>::release_deferred(&mut pool);
        }
        if pool.free.is_empty() {
            self.inner.populate(&mut pool)?;
        }
        let pool = &mut *pool;
        let Some(index) = pool.free.pop() else {
            return Err(crate::error::NeoError::Unrecoverable(
                "tag pool empty after growth".into(),
            ));
        };
        let slot = &mut pool.slots[index];
        slot.state = NodeState::Used;
        slot.generation = slot.generation.wrapping_add(1);
        slot.ref_count.store(1, Ordering::Release);
        T::initialize(&slot.record);

        Ok(TagNode {
            inner: self.inner.clone(),
            index,
            generation: slot.generation,
            record: slot.record.clone(),
            ref_count: slot.ref_count.clone(),
        })
    }

    /// Drops one reference. Same as dropping the handle.
    pub fn return_tag(&self, node: TagNode<T>) {
        drop(node);
    }

    #[must_use]
    pub fn stats(&self) -> TagPoolStats {
        let pool = self.inner.lock();
        let used = pool
            .slots
            .iter()
            .filter(|s| s.state == NodeState::Used)
            .count();
        TagPoolStats {
            free: pool.free.len(),
            used,
            deferred: pool.deferred.len(),
            chunks: pool.chunks.len(),
        }
    }

    /// State of the slot behind `node`, for diagnostics.
    #[must_use]
    pub fn node_state(&self, index: usize) -> Option<NodeState> {
        self.inner.lock().slots.get(index).map(|s| s.state)
    }

    /// Chunk allocations backing the pool.
    #[must_use]
    pub fn chunks(&self) -> Vec<AllocationRef> {
        self.inner.lock().chunks.clone()
    }
}

/// Counted reference to a pooled record. The last handle dropped returns
/// the slot to the pool.
pub struct TagNode<T: TagPayload> {
    inner: Arc<Inner<T>>,
    index: usize,
    generation: u32,
    record: TagRecord,
    ref_count: Arc<AtomicU32>,
}

impl<T: TagPayload> TagNode<T> {
    #[must_use]
    pub const fn index(&self) -> usize {
        self.index
    }

    #[must_use]
    pub const fn generation(&self) -> u32 {
        self.generation
    }

    #[must_use]
    pub fn ref_count(&self) -> u32 {
        self.ref_count.load(Ordering::Acquire)
    }

    #[must_use]
    pub const fn record(&self) -> &TagRecord {
        &self.record
    }

    #[must_use]
    pub const fn allocation(&self) -> &AllocationRef {
        &self.record.allocation
    }

    #[must_use]
    pub fn gpu_address(&self) -> u64 {
        self.record.gpu_address()
    }

    #[must_use]
    pub fn can_be_released(&self) -> bool {
        T::can_be_released(&self.record)
    }

    #[must_use]
    pub fn same_node(&self, other: &Self) -> bool {
        Arc::ptr_eq(&self.inner, &other.inner) && self.index == other.index
    }
}

impl<T: TagPayload> Clone for TagNode<T> {
    fn clone(&self) -> Self {
        self.ref_count.fetch_add(1, Ordering::AcqRel);
        Self {
            inner: self.inner.clone(),
            index: self.index,
            generation: self.generation,
            record: self.record.clone(),
            ref_count: self.ref_count.clone(),
        }
    }
}

impl<T: TagPayload> Drop for TagNode<T> {
    fn drop(&mut self) {
        if self.ref_count.fetch_sub(1, Ordering::AcqRel) == 1 {
            self.inner.return_slot(self.index, self.generation);
        }
    }
}

impl<T: TagPayload> fmt::Debug for TagNode<T> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("TagNode")
            .field("index", &self.index)
            .field("generation", &self.generation)
            .field("gpu_address", &format_args!("{:#x}", self.gpu_address()))
            .field("ref_count", &self.ref_count())
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::memory::manager::MemoryConfig;

    /// Record that is releasable once its first dword is non-zero.
    struct Fence;

    impl TagPayload for Fence {
        const RECORD_SIZE: usize = 4;
        const ALLOCATION_TYPE: AllocationType = AllocationType::TagBuffer;

        fn initialize(record: &TagRecord) {
            record.store(0, 0);
        }

        fn can_be_released(record: &TagRecord) -> bool {
            record.load(0) != 0
        }
    }

    fn allocator(per_chunk: usize) -> TagAllocator<Fence> {
        TagAllocator::new(MemoryManager::new(MemoryConfig::default()), 0, per_chunk)
    }

    #[test]
    fn fresh_tag_has_single_reference() {
        let tags = allocator(4);
        let node = tags.get_tag().unwrap();
        assert_eq!(node.ref_count(), 1);
        let other = node.clone();
        assert_eq!(node.ref_count(), 2);
        drop(other);
        assert_eq!(node.ref_count(), 1);
        assert_eq!(tags.node_state(node.index()), Some(NodeState::Used));
    }

    #[test]
    fn unreleasable_tag_is_deferred_then_reclaimed() {
        let tags = allocator(1);
        let node = tags.get_tag().unwrap();
        let (index, record) = (node.index(), node.record().clone());
        tags.return_tag(node);
        assert_eq!(tags.node_state(index), Some(NodeState::Deferred));

        // Still busy: a second chunk is carved.
        let second = tags.get_tag().unwrap();
        assert_ne!(second.index(), index);
        assert_eq!(tags.stats().chunks, 2);

        record.store(0, 1);
        let third = tags.get_tag().unwrap();
        assert_eq!(third.index(), index);
        assert_eq!(third.generation(), 2);
        assert_eq!(tags.stats().chunks, 2);
    }

    #[test]
    fn released_tag_goes_straight_to_free() {
        let tags = allocator(2);
        let node = tags.get_tag().unwrap();
        node.record().store(0, 7);
        let index = node.index();
        drop(node);
        assert_eq!(tags.node_state(index), Some(NodeState::Free));
        let stats = tags.stats();
        assert_eq!(stats.free + stats.used + stats.deferred, 2);
    }

    #[test]
    fn records_are_cache_line_strided() {
        let tags = allocator(4);
        let a = tags.get_tag().unwrap();
        let b = tags.get_tag().unwrap();
        assert_eq!(b.gpu_address() - a.gpu_address(), CACHE_LINE_SIZE as u64);
        assert!(Arc::ptr_eq(a.allocation(), b.allocation()));
    }
}
