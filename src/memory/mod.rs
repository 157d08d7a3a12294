pub mod aperture;
pub mod deferred;
pub mod manager;
pub mod storage;
pub mod stream;

use crate::error::{NeoError, NeoResult};
use crate::utils::memory_constants::PAGE_SIZE;
use crate::utils::align_up;
use std::ptr::{self, NonNull};
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, AtomicU32, Ordering};

/// Upper bound on OS contexts (engines) a single allocation can be tracked on.
pub const MAX_OS_CONTEXT_COUNT: usize = 32;

/// Task count of an allocation never submitted on a context.
pub const OBJECT_NOT_USED: u32 = u32::MAX;

/// Residency task count of an allocation not resident on a context.
pub const OBJECT_NOT_RESIDENT: u32 = u32::MAX;

/// Shared handle to an allocation. The memory manager decides when it is freed;
/// the backing pages go away once the last handle is dropped.
pub type AllocationRef = Arc<GraphicsAllocation>;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum AllocationType {
    Buffer,
    CommandBuffer,
    LinearStream,
    InternalHeap,
    TagBuffer,
    TimestampPacketTagBuffer,
    ProfilingTagBuffer,
    SvmCpu,
    SvmGpu,
    SvmZeroCopy,
    PreemptionBuffer,
    DebugSurface,
    PerDssBackedBuffer,
    PrintfSurface,
    GlobalFence,
}

impl AllocationType {
    #[must_use]
    pub const fn is_svm(self) -> bool {
        matches!(self, Self::SvmCpu | Self::SvmGpu | Self::SvmZeroCopy)
    }

    /// Allocations that live in the internal heap aperture rather than the SVM range.
    #[must_use]
    pub const fn is_internal(self) -> bool {
        matches!(
            self,
            Self::CommandBuffer
                | Self::LinearStream
                | Self::InternalHeap
                | Self::TagBuffer
                | Self::TimestampPacketTagBuffer
                | Self::ProfilingTagBuffer
                | Self::PreemptionBuffer
                | Self::DebugSurface
                | Self::PerDssBackedBuffer
                | Self::GlobalFence
        )
    }
}

/// Request passed to [`MemoryManager::allocate_graphics_memory_with_properties`](manager::MemoryManager::allocate_graphics_memory_with_properties).
#[derive(Debug, Clone, Copy)]
pub struct AllocationProperties {
    pub root_device_index: u32,
    pub size: usize,
    pub allocation_type: AllocationType,
    pub alignment: usize,
    pub multi_os_context_capable: bool,
    /// Reuse this GPU VA instead of reserving one (dual-storage SVM).
    pub gpu_address: Option<u64>,
}

impl AllocationProperties {
    #[must_use]
    pub const fn new(root_device_index: u32, size: usize, allocation_type: AllocationType) -> Self {
        Self {
            root_device_index,
            size,
            allocation_type,
            alignment: PAGE_SIZE,
            multi_os_context_capable: false,
            gpu_address: None,
        }
    }

    #[must_use]
    pub const fn with_alignment(mut self, alignment: usize) -> Self {
        self.alignment = alignment;
        self
    }

    #[must_use]
    pub const fn multi_os_context(mut self, capable: bool) -> Self {
        self.multi_os_context_capable = capable;
        self
    }

    #[must_use]
    pub const fn at_gpu_address(mut self, gpu_address: u64) -> Self {
        self.gpu_address = Some(gpu_address);
        self
    }
}

/// Page-aligned anonymous mapping standing in for the CPU view of GPU memory.
#[derive(Debug)]
pub(crate) struct HostBacking {
    ptr: NonNull<u8>,
    len: usize,
}

// The mapping is plain memory owned by this struct; sharing follows the same
// rules as the device memory it models.
unsafe impl Send for HostBacking {}
unsafe impl Sync for HostBacking {}

impl HostBacking {
    pub(crate) fn map(size: usize) -> NeoResult<Self> {
        let len = align_up(size.max(1), PAGE_SIZE);
        let ret = unsafe {
            libc::mmap(
                ptr::null_mut(),
                len,
                libc::PROT_READ | libc::PROT_WRITE,
                libc::MAP_PRIVATE | libc::MAP_ANONYMOUS,
                -1,
                0,
            )
        };
        if ret == libc::MAP_FAILED {
            return Err(NeoError::Io(std::io::Error::last_os_error()));
        }
        let ptr = NonNull::new(ret.cast::<u8>()).ok_or(NeoError::OutOfMemory)?;
        Ok(Self { ptr, len })
    }
}

impl Drop for HostBacking {
    fn drop(&mut self) {
        unsafe {
            libc::munmap(self.ptr.as_ptr().cast(), self.len);
        }
    }
}

#[derive(Debug)]
struct UsageInfo {
    task_count: AtomicU32,
    residency_task_count: AtomicU32,
}

impl UsageInfo {
    const fn new() -> Self {
        Self {
            task_count: AtomicU32::new(OBJECT_NOT_USED),
            residency_task_count: AtomicU32::new(OBJECT_NOT_RESIDENT),
        }
    }
}

/// One GPU-addressable memory region and its per-engine usage state.
///
/// Usage fields only move forward (task counts are stored as maxima), so
/// several command stream receivers can update them without a lock.
#[derive(Debug)]
pub struct GraphicsAllocation {
    id: u64,
    allocation_type: AllocationType,
    gpu_address: u64,
    size: usize,
    root_device_index: u32,
    multi_os_context: bool,
    backing: HostBacking,
    usage: [UsageInfo; MAX_OS_CONTEXT_COUNT],
    evictable: AtomicBool,
}

impl GraphicsAllocation {
    pub(crate) fn new(
        id: u64,
        properties: &AllocationProperties,
        gpu_address: u64,
        backing: HostBacking,
    ) -> Self {
        Self {
            id,
            allocation_type: properties.allocation_type,
            gpu_address,
            size: properties.size,
            root_device_index: properties.root_device_index,
            multi_os_context: properties.multi_os_context_capable,
            backing,
            usage: std::array::from_fn(|_| UsageInfo::new()),
            evictable: AtomicBool::new(true),
        }
    }

    #[must_use]
    pub const fn id(&self) -> u64 {
        self.id
    }

    #[must_use]
    pub const fn allocation_type(&self) -> AllocationType {
        self.allocation_type
    }

    #[must_use]
    pub const fn gpu_address(&self) -> u64 {
        self.gpu_address
    }

    /// Size requested by the creator; the backing may be larger (page rounded).
    #[must_use]
    pub const fn underlying_buffer_size(&self) -> usize {
        self.size
    }

    #[must_use]
    pub const fn root_device_index(&self) -> u32 {
        self.root_device_index
    }

    #[must_use]
    pub const fn is_multi_os_context(&self) -> bool {
        self.multi_os_context
    }

    #[must_use]
    pub fn cpu_ptr(&self) -> *mut u8 {
        self.backing.ptr.as_ptr()
    }

    /// True if `address` falls inside `[gpu_address, gpu_address + size)`.
    #[must_use]
    pub const fn contains_gpu_address(&self, address: u64) -> bool {
        address >= self.gpu_address && address < self.gpu_address + self.size as u64
    }

    // -------------------------------------------------------------------------------------------
    // Per-context usage tracking
    // -------------------------------------------------------------------------------------------

    #[must_use]
    pub fn task_count(&self, context_id: u32) -> u32 {
        self.usage[context_id as usize].task_count.load(Ordering::Acquire)
    }

    /// Records that work with `task_count` on `context_id` references this allocation.
    pub fn update_task_count(&self, task_count: u32, context_id: u32) {
        store_max(&self.usage[context_id as usize].task_count, task_count, OBJECT_NOT_USED);
    }

    #[must_use]
    pub fn is_used_by_os_context(&self, context_id: u32) -> bool {
        self.task_count(context_id) != OBJECT_NOT_USED
    }

    #[must_use]
    pub fn is_used_by_many_os_contexts(&self) -> bool {
        self.used_contexts().nth(1).is_some()
    }

    /// Context ids with a recorded task count, paired with that task count.
    pub fn used_contexts(&self) -> impl Iterator<Item = (u32, u32)> + '_ {
        self.usage.iter().enumerate().filter_map(|(id, info)| {
            let tc = info.task_count.load(Ordering::Acquire);
            (tc != OBJECT_NOT_USED).then_some((id as u32, tc))
        })
    }

    #[must_use]
    pub fn residency_task_count(&self, context_id: u32) -> u32 {
        self.usage[context_id as usize]
            .residency_task_count
            .load(Ordering::Acquire)
    }

    pub fn update_residency_task_count(&self, task_count: u32, context_id: u32) {
        store_max(
            &self.usage[context_id as usize].residency_task_count,
            task_count,
            OBJECT_NOT_RESIDENT,
        );
    }

    pub fn release_residency_in_os_context(&self, context_id: u32) {
        self.usage[context_id as usize]
            .residency_task_count
            .store(OBJECT_NOT_RESIDENT, Ordering::Release);
    }

    #[must_use]
    pub fn is_resident(&self, context_id: u32) -> bool {
        self.residency_task_count(context_id) != OBJECT_NOT_RESIDENT
    }

    #[must_use]
    pub fn is_residency_task_count_below(&self, task_count: u32, context_id: u32) -> bool {
        !self.is_resident(context_id) || self.residency_task_count(context_id) < task_count
    }

    #[must_use]
    pub fn peek_evictable(&self) -> bool {
        self.evictable.load(Ordering::Acquire)
    }

    pub fn set_evictable(&self, evictable: bool) {
        self.evictable.store(evictable, Ordering::Release);
    }

    // -------------------------------------------------------------------------------------------
    // CPU access to the backing store
    // -------------------------------------------------------------------------------------------

    fn check_range(&self, offset: usize, len: usize) -> NeoResult<()> {
        match offset.checked_add(len) {
            Some(end) if end <= self.size => Ok(()),
            _ => Err(NeoError::InvalidAllocation(format!(
                "range {offset}+{len} outside allocation {} of {} bytes",
                self.id, self.size
            ))),
        }
    }

    pub fn write(&self, offset: usize, data: &[u8]) -> NeoResult<()> {
        self.check_range(offset, data.len())?;
        unsafe {
            ptr::copy_nonoverlapping(data.as_ptr(), self.cpu_ptr().add(offset), data.len());
        }
        Ok(())
    }

    pub fn read(&self, offset: usize, out: &mut [u8]) -> NeoResult<()> {
        self.check_range(offset, out.len())?;
        unsafe {
            ptr::copy_nonoverlapping(self.cpu_ptr().add(offset), out.as_mut_ptr(), out.len());
        }
        Ok(())
    }

    pub fn fill(&self, offset: usize, len: usize, pattern: &[u8]) -> NeoResult<()> {
        self.check_range(offset, len)?;
        if pattern.is_empty() {
            return Ok(());
        }
        for (i, byte) in (0..len).zip(pattern.iter().cycle()) {
            unsafe {
                *self.cpu_ptr().add(offset + i) = *byte;
            }
        }
        Ok(())
    }

    /// Copies `len` bytes from `src` into this allocation. Overlap within one allocation is allowed.
    pub fn copy_from(
        &self,
        dst_offset: usize,
        src: &Self,
        src_offset: usize,
        len: usize,
    ) -> NeoResult<()> {
        self.check_range(dst_offset, len)?;
        src.check_range(src_offset, len)?;
        unsafe {
            ptr::copy(src.cpu_ptr().add(src_offset), self.cpu_ptr().add(dst_offset), len);
        }
        Ok(())
    }

    /// 32-bit atomic view used for GPU-visible records (tags, timestamps).
    pub fn atomic_u32(&self, offset: usize) -> NeoResult<&AtomicU32> {
        self.check_range(offset, 4)?;
        if offset % 4 != 0 {
            return Err(NeoError::InvalidAllocation(format!(
                "unaligned 32-bit access at offset {offset}"
            )));
        }
        // The backing is page aligned and lives as long as `self`.
        Ok(unsafe { &*self.cpu_ptr().add(offset).cast::<AtomicU32>() })
    }
}

/// Stores `value` if the slot is unset (`sentinel`) or holds a smaller value.
fn store_max(slot: &AtomicU32, value: u32, sentinel: u32) {
    let mut current = slot.load(Ordering::Acquire);
    loop {
        if current != sentinel && current >= value {
            return;
        }
        match slot.compare_exchange_weak(current, value, Ordering::AcqRel, Ordering::Acquire) {
            Ok(_) => return,
            Err(actual) => current = actual,
        }
    }
}

/// Trait for different aperture allocation strategies.
pub trait ApertureAllocator {
    /// Reserve a virtual address range within this aperture.
    fn allocate_va(&mut self, size: usize, align: usize) -> Option<u64>;

    /// Free a previously reserved virtual address range.
    fn free_va(&mut self, addr: u64, size: usize);

    /// Get the aperture's base and limit.
    fn bounds(&self) -> (u64, u64);
}

// Re-export the main manager for easy access
pub use manager::MemoryManager;

#[cfg(test)]
mod tests {
    use super::*;

    fn allocation(size: usize) -> GraphicsAllocation {
        let props = AllocationProperties::new(0, size, AllocationType::Buffer);
        GraphicsAllocation::new(1, &props, 0x10_0000, HostBacking::map(size).unwrap())
    }

    #[test]
    fn usage_starts_unused_and_not_resident() {
        let alloc = allocation(4096);
        assert!(!alloc.is_used_by_os_context(0));
        assert!(!alloc.is_resident(0));
        assert!(alloc.is_residency_task_count_below(1, 0));
    }

    #[test]
    fn task_count_only_moves_forward() {
        let alloc = allocation(4096);
        alloc.update_task_count(5, 0);
        alloc.update_task_count(3, 0);
        assert_eq!(alloc.task_count(0), 5);
        alloc.update_task_count(9, 0);
        assert_eq!(alloc.task_count(0), 9);
        alloc.update_task_count(1, 2);
        assert!(alloc.is_used_by_many_os_contexts());
        assert_eq!(alloc.used_contexts().collect::<Vec<_>>(), vec![(0, 9), (2, 1)]);
    }

    #[test]
    fn residency_release_resets_context() {
        let alloc = allocation(4096);
        alloc.update_residency_task_count(4, 1);
        assert!(alloc.is_resident(1));
        assert!(!alloc.is_residency_task_count_below(4, 1));
        assert!(alloc.is_residency_task_count_below(5, 1));
        alloc.release_residency_in_os_context(1);
        assert!(!alloc.is_resident(1));
    }

    #[test]
    fn byte_access_is_bounds_checked() {
        let alloc = allocation(16);
        alloc.write(8, &[1, 2, 3, 4]).unwrap();
        let mut out = [0u8; 4];
        alloc.read(8, &mut out).unwrap();
        assert_eq!(out, [1, 2, 3, 4]);
        assert!(alloc.write(14, &[0; 4]).is_err());
        assert!(alloc.atomic_u32(2).is_err());
        alloc.fill(0, 6, &[0xAB, 0xCD]).unwrap();
        alloc.read(0, &mut out).unwrap();
        assert_eq!(out, [0xAB, 0xCD, 0xAB, 0xCD]);
    }
}
