//! Recordable bundle of a command buffer, indirect heaps and residency, used
//! by command lists that are built once and submitted later.

use crate::csr::submission::{CompletionStamp, GpuOperation, StreamRegion};
use crate::csr::{CommandStreamReceiver, FlushTaskRequest};
use crate::error::{NeoError, NeoResult};
use crate::memory::stream::{HeapType, IndirectHeap, LinearStream};
use crate::memory::storage::AllocationUsage;
use crate::memory::{AllocationProperties, AllocationRef, AllocationType};
use crate::utils::align_up;
use crate::utils::memory_constants::{CACHE_LINE_SIZE, CS_OVERFETCH_SIZE, KB, PAGE_SIZE, PAGE_SIZE_64K};
use log::debug;
use std::sync::Arc;

pub const DEFAULT_LIST_CMD_BUFFER_SIZE: usize = 128 * KB;
pub const CMD_BUFFER_RESERVED_SIZE: usize = CACHE_LINE_SIZE + CS_OVERFETCH_SIZE;
pub const DEFAULT_HEAP_SIZE: usize = 64 * KB;
/// Surface state bytes kept at the start of the heap for the runtime.
pub const RESERVED_SSH_SIZE: usize = 4 * PAGE_SIZE;

const CHAIN_RECORD_SIZE: usize = 16;
const CHAIN_RECORD: u32 = 0x1880_0001;

/// Hands heap allocations out of, and back into, an engine's reusable storage.
#[derive(Debug)]
pub struct HeapHelper {
    csr: Arc<CommandStreamReceiver>,
}

impl HeapHelper {
    #[must_use]
    pub const fn new(csr: Arc<CommandStreamReceiver>) -> Self {
        Self { csr }
    }

    pub fn get_heap_allocation(&self, heap_type: HeapType, size: usize, alignment: usize) -> NeoResult<AllocationRef> {
        let allocation_type = if heap_type == HeapType::IndirectObject {
            AllocationType::InternalHeap
        } else {
            AllocationType::LinearStream
        };
        if let Some(reused) = self
            .csr
            .internal_allocation_storage()
            .obtain_reusable_allocation(size, allocation_type)
        {
            return Ok(reused);
        }
        let props = AllocationProperties::new(self.csr.os_context().root_device_index(), size, allocation_type)
            .with_alignment(alignment);
        self.csr
            .memory_manager()
            .allocate_graphics_memory_with_properties(&props)
    }

    pub fn store_heap_allocation(&self, allocation: AllocationRef) {
        self.csr.store_allocation(allocation, AllocationUsage::Reusable);
    }
}

#[derive(Debug)]
pub struct CommandContainer {
    csr: Arc<CommandStreamReceiver>,
    heap_helper: HeapHelper,
    command_stream: LinearStream,
    cmd_buffer_allocations: Vec<AllocationRef>,
    heaps: [IndirectHeap; HeapType::COUNT],
    residency: Vec<AllocationRef>,
    deallocation: Vec<AllocationRef>,
    dirty_heaps: u32,
}

impl CommandContainer {
    /// Allocates the first command buffer and all three heaps.
    ///
    /// # Errors
    /// `Unrecoverable` if any backing allocation fails.
    pub fn initialize(csr: Arc<CommandStreamReceiver>) -> NeoResult<Self> {
        let heap_helper = HeapHelper::new(csr.clone());
        let mut container = Self {
            csr,
            heap_helper,
            command_stream: LinearStream::default(),
            cmd_buffer_allocations: Vec::new(),
            heaps: HeapType::ALL.map(IndirectHeap::empty),
            residency: Vec::new(),
            deallocation: Vec::new(),
            dirty_heaps: 0,
        };

        let first = container.allocate_command_buffer()?;
        container
            .command_stream
            .replace_buffer(first.clone(), DEFAULT_LIST_CMD_BUFFER_SIZE);
        container.cmd_buffer_allocations.push(first);

        for heap_type in HeapType::ALL {
            let allocation = container
                .heap_helper
                .get_heap_allocation(heap_type, DEFAULT_HEAP_SIZE, PAGE_SIZE)
                .map_err(|e| NeoError::Unrecoverable(format!("{heap_type:?} heap allocation failed: {e}")))?;
            container.heaps[heap_type.index()].replace_buffer(allocation);
        }
        container.reserve_ssh()?;
        container.set_dirty_state_for_all_heaps(true);
        Ok(container)
    }

    fn allocate_command_buffer(&self) -> NeoResult<AllocationRef> {
        let size = align_up(DEFAULT_LIST_CMD_BUFFER_SIZE + CMD_BUFFER_RESERVED_SIZE, PAGE_SIZE_64K);
        let props = AllocationProperties::new(
            self.csr.os_context().root_device_index(),
            size,
            AllocationType::CommandBuffer,
        );
        self.csr
            .memory_manager()
            .allocate_graphics_memory_with_properties(&props)
            .map_err(|e| NeoError::Unrecoverable(format!("command buffer allocation failed: {e}")))
    }

    fn reserve_ssh(&mut self) -> NeoResult<()> {
        self.heaps[HeapType::SurfaceState.index()]
            .get_space(RESERVED_SSH_SIZE)
            .map(|_| ())
    }

    /// Clears per-recording state so the container can be recorded again.
    ///
    /// Extra command buffers are freed, streams rewound, and every heap is
    /// marked dirty.
    pub fn reset(&mut self) -> NeoResult<()> {
        self.set_dirty_state_for_all_heaps(true);
        self.residency.clear();

        let memory_manager = self.csr.memory_manager().clone();
        for allocation in self.deallocation.drain(..) {
            if matches!(
                allocation.allocation_type(),
                AllocationType::InternalHeap | AllocationType::LinearStream
            ) {
                self.heap_helper.store_heap_allocation(allocation);
            } else {
                memory_manager.check_gpu_usage_and_destroy(allocation);
            }
        }
        for extra in self.cmd_buffer_allocations.drain(1..) {
            memory_manager.check_gpu_usage_and_destroy(extra);
        }
        if let Some(first) = self.cmd_buffer_allocations.first() {
            self.command_stream
                .replace_buffer(first.clone(), DEFAULT_LIST_CMD_BUFFER_SIZE);
        }
        for heap in &mut self.heaps {
            heap.stream_mut().rewind();
        }
        self.reserve_ssh()
    }

    #[must_use]
    pub const fn command_stream(&self) -> &LinearStream {
        &self.command_stream
    }

    pub const fn command_stream_mut(&mut self) -> &mut LinearStream {
        &mut self.command_stream
    }

    #[must_use]
    pub fn cmd_buffer_allocations(&self) -> &[AllocationRef] {
        &self.cmd_buffer_allocations
    }

    #[must_use]
    pub const fn indirect_heap(&self, heap_type: HeapType) -> &IndirectHeap {
        &self.heaps[heap_type.index()]
    }

    /// Allocations added for the next submission, besides the container's own buffers.
    #[must_use]
    pub fn residency_container(&self) -> &[AllocationRef] {
        &self.residency
    }

    /// Replaced allocations to release after the recorded work completes.
    #[must_use]
    pub fn deallocation_container(&self) -> &[AllocationRef] {
        &self.deallocation
    }

    pub fn add_to_residency_container(&mut self, allocation: &AllocationRef) {
        if !self.residency.iter().any(|a| Arc::ptr_eq(a, allocation)) {
            self.residency.push(allocation.clone());
        }
    }

    /// Everything a submission of this container must make resident.
    #[must_use]
    pub fn residency_for_submission(&self) -> Vec<AllocationRef> {
        let mut all: Vec<AllocationRef> = self.cmd_buffer_allocations.clone();
        all.extend(self.heaps.iter().filter_map(|h| h.graphics_allocation().cloned()));
        all.extend(self.residency.iter().cloned());
        all
    }

    #[must_use]
    pub const fn dirty_heaps(&self) -> u32 {
        self.dirty_heaps
    }

    #[must_use]
    pub const fn is_heap_dirty(&self, heap_type: HeapType) -> bool {
        self.dirty_heaps & heap_type.dirty_bit() != 0
    }

    pub const fn set_heap_dirty(&mut self, heap_type: HeapType) {
        self.dirty_heaps |= heap_type.dirty_bit();
    }

    pub const fn set_dirty_state_for_all_heaps(&mut self, dirty: bool) {
        self.dirty_heaps = if dirty { u32::MAX } else { 0 };
    }

    /// Returns the heap with `size` bytes free at `alignment`, growing it if needed.
    ///
    /// A grown heap is at least twice the previous size; the old allocation
    /// goes to the deallocation container and the heap is marked dirty when
    /// its base address changed.
    pub fn get_heap_with_required_size_and_alignment(
        &mut self,
        heap_type: HeapType,
        size: usize,
        alignment: usize,
    ) -> NeoResult<&mut IndirectHeap> {
        let index = heap_type.index();
        let heap = &self.heaps[index];
        let mut size_requested = size;
        if alignment > 0 && heap.used() % alignment != 0 {
            size_requested += alignment;
        }

        if heap.available_space() < size_requested {
            let current = heap.used() + heap.available_space();
            let new_size = align_up((current * 2).max(heap.available_space() + size_requested), PAGE_SIZE);
            let new_allocation = self.heap_helper.get_heap_allocation(heap_type, new_size, PAGE_SIZE)?;

            let heap = &mut self.heaps[index];
            let old_base = heap.heap_gpu_base();
            let old = heap.stream_mut().replace_graphics_allocation(None);
            heap.replace_buffer(new_allocation);
            debug!(
                "[CommandContainer] grew {heap_type:?} heap to {} bytes",
                heap.stream().max_available_space()
            );
            if let Some(old) = old {
                self.deallocation.push(old);
            }
            if old_base != self.heaps[index].heap_gpu_base() {
                self.set_heap_dirty(heap_type);
            }
        }

        let heap = &mut self.heaps[index];
        if alignment > 0 {
            heap.align(alignment)?;
        }
        Ok(heap)
    }

    /// Switches recording to a fresh command buffer.
    pub fn allocate_next_command_buffer(&mut self) -> NeoResult<()> {
        let allocation = self.allocate_command_buffer()?;
        self.command_stream
            .replace_buffer(allocation.clone(), DEFAULT_LIST_CMD_BUFFER_SIZE);
        self.cmd_buffer_allocations.push(allocation);
        Ok(())
    }

    /// Makes sure `size` bytes fit in the current buffer, chaining to a new
    /// buffer when they do not.
    pub fn ensure_command_buffer_space(&mut self, size: usize) -> NeoResult<()> {
        if self.command_stream.available_space() >= size + CHAIN_RECORD_SIZE {
            return Ok(());
        }
        let next = self.allocate_command_buffer()?;
        let target = next.gpu_address();
        let record: Vec<u8> = [CHAIN_RECORD, target as u32, (target >> 32) as u32, 0]
            .iter()
            .flat_map(|d| d.to_le_bytes())
            .collect();
        self.command_stream.write(&record)?;
        self.command_stream
            .replace_buffer(next.clone(), DEFAULT_LIST_CMD_BUFFER_SIZE);
        self.cmd_buffer_allocations.push(next);
        Ok(())
    }

    /// Submits the recorded commands on the container's engine.
    pub fn execute(&mut self, operations: Vec<GpuOperation>) -> NeoResult<CompletionStamp> {
        for allocation in self.residency_for_submission() {
            self.csr.make_resident(&allocation);
        }
        let region = self.cmd_buffer_allocations.first().map(|first| StreamRegion {
            allocation: first.clone(),
            start: 0,
            end: if self.cmd_buffer_allocations.len() == 1 {
                self.command_stream.used()
            } else {
                DEFAULT_LIST_CMD_BUFFER_SIZE
            },
        });
        let stamp = self.csr.flush_task(FlushTaskRequest {
            command_stream: region,
            task_level: self.csr.peek_task_level(),
            flags: Default::default(),
            operations,
        })?;
        self.set_dirty_state_for_all_heaps(false);
        Ok(stamp)
    }
}

impl Drop for CommandContainer {
    fn drop(&mut self) {
        let memory_manager = self.csr.memory_manager().clone();
        for allocation in self.cmd_buffer_allocations.drain(..) {
            memory_manager.check_gpu_usage_and_destroy(allocation);
        }
        for heap in &mut self.heaps {
            if let Some(allocation) = heap.stream_mut().replace_graphics_allocation(None) {
                self.heap_helper.store_heap_allocation(allocation);
            }
        }
        for allocation in self.deallocation.drain(..) {
            if matches!(
                allocation.allocation_type(),
                AllocationType::InternalHeap | AllocationType::LinearStream
            ) {
                self.heap_helper.store_heap_allocation(allocation);
            }
        }
        self.residency.clear();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::DebugSettings;
    use crate::csr::simulated::{EngineMode, SimulatedGpu};
    use crate::memory::manager::{EngineType, MemoryConfig, MemoryManager};

    fn csr() -> Arc<CommandStreamReceiver> {
        let mm = MemoryManager::new(MemoryConfig::default());
        let engine = SimulatedGpu::new().create_engine(EngineMode::Immediate).unwrap();
        Arc::new(
            CommandStreamReceiver::new(mm, EngineType::Compute, 0, engine, Arc::new(DebugSettings::default()))
                .unwrap(),
        )
    }

    #[test]
    fn initialize_allocates_buffer_and_heaps() {
        let container = CommandContainer::initialize(csr()).unwrap();
        let cb = &container.cmd_buffer_allocations()[0];
        assert_eq!(cb.underlying_buffer_size(), align_up(DEFAULT_LIST_CMD_BUFFER_SIZE + CMD_BUFFER_RESERVED_SIZE, PAGE_SIZE_64K));
        assert_eq!(container.command_stream().available_space(), DEFAULT_LIST_CMD_BUFFER_SIZE);
        assert_eq!(
            container
                .indirect_heap(HeapType::IndirectObject)
                .graphics_allocation()
                .unwrap()
                .allocation_type(),
            AllocationType::InternalHeap
        );
        assert_eq!(container.indirect_heap(HeapType::SurfaceState).used(), RESERVED_SSH_SIZE);
        assert!(HeapType::ALL.iter().all(|&h| container.is_heap_dirty(h)));
        assert_eq!(container.residency_for_submission().len(), 4);
    }

    #[test]
    fn reset_empties_containers_and_dirties_heaps() {
        let csr = csr();
        let extra = csr.memory_manager().allocate(4096, AllocationType::Buffer).unwrap();
        let mut container = CommandContainer::initialize(csr).unwrap();
        container.add_to_residency_container(&extra);
        container.add_to_residency_container(&extra);
        assert_eq!(container.residency_container().len(), 1);
        container
            .get_heap_with_required_size_and_alignment(HeapType::DynamicState, 100 * KB, 0)
            .unwrap();
        container.allocate_next_command_buffer().unwrap();
        container.set_dirty_state_for_all_heaps(false);

        container.reset().unwrap();
        assert!(container.residency_container().is_empty());
        assert!(container.deallocation_container().is_empty());
        assert_eq!(container.cmd_buffer_allocations().len(), 1);
        assert_eq!(container.command_stream().used(), 0);
        assert!(HeapType::ALL.iter().all(|&h| container.is_heap_dirty(h)));
    }

    #[test]
    fn heap_growth_doubles_and_marks_dirty() {
        let mut container = CommandContainer::initialize(csr()).unwrap();
        container.set_dirty_state_for_all_heaps(false);
        let heap = container
            .get_heap_with_required_size_and_alignment(HeapType::DynamicState, DEFAULT_HEAP_SIZE + 1, 64)
            .unwrap();
        assert!(heap.stream().max_available_space() >= 2 * DEFAULT_HEAP_SIZE);
        assert_eq!(container.deallocation_container().len(), 1);
        assert!(container.is_heap_dirty(HeapType::DynamicState));
        assert!(!container.is_heap_dirty(HeapType::SurfaceState));
    }

    #[test]
    fn heaps_return_to_reusable_storage_on_drop() {
        let csr = csr();
        let container = CommandContainer::initialize(csr.clone()).unwrap();
        drop(container);
        assert_eq!(
            csr.internal_allocation_storage().len(AllocationUsage::Reusable),
            HeapType::COUNT
        );
        let again = CommandContainer::initialize(csr.clone()).unwrap();
        assert_eq!(csr.internal_allocation_storage().len(AllocationUsage::Reusable), 0);
        drop(again);
    }

    #[test]
    fn execute_submits_recorded_stream() {
        let csr = csr();
        let mut container = CommandContainer::initialize(csr.clone()).unwrap();
        container.ensure_command_buffer_space(64).unwrap();
        container.command_stream_mut().write(&[0u8; 64]).unwrap();
        let stamp = container.execute(Vec::new()).unwrap();
        assert_eq!(stamp.task_count, 1);
        assert_eq!(csr.peek_tag_value(), 1);
        assert!(!container.is_heap_dirty(HeapType::DynamicState));
    }
}
