//! Command stream receiver: one per engine context.
//!
//! Owns the engine's command buffer, indirect heaps and residency list, and
//! the monotonic task count whose completion the engine reports through a
//! [`CompletionTag`](completion::CompletionTag).

pub mod completion;
pub mod simulated;
pub mod submission;

use crate::config::{DebugSettings, DispatchMode};
use crate::error::{NeoError, NeoResult};
use crate::memory::manager::{EngineType, OsContext};
use crate::memory::storage::{AllocationUsage, InternalAllocationStorage};
use crate::memory::stream::{HeapType, IndirectHeap, LinearStream};
use crate::memory::{AllocationProperties, AllocationRef, AllocationType, MemoryManager};
use crate::tags::{HwTimeStamps, TagAllocator, TimestampPacketStorage};
use crate::utils::align_up;
use crate::utils::memory_constants::{CACHE_LINE_SIZE, CS_OVERFETCH_SIZE, KB, PAGE_SIZE, PAGE_SIZE_64K};
use completion::{CompletionPoller, CompletionTag};
use log::{debug, error, info, warn};
use std::ops::{Deref, DerefMut};
use std::sync::atomic::{AtomicU32, Ordering};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use std::time::Duration;
use submission::{BatchBuffer, CompletionStamp, DispatchFlags, GpuOperation, StreamRegion, SubmissionBackend};

/// Space every queue submission needs in the receiver's own stream.
pub const MIN_COMMAND_QUEUE_STREAM_SIZE: usize = 64;

const DEFAULT_HEAP_SIZE: usize = 64 * KB;
const PREEMPTION_BUFFER_SIZE: usize = 64 * KB;
const PER_DSS_BACKED_BUFFER_SIZE: usize = 64 * KB;

// Private record layout of the receiver's own stream. The engine never
// parses these; they keep the stream contents inspectable.
const CHAIN_RECORD: u32 = 0x1880_0001;
const POST_SYNC_RECORD: u32 = 0x7A00_0004;
const END_RECORD: u32 = 0x0500_0000;
const EPILOGUE_SIZE: usize = 16 + 16 + 4;

#[derive(Debug, Default)]
struct OwnedAllocations {
    preemption: Option<AllocationRef>,
    debug_surface: Option<AllocationRef>,
    per_dss_backed: Option<AllocationRef>,
    global_fence: Option<AllocationRef>,
}

impl OwnedAllocations {
    fn iter(&self) -> impl Iterator<Item = &AllocationRef> {
        [
            &self.preemption,
            &self.debug_surface,
            &self.per_dss_backed,
            &self.global_fence,
        ]
        .into_iter()
        .flatten()
    }
}

#[derive(Debug)]
struct CsrState {
    command_stream: LinearStream,
    heaps: [IndirectHeap; HeapType::COUNT],
    residency: Vec<AllocationRef>,
    eviction: Vec<AllocationRef>,
    total_memory_used: usize,
    task_level: u32,
    flush_stamp: u64,
    pending: Vec<BatchBuffer>,
    owned: OwnedAllocations,
}

impl Default for CsrState {
    fn default() -> Self {
        Self {
            command_stream: LinearStream::default(),
            heaps: HeapType::ALL.map(IndirectHeap::empty),
            residency: Vec::new(),
            eviction: Vec::new(),
            total_memory_used: 0,
            task_level: 0,
            flush_stamp: 0,
            pending: Vec::new(),
            owned: OwnedAllocations::default(),
        }
    }
}

/// Locked access to the receiver's command stream.
pub struct CommandStreamGuard<'a> {
    state: MutexGuard<'a, CsrState>,
}

impl Deref for CommandStreamGuard<'_> {
    type Target = LinearStream;

    fn deref(&self) -> &LinearStream {
        &self.state.command_stream
    }
}

impl DerefMut for CommandStreamGuard<'_> {
    fn deref_mut(&mut self) -> &mut LinearStream {
        &mut self.state.command_stream
    }
}

/// Locked access to one of the receiver's indirect heaps.
pub struct IndirectHeapGuard<'a> {
    state: MutexGuard<'a, CsrState>,
    index: usize,
}

impl Deref for IndirectHeapGuard<'_> {
    type Target = IndirectHeap;

    fn deref(&self) -> &IndirectHeap {
        &self.state.heaps[self.index]
    }
}

impl DerefMut for IndirectHeapGuard<'_> {
    fn deref_mut(&mut self) -> &mut IndirectHeap {
        &mut self.state.heaps[self.index]
    }
}

/// Work handed to [`CommandStreamReceiver::flush_task`].
#[derive(Debug, Default)]
pub struct FlushTaskRequest {
    /// Caller's commands, chained from the receiver's stream.
    pub command_stream: Option<StreamRegion>,
    pub task_level: u32,
    pub flags: DispatchFlags,
    pub operations: Vec<GpuOperation>,
}

#[derive(Debug)]
pub struct CommandStreamReceiver {
    os_context: OsContext,
    memory_manager: Arc<MemoryManager>,
    settings: Arc<DebugSettings>,
    completion: Arc<CompletionTag>,
    storage: InternalAllocationStorage,
    backend: Arc<dyn SubmissionBackend>,
    timestamp_packets: TagAllocator<TimestampPacketStorage>,
    profiling_tags: TagAllocator<HwTimeStamps>,
    task_count: AtomicU32,
    latest_sent_task_count: AtomicU32,
    latest_flushed_task_count: AtomicU32,
    state: Mutex<CsrState>,
    _poller: Option<CompletionPoller>,
}

impl CommandStreamReceiver {
    /// Creates the receiver for a new engine context.
    ///
    /// Allocates the tag buffer and registers the context with the memory
    /// manager. Failure here leaves no usable engine, so it is reported as
    /// `Unrecoverable`.
    pub fn new(
        memory_manager: Arc<MemoryManager>,
        engine_type: EngineType,
        root_device_index: u32,
        backend: Arc<dyn SubmissionBackend>,
        settings: Arc<DebugSettings>,
    ) -> NeoResult<Self> {
        let tag_props = AllocationProperties::new(root_device_index, PAGE_SIZE, AllocationType::TagBuffer);
        let tag_allocation = memory_manager
            .allocate_graphics_memory_with_properties(&tag_props)
            .map_err(|e| NeoError::Unrecoverable(format!("tag buffer allocation failed: {e}")))?;
        let completion = Arc::new(CompletionTag::new(tag_allocation, settings.completion_spin())?);

        let os_context = memory_manager.register_os_context(engine_type, root_device_index, completion.clone())?;

        let poller = match settings.completion_poll_interval_us {
            Some(us) => Some(CompletionPoller::spawn(completion.clone(), Duration::from_micros(us))?),
            None => None,
        };

        info!(
            "[CSR {}] created for {engine_type:?} engine, dispatch mode {:?}",
            os_context.context_id(),
            settings.csr_dispatch_mode
        );

        Ok(Self {
            storage: InternalAllocationStorage::new(
                memory_manager.clone(),
                os_context.context_id(),
                completion.clone(),
            ),
            timestamp_packets: TagAllocator::new(
                memory_manager.clone(),
                root_device_index,
                settings.timestamp_packet_tags_per_chunk,
            ),
            profiling_tags: TagAllocator::new(
                memory_manager.clone(),
                root_device_index,
                settings.hw_timestamp_tags_per_chunk,
            ),
            os_context,
            memory_manager,
            settings,
            completion,
            backend,
            task_count: AtomicU32::new(0),
            latest_sent_task_count: AtomicU32::new(0),
            latest_flushed_task_count: AtomicU32::new(0),
            state: Mutex::new(CsrState::default()),
            _poller: poller,
        })
    }

    fn lock(&self) -> MutexGuard<'_, CsrState> {
        self.state.lock().unwrap_or_else(PoisonError::into_inner)
    }

    fn context_id(&self) -> u32 {
        self.os_context.context_id()
    }

    // ===========================================================================================
    // Accessors
    // ===========================================================================================

    #[must_use]
    pub const fn os_context(&self) -> &OsContext {
        &self.os_context
    }

    #[must_use]
    pub const fn memory_manager(&self) -> &Arc<MemoryManager> {
        &self.memory_manager
    }

    #[must_use]
    pub const fn settings(&self) -> &Arc<DebugSettings> {
        &self.settings
    }

    #[must_use]
    pub const fn completion(&self) -> &Arc<CompletionTag> {
        &self.completion
    }

    #[must_use]
    pub fn tag_allocation(&self) -> &AllocationRef {
        self.completion.allocation()
    }

    #[must_use]
    pub const fn internal_allocation_storage(&self) -> &InternalAllocationStorage {
        &self.storage
    }

    #[must_use]
    pub const fn timestamp_packet_allocator(&self) -> &TagAllocator<TimestampPacketStorage> {
        &self.timestamp_packets
    }

    #[must_use]
    pub const fn profiling_tag_allocator(&self) -> &TagAllocator<HwTimeStamps> {
        &self.profiling_tags
    }

    #[must_use]
    pub fn backend(&self) -> &Arc<dyn SubmissionBackend> {
        &self.backend
    }

    #[must_use]
    pub fn dispatch_mode(&self) -> DispatchMode {
        self.settings.csr_dispatch_mode
    }

    #[must_use]
    pub fn timestamp_packet_write_enabled(&self) -> bool {
        self.settings.enable_timestamp_packet
    }

    #[must_use]
    pub fn peek_task_count(&self) -> u32 {
        self.task_count.load(Ordering::Acquire)
    }

    #[must_use]
    pub fn peek_latest_sent_task_count(&self) -> u32 {
        self.latest_sent_task_count.load(Ordering::Acquire)
    }

    #[must_use]
    pub fn peek_latest_flushed_task_count(&self) -> u32 {
        self.latest_flushed_task_count.load(Ordering::Acquire)
    }

    #[must_use]
    pub fn peek_task_level(&self) -> u32 {
        self.lock().task_level
    }

    /// Last task count the engine reported complete.
    #[must_use]
    pub fn peek_tag_value(&self) -> u32 {
        self.completion.value()
    }

    #[must_use]
    pub fn tag_gpu_address(&self) -> u64 {
        self.completion.gpu_address()
    }

    /// Sets the tag outside of engine execution; used at setup and by tests.
    pub fn initialize_tag_value(&self, value: u32) {
        self.completion.initialize(value);
    }

    #[must_use]
    pub fn total_memory_used(&self) -> usize {
        self.lock().total_memory_used
    }

    #[must_use]
    pub fn residency_count(&self) -> usize {
        self.lock().residency.len()
    }

    #[must_use]
    pub fn eviction_count(&self) -> usize {
        self.lock().eviction.len()
    }

    #[must_use]
    pub fn residency_allocations(&self) -> Vec<AllocationRef> {
        self.lock().residency.clone()
    }

    #[must_use]
    pub fn pending_batched_submissions(&self) -> usize {
        self.lock().pending.len()
    }

    // ===========================================================================================
    // Command buffer and heaps
    // ===========================================================================================

    /// Returns the command stream with at least `min_size` contiguous bytes free.
    ///
    /// # Errors
    /// `Unrecoverable` when no command buffer can be obtained.
    pub fn get_cs(&self, min_size: usize) -> NeoResult<CommandStreamGuard<'_>> {
        let mut state = self.lock();
        self.ensure_command_buffer_allocation(
            &mut state.command_stream,
            min_size + MIN_COMMAND_QUEUE_STREAM_SIZE,
            CACHE_LINE_SIZE + CS_OVERFETCH_SIZE,
        )?;
        Ok(CommandStreamGuard { state })
    }

    /// Grows `stream` to a fresh buffer when it has less than `min_size` free.
    ///
    /// The buffer size is `align(min_size + additional, 64KB)` unless an
    /// alignment is forced; the `additional` tail is kept out of the usable
    /// space. A finished reusable buffer is preferred over a new allocation,
    /// and the replaced buffer is parked as reusable.
    pub fn ensure_command_buffer_allocation(
        &self,
        stream: &mut LinearStream,
        min_size: usize,
        additional: usize,
    ) -> NeoResult<()> {
        if stream.graphics_allocation().is_some() && stream.available_space() >= min_size {
            return Ok(());
        }

        let alignment = self
            .settings
            .force_command_buffer_alignment_kb
            .map_or(PAGE_SIZE_64K, |kb| kb * KB);
        let allocation_size = align_up(min_size + additional, alignment);

        let allocation = match self
            .storage
            .obtain_reusable_allocation(allocation_size, AllocationType::CommandBuffer)
        {
            Some(reused) => reused,
            None => {
                let props = AllocationProperties::new(
                    self.os_context.root_device_index(),
                    allocation_size,
                    AllocationType::CommandBuffer,
                );
                self.memory_manager
                    .allocate_graphics_memory_with_properties(&props)
                    .map_err(|e| {
                        error!("[CSR {}] command buffer allocation failed: {e}", self.context_id());
                        NeoError::Unrecoverable(format!("command buffer allocation failed: {e}"))
                    })?
            }
        };

        debug!(
            "[CSR {}] command buffer {} bytes (allocation {})",
            self.context_id(),
            allocation.underlying_buffer_size(),
            allocation.id()
        );

        let usable = allocation.underlying_buffer_size() - additional;
        if let Some(old) = stream.replace_graphics_allocation(None) {
            self.storage.store_allocation_with_task_count(
                old,
                AllocationUsage::Reusable,
                self.peek_task_count(),
            );
        }
        stream.replace_buffer(allocation, usable);
        Ok(())
    }

    /// Returns the heap of `heap_type` with at least `min_size` bytes free.
    pub fn get_indirect_heap(&self, heap_type: HeapType, min_size: usize) -> NeoResult<IndirectHeapGuard<'_>> {
        let mut state = self.lock();
        let index = heap_type.index();
        let heap = &state.heaps[index];
        if heap.graphics_allocation().is_none() || heap.available_space() < min_size {
            self.allocate_heap_memory(&mut state.heaps[index], heap_type, min_size)?;
        }
        Ok(IndirectHeapGuard { state, index })
    }

    /// Moves `heap` to a new buffer of at least `min_size` bytes.
    ///
    /// The surface state heap keeps its last page out of the usable range.
    pub fn allocate_heap_memory(
        &self,
        heap: &mut IndirectHeap,
        heap_type: HeapType,
        min_size: usize,
    ) -> NeoResult<()> {
        let reserved = if heap_type == HeapType::SurfaceState { PAGE_SIZE } else { 0 };
        let heap_size = align_up((min_size + reserved).max(DEFAULT_HEAP_SIZE), PAGE_SIZE_64K);
        let allocation_type = if heap_type == HeapType::IndirectObject {
            AllocationType::InternalHeap
        } else {
            AllocationType::LinearStream
        };

        let allocation = match self.storage.obtain_reusable_allocation(heap_size, allocation_type) {
            Some(reused) => reused,
            None => {
                let props = AllocationProperties::new(
                    self.os_context.root_device_index(),
                    heap_size,
                    allocation_type,
                );
                self.memory_manager
                    .allocate_graphics_memory_with_properties(&props)
                    .map_err(|e| NeoError::Unrecoverable(format!("{heap_type:?} heap allocation failed: {e}")))?
            }
        };

        if let Some(old) = heap.stream_mut().replace_graphics_allocation(None) {
            self.storage.store_allocation_with_task_count(
                old,
                AllocationUsage::Reusable,
                self.peek_task_count(),
            );
        }

        let usable = allocation.underlying_buffer_size() - reserved;
        heap.stream_mut().replace_buffer(allocation, usable);
        Ok(())
    }

    /// Parks `allocation` until the current task count completes.
    pub fn store_allocation(&self, allocation: AllocationRef, usage: AllocationUsage) {
        self.storage
            .store_allocation_with_task_count(allocation, usage, self.peek_task_count());
    }

    // ===========================================================================================
    // Residency
    // ===========================================================================================

    /// Adds `allocation` to the residency list of the next submission.
    ///
    /// Idempotent within one submission; memory is counted once per
    /// allocation that was not already resident.
    pub fn make_resident(&self, allocation: &AllocationRef) {
        let mut state = self.lock();
        self.make_resident_locked(&mut state, allocation);
    }

    fn make_resident_locked(&self, state: &mut CsrState, allocation: &AllocationRef) {
        let ctx = self.context_id();
        let submission_task_count = self.peek_task_count() + 1;
        if allocation.is_residency_task_count_below(submission_task_count, ctx) {
            state.residency.push(allocation.clone());
            allocation.update_task_count(submission_task_count, ctx);
            if !allocation.is_resident(ctx) {
                state.total_memory_used += allocation.underlying_buffer_size();
            }
        }
        allocation.update_residency_task_count(submission_task_count, ctx);
    }

    /// Releases residency on this context.
    ///
    /// An evictable allocation goes to the eviction list; otherwise the first
    /// release only marks it evictable.
    pub fn make_non_resident(&self, allocation: &AllocationRef) {
        let mut state = self.lock();
        self.make_non_resident_locked(&mut state, allocation);
    }

    fn make_non_resident_locked(&self, state: &mut CsrState, allocation: &AllocationRef) {
        let ctx = self.context_id();
        if allocation.is_resident(ctx) {
            if allocation.peek_evictable() {
                state.eviction.push(allocation.clone());
            } else {
                allocation.set_evictable(true);
            }
            state.total_memory_used = state
                .total_memory_used
                .saturating_sub(allocation.underlying_buffer_size());
        }
        allocation.release_residency_in_os_context(ctx);
    }

    pub fn process_eviction(&self) {
        self.lock().eviction.clear();
    }

    /// Releases every allocation of the current residency pack.
    pub fn make_surface_pack_non_resident(&self) {
        let mut state = self.lock();
        self.make_surface_pack_non_resident_locked(&mut state);
    }

    fn make_surface_pack_non_resident_locked(&self, state: &mut CsrState) {
        let pack = std::mem::take(&mut state.residency);
        for allocation in &pack {
            self.make_non_resident_locked(state, allocation);
        }
        state.eviction.clear();
    }

    // ===========================================================================================
    // Submission
    // ===========================================================================================

    /// Submits one unit of work and returns its completion stamp.
    ///
    /// Makes the receiver's own buffers resident, appends the chain and
    /// completion records, then submits (or queues, in batched mode).
    pub fn flush_task(&self, request: FlushTaskRequest) -> NeoResult<CompletionStamp> {
        let mut state = self.lock();
        let state = &mut *state;

        self.ensure_command_buffer_allocation(
            &mut state.command_stream,
            EPILOGUE_SIZE,
            CACHE_LINE_SIZE + CS_OVERFETCH_SIZE,
        )?;

        let task_count = self.peek_task_count() + 1;

        let mut own = vec![self.completion.allocation().clone()];
        own.extend(state.command_stream.graphics_allocation().cloned());
        own.extend(
            state
                .heaps
                .iter()
                .filter_map(|heap| heap.graphics_allocation().cloned()),
        );
        own.extend(state.owned.iter().cloned());
        if let Some(region) = &request.command_stream {
            own.push(region.allocation.clone());
        }
        for allocation in &own {
            self.make_resident_locked(state, allocation);
        }

        let start = state.command_stream.used();
        if let Some(region) = &request.command_stream {
            let target = region.allocation.gpu_address() + region.start as u64;
            write_record(&mut state.command_stream, &[CHAIN_RECORD, target as u32, (target >> 32) as u32, 0])?;
        }
        let tag = self.completion.gpu_address();
        write_record(&mut state.command_stream, &[POST_SYNC_RECORD, tag as u32, (tag >> 32) as u32, task_count])?;
        write_record(&mut state.command_stream, &[END_RECORD])?;
        let end = state.command_stream.used();

        let Some(cs_allocation) = state.command_stream.graphics_allocation().cloned() else {
            return Err(NeoError::Unrecoverable("command stream without backing".into()));
        };

        let task_level = state.task_level.max(request.task_level);
        let flags = request.flags;
        let batch = BatchBuffer {
            command_buffer: StreamRegion {
                allocation: cs_allocation,
                start,
                end,
            },
            chained: request.command_stream,
            residency: state.residency.clone(),
            operations: request.operations,
            task_count,
            completion: self.completion.clone(),
            flags,
        };

        match self.settings.csr_dispatch_mode {
            DispatchMode::Immediate => {
                if let Err(e) = self.backend.submit(batch) {
                    error!("[CSR {}] submission of task count {task_count} failed: {e}", self.context_id());
                    state.command_stream.rewind_to(start);
                    self.make_surface_pack_non_resident_locked(state);
                    return Err(e);
                }
                self.latest_flushed_task_count.fetch_max(task_count, Ordering::AcqRel);
            }
            DispatchMode::Batched => state.pending.push(batch),
        }

        // Published only once the engine owns the work.
        self.task_count.store(task_count, Ordering::Release);
        self.latest_sent_task_count.store(task_count, Ordering::Release);
        state.task_level = task_level;
        state.flush_stamp += 1;
        let stamp = CompletionStamp {
            task_count,
            task_level,
            flush_stamp: state.flush_stamp,
        };
        if flags.blocking || flags.stalling_barrier {
            state.task_level += 1;
        }

        self.make_surface_pack_non_resident_locked(state);
        Ok(stamp)
    }

    /// Submits every batch queued in batched mode, oldest first. Returns how
    /// many were sent.
    ///
    /// # Errors
    /// The backend's error for the first batch it rejects. That batch and
    /// every later one stay queued for the next flush.
    pub fn flush_batched_submissions(&self) -> NeoResult<usize> {
        let mut pending = std::mem::take(&mut self.lock().pending).into_iter();
        let mut count = 0;
        while let Some(batch) = pending.next() {
            let task_count = batch.task_count;
            if let Err(e) = self.backend.submit(batch.clone()) {
                error!(
                    "[CSR {}] batched submission of task count {task_count} failed: {e}",
                    self.context_id()
                );
                let mut state = self.lock();
                let mut unsent: Vec<BatchBuffer> = std::iter::once(batch).chain(pending).collect();
                unsent.append(&mut state.pending);
                state.pending = unsent;
                return Err(e);
            }
            self.latest_flushed_task_count.fetch_max(task_count, Ordering::AcqRel);
            count += 1;
        }
        if count > 0 {
            debug!("[CSR {}] flushed {count} batched submission(s)", self.context_id());
        }
        Ok(count)
    }

    // ===========================================================================================
    // Completion
    // ===========================================================================================

    /// Waits until the engine reaches `task_count`.
    ///
    /// Batched work below the target is submitted first. Without
    /// `enable_timeout` the wait is unbounded. Returns false on timeout.
    pub fn wait_for_completion_with_timeout(&self, enable_timeout: bool, timeout_us: u64, task_count: u32) -> bool {
        if self.completion.is_completed(task_count) {
            return true;
        }
        if self.peek_latest_flushed_task_count() < task_count
            && let Err(e) = self.flush_batched_submissions()
        {
            error!("[CSR {}] flush before wait failed: {e}", self.context_id());
            return false;
        }

        let timeout = enable_timeout.then(|| Duration::from_micros(timeout_us));
        let completed = self.completion.wait(task_count, timeout);
        if !completed {
            debug!(
                "[CSR {}] wait for task count {task_count} timed out at {}",
                self.context_id(),
                self.completion.value()
            );
        }
        completed
    }

    /// Waits (bounded by the default wait timeout) for `task_count`, then
    /// cleans the `usage` list up to it.
    ///
    /// # Errors
    /// `WaitTimeout` if the engine did not get there; the list is still
    /// cleaned, with unfinished entries handed to the deferred deleter.
    pub fn wait_for_task_count_and_clean_allocation_list(
        &self,
        task_count: u32,
        usage: AllocationUsage,
    ) -> NeoResult<()> {
        let timeout_us = self.settings.default_wait_timeout().as_micros() as u64;
        let completed = self.wait_for_completion_with_timeout(true, timeout_us, task_count);
        self.storage.clean_allocation_list(task_count, usage);
        if completed { Ok(()) } else { Err(NeoError::WaitTimeout) }
    }

    // ===========================================================================================
    // Receiver-owned allocations
    // ===========================================================================================

    fn create_owned<F>(&self, size: usize, allocation_type: AllocationType, slot: F) -> NeoResult<AllocationRef>
    where
        F: FnOnce(&mut OwnedAllocations) -> &mut Option<AllocationRef>,
    {
        let mut state = self.lock();
        let slot = slot(&mut state.owned);
        if let Some(existing) = slot {
            return Ok(existing.clone());
        }
        let props = AllocationProperties::new(self.os_context.root_device_index(), size, allocation_type);
        let allocation = self.memory_manager.allocate_graphics_memory_with_properties(&props)?;
        *slot = Some(allocation.clone());
        Ok(allocation)
    }

    pub fn create_preemption_allocation(&self) -> NeoResult<AllocationRef> {
        self.create_owned(PREEMPTION_BUFFER_SIZE, AllocationType::PreemptionBuffer, |o| {
            &mut o.preemption
        })
    }

    pub fn allocate_debug_surface(&self, size: usize) -> NeoResult<AllocationRef> {
        self.create_owned(size, AllocationType::DebugSurface, |o| &mut o.debug_surface)
    }

    pub fn create_per_dss_backed_buffer(&self) -> NeoResult<AllocationRef> {
        self.create_owned(PER_DSS_BACKED_BUFFER_SIZE, AllocationType::PerDssBackedBuffer, |o| {
            &mut o.per_dss_backed
        })
    }

    pub fn create_global_fence_allocation(&self) -> NeoResult<AllocationRef> {
        self.create_owned(PAGE_SIZE, AllocationType::GlobalFence, |o| &mut o.global_fence)
    }

    #[must_use]
    pub fn debug_surface(&self) -> Option<AllocationRef> {
        self.lock().owned.debug_surface.clone()
    }

    // ===========================================================================================
    // Teardown
    // ===========================================================================================

    /// Drains parked allocations up to the last flushed task count, then
    /// releases every buffer the receiver owns.
    fn cleanup_resources(&mut self) {
        if let Err(e) = self.flush_batched_submissions() {
            warn!("[CSR {}] dropping unflushed batches: {e}", self.context_id());
            self.lock().pending.clear();
        }

        let last_flushed = self.peek_latest_flushed_task_count();
        let timeout = self.settings.default_wait_timeout();
        if !self.completion.wait(last_flushed, Some(timeout)) {
            warn!(
                "[CSR {}] engine stuck at {} of {last_flushed} after {timeout:?}; deferring frees",
                self.context_id(),
                self.completion.value()
            );
        }
        self.storage.clean_allocation_list(last_flushed, AllocationUsage::Temporary);
        self.storage.clean_allocation_list(last_flushed, AllocationUsage::Reusable);

        let state = self.state.get_mut().unwrap_or_else(PoisonError::into_inner);
        let mut owned: Vec<AllocationRef> = Vec::new();
        owned.extend(state.command_stream.replace_graphics_allocation(None));
        owned.extend(
            state
                .heaps
                .iter_mut()
                .filter_map(|heap| heap.stream_mut().replace_graphics_allocation(None)),
        );
        let taken = std::mem::take(&mut state.owned);
        owned.extend(
            [taken.preemption, taken.debug_surface, taken.per_dss_backed, taken.global_fence]
                .into_iter()
                .flatten(),
        );
        state.residency.clear();
        state.eviction.clear();

        for allocation in owned {
            self.memory_manager.check_gpu_usage_and_destroy(allocation);
        }
        self.storage.cleanup_all();
        self.memory_manager.unregister_os_context(self.context_id());
        self.memory_manager
            .free_graphics_memory(self.completion.allocation().clone());
    }
}

impl Drop for CommandStreamReceiver {
    fn drop(&mut self) {
        self.cleanup_resources();
    }
}

fn write_record(stream: &mut LinearStream, dwords: &[u32]) -> NeoResult<()> {
    let bytes: Vec<u8> = dwords.iter().flat_map(|d| d.to_le_bytes()).collect();
    stream.write(&bytes).map(|_| ())
}
