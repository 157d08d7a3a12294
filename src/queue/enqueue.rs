//! The enqueue pipeline.
//!
//! Every public enqueue funnels into [`CommandQueue::enqueue_handler`], which
//! computes the task level, decides whether the work can go to the engine
//! now, and either dispatches it or captures it as a [`Command`] held by the
//! event of the blocking dependency.

use super::{CommandQueue, QueueState};
use crate::csr::FlushTaskRequest;
use crate::csr::submission::{
    CompletionStamp, DispatchFlags, GpuOperation, PostSyncValue, SemaphoreCondition, StreamRegion,
};
use crate::error::{NeoError, NeoResult};
use crate::memory::AllocationRef;
use crate::memory::manager::EngineType;
use crate::memory::storage::AllocationUsage;
use crate::queue::command::Command;
use crate::queue::dispatch::{DispatchInfo, Kernel, KernelArg, KernelEffect, MultiDispatchInfo, PrintfHandler};
use crate::queue::event::{CommandType, Event, ExecutionStatus};
use crate::svm::{InternalMemoryType, SvmAllocationData};
use crate::tags::timestamp::TIMESTAMP_NOT_WRITTEN;
use crate::tags::{HwTimeStamps, TagNode, TimestampPacketContainer, TimestampPacketStorage};
use crate::utils::memory_constants::{CACHE_LINE_SIZE, CS_OVERFETCH_SIZE};
use log::{debug, trace, warn};
use std::sync::{Arc, PoisonError};

/// Everything needed to put one enqueue on the engine.
#[derive(Debug)]
pub(crate) struct DispatchPlan {
    command_type: CommandType,
    multi_dispatch: MultiDispatchInfo,
    surfaces: Vec<AllocationRef>,
    /// Packets of work on this queue's engine that must finish first.
    local_dependencies: TimestampPacketContainer,
    /// Wait-list events of other engines.
    remote_events: Vec<Arc<Event>>,
    /// One packet per dispatch, written by this work.
    packets: TimestampPacketContainer,
    hw_timestamps: Option<TagNode<HwTimeStamps>>,
    printf: Option<PrintfHandler>,
    blocking: bool,
}

impl DispatchPlan {
    pub(crate) const fn command_type(&self) -> CommandType {
        self.command_type
    }

    /// Releases whatever waits on this work's packets; it will never run.
    pub(crate) fn abandon(self) {
        for node in self.packets.peek_nodes() {
            node.abandon();
        }
    }
}

impl CommandQueue {
    // ===========================================================================================
    // Task levels
    // ===========================================================================================

    /// Highest task level among `base` and the wait-list events.
    ///
    /// An event not submitted yet has no level, which makes the result
    /// `NOT_READY`.
    #[must_use]
    pub fn task_level_from_wait_list(base: u32, wait_list: &[Arc<Event>]) -> u32 {
        wait_list
            .iter()
            .map(|event| event.peek_task_level())
            .fold(base, u32::max)
    }

    /// Whether the enqueue starts a new task level.
    ///
    /// Commands without a kernel of their own run at the level of the work
    /// before them, barriers excepted. A barrier always starts a new level,
    /// on out-of-order queues too, so everything enqueued after it orders
    /// behind everything enqueued before it. Any other command on an
    /// out-of-order queue serializes only through its wait list: without one
    /// it never bumps, with one it bumps only past what it waits for.
    #[must_use]
    pub fn is_task_level_update_required(
        out_of_order: bool,
        task_level: u32,
        wait_list: &[Arc<Event>],
        command_type: CommandType,
        queue_task_level: u32,
    ) -> bool {
        if task_level == CompletionStamp::NOT_READY {
            return false;
        }
        if command_type.is_without_kernel() && command_type != CommandType::Barrier {
            return false;
        }
        if command_type == CommandType::Barrier {
            return true;
        }
        if out_of_order {
            let Some(dependency_level) = wait_list.iter().map(|event| event.peek_task_level()).max() else {
                return false;
            };
            return dependency_level.saturating_add(1) > queue_task_level;
        }
        true
    }

    fn obtain_task_level_and_blocked_status(
        &self,
        state: &mut QueueState,
        wait_list: &[Arc<Event>],
        command_type: CommandType,
    ) -> (u32, bool) {
        let queue_blocked = Self::is_queue_blocked_locked(state);
        let mut task_level = Self::task_level_from_wait_list(state.task_level, wait_list);
        let blocked = queue_blocked || task_level == CompletionStamp::NOT_READY;
        if Self::is_task_level_update_required(
            self.is_ooq_enabled(),
            task_level,
            wait_list,
            command_type,
            state.task_level,
        ) {
            task_level += 1;
            state.task_level = task_level;
        }
        (task_level, blocked)
    }

    // ===========================================================================================
    // Handler
    // ===========================================================================================

    /// Runs one enqueue: dependency resolution, then either dispatch or
    /// capture behind the events it waits for.
    ///
    /// # Errors
    /// `InvalidEvent` when a wait-list event was aborted, `InvalidAllocation`
    /// for kernel arguments that are not allocations, submission errors from
    /// the receiver, and `WaitTimeout` for blocking enqueues that do not
    /// complete in time.
    pub(crate) fn enqueue_handler(
        &self,
        command_type: CommandType,
        surfaces: &[AllocationRef],
        blocking: bool,
        multi_dispatch: MultiDispatchInfo,
        wait_list: &[Arc<Event>],
        want_event: bool,
    ) -> NeoResult<Option<Arc<Event>>> {
        if wait_list
            .iter()
            .any(|event| event.peek_execution_status() == ExecutionStatus::Aborted)
        {
            return Err(NeoError::InvalidEvent("wait list contains an aborted event".into()));
        }
        let blocking = blocking || self.settings.make_each_enqueue_blocking;

        let mut all_surfaces = surfaces.to_vec();
        for dispatch in multi_dispatch.iter() {
            all_surfaces.extend(dispatch.kernel().arg_allocations(&self.svm)?);
        }
        let printf = PrintfHandler::create(&multi_dispatch, &self.csr)?;

        let mut state = self.lock();
        let (task_level, blocked) = self.obtain_task_level_and_blocked_status(&mut state, wait_list, command_type);

        let own_context = self.csr.os_context().context_id();
        let mut local_dependencies = TimestampPacketContainer::new();
        let mut remote_events = Vec::new();
        for event in wait_list {
            match event.context_id() {
                Some(id) if id == own_context => {
                    local_dependencies.assign_and_increment_refs(&event.timestamp_packets());
                }
                Some(_) => remote_events.push(event.clone()),
                None => {}
            }
        }
        if !self.is_ooq_enabled() {
            local_dependencies.assign_and_increment_refs(&state.timestamp_packets);
        }

        let mut packets = TimestampPacketContainer::new();
        if self.csr.timestamp_packet_write_enabled() {
            for _ in multi_dispatch.iter() {
                packets.add(self.csr.timestamp_packet_allocator().get_tag()?);
            }
        }
        let hw_timestamps = if self.properties.profiling && !multi_dispatch.is_empty() {
            Some(self.csr.profiling_tag_allocator().get_tag()?)
        } else {
            None
        };
        if !packets.is_empty() {
            let mut current = TimestampPacketContainer::new();
            current.assign_and_increment_refs(&packets);
            state.timestamp_packets.swap(&mut current);
            state.deferred_timestamp_packets.assign_and_clear(&mut current);
        }

        let mut plan = DispatchPlan {
            command_type,
            multi_dispatch,
            surfaces: all_surfaces,
            local_dependencies,
            remote_events,
            packets,
            hw_timestamps,
            printf,
            blocking,
        };

        if blocked {
            let event = Event::new_queued(
                command_type,
                self.csr.clone(),
                self.settings.default_wait_timeout(),
                true,
            );
            event.attach_timestamps(&plan.packets, plan.hw_timestamps.clone());

            let parents = wait_list.iter().cloned().chain(state.virtual_event.take());
            for parent in parents {
                event.increment_parent_count();
                if !parent.add_child(&event) {
                    let aborted = parent.peek_execution_status() == ExecutionStatus::Aborted;
                    event.unblock_by(Some(parent.peek_task_level()), aborted);
                }
            }
            debug!(
                "[CommandQueue] {command_type:?} blocked behind {} parent(s)",
                event.parent_count().saturating_sub(1)
            );
            event.set_command(Command::new(self.self_ref.clone(), plan));
            state.virtual_event = Some(event.clone());
            drop(state);

            event.release_hold();
            if blocking {
                event.wait()?;
            }
            return Ok(want_event.then_some(event));
        }

        let event = want_event.then(|| {
            let event = Event::new_queued(
                command_type,
                self.csr.clone(),
                self.settings.default_wait_timeout(),
                false,
            );
            event.attach_timestamps(&plan.packets, plan.hw_timestamps.clone());
            event
        });

        let result = self.dispatch_locked(&mut state, &mut plan, task_level);
        drop(state);
        let stamp = self.complete_dispatch(plan, result)?;

        if let Some(event) = &event {
            event.mark_submitted(stamp);
        }
        if blocking {
            self.csr
                .wait_for_task_count_and_clean_allocation_list(stamp.task_count, AllocationUsage::Temporary)?;
            if let Some(event) = &event {
                event.update_execution_status();
            }
        }
        Ok(event)
    }

    /// Submits a command captured while it was blocked.
    pub(crate) fn submit_plan(&self, mut plan: DispatchPlan, task_level: u32) -> NeoResult<CompletionStamp> {
        let result = {
            let mut state = self.lock();
            self.dispatch_locked(&mut state, &mut plan, task_level)
        };
        self.complete_dispatch(plan, result)
    }

    fn complete_dispatch(
        &self,
        mut plan: DispatchPlan,
        result: NeoResult<CompletionStamp>,
    ) -> NeoResult<CompletionStamp> {
        let stamp = match result {
            Ok(stamp) => stamp,
            Err(e) => {
                warn!("[CommandQueue] {:?} not submitted: {e}", plan.command_type);
                plan.abandon();
                return Err(e);
            }
        };
        if let Some(printf) = plan.printf.take() {
            self.csr
                .wait_for_task_count_and_clean_allocation_list(stamp.task_count, AllocationUsage::Temporary)?;
            let output = printf.print_enqueue_output()?;
            self.printf_output
                .lock()
                .unwrap_or_else(PoisonError::into_inner)
                .extend(output.lines().map(str::to_owned));
        }
        Ok(stamp)
    }

    fn dispatch_locked(
        &self,
        state: &mut QueueState,
        plan: &mut DispatchPlan,
        task_level: u32,
    ) -> NeoResult<CompletionStamp> {
        let task_level = if task_level == CompletionStamp::NOT_READY {
            state.task_level
        } else {
            task_level.max(state.task_level)
        };

        let mut operations = Vec::new();
        let mut dependencies = TimestampPacketContainer::new();
        let mut cross_engine = false;

        for event in &plan.remote_events {
            let Some(other) = event.csr() else {
                continue;
            };
            let task_count = event.peek_task_count();
            if task_count == CompletionStamp::NOT_READY || event.update_execution_status() == ExecutionStatus::Complete {
                continue;
            }
            if other.peek_latest_flushed_task_count() < task_count {
                other.flush_batched_submissions()?;
            }
            let mut packets = event.timestamp_packets();
            if packets.is_empty() {
                operations.push(GpuOperation::SemaphoreWait {
                    src: other.tag_allocation().clone(),
                    offset: 0,
                    condition: SemaphoreCondition::GreaterOrEqual(task_count),
                });
                self.csr.make_resident(other.tag_allocation());
            } else {
                packets.resolve_dependencies(false);
                dependencies.assign_and_clear(&mut packets);
            }
            cross_engine = true;
        }

        if !plan.multi_dispatch.is_empty() {
            plan.local_dependencies.resolve_dependencies(false);
            dependencies.assign_and_clear(&mut plan.local_dependencies);
        }

        for node in dependencies.peek_nodes() {
            node.increment_implicit_dependencies();
            let base = node.record().offset();
            operations.push(GpuOperation::SemaphoreWait {
                src: node.allocation().clone(),
                offset: base + TimestampPacketStorage::context_end_offset(0),
                condition: SemaphoreCondition::NotEqual(TIMESTAMP_NOT_WRITTEN),
            });
            operations.push(GpuOperation::AtomicDecrement {
                dst: node.allocation().clone(),
                offset: base + TimestampPacketStorage::implicit_dependencies_offset(),
            });
        }
        dependencies.make_resident(&self.csr);

        if plan.multi_dispatch.is_empty() && operations.is_empty() {
            let stamp = CompletionStamp {
                task_count: self.csr.peek_task_count(),
                task_level,
                flush_stamp: 0,
            };
            trace!(
                "[CommandQueue] {:?} without submission at task count {}",
                plan.command_type, stamp.task_count
            );
            state.task_level = state.task_level.max(task_level);
            state.task_count = state.task_count.max(stamp.task_count);
            return Ok(stamp);
        }

        if let Some(node) = &plan.hw_timestamps {
            let base = node.record().offset();
            operations.push(timestamp_write(node.allocation(), base + HwTimeStamps::global_start_offset()));
            operations.push(timestamp_write(node.allocation(), base + HwTimeStamps::context_start_offset()));
        }
        for (index, dispatch) in plan.multi_dispatch.iter().enumerate() {
            let packet = plan.packets.peek_nodes().get(index);
            if let Some(node) = packet {
                let base = node.record().offset();
                operations.push(timestamp_write(node.allocation(), base + TimestampPacketStorage::context_start_offset(0)));
                operations.push(timestamp_write(node.allocation(), base + TimestampPacketStorage::global_start_offset(0)));
            }
            for effect in dispatch.kernel().effects() {
                match effect {
                    KernelEffect::Operation(operation) => operations.push(operation.clone()),
                    KernelEffect::Printf(line) => {
                        if let Some(printf) = plan.printf.as_mut() {
                            operations.extend(printf.emit(line)?);
                        }
                    }
                }
            }
            if let Some(node) = packet {
                let base = node.record().offset();
                operations.push(timestamp_write(node.allocation(), base + TimestampPacketStorage::context_end_offset(0)));
                operations.push(timestamp_write(node.allocation(), base + TimestampPacketStorage::global_end_offset(0)));
            }
        }
        if let Some(node) = &plan.hw_timestamps {
            let base = node.record().offset();
            operations.push(timestamp_write(node.allocation(), base + HwTimeStamps::context_end_offset()));
            operations.push(timestamp_write(node.allocation(), base + HwTimeStamps::global_end_offset()));
        }

        if !plan.multi_dispatch.is_empty() {
            self.svm.page_fault_manager().move_all_allocations_to_gpu_domain();
            if plan.multi_dispatch.has_indirect_access() {
                self.svm.make_internal_allocations_resident(
                    &self.csr,
                    InternalMemoryType::DeviceUnified.mask() | InternalMemoryType::SharedUnified.mask(),
                );
            }
        }
        for surface in &plan.surfaces {
            self.csr.make_resident(surface);
        }
        plan.packets.make_resident(&self.csr);
        if let Some(node) = &plan.hw_timestamps {
            self.csr.make_resident(node.allocation());
        }
        if let Some(printf) = &plan.printf {
            self.csr.make_resident(printf.surface());
        }

        let command_stream = self.encode(state, &plan.multi_dispatch, &operations)?;
        let flags = DispatchFlags {
            blocking: plan.blocking,
            stalling_barrier: plan.command_type == CommandType::Barrier,
            low_priority: self.csr.os_context().engine_type() == EngineType::LowPriority,
            has_cross_engine_dependencies: cross_engine,
        };
        let stamp = self.csr.flush_task(FlushTaskRequest {
            command_stream: Some(command_stream),
            task_level,
            flags,
            operations,
        })?;
        debug!(
            "[CommandQueue] {:?} submitted: task count {}, level {}",
            plan.command_type, stamp.task_count, stamp.task_level
        );

        state.task_level = state.task_level.max(stamp.task_level);
        state.task_count = state.task_count.max(stamp.task_count);
        state.deferred_timestamp_packets.resolve_dependencies(false);
        Ok(stamp)
    }

    fn encode(
        &self,
        state: &mut QueueState,
        multi_dispatch: &MultiDispatchInfo,
        operations: &[GpuOperation],
    ) -> NeoResult<StreamRegion> {
        let size = operations
            .iter()
            .map(|op| self.encoder.operation_size(op))
            .chain(multi_dispatch.iter().map(|d| self.encoder.walker_size(d)))
            .sum::<usize>();
        self.csr.ensure_command_buffer_allocation(
            &mut state.command_stream,
            size,
            CACHE_LINE_SIZE + CS_OVERFETCH_SIZE,
        )?;

        let start = state.command_stream.used();
        for operation in operations {
            self.encoder.encode_operation(operation, &mut state.command_stream)?;
        }
        for dispatch in multi_dispatch.iter() {
            self.encoder.encode_walker(dispatch, &mut state.command_stream)?;
        }
        let end = state.command_stream.used();
        let Some(allocation) = state.command_stream.graphics_allocation().cloned() else {
            return Err(NeoError::Unrecoverable("queue command stream without backing".into()));
        };
        Ok(StreamRegion { allocation, start, end })
    }

    // ===========================================================================================
    // Public enqueues
    // ===========================================================================================

    /// Enqueues one kernel launch.
    pub fn enqueue_kernel(
        &self,
        dispatch: DispatchInfo,
        wait_list: &[Arc<Event>],
        want_event: bool,
    ) -> NeoResult<Option<Arc<Event>>> {
        self.enqueue_handler(
            CommandType::NdRangeKernel,
            &[],
            false,
            MultiDispatchInfo::single(dispatch),
            wait_list,
            want_event,
        )
    }

    /// Event completing once the wait list (or, without one, all earlier work) has.
    pub fn enqueue_marker(&self, wait_list: &[Arc<Event>], want_event: bool) -> NeoResult<Option<Arc<Event>>> {
        self.enqueue_handler(
            CommandType::Marker,
            &[],
            false,
            MultiDispatchInfo::new(),
            wait_list,
            want_event,
        )
    }

    /// Like a marker, but later work is ordered after it.
    pub fn enqueue_barrier(&self, wait_list: &[Arc<Event>], want_event: bool) -> NeoResult<Option<Arc<Event>>> {
        self.enqueue_handler(
            CommandType::Barrier,
            &[],
            false,
            MultiDispatchInfo::new(),
            wait_list,
            want_event,
        )
    }

    /// Region `[ptr, ptr + size)` of an SVM allocation and its offset in it.
    fn svm_range(&self, ptr: u64, size: usize) -> NeoResult<(SvmAllocationData, usize)> {
        let data = self
            .svm
            .get_svm_alloc(ptr)
            .ok_or_else(|| NeoError::InvalidAllocation(format!("{ptr:#x} is not an SVM pointer")))?;
        let offset = (ptr - data.base()) as usize;
        if size == 0 || offset + size > data.size {
            return Err(NeoError::InvalidSize(size));
        }
        Ok((data, offset))
    }

    pub fn enqueue_svm_memcpy(
        &self,
        blocking: bool,
        dst_ptr: u64,
        src_ptr: u64,
        size: usize,
        wait_list: &[Arc<Event>],
        want_event: bool,
    ) -> NeoResult<Option<Arc<Event>>> {
        let (dst, dst_offset) = self.svm_range(dst_ptr, size)?;
        let (src, src_offset) = self.svm_range(src_ptr, size)?;
        let kernel = Kernel::new("CopyBufferToBuffer")
            .arg(KernelArg::Svm(src_ptr))
            .arg(KernelArg::Svm(dst_ptr))
            .effect(GpuOperation::Copy {
                src: src.gpu_allocation,
                src_offset,
                dst: dst.gpu_allocation,
                dst_offset,
                size,
            });
        self.enqueue_handler(
            CommandType::SvmMemcpy,
            &[],
            blocking,
            MultiDispatchInfo::builtin(kernel),
            wait_list,
            want_event,
        )
    }

    pub fn enqueue_svm_memfill(
        &self,
        ptr: u64,
        pattern: &[u8],
        size: usize,
        wait_list: &[Arc<Event>],
        want_event: bool,
    ) -> NeoResult<Option<Arc<Event>>> {
        if pattern.is_empty() || size % pattern.len() != 0 {
            return Err(NeoError::InvalidSize(pattern.len()));
        }
        let (dst, offset) = self.svm_range(ptr, size)?;
        let kernel = Kernel::new("FillBuffer")
            .arg(KernelArg::Svm(ptr))
            .arg(KernelArg::Value(pattern.to_vec()))
            .effect(GpuOperation::Fill {
                dst: dst.gpu_allocation,
                offset,
                size,
                pattern: pattern.to_vec(),
            });
        self.enqueue_handler(
            CommandType::SvmMemfill,
            &[],
            false,
            MultiDispatchInfo::builtin(kernel),
            wait_list,
            want_event,
        )
    }

    /// Maps an SVM region for host access.
    ///
    /// With dual storage the region is copied to the CPU allocation; a
    /// shared allocation needs no engine work.
    pub fn enqueue_svm_map(
        &self,
        blocking: bool,
        ptr: u64,
        size: usize,
        read_only: bool,
        wait_list: &[Arc<Event>],
        want_event: bool,
    ) -> NeoResult<Option<Arc<Event>>> {
        let (data, offset) = self.svm_range(ptr, size)?;
        self.svm
            .insert_svm_map_operation(ptr, size, data.base(), offset, read_only);

        let multi_dispatch = match &data.cpu_allocation {
            Some(cpu) => MultiDispatchInfo::builtin(
                Kernel::new("CopyBufferToBuffer").effect(GpuOperation::Copy {
                    src: data.gpu_allocation.clone(),
                    src_offset: offset,
                    dst: cpu.clone(),
                    dst_offset: offset,
                    size,
                }),
            ),
            None => MultiDispatchInfo::new(),
        };
        let mut surfaces = vec![data.gpu_allocation.clone()];
        surfaces.extend(data.cpu_allocation.clone());

        self.enqueue_handler(
            CommandType::SvmMap,
            &surfaces,
            blocking,
            multi_dispatch,
            wait_list,
            want_event,
        )
        .inspect_err(|_| {
            self.svm.remove_svm_map_operation(ptr);
        })
    }

    /// Ends a map; a writable dual-storage map copies the region back to the GPU allocation.
    pub fn enqueue_svm_unmap(
        &self,
        ptr: u64,
        wait_list: &[Arc<Event>],
        want_event: bool,
    ) -> NeoResult<Option<Arc<Event>>> {
        let map = self
            .svm
            .get_svm_map_operation(ptr)
            .ok_or_else(|| NeoError::InvalidAllocation(format!("{ptr:#x} is not mapped")))?;
        let (data, offset) = self.svm_range(ptr, map.region_size)?;

        let multi_dispatch = match &data.cpu_allocation {
            Some(cpu) if !map.read_only => MultiDispatchInfo::builtin(
                Kernel::new("CopyBufferToBuffer").effect(GpuOperation::Copy {
                    src: cpu.clone(),
                    src_offset: offset,
                    dst: data.gpu_allocation.clone(),
                    dst_offset: offset,
                    size: map.region_size,
                }),
            ),
            _ => MultiDispatchInfo::new(),
        };
        let mut surfaces = vec![data.gpu_allocation.clone()];
        surfaces.extend(data.cpu_allocation.clone());

        let event = self.enqueue_handler(
            CommandType::SvmUnmap,
            &surfaces,
            false,
            multi_dispatch,
            wait_list,
            want_event,
        )?;
        self.svm.remove_svm_map_operation(ptr);
        Ok(event)
    }

    // ===========================================================================================
    // Flush / finish
    // ===========================================================================================

    /// Submits batched work of the queue's engine.
    pub fn flush(&self) -> NeoResult<()> {
        self.csr.flush_batched_submissions().map(|_| ())
    }

    /// Waits for everything enqueued so far.
    ///
    /// # Errors
    /// `WaitTimeout` when blocked work is not released or the engine does
    /// not finish within the default wait timeout.
    pub fn finish(&self) -> NeoResult<()> {
        let virtual_event = self.lock().virtual_event.clone();
        if let Some(event) = virtual_event {
            match event.wait() {
                Ok(()) | Err(NeoError::InvalidEvent(_)) => {}
                Err(e) => return Err(e),
            }
        }
        self.csr.flush_batched_submissions()?;
        let task_count = self.lock().task_count;
        self.csr
            .wait_for_task_count_and_clean_allocation_list(task_count, AllocationUsage::Temporary)?;
        self.lock().deferred_timestamp_packets.resolve_dependencies(true);
        Ok(())
    }
}

fn timestamp_write(allocation: &AllocationRef, offset: usize) -> GpuOperation {
    GpuOperation::Write {
        dst: allocation.clone(),
        offset,
        value: PostSyncValue::Timestamp,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::Duration;

    /// Completed user event; sits at task level 0.
    fn completed_user_event() -> Arc<Event> {
        let event = Event::new_user(Duration::from_millis(10));
        event.set_user_status(ExecutionStatus::Complete).unwrap();
        event
    }

    #[test]
    fn wait_list_level_is_max_or_not_ready() {
        let done = completed_user_event();
        let pending = Event::new_user(Duration::from_millis(10));
        assert_eq!(CommandQueue::task_level_from_wait_list(3, &[done.clone()]), 3);
        assert_eq!(
            CommandQueue::task_level_from_wait_list(3, &[done, pending]),
            CompletionStamp::NOT_READY
        );
    }

    #[test]
    fn in_order_bumps_except_for_inheriting_commands() {
        let kernel = CommandType::NdRangeKernel;
        assert!(CommandQueue::is_task_level_update_required(false, 2, &[], kernel, 2));
        assert!(CommandQueue::is_task_level_update_required(false, 2, &[], CommandType::Barrier, 2));
        assert!(!CommandQueue::is_task_level_update_required(false, 2, &[], CommandType::Marker, 2));
        assert!(!CommandQueue::is_task_level_update_required(false, 2, &[], CommandType::SvmMap, 2));
        assert!(!CommandQueue::is_task_level_update_required(
            false,
            CompletionStamp::NOT_READY,
            &[],
            kernel,
            2
        ));
    }

    #[test]
    fn out_of_order_bumps_only_past_dependencies() {
        let kernel = CommandType::NdRangeKernel;
        assert!(!CommandQueue::is_task_level_update_required(true, 4, &[], kernel, 4));
        let dep = completed_user_event();
        // dependency at level 0 is already behind the queue's level
        assert!(!CommandQueue::is_task_level_update_required(true, 4, &[dep.clone()], kernel, 4));
        assert!(CommandQueue::is_task_level_update_required(true, 0, &[dep], kernel, 0));
    }

    #[test]
    fn out_of_order_barrier_always_bumps() {
        let barrier = CommandType::Barrier;
        assert!(CommandQueue::is_task_level_update_required(true, 4, &[], barrier, 4));
        let dep = completed_user_event();
        assert!(CommandQueue::is_task_level_update_required(true, 4, &[dep], barrier, 4));
        assert!(!CommandQueue::is_task_level_update_required(
            true,
            CompletionStamp::NOT_READY,
            &[],
            barrier,
            4
        ));
    }
}
