//! Events: completion handles for enqueued commands and user-controlled gates.
//!
//! An event whose command could not be submitted yet (incomplete wait list or
//! blocked queue) holds that command and a count of the parents it waits
//! for. When the last parent is submitted, the command is submitted and the
//! event's own children are released in turn.

use crate::csr::submission::CompletionStamp;
use crate::csr::CommandStreamReceiver;
use crate::error::{NeoError, NeoResult};
use crate::queue::command::Command;
use crate::tags::{HwTimeStamps, TagNode, TimestampPacketContainer};
use log::{debug, error, trace};
use std::sync::{Arc, Condvar, Mutex, MutexGuard, PoisonError};
use std::time::{Duration, Instant};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CommandType {
    NdRangeKernel,
    Marker,
    Barrier,
    SvmMemcpy,
    SvmMemfill,
    SvmMap,
    SvmUnmap,
    User,
}

impl CommandType {
    /// Commands that run no kernel of their own and inherit ordering from
    /// the work before them.
    #[must_use]
    pub const fn is_without_kernel(self) -> bool {
        matches!(self, Self::Marker | Self::Barrier | Self::SvmMap | Self::SvmUnmap)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ExecutionStatus {
    Queued,
    Submitted,
    Running,
    Complete,
    Aborted,
}

impl ExecutionStatus {
    #[must_use]
    pub const fn is_final(self) -> bool {
        matches!(self, Self::Complete | Self::Aborted)
    }
}

/// Engine ticks around the event's work.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ProfilingInfo {
    pub start: u32,
    pub end: u32,
}

#[derive(Debug)]
struct EventState {
    status: ExecutionStatus,
    task_level: u32,
    task_count: u32,
    /// Parents still to be submitted, plus one while the enqueue is wiring the event up.
    parent_count: u32,
    pending_task_level: u32,
    parent_aborted: bool,
    children: Vec<Arc<Event>>,
    command: Option<Command>,
    timestamp_packets: TimestampPacketContainer,
    hw_timestamps: Option<TagNode<HwTimeStamps>>,
}

impl EventState {
    fn new(status: ExecutionStatus, parent_count: u32) -> Self {
        Self {
            status,
            task_level: CompletionStamp::NOT_READY,
            task_count: CompletionStamp::NOT_READY,
            parent_count,
            pending_task_level: 0,
            parent_aborted: false,
            children: Vec::new(),
            command: None,
            timestamp_packets: TimestampPacketContainer::new(),
            hw_timestamps: None,
        }
    }
}

#[derive(Debug)]
pub struct Event {
    command_type: CommandType,
    csr: Option<Arc<CommandStreamReceiver>>,
    wait_timeout: Duration,
    state: Mutex<EventState>,
    status_changed: Condvar,
}

impl Event {
    fn with_state(
        command_type: CommandType,
        csr: Option<Arc<CommandStreamReceiver>>,
        wait_timeout: Duration,
        state: EventState,
    ) -> Arc<Self> {
        Arc::new(Self {
            command_type,
            csr,
            wait_timeout,
            state: Mutex::new(state),
            status_changed: Condvar::new(),
        })
    }

    /// Event the application completes or aborts by hand.
    ///
    /// Stays `Queued` until set; commands depending on it are held back.
    #[must_use]
    pub fn new_user(wait_timeout: Duration) -> Arc<Self> {
        Self::with_state(
            CommandType::User,
            None,
            wait_timeout,
            EventState::new(ExecutionStatus::Queued, 0),
        )
    }

    /// Event of an enqueue on `csr`, not submitted yet.
    pub(crate) fn new_queued(
        command_type: CommandType,
        csr: Arc<CommandStreamReceiver>,
        wait_timeout: Duration,
        held: bool,
    ) -> Arc<Self> {
        Self::with_state(
            command_type,
            Some(csr),
            wait_timeout,
            EventState::new(ExecutionStatus::Queued, u32::from(held)),
        )
    }

    fn lock(&self) -> MutexGuard<'_, EventState> {
        self.state.lock().unwrap_or_else(PoisonError::into_inner)
    }

    #[must_use]
    pub const fn command_type(&self) -> CommandType {
        self.command_type
    }

    #[must_use]
    pub fn is_user_event(&self) -> bool {
        self.command_type == CommandType::User
    }

    #[must_use]
    pub fn csr(&self) -> Option<&Arc<CommandStreamReceiver>> {
        self.csr.as_ref()
    }

    pub(crate) fn context_id(&self) -> Option<u32> {
        self.csr.as_ref().map(|csr| csr.os_context().context_id())
    }

    #[must_use]
    pub fn peek_task_level(&self) -> u32 {
        self.lock().task_level
    }

    #[must_use]
    pub fn peek_task_count(&self) -> u32 {
        self.lock().task_count
    }

    #[must_use]
    pub fn peek_execution_status(&self) -> ExecutionStatus {
        self.lock().status
    }

    #[must_use]
    pub fn parent_count(&self) -> u32 {
        self.lock().parent_count
    }

    #[must_use]
    pub fn children_count(&self) -> usize {
        self.lock().children.len()
    }

    /// Current status, promoting a submitted event whose task count the engine reached.
    pub fn execution_status(&self) -> ExecutionStatus {
        self.update_execution_status()
    }

    pub fn update_execution_status(&self) -> ExecutionStatus {
        let mut state = self.lock();
        if matches!(state.status, ExecutionStatus::Submitted | ExecutionStatus::Running)
            && let Some(csr) = &self.csr
            && csr.completion().is_completed(state.task_count)
        {
            state.status = ExecutionStatus::Complete;
            self.status_changed.notify_all();
        }
        state.status
    }

    /// Whether commands waiting on this event must be held back.
    #[must_use]
    pub fn is_blocking_dependents(&self) -> bool {
        let status = self.lock().status;
        if self.is_user_event() {
            !status.is_final()
        } else {
            status == ExecutionStatus::Queued
        }
    }

    /// Copies of the timestamp packets the event's work writes.
    pub(crate) fn timestamp_packets(&self) -> TimestampPacketContainer {
        let mut copy = TimestampPacketContainer::new();
        copy.assign_and_increment_refs(&self.lock().timestamp_packets);
        copy
    }

    pub(crate) fn attach_timestamps(
        &self,
        packets: &TimestampPacketContainer,
        hw_timestamps: Option<TagNode<HwTimeStamps>>,
    ) {
        let mut state = self.lock();
        state.timestamp_packets.assign_and_increment_refs(packets);
        state.hw_timestamps = hw_timestamps;
    }

    pub(crate) fn set_command(&self, command: Command) {
        self.lock().command = Some(command);
    }

    pub(crate) fn increment_parent_count(&self) {
        self.lock().parent_count += 1;
    }

    /// Registers `child` to be released when this event is submitted.
    ///
    /// Returns false when this event no longer holds anyone back; the caller
    /// then releases the child itself.
    pub(crate) fn add_child(&self, child: &Arc<Self>) -> bool {
        let mut state = self.lock();
        let holding = if self.is_user_event() {
            !state.status.is_final()
        } else {
            state.status == ExecutionStatus::Queued
        };
        if holding {
            state.children.push(child.clone());
        }
        holding
    }

    /// Records that one parent was submitted (or aborted). The last one
    /// submits the held command.
    pub(crate) fn unblock_by(self: &Arc<Self>, parent_task_level: Option<u32>, parent_aborted: bool) {
        let (command, aborted, task_level) = {
            let mut state = self.lock();
            if let Some(level) = parent_task_level
                && level != CompletionStamp::NOT_READY
            {
                state.pending_task_level = state.pending_task_level.max(level + 1);
            }
            state.parent_aborted |= parent_aborted;
            state.parent_count = state.parent_count.saturating_sub(1);
            if state.parent_count > 0 || state.status != ExecutionStatus::Queued {
                return;
            }
            (state.command.take(), state.parent_aborted, state.pending_task_level)
        };

        if aborted {
            debug!("[Event] {:?} aborted by a parent", self.command_type);
            self.abort(command);
            return;
        }

        match command {
            Some(command) => match command.submit(task_level) {
                Ok(stamp) => self.mark_submitted(stamp),
                Err(e) => {
                    error!("[Event] submitting blocked {:?} failed: {e}", self.command_type);
                    self.abort(None);
                }
            },
            None => {
                let task_count = self.csr.as_ref().map_or(0, |csr| csr.peek_task_count());
                self.mark_submitted(CompletionStamp {
                    task_count,
                    task_level,
                    flush_stamp: 0,
                });
            }
        }
    }

    /// Drops the hold the enqueue kept while wiring up parents.
    pub(crate) fn release_hold(self: &Arc<Self>) {
        self.unblock_by(None, false);
    }

    pub(crate) fn mark_submitted(&self, stamp: CompletionStamp) {
        let children = {
            let mut state = self.lock();
            state.task_count = stamp.task_count;
            state.task_level = stamp.task_level;
            if state.status == ExecutionStatus::Queued {
                state.status = ExecutionStatus::Submitted;
            }
            self.status_changed.notify_all();
            std::mem::take(&mut state.children)
        };
        trace!(
            "[Event] {:?} submitted at task count {} level {}",
            self.command_type, stamp.task_count, stamp.task_level
        );
        for child in children {
            child.unblock_by(Some(stamp.task_level), false);
        }
    }

    fn abort(&self, command: Option<Command>) {
        let children = {
            let mut state = self.lock();
            state.status = ExecutionStatus::Aborted;
            for node in state.timestamp_packets.peek_nodes() {
                node.abandon();
            }
            self.status_changed.notify_all();
            std::mem::take(&mut state.children)
        };
        if let Some(command) = command {
            command.abandon();
        }
        for child in children {
            child.unblock_by(None, true);
        }
    }

    /// Completes or aborts a user event and releases everything it held.
    ///
    /// # Errors
    /// `InvalidEvent` for non-user events, for a status other than
    /// `Complete`/`Aborted`, and when the status was already set.
    pub fn set_user_status(self: &Arc<Self>, status: ExecutionStatus) -> NeoResult<()> {
        if !self.is_user_event() {
            return Err(NeoError::InvalidEvent("status can only be set on user events".into()));
        }
        if !status.is_final() {
            return Err(NeoError::InvalidEvent(format!("{status:?} is not a terminal status")));
        }

        if status == ExecutionStatus::Aborted {
            if self.lock().status.is_final() {
                return Err(NeoError::InvalidEvent("user event status already set".into()));
            }
            self.abort(None);
            return Ok(());
        }

        let children = {
            let mut state = self.lock();
            if state.status.is_final() {
                return Err(NeoError::InvalidEvent("user event status already set".into()));
            }
            state.status = ExecutionStatus::Complete;
            state.task_level = 0;
            state.task_count = 0;
            self.status_changed.notify_all();
            std::mem::take(&mut state.children)
        };
        debug!("[Event] user event complete, releasing {} command(s)", children.len());
        for child in children {
            child.unblock_by(Some(0), false);
        }
        Ok(())
    }

    /// Blocks until the event's work is complete.
    ///
    /// # Errors
    /// `WaitTimeout` when it does not complete within the event's wait
    /// timeout, `InvalidEvent` when it was aborted.
    pub fn wait(&self) -> NeoResult<()> {
        let deadline = Instant::now() + self.wait_timeout;
        let task_count = {
            let mut state = self.lock();
            loop {
                match state.status {
                    ExecutionStatus::Aborted => {
                        return Err(NeoError::InvalidEvent("execution aborted".into()));
                    }
                    ExecutionStatus::Complete => return Ok(()),
                    ExecutionStatus::Submitted | ExecutionStatus::Running if !self.is_user_event() => {
                        break state.task_count;
                    }
                    _ => {}
                }
                let now = Instant::now();
                if now >= deadline {
                    return Err(NeoError::WaitTimeout);
                }
                state = self
                    .status_changed
                    .wait_timeout(state, deadline - now)
                    .unwrap_or_else(PoisonError::into_inner)
                    .0;
            }
        };

        let Some(csr) = &self.csr else {
            return Ok(());
        };
        let remaining = deadline.saturating_duration_since(Instant::now());
        if !csr.wait_for_completion_with_timeout(true, remaining.as_micros() as u64, task_count) {
            return Err(NeoError::WaitTimeout);
        }
        self.update_execution_status();
        Ok(())
    }

    /// Start and end ticks of the event's work.
    ///
    /// # Errors
    /// `InvalidEvent` until the event is complete or when its queue
    /// recorded no timestamps.
    pub fn profiling_info(&self) -> NeoResult<ProfilingInfo> {
        if self.update_execution_status() != ExecutionStatus::Complete {
            return Err(NeoError::InvalidEvent("profiling data not available yet".into()));
        }
        let state = self.lock();
        if let Some(node) = &state.hw_timestamps {
            let (start, end) = node.global_range();
            return Ok(ProfilingInfo { start, end });
        }
        let nodes = state.timestamp_packets.peek_nodes();
        match (nodes.first(), nodes.last()) {
            (Some(first), Some(last)) => Ok(ProfilingInfo {
                start: first.global_start(0),
                end: last.global_end(0),
            }),
            _ => Err(NeoError::InvalidEvent("no timestamps recorded for event".into())),
        }
    }
}
