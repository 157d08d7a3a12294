//! Command queues: the enqueue front end over one command stream receiver.

pub mod command;
pub mod dispatch;
pub mod enqueue;
pub mod event;

use crate::config::DebugSettings;
use crate::csr::CommandStreamReceiver;
use crate::memory::storage::AllocationUsage;
use crate::memory::stream::LinearStream;
use crate::svm::SvmAllocsManager;
use crate::tags::TimestampPacketContainer;
use dispatch::{DispatchEncoder, OpaqueEncoder};
use event::Event;
use log::{debug, info};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError, Weak};

pub use dispatch::{DispatchInfo, Kernel, KernelArg, MultiDispatchInfo, PrintfHandler};
pub use event::{CommandType, ExecutionStatus, ProfilingInfo};

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct QueueProperties {
    /// Commands are ordered only by their wait lists.
    pub out_of_order: bool,
    /// Kernels record start/end ticks for their events.
    pub profiling: bool,
}

#[derive(Debug, Default)]
struct QueueState {
    command_stream: LinearStream,
    task_level: u32,
    task_count: u32,
    /// Last blocked enqueue; later enqueues queue up behind it.
    virtual_event: Option<Arc<Event>>,
    /// Packets of the previous enqueue.
    timestamp_packets: TimestampPacketContainer,
    /// Older packets kept alive until `finish`.
    deferred_timestamp_packets: TimestampPacketContainer,
}

pub struct QueueBuilder {
    csr: Arc<CommandStreamReceiver>,
    svm: Arc<SvmAllocsManager>,
    settings: Arc<DebugSettings>,
    encoder: Arc<dyn DispatchEncoder>,
    properties: QueueProperties,
}

impl QueueBuilder {
    #[must_use]
    pub const fn out_of_order(mut self) -> Self {
        self.properties.out_of_order = true;
        self
    }

    #[must_use]
    pub const fn profiling(mut self) -> Self {
        self.properties.profiling = true;
        self
    }

    #[must_use]
    pub fn with_encoder(mut self, encoder: Arc<dyn DispatchEncoder>) -> Self {
        self.encoder = encoder;
        self
    }

    #[must_use]
    pub fn build(self) -> Arc<CommandQueue> {
        info!(
            "[CommandQueue] on CSR {} ({}{})",
            self.csr.os_context().context_id(),
            if self.properties.out_of_order { "out-of-order" } else { "in-order" },
            if self.properties.profiling { ", profiling" } else { "" }
        );
        Arc::new_cyclic(|self_ref| CommandQueue {
            csr: self.csr,
            svm: self.svm,
            settings: self.settings,
            encoder: self.encoder,
            properties: self.properties,
            state: Mutex::new(QueueState::default()),
            printf_output: Mutex::new(Vec::new()),
            self_ref: self_ref.clone(),
        })
    }
}

/// Front end submitting work to one engine.
///
/// Shared between threads behind an `Arc`; blocked commands keep a weak
/// reference back to it and submit through it once released.
#[derive(Debug)]
pub struct CommandQueue {
    csr: Arc<CommandStreamReceiver>,
    svm: Arc<SvmAllocsManager>,
    settings: Arc<DebugSettings>,
    encoder: Arc<dyn DispatchEncoder>,
    properties: QueueProperties,
    state: Mutex<QueueState>,
    printf_output: Mutex<Vec<String>>,
    self_ref: Weak<CommandQueue>,
}

impl CommandQueue {
    #[must_use]
    pub fn builder(
        csr: Arc<CommandStreamReceiver>,
        svm: Arc<SvmAllocsManager>,
        settings: Arc<DebugSettings>,
    ) -> QueueBuilder {
        QueueBuilder {
            csr,
            svm,
            settings,
            encoder: Arc::new(OpaqueEncoder),
            properties: QueueProperties::default(),
        }
    }

    fn lock(&self) -> MutexGuard<'_, QueueState> {
        self.state.lock().unwrap_or_else(PoisonError::into_inner)
    }

    #[must_use]
    pub const fn csr(&self) -> &Arc<CommandStreamReceiver> {
        &self.csr
    }

    #[must_use]
    pub const fn svm(&self) -> &Arc<SvmAllocsManager> {
        &self.svm
    }

    #[must_use]
    pub const fn properties(&self) -> QueueProperties {
        self.properties
    }

    #[must_use]
    pub const fn is_ooq_enabled(&self) -> bool {
        self.properties.out_of_order
    }

    #[must_use]
    pub fn task_level(&self) -> u32 {
        self.lock().task_level
    }

    #[must_use]
    pub fn task_count(&self) -> u32 {
        self.lock().task_count
    }

    /// True while an earlier blocked enqueue has not been submitted.
    #[must_use]
    pub fn is_queue_blocked(&self) -> bool {
        Self::is_queue_blocked_locked(&mut self.lock())
    }

    fn is_queue_blocked_locked(state: &mut QueueState) -> bool {
        let Some(virtual_event) = &state.virtual_event else {
            return false;
        };
        if virtual_event.is_blocking_dependents() {
            return true;
        }
        let level = virtual_event.peek_task_level();
        if level != crate::csr::submission::CompletionStamp::NOT_READY {
            state.task_level = state.task_level.max(level);
        }
        debug!("[CommandQueue] blocked work submitted, queue unblocked");
        state.virtual_event = None;
        false
    }

    /// Lines printed by kernels of this queue since the last call.
    pub fn take_printf_output(&self) -> Vec<String> {
        std::mem::take(&mut *self.printf_output.lock().unwrap_or_else(PoisonError::into_inner))
    }
}

impl Drop for CommandQueue {
    fn drop(&mut self) {
        let state = self.state.get_mut().unwrap_or_else(PoisonError::into_inner);
        if let Some(allocation) = state.command_stream.replace_graphics_allocation(None) {
            self.csr.store_allocation(allocation, AllocationUsage::Reusable);
        }
    }
}
