use crate::csr::submission::CompletionStamp;
use crate::error::{NeoError, NeoResult};
use crate::queue::CommandQueue;
use crate::queue::enqueue::DispatchPlan;
use log::warn;
use std::sync::Weak;

/// Enqueue captured while its dependencies were outstanding.
///
/// Holds everything the submission needs so it can run later from whichever
/// thread releases the last dependency.
#[derive(Debug)]
pub(crate) struct Command {
    queue: Weak<CommandQueue>,
    plan: DispatchPlan,
}

impl Command {
    pub(crate) const fn new(queue: Weak<CommandQueue>, plan: DispatchPlan) -> Self {
        Self { queue, plan }
    }

    pub(crate) fn submit(self, task_level: u32) -> NeoResult<CompletionStamp> {
        let Some(queue) = self.queue.upgrade() else {
            warn!("[Command] queue released before blocked {:?} ran", self.plan.command_type());
            self.plan.abandon();
            return Err(NeoError::InvalidQueue("queue released with blocked work".into()));
        };
        queue.submit_plan(self.plan, task_level)
    }

    /// Drops the command without running it.
    pub(crate) fn abandon(self) {
        self.plan.abandon();
    }
}
