//! Contract between a command stream receiver and whatever executes its batches.

use crate::csr::completion::CompletionTag;
use crate::error::NeoResult;
use crate::memory::AllocationRef;
use std::fmt;
use std::sync::Arc;

/// Result of a flush: the task count that signals completion plus ordering info.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct CompletionStamp {
    pub task_count: u32,
    pub task_level: u32,
    pub flush_stamp: u64,
}

impl CompletionStamp {
    /// Task count/level of work that has not been submitted yet.
    pub const NOT_READY: u32 = u32::MAX - 0xF;

    #[must_use]
    pub const fn not_ready(task_level: u32) -> Self {
        Self {
            task_count: Self::NOT_READY,
            task_level,
            flush_stamp: 0,
        }
    }
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
#[allow(clippy::struct_excessive_bools)]
pub struct DispatchFlags {
    /// Host waits for completion right after this flush.
    pub blocking: bool,
    /// Stall the pipeline before this work (barriers).
    pub stalling_barrier: bool,
    pub low_priority: bool,
    /// Work of this flush reads results of earlier flushes on another engine.
    pub has_cross_engine_dependencies: bool,
}

/// Value a post-sync operation stores.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PostSyncValue {
    Immediate(u32),
    /// The engine's free-running timestamp at the time of the write.
    Timestamp,
}

/// Condition a semaphore wait polls for.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SemaphoreCondition {
    NotEqual(u32),
    GreaterOrEqual(u32),
}

impl SemaphoreCondition {
    #[must_use]
    pub const fn is_satisfied(self, value: u32) -> bool {
        match self {
            Self::NotEqual(v) => value != v,
            Self::GreaterOrEqual(v) => value >= v,
        }
    }
}

/// Observable effect of a command sequence.
///
/// Real command buffers are opaque to this crate; backends that cannot parse
/// them (the simulated GPU) execute these operations instead.
#[derive(Clone)]
pub enum GpuOperation {
    Copy {
        src: AllocationRef,
        src_offset: usize,
        dst: AllocationRef,
        dst_offset: usize,
        size: usize,
    },
    Fill {
        dst: AllocationRef,
        offset: usize,
        size: usize,
        pattern: Vec<u8>,
    },
    /// 32-bit post-sync write.
    Write {
        dst: AllocationRef,
        offset: usize,
        value: PostSyncValue,
    },
    SemaphoreWait {
        src: AllocationRef,
        offset: usize,
        condition: SemaphoreCondition,
    },
    /// Saturating 32-bit decrement, used to retire implicit dependency counters.
    AtomicDecrement { dst: AllocationRef, offset: usize },
}

impl fmt::Debug for GpuOperation {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Copy { src, dst, size, .. } => write!(
                f,
                "Copy({size} bytes, {} -> {})",
                src.id(),
                dst.id()
            ),
            Self::Fill { dst, size, .. } => write!(f, "Fill({size} bytes in {})", dst.id()),
            Self::Write { dst, offset, value } => {
                write!(f, "Write({value:?} at {}+{offset})", dst.id())
            }
            Self::SemaphoreWait {
                src,
                offset,
                condition,
            } => write!(f, "SemaphoreWait({condition:?} on {}+{offset})", src.id()),
            Self::AtomicDecrement { dst, offset } => {
                write!(f, "AtomicDecrement({}+{offset})", dst.id())
            }
        }
    }
}

/// A contiguous region of a command stream.
#[derive(Debug, Clone)]
pub struct StreamRegion {
    pub allocation: AllocationRef,
    pub start: usize,
    pub end: usize,
}

/// Everything an engine needs to run one flush and signal its completion.
#[derive(Debug, Clone)]
pub struct BatchBuffer {
    /// Receiver's own commands (state, chain, epilogue).
    pub command_buffer: StreamRegion,
    /// Caller's commands chained from the receiver's stream.
    pub chained: Option<StreamRegion>,
    pub residency: Vec<AllocationRef>,
    pub operations: Vec<GpuOperation>,
    pub task_count: u32,
    pub completion: Arc<CompletionTag>,
    pub flags: DispatchFlags,
}

/// Stand-in for the OS submission path (ioctl/escape).
pub trait SubmissionBackend: Send + Sync + fmt::Debug {
    /// Queues a batch for execution. Returns once the batch is accepted, not executed.
    fn submit(&self, batch: BatchBuffer) -> NeoResult<()>;

    /// Number of batches accepted so far.
    fn submitted_batches(&self) -> usize;
}
