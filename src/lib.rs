//! Command submission, residency and synchronization core of a GPU compute
//! runtime.
//!
//! An [`ExecutionEnvironment`] owns the memory manager, the SVM directory and
//! one [`CommandStreamReceiver`] per engine. [`CommandQueue`]s enqueue work on
//! a receiver, tracking dependencies through task levels, [`Event`]s and
//! timestamp packets. Without hardware the engines run on an in-process
//! simulated GPU that executes the memory effects of each submission.

pub mod command_container;
pub mod config;
pub mod context;
pub mod csr;
pub mod error;
pub mod memory;
pub mod queue;
pub mod svm;
pub mod tags;
pub mod utils;

pub use config::{DebugSettings, DispatchMode};
pub use context::ExecutionEnvironment;
pub use csr::CommandStreamReceiver;
pub use csr::submission::{CompletionStamp, GpuOperation};
pub use error::{NeoError, NeoResult};
pub use memory::manager::{EngineType, MemoryConfig, MemoryManager};
pub use memory::{AllocationRef, AllocationType, GraphicsAllocation};
pub use queue::event::Event;
pub use queue::{CommandQueue, DispatchInfo, ExecutionStatus, Kernel, KernelArg, MultiDispatchInfo};
pub use svm::SvmAllocsManager;
