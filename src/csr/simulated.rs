//! In-process GPU used as the default submission backend.
//!
//! Each engine executes its batches strictly in submission order. A batch
//! whose semaphore waits are not yet satisfied stalls the engine until
//! another engine makes progress, which is how cross-engine dependencies
//! resolve.

use crate::csr::submission::{
    BatchBuffer, GpuOperation, PostSyncValue, SubmissionBackend,
};
use crate::error::{NeoError, NeoResult};
use log::{error, trace, warn};
use std::collections::VecDeque;
use std::sync::atomic::{AtomicBool, AtomicU32, AtomicUsize, Ordering};
use std::sync::{Arc, Condvar, Mutex, PoisonError, Weak};
use std::thread::{self, JoinHandle};
use std::time::Duration;

const STALL_RETRY: Duration = Duration::from_micros(100);

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum EngineMode {
    /// Batches run inside `submit`.
    Immediate,
    /// Batches run only when the test drives the engine.
    Manual,
    /// A worker thread runs each batch after `latency`.
    Threaded { latency: Duration },
}

#[derive(Debug)]
pub struct SimulatedGpu {
    engines: Mutex<Vec<Weak<SimulatedEngine>>>,
    ticks: AtomicU32,
}

impl SimulatedGpu {
    #[must_use]
    pub fn new() -> Arc<Self> {
        Arc::new(Self {
            engines: Mutex::new(Vec::new()),
            // 1 marks "not written" in timestamp records
            ticks: AtomicU32::new(2),
        })
    }

    pub fn create_engine(self: &Arc<Self>, mode: EngineMode) -> NeoResult<Arc<SimulatedEngine>> {
        let mut engines = self.engines.lock().unwrap_or_else(PoisonError::into_inner);
        let engine = Arc::new(SimulatedEngine {
            id: engines.len(),
            mode,
            gpu: Arc::downgrade(self),
            queue: Mutex::new(VecDeque::new()),
            exec_lock: Mutex::new(()),
            work_ready: Condvar::new(),
            submitted: AtomicUsize::new(0),
            completed: AtomicUsize::new(0),
            stop: AtomicBool::new(false),
            worker: Mutex::new(None),
        });
        if let EngineMode::Threaded { latency } = mode {
            let weak = Arc::downgrade(&engine);
            let handle = thread::Builder::new()
                .name(format!("neo-sim-engine-{}", engine.id))
                .spawn(move || SimulatedEngine::worker_loop(&weak, latency))?;
            *engine.worker.lock().unwrap_or_else(PoisonError::into_inner) = Some(handle);
        }
        engines.push(Arc::downgrade(&engine));
        Ok(engine)
    }

    /// Monotonic timestamp source shared by all engines.
    fn timestamp(&self) -> u32 {
        self.ticks.fetch_add(1, Ordering::AcqRel)
    }

    /// Runs every immediate-mode engine until none can make progress.
    pub fn pump(&self) -> usize {
        let engines: Vec<Arc<SimulatedEngine>> = self
            .engines
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .iter()
            .filter_map(Weak::upgrade)
            .collect();

        let mut total = 0;
        loop {
            let mut progressed = 0;
            for engine in engines.iter().filter(|e| e.mode == EngineMode::Immediate) {
                while engine.execute_head() {
                    progressed += 1;
                }
            }
            if progressed == 0 {
                return total;
            }
            total += progressed;
        }
    }
}

#[derive(Debug)]
pub struct SimulatedEngine {
    id: usize,
    mode: EngineMode,
    gpu: Weak<SimulatedGpu>,
    queue: Mutex<VecDeque<BatchBuffer>>,
    exec_lock: Mutex<()>,
    work_ready: Condvar,
    submitted: AtomicUsize,
    completed: AtomicUsize,
    stop: AtomicBool,
    worker: Mutex<Option<JoinHandle<()>>>,
}

impl SimulatedEngine {
    #[must_use]
    pub const fn mode(&self) -> EngineMode {
        self.mode
    }

    #[must_use]
    pub fn completed_batches(&self) -> usize {
        self.completed.load(Ordering::Acquire)
    }

    #[must_use]
    pub fn pending_batches(&self) -> usize {
        self.queue.lock().unwrap_or_else(PoisonError::into_inner).len()
    }

    /// Runs the oldest batch if its dependencies are met. Manual mode entry point.
    pub fn step(&self) -> bool {
        let ran = self.execute_head();
        if ran && let Some(gpu) = self.gpu.upgrade() {
            gpu.pump();
        }
        ran
    }

    /// Runs batches until the queue is empty or stalled. Returns how many ran.
    pub fn run_until_idle(&self) -> usize {
        let mut ran = 0;
        while self.step() {
            ran += 1;
        }
        ran
    }

    /// Runs batches whose task count is at most `task_count`.
    pub fn complete_up_to(&self, task_count: u32) -> usize {
        let mut ran = 0;
        loop {
            let head = self
                .queue
                .lock()
                .unwrap_or_else(PoisonError::into_inner)
                .front()
                .map(|b| b.task_count);
            match head {
                Some(tc) if tc <= task_count && self.step() => ran += 1,
                _ => return ran,
            }
        }
    }

    fn execute_head(&self) -> bool {
        let _exec = self.exec_lock.lock().unwrap_or_else(PoisonError::into_inner);

        let batch = {
            let mut queue = self.queue.lock().unwrap_or_else(PoisonError::into_inner);
            let Some(head) = queue.front() else {
                return false;
            };
            if !Self::dependencies_met(head) {
                trace!("[SimEngine {}] stalled on semaphore", self.id);
                return false;
            }
            match queue.pop_front() {
                Some(batch) => batch,
                None => return false,
            }
        };

        let gpu = self.gpu.upgrade();
        for op in &batch.operations {
            if let Err(e) = Self::apply(op, gpu.as_deref()) {
                error!("[SimEngine {}] {op:?} failed: {e}", self.id);
            }
        }

        batch.completion.store_from_engine(batch.task_count);
        self.completed.fetch_add(1, Ordering::AcqRel);
        true
    }

    fn dependencies_met(batch: &BatchBuffer) -> bool {
        batch.operations.iter().all(|op| match op {
            GpuOperation::SemaphoreWait {
                src,
                offset,
                condition,
            } => src
                .atomic_u32(*offset)
                .map(|cell| condition.is_satisfied(cell.load(Ordering::Acquire)))
                .unwrap_or(true),
            _ => true,
        })
    }

    fn apply(op: &GpuOperation, gpu: Option<&SimulatedGpu>) -> NeoResult<()> {
        match op {
            GpuOperation::Copy {
                src,
                src_offset,
                dst,
                dst_offset,
                size,
            } => dst.copy_from(*dst_offset, src, *src_offset, *size),
            GpuOperation::Fill {
                dst,
                offset,
                size,
                pattern,
            } => dst.fill(*offset, *size, pattern),
            GpuOperation::Write { dst, offset, value } => {
                let value = match value {
                    PostSyncValue::Immediate(v) => *v,
                    PostSyncValue::Timestamp => gpu.map_or(2, SimulatedGpu::timestamp),
                };
                dst.atomic_u32(*offset)?.store(value, Ordering::Release);
                Ok(())
            }
            GpuOperation::AtomicDecrement { dst, offset } => {
                let _ = dst.atomic_u32(*offset)?.fetch_update(
                    Ordering::AcqRel,
                    Ordering::Acquire,
                    |v| Some(v.saturating_sub(1)),
                );
                Ok(())
            }
            GpuOperation::SemaphoreWait { .. } => Ok(()),
        }
    }

    fn worker_loop(engine: &Weak<Self>, latency: Duration) {
        loop {
            let Some(this) = engine.upgrade() else {
                return;
            };
            if this.stop.load(Ordering::Acquire) {
                return;
            }
            let has_work = {
                let queue = this.queue.lock().unwrap_or_else(PoisonError::into_inner);
                let (queue, _) = this
                    .work_ready
                    .wait_timeout_while(queue, Duration::from_millis(1), |q| q.is_empty())
                    .unwrap_or_else(PoisonError::into_inner);
                !queue.is_empty()
            };
            if !has_work {
                continue;
            }
            thread::sleep(latency);
            if !this.step() {
                thread::sleep(STALL_RETRY);
            }
        }
    }
}

impl SubmissionBackend for SimulatedEngine {
    fn submit(&self, batch: BatchBuffer) -> NeoResult<()> {
        if self.stop.load(Ordering::Acquire) {
            return Err(NeoError::Backend(format!("engine {} is shut down", self.id)));
        }
        trace!(
            "[SimEngine {}] accepted task count {} ({} ops)",
            self.id,
            batch.task_count,
            batch.operations.len()
        );
        self.queue
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .push_back(batch);
        self.submitted.fetch_add(1, Ordering::AcqRel);

        match self.mode {
            EngineMode::Immediate => {
                if let Some(gpu) = self.gpu.upgrade() {
                    gpu.pump();
                }
            }
            EngineMode::Threaded { .. } => self.work_ready.notify_all(),
            EngineMode::Manual => {}
        }
        Ok(())
    }

    fn submitted_batches(&self) -> usize {
        self.submitted.load(Ordering::Acquire)
    }
}

impl Drop for SimulatedEngine {
    fn drop(&mut self) {
        self.stop.store(true, Ordering::Release);
        self.work_ready.notify_all();
        let pending = self.queue.get_mut().map(|q| q.len()).unwrap_or(0);
        if pending > 0 {
            warn!("[SimEngine {}] dropped with {pending} unexecuted batch(es)", self.id);
        }
        let handle = self
            .worker
            .get_mut()
            .unwrap_or_else(PoisonError::into_inner)
            .take();
        if let Some(handle) = handle
            && handle.thread().id() != thread::current().id()
        {
            let _ = handle.join();
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::csr::completion::CompletionTag;
    use crate::csr::submission::{DispatchFlags, SemaphoreCondition, StreamRegion};
    use crate::memory::manager::{MemoryConfig, MemoryManager};
    use crate::memory::{AllocationRef, AllocationType};

    struct Fixture {
        mm: Arc<MemoryManager>,
        gpu: Arc<SimulatedGpu>,
    }

    impl Fixture {
        fn new() -> Self {
            Self {
                mm: MemoryManager::new(MemoryConfig::default()),
                gpu: SimulatedGpu::new(),
            }
        }

        fn tag(&self) -> Arc<CompletionTag> {
            let alloc = self.mm.allocate(4096, AllocationType::TagBuffer).unwrap();
            Arc::new(CompletionTag::new(alloc, Duration::ZERO).unwrap())
        }

        fn buffer(&self) -> AllocationRef {
            self.mm.allocate(4096, AllocationType::Buffer).unwrap()
        }

        fn batch(&self, tag: &Arc<CompletionTag>, task_count: u32, ops: Vec<GpuOperation>) -> BatchBuffer {
            BatchBuffer {
                command_buffer: StreamRegion {
                    allocation: tag.allocation().clone(),
                    start: 0,
                    end: 0,
                },
                chained: None,
                residency: Vec::new(),
                operations: ops,
                task_count,
                completion: tag.clone(),
                flags: DispatchFlags::default(),
            }
        }
    }

    #[test]
    fn immediate_engine_completes_inside_submit() {
        let fx = Fixture::new();
        let engine = fx.gpu.create_engine(EngineMode::Immediate).unwrap();
        let tag = fx.tag();
        let dst = fx.buffer();
        let op = GpuOperation::Fill {
            dst: dst.clone(),
            offset: 0,
            size: 8,
            pattern: vec![0x5A],
        };
        engine.submit(fx.batch(&tag, 1, vec![op])).unwrap();
        assert_eq!(tag.value(), 1);
        let mut out = [0u8; 8];
        dst.read(0, &mut out).unwrap();
        assert_eq!(out, [0x5A; 8]);
    }

    #[test]
    fn manual_engine_runs_only_when_driven() {
        let fx = Fixture::new();
        let engine = fx.gpu.create_engine(EngineMode::Manual).unwrap();
        let tag = fx.tag();
        for tc in 1..=3 {
            engine.submit(fx.batch(&tag, tc, Vec::new())).unwrap();
        }
        assert_eq!(tag.value(), 0);
        assert_eq!(engine.complete_up_to(2), 2);
        assert_eq!(tag.value(), 2);
        assert_eq!(engine.pending_batches(), 1);
        assert_eq!(engine.run_until_idle(), 1);
        assert_eq!(engine.submitted_batches(), 3);
    }

    #[test]
    fn semaphore_holds_engine_until_other_engine_signals() {
        let fx = Fixture::new();
        let producer = fx.gpu.create_engine(EngineMode::Manual).unwrap();
        let consumer = fx.gpu.create_engine(EngineMode::Immediate).unwrap();
        let (producer_tag, consumer_tag) = (fx.tag(), fx.tag());

        producer.submit(fx.batch(&producer_tag, 1, Vec::new())).unwrap();
        let wait = GpuOperation::SemaphoreWait {
            src: producer_tag.allocation().clone(),
            offset: 0,
            condition: SemaphoreCondition::GreaterOrEqual(1),
        };
        consumer.submit(fx.batch(&consumer_tag, 1, vec![wait])).unwrap();
        assert_eq!(consumer_tag.value(), 0);

        producer.step();
        assert_eq!(consumer_tag.value(), 1);
    }

    #[test]
    fn threaded_engine_completes_in_background() {
        let fx = Fixture::new();
        let engine = fx
            .gpu
            .create_engine(EngineMode::Threaded {
                latency: Duration::from_micros(50),
            })
            .unwrap();
        let tag = fx.tag();
        engine.submit(fx.batch(&tag, 1, Vec::new())).unwrap();
        assert!(tag.wait(1, Some(Duration::from_secs(5))));
    }

    #[test]
    fn timestamps_are_monotonic_and_never_one() {
        let fx = Fixture::new();
        let engine = fx.gpu.create_engine(EngineMode::Immediate).unwrap();
        let tag = fx.tag();
        let dst = fx.buffer();
        let ops = vec![
            GpuOperation::Write {
                dst: dst.clone(),
                offset: 0,
                value: PostSyncValue::Timestamp,
            },
            GpuOperation::Write {
                dst: dst.clone(),
                offset: 4,
                value: PostSyncValue::Timestamp,
            },
        ];
        engine.submit(fx.batch(&tag, 1, ops)).unwrap();
        let start = dst.atomic_u32(0).unwrap().load(Ordering::Acquire);
        let end = dst.atomic_u32(4).unwrap().load(Ordering::Acquire);
        assert!(start > 1 && end > start);
    }
}
