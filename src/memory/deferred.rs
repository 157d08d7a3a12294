//! Background reclamation of allocations an engine may still be using.
//!
//! Entries are handed over explicitly by the memory manager together with
//! the completion targets to await; nothing here is tied to the lifetime of
//! the objects that used the memory.

use crate::csr::completion::CompletionTag;
use crate::memory::{AllocationRef, MemoryManager};
use log::{debug, warn};
use std::collections::VecDeque;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::{Arc, Condvar, Mutex, PoisonError, Weak};
use std::thread::{self, JoinHandle};
use std::time::{Duration, Instant};

/// An allocation plus the `(tag, task count)` pairs that must complete before it is freed.
#[derive(Debug)]
pub struct DeferredEntry {
    allocation: AllocationRef,
    waits: Vec<(Arc<CompletionTag>, u32)>,
}

impl DeferredEntry {
    #[must_use]
    pub fn new(allocation: AllocationRef, waits: Vec<(Arc<CompletionTag>, u32)>) -> Self {
        Self { allocation, waits }
    }

    fn is_ready(&self) -> bool {
        self.waits
            .iter()
            .all(|(tag, task_count)| tag.is_completed(*task_count))
    }
}

#[derive(Debug, Default)]
struct Shared {
    queue: Mutex<VecDeque<DeferredEntry>>,
    wake: Condvar,
    stop: AtomicBool,
    freed: AtomicUsize,
}

#[derive(Debug)]
struct Worker {
    handle: JoinHandle<()>,
}

#[derive(Debug, Default)]
pub struct DeferredDeleter {
    shared: Arc<Shared>,
    worker: Mutex<Option<Worker>>,
}

impl DeferredDeleter {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    pub fn defer(&self, entry: DeferredEntry) {
        self.shared
            .queue
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .push_back(entry);
        self.shared.wake.notify_all();
    }

    #[must_use]
    pub fn pending(&self) -> usize {
        self.shared
            .queue
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .len()
    }

    /// Total number of allocations this deleter has released.
    #[must_use]
    pub fn freed(&self) -> usize {
        self.shared.freed.load(Ordering::Acquire)
    }

    /// Frees every entry whose engines have finished. Returns how many were freed.
    pub fn process<F>(&self, mut free: F) -> usize
    where
        F: FnMut(AllocationRef),
    {
        let ready: Vec<DeferredEntry> = {
            let mut queue = self.shared.queue.lock().unwrap_or_else(PoisonError::into_inner);
            let (ready, waiting): (VecDeque<_>, VecDeque<_>) =
                queue.drain(..).partition(DeferredEntry::is_ready);
            *queue = waiting;
            ready.into()
        };

        let count = ready.len();
        for entry in ready {
            free(entry.allocation);
        }
        if count > 0 {
            self.shared.freed.fetch_add(count, Ordering::AcqRel);
            debug!("[DeferredDeleter] released {count} allocation(s)");
        }
        count
    }

    /// Processes until the queue is empty or `timeout` passes. Returns true if drained.
    pub fn drain<F>(&self, timeout: Duration, mut free: F) -> bool
    where
        F: FnMut(AllocationRef),
    {
        let start = Instant::now();
        loop {
            self.process(&mut free);
            if self.pending() == 0 {
                return true;
            }
            if start.elapsed() >= timeout {
                warn!(
                    "[DeferredDeleter] {} allocation(s) still busy after {timeout:?}",
                    self.pending()
                );
                return false;
            }
            thread::yield_now();
        }
    }

    pub(crate) fn start_worker(&self, manager: Weak<MemoryManager>, interval: Duration) {
        let mut worker = self.worker.lock().unwrap_or_else(PoisonError::into_inner);
        if worker.is_some() {
            return;
        }
        let shared = self.shared.clone();
        let handle = thread::Builder::new()
            .name("neo-deferred-deleter".into())
            .spawn(move || worker_loop(&shared, &manager, interval));
        match handle {
            Ok(handle) => *worker = Some(Worker { handle }),
            Err(e) => warn!("[DeferredDeleter] failed to spawn worker thread: {e}"),
        }
    }
}

fn worker_loop(shared: &Shared, manager: &Weak<MemoryManager>, interval: Duration) {
    while !shared.stop.load(Ordering::Acquire) {
        if let Some(manager) = manager.upgrade() {
            manager.process_deferred();
        } else {
            return;
        }
        let queue = shared.queue.lock().unwrap_or_else(PoisonError::into_inner);
        let _ = shared
            .wake
            .wait_timeout(queue, interval)
            .unwrap_or_else(PoisonError::into_inner);
    }
}

impl Drop for DeferredDeleter {
    fn drop(&mut self) {
        self.shared.stop.store(true, Ordering::Release);
        self.shared.wake.notify_all();
        let worker = self
            .worker
            .get_mut()
            .unwrap_or_else(PoisonError::into_inner)
            .take();
        if let Some(worker) = worker {
            // The last manager handle can be released on the worker itself.
            if worker.handle.thread().id() != thread::current().id() {
                let _ = worker.handle.join();
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::memory::manager::MemoryConfig;
    use crate::memory::AllocationType;
    use std::time::Duration;

    fn tag(mm: &MemoryManager) -> Arc<CompletionTag> {
        let alloc = mm.allocate(4096, AllocationType::TagBuffer).unwrap();
        Arc::new(CompletionTag::new(alloc, Duration::ZERO).unwrap())
    }

    #[test]
    fn entry_waits_for_every_engine() {
        let mm = MemoryManager::new(MemoryConfig::default());
        let (a, b) = (tag(&mm), tag(&mm));
        let alloc = mm.allocate(4096, AllocationType::Buffer).unwrap();
        let deleter = DeferredDeleter::new();
        deleter.defer(DeferredEntry::new(alloc, vec![(a.clone(), 2), (b.clone(), 1)]));

        let mut released = Vec::new();
        assert_eq!(deleter.process(|x| released.push(x)), 0);
        a.initialize(2);
        assert_eq!(deleter.process(|x| released.push(x)), 0);
        b.initialize(1);
        assert_eq!(deleter.process(|x| released.push(x)), 1);
        assert_eq!(released.len(), 1);
        assert_eq!(deleter.freed(), 1);
        assert_eq!(deleter.pending(), 0);
    }

    #[test]
    fn drain_times_out_on_stuck_engine() {
        let mm = MemoryManager::new(MemoryConfig::default());
        let t = tag(&mm);
        let alloc = mm.allocate(4096, AllocationType::Buffer).unwrap();
        let deleter = DeferredDeleter::new();
        deleter.defer(DeferredEntry::new(alloc, vec![(t, 7)]));
        assert!(!deleter.drain(Duration::from_millis(5), drop));
        assert_eq!(deleter.pending(), 1);
    }
}
