//! Host-side view of an engine's progress counter.
//!
//! The engine writes the last completed task count into the first dword of
//! the tag allocation. Waiters spin briefly, then park on a condition
//! variable that the engine (or a poller thread) signals after each write.

use crate::error::NeoResult;
use crate::memory::AllocationRef;
use std::sync::atomic::{AtomicBool, AtomicU32, Ordering};
use std::sync::{Arc, Condvar, Mutex, PoisonError};
use std::thread::{self, JoinHandle};
use std::time::{Duration, Instant};

/// Upper bound for a single park, so a missed notification only costs latency.
const MAX_PARK: Duration = Duration::from_millis(1);

struct WaitGuard<'a>(&'a CompletionTag);
impl Drop for WaitGuard<'_> {
    fn drop(&mut self) {
        self.0.waiting.fetch_sub(1, Ordering::Relaxed);
    }
}

#[derive(Debug)]
pub struct CompletionTag {
    allocation: AllocationRef,
    lock: Mutex<()>,
    wake: Condvar,
    /// Threads currently parked or about to park.
    waiting: AtomicU32,
    spin: Duration,
}

impl CompletionTag {
    /// Wraps a tag allocation; the counter starts at zero.
    ///
    /// # Errors
    /// `InvalidAllocation` if the allocation cannot hold a dword.
    pub fn new(allocation: AllocationRef, spin: Duration) -> NeoResult<Self> {
        allocation.atomic_u32(0)?.store(0, Ordering::Release);
        Ok(Self {
            allocation,
            lock: Mutex::new(()),
            wake: Condvar::new(),
            waiting: AtomicU32::new(0),
            spin,
        })
    }

    #[must_use]
    pub const fn allocation(&self) -> &AllocationRef {
        &self.allocation
    }

    #[must_use]
    pub fn gpu_address(&self) -> u64 {
        self.allocation.gpu_address()
    }

    #[allow(clippy::inline_always)]
    #[inline(always)]
    fn cell(&self) -> &AtomicU32 {
        // `new` verified the first dword is in bounds and aligned.
        unsafe { &*self.allocation.cpu_ptr().cast::<AtomicU32>() }
    }

    /// Last task count the engine reported complete.
    #[inline]
    #[must_use]
    pub fn value(&self) -> u32 {
        self.cell().load(Ordering::Acquire)
    }

    #[inline]
    #[must_use]
    pub fn is_completed(&self, task_count: u32) -> bool {
        self.value() >= task_count
    }

    /// Sets the counter outside of engine execution (setup and tests).
    pub fn initialize(&self, value: u32) {
        self.cell().store(value, Ordering::Release);
        self.notify();
    }

    /// Engine-side write: the counter never moves backwards.
    pub(crate) fn store_from_engine(&self, task_count: u32) {
        self.cell().fetch_max(task_count, Ordering::AcqRel);
        self.notify();
    }

    #[must_use]
    pub fn has_waiters(&self) -> bool {
        self.waiting.load(Ordering::Relaxed) > 0
    }

    /// Wakes parked waiters so they re-read the counter.
    pub fn notify(&self) {
        std::sync::atomic::fence(Ordering::SeqCst);
        if self.has_waiters() {
            let _guard = self.lock.lock().unwrap_or_else(PoisonError::into_inner);
            self.wake.notify_all();
        }
    }

    /// Waits until the counter reaches `task_count`.
    ///
    /// Returns false if `timeout` elapses first; `None` waits indefinitely.
    pub fn wait(&self, task_count: u32, timeout: Option<Duration>) -> bool {
        if self.is_completed(task_count) {
            return true;
        }

        let start = Instant::now();
        let spin = timeout.map_or(self.spin, |t| t.min(self.spin));
        while start.elapsed() < spin {
            if self.is_completed(task_count) {
                return true;
            }
            std::hint::spin_loop();
            unsafe {
                libc::sched_yield();
            }
        }

        self.waiting.fetch_add(1, Ordering::Relaxed);
        std::sync::atomic::fence(Ordering::SeqCst);
        let _guard = WaitGuard(self);

        let mut guard = self.lock.lock().unwrap_or_else(PoisonError::into_inner);
        loop {
            if self.is_completed(task_count) {
                return true;
            }
            let park = match timeout {
                Some(t) => {
                    let elapsed = start.elapsed();
                    if elapsed >= t {
                        return false;
                    }
                    (t - elapsed).min(MAX_PARK)
                }
                None => MAX_PARK,
            };
            guard = self
                .wake
                .wait_timeout(guard, park)
                .unwrap_or_else(PoisonError::into_inner)
                .0;
        }
    }
}

/// Background thread that periodically wakes waiters of one tag, for
/// backends that update the counter without notifying.
#[derive(Debug)]
pub struct CompletionPoller {
    stop: Arc<AtomicBool>,
    handle: Option<JoinHandle<()>>,
}

impl CompletionPoller {
    pub fn spawn(tag: Arc<CompletionTag>, interval: Duration) -> NeoResult<Self> {
        let stop = Arc::new(AtomicBool::new(false));
        let thread_stop = stop.clone();
        let handle = thread::Builder::new()
            .name("neo-completion-poller".into())
            .spawn(move || {
                let mut last_seen = tag.value();
                while !thread_stop.load(Ordering::Acquire) {
                    thread::sleep(interval);
                    let current = tag.value();
                    if current != last_seen {
                        last_seen = current;
                        tag.notify();
                    }
                }
            })?;
        Ok(Self {
            stop,
            handle: Some(handle),
        })
    }
}

impl Drop for CompletionPoller {
    fn drop(&mut self) {
        self.stop.store(true, Ordering::Release);
        if let Some(handle) = self.handle.take() {
            let _ = handle.join();
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::memory::manager::{MemoryConfig, MemoryManager};
    use crate::memory::AllocationType;

    fn tag() -> Arc<CompletionTag> {
        let mm = MemoryManager::new(MemoryConfig::default());
        let alloc = mm.allocate(4096, AllocationType::TagBuffer).unwrap();
        Arc::new(CompletionTag::new(alloc, Duration::from_micros(20)).unwrap())
    }

    #[test]
    fn completed_target_returns_immediately() {
        let t = tag();
        t.initialize(5);
        assert!(t.wait(5, None));
        assert!(t.wait(3, Some(Duration::ZERO)));
    }

    #[test]
    fn times_out_when_engine_never_reaches_target() {
        let t = tag();
        let start = Instant::now();
        assert!(!t.wait(1, Some(Duration::from_millis(10))));
        assert!(start.elapsed() >= Duration::from_millis(10));
        assert!(!t.has_waiters());
    }

    #[test]
    fn engine_write_wakes_parked_waiter() {
        let t = tag();
        let writer = t.clone();
        let handle = thread::spawn(move || {
            thread::sleep(Duration::from_millis(5));
            writer.store_from_engine(3);
        });
        assert!(t.wait(3, Some(Duration::from_secs(5))));
        handle.join().unwrap();
    }

    #[test]
    fn engine_writes_never_regress() {
        let t = tag();
        t.store_from_engine(9);
        t.store_from_engine(4);
        assert_eq!(t.value(), 9);
    }

    #[test]
    fn poller_wakes_waiters_for_silent_writes() {
        let t = tag();
        let _poller = CompletionPoller::spawn(t.clone(), Duration::from_micros(200)).unwrap();
        let cell = t.clone();
        let handle = thread::spawn(move || {
            thread::sleep(Duration::from_millis(2));
            // Bypass notify, as hardware would.
            cell.cell().store(2, Ordering::Release);
        });
        assert!(t.wait(2, Some(Duration::from_secs(5))));
        handle.join().unwrap();
    }
}
