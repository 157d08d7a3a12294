//! Per-engine parking lots for allocations the engine may still be reading.

use crate::csr::completion::CompletionTag;
use crate::memory::{AllocationRef, AllocationType, MemoryManager};
use log::trace;
use std::collections::VecDeque;
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AllocationUsage {
    /// Scratch memory of one submission, freed once it completes.
    Temporary,
    /// Memory kept for reuse by later requests of the same type.
    Reusable,
}

/// Allocations waiting on the engine, oldest first.
#[derive(Debug, Default)]
pub struct AllocationsList {
    entries: VecDeque<AllocationRef>,
}

impl AllocationsList {
    pub fn push(&mut self, allocation: AllocationRef) {
        self.entries.push_back(allocation);
    }

    #[must_use]
    pub fn len(&self) -> usize {
        self.entries.len()
    }

    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    pub fn iter(&self) -> impl Iterator<Item = &AllocationRef> {
        self.entries.iter()
    }

    /// Removes and returns every entry matching `pred`, keeping the order of the rest.
    fn detach_where<F>(&mut self, mut pred: F) -> Vec<AllocationRef>
    where
        F: FnMut(&AllocationRef) -> bool,
    {
        let mut detached = Vec::new();
        self.entries.retain(|alloc| {
            if pred(alloc) {
                detached.push(alloc.clone());
                false
            } else {
                true
            }
        });
        detached
    }

    fn detach_first<F>(&mut self, pred: F) -> Option<AllocationRef>
    where
        F: FnMut(&AllocationRef) -> bool,
    {
        let index = self.entries.iter().position(pred)?;
        self.entries.remove(index)
    }
}

#[derive(Debug, Default)]
struct Lists {
    temporary: AllocationsList,
    reusable: AllocationsList,
}

impl Lists {
    fn get_mut(&mut self, usage: AllocationUsage) -> &mut AllocationsList {
        match usage {
            AllocationUsage::Temporary => &mut self.temporary,
            AllocationUsage::Reusable => &mut self.reusable,
        }
    }
}

#[derive(Debug)]
pub struct InternalAllocationStorage {
    memory_manager: Arc<MemoryManager>,
    context_id: u32,
    completion: Arc<CompletionTag>,
    lists: Mutex<Lists>,
}

impl InternalAllocationStorage {
    #[must_use]
    pub fn new(memory_manager: Arc<MemoryManager>, context_id: u32, completion: Arc<CompletionTag>) -> Self {
        Self {
            memory_manager,
            context_id,
            completion,
            lists: Mutex::new(Lists::default()),
        }
    }

    fn lock(&self) -> MutexGuard<'_, Lists> {
        self.lists.lock().unwrap_or_else(PoisonError::into_inner)
    }

    #[must_use]
    pub const fn context_id(&self) -> u32 {
        self.context_id
    }

    /// Parks `allocation` until this engine reaches `task_count`.
    pub fn store_allocation_with_task_count(
        &self,
        allocation: AllocationRef,
        usage: AllocationUsage,
        task_count: u32,
    ) {
        allocation.update_task_count(task_count, self.context_id);
        trace!(
            "[AllocationStorage] ctx {} parks allocation {} as {usage:?} until {task_count}",
            self.context_id,
            allocation.id()
        );
        self.lock().get_mut(usage).push(allocation);
    }

    /// Frees every entry whose last use on this engine is at or before `wait_task_count`.
    ///
    /// Entries still used by another engine go to the deferred deleter.
    pub fn clean_allocation_list(&self, wait_task_count: u32, usage: AllocationUsage) -> usize {
        let context_id = self.context_id;
        let detached = self
            .lock()
            .get_mut(usage)
            .detach_where(|alloc| alloc.task_count(context_id) <= wait_task_count);

        let count = detached.len();
        for alloc in detached {
            self.memory_manager.check_gpu_usage_and_destroy(alloc);
        }
        count
    }

    /// Takes the first reusable allocation of `allocation_type` that is at least
    /// `min_size` bytes and that this engine has finished with.
    pub fn obtain_reusable_allocation(
        &self,
        min_size: usize,
        allocation_type: AllocationType,
    ) -> Option<AllocationRef> {
        let context_id = self.context_id;
        let completed = self.completion.value();
        self.lock().reusable.detach_first(|alloc| {
            alloc.allocation_type() == allocation_type
                && alloc.underlying_buffer_size() >= min_size
                && alloc.task_count(context_id) <= completed
        })
    }

    #[must_use]
    pub fn len(&self, usage: AllocationUsage) -> usize {
        match usage {
            AllocationUsage::Temporary => self.lock().temporary.len(),
            AllocationUsage::Reusable => self.lock().reusable.len(),
        }
    }

    #[must_use]
    pub fn contains(&self, allocation: &AllocationRef, usage: AllocationUsage) -> bool {
        let mut lists = self.lock();
        lists.get_mut(usage).iter().any(|a| Arc::ptr_eq(a, allocation))
    }

    /// Hands every parked allocation back to the memory manager.
    pub fn cleanup_all(&self) {
        let (temporary, reusable) = {
            let mut lists = self.lock();
            (
                lists.temporary.detach_where(|_| true),
                lists.reusable.detach_where(|_| true),
            )
        };
        for alloc in temporary.into_iter().chain(reusable) {
            self.memory_manager.check_gpu_usage_and_destroy(alloc);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::memory::manager::{EngineType, MemoryConfig};
    use std::time::Duration;

    fn storage() -> (Arc<MemoryManager>, Arc<CompletionTag>, InternalAllocationStorage) {
        let mm = MemoryManager::new(MemoryConfig::default());
        let tag_alloc = mm.allocate(4096, AllocationType::TagBuffer).unwrap();
        let tag = Arc::new(CompletionTag::new(tag_alloc, Duration::ZERO).unwrap());
        let ctx = mm.register_os_context(EngineType::Compute, 0, tag.clone()).unwrap();
        let storage = InternalAllocationStorage::new(mm.clone(), ctx.context_id(), tag.clone());
        (mm, tag, storage)
    }

    #[test]
    fn reusable_allocation_waits_for_engine() {
        let (mm, tag, storage) = storage();
        let cb = mm.allocate(64 * 1024, AllocationType::CommandBuffer).unwrap();
        storage.store_allocation_with_task_count(cb.clone(), AllocationUsage::Reusable, 3);

        assert!(storage.obtain_reusable_allocation(4096, AllocationType::CommandBuffer).is_none());
        tag.initialize(3);
        assert!(storage.obtain_reusable_allocation(4096, AllocationType::LinearStream).is_none());
        assert!(storage.obtain_reusable_allocation(128 * 1024, AllocationType::CommandBuffer).is_none());
        let reused = storage
            .obtain_reusable_allocation(4096, AllocationType::CommandBuffer)
            .unwrap();
        assert!(Arc::ptr_eq(&reused, &cb));
        assert_eq!(storage.len(AllocationUsage::Reusable), 0);
    }

    #[test]
    fn clean_frees_only_completed_entries() {
        let (mm, tag, storage) = storage();
        let done = mm.allocate(4096, AllocationType::Buffer).unwrap();
        let busy = mm.allocate(4096, AllocationType::Buffer).unwrap();
        storage.store_allocation_with_task_count(done, AllocationUsage::Temporary, 1);
        storage.store_allocation_with_task_count(busy.clone(), AllocationUsage::Temporary, 2);
        tag.initialize(1);

        assert_eq!(storage.clean_allocation_list(1, AllocationUsage::Temporary), 1);
        assert!(storage.contains(&busy, AllocationUsage::Temporary));
        // tag + busy
        assert_eq!(mm.live_allocation_count(), 2);
    }

    #[test]
    fn cleanup_defers_entries_the_engine_still_uses() {
        let (mm, tag, storage) = storage();
        let busy = mm.allocate(4096, AllocationType::Buffer).unwrap();
        storage.store_allocation_with_task_count(busy, AllocationUsage::Reusable, 5);
        storage.cleanup_all();
        assert_eq!(mm.deferred_deleter().pending(), 1);
        tag.initialize(5);
        assert_eq!(mm.process_deferred(), 1);
    }
}
