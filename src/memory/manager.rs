use crate::csr::completion::CompletionTag;
use crate::error::{NeoError, NeoResult};
use crate::memory::aperture::Aperture;
use crate::memory::deferred::{DeferredDeleter, DeferredEntry};
use crate::memory::{
    AllocationProperties, AllocationRef, AllocationType, ApertureAllocator, GraphicsAllocation,
    HostBacking, MAX_OS_CONTEXT_COUNT,
};
use crate::utils::memory_constants::{GB, PAGE_SIZE};
use log::{debug, warn};
use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, AtomicUsize, Ordering};
use std::sync::{Arc, Mutex, PoisonError, RwLock, Weak};
use std::time::Duration;

// Address layout of the simulated GPU VA space
const SVM_RESERVATION_LIMIT: u64 = (1 << 47) - 1;
const SVM_MIN_BASE: u64 = 0x1000_0000; // Start at 256MB
const INTERNAL_HEAP_SIZE: u64 = 4 * GB as u64;
const SVM_GUARD_PAGES: u64 = 1;

/// Engine flavours a command stream receiver can drive.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum EngineType {
    Compute,
    Copy,
    LowPriority,
}

/// Identity of one engine instance as seen by the memory manager.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct OsContext {
    context_id: u32,
    engine_type: EngineType,
    root_device_index: u32,
}

impl OsContext {
    #[must_use]
    pub const fn context_id(&self) -> u32 {
        self.context_id
    }

    #[must_use]
    pub const fn engine_type(&self) -> EngineType {
        self.engine_type
    }

    #[must_use]
    pub const fn root_device_index(&self) -> u32 {
        self.root_device_index
    }
}

#[derive(Debug, Clone, Copy)]
pub struct MemoryConfig {
    /// Bytes the device may hand out before allocations fail with `OutOfMemory`.
    pub capacity: usize,
    /// Whether the device has its own memory (selects dual-storage SVM).
    pub local_memory_supported: bool,
}

impl Default for MemoryConfig {
    fn default() -> Self {
        Self {
            capacity: GB,
            local_memory_supported: false,
        }
    }
}

#[derive(Debug)]
struct EngineControl {
    os_context: OsContext,
    tag: Arc<CompletionTag>,
}

#[derive(Debug)]
struct RegistryEntry {
    gpu_address: u64,
    size: usize,
    owns_gpu_va: bool,
    allocation: Weak<GraphicsAllocation>,
}

#[derive(Debug)]
struct ManagerState {
    internal_aperture: Aperture,
    svm_aperture: Aperture,
    allocations: HashMap<u64, RegistryEntry>,
}

/// Owner of every [`GraphicsAllocation`] on a device.
///
/// Hands out GPU virtual addresses from two apertures (internal heaps and
/// SVM), backs them with host pages, and frees them either immediately or,
/// when an engine may still use them, through the deferred deleter.
#[derive(Debug)]
pub struct MemoryManager {
    config: MemoryConfig,
    state: Mutex<ManagerState>,
    /// Indexed by context id. A torn-down engine leaves `None`; ids are not reused.
    engines: RwLock<Vec<Option<EngineControl>>>,
    next_id: AtomicU64,
    used_memory: AtomicUsize,
    deferred: DeferredDeleter,
    self_ref: Weak<MemoryManager>,
}

impl MemoryManager {
    #[must_use]
    pub fn new(config: MemoryConfig) -> Arc<Self> {
        let internal_base = SVM_MIN_BASE;
        let internal_limit = internal_base + INTERNAL_HEAP_SIZE;

        let internal_aperture = Aperture::new(internal_base, internal_limit, PAGE_SIZE as u64, 0);
        let svm_aperture = Aperture::new(
            internal_limit,
            SVM_RESERVATION_LIMIT,
            PAGE_SIZE as u64,
            SVM_GUARD_PAGES,
        );

        Arc::new_cyclic(|self_ref| Self {
            config,
            state: Mutex::new(ManagerState {
                internal_aperture,
                svm_aperture,
                allocations: HashMap::new(),
            }),
            engines: RwLock::new(Vec::new()),
            next_id: AtomicU64::new(1),
            used_memory: AtomicUsize::new(0),
            deferred: DeferredDeleter::new(),
            self_ref: self_ref.clone(),
        })
    }

    #[must_use]
    pub const fn is_local_memory_supported(&self) -> bool {
        self.config.local_memory_supported
    }

    #[must_use]
    pub fn used_memory(&self) -> usize {
        self.used_memory.load(Ordering::Acquire)
    }

    #[must_use]
    pub fn live_allocation_count(&self) -> usize {
        self.lock_state().allocations.len()
    }

    #[must_use]
    pub const fn deferred_deleter(&self) -> &DeferredDeleter {
        &self.deferred
    }

    fn lock_state(&self) -> std::sync::MutexGuard<'_, ManagerState> {
        self.state.lock().unwrap_or_else(PoisonError::into_inner)
    }

    // ===========================================================================================
    // Engine registry
    // ===========================================================================================

    /// Registers a new engine and assigns it the next context id.
    ///
    /// Ids are never handed out twice: allocations keep per-context usage
    /// indexed by id, and a new engine must not inherit stale task counts.
    pub fn register_os_context(
        &self,
        engine_type: EngineType,
        root_device_index: u32,
        tag: Arc<CompletionTag>,
    ) -> NeoResult<OsContext> {
        let mut engines = self.engines.write().unwrap_or_else(PoisonError::into_inner);
        if engines.len() >= MAX_OS_CONTEXT_COUNT {
            return Err(NeoError::Unrecoverable(format!(
                "more than {MAX_OS_CONTEXT_COUNT} OS contexts requested"
            )));
        }
        let os_context = OsContext {
            context_id: engines.len() as u32,
            engine_type,
            root_device_index,
        };
        engines.push(Some(EngineControl { os_context, tag }));
        debug!(
            "[MemoryManager] registered {engine_type:?} engine as context {}",
            os_context.context_id
        );
        Ok(os_context)
    }

    /// Drops the engine's completion tag. Allocations it used count as idle
    /// there from now on.
    pub fn unregister_os_context(&self, context_id: u32) {
        let mut engines = self.engines.write().unwrap_or_else(PoisonError::into_inner);
        if let Some(control) = engines.get_mut(context_id as usize).and_then(Option::take) {
            debug!(
                "[MemoryManager] unregistered {:?} engine context {context_id}",
                control.os_context.engine_type
            );
        }
    }

    fn completion_tag(&self, context_id: u32) -> Option<Arc<CompletionTag>> {
        let engines = self.engines.read().unwrap_or_else(PoisonError::into_inner);
        engines
            .get(context_id as usize)
            .and_then(Option::as_ref)
            .map(|e| e.tag.clone())
    }

    /// Contexts that used `alloc` and have not yet reached its task count there.
    fn pending_engine_work(&self, alloc: &GraphicsAllocation) -> Vec<(Arc<CompletionTag>, u32)> {
        alloc
            .used_contexts()
            .filter_map(|(context_id, task_count)| {
                let tag = self.completion_tag(context_id)?;
                (!tag.is_completed(task_count)).then_some((tag, task_count))
            })
            .collect()
    }

    // ===========================================================================================
    // Allocation
    // ===========================================================================================

    /// Allocates a GPU-visible region described by `properties`.
    ///
    /// # Errors
    /// `InvalidSize` for zero-sized requests, `OutOfMemory` when the device
    /// budget is exhausted (after reclaiming deferred frees once), and
    /// `OutOfVirtualAddressSpace` when no VA range fits.
    pub fn allocate_graphics_memory_with_properties(
        &self,
        properties: &AllocationProperties,
    ) -> NeoResult<AllocationRef> {
        if properties.size == 0 {
            return Err(NeoError::InvalidSize(0));
        }

        if !self.reserve_budget(properties.size) {
            // Memory pressure: give completed deferred frees a chance first.
            self.process_deferred();
            if !self.reserve_budget(properties.size) {
                warn!(
                    "[MemoryManager] out of memory allocating {} bytes of {:?}",
                    properties.size, properties.allocation_type
                );
                return Err(NeoError::OutOfMemory);
            }
        }

        match self.allocate_reserved(properties) {
            Ok(alloc) => Ok(alloc),
            Err(e) => {
                self.used_memory.fetch_sub(properties.size, Ordering::AcqRel);
                Err(e)
            }
        }
    }

    fn reserve_budget(&self, size: usize) -> bool {
        self.used_memory
            .fetch_update(Ordering::AcqRel, Ordering::Acquire, |used| {
                used.checked_add(size).filter(|&total| total <= self.config.capacity)
            })
            .is_ok()
    }

    fn allocate_reserved(&self, properties: &AllocationProperties) -> NeoResult<AllocationRef> {
        // Anonymous mappings come back zeroed.
        let backing = HostBacking::map(properties.size)?;

        let mut state = self.lock_state();

        let (gpu_address, owns_gpu_va) = match properties.gpu_address {
            Some(addr) => (addr, false),
            None => {
                let aperture = if properties.allocation_type.is_internal() {
                    &mut state.internal_aperture
                } else {
                    &mut state.svm_aperture
                };
                let addr = aperture
                    .allocate_va(properties.size, properties.alignment)
                    .ok_or(NeoError::OutOfVirtualAddressSpace)?;
                (addr, true)
            }
        };

        let id = self.next_id.fetch_add(1, Ordering::Relaxed);
        let allocation = Arc::new(GraphicsAllocation::new(id, properties, gpu_address, backing));

        state.allocations.insert(
            id,
            RegistryEntry {
                gpu_address,
                size: properties.size,
                owns_gpu_va,
                allocation: Arc::downgrade(&allocation),
            },
        );

        Ok(allocation)
    }

    /// Convenience for the common "size + type" request.
    pub fn allocate(&self, size: usize, allocation_type: AllocationType) -> NeoResult<AllocationRef> {
        self.allocate_graphics_memory_with_properties(&AllocationProperties::new(
            0,
            size,
            allocation_type,
        ))
    }

    /// Releases the allocation's VA and budget. Outstanding handles keep the
    /// host pages alive but the allocation is no longer tracked.
    pub fn free_graphics_memory(&self, alloc: AllocationRef) {
        let mut state = self.lock_state();
        let Some(entry) = state.allocations.remove(&alloc.id()) else {
            warn!(
                "[MemoryManager] double free of allocation {} ({:?})",
                alloc.id(),
                alloc.allocation_type()
            );
            return;
        };

        if entry.owns_gpu_va {
            if state.internal_aperture.contains(entry.gpu_address) {
                state.internal_aperture.free_va(entry.gpu_address, entry.size);
            } else {
                state.svm_aperture.free_va(entry.gpu_address, entry.size);
            }
        }
        drop(state);

        self.used_memory.fetch_sub(entry.size, Ordering::AcqRel);
    }

    /// Frees now when no engine still needs the allocation, otherwise hands it
    /// to the deferred deleter together with the completion targets to await.
    pub fn check_gpu_usage_and_destroy(&self, alloc: AllocationRef) {
        let waits = self.pending_engine_work(&alloc);
        if waits.is_empty() {
            self.free_graphics_memory(alloc);
        } else {
            debug!(
                "[MemoryManager] deferring free of allocation {} until {} engine(s) finish",
                alloc.id(),
                waits.len()
            );
            self.deferred.defer(DeferredEntry::new(alloc, waits));
        }
    }

    /// Waits on every engine that used `alloc`. Returns false on timeout.
    pub fn wait_for_engines_completion(&self, alloc: &GraphicsAllocation, timeout: Option<Duration>) -> bool {
        self.pending_engine_work(alloc)
            .into_iter()
            .all(|(tag, task_count)| tag.wait(task_count, timeout))
    }

    /// Frees every deferred allocation whose engines are done. Returns the count freed.
    pub fn process_deferred(&self) -> usize {
        self.deferred.process(|alloc| self.free_graphics_memory(alloc))
    }

    /// Runs deferred reclamation on a background thread until the manager is dropped.
    pub fn start_deferred_deleter(&self, interval: Duration) {
        self.deferred.start_worker(self.self_ref.clone(), interval);
    }

    /// Resolves a GPU address to the live allocation containing it.
    #[must_use]
    pub fn find_allocation_by_gpu_address(&self, address: u64) -> Option<AllocationRef> {
        let state = self.lock_state();
        state
            .allocations
            .values()
            .filter(|e| e.owns_gpu_va && address >= e.gpu_address && address < e.gpu_address + e.size as u64)
            .find_map(|e| e.allocation.upgrade())
    }
}

impl Drop for MemoryManager {
    fn drop(&mut self) {
        let leaked = self.lock_state().allocations.len();
        if leaked > 0 {
            debug!("[MemoryManager] dropping with {leaked} live allocation(s)");
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::memory::AllocationProperties;
    use crate::utils::memory_constants::KB;

    #[test]
    fn allocation_lands_in_aperture_matching_its_type() {
        let mm = MemoryManager::new(MemoryConfig::default());
        let cb = mm.allocate(4 * KB, AllocationType::CommandBuffer).unwrap();
        let svm = mm.allocate(4 * KB, AllocationType::SvmZeroCopy).unwrap();
        assert!(cb.gpu_address() < SVM_MIN_BASE + INTERNAL_HEAP_SIZE);
        assert!(svm.gpu_address() >= SVM_MIN_BASE + INTERNAL_HEAP_SIZE);
        assert_eq!(mm.live_allocation_count(), 2);
        assert_eq!(mm.used_memory(), 8 * KB);
    }

    #[test]
    fn zero_size_and_budget_overflow_fail() {
        let mm = MemoryManager::new(MemoryConfig {
            capacity: 16 * KB,
            local_memory_supported: false,
        });
        assert!(matches!(
            mm.allocate(0, AllocationType::Buffer),
            Err(NeoError::InvalidSize(0))
        ));
        let a = mm.allocate(12 * KB, AllocationType::Buffer).unwrap();
        assert!(matches!(
            mm.allocate(8 * KB, AllocationType::Buffer),
            Err(NeoError::OutOfMemory)
        ));
        mm.free_graphics_memory(a);
        assert!(mm.allocate(8 * KB, AllocationType::Buffer).is_ok());
    }

    #[test]
    fn free_releases_va_and_budget() {
        let mm = MemoryManager::new(MemoryConfig::default());
        let a = mm.allocate(4 * KB, AllocationType::Buffer).unwrap();
        let va = a.gpu_address();
        mm.free_graphics_memory(a.clone());
        assert_eq!(mm.used_memory(), 0);
        assert_eq!(mm.live_allocation_count(), 0);
        // Double free is tolerated and logged.
        mm.free_graphics_memory(a);
        let b = mm.allocate(4 * KB, AllocationType::Buffer).unwrap();
        assert_eq!(b.gpu_address(), va);
    }

    #[test]
    fn borrowed_gpu_address_is_not_returned_to_aperture() {
        let mm = MemoryManager::new(MemoryConfig::default());
        let gpu = mm.allocate(4 * KB, AllocationType::SvmGpu).unwrap();
        let cpu = mm
            .allocate_graphics_memory_with_properties(
                &AllocationProperties::new(0, 4 * KB, AllocationType::SvmCpu)
                    .at_gpu_address(gpu.gpu_address()),
            )
            .unwrap();
        assert_eq!(cpu.gpu_address(), gpu.gpu_address());
        mm.free_graphics_memory(cpu);
        assert_eq!(
            mm.find_allocation_by_gpu_address(gpu.gpu_address() + 8).map(|a| a.id()),
            Some(gpu.id())
        );
    }

    #[test]
    fn unused_allocation_is_freed_immediately_on_usage_check() {
        let mm = MemoryManager::new(MemoryConfig::default());
        let a = mm.allocate(4 * KB, AllocationType::Buffer).unwrap();
        mm.check_gpu_usage_and_destroy(a);
        assert_eq!(mm.live_allocation_count(), 0);
        assert_eq!(mm.deferred_deleter().pending(), 0);
    }

    #[test]
    fn worker_reclaims_once_engine_catches_up() {
        let mm = MemoryManager::new(MemoryConfig::default());
        let tag_alloc = mm.allocate(4 * KB, AllocationType::TagBuffer).unwrap();
        let tag = Arc::new(CompletionTag::new(tag_alloc, Duration::ZERO).unwrap());
        let ctx = mm.register_os_context(EngineType::Compute, 0, tag.clone()).unwrap();

        let busy = mm.allocate(4 * KB, AllocationType::Buffer).unwrap();
        busy.update_task_count(2, ctx.context_id());
        mm.check_gpu_usage_and_destroy(busy);
        assert_eq!(mm.deferred_deleter().pending(), 1);

        mm.start_deferred_deleter(Duration::from_millis(1));
        tag.initialize(2);
        let start = std::time::Instant::now();
        while mm.deferred_deleter().freed() == 0 && start.elapsed() < Duration::from_secs(5) {
            std::thread::sleep(Duration::from_millis(1));
        }
        assert_eq!(mm.deferred_deleter().freed(), 1);
        assert_eq!(mm.live_allocation_count(), 1);
    }

    #[test]
    fn unregistered_context_releases_its_tag_and_keeps_its_id() {
        let mm = MemoryManager::new(MemoryConfig::default());
        let tag_alloc = mm.allocate(4 * KB, AllocationType::TagBuffer).unwrap();
        let tag = Arc::new(CompletionTag::new(tag_alloc, Duration::ZERO).unwrap());
        let first = mm.register_os_context(EngineType::Compute, 0, tag.clone()).unwrap();
        assert_eq!(Arc::strong_count(&tag), 2);

        let used = mm.allocate(4 * KB, AllocationType::Buffer).unwrap();
        used.update_task_count(3, first.context_id());
        mm.unregister_os_context(first.context_id());
        assert_eq!(Arc::strong_count(&tag), 1);

        mm.check_gpu_usage_and_destroy(used);
        assert_eq!(mm.deferred_deleter().pending(), 0);

        let second = mm.register_os_context(EngineType::Copy, 0, tag).unwrap();
        assert_ne!(second.context_id(), first.context_id());
    }
}
