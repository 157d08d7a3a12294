//! Directory of unified (shared virtual) memory allocations.
//!
//! Pointers handed to users are GPU virtual addresses. Lookups resolve any
//! address inside an allocation to its record through an ordered map.

pub mod page_fault;

use crate::csr::CommandStreamReceiver;
use crate::memory::{AllocationProperties, AllocationRef, AllocationType, MemoryManager};
use log::{debug, warn};
use page_fault::PageFaultManager;
use std::collections::BTreeMap;
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum InternalMemoryType {
    Svm,
    HostUnified,
    DeviceUnified,
    SharedUnified,
}

impl InternalMemoryType {
    #[must_use]
    pub const fn mask(self) -> u32 {
        match self {
            Self::Svm => 1,
            Self::HostUnified => 2,
            Self::DeviceUnified => 4,
            Self::SharedUnified => 8,
        }
    }
}

#[derive(Debug, Clone, Copy, Default)]
pub struct SvmAllocationProperties {
    pub read_only: bool,
    pub coherent: bool,
}

#[derive(Debug, Clone, Copy)]
pub struct UnifiedMemoryProperties {
    pub memory_type: InternalMemoryType,
    pub root_device_index: u32,
}

impl UnifiedMemoryProperties {
    #[must_use]
    pub const fn new(memory_type: InternalMemoryType) -> Self {
        Self {
            memory_type,
            root_device_index: 0,
        }
    }
}

/// Backing of one SVM pointer: a single shared allocation, or a GPU
/// allocation mirrored by a CPU allocation at the same address.
#[derive(Debug, Clone)]
pub struct SvmAllocationData {
    pub gpu_allocation: AllocationRef,
    pub cpu_allocation: Option<AllocationRef>,
    pub size: usize,
    pub memory_type: InternalMemoryType,
    pub read_only: bool,
}

impl SvmAllocationData {
    #[must_use]
    pub fn base(&self) -> u64 {
        self.gpu_allocation.gpu_address()
    }

    #[must_use]
    pub const fn is_dual_storage(&self) -> bool {
        self.cpu_allocation.is_some()
    }

    /// Allocation host accesses go to.
    #[must_use]
    pub fn host_allocation(&self) -> &AllocationRef {
        self.cpu_allocation.as_ref().unwrap_or(&self.gpu_allocation)
    }

    #[must_use]
    pub fn contains(&self, ptr: u64) -> bool {
        ptr >= self.base() && ptr - self.base() < self.size as u64
    }
}

/// Explicit map of an SVM region for host access.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct SvmMapOperation {
    pub region_svm_ptr: u64,
    pub region_size: usize,
    pub base_svm_ptr: u64,
    pub offset: usize,
    pub read_only: bool,
}

#[derive(Debug, Default)]
struct SvmState {
    allocations: BTreeMap<u64, SvmAllocationData>,
    map_operations: Vec<SvmMapOperation>,
}

#[derive(Debug)]
pub struct SvmAllocsManager {
    memory_manager: Arc<MemoryManager>,
    page_fault_manager: PageFaultManager,
    state: Mutex<SvmState>,
}

impl SvmAllocsManager {
    #[must_use]
    pub fn new(memory_manager: Arc<MemoryManager>) -> Self {
        Self {
            memory_manager,
            page_fault_manager: PageFaultManager::new(),
            state: Mutex::new(SvmState::default()),
        }
    }

    fn lock(&self) -> MutexGuard<'_, SvmState> {
        self.state.lock().unwrap_or_else(PoisonError::into_inner)
    }

    #[must_use]
    pub const fn page_fault_manager(&self) -> &PageFaultManager {
        &self.page_fault_manager
    }

    /// Creates an SVM allocation and returns its pointer.
    ///
    /// Zero-copy without device-local memory, dual storage with it. `None`
    /// for a zero size or when backing memory cannot be obtained.
    pub fn create_svm_alloc(&self, root_device_index: u32, size: usize, properties: SvmAllocationProperties) -> Option<u64> {
        let data = self.create_backing(root_device_index, size, InternalMemoryType::Svm, properties.read_only)?;
        Some(self.insert(data))
    }

    /// Creates host, device or shared unified memory.
    ///
    /// Shared allocations are also tracked by the page fault manager.
    pub fn create_unified_memory_allocation(&self, size: usize, properties: UnifiedMemoryProperties) -> Option<u64> {
        let root = properties.root_device_index;
        let data = match properties.memory_type {
            InternalMemoryType::HostUnified => {
                let alloc = self.allocate(root, size, AllocationType::SvmZeroCopy, None)?;
                SvmAllocationData {
                    gpu_allocation: alloc,
                    cpu_allocation: None,
                    size,
                    memory_type: InternalMemoryType::HostUnified,
                    read_only: false,
                }
            }
            InternalMemoryType::DeviceUnified => {
                let alloc = self.allocate(root, size, AllocationType::Buffer, None)?;
                SvmAllocationData {
                    gpu_allocation: alloc,
                    cpu_allocation: None,
                    size,
                    memory_type: InternalMemoryType::DeviceUnified,
                    read_only: false,
                }
            }
            memory_type @ (InternalMemoryType::SharedUnified | InternalMemoryType::Svm) => {
                self.create_backing(root, size, memory_type, false)?
            }
        };
        let shared = data.memory_type == InternalMemoryType::SharedUnified;
        let tracked = shared.then(|| data.clone());
        let ptr = self.insert(data);
        if let Some(data) = tracked {
            self.page_fault_manager.insert_allocation(ptr, data);
        }
        Some(ptr)
    }

    fn allocate(
        &self,
        root_device_index: u32,
        size: usize,
        allocation_type: AllocationType,
        gpu_address: Option<u64>,
    ) -> Option<AllocationRef> {
        if size == 0 {
            return None;
        }
        let mut props = AllocationProperties::new(root_device_index, size, allocation_type).multi_os_context(true);
        if let Some(address) = gpu_address {
            props = props.at_gpu_address(address);
        }
        match self.memory_manager.allocate_graphics_memory_with_properties(&props) {
            Ok(alloc) => Some(alloc),
            Err(e) => {
                warn!("[SvmAllocsManager] {allocation_type:?} allocation of {size} bytes failed: {e}");
                None
            }
        }
    }

    fn create_backing(
        &self,
        root_device_index: u32,
        size: usize,
        memory_type: InternalMemoryType,
        read_only: bool,
    ) -> Option<SvmAllocationData> {
        if !self.memory_manager.is_local_memory_supported() {
            let alloc = self.allocate(root_device_index, size, AllocationType::SvmZeroCopy, None)?;
            return Some(SvmAllocationData {
                gpu_allocation: alloc,
                cpu_allocation: None,
                size,
                memory_type,
                read_only,
            });
        }

        let gpu = self.allocate(root_device_index, size, AllocationType::SvmGpu, None)?;
        let Some(cpu) = self.allocate(root_device_index, size, AllocationType::SvmCpu, Some(gpu.gpu_address())) else {
            self.memory_manager.free_graphics_memory(gpu);
            return None;
        };
        Some(SvmAllocationData {
            gpu_allocation: gpu,
            cpu_allocation: Some(cpu),
            size,
            memory_type,
            read_only,
        })
    }

    fn insert(&self, data: SvmAllocationData) -> u64 {
        let ptr = data.base();
        debug!(
            "[SvmAllocsManager] {:?} allocation at {ptr:#x}, {} bytes{}",
            data.memory_type,
            data.size,
            if data.is_dual_storage() { ", dual storage" } else { "" }
        );
        self.lock().allocations.insert(ptr, data);
        ptr
    }

    /// Record of the allocation containing `ptr`, if any.
    #[must_use]
    pub fn get_svm_alloc(&self, ptr: u64) -> Option<SvmAllocationData> {
        let state = self.lock();
        Self::find(&state, ptr).cloned()
    }

    fn find(state: &SvmState, ptr: u64) -> Option<&SvmAllocationData> {
        state
            .allocations
            .range(..=ptr)
            .next_back()
            .map(|(_, data)| data)
            .filter(|data| data.contains(ptr))
    }

    /// Removes the allocation containing `ptr` and releases its storage.
    ///
    /// With `blocking` the call waits for every engine that used the memory;
    /// otherwise busy storage is handed to the deferred deleter.
    pub fn free_svm_alloc(&self, ptr: u64, blocking: bool) -> bool {
        let data = {
            let mut state = self.lock();
            let Some(base) = Self::find(&state, ptr).map(SvmAllocationData::base) else {
                return false;
            };
            state.map_operations.retain(|op| op.base_svm_ptr != base);
            match state.allocations.remove(&base) {
                Some(data) => data,
                None => return false,
            }
        };

        self.page_fault_manager.remove_allocation(data.base());

        let storage = data.cpu_allocation.into_iter().chain(std::iter::once(data.gpu_allocation));
        for allocation in storage {
            if blocking && !self.memory_manager.wait_for_engines_completion(&allocation, None) {
                warn!("[SvmAllocsManager] wait before freeing {ptr:#x} did not complete");
            }
            self.memory_manager.check_gpu_usage_and_destroy(allocation);
        }
        true
    }

    #[must_use]
    pub fn num_allocs(&self) -> usize {
        self.lock().allocations.len()
    }

    pub fn insert_svm_map_operation(
        &self,
        region_svm_ptr: u64,
        region_size: usize,
        base_svm_ptr: u64,
        offset: usize,
        read_only: bool,
    ) {
        self.lock().map_operations.push(SvmMapOperation {
            region_svm_ptr,
            region_size,
            base_svm_ptr,
            offset,
            read_only,
        });
    }

    #[must_use]
    pub fn get_svm_map_operation(&self, region_svm_ptr: u64) -> Option<SvmMapOperation> {
        self.lock()
            .map_operations
            .iter()
            .find(|op| op.region_svm_ptr == region_svm_ptr)
            .copied()
    }

    /// Removes the oldest map of `region_svm_ptr`.
    pub fn remove_svm_map_operation(&self, region_svm_ptr: u64) -> bool {
        let mut state = self.lock();
        match state
            .map_operations
            .iter()
            .position(|op| op.region_svm_ptr == region_svm_ptr)
        {
            Some(index) => {
                state.map_operations.remove(index);
                true
            }
            None => false,
        }
    }

    #[must_use]
    pub fn num_map_operations(&self) -> usize {
        self.lock().map_operations.len()
    }

    /// Makes the GPU storage of every allocation whose type is in `type_mask` resident on `csr`.
    pub fn make_internal_allocations_resident(&self, csr: &CommandStreamReceiver, type_mask: u32) {
        let allocations: Vec<AllocationRef> = self
            .lock()
            .allocations
            .values()
            .filter(|data| data.memory_type.mask() & type_mask != 0)
            .map(|data| data.gpu_allocation.clone())
            .collect();
        for allocation in &allocations {
            csr.make_resident(allocation);
        }
    }

    /// Host write through the allocation's CPU view.
    pub fn host_write(&self, ptr: u64, data: &[u8]) -> bool {
        let Some(svm) = self.get_svm_alloc(ptr) else {
            return false;
        };
        self.page_fault_manager.move_allocation_to_cpu_domain(svm.base());
        let offset = (ptr - svm.base()) as usize;
        svm.host_allocation().write(offset, data).is_ok()
    }

    /// Host read through the allocation's CPU view.
    pub fn host_read(&self, ptr: u64, out: &mut [u8]) -> bool {
        let Some(svm) = self.get_svm_alloc(ptr) else {
            return false;
        };
        self.page_fault_manager.move_allocation_to_cpu_domain(svm.base());
        let offset = (ptr - svm.base()) as usize;
        svm.host_allocation().read(offset, out).is_ok()
    }
}

impl Drop for SvmAllocsManager {
    fn drop(&mut self) {
        let state = self.state.get_mut().unwrap_or_else(PoisonError::into_inner);
        let remaining = std::mem::take(&mut state.allocations);
        if !remaining.is_empty() {
            debug!("[SvmAllocsManager] releasing {} allocation(s) on teardown", remaining.len());
        }
        for data in remaining.into_values() {
            for allocation in data.cpu_allocation.into_iter().chain(std::iter::once(data.gpu_allocation)) {
                self.memory_manager.check_gpu_usage_and_destroy(allocation);
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::memory::manager::MemoryConfig;
    use page_fault::AllocationDomain;

    fn manager(local_memory: bool) -> SvmAllocsManager {
        SvmAllocsManager::new(MemoryManager::new(MemoryConfig {
            local_memory_supported: local_memory,
            ..MemoryConfig::default()
        }))
    }

    #[test]
    fn zero_size_is_rejected() {
        let svm = manager(false);
        assert!(svm.create_svm_alloc(0, 0, SvmAllocationProperties::default()).is_none());
        assert_eq!(svm.num_allocs(), 0);
    }

    #[test]
    fn interior_pointers_resolve_and_end_does_not() {
        let svm = manager(false);
        let ptr = svm.create_svm_alloc(0, 256, SvmAllocationProperties::default()).unwrap();
        let data = svm.get_svm_alloc(ptr).unwrap();
        assert!(!data.is_dual_storage());
        assert_eq!(data.gpu_allocation.allocation_type(), AllocationType::SvmZeroCopy);
        assert_eq!(svm.get_svm_alloc(ptr + 255).unwrap().base(), ptr);
        assert!(svm.get_svm_alloc(ptr + 256).is_none());
        assert!(svm.get_svm_alloc(ptr - 1).is_none());
    }

    #[test]
    fn two_allocations_leave_an_unowned_gap() {
        let svm = manager(false);
        let a = svm.create_svm_alloc(0, 256, SvmAllocationProperties::default()).unwrap();
        let b = svm.create_svm_alloc(0, 256, SvmAllocationProperties::default()).unwrap();
        let (lo, hi) = if a < b { (a, b) } else { (b, a) };
        assert!(lo + 256 <= hi);
        assert!(svm.get_svm_alloc(lo + 256).is_none());
        assert!(svm.get_svm_alloc(hi - 1).is_none());
    }

    #[test]
    fn free_removes_record_and_map_operations() {
        let svm = manager(false);
        let ptr = svm.create_svm_alloc(0, 4096, SvmAllocationProperties::default()).unwrap();
        svm.insert_svm_map_operation(ptr + 64, 128, ptr, 64, true);
        assert_eq!(svm.get_svm_map_operation(ptr + 64).unwrap().offset, 64);
        assert!(svm.free_svm_alloc(ptr, false));
        assert!(svm.get_svm_alloc(ptr).is_none());
        assert_eq!(svm.num_map_operations(), 0);
        assert!(!svm.free_svm_alloc(ptr, false));
    }

    #[test]
    fn local_memory_selects_dual_storage_at_one_address() {
        let svm = manager(true);
        let ptr = svm.create_svm_alloc(0, 4096, SvmAllocationProperties::default()).unwrap();
        let data = svm.get_svm_alloc(ptr).unwrap();
        let cpu = data.cpu_allocation.as_ref().unwrap();
        assert_eq!(cpu.gpu_address(), data.gpu_allocation.gpu_address());
        assert_eq!(cpu.allocation_type(), AllocationType::SvmCpu);
        assert_eq!(data.gpu_allocation.allocation_type(), AllocationType::SvmGpu);
    }

    #[test]
    fn map_operations_allow_repeated_regions() {
        let svm = manager(false);
        svm.insert_svm_map_operation(0x1000, 16, 0x1000, 0, false);
        svm.insert_svm_map_operation(0x1000, 32, 0x1000, 0, true);
        assert_eq!(svm.get_svm_map_operation(0x1000).unwrap().region_size, 16);
        assert!(svm.remove_svm_map_operation(0x1000));
        assert_eq!(svm.get_svm_map_operation(0x1000).unwrap().region_size, 32);
        assert!(svm.remove_svm_map_operation(0x1000));
        assert!(!svm.remove_svm_map_operation(0x1000));
    }

    #[test]
    fn shared_allocation_migrates_between_domains() {
        let svm = manager(true);
        let ptr = svm
            .create_unified_memory_allocation(64, UnifiedMemoryProperties::new(InternalMemoryType::SharedUnified))
            .unwrap();
        let pfm = svm.page_fault_manager();
        assert_eq!(pfm.domain(ptr), Some(AllocationDomain::Cpu));

        assert!(svm.host_write(ptr, &[9; 64]));
        pfm.move_all_allocations_to_gpu_domain();
        assert_eq!(pfm.domain(ptr), Some(AllocationDomain::Gpu));
        let data = svm.get_svm_alloc(ptr).unwrap();
        let mut gpu_bytes = [0u8; 64];
        data.gpu_allocation.read(0, &mut gpu_bytes).unwrap();
        assert_eq!(gpu_bytes, [9; 64]);

        data.gpu_allocation.fill(0, 64, &[3]).unwrap();
        let mut host = [0u8; 64];
        assert!(svm.host_read(ptr, &mut host));
        assert_eq!(host, [3; 64]);

        assert!(svm.free_svm_alloc(ptr, true));
        assert_eq!(pfm.tracked_count(), 0);
    }

    #[test]
    fn only_requested_types_become_resident() {
        use crate::config::DebugSettings;
        use crate::csr::simulated::{EngineMode, SimulatedGpu};
        use crate::memory::manager::EngineType;

        let mm = MemoryManager::new(MemoryConfig::default());
        let svm = SvmAllocsManager::new(mm.clone());
        let engine = SimulatedGpu::new().create_engine(EngineMode::Immediate).unwrap();
        let csr = CommandStreamReceiver::new(mm, EngineType::Compute, 0, engine, Arc::new(DebugSettings::default()))
            .unwrap();

        let device = svm
            .create_unified_memory_allocation(4096, UnifiedMemoryProperties::new(InternalMemoryType::DeviceUnified))
            .unwrap();
        svm.create_unified_memory_allocation(4096, UnifiedMemoryProperties::new(InternalMemoryType::HostUnified))
            .unwrap();
        svm.make_internal_allocations_resident(&csr, InternalMemoryType::DeviceUnified.mask());
        assert_eq!(csr.residency_count(), 1);
        let data = svm.get_svm_alloc(device).unwrap();
        assert!(data.gpu_allocation.is_resident(csr.os_context().context_id()));
    }
}
