//! Domain tracking for shared allocations.
//!
//! A shared allocation lives either on the host side or on the device side.
//! Host access pulls it to the CPU domain; submissions push every tracked
//! allocation to the GPU domain first. With dual storage each move copies
//! the bytes between the two backing allocations.

use crate::svm::SvmAllocationData;
use log::{error, trace};
use std::collections::HashMap;
use std::sync::{Mutex, MutexGuard, PoisonError};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AllocationDomain {
    Cpu,
    Gpu,
}

#[derive(Debug)]
struct PageFaultData {
    allocation: SvmAllocationData,
    domain: AllocationDomain,
}

#[derive(Debug, Default)]
pub struct PageFaultManager {
    allocations: Mutex<HashMap<u64, PageFaultData>>,
}

impl PageFaultManager {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    fn lock(&self) -> MutexGuard<'_, HashMap<u64, PageFaultData>> {
        self.allocations.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Starts tracking `allocation`, initially owned by the host.
    pub fn insert_allocation(&self, ptr: u64, allocation: SvmAllocationData) {
        self.lock().insert(
            ptr,
            PageFaultData {
                allocation,
                domain: AllocationDomain::Cpu,
            },
        );
    }

    pub fn remove_allocation(&self, ptr: u64) -> bool {
        self.lock().remove(&ptr).is_some()
    }

    #[must_use]
    pub fn tracked_count(&self) -> usize {
        self.lock().len()
    }

    #[must_use]
    pub fn domain(&self, ptr: u64) -> Option<AllocationDomain> {
        self.lock().get(&ptr).map(|d| d.domain)
    }

    pub fn move_allocation_to_gpu_domain(&self, ptr: u64) {
        if let Some(data) = self.lock().get_mut(&ptr) {
            Self::transfer(ptr, data, AllocationDomain::Gpu);
        }
    }

    pub fn move_allocation_to_cpu_domain(&self, ptr: u64) {
        if let Some(data) = self.lock().get_mut(&ptr) {
            Self::transfer(ptr, data, AllocationDomain::Cpu);
        }
    }

    /// Moves every tracked allocation to the device side before a submission.
    pub fn move_all_allocations_to_gpu_domain(&self) {
        for (ptr, data) in self.lock().iter_mut() {
            Self::transfer(*ptr, data, AllocationDomain::Gpu);
        }
    }

    fn transfer(ptr: u64, data: &mut PageFaultData, target: AllocationDomain) {
        if data.domain == target {
            return;
        }
        if let Some(cpu) = &data.allocation.cpu_allocation {
            let gpu = &data.allocation.gpu_allocation;
            let size = data.allocation.size;
            let result = match target {
                AllocationDomain::Gpu => gpu.copy_from(0, cpu, 0, size),
                AllocationDomain::Cpu => cpu.copy_from(0, gpu, 0, size),
            };
            if let Err(e) = result {
                error!("[PageFaultManager] migrating {ptr:#x} to {target:?} failed: {e}");
                return;
            }
        }
        trace!("[PageFaultManager] {ptr:#x} now in {target:?} domain");
        data.domain = target;
    }
}
