//! What an enqueue dispatches and how it lands in a command stream.
//!
//! Command encoding is hardware specific and lives outside this crate behind
//! [`DispatchEncoder`]. Kernels carry the effect their execution has on
//! memory as [`KernelEffect`]s, which is what the simulated engine runs.

use crate::csr::submission::{GpuOperation, PostSyncValue};
use crate::csr::CommandStreamReceiver;
use crate::error::{NeoError, NeoResult};
use crate::memory::stream::LinearStream;
use crate::memory::{AllocationProperties, AllocationRef, AllocationType, MemoryManager};
use crate::svm::SvmAllocsManager;
use crate::utils::memory_constants::KB;
use log::{debug, info};
use std::fmt;
use std::sync::Arc;

pub const PRINTF_SURFACE_SIZE: usize = 64 * KB;

/// Bytes at the start of the printf surface holding the write cursor.
const PRINTF_HEADER_SIZE: usize = 4;

#[derive(Debug, Clone)]
pub enum KernelArg {
    Buffer(AllocationRef),
    /// Pointer into an SVM or unified memory allocation.
    Svm(u64),
    Value(Vec<u8>),
}

#[derive(Debug, Clone)]
pub enum KernelEffect {
    Operation(GpuOperation),
    /// Line the kernel prints through its printf surface.
    Printf(String),
}

#[derive(Debug, Clone)]
pub struct Kernel {
    name: String,
    args: Vec<KernelArg>,
    effects: Vec<KernelEffect>,
    indirect_access: bool,
}

impl Kernel {
    #[must_use]
    pub fn new(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            args: Vec::new(),
            effects: Vec::new(),
            indirect_access: false,
        }
    }

    #[must_use]
    pub fn arg(mut self, arg: KernelArg) -> Self {
        self.args.push(arg);
        self
    }

    #[must_use]
    pub fn effect(mut self, operation: GpuOperation) -> Self {
        self.effects.push(KernelEffect::Operation(operation));
        self
    }

    #[must_use]
    pub fn printf(mut self, line: impl Into<String>) -> Self {
        self.effects.push(KernelEffect::Printf(line.into()));
        self
    }

    /// Kernel may dereference unified memory it was not given as an argument.
    #[must_use]
    pub const fn with_indirect_access(mut self) -> Self {
        self.indirect_access = true;
        self
    }

    #[must_use]
    pub fn name(&self) -> &str {
        &self.name
    }

    #[must_use]
    pub fn args(&self) -> &[KernelArg] {
        &self.args
    }

    #[must_use]
    pub fn effects(&self) -> &[KernelEffect] {
        &self.effects
    }

    #[must_use]
    pub const fn has_indirect_access(&self) -> bool {
        self.indirect_access
    }

    #[must_use]
    pub fn uses_printf(&self) -> bool {
        self.effects.iter().any(|e| matches!(e, KernelEffect::Printf(_)))
    }

    /// Allocations the kernel's arguments reference.
    pub(crate) fn arg_allocations(&self, svm: &SvmAllocsManager) -> NeoResult<Vec<AllocationRef>> {
        let mut allocations = Vec::new();
        for arg in &self.args {
            match arg {
                KernelArg::Buffer(allocation) => allocations.push(allocation.clone()),
                KernelArg::Svm(ptr) => {
                    let data = svm.get_svm_alloc(*ptr).ok_or_else(|| {
                        NeoError::InvalidAllocation(format!("{ptr:#x} is not an SVM pointer"))
                    })?;
                    allocations.push(data.gpu_allocation);
                }
                KernelArg::Value(_) => {}
            }
        }
        Ok(allocations)
    }
}

/// One kernel launch.
#[derive(Debug, Clone)]
pub struct DispatchInfo {
    kernel: Arc<Kernel>,
    global_size: [usize; 3],
    local_size: [usize; 3],
    global_offset: [usize; 3],
}

impl DispatchInfo {
    #[must_use]
    pub const fn new(kernel: Arc<Kernel>, global_size: [usize; 3]) -> Self {
        Self {
            kernel,
            global_size,
            local_size: [1, 1, 1],
            global_offset: [0, 0, 0],
        }
    }

    #[must_use]
    pub const fn with_local_size(mut self, local_size: [usize; 3]) -> Self {
        self.local_size = local_size;
        self
    }

    #[must_use]
    pub const fn with_offset(mut self, global_offset: [usize; 3]) -> Self {
        self.global_offset = global_offset;
        self
    }

    #[must_use]
    pub const fn kernel(&self) -> &Arc<Kernel> {
        &self.kernel
    }

    #[must_use]
    pub const fn global_size(&self) -> [usize; 3] {
        self.global_size
    }

    #[must_use]
    pub const fn local_size(&self) -> [usize; 3] {
        self.local_size
    }

    #[must_use]
    pub const fn global_offset(&self) -> [usize; 3] {
        self.global_offset
    }

    #[must_use]
    pub fn work_groups(&self) -> [usize; 3] {
        let mut groups = [0; 3];
        for (dim, count) in groups.iter_mut().enumerate() {
            *count = self.global_size[dim].div_ceil(self.local_size[dim].max(1));
        }
        groups
    }
}

/// The dispatches of one enqueue.
#[derive(Debug, Clone, Default)]
pub struct MultiDispatchInfo {
    dispatches: Vec<DispatchInfo>,
}

impl MultiDispatchInfo {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    #[must_use]
    pub fn single(dispatch: DispatchInfo) -> Self {
        Self {
            dispatches: vec![dispatch],
        }
    }

    /// Single work item of a driver-internal kernel.
    #[must_use]
    pub fn builtin(kernel: Kernel) -> Self {
        Self::single(DispatchInfo::new(Arc::new(kernel), [1, 1, 1]))
    }

    pub fn push(&mut self, dispatch: DispatchInfo) {
        self.dispatches.push(dispatch);
    }

    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.dispatches.is_empty()
    }

    #[must_use]
    pub fn len(&self) -> usize {
        self.dispatches.len()
    }

    pub fn iter(&self) -> impl Iterator<Item = &DispatchInfo> {
        self.dispatches.iter()
    }

    #[must_use]
    pub fn uses_printf(&self) -> bool {
        self.dispatches.iter().any(|d| d.kernel.uses_printf())
    }

    #[must_use]
    pub fn has_indirect_access(&self) -> bool {
        self.dispatches.iter().any(|d| d.kernel.has_indirect_access())
    }
}

/// Hardware command encoding.
pub trait DispatchEncoder: Send + Sync + fmt::Debug {
    fn walker_size(&self, dispatch: &DispatchInfo) -> usize;

    fn encode_walker(&self, dispatch: &DispatchInfo, stream: &mut LinearStream) -> NeoResult<()>;

    fn operation_size(&self, operation: &GpuOperation) -> usize;

    fn encode_operation(&self, operation: &GpuOperation, stream: &mut LinearStream) -> NeoResult<()>;
}

/// Encoder writing fixed-size tagged records. Keeps streams well formed
/// where no hardware encoder is plugged in.
#[derive(Debug, Default, Clone, Copy)]
pub struct OpaqueEncoder;

impl OpaqueEncoder {
    const WALKER: u32 = 0x7105_0000;
    const OPERATION: u32 = 0x7A00_0000;
    const WALKER_DWORDS: usize = 12;
    const OPERATION_DWORDS: usize = 4;

    fn opcode(operation: &GpuOperation) -> u32 {
        match operation {
            GpuOperation::Copy { .. } => 1,
            GpuOperation::Fill { .. } => 2,
            GpuOperation::Write { .. } => 3,
            GpuOperation::SemaphoreWait { .. } => 4,
            GpuOperation::AtomicDecrement { .. } => 5,
        }
    }

    fn target(operation: &GpuOperation) -> u64 {
        match operation {
            GpuOperation::Copy { dst, dst_offset, .. } => dst.gpu_address() + *dst_offset as u64,
            GpuOperation::Fill { dst, offset, .. }
            | GpuOperation::Write { dst, offset, .. }
            | GpuOperation::AtomicDecrement { dst, offset } => dst.gpu_address() + *offset as u64,
            GpuOperation::SemaphoreWait { src, offset, .. } => src.gpu_address() + *offset as u64,
        }
    }
}

fn write_dwords(stream: &mut LinearStream, dwords: &[u32]) -> NeoResult<()> {
    let bytes: Vec<u8> = dwords.iter().flat_map(|d| d.to_le_bytes()).collect();
    stream.write(&bytes).map(|_| ())
}

impl DispatchEncoder for OpaqueEncoder {
    fn walker_size(&self, _dispatch: &DispatchInfo) -> usize {
        Self::WALKER_DWORDS * 4
    }

    #[allow(clippy::cast_possible_truncation)]
    fn encode_walker(&self, dispatch: &DispatchInfo, stream: &mut LinearStream) -> NeoResult<()> {
        let groups = dispatch.work_groups();
        let local = dispatch.local_size();
        let offset = dispatch.global_offset();
        let name_len = dispatch.kernel().name().len() as u32;
        write_dwords(
            stream,
            &[
                Self::WALKER | (Self::WALKER_DWORDS as u32 - 2),
                name_len,
                groups[0] as u32,
                groups[1] as u32,
                groups[2] as u32,
                local[0] as u32,
                local[1] as u32,
                local[2] as u32,
                offset[0] as u32,
                offset[1] as u32,
                offset[2] as u32,
                0,
            ],
        )
    }

    fn operation_size(&self, _operation: &GpuOperation) -> usize {
        Self::OPERATION_DWORDS * 4
    }

    #[allow(clippy::cast_possible_truncation)]
    fn encode_operation(&self, operation: &GpuOperation, stream: &mut LinearStream) -> NeoResult<()> {
        let target = Self::target(operation);
        let value = match operation {
            GpuOperation::Write {
                value: PostSyncValue::Immediate(v),
                ..
            } => *v,
            GpuOperation::Copy { size, .. } | GpuOperation::Fill { size, .. } => *size as u32,
            _ => 0,
        };
        write_dwords(
            stream,
            &[
                Self::OPERATION | Self::opcode(operation),
                target as u32,
                (target >> 32) as u32,
                value,
            ],
        )
    }
}

/// Printf surface of one enqueue and its host readback. The surface is
/// released when the handler is dropped.
#[derive(Debug)]
pub struct PrintfHandler {
    memory_manager: Arc<MemoryManager>,
    surface: AllocationRef,
    cursor: usize,
}

impl PrintfHandler {
    /// Surface for `multi_dispatch` if any of its kernels prints.
    pub fn create(multi_dispatch: &MultiDispatchInfo, csr: &CommandStreamReceiver) -> NeoResult<Option<Self>> {
        if !multi_dispatch.uses_printf() {
            return Ok(None);
        }
        let props = AllocationProperties::new(
            csr.os_context().root_device_index(),
            PRINTF_SURFACE_SIZE,
            AllocationType::PrintfSurface,
        );
        let memory_manager = csr.memory_manager().clone();
        let surface = memory_manager.allocate_graphics_memory_with_properties(&props)?;
        let handler = Self {
            memory_manager,
            surface,
            cursor: PRINTF_HEADER_SIZE,
        };
        handler.surface.write(0, &(PRINTF_HEADER_SIZE as u32).to_le_bytes())?;
        Ok(Some(handler))
    }

    #[must_use]
    pub const fn surface(&self) -> &AllocationRef {
        &self.surface
    }

    /// Engine operations that emit `line` and advance the stored cursor.
    #[allow(clippy::cast_possible_truncation)]
    pub fn emit(&mut self, line: &str) -> NeoResult<Vec<GpuOperation>> {
        let mut bytes = line.as_bytes().to_vec();
        bytes.push(b'\n');
        if self.cursor + bytes.len() > PRINTF_SURFACE_SIZE {
            return Err(NeoError::InvalidSize(self.cursor + bytes.len()));
        }
        let offset = self.cursor;
        self.cursor += bytes.len();
        Ok(vec![
            GpuOperation::Fill {
                dst: self.surface.clone(),
                offset,
                size: bytes.len(),
                pattern: bytes,
            },
            GpuOperation::Write {
                dst: self.surface.clone(),
                offset: 0,
                value: PostSyncValue::Immediate(self.cursor as u32),
            },
        ])
    }

    /// Reads what the kernels printed. Call after the enqueue completed.
    pub fn print_enqueue_output(&self) -> NeoResult<String> {
        let mut header = [0u8; PRINTF_HEADER_SIZE];
        self.surface.read(0, &mut header)?;
        let end = (u32::from_le_bytes(header) as usize).clamp(PRINTF_HEADER_SIZE, PRINTF_SURFACE_SIZE);
        let mut body = vec![0u8; end - PRINTF_HEADER_SIZE];
        self.surface.read(PRINTF_HEADER_SIZE, &mut body)?;
        let output = String::from_utf8_lossy(&body).into_owned();
        for line in output.lines() {
            info!("[printf] {line}");
        }
        debug!("[PrintfHandler] read back {} bytes", body.len());
        Ok(output)
    }
}

impl Drop for PrintfHandler {
    fn drop(&mut self) {
        self.memory_manager.check_gpu_usage_and_destroy(self.surface.clone());
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::memory::manager::{MemoryConfig, MemoryManager};

    #[test]
    fn work_groups_round_up() {
        let kernel = Arc::new(Kernel::new("k"));
        let dispatch = DispatchInfo::new(kernel, [100, 7, 1]).with_local_size([32, 4, 1]);
        assert_eq!(dispatch.work_groups(), [4, 2, 1]);
    }

    #[test]
    fn opaque_encoder_sizes_match_writes() {
        let mm = MemoryManager::new(MemoryConfig::default());
        let alloc = mm.allocate(4096, AllocationType::CommandBuffer).unwrap();
        let mut stream = LinearStream::new(alloc.clone());
        let encoder = OpaqueEncoder;

        let dispatch = DispatchInfo::new(Arc::new(Kernel::new("k")), [1, 1, 1]);
        encoder.encode_walker(&dispatch, &mut stream).unwrap();
        assert_eq!(stream.used(), encoder.walker_size(&dispatch));

        let op = GpuOperation::Write {
            dst: alloc,
            offset: 8,
            value: PostSyncValue::Immediate(42),
        };
        encoder.encode_operation(&op, &mut stream).unwrap();
        assert_eq!(stream.used(), encoder.walker_size(&dispatch) + encoder.operation_size(&op));
    }

    #[test]
    fn printf_only_for_printing_kernels() {
        let mm = MemoryManager::new(MemoryConfig::default());
        let kernel = Kernel::new("quiet").effect(GpuOperation::AtomicDecrement {
            dst: mm.allocate(64, AllocationType::Buffer).unwrap(),
            offset: 0,
        });
        assert!(!MultiDispatchInfo::builtin(kernel).uses_printf());
        assert!(MultiDispatchInfo::builtin(Kernel::new("loud").printf("hi")).uses_printf());
    }
}
