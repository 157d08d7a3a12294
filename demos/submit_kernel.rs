use neo_core::csr::submission::PostSyncValue;
use neo_core::svm::SvmAllocationProperties;
use neo_core::{DebugSettings, DispatchInfo, ExecutionEnvironment, GpuOperation, Kernel, KernelArg, MemoryConfig};
use std::sync::Arc;

fn main() -> Result<(), Box<dyn std::error::Error>> {
    println!("=== Kernel Submission ===");

    let env = ExecutionEnvironment::new(DebugSettings::from_env(), MemoryConfig::default());
    let csr = env.default_engine()?;
    let queue = env.create_queue(csr.clone()).profiling().build();
    println!("[+] Engine context {} ready", csr.os_context().context_id());

    let ptr = env
        .svm()
        .create_svm_alloc(0, 4096, SvmAllocationProperties::default())
        .ok_or("SVM allocation failed")?;
    let buffer = env.svm().get_svm_alloc(ptr).ok_or("SVM pointer not found")?;
    println!("[+] SVM buffer at {ptr:#x}");

    let kernel = Kernel::new("scale")
        .arg(KernelArg::Svm(ptr))
        .effect(GpuOperation::Fill {
            dst: buffer.gpu_allocation.clone(),
            offset: 0,
            size: 4096,
            pattern: vec![0x11, 0x22],
        })
        .effect(GpuOperation::Write {
            dst: buffer.gpu_allocation.clone(),
            offset: 0,
            value: PostSyncValue::Immediate(0xC0FF_EE00),
        })
        .printf("scale: done");

    let event = queue
        .enqueue_kernel(DispatchInfo::new(Arc::new(kernel), [4096, 1, 1]).with_local_size([64, 1, 1]), &[], true)?
        .ok_or("no event returned")?;
    event.wait()?;

    let ticks = event.profiling_info()?;
    println!("    Task count: {}", event.peek_task_count());
    println!("    Ticks: {} -> {}", ticks.start, ticks.end);
    for line in queue.take_printf_output() {
        println!("    printf: {line}");
    }

    let mut head = [0u8; 8];
    if env.svm().host_read(ptr, &mut head) {
        println!("    First bytes: {head:02x?}");
    }

    queue.finish()?;
    env.svm().free_svm_alloc(ptr, true);
    println!("\n=== Done ===");
    Ok(())
}
