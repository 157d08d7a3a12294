use neo_core::svm::{InternalMemoryType, SvmAllocationProperties, UnifiedMemoryProperties};
use neo_core::{DebugSettings, ExecutionEnvironment, MemoryConfig};

fn main() -> Result<(), Box<dyn std::error::Error>> {
    println!("=== SVM Directory ===");

    let env = ExecutionEnvironment::new(
        DebugSettings::from_env(),
        MemoryConfig {
            local_memory_supported: true,
            ..MemoryConfig::default()
        },
    );
    let svm = env.svm();

    let a = svm
        .create_svm_alloc(0, 256, SvmAllocationProperties::default())
        .ok_or("first SVM allocation failed")?;
    let b = svm
        .create_svm_alloc(0, 256, SvmAllocationProperties::default())
        .ok_or("second SVM allocation failed")?;
    let shared = svm
        .create_unified_memory_allocation(8192, UnifiedMemoryProperties::new(InternalMemoryType::SharedUnified))
        .ok_or("shared allocation failed")?;

    for (name, ptr) in [("a", a), ("b", b), ("shared", shared)] {
        if let Some(data) = svm.get_svm_alloc(ptr) {
            println!(
                "[+] {name:<6} {ptr:#x}  {:>5} bytes  {:?}  dual storage: {}",
                data.size,
                data.memory_type,
                data.is_dual_storage()
            );
        }
    }

    println!("\n[Lookup]");
    for probe in [a, a + 255, a + 256, b, b + 100] {
        let owner = svm.get_svm_alloc(probe).map(|data| data.base());
        println!("    {probe:#x} -> {owner:#x?}");
    }

    println!("\n[Migration]");
    let queue = env.create_queue(env.default_engine()?).build();
    if !svm.host_write(shared, b"host data") {
        return Err("host write failed".into());
    }
    println!("    After host write: {:?}", svm.page_fault_manager().domain(shared));
    queue.enqueue_svm_memfill(shared, &[0], 16, &[], false)?;
    println!("    After submission: {:?}", svm.page_fault_manager().domain(shared));

    svm.free_svm_alloc(a, true);
    println!("\n[+] Freed a; lookup now {:?}", svm.get_svm_alloc(a).map(|d| d.base()));
    println!("    Remaining allocations: {}", svm.num_allocs());

    println!("\n=== Done ===");
    Ok(())
}
