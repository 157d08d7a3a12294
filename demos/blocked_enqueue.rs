use neo_core::svm::SvmAllocationProperties;
use neo_core::{DebugSettings, Event, ExecutionEnvironment, ExecutionStatus, MemoryConfig};
use std::thread;
use std::time::Duration;

fn main() -> Result<(), Box<dyn std::error::Error>> {
    println!("=== Blocked Enqueue ===");

    let settings = DebugSettings::from_env();
    let timeout = settings.default_wait_timeout();
    let env = ExecutionEnvironment::new(settings, MemoryConfig::default());
    let queue = env.create_queue(env.default_engine()?).build();

    let ptr = env
        .svm()
        .create_svm_alloc(0, 256, SvmAllocationProperties::default())
        .ok_or("SVM allocation failed")?;

    let gate = Event::new_user(timeout);
    let fill = queue
        .enqueue_svm_memfill(ptr, &[0x42], 256, &[gate.clone()], true)?
        .ok_or("no event returned")?;
    let marker = queue.enqueue_marker(&[], true)?.ok_or("no event returned")?;

    println!("[+] Fill is {:?}, marker is {:?}", fill.peek_execution_status(), marker.peek_execution_status());
    println!("    Queue blocked: {}", queue.is_queue_blocked());

    // Release the gate from another thread, as an application callback would.
    let releaser = {
        let gate = gate.clone();
        thread::spawn(move || {
            thread::sleep(Duration::from_millis(20));
            gate.set_user_status(ExecutionStatus::Complete)
        })
    };

    marker.wait()?;
    releaser.join().map_err(|_| "release thread panicked")??;

    println!("[+] Fill is {:?}, marker is {:?}", fill.execution_status(), marker.execution_status());
    println!("    Queue blocked: {}", queue.is_queue_blocked());

    let mut bytes = [0u8; 4];
    env.svm().host_read(ptr, &mut bytes);
    println!("    Buffer head: {bytes:02x?}");

    println!("\n=== Done ===");
    Ok(())
}
