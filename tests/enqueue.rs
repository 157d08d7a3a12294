use neo_core::csr::simulated::EngineMode;
use neo_core::csr::submission::PostSyncValue;
use neo_core::memory::storage::AllocationUsage;
use neo_core::svm::SvmAllocationProperties;
use neo_core::{
    DebugSettings, DispatchInfo, DispatchMode, EngineType, Event, ExecutionEnvironment, ExecutionStatus, GpuOperation,
    Kernel, MemoryConfig, NeoError,
};
use std::sync::Arc;
use std::time::Duration;

const TIMEOUT: Duration = Duration::from_secs(2);

fn settings() -> DebugSettings {
    DebugSettings {
        default_wait_timeout_ms: 2000,
        ..DebugSettings::default()
    }
}

fn env() -> ExecutionEnvironment {
    ExecutionEnvironment::new(settings(), MemoryConfig::default())
}

fn svm_alloc(env: &ExecutionEnvironment, size: usize) -> u64 {
    env.svm()
        .create_svm_alloc(0, size, SvmAllocationProperties::default())
        .unwrap()
}

fn read_back(env: &ExecutionEnvironment, ptr: u64, size: usize) -> Vec<u8> {
    let mut out = vec![0u8; size];
    assert!(env.svm().host_read(ptr, &mut out));
    out
}

fn empty_kernel() -> DispatchInfo {
    DispatchInfo::new(Arc::new(Kernel::new("noop")), [64, 1, 1])
}

#[test]
fn user_event_holds_back_and_then_releases_work() {
    let env = env();
    let csr = env.default_engine().unwrap();
    let queue = env.create_queue(csr.clone()).build();
    let ptr = svm_alloc(&env, 256);

    let gate = Event::new_user(TIMEOUT);
    let fill = queue
        .enqueue_svm_memfill(ptr, &[0xAB], 256, &[gate.clone()], true)
        .unwrap()
        .unwrap();
    let marker = queue.enqueue_marker(&[], true).unwrap().unwrap();

    assert_eq!(fill.peek_execution_status(), ExecutionStatus::Queued);
    assert_eq!(marker.peek_execution_status(), ExecutionStatus::Queued);
    assert!(queue.is_queue_blocked());
    assert_eq!(csr.peek_task_count(), 0);

    gate.set_user_status(ExecutionStatus::Complete).unwrap();

    fill.wait().unwrap();
    marker.wait().unwrap();
    assert_eq!(fill.execution_status(), ExecutionStatus::Complete);
    assert_eq!(csr.peek_task_count(), 1);
    assert_eq!(marker.peek_task_count(), 1);
    assert!(!queue.is_queue_blocked());
    assert_eq!(read_back(&env, ptr, 256), vec![0xAB; 256]);
}

#[test]
fn aborted_user_event_aborts_dependent_work() {
    let env = env();
    let queue = env.create_queue(env.default_engine().unwrap()).build();
    let ptr = svm_alloc(&env, 64);

    let gate = Event::new_user(TIMEOUT);
    let fill = queue
        .enqueue_svm_memfill(ptr, &[1], 64, &[gate.clone()], true)
        .unwrap()
        .unwrap();
    gate.set_user_status(ExecutionStatus::Aborted).unwrap();

    assert_eq!(fill.peek_execution_status(), ExecutionStatus::Aborted);
    assert!(matches!(fill.wait(), Err(NeoError::InvalidEvent(_))));
    assert!(matches!(
        queue.enqueue_marker(&[fill], false),
        Err(NeoError::InvalidEvent(_))
    ));
    assert!(!queue.is_queue_blocked());
    queue.finish().unwrap();
}

#[test]
fn in_order_queue_serializes_task_levels() {
    let env = env();
    let queue = env.create_queue(env.default_engine().unwrap()).build();

    queue.enqueue_kernel(empty_kernel(), &[], false).unwrap();
    queue.enqueue_kernel(empty_kernel(), &[], false).unwrap();
    assert_eq!(queue.task_level(), 2);

    queue.enqueue_marker(&[], false).unwrap();
    assert_eq!(queue.task_level(), 2);

    queue.enqueue_barrier(&[], false).unwrap();
    assert_eq!(queue.task_level(), 3);
}

#[test]
fn out_of_order_queue_bumps_only_for_explicit_dependencies() {
    let env = env();
    let queue = env.create_queue(env.default_engine().unwrap()).out_of_order().build();
    assert!(queue.is_ooq_enabled());

    let first = queue.enqueue_kernel(empty_kernel(), &[], true).unwrap().unwrap();
    queue.enqueue_kernel(empty_kernel(), &[], false).unwrap();
    assert_eq!(queue.task_level(), 0);
    assert_eq!(first.peek_task_level(), 0);

    let dependent = queue.enqueue_kernel(empty_kernel(), &[first], true).unwrap().unwrap();
    assert_eq!(queue.task_level(), 1);
    assert_eq!(dependent.peek_task_level(), 1);
}

#[test]
fn out_of_order_barrier_orders_later_work() {
    let env = env();
    let queue = env.create_queue(env.default_engine().unwrap()).out_of_order().build();

    queue.enqueue_kernel(empty_kernel(), &[], false).unwrap();
    assert_eq!(queue.task_level(), 0);

    queue.enqueue_barrier(&[], false).unwrap();
    assert_eq!(queue.task_level(), 1);

    queue.enqueue_kernel(empty_kernel(), &[], false).unwrap();
    assert_eq!(queue.task_level(), 1);

    queue.enqueue_barrier(&[], false).unwrap();
    assert_eq!(queue.task_level(), 2);
}

#[test]
fn marker_without_kernel_reuses_current_task_count() {
    let env = env();
    let csr = env.default_engine().unwrap();
    let queue = env.create_queue(csr.clone()).build();

    queue.enqueue_kernel(empty_kernel(), &[], false).unwrap();
    let submitted = csr.backend().submitted_batches();
    let marker = queue.enqueue_marker(&[], true).unwrap().unwrap();

    assert_eq!(csr.backend().submitted_batches(), submitted);
    assert_eq!(marker.peek_task_count(), csr.peek_task_count());
    assert_eq!(marker.execution_status(), ExecutionStatus::Complete);
}

#[test]
fn cross_engine_dependency_waits_on_timestamp_packet() {
    let env = ExecutionEnvironment::with_engine_mode(settings(), MemoryConfig::default(), EngineMode::Manual);
    let compute = env.create_engine(EngineType::Compute).unwrap();
    let copy = env.create_engine(EngineType::Copy).unwrap();
    let compute_queue = env.create_queue(compute.clone()).build();
    let copy_queue = env.create_queue(copy.clone()).build();
    let src = svm_alloc(&env, 64);
    let dst = svm_alloc(&env, 64);

    let fill = compute_queue
        .enqueue_svm_memfill(src, &[7], 64, &[], true)
        .unwrap()
        .unwrap();
    let copied = copy_queue
        .enqueue_svm_memcpy(false, dst, src, 64, &[fill.clone()], true)
        .unwrap()
        .unwrap();
    assert_eq!(fill.peek_execution_status(), ExecutionStatus::Submitted);

    let compute_engine = env.simulated_engine(compute.os_context().context_id()).unwrap();
    let copy_engine = env.simulated_engine(copy.os_context().context_id()).unwrap();

    assert!(!copy_engine.step());
    assert_eq!(copy_engine.pending_batches(), 1);

    assert!(compute_engine.step());
    assert!(copy_engine.step());
    copied.wait().unwrap();
    assert_eq!(read_back(&env, dst, 64), vec![7; 64]);
}

#[test]
fn cross_engine_dependency_without_packets_waits_on_tag() {
    let settings = DebugSettings {
        enable_timestamp_packet: false,
        ..settings()
    };
    let env = ExecutionEnvironment::with_engine_mode(settings, MemoryConfig::default(), EngineMode::Manual);
    let compute = env.create_engine(EngineType::Compute).unwrap();
    let copy = env.create_engine(EngineType::Copy).unwrap();
    let compute_queue = env.create_queue(compute.clone()).build();
    let copy_queue = env.create_queue(copy.clone()).build();
    let src = svm_alloc(&env, 32);
    let dst = svm_alloc(&env, 32);

    let fill = compute_queue
        .enqueue_svm_memfill(src, &[3], 32, &[], true)
        .unwrap()
        .unwrap();
    copy_queue
        .enqueue_svm_memcpy(false, dst, src, 32, &[fill], false)
        .unwrap();

    let copy_engine = env.simulated_engine(copy.os_context().context_id()).unwrap();
    assert!(!copy_engine.step());
    env.simulated_engine(compute.os_context().context_id())
        .unwrap()
        .run_until_idle();
    assert_eq!(copy_engine.run_until_idle(), 1);
    assert_eq!(read_back(&env, dst, 32), vec![3; 32]);
}

#[test]
fn dual_storage_map_and_unmap_migrate_contents() {
    let env = ExecutionEnvironment::new(
        settings(),
        MemoryConfig {
            local_memory_supported: true,
            ..MemoryConfig::default()
        },
    );
    let queue = env.create_queue(env.default_engine().unwrap()).build();
    let ptr = svm_alloc(&env, 4096);
    let data = env.svm().get_svm_alloc(ptr).unwrap();
    assert!(data.is_dual_storage());

    queue.enqueue_svm_memfill(ptr, &[5], 4096, &[], false).unwrap();
    queue.enqueue_svm_map(true, ptr, 4096, false, &[], false).unwrap();
    assert_eq!(env.svm().num_map_operations(), 1);
    assert_eq!(read_back(&env, ptr, 4096), vec![5; 4096]);

    assert!(env.svm().host_write(ptr, &[9; 16]));
    let unmap = queue.enqueue_svm_unmap(ptr, &[], true).unwrap().unwrap();
    unmap.wait().unwrap();
    assert_eq!(env.svm().num_map_operations(), 0);

    let mut device = [0u8; 32];
    data.gpu_allocation.read(0, &mut device).unwrap();
    assert_eq!(&device[..16], &[9; 16]);
    assert_eq!(&device[16..], &[5; 16]);

    assert!(matches!(
        queue.enqueue_svm_unmap(ptr, &[], false),
        Err(NeoError::InvalidAllocation(_))
    ));
}

#[test]
fn out_of_range_svm_copy_is_rejected() {
    let env = env();
    let queue = env.create_queue(env.default_engine().unwrap()).build();
    let a = svm_alloc(&env, 64);
    let b = svm_alloc(&env, 32);
    assert!(matches!(
        queue.enqueue_svm_memcpy(false, b, a, 64, &[], false),
        Err(NeoError::InvalidSize(64))
    ));
    assert!(matches!(
        queue.enqueue_svm_memcpy(false, 0x10, a, 8, &[], false),
        Err(NeoError::InvalidAllocation(_))
    ));
}

#[test]
fn released_queue_stream_is_reused_by_next_queue() {
    let env = env();
    let csr = env.default_engine().unwrap();

    let first = env.create_queue(csr.clone()).build();
    first.enqueue_kernel(empty_kernel(), &[], false).unwrap();
    first.finish().unwrap();
    let live = env.memory_manager().live_allocation_count();
    drop(first);
    assert_eq!(csr.internal_allocation_storage().len(AllocationUsage::Reusable), 1);

    let second = env.create_queue(csr.clone()).build();
    second.enqueue_kernel(empty_kernel(), &[], false).unwrap();
    assert_eq!(csr.internal_allocation_storage().len(AllocationUsage::Reusable), 0);
    assert_eq!(env.memory_manager().live_allocation_count(), live);
}

#[test]
fn printf_output_is_read_back_after_completion() {
    let env = env();
    let queue = env.create_queue(env.default_engine().unwrap()).build();
    let kernel = Kernel::new("hello").printf("hello from the engine").printf("second line");
    let allocations = env.memory_manager().live_allocation_count();

    queue
        .enqueue_kernel(DispatchInfo::new(Arc::new(kernel), [1, 1, 1]), &[], false)
        .unwrap();

    assert_eq!(queue.take_printf_output(), vec!["hello from the engine", "second line"]);
    assert!(queue.take_printf_output().is_empty());
    // the printf surface is gone once read; only pooled tags and the stream remain
    assert!(env.memory_manager().live_allocation_count() <= allocations + 3);
}

#[test]
fn profiling_queue_reports_kernel_ticks() {
    let env = env();
    let queue = env.create_queue(env.default_engine().unwrap()).profiling().build();
    let target = env.memory_manager().allocate(64, neo_core::AllocationType::Buffer).unwrap();
    let kernel = Kernel::new("store").effect(GpuOperation::Write {
        dst: target.clone(),
        offset: 0,
        value: PostSyncValue::Immediate(42),
    });

    let event = queue
        .enqueue_kernel(DispatchInfo::new(Arc::new(kernel), [1, 1, 1]), &[], true)
        .unwrap()
        .unwrap();
    event.wait().unwrap();

    let ticks = event.profiling_info().unwrap();
    assert!(ticks.start > 1);
    assert!(ticks.end > ticks.start);
    assert_eq!(target.atomic_u32(0).unwrap().load(std::sync::atomic::Ordering::Acquire), 42);
}

#[test]
fn batched_mode_submits_on_flush() {
    let settings = DebugSettings {
        csr_dispatch_mode: DispatchMode::Batched,
        ..settings()
    };
    let env = ExecutionEnvironment::new(settings, MemoryConfig::default());
    let csr = env.default_engine().unwrap();
    let queue = env.create_queue(csr.clone()).build();

    let event = queue.enqueue_kernel(empty_kernel(), &[], true).unwrap().unwrap();
    assert_eq!(csr.pending_batched_submissions(), 1);
    assert_eq!(event.execution_status(), ExecutionStatus::Submitted);

    queue.flush().unwrap();
    assert_eq!(csr.pending_batched_submissions(), 0);
    assert_eq!(event.execution_status(), ExecutionStatus::Complete);
}

#[test]
fn forced_blocking_enqueue_completes_before_returning() {
    let settings = DebugSettings {
        make_each_enqueue_blocking: true,
        ..settings()
    };
    let env = ExecutionEnvironment::with_engine_mode(
        settings,
        MemoryConfig::default(),
        EngineMode::Threaded {
            latency: Duration::from_millis(1),
        },
    );
    let csr = env.default_engine().unwrap();
    let queue = env.create_queue(csr.clone()).build();
    let ptr = svm_alloc(&env, 128);

    let event = queue.enqueue_svm_memfill(ptr, &[0x5A], 128, &[], true).unwrap().unwrap();
    assert_eq!(event.peek_execution_status(), ExecutionStatus::Complete);
    assert_eq!(read_back(&env, ptr, 128), vec![0x5A; 128]);
}

#[test]
fn finish_waits_for_threaded_engine() {
    let env = ExecutionEnvironment::with_engine_mode(
        settings(),
        MemoryConfig::default(),
        EngineMode::Threaded {
            latency: Duration::from_millis(2),
        },
    );
    let csr = env.default_engine().unwrap();
    let queue = env.create_queue(csr.clone()).build();
    let ptr = svm_alloc(&env, 64);

    for value in 1..=4u8 {
        queue.enqueue_svm_memfill(ptr, &[value], 64, &[], false).unwrap();
    }
    queue.finish().unwrap();

    assert!(csr.completion().is_completed(queue.task_count()));
    assert_eq!(read_back(&env, ptr, 64), vec![4; 64]);
}
