use neo_core::svm::SvmAllocationProperties;
use neo_core::{AllocationType, DebugSettings, EngineType, ExecutionEnvironment, MemoryConfig};
use proptest::prelude::*;

#[derive(Debug, Clone, Copy)]
enum ResidencyCall {
    MakeResident(usize),
    MakeNonResident(usize),
}

fn residency_call() -> impl Strategy<Value = ResidencyCall> {
    prop_oneof![
        (0..4usize).prop_map(ResidencyCall::MakeResident),
        (0..4usize).prop_map(ResidencyCall::MakeNonResident),
    ]
}

proptest! {
    #![proptest_config(ProptestConfig::with_cases(64))]

    #[test]
    fn residency_tracks_net_effect_of_calls(calls in prop::collection::vec(residency_call(), 1..40)) {
        let env = ExecutionEnvironment::new(DebugSettings::default(), MemoryConfig::default());
        let csr = env.create_engine(EngineType::Compute).unwrap();
        let ctx = csr.os_context().context_id();
        let allocations: Vec<_> = (1..=4)
            .map(|pages| env.memory_manager().allocate(pages * 4096, AllocationType::Buffer).unwrap())
            .collect();

        let mut model = [false; 4];
        for call in calls {
            match call {
                ResidencyCall::MakeResident(i) => {
                    csr.make_resident(&allocations[i]);
                    model[i] = true;
                }
                ResidencyCall::MakeNonResident(i) => {
                    csr.make_non_resident(&allocations[i]);
                    model[i] = false;
                }
            }
            let expected: usize = allocations
                .iter()
                .zip(model)
                .filter(|(_, resident)| *resident)
                .map(|(alloc, _)| alloc.underlying_buffer_size())
                .sum();
            prop_assert_eq!(csr.total_memory_used(), expected);
            for (alloc, resident) in allocations.iter().zip(model) {
                prop_assert_eq!(alloc.is_resident(ctx), resident);
            }
        }
    }

    #[test]
    fn svm_interior_pointers_resolve_to_their_allocation(
        sizes in prop::collection::vec(1usize..20_000, 1..6),
        probe in 0.0f64..1.0,
    ) {
        let env = ExecutionEnvironment::new(DebugSettings::default(), MemoryConfig::default());
        let svm = env.svm();
        let ptrs: Vec<(u64, usize)> = sizes
            .iter()
            .map(|&size| (svm.create_svm_alloc(0, size, SvmAllocationProperties::default()).unwrap(), size))
            .collect();

        for &(ptr, size) in &ptrs {
            let k = ((size - 1) as f64 * probe) as u64;
            prop_assert_eq!(svm.get_svm_alloc(ptr).unwrap().base(), ptr);
            prop_assert_eq!(svm.get_svm_alloc(ptr + k).unwrap().base(), ptr);
            let past_end = svm.get_svm_alloc(ptr + size as u64);
            prop_assert!(past_end.is_none_or(|other| other.base() != ptr));
        }

        let (first, _) = ptrs[0];
        prop_assert!(svm.free_svm_alloc(first, true));
        prop_assert!(svm.get_svm_alloc(first).is_none());
        prop_assert_eq!(svm.num_allocs(), ptrs.len() - 1);
    }
}
