#![no_main]

//! Random operation sequences against the engine and the reference model.
//!
//! Every result must match the model and every intermediate store state must
//! satisfy the invariants, in particular one operational SA per channel.

use libfuzzer_sys::fuzz_target;
use sadb_core::{MemoryStore, SaEngine};
use sadb_harness::{EngineWorld, ModelWorld, Operation, check_invariants};

fuzz_target!(|ops: Vec<Operation>| {
    let mut model = ModelWorld::new();
    let world = EngineWorld::new(SaEngine::new(MemoryStore::new()));

    for op in ops.into_iter().take(256).map(Operation::normalized) {
        let expected = model.apply(&op);
        let actual = world.apply(&op);
        assert_eq!(expected, actual, "divergence at {op:?}");

        if op.is_mutation() {
            let snapshot = world.snapshot().unwrap();
            if let Err(violation) = check_invariants(&snapshot) {
                panic!("invariant broken after {op:?}: {violation}");
            }
            assert_eq!(snapshot, model.snapshot());
        }
    }
});
