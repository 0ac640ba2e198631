mod common;

use common::{assert_disjoint_ranges, float_tensor, new_graph};
use rustgraph::{Allocator, CpuRuntime};

#[test]
fn first_fit_extends_then_coalesces_back_to_one_block() {
    let mut arena = Allocator::new(CpuRuntime::shared());

    assert_eq!(arena.alloc(8), 0);
    assert_eq!(arena.alloc(16), 8);
    assert_eq!(arena.alloc(8), 24);
    assert_eq!(arena.peak(), 32);
    assert_eq!(arena.used(), 32);

    arena.free(8, 16);
    assert_eq!(arena.free_blocks(), vec![(8, 16)]);

    arena.free(0, 8);
    assert_eq!(arena.free_blocks(), vec![(0, 24)]);

    arena.free(24, 8);
    assert_eq!(arena.free_blocks(), vec![(0, 32)]);
    assert_eq!(arena.used(), 0);
    assert_eq!(arena.peak(), 32);
}

#[test]
fn alloc_rounds_requests_up_to_alignment() {
    let mut arena = Allocator::new(CpuRuntime::shared());
    assert_eq!(arena.alloc(5), 0);
    assert_eq!(arena.alloc(3), 8);
    assert_eq!(arena.used(), 16);
}

#[test]
fn aligned_size_is_idempotent() {
    let arena = Allocator::new(CpuRuntime::shared());
    for n in 0..64 {
        let once = arena.aligned_size(n);
        assert_eq!(arena.aligned_size(once), once);
    }
    assert_eq!(arena.aligned_size(0), 0);
    assert_eq!(arena.aligned_size(1), 8);
    assert_eq!(arena.aligned_size(8), 8);
    assert_eq!(arena.aligned_size(9), 16);
}

#[test]
fn freed_blocks_are_reused_first_fit() {
    let mut arena = Allocator::new(CpuRuntime::shared());
    let first = arena.alloc(16);
    let second = arena.alloc(8);
    assert_eq!((first, second), (0, 16));

    arena.free(first, 16);
    // The 8-byte request splits the 16-byte hole at its front.
    assert_eq!(arena.alloc(8), 0);
    assert_eq!(arena.free_blocks(), vec![(8, 8)]);
    // Too big for the hole, so the arena grows instead.
    assert_eq!(arena.alloc(16), 24);
    assert_eq!(arena.peak(), 40);
}

#[test]
fn peak_never_drops_below_used() {
    let mut arena = Allocator::new(CpuRuntime::shared());
    let a = arena.alloc(24);
    assert!(arena.peak() >= arena.used());
    let _b = arena.alloc(8);
    assert!(arena.peak() >= arena.used());
    arena.free(a, 24);
    assert!(arena.peak() >= arena.used());
    let _c = arena.alloc(40);
    assert!(arena.peak() >= arena.used());
}

#[test]
fn materialize_returns_one_buffer_sized_by_peak() {
    let mut arena = Allocator::new(CpuRuntime::shared());
    arena.alloc(12);
    arena.alloc(20);
    let first = arena.materialize().expect("buffer");
    let second = arena.materialize().expect("same buffer");
    assert_eq!(first.len(), arena.peak());
    assert_eq!(
        first.as_slice().as_ptr(),
        second.as_slice().as_ptr(),
        "materialize must pin a single buffer"
    );
    assert!(arena.is_materialized());
}

#[test]
fn data_malloc_binds_every_tensor_to_disjoint_ranges() {
    let mut graph = new_graph();
    let a = float_tensor(&mut graph, &[2, 3, 5]);
    let b = float_tensor(&mut graph, &[2, 5, 7]);
    let matmul = graph.add_matmul(a, b, false, false).expect("matmul");
    let out = graph.op(matmul).outputs()[0];
    graph.add_transpose(out, vec![0, 2, 1]).expect("transpose");

    let plan = graph.data_malloc().expect("plan");
    assert_eq!(plan.entries.len(), graph.tensor_count());
    assert!(plan.peak_bytes >= plan.used_bytes);

    for tensor in graph.tensors() {
        let blob = tensor.blob().expect("every tensor is bound");
        assert_eq!(blob.len(), tensor.bytes());
        assert_eq!(blob.as_slice().len(), tensor.bytes());
    }

    let ranges: Vec<(usize, usize)> = plan
        .entries
        .iter()
        .map(|entry| (entry.offset, entry.bytes))
        .collect();
    assert_disjoint_ranges(&ranges, graph.allocator().alignment());
}

#[test]
fn memory_plan_digest_is_stable_across_serialization() {
    let mut graph = new_graph();
    float_tensor(&mut graph, &[4, 4]);
    let base = float_tensor(&mut graph, &[4, 4]);
    graph.add_transpose(base, vec![1, 0]).expect("transpose");

    let plan = graph.data_malloc().expect("plan");
    let digest = plan.digest().expect("digest");
    assert_eq!(digest, plan.digest().expect("digest again"));

    let json = serde_json::to_string(&plan).expect("serialize");
    let restored: rustgraph::MemoryPlan = serde_json::from_str(&json).expect("deserialize");
    assert_eq!(restored.digest().expect("digest"), digest);
    assert_eq!(restored, plan);
}
