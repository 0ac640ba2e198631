#![allow(dead_code)]

use rustgraph::{CpuRuntime, DType, Graph, OpId, TensorId};

pub fn new_graph() -> Graph {
    Graph::new(CpuRuntime::shared())
}

pub fn float_tensor(graph: &mut Graph, shape: &[usize]) -> TensorId {
    graph.add_tensor(shape.to_vec(), DType::Float32)
}

pub fn output_of(graph: &Graph, op: OpId) -> TensorId {
    graph.op(op).outputs()[0]
}

/// Offsets handed out by the planner, aligned the way the arena aligns
/// them, must be pairwise disjoint.
pub fn assert_disjoint_ranges(ranges: &[(usize, usize)], alignment: usize) {
    let mut sorted: Vec<(usize, usize)> = ranges.to_vec();
    sorted.sort();
    for pair in sorted.windows(2) {
        let (offset, bytes) = pair[0];
        let aligned = if bytes == 0 {
            0
        } else {
            (bytes - 1) / alignment * alignment + alignment
        };
        assert!(
            offset + aligned <= pair[1].0,
            "ranges overlap: ({}, {}) and ({}, {})",
            offset,
            bytes,
            pair[1].0,
            pair[1].1
        );
    }
}
