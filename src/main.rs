use rustgraph::{CpuRuntime, DType, Graph};

fn main() {
    let mut graph = Graph::new(CpuRuntime::shared());

    let x = graph.add_tensor(vec![2, 3, 5], DType::Float32);
    let w = graph.add_tensor(vec![2, 7, 5], DType::Float32);
    let transpose = graph.add_transpose(w, vec![0, 2, 1]).expect("transpose");
    let w_t = graph.op(transpose).outputs()[0];
    graph.add_matmul(x, w_t, false, false).expect("matmul");

    let report = graph.optimize();
    println!(
        "Optimize: fused {} transpose(s), dropped {} tensor(s)",
        report.transposes_fused, report.tensors_dropped
    );

    graph.topo_sort().expect("schedule");
    graph.shape_infer().expect("shape inference");
    graph.check_valid().expect("graph invariants");

    let plan = graph.data_malloc().expect("memory plan");
    println!(
        "Planned {} tensors, used {} bytes, peak {} bytes",
        plan.entries.len(),
        plan.used_bytes,
        plan.peak_bytes
    );
    println!("Plan digest: {}", plan.digest().expect("digest"));
    println!("{graph}");
}
