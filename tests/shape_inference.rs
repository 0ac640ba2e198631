mod common;

use common::{float_tensor, new_graph, output_of};
use rustgraph::{GraphError, OpKind};

#[test]
fn matmul_infers_batched_output_shape() {
    let mut graph = new_graph();
    let a = float_tensor(&mut graph, &[2, 3, 5]);
    let b = float_tensor(&mut graph, &[2, 5, 7]);
    let matmul = graph.add_matmul(a, b, false, false).expect("matmul");
    let out = output_of(&graph, matmul);

    assert_eq!(graph.tensor(out).shape(), &[2, 3, 7]);
    match graph.op(matmul).kind() {
        OpKind::Matmul(attrs) => {
            assert_eq!((attrs.m, attrs.n, attrs.k), (3, 7, 5));
        }
        other => panic!("unexpected kind {other:?}"),
    }
}

#[test]
fn matmul_swaps_dims_under_trans_b() {
    let mut graph = new_graph();
    let a = float_tensor(&mut graph, &[4, 6]);
    let b = float_tensor(&mut graph, &[8, 6]);
    let matmul = graph.add_matmul(a, b, false, true).expect("matmul");
    assert_eq!(graph.tensor(output_of(&graph, matmul)).shape(), &[4, 8]);
}

#[test]
fn matmul_broadcasts_batch_dims() {
    let mut graph = new_graph();
    let a = float_tensor(&mut graph, &[2, 3, 5]);
    let b = float_tensor(&mut graph, &[5, 7]);
    let matmul = graph.add_matmul(a, b, false, false).expect("matmul");
    assert_eq!(graph.tensor(output_of(&graph, matmul)).shape(), &[2, 3, 7]);
}

#[test]
fn matmul_rejects_vectors_and_mismatched_inner_dims() {
    let mut graph = new_graph();
    let vector = float_tensor(&mut graph, &[5]);
    let matrix = float_tensor(&mut graph, &[5, 7]);
    let err = graph
        .add_matmul(vector, matrix, false, false)
        .expect_err("rank below 2 must fail");
    assert!(matches!(err, GraphError::ShapeMismatch { op: "matmul", .. }));

    let a = float_tensor(&mut graph, &[3, 4]);
    let b = float_tensor(&mut graph, &[5, 7]);
    let err = graph
        .add_matmul(a, b, false, false)
        .expect_err("inner dims must match");
    assert!(matches!(err, GraphError::ShapeMismatch { op: "matmul", .. }));
}

#[test]
fn shape_infer_reconciles_supplied_outputs() {
    let mut graph = new_graph();
    let a = float_tensor(&mut graph, &[2, 3, 5]);
    let b = float_tensor(&mut graph, &[2, 5, 7]);
    let out = float_tensor(&mut graph, &[1]);
    let matmul = graph
        .add_matmul_with_output(a, b, out, false, false)
        .expect("matmul");

    graph.topo_sort().expect("schedule");
    graph.shape_infer().expect("inference");
    assert_eq!(graph.tensor(out).shape(), &[2, 3, 7]);
    match graph.op(matmul).kind() {
        OpKind::Matmul(attrs) => assert_eq!((attrs.m, attrs.n, attrs.k), (3, 7, 5)),
        other => panic!("unexpected kind {other:?}"),
    }
}

#[test]
fn shape_infer_reports_impossible_operators() {
    let mut graph = new_graph();
    let a = float_tensor(&mut graph, &[3, 4]);
    let b = float_tensor(&mut graph, &[5, 7]);
    let out = float_tensor(&mut graph, &[1]);
    graph
        .add_matmul_with_output(a, b, out, false, false)
        .expect("construction does not infer");

    graph.topo_sort().expect("schedule");
    let err = graph.shape_infer().expect_err("inner dims cannot match");
    assert!(matches!(
        err,
        GraphError::InferenceFailed { kind: "Matmul", .. }
    ));
}

#[test]
fn transpose_applies_permutation() {
    let mut graph = new_graph();
    let input = float_tensor(&mut graph, &[2, 3, 4]);
    let transpose = graph.add_transpose(input, vec![2, 0, 1]).expect("transpose");
    assert_eq!(graph.tensor(output_of(&graph, transpose)).shape(), &[4, 2, 3]);
}

#[test]
fn transpose_rejects_invalid_permutations() {
    let mut graph = new_graph();
    let input = float_tensor(&mut graph, &[2, 3, 4]);
    let err = graph
        .add_transpose(input, vec![0, 1, 3])
        .expect_err("axis out of range");
    assert!(matches!(err, GraphError::AxisOutOfRange { op: "transpose", .. }));

    let err = graph
        .add_transpose(input, vec![0, 1, 1])
        .expect_err("duplicate axis");
    assert!(matches!(err, GraphError::ShapeMismatch { op: "transpose", .. }));

    let err = graph
        .add_transpose(input, vec![1, 0])
        .expect_err("rank mismatch");
    assert!(matches!(err, GraphError::ShapeMismatch { op: "transpose", .. }));
}

#[test]
fn concat_sums_the_requested_axis() {
    let mut graph = new_graph();
    let a = float_tensor(&mut graph, &[2, 3, 4]);
    let b = float_tensor(&mut graph, &[2, 5, 4]);
    let c = float_tensor(&mut graph, &[2, 1, 4]);
    let concat = graph.add_concat(&[a, b, c], 1).expect("concat");
    assert_eq!(graph.tensor(output_of(&graph, concat)).shape(), &[2, 9, 4]);
}

#[test]
fn concat_accepts_the_leading_axis() {
    let mut graph = new_graph();
    let a = float_tensor(&mut graph, &[2, 3]);
    let b = float_tensor(&mut graph, &[4, 3]);
    let concat = graph.add_concat(&[a, b], 0).expect("concat");
    assert_eq!(graph.tensor(output_of(&graph, concat)).shape(), &[6, 3]);
}

#[test]
fn concat_normalizes_negative_axes() {
    let mut graph = new_graph();
    let a = float_tensor(&mut graph, &[2, 3, 4]);
    let b = float_tensor(&mut graph, &[2, 5, 4]);
    let concat = graph.add_concat(&[a, b], -2).expect("concat");
    assert_eq!(graph.tensor(output_of(&graph, concat)).shape(), &[2, 8, 4]);
}

#[test]
fn concat_rejects_rank_and_dim_mismatches() {
    let mut graph = new_graph();
    let a = float_tensor(&mut graph, &[2, 3, 4]);
    let flat = float_tensor(&mut graph, &[3, 4]);
    let err = graph
        .add_concat(&[a, flat], 1)
        .expect_err("differing rank must fail");
    assert!(matches!(err, GraphError::ShapeMismatch { op: "concat", .. }));

    let b = float_tensor(&mut graph, &[2, 5, 9]);
    let err = graph
        .add_concat(&[a, b], 1)
        .expect_err("non-concat axis must match");
    assert!(matches!(err, GraphError::ShapeMismatch { op: "concat", .. }));

    let err = graph.add_concat(&[a, b], 3).expect_err("axis out of range");
    assert!(matches!(err, GraphError::AxisOutOfRange { op: "concat", .. }));
}

#[test]
fn shape_infer_propagates_through_chains() {
    let mut graph = new_graph();
    let a = float_tensor(&mut graph, &[2, 3, 5]);
    let b = float_tensor(&mut graph, &[2, 5, 7]);
    let mm_out = float_tensor(&mut graph, &[1]);
    let t_out = float_tensor(&mut graph, &[1]);
    graph
        .add_matmul_with_output(a, b, mm_out, false, false)
        .expect("matmul");
    graph
        .add_transpose_with_output(mm_out, vec![0, 2, 1], t_out)
        .expect("transpose");

    graph.topo_sort().expect("schedule");
    graph.shape_infer().expect("inference");
    assert_eq!(graph.tensor(mm_out).shape(), &[2, 3, 7]);
    assert_eq!(graph.tensor(t_out).shape(), &[2, 7, 3]);
}
