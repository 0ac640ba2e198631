use std::collections::HashSet;

use log::{info, warn};
use serde::{Deserialize, Serialize};

use crate::graph::Graph;
use crate::ops::{OpId, OpKind};
use crate::tensor::TensorId;

/// Knobs for the rewrite driver.
#[derive(Debug, Clone, Default)]
pub struct OptimizeOptions {
    /// Collapse transpose pairs whose permutations are equal instead of
    /// inverse. Equal-perm matching is only sound for involutions; it
    /// exists to reproduce the historical behavior.
    pub collapse_equal_perms: bool,
}

impl OptimizeOptions {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_equal_perm_collapse(mut self, enabled: bool) -> Self {
        self.collapse_equal_perms = enabled;
        self
    }
}

/// What the rewrite driver changed.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct OptimizeReport {
    pub transpose_pairs_removed: usize,
    pub transposes_fused: usize,
    pub tensors_dropped: usize,
}

/// Two fixed passes, then a sweep of tensors nothing references anymore.
/// Matches are collected up front and applied afterwards, so the scan never
/// iterates a graph it is mutating; candidates invalidated by an earlier
/// application are skipped.
pub(crate) fn run(graph: &mut Graph, options: &OptimizeOptions) -> OptimizeReport {
    let report = OptimizeReport {
        transpose_pairs_removed: collapse_transpose_pairs(graph, options),
        transposes_fused: fuse_transpose_into_matmul(graph),
        tensors_dropped: cleanup_unused_tensors(graph),
    };
    info!(
        "optimize: removed {} transpose pair(s), fused {} transpose(s), dropped {} tensor(s)",
        report.transpose_pairs_removed, report.transposes_fused, report.tensors_dropped
    );
    report
}

/// `b` undoes `a`: `a[b[i]] == i` for every axis.
fn is_inverse_perm(a: &[usize], b: &[usize]) -> bool {
    a.len() == b.len() && b.iter().enumerate().all(|(i, &axis)| a.get(axis) == Some(&i))
}

/// The permutation swaps the last two axes and keeps every other axis in
/// place.
fn swaps_last_two_only(perm: &[usize]) -> bool {
    let n = perm.len();
    n >= 2
        && perm[n - 2] == n - 1
        && perm[n - 1] == n - 2
        && perm[..n - 2].iter().enumerate().all(|(i, &axis)| axis == i)
}

fn collapse_transpose_pairs(graph: &mut Graph, options: &OptimizeOptions) -> usize {
    let mut matches: Vec<(OpId, OpId)> = Vec::new();
    let mut claimed: HashSet<OpId> = HashSet::new();
    for op in graph.operators() {
        let OpKind::Transpose(first) = op.kind() else {
            continue;
        };
        if claimed.contains(&op.guid()) {
            continue;
        }
        for &succ in op.successors() {
            if succ == op.guid() || claimed.contains(&succ) {
                continue;
            }
            let OpKind::Transpose(second) = graph.op(succ).kind() else {
                continue;
            };
            let matched = if options.collapse_equal_perms {
                first.perm == second.perm
            } else {
                is_inverse_perm(&first.perm, &second.perm)
            };
            if matched {
                matches.push((op.guid(), succ));
                claimed.insert(op.guid());
                claimed.insert(succ);
                break;
            }
        }
    }
    let mut removed = 0;
    for (first, second) in matches {
        if collapse_pair(graph, first, second) {
            removed += 1;
        }
    }
    removed
}

/// Remove the pair `first -> second`, rerouting every consumer of the
/// second transpose's output to the first transpose's input.
fn collapse_pair(graph: &mut Graph, first: OpId, second: OpId) -> bool {
    let (Some(first_op), Some(second_op)) = (graph.get_op(first), graph.get_op(second)) else {
        return false;
    };
    if !first_op.successors().contains(&second) {
        return false;
    }
    let input = first_op.inputs()[0];
    let mid = first_op.outputs()[0];
    let output = second_op.outputs()[0];
    let mid_targets = graph.tensor(mid).targets();
    if mid_targets.len() != 1 || mid_targets[0] != second {
        warn!("optimize: transpose {first} output has other consumers, skipping pair");
        return false;
    }
    let consumers: Vec<OpId> = graph.tensor(output).targets().to_vec();
    for consumer in consumers {
        graph.replace_op_input(consumer, output, input);
    }
    graph.remove_op(second);
    graph.remove_op(first);
    true
}

fn fuse_transpose_into_matmul(graph: &mut Graph) -> usize {
    let mut matches: Vec<(OpId, OpId)> = Vec::new();
    for op in graph.operators() {
        let OpKind::Transpose(attrs) = op.kind() else {
            continue;
        };
        if !swaps_last_two_only(&attrs.perm) {
            continue;
        }
        for &succ in op.successors() {
            if matches!(graph.op(succ).kind(), OpKind::Matmul(_)) {
                matches.push((op.guid(), succ));
                break;
            }
        }
    }
    let mut fused = 0;
    for (transpose, matmul) in matches {
        if fuse_one(graph, transpose, matmul) {
            fused += 1;
        }
    }
    fused
}

/// Fold one last-two-axes transpose into the matmul consuming it, toggling
/// the flag of whichever operand the transpose fed.
fn fuse_one(graph: &mut Graph, transpose: OpId, matmul: OpId) -> bool {
    let (Some(transpose_op), Some(matmul_op)) = (graph.get_op(transpose), graph.get_op(matmul))
    else {
        return false;
    };
    if !matches!(transpose_op.kind(), OpKind::Transpose(_))
        || !matches!(matmul_op.kind(), OpKind::Matmul(_))
    {
        return false;
    }
    let t_in = transpose_op.inputs()[0];
    let t_out = transpose_op.outputs()[0];
    let t_out_targets = graph.tensor(t_out).targets();
    if t_out_targets.len() != 1 || t_out_targets[0] != matmul {
        warn!("optimize: transpose {transpose} output has other consumers, skipping fusion");
        return false;
    }
    let feeds_a = matmul_op.inputs()[0] == t_out;
    let feeds_b = matmul_op.inputs()[1] == t_out;
    if !feeds_a && !feeds_b {
        return false;
    }
    if let OpKind::Matmul(attrs) = graph.op_mut(matmul).kind_mut() {
        if feeds_a {
            attrs.trans_a = !attrs.trans_a;
        }
        if feeds_b {
            attrs.trans_b = !attrs.trans_b;
        }
    }
    graph.replace_op_input(matmul, t_out, t_in);
    graph.remove_op(transpose);
    true
}

/// Drop tensors that no surviving operator reads or writes.
fn cleanup_unused_tensors(graph: &mut Graph) -> usize {
    let mut referenced: HashSet<TensorId> = HashSet::new();
    for op in graph.operators() {
        referenced.extend(op.inputs().iter().copied());
        referenced.extend(op.outputs().iter().copied());
    }
    let unused: Vec<TensorId> = graph
        .tensors()
        .map(|t| t.fuid())
        .filter(|fuid| !referenced.contains(fuid))
        .collect();
    for fuid in &unused {
        graph.drop_tensor(*fuid);
    }
    unused.len()
}
