use std::fmt;
use std::sync::atomic::{AtomicU64, Ordering};

use serde::{Deserialize, Serialize};

use crate::error::{GraphError, Result};
use crate::shape::{broadcast_shape, Shape};
use crate::tensor::{Tensor, TensorId};

static NEXT_GUID: AtomicU64 = AtomicU64::new(0);

/// Stable operator identifier, monotonically assigned for the whole process.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct OpId(u64);

impl OpId {
    fn next() -> Self {
        OpId(NEXT_GUID.fetch_add(1, Ordering::Relaxed))
    }

    pub fn raw(self) -> u64 {
        self.0
    }
}

impl fmt::Display for OpId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct MatmulAttrs {
    pub trans_a: bool,
    pub trans_b: bool,
    /// Effective matrix dimensions, cached by the latest shape inference.
    pub m: usize,
    pub n: usize,
    pub k: usize,
}

/// Batched matmul outcome: output shape plus the effective matrix dims.
pub(crate) struct MatmulDims {
    pub(crate) out: Shape,
    pub(crate) m: usize,
    pub(crate) n: usize,
    pub(crate) k: usize,
}

impl MatmulAttrs {
    pub fn new(trans_a: bool, trans_b: bool) -> Self {
        Self {
            trans_a,
            trans_b,
            m: 0,
            n: 0,
            k: 0,
        }
    }

    /// Output shape of `A x B` under the transpose flags. The last two axes
    /// are the matrix, everything before them broadcasts as batch dims.
    pub(crate) fn infer(&self, a: &[usize], b: &[usize]) -> Result<MatmulDims> {
        if a.len() < 2 || b.len() < 2 {
            return Err(GraphError::ShapeMismatch {
                op: "matmul",
                lhs: a.to_vec(),
                rhs: b.to_vec(),
            });
        }
        let (mut m, mut k_a) = (a[a.len() - 2], a[a.len() - 1]);
        if self.trans_a {
            std::mem::swap(&mut m, &mut k_a);
        }
        let (mut k_b, mut n) = (b[b.len() - 2], b[b.len() - 1]);
        if self.trans_b {
            std::mem::swap(&mut k_b, &mut n);
        }
        if k_a != k_b {
            return Err(GraphError::ShapeMismatch {
                op: "matmul",
                lhs: a.to_vec(),
                rhs: b.to_vec(),
            });
        }
        let mut out = broadcast_shape(&a[..a.len() - 2], &b[..b.len() - 2], "matmul")?;
        out.push(m);
        out.push(n);
        Ok(MatmulDims { out, m, n, k: k_a })
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct TransposeAttrs {
    pub perm: Vec<usize>,
}

impl TransposeAttrs {
    /// Build transpose attributes, rejecting anything that is not a
    /// permutation of `[0, perm.len())`.
    pub fn new(perm: Vec<usize>) -> Result<Self> {
        let rank = perm.len();
        let mut seen = vec![false; rank];
        for &axis in &perm {
            if axis >= rank {
                return Err(GraphError::AxisOutOfRange {
                    op: "transpose",
                    axis: axis as isize,
                    rank,
                });
            }
            if seen[axis] {
                return Err(GraphError::ShapeMismatch {
                    op: "transpose",
                    lhs: perm.clone(),
                    rhs: (0..rank).collect(),
                });
            }
            seen[axis] = true;
        }
        Ok(Self { perm })
    }

    pub(crate) fn infer(&self, input: &[usize]) -> Result<Shape> {
        if self.perm.len() != input.len() {
            return Err(GraphError::ShapeMismatch {
                op: "transpose",
                lhs: self.perm.clone(),
                rhs: input.to_vec(),
            });
        }
        Ok(self.perm.iter().map(|&axis| input[axis]).collect())
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ConcatAttrs {
    /// Concatenation axis, already normalized into `[0, rank)`.
    pub dim: usize,
}

impl ConcatAttrs {
    /// Shapes must share rank and agree on every axis except `dim`, which
    /// sums across the inputs.
    pub(crate) fn infer(&self, shapes: &[&[usize]]) -> Result<Shape> {
        let first = shapes.first().ok_or(GraphError::ShapeMismatch {
            op: "concat",
            lhs: Vec::new(),
            rhs: Vec::new(),
        })?;
        let rank = first.len();
        if self.dim >= rank {
            return Err(GraphError::AxisOutOfRange {
                op: "concat",
                axis: self.dim as isize,
                rank,
            });
        }
        let mut out = first.to_vec();
        for shape in &shapes[1..] {
            if shape.len() != rank {
                return Err(GraphError::ShapeMismatch {
                    op: "concat",
                    lhs: first.to_vec(),
                    rhs: shape.to_vec(),
                });
            }
            for axis in 0..rank {
                if axis != self.dim && shape[axis] != first[axis] {
                    return Err(GraphError::ShapeMismatch {
                        op: "concat",
                        lhs: first.to_vec(),
                        rhs: shape.to_vec(),
                    });
                }
            }
            out[self.dim] += shape[self.dim];
        }
        Ok(out)
    }
}

/// Operator kind tag with per-kind attributes. Rewrite rules and shape
/// inference dispatch by matching on the tag.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub enum OpKind {
    Matmul(MatmulAttrs),
    Transpose(TransposeAttrs),
    Concat(ConcatAttrs),
}

impl OpKind {
    pub fn name(&self) -> &'static str {
        match self {
            OpKind::Matmul(_) => "Matmul",
            OpKind::Transpose(_) => "Transpose",
            OpKind::Concat(_) => "Concat",
        }
    }

    /// Derive output shapes from the input tensors. `None` signals an
    /// inference failure the caller treats as fatal.
    pub fn infer_shape(&self, inputs: &[&Tensor]) -> Option<Vec<Shape>> {
        match self {
            OpKind::Matmul(attrs) => {
                if inputs.len() != 2 {
                    return None;
                }
                attrs
                    .infer(inputs[0].shape(), inputs[1].shape())
                    .ok()
                    .map(|dims| vec![dims.out])
            }
            OpKind::Transpose(attrs) => {
                if inputs.len() != 1 {
                    return None;
                }
                attrs.infer(inputs[0].shape()).ok().map(|shape| vec![shape])
            }
            OpKind::Concat(attrs) => {
                let shapes: Vec<&[usize]> = inputs.iter().map(|t| t.shape()).collect();
                attrs.infer(&shapes).ok().map(|shape| vec![shape])
            }
        }
    }
}

/// A graph node producing output tensors from input tensors. All links are
/// ids into the owning graph's arenas; the graph maintains both directions
/// of every edge.
#[derive(Debug, Clone)]
pub struct Operator {
    guid: OpId,
    kind: OpKind,
    inputs: Vec<TensorId>,
    outputs: Vec<TensorId>,
    predecessors: Vec<OpId>,
    successors: Vec<OpId>,
}

impl Operator {
    pub(crate) fn new(kind: OpKind, inputs: Vec<TensorId>, outputs: Vec<TensorId>) -> Self {
        Self {
            guid: OpId::next(),
            kind,
            inputs,
            outputs,
            predecessors: Vec::new(),
            successors: Vec::new(),
        }
    }

    pub fn guid(&self) -> OpId {
        self.guid
    }

    pub fn kind(&self) -> &OpKind {
        &self.kind
    }

    pub(crate) fn kind_mut(&mut self) -> &mut OpKind {
        &mut self.kind
    }

    pub fn inputs(&self) -> &[TensorId] {
        &self.inputs
    }

    pub fn outputs(&self) -> &[TensorId] {
        &self.outputs
    }

    /// Producing operators in first-insertion order.
    pub fn predecessors(&self) -> &[OpId] {
        &self.predecessors
    }

    /// Consuming operators in first-insertion order.
    pub fn successors(&self) -> &[OpId] {
        &self.successors
    }

    pub(crate) fn add_predecessor(&mut self, op: OpId) {
        if !self.predecessors.contains(&op) {
            self.predecessors.push(op);
        }
    }

    pub(crate) fn remove_predecessor(&mut self, op: OpId) {
        self.predecessors.retain(|id| *id != op);
    }

    pub(crate) fn add_successor(&mut self, op: OpId) {
        if !self.successors.contains(&op) {
            self.successors.push(op);
        }
    }

    pub(crate) fn remove_successor(&mut self, op: OpId) {
        self.successors.retain(|id| *id != op);
    }

    /// Swap `old` for `new` in the input list, all occurrences.
    pub(crate) fn replace_input(&mut self, old: TensorId, new: TensorId) {
        for input in &mut self.inputs {
            if *input == old {
                *input = new;
            }
        }
    }
}

impl fmt::Display for Operator {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match &self.kind {
            OpKind::Matmul(attrs) => write!(
                f,
                "Matmul[{}]([{},{}],A={},B={},C={},mnk=[{},{},{}])",
                self.guid,
                if attrs.trans_a { "A^T" } else { "A" },
                if attrs.trans_b { "B^T" } else { "B" },
                self.inputs[0],
                self.inputs[1],
                self.outputs[0],
                attrs.m,
                attrs.n,
                attrs.k
            ),
            OpKind::Transpose(attrs) => write!(
                f,
                "Transpose[{}](perm={:?},input={},output={})",
                self.guid, attrs.perm, self.inputs[0], self.outputs[0]
            ),
            OpKind::Concat(attrs) => {
                write!(f, "Concat[{}](dim={},inputs=[", self.guid, attrs.dim)?;
                for (i, input) in self.inputs.iter().enumerate() {
                    if i > 0 {
                        write!(f, ",")?;
                    }
                    write!(f, "{input}")?;
                }
                write!(f, "],output={})", self.outputs[0])
            }
        }
    }
}
