use thiserror::Error;

use crate::ops::OpId;
use crate::tensor::TensorId;

#[derive(Debug, Error, Clone)]
pub enum GraphError {
    #[error("{op}: shapes cannot be reconciled: {lhs:?} vs {rhs:?}")]
    ShapeMismatch {
        op: &'static str,
        lhs: Vec<usize>,
        rhs: Vec<usize>,
    },
    #[error("{op}: axis {axis} out of range for rank {rank}")]
    AxisOutOfRange {
        op: &'static str,
        axis: isize,
        rank: usize,
    },
    #[error("topo_sort: cycle detected, {remaining} operators cannot be scheduled")]
    CycleDetected { remaining: usize },
    #[error("shape_infer: operator {guid} ({kind}) returned no shape")]
    InferenceFailed { guid: OpId, kind: &'static str },
    #[error("{op}: backing buffer of {bytes} bytes could not be obtained")]
    AllocationFailed { op: &'static str, bytes: usize },
    #[error("tensor {fuid} belongs to runtime {actual}, this graph runs on {expected}")]
    RuntimeMismatch {
        fuid: TensorId,
        expected: String,
        actual: String,
    },
    #[error("invariant violated: {msg}")]
    InvariantViolated { msg: String },
}

pub type Result<T> = std::result::Result<T, GraphError>;
