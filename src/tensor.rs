use std::fmt;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

use serde::{Deserialize, Serialize};

use crate::ops::OpId;
use crate::runtime::{Blob, Runtime};
use crate::shape::{element_count, Shape};

static NEXT_FUID: AtomicU64 = AtomicU64::new(0);

/// Stable tensor identifier, monotonically assigned for the whole process.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct TensorId(u64);

impl TensorId {
    fn next() -> Self {
        TensorId(NEXT_FUID.fetch_add(1, Ordering::Relaxed))
    }

    pub fn raw(self) -> u64 {
        self.0
    }
}

impl fmt::Display for TensorId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// Element type. Float32 is the canonical compute type; the arena alignment
/// is the width of the largest variant.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum DType {
    Float32,
    Int32,
    Int64,
    UInt8,
}

impl DType {
    pub fn size_in_bytes(self) -> usize {
        match self {
            DType::Float32 => 4,
            DType::Int32 => 4,
            DType::Int64 => 8,
            DType::UInt8 => 1,
        }
    }
}

/// A shaped, typed node of the dataflow graph. Connectivity to operators is
/// expressed through ids; the owning graph keeps both sides of every link
/// in step.
pub struct Tensor {
    fuid: TensorId,
    shape: Shape,
    dtype: DType,
    source: Option<OpId>,
    targets: Vec<OpId>,
    blob: Option<Blob>,
    runtime: Arc<dyn Runtime>,
}

impl Tensor {
    /// Create a tensor that is not yet owned by any graph. Hand it to
    /// `Graph::adopt_tensor` to put it under graph ownership.
    pub fn detached(shape: Shape, dtype: DType, runtime: Arc<dyn Runtime>) -> Self {
        Self {
            fuid: TensorId::next(),
            shape,
            dtype,
            source: None,
            targets: Vec::new(),
            blob: None,
            runtime,
        }
    }

    pub fn fuid(&self) -> TensorId {
        self.fuid
    }

    pub fn shape(&self) -> &[usize] {
        &self.shape
    }

    pub fn dtype(&self) -> DType {
        self.dtype
    }

    pub fn rank(&self) -> usize {
        self.shape.len()
    }

    pub fn numel(&self) -> usize {
        element_count(&self.shape)
    }

    pub fn bytes(&self) -> usize {
        self.numel() * self.dtype.size_in_bytes()
    }

    /// The operator producing this tensor, if any.
    pub fn source(&self) -> Option<OpId> {
        self.source
    }

    /// Consuming operators in first-insertion order.
    pub fn targets(&self) -> &[OpId] {
        &self.targets
    }

    pub fn blob(&self) -> Option<&Blob> {
        self.blob.as_ref()
    }

    pub fn runtime(&self) -> &Arc<dyn Runtime> {
        &self.runtime
    }

    pub(crate) fn set_source(&mut self, source: Option<OpId>) {
        self.source = source;
    }

    pub(crate) fn add_target(&mut self, op: OpId) {
        if !self.targets.contains(&op) {
            self.targets.push(op);
        }
    }

    pub(crate) fn remove_target(&mut self, op: OpId) {
        self.targets.retain(|id| *id != op);
    }

    pub(crate) fn set_shape(&mut self, shape: Shape) {
        assert!(
            self.blob.is_none(),
            "set_shape: shape of tensor {} is frozen once a data blob is bound",
            self.fuid
        );
        self.shape = shape;
    }

    pub(crate) fn bind_blob(&mut self, blob: Blob) {
        self.blob = Some(blob);
    }
}

impl fmt::Debug for Tensor {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Tensor")
            .field("fuid", &self.fuid)
            .field("shape", &self.shape)
            .field("dtype", &self.dtype)
            .field("source", &self.source)
            .field("targets", &self.targets)
            .field("bound", &self.blob.is_some())
            .finish()
    }
}

impl fmt::Display for Tensor {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "Tensor {}, shape={:?}, dtype={:?}, source=",
            self.fuid, self.shape, self.dtype
        )?;
        match self.source {
            Some(op) => write!(f, "{op}")?,
            None => write!(f, "none")?,
        }
        write!(f, ", targets=[")?;
        for (i, target) in self.targets.iter().enumerate() {
            if i > 0 {
                write!(f, ",")?;
            }
            write!(f, "{target}")?;
        }
        write!(f, "]")
    }
}
