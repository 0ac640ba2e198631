use std::collections::{BTreeMap, HashSet};
use std::fmt;
use std::sync::Arc;

use log::info;
use serde::{Deserialize, Serialize};

use crate::allocator::Allocator;
use crate::error::{GraphError, Result};
use crate::ops::{ConcatAttrs, MatmulAttrs, OpId, OpKind, Operator, TransposeAttrs};
use crate::rewrite::{self, OptimizeOptions, OptimizeReport};
use crate::runtime::{Blob, Runtime};
use crate::shape::{normalize_axis, Shape};
use crate::tensor::{DType, Tensor, TensorId};

/// Offset assignment for one tensor in a planned arena.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct MemoryPlanEntry {
    pub fuid: TensorId,
    pub offset: usize,
    pub bytes: usize,
}

/// Outcome of `Graph::data_malloc`: every tensor's placement in the single
/// arena buffer, plus the footprint the buffer was sized with.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct MemoryPlan {
    pub entries: Vec<MemoryPlanEntry>,
    pub peak_bytes: usize,
    pub used_bytes: usize,
}

impl MemoryPlan {
    /// Stable fingerprint of the planned layout.
    pub fn digest(&self) -> Result<String> {
        let payload =
            serde_json::to_vec(self).map_err(|err| GraphError::InvariantViolated {
                msg: format!("failed to serialize memory plan: {err}"),
            })?;
        let mut hasher = blake3::Hasher::new();
        hasher.update(&payload);
        Ok(hasher.finalize().to_hex().to_string())
    }
}

/// Sole owner of the tensor and operator arenas. Every cross-link between
/// nodes is an id into these maps, and every mutation below keeps both
/// directions of each link consistent.
pub struct Graph {
    runtime: Arc<dyn Runtime>,
    tensors: BTreeMap<TensorId, Tensor>,
    nodes: BTreeMap<OpId, Operator>,
    /// Operator execution order: insertion order until `topo_sort` runs.
    order: Vec<OpId>,
    allocator: Allocator,
    sorted: bool,
}

impl Graph {
    pub fn new(runtime: Arc<dyn Runtime>) -> Self {
        Self {
            allocator: Allocator::new(Arc::clone(&runtime)),
            runtime,
            tensors: BTreeMap::new(),
            nodes: BTreeMap::new(),
            order: Vec::new(),
            sorted: false,
        }
    }

    pub fn runtime(&self) -> &Arc<dyn Runtime> {
        &self.runtime
    }

    pub fn allocator(&self) -> &Allocator {
        &self.allocator
    }

    pub fn tensor_count(&self) -> usize {
        self.tensors.len()
    }

    pub fn op_count(&self) -> usize {
        self.nodes.len()
    }

    /// Tensors in creation order.
    pub fn tensors(&self) -> impl Iterator<Item = &Tensor> {
        self.tensors.values()
    }

    /// Operators in execution order.
    pub fn operators(&self) -> impl Iterator<Item = &Operator> {
        self.order.iter().map(move |guid| &self.nodes[guid])
    }

    pub fn get_tensor(&self, fuid: TensorId) -> Option<&Tensor> {
        self.tensors.get(&fuid)
    }

    pub fn tensor(&self, fuid: TensorId) -> &Tensor {
        self.tensors
            .get(&fuid)
            .unwrap_or_else(|| panic!("tensor {fuid} is not owned by this graph"))
    }

    pub fn get_op(&self, guid: OpId) -> Option<&Operator> {
        self.nodes.get(&guid)
    }

    pub fn op(&self, guid: OpId) -> &Operator {
        self.nodes
            .get(&guid)
            .unwrap_or_else(|| panic!("operator {guid} is not owned by this graph"))
    }

    pub(crate) fn op_mut(&mut self, guid: OpId) -> &mut Operator {
        self.nodes
            .get_mut(&guid)
            .unwrap_or_else(|| panic!("operator {guid} is not owned by this graph"))
    }

    /// Create a tensor owned by this graph.
    pub fn add_tensor(&mut self, shape: Shape, dtype: DType) -> TensorId {
        let tensor = Tensor::detached(shape, dtype, Arc::clone(&self.runtime));
        let fuid = tensor.fuid();
        self.tensors.insert(fuid, tensor);
        fuid
    }

    /// Take ownership of a tensor created with `Tensor::detached`. The
    /// tensor must live on the same runtime as the graph.
    pub fn adopt_tensor(&mut self, tensor: Tensor) -> Result<TensorId> {
        if !Arc::ptr_eq(tensor.runtime(), &self.runtime) {
            return Err(GraphError::RuntimeMismatch {
                fuid: tensor.fuid(),
                expected: self.runtime.name().to_string(),
                actual: tensor.runtime().name().to_string(),
            });
        }
        let fuid = tensor.fuid();
        self.tensors.insert(fuid, tensor);
        Ok(fuid)
    }

    /// Tensors with no producing operator.
    pub fn inputs(&self) -> Vec<TensorId> {
        self.tensors
            .values()
            .filter(|t| t.source().is_none())
            .map(|t| t.fuid())
            .collect()
    }

    /// Tensors with no consuming operator.
    pub fn outputs(&self) -> Vec<TensorId> {
        self.tensors
            .values()
            .filter(|t| t.targets().is_empty())
            .map(|t| t.fuid())
            .collect()
    }

    /// Add a matmul and create its output tensor from the inferred shape.
    pub fn add_matmul(
        &mut self,
        a: TensorId,
        b: TensorId,
        trans_a: bool,
        trans_b: bool,
    ) -> Result<OpId> {
        let mut attrs = MatmulAttrs::new(trans_a, trans_b);
        let dims = attrs.infer(self.tensor(a).shape(), self.tensor(b).shape())?;
        attrs.m = dims.m;
        attrs.n = dims.n;
        attrs.k = dims.k;
        let dtype = self.tensor(a).dtype();
        let out = self.add_tensor(dims.out, dtype);
        Ok(self.connect(Operator::new(OpKind::Matmul(attrs), vec![a, b], vec![out])))
    }

    /// Add a matmul writing to a caller-supplied output tensor. The output
    /// shape is reconciled by `shape_infer`.
    pub fn add_matmul_with_output(
        &mut self,
        a: TensorId,
        b: TensorId,
        out: TensorId,
        trans_a: bool,
        trans_b: bool,
    ) -> Result<OpId> {
        let attrs = MatmulAttrs::new(trans_a, trans_b);
        Ok(self.connect(Operator::new(OpKind::Matmul(attrs), vec![a, b], vec![out])))
    }

    /// Add a transpose and create its output tensor from the inferred shape.
    pub fn add_transpose(&mut self, input: TensorId, perm: Vec<usize>) -> Result<OpId> {
        let attrs = TransposeAttrs::new(perm)?;
        let out_shape = attrs.infer(self.tensor(input).shape())?;
        let dtype = self.tensor(input).dtype();
        let out = self.add_tensor(out_shape, dtype);
        Ok(self.connect(Operator::new(
            OpKind::Transpose(attrs),
            vec![input],
            vec![out],
        )))
    }

    /// Add a transpose writing to a caller-supplied output tensor.
    pub fn add_transpose_with_output(
        &mut self,
        input: TensorId,
        perm: Vec<usize>,
        out: TensorId,
    ) -> Result<OpId> {
        let attrs = TransposeAttrs::new(perm)?;
        Ok(self.connect(Operator::new(
            OpKind::Transpose(attrs),
            vec![input],
            vec![out],
        )))
    }

    /// Add a concat and create its output tensor from the inferred shape.
    /// `dim` may be negative and is normalized against the first input.
    pub fn add_concat(&mut self, inputs: &[TensorId], dim: isize) -> Result<OpId> {
        assert!(!inputs.is_empty(), "add_concat: at least one input required");
        let rank = self.tensor(inputs[0]).rank();
        let dim = normalize_axis(dim, rank, "concat")?;
        let attrs = ConcatAttrs { dim };
        let shapes: Vec<&[usize]> = inputs.iter().map(|id| self.tensor(*id).shape()).collect();
        let out_shape = attrs.infer(&shapes)?;
        let dtype = self.tensor(inputs[0]).dtype();
        let out = self.add_tensor(out_shape, dtype);
        Ok(self.connect(Operator::new(
            OpKind::Concat(attrs),
            inputs.to_vec(),
            vec![out],
        )))
    }

    /// Add a concat writing to a caller-supplied output tensor.
    pub fn add_concat_with_output(
        &mut self,
        inputs: &[TensorId],
        dim: isize,
        out: TensorId,
    ) -> Result<OpId> {
        assert!(!inputs.is_empty(), "add_concat: at least one input required");
        let rank = self.tensor(inputs[0]).rank();
        let dim = normalize_axis(dim, rank, "concat")?;
        Ok(self.connect(Operator::new(
            OpKind::Concat(ConcatAttrs { dim }),
            inputs.to_vec(),
            vec![out],
        )))
    }

    /// Append an operator and wire every edge it induces: input targets,
    /// output sources, and the operator adjacency both ways.
    fn connect(&mut self, mut op: Operator) -> OpId {
        self.sorted = false;
        let guid = op.guid();
        for idx in 0..op.inputs().len() {
            let input = op.inputs()[idx];
            let source = {
                let tensor = self
                    .tensors
                    .get_mut(&input)
                    .unwrap_or_else(|| panic!("tensor {input} is not owned by this graph"));
                tensor.add_target(guid);
                tensor.source()
            };
            if let Some(pred) = source {
                self.op_mut(pred).add_successor(guid);
                op.add_predecessor(pred);
            }
        }
        for idx in 0..op.outputs().len() {
            let output = op.outputs()[idx];
            let targets = {
                let tensor = self
                    .tensors
                    .get_mut(&output)
                    .unwrap_or_else(|| panic!("tensor {output} is not owned by this graph"));
                tensor.set_source(Some(guid));
                tensor.targets().to_vec()
            };
            for succ in targets {
                op.add_successor(succ);
                self.op_mut(succ).add_predecessor(guid);
            }
        }
        self.order.push(guid);
        self.nodes.insert(guid, op);
        guid
    }

    /// Remove an operator, severing every edge it participates in. Its
    /// tensors stay in the graph.
    pub fn remove_op(&mut self, guid: OpId) {
        let Some(op) = self.nodes.remove(&guid) else {
            return;
        };
        for &input in op.inputs() {
            if let Some(tensor) = self.tensors.get_mut(&input) {
                tensor.remove_target(guid);
            }
        }
        for &output in op.outputs() {
            if let Some(tensor) = self.tensors.get_mut(&output) {
                tensor.set_source(None);
            }
        }
        for &pred in op.predecessors() {
            if let Some(node) = self.nodes.get_mut(&pred) {
                node.remove_successor(guid);
            }
        }
        for &succ in op.successors() {
            if let Some(node) = self.nodes.get_mut(&succ) {
                node.remove_predecessor(guid);
            }
        }
        self.order.retain(|id| *id != guid);
    }

    /// Drop a tensor that no operator references anymore.
    pub(crate) fn drop_tensor(&mut self, fuid: TensorId) {
        self.tensors.remove(&fuid);
    }

    /// Rewire `op` to read `new` wherever it read `old`, keeping target
    /// sets and operator adjacency consistent on both sides.
    pub(crate) fn replace_op_input(&mut self, guid: OpId, old: TensorId, new: TensorId) {
        {
            let op = self.op_mut(guid);
            if !op.inputs().contains(&old) {
                return;
            }
            op.replace_input(old, new);
        }
        if let Some(tensor) = self.tensors.get_mut(&old) {
            tensor.remove_target(guid);
        }
        if let Some(tensor) = self.tensors.get_mut(&new) {
            tensor.add_target(guid);
        }
        let old_source = self.tensors.get(&old).and_then(|t| t.source());
        let new_source = self.tensors.get(&new).and_then(|t| t.source());
        if let Some(src) = old_source {
            let still_linked = self.nodes[&guid]
                .inputs()
                .iter()
                .any(|id| self.tensors.get(id).and_then(|t| t.source()) == Some(src));
            if !still_linked {
                if let Some(node) = self.nodes.get_mut(&src) {
                    node.remove_successor(guid);
                }
                self.op_mut(guid).remove_predecessor(src);
            }
        }
        if let Some(src) = new_source {
            if src != guid {
                if let Some(node) = self.nodes.get_mut(&src) {
                    node.add_successor(guid);
                }
                self.op_mut(guid).add_predecessor(src);
            }
        }
        self.sorted = false;
    }

    /// Sort operators topologically, stably with respect to insertion
    /// order: any scan moves every ready operator, in encounter order.
    pub fn topo_sort(&mut self) -> Result<()> {
        if self.sorted {
            return Ok(());
        }
        let mut sorted: Vec<OpId> = Vec::with_capacity(self.order.len());
        let mut placed: HashSet<OpId> = HashSet::with_capacity(self.order.len());
        while sorted.len() < self.order.len() {
            let mut modified = false;
            for &guid in &self.order {
                if placed.contains(&guid) {
                    continue;
                }
                let ready = self.nodes[&guid].inputs().iter().all(|input| {
                    match self.tensors[input].source() {
                        None => true,
                        Some(src) => placed.contains(&src),
                    }
                });
                if ready {
                    sorted.push(guid);
                    placed.insert(guid);
                    modified = true;
                }
            }
            if !modified {
                return Err(GraphError::CycleDetected {
                    remaining: self.order.len() - sorted.len(),
                });
            }
        }
        self.order = sorted;
        self.sorted = true;
        Ok(())
    }

    /// Re-derive every operator's output shapes in execution order,
    /// updating output tensors in place. Assumes a prior `topo_sort`.
    pub fn shape_infer(&mut self) -> Result<()> {
        for idx in 0..self.order.len() {
            let guid = self.order[idx];
            let (shapes, matmul_dims) = {
                let op = &self.nodes[&guid];
                let inputs: Vec<&Tensor> =
                    op.inputs().iter().map(|id| &self.tensors[id]).collect();
                let shapes =
                    op.kind()
                        .infer_shape(&inputs)
                        .ok_or_else(|| GraphError::InferenceFailed {
                            guid,
                            kind: op.kind().name(),
                        })?;
                let dims = match op.kind() {
                    OpKind::Matmul(attrs) => {
                        attrs.infer(inputs[0].shape(), inputs[1].shape()).ok()
                    }
                    _ => None,
                };
                (shapes, dims)
            };
            if let Some(dims) = matmul_dims {
                if let OpKind::Matmul(attrs) = self.op_mut(guid).kind_mut() {
                    attrs.m = dims.m;
                    attrs.n = dims.n;
                    attrs.k = dims.k;
                }
            }
            let outputs = self.nodes[&guid].outputs().to_vec();
            if shapes.len() != outputs.len() {
                return Err(GraphError::InvariantViolated {
                    msg: format!(
                        "operator {guid} produced {} shapes for {} outputs",
                        shapes.len(),
                        outputs.len()
                    ),
                });
            }
            for (shape, out) in shapes.into_iter().zip(outputs) {
                let tensor = self
                    .tensors
                    .get_mut(&out)
                    .unwrap_or_else(|| panic!("tensor {out} is not owned by this graph"));
                if tensor.shape() != shape.as_slice() {
                    tensor.set_shape(shape);
                }
            }
        }
        Ok(())
    }

    /// Assign an arena offset to every tensor, materialize the backing
    /// buffer sized by the peak footprint, and bind each tensor's blob.
    pub fn data_malloc(&mut self) -> Result<MemoryPlan> {
        self.topo_sort()?;
        let mut entries = Vec::with_capacity(self.tensors.len());
        for (fuid, tensor) in &self.tensors {
            let bytes = tensor.bytes();
            let offset = self.allocator.alloc(bytes);
            entries.push(MemoryPlanEntry {
                fuid: *fuid,
                offset,
                bytes,
            });
        }
        let buffer = self.allocator.materialize()?;
        for entry in &entries {
            let tensor = self
                .tensors
                .get_mut(&entry.fuid)
                .unwrap_or_else(|| panic!("tensor {} is not owned by this graph", entry.fuid));
            tensor.bind_blob(Blob::new(buffer.clone(), entry.offset, entry.bytes));
        }
        info!(
            "data_malloc: {} tensors placed, used {} bytes, peak {} bytes",
            entries.len(),
            self.allocator.used(),
            self.allocator.peak()
        );
        Ok(MemoryPlan {
            entries,
            peak_bytes: self.allocator.peak(),
            used_bytes: self.allocator.used(),
        })
    }

    /// Run the rewrite driver with default options.
    pub fn optimize(&mut self) -> OptimizeReport {
        self.optimize_with(&OptimizeOptions::default())
    }

    /// Run the rewrite driver with explicit options.
    pub fn optimize_with(&mut self, options: &OptimizeOptions) -> OptimizeReport {
        rewrite::run(self, options)
    }

    /// Verify connectivity and uniqueness invariants. Tensor and operator
    /// ids are map keys here, so id collisions are unrepresentable; what is
    /// checked is that every cross-link lands on an owned node and that both
    /// directions of each link agree.
    pub fn check_valid(&self) -> Result<()> {
        for tensor in self.tensors.values() {
            let fuid = tensor.fuid();
            if tensor.source().is_none() && tensor.targets().is_empty() {
                return Err(invariant(format!(
                    "tensor {fuid} has neither source nor targets"
                )));
            }
            for &target in tensor.targets() {
                let Some(op) = self.nodes.get(&target) else {
                    return Err(invariant(format!(
                        "tensor {fuid} targets operator {target} which is not in the graph"
                    )));
                };
                if !op.inputs().contains(&fuid) {
                    return Err(invariant(format!(
                        "operator {target} does not list tensor {fuid} as input"
                    )));
                }
            }
            if let Some(source) = tensor.source() {
                let Some(op) = self.nodes.get(&source) else {
                    return Err(invariant(format!(
                        "tensor {fuid} has source {source} which is not in the graph"
                    )));
                };
                if !op.outputs().contains(&fuid) {
                    return Err(invariant(format!(
                        "operator {source} does not list tensor {fuid} as output"
                    )));
                }
            }
        }
        for op in self.nodes.values() {
            let guid = op.guid();
            for &input in op.inputs() {
                let Some(tensor) = self.tensors.get(&input) else {
                    return Err(invariant(format!(
                        "operator {guid} reads tensor {input} which is not in the graph"
                    )));
                };
                if let Some(pred) = tensor.source() {
                    if !op.predecessors().contains(&pred) {
                        return Err(invariant(format!(
                            "operator {guid} is missing predecessor {pred}"
                        )));
                    }
                    if !self.nodes[&pred].successors().contains(&guid) {
                        return Err(invariant(format!(
                            "operator {pred} is missing successor {guid}"
                        )));
                    }
                }
            }
            for &output in op.outputs() {
                let Some(tensor) = self.tensors.get(&output) else {
                    return Err(invariant(format!(
                        "operator {guid} writes tensor {output} which is not in the graph"
                    )));
                };
                if tensor.source() != Some(guid) {
                    return Err(invariant(format!(
                        "tensor {output} does not record operator {guid} as source"
                    )));
                }
                for &succ in tensor.targets() {
                    if !op.successors().contains(&succ) {
                        return Err(invariant(format!(
                            "operator {guid} is missing successor {succ}"
                        )));
                    }
                    let Some(node) = self.nodes.get(&succ) else {
                        return Err(invariant(format!(
                            "tensor {output} targets operator {succ} which is not in the graph"
                        )));
                    };
                    if !node.predecessors().contains(&guid) {
                        return Err(invariant(format!(
                            "operator {succ} is missing predecessor {guid}"
                        )));
                    }
                }
            }
            for &pred in op.predecessors() {
                if !self.nodes.contains_key(&pred) {
                    return Err(invariant(format!(
                        "operator {guid} lists predecessor {pred} which is not in the graph"
                    )));
                }
            }
            for &succ in op.successors() {
                if !self.nodes.contains_key(&succ) {
                    return Err(invariant(format!(
                        "operator {guid} lists successor {succ} which is not in the graph"
                    )));
                }
            }
        }
        if self.order.len() != self.nodes.len() {
            return Err(invariant(format!(
                "execution order tracks {} operators, graph owns {}",
                self.order.len(),
                self.nodes.len()
            )));
        }
        Ok(())
    }
}

fn invariant(msg: String) -> GraphError {
    GraphError::InvariantViolated { msg }
}

impl fmt::Display for Graph {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        writeln!(f, "Graph tensors:")?;
        for tensor in self.tensors.values() {
            writeln!(f, "  {tensor}")?;
        }
        writeln!(f, "Graph operators:")?;
        for op in self.operators() {
            let preds: Vec<u64> = op.predecessors().iter().map(|id| id.raw()).collect();
            let succs: Vec<u64> = op.successors().iter().map(|id| id.raw()).collect();
            writeln!(
                f,
                "  OP {}, pred {:?}, succ {:?}, {op}",
                op.guid(),
                preds,
                succs
            )?;
        }
        Ok(())
    }
}
