//! Graph IR — the emitter context the expansion appends nodes to.
//!
//! A [`Graph`] is an append-only DAG of typed tensor operations. Values are
//! SSA-like: each [`ValueId`] has exactly one producer (or is a parameter)
//! and a statically known [`Shape`]. `add_node` performs shape/type inference for
//! every operation at emission time, so a malformed emitter call fails
//! immediately with `InvalidArgument` instead of producing a graph the
//! downstream compiler would reject.
//!
//! Nodes are appended in SSA order (operands always precede their users),
//! which makes insertion order a valid evaluation order.

use std::fmt;

use crate::types::{DType, ExpandError, ExpandResult, Precision, Shape};

// ── Identifiers ────────────────────────────────────────────────────

/// Unique value (tensor) identifier within a graph.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct ValueId(pub u32);

/// Unique operation identifier within a graph.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct NodeId(pub u32);

// ── Operation kinds ────────────────────────────────────────────────

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum UnaryOp {
    Neg,
    Sqrt,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BinaryOp {
    Add,
    Sub,
    Mul,
    Div,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CompareOp {
    Lt,
    Le,
    Gt,
    Ge,
    Eq,
}

/// The set of primitive operations the emitted graphs are built from.
///
/// Elementwise operands must agree exactly in shape and dtype; every
/// broadcast is an explicit `BroadcastInDim` node emitted by the builder
/// helpers. Slicing operations address the minor-most dimensions, matching
/// the batch-last layout of every tensor in the expansion.
#[derive(Debug, Clone, PartialEq)]
pub enum OpKind {
    /// Graph input.
    Parameter { index: usize },
    /// Rank-0 constant of the given element type.
    ConstantScalar { value: f64, dtype: DType },
    /// S32 indices along `axis` of the given shape.
    Iota { dims: Vec<usize>, axis: usize },
    Unary(UnaryOp),
    Binary(BinaryOp),
    /// Elementwise comparison; result dtype is `Pred`.
    Compare(CompareOp),
    /// `(pred, on_true, on_false)`, elementwise.
    Select,
    /// Element type cast. Pred converts to 0/1.
    Convert { dtype: DType },
    /// Map each input axis to an output axis (strictly increasing map);
    /// size-1 input axes broadcast. The single broadcasting primitive.
    BroadcastInDim { dims: Vec<usize>, dim_map: Vec<usize> },
    /// Sum-reduction over one axis.
    Reduce { axis: usize },
    /// Batched matrix multiplication over the two minor dims.
    Dot {
        transpose_lhs: bool,
        transpose_rhs: bool,
        precision: Precision,
    },
    /// Static slice of the minor-most `starts.len()` dims.
    Slice { starts: Vec<usize>, limits: Vec<usize> },
    /// Static overwrite of the region at `starts` (minor dims) with the
    /// second operand.
    UpdateSlice { starts: Vec<usize> },
    /// Runtime-indexed slice of the minor-most `sizes.len()` dims; the
    /// start operands are S32 scalars, clamped to the valid range.
    DynamicSlice { sizes: Vec<usize> },
    /// Runtime-indexed overwrite; operands are `(base, update, starts...)`.
    DynamicUpdateSlice,
    Reshape { dims: Vec<usize> },
    /// Fixed-trip-count loop. The body's parameters are
    /// `[index: s32[], carried...]`; its outputs must match the carried
    /// shapes. The node's outputs are the final carried values.
    ForEach { trip_count: usize, body: Box<Graph> },
    /// Invoke a module subprogram; multi-output.
    Call { callee: usize },
    /// Opaque custom operation with declared output shapes; what the
    /// expander pattern-matches and replaces.
    CustomOp { target: String },
}

impl OpKind {
    /// Short mnemonic for graph dumps.
    fn mnemonic(&self) -> &str {
        match self {
            OpKind::Parameter { .. } => "parameter",
            OpKind::ConstantScalar { .. } => "constant",
            OpKind::Iota { .. } => "iota",
            OpKind::Unary(UnaryOp::Neg) => "neg",
            OpKind::Unary(UnaryOp::Sqrt) => "sqrt",
            OpKind::Binary(BinaryOp::Add) => "add",
            OpKind::Binary(BinaryOp::Sub) => "sub",
            OpKind::Binary(BinaryOp::Mul) => "mul",
            OpKind::Binary(BinaryOp::Div) => "div",
            OpKind::Compare(CompareOp::Lt) => "lt",
            OpKind::Compare(CompareOp::Le) => "le",
            OpKind::Compare(CompareOp::Gt) => "gt",
            OpKind::Compare(CompareOp::Ge) => "ge",
            OpKind::Compare(CompareOp::Eq) => "eq",
            OpKind::Select => "select",
            OpKind::Convert { .. } => "convert",
            OpKind::BroadcastInDim { .. } => "broadcast",
            OpKind::Reduce { .. } => "reduce_sum",
            OpKind::Dot { .. } => "dot",
            OpKind::Slice { .. } => "slice",
            OpKind::UpdateSlice { .. } => "update_slice",
            OpKind::DynamicSlice { .. } => "dynamic_slice",
            OpKind::DynamicUpdateSlice => "dynamic_update_slice",
            OpKind::Reshape { .. } => "reshape",
            OpKind::ForEach { .. } => "for_each",
            OpKind::Call { .. } => "call",
            OpKind::CustomOp { .. } => "custom_op",
        }
    }
}

// ── Graph storage ──────────────────────────────────────────────────

/// Shape and producer metadata for a value in the graph.
#[derive(Debug, Clone, PartialEq)]
pub struct ValueMeta {
    pub id: ValueId,
    pub shape: Shape,
    /// The node that produces this value (None only for parameters).
    pub producer: Option<NodeId>,
}

/// A single operation in the graph.
#[derive(Debug, Clone, PartialEq)]
pub struct Node {
    pub id: NodeId,
    pub kind: OpKind,
    pub inputs: Vec<ValueId>,
    pub outputs: Vec<ValueId>,
}

/// The emitter context: an append-only DAG with per-node shape inference.
#[derive(Debug, Clone, PartialEq)]
pub struct Graph {
    pub name: String,
    pub values: Vec<ValueMeta>,
    pub nodes: Vec<Node>,
    /// Result values of the graph (a pair `(Q, R)` for an emitted QR
    /// sub-program).
    pub outputs: Vec<ValueId>,
    num_parameters: usize,
}

impl Graph {
    pub fn new(name: impl Into<String>) -> Self {
        Graph {
            name: name.into(),
            values: Vec::new(),
            nodes: Vec::new(),
            outputs: Vec::new(),
            num_parameters: 0,
        }
    }

    pub fn num_parameters(&self) -> usize {
        self.num_parameters
    }

    pub fn num_nodes(&self) -> usize {
        self.nodes.len()
    }

    pub fn value(&self, id: ValueId) -> Option<&ValueMeta> {
        self.values.get(id.0 as usize)
    }

    /// Shape of a value; out-of-graph handles are compiler bugs.
    pub fn shape(&self, id: ValueId) -> ExpandResult<&Shape> {
        self.value(id)
            .map(|v| &v.shape)
            .ok_or_else(|| ExpandError::Internal(format!("unknown value id {}", id.0)))
    }

    pub fn node(&self, id: NodeId) -> Option<&Node> {
        self.nodes.get(id.0 as usize)
    }

    /// Declare the next graph input.
    pub fn parameter(&mut self, shape: Shape) -> ValueId {
        let index = self.num_parameters;
        self.num_parameters += 1;
        let ids = self.push_node(OpKind::Parameter { index }, Vec::new(), vec![shape]);
        ids[0]
    }

    /// Shapes of the graph's parameters, in declaration order.
    pub fn parameter_shapes(&self) -> Vec<Shape> {
        let mut shapes = vec![None; self.num_parameters];
        for node in &self.nodes {
            if let OpKind::Parameter { index } = node.kind {
                shapes[index] = Some(self.values[node.outputs[0].0 as usize].shape.clone());
            }
        }
        shapes.into_iter().map(|s| s.expect("parameter index gap")).collect()
    }

    pub fn set_outputs(&mut self, outputs: Vec<ValueId>) {
        self.outputs = outputs;
    }

    /// Append a single-output operation, inferring its result shape.
    pub fn add_node(&mut self, kind: OpKind, inputs: Vec<ValueId>) -> ExpandResult<ValueId> {
        let shapes = self.infer(&kind, &inputs)?;
        if shapes.len() != 1 {
            return Err(ExpandError::Internal(format!(
                "{} produces {} values, expected 1",
                kind.mnemonic(),
                shapes.len()
            )));
        }
        Ok(self.push_node(kind, inputs, shapes)[0])
    }

    /// Append a multi-output operation (`ForEach`), inferring result shapes.
    pub fn add_node_multi(&mut self, kind: OpKind, inputs: Vec<ValueId>) -> ExpandResult<Vec<ValueId>> {
        let shapes = self.infer(&kind, &inputs)?;
        Ok(self.push_node(kind, inputs, shapes))
    }

    /// Append an operation whose result shapes are declared by the caller
    /// (`Call`, `CustomOp`) rather than inferred.
    pub(crate) fn add_with_shapes(
        &mut self,
        kind: OpKind,
        inputs: Vec<ValueId>,
        shapes: Vec<Shape>,
    ) -> Vec<ValueId> {
        self.push_node(kind, inputs, shapes)
    }

    fn push_node(&mut self, kind: OpKind, inputs: Vec<ValueId>, shapes: Vec<Shape>) -> Vec<ValueId> {
        let node_id = NodeId(self.nodes.len() as u32);
        let mut outputs = Vec::with_capacity(shapes.len());
        for shape in shapes {
            let value_id = ValueId(self.values.len() as u32);
            self.values.push(ValueMeta {
                id: value_id,
                shape,
                producer: Some(node_id),
            });
            outputs.push(value_id);
        }
        self.nodes.push(Node {
            id: node_id,
            kind,
            inputs,
            outputs: outputs.clone(),
        });
        outputs
    }

    // ── Shape inference ────────────────────────────────────────────

    fn infer(&self, kind: &OpKind, inputs: &[ValueId]) -> ExpandResult<Vec<Shape>> {
        let arity = |n: usize| -> ExpandResult<()> {
            if inputs.len() != n {
                return Err(ExpandError::Internal(format!(
                    "{} expects {} operands, got {}",
                    kind.mnemonic(),
                    n,
                    inputs.len()
                )));
            }
            Ok(())
        };
        let shape_of = |id: ValueId| self.shape(id);

        match kind {
            OpKind::Parameter { .. } => Err(ExpandError::Internal(
                "parameters are created via Graph::parameter".into(),
            )),
            OpKind::ConstantScalar { dtype, .. } => {
                arity(0)?;
                Ok(vec![Shape::scalar(*dtype)])
            }
            OpKind::Iota { dims, axis } => {
                arity(0)?;
                if *axis >= dims.len() {
                    return Err(ExpandError::InvalidArgument(format!(
                        "iota axis {axis} out of range for rank {}",
                        dims.len()
                    )));
                }
                Ok(vec![Shape::new(dims.clone(), DType::S32)])
            }
            OpKind::Unary(op) => {
                arity(1)?;
                let s = shape_of(inputs[0])?;
                if *op == UnaryOp::Sqrt && !s.dtype.is_floating() {
                    return Err(ExpandError::InvalidArgument(format!(
                        "sqrt requires a floating operand, got {s}"
                    )));
                }
                Ok(vec![s.clone()])
            }
            OpKind::Binary(_) => {
                arity(2)?;
                let lhs = shape_of(inputs[0])?;
                let rhs = shape_of(inputs[1])?;
                if lhs != rhs {
                    return Err(ExpandError::InvalidArgument(format!(
                        "{} operands must agree, got {lhs} vs {rhs}",
                        kind.mnemonic()
                    )));
                }
                Ok(vec![lhs.clone()])
            }
            OpKind::Compare(_) => {
                arity(2)?;
                let lhs = shape_of(inputs[0])?;
                let rhs = shape_of(inputs[1])?;
                if lhs != rhs {
                    return Err(ExpandError::InvalidArgument(format!(
                        "{} operands must agree, got {lhs} vs {rhs}",
                        kind.mnemonic()
                    )));
                }
                Ok(vec![Shape::new(lhs.dims.clone(), DType::Pred)])
            }
            OpKind::Select => {
                arity(3)?;
                let pred = shape_of(inputs[0])?;
                let on_true = shape_of(inputs[1])?;
                let on_false = shape_of(inputs[2])?;
                if pred.dtype != DType::Pred {
                    return Err(ExpandError::InvalidArgument(format!(
                        "select predicate must be pred, got {pred}"
                    )));
                }
                if pred.dims != on_true.dims || on_true != on_false {
                    return Err(ExpandError::InvalidArgument(format!(
                        "select operands must agree, got {pred} ? {on_true} : {on_false}"
                    )));
                }
                Ok(vec![on_true.clone()])
            }
            OpKind::Convert { dtype } => {
                arity(1)?;
                let s = shape_of(inputs[0])?;
                Ok(vec![Shape::new(s.dims.clone(), *dtype)])
            }
            OpKind::BroadcastInDim { dims, dim_map } => {
                arity(1)?;
                let s = shape_of(inputs[0])?;
                if dim_map.len() != s.rank() {
                    return Err(ExpandError::InvalidArgument(format!(
                        "broadcast dim_map has {} entries for rank-{} operand",
                        dim_map.len(),
                        s.rank()
                    )));
                }
                if dim_map.windows(2).any(|w| w[0] >= w[1]) {
                    return Err(ExpandError::InvalidArgument(
                        "broadcast dim_map must be strictly increasing".into(),
                    ));
                }
                for (axis, &out_axis) in dim_map.iter().enumerate() {
                    if out_axis >= dims.len() {
                        return Err(ExpandError::InvalidArgument(format!(
                            "broadcast maps axis {axis} to {out_axis}, rank is {}",
                            dims.len()
                        )));
                    }
                    let from = s.dims[axis];
                    if from != dims[out_axis] && from != 1 {
                        return Err(ExpandError::InvalidArgument(format!(
                            "cannot broadcast dim {axis} of {s} to size {}",
                            dims[out_axis]
                        )));
                    }
                }
                Ok(vec![Shape::new(dims.clone(), s.dtype)])
            }
            OpKind::Reduce { axis } => {
                arity(1)?;
                let s = shape_of(inputs[0])?;
                if *axis >= s.rank() {
                    return Err(ExpandError::InvalidArgument(format!(
                        "reduce axis {axis} out of range for {s}"
                    )));
                }
                if !s.dtype.is_floating() {
                    return Err(ExpandError::InvalidArgument(format!(
                        "reduce_sum requires a floating operand, got {s}"
                    )));
                }
                let mut dims = s.dims.clone();
                dims.remove(*axis);
                Ok(vec![Shape::new(dims, s.dtype)])
            }
            OpKind::Dot {
                transpose_lhs,
                transpose_rhs,
                ..
            } => {
                arity(2)?;
                let lhs = shape_of(inputs[0])?;
                let rhs = shape_of(inputs[1])?;
                if lhs.rank() < 2 || rhs.rank() < 2 {
                    return Err(ExpandError::InvalidArgument(format!(
                        "dot operands must have rank >= 2, got {lhs} and {rhs}"
                    )));
                }
                if lhs.dtype != rhs.dtype || !lhs.dtype.is_floating() {
                    return Err(ExpandError::InvalidArgument(format!(
                        "dot requires matching floating dtypes, got {lhs} and {rhs}"
                    )));
                }
                if lhs.batch_dims() != rhs.batch_dims() {
                    return Err(ExpandError::InvalidArgument(format!(
                        "dot batch dims must match exactly, got {lhs} and {rhs}"
                    )));
                }
                let (lm, lk) = (lhs.dim(-2), lhs.dim(-1));
                let (lm, lk) = if *transpose_lhs { (lk, lm) } else { (lm, lk) };
                let (rk, rn) = (rhs.dim(-2), rhs.dim(-1));
                let (rk, rn) = if *transpose_rhs { (rn, rk) } else { (rk, rn) };
                if lk != rk {
                    return Err(ExpandError::InvalidArgument(format!(
                        "dot contraction dims must match, got {lhs} and {rhs}"
                    )));
                }
                let mut dims = lhs.batch_dims().to_vec();
                dims.push(lm);
                dims.push(rn);
                Ok(vec![Shape::new(dims, lhs.dtype)])
            }
            OpKind::Slice { starts, limits } => {
                arity(1)?;
                let s = shape_of(inputs[0])?;
                let k = starts.len();
                if k != limits.len() || k > s.rank() {
                    return Err(ExpandError::InvalidArgument(format!(
                        "slice starts/limits malformed for {s}"
                    )));
                }
                let mut dims = s.dims.clone();
                let base = s.rank() - k;
                for i in 0..k {
                    let dim = s.dims[base + i];
                    if starts[i] > limits[i] || limits[i] > dim {
                        return Err(ExpandError::InvalidArgument(format!(
                            "slice [{}, {}) out of range for dim {dim} of {s}",
                            starts[i], limits[i]
                        )));
                    }
                    dims[base + i] = limits[i] - starts[i];
                }
                Ok(vec![Shape::new(dims, s.dtype)])
            }
            OpKind::UpdateSlice { starts } => {
                arity(2)?;
                let base = shape_of(inputs[0])?;
                let update = shape_of(inputs[1])?;
                self.check_update_slice(kind, base, update, starts.len())?;
                let k = starts.len();
                let lead = base.rank() - k;
                for i in 0..k {
                    if starts[i] + update.dims[lead + i] > base.dims[lead + i] {
                        return Err(ExpandError::InvalidArgument(format!(
                            "update at {} overruns dim {} of {base}",
                            starts[i],
                            base.dims[lead + i]
                        )));
                    }
                }
                Ok(vec![base.clone()])
            }
            OpKind::DynamicSlice { sizes } => {
                let k = sizes.len();
                arity(1 + k)?;
                let s = shape_of(inputs[0])?;
                if k > s.rank() {
                    return Err(ExpandError::InvalidArgument(format!(
                        "dynamic_slice addresses {k} dims of rank-{} {s}",
                        s.rank()
                    )));
                }
                self.check_scalar_indices(&inputs[1..])?;
                let mut dims = s.dims.clone();
                let base = s.rank() - k;
                for i in 0..k {
                    if sizes[i] > s.dims[base + i] {
                        return Err(ExpandError::InvalidArgument(format!(
                            "dynamic_slice size {} exceeds dim {} of {s}",
                            sizes[i],
                            s.dims[base + i]
                        )));
                    }
                    dims[base + i] = sizes[i];
                }
                Ok(vec![Shape::new(dims, s.dtype)])
            }
            OpKind::DynamicUpdateSlice => {
                if inputs.len() < 3 {
                    return Err(ExpandError::Internal(
                        "dynamic_update_slice expects (base, update, starts...)".into(),
                    ));
                }
                let base = shape_of(inputs[0])?;
                let update = shape_of(inputs[1])?;
                let k = inputs.len() - 2;
                self.check_update_slice(kind, base, update, k)?;
                self.check_scalar_indices(&inputs[2..])?;
                let lead = base.rank() - k;
                for i in 0..k {
                    if update.dims[lead + i] > base.dims[lead + i] {
                        return Err(ExpandError::InvalidArgument(format!(
                            "dynamic update {update} does not fit in {base}"
                        )));
                    }
                }
                Ok(vec![base.clone()])
            }
            OpKind::Reshape { dims } => {
                arity(1)?;
                let s = shape_of(inputs[0])?;
                let count: usize = dims.iter().product();
                if count != s.elem_count() {
                    return Err(ExpandError::InvalidArgument(format!(
                        "reshape of {s} to {dims:?} changes element count"
                    )));
                }
                Ok(vec![Shape::new(dims.clone(), s.dtype)])
            }
            OpKind::ForEach { body, .. } => {
                let carried: Vec<Shape> = inputs
                    .iter()
                    .map(|&v| shape_of(v).cloned())
                    .collect::<ExpandResult<_>>()?;
                let params = body.parameter_shapes();
                if params.len() != carried.len() + 1 {
                    return Err(ExpandError::Internal(format!(
                        "loop body `{}` has {} parameters for {} carried values",
                        body.name,
                        params.len(),
                        carried.len()
                    )));
                }
                if params[0] != Shape::scalar(DType::S32) {
                    return Err(ExpandError::Internal(format!(
                        "loop body `{}` index parameter must be s32[], got {}",
                        body.name, params[0]
                    )));
                }
                for (i, carry) in carried.iter().enumerate() {
                    if &params[i + 1] != carry {
                        return Err(ExpandError::Internal(format!(
                            "loop body `{}` parameter {} is {}, carried value is {carry}",
                            body.name,
                            i + 1,
                            params[i + 1]
                        )));
                    }
                }
                if body.outputs.len() != carried.len() {
                    return Err(ExpandError::Internal(format!(
                        "loop body `{}` returns {} values for {} carried",
                        body.name,
                        body.outputs.len(),
                        carried.len()
                    )));
                }
                for (i, carry) in carried.iter().enumerate() {
                    let out = body.shape(body.outputs[i])?;
                    if out != carry {
                        return Err(ExpandError::Internal(format!(
                            "loop body `{}` output {i} is {out}, carried value is {carry}",
                            body.name
                        )));
                    }
                }
                Ok(carried)
            }
            OpKind::Call { .. } | OpKind::CustomOp { .. } => Err(ExpandError::Internal(format!(
                "{} requires declared output shapes",
                kind.mnemonic()
            ))),
        }
    }

    fn check_update_slice(
        &self,
        kind: &OpKind,
        base: &Shape,
        update: &Shape,
        minor: usize,
    ) -> ExpandResult<()> {
        if update.rank() != base.rank() || update.dtype != base.dtype {
            return Err(ExpandError::InvalidArgument(format!(
                "{} update {update} incompatible with base {base}",
                kind.mnemonic()
            )));
        }
        if minor > base.rank() {
            return Err(ExpandError::InvalidArgument(format!(
                "{} addresses {minor} dims of rank-{} base",
                kind.mnemonic(),
                base.rank()
            )));
        }
        let lead = base.rank() - minor;
        if update.dims[..lead] != base.dims[..lead] {
            return Err(ExpandError::InvalidArgument(format!(
                "{} major dims must match, got {update} in {base}",
                kind.mnemonic()
            )));
        }
        Ok(())
    }

    fn check_scalar_indices(&self, indices: &[ValueId]) -> ExpandResult<()> {
        for &idx in indices {
            let s = self.shape(idx)?;
            if !s.is_scalar() || s.dtype != DType::S32 {
                return Err(ExpandError::InvalidArgument(format!(
                    "slice start indices must be s32 scalars, got {s}"
                )));
            }
        }
        Ok(())
    }
}

impl fmt::Display for Graph {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        writeln!(
            f,
            "graph `{}`: {} nodes, {} values",
            self.name,
            self.nodes.len(),
            self.values.len()
        )?;
        for node in &self.nodes {
            let ins: Vec<String> = node.inputs.iter().map(|v| format!("%{}", v.0)).collect();
            let outs: Vec<String> = node
                .outputs
                .iter()
                .map(|v| {
                    format!("%{}: {}", v.0, self.values[v.0 as usize].shape)
                })
                .collect();
            writeln!(
                f,
                "  {} = {}({})",
                outs.join(", "),
                node.kind.mnemonic(),
                ins.join(", ")
            )?;
        }
        let outs: Vec<String> = self.outputs.iter().map(|v| format!("%{}", v.0)).collect();
        writeln!(f, "  return ({})", outs.join(", "))
    }
}
