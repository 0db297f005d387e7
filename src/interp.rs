//! Reference interpreter for emitted graphs.
//!
//! The expansion itself never executes arithmetic; this module gives the
//! emitted graphs executable semantics so the test suite can run a
//! sub-program on concrete inputs and check the numerics. It is a reference
//! evaluator, not a backend: plain scalar loops, `faer` for the
//! highest-precision matrix products, rayon across batches.
//!
//! All buffers are stored as f64 and re-rounded to the value's element type
//! after every operation, so an f32 graph observes f32 arithmetic. The one
//! place precision is configurable is `Dot`: `Precision::Highest`
//! accumulates in f64 (the expander's contract for internal products);
//! `Precision::Default` accumulates in the element precision, which makes
//! the degradation the contract guards against observable.

use faer::linalg::matmul::matmul;
use faer::{Accum, MatMut, MatRef, Par};
use rayon::prelude::*;

use crate::graph::{BinaryOp, CompareOp, Graph, Node, OpKind, UnaryOp};
use crate::module::Module;
use crate::types::{DType, ExpandError, ExpandResult, Precision, Shape};

// ── Tensor ─────────────────────────────────────────────────────────

/// A concrete row-major tensor. Storage is f64 regardless of `dtype`;
/// construction and every interpreter step round values to what the
/// element type can represent.
#[derive(Debug, Clone)]
pub struct Tensor {
    pub dims: Vec<usize>,
    pub dtype: DType,
    data: Vec<f64>,
}

impl Tensor {
    pub fn new(dims: Vec<usize>, dtype: DType, data: Vec<f64>) -> ExpandResult<Self> {
        let count: usize = dims.iter().product();
        if data.len() != count {
            return Err(ExpandError::InvalidArgument(format!(
                "tensor data has {} elements for dims {dims:?}",
                data.len()
            )));
        }
        let data = data.into_iter().map(|v| dtype.round(v)).collect();
        Ok(Tensor { dims, dtype, data })
    }

    pub fn zeros(dims: Vec<usize>, dtype: DType) -> Self {
        let count = dims.iter().product();
        Tensor {
            dims,
            dtype,
            data: vec![0.0; count],
        }
    }

    pub fn scalar(value: f64, dtype: DType) -> Self {
        Tensor {
            dims: Vec::new(),
            dtype,
            data: vec![dtype.round(value)],
        }
    }

    pub fn from_f64(dims: Vec<usize>, data: Vec<f64>) -> ExpandResult<Self> {
        Self::new(dims, DType::F64, data)
    }

    pub fn from_f32(dims: Vec<usize>, data: Vec<f32>) -> ExpandResult<Self> {
        Self::new(dims, DType::F32, data.into_iter().map(f64::from).collect())
    }

    pub fn shape(&self) -> Shape {
        Shape::new(self.dims.clone(), self.dtype)
    }

    pub fn rank(&self) -> usize {
        self.dims.len()
    }

    pub fn elem_count(&self) -> usize {
        self.data.len()
    }

    pub fn data(&self) -> &[f64] {
        &self.data
    }

    /// Element at a multi-index.
    pub fn at(&self, index: &[usize]) -> f64 {
        debug_assert_eq!(index.len(), self.dims.len());
        let mut flat = 0;
        for (i, &idx) in index.iter().enumerate() {
            debug_assert!(idx < self.dims[i]);
            flat = flat * self.dims[i] + idx;
        }
        self.data[flat]
    }
}

/// Row-major strides for a dim list.
fn strides(dims: &[usize]) -> Vec<usize> {
    let mut out = vec![1; dims.len()];
    for i in (0..dims.len().saturating_sub(1)).rev() {
        out[i] = out[i + 1] * dims[i + 1];
    }
    out
}

/// Visit every multi-index of `dims` in row-major order.
fn for_each_index(dims: &[usize], mut visit: impl FnMut(&[usize])) {
    let count: usize = dims.iter().product();
    let mut index = vec![0usize; dims.len()];
    for _ in 0..count {
        visit(&index);
        for axis in (0..dims.len()).rev() {
            index[axis] += 1;
            if index[axis] < dims[axis] {
                break;
            }
            index[axis] = 0;
        }
    }
}

// ── Interpreter ────────────────────────────────────────────────────

/// Evaluates graphs against a module (for `Call` resolution).
pub struct Interpreter<'m> {
    module: &'m Module,
}

impl<'m> Interpreter<'m> {
    pub fn new(module: &'m Module) -> Self {
        Interpreter { module }
    }

    /// Evaluate the module's entry graph.
    pub fn eval_entry(&self, inputs: &[Tensor]) -> ExpandResult<Vec<Tensor>> {
        self.eval_graph(&self.module.entry, inputs)
    }

    /// Evaluate any graph. Loop bodies are inline, so a sub-program emitted
    /// by the expander evaluates without touching the module.
    pub fn eval_graph(&self, graph: &Graph, inputs: &[Tensor]) -> ExpandResult<Vec<Tensor>> {
        if inputs.len() != graph.num_parameters() {
            return Err(ExpandError::InvalidArgument(format!(
                "graph `{}` takes {} inputs, got {}",
                graph.name,
                graph.num_parameters(),
                inputs.len()
            )));
        }
        let mut env: Vec<Option<Tensor>> = vec![None; graph.values.len()];
        for node in &graph.nodes {
            let results = self.eval_node(graph, node, inputs, &env)?;
            if results.len() != node.outputs.len() {
                return Err(ExpandError::Internal(format!(
                    "node produced {} results for {} outputs",
                    results.len(),
                    node.outputs.len()
                )));
            }
            for (&value, tensor) in node.outputs.iter().zip(results) {
                env[value.0 as usize] = Some(tensor);
            }
        }
        graph
            .outputs
            .iter()
            .map(|&v| {
                env[v.0 as usize]
                    .clone()
                    .ok_or_else(|| ExpandError::Internal(format!("output value %{} unset", v.0)))
            })
            .collect()
    }

    fn eval_node(
        &self,
        graph: &Graph,
        node: &Node,
        inputs: &[Tensor],
        env: &[Option<Tensor>],
    ) -> ExpandResult<Vec<Tensor>> {
        let arg = |i: usize| -> ExpandResult<&Tensor> {
            let id = node.inputs[i];
            env[id.0 as usize]
                .as_ref()
                .ok_or_else(|| ExpandError::Internal(format!("operand %{} unset", id.0)))
        };
        let out_shape = |i: usize| -> ExpandResult<&Shape> { graph.shape(node.outputs[i]) };

        match &node.kind {
            OpKind::Parameter { index } => {
                let tensor = inputs.get(*index).ok_or_else(|| {
                    ExpandError::InvalidArgument(format!("missing input {index}"))
                })?;
                let declared = out_shape(0)?;
                if &tensor.shape() != declared {
                    return Err(ExpandError::InvalidArgument(format!(
                        "input {index} is {}, graph `{}` expects {declared}",
                        tensor.shape(),
                        graph.name
                    )));
                }
                Ok(vec![tensor.clone()])
            }
            OpKind::ConstantScalar { value, dtype } => Ok(vec![Tensor::scalar(*value, *dtype)]),
            OpKind::Iota { dims, axis } => {
                let stride = strides(dims);
                let count: usize = dims.iter().product();
                let data = (0..count)
                    .map(|flat| ((flat / stride[*axis]) % dims[*axis]) as f64)
                    .collect();
                Ok(vec![Tensor {
                    dims: dims.clone(),
                    dtype: DType::S32,
                    data,
                }])
            }
            OpKind::Unary(op) => {
                let x = arg(0)?;
                let dtype = x.dtype;
                let data = x
                    .data
                    .iter()
                    .map(|&v| {
                        dtype.round(match op {
                            UnaryOp::Neg => -v,
                            UnaryOp::Sqrt => v.sqrt(),
                        })
                    })
                    .collect();
                Ok(vec![Tensor {
                    dims: x.dims.clone(),
                    dtype,
                    data,
                }])
            }
            OpKind::Binary(op) => {
                let lhs = arg(0)?;
                let rhs = arg(1)?;
                let dtype = lhs.dtype;
                let data = lhs
                    .data
                    .iter()
                    .zip(&rhs.data)
                    .map(|(&a, &b)| {
                        dtype.round(match op {
                            BinaryOp::Add => a + b,
                            BinaryOp::Sub => a - b,
                            BinaryOp::Mul => a * b,
                            BinaryOp::Div => a / b,
                        })
                    })
                    .collect();
                Ok(vec![Tensor {
                    dims: lhs.dims.clone(),
                    dtype,
                    data,
                }])
            }
            OpKind::Compare(op) => {
                let lhs = arg(0)?;
                let rhs = arg(1)?;
                let data = lhs
                    .data
                    .iter()
                    .zip(&rhs.data)
                    .map(|(&a, &b)| {
                        let hit = match op {
                            CompareOp::Lt => a < b,
                            CompareOp::Le => a <= b,
                            CompareOp::Gt => a > b,
                            CompareOp::Ge => a >= b,
                            CompareOp::Eq => a == b,
                        };
                        if hit {
                            1.0
                        } else {
                            0.0
                        }
                    })
                    .collect();
                Ok(vec![Tensor {
                    dims: lhs.dims.clone(),
                    dtype: DType::Pred,
                    data,
                }])
            }
            OpKind::Select => {
                let pred = arg(0)?;
                let on_true = arg(1)?;
                let on_false = arg(2)?;
                let data = pred
                    .data
                    .iter()
                    .zip(on_true.data.iter().zip(&on_false.data))
                    .map(|(&p, (&t, &f))| if p != 0.0 { t } else { f })
                    .collect();
                Ok(vec![Tensor {
                    dims: on_true.dims.clone(),
                    dtype: on_true.dtype,
                    data,
                }])
            }
            OpKind::Convert { dtype } => {
                let x = arg(0)?;
                let data = x.data.iter().map(|&v| dtype.round(v)).collect();
                Ok(vec![Tensor {
                    dims: x.dims.clone(),
                    dtype: *dtype,
                    data,
                }])
            }
            OpKind::BroadcastInDim { dims, dim_map } => {
                let x = arg(0)?;
                let in_strides = strides(&x.dims);
                let mut data = Vec::with_capacity(dims.iter().product());
                for_each_index(dims, |out_index| {
                    let mut flat = 0;
                    for (axis, &out_axis) in dim_map.iter().enumerate() {
                        let idx = if x.dims[axis] == 1 { 0 } else { out_index[out_axis] };
                        flat += idx * in_strides[axis];
                    }
                    data.push(x.data[flat]);
                });
                Ok(vec![Tensor {
                    dims: dims.clone(),
                    dtype: x.dtype,
                    data,
                }])
            }
            OpKind::Reduce { axis } => {
                let x = arg(0)?;
                let dtype = x.dtype;
                let out_dims = out_shape(0)?.dims.clone();
                let in_strides = strides(&x.dims);
                let mut data = Vec::with_capacity(out_dims.iter().product());
                for_each_index(&out_dims, |out_index| {
                    // out_index is x's index with `axis` removed
                    let mut base = 0;
                    let mut oi = 0;
                    for a in 0..x.dims.len() {
                        if a == *axis {
                            continue;
                        }
                        base += out_index[oi] * in_strides[a];
                        oi += 1;
                    }
                    let mut acc = 0.0;
                    for j in 0..x.dims[*axis] {
                        acc = dtype.round(acc + x.data[base + j * in_strides[*axis]]);
                    }
                    data.push(acc);
                });
                Ok(vec![Tensor {
                    dims: out_dims,
                    dtype,
                    data,
                }])
            }
            OpKind::Dot {
                transpose_lhs,
                transpose_rhs,
                precision,
            } => {
                let lhs = arg(0)?;
                let rhs = arg(1)?;
                let out_dims = out_shape(0)?.dims.clone();
                let tensor = self.eval_dot(
                    lhs,
                    *transpose_lhs,
                    rhs,
                    *transpose_rhs,
                    *precision,
                    out_dims,
                )?;
                Ok(vec![tensor])
            }
            OpKind::Slice { starts, .. } => {
                let x = arg(0)?;
                let out_dims = out_shape(0)?.dims.clone();
                Ok(vec![copy_slice(x, starts, &out_dims)])
            }
            OpKind::UpdateSlice { starts } => {
                let base = arg(0)?;
                let update = arg(1)?;
                Ok(vec![write_slice(base, update, starts)])
            }
            OpKind::DynamicSlice { sizes } => {
                let x = arg(0)?;
                let starts = self.read_start_indices(&node.inputs[1..], env, &x.dims, sizes)?;
                let out_dims = out_shape(0)?.dims.clone();
                debug_assert_eq!(&out_dims[out_dims.len() - sizes.len()..], &sizes[..]);
                Ok(vec![copy_slice(x, &starts, &out_dims)])
            }
            OpKind::DynamicUpdateSlice => {
                let base = arg(0)?;
                let update = arg(1)?;
                let minor = node.inputs.len() - 2;
                let update_minor = &update.dims[update.rank() - minor..];
                let starts =
                    self.read_start_indices(&node.inputs[2..], env, &base.dims, update_minor)?;
                Ok(vec![write_slice(base, update, &starts)])
            }
            OpKind::Reshape { dims } => {
                let x = arg(0)?;
                Ok(vec![Tensor {
                    dims: dims.clone(),
                    dtype: x.dtype,
                    data: x.data.clone(),
                }])
            }
            OpKind::ForEach { trip_count, body } => {
                let mut carried: Vec<Tensor> = node
                    .inputs
                    .iter()
                    .map(|&v| {
                        env[v.0 as usize]
                            .clone()
                            .ok_or_else(|| ExpandError::Internal(format!("operand %{} unset", v.0)))
                    })
                    .collect::<ExpandResult<_>>()?;
                for trip in 0..*trip_count {
                    let mut loop_inputs = Vec::with_capacity(carried.len() + 1);
                    loop_inputs.push(Tensor::scalar(trip as f64, DType::S32));
                    loop_inputs.append(&mut carried);
                    carried = self.eval_graph(body, &loop_inputs)?;
                }
                Ok(carried)
            }
            OpKind::Call { callee } => {
                let sub = self.module.subprogram(*callee)?;
                let call_inputs: Vec<Tensor> = node
                    .inputs
                    .iter()
                    .map(|&v| {
                        env[v.0 as usize]
                            .clone()
                            .ok_or_else(|| ExpandError::Internal(format!("operand %{} unset", v.0)))
                    })
                    .collect::<ExpandResult<_>>()?;
                self.eval_graph(&sub.graph, &call_inputs)
            }
            OpKind::CustomOp { target } => Err(ExpandError::Internal(format!(
                "custom operation `{target}` was not expanded"
            ))),
        }
    }

    /// Read and clamp the S32 scalar start indices of a dynamic slice.
    fn read_start_indices(
        &self,
        operands: &[crate::graph::ValueId],
        env: &[Option<Tensor>],
        base_dims: &[usize],
        sizes: &[usize],
    ) -> ExpandResult<Vec<usize>> {
        let minor_base = base_dims.len() - operands.len();
        operands
            .iter()
            .enumerate()
            .map(|(i, &id)| {
                let t = env[id.0 as usize]
                    .as_ref()
                    .ok_or_else(|| ExpandError::Internal(format!("operand %{} unset", id.0)))?;
                let raw = t.data[0] as i64;
                let max = (base_dims[minor_base + i] - sizes[i]) as i64;
                Ok(raw.clamp(0, max) as usize)
            })
            .collect()
    }

    fn eval_dot(
        &self,
        lhs: &Tensor,
        transpose_lhs: bool,
        rhs: &Tensor,
        transpose_rhs: bool,
        precision: Precision,
        out_dims: Vec<usize>,
    ) -> ExpandResult<Tensor> {
        let dtype = lhs.dtype;
        let rank = out_dims.len();
        let m = out_dims[rank - 2];
        let n = out_dims[rank - 1];
        let batch: usize = out_dims[..rank - 2].iter().product();
        let (l0, l1) = (lhs.dims[lhs.rank() - 2], lhs.dims[lhs.rank() - 1]);
        let (r0, r1) = (rhs.dims[rhs.rank() - 2], rhs.dims[rhs.rank() - 1]);
        let k = if transpose_lhs { l0 } else { l1 };

        if batch == 0 || m * n == 0 {
            return Ok(Tensor::zeros(out_dims, dtype));
        }

        let mut out = vec![0.0; batch * m * n];
        out.par_chunks_mut(m * n).enumerate().for_each(|(b, chunk)| {
            let lhs_mat = &lhs.data[b * l0 * l1..(b + 1) * l0 * l1];
            let rhs_mat = &rhs.data[b * r0 * r1..(b + 1) * r0 * r1];
            match precision {
                Precision::Highest => {
                    let lview = MatRef::from_row_major_slice(lhs_mat, l0, l1);
                    let lview = if transpose_lhs { lview.transpose() } else { lview };
                    let rview = MatRef::from_row_major_slice(rhs_mat, r0, r1);
                    let rview = if transpose_rhs { rview.transpose() } else { rview };
                    let mut dst = MatMut::from_row_major_slice_mut(chunk, m, n);
                    matmul(&mut dst, Accum::Replace, &lview, &rview, 1.0, Par::Seq);
                }
                Precision::Default => {
                    // Element-precision accumulation.
                    let lidx = |row: usize, t: usize| {
                        if transpose_lhs {
                            t * l1 + row
                        } else {
                            row * l1 + t
                        }
                    };
                    let ridx = |t: usize, col: usize| {
                        if transpose_rhs {
                            col * r1 + t
                        } else {
                            t * r1 + col
                        }
                    };
                    for row in 0..m {
                        for col in 0..n {
                            let mut acc = 0.0;
                            for t in 0..k {
                                acc = dtype
                                    .round(acc + dtype.round(lhs_mat[lidx(row, t)] * rhs_mat[ridx(t, col)]));
                            }
                            chunk[row * n + col] = acc;
                        }
                    }
                }
            }
        });

        let data = out.into_iter().map(|v| dtype.round(v)).collect();
        Ok(Tensor {
            dims: out_dims,
            dtype,
            data,
        })
    }
}

/// Copy the minor-dims region `[starts, starts + out_minor)` out of `x`.
fn copy_slice(x: &Tensor, starts: &[usize], out_dims: &[usize]) -> Tensor {
    let in_strides = strides(&x.dims);
    let lead = x.rank() - starts.len();
    let mut data = Vec::with_capacity(out_dims.iter().product());
    for_each_index(out_dims, |out_index| {
        let mut flat = 0;
        for (axis, &idx) in out_index.iter().enumerate() {
            let offset = if axis >= lead { starts[axis - lead] } else { 0 };
            flat += (idx + offset) * in_strides[axis];
        }
        data.push(x.data[flat]);
    });
    Tensor {
        dims: out_dims.to_vec(),
        dtype: x.dtype,
        data,
    }
}

/// Overwrite the minor-dims region of `base` at `starts` with `update`.
fn write_slice(base: &Tensor, update: &Tensor, starts: &[usize]) -> Tensor {
    let base_strides = strides(&base.dims);
    let lead = base.rank() - starts.len();
    let mut data = base.data.clone();
    let mut cursor = 0;
    for_each_index(&update.dims, |up_index| {
        let mut flat = 0;
        for (axis, &idx) in up_index.iter().enumerate() {
            let offset = if axis >= lead { starts[axis - lead] } else { 0 };
            flat += (idx + offset) * base_strides[axis];
        }
        data[flat] = update.data[cursor];
        cursor += 1;
    });
    Tensor {
        dims: base.dims.clone(),
        dtype: base.dtype,
        data,
    }
}
