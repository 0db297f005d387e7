//! Emitter helpers — the client-library surface the QR emitters call.
//!
//! Thin convenience layer over [`Graph::add_node`]: scalars, iota, masked
//! selection, batched matmul, minor-dims slicing, triangle masks, and the
//! fixed-trip-count loop constructor. Broadcasts are desugared here into
//! explicit `BroadcastInDim` nodes so the primitive elementwise ops only
//! ever see operands of identical shape.

use crate::graph::{BinaryOp, CompareOp, Graph, OpKind, UnaryOp, ValueId};
use crate::types::{DType, ExpandError, ExpandResult, Precision, Shape};

impl Graph {
    // ── Constants and iota ─────────────────────────────────────────

    /// Rank-0 constant.
    pub fn scalar(&mut self, value: f64, dtype: DType) -> ExpandResult<ValueId> {
        self.add_node(OpKind::ConstantScalar { value, dtype }, vec![])
    }

    /// A zero of the same shape and dtype as `v`.
    pub fn zeros_like(&mut self, v: ValueId) -> ExpandResult<ValueId> {
        let shape = self.shape(v)?.clone();
        let zero = self.scalar(0.0, shape.dtype)?;
        self.broadcast_to(zero, &shape.dims)
    }

    /// Rank-1 S32 index vector `[0, 1, ..., len-1]`.
    pub fn iota_vec(&mut self, len: usize) -> ExpandResult<ValueId> {
        self.add_node(OpKind::Iota { dims: vec![len], axis: 0 }, vec![])
    }

    /// S32 indices along `axis` of a tensor with the given dims.
    pub fn iota_shaped(&mut self, dims: Vec<usize>, axis: usize) -> ExpandResult<ValueId> {
        self.add_node(OpKind::Iota { dims, axis }, vec![])
    }

    // ── Elementwise arithmetic ─────────────────────────────────────

    pub fn add(&mut self, lhs: ValueId, rhs: ValueId) -> ExpandResult<ValueId> {
        self.binary(BinaryOp::Add, lhs, rhs)
    }

    pub fn sub(&mut self, lhs: ValueId, rhs: ValueId) -> ExpandResult<ValueId> {
        self.binary(BinaryOp::Sub, lhs, rhs)
    }

    pub fn mul(&mut self, lhs: ValueId, rhs: ValueId) -> ExpandResult<ValueId> {
        self.binary(BinaryOp::Mul, lhs, rhs)
    }

    pub fn div(&mut self, lhs: ValueId, rhs: ValueId) -> ExpandResult<ValueId> {
        self.binary(BinaryOp::Div, lhs, rhs)
    }

    pub fn neg(&mut self, v: ValueId) -> ExpandResult<ValueId> {
        self.add_node(OpKind::Unary(UnaryOp::Neg), vec![v])
    }

    pub fn sqrt(&mut self, v: ValueId) -> ExpandResult<ValueId> {
        self.add_node(OpKind::Unary(UnaryOp::Sqrt), vec![v])
    }

    pub fn square(&mut self, v: ValueId) -> ExpandResult<ValueId> {
        self.mul(v, v)
    }

    fn binary(&mut self, op: BinaryOp, lhs: ValueId, rhs: ValueId) -> ExpandResult<ValueId> {
        let (lhs, rhs) = self.implicit_broadcast(lhs, rhs)?;
        self.add_node(OpKind::Binary(op), vec![lhs, rhs])
    }

    /// Binary op with an explicit mapping of the lower-rank operand's axes
    /// into the higher-rank operand's axes (the `broadcast_dimensions` of
    /// the emitted graph's dialect).
    pub fn binary_bcast(
        &mut self,
        op: BinaryOp,
        lhs: ValueId,
        rhs: ValueId,
        broadcast_dims: &[usize],
    ) -> ExpandResult<ValueId> {
        let (lhs, rhs) = self.mapped_broadcast(lhs, rhs, broadcast_dims)?;
        self.add_node(OpKind::Binary(op), vec![lhs, rhs])
    }

    // ── Comparisons, selection, conversion ─────────────────────────

    pub fn lt(&mut self, lhs: ValueId, rhs: ValueId) -> ExpandResult<ValueId> {
        self.compare(CompareOp::Lt, lhs, rhs)
    }

    pub fn le(&mut self, lhs: ValueId, rhs: ValueId) -> ExpandResult<ValueId> {
        self.compare(CompareOp::Le, lhs, rhs)
    }

    pub fn gt(&mut self, lhs: ValueId, rhs: ValueId) -> ExpandResult<ValueId> {
        self.compare(CompareOp::Gt, lhs, rhs)
    }

    pub fn ge(&mut self, lhs: ValueId, rhs: ValueId) -> ExpandResult<ValueId> {
        self.compare(CompareOp::Ge, lhs, rhs)
    }

    pub fn eq(&mut self, lhs: ValueId, rhs: ValueId) -> ExpandResult<ValueId> {
        self.compare(CompareOp::Eq, lhs, rhs)
    }

    fn compare(&mut self, op: CompareOp, lhs: ValueId, rhs: ValueId) -> ExpandResult<ValueId> {
        let (lhs, rhs) = self.implicit_broadcast(lhs, rhs)?;
        self.add_node(OpKind::Compare(op), vec![lhs, rhs])
    }

    /// `pred ? on_true : on_false`. Scalar branches broadcast to the
    /// predicate's shape.
    pub fn select(
        &mut self,
        pred: ValueId,
        on_true: ValueId,
        on_false: ValueId,
    ) -> ExpandResult<ValueId> {
        let dims = self.shape(pred)?.dims.clone();
        let on_true = self.conform_to(on_true, &dims)?;
        let on_false = self.conform_to(on_false, &dims)?;
        self.add_node(OpKind::Select, vec![pred, on_true, on_false])
    }

    pub fn convert(&mut self, v: ValueId, dtype: DType) -> ExpandResult<ValueId> {
        self.add_node(OpKind::Convert { dtype }, vec![v])
    }

    // ── Broadcasting ───────────────────────────────────────────────

    /// Prepend `leading` dimensions (a no-op when `leading` is empty).
    pub fn broadcast(&mut self, v: ValueId, leading: &[usize]) -> ExpandResult<ValueId> {
        if leading.is_empty() {
            return Ok(v);
        }
        let shape = self.shape(v)?.clone();
        let mut dims = leading.to_vec();
        dims.extend_from_slice(&shape.dims);
        let dim_map: Vec<usize> = (leading.len()..dims.len()).collect();
        self.add_node(OpKind::BroadcastInDim { dims, dim_map }, vec![v])
    }

    /// Broadcast into an explicit target shape via an axis map.
    pub fn broadcast_in_dim(
        &mut self,
        v: ValueId,
        dims: Vec<usize>,
        dim_map: Vec<usize>,
    ) -> ExpandResult<ValueId> {
        self.add_node(OpKind::BroadcastInDim { dims, dim_map }, vec![v])
    }

    /// Broadcast to exactly `dims`, expanding degenerate axes (identity map).
    fn broadcast_to(&mut self, v: ValueId, dims: &[usize]) -> ExpandResult<ValueId> {
        let shape = self.shape(v)?;
        if shape.dims == dims {
            return Ok(v);
        }
        let dim_map: Vec<usize> = if shape.is_scalar() {
            Vec::new()
        } else if shape.rank() == dims.len() {
            (0..dims.len()).collect()
        } else {
            return Err(ExpandError::InvalidArgument(format!(
                "cannot implicitly broadcast {shape} to {dims:?}"
            )));
        };
        self.add_node(
            OpKind::BroadcastInDim { dims: dims.to_vec(), dim_map },
            vec![v],
        )
    }

    /// Reconcile two operands to a common shape: scalars broadcast freely,
    /// and equal-rank operands broadcast their size-1 axes.
    fn implicit_broadcast(
        &mut self,
        lhs: ValueId,
        rhs: ValueId,
    ) -> ExpandResult<(ValueId, ValueId)> {
        let ls = self.shape(lhs)?.clone();
        let rs = self.shape(rhs)?.clone();
        if ls.dims == rs.dims {
            return Ok((lhs, rhs));
        }
        if ls.is_scalar() {
            let lhs = self.broadcast_to(lhs, &rs.dims)?;
            return Ok((lhs, rhs));
        }
        if rs.is_scalar() {
            let rhs = self.broadcast_to(rhs, &ls.dims)?;
            return Ok((lhs, rhs));
        }
        if ls.rank() != rs.rank() {
            return Err(ExpandError::InvalidArgument(format!(
                "rank mismatch {ls} vs {rs}; use an explicit broadcast mapping"
            )));
        }
        let mut dims = Vec::with_capacity(ls.rank());
        for (i, (&a, &b)) in ls.dims.iter().zip(&rs.dims).enumerate() {
            dims.push(match (a, b) {
                (a, b) if a == b => a,
                (1, b) => b,
                (a, 1) => a,
                _ => {
                    return Err(ExpandError::InvalidArgument(format!(
                        "incompatible dim {i}: {ls} vs {rs}"
                    )))
                }
            });
        }
        let lhs = self.broadcast_to(lhs, &dims)?;
        let rhs = self.broadcast_to(rhs, &dims)?;
        Ok((lhs, rhs))
    }

    /// Reconcile one operand (for `select` branches) to the given dims.
    fn conform_to(&mut self, v: ValueId, dims: &[usize]) -> ExpandResult<ValueId> {
        let shape = self.shape(v)?;
        if shape.dims == dims || (!shape.is_scalar() && shape.rank() != dims.len()) {
            // Let shape inference report rank mismatches.
            return Ok(v);
        }
        self.broadcast_to(v, dims)
    }

    /// Apply a mapped broadcast to whichever operand has lower rank, then
    /// expand remaining degenerate axes on both sides.
    fn mapped_broadcast(
        &mut self,
        lhs: ValueId,
        rhs: ValueId,
        broadcast_dims: &[usize],
    ) -> ExpandResult<(ValueId, ValueId)> {
        let ls = self.shape(lhs)?.clone();
        let rs = self.shape(rhs)?.clone();
        let (lo, lo_shape, hi, hi_shape, lo_is_lhs) = if ls.rank() <= rs.rank() {
            (lhs, ls, rhs, rs, true)
        } else {
            (rhs, rs, lhs, ls, false)
        };
        if broadcast_dims.len() != lo_shape.rank() {
            return Err(ExpandError::InvalidArgument(format!(
                "broadcast mapping has {} axes for {lo_shape}",
                broadcast_dims.len()
            )));
        }
        // Result dims: the higher-rank operand's dims, with mapped axes
        // allowed to expand a degenerate dim of either side.
        let mut dims = hi_shape.dims.clone();
        for (axis, &out_axis) in broadcast_dims.iter().enumerate() {
            if out_axis >= dims.len() {
                return Err(ExpandError::InvalidArgument(format!(
                    "broadcast axis {out_axis} out of range for {hi_shape}"
                )));
            }
            let lo_dim = lo_shape.dims[axis];
            dims[out_axis] = match (lo_dim, dims[out_axis]) {
                (a, b) if a == b => a,
                (1, b) => b,
                (a, 1) => a,
                _ => {
                    return Err(ExpandError::InvalidArgument(format!(
                        "incompatible broadcast of {lo_shape} axis {axis} into {hi_shape}"
                    )))
                }
            };
        }
        let lo = self.broadcast_in_dim(lo, dims.clone(), broadcast_dims.to_vec())?;
        let hi = self.broadcast_to(hi, &dims)?;
        Ok(if lo_is_lhs { (lo, hi) } else { (hi, lo) })
    }

    // ── Reductions and matmul ──────────────────────────────────────

    /// Sum over the last axis.
    pub fn reduce_sum_last(&mut self, v: ValueId) -> ExpandResult<ValueId> {
        let rank = self.shape(v)?.rank();
        if rank == 0 {
            return Err(ExpandError::InvalidArgument(
                "cannot reduce a scalar".into(),
            ));
        }
        self.add_node(OpKind::Reduce { axis: rank - 1 }, vec![v])
    }

    /// Batched matrix multiplication over the two minor dims.
    pub fn batch_dot(
        &mut self,
        lhs: ValueId,
        transpose_lhs: bool,
        rhs: ValueId,
        transpose_rhs: bool,
        precision: Precision,
    ) -> ExpandResult<ValueId> {
        self.add_node(
            OpKind::Dot {
                transpose_lhs,
                transpose_rhs,
                precision,
            },
            vec![lhs, rhs],
        )
    }

    // ── Slicing ────────────────────────────────────────────────────

    pub fn slice_in_minor_dims(
        &mut self,
        v: ValueId,
        starts: Vec<usize>,
        limits: Vec<usize>,
    ) -> ExpandResult<ValueId> {
        self.add_node(OpKind::Slice { starts, limits }, vec![v])
    }

    pub fn update_slice_in_minor_dims(
        &mut self,
        v: ValueId,
        update: ValueId,
        starts: Vec<usize>,
    ) -> ExpandResult<ValueId> {
        self.add_node(OpKind::UpdateSlice { starts }, vec![v, update])
    }

    pub fn dynamic_slice_in_minor_dims(
        &mut self,
        v: ValueId,
        starts: &[ValueId],
        sizes: Vec<usize>,
    ) -> ExpandResult<ValueId> {
        let mut inputs = vec![v];
        inputs.extend_from_slice(starts);
        self.add_node(OpKind::DynamicSlice { sizes }, inputs)
    }

    pub fn dynamic_update_slice_in_minor_dims(
        &mut self,
        v: ValueId,
        update: ValueId,
        starts: &[ValueId],
    ) -> ExpandResult<ValueId> {
        let mut inputs = vec![v, update];
        inputs.extend_from_slice(starts);
        self.add_node(OpKind::DynamicUpdateSlice, inputs)
    }

    pub fn reshape(&mut self, v: ValueId, dims: Vec<usize>) -> ExpandResult<ValueId> {
        self.add_node(OpKind::Reshape { dims }, vec![v])
    }

    /// Merge the trailing `minor` dims into one.
    pub fn collapse_minor_dims(&mut self, v: ValueId, minor: usize) -> ExpandResult<ValueId> {
        let shape = self.shape(v)?;
        if minor == 0 || minor > shape.rank() {
            return Err(ExpandError::InvalidArgument(format!(
                "cannot collapse {minor} dims of {shape}"
            )));
        }
        let lead = shape.rank() - minor;
        let mut dims = shape.dims[..lead].to_vec();
        dims.push(shape.dims[lead..].iter().product());
        self.reshape(v, dims)
    }

    // ── Structured matrices ────────────────────────────────────────

    /// The `m x n` identity, built from row/column index equality.
    pub fn identity_matrix(&mut self, m: usize, n: usize, dtype: DType) -> ExpandResult<ValueId> {
        let rows = self.iota_shaped(vec![m, n], 0)?;
        let cols = self.iota_shaped(vec![m, n], 1)?;
        let diag = self.eq(rows, cols)?;
        self.convert(diag, dtype)
    }

    /// Predicate of `v`'s shape that is true where `row + diagonal >= col`:
    /// the lower triangle including `diagonal` super-diagonals.
    pub fn triangle_mask(&mut self, v: ValueId, diagonal: i64) -> ExpandResult<ValueId> {
        let shape = self.shape(v)?;
        if shape.rank() < 2 {
            return Err(ExpandError::InvalidArgument(format!(
                "triangle mask needs rank >= 2, got {shape}"
            )));
        }
        let dims = shape.dims.clone();
        let rank = dims.len();
        let rows = self.iota_shaped(dims.clone(), rank - 2)?;
        let cols = self.iota_shaped(dims, rank - 1)?;
        let diag = self.scalar(diagonal as f64, DType::S32)?;
        let shifted = self.add(rows, diag)?;
        self.ge(shifted, cols)
    }

    /// Zero the strict lower triangle of `v`.
    pub fn upper_triangle(&mut self, v: ValueId) -> ExpandResult<ValueId> {
        let mask = self.triangle_mask(v, -1)?;
        let zeros = self.zeros_like(v)?;
        self.select(mask, zeros, v)
    }

    /// Keep only the strict lower triangle of `v`.
    pub fn strict_lower_triangle(&mut self, v: ValueId) -> ExpandResult<ValueId> {
        let mask = self.triangle_mask(v, -1)?;
        let zeros = self.zeros_like(v)?;
        self.select(mask, v, zeros)
    }

    /// Append an opaque custom operation with declared output shapes.
    pub fn custom_op(
        &mut self,
        target: &str,
        operands: Vec<ValueId>,
        output_shapes: Vec<Shape>,
    ) -> Vec<ValueId> {
        self.add_with_shapes(
            OpKind::CustomOp {
                target: target.to_string(),
            },
            operands,
            output_shapes,
        )
    }

    // ── Loops ──────────────────────────────────────────────────────

    /// Emit a fixed-trip-count loop.
    ///
    /// Builds the body graph, hands `body_fn` the loop index parameter and
    /// the carried-value parameters, and validates that the closure returns
    /// one value per carried input with an identical shape. The node's
    /// outputs are the final carried values.
    pub fn for_each_index<F>(
        &mut self,
        trip_count: usize,
        init: &[ValueId],
        name: &str,
        body_fn: F,
    ) -> ExpandResult<Vec<ValueId>>
    where
        F: FnOnce(&mut Graph, ValueId, &[ValueId]) -> ExpandResult<Vec<ValueId>>,
    {
        let mut body = Graph::new(name);
        let index = body.parameter(Shape::scalar(DType::S32));
        let carried: Vec<ValueId> = init
            .iter()
            .map(|&v| Ok(body.parameter(self.shape(v)?.clone())))
            .collect::<ExpandResult<_>>()?;
        let outs = body_fn(&mut body, index, &carried)?;
        body.set_outputs(outs);
        self.add_node_multi(
            OpKind::ForEach {
                trip_count,
                body: Box::new(body),
            },
            init.to_vec(),
        )
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn scalar_operand_broadcasts() {
        let mut g = Graph::new("t");
        let a = g.parameter(Shape::new(vec![2, 3], DType::F32));
        let half = g.scalar(0.5, DType::F32).unwrap();
        let out = g.mul(a, half).unwrap();
        assert_eq!(g.shape(out).unwrap().dims, vec![2, 3]);
    }

    #[test]
    fn degenerate_dims_broadcast() {
        let mut g = Graph::new("t");
        let a = g.parameter(Shape::new(vec![4, 1], DType::F32));
        let b = g.parameter(Shape::new(vec![1, 3], DType::F32));
        let out = g.add(a, b).unwrap();
        assert_eq!(g.shape(out).unwrap().dims, vec![4, 3]);
    }

    #[test]
    fn mapped_broadcast_into_minor_dim() {
        let mut g = Graph::new("t");
        // x: [2, 5] scaled per-row by a [2] vector mapped to axis 0.
        let x = g.parameter(Shape::new(vec![2, 5], DType::F32));
        let s = g.parameter(Shape::new(vec![2], DType::F32));
        let out = g.binary_bcast(BinaryOp::Mul, x, s, &[0]).unwrap();
        assert_eq!(g.shape(out).unwrap().dims, vec![2, 5]);
    }

    #[test]
    fn mapped_broadcast_rejects_bad_axis() {
        let mut g = Graph::new("t");
        let x = g.parameter(Shape::new(vec![2, 5], DType::F32));
        let s = g.parameter(Shape::new(vec![3], DType::F32));
        assert!(g.binary_bcast(BinaryOp::Mul, x, s, &[0]).is_err());
    }

    #[test]
    fn identity_matrix_shape() {
        let mut g = Graph::new("t");
        let eye = g.identity_matrix(4, 3, DType::F64).unwrap();
        let s = g.shape(eye).unwrap();
        assert_eq!(s.dims, vec![4, 3]);
        assert_eq!(s.dtype, DType::F64);
    }

    #[test]
    fn select_broadcasts_scalar_branches() {
        let mut g = Graph::new("t");
        let a = g.parameter(Shape::new(vec![3], DType::F32));
        let zero = g.scalar(0.0, DType::F32).unwrap();
        let pred = g.lt(a, zero).unwrap();
        let one = g.scalar(1.0, DType::F32).unwrap();
        let minus = g.scalar(-1.0, DType::F32).unwrap();
        let sign = g.select(pred, one, minus).unwrap();
        assert_eq!(g.shape(sign).unwrap().dims, vec![3]);
    }

    #[test]
    fn for_each_validates_body() {
        let mut g = Graph::new("t");
        let a = g.parameter(Shape::new(vec![4], DType::F32));
        // Body returns the carried value unchanged: valid.
        let outs = g
            .for_each_index(3, &[a], "noop", |_, _, carried| Ok(carried.to_vec()))
            .unwrap();
        assert_eq!(outs.len(), 1);
        assert_eq!(g.shape(outs[0]).unwrap().dims, vec![4]);

        // Body returning a different shape: rejected.
        let err = g
            .for_each_index(3, &[a], "bad", |body, _, carried| {
                body.collapse_minor_dims(carried[0], 1)?;
                let smaller = body.slice_in_minor_dims(carried[0], vec![0], vec![2])?;
                Ok(vec![smaller])
            })
            .unwrap_err();
        assert!(matches!(err, ExpandError::Internal(_)));
    }

    #[test]
    fn collapse_minor_dims_merges_trailing() {
        let mut g = Graph::new("t");
        let a = g.parameter(Shape::new(vec![2, 5, 1], DType::F32));
        let v = g.collapse_minor_dims(a, 2).unwrap();
        assert_eq!(g.shape(v).unwrap().dims, vec![2, 5]);
    }
}
