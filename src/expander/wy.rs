//! Compact-WY accumulation of Householder products.
//!
//! Builds the upper-triangular `T` such that `I - Y·T·Yᵀ` equals the
//! product `H_0 · H_1 · ... · H_{k-1}` of the reflectors packed in `Y`
//! (unit diagonal, strict upper part zero) with scalars `taus`.
//!
//! Schreiber, Robert, and Charles Van Loan. "A storage-efficient WY
//! representation for products of Householder transformations." SIAM
//! Journal on Scientific and Statistical Computing 10.1 (1989): 53-57.
//!
//! `YᵀY` is formed once up front so the recurrence runs on a single
//! `[..., k, k]` product instead of `k` separate matrix-vector products
//! against the tall `Y`:
//!
//! ```text
//! U = -taus[None, :] * (triu(Yᵀ Y, 1) + I)
//! T = I
//! for j in 0..k:  T[:, j] = T @ U[:, j]
//! ```
//!
//! Iteration `j` reads only the already-final columns `< j` of `T` plus
//! the untouched identity column `j` (contributing `-tau_j · e_j`), which
//! is why starting from the identity needs no separate `diag(-taus)`
//! seed; `T[0, 0] = -tau_0` falls out of the first iteration.

use crate::graph::{Graph, ValueId};
use crate::types::{ExpandError, ExpandResult, Precision};

/// Emit `T` (`[..., k, k]`, upper-triangular) for the reflector panel
/// `y` (`[..., m, k]`) and scalars `taus` (`[..., k]`).
pub(crate) fn emit_compact_wy(
    g: &mut Graph,
    y: ValueId,
    taus: ValueId,
    precision: Precision,
) -> ExpandResult<ValueId> {
    let y_shape = g.shape(y)?.clone();
    let taus_shape = g.shape(taus)?.clone();
    if y_shape.rank() < 2 {
        return Err(ExpandError::InvalidArgument(format!(
            "reflector panel must have rank >= 2; got shape {y_shape}"
        )));
    }
    let dtype = y_shape.dtype;
    let k = y_shape.dim(-1);
    if taus_shape.rank() < 1 || taus_shape.dim(-1) != k {
        return Err(ExpandError::InvalidArgument(format!(
            "panel {y_shape} carries {k} reflectors but taus is {taus_shape}"
        )));
    }
    let batch_dims = y_shape.batch_dims().to_vec();
    let num_batch = batch_dims.len();

    // -taus as a [..., 1, k] row for per-column scaling
    let neg_taus = g.neg(taus)?;
    let mut row_dims = batch_dims.clone();
    row_dims.push(1);
    row_dims.push(k);
    let mut row_map: Vec<usize> = (0..num_batch).collect();
    row_map.push(num_batch + 1);
    let tau_scale = g.broadcast_in_dim(neg_taus, row_dims, row_map)?;

    let eye_k = g.identity_matrix(k, k, dtype)?;
    let eye = g.broadcast(eye_k, &batch_dims)?;

    // U = -taus * (triu(YᵀY, 1) + I)
    let vtv = g.batch_dot(y, true, y, false, precision)?;
    let lower = g.triangle_mask(vtv, 0)?;
    let zeros = g.zeros_like(vtv)?;
    let vtv = g.select(lower, zeros, vtv)?;
    let vtv = g.add(vtv, eye)?;
    let vtv = g.mul(vtv, tau_scale)?;

    let outs = g.for_each_index(k, &[eye, vtv], "compact_wy", |body, j, carried| {
        let t = carried[0];
        let vtv = carried[1];
        let column = body.dynamic_slice_in_minor_dims(vtv, &[j], vec![1])?;
        let z = body.batch_dot(t, false, column, false, precision)?;
        let t = body.dynamic_update_slice_in_minor_dims(t, z, &[j])?;
        Ok(vec![t, vtv])
    })?;
    Ok(outs[0])
}
