//! Unblocked Householder QR of a panel.
//!
//! Algorithm 5.2.1 of Golub & Van Loan, adapted so every shape inside the
//! loop is static: the `j+1:` column ranges become masks against a column
//! index tensor, at the cost of some redundant arithmetic on already-
//! processed columns (which are reconstructed explicitly afterwards).
//! Used as the inner kernel of the blocked driver, so it accumulates the
//! reflectors `(v, tau)` packed into the panel rather than forming `Q`:
//!
//! ```text
//! for j in 0..min(m, k):
//!   v, tau, beta = house(a[:, j], j)
//!   a[:, j+1:]  -= tau * v (vᵀ a[:, j+1:])
//!   a[j, j]      = beta          # diagonal of R, formed explicitly
//!   a[j+1:, j]   = v[j+1:]       # reflector tail packed below it
//!   taus[j]      = tau
//! ```
//!
//! The loop is emitted as one fixed-trip-count iteration, not unrolled.

use crate::expander::house::emit_house;
use crate::graph::{BinaryOp, Graph, ValueId};
use crate::types::{ExpandError, ExpandResult, Precision};

/// A factorized panel: `R` on and above the diagonal, reflector tails
/// packed strictly below it, plus the packed `tau` vector.
#[derive(Debug)]
pub(crate) struct PanelQr {
    pub factored: ValueId,
    pub taus: ValueId,
}

/// Emit the unblocked factorization of a panel `[..., m, k]`, `k <= m`.
pub(crate) fn emit_qr_panel(
    g: &mut Graph,
    a: ValueId,
    precision: Precision,
) -> ExpandResult<PanelQr> {
    let a_shape = g.shape(a)?.clone();
    if a_shape.rank() < 2 {
        return Err(ExpandError::InvalidArgument(format!(
            "panel must have rank >= 2; got shape {a_shape}"
        )));
    }
    let dtype = a_shape.dtype;
    let m = a_shape.dim(-2);
    let n = a_shape.dim(-1);
    if n > m {
        return Err(ExpandError::InvalidArgument(format!(
            "panel must not be wider than tall; got shape {a_shape}"
        )));
    }
    let p = m.min(n);
    let batch_dims = a_shape.batch_dims().to_vec();
    let num_batch = batch_dims.len();
    let batch_dim_ids: Vec<usize> = (0..num_batch).collect();
    let num_dims = a_shape.rank();

    let zero = g.scalar(0.0, dtype)?;
    let mut taus_dims = batch_dims.clone();
    taus_dims.push(p);
    let taus_init = g.broadcast(zero, &taus_dims)?;

    let mut panel_dims = batch_dims.clone();
    panel_dims.push(m);
    panel_dims.push(n);

    let outs = g.for_each_index(p, &[a, taus_init], "qr_panel", |body, j, carried| {
        let a = carried[0];
        let taus = carried[1];

        // x = a[:, j], then the reflector anchored at row j
        let x = body.dynamic_slice_in_minor_dims(a, &[j], vec![1])?;
        let x_vec = body.collapse_minor_dims(x, 2)?;
        let house = emit_house(body, x_vec, j, &batch_dims, m)?;

        // Column index tensor for masking the j+1: range
        let iota_mn = body.iota_shaped(panel_dims.clone(), num_batch + 1)?;

        // a[:, j+1:] -= tau * (v (vᵀ a[:, j+1:]))
        // Masking stands in for the loop-variant slice width.
        let mut v_dims = batch_dims.clone();
        v_dims.push(1);
        v_dims.push(m);
        let v_row = body.reshape(house.v, v_dims)?;
        let after_j = body.lt(j, iota_mn)?;
        let zeros_a = body.zeros_like(a)?;
        let masked = body.select(after_j, a, zeros_a)?;
        let vva = body.batch_dot(v_row, false, masked, false, precision)?;
        let vva = body.batch_dot(v_row, true, vva, false, precision)?;
        let tau_vva = body.binary_bcast(BinaryOp::Mul, vva, house.tau, &batch_dim_ids)?;
        let a = body.sub(a, tau_vva)?;

        // Rebuild column j explicitly rather than relying on the precision
        // of the Householder update: rows < j keep x, row j gets beta,
        // rows > j get the reflector tail.
        let iota_m = body.iota_vec(m)?;
        let iota_col = body.reshape(iota_m, vec![m, 1])?;
        let above_pred = body.lt(iota_col, j)?;
        let above = body.convert(above_pred, dtype)?;
        let kept = body.binary_bcast(BinaryOp::Mul, x, above, &[num_dims - 2, num_dims - 1])?;

        let diag_pred = body.eq(iota_col, j)?;
        let diag = body.convert(diag_pred, dtype)?;
        let diag = body.broadcast(diag, &vec![1; num_batch])?;
        let beta_term = body.binary_bcast(BinaryOp::Mul, diag, house.beta, &batch_dim_ids)?;
        let new_x = body.add(kept, beta_term)?;

        let below_pred = body.gt(iota_m, j)?;
        let below = body.broadcast(below_pred, &batch_dims)?;
        let zeros_v = body.zeros_like(house.v)?;
        let v_tail = body.select(below, house.v, zeros_v)?;
        let mut tail_map = batch_dim_ids.clone();
        tail_map.push(num_dims - 2);
        let new_x = body.binary_bcast(BinaryOp::Add, new_x, v_tail, &tail_map)?;

        let col_map: Vec<usize> = (0..num_dims).collect();
        let new_x = body.broadcast_in_dim(new_x, panel_dims.clone(), col_map)?;
        let at_j = body.eq(iota_mn, j)?;
        let a = body.select(at_j, new_x, a)?;

        // taus[j] = tau
        let iota_p = body.iota_shaped(taus_dims.clone(), num_batch)?;
        let slot = body.eq(iota_p, j)?;
        let taus_zeros = body.zeros_like(taus)?;
        let tau_b = body.binary_bcast(BinaryOp::Add, taus_zeros, house.tau, &batch_dim_ids)?;
        let update = body.select(slot, tau_b, taus_zeros)?;
        let taus = body.add(taus, update)?;

        Ok(vec![a, taus])
    })?;

    Ok(PanelQr {
        factored: outs[0],
        taus: outs[1],
    })
}
