//! Blocked Householder QR driver.
//!
//! Algorithm 5.2.2 of Golub & Van Loan: factorize a panel of `B` columns
//! with the unblocked kernel, fold its reflectors into Compact-WY form,
//! and apply them to the trailing columns and to the accumulating `Q`
//! with two matrix products per update:
//!
//! ```text
//! q = I_m
//! for i in (0..min(m, n)).step_by(B):
//!   k = min(B, min(m, n) - i)
//!   panel, taus = qr_panel(a[i:, i:i+k])
//!   y = I + tril(panel, -1)
//!   t = compact_wy(y, taus)
//!   a[i:, i+k:] += (y tᵀ) (yᵀ a[i:, i+k:])
//!   q[:, i:]    += (q[:, i:] y) (y tᵀ)ᵀ
//! ```
//!
//! The trailing updates are evaluated right-to-left; `y tᵀ yᵀ` is never
//! materialized. The outer loop unrolls at expansion time (its trip count
//! and per-iteration shapes are static), unlike the two inner loops.

use crate::expander::panel::emit_qr_panel;
use crate::expander::wy::emit_compact_wy;
use crate::graph::{BinaryOp, Graph, ValueId};
use crate::types::{ExpandError, ExpandResult, Precision};

/// Emit the blocked factorization of `a` (`[..., m, n]`), producing
/// `(q, r)` of shapes `[..., m, m]` and `[..., m, n]`.
pub(crate) fn emit_qr_blocked(
    g: &mut Graph,
    a: ValueId,
    block_size: usize,
    precision: Precision,
) -> ExpandResult<(ValueId, ValueId)> {
    let a_shape = g.shape(a)?.clone();
    let num_dims = a_shape.rank();
    if num_dims < 2 {
        return Err(ExpandError::InvalidArgument(format!(
            "argument to QR must have rank >= 2; got shape {a_shape}"
        )));
    }
    if block_size < 1 {
        return Err(ExpandError::InvalidArgument(format!(
            "block_size argument to QR must be >= 1; got {block_size}"
        )));
    }
    if !a_shape.dtype.is_floating() {
        return Err(ExpandError::InvalidArgument(format!(
            "argument to QR must be floating point; got shape {a_shape}"
        )));
    }
    let dtype = a_shape.dtype;
    let m = a_shape.dim(-2);
    let n = a_shape.dim(-1);
    let p = m.min(n);
    let batch_dims = a_shape.batch_dims().to_vec();

    let eye_m = g.identity_matrix(m, m, dtype)?;
    let mut q = g.broadcast(eye_m, &batch_dims)?;
    let mut a_work = a;

    let mut i = 0;
    while i < p {
        let k = block_size.min(p - i);
        log::trace!(
            "qr block at column {i}: {k} columns of {} rows",
            m - i
        );

        // Factorize the panel a[i:, i:i+k]
        let panel = g.slice_in_minor_dims(a_work, vec![i, i], vec![m, i + k])?;
        let panel_qr = emit_qr_panel(g, panel, precision)?;
        a_work = g.update_slice_in_minor_dims(a_work, panel_qr.factored, vec![i, i])?;

        // y = I + tril(panel, -1): reflector tails with the implicit unit
        // diagonal made explicit
        let tails = g.strict_lower_triangle(panel_qr.factored)?;
        let eye_panel = g.identity_matrix(m - i, k, dtype)?;
        let y = g.binary_bcast(
            BinaryOp::Add,
            tails,
            eye_panel,
            &[num_dims - 2, num_dims - 1],
        )?;

        let t = emit_compact_wy(g, y, panel_qr.taus, precision)?;
        let yt = g.batch_dot(y, false, t, true, precision)?;

        // a[i:, i+k:] += (y tᵀ) (yᵀ a[i:, i+k:])
        let trailing = g.slice_in_minor_dims(a_work, vec![i, i + k], vec![m, n])?;
        let update = g.batch_dot(y, true, trailing, false, precision)?;
        let update = g.batch_dot(yt, false, update, false, precision)?;
        let trailing = g.add(trailing, update)?;
        a_work = g.update_slice_in_minor_dims(a_work, trailing, vec![i, i + k])?;

        // q[:, i:] += (q[:, i:] y) (y tᵀ)ᵀ
        let q_panel = g.slice_in_minor_dims(q, vec![0, i], vec![m, m])?;
        let update = g.batch_dot(q_panel, false, y, false, precision)?;
        let update = g.batch_dot(update, false, yt, true, precision)?;
        let q_panel = g.add(q_panel, update)?;
        q = g.update_slice_in_minor_dims(q, q_panel, vec![0, i])?;

        i += block_size;
    }

    let r = g.upper_triangle(a_work)?;
    Ok((q, r))
}
