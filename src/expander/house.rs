//! Householder reflector emission.
//!
//! Emits the graph fragment computing `H = I - tau v vᵀ` such that
//! `H·x` zeros every entry of `x` below the pivot row `k`:
//!
//! ```text
//! alpha = x[k]
//! sigma = <x[k+1:], x[k+1:]>
//! if sigma == 0:  beta = alpha, tau = 0, v = e_k
//! else:           beta = -sign(alpha) * sqrt(alpha^2 + sigma)
//!                 tau  = (beta - alpha) / beta
//!                 v    = e_k + x[k+1:] / (alpha - beta)
//! ```
//!
//! The pivot `k` is a runtime scalar (the panel loop counter), so the
//! `k+1:` ranges are realized by masking against an index vector rather
//! than slicing; both branches of the degenerate case are computed and
//! merged with selects, with the divisor forced to 1 in masked-out lanes
//! so no division by zero is ever emitted. The sign choice
//! `beta = -sign(alpha)·‖x[k:]‖` (sign of 0 taken as +1) avoids
//! cancellation in `alpha - beta`.
//!
//! No overflow rescaling of the norm is performed.

use crate::graph::{BinaryOp, Graph, ValueId};
use crate::types::ExpandResult;

/// A single reflector: direction `v` (`[..., m]`, unit at the pivot),
/// scalar `tau` and reflected diagonal entry `beta` (both `[...]`).
pub(crate) struct House {
    pub v: ValueId,
    pub tau: ValueId,
    pub beta: ValueId,
}

/// Emit one reflector from the column `x` (`[..., m]`) at pivot row `k`.
pub(crate) fn emit_house(
    g: &mut Graph,
    x: ValueId,
    k: ValueId,
    batch_dims: &[usize],
    m: usize,
) -> ExpandResult<House> {
    let dtype = g.shape(x)?.dtype;
    let minor_dim = batch_dims.len();
    let batch_dim_ids: Vec<usize> = (0..minor_dim).collect();

    let zero = g.scalar(0.0, dtype)?;
    let one = g.scalar(1.0, dtype)?;
    let minus_one = g.scalar(-1.0, dtype)?;

    // alpha = x[k]
    let x_k = g.dynamic_slice_in_minor_dims(x, &[k], vec![1])?;
    let alpha = g.reshape(x_k, batch_dims.to_vec())?;

    // x with elements 0..k masked to zero
    let iota = g.iota_vec(m)?;
    let tail_pred = g.gt(iota, k)?;
    let tail_mask = g.convert(tail_pred, dtype)?;
    let x_after_k = g.binary_bcast(BinaryOp::Mul, x, tail_mask, &[minor_dim])?;

    // sigma = <x[k+1:], x[k+1:]>, mu = sqrt(alpha^2 + sigma)
    let tail_sq = g.square(x_after_k)?;
    let sigma = g.reduce_sum_last(tail_sq)?;
    let alpha_sq = g.square(alpha)?;
    let mu_sq = g.add(alpha_sq, sigma)?;
    let mu = g.sqrt(mu_sq)?;

    let sigma_is_zero = g.eq(sigma, zero)?;

    let alpha_is_neg = g.lt(alpha, zero)?;
    let sign = g.select(alpha_is_neg, one, minus_one)?;
    let signed_mu = g.mul(sign, mu)?;
    let beta = g.select(sigma_is_zero, alpha, signed_mu)?;

    let beta_minus_alpha = g.sub(beta, alpha)?;
    let tau_full = g.div(beta_minus_alpha, beta)?;
    let zero_b = g.broadcast(zero, batch_dims)?;
    let tau = g.select(sigma_is_zero, zero_b, tau_full)?;

    // Any nonzero divisor works in the degenerate branch: the tail it
    // divides is already all zero there.
    let one_b = g.broadcast(one, batch_dims)?;
    let alpha_minus_beta = g.sub(alpha, beta)?;
    let divisor = g.select(sigma_is_zero, one_b, alpha_minus_beta)?;

    // v = e_k + x[k+1:] / divisor
    let pivot_pred = g.eq(iota, k)?;
    let e_k = g.convert(pivot_pred, dtype)?;
    let e_k = g.broadcast(e_k, &vec![1; minor_dim])?;
    let tail = g.binary_bcast(BinaryOp::Div, x_after_k, divisor, &batch_dim_ids)?;
    let v = g.add(e_k, tail)?;

    Ok(House { v, tau, beta })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::interp::{Interpreter, Tensor};
    use crate::module::Module;
    use crate::types::{DType, Shape};

    /// Run the reflector on a concrete vector at a concrete pivot.
    fn run_house(x: &[f64], k: usize) -> (Vec<f64>, f64, f64) {
        let m = x.len();
        let mut g = Graph::new("house");
        let xp = g.parameter(Shape::new(vec![m], DType::F64));
        let kp = g.parameter(Shape::scalar(DType::S32));
        let house = emit_house(&mut g, xp, kp, &[], m).unwrap();
        g.set_outputs(vec![house.v, house.tau, house.beta]);

        let module = Module::new(Graph::new("main"));
        let interp = Interpreter::new(&module);
        let outs = interp
            .eval_graph(
                &g,
                &[
                    Tensor::from_f64(vec![m], x.to_vec()).unwrap(),
                    Tensor::scalar(k as f64, DType::S32),
                ],
            )
            .unwrap();
        (
            outs[0].data().to_vec(),
            outs[1].data()[0],
            outs[2].data()[0],
        )
    }

    #[test]
    fn reflector_zeros_the_tail() {
        let x = [3.0, 4.0, 0.0, 5.0];
        let (v, tau, beta) = run_house(&x, 0);
        // beta = -sign(3) * ||x|| = -sqrt(50)
        assert!((beta + 50.0_f64.sqrt()).abs() < 1e-12, "beta = {beta}");
        assert_eq!(v[0], 1.0);
        // H x = x - tau v (v.x) must equal beta e_0
        let vx: f64 = v.iter().zip(&x).map(|(a, b)| a * b).sum();
        let hx: Vec<f64> = x.iter().zip(&v).map(|(xi, vi)| xi - tau * vi * vx).collect();
        assert!((hx[0] - beta).abs() < 1e-12);
        for &e in &hx[1..] {
            assert!(e.abs() < 1e-12, "tail not annihilated: {hx:?}");
        }
    }

    #[test]
    fn pivot_below_top_masks_head() {
        let x = [7.0, 1.0, 2.0, 2.0];
        let (v, tau, beta) = run_house(&x, 1);
        // Rows above the pivot do not participate.
        assert_eq!(v[0], 0.0);
        assert_eq!(v[1], 1.0);
        assert!((beta + 3.0).abs() < 1e-12, "beta = {beta}");
        assert!(tau > 0.0);
    }

    #[test]
    fn zero_tail_reduces_to_identity() {
        let (v, tau, beta) = run_house(&[2.0, 0.0, 0.0], 0);
        assert_eq!(tau, 0.0);
        assert_eq!(beta, 2.0);
        assert_eq!(v, vec![1.0, 0.0, 0.0]);
    }

    #[test]
    fn sign_of_zero_alpha_is_positive() {
        // alpha = 0 with a nonzero tail: beta = -(+1) * ||tail||
        let (_, tau, beta) = run_house(&[0.0, 3.0, 4.0], 0);
        assert!((beta + 5.0).abs() < 1e-12, "beta = {beta}");
        assert!((tau - 1.0).abs() < 1e-12, "tau = {tau}");
    }

    #[test]
    fn negative_alpha_flips_beta_positive() {
        let (_, _, beta) = run_house(&[-3.0, 4.0], 0);
        assert!((beta - 5.0).abs() < 1e-12, "beta = {beta}");
    }

    #[test]
    fn batched_reflectors_are_independent() {
        let m = 3;
        let mut g = Graph::new("house");
        let xp = g.parameter(Shape::new(vec![2, m], DType::F64));
        let kp = g.parameter(Shape::scalar(DType::S32));
        let house = emit_house(&mut g, xp, kp, &[2], m).unwrap();
        g.set_outputs(vec![house.tau, house.beta]);

        let module = Module::new(Graph::new("main"));
        let interp = Interpreter::new(&module);
        // Batch 0 degenerate (zero tail), batch 1 not.
        let outs = interp
            .eval_graph(
                &g,
                &[
                    Tensor::from_f64(vec![2, m], vec![5.0, 0.0, 0.0, 3.0, 0.0, 4.0]).unwrap(),
                    Tensor::scalar(0.0, DType::S32),
                ],
            )
            .unwrap();
        let tau = outs[0].data();
        let beta = outs[1].data();
        assert_eq!(tau[0], 0.0);
        assert_eq!(beta[0], 5.0);
        assert!(tau[1] != 0.0);
        assert!((beta[1] + 5.0).abs() < 1e-12);
    }
}
