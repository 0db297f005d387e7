//! Numerical properties of emitted QR sub-programs.
//!
//! Each test builds the sub-program the expander would install for a given
//! operand shape, runs it through the reference interpreter on concrete
//! inputs, and checks the factorization:
//! - orthogonality: ‖QᵀQ − I‖_F ≤ ε·m
//! - reconstruction: ‖Q·R − A‖_F ≤ ε·‖A‖_F·max(m, n)
//! - triangularity, sign convention, batch independence, degenerate columns

use qr_expander::{
    build_qr_subprogram, DType, Graph, Interpreter, Module, Precision, Shape, Tensor,
};

/// Build and run the QR sub-program for one input.
fn run_qr(dims: &[usize], dtype: DType, data: Vec<f64>, block_size: usize) -> (Tensor, Tensor) {
    let shape = Shape::new(dims.to_vec(), dtype);
    let graph = build_qr_subprogram(&shape, block_size, Precision::Highest).unwrap();
    let module = Module::new(Graph::new("main"));
    let interp = Interpreter::new(&module);
    let input = Tensor::new(dims.to_vec(), dtype, data).unwrap();
    let mut outs = interp.eval_graph(&graph, &[input]).unwrap();
    let r = outs.pop().unwrap();
    let q = outs.pop().unwrap();
    (q, r)
}

/// Deterministic test data in [-1, 1) scaled by `scale`.
fn generate_data(n: usize, seed: u64, scale: f64) -> Vec<f64> {
    let mut data = Vec::with_capacity(n);
    let mut state = seed;
    for _ in 0..n {
        state = state.wrapping_mul(6364136223846793005).wrapping_add(1);
        let val = ((state >> 33) as f64) / (u32::MAX as f64) * 2.0 - 1.0;
        data.push(val * scale);
    }
    data
}

/// ‖QᵀQ − I‖_F for one batch slice of `q`.
fn orthogonality_error(q: &Tensor, batch: usize, m: usize) -> f64 {
    let mat = &q.data()[batch * m * m..(batch + 1) * m * m];
    let mut err = 0.0;
    for i in 0..m {
        for j in 0..m {
            let dot: f64 = (0..m).map(|t| mat[t * m + i] * mat[t * m + j]).sum();
            let want = if i == j { 1.0 } else { 0.0 };
            err += (dot - want) * (dot - want);
        }
    }
    err.sqrt()
}

/// ‖Q·R − A‖_F for one batch slice.
fn reconstruction_error(
    q: &Tensor,
    r: &Tensor,
    a: &[f64],
    batch: usize,
    m: usize,
    n: usize,
) -> f64 {
    let qm = &q.data()[batch * m * m..(batch + 1) * m * m];
    let rm = &r.data()[batch * m * n..(batch + 1) * m * n];
    let am = &a[batch * m * n..(batch + 1) * m * n];
    let mut err = 0.0;
    for row in 0..m {
        for col in 0..n {
            let acc: f64 = (0..m).map(|t| qm[row * m + t] * rm[t * n + col]).sum();
            let d = acc - am[row * n + col];
            err += d * d;
        }
    }
    err.sqrt()
}

fn frobenius(a: &[f64]) -> f64 {
    a.iter().map(|&x| x * x).sum::<f64>().sqrt()
}

fn check_factorization(dims: &[usize], dtype: DType, data: Vec<f64>, block_size: usize, eps: f64) {
    let rank = dims.len();
    let (m, n) = (dims[rank - 2], dims[rank - 1]);
    let batches: usize = dims[..rank - 2].iter().product();
    let (q, r) = run_qr(dims, dtype, data.clone(), block_size);
    for b in 0..batches {
        let ortho = orthogonality_error(&q, b, m);
        assert!(
            ortho <= eps * m as f64,
            "batch {b}: ‖QᵀQ − I‖ = {ortho}, bound {}",
            eps * m as f64
        );
        let a_slice = &data[b * m * n..(b + 1) * m * n];
        let recon = reconstruction_error(&q, &r, &data, b, m, n);
        let bound = eps * frobenius(a_slice).max(1.0) * m.max(n) as f64;
        assert!(recon <= bound, "batch {b}: ‖QR − A‖ = {recon}, bound {bound}");
        // Strictly lower rows of R are exact zeros, not small numbers.
        let rm = &r.data()[b * m * n..(b + 1) * m * n];
        for row in 0..m {
            for col in 0..n.min(row) {
                assert_eq!(rm[row * n + col], 0.0, "R[{row},{col}] not zero");
            }
        }
    }
}

#[test]
fn classic_three_by_three_f32() {
    let a = vec![12.0, -51.0, 4.0, 6.0, 167.0, -68.0, -4.0, 24.0, -41.0];
    let (q, r) = run_qr(&[3, 3], DType::F32, a.clone(), 128);
    // Expected R diagonal under the -sign(alpha)·norm convention.
    assert!((r.data()[0] + 14.0).abs() < 1e-3, "r00 = {}", r.data()[0]);
    assert!((r.data()[4] + 175.0).abs() < 1e-3, "r11 = {}", r.data()[4]);
    assert!((r.data()[8] - 35.0).abs() < 1e-3, "r22 = {}", r.data()[8]);
    let recon = reconstruction_error(&q, &r, &a, 0, 3, 3);
    assert!(recon < 1e-4 * frobenius(&a), "‖QR − A‖ = {recon}");
}

#[test]
fn classic_three_by_three_f64() {
    let a = vec![12.0, -51.0, 4.0, 6.0, 167.0, -68.0, -4.0, 24.0, -41.0];
    check_factorization(&[3, 3], DType::F64, a, 128, 1e-12);
}

#[test]
fn identity_input_passes_through() {
    let mut eye = vec![0.0; 25];
    for i in 0..5 {
        eye[i * 5 + i] = 1.0;
    }
    let (q, r) = run_qr(&[5, 5], DType::F64, eye.clone(), 128);
    // Every reflector is the identity: Q = I and R = I exactly.
    assert_eq!(q.data(), &eye[..]);
    assert_eq!(r.data(), &eye[..]);
}

#[test]
fn zero_matrix_stays_zero_without_nans() {
    let (q, r) = run_qr(&[4, 3], DType::F64, vec![0.0; 12], 128);
    for i in 0..4 {
        for j in 0..4 {
            let want = if i == j { 1.0 } else { 0.0 };
            assert_eq!(q.data()[i * 4 + j], want, "Q[{i},{j}]");
        }
    }
    for &x in r.data() {
        assert_eq!(x, 0.0, "R must be exactly zero with no NaNs");
    }
}

#[test]
fn upper_triangular_input_needs_no_reflections() {
    // Every column tail below the diagonal is already zero, so each step
    // hits the degenerate branch: tau = 0 and R[j,j] = A[j,j].
    let a = vec![2.0, 5.0, -3.0, 0.0, 4.0, 7.0, 0.0, 0.0, -6.0];
    let (q, r) = run_qr(&[3, 3], DType::F64, a.clone(), 128);
    for i in 0..3 {
        for j in 0..3 {
            let want = if i == j { 1.0 } else { 0.0 };
            assert_eq!(q.data()[i * 3 + j], want, "Q[{i},{j}] changed");
        }
    }
    assert_eq!(r.data(), &a[..]);
}

#[test]
fn sign_convention_opposes_alpha() {
    // alpha > 0 at the pivot: the emitted diagonal entry is negative.
    let (_, r) = run_qr(&[2, 1], DType::F64, vec![3.0, 4.0], 128);
    assert!((r.data()[0] + 5.0).abs() < 1e-12, "r00 = {}", r.data()[0]);
    // alpha < 0: positive diagonal.
    let (_, r) = run_qr(&[2, 1], DType::F64, vec![-3.0, 4.0], 128);
    assert!((r.data()[0] - 5.0).abs() < 1e-12, "r00 = {}", r.data()[0]);
    // alpha = 0 with a zero tail: diagonal stays zero.
    let (_, r) = run_qr(&[2, 1], DType::F64, vec![0.0, 0.0], 128);
    assert_eq!(r.data()[0], 0.0);
}

#[test]
fn batched_input_matches_per_slice_runs() {
    let data = generate_data(2 * 5 * 3, 7, 4.0);
    let (qb, rb) = run_qr(&[2, 5, 3], DType::F64, data.clone(), 128);
    for b in 0..2 {
        let slice = data[b * 15..(b + 1) * 15].to_vec();
        let (qs, rs) = run_qr(&[5, 3], DType::F64, slice, 128);
        for (x, y) in qb.data()[b * 25..(b + 1) * 25].iter().zip(qs.data()) {
            assert!((x - y).abs() < 1e-12, "Q batch {b} diverges: {x} vs {y}");
        }
        for (x, y) in rb.data()[b * 15..(b + 1) * 15].iter().zip(rs.data()) {
            assert!((x - y).abs() < 1e-12, "R batch {b} diverges: {x} vs {y}");
        }
    }
}

#[test]
fn tall_matrix_seven_by_three() {
    let data = generate_data(21, 11, 5.0);
    let (q, r) = run_qr(&[7, 3], DType::F64, data.clone(), 128);
    assert_eq!(q.dims, vec![7, 7]);
    assert_eq!(r.dims, vec![7, 3]);
    // Rows 3..7 of R are exactly zero.
    for row in 3..7 {
        for col in 0..3 {
            assert_eq!(r.data()[row * 3 + col], 0.0);
        }
    }
    check_factorization(&[7, 3], DType::F64, data, 128, 1e-12);
}

#[test]
fn wide_matrix_three_by_seven() {
    let data = generate_data(21, 13, 5.0);
    check_factorization(&[3, 7], DType::F64, data, 128, 1e-12);
}

#[test]
fn f32_tolerances_hold() {
    let data = generate_data(30, 17, 3.0);
    check_factorization(&[6, 5], DType::F32, data, 128, 1e-5);
}

#[test]
fn small_block_sizes_cover_multi_block_path() {
    let data = generate_data(42, 19, 2.0);
    for block_size in [1, 2, 3] {
        check_factorization(&[7, 6], DType::F64, data.clone(), block_size, 1e-12);
    }
}

#[test]
fn batched_f32_three_dim_batch() {
    let data = generate_data(3 * 2 * 4 * 3, 23, 1.0);
    check_factorization(&[3, 2, 4, 3], DType::F32, data, 128, 1e-5);
}

#[test]
fn single_row_and_single_column() {
    check_factorization(&[1, 4], DType::F64, generate_data(4, 29, 1.0), 128, 1e-12);
    check_factorization(&[4, 1], DType::F64, generate_data(4, 31, 1.0), 128, 1e-12);
}
