//! Dense kernels for the ellipsoid algebra
//!
//! The triangular factor Lᵀ of an ellipsoid E = {x : ‖Lᵀx‖ ≤ 1} is obtained
//! once by QR decomposition and thereafter modified only by rank-one updates
//! Lᵀ ← Lᵀ + u·vᵀ. Re-triangularising after such an update costs O(n²) with
//! two sweeps of Givens plane rotations instead of the O(n³) of a fresh
//! decomposition, provided the orthogonal factor Qᵀ is carried along.
//!
//! Decompositions (QR, SVD) come from nalgebra; the rank-one update is
//! written out here because no crate exposes one.

use nalgebra::{DMatrix, DVector};

/// Scaled gradient B·A/ε with B = diag(1/s).
///
/// Row i of the gradient is divided by s[i]·ε. The QR factor of this matrix
/// is the initial ellipsoid factor: ‖Lᵀd‖ ≤ 1 ⇔ ‖B·A·d‖ ≤ ε.
pub fn scaled_gradient(a: &DMatrix<f64>, row_scale: &[f64], eps_tol: f64) -> DMatrix<f64> {
    let mut scaled = a.clone();
    for (i, s) in row_scale.iter().enumerate() {
        let factor = 1.0 / (s * eps_tol);
        for j in 0..scaled.ncols() {
            scaled[(i, j)] *= factor;
        }
    }
    scaled
}

/// Rank-one update of a QR factorisation: R ← J·(R + u·vᵀ), Qᵀ ← J·Qᵀ.
///
/// J is the product of 2(n−1) Givens rotations: a first sweep over rows
/// n−2…0 rotates u onto e₀ (R becomes upper Hessenberg), the rank-one term
/// collapses onto row 0, and a second sweep restores the triangular profile.
/// Rotations act on full rows, so the result stays exact (J is orthogonal)
/// even when R carries fill-in from an earlier singular-value clamp.
pub fn qr_update(r: &mut DMatrix<f64>, qt: &mut DMatrix<f64>, u: &DVector<f64>, v: &DVector<f64>) {
    let n = r.nrows();
    if n == 0 {
        return;
    }
    let mut w = u.clone();

    // index of the last nonzero component of u
    let mut k = 0;
    for i in (0..n).rev() {
        if w[i] != 0.0 {
            k = i;
            break;
        }
    }

    for i in (0..k).rev() {
        rotate(r, qt, i, w[i], -w[i + 1]);
        w[i] = if w[i] == 0.0 {
            w[i + 1].abs()
        } else {
            w[i].hypot(w[i + 1])
        };
    }

    for j in 0..n {
        r[(0, j)] += w[0] * v[j];
    }

    for i in 0..k {
        let (a, b) = (r[(i, i)], r[(i + 1, i)]);
        rotate(r, qt, i, a, -b);
    }
}

/// Givens rotation of rows i and i+1 of both R and Qᵀ, chosen so that the
/// (implicit) vector (a, b) maps onto (√(a²+b²), 0).
fn rotate(r: &mut DMatrix<f64>, qt: &mut DMatrix<f64>, i: usize, a: f64, b: f64) {
    let (c, s) = if a == 0.0 {
        (0.0, if b >= 0.0 { 1.0 } else { -1.0 })
    } else if a.abs() > b.abs() {
        let f = b / a;
        let c = (1.0 / (1.0 + f * f).sqrt()).copysign(a);
        (c, f * c)
    } else {
        let f = a / b;
        let s = (1.0 / (1.0 + f * f).sqrt()).copysign(b);
        (f * s, s)
    };

    for j in 0..r.ncols() {
        let y = r[(i, j)];
        let w = r[(i + 1, j)];
        r[(i, j)] = c * y - s * w;
        r[(i + 1, j)] = s * y + c * w;
    }
    for j in 0..qt.ncols() {
        let y = qt[(i, j)];
        let w = qt[(i + 1, j)];
        qt[(i, j)] = c * y - s * w;
        qt[(i + 1, j)] = s * y + c * w;
    }
}
