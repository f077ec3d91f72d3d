//! Stored composition points and their ellipsoids of accuracy
//!
//! A point stores one sample of the tabulated mapping: the composition φ,
//! its mapping R(φ), the mapping gradient A, and a region around φ in which
//! linear interpolation R̂(φq) = R(φ) + A·(φq − φ) is trusted to the
//! tolerance ε. That region, the ellipsoid of accuracy (EOA), is
//!
//!   E = {x : ‖Lᵀ·(x − φ)‖ ≤ 1},
//!
//! with Lᵀ the triangular factor of the QR decomposition of B·A/ε and
//! B = diag(1/s) the inverse scale matrix. An SVD pass clamps the singular
//! values to dᵢ ≥ ½ so no principal semi-axis 1/dᵢ exceeds 2 in a
//! near-singular gradient direction.
//!
//! Membership is tested in two stages: a radius bracket from the extreme
//! singular values (O(n)), then the full ‖Lᵀd‖² product (O(n²)) only for
//! the undecided band. Growing the EOA to absorb a point the linear
//! interpolation handled within tolerance uses the minimum-volume ellipsoid
//! enclosing E and the point, applied as a rank-one update of Lᵀ.

mod reduction;

pub use reduction::ReductionContext;

use nalgebra::{DMatrix, DVector};

use crate::linalg;
use crate::tree::NodeId;
use crate::IsatError;

/// Tolerance band absorbing the plane-rotation round-off accumulated by
/// grows; a point grown onto the boundary must keep testing inside.
const EOA_SLACK: f64 = 1.0e-10;

/// A tabulated composition sample with its ellipsoid of accuracy.
#[derive(Debug, Clone)]
pub struct CompositionPoint {
    /// Composition: species mass fractions, temperature, pressure (scaled).
    phi: DVector<f64>,
    /// Stored mapping R(φ).
    r_phi: DVector<f64>,
    /// Mapping gradient; lives in the active subspace when reduced.
    a: DMatrix<f64>,
    /// Lᵀ factor of the EOA.
    lt: DMatrix<f64>,
    /// Qᵀ factor kept so grows update Lᵀ in O(n²).
    qt: DMatrix<f64>,
    /// Full-space scale factors.
    scale_factor: DVector<f64>,
    /// Scale factors gathered onto the gradient's rows.
    scale_rows: Vec<f64>,
    eps_tol: f64,
    space_size: usize,
    /// Radius bracket in the scaled metric: inside below, outside above.
    r_min2: f64,
    r_max2: f64,
    n_used: usize,
    n_grown: usize,
    time_tag: f64,
    last_time_used: f64,
    last_error: f64,
    to_remove: bool,
    node: Option<NodeId>,
    reduction: Option<ReductionContext>,
}

impl CompositionPoint {
    /// Build a point and its initial EOA from an integration result.
    ///
    /// Fails with [`IsatError::DegenerateEoa`] when the scaled gradient has
    /// a zero column norm, carries non-finite entries, or its SVD does not
    /// converge; the caller must discard the sample.
    #[allow(clippy::too_many_arguments)]
    pub fn new(
        phi: DVector<f64>,
        r_phi: DVector<f64>,
        a: DMatrix<f64>,
        scale_factor: DVector<f64>,
        eps_tol: f64,
        time: f64,
        reduction: Option<ReductionContext>,
    ) -> Result<Self, IsatError> {
        let space_size = phi.len();
        let dim = a.nrows();

        let scale_rows: Vec<f64> = match &reduction {
            Some(ctx) => (0..dim)
                .map(|r| scale_factor[ctx.full_of(r, space_size)])
                .collect(),
            None => scale_factor.iter().copied().collect(),
        };

        let scaled = linalg::scaled_gradient(&a, &scale_rows, eps_tol);
        if scaled.iter().any(|x| !x.is_finite()) {
            return Err(IsatError::DegenerateEoa {
                reason: "non-finite scaled gradient".to_string(),
            });
        }
        for j in 0..scaled.ncols() {
            if scaled.column(j).norm() == 0.0 {
                return Err(IsatError::DegenerateEoa {
                    reason: format!("zero column norm in scaled gradient (column {j})"),
                });
            }
        }

        let (q, mut lt) = scaled.qr().unpack();
        let qt = q.transpose();

        // Clamp the semi-axis lengths: dᵢ ≥ ½.
        let svd = lt
            .clone()
            .try_svd(true, true, f64::EPSILON, 1000)
            .ok_or_else(|| IsatError::DegenerateEoa {
                reason: "SVD of the ellipsoid factor did not converge".to_string(),
            })?;
        let (Some(u), Some(v_t)) = (svd.u, svd.v_t) else {
            return Err(IsatError::DegenerateEoa {
                reason: "SVD factors unavailable".to_string(),
            });
        };
        let mut d = svd.singular_values;
        for di in d.iter_mut() {
            if *di < 0.5 {
                *di = 0.5;
            }
        }
        lt = &u * DMatrix::from_diagonal(&d) * &v_t;

        let (r_min2, r_max2) = radius_bracket(&lt, &scale_rows)?;

        Ok(Self {
            phi,
            r_phi,
            a,
            lt,
            qt,
            scale_factor,
            scale_rows,
            eps_tol,
            space_size,
            r_min2,
            r_max2,
            n_used: 0,
            n_grown: 0,
            time_tag: time,
            last_time_used: time,
            last_error: 0.0,
            to_remove: false,
            node: None,
            reduction,
        })
    }

    /// Is the query composition inside the ellipsoid of accuracy?
    ///
    /// Pure test: usage counters are bumped by the cache on a confirmed
    /// retrieve, not here.
    pub fn in_eoa(&self, phiq: &DVector<f64>) -> bool {
        if self.lt.nrows() == 0 {
            // data cleared; the point can no longer serve retrieves
            return false;
        }
        let dphi = phiq - &self.phi;
        let d = self.gathered(&dphi);

        let mut r2 = 0.0;
        for i in 0..d.len() {
            let t = d[i] / self.scale_rows[i];
            r2 += t * t;
        }
        if r2 <= self.r_min2 {
            return true;
        }
        if r2 > self.r_max2 * (1.0 + EOA_SLACK) {
            return false;
        }

        (&self.lt * &d).norm_squared() <= 1.0 + EOA_SLACK
    }

    /// Does the freshly integrated mapping stay within tolerance of the
    /// linear interpolation? True means the EOA may grow to the query.
    ///
    /// ε_grow = ‖B·(ΔR − A·Δφ)‖ with ΔR = R(φq) − R(φ), Δφ = φq − φ.
    pub fn check_solution(&mut self, phiq: &DVector<f64>, r_phiq: &DVector<f64>) -> bool {
        let dphi = self.gathered(&(phiq - &self.phi));
        let dr = self.gathered(&(r_phiq - &self.r_phi));
        let dr_lin = &self.a * &dphi;

        let mut err2 = 0.0;
        for i in 0..dr.len() {
            let e = (dr[i] - dr_lin[i]) / self.scale_rows[i];
            err2 += e * e;
        }
        self.last_error = err2.sqrt();
        self.last_error <= self.eps_tol
    }

    /// Expand the EOA to the minimum-volume ellipsoid enclosing it and φq.
    ///
    /// Precondition: [`check_solution`](Self::check_solution) held for φq.
    /// Returns false without touching the factor when φq is already inside
    /// (‖p′‖ ≤ 1). Otherwise applies Lᵀ ← (I + γ·p′·p′ᵀ)·Lᵀ with
    /// γ = (1/‖p′‖ − 1)/‖p′‖² through the rank-one QR update.
    pub fn grow(&mut self, phiq: &DVector<f64>) -> bool {
        let dphi = self.gathered(&(phiq - &self.phi));
        let p = &self.lt * &dphi;
        let norm_p = p.norm();
        if norm_p <= 1.0 {
            return false;
        }

        let gamma = (1.0 / norm_p - 1.0) / (norm_p * norm_p);
        let u = &p * gamma;
        let v = self.lt.transpose() * &p;
        linalg::qr_update(&mut self.lt, &mut self.qt, &u, &v);

        // The smallest singular value shrinks by at most 1/‖p′‖, so the
        // reject radius inflates by ‖p′‖; the accept radius is untouched
        // because the grown ellipsoid contains the old one.
        self.r_max2 *= norm_p * norm_p;
        self.n_grown += 1;
        tracing::debug!(norm_p, n_grown = self.n_grown, "ellipsoid of accuracy grown");
        true
    }

    /// Linear interpolation R̂ = R(φ) + A·(φq − φ).
    ///
    /// With a reduced gradient the product runs in the active subspace and
    /// inactive species pass through with unit gradient.
    pub fn interpolate(&self, phiq: &DVector<f64>) -> DVector<f64> {
        let dphi = phiq - &self.phi;
        match &self.reduction {
            None => &self.r_phi + &self.a * &dphi,
            Some(ctx) => {
                let dr_red = &self.a * ctx.gather(&dphi);
                let mut r = &self.r_phi + &dphi;
                for row in 0..dr_red.len() {
                    let full = ctx.full_of(row, self.space_size);
                    r[full] = self.r_phi[full] + dr_red[row];
                }
                r
            }
        }
    }

    fn gathered(&self, full: &DVector<f64>) -> DVector<f64> {
        match &self.reduction {
            Some(ctx) => ctx.gather(full),
            None => full.clone(),
        }
    }

    /// Record a confirmed retrieve.
    pub fn mark_retrieved(&mut self, now: f64) {
        self.n_used += 1;
        self.last_time_used = now;
    }

    /// Drop the heavy factors; φ and the bookkeeping survive.
    pub fn clear_data(&mut self) {
        self.a = DMatrix::zeros(0, 0);
        self.lt = DMatrix::zeros(0, 0);
        self.qt = DMatrix::zeros(0, 0);
    }

    /// Detach from the owning node slot.
    pub fn set_free(&mut self) {
        self.node = None;
    }

    pub(crate) fn attach(&mut self, node: NodeId) {
        self.node = Some(node);
    }

    /// The node whose child slot holds this leaf, None while detached.
    pub fn node(&self) -> Option<NodeId> {
        self.node
    }

    /// Stored composition.
    pub fn phi(&self) -> &DVector<f64> {
        &self.phi
    }

    /// Stored mapping R(φ).
    pub fn r_phi(&self) -> &DVector<f64> {
        &self.r_phi
    }

    /// Mapping gradient A.
    pub fn gradient(&self) -> &DMatrix<f64> {
        &self.a
    }

    pub(crate) fn lt(&self) -> &DMatrix<f64> {
        &self.lt
    }

    /// Mechanism-reduction context frozen at creation, if any.
    pub fn reduction(&self) -> Option<&ReductionContext> {
        self.reduction.as_ref()
    }

    /// Confirmed retrieves served by this point.
    pub fn n_used(&self) -> usize {
        self.n_used
    }

    /// Times the ellipsoid has grown.
    pub fn n_grown(&self) -> usize {
        self.n_grown
    }

    /// Creation time.
    pub fn time_tag(&self) -> f64 {
        self.time_tag
    }

    /// Time of the last confirmed retrieve.
    pub fn last_time_used(&self) -> f64 {
        self.last_time_used
    }

    /// Most recent ε_grow computed by `check_solution`. Advisory.
    pub fn last_error(&self) -> f64 {
        self.last_error
    }

    /// Has the cache flagged this point for eviction?
    pub fn to_remove(&self) -> bool {
        self.to_remove
    }

    pub(crate) fn flag_for_removal(&mut self) {
        self.to_remove = true;
    }
}

/// Radius bracket of E in the scaled metric, from the extreme singular
/// values of Lᵀ·diag(s): r² ≤ r_min² is inside, r² > r_max² is outside.
fn radius_bracket(lt: &DMatrix<f64>, scale_rows: &[f64]) -> Result<(f64, f64), IsatError> {
    let mut c = lt.clone();
    for (j, s) in scale_rows.iter().enumerate() {
        for i in 0..c.nrows() {
            c[(i, j)] *= s;
        }
    }
    let sv = c
        .try_svd(false, false, f64::EPSILON, 1000)
        .ok_or_else(|| IsatError::DegenerateEoa {
            reason: "SVD of the radius bracket did not converge".to_string(),
        })?
        .singular_values;
    let smax = sv.max();
    let smin = sv.min();
    if !(smin > 0.0 && smax.is_finite()) {
        return Err(IsatError::DegenerateEoa {
            reason: "singular ellipsoid factor after clamping".to_string(),
        });
    }
    Ok((1.0 / (smax * smax), 1.0 / (smin * smin)))
}

#[cfg(test)]
mod tests {
    use super::*;

    fn identity_point(eps: f64) -> CompositionPoint {
        let n = 2;
        CompositionPoint::new(
            DVector::zeros(n),
            DVector::zeros(n),
            DMatrix::identity(n, n),
            DVector::from_element(n, 1.0),
            eps,
            0.0,
            None,
        )
        .expect("identity gradient is regular")
    }

    #[test]
    fn initial_eoa_radius_is_tolerance() {
        let p = identity_point(1.0e-4);
        assert!(p.in_eoa(&DVector::from_vec(vec![0.0, 0.0])));
        assert!(p.in_eoa(&DVector::from_vec(vec![0.5e-4, 0.0])));
        assert!(!p.in_eoa(&DVector::from_vec(vec![2.0e-4, 0.0])));
        assert!(!p.in_eoa(&DVector::from_vec(vec![10.0, 0.0])));
    }

    #[test]
    fn clamp_caps_semi_axes_in_singular_directions() {
        // Second gradient row nearly vanishes: unclamped the semi-axis
        // along y would be 1e5/eps; the clamp caps it at 2.
        let a = DMatrix::from_row_slice(2, 2, &[1.0, 0.0, 0.0, 1.0e-9]);
        let p = CompositionPoint::new(
            DVector::zeros(2),
            DVector::zeros(2),
            a,
            DVector::from_element(2, 1.0),
            1.0e-4,
            0.0,
            None,
        )
        .expect("near-singular gradient is still buildable");
        assert!(p.in_eoa(&DVector::from_vec(vec![0.0, 1.9])));
        assert!(!p.in_eoa(&DVector::from_vec(vec![0.0, 2.1])));
    }

    #[test]
    fn zero_column_is_degenerate() {
        let a = DMatrix::from_row_slice(2, 2, &[1.0, 0.0, 0.0, 0.0]);
        let err = CompositionPoint::new(
            DVector::zeros(2),
            DVector::zeros(2),
            a,
            DVector::from_element(2, 1.0),
            1.0e-4,
            0.0,
            None,
        )
        .unwrap_err();
        assert!(matches!(err, IsatError::DegenerateEoa { .. }));
    }

    #[test]
    fn grow_reaches_the_query_point() {
        let mut p = identity_point(1.0e-4);
        let q = DVector::from_vec(vec![0.3, 0.0]);
        assert!(!p.in_eoa(&q));
        assert!(p.check_solution(&q, &q), "identity mapping is exact");
        assert!(p.grow(&q));
        assert_eq!(p.n_grown(), 1);
        assert!(p.in_eoa(&q));
        assert!(p.in_eoa(&DVector::from_vec(vec![0.29, 0.0])));
        assert!(!p.in_eoa(&DVector::from_vec(vec![0.31, 0.0])));
        // the orthogonal direction did not widen
        assert!(!p.in_eoa(&DVector::from_vec(vec![0.0, 0.01])));
    }

    #[test]
    fn grow_refuses_interior_points() {
        let mut p = identity_point(1.0e-4);
        assert!(!p.grow(&DVector::from_vec(vec![0.5e-4, 0.0])));
        assert_eq!(p.n_grown(), 0);
    }

    #[test]
    fn grow_near_unit_radius_is_stable() {
        let mut p = identity_point(1.0e-4);
        // barely outside: ‖p′‖ = 1 + 1e-7
        let q = DVector::from_vec(vec![1.0e-4 * (1.0 + 1.0e-7), 0.0]);
        assert!(p.grow(&q));
        assert!(p.in_eoa(&q));
        assert!(p.lt().iter().all(|x| x.is_finite()));
    }

    #[test]
    fn check_solution_rejects_large_interpolation_error() {
        let mut p = identity_point(1.0e-4);
        let q = DVector::from_vec(vec![0.3, 0.0]);
        // true mapping far from the linear prediction
        let r_true = DVector::from_vec(vec![0.9, 0.0]);
        assert!(!p.check_solution(&q, &r_true));
        assert!(p.last_error() > p.eps_tol);
    }

    #[test]
    fn interpolation_matches_stored_mapping_at_phi() {
        let p = identity_point(1.0e-4);
        let r = p.interpolate(p.phi());
        assert_eq!(r, *p.r_phi());
    }

    #[test]
    fn reduced_interpolation_passes_inactive_species_through() {
        // 3 species (middle inactive) + T + p; active gradient 3x3.
        let ctx = ReductionContext::from_active_flags(&[true, false, true], None);
        let phi = DVector::from_vec(vec![0.1, 0.2, 0.3, 1000.0, 1.0]);
        let r_phi = phi.clone();
        let a = DMatrix::<f64>::identity(4, 4) * 2.0;
        let p = CompositionPoint::new(
            phi.clone(),
            r_phi,
            a,
            DVector::from_element(5, 1.0),
            1.0e-4,
            0.0,
            Some(ctx),
        )
        .expect("reduced point builds");

        let mut q = phi.clone();
        q[0] += 0.01; // active
        q[1] += 0.05; // inactive
        let r = p.interpolate(&q);
        assert!((r[0] - (phi[0] + 2.0 * 0.01)).abs() < 1e-12, "active row uses A");
        assert!((r[1] - (phi[1] + 0.05)).abs() < 1e-12, "inactive row passes through");
    }

    #[test]
    fn cleared_point_never_retrieves() {
        let mut p = identity_point(1.0e-4);
        p.clear_data();
        assert!(!p.in_eoa(&DVector::zeros(2)));
    }

    #[test]
    fn retrieve_bookkeeping() {
        let mut p = identity_point(1.0e-4);
        p.mark_retrieved(3.5);
        p.mark_retrieved(4.0);
        assert_eq!(p.n_used(), 2);
        assert_eq!(p.last_time_used(), 4.0);
        assert_eq!(p.time_tag(), 0.0);
    }
}
