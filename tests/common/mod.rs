//! Shared fixtures: mock chemistries and point builders
#![allow(dead_code)]

use isat_cache::{Chemistry, CompositionPoint, IsatCache, IsatConfig};
use nalgebra::{DMatrix, DVector};

/// Linear mapping R(φ) = M·φ with constant gradient M; with M = I every
/// grow check passes, so the cache degenerates to one ever-growing leaf
/// unless samples are added directly.
#[derive(Debug, Clone)]
pub struct LinearChemistry {
    pub matrix: DMatrix<f64>,
    pub time: f64,
    pub integrations: usize,
}

impl LinearChemistry {
    pub fn identity(n_eqns: usize) -> Self {
        Self {
            matrix: DMatrix::identity(n_eqns, n_eqns),
            time: 0.0,
            integrations: 0,
        }
    }
}

impl Chemistry for LinearChemistry {
    fn n_species(&self) -> usize {
        self.matrix.nrows().saturating_sub(2)
    }

    fn current_time(&self) -> f64 {
        self.time
    }

    fn integrate(&mut self, phi: &DVector<f64>) -> (DVector<f64>, DMatrix<f64>) {
        self.integrations += 1;
        (&self.matrix * phi, self.matrix.clone())
    }
}

/// Componentwise quadratic mapping R_i = φ_i + q·φ_i²: the interpolation
/// error grows with distance, so grows fail beyond ~√(ε/q) and samples get
/// stored instead.
#[derive(Debug, Clone)]
pub struct QuadraticChemistry {
    pub q: f64,
    pub n_eqns: usize,
    pub time: f64,
    pub integrations: usize,
}

impl Chemistry for QuadraticChemistry {
    fn n_species(&self) -> usize {
        self.n_eqns.saturating_sub(2)
    }

    fn current_time(&self) -> f64 {
        self.time
    }

    fn integrate(&mut self, phi: &DVector<f64>) -> (DVector<f64>, DMatrix<f64>) {
        self.integrations += 1;
        let r = phi.map(|x| x + self.q * x * x);
        let jac = DMatrix::from_diagonal(&phi.map(|x| 1.0 + 2.0 * self.q * x));
        (r, jac)
    }
}

pub fn v2(x: f64, y: f64) -> DVector<f64> {
    DVector::from_vec(vec![x, y])
}

pub fn identity2() -> DMatrix<f64> {
    DMatrix::identity(2, 2)
}

/// Two-dimensional composition space (temperature and pressure only), unit
/// scales.
pub fn config2(tolerance: f64, max_elements: usize) -> IsatConfig {
    IsatConfig::new(tolerance, DVector::from_element(2, 1.0), max_elements)
}

pub fn cache2(tolerance: f64, max_elements: usize) -> IsatCache<LinearChemistry> {
    IsatCache::new(config2(tolerance, max_elements), LinearChemistry::identity(2))
}

/// Identity-gradient point for direct tree surgery.
pub fn point_at(x: f64, y: f64, eps_tol: f64) -> CompositionPoint {
    CompositionPoint::new(
        v2(x, y),
        v2(x, y),
        identity2(),
        DVector::from_element(2, 1.0),
        eps_tol,
        0.0,
        None,
    )
    .expect("identity gradient is regular")
}
