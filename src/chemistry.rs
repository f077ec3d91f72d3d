//! The collaborator interface to the chemistry integrator
//!
//! The cache never depends on a concrete integrator: everything it consumes
//! crosses this trait. `integrate` is the slow truth source invoked only by
//! the [`map`](crate::IsatCache::map) convenience driver on a miss; the
//! retrieve/grow/add surface itself takes mappings from the caller.

use nalgebra::{DMatrix, DVector};

use crate::point::ReductionContext;

/// Narrow view of the reacting-flow integrator.
pub trait Chemistry {
    /// Number of species in the full mechanism.
    fn n_species(&self) -> usize;

    /// Size of the composition space: species + temperature + pressure.
    fn n_eqns(&self) -> usize {
        self.n_species() + 2
    }

    /// Current simulation time; stamps creation and retrieve times.
    fn current_time(&self) -> f64;

    /// Integrate the chemistry ODE from φ over the sub-step, returning the
    /// mapping R(φ) and its gradient A. The gradient lives in the active
    /// subspace whenever [`reduction`](Self::reduction) is in effect.
    fn integrate(&mut self, phi: &DVector<f64>) -> (DVector<f64>, DMatrix<f64>);

    /// Active-species context of the mechanism reduction, if one is in
    /// effect. May change between calls but is constant during a single
    /// retrieve; the cache re-reads it per stored sample.
    fn reduction(&self) -> Option<ReductionContext> {
        None
    }
}
