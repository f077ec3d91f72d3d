//! Cache configuration
//!
//! One plain struct carrying every tuning knob of the cache and its tree,
//! with the conventional defaults filled in by the constructor. Fields are
//! public; callers override what they need after construction.

use nalgebra::DVector;

/// Tuning parameters for [`IsatCache`](crate::IsatCache) and its tree.
#[derive(Debug, Clone)]
pub struct IsatConfig {
    /// Interpolation tolerance ε, propagated to every new leaf.
    pub tolerance: f64,
    /// Per-component scale factors for species, temperature and pressure.
    pub scale_factor: DVector<f64>,
    /// Capacity of the tree in leaves.
    pub max_elements: usize,
    /// Leaf-visit budget of the secondary search; 0 disables it.
    pub max_2nd_search: usize,
    /// Tree size below which `balance` does nothing.
    pub min_balance_threshold: usize,
    /// How many candidate split directions a rebuild may examine.
    pub max_nb_balance_test: usize,
    /// Acceptable split range: the left-leaf count must land within
    /// [balance_prop·size, (1 − balance_prop)·size].
    pub balance_prop: f64,
    /// Length of the most-recently-used list; 0 disables it.
    pub mru_size: usize,
    /// Scan the MRU list after a failed primary and secondary retrieve.
    pub mru_retrieve: bool,
    /// Secondary-retrieve proportion above which a cleaning is requested.
    pub max_2nd_ret_balance: f64,
    /// A cleaning rebalances once depth exceeds
    /// max_depth_factor · log₂(size).
    pub max_depth_factor: f64,
    /// Minimum simulation-time gap between full expiry sweeps.
    pub check_entire_tree_interval: f64,
    /// A leaf older than this is flagged for removal at the next sweep.
    pub chp_max_life_time: f64,
    /// A leaf unused for longer than this is flagged for removal.
    pub chp_max_use_interval: f64,
    /// Master switch for `clean_and_balance`.
    pub clean: bool,
    /// Time-handling mode of the integrator; opaque to the cache.
    pub tau_star: bool,
}

impl IsatConfig {
    /// Defaults for a composition space described by `scale_factor`
    /// (species scales followed by temperature and pressure scales).
    pub fn new(tolerance: f64, scale_factor: DVector<f64>, max_elements: usize) -> Self {
        let n_species = scale_factor.len().saturating_sub(2);
        Self {
            tolerance,
            scale_factor,
            max_elements,
            max_2nd_search: 0,
            min_balance_threshold: max_elements / 10,
            max_nb_balance_test: (n_species / 100).max(1),
            balance_prop: 0.35,
            mru_size: 0,
            mru_retrieve: false,
            max_2nd_ret_balance: 0.1,
            max_depth_factor: 2.0,
            check_entire_tree_interval: 0.0,
            chp_max_life_time: f64::INFINITY,
            chp_max_use_interval: f64::INFINITY,
            clean: true,
            tau_star: false,
        }
    }

    /// Size of the composition space.
    pub fn n_eqns(&self) -> usize {
        self.scale_factor.len()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn derived_defaults() {
        let config = IsatConfig::new(1.0e-4, DVector::from_element(55, 1.0), 10_000);
        assert_eq!(config.min_balance_threshold, 1_000);
        assert_eq!(config.max_nb_balance_test, 1, "53 species floor to one test");
        assert_eq!(config.max_2nd_search, 0, "secondary search off by default");
        assert_eq!(config.n_eqns(), 55);
        assert!(config.clean);
    }

    #[test]
    fn balance_tests_scale_with_the_mechanism() {
        let config = IsatConfig::new(1.0e-4, DVector::from_element(502, 1.0), 100);
        assert_eq!(config.max_nb_balance_test, 5);
    }
}
