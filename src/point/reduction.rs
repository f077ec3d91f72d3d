//! Active-subspace index maps for reduced mechanisms
//!
//! When mechanism reduction is active the mapping gradient is computed only
//! for the active species, plus temperature and pressure which are always
//! retained as the last two components. The context records the index
//! conversion between the full and the active composition space; the
//! reduction algorithm itself lives with the integrator.

/// Index maps between the full composition space and the active subspace.
///
/// Full-space layout: species 0..n_species, then temperature, then pressure.
/// Active-space layout: active species 0..n_active, then temperature, then
/// pressure. The context is frozen at leaf creation and never mutated.
#[derive(Debug, Clone, PartialEq)]
pub struct ReductionContext {
    full_to_active: Vec<Option<usize>>,
    active_to_full: Vec<usize>,
    inert_index: Option<usize>,
}

impl ReductionContext {
    /// Build a context from the active-species flags of a full mechanism.
    pub fn from_active_flags(active: &[bool], inert_index: Option<usize>) -> Self {
        let mut full_to_active = vec![None; active.len()];
        let mut active_to_full = Vec::new();
        for (full, &is_active) in active.iter().enumerate() {
            if is_active {
                full_to_active[full] = Some(active_to_full.len());
                active_to_full.push(full);
            }
        }
        Self {
            full_to_active,
            active_to_full,
            inert_index,
        }
    }

    /// Number of active species (excluding temperature and pressure).
    pub fn n_active(&self) -> usize {
        self.active_to_full.len()
    }

    /// Number of species in the full mechanism.
    pub fn n_species(&self) -> usize {
        self.full_to_active.len()
    }

    /// Dimension of the active subspace: active species + T + p.
    pub fn reduced_size(&self) -> usize {
        self.n_active() + 2
    }

    /// Active index of a full-space species, or None if inactive.
    pub fn active_of(&self, full: usize) -> Option<usize> {
        self.full_to_active[full]
    }

    /// Full-space index of a reduced-space component. Rows past the active
    /// species map onto temperature and pressure.
    pub fn full_of(&self, reduced: usize, full_size: usize) -> usize {
        if reduced < self.n_active() {
            self.active_to_full[reduced]
        } else {
            full_size - 2 + (reduced - self.n_active())
        }
    }

    /// Index of the inert species, if one is declared.
    pub fn inert_index(&self) -> Option<usize> {
        self.inert_index
    }

    /// Gather a full-space vector into the active subspace.
    pub fn gather(&self, full: &nalgebra::DVector<f64>) -> nalgebra::DVector<f64> {
        let n = full.len();
        let mut reduced = nalgebra::DVector::zeros(self.reduced_size());
        for r in 0..self.reduced_size() {
            reduced[r] = full[self.full_of(r, n)];
        }
        reduced
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use nalgebra::DVector;

    #[test]
    fn maps_round_trip() {
        let ctx = ReductionContext::from_active_flags(&[true, false, true, false], Some(3));
        assert_eq!(ctx.n_active(), 2);
        assert_eq!(ctx.reduced_size(), 4);
        assert_eq!(ctx.active_of(0), Some(0));
        assert_eq!(ctx.active_of(1), None);
        assert_eq!(ctx.active_of(2), Some(1));
        // full space: 4 species + T + p
        assert_eq!(ctx.full_of(0, 6), 0);
        assert_eq!(ctx.full_of(1, 6), 2);
        assert_eq!(ctx.full_of(2, 6), 4); // temperature
        assert_eq!(ctx.full_of(3, 6), 5); // pressure
    }

    #[test]
    fn gather_picks_active_and_thermo() {
        let ctx = ReductionContext::from_active_flags(&[true, false, true, false], None);
        let full = DVector::from_vec(vec![1.0, 2.0, 3.0, 4.0, 300.0, 101_325.0]);
        let reduced = ctx.gather(&full);
        assert_eq!(reduced.as_slice(), &[1.0, 3.0, 300.0, 101_325.0]);
    }
}
