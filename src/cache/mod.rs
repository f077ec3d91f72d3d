//! The tabulation cache
//!
//! Orchestrates the three outcomes of a query against the stored table:
//! retrieve (reuse a stored mapping through linear interpolation), grow
//! (widen a stored ellipsoid that proved accurate at the query), or add
//! (insert a freshly integrated sample, splitting a leaf). Retrieval runs
//! primary descent → bounded secondary search → most-recently-used scan;
//! whatever fails last leaves the primary leaf as the hint for the
//! follow-up grow or add.
//!
//! Housekeeping is deferred: capacity pressure and retrieval degradation
//! only flag work, and `clean_and_balance` performs the evictions, expiry
//! sweep and variance-axis rebuild in one place.

mod mru;

use mru::MruList;
use nalgebra::{DMatrix, DVector};

use crate::chemistry::Chemistry;
use crate::point::CompositionPoint;
use crate::tree::{BspTree, LeafId};
use crate::{IsatConfig, IsatError};

/// Outcome of a cache query.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Retrieve {
    /// A stored ellipsoid contains the query; interpolate from this leaf.
    Hit(LeafId),
    /// No stored ellipsoid contains the query. `hint` is the leaf the
    /// primary descent landed on, the split candidate for a follow-up
    /// `grow` or `add`; None only on an empty cache.
    Miss { hint: Option<LeafId> },
}

impl Retrieve {
    /// Did a stored ellipsoid cover the query?
    pub fn is_hit(&self) -> bool {
        matches!(self, Retrieve::Hit(_))
    }

    /// The hit leaf, if any.
    pub fn hit(&self) -> Option<LeafId> {
        match self {
            Retrieve::Hit(id) => Some(*id),
            Retrieve::Miss { .. } => None,
        }
    }
}

/// Advisory counters. The windowed retrieve counters reset on each
/// cleaning; the structural totals never do.
#[derive(Debug, Clone, Copy, Default, PartialEq)]
pub struct CacheStats {
    /// Stored leaves.
    pub size: usize,
    /// Tree depth in levels, leaves included.
    pub depth: usize,
    /// Retrieves since the last cleaning.
    pub tot_retrieve: usize,
    /// Primary-search misses since the last cleaning.
    pub n_failed_first: usize,
    /// Secondary-search hits since the last cleaning.
    pub n_2nd_retrieve: usize,
    /// MRU-scan hits since the last cleaning.
    pub n_mru_retrieve: usize,
    /// Successful grows over the cache lifetime.
    pub n_grown: usize,
    /// Samples stored over the cache lifetime.
    pub n_added: usize,
    /// Leaves deleted by evictions and expiry sweeps.
    pub n_evicted: usize,
}

/// In-situ adaptive tabulation cache over a [`BspTree`].
#[derive(Debug)]
pub struct IsatCache<C: Chemistry> {
    chemistry: C,
    config: IsatConfig,
    tree: BspTree,
    mru: MruList,
    /// Leaves flagged for eviction, deleted at the next cleaning. Weak ids.
    to_remove: Vec<LeafId>,
    tot_retrieve: usize,
    n_failed_first: usize,
    n_2nd_retrieve: usize,
    n_mru_retrieve: usize,
    n_grown: usize,
    n_added: usize,
    n_evicted: usize,
    cleaning_required: bool,
    previous_time: f64,
}

impl<C: Chemistry> IsatCache<C> {
    /// Empty cache over the given chemistry collaborator.
    ///
    /// Panics when the scale-factor length disagrees with the integrator's
    /// composition-space size.
    pub fn new(config: IsatConfig, chemistry: C) -> Self {
        assert_eq!(
            config.n_eqns(),
            chemistry.n_eqns(),
            "scale factor length must match the composition space"
        );
        let tree = BspTree::new(&config);
        let mru = MruList::new(config.mru_size);
        let previous_time = chemistry.current_time();
        Self {
            chemistry,
            config,
            tree,
            mru,
            to_remove: Vec::new(),
            tot_retrieve: 0,
            n_failed_first: 0,
            n_2nd_retrieve: 0,
            n_mru_retrieve: 0,
            n_grown: 0,
            n_added: 0,
            n_evicted: 0,
            cleaning_required: false,
            previous_time,
        }
    }

    /// Query the table for a stored ellipsoid containing φq.
    ///
    /// On a miss the caller integrates the true mapping and feeds it back
    /// through [`grow`](Self::grow) or [`add`](Self::add) with the returned
    /// hint.
    pub fn retrieve(&mut self, phiq: &DVector<f64>) -> Retrieve {
        self.tot_retrieve += 1;

        let primary = match self.tree.primary_search(phiq) {
            Some(id) => id,
            None => return Retrieve::Miss { hint: None },
        };
        if self.tree.leaf(primary).in_eoa(phiq) {
            self.record_hit(primary);
            tracing::trace!(?primary, "primary retrieve");
            return Retrieve::Hit(primary);
        }
        self.n_failed_first += 1;

        if self.config.max_2nd_search > 0 {
            if let Some(hit) = self.tree.secondary_search(phiq, primary) {
                self.n_2nd_retrieve += 1;
                if self.n_2nd_retrieve as f64
                    > self.config.max_2nd_ret_balance * self.tot_retrieve as f64
                {
                    self.cleaning_required = true;
                }
                self.record_hit(hit);
                tracing::trace!(?hit, "secondary retrieve");
                return Retrieve::Hit(hit);
            }
        }

        if self.config.mru_retrieve && self.config.mru_size > 0 {
            let found = self.mru.iter().find(|&id| self.tree.leaf(id).in_eoa(phiq));
            if let Some(id) = found {
                self.n_mru_retrieve += 1;
                self.record_hit(id);
                tracing::trace!(?id, "MRU retrieve");
                return Retrieve::Hit(id);
            }
        }

        Retrieve::Miss {
            hint: Some(primary),
        }
    }

    fn record_hit(&mut self, id: LeafId) {
        let now = self.chemistry.current_time();
        self.tree.leaf_mut(id).mark_retrieved(now);
        if self.config.mru_size > 0 {
            self.mru.touch(id);
        }
    }

    /// Interpolated mapping R̂ = R(φ₀) + A·(φq − φ₀) from a hit leaf.
    pub fn calc_new_c(&self, leaf: LeafId, phiq: &DVector<f64>) -> DVector<f64> {
        self.tree.leaf(leaf).interpolate(phiq)
    }

    /// Try to widen the hinted leaf's ellipsoid to cover φq.
    ///
    /// Succeeds iff the freshly integrated mapping stays within tolerance
    /// of the leaf's linear interpolation; the sample is then covered and
    /// need not be stored.
    pub fn grow(&mut self, leaf: LeafId, phiq: &DVector<f64>, r_phiq: &DVector<f64>) -> bool {
        let point = self.tree.leaf_mut(leaf);
        if !point.check_solution(phiq, r_phiq) {
            return false;
        }
        point.grow(phiq);
        self.n_grown += 1;
        true
    }

    /// Store a freshly integrated sample, splitting the hinted leaf.
    ///
    /// On a full tree the least-recently-used leaf is flagged for eviction,
    /// a cleaning is requested and the sample is refused with
    /// [`IsatError::CapacityExceeded`]; a degenerate gradient refuses the
    /// sample with the tree unchanged.
    pub fn add(
        &mut self,
        phiq: &DVector<f64>,
        r_phiq: &DVector<f64>,
        a: DMatrix<f64>,
        hint: Option<LeafId>,
    ) -> Result<LeafId, IsatError> {
        if self.tree.is_full() {
            self.flag_eviction_candidate();
            self.cleaning_required = true;
            return Err(IsatError::CapacityExceeded {
                max_elements: self.config.max_elements,
            });
        }

        let point = CompositionPoint::new(
            phiq.clone(),
            r_phiq.clone(),
            a,
            self.config.scale_factor.clone(),
            self.config.tolerance,
            self.chemistry.current_time(),
            self.chemistry.reduction(),
        )?;
        let id = self.tree.insert(point, hint);
        if self.config.mru_size > 0 {
            self.mru.touch(id);
        }
        self.n_added += 1;
        tracing::debug!(?id, size = self.tree.size(), "sample added");
        Ok(id)
    }

    /// Flag the least-recently-used unflagged leaf for the next cleaning.
    fn flag_eviction_candidate(&mut self) {
        let mut candidate: Option<(LeafId, f64)> = None;
        let mut x = self.tree.first_leaf();
        while let Some(id) = x {
            let point = self.tree.leaf(id);
            if !point.to_remove() {
                let t = point.last_time_used();
                if candidate.map_or(true, |(_, best)| t < best) {
                    candidate = Some((id, t));
                }
            }
            x = self.tree.tree_successor(id);
        }
        if let Some((id, last_used)) = candidate {
            self.tree.leaf_mut(id).flag_for_removal();
            self.to_remove.push(id);
            tracing::debug!(?id, last_used, "leaf flagged for eviction");
        }
    }

    /// Run the deferred housekeeping: delete flagged leaves, sweep out
    /// expired ones, and rebalance a degenerate or degraded tree.
    ///
    /// The expiry sweep runs at most once per `check_entire_tree_interval`
    /// of simulation time; the windowed retrieve counters reset afterwards.
    /// Returns whether anything structural happened.
    pub fn clean_and_balance(&mut self) -> bool {
        if !self.config.clean {
            return false;
        }
        let now = self.chemistry.current_time();
        let mut changed = false;

        let pending = std::mem::take(&mut self.to_remove);
        for id in pending {
            self.evict(id);
            changed = true;
        }

        if now - self.previous_time >= self.config.check_entire_tree_interval {
            let mut expired = Vec::new();
            let mut x = self.tree.first_leaf();
            while let Some(id) = x {
                let point = self.tree.leaf(id);
                if now - point.time_tag() > self.config.chp_max_life_time
                    || now - point.last_time_used() > self.config.chp_max_use_interval
                {
                    expired.push(id);
                }
                x = self.tree.tree_successor(id);
            }
            for id in expired {
                self.evict(id);
                changed = true;
            }
            self.previous_time = now;
        }

        let size = self.tree.size();
        if size >= 2 {
            let depth_bound = self.config.max_depth_factor * (size as f64).log2();
            if self.tree.depth() as f64 > depth_bound || self.cleaning_required {
                changed |= self.tree.balance();
            }
        }

        self.cleaning_required = false;
        self.tot_retrieve = 0;
        self.n_failed_first = 0;
        self.n_2nd_retrieve = 0;
        self.n_mru_retrieve = 0;
        changed
    }

    fn evict(&mut self, id: LeafId) {
        // weak lists are purged before the tree frees the leaf
        self.mru.forget(id);
        let point = self.tree.delete_leaf(id);
        self.n_evicted += 1;
        tracing::debug!(?id, n_used = point.n_used(), "leaf evicted");
    }

    /// Full query protocol: retrieve, or integrate then grow-or-add.
    ///
    /// Storage refusals (capacity, degenerate gradients) never fail the
    /// query: the freshly integrated mapping is returned regardless.
    pub fn map(&mut self, phiq: &DVector<f64>) -> DVector<f64> {
        match self.retrieve(phiq) {
            Retrieve::Hit(leaf) => self.calc_new_c(leaf, phiq),
            Retrieve::Miss { hint } => {
                let (r_phiq, a) = self.chemistry.integrate(phiq);
                if let Some(h) = hint {
                    if self.grow(h, phiq, &r_phiq) {
                        return r_phiq;
                    }
                }
                if let Err(err) = self.add(phiq, &r_phiq, a, hint) {
                    tracing::debug!(%err, "sample not stored");
                }
                r_phiq
            }
        }
    }

    /// Drop every stored point. Idempotent; the cache returns to the empty
    /// state with its counters intact.
    pub fn clear(&mut self) {
        self.mru.clear();
        self.to_remove.clear();
        self.tree.clear();
    }

    /// Number of stored samples.
    pub fn size(&self) -> usize {
        self.tree.size()
    }

    /// Depth of the backing tree.
    pub fn depth(&self) -> usize {
        self.tree.depth()
    }

    /// Snapshot of the advisory counters.
    pub fn stats(&self) -> CacheStats {
        CacheStats {
            size: self.tree.size(),
            depth: self.tree.depth(),
            tot_retrieve: self.tot_retrieve,
            n_failed_first: self.n_failed_first,
            n_2nd_retrieve: self.n_2nd_retrieve,
            n_mru_retrieve: self.n_mru_retrieve,
            n_grown: self.n_grown,
            n_added: self.n_added,
            n_evicted: self.n_evicted,
        }
    }

    /// A stored point by id; ids come from [`retrieve`](Self::retrieve) and
    /// [`add`](Self::add).
    pub fn point(&self, id: LeafId) -> &CompositionPoint {
        self.tree.leaf(id)
    }

    /// The backing tree, mainly for structural inspection.
    pub fn tree(&self) -> &BspTree {
        &self.tree
    }

    /// The chemistry collaborator.
    pub fn chemistry(&self) -> &C {
        &self.chemistry
    }

    /// Mutable access to the chemistry collaborator.
    pub fn chemistry_mut(&mut self) -> &mut C {
        &mut self.chemistry
    }

    /// The active configuration.
    pub fn config(&self) -> &IsatConfig {
        &self.config
    }
}
