//! # In-Situ Adaptive Tabulation
//!
//! Caches an expensive pointwise nonlinear mapping R(φ), typically the
//! integration of a chemistry ODE over a sub-step, and answers queries by
//! linear interpolation from stored samples whenever that is accurate to a
//! tolerance ε.
//!
//! ## Core Algorithm
//!
//! 1. **Ellipsoids of accuracy**: each stored sample (φ, R(φ), A) carries
//!    E = {x : ‖Lᵀ(x − φ)‖ ≤ 1}, the region where R̂ = R(φ) + A·(x − φ)
//!    is trusted; Lᵀ is the QR factor of B·A/ε with semi-axes clamped by
//!    an SVD pass
//! 2. **Space partitioning**: samples live in a binary tree whose internal
//!    nodes store separating hyperplanes; a query descends in O(depth)
//! 3. **Three outcomes per query**: retrieve (interpolate from a covering
//!    ellipsoid), grow (rank-one widen an ellipsoid the true mapping
//!    validated), or add (store a new sample by splitting a leaf)
//! 4. **Deferred repair**: eviction, expiry and a variance-axis rebuild of
//!    the tree run on demand, never per query
//!
//! ## Usage Example
//!
//! ```ignore
//! use isat_cache::{Chemistry, IsatCache, IsatConfig, Retrieve};
//!
//! let config = IsatConfig::new(1.0e-4, scale_factor, 10_000);
//! let mut cache = IsatCache::new(config, chemistry);
//! match cache.retrieve(&phi) {
//!     Retrieve::Hit(leaf) => cache.calc_new_c(leaf, &phi),
//!     Retrieve::Miss { hint } => {
//!         let (r, a) = integrate(&phi);
//!         if !hint.is_some_and(|h| cache.grow(h, &phi, &r)) {
//!             let _ = cache.add(&phi, &r, a, hint);
//!         }
//!         r
//!     }
//! }
//! ```
//!
//! The cache is single-threaded by design; parallel solvers run one cache
//! per worker.

#![warn(missing_docs, missing_debug_implementations)]

// Core modules - each implements a layer of the tabulation
pub mod cache; // retrieve/grow/add orchestration
pub mod chemistry; // collaborator interface to the integrator
pub mod config; // tuning knobs and their defaults
pub mod linalg; // ellipsoid factor kernels
pub mod point; // stored samples and their ellipsoids
pub mod tree; // space-partitioning tree

// Re-exports for convenience
pub use cache::{CacheStats, IsatCache, Retrieve};
pub use chemistry::Chemistry;
pub use config::IsatConfig;
pub use point::{CompositionPoint, ReductionContext};
pub use tree::{BspTree, LeafId, NodeId};

use thiserror::Error;

/// Errors surfaced by the cache
///
/// Both variants are recoverable refusals to store a sample; structural
/// invariant violations are implementation bugs and panic instead.
#[derive(Error, Debug)]
pub enum IsatError {
    /// The tree is at capacity; the sample was not stored. The cache has
    /// flagged an eviction candidate; run
    /// [`clean_and_balance`](IsatCache::clean_and_balance) to make room.
    #[error("tabulation full: {max_elements} stored points")]
    CapacityExceeded {
        /// Configured capacity of the tree.
        max_elements: usize,
    },

    /// The sample's ellipsoid of accuracy could not be built; the sample
    /// was discarded and the tree is unchanged.
    #[error("degenerate ellipsoid of accuracy: {reason}")]
    DegenerateEoa {
        /// What broke: a zero column norm, non-finite entries, or a
        /// non-converging SVD.
        reason: String,
    },
}
