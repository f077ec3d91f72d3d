//! Randomized structural properties of the tree and the ellipsoid algebra

use isat_cache::{BspTree, CompositionPoint, LeafId};
use nalgebra::{DMatrix, DVector};
use proptest::prelude::*;

mod common;
use common::{config2, point_at, v2};

/// Distinct grid compositions: collisions would mean re-adding a point the
/// cache protocol would have retrieved instead.
fn distinct_points(raw: Vec<(i32, i32)>) -> Vec<(f64, f64)> {
    let mut seen = std::collections::HashSet::new();
    raw.into_iter()
        .filter(|p| seen.insert(*p))
        .map(|(x, y)| (x as f64 * 0.5, y as f64 * 0.5))
        .collect()
}

/// ⌈log₂(size + 1)⌉: no binary tree over `size` leaves is shallower.
fn depth_lower_bound(size: usize) -> usize {
    (size as f64 + 1.0).log2().ceil() as usize
}

proptest! {
    /// Inserts followed by arbitrary deletions keep every structural
    /// invariant: leaf count, back-pointers, hyperplane sidedness, and the
    /// depth lower bound. Deleting next to subtree siblings exercises every
    /// reshape the tree knows.
    #[test]
    fn invariants_survive_insert_delete_sequences(
        raw in prop::collection::vec((-40i32..40, -40i32..40), 1..40),
        picks in prop::collection::vec(any::<usize>(), 0..30),
    ) {
        let points = distinct_points(raw);
        prop_assume!(!points.is_empty());

        let mut tree = BspTree::new(&config2(1.0e-4, 1024));
        let mut live: Vec<LeafId> = Vec::new();
        for &(x, y) in &points {
            live.push(tree.insert(point_at(x, y, 1.0e-4), None));
            let check = tree.validate();
            prop_assert!(check.is_ok(), "{check:?}");
            prop_assert!(tree.depth() >= depth_lower_bound(tree.size()));
        }
        prop_assert_eq!(tree.size(), points.len());

        for pick in picks {
            if live.is_empty() {
                break;
            }
            let id = live.swap_remove(pick % live.len());
            tree.delete_leaf(id);
            let check = tree.validate();
            prop_assert!(check.is_ok(), "{check:?}");
            prop_assert_eq!(tree.size(), live.len());
            if tree.size() > 0 {
                prop_assert!(tree.depth() >= depth_lower_bound(tree.size()));
            }
        }
    }

    /// A rebuild never loses a leaf: afterwards every stored composition
    /// descends to its own leaf and tests inside its ellipsoid.
    #[test]
    fn balance_preserves_exact_membership(
        raw in prop::collection::vec((-40i32..40, -40i32..40), 8..64),
    ) {
        let points = distinct_points(raw);
        prop_assume!(points.len() >= 4);

        let mut config = config2(1.0e-4, 1024);
        config.min_balance_threshold = 0;
        config.max_nb_balance_test = 2;
        let mut tree = BspTree::new(&config);
        for &(x, y) in &points {
            tree.insert(point_at(x, y, 1.0e-4), None);
        }

        tree.balance();
        let check = tree.validate();
        prop_assert!(check.is_ok(), "{check:?}");
        prop_assert_eq!(tree.size(), points.len());
        for &(x, y) in &points {
            let q = v2(x, y);
            let hit = tree.primary_search(&q);
            prop_assert!(hit.is_some());
            let leaf = tree.leaf(hit.unwrap());
            prop_assert_eq!(leaf.phi(), &q);
            prop_assert!(leaf.in_eoa(&q));
        }
    }

    /// However a sequence of grows lands, each grown-to point must test
    /// inside afterwards, and the factor must stay finite, including
    /// targets barely outside the current ellipsoid.
    #[test]
    fn grow_always_covers_its_target(
        targets in prop::collection::vec((-1.0f64..1.0, -1.0f64..1.0), 1..20),
    ) {
        let mut point = point_at(0.0, 0.0, 1.0e-4);
        for (x, y) in targets {
            let q = v2(x, y);
            point.grow(&q);
            prop_assert!(point.in_eoa(&q), "grown-to point {q:?} tests outside");
        }
    }

    /// Near-singular gradients still construct (the singular-value clamp
    /// bounds the semi-axes) and membership stays decidable.
    #[test]
    fn near_singular_gradients_are_clamped(tiny in 1.0e-14f64..1.0e-6) {
        let a = DMatrix::from_row_slice(2, 2, &[1.0, 0.0, 0.0, tiny]);
        let point = CompositionPoint::new(
            DVector::zeros(2),
            DVector::zeros(2),
            a,
            DVector::from_element(2, 1.0),
            1.0e-4,
            0.0,
            None,
        );
        prop_assert!(point.is_ok());
        let point = point.unwrap();
        // the weak direction is capped at semi-axis 2
        prop_assert!(point.in_eoa(&v2(0.0, 1.9)));
        prop_assert!(!point.in_eoa(&v2(0.0, 2.1)));
    }
}
