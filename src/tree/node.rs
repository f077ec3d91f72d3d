//! Internal nodes of the space-partitioning tree
//!
//! A node separates two regions of composition space with the hyperplane
//! H = {φ : v·φ = a}. Each of its two child slots holds either a leaf or a
//! subtree. Nodes and leaves live in arenas owned by the tree and refer to
//! each other by index, so there are no ownership cycles to break.

use nalgebra::DVector;

use crate::point::CompositionPoint;

/// Index of a leaf in the tree's leaf arena.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct LeafId(pub(crate) usize);

/// Index of a node in the tree's node arena.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct NodeId(pub(crate) usize);

/// One child slot of a node.
///
/// Empty only in the transitional single-leaf tree, where the root holds
/// its sole leaf on the left and nothing on the right.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Child {
    /// The slot holds a stored composition point.
    Leaf(LeafId),
    /// The slot holds a subtree.
    Node(NodeId),
    /// Unoccupied slot.
    Empty,
}

/// Internal node: hyperplane plus two child slots.
#[derive(Debug, Clone)]
pub struct BspNode {
    pub(crate) left: Child,
    pub(crate) right: Child,
    pub(crate) parent: Option<NodeId>,
    /// Hyperplane normal; not normalised, only the sign of v·φ − a matters.
    pub(crate) v: DVector<f64>,
    pub(crate) a: f64,
}

impl BspNode {
    /// Transitional node with no hyperplane (single-leaf tree, or a slot
    /// about to be wired by the caller).
    pub(crate) fn transitional() -> Self {
        Self {
            left: Child::Empty,
            right: Child::Empty,
            parent: None,
            v: DVector::zeros(0),
            a: 0.0,
        }
    }

    /// Node splitting `left` (the pre-existing point) from `right` (the
    /// newly inserted one). The hyperplane puts φ(left) strictly on the
    /// `< a` side and φ(right) strictly on the `> a` side.
    pub(crate) fn split(
        left_id: LeafId,
        right_id: LeafId,
        left: &CompositionPoint,
        right: &CompositionPoint,
        parent: Option<NodeId>,
    ) -> Self {
        let (v, a) = hyperplane(left, right);
        Self {
            left: Child::Leaf(left_id),
            right: Child::Leaf(right_id),
            parent,
            v,
            a,
        }
    }

    /// Which side of the hyperplane is the query on?
    pub(crate) fn goes_right(&self, phi: &DVector<f64>) -> bool {
        self.v.dot(phi) > self.a
    }
}

/// Perpendicular bisector of the segment φ0–φq in the metric of the left
/// leaf's ellipsoid: v = L·Lᵀ·(φq − φ0), a = v·(φ0 + φq)/2.
///
/// With a reduced gradient the product runs in the active subspace and
/// inactive components of v fall back to the plain difference φq − φ0,
/// which keeps v·(φq − φ0) positive.
fn hyperplane(left: &CompositionPoint, right: &CompositionPoint) -> (DVector<f64>, f64) {
    let phi0 = left.phi();
    let phiq = right.phi();
    let dphi = phiq - phi0;
    let n = dphi.len();

    let v = match left.reduction() {
        None => left.lt().transpose() * (left.lt() * &dphi),
        Some(ctx) => {
            let d_red = ctx.gather(&dphi);
            let v_red = left.lt().transpose() * (left.lt() * &d_red);
            let mut v = dphi.clone();
            for r in 0..v_red.len() {
                v[ctx.full_of(r, n)] = v_red[r];
            }
            v
        }
    };
    let a = v.dot(&((phi0 + phiq) * 0.5));
    (v, a)
}

#[cfg(test)]
mod tests {
    use super::*;
    use nalgebra::DMatrix;

    fn leaf_at(x: f64, y: f64) -> CompositionPoint {
        CompositionPoint::new(
            DVector::from_vec(vec![x, y]),
            DVector::from_vec(vec![x, y]),
            DMatrix::identity(2, 2),
            DVector::from_element(2, 1.0),
            1.0e-4,
            0.0,
            None,
        )
        .expect("identity gradient is regular")
    }

    #[test]
    fn hyperplane_separates_the_populating_pair() {
        let l = leaf_at(0.0, 0.0);
        let r = leaf_at(1.0, 0.0);
        let (v, a) = hyperplane(&l, &r);
        assert!(v.dot(l.phi()) < a, "old point on the < a side");
        assert!(v.dot(r.phi()) > a, "new point on the > a side");
        // bisector crosses the segment midpoint: a/v_x = 0.5
        assert!((a / v[0] - 0.5).abs() < 1e-12);
        assert!(v[1].abs() < 1e-6 * v[0].abs(), "normal stays along the segment");
    }

    #[test]
    fn split_node_routes_queries() {
        let l = leaf_at(0.0, 0.0);
        let r = leaf_at(1.0, 0.0);
        let node = BspNode::split(LeafId(0), LeafId(1), &l, &r, None);
        assert!(!node.goes_right(&DVector::from_vec(vec![0.1, 0.0])));
        assert!(node.goes_right(&DVector::from_vec(vec![0.9, 0.0])));
    }
}
