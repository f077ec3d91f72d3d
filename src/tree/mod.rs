//! Binary space-partitioning tree over stored composition points
//!
//! Internal nodes carry separating hyperplanes, leaves carry composition
//! points. The primary search descends by hyperplane sign in O(depth); the
//! secondary search re-explores sibling subtrees around a failed leaf under
//! a fixed visit budget. The tree is repaired on demand by a variance-axis
//! rebuild rather than per-insertion rotations.
//!
//! Shape invariants:
//! - `size == 0` ⇔ no root.
//! - `size == 1` ⇒ the root is a transitional node holding the sole leaf in
//!   its left slot, right slot empty, hyperplane unused.
//! - `size ≥ 2` ⇒ every node has two occupied child slots and every leaf's
//!   back-pointer names the node whose slot holds it.
//!
//! Nodes and leaves live in slab arenas indexed by [`NodeId`] and
//! [`LeafId`]; walks use explicit stacks throughout, so deep degenerate
//! trees cannot overflow the call stack.

mod node;

pub use node::{LeafId, NodeId};

use node::{BspNode, Child};

use std::time::{SystemTime, UNIX_EPOCH};

use nalgebra::DVector;
use rand::rngs::StdRng;
use rand::seq::SliceRandom;
use rand::SeedableRng;

use crate::point::CompositionPoint;
use crate::IsatConfig;

/// Space-partitioning tree and the arenas backing it.
#[derive(Debug)]
pub struct BspTree {
    nodes: Vec<Option<BspNode>>,
    free_nodes: Vec<usize>,
    leaves: Vec<Option<CompositionPoint>>,
    free_leaves: Vec<usize>,
    root: Option<NodeId>,
    size: usize,
    max_elements: usize,
    max_2nd_search: usize,
    min_balance_threshold: usize,
    max_nb_balance_test: usize,
    balance_prop: f64,
}

impl BspTree {
    /// Empty tree taking its capacity and search/balance knobs from the
    /// configuration.
    pub fn new(config: &IsatConfig) -> Self {
        Self {
            nodes: Vec::new(),
            free_nodes: Vec::new(),
            leaves: Vec::new(),
            free_leaves: Vec::new(),
            root: None,
            size: 0,
            max_elements: config.max_elements,
            max_2nd_search: config.max_2nd_search,
            min_balance_threshold: config.min_balance_threshold,
            max_nb_balance_test: config.max_nb_balance_test,
            balance_prop: config.balance_prop,
        }
    }

    /// Number of stored leaves.
    pub fn size(&self) -> usize {
        self.size
    }

    /// True when no leaves are stored.
    pub fn is_empty(&self) -> bool {
        self.size == 0
    }

    /// Has the tree reached its configured capacity?
    pub fn is_full(&self) -> bool {
        self.size >= self.max_elements
    }

    /// Leaf lookup. Panics on a stale id: ids are only valid between the
    /// insertion and deletion of their leaf.
    pub fn leaf(&self, id: LeafId) -> &CompositionPoint {
        match self.leaves[id.0].as_ref() {
            Some(point) => point,
            None => panic!("stale leaf id {id:?}"),
        }
    }

    /// Mutable leaf lookup; same staleness contract as [`leaf`](Self::leaf).
    pub fn leaf_mut(&mut self, id: LeafId) -> &mut CompositionPoint {
        match self.leaves[id.0].as_mut() {
            Some(point) => point,
            None => panic!("stale leaf id {id:?}"),
        }
    }

    fn node(&self, id: NodeId) -> &BspNode {
        match self.nodes[id.0].as_ref() {
            Some(node) => node,
            None => panic!("stale node id {id:?}"),
        }
    }

    fn node_mut(&mut self, id: NodeId) -> &mut BspNode {
        match self.nodes[id.0].as_mut() {
            Some(node) => node,
            None => panic!("stale node id {id:?}"),
        }
    }

    fn node_of(&self, leaf: LeafId) -> NodeId {
        match self.leaf(leaf).node() {
            Some(id) => id,
            None => panic!("leaf {leaf:?} is detached from the tree"),
        }
    }

    fn alloc_leaf(&mut self, point: CompositionPoint) -> LeafId {
        match self.free_leaves.pop() {
            Some(slot) => {
                self.leaves[slot] = Some(point);
                LeafId(slot)
            }
            None => {
                self.leaves.push(Some(point));
                LeafId(self.leaves.len() - 1)
            }
        }
    }

    fn release_leaf(&mut self, id: LeafId) -> CompositionPoint {
        match self.leaves[id.0].take() {
            Some(point) => {
                self.free_leaves.push(id.0);
                point
            }
            None => panic!("stale leaf id {id:?}"),
        }
    }

    fn alloc_node(&mut self, node: BspNode) -> NodeId {
        match self.free_nodes.pop() {
            Some(slot) => {
                self.nodes[slot] = Some(node);
                NodeId(slot)
            }
            None => {
                self.nodes.push(Some(node));
                NodeId(self.nodes.len() - 1)
            }
        }
    }

    fn free_node(&mut self, id: NodeId) {
        if self.nodes[id.0].take().is_none() {
            panic!("stale node id {id:?}");
        }
        self.free_nodes.push(id.0);
    }

    /// Insert a new point, splitting the hinted leaf (or the leaf the
    /// primary descent lands on) with a fresh hyperplane node.
    pub fn insert(&mut self, point: CompositionPoint, hint: Option<LeafId>) -> LeafId {
        if self.size == 0 {
            let node_id = self.alloc_node(BspNode::transitional());
            let mut point = point;
            point.attach(node_id);
            let leaf_id = self.alloc_leaf(point);
            self.node_mut(node_id).left = Child::Leaf(leaf_id);
            self.root = Some(node_id);
            self.size = 1;
            return leaf_id;
        }

        let phi0 = match hint {
            Some(id) => id,
            None => match self.primary_search(point.phi()) {
                Some(id) => id,
                None => unreachable!("non-empty tree always yields a primary leaf"),
            },
        };

        let new_leaf = self.alloc_leaf(point);
        if self.size == 1 {
            // the transitional root is replaced by a real splitting node
            let old_root = match self.root.take() {
                Some(id) => id,
                None => panic!("tree of size 1 without a root"),
            };
            self.free_node(old_root);
            let node = BspNode::split(phi0, new_leaf, self.leaf(phi0), self.leaf(new_leaf), None);
            let node_id = self.alloc_node(node);
            self.leaf_mut(phi0).attach(node_id);
            self.leaf_mut(new_leaf).attach(node_id);
            self.root = Some(node_id);
        } else {
            self.splice(phi0, new_leaf);
        }
        self.size += 1;
        new_leaf
    }

    /// Replace the child slot holding `phi0` with a new node whose children
    /// are `phi0` (left) and `new_leaf` (right).
    fn splice(&mut self, phi0: LeafId, new_leaf: LeafId) {
        let parent = self.node_of(phi0);
        let node = BspNode::split(
            phi0,
            new_leaf,
            self.leaf(phi0),
            self.leaf(new_leaf),
            Some(parent),
        );
        let node_id = self.alloc_node(node);
        let pn = self.node_mut(parent);
        if pn.left == Child::Leaf(phi0) {
            pn.left = Child::Node(node_id);
        } else if pn.right == Child::Leaf(phi0) {
            pn.right = Child::Node(node_id);
        } else {
            panic!("leaf back-pointer does not match any parent slot");
        }
        self.leaf_mut(phi0).attach(node_id);
        self.leaf_mut(new_leaf).attach(node_id);
    }

    /// Hyperplane-guided descent to the closest stored region. O(depth).
    pub fn primary_search(&self, phi: &DVector<f64>) -> Option<LeafId> {
        let root = self.root?;
        if self.size == 1 {
            return match self.node(root).left {
                Child::Leaf(id) => Some(id),
                _ => panic!("transitional root without its leaf"),
            };
        }
        let mut current = root;
        loop {
            let node = self.node(current);
            let side = if node.goes_right(phi) {
                node.right
            } else {
                node.left
            };
            match side {
                Child::Node(next) => current = next,
                Child::Leaf(id) => return Some(id),
                Child::Empty => panic!("empty child slot in a tree of size {}", self.size),
            }
        }
    }

    /// Bounded re-exploration after a failed primary retrieve.
    ///
    /// Walks upward from the failed leaf; at each level the sibling side is
    /// probed: a leaf costs one membership test against the budget, a
    /// subtree is descended near-side-first with the far side kept as a
    /// fallback. Returns the first leaf whose ellipsoid contains the query,
    /// or None once the budget `max_2nd_search` is spent or the root passed.
    pub fn secondary_search(&self, phiq: &DVector<f64>, failed: LeafId) -> Option<LeafId> {
        if self.size <= 1 || self.max_2nd_search == 0 {
            return None;
        }
        let mut visited = 0usize;
        if let Some(hit) = self.probe(phiq, self.sibling_of_leaf(failed), &mut visited) {
            return Some(hit);
        }
        let mut y = self.node_of(failed);
        while let Some(parent) = self.node(y).parent {
            if visited >= self.max_2nd_search {
                break;
            }
            if let Some(hit) = self.probe(phiq, self.sibling_of_node(y), &mut visited) {
                return Some(hit);
            }
            y = parent;
        }
        None
    }

    fn probe(&self, phiq: &DVector<f64>, start: Child, visited: &mut usize) -> Option<LeafId> {
        let mut stack = vec![start];
        while let Some(child) = stack.pop() {
            if *visited >= self.max_2nd_search {
                return None;
            }
            match child {
                Child::Empty => {}
                Child::Leaf(id) => {
                    *visited += 1;
                    if self.leaf(id).in_eoa(phiq) {
                        return Some(id);
                    }
                }
                Child::Node(id) => {
                    let node = self.node(id);
                    if node.goes_right(phiq) {
                        stack.push(node.left);
                        stack.push(node.right);
                    } else {
                        stack.push(node.right);
                        stack.push(node.left);
                    }
                }
            }
        }
        None
    }

    fn sibling_of_leaf(&self, leaf: LeafId) -> Child {
        let z = self.node(self.node_of(leaf));
        if z.left == Child::Leaf(leaf) {
            z.right
        } else {
            z.left
        }
    }

    fn sibling_of_node(&self, id: NodeId) -> Child {
        match self.node(id).parent {
            None => Child::Empty,
            Some(p) => {
                let pn = self.node(p);
                if pn.left == Child::Node(id) {
                    pn.right
                } else {
                    pn.left
                }
            }
        }
    }

    /// Remove a leaf and reshape around it; returns the detached point with
    /// its heavy data cleared.
    ///
    /// The deleted leaf's own node always has the leaf in one slot, so the
    /// sibling slot is either a leaf (promote it into the grandparent) or a
    /// subtree (transplant it); a node with two subtree children can never
    /// be the deletion site.
    pub fn delete_leaf(&mut self, id: LeafId) -> CompositionPoint {
        if self.size == 1 {
            let root = match self.root.take() {
                Some(r) => r,
                None => panic!("tree of size 1 without a root"),
            };
            self.free_node(root);
            self.size = 0;
            let mut point = self.release_leaf(id);
            point.set_free();
            point.clear_data();
            return point;
        }

        let z = self.node_of(id);
        match self.sibling_of_leaf(id) {
            Child::Leaf(sibling) => match self.node(z).parent {
                None => {
                    // the root held the last two leaves; shrink back to the
                    // transitional single-leaf form
                    let fresh = self.alloc_node(BspNode::transitional());
                    self.node_mut(fresh).left = Child::Leaf(sibling);
                    self.leaf_mut(sibling).attach(fresh);
                    self.root = Some(fresh);
                }
                Some(parent) => {
                    let pn = self.node_mut(parent);
                    if pn.left == Child::Node(z) {
                        pn.left = Child::Leaf(sibling);
                    } else {
                        pn.right = Child::Leaf(sibling);
                    }
                    self.leaf_mut(sibling).attach(parent);
                }
            },
            Child::Node(sibling) => self.transplant(z, sibling),
            Child::Empty => panic!("empty sibling slot in a tree of size {}", self.size),
        }
        self.free_node(z);
        self.size -= 1;

        let mut point = self.release_leaf(id);
        point.set_free();
        point.clear_data();
        point
    }

    fn transplant(&mut self, u: NodeId, v: NodeId) {
        let parent = self.node(u).parent;
        match parent {
            None => self.root = Some(v),
            Some(p) => {
                let pn = self.node_mut(p);
                if pn.left == Child::Node(u) {
                    pn.left = Child::Node(v);
                } else {
                    pn.right = Child::Node(v);
                }
            }
        }
        self.node_mut(v).parent = parent;
    }

    /// Tree depth in levels, leaves included. 0 for the empty tree.
    pub fn depth(&self) -> usize {
        let mut max_depth = 0usize;
        let mut stack: Vec<(Child, usize)> = match self.root {
            Some(root) => vec![(Child::Node(root), 0)],
            None => Vec::new(),
        };
        while let Some((child, d)) = stack.pop() {
            match child {
                Child::Empty => {}
                Child::Leaf(_) => max_depth = max_depth.max(d + 1),
                Child::Node(id) => {
                    let node = self.node(id);
                    stack.push((node.left, d + 1));
                    stack.push((node.right, d + 1));
                }
            }
        }
        max_depth
    }

    /// Leftmost leaf of a subtree.
    pub fn tree_min(&self, sub: Option<NodeId>) -> Option<LeafId> {
        let mut current = sub?;
        loop {
            match self.node(current).left {
                Child::Node(next) => current = next,
                Child::Leaf(id) => return Some(id),
                Child::Empty => return None,
            }
        }
    }

    /// Leftmost leaf of the whole tree; entry point for in-order walks.
    pub fn first_leaf(&self) -> Option<LeafId> {
        self.tree_min(self.root)
    }

    /// In-order successor of a leaf, None at the tree maximum.
    pub fn tree_successor(&self, x: LeafId) -> Option<LeafId> {
        if self.size <= 1 {
            return None;
        }
        let z = self.node_of(x);
        let zn = self.node(z);
        if zn.left == Child::Leaf(x) {
            return match zn.right {
                Child::Leaf(s) => Some(s),
                Child::Node(r) => self.tree_min(Some(r)),
                Child::Empty => None,
            };
        }
        // coming from the right: climb until arriving from a left child
        let mut y = z;
        while let Some(p) = self.node(y).parent {
            if self.node(p).left == Child::Node(y) {
                return match self.node(p).right {
                    Child::Leaf(s) => Some(s),
                    Child::Node(r) => self.tree_min(Some(r)),
                    Child::Empty => None,
                };
            }
            y = p;
        }
        None
    }

    /// Variance-axis rebuild.
    ///
    /// Separates composition space with a hyperplane perpendicular to a
    /// high-variance direction, roots the tree at the two extremal leaves
    /// along it, and re-inserts the remaining leaves in random order for an
    /// expected O(log size) depth. Does nothing below the configured size
    /// threshold. Returns whether the tree was reshaped.
    pub fn balance(&mut self) -> bool {
        if self.size <= self.min_balance_threshold || self.size < 2 {
            return false;
        }

        let mut leaves = Vec::with_capacity(self.size);
        let mut x = self.first_leaf();
        while let Some(id) = x {
            leaves.push(id);
            x = self.tree_successor(id);
        }
        debug_assert_eq!(leaves.len(), self.size);

        let n = self.leaf(leaves[0]).phi().len();
        if n < 2 {
            return false;
        }

        let mut mean: DVector<f64> = DVector::zeros(n);
        for &id in &leaves {
            mean += self.leaf(id).phi();
        }
        mean /= self.size as f64;

        let mut variance = vec![0.0f64; n];
        for &id in &leaves {
            let phi = self.leaf(id).phi();
            for k in 0..n {
                let d = phi[k] - mean[k];
                variance[k] += d * d;
            }
        }

        let mut order: Vec<usize> = (0..n).collect();
        order.sort_by(|&i, &j| {
            variance[j]
                .partial_cmp(&variance[i])
                .unwrap_or(std::cmp::Ordering::Equal)
        });

        // try the highest-variance directions until one splits the leaf
        // population acceptably; otherwise keep the least imbalanced
        let size_f = self.size as f64;
        let mut split_dir = None;
        let mut best_balance = size_f;
        let mut nb_left = 0usize;
        let mut nb_tests = 0usize;
        while ((nb_left as f64) < self.balance_prop * size_f
            || (nb_left as f64) > (1.0 - self.balance_prop) * size_f)
            && nb_tests < self.max_nb_balance_test
            && nb_tests < n - 1
        {
            let dir = order[nb_tests];
            nb_tests += 1;
            nb_left = leaves
                .iter()
                .filter(|&&id| self.leaf(id).phi()[dir] < mean[dir])
                .count();
            let imbalance = (nb_left as f64 - size_f * 0.5).abs();
            if imbalance < best_balance {
                best_balance = imbalance;
                split_dir = Some(dir);
            }
        }
        let dir = split_dir.unwrap_or(order[0]);

        let mut min_id = leaves[0];
        let mut max_id = leaves[0];
        let mut min_phi = f64::INFINITY;
        let mut max_phi = f64::NEG_INFINITY;
        for &id in &leaves {
            let p = self.leaf(id).phi()[dir];
            if p < min_phi {
                min_phi = p;
                min_id = id;
            }
            if p > max_phi {
                max_phi = p;
                max_id = id;
            }
        }
        if min_id == max_id {
            // no spread along the chosen direction; keep the current shape
            return false;
        }

        // drop every node, keep every leaf, and re-root at the extremes
        self.nodes.clear();
        self.free_nodes.clear();
        self.root = None;
        let root = BspNode::split(min_id, max_id, self.leaf(min_id), self.leaf(max_id), None);
        let root_id = self.alloc_node(root);
        self.root = Some(root_id);
        self.leaf_mut(min_id).attach(root_id);
        self.leaf_mut(max_id).attach(root_id);

        let mut rest: Vec<LeafId> = leaves
            .iter()
            .copied()
            .filter(|&id| id != min_id && id != max_id)
            .collect();
        let seed = SystemTime::now()
            .duration_since(UNIX_EPOCH)
            .map(|d| d.as_nanos() as u64)
            .unwrap_or(0);
        rest.shuffle(&mut StdRng::seed_from_u64(seed));

        for id in rest {
            let phi0 = match self.primary_search(self.leaf(id).phi()) {
                Some(p) => p,
                None => unreachable!("rebuild root always yields a primary leaf"),
            };
            self.splice(phi0, id);
        }

        tracing::debug!(size = self.size, dir, "tree rebalanced");
        true
    }

    /// Destroy every node and leaf. Idempotent.
    pub fn clear(&mut self) {
        self.nodes.clear();
        self.free_nodes.clear();
        self.leaves.clear();
        self.free_leaves.clear();
        self.root = None;
        self.size = 0;
    }

    /// Structural invariant check; the test-suite oracle.
    pub fn validate(&self) -> Result<(), String> {
        if self.size == 0 {
            return match self.root {
                None => Ok(()),
                Some(_) => Err("empty tree still has a root".to_string()),
            };
        }
        let root = match self.root {
            Some(r) => r,
            None => return Err("non-empty tree without a root".to_string()),
        };
        if self.node(root).parent.is_some() {
            return Err("root has a parent".to_string());
        }

        let mut leaf_count = 0usize;
        let mut stack = vec![root];
        while let Some(id) = stack.pop() {
            let node = self.node(id);
            for (side, child) in [("left", node.left), ("right", node.right)] {
                match child {
                    Child::Empty => {
                        if self.size > 1 {
                            return Err(format!("empty {side} slot in a tree of size {}", self.size));
                        }
                    }
                    Child::Leaf(l) => {
                        leaf_count += 1;
                        if self.leaf(l).node() != Some(id) {
                            return Err(format!("leaf {l:?} back-pointer does not name its node"));
                        }
                        if self.size > 1 {
                            let margin = node.v.dot(self.leaf(l).phi()) - node.a;
                            if side == "left" && margin > 0.0 {
                                return Err(format!("left leaf {l:?} on the right of its hyperplane"));
                            }
                            if side == "right" && margin < 0.0 {
                                return Err(format!("right leaf {l:?} on the left of its hyperplane"));
                            }
                        }
                    }
                    Child::Node(c) => {
                        if self.node(c).parent != Some(id) {
                            return Err(format!("node {c:?} parent link does not name {id:?}"));
                        }
                        stack.push(c);
                    }
                }
            }
        }

        if leaf_count != self.size {
            return Err(format!(
                "{leaf_count} leaves reachable from the root, size says {}",
                self.size
            ));
        }
        let live = self.leaves.iter().filter(|l| l.is_some()).count();
        if live != self.size {
            return Err(format!("{live} live arena slots, size says {}", self.size));
        }
        Ok(())
    }
}
