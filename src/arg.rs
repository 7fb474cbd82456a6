//! Abstract reachability graph.
//!
//! The graph is an arena of nodes addressed by [`ArgNodeId`]. Identities are
//! handed out by the arena in creation order and never reused, so they double
//! as a deterministic ordering of nodes.
//!
//! Ownership follows parent/child links only. The *covered-by* link is a plain
//! back-reference: it is never followed when computing subtrees or liveness.
//!
//! ```text
//!        root
//!       /    \
//!     n1      n2
//!       \    /
//!        n3          (n3 has two parents after a join)
//!         :
//!         n4 ....> n1   (n4 covered by n1)
//! ```
//!
//! All structural operations check their invariants with assertions: an
//! asymmetric parent/child relation is a programming error and aborts.

use std::collections::{BTreeMap, BTreeSet, VecDeque};
use std::fmt::{Debug, Display, Formatter};

use log::debug;

use crate::bitset::BitSet;
use crate::cfa::{CfaNode, EdgeId};
use crate::region::Region;

/// Payload of an ARG node, as computed by an analysis engine.
pub trait AbstractState: Clone + Debug + Send {
    /// Program location of this state.
    fn location(&self) -> CfaNode;

    /// Configurations this state is reachable under, when tracking variability.
    fn presence_condition(&self) -> Option<Region> {
        None
    }

    /// Goals whose observer automaton accepts in this state.
    fn accepted_goals(&self) -> BTreeSet<usize> {
        BTreeSet::new()
    }

    fn is_target(&self) -> bool {
        !self.accepted_goals().is_empty()
    }
}

#[derive(Debug, Copy, Clone, Eq, PartialEq, Ord, PartialOrd, Hash)]
pub struct ArgNodeId(u32);

impl ArgNodeId {
    pub const fn index(self) -> usize {
        self.0 as usize
    }
}

impl Display for ArgNodeId {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        write!(f, "#{}", self.0)
    }
}

#[derive(Debug, Clone)]
struct ArgNode<S> {
    state: S,
    parents: BTreeSet<ArgNodeId>,
    children: BTreeSet<ArgNodeId>,
    covered_by: Option<ArgNodeId>,
    bottom: bool,
}

/// A path through the graph: `edges[i]` leads from `nodes[i]` to `nodes[i + 1]`.
#[derive(Debug, Clone, Default, Eq, PartialEq)]
pub struct ArgPath {
    pub nodes: Vec<ArgNodeId>,
    pub edges: Vec<EdgeId>,
}

/// Result of a garbage sweep.
#[derive(Debug, Clone, Default, Eq, PartialEq)]
pub struct Reclaimed {
    /// Number of nodes deleted from the arena.
    pub removed: usize,
    /// Surviving nodes whose coverer was deleted; they need exploring again.
    pub uncovered: Vec<ArgNodeId>,
}

#[derive(Debug, Clone)]
pub struct Arg<S> {
    nodes: Vec<Option<ArgNode<S>>>,
    root: Option<ArgNodeId>,
    covered: BTreeSet<ArgNodeId>,
    edges: BTreeMap<(ArgNodeId, ArgNodeId), EdgeId>,
    live: usize,
}

impl<S> Default for Arg<S> {
    fn default() -> Self {
        Self {
            nodes: Vec::new(),
            root: None,
            covered: BTreeSet::new(),
            edges: BTreeMap::new(),
            live: 0,
        }
    }
}

impl<S: AbstractState> Arg<S> {
    pub fn new() -> Self {
        Self::default()
    }

    fn node(&self, id: ArgNodeId) -> &ArgNode<S> {
        match self.nodes.get(id.index()) {
            Some(Some(node)) => node,
            _ => panic!("ARG node {} does not exist", id),
        }
    }

    fn node_mut(&mut self, id: ArgNodeId) -> &mut ArgNode<S> {
        match self.nodes.get_mut(id.index()) {
            Some(Some(node)) => node,
            _ => panic!("ARG node {} does not exist", id),
        }
    }

    fn alloc(&mut self, state: S) -> ArgNodeId {
        let id = ArgNodeId(self.nodes.len() as u32);
        self.nodes.push(Some(ArgNode {
            state,
            parents: BTreeSet::new(),
            children: BTreeSet::new(),
            covered_by: None,
            bottom: false,
        }));
        self.live += 1;
        id
    }

    pub fn add_root(&mut self, state: S) -> ArgNodeId {
        assert!(self.root.is_none(), "ARG already has a root");
        let id = self.alloc(state);
        self.root = Some(id);
        id
    }

    /// Create a new node as a child of `parent`, reached via `edge`.
    pub fn add_child(&mut self, parent: ArgNodeId, state: S, edge: Option<EdgeId>) -> ArgNodeId {
        let id = self.alloc(state);
        self.add_parent(id, parent, edge);
        id
    }

    /// Link `child` below `parent`. No-op if they are already linked.
    pub fn add_parent(&mut self, child: ArgNodeId, parent: ArgNodeId, edge: Option<EdgeId>) {
        assert_ne!(child, parent, "ARG node {} cannot be its own parent", child);
        let linked = self.node(child).parents.contains(&parent);
        assert_eq!(
            linked,
            self.node(parent).children.contains(&child),
            "asymmetric link between {} and {}",
            parent,
            child
        );
        if linked {
            return;
        }
        self.node_mut(child).parents.insert(parent);
        self.node_mut(parent).children.insert(child);
        if let Some(edge) = edge {
            self.edges.insert((parent, child), edge);
        }
    }

    pub fn root(&self) -> Option<ArgNodeId> {
        self.root
    }

    pub fn contains(&self, id: ArgNodeId) -> bool {
        matches!(self.nodes.get(id.index()), Some(Some(_)))
    }

    /// Number of nodes in the arena (detached ones included until reclaimed).
    pub fn len(&self) -> usize {
        self.live
    }

    pub fn is_empty(&self) -> bool {
        self.live == 0
    }

    /// Next identity to be handed out.
    pub fn next_id(&self) -> ArgNodeId {
        ArgNodeId(self.nodes.len() as u32)
    }

    /// All nodes, in creation order.
    pub fn ids(&self) -> impl Iterator<Item = ArgNodeId> + '_ {
        self.nodes
            .iter()
            .enumerate()
            .filter(|(_, n)| n.is_some())
            .map(|(i, _)| ArgNodeId(i as u32))
    }

    /// The root, or a node with at least one parent.
    pub fn is_attached(&self, id: ArgNodeId) -> bool {
        self.root == Some(id) || !self.node(id).parents.is_empty()
    }

    pub fn state(&self, id: ArgNodeId) -> &S {
        &self.node(id).state
    }

    pub fn parents(&self, id: ArgNodeId) -> &BTreeSet<ArgNodeId> {
        &self.node(id).parents
    }

    pub fn children(&self, id: ArgNodeId) -> &BTreeSet<ArgNodeId> {
        &self.node(id).children
    }

    /// Lowest-identity parent.
    pub fn first_parent(&self, id: ArgNodeId) -> Option<ArgNodeId> {
        self.node(id).parents.first().copied()
    }

    /// Control-flow edge the `parent -> child` link was created for.
    pub fn edge_label(&self, parent: ArgNodeId, child: ArgNodeId) -> Option<EdgeId> {
        self.edges.get(&(parent, child)).copied()
    }

    pub fn is_bottom(&self, id: ArgNodeId) -> bool {
        self.node(id).bottom
    }

    pub fn set_bottom(&mut self, id: ArgNodeId) {
        self.node_mut(id).bottom = true;
    }

    pub fn covered_by(&self, id: ArgNodeId) -> Option<ArgNodeId> {
        self.node(id).covered_by
    }

    pub fn is_covered(&self, id: ArgNodeId) -> bool {
        self.covered.contains(&id)
    }

    /// Is any node covered at all.
    pub fn has_covered(&self) -> bool {
        !self.covered.is_empty()
    }

    pub fn covered(&self) -> &BTreeSet<ArgNodeId> {
        &self.covered
    }

    pub fn set_covered(&mut self, id: ArgNodeId, by: ArgNodeId) {
        assert_ne!(id, by, "ARG node {} cannot cover itself", id);
        assert!(self.contains(by), "covering node {} does not exist", by);
        self.node_mut(id).covered_by = Some(by);
        self.covered.insert(id);
    }

    pub fn set_uncovered(&mut self, id: ArgNodeId) {
        self.node_mut(id).covered_by = None;
        self.covered.remove(&id);
    }

    /// Nodes reachable from `id` via child links, `id` included.
    pub fn subtree(&self, id: ArgNodeId) -> BTreeSet<ArgNodeId> {
        let mut result = BTreeSet::new();
        let mut queue = VecDeque::from([id]);
        while let Some(n) = queue.pop_front() {
            if result.insert(n) {
                queue.extend(self.node(n).children.iter().copied());
            }
        }
        result
    }

    /// Detach `id` from all its parents and children and clear its covering.
    ///
    /// Descendants are not deleted. Nodes that were covered by `id` are
    /// uncovered and returned, so the caller can put them back on the frontier.
    pub fn remove_from_graph(&mut self, id: ArgNodeId) -> Vec<ArgNodeId> {
        let children = std::mem::take(&mut self.node_mut(id).children);
        for child in children {
            let removed = self.node_mut(child).parents.remove(&id);
            assert!(removed, "asymmetric link: {} not a parent of {}", id, child);
            self.edges.remove(&(id, child));
        }

        let parents = std::mem::take(&mut self.node_mut(id).parents);
        for parent in parents {
            let removed = self.node_mut(parent).children.remove(&id);
            assert!(removed, "asymmetric link: {} not a child of {}", id, parent);
            self.edges.remove(&(parent, id));
        }

        self.set_uncovered(id);

        let released: Vec<ArgNodeId> = self
            .covered
            .iter()
            .copied()
            .filter(|&n| self.node(n).covered_by == Some(id))
            .collect();
        for &n in &released {
            self.set_uncovered(n);
        }

        if self.root == Some(id) {
            self.root = None;
        }
        released
    }

    /// Delete every node not reachable from the root via child links.
    pub fn reclaim_unreachable(&mut self) -> Reclaimed {
        let mut live = BitSet::new(self.nodes.len());
        if let Some(root) = self.root {
            live.extend(self.subtree(root).into_iter().map(|n| n.index()));
        }

        let garbage: Vec<ArgNodeId> = self.ids().filter(|n| !live.contains(n.index())).collect();
        if garbage.is_empty() {
            return Reclaimed::default();
        }

        for &n in &garbage {
            // Survivors may still list a garbage node as parent.
            let children = self.node(n).children.clone();
            for child in children {
                if live.contains(child.index()) {
                    self.node_mut(child).parents.remove(&n);
                }
            }
        }
        for &n in &garbage {
            self.covered.remove(&n);
            self.nodes[n.index()] = None;
        }
        self.live -= garbage.len();
        self.edges
            .retain(|(p, c), _| live.contains(p.index()) && live.contains(c.index()));

        let uncovered: Vec<ArgNodeId> = self
            .covered
            .iter()
            .copied()
            .filter(|&n| self.node(n).covered_by.is_some_and(|by| !live.contains(by.index())))
            .collect();
        for &n in &uncovered {
            self.set_uncovered(n);
        }

        debug!(
            "reclaimed {} ARG nodes, {} left, {} uncovered",
            garbage.len(),
            self.live,
            uncovered.len()
        );
        Reclaimed {
            removed: garbage.len(),
            uncovered,
        }
    }

    /// Walk parent links from `target` back to the root.
    ///
    /// At a join the lowest-identity parent is taken. The result is one path to
    /// `target`, not necessarily the one an analysis had in mind.
    pub fn one_path_to(&self, target: ArgNodeId) -> ArgPath {
        let mut nodes = vec![target];
        let mut edges = Vec::new();
        let mut current = target;
        while let Some(parent) = self.first_parent(current) {
            assert!(
                nodes.len() <= self.live,
                "cycle in ARG parent links while walking back from {}",
                target
            );
            if let Some(edge) = self.edge_label(parent, current) {
                edges.push(edge);
            }
            nodes.push(parent);
            current = parent;
        }
        nodes.reverse();
        edges.reverse();
        ArgPath { nodes, edges }
    }

    /// Check the parent/child symmetry of the whole graph.
    pub fn check_consistency(&self) {
        for id in self.ids() {
            let node = self.node(id);
            for p in &node.parents {
                assert!(self.node(*p).children.contains(&id), "{} lists parent {} asymmetrically", id, p);
            }
            for c in &node.children {
                assert!(self.node(*c).parents.contains(&id), "{} lists child {} asymmetrically", id, c);
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use test_log::test;

    use super::*;
    use crate::cfa::Cfa;

    #[derive(Debug, Clone)]
    struct Loc(CfaNode);

    impl AbstractState for Loc {
        fn location(&self) -> CfaNode {
            self.0
        }
    }

    fn state() -> Loc {
        let mut cfa = Cfa::new();
        Loc(cfa.add_function("main"))
    }

    #[test]
    fn test_add_parent_idempotent() {
        let mut arg = Arg::new();
        let root = arg.add_root(state());
        let a = arg.add_child(root, state(), None);
        let b = arg.add_child(root, state(), None);
        arg.add_parent(b, a, None);
        arg.add_parent(b, a, None);
        assert_eq!(arg.parents(b).len(), 2);
        assert_eq!(arg.children(a).len(), 1);
        assert_eq!(arg.first_parent(b), Some(root));
        arg.check_consistency();
    }

    #[test]
    #[should_panic(expected = "own parent")]
    fn test_self_parent_panics() {
        let mut arg = Arg::new();
        let root = arg.add_root(state());
        arg.add_parent(root, root, None);
    }

    #[test]
    fn test_subtree_follows_children_only() {
        let mut arg = Arg::new();
        let root = arg.add_root(state());
        let a = arg.add_child(root, state(), None);
        let b = arg.add_child(a, state(), None);
        let c = arg.add_child(root, state(), None);
        arg.set_covered(c, a);

        assert_eq!(arg.subtree(a), BTreeSet::from([a, b]));
        assert_eq!(arg.subtree(c), BTreeSet::from([c]));
        assert_eq!(arg.subtree(root).len(), 4);
    }

    #[test]
    fn test_remove_node_with_two_parents_and_three_children() {
        let mut arg = Arg::new();
        let root = arg.add_root(state());
        let p1 = arg.add_child(root, state(), None);
        let p2 = arg.add_child(root, state(), None);
        let n = arg.add_child(p1, state(), None);
        arg.add_parent(n, p2, None);
        let children: Vec<_> = (0..3).map(|_| arg.add_child(n, state(), None)).collect();

        arg.remove_from_graph(n);

        for p in [p1, p2] {
            assert!(!arg.children(p).contains(&n));
        }
        for &c in &children {
            assert!(!arg.parents(c).contains(&n));
        }
        assert!(arg.parents(n).is_empty());
        assert!(arg.children(n).is_empty());
        arg.check_consistency();
    }

    #[test]
    fn test_remove_twice_is_same_as_once() {
        let mut arg = Arg::new();
        let root = arg.add_root(state());
        let a = arg.add_child(root, state(), None);
        let b = arg.add_child(a, state(), None);
        let c = arg.add_child(root, state(), None);
        arg.set_covered(c, b);

        let released = arg.remove_from_graph(b);
        assert_eq!(released, vec![c]);
        let snapshot: Vec<_> = arg.ids().map(|n| (n, arg.parents(n).clone(), arg.children(n).clone())).collect();
        let covered = arg.covered().clone();

        let released = arg.remove_from_graph(b);
        assert!(released.is_empty());
        let again: Vec<_> = arg.ids().map(|n| (n, arg.parents(n).clone(), arg.children(n).clone())).collect();
        assert_eq!(snapshot, again);
        assert_eq!(&covered, arg.covered());
        assert!(!arg.is_covered(b));
        assert!(!arg.is_covered(c));
    }

    #[test]
    fn test_covering_is_tracked_outside_nodes() {
        let mut arg = Arg::new();
        let root = arg.add_root(state());
        let a = arg.add_child(root, state(), None);
        assert!(!arg.has_covered());
        arg.set_covered(a, root);
        assert!(arg.has_covered());
        assert_eq!(arg.covered_by(a), Some(root));
        arg.set_uncovered(a);
        assert!(!arg.has_covered());
        assert_eq!(arg.covered_by(a), None);
    }

    #[test]
    fn test_reclaim_unreachable() {
        let mut arg = Arg::new();
        let root = arg.add_root(state());
        let a = arg.add_child(root, state(), None);
        let b = arg.add_child(a, state(), None);
        let c = arg.add_child(root, state(), None);
        let d = arg.add_child(b, state(), None);
        arg.add_parent(d, c, None);
        let e = arg.add_child(root, state(), None);
        arg.set_covered(e, b);

        arg.remove_from_graph(a);
        // `a` is detached; `b` is only owned by `a`; `d` survives through `c`.
        let reclaimed = arg.reclaim_unreachable();
        assert_eq!(reclaimed.removed, 2);
        assert!(!arg.contains(a));
        assert!(!arg.contains(b));
        assert!(arg.contains(d));
        assert_eq!(arg.parents(d), &BTreeSet::from([c]));
        assert_eq!(reclaimed.uncovered, vec![e]);
        assert_eq!(arg.len(), 4);
        arg.check_consistency();

        // Identities are not reused.
        let f = arg.add_child(root, state(), None);
        assert!(f > e);
    }

    #[test]
    fn test_one_path_to() {
        let mut cfa = Cfa::new();
        let n0 = cfa.add_function("main");
        let n1 = cfa.add_node("main");
        let n2 = cfa.add_node("main");
        let e0 = cfa.add_edge(n0, n1, "a");
        let e1 = cfa.add_edge(n1, n2, "b");

        let mut arg = Arg::new();
        let root = arg.add_root(Loc(n0));
        let a = arg.add_child(root, Loc(n1), Some(e0));
        let b = arg.add_child(a, Loc(n2), Some(e1));

        let path = arg.one_path_to(b);
        assert_eq!(path.nodes, vec![root, a, b]);
        assert_eq!(path.edges, vec![e0, e1]);
        assert_eq!(arg.state(b).location(), n2);
    }
}
