//! Reached set: the ARG together with its exploration frontier.
//!
//! The reached set is what the driver hands to an analysis engine run after
//! run. Besides the graph it remembers the waitlist, the last state that was
//! added, the goals whose observers are disabled for the remaining frontier,
//! and the feature constraint restricting the frontier in variability mode.

use std::collections::{BTreeSet, VecDeque};

use log::debug;

use crate::arg::{AbstractState, Arg, ArgNodeId};
use crate::cfa::EdgeId;
use crate::region::Region;

#[derive(Debug, Clone)]
pub struct ReachedSet<S> {
    arg: Arg<S>,
    waitlist: VecDeque<ArgNodeId>,
    last: Option<ArgNodeId>,
    disabled_goals: BTreeSet<usize>,
    constraint: Option<Region>,
}

impl<S: AbstractState> ReachedSet<S> {
    /// Start a fresh exploration from `initial`.
    pub fn new(initial: S) -> Self {
        let mut arg = Arg::new();
        let root = arg.add_root(initial);
        Self {
            arg,
            waitlist: VecDeque::from([root]),
            last: Some(root),
            disabled_goals: BTreeSet::new(),
            constraint: None,
        }
    }

    pub fn arg(&self) -> &Arg<S> {
        &self.arg
    }

    pub fn arg_mut(&mut self) -> &mut Arg<S> {
        &mut self.arg
    }

    pub fn root(&self) -> Option<ArgNodeId> {
        self.arg.root()
    }

    pub fn len(&self) -> usize {
        self.arg.len()
    }

    pub fn is_empty(&self) -> bool {
        self.arg.is_empty()
    }

    pub fn last(&self) -> Option<ArgNodeId> {
        self.last
    }

    /// Add a new node below `parent` and put it on the frontier.
    pub fn add(&mut self, parent: ArgNodeId, state: S, edge: Option<EdgeId>) -> ArgNodeId {
        let id = self.arg.add_child(parent, state, edge);
        self.last = Some(id);
        self.waitlist.push_back(id);
        id
    }

    pub fn has_waiting_state(&self) -> bool {
        !self.waitlist.is_empty()
    }

    pub fn num_waiting(&self) -> usize {
        self.waitlist.len()
    }

    pub fn waitlist(&self) -> impl Iterator<Item = ArgNodeId> + '_ {
        self.waitlist.iter().copied()
    }

    pub fn pop_waiting(&mut self) -> Option<ArgNodeId> {
        self.waitlist.pop_front()
    }

    pub fn push_waiting(&mut self, id: ArgNodeId) {
        if !self.waitlist.contains(&id) {
            self.waitlist.push_back(id);
        }
    }

    /// Put `id` back at the front, so it is expanded next.
    pub fn push_waiting_front(&mut self, id: ArgNodeId) {
        if !self.waitlist.contains(&id) {
            self.waitlist.push_front(id);
        }
    }

    pub fn remove_waiting(&mut self, id: ArgNodeId) {
        self.waitlist.retain(|&n| n != id);
    }

    /// Keep only frontier nodes satisfying the predicate.
    pub fn retain_waiting(&mut self, mut keep: impl FnMut(&S) -> bool) {
        let arg = &self.arg;
        self.waitlist.retain(|&n| keep(arg.state(n)));
    }

    fn is_live_target(&self, n: ArgNodeId) -> bool {
        self.arg.is_attached(n) && self.arg.state(n).is_target()
    }

    /// Attached nodes whose state accepts some goal, in creation order.
    pub fn targets(&self) -> Vec<ArgNodeId> {
        self.arg.ids().filter(|&n| self.is_live_target(n)).collect()
    }

    pub fn contains_target(&self) -> bool {
        self.arg.ids().any(|n| self.is_live_target(n))
    }

    pub fn disabled_goals(&self) -> &BTreeSet<usize> {
        &self.disabled_goals
    }

    pub fn is_goal_disabled(&self, goal: usize) -> bool {
        self.disabled_goals.contains(&goal)
    }

    /// Stop observing these goals on the remaining frontier.
    pub fn disable_goals(&mut self, goals: impl IntoIterator<Item = usize>) {
        self.disabled_goals.extend(goals);
    }

    pub fn constraint(&self) -> Option<Region> {
        self.constraint
    }

    pub fn set_constraint(&mut self, constraint: Region) {
        self.constraint = Some(constraint);
    }

    /// Remove `node` and everything below it from the graph and the frontier.
    ///
    /// Nodes that were covered by a removed node become uncovered and go back
    /// on the frontier. The former parents of `node` are put at the front of the
    /// frontier, so their other continuations get explored again.
    pub fn remove_subtree(&mut self, node: ArgNodeId) {
        let subtree = self.arg.subtree(node);
        debug!("removing subtree of {} ({} nodes)", node, subtree.len());
        let parents: Vec<ArgNodeId> = self.arg.parents(node).iter().copied().collect();
        let mut released = Vec::new();
        for &n in &subtree {
            released.extend(self.arg.remove_from_graph(n));
        }
        self.waitlist.retain(|n| !subtree.contains(n));
        if self.last.is_some_and(|n| subtree.contains(&n)) {
            self.last = None;
        }
        for n in released {
            if !subtree.contains(&n) {
                self.push_waiting(n);
            }
        }
        for p in parents.into_iter().rev() {
            if !subtree.contains(&p) && self.arg.is_attached(p) && !self.arg.is_covered(p) {
                self.push_waiting_front(p);
            }
        }
    }

    /// Delete detached garbage from the graph.
    pub fn reclaim(&mut self) -> usize {
        let reclaimed = self.arg.reclaim_unreachable();
        let arg = &self.arg;
        self.waitlist.retain(|&n| arg.contains(n));
        if self.last.is_some_and(|n| !self.arg.contains(n)) {
            self.last = None;
        }
        for n in reclaimed.uncovered {
            self.push_waiting(n);
        }
        reclaimed.removed
    }
}

#[cfg(test)]
mod tests {
    use test_log::test;

    use super::*;
    use crate::cfa::{Cfa, CfaNode};

    #[derive(Debug, Clone)]
    struct State {
        location: CfaNode,
        target: bool,
    }

    impl AbstractState for State {
        fn location(&self) -> CfaNode {
            self.location
        }

        fn accepted_goals(&self) -> BTreeSet<usize> {
            if self.target {
                BTreeSet::from([1])
            } else {
                BTreeSet::new()
            }
        }
    }

    fn state(target: bool) -> State {
        let mut cfa = Cfa::new();
        State {
            location: cfa.add_function("main"),
            target,
        }
    }

    #[test]
    fn test_frontier() {
        let mut reached = ReachedSet::new(state(false));
        let root = reached.pop_waiting().unwrap();
        assert!(!reached.has_waiting_state());

        let a = reached.add(root, state(false), None);
        let b = reached.add(root, state(true), None);
        assert_eq!(reached.waitlist().collect::<Vec<_>>(), vec![a, b]);
        assert_eq!(reached.last(), Some(b));
        assert!(reached.contains_target());
        assert_eq!(reached.targets(), vec![b]);
    }

    #[test]
    fn test_remove_subtree_releases_covered() {
        let mut reached = ReachedSet::new(state(false));
        let root = reached.pop_waiting().unwrap();
        let t = reached.add(root, state(true), None);
        let below = reached.add(t, state(false), None);
        let other = reached.add(root, state(false), None);
        reached.pop_waiting();
        reached.pop_waiting();
        reached.pop_waiting();
        reached.arg_mut().set_covered(other, below);

        reached.remove_subtree(t);
        assert!(!reached.contains_target());
        assert!(!reached.arg().is_covered(other));
        assert_eq!(reached.waitlist().collect::<Vec<_>>(), vec![root, other]);

        assert_eq!(reached.reclaim(), 2);
        assert_eq!(reached.len(), 2);
        assert_eq!(reached.last(), Some(other));
    }

    #[test]
    fn test_disable_goals() {
        let mut reached = ReachedSet::new(state(false));
        reached.disable_goals([2, 3]);
        assert!(reached.is_goal_disabled(2));
        assert!(!reached.is_goal_disabled(1));
    }
}
