//! Goal automata.
//!
//! A coverage goal is described by a nondeterministic finite automaton that
//! reads control-flow edges. Its transitions carry [`GuardedLabel`]s: a set of
//! edges plus optional side *guards* (presence conditions, or assumptions only
//! an analysis can discharge).
//!
//! Final states have an implicit self-loop: once a final state is reached, the
//! trace is accepted no matter how it continues.
//!
//! Deciding acceptance of a concrete edge trace is three-valued
//! ([`ThreeValued`]), because a purely syntactic check cannot evaluate guards.
//! Guarded transitions are never taken by [`Automaton::accepts`]; if one was
//! seen and no final state was reached, the answer is `Unknown`, never
//! `Reject`.
//!
//! Observers composed into an analysis come in three flavours ([`Observer`]):
//! a plain automaton (nondeterminism explored by branching), a powerset
//! automaton (nondeterminism folded into state sets), and the reduced cross
//! product of several goal automata.

use std::collections::{BTreeMap, BTreeSet, VecDeque};
use std::fmt::{Display, Formatter};

use log::debug;

use crate::cfa::EdgeId;
use crate::error::{Error, Result};
use crate::region::Region;

pub type StateId = usize;

/// Outcome of matching an automaton against a trace.
#[derive(Debug, Copy, Clone, Eq, PartialEq, Hash)]
pub enum ThreeValued {
    Accept,
    Reject,
    Unknown,
}

/// The set of control-flow edges a transition matches.
#[derive(Debug, Clone, Eq, PartialEq, Ord, PartialOrd, Hash)]
pub enum EdgeSet {
    Any,
    Only(BTreeSet<EdgeId>),
    Except(BTreeSet<EdgeId>),
}

impl EdgeSet {
    pub fn single(edge: EdgeId) -> Self {
        EdgeSet::Only([edge].into_iter().collect())
    }

    pub fn contains(&self, edge: EdgeId) -> bool {
        match self {
            EdgeSet::Any => true,
            EdgeSet::Only(edges) => edges.contains(&edge),
            EdgeSet::Except(edges) => !edges.contains(&edge),
        }
    }

    pub fn is_empty(&self) -> bool {
        matches!(self, EdgeSet::Only(edges) if edges.is_empty())
    }

    pub fn intersect(&self, other: &EdgeSet) -> EdgeSet {
        match (self, other) {
            (EdgeSet::Any, x) | (x, EdgeSet::Any) => x.clone(),
            (EdgeSet::Only(a), EdgeSet::Only(b)) => EdgeSet::Only(a.intersection(b).copied().collect()),
            (EdgeSet::Only(a), EdgeSet::Except(b)) | (EdgeSet::Except(b), EdgeSet::Only(a)) => {
                EdgeSet::Only(a.difference(b).copied().collect())
            }
            (EdgeSet::Except(a), EdgeSet::Except(b)) => EdgeSet::Except(a.union(b).copied().collect()),
        }
    }
}

impl Display for EdgeSet {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        let join = |edges: &BTreeSet<EdgeId>| edges.iter().map(|e| e.to_string()).collect::<Vec<_>>().join(",");
        match self {
            EdgeSet::Any => write!(f, "Σ"),
            EdgeSet::Only(edges) => write!(f, "{{{}}}", join(edges)),
            EdgeSet::Except(edges) => write!(f, "Σ\\{{{}}}", join(edges)),
        }
    }
}

/// A side condition on a transition that cannot be decided by looking at the edge alone.
#[derive(Debug, Clone, Eq, PartialEq, Ord, PartialOrd, Hash)]
pub enum Guard {
    /// The transition is only possible in these product configurations.
    Presence(Region),
    /// An assumption over program variables, evaluated by the analysis.
    Predicate(String),
}

impl Display for Guard {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        match self {
            Guard::Presence(r) => write!(f, "pc {}", r),
            Guard::Predicate(p) => write!(f, "{}", p),
        }
    }
}

#[derive(Debug, Clone, Eq, PartialEq, Ord, PartialOrd, Hash)]
pub struct GuardedLabel {
    pub edges: EdgeSet,
    pub guards: Vec<Guard>,
}

impl GuardedLabel {
    pub fn any() -> Self {
        Self {
            edges: EdgeSet::Any,
            guards: Vec::new(),
        }
    }

    pub fn edge(edge: EdgeId) -> Self {
        Self {
            edges: EdgeSet::single(edge),
            guards: Vec::new(),
        }
    }

    pub fn except(edges: impl IntoIterator<Item = EdgeId>) -> Self {
        Self {
            edges: EdgeSet::Except(edges.into_iter().collect()),
            guards: Vec::new(),
        }
    }

    pub fn with_guard(mut self, guard: Guard) -> Self {
        self.guards.push(guard);
        self
    }

    pub fn has_guards(&self) -> bool {
        !self.guards.is_empty()
    }

    pub fn contains(&self, edge: EdgeId) -> bool {
        self.edges.contains(edge)
    }

    /// Label matching exactly what both labels match; `None` if nothing.
    pub fn intersect(&self, other: &GuardedLabel) -> Option<GuardedLabel> {
        let edges = self.edges.intersect(&other.edges);
        if edges.is_empty() {
            return None;
        }
        let mut guards = self.guards.clone();
        for g in &other.guards {
            if !guards.contains(g) {
                guards.push(g.clone());
            }
        }
        Some(GuardedLabel { edges, guards })
    }
}

impl Display for GuardedLabel {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.edges)?;
        if self.has_guards() {
            let guards = self.guards.iter().map(|g| g.to_string()).collect::<Vec<_>>();
            write!(f, " [{}]", guards.join(", "))?;
        }
        Ok(())
    }
}

#[derive(Debug, Clone, Eq, PartialEq)]
pub struct Transition {
    pub source: StateId,
    pub target: StateId,
    pub label: GuardedLabel,
}

/// Nondeterministic finite automaton over control-flow edges.
#[derive(Debug, Clone)]
pub struct Automaton {
    name: String,
    num_states: usize,
    initial: StateId,
    finals: BTreeSet<StateId>,
    transitions: Vec<Transition>,
}

impl Automaton {
    /// Create an automaton with a single (initial, non-final) state.
    pub fn new(name: &str) -> Self {
        Self {
            name: name.to_string(),
            num_states: 1,
            initial: 0,
            finals: BTreeSet::new(),
            transitions: Vec::new(),
        }
    }

    /// The canonical goal automaton for reaching one edge:
    ///
    /// ```text
    /// q0 --Σ--> q0
    /// q0 --{edge}--> q1 (final)
    /// ```
    pub fn reaching(name: &str, edge: EdgeId) -> Self {
        let mut a = Self::new(name);
        let q0 = a.initial();
        let q1 = a.add_state();
        a.add_final(q1);
        a.add_transition(q0, q0, GuardedLabel::any());
        a.add_transition(q0, q1, GuardedLabel::edge(edge));
        a
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn add_state(&mut self) -> StateId {
        self.num_states += 1;
        self.num_states - 1
    }

    pub fn num_states(&self) -> usize {
        self.num_states
    }

    pub fn states(&self) -> impl Iterator<Item = StateId> {
        0..self.num_states
    }

    pub fn initial(&self) -> StateId {
        self.initial
    }

    pub fn set_initial(&mut self, state: StateId) {
        assert!(state < self.num_states, "Unknown state {}", state);
        self.initial = state;
    }

    pub fn add_final(&mut self, state: StateId) {
        assert!(state < self.num_states, "Unknown state {}", state);
        self.finals.insert(state);
    }

    pub fn finals(&self) -> &BTreeSet<StateId> {
        &self.finals
    }

    pub fn is_final(&self, state: StateId) -> bool {
        self.finals.contains(&state)
    }

    pub fn add_transition(&mut self, source: StateId, target: StateId, label: GuardedLabel) {
        assert!(source < self.num_states, "Unknown state {}", source);
        assert!(target < self.num_states, "Unknown state {}", target);
        self.transitions.push(Transition { source, target, label });
    }

    pub fn transitions(&self) -> &[Transition] {
        &self.transitions
    }

    pub fn outgoing(&self, state: StateId) -> impl Iterator<Item = &Transition> {
        self.transitions.iter().filter(move |t| t.source == state)
    }

    pub fn has_guards(&self) -> bool {
        self.transitions.iter().any(|t| t.label.has_guards())
    }

    /// Decide whether the edge trace drives the automaton into a final state.
    ///
    /// Guarded transitions are not followed; seeing one turns a would-be
    /// `Reject` into `Unknown`.
    pub fn accepts(&self, trace: &[EdgeId]) -> ThreeValued {
        let mut current: BTreeSet<StateId> = BTreeSet::new();
        let mut next: BTreeSet<StateId> = BTreeSet::new();
        current.insert(self.initial);

        let mut has_predicates = false;

        for &edge in trace {
            for &state in &current {
                // Implicit self-loop on final states
                if self.is_final(state) {
                    return ThreeValued::Accept;
                }
                for t in self.outgoing(state) {
                    if t.label.has_guards() {
                        has_predicates = true;
                    } else if t.label.contains(edge) {
                        next.insert(t.target);
                    }
                }
            }
            current.clear();
            std::mem::swap(&mut current, &mut next);
        }

        if current.iter().any(|&s| self.is_final(s)) {
            return ThreeValued::Accept;
        }

        if has_predicates {
            ThreeValued::Unknown
        } else {
            ThreeValued::Reject
        }
    }

    fn reachable_from_initial(&self) -> BTreeSet<StateId> {
        let mut seen = BTreeSet::new();
        let mut queue = VecDeque::from([self.initial]);
        while let Some(s) = queue.pop_front() {
            if seen.insert(s) {
                queue.extend(self.outgoing(s).map(|t| t.target));
            }
        }
        seen
    }

    fn coreachable_to(&self, targets: &BTreeSet<StateId>) -> BTreeSet<StateId> {
        let mut seen = BTreeSet::new();
        let mut queue: VecDeque<StateId> = targets.iter().copied().collect();
        while let Some(s) = queue.pop_front() {
            if seen.insert(s) {
                queue.extend(self.transitions.iter().filter(|t| t.target == s).map(|t| t.source));
            }
        }
        seen
    }

    /// No final state can be reached from the initial state.
    pub fn is_degenerated(&self) -> bool {
        self.reachable_from_initial().is_disjoint(&self.finals)
    }

    /// Remove useless states and duplicate transitions.
    ///
    /// Returns the reduced automaton and the renaming of the surviving states.
    /// The initial state always survives.
    pub fn optimize(&self) -> (Automaton, BTreeMap<StateId, StateId>) {
        let reachable = self.reachable_from_initial();
        let useful = self.coreachable_to(&self.finals);

        let mut rename = BTreeMap::new();
        rename.insert(self.initial, 0);
        for s in self.states() {
            if s != self.initial && reachable.contains(&s) && useful.contains(&s) {
                let next = rename.len();
                rename.insert(s, next);
            }
        }

        let mut result = Automaton::new(&self.name);
        for _ in 1..rename.len() {
            result.add_state();
        }
        for (&old, &new) in &rename {
            if self.is_final(old) {
                result.add_final(new);
            }
        }
        for t in &self.transitions {
            if let (Some(&source), Some(&target)) = (rename.get(&t.source), rename.get(&t.target)) {
                let transition = Transition {
                    source,
                    target,
                    label: t.label.clone(),
                };
                if !result.transitions.contains(&transition) {
                    result.transitions.push(transition);
                }
            }
        }

        debug!(
            "optimize({}): {} -> {} states, {} -> {} transitions",
            self.name,
            self.num_states,
            result.num_states,
            self.transitions.len(),
            result.transitions.len()
        );
        (result, rename)
    }
}

/// Reduced cross product of several goal automata.
///
/// Each product state remembers which goals (component automata) are in a
/// final state there.
#[derive(Debug, Clone)]
pub struct ProductAutomaton {
    automaton: Automaton,
    accepting: Vec<BTreeSet<usize>>,
    goals: Vec<usize>,
}

impl ProductAutomaton {
    /// Build the product of `(goal, automaton)` components.
    ///
    /// Only states reachable from the initial tuple are built, and states from
    /// which no goal can be accepted anymore are dropped.
    pub fn of(name: &str, components: &[(usize, &Automaton)]) -> Result<Self> {
        if components.is_empty() {
            return Err(Error::InvalidAutomaton(format!("product '{}' has no components", name)));
        }

        let goals: Vec<usize> = components.iter().map(|&(g, _)| g).collect();
        let initial: Vec<StateId> = components.iter().map(|(_, a)| a.initial()).collect();

        let mut automaton = Automaton::new(name);
        let mut index: BTreeMap<Vec<StateId>, StateId> = BTreeMap::new();
        let mut tuples: Vec<Vec<StateId>> = vec![initial.clone()];
        index.insert(initial.clone(), 0);

        let mut queue = VecDeque::from([initial]);
        while let Some(tuple) = queue.pop_front() {
            let source = index[&tuple];

            // Moves of each component; final states loop on everything.
            let moves: Vec<Vec<(GuardedLabel, StateId)>> = components
                .iter()
                .zip(&tuple)
                .map(|((_, a), &s)| {
                    if a.is_final(s) {
                        vec![(GuardedLabel::any(), s)]
                    } else {
                        a.outgoing(s).map(|t| (t.label.clone(), t.target)).collect()
                    }
                })
                .collect();

            let mut partial: Vec<(GuardedLabel, Vec<StateId>)> = vec![(GuardedLabel::any(), Vec::new())];
            for component_moves in &moves {
                let mut extended = Vec::new();
                for (label, targets) in &partial {
                    for (move_label, target) in component_moves {
                        if let Some(label) = label.intersect(move_label) {
                            let mut targets = targets.clone();
                            targets.push(*target);
                            extended.push((label, targets));
                        }
                    }
                }
                partial = extended;
            }

            for (label, target_tuple) in partial {
                let target = match index.get(&target_tuple) {
                    Some(&t) => t,
                    None => {
                        let t = automaton.add_state();
                        index.insert(target_tuple.clone(), t);
                        tuples.push(target_tuple.clone());
                        queue.push_back(target_tuple);
                        t
                    }
                };
                automaton.add_transition(source, target, label);
            }
        }

        let accepting: Vec<BTreeSet<usize>> = tuples
            .iter()
            .map(|tuple| {
                components
                    .iter()
                    .zip(tuple)
                    .filter(|((_, a), &s)| a.is_final(s))
                    .map(|(&(g, _), _)| g)
                    .collect()
            })
            .collect();
        for (state, goals) in accepting.iter().enumerate() {
            if !goals.is_empty() {
                automaton.add_final(state);
            }
        }

        let (reduced, rename) = automaton.optimize();
        let mut reduced_accepting = vec![BTreeSet::new(); reduced.num_states()];
        for (old, new) in rename {
            reduced_accepting[new] = accepting[old].clone();
        }

        Ok(Self {
            automaton: reduced,
            accepting: reduced_accepting,
            goals,
        })
    }

    pub fn automaton(&self) -> &Automaton {
        &self.automaton
    }

    pub fn goals(&self) -> &[usize] {
        &self.goals
    }

    /// Goals whose component automaton is final in this product state.
    pub fn accepting(&self, state: StateId) -> &BTreeSet<usize> {
        &self.accepting[state]
    }
}

/// An automaton composed into an analysis to observe goal progress.
#[derive(Debug, Clone)]
pub enum Observer {
    /// Nondeterminism is explored by branching into separate abstract states.
    Plain { goal: usize, automaton: Automaton },
    /// Nondeterminism is folded into sets of automaton states.
    Powerset { goal: usize, automaton: Automaton },
    /// One observer for a whole batch of goals.
    Product { product: ProductAutomaton, powerset: bool },
}

impl Observer {
    pub fn automaton(&self) -> &Automaton {
        match self {
            Observer::Plain { automaton, .. } | Observer::Powerset { automaton, .. } => automaton,
            Observer::Product { product, .. } => product.automaton(),
        }
    }

    pub fn is_powerset(&self) -> bool {
        match self {
            Observer::Plain { .. } => false,
            Observer::Powerset { .. } => true,
            Observer::Product { powerset, .. } => *powerset,
        }
    }

    pub fn goals(&self) -> Vec<usize> {
        match self {
            Observer::Plain { goal, .. } | Observer::Powerset { goal, .. } => vec![*goal],
            Observer::Product { product, .. } => product.goals().to_vec(),
        }
    }

    /// Goals accepted in the given automaton state.
    pub fn accepted_goals(&self, state: StateId) -> BTreeSet<usize> {
        match self {
            Observer::Plain { goal, automaton } | Observer::Powerset { goal, automaton } => {
                if automaton.is_final(state) {
                    [*goal].into_iter().collect()
                } else {
                    BTreeSet::new()
                }
            }
            Observer::Product { product, .. } => product.accepting(state).clone(),
        }
    }

    /// Successor automaton states on a control-flow edge, with the guards to discharge.
    ///
    /// Final states keep themselves. A product state keeps itself once every
    /// component goal is accepted.
    pub fn successors(&self, state: StateId, edge: EdgeId) -> Vec<(StateId, Vec<Guard>)> {
        let automaton = self.automaton();
        let done = match self {
            Observer::Product { product, .. } => product.accepting(state).len() == product.goals().len(),
            _ => automaton.is_final(state),
        };
        if done {
            return vec![(state, Vec::new())];
        }
        automaton
            .outgoing(state)
            .filter(|t| t.label.contains(edge))
            .map(|t| (t.target, t.label.guards.clone()))
            .collect()
    }
}

#[cfg(test)]
mod tests {
    use test_log::test;

    use super::*;
    use crate::cfa::Cfa;

    fn edges(n: usize) -> Vec<EdgeId> {
        let mut cfa = Cfa::new();
        let mut prev = cfa.add_function("main");
        let mut result = Vec::new();
        for i in 0..n {
            let next = cfa.add_node("main");
            result.push(cfa.add_edge(prev, next, &format!("s{}", i)));
            prev = next;
        }
        result
    }

    #[test]
    fn test_accepts_exact_match() {
        let e = edges(2);
        let mut a = Automaton::new("A");
        let q1 = a.add_state();
        a.add_final(q1);
        a.add_transition(a.initial(), q1, GuardedLabel::edge(e[0]));

        assert_eq!(a.accepts(&[e[0]]), ThreeValued::Accept);
        assert_eq!(a.accepts(&[e[1]]), ThreeValued::Reject);
        assert_eq!(a.accepts(&[]), ThreeValued::Reject);
    }

    #[test]
    fn test_accepts_guarded_is_unknown() {
        let e = edges(2);
        let mut a = Automaton::new("A");
        let q1 = a.add_state();
        a.add_final(q1);
        let label = GuardedLabel::edge(e[0]).with_guard(Guard::Predicate("x > 0".to_string()));
        a.add_transition(a.initial(), q1, label);

        assert_eq!(a.accepts(&[e[0]]), ThreeValued::Unknown);
        assert_eq!(a.accepts(&[e[1]]), ThreeValued::Unknown);
        // No edge consumed, so the guard is never seen:
        assert_eq!(a.accepts(&[]), ThreeValued::Reject);
    }

    #[test]
    fn test_accepts_implicit_self_loop() {
        let e = edges(3);
        let a = Automaton::reaching("G", e[0]);
        assert_eq!(a.accepts(&[e[0], e[1], e[2]]), ThreeValued::Accept);
        assert_eq!(a.accepts(&[e[1], e[0], e[2]]), ThreeValued::Accept);
        assert_eq!(a.accepts(&[e[1], e[2]]), ThreeValued::Reject);
    }

    #[test]
    fn test_accepts_never_unknown_without_guards() {
        let e = edges(3);
        let a = Automaton::reaching("G", e[1]);
        assert!(!a.has_guards());
        let traces: Vec<Vec<EdgeId>> = vec![
            vec![],
            vec![e[0]],
            vec![e[1]],
            vec![e[0], e[2]],
            vec![e[2], e[1], e[0]],
        ];
        for trace in traces {
            let expected = if trace.contains(&e[1]) {
                ThreeValued::Accept
            } else {
                ThreeValued::Reject
            };
            assert_eq!(a.accepts(&trace), expected, "trace {:?}", trace);
        }
    }

    #[test]
    fn test_edge_set_intersection() {
        let e = edges(3);
        let only: EdgeSet = EdgeSet::Only([e[0], e[1]].into_iter().collect());
        let except: EdgeSet = EdgeSet::Except([e[1]].into_iter().collect());

        assert_eq!(EdgeSet::Any.intersect(&only), only);
        assert_eq!(only.intersect(&except), EdgeSet::single(e[0]));
        assert_eq!(
            except.intersect(&EdgeSet::Except([e[2]].into_iter().collect())),
            EdgeSet::Except([e[1], e[2]].into_iter().collect())
        );
        assert!(EdgeSet::single(e[0]).intersect(&EdgeSet::single(e[1])).is_empty());
    }

    #[test]
    fn test_optimize_removes_useless_states() {
        let e = edges(2);
        let mut a = Automaton::reaching("G", e[0]);
        let dead = a.add_state();
        let unreachable = a.add_state();
        a.add_transition(a.initial(), dead, GuardedLabel::edge(e[1]));
        a.add_transition(unreachable, 1, GuardedLabel::any());
        a.add_transition(0, 0, GuardedLabel::any());

        let (opt, rename) = a.optimize();
        assert_eq!(opt.num_states(), 2);
        assert_eq!(opt.transitions().len(), 2);
        assert!(!rename.contains_key(&dead));
        assert!(!rename.contains_key(&unreachable));
        assert_eq!(opt.accepts(&[e[0]]), ThreeValued::Accept);
    }

    #[test]
    fn test_degenerated() {
        let e = edges(1);
        let mut a = Automaton::new("D");
        let q1 = a.add_state();
        a.add_final(q1);
        assert!(a.is_degenerated());
        a.add_transition(a.initial(), q1, GuardedLabel::edge(e[0]));
        assert!(!a.is_degenerated());
    }

    #[test]
    fn test_product_tracks_each_goal() {
        let e = edges(3);
        let a = Automaton::reaching("G1", e[0]);
        let b = Automaton::reaching("G2", e[2]);
        let product = ProductAutomaton::of("P", &[(1, &a), (2, &b)]).unwrap();
        let observer = Observer::Product {
            product,
            powerset: true,
        };
        assert_eq!(observer.goals(), vec![1, 2]);

        let mut states: BTreeSet<StateId> = [observer.automaton().initial()].into_iter().collect();
        let mut accepted = BTreeSet::new();
        for &edge in &[e[0], e[1], e[2]] {
            states = states
                .iter()
                .flat_map(|&s| observer.successors(s, edge))
                .map(|(t, _)| t)
                .collect();
            for &s in &states {
                accepted.extend(observer.accepted_goals(s));
            }
        }
        assert_eq!(accepted, BTreeSet::from([1, 2]));
    }

    #[test]
    fn test_product_requires_components() {
        assert!(ProductAutomaton::of("P", &[]).is_err());
    }
}
