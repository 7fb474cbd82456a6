//! Reference analysis engine.
//!
//! [`Explorer`] explores the product of a [`Cfa`] with the goal observers,
//! breadth-first. An abstract state is a program location, a set of automaton
//! states per observer and, in variability mode, the presence condition under
//! which the state is reachable.
//!
//! - A `Plain` observer branches into one successor per automaton successor;
//!   a `Powerset` observer keeps the whole successor set in one state.
//! - Edges whose feature guard contradicts the presence condition are not
//!   taken.
//! - At locations allowed by the precision (by default, control-flow join
//!   points) a new state is covered by an existing one with the same location
//!   and observer states whose presence condition subsumes it.
//! - A run stops after expanding the node that produced the first target
//!   states; targets are not expanded. For each target a counterexample is
//!   recorded, whose model names the `k`-th input read on the path
//!   `__VERIFIER_nondet::__retval__@k`.

use std::collections::{BTreeMap, BTreeSet};
use std::sync::Arc;

use log::{debug, info, warn};

use crate::arg::{AbstractState, ArgNodeId};
use crate::automaton::{EdgeSet, Guard, Observer, StateId};
use crate::bdd::FeatureBdd;
use crate::cfa::{Cfa, CfaNode, EdgeId, EdgeKind};
use crate::engine::{AnalysisEngine, CancelToken, CounterexampleInfo, EngineFactory, Model, Soundness, INPUT_PREFIX};
use crate::error::{Error, Result};
use crate::reached::ReachedSet;
use crate::region::Region;

#[derive(Debug, Clone, Eq, PartialEq)]
pub struct ExplorerState {
    location: CfaNode,
    observers: Vec<BTreeSet<StateId>>,
    presence: Option<Region>,
    accepted: BTreeSet<usize>,
}

impl ExplorerState {
    /// Automaton states of each observer.
    pub fn observer_states(&self) -> &[BTreeSet<StateId>] {
        &self.observers
    }

    fn same_position(&self, other: &ExplorerState) -> bool {
        self.location == other.location && self.observers == other.observers && self.accepted == other.accepted
    }
}

impl AbstractState for ExplorerState {
    fn location(&self) -> CfaNode {
        self.location
    }

    fn presence_condition(&self) -> Option<Region> {
        self.presence
    }

    fn accepted_goals(&self) -> BTreeSet<usize> {
        self.accepted.clone()
    }

    fn is_target(&self) -> bool {
        !self.accepted.is_empty()
    }
}

/// Locations where covering is allowed.
#[derive(Debug, Clone, Default, Eq, PartialEq)]
pub struct ExplorerPrecision {
    covering: BTreeSet<CfaNode>,
}

impl ExplorerPrecision {
    pub fn join_points(cfa: &Cfa) -> Self {
        Self {
            covering: cfa.nodes().filter(|&n| cfa.is_join(n)).collect(),
        }
    }

    pub fn allows_covering(&self, location: CfaNode) -> bool {
        self.covering.contains(&location)
    }

    pub fn len(&self) -> usize {
        self.covering.len()
    }

    pub fn is_empty(&self) -> bool {
        self.covering.is_empty()
    }
}

pub struct Explorer {
    cfa: Arc<Cfa>,
    bdd: Option<Arc<FeatureBdd>>,
    observers: Vec<Observer>,
    precision: ExplorerPrecision,
    constraint: Option<Region>,
    open: BTreeMap<usize, Region>,
    max_nodes: Option<usize>,
    produce_counterexamples: bool,
    counterexamples: BTreeMap<ArgNodeId, CounterexampleInfo>,
}

impl Explorer {
    pub fn observers(&self) -> &[Observer] {
        &self.observers
    }

    fn conjoin(&self, pc: Option<Region>, region: Region) -> Option<Region> {
        match (&self.bdd, pc) {
            (Some(bdd), Some(pc)) => Some(bdd.and(pc, region)),
            _ => pc,
        }
    }

    /// Presence condition after discharging `guards`, `None` if they cannot hold.
    ///
    /// Predicates over program variables are assumed to hold.
    fn apply_guards(&self, pc: Option<Region>, guards: &[Guard]) -> Option<Option<Region>> {
        let mut pc = pc;
        for guard in guards {
            match guard {
                Guard::Presence(r) => {
                    pc = self.conjoin(pc, *r);
                    if pc.is_some_and(|r| r.is_false()) {
                        return None;
                    }
                }
                Guard::Predicate(p) => debug!("Assuming guard '{}'", p),
            }
        }
        Some(pc)
    }

    fn accepted(&self, observers: &[BTreeSet<StateId>], pc: Option<Region>, disabled: &BTreeSet<usize>) -> BTreeSet<usize> {
        let mut accepted = BTreeSet::new();
        for (observer, states) in self.observers.iter().zip(observers) {
            for &s in states {
                accepted.extend(observer.accepted_goals(s));
            }
        }
        accepted.retain(|g| !disabled.contains(g));
        if let (Some(bdd), Some(pc)) = (&self.bdd, pc) {
            accepted.retain(|g| self.open.get(g).map_or(true, |&open| !bdd.and(pc, open).is_false()));
        }
        accepted
    }

    fn successors(&self, state: &ExplorerState, edge: EdgeId, disabled: &BTreeSet<usize>) -> Vec<ExplorerState> {
        let cfa_edge = self.cfa.edge(edge);

        let mut pc = state.presence;
        if let Some(r) = cfa_edge.presence {
            pc = self.conjoin(pc, r);
        }
        if let Some(c) = self.constraint {
            pc = self.conjoin(pc, c);
        }
        if pc.is_some_and(|r| r.is_false()) {
            return Vec::new();
        }

        let mut partial: Vec<(Vec<BTreeSet<StateId>>, Option<Region>)> = vec![(Vec::new(), pc)];
        for (observer, states) in self.observers.iter().zip(&state.observers) {
            let moves: Vec<(StateId, Vec<Guard>)> = states.iter().flat_map(|&s| observer.successors(s, edge)).collect();
            let mut extended = Vec::new();
            for (sets, pc) in partial {
                if observer.is_powerset() {
                    let targets: BTreeSet<StateId> = moves
                        .iter()
                        .filter(|(_, guards)| self.apply_guards(pc, guards).is_some())
                        .map(|&(t, _)| t)
                        .collect();
                    if !targets.is_empty() {
                        let mut sets = sets.clone();
                        sets.push(targets);
                        extended.push((sets, pc));
                    }
                } else {
                    for (t, guards) in &moves {
                        if let Some(pc) = self.apply_guards(pc, guards) {
                            let mut sets = sets.clone();
                            sets.push(BTreeSet::from([*t]));
                            extended.push((sets, pc));
                        }
                    }
                }
            }
            partial = extended;
        }

        let mut result: Vec<ExplorerState> = Vec::new();
        for (observers, presence) in partial {
            let accepted = self.accepted(&observers, presence, disabled);
            let succ = ExplorerState {
                location: cfa_edge.successor,
                observers,
                presence,
                accepted,
            };
            if !result.contains(&succ) {
                result.push(succ);
            }
        }
        result
    }

    /// `a` contains every configuration of `b`.
    fn subsumes(&self, a: Option<Region>, b: Option<Region>) -> bool {
        match (&self.bdd, a, b) {
            (Some(bdd), Some(a), Some(b)) => bdd.implies(b, a),
            _ => a == b,
        }
    }

    fn is_duplicate_child(
        &self,
        reached: &ReachedSet<ExplorerState>,
        node: ArgNodeId,
        edge: EdgeId,
        succ: &ExplorerState,
    ) -> bool {
        let arg = reached.arg();
        arg.children(node).iter().any(|&c| {
            let existing = arg.state(c);
            arg.edge_label(node, c) == Some(edge)
                && existing.same_position(succ)
                && self.subsumes(existing.presence, succ.presence)
        })
    }

    fn find_coverer(&self, reached: &ReachedSet<ExplorerState>, succ: &ExplorerState) -> Option<ArgNodeId> {
        let arg = reached.arg();
        arg.ids().find(|&m| {
            let existing = arg.state(m);
            arg.is_attached(m)
                && !arg.is_covered(m)
                && existing.same_position(succ)
                && self.subsumes(existing.presence, succ.presence)
        })
    }

    fn counterexample(&self, reached: &ReachedSet<ExplorerState>, target: ArgNodeId) -> CounterexampleInfo {
        let path = reached.arg().one_path_to(target);
        let mut model = Model::new();
        let mut seq = 0;
        for &edge in &path.edges {
            let cfa_edge = self.cfa.edge(edge);
            if let EdgeKind::Input { value } = &cfa_edge.kind {
                model.insert(format!("{}@{}", INPUT_PREFIX, seq), value.clone());
                if let Some((variable, _)) = cfa_edge.label.split_once(" = ") {
                    model.insert(format!("{}@{}", variable, seq), value.clone());
                }
                seq += 1;
            }
        }
        CounterexampleInfo {
            target,
            path,
            model,
            spurious: false,
        }
    }
}

impl AnalysisEngine for Explorer {
    type State = ExplorerState;
    type Precision = ExplorerPrecision;

    fn initial_state(&self) -> ExplorerState {
        let observers: Vec<BTreeSet<StateId>> = self
            .observers
            .iter()
            .map(|o| BTreeSet::from([o.automaton().initial()]))
            .collect();
        let presence = self.bdd.as_ref().map(|_| self.constraint.unwrap_or(Region::TRUE));
        let accepted = self.accepted(&observers, presence, &BTreeSet::new());
        ExplorerState {
            location: self.cfa.entry(),
            observers,
            presence,
            accepted,
        }
    }

    fn precision(&self) -> ExplorerPrecision {
        self.precision.clone()
    }

    fn run(&mut self, reached: &mut ReachedSet<ExplorerState>, cancel: &CancelToken) -> Result<Soundness> {
        self.counterexamples.clear();
        let disabled = reached.disabled_goals().clone();

        while let Some(node) = reached.pop_waiting() {
            if cancel.is_cancelled() {
                debug!("Exploration cancelled with {} nodes", reached.len());
                reached.push_waiting_front(node);
                return Ok(Soundness::Sound);
            }
            if self.max_nodes.is_some_and(|max| reached.len() >= max) {
                warn!("Exploration bound of {} nodes reached", reached.len());
                reached.push_waiting_front(node);
                return Ok(Soundness::Unsound);
            }

            let arg = reached.arg();
            if !arg.contains(node) || !arg.is_attached(node) || arg.is_covered(node) {
                continue;
            }
            let state = arg.state(node).clone();
            if state.is_target() {
                continue;
            }
            if let (Some(bdd), Some(pc), Some(c)) = (&self.bdd, state.presence, self.constraint) {
                if bdd.and(pc, c).is_false() {
                    continue;
                }
            }

            let leaving = self.cfa.leaving(state.location).to_vec();
            let mut targets = Vec::new();
            let mut expanded = false;
            for edge in leaving {
                for succ in self.successors(&state, edge, &disabled) {
                    expanded = true;
                    if self.is_duplicate_child(reached, node, edge, &succ) {
                        continue;
                    }
                    let is_target = succ.is_target();
                    let coverer = if !is_target && self.precision.allows_covering(succ.location) {
                        self.find_coverer(reached, &succ)
                    } else {
                        None
                    };
                    let child = reached.add(node, succ, Some(edge));
                    if let Some(by) = coverer {
                        reached.remove_waiting(child);
                        reached.arg_mut().set_covered(child, by);
                    } else if is_target {
                        reached.remove_waiting(child);
                        targets.push(child);
                    }
                }
            }
            if !expanded && !self.cfa.leaving(state.location).is_empty() {
                reached.arg_mut().set_bottom(node);
            }

            if !targets.is_empty() {
                info!("Found {} target state(s) after {} nodes", targets.len(), reached.len());
                if self.produce_counterexamples {
                    for t in targets {
                        let cex = self.counterexample(reached, t);
                        self.counterexamples.insert(t, cex);
                    }
                }
                return Ok(Soundness::Sound);
            }
        }

        debug!("Exploration finished with {} nodes", reached.len());
        Ok(Soundness::Sound)
    }

    fn counterexamples(&self) -> &BTreeMap<ArgNodeId, CounterexampleInfo> {
        &self.counterexamples
    }

    fn restrict_presence_condition(
        &mut self,
        reached: &mut ReachedSet<ExplorerState>,
        constraint: Region,
        open: &BTreeMap<usize, Region>,
    ) {
        self.constraint = Some(constraint);
        self.open = open.clone();
        reached.set_constraint(constraint);
        if let Some(bdd) = &self.bdd {
            debug!("Restricting exploration to {}", bdd.dump(constraint));
            reached.retain_waiting(|s| s.presence.map_or(true, |pc| !bdd.and(pc, constraint).is_false()));
        }
    }
}

/// Builds [`Explorer`]s over one program.
#[derive(Debug, Clone)]
pub struct ExplorerFactory {
    cfa: Arc<Cfa>,
    bdd: Option<Arc<FeatureBdd>>,
    max_nodes: Option<usize>,
    produce_counterexamples: bool,
}

impl ExplorerFactory {
    pub fn new(cfa: Arc<Cfa>, bdd: Option<Arc<FeatureBdd>>) -> Self {
        Self {
            cfa,
            bdd,
            max_nodes: None,
            produce_counterexamples: true,
        }
    }

    /// Give up (unsoundly) once the ARG has this many nodes.
    pub fn with_max_nodes(mut self, max_nodes: usize) -> Self {
        self.max_nodes = Some(max_nodes);
        self
    }

    /// Report targets without counterexamples.
    pub fn without_counterexamples(mut self) -> Self {
        self.produce_counterexamples = false;
        self
    }
}

impl EngineFactory for ExplorerFactory {
    type Engine = Explorer;

    fn compose(
        &mut self,
        observers: Vec<Observer>,
        constraint: Option<Region>,
        precision: Option<ExplorerPrecision>,
    ) -> Result<Explorer> {
        if observers.is_empty() {
            return Err(Error::Composition("no observer automata".to_string()));
        }
        if constraint.is_some() && self.bdd.is_none() {
            return Err(Error::Composition(
                "presence condition constraint without a feature manager".to_string(),
            ));
        }
        for observer in &observers {
            let automaton = observer.automaton();
            for t in automaton.transitions() {
                if let EdgeSet::Only(edges) | EdgeSet::Except(edges) = &t.label.edges {
                    if let Some(e) = edges.iter().find(|e| e.index() >= self.cfa.num_edges()) {
                        return Err(Error::Composition(format!(
                            "automaton '{}' refers to unknown edge {}",
                            automaton.name(),
                            e
                        )));
                    }
                }
            }
        }

        let precision = precision.unwrap_or_else(|| ExplorerPrecision::join_points(&self.cfa));
        debug!(
            "Composed {} observer(s) with {} covering location(s)",
            observers.len(),
            precision.len()
        );
        Ok(Explorer {
            cfa: self.cfa.clone(),
            bdd: self.bdd.clone(),
            observers,
            precision,
            constraint,
            open: BTreeMap::new(),
            max_nodes: self.max_nodes,
            produce_counterexamples: self.produce_counterexamples,
            counterexamples: BTreeMap::new(),
        })
    }
}

#[cfg(test)]
mod tests {
    use num_bigint::BigInt;
    use test_log::test;

    use super::*;
    use crate::automaton::Automaton;

    /// ```text
    /// N0 -x=in-> N1 -[x>0]-> N2 -> N4 -> N5
    ///              \-[!x>0]-> N3 -/
    /// ```
    fn program() -> (Arc<Cfa>, Vec<EdgeId>) {
        let mut cfa = Cfa::new();
        let n: Vec<CfaNode> = std::iter::once(cfa.add_function("main"))
            .chain((1..6).map(|_| cfa.add_node("main")))
            .collect();
        let e = vec![
            cfa.add_input(n[0], n[1], "x", 5),
            cfa.add_assume(n[1], n[2], "x > 0", true),
            cfa.add_assume(n[1], n[3], "x > 0", false),
            cfa.add_edge(n[2], n[4], "y = 1;"),
            cfa.add_edge(n[3], n[4], "y = 2;"),
            cfa.add_edge(n[4], n[5], "return y;"),
        ];
        (Arc::new(cfa), e)
    }

    fn observer(goal: usize, edge: EdgeId) -> Observer {
        Observer::Powerset {
            goal,
            automaton: Automaton::reaching(&format!("G{}", goal), edge),
        }
    }

    #[test]
    fn test_finds_target_with_model() {
        let (cfa, e) = program();
        let mut factory = ExplorerFactory::new(cfa, None);
        let mut engine = factory.compose(vec![observer(1, e[3])], None, None).unwrap();
        let mut reached = ReachedSet::new(engine.initial_state());

        let verdict = engine.run(&mut reached, &CancelToken::new()).unwrap();
        assert_eq!(verdict, Soundness::Sound);
        assert!(reached.contains_target());

        let cexs = engine.counterexamples();
        assert_eq!(cexs.len(), 1);
        let cex = cexs.values().next().unwrap();
        assert_eq!(cex.path.edges, vec![e[0], e[1], e[3]]);
        assert_eq!(cex.model[&format!("{}@0", INPUT_PREFIX)], BigInt::from(5));
        assert_eq!(cex.model["x@0"], BigInt::from(5));
    }

    #[test]
    fn test_unreachable_goal_exhausts_frontier() {
        let (cfa, _) = program();
        let mut cfa = (*cfa).clone();
        let orphan = cfa.add_node("main");
        let dead = cfa.add_node("main");
        let unreachable = cfa.add_edge(orphan, dead, "dead();");
        let mut factory = ExplorerFactory::new(Arc::new(cfa), None);
        let mut engine = factory.compose(vec![observer(1, unreachable)], None, None).unwrap();
        let mut reached = ReachedSet::new(engine.initial_state());

        assert_eq!(engine.run(&mut reached, &CancelToken::new()).unwrap(), Soundness::Sound);
        assert!(!reached.contains_target());
        assert!(!reached.has_waiting_state());
        assert!(engine.counterexamples().is_empty());
        // The join at N4 is covered once.
        assert_eq!(reached.arg().covered().len(), 1);
    }

    #[test]
    fn test_resumes_after_disabling_goal() {
        let (cfa, e) = program();
        let mut factory = ExplorerFactory::new(cfa, None);
        let mut engine = factory
            .compose(vec![observer(1, e[0]), observer(2, e[5])], None, None)
            .unwrap();
        let mut reached = ReachedSet::new(engine.initial_state());
        let cancel = CancelToken::new();

        engine.run(&mut reached, &cancel).unwrap();
        let first = reached.targets();
        assert_eq!(first.len(), 1);
        assert_eq!(reached.arg().state(first[0]).accepted_goals(), BTreeSet::from([1]));

        engine.disable_goals(&mut reached, &BTreeSet::from([1]));
        reached.remove_subtree(first[0]);
        reached.reclaim();

        engine.run(&mut reached, &cancel).unwrap();
        let second = reached.targets();
        assert_eq!(second.len(), 1);
        assert_eq!(reached.arg().state(second[0]).accepted_goals(), BTreeSet::from([2]));
        reached.arg().check_consistency();
    }

    #[test]
    fn test_presence_condition_blocks_edge() {
        let (cfa, e) = program();
        let bdd = Arc::new(FeatureBdd::new());
        let a = bdd.declare("A");
        let mut cfa = (*cfa).clone();
        cfa.set_presence(e[1], bdd.not(a));

        let mut factory = ExplorerFactory::new(Arc::new(cfa), Some(bdd.clone()));
        let mut engine = factory.compose(vec![observer(1, e[3])], Some(a), None).unwrap();
        let mut reached = ReachedSet::new(engine.initial_state());
        engine.run(&mut reached, &CancelToken::new()).unwrap();
        assert!(!reached.contains_target());

        let mut engine = factory.compose(vec![observer(1, e[3])], Some(bdd.not(a)), None).unwrap();
        let mut reached = ReachedSet::new(engine.initial_state());
        engine.run(&mut reached, &CancelToken::new()).unwrap();
        let targets = reached.targets();
        assert_eq!(targets.len(), 1);
        assert_eq!(reached.arg().state(targets[0]).presence_condition(), Some(bdd.not(a)));
    }

    #[test]
    fn test_max_nodes_is_unsound() {
        let (cfa, e) = program();
        let mut factory = ExplorerFactory::new(cfa, None).with_max_nodes(2);
        let mut engine = factory.compose(vec![observer(1, e[5])], None, None).unwrap();
        let mut reached = ReachedSet::new(engine.initial_state());
        assert_eq!(engine.run(&mut reached, &CancelToken::new()).unwrap(), Soundness::Unsound);
        assert!(reached.has_waiting_state());
    }

    #[test]
    fn test_cancelled_run_keeps_frontier() {
        let (cfa, e) = program();
        let mut factory = ExplorerFactory::new(cfa, None);
        let mut engine = factory.compose(vec![observer(1, e[5])], None, None).unwrap();
        let mut reached = ReachedSet::new(engine.initial_state());
        let cancel = CancelToken::new();
        cancel.cancel();
        assert_eq!(engine.run(&mut reached, &cancel).unwrap(), Soundness::Sound);
        assert_eq!(reached.len(), 1);
        assert!(reached.has_waiting_state());
    }

    #[test]
    fn test_compose_rejects_bad_input() {
        let (cfa, e) = program();
        let mut factory = ExplorerFactory::new(cfa, None);
        assert!(factory.compose(vec![], None, None).is_err());

        let mut other = Cfa::new();
        let n0 = other.add_function("main");
        let n1 = other.add_node("main");
        for _ in 0..10 {
            other.add_edge(n0, n1, "skip;");
        }
        let foreign = other.leaving(n0)[9];
        assert!(factory.compose(vec![observer(1, foreign)], None, None).is_err());
        assert!(factory.compose(vec![observer(1, e[0])], Some(Region::TRUE), None).is_err());
    }
}
