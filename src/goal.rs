//! Coverage goals.
//!
//! A goal is identified by its *critical edge*: a test case covers the goal
//! when its execution traverses that edge. Goals generated from the same
//! elementary pattern form a cluster, which infeasibility propagation uses
//! to guess about siblings of an infeasible goal.

use std::collections::BTreeMap;
use std::fmt::{Display, Formatter};
use std::str::FromStr;

use log::{debug, info, warn};

use crate::automaton::{Automaton, ThreeValued};
use crate::cfa::{Cfa, CfaNode, EdgeId};
use crate::error::Error;
use crate::region::Region;

/// Elementary pattern a goal was generated from.
#[derive(Debug, Clone, Eq, PartialEq)]
pub struct Pattern {
    /// Goals with equal cluster ids are siblings.
    pub cluster: usize,
    /// Location where every goal of the cluster is searched from.
    pub entry: CfaNode,
}

#[derive(Debug, Clone)]
pub struct Goal {
    index: usize,
    critical_edge: EdgeId,
    pattern: Pattern,
    automaton: Automaton,
    remaining_pc: Option<Region>,
    infeasible_pc: Option<Region>,
    covering: BTreeMap<usize, Option<Region>>,
}

impl Goal {
    pub fn new(index: usize, critical_edge: EdgeId, pattern: Pattern, automaton: Automaton) -> Self {
        Self {
            index,
            critical_edge,
            pattern,
            automaton,
            remaining_pc: None,
            infeasible_pc: None,
            covering: BTreeMap::new(),
        }
    }

    /// Goal reaching `edge` with the canonical two-state automaton.
    pub fn for_edge(index: usize, edge: EdgeId, pattern: Pattern) -> Self {
        let automaton = Automaton::reaching(&format!("G{}", index), edge);
        Self::new(index, edge, pattern, automaton)
    }

    /// Stable 1-based identity.
    pub fn index(&self) -> usize {
        self.index
    }

    pub fn name(&self) -> String {
        format!("G{}", self.index)
    }

    pub fn critical_edge(&self) -> EdgeId {
        self.critical_edge
    }

    pub fn pattern(&self) -> &Pattern {
        &self.pattern
    }

    pub fn automaton(&self) -> &Automaton {
        &self.automaton
    }

    pub fn set_automaton(&mut self, automaton: Automaton) {
        self.automaton = automaton;
    }

    pub fn accepts(&self, trace: &[EdgeId]) -> ThreeValued {
        self.automaton.accepts(trace)
    }

    /// Configurations for which the goal is still open.
    pub fn remaining_pc(&self) -> Option<Region> {
        self.remaining_pc
    }

    pub(crate) fn set_remaining_pc(&mut self, region: Region) {
        self.remaining_pc = Some(region);
    }

    /// Configurations for which the goal was proven unreachable.
    pub fn infeasible_pc(&self) -> Option<Region> {
        self.infeasible_pc
    }

    pub(crate) fn set_infeasible_pc(&mut self, region: Region) {
        self.infeasible_pc = Some(region);
    }

    /// Covering test cases, with the configurations each of them covers.
    pub fn covering(&self) -> &BTreeMap<usize, Option<Region>> {
        &self.covering
    }

    pub(crate) fn add_covering(&mut self, test_case: usize, region: Option<Region>) {
        self.covering.insert(test_case, region);
    }
}

impl Display for Goal {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        write!(f, "G{} ({})", self.index, self.critical_edge)
    }
}

/// Predefined structural coverage criteria.
#[derive(Debug, Copy, Clone, Eq, PartialEq, Default)]
pub enum CoverageCriterion {
    /// One goal per control-flow edge.
    #[default]
    Edges,
    /// One goal per outcome of every branching location.
    Decisions,
}

impl FromStr for CoverageCriterion {
    type Err = Error;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_ascii_lowercase().as_str() {
            "edges" | "edge" | "cover edges(@basicblockentry)" => Ok(CoverageCriterion::Edges),
            "decisions" | "decision" | "cover edges(@decisionedge)" => Ok(CoverageCriterion::Decisions),
            _ => Err(Error::invalid_option("fqlQuery", format!("unknown coverage criterion '{}'", s))),
        }
    }
}

impl Display for CoverageCriterion {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        match self {
            CoverageCriterion::Edges => write!(f, "edges"),
            CoverageCriterion::Decisions => write!(f, "decisions"),
        }
    }
}

/// Expand a coverage criterion into goals over `cfa`.
///
/// Goals are numbered from 1 in edge order. Goals in the same function share
/// a cluster whose entry is the function entry. With `optimize`, each goal
/// automaton is reduced; degenerated automata are reported.
pub fn extract_goals(cfa: &Cfa, criterion: CoverageCriterion, optimize: bool) -> Vec<Goal> {
    let mut clusters: BTreeMap<String, usize> = BTreeMap::new();
    let mut goals = Vec::new();

    for edge in cfa.edges() {
        let selected = match criterion {
            CoverageCriterion::Edges => true,
            CoverageCriterion::Decisions => cfa.is_branching(edge.predecessor),
        };
        if !selected {
            continue;
        }

        let function = cfa.function_of(edge.predecessor).to_string();
        let entry = cfa.function_entry(&function).unwrap_or_else(|| cfa.entry());
        let next_cluster = clusters.len();
        let cluster = *clusters.entry(function).or_insert(next_cluster);

        let mut goal = Goal::for_edge(goals.len() + 1, edge.id, Pattern { cluster, entry });
        if optimize {
            let (reduced, _) = goal.automaton().optimize();
            goal.set_automaton(reduced);
        }
        if goal.automaton().is_degenerated() {
            warn!("Goal {} has a degenerated automaton", goal);
        }
        debug!("Goal {}: {}", goal, edge);
        goals.push(goal);
    }

    info!("Criterion '{}' yields {} goals in {} clusters", criterion, goals.len(), clusters.len());
    goals
}

#[cfg(test)]
mod tests {
    use test_log::test;

    use super::*;

    fn program() -> Cfa {
        let mut cfa = Cfa::new();
        let n0 = cfa.add_function("main");
        let n1 = cfa.add_node("main");
        let n2 = cfa.add_node("main");
        let n3 = cfa.add_node("main");
        let n4 = cfa.add_node("main");
        cfa.add_input(n0, n1, "x", 0);
        cfa.add_assume(n1, n2, "x > 0", true);
        cfa.add_assume(n1, n3, "x > 0", false);
        cfa.add_edge(n2, n4, "y = 1;");
        cfa.add_edge(n3, n4, "y = 2;");

        let f0 = cfa.add_function("f");
        let f1 = cfa.add_node("f");
        cfa.add_edge(f0, f1, "return;");
        cfa
    }

    #[test]
    fn test_edge_goals() {
        let cfa = program();
        let goals = extract_goals(&cfa, CoverageCriterion::Edges, true);
        assert_eq!(goals.len(), 6);
        assert_eq!(goals.iter().map(|g| g.index()).collect::<Vec<_>>(), vec![1, 2, 3, 4, 5, 6]);
        assert!(goals[..5].iter().all(|g| g.pattern().cluster == 0));
        assert_eq!(goals[5].pattern().cluster, 1);
        assert_eq!(goals[5].pattern().entry, cfa.function_entry("f").unwrap());
    }

    #[test]
    fn test_decision_goals() {
        let cfa = program();
        let goals = extract_goals(&cfa, CoverageCriterion::Decisions, false);
        assert_eq!(goals.len(), 2);
        assert_eq!(cfa.edge(goals[0].critical_edge()).label, "[x > 0]");
        assert_eq!(cfa.edge(goals[1].critical_edge()).label, "[!(x > 0)]");
    }

    #[test]
    fn test_goal_accepts_its_edge() {
        let cfa = program();
        let goals = extract_goals(&cfa, CoverageCriterion::Edges, true);
        let g = &goals[1];
        let trace: Vec<EdgeId> = cfa.leaving(cfa.entry()).to_vec();
        assert_eq!(g.accepts(&trace), ThreeValued::Reject);
        let trace = vec![trace[0], g.critical_edge()];
        assert_eq!(g.accepts(&trace), ThreeValued::Accept);
    }

    #[test]
    fn test_parse_criterion() {
        assert_eq!("edges".parse::<CoverageCriterion>().unwrap(), CoverageCriterion::Edges);
        assert_eq!(
            "COVER EDGES(@DECISIONEDGE)".parse::<CoverageCriterion>().unwrap(),
            CoverageCriterion::Decisions
        );
        assert!("paths".parse::<CoverageCriterion>().is_err());
    }
}
