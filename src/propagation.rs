//! Infeasibility propagation.
//!
//! Once a goal is known to be infeasible, every later goal of the same cluster
//! whose critical edge can only be reached through the infeasible goal's
//! critical edge is predicted infeasible as well. The check is a plain
//! control-flow search and ignores data, so the result is only a hint.

use std::collections::BTreeSet;

use log::{debug, info};

use crate::cfa::Cfa;
use crate::testsuite::{Prediction, TestSuite};

/// Mark the siblings of the infeasible `goal` that are unreachable without
/// its critical edge as predicted infeasible, and return them.
pub fn propagate_infeasibility(cfa: &Cfa, testsuite: &mut TestSuite, goal: usize) -> Vec<usize> {
    let infeasible = testsuite.goal(goal);
    let pattern = infeasible.pattern().clone();
    let avoid = infeasible.critical_edge();

    let siblings: Vec<(usize, _)> = testsuite
        .goals()
        .filter(|g| g.index() > goal && g.pattern().cluster == pattern.cluster)
        .filter(|g| testsuite.prediction(g.index()) == Prediction::Unknown)
        .map(|g| (g.index(), g.critical_edge()))
        .collect();
    if siblings.is_empty() {
        return Vec::new();
    }

    let targets: BTreeSet<_> = siblings.iter().map(|&(_, e)| e).collect();
    let found = cfa.reachable_edges(pattern.entry, avoid, &targets);
    debug!(
        "Propagating infeasibility of G{}: {} of {} sibling edges reachable from {}",
        goal,
        found.len(),
        targets.len(),
        pattern.entry
    );

    let mut predicted = Vec::new();
    for (sibling, edge) in siblings {
        if !found.contains(&edge) {
            testsuite.set_prediction(sibling, Prediction::Infeasible);
            predicted.push(sibling);
        }
    }
    if !predicted.is_empty() {
        info!("Predicted infeasible after G{}: {:?}", goal, predicted);
    }
    predicted
}
