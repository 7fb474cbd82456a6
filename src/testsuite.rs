//! Test suite repository.
//!
//! Book-keeping of goals, generated test cases and the outcome for every goal:
//! covered (by which test cases, for which configurations), infeasible, or
//! timed out. In variability mode every outcome is a [`Region`] of product
//! configurations rather than a boolean, and a goal is only resolved once its
//! remaining presence condition is empty.
//!
//! Invariant: a goal's remaining presence condition only ever shrinks, and
//! never overlaps a region recorded as covered or infeasible.

use std::collections::{BTreeMap, BTreeSet};
use std::fmt::{Display, Formatter};
use std::io::Write;
use std::sync::Arc;

use log::{debug, info};

use crate::bdd::FeatureBdd;
use crate::error::Result;
use crate::goal::Goal;
use crate::region::Region;
use crate::testcase::TestCase;

/// Heuristic feasibility guess for a goal.
#[derive(Debug, Copy, Clone, Eq, PartialEq, Default)]
pub enum Prediction {
    #[default]
    Unknown,
    Feasible,
    Infeasible,
}

#[derive(Debug, Clone, Default, Eq, PartialEq)]
pub struct Statistics {
    pub test_cases: usize,
    pub goals: usize,
    pub feasible: usize,
    pub partially_feasible: usize,
    pub infeasible: usize,
    pub partially_infeasible: usize,
    pub timed_out: usize,
    pub partially_timed_out: usize,
    pub variability: bool,
}

impl Statistics {
    pub fn has_timeouts(&self) -> bool {
        self.timed_out > 0 || self.partially_timed_out > 0
    }
}

impl Display for Statistics {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        writeln!(f, "Number of test cases:                     {}", self.test_cases)?;
        writeln!(f, "Number of test goals:                     {}", self.goals)?;
        writeln!(f, "Number of feasible test goals:            {}", self.feasible)?;
        if self.variability {
            writeln!(f, "Number of partially feasible test goals:  {}", self.partially_feasible)?;
        }
        writeln!(f, "Number of infeasible test goals:          {}", self.infeasible)?;
        if self.variability {
            writeln!(f, "Number of partially infeasible goals:     {}", self.partially_infeasible)?;
        }
        writeln!(f, "Number of timed-out test goals:           {}", self.timed_out)?;
        if self.variability {
            writeln!(f, "Number of partially timed-out goals:      {}", self.partially_timed_out)?;
        }
        if self.has_timeouts() {
            writeln!(f, "Timeout occurred during processing of a test goal!")?;
        }
        Ok(())
    }
}

#[derive(Debug)]
pub struct TestSuite {
    bdd: Option<Arc<FeatureBdd>>,
    goals: BTreeMap<usize, Goal>,
    test_cases: Vec<TestCase>,
    covered_by: BTreeMap<usize, BTreeSet<usize>>,
    infeasible: BTreeSet<usize>,
    timed_out: BTreeMap<usize, usize>,
    predictions: BTreeMap<usize, Prediction>,
}

impl TestSuite {
    /// Create a repository; passing a manager switches on variability mode.
    pub fn new(bdd: Option<Arc<FeatureBdd>>) -> Self {
        Self {
            bdd,
            goals: BTreeMap::new(),
            test_cases: Vec::new(),
            covered_by: BTreeMap::new(),
            infeasible: BTreeSet::new(),
            timed_out: BTreeMap::new(),
            predictions: BTreeMap::new(),
        }
    }

    pub fn is_variability(&self) -> bool {
        self.bdd.is_some()
    }

    pub fn bdd(&self) -> Option<&Arc<FeatureBdd>> {
        self.bdd.as_ref()
    }

    pub fn add_goals(&mut self, goals: impl IntoIterator<Item = Goal>) {
        for mut goal in goals {
            if self.bdd.is_some() && goal.remaining_pc().is_none() {
                goal.set_remaining_pc(Region::TRUE);
            }
            self.predictions.insert(goal.index(), Prediction::Unknown);
            self.goals.insert(goal.index(), goal);
        }
    }

    pub fn goals(&self) -> impl Iterator<Item = &Goal> {
        self.goals.values()
    }

    pub fn goal(&self, index: usize) -> &Goal {
        match self.goals.get(&index) {
            Some(goal) => goal,
            None => panic!("Unknown goal G{}", index),
        }
    }

    fn goal_mut(&mut self, index: usize) -> &mut Goal {
        match self.goals.get_mut(&index) {
            Some(goal) => goal,
            None => panic!("Unknown goal G{}", index),
        }
    }

    pub fn num_goals(&self) -> usize {
        self.goals.len()
    }

    pub fn test_cases(&self) -> &[TestCase] {
        &self.test_cases
    }

    pub fn test_case(&self, id: usize) -> Option<&TestCase> {
        self.test_cases.iter().find(|tc| tc.id() == id)
    }

    pub fn num_test_cases(&self) -> usize {
        self.test_cases.len()
    }

    /// Record that `test_case` covers `goal` for the configurations in `region`.
    ///
    /// The test case is stored on first use. In variability mode `region` is
    /// subtracted from the goal's remaining presence condition.
    pub fn add_test_case(&mut self, test_case: TestCase, goal: usize, region: Option<Region>) {
        let id = test_case.id();
        if self.test_case(id).is_none() {
            debug!("Adding {}", test_case);
            self.test_cases.push(test_case);
        }
        self.record_coverage(id, goal, region);
    }

    /// Record coverage of `goal` by an already stored test case.
    pub fn record_coverage(&mut self, test_case: usize, goal: usize, region: Option<Region>) {
        assert!(self.test_case(test_case).is_some(), "Unknown test case {}", test_case);
        self.covered_by.entry(goal).or_default().insert(test_case);
        self.predictions.insert(goal, Prediction::Feasible);

        let region = match &self.bdd {
            Some(bdd) => {
                let covered = region.unwrap_or(Region::TRUE);
                let remaining = self.goal(goal).remaining_pc().unwrap_or(Region::TRUE);
                let remaining = bdd.diff(remaining, covered);
                debug!("G{} covered by test case {} for {}", goal, test_case, bdd.dump(covered));
                self.goal_mut(goal).set_remaining_pc(remaining);
                Some(covered)
            }
            None => None,
        };
        self.goal_mut(goal).add_covering(test_case, region);
    }

    /// Record that `goal` is unreachable (for the configurations in `region`).
    pub fn add_infeasible_goal(&mut self, goal: usize, region: Option<Region>) {
        self.infeasible.insert(goal);
        self.predictions.insert(goal, Prediction::Infeasible);

        if let Some(bdd) = &self.bdd {
            let region = region.unwrap_or(Region::TRUE);
            let g = self.goal(goal);
            let infeasible = match g.infeasible_pc() {
                Some(old) => bdd.or(old, region),
                None => region,
            };
            let remaining = bdd.diff(g.remaining_pc().unwrap_or(Region::TRUE), region);
            debug!("G{} infeasible for {}", goal, bdd.dump(region));
            let g = self.goal_mut(goal);
            g.set_infeasible_pc(infeasible);
            g.set_remaining_pc(remaining);
        }
    }

    /// Remember goals whose analysis ran out of time, keyed by their original order.
    pub fn add_timed_out_goals(&mut self, goals: impl IntoIterator<Item = (usize, usize)>) {
        for (order, goal) in goals {
            info!("G{} timed out", goal);
            self.timed_out.insert(order, goal);
        }
    }

    pub fn timed_out_goals(&self) -> &BTreeMap<usize, usize> {
        &self.timed_out
    }

    /// Drain the timed-out goals, for reprocessing.
    pub fn take_timed_out_goals(&mut self) -> BTreeMap<usize, usize> {
        std::mem::take(&mut self.timed_out)
    }

    pub fn is_goal_timed_out(&self, goal: usize) -> bool {
        self.timed_out.values().any(|&g| g == goal)
    }

    /// Covered by at least one test case.
    pub fn is_goal_partially_covered(&self, goal: usize) -> bool {
        self.covered_by.get(&goal).is_some_and(|tcs| !tcs.is_empty())
    }

    /// Covered for every configuration (or just covered, without variability).
    pub fn is_goal_covered(&self, goal: usize) -> bool {
        if !self.is_goal_partially_covered(goal) {
            return false;
        }
        match &self.bdd {
            Some(bdd) => {
                let regions = self.goal(goal).covering().values().map(|r| r.unwrap_or(Region::TRUE));
                bdd.is_true(bdd.or_all(regions))
            }
            None => true,
        }
    }

    pub fn is_goal_infeasible(&self, goal: usize) -> bool {
        self.infeasible.contains(&goal)
    }

    /// Nothing left to find out about `goal`.
    pub fn is_goal_covered_or_infeasible(&self, goal: usize) -> bool {
        match &self.bdd {
            Some(_) => self.goal(goal).remaining_pc().map_or(true, |r| r.is_false()),
            None => self.is_goal_partially_covered(goal) || self.is_goal_infeasible(goal),
        }
    }

    pub fn are_goals_covered_or_infeasible<'a>(&self, goals: impl IntoIterator<Item = &'a usize>) -> bool {
        goals.into_iter().all(|&g| self.is_goal_covered_or_infeasible(g))
    }

    pub fn prediction(&self, goal: usize) -> Prediction {
        self.predictions.get(&goal).copied().unwrap_or_default()
    }

    pub fn set_prediction(&mut self, goal: usize, prediction: Prediction) {
        self.predictions.insert(goal, prediction);
    }

    pub fn goals_covered_by(&self, test_case: usize) -> BTreeSet<usize> {
        self.covered_by
            .iter()
            .filter(|(_, tcs)| tcs.contains(&test_case))
            .map(|(&g, _)| g)
            .collect()
    }

    pub fn num_feasible_goals(&self) -> usize {
        self.goals.keys().filter(|&&g| self.is_goal_partially_covered(g)).count()
    }

    pub fn num_infeasible_goals(&self) -> usize {
        self.infeasible.len()
    }

    pub fn num_timed_out_goals(&self) -> usize {
        self.goals.keys().filter(|&&g| self.is_goal_timed_out(g)).count()
    }

    pub fn statistics(&self) -> Statistics {
        let mut stats = Statistics {
            test_cases: self.test_cases.len(),
            goals: self.goals.len(),
            variability: self.is_variability(),
            ..Default::default()
        };

        if !self.is_variability() {
            stats.feasible = self.num_feasible_goals();
            stats.infeasible = self.num_infeasible_goals();
            stats.timed_out = self.num_timed_out_goals();
            return stats;
        }

        for &g in self.goals.keys() {
            let infeasible = self.is_goal_infeasible(g);
            let timed_out = self.is_goal_timed_out(g);
            if self.is_goal_partially_covered(g) {
                if infeasible {
                    stats.partially_infeasible += 1;
                }
                if timed_out {
                    stats.partially_timed_out += 1;
                }
                if infeasible || timed_out || !self.is_goal_covered(g) {
                    stats.partially_feasible += 1;
                } else {
                    stats.feasible += 1;
                }
            } else if infeasible {
                if timed_out {
                    stats.partially_infeasible += 1;
                    stats.partially_timed_out += 1;
                } else {
                    stats.infeasible += 1;
                }
            } else if timed_out {
                stats.timed_out += 1;
            }
        }
        stats
    }

    /// Attribute each covered goal to its earliest covering test case.
    fn update_coverage_counts(&mut self) {
        for tc in &mut self.test_cases {
            tc.reset_counts();
        }
        let goals: Vec<usize> = self.goals.keys().copied().collect();
        for g in goals {
            let Some(tcs) = self.covered_by.get(&g) else {
                continue;
            };
            let first = tcs
                .iter()
                .filter_map(|&id| self.test_cases.iter().position(|tc| tc.id() == id))
                .min_by_key(|&i| (self.test_cases[i].generation_time(), self.test_cases[i].id()));
            let complete = self.is_goal_covered(g);
            if let Some(i) = first {
                if complete {
                    self.test_cases[i].count_covered();
                } else {
                    self.test_cases[i].count_partially_covered();
                }
            }
        }
    }

    /// Write the test-suite listing.
    pub fn write_testsuite(&self, mut w: impl Write) -> Result<()> {
        write!(w, "{}", self)?;
        Ok(())
    }

    /// Write the generation-time series as `;`-separated values.
    ///
    /// Rows are ordered by generation time. Times are in milliseconds.
    pub fn write_generation_times(&mut self, mut w: impl Write) -> Result<()> {
        self.update_coverage_counts();
        let mut order: Vec<usize> = (0..self.test_cases.len()).collect();
        order.sort_by_key(|&i| (self.test_cases[i].generation_time(), self.test_cases[i].id()));

        if self.is_variability() {
            writeln!(
                w,
                "Test Case;Generation Time;Covered Goals After Generation;\
                 Completely Covered Goals After Generation;Partially Covered Goals After Generation"
            )?;
            let mut complete = 0;
            let mut partial = 0;
            for i in order {
                let tc = &self.test_cases[i];
                complete += tc.newly_covered();
                partial += tc.newly_partially_covered();
                writeln!(
                    w,
                    "{};{};{};{};{}",
                    tc.id(),
                    tc.generation_time().as_millis(),
                    complete + partial,
                    complete,
                    partial
                )?;
            }
        } else {
            writeln!(w, "Test Case;Generation Time;Covered Goals After Generation")?;
            let mut covered = BTreeSet::new();
            for i in order {
                let tc = &self.test_cases[i];
                covered.extend(self.goals_covered_by(tc.id()));
                writeln!(w, "{};{};{}", tc.id(), tc.generation_time().as_millis(), covered.len())?;
            }
        }
        Ok(())
    }
}

impl Display for TestSuite {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        let dump = |r: Option<Region>| match (&self.bdd, r) {
            (Some(bdd), Some(r)) => bdd.dump(r),
            (_, Some(r)) => r.to_string(),
            (_, None) => "TRUE".to_string(),
        };

        writeln!(f, "Test cases:")?;
        for tc in &self.test_cases {
            write!(f, "  {}", tc)?;
            if self.is_variability() {
                write!(f, " for {}", dump(tc.region()))?;
            }
            writeln!(f)?;
            let goals = self.goals_covered_by(tc.id());
            let goals = goals.iter().map(|g| format!("G{}", g)).collect::<Vec<_>>();
            writeln!(f, "    covers: {}", goals.join(", "))?;
        }

        writeln!(f, "Goals:")?;
        for goal in self.goals.values() {
            let g = goal.index();
            write!(f, "  {}:", goal)?;
            if !goal.covering().is_empty() {
                let covering = goal
                    .covering()
                    .iter()
                    .map(|(tc, r)| {
                        if self.is_variability() {
                            format!("{} [{}]", tc, dump(*r))
                        } else {
                            tc.to_string()
                        }
                    })
                    .collect::<Vec<_>>();
                write!(f, " covered by {}", covering.join(", "))?;
            }
            if self.is_goal_infeasible(g) {
                match goal.infeasible_pc() {
                    Some(r) => write!(f, " infeasible for {}", dump(Some(r)))?,
                    None => write!(f, " infeasible")?,
                }
            }
            if self.is_goal_timed_out(g) {
                write!(f, " timed out")?;
            }
            if self.is_variability() && !self.is_goal_covered_or_infeasible(g) {
                write!(f, " remaining {}", dump(goal.remaining_pc()))?;
            }
            writeln!(f)?;
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use std::time::Duration;

    use num_bigint::BigInt;
    use test_log::test;

    use super::*;
    use crate::cfa::Cfa;
    use crate::goal::{extract_goals, CoverageCriterion};

    fn goals() -> Vec<Goal> {
        let mut cfa = Cfa::new();
        let n0 = cfa.add_function("main");
        let n1 = cfa.add_node("main");
        let n2 = cfa.add_node("main");
        cfa.add_assume(n0, n1, "c", true);
        cfa.add_assume(n0, n2, "c", false);
        cfa.add_edge(n1, n2, "x = 1;");
        extract_goals(&cfa, CoverageCriterion::Edges, true)
    }

    fn test_case(id: usize, millis: u64) -> TestCase {
        TestCase::new(id, vec![BigInt::from(id)], vec![], vec![], None, Duration::from_millis(millis))
    }

    #[test]
    fn test_boolean_bookkeeping() {
        let mut suite = TestSuite::new(None);
        suite.add_goals(goals());
        assert_eq!(suite.num_goals(), 3);

        suite.add_test_case(test_case(1, 10), 1, None);
        suite.record_coverage(1, 3, None);
        suite.add_infeasible_goal(2, None);

        assert!(suite.is_goal_covered(1));
        assert!(suite.is_goal_infeasible(2));
        assert_eq!(suite.prediction(2), Prediction::Infeasible);
        assert_eq!(suite.prediction(3), Prediction::Feasible);
        assert!(suite.are_goals_covered_or_infeasible(&[1, 2, 3]));
        assert_eq!(suite.goals_covered_by(1), BTreeSet::from([1, 3]));

        let stats = suite.statistics();
        assert_eq!(stats.feasible, 2);
        assert_eq!(stats.infeasible, 1);
        assert!(!stats.has_timeouts());
    }

    #[test]
    fn test_timed_out_goals() {
        let mut suite = TestSuite::new(None);
        suite.add_goals(goals());
        suite.add_timed_out_goals([(1, 2)]);
        assert!(suite.is_goal_timed_out(2));
        assert!(!suite.are_goals_covered_or_infeasible(&[2]));
        assert_eq!(suite.statistics().timed_out, 1);
        assert_eq!(suite.take_timed_out_goals(), BTreeMap::from([(1, 2)]));
        assert!(suite.timed_out_goals().is_empty());
    }

    #[test]
    fn test_region_conservation() {
        let bdd = Arc::new(FeatureBdd::new());
        let a = bdd.declare("A");
        let b = bdd.declare("B");
        let mut suite = TestSuite::new(Some(bdd.clone()));
        suite.add_goals(goals());
        assert_eq!(suite.goal(1).remaining_pc(), Some(Region::TRUE));

        suite.add_test_case(test_case(1, 5), 1, Some(a));
        let remaining = suite.goal(1).remaining_pc().unwrap();
        assert!(bdd.is_false(bdd.and(remaining, a)));
        assert!(!suite.is_goal_covered(1));
        assert!(suite.is_goal_partially_covered(1));
        assert!(!suite.is_goal_covered_or_infeasible(1));

        let not_a_b = bdd.and(bdd.not(a), b);
        suite.add_test_case(test_case(2, 7), 1, Some(not_a_b));
        let remaining = suite.goal(1).remaining_pc().unwrap();
        assert!(bdd.is_false(bdd.and(remaining, not_a_b)));
        assert_eq!(remaining, bdd.and(bdd.not(a), bdd.not(b)));

        suite.add_infeasible_goal(1, Some(remaining));
        assert!(suite.is_goal_covered_or_infeasible(1));
        assert!(!suite.is_goal_covered(1));

        let stats = suite.statistics();
        assert_eq!(stats.partially_feasible, 1);
        assert_eq!(stats.partially_infeasible, 1);
    }

    #[test]
    fn test_generation_times_csv() {
        let mut suite = TestSuite::new(None);
        suite.add_goals(goals());
        suite.add_test_case(test_case(1, 20), 1, None);
        suite.add_test_case(test_case(2, 10), 2, None);
        suite.record_coverage(1, 3, None);

        let mut out = Vec::new();
        suite.write_generation_times(&mut out).unwrap();
        let text = String::from_utf8(out).unwrap();
        assert_eq!(
            text,
            "Test Case;Generation Time;Covered Goals After Generation\n2;10;1\n1;20;3\n"
        );
    }

    #[test]
    fn test_generation_times_csv_with_variability() {
        let bdd = Arc::new(FeatureBdd::new());
        let a = bdd.declare("A");
        let mut suite = TestSuite::new(Some(bdd.clone()));
        suite.add_goals(goals());
        suite.add_test_case(test_case(1, 10), 1, Some(Region::TRUE));
        suite.add_test_case(test_case(2, 20), 2, Some(a));

        let mut out = Vec::new();
        suite.write_generation_times(&mut out).unwrap();
        let text = String::from_utf8(out).unwrap();
        let lines: Vec<&str> = text.lines().collect();
        assert_eq!(lines.len(), 3);
        assert!(lines[0].ends_with("Partially Covered Goals After Generation"));
        assert_eq!(lines[1], "1;10;1;1;0");
        assert_eq!(lines[2], "2;20;2;1;1");
    }

    #[test]
    fn test_listing() {
        let mut suite = TestSuite::new(None);
        suite.add_goals(goals());
        suite.add_test_case(test_case(1, 20), 1, None);
        suite.add_infeasible_goal(2, None);

        let mut out = Vec::new();
        suite.write_testsuite(&mut out).unwrap();
        let text = String::from_utf8(out).unwrap();
        assert!(text.contains("TestCase 1 [1]"));
        assert!(text.contains("covers: G1"));
        assert!(text.contains("G1 (e0): covered by 1"));
        assert!(text.contains("G2 (e1): infeasible"));
    }
}
