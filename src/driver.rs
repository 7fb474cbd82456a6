//! Goal batch scheduler.
//!
//! [`TestGenerator`] processes the goals in batches. For each batch it first
//! replays the existing test cases against the goal automata, and only then
//! pays for an analysis run: the batch's observers are composed into an
//! engine, which is run against a reached set (bounded by the time limit, if
//! any) until every goal of the batch is covered or proven infeasible, or the
//! frontier is exhausted.
//!
//! After each run, target states are turned into test cases, pruned from the
//! ARG, and the resolved goals are disabled (or, with presence conditions,
//! the feature constraint is narrowed) before exploration resumes. Goals of a
//! batch that ran out of time are collected and, depending on the timeout
//! strategy, processed again once all batches are done.

use std::collections::{BTreeMap, BTreeSet, VecDeque};
use std::fmt::{Display, Formatter};
use std::fs::{self, File};
use std::io::BufWriter;
use std::path::Path;
use std::sync::Arc;
use std::time::{Duration, Instant};

use log::{debug, info, warn};
use num_bigint::BigInt;

use crate::arg::{AbstractState, ArgNodeId, ArgPath};
use crate::automaton::{Automaton, Observer, ProductAutomaton, ThreeValued};
use crate::bdd::FeatureBdd;
use crate::cfa::Cfa;
use crate::engine::{input_values, AnalysisEngine, CounterexampleInfo, EngineFactory};
use crate::error::{Error, Result};
use crate::goal::{extract_goals, Goal};
use crate::options::{instantiate_template, Options, RetryOrder, TimeoutStrategy};
use crate::propagation::propagate_infeasibility;
use crate::reached::ReachedSet;
use crate::region::Region;
use crate::testcase::TestCase;
use crate::testsuite::{Prediction, Statistics, TestSuite};
use crate::timeout::{run_bounded, RunOutcome};

type PrecisionOf<F> = <<F as EngineFactory>::Engine as AnalysisEngine>::Precision;

/// Summary of a [`TestGenerator::generate`] call.
#[derive(Debug, Clone)]
pub struct GenerationReport {
    /// No analysis run was unsound.
    pub sound: bool,
    pub processed_goals: usize,
    pub retry_rounds: usize,
    pub elapsed: Duration,
    pub statistics: Statistics,
}

impl Display for GenerationReport {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        if self.sound {
            writeln!(f, "Test generation was sound.")?;
        } else {
            writeln!(f, "Test generation contained unsound analysis runs!")?;
        }
        writeln!(f, "Number of processed test goals:           {}", self.processed_goals)?;
        writeln!(f, "Number of retry rounds:                   {}", self.retry_rounds)?;
        writeln!(f, "Generation time:                          {:?}", self.elapsed)?;
        write!(f, "{}", self.statistics)
    }
}

pub struct TestGenerator<F: EngineFactory> {
    options: Options,
    cfa: Arc<Cfa>,
    factory: F,
    testsuite: TestSuite,
    order: BTreeMap<usize, usize>,
    next_test_case: usize,
    start: Instant,
    time_limit: Option<Duration>,
    processed: usize,
    precision: Option<PrecisionOf<F>>,
    timeout_log: Vec<usize>,
}

impl<F: EngineFactory> TestGenerator<F> {
    /// Set up generation for the given goals.
    ///
    /// A feature manager is required when presence conditions are tracked,
    /// and ignored otherwise.
    pub fn new(
        options: Options,
        cfa: Arc<Cfa>,
        goals: Vec<Goal>,
        bdd: Option<Arc<FeatureBdd>>,
        factory: F,
    ) -> Result<Self> {
        let bdd = match (options.with_presence_conditions, bdd) {
            (true, None) => {
                return Err(Error::invalid_option(
                    "tiger_with_presenceConditions",
                    "presence conditions need a feature manager",
                ))
            }
            (true, bdd) => bdd,
            (false, _) => None,
        };

        let order = goals.iter().enumerate().map(|(i, g)| (g.index(), i)).collect();
        let mut testsuite = TestSuite::new(bdd);
        testsuite.add_goals(goals);

        Ok(Self {
            time_limit: options.time_limit,
            options,
            cfa,
            factory,
            testsuite,
            order,
            next_test_case: 1,
            start: Instant::now(),
            processed: 0,
            precision: None,
            timeout_log: Vec::new(),
        })
    }

    /// Set up generation for the goals of the configured coverage criterion.
    pub fn for_criterion(options: Options, cfa: Arc<Cfa>, bdd: Option<Arc<FeatureBdd>>, factory: F) -> Result<Self> {
        let goals = extract_goals(&cfa, options.criterion, options.optimize_goal_automata);
        Self::new(options, cfa, goals, bdd, factory)
    }

    pub fn options(&self) -> &Options {
        &self.options
    }

    pub fn testsuite(&self) -> &TestSuite {
        &self.testsuite
    }

    pub fn into_testsuite(self) -> TestSuite {
        self.testsuite
    }

    /// Current per-run time limit (grows with each retry round).
    pub fn time_limit(&self) -> Option<Duration> {
        self.time_limit
    }

    fn is_variability(&self) -> bool {
        self.testsuite.is_variability()
    }

    fn is_resolved(&self, goal: usize) -> bool {
        self.testsuite.is_goal_covered_or_infeasible(goal)
    }

    fn unresolved(&self, batch: &[usize]) -> Vec<usize> {
        batch.iter().copied().filter(|&g| !self.is_resolved(g)).collect()
    }

    fn dump(&self, region: Option<Region>) -> String {
        match (self.testsuite.bdd(), region) {
            (Some(bdd), Some(r)) => bdd.dump(r),
            _ => "TRUE".to_string(),
        }
    }

    /// Run test generation for all goals.
    pub fn generate(&mut self) -> Result<GenerationReport> {
        self.start = Instant::now();
        let mut sound = true;
        let mut rounds = 0;
        let mut pending: VecDeque<usize> = self.testsuite.goals().map(|g| g.index()).collect();
        let total = pending.len();

        loop {
            while !pending.is_empty() {
                let size = self.options.batch_size(pending.len());
                let batch: Vec<usize> = pending.drain(..size).collect();
                self.processed += batch.len();
                if !self.process_batch(&batch, total)? {
                    sound = false;
                }
            }

            if self.testsuite.timed_out_goals().is_empty() {
                info!("There were no timed out goals.");
                break;
            }
            if self.options.timeout_strategy != TimeoutStrategy::RetryAfterTimeout {
                info!("There were timed out goals but retry after timeout strategy is disabled.");
                break;
            }
            if self.options.max_retry_rounds.is_some_and(|max| rounds >= max) {
                info!("Giving up on timed out goals after {} retry rounds.", rounds);
                break;
            }

            rounds += 1;
            if let Some(limit) = self.time_limit {
                if !self.options.time_limit_increment.is_zero() {
                    let increased = limit + self.options.time_limit_increment;
                    info!("Incremented timeout from {:?} to {:?}.", limit, increased);
                    self.time_limit = Some(increased);
                }
            }
            pending = self.retry_queue();
            self.processed -= pending.len();
            info!("Retry round {} for {} timed out goals", rounds, pending.len());
        }

        if self.options.all_covered_goals_per_test_case {
            let goals: Vec<usize> = self.testsuite.goals().map(|g| g.index()).collect();
            for g in goals {
                self.check_coverage(g);
            }
        }

        let report = GenerationReport {
            sound,
            processed_goals: self.processed,
            retry_rounds: rounds,
            elapsed: self.start.elapsed(),
            statistics: self.testsuite.statistics(),
        };
        if !sound {
            warn!("Test generation contained unsound reachability analysis runs!");
        }
        info!("Generated {} test cases in {:?}", report.statistics.test_cases, report.elapsed);
        Ok(report)
    }

    fn retry_queue(&mut self) -> VecDeque<usize> {
        let timed_out = self.testsuite.take_timed_out_goals();
        let log = std::mem::take(&mut self.timeout_log);
        match self.options.retry_order {
            RetryOrder::Original => timed_out.into_values().collect(),
            RetryOrder::Inverted => timed_out.into_values().rev().collect(),
            RetryOrder::Unordered => {
                let goals: BTreeSet<usize> = timed_out.into_values().collect();
                log.into_iter().filter(|g| goals.contains(g)).collect()
            }
        }
    }

    /// Process one batch, returning `false` if some analysis run was unsound.
    fn process_batch(&mut self, batch: &[usize], total: usize) -> Result<bool> {
        let labels: Vec<String> = batch.iter().map(|&g| self.testsuite.goal(g).to_string()).collect();
        if self.is_variability() {
            let remaining = self.remaining_constraint(batch);
            info!(
                "Processing test goals {} of {} for PC {}.",
                labels.join(", "),
                total,
                self.dump(Some(remaining))
            );
        } else {
            info!("Processing test goals {} of {}.", labels.join(", "), total);
        }

        for &g in batch {
            if !self.is_resolved(g) && self.testsuite.goal(g).automaton().is_degenerated() {
                info!("{} has a degenerated automaton", self.testsuite.goal(g));
                self.handle_infeasible_goal(g);
            }
        }

        let mut sound = true;
        while !self.testsuite.are_goals_covered_or_infeasible(batch) {
            if self.options.check_coverage {
                for &g in batch {
                    if !self.is_resolved(g) && self.testsuite.prediction(g) != Prediction::Infeasible {
                        self.check_coverage(g);
                    }
                }
                if self.testsuite.are_goals_covered_or_infeasible(batch) {
                    break;
                }
            }

            let (outcome, run_sound) = self.run_analysis(batch)?;
            if !run_sound {
                warn!("Analysis run was unsound!");
                sound = false;
            }
            if outcome == RunOutcome::TimedOut {
                break;
            }
        }
        Ok(sound)
    }

    /// Disjunction of the remaining presence conditions of the batch.
    fn remaining_constraint(&self, batch: &[usize]) -> Region {
        match self.testsuite.bdd() {
            Some(bdd) => bdd.or_all(
                batch
                    .iter()
                    .filter_map(|&g| self.testsuite.goal(g).remaining_pc()),
            ),
            None => Region::TRUE,
        }
    }

    fn open_regions(&self, batch: &[usize]) -> BTreeMap<usize, Region> {
        batch
            .iter()
            .map(|&g| {
                let goal = self.testsuite.goal(g);
                let open = if self.is_resolved(g) {
                    Region::FALSE
                } else {
                    goal.remaining_pc().unwrap_or(Region::TRUE)
                };
                (g, open)
            })
            .collect()
    }

    /// Replay existing test cases against the goal automaton.
    fn check_coverage(&mut self, goal: usize) {
        let g = self.testsuite.goal(goal).clone();
        let test_cases: Vec<TestCase> = self.testsuite.test_cases().to_vec();

        for tc in &test_cases {
            match g.accepts(tc.trace()) {
                ThreeValued::Unknown => {
                    warn!("Coverage check for {} could not be performed in a precise way!", g);
                    continue;
                }
                ThreeValued::Reject => continue,
                ThreeValued::Accept => {}
            }

            if let Some(bdd) = self.testsuite.bdd().cloned() {
                if g.covering().contains_key(&tc.id()) {
                    continue;
                }
                let remaining = self.testsuite.goal(goal).remaining_pc().unwrap_or(Region::TRUE);
                let crossings = tc
                    .trace()
                    .iter()
                    .enumerate()
                    .filter(|&(_, &e)| e == g.critical_edge())
                    .filter_map(|(i, _)| tc.presence_after(i + 1))
                    .filter(|&r| self.options.all_covered_goals_per_test_case || !bdd.and(remaining, r).is_false());
                let region = bdd.or_all(crossings);
                if !region.is_false() {
                    self.testsuite.record_coverage(tc.id(), goal, Some(region));
                    info!(
                        "Covered some PCs for {} for PC {} by existing test case {}, remaining PC {}",
                        g,
                        bdd.dump(region),
                        tc.id(),
                        self.dump(self.testsuite.goal(goal).remaining_pc())
                    );
                }
            } else {
                self.testsuite.record_coverage(tc.id(), goal, None);
                info!("Covered {} by existing test case {}", g, tc.id());
                if !self.options.all_covered_goals_per_test_case {
                    return;
                }
            }
        }
    }

    fn compose_observers(&self, goals: &[usize]) -> Result<Vec<Observer>> {
        let powerset = self.options.use_powerset;
        if self.options.use_automata_cross_product {
            let components: Vec<(usize, &Automaton)> = goals
                .iter()
                .map(|&g| (g, self.testsuite.goal(g).automaton()))
                .collect();
            let name = goals.iter().map(|g| format!("G{}", g)).collect::<Vec<_>>().join("x");
            let product = ProductAutomaton::of(&name, &components)?;
            debug!("Product automaton {} has {} states", name, product.automaton().num_states());
            return Ok(vec![Observer::Product { product, powerset }]);
        }
        Ok(goals
            .iter()
            .map(|&g| {
                let automaton = self.testsuite.goal(g).automaton().clone();
                if powerset {
                    Observer::Powerset { goal: g, automaton }
                } else {
                    Observer::Plain { goal: g, automaton }
                }
            })
            .collect())
    }

    fn dump_automata(&self, observers: &[Observer]) {
        let Some(template) = &self.options.dump_goal_automata_to else {
            return;
        };
        for observer in observers {
            let automaton = observer.automaton();
            let path = instantiate_template(template, automaton.name());
            let written = automaton
                .to_dot()
                .map_err(Error::from)
                .and_then(|dot| write_file(&path, &dot));
            if let Err(e) = written {
                warn!("Could not write automaton to {}: {}", path.display(), e);
            }
        }
    }

    /// Compose an engine for the unresolved goals of `batch` and explore until
    /// the batch is resolved, the frontier is exhausted, or a run times out.
    ///
    /// Goals still open afterwards are infeasible unless the analysis timed
    /// out. The flag is `false` if some run was unsound.
    fn run_analysis(&mut self, batch: &[usize]) -> Result<(RunOutcome, bool)> {
        let goals = self.unresolved(batch);
        let observers = self.compose_observers(&goals)?;
        self.dump_automata(&observers);

        let constraint = self.is_variability().then(|| self.remaining_constraint(batch));
        let precision = if self.options.reuse_predicates {
            self.precision.clone()
        } else {
            None
        };
        let mut engine = self.factory.compose(observers, constraint, precision)?;
        let mut reached = ReachedSet::new(engine.initial_state());
        if let Some(c) = constraint {
            let open = self.open_regions(batch);
            engine.restrict_presence_condition(&mut reached, c, &open);
        }

        let mut sound = true;
        let outcome = loop {
            let size = (reached.len(), reached.num_waiting());
            let outcome = run_bounded(&mut engine, &mut reached, self.time_limit);
            debug!("Analysis run finished: {} ({} nodes)", outcome, reached.len());
            if outcome == RunOutcome::TimedOut {
                break outcome;
            }
            if outcome == RunOutcome::Unsound {
                sound = false;
            }

            let (targets, created) = self.harvest(batch, engine.counterexamples(), &mut reached);
            if targets > 0 && created == 0 {
                warn!("No test case could be derived from {} target states", targets);
                sound = false;
                break RunOutcome::Unsound;
            }
            if !reached.has_waiting_state() || self.testsuite.are_goals_covered_or_infeasible(batch) {
                break outcome;
            }
            let stalled = targets == 0 && size == (reached.len(), reached.num_waiting());
            if outcome == RunOutcome::Unsound && stalled {
                warn!("Unsound analysis run made no progress, giving up on the remaining frontier");
                break outcome;
            }

            if !self.options.reuse_arg {
                reached = ReachedSet::new(engine.initial_state());
            }
            self.narrow(batch, &mut engine, &mut reached);
        };

        if self.options.reuse_predicates {
            self.precision = Some(engine.precision());
        }

        match outcome {
            RunOutcome::TimedOut => {
                info!("Test goal timed out!");
                let unresolved = self.unresolved(batch);
                self.timeout_log.extend(unresolved.iter().copied());
                let entries: Vec<(usize, usize)> = unresolved.iter().map(|&g| (self.order[&g], g)).collect();
                self.testsuite.add_timed_out_goals(entries);
            }
            RunOutcome::Sound | RunOutcome::Unsound => {
                for g in self.unresolved(batch) {
                    self.handle_infeasible_goal(g);
                }
            }
        }

        if self.options.print_arg_per_goal {
            for &g in batch {
                let path = instantiate_template(&self.options.arg_file_template, &g.to_string());
                let written = reached
                    .arg()
                    .to_dot(&self.cfa)
                    .map_err(Error::from)
                    .and_then(|dot| write_file(&path, &dot));
                if let Err(e) = written {
                    warn!("Could not write ARG to {}: {}", path.display(), e);
                }
            }
        }

        Ok((outcome, sound))
    }

    /// Stop looking for resolved goals on the remaining frontier.
    fn narrow<E: AnalysisEngine>(&self, batch: &[usize], engine: &mut E, reached: &mut ReachedSet<E::State>) {
        let resolved: BTreeSet<usize> = batch.iter().copied().filter(|&g| self.is_resolved(g)).collect();
        if !resolved.is_empty() {
            engine.disable_goals(reached, &resolved);
        }
        if self.is_variability() {
            let constraint = self.remaining_constraint(batch);
            let open = self.open_regions(batch);
            debug!("Restrict exploration to {}", self.dump(Some(constraint)));
            engine.restrict_presence_condition(reached, constraint, &open);
        }
    }

    /// Turn the target states of the latest run into test cases, then prune them.
    ///
    /// Returns the number of target states and of test cases created.
    fn harvest<S: AbstractState>(
        &mut self,
        batch: &[usize],
        counterexamples: &BTreeMap<ArgNodeId, CounterexampleInfo>,
        reached: &mut ReachedSet<S>,
    ) -> (usize, usize) {
        let targets = reached.targets();
        if targets.is_empty() {
            return (0, 0);
        }
        let before = self.testsuite.num_test_cases();

        if counterexamples.is_empty() {
            info!("Counterexample is not available.");
            for &t in &targets {
                let path = reached.arg().one_path_to(t);
                let accepted = reached.arg().state(t).accepted_goals();
                let goals: Vec<usize> = self
                    .unresolved(batch)
                    .into_iter()
                    .filter(|g| accepted.contains(g))
                    .collect();
                self.add_test_case(&goals, &path, Vec::new(), reached, true);
            }
        } else {
            info!("Counterexample is available.");
            for cex in counterexamples.values() {
                if cex.spurious {
                    warn!("Counterexample for {} is spurious!", cex.target);
                    continue;
                }
                if !reached.arg().contains(cex.target) {
                    continue;
                }
                let goals: Vec<usize> = self
                    .unresolved(batch)
                    .into_iter()
                    .filter(|&g| cex.path.edges.contains(&self.testsuite.goal(g).critical_edge()))
                    .collect();
                let inputs = input_values(&cex.model);
                self.add_test_case(&goals, &cex.path, inputs, reached, false);
            }
        }

        let created = self.testsuite.num_test_cases() - before;
        let found = targets.len();
        for t in targets {
            if reached.arg().contains(t) && reached.arg().is_attached(t) {
                reached.remove_subtree(t);
            }
        }
        let removed = reached.reclaim();
        debug!("Pruned {} target states, reclaimed {} nodes", found, removed);
        (found, created)
    }

    /// Record a test case for `path` covering those of `goals` it reaches.
    fn add_test_case<S: AbstractState>(
        &mut self,
        goals: &[usize],
        path: &ArgPath,
        inputs: Vec<BigInt>,
        reached: &ReachedSet<S>,
        reconstructed: bool,
    ) {
        let presence: Vec<Option<Region>> = path
            .nodes
            .iter()
            .map(|&n| reached.arg().state(n).presence_condition())
            .collect();
        let final_region = presence.last().copied().flatten();

        let mut covered = Vec::new();
        for &g in goals {
            let critical = self.testsuite.goal(g).critical_edge();
            let crossing = path.edges.iter().position(|&e| e == critical);
            if crossing.is_none() && reconstructed {
                warn!(
                    "Reconstructed path to {} does not cross the critical edge of G{}",
                    path.nodes.last().map_or_else(String::new, |n| n.to_string()),
                    g
                );
            }
            let region = match crossing {
                Some(i) => presence.get(i + 1).copied().flatten(),
                None => final_region,
            };
            if let (Some(bdd), Some(region)) = (self.testsuite.bdd(), region) {
                let remaining = self.testsuite.goal(g).remaining_pc().unwrap_or(Region::TRUE);
                if bdd.and(remaining, region).is_false() {
                    continue;
                }
            }
            covered.push((g, region));
        }
        if covered.is_empty() {
            debug!("Target path covers no open goal of the batch");
            return;
        }

        let id = self.next_test_case;
        self.next_test_case += 1;
        let region = if self.is_variability() {
            covered[0].1.or(final_region)
        } else {
            None
        };
        let tc = TestCase::new(
            id,
            inputs,
            path.nodes.clone(),
            path.edges.clone(),
            region,
            self.start.elapsed(),
        )
        .with_presence(presence);

        if self.is_variability() {
            info!("Generated test case {} with PC {}", id, self.dump(region));
        } else {
            info!("Generated {}", tc);
        }
        for (g, region) in covered {
            self.testsuite.add_test_case(tc.clone(), g, region);
        }
    }

    fn handle_infeasible_goal(&mut self, goal: usize) {
        if self.is_variability() {
            let remaining = self.testsuite.goal(goal).remaining_pc();
            warn!("Goal {} is infeasible for remaining PC {}!", goal, self.dump(remaining));
            self.testsuite.add_infeasible_goal(goal, remaining);
        } else {
            warn!("Goal {} is infeasible!", goal);
            self.testsuite.add_infeasible_goal(goal, None);
        }

        if self.options.use_infeasibility_propagation {
            info!("Do infeasibility propagation!");
            propagate_infeasibility(&self.cfa, &mut self.testsuite, goal);
        }
    }

    /// Write the test-suite listing and the generation times.
    pub fn write_outputs(&mut self) -> Result<()> {
        let path = self.options.testsuite_file.clone();
        create_parent(&path)?;
        self.testsuite.write_testsuite(BufWriter::new(File::create(&path)?))?;

        let path = self.options.generation_times_file.clone();
        create_parent(&path)?;
        self.testsuite
            .write_generation_times(BufWriter::new(File::create(&path)?))?;
        Ok(())
    }
}

fn create_parent(path: &Path) -> Result<()> {
    if let Some(parent) = path.parent().filter(|p| !p.as_os_str().is_empty()) {
        fs::create_dir_all(parent)?;
    }
    Ok(())
}

fn write_file(path: &Path, contents: &str) -> Result<()> {
    create_parent(path)?;
    fs::write(path, contents)?;
    Ok(())
}
