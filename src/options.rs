//! Test generation options.
//!
//! Options can be given as a properties text, one `key = value` per line.
//! Keys may carry the `tiger.` prefix. Lines starting with `#` are comments.
//!
//! ```
//! use covgen_rs::options::{Options, TimeoutStrategy};
//!
//! let options = Options::from_properties(
//!     "tiger.limitsPerGoal.time.cpu = 5\n\
//!      tiger.timeoutStrategy = RETRY_AFTER_TIMEOUT\n",
//! )
//! .unwrap();
//! assert_eq!(options.timeout_strategy, TimeoutStrategy::RetryAfterTimeout);
//! ```

use std::fmt::{Display, Formatter};
use std::path::PathBuf;
use std::str::FromStr;
use std::time::Duration;

use crate::error::{Error, Result};
use crate::goal::CoverageCriterion;

/// What to do with goals whose analysis ran out of time.
#[derive(Debug, Copy, Clone, Eq, PartialEq, Default)]
pub enum TimeoutStrategy {
    /// Keep them as timed out.
    #[default]
    SkipAfterTimeout,
    /// Process them again once all other goals are done.
    RetryAfterTimeout,
}

impl FromStr for TimeoutStrategy {
    type Err = Error;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_ascii_lowercase().replace('-', "_").as_str() {
            "skip_after_timeout" | "skip" => Ok(TimeoutStrategy::SkipAfterTimeout),
            "retry_after_timeout" | "retry" => Ok(TimeoutStrategy::RetryAfterTimeout),
            _ => Err(Error::invalid_option("timeoutStrategy", format!("unknown strategy '{}'", s))),
        }
    }
}

impl Display for TimeoutStrategy {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        match self {
            TimeoutStrategy::SkipAfterTimeout => write!(f, "SKIP_AFTER_TIMEOUT"),
            TimeoutStrategy::RetryAfterTimeout => write!(f, "RETRY_AFTER_TIMEOUT"),
        }
    }
}

/// Order in which timed-out goals are processed again.
#[derive(Debug, Copy, Clone, Eq, PartialEq, Default)]
pub enum RetryOrder {
    /// Order of the first attempt.
    Original,
    /// Reverse order of the first attempt.
    #[default]
    Inverted,
    /// Order in which the goals timed out.
    Unordered,
}

impl RetryOrder {
    /// Order selected by the `useOrder` and `inverseOrder` switches.
    pub fn from_flags(use_order: bool, inverse_order: bool) -> Self {
        match (use_order, inverse_order) {
            (false, _) => RetryOrder::Unordered,
            (true, false) => RetryOrder::Original,
            (true, true) => RetryOrder::Inverted,
        }
    }
}

impl FromStr for RetryOrder {
    type Err = Error;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_ascii_lowercase().as_str() {
            "original" => Ok(RetryOrder::Original),
            "inverted" | "inverse" | "reversed" => Ok(RetryOrder::Inverted),
            "unordered" => Ok(RetryOrder::Unordered),
            _ => Err(Error::invalid_option("retryOrder", format!("unknown order '{}'", s))),
        }
    }
}

impl Display for RetryOrder {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        match self {
            RetryOrder::Original => write!(f, "original"),
            RetryOrder::Inverted => write!(f, "inverted"),
            RetryOrder::Unordered => write!(f, "unordered"),
        }
    }
}

#[derive(Debug, Clone, Eq, PartialEq)]
pub struct Options {
    pub criterion: CoverageCriterion,
    pub optimize_goal_automata: bool,
    /// Observe a batch with one product automaton instead of one automaton per goal.
    pub use_automata_cross_product: bool,
    /// Track sets of automaton states instead of branching per state.
    pub use_powerset: bool,
    /// Check existing test cases before analysing a goal.
    pub check_coverage: bool,
    /// Keep exploring the same ARG across the runs of a batch.
    pub reuse_arg: bool,
    /// Hand the precision of one engine to the next.
    pub reuse_predicates: bool,
    /// Time limit per run, `None` for unbounded.
    ///
    /// Read from `limitsPerGoal.time.cpu`, but enforced on wall-clock time.
    pub time_limit: Option<Duration>,
    /// Added to the time limit before each retry round.
    pub time_limit_increment: Duration,
    pub timeout_strategy: TimeoutStrategy,
    pub retry_order: RetryOrder,
    /// Upper bound on retry rounds, `None` for unbounded.
    pub max_retry_rounds: Option<usize>,
    /// Goals per batch, `0` for all goals in one batch.
    pub goals_per_run: usize,
    /// Record every goal a test case covers, not just the first.
    pub all_covered_goals_per_test_case: bool,
    /// Track presence conditions of features.
    pub with_presence_conditions: bool,
    pub use_infeasibility_propagation: bool,
    pub print_arg_per_goal: bool,
    pub testsuite_file: PathBuf,
    pub generation_times_file: PathBuf,
    /// Path template for dumping composed automata, `%s` is the automaton name.
    pub dump_goal_automata_to: Option<String>,
    /// Path template for per-goal ARG dumps, `%s` is the goal index.
    pub arg_file_template: String,
}

impl Default for Options {
    fn default() -> Self {
        Self {
            criterion: CoverageCriterion::default(),
            optimize_goal_automata: true,
            use_automata_cross_product: false,
            use_powerset: true,
            check_coverage: true,
            reuse_arg: true,
            reuse_predicates: true,
            time_limit: None,
            time_limit_increment: Duration::ZERO,
            timeout_strategy: TimeoutStrategy::default(),
            retry_order: RetryOrder::default(),
            max_retry_rounds: None,
            goals_per_run: 1,
            all_covered_goals_per_test_case: false,
            with_presence_conditions: false,
            use_infeasibility_propagation: false,
            print_arg_per_goal: false,
            testsuite_file: PathBuf::from("testsuite.txt"),
            generation_times_file: PathBuf::from("generationTimes.csv"),
            dump_goal_automata_to: None,
            arg_file_template: "output/ARG_goal_%s.dot".to_string(),
        }
    }
}

fn parse_bool(key: &str, value: &str) -> Result<bool> {
    match value.to_ascii_lowercase().as_str() {
        "true" => Ok(true),
        "false" => Ok(false),
        _ => Err(Error::invalid_option(key, format!("expected a boolean, got '{}'", value))),
    }
}

fn parse_int<T: FromStr>(key: &str, value: &str) -> Result<T> {
    value
        .parse()
        .map_err(|_| Error::invalid_option(key, format!("expected an integer, got '{}'", value)))
}

/// Seconds, optionally suffixed with `s`.
fn parse_seconds(key: &str, value: &str) -> Result<i64> {
    parse_int(key, value.strip_suffix('s').unwrap_or(value).trim_end())
}

impl Options {
    /// Parse a properties text on top of the defaults.
    pub fn from_properties(text: &str) -> Result<Self> {
        let mut options = Options::default();
        let mut use_order = None;
        let mut inverse_order = None;

        for line in text.lines() {
            let line = line.trim();
            if line.is_empty() || line.starts_with('#') {
                continue;
            }
            let Some((key, value)) = line.split_once('=') else {
                return Err(Error::invalid_option(line, "expected 'key = value'"));
            };
            let key = key.trim();
            let key = key.strip_prefix("tiger.").unwrap_or(key);
            let value = value.trim();

            match key {
                "fqlQuery" | "criterion" => options.criterion = value.parse()?,
                "optimizeGoalAutomata" => options.optimize_goal_automata = parse_bool(key, value)?,
                "useAutomataCrossProduct" => options.use_automata_cross_product = parse_bool(key, value)?,
                "usePowerset" => options.use_powerset = parse_bool(key, value)?,
                "checkCoverage" => options.check_coverage = parse_bool(key, value)?,
                "reuseARG" => options.reuse_arg = parse_bool(key, value)?,
                "reusePredicates" => options.reuse_predicates = parse_bool(key, value)?,
                "limitsPerGoal.time.cpu" => {
                    let seconds = parse_seconds(key, value)?;
                    options.time_limit = u64::try_from(seconds).ok().map(Duration::from_secs);
                }
                "limitsPerGoal.time.cpu.increment" => {
                    let seconds = parse_seconds(key, value)?;
                    let seconds = u64::try_from(seconds)
                        .map_err(|_| Error::invalid_option(key, "increment must not be negative"))?;
                    options.time_limit_increment = Duration::from_secs(seconds);
                }
                "timeoutStrategy" => options.timeout_strategy = value.parse()?,
                "retryOrder" => options.retry_order = value.parse()?,
                "useOrder" => use_order = Some(parse_bool(key, value)?),
                "inverseOrder" => inverse_order = Some(parse_bool(key, value)?),
                "maxRetryRounds" => {
                    let rounds: i64 = parse_int(key, value)?;
                    options.max_retry_rounds = usize::try_from(rounds).ok();
                }
                "numberOfTestGoalsPerRun" => options.goals_per_run = parse_int(key, value)?,
                "allCoveredGoalsPerTestCase" => options.all_covered_goals_per_test_case = parse_bool(key, value)?,
                "tiger_with_presenceConditions" => options.with_presence_conditions = parse_bool(key, value)?,
                "useInfeasibilityPropagation" => options.use_infeasibility_propagation = parse_bool(key, value)?,
                "printARGperGoal" => options.print_arg_per_goal = parse_bool(key, value)?,
                "testsuiteFile" => options.testsuite_file = PathBuf::from(value),
                "testcaseGenerationTimesFile" | "testcaseGeneartionTimesFile" => {
                    options.generation_times_file = PathBuf::from(value)
                }
                "dumpGoalAutomataTo" => {
                    options.dump_goal_automata_to = Some(value.to_string()).filter(|v| !v.is_empty())
                }
                "argFileTemplate" => options.arg_file_template = value.to_string(),
                _ => return Err(Error::invalid_option(key, "unknown option")),
            }
        }

        if use_order.is_some() || inverse_order.is_some() {
            options.retry_order = RetryOrder::from_flags(use_order.unwrap_or(true), inverse_order.unwrap_or(true));
        }
        Ok(options)
    }

    /// Batch size for `pending` remaining goals.
    pub fn batch_size(&self, pending: usize) -> usize {
        if self.goals_per_run == 0 {
            pending
        } else {
            self.goals_per_run.min(pending)
        }
    }
}

/// Substitute `%s` in a path template.
pub fn instantiate_template(template: &str, name: &str) -> PathBuf {
    PathBuf::from(template.replace("%s", name))
}
