//! # covgen-rs: coverage-directed test generation
//!
//! **`covgen-rs`** generates test inputs for a program, one coverage goal at a time,
//! by running a reachability analysis against *goal automata* and turning the
//! counterexamples it finds into concrete test cases.
//!
//! ## How it works
//!
//! Each coverage goal is identified by a *critical edge* of the program's control-flow
//! automaton, and observed by a small automaton that accepts exactly the executions
//! traversing that edge. The driver processes goals in batches:
//!
//! 1. Existing test cases are replayed against the goal automata (three-valued: a
//!    guarded transition may leave the answer *unknown*).
//! 2. The batch's automata are composed with the program analysis into an
//!    [`AnalysisEngine`][crate::engine::AnalysisEngine], which explores an
//!    [abstract reachability graph][crate::arg::Arg] until it hits a target state.
//! 3. Every target is turned into a [`TestCase`][crate::testcase::TestCase], pruned
//!    from the graph, and its goals are disabled before exploration resumes.
//! 4. Goals that remain unreached when the frontier is exhausted are infeasible.
//!    Goals whose analysis ran out of time may be retried with a larger budget.
//!
//! Optionally, each goal also carries a *presence condition*: the set of product
//! configurations (a [`Region`][crate::region::Region] in a
//! [`FeatureBdd`][crate::bdd::FeatureBdd]) for which it is still open. Coverage then
//! becomes partial, and a goal is done once its remaining presence condition is empty.
//!
//! ## Basic Usage
//!
//! ```rust
//! use std::sync::Arc;
//!
//! use covgen_rs::cfa::Cfa;
//! use covgen_rs::driver::TestGenerator;
//! use covgen_rs::explorer::ExplorerFactory;
//! use covgen_rs::options::Options;
//!
//! // if (x > 0) { y = 1; } else { y = 2; }
//! let mut cfa = Cfa::new();
//! let n0 = cfa.add_function("main");
//! let n1 = cfa.add_node("main");
//! let n2 = cfa.add_node("main");
//! let n3 = cfa.add_node("main");
//! let n4 = cfa.add_node("main");
//! cfa.add_input(n0, n1, "x", 7);
//! cfa.add_assume(n1, n2, "x > 0", true);
//! cfa.add_assume(n1, n3, "x > 0", false);
//! cfa.add_edge(n2, n4, "y = 1;");
//! cfa.add_edge(n3, n4, "y = 2;");
//! let cfa = Arc::new(cfa);
//!
//! let factory = ExplorerFactory::new(cfa.clone(), None);
//! let mut generator = TestGenerator::for_criterion(Options::default(), cfa, None, factory).unwrap();
//! let report = generator.generate().unwrap();
//!
//! assert!(report.sound);
//! assert_eq!(report.statistics.goals, 5);
//! assert_eq!(report.statistics.feasible, 5);
//! ```
//!
//! ## Core Components
//!
//! - **[`driver`]**: the goal batch scheduler, [`TestGenerator`][crate::driver::TestGenerator].
//! - **[`automaton`]**: goal automata and three-valued acceptance.
//! - **[`arg`]** and **[`reached`]**: the abstract reachability graph and its frontier.
//! - **[`engine`]**: the analysis engine contract; [`explorer`] is a reference engine.
//! - **[`testsuite`]**: bookkeeping of goals, test cases and coverage.
//! - **[`bdd`]**: presence conditions.

pub mod arg;
pub mod automaton;
pub mod bdd;
pub mod bitset;
pub mod cfa;
pub mod dot;
pub mod driver;
pub mod engine;
pub mod error;
pub mod explorer;
pub mod goal;
pub mod options;
pub mod propagation;
pub mod reached;
pub mod region;
pub mod testcase;
pub mod testsuite;
pub mod timeout;
