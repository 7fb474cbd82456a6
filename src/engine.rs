//! Analysis engine contract.
//!
//! The driver does not compute abstract states itself. It composes the goal
//! observers of a batch into an [`AnalysisEngine`] via an [`EngineFactory`],
//! and then runs the engine against a [`ReachedSet`], repeatedly, until the
//! batch is resolved or the frontier is exhausted.
//!
//! An engine must:
//!
//! - resume exploration from the frontier of the reached set it is given;
//! - stop at a target state and report a counterexample for it, if it can;
//! - poll the [`CancelToken`] at its own suspension points and return
//!   promptly once it is cancelled;
//! - honour goals disabled in the reached set, and the shared presence
//!   condition constraint.

use std::collections::{BTreeMap, BTreeSet};
use std::fmt::{Display, Formatter};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use num_bigint::BigInt;

use crate::arg::{AbstractState, ArgNodeId, ArgPath};
use crate::automaton::Observer;
use crate::error::Result;
use crate::reached::ReachedSet;
use crate::region::Region;

/// Name prefix of model entries holding nondeterministic input values.
pub const INPUT_PREFIX: &str = "__VERIFIER_nondet::__retval__";

/// Verdict of one engine run.
#[derive(Debug, Copy, Clone, Eq, PartialEq)]
pub enum Soundness {
    Sound,
    Unsound,
}

impl Soundness {
    pub fn is_sound(self) -> bool {
        self == Soundness::Sound
    }
}

impl Display for Soundness {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        match self {
            Soundness::Sound => write!(f, "sound"),
            Soundness::Unsound => write!(f, "unsound"),
        }
    }
}

/// Cooperative cancellation signal shared between the driver and a worker.
#[derive(Debug, Clone, Default)]
pub struct CancelToken(Arc<AtomicBool>);

impl CancelToken {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn cancel(&self) {
        self.0.store(true, Ordering::SeqCst);
    }

    pub fn is_cancelled(&self) -> bool {
        self.0.load(Ordering::SeqCst)
    }
}

/// Assignment of model variables to values.
pub type Model = BTreeMap<String, BigInt>;

/// Input values of a model: entries named with [`INPUT_PREFIX`], ordered by
/// the sequence number after `@`.
pub fn input_values(model: &Model) -> Vec<BigInt> {
    let mut inputs: Vec<(u64, &BigInt)> = model
        .iter()
        .filter(|(name, _)| name.starts_with(INPUT_PREFIX))
        .filter_map(|(name, value)| {
            let (_, seq) = name.rsplit_once('@')?;
            Some((seq.parse().ok()?, value))
        })
        .collect();
    inputs.sort_by_key(|&(seq, _)| seq);
    inputs.into_iter().map(|(_, v)| v.clone()).collect()
}

#[derive(Debug, Clone)]
pub struct CounterexampleInfo {
    pub target: ArgNodeId,
    pub path: ArgPath,
    pub model: Model,
    pub spurious: bool,
}

/// A composed analysis, runnable against a reached set.
pub trait AnalysisEngine: Send {
    type State: AbstractState;
    type Precision: Clone + Send;

    /// Root state for a fresh reached set.
    fn initial_state(&self) -> Self::State;

    /// Current precision, for reuse by the next composed engine.
    fn precision(&self) -> Self::Precision;

    /// Explore from the frontier of `reached` until a target is found, the
    /// frontier is empty, or `cancel` fires.
    fn run(&mut self, reached: &mut ReachedSet<Self::State>, cancel: &CancelToken) -> Result<Soundness>;

    /// Counterexamples produced by the latest run, keyed by target node.
    fn counterexamples(&self) -> &BTreeMap<ArgNodeId, CounterexampleInfo>;

    /// Stop observing `goals` on the remaining frontier.
    fn disable_goals(&mut self, reached: &mut ReachedSet<Self::State>, goals: &BTreeSet<usize>) {
        reached.disable_goals(goals.iter().copied());
    }

    /// Restrict exploration to configurations in `constraint`, and acceptance
    /// of each goal to the configurations still open for it.
    fn restrict_presence_condition(
        &mut self,
        reached: &mut ReachedSet<Self::State>,
        constraint: Region,
        open: &BTreeMap<usize, Region>,
    );
}

/// Builds engines for batches of goals.
pub trait EngineFactory {
    type Engine: AnalysisEngine;

    /// Compose the observers with the program analysis.
    ///
    /// `constraint` is the initial presence condition constraint (variability
    /// mode only). `precision` is the precision of the previous engine, when
    /// reused.
    fn compose(
        &mut self,
        observers: Vec<Observer>,
        constraint: Option<Region>,
        precision: Option<<Self::Engine as AnalysisEngine>::Precision>,
    ) -> Result<Self::Engine>;
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_input_values_sorted_by_sequence() {
        let mut model = Model::new();
        model.insert(format!("{}@10", INPUT_PREFIX), BigInt::from(3));
        model.insert(format!("{}@2", INPUT_PREFIX), BigInt::from(-5));
        model.insert("x@2".to_string(), BigInt::from(99));
        model.insert(format!("{}@7", INPUT_PREFIX), BigInt::from(0));
        assert_eq!(
            input_values(&model),
            vec![BigInt::from(-5), BigInt::from(0), BigInt::from(3)]
        );
    }

    #[test]
    fn test_cancel_token_is_shared() {
        let token = CancelToken::new();
        let other = token.clone();
        assert!(!other.is_cancelled());
        token.cancel();
        assert!(other.is_cancelled());
    }
}
