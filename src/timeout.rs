//! Bounded, cancellable engine runs.
//!
//! With a time limit the engine runs on a scoped worker thread. The calling
//! thread waits on a channel for at most the limit; on expiry it raises the
//! [`CancelToken`] and joins the worker, which is expected to notice the
//! token and return promptly. The reached set is only lent to the worker for
//! the duration of the scope.

use std::fmt::{Display, Formatter};
use std::sync::mpsc::{self, RecvTimeoutError};
use std::thread;
use std::time::Duration;

use log::{debug, warn};

use crate::engine::{AnalysisEngine, CancelToken, Soundness};
use crate::reached::ReachedSet;

/// Classified result of one bounded run.
#[derive(Debug, Copy, Clone, Eq, PartialEq)]
pub enum RunOutcome {
    Sound,
    Unsound,
    TimedOut,
}

impl Display for RunOutcome {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        match self {
            RunOutcome::Sound => write!(f, "SOUND"),
            RunOutcome::Unsound => write!(f, "UNSOUND"),
            RunOutcome::TimedOut => write!(f, "TIMED_OUT"),
        }
    }
}

impl From<Soundness> for RunOutcome {
    fn from(soundness: Soundness) -> Self {
        match soundness {
            Soundness::Sound => RunOutcome::Sound,
            Soundness::Unsound => RunOutcome::Unsound,
        }
    }
}

/// Run `engine` on `reached`, within `limit` if one is given.
///
/// The limit is measured in wall-clock time, so time the worker spends
/// descheduled counts against it.
///
/// Engine errors and worker panics are logged and classified as `Unsound`.
/// Otherwise, if the cancellation fired, the outcome is `TimedOut` whatever
/// verdict the engine returned.
pub fn run_bounded<E: AnalysisEngine>(
    engine: &mut E,
    reached: &mut ReachedSet<E::State>,
    limit: Option<Duration>,
) -> RunOutcome {
    let token = CancelToken::new();

    let Some(limit) = limit else {
        return match engine.run(reached, &token) {
            Ok(soundness) => soundness.into(),
            Err(e) => {
                warn!("Analysis failed: {}", e);
                RunOutcome::Unsound
            }
        };
    };

    let joined = thread::scope(|s| {
        let (tx, rx) = mpsc::channel();
        let worker_token = token.clone();
        let worker = s.spawn(move || {
            let result = engine.run(reached, &worker_token);
            // The receiver may have given up already.
            let _ = tx.send(());
            result
        });

        match rx.recv_timeout(limit) {
            Ok(()) | Err(RecvTimeoutError::Disconnected) => {}
            Err(RecvTimeoutError::Timeout) => {
                debug!("Time limit of {:?} exceeded, cancelling analysis", limit);
                token.cancel();
            }
        }
        worker.join()
    });

    match joined {
        Err(_) => {
            warn!("Analysis worker panicked");
            RunOutcome::Unsound
        }
        Ok(Err(e)) => {
            warn!("Analysis failed: {}", e);
            RunOutcome::Unsound
        }
        Ok(Ok(_)) if token.is_cancelled() => RunOutcome::TimedOut,
        Ok(Ok(soundness)) => soundness.into(),
    }
}

#[cfg(test)]
mod tests {
    use std::collections::{BTreeMap, BTreeSet};
    use std::time::Instant;

    use test_log::test;

    use super::*;
    use crate::arg::{AbstractState, ArgNodeId};
    use crate::cfa::{Cfa, CfaNode};
    use crate::engine::CounterexampleInfo;
    use crate::error::{Error, Result};
    use crate::region::Region;

    #[derive(Debug, Clone)]
    struct Dummy(CfaNode);

    impl AbstractState for Dummy {
        fn location(&self) -> CfaNode {
            self.0
        }
    }

    enum Behaviour {
        Finish(Soundness),
        SpinUntilCancelled,
        Fail,
        Panic,
    }

    struct Scripted {
        behaviour: Behaviour,
        location: CfaNode,
        cexs: BTreeMap<ArgNodeId, CounterexampleInfo>,
    }

    impl Scripted {
        fn new(behaviour: Behaviour) -> Self {
            let mut cfa = Cfa::new();
            Self {
                behaviour,
                location: cfa.add_function("main"),
                cexs: BTreeMap::new(),
            }
        }
    }

    impl AnalysisEngine for Scripted {
        type State = Dummy;
        type Precision = ();

        fn initial_state(&self) -> Dummy {
            Dummy(self.location)
        }

        fn precision(&self) -> Self::Precision {}

        fn run(&mut self, _reached: &mut ReachedSet<Dummy>, cancel: &CancelToken) -> Result<Soundness> {
            match self.behaviour {
                Behaviour::Finish(s) => Ok(s),
                Behaviour::SpinUntilCancelled => {
                    while !cancel.is_cancelled() {
                        thread::sleep(Duration::from_millis(1));
                    }
                    Ok(Soundness::Sound)
                }
                Behaviour::Fail => Err(Error::Engine("boom".to_string())),
                Behaviour::Panic => panic!("engine bug"),
            }
        }

        fn counterexamples(&self) -> &BTreeMap<ArgNodeId, CounterexampleInfo> {
            &self.cexs
        }

        fn disable_goals(&mut self, _reached: &mut ReachedSet<Dummy>, _goals: &BTreeSet<usize>) {}

        fn restrict_presence_condition(
            &mut self,
            _reached: &mut ReachedSet<Dummy>,
            _constraint: Region,
            _open: &BTreeMap<usize, Region>,
        ) {
        }
    }

    fn run(behaviour: Behaviour, limit: Option<Duration>) -> RunOutcome {
        let mut engine = Scripted::new(behaviour);
        let mut reached = ReachedSet::new(engine.initial_state());
        run_bounded(&mut engine, &mut reached, limit)
    }

    #[test]
    fn test_unbounded() {
        assert_eq!(run(Behaviour::Finish(Soundness::Sound), None), RunOutcome::Sound);
        assert_eq!(run(Behaviour::Finish(Soundness::Unsound), None), RunOutcome::Unsound);
        assert_eq!(run(Behaviour::Fail, None), RunOutcome::Unsound);
    }

    #[test]
    fn test_bounded_finishes_in_time() {
        let limit = Some(Duration::from_secs(10));
        assert_eq!(run(Behaviour::Finish(Soundness::Sound), limit), RunOutcome::Sound);
        assert_eq!(run(Behaviour::Finish(Soundness::Unsound), limit), RunOutcome::Unsound);
    }

    #[test]
    fn test_bounded_times_out() {
        let start = Instant::now();
        let outcome = run(Behaviour::SpinUntilCancelled, Some(Duration::from_millis(20)));
        assert_eq!(outcome, RunOutcome::TimedOut);
        assert!(start.elapsed() >= Duration::from_millis(20));
    }

    #[test]
    fn test_worker_failure_is_unsound() {
        let limit = Some(Duration::from_secs(10));
        assert_eq!(run(Behaviour::Fail, limit), RunOutcome::Unsound);
        assert_eq!(run(Behaviour::Panic, limit), RunOutcome::Unsound);
    }
}
