use std::fmt::{Display, Formatter};
use std::time::Duration;

use num_bigint::BigInt;

use crate::arg::ArgNodeId;
use crate::cfa::EdgeId;
use crate::region::Region;

/// A concrete test: input values and the execution they drive.
///
/// Created once per feasible counterexample. Only the two reporting counters
/// change afterwards.
#[derive(Debug, Clone)]
pub struct TestCase {
    id: usize,
    inputs: Vec<BigInt>,
    path: Vec<ArgNodeId>,
    trace: Vec<EdgeId>,
    region: Option<Region>,
    presence: Vec<Option<Region>>,
    generation_time: Duration,
    newly_covered: usize,
    newly_partially_covered: usize,
}

impl TestCase {
    pub fn new(
        id: usize,
        inputs: Vec<BigInt>,
        path: Vec<ArgNodeId>,
        trace: Vec<EdgeId>,
        region: Option<Region>,
        generation_time: Duration,
    ) -> Self {
        Self {
            id,
            inputs,
            path,
            trace,
            region,
            presence: Vec::new(),
            generation_time,
            newly_covered: 0,
            newly_partially_covered: 0,
        }
    }

    /// Attach the presence condition of every state along the path.
    pub fn with_presence(mut self, presence: Vec<Option<Region>>) -> Self {
        self.presence = presence;
        self
    }

    pub fn id(&self) -> usize {
        self.id
    }

    pub fn inputs(&self) -> &[BigInt] {
        &self.inputs
    }

    /// ARG nodes along the realizing path.
    pub fn path(&self) -> &[ArgNodeId] {
        &self.path
    }

    /// Control-flow edges along the realizing path.
    pub fn trace(&self) -> &[EdgeId] {
        &self.trace
    }

    pub fn region(&self) -> Option<Region> {
        self.region
    }

    /// Presence condition of the state reached after `steps` edges of the trace.
    pub fn presence_after(&self, steps: usize) -> Option<Region> {
        self.presence.get(steps).copied().flatten()
    }

    /// Time since generation started when this test case was materialized.
    pub fn generation_time(&self) -> Duration {
        self.generation_time
    }

    pub fn newly_covered(&self) -> usize {
        self.newly_covered
    }

    pub fn newly_partially_covered(&self) -> usize {
        self.newly_partially_covered
    }

    pub(crate) fn count_covered(&mut self) {
        self.newly_covered += 1;
    }

    pub(crate) fn count_partially_covered(&mut self) {
        self.newly_partially_covered += 1;
    }

    pub(crate) fn reset_counts(&mut self) {
        self.newly_covered = 0;
        self.newly_partially_covered = 0;
    }
}

impl Display for TestCase {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        let inputs = self.inputs.iter().map(|v| v.to_string()).collect::<Vec<_>>();
        write!(f, "TestCase {} [{}]", self.id, inputs.join(", "))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_display_and_counters() {
        let mut tc = TestCase::new(
            3,
            vec![BigInt::from(-1), BigInt::from(7)],
            vec![],
            vec![],
            None,
            Duration::from_millis(5),
        );
        assert_eq!(tc.to_string(), "TestCase 3 [-1, 7]");
        tc.count_covered();
        tc.count_covered();
        tc.count_partially_covered();
        assert_eq!(tc.newly_covered(), 2);
        assert_eq!(tc.newly_partially_covered(), 1);
        assert_eq!(tc.presence_after(0), None);
    }

    #[test]
    fn test_presence_along_path() {
        let tc = TestCase::new(1, vec![], vec![], vec![], None, Duration::ZERO)
            .with_presence(vec![Some(Region::TRUE), None, Some(Region::FALSE)]);
        assert_eq!(tc.presence_after(0), Some(Region::TRUE));
        assert_eq!(tc.presence_after(1), None);
        assert_eq!(tc.presence_after(2), Some(Region::FALSE));
        assert_eq!(tc.presence_after(3), None);
    }
}
