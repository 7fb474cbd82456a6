//! Presence conditions as Binary Decision Diagrams.
//!
//! Variability-aware test generation tracks, for every goal and every test case,
//! the set of product configurations it applies to. Such sets are boolean
//! functions over *feature* variables, and [`FeatureBdd`] stores them as reduced
//! ordered BDDs.
//!
//! The manager owns all nodes; callers only ever hold lightweight [`Region`]
//! handles. Nodes are hash-consed, so every boolean function has exactly one
//! handle, and equality of handles is equality of functions.
//!
//! Feature variables are declared by name and are 1-indexed in declaration
//! order (index 0 is reserved for the terminals). Earlier declared features sit
//! closer to the root.
//!
//! # Examples
//!
//! ```
//! use covgen_rs::bdd::FeatureBdd;
//!
//! let bdd = FeatureBdd::new();
//! let a = bdd.declare("A");
//! let b = bdd.declare("B");
//!
//! let f = bdd.and(a, bdd.not(b));
//! assert!(!bdd.is_false(f));
//! assert_eq!(bdd.dump(f), "A & !B");
//! assert!(bdd.is_false(bdd.and(f, b)));
//! ```
//!
//! The manager is internally locked, so it can be shared (via `Arc`) between the
//! driver and an analysis running on a worker thread.

use std::collections::HashMap;
use std::fmt::{Debug, Formatter};
use std::sync::{Mutex, MutexGuard, PoisonError};

use log::debug;
use num_bigint::BigUint;

use crate::region::Region;

#[derive(Debug, Copy, Clone, Eq, PartialEq, Hash)]
struct Node {
    variable: u32,
    low: Region,
    high: Region,
}

struct Inner {
    nodes: Vec<Node>,
    unique: HashMap<Node, Region>,
    cache: HashMap<(Region, Region, Region), Region>,
    names: Vec<String>,
}

impl Inner {
    fn new() -> Self {
        // Terminals occupy the first two slots:
        let terminal = Node {
            variable: 0,
            low: Region::FALSE,
            high: Region::FALSE,
        };
        Self {
            nodes: vec![terminal, terminal],
            unique: HashMap::new(),
            cache: HashMap::new(),
            names: Vec::new(),
        }
    }

    fn node(&self, f: Region) -> Node {
        self.nodes[f.index()]
    }

    /// Variable of the node, with terminals below every variable.
    fn level(&self, f: Region) -> u32 {
        if f.is_terminal() {
            u32::MAX
        } else {
            self.node(f).variable
        }
    }

    fn cofactors(&self, f: Region, v: u32) -> (Region, Region) {
        if self.level(f) == v {
            let node = self.node(f);
            (node.low, node.high)
        } else {
            (f, f)
        }
    }

    fn mk_node(&mut self, variable: u32, low: Region, high: Region) -> Region {
        assert_ne!(variable, 0, "Variable index should not be zero");

        if low == high {
            return low;
        }

        let node = Node { variable, low, high };
        if let Some(&existing) = self.unique.get(&node) {
            return existing;
        }

        let index = u32::try_from(self.nodes.len()).expect("BDD storage is full");
        let region = Region::new(index);
        self.nodes.push(node);
        self.unique.insert(node, region);
        region
    }

    fn ite(&mut self, f: Region, g: Region, h: Region) -> Region {
        // Base cases:
        //   ite(1,G,H) => G
        //   ite(0,G,H) => H
        //   ite(F,G,G) => G
        //   ite(F,1,0) => F
        if f.is_true() {
            return g;
        }
        if f.is_false() {
            return h;
        }
        if g == h {
            return g;
        }
        if g.is_true() && h.is_false() {
            return f;
        }

        let key = (f, g, h);
        if let Some(&res) = self.cache.get(&key) {
            return res;
        }

        let v = self.level(f).min(self.level(g)).min(self.level(h));
        let (f0, f1) = self.cofactors(f, v);
        let (g0, g1) = self.cofactors(g, v);
        let (h0, h1) = self.cofactors(h, v);

        let high = self.ite(f1, g1, h1);
        let low = self.ite(f0, g0, h0);
        let res = self.mk_node(v, low, high);

        self.cache.insert(key, res);
        res
    }

    fn count(&self, f: Region, cache: &mut HashMap<Region, BigUint>) -> BigUint {
        // Number of satisfying assignments over the variables `level(f)..=n`.
        if f.is_false() {
            return BigUint::ZERO;
        }
        if f.is_true() {
            return BigUint::from(1u32);
        }
        if let Some(count) = cache.get(&f) {
            return count.clone();
        }

        let n = self.names.len() as u32;
        let depth = |r: Region| if r.is_terminal() { n + 1 } else { self.level(r) };

        let node = self.node(f);
        let low = self.count(node.low, cache) << (depth(node.low) - node.variable - 1);
        let high = self.count(node.high, cache) << (depth(node.high) - node.variable - 1);
        let count = low + high;

        cache.insert(f, count.clone());
        count
    }

    fn cubes(&self, f: Region) -> Vec<Vec<(u32, bool)>> {
        let mut result = Vec::new();
        let mut current = Vec::new();
        self.collect_cubes(f, &mut current, &mut result);
        result
    }

    fn collect_cubes(&self, f: Region, current: &mut Vec<(u32, bool)>, result: &mut Vec<Vec<(u32, bool)>>) {
        if f.is_false() {
            return;
        }
        if f.is_true() {
            result.push(current.clone());
            return;
        }
        let node = self.node(f);

        current.push((node.variable, true));
        self.collect_cubes(node.high, current, result);
        current.pop();

        current.push((node.variable, false));
        self.collect_cubes(node.low, current, result);
        current.pop();
    }
}

/// Thread-safe BDD manager for feature presence conditions.
pub struct FeatureBdd {
    inner: Mutex<Inner>,
}

impl FeatureBdd {
    pub fn new() -> Self {
        Self {
            inner: Mutex::new(Inner::new()),
        }
    }

    fn inner(&self) -> MutexGuard<'_, Inner> {
        self.inner.lock().unwrap_or_else(PoisonError::into_inner)
    }
}

impl Default for FeatureBdd {
    fn default() -> Self {
        Self::new()
    }
}

impl Debug for FeatureBdd {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        let inner = self.inner();
        f.debug_struct("FeatureBdd")
            .field("features", &inner.names.len())
            .field("nodes", &inner.nodes.len())
            .field("cache", &inner.cache.len())
            .finish()
    }
}

impl FeatureBdd {
    pub fn one(&self) -> Region {
        Region::TRUE
    }
    pub fn zero(&self) -> Region {
        Region::FALSE
    }

    /// Declare a feature variable, or return the existing one with this name.
    pub fn declare(&self, name: &str) -> Region {
        let mut inner = self.inner();
        let variable = match inner.names.iter().position(|n| n == name) {
            Some(i) => i as u32 + 1,
            None => {
                inner.names.push(name.to_string());
                let v = inner.names.len() as u32;
                debug!("declare(name = {}) -> x{}", name, v);
                v
            }
        };
        inner.mk_node(variable, Region::FALSE, Region::TRUE)
    }

    /// Return the region of a previously declared feature.
    pub fn var(&self, name: &str) -> Option<Region> {
        let mut inner = self.inner();
        let variable = inner.names.iter().position(|n| n == name)? as u32 + 1;
        Some(inner.mk_node(variable, Region::FALSE, Region::TRUE))
    }

    /// Names of the declared features, in variable order.
    pub fn features(&self) -> Vec<String> {
        self.inner().names.clone()
    }

    /// Number of allocated nodes (terminals included).
    pub fn size(&self) -> usize {
        self.inner().nodes.len()
    }

    /// Apply the ITE operation to the arguments.
    ///
    /// ```text
    /// ITE(f, g, h) = (f ∧ g) ∨ (¬f ∧ h)
    /// ```
    pub fn ite(&self, f: Region, g: Region, h: Region) -> Region {
        self.inner().ite(f, g, h)
    }

    pub fn not(&self, f: Region) -> Region {
        self.ite(f, Region::FALSE, Region::TRUE)
    }

    pub fn and(&self, f: Region, g: Region) -> Region {
        self.ite(f, g, Region::FALSE)
    }

    pub fn or(&self, f: Region, g: Region) -> Region {
        self.ite(f, Region::TRUE, g)
    }

    /// Configurations in `f` but not in `g`.
    pub fn diff(&self, f: Region, g: Region) -> Region {
        let mut inner = self.inner();
        let not_g = inner.ite(g, Region::FALSE, Region::TRUE);
        inner.ite(f, not_g, Region::FALSE)
    }

    /// Conjunction of many regions (`TRUE` for an empty iterator).
    pub fn and_all(&self, regions: impl IntoIterator<Item = Region>) -> Region {
        let mut inner = self.inner();
        regions
            .into_iter()
            .fold(Region::TRUE, |acc, r| inner.ite(acc, r, Region::FALSE))
    }

    /// Disjunction of many regions (`FALSE` for an empty iterator).
    pub fn or_all(&self, regions: impl IntoIterator<Item = Region>) -> Region {
        let mut inner = self.inner();
        regions
            .into_iter()
            .fold(Region::FALSE, |acc, r| inner.ite(acc, Region::TRUE, r))
    }

    /// Check whether every configuration of `f` is also in `g`.
    pub fn implies(&self, f: Region, g: Region) -> bool {
        self.is_false(self.diff(f, g))
    }

    pub fn is_false(&self, f: Region) -> bool {
        f.is_false()
    }

    pub fn is_true(&self, f: Region) -> bool {
        f.is_true()
    }

    /// Number of configurations (over all declared features) in the region.
    pub fn sat_count(&self, f: Region) -> BigUint {
        let inner = self.inner();
        let mut cache = HashMap::new();
        let count = inner.count(f, &mut cache);
        let top = if f.is_terminal() {
            inner.names.len() as u32 + 1
        } else {
            inner.level(f)
        };
        count << (top - 1)
    }

    /// Return one configuration of the region, if any, as `(feature, value)` pairs.
    ///
    /// Features not mentioned are unconstrained.
    pub fn one_sat(&self, f: Region) -> Option<Vec<(String, bool)>> {
        if f.is_false() {
            return None;
        }
        let inner = self.inner();
        let mut result = Vec::new();
        let mut current = f;
        while !current.is_true() {
            let node = inner.node(current);
            let name = inner.names[node.variable as usize - 1].clone();
            if !node.high.is_false() {
                result.push((name, true));
                current = node.high;
            } else {
                result.push((name, false));
                current = node.low;
            }
        }
        Some(result)
    }

    /// Render the region as a sum of cubes over feature names.
    ///
    /// Used only for diagnostics, the format is not meant to be parsed back.
    pub fn dump(&self, f: Region) -> String {
        if f.is_false() {
            return "FALSE".to_string();
        }
        if f.is_true() {
            return "TRUE".to_string();
        }
        let inner = self.inner();
        let cubes = inner.cubes(f);
        cubes
            .iter()
            .map(|cube| {
                cube.iter()
                    .map(|&(v, positive)| {
                        let name = &inner.names[v as usize - 1];
                        if positive {
                            name.clone()
                        } else {
                            format!("!{}", name)
                        }
                    })
                    .collect::<Vec<_>>()
                    .join(" & ")
            })
            .collect::<Vec<_>>()
            .join(" | ")
    }
}

#[cfg(test)]
mod tests {
    use test_log::test;

    use super::*;

    #[test]
    fn test_declare_is_idempotent() {
        let bdd = FeatureBdd::new();
        let a1 = bdd.declare("A");
        let a2 = bdd.declare("A");
        assert_eq!(a1, a2);
        assert_eq!(bdd.var("A"), Some(a1));
        assert_eq!(bdd.var("B"), None);
        assert_eq!(bdd.features(), vec!["A".to_string()]);
    }

    #[test]
    fn test_terminals() {
        let bdd = FeatureBdd::new();
        assert!(bdd.is_true(bdd.one()));
        assert!(bdd.is_false(bdd.zero()));
        assert_eq!(bdd.not(bdd.one()), bdd.zero());
        assert_eq!(bdd.dump(bdd.one()), "TRUE");
        assert_eq!(bdd.dump(bdd.zero()), "FALSE");
    }

    #[test]
    fn test_canonicity() {
        let bdd = FeatureBdd::new();
        let a = bdd.declare("A");
        let b = bdd.declare("B");

        let f = bdd.not(bdd.and(a, b));
        let g = bdd.or(bdd.not(a), bdd.not(b));
        assert_eq!(f, g);

        let h = bdd.or(bdd.and(a, b), bdd.and(a, bdd.not(b)));
        assert_eq!(h, a);
    }

    #[test]
    fn test_contradiction_and_tautology() {
        let bdd = FeatureBdd::new();
        let a = bdd.declare("A");
        assert!(bdd.is_false(bdd.and(a, bdd.not(a))));
        assert!(bdd.is_true(bdd.or(a, bdd.not(a))));
    }

    #[test]
    fn test_diff_and_implies() {
        let bdd = FeatureBdd::new();
        let a = bdd.declare("A");
        let b = bdd.declare("B");
        let ab = bdd.and(a, b);

        assert!(bdd.implies(ab, a));
        assert!(!bdd.implies(a, ab));
        assert_eq!(bdd.diff(a, b), bdd.and(a, bdd.not(b)));
        assert!(bdd.is_false(bdd.and(bdd.diff(a, ab), ab)));
    }

    #[test]
    fn test_and_or_all() {
        let bdd = FeatureBdd::new();
        let a = bdd.declare("A");
        let b = bdd.declare("B");
        let c = bdd.declare("C");

        assert_eq!(bdd.and_all([a, b, c]), bdd.and(bdd.and(a, b), c));
        assert_eq!(bdd.or_all([a, b]), bdd.or(a, b));
        assert_eq!(bdd.and_all([]), bdd.one());
        assert_eq!(bdd.or_all([]), bdd.zero());
    }

    #[test]
    fn test_sat_count() {
        let bdd = FeatureBdd::new();
        let a = bdd.declare("A");
        let b = bdd.declare("B");
        let c = bdd.declare("C");

        assert_eq!(bdd.sat_count(bdd.one()), BigUint::from(8u32));
        assert_eq!(bdd.sat_count(bdd.zero()), BigUint::from(0u32));
        assert_eq!(bdd.sat_count(a), BigUint::from(4u32));
        assert_eq!(bdd.sat_count(c), BigUint::from(4u32));
        assert_eq!(bdd.sat_count(bdd.and(a, c)), BigUint::from(2u32));
        assert_eq!(bdd.sat_count(bdd.or(b, c)), BigUint::from(6u32));
    }

    #[test]
    fn test_one_sat() {
        let bdd = FeatureBdd::new();
        let a = bdd.declare("A");
        let b = bdd.declare("B");
        let f = bdd.and(bdd.not(a), b);

        let model = bdd.one_sat(f).unwrap();
        assert_eq!(model, vec![("A".to_string(), false), ("B".to_string(), true)]);
        assert_eq!(bdd.one_sat(bdd.zero()), None);
        assert_eq!(bdd.one_sat(bdd.one()), Some(vec![]));
    }

    #[test]
    fn test_dump() {
        let bdd = FeatureBdd::new();
        let a = bdd.declare("A");
        let b = bdd.declare("B");

        assert_eq!(bdd.dump(a), "A");
        assert_eq!(bdd.dump(bdd.not(a)), "!A");
        assert_eq!(bdd.dump(bdd.or(a, b)), "A | !A & B");
    }
}
