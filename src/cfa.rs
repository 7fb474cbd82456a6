//! Control-flow automaton.
//!
//! The program under test is given as a graph of locations ([`CfaNode`]) and
//! operations ([`CfaEdge`]). Building it from source text is out of scope; the
//! [`Cfa`] type only offers a small builder API, which is enough for goal
//! extraction, the reference explorer and infeasibility propagation.
//!
//! Two edge annotations matter to test generation:
//!
//! - an *input* edge reads one nondeterministic value; the annotated value is
//!   the witness the explorer reports for it in its counterexample models;
//! - a *presence condition* restricts the edge to the product configurations
//!   in the given [`Region`].

use std::collections::{BTreeMap, BTreeSet};
use std::fmt::{Display, Formatter};

use num_bigint::BigInt;

use crate::region::Region;

#[derive(Debug, Copy, Clone, Eq, PartialEq, Ord, PartialOrd, Hash)]
pub struct CfaNode(u32);

impl CfaNode {
    pub const fn index(self) -> usize {
        self.0 as usize
    }
}

impl Display for CfaNode {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        write!(f, "N{}", self.0)
    }
}

#[derive(Debug, Copy, Clone, Eq, PartialEq, Ord, PartialOrd, Hash)]
pub struct EdgeId(u32);

impl EdgeId {
    pub const fn index(self) -> usize {
        self.0 as usize
    }
}

impl Display for EdgeId {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        write!(f, "e{}", self.0)
    }
}

#[derive(Debug, Clone, Eq, PartialEq)]
pub enum EdgeKind {
    /// Plain statement (or no-op).
    Statement,
    /// One branch of a condition.
    Assume { truth: bool },
    /// Reads a nondeterministic input value.
    Input { value: BigInt },
}

#[derive(Debug, Clone)]
pub struct CfaEdge {
    pub id: EdgeId,
    pub predecessor: CfaNode,
    pub successor: CfaNode,
    pub label: String,
    pub kind: EdgeKind,
    pub presence: Option<Region>,
}

impl Display for CfaEdge {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        write!(f, "{} -{{{}}}-> {}", self.predecessor, self.label, self.successor)
    }
}

#[derive(Debug, Clone, Default)]
struct NodeInfo {
    function: String,
    leaving: Vec<EdgeId>,
    entering: Vec<EdgeId>,
}

#[derive(Debug, Clone, Default)]
pub struct Cfa {
    nodes: Vec<NodeInfo>,
    edges: Vec<CfaEdge>,
    functions: BTreeMap<String, CfaNode>,
}

impl Cfa {
    pub fn new() -> Self {
        Self::default()
    }

    /// Add a function and return its entry location.
    ///
    /// The first function added is the program entry.
    pub fn add_function(&mut self, name: &str) -> CfaNode {
        let entry = self.add_node(name);
        self.functions.insert(name.to_string(), entry);
        entry
    }

    pub fn add_node(&mut self, function: &str) -> CfaNode {
        let node = CfaNode(self.nodes.len() as u32);
        self.nodes.push(NodeInfo {
            function: function.to_string(),
            ..Default::default()
        });
        node
    }

    fn push_edge(&mut self, from: CfaNode, to: CfaNode, label: &str, kind: EdgeKind) -> EdgeId {
        assert!(from.index() < self.nodes.len(), "Unknown location {}", from);
        assert!(to.index() < self.nodes.len(), "Unknown location {}", to);

        let id = EdgeId(self.edges.len() as u32);
        self.edges.push(CfaEdge {
            id,
            predecessor: from,
            successor: to,
            label: label.to_string(),
            kind,
            presence: None,
        });
        self.nodes[from.index()].leaving.push(id);
        self.nodes[to.index()].entering.push(id);
        id
    }

    pub fn add_edge(&mut self, from: CfaNode, to: CfaNode, label: &str) -> EdgeId {
        self.push_edge(from, to, label, EdgeKind::Statement)
    }

    pub fn add_assume(&mut self, from: CfaNode, to: CfaNode, condition: &str, truth: bool) -> EdgeId {
        let label = if truth {
            format!("[{}]", condition)
        } else {
            format!("[!({})]", condition)
        };
        self.push_edge(from, to, &label, EdgeKind::Assume { truth })
    }

    pub fn add_input(&mut self, from: CfaNode, to: CfaNode, variable: &str, value: impl Into<BigInt>) -> EdgeId {
        let label = format!("{} = __VERIFIER_nondet();", variable);
        self.push_edge(from, to, &label, EdgeKind::Input { value: value.into() })
    }

    /// Restrict the edge to the configurations in `presence`.
    pub fn set_presence(&mut self, edge: EdgeId, presence: Region) {
        self.edges[edge.index()].presence = Some(presence);
    }

    /// The program entry location.
    pub fn entry(&self) -> CfaNode {
        assert!(!self.nodes.is_empty(), "CFA is empty");
        CfaNode(0)
    }

    pub fn function_entry(&self, name: &str) -> Option<CfaNode> {
        self.functions.get(name).copied()
    }

    pub fn function_of(&self, node: CfaNode) -> &str {
        &self.nodes[node.index()].function
    }

    pub fn edge(&self, id: EdgeId) -> &CfaEdge {
        &self.edges[id.index()]
    }

    pub fn edges(&self) -> impl Iterator<Item = &CfaEdge> {
        self.edges.iter()
    }

    pub fn nodes(&self) -> impl Iterator<Item = CfaNode> {
        (0..self.nodes.len() as u32).map(CfaNode)
    }

    pub fn num_nodes(&self) -> usize {
        self.nodes.len()
    }

    pub fn num_edges(&self) -> usize {
        self.edges.len()
    }

    pub fn leaving(&self, node: CfaNode) -> &[EdgeId] {
        &self.nodes[node.index()].leaving
    }

    pub fn entering(&self, node: CfaNode) -> &[EdgeId] {
        &self.nodes[node.index()].entering
    }

    /// Location with more than one outgoing edge.
    pub fn is_branching(&self, node: CfaNode) -> bool {
        self.leaving(node).len() > 1
    }

    /// Location where control flow merges (loop heads included).
    pub fn is_join(&self, node: CfaNode) -> bool {
        self.entering(node).len() > 1
    }

    /// The edge leading from `from` to `to`, if any.
    pub fn edge_between(&self, from: CfaNode, to: CfaNode) -> Option<EdgeId> {
        self.leaving(from)
            .iter()
            .copied()
            .find(|&e| self.edge(e).successor == to)
    }

    /// Depth-first search from `start` that never traverses `avoid`.
    ///
    /// Returns the subset of `targets` that were traversed.
    pub fn reachable_edges(&self, start: CfaNode, avoid: EdgeId, targets: &BTreeSet<EdgeId>) -> BTreeSet<EdgeId> {
        let mut found = BTreeSet::new();
        let mut visited = vec![false; self.nodes.len()];
        let mut stack = vec![start];

        while let Some(node) = stack.pop() {
            if std::mem::replace(&mut visited[node.index()], true) {
                continue;
            }
            for &e in self.leaving(node) {
                if e == avoid {
                    continue;
                }
                if targets.contains(&e) {
                    found.insert(e);
                    if found.len() == targets.len() {
                        return found;
                    }
                }
                stack.push(self.edge(e).successor);
            }
        }

        found
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    /// ```text
    /// N0 -[c]-> N1 -> N3
    ///  \-[!c]-> N2 -> N3
    /// ```
    fn diamond() -> (Cfa, Vec<EdgeId>) {
        let mut cfa = Cfa::new();
        let n0 = cfa.add_function("main");
        let n1 = cfa.add_node("main");
        let n2 = cfa.add_node("main");
        let n3 = cfa.add_node("main");
        let e0 = cfa.add_assume(n0, n1, "c", true);
        let e1 = cfa.add_assume(n0, n2, "c", false);
        let e2 = cfa.add_edge(n1, n3, "x = 1;");
        let e3 = cfa.add_edge(n2, n3, "x = 2;");
        (cfa, vec![e0, e1, e2, e3])
    }

    #[test]
    fn test_structure() {
        let (cfa, e) = diamond();
        let n0 = cfa.entry();
        assert_eq!(cfa.num_nodes(), 4);
        assert_eq!(cfa.num_edges(), 4);
        assert!(cfa.is_branching(n0));
        assert!(cfa.is_join(cfa.edge(e[2]).successor));
        assert_eq!(cfa.leaving(n0), &[e[0], e[1]]);
        assert_eq!(cfa.edge_between(n0, cfa.edge(e[1]).successor), Some(e[1]));
        assert_eq!(cfa.function_of(n0), "main");
        assert_eq!(cfa.function_entry("main"), Some(n0));
        assert_eq!(cfa.edge(e[0]).label, "[c]");
        assert_eq!(cfa.edge(e[1]).label, "[!(c)]");
    }

    #[test]
    fn test_reachable_edges_avoiding() {
        let (cfa, e) = diamond();
        let targets: BTreeSet<_> = [e[2], e[3]].into_iter().collect();

        let found = cfa.reachable_edges(cfa.entry(), e[0], &targets);
        assert_eq!(found, BTreeSet::from([e[3]]));

        let found = cfa.reachable_edges(cfa.entry(), e[2], &targets);
        assert_eq!(found, BTreeSet::from([e[3]]));
    }

    #[test]
    fn test_input_edge() {
        let mut cfa = Cfa::new();
        let n0 = cfa.add_function("main");
        let n1 = cfa.add_node("main");
        let e = cfa.add_input(n0, n1, "x", 42);
        assert_eq!(cfa.edge(e).kind, EdgeKind::Input { value: BigInt::from(42) });
        assert_eq!(cfa.edge(e).to_string(), "N0 -{x = __VERIFIER_nondet();}-> N1");
    }
}
