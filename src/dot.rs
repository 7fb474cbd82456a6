//! Goal automata and ARGs to DOT (Graphviz) conversion.
//!
//! # DOT Format
//!
//! Automata:
//! - **States** are circles, **final states** double circles
//! - The **initial state** is marked by an arrow from a point
//! - **Transitions** are labelled with their edge set and guards
//!
//! ARGs:
//! - **Nodes** show their id, program location, presence condition and accepted goals
//! - **Target nodes** are filled, **covered nodes** dashed, **bottom nodes** grey
//! - **Tree edges** are labelled with the control-flow edge they follow
//! - **Covering** is drawn as a dotted edge from the covered node to its coverer
//!
//! # Examples
//!
//! ```
//! use covgen_rs::automaton::Automaton;
//! use covgen_rs::cfa::Cfa;
//!
//! let mut cfa = Cfa::new();
//! let n0 = cfa.add_function("main");
//! let n1 = cfa.add_node("main");
//! let e = cfa.add_edge(n0, n1, "return 0;");
//!
//! let dot = Automaton::reaching("G1", e).to_dot().unwrap();
//! assert!(dot.starts_with("digraph"));
//! // Render with: dot -Tpng automaton.dot -o automaton.png
//! ```

use std::fmt::Write as _;

use crate::arg::{AbstractState, Arg};
use crate::automaton::Automaton;
use crate::cfa::Cfa;

/// Visual options for DOT output.
#[derive(Debug, Clone)]
pub struct DotConfig {
    /// Shape of automaton states and ARG nodes (default: "circle")
    pub node_shape: &'static str,
    /// Shape of final automaton states (default: "doublecircle")
    pub final_shape: &'static str,
    /// Fill colour of target ARG nodes (default: "tomato")
    pub target_color: &'static str,
    /// Label ARG edges with the statement instead of the edge id (default: true)
    pub statement_labels: bool,
}

impl Default for DotConfig {
    fn default() -> Self {
        Self {
            node_shape: "circle",
            final_shape: "doublecircle",
            target_color: "tomato",
            statement_labels: true,
        }
    }
}

fn escape(s: &str) -> String {
    s.replace('\\', "\\\\").replace('"', "\\\"")
}

impl Automaton {
    pub fn to_dot(&self) -> Result<String, std::fmt::Error> {
        self.to_dot_with_config(&DotConfig::default())
    }

    pub fn to_dot_with_config(&self, config: &DotConfig) -> Result<String, std::fmt::Error> {
        let mut dot = String::new();
        writeln!(dot, "digraph \"{}\" {{", escape(self.name()))?;
        writeln!(dot, "rankdir=LR;")?;
        writeln!(dot, "node [shape={}];", config.node_shape)?;

        writeln!(dot, "init [shape=point];")?;
        for q in self.states() {
            if self.is_final(q) {
                writeln!(dot, "q{} [shape={}];", q, config.final_shape)?;
            } else {
                writeln!(dot, "q{};", q)?;
            }
        }
        writeln!(dot, "init -> q{};", self.initial())?;

        for t in self.transitions() {
            writeln!(dot, "q{} -> q{} [label=\"{}\"];", t.source, t.target, escape(&t.label.to_string()))?;
        }

        writeln!(dot, "}}")?;
        Ok(dot)
    }
}

impl<S: AbstractState> Arg<S> {
    pub fn to_dot(&self, cfa: &Cfa) -> Result<String, std::fmt::Error> {
        self.to_dot_with_config(cfa, &DotConfig::default())
    }

    pub fn to_dot_with_config(&self, cfa: &Cfa, config: &DotConfig) -> Result<String, std::fmt::Error> {
        let mut dot = String::new();
        writeln!(dot, "digraph ARG {{")?;
        writeln!(dot, "node [shape={}];", config.node_shape)?;

        for id in self.ids() {
            let state = self.state(id);
            let mut label = format!("{} @ {}", id, state.location());
            if let Some(pc) = state.presence_condition() {
                write!(label, "\\npc: {}", pc)?;
            }
            let goals = state.accepted_goals();
            if !goals.is_empty() {
                let names: Vec<String> = goals.iter().map(|g| format!("G{}", g)).collect();
                write!(label, "\\naccepts: {}", names.join(", "))?;
            }

            let mut attrs = vec![format!("label=\"{}\"", label)];
            if state.is_target() {
                attrs.push(format!("style=filled, fillcolor={}", config.target_color));
            } else if self.is_covered(id) {
                attrs.push("style=dashed".to_string());
            } else if self.is_bottom(id) {
                attrs.push("color=grey".to_string());
            }
            writeln!(dot, "{} [{}];", id.index(), attrs.join(", "))?;
        }

        for id in self.ids() {
            for &child in self.children(id) {
                match self.edge_label(id, child) {
                    Some(e) if config.statement_labels => writeln!(
                        dot,
                        "{} -> {} [label=\"{}\"];",
                        id.index(),
                        child.index(),
                        escape(&cfa.edge(e).label)
                    )?,
                    Some(e) => writeln!(dot, "{} -> {} [label=\"{}\"];", id.index(), child.index(), e)?,
                    None => writeln!(dot, "{} -> {};", id.index(), child.index())?,
                }
            }
            if let Some(by) = self.covered_by(id) {
                writeln!(dot, "{} -> {} [style=dotted, constraint=false];", id.index(), by.index())?;
            }
        }

        writeln!(dot, "}}")?;
        Ok(dot)
    }
}
