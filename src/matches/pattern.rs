//! Declarative sub-pattern matching.

use crate::error::Result;
use crate::graph::{GraphView, Node};
use crate::matches::matcher::{MatchEnv, Matcher};
use std::collections::BTreeSet;

pub struct PatternNode {
    pub label: &'static str,
    pub test: fn(&Node) -> bool,
}

/// `None` indices match any slot.
#[derive(Debug, Clone, Copy)]
pub struct PatternEdge {
    pub from: usize,
    pub from_idx: Option<usize>,
    pub to: usize,
    pub to_idx: Option<usize>,
}

impl PatternEdge {
    pub fn new(from: usize, to: usize) -> Self {
        Self { from, from_idx: Some(0), to, to_idx: Some(0) }
    }
}

/// A small connected graph of predicates. Node 0 anchors the search and
/// every later node must be linked by an edge to an earlier one.
#[derive(Default)]
pub struct Pattern {
    pub nodes: Vec<PatternNode>,
    pub edges: Vec<PatternEdge>,
}

impl Pattern {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn node(mut self, label: &'static str, test: fn(&Node) -> bool) -> Self {
        self.nodes.push(PatternNode { label, test });
        self
    }

    pub fn edge(mut self, edge: PatternEdge) -> Self {
        self.edges.push(edge);
        self
    }

    /// Every non-overlapping embedding, anchors taken in execution order.
    pub fn find(&self, graph: &GraphView) -> Result<Vec<Embedding>> {
        let mut used = BTreeSet::new();
        let mut found = Vec::new();
        let Some(anchor) = self.nodes.first() else { return Ok(found) };
        for name in graph.execution_order()? {
            if used.contains(&name) || !graph.node(&name).is_some_and(|n| (anchor.test)(n)) {
                continue;
            }
            let mut assigned = vec![name];
            if !self.extend(graph, &mut assigned) {
                continue;
            }
            if assigned.iter().any(|n| used.contains(n)) {
                tracing::debug!(anchor = %assigned[0], "skipping overlapping embedding");
                continue;
            }
            used.extend(assigned.iter().cloned());
            found.push(Embedding { labels: self.nodes.iter().map(|n| n.label).collect(), nodes: assigned });
        }
        Ok(found)
    }

    fn extend(&self, graph: &GraphView, assigned: &mut Vec<String>) -> bool {
        let k = assigned.len();
        if k == self.nodes.len() {
            return self.edges_hold(graph, assigned) && self.exclusive(graph, assigned);
        }
        for candidate in self.candidates(graph, assigned, k) {
            if assigned.contains(&candidate) || !graph.node(&candidate).is_some_and(|n| (self.nodes[k].test)(n)) {
                continue;
            }
            assigned.push(candidate);
            if self.extend(graph, assigned) {
                return true;
            }
            assigned.pop();
        }
        false
    }

    /// Host nodes linked to an already assigned node the way pattern node `k` is.
    fn candidates(&self, graph: &GraphView, assigned: &[String], k: usize) -> Vec<String> {
        for edge in &self.edges {
            if edge.to == k && edge.from < k {
                return graph
                    .out_edges(&assigned[edge.from])
                    .into_iter()
                    .filter(|e| slot_matches(edge.from_idx, e.from_idx) && slot_matches(edge.to_idx, e.to_idx))
                    .map(|e| e.to)
                    .collect();
            }
            if edge.from == k && edge.to < k {
                return graph
                    .in_edges(&assigned[edge.to])
                    .into_iter()
                    .filter(|e| slot_matches(edge.from_idx, e.from_idx) && slot_matches(edge.to_idx, e.to_idx))
                    .map(|e| e.from)
                    .collect();
            }
        }
        Vec::new()
    }

    fn edges_hold(&self, graph: &GraphView, assigned: &[String]) -> bool {
        self.edges.iter().all(|p| {
            graph.out_edges(&assigned[p.from]).iter().any(|e| {
                e.to == assigned[p.to] && slot_matches(p.from_idx, e.from_idx) && slot_matches(p.to_idx, e.to_idx)
            })
        })
    }

    /// Outputs of pattern nodes that feed other pattern nodes must not also escape the embedding.
    fn exclusive(&self, graph: &GraphView, assigned: &[String]) -> bool {
        self.edges.iter().all(|p| graph.out_edges(&assigned[p.from]).iter().all(|e| assigned.contains(&e.to)))
    }
}

fn slot_matches(want: Option<usize>, got: usize) -> bool {
    want.is_none_or(|w| w == got)
}

/// Host node names assigned to each pattern node, in pattern order.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Embedding {
    labels: Vec<&'static str>,
    pub nodes: Vec<String>,
}

impl Embedding {
    pub fn get(&self, label: &str) -> Option<&str> {
        self.labels.iter().position(|l| *l == label).map(|i| self.nodes[i].as_str())
    }
}

/// A rewrite described by a pattern and a replacement for each embedding.
pub trait FragmentMatcher {
    fn name(&self) -> &str;
    fn description(&self) -> &str;
    fn pattern(&self) -> Pattern;

    /// Rewrites one embedding, returning whether the graph changed.
    fn replace(&self, env: &mut MatchEnv<'_>, embedding: &Embedding) -> Result<bool>;
}

/// Runs a [`FragmentMatcher`] over every embedding found in one search.
pub struct Declarative<F>(pub F);

impl<F: FragmentMatcher> Matcher for Declarative<F> {
    fn name(&self) -> &str {
        self.0.name()
    }

    fn description(&self) -> &str {
        self.0.description()
    }

    fn apply(&self, env: &mut MatchEnv<'_>) -> Result<bool> {
        let embeddings = self.0.pattern().find(env.graph)?;
        let mut changed = false;
        for embedding in &embeddings {
            if embedding.nodes.iter().all(|n| env.graph.contains(n)) {
                changed |= self.0.replace(env, embedding)?;
            }
        }
        Ok(changed)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::core::op::{ActivationKind, Op};
    use crate::core::types::Shape;
    use crate::graph::Edge;

    fn is_relu(node: &Node) -> bool {
        matches!(node.op, Op::Activation { kind: ActivationKind::Relu })
    }

    fn relu_chain(len: usize) -> GraphView {
        let mut g = GraphView::new();
        g.add_node(Node::new("in", Op::Input { index: 0 }, vec![Shape::new([4])])).unwrap();
        let mut prev = "in".to_string();
        for i in 0..len {
            let name = format!("r{i}");
            g.add_node(Node::new(&name, Op::Activation { kind: ActivationKind::Relu }, vec![Shape::new([4])])).unwrap();
            g.add_edge(Edge::new(&prev, 0, &name, 0)).unwrap();
            prev = name;
        }
        g
    }

    fn pair() -> Pattern {
        Pattern::new().node("first", is_relu).node("second", is_relu).edge(PatternEdge::new(0, 1))
    }

    #[test]
    fn embeddings_do_not_overlap() {
        let g = relu_chain(3);
        let found = pair().find(&g).unwrap();
        assert_eq!(found.len(), 1);
        assert_eq!(found[0].get("first"), Some("r0"));
        assert_eq!(found[0].get("second"), Some("r1"));
    }

    #[test]
    fn escaping_internal_output_blocks_the_match() {
        let mut g = relu_chain(2);
        g.add_node(Node::new("out", Op::Output { index: 0 }, vec![])).unwrap();
        g.add_edge(Edge::new("r0", 0, "out", 0)).unwrap();
        assert!(pair().find(&g).unwrap().is_empty());
    }
}
