//! Collapses connected regions of pointwise operators into opaque expression nodes.

use crate::core::op::{Fusion, FusionKind, Op};
use crate::error::Result;
use crate::graph::{FragmentBoundary, GraphView, Node};
use crate::matches::matcher::{MatchEnv, Matcher};
use crate::node_id::NodeId;
use crate::quantization::qrec::{QRec, QuantizationTable};
use crate::quantization::qtype::{QScheme, QType};
use std::collections::BTreeSet;

pub fn is_fusible(node: &Node) -> bool {
    node.op.capabilities().can_fuse_to_expression
}

fn fusible_or_constant(graph: &GraphView, name: &str) -> bool {
    graph.node(name).is_some_and(|n| is_fusible(n) || n.op.is_constant())
}

/// True if some ancestor of `start` is in `set`.
fn can_find_up(graph: &GraphView, start: &str, set: &BTreeSet<String>) -> bool {
    let mut visited = BTreeSet::new();
    let mut stack = vec![start.to_string()];
    while let Some(name) = stack.pop() {
        for pred in graph.predecessors(&name) {
            if set.contains(&pred) {
                return true;
            }
            if visited.insert(pred.clone()) {
                stack.push(pred);
            }
        }
    }
    false
}

fn explore(graph: &GraphView, name: &str, set: &mut BTreeSet<String>) {
    for edge in graph.out_edges(name) {
        let succ = edge.to;
        if set.contains(&succ) || !graph.node(&succ).is_some_and(is_fusible) {
            continue;
        }
        // an input produced downstream of the set would make the region non-convex
        let blocked = graph.predecessors(&succ).iter().any(|p| !set.contains(p) && can_find_up(graph, p, set));
        if blocked {
            continue;
        }
        set.insert(succ.clone());
        explore(graph, &succ, set);
    }
}

fn merge(sets: Vec<BTreeSet<String>>) -> Vec<BTreeSet<String>> {
    let mut merged: Vec<BTreeSet<String>> = Vec::new();
    for set in sets {
        let (touching, mut rest): (Vec<_>, Vec<_>) = merged.into_iter().partition(|m| !m.is_disjoint(&set));
        let mut union = set;
        for other in touching {
            union.extend(other);
        }
        rest.push(union);
        merged = rest;
    }
    merged
}

/// Whether `name` may stay in `members`.
fn should_fuse(graph: &GraphView, name: &str, members: &BTreeSet<String>, table: Option<&QuantizationTable>) -> bool {
    let Some(node) = graph.node(name) else { return false };
    match node.op {
        Op::MatAdd | Op::MatSub | Op::MatMul | Op::MatDiv => table
            .and_then(|t| t.get_node(name))
            .is_none_or(|q| q.in_qs.iter().all(|q| q.dtype.bits() == 8)),
        Op::Activation { .. } => {
            graph.predecessors(name).iter().any(|p| members.contains(p))
                || graph.out_edges(name).iter().any(|e| members.contains(&e.to))
        }
        _ => false,
    }
}

/// Removes members one at a time, lowest name first, until every member may stay.
fn peel(graph: &GraphView, members: &mut BTreeSet<String>, table: Option<&QuantizationTable>) {
    loop {
        let failing = members
            .iter()
            .find(|name| !should_fuse(graph, name, members, table))
            .cloned()
            .or_else(|| graph.reentries(members).into_iter().next());
        match failing {
            Some(name) => {
                tracing::debug!(node = %name, "peeled from expression");
                members.remove(&name);
            }
            None => break,
        }
    }
}

/// Pulls in single-element constants consumed only inside the region.
fn add_constants(graph: &GraphView, members: &mut BTreeSet<String>) {
    let mut found = Vec::new();
    for name in members.iter() {
        for edge in graph.in_edges(name) {
            let scalar = graph.node(&edge.from).is_some_and(|n| matches!(&n.op, Op::Constant { value } if value.shape.size() == 1));
            if scalar && graph.out_edges(&edge.from).iter().all(|e| members.contains(&e.to)) {
                found.push(edge.from);
            }
        }
    }
    members.extend(found);
}

/// Regions to fuse, each sorted by name, in order of their sorted name lists.
///
/// `candidates` lists the fusible nodes; the result does not depend on their order.
pub fn find_sets(graph: &GraphView, candidates: &[String], table: Option<&QuantizationTable>) -> Vec<Vec<String>> {
    let seeds = candidates
        .iter()
        .filter(|name| graph.in_edges(name).iter().any(|e| !fusible_or_constant(graph, &e.from)));
    let explored = seeds
        .map(|seed| {
            let mut set = BTreeSet::from([seed.clone()]);
            explore(graph, seed, &mut set);
            set
        })
        .collect();
    let mut regions: Vec<Vec<String>> = merge(explored)
        .into_iter()
        .filter_map(|mut members| {
            peel(graph, &mut members, table);
            if members.is_empty() {
                return None;
            }
            add_constants(graph, &mut members);
            Some(members.into_iter().collect())
        })
        .collect();
    regions.sort();
    regions
}

/// Boundary formats of the region, recorded as bounds of the expression's variables.
fn expression_record(table: &QuantizationTable, boundary: &FragmentBoundary) -> Option<QRec> {
    let in_qs = boundary
        .inputs
        .iter()
        .map(|(_, inlets)| {
            let inlet = inlets.first()?;
            table.get_node(&inlet.node)?.in_qs.get(inlet.idx).cloned()
        })
        .collect::<Option<Vec<QType>>>()?;
    let out_qs = boundary
        .outputs
        .iter()
        .map(|(outlet, _)| table.get_node(&outlet.node)?.out_qs.get(outlet.idx).cloned())
        .collect::<Option<Vec<QType>>>()?;
    let mut qrec = QRec::new(QScheme::Scaled, in_qs, out_qs);
    for (i, q) in qrec.in_qs.iter().enumerate() {
        qrec.expression.insert(format!("input_{i}"), q.range());
    }
    for (j, q) in qrec.out_qs.iter().enumerate() {
        qrec.expression.insert(format!("output_{j}"), q.range());
    }
    Some(qrec)
}

pub struct ExpressionMatcher;

impl ExpressionMatcher {
    fn fuse(&self, env: &mut MatchEnv<'_>, members: &[String]) -> Result<String> {
        let graph = &mut *env.graph;
        let subset: BTreeSet<String> = members.iter().cloned().collect();
        let boundary = graph.fragment_boundary(&subset);
        let subgraph = graph.build_fragment(&subset, &boundary)?;
        let mut n = 0;
        while graph.contains(&format!("expr_{n}")) {
            n += 1;
        }
        let name = format!("expr_{n}");
        let out_shapes = boundary.outputs.iter().map(|(outlet, _)| graph.out_shape(outlet)).collect();
        let fusion =
            Fusion { kind: FusionKind::Expression, subgraph, inputs: boundary.inputs.len(), outputs: boundary.outputs.len() };
        let qrec = env.table.as_deref().and_then(|t| expression_record(t, &boundary));
        graph.replace_fragment(members, Node::new(&name, Op::Fusion(Box::new(fusion)), out_shapes), &boundary.mapping())?;

        let quantizes: Vec<String> = graph
            .out_edges(&name)
            .into_iter()
            .map(|e| e.to)
            .filter(|to| graph.node(to).is_some_and(|n| matches!(n.op, Op::Quantize { .. })))
            .collect();
        for quantize in &quantizes {
            graph.remove_and_reconnect(quantize)?;
        }
        if let Some(table) = env.table.as_deref_mut() {
            for member in members {
                table.move_to_fusion(member, &name);
            }
            for quantize in &quantizes {
                table.remove_node(quantize);
            }
            if let Some(qrec) = qrec {
                table.insert(NodeId::new(&name), qrec);
            }
        }
        tracing::info!(expression = %name, members = ?members, "fused expression");
        Ok(name)
    }
}

impl Matcher for ExpressionMatcher {
    fn name(&self) -> &str {
        "expression_matcher"
    }

    fn description(&self) -> &str {
        "fuse connected pointwise operators into expressions"
    }

    fn apply(&self, env: &mut MatchEnv<'_>) -> Result<bool> {
        let candidates: Vec<String> = env
            .graph
            .execution_order()?
            .into_iter()
            .filter(|name| env.graph.node(name).is_some_and(is_fusible))
            .collect();
        let regions = find_sets(env.graph, &candidates, env.table.as_deref());
        let mut fused = Vec::with_capacity(regions.len());
        for members in &regions {
            fused.push(self.fuse(env, members)?);
        }
        if fused.is_empty() {
            return Ok(false);
        }
        env.requantize(&fused)?;
        Ok(true)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::core::op::ActivationKind;
    use crate::core::types::{Shape, Tensor};
    use crate::graph::Edge;

    fn s() -> Vec<Shape> {
        vec![Shape::new([4])]
    }

    /// `in0 + in1 -> * 2 -> relu -> out`
    fn add_mul_relu() -> GraphView {
        let mut g = GraphView::new();
        g.add_node(Node::new("in0", Op::Input { index: 0 }, s())).unwrap();
        g.add_node(Node::new("in1", Op::Input { index: 1 }, s())).unwrap();
        g.add_node(Node::new("two", Op::Constant { value: Tensor::scalar(2.0) }, vec![Shape::scalar()])).unwrap();
        g.add_node(Node::new("add", Op::MatAdd, s())).unwrap();
        g.add_node(Node::new("mul", Op::MatMul, s())).unwrap();
        g.add_node(Node::new("relu", Op::Activation { kind: ActivationKind::Relu }, s())).unwrap();
        g.add_node(Node::new("out", Op::Output { index: 0 }, vec![])).unwrap();
        for edge in [
            Edge::new("in0", 0, "add", 0),
            Edge::new("in1", 0, "add", 1),
            Edge::new("add", 0, "mul", 0),
            Edge::new("two", 0, "mul", 1),
            Edge::new("mul", 0, "relu", 0),
            Edge::new("relu", 0, "out", 0),
        ] {
            g.add_edge(edge).unwrap();
        }
        g
    }

    #[test]
    fn linear_chain_collapses_into_one_expression() {
        let mut g = add_mul_relu();
        assert!(ExpressionMatcher.apply(&mut MatchEnv::new(&mut g)).unwrap());
        let fused: Vec<_> = g.nodes().filter(|n| n.op.fusion().is_some()).map(|n| n.name.clone()).collect();
        assert_eq!(fused, vec!["expr_0".to_string()]);
        let ins: Vec<_> = g.in_edges("expr_0").into_iter().map(|e| e.from).collect();
        assert_eq!(ins, vec!["in0", "in1"]);
        assert_eq!(g.out_edges("expr_0"), vec![Edge::new("expr_0", 0, "out", 0)]);
        assert!(!g.contains("two"));
        g.verify().unwrap();
    }

    #[test]
    fn input_produced_downstream_is_not_absorbed() {
        let mut g = GraphView::new();
        g.add_node(Node::new("in0", Op::Input { index: 0 }, s())).unwrap();
        g.add_node(Node::new("in1", Op::Input { index: 1 }, s())).unwrap();
        g.add_node(Node::new("add", Op::MatAdd, s())).unwrap();
        g.add_node(Node::new("view", Op::Reshape { shape: Shape::new([4]) }, s())).unwrap();
        g.add_node(Node::new("mul", Op::MatMul, s())).unwrap();
        g.add_edge(Edge::new("in0", 0, "add", 0)).unwrap();
        g.add_edge(Edge::new("in1", 0, "add", 1)).unwrap();
        g.add_edge(Edge::new("add", 0, "view", 0)).unwrap();
        g.add_edge(Edge::new("add", 0, "mul", 0)).unwrap();
        g.add_edge(Edge::new("view", 0, "mul", 1)).unwrap();
        let candidates = vec!["add".to_string(), "mul".to_string()];
        assert_eq!(find_sets(&g, &candidates, None), vec![vec!["add".to_string()], vec!["mul".to_string()]]);
    }

    #[test]
    fn lone_elementwise_op_becomes_an_expression() {
        let mut g = GraphView::new();
        g.add_node(Node::new("in0", Op::Input { index: 0 }, s())).unwrap();
        g.add_node(Node::new("in1", Op::Input { index: 1 }, s())).unwrap();
        g.add_node(Node::new("add", Op::MatAdd, s())).unwrap();
        g.add_node(Node::new("out", Op::Output { index: 0 }, vec![])).unwrap();
        g.add_edge(Edge::new("in0", 0, "add", 0)).unwrap();
        g.add_edge(Edge::new("in1", 0, "add", 1)).unwrap();
        g.add_edge(Edge::new("add", 0, "out", 0)).unwrap();
        assert_eq!(find_sets(&g, &["add".to_string()], None), vec![vec!["add".to_string()]]);

        assert!(ExpressionMatcher.apply(&mut MatchEnv::new(&mut g)).unwrap());
        assert!(!g.contains("add"));
        let ins: Vec<_> = g.in_edges("expr_0").into_iter().map(|e| e.from).collect();
        assert_eq!(ins, vec!["in0", "in1"]);
        assert_eq!(g.out_edges("expr_0"), vec![Edge::new("expr_0", 0, "out", 0)]);
        assert!(!ExpressionMatcher.apply(&mut MatchEnv::new(&mut g)).unwrap());
    }

    #[test]
    fn lone_activation_is_peeled() {
        let mut g = GraphView::new();
        g.add_node(Node::new("in", Op::Input { index: 0 }, s())).unwrap();
        g.add_node(Node::new("relu", Op::Activation { kind: ActivationKind::Relu }, s())).unwrap();
        g.add_edge(Edge::new("in", 0, "relu", 0)).unwrap();
        assert!(find_sets(&g, &["relu".to_string()], None).is_empty());
    }

    #[test]
    fn wide_inputs_block_fusion() {
        use crate::core::types::DType;
        let g = add_mul_relu();
        let q8 = QType::scaled(DType::Int8, -1.0, 1.0, false);
        let q16 = QType::scaled(DType::Int16, -1.0, 1.0, false);
        let mut table = QuantizationTable::new();
        table.insert(NodeId::new("add"), QRec::new(QScheme::Scaled, vec![q16.clone(), q16], vec![q8.clone()]));
        let candidates: Vec<String> = ["add", "mul", "relu"].iter().map(|s| s.to_string()).collect();
        let sets = find_sets(&g, &candidates, Some(&table));
        assert_eq!(sets, vec![vec!["mul".to_string(), "relu".to_string(), "two".to_string()]]);
    }
}
