use crate::config::QuantizationConfig;
use crate::error::{Error, Result};
use crate::graph::{Edge, GraphView, Node};
use crate::node_id::NodeId;
use crate::quantization::handlers::{HandlerRegistry, Options, QuantizeRequest};
use crate::quantization::qrec::{QRec, QuantizationTable};
use crate::quantization::qtype::QType;
use crate::quantization::stats::{Range, StatsTable};
use std::collections::{BTreeSet, HashMap};

/// How many times a single node may be resolved before the run is declared unsettled.
const MAX_VISITS: usize = 8;

/// Assigns a quantization record to every node of a graph.
///
/// Resolution runs forward in execution order. When a handler needs an input
/// in another format, the producer is re-resolved backwards with that format
/// forced on its output, and consumers of any changed output are revisited.
pub struct Quantizer<'a> {
    registry: &'a HandlerRegistry,
    stats: &'a StatsTable,
    config: &'a QuantizationConfig,
}

impl<'a> Quantizer<'a> {
    pub fn new(registry: &'a HandlerRegistry, stats: &'a StatsTable, config: &'a QuantizationConfig) -> Self {
        Self { registry, stats, config }
    }

    pub fn quantize(&self, graph: &GraphView) -> Result<QuantizationTable> {
        self.requantize(graph, QuantizationTable::new(), None)
    }

    /// Re-resolves only `start_nodes` and nodes without a record, plus whatever
    /// their changes reach. `None` resolves every node.
    pub fn requantize(
        &self,
        graph: &GraphView,
        table: QuantizationTable,
        start_nodes: Option<&[String]>,
    ) -> Result<QuantizationTable> {
        let order = graph.execution_order()?;
        let position: HashMap<String, usize> = order.iter().enumerate().map(|(i, n)| (n.clone(), i)).collect();
        let mut res = Resolution { q: self, graph, position, table, pending: BTreeSet::new() };
        for (pos, name) in order.iter().enumerate() {
            let executable = graph.node(name).is_some_and(|n| n.op.capabilities().executable);
            let seeded = match start_nodes {
                None => true,
                Some(start) => start.contains(name) || !res.table.contains_node(name),
            };
            if executable && seeded {
                res.pending.insert((pos, name.clone()));
            }
        }
        tracing::debug!(nodes = res.pending.len(), restricted = start_nodes.is_some(), "resolving quantization");
        res.run(order.len())?;
        Ok(res.table)
    }
}

struct Resolution<'q, 'a> {
    q: &'q Quantizer<'a>,
    graph: &'q GraphView,
    position: HashMap<String, usize>,
    table: QuantizationTable,
    pending: BTreeSet<(usize, String)>,
}

impl Resolution<'_, '_> {
    fn run(&mut self, nodes: usize) -> Result<()> {
        let budget = (nodes + 1) * MAX_VISITS;
        let mut steps = 0;
        while let Some((_, name)) = self.pending.pop_first() {
            steps += 1;
            if steps > budget {
                return Err(Error::InvariantViolation(format!("quantization did not settle, still revisiting {name}")));
            }
            self.forward(&name)?;
        }
        Ok(())
    }

    fn node(&self, name: &str) -> Result<&Node> {
        self.graph.node(name).ok_or_else(|| Error::UnknownNode(name.to_string()))
    }

    fn input_formats(&self, name: &str, in_edges: &[Option<Edge>]) -> Result<Vec<QType>> {
        in_edges
            .iter()
            .enumerate()
            .map(|(idx, edge)| {
                let edge = edge
                    .as_ref()
                    .ok_or_else(|| Error::InvariantViolation(format!("input {idx} of {name} is not connected")))?;
                self.table
                    .get_node(&edge.from)
                    .and_then(|r| r.out_qs.get(edge.from_idx))
                    .cloned()
                    .ok_or_else(|| Error::InvariantViolation(format!("{} is not quantized before {name}", edge.from)))
            })
            .collect()
    }

    /// Forced output formats: configured overrides first, then forced formats already on record.
    fn forced_outputs(&self, node: &Node) -> Vec<Option<QType>> {
        let config = self.q.config;
        let existing = self.table.get_node(&node.name);
        (0..node.op.out_arity())
            .map(|idx| {
                if idx == 0 {
                    if let Some(f) = config.forced_outputs.get(&node.name) {
                        let range = Range::new(f.min, f.max);
                        return Some(QType::from_range(config.scheme, f.dtype, range, f.asymmetric).forced());
                    }
                }
                existing.and_then(|r| r.out_qs.get(idx)).filter(|q| q.forced).cloned()
            })
            .collect()
    }

    fn forward(&mut self, name: &str) -> Result<()> {
        let node = self.node(name)?;
        let in_edges = self.graph.indexed_in_edges(name);
        let in_qs = self.input_formats(name, &in_edges)?;
        let force_out = self.forced_outputs(node);
        let qrec = self.resolve(node, &in_qs, &force_out, false)?;
        self.push_inputs_back(name, &in_edges, &in_qs, &qrec)?;
        self.commit(name, qrec, None);
        Ok(())
    }

    fn backward(&mut self, name: &str, out_idx: usize, q: QType, requester: &str) -> Result<()> {
        let node = self.node(name)?;
        let current = self
            .table
            .get_node(name)
            .and_then(|r| r.out_qs.get(out_idx))
            .cloned()
            .ok_or_else(|| Error::InvariantViolation(format!("{requester} pushed a format back to unquantized {name}")))?;
        if current == q {
            self.mark_forced(name, out_idx);
            return Ok(());
        }
        if current.forced {
            return Err(Error::InvariantViolation(format!(
                "{requester} needs output {out_idx} of {name} in a format other than its forced one"
            )));
        }
        tracing::debug!(node = name, requester, out_idx, "propagating format backwards");
        let mut force_out = self.forced_outputs(node);
        force_out[out_idx] = Some(q.forced());
        let in_edges = self.graph.indexed_in_edges(name);
        let in_qs = self.input_formats(name, &in_edges)?;
        let qrec = self.resolve(node, &in_qs, &force_out, true)?;
        self.push_inputs_back(name, &in_edges, &in_qs, &qrec)?;
        self.commit(name, qrec, Some(requester));
        Ok(())
    }

    fn push_inputs_back(&mut self, name: &str, in_edges: &[Option<Edge>], in_qs: &[QType], qrec: &QRec) -> Result<()> {
        for (idx, edge) in in_edges.iter().enumerate() {
            let Some(edge) = edge else { continue };
            if qrec.in_qs[idx] != in_qs[idx] {
                self.backward(&edge.from, edge.from_idx, qrec.in_qs[idx].clone(), name)?;
            }
        }
        Ok(())
    }

    fn mark_forced(&mut self, name: &str, out_idx: usize) {
        if let Some(mut qrec) = self.table.get_node(name).cloned() {
            if let Some(q) = qrec.out_qs.get_mut(out_idx) {
                q.forced = true;
            }
            self.table.insert(NodeId::new(name), qrec);
        }
    }

    fn commit(&mut self, name: &str, qrec: QRec, requester: Option<&str>) {
        for edge in self.graph.out_edges(name) {
            if Some(edge.to.as_str()) == requester {
                continue;
            }
            let stale = self
                .table
                .get_node(&edge.to)
                .and_then(|r| r.in_qs.get(edge.to_idx))
                .is_some_and(|q| Some(q) != qrec.out_qs.get(edge.from_idx));
            if stale {
                if let Some(&pos) = self.position.get(&edge.to) {
                    self.pending.insert((pos, edge.to.clone()));
                }
            }
        }
        self.table.insert(NodeId::new(name), qrec);
    }

    fn resolve(&self, node: &Node, in_qs: &[QType], force_out: &[Option<QType>], backwards: bool) -> Result<QRec> {
        let config = self.q.config;
        let stats = self.q.stats.for_node(node);
        let existing = self.table.get_node(&node.name);
        let options = Options { node: config.node_options.get(&node.name), global: &config.options };
        for (spec, handler) in self.q.registry.candidates(&node.op, config.scheme, in_qs, force_out) {
            let req = QuantizeRequest {
                node,
                in_qs,
                force_out,
                stats: stats.as_ref(),
                existing,
                backwards,
                default_dtype: config.default_dtype,
                options,
            };
            match handler.quantize(&req)? {
                Some(mut qrec) => {
                    check_record(node, &mut qrec, force_out, spec.name)?;
                    if qrec.calibration.is_none() {
                        qrec.calibration = stats.clone();
                    }
                    tracing::debug!(node = %node.name, handler = spec.name, backwards, "quantized");
                    return Ok(qrec);
                }
                None => tracing::debug!(node = %node.name, handler = spec.name, "handler rejected"),
            }
        }
        Err(Error::QuantizationRejected { node: node.name.clone() })
    }
}

/// Arity must match the node and every forced output must be honored.
fn check_record(node: &Node, qrec: &mut QRec, force_out: &[Option<QType>], handler: &str) -> Result<()> {
    if qrec.in_qs.len() != node.op.in_arity() || qrec.out_qs.len() != node.op.out_arity() {
        return Err(Error::InvariantViolation(format!(
            "handler {handler} produced {}/{} formats for {} with arity {}/{}",
            qrec.in_qs.len(),
            qrec.out_qs.len(),
            node.name,
            node.op.in_arity(),
            node.op.out_arity()
        )));
    }
    for (idx, forced) in force_out.iter().enumerate() {
        let Some(forced) = forced else { continue };
        if qrec.out_qs[idx] != *forced {
            return Err(Error::InvariantViolation(format!(
                "handler {handler} ignored the forced format of output {idx} of {}",
                node.name
            )));
        }
        qrec.out_qs[idx].forced = true;
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::ForcedFormat;
    use crate::core::op::{LinearParams, Op};
    use crate::core::types::{DType, Shape, Tensor};
    use crate::quantization::stats::NodeStats;

    fn stats(entries: &[(&str, f64, f64)]) -> StatsTable {
        let mut table = StatsTable::new();
        for (name, min, max) in entries {
            table.insert(NodeId::new(name), NodeStats { range_out: vec![Range::new(*min, *max)], ..Default::default() });
        }
        table
    }

    fn concat_graph() -> GraphView {
        let mut g = GraphView::new();
        let s = || vec![Shape::new([4])];
        g.add_node(Node::new("a", Op::Input { index: 0 }, s())).unwrap();
        g.add_node(Node::new("b", Op::Input { index: 1 }, s())).unwrap();
        g.add_node(Node::new("cat", Op::Concat { axis: 0, inputs: 2 }, vec![Shape::new([8])])).unwrap();
        g.add_node(Node::new("out", Op::Output { index: 0 }, vec![])).unwrap();
        g.add_edge(Edge::new("a", 0, "cat", 0)).unwrap();
        g.add_edge(Edge::new("b", 0, "cat", 1)).unwrap();
        g.add_edge(Edge::new("cat", 0, "out", 0)).unwrap();
        g
    }

    #[test]
    fn concat_forces_a_common_format_back_onto_producers() {
        let g = concat_graph();
        let stats = stats(&[("a", 0.0, 1.0), ("b", 0.0, 2.0)]);
        let config = QuantizationConfig::default();
        let reg = HandlerRegistry::standard();
        let table = Quantizer::new(&reg, &stats, &config).quantize(&g).unwrap();
        let a = &table.get_node("a").unwrap().out_qs[0];
        let b = &table.get_node("b").unwrap().out_qs[0];
        assert_eq!(a, b);
        assert_eq!(a.max, 2.0);
        assert!(a.forced);
        table.verify(&g).unwrap();
    }

    #[test]
    fn forced_input_wins_reconciliation() {
        let g = concat_graph();
        let stats = stats(&[("a", 0.0, 1.0), ("b", 0.0, 2.0)]);
        let mut config = QuantizationConfig::default();
        config.forced_outputs.insert("a".into(), ForcedFormat { dtype: DType::Int8, min: 0.0, max: 1.0, asymmetric: false });
        let reg = HandlerRegistry::standard();
        let table = Quantizer::new(&reg, &stats, &config).quantize(&g).unwrap();
        let cat = table.get_node("cat").unwrap();
        assert_eq!(cat.out_qs[0].max, 1.0);
        assert_eq!(table.get_node("b").unwrap().out_qs[0].max, 1.0);
    }

    #[test]
    fn missing_statistics_are_reported() {
        let g = concat_graph();
        let config = QuantizationConfig::default();
        let reg = HandlerRegistry::standard();
        let err = Quantizer::new(&reg, &StatsTable::new(), &config).quantize(&g).unwrap_err();
        assert!(matches!(err, Error::MissingStatistics { .. }));
    }

    #[test]
    fn filter_bias_is_widened_to_int32() {
        let mut g = GraphView::new();
        let op = Op::Linear(LinearParams { in_features: 2, out_features: 2, batch_size: 1, batch_minor: false });
        g.add_node(Node::new("in", Op::Input { index: 0 }, vec![Shape::new([2])])).unwrap();
        let w = Tensor::new(Shape::new([2, 2]), vec![0.5, -0.25, 1.0, 0.75]);
        g.add_node(Node::new("w", Op::Constant { value: w }, vec![Shape::new([2, 2])])).unwrap();
        g.add_node(Node::new("bias", Op::Constant { value: Tensor::new(Shape::new([2]), vec![0.1, -0.1]) }, vec![Shape::new([2])]))
            .unwrap();
        g.add_node(Node::new("fc", op, vec![Shape::new([2])])).unwrap();
        g.add_edge(Edge::new("in", 0, "fc", 0)).unwrap();
        g.add_edge(Edge::new("w", 0, "fc", 1)).unwrap();
        g.add_edge(Edge::new("bias", 0, "fc", 2)).unwrap();
        let stats = stats(&[("in", -1.0, 1.0), ("fc", -2.0, 2.0)]);
        let config = QuantizationConfig::default();
        let reg = HandlerRegistry::standard();
        let table = Quantizer::new(&reg, &stats, &config).quantize(&g).unwrap();
        let fc = table.get_node("fc").unwrap();
        assert_eq!(fc.in_qs[2].dtype, DType::Int32);
        assert_eq!(table.get_node("bias").unwrap().out_qs[0], fc.in_qs[2]);
        let expected = fc.in_qs[0].scale_factor() * fc.in_qs[1].scale_factor();
        assert!((fc.in_qs[2].scale_factor() - expected).abs() < 1e-15);
    }

    #[test]
    fn restricted_run_only_touches_start_nodes() {
        let g = concat_graph();
        let stats = stats(&[("a", 0.0, 1.0), ("b", 0.0, 1.0)]);
        let config = QuantizationConfig::default();
        let reg = HandlerRegistry::standard();
        let quantizer = Quantizer::new(&reg, &stats, &config);
        let mut table = quantizer.quantize(&g).unwrap();
        table.remove(&NodeId::new("out"));
        let table = quantizer.requantize(&g, table, Some(&[])).unwrap();
        assert!(table.contains_node("out"));
        table.verify(&g).unwrap();
    }
}
