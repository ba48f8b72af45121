//! Cross-layer range equalization.
//!
//! Rescales the output channels of one filter and the matching input
//! channels of the next so both layers use their fixed-point range evenly.
//! Scaling passes through a ReLU unchanged, so the network computes the same
//! function afterwards.

use crate::core::op::{ActivationKind, Op};
use crate::core::types::Tensor;
use crate::error::{Error, Result};
use crate::graph::GraphView;
use crate::quantization::stats::StatsTable;
use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, BTreeSet};

pub const MAX_CYCLES: usize = 50;

/// Order in which the pairs of a group are rescaled within one cycle.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum PairOrder {
    #[default]
    Reverse,
    Forward,
}

/// A filter and the activation absorbed with it.
#[derive(Debug, Clone, PartialEq)]
pub struct Neuron {
    pub name: String,
    pub weights: String,
    pub bias: Option<String>,
    /// Node whose output feeds the next layer.
    tail: String,
    /// The activation, if any, commutes with positive channel scaling.
    passes: bool,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize)]
pub struct EqualizationReport {
    pub groups: usize,
    pub pairs: usize,
    pub cycles: Vec<usize>,
    /// Largest `|s - 1|` applied to any channel.
    pub max_scale_deviation: f64,
}

fn sole_consumer(graph: &GraphView, name: &str) -> bool {
    graph.out_edges(name).len() == 1
}

fn neuron(graph: &GraphView, name: &str) -> Option<Neuron> {
    let node = graph.node(name)?;
    let caps = node.op.capabilities();
    if !caps.is_filter || !caps.can_equalize {
        return None;
    }
    let (weights, w) = graph.constant_input(name, 1)?;
    if w.shape.rank() < 2 || !sole_consumer(graph, weights) {
        return None;
    }
    let bias = match graph.constant_input(name, 2) {
        Some((bias, _)) if sole_consumer(graph, bias) => Some(bias.to_string()),
        Some(_) => return None,
        None => None,
    };
    let (tail, passes) = match node.op.fusion() {
        Some(fusion) => (name.to_string(), fusion.activation().is_none_or(|k| k == ActivationKind::Relu)),
        None => match graph.out_edges(name).as_slice() {
            [edge] => match graph.node(&edge.to).map(|n| &n.op) {
                Some(Op::Activation { kind: ActivationKind::Relu }) => (edge.to.clone(), true),
                Some(Op::Activation { .. }) => (name.to_string(), false),
                _ => (name.to_string(), true),
            },
            _ => (name.to_string(), true),
        },
    };
    Some(Neuron { name: name.to_string(), weights: weights.to_string(), bias, tail, passes })
}

/// The neuron directly fed by `from`, if the link is one-to-one.
fn follow(graph: &GraphView, from: &Neuron) -> Option<Neuron> {
    if !from.passes {
        return None;
    }
    let [edge] = graph.out_edges(&from.tail).try_into().ok()?;
    if edge.to_idx != 0 {
        return None;
    }
    let producers = graph
        .in_edges(&edge.to)
        .iter()
        .filter(|e| !graph.node(&e.from).is_some_and(|n| n.op.is_constant()))
        .count();
    if producers != 1 {
        return None;
    }
    let next = neuron(graph, &edge.to)?;
    let (_, a) = graph.constant_input(&from.name, 1)?;
    let (_, b) = graph.constant_input(&next.name, 1)?;
    (a.dim(0) == b.dim(1)).then_some(next)
}

/// Chains of filters in execution order, each as its list of adjacent pairs.
pub fn discover_groups(graph: &GraphView) -> Result<Vec<Vec<(Neuron, Neuron)>>> {
    let mut visited = BTreeSet::new();
    let mut groups = Vec::new();
    for name in graph.execution_order()? {
        if visited.contains(&name) {
            continue;
        }
        let Some(mut last) = neuron(graph, &name) else { continue };
        visited.insert(name);
        let mut group = Vec::new();
        while let Some(next) = follow(graph, &last) {
            tracing::debug!(from = %last.name, to = %next.name, "discovered neuron pair");
            visited.insert(next.name.clone());
            group.push((last, next.clone()));
            last = next;
        }
        if !group.is_empty() {
            tracing::info!(pairs = group.len(), "adding group");
            groups.push(group);
        }
    }
    Ok(groups)
}

fn tensor<'t>(tensors: &'t BTreeMap<String, Tensor>, name: &str) -> Result<&'t Tensor> {
    tensors.get(name).ok_or_else(|| Error::UnknownNode(name.to_string()))
}

fn precision(tensors: &BTreeMap<String, Tensor>, a: &Neuron, b: &Neuron) -> Result<f64> {
    let r0 = tensor(tensors, &a.weights)?.abs_max_axis0();
    let r1 = tensor(tensors, &b.weights)?.abs_max_axis1();
    let max0 = r0.iter().copied().fold(0.0f32, f32::max);
    let max1 = r1.iter().copied().fold(0.0f32, f32::max);
    if max0 == 0.0 || max1 == 0.0 {
        return Ok(0.0);
    }
    Ok(r0.iter().zip(&r1).map(|(x, y)| f64::from(x / max0) * f64::from(y / max1)).sum())
}

/// Per-channel scale balancing an output range against an input range.
pub fn channel_scale(range_out: &[f32], range_in: &[f32]) -> Vec<f32> {
    range_out
        .iter()
        .zip(range_in)
        .map(|(&r0, &r1)| if r0 > 0.0 && r1 > 0.0 { (1.0 / r1) * (r0 * r1).sqrt() } else { 1.0 })
        .collect()
}

fn scale_pair(tensors: &mut BTreeMap<String, Tensor>, a: &Neuron, b: &Neuron) -> Result<f64> {
    let r0 = tensor(tensors, &a.weights)?.abs_max_axis0();
    let r1 = tensor(tensors, &b.weights)?.abs_max_axis1();
    let scale = channel_scale(&r0, &r1);
    let mut names = vec![&a.weights];
    names.extend(a.bias.as_ref());
    for name in names {
        tensors.get_mut(name).ok_or_else(|| Error::UnknownNode(name.clone()))?.div_axis0(&scale);
    }
    tensors.get_mut(&b.weights).ok_or_else(|| Error::UnknownNode(b.weights.clone()))?.mul_axis1(&scale);
    Ok(scale.iter().map(|s| f64::from((s - 1.0).abs())).fold(0.0, f64::max))
}

/// Iterates one group until the precision metric settles. Returns cycles used and the largest scale deviation.
fn process_group(
    tensors: &mut BTreeMap<String, Tensor>,
    group: &[(Neuron, Neuron)],
    threshold: f64,
    order: PairOrder,
) -> Result<(usize, f64)> {
    let mut total = 0.0;
    let mut deviation = 0.0f64;
    for cycle in 1..=MAX_CYCLES {
        let metric = group.iter().map(|(a, b)| precision(tensors, a, b)).sum::<Result<f64>>()?;
        if (metric - total).abs() < threshold {
            tracing::info!(cycles = cycle, threshold, "group has converged");
            return Ok((cycle, deviation));
        }
        total = metric;
        let pairs: Box<dyn Iterator<Item = &(Neuron, Neuron)>> = match order {
            PairOrder::Reverse => Box::new(group.iter().rev()),
            PairOrder::Forward => Box::new(group.iter()),
        };
        for (a, b) in pairs {
            deviation = deviation.max(scale_pair(tensors, a, b)?);
        }
    }
    Err(Error::Convergence { cycles: MAX_CYCLES })
}

/// Equalizes every chain and commits the new weights only if all groups converge.
///
/// A zero threshold never converges since the metric change must fall strictly below it.
pub fn equalize(graph: &mut GraphView, threshold: f64, order: PairOrder) -> Result<EqualizationReport> {
    if !(threshold >= 0.0) {
        return Err(Error::InvalidThreshold { threshold });
    }
    let groups = discover_groups(graph)?;
    let mut report = EqualizationReport::default();
    if groups.is_empty() {
        tracing::warn!("no groups to equalize found");
        return Ok(report);
    }
    let mut tensors = BTreeMap::new();
    for (a, b) in groups.iter().flatten() {
        for n in [a, b] {
            for name in std::iter::once(&n.weights).chain(n.bias.as_ref()) {
                if let Some(Op::Constant { value }) = graph.node(name).map(|node| &node.op) {
                    tensors.insert(name.clone(), value.clone());
                }
            }
        }
    }
    for group in &groups {
        let (cycles, deviation) = process_group(&mut tensors, group, threshold, order)?;
        report.cycles.push(cycles);
        report.pairs += group.len();
        report.max_scale_deviation = report.max_scale_deviation.max(deviation);
    }
    report.groups = groups.len();
    for (name, value) in tensors {
        if let Some(node) = graph.node_mut(&name) {
            node.op = Op::Constant { value };
        }
    }
    graph.identity_mut().set_equalized(threshold);
    tracing::info!(groups = report.groups, pairs = report.pairs, "equalized");
    Ok(report)
}

/// Subtracts the calibrated per-channel output error from filter biases.
pub fn adjust_biases(graph: &mut GraphView, stats: &StatsTable) -> Result<usize> {
    let mut updates = Vec::new();
    for node in graph.nodes().filter(|n| n.op.capabilities().is_filter) {
        let Some(chan_err) = stats.for_node(node).and_then(|s| s.chan_err) else { continue };
        let Some((bias, value)) = graph.constant_input(&node.name, 2) else { continue };
        if value.data.len() != chan_err.len() {
            return Err(Error::unsupported(
                &node.name,
                format!("{} channel errors for {} biases", chan_err.len(), value.data.len()),
            ));
        }
        let mut value = value.clone();
        for (v, err) in value.data.iter_mut().zip(&chan_err) {
            *v -= *err as f32;
        }
        updates.push((bias.to_string(), value));
    }
    let count = updates.len();
    for (bias, value) in updates {
        if let Some(node) = graph.node_mut(&bias) {
            node.op = Op::Constant { value };
        }
    }
    Ok(count)
}
