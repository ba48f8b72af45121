use crate::core::op::Op;
use crate::core::types::Shape;
use crate::error::{Error, Result};
use petgraph::algo::{has_path_connecting, toposort};
use petgraph::stable_graph::{NodeIndex, StableDiGraph};
use petgraph::visit::{EdgeRef, IntoEdgeReferences};
use petgraph::Direction;
use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, BTreeSet, HashMap, VecDeque};

#[derive(Debug, Clone)]
pub struct Node {
    pub name: String,
    pub op: Op,
    pub out_shapes: Vec<Shape>,
}

impl Node {
    pub fn new(name: impl Into<String>, op: Op, out_shapes: Vec<Shape>) -> Self {
        Self { name: name.into(), op, out_shapes }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
struct Slot {
    from_idx: usize,
    to_idx: usize,
}

/// `(from, from_idx) -> (to, to_idx)`
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct Edge {
    pub from: String,
    #[serde(default)]
    pub from_idx: usize,
    pub to: String,
    #[serde(default)]
    pub to_idx: usize,
}

impl Edge {
    pub fn new(from: impl Into<String>, from_idx: usize, to: impl Into<String>, to_idx: usize) -> Self {
        Self { from: from.into(), from_idx, to: to.into(), to_idx }
    }

    pub fn outlet(&self) -> Outlet {
        Outlet::new(&self.from, self.from_idx)
    }

    pub fn inlet(&self) -> Inlet {
        Inlet::new(&self.to, self.to_idx)
    }
}

/// An output slot of a node.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct Outlet {
    pub node: String,
    pub idx: usize,
}

impl Outlet {
    pub fn new(node: &str, idx: usize) -> Self {
        Self { node: node.to_string(), idx }
    }
}

/// An input slot of a node.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct Inlet {
    pub node: String,
    pub idx: usize,
}

impl Inlet {
    pub fn new(node: &str, idx: usize) -> Self {
        Self { node: node.to_string(), idx }
    }
}

/// How the boundary of a replaced fragment is rewired onto the replacement.
///
/// `inputs[i]` feeds replacement input `i`; replacement output `j` feeds every
/// inlet in `outputs[j]`.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct BoundaryMapping {
    pub inputs: Vec<Outlet>,
    pub outputs: Vec<Vec<Inlet>>,
}

/// Edges of a node subset grouped by the outlet that produces them.
#[derive(Debug, Clone, Default)]
pub struct FragmentBoundary {
    /// External outlets feeding the subset and the internal inlets each reaches.
    pub inputs: Vec<(Outlet, Vec<Inlet>)>,
    /// Internal outlets leaving the subset and the external inlets each feeds.
    pub outputs: Vec<(Outlet, Vec<Inlet>)>,
    pub internal: Vec<Edge>,
}

impl FragmentBoundary {
    pub fn mapping(&self) -> BoundaryMapping {
        BoundaryMapping {
            inputs: self.inputs.iter().map(|(outlet, _)| outlet.clone()).collect(),
            outputs: self.outputs.iter().map(|(_, inlets)| inlets.clone()).collect(),
        }
    }
}

/// Change tracking for pipelines.
#[derive(Debug, Clone, Default)]
pub struct GraphIdentity {
    generation: u64,
    stamps: BTreeMap<String, u64>,
    equalized: Option<f64>,
}

impl GraphIdentity {
    pub fn generation(&self) -> u64 {
        self.generation
    }

    fn touch(&mut self) {
        self.generation += 1;
    }

    /// Records that `key` has seen the graph at its current generation.
    pub fn stamp(&mut self, key: &str) {
        self.stamps.insert(key.to_string(), self.generation);
    }

    /// True when nothing changed since `key` was last stamped.
    pub fn is_current(&self, key: &str) -> bool {
        self.stamps.get(key) == Some(&self.generation)
    }

    pub fn set_equalized(&mut self, threshold: f64) {
        self.equalized = Some(threshold);
    }

    pub fn equalized(&self) -> Option<f64> {
        self.equalized
    }
}

#[derive(Debug, Clone, Default)]
pub struct GraphView {
    graph: StableDiGraph<Node, Slot>,
    names: HashMap<String, NodeIndex>,
    identity: GraphIdentity,
}

impl GraphView {
    pub fn new() -> Self {
        Self::default()
    }

    fn index(&self, name: &str) -> Result<NodeIndex> {
        self.names.get(name).copied().ok_or_else(|| Error::UnknownNode(name.to_string()))
    }

    pub fn len(&self) -> usize {
        self.graph.node_count()
    }

    pub fn is_empty(&self) -> bool {
        self.graph.node_count() == 0
    }

    pub fn contains(&self, name: &str) -> bool {
        self.names.contains_key(name)
    }

    pub fn node(&self, name: &str) -> Option<&Node> {
        self.names.get(name).map(|&idx| &self.graph[idx])
    }

    pub fn node_mut(&mut self, name: &str) -> Option<&mut Node> {
        let idx = *self.names.get(name)?;
        self.identity.touch();
        Some(&mut self.graph[idx])
    }

    pub fn nodes(&self) -> impl Iterator<Item = &Node> {
        self.graph.node_indices().map(move |idx| &self.graph[idx])
    }

    pub fn edges(&self) -> Vec<Edge> {
        let mut edges: Vec<_> = self.graph.edge_references().map(|e| self.to_edge(e.source(), e.target(), e.weight())).collect();
        edges.sort();
        edges
    }

    pub fn identity(&self) -> &GraphIdentity {
        &self.identity
    }

    pub fn identity_mut(&mut self) -> &mut GraphIdentity {
        &mut self.identity
    }

    pub fn out_shape(&self, outlet: &Outlet) -> Shape {
        self.node(&outlet.node).and_then(|n| n.out_shapes.get(outlet.idx).cloned()).unwrap_or_default()
    }

    pub fn add_node(&mut self, node: Node) -> Result<()> {
        if self.names.contains_key(&node.name) {
            return Err(Error::structural(format!("duplicate node name {}", node.name)));
        }
        let name = node.name.clone();
        let idx = self.graph.add_node(node);
        self.names.insert(name, idx);
        self.identity.touch();
        Ok(())
    }

    /// Removes a node together with every edge touching it.
    pub fn remove_node(&mut self, name: &str) -> Result<Node> {
        let idx = self.index(name)?;
        self.names.remove(name);
        self.identity.touch();
        self.graph.remove_node(idx).ok_or_else(|| Error::UnknownNode(name.to_string()))
    }

    pub fn add_edge(&mut self, edge: Edge) -> Result<()> {
        let from = self.index(&edge.from)?;
        let to = self.index(&edge.to)?;
        self.check_edge(from, to, &edge)?;
        self.graph.add_edge(from, to, Slot { from_idx: edge.from_idx, to_idx: edge.to_idx });
        self.identity.touch();
        Ok(())
    }

    fn check_edge(&self, from: NodeIndex, to: NodeIndex, edge: &Edge) -> Result<()> {
        let out_arity = self.graph[from].op.out_arity();
        if edge.from_idx >= out_arity {
            return Err(Error::structural(format!(
                "{} has {} outputs, edge uses output {}",
                edge.from, out_arity, edge.from_idx
            )));
        }
        let in_arity = self.graph[to].op.in_arity();
        if edge.to_idx >= in_arity {
            return Err(Error::structural(format!(
                "{} has {} inputs, edge uses input {}",
                edge.to, in_arity, edge.to_idx
            )));
        }
        if self.graph.edges_directed(to, Direction::Incoming).any(|e| e.weight().to_idx == edge.to_idx) {
            return Err(Error::structural(format!("input {} of {} is already connected", edge.to_idx, edge.to)));
        }
        if from == to || has_path_connecting(&self.graph, to, from, None) {
            return Err(Error::structural(format!("edge {} -> {} would create a cycle", edge.from, edge.to)));
        }
        Ok(())
    }

    pub fn remove_edge(&mut self, edge: &Edge) -> Result<()> {
        let from = self.index(&edge.from)?;
        let to = self.index(&edge.to)?;
        let id = self
            .graph
            .edges_directed(to, Direction::Incoming)
            .find(|e| e.source() == from && e.weight().from_idx == edge.from_idx && e.weight().to_idx == edge.to_idx)
            .map(|e| e.id())
            .ok_or_else(|| Error::structural(format!("no edge {}:{} -> {}:{}", edge.from, edge.from_idx, edge.to, edge.to_idx)))?;
        self.graph.remove_edge(id);
        self.identity.touch();
        Ok(())
    }

    fn to_edge(&self, source: NodeIndex, target: NodeIndex, slot: &Slot) -> Edge {
        Edge {
            from: self.graph[source].name.clone(),
            from_idx: slot.from_idx,
            to: self.graph[target].name.clone(),
            to_idx: slot.to_idx,
        }
    }

    /// Incoming edges ordered by input index.
    pub fn in_edges(&self, name: &str) -> Vec<Edge> {
        let Some(&idx) = self.names.get(name) else { return Vec::new() };
        let mut edges: Vec<_> = self
            .graph
            .edges_directed(idx, Direction::Incoming)
            .map(|e| self.to_edge(e.source(), e.target(), e.weight()))
            .collect();
        edges.sort_by_key(|e| e.to_idx);
        edges
    }

    /// Incoming edges placed at their input index.
    pub fn indexed_in_edges(&self, name: &str) -> Vec<Option<Edge>> {
        let arity = self.node(name).map(|n| n.op.in_arity()).unwrap_or(0);
        let mut slots = vec![None; arity];
        for edge in self.in_edges(name) {
            let idx = edge.to_idx;
            slots[idx] = Some(edge);
        }
        slots
    }

    pub fn out_edges(&self, name: &str) -> Vec<Edge> {
        let Some(&idx) = self.names.get(name) else { return Vec::new() };
        let mut edges: Vec<_> = self
            .graph
            .edges_directed(idx, Direction::Outgoing)
            .map(|e| self.to_edge(e.source(), e.target(), e.weight()))
            .collect();
        edges.sort();
        edges
    }

    /// Consumers of every output, grouped by output index.
    pub fn successors(&self, name: &str) -> Vec<Vec<Inlet>> {
        let arity = self.node(name).map(|n| n.op.out_arity()).unwrap_or(0);
        let mut outs = vec![Vec::new(); arity];
        for edge in self.out_edges(name) {
            outs[edge.from_idx].push(edge.inlet());
        }
        outs
    }

    /// Distinct producers in input order.
    pub fn predecessors(&self, name: &str) -> Vec<String> {
        let mut seen = BTreeSet::new();
        self.in_edges(name).into_iter().filter(|e| seen.insert(e.from.clone())).map(|e| e.from).collect()
    }

    pub fn execution_order(&self) -> Result<Vec<String>> {
        let order = toposort(&self.graph, None)
            .map_err(|cycle| Error::InvariantViolation(format!("cycle through {}", self.graph[cycle.node_id()].name)))?;
        Ok(order.into_iter().map(|idx| self.graph[idx].name.clone()).collect())
    }

    pub fn unique_name(&self, base: &str) -> String {
        if !self.contains(base) {
            return base.to_string();
        }
        (1..).map(|n| format!("{base}_{n}")).find(|name| !self.contains(name)).unwrap_or_default()
    }

    /// Groups the edges touching `subset` into boundary inputs, boundary outputs and internal edges.
    pub fn fragment_boundary(&self, subset: &BTreeSet<String>) -> FragmentBoundary {
        let mut inputs: BTreeMap<Outlet, Vec<Inlet>> = BTreeMap::new();
        let mut outputs: BTreeMap<Outlet, Vec<Inlet>> = BTreeMap::new();
        let mut internal = BTreeSet::new();
        for name in subset {
            for edge in self.in_edges(name) {
                if subset.contains(&edge.from) {
                    internal.insert(edge);
                } else {
                    inputs.entry(edge.outlet()).or_default().push(edge.inlet());
                }
            }
            for edge in self.out_edges(name) {
                if subset.contains(&edge.to) {
                    internal.insert(edge);
                } else {
                    outputs.entry(edge.outlet()).or_default().push(edge.inlet());
                }
            }
        }
        FragmentBoundary {
            inputs: inputs.into_iter().collect(),
            outputs: outputs.into_iter().collect(),
            internal: internal.into_iter().collect(),
        }
    }

    /// Members of `subset` fed by an outside node that is itself downstream of the subset.
    ///
    /// Contracting a subset with re-entries would close a cycle.
    pub fn reentries(&self, subset: &BTreeSet<String>) -> BTreeSet<String> {
        let mut queue: VecDeque<String> = subset
            .iter()
            .flat_map(|name| self.out_edges(name))
            .filter(|e| !subset.contains(&e.to))
            .map(|e| e.to)
            .collect();
        let mut reached = BTreeSet::new();
        while let Some(name) = queue.pop_front() {
            if !reached.insert(name.clone()) {
                continue;
            }
            for edge in self.out_edges(&name) {
                queue.push_back(edge.to);
            }
        }
        subset
            .iter()
            .filter(|name| self.in_edges(name).iter().any(|e| !subset.contains(&e.from) && reached.contains(&e.from)))
            .cloned()
            .collect()
    }

    /// Copies `subset` into a standalone graph bounded by fusion marker nodes.
    pub fn build_fragment(&self, subset: &BTreeSet<String>, boundary: &FragmentBoundary) -> Result<GraphView> {
        let mut frag = GraphView::new();
        for name in subset {
            let node = self.node(name).ok_or_else(|| Error::UnknownNode(name.clone()))?;
            frag.add_node(node.clone())?;
        }
        for (index, (outlet, inlets)) in boundary.inputs.iter().enumerate() {
            let marker = format!("fusion_input_{index}");
            frag.add_node(Node::new(&marker, Op::FusionInput { index }, vec![self.out_shape(outlet)]))?;
            for inlet in inlets {
                frag.add_edge(Edge::new(&marker, 0, &inlet.node, inlet.idx))?;
            }
        }
        for edge in &boundary.internal {
            frag.add_edge(edge.clone())?;
        }
        for (index, (outlet, _)) in boundary.outputs.iter().enumerate() {
            let marker = format!("fusion_output_{index}");
            frag.add_node(Node::new(&marker, Op::FusionOutput { index }, vec![]))?;
            frag.add_edge(Edge::new(&outlet.node, outlet.idx, &marker, 0))?;
        }
        Ok(frag)
    }

    /// Atomically substitutes `subset` with `replacement`.
    ///
    /// Every edge crossing the subset boundary must be covered by `mapping`
    /// and the mapping must not name anything else. On error the graph is unchanged.
    pub fn replace_fragment(&mut self, subset: &[String], replacement: Node, mapping: &BoundaryMapping) -> Result<()> {
        let members: BTreeSet<String> = subset.iter().cloned().collect();
        if members.len() != subset.len() {
            return Err(Error::structural("fragment lists a node twice"));
        }
        if members.is_empty() {
            return Err(Error::structural("empty fragment"));
        }
        for name in &members {
            self.index(name)?;
        }
        if self.contains(&replacement.name) && !members.contains(&replacement.name) {
            return Err(Error::structural(format!("replacement name {} already in use", replacement.name)));
        }
        if mapping.inputs.len() != replacement.op.in_arity() || mapping.outputs.len() != replacement.op.out_arity() {
            return Err(Error::structural(format!(
                "replacement {} has arity {}/{}, mapping has {}/{}",
                replacement.name,
                replacement.op.in_arity(),
                replacement.op.out_arity(),
                mapping.inputs.len(),
                mapping.outputs.len()
            )));
        }

        let boundary = self.fragment_boundary(&members);
        let crossing_in: BTreeSet<Outlet> = boundary.inputs.iter().map(|(outlet, _)| outlet.clone()).collect();
        let mapped_in: BTreeSet<Outlet> = mapping.inputs.iter().cloned().collect();
        if mapped_in.len() != mapping.inputs.len() || mapped_in != crossing_in {
            return Err(Error::structural(format!(
                "input mapping of {} does not match the fragment boundary",
                replacement.name
            )));
        }
        let crossing_out: BTreeSet<Inlet> = boundary.outputs.iter().flat_map(|(_, inlets)| inlets.iter().cloned()).collect();
        let mapped_out: Vec<Inlet> = mapping.outputs.iter().flatten().cloned().collect();
        let mapped_out_set: BTreeSet<Inlet> = mapped_out.iter().cloned().collect();
        if mapped_out_set.len() != mapped_out.len() || mapped_out_set != crossing_out {
            return Err(Error::structural(format!(
                "output mapping of {} does not match the fragment boundary",
                replacement.name
            )));
        }
        if let Some(name) = self.reentries(&members).into_iter().next() {
            return Err(Error::structural(format!("fragment is not convex, {name} is fed from downstream")));
        }

        for name in &members {
            self.remove_node(name)?;
        }
        let name = replacement.name.clone();
        let target = self.graph.add_node(replacement);
        self.names.insert(name.clone(), target);
        for (to_idx, outlet) in mapping.inputs.iter().enumerate() {
            let source = self.index(&outlet.node)?;
            self.graph.add_edge(source, target, Slot { from_idx: outlet.idx, to_idx });
        }
        for (from_idx, inlets) in mapping.outputs.iter().enumerate() {
            for inlet in inlets {
                let dest = self.index(&inlet.node)?;
                self.graph.add_edge(target, dest, Slot { from_idx, to_idx: inlet.idx });
            }
        }
        self.identity.touch();
        Ok(())
    }

    /// Removes a single-input node and wires its consumers to its producer.
    pub fn remove_and_reconnect(&mut self, name: &str) -> Result<Node> {
        let ins = self.in_edges(name);
        let [input] = ins.as_slice() else {
            return Err(Error::structural(format!("{name} must have exactly one input to be bypassed")));
        };
        let outs = self.out_edges(name);
        if outs.iter().any(|e| e.from_idx != 0) {
            return Err(Error::structural(format!("{name} must have a single output to be bypassed")));
        }
        let source = self.index(&input.from)?;
        let from_idx = input.from_idx;
        let node = self.remove_node(name)?;
        for edge in outs {
            let dest = self.index(&edge.to)?;
            self.graph.add_edge(source, dest, Slot { from_idx, to_idx: edge.to_idx });
        }
        Ok(node)
    }

    /// The constant tensor feeding input `idx` of `name`, with the constant's node name.
    pub fn constant_input(&self, name: &str, idx: usize) -> Option<(&str, &crate::core::types::Tensor)> {
        let edge = self.in_edges(name).into_iter().find(|e| e.to_idx == idx)?;
        let producer = self.node(&edge.from)?;
        match &producer.op {
            Op::Constant { value } => Some((producer.name.as_str(), value)),
            _ => None,
        }
    }

    /// Checks the structural invariants: every edge is in range and every input has at most one edge.
    pub fn verify(&self) -> Result<()> {
        for idx in self.graph.node_indices() {
            let node = &self.graph[idx];
            let mut seen = BTreeSet::new();
            for edge in self.graph.edges_directed(idx, Direction::Incoming) {
                let slot = edge.weight();
                if !seen.insert(slot.to_idx) || slot.to_idx >= node.op.in_arity() {
                    return Err(Error::structural(format!("bad input {} on {}", slot.to_idx, node.name)));
                }
                if slot.from_idx >= self.graph[edge.source()].op.out_arity() {
                    return Err(Error::structural(format!("bad output {} on {}", slot.from_idx, self.graph[edge.source()].name)));
                }
            }
        }
        Ok(())
    }
}
