use crate::config::QuantizationConfig;
use crate::core::op::Op;
use crate::core::types::Shape;
use crate::equalize::{self, EqualizationReport, PairOrder};
use crate::error::Result;
use crate::graph::{Edge, GraphView, Node};
use crate::matches::{match_group_for, MatchEnv, Matcher};
use crate::quantization::handlers::HandlerRegistry;
use crate::quantization::qrec::QuantizationTable;
use crate::quantization::quantizer::Quantizer;
use crate::quantization::stats::StatsTable;
use serde::Deserialize;

#[derive(Debug, Deserialize)]
struct NodeDef {
    name: String,
    #[serde(flatten)]
    op: Op,
    #[serde(default)]
    shapes: Vec<Shape>,
}

#[derive(Debug, Deserialize)]
struct NetworkDef {
    nodes: Vec<NodeDef>,
    #[serde(default)]
    edges: Vec<Edge>,
}

/// A graph together with the quantization records attached to it.
#[derive(Debug, Clone, Default)]
pub struct Network {
    pub graph: GraphView,
    pub quantization: Option<QuantizationTable>,
}

impl Network {
    pub fn new(graph: GraphView) -> Self {
        Self { graph, quantization: None }
    }

    /// Loads `{"nodes": [{"name", "op", ..., "shapes"}], "edges": [...]}`.
    pub fn from_json(json: &str) -> Result<Self> {
        let def: NetworkDef = serde_json::from_str(json)?;
        let mut graph = GraphView::new();
        for node in def.nodes {
            graph.add_node(Node::new(node.name, node.op, node.shapes))?;
        }
        for edge in def.edges {
            graph.add_edge(edge)?;
        }
        graph.verify()?;
        tracing::info!(nodes = graph.len(), "loaded network");
        Ok(Self::new(graph))
    }

    pub fn quantize(&mut self, quantizer: &Quantizer<'_>) -> Result<()> {
        self.quantization = Some(quantizer.quantize(&self.graph)?);
        Ok(())
    }

    /// Runs one pass or match group. With a quantizer the records follow every rewrite.
    pub fn apply<'q>(&mut self, matcher: &dyn Matcher, quantizer: Option<&'q Quantizer<'q>>) -> Result<bool> {
        if let (Some(quantizer), None) = (quantizer, &self.quantization) {
            self.quantize(quantizer)?;
        }
        let mut env = MatchEnv::new(&mut self.graph);
        if let (Some(table), Some(quantizer)) = (self.quantization.as_mut(), quantizer) {
            env = env.with_quantization(table, quantizer);
        }
        matcher.apply(&mut env)
    }

    pub fn equalize(&mut self, threshold: f64, order: PairOrder) -> Result<EqualizationReport> {
        equalize::equalize(&mut self.graph, threshold, order)
    }

    /// Bias correction, optional equalization, quantization and the scheme's match group.
    pub fn prepare(
        &mut self,
        stats: &StatsTable,
        config: &QuantizationConfig,
        registry: &HandlerRegistry,
    ) -> Result<Option<EqualizationReport>> {
        let adjusted = equalize::adjust_biases(&mut self.graph, stats)?;
        if adjusted > 0 {
            tracing::info!(filters = adjusted, "corrected biases");
        }
        let report = if config.equalize {
            Some(self.equalize(config.equalization_threshold, config.pair_order)?)
        } else {
            None
        };
        let quantizer = Quantizer::new(registry, stats, config);
        self.quantize(&quantizer)?;
        self.apply(&match_group_for(config.scheme), Some(&quantizer))?;
        self.verify()?;
        Ok(report)
    }

    /// Names and kinds of the fused nodes, in execution order.
    pub fn fused_nodes(&self) -> Result<Vec<(String, &'static str)>> {
        Ok(self
            .graph
            .execution_order()?
            .into_iter()
            .filter_map(|name| {
                let op = &self.graph.node(&name)?.op;
                op.fusion().map(|_| (name, op.op_name()))
            })
            .collect())
    }

    pub fn verify(&self) -> Result<()> {
        self.graph.verify()?;
        if let Some(table) = &self.quantization {
            table.verify(&self.graph)?;
        }
        Ok(())
    }
}
