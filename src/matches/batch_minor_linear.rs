use crate::core::op::{FusionKind, Op};
use crate::core::types::Shape;
use crate::error::Result;
use crate::graph::{Edge, Node};
use crate::matches::matcher::MatchEnv;
use crate::matches::pattern::{Embedding, FragmentMatcher, Pattern};

/// The linear layer itself, or the one wrapped by a linear + activation fusion.
fn linear_of(op: &Op) -> Option<&Op> {
    match op {
        Op::Fusion(f) if f.kind == FusionKind::LinearActive => f.primary(),
        op => Some(op),
    }
}

fn is_batch_minor(node: &Node) -> bool {
    matches!(linear_of(&node.op), Some(Op::Linear(p)) if p.batch_minor && p.batch_size > 1)
}

/// Rewrites a batch-minor linear layer as a batch-major one followed by a transpose.
pub struct MatchBatchMinorLinear;

impl FragmentMatcher for MatchBatchMinorLinear {
    fn name(&self) -> &str {
        "match_batch_minor_linear"
    }

    fn description(&self) -> &str {
        "make batch-minor linear layers batch-major and transpose their output"
    }

    fn pattern(&self) -> Pattern {
        Pattern::new().node("linear", is_batch_minor)
    }

    fn replace(&self, env: &mut MatchEnv<'_>, embedding: &Embedding) -> Result<bool> {
        let Some(name) = embedding.get("linear") else { return Ok(false) };
        let graph = &mut *env.graph;
        let Some(node) = graph.node_mut(name) else { return Ok(false) };
        let linear = match &mut node.op {
            Op::Fusion(f) if f.kind == FusionKind::LinearActive => f.primary_mut(),
            op => Some(op),
        };
        let Some(Op::Linear(params)) = linear else { return Ok(false) };
        params.batch_minor = false;
        let major = Shape::new([params.batch_size, params.out_features]);
        let minor = std::mem::replace(&mut node.out_shapes, vec![major]);

        let transpose = graph.unique_name(&format!("{name}_transpose"));
        graph.add_node(Node::new(&transpose, Op::Transpose { perm: vec![1, 0] }, minor))?;
        for edge in graph.out_edges(name) {
            graph.remove_edge(&edge)?;
            graph.add_edge(Edge::new(&transpose, 0, &edge.to, edge.to_idx))?;
        }
        graph.add_edge(Edge::new(name, 0, &transpose, 0))?;
        if let Some(table) = env.table.as_deref_mut() {
            if table.contains_node(name) {
                table.copy_out_q(name, 0, &transpose)?;
            }
        }
        tracing::debug!(node = name, transpose = %transpose, "linear made batch-major");
        Ok(true)
    }
}
