use crate::core::op::Op;
use crate::error::Result;
use crate::graph::Node;
use crate::matches::matcher::MatchEnv;
use crate::matches::pattern::{Embedding, FragmentMatcher, Pattern, PatternEdge};

fn is_reshape(node: &Node) -> bool {
    matches!(node.op, Op::Reshape { .. })
}

/// Collapses a reshape feeding only another reshape into the second one.
pub struct RemoveReshapes;

impl FragmentMatcher for RemoveReshapes {
    fn name(&self) -> &str {
        "remove_reshapes"
    }

    fn description(&self) -> &str {
        "collapse chains of reshapes"
    }

    fn pattern(&self) -> Pattern {
        Pattern::new().node("first", is_reshape).node("second", is_reshape).edge(PatternEdge::new(0, 1))
    }

    fn replace(&self, env: &mut MatchEnv<'_>, embedding: &Embedding) -> Result<bool> {
        let Some(first) = embedding.get("first") else { return Ok(false) };
        env.graph.remove_and_reconnect(first)?;
        if let Some(table) = env.table.as_deref_mut() {
            table.remove_node(first);
        }
        tracing::debug!(node = first, "removed reshape feeding a reshape");
        Ok(true)
    }
}
