use crate::core::op::Op;
use crate::error::Result;
use crate::graph::{GraphView, Node};
use crate::matches::matcher::{MatchEnv, Matcher};

/// Removes reshapes to the shape they already have and identity transposes.
pub struct RemoveNoops;

fn is_noop(graph: &GraphView, node: &Node) -> bool {
    match &node.op {
        Op::Reshape { shape } => graph.in_edges(&node.name).first().is_some_and(|e| graph.out_shape(&e.outlet()) == *shape),
        Op::Transpose { perm } => perm.iter().enumerate().all(|(i, p)| i == *p),
        _ => false,
    }
}

impl Matcher for RemoveNoops {
    fn name(&self) -> &str {
        "remove_noops"
    }

    fn description(&self) -> &str {
        "remove reshapes and transposes that do not change their input"
    }

    fn apply(&self, env: &mut MatchEnv<'_>) -> Result<bool> {
        let noops: Vec<String> = env
            .graph
            .execution_order()?
            .into_iter()
            .filter(|name| env.graph.node(name).is_some_and(|n| is_noop(env.graph, n)))
            .collect();
        for name in &noops {
            env.graph.remove_and_reconnect(name)?;
            if let Some(table) = env.table.as_deref_mut() {
                table.remove_node(name);
            }
            tracing::debug!(node = %name, "removed no-op");
        }
        Ok(!noops.is_empty())
    }
}
