use crate::core::op::{ActivationKind, Fusion, FusionKind, Op};
use crate::error::Result;
use crate::graph::{FragmentBoundary, GraphView, Node};
use crate::matches::matcher::MatchEnv;
use crate::matches::pattern::{Embedding, FragmentMatcher, Pattern, PatternEdge};
use crate::node_id::NodeId;
use crate::quantization::qrec::QRec;
use crate::quantization::qtype::QScheme;
use std::collections::BTreeSet;

/// Boundary inputs ordered by the member and input index they feed, so the
/// fused node keeps the input order of the first member.
fn chain_boundary(graph: &GraphView, members: &[String], subset: &BTreeSet<String>) -> FragmentBoundary {
    let mut boundary = graph.fragment_boundary(subset);
    boundary.inputs.sort_by_key(|(_, inlets)| {
        inlets.iter().map(|i| (members.iter().position(|m| *m == i.node).unwrap_or(usize::MAX), i.idx)).min()
    });
    boundary
}

/// Collapses a producer/consumer chain into one fused node.
///
/// The fused record takes its inputs from the first member and its outputs
/// from the last; member records move under the fusion.
pub(crate) fn fuse_chain(env: &mut MatchEnv<'_>, members: &[String], kind: FusionKind) -> Result<String> {
    let graph = &mut *env.graph;
    let subset: BTreeSet<String> = members.iter().cloned().collect();
    let boundary = chain_boundary(graph, members, &subset);
    let subgraph = graph.build_fragment(&subset, &boundary)?;
    let out_shapes = boundary.outputs.iter().map(|(outlet, _)| graph.out_shape(outlet)).collect();
    let name = graph.unique_name(&format!("{}_fusion", members[0]));
    let fusion = Fusion { kind, subgraph, inputs: boundary.inputs.len(), outputs: boundary.outputs.len() };
    let qrec = env.table.as_deref().and_then(|table| {
        let first = table.get_node(members.first()?)?;
        let last = table.get_node(members.last()?)?;
        Some(QRec::new(first.scheme, first.in_qs.clone(), last.out_qs.clone()))
    });
    graph.replace_fragment(members, Node::new(&name, Op::Fusion(Box::new(fusion)), out_shapes), &boundary.mapping())?;
    if let Some(table) = env.table.as_deref_mut() {
        for member in members {
            table.move_to_fusion(member, &name);
        }
        if let Some(qrec) = qrec {
            table.insert(NodeId::new(&name), qrec);
        }
    }
    tracing::debug!(fusion = %name, members = ?members, "fused");
    Ok(name)
}

fn is_filter(node: &Node) -> bool {
    matches!(node.op, Op::Conv2d(_) | Op::Linear(_))
}

fn activation(node: &Node) -> Option<ActivationKind> {
    match node.op {
        Op::Activation { kind } => Some(kind),
        _ => None,
    }
}

fn filter_activation_scaled(node: &Node) -> bool {
    use ActivationKind::*;
    matches!(activation(node), Some(Relu | Relu6 | LeakyRelu | HSigmoid | HSwish | Sigmoid))
}

fn op_activation_scaled(node: &Node) -> bool {
    use ActivationKind::*;
    matches!(activation(node), Some(Relu | LeakyRelu | HSigmoid | HSwish | Sigmoid))
}

fn relu_only(node: &Node) -> bool {
    activation(node) == Some(ActivationKind::Relu)
}

fn fusible_op_scaled(node: &Node) -> bool {
    matches!(node.op, Op::Pool(_) | Op::GlobalPool { .. } | Op::MatAdd)
}

fn fusible_op_pow2(node: &Node) -> bool {
    matches!(node.op, Op::Pool(_) | Op::MatAdd)
}

/// Convolution or linear layer followed by an activation.
pub struct FuseFilterActivation {
    pub scheme: QScheme,
}

impl FragmentMatcher for FuseFilterActivation {
    fn name(&self) -> &str {
        "fuse_filter_activation"
    }

    fn description(&self) -> &str {
        "fuse convolutions and linear layers with a following activation"
    }

    fn pattern(&self) -> Pattern {
        let act: fn(&Node) -> bool = match self.scheme {
            QScheme::Scaled => filter_activation_scaled,
            QScheme::Pow2 => relu_only,
        };
        Pattern::new().node("filter", is_filter).node("activation", act).edge(PatternEdge::new(0, 1))
    }

    fn replace(&self, env: &mut MatchEnv<'_>, embedding: &Embedding) -> Result<bool> {
        let (Some(filter), Some(act)) = (embedding.get("filter"), embedding.get("activation")) else {
            return Ok(false);
        };
        let Some(node) = env.graph.node(filter) else { return Ok(false) };
        if env.graph.in_edges(filter).len() != node.op.in_arity() {
            return Ok(false);
        }
        let kind = match node.op {
            Op::Conv2d(_) => FusionKind::ConvActive,
            _ => FusionKind::LinearActive,
        };
        fuse_chain(env, &[filter.to_string(), act.to_string()], kind)?;
        Ok(true)
    }
}

/// Pooling or addition followed by an activation.
pub struct FuseOpActivation {
    pub scheme: QScheme,
}

impl FragmentMatcher for FuseOpActivation {
    fn name(&self) -> &str {
        match self.scheme {
            QScheme::Scaled => "fuse_op_activation_scale8",
            QScheme::Pow2 => "fuse_op_activation_pow2",
        }
    }

    fn description(&self) -> &str {
        "fuse pooling and addition with a following activation"
    }

    fn pattern(&self) -> Pattern {
        let (op, act): (fn(&Node) -> bool, fn(&Node) -> bool) = match self.scheme {
            QScheme::Scaled => (fusible_op_scaled, op_activation_scaled),
            QScheme::Pow2 => (fusible_op_pow2, relu_only),
        };
        Pattern::new().node("op", op).node("activation", act).edge(PatternEdge::new(0, 1))
    }

    fn replace(&self, env: &mut MatchEnv<'_>, embedding: &Embedding) -> Result<bool> {
        let (Some(op), Some(act)) = (embedding.get("op"), embedding.get("activation")) else {
            return Ok(false);
        };
        fuse_chain(env, &[op.to_string(), act.to_string()], FusionKind::OpActive)?;
        Ok(true)
    }
}
