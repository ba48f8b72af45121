use serde::{Deserialize, Serialize};
use crate::core::types::{DType, Shape, Tensor};
use crate::error::Result;
use crate::graph::GraphView;

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Hash)]
#[serde(rename_all = "snake_case")]
pub enum ActivationKind {
    Relu,
    Relu6,
    LeakyRelu,
    Sigmoid,
    Tanh,
    HSigmoid,
    HSwish,
}

impl ActivationKind {
    pub fn name(&self) -> &'static str {
        match self {
            ActivationKind::Relu => "relu",
            ActivationKind::Relu6 => "relu6",
            ActivationKind::LeakyRelu => "leaky",
            ActivationKind::Sigmoid => "sigmoid",
            ActivationKind::Tanh => "tanh",
            ActivationKind::HSigmoid => "hsigmoid",
            ActivationKind::HSwish => "hswish",
        }
    }
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Hash)]
#[serde(rename_all = "snake_case")]
pub enum PoolKind {
    Max,
    Average,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct ConvParams {
    pub in_channels: usize,
    pub out_channels: usize,
    pub kernel: [usize; 2],
    #[serde(default = "unit_stride")]
    pub stride: [usize; 2],
    #[serde(default = "one")]
    pub groups: usize,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct LinearParams {
    pub in_features: usize,
    pub out_features: usize,
    #[serde(default = "one")]
    pub batch_size: usize,
    #[serde(default)]
    pub batch_minor: bool,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct PoolParams {
    pub kind: PoolKind,
    pub kernel: [usize; 2],
    #[serde(default = "unit_stride")]
    pub stride: [usize; 2],
    #[serde(default)]
    pub padding: bool,
}

fn unit_stride() -> [usize; 2] {
    [1, 1]
}

fn one() -> usize {
    1
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Hash)]
#[serde(rename_all = "snake_case")]
pub enum FusionKind {
    /// Convolution followed by an activation.
    ConvActive,
    /// Fully connected layer followed by an activation.
    LinearActive,
    /// Pooling or elementwise op followed by an activation.
    OpActive,
    /// Opaque piecewise expression built by the expression matcher.
    Expression,
}

/// A node that owns a fragment of the original graph.
///
/// The subgraph is bounded by `FusionInput`/`FusionOutput` marker nodes whose
/// indices match the fused node's own input and output indices.
#[derive(Debug, Clone)]
pub struct Fusion {
    pub kind: FusionKind,
    pub subgraph: GraphView,
    pub inputs: usize,
    pub outputs: usize,
}

impl Fusion {
    /// Names of the contained operator nodes in execution order, markers excluded.
    pub fn contained_nodes(&self) -> Result<Vec<String>> {
        Ok(self
            .subgraph
            .execution_order()?
            .into_iter()
            .filter(|name| {
                self.subgraph
                    .node(name)
                    .is_some_and(|n| !matches!(n.op, Op::FusionInput { .. } | Op::FusionOutput { .. }))
            })
            .collect())
    }

    /// The activation carried by a filter/op + activation fusion, if any.
    pub fn activation(&self) -> Option<ActivationKind> {
        self.subgraph.nodes().find_map(|n| match &n.op {
            Op::Activation { kind } => Some(*kind),
            _ => None,
        })
    }

    /// The filter or operator a filter/op + activation fusion wraps.
    pub fn primary(&self) -> Option<&Op> {
        self.subgraph.nodes().map(|n| &n.op).find(|op| is_wrapped(op))
    }

    pub fn primary_mut(&mut self) -> Option<&mut Op> {
        let name = self.subgraph.nodes().find(|n| is_wrapped(&n.op))?.name.clone();
        self.subgraph.node_mut(&name).map(|n| &mut n.op)
    }
}

fn is_wrapped(op: &Op) -> bool {
    !matches!(op, Op::Activation { .. } | Op::Constant { .. } | Op::FusionInput { .. } | Op::FusionOutput { .. })
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "op", rename_all = "snake_case")]
pub enum Op {
    Input { index: usize },
    Output { index: usize },
    Constant { value: Tensor },
    Conv2d(ConvParams),
    Linear(LinearParams),
    Activation { kind: ActivationKind },
    Pool(PoolParams),
    GlobalPool { kind: PoolKind },
    MatAdd,
    MatSub,
    MatMul,
    MatDiv,
    Reshape { shape: Shape },
    Transpose { perm: Vec<usize> },
    Concat { axis: usize, inputs: usize },
    Split { axis: usize, sizes: Vec<usize> },
    Quantize { to: DType },
    FusionInput { index: usize },
    FusionOutput { index: usize },
    #[serde(skip)]
    Fusion(Box<Fusion>),
}

/// Static capability flags for an operator.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct Capabilities {
    pub can_equalize: bool,
    pub can_fuse_to_expression: bool,
    pub is_filter: bool,
    pub executable: bool,
}

impl Op {
    pub fn op_name(&self) -> &'static str {
        match self {
            Op::Input { .. } => "input",
            Op::Output { .. } => "output",
            Op::Constant { .. } => "constant",
            Op::Conv2d(_) => "conv",
            Op::Linear(_) => "linear",
            Op::Activation { kind } => kind.name(),
            Op::Pool(p) => match p.kind {
                PoolKind::Max => "max_pool",
                PoolKind::Average => "average_pool",
            },
            Op::GlobalPool { .. } => "global_pool",
            Op::MatAdd => "matadd",
            Op::MatSub => "matsub",
            Op::MatMul => "matmul",
            Op::MatDiv => "matdiv",
            Op::Reshape { .. } => "reshape",
            Op::Transpose { .. } => "transpose",
            Op::Concat { .. } => "concat",
            Op::Split { .. } => "split",
            Op::Quantize { .. } => "quantize",
            Op::FusionInput { .. } => "fusion_input",
            Op::FusionOutput { .. } => "fusion_output",
            Op::Fusion(f) => match f.kind {
                FusionKind::ConvActive => "conv_active",
                FusionKind::LinearActive => "linear_active",
                FusionKind::OpActive => "op_active",
                FusionKind::Expression => "expression",
            },
        }
    }

    pub fn in_arity(&self) -> usize {
        match self {
            Op::Input { .. } | Op::Constant { .. } | Op::FusionInput { .. } => 0,
            Op::Conv2d(_) | Op::Linear(_) => 3,
            Op::MatAdd | Op::MatSub | Op::MatMul | Op::MatDiv => 2,
            Op::Concat { inputs, .. } => *inputs,
            Op::Fusion(f) => f.inputs,
            _ => 1,
        }
    }

    pub fn out_arity(&self) -> usize {
        match self {
            Op::Output { .. } | Op::FusionOutput { .. } => 0,
            Op::Split { sizes, .. } => sizes.len(),
            Op::Fusion(f) => f.outputs,
            _ => 1,
        }
    }

    pub fn capabilities(&self) -> Capabilities {
        let mut caps = Capabilities { executable: true, ..Default::default() };
        match self {
            Op::Conv2d(p) => {
                caps.is_filter = true;
                caps.can_equalize = p.groups == 1;
            }
            Op::Linear(_) => {
                caps.is_filter = true;
                caps.can_equalize = true;
            }
            Op::Activation { .. } => {
                caps.can_equalize = true;
                caps.can_fuse_to_expression = true;
            }
            Op::MatAdd | Op::MatSub | Op::MatMul | Op::MatDiv => {
                caps.can_fuse_to_expression = true;
            }
            Op::Fusion(f) => {
                caps.can_equalize = matches!(f.kind, FusionKind::ConvActive | FusionKind::LinearActive);
                caps.is_filter = caps.can_equalize;
            }
            Op::FusionInput { .. } | Op::FusionOutput { .. } => caps.executable = false,
            _ => {}
        }
        caps
    }

    pub fn is_constant(&self) -> bool {
        matches!(self, Op::Constant { .. })
    }

    pub fn fusion(&self) -> Option<&Fusion> {
        match self {
            Op::Fusion(f) => Some(f),
            _ => None,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn arity_follows_variant() {
        assert_eq!(Op::Split { axis: 0, sizes: vec![1, 2, 3] }.out_arity(), 3);
        assert_eq!(Op::Concat { axis: 0, inputs: 4 }.in_arity(), 4);
        assert_eq!(Op::Output { index: 0 }.out_arity(), 0);
        assert_eq!(Op::MatAdd.in_arity(), 2);
    }

    #[test]
    fn grouped_conv_cannot_equalize() {
        let conv = Op::Conv2d(ConvParams { in_channels: 4, out_channels: 4, kernel: [3, 3], stride: [1, 1], groups: 4 });
        let caps = conv.capabilities();
        assert!(caps.is_filter);
        assert!(!caps.can_equalize);
    }

    #[test]
    fn op_deserializes_from_tagged_json() {
        let op: Op = serde_json::from_str(r#"{"op": "activation", "kind": "relu"}"#).unwrap();
        assert!(matches!(op, Op::Activation { kind: ActivationKind::Relu }));
        let op: Op = serde_json::from_str(r#"{"op": "linear", "in_features": 4, "out_features": 2}"#).unwrap();
        assert!(matches!(op, Op::Linear(LinearParams { batch_size: 1, .. })));
    }
}
