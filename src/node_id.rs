use serde::{Deserialize, Serialize};
use std::fmt;

/// Stable key for per-node tables.
///
/// A node folded into a fusion keeps its identity as `(fusion, node)`.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct NodeId {
    pub node: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub fnode: Option<String>,
}

impl NodeId {
    pub fn new(node: &str) -> Self {
        Self { node: node.to_string(), fnode: None }
    }

    pub fn contained(parent: &str, node: &str) -> Self {
        Self { node: parent.to_string(), fnode: Some(node.to_string()) }
    }
}

impl fmt::Display for NodeId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match &self.fnode {
            Some(fnode) => write!(f, "{}[{}]", self.node, fnode),
            None => write!(f, "{}", self.node),
        }
    }
}
