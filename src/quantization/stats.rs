use crate::core::op::Op;
use crate::graph::Node;
use crate::node_id::NodeId;
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;

#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct Range {
    pub min: f64,
    pub max: f64,
}

impl Range {
    pub fn new(min: f64, max: f64) -> Self {
        Self { min, max }
    }
}

/// Calibration statistics collected for one node.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct NodeStats {
    #[serde(default)]
    pub range_in: Vec<Option<Range>>,
    #[serde(default)]
    pub range_out: Vec<Range>,
    /// Mean per-channel output error, used to correct biases after equalization.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub chan_err: Option<Vec<f64>>,
}

/// One row of the serialized statistics table.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct StatsEntry {
    #[serde(flatten)]
    pub id: NodeId,
    #[serde(flatten)]
    pub stats: NodeStats,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(from = "Vec<StatsEntry>", into = "Vec<StatsEntry>")]
pub struct StatsTable {
    records: BTreeMap<NodeId, NodeStats>,
}

impl From<Vec<StatsEntry>> for StatsTable {
    fn from(entries: Vec<StatsEntry>) -> Self {
        Self { records: entries.into_iter().map(|e| (e.id, e.stats)).collect() }
    }
}

impl From<StatsTable> for Vec<StatsEntry> {
    fn from(table: StatsTable) -> Self {
        table.records.into_iter().map(|(id, stats)| StatsEntry { id, stats }).collect()
    }
}

impl StatsTable {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn from_json(json: &str) -> crate::error::Result<Self> {
        Ok(serde_json::from_str(json)?)
    }

    pub fn get(&self, id: &NodeId) -> Option<&NodeStats> {
        self.records.get(id)
    }

    pub fn insert(&mut self, id: NodeId, stats: NodeStats) {
        self.records.insert(id, stats);
    }

    pub fn len(&self) -> usize {
        self.records.len()
    }

    pub fn is_empty(&self) -> bool {
        self.records.is_empty()
    }

    fn lookup(&self, parent: &str, child: &str) -> Option<&NodeStats> {
        self.records.get(&NodeId::contained(parent, child)).or_else(|| self.records.get(&NodeId::new(child)))
    }

    /// Statistics for a graph node.
    ///
    /// Fused nodes without their own record take input ranges from the first
    /// contained node that has statistics and output ranges from the last.
    pub fn for_node(&self, node: &Node) -> Option<NodeStats> {
        if let Some(stats) = self.records.get(&NodeId::new(&node.name)) {
            return Some(stats.clone());
        }
        let Op::Fusion(fusion) = &node.op else { return None };
        let contained = fusion.contained_nodes().ok()?;
        let first = contained.iter().find_map(|child| self.lookup(&node.name, child))?;
        let last = contained.iter().rev().find_map(|child| self.lookup(&node.name, child))?;
        Some(NodeStats { range_in: first.range_in.clone(), range_out: last.range_out.clone(), chan_err: last.chan_err.clone() })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parses_flat_entries() {
        let table = StatsTable::from_json(
            r#"[
                {"node": "conv", "range_out": [{"min": -1.0, "max": 2.0}]},
                {"node": "fused", "fnode": "relu", "range_in": [null], "range_out": [{"min": 0.0, "max": 2.0}]}
            ]"#,
        )
        .unwrap();
        assert_eq!(table.len(), 2);
        let relu = table.get(&NodeId::contained("fused", "relu")).unwrap();
        assert_eq!(relu.range_in, vec![None]);
        assert_eq!(table.get(&NodeId::new("conv")).unwrap().range_out[0], Range::new(-1.0, 2.0));
    }
}
