use crate::error::{Error, Result};
use crate::graph::GraphView;
use crate::node_id::NodeId;
use crate::quantization::qtype::{QScheme, QType};
use crate::quantization::stats::{NodeStats, Range};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;

fn is_false(v: &bool) -> bool {
    !*v
}

/// Quantization record of one node: a format per input and per output.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct QRec {
    pub scheme: QScheme,
    pub in_qs: Vec<QType>,
    pub out_qs: Vec<QType>,
    /// Node runs on the NE16 accelerator.
    #[serde(default, skip_serializing_if = "is_false")]
    pub ne16: bool,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub calibration: Option<NodeStats>,
    /// Value ranges of expression variables, keyed by variable name.
    #[serde(default, skip_serializing_if = "BTreeMap::is_empty")]
    pub expression: BTreeMap<String, Range>,
}

impl QRec {
    pub fn new(scheme: QScheme, in_qs: Vec<QType>, out_qs: Vec<QType>) -> Self {
        Self { scheme, in_qs, out_qs, ne16: false, calibration: None, expression: BTreeMap::new() }
    }
}

/// One row of the serialized quantization table.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TableEntry {
    #[serde(flatten)]
    pub id: NodeId,
    #[serde(flatten)]
    pub qrec: QRec,
}

/// Per-node quantization records, keyed by [`NodeId`].
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(from = "Vec<TableEntry>", into = "Vec<TableEntry>")]
pub struct QuantizationTable {
    records: BTreeMap<NodeId, QRec>,
}

impl From<Vec<TableEntry>> for QuantizationTable {
    fn from(entries: Vec<TableEntry>) -> Self {
        Self { records: entries.into_iter().map(|e| (e.id, e.qrec)).collect() }
    }
}

impl From<QuantizationTable> for Vec<TableEntry> {
    fn from(table: QuantizationTable) -> Self {
        table.records.into_iter().map(|(id, qrec)| TableEntry { id, qrec }).collect()
    }
}

impl QuantizationTable {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn to_json(&self) -> Result<String> {
        Ok(serde_json::to_string_pretty(self)?)
    }

    pub fn get(&self, id: &NodeId) -> Option<&QRec> {
        self.records.get(id)
    }

    pub fn get_node(&self, name: &str) -> Option<&QRec> {
        self.records.get(&NodeId::new(name))
    }

    pub fn contains_node(&self, name: &str) -> bool {
        self.records.contains_key(&NodeId::new(name))
    }

    pub fn insert(&mut self, id: NodeId, qrec: QRec) -> Option<QRec> {
        self.records.insert(id, qrec)
    }

    pub fn remove(&mut self, id: &NodeId) -> Option<QRec> {
        self.records.remove(id)
    }

    /// Drops the record of `name` and of everything fused inside it.
    pub fn remove_node(&mut self, name: &str) {
        self.records.retain(|id, _| id.node != name);
    }

    pub fn len(&self) -> usize {
        self.records.len()
    }

    pub fn is_empty(&self) -> bool {
        self.records.is_empty()
    }

    pub fn iter(&self) -> impl Iterator<Item = (&NodeId, &QRec)> {
        self.records.iter()
    }

    /// Re-keys the record of a top-level node under the fusion that now contains it.
    pub fn move_to_fusion(&mut self, node: &str, fusion: &str) {
        if let Some(qrec) = self.records.remove(&NodeId::new(node)) {
            self.records.insert(NodeId::contained(fusion, node), qrec);
        }
    }

    /// Gives `to` a pass-through record using output `out_idx` of `from`.
    pub fn copy_out_q(&mut self, from: &str, out_idx: usize, to: &str) -> Result<()> {
        let qrec = self
            .get_node(from)
            .ok_or_else(|| Error::InvariantViolation(format!("{from} has no quantization record")))?;
        let q = qrec
            .out_qs
            .get(out_idx)
            .cloned()
            .ok_or_else(|| Error::InvariantViolation(format!("{from} has no output {out_idx}")))?;
        let copy = QRec::new(qrec.scheme, vec![q.clone()], vec![q]);
        self.records.insert(NodeId::new(to), copy);
        Ok(())
    }

    /// Checks that every executable node has a record matching its arity and
    /// that no top-level record refers to a node that is gone.
    pub fn verify(&self, graph: &GraphView) -> Result<()> {
        for node in graph.nodes() {
            if !node.op.capabilities().executable {
                continue;
            }
            let qrec = self
                .get_node(&node.name)
                .ok_or_else(|| Error::InvariantViolation(format!("{} is not quantized", node.name)))?;
            if qrec.in_qs.len() != node.op.in_arity() || qrec.out_qs.len() != node.op.out_arity() {
                return Err(Error::InvariantViolation(format!(
                    "record of {} has {}/{} formats for arity {}/{}",
                    node.name,
                    qrec.in_qs.len(),
                    qrec.out_qs.len(),
                    node.op.in_arity(),
                    node.op.out_arity()
                )));
            }
        }
        if let Some(id) = self.records.keys().find(|id| !graph.contains(&id.node)) {
            return Err(Error::InvariantViolation(format!("record {id} has no node")));
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::core::types::DType;

    fn rec() -> QRec {
        let q = QType::scaled(DType::Int8, -1.0, 1.0, false);
        QRec::new(QScheme::Scaled, vec![q.clone()], vec![q])
    }

    #[test]
    fn move_to_fusion_rekeys_record() {
        let mut table = QuantizationTable::new();
        table.insert(NodeId::new("relu"), rec());
        table.move_to_fusion("relu", "conv_fusion");
        assert!(!table.contains_node("relu"));
        assert!(table.get(&NodeId::contained("conv_fusion", "relu")).is_some());
        table.remove_node("conv_fusion");
        assert!(table.is_empty());
    }

    #[test]
    fn serializes_as_ordered_rows() {
        let mut table = QuantizationTable::new();
        table.insert(NodeId::new("b"), rec());
        table.insert(NodeId::new("a"), rec());
        let json = table.to_json().unwrap();
        assert!(json.find("\"a\"").unwrap() < json.find("\"b\"").unwrap());
        let back: QuantizationTable = serde_json::from_str(&json).unwrap();
        assert_eq!(back.len(), 2);
        assert_eq!(back.get_node("a").unwrap().in_qs[0].dtype, DType::Int8);
    }
}
