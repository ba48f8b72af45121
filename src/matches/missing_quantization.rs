use crate::error::Result;
use crate::matches::matcher::{MatchEnv, Matcher};

/// Quantizes every executable node that lost or never had a record.
pub struct FindMissingQuantization;

impl Matcher for FindMissingQuantization {
    fn name(&self) -> &str {
        "find_missing_quantization"
    }

    fn description(&self) -> &str {
        "quantize nodes created by earlier passes"
    }

    fn apply(&self, env: &mut MatchEnv<'_>) -> Result<bool> {
        let Some(table) = env.table.as_deref() else { return Ok(false) };
        let missing: Vec<String> = env
            .graph
            .nodes()
            .filter(|n| n.op.capabilities().executable && !table.contains_node(&n.name))
            .map(|n| n.name.clone())
            .collect();
        if missing.is_empty() {
            return Ok(false);
        }
        tracing::debug!(nodes = ?missing, "quantizing nodes without a record");
        env.requantize(&missing)?;
        Ok(false)
    }
}
