//! Format reconciliation for operators whose inputs must share one format.

use crate::error::{Error, Result};
use crate::quantization::qtype::QType;

#[derive(Debug, Clone, PartialEq)]
pub struct Reconciled {
    pub in_qs: Vec<QType>,
    pub out_q: QType,
}

/// Resolves one shared format for every input and the output.
///
/// Returns `Ok(None)` when forced formats conflict, so the caller can fall
/// through to another handler.
pub fn reconcile(node: &str, in_qs: &[QType], force_out: Option<&QType>, backwards: bool) -> Result<Option<Reconciled>> {
    let forced: Vec<&QType> = in_qs.iter().filter(|q| q.forced).collect();
    if let Some(first) = forced.first() {
        if forced.iter().any(|q| q != first) {
            tracing::debug!(node, "forced inputs disagree");
            return Ok(None);
        }
        if let Some(out) = force_out {
            if out != *first {
                tracing::debug!(node, "forced output disagrees with a forced input");
                return Ok(None);
            }
        }
    }

    if backwards || force_out.is_some() {
        let out = force_out
            .ok_or_else(|| Error::InvariantViolation(format!("{node}: backward resolution without a forced output")))?;
        let out = out.clone().forced();
        return Ok(Some(Reconciled { in_qs: vec![out.clone(); in_qs.len()], out_q: out }));
    }

    let Some(first_in) = in_qs.first() else {
        return Err(Error::InvariantViolation(format!("{node}: nothing to reconcile")));
    };
    if in_qs.iter().all(|q| q == first_in) {
        return Ok(Some(Reconciled { in_qs: in_qs.to_vec(), out_q: first_in.clone().unforced() }));
    }

    if let Some(first) = forced.first() {
        let shared = (*first).clone();
        return Ok(Some(Reconciled { in_qs: vec![shared.clone(); in_qs.len()], out_q: shared.unforced() }));
    }

    let common = QType::common(in_qs).ok_or_else(|| Error::InvariantViolation(format!("{node}: nothing to reconcile")))?;
    tracing::debug!(node, min = common.min, max = common.max, "inputs widened to a common format");
    Ok(Some(Reconciled { in_qs: vec![common.clone(); in_qs.len()], out_q: common }))
}
