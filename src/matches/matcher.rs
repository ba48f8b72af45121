use crate::error::{Error, Result};
use crate::graph::GraphView;
use crate::quantization::qrec::QuantizationTable;
use crate::quantization::quantizer::Quantizer;

/// Upper bound on full rounds of a match group before it is declared unstable.
const MAX_ROUNDS: usize = 32;

/// Exclusive access a pass receives for one invocation.
pub struct MatchEnv<'a> {
    pub graph: &'a mut GraphView,
    pub table: Option<&'a mut QuantizationTable>,
    pub quantizer: Option<&'a Quantizer<'a>>,
}

impl<'a> MatchEnv<'a> {
    pub fn new(graph: &'a mut GraphView) -> Self {
        Self { graph, table: None, quantizer: None }
    }

    pub fn with_quantization(mut self, table: &'a mut QuantizationTable, quantizer: &'a Quantizer<'a>) -> Self {
        self.table = Some(table);
        self.quantizer = Some(quantizer);
        self
    }

    /// Re-resolves quantization for `start_nodes` if a table is attached.
    pub fn requantize(&mut self, start_nodes: &[String]) -> Result<()> {
        if let (Some(table), Some(quantizer)) = (self.table.as_deref_mut(), self.quantizer) {
            *table = quantizer.requantize(self.graph, table.clone(), Some(start_nodes))?;
        }
        Ok(())
    }
}

/// A graph rewrite rule.
pub trait Matcher {
    fn name(&self) -> &str;
    fn description(&self) -> &str;

    /// Returns whether the graph was modified.
    fn apply(&self, env: &mut MatchEnv<'_>) -> Result<bool>;
}

/// An ordered list of passes run to a fixpoint.
pub struct MatchGroup {
    name: String,
    description: String,
    passes: Vec<Box<dyn Matcher>>,
}

impl MatchGroup {
    pub fn new(name: &str, description: &str) -> Self {
        Self { name: name.to_string(), description: description.to_string(), passes: Vec::new() }
    }

    pub fn add<M: Matcher + 'static>(mut self, pass: M) -> Self {
        self.passes.push(Box::new(pass));
        self
    }

    pub fn passes(&self) -> impl Iterator<Item = &dyn Matcher> {
        self.passes.iter().map(|p| p.as_ref())
    }
}

impl Matcher for MatchGroup {
    fn name(&self) -> &str {
        &self.name
    }

    fn description(&self) -> &str {
        &self.description
    }

    fn apply(&self, env: &mut MatchEnv<'_>) -> Result<bool> {
        if env.graph.identity().is_current(&self.name) {
            tracing::debug!(group = %self.name, "graph unchanged since last run");
            return Ok(false);
        }
        let mut modified = false;
        for round in 1.. {
            if round > MAX_ROUNDS {
                return Err(Error::InvariantViolation(format!("match group {} did not reach a fixpoint", self.name)));
            }
            let mut changed = false;
            for pass in &self.passes {
                // A pass is stamped only when it found nothing, so it reruns once anything else edits the graph.
                let key = format!("{}/{}", self.name, pass.name());
                if env.graph.identity().is_current(&key) {
                    tracing::trace!(group = %self.name, pass = pass.name(), "skipping pass on unchanged graph");
                    continue;
                }
                if pass.apply(env)? {
                    tracing::info!(group = %self.name, pass = pass.name(), round, "pass modified graph");
                    changed = true;
                } else {
                    env.graph.identity_mut().stamp(&key);
                }
            }
            if !changed {
                break;
            }
            modified = true;
        }
        env.graph.identity_mut().stamp(&self.name);
        Ok(modified)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::core::op::Op;
    use crate::graph::Node;
    use std::cell::Cell;
    use std::rc::Rc;

    /// Adds `extra` when it is missing.
    struct AddOnce;

    impl Matcher for AddOnce {
        fn name(&self) -> &str {
            "add_once"
        }

        fn description(&self) -> &str {
            "adds a node once"
        }

        fn apply(&self, env: &mut MatchEnv<'_>) -> Result<bool> {
            if env.graph.contains("extra") {
                return Ok(false);
            }
            env.graph.add_node(Node::new("extra", Op::Input { index: 1 }, vec![]))?;
            Ok(true)
        }
    }

    /// Never matches, counts its runs.
    struct Counter(Rc<Cell<usize>>);

    impl Matcher for Counter {
        fn name(&self) -> &str {
            "counter"
        }

        fn description(&self) -> &str {
            "counts invocations"
        }

        fn apply(&self, _env: &mut MatchEnv<'_>) -> Result<bool> {
            self.0.set(self.0.get() + 1);
            Ok(false)
        }
    }

    #[test]
    fn quiet_pass_is_skipped_until_the_graph_changes() {
        let runs = Rc::new(Cell::new(0));
        let group = MatchGroup::new("g", "test group").add(AddOnce).add(Counter(runs.clone()));
        let mut graph = GraphView::new();

        assert!(group.apply(&mut MatchEnv::new(&mut graph)).unwrap());
        assert_eq!(runs.get(), 1);
        assert!(!group.apply(&mut MatchEnv::new(&mut graph)).unwrap());
        assert_eq!(runs.get(), 1);

        graph.remove_node("extra").unwrap();
        assert!(group.apply(&mut MatchEnv::new(&mut graph)).unwrap());
        assert_eq!(runs.get(), 2);
    }

    #[test]
    fn quiet_pass_reruns_after_a_later_pass_edits() {
        let runs = Rc::new(Cell::new(0));
        let group = MatchGroup::new("g", "test group").add(Counter(runs.clone())).add(AddOnce);
        let mut graph = GraphView::new();

        assert!(group.apply(&mut MatchEnv::new(&mut graph)).unwrap());
        assert_eq!(runs.get(), 2);
    }
}
