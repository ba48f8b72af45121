use nnfuse::core::op::{ActivationKind, Fusion, FusionKind, Op};
use nnfuse::core::types::Shape;
use nnfuse::graph::{Edge, GraphView, Node};
use nnfuse::matches::expression::find_sets;
use proptest::prelude::*;
use std::collections::BTreeSet;

/// Node `i > 0` is a relu fed by `a`, or an add fed by `a` and `b`, both picked among earlier nodes.
fn build(layout: &[(bool, usize, usize)]) -> GraphView {
    let mut g = GraphView::new();
    let shape = || vec![Shape::new([4])];
    g.add_node(Node::new("n0", Op::Input { index: 0 }, shape())).unwrap();
    for (i, &(is_add, a, b)) in layout.iter().enumerate() {
        let i = i + 1;
        let name = format!("n{i}");
        let op = if is_add { Op::MatAdd } else { Op::Activation { kind: ActivationKind::Relu } };
        g.add_node(Node::new(&name, op, shape())).unwrap();
        g.add_edge(Edge::new(format!("n{}", a % i), 0, &name, 0)).unwrap();
        if is_add {
            g.add_edge(Edge::new(format!("n{}", b % i), 0, &name, 1)).unwrap();
        }
    }
    g
}

fn fully_connected(g: &GraphView) -> bool {
    g.nodes().all(|n| g.in_edges(&n.name).len() == n.op.in_arity())
}

fn layout() -> impl Strategy<Value = Vec<(bool, usize, usize)>> {
    prop::collection::vec((any::<bool>(), 0usize..16, 0usize..16), 2..12)
}

proptest! {
    #[test]
    fn replace_never_leaves_dangling_edges(layout in layout(), mask in prop::collection::vec(any::<bool>(), 12)) {
        let mut g = build(&layout);
        let subset: BTreeSet<String> = (1..=layout.len()).filter(|i| mask[i - 1]).map(|i| format!("n{i}")).collect();
        prop_assume!(!subset.is_empty());
        let boundary = g.fragment_boundary(&subset);
        let fusion = Fusion {
            kind: FusionKind::Expression,
            subgraph: GraphView::new(),
            inputs: boundary.inputs.len(),
            outputs: boundary.outputs.len(),
        };
        let out_shapes = vec![Shape::new([4]); boundary.outputs.len()];
        let before = g.edges();
        let convex = g.reentries(&subset).is_empty();
        let members: Vec<String> = subset.iter().cloned().collect();
        let result = g.replace_fragment(&members, Node::new("fused", Op::Fusion(Box::new(fusion)), out_shapes), &boundary.mapping());

        prop_assert_eq!(result.is_ok(), convex);
        if result.is_err() {
            prop_assert_eq!(g.edges(), before);
        } else {
            prop_assert!(subset.iter().all(|n| !g.contains(n)));
        }
        prop_assert!(g.verify().is_ok());
        prop_assert!(g.execution_order().is_ok());
        prop_assert!(fully_connected(&g));
        for edge in g.edges() {
            prop_assert!(g.contains(&edge.from) && g.contains(&edge.to));
        }
    }

    #[test]
    fn expression_sets_ignore_candidate_order(
        layout in layout(),
        shuffled in Just((1..12).collect::<Vec<usize>>()).prop_shuffle(),
    ) {
        let g = build(&layout);
        let names: Vec<String> = (1..=layout.len()).map(|i| format!("n{i}")).collect();
        let reordered: Vec<String> = shuffled.iter().filter(|&&i| i <= layout.len()).map(|i| format!("n{i}")).collect();
        prop_assert_eq!(find_sets(&g, &names, None), find_sets(&g, &reordered, None));
    }

    #[test]
    fn expression_sets_are_disjoint(layout in layout()) {
        let g = build(&layout);
        let names: Vec<String> = (1..=layout.len()).map(|i| format!("n{i}")).collect();
        let mut seen = BTreeSet::new();
        for set in find_sets(&g, &names, None) {
            prop_assert!(!set.is_empty());
            for name in set {
                prop_assert!(seen.insert(name));
            }
        }
    }
}
