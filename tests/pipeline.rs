use nnfuse::config::QuantizationConfig;
use nnfuse::core::op::Op;
use nnfuse::quantization::{HandlerRegistry, QScheme, StatsTable};
use nnfuse::{Error, Network};

const NET: &str = r#"{
    "nodes": [
        {"name": "in", "op": "input", "index": 0, "shapes": [[1, 4, 4]]},
        {"name": "in2", "op": "input", "index": 1, "shapes": [[2, 4, 4]]},
        {"name": "w1", "op": "constant", "value": {"shape": [2, 1, 1, 1], "data": [0.5, -2.0]}, "shapes": [[2, 1, 1, 1]]},
        {"name": "b1", "op": "constant", "value": {"shape": [2], "data": [0.1, 0.2]}, "shapes": [[2]]},
        {"name": "conv1", "op": "conv2d", "in_channels": 1, "out_channels": 2, "kernel": [1, 1], "shapes": [[2, 4, 4]]},
        {"name": "relu1", "op": "activation", "kind": "relu", "shapes": [[2, 4, 4]]},
        {"name": "w2", "op": "constant", "value": {"shape": [2, 2, 1, 1], "data": [1.0, 0.25, -0.5, 3.0]}, "shapes": [[2, 2, 1, 1]]},
        {"name": "b2", "op": "constant", "value": {"shape": [2], "data": [0.0, -0.3]}, "shapes": [[2]]},
        {"name": "conv2", "op": "conv2d", "in_channels": 2, "out_channels": 2, "kernel": [1, 1], "shapes": [[2, 4, 4]]},
        {"name": "relu2", "op": "activation", "kind": "relu", "shapes": [[2, 4, 4]]},
        {"name": "add", "op": "mat_add", "shapes": [[2, 4, 4]]},
        {"name": "two", "op": "constant", "value": {"shape": [1], "data": [2.0]}, "shapes": [[1]]},
        {"name": "mul", "op": "mat_mul", "shapes": [[2, 4, 4]]},
        {"name": "out", "op": "output", "index": 0}
    ],
    "edges": [
        {"from": "in", "to": "conv1"},
        {"from": "w1", "to": "conv1", "to_idx": 1},
        {"from": "b1", "to": "conv1", "to_idx": 2},
        {"from": "conv1", "to": "relu1"},
        {"from": "relu1", "to": "conv2"},
        {"from": "w2", "to": "conv2", "to_idx": 1},
        {"from": "b2", "to": "conv2", "to_idx": 2},
        {"from": "conv2", "to": "relu2"},
        {"from": "relu2", "to": "add"},
        {"from": "in2", "to": "add", "to_idx": 1},
        {"from": "add", "to": "mul"},
        {"from": "two", "to": "mul", "to_idx": 1},
        {"from": "mul", "to": "out"}
    ]
}"#;

const STATS: &str = r#"[
    {"node": "in", "range_out": [{"min": -1.0, "max": 1.0}]},
    {"node": "in2", "range_out": [{"min": -2.0, "max": 2.0}]},
    {"node": "conv1", "range_in": [{"min": -1.0, "max": 1.0}], "range_out": [{"min": -2.5, "max": 2.5}]},
    {"node": "relu1", "range_out": [{"min": 0.0, "max": 2.5}]},
    {"node": "conv2", "range_out": [{"min": -7.0, "max": 8.0}]},
    {"node": "relu2", "range_out": [{"min": 0.0, "max": 8.0}]},
    {"node": "add", "range_out": [{"min": -2.0, "max": 10.0}]},
    {"node": "mul", "range_out": [{"min": -4.0, "max": 20.0}]}
]"#;

fn prepared(config: &QuantizationConfig) -> Network {
    let mut network = Network::from_json(NET).unwrap();
    let stats = StatsTable::from_json(STATS).unwrap();
    network.prepare(&stats, config, &HandlerRegistry::standard()).unwrap();
    network
}

fn op_of<'a>(network: &'a Network, name: &str) -> &'a Op {
    &network.graph.node(name).unwrap().op
}

#[test]
fn scale8_pipeline_fuses_filters_and_expression() {
    let network = prepared(&QuantizationConfig::default());
    let mut fused = network.fused_nodes().unwrap();
    fused.sort();
    assert_eq!(
        fused,
        vec![
            ("conv1_fusion".to_string(), "conv_active"),
            ("conv2_fusion".to_string(), "conv_active"),
            ("expr_0".to_string(), "expression"),
        ]
    );
    for gone in ["conv1", "relu1", "conv2", "relu2", "add", "mul", "two"] {
        assert!(!network.graph.contains(gone), "{gone} should be folded into a fusion");
    }
    let froms: Vec<_> = network.graph.in_edges("expr_0").into_iter().map(|e| e.from).collect();
    assert_eq!(froms, vec!["conv2_fusion", "in2"]);
    network.verify().unwrap();
}

#[test]
fn fused_records_cover_every_executable_node() {
    let network = prepared(&QuantizationConfig::default());
    let table = network.quantization.as_ref().unwrap();
    for node in network.graph.nodes().filter(|n| n.op.capabilities().executable) {
        let qrec = table.get_node(&node.name).unwrap();
        assert_eq!(qrec.in_qs.len(), node.op.in_arity(), "{}", node.name);
        assert_eq!(qrec.out_qs.len(), node.op.out_arity(), "{}", node.name);
    }
    let expr = table.get_node("expr_0").unwrap();
    assert!(expr.expression.contains_key("input_0"));
    assert!(expr.expression.contains_key("output_0"));
    assert!(matches!(op_of(&network, "expr_0"), Op::Fusion(_)));
}

#[test]
fn pipeline_is_deterministic() {
    let config = QuantizationConfig::default();
    let first = prepared(&config).quantization.unwrap().to_json().unwrap();
    let second = prepared(&config).quantization.unwrap().to_json().unwrap();
    assert_eq!(first, second);
}

#[test]
fn pow2_pipeline_keeps_pointwise_ops() {
    let config = QuantizationConfig { scheme: QScheme::Pow2, ..Default::default() };
    let network = prepared(&config);
    assert!(network.graph.contains("add"));
    assert!(network.graph.contains("mul"));
    assert!(network.graph.contains("conv1_fusion"));
    network.verify().unwrap();
}

#[test]
fn equalization_runs_before_quantization() {
    let config = QuantizationConfig { equalize: true, ..Default::default() };
    let mut network = Network::from_json(NET).unwrap();
    let stats = StatsTable::from_json(STATS).unwrap();
    let report = network.prepare(&stats, &config, &HandlerRegistry::standard()).unwrap().unwrap();
    assert_eq!(report.groups, 1);
    assert_eq!(report.pairs, 1);
    assert_eq!(network.graph.identity().equalized(), Some(config.equalization_threshold));
}

#[test]
fn missing_statistics_are_reported() {
    let mut network = Network::from_json(NET).unwrap();
    let stats = StatsTable::from_json(r#"[{"node": "in", "range_out": [{"min": -1.0, "max": 1.0}]}]"#).unwrap();
    let err = network.prepare(&stats, &QuantizationConfig::default(), &HandlerRegistry::standard()).unwrap_err();
    assert!(matches!(err, Error::MissingStatistics { .. }));
}
