//! End-to-end optimization scenarios on synthetic encoders

use bert_fusion_optimizer::eval::{compare_models, CompareOptions};
use bert_fusion_optimizer::graph::{self, Graph};
use bert_fusion_optimizer::synthetic::{BertGraphBuilder, GeluForm};
use bert_fusion_optimizer::{
    prune, FormatError, FusionError, ModelType, OptimizationOptions, Optimizer, OptimizerError, ReportKind,
};
use tempfile::TempDir;

fn optimized(mut graph: Graph, options: OptimizationOptions) -> (Graph, bert_fusion_optimizer::Report) {
    let outcome = Optimizer::new(options).optimize_graph(&mut graph).unwrap();
    (graph, outcome.report)
}

/// 24 layers, 16 heads, hidden 1024
#[test]
fn test_large_encoder_counts() {
    let graph = BertGraphBuilder::new()
        .layers(24)
        .heads(16)
        .hidden(1024)
        .structure_only(true)
        .build()
        .unwrap();
    let options = OptimizationOptions {
        num_heads: Some(16),
        hidden_size: Some(1024),
        ..Default::default()
    };
    let (graph, report) = optimized(graph, options);

    assert!(report.fully_optimized, "{report}");
    assert_eq!(report.counts.embed_layer_norm, 1);
    assert_eq!(report.counts.attention, 24);
    assert_eq!(report.counts.gelu, 24);
    assert_eq!(report.counts.layer_norm + report.counts.skip_layer_norm, 48);
    assert_eq!(graph.count_op("Softmax"), 0);

    let (_, attention) = graph.nodes().find(|(_, n)| n.op_type == "Attention").unwrap();
    assert_eq!(attention.attr_int("num_heads"), Some(16));
    assert_eq!(graph.initializer(&attention.inputs[1]).unwrap().dims, vec![1024, 3072]);
}

#[test]
fn test_irregular_layer_reports_single_deficit() {
    let graph = BertGraphBuilder::new()
        .layers(4)
        .heads(2)
        .hidden(16)
        .irregular_layer(Some(2))
        .build()
        .unwrap();
    let (_, report) = optimized(graph, OptimizationOptions::default());

    assert!(!report.fully_optimized);
    assert_eq!(report.deficits.len(), 1, "{report}");
    assert_eq!(report.deficits[0].kind, ReportKind::Attention);
    assert_eq!(report.deficits[0].expected, 4);
    assert_eq!(report.deficits[0].actual, 3);
    assert_eq!(report.failures.len(), 1);
    assert!(matches!(report.failures[0].error, FusionError::UnderSpecified(_)));
}

#[test]
fn test_missing_opset_writes_nothing() {
    let mut graph = BertGraphBuilder::new().layers(1).build().unwrap();
    graph.metadata.opset_imports.clear();

    let dir = TempDir::new().unwrap();
    let input = dir.path().join("model.onnx");
    let output = dir.path().join("model.opt.onnx");
    std::fs::write(&input, graph::save(&graph).unwrap()).unwrap();

    let err = Optimizer::new(OptimizationOptions::default())
        .optimize_file(&input, &output)
        .unwrap_err();
    assert!(matches!(err, OptimizerError::Format(FormatError::MissingOpset)));
    assert!(!output.exists());
}

#[test]
fn test_optimization_is_deterministic() {
    let build = || BertGraphBuilder::new().layers(3).seed(11).build().unwrap();
    let (a, _) = optimized(build(), OptimizationOptions::default());
    let (b, _) = optimized(build(), OptimizationOptions::default());
    assert_eq!(graph::save(&a).unwrap(), graph::save(&b).unwrap());
}

#[test]
fn test_save_load_round_trip() {
    let graph = BertGraphBuilder::new().layers(2).redundant_reshape(true).build().unwrap();
    let reloaded = graph::load(&graph::save(&graph).unwrap()).unwrap();
    assert!(reloaded.structurally_eq(&graph));

    let (fused, _) = optimized(graph, OptimizationOptions::default());
    let reloaded = graph::load(&graph::save(&fused).unwrap()).unwrap();
    assert!(reloaded.structurally_eq(&fused));
}

#[test]
fn test_prune_after_optimization_is_noop() {
    let (mut graph, _) = optimized(BertGraphBuilder::new().build().unwrap(), OptimizationOptions::default());
    let snapshot = graph.clone();
    assert_eq!(prune(&mut graph).total(), 0);
    assert!(graph.structurally_eq(&snapshot));
}

#[test]
fn test_external_contract_preserved() {
    let original = BertGraphBuilder::new().layers(2).seed(5).build().unwrap();
    let (fused, report) = optimized(original.clone(), OptimizationOptions::default());
    assert!(report.fully_optimized, "{report}");

    let names = |g: &Graph| g.graph_outputs().iter().map(|o| o.name.clone()).collect::<Vec<_>>();
    assert_eq!(names(&fused), names(&original));
    for input in fused.graph_inputs() {
        assert!(original.is_graph_input(&input.name));
    }

    let comparison = compare_models(&original, &fused, &CompareOptions::default()).unwrap();
    assert!(comparison.passed, "{comparison}");
    assert_eq!(comparison.outputs.len(), 2);
}

#[test]
fn test_numerical_equivalence_variants() {
    let variants = [
        BertGraphBuilder::new().gelu(GeluForm::Tanh).seed(1),
        BertGraphBuilder::new().mask(false).seed(2),
        BertGraphBuilder::new().redundant_reshape(true).heads(4).hidden(16).seed(3),
    ];
    for builder in variants {
        let original = builder.build().unwrap();
        let (fused, report) = optimized(original.clone(), OptimizationOptions::default());
        assert!(report.fully_optimized, "{report}");

        let mut options = CompareOptions::default();
        for input in original.graph_inputs() {
            options.shape_overrides.insert(input.name.clone(), vec![2, 4]);
        }
        let comparison = compare_models(&original, &fused, &options).unwrap();
        assert!(comparison.passed, "{comparison}");
    }
}

#[test]
fn test_generic_model_type_still_fuses() {
    let options = OptimizationOptions {
        model_type: ModelType::Generic,
        ..Default::default()
    };
    let (_, report) = optimized(BertGraphBuilder::new().build().unwrap(), options);
    assert!(report.expected.is_none());
    assert_eq!(report.counts.attention, 2);
}
