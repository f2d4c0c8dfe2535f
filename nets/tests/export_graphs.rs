//! Cross-variant checks: every graph the command line can request must
//! validate, survive a save/reload/save cycle and rebuild with the same
//! structure.

use xfeat_nets::{DenseGraph, ExtractorGraph, LighterGlueGraph, MatcherGraph};
use xfeat_onnx::checker::check_model;
use xfeat_onnx::model;
use xfeat_onnx::pb::ModelProto;

fn builders() -> Vec<(&'static str, Box<dyn Fn() -> ModelProto>)> {
    vec![
        (
            "extractor",
            Box::new(|| ExtractorGraph::default().build(11).unwrap())
                as Box<dyn Fn() -> ModelProto>,
        ),
        ("dualscale", Box::new(|| DenseGraph::default().build(11).unwrap())),
        ("matcher", Box::new(|| MatcherGraph::default().build(11).unwrap())),
        ("lighterglue", Box::new(|| LighterGlueGraph::default().build().unwrap())),
    ]
}

#[test]
fn every_variant_validates() {
    for (name, build) in builders() {
        let model = build();
        check_model(&model).unwrap_or_else(|e| panic!("{name}: {e:?}"));
    }
}

#[test]
fn rebuilds_share_a_structure() {
    // weights are drawn fresh on every build; the rendered structure must
    // not depend on them
    for (name, build) in builders() {
        let a = model::structure(&build());
        let b = model::structure(&build());
        assert_eq!(a, b, "{name}");
    }
}

#[test]
fn save_reload_resave_is_stable() {
    let dir = tempfile::tempdir().unwrap();
    for (name, build) in builders() {
        let built = build();
        let first = dir.path().join(format!("{name}.onnx"));
        let second = dir.path().join(format!("{name}.resaved.onnx"));
        model::save(&built, &first).unwrap();
        let back = model::for_path(&first).unwrap();
        check_model(&back).unwrap_or_else(|e| panic!("{name}: {e:?}"));
        assert_eq!(built, back, "{name}");
        model::save(&back, &second).unwrap();
        assert_eq!(
            std::fs::read(&first).unwrap(),
            std::fs::read(&second).unwrap(),
            "{name}"
        );
    }
}

#[test]
fn dualscale_shares_the_extractor_trunk() {
    let single = ExtractorGraph::default().build(11).unwrap();
    let dual = DenseGraph::default().build(11).unwrap();
    let names = |m: &ModelProto| -> Vec<String> {
        m.graph.as_ref().unwrap().initializer.iter().map(|t| t.name.clone()).collect()
    };
    let single_names = names(&single);
    let dual_names = names(&dual);
    for trunk in ["net.block1.0.layer.0.weight", "net.skip1.1.weight", "net.heatmap_head.2.weight"]
    {
        assert!(single_names.iter().any(|n| n == trunk), "{trunk}");
        assert!(dual_names.iter().any(|n| n == trunk), "{trunk}");
    }
    // the detection head only rides along in the single-scale export
    assert!(single_names.iter().any(|n| n.starts_with("net.keypoint_head.")));
    assert!(!dual_names.iter().any(|n| n.starts_with("net.keypoint_head.")));
}
