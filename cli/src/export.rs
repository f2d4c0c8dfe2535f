//! The export pipeline: build the selected graph variant, bind the
//! example inputs, write the file, reload and validate it, re-save.

use std::path::PathBuf;

use xfeat_nets::{DenseGraph, ExtractorGraph, LighterGlueGraph, MatcherGraph};
use xfeat_onnx::internal::*;
use xfeat_onnx::optim::PostProcess;
use xfeat_onnx::pb::ModelProto;
use xfeat_onnx::{checker, model};

use crate::inputs;
use crate::mode::{ExportConfig, ExportMode};

/// Construct the graph the resolved mode selects. One build per run.
pub fn build(config: &ExportConfig) -> XfeatResult<ModelProto> {
    match config.mode {
        ExportMode::Extractor => ExtractorGraph {
            height: config.height,
            width: config.width,
            dynamic: config.dynamic,
            normalization: config.normalization,
        }
        .build(config.opset),
        ExportMode::Dualscale => DenseGraph {
            height: config.height,
            width: config.width,
            top_k: config.top_k,
            dynamic: config.dynamic,
            normalization: config.normalization,
        }
        .build(config.opset),
        ExportMode::Matcher => {
            MatcherGraph { top_k: config.top_k, dynamic: config.dynamic }.build(config.opset)
        }
        ExportMode::FullPipeline => {
            if config.opset != LighterGlueGraph::OPSET {
                debug!(
                    "matching pipeline is pinned to opset {}, ignoring requested {}",
                    LighterGlueGraph::OPSET,
                    config.opset
                );
            }
            LighterGlueGraph { top_k: config.top_k }.build()
        }
    }
}

/// Run the export end to end: build, check the example-input binding,
/// save, reload, validate, post-process, re-save. Returns the written
/// path.
pub fn run(config: &ExportConfig) -> XfeatResult<PathBuf> {
    debug!("building {:?} graph", config.mode);
    let built = build(config)?;
    let examples = inputs::examples_for(config);
    inputs::verify_bindings(&built, &examples)?;
    let path = &config.export_path;
    model::save(&built, path)?;
    let mut reloaded = model::for_path(path)?;
    checker::check_model(&reloaded).with_context(|| format!("validating {}", path.display()))?;
    PostProcess::default().apply(&mut reloaded)?;
    model::save(&reloaded, path)?;
    info!("exported {:?} model to {}", config.mode, path.display());
    Ok(path.clone())
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::path::Path;
    use xfeat_nets::Normalization;

    fn config(mode: ExportMode, dir: &Path) -> ExportConfig {
        ExportConfig {
            mode,
            height: 640,
            width: 640,
            top_k: 100,
            dynamic: false,
            normalization: Normalization::Fused,
            export_path: dir.join("model.onnx"),
            opset: 11,
        }
    }

    fn output_names(model: &ModelProto) -> Vec<String> {
        model.graph.as_ref().unwrap().output.iter().map(|o| o.name.clone()).collect()
    }

    #[test]
    fn every_mode_writes_a_valid_file() {
        let dir = tempfile::tempdir().unwrap();
        let cases: [(ExportMode, &[&str]); 4] = [
            (ExportMode::Extractor, &["feats", "keypoints", "heatmaps"]),
            (ExportMode::Dualscale, &["mkpts", "feats", "sc"]),
            (ExportMode::Matcher, &["matches", "batch_indexes"]),
            (
                ExportMode::FullPipeline,
                &["log_assignment", "matches0", "matches1", "matching_scores0", "matching_scores1"],
            ),
        ];
        for (mode, outputs) in cases {
            let config = config(mode, dir.path());
            let path = run(&config).unwrap();
            assert!(path.exists(), "{mode:?}");
            let reloaded = model::for_path(&path).unwrap();
            checker::check_model(&reloaded).unwrap();
            assert_eq!(output_names(&reloaded), outputs, "{mode:?}");
        }
    }

    #[test]
    fn full_pipeline_pins_its_own_opset() {
        let dir = tempfile::tempdir().unwrap();
        let path = run(&config(ExportMode::FullPipeline, dir.path())).unwrap();
        let reloaded = model::for_path(&path).unwrap();
        assert_eq!(reloaded.opset_import[0].version, 17);
        let path = run(&config(ExportMode::Extractor, dir.path())).unwrap();
        let reloaded = model::for_path(&path).unwrap();
        assert_eq!(reloaded.opset_import[0].version, 11);
    }

    #[test]
    fn nested_export_path_is_created() {
        let dir = tempfile::tempdir().unwrap();
        let mut cfg = config(ExportMode::Extractor, dir.path());
        cfg.export_path = dir.path().join("onnx_weights/extractor.onnx");
        let path = run(&cfg).unwrap();
        assert!(path.exists());
    }

    #[test]
    fn split_normalization_reaches_the_file() {
        let dir = tempfile::tempdir().unwrap();
        let mut cfg = config(ExportMode::Extractor, dir.path());
        cfg.normalization = Normalization::split();
        let path = run(&cfg).unwrap();
        let graph = model::for_path(&path).unwrap().graph.unwrap();
        assert!(graph.node.iter().all(|n| n.op_type != "InstanceNormalization"));
        assert!(graph.node.iter().any(|n| n.op_type == "Sqrt"));
    }

    #[test]
    fn low_opset_failure_aborts_before_the_resave() {
        let dir = tempfile::tempdir().unwrap();
        let mut cfg = config(ExportMode::Dualscale, dir.path());
        cfg.opset = 9;
        let err = format!("{:?}", run(&cfg).unwrap_err());
        assert!(err.contains("requires opset >= 10"), "{err}");
        assert!(err.contains("validating"), "{err}");
    }

    #[test]
    fn dynamic_export_frees_the_image_axes() {
        let dir = tempfile::tempdir().unwrap();
        let mut cfg = config(ExportMode::Extractor, dir.path());
        cfg.dynamic = true;
        cfg.height = 256;
        cfg.width = 352;
        let path = run(&cfg).unwrap();
        let reloaded = model::for_path(&path).unwrap();
        let lines = model::structure(&reloaded);
        assert!(lines.iter().any(|l| l == "input images FLOAT batchx3xheightxwidth"), "{lines:?}");
    }
}
