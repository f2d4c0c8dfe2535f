//! Per-mode example input tensors.
//!
//! The graphs are constructed directly, so nothing is traced through these
//! values; they define the input signature the built graph must bind to,
//! and `verify_bindings` holds the two sides together. Values are random
//! or zero placeholders.

use ndarray::arr2;
use xfeat_nets::{DESCRIPTOR_DIM, ParamSynth};
use xfeat_onnx::internal::*;
use xfeat_onnx::pb::tensor_proto::DataType;
use xfeat_onnx::pb::tensor_shape_proto::dimension;
use xfeat_onnx::pb::{ModelProto, TensorProto, ValueInfoProto, type_proto};

use crate::mode::{ExportConfig, ExportMode};

pub fn examples_for(config: &ExportConfig) -> Vec<TensorProto> {
    let mut synth = ParamSynth::new();
    let k = config.top_k as usize;
    let d = DESCRIPTOR_DIM as usize;
    match config.mode {
        ExportMode::Extractor | ExportMode::Dualscale => {
            vec![synth.randn("images", &[1, 3, config.height as usize, config.width as usize])]
        }
        ExportMode::Matcher => vec![
            synth.randn("mkpts0", &[1, k, 2]),
            synth.randn("feats0", &[1, k, d]),
            synth.randn("sc0", &[1, k]),
            synth.randn("mkpts1", &[1, k, 2]),
            synth.randn("feats1", &[1, k, d]),
            synth.randn("sc1", &[1, k]),
        ],
        ExportMode::FullPipeline => {
            let size = arr2(&[[config.width as i32, config.height as i32]]);
            vec![
                synth.zeros("keypoints0", &[1, k, 2]),
                synth.zeros("keypoints1", &[1, k, 2]),
                synth.randn("descriptors0", &[1, k, d]),
                synth.randn("descriptors1", &[1, k, d]),
                tensor::from_i32("image_size0", &size),
                tensor::from_i32("image_size1", &size),
            ]
        }
    }
}

/// Check that the example tensors line up with the graph's input
/// signature: same names in the same order, same dtype and rank, and a
/// matching extent on every axis the graph binds to a fixed dim. Symbolic
/// axes admit any extent.
pub fn verify_bindings(model: &ModelProto, examples: &[TensorProto]) -> XfeatResult<()> {
    let graph = model.graph.as_ref().context("model carries no graph")?;
    ensure!(
        graph.input.len() == examples.len(),
        "graph binds {} inputs but {} example tensors were synthesized",
        graph.input.len(),
        examples.len()
    );
    for (vi, ex) in graph.input.iter().zip(examples) {
        ensure!(
            vi.name == ex.name,
            "graph input {:?} is paired with example tensor {:?}",
            vi.name,
            ex.name
        );
        let (dt, dims) = signature(vi)?;
        ensure!(
            dt == ex.data_type,
            "input {:?} is {}, the example tensor is {}",
            vi.name,
            dt_name(dt),
            dt_name(ex.data_type)
        );
        ensure!(
            dims.len() == ex.dims.len(),
            "input {:?} has rank {}, the example tensor has rank {}",
            vi.name,
            dims.len(),
            ex.dims.len()
        );
        for (slot, (bound, have)) in dims.iter().zip(&ex.dims).enumerate() {
            if let Some(bound) = bound {
                ensure!(
                    bound == have,
                    "input {:?} axis {slot} is fixed at {bound}, the example extent is {have}",
                    vi.name
                );
            }
        }
    }
    Ok(())
}

fn dt_name(dt: i32) -> &'static str {
    DataType::from_i32(dt).unwrap_or(DataType::Undefined).as_str_name()
}

/// Element type and per-axis fixed extents (None for symbolic axes).
fn signature(vi: &ValueInfoProto) -> XfeatResult<(i32, Vec<Option<i64>>)> {
    let t = vi
        .r#type
        .as_ref()
        .with_context(|| format!("graph input {:?} carries no type", vi.name))?;
    let type_proto::Value::TensorType(tt) = t
        .value
        .as_ref()
        .with_context(|| format!("graph input {:?} carries no tensor type", vi.name))?;
    let dims = match &tt.shape {
        None => vec![],
        Some(shape) => shape
            .dim
            .iter()
            .map(|d| match &d.value {
                Some(dimension::Value::DimValue(v)) => Some(*v),
                _ => None,
            })
            .collect(),
    };
    Ok((tt.elem_type, dims))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::mode::ExportConfig;
    use std::path::PathBuf;
    use xfeat_nets::{ExtractorGraph, LighterGlueGraph, MatcherGraph, Normalization};

    fn config(mode: ExportMode) -> ExportConfig {
        ExportConfig {
            mode,
            height: 640,
            width: 640,
            top_k: 100,
            dynamic: false,
            normalization: Normalization::Fused,
            export_path: PathBuf::from("unused.onnx"),
            opset: 11,
        }
    }

    #[test]
    fn extractor_examples_bind() {
        let model = ExtractorGraph::default().build(11).unwrap();
        let examples = examples_for(&config(ExportMode::Extractor));
        verify_bindings(&model, &examples).unwrap();
    }

    #[test]
    fn matcher_examples_bind_in_order() {
        let model = MatcherGraph::default().build(11).unwrap();
        let examples = examples_for(&config(ExportMode::Matcher));
        let names: Vec<&str> = examples.iter().map(|t| t.name.as_str()).collect();
        assert_eq!(names, ["mkpts0", "feats0", "sc0", "mkpts1", "feats1", "sc1"]);
        verify_bindings(&model, &examples).unwrap();
    }

    #[test]
    fn pipeline_examples_carry_int32_image_sizes() {
        let model = LighterGlueGraph::default().build().unwrap();
        let examples = examples_for(&config(ExportMode::FullPipeline));
        verify_bindings(&model, &examples).unwrap();
        let size = examples.iter().find(|t| t.name == "image_size0").unwrap();
        assert_eq!(size.data_type, DataType::Int32 as i32);
        assert_eq!(size.dims, vec![1, 2]);
        let values: Vec<i32> = size
            .raw_data
            .chunks_exact(4)
            .map(|c| i32::from_le_bytes(c.try_into().unwrap()))
            .collect();
        assert_eq!(values, [640, 640]);
    }

    #[test]
    fn symbolic_axes_admit_any_extent() {
        let model =
            ExtractorGraph { dynamic: true, ..ExtractorGraph::default() }.build(11).unwrap();
        let mut cfg = config(ExportMode::Extractor);
        cfg.height = 256;
        cfg.width = 352;
        verify_bindings(&model, &examples_for(&cfg)).unwrap();
    }

    #[test]
    fn mismatched_extent_is_reported() {
        let model = ExtractorGraph::default().build(11).unwrap();
        let mut cfg = config(ExportMode::Extractor);
        cfg.width = 320;
        let err = verify_bindings(&model, &examples_for(&cfg)).unwrap_err();
        let msg = format!("{err:?}");
        assert!(msg.contains("axis 3"), "{msg}");
        assert!(msg.contains("fixed at 640"), "{msg}");
    }

    #[test]
    fn wrong_tensor_set_is_reported() {
        let model = ExtractorGraph::default().build(11).unwrap();
        let err =
            verify_bindings(&model, &examples_for(&config(ExportMode::Matcher))).unwrap_err();
        assert!(format!("{err:?}").contains("6 example tensors"), "{err:?}");
    }
}
