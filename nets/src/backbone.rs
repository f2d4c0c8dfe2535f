//! The XFeat detection trunk and the single-scale extractor export.
//!
//! The trunk takes a (B,3,H,W) image, collapses it to luminance, normalizes
//! it and runs a strided convolutional pyramid whose /8, /16 and /32 levels
//! are fused back at /8 resolution. Three heads read the result: dense
//! descriptors (`feats`, 64 channels), keypoint logits over 8x8 cells
//! (`keypoints`, 65 channels) and a reliability map (`heatmaps`).
//!
//! Parameters are registered once and wired by name, so two scales of the
//! dual-scale export share one set of weights.

use xfeat_onnx::internal::*;
use xfeat_onnx::pb::{AttributeProto, ModelProto};

use crate::norm::Normalization;
use crate::params::ParamSynth;

/// A convolution with registered weights.
struct ConvParams {
    w: Wire,
    bias: Option<Wire>,
    k: i64,
    stride: i64,
    pad: i64,
}

impl ConvParams {
    #[allow(clippy::too_many_arguments)]
    fn register(
        b: &mut GraphBuilder,
        synth: &mut ParamSynth,
        name: &str,
        ci: usize,
        co: usize,
        k: usize,
        stride: i64,
        pad: i64,
        bias: bool,
    ) -> XfeatResult<ConvParams> {
        let w = b.konst(synth.conv_weight(&format!("{name}.weight"), co, ci, k))?;
        let bias = if bias {
            Some(b.konst(synth.bias(&format!("{name}.bias"), co))?)
        } else {
            None
        };
        Ok(ConvParams { w, bias, k: k as i64, stride, pad })
    }

    fn wire(&self, b: &mut GraphBuilder, name: &str, input: &Wire) -> XfeatResult<Wire> {
        let attrs = vec![
            AttributeProto::ints("kernel_shape", &[self.k, self.k]),
            AttributeProto::ints("strides", &[self.stride, self.stride]),
            AttributeProto::ints("pads", &[self.pad, self.pad, self.pad, self.pad]),
        ];
        match &self.bias {
            Some(bias) => b.wire(name, "Conv", &[input, &self.w, bias], attrs),
            None => b.wire(name, "Conv", &[input, &self.w], attrs),
        }
    }
}

/// Conv + BatchNormalization + Relu, the trunk's building block.
struct BasicLayerParams {
    conv: ConvParams,
    bn: [Wire; 4],
}

impl BasicLayerParams {
    fn register(
        b: &mut GraphBuilder,
        synth: &mut ParamSynth,
        name: &str,
        ci: usize,
        co: usize,
        k: usize,
        stride: i64,
        pad: i64,
    ) -> XfeatResult<BasicLayerParams> {
        let conv =
            ConvParams::register(b, synth, &format!("{name}.layer.0"), ci, co, k, stride, pad, false)?;
        let [scale, shift, mean, var] = synth.batch_norm(&format!("{name}.layer.1"), co);
        let bn = [b.konst(scale)?, b.konst(shift)?, b.konst(mean)?, b.konst(var)?];
        Ok(BasicLayerParams { conv, bn })
    }

    fn wire(&self, b: &mut GraphBuilder, name: &str, input: &Wire) -> XfeatResult<Wire> {
        let conv = self.conv.wire(b, &format!("{name}.conv"), input)?;
        let bn = b.wire(
            &format!("{name}.bn"),
            "BatchNormalization",
            &[&conv, &self.bn[0], &self.bn[1], &self.bn[2], &self.bn[3]],
            vec![AttributeProto::float("epsilon", 1e-5)],
        )?;
        b.wire(name, "Relu", &[&bn], vec![])
    }
}

/// Weights of the detection trunk, shared across scales.
///
/// Channel plan: 1>4>8>8>24 down to /4 (with a pooled skip into the /4
/// level), 24>64 at /8, 64 at /16, 128>64 at /32, all fused back at /8.
pub(crate) struct TrunkParams {
    skip: ConvParams,
    block1: [BasicLayerParams; 4],
    block2: [BasicLayerParams; 2],
    block3: [BasicLayerParams; 3],
    block4: [BasicLayerParams; 3],
    block5: [BasicLayerParams; 4],
    fusion: [BasicLayerParams; 2],
    fusion_out: ConvParams,
}

impl TrunkParams {
    pub(crate) fn register(b: &mut GraphBuilder, synth: &mut ParamSynth) -> XfeatResult<TrunkParams> {
        Ok(TrunkParams {
            skip: ConvParams::register(b, synth, "net.skip1.1", 1, 24, 1, 1, 0, true)?,
            block1: [
                BasicLayerParams::register(b, synth, "net.block1.0", 1, 4, 3, 1, 1)?,
                BasicLayerParams::register(b, synth, "net.block1.1", 4, 8, 3, 2, 1)?,
                BasicLayerParams::register(b, synth, "net.block1.2", 8, 8, 3, 1, 1)?,
                BasicLayerParams::register(b, synth, "net.block1.3", 8, 24, 3, 2, 1)?,
            ],
            block2: [
                BasicLayerParams::register(b, synth, "net.block2.0", 24, 24, 3, 1, 1)?,
                BasicLayerParams::register(b, synth, "net.block2.1", 24, 24, 3, 1, 1)?,
            ],
            block3: [
                BasicLayerParams::register(b, synth, "net.block3.0", 24, 64, 3, 2, 1)?,
                BasicLayerParams::register(b, synth, "net.block3.1", 64, 64, 3, 1, 1)?,
                BasicLayerParams::register(b, synth, "net.block3.2", 64, 64, 1, 1, 0)?,
            ],
            block4: [
                BasicLayerParams::register(b, synth, "net.block4.0", 64, 64, 3, 2, 1)?,
                BasicLayerParams::register(b, synth, "net.block4.1", 64, 64, 3, 1, 1)?,
                BasicLayerParams::register(b, synth, "net.block4.2", 64, 64, 3, 1, 1)?,
            ],
            block5: [
                BasicLayerParams::register(b, synth, "net.block5.0", 64, 128, 3, 2, 1)?,
                BasicLayerParams::register(b, synth, "net.block5.1", 128, 128, 3, 1, 1)?,
                BasicLayerParams::register(b, synth, "net.block5.2", 128, 128, 3, 1, 1)?,
                BasicLayerParams::register(b, synth, "net.block5.3", 128, 64, 1, 1, 0)?,
            ],
            fusion: [
                BasicLayerParams::register(b, synth, "net.block_fusion.0", 64, 64, 3, 1, 1)?,
                BasicLayerParams::register(b, synth, "net.block_fusion.1", 64, 64, 3, 1, 1)?,
            ],
            fusion_out: ConvParams::register(b, synth, "net.block_fusion.2", 64, 64, 1, 1, 0, true)?,
        })
    }
}

pub(crate) struct HeatmapHeadParams {
    layers: [BasicLayerParams; 2],
    out: ConvParams,
}

impl HeatmapHeadParams {
    pub(crate) fn register(
        b: &mut GraphBuilder,
        synth: &mut ParamSynth,
    ) -> XfeatResult<HeatmapHeadParams> {
        Ok(HeatmapHeadParams {
            layers: [
                BasicLayerParams::register(b, synth, "net.heatmap_head.0", 64, 64, 1, 1, 0)?,
                BasicLayerParams::register(b, synth, "net.heatmap_head.1", 64, 64, 1, 1, 0)?,
            ],
            out: ConvParams::register(b, synth, "net.heatmap_head.2", 64, 1, 1, 1, 0, true)?,
        })
    }
}

pub(crate) struct KeypointHeadParams {
    layers: [BasicLayerParams; 3],
    out: ConvParams,
}

impl KeypointHeadParams {
    pub(crate) fn register(
        b: &mut GraphBuilder,
        synth: &mut ParamSynth,
    ) -> XfeatResult<KeypointHeadParams> {
        Ok(KeypointHeadParams {
            layers: [
                BasicLayerParams::register(b, synth, "net.keypoint_head.0", 64, 64, 1, 1, 0)?,
                BasicLayerParams::register(b, synth, "net.keypoint_head.1", 64, 64, 1, 1, 0)?,
                BasicLayerParams::register(b, synth, "net.keypoint_head.2", 64, 64, 1, 1, 0)?,
            ],
            out: ConvParams::register(b, synth, "net.keypoint_head.3", 64, 65, 1, 1, 0, true)?,
        })
    }
}

/// Image input signature shared by the extractor exports.
pub(crate) fn image_dims(dynamic: bool, height: i64, width: i64) -> TVec<Dim> {
    if dynamic {
        tvec!(Dim::sym("batch"), Dim::Fixed(3), Dim::sym("height"), Dim::sym("width"))
    } else {
        fixed(&[1, 3, height, width])
    }
}

/// Resize attributes matching bilinear interpolation without corner
/// alignment.
pub(crate) fn bilinear_attrs() -> Vec<AttributeProto> {
    vec![
        AttributeProto::string("mode", "linear"),
        AttributeProto::string("coordinate_transformation_mode", "pytorch_half_pixel"),
    ]
}

pub(crate) struct Features {
    /// Normalized single-channel image, (B,1,H,W). The keypoint head reads
    /// this, not the descriptor map.
    pub normalized: Wire,
    /// Fused descriptor map, (B,64,H/8,W/8).
    pub feats: Wire,
}

/// Wire the trunk under `prefix`, up to the fused descriptor map. The final
/// descriptor node is named `{prefix}feats`.
pub(crate) fn wire_features(
    b: &mut GraphBuilder,
    p: &TrunkParams,
    prefix: &str,
    images: &Wire,
    normalization: Normalization,
) -> XfeatResult<Features> {
    let n = |s: &str| format!("{prefix}{s}");
    let luma = b.wire(&n("luma"), "ReduceMean", &[images], vec![AttributeProto::ints("axes", &[1])])?;
    let x = normalization.wire(b, &n("norm"), &luma, 1)?;

    let pooled = b.wire(
        &n("skip1.pool"),
        "AveragePool",
        &[&x],
        vec![
            AttributeProto::ints("kernel_shape", &[4, 4]),
            AttributeProto::ints("strides", &[4, 4]),
        ],
    )?;
    let skip = p.skip.wire(b, &n("skip1.conv"), &pooled)?;

    let mut x1 = x.clone();
    for (i, layer) in p.block1.iter().enumerate() {
        x1 = layer.wire(b, &n(&format!("block1.{i}")), &x1)?;
    }
    let mut x2 = b.wire(&n("block2.add"), "Add", &[&x1, &skip], vec![])?;
    for (i, layer) in p.block2.iter().enumerate() {
        x2 = layer.wire(b, &n(&format!("block2.{i}")), &x2)?;
    }
    let mut x3 = x2;
    for (i, layer) in p.block3.iter().enumerate() {
        x3 = layer.wire(b, &n(&format!("block3.{i}")), &x3)?;
    }
    let mut x4 = x3.clone();
    for (i, layer) in p.block4.iter().enumerate() {
        x4 = layer.wire(b, &n(&format!("block4.{i}")), &x4)?;
    }
    let mut x5 = x4.clone();
    for (i, layer) in p.block5.iter().enumerate() {
        x5 = layer.wire(b, &n(&format!("block5.{i}")), &x5)?;
    }

    // /16 and /32 levels are brought back to the /8 grid of x3; since all
    // three are 64-channel, x3's full shape works as the resize target.
    let size = b.wire(&n("fusion.size"), "Shape", &[&x3], vec![])?;
    let roi = b.konst(tensor::vec_f32(&n("fusion.roi"), &[]))?;
    let scales = b.konst(tensor::vec_f32(&n("fusion.scales"), &[]))?;
    let up4 = b.wire(&n("fusion.up4"), "Resize", &[&x4, &roi, &scales, &size], bilinear_attrs())?;
    let up5 = b.wire(&n("fusion.up5"), "Resize", &[&x5, &roi, &scales, &size], bilinear_attrs())?;
    let sum = b.wire(&n("fusion.add4"), "Add", &[&x3, &up4], vec![])?;
    let mut feats = b.wire(&n("fusion.add5"), "Add", &[&sum, &up5], vec![])?;
    for (i, layer) in p.fusion.iter().enumerate() {
        feats = layer.wire(b, &n(&format!("block_fusion.{i}")), &feats)?;
    }
    let feats = p.fusion_out.wire(b, &n("feats"), &feats)?;

    Ok(Features { normalized: x, feats })
}

/// Reliability head: `{prefix}heatmaps` is a sigmoid over a 1-channel map.
pub(crate) fn wire_heatmap_head(
    b: &mut GraphBuilder,
    p: &HeatmapHeadParams,
    prefix: &str,
    feats: &Wire,
) -> XfeatResult<Wire> {
    let n = |s: &str| format!("{prefix}{s}");
    let mut x = feats.clone();
    for (i, layer) in p.layers.iter().enumerate() {
        x = layer.wire(b, &n(&format!("heatmap_head.{i}")), &x)?;
    }
    let logits = p.out.wire(b, &n("heatmap_head.2"), &x)?;
    b.wire(&n("heatmaps"), "Sigmoid", &[&logits], vec![])
}

/// Keypoint logits head: folds the normalized image into 8x8 cells and maps
/// them to 65 classes (64 positions plus dustbin) per cell.
pub(crate) fn wire_keypoint_head(
    b: &mut GraphBuilder,
    p: &KeypointHeadParams,
    prefix: &str,
    normalized: &Wire,
) -> XfeatResult<Wire> {
    let n = |s: &str| format!("{prefix}{s}");
    let mut x = b.wire(
        &n("keypoint_head.unfold"),
        "SpaceToDepth",
        &[normalized],
        vec![AttributeProto::int("blocksize", 8)],
    )?;
    for (i, layer) in p.layers.iter().enumerate() {
        x = layer.wire(b, &n(&format!("keypoint_head.{i}")), &x)?;
    }
    p.out.wire(b, &n("keypoints"), &x)
}

/// The single-scale extractor export: `images` in, `feats` / `keypoints` /
/// `heatmaps` out, all on the /8 grid.
#[derive(Clone, Debug)]
pub struct ExtractorGraph {
    pub height: i64,
    pub width: i64,
    pub dynamic: bool,
    pub normalization: Normalization,
}

impl Default for ExtractorGraph {
    fn default() -> ExtractorGraph {
        ExtractorGraph {
            height: 640,
            width: 640,
            dynamic: false,
            normalization: Normalization::Fused,
        }
    }
}

impl ExtractorGraph {
    pub fn build(&self, opset: i64) -> XfeatResult<ModelProto> {
        let mut b = GraphBuilder::new("xfeat_extractor");
        let mut synth = ParamSynth::new();
        let trunk = TrunkParams::register(&mut b, &mut synth)?;
        let kp_head = KeypointHeadParams::register(&mut b, &mut synth)?;
        let hm_head = HeatmapHeadParams::register(&mut b, &mut synth)?;

        let images = b.source("images", DataType::Float, &self.image_dims())?;
        let features = wire_features(&mut b, &trunk, "", &images, self.normalization)?;
        let keypoints = wire_keypoint_head(&mut b, &kp_head, "", &features.normalized)?;
        let heatmaps = wire_heatmap_head(&mut b, &hm_head, "", &features.feats)?;

        b.output(&features.feats, DataType::Float, &self.grid_dims(64))?;
        b.output(&keypoints, DataType::Float, &self.grid_dims(65))?;
        b.output(&heatmaps, DataType::Float, &self.grid_dims(1))?;
        b.into_model(opset)
    }

    fn image_dims(&self) -> TVec<Dim> {
        image_dims(self.dynamic, self.height, self.width)
    }

    fn grid_dims(&self, channels: i64) -> TVec<Dim> {
        if self.dynamic {
            tvec!(
                Dim::sym("batch"),
                Dim::Fixed(channels),
                Dim::sym("height/8"),
                Dim::sym("width/8")
            )
        } else {
            fixed(&[1, channels, self.height / 8, self.width / 8])
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use xfeat_onnx::checker::check_model;
    use xfeat_onnx::model::structure;

    #[test]
    fn static_export_has_literal_shapes() {
        let model = ExtractorGraph { height: 480, width: 640, ..ExtractorGraph::default() }
            .build(11)
            .unwrap();
        check_model(&model).unwrap();
        let lines = structure(&model).join("\n");
        assert!(lines.contains("input images FLOAT 1x3x480x640"), "{lines}");
        assert!(lines.contains("output feats FLOAT 1x64x60x80"), "{lines}");
        assert!(lines.contains("output keypoints FLOAT 1x65x60x80"), "{lines}");
        assert!(lines.contains("output heatmaps FLOAT 1x1x60x80"), "{lines}");
    }

    #[test]
    fn trunk_matches_the_channel_plan() {
        let model = ExtractorGraph::default().build(11).unwrap();
        let graph = model.graph.unwrap();
        let count = |op: &str| graph.node.iter().filter(|n| n.op_type == op).count();
        assert_eq!(count("Conv"), 27);
        assert_eq!(count("BatchNormalization"), 23);
        assert_eq!(count("Resize"), 2);
        assert_eq!(count("SpaceToDepth"), 1);
        assert_eq!(count("Sigmoid"), 1);
        let fused = graph.initializer.iter().find(|t| t.name == "net.block5.3.layer.0.weight");
        assert_eq!(fused.unwrap().dims, vec![64, 128, 1, 1]);
    }

    #[test]
    fn dynamic_export_uses_symbolic_axes() {
        let model =
            ExtractorGraph { dynamic: true, ..ExtractorGraph::default() }.build(11).unwrap();
        check_model(&model).unwrap();
        let lines = structure(&model).join("\n");
        assert!(lines.contains("input images FLOAT batchx3xheightxwidth"), "{lines}");
        assert!(lines.contains("output feats FLOAT batchx64xheight/8xwidth/8"), "{lines}");
    }

    #[test]
    fn split_normalization_reaches_the_export() {
        let model = ExtractorGraph {
            normalization: Normalization::split(),
            ..ExtractorGraph::default()
        }
        .build(11)
        .unwrap();
        check_model(&model).unwrap();
        let graph = model.graph.unwrap();
        assert!(graph.node.iter().all(|n| n.op_type != "InstanceNormalization"));
        assert!(graph.node.iter().any(|n| n.name == "norm.variance"));
    }
}
