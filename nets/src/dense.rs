//! The dual-scale dense extractor export.
//!
//! Detection runs at two resolutions of the input (0.6x and 1.3x), the
//! per-scale top-k budget is split 20/80 between them, and the merged
//! results come out in original-image pixel coordinates. Each keypoint
//! carries the inverse of its source scale in `sc` so the matcher can
//! weight its refinement step.

use xfeat_onnx::internal::*;
use xfeat_onnx::pb::{AttributeProto, ModelProto};

use crate::DESCRIPTOR_DIM;
use crate::backbone::{
    HeatmapHeadParams, TrunkParams, bilinear_attrs, image_dims, wire_features, wire_heatmap_head,
};
use crate::norm::Normalization;
use crate::params::ParamSynth;

/// Scale factors applied to the input before each detection pass.
const SCALE1: f64 = 0.6;
const SCALE2: f64 = 1.3;

/// How each scaled image is fitted to the trunk's /32 stride.
#[derive(Clone, Copy, Debug, PartialEq)]
pub enum Preprocess {
    /// Resize down to the nearest multiple-of-32 size in the graph and
    /// rescale coordinates by the correction factor on the way out.
    Graph,
    /// Feed the scaled image unchanged with unit correction factors. Only
    /// correct when the scaled height and width already are multiples of
    /// 32; this is not validated, a violation yields a malformed export.
    Bypass,
}

/// `images` in, `mkpts` / `feats` / `sc` out, top-k merged over two scales.
#[derive(Clone, Debug)]
pub struct DenseGraph {
    pub height: i64,
    pub width: i64,
    pub top_k: i64,
    pub dynamic: bool,
    pub normalization: Normalization,
}

impl Default for DenseGraph {
    fn default() -> DenseGraph {
        DenseGraph {
            height: 640,
            width: 640,
            top_k: 100,
            dynamic: false,
            normalization: Normalization::Fused,
        }
    }
}

struct ScaleTap {
    mkpts: Wire,
    desc: Wire,
    sc: Wire,
}

impl DenseGraph {
    /// Per-scale keypoint budgets. Both shares truncate, so their sum can
    /// fall short of `top_k` by up to one.
    pub fn budgets(&self) -> (i64, i64) {
        ((self.top_k as f64 * 0.2) as i64, (self.top_k as f64 * 0.8) as i64)
    }

    pub fn build(&self, opset: i64) -> XfeatResult<ModelProto> {
        let preprocess = if self.dynamic { Preprocess::Graph } else { Preprocess::Bypass };
        let (k1, k2) = self.budgets();
        debug!("dual-scale top_k {} split {k1}/{k2}", self.top_k);
        let mut b = GraphBuilder::new("xfeat_dualscale");
        let mut synth = ParamSynth::new();
        let trunk = TrunkParams::register(&mut b, &mut synth)?;
        let hm_head = HeatmapHeadParams::register(&mut b, &mut synth)?;

        let images = b.source("images", DataType::Float, &image_dims(self.dynamic, self.height, self.width))?;
        let s1 = wire_scale(&mut b, &trunk, &hm_head, "s1.", &images, SCALE1, k1, self.normalization, preprocess)?;
        let s2 = wire_scale(&mut b, &trunk, &hm_head, "s2.", &images, SCALE2, k2, self.normalization, preprocess)?;

        let axis1 = AttributeProto::int("axis", 1);
        let mkpts = b.wire("mkpts", "Concat", &[&s1.mkpts, &s2.mkpts], vec![axis1.clone()])?;
        let feats = b.wire("feats", "Concat", &[&s1.desc, &s2.desc], vec![axis1.clone()])?;
        let sc = b.wire("sc", "Concat", &[&s1.sc, &s2.sc], vec![axis1])?;

        let k = k1 + k2;
        b.output(&mkpts, DataType::Float, &self.merged_dims(k, Some(2)))?;
        b.output(&feats, DataType::Float, &self.merged_dims(k, Some(DESCRIPTOR_DIM)))?;
        b.output(&sc, DataType::Float, &self.merged_dims(k, None))?;
        b.into_model(opset)
    }

    fn merged_dims(&self, k: i64, tail: Option<i64>) -> TVec<Dim> {
        let mut dims = tvec!(
            if self.dynamic { Dim::sym("batch") } else { Dim::Fixed(1) },
            Dim::Fixed(k)
        );
        if let Some(tail) = tail {
            dims.push(Dim::Fixed(tail));
        }
        dims
    }
}

/// One detection pass: scale the input, fit it to the stride, run the
/// trunk, keep the `budget` best heatmap cells and read their coordinates
/// and unit descriptors back out.
#[allow(clippy::too_many_arguments)]
fn wire_scale(
    b: &mut GraphBuilder,
    trunk: &TrunkParams,
    hm_head: &HeatmapHeadParams,
    prefix: &str,
    images: &Wire,
    scale: f64,
    budget: i64,
    normalization: Normalization,
    preprocess: Preprocess,
) -> XfeatResult<ScaleTap> {
    let n = |s: &str| format!("{prefix}{s}");

    let roi = b.konst(tensor::vec_f32(&n("scale.roi"), &[]))?;
    let factors = b.konst(tensor::vec_f32(
        &n("scale.factor"),
        &[1.0, 1.0, scale as f32, scale as f32],
    ))?;
    let scaled = b.wire(&n("scale"), "Resize", &[images, &roi, &factors], bilinear_attrs())?;

    let (net_in, cellmul) = match preprocess {
        Preprocess::Bypass => {
            let cell = (8.0 / scale) as f32;
            let f = b.konst(tensor::vec_f32(&n("cell"), &[cell, cell]))?;
            (scaled, f)
        }
        Preprocess::Graph => wire_snap(b, prefix, &scaled, scale)?,
    };

    let features = wire_features(b, trunk, prefix, &net_in, normalization)?;
    let heat = wire_heatmap_head(b, hm_head, prefix, &features.feats)?;

    // best cells of the flattened heatmap
    let flat = b.wire(&n("flat"), "Flatten", &[&heat], vec![])?;
    let k = b.konst(tensor::vec_i64(&n("k"), &[budget]))?;
    let top = b.wire_multi(
        &n("topk"),
        "TopK",
        &[&flat, &k],
        vec![
            AttributeProto::int("axis", -1),
            AttributeProto::int("largest", 1),
            AttributeProto::int("sorted", 1),
        ],
        2,
    )?;
    let idx = &top[1];

    // flat index -> pixel coordinates in the original image
    let gshape = b.wire(&n("grid.shape"), "Shape", &[&heat], vec![])?;
    let i3 = b.konst(tensor::scalar_i64(&n("grid.i3"), 3))?;
    let wdim = b.wire(&n("grid.w"), "Gather", &[&gshape, &i3], vec![])?;
    let col = b.wire(&n("grid.col"), "Mod", &[idx, &wdim], vec![])?;
    let row = b.wire(&n("grid.row"), "Div", &[idx, &wdim], vec![])?;
    let colf = b.wire(&n("grid.colf"), "Cast", &[&col], vec![cast_to(DataType::Float)])?;
    let rowf = b.wire(&n("grid.rowf"), "Cast", &[&row], vec![cast_to(DataType::Float)])?;
    let x = b.wire(&n("grid.x"), "Unsqueeze", &[&colf], vec![AttributeProto::ints("axes", &[2])])?;
    let y = b.wire(&n("grid.y"), "Unsqueeze", &[&rowf], vec![AttributeProto::ints("axes", &[2])])?;
    let xy = b.wire(&n("grid.xy"), "Concat", &[&x, &y], vec![AttributeProto::int("axis", 2)])?;
    let mkpts = b.wire(&n("kpts"), "Mul", &[&xy, &cellmul], vec![])?;

    // unit descriptors for the same cells
    let l2 = b.wire(
        &n("desc.l2"),
        "ReduceL2",
        &[&features.feats],
        vec![AttributeProto::ints("axes", &[1]), AttributeProto::int("keepdims", 1)],
    )?;
    let eps = b.konst(tensor::scalar_f32(&n("desc.eps"), 1e-12))?;
    let clipped = b.wire(&n("desc.clip"), "Clip", &[&l2, &eps], vec![])?;
    let unit = b.wire(&n("desc.unit"), "Div", &[&features.feats, &clipped], vec![])?;
    let tshape = b.konst(tensor::vec_i64(&n("desc.shape"), &[0, DESCRIPTOR_DIM, -1]))?;
    let flat_d = b.wire(&n("desc.flat"), "Reshape", &[&unit, &tshape], vec![])?;
    let rows = b.wire(
        &n("desc.rows"),
        "Transpose",
        &[&flat_d],
        vec![AttributeProto::ints("perm", &[0, 2, 1])],
    )?;
    let idxu = b.wire(&n("desc.idx"), "Unsqueeze", &[idx], vec![AttributeProto::ints("axes", &[2])])?;
    let reps = b.konst(tensor::vec_i64(&n("desc.reps"), &[1, 1, DESCRIPTOR_DIM]))?;
    let idxt = b.wire(&n("desc.tile"), "Tile", &[&idxu, &reps], vec![])?;
    let desc = b.wire(
        &n("desc"),
        "GatherElements",
        &[&rows, &idxt],
        vec![AttributeProto::int("axis", 1)],
    )?;

    // scale tag, one per kept keypoint
    let scshape = b.wire(&n("sc.shape"), "Shape", &[idx], vec![])?;
    let fill = AttributeProto::tensor("value", tensor::vec_f32("", &[(1.0 / scale) as f32]));
    let sc = b.wire(&n("sc"), "ConstantOfShape", &[&scshape], vec![fill])?;

    Ok(ScaleTap { mkpts, desc, sc })
}

/// In-graph fit of a scaled image to the /32 stride: resize down to the
/// floored multiple-of-32 size, and produce the (2,) coordinate multiplier
/// that maps grid cells back to original-image pixels.
fn wire_snap(
    b: &mut GraphBuilder,
    prefix: &str,
    scaled: &Wire,
    scale: f64,
) -> XfeatResult<(Wire, Wire)> {
    let n = |s: &str| format!("{prefix}{s}");
    let axes0 = || AttributeProto::ints("axes", &[0]);

    let shape = b.wire(&n("pre.shape"), "Shape", &[scaled], vec![])?;
    let i0 = b.konst(tensor::scalar_i64(&n("pre.i0"), 0))?;
    let i1 = b.konst(tensor::scalar_i64(&n("pre.i1"), 1))?;
    let i2 = b.konst(tensor::scalar_i64(&n("pre.i2"), 2))?;
    let i3 = b.konst(tensor::scalar_i64(&n("pre.i3"), 3))?;
    let dim_b = b.wire(&n("pre.b"), "Gather", &[&shape, &i0], vec![])?;
    let dim_c = b.wire(&n("pre.c"), "Gather", &[&shape, &i1], vec![])?;
    let dim_h = b.wire(&n("pre.h"), "Gather", &[&shape, &i2], vec![])?;
    let dim_w = b.wire(&n("pre.w"), "Gather", &[&shape, &i3], vec![])?;

    let stride = b.konst(tensor::scalar_i64(&n("pre.stride"), 32))?;
    let hq = b.wire(&n("pre.hq"), "Div", &[&dim_h, &stride], vec![])?;
    let hs = b.wire(&n("pre.hs"), "Mul", &[&hq, &stride], vec![])?;
    let wq = b.wire(&n("pre.wq"), "Div", &[&dim_w, &stride], vec![])?;
    let ws = b.wire(&n("pre.ws"), "Mul", &[&wq, &stride], vec![])?;

    let b1 = b.wire(&n("pre.b1"), "Unsqueeze", &[&dim_b], vec![axes0()])?;
    let c1 = b.wire(&n("pre.c1"), "Unsqueeze", &[&dim_c], vec![axes0()])?;
    let h1 = b.wire(&n("pre.h1"), "Unsqueeze", &[&hs], vec![axes0()])?;
    let w1 = b.wire(&n("pre.w1"), "Unsqueeze", &[&ws], vec![axes0()])?;
    let sizes = b.wire(
        &n("pre.sizes"),
        "Concat",
        &[&b1, &c1, &h1, &w1],
        vec![AttributeProto::int("axis", 0)],
    )?;
    let roi = b.konst(tensor::vec_f32(&n("pre.roi"), &[]))?;
    let none = b.konst(tensor::vec_f32(&n("pre.scales"), &[]))?;
    let snapped = b.wire(&n("pre"), "Resize", &[scaled, &roi, &none, &sizes], bilinear_attrs())?;

    // correction factor: what the snap took away comes back on coordinates
    let hf = b.wire(&n("pre.hf"), "Cast", &[&dim_h], vec![cast_to(DataType::Float)])?;
    let hsf = b.wire(&n("pre.hsf"), "Cast", &[&hs], vec![cast_to(DataType::Float)])?;
    let rh = b.wire(&n("pre.rh"), "Div", &[&hf, &hsf], vec![])?;
    let wf = b.wire(&n("pre.wf"), "Cast", &[&dim_w], vec![cast_to(DataType::Float)])?;
    let wsf = b.wire(&n("pre.wsf"), "Cast", &[&ws], vec![cast_to(DataType::Float)])?;
    let rw = b.wire(&n("pre.rw"), "Div", &[&wf, &wsf], vec![])?;

    let cell = b.konst(tensor::scalar_f32(&n("cell"), (8.0 / scale) as f32))?;
    let fx = b.wire(&n("pre.fx"), "Mul", &[&rw, &cell], vec![])?;
    let fy = b.wire(&n("pre.fy"), "Mul", &[&rh, &cell], vec![])?;
    let fx1 = b.wire(&n("pre.fx1"), "Unsqueeze", &[&fx], vec![axes0()])?;
    let fy1 = b.wire(&n("pre.fy1"), "Unsqueeze", &[&fy], vec![axes0()])?;
    let factor = b.wire(
        &n("pre.factor"),
        "Concat",
        &[&fx1, &fy1],
        vec![AttributeProto::int("axis", 0)],
    )?;
    Ok((snapped, factor))
}

fn cast_to(dt: DataType) -> AttributeProto {
    AttributeProto::int("to", dt as i64)
}

#[cfg(test)]
mod tests {
    use super::*;
    use xfeat_onnx::checker::check_model;
    use xfeat_onnx::model::structure;

    #[test]
    fn static_dualscale_signature() {
        let model = DenseGraph::default().build(11).unwrap();
        check_model(&model).unwrap();
        let lines = structure(&model).join("\n");
        assert!(lines.contains("input images FLOAT 1x3x640x640"), "{lines}");
        assert!(lines.contains("output mkpts FLOAT 1x100x2"), "{lines}");
        assert!(lines.contains("output feats FLOAT 1x100x64"), "{lines}");
        assert!(lines.contains("output sc FLOAT 1x100"), "{lines}");
    }

    #[test]
    fn budget_splits_20_80_with_truncation() {
        assert_eq!(DenseGraph::default().budgets(), (20, 80));
        let odd = DenseGraph { top_k: 101, ..DenseGraph::default() };
        assert_eq!(odd.budgets(), (20, 80));
        let model = odd.build(11).unwrap();
        let graph = model.graph.unwrap();
        let k_of = |name: &str| {
            let t = graph.initializer.iter().find(|t| t.name == name).unwrap();
            xfeat_onnx::tensor::to_i64(t).unwrap().into_raw_vec_and_offset().0
        };
        assert_eq!(k_of("s1.k"), [20]);
        assert_eq!(k_of("s2.k"), [80]);
    }

    #[test]
    fn static_export_bypasses_the_stride_fit() {
        let model = DenseGraph::default().build(11).unwrap();
        let graph = model.graph.unwrap();
        assert!(graph.node.iter().all(|n| n.name != "s1.pre"));
        assert!(graph.initializer.iter().any(|t| t.name == "s1.cell"));
    }

    #[test]
    fn dynamic_export_fits_the_stride_in_graph() {
        let model = DenseGraph { dynamic: true, ..DenseGraph::default() }.build(11).unwrap();
        check_model(&model).unwrap();
        let graph = model.graph.unwrap();
        assert!(graph.node.iter().any(|n| n.name == "s1.pre" && n.op_type == "Resize"));
        assert!(graph.node.iter().any(|n| n.name == "s2.pre.factor"));
    }

    #[test]
    fn scales_share_one_set_of_weights() {
        let model = DenseGraph::default().build(11).unwrap();
        let graph = model.graph.unwrap();
        let w = "net.block1.0.layer.0.weight";
        assert_eq!(graph.initializer.iter().filter(|t| t.name == w).count(), 1);
        for node in ["s1.block1.0.conv", "s2.block1.0.conv"] {
            let node = graph.node.iter().find(|n| n.name == node).unwrap();
            assert_eq!(node.input[1], w);
        }
    }

    #[test]
    fn keypoint_head_stays_out_of_the_dense_export() {
        let model = DenseGraph::default().build(11).unwrap();
        let graph = model.graph.unwrap();
        assert!(graph.node.iter().all(|n| !n.name.contains("keypoint_head")));
        assert!(graph.initializer.iter().all(|t| !t.name.contains("keypoint_head")));
    }

    #[test]
    fn old_opsets_are_rejected_with_a_version_hint() {
        let model = DenseGraph::default().build(9).unwrap();
        let err = format!("{:?}", check_model(&model).unwrap_err());
        assert!(err.contains("requires opset >= 10"), "{err}");
        assert!(err.contains("model imports opset 9"), "{err}");
    }
}
