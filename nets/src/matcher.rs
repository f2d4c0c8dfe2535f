//! The matcher-only export.
//!
//! The full model's forward pass wants raw images; this variant instead
//! accepts pre-extracted keypoints, descriptors and scale tags for two
//! images, exactly as the dual-scale export produces them. Coarse matching
//! is mutual cosine argmax over the descriptors; matches are then refined
//! by an MLP that predicts a sub-cell offset for the first image's points
//! plus a confidence, and pairs below a fixed confidence of 0.25 are
//! dropped.
//!
//! Selection runs on the first batch element, so `batch_indexes` is a zero
//! tag per surviving match.

use xfeat_onnx::internal::*;
use xfeat_onnx::pb::{AttributeProto, ModelProto};

use crate::DESCRIPTOR_DIM;
use crate::params::{LinearParams, ParamSynth};

/// Confidence floor of the refinement pass.
const FINE_CONF: f32 = 0.25;
/// Softmax temperature over predicted offset cells.
const TEMPERATURE: f32 = 3.0;

/// `mkpts0/feats0/sc0` and `mkpts1/feats1/sc1` in, `matches` and
/// `batch_indexes` out.
#[derive(Clone, Debug)]
pub struct MatcherGraph {
    pub top_k: i64,
    pub dynamic: bool,
}

impl Default for MatcherGraph {
    fn default() -> MatcherGraph {
        MatcherGraph { top_k: 100, dynamic: false }
    }
}

/// The fine matcher: Linear(128,512) + three Linear(512,512), each with
/// BatchNormalization and Relu, then Linear(512,64) producing offset cell
/// logits on an 8x8 grid.
struct FineParams {
    layers: [(LinearParams, [Wire; 4]); 4],
    out: LinearParams,
}

impl FineParams {
    fn register(b: &mut GraphBuilder, synth: &mut ParamSynth) -> XfeatResult<FineParams> {
        let layer = |b: &mut GraphBuilder, synth: &mut ParamSynth, seq: usize, ci: usize| {
            let lin =
                LinearParams::register(b, synth, &format!("net.fine_matcher.{seq}"), ci, 512)?;
            let [scale, shift, mean, var] =
                synth.batch_norm(&format!("net.fine_matcher.{}", seq + 1), 512);
            let bn = [b.konst(scale)?, b.konst(shift)?, b.konst(mean)?, b.konst(var)?];
            Ok::<_, anyhow::Error>((lin, bn))
        };
        Ok(FineParams {
            layers: [
                layer(b, synth, 0, 2 * DESCRIPTOR_DIM as usize)?,
                layer(b, synth, 3, 512)?,
                layer(b, synth, 6, 512)?,
                layer(b, synth, 9, 512)?,
            ],
            out: LinearParams::register(b, synth, "net.fine_matcher.12", 512, 64)?,
        })
    }

    fn wire(&self, b: &mut GraphBuilder, input: &Wire) -> XfeatResult<Wire> {
        let mut x = input.clone();
        for (i, (lin, bn)) in self.layers.iter().enumerate() {
            let name = format!("fine.{i}");
            let y = lin.wire(b, &format!("{name}.lin"), &x)?;
            let y = b.wire(
                &format!("{name}.bn"),
                "BatchNormalization",
                &[&y, &bn[0], &bn[1], &bn[2], &bn[3]],
                vec![AttributeProto::float("epsilon", 1e-5)],
            )?;
            x = b.wire(&name, "Relu", &[&y], vec![])?;
        }
        self.out.wire(b, "refine.offsets", &x)
    }
}

impl MatcherGraph {
    pub fn build(&self, opset: i64) -> XfeatResult<ModelProto> {
        let k = self.top_k;
        let mut b = GraphBuilder::new("xfeat_matcher");
        let mut synth = ParamSynth::new();
        let fine = FineParams::register(&mut b, &mut synth)?;

        let mkpts0 = b.source("mkpts0", DataType::Float, &self.kpts_dims())?;
        let feats0 = b.source("feats0", DataType::Float, &self.desc_dims())?;
        let sc0 = b.source("sc0", DataType::Float, &self.tag_dims())?;
        let mkpts1 = b.source("mkpts1", DataType::Float, &self.kpts_dims())?;
        let feats1 = b.source("feats1", DataType::Float, &self.desc_dims())?;
        let _sc1 = b.source("sc1", DataType::Float, &self.tag_dims())?;

        // mutual argmax over the cosine similarity of unit descriptors
        let ft1 = b.wire(
            "match.ft1",
            "Transpose",
            &[&feats1],
            vec![AttributeProto::ints("perm", &[0, 2, 1])],
        )?;
        let sim = b.wire("match.sim", "MatMul", &[&feats0, &ft1], vec![])?;
        let argmax = |ax: i64| {
            vec![AttributeProto::int("axis", ax), AttributeProto::int("keepdims", 0)]
        };
        let m12 = b.wire("match.m12", "ArgMax", &[&sim], argmax(2))?;
        let m21 = b.wire("match.m21", "ArgMax", &[&sim], argmax(1))?;
        let back = b.wire(
            "match.back",
            "GatherElements",
            &[&m21, &m12],
            vec![AttributeProto::int("axis", 1)],
        )?;
        let arange = b.konst(tensor::vec_i64("match.arange", &(0..k).collect::<Vec<i64>>()))?;
        let mutual = b.wire("match.mutual", "Equal", &[&back, &arange], vec![])?;
        let axes0 = || AttributeProto::ints("axes", &[0]);
        let mask = b.wire("match.mask", "Squeeze", &[&mutual], vec![axes0()])?;
        let nz = b.wire("match.nz", "NonZero", &[&mask], vec![])?;
        let idx0 = b.wire("match.idx0", "Squeeze", &[&nz], vec![axes0()])?;
        let m12f = b.wire("match.m12f", "Squeeze", &[&m12], vec![axes0()])?;
        let idx1 = b.wire("match.idx1", "Gather", &[&m12f, &idx0], vec![])?;

        // rows of the mutual matches
        let pick = |b: &mut GraphBuilder, name: &str, src: &Wire, idx: &Wire| {
            let flat = b.wire(&format!("{name}.flat"), "Squeeze", &[src], vec![axes0()])?;
            b.wire(name, "Gather", &[&flat, idx], vec![])
        };
        let f0 = pick(&mut b, "sel.f0", &feats0, &idx0)?;
        let f1 = pick(&mut b, "sel.f1", &feats1, &idx1)?;
        let p0 = pick(&mut b, "sel.p0", &mkpts0, &idx0)?;
        let p1 = pick(&mut b, "sel.p1", &mkpts1, &idx1)?;
        let s0 = pick(&mut b, "sel.s0", &sc0, &idx0)?;
        let pair = b.wire(
            "refine.pair",
            "Concat",
            &[&f0, &f1],
            vec![AttributeProto::int("axis", 1)],
        )?;

        let offsets = fine.wire(&mut b, &pair)?;

        // expected sub-cell offset and its confidence
        let temp = b.konst(tensor::scalar_f32("refine.temp", TEMPERATURE))?;
        let sharp = b.wire("refine.sharp", "Mul", &[&offsets, &temp], vec![])?;
        let soft = b.wire("refine.soft", "Softmax", &[&sharp], vec![AttributeProto::int("axis", 1)])?;
        let conf = b.wire(
            "refine.conf",
            "ReduceMax",
            &[&soft],
            vec![AttributeProto::ints("axes", &[1]), AttributeProto::int("keepdims", 0)],
        )?;
        // the 64 logits index an 8x8 cell grid centered on the keypoint
        let gridx: Vec<f32> = (0..64).map(|i| (i % 8 - 4) as f32).collect();
        let gridy: Vec<f32> = (0..64).map(|i| (i / 8 - 4) as f32).collect();
        let gx = b.konst(tensor::vec_f32("refine.gridx", &gridx))?;
        let gy = b.konst(tensor::vec_f32("refine.gridy", &gridy))?;
        let wx = b.wire("refine.wx", "Mul", &[&soft, &gx], vec![])?;
        let wy = b.wire("refine.wy", "Mul", &[&soft, &gy], vec![])?;
        let sum_axes =
            || vec![AttributeProto::ints("axes", &[1]), AttributeProto::int("keepdims", 0)];
        let offx = b.wire("refine.offx", "ReduceSum", &[&wx], sum_axes())?;
        let offy = b.wire("refine.offy", "ReduceSum", &[&wy], sum_axes())?;
        let axes1 = || AttributeProto::ints("axes", &[1]);
        let offx1 = b.wire("refine.offx1", "Unsqueeze", &[&offx], vec![axes1()])?;
        let offy1 = b.wire("refine.offy1", "Unsqueeze", &[&offy], vec![axes1()])?;
        let off = b.wire(
            "refine.off",
            "Concat",
            &[&offx1, &offy1],
            vec![AttributeProto::int("axis", 1)],
        )?;
        let s0u = b.wire("refine.s0u", "Unsqueeze", &[&s0], vec![axes1()])?;
        let scaled = b.wire("refine.scaledoff", "Mul", &[&off, &s0u], vec![])?;
        let refined = b.wire("refine.p0fine", "Add", &[&p0, &scaled], vec![])?;

        // confidence gate
        let thr = b.konst(tensor::scalar_f32("refine.thr", FINE_CONF))?;
        let good = b.wire("refine.good", "Greater", &[&conf, &thr], vec![])?;
        let goodnz = b.wire("refine.goodnz", "NonZero", &[&good], vec![])?;
        let sel = b.wire("refine.sel", "Squeeze", &[&goodnz], vec![axes0()])?;
        let q0 = b.wire("refine.q0", "Gather", &[&refined, &sel], vec![])?;
        let q1 = b.wire("refine.q1", "Gather", &[&p1, &sel], vec![])?;
        let matches =
            b.wire("matches", "Concat", &[&q0, &q1], vec![AttributeProto::int("axis", 1)])?;
        let bshape = b.wire("batch.shape", "Shape", &[&sel], vec![])?;
        let zero = AttributeProto::tensor("value", tensor::vec_i64("", &[0]));
        let batch = b.wire("batch_indexes", "ConstantOfShape", &[&bshape], vec![zero])?;

        b.output(&matches, DataType::Float, &[Dim::sym("num_matches"), Dim::Fixed(4)])?;
        b.output(&batch, DataType::Int64, &[Dim::sym("num_matches")])?;
        b.into_model(opset)
    }

    fn kpts_dims(&self) -> TVec<Dim> {
        if self.dynamic {
            tvec!(Dim::sym("batch"), Dim::sym("num_keypoints"), Dim::Fixed(2))
        } else {
            fixed(&[1, self.top_k, 2])
        }
    }

    fn desc_dims(&self) -> TVec<Dim> {
        if self.dynamic {
            tvec!(Dim::sym("batch"), Dim::sym("num_keypoints"), Dim::sym("descriptor_size"))
        } else {
            fixed(&[1, self.top_k, DESCRIPTOR_DIM])
        }
    }

    fn tag_dims(&self) -> TVec<Dim> {
        if self.dynamic {
            tvec!(Dim::sym("batch"), Dim::sym("num_keypoints"))
        } else {
            fixed(&[1, self.top_k])
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use xfeat_onnx::checker::check_model;
    use xfeat_onnx::model::structure;

    #[test]
    fn matcher_signature_is_bound_in_order() {
        let model = MatcherGraph::default().build(11).unwrap();
        check_model(&model).unwrap();
        let graph = model.graph.as_ref().unwrap();
        let names: Vec<&str> = graph.input.iter().map(|i| i.name.as_str()).collect();
        assert_eq!(names, ["mkpts0", "feats0", "sc0", "mkpts1", "feats1", "sc1"]);
        let lines = structure(&model).join("\n");
        assert!(lines.contains("input mkpts0 FLOAT 1x100x2"), "{lines}");
        assert!(lines.contains("input feats0 FLOAT 1x100x64"), "{lines}");
        assert!(lines.contains("input sc0 FLOAT 1x100"), "{lines}");
        assert!(lines.contains("output matches FLOAT num_matchesx4"), "{lines}");
        assert!(lines.contains("output batch_indexes INT64 num_matches"), "{lines}");
    }

    #[test]
    fn dynamic_signature_frees_the_keypoint_count() {
        let model = MatcherGraph { dynamic: true, ..MatcherGraph::default() }.build(11).unwrap();
        check_model(&model).unwrap();
        let lines = structure(&model).join("\n");
        assert!(lines.contains("input mkpts0 FLOAT batchxnum_keypointsx2"), "{lines}");
        assert!(
            lines.contains("input feats0 FLOAT batchxnum_keypointsxdescriptor_size"),
            "{lines}"
        );
    }

    #[test]
    fn refinement_constants_are_fixed() {
        let model = MatcherGraph::default().build(11).unwrap();
        let graph = model.graph.unwrap();
        let scalar = |name: &str| {
            let t = graph.initializer.iter().find(|t| t.name == name).unwrap();
            xfeat_onnx::tensor::to_f32(t).unwrap().sum()
        };
        assert_eq!(scalar("refine.thr"), 0.25);
        assert_eq!(scalar("refine.temp"), 3.0);
        let w = graph.initializer.iter().find(|t| t.name == "net.fine_matcher.0.weight").unwrap();
        assert_eq!(w.dims, vec![128, 512]);
        let out = graph.initializer.iter().find(|t| t.name == "net.fine_matcher.12.weight").unwrap();
        assert_eq!(out.dims, vec![512, 64]);
    }

    #[test]
    fn second_scale_tag_is_accepted_but_unread() {
        let model = MatcherGraph::default().build(11).unwrap();
        let graph = model.graph.unwrap();
        assert!(graph.input.iter().any(|i| i.name == "sc1"));
        assert!(graph.node.iter().all(|n| n.input.iter().all(|i| i != "sc1")));
    }

    #[test]
    fn mutuality_is_checked_against_the_identity() {
        let model = MatcherGraph { top_k: 8, ..MatcherGraph::default() }.build(11).unwrap();
        let graph = model.graph.unwrap();
        let eq = graph.node.iter().find(|n| n.name == "match.mutual").unwrap();
        assert_eq!(eq.op_type, "Equal");
        assert_eq!(eq.input, ["match.back", "match.arange"]);
        let arange = graph.initializer.iter().find(|t| t.name == "match.arange").unwrap();
        let values = xfeat_onnx::tensor::to_i64(arange).unwrap();
        assert_eq!(values.iter().copied().collect::<Vec<i64>>(), (0..8).collect::<Vec<i64>>());
    }
}
