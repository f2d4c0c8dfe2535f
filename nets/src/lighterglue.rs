//! The full matching pipeline export.
//!
//! LighterGlue is a trimmed LightGlue operating on 64-dimensional XFeat
//! descriptors: six transformer layers of rotary-encoded self attention and
//! bidirectional cross attention, a log double-softmax assignment with
//! dustbins, and mutual-argmax filtering at a fixed score threshold of 0.1.
//!
//! Unlike the other variants this graph is pinned to
//! [`LighterGlueGraph::OPSET`]; the CLI's opset selection does not apply to
//! it. Everything is static at batch 1 with `top_k` keypoints per side.

use xfeat_onnx::internal::*;
use xfeat_onnx::pb::{AttributeProto, ModelProto};

use crate::DESCRIPTOR_DIM;
use crate::params::{LinearParams, ParamSynth};

const LAYERS: usize = 6;
const HEADS: i64 = 4;
const HEAD_DIM: i64 = DESCRIPTOR_DIM / HEADS;
/// Mutual matches below this assignment score are discarded.
const FILTER_THRESHOLD: f32 = 0.1;

/// `keypoints0/1`, `descriptors0/1`, `image_size0/1` in; `log_assignment`,
/// `matches0/1` and `matching_scores0/1` out.
#[derive(Clone, Debug)]
pub struct LighterGlueGraph {
    pub top_k: i64,
}

impl Default for LighterGlueGraph {
    fn default() -> LighterGlueGraph {
        LighterGlueGraph { top_k: 100 }
    }
}

fn unsqueeze(b: &mut GraphBuilder, name: &str, x: &Wire, axes: &[i64]) -> XfeatResult<Wire> {
    let ax = b.konst_i64s(&format!("{name}.axes"), axes)?;
    b.wire(name, "Unsqueeze", &[x, &ax], vec![])
}

fn slice(
    b: &mut GraphBuilder,
    name: &str,
    x: &Wire,
    starts: &[i64],
    ends: &[i64],
    axes: &[i64],
) -> XfeatResult<Wire> {
    let s = b.konst_i64s(&format!("{name}.starts"), starts)?;
    let e = b.konst_i64s(&format!("{name}.ends"), ends)?;
    let a = b.konst_i64s(&format!("{name}.axes"), axes)?;
    b.wire(name, "Slice", &[x, &s, &e, &a], vec![])
}

/// (1, K, H*hd) -> (1, H, K, hd)
fn heads(b: &mut GraphBuilder, name: &str, x: &Wire) -> XfeatResult<Wire> {
    let shape = b.konst_i64s(&format!("{name}.shape"), &[0, 0, HEADS, HEAD_DIM])?;
    let split = b.wire(&format!("{name}.split"), "Reshape", &[x, &shape], vec![])?;
    b.wire(name, "Transpose", &[&split], vec![AttributeProto::ints("perm", &[0, 2, 1, 3])])
}

/// (1, H, K, hd) -> (1, K, H*hd)
fn merge_heads(b: &mut GraphBuilder, name: &str, x: &Wire) -> XfeatResult<Wire> {
    let t = b.wire(
        &format!("{name}.t"),
        "Transpose",
        &[x],
        vec![AttributeProto::ints("perm", &[0, 2, 1, 3])],
    )?;
    let shape = b.konst_i64s(&format!("{name}.shape"), &[0, 0, DESCRIPTOR_DIM])?;
    b.wire(name, "Reshape", &[&t, &shape], vec![])
}

/// Rotary position application in half-block layout: the upper half of each
/// head is negated and swapped below the lower one, so slots i and i+hd/2
/// share a frequency.
fn rotary(b: &mut GraphBuilder, name: &str, x: &Wire, cos: &Wire, sin: &Wire) -> XfeatResult<Wire> {
    let lo = slice(b, &format!("{name}.lo"), x, &[0], &[HEAD_DIM / 2], &[3])?;
    let hi = slice(b, &format!("{name}.hi"), x, &[HEAD_DIM / 2], &[HEAD_DIM], &[3])?;
    let neg = b.wire(&format!("{name}.neg"), "Neg", &[&hi], vec![])?;
    let rot = b.wire(
        &format!("{name}.rot"),
        "Concat",
        &[&neg, &lo],
        vec![AttributeProto::int("axis", 3)],
    )?;
    let xc = b.wire(&format!("{name}.cos"), "Mul", &[x, cos], vec![])?;
    let xs = b.wire(&format!("{name}.sin"), "Mul", &[&rot, sin], vec![])?;
    b.wire(name, "Add", &[&xc, &xs], vec![])
}

fn gelu(b: &mut GraphBuilder, name: &str, x: &Wire) -> XfeatResult<Wire> {
    let rsqrt2 = b.konst_scalar_f32(&format!("{name}.rsqrt2"), std::f32::consts::FRAC_1_SQRT_2)?;
    let one = b.konst_scalar_f32(&format!("{name}.one"), 1.0)?;
    let half = b.konst_scalar_f32(&format!("{name}.half"), 0.5)?;
    let arg = b.wire(&format!("{name}.arg"), "Mul", &[x, &rsqrt2], vec![])?;
    let erf = b.wire(&format!("{name}.erf"), "Erf", &[&arg], vec![])?;
    let shift = b.wire(&format!("{name}.shift"), "Add", &[&erf, &one], vec![])?;
    let prod = b.wire(&format!("{name}.prod"), "Mul", &[x, &shift], vec![])?;
    b.wire(name, "Mul", &[&prod, &half], vec![])
}

fn log_sigmoid(b: &mut GraphBuilder, name: &str, x: &Wire) -> XfeatResult<Wire> {
    let sig = b.wire(&format!("{name}.sig"), "Sigmoid", &[x], vec![])?;
    b.wire(name, "Log", &[&sig], vec![])
}

/// Linear + LayerNorm + GELU + Linear over the concatenation of a stream
/// and its message, with a residual connection on the stream.
struct FfnParams {
    lin0: LinearParams,
    norm: [Wire; 2],
    lin1: LinearParams,
}

impl FfnParams {
    fn register(b: &mut GraphBuilder, synth: &mut ParamSynth, name: &str) -> XfeatResult<FfnParams> {
        let d = DESCRIPTOR_DIM as usize;
        let [scale, shift] = synth.layer_norm(&format!("{name}.1"), 2 * d);
        Ok(FfnParams {
            lin0: LinearParams::register(b, synth, &format!("{name}.0"), 2 * d, 2 * d)?,
            norm: [b.konst(scale)?, b.konst(shift)?],
            lin1: LinearParams::register(b, synth, &format!("{name}.3"), 2 * d, d)?,
        })
    }

    fn wire(&self, b: &mut GraphBuilder, name: &str, x: &Wire, message: &Wire) -> XfeatResult<Wire> {
        let cat = b.wire(
            &format!("{name}.ffn.cat"),
            "Concat",
            &[x, message],
            vec![AttributeProto::int("axis", 2)],
        )?;
        let h = self.lin0.wire(b, &format!("{name}.ffn.lin0"), &cat)?;
        let ln = b.wire(
            &format!("{name}.ffn.norm"),
            "LayerNormalization",
            &[&h, &self.norm[0], &self.norm[1]],
            vec![AttributeProto::float("epsilon", 1e-5)],
        )?;
        let g = gelu(b, &format!("{name}.ffn.gelu"), &ln)?;
        let out = self.lin1.wire(b, &format!("{name}.ffn.lin1"), &g)?;
        b.wire(name, "Add", &[x, &out], vec![])
    }
}

struct SelfParams {
    qkv: LinearParams,
    proj: LinearParams,
    ffn: FfnParams,
}

impl SelfParams {
    fn register(b: &mut GraphBuilder, synth: &mut ParamSynth, name: &str) -> XfeatResult<SelfParams> {
        let d = DESCRIPTOR_DIM as usize;
        Ok(SelfParams {
            qkv: LinearParams::register(b, synth, &format!("{name}.Wqkv"), d, 3 * d)?,
            proj: LinearParams::register(b, synth, &format!("{name}.out_proj"), d, d)?,
            ffn: FfnParams::register(b, synth, &format!("{name}.ffn"))?,
        })
    }

    fn wire(
        &self,
        b: &mut GraphBuilder,
        name: &str,
        x: &Wire,
        cos: &Wire,
        sin: &Wire,
    ) -> XfeatResult<Wire> {
        let d = DESCRIPTOR_DIM;
        let qkv = self.qkv.wire(b, &format!("{name}.qkv"), x)?;
        let q = slice(b, &format!("{name}.q"), &qkv, &[0], &[d], &[2])?;
        let k = slice(b, &format!("{name}.k"), &qkv, &[d], &[2 * d], &[2])?;
        let v = slice(b, &format!("{name}.v"), &qkv, &[2 * d], &[3 * d], &[2])?;
        let qh = heads(b, &format!("{name}.qh"), &q)?;
        let kh = heads(b, &format!("{name}.kh"), &k)?;
        let vh = heads(b, &format!("{name}.vh"), &v)?;
        let qr = rotary(b, &format!("{name}.qr"), &qh, cos, sin)?;
        let kr = rotary(b, &format!("{name}.kr"), &kh, cos, sin)?;

        let kt = b.wire(
            &format!("{name}.kt"),
            "Transpose",
            &[&kr],
            vec![AttributeProto::ints("perm", &[0, 1, 3, 2])],
        )?;
        let logits = b.wire(&format!("{name}.logits"), "MatMul", &[&qr, &kt], vec![])?;
        let scale =
            b.konst_scalar_f32(&format!("{name}.scale"), 1.0 / (HEAD_DIM as f32).sqrt())?;
        let scaled = b.wire(&format!("{name}.scaled"), "Mul", &[&logits, &scale], vec![])?;
        let attn = b.wire(
            &format!("{name}.attn"),
            "Softmax",
            &[&scaled],
            vec![AttributeProto::int("axis", 3)],
        )?;
        let mix = b.wire(&format!("{name}.mix"), "MatMul", &[&attn, &vh], vec![])?;
        let ctx = merge_heads(b, &format!("{name}.ctx"), &mix)?;
        let msg = self.proj.wire(b, &format!("{name}.proj"), &ctx)?;
        self.ffn.wire(b, name, x, &msg)
    }
}

struct CrossParams {
    qk: LinearParams,
    v: LinearParams,
    out: LinearParams,
    ffn: FfnParams,
}

impl CrossParams {
    fn register(
        b: &mut GraphBuilder,
        synth: &mut ParamSynth,
        name: &str,
    ) -> XfeatResult<CrossParams> {
        let d = DESCRIPTOR_DIM as usize;
        Ok(CrossParams {
            qk: LinearParams::register(b, synth, &format!("{name}.to_qk"), d, d)?,
            v: LinearParams::register(b, synth, &format!("{name}.to_v"), d, d)?,
            out: LinearParams::register(b, synth, &format!("{name}.to_out"), d, d)?,
            ffn: FfnParams::register(b, synth, &format!("{name}.ffn"))?,
        })
    }

    /// One projection serves both directions; attention weights are the
    /// row and column softmaxes of a single similarity.
    fn wire(
        &self,
        b: &mut GraphBuilder,
        name: &str,
        x0: &Wire,
        x1: &Wire,
    ) -> XfeatResult<(Wire, Wire)> {
        let qk0 = self.qk.wire(b, &format!("{name}.qk0"), x0)?;
        let qk1 = self.qk.wire(b, &format!("{name}.qk1"), x1)?;
        let v0 = self.v.wire(b, &format!("{name}.v0"), x0)?;
        let v1 = self.v.wire(b, &format!("{name}.v1"), x1)?;
        let qk0h = heads(b, &format!("{name}.qk0h"), &qk0)?;
        let qk1h = heads(b, &format!("{name}.qk1h"), &qk1)?;
        let v0h = heads(b, &format!("{name}.v0h"), &v0)?;
        let v1h = heads(b, &format!("{name}.v1h"), &v1)?;

        let kt = b.wire(
            &format!("{name}.kt"),
            "Transpose",
            &[&qk1h],
            vec![AttributeProto::ints("perm", &[0, 1, 3, 2])],
        )?;
        let logits = b.wire(&format!("{name}.logits"), "MatMul", &[&qk0h, &kt], vec![])?;
        let scale =
            b.konst_scalar_f32(&format!("{name}.scale"), 1.0 / (HEAD_DIM as f32).sqrt())?;
        let scaled = b.wire(&format!("{name}.scaled"), "Mul", &[&logits, &scale], vec![])?;
        let a01 = b.wire(
            &format!("{name}.a01"),
            "Softmax",
            &[&scaled],
            vec![AttributeProto::int("axis", 3)],
        )?;
        let m0h = b.wire(&format!("{name}.m0h"), "MatMul", &[&a01, &v1h], vec![])?;
        let simt = b.wire(
            &format!("{name}.simt"),
            "Transpose",
            &[&scaled],
            vec![AttributeProto::ints("perm", &[0, 1, 3, 2])],
        )?;
        let a10 = b.wire(
            &format!("{name}.a10"),
            "Softmax",
            &[&simt],
            vec![AttributeProto::int("axis", 3)],
        )?;
        let m1h = b.wire(&format!("{name}.m1h"), "MatMul", &[&a10, &v0h], vec![])?;

        let m0 = merge_heads(b, &format!("{name}.m0"), &m0h)?;
        let m1 = merge_heads(b, &format!("{name}.m1"), &m1h)?;
        let m0 = self.out.wire(b, &format!("{name}.out0"), &m0)?;
        let m1 = self.out.wire(b, &format!("{name}.out1"), &m1)?;
        let y0 = self.ffn.wire(b, &format!("{name}.y0"), x0, &m0)?;
        let y1 = self.ffn.wire(b, &format!("{name}.y1"), x1, &m1)?;
        Ok((y0, y1))
    }
}

struct LayerParams {
    self_attn: SelfParams,
    cross_attn: CrossParams,
}

impl LayerParams {
    fn register(b: &mut GraphBuilder, synth: &mut ParamSynth, i: usize) -> XfeatResult<LayerParams> {
        Ok(LayerParams {
            self_attn: SelfParams::register(b, synth, &format!("transformers.{i}.self_attn"))?,
            cross_attn: CrossParams::register(b, synth, &format!("transformers.{i}.cross_attn"))?,
        })
    }
}

impl LighterGlueGraph {
    /// The operator set this graph is written against. Input-form axes on
    /// Slice/Unsqueeze and LayerNormalization both assume it.
    pub const OPSET: i64 = 17;

    pub fn build(&self) -> XfeatResult<ModelProto> {
        let k = self.top_k;
        debug!("lighterglue: {LAYERS} layers, {k} keypoints per side, opset {}", Self::OPSET);
        let mut b = GraphBuilder::new("xfeat_lighterglue");
        let mut synth = ParamSynth::new();

        let wr = b.konst(synth.linear_weight("posenc.Wr.weight", 2, HEAD_DIM as usize / 2))?;
        let mut layers = Vec::with_capacity(LAYERS);
        for i in 0..LAYERS {
            layers.push(LayerParams::register(&mut b, &mut synth, i)?);
        }
        let final_proj = LinearParams::register(
            &mut b,
            &mut synth,
            &format!("log_assignment.{}.final_proj", LAYERS - 1),
            DESCRIPTOR_DIM as usize,
            DESCRIPTOR_DIM as usize,
        )?;
        let matchability = LinearParams::register(
            &mut b,
            &mut synth,
            &format!("log_assignment.{}.matchability", LAYERS - 1),
            DESCRIPTOR_DIM as usize,
            1,
        )?;

        let kpts0 = b.source("keypoints0", DataType::Float, &fixed(&[1, k, 2]))?;
        let kpts1 = b.source("keypoints1", DataType::Float, &fixed(&[1, k, 2]))?;
        let desc0 = b.source("descriptors0", DataType::Float, &fixed(&[1, k, DESCRIPTOR_DIM]))?;
        let desc1 = b.source("descriptors1", DataType::Float, &fixed(&[1, k, DESCRIPTOR_DIM]))?;
        let size0 = b.source("image_size0", DataType::Int32, &fixed(&[1, 2]))?;
        let size1 = b.source("image_size1", DataType::Int32, &fixed(&[1, 2]))?;

        let n0 = normalize(&mut b, 0, &kpts0, &size0)?;
        let n1 = normalize(&mut b, 1, &kpts1, &size1)?;
        let (cos0, sin0) = encode(&mut b, "enc0", &wr, &n0)?;
        let (cos1, sin1) = encode(&mut b, "enc1", &wr, &n1)?;

        let mut x0 = desc0;
        let mut x1 = desc1;
        for (i, layer) in layers.iter().enumerate() {
            let p = format!("l{i}");
            x0 = layer.self_attn.wire(&mut b, &format!("{p}.self0"), &x0, &cos0, &sin0)?;
            x1 = layer.self_attn.wire(&mut b, &format!("{p}.self1"), &x1, &cos1, &sin1)?;
            (x0, x1) = layer.cross_attn.wire(&mut b, &format!("{p}.cross"), &x0, &x1)?;
        }

        // assignment scores with dustbins
        let md0 = final_proj.wire(&mut b, "assign.md0", &x0)?;
        let md1 = final_proj.wire(&mut b, "assign.md1", &x1)?;
        let invroot =
            b.konst_scalar_f32("assign.invroot", 1.0 / (DESCRIPTOR_DIM as f32).powf(0.25))?;
        let md0s = b.wire("assign.md0s", "Mul", &[&md0, &invroot], vec![])?;
        let md1s = b.wire("assign.md1s", "Mul", &[&md1, &invroot], vec![])?;
        let md1t = b.wire(
            "assign.md1t",
            "Transpose",
            &[&md1s],
            vec![AttributeProto::ints("perm", &[0, 2, 1])],
        )?;
        let sim = b.wire("assign.sim", "MatMul", &[&md0s, &md1t], vec![])?;
        let rows = b.wire("assign.rows", "LogSoftmax", &[&sim], vec![AttributeProto::int("axis", 2)])?;
        let cols = b.wire("assign.cols", "LogSoftmax", &[&sim], vec![AttributeProto::int("axis", 1)])?;
        let z0 = matchability.wire(&mut b, "assign.z0", &x0)?;
        let z1 = matchability.wire(&mut b, "assign.z1", &x1)?;
        let z0log = log_sigmoid(&mut b, "assign.z0log", &z0)?;
        let z1log = log_sigmoid(&mut b, "assign.z1log", &z1)?;
        let z1logt = b.wire(
            "assign.z1logt",
            "Transpose",
            &[&z1log],
            vec![AttributeProto::ints("perm", &[0, 2, 1])],
        )?;
        let pair = b.wire("assign.pair", "Add", &[&rows, &cols], vec![])?;
        let cert = b.wire("assign.cert", "Add", &[&z0log, &z1logt], vec![])?;
        let interior = b.wire("assign.interior", "Add", &[&pair, &cert], vec![])?;

        let nz0 = b.wire("assign.nz0", "Neg", &[&z0], vec![])?;
        let nz1 = b.wire("assign.nz1", "Neg", &[&z1], vec![])?;
        let bin0 = log_sigmoid(&mut b, "assign.bin0", &nz0)?;
        let bin1 = log_sigmoid(&mut b, "assign.bin1", &nz1)?;
        let bin1t = b.wire(
            "assign.bin1t",
            "Transpose",
            &[&bin1],
            vec![AttributeProto::ints("perm", &[0, 2, 1])],
        )?;
        let corner =
            b.konst(tensor::from_f32("assign.corner", &ndarray::Array3::<f32>::zeros((1, 1, 1))))?;
        let top = b.wire(
            "assign.top",
            "Concat",
            &[&interior, &bin0],
            vec![AttributeProto::int("axis", 2)],
        )?;
        let bottom = b.wire(
            "assign.bottom",
            "Concat",
            &[&bin1t, &corner],
            vec![AttributeProto::int("axis", 2)],
        )?;
        let assignment = b.wire(
            "log_assignment",
            "Concat",
            &[&top, &bottom],
            vec![AttributeProto::int("axis", 1)],
        )?;

        // mutual argmax over the interior, thresholded on the exp score
        let reduce = |ax: i64| {
            vec![AttributeProto::ints("axes", &[ax]), AttributeProto::int("keepdims", 0)]
        };
        let argmax = |ax: i64| {
            vec![AttributeProto::int("axis", ax), AttributeProto::int("keepdims", 0)]
        };
        let max0 = b.wire("filter.max0", "ReduceMax", &[&interior], reduce(2))?;
        let m0 = b.wire("filter.m0", "ArgMax", &[&interior], argmax(2))?;
        let m1 = b.wire("filter.m1", "ArgMax", &[&interior], argmax(1))?;
        let arange = b.konst(tensor::vec_i64("filter.arange", &(0..k).collect::<Vec<i64>>()))?;
        let back0 = b.wire(
            "filter.back0",
            "GatherElements",
            &[&m1, &m0],
            vec![AttributeProto::int("axis", 1)],
        )?;
        let mutual0 = b.wire("filter.mutual0", "Equal", &[&back0, &arange], vec![])?;
        let back1 = b.wire(
            "filter.back1",
            "GatherElements",
            &[&m0, &m1],
            vec![AttributeProto::int("axis", 1)],
        )?;
        let mutual1 = b.wire("filter.mutual1", "Equal", &[&back1, &arange], vec![])?;
        let e0 = b.wire("filter.exp", "Exp", &[&max0], vec![])?;
        let zero = b.konst_scalar_f32("filter.zero", 0.0)?;
        let mscores0 = b.wire("matching_scores0", "Where", &[&mutual0, &e0, &zero], vec![])?;
        let pulled = b.wire(
            "filter.pull",
            "GatherElements",
            &[&mscores0, &m1],
            vec![AttributeProto::int("axis", 1)],
        )?;
        let mscores1 = b.wire("matching_scores1", "Where", &[&mutual1, &pulled, &zero], vec![])?;
        let thr = b.konst_scalar_f32("filter.threshold", FILTER_THRESHOLD)?;
        let pass = b.wire("filter.pass", "Greater", &[&mscores0, &thr], vec![])?;
        let valid0 = b.wire("filter.valid0", "And", &[&mutual0, &pass], vec![])?;
        let carry = b.wire(
            "filter.carry",
            "GatherElements",
            &[&valid0, &m1],
            vec![AttributeProto::int("axis", 1)],
        )?;
        let valid1 = b.wire("filter.valid1", "And", &[&mutual1, &carry], vec![])?;
        let none = b.konst_scalar_i64("filter.none", -1)?;
        let matches0 = b.wire("matches0", "Where", &[&valid0, &m0, &none], vec![])?;
        let matches1 = b.wire("matches1", "Where", &[&valid1, &m1, &none], vec![])?;

        b.output(&assignment, DataType::Float, &fixed(&[1, k + 1, k + 1]))?;
        b.output(&matches0, DataType::Int64, &fixed(&[1, k]))?;
        b.output(&matches1, DataType::Int64, &fixed(&[1, k]))?;
        b.output(&mscores0, DataType::Float, &fixed(&[1, k]))?;
        b.output(&mscores1, DataType::Float, &fixed(&[1, k]))?;
        b.into_model(Self::OPSET)
    }
}

/// Keypoints come in pixel coordinates; center them on the image and scale
/// by half the larger side, matching the convention the matcher was trained
/// with.
fn normalize(b: &mut GraphBuilder, tag: usize, kpts: &Wire, size: &Wire) -> XfeatResult<Wire> {
    let name = format!("norm{tag}");
    let f = b.wire(
        &format!("{name}.size"),
        "Cast",
        &[size],
        vec![AttributeProto::int("to", DataType::Float as i64)],
    )?;
    let two = b.konst_scalar_f32(&format!("{name}.two"), 2.0)?;
    let half = b.wire(&format!("{name}.half"), "Div", &[&f, &two], vec![])?;
    let shift = unsqueeze(b, &format!("{name}.shift"), &half, &[1])?;
    let m = b.wire(
        &format!("{name}.max"),
        "ReduceMax",
        &[&f],
        vec![AttributeProto::ints("axes", &[1]), AttributeProto::int("keepdims", 1)],
    )?;
    let halfmax = b.wire(&format!("{name}.halfmax"), "Div", &[&m, &two], vec![])?;
    let scale = unsqueeze(b, &format!("{name}.scale"), &halfmax, &[1])?;
    let centered = b.wire(&format!("{name}.center"), "Sub", &[kpts, &shift], vec![])?;
    b.wire(&name, "Div", &[&centered, &scale], vec![])
}

/// Learnable Fourier features for the rotary tables: project (x, y) to
/// hd/2 frequencies, duplicate across the two half-blocks, and take cos
/// and sin, shaped (1, 1, K, hd) for broadcast over heads.
fn encode(
    b: &mut GraphBuilder,
    name: &str,
    wr: &Wire,
    kpts: &Wire,
) -> XfeatResult<(Wire, Wire)> {
    let proj = b.wire(&format!("{name}.proj"), "MatMul", &[kpts, wr], vec![])?;
    let full = b.wire(
        &format!("{name}.full"),
        "Concat",
        &[&proj, &proj],
        vec![AttributeProto::int("axis", 2)],
    )?;
    let cos = b.wire(&format!("{name}.cosw"), "Cos", &[&full], vec![])?;
    let sin = b.wire(&format!("{name}.sinw"), "Sin", &[&full], vec![])?;
    let cos4 = unsqueeze(b, &format!("{name}.cos"), &cos, &[1])?;
    let sin4 = unsqueeze(b, &format!("{name}.sin"), &sin, &[1])?;
    Ok((cos4, sin4))
}
