//! Placeholder parameter synthesis.
//!
//! The exporter has no trained checkpoint to embed, and does not need one:
//! downstream tooling consumes the exported files for their structure. The
//! synthesizer produces tensors with the exact names, shapes and dtypes the
//! trained networks would have, filled with fan-in scaled normal draws so
//! that the graphs stay numerically unremarkable end to end.

use ndarray::{Array1, Array2, Array4, ArrayD, IxDyn};
use rand::rngs::SmallRng;
use rand::{Rng, SeedableRng};
use rand_distr::StandardNormal;
use xfeat_onnx::internal::*;
use xfeat_onnx::pb::TensorProto;

pub struct ParamSynth {
    rng: SmallRng,
}

impl Default for ParamSynth {
    fn default() -> ParamSynth {
        ParamSynth::new()
    }
}

impl ParamSynth {
    pub fn new() -> ParamSynth {
        ParamSynth { rng: SmallRng::from_entropy() }
    }

    /// Reproducible variant for tests.
    pub fn seeded(seed: u64) -> ParamSynth {
        ParamSynth { rng: SmallRng::seed_from_u64(seed) }
    }

    /// OIHW convolution kernel, scaled by 1/sqrt(fan_in).
    pub fn conv_weight(&mut self, name: &str, co: usize, ci: usize, k: usize) -> TensorProto {
        let scale = 1.0 / ((ci * k * k) as f32).sqrt();
        let rng = &mut self.rng;
        let array = Array4::from_shape_fn((co, ci, k, k), |_| {
            let v: f32 = rng.sample(StandardNormal);
            v * scale
        });
        tensor::from_f32(name, &array)
    }

    /// Linear weight laid out (in, out) for a plain MatMul.
    pub fn linear_weight(&mut self, name: &str, ci: usize, co: usize) -> TensorProto {
        let scale = 1.0 / (ci as f32).sqrt();
        let rng = &mut self.rng;
        let array = Array2::from_shape_fn((ci, co), |_| {
            let v: f32 = rng.sample(StandardNormal);
            v * scale
        });
        tensor::from_f32(name, &array)
    }

    pub fn bias(&mut self, name: &str, c: usize) -> TensorProto {
        tensor::vec_f32(name, &vec![0.0; c])
    }

    /// Identity scale/shift/mean/variance bundle for a BatchNormalization
    /// node, in that input order.
    pub fn batch_norm(&mut self, prefix: &str, c: usize) -> [TensorProto; 4] {
        [
            tensor::vec_f32(&format!("{prefix}.weight"), &vec![1.0; c]),
            tensor::vec_f32(&format!("{prefix}.bias"), &vec![0.0; c]),
            tensor::vec_f32(&format!("{prefix}.running_mean"), &vec![0.0; c]),
            tensor::vec_f32(&format!("{prefix}.running_var"), &vec![1.0; c]),
        ]
    }

    /// Identity scale/shift pair for a LayerNormalization node.
    pub fn layer_norm(&mut self, prefix: &str, c: usize) -> [TensorProto; 2] {
        [
            tensor::vec_f32(&format!("{prefix}.weight"), &vec![1.0; c]),
            tensor::vec_f32(&format!("{prefix}.bias"), &vec![0.0; c]),
        ]
    }

    /// Standard normal tensor of arbitrary shape. Used for example inputs.
    pub fn randn(&mut self, name: &str, dims: &[usize]) -> TensorProto {
        let rng = &mut self.rng;
        let array = ArrayD::from_shape_fn(IxDyn(dims), |_| rng.sample::<f32, _>(StandardNormal));
        tensor::from_f32(name, &array)
    }

    pub fn zeros(&mut self, name: &str, dims: &[usize]) -> TensorProto {
        let array = ArrayD::from_elem(IxDyn(dims), 0f32);
        tensor::from_f32(name, &array)
    }

    /// Uniform draw in `[lo, hi)`, rank 1. Only tests and example inputs
    /// care about the values.
    pub fn uniform(&mut self, name: &str, n: usize, lo: f32, hi: f32) -> TensorProto {
        let rng = &mut self.rng;
        let array = Array1::from_shape_fn(n, |_| rng.gen_range(lo..hi));
        tensor::from_f32(name, &array)
    }
}

/// A Linear layer, registered as a MatMul weight laid out (in, out) plus a
/// bias vector, and wired as `{name}.mm` / `{name}`.
pub(crate) struct LinearParams {
    w: Wire,
    bias: Wire,
}

impl LinearParams {
    pub(crate) fn register(
        b: &mut GraphBuilder,
        synth: &mut ParamSynth,
        name: &str,
        ci: usize,
        co: usize,
    ) -> XfeatResult<LinearParams> {
        Ok(LinearParams {
            w: b.konst(synth.linear_weight(&format!("{name}.weight"), ci, co))?,
            bias: b.konst(synth.bias(&format!("{name}.bias"), co))?,
        })
    }

    pub(crate) fn wire(&self, b: &mut GraphBuilder, name: &str, input: &Wire) -> XfeatResult<Wire> {
        let mm = b.wire(&format!("{name}.mm"), "MatMul", &[input, &self.w], vec![])?;
        b.wire(name, "Add", &[&mm, &self.bias], vec![])
    }
}
