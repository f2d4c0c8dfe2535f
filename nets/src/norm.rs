//! Input normalization variants.

use xfeat_onnx::internal::*;
use xfeat_onnx::pb::AttributeProto;

pub const DEFAULT_EPSILON: f32 = 1e-5;

/// How per-sample normalization of the image is expressed in the graph.
///
/// `Fused` is the single InstanceNormalization operator. `Split` spells the
/// same computation out as `(x - mean) / (std + epsilon)` for runtimes that
/// do not implement the fused operator, with the population standard
/// deviation and the stabilizer added outside the square root. The two
/// variants agree to within the stabilizer for unit-variance inputs; they
/// are not bit-identical.
#[derive(Clone, Copy, Debug, PartialEq)]
pub enum Normalization {
    Fused,
    Split { epsilon: f32 },
}

impl Default for Normalization {
    fn default() -> Normalization {
        Normalization::Fused
    }
}

impl Normalization {
    pub fn split() -> Normalization {
        Normalization::Split { epsilon: DEFAULT_EPSILON }
    }

    /// Wire the normalization of a (B,C,H,W) value. Emitted nodes are named
    /// `{name}.*`, with the final node carrying `name` itself.
    pub fn wire(
        &self,
        b: &mut GraphBuilder,
        name: &str,
        input: &Wire,
        channels: usize,
    ) -> XfeatResult<Wire> {
        match self {
            Normalization::Fused => {
                let scale =
                    b.konst(tensor::vec_f32(&format!("{name}.weight"), &vec![1.0; channels]))?;
                let shift =
                    b.konst(tensor::vec_f32(&format!("{name}.bias"), &vec![0.0; channels]))?;
                b.wire(
                    name,
                    "InstanceNormalization",
                    &[input, &scale, &shift],
                    vec![AttributeProto::float("epsilon", DEFAULT_EPSILON)],
                )
            }
            Normalization::Split { epsilon } => {
                let axes = AttributeProto::ints("axes", &[2, 3]);
                let mean = b.wire(&format!("{name}.mean"), "ReduceMean", &[input], vec![axes.clone()])?;
                let diff = b.wire(&format!("{name}.diff"), "Sub", &[input, &mean], vec![])?;
                let sqr = b.wire(&format!("{name}.sqr"), "Mul", &[&diff, &diff], vec![])?;
                let variance =
                    b.wire(&format!("{name}.variance"), "ReduceMean", &[&sqr], vec![axes])?;
                let std = b.wire(&format!("{name}.std"), "Sqrt", &[&variance], vec![])?;
                let eps = b.konst_scalar_f32(&format!("{name}.epsilon"), *epsilon)?;
                let denom = b.wire(&format!("{name}.denom"), "Add", &[&std, &eps], vec![])?;
                b.wire(name, "Div", &[&diff, &denom], vec![])
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::params::ParamSynth;

    fn norm_model(norm: Normalization) -> pb::ModelProto {
        let mut b = GraphBuilder::new("norm_test");
        let x = b.source("x", DataType::Float, &fixed(&[1, 1, 4, 4])).unwrap();
        let y = norm.wire(&mut b, "norm", &x, 1).unwrap();
        b.output(&y, DataType::Float, &fixed(&[1, 1, 4, 4])).unwrap();
        b.into_model(11).unwrap()
    }

    #[test]
    fn fused_is_a_single_instance_normalization() {
        let model = norm_model(Normalization::Fused);
        let graph = model.graph.unwrap();
        assert_eq!(graph.node.len(), 1);
        assert_eq!(graph.node[0].op_type, "InstanceNormalization");
        assert_eq!(graph.node[0].get_attr::<f32>("epsilon").unwrap(), DEFAULT_EPSILON);
    }

    #[test]
    fn split_spells_the_operator_out() {
        let model = norm_model(Normalization::split());
        let graph = model.graph.as_ref().unwrap();
        let ops: Vec<&str> = graph.node.iter().map(|n| n.op_type.as_str()).collect();
        assert!(!ops.contains(&"InstanceNormalization"));
        assert_eq!(ops, ["ReduceMean", "Sub", "Mul", "ReduceMean", "Sqrt", "Add", "Div"]);
        let eps = graph.initializer.iter().find(|t| t.name == "norm.epsilon").unwrap();
        let eps = xfeat_onnx::tensor::to_f32(eps).unwrap();
        assert_eq!(eps.iter().copied().collect::<Vec<f32>>(), [DEFAULT_EPSILON]);
        xfeat_onnx::checker::check_model(&model).unwrap();
    }

    // The numerical cost of splitting: with the stabilizer outside the
    // square root the result drifts by O(epsilon) for unit-scale inputs.
    #[test]
    fn split_formula_tracks_the_fused_one() {
        let t = ParamSynth::seeded(5).uniform("x", 1024, -1.5, 1.5);
        let x = xfeat_onnx::tensor::to_f32(&t).unwrap();
        let n = x.len() as f32;
        let mean = x.sum() / n;
        let var = x.iter().map(|v| (v - mean) * (v - mean)).sum::<f32>() / n;
        let worst = x
            .iter()
            .map(|v| {
                let fused = (v - mean) / (var + DEFAULT_EPSILON).sqrt();
                let split = (v - mean) / (var.sqrt() + DEFAULT_EPSILON);
                (fused - split).abs()
            })
            .fold(0f32, f32::max);
        assert!(worst < 1e-5, "worst deviation {worst}");
    }
}
