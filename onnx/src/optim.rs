//! Post-processing passes over a built model.
//!
//! Both passes anchor between reload validation and the final save, and
//! both are off in [`PostProcess::default`]. They expect a model that
//! already passed [`crate::checker::check_model`], in particular a
//! topologically sorted node list.

use crate::internal::*;
use crate::pb::tensor_proto::DataType;
use crate::pb::*;
use crate::tensor;

use half::f16;
use std::collections::HashSet;

/// Which passes run between reload validation and the final save.
#[derive(Clone, Debug, Default, PartialEq)]
pub struct PostProcess {
    pub declutter: bool,
    pub half: bool,
}

impl PostProcess {
    pub fn apply(&self, model: &mut ModelProto) -> XfeatResult<()> {
        if self.declutter {
            let removed = declutter(model)?;
            debug!("declutter removed {removed} dead graph objects");
        }
        if self.half {
            half_precision(model)?;
            debug!("converted float32 payloads to float16");
        }
        Ok(())
    }
}

/// Drop nodes and initializers that contribute to no graph output.
/// Returns the number of removed objects.
pub fn declutter(model: &mut ModelProto) -> XfeatResult<usize> {
    let graph = model.graph.as_mut().context("model carries no graph")?;
    let mut live: HashSet<String> = graph.output.iter().map(|o| o.name.clone()).collect();
    for node in graph.node.iter().rev() {
        if node.output.iter().any(|o| live.contains(o)) {
            live.extend(node.input.iter().filter(|i| !i.is_empty()).cloned());
            live.extend(node.output.iter().cloned());
        }
    }
    let before = graph.node.len() + graph.initializer.len();
    graph.node.retain(|n| n.output.iter().any(|o| live.contains(o)));
    graph.initializer.retain(|i| live.contains(&i.name));
    Ok(before - graph.node.len() - graph.initializer.len())
}

/// Convert float32 initializers, io signatures and the float-typed operator
/// attributes (Cast targets, ConstantOfShape fill values) to float16.
pub fn half_precision(model: &mut ModelProto) -> XfeatResult<()> {
    let graph = model.graph.as_mut().context("model carries no graph")?;
    for init in &mut graph.initializer {
        convert_tensor(init)?;
    }
    for vi in graph
        .input
        .iter_mut()
        .chain(graph.output.iter_mut())
        .chain(graph.value_info.iter_mut())
    {
        retype(vi);
    }
    for node in &mut graph.node {
        match node.op_type.as_str() {
            "Cast" => {
                for attr in node.attribute.iter_mut().filter(|a| a.name == "to") {
                    if attr.i == DataType::Float as i64 {
                        attr.i = DataType::Float16 as i64;
                    }
                }
            }
            "ConstantOfShape" => {
                for attr in node.attribute.iter_mut().filter(|a| a.name == "value") {
                    if let Some(t) = attr.t.as_mut() {
                        convert_tensor(t)?;
                    }
                }
            }
            _ => (),
        }
    }
    Ok(())
}

fn convert_tensor(t: &mut TensorProto) -> XfeatResult<()> {
    if t.data_type != DataType::Float as i32 {
        return Ok(());
    }
    if !t.raw_data.is_empty() {
        t.raw_data = tensor::raw_f32_to_f16(&t.raw_data)?;
    } else if !t.float_data.is_empty() {
        let mut raw = Vec::with_capacity(t.float_data.len() * 2);
        for f in t.float_data.drain(..) {
            raw.extend_from_slice(&f16::from_f32(f).to_le_bytes());
        }
        t.raw_data = raw;
    }
    t.data_type = DataType::Float16 as i32;
    Ok(())
}

fn retype(vi: &mut ValueInfoProto) {
    if let Some(TypeProto { value: Some(type_proto::Value::TensorType(t)), .. }) =
        vi.r#type.as_mut()
    {
        if t.elem_type == DataType::Float as i32 {
            t.elem_type = DataType::Float16 as i32;
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::builder::{GraphBuilder, fixed};
    use crate::checker::check_model;

    fn model_with_dead_branch() -> ModelProto {
        let mut b = GraphBuilder::new("t");
        let x = b.source("x", DataType::Float, &fixed(&[1, 4])).unwrap();
        let y = b.wire("y", "Relu", &[&x], vec![]).unwrap();
        b.wire("dead", "Sigmoid", &[&x], vec![]).unwrap();
        b.konst_f32s("unused", &[1., 2.]).unwrap();
        b.output(&y, DataType::Float, &fixed(&[1, 4])).unwrap();
        b.into_model(11).unwrap()
    }

    #[test]
    fn default_runs_no_pass() {
        let mut model = model_with_dead_branch();
        let before = model.clone();
        PostProcess::default().apply(&mut model).unwrap();
        assert_eq!(model, before);
    }

    #[test]
    fn declutter_removes_unreachable_objects() {
        let mut model = model_with_dead_branch();
        let removed = declutter(&mut model).unwrap();
        assert_eq!(removed, 2);
        let graph = model.graph.as_ref().unwrap();
        assert_eq!(graph.node.len(), 1);
        assert!(graph.initializer.is_empty());
        check_model(&model).unwrap();
    }

    #[test]
    fn declutter_leaves_a_live_graph_alone() {
        let mut model = model_with_dead_branch();
        declutter(&mut model).unwrap();
        assert_eq!(declutter(&mut model).unwrap(), 0);
    }

    #[test]
    fn half_precision_rewrites_payloads_and_signatures() {
        let mut b = GraphBuilder::new("t");
        let x = b.source("x", DataType::Float, &fixed(&[2, 2])).unwrap();
        let w = b.konst_f32s("w", &[0.5, 1.0, -1.0, 2.0]).unwrap();
        let y = b.wire("y", "MatMul", &[&x, &w], vec![]).unwrap();
        b.output(&y, DataType::Float, &fixed(&[2, 2])).unwrap();
        let mut model = b.into_model(13).unwrap();
        half_precision(&mut model).unwrap();
        let graph = model.graph.as_ref().unwrap();
        let w = &graph.initializer[0];
        assert_eq!(w.data_type, DataType::Float16 as i32);
        assert_eq!(w.raw_data.len(), 8);
        assert_eq!(&w.raw_data[2..4], &f16::from_f32(1.0).to_le_bytes());
        for vi in graph.input.iter().chain(graph.output.iter()) {
            match vi.r#type.as_ref().unwrap().value.as_ref().unwrap() {
                type_proto::Value::TensorType(t) => {
                    assert_eq!(t.elem_type, DataType::Float16 as i32)
                }
            }
        }
    }

    #[test]
    fn half_precision_retargets_float_casts() {
        let mut b = GraphBuilder::new("t");
        let x = b.source("x", DataType::Int64, &fixed(&[4])).unwrap();
        let y = b
            .wire("y", "Cast", &[&x], vec![AttributeProto::int("to", DataType::Float as i64)])
            .unwrap();
        b.output(&y, DataType::Float, &fixed(&[4])).unwrap();
        let mut model = b.into_model(13).unwrap();
        half_precision(&mut model).unwrap();
        let node = &model.graph.as_ref().unwrap().node[0];
        assert_eq!(node.get_attr::<i64>("to").unwrap(), DataType::Float16 as i64);
    }
}
