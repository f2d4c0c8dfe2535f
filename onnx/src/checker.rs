//! Structural validation of serialized models.
//!
//! `check_model` re-validates what the builder enforced at construction
//! time, but on the decoded protobuf, so it catches anything lost or
//! corrupted across serialization as well as models built by hand in
//! tests. Checks run in order and the first failure aborts: model header,
//! value naming, edge resolution, per-node operator schema, attribute tags,
//! initializer payloads, io signatures.

use crate::internal::*;
use crate::pb::attribute_proto::AttributeType;
use crate::pb::tensor_proto::DataType;
use crate::pb::*;
use crate::tensor;

use itertools::Itertools;
use std::collections::{HashMap, HashSet};

/// Arity bounds of one revision of an operator, keyed by the operator set
/// version that introduced it.
#[derive(Clone, Debug)]
struct OpSchema {
    since: i64,
    min_in: usize,
    max_in: usize,
    min_out: usize,
    max_out: usize,
}

type Revisions = Vec<OpSchema>;

fn revs(table: &[(i64, usize, usize, usize, usize)]) -> Revisions {
    table
        .iter()
        .map(|&(since, min_in, max_in, min_out, max_out)| OpSchema {
            since,
            min_in,
            max_in,
            min_out,
            max_out,
        })
        .collect()
}

lazy_static::lazy_static! {
    /// The operator vocabulary the graph definitions emit, with the opset
    /// version ladder where the wire-level form changed.
    static ref OP_REGISTRY: HashMap<&'static str, Revisions> = {
        let mut reg = HashMap::new();
        let mut op = |name: &'static str, table: &[(i64, usize, usize, usize, usize)]| {
            reg.insert(name, revs(table));
        };
        // elementwise math
        op("Add", &[(7, 2, 2, 1, 1)]);
        op("Sub", &[(7, 2, 2, 1, 1)]);
        op("Mul", &[(7, 2, 2, 1, 1)]);
        op("Div", &[(7, 2, 2, 1, 1)]);
        op("Sqrt", &[(6, 1, 1, 1, 1)]);
        op("Exp", &[(6, 1, 1, 1, 1)]);
        op("Log", &[(6, 1, 1, 1, 1)]);
        op("Neg", &[(6, 1, 1, 1, 1)]);
        op("Erf", &[(9, 1, 1, 1, 1)]);
        op("Sin", &[(7, 1, 1, 1, 1)]);
        op("Cos", &[(7, 1, 1, 1, 1)]);
        op("Sigmoid", &[(6, 1, 1, 1, 1)]);
        op("Relu", &[(6, 1, 1, 1, 1)]);
        // logic
        op("And", &[(7, 2, 2, 1, 1)]);
        op("Equal", &[(7, 2, 2, 1, 1)]);
        op("Greater", &[(7, 2, 2, 1, 1)]);
        op("Where", &[(9, 3, 3, 1, 1)]);
        // reductions; ReduceSum moved its axes to an input before the others
        op("ReduceMean", &[(1, 1, 1, 1, 1), (18, 1, 2, 1, 1)]);
        op("ReduceMax", &[(1, 1, 1, 1, 1), (18, 1, 2, 1, 1)]);
        op("ReduceSum", &[(1, 1, 1, 1, 1), (13, 1, 2, 1, 1)]);
        op("ReduceL2", &[(1, 1, 1, 1, 1), (18, 1, 2, 1, 1)]);
        op("ArgMax", &[(1, 1, 1, 1, 1)]);
        // neural network layers
        op("Conv", &[(1, 2, 3, 1, 1)]);
        op("AveragePool", &[(7, 1, 1, 1, 1)]);
        op("BatchNormalization", &[(7, 5, 5, 1, 5)]);
        op("InstanceNormalization", &[(6, 3, 3, 1, 1)]);
        op("LayerNormalization", &[(17, 2, 3, 1, 3)]);
        op("Softmax", &[(1, 1, 1, 1, 1)]);
        op("LogSoftmax", &[(1, 1, 1, 1, 1)]);
        op("Clip", &[(1, 1, 1, 1, 1), (11, 1, 3, 1, 1)]);
        // shape and data movement
        op("Shape", &[(1, 1, 1, 1, 1)]);
        op("Reshape", &[(5, 2, 2, 1, 1)]);
        op("Flatten", &[(1, 1, 1, 1, 1)]);
        op("Transpose", &[(1, 1, 1, 1, 1)]);
        op("Concat", &[(4, 1, usize::MAX, 1, 1)]);
        op("Slice", &[(1, 1, 1, 1, 1), (10, 3, 5, 1, 1)]);
        op("Squeeze", &[(1, 1, 1, 1, 1), (13, 1, 2, 1, 1)]);
        op("Unsqueeze", &[(1, 1, 1, 1, 1), (13, 2, 2, 1, 1)]);
        op("Gather", &[(1, 2, 2, 1, 1)]);
        op("GatherElements", &[(11, 2, 2, 1, 1)]);
        op("Tile", &[(6, 2, 2, 1, 1)]);
        op("Cast", &[(6, 1, 1, 1, 1)]);
        op("MatMul", &[(1, 2, 2, 1, 1)]);
        op("Mod", &[(10, 2, 2, 1, 1)]);
        op("TopK", &[(1, 1, 1, 2, 2), (10, 2, 2, 2, 2)]);
        op("NonZero", &[(9, 1, 1, 1, 1)]);
        op("ConstantOfShape", &[(9, 1, 1, 1, 1)]);
        op("Resize", &[(10, 2, 2, 1, 1), (11, 3, 4, 1, 1)]);
        op("SpaceToDepth", &[(1, 1, 1, 1, 1)]);
        reg
    };
}

/// The default-domain operator set version the model imports.
pub fn model_opset(model: &ModelProto) -> XfeatResult<i64> {
    model
        .opset_import
        .iter()
        .filter(|o| o.domain.is_empty() || o.domain == "ai.onnx")
        .map(|o| o.version)
        .max()
        .context("model imports no default-domain operator set")
}

pub fn check_model(model: &ModelProto) -> XfeatResult<()> {
    ensure!(
        (3..=10).contains(&model.ir_version),
        "unsupported IR version {}",
        model.ir_version
    );
    let opset = model_opset(model)?;
    let graph = model.graph.as_ref().context("model carries no graph")?;
    check_graph(graph, opset).with_context(|| format!("checking graph {:?}", graph.name))
}

pub fn check_graph(graph: &GraphProto, opset: i64) -> XfeatResult<()> {
    check_names(graph)?;
    check_edges(graph)?;
    for node in &graph.node {
        check_node(node, opset)?;
    }
    check_initializers(graph)?;
    check_signatures(graph)?;
    Ok(())
}

fn check_names(graph: &GraphProto) -> XfeatResult<()> {
    let duplicates: Vec<&str> = graph
        .node
        .iter()
        .map(|n| n.name.as_str())
        .duplicates()
        .collect();
    ensure!(duplicates.is_empty(), "duplicate node names: {}", duplicates.iter().join(", "));
    if let Some(anon) = graph.node.iter().find(|n| n.name.is_empty()) {
        bail!("unnamed {} node", anon.op_type);
    }
    Ok(())
}

fn check_edges(graph: &GraphProto) -> XfeatResult<()> {
    let mut defined: HashSet<&str> = HashSet::new();
    for input in &graph.input {
        ensure!(!input.name.is_empty(), "graph input with empty name");
        ensure!(defined.insert(&input.name), "duplicate graph input {:?}", input.name);
    }
    for init in &graph.initializer {
        ensure!(!init.name.is_empty(), "initializer with empty name");
        // an initializer may double as the default value of a graph input
        let shadows_input = graph.input.iter().any(|i| i.name == init.name);
        if !shadows_input {
            ensure!(defined.insert(&init.name), "duplicate initializer {:?}", init.name);
        }
    }
    for node in &graph.node {
        for (ix, input) in node.input.iter().enumerate() {
            if input.is_empty() {
                continue;
            }
            if !defined.contains(input.as_str()) {
                return node.bail(&format!(
                    "input #{ix} refers to {input:?}, which is not defined at this point \
                     (values must be produced before use)"
                ));
            }
        }
        for output in &node.output {
            ensure!(!output.is_empty(), "node {:?} has an unnamed output", node.name);
            ensure!(
                defined.insert(output),
                "value {output:?} is produced more than once (node {:?})",
                node.name
            );
        }
    }
    for output in &graph.output {
        ensure!(
            defined.contains(output.name.as_str()),
            "graph output {:?} is not produced by any node or initializer",
            output.name
        );
    }
    Ok(())
}

fn check_node(node: &NodeProto, opset: i64) -> XfeatResult<()> {
    if !node.domain.is_empty() {
        return node.bail(&format!("operator domain {:?} is not supported", node.domain));
    }
    let Some(revisions) = OP_REGISTRY.get(node.op_type.as_str()) else {
        return node.bail("operator is not in the supported set");
    };
    let Some(schema) = revisions.iter().filter(|s| s.since <= opset).max_by_key(|s| s.since)
    else {
        return node.bail(&format!(
            "{} requires opset >= {} (model imports opset {opset})",
            node.op_type, revisions[0].since
        ));
    };
    let ins = node.input.len();
    if ins < schema.min_in || ins > schema.max_in {
        // the arity may belong to a later revision of the operator
        if let Some(later) =
            revisions.iter().find(|s| s.since > opset && (s.min_in..=s.max_in).contains(&ins))
        {
            return node.bail(&format!(
                "{} with {ins} inputs requires opset >= {} (model imports opset {opset})",
                node.op_type, later.since
            ));
        }
        return node.bail(&format!(
            "{} expects {} to {} inputs at opset {opset}, got {ins}",
            node.op_type, schema.min_in, schema.max_in
        ));
    }
    let outs = node.output.len();
    if outs < schema.min_out || outs > schema.max_out {
        return node.bail(&format!(
            "{} expects {} to {} outputs at opset {opset}, got {outs}",
            node.op_type, schema.min_out, schema.max_out
        ));
    }
    for attr in &node.attribute {
        check_attr(node, attr)?;
    }
    Ok(())
}

fn check_attr(node: &NodeProto, attr: &AttributeProto) -> XfeatResult<()> {
    if attr.name.is_empty() {
        return node.bail("attribute with empty name");
    }
    match attr.attr_type() {
        None | Some(AttributeType::Undefined) => {
            node.bail(&format!("attribute {:?} carries no valid type tag", attr.name))
        }
        Some(AttributeType::Tensor) if attr.t.is_none() => {
            node.bail(&format!("attribute {:?} is tagged tensor but holds none", attr.name))
        }
        Some(AttributeType::Graph) if attr.g.is_none() => {
            node.bail(&format!("attribute {:?} is tagged graph but holds none", attr.name))
        }
        _ => Ok(()),
    }
}

fn check_initializers(graph: &GraphProto) -> XfeatResult<()> {
    for init in &graph.initializer {
        check_initializer(init)
            .with_context(|| format!("checking initializer {:?}", init.name))?;
    }
    Ok(())
}

fn check_initializer(init: &TensorProto) -> XfeatResult<()> {
    let Some(dt) = DataType::from_i32(init.data_type) else {
        bail!("unknown data type {}", init.data_type);
    };
    ensure!(dt != DataType::Undefined, "undefined data type");
    ensure!(init.dims.iter().all(|&d| d >= 0), "negative dimension in {:?}", init.dims);
    let count = tensor::elem_count(&init.dims) as usize;
    if !init.raw_data.is_empty() {
        let expected = count * tensor::size_of(dt)?;
        ensure!(
            init.raw_data.len() == expected,
            "raw_data holds {} bytes, dims {:?} of {} require {}",
            init.raw_data.len(),
            init.dims,
            dt.as_str_name(),
            expected
        );
        return Ok(());
    }
    let typed = match dt {
        DataType::Float => init.float_data.len(),
        DataType::Int32 => init.int32_data.len(),
        DataType::Int64 => init.int64_data.len(),
        DataType::Double => init.double_data.len(),
        DataType::Uint64 => init.uint64_data.len(),
        _ if count == 0 => 0,
        _ => bail!("no payload for {} tensor", dt.as_str_name()),
    };
    ensure!(
        typed == count,
        "typed payload holds {} values, dims {:?} require {}",
        typed,
        init.dims,
        count
    );
    Ok(())
}

fn check_signatures(graph: &GraphProto) -> XfeatResult<()> {
    for vi in graph.input.iter().chain(graph.output.iter()) {
        let t = vi
            .r#type
            .as_ref()
            .with_context(|| format!("signature of {:?} has no type", vi.name))?;
        let type_proto::Value::TensorType(tensor_type) = t
            .value
            .as_ref()
            .with_context(|| format!("signature of {:?} has no tensor type", vi.name))?;
        let dt = DataType::from_i32(tensor_type.elem_type);
        ensure!(
            dt.is_some() && dt != Some(DataType::Undefined),
            "signature of {:?} has no element type",
            vi.name
        );
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::builder::{GraphBuilder, fixed};

    fn trivial_model(opset: i64) -> ModelProto {
        let mut b = GraphBuilder::new("t");
        let x = b.source("x", DataType::Float, &fixed(&[1, 4])).unwrap();
        let y = b.wire("y", "Relu", &[&x], vec![]).unwrap();
        b.output(&y, DataType::Float, &fixed(&[1, 4])).unwrap();
        b.into_model(opset).unwrap()
    }

    #[test]
    fn accepts_a_well_formed_model() {
        check_model(&trivial_model(11)).unwrap();
    }

    #[test]
    fn rejects_unknown_operator() {
        let mut model = trivial_model(11);
        model.graph.as_mut().unwrap().node[0].op_type = "FrobnicateV2".to_string();
        let err = check_model(&model).unwrap_err();
        assert!(format!("{err:?}").contains("not in the supported set"), "{err:?}");
    }

    #[test]
    fn rejects_topk_with_runtime_k_below_opset_10() {
        let mut b = GraphBuilder::new("t");
        let x = b.source("x", DataType::Float, &fixed(&[1, 100])).unwrap();
        let k = b.konst_i64s("k", &[10]).unwrap();
        let top = b.wire_multi("topk", "TopK", &[&x, &k], vec![], 2).unwrap();
        b.output(&top[0], DataType::Float, &fixed(&[1, 10])).unwrap();
        let model = b.into_model(9).unwrap();
        let err = check_model(&model).unwrap_err();
        let msg = format!("{err:?}");
        assert!(msg.contains("TopK"), "{msg}");
        assert!(msg.contains("requires opset >= 10"), "{msg}");
    }

    #[test]
    fn rejects_operator_introduced_after_model_opset() {
        let mut b = GraphBuilder::new("t");
        let x = b.source("x", DataType::Float, &fixed(&[1, 4])).unwrap();
        let y = b.wire("y", "Erf", &[&x], vec![]).unwrap();
        b.output(&y, DataType::Float, &fixed(&[1, 4])).unwrap();
        let model = b.into_model(8).unwrap();
        let err = check_model(&model).unwrap_err();
        assert!(format!("{err:?}").contains("requires opset >= 9"), "{err:?}");
    }

    #[test]
    fn rejects_value_produced_twice() {
        let mut model = trivial_model(11);
        let graph = model.graph.as_mut().unwrap();
        let mut clone = graph.node[0].clone();
        clone.name = "y2".to_string();
        graph.node.push(clone);
        let err = check_model(&model).unwrap_err();
        assert!(format!("{err:?}").contains("produced more than once"), "{err:?}");
    }

    #[test]
    fn rejects_use_before_definition() {
        let mut model = trivial_model(11);
        let graph = model.graph.as_mut().unwrap();
        let mut late = graph.node[0].clone();
        late.name = "z".to_string();
        late.input[0] = "not_yet".to_string();
        late.output[0] = "not_yet".to_string();
        graph.node.insert(0, late);
        let err = check_model(&model).unwrap_err();
        assert!(format!("{err:?}").contains("not defined at this point"), "{err:?}");
    }

    #[test]
    fn rejects_dangling_graph_output() {
        let mut model = trivial_model(11);
        model.graph.as_mut().unwrap().output[0].name = "nope".to_string();
        let err = check_model(&model).unwrap_err();
        assert!(format!("{err:?}").contains("not produced"), "{err:?}");
    }

    #[test]
    fn rejects_short_initializer_payload() {
        let mut model = trivial_model(11);
        let mut t = crate::tensor::vec_f32("w", &[1., 2., 3.]);
        t.raw_data.pop();
        model.graph.as_mut().unwrap().initializer.push(t);
        let err = check_model(&model).unwrap_err();
        assert!(format!("{err:?}").contains("raw_data holds"), "{err:?}");
    }

    #[test]
    fn rejects_untagged_attribute() {
        let mut model = trivial_model(11);
        let attr = AttributeProto { name: "axis".to_string(), i: 1, ..AttributeProto::default() };
        model.graph.as_mut().unwrap().node[0].attribute.push(attr);
        let err = check_model(&model).unwrap_err();
        assert!(format!("{err:?}").contains("type tag"), "{err:?}");
    }

    #[test]
    fn rejects_missing_default_opset_import() {
        let mut model = trivial_model(11);
        model.opset_import.clear();
        assert!(check_model(&model).is_err());
    }
}
