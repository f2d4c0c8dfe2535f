//! Direct construction of ONNX graphs.
//!
//! `GraphBuilder` enforces the structural rules at build time: nodes are
//! appended in topological order, every non-empty input must already be
//! defined, node and value names are unique. Output values take the name of
//! the node producing them, so a graph output is named by naming its final
//! node.

use crate::internal::*;
use crate::pb::tensor_proto::DataType;
use crate::pb::tensor_shape_proto::dimension;
use crate::pb::*;

use std::collections::HashSet;

/// A named value flowing between nodes.
#[derive(Clone, Debug, PartialEq, Eq, Hash)]
pub struct Wire(String);

impl Wire {
    pub fn name(&self) -> &str {
        &self.0
    }

    /// The disconnected slot for a trailing optional input.
    pub fn none() -> Wire {
        Wire(String::new())
    }
}

/// One axis of a tensor signature.
#[derive(Clone, Debug, PartialEq)]
pub enum Dim {
    Fixed(i64),
    Sym(String),
}

impl Dim {
    pub fn sym(s: &str) -> Dim {
        Dim::Sym(s.to_string())
    }

    fn to_proto(&self) -> tensor_shape_proto::Dimension {
        let value = match self {
            Dim::Fixed(v) => dimension::Value::DimValue(*v),
            Dim::Sym(s) => dimension::Value::DimParam(s.clone()),
        };
        tensor_shape_proto::Dimension { denotation: String::new(), value: Some(value) }
    }
}

impl From<i64> for Dim {
    fn from(d: i64) -> Dim {
        Dim::Fixed(d)
    }
}

/// All-fixed dims.
pub fn fixed(dims: &[i64]) -> TVec<Dim> {
    dims.iter().map(|d| Dim::Fixed(*d)).collect()
}

fn value_info(name: &str, dt: DataType, dims: &[Dim]) -> ValueInfoProto {
    ValueInfoProto {
        name: name.to_string(),
        r#type: Some(TypeProto {
            denotation: String::new(),
            value: Some(type_proto::Value::TensorType(type_proto::Tensor {
                elem_type: dt as i32,
                shape: Some(TensorShapeProto {
                    dim: dims.iter().map(Dim::to_proto).collect(),
                }),
            })),
        }),
        doc_string: String::new(),
    }
}

/// IR version matching an ONNX operator set release.
pub fn ir_version_for_opset(opset: i64) -> i64 {
    match opset {
        i64::MIN..=8 => 3,
        9 => 4,
        10 => 5,
        11 => 6,
        12..=14 => 7,
        _ => 8,
    }
}

#[derive(Default)]
pub struct GraphBuilder {
    name: String,
    inputs: Vec<ValueInfoProto>,
    outputs: Vec<ValueInfoProto>,
    initializers: Vec<TensorProto>,
    nodes: Vec<NodeProto>,
    values: HashSet<String>,
    node_names: HashSet<String>,
}

impl GraphBuilder {
    pub fn new(name: &str) -> GraphBuilder {
        GraphBuilder { name: name.to_string(), ..GraphBuilder::default() }
    }

    fn define(&mut self, name: &str) -> XfeatResult<()> {
        ensure!(!name.is_empty(), "graph {}: empty value name", self.name);
        ensure!(self.values.insert(name.to_string()), "graph {}: duplicate value name {name:?}", self.name);
        Ok(())
    }

    /// Declare a graph input.
    pub fn source(&mut self, name: &str, dt: DataType, dims: &[Dim]) -> XfeatResult<Wire> {
        self.define(name)?;
        self.inputs.push(value_info(name, dt, dims));
        Ok(Wire(name.to_string()))
    }

    /// Register an initializer (a constant baked into the graph).
    pub fn konst(&mut self, t: TensorProto) -> XfeatResult<Wire> {
        let name = t.name.clone();
        self.define(&name)?;
        self.initializers.push(t);
        Ok(Wire(name))
    }

    pub fn konst_i64s(&mut self, name: &str, values: &[i64]) -> XfeatResult<Wire> {
        self.konst(tensor::vec_i64(name, values))
    }

    pub fn konst_f32s(&mut self, name: &str, values: &[f32]) -> XfeatResult<Wire> {
        self.konst(tensor::vec_f32(name, values))
    }

    pub fn konst_scalar_f32(&mut self, name: &str, value: f32) -> XfeatResult<Wire> {
        self.konst(tensor::scalar_f32(name, value))
    }

    pub fn konst_scalar_i64(&mut self, name: &str, value: i64) -> XfeatResult<Wire> {
        self.konst(tensor::scalar_i64(name, value))
    }

    /// Append a single-output node. The output value takes the node name.
    pub fn wire(
        &mut self,
        name: &str,
        op: &str,
        inputs: &[&Wire],
        attrs: Vec<AttributeProto>,
    ) -> XfeatResult<Wire> {
        let mut outputs = self.wire_multi(name, op, inputs, attrs, 1)?;
        Ok(outputs.remove(0))
    }

    /// Append a node with `outputs` output slots, named `{name}`, `{name}.1`, ...
    pub fn wire_multi(
        &mut self,
        name: &str,
        op: &str,
        inputs: &[&Wire],
        attrs: Vec<AttributeProto>,
        outputs: usize,
    ) -> XfeatResult<TVec<Wire>> {
        ensure!(
            self.node_names.insert(name.to_string()),
            "graph {}: duplicate node name {name:?}",
            self.name
        );
        for (ix, input) in inputs.iter().enumerate() {
            // the empty name is ONNX's disconnected optional input
            if !input.0.is_empty() {
                ensure!(
                    self.values.contains(&input.0),
                    "graph {}: node {name:?} input #{ix} refers to undefined value {:?}",
                    self.name,
                    input.0
                );
            }
        }
        let out_wires: TVec<Wire> = (0..outputs)
            .map(|slot| if slot == 0 { Wire(name.to_string()) } else { Wire(format!("{name}.{slot}")) })
            .collect();
        for w in &out_wires {
            self.define(&w.0)?;
        }
        self.nodes.push(NodeProto {
            input: inputs.iter().map(|w| w.0.clone()).collect(),
            output: out_wires.iter().map(|w| w.0.clone()).collect(),
            name: name.to_string(),
            op_type: op.to_string(),
            attribute: attrs,
            ..NodeProto::default()
        });
        Ok(out_wires)
    }

    /// Declare a graph output. The wire must already be defined.
    pub fn output(&mut self, wire: &Wire, dt: DataType, dims: &[Dim]) -> XfeatResult<()> {
        ensure!(
            self.values.contains(&wire.0),
            "graph {}: output {:?} is not a defined value",
            self.name,
            wire.0
        );
        self.outputs.push(value_info(&wire.0, dt, dims));
        Ok(())
    }

    /// Assemble the model, stamping IR version and producer metadata.
    pub fn into_model(self, opset: i64) -> XfeatResult<ModelProto> {
        ensure!(!self.outputs.is_empty(), "graph {} declares no outputs", self.name);
        let graph = GraphProto {
            node: self.nodes,
            name: self.name,
            initializer: self.initializers,
            input: self.inputs,
            output: self.outputs,
            ..GraphProto::default()
        };
        Ok(ModelProto {
            ir_version: ir_version_for_opset(opset),
            opset_import: vec![OperatorSetIdProto { domain: String::new(), version: opset }],
            producer_name: "xfeat-export".to_string(),
            producer_version: env!("CARGO_PKG_VERSION").to_string(),
            graph: Some(graph),
            ..ModelProto::default()
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn output_values_take_node_names() {
        let mut b = GraphBuilder::new("g");
        let x = b.source("x", DataType::Float, &fixed(&[1, 4])).unwrap();
        let y = b.wire("relu", "Relu", &[&x], vec![]).unwrap();
        assert_eq!(y.name(), "relu");
        let both = b.wire_multi("topk", "TopK", &[&y], vec![], 2).unwrap();
        assert_eq!(both[0].name(), "topk");
        assert_eq!(both[1].name(), "topk.1");
    }

    #[test]
    fn undefined_input_is_rejected() {
        let mut b = GraphBuilder::new("g");
        let ghost = Wire("ghost".to_string());
        let err = b.wire("n", "Relu", &[&ghost], vec![]).unwrap_err();
        assert!(err.to_string().contains("undefined value"), "{err}");
    }

    #[test]
    fn duplicate_node_name_is_rejected() {
        let mut b = GraphBuilder::new("g");
        let x = b.source("x", DataType::Float, &fixed(&[1])).unwrap();
        b.wire("n", "Relu", &[&x], vec![]).unwrap();
        assert!(b.wire("n", "Sigmoid", &[&x], vec![]).is_err());
    }

    #[test]
    fn optional_input_slot_is_allowed() {
        let mut b = GraphBuilder::new("g");
        let x = b.source("x", DataType::Float, &fixed(&[1, 4])).unwrap();
        let roi = Wire::none();
        let scales = b.konst_f32s("scales", &[1.0, 2.0]).unwrap();
        assert!(b.wire("up", "Resize", &[&x, &roi, &scales], vec![]).is_ok());
    }

    #[test]
    fn model_assembly_stamps_versions() {
        let mut b = GraphBuilder::new("g");
        let x = b.source("x", DataType::Float, &fixed(&[1])).unwrap();
        let y = b.wire("y", "Relu", &[&x], vec![]).unwrap();
        b.output(&y, DataType::Float, &fixed(&[1])).unwrap();
        let model = b.into_model(11).unwrap();
        assert_eq!(model.ir_version, 6);
        assert_eq!(model.opset_import[0].version, 11);
        assert_eq!(model.producer_name, "xfeat-export");
    }

    #[test]
    fn symbolic_dims_encode_as_dim_params() {
        let mut b = GraphBuilder::new("g");
        let x = b.source("x", DataType::Float, &[Dim::sym("batch"), Dim::Fixed(3)]).unwrap();
        b.output(&x, DataType::Float, &[Dim::sym("batch"), Dim::Fixed(3)]).unwrap();
        let model = b.into_model(11).unwrap();
        let graph = model.graph.unwrap();
        let shape = match graph.input[0].r#type.as_ref().unwrap().value.as_ref().unwrap() {
            type_proto::Value::TensorType(t) => t.shape.as_ref().unwrap(),
        };
        assert_eq!(
            shape.dim[0].value,
            Some(dimension::Value::DimParam("batch".to_string()))
        );
        assert_eq!(shape.dim[1].value, Some(dimension::Value::DimValue(3)));
    }
}
