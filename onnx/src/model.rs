//! Loading, saving and fingerprinting serialized models.

use crate::internal::*;
use crate::pb::tensor_proto::DataType;
use crate::pb::tensor_shape_proto::dimension;
use crate::pb::*;

use itertools::Itertools;
use prost::Message;
use std::fs;
use std::io::Read;
use std::path::Path;

/// Decode a model from a reader.
pub fn for_reader<R: Read>(mut r: R) -> XfeatResult<ModelProto> {
    let mut buf = vec![];
    r.read_to_end(&mut buf)?;
    ModelProto::decode(&*buf).context("can not parse protobuf message")
}

/// Decode a model from a file.
pub fn for_path(p: impl AsRef<Path>) -> XfeatResult<ModelProto> {
    let path = p.as_ref();
    let file = fs::File::open(path).with_context(|| format!("opening {path:?}"))?;
    for_reader(file).with_context(|| format!("reading model from {path:?}"))
}

/// Encode a model to a file, creating parent directories as needed.
pub fn save(model: &ModelProto, p: impl AsRef<Path>) -> XfeatResult<()> {
    let path = p.as_ref();
    if let Some(parent) = path.parent() {
        if !parent.as_os_str().is_empty() {
            fs::create_dir_all(parent).with_context(|| format!("creating {parent:?}"))?;
        }
    }
    fs::write(path, model.encode_to_vec())
        .with_context(|| format!("writing model to {path:?}"))?;
    Ok(())
}

/// Render the structure of a model, one line per object: io signatures,
/// initializer shapes and node wiring, but no tensor payloads. Two builds
/// of the same configuration render identically even when their embedded
/// parameter values differ.
pub fn structure(model: &ModelProto) -> Vec<String> {
    let opsets =
        model.opset_import.iter().map(|o| format!("{}:{}", o.domain, o.version)).join(" ");
    let mut lines = vec![format!("ir {} opset {opsets}", model.ir_version)];
    let Some(graph) = &model.graph else {
        return lines;
    };
    for vi in &graph.input {
        lines.push(format!("input {}", render_value_info(vi)));
    }
    for t in &graph.initializer {
        lines.push(format!("const {} {} [{}]", t.name, render_dt(t.data_type), t.dims.iter().join(",")));
    }
    for n in &graph.node {
        let attrs = n
            .attribute
            .iter()
            .sorted_by(|a, b| a.name.cmp(&b.name))
            .map(render_attr)
            .join(" ");
        lines.push(format!(
            "{} {}({}) -> {}{}{}",
            n.op_type,
            n.name,
            n.input.iter().join(", "),
            n.output.iter().join(", "),
            if attrs.is_empty() { "" } else { " " },
            attrs
        ));
    }
    for vi in &graph.output {
        lines.push(format!("output {}", render_value_info(vi)));
    }
    lines
}

fn render_dt(dt: i32) -> &'static str {
    DataType::from_i32(dt).unwrap_or(DataType::Undefined).as_str_name()
}

fn render_value_info(vi: &ValueInfoProto) -> String {
    let Some(TypeProto { value: Some(type_proto::Value::TensorType(t)), .. }) = &vi.r#type
    else {
        return format!("{} untyped", vi.name);
    };
    let dims = match &t.shape {
        None => "?".to_string(),
        Some(shape) => shape
            .dim
            .iter()
            .map(|d| match &d.value {
                Some(dimension::Value::DimValue(v)) => v.to_string(),
                Some(dimension::Value::DimParam(p)) => p.clone(),
                None => "?".to_string(),
            })
            .join("x"),
    };
    format!("{} {} {}", vi.name, render_dt(t.elem_type), dims)
}

fn render_attr(a: &AttributeProto) -> String {
    use crate::pb::attribute_proto::AttributeType;
    match a.attr_type().unwrap_or(AttributeType::Undefined) {
        AttributeType::Int => format!("{}={}", a.name, a.i),
        AttributeType::Float => format!("{}={}", a.name, a.f),
        AttributeType::Ints => format!("{}={:?}", a.name, a.ints),
        AttributeType::Floats => format!("{}={:?}", a.name, a.floats),
        AttributeType::String => {
            format!("{}={:?}", a.name, String::from_utf8_lossy(&a.s))
        }
        AttributeType::Tensor => match &a.t {
            Some(t) => format!(
                "{}=tensor({} [{}])",
                a.name,
                render_dt(t.data_type),
                t.dims.iter().join(",")
            ),
            None => format!("{}=tensor(none)", a.name),
        },
        other => format!("{}=<{other}>", a.name),
    }
}
