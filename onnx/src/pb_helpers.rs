//! Typed construction and access of node attributes.

use crate::internal::*;
use crate::pb::attribute_proto::AttributeType;
use crate::pb::*;

use std::fmt;
use std::str;

impl fmt::Display for AttributeType {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        f.write_str(match self {
            AttributeType::Int => "int",
            AttributeType::Float => "float",
            AttributeType::Tensor => "tensor",
            AttributeType::String => "string",
            AttributeType::Ints => "list of ints",
            AttributeType::Floats => "list of floats",
            AttributeType::Strings => "list of strings",
            AttributeType::Tensors => "list of tensors",
            AttributeType::Graph => "graph",
            AttributeType::Graphs => "graphs",
            AttributeType::Undefined => "<undefined>",
        })
    }
}

impl AttributeProto {
    fn named(name: &str, t: AttributeType) -> AttributeProto {
        AttributeProto { name: name.to_string(), r#type: t as i32, ..AttributeProto::default() }
    }

    pub fn int(name: &str, i: i64) -> AttributeProto {
        AttributeProto { i, ..Self::named(name, AttributeType::Int) }
    }

    pub fn ints(name: &str, ints: &[i64]) -> AttributeProto {
        AttributeProto { ints: ints.to_vec(), ..Self::named(name, AttributeType::Ints) }
    }

    pub fn float(name: &str, f: f32) -> AttributeProto {
        AttributeProto { f, ..Self::named(name, AttributeType::Float) }
    }

    pub fn floats(name: &str, floats: &[f32]) -> AttributeProto {
        AttributeProto { floats: floats.to_vec(), ..Self::named(name, AttributeType::Floats) }
    }

    pub fn string(name: &str, s: &str) -> AttributeProto {
        AttributeProto { s: s.as_bytes().to_vec(), ..Self::named(name, AttributeType::String) }
    }

    pub fn tensor(name: &str, t: TensorProto) -> AttributeProto {
        AttributeProto { t: Some(t), ..Self::named(name, AttributeType::Tensor) }
    }

    /// The type tag, if it holds a known enum value.
    pub fn attr_type(&self) -> Option<AttributeType> {
        AttributeType::from_i32(self.r#type)
    }
}

/// Rust views of the payload carried by an attribute of a given type tag.
pub trait AttrValue<'a>: Sized {
    const TYPE: AttributeType;
    fn from_attr(attr: &'a AttributeProto) -> Option<Self>;
}

impl<'a> AttrValue<'a> for i64 {
    const TYPE: AttributeType = AttributeType::Int;
    fn from_attr(attr: &'a AttributeProto) -> Option<Self> {
        Some(attr.i)
    }
}

impl<'a> AttrValue<'a> for f32 {
    const TYPE: AttributeType = AttributeType::Float;
    fn from_attr(attr: &'a AttributeProto) -> Option<Self> {
        Some(attr.f)
    }
}

impl<'a> AttrValue<'a> for &'a str {
    const TYPE: AttributeType = AttributeType::String;
    fn from_attr(attr: &'a AttributeProto) -> Option<Self> {
        str::from_utf8(&attr.s).ok()
    }
}

impl<'a> AttrValue<'a> for &'a [i64] {
    const TYPE: AttributeType = AttributeType::Ints;
    fn from_attr(attr: &'a AttributeProto) -> Option<Self> {
        Some(&attr.ints)
    }
}

impl<'a> AttrValue<'a> for &'a [f32] {
    const TYPE: AttributeType = AttributeType::Floats;
    fn from_attr(attr: &'a AttributeProto) -> Option<Self> {
        Some(&attr.floats)
    }
}

impl<'a> AttrValue<'a> for &'a TensorProto {
    const TYPE: AttributeType = AttributeType::Tensor;
    fn from_attr(attr: &'a AttributeProto) -> Option<Self> {
        attr.t.as_ref()
    }
}

impl NodeProto {
    pub fn bail<T>(&self, msg: &str) -> XfeatResult<T> {
        bail!("Node {} ({}): {}", self.name, self.op_type, msg)
    }

    pub fn find_attr(&self, name: &str) -> Option<&AttributeProto> {
        self.attribute.iter().find(|a| a.name == name)
    }

    pub fn get_attr_opt<'a, T: AttrValue<'a>>(&'a self, name: &str) -> XfeatResult<Option<T>> {
        let Some(attr) = self.find_attr(name) else {
            return Ok(None);
        };
        let found = attr.attr_type().unwrap_or(AttributeType::Undefined);
        if found != T::TYPE {
            return self.bail(&format!("attribute {name:?} is a {found}, expected {}", T::TYPE));
        }
        match T::from_attr(attr) {
            Some(v) => Ok(Some(v)),
            None => self.bail(&format!("invalid payload for attribute {name:?}")),
        }
    }

    pub fn get_attr<'a, T: AttrValue<'a>>(&'a self, name: &str) -> XfeatResult<T> {
        match self.get_attr_opt(name)? {
            Some(v) => Ok(v),
            None => self.bail(&format!("missing attribute {name:?}")),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn node_with(attrs: Vec<AttributeProto>) -> NodeProto {
        NodeProto {
            name: "n".to_string(),
            op_type: "Test".to_string(),
            attribute: attrs,
            ..NodeProto::default()
        }
    }

    #[test]
    fn typed_access() {
        let node = node_with(vec![
            AttributeProto::int("axis", 2),
            AttributeProto::ints("axes", &[2, 3]),
            AttributeProto::float("epsilon", 1e-5),
            AttributeProto::string("mode", "linear"),
        ]);
        assert_eq!(node.get_attr::<i64>("axis").unwrap(), 2);
        assert_eq!(node.get_attr::<&[i64]>("axes").unwrap(), &[2, 3]);
        assert_eq!(node.get_attr::<f32>("epsilon").unwrap(), 1e-5);
        assert_eq!(node.get_attr::<&str>("mode").unwrap(), "linear");
    }

    #[test]
    fn type_tag_mismatch_is_an_error() {
        let node = node_with(vec![AttributeProto::int("axis", 2)]);
        let err = node.get_attr::<f32>("axis").unwrap_err();
        assert!(err.to_string().contains("expected float"), "{err}");
    }

    #[test]
    fn optional_attr_absent() {
        let node = node_with(vec![]);
        assert!(node.get_attr_opt::<i64>("axis").unwrap().is_none());
        assert!(node.get_attr::<i64>("axis").is_err());
    }
}
