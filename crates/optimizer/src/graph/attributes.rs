// Typed node attributes
//
// Attributes the optimizer inspects or emits are decoded into `AttrValue`;
// everything else (subgraphs, tensor lists, attribute references) is carried
// as the original proto so it round-trips unchanged.

use crate::proto::attribute_proto::AttributeType;
use crate::proto::{AttributeProto, TensorProto};

/// Decoded attribute value
#[derive(Debug, Clone, PartialEq)]
pub enum AttrValue {
    Float(f32),
    Int(i64),
    String(Vec<u8>),
    Tensor(TensorProto),
    Floats(Vec<f32>),
    Ints(Vec<i64>),
    Strings(Vec<Vec<u8>>),
    /// Any attribute kind not decoded above, kept verbatim
    Other(AttributeProto),
}

impl AttrValue {
    /// Decode an attribute proto. Untyped protos (type 0, emitted by some
    /// old exporters) are inferred from the populated field.
    pub fn from_proto(attr: &AttributeProto) -> Self {
        let kind = AttributeType::try_from(attr.r#type).unwrap_or(AttributeType::Undefined);
        match kind {
            AttributeType::Float => AttrValue::Float(attr.f),
            AttributeType::Int => AttrValue::Int(attr.i),
            AttributeType::String => AttrValue::String(attr.s.clone()),
            AttributeType::Tensor => match &attr.t {
                Some(t) => AttrValue::Tensor(t.clone()),
                None => AttrValue::Other(attr.clone()),
            },
            AttributeType::Floats => AttrValue::Floats(attr.floats.clone()),
            AttributeType::Ints => AttrValue::Ints(attr.ints.clone()),
            AttributeType::Strings => AttrValue::Strings(attr.strings.clone()),
            AttributeType::Undefined if attr.ref_attr_name.is_empty() => {
                if let Some(t) = &attr.t {
                    AttrValue::Tensor(t.clone())
                } else if !attr.ints.is_empty() {
                    AttrValue::Ints(attr.ints.clone())
                } else if !attr.floats.is_empty() {
                    AttrValue::Floats(attr.floats.clone())
                } else if !attr.s.is_empty() {
                    AttrValue::String(attr.s.clone())
                } else if attr.f != 0.0 {
                    AttrValue::Float(attr.f)
                } else {
                    AttrValue::Int(attr.i)
                }
            }
            _ => AttrValue::Other(attr.clone()),
        }
    }

    /// Encode back to a proto under the given name
    pub fn to_proto(&self, name: &str) -> AttributeProto {
        let mut attr = AttributeProto {
            name: name.to_string(),
            ..Default::default()
        };
        match self {
            AttrValue::Float(f) => {
                attr.r#type = AttributeType::Float as i32;
                attr.f = *f;
            }
            AttrValue::Int(i) => {
                attr.r#type = AttributeType::Int as i32;
                attr.i = *i;
            }
            AttrValue::String(s) => {
                attr.r#type = AttributeType::String as i32;
                attr.s = s.clone();
            }
            AttrValue::Tensor(t) => {
                attr.r#type = AttributeType::Tensor as i32;
                attr.t = Some(t.clone());
            }
            AttrValue::Floats(v) => {
                attr.r#type = AttributeType::Floats as i32;
                attr.floats = v.clone();
            }
            AttrValue::Ints(v) => {
                attr.r#type = AttributeType::Ints as i32;
                attr.ints = v.clone();
            }
            AttrValue::Strings(v) => {
                attr.r#type = AttributeType::Strings as i32;
                attr.strings = v.clone();
            }
            AttrValue::Other(proto) => {
                attr = proto.clone();
                attr.name = name.to_string();
            }
        }
        attr
    }

    pub fn as_int(&self) -> Option<i64> {
        match self {
            AttrValue::Int(i) => Some(*i),
            _ => None,
        }
    }

    pub fn as_float(&self) -> Option<f32> {
        match self {
            AttrValue::Float(f) => Some(*f),
            _ => None,
        }
    }

    pub fn as_ints(&self) -> Option<&[i64]> {
        match self {
            AttrValue::Ints(v) => Some(v),
            _ => None,
        }
    }

    pub fn as_tensor(&self) -> Option<&TensorProto> {
        match self {
            AttrValue::Tensor(t) => Some(t),
            _ => None,
        }
    }
}

impl From<f32> for AttrValue {
    fn from(value: f32) -> Self {
        AttrValue::Float(value)
    }
}

impl From<i64> for AttrValue {
    fn from(value: i64) -> Self {
        AttrValue::Int(value)
    }
}

impl From<Vec<i64>> for AttrValue {
    fn from(value: Vec<i64>) -> Self {
        AttrValue::Ints(value)
    }
}

impl From<&str> for AttrValue {
    fn from(value: &str) -> Self {
        AttrValue::String(value.as_bytes().to_vec())
    }
}

impl From<TensorProto> for AttrValue {
    fn from(value: TensorProto) -> Self {
        AttrValue::Tensor(value)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::proto::GraphProto;

    #[test]
    fn test_typed_attribute_decodes() {
        let proto = AttrValue::Ints(vec![0, 2, 1, 3]).to_proto("perm");
        assert_eq!(proto.r#type, AttributeType::Ints as i32);
        assert_eq!(AttrValue::from_proto(&proto).as_ints(), Some(&[0, 2, 1, 3][..]));
    }

    #[test]
    fn test_untyped_attribute_inferred() {
        let proto = AttributeProto {
            name: "epsilon".into(),
            f: 1e-12,
            ..Default::default()
        };
        assert_eq!(AttrValue::from_proto(&proto).as_float(), Some(1e-12));
    }

    #[test]
    fn test_graph_attribute_kept_opaque() {
        let proto = AttributeProto {
            name: "then_branch".into(),
            r#type: AttributeType::Graph as i32,
            g: Some(Box::new(GraphProto {
                name: "branch".into(),
                ..Default::default()
            })),
            ..Default::default()
        };
        let value = AttrValue::from_proto(&proto);
        assert!(matches!(value, AttrValue::Other(_)));
        assert_eq!(value.to_proto("then_branch"), proto);
    }
}
