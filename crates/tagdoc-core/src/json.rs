use serde_json::json;

use crate::error::{Error, Result};
use crate::field::{Field, FieldKind};
use crate::group::NodeGroup;
use crate::node::{Body, Child, Node};
use crate::tree::Tree;
use crate::value::Value;

#[derive(Debug, Clone, Copy)]
pub struct JsonOpts {
    pub max_array_elems: usize,
    pub bytes_summary: bool,
    /// Emit unassigned blocks as `null` instead of leaving them out.
    pub include_unassigned: bool,
}

impl Default for JsonOpts {
    fn default() -> Self {
        Self {
            max_array_elems: 128,
            bytes_summary: true,
            include_unassigned: false,
        }
    }
}

pub fn document_to_json_value(tree: &Tree, opts: JsonOpts) -> serde_json::Value {
    let groups = tree.groups();
    let mut out = serde_json::Map::new();
    out.insert("$format".into(), json!(tree.format().name()));
    out.insert("root".into(), node_to_json(tree.root(), groups, &opts));
    let mut by_group = serde_json::Map::new();
    for g in groups {
        let items = g
            .iter()
            .enumerate()
            .map(|(i, e)| {
                let mut v = node_to_json(&e.node, groups, &opts);
                if let Some(map) = v.as_object_mut() {
                    map.insert("$index".into(), json!(i));
                    if let Some(name) = &e.name {
                        map.insert("$name".into(), json!(name));
                    }
                }
                v
            })
            .collect();
        by_group.insert(g.name().to_string(), truncate(items, &opts));
    }
    out.insert("groups".into(), serde_json::Value::Object(by_group));
    if !tree.tail().is_empty() {
        out.insert("$tail".into(), bytes_to_json(tree.tail(), &opts));
    }
    serde_json::Value::Object(out)
}

pub fn dump_json(tree: &Tree, opts: JsonOpts) -> Result<String> {
    Ok(serde_json::to_string_pretty(&document_to_json_value(tree, opts))?)
}

pub fn node_to_json(node: &Node, groups: &[NodeGroup], opts: &JsonOpts) -> serde_json::Value {
    let mut map = serde_json::Map::new();
    map.insert("$tag".into(), json!(node.tag().as_str()));
    if node.is_malformed() {
        map.insert("$malformed".into(), json!(true));
    }
    for child in node.children() {
        match child {
            Child::Field(f) => {
                map.insert(f.name().to_string(), field_to_json(f, groups, opts));
            }
            Child::Block(b) => {
                if !b.is_assigned() && !opts.include_unassigned {
                    continue;
                }
                let v = match (b.is_assigned(), b.body()) {
                    (false, _) => serde_json::Value::Null,
                    (true, Body::Leaf(_)) => b
                        .leaf_field()
                        .map_or(serde_json::Value::Null, |f| field_to_json(f, groups, opts)),
                    (true, Body::Node(n)) => node_to_json(n, groups, opts),
                };
                map.insert(b.tag().to_string(), v);
            }
            Child::List(l) => {
                let items = l.items().iter().map(|n| node_to_json(n, groups, opts)).collect();
                map.insert(l.tag().to_string(), truncate(items, opts));
            }
            Child::Group(g) => {
                if let Some(group) = groups.get(g.0) {
                    map.insert(
                        group.tag().to_string(),
                        json!({ "$group": group.name(), "len": group.len() }),
                    );
                }
            }
        }
    }
    if !node.trailing().is_empty() {
        map.insert("$trailing".into(), bytes_to_json(node.trailing(), opts));
    }
    serde_json::Value::Object(map)
}

pub fn field_to_json(field: &Field, groups: &[NodeGroup], opts: &JsonOpts) -> serde_json::Value {
    if let Some(spec) = field.kind().ref_spec() {
        let flat = field.flatten(groups);
        return match (spec.count, flat.as_slice()) {
            (Some(1), [one]) => json!(one),
            _ => truncate(flat.iter().map(|i| json!(i)).collect(), opts),
        };
    }
    if let Some(label) = field.enum_label() {
        return json!(label);
    }
    value_to_json(field.value(), opts)
}

pub fn value_to_json(value: &Value, opts: &JsonOpts) -> serde_json::Value {
    match value {
        Value::Int(n) => json!(n),
        Value::F32(x) => json!(x),
        Value::F64(x) => json!(x),
        Value::Bool(b) => json!(b),
        Value::Str(s) => json!(s),
        Value::Floats(v) => truncate(v.iter().map(|x| json!(x)).collect(), opts),
        Value::Ints(v) => truncate(v.iter().map(|x| json!(x)).collect(), opts),
        Value::Bytes(b) => bytes_to_json(b, opts),
    }
}

fn bytes_to_json(b: &[u8], opts: &JsonOpts) -> serde_json::Value {
    if opts.bytes_summary {
        json!({"$type": "bytes", "len": b.len()})
    } else {
        truncate(b.iter().map(|x| json!(x)).collect(), opts)
    }
}

fn truncate(mut items: Vec<serde_json::Value>, opts: &JsonOpts) -> serde_json::Value {
    if items.len() > opts.max_array_elems {
        let omitted = items.len() - opts.max_array_elems;
        items.truncate(opts.max_array_elems);
        items.push(json!({"$truncated": true, "$omitted": omitted}));
    }
    serde_json::Value::Array(items)
}

/// Convert user-supplied JSON into a value for a field of `kind`. Range and
/// length checks happen when the value is applied.
pub fn json_to_value(kind: &FieldKind, v: &serde_json::Value) -> Result<Value> {
    let bad = || Error::InvalidValue {
        field: format!("{kind:?}"),
        message: format!("cannot use {v} here"),
    };
    let ints = |arr: &Vec<serde_json::Value>| -> Result<Vec<i64>> {
        arr.iter().map(|x| x.as_i64().ok_or_else(bad)).collect()
    };
    let out = match (kind, v) {
        (FieldKind::Enum { variants, .. }, serde_json::Value::String(s)) => Value::Int(
            variants
                .iter()
                .find(|x| x.label.eq_ignore_ascii_case(s))
                .map(|x| x.value)
                .ok_or_else(bad)?,
        ),
        (FieldKind::Bool { .. }, serde_json::Value::Bool(b)) => Value::Bool(*b),
        (
            FieldKind::Int { .. } | FieldKind::Enum { .. } | FieldKind::Bool { .. },
            serde_json::Value::Number(n),
        ) => Value::Int(n.as_i64().or_else(|| n.as_u64().map(|u| u as i64)).ok_or_else(bad)?),
        (FieldKind::F32, serde_json::Value::Number(n)) => Value::F32(n.as_f64().ok_or_else(bad)? as f32),
        (FieldKind::F64, serde_json::Value::Number(n)) => Value::F64(n.as_f64().ok_or_else(bad)?),
        (
            FieldKind::PaddedString { .. } | FieldKind::CString | FieldKind::PrefixedString { .. },
            serde_json::Value::String(s),
        ) => Value::Str(s.clone()),
        (FieldKind::Vector { .. }, serde_json::Value::Array(arr)) => Value::Floats(
            arr.iter()
                .map(|x| x.as_f64().map(|f| f as f32).ok_or_else(bad))
                .collect::<Result<_>>()?,
        ),
        (FieldKind::IntList { .. } | FieldKind::Reference(_), serde_json::Value::Array(arr)) => {
            Value::Ints(ints(arr)?)
        }
        (FieldKind::Reference(_), serde_json::Value::Number(n)) => Value::Int(n.as_i64().ok_or_else(bad)?),
        (FieldKind::Bytes { .. }, serde_json::Value::Array(arr)) => Value::Bytes(
            arr.iter()
                .map(|x| x.as_u64().and_then(|b| u8::try_from(b).ok()).ok_or_else(bad))
                .collect::<Result<_>>()?,
        ),
        _ => return Err(bad()),
    };
    Ok(out)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::field::FieldKind;

    #[test]
    fn enum_labels_and_numbers() {
        let kind = FieldKind::enumeration(4, &[(0, "Point"), (2, "Spline")]);
        assert_eq!(json_to_value(&kind, &json!("spline")).unwrap(), Value::Int(2));
        assert_eq!(json_to_value(&kind, &json!(7)).unwrap(), Value::Int(7));
        assert!(json_to_value(&kind, &json!("Nope")).is_err());
    }

    #[test]
    fn arrays_and_strings() {
        let v = json_to_value(&FieldKind::Vector { count: 3 }, &json!([1, 2.5, 3])).unwrap();
        assert_eq!(v, Value::Floats(vec![1.0, 2.5, 3.0]));
        assert!(json_to_value(&FieldKind::CString, &json!(5)).is_err());
        let b = json_to_value(&FieldKind::Bytes { len: None }, &json!([1, 255])).unwrap();
        assert_eq!(b, Value::Bytes(vec![1, 255]));
        assert!(json_to_value(&FieldKind::Bytes { len: None }, &json!([256])).is_err());
    }

    #[test]
    fn long_arrays_are_truncated() {
        let opts = JsonOpts {
            max_array_elems: 2,
            ..JsonOpts::default()
        };
        let v = value_to_json(&Value::Ints(vec![1, 2, 3, 4]), &opts);
        assert_eq!(v, json!([1, 2, {"$truncated": true, "$omitted": 2}]));
    }
}
