//! Per-format descriptor tables.
//!
//! A format is configuration data: which tag is the container magic, how tags
//! are laid out on disk, the block alignment, the document-level groups, and
//! for every node tag the ordered list of children it is made of. Descriptors
//! can be written in Rust (see [`crate::formats`]) or loaded from JSON.

use std::collections::{HashMap, HashSet};

use serde::{Deserialize, Serialize};

use crate::error::{Error, Result};
use crate::field::{Field, FieldKind};
use crate::group::{GroupId, NodeGroup};
use crate::node::{Block, Child, Node, NodeList};
use crate::tag::{Tag, TagOrder};
use crate::value::Value;

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct FormatDescriptor {
    pub name: String,
    /// Tag of the root node.
    pub magic: Tag,
    #[serde(default)]
    pub tag_order: TagOrder,
    #[serde(default = "default_align")]
    pub align: u32,
    #[serde(default)]
    pub groups: Vec<GroupDef>,
    pub nodes: Vec<NodeDef>,
}

fn default_align() -> u32 {
    1
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct GroupDef {
    pub name: String,
    /// Tag of the entity nodes stored in the group.
    pub tag: Tag,
}

impl GroupDef {
    pub fn new(name: &str, tag: &str) -> Self {
        Self {
            name: name.to_string(),
            tag: Tag::lit(tag),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct NodeDef {
    pub tag: Tag,
    #[serde(default)]
    pub name: String,
    pub children: Vec<ChildDef>,
}

impl NodeDef {
    pub fn new(tag: &str, children: Vec<ChildDef>) -> Self {
        Self {
            tag: Tag::lit(tag),
            name: String::new(),
            children,
        }
    }

    pub fn named(mut self, name: &str) -> Self {
        self.name = name.to_string();
        self
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "child", rename_all = "snake_case")]
pub enum ChildDef {
    Field {
        name: String,
        kind: FieldKind,
        #[serde(default)]
        default: Option<Value>,
    },
    /// Optional block holding one field.
    Leaf {
        tag: Tag,
        name: String,
        kind: FieldKind,
        #[serde(default)]
        default: Option<Value>,
        #[serde(default)]
        locked: bool,
    },
    /// Optional block holding a node defined elsewhere in the table.
    Block {
        tag: Tag,
        #[serde(default)]
        locked: bool,
    },
    List {
        tag: Tag,
    },
    Group {
        group: String,
    },
}

impl ChildDef {
    pub fn field(name: &str, kind: FieldKind) -> Self {
        ChildDef::Field {
            name: name.to_string(),
            kind,
            default: None,
        }
    }

    pub fn leaf(tag: &str, name: &str, kind: FieldKind) -> Self {
        ChildDef::Leaf {
            tag: Tag::lit(tag),
            name: name.to_string(),
            kind,
            default: None,
            locked: false,
        }
    }

    pub fn block(tag: &str) -> Self {
        ChildDef::Block {
            tag: Tag::lit(tag),
            locked: false,
        }
    }

    pub fn list(tag: &str) -> Self {
        ChildDef::List { tag: Tag::lit(tag) }
    }

    pub fn group(name: &str) -> Self {
        ChildDef::Group {
            group: name.to_string(),
        }
    }

    /// Always present; cannot be toggled. No effect on fields, lists and groups.
    pub fn locked(mut self) -> Self {
        if let ChildDef::Leaf { locked, .. } | ChildDef::Block { locked, .. } = &mut self {
            *locked = true;
        }
        self
    }

    pub fn with_default(mut self, value: impl Into<Value>) -> Self {
        if let ChildDef::Field { default, .. } | ChildDef::Leaf { default, .. } = &mut self {
            *default = Some(value.into());
        }
        self
    }

    fn tag(&self) -> Option<Tag> {
        match self {
            ChildDef::Leaf { tag, .. } | ChildDef::Block { tag, .. } | ChildDef::List { tag } => {
                Some(*tag)
            }
            _ => None,
        }
    }

    fn kind_and_default(&self) -> Option<(&str, &FieldKind, &Option<Value>)> {
        match self {
            ChildDef::Field {
                name,
                kind,
                default,
            }
            | ChildDef::Leaf {
                name,
                kind,
                default,
                ..
            } => Some((name.as_str(), kind, default)),
            _ => None,
        }
    }
}

impl FormatDescriptor {
    pub fn from_json(text: &str) -> Result<Self> {
        Ok(serde_json::from_str(text)?)
    }

    pub fn to_json(&self) -> Result<String> {
        Ok(serde_json::to_string_pretty(self)?)
    }

    /// Check the table is self-consistent: every tag is well formed and
    /// defined once, groups and references name existing groups, group slots
    /// only appear in the root node, defaults fit their kinds and blocks do
    /// not contain themselves.
    pub fn validate(&self) -> Result<()> {
        let bad = |msg: String| Err(Error::Descriptor(format!("{}: {msg}", self.name)));

        if self.align == 0 {
            return bad("align must be at least 1".into());
        }
        let mut defs: HashMap<Tag, &NodeDef> = HashMap::new();
        for def in &self.nodes {
            if !def.tag.is_valid() {
                return bad(format!("invalid node tag {:?}", def.tag));
            }
            if defs.insert(def.tag, def).is_some() {
                return bad(format!("node {} defined twice", def.tag));
            }
        }
        if !defs.contains_key(&self.magic) {
            return bad(format!("no node definition for magic {}", self.magic));
        }

        let mut names = HashSet::new();
        let mut tags = HashSet::new();
        for g in &self.groups {
            if !names.insert(g.name.as_str()) {
                return bad(format!("group '{}' declared twice", g.name));
            }
            if !tags.insert(g.tag) {
                return bad(format!("two groups hold {} nodes", g.tag));
            }
            if !defs.contains_key(&g.tag) {
                return bad(format!("group '{}' holds undefined node {}", g.name, g.tag));
            }
        }

        for def in &self.nodes {
            for child in &def.children {
                if let Some(tag) = child.tag()
                    && !tag.is_valid()
                {
                    return bad(format!("{}: invalid child tag {tag:?}", def.tag));
                }
                match child {
                    ChildDef::Block { tag, .. } | ChildDef::List { tag } if !defs.contains_key(tag) => {
                        return bad(format!("{}: child {tag} has no node definition", def.tag));
                    }
                    ChildDef::Group { group } => {
                        if def.tag != self.magic {
                            return bad(format!("{}: group slot '{group}' outside the root node", def.tag));
                        }
                        if !names.contains(group.as_str()) {
                            return bad(format!("{}: unknown group '{group}'", def.tag));
                        }
                    }
                    _ => {}
                }
                if let Some((name, kind, default)) = child.kind_and_default() {
                    if let Err(e) = kind.check() {
                        return bad(format!("{}.{name}: {e}", def.tag));
                    }
                    if let Some(spec) = kind.ref_spec()
                        && !names.contains(spec.group.as_str())
                    {
                        return bad(format!("{}.{name}: unknown group '{}'", def.tag, spec.group));
                    }
                    if let Some(value) = default
                        && let Err(e) = kind.coerce(value.clone())
                    {
                        return bad(format!("{}.{name}: default {e}", def.tag));
                    }
                }
            }
        }

        // blocks are instantiated eagerly, so a block may not contain itself
        fn visit(tag: Tag, defs: &HashMap<Tag, &NodeDef>, stack: &mut Vec<Tag>) -> Option<Tag> {
            if stack.contains(&tag) {
                return Some(tag);
            }
            stack.push(tag);
            let found = defs.get(&tag).and_then(|def| {
                def.children.iter().find_map(|c| match c {
                    ChildDef::Block { tag, .. } => visit(*tag, defs, stack),
                    _ => None,
                })
            });
            stack.pop();
            found
        }
        for def in &self.nodes {
            if let Some(tag) = visit(def.tag, &defs, &mut Vec::new()) {
                return bad(format!("block {tag} contains itself"));
            }
        }
        Ok(())
    }
}

/// A validated descriptor with lookup tables.
#[derive(Debug, Clone)]
pub struct Format {
    desc: FormatDescriptor,
    nodes: HashMap<Tag, usize>,
    /// On-disk bytes of every tag the descriptor models.
    known: HashSet<[u8; 4]>,
}

impl Format {
    pub fn new(desc: FormatDescriptor) -> Result<Self> {
        desc.validate()?;
        let nodes = desc
            .nodes
            .iter()
            .enumerate()
            .map(|(i, d)| (d.tag, i))
            .collect();
        let order = desc.tag_order;
        let known = desc
            .nodes
            .iter()
            .flat_map(|d| std::iter::once(d.tag).chain(d.children.iter().filter_map(ChildDef::tag)))
            .map(|t| t.to_disk(order))
            .collect();
        Ok(Self { desc, nodes, known })
    }

    pub fn from_json(text: &str) -> Result<Self> {
        Self::new(FormatDescriptor::from_json(text)?)
    }

    pub fn descriptor(&self) -> &FormatDescriptor {
        &self.desc
    }

    pub fn name(&self) -> &str {
        &self.desc.name
    }

    pub fn magic(&self) -> Tag {
        self.desc.magic
    }

    pub fn tag_order(&self) -> TagOrder {
        self.desc.tag_order
    }

    pub fn align(&self) -> u32 {
        self.desc.align
    }

    pub fn groups(&self) -> &[GroupDef] {
        &self.desc.groups
    }

    pub fn group_id(&self, name: &str) -> Option<GroupId> {
        self.desc.groups.iter().position(|g| g.name == name).map(GroupId)
    }

    pub fn group_by_tag(&self, tag: Tag) -> Option<GroupId> {
        self.desc.groups.iter().position(|g| g.tag == tag).map(GroupId)
    }

    pub fn node_def(&self, tag: Tag) -> Option<&NodeDef> {
        self.nodes.get(&tag).map(|&i| &self.desc.nodes[i])
    }

    pub fn is_known(&self, tag: Tag) -> bool {
        self.knows(tag.to_disk(self.desc.tag_order))
    }

    pub(crate) fn knows(&self, raw: [u8; 4]) -> bool {
        self.known.contains(&raw)
    }

    /// One empty group per declared group, in declaration order.
    pub fn empty_groups(&self) -> Vec<NodeGroup> {
        self.desc
            .groups
            .iter()
            .enumerate()
            .map(|(i, g)| NodeGroup::new(GroupId(i), g.name.clone(), g.tag))
            .collect()
    }

    /// A fresh node of `tag` with every field at its default and every
    /// optional block unassigned (locked blocks assigned).
    pub fn instantiate(&self, tag: Tag) -> Result<Node> {
        let def = self
            .node_def(tag)
            .ok_or_else(|| Error::Descriptor(format!("{}: no node definition for {tag}", self.desc.name)))?;
        let mut children = Vec::with_capacity(def.children.len());
        for child in &def.children {
            children.push(match child {
                ChildDef::Field {
                    name,
                    kind,
                    default,
                } => Child::Field(self.field(name, kind, default)?),
                ChildDef::Leaf {
                    tag,
                    name,
                    kind,
                    default,
                    locked,
                } => Child::Block(Block::new_leaf(*tag, self.field(name, kind, default)?, *locked)),
                ChildDef::Block { tag, locked } => {
                    Child::Block(Block::new_node(self.instantiate(*tag)?, *locked))
                }
                ChildDef::List { tag } => Child::List(NodeList::new(*tag)),
                ChildDef::Group { group } => Child::Group(
                    self.group_id(group)
                        .ok_or_else(|| Error::Descriptor(format!("unknown group '{group}'")))?,
                ),
            });
        }
        Ok(Node::new(tag, def.name.clone(), children))
    }

    fn field(&self, name: &str, kind: &FieldKind, default: &Option<Value>) -> Result<Field> {
        let target = match kind.ref_spec() {
            Some(spec) => Some(
                self.group_id(&spec.group)
                    .ok_or_else(|| Error::Descriptor(format!("unknown group '{}'", spec.group)))?,
            ),
            None => None,
        };
        Ok(Field::new(name, kind.clone(), default.clone()).with_target(target))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::tag::tag;

    fn minimal() -> FormatDescriptor {
        FormatDescriptor {
            name: "mini".into(),
            magic: tag("ROOT"),
            tag_order: TagOrder::Forward,
            align: 1,
            groups: vec![GroupDef::new("items", "Item")],
            nodes: vec![
                NodeDef::new("ROOT", vec![ChildDef::group("items")]),
                NodeDef::new(
                    "Item",
                    vec![
                        ChildDef::leaf("Next", "Next", FieldKind::reference("items", 4, -1)),
                        ChildDef::block("Opt"),
                    ],
                ),
                NodeDef::new("Opt", vec![ChildDef::field("X", FieldKind::F32).with_default(1.5f32)]),
            ],
        }
    }

    #[test]
    fn loads_from_json() {
        let json = r#"{
            "name": "mini",
            "magic": "ROOT",
            "tag_order": "reversed",
            "groups": [{ "name": "items", "tag": "Item" }],
            "nodes": [
                { "tag": "ROOT", "children": [{ "child": "group", "group": "items" }] },
                { "tag": "Item", "children": [
                    { "child": "field", "name": "Kind", "kind": { "type": "int", "width": 4 },
                      "default": { "int": 3 } },
                    { "child": "leaf", "tag": "Ref", "name": "Ref",
                      "kind": { "type": "reference", "group": "items", "sentinel": -1, "signed": true } }
                ] }
            ]
        }"#;
        let fmt = Format::from_json(json).unwrap();
        assert_eq!(fmt.tag_order(), TagOrder::Reversed);
        assert_eq!(fmt.align(), 1);
        let item = fmt.instantiate(tag("Item")).unwrap();
        assert_eq!(item.children()[0].field().unwrap().value(), &Value::Int(3));
        assert!(fmt.is_known(tag("Ref")));
        assert!(!fmt.is_known(tag("Zzz")));
    }

    #[test]
    fn instantiate_sets_targets_and_assignment() {
        let fmt = Format::new(minimal()).unwrap();
        let item = fmt.instantiate(tag("Item")).unwrap();
        let Child::Block(next) = &item.children()[0] else { panic!() };
        assert!(!next.is_assigned());
        assert_eq!(next.leaf_field().unwrap().target(), Some(GroupId(0)));
        let Child::Block(opt) = &item.children()[1] else { panic!() };
        let x = opt.node().unwrap().children()[0].field().unwrap();
        assert_eq!(x.value(), &Value::F32(1.5));
        assert!(!x.is_assigned());
    }

    #[test]
    fn rejects_inconsistent_tables() {
        let mut d = minimal();
        d.nodes[1].children.push(ChildDef::group("items"));
        assert!(d.validate().is_err(), "group slot outside root");

        let mut d = minimal();
        d.nodes[2].children.push(ChildDef::block("Opt"));
        assert!(d.validate().is_err(), "self-containing block");

        let mut d = minimal();
        d.nodes[1].children[0] = ChildDef::leaf("Next", "Next", FieldKind::reference("nope", 4, -1));
        assert!(d.validate().is_err(), "unknown reference group");

        let mut d = minimal();
        d.nodes[2].children[0] = ChildDef::field("X", FieldKind::uint(1)).with_default(Value::Int(300));
        assert!(d.validate().is_err(), "default out of range");

        let mut d = minimal();
        d.magic = tag("NONE");
        assert!(d.validate().is_err(), "undefined magic");

        let mut d = minimal();
        let mut unsigned = FieldKind::reference("items", 4, -1);
        if let FieldKind::Reference(spec) = &mut unsigned {
            spec.signed = false;
        }
        d.nodes[1].children[0] = ChildDef::leaf("Next", "Next", unsigned);
        assert!(d.validate().is_err(), "negative sentinel on an unsigned reference");
    }

    #[test]
    fn zero_width_int_is_a_descriptor_error() {
        let json = r#"{
            "name": "bad",
            "magic": "ROOT",
            "nodes": [
                { "tag": "ROOT", "children": [
                    { "child": "field", "name": "N", "kind": { "type": "int", "width": 0 },
                      "default": { "int": 1 } }
                ] }
            ]
        }"#;
        match Format::from_json(json) {
            Err(Error::Descriptor(msg)) => assert!(msg.contains("width 0"), "{msg}"),
            other => panic!("expected a descriptor error, got {other:?}"),
        }
    }
}
