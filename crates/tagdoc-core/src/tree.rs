//! The parsed document tree: root node, groups and unmodeled tail bytes.
//!
//! All structural edits go through here so that reference fields are kept in
//! step with the groups they point into. The tree does not record history;
//! [`crate::commands`] wraps these operations into reversible commands.

use std::collections::BTreeSet;
use std::sync::Arc;

use log::debug;

use crate::cursor::{Cursor, Writer};
use crate::descriptor::Format;
use crate::error::{Diagnostic, Error, Result};
use crate::field::{Field, FieldState};
use crate::group::{Entity, EntityId, GroupChange, GroupId, GroupIndex, NodeGroup};
use crate::node::{Block, Child, Node, NodeList, ReadCtx, WriteCtx};
use crate::path::{Owner, Path, Slot, SlotMut, steps_by_name, split_segment, walk, walk_mut};
use crate::value::Value;

#[derive(Debug, Clone)]
pub struct Tree {
    format: Arc<Format>,
    root: Node,
    groups: Vec<NodeGroup>,
    /// Bytes after the root block (padding, appended data).
    tail: Vec<u8>,
    next_id: u32,
}

/// A reference slot that currently links to some entity.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct LinkSite {
    pub path: Path,
    pub slot: usize,
}

impl Tree {
    /// An empty document: root at its defaults, no entities.
    pub fn new(format: Arc<Format>) -> Result<Self> {
        let root = format.instantiate(format.magic())?;
        let groups = format.empty_groups();
        Ok(Self {
            format,
            root,
            groups,
            tail: Vec::new(),
            next_id: 0,
        })
    }

    pub fn parse(format: Arc<Format>, bytes: &[u8]) -> Result<(Self, Vec<Diagnostic>)> {
        let order = format.tag_order();
        let mut cur = Cursor::new(bytes);
        let header = cur
            .read_header()
            .map_err(|_| Error::InvalidDocument(format!("{} bytes is too short for a header", bytes.len())))?;
        if !header.is(format.magic(), order) {
            return Err(Error::InvalidDocument(format!(
                "expected magic {}, found {:02x?}",
                format.magic(),
                header.raw_tag
            )));
        }
        if header.size as usize > cur.remaining() {
            return Err(Error::InvalidDocument(format!(
                "declared size {} exceeds the {} bytes available",
                header.size,
                cur.remaining()
            )));
        }
        let body = cur.take(header.size as usize)?;

        let mut root = format.instantiate(format.magic())?;
        let mut ctx = ReadCtx::new(&format, format.empty_groups(), 0);
        root.read_content(body, &mut ctx);
        let ReadCtx {
            groups,
            next_id,
            mut diagnostics,
            ..
        } = ctx;
        let tail = cur.rest().to_vec();
        if !tail.is_empty() {
            debug!("{} bytes after the root block kept as tail", tail.len());
        }

        let mut tree = Self {
            format,
            root,
            groups,
            tail,
            next_id,
        };
        tree.resolve_references(&mut diagnostics);
        Ok((tree, diagnostics))
    }

    pub fn serialize(&self) -> Vec<u8> {
        let mut w = Writer::new();
        let ctx = self.write_ctx(&self.groups);
        let frame = w.begin_frame(self.root.tag(), ctx.order);
        self.root.write_content(&mut w, &ctx);
        // the container is never padded; anything after it is in the tail
        w.end_frame(frame, 1);
        w.write_bytes(&self.tail);
        w.into_inner()
    }

    fn write_ctx<'a>(&self, groups: &'a [NodeGroup]) -> WriteCtx<'a> {
        WriteCtx {
            order: self.format.tag_order(),
            align: self.format.align(),
            groups,
        }
    }

    pub fn format(&self) -> &Arc<Format> {
        &self.format
    }

    pub fn root(&self) -> &Node {
        &self.root
    }

    pub fn groups(&self) -> &[NodeGroup] {
        &self.groups
    }

    pub fn group(&self, id: GroupId) -> Option<&NodeGroup> {
        self.groups.get(id.0)
    }

    pub fn group_named(&self, name: &str) -> Option<&NodeGroup> {
        self.groups.iter().find(|g| g.name() == name)
    }

    pub fn tail(&self) -> &[u8] {
        &self.tail
    }

    /// Group and index of an entity.
    pub fn locate(&self, id: EntityId) -> Option<(GroupId, usize)> {
        self.groups
            .iter()
            .find_map(|g| g.index_of(id).map(|i| (g.id(), i)))
    }

    pub fn entity(&self, id: EntityId) -> Option<&Entity> {
        self.groups.iter().find_map(|g| g.entity(id))
    }

    pub(crate) fn entity_mut(&mut self, id: EntityId) -> Option<&mut Entity> {
        self.groups.iter_mut().find_map(|g| g.entity_mut(id))
    }

    pub(crate) fn alloc_id(&mut self) -> EntityId {
        let id = EntityId(self.next_id);
        self.next_id += 1;
        id
    }

    fn group_index(&self, id: GroupId) -> Result<GroupIndex> {
        self.groups
            .get(id.0)
            .map(NodeGroup::index)
            .ok_or_else(|| Error::InvalidOperation(format!("no group {}", id.0)))
    }

    // ---- addressing ----

    fn owner(&self, owner: Owner) -> Result<&Node> {
        match owner {
            Owner::Root => Ok(&self.root),
            Owner::Entity(id) => self
                .entity(id)
                .map(|e| &e.node)
                .ok_or_else(|| Error::InvalidOperation(format!("entity {id} does not exist"))),
        }
    }

    fn owner_mut(&mut self, owner: Owner) -> Result<&mut Node> {
        match owner {
            Owner::Root => Ok(&mut self.root),
            Owner::Entity(id) => self
                .entity_mut(id)
                .map(|e| &mut e.node)
                .ok_or_else(|| Error::InvalidOperation(format!("entity {id} does not exist"))),
        }
    }

    pub fn slot(&self, path: &Path) -> Result<Slot<'_>> {
        walk(self.owner(path.owner)?, &path.steps).ok_or_else(|| Error::InvalidPath {
            expected: "a child",
            path: path.to_string(),
        })
    }

    fn slot_mut(&mut self, path: &Path) -> Result<SlotMut<'_>> {
        let node = self.owner_mut(path.owner)?;
        walk_mut(node, &path.steps).ok_or_else(|| Error::InvalidPath {
            expected: "a child",
            path: path.to_string(),
        })
    }

    /// The node a path ends on: an owner, a list item or a block's body.
    pub fn node(&self, path: &Path) -> Result<&Node> {
        match self.slot(path)? {
            Slot::Node(n) => Ok(n),
            Slot::Child(Child::Block(b)) => b.node().ok_or_else(|| node_path(path)),
            Slot::Child(_) => Err(node_path(path)),
        }
    }

    pub fn field(&self, path: &Path) -> Result<&Field> {
        match self.slot(path)? {
            Slot::Child(c) => c.field().ok_or_else(|| field_path(path)),
            Slot::Node(_) => Err(field_path(path)),
        }
    }

    pub(crate) fn field_mut(&mut self, path: &Path) -> Result<&mut Field> {
        match self.slot_mut(path)? {
            SlotMut::Child(c) => c.field_mut().ok_or_else(|| field_path(path)),
            SlotMut::Node => Err(field_path(path)),
        }
    }

    pub fn block(&self, path: &Path) -> Result<&Block> {
        match self.slot(path)? {
            Slot::Child(Child::Block(b)) => Ok(b),
            _ => Err(Error::InvalidPath {
                expected: "an optional block",
                path: path.to_string(),
            }),
        }
    }

    pub(crate) fn block_mut(&mut self, path: &Path) -> Result<&mut Block> {
        match self.slot_mut(path)? {
            SlotMut::Child(Child::Block(b)) => Ok(b),
            _ => Err(Error::InvalidPath {
                expected: "an optional block",
                path: path.to_string(),
            }),
        }
    }

    pub fn list(&self, path: &Path) -> Result<&NodeList> {
        match self.slot(path)? {
            Slot::Child(Child::List(l)) => Ok(l),
            _ => Err(Error::InvalidPath {
                expected: "a list",
                path: path.to_string(),
            }),
        }
    }

    fn list_mut(&mut self, path: &Path) -> Result<&mut NodeList> {
        match self.slot_mut(path)? {
            SlotMut::Child(Child::List(l)) => Ok(l),
            _ => Err(Error::InvalidPath {
                expected: "a list",
                path: path.to_string(),
            }),
        }
    }

    /// Resolve a name path such as `Emit[0]/ItEm[1]/PrNo`. A leading
    /// `<group tag or name>[index]` selects an entity; otherwise names are
    /// looked up from the root node.
    pub fn resolve(&self, names: &str) -> Result<Path> {
        let invalid = || Error::InvalidPath {
            expected: "a named child",
            path: names.to_string(),
        };
        let mut segments = names.split('/').filter(|s| !s.is_empty()).peekable();
        let first = segments.peek().copied().ok_or_else(invalid)?;
        let (head, index) = split_segment(first).ok_or_else(invalid)?;
        let entity_group = index.and_then(|_| {
            self.groups
                .iter()
                .find(|g| g.tag().as_str() == head || g.name() == head)
        });
        let (owner, node) = match (entity_group, index) {
            (Some(group), Some(i)) => {
                segments.next();
                let entity = group.get(i).ok_or_else(invalid)?;
                (Owner::Entity(entity.id()), &entity.node)
            }
            _ => (Owner::Root, &self.root),
        };
        let steps = steps_by_name(node, segments).ok_or_else(invalid)?;
        Ok(Path { owner, steps })
    }

    // ---- field edits ----

    /// Set a field's value; returns the previous state for undo. Reference
    /// fields only accept indices inside their group or the sentinel.
    pub(crate) fn set_field(&mut self, path: &Path, value: Value) -> Result<FieldState> {
        let target = self.field(path)?.target();
        let index = target.map(|g| self.group_index(g)).transpose()?;
        let field = self.field_mut(path)?;
        let before = field.state();
        field.set_value(value)?;
        if let Some(index) = &index {
            let bad = match (field.kind().ref_spec(), field.value().as_ints()) {
                (Some(spec), Some(stored)) => stored.iter().copied().find(|i| {
                    *i != spec.sentinel && usize::try_from(*i).map_or(true, |i| i >= index.len())
                }),
                _ => None,
            };
            if let Some(bad) = bad {
                let message = format!("index {bad} is outside '{}' ({} entities)", index.name(), index.len());
                let name = field.name().to_string();
                field.restore(before);
                return Err(Error::InvalidValue { field: name, message });
            }
            field.resolve(index, &mut Vec::new());
        }
        Ok(before)
    }

    pub(crate) fn restore_field(&mut self, path: &Path, state: FieldState) -> Result<()> {
        self.field_mut(path)?.restore(state);
        Ok(())
    }

    /// Point one slot of a reference field at an entity (or at nothing).
    pub(crate) fn set_reference(&mut self, path: &Path, slot: usize, target: Option<EntityId>) -> Result<FieldState> {
        let group = self.field(path)?.target().ok_or_else(|| Error::InvalidPath {
            expected: "a reference field",
            path: path.to_string(),
        })?;
        let index = self.group_index(group)?;
        let field = self.field_mut(path)?;
        let before = field.state();
        field.set_link(slot, target, &index)?;
        Ok(before)
    }

    // ---- blocks and lists ----

    /// Toggle presence. `fresh` resets the block to defaults before assigning.
    /// Returns the block as it was.
    pub(crate) fn set_assigned(&mut self, path: &Path, assigned: bool, fresh: bool) -> Result<Block> {
        let block = self.block_mut(path)?;
        if block.is_locked() {
            return Err(Error::InvalidOperation(format!("{} at {path} is locked", block.tag())));
        }
        let before = block.clone();
        if assigned && fresh {
            block.assign_fresh();
        } else {
            block.set_assigned(assigned);
        }
        debug!("{} at {path} assigned={assigned}", block.tag());
        Ok(before)
    }

    pub(crate) fn replace_block(&mut self, path: &Path, block: Block) -> Result<()> {
        *self.block_mut(path)? = block;
        Ok(())
    }

    /// Insert `node` (or a fresh item) into a list; returns the index used.
    pub(crate) fn list_insert(&mut self, path: &Path, index: Option<usize>, node: Option<Node>) -> Result<usize> {
        let tag = self.list(path)?.tag();
        let node = match node {
            Some(n) if n.tag() == tag => n,
            Some(n) => {
                return Err(Error::InvalidOperation(format!("cannot put {} into a list of {tag}", n.tag())));
            }
            None => self.format.instantiate(tag)?,
        };
        let items = self.list_mut(path)?.items_mut();
        let index = index.unwrap_or(items.len()).min(items.len());
        items.insert(index, node);
        Ok(index)
    }

    pub(crate) fn list_remove(&mut self, path: &Path, index: usize) -> Result<Node> {
        let items = self.list_mut(path)?.items_mut();
        if index >= items.len() {
            return Err(Error::InvalidOperation(format!(
                "list at {path} has {} item(s), cannot remove {index}",
                items.len()
            )));
        }
        Ok(items.remove(index))
    }

    // ---- entities ----

    pub(crate) fn insert_entity(&mut self, group: GroupId, index: usize, entity: Entity) -> Result<usize> {
        let g = self
            .groups
            .get_mut(group.0)
            .ok_or_else(|| Error::InvalidOperation(format!("no group {}", group.0)))?;
        if entity.node.tag() != g.tag() {
            return Err(Error::InvalidOperation(format!(
                "cannot put {} into group '{}'",
                entity.node.tag(),
                g.name()
            )));
        }
        let change = g.insert(index, entity);
        self.apply_change(change);
        match change {
            GroupChange::Inserted { index, .. } | GroupChange::Removed { index, .. } => Ok(index),
        }
    }

    /// Remove an entity; every reference to it is cleared to its sentinel and
    /// references to later entities are renumbered.
    pub(crate) fn remove_entity(&mut self, id: EntityId) -> Result<(GroupId, usize, Entity)> {
        let (group, _) = self
            .locate(id)
            .ok_or_else(|| Error::InvalidOperation(format!("entity {id} does not exist")))?;
        let (entity, change) = self.groups[group.0]
            .remove(id)
            .ok_or_else(|| Error::InvalidOperation(format!("entity {id} does not exist")))?;
        self.apply_change(change);
        let GroupChange::Removed { index, .. } = change else {
            return Err(Error::InvalidOperation("unexpected group change".into()));
        };
        Ok((group, index, entity))
    }

    pub(crate) fn rename_entity(&mut self, id: EntityId, name: Option<String>) -> Result<Option<String>> {
        let entity = self
            .entity_mut(id)
            .ok_or_else(|| Error::InvalidOperation(format!("entity {id} does not exist")))?;
        Ok(std::mem::replace(&mut entity.name, name))
    }

    /// Every reference slot currently linked to `id`.
    pub fn link_sites(&self, id: EntityId) -> Vec<LinkSite> {
        let mut sites = Vec::new();
        let mut collect = |owner: Owner, node: &Node| {
            node.visit_fields(&mut Vec::new(), &mut |steps, field| {
                for (slot, link) in field.links().iter().enumerate() {
                    if *link == Some(id) {
                        sites.push(LinkSite {
                            path: Path {
                                owner,
                                steps: steps.to_vec(),
                            },
                            slot,
                        });
                    }
                }
            });
        };
        collect(Owner::Root, &self.root);
        for g in &self.groups {
            for e in g.iter() {
                collect(Owner::Entity(e.id()), &e.node);
            }
        }
        sites
    }

    fn for_each_field_mut(&mut self, f: &mut dyn FnMut(&mut Field)) {
        self.root.for_each_field_mut(f);
        for g in &mut self.groups {
            for e in g.iter_mut() {
                e.node.for_each_field_mut(f);
            }
        }
    }

    /// Rebuild every reference's links from its stored indices.
    pub(crate) fn resolve_references(&mut self, diagnostics: &mut Vec<Diagnostic>) {
        let indexes: Vec<GroupIndex> = self.groups.iter().map(NodeGroup::index).collect();
        self.for_each_field_mut(&mut |field| {
            if let Some(index) = field.target().and_then(|g| indexes.get(g.0)) {
                field.resolve(index, diagnostics);
            }
        });
    }

    fn resolve_entities(&mut self, ids: &[EntityId], diagnostics: &mut Vec<Diagnostic>) {
        let indexes: Vec<GroupIndex> = self.groups.iter().map(NodeGroup::index).collect();
        for id in ids {
            if let Some(entity) = self.entity_mut(*id) {
                entity.node.for_each_field_mut(&mut |field| {
                    if let Some(index) = field.target().and_then(|g| indexes.get(g.0)) {
                        field.resolve(index, diagnostics);
                    }
                });
            }
        }
    }

    /// Bring every reference into `change.group()` back in line with the
    /// group's new order.
    fn apply_change(&mut self, change: GroupChange) {
        debug!("{change:?}");
        let group = change.group();
        let Some(index) = self.groups.get(group.0).map(NodeGroup::index) else {
            return;
        };
        let mut changed = 0;
        self.for_each_field_mut(&mut |field| {
            if field.target() == Some(group) && field.sync(&index) {
                changed += 1;
            }
        });
        if changed > 0 {
            debug!("{changed} reference field(s) into '{}' renumbered", index.name());
        }
    }

    // ---- serialization of single entities ----

    /// An entity framed as it appears in the document.
    pub fn serialize_entity(&self, id: EntityId) -> Result<Vec<u8>> {
        let entity = self
            .entity(id)
            .ok_or_else(|| Error::InvalidOperation(format!("entity {id} does not exist")))?;
        let mut w = Writer::new();
        entity.node.write(&mut w, &self.write_ctx(&self.groups));
        Ok(w.into_inner())
    }

    /// An entity together with everything its dependent references point at,
    /// as a sequence of framed entity nodes in group order. Indices inside
    /// the blob are relative to the blob itself.
    pub fn export(&self, id: EntityId) -> Result<Vec<u8>> {
        if self.entity(id).is_none() {
            return Err(Error::InvalidOperation(format!("entity {id} does not exist")));
        }
        let mut wanted = BTreeSet::new();
        let mut queue = vec![id];
        while let Some(next) = queue.pop() {
            if !wanted.insert(next) {
                continue;
            }
            if let Some(entity) = self.entity(next) {
                dependent_links(&entity.node, &mut queue);
            }
        }

        let blob_groups: Vec<NodeGroup> = self
            .groups
            .iter()
            .map(|g| {
                let mut sub = NodeGroup::new(g.id(), g.name(), g.tag());
                for e in g.iter().filter(|e| wanted.contains(&e.id())) {
                    sub.add(e.clone());
                }
                sub
            })
            .collect();
        let ctx = self.write_ctx(&blob_groups);
        let mut w = Writer::new();
        for e in blob_groups.iter().flat_map(NodeGroup::iter) {
            e.node.write(&mut w, &ctx);
        }
        debug!("exported {id} with {} dependency(ies)", wanted.len() - 1);
        Ok(w.into_inner())
    }

    /// Parse a blob of framed entity nodes (see [`Tree::export`]). Each node
    /// goes to the group holding its tag; fresh ids are allocated.
    pub(crate) fn parse_entities(&mut self, bytes: &[u8]) -> Result<(Vec<(GroupId, Entity)>, Vec<Diagnostic>)> {
        let format = Arc::clone(&self.format);
        let mut ctx = ReadCtx::new(&format, Vec::new(), self.next_id);
        let mut cur = Cursor::new(bytes);
        let mut out = Vec::new();
        while !cur.is_empty() {
            let header = cur.peek_header().ok_or_else(|| {
                Error::InvalidDocument(format!("{} stray byte(s) at {:#x}", cur.remaining(), cur.offset()))
            })?;
            let tag = header.tag(format.tag_order());
            let group = format
                .group_by_tag(tag)
                .ok_or_else(|| Error::UnknownTag {
                    tag,
                    offset: cur.offset(),
                })?;
            let mut node = format.instantiate(tag)?;
            node.read_framed(&mut cur, &mut ctx)?;
            out.push((group, Entity::new(ctx.alloc_id(), node)));
        }
        self.next_id = ctx.next_id;
        Ok((out, ctx.diagnostics))
    }

    /// Append parsed entities, shifting their dependent references by the
    /// size each target group had before the merge. Returns the ids in order.
    pub(crate) fn merge(&mut self, entities: Vec<(GroupId, Entity)>) -> Result<Vec<EntityId>> {
        let offsets: Vec<i64> = self.groups.iter().map(|g| g.len() as i64).collect();
        let mut ids = Vec::with_capacity(entities.len());
        for (group, mut entity) in entities {
            entity.node.for_each_field_mut(&mut |field| {
                if let Some(offset) = field.target().and_then(|g| offsets.get(g.0)) {
                    field.apply_dependency_offset(*offset);
                }
            });
            ids.push(entity.id());
            let end = self.groups.get(group.0).map_or(0, NodeGroup::len);
            self.insert_entity(group, end, entity)?;
        }
        let mut diagnostics = Vec::new();
        self.resolve_entities(&ids, &mut diagnostics);
        for d in &diagnostics {
            debug!("merge: {d}");
        }
        Ok(ids)
    }

    /// Deep copy via serialize and re-parse; the copy gets a fresh id and the
    /// original's display name but is not inserted.
    pub(crate) fn copy_entity(&mut self, id: EntityId) -> Result<(GroupId, Entity)> {
        let bytes = self.serialize_entity(id)?;
        let name = self.entity(id).and_then(|e| e.name.clone());
        let (mut parsed, _) = self.parse_entities(&bytes)?;
        let (group, mut entity) = parsed
            .pop()
            .ok_or_else(|| Error::InvalidOperation(format!("{id} serialized to nothing")))?;
        entity.name = name;
        Ok((group, entity))
    }

    pub(crate) fn resolve_entity(&mut self, id: EntityId) {
        let mut diagnostics = Vec::new();
        self.resolve_entities(&[id], &mut diagnostics);
    }
}

fn dependent_links(node: &Node, out: &mut Vec<EntityId>) {
    node.visit_fields(&mut Vec::new(), &mut |_, field| {
        if field.kind().ref_spec().is_some_and(|s| s.dependent) {
            out.extend(field.links().iter().flatten());
        }
    });
}

fn field_path(path: &Path) -> Error {
    Error::InvalidPath {
        expected: "a field",
        path: path.to_string(),
    }
}

fn node_path(path: &Path) -> Error {
    Error::InvalidPath {
        expected: "a node",
        path: path.to_string(),
    }
}
