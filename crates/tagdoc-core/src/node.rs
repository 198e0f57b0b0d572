//! Structural nodes and optional blocks.
//!
//! A [`Node`] is a tagged, size-prefixed composite whose child order comes
//! from the format descriptor. Reading is best-effort: bytes the descriptor
//! does not model are kept verbatim and written back unchanged, and a node
//! whose content cannot be parsed keeps its whole content as raw bytes.

use log::{debug, warn};

use crate::cursor::{Cursor, Header, Padding, Writer, padding};
use crate::descriptor::Format;
use crate::error::{Diagnostic, DiagnosticKind, Error, Result};
use crate::field::Field;
use crate::group::{Entity, EntityId, GroupId, NodeGroup};
use crate::tag::{Tag, TagOrder};

/// Parse state threaded through a read.
pub(crate) struct ReadCtx<'f> {
    pub format: &'f Format,
    pub groups: Vec<NodeGroup>,
    pub next_id: u32,
    pub diagnostics: Vec<Diagnostic>,
}

impl<'f> ReadCtx<'f> {
    pub fn new(format: &'f Format, groups: Vec<NodeGroup>, next_id: u32) -> Self {
        Self {
            format,
            groups,
            next_id,
            diagnostics: Vec::new(),
        }
    }

    pub fn alloc_id(&mut self) -> EntityId {
        let id = EntityId(self.next_id);
        self.next_id += 1;
        id
    }

    fn report(&mut self, kind: DiagnosticKind, offset: usize, message: String) {
        warn!("{kind:?} at {offset:#x}: {message}");
        self.diagnostics.push(Diagnostic {
            kind,
            offset,
            message,
        });
    }
}

pub(crate) struct WriteCtx<'a> {
    pub order: TagOrder,
    pub align: u32,
    pub groups: &'a [NodeGroup],
}

#[derive(Debug, Clone, PartialEq)]
pub enum Child {
    /// Untagged primitive, always present, read in sequence.
    Field(Field),
    Block(Block),
    /// Zero or more consecutive nodes with the same tag, owned by this node.
    List(NodeList),
    /// Where the entities of a document-level group are stored.
    Group(GroupId),
}

impl Child {
    pub fn name(&self) -> String {
        match self {
            Child::Field(f) => f.name().to_string(),
            Child::Block(b) => b.tag().to_string(),
            Child::List(l) => l.tag.to_string(),
            Child::Group(g) => format!("group{}", g.0),
        }
    }

    /// The field behind this child: a raw field or a leaf block's field.
    pub fn field(&self) -> Option<&Field> {
        match self {
            Child::Field(f) => Some(f),
            Child::Block(b) => b.leaf_field(),
            _ => None,
        }
    }

    pub(crate) fn field_mut(&mut self) -> Option<&mut Field> {
        match self {
            Child::Field(f) => Some(f),
            Child::Block(b) => b.leaf_field_mut(),
            _ => None,
        }
    }

    fn write(&self, w: &mut Writer, ctx: &WriteCtx<'_>) {
        match self {
            Child::Field(f) => f.write(w, ctx.groups),
            Child::Block(b) => b.write(w, ctx),
            Child::List(l) => l.items.iter().for_each(|n| n.write(w, ctx)),
            Child::Group(g) => {
                if let Some(group) = ctx.groups.get(g.0) {
                    group.iter().for_each(|e| e.node.write(w, ctx));
                }
            }
        }
    }

    fn reset(&mut self) {
        match self {
            Child::Field(f) => f.reset(),
            Child::Block(b) => {
                b.body.reset();
                b.absent = None;
                b.set_assigned(b.locked);
            }
            Child::List(l) => l.items.clear(),
            Child::Group(_) => {}
        }
    }

    fn set_assigned(&mut self, assigned: bool) {
        match self {
            Child::Field(f) => f.set_assigned(assigned),
            Child::Block(b) => b.set_assigned(assigned),
            Child::List(l) => l.items.iter_mut().for_each(|n| n.set_assigned(assigned)),
            Child::Group(_) => {}
        }
    }
}

#[derive(Debug, Clone, PartialEq)]
pub struct Node {
    tag: Tag,
    name: String,
    children: Vec<Child>,
    /// Unrecognized bytes after the last modeled child.
    trailing: Vec<u8>,
    /// Content could not be parsed; `trailing` holds all of it.
    malformed: bool,
    padding: Option<Padding>,
}

impl Node {
    pub fn new(tag: Tag, name: impl Into<String>, children: Vec<Child>) -> Self {
        Self {
            tag,
            name: name.into(),
            children,
            trailing: Vec::new(),
            malformed: false,
            padding: None,
        }
    }

    pub fn tag(&self) -> Tag {
        self.tag
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn children(&self) -> &[Child] {
        &self.children
    }

    pub(crate) fn children_mut(&mut self) -> &mut [Child] {
        &mut self.children
    }

    pub fn child(&self, index: usize) -> Option<&Child> {
        self.children.get(index)
    }

    pub fn position_of(&self, name: &str) -> Option<usize> {
        self.children.iter().position(|c| match c {
            Child::Block(b) => {
                b.tag().as_str() == name || b.leaf_field().is_some_and(|f| f.name() == name)
            }
            other => other.name() == name,
        })
    }

    pub fn trailing(&self) -> &[u8] {
        &self.trailing
    }

    pub fn is_malformed(&self) -> bool {
        self.malformed
    }

    /// Back to descriptor defaults: fields reset, optional blocks unassigned,
    /// lists emptied, unrecognized bytes dropped.
    pub(crate) fn reset(&mut self) {
        self.children.iter_mut().for_each(Child::reset);
        self.trailing.clear();
        self.malformed = false;
        self.padding = None;
    }

    pub(crate) fn set_assigned(&mut self, assigned: bool) {
        self.children
            .iter_mut()
            .for_each(|c| c.set_assigned(assigned));
    }

    /// Visit every field below this node, including unassigned ones.
    /// Group slots are not followed.
    pub(crate) fn for_each_field_mut(&mut self, f: &mut dyn FnMut(&mut Field)) {
        for child in &mut self.children {
            match child {
                Child::Field(field) => f(field),
                Child::Block(b) => match &mut b.body {
                    Body::Leaf(leaf) => f(&mut leaf.field),
                    Body::Node(node) => node.for_each_field_mut(f),
                },
                Child::List(l) => l.items.iter_mut().for_each(|n| n.for_each_field_mut(f)),
                Child::Group(_) => {}
            }
        }
    }

    /// Like [`Node::for_each_field_mut`], passing each field's child-step path.
    pub(crate) fn visit_fields(&self, steps: &mut Vec<usize>, f: &mut dyn FnMut(&[usize], &Field)) {
        for (i, child) in self.children.iter().enumerate() {
            steps.push(i);
            match child {
                Child::Field(field) => f(steps, field),
                Child::Block(b) => match &b.body {
                    Body::Leaf(leaf) => f(steps, &leaf.field),
                    Body::Node(node) => node.visit_fields(steps, f),
                },
                Child::List(l) => {
                    for (j, item) in l.items.iter().enumerate() {
                        steps.push(j);
                        item.visit_fields(steps, f);
                        steps.pop();
                    }
                }
                Child::Group(_) => {}
            }
            steps.pop();
        }
    }

    // ---- reading ----

    /// Read header, content and padding of this node from `cur`.
    pub(crate) fn read_framed(&mut self, cur: &mut Cursor<'_>, ctx: &mut ReadCtx<'_>) -> Result<()> {
        let header = cur.read_header()?;
        if !header.is(self.tag, ctx.format.tag_order()) {
            return Err(Error::MalformedData {
                offset: cur.offset() - Header::LEN,
                message: format!("expected {}, found {}", self.tag, header.tag(ctx.format.tag_order())),
            });
        }
        let body = take_body(cur, header)?;
        self.read_content(body, ctx);
        self.padding = read_padding(cur, header.size, ctx);
        Ok(())
    }

    /// Read children from a cursor bounded to exactly this node's content.
    /// Never fails: problems are recorded as diagnostics and the affected
    /// bytes are kept verbatim.
    pub(crate) fn read_content(&mut self, mut cur: Cursor<'_>, ctx: &mut ReadCtx<'_>) {
        let whole = cur.clone();
        let groups_before: Vec<(GroupId, usize)> = self
            .children
            .iter()
            .filter_map(|c| match c {
                Child::Group(g) => Some((*g, ctx.groups.get(g.0).map_or(0, |x| x.len()))),
                _ => None,
            })
            .collect();

        match self.read_children(&mut cur, ctx) {
            Ok(()) => {
                if !cur.is_empty() {
                    let at = cur.offset();
                    let order = ctx.format.tag_order();
                    match cur.peek_header() {
                        Some(h) if !ctx.format.knows(h.raw_tag) => ctx.report(
                            DiagnosticKind::UnknownTag,
                            at,
                            format!("{}: unknown tag {}, kept {} raw bytes", self.tag, h.tag(order), cur.remaining()),
                        ),
                        Some(h) => ctx.report(
                            DiagnosticKind::UnexpectedTag,
                            at,
                            format!("{}: {} out of order, kept {} raw bytes", self.tag, h.tag(order), cur.remaining()),
                        ),
                        None => debug!("{}: {} trailing bytes at {at:#x}", self.tag, cur.remaining()),
                    }
                    self.trailing = cur.rest().to_vec();
                }
            }
            Err(e) => {
                ctx.report(
                    DiagnosticKind::MalformedData,
                    whole.offset(),
                    format!("{}: {e}; content kept as raw bytes", self.tag),
                );
                for (g, len) in groups_before {
                    if let Some(group) = ctx.groups.get_mut(g.0) {
                        group.truncate(len);
                    }
                }
                self.reset();
                self.malformed = true;
                self.trailing = whole.clone().rest().to_vec();
            }
        }
    }

    fn read_children(&mut self, cur: &mut Cursor<'_>, ctx: &mut ReadCtx<'_>) -> Result<()> {
        let order = ctx.format.tag_order();
        for child in &mut self.children {
            match child {
                Child::Field(f) => {
                    let span = cur.remaining();
                    f.read(cur, span)?;
                }
                Child::Block(b) => {
                    if !b.try_read(cur, ctx)? && b.locked {
                        debug!("{}: locked {} not found at {:#x}", self.tag, b.tag(), cur.offset());
                        b.absent = Some(Box::new(b.body.clone()));
                    }
                }
                Child::List(list) => {
                    while let Some(h) = cur.peek_header()
                        && h.is(list.tag, order)
                    {
                        let mut item = ctx.format.instantiate(list.tag)?;
                        item.read_framed(cur, ctx)?;
                        list.items.push(item);
                    }
                }
                Child::Group(g) => {
                    let tag = ctx
                        .groups
                        .get(g.0)
                        .map(|x| x.tag())
                        .ok_or_else(|| Error::Descriptor(format!("no group {}", g.0)))?;
                    while let Some(h) = cur.peek_header()
                        && h.is(tag, order)
                    {
                        let mut node = ctx.format.instantiate(tag)?;
                        node.read_framed(cur, ctx)?;
                        let entity = Entity::new(ctx.alloc_id(), node);
                        if let Some(group) = ctx.groups.get_mut(g.0) {
                            let index = group.add(entity);
                            debug!("{}: entity {index} read", group.name());
                        }
                    }
                }
            }
        }
        Ok(())
    }

    // ---- writing ----

    pub(crate) fn write(&self, w: &mut Writer, ctx: &WriteCtx<'_>) {
        let frame = w.begin_frame(self.tag, ctx.order);
        self.write_content(w, ctx);
        w.end_frame_with(frame, ctx.align, self.padding.as_ref());
    }

    pub(crate) fn write_content(&self, w: &mut Writer, ctx: &WriteCtx<'_>) {
        if !self.malformed {
            self.children.iter().for_each(|c| c.write(w, ctx));
        }
        w.write_bytes(&self.trailing);
    }
}

fn take_body<'a>(cur: &mut Cursor<'a>, header: Header) -> Result<Cursor<'a>> {
    let size = header.size as usize;
    if size > cur.remaining() {
        return Err(Error::MalformedData {
            offset: cur.offset() - Header::LEN,
            message: format!("block size {size} exceeds the {} bytes left", cur.remaining()),
        });
    }
    cur.take(size)
}

/// Consume the alignment after a block. Padding that is not `want` zero
/// bytes is reported and returned so it can be written back as read.
fn read_padding(cur: &mut Cursor<'_>, size: u32, ctx: &mut ReadCtx<'_>) -> Option<Padding> {
    let want = padding(size, ctx.format.align());
    if want == 0 {
        return None;
    }
    let at = cur.offset();
    let got = want.min(cur.remaining());
    let pad = cur.read_bytes(got).unwrap_or_default();
    if got == want && pad.iter().all(|&b| b == 0) {
        return None;
    }
    ctx.report(
        DiagnosticKind::NonZeroPadding,
        at,
        format!("expected {want} zero padding byte(s), found {pad:02x?}"),
    );
    Some(Padding {
        size,
        bytes: pad.to_vec(),
    })
}

/// Optional, tagged part of a node: present in the file or not at all.
#[derive(Debug, Clone, PartialEq)]
pub struct Block {
    assigned: bool,
    locked: bool,
    /// Locked but missing from the input: the body as instantiated. The block
    /// is left out of the output while its body still matches.
    absent: Option<Box<Body>>,
    body: Body,
}

#[derive(Debug, Clone, PartialEq)]
pub enum Body {
    /// A single field framed by its own tag/size header.
    Leaf(Leaf),
    Node(Node),
}

impl Body {
    fn same_content(&self, other: &Body) -> bool {
        match (self, other) {
            (Body::Leaf(a), Body::Leaf(b)) => a.field.same_content(&b.field) && a.trailing == b.trailing,
            (Body::Node(a), Body::Node(b)) => {
                let (mut fa, mut fb) = (Vec::new(), Vec::new());
                a.visit_fields(&mut Vec::new(), &mut |_, f| fa.push(f.clone()));
                b.visit_fields(&mut Vec::new(), &mut |_, f| fb.push(f.clone()));
                a.trailing == b.trailing
                    && fa.len() == fb.len()
                    && fa.iter().zip(&fb).all(|(x, y)| x.same_content(y))
            }
            _ => false,
        }
    }

    fn reset(&mut self) {
        match self {
            Body::Leaf(leaf) => {
                leaf.field.reset();
                leaf.trailing.clear();
                leaf.padding = None;
            }
            Body::Node(node) => node.reset(),
        }
    }
}

#[derive(Debug, Clone, PartialEq)]
pub struct Leaf {
    tag: Tag,
    field: Field,
    trailing: Vec<u8>,
    padding: Option<Padding>,
}

impl Block {
    pub fn new_leaf(tag: Tag, field: Field, locked: bool) -> Self {
        let mut block = Self {
            assigned: false,
            locked,
            absent: None,
            body: Body::Leaf(Leaf {
                tag,
                field,
                trailing: Vec::new(),
                padding: None,
            }),
        };
        block.set_assigned(locked);
        block
    }

    pub fn new_node(node: Node, locked: bool) -> Self {
        let mut block = Self {
            assigned: false,
            locked,
            absent: None,
            body: Body::Node(node),
        };
        block.set_assigned(locked);
        block
    }

    pub fn tag(&self) -> Tag {
        match &self.body {
            Body::Leaf(leaf) => leaf.tag,
            Body::Node(node) => node.tag,
        }
    }

    pub fn is_assigned(&self) -> bool {
        self.assigned
    }

    pub fn is_locked(&self) -> bool {
        self.locked
    }

    /// A locked block the input did not contain and that has not been edited
    /// since. It stays out of the output.
    pub fn is_absent(&self) -> bool {
        self.absent
            .as_deref()
            .is_some_and(|read| self.body.same_content(read))
    }

    pub fn body(&self) -> &Body {
        &self.body
    }

    pub fn node(&self) -> Option<&Node> {
        match &self.body {
            Body::Node(node) => Some(node),
            Body::Leaf(_) => None,
        }
    }

    pub(crate) fn node_mut(&mut self) -> Option<&mut Node> {
        match &mut self.body {
            Body::Node(node) => Some(node),
            Body::Leaf(_) => None,
        }
    }

    pub fn leaf_field(&self) -> Option<&Field> {
        match &self.body {
            Body::Leaf(leaf) => Some(&leaf.field),
            Body::Node(_) => None,
        }
    }

    pub(crate) fn leaf_field_mut(&mut self) -> Option<&mut Field> {
        match &mut self.body {
            Body::Leaf(leaf) => Some(&mut leaf.field),
            Body::Node(_) => None,
        }
    }

    /// Set presence on this block and every field and block beneath it.
    pub(crate) fn set_assigned(&mut self, assigned: bool) {
        self.assigned = assigned;
        match &mut self.body {
            Body::Leaf(leaf) => leaf.field.set_assigned(assigned),
            Body::Node(node) => node.set_assigned(assigned),
        }
    }

    /// Assign with fresh descriptor defaults throughout.
    pub(crate) fn assign_fresh(&mut self) {
        self.body.reset();
        self.set_assigned(true);
    }

    /// Read this block if the next header carries its tag. Returns whether it
    /// matched; on a mismatch nothing is consumed.
    pub(crate) fn try_read(&mut self, cur: &mut Cursor<'_>, ctx: &mut ReadCtx<'_>) -> Result<bool> {
        let Some(header) = cur.peek_header() else {
            return Ok(false);
        };
        if !header.is(self.tag(), ctx.format.tag_order()) {
            return Ok(false);
        }
        match &mut self.body {
            Body::Node(node) => node.read_framed(cur, ctx)?,
            Body::Leaf(leaf) => {
                cur.read_header()?;
                let mut body = take_body(cur, header)?;
                let span = body.remaining();
                leaf.field.read(&mut body, span)?;
                if !body.is_empty() {
                    debug!("{}: {} bytes of slack after value", leaf.tag, body.remaining());
                }
                leaf.trailing = body.rest().to_vec();
                leaf.padding = read_padding(cur, header.size, ctx);
            }
        }
        self.assigned = true;
        Ok(true)
    }

    fn write(&self, w: &mut Writer, ctx: &WriteCtx<'_>) {
        if !self.assigned || self.is_absent() {
            return;
        }
        match &self.body {
            Body::Node(node) => node.write(w, ctx),
            Body::Leaf(leaf) => {
                let frame = w.begin_frame(leaf.tag, ctx.order);
                leaf.field.write(w, ctx.groups);
                w.write_bytes(&leaf.trailing);
                w.end_frame_with(frame, ctx.align, leaf.padding.as_ref());
            }
        }
    }
}

#[derive(Debug, Clone, PartialEq)]
pub struct NodeList {
    tag: Tag,
    items: Vec<Node>,
}

impl NodeList {
    pub fn new(tag: Tag) -> Self {
        Self {
            tag,
            items: Vec::new(),
        }
    }

    pub fn tag(&self) -> Tag {
        self.tag
    }

    pub fn items(&self) -> &[Node] {
        &self.items
    }

    pub(crate) fn items_mut(&mut self) -> &mut Vec<Node> {
        &mut self.items
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::descriptor::{ChildDef, FormatDescriptor, NodeDef};
    use crate::field::FieldKind;
    use crate::tag::tag;

    fn format() -> Format {
        Format::new(FormatDescriptor {
            name: "test".into(),
            magic: tag("ROOT"),
            tag_order: TagOrder::Forward,
            align: 1,
            groups: Vec::new(),
            nodes: vec![
                NodeDef::new(
                    "ROOT",
                    vec![
                        ChildDef::field("Flags", FieldKind::uint(2)),
                        ChildDef::leaf("Cnt", "Count", FieldKind::int(4)),
                        ChildDef::block("Sub"),
                    ],
                ),
                NodeDef::new(
                    "Sub",
                    vec![
                        ChildDef::leaf("A", "A", FieldKind::F32),
                        ChildDef::leaf("B", "B", FieldKind::uint(1)),
                    ],
                ),
            ],
        })
        .unwrap()
    }

    fn read_root(fmt: &Format, content: &[u8]) -> (Node, Vec<Diagnostic>) {
        let mut root = fmt.instantiate(tag("ROOT")).unwrap();
        let mut ctx = ReadCtx::new(fmt, Vec::new(), 0);
        root.read_content(Cursor::new(content), &mut ctx);
        (root, ctx.diagnostics)
    }

    fn write_content(node: &Node) -> Vec<u8> {
        let mut w = Writer::new();
        node.write_content(
            &mut w,
            &WriteCtx {
                order: TagOrder::Forward,
                align: 1,
                groups: &[],
            },
        );
        w.into_inner()
    }

    #[test]
    fn absent_block_is_skipped_and_not_written() {
        let fmt = format();
        let content = [7, 0, b'C', b'n', b't', 0, 4, 0, 0, 0, 9, 0, 0, 0];
        let (root, diags) = read_root(&fmt, &content);
        assert!(diags.is_empty());
        let Child::Block(sub) = &root.children()[2] else { panic!() };
        assert!(!sub.is_assigned());
        assert_eq!(write_content(&root), content);
    }

    #[test]
    fn unassign_propagates_to_descendants() {
        let fmt = format();
        let mut root = fmt.instantiate(tag("ROOT")).unwrap();
        let Child::Block(sub) = &mut root.children_mut()[2] else { panic!() };
        sub.assign_fresh();
        let inner = sub.node().unwrap();
        assert!(inner.children().iter().all(|c| c.field().unwrap().is_assigned()));
        sub.set_assigned(false);
        let inner = sub.node().unwrap();
        assert!(inner.children().iter().all(|c| !c.field().unwrap().is_assigned()));
    }

    #[test]
    fn truncated_content_is_kept_raw() {
        let fmt = format();
        // Count header claims 4 bytes but only 2 follow
        let content = [1, 0, b'C', b'n', b't', 0, 4, 0, 0, 0, 1, 2];
        let (root, diags) = read_root(&fmt, &content);
        assert!(root.is_malformed());
        assert_eq!(diags[0].kind, DiagnosticKind::MalformedData);
        assert_eq!(write_content(&root), content);
    }

    #[test]
    fn unknown_tag_keeps_rest_of_node() {
        let fmt = format();
        let mut content = vec![1, 0];
        content.extend_from_slice(b"Zzz\0\x04\0\0\0abcd");
        let (root, diags) = read_root(&fmt, &content);
        assert_eq!(diags[0].kind, DiagnosticKind::UnknownTag);
        assert_eq!(root.trailing(), &content[2..]);
        assert_eq!(write_content(&root), content);
    }
}
