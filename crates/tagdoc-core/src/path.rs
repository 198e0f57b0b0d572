//! Addressing children inside a document.
//!
//! A [`Path`] names an owner (the root node or an entity handle) and a list
//! of child-index steps. Descending into a list takes one extra step for
//! the item index. Child order is fixed per format, so a path stays valid
//! across edits that do not touch the nodes it walks through.

use std::fmt;

use crate::group::EntityId;
use crate::node::{Child, Node};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Owner {
    Root,
    Entity(EntityId),
}

#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct Path {
    pub owner: Owner,
    pub steps: Vec<usize>,
}

impl Path {
    pub fn root(steps: impl Into<Vec<usize>>) -> Self {
        Self {
            owner: Owner::Root,
            steps: steps.into(),
        }
    }

    pub fn entity(id: EntityId, steps: impl Into<Vec<usize>>) -> Self {
        Self {
            owner: Owner::Entity(id),
            steps: steps.into(),
        }
    }

    pub fn join(&self, step: usize) -> Self {
        let mut next = self.clone();
        next.steps.push(step);
        next
    }
}

impl fmt::Display for Path {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self.owner {
            Owner::Root => write!(f, "root")?,
            Owner::Entity(id) => write!(f, "{id}")?,
        }
        for s in &self.steps {
            write!(f, "/{s}")?;
        }
        Ok(())
    }
}

/// What a path ends on.
pub enum Slot<'a> {
    Node(&'a Node),
    Child(&'a Child),
}

pub(crate) enum SlotMut<'a> {
    /// The path ends on a node, not on one of its children.
    Node,
    Child(&'a mut Child),
}

pub(crate) fn walk<'a>(mut node: &'a Node, steps: &[usize]) -> Option<Slot<'a>> {
    let mut steps = steps.iter();
    loop {
        let Some(&i) = steps.next() else {
            return Some(Slot::Node(node));
        };
        let child = node.child(i)?;
        if steps.as_slice().is_empty() {
            return Some(Slot::Child(child));
        }
        node = match child {
            Child::Block(b) => b.node()?,
            Child::List(l) => l.items().get(*steps.next()?)?,
            _ => return None,
        };
    }
}

pub(crate) fn walk_mut<'a>(mut node: &'a mut Node, steps: &[usize]) -> Option<SlotMut<'a>> {
    let mut steps = steps.iter();
    loop {
        let Some(&i) = steps.next() else {
            return Some(SlotMut::Node);
        };
        let last = steps.as_slice().is_empty();
        let child = node.children_mut().get_mut(i)?;
        if last {
            return Some(SlotMut::Child(child));
        }
        node = match child {
            Child::Block(b) => b.node_mut()?,
            Child::List(l) => {
                let j = *steps.next()?;
                l.items_mut().get_mut(j)?
            }
            _ => return None,
        };
    }
}

/// One segment of a name path: `name` or `name[index]`.
pub(crate) fn split_segment(segment: &str) -> Option<(&str, Option<usize>)> {
    match segment.split_once('[') {
        None => Some((segment, None)),
        Some((name, rest)) => {
            let index = rest.strip_suffix(']')?.parse().ok()?;
            Some((name, Some(index)))
        }
    }
}

/// Resolve `names` below `node` into child steps.
pub(crate) fn steps_by_name<'s>(node: &Node, names: impl Iterator<Item = &'s str>) -> Option<Vec<usize>> {
    let mut steps = Vec::new();
    let mut node = node;
    let mut names = names.peekable();
    while let Some(segment) = names.next() {
        let (name, index) = split_segment(segment)?;
        let i = node.position_of(name)?;
        steps.push(i);
        let child = node.child(i)?;
        match (child, index) {
            (Child::List(l), Some(j)) => {
                steps.push(j);
                node = l.items().get(j)?;
            }
            (Child::Block(b), None) if names.peek().is_some() => node = b.node()?,
            (_, None) if names.peek().is_none() => {}
            _ => return None,
        }
    }
    Some(steps)
}
