//! Document-level collections of entities (emitters, binders, particles, ...).
//!
//! A group owns its entities in a dense ordered arena; an entity's index is
//! its position. Everything else refers to entities through [`EntityId`]
//! handles, which survive reordering and are never reused within a document.

use std::fmt;

use crate::node::Node;
use crate::tag::Tag;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct EntityId(pub(crate) u32);

impl fmt::Display for EntityId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "#{}", self.0)
    }
}

/// Position of a group in its format's group table.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct GroupId(pub usize);

#[derive(Debug, Clone, PartialEq)]
pub struct Entity {
    id: EntityId,
    pub node: Node,
    /// Display name assigned by the user; not part of the binary data.
    pub name: Option<String>,
}

impl Entity {
    pub fn new(id: EntityId, node: Node) -> Self {
        Self {
            id,
            node,
            name: None,
        }
    }

    pub fn id(&self) -> EntityId {
        self.id
    }
}

/// Structural change published by a group; reference fields targeting the
/// group are re-synchronised from these.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum GroupChange {
    Inserted {
        group: GroupId,
        index: usize,
        id: EntityId,
    },
    Removed {
        group: GroupId,
        index: usize,
        id: EntityId,
    },
}

impl GroupChange {
    pub fn group(&self) -> GroupId {
        match self {
            GroupChange::Inserted { group, .. } | GroupChange::Removed { group, .. } => *group,
        }
    }
}

/// Positions of a group's entities, detached from the entities themselves so
/// references can be rewritten while the group is being edited.
#[derive(Debug, Clone, PartialEq)]
pub struct GroupIndex {
    name: String,
    ids: Vec<EntityId>,
}

impl GroupIndex {
    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn len(&self) -> usize {
        self.ids.len()
    }

    pub fn is_empty(&self) -> bool {
        self.ids.is_empty()
    }

    pub fn id_at(&self, index: usize) -> Option<EntityId> {
        self.ids.get(index).copied()
    }

    pub fn index_of(&self, id: EntityId) -> Option<usize> {
        self.ids.iter().position(|x| *x == id)
    }
}

#[derive(Debug, Clone, PartialEq)]
pub struct NodeGroup {
    id: GroupId,
    name: String,
    tag: Tag,
    entities: Vec<Entity>,
}

impl NodeGroup {
    pub fn new(id: GroupId, name: impl Into<String>, tag: Tag) -> Self {
        Self {
            id,
            name: name.into(),
            tag,
            entities: Vec::new(),
        }
    }

    pub fn id(&self) -> GroupId {
        self.id
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn tag(&self) -> Tag {
        self.tag
    }

    pub fn len(&self) -> usize {
        self.entities.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entities.is_empty()
    }

    pub fn index(&self) -> GroupIndex {
        GroupIndex {
            name: self.name.clone(),
            ids: self.entities.iter().map(|e| e.id).collect(),
        }
    }

    pub fn iter(&self) -> impl Iterator<Item = &Entity> {
        self.entities.iter()
    }

    pub(crate) fn iter_mut(&mut self) -> impl Iterator<Item = &mut Entity> {
        self.entities.iter_mut()
    }

    pub fn get(&self, index: usize) -> Option<&Entity> {
        self.entities.get(index)
    }

    pub fn id_at(&self, index: usize) -> Option<EntityId> {
        self.entities.get(index).map(|e| e.id)
    }

    pub fn index_of(&self, id: EntityId) -> Option<usize> {
        self.entities.iter().position(|e| e.id == id)
    }

    pub fn entity(&self, id: EntityId) -> Option<&Entity> {
        self.entities.iter().find(|e| e.id == id)
    }

    pub(crate) fn entity_mut(&mut self, id: EntityId) -> Option<&mut Entity> {
        self.entities.iter_mut().find(|e| e.id == id)
    }

    /// Text shown for an entity: its display name or "<tag> <index>".
    pub fn display_text(&self, id: EntityId) -> Option<String> {
        let index = self.index_of(id)?;
        let entity = &self.entities[index];
        Some(
            entity
                .name
                .clone()
                .unwrap_or_else(|| format!("{} {index}", self.tag)),
        )
    }

    /// Append; returns the new entity's index.
    pub(crate) fn add(&mut self, entity: Entity) -> usize {
        self.entities.push(entity);
        self.entities.len() - 1
    }

    pub(crate) fn truncate(&mut self, len: usize) {
        self.entities.truncate(len);
    }

    pub(crate) fn insert(&mut self, index: usize, entity: Entity) -> GroupChange {
        let index = index.min(self.entities.len());
        let id = entity.id;
        self.entities.insert(index, entity);
        GroupChange::Inserted {
            group: self.id,
            index,
            id,
        }
    }

    pub(crate) fn remove(&mut self, id: EntityId) -> Option<(Entity, GroupChange)> {
        let index = self.index_of(id)?;
        let entity = self.entities.remove(index);
        Some((
            entity,
            GroupChange::Removed {
                group: self.id,
                index,
                id,
            },
        ))
    }
}
