//! Concrete edits: field values, references, presence, entities and lists.

use log::{debug, info};

use crate::command::{Command, CommandResult};
use crate::error::{Error, Result};
use crate::field::FieldState;
use crate::group::{Entity, EntityId, GroupId};
use crate::node::{Block, Node};
use crate::path::Path;
use crate::tree::{LinkSite, Tree};
use crate::value::Value;

fn not_executed(command: &str) -> Error {
    Error::CommandReplay {
        command: command.to_string(),
        reason: "nothing to undo".into(),
    }
}

/// Set a field's value.
pub struct SetField {
    path: Path,
    value: Value,
    label: String,
    before: Option<FieldState>,
}

impl SetField {
    pub fn new(path: Path, value: Value) -> Self {
        let label = format!("Set {path} = {value}");
        Self {
            path,
            value,
            label,
            before: None,
        }
    }
}

impl Command for SetField {
    fn description(&self) -> &str {
        &self.label
    }

    fn execute(&mut self, tree: &mut Tree) -> CommandResult {
        self.before = Some(tree.set_field(&self.path, self.value.clone())?);
        Ok(())
    }

    fn undo(&mut self, tree: &mut Tree) -> CommandResult {
        let state = self.before.clone().ok_or_else(|| not_executed(&self.label))?;
        tree.restore_field(&self.path, state)
    }
}

/// Point one slot of a reference field at an entity, or clear it.
pub struct SetReference {
    path: Path,
    slot: usize,
    target: Option<EntityId>,
    label: String,
    before: Option<FieldState>,
}

impl SetReference {
    pub fn new(path: Path, slot: usize, target: Option<EntityId>) -> Self {
        let label = match target {
            Some(id) => format!("Link {path}[{slot}] to {id}"),
            None => format!("Clear {path}[{slot}]"),
        };
        Self {
            path,
            slot,
            target,
            label,
            before: None,
        }
    }
}

impl Command for SetReference {
    fn description(&self) -> &str {
        &self.label
    }

    fn execute(&mut self, tree: &mut Tree) -> CommandResult {
        self.before = Some(tree.set_reference(&self.path, self.slot, self.target)?);
        Ok(())
    }

    fn undo(&mut self, tree: &mut Tree) -> CommandResult {
        let state = self.before.clone().ok_or_else(|| not_executed(&self.label))?;
        tree.restore_field(&self.path, state)
    }
}

/// Add or remove an optional block.
///
/// Assigning starts from descriptor defaults; undo puts back exactly what was
/// there before, including values held while the block was unassigned.
pub struct ToggleAssigned {
    path: Path,
    assigned: bool,
    label: String,
    before: Option<Block>,
}

impl ToggleAssigned {
    pub fn new(path: Path, assigned: bool) -> Self {
        let label = format!("{} {path}", if assigned { "Add" } else { "Remove" });
        Self {
            path,
            assigned,
            label,
            before: None,
        }
    }

    /// Flip whatever the block's presence currently is.
    pub fn toggle(tree: &Tree, path: Path) -> Result<Self> {
        let assigned = !tree.block(&path)?.is_assigned();
        Ok(Self::new(path, assigned))
    }
}

impl Command for ToggleAssigned {
    fn description(&self) -> &str {
        &self.label
    }

    fn execute(&mut self, tree: &mut Tree) -> CommandResult {
        self.before = Some(tree.set_assigned(&self.path, self.assigned, true)?);
        Ok(())
    }

    fn undo(&mut self, tree: &mut Tree) -> CommandResult {
        let block = self.before.clone().ok_or_else(|| not_executed(&self.label))?;
        tree.replace_block(&self.path, block)
    }
}

/// Insert a new entity into a group.
///
/// The id is allocated up front so later commands of the same compound can
/// refer to the entity before it exists.
pub struct AddEntity {
    group: GroupId,
    index: Option<usize>,
    entity: Entity,
    label: String,
}

impl AddEntity {
    /// A fresh entity with descriptor defaults, appended to `group`.
    pub fn new(tree: &mut Tree, group: GroupId) -> Result<Self> {
        let tag = tree
            .group(group)
            .map(|g| g.tag())
            .ok_or_else(|| Error::InvalidOperation(format!("no group {}", group.0)))?;
        let node = tree.format().instantiate(tag)?;
        Ok(Self::with_node(tree, group, node))
    }

    /// Add a prepared node, e.g. one parsed from a node library.
    pub fn with_node(tree: &mut Tree, group: GroupId, node: Node) -> Self {
        let id = tree.alloc_id();
        let label = format!("Add {} {id}", node.tag());
        Self {
            group,
            index: None,
            entity: Entity::new(id, node),
            label,
        }
    }

    pub fn at(mut self, index: usize) -> Self {
        self.index = Some(index);
        self
    }

    pub fn named(mut self, name: impl Into<String>) -> Self {
        self.entity.name = Some(name.into());
        self
    }

    pub fn id(&self) -> EntityId {
        self.entity.id()
    }
}

impl Command for AddEntity {
    fn description(&self) -> &str {
        &self.label
    }

    fn execute(&mut self, tree: &mut Tree) -> CommandResult {
        let end = tree.group(self.group).map_or(0, |g| g.len());
        let index = self.index.unwrap_or(end);
        let at = tree.insert_entity(self.group, index, self.entity.clone())?;
        tree.resolve_entity(self.entity.id());
        debug!("added {} at {at}", self.entity.id());
        Ok(())
    }

    fn undo(&mut self, tree: &mut Tree) -> CommandResult {
        let (_, _, entity) = tree.remove_entity(self.entity.id())?;
        self.entity = entity;
        Ok(())
    }
}

/// Remove an entity. References to it are cleared; undo re-links them.
pub struct RemoveEntity {
    id: EntityId,
    label: String,
    removed: Option<(GroupId, usize, Entity)>,
    sites: Vec<LinkSite>,
}

impl RemoveEntity {
    pub fn new(id: EntityId) -> Self {
        Self {
            id,
            label: format!("Remove {id}"),
            removed: None,
            sites: Vec::new(),
        }
    }
}

impl Command for RemoveEntity {
    fn description(&self) -> &str {
        &self.label
    }

    fn execute(&mut self, tree: &mut Tree) -> CommandResult {
        let sites = tree.link_sites(self.id);
        let removed = tree.remove_entity(self.id)?;
        if !sites.is_empty() {
            info!("{}: cleared {} reference(s)", self.label, sites.len());
        }
        self.sites = sites;
        self.removed = Some(removed);
        Ok(())
    }

    fn undo(&mut self, tree: &mut Tree) -> CommandResult {
        let (group, index, entity) = self.removed.clone().ok_or_else(|| not_executed(&self.label))?;
        tree.insert_entity(group, index, entity)?;
        for site in &self.sites {
            tree.set_reference(&site.path, site.slot, Some(self.id))
                .map_err(|e| Error::CommandReplay {
                    command: self.label.clone(),
                    reason: format!("re-linking {}: {e}", site.path),
                })?;
        }
        Ok(())
    }
}

/// Deep-copy an entity (serialize, then re-parse) and append the copy to the
/// same group with the original's display name.
pub struct DuplicateEntity {
    source: EntityId,
    label: String,
    copy: Option<(GroupId, Entity)>,
}

impl DuplicateEntity {
    pub fn new(source: EntityId) -> Self {
        Self {
            source,
            label: format!("Duplicate {source}"),
            copy: None,
        }
    }

    /// Id of the copy, once executed.
    pub fn created(&self) -> Option<EntityId> {
        self.copy.as_ref().map(|(_, e)| e.id())
    }
}

impl Command for DuplicateEntity {
    fn description(&self) -> &str {
        &self.label
    }

    fn execute(&mut self, tree: &mut Tree) -> CommandResult {
        let (group, entity) = match &self.copy {
            Some(copy) => copy.clone(),
            None => {
                let copy = tree.copy_entity(self.source)?;
                self.copy = Some(copy.clone());
                copy
            }
        };
        let id = entity.id();
        let end = tree.group(group).map_or(0, |g| g.len());
        tree.insert_entity(group, end, entity)?;
        tree.resolve_entity(id);
        Ok(())
    }

    fn undo(&mut self, tree: &mut Tree) -> CommandResult {
        let id = self.created().ok_or_else(|| not_executed(&self.label))?;
        let (group, _, entity) = tree.remove_entity(id)?;
        self.copy = Some((group, entity));
        Ok(())
    }
}

/// Merge a blob of exported entities into the document. Dependent
/// references in the blob are shifted past the entities already present.
pub struct Import {
    label: String,
    entities: Vec<(GroupId, Entity)>,
    ids: Vec<EntityId>,
}

impl Import {
    pub fn new(tree: &mut Tree, bytes: &[u8]) -> Result<Self> {
        let (entities, diagnostics) = tree.parse_entities(bytes)?;
        for d in &diagnostics {
            log::warn!("import: {d}");
        }
        Ok(Self {
            label: format!("Import {} node(s)", entities.len()),
            entities,
            ids: Vec::new(),
        })
    }

    pub fn ids(&self) -> &[EntityId] {
        &self.ids
    }
}

impl Command for Import {
    fn description(&self) -> &str {
        &self.label
    }

    fn execute(&mut self, tree: &mut Tree) -> CommandResult {
        self.ids = tree.merge(self.entities.clone())?;
        Ok(())
    }

    fn undo(&mut self, tree: &mut Tree) -> CommandResult {
        for id in self.ids.iter().rev() {
            tree.remove_entity(*id)?;
        }
        Ok(())
    }
}

pub struct RenameEntity {
    id: EntityId,
    name: Option<String>,
    label: String,
    before: Option<Option<String>>,
}

impl RenameEntity {
    pub fn new(id: EntityId, name: Option<String>) -> Self {
        Self {
            id,
            label: format!("Rename {id}"),
            name,
            before: None,
        }
    }
}

impl Command for RenameEntity {
    fn description(&self) -> &str {
        &self.label
    }

    fn execute(&mut self, tree: &mut Tree) -> CommandResult {
        self.before = Some(tree.rename_entity(self.id, self.name.clone())?);
        Ok(())
    }

    fn undo(&mut self, tree: &mut Tree) -> CommandResult {
        let name = self.before.clone().ok_or_else(|| not_executed(&self.label))?;
        tree.rename_entity(self.id, name)?;
        Ok(())
    }
}

/// Insert an item into a node's local list. Without a node a fresh item
/// with defaults is inserted; without an index it is appended.
pub struct ListInsert {
    path: Path,
    index: Option<usize>,
    node: Option<Node>,
    label: String,
    at: Option<usize>,
}

impl ListInsert {
    pub fn new(path: Path, index: Option<usize>, node: Option<Node>) -> Self {
        let label = format!("Insert item into {path}");
        Self {
            path,
            index,
            node,
            label,
            at: None,
        }
    }
}

impl Command for ListInsert {
    fn description(&self) -> &str {
        &self.label
    }

    fn execute(&mut self, tree: &mut Tree) -> CommandResult {
        self.at = Some(tree.list_insert(&self.path, self.index, self.node.clone())?);
        Ok(())
    }

    fn undo(&mut self, tree: &mut Tree) -> CommandResult {
        let at = self.at.ok_or_else(|| not_executed(&self.label))?;
        let node = tree.list_remove(&self.path, at)?;
        // redo puts back the same item
        self.index = Some(at);
        self.node = Some(node);
        Ok(())
    }
}

pub struct ListRemove {
    path: Path,
    index: usize,
    label: String,
    removed: Option<Node>,
}

impl ListRemove {
    pub fn new(path: Path, index: usize) -> Self {
        let label = format!("Remove item {index} from {path}");
        Self {
            path,
            index,
            label,
            removed: None,
        }
    }
}

impl Command for ListRemove {
    fn description(&self) -> &str {
        &self.label
    }

    fn execute(&mut self, tree: &mut Tree) -> CommandResult {
        self.removed = Some(tree.list_remove(&self.path, self.index)?);
        Ok(())
    }

    fn undo(&mut self, tree: &mut Tree) -> CommandResult {
        let node = self.removed.clone().ok_or_else(|| not_executed(&self.label))?;
        tree.list_insert(&self.path, Some(self.index), Some(node))?;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use std::sync::Arc;

    use super::*;
    use crate::command::CompoundCommand;
    use crate::formats;

    const SCHEDULERS: GroupId = GroupId(0);
    const TIMELINES: GroupId = GroupId(1);

    fn tree() -> Tree {
        Tree::new(Arc::new(formats::avfx().unwrap())).unwrap()
    }

    #[test]
    fn compound_links_to_an_entity_it_creates() {
        let mut t = tree();
        let mut add_scheduler = AddEntity::new(&mut t, SCHEDULERS).unwrap();
        add_scheduler.execute(&mut t).unwrap();
        let triggers = Path::entity(add_scheduler.id(), [1]);
        ListInsert::new(triggers.clone(), None, None).execute(&mut t).unwrap();

        let add_timeline = AddEntity::new(&mut t, TIMELINES).unwrap();
        let timeline = add_timeline.id();
        let link = triggers.join(0).join(2);
        let mut cmd = CompoundCommand::new("Add linked timeline")
            .with(add_timeline)
            .with(SetReference::new(link.clone(), 0, Some(timeline)));
        cmd.execute(&mut t).unwrap();
        assert_eq!(t.field(&link).unwrap().value(), &Value::Ints(vec![0]));
        assert_eq!(t.field(&link).unwrap().links(), &[Some(timeline)]);

        cmd.undo(&mut t).unwrap();
        assert!(t.group(TIMELINES).unwrap().is_empty());
        assert_eq!(t.field(&link).unwrap().value(), &Value::Ints(vec![-1]));

        cmd.redo(&mut t).unwrap();
        assert_eq!(t.group(TIMELINES).unwrap().index_of(timeline), Some(0));
        assert_eq!(t.field(&link).unwrap().links(), &[Some(timeline)]);
    }

    #[test]
    fn list_items_and_names_come_back_on_undo() {
        let mut t = tree();
        let mut add = AddEntity::new(&mut t, SCHEDULERS).unwrap().named("intro");
        add.execute(&mut t).unwrap();
        let id = add.id();
        let triggers = Path::entity(id, [1]);
        for _ in 0..2 {
            ListInsert::new(triggers.clone(), None, None).execute(&mut t).unwrap();
        }
        let start = triggers.join(1).join(1);
        SetField::new(start.clone(), Value::Int(25)).execute(&mut t).unwrap();

        let mut remove = ListRemove::new(triggers.clone(), 1);
        remove.execute(&mut t).unwrap();
        assert_eq!(t.list(&triggers).unwrap().items().len(), 1);
        remove.undo(&mut t).unwrap();
        assert_eq!(t.field(&start).unwrap().value(), &Value::Int(25));

        let mut rename = RenameEntity::new(id, Some("outro".into()));
        rename.execute(&mut t).unwrap();
        let name = |t: &Tree| t.group(SCHEDULERS).unwrap().display_text(id);
        assert_eq!(name(&t).as_deref(), Some("outro"));
        rename.undo(&mut t).unwrap();
        assert_eq!(name(&t).as_deref(), Some("intro"));
    }

    #[test]
    fn list_only_takes_its_own_tag() {
        let mut t = tree();
        let mut add = AddEntity::new(&mut t, SCHEDULERS).unwrap();
        add.execute(&mut t).unwrap();
        let stray = t.format().instantiate(crate::tag::tag("Item")).unwrap();
        let mut insert = ListInsert::new(Path::entity(add.id(), [1]), None, Some(stray));
        assert!(matches!(insert.execute(&mut t), Err(Error::InvalidOperation(_))));
    }
}
