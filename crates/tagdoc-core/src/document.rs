//! Document driver: parse, serialize, verify and edit through history.

use std::fmt;
use std::sync::Arc;

use log::{info, warn};
use serde::{Deserialize, Serialize};

use crate::command::{Command, UndoHistory};
use crate::commands::{AddEntity, DuplicateEntity, Import, RemoveEntity, SetField, SetReference, ToggleAssigned};
use crate::descriptor::Format;
use crate::error::{Diagnostic, Error, Result};
use crate::group::EntityId;
use crate::path::Path;
use crate::tree::Tree;
use crate::value::Value;
use crate::workspace::WorkspaceMeta;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct EditorConfig {
    /// Undo entries kept before the oldest are dropped.
    pub history_limit: usize,
    /// Re-serialize right after parsing and compare with the input.
    pub verify_on_open: bool,
}

impl Default for EditorConfig {
    fn default() -> Self {
        Self {
            history_limit: UndoHistory::DEFAULT_MAX_SIZE,
            verify_on_open: true,
        }
    }
}

/// Outcome of a round-trip check, as shown to the user.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Verification {
    pub verified: bool,
    pub message: String,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ChangeKind {
    Executed,
    Undone,
    Redone,
    /// A history entry could not be replayed and was discarded.
    Dropped,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Change {
    pub kind: ChangeKind,
    pub description: String,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct SubscriptionId(u64);

type Listener = Box<dyn FnMut(&Change)>;

pub struct Document {
    tree: Tree,
    history: UndoHistory,
    config: EditorConfig,
    meta: Option<WorkspaceMeta>,
    diagnostics: Vec<Diagnostic>,
    verification: Option<Verification>,
    listeners: Vec<(SubscriptionId, Listener)>,
    next_listener: u64,
}

impl fmt::Debug for Document {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Document")
            .field("format", &self.tree.format().name())
            .field("groups", &self.tree.groups().iter().map(|g| (g.name(), g.len())).collect::<Vec<_>>())
            .field("undo", &self.history.undo_count())
            .field("redo", &self.history.redo_count())
            .field("diagnostics", &self.diagnostics.len())
            .finish()
    }
}

impl Document {
    /// A blank document of `format`.
    pub fn new(format: Arc<Format>) -> Result<Self> {
        Ok(Self::from_tree(Tree::new(format)?, Vec::new(), EditorConfig::default()))
    }

    pub fn parse(format: Arc<Format>, bytes: &[u8]) -> Result<Self> {
        Self::parse_with(format, bytes, EditorConfig::default())
    }

    /// Parse `bytes`. Only an unreadable container fails; everything else is
    /// recovered and reported through [`Document::diagnostics`].
    pub fn parse_with(format: Arc<Format>, bytes: &[u8], config: EditorConfig) -> Result<Self> {
        let (tree, diagnostics) = Tree::parse(format, bytes)?;
        let mut doc = Self::from_tree(tree, diagnostics, config);
        if config.verify_on_open {
            let v = doc.verify(bytes);
            if v.verified {
                info!("{}", v.message);
            } else {
                warn!("{}", v.message);
            }
            doc.verification = Some(v);
        }
        Ok(doc)
    }

    fn from_tree(tree: Tree, diagnostics: Vec<Diagnostic>, config: EditorConfig) -> Self {
        Self {
            tree,
            history: UndoHistory::with_capacity(config.history_limit),
            config,
            meta: None,
            diagnostics,
            verification: None,
            listeners: Vec::new(),
            next_listener: 0,
        }
    }

    pub fn serialize(&self) -> Vec<u8> {
        self.tree.serialize()
    }

    /// Compare a fresh serialization against `original`.
    pub fn verify(&self, original: &[u8]) -> Verification {
        let written = self.serialize();
        let mut message = match first_difference(original, &written) {
            None => "verified".to_string(),
            Some(at) => format!(
                "parsing issue: output differs from input at {at:#x} ({} bytes in, {} bytes out)",
                original.len(),
                written.len()
            ),
        };
        if !self.diagnostics.is_empty() {
            message.push_str(&format!("; {} diagnostic(s)", self.diagnostics.len()));
            for d in self.diagnostics.iter().take(5) {
                message.push_str(&format!("\n  {d}"));
            }
        }
        Verification {
            verified: written == original,
            message,
        }
    }

    /// Result of the check made when the document was opened.
    pub fn verification(&self) -> Option<&Verification> {
        self.verification.as_ref()
    }

    pub fn tree(&self) -> &Tree {
        &self.tree
    }

    pub fn format(&self) -> &Arc<Format> {
        self.tree.format()
    }

    pub fn config(&self) -> &EditorConfig {
        &self.config
    }

    pub fn diagnostics(&self) -> &[Diagnostic] {
        &self.diagnostics
    }

    pub fn meta(&self) -> Option<&WorkspaceMeta> {
        self.meta.as_ref()
    }

    pub fn with_meta(mut self, meta: WorkspaceMeta) -> Self {
        self.meta = Some(meta);
        self
    }

    // ---- history ----

    /// Apply a command and record it. A failing command leaves the document
    /// unchanged and is not recorded.
    pub fn execute(&mut self, mut cmd: Box<dyn Command>) -> Result<()> {
        cmd.execute(&mut self.tree)?;
        self.record(cmd);
        Ok(())
    }

    fn record(&mut self, cmd: Box<dyn Command>) {
        let description = cmd.description().to_string();
        self.history.push(cmd);
        self.notify(ChangeKind::Executed, description);
    }

    /// Undo the last command. Returns false if there was nothing to undo or
    /// the entry could not be replayed; in the latter case the entry and
    /// everything older is dropped.
    pub fn undo(&mut self) -> bool {
        let Some(mut cmd) = self.history.pop_undo() else {
            return false;
        };
        let description = cmd.description().to_string();
        match cmd.undo(&mut self.tree) {
            Ok(()) => {
                self.history.push_to_redo(cmd);
                self.notify(ChangeKind::Undone, description);
                true
            }
            Err(e) => {
                warn!("undo of '{description}' failed, dropping history: {e}");
                self.history.clear_undo();
                self.notify(ChangeKind::Dropped, description);
                false
            }
        }
    }

    /// Redo the last undone command; failures drop the redo stack.
    pub fn redo(&mut self) -> bool {
        let Some(mut cmd) = self.history.pop_redo() else {
            return false;
        };
        let description = cmd.description().to_string();
        match cmd.redo(&mut self.tree) {
            Ok(()) => {
                self.history.push_to_undo(cmd);
                self.notify(ChangeKind::Redone, description);
                true
            }
            Err(e) => {
                warn!("redo of '{description}' failed, dropping redo history: {e}");
                self.history.clear_redo();
                self.notify(ChangeKind::Dropped, description);
                false
            }
        }
    }

    pub fn can_undo(&self) -> bool {
        self.history.can_undo()
    }

    pub fn can_redo(&self) -> bool {
        self.history.can_redo()
    }

    pub fn undo_description(&self) -> Option<&str> {
        self.history.undo_description()
    }

    pub fn redo_description(&self) -> Option<&str> {
        self.history.redo_description()
    }

    pub fn is_dirty(&self) -> bool {
        self.history.is_dirty()
    }

    pub fn mark_saved(&mut self) {
        self.history.mark_saved();
    }

    // ---- notifications ----

    pub fn subscribe(&mut self, listener: impl FnMut(&Change) + 'static) -> SubscriptionId {
        let id = SubscriptionId(self.next_listener);
        self.next_listener += 1;
        self.listeners.push((id, Box::new(listener)));
        id
    }

    pub fn unsubscribe(&mut self, id: SubscriptionId) -> bool {
        let before = self.listeners.len();
        self.listeners.retain(|(x, _)| *x != id);
        self.listeners.len() != before
    }

    fn notify(&mut self, kind: ChangeKind, description: String) {
        let change = Change { kind, description };
        for (_, listener) in &mut self.listeners {
            listener(&change);
        }
    }

    // ---- group-scoped edits ----

    pub fn set_field(&mut self, path: Path, value: Value) -> Result<()> {
        self.execute(Box::new(SetField::new(path, value)))
    }

    pub fn set_reference(&mut self, path: Path, slot: usize, target: Option<EntityId>) -> Result<()> {
        self.execute(Box::new(SetReference::new(path, slot, target)))
    }

    pub fn toggle_assigned(&mut self, path: Path) -> Result<()> {
        let cmd = ToggleAssigned::toggle(&self.tree, path)?;
        self.execute(Box::new(cmd))
    }

    /// Append a fresh entity to the named group.
    pub fn add_entity(&mut self, group: &str) -> Result<EntityId> {
        let group = self
            .format()
            .group_id(group)
            .ok_or_else(|| Error::InvalidOperation(format!("no group '{group}'")))?;
        let cmd = AddEntity::new(&mut self.tree, group)?;
        let id = cmd.id();
        self.execute(Box::new(cmd))?;
        Ok(id)
    }

    pub fn remove_entity(&mut self, id: EntityId) -> Result<()> {
        self.execute(Box::new(RemoveEntity::new(id)))
    }

    pub fn duplicate_entity(&mut self, id: EntityId) -> Result<EntityId> {
        let mut cmd = DuplicateEntity::new(id);
        cmd.execute(&mut self.tree)?;
        let copy = cmd
            .created()
            .ok_or_else(|| Error::InvalidOperation(format!("duplicating {id} produced nothing")))?;
        self.record(Box::new(cmd));
        Ok(copy)
    }

    /// Serialize an entity and its dependencies for a node library.
    pub fn export_entity(&self, id: EntityId) -> Result<Vec<u8>> {
        self.tree.export(id)
    }

    /// Merge exported nodes into this document; returns the new entities.
    pub fn import(&mut self, bytes: &[u8]) -> Result<Vec<EntityId>> {
        let mut cmd = Import::new(&mut self.tree, bytes)?;
        cmd.execute(&mut self.tree)?;
        let ids = cmd.ids().to_vec();
        self.record(Box::new(cmd));
        Ok(ids)
    }
}

fn first_difference(a: &[u8], b: &[u8]) -> Option<usize> {
    a.iter()
        .zip(b)
        .position(|(x, y)| x != y)
        .or_else(|| (a.len() != b.len()).then(|| a.len().min(b.len())))
}
