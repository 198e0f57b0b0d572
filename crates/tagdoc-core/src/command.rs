//! Command trait, compound commands and the undo/redo history.
//!
//! Every edit the presentation layer makes goes through a [`Command`] so it
//! can be reverted. Concrete commands live in [`crate::commands`].

use log::warn;

use crate::error::{Error, Result};
use crate::tree::Tree;

pub type CommandResult = Result<()>;

/// A reversible edit of a [`Tree`].
///
/// `execute` either applies completely or returns an error with the tree
/// unchanged. `undo` restores the state `execute` started from.
pub trait Command {
    /// Human-readable description for the undo/redo menu.
    fn description(&self) -> &str;

    fn execute(&mut self, tree: &mut Tree) -> CommandResult;

    fn undo(&mut self, tree: &mut Tree) -> CommandResult;

    fn redo(&mut self, tree: &mut Tree) -> CommandResult {
        self.execute(tree)
    }
}

/// Several commands applied as one history entry.
///
/// By default sub-commands execute first to last and undo last to first.
/// Either direction can be flipped independently.
pub struct CompoundCommand {
    description: String,
    commands: Vec<Box<dyn Command>>,
    reverse_execute: bool,
    reverse_undo: bool,
}

impl CompoundCommand {
    pub fn new(description: impl Into<String>) -> Self {
        Self {
            description: description.into(),
            commands: Vec::new(),
            reverse_execute: false,
            reverse_undo: true,
        }
    }

    pub fn with(mut self, cmd: impl Command + 'static) -> Self {
        self.commands.push(Box::new(cmd));
        self
    }

    pub fn push(&mut self, cmd: Box<dyn Command>) {
        self.commands.push(cmd);
    }

    pub fn reverse_execute(mut self, reverse: bool) -> Self {
        self.reverse_execute = reverse;
        self
    }

    pub fn reverse_undo(mut self, reverse: bool) -> Self {
        self.reverse_undo = reverse;
        self
    }

    pub fn len(&self) -> usize {
        self.commands.len()
    }

    pub fn is_empty(&self) -> bool {
        self.commands.is_empty()
    }

    fn order(&self, reverse: bool) -> Vec<usize> {
        let mut order: Vec<usize> = (0..self.commands.len()).collect();
        if reverse {
            order.reverse();
        }
        order
    }

    /// Run `forward` (execute or redo) or undo over `order`. If a step
    /// fails, the steps already taken are rolled back in the opposite
    /// direction so the compound applies all or nothing.
    fn run(&mut self, tree: &mut Tree, order: Vec<usize>, forward: Step) -> CommandResult {
        for (done, &i) in order.iter().enumerate() {
            let result = match forward {
                Step::Execute => self.commands[i].execute(tree),
                Step::Redo => self.commands[i].redo(tree),
                Step::Undo => self.commands[i].undo(tree),
            };
            if let Err(e) = result {
                for &j in order[..done].iter().rev() {
                    let back = match forward {
                        Step::Execute | Step::Redo => self.commands[j].undo(tree),
                        Step::Undo => self.commands[j].redo(tree),
                    };
                    if let Err(e2) = back {
                        warn!("{}: rollback of step {j} failed: {e2}", self.description);
                    }
                }
                return Err(Error::CommandReplay {
                    command: self.description.clone(),
                    reason: format!("step {i} ({}): {e}", self.commands[i].description()),
                });
            }
        }
        Ok(())
    }
}

#[derive(Clone, Copy)]
enum Step {
    Execute,
    Redo,
    Undo,
}

impl Command for CompoundCommand {
    fn description(&self) -> &str {
        &self.description
    }

    fn execute(&mut self, tree: &mut Tree) -> CommandResult {
        let order = self.order(self.reverse_execute);
        self.run(tree, order, Step::Execute)
    }

    fn undo(&mut self, tree: &mut Tree) -> CommandResult {
        let order = self.order(self.reverse_undo);
        self.run(tree, order, Step::Undo)
    }

    fn redo(&mut self, tree: &mut Tree) -> CommandResult {
        let order = self.order(self.reverse_execute);
        self.run(tree, order, Step::Redo)
    }
}

/// Undo/redo history stack.
pub struct UndoHistory {
    /// Commands that can be undone
    undo_stack: Vec<Box<dyn Command>>,
    /// Commands that can be redone
    redo_stack: Vec<Box<dyn Command>>,
    max_size: usize,
    /// Whether history has been modified since last save
    dirty: bool,
}

impl Default for UndoHistory {
    fn default() -> Self {
        Self::new()
    }
}

impl UndoHistory {
    pub const DEFAULT_MAX_SIZE: usize = 100;

    pub fn new() -> Self {
        Self::with_capacity(Self::DEFAULT_MAX_SIZE)
    }

    pub fn with_capacity(max_size: usize) -> Self {
        Self {
            undo_stack: Vec::new(),
            redo_stack: Vec::new(),
            max_size: max_size.max(1),
            dirty: false,
        }
    }

    pub fn can_undo(&self) -> bool {
        !self.undo_stack.is_empty()
    }

    pub fn can_redo(&self) -> bool {
        !self.redo_stack.is_empty()
    }

    pub fn undo_description(&self) -> Option<&str> {
        self.undo_stack.last().map(|c| c.description())
    }

    pub fn redo_description(&self) -> Option<&str> {
        self.redo_stack.last().map(|c| c.description())
    }

    pub fn is_dirty(&self) -> bool {
        self.dirty
    }

    pub fn mark_saved(&mut self) {
        self.dirty = false;
    }

    /// Record an executed command. Clears the redo stack and drops the
    /// oldest entries beyond the size limit.
    pub fn push(&mut self, cmd: Box<dyn Command>) {
        self.undo_stack.push(cmd);
        self.redo_stack.clear();
        self.dirty = true;
        if self.undo_stack.len() > self.max_size {
            let excess = self.undo_stack.len() - self.max_size;
            self.undo_stack.drain(..excess);
        }
    }

    pub fn pop_undo(&mut self) -> Option<Box<dyn Command>> {
        self.undo_stack.pop()
    }

    pub fn pop_redo(&mut self) -> Option<Box<dyn Command>> {
        self.redo_stack.pop()
    }

    pub fn push_to_undo(&mut self, cmd: Box<dyn Command>) {
        self.undo_stack.push(cmd);
        self.dirty = true;
    }

    pub fn push_to_redo(&mut self, cmd: Box<dyn Command>) {
        self.redo_stack.push(cmd);
        self.dirty = true;
    }

    /// Entries below a failed undo were recorded against a state that can no
    /// longer be reached.
    pub fn clear_undo(&mut self) {
        self.undo_stack.clear();
    }

    pub fn clear_redo(&mut self) {
        self.redo_stack.clear();
    }

    pub fn clear(&mut self) {
        self.undo_stack.clear();
        self.redo_stack.clear();
        self.dirty = false;
    }

    pub fn undo_count(&self) -> usize {
        self.undo_stack.len()
    }

    pub fn redo_count(&self) -> usize {
        self.redo_stack.len()
    }
}

#[cfg(test)]
mod tests {
    use std::sync::Arc;

    use super::*;
    use crate::commands::SetField;
    use crate::formats;
    use crate::path::Path;
    use crate::value::Value;

    fn tree() -> Tree {
        Tree::new(Arc::new(formats::avfx().unwrap())).unwrap()
    }

    /// Fails on execute or undo as configured.
    struct Failing {
        on_execute: bool,
    }

    impl Command for Failing {
        fn description(&self) -> &str {
            "Failing"
        }

        fn execute(&mut self, _tree: &mut Tree) -> CommandResult {
            if self.on_execute {
                Err(Error::InvalidOperation("nope".into()))
            } else {
                Ok(())
            }
        }

        fn undo(&mut self, _tree: &mut Tree) -> CommandResult {
            Err(Error::InvalidOperation("nope".into()))
        }
    }

    #[test]
    fn history_limit_drops_oldest() {
        let mut history = UndoHistory::with_capacity(2);
        for _ in 0..3 {
            history.push(Box::new(Failing { on_execute: false }));
        }
        assert_eq!(history.undo_count(), 2);
        assert!(history.is_dirty());
        history.mark_saved();
        assert!(!history.is_dirty());
    }

    #[test]
    fn compound_rolls_back_on_failure() {
        let mut t = tree();
        let version = Path::root([0]);
        let before = t.field(&version).unwrap().value().clone();
        let mut cmd = CompoundCommand::new("set then fail")
            .with(SetField::new(version.clone(), Value::Int(7)))
            .with(Failing { on_execute: true });
        let err = cmd.execute(&mut t).unwrap_err();
        assert!(matches!(err, Error::CommandReplay { .. }));
        assert_eq!(t.field(&version).unwrap().value(), &before);
    }

    #[test]
    fn compound_undo_order_is_configurable() {
        let mut t = tree();
        let version = Path::root([0]);
        let mut cmd = CompoundCommand::new("twice")
            .with(SetField::new(version.clone(), Value::Int(1)))
            .with(SetField::new(version.clone(), Value::Int(2)))
            .reverse_undo(true);
        cmd.execute(&mut t).unwrap();
        assert_eq!(t.field(&version).unwrap().value(), &Value::Int(2));
        cmd.undo(&mut t).unwrap();
        assert_eq!(t.field(&version).unwrap().value(), &Value::Int(0));

        // undoing first-to-last leaves the first command's "before" in place
        let mut cmd = CompoundCommand::new("twice")
            .with(SetField::new(version.clone(), Value::Int(1)))
            .with(SetField::new(version.clone(), Value::Int(2)))
            .reverse_undo(false);
        cmd.execute(&mut t).unwrap();
        cmd.undo(&mut t).unwrap();
        assert_eq!(t.field(&version).unwrap().value(), &Value::Int(1));
    }
}
