//! tagdoc-core: structured editing of tagged binary asset formats
//!
//! This crate focuses on a small, well-factored surface:
//! - Format descriptors (tag → ordered children) loaded from Rust or JSON
//! - Best-effort reader and byte-faithful writer for tagged, size-prefixed blocks
//! - Document groups with index references kept consistent across edits
//! - Command-based editing with undo/redo
//! - JSON dump of any document for CLI use
//!
pub mod command;
pub mod commands;
pub mod cursor;
pub mod descriptor;
pub mod document;
pub mod error;
pub mod field;
pub mod formats;
pub mod group;
pub mod json;
pub mod node;
pub mod path;
pub mod tag;
pub mod tree;
pub mod value;
pub mod workspace;

pub use command::{Command, CommandResult, CompoundCommand, UndoHistory};
pub use descriptor::{ChildDef, Format, FormatDescriptor, GroupDef, NodeDef};
pub use document::{Change, ChangeKind, Document, EditorConfig, SubscriptionId, Verification};
pub use error::{Diagnostic, DiagnosticKind, Error, Result};
pub use field::{Field, FieldKind, RefSpec};
pub use group::{Entity, EntityId, GroupId, NodeGroup};
pub use json::{JsonOpts, document_to_json_value, dump_json, json_to_value};
pub use node::{Block, Child, Node};
pub use path::{Owner, Path};
pub use tag::{Tag, TagOrder};
pub use tree::Tree;
pub use value::Value;
pub use workspace::WorkspaceMeta;
