//! Workspace metadata attached to an open document.
//!
//! The storage format is owned by whoever writes workspaces; the core only
//! reads these records to know where a document came from.

use serde::{Deserialize, Serialize};

use crate::error::Result;

/// A game path chosen as the source of a document or the file it replaces.
#[derive(Debug, Clone, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "PascalCase")]
pub struct PathDescriptor {
    #[serde(default, rename = "Type")]
    pub kind: String,
    #[serde(default)]
    pub display_string: String,
    pub path: String,
}

#[derive(Debug, Clone, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "PascalCase")]
pub struct WorkspaceMeta {
    /// Where the document's bytes live, relative to the workspace root.
    pub relative_location: String,
    #[serde(default)]
    pub name: String,
    #[serde(default)]
    pub source: Option<PathDescriptor>,
    #[serde(default)]
    pub replace: Option<PathDescriptor>,
}

impl WorkspaceMeta {
    pub fn from_json(text: &str) -> Result<Self> {
        Ok(serde_json::from_str(text)?)
    }

    /// Name to show for the document: the stored name, else the file name of
    /// its location.
    pub fn display_name(&self) -> &str {
        if !self.name.is_empty() {
            return &self.name;
        }
        self.relative_location
            .rsplit(['/', '\\'])
            .next()
            .unwrap_or(&self.relative_location)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn reads_workspace_record() {
        let meta = WorkspaceMeta::from_json(
            r#"{
                "RelativeLocation": "Avfx/VFX_0.avfx",
                "Source": { "Type": "Action", "DisplayString": "Fire", "Path": "vfx/action/fire.avfx" },
                "Replace": { "Path": "vfx/action/ice.avfx" }
            }"#,
        )
        .unwrap();
        assert_eq!(meta.display_name(), "VFX_0.avfx");
        assert_eq!(meta.source.unwrap().display_string, "Fire");
        assert_eq!(meta.replace.unwrap().path, "vfx/action/ice.avfx");
    }
}
