use thiserror::Error;

use crate::tag::Tag;

#[derive(Debug, Error)]
pub enum Error {
    /// The outer container cannot be read at all (bad magic, impossible size).
    #[error("invalid document: {0}")]
    InvalidDocument(String),

    #[error("malformed data at offset {offset:#x}: {message}")]
    MalformedData { offset: usize, message: String },

    #[error("unknown tag {tag} at offset {offset:#x}")]
    UnknownTag { tag: Tag, offset: usize },

    #[error("reference into group '{group}' left dangling at index {index}")]
    DanglingReference { group: String, index: i64 },

    #[error("command '{command}' could not be replayed: {reason}")]
    CommandReplay { command: String, reason: String },

    #[error("path does not address {expected}: {path}")]
    InvalidPath { expected: &'static str, path: String },

    #[error("invalid value for field '{field}': {message}")]
    InvalidValue { field: String, message: String },

    #[error("invalid operation: {0}")]
    InvalidOperation(String),

    #[error("format descriptor: {0}")]
    Descriptor(String),

    #[error(transparent)]
    Json(#[from] serde_json::Error),
}

pub type Result<T> = std::result::Result<T, Error>;

impl Error {
    pub(crate) fn eof(offset: usize, need: usize, have: usize) -> Self {
        Error::MalformedData {
            offset,
            message: format!("unexpected end of data (need {need} bytes, have {have})"),
        }
    }
}

/// Class of a recovered, non-fatal parse problem.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DiagnosticKind {
    MalformedData,
    UnknownTag,
    UnexpectedTag,
    NonZeroPadding,
    Reference,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Diagnostic {
    pub kind: DiagnosticKind,
    pub offset: usize,
    pub message: String,
}

impl std::fmt::Display for Diagnostic {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{:?} @ {:#x}: {}", self.kind, self.offset, self.message)
    }
}
