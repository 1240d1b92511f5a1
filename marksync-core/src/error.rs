use thiserror::Error;

/// Structural errors of the flattened line form.
///
/// Input produced by [`crate::flat::flatten`] never triggers these; they
/// indicate a corrupted line sequence or a patch that produced one.
#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum CodecError {
    #[error("invalid path {path:?}: {reason}")]
    InvalidPath { path: String, reason: String },

    #[error("invalid flat line {line:?}: {reason}")]
    InvalidLine { line: String, reason: String },

    #[error("cannot address {path}: expected {expected}, found {found}")]
    ShapeConflict {
        path: String,
        expected: &'static str,
        found: &'static str,
    },
}

#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum PatchError {
    #[error("malformed patch at line {line}: {reason}")]
    Malformed { line: usize, reason: String },

    /// The hunk's context could not be located in the target, even with fuzz.
    #[error("hunk #{hunk} does not match the target")]
    NoMatch { hunk: usize },

    #[error(transparent)]
    Codec(#[from] CodecError),
}
