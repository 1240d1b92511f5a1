//! Core data structures and algorithms for marksync.
//!
//! A bookmark tree is diffed by flattening it into `path = value` lines
//! ([`flat`]), running a line diff over them ([`patch`]) and rebuilding the
//! tree from the patched lines. [`path`] is the small path language the
//! rebuilding step writes through.

pub mod bookmark;
pub mod error;
pub mod flat;
pub mod patch;
pub mod path;
pub mod value;

pub use bookmark::{BookmarkNode, Category, NodeSpec, Snapshot};
pub use error::{CodecError, PatchError};
pub use value::Value;
