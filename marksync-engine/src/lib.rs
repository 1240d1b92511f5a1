//! The synchronization side of marksync.
//!
//! [`sync::Syncer`] owns one sync attempt at a time: it fetches the remote
//! snapshot, replays it onto the live tree with [`reconcile`], replays local
//! edits onto the remote snapshot with the line diff from `marksync-core`,
//! and writes the merged result back. Everything it talks to is behind the
//! traits in [`tree`] and [`store`]; [`memory`] has in-process
//! implementations.

pub mod api;
pub mod clock;
pub mod error;
pub mod log_buffer;
pub mod memory;
pub mod merge;
pub mod reconcile;
pub mod schedule;
pub mod store;
pub mod sync;
pub mod tree;

pub use error::SyncError;
pub use sync::{SyncOptions, SyncReport, Syncer};
