//! Make a live folder match a desired child list.
//!
//! This is a greedy positional walk with one element of lookahead. A node
//! that moved further than one position is removed and created again, which
//! gives it a new native id but leaves the visible tree correct.

use crate::tree::{LiveNode, LiveTree};
use anyhow::Result;
use futures_util::future::{BoxFuture, FutureExt as _};
use marksync_core::{BookmarkNode, Snapshot};
use serde::{Deserialize, Serialize};
use tracing::{debug, trace};

/// Mutations issued while reconciling.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct ReconcileStats {
    /// Nodes created, counting the contents of created folders.
    pub created: usize,
    /// Subtree removals.
    pub removed: usize,
}

impl std::ops::AddAssign for ReconcileStats {
    fn add_assign(&mut self, other: Self) {
        self.created += other.created;
        self.removed += other.removed;
    }
}

/// Reconcile every supported category of `tree` toward `desired`.
///
/// Categories that `desired` does not mention are left alone.
pub async fn reconcile_snapshot(tree: &dyn LiveTree, desired: &Snapshot) -> Result<ReconcileStats> {
    let mut stats = ReconcileStats::default();
    for (category, root) in tree.list_roots().await? {
        let Some(children) = desired.category(category) else {
            trace!(%category, "category not in snapshot, skipping");
            continue;
        };
        let actual = tree.get_subtree(&root).await?;
        reconcile(tree, &actual, children, &root, &mut stats).await?;
        debug!(%category, created = stats.created, removed = stats.removed, "reconciled category");
    }
    Ok(stats)
}

/// Reconcile the children `actual` of folder `parent` toward `desired`.
pub fn reconcile<'a>(
    tree: &'a dyn LiveTree,
    actual: &'a [LiveNode],
    desired: &'a [BookmarkNode],
    parent: &'a str,
    stats: &'a mut ReconcileStats,
) -> BoxFuture<'a, Result<()>> {
    async move {
        let (mut i, mut j) = (0, 0);
        while i < actual.len() && j < desired.len() {
            if actual[i].is_same(&desired[j]) {
                if let Some(children) = desired[j].children() {
                    reconcile(tree, &actual[i].children, children, &actual[i].id, stats).await?;
                }
                i += 1;
                j += 1;
            } else if desired.get(j + 1).is_some_and(|next| actual[i].is_same(next)) {
                create(tree, &desired[j], parent, j, stats).await?;
                j += 1;
            } else {
                remove(tree, &actual[i], stats).await?;
                i += 1;
            }
        }
        for node in &actual[i..] {
            remove(tree, node, stats).await?;
        }
        for (index, node) in desired.iter().enumerate().skip(j) {
            create(tree, node, parent, index, stats).await?;
        }
        Ok(())
    }
    .boxed()
}

async fn create(
    tree: &dyn LiveTree,
    node: &BookmarkNode,
    parent: &str,
    index: usize,
    stats: &mut ReconcileStats,
) -> Result<()> {
    let created = tree.create(parent, index, &node.spec()).await?;
    trace!(id = %created.id, parent, index, "created node");
    stats.created += 1;
    if let Some(children) = node.children() {
        reconcile(tree, &created.children, children, &created.id, stats).await?;
    }
    Ok(())
}

async fn remove(tree: &dyn LiveTree, node: &LiveNode, stats: &mut ReconcileStats) -> Result<()> {
    tree.remove_subtree(&node.id).await?;
    trace!(id = %node.id, "removed subtree");
    stats.removed += 1;
    Ok(())
}
