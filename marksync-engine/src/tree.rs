//! The live bookmark tree, as seen by the engine.

use anyhow::Result;
use marksync_core::{BookmarkNode, Category, NodeSpec, Snapshot};
use std::collections::BTreeMap;

pub type NodeId = String;

/// A node of the live tree, with its native id.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct LiveNode {
    pub id: NodeId,
    pub spec: NodeSpec,
    pub children: Vec<LiveNode>,
}

impl LiveNode {
    /// The node without its id, children included.
    pub fn to_bookmark(&self) -> BookmarkNode {
        match &self.spec {
            NodeSpec::Bookmark { title, url } => BookmarkNode::Bookmark {
                title: title.clone(),
                url: url.clone(),
            },
            NodeSpec::Folder { title } => BookmarkNode::Folder {
                title: title.clone(),
                children: self.children.iter().map(LiveNode::to_bookmark).collect(),
            },
            NodeSpec::Separator => BookmarkNode::Separator,
        }
    }

    pub fn is_same(&self, node: &BookmarkNode) -> bool {
        self.spec == node.spec()
    }
}

/// A mutable bookmark store, such as a browser's.
#[async_trait::async_trait]
pub trait LiveTree: Send + Sync {
    /// Root folder of each category this environment supports.
    async fn list_roots(&self) -> Result<BTreeMap<Category, NodeId>>;

    /// Children of a folder, each with its whole subtree.
    async fn get_subtree(&self, id: &str) -> Result<Vec<LiveNode>>;

    /// Create a node at `index` among the children of `parent`. Folders are
    /// created empty.
    async fn create(&self, parent: &str, index: usize, spec: &NodeSpec) -> Result<LiveNode>;

    /// Remove a node and everything below it.
    async fn remove_subtree(&self, id: &str) -> Result<()>;
}

/// Capture the supported categories of `tree` as a new snapshot.
pub async fn capture(tree: &dyn LiveTree, origin_tag: &str, now: i64) -> Result<Snapshot> {
    let mut snapshot = Snapshot::new(origin_tag, now);
    for (category, root) in tree.list_roots().await? {
        let children = tree.get_subtree(&root).await?;
        snapshot.categories.insert(
            category,
            children.iter().map(LiveNode::to_bookmark).collect(),
        );
    }
    Ok(snapshot)
}
