//! In-process implementations of the collaborator traits.
//!
//! [`MemoryTree`] also backs the file-based live tree of the command line
//! tool; the others are mostly useful in tests.

use crate::store::{RemoteBlob, RemoteStore, StateStore};
use crate::tree::{LiveNode, LiveTree, NodeId};
use anyhow::{bail, Context, Result};
use marksync_core::{BookmarkNode, Category, NodeSpec, Snapshot};
use serde_json::{Map, Value};
use std::collections::BTreeMap;
use std::sync::Mutex;

/// A mutation recorded by a [`MemoryTree::recording`] tree.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum TreeOp {
    Create {
        parent: NodeId,
        index: usize,
        spec: NodeSpec,
    },
    Remove {
        id: NodeId,
    },
}

pub struct MemoryTree {
    inner: Mutex<TreeState>,
}

struct TreeState {
    roots: BTreeMap<Category, LiveNode>,
    next_id: u64,
    ops: Option<Vec<TreeOp>>,
    revision: u64,
}

impl MemoryTree {
    /// An empty tree with a root folder for each of `categories`.
    pub fn new(categories: &[Category]) -> Self {
        let roots = categories
            .iter()
            .map(|&category| {
                (
                    category,
                    LiveNode {
                        id: category.builtin_id().to_owned(),
                        spec: NodeSpec::Folder {
                            title: category.as_str().to_owned(),
                        },
                        children: Vec::new(),
                    },
                )
            })
            .collect();
        MemoryTree {
            inner: Mutex::new(TreeState {
                roots,
                next_id: 1,
                ops: None,
                revision: 0,
            }),
        }
    }

    /// Keep a log of every [`LiveTree`] mutation from now on, see [`MemoryTree::ops`].
    pub fn recording(self) -> Self {
        self.lock().ops = Some(Vec::new());
        self
    }

    /// A tree supporting every category, filled from `snapshot`.
    pub fn from_snapshot(snapshot: &Snapshot) -> Self {
        let tree = MemoryTree::new(&Category::ALL);
        tree.load(snapshot);
        tree
    }

    /// Replace the contents of every category with what `snapshot` has (or
    /// nothing). Not recorded as operations.
    pub fn load(&self, snapshot: &Snapshot) {
        let mut state = self.lock();
        let categories: Vec<Category> = state.roots.keys().copied().collect();
        for category in categories {
            let nodes = snapshot.category(category).unwrap_or_default();
            state.replace_children(category, nodes);
        }
    }

    /// Replace one category's contents. Not recorded as operations.
    pub fn set_category(&self, category: Category, nodes: &[BookmarkNode]) {
        self.lock().replace_children(category, nodes);
    }

    pub fn category(&self, category: Category) -> Vec<BookmarkNode> {
        self.lock()
            .roots
            .get(&category)
            .map(|root| root.children.iter().map(LiveNode::to_bookmark).collect())
            .unwrap_or_default()
    }

    pub fn to_snapshot(&self, origin_tag: &str, now: i64) -> Snapshot {
        let state = self.lock();
        let mut snapshot = Snapshot::new(origin_tag, now);
        for (category, root) in &state.roots {
            snapshot.categories.insert(
                *category,
                root.children.iter().map(LiveNode::to_bookmark).collect(),
            );
        }
        snapshot
    }

    /// The recorded mutations. Always empty unless the tree is recording.
    pub fn ops(&self) -> Vec<TreeOp> {
        self.lock().ops.clone().unwrap_or_default()
    }

    /// Increases on every change to the tree.
    pub fn revision(&self) -> u64 {
        self.lock().revision
    }

    fn lock(&self) -> std::sync::MutexGuard<'_, TreeState> {
        self.inner.lock().expect("mutex poisoned")
    }
}

impl TreeState {
    fn fresh_id(&mut self) -> NodeId {
        let id = self.next_id;
        self.next_id += 1;
        format!("n{}", id)
    }

    fn build(&mut self, node: &BookmarkNode) -> LiveNode {
        let id = self.fresh_id();
        let children = node
            .children()
            .unwrap_or_default()
            .iter()
            .map(|child| self.build(child))
            .collect();
        LiveNode {
            id,
            spec: node.spec(),
            children,
        }
    }

    fn record(&mut self, op: TreeOp) {
        if let Some(ops) = &mut self.ops {
            ops.push(op);
        }
    }

    fn replace_children(&mut self, category: Category, nodes: &[BookmarkNode]) {
        let children: Vec<LiveNode> = nodes.iter().map(|n| self.build(n)).collect();
        if let Some(root) = self.roots.get_mut(&category) {
            root.children = children;
            self.revision += 1;
        }
    }

    fn find_mut(&mut self, id: &str) -> Option<&mut LiveNode> {
        for root in self.roots.values_mut() {
            if root.id == id {
                return Some(root);
            }
            if let Some(found) = find_in(&mut root.children, id) {
                return Some(found);
            }
        }
        None
    }
}

fn find_in<'a>(nodes: &'a mut [LiveNode], id: &str) -> Option<&'a mut LiveNode> {
    for node in nodes {
        if node.id == id {
            return Some(node);
        }
        if let Some(found) = find_in(&mut node.children, id) {
            return Some(found);
        }
    }
    None
}

fn remove_in(nodes: &mut Vec<LiveNode>, id: &str) -> bool {
    if let Some(position) = nodes.iter().position(|n| n.id == id) {
        nodes.remove(position);
        return true;
    }
    nodes.iter_mut().any(|n| remove_in(&mut n.children, id))
}

#[async_trait::async_trait]
impl LiveTree for MemoryTree {
    async fn list_roots(&self) -> Result<BTreeMap<Category, NodeId>> {
        Ok(self
            .lock()
            .roots
            .iter()
            .map(|(category, root)| (*category, root.id.clone()))
            .collect())
    }

    async fn get_subtree(&self, id: &str) -> Result<Vec<LiveNode>> {
        let mut state = self.lock();
        let node = state
            .find_mut(id)
            .with_context(|| format!("no bookmark node with id {}", id))?;
        Ok(node.children.clone())
    }

    async fn create(&self, parent: &str, index: usize, spec: &NodeSpec) -> Result<LiveNode> {
        let mut state = self.lock();
        let id = state.fresh_id();
        let node = LiveNode {
            id,
            spec: spec.clone(),
            children: Vec::new(),
        };
        let folder = state
            .find_mut(parent)
            .with_context(|| format!("no bookmark node with id {}", parent))?;
        if !folder.spec.is_folder() {
            bail!("cannot create a node inside {}: not a folder", parent);
        }
        let index = index.min(folder.children.len());
        folder.children.insert(index, node.clone());
        state.record(TreeOp::Create {
            parent: parent.to_owned(),
            index,
            spec: spec.clone(),
        });
        state.revision += 1;
        Ok(node)
    }

    async fn remove_subtree(&self, id: &str) -> Result<()> {
        let mut state = self.lock();
        if state.roots.values().any(|root| root.id == id) {
            bail!("cannot remove the root folder {}", id);
        }
        let removed = state
            .roots
            .values_mut()
            .any(|root| remove_in(&mut root.children, id));
        if !removed {
            bail!("no bookmark node with id {}", id);
        }
        state.record(TreeOp::Remove { id: id.to_owned() });
        state.revision += 1;
        Ok(())
    }
}

/// Documents held in memory, keyed by document id.
#[derive(Default)]
pub struct MemoryRemote {
    inner: Mutex<RemoteState>,
}

#[derive(Default)]
struct RemoteState {
    documents: BTreeMap<String, String>,
    truncated: bool,
    fail_get: Option<String>,
    fail_put: Option<String>,
    puts: usize,
}

impl MemoryRemote {
    pub fn with_snapshot(document_id: &str, snapshot: &Snapshot) -> Result<Self> {
        let remote = MemoryRemote::default();
        remote.lock().documents.insert(
            document_id.to_owned(),
            serde_json::to_string_pretty(snapshot)?,
        );
        Ok(remote)
    }

    pub fn content(&self, document_id: &str) -> Option<String> {
        self.lock().documents.get(document_id).cloned()
    }

    pub fn snapshot(&self, document_id: &str) -> Result<Option<Snapshot>> {
        self.content(document_id)
            .map(|content| serde_json::from_str(&content))
            .transpose()
            .map_err(Into::into)
    }

    /// Report every document as truncated from now on.
    pub fn set_truncated(&self, truncated: bool) {
        self.lock().truncated = truncated;
    }

    /// Fail the next `get` with `message`.
    pub fn fail_next_get(&self, message: &str) {
        self.lock().fail_get = Some(message.to_owned());
    }

    /// Fail the next `put` with `message`.
    pub fn fail_next_put(&self, message: &str) {
        self.lock().fail_put = Some(message.to_owned());
    }

    pub fn put_count(&self) -> usize {
        self.lock().puts
    }

    fn lock(&self) -> std::sync::MutexGuard<'_, RemoteState> {
        self.inner.lock().expect("mutex poisoned")
    }
}

#[async_trait::async_trait]
impl RemoteStore for MemoryRemote {
    async fn get(&self, document_id: &str, _token: &str) -> Result<RemoteBlob> {
        let mut state = self.lock();
        if let Some(message) = state.fail_get.take() {
            bail!(message);
        }
        Ok(RemoteBlob {
            content: state.documents.get(document_id).cloned(),
            truncated: state.truncated,
        })
    }

    async fn put(&self, document_id: &str, _token: &str, content: &str) -> Result<()> {
        let mut state = self.lock();
        if let Some(message) = state.fail_put.take() {
            bail!(message);
        }
        state
            .documents
            .insert(document_id.to_owned(), content.to_owned());
        state.puts += 1;
        Ok(())
    }
}

#[derive(Default)]
pub struct MemoryState {
    values: Mutex<Map<String, Value>>,
    fail_set: Mutex<Option<String>>,
}

impl MemoryState {
    /// Initial contents from a JSON object. Anything else gives an empty store.
    pub fn from_json(value: Value) -> Self {
        let values = match value {
            Value::Object(map) => map,
            _ => Map::new(),
        };
        MemoryState {
            values: Mutex::new(values),
            fail_set: Mutex::new(None),
        }
    }

    pub fn value(&self, key: &str) -> Option<Value> {
        self.lock().get(key).cloned()
    }

    /// Fail the next `set` with `message`.
    pub fn fail_next_set(&self, message: &str) {
        *self.fail_set.lock().expect("mutex poisoned") = Some(message.to_owned());
    }

    fn lock(&self) -> std::sync::MutexGuard<'_, Map<String, Value>> {
        self.values.lock().expect("mutex poisoned")
    }
}

#[async_trait::async_trait]
impl StateStore for MemoryState {
    async fn get(&self, keys: &[&str]) -> Result<Map<String, Value>> {
        let values = self.lock();
        Ok(keys
            .iter()
            .filter_map(|&key| values.get(key).map(|v| (key.to_owned(), v.clone())))
            .collect())
    }

    async fn set(&self, entries: Map<String, Value>) -> Result<()> {
        if let Some(message) = self.fail_set.lock().expect("mutex poisoned").take() {
            bail!(message);
        }
        self.lock().extend(entries);
        Ok(())
    }

    async fn keys(&self) -> Result<Vec<String>> {
        Ok(self.lock().keys().cloned().collect())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn bookmark(title: &str) -> BookmarkNode {
        BookmarkNode::Bookmark {
            title: title.to_owned(),
            url: format!("https://{}.example", title),
        }
    }

    #[tokio::test]
    async fn test_tree_create_and_remove() {
        let tree = MemoryTree::new(&[Category::Toolbar]).recording();
        let root = Category::Toolbar.builtin_id();
        let folder = tree
            .create(root, 0, &NodeSpec::Folder { title: "F".into() })
            .await
            .unwrap();
        let inner = tree.create(&folder.id, 5, &bookmark("a").spec()).await.unwrap();
        tree.create(root, 0, &NodeSpec::Separator).await.unwrap();
        assert_eq!(
            tree.category(Category::Toolbar),
            vec![
                BookmarkNode::Separator,
                BookmarkNode::Folder {
                    title: "F".into(),
                    children: vec![bookmark("a")]
                }
            ]
        );
        assert!(tree.create(&inner.id, 0, &NodeSpec::Separator).await.is_err());

        tree.remove_subtree(&folder.id).await.unwrap();
        assert_eq!(tree.category(Category::Toolbar), vec![BookmarkNode::Separator]);
        assert!(tree.remove_subtree(&inner.id).await.is_err());
        assert!(tree.remove_subtree(root).await.is_err());
        assert_eq!(tree.ops().len(), 4);
        assert_eq!(tree.revision(), 4);
    }

    #[tokio::test]
    async fn test_tree_does_not_record_by_default() {
        let tree = MemoryTree::new(&[Category::Toolbar]);
        let root = Category::Toolbar.builtin_id();
        let node = tree.create(root, 0, &bookmark("a").spec()).await.unwrap();
        tree.remove_subtree(&node.id).await.unwrap();
        assert!(tree.ops().is_empty());
        assert_eq!(tree.revision(), 2);
    }

    #[tokio::test]
    async fn test_tree_roots_follow_categories() {
        let tree = MemoryTree::new(&[Category::Menu]);
        let roots = tree.list_roots().await.unwrap();
        assert_eq!(
            roots,
            BTreeMap::from([(Category::Menu, "menu________".to_owned())])
        );
        assert!(tree.get_subtree("toolbar_____").await.is_err());
        assert_eq!(tree.to_snapshot("x", 1).categories.len(), 1);
    }

    #[tokio::test]
    async fn test_tree_from_snapshot() {
        let mut snapshot = Snapshot::new("x", 1);
        snapshot.categories.insert(
            Category::Other,
            vec![BookmarkNode::Folder {
                title: "F".into(),
                children: vec![bookmark("a"), bookmark("b")],
            }],
        );
        let tree = MemoryTree::from_snapshot(&snapshot);
        let back = tree.to_snapshot("x", 1);
        assert_eq!(back.category(Category::Other), snapshot.category(Category::Other));
        assert_eq!(back.category(Category::Toolbar), Some(&[][..]));
        assert!(tree.ops().is_empty());
    }

    #[tokio::test]
    async fn test_remote_failures() {
        let remote = MemoryRemote::default();
        assert_eq!(remote.get("doc", "t").await.unwrap(), RemoteBlob::default());
        remote.fail_next_get("offline");
        assert_eq!(remote.get("doc", "t").await.unwrap_err().to_string(), "offline");
        remote.fail_next_put("read only");
        assert_eq!(remote.put("doc", "t", "{}").await.unwrap_err().to_string(), "read only");
        remote.put("doc", "t", "{}").await.unwrap();
        remote.set_truncated(true);
        let blob = remote.get("doc", "t").await.unwrap();
        assert!(blob.truncated);
        assert_eq!(remote.put_count(), 1);
    }

    #[tokio::test]
    async fn test_state_get_set() {
        let state = MemoryState::default();
        let mut entries = Map::new();
        entries.insert("a".into(), Value::from(1));
        state.set(entries).await.unwrap();
        let got = state.get(&["a", "b"]).await.unwrap();
        assert_eq!(got.len(), 1);
        assert_eq!(state.value("a"), Some(Value::from(1)));
        assert_eq!(state.keys().await.unwrap(), vec!["a".to_owned()]);

        state.fail_next_set("disk full");
        let mut entries = Map::new();
        entries.insert("b".into(), Value::from(2));
        let err = state.set(entries.clone()).await.unwrap_err();
        assert_eq!(err.to_string(), "disk full");
        assert_eq!(state.value("b"), None);
        state.set(entries).await.unwrap();
        assert_eq!(state.value("b"), Some(Value::from(2)));
    }
}
