//! A live bookmark tree backed by a JSON file in snapshot format.
//!
//! The file is loaded into a [`MemoryTree`]. Changes made through
//! [`LiveTree`] are written back by [`FileTree::save_if_changed`]. Edits made
//! to the file by someone else are picked up by
//! [`FileTree::reload_if_changed`].

use anyhow::{Context as _, Result};
use marksync_core::{Category, NodeSpec, Snapshot};
use marksync_engine::memory::MemoryTree;
use marksync_engine::tree::{LiveNode, LiveTree, NodeId};
use std::collections::BTreeMap;
use std::path::{Path, PathBuf};
use std::sync::Mutex;
use std::time::SystemTime;
use tracing::{debug, info};

pub struct FileTree {
    path: PathBuf,
    tree: MemoryTree,
    seen: Mutex<Seen>,
}

/// What the file and tree looked like when they were last in agreement.
struct Seen {
    revision: u64,
    modified: Option<SystemTime>,
}

impl FileTree {
    /// Load `path`, or start with empty categories if it does not exist.
    pub fn open<P: AsRef<Path>>(path: P) -> Result<FileTree> {
        let path = path.as_ref().to_owned();
        let tree = MemoryTree::new(&Category::ALL);
        let modified = match read_snapshot(&path)? {
            Some((snapshot, modified)) => {
                tree.load(&snapshot);
                modified
            }
            None => None,
        };
        let seen = Seen {
            revision: tree.revision(),
            modified,
        };
        Ok(FileTree {
            path,
            tree,
            seen: Mutex::new(seen),
        })
    }

    /// Write the tree to the file if it was changed through [`LiveTree`]
    /// since it was loaded or last saved.
    pub fn save_if_changed(&self, origin_tag: &str, now: i64) -> Result<bool> {
        let mut seen = self.seen.lock().expect("mutex poisoned");
        let revision = self.tree.revision();
        if revision == seen.revision {
            return Ok(false);
        }
        let snapshot = self.tree.to_snapshot(origin_tag, now);
        if let Some(parent) = self.path.parent() {
            std::fs::create_dir_all(parent)
                .with_context(|| format!("creating directory {}", parent.display()))?;
        }
        let content = serde_json::to_string_pretty(&snapshot)?;
        std::fs::write(&self.path, content)
            .with_context(|| format!("writing bookmarks file {}", self.path.display()))?;
        seen.revision = revision;
        seen.modified = modified(&self.path)?;
        info!(path = %self.path.display(), "saved bookmarks");
        Ok(true)
    }

    /// Load the file again if it was modified since it was last read or
    /// written here. Returns whether it was.
    pub fn reload_if_changed(&self) -> Result<bool> {
        let mut seen = self.seen.lock().expect("mutex poisoned");
        if modified(&self.path)? == seen.modified {
            return Ok(false);
        }
        let Some((snapshot, modified)) = read_snapshot(&self.path)? else {
            // Deleted; keep what we have
            seen.modified = None;
            return Ok(false);
        };
        self.tree.load(&snapshot);
        seen.revision = self.tree.revision();
        seen.modified = modified;
        debug!(path = %self.path.display(), "bookmarks file changed");
        Ok(true)
    }
}

fn modified(path: &Path) -> Result<Option<SystemTime>> {
    match std::fs::metadata(path) {
        Ok(metadata) => Ok(Some(metadata.modified()?)),
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(None),
        Err(e) => Err(e).with_context(|| format!("reading metadata of {}", path.display())),
    }
}

fn read_snapshot(path: &Path) -> Result<Option<(Snapshot, Option<SystemTime>)>> {
    let content = match std::fs::read_to_string(path) {
        Ok(content) => content,
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(None),
        Err(e) => {
            return Err(e).with_context(|| format!("reading bookmarks file {}", path.display()))
        }
    };
    let snapshot = serde_json::from_str(&content)
        .with_context(|| format!("parsing bookmarks file {}", path.display()))?;
    Ok(Some((snapshot, modified(path)?)))
}

#[async_trait::async_trait]
impl LiveTree for FileTree {
    async fn list_roots(&self) -> Result<BTreeMap<Category, NodeId>> {
        self.tree.list_roots().await
    }

    async fn get_subtree(&self, id: &str) -> Result<Vec<LiveNode>> {
        self.tree.get_subtree(id).await
    }

    async fn create(&self, parent: &str, index: usize, spec: &NodeSpec) -> Result<LiveNode> {
        self.tree.create(parent, index, spec).await
    }

    async fn remove_subtree(&self, id: &str) -> Result<()> {
        self.tree.remove_subtree(id).await
    }
}
