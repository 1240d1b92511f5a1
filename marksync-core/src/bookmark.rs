//! Bookmark trees and the snapshot wire format.

use crate::value::Value;
use serde::de::Error as _;
use serde::ser::SerializeMap;
use serde::{Deserialize, Serialize, Serializer};
use std::collections::BTreeMap;
use std::fmt;
use std::str::FromStr;

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "lowercase")]
pub enum BookmarkNode {
    Bookmark {
        #[serde(default)]
        title: String,
        url: String,
    },
    Folder {
        #[serde(default)]
        title: String,
        #[serde(default)]
        children: Vec<BookmarkNode>,
    },
    Separator,
}

/// A node without its children: what a live tree needs to create it, and
/// what two nodes are compared by when reconciling.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum NodeSpec {
    Bookmark { title: String, url: String },
    Folder { title: String },
    Separator,
}

impl BookmarkNode {
    pub fn spec(&self) -> NodeSpec {
        match self {
            BookmarkNode::Bookmark { title, url } => NodeSpec::Bookmark {
                title: title.clone(),
                url: url.clone(),
            },
            BookmarkNode::Folder { title, .. } => NodeSpec::Folder {
                title: title.clone(),
            },
            BookmarkNode::Separator => NodeSpec::Separator,
        }
    }

    /// Children of a folder, `None` for other nodes.
    pub fn children(&self) -> Option<&[BookmarkNode]> {
        match self {
            BookmarkNode::Folder { children, .. } => Some(children),
            _ => None,
        }
    }

    pub fn is_same(&self, other: &BookmarkNode) -> bool {
        self.spec() == other.spec()
    }
}

impl NodeSpec {
    pub fn is_folder(&self) -> bool {
        matches!(self, NodeSpec::Folder { .. })
    }
}

/// A synchronized root location.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Category {
    Toolbar,
    Other,
    Mobile,
    Menu,
}

impl Category {
    pub const ALL: [Category; 4] = [
        Category::Toolbar,
        Category::Other,
        Category::Mobile,
        Category::Menu,
    ];

    pub fn as_str(self) -> &'static str {
        match self {
            Category::Toolbar => "toolbar",
            Category::Other => "other",
            Category::Mobile => "mobile",
            Category::Menu => "menu",
        }
    }

    /// The stable id of the root folder for this category, in the Firefox
    /// scheme.
    pub fn builtin_id(self) -> &'static str {
        match self {
            Category::Toolbar => "toolbar_____",
            Category::Other => "unfiled_____",
            Category::Mobile => "mobile______",
            Category::Menu => "menu________",
        }
    }
}

impl fmt::Display for Category {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for Category {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Category::ALL
            .into_iter()
            .find(|c| c.as_str() == s)
            .ok_or_else(|| format!("unknown bookmark category: {}", s))
    }
}

/// A timestamped capture of every synchronized category.
#[derive(Debug, Clone, PartialEq, Eq, Default, Deserialize)]
#[serde(try_from = "RawSnapshot")]
pub struct Snapshot {
    pub origin_tag: String,
    /// Milliseconds since the epoch.
    pub last_update: i64,
    pub categories: BTreeMap<Category, Vec<BookmarkNode>>,
}

#[derive(Deserialize)]
#[serde(rename_all = "camelCase")]
struct RawSnapshot {
    #[serde(default, alias = "userAgent")]
    origin_tag: String,
    last_update: i64,
    #[serde(flatten)]
    rest: BTreeMap<String, serde_json::Value>,
}

impl TryFrom<RawSnapshot> for Snapshot {
    type Error = serde_json::Error;

    fn try_from(raw: RawSnapshot) -> Result<Self, Self::Error> {
        let mut categories = BTreeMap::new();
        for (key, value) in raw.rest {
            // Unknown keys belong to other writers
            let Ok(category) = key.parse::<Category>() else {
                continue;
            };
            let nodes: Vec<BookmarkNode> = serde_json::from_value(value)
                .map_err(|e| serde_json::Error::custom(format!("category {}: {}", key, e)))?;
            categories.insert(category, nodes);
        }
        Ok(Snapshot {
            origin_tag: raw.origin_tag,
            last_update: raw.last_update,
            categories,
        })
    }
}

impl Serialize for Snapshot {
    fn serialize<S: Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        let mut map = serializer.serialize_map(Some(2 + self.categories.len()))?;
        map.serialize_entry("originTag", &self.origin_tag)?;
        map.serialize_entry("lastUpdate", &self.last_update)?;
        for (category, nodes) in &self.categories {
            map.serialize_entry(category.as_str(), nodes)?;
        }
        map.end()
    }
}

impl Snapshot {
    pub fn new(origin_tag: impl Into<String>, last_update: i64) -> Self {
        Snapshot {
            origin_tag: origin_tag.into(),
            last_update,
            categories: BTreeMap::new(),
        }
    }

    pub fn category(&self, category: Category) -> Option<&[BookmarkNode]> {
        self.categories.get(&category).map(Vec::as_slice)
    }
}

/// Bookmarks are diffed as whole units; folders are broken up so their
/// children can be diffed individually.
pub fn is_bookmark_leaf(value: &Value) -> bool {
    value
        .as_object()
        .is_some_and(|m| m.contains_key("url") && !m.contains_key("children"))
}

pub fn nodes_to_value(nodes: &[BookmarkNode]) -> Value {
    // Serializing plain data into a JSON tree cannot fail
    Value::from(serde_json::to_value(nodes).unwrap_or_default())
}

pub fn nodes_from_value(value: &Value) -> Result<Vec<BookmarkNode>, serde_json::Error> {
    match value {
        Value::Undefined => Ok(Vec::new()),
        value => serde_json::from_value(value.to_json()),
    }
}
