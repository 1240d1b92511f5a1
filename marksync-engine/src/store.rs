//! Remote document storage and local key-value state.

use crate::error::SyncError;
use anyhow::Result;
use marksync_core::Snapshot;
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};

pub const TOKEN_KEY: &str = "token";
pub const DOCUMENT_ID_KEY: &str = "documentId";
pub const SYNC_MODE_KEY: &str = "syncMode";
pub const STORED_SNAPSHOT_KEY: &str = "storedSnapshot";
/// Prefix of keys holding local changes that could not be replayed.
pub const RECOVERY_KEY_PREFIX: &str = "wip-";

/// What the remote store returned for a document.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct RemoteBlob {
    /// `None` when the document holds no snapshot yet.
    pub content: Option<String>,
    /// The store cut the content off. It must not be parsed.
    pub truncated: bool,
}

#[async_trait::async_trait]
pub trait RemoteStore: Send + Sync {
    async fn get(&self, document_id: &str, token: &str) -> Result<RemoteBlob>;
    async fn put(&self, document_id: &str, token: &str, content: &str) -> Result<()>;
}

#[async_trait::async_trait]
pub trait StateStore: Send + Sync {
    /// Values of the `keys` that are present.
    async fn get(&self, keys: &[&str]) -> Result<Map<String, Value>>;
    /// Insert or replace every entry.
    async fn set(&self, entries: Map<String, Value>) -> Result<()>;
    async fn keys(&self) -> Result<Vec<String>>;
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub enum SyncMode {
    #[default]
    Merge,
    /// On the first sync, only download.
    PullOnly,
}

impl std::fmt::Display for SyncMode {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            SyncMode::Merge => f.write_str("merge"),
            SyncMode::PullOnly => f.write_str("pullOnly"),
        }
    }
}

#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct Config {
    pub token: Option<String>,
    pub document_id: Option<String>,
    pub sync_mode: SyncMode,
}

impl Config {
    pub async fn load(state: &dyn StateStore) -> Result<Config> {
        let mut values = state
            .get(&[TOKEN_KEY, DOCUMENT_ID_KEY, SYNC_MODE_KEY])
            .await?;
        let sync_mode = match values.remove(SYNC_MODE_KEY) {
            Some(Value::Null) | None => SyncMode::default(),
            Some(mode) => serde_json::from_value(mode)?,
        };
        Ok(Config {
            token: non_empty_string(values.remove(TOKEN_KEY)),
            document_id: non_empty_string(values.remove(DOCUMENT_ID_KEY)),
            sync_mode,
        })
    }

    /// `(document_id, token)`, if both are set.
    pub fn credentials(&self) -> Option<(&str, &str)> {
        Some((self.document_id.as_deref()?, self.token.as_deref()?))
    }

    pub fn is_configured(&self) -> bool {
        self.credentials().is_some()
    }
}

fn non_empty_string(value: Option<Value>) -> Option<String> {
    match value {
        Some(Value::String(s)) if !s.is_empty() => Some(s),
        _ => None,
    }
}

pub async fn load_stored_snapshot(state: &dyn StateStore) -> Result<Option<Snapshot>, SyncError> {
    let mut values = state.get(&[STORED_SNAPSHOT_KEY]).await?;
    match values.remove(STORED_SNAPSHOT_KEY) {
        None | Some(Value::Null) => Ok(None),
        Some(value) => serde_json::from_value(value)
            .map(Some)
            .map_err(|source| SyncError::InvalidSnapshot {
                what: "stored",
                source,
            }),
    }
}

pub async fn save_stored_snapshot(state: &dyn StateStore, snapshot: &Snapshot) -> Result<()> {
    let mut entries = Map::new();
    entries.insert(STORED_SNAPSHOT_KEY.to_owned(), serde_json::to_value(snapshot)?);
    state.set(entries).await
}

/// Keys of saved local changes that could not be replayed, oldest first.
pub async fn recovery_keys(state: &dyn StateStore) -> Result<Vec<String>> {
    let mut keys: Vec<String> = state
        .keys()
        .await?
        .into_iter()
        .filter(|k| k.starts_with(RECOVERY_KEY_PREFIX))
        .collect();
    keys.sort_by_key(|k| {
        k[RECOVERY_KEY_PREFIX.len()..]
            .parse::<i64>()
            .unwrap_or(i64::MAX)
    });
    Ok(keys)
}
