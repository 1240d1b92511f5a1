//! The remote store: one file in a GitHub gist.

use anyhow::{Context as _, Result};
use marksync_engine::store::{RemoteBlob, RemoteStore};
use serde_json::{json, Value};

pub const DEFAULT_API_BASE: &str = "https://api.github.com";
/// Name of the gist file holding the snapshot.
pub const FILE_NAME: &str = "bookmark.json";

pub struct GistStore {
    client: reqwest::Client,
    api_base: String,
}

impl GistStore {
    pub fn new(api_base: &str) -> Result<Self> {
        let client = reqwest::Client::builder()
            .user_agent(concat!("marksync/", env!("CARGO_PKG_VERSION")))
            .build()
            .context("setting up HTTP client")?;
        Ok(GistStore {
            client,
            api_base: api_base.trim_end_matches('/').to_owned(),
        })
    }

    fn url(&self, document_id: &str) -> String {
        format!("{}/gists/{}", self.api_base, document_id)
    }
}

/// Find the snapshot file in a gist as returned by the gists API.
pub fn gist_blob(gist: &Value) -> RemoteBlob {
    let file = gist.get("files").and_then(|files| files.get(FILE_NAME));
    let truncated = |v: Option<&Value>| {
        v.and_then(|v| v.get("truncated"))
            .and_then(Value::as_bool)
            .unwrap_or(false)
    };
    RemoteBlob {
        content: file
            .and_then(|f| f.get("content"))
            .and_then(Value::as_str)
            .map(str::to_owned),
        truncated: truncated(Some(gist)) || truncated(file),
    }
}

/// Request body replacing the snapshot file's content.
pub fn gist_update(content: &str) -> Value {
    json!({ "files": { FILE_NAME: { "content": content } } })
}

#[async_trait::async_trait]
impl RemoteStore for GistStore {
    async fn get(&self, document_id: &str, token: &str) -> Result<RemoteBlob> {
        let gist: Value = self
            .client
            .get(self.url(document_id))
            .header("Accept", "application/vnd.github+json")
            .header("Authorization", format!("token {}", token))
            .send()
            .await
            .with_context(|| format!("fetching gist {}", document_id))?
            .error_for_status()
            .with_context(|| format!("fetching gist {}", document_id))?
            .json()
            .await
            .with_context(|| format!("reading gist {}", document_id))?;
        Ok(gist_blob(&gist))
    }

    async fn put(&self, document_id: &str, token: &str, content: &str) -> Result<()> {
        self.client
            .patch(self.url(document_id))
            .header("Accept", "application/vnd.github+json")
            .header("Authorization", format!("token {}", token))
            .json(&gist_update(content))
            .send()
            .await
            .with_context(|| format!("updating gist {}", document_id))?
            .error_for_status()
            .with_context(|| format!("updating gist {}", document_id))?;
        Ok(())
    }
}
