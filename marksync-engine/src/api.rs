//! Requests a front end can send to a running syncer, one JSON object per
//! message.

use crate::log_buffer::LogRecord;
use crate::sync::{SyncReport, Syncer};
use anyhow::Result;
use serde::{Deserialize, Serialize};

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "action", rename_all = "camelCase")]
pub enum Request {
    Sync,
    GetLogs,
    GetSyncError,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub enum Response {
    Synced(SyncReport),
    Logs(Vec<LogRecord>),
    /// The error of the last attempt, `null` if it succeeded.
    SyncError(Option<String>),
    /// The request itself failed.
    Error(String),
}

impl Syncer {
    pub async fn handle(&self, request: Request) -> Response {
        match request {
            Request::Sync => match self.sync().await {
                Ok(report) => Response::Synced(report),
                Err(e) => Response::Error(e.to_string()),
            },
            Request::GetLogs => Response::Logs(self.logs()),
            Request::GetSyncError => Response::SyncError(self.last_error()),
        }
    }
}

/// Facade for the daemon
pub fn request_from_json(s: &str) -> Result<Request> {
    serde_json::from_str(s).map_err(|e| e.into())
}

/// Facade for the daemon
pub fn response_to_json(r: &Response) -> Result<String> {
    serde_json::to_string(r).map_err(|e| e.into())
}

/// Facade for clients
pub fn request_to_json(r: &Request) -> Result<String> {
    serde_json::to_string(r).map_err(|e| e.into())
}

/// Facade for clients
pub fn response_from_json(s: &str) -> Result<Response> {
    serde_json::from_str(s).map_err(|e| e.into())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::clock::ManualClock;
    use crate::log_buffer::LogBuffer;
    use crate::memory::{MemoryRemote, MemoryState, MemoryTree};
    use crate::schedule::RecordingScheduler;
    use crate::sync::SyncOptions;
    use marksync_core::Category;
    use serde_json::json;
    use std::sync::Arc;
    use std::time::Duration;

    fn syncer(state: serde_json::Value, remote: Arc<MemoryRemote>, logs: Arc<LogBuffer>) -> Syncer {
        let options = SyncOptions {
            cooldown: Duration::ZERO,
            ..Default::default()
        };
        Syncer::new(
            Arc::new(MemoryTree::new(&[Category::Toolbar])),
            remote,
            Arc::new(MemoryState::from_json(state)),
            Arc::new(RecordingScheduler::default()),
            options,
        )
        .with_clock(Arc::new(ManualClock::new(1)))
        .with_logs(logs)
    }

    #[test]
    fn test_request_wire_format() {
        assert_eq!(
            request_from_json(r#"{"action":"getSyncError"}"#).unwrap(),
            Request::GetSyncError
        );
        assert_eq!(request_to_json(&Request::GetLogs).unwrap(), r#"{"action":"getLogs"}"#);
        assert!(request_from_json(r#"{"action":"reboot"}"#).is_err());
    }

    #[test]
    fn test_response_wire_format() {
        let s = response_to_json(&Response::SyncError(None)).unwrap();
        assert_eq!(s, r#"{"syncError":null}"#);
        let r = response_from_json(r#"{"error":"boom"}"#).unwrap();
        assert_eq!(r, Response::Error("boom".to_owned()));
    }

    #[tokio::test]
    async fn test_handle_sync_and_error() {
        let remote = Arc::new(MemoryRemote::default());
        let logs = Arc::new(LogBuffer::default());
        let syncer = syncer(json!({"token": "t", "documentId": "d"}), remote.clone(), logs);

        let response = syncer.handle(Request::Sync).await;
        let Response::Synced(report) = response else {
            panic!("unexpected response {:?}", response);
        };
        assert!(report.pushed);
        assert_eq!(syncer.handle(Request::GetSyncError).await, Response::SyncError(None));

        remote.fail_next_get("offline");
        assert_eq!(
            syncer.handle(Request::Sync).await,
            Response::Error("offline".to_owned())
        );
        assert_eq!(
            syncer.handle(Request::GetSyncError).await,
            Response::SyncError(Some("offline".to_owned()))
        );
    }

    #[tokio::test]
    async fn test_handle_get_logs() {
        let logs = Arc::new(LogBuffer::default());
        logs.push(LogRecord {
            timestamp: 5,
            level: "INFO".to_owned(),
            message: "hello".to_owned(),
        });
        let syncer = syncer(json!({}), Arc::new(MemoryRemote::default()), logs);
        let Response::Logs(records) = syncer.handle(Request::GetLogs).await else {
            panic!("expected logs");
        };
        assert_eq!(records.len(), 1);
        assert_eq!(records[0].message, "hello");
    }
}
