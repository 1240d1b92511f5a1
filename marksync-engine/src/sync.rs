//! One sync attempt, start to finish.
//!
//! An attempt loads the stored snapshot (what was last synced) and the remote
//! one, then decides:
//!
//!  - pull when the remote is newer than what was last synced;
//!  - push when this is the first sync (unless configured to only pull), or
//!    the live tree changed since the last capture.
//!
//! Pulling makes the live tree match the remote. Pushing after a pull does
//! not overwrite the remote: the local edits since the last sync are diffed
//! and replayed on top of the remote snapshot. The candidate snapshots are
//! then merged, and the result is written wherever it is newer.

use crate::clock::{Clock, SystemClock};
use crate::error::SyncError;
use crate::log_buffer::{LogBuffer, LogRecord};
use crate::merge::merge_snapshots;
use crate::reconcile::{reconcile_snapshot, ReconcileStats};
use crate::schedule::Scheduler;
use crate::store::{self, Config, RemoteStore, StateStore, SyncMode, RECOVERY_KEY_PREFIX};
use crate::tree::{self, LiveTree};
use marksync_core::bookmark::{nodes_from_value, nodes_to_value};
use marksync_core::patch::{self, DiffOptions, Patch};
use marksync_core::{Category, Snapshot};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;
use tracing::{error, info, info_span, warn, Instrument as _};

#[derive(Debug, Clone)]
pub struct SyncOptions {
    /// Written into every snapshot captured here.
    pub origin_tag: String,
    /// How long a failed attempt holds on to the run flag before returning.
    pub cooldown: Duration,
    /// Delay before the sync that follows a local change or a rejected
    /// concurrent request.
    pub follow_up_delay: Duration,
    /// Interval between scheduled syncs.
    pub alarm_period: Duration,
}

impl Default for SyncOptions {
    fn default() -> Self {
        SyncOptions {
            origin_tag: format!("marksync/{}", env!("CARGO_PKG_VERSION")),
            cooldown: Duration::from_secs(5),
            follow_up_delay: Duration::from_secs(60),
            alarm_period: Duration::from_secs(10 * 60),
        }
    }
}

/// What an attempt did.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SyncReport {
    /// `false` if the attempt was skipped for lack of credentials.
    pub configured: bool,
    pub pulled: bool,
    pub pushed: bool,
    pub stored: bool,
    /// Mutations to the live tree.
    pub changes: ReconcileStats,
    /// Where local changes that could not be replayed were saved.
    pub recovery_key: Option<String>,
}

pub struct Syncer {
    tree: Arc<dyn LiveTree>,
    remote: Arc<dyn RemoteStore>,
    state: Arc<dyn StateStore>,
    scheduler: Arc<dyn Scheduler>,
    clock: Arc<dyn Clock>,
    logs: Arc<LogBuffer>,
    options: SyncOptions,
    running: AtomicBool,
    local_changed: AtomicBool,
    last_error: Mutex<Option<String>>,
}

/// Holds the run flag for the duration of an attempt.
struct RunGuard<'a>(&'a AtomicBool);

impl<'a> RunGuard<'a> {
    fn acquire(flag: &'a AtomicBool) -> Option<Self> {
        flag.compare_exchange(false, true, Ordering::SeqCst, Ordering::SeqCst)
            .ok()
            .map(|_| RunGuard(flag))
    }
}

impl Drop for RunGuard<'_> {
    fn drop(&mut self) {
        self.0.store(false, Ordering::SeqCst);
    }
}

/// Bookkeeping an attempt leaves for its caller.
#[derive(Default)]
struct Attempt {
    /// The attempt cleared the local change flag.
    took_local_change: bool,
}

impl Syncer {
    pub fn new(
        tree: Arc<dyn LiveTree>,
        remote: Arc<dyn RemoteStore>,
        state: Arc<dyn StateStore>,
        scheduler: Arc<dyn Scheduler>,
        options: SyncOptions,
    ) -> Self {
        Syncer {
            tree,
            remote,
            state,
            scheduler,
            clock: Arc::new(SystemClock),
            logs: Arc::new(LogBuffer::default()),
            options,
            running: AtomicBool::new(false),
            // Assume changed on startup
            local_changed: AtomicBool::new(true),
            last_error: Mutex::new(None),
        }
    }

    pub fn with_clock(mut self, clock: Arc<dyn Clock>) -> Self {
        self.clock = clock;
        self
    }

    /// Use `logs` for [`Syncer::logs`]. Something else has to fill it, such
    /// as a tracing layer.
    pub fn with_logs(mut self, logs: Arc<LogBuffer>) -> Self {
        self.logs = logs;
        self
    }

    pub fn options(&self) -> &SyncOptions {
        &self.options
    }

    pub fn state(&self) -> &Arc<dyn StateStore> {
        &self.state
    }

    /// The error of the last attempt, if it failed.
    pub fn last_error(&self) -> Option<String> {
        self.last_error.lock().expect("mutex poisoned").clone()
    }

    pub fn logs(&self) -> Vec<LogRecord> {
        self.logs.records()
    }

    pub fn is_running(&self) -> bool {
        self.running.load(Ordering::SeqCst)
    }

    pub fn local_changed(&self) -> bool {
        self.local_changed.load(Ordering::SeqCst)
    }

    /// The live tree was edited by someone other than this syncer.
    pub async fn on_local_change(&self) -> Result<(), SyncError> {
        let config = Config::load(self.state.as_ref()).await?;
        if !config.is_configured() {
            return Ok(());
        }
        self.local_changed.store(true, Ordering::SeqCst);
        self.scheduler.schedule(self.options.follow_up_delay);
        Ok(())
    }

    /// Credentials or the sync mode changed.
    pub fn on_config_change(&self) {
        self.scheduler.schedule(self.options.follow_up_delay);
    }

    /// Run one attempt. Fails with [`SyncError::ConcurrentSync`] if one is
    /// already running. A rejected or failed attempt schedules a follow-up.
    pub async fn sync(&self) -> Result<SyncReport, SyncError> {
        let Some(_guard) = RunGuard::acquire(&self.running) else {
            warn!("sync is already running, scheduling another");
            self.scheduler.schedule(self.options.follow_up_delay);
            return Err(SyncError::ConcurrentSync);
        };

        let mut attempt = Attempt::default();
        let result = self.run(&mut attempt).instrument(info_span!("sync")).await;
        match result {
            Ok(report) => {
                *self.last_error.lock().expect("mutex poisoned") = None;
                Ok(report)
            }
            Err(e) => {
                if attempt.took_local_change {
                    self.local_changed.store(true, Ordering::SeqCst);
                }
                error!(error = %e, "sync failed");
                *self.last_error.lock().expect("mutex poisoned") = Some(e.to_string());
                self.scheduler.schedule(self.options.follow_up_delay);
                tokio::time::sleep(self.options.cooldown).await;
                Err(e)
            }
        }
    }

    async fn run(&self, attempt: &mut Attempt) -> Result<SyncReport, SyncError> {
        let config = Config::load(self.state.as_ref()).await?;
        let Some((document_id, token)) = config.credentials() else {
            info!("not configured, skipping sync");
            return Ok(SyncReport::default());
        };
        let mut report = SyncReport {
            configured: true,
            ..Default::default()
        };

        let stored = store::load_stored_snapshot(self.state.as_ref())
            .await?
            .map(Arc::new);
        let is_first_sync = stored.is_none();
        let remote = self.fetch_remote(document_id, token).await?.map(Arc::new);

        let should_pull = match (&remote, &stored) {
            (Some(remote), Some(stored)) => remote.last_update > stored.last_update,
            (Some(_), None) => true,
            (None, _) => false,
        };
        let should_push = if is_first_sync {
            config.sync_mode != SyncMode::PullOnly
        } else {
            self.local_changed()
        };
        info!(should_pull, should_push, is_first_sync, "sync start");

        let local = if should_push {
            attempt.took_local_change = self.local_changed.swap(false, Ordering::SeqCst);
            Some(Arc::new(self.capture().await?))
        } else {
            None
        };

        let mut candidates = Vec::new();
        if let (true, Some(remote)) = (should_pull, &remote) {
            report.changes += reconcile_snapshot(self.tree.as_ref(), remote).await?;
            report.pulled = true;
            candidates.extend([stored.clone(), Some(remote.clone())]);
        }

        if let Some(local) = &local {
            match (&remote, should_pull) {
                (Some(remote), true) => {
                    let diffs = diff_categories(stored.as_deref(), local);
                    if !diffs.is_empty() {
                        match self.replay(&diffs, remote).await {
                            Ok((changes, recaptured)) => {
                                report.changes += changes;
                                candidates
                                    .extend([Some(remote.clone()), Some(Arc::new(recaptured))]);
                            }
                            Err(e) if e.is_replay_failure() => {
                                warn!(
                                    error = %e,
                                    "could not replay local changes onto the remote snapshot"
                                );
                                report.recovery_key = self.save_recovery(&diffs).await;
                            }
                            Err(e) => return Err(e),
                        }
                    }
                }
                _ => candidates.extend([stored.clone(), Some(local.clone())]),
            }
        }

        let Some(merged) = merge_snapshots(&candidates) else {
            info!("no changes");
            return Ok(report);
        };

        if remote
            .as_ref()
            .map_or(true, |remote| merged.last_update > remote.last_update)
        {
            let content = serde_json::to_string_pretty(&merged).map_err(anyhow::Error::from)?;
            self.remote.put(document_id, token, &content).await?;
            report.pushed = true;
        }
        if stored
            .as_ref()
            .map_or(true, |stored| merged.last_update > stored.last_update)
        {
            store::save_stored_snapshot(self.state.as_ref(), &merged).await?;
            report.stored = true;
        }

        info!(
            pulled = report.pulled,
            pushed = report.pushed,
            created = report.changes.created,
            removed = report.changes.removed,
            "sync finished"
        );
        Ok(report)
    }

    async fn fetch_remote(
        &self,
        document_id: &str,
        token: &str,
    ) -> Result<Option<Snapshot>, SyncError> {
        let blob = self.remote.get(document_id, token).await?;
        if blob.truncated {
            return Err(SyncError::TruncatedRemote(document_id.to_owned()));
        }
        match blob.content {
            None => Ok(None),
            Some(content) => serde_json::from_str(&content)
                .map(Some)
                .map_err(|source| SyncError::InvalidSnapshot {
                    what: "remote",
                    source,
                }),
        }
    }

    async fn capture(&self) -> Result<Snapshot, SyncError> {
        let snapshot = tree::capture(
            self.tree.as_ref(),
            &self.options.origin_tag,
            self.clock.now_millis(),
        )
        .await?;
        Ok(snapshot)
    }

    /// Apply `diffs` to a copy of `remote`, make the live tree match the
    /// result, and capture it again.
    async fn replay(
        &self,
        diffs: &BTreeMap<Category, Patch>,
        remote: &Snapshot,
    ) -> Result<(ReconcileStats, Snapshot), SyncError> {
        let mut patched = remote.clone();
        for (category, diff) in diffs {
            let base = nodes_to_value(patched.category(*category).unwrap_or_default());
            let value = patch::apply(&base, diff)?;
            let nodes = nodes_from_value(&value).map_err(|source| SyncError::InvalidSnapshot {
                what: "patched",
                source,
            })?;
            patched.categories.insert(*category, nodes);
        }
        let changes = reconcile_snapshot(self.tree.as_ref(), &patched).await?;
        let recaptured = self.capture().await?;
        Ok((changes, recaptured))
    }

    /// Keep local changes that could not be replayed. Failing to do so is
    /// logged and otherwise ignored.
    async fn save_recovery(&self, diffs: &BTreeMap<Category, Patch>) -> Option<String> {
        let key = format!("{}{}", RECOVERY_KEY_PREFIX, self.clock.now_millis());
        let value = match serde_json::to_value(diffs) {
            Ok(value) => value,
            Err(e) => {
                warn!(error = %e, "could not serialize unapplied local changes");
                return None;
            }
        };
        let mut entries = serde_json::Map::new();
        entries.insert(key.clone(), value);
        match self.state.set(entries).await {
            Ok(()) => {
                info!(key, "saved unapplied local changes");
                Some(key)
            }
            Err(e) => {
                warn!(error = %e, "could not save unapplied local changes");
                None
            }
        }
    }
}

/// Per-category diffs from `stored` to `local`, for the categories `local`
/// has. Categories without changes are left out.
fn diff_categories(stored: Option<&Snapshot>, local: &Snapshot) -> BTreeMap<Category, Patch> {
    local
        .categories
        .iter()
        .filter_map(|(category, nodes)| {
            let base = stored
                .and_then(|s| s.category(*category))
                .unwrap_or_default();
            patch::diff(
                &nodes_to_value(base),
                &nodes_to_value(nodes),
                &DiffOptions::default(),
            )
            .map(|diff| (*category, diff))
        })
        .collect()
}
