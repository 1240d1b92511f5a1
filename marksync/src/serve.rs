//! The long running mode: scheduled syncs, plus requests on stdin.

use crate::application::App;
use crate::interrupt::InterruptState;
use anyhow::Result;
use marksync_engine::api::{request_from_json, response_to_json, Response};
use marksync_engine::schedule::AlarmScheduler;
use marksync_engine::store::Config;
use std::time::Duration;
use tokio::io::{AsyncBufRead, AsyncBufReadExt as _, AsyncWrite, AsyncWriteExt as _};
use tokio::time::MissedTickBehavior;
use tracing::{debug, info, warn};

/// How often the bookmarks file and the config are checked for changes.
const POLL_INTERVAL: Duration = Duration::from_secs(5);

/// Serve until interrupted or until `input` ends.
///
/// Every line of `input` is a request; every request gets one line of
/// response on `output`.
pub async fn serve<R, W>(
    app: &App,
    alarm: &AlarmScheduler,
    interrupt: &InterruptState,
    input: R,
    mut output: W,
) -> Result<()>
where
    R: AsyncBufRead + Unpin,
    W: AsyncWrite + Unpin,
{
    let mut lines = input.lines();
    let mut config = Config::load(app.state.as_ref()).await?;
    let mut poll = tokio::time::interval(POLL_INTERVAL);
    poll.set_missed_tick_behavior(MissedTickBehavior::Skip);

    info!(configured = config.is_configured(), "serving");
    loop {
        tokio::select! {
            _ = interrupt.interrupted() => {
                info!("interrupted, stopping");
                break;
            }
            _ = alarm.tick() => {
                // A failure is logged and kept for getSyncError
                let _ = app.syncer.sync().await;
                save_tree(app);
            }
            line = lines.next_line() => {
                let Some(line) = line? else {
                    debug!("input closed, stopping");
                    break;
                };
                if line.trim().is_empty() {
                    continue;
                }
                let response = match request_from_json(&line) {
                    Ok(request) => {
                        let response = app.syncer.handle(request).await;
                        save_tree(app);
                        response
                    }
                    Err(e) => Response::Error(format!("invalid request: {}", e)),
                };
                let s = response_to_json(&response)?;
                output.write_all(s.as_bytes()).await?;
                output.write_all(b"\n").await?;
                output.flush().await?;
            }
            _ = poll.tick() => {
                poll_changes(app, &mut config).await;
            }
        }
    }
    Ok(())
}

/// Pick up edits to the bookmarks file and the config. Failures are logged
/// and checked again on the next poll.
async fn poll_changes(app: &App, config: &mut Config) {
    match app.tree.reload_if_changed() {
        Ok(true) => {
            if let Err(e) = app.syncer.on_local_change().await {
                warn!(error = %e, "could not record the local change");
            }
        }
        Ok(false) => {}
        Err(e) => warn!(error = %e, "could not check the bookmarks file"),
    }
    match Config::load(app.state.as_ref()).await {
        Ok(current) if current != *config => {
            *config = current;
            app.syncer.on_config_change();
        }
        Ok(_) => {}
        Err(e) => warn!(error = %e, "could not read the config"),
    }
}

fn save_tree(app: &App) {
    if let Err(e) = app.save_tree() {
        warn!(error = %e, "could not save the bookmarks file");
    }
}
