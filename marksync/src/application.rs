use crate::bookmarks_file::FileTree;
use crate::gist::{GistStore, DEFAULT_API_BASE};
use crate::state_file::FileState;
use crate::Options;
use anyhow::{Context as _, Result};
use marksync_engine::log_buffer::LogBuffer;
use marksync_engine::schedule::Scheduler;
use marksync_engine::{SyncOptions, Syncer};
use std::path::PathBuf;
use std::process::exit;
use std::sync::Arc;

/// Create the single-threaded tokio runtime used by the CLI.
///
/// Panics if the runtime cannot be created.
pub fn runtime() -> tokio::runtime::Runtime {
    tokio::runtime::Builder::new_current_thread()
        .enable_all()
        .build()
        .expect("failed to initialize tokio runtime")
}

/// Handle a Result, printing the error and exiting with code 1 on failure.
pub fn handle_result(r: Result<()>) {
    match r {
        Ok(()) => {}
        Err(e) => {
            eprintln!("marksync error: {:?}", e);
            exit(1);
        }
    }
}

fn data_file(explicit: &Option<PathBuf>, name: &str) -> Result<PathBuf> {
    match explicit {
        Some(path) => Ok(path.clone()),
        None => Ok(dirs::data_dir()
            .context("could not determine the data directory; pass the file path explicitly")?
            .join("marksync")
            .join(name)),
    }
}

pub fn open_state(options: &Options) -> Result<Arc<FileState>> {
    let path = data_file(&options.state, "state.json")?;
    Ok(Arc::new(FileState::open(path)?))
}

pub fn open_tree(options: &Options) -> Result<Arc<FileTree>> {
    let path = data_file(&options.bookmarks, "bookmarks.json")?;
    Ok(Arc::new(FileTree::open(path)?))
}

/// Everything a sync needs, wired together.
pub struct App {
    pub syncer: Syncer,
    pub tree: Arc<FileTree>,
    pub state: Arc<FileState>,
}

impl App {
    pub fn open(
        options: &Options,
        scheduler: Arc<dyn Scheduler>,
        logs: Arc<LogBuffer>,
    ) -> Result<App> {
        let state = open_state(options)?;
        let tree = open_tree(options)?;
        let api_base = options.api_base.as_deref().unwrap_or(DEFAULT_API_BASE);
        let remote = Arc::new(GistStore::new(api_base)?);
        let syncer = Syncer::new(
            tree.clone(),
            remote,
            state.clone(),
            scheduler,
            SyncOptions::default(),
        )
        .with_logs(logs);
        Ok(App { syncer, tree, state })
    }

    /// Write the bookmarks file back if a sync changed the tree.
    pub fn save_tree(&self) -> Result<()> {
        self.tree.save_if_changed(
            &self.syncer.options().origin_tag,
            chrono::Utc::now().timestamp_millis(),
        )?;
        Ok(())
    }
}
