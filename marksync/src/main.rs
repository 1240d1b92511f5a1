mod application;
mod bookmarks_file;
mod gist;
mod interrupt;
mod logging;
mod serve;
mod state_file;

use anyhow::{bail, Result};
use application::{handle_result, runtime, App};
use clap::{ColorChoice, CommandFactory as _, Parser, Subcommand};
use marksync_engine::log_buffer::LogBuffer;
use marksync_engine::schedule::{AlarmScheduler, RecordingScheduler};
use marksync_engine::store::{self, Config, StateStore as _, SyncMode};
use marksync_engine::SyncOptions;
use serde_json::{Map, Value};
use std::io::IsTerminal as _;
use std::path::PathBuf;
use std::sync::Arc;

fn main() {
    let args = Args::parse();
    handle_result(run_args(args));
}

fn run_args(args: Args) -> Result<()> {
    match &args.command {
        Commands::Sync => with_logging(&args.options, |logs| {
            runtime().block_on(sync(&args.options, logs))
        }),
        Commands::Serve => with_logging(&args.options, |logs| {
            let interrupt_state = interrupt::set_up_process_interrupt_handler();
            runtime().block_on(serve(&args.options, &interrupt_state, logs))
        }),
        Commands::Config(sub) => runtime().block_on(config(&args.options, sub)),
        Commands::Status => runtime().block_on(status(&args.options)),
        Commands::GenerateMan => (|| {
            let cmd = Args::command();
            let man = clap_mangen::Man::new(cmd);
            let mut buffer: Vec<u8> = Default::default();
            man.render(&mut buffer)?;
            println!("{}", String::from_utf8(buffer)?);
            Ok(())
        })(),
        Commands::GenerateMarkdown => {
            let opts = clap_markdown::MarkdownOptions::new().show_footer(false);
            let markdown: String = clap_markdown::help_markdown_custom::<Args>(&opts);
            println!("{}", markdown);
            Ok(())
        }
        Commands::GenerateCompletion { shell } => {
            let mut cmd = Args::command();
            clap_complete::generate(*shell, &mut cmd, "marksync", &mut std::io::stdout());
            Ok(())
        }
    }
}

fn with_logging<T>(options: &Options, f: impl FnOnce(Arc<LogBuffer>) -> Result<T>) -> Result<T> {
    let color = match options.color {
        ColorChoice::Always => true,
        ColorChoice::Never => false,
        ColorChoice::Auto => std::io::stderr().is_terminal(),
    };
    let logs = Arc::new(LogBuffer::default());
    logging::set_up(
        &logging::Options {
            verbose: options.verbose,
            color,
        },
        logs.clone(),
    )?;
    f(logs)
}

async fn sync(options: &Options, logs: Arc<LogBuffer>) -> Result<()> {
    // Nothing runs later in a one-off sync
    let app = App::open(options, Arc::new(RecordingScheduler::default()), logs)?;
    let result = app.syncer.sync().await;
    app.save_tree()?;
    let report = result?;
    if !report.configured {
        bail!("not configured; set a token and a document id with `marksync config set`");
    }
    println!("{}", serde_json::to_string_pretty(&report)?);
    Ok(())
}

async fn serve(
    options: &Options,
    interrupt_state: &interrupt::InterruptState,
    logs: Arc<LogBuffer>,
) -> Result<()> {
    let sync_options = SyncOptions::default();
    let alarm = Arc::new(AlarmScheduler::new(
        sync_options.alarm_period,
        sync_options.follow_up_delay,
    ));
    let app = App::open(options, alarm.clone(), logs)?;
    let stdin = tokio::io::BufReader::new(tokio::io::stdin());
    serve::serve(&app, &alarm, interrupt_state, stdin, tokio::io::stdout()).await
}

async fn config(options: &Options, command: &ConfigCommand) -> Result<()> {
    let state = application::open_state(options)?;
    match command {
        ConfigCommand::Set {
            token,
            document_id,
            sync_mode,
        } => {
            let mut entries = Map::new();
            if let Some(token) = token {
                entries.insert(store::TOKEN_KEY.to_owned(), Value::from(token.as_str()));
            }
            if let Some(document_id) = document_id {
                entries.insert(
                    store::DOCUMENT_ID_KEY.to_owned(),
                    Value::from(document_id.as_str()),
                );
            }
            if let Some(sync_mode) = sync_mode {
                entries.insert(store::SYNC_MODE_KEY.to_owned(), serde_json::to_value(sync_mode)?);
            }
            if entries.is_empty() {
                bail!("nothing to set; pass --token, --document-id or --sync-mode");
            }
            state.set(entries).await?;
            Ok(())
        }
        ConfigCommand::Show => {
            let config = Config::load(state.as_ref()).await?;
            println!("state file:  {}", state.path().display());
            println!("token:       {}", mask(config.token.as_deref()));
            println!("document id: {}", config.document_id.as_deref().unwrap_or("(unset)"));
            println!("sync mode:   {}", config.sync_mode);
            Ok(())
        }
    }
}

fn mask(token: Option<&str>) -> String {
    match token {
        None => "(unset)".to_owned(),
        Some(token) if token.chars().count() <= 4 => "****".to_owned(),
        Some(token) => {
            let tail: String = token.chars().skip(token.chars().count() - 4).collect();
            format!("****{}", tail)
        }
    }
}

async fn status(options: &Options) -> Result<()> {
    let state = application::open_state(options)?;
    let config = Config::load(state.as_ref()).await?;
    println!("configured:    {}", config.is_configured());
    match store::load_stored_snapshot(state.as_ref()).await? {
        Some(stored) => {
            let when = chrono::DateTime::<chrono::Utc>::from_timestamp_millis(stored.last_update)
                .map(|t| t.to_rfc3339())
                .unwrap_or_else(|| stored.last_update.to_string());
            println!("last synced:   {} (by {})", when, stored.origin_tag);
        }
        None => println!("last synced:   never"),
    }
    println!("state events:  {}", state.event_count()?);
    let keys = store::recovery_keys(state.as_ref()).await?;
    if keys.is_empty() {
        println!("unapplied local changes: none");
    } else {
        println!("unapplied local changes:");
        for key in keys {
            println!("  {}", key);
        }
    }
    Ok(())
}

/// marksync: keep bookmarks in sync through a GitHub gist
#[derive(Parser, Debug)]
#[command(author, version, about, long_about = None)]
struct Args {
    #[command(subcommand)]
    command: Commands,

    #[command(flatten)]
    options: Options,
}

#[derive(Parser, Debug, Clone)]
pub struct Options {
    #[arg(short, long, global = true, default_value = "false")]
    pub verbose: bool,

    #[arg(long, global = true, default_value_t = ColorChoice::Auto)]
    pub color: ColorChoice,

    /// The state file [default: <data dir>/marksync/state.json]
    #[arg(long, global = true)]
    pub state: Option<PathBuf>,

    /// The bookmarks file to keep in sync [default: <data dir>/marksync/bookmarks.json]
    #[arg(long, global = true)]
    pub bookmarks: Option<PathBuf>,

    /// Base URL of the GitHub API
    #[arg(long, global = true, hide = true)]
    pub api_base: Option<String>,
}

#[derive(Subcommand, Debug)]
enum ConfigCommand {
    /// Change the sync settings
    Set {
        /// GitHub token with access to the gist
        #[arg(long)]
        token: Option<String>,

        /// Id of the gist holding the bookmarks
        #[arg(long)]
        document_id: Option<String>,

        /// What the first sync does with an existing remote snapshot
        #[arg(long, value_parser = parse_sync_mode)]
        sync_mode: Option<SyncMode>,
    },
    /// Print the sync settings
    Show,
}

fn parse_sync_mode(s: &str) -> Result<SyncMode, String> {
    serde_json::from_value(Value::from(s)).map_err(|_| {
        format!(
            "unknown sync mode '{}', expected '{}' or '{}'",
            s,
            SyncMode::Merge,
            SyncMode::PullOnly
        )
    })
}

#[derive(Subcommand, Debug)]
enum Commands {
    /// Run one sync now
    Sync,

    /// Keep syncing on a schedule, answering requests on stdin
    Serve,

    /// Show or change the sync settings
    #[command(subcommand)]
    Config(ConfigCommand),

    /// Show the sync state
    Status,

    /// Generate markdown documentation for marksync
    #[command(hide = true)]
    GenerateMarkdown,

    /// Generate a manpage for marksync
    #[command(hide = true)]
    GenerateMan,

    /// Generate shell completion for marksync
    #[command(hide = true)]
    GenerateCompletion {
        /// The shell to generate completion for
        #[arg(long)]
        shell: clap_complete::Shell,
    },
}
