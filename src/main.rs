use anyhow::{Context, Result};
use clap::{Parser, Subcommand, ValueEnum};
use ember::config::{load_config, Config};
use ember::embed::{select_embedder, ModelSpec};
use ember::error::EmberError;
use ember::indexer::{IndexRequest, Indexer, ProgressEvent, ProgressSink, SyncMode};
use ember::searcher::{Query, SearchHit, Searcher};
use ember::service::{probe_health, run_server, stop_server, ServerOptions};
use ember::storage::Store;
use ember::vcs::GitProbe;
use ember::workspace::{Workspace, EMBER_DIR};
use indicatif::{ProgressBar, ProgressStyle};
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;
use tracing_subscriber::EnvFilter;

#[derive(Debug, Parser)]
#[command(name = "ember")]
#[command(version)]
#[command(about = "Local, git-aware hybrid code search")]
struct Cli {
    #[command(subcommand)]
    cmd: Command,
}

#[derive(Debug, Clone, Copy, ValueEnum)]
enum ModeArg {
    Worktree,
    Staged,
    Rev,
}

#[derive(Debug, Subcommand)]
enum Command {
    /// Create .ember/ for the current repository
    Init,

    /// Synchronize the index with the source tree
    Index {
        /// What to index: the working tree, the staged index, or a revision
        #[arg(long, value_enum, default_value = "worktree")]
        mode: ModeArg,

        /// Revision to index when --mode rev (e.g. HEAD, a branch, a sha)
        #[arg(long, default_value = "HEAD")]
        rev: String,

        /// Rebuild everything, discarding incremental state
        #[arg(long)]
        force_reindex: bool,

        /// Restrict the run to paths matching these globs
        #[arg(long = "filter", value_name = "GLOB")]
        filters: Vec<String>,
    },

    /// Run a hybrid query against the index
    Search {
        query: String,

        /// Max results
        #[arg(long, short = 'k')]
        topk: Option<usize>,

        /// Only chunks whose path matches this glob
        #[arg(long)]
        path: Option<String>,

        /// Only chunks with this language tag (e.g. rs, py, ts)
        #[arg(long)]
        lang: Option<String>,

        /// Emit JSON lines instead of the human listing
        #[arg(long)]
        json: bool,
    },

    /// Print one chunk by id (full hash, a unique prefix, or a rank from
    /// the last search)
    Show { id: String },

    /// Manage the long-lived embedding service
    #[command(subcommand)]
    Embedder(EmbedderCmd),

    /// Internal: embedding service entry point (spawned, not typed)
    #[command(hide = true)]
    EmbedServer {
        #[arg(long)]
        root: PathBuf,
        #[arg(long)]
        model: String,
        #[arg(long, default_value_t = 900)]
        idle_secs: u64,
    },
}

#[derive(Debug, Subcommand)]
enum EmbedderCmd {
    /// Is the service up, and what model does it hold
    Status,
    /// Stop the service
    Stop,
}

fn main() {
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_env("EMBER_LOG").unwrap_or_else(|_| EnvFilter::new("warn")),
        )
        .with_writer(std::io::stderr)
        .init();

    let cli = Cli::parse();
    if let Err(e) = run(cli) {
        eprintln!("error: {e:#}");
        let code = match e.downcast_ref::<EmberError>() {
            Some(err) if err.is_user_error() => 2,
            _ => 1,
        };
        std::process::exit(code);
    }
}

/// Walk up from cwd until a directory containing `.ember/` appears,
/// stopping at the VCS boundary. The engine itself only takes the answer.
fn discover_root() -> Result<PathBuf> {
    let cwd = std::env::current_dir().context("failed to get current dir")?;
    let mut dir = cwd.as_path();
    loop {
        if dir.join(EMBER_DIR).is_dir() {
            return Ok(dir.to_path_buf());
        }
        let at_vcs_boundary = dir.join(".git").exists();
        match dir.parent() {
            Some(parent) if !at_vcs_boundary => dir = parent,
            _ => return Ok(cwd),
        }
    }
}

struct Engine {
    ws: Workspace,
    cfg: Config,
    store: Arc<Store>,
}

fn open_engine() -> Result<Engine> {
    let root = discover_root()?;
    let ws = Workspace::open(&root)?;
    let cfg = load_config(&ws.config_path())?;
    let store = Arc::new(Store::open(&ws.db_path())?);
    Ok(Engine { ws, cfg, store })
}

fn run(cli: Cli) -> Result<()> {
    match cli.cmd {
        Command::Init => {
            let root = std::env::current_dir().context("failed to get current dir")?;
            let ws = Workspace::init(&root)?;
            if !ws.config_path().exists() {
                let default = toml::to_string_pretty(&Config::default())?;
                std::fs::write(ws.config_path(), default)?;
            }
            println!("initialized {}", ws.ember_dir().display());
            Ok(())
        }

        Command::Index {
            mode,
            rev,
            force_reindex,
            filters,
        } => {
            let engine = open_engine()?;
            let vcs = GitProbe::new(engine.ws.root());
            let embedder = select_embedder(&engine.cfg, &engine.ws)?;

            let mode = match mode {
                ModeArg::Worktree => SyncMode::Worktree,
                ModeArg::Staged => SyncMode::Staged,
                ModeArg::Rev => SyncMode::Rev(rev),
            };
            let req = IndexRequest {
                mode,
                force_reindex,
                path_filters: filters,
            };

            let progress = SpinnerProgress::new();
            let indexer = Indexer::new(
                &engine.ws,
                &engine.cfg,
                &engine.store,
                &vcs,
                embedder.as_ref(),
            );
            let resp = indexer.index(&req, &progress)?;
            progress.finish();

            println!(
                "indexed {} file(s) ({} failed): +{} ~{} -{} chunks{} [tree {}]",
                resp.files_indexed,
                resp.files_failed,
                resp.chunks_created,
                resp.chunks_updated,
                resp.chunks_deleted,
                if resp.incremental { ", incremental" } else { "" },
                &resp.tree_sha[..12.min(resp.tree_sha.len())],
            );
            Ok(())
        }

        Command::Search {
            query,
            topk,
            path,
            lang,
            json,
        } => {
            let engine = open_engine()?;
            let embedder = select_embedder(&engine.cfg, &engine.ws)?;
            let searcher = Searcher::new(Arc::clone(&engine.store), Arc::from(embedder));

            let results = searcher.search(&Query {
                text: query,
                topk: topk.unwrap_or(engine.cfg.search.default_topk),
                path_filter: path,
                lang_filter: lang,
            })?;

            let hits: Vec<SearchHit> = results.iter().map(SearchHit::from).collect();

            // Cache for `ember show <rank>`; opaque to the engine.
            let _ = std::fs::write(
                engine.ws.ember_dir().join(".last_search"),
                serde_json::to_vec(&hits)?,
            );

            if json {
                for hit in &hits {
                    println!("{}", serde_json::to_string(hit)?);
                }
            } else if hits.is_empty() {
                println!("no results");
            } else {
                for hit in &hits {
                    let symbol = if hit.symbol.is_empty() {
                        String::new()
                    } else {
                        format!("  {}", hit.symbol)
                    };
                    println!(
                        "{:>2}. {}:{}-{}{}  ({:.4})  {}",
                        hit.rank,
                        hit.path,
                        hit.start_line,
                        hit.end_line,
                        symbol,
                        hit.score,
                        &hit.content_hash[..12],
                    );
                }
            }
            Ok(())
        }

        Command::Show { id } => {
            let engine = open_engine()?;

            // A small integer is a rank into the last search.
            let hash = if id.len() < 8 && id.chars().all(|c| c.is_ascii_digit()) {
                let rank: usize = id.parse().unwrap_or(0);
                let cached = std::fs::read(engine.ws.ember_dir().join(".last_search"))
                    .ok()
                    .and_then(|raw| serde_json::from_slice::<Vec<SearchHit>>(&raw).ok())
                    .unwrap_or_default();
                cached
                    .into_iter()
                    .find(|h| h.rank == rank)
                    .map(|h| h.content_hash)
                    .ok_or_else(|| EmberError::InvalidQuery {
                        reason: format!("no result #{id} in the last search"),
                    })?
            } else {
                engine.store.resolve_hash_prefix(&id)?
            };

            let chunk = engine
                .store
                .get_chunk(&hash)?
                .ok_or_else(|| EmberError::InvalidQuery {
                    reason: format!("chunk {hash} is gone; reindex and retry"),
                })?;
            println!(
                "# {}:{}-{} {}\n{}",
                chunk.path, chunk.start_line, chunk.end_line, chunk.symbol, chunk.content
            );
            Ok(())
        }

        Command::Embedder(cmd) => {
            let engine = open_engine()?;
            match cmd {
                EmbedderCmd::Status => match probe_health(&engine.ws.socket_path()) {
                    Some(h) => {
                        println!(
                            "running: model {} (dim {}, fingerprint {}), pid {}",
                            h.model, h.dim, h.fingerprint, h.pid
                        );
                    }
                    None => println!("not running"),
                },
                EmbedderCmd::Stop => {
                    stop_server(&engine.ws.socket_path(), &engine.ws.pid_path())?;
                    println!("stopped");
                }
            }
            Ok(())
        }

        Command::EmbedServer {
            root,
            model,
            idle_secs,
        } => {
            let ws = Workspace::at(&root);
            let spec = ModelSpec::lookup(&model)?;
            let embedder = ember::embed::LocalEmbedder::new(spec);
            run_server(
                &embedder,
                &ServerOptions {
                    socket_path: ws.socket_path(),
                    pid_path: ws.pid_path(),
                    idle_timeout: Duration::from_secs(idle_secs),
                },
            )?;
            Ok(())
        }
    }
}

/// Progress rendering for index runs: one spinner whose message tracks the
/// pipeline phase.
struct SpinnerProgress {
    bar: ProgressBar,
}

impl SpinnerProgress {
    fn new() -> Self {
        let bar = ProgressBar::new_spinner();
        bar.set_style(
            ProgressStyle::with_template("{spinner} {msg}")
                .unwrap()
                .tick_strings(&["⠋", "⠙", "⠹", "⠸", "⠼", "⠴", "⠦", "⠧", "⠇", "⠏"]),
        );
        bar.enable_steady_tick(Duration::from_millis(80));
        Self { bar }
    }

    fn finish(&self) {
        self.bar.finish_and_clear();
    }
}

impl ProgressSink for SpinnerProgress {
    fn event(&self, event: ProgressEvent<'_>) {
        match event {
            ProgressEvent::Scanning => self.bar.set_message("scanning tree..."),
            ProgressEvent::LoadingModel => self.bar.set_message("loading embedding model..."),
            ProgressEvent::FileIndexed { path, done, total } => {
                self.bar.set_message(format!("[{done}/{total}] {path}"));
            }
            ProgressEvent::Deleting { paths } => {
                self.bar.set_message(format!("removing {paths} deleted path(s)..."));
            }
        }
    }
}
