use std::path::{Path, PathBuf};
use std::process::ExitCode;
use std::sync::Arc;
use std::time::Duration;

use anyhow::Context;
use clap::{Parser, Subcommand};
use indicatif::{ProgressBar, ProgressStyle};

use codewell::chunker::ChunkerOptions;
use codewell::config::{Config, ProviderConfig};
use codewell::errors::IndexError;
use codewell::events::{ProgressEvent, ProgressSink};
use codewell::fallback::FallbackCoordinator;
use codewell::indexer::{self, IndexRunOptions};
use codewell::pipeline::PipelineOptions;
use codewell::provider::{EmbedProvider, LocalProvider, RemoteProvider, RemoteProviderConfig};
use codewell::query::{self, QueryOptions};
use codewell::store::Store;
use codewell::walker::WalkOptions;
use codewell::writer::WriterOptions;

#[derive(Debug, Parser)]
#[command(name = "codewell", version, about = "Per-repository semantic code index and retrieval engine")]
struct Cli {
    #[command(subcommand)]
    cmd: Command,

    /// Emit full error chains and debug-level tracing instead of the single-line summary.
    #[arg(long, global = true)]
    verbose: bool,
}

#[derive(Debug, Subcommand)]
enum Command {
    /// Walk the repository, classify changes, embed, and write the index.
    Index {
        /// Repository root to index (defaults to the current directory).
        path: Option<PathBuf>,
        #[arg(long)]
        concurrency: Option<usize>,
        #[arg(long = "batch-size")]
        batch_size: Option<usize>,
        /// Provider name to try first (falls through the configured chain on failure).
        #[arg(long)]
        provider: Option<String>,
        /// Re-embed every file, ignoring the stored file-hash catalog.
        #[arg(long)]
        force: bool,
    },
    /// Embed `text` and return the top-k nearest chunks.
    Query {
        text: String,
        #[arg(long, default_value_t = 8)]
        k: usize,
        /// `repo` (the repository at --path/cwd), `all` (every indexed repository), or `set:<name>`.
        #[arg(long, default_value = "repo")]
        scope: String,
        #[arg(long)]
        path: Option<PathBuf>,
    },
    /// Inspect or edit the persisted configuration.
    Config {
        #[command(subcommand)]
        action: ConfigAction,
    },
    /// Compact a repository's store and report its health.
    Doctor {
        path: Option<PathBuf>,
    },
    /// Manage named sets of repository roots for `query --scope set:<name>`.
    Sources {
        #[command(subcommand)]
        action: SourcesAction,
    },
}

#[derive(Debug, Subcommand)]
enum ConfigAction {
    /// Print the whole config, or a single dotted key.
    Get { key: Option<String> },
    /// Set a single dotted key to a value.
    Set { key: String, value: String },
    /// Add or update a provider entry.
    Provider {
        name: String,
        #[arg(long = "type")]
        kind: Option<String>,
        #[arg(long)]
        model: Option<String>,
        #[arg(long)]
        base_url: Option<String>,
        #[arg(long)]
        api_key: Option<String>,
        #[arg(long)]
        dimension: Option<usize>,
    },
    /// Restore the default configuration.
    Reset,
}

#[derive(Debug, Subcommand)]
enum SourcesAction {
    Add { name: String, paths: Vec<PathBuf> },
    Remove { name: String },
    List,
}

fn main() -> ExitCode {
    let cli = Cli::parse();
    init_tracing(cli.verbose);

    let result = match cli.cmd {
        Command::Index { path, concurrency, batch_size, provider, force } => {
            cmd_index(path, concurrency, batch_size, provider, force)
        }
        Command::Query { text, k, scope, path } => cmd_query(text, k, scope, path),
        Command::Config { action } => cmd_config(action),
        Command::Doctor { path } => cmd_doctor(path),
        Command::Sources { action } => cmd_sources(action),
    };

    match result {
        Ok(()) => ExitCode::SUCCESS,
        Err(e) => {
            if let Some(index_err) = e.downcast_ref::<IndexError>() {
                eprintln!("error: {index_err}");
                for suggestion in index_err.remediation() {
                    eprintln!("  - {suggestion}");
                }
                ExitCode::from(index_err.exit_code())
            } else {
                if cli.verbose {
                    eprintln!("error: {e:?}");
                } else {
                    eprintln!("error: {e}");
                }
                ExitCode::from(1)
            }
        }
    }
}

fn init_tracing(verbose: bool) {
    use tracing_subscriber::EnvFilter;
    let default_level = if verbose { "debug" } else { "info" };
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(default_level));
    let _ = tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_writer(std::io::stderr)
        .try_init();
}

/// Builds the fallback ordering `[override_or_default, ...remaining configured providers]`,
/// constructing each adapter per its configured `type`.
fn build_providers(config: &Config, override_provider: Option<&str>) -> anyhow::Result<Vec<Arc<dyn EmbedProvider>>> {
    let mut order: Vec<String> = Vec::new();
    if let Some(p) = override_provider {
        order.push(p.to_string());
    }
    if !order.contains(&config.default_provider) {
        order.push(config.default_provider.clone());
    }
    let mut remaining: Vec<String> = config.providers.keys().cloned().collect();
    remaining.sort();
    for name in remaining {
        if !order.contains(&name) {
            order.push(name);
        }
    }

    let mut providers: Vec<Arc<dyn EmbedProvider>> = Vec::new();
    for name in order {
        let Some(pc) = config.providers.get(&name) else {
            continue;
        };
        providers.push(build_provider(&name, pc)?);
    }
    if providers.is_empty() {
        anyhow::bail!("no usable embedding providers configured; run `config provider <name>` first");
    }
    Ok(providers)
}

fn build_provider(name: &str, pc: &ProviderConfig) -> anyhow::Result<Arc<dyn EmbedProvider>> {
    match pc.kind.as_str() {
        "local" => {
            let provider = LocalProvider::load(name, &pc.model)
                .with_context(|| format!("loading local provider \"{name}\" (model {})", pc.model))?;
            Ok(Arc::new(provider))
        }
        "remote" | "http" => {
            let base_url = pc
                .base_url
                .clone()
                .ok_or_else(|| anyhow::anyhow!("provider \"{name}\" is type \"{}\" but has no base_url configured", pc.kind))?;
            Ok(Arc::new(RemoteProvider::new(RemoteProviderConfig {
                provider_id: name.to_string(),
                base_url,
                api_key: pc.api_key.clone(),
                model: pc.model.clone(),
                dimension: pc.dimension,
                max_batch_size: 64,
                max_tokens_per_request: 8192,
                requests_per_minute: pc.rate_limit.requests_per_minute,
                request_timeout: Duration::from_secs(60),
            })))
        }
        other => anyhow::bail!("unknown provider type \"{other}\" for provider \"{name}\""),
    }
}

struct CliProgressSink {
    bar: ProgressBar,
}

impl ProgressSink for CliProgressSink {
    fn on_event(&self, event: ProgressEvent) {
        match event {
            ProgressEvent::Started { total_candidates } => {
                self.bar.set_message(format!("discovered {total_candidates} candidate files"));
            }
            ProgressEvent::FileScanned { relative_path } => {
                self.bar.set_message(format!("chunking {relative_path}"));
            }
            ProgressEvent::BatchDispatched { chunk_count, provider_id } => {
                self.bar.set_message(format!("embedded {chunk_count} chunks via {provider_id}"));
            }
            ProgressEvent::Retrying { provider_id, attempt } => {
                self.bar.set_message(format!("retrying {provider_id} (attempt {attempt})"));
            }
            ProgressEvent::FallbackUsed { from, to } => {
                self.bar.set_message(format!("falling back from {from} to {to}"));
            }
            ProgressEvent::Completed { files_processed, chunks_written, elapsed_ms } => {
                self.bar
                    .set_message(format!("{files_processed} files, {chunks_written} chunks, {elapsed_ms}ms"));
            }
            ProgressEvent::Error { message } => {
                self.bar.set_message(format!("error: {message}"));
            }
        }
    }
}

fn spinner() -> ProgressBar {
    let bar = ProgressBar::new_spinner();
    bar.set_style(
        ProgressStyle::with_template("{spinner} {msg}")
            .unwrap()
            .tick_strings(&["⠋", "⠙", "⠹", "⠸", "⠼", "⠴", "⠦", "⠧", "⠇", "⠏"]),
    );
    bar.enable_steady_tick(Duration::from_millis(80));
    bar
}

fn cmd_index(
    path: Option<PathBuf>,
    concurrency: Option<usize>,
    batch_size: Option<usize>,
    provider: Option<String>,
    force: bool,
) -> anyhow::Result<()> {
    let config = Config::load();
    let root = indexer::repository_root_or_cwd(path.as_deref()).context("resolving repository root")?;
    let base_dir = Store::base_dir()?;
    let mut store = Store::open_for_write(&root, &base_dir)?;

    let providers = build_providers(&config, provider.as_deref())?;
    let coordinator = Arc::new(FallbackCoordinator::new(providers));

    let bar = spinner();
    let sink: Arc<dyn ProgressSink> = Arc::new(CliProgressSink { bar: bar.clone() });

    let options = IndexRunOptions {
        walk: WalkOptions {
            root: root.clone(),
            max_file_bytes: config.indexing.max_file_size_bytes,
            exclude_patterns: config.indexing.exclude_patterns.clone(),
        },
        chunker: ChunkerOptions::default(),
        pipeline: PipelineOptions {
            concurrency: concurrency.unwrap_or(config.performance.concurrency),
            initial_batch_size: batch_size.unwrap_or(config.performance.batch_size),
            memory_limit_bytes: config.performance.memory_limit_mb * 1024 * 1024,
            ..Default::default()
        },
        writer: WriterOptions::default(),
        force,
    };

    let rt = tokio::runtime::Runtime::new()?;
    let report = rt.block_on(indexer::run_index(&mut store, coordinator, options, sink))?;
    bar.finish_and_clear();

    println!(
        "{}",
        serde_json::to_string_pretty(&serde_json::json!({
            "repository_id": store.metadata.repository_id,
            "added": report.added,
            "modified": report.modified,
            "deleted": report.deleted,
            "unchanged": report.unchanged,
            "skipped": report.skipped,
            "chunks_written": report.chunks_written,
            "elapsed_ms": report.elapsed_ms,
        }))?
    );
    Ok(())
}

fn resolve_scope(config: &Config, scope: &str, path: Option<&Path>, base_dir: &Path) -> anyhow::Result<Vec<PathBuf>> {
    if scope == "repo" {
        let root = indexer::repository_root_or_cwd(path).context("resolving repository root")?;
        Ok(vec![root])
    } else if scope == "all" {
        Ok(Store::list_repositories(base_dir)?)
    } else if let Some(name) = scope.strip_prefix("set:") {
        config
            .sources
            .get(name)
            .cloned()
            .ok_or_else(|| anyhow::anyhow!("unknown source set \"{name}\" (see `sources list`)"))
    } else {
        anyhow::bail!("invalid --scope \"{scope}\": expected repo, all, or set:<name>")
    }
}

fn cmd_query(text: String, k: usize, scope: String, path: Option<PathBuf>) -> anyhow::Result<()> {
    let config = Config::load();
    let base_dir = Store::base_dir()?;
    let roots = resolve_scope(&config, &scope, path.as_deref(), &base_dir)?;
    if roots.is_empty() {
        anyhow::bail!("no repositories in scope \"{scope}\"");
    }

    let mut stores = Vec::new();
    for root in roots {
        match Store::open_for_read(&root, &base_dir) {
            Ok(s) => stores.push(s),
            Err(e) => eprintln!("warning: skipping {}: {e}", root.display()),
        }
    }

    let providers = build_providers(&config, None)?;
    let coordinator = FallbackCoordinator::new(providers);

    let rt = tokio::runtime::Runtime::new()?;
    let results = rt.block_on(query::query(&stores, &text, &coordinator, QueryOptions { k, min_score: 0.0 }))?;

    let json: Vec<_> = results
        .iter()
        .map(|r| {
            serde_json::json!({
                "chunk_id": r.chunk_id,
                "score": r.score,
                "relative_path": r.relative_path,
                "line_range": [r.line_range.0, r.line_range.1],
                "text": r.text,
            })
        })
        .collect();
    println!("{}", serde_json::to_string_pretty(&json)?);
    Ok(())
}

fn get_config_field(config: &Config, key: &str) -> anyhow::Result<String> {
    Ok(match key {
        "default_provider" => config.default_provider.clone(),
        "performance.concurrency" => config.performance.concurrency.to_string(),
        "performance.batch_size" => config.performance.batch_size.to_string(),
        "performance.memory_limit_mb" => config.performance.memory_limit_mb.to_string(),
        "performance.adaptive_batching" => config.performance.adaptive_batching.to_string(),
        "indexing.max_file_size_bytes" => config.indexing.max_file_size_bytes.to_string(),
        other => anyhow::bail!("unknown config key \"{other}\""),
    })
}

fn set_config_field(config: &mut Config, key: &str, value: &str) -> anyhow::Result<()> {
    match key {
        "default_provider" => config.default_provider = value.to_string(),
        "performance.concurrency" => config.performance.concurrency = value.parse().context("expected an integer")?,
        "performance.batch_size" => config.performance.batch_size = value.parse().context("expected an integer")?,
        "performance.memory_limit_mb" => {
            config.performance.memory_limit_mb = value.parse().context("expected an integer")?
        }
        "performance.adaptive_batching" => {
            config.performance.adaptive_batching = value.parse().context("expected true or false")?
        }
        "indexing.max_file_size_bytes" => {
            config.indexing.max_file_size_bytes = value.parse().context("expected an integer")?
        }
        other => anyhow::bail!("unknown config key \"{other}\""),
    }
    Ok(())
}

fn cmd_config(action: ConfigAction) -> anyhow::Result<()> {
    match action {
        ConfigAction::Get { key } => {
            let config = Config::load();
            match key {
                None => println!("{}", serde_json::to_string_pretty(&config)?),
                Some(k) => println!("{}", get_config_field(&config, &k)?),
            }
        }
        ConfigAction::Set { key, value } => {
            let mut config = Config::load();
            set_config_field(&mut config, &key, &value)?;
            config.save().context("saving config")?;
            println!("set {key} = {value}");
        }
        ConfigAction::Provider { name, kind, model, base_url, api_key, dimension } => {
            let mut config = Config::load();
            let entry = config.providers.entry(name.clone()).or_insert_with(ProviderConfig::default);
            if let Some(kind) = kind {
                entry.kind = kind;
            }
            if let Some(model) = model {
                entry.model = model;
            }
            if let Some(base_url) = base_url {
                entry.base_url = Some(base_url);
            }
            if let Some(api_key) = api_key {
                entry.api_key = Some(api_key);
            }
            if let Some(dimension) = dimension {
                entry.dimension = dimension;
            }
            config.save().context("saving config")?;
            println!("updated provider \"{name}\"");
        }
        ConfigAction::Reset => {
            Config::default().save().context("saving config")?;
            println!("configuration reset to defaults");
        }
    }
    Ok(())
}

fn cmd_doctor(path: Option<PathBuf>) -> anyhow::Result<()> {
    let root = indexer::repository_root_or_cwd(path.as_deref()).context("resolving repository root")?;
    let base_dir = Store::base_dir()?;
    let mut store = Store::open_for_write(&root, &base_dir)?;
    store.compact()?;
    store.save_metadata()?;

    println!(
        "{}",
        serde_json::to_string_pretty(&serde_json::json!({
            "repository_id": store.metadata.repository_id,
            "root_path": store.metadata.root_path,
            "total_chunks": store.metadata.total_chunks,
            "provider_id": store.metadata.provider_id,
            "model_id": store.metadata.model_id,
            "dimension": store.metadata.dimension,
            "last_indexed_at": store.metadata.last_indexed_at,
            "last_cleanup_at": store.metadata.last_cleanup_at,
            "schema_version": store.metadata.schema_version,
        }))?
    );
    Ok(())
}

fn cmd_sources(action: SourcesAction) -> anyhow::Result<()> {
    match action {
        SourcesAction::Add { name, paths } => {
            let mut config = Config::load();
            let resolved: Vec<PathBuf> = paths
                .iter()
                .map(|p| std::fs::canonicalize(p).unwrap_or_else(|_| p.clone()))
                .collect();
            config.sources.entry(name.clone()).or_default().extend(resolved);
            config.save().context("saving config")?;
            println!("added to source set \"{name}\"");
        }
        SourcesAction::Remove { name } => {
            let mut config = Config::load();
            config.sources.remove(&name);
            config.save().context("saving config")?;
            println!("removed source set \"{name}\"");
        }
        SourcesAction::List => {
            let config = Config::load();
            println!("{}", serde_json::to_string_pretty(&config.sources)?);
        }
    }
    Ok(())
}
