use std::io::Write;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;

use anyhow::{bail, Context, Result};
use clap::{Args, Parser, Subcommand};
use tracing::{error, info};
use tracing_subscriber::EnvFilter;

use setl_classify::{BatchClassifier, GeminiClient, GeminiConfig, RetryTuning};
use setl_core::{Glossary, Taxonomy};
use setl_pipeline::{progress_report, EnrichmentPipeline, IngestPipeline, DEFAULT_BATCH_SIZE};
use setl_state::{AbortOnCorrupt, ProgressStore, RecoveryStrategy};
use setl_store::SaisineStore;

#[derive(Debug, Parser)]
#[command(name = "setl")]
#[command(about = "Saisine enrichment, triage and loading")]
struct Cli {
    #[command(subcommand)]
    command: Commands,
}

#[derive(Debug, Subcommand)]
enum Commands {
    /// Classify pending records and append them to the enrichment artifact.
    Enrich(EnrichArgs),
    /// Normalize enriched artifacts into the parquet store.
    Ingest(IngestArgs),
    /// Report enrichment progress without touching anything.
    Status(StatusArgs),
}

#[derive(Debug, Args)]
struct EnrichArgs {
    /// Input JSON file or directory of .json/.jsonl/.ndjson files.
    #[arg(long)]
    input: PathBuf,
    /// Enrichment artifact, created when missing.
    #[arg(long)]
    artifact: PathBuf,
    /// Records per classification request.
    #[arg(long, default_value_t = DEFAULT_BATCH_SIZE)]
    batch_size: usize,
    /// Availability retries before the run aborts.
    #[arg(long, default_value_t = 3)]
    max_retries: usize,
    /// Base backoff delay in seconds for availability retries.
    #[arg(long, default_value_t = 10)]
    base_delay_secs: u64,
    /// Model name; defaults to SETL_MODEL or the built-in default.
    #[arg(long)]
    model: Option<String>,
    /// File holding the API key; defaults to the GEMINI_API_KEY env var.
    #[arg(long)]
    api_key_file: Option<PathBuf>,
    /// YAML taxonomy replacing the built-in one.
    #[arg(long)]
    taxonomy: Option<PathBuf>,
    /// YAML acronym glossary.
    #[arg(long)]
    glossary: Option<PathBuf>,
    /// Never prompt: resume existing artifacts, abort on corrupt ones.
    #[arg(long)]
    yes: bool,
}

#[derive(Debug, Args)]
struct IngestArgs {
    /// Input JSON file or directory of enriched artifacts.
    #[arg(long)]
    input: PathBuf,
    /// Store directory holding the parquet relations and manifest.
    #[arg(long)]
    store: PathBuf,
    /// YAML taxonomy replacing the built-in one.
    #[arg(long)]
    taxonomy: Option<PathBuf>,
}

#[derive(Debug, Args)]
struct StatusArgs {
    /// Input JSON file or directory.
    #[arg(long)]
    input: PathBuf,
    /// Enrichment artifact to inspect.
    #[arg(long)]
    artifact: PathBuf,
}

fn init_tracing() {
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info"));
    let _ = tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_writer(std::io::stderr)
        .try_init();
}

#[tokio::main]
async fn main() {
    init_tracing();
    let cli = Cli::parse();
    if let Err(err) = run(cli).await {
        error!("run aborted: {err:#}");
        std::process::exit(1);
    }
}

async fn run(cli: Cli) -> Result<()> {
    match cli.command {
        Commands::Enrich(args) => enrich(args).await,
        Commands::Ingest(args) => ingest(args).await,
        Commands::Status(args) => status(args).await,
    }
}

async fn enrich(args: EnrichArgs) -> Result<()> {
    let api_key = load_api_key(args.api_key_file.as_deref())?;
    let taxonomy = load_taxonomy(args.taxonomy.as_deref())?;
    let glossary = load_glossary(args.glossary.as_deref())?;

    let mut config = GeminiConfig::new(api_key);
    if let Some(model) = args.model.or_else(|| std::env::var("SETL_MODEL").ok()) {
        config.model = model;
    }
    let tuning = RetryTuning {
        max_availability_retries: args.max_retries,
        availability_base_delay: Duration::from_secs(args.base_delay_secs),
        ..RetryTuning::default()
    };
    info!(
        model = %config.model,
        batch_size = args.batch_size,
        "starting enrichment"
    );

    let client = GeminiClient::new(config, taxonomy.clone(), glossary)?;
    let progress = ProgressStore::new(&args.artifact);
    if !args.yes {
        offer_reset(&progress).await?;
    }
    let recovery: &dyn RecoveryStrategy = if args.yes { &AbortOnCorrupt } else { &PromptRecovery };

    let pipeline = EnrichmentPipeline::new(
        BatchClassifier::new(Arc::new(client), tuning),
        progress,
        taxonomy,
        args.batch_size,
    );
    let summary = pipeline.run(&args.input, recovery).await?;
    println!(
        "enrichment complete: run_id={} input={} skipped={} processed={} batches={}",
        summary.run_id,
        summary.input_count,
        summary.skipped_count,
        summary.processed_count,
        summary.batches
    );
    Ok(())
}

async fn ingest(args: IngestArgs) -> Result<()> {
    let taxonomy = load_taxonomy(args.taxonomy.as_deref())?;
    let pipeline = IngestPipeline::new(SaisineStore::new(&args.store), taxonomy);
    let summary = pipeline.run(&args.input).await?;
    println!(
        "ingestion complete: run_id={} rows_in={} skipped={} main={} keywords={} deduped={}",
        summary.run_id,
        summary.rows_in,
        summary.rows_skipped,
        summary.main_rows,
        summary.keyword_rows,
        summary.deduped
    );
    Ok(())
}

async fn status(args: StatusArgs) -> Result<()> {
    let report = progress_report(&args.input, &ProgressStore::new(&args.artifact)).await?;
    println!("input records    : {}", report.input_records);
    println!("enriched records : {}", report.enriched_records);
    println!("done             : {}", report.done_count);
    println!("pending          : {}", report.pending_count);
    println!("progress         : {:.2}%", report.percent_done);
    if let Some(last) = report.last_id {
        println!("last enriched id : {last}");
    }
    if let Some(first) = report.first_pending_id {
        println!("first pending id : {first}");
    }
    Ok(())
}

fn load_api_key(path: Option<&Path>) -> Result<String> {
    let key = match path {
        Some(path) => std::fs::read_to_string(path)
            .with_context(|| format!("reading API key file {}", path.display()))?,
        None => std::env::var("GEMINI_API_KEY")
            .context("GEMINI_API_KEY is not set and no --api-key-file was given")?,
    };
    let key = key.trim().to_string();
    if key.is_empty() {
        bail!("the API key is empty");
    }
    Ok(key)
}

fn load_taxonomy(path: Option<&Path>) -> Result<Taxonomy> {
    match path {
        Some(path) => {
            let taxonomy = Taxonomy::from_yaml_file(path)?;
            info!(
                path = %path.display(),
                labels = taxonomy.labels.len(),
                "loaded taxonomy override"
            );
            Ok(taxonomy)
        }
        None => Ok(Taxonomy::builtin()),
    }
}

fn load_glossary(path: Option<&Path>) -> Result<Glossary> {
    match path {
        Some(path) => {
            let glossary = Glossary::from_yaml_file(path)?;
            info!(
                path = %path.display(),
                acronyms = glossary.definitions.len(),
                "loaded glossary"
            );
            Ok(glossary)
        }
        None => Ok(Glossary::default()),
    }
}

/// When a non-empty, well-formed artifact already exists, asks the operator
/// whether to resume or to back it up and restart from scratch. Anything but
/// an explicit overwrite resumes.
async fn offer_reset(progress: &ProgressStore) -> Result<()> {
    let existing = match tokio::fs::read_to_string(progress.path()).await {
        Ok(raw) => raw,
        Err(_) => return Ok(()),
    };
    if existing.trim().is_empty() {
        return Ok(());
    }
    // A malformed artifact is handled by the recovery prompt at load time.
    let Ok(records) = serde_json::from_str::<Vec<serde_json::Value>>(&existing) else {
        return Ok(());
    };
    if records.is_empty() {
        return Ok(());
    }

    println!(
        "Un fichier de sortie existe déjà : {} plaintes déjà enrichies.",
        records.len()
    );
    let choice = ask("Que veux-tu faire ? [R]eprendre là où ça s'est arrêté / [E]craser et recommencer : ");
    if matches!(choice.as_deref(), Some("e") | Some("ecraser") | Some("écraser")) {
        if let Some(backup) = progress.reset().await? {
            println!("Ancien fichier sauvegardé : {}", backup.display());
        }
    } else {
        println!("Reprise : les plaintes déjà enrichies seront ignorées.");
    }
    Ok(())
}

/// Asks the operator whether a corrupt artifact should move to `.bak` so the
/// run can restart empty. Declining aborts the run.
struct PromptRecovery;

impl RecoveryStrategy for PromptRecovery {
    fn backup_and_restart(&self, path: &Path, reason: &str) -> bool {
        println!("Le fichier {} est corrompu : {reason}", path.display());
        loop {
            let choice =
                ask("Sauvegarder en .bak et repartir d'un fichier propre ? [O]ui / [N]on : ");
            match choice.as_deref() {
                Some("o") | Some("oui") => return true,
                Some("n") | Some("non") => return false,
                Some(_) => println!("Réponse invalide. Réponds par O ou N."),
                None => return false,
            }
        }
    }
}

/// One trimmed, lowercased line from stdin; `None` when stdin is closed.
fn ask(question: &str) -> Option<String> {
    print!("{question}");
    std::io::stdout().flush().ok()?;
    let mut line = String::new();
    match std::io::stdin().read_line(&mut line) {
        Ok(0) | Err(_) => None,
        Ok(_) => Some(line.trim().to_lowercase()),
    }
}
