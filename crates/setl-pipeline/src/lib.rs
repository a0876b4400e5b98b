//! Run orchestration: the enrichment loop, the ingestion pass and the
//! progress report behind the `status` subcommand.

use std::collections::HashSet;
use std::path::{Path, PathBuf};

use anyhow::{bail, Context, Result};
use chrono::{DateTime, Utc};
use serde::Serialize;
use serde_json::Value;
use tokio::fs;
use tracing::{info, warn};
use uuid::Uuid;

use setl_classify::BatchClassifier;
use setl_core::{Classification, EnrichedRecord, RawRecord, Taxonomy, CLASSIFICATION_FIELDS};
use setl_normalize::{canonical_key, normalize_record, resolve_id};
use setl_state::{AbortOnCorrupt, ProgressStore, RecoveryStrategy};
use setl_store::SaisineStore;

pub const CRATE_NAME: &str = "setl-pipeline";

/// Records sent to the classifier per request.
pub const DEFAULT_BATCH_SIZE: usize = 10;

/// Collects raw records from a single JSON file or a directory scanned
/// non-recursively for `.json`/`.jsonl`/`.ndjson` files in name order.
pub async fn collect_records(input: &Path) -> Result<Vec<RawRecord>> {
    let meta = fs::metadata(input)
        .await
        .with_context(|| format!("reading {}", input.display()))?;
    let files = if meta.is_dir() {
        let files = list_input_files(input).await?;
        if files.is_empty() {
            warn!(dir = %input.display(), "no .json/.jsonl/.ndjson files found");
        }
        files
    } else {
        vec![input.to_path_buf()]
    };

    let mut records = Vec::new();
    for path in &files {
        info!(file = %path.display(), "reading input");
        records.extend(read_records_file(path).await?);
    }
    Ok(records)
}

async fn list_input_files(dir: &Path) -> Result<Vec<PathBuf>> {
    let mut entries = fs::read_dir(dir)
        .await
        .with_context(|| format!("listing {}", dir.display()))?;
    let mut files = Vec::new();
    while let Some(entry) = entries
        .next_entry()
        .await
        .with_context(|| format!("listing {}", dir.display()))?
    {
        let path = entry.path();
        let is_file = entry
            .file_type()
            .await
            .map(|kind| kind.is_file())
            .unwrap_or(false);
        if !is_file {
            continue;
        }
        let ext = path
            .extension()
            .and_then(|ext| ext.to_str())
            .map(str::to_ascii_lowercase);
        if matches!(ext.as_deref(), Some("json" | "jsonl" | "ndjson")) {
            files.push(path);
        }
    }
    files.sort();
    Ok(files)
}

async fn read_records_file(path: &Path) -> Result<Vec<RawRecord>> {
    let text = fs::read_to_string(path)
        .await
        .with_context(|| format!("reading {}", path.display()))?;
    let ext = path
        .extension()
        .and_then(|ext| ext.to_str())
        .map(str::to_ascii_lowercase);
    if matches!(ext.as_deref(), Some("jsonl" | "ndjson")) {
        return Ok(read_delimited(path, &text));
    }

    let root: Value =
        serde_json::from_str(&text).with_context(|| format!("parsing {}", path.display()))?;
    match root {
        Value::Array(items) => {
            let mut records = Vec::with_capacity(items.len());
            for (position, item) in items.into_iter().enumerate() {
                match item {
                    Value::Object(map) => records.push(map),
                    other => warn!(
                        file = %path.display(),
                        position = position + 1,
                        kind = json_kind(&other),
                        "array entry is not an object, skipped"
                    ),
                }
            }
            Ok(records)
        }
        Value::Object(map) => Ok(vec![map]),
        other => bail!(
            "{}: expected a JSON array or object at the root, found {}",
            path.display(),
            json_kind(&other)
        ),
    }
}

/// One record per line; bad lines are logged and skipped so a single typo
/// does not lose the rest of the file.
fn read_delimited(path: &Path, text: &str) -> Vec<RawRecord> {
    let mut records = Vec::new();
    for (index, line) in text.lines().enumerate() {
        let line = line.trim();
        if line.is_empty() {
            continue;
        }
        match serde_json::from_str::<Value>(line) {
            Ok(Value::Object(map)) => records.push(map),
            Ok(other) => warn!(
                file = %path.display(),
                line = index + 1,
                kind = json_kind(&other),
                "line is not a JSON object, skipped"
            ),
            Err(err) => warn!(
                file = %path.display(),
                line = index + 1,
                error = %err,
                "invalid JSON line skipped"
            ),
        }
    }
    records
}

fn json_kind(value: &Value) -> &'static str {
    match value {
        Value::Null => "null",
        Value::Bool(_) => "a boolean",
        Value::Number(_) => "a number",
        Value::String(_) => "a string",
        Value::Array(_) => "an array",
        Value::Object(_) => "an object",
    }
}

/// Merges one classification into its raw record. Classification fields own
/// their names: a colliding input field is preserved under a `source_`
/// prefix instead of being overwritten.
pub fn merge_enrichment(
    raw: &RawRecord,
    id: i64,
    classification: &Classification,
) -> Result<EnrichedRecord, serde_json::Error> {
    let mut merged = EnrichedRecord::new();
    for (key, value) in raw {
        let canonical = canonical_key(key);
        if CLASSIFICATION_FIELDS.contains(&canonical.as_str()) {
            let moved = format!("source_{canonical}");
            warn!(
                id,
                field = %key,
                kept_as = %moved,
                "input field collides with an enrichment field"
            );
            merged.insert(moved, value.clone());
        } else {
            merged.insert(key.clone(), value.clone());
        }
    }
    merged.insert("id".to_string(), Value::from(id));
    if let Value::Object(fields) = serde_json::to_value(classification)? {
        merged.extend(fields);
    }
    Ok(merged)
}

#[derive(Debug, Clone, Serialize)]
pub struct EnrichmentSummary {
    pub run_id: Uuid,
    pub started_at: DateTime<Utc>,
    pub finished_at: DateTime<Utc>,
    pub input_count: usize,
    pub skipped_count: usize,
    pub processed_count: usize,
    pub batches: usize,
}

/// Drives the resumable enrichment run: pending records are classified in
/// ordered batches and the artifact is checkpointed after each one, so a
/// crash loses at most the batch in flight.
pub struct EnrichmentPipeline {
    classifier: BatchClassifier,
    progress: ProgressStore,
    taxonomy: Taxonomy,
    batch_size: usize,
}

impl EnrichmentPipeline {
    pub fn new(
        classifier: BatchClassifier,
        progress: ProgressStore,
        taxonomy: Taxonomy,
        batch_size: usize,
    ) -> Self {
        Self {
            classifier,
            progress,
            taxonomy,
            batch_size: batch_size.max(1),
        }
    }

    pub async fn run(
        &self,
        input: &Path,
        recovery: &dyn RecoveryStrategy,
    ) -> Result<EnrichmentSummary> {
        let started_at = Utc::now();
        let run_id = Uuid::new_v4();

        let records = collect_records(input).await?;
        // identity is validated before any network call
        for (position, record) in records.iter().enumerate() {
            if resolve_id(record).is_none() {
                bail!("input record {} has no resolvable identifier", position + 1);
            }
        }

        let mut state = self.progress.load(recovery).await?;
        let pending_refs = state.pending(&records);
        let pending_ids: Vec<i64> = pending_refs
            .iter()
            .map(|record| resolve_id(record))
            .collect::<Option<Vec<_>>>()
            .context("pending records carry identifiers once the input is validated")?;
        let pending: Vec<RawRecord> = pending_refs.into_iter().cloned().collect();

        let input_count = records.len();
        let skipped_count = input_count - pending.len();
        let total_batches = (pending.len() + self.batch_size - 1) / self.batch_size;

        if pending.is_empty() {
            info!(input = input_count, "artifact already covers the input, nothing to classify");
        } else if skipped_count > 0 {
            info!(
                done = skipped_count,
                remaining = pending.len(),
                "resuming enrichment from the existing artifact"
            );
        }

        let mut processed_count = 0usize;
        let mut batches = 0usize;
        for (ids, batch) in pending_ids
            .chunks(self.batch_size)
            .zip(pending.chunks(self.batch_size))
        {
            let classifications = self.classifier.classify(batch).await?;
            let mut enriched = Vec::with_capacity(batch.len());
            for ((id, raw), classification) in ids.iter().zip(batch).zip(&classifications) {
                if !self
                    .taxonomy
                    .contains_pair(&classification.label, &classification.sous_label)
                {
                    warn!(
                        id,
                        label = %classification.label,
                        sous_label = %classification.sous_label,
                        "classification outside the taxonomy"
                    );
                }
                enriched.push(
                    merge_enrichment(raw, *id, classification)
                        .context("encoding enriched record")?,
                );
            }
            state.push_batch(enriched);
            self.progress.checkpoint(&state).await?;
            batches += 1;
            processed_count += batch.len();
            info!(
                batch = batches,
                total_batches,
                processed = processed_count,
                remaining = pending.len() - processed_count,
                "batch classified and checkpointed"
            );
        }

        Ok(EnrichmentSummary {
            run_id,
            started_at,
            finished_at: Utc::now(),
            input_count,
            skipped_count,
            processed_count,
            batches,
        })
    }
}

#[derive(Debug, Clone, Serialize)]
pub struct IngestSummary {
    pub run_id: Uuid,
    pub started_at: DateTime<Utc>,
    pub finished_at: DateTime<Utc>,
    pub rows_in: usize,
    pub rows_skipped: usize,
    pub main_rows: usize,
    pub keyword_rows: usize,
    pub deduped: usize,
}

/// Normalizes enriched artifacts into the columnar store. Rows without an
/// identifier are skipped with a warning; everything else degrades to null
/// rather than failing the run.
pub struct IngestPipeline {
    store: SaisineStore,
    taxonomy: Taxonomy,
}

impl IngestPipeline {
    pub fn new(store: SaisineStore, taxonomy: Taxonomy) -> Self {
        Self { store, taxonomy }
    }

    pub async fn run(&self, input: &Path) -> Result<IngestSummary> {
        let started_at = Utc::now();
        let run_id = Uuid::new_v4();

        let records = collect_records(input).await?;
        let mut mains = Vec::new();
        let mut keywords = Vec::new();
        let mut rows_skipped = 0usize;
        for (position, record) in records.iter().enumerate() {
            match normalize_record(record) {
                Ok((row, edges)) => {
                    if let (Some(label), Some(sous_label)) = (&row.label, &row.sous_label) {
                        if !self.taxonomy.contains_pair(label, sous_label) {
                            warn!(
                                id = row.id,
                                label = %label,
                                sous_label = %sous_label,
                                "classification outside the taxonomy"
                            );
                        }
                    }
                    mains.push(row);
                    keywords.extend(edges);
                }
                Err(err) => {
                    rows_skipped += 1;
                    warn!(position = position + 1, error = %err, "record skipped");
                }
            }
        }

        let report = self.store.merge_and_rewrite(mains, keywords)?;
        Ok(IngestSummary {
            run_id,
            started_at,
            finished_at: Utc::now(),
            rows_in: records.len(),
            rows_skipped,
            main_rows: report.main_rows,
            keyword_rows: report.keyword_rows,
            deduped: report.deduped,
        })
    }
}

#[derive(Debug, Clone, Serialize)]
pub struct ProgressReport {
    pub input_records: usize,
    pub enriched_records: usize,
    pub done_count: usize,
    pub pending_count: usize,
    pub percent_done: f64,
    pub last_id: Option<i64>,
    pub first_pending_id: Option<i64>,
}

/// Read-only progress check: how much of the input the artifact already
/// covers, and where a resumed run would pick up.
pub async fn progress_report(input: &Path, progress: &ProgressStore) -> Result<ProgressReport> {
    let records = collect_records(input).await?;
    let state = progress.load(&AbortOnCorrupt).await?;

    let input_ids: HashSet<i64> = records.iter().filter_map(resolve_id).collect();
    let pending_ids: Vec<i64> = input_ids
        .iter()
        .copied()
        .filter(|id| !state.is_done(*id))
        .collect();
    let percent_done = if input_ids.is_empty() {
        0.0
    } else {
        state.done_count() as f64 / input_ids.len() as f64 * 100.0
    };

    Ok(ProgressReport {
        input_records: records.len(),
        enriched_records: state.len(),
        done_count: state.done_count(),
        pending_count: pending_ids.len(),
        percent_done,
        last_id: state.last_id(),
        first_pending_id: pending_ids.iter().copied().min(),
    })
}
