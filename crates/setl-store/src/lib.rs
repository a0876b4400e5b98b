//! Columnar store for normalized saisines: two parquet relations ("main"
//! and "keywords") maintained by read-union-rewrite merges with
//! last-write-wins deduplication per identifier.

use std::cmp::Ordering;
use std::collections::{HashMap, HashSet};
use std::fs::File;
use std::path::{Path, PathBuf};
use std::sync::Arc;

use anyhow::{Context, Result};
use arrow_array::{Array, Date32Array, Int64Array, RecordBatch, StringArray};
use arrow_schema::{DataType, Field as ArrowField, Schema};
use chrono::{DateTime, Datelike, NaiveDate, Utc};
use parquet::arrow::arrow_reader::ParquetRecordBatchReaderBuilder;
use parquet::arrow::ArrowWriter;
use serde::Serialize;
use sha2::{Digest, Sha256};
use tracing::{info, warn};
use uuid::Uuid;

use setl_core::{KeywordRow, MainRow};

pub const CRATE_NAME: &str = "setl-store";

pub const MAIN_FILE: &str = "saisines.parquet";
pub const KEYWORDS_FILE: &str = "keywords.parquet";
pub const MANIFEST_FILE: &str = "manifest.json";

/// Days from 0001-01-01 (CE) to the 1970-01-01 parquet Date32 epoch.
const EPOCH_DAYS_FROM_CE: i32 = 719_163;

fn date_to_days(date: NaiveDate) -> i32 {
    date.num_days_from_ce() - EPOCH_DAYS_FROM_CE
}

fn days_to_date(days: i32) -> Option<NaiveDate> {
    days.checked_add(EPOCH_DAYS_FROM_CE)
        .and_then(NaiveDate::from_num_days_from_ce_opt)
}

/// Outcome of one merge pass over the store.
#[derive(Debug, Clone, Serialize)]
pub struct MergeReport {
    pub main_rows: usize,
    pub keyword_rows: usize,
    /// Rows collapsed away by identifier deduplication.
    pub deduped: usize,
    pub written: bool,
}

#[derive(Debug, Clone, Serialize)]
pub struct StoreManifest {
    pub schema_version: u32,
    pub written_at: DateTime<Utc>,
    pub files: Vec<ManifestFile>,
}

#[derive(Debug, Clone, Serialize)]
pub struct ManifestFile {
    pub name: String,
    pub path: String,
    pub sha256: String,
    pub bytes: u64,
    pub rows: u64,
}

/// Store directory handle. The relations inside are derived data,
/// rebuildable from the enrichment artifacts at any time.
#[derive(Debug, Clone)]
pub struct SaisineStore {
    dir: PathBuf,
}

impl SaisineStore {
    pub fn new(dir: impl Into<PathBuf>) -> Self {
        Self { dir: dir.into() }
    }

    pub fn dir(&self) -> &Path {
        &self.dir
    }

    pub fn main_path(&self) -> PathBuf {
        self.dir.join(MAIN_FILE)
    }

    pub fn keywords_path(&self) -> PathBuf {
        self.dir.join(KEYWORDS_FILE)
    }

    pub fn manifest_path(&self) -> PathBuf {
        self.dir.join(MANIFEST_FILE)
    }

    /// Reads the main relation; a missing file is an empty store, anything
    /// else that fails to decode is an error.
    pub fn read_main(&self) -> Result<Vec<MainRow>> {
        let path = self.main_path();
        if !path.exists() {
            return Ok(Vec::new());
        }
        let mut rows = Vec::new();
        for batch in open_reader(&path)? {
            let batch =
                batch.with_context(|| format!("decoding record batch from {}", path.display()))?;
            decode_main_batch(&batch, &mut rows)
                .with_context(|| format!("decoding main rows from {}", path.display()))?;
        }
        Ok(rows)
    }

    pub fn read_keywords(&self) -> Result<Vec<KeywordRow>> {
        let path = self.keywords_path();
        if !path.exists() {
            return Ok(Vec::new());
        }
        let mut rows = Vec::new();
        for batch in open_reader(&path)? {
            let batch =
                batch.with_context(|| format!("decoding record batch from {}", path.display()))?;
            decode_keywords_batch(&batch, &mut rows)
                .with_context(|| format!("decoding keyword rows from {}", path.display()))?;
        }
        Ok(rows)
    }

    /// Unions the incoming rows with the persisted relations, collapses
    /// duplicates and rewrites both files plus the manifest. An empty merge
    /// result leaves the store untouched.
    pub fn merge_and_rewrite(
        &self,
        incoming_main: Vec<MainRow>,
        incoming_keywords: Vec<KeywordRow>,
    ) -> Result<MergeReport> {
        let existing_main = self.read_main()?;
        let existing_keywords = self.read_keywords()?;
        let union_len = existing_main.len() + incoming_main.len();

        let main = merge_main(existing_main, incoming_main);
        let keywords = merge_keywords(existing_keywords, incoming_keywords);

        if main.is_empty() {
            warn!("merge produced no rows, store left untouched");
            return Ok(MergeReport {
                main_rows: 0,
                keyword_rows: 0,
                deduped: 0,
                written: false,
            });
        }

        std::fs::create_dir_all(&self.dir)
            .with_context(|| format!("creating store directory {}", self.dir.display()))?;

        let main_path = self.main_path();
        let keywords_path = self.keywords_path();
        write_parquet_atomic(&main_path, main_batch(&main)?)?;
        write_parquet_atomic(&keywords_path, keywords_batch(&keywords)?)?;

        let manifest = StoreManifest {
            schema_version: 1,
            written_at: Utc::now(),
            files: vec![
                manifest_entry("main", &self.dir, &main_path, main.len() as u64)?,
                manifest_entry("keywords", &self.dir, &keywords_path, keywords.len() as u64)?,
            ],
        };
        let bytes =
            serde_json::to_vec_pretty(&manifest).context("serializing store manifest")?;
        std::fs::write(self.manifest_path(), bytes)
            .with_context(|| format!("writing {}", self.manifest_path().display()))?;

        let report = MergeReport {
            main_rows: main.len(),
            keyword_rows: keywords.len(),
            deduped: union_len - main.len(),
            written: true,
        };
        info!(
            main_rows = report.main_rows,
            keyword_rows = report.keyword_rows,
            deduped = report.deduped,
            "store rewritten"
        );
        Ok(report)
    }
}

/// Last write wins inside each identifier partition. The union is scanned
/// with existing rows first, then incoming; a later row replaces the
/// current survivor unless its recency key is strictly older. Null recency
/// sorts last: it never beats a dated row.
pub fn merge_main(existing: Vec<MainRow>, incoming: Vec<MainRow>) -> Vec<MainRow> {
    let mut survivors: HashMap<i64, MainRow> = HashMap::new();
    for row in existing.into_iter().chain(incoming) {
        let keep_current = survivors
            .get(&row.id)
            .map_or(false, |current| strictly_older(&row, current));
        if !keep_current {
            survivors.insert(row.id, row);
        }
    }
    let mut rows: Vec<MainRow> = survivors.into_values().collect();
    rows.sort_by(main_output_order);
    rows
}

fn strictly_older(candidate: &MainRow, current: &MainRow) -> bool {
    match (candidate.recency(), current.recency()) {
        (Some(a), Some(b)) => a < b,
        (None, Some(_)) => true,
        _ => false,
    }
}

/// Stable output order: arrival date ascending with nulls last, then id.
fn main_output_order(a: &MainRow, b: &MainRow) -> Ordering {
    match (a.date_arrivee, b.date_arrivee) {
        (Some(x), Some(y)) => x.cmp(&y).then(a.id.cmp(&b.id)),
        (Some(_), None) => Ordering::Less,
        (None, Some(_)) => Ordering::Greater,
        (None, None) => a.id.cmp(&b.id),
    }
}

/// One edge per (identifier, keyword) pair, first occurrence kept, output
/// ordered by id then keyword.
pub fn merge_keywords(existing: Vec<KeywordRow>, incoming: Vec<KeywordRow>) -> Vec<KeywordRow> {
    let mut seen = HashSet::new();
    let mut rows = Vec::new();
    for row in existing.into_iter().chain(incoming) {
        if seen.insert((row.id, row.keyword.clone())) {
            rows.push(row);
        }
    }
    rows.sort_by(|a, b| a.id.cmp(&b.id).then_with(|| a.keyword.cmp(&b.keyword)));
    rows
}

fn open_reader(
    path: &Path,
) -> Result<parquet::arrow::arrow_reader::ParquetRecordBatchReader> {
    let file = File::open(path).with_context(|| format!("opening {}", path.display()))?;
    ParquetRecordBatchReaderBuilder::try_new(file)
        .with_context(|| format!("reading parquet metadata of {}", path.display()))?
        .build()
        .with_context(|| format!("opening parquet reader for {}", path.display()))
}

fn typed_column<'a, T: 'static>(batch: &'a RecordBatch, name: &str) -> Result<&'a T> {
    batch
        .column_by_name(name)
        .with_context(|| format!("column {name} missing"))?
        .as_any()
        .downcast_ref::<T>()
        .with_context(|| format!("column {name} has an unexpected type"))
}

fn opt_str(array: &StringArray, index: usize) -> Option<String> {
    if array.is_null(index) {
        None
    } else {
        Some(array.value(index).to_string())
    }
}

fn opt_date(array: &Date32Array, index: usize) -> Option<NaiveDate> {
    if array.is_null(index) {
        None
    } else {
        days_to_date(array.value(index))
    }
}

fn decode_main_batch(batch: &RecordBatch, rows: &mut Vec<MainRow>) -> Result<()> {
    let ids = typed_column::<Int64Array>(batch, "id")?;
    let date_arrivee = typed_column::<Date32Array>(batch, "date_arrivee")?;
    let date_cloture = typed_column::<Date32Array>(batch, "date_cloture")?;
    let pole_en_charge = typed_column::<StringArray>(batch, "pole_en_charge")?;
    let categorie = typed_column::<StringArray>(batch, "categorie")?;
    let sous_categorie = typed_column::<StringArray>(batch, "sous_categorie")?;
    let domaine = typed_column::<StringArray>(batch, "domaine")?;
    let sous_domaine = typed_column::<StringArray>(batch, "sous_domaine")?;
    let aspect_contextuel = typed_column::<StringArray>(batch, "aspect_contextuel")?;
    let nature_saisine = typed_column::<StringArray>(batch, "nature_saisine")?;
    let reclamation = typed_column::<StringArray>(batch, "reclamation_position_mediateur")?;
    let impact = typed_column::<StringArray>(batch, "impact_appui_mediateur")?;
    let analyse = typed_column::<StringArray>(batch, "analyse")?;
    let label = typed_column::<StringArray>(batch, "label")?;
    let sous_label = typed_column::<StringArray>(batch, "sous_label")?;
    let lieu = typed_column::<StringArray>(batch, "lieu")?;
    let label_proposition = typed_column::<StringArray>(batch, "label_proposition")?;
    let sous_label_proposition = typed_column::<StringArray>(batch, "sous_label_proposition")?;
    let key_word_str = typed_column::<StringArray>(batch, "key_word_str")?;

    for i in 0..batch.num_rows() {
        rows.push(MainRow {
            id: ids.value(i),
            date_arrivee: opt_date(date_arrivee, i),
            date_cloture: opt_date(date_cloture, i),
            pole_en_charge: opt_str(pole_en_charge, i),
            categorie: opt_str(categorie, i),
            sous_categorie: opt_str(sous_categorie, i),
            domaine: opt_str(domaine, i),
            sous_domaine: opt_str(sous_domaine, i),
            aspect_contextuel: opt_str(aspect_contextuel, i),
            nature_saisine: opt_str(nature_saisine, i),
            reclamation_position_mediateur: opt_str(reclamation, i),
            impact_appui_mediateur: opt_str(impact, i),
            analyse: opt_str(analyse, i),
            label: opt_str(label, i),
            sous_label: opt_str(sous_label, i),
            lieu: opt_str(lieu, i),
            label_proposition: opt_str(label_proposition, i),
            sous_label_proposition: opt_str(sous_label_proposition, i),
            key_word_str: opt_str(key_word_str, i),
        });
    }
    Ok(())
}

fn decode_keywords_batch(batch: &RecordBatch, rows: &mut Vec<KeywordRow>) -> Result<()> {
    let ids = typed_column::<Int64Array>(batch, "id")?;
    let keywords = typed_column::<StringArray>(batch, "keyword")?;
    for i in 0..batch.num_rows() {
        rows.push(KeywordRow {
            id: ids.value(i),
            keyword: keywords.value(i).to_string(),
        });
    }
    Ok(())
}

fn main_schema() -> Arc<Schema> {
    let text = |name: &str| ArrowField::new(name, DataType::Utf8, true);
    Arc::new(Schema::new(vec![
        ArrowField::new("id", DataType::Int64, false),
        ArrowField::new("date_arrivee", DataType::Date32, true),
        ArrowField::new("date_cloture", DataType::Date32, true),
        text("pole_en_charge"),
        text("categorie"),
        text("sous_categorie"),
        text("domaine"),
        text("sous_domaine"),
        text("aspect_contextuel"),
        text("nature_saisine"),
        text("reclamation_position_mediateur"),
        text("impact_appui_mediateur"),
        text("analyse"),
        text("label"),
        text("sous_label"),
        text("lieu"),
        text("label_proposition"),
        text("sous_label_proposition"),
        text("key_word_str"),
    ]))
}

fn keywords_schema() -> Arc<Schema> {
    Arc::new(Schema::new(vec![
        ArrowField::new("id", DataType::Int64, false),
        ArrowField::new("keyword", DataType::Utf8, false),
    ]))
}

fn main_batch(rows: &[MainRow]) -> Result<RecordBatch> {
    let text_array = |values: Vec<Option<&str>>| -> Arc<dyn Array> {
        Arc::new(StringArray::from(values))
    };

    let ids = Int64Array::from(rows.iter().map(|r| r.id).collect::<Vec<_>>());
    let date_arrivee = Date32Array::from(
        rows.iter()
            .map(|r| r.date_arrivee.map(date_to_days))
            .collect::<Vec<_>>(),
    );
    let date_cloture = Date32Array::from(
        rows.iter()
            .map(|r| r.date_cloture.map(date_to_days))
            .collect::<Vec<_>>(),
    );

    let columns: Vec<Arc<dyn Array>> = vec![
        Arc::new(ids),
        Arc::new(date_arrivee),
        Arc::new(date_cloture),
        text_array(rows.iter().map(|r| r.pole_en_charge.as_deref()).collect()),
        text_array(rows.iter().map(|r| r.categorie.as_deref()).collect()),
        text_array(rows.iter().map(|r| r.sous_categorie.as_deref()).collect()),
        text_array(rows.iter().map(|r| r.domaine.as_deref()).collect()),
        text_array(rows.iter().map(|r| r.sous_domaine.as_deref()).collect()),
        text_array(rows.iter().map(|r| r.aspect_contextuel.as_deref()).collect()),
        text_array(rows.iter().map(|r| r.nature_saisine.as_deref()).collect()),
        text_array(
            rows.iter()
                .map(|r| r.reclamation_position_mediateur.as_deref())
                .collect(),
        ),
        text_array(
            rows.iter()
                .map(|r| r.impact_appui_mediateur.as_deref())
                .collect(),
        ),
        text_array(rows.iter().map(|r| r.analyse.as_deref()).collect()),
        text_array(rows.iter().map(|r| r.label.as_deref()).collect()),
        text_array(rows.iter().map(|r| r.sous_label.as_deref()).collect()),
        text_array(rows.iter().map(|r| r.lieu.as_deref()).collect()),
        text_array(rows.iter().map(|r| r.label_proposition.as_deref()).collect()),
        text_array(
            rows.iter()
                .map(|r| r.sous_label_proposition.as_deref())
                .collect(),
        ),
        text_array(rows.iter().map(|r| r.key_word_str.as_deref()).collect()),
    ];

    RecordBatch::try_new(main_schema(), columns).context("building main record batch")
}

fn keywords_batch(rows: &[KeywordRow]) -> Result<RecordBatch> {
    let ids = Int64Array::from(rows.iter().map(|r| r.id).collect::<Vec<_>>());
    let keywords = StringArray::from(
        rows.iter()
            .map(|r| Some(r.keyword.as_str()))
            .collect::<Vec<_>>(),
    );
    RecordBatch::try_new(keywords_schema(), vec![Arc::new(ids), Arc::new(keywords)])
        .context("building keywords record batch")
}

/// Writes a relation to a temp sibling then renames it over the target, so
/// a crash mid-rewrite never leaves a truncated parquet file behind.
fn write_parquet_atomic(path: &Path, batch: RecordBatch) -> Result<()> {
    let temp_name = format!(".{}.tmp", Uuid::new_v4());
    let temp_path = match path.parent() {
        Some(parent) if !parent.as_os_str().is_empty() => parent.join(&temp_name),
        _ => PathBuf::from(&temp_name),
    };

    let result = (|| -> Result<()> {
        let file = File::create(&temp_path)
            .with_context(|| format!("creating {}", temp_path.display()))?;
        let mut writer = ArrowWriter::try_new(file, batch.schema(), None)
            .with_context(|| format!("opening parquet writer {}", temp_path.display()))?;
        writer
            .write(&batch)
            .with_context(|| format!("writing record batch {}", temp_path.display()))?;
        writer
            .close()
            .with_context(|| format!("closing parquet writer {}", temp_path.display()))?;
        std::fs::rename(&temp_path, path).with_context(|| {
            format!(
                "renaming {} -> {}",
                temp_path.display(),
                path.display()
            )
        })
    })();

    if result.is_err() {
        let _ = std::fs::remove_file(&temp_path);
    }
    result
}

fn manifest_entry(name: &str, dir: &Path, path: &Path, rows: u64) -> Result<ManifestFile> {
    let bytes = std::fs::read(path).with_context(|| format!("reading {}", path.display()))?;
    let mut hasher = Sha256::new();
    hasher.update(&bytes);
    let sha256 = hex::encode(hasher.finalize());
    let rel = path.strip_prefix(dir).unwrap_or(path).display().to_string();
    Ok(ManifestFile {
        name: name.to_string(),
        path: rel,
        sha256,
        bytes: bytes.len() as u64,
        rows,
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::tempdir;

    fn row(id: i64, date_arrivee: Option<&str>, analyse: &str) -> MainRow {
        MainRow {
            id,
            date_arrivee: date_arrivee.map(|d| d.parse().unwrap()),
            analyse: Some(analyse.to_string()),
            ..MainRow::default()
        }
    }

    fn kw(id: i64, keyword: &str) -> KeywordRow {
        KeywordRow {
            id,
            keyword: keyword.to_string(),
        }
    }

    #[test]
    fn date32_conversion_round_trips() {
        for raw in ["1969-12-31", "1970-01-01", "2022-02-01"] {
            let date: NaiveDate = raw.parse().unwrap();
            assert_eq!(days_to_date(date_to_days(date)), Some(date));
        }
        assert_eq!(date_to_days("1970-01-01".parse().unwrap()), 0);
        assert_eq!(date_to_days("1969-12-31".parse().unwrap()), -1);
    }

    #[test]
    fn store_round_trips_rows_and_accents() {
        let dir = tempdir().expect("tempdir");
        let store = SaisineStore::new(dir.path());
        let mut main = row(1, Some("2022-01-31"), "Problème d'inscription");
        main.pole_en_charge = Some("Pôle Médiation".into());
        main.date_cloture = None;

        let report = store
            .merge_and_rewrite(vec![main.clone(), row(2, None, "sans date")], vec![kw(1, "visa")])
            .expect("merge");
        assert!(report.written);
        assert_eq!(report.main_rows, 2);

        let back = store.read_main().expect("read back");
        assert_eq!(back.len(), 2);
        assert_eq!(back[0], main);
        assert_eq!(back[1].date_arrivee, None);
        assert_eq!(store.read_keywords().expect("keywords"), vec![kw(1, "visa")]);
    }

    #[test]
    fn merge_is_idempotent() {
        let dir = tempdir().expect("tempdir");
        let store = SaisineStore::new(dir.path());
        let mains = vec![row(1, Some("2022-01-01"), "a"), row(2, Some("2022-01-02"), "b")];
        let kws = vec![kw(1, "a"), kw(1, "b")];

        store
            .merge_and_rewrite(mains.clone(), kws.clone())
            .expect("first merge");
        let first_main = store.read_main().expect("read");
        let first_kw = store.read_keywords().expect("read");

        let report = store.merge_and_rewrite(mains, kws).expect("second merge");
        assert_eq!(report.deduped, 2);
        assert_eq!(store.read_main().expect("read"), first_main);
        assert_eq!(store.read_keywords().expect("read"), first_kw);
    }

    #[test]
    fn newest_row_wins_regardless_of_union_order() {
        let old = row(1, Some("2022-01-01"), "ancienne");
        let new = row(1, Some("2022-02-01"), "récente");

        let forward = merge_main(vec![old.clone()], vec![new.clone()]);
        assert_eq!(forward, vec![new.clone()]);

        let backward = merge_main(vec![new.clone()], vec![old]);
        assert_eq!(backward, vec![new]);
    }

    #[test]
    fn recency_falls_back_to_closure_and_nulls_lose() {
        let mut closed = row(1, None, "close");
        closed.date_cloture = Some("2022-03-01".parse().unwrap());
        let undated = row(1, None, "sans date");

        // dated beats undated from either side of the union
        assert_eq!(
            merge_main(vec![undated.clone()], vec![closed.clone()]),
            vec![closed.clone()]
        );
        assert_eq!(
            merge_main(vec![closed.clone()], vec![undated.clone()]),
            vec![closed]
        );

        // both undated: the later union position wins
        let replacement = row(1, None, "remplaçante");
        assert_eq!(
            merge_main(vec![undated], vec![replacement.clone()]),
            vec![replacement]
        );
    }

    #[test]
    fn equal_recency_keeps_the_later_row() {
        let stale = row(1, Some("2022-01-01"), "ancienne version");
        let fresh = row(1, Some("2022-01-01"), "nouvelle version");
        assert_eq!(merge_main(vec![stale], vec![fresh.clone()]), vec![fresh]);
    }

    #[test]
    fn keyword_edges_are_unique_per_pair() {
        let existing = vec![kw(1, "a"), kw(1, "b")];
        let incoming = vec![kw(1, "a"), kw(1, "b"), kw(2, "a")];
        let merged = merge_keywords(existing, incoming);
        assert_eq!(merged, vec![kw(1, "a"), kw(1, "b"), kw(2, "a")]);
    }

    #[test]
    fn output_is_ordered_by_arrival_then_id() {
        let merged = merge_main(
            vec![row(3, None, "c"), row(1, Some("2022-02-01"), "a")],
            vec![row(2, Some("2022-01-01"), "b"), row(4, None, "d")],
        );
        let ids: Vec<i64> = merged.iter().map(|r| r.id).collect();
        assert_eq!(ids, vec![2, 1, 3, 4]);
    }

    #[test]
    fn missing_store_reads_empty_and_empty_merge_writes_nothing() {
        let dir = tempdir().expect("tempdir");
        let store = SaisineStore::new(dir.path().join("store"));
        assert!(store.read_main().expect("read").is_empty());

        let report = store.merge_and_rewrite(vec![], vec![]).expect("merge");
        assert!(!report.written);
        assert!(!store.main_path().exists());
        assert!(!store.manifest_path().exists());
    }

    #[test]
    fn manifest_describes_the_written_files() {
        let dir = tempdir().expect("tempdir");
        let store = SaisineStore::new(dir.path());
        store
            .merge_and_rewrite(vec![row(1, Some("2022-01-01"), "a")], vec![kw(1, "a")])
            .expect("merge");

        let manifest: serde_json::Value = serde_json::from_str(
            &std::fs::read_to_string(store.manifest_path()).expect("manifest"),
        )
        .expect("valid json");
        let files = manifest["files"].as_array().expect("files");
        assert_eq!(files.len(), 2);
        assert_eq!(files[0]["name"], "main");
        assert_eq!(files[0]["rows"], 1);

        let main_bytes = std::fs::read(store.main_path()).expect("main bytes");
        let mut hasher = Sha256::new();
        hasher.update(&main_bytes);
        assert_eq!(files[0]["sha256"], hex::encode(hasher.finalize()));

        // no temp files left behind
        let leftovers: Vec<_> = std::fs::read_dir(dir.path())
            .expect("read dir")
            .filter_map(|e| e.ok())
            .filter(|e| e.file_name().to_string_lossy().ends_with(".tmp"))
            .collect();
        assert!(leftovers.is_empty());
    }

    #[test]
    fn corrupt_parquet_is_a_hard_error() {
        let dir = tempdir().expect("tempdir");
        let store = SaisineStore::new(dir.path());
        std::fs::write(store.main_path(), b"pas du parquet").expect("write");
        assert!(store.read_main().is_err());
    }
}
