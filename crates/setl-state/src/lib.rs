//! Crash-safe progress tracking for the enrichment run: the JSON artifact
//! holding every enriched record so far, rewritten atomically after each
//! batch.

use std::collections::HashSet;
use std::path::{Path, PathBuf};

use serde_json::Value;
use thiserror::Error;
use tokio::fs;
use tokio::io::AsyncWriteExt;
use tracing::{info, warn};
use uuid::Uuid;

use setl_core::{EnrichedRecord, RawRecord};
use setl_normalize::{id_value, resolve_id};

pub const CRATE_NAME: &str = "setl-state";

#[derive(Debug, Error)]
pub enum StateError {
    #[error("artifact {path} is corrupt: {reason}")]
    Corrupt { path: String, reason: String },
    #[error("failed to encode artifact: {0}")]
    Encode(#[source] serde_json::Error),
    #[error("io failure on {path}: {source}")]
    Io {
        path: String,
        #[source]
        source: std::io::Error,
    },
}

/// Decision taken when the artifact exists but cannot be interpreted.
/// The store never discards data on its own.
pub trait RecoveryStrategy {
    /// `true` to back the artifact up and restart empty, `false` to abort.
    fn backup_and_restart(&self, path: &Path, reason: &str) -> bool;
}

/// Refuses recovery: corrupt state aborts the run. The safe choice when no
/// operator is around to decide.
pub struct AbortOnCorrupt;

impl RecoveryStrategy for AbortOnCorrupt {
    fn backup_and_restart(&self, _path: &Path, _reason: &str) -> bool {
        false
    }
}

/// In-memory view of the artifact: the ordered record list plus the derived
/// set of already-processed identifiers.
#[derive(Debug, Default, Clone)]
pub struct ProgressState {
    records: Vec<Value>,
    done: HashSet<i64>,
}

impl ProgressState {
    pub fn from_records(records: Vec<Value>) -> Self {
        let done = records.iter().filter_map(record_id).collect();
        Self { records, done }
    }

    pub fn records(&self) -> &[Value] {
        &self.records
    }

    pub fn len(&self) -> usize {
        self.records.len()
    }

    pub fn is_empty(&self) -> bool {
        self.records.is_empty()
    }

    pub fn done_count(&self) -> usize {
        self.done.len()
    }

    pub fn is_done(&self, id: i64) -> bool {
        self.done.contains(&id)
    }

    /// Highest processed identifier, used for progress reporting.
    pub fn last_id(&self) -> Option<i64> {
        self.done.iter().copied().max()
    }

    /// Appends one successfully enriched batch.
    pub fn push_batch(&mut self, batch: Vec<EnrichedRecord>) {
        for record in batch {
            if let Some(id) = record.get("id").and_then(id_value) {
                self.done.insert(id);
            }
            self.records.push(Value::Object(record));
        }
    }

    /// Input records whose identifier has not been processed yet, in input
    /// order. Records with an unresolvable identifier stay pending; the
    /// caller decides what to do with them.
    pub fn pending<'a>(&self, input: &'a [RawRecord]) -> Vec<&'a RawRecord> {
        input
            .iter()
            .filter(|record| resolve_id(record).map_or(true, |id| !self.done.contains(&id)))
            .collect()
    }
}

fn record_id(record: &Value) -> Option<i64> {
    record.as_object().and_then(|obj| obj.get("id")).and_then(id_value)
}

/// Owns the artifact path and the load/checkpoint/reset operations on it.
#[derive(Debug, Clone)]
pub struct ProgressStore {
    path: PathBuf,
}

impl ProgressStore {
    pub fn new(path: impl Into<PathBuf>) -> Self {
        Self { path: path.into() }
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    fn backup_path(&self) -> PathBuf {
        let mut name = self.path.as_os_str().to_owned();
        name.push(".bak");
        PathBuf::from(name)
    }

    /// Loads the artifact. A missing or blank file is a fresh start; a
    /// malformed one goes through the recovery strategy.
    pub async fn load(
        &self,
        recovery: &dyn RecoveryStrategy,
    ) -> Result<ProgressState, StateError> {
        let exists = fs::try_exists(&self.path).await.map_err(|source| StateError::Io {
            path: self.path.display().to_string(),
            source,
        })?;
        if !exists {
            return Ok(ProgressState::default());
        }

        let raw = fs::read_to_string(&self.path)
            .await
            .map_err(|source| StateError::Io {
                path: self.path.display().to_string(),
                source,
            })?;
        if raw.trim().is_empty() {
            info!(path = %self.path.display(), "blank artifact, starting empty");
            return Ok(ProgressState::default());
        }

        let reason = match serde_json::from_str::<Value>(&raw) {
            Ok(Value::Array(records)) => {
                let state = ProgressState::from_records(records);
                info!(
                    path = %self.path.display(),
                    records = state.len(),
                    "loaded existing artifact"
                );
                return Ok(state);
            }
            Ok(other) => format!("expected a JSON array, found {}", json_kind(&other)),
            Err(err) => format!("invalid JSON: {err}"),
        };

        if recovery.backup_and_restart(&self.path, &reason) {
            let backup = self.backup_path();
            fs::rename(&self.path, &backup)
                .await
                .map_err(|source| StateError::Io {
                    path: self.path.display().to_string(),
                    source,
                })?;
            warn!(
                path = %self.path.display(),
                backup = %backup.display(),
                reason = %reason,
                "artifact backed up, starting empty"
            );
            return Ok(ProgressState::default());
        }

        Err(StateError::Corrupt {
            path: self.path.display().to_string(),
            reason,
        })
    }

    /// Persists the full record list: pretty-printed JSON array with a
    /// trailing newline, written to a temp sibling then atomically renamed
    /// over the artifact. The artifact is never observed half-written.
    pub async fn checkpoint(&self, state: &ProgressState) -> Result<(), StateError> {
        let mut bytes = serde_json::to_vec_pretty(state.records()).map_err(StateError::Encode)?;
        bytes.push(b'\n');

        if let Some(parent) = self.path.parent() {
            if !parent.as_os_str().is_empty() {
                fs::create_dir_all(parent).await.map_err(|source| StateError::Io {
                    path: parent.display().to_string(),
                    source,
                })?;
            }
        }

        let temp_name = format!(".{}.{}.tmp", Uuid::new_v4(), bytes.len());
        let temp_path = match self.path.parent() {
            Some(parent) => parent.join(&temp_name),
            None => PathBuf::from(&temp_name),
        };

        let write_result = async {
            let mut file = fs::OpenOptions::new()
                .create_new(true)
                .write(true)
                .open(&temp_path)
                .await?;
            file.write_all(&bytes).await?;
            file.flush().await?;
            drop(file);
            fs::rename(&temp_path, &self.path).await
        }
        .await;

        if let Err(source) = write_result {
            let _ = fs::remove_file(&temp_path).await;
            return Err(StateError::Io {
                path: self.path.display().to_string(),
                source,
            });
        }
        Ok(())
    }

    /// Operator-approved reset: the current artifact, if any, moves to a
    /// `.bak` sibling. Returns the backup path when one was created.
    pub async fn reset(&self) -> Result<Option<PathBuf>, StateError> {
        let exists = fs::try_exists(&self.path).await.map_err(|source| StateError::Io {
            path: self.path.display().to_string(),
            source,
        })?;
        if !exists {
            return Ok(None);
        }
        let backup = self.backup_path();
        fs::rename(&self.path, &backup)
            .await
            .map_err(|source| StateError::Io {
                path: self.path.display().to_string(),
                source,
            })?;
        warn!(backup = %backup.display(), "artifact reset, previous content backed up");
        Ok(Some(backup))
    }
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

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;
    use tempfile::tempdir;

    struct AlwaysBackup;

    impl RecoveryStrategy for AlwaysBackup {
        fn backup_and_restart(&self, _path: &Path, _reason: &str) -> bool {
            true
        }
    }

    fn enriched(id: i64) -> EnrichedRecord {
        json!({"id": id, "label": "sante", "sous_label": "autre"})
            .as_object()
            .cloned()
            .unwrap()
    }

    #[tokio::test]
    async fn missing_and_blank_artifacts_start_empty() {
        let dir = tempdir().expect("tempdir");
        let store = ProgressStore::new(dir.path().join("out.json"));
        let state = store.load(&AbortOnCorrupt).await.expect("load missing");
        assert!(state.is_empty());

        std::fs::write(store.path(), "  \n\n ").expect("write blank");
        let state = store.load(&AbortOnCorrupt).await.expect("load blank");
        assert!(state.is_empty());
    }

    #[tokio::test]
    async fn checkpoint_then_load_round_trips() {
        let dir = tempdir().expect("tempdir");
        let store = ProgressStore::new(dir.path().join("out.json"));

        let mut state = ProgressState::default();
        state.push_batch(vec![enriched(1), enriched(2)]);
        store.checkpoint(&state).await.expect("checkpoint");

        let raw = std::fs::read_to_string(store.path()).expect("read");
        assert!(raw.ends_with('\n'));
        assert!(raw.starts_with('['));

        let loaded = store.load(&AbortOnCorrupt).await.expect("reload");
        assert_eq!(loaded.len(), 2);
        assert!(loaded.is_done(1));
        assert!(loaded.is_done(2));
        assert_eq!(loaded.last_id(), Some(2));

        // no temp files left behind
        let entries: Vec<_> = std::fs::read_dir(dir.path())
            .expect("read dir")
            .map(|e| e.expect("entry").file_name())
            .collect();
        assert_eq!(entries.len(), 1);
    }

    #[tokio::test]
    async fn corrupt_artifact_aborts_by_default() {
        let dir = tempdir().expect("tempdir");
        let store = ProgressStore::new(dir.path().join("out.json"));
        std::fs::write(store.path(), "{not json").expect("write");

        let err = store.load(&AbortOnCorrupt).await.expect_err("must abort");
        assert!(matches!(err, StateError::Corrupt { .. }));
        // untouched on abort
        assert!(store.path().exists());
    }

    #[tokio::test]
    async fn corrupt_artifact_can_be_backed_up() {
        let dir = tempdir().expect("tempdir");
        let store = ProgressStore::new(dir.path().join("out.json"));
        std::fs::write(store.path(), "{\"pas\": \"une liste\"}").expect("write");

        let state = store.load(&AlwaysBackup).await.expect("backup path");
        assert!(state.is_empty());
        assert!(!store.path().exists());
        let backup = dir.path().join("out.json.bak");
        let saved = std::fs::read_to_string(backup).expect("backup exists");
        assert!(saved.contains("une liste"));
    }

    #[tokio::test]
    async fn reset_backs_up_valid_artifact() {
        let dir = tempdir().expect("tempdir");
        let store = ProgressStore::new(dir.path().join("out.json"));
        let mut state = ProgressState::default();
        state.push_batch(vec![enriched(5)]);
        store.checkpoint(&state).await.expect("checkpoint");

        let backup = store.reset().await.expect("reset").expect("backup made");
        assert!(backup.ends_with("out.json.bak"));
        assert!(!store.path().exists());

        let again = store.reset().await.expect("second reset");
        assert!(again.is_none());
    }

    #[tokio::test]
    async fn pending_preserves_input_order() {
        let input: Vec<RawRecord> = (1..=10)
            .map(|id| {
                json!({"id": id, "Analyse": "texte"})
                    .as_object()
                    .cloned()
                    .unwrap()
            })
            .collect();

        let mut state = ProgressState::default();
        state.push_batch((1..=6).map(enriched).collect());

        let pending = state.pending(&input);
        let ids: Vec<i64> = pending
            .iter()
            .map(|r| setl_normalize::resolve_id(r).unwrap())
            .collect();
        assert_eq!(ids, vec![7, 8, 9, 10]);
    }

    #[test]
    fn non_object_artifact_entries_are_carried_but_not_counted() {
        let state = ProgressState::from_records(vec![
            json!({"id": 1}),
            json!("junk"),
            json!({"sans_id": true}),
        ]);
        assert_eq!(state.len(), 3);
        assert_eq!(state.done_count(), 1);
    }
}
