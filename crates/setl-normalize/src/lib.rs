//! Normalization of raw saisine records: canonical field names, date and
//! keyword parsing, and the projection into the fixed columnar shape.

use chrono::{DateTime, NaiveDate};
use serde_json::Value;
use thiserror::Error;
use tracing::{debug, warn};
use unicode_normalization::UnicodeNormalization;

use setl_core::{KeywordRow, MainRow, RawRecord};

pub const CRATE_NAME: &str = "setl-normalize";

#[derive(Debug, Error, PartialEq, Eq)]
pub enum NormalizeError {
    #[error("record has no resolvable identifier")]
    MissingId,
}

/// Exact source-header aliases, checked before the slugifier. The list
/// mirrors the headers of the upstream spreadsheet exports.
fn alias(name: &str) -> Option<&'static str> {
    Some(match name {
        "id" => "id",
        "Date arrivée" | "Date d'arrivée" => "date_arrivee",
        "Date clôture fiche" | "Date cloture fiche" => "date_cloture",
        "Pôle en charge" | "Pole en charge" => "pole_en_charge",
        "Catégorie" => "categorie",
        "Sous-catégorie" => "sous_categorie",
        "Domaine" => "domaine",
        "Sous-domaine" => "sous_domaine",
        "Aspect contextuel" => "aspect_contextuel",
        "Nature de la saisine" => "nature_saisine",
        "Réclamation : position du médiateur" => "reclamation_position_mediateur",
        "Impact de l'appui du médiateur" => "impact_appui_mediateur",
        "Analyse" => "analyse",
        "label" => "label",
        "sous_label" => "sous_label",
        "lieu" => "lieu",
        "key_word" | "keywords" | "key_words" => "key_word",
        "label_proposition" => "label_proposition",
        "sous_label_proposition" => "sous_label_proposition",
        _ => return None,
    })
}

/// Converts a free-form header into stable ASCII snake_case. Idempotent:
/// re-slugifying the output is a no-op.
pub fn slugify(name: &str) -> String {
    let ascii: String = name.nfkd().filter(char::is_ascii).collect();
    let ascii = ascii.to_lowercase();
    let mut out = String::with_capacity(ascii.len());
    for ch in ascii.chars() {
        if ch.is_ascii_alphanumeric() {
            out.push(ch);
        } else if !out.ends_with('_') {
            out.push('_');
        }
    }
    out.trim_matches('_').to_string()
}

/// Canonical field name: explicit alias table first, slugifier otherwise.
pub fn canonical_key(name: &str) -> String {
    match alias(name) {
        Some(mapped) => mapped.to_string(),
        None => slugify(name),
    }
}

/// Best-effort date extraction. Strings are truncated to their first ten
/// characters and tried against the formats seen in the exports; numbers
/// are epoch seconds. Unparseable input yields `None`, never an error.
pub fn parse_date(value: &Value) -> Option<NaiveDate> {
    match value {
        Value::String(s) => parse_date_str(s),
        Value::Number(n) => {
            let secs = n.as_i64().or_else(|| n.as_f64().map(|f| f as i64))?;
            DateTime::from_timestamp(secs, 0).map(|dt| dt.date_naive())
        }
        _ => None,
    }
}

fn parse_date_str(raw: &str) -> Option<NaiveDate> {
    let trimmed = raw.trim();
    if trimmed.is_empty() {
        return None;
    }
    let head: String = trimmed.chars().take(10).collect();
    for fmt in ["%Y-%m-%d", "%d/%m/%Y", "%Y/%m/%d"] {
        if let Ok(date) = NaiveDate::parse_from_str(&head, fmt) {
            return Some(date);
        }
    }
    if let Ok(dt) = DateTime::parse_from_rfc3339(trimmed) {
        return Some(dt.date_naive());
    }
    warn!(value = raw, "unparseable date ignored");
    None
}

/// Keyword list from either an array or a `;`/`,`-delimited string.
/// Values are trimmed, lowercased, empty-filtered and deduplicated in
/// first-seen order.
pub fn normalize_keywords(value: &Value) -> Vec<String> {
    let raw_values: Vec<String> = match value {
        Value::Null => return Vec::new(),
        Value::Array(items) => items.iter().filter_map(scalar_text).collect(),
        Value::String(s) => s.split([';', ',']).map(str::to_string).collect(),
        other => scalar_text(other).into_iter().collect(),
    };
    let mut seen = std::collections::HashSet::new();
    let mut uniq = Vec::new();
    for raw in raw_values {
        let kw = raw.trim().to_lowercase();
        if !kw.is_empty() && seen.insert(kw.clone()) {
            uniq.push(kw);
        }
    }
    uniq
}

fn scalar_text(value: &Value) -> Option<String> {
    match value {
        Value::String(s) => Some(s.clone()),
        Value::Number(n) => Some(n.to_string()),
        Value::Bool(b) => Some(b.to_string()),
        _ => None,
    }
}

/// Coerces an identifier value: integers, integral floats and numeric
/// strings all resolve to the same `i64`.
pub fn id_value(value: &Value) -> Option<i64> {
    match value {
        Value::Number(n) => n.as_i64().or_else(|| {
            n.as_f64()
                .filter(|f| f.is_finite() && f.fract() == 0.0)
                .map(|f| f as i64)
        }),
        Value::String(s) => s.trim().parse::<i64>().ok(),
        _ => None,
    }
}

/// Resolves the record identifier under any of its aliases.
pub fn resolve_id(record: &RawRecord) -> Option<i64> {
    record
        .iter()
        .find(|(key, _)| canonical_key(key) == "id")
        .and_then(|(_, value)| id_value(value))
}

/// Projects one raw record into a main row plus its keyword edges.
///
/// Every field degrades to null on bad input except the identifier, whose
/// absence is a hard failure the caller must handle explicitly.
pub fn normalize_record(record: &RawRecord) -> Result<(MainRow, Vec<KeywordRow>), NormalizeError> {
    let id = resolve_id(record).ok_or(NormalizeError::MissingId)?;
    let mut row = MainRow {
        id,
        ..MainRow::default()
    };
    let mut keywords = Vec::new();

    for (raw_key, raw_val) in record {
        let key = canonical_key(raw_key);
        match key.as_str() {
            "id" => {}
            "key_word" => keywords = normalize_keywords(raw_val),
            // derived below, never taken from the input
            "key_word_str" => {}
            "date_arrivee" => row.date_arrivee = parse_date(raw_val),
            "date_cloture" => row.date_cloture = parse_date(raw_val),
            "pole_en_charge" => row.pole_en_charge = scalar_text(raw_val),
            "categorie" => row.categorie = scalar_text(raw_val),
            "sous_categorie" => row.sous_categorie = scalar_text(raw_val),
            "domaine" => row.domaine = scalar_text(raw_val),
            "sous_domaine" => row.sous_domaine = scalar_text(raw_val),
            "aspect_contextuel" => row.aspect_contextuel = scalar_text(raw_val),
            "nature_saisine" => row.nature_saisine = scalar_text(raw_val),
            "reclamation_position_mediateur" => {
                row.reclamation_position_mediateur = scalar_text(raw_val)
            }
            "impact_appui_mediateur" => row.impact_appui_mediateur = scalar_text(raw_val),
            "analyse" => row.analyse = scalar_text(raw_val),
            "label" => row.label = scalar_text(raw_val),
            "sous_label" => row.sous_label = scalar_text(raw_val),
            "lieu" => row.lieu = scalar_text(raw_val),
            "label_proposition" => row.label_proposition = scalar_text(raw_val),
            "sous_label_proposition" => row.sous_label_proposition = scalar_text(raw_val),
            other => debug!(field = other, "unmapped field ignored"),
        }
    }

    row.key_word_str = if keywords.is_empty() {
        None
    } else {
        Some(keywords.join(" "))
    };
    let keyword_rows = keywords
        .into_iter()
        .map(|keyword| KeywordRow { id, keyword })
        .collect();
    Ok((row, keyword_rows))
}
