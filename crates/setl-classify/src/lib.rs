//! Batch classification against the Gemini API: typed failure dispatch,
//! two-tier retry, and strict validation of the ordered response contract.

use std::sync::Arc;
use std::time::Duration;

use anyhow::Context;
use async_trait::async_trait;
use reqwest::StatusCode;
use serde::Deserialize;
use thiserror::Error;
use tracing::{info, warn};

use setl_core::{Classification, Glossary, RawRecord, Taxonomy, MAX_KEYWORDS};

pub const CRATE_NAME: &str = "setl-classify";

pub const DEFAULT_MODEL: &str = "gemini-2.5-flash-lite";
pub const DEFAULT_ENDPOINT: &str = "https://generativelanguage.googleapis.com/v1beta";

/// Failure modes of one classification call, split by how they retry.
#[derive(Debug, Error)]
pub enum ClientError {
    /// Rate-limit / quota signal. Retried without an attempt bound; the
    /// server may suggest how long to wait.
    #[error("capacity exhausted")]
    Capacity { retry_after: Option<Duration> },
    /// Service outage or transport failure. Retried a bounded number of
    /// times with exponential backoff.
    #[error("service unavailable: {message}")]
    Unavailable {
        status: Option<u16>,
        message: String,
    },
    /// The response violates the output contract. Never retried.
    #[error("contract violation: {reason}")]
    Contract { reason: String },
}

/// One classification request per ordered batch.
#[async_trait]
pub trait ClassifierClient: Send + Sync {
    async fn classify_batch(&self, batch: &[RawRecord]) -> Result<Vec<Classification>, ClientError>;
}

/// Retry policy constants for the two failure tiers.
#[derive(Debug, Clone, Copy)]
pub struct RetryTuning {
    pub max_availability_retries: usize,
    pub availability_base_delay: Duration,
    pub capacity_fallback_delay: Duration,
    pub capacity_cushion: Duration,
}

impl Default for RetryTuning {
    fn default() -> Self {
        Self {
            max_availability_retries: 3,
            availability_base_delay: Duration::from_secs(10),
            capacity_fallback_delay: Duration::from_secs(60),
            capacity_cushion: Duration::from_secs(2),
        }
    }
}

impl RetryTuning {
    /// Doubling backoff for the availability tier: base, 2x, 4x, ...
    pub fn availability_delay(&self, attempt_index: usize) -> Duration {
        let factor = 1u32.checked_shl(attempt_index as u32).unwrap_or(u32::MAX);
        self.availability_base_delay.saturating_mul(factor)
    }

    /// Wait for the capacity tier: the server's suggestion plus a cushion,
    /// or the fallback when the server gave none.
    pub fn capacity_delay(&self, suggested: Option<Duration>) -> Duration {
        match suggested {
            Some(delay) => delay.saturating_add(self.capacity_cushion),
            None => self.capacity_fallback_delay,
        }
    }
}

/// Extracts a suggested retry delay from a capacity error body. The service
/// encodes it three different ways depending on the path that throttled:
/// `Please retry in 41s`, `retryDelay': '41s'` or `"retryDelay": "41s"`.
/// Returns the first whole-second value found.
pub fn retry_delay_from_text(text: &str) -> Option<Duration> {
    if let Some(rest) = text.split("Please retry in").nth(1) {
        if let Some(secs) = leading_seconds(rest) {
            return Some(Duration::from_secs(secs));
        }
    }
    if let Some(rest) = text.split("retryDelay").nth(1) {
        if let Some(secs) = leading_seconds(rest) {
            return Some(Duration::from_secs(secs));
        }
    }
    None
}

/// Reads the first digit run of `text` (skipping quote/colon/space filler)
/// and requires it to be a seconds value, i.e. followed by `s` after an
/// optional fractional part.
fn leading_seconds(text: &str) -> Option<u64> {
    let mut digits = String::new();
    let mut chars = text.chars().peekable();
    while let Some(ch) = chars.peek().copied() {
        if ch.is_ascii_digit() {
            break;
        }
        if matches!(ch, ' ' | '\t' | '\'' | '"' | ':') {
            chars.next();
            continue;
        }
        return None;
    }
    while let Some(ch) = chars.peek().copied() {
        if !ch.is_ascii_digit() {
            break;
        }
        digits.push(ch);
        chars.next();
    }
    if digits.is_empty() {
        return None;
    }
    if chars.peek() == Some(&'.') {
        chars.next();
        while chars.peek().map_or(false, |c| c.is_ascii_digit()) {
            chars.next();
        }
    }
    if chars.next() != Some('s') {
        return None;
    }
    digits.parse().ok()
}

/// Builds the French classification prompt for one batch: output contract,
/// taxonomy, glossary hints and the batch itself as a JSON array.
pub fn build_batch_prompt(
    taxonomy: &Taxonomy,
    glossary: &Glossary,
    batch: &[RawRecord],
) -> Result<String, serde_json::Error> {
    let plaintes_json = serde_json::to_string_pretty(batch)?;
    let taxonomy_block = taxonomy.prompt_block();

    let glossary_section = if glossary.is_empty() {
        String::new()
    } else {
        let mut noise = glossary.noise.clone();
        noise.sort();
        format!(
            r#"================================================
AIDE A L'INTERPRETATION - ACRONYMES
================================================

Les données peuvent contenir des acronymes.
Ils servent d'INDICES DE CONTEXTE, mais ne sont PAS fiables à 100%.

REGLES :
1) Utilise un acronyme UNIQUEMENT s'il est cohérent avec le texte "Analyse".
2) Ignore un acronyme s'il n'a pas de définition, s'il figure dans la liste
   "BRUIT" ou s'il semble hors-sujet (initiales, faute de frappe).
3) Ne base JAMAIS une classification uniquement sur un acronyme.
4) Ne recopie JAMAIS les définitions dans la sortie.

ACRONYMES DEFINIS :
{definitions}
CODES BRUIT / FAUTES PROBABLES / INITIALES MEDIATEURS :
{noise}

"#,
            definitions = glossary.prompt_block(),
            noise = noise.join(", "),
        )
    };

    Ok(format!(
        r#"Tu es un expert de médiation scolaire. Tu dois classifier des saisines afin de produire
des statistiques fiables, stables et exploitables.

================================================
IMPORTANT - CONTRAT DE SORTIE STRICT
================================================

Tu dois répondre UNIQUEMENT par un TABLEAU JSON.

Chaque élément du tableau doit contenir :
- OBLIGATOIREMENT :
  1) "label"
  2) "sous_label"
  3) "lieu"
  4) "key_word"

- OPTIONNELLEMENT (UNIQUEMENT dans certains cas) :
  5) "label_proposition"
  6) "sous_label_proposition"

INTERDICTIONS ABSOLUES :
- Ne renvoie AUCUN autre champ.
- Ne renvoie PAS de résumé, analyse, émotion, gravité, urgence, etc.
- Ne recopie JAMAIS le texte de la plainte.
- Ne commente PAS ta réponse.

================================================
TAXONOMIE - CODES AUTORISES
================================================

La classification DOIT s'appuyer sur la taxonomie suivante.

- "label" doit être un des codes de premier niveau.
- "sous_label" doit être un des codes listés sous ce label.
- Tu ne dois JAMAIS inventer de nouveaux codes pour la classification principale.

{taxonomy_block}
================================================
REGLE FONDAMENTALE DE CLASSIFICATION
================================================

Tu dois TOUJOURS fournir une classification principale ("label", "sous_label").

1) Utilise "label = autre" UNIQUEMENT si aucun label existant ne correspond
   au problème. Dans ce cas tu DOIS proposer un "label_proposition", et un
   "sous_label_proposition" si possible.

2) Les champs "label_proposition" et "sous_label_proposition" servent
   EXCLUSIVEMENT à suggérer une évolution de la taxonomie : cas ambigu entre
   plusieurs sous_labels, sous_label trop spécifique, problème transversal.
   Ils doivent être PLUS GENERIQUES que la classification principale.

3) Si la classification principale est claire et suffisante, n'utilise NI
   "label_proposition" NI "sous_label_proposition".

"autre" n'est PAS une proposition. Les propositions ne remplacent JAMAIS la
classification principale.

================================================
REGLES SUR "lieu"
================================================

- "lieu" = lieu CONCRET si identifiable
  (ex: "salle de classe", "cantine", "cour", "internat",
       "examen", "plateforme en ligne").
- Si non identifiable ou non pertinent : null.
- Ne pas confondre avec pôle, académie ou rectorat (ex: Lille).

================================================
REGLES SUR "key_word"
================================================

- "key_word" = liste de 2 à 5 mots-clés factuels.
- Ne pas dupliquer "label" ou "sous_label".
- Mots courts, sans phrases, sans ponctuation superflue.
- Objectif : aide à la statistique et au filtrage.

{glossary_section}================================================
PRIORITE DES SOURCES POUR CLASSIFIER
================================================

1) Texte "Analyse" (priorité maximale)
2) Champs métier structurés (Catégorie, Domaine, Sous-domaine, Nature de la saisine)
3) Acronymes (indices secondaires uniquement)

================================================
ENTREE - LISTE DES PLAINTES (JSON)
================================================

Tu dois produire EXACTEMENT un objet de sortie par plainte,
dans le MEME ORDRE que la liste d'entrée.

PLAINTES :
{plaintes_json}

================================================
SORTIE ATTENDUE
================================================

REPONSE : UNIQUEMENT un tableau JSON,
sans texte libre, sans commentaire, sans métadonnées.
"#,
    ))
}

#[derive(Debug, Deserialize)]
struct GenerateResponse {
    #[serde(default)]
    candidates: Vec<Candidate>,
}

#[derive(Debug, Deserialize)]
struct Candidate {
    content: CandidateContent,
}

#[derive(Debug, Deserialize)]
struct CandidateContent {
    #[serde(default)]
    parts: Vec<CandidatePart>,
}

#[derive(Debug, Deserialize)]
struct CandidatePart {
    #[serde(default)]
    text: String,
}

/// Decodes a generateContent body down to the classification array.
/// Anything short of a well-formed array is a contract violation.
fn decode_generate_payload(body: &str) -> Result<Vec<Classification>, ClientError> {
    let envelope: GenerateResponse =
        serde_json::from_str(body).map_err(|err| ClientError::Contract {
            reason: format!("unreadable response envelope: {err}"),
        })?;
    let text = envelope
        .candidates
        .first()
        .and_then(|c| c.content.parts.first())
        .map(|p| p.text.as_str())
        .ok_or_else(|| ClientError::Contract {
            reason: "response carries no candidate text".to_string(),
        })?;
    serde_json::from_str::<Vec<Classification>>(text).map_err(|err| ClientError::Contract {
        reason: format!("candidate text is not a classification array: {err}"),
    })
}

/// Connection settings for the hosted classification model.
#[derive(Debug, Clone)]
pub struct GeminiConfig {
    pub api_key: String,
    pub model: String,
    pub endpoint: String,
    pub request_timeout: Duration,
}

impl GeminiConfig {
    pub fn new(api_key: impl Into<String>) -> Self {
        Self {
            api_key: api_key.into(),
            model: DEFAULT_MODEL.to_string(),
            endpoint: DEFAULT_ENDPOINT.to_string(),
            request_timeout: Duration::from_secs(120),
        }
    }
}

/// `ClassifierClient` against the Gemini generateContent REST surface,
/// with the response constrained to JSON via a response schema.
pub struct GeminiClient {
    client: reqwest::Client,
    config: GeminiConfig,
    taxonomy: Taxonomy,
    glossary: Glossary,
}

impl GeminiClient {
    pub fn new(config: GeminiConfig, taxonomy: Taxonomy, glossary: Glossary) -> anyhow::Result<Self> {
        let client = reqwest::Client::builder()
            .gzip(true)
            .brotli(true)
            .timeout(config.request_timeout)
            .build()
            .context("building reqwest client")?;
        Ok(Self {
            client,
            config,
            taxonomy,
            glossary,
        })
    }

    fn request_body(&self, prompt: &str) -> serde_json::Value {
        serde_json::json!({
            "contents": [{ "parts": [{ "text": prompt }] }],
            "generationConfig": {
                "responseMimeType": "application/json",
                "responseSchema": {
                    "type": "ARRAY",
                    "items": {
                        "type": "OBJECT",
                        "properties": {
                            "label": { "type": "STRING" },
                            "sous_label": { "type": "STRING" },
                            "lieu": { "type": "STRING", "nullable": true },
                            "key_word": { "type": "ARRAY", "items": { "type": "STRING" } },
                            "label_proposition": { "type": "STRING", "nullable": true },
                            "sous_label_proposition": { "type": "STRING", "nullable": true }
                        },
                        "required": ["label", "sous_label"]
                    }
                }
            }
        })
    }
}

#[async_trait]
impl ClassifierClient for GeminiClient {
    async fn classify_batch(&self, batch: &[RawRecord]) -> Result<Vec<Classification>, ClientError> {
        let prompt = build_batch_prompt(&self.taxonomy, &self.glossary, batch).map_err(|err| {
            ClientError::Contract {
                reason: format!("failed to encode batch: {err}"),
            }
        })?;
        let url = format!(
            "{}/models/{}:generateContent",
            self.config.endpoint.trim_end_matches('/'),
            self.config.model
        );

        let response = self
            .client
            .post(&url)
            .query(&[("key", self.config.api_key.as_str())])
            .json(&self.request_body(&prompt))
            .send()
            .await
            .map_err(classify_transport_error)?;

        let status = response.status();
        if status == StatusCode::TOO_MANY_REQUESTS {
            let body = response.text().await.unwrap_or_default();
            return Err(ClientError::Capacity {
                retry_after: retry_delay_from_text(&body),
            });
        }
        if status.is_server_error() {
            let body = response.text().await.unwrap_or_default();
            return Err(ClientError::Unavailable {
                status: Some(status.as_u16()),
                message: snippet(&body),
            });
        }
        if !status.is_success() {
            let body = response.text().await.unwrap_or_default();
            return Err(ClientError::Contract {
                reason: format!("http status {}: {}", status.as_u16(), snippet(&body)),
            });
        }

        let body = response.text().await.map_err(classify_transport_error)?;
        decode_generate_payload(&body)
    }
}

fn classify_transport_error(err: reqwest::Error) -> ClientError {
    if err.is_timeout() || err.is_connect() || err.is_request() {
        ClientError::Unavailable {
            status: None,
            message: err.to_string(),
        }
    } else {
        ClientError::Contract {
            reason: err.to_string(),
        }
    }
}

fn snippet(body: &str) -> String {
    const LIMIT: usize = 240;
    if body.chars().count() <= LIMIT {
        body.to_string()
    } else {
        let head: String = body.chars().take(LIMIT).collect();
        format!("{head}...")
    }
}

/// Drives one batch through the client until it succeeds, exhausts its
/// availability retries, or hits a contract violation.
pub struct BatchClassifier {
    client: Arc<dyn ClassifierClient>,
    tuning: RetryTuning,
}

#[derive(Debug, Error)]
pub enum ClassifyError {
    #[error("classification contract violated: {reason}")]
    Contract { reason: String },
    #[error("classification service unavailable after {attempts} attempts: {message}")]
    Exhausted { attempts: usize, message: String },
}

impl BatchClassifier {
    pub fn new(client: Arc<dyn ClassifierClient>, tuning: RetryTuning) -> Self {
        Self { client, tuning }
    }

    /// Classifies one ordered batch. Capacity stalls retry forever;
    /// availability failures retry up to the cap; contract violations
    /// propagate immediately.
    pub async fn classify(&self, batch: &[RawRecord]) -> Result<Vec<Classification>, ClassifyError> {
        let mut availability_attempts = 0usize;
        loop {
            match self.client.classify_batch(batch).await {
                Ok(list) => {
                    validate_contract(batch.len(), &list)?;
                    return Ok(list);
                }
                Err(ClientError::Capacity { retry_after }) => {
                    let delay = self.tuning.capacity_delay(retry_after);
                    warn!(
                        delay_ms = delay.as_millis() as u64,
                        suggested = retry_after.is_some(),
                        "capacity exhausted, waiting before retrying the batch"
                    );
                    tokio::time::sleep(delay).await;
                }
                Err(ClientError::Unavailable { status, message }) => {
                    if availability_attempts < self.tuning.max_availability_retries {
                        let delay = self.tuning.availability_delay(availability_attempts);
                        availability_attempts += 1;
                        warn!(
                            attempt = availability_attempts,
                            max_retries = self.tuning.max_availability_retries,
                            status = status.unwrap_or(0),
                            delay_ms = delay.as_millis() as u64,
                            "service unavailable, backing off"
                        );
                        tokio::time::sleep(delay).await;
                    } else {
                        return Err(ClassifyError::Exhausted {
                            attempts: availability_attempts + 1,
                            message,
                        });
                    }
                }
                Err(ClientError::Contract { reason }) => {
                    return Err(ClassifyError::Contract { reason });
                }
            }
        }
    }
}

/// Positional contract: one classification per record, keyword arity bound.
fn validate_contract(batch_len: usize, list: &[Classification]) -> Result<(), ClassifyError> {
    if list.len() != batch_len {
        return Err(ClassifyError::Contract {
            reason: format!("expected {batch_len} items, got {}", list.len()),
        });
    }
    for (index, classification) in list.iter().enumerate() {
        if classification.key_word.len() > MAX_KEYWORDS {
            return Err(ClassifyError::Contract {
                reason: format!(
                    "item {index} carries {} keywords, limit is {MAX_KEYWORDS}",
                    classification.key_word.len()
                ),
            });
        }
    }
    info!(items = list.len(), "batch classification validated");
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;
    use std::collections::VecDeque;
    use std::sync::Mutex;

    fn record(id: i64) -> RawRecord {
        json!({"id": id, "Analyse": "texte"}).as_object().cloned().unwrap()
    }

    fn classification() -> Classification {
        Classification {
            label: "sante".into(),
            sous_label: "autre".into(),
            lieu: None,
            key_word: vec!["fatigue".into()],
            label_proposition: None,
            sous_label_proposition: None,
        }
    }

    struct ScriptedClient {
        responses: Mutex<VecDeque<Result<Vec<Classification>, ClientError>>>,
        calls: Mutex<usize>,
    }

    impl ScriptedClient {
        fn new(responses: Vec<Result<Vec<Classification>, ClientError>>) -> Self {
            Self {
                responses: Mutex::new(responses.into()),
                calls: Mutex::new(0),
            }
        }

        fn calls(&self) -> usize {
            *self.calls.lock().unwrap()
        }
    }

    #[async_trait]
    impl ClassifierClient for ScriptedClient {
        async fn classify_batch(
            &self,
            _batch: &[RawRecord],
        ) -> Result<Vec<Classification>, ClientError> {
            *self.calls.lock().unwrap() += 1;
            self.responses
                .lock()
                .unwrap()
                .pop_front()
                .unwrap_or_else(|| Ok(vec![classification()]))
        }
    }

    fn fast_tuning() -> RetryTuning {
        RetryTuning {
            max_availability_retries: 3,
            availability_base_delay: Duration::from_millis(1),
            capacity_fallback_delay: Duration::from_millis(1),
            capacity_cushion: Duration::from_millis(1),
        }
    }

    #[test]
    fn delay_extraction_covers_the_three_encodings() {
        assert_eq!(
            retry_delay_from_text("429 RESOURCE_EXHAUSTED. Please retry in 41s."),
            Some(Duration::from_secs(41))
        );
        assert_eq!(
            retry_delay_from_text("Please retry in 7.9s"),
            Some(Duration::from_secs(7))
        );
        assert_eq!(
            retry_delay_from_text("'retryDelay': '30s'"),
            Some(Duration::from_secs(30))
        );
        assert_eq!(
            retry_delay_from_text(r#""retryDelay": "12s""#),
            Some(Duration::from_secs(12))
        );
        assert_eq!(retry_delay_from_text("quota exceeded"), None);
        assert_eq!(retry_delay_from_text("retryDelay: soon"), None);
    }

    #[test]
    fn capacity_delay_adds_cushion_or_falls_back() {
        let tuning = RetryTuning::default();
        assert_eq!(
            tuning.capacity_delay(Some(Duration::from_secs(41))),
            Duration::from_secs(43)
        );
        assert_eq!(tuning.capacity_delay(None), Duration::from_secs(60));
    }

    #[test]
    fn availability_backoff_doubles() {
        let tuning = RetryTuning::default();
        assert_eq!(tuning.availability_delay(0), Duration::from_secs(10));
        assert_eq!(tuning.availability_delay(1), Duration::from_secs(20));
        assert_eq!(tuning.availability_delay(2), Duration::from_secs(40));
    }

    #[tokio::test]
    async fn capacity_failures_retry_without_a_bound() {
        let capacity = || ClientError::Capacity { retry_after: None };
        let client = Arc::new(ScriptedClient::new(vec![
            Err(capacity()),
            Err(capacity()),
            Err(capacity()),
            Err(capacity()),
            Err(capacity()),
            Ok(vec![classification()]),
        ]));
        let mut tuning = fast_tuning();
        tuning.max_availability_retries = 1;
        let driver = BatchClassifier::new(client.clone(), tuning);

        let out = driver.classify(&[record(1)]).await.expect("succeeds");
        assert_eq!(out.len(), 1);
        assert_eq!(client.calls(), 6);
    }

    #[tokio::test]
    async fn availability_failures_exhaust_after_the_cap() {
        let unavailable = || ClientError::Unavailable {
            status: Some(503),
            message: "overloaded".into(),
        };
        let client = Arc::new(ScriptedClient::new(vec![
            Err(unavailable()),
            Err(unavailable()),
            Err(unavailable()),
            Err(unavailable()),
        ]));
        let driver = BatchClassifier::new(client.clone(), fast_tuning());

        let err = driver.classify(&[record(1)]).await.expect_err("exhausted");
        match err {
            ClassifyError::Exhausted { attempts, .. } => assert_eq!(attempts, 4),
            other => panic!("unexpected error: {other}"),
        }
        assert_eq!(client.calls(), 4);
    }

    #[tokio::test]
    async fn availability_recovers_before_the_cap() {
        let client = Arc::new(ScriptedClient::new(vec![
            Err(ClientError::Unavailable {
                status: Some(503),
                message: "overloaded".into(),
            }),
            Ok(vec![classification()]),
        ]));
        let driver = BatchClassifier::new(client.clone(), fast_tuning());

        driver.classify(&[record(1)]).await.expect("recovers");
        assert_eq!(client.calls(), 2);
    }

    #[tokio::test]
    async fn contract_violations_never_retry() {
        let client = Arc::new(ScriptedClient::new(vec![Err(ClientError::Contract {
            reason: "unknown field".into(),
        })]));
        let driver = BatchClassifier::new(client.clone(), fast_tuning());

        let err = driver.classify(&[record(1)]).await.expect_err("fatal");
        assert!(matches!(err, ClassifyError::Contract { .. }));
        assert_eq!(client.calls(), 1);
    }

    #[tokio::test]
    async fn short_responses_violate_the_contract() {
        let client = Arc::new(ScriptedClient::new(vec![Ok(vec![classification()])]));
        let driver = BatchClassifier::new(client.clone(), fast_tuning());

        let err = driver
            .classify(&[record(1), record(2)])
            .await
            .expect_err("length mismatch");
        match err {
            ClassifyError::Contract { reason } => {
                assert!(reason.contains("expected 2 items, got 1"))
            }
            other => panic!("unexpected error: {other}"),
        }
        assert_eq!(client.calls(), 1);
    }

    #[tokio::test]
    async fn oversized_keyword_lists_violate_the_contract() {
        let mut over = classification();
        over.key_word = (0..6).map(|i| format!("kw{i}")).collect();
        let client = Arc::new(ScriptedClient::new(vec![Ok(vec![over])]));
        let driver = BatchClassifier::new(client, fast_tuning());

        let err = driver.classify(&[record(1)]).await.expect_err("arity");
        assert!(matches!(err, ClassifyError::Contract { .. }));
    }

    #[test]
    fn generate_payload_decodes_candidate_text() {
        let body = json!({
            "candidates": [{
                "content": {
                    "parts": [{
                        "text": "[{\"label\":\"examens\",\"sous_label\":\"contestation_note\",\"lieu\":\"examen\",\"key_word\":[\"note\",\"jury\"]}]"
                    }]
                }
            }]
        })
        .to_string();
        let list = decode_generate_payload(&body).expect("decodes");
        assert_eq!(list.len(), 1);
        assert_eq!(list[0].label, "examens");
        assert_eq!(list[0].key_word, vec!["note", "jury"]);
    }

    #[test]
    fn generate_payload_rejects_empty_and_chatty_responses() {
        let empty = json!({"candidates": []}).to_string();
        assert!(matches!(
            decode_generate_payload(&empty),
            Err(ClientError::Contract { .. })
        ));

        let chatty = json!({
            "candidates": [{
                "content": { "parts": [{ "text": "Voici la classification: [...]" }] }
            }]
        })
        .to_string();
        assert!(matches!(
            decode_generate_payload(&chatty),
            Err(ClientError::Contract { .. })
        ));
    }

    #[test]
    fn prompt_embeds_taxonomy_batch_and_glossary() {
        let taxonomy = Taxonomy::builtin();
        let glossary = Glossary {
            definitions: vec![setl_core::GlossaryEntry {
                code: "AESH".into(),
                meaning: "Accompagnant d'élèves en situation de handicap".into(),
            }],
            noise: vec!["XYZ".into()],
        };
        let batch = vec![record(1), record(2)];

        let prompt = build_batch_prompt(&taxonomy, &glossary, &batch).expect("prompt");
        assert!(prompt.contains("CONTRAT DE SORTIE STRICT"));
        assert!(prompt.contains("- harcelement : Harcèlement / climat relationnel"));
        assert!(prompt.contains("MEME ORDRE"));
        assert!(prompt.contains("\"id\": 1"));
        assert!(prompt.contains("AESH"));
        assert!(prompt.contains("XYZ"));

        let bare = build_batch_prompt(&taxonomy, &Glossary::default(), &batch).expect("prompt");
        assert!(!bare.contains("ACRONYMES DEFINIS"));
    }
}
