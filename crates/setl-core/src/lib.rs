//! Core domain model for SETL: records, the classification contract,
//! the taxonomy and the acronym glossary.

use std::path::Path;

use chrono::NaiveDate;
use serde::{Deserialize, Serialize};
use thiserror::Error;

pub const CRATE_NAME: &str = "setl-core";

/// Raw complaint record as loaded from an input file. Keys are free-form
/// (accented, synonymous, inconsistently cased); the identifier hides under
/// one of several aliases.
pub type RawRecord = serde_json::Map<String, serde_json::Value>;

/// Raw record with the classification fields merged in, as persisted in the
/// enrichment artifact.
pub type EnrichedRecord = serde_json::Map<String, serde_json::Value>;

/// Upper bound on `key_word` entries per classification.
pub const MAX_KEYWORDS: usize = 5;

/// Field names owned by the classification output. A raw field whose
/// canonical key collides with one of these is moved aside before the merge.
pub const CLASSIFICATION_FIELDS: [&str; 6] = [
    "label",
    "sous_label",
    "lieu",
    "key_word",
    "label_proposition",
    "sous_label_proposition",
];

/// One classification object, positionally aligned with its input record.
///
/// Deserialization is strict: unknown fields reject the whole payload, which
/// is how short-circuited or chatty model output gets caught.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct Classification {
    pub label: String,
    pub sous_label: String,
    #[serde(default)]
    pub lieu: Option<String>,
    #[serde(default)]
    pub key_word: Vec<String>,
    #[serde(default)]
    pub label_proposition: Option<String>,
    #[serde(default)]
    pub sous_label_proposition: Option<String>,
}

/// One row of the "main" relation: the fixed columnar shape every record is
/// projected into. Everything but the identifier is nullable.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct MainRow {
    pub id: i64,
    pub date_arrivee: Option<NaiveDate>,
    pub date_cloture: Option<NaiveDate>,
    pub pole_en_charge: Option<String>,
    pub categorie: Option<String>,
    pub sous_categorie: Option<String>,
    pub domaine: Option<String>,
    pub sous_domaine: Option<String>,
    pub aspect_contextuel: Option<String>,
    pub nature_saisine: Option<String>,
    pub reclamation_position_mediateur: Option<String>,
    pub impact_appui_mediateur: Option<String>,
    pub analyse: Option<String>,
    pub label: Option<String>,
    pub sous_label: Option<String>,
    pub lieu: Option<String>,
    pub label_proposition: Option<String>,
    pub sous_label_proposition: Option<String>,
    pub key_word_str: Option<String>,
}

impl MainRow {
    /// Recency key for last-write-wins deduplication: arrival date, falling
    /// back to the closure date.
    pub fn recency(&self) -> Option<NaiveDate> {
        self.date_arrivee.or(self.date_cloture)
    }
}

/// One (identifier, keyword) edge of the "keywords" relation.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct KeywordRow {
    pub id: i64,
    pub keyword: String,
}

/// Failure to load a taxonomy or glossary override file.
#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("failed to read {path}: {source}")]
    Read {
        path: String,
        #[source]
        source: std::io::Error,
    },
    #[error("failed to parse {path}: {source}")]
    Parse {
        path: String,
        #[source]
        source: serde_yaml::Error,
    },
    #[error("taxonomy has no labels")]
    EmptyTaxonomy,
}

/// Closed two-level classification taxonomy ("nature du problème").
///
/// Label order is meaningful: it is the order the labels are presented to
/// the classifier, so the structure is a vector rather than a map.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Taxonomy {
    pub labels: Vec<LabelDef>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct LabelDef {
    pub code: String,
    pub description: String,
    pub sous_labels: Vec<SousLabelDef>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SousLabelDef {
    pub code: String,
    pub description: String,
}

impl Taxonomy {
    /// Loads a replacement taxonomy from a YAML file.
    pub fn from_yaml_file(path: &Path) -> Result<Self, ConfigError> {
        let raw = std::fs::read_to_string(path).map_err(|source| ConfigError::Read {
            path: path.display().to_string(),
            source,
        })?;
        let taxonomy: Taxonomy =
            serde_yaml::from_str(&raw).map_err(|source| ConfigError::Parse {
                path: path.display().to_string(),
                source,
            })?;
        if taxonomy.labels.is_empty() {
            return Err(ConfigError::EmptyTaxonomy);
        }
        Ok(taxonomy)
    }

    pub fn contains_label(&self, label: &str) -> bool {
        self.labels.iter().any(|l| l.code == label)
    }

    pub fn contains_pair(&self, label: &str, sous_label: &str) -> bool {
        self.labels
            .iter()
            .find(|l| l.code == label)
            .is_some_and(|l| l.sous_labels.iter().any(|s| s.code == sous_label))
    }

    /// Renders the taxonomy as the indented code/description block embedded
    /// in the classification prompt. Preserves label order.
    pub fn prompt_block(&self) -> String {
        let mut out = String::new();
        for label in &self.labels {
            out.push_str(&format!("- {} : {}\n", label.code, label.description));
            for sous in &label.sous_labels {
                out.push_str(&format!("    - {} : {}\n", sous.code, sous.description));
            }
        }
        out
    }

    /// The taxonomy shipped with the original classification campaign.
    pub fn builtin() -> Self {
        fn label(code: &str, description: &str, sous: &[(&str, &str)]) -> LabelDef {
            LabelDef {
                code: code.to_string(),
                description: description.to_string(),
                sous_labels: sous
                    .iter()
                    .map(|(c, d)| SousLabelDef {
                        code: (*c).to_string(),
                        description: (*d).to_string(),
                    })
                    .collect(),
            }
        }

        Taxonomy {
            labels: vec![
                label(
                    "harcelement",
                    "Harcèlement / climat relationnel",
                    &[
                        ("harcelement_general", "Harcèlement (non précisé)"),
                        ("harcelement_raciste", "Harcèlement raciste"),
                        ("harcelement_islamophobe", "Harcèlement islamophobe"),
                        ("harcelement_religieux_autre", "Harcèlement religieux (autre)"),
                        ("harcelement_homophobe", "Harcèlement homophobe"),
                        ("harcelement_sexiste", "Harcèlement sexiste"),
                        ("harcelement_cyber", "Cyberharcèlement"),
                        ("conflit_famille_etablissement", "Conflit famille / établissement"),
                        ("conflit_inter_eleves", "Conflit entre élèves"),
                        ("conflit_enseignant", "Conflit avec un enseignant"),
                        ("conflit_direction", "Conflit avec la direction"),
                        ("autre", "Autre harcèlement / conflit"),
                    ],
                ),
                label(
                    "violence",
                    "Violence",
                    &[
                        ("violence_physique", "Violence physique"),
                        ("violence_verbale", "Violence verbale / insultes"),
                        ("autre", "Autre violence"),
                    ],
                ),
                label(
                    "handicap_inclusion",
                    "Handicap / inclusion",
                    &[
                        ("handicap_non_prise_en_compte", "Handicap non pris en compte"),
                        ("absence_aesh", "Absence d'AESH"),
                        ("aesh_insuffisant", "Volume AESH insuffisant"),
                        ("amenagement_non_respecte", "Aménagement non respecté"),
                        ("orientation_uliss_ime", "Orientation ULIS / IME"),
                        ("autre", "Autre problématique handicap / inclusion"),
                    ],
                ),
                label(
                    "sante",
                    "Santé",
                    &[
                        ("maladie_grave", "Maladie grave impactant la scolarité"),
                        ("sante_psychologique", "Problèmes psychologiques"),
                        ("autre", "Autre problématique santé"),
                    ],
                ),
                label(
                    "examens",
                    "Examens, notes, évaluations",
                    &[
                        ("contestation_note", "Contestation de note"),
                        ("contestation_resultat", "Contestation de résultat"),
                        ("proche_reussite", "Échec à quelques dixièmes"),
                        ("consultation_copies", "Demande de consultation des copies"),
                        ("erreur_materielle", "Erreur matérielle"),
                        ("bug_numerique", "Bug informatique examen"),
                        ("sanction_fraude", "Sanction / accusation fraude"),
                        ("absence_justifiee_non_prise", "Absence justifiée non prise en compte"),
                        ("absence_non_justifiee", "Absence non justifiée"),
                        ("tiers_temps_refuse", "Tiers temps non accordé / hors délai"),
                        ("demande_rattrapage", "Demande rattrapage / repasser"),
                        ("jury_souverain", "Souveraineté du jury"),
                        ("autre", "Autre problématique examen"),
                    ],
                ),
                label(
                    "inscriptions_orientation",
                    "Inscriptions / orientation",
                    &[
                        ("pb_inscription_scolaire", "Problème inscription scolaire"),
                        ("pb_inscription_bts", "Problème inscription BTS"),
                        ("pb_inscription_master", "Problème inscription master"),
                        ("pb_inscription_licence", "Problème inscription licence"),
                        ("pb_inscription_ifsi_ifmk", "Problème inscription IFSI / IFMK / CNAM"),
                        ("inscription_hors_delai", "Inscription hors délai"),
                        ("refus_parcoursup", "Refus Parcoursup"),
                        ("refus_master", "Refus admission master"),
                        ("passage_etudes", "Passage L1/L2/L3 / redoublement"),
                        ("reorientation", "Réorientation"),
                        ("stage_probleme", "Problème de stage"),
                        ("vae_refusee", "Refus / difficulté VAE"),
                        ("autre", "Autre problématique inscription / orientation"),
                    ],
                ),
                label(
                    "bourses_aides",
                    "Bourses / aides financières",
                    &[
                        ("refus_bourse", "Refus de bourse"),
                        ("revision_bourse", "Révision / réexamen bourse"),
                        ("montant_bourse", "Montant de bourse contesté"),
                        ("droits_epuises", "Droits à bourse épuisés"),
                        ("remboursement_bourse", "Remboursement bourse"),
                        ("non_assiduite", "Remboursement pour non-assiduité"),
                        ("dse_incomplet", "DSE incomplet"),
                        ("dse_bug", "Bug sur DSE"),
                        ("bourse_merite", "Bourse au mérite"),
                        ("aide_financiere", "Demande aide financière"),
                        ("autre", "Autre problématique bourse / aide"),
                    ],
                ),
                label(
                    "logement",
                    "Logement",
                    &[
                        ("refus_logement", "Refus logement CROUS"),
                        ("dette_logement", "Dette logement CROUS"),
                        ("caution_non_restituee", "Caution non restituée"),
                        ("pb_apl", "Problème APL / CAF / CROUS"),
                        ("demande_logement", "Demande aide logement"),
                        ("autre", "Autre problématique logement"),
                    ],
                ),
                label(
                    "vie_scolaire",
                    "Vie scolaire / organisation",
                    &[
                        ("pb_accueil_greve", "Problème accueil (grève)"),
                        ("pb_protocole_sanitaire", "Protocole sanitaire contesté"),
                        ("pb_tenue", "Litige tenue"),
                        ("accident_scolaire", "Accident scolaire"),
                        ("objet_connecte", "Objet connecté en classe"),
                        ("pb_absences", "Gestion des absences"),
                        ("autre", "Autre problématique vie scolaire"),
                    ],
                ),
                label(
                    "international",
                    "Visa / international",
                    &[
                        ("visa_refuse", "Visa d'études refusé"),
                        ("visa_retarde", "Visa d'études retardé"),
                        ("inscription_impossible_visa", "Inscription impossible (visa)"),
                        ("pb_campusfrance", "Problème Campus France / consulat"),
                        ("autre", "Autre problématique internationale"),
                    ],
                ),
                label(
                    "ecoles_privees",
                    "Écoles privées / organismes",
                    &[
                        ("litige_frais", "Litige frais scolarité"),
                        ("rupture_scolarite", "Rupture ou refus poursuite études"),
                        ("absence_explications", "Absence explication résultats"),
                        ("hors_champ_en", "Hors champ Éducation nationale"),
                        ("autre", "Autre problématique école privée"),
                    ],
                ),
                label(
                    "rh_personnels",
                    "RH / carrière personnels",
                    &[
                        ("pb_mutation", "Problème mutation / affectation"),
                        ("pb_cpf", "Problème CPF / formation"),
                        ("pb_clm_cld", "Congé maladie long (CLM/CLD)"),
                        ("pb_retraite", "Problème retraite / IDV"),
                        ("pb_remuneration", "Problème rémunération"),
                        ("pb_frais", "Frais déplacement non remboursés"),
                        ("pb_recrutement", "Recrutement / contrat"),
                        ("autre", "Autre problématique RH"),
                    ],
                ),
                label(
                    "relation_administration",
                    "Relation administration",
                    &[
                        ("absence_reponse", "Absence de réponse"),
                        ("dossier_incomplet", "Dossier incomplet"),
                        ("demande_information", "Demande d'information"),
                        ("hors_competence", "Hors compétence du médiateur"),
                        ("application_reglement", "Application stricte règlement"),
                        ("inexecution_jugement", "Inexécution d'un jugement"),
                        ("autre", "Autre problématique administrative"),
                    ],
                ),
                label("autre", "Autre", &[("autre", "Autre")]),
            ],
        }
    }
}

/// Acronym glossary handed to the classifier as interpretation hints.
/// `noise` lists codes that look like acronyms but carry no meaning
/// (mediator initials, typos) and must be ignored.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct Glossary {
    #[serde(default)]
    pub definitions: Vec<GlossaryEntry>,
    #[serde(default)]
    pub noise: Vec<String>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct GlossaryEntry {
    pub code: String,
    pub meaning: String,
}

impl Glossary {
    pub fn from_yaml_file(path: &Path) -> Result<Self, ConfigError> {
        let raw = std::fs::read_to_string(path).map_err(|source| ConfigError::Read {
            path: path.display().to_string(),
            source,
        })?;
        serde_yaml::from_str(&raw).map_err(|source| ConfigError::Parse {
            path: path.display().to_string(),
            source,
        })
    }

    pub fn is_empty(&self) -> bool {
        self.definitions.is_empty() && self.noise.is_empty()
    }

    /// Renders the defined acronyms as `CODE : meaning` lines.
    pub fn prompt_block(&self) -> String {
        let mut out = String::new();
        for entry in &self.definitions {
            out.push_str(&format!("- {} : {}\n", entry.code, entry.meaning));
        }
        out
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn builtin_taxonomy_is_closed_and_complete() {
        let tax = Taxonomy::builtin();
        assert_eq!(tax.labels.len(), 14);
        for label in &tax.labels {
            assert!(
                label.sous_labels.iter().any(|s| s.code == "autre"),
                "label {} lacks an autre fallback",
                label.code
            );
        }
        assert!(tax.contains_pair("examens", "contestation_note"));
        assert!(tax.contains_pair("autre", "autre"));
        assert!(!tax.contains_pair("examens", "refus_bourse"));
        assert!(!tax.contains_label("inexistant"));
    }

    #[test]
    fn prompt_block_preserves_label_order() {
        let tax = Taxonomy::builtin();
        let block = tax.prompt_block();
        let first = block.lines().next().unwrap();
        assert!(first.starts_with("- harcelement :"));
        let harcelement_pos = block.find("- harcelement").unwrap();
        let autre_pos = block.find("- autre :").unwrap();
        assert!(harcelement_pos < autre_pos);
    }

    #[test]
    fn classification_rejects_unknown_fields() {
        let payload = r#"{"label":"sante","sous_label":"autre","lieu":null,"key_word":[],"resume":"..."}"#;
        let parsed: Result<Classification, _> = serde_json::from_str(payload);
        assert!(parsed.is_err());
    }

    #[test]
    fn classification_accepts_absent_optionals() {
        let payload = r#"{"label":"sante","sous_label":"autre"}"#;
        let parsed: Classification = serde_json::from_str(payload).unwrap();
        assert_eq!(parsed.lieu, None);
        assert!(parsed.key_word.is_empty());
        assert_eq!(parsed.label_proposition, None);
    }

    #[test]
    fn taxonomy_yaml_round_trip() {
        let tax = Taxonomy {
            labels: vec![LabelDef {
                code: "sante".into(),
                description: "Santé".into(),
                sous_labels: vec![SousLabelDef {
                    code: "autre".into(),
                    description: "Autre".into(),
                }],
            }],
        };
        let yaml = serde_yaml::to_string(&tax).unwrap();
        let back: Taxonomy = serde_yaml::from_str(&yaml).unwrap();
        assert_eq!(back, tax);
    }
}
