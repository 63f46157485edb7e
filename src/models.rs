//! Data model.

use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};
use std::collections::BTreeMap;
use std::str::FromStr;

/// Part-of-speech tag. Unknown source strings normalize to `Unknown`
/// rather than erroring — vocabulary ingress is external and noisy.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum PartOfSpeech {
    Noun,
    Verb,
    Adjective,
    Adverb,
    Particle,
    Interjection,
    Unknown,
}

impl FromStr for PartOfSpeech {
    type Err = std::convert::Infallible;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Ok(match s.to_ascii_lowercase().as_str() {
            "noun" => PartOfSpeech::Noun,
            "verb" => PartOfSpeech::Verb,
            "adjective" => PartOfSpeech::Adjective,
            "adverb" => PartOfSpeech::Adverb,
            "particle" => PartOfSpeech::Particle,
            "interjection" => PartOfSpeech::Interjection,
            _ => PartOfSpeech::Unknown,
        })
    }
}

impl std::fmt::Display for PartOfSpeech {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let s = match self {
            PartOfSpeech::Noun => "noun",
            PartOfSpeech::Verb => "verb",
            PartOfSpeech::Adjective => "adjective",
            PartOfSpeech::Adverb => "adverb",
            PartOfSpeech::Particle => "particle",
            PartOfSpeech::Interjection => "interjection",
            PartOfSpeech::Unknown => "unknown",
        };
        f.write_str(s)
    }
}

/// The unit of work entering the pipeline. Immutable after creation.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct VocabularyItem {
    pub position: u64,
    pub term: String,
    #[serde(rename = "type")]
    pub pos: PartOfSpeech,
}

impl VocabularyItem {
    pub fn new(position: u64, term: impl Into<String>, pos: PartOfSpeech) -> Self {
        Self {
            position,
            term: term.into(),
            pos,
        }
    }
}

/// `vs` / `nuance` comparison pair inside Stage-1 output.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Comparison {
    pub vs: String,
    pub nuance: String,
}

/// A homonym entry; only `meaning` is mandated.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Homonym {
    pub meaning: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub hanja: Option<String>,
}

/// Structured semantic analysis produced by the Nuance model (Stage 1).
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Stage1Result {
    pub ipa: String,
    pub pos: PartOfSpeech,
    pub primary_meaning: String,
    /// (noun, action) pair.
    pub metaphor: (String, String),
    /// (object, sensory-quality) pair.
    pub anchor: (String, String),
    pub location: String,
    pub explanation: String,
    pub comparison: Comparison,
    #[serde(default)]
    pub homonyms: Vec<Homonym>,
    pub korean_keywords: Vec<String>,
}

impl Stage1Result {
    /// Deterministic, sorted-key serialization so identical results hash
    /// identically regardless of struct field order.
    pub fn canonical_json(&self) -> String {
        canonicalize(&serde_json::to_value(self).expect("Stage1Result always serializes"))
    }
}

/// Recursively re-serializes a `serde_json::Value` with object keys sorted,
/// producing a byte-stable canonical form.
fn canonicalize(value: &serde_json::Value) -> String {
    fn sort(value: &serde_json::Value) -> serde_json::Value {
        match value {
            serde_json::Value::Object(map) => {
                let sorted: BTreeMap<String, serde_json::Value> =
                    map.iter().map(|(k, v)| (k.clone(), sort(v))).collect();
                serde_json::to_value(sorted).expect("BTreeMap of Values always serializes")
            }
            serde_json::Value::Array(items) => {
                serde_json::Value::Array(items.iter().map(sort).collect())
            }
            other => other.clone(),
        }
    }
    serde_json::to_string(&sort(value)).expect("canonical value always serializes")
}

/// Fixed enumeration of flashcard "tabs".
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum TabName {
    Scene,
    #[serde(rename = "usage-comparison")]
    UsageComparison,
    Hanja,
    Grammar,
    #[serde(rename = "formal-casual")]
    FormalCasual,
    Example,
    Cultural,
}

impl TabName {
    pub fn as_str(&self) -> &'static str {
        match self {
            TabName::Scene => "Scene",
            TabName::UsageComparison => "Usage-Comparison",
            TabName::Hanja => "Hanja",
            TabName::Grammar => "Grammar",
            TabName::FormalCasual => "Formal-Casual",
            TabName::Example => "Example",
            TabName::Cultural => "Cultural",
        }
    }

    pub fn parse(s: &str) -> Option<Self> {
        Some(match s.trim() {
            "Scene" => TabName::Scene,
            "Usage-Comparison" => TabName::UsageComparison,
            "Hanja" => TabName::Hanja,
            "Grammar" => TabName::Grammar,
            "Formal-Casual" => TabName::FormalCasual,
            "Example" => TabName::Example,
            "Cultural" => TabName::Cultural,
            _ => return None,
        })
    }
}

/// A single flashcard row produced by the Flashcard model (Stage 2).
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Stage2Row {
    pub position: u64,
    pub term_with_ipa: String,
    pub term_number: u32,
    pub tab_name: TabName,
    pub primer: String,
    pub front: String,
    pub back: String,
    pub tags: String,
    pub honorific_level: String,
}

/// An ordered sequence of flashcard rows for one vocabulary item.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Stage2Result {
    pub rows: Vec<Stage2Row>,
}

const STAGE2_HEADER: &str =
    "position\tterm\tterm_number\ttab_name\tprimer\tfront\tback\ttags\thonorific_level";

/// Escapes tabs/newlines per the TSV wire contract.
fn escape_field(s: &str) -> String {
    s.replace('\t', "\\t").replace('\n', "\\n")
}

/// Reverses `escape_field`.
fn unescape_field(s: &str) -> String {
    s.replace("\\t", "\t").replace("\\n", "\n")
}

impl Stage2Result {
    /// Serializes to TSV including the header row. Round-tripping through
    /// `parser::stage2::parse` and back is the identity.
    pub fn to_tsv(&self) -> String {
        let mut out = String::from(STAGE2_HEADER);
        out.push('\n');
        for row in &self.rows {
            out.push_str(&format!(
                "{}\t{}\t{}\t{}\t{}\t{}\t{}\t{}\t{}\n",
                row.position,
                escape_field(&row.term_with_ipa),
                row.term_number,
                row.tab_name.as_str(),
                escape_field(&row.primer),
                escape_field(&row.front),
                escape_field(&row.back),
                escape_field(&row.tags),
                escape_field(&row.honorific_level),
            ));
        }
        out
    }
}

pub(crate) fn unescape(s: &str) -> String {
    unescape_field(s)
}

/// Content-addressed cache key generation.
pub fn stage1_cache_key(item: &VocabularyItem) -> String {
    let mut hasher = Sha256::new();
    hasher.update(format!("{}:{}", item.term, item.pos));
    hex::encode(hasher.finalize())
}

pub fn stage2_cache_key(item: &VocabularyItem, stage1: &Stage1Result) -> String {
    let mut hasher = Sha256::new();
    hasher.update(format!("{}:{}", item.term, stage1.canonical_json()));
    hex::encode(hasher.finalize())
}

/// Two-hex-char shard prefix for a cache key.
pub fn shard_prefix(key: &str) -> &str {
    &key[0..2.min(key.len())]
}

/// Outcome of processing one vocabulary item end to end.
#[derive(Debug, Clone)]
pub struct ProcessingResult {
    pub position: u64,
    pub term: String,
    pub outcome: ProcessingOutcome,
    pub from_cache: bool,
    pub processing_time_ms: u64,
}

#[derive(Debug, Clone)]
pub enum ProcessingOutcome {
    Success { flashcard_tsv: String },
    Failure { error: String },
}

impl ProcessingResult {
    pub fn is_success(&self) -> bool {
        matches!(self.outcome, ProcessingOutcome::Success { .. })
    }
}

/// A single persisted checkpoint.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Checkpoint {
    pub checkpoint_id: String,
    pub batch_id: String,
    pub timestamp: chrono::DateTime<chrono::Utc>,
    pub processed_items: Vec<u64>,
    pub pending_items: Vec<u64>,
    pub stage: BatchStage,
    pub metrics_snapshot: crate::metrics::BatchMetricsSnapshot,
}

impl Checkpoint {
    /// Invariant: processed and pending partition the total item set.
    pub fn is_consistent(&self, total: usize) -> bool {
        let processed: std::collections::HashSet<_> = self.processed_items.iter().collect();
        let pending: std::collections::HashSet<_> = self.pending_items.iter().collect();
        processed.is_disjoint(&pending) && processed.len() + pending.len() == total
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum BatchStage {
    Stage1,
    Stage2,
    Completed,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn unknown_pos_normalizes() {
        assert_eq!(PartOfSpeech::from_str("adjectif").unwrap(), PartOfSpeech::Unknown);
        assert_eq!(PartOfSpeech::from_str("Noun").unwrap(), PartOfSpeech::Noun);
    }

    #[test]
    fn stage1_cache_key_is_deterministic() {
        let item = VocabularyItem::new(1, "안녕", PartOfSpeech::Noun);
        let k1 = stage1_cache_key(&item);
        let k2 = stage1_cache_key(&item);
        assert_eq!(k1, k2);
        assert_eq!(k1.len(), 64);
    }

    #[test]
    fn canonical_json_is_order_independent() {
        let a = Stage1Result {
            ipa: "an.njʌŋ".into(),
            pos: PartOfSpeech::Noun,
            primary_meaning: "hello".into(),
            metaphor: ("greeting".into(), "wave".into()),
            anchor: ("hand".into(), "warm".into()),
            location: "doorway".into(),
            explanation: "a common greeting".into(),
            comparison: Comparison {
                vs: "안녕하세요".into(),
                nuance: "less formal".into(),
            },
            homonyms: vec![],
            korean_keywords: vec!["인사".into()],
        };
        let b = a.clone();
        assert_eq!(a.canonical_json(), b.canonical_json());
    }

    #[test]
    fn tsv_round_trip_is_identity() {
        let result = Stage2Result {
            rows: vec![Stage2Row {
                position: 1,
                term_with_ipa: "안녕 [an.njʌŋ]".into(),
                term_number: 1,
                tab_name: TabName::Scene,
                primer: "greeting\tcontext".into(),
                front: "안녕".into(),
                back: "hello\nhi".into(),
                tags: "greeting,casual".into(),
                honorific_level: "casual".into(),
            }],
        };
        let tsv = result.to_tsv();
        let parsed = crate::parser::stage2::parse(&tsv).expect("parses");
        assert_eq!(parsed.rows, result.rows);
        assert_eq!(parsed.to_tsv(), tsv);
    }
}
