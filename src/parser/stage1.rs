//! Stage-1 (Nuance) output parsing: extracts the JSON object a model
//! returned — possibly wrapped in a fenced code block, possibly trailed
//! by commentary — repairs the common small syntax slips, and validates
//! the required shape before handing back a `Stage1Result`.

use crate::error::PipelineError;
use crate::models::{Comparison, Homonym, PartOfSpeech, Stage1Result};
use regex::Regex;
use serde::Deserialize;
use std::str::FromStr;
use std::sync::OnceLock;

fn fenced_block_re() -> &'static Regex {
    static RE: OnceLock<Regex> = OnceLock::new();
    RE.get_or_init(|| Regex::new(r"```(?:json)?\s*([\s\S]*?)```").expect("valid regex"))
}

fn trailing_comma_re() -> &'static Regex {
    static RE: OnceLock<Regex> = OnceLock::new();
    RE.get_or_init(|| Regex::new(r",\s*([}\]])").expect("valid regex"))
}

/// Matches `"..." "..."` / `} {` / `] [` with no comma between — the
/// other common small malformation alongside trailing commas.
fn missing_comma_re() -> &'static Regex {
    static RE: OnceLock<Regex> = OnceLock::new();
    RE.get_or_init(|| Regex::new(r#"("|\}|\])(\s*\n?\s*)("|\{|\[)"#).expect("valid regex"))
}

fn field_re(name: &str) -> Regex {
    Regex::new(&format!(r#""{name}"\s*:\s*"((?:[^"\\]|\\.)*)""#)).expect("valid regex")
}

/// Loosely-typed mirror of `Stage1Result` used for best-effort partial
/// extraction when the strict shape doesn't parse.
#[derive(Debug, Default, Deserialize)]
struct RawStage1 {
    ipa: Option<String>,
    #[serde(default, alias = "part_of_speech")]
    pos: Option<String>,
    primary_meaning: Option<String>,
    metaphor: Option<(String, String)>,
    anchor: Option<(String, String)>,
    location: Option<String>,
    explanation: Option<String>,
    comparison: Option<Comparison>,
    #[serde(default)]
    homonyms: Vec<Homonym>,
    #[serde(default)]
    korean_keywords: Vec<String>,
}

/// Pulls the most plausible JSON object out of raw model text: the whole
/// trimmed string, a fenced code block, or the outermost `{...}` span, in
/// that order of preference.
fn extract_json_text(raw: &str) -> Option<String> {
    let trimmed = raw.trim();
    if trimmed.starts_with('{') && trimmed.ends_with('}') {
        return Some(trimmed.to_string());
    }
    if let Some(captures) = fenced_block_re().captures(raw) {
        let inner = captures.get(1).map(|m| m.as_str().trim()).unwrap_or("");
        if !inner.is_empty() {
            return Some(inner.to_string());
        }
    }
    let start = raw.find('{')?;
    let end = raw.rfind('}')?;
    if end > start {
        Some(raw[start..=end].to_string())
    } else {
        None
    }
}

/// Applies the two targeted regex repairs named in `spec.md` §4.5:
/// trailing commas before `}`/`]`, and missing commas between adjacent
/// string/object/array values.
fn repair(text: &str) -> String {
    let no_trailing_commas = trailing_comma_re().replace_all(text, "$1");
    missing_comma_re().replace_all(&no_trailing_commas, "$1,$3").into_owned()
}

/// Per-field regex extraction used only when the text isn't recoverable
/// as JSON at all (truncated or badly malformed output). Pulls whatever
/// simple `"field": "value"` pairs it can find; fields that can't be
/// found stay `None` and surface as the usual missing-field error from
/// `from_raw`, so a truncated response fails the same way a structurally
/// absent field would rather than silently fabricating content.
fn extract_partial(text: &str) -> RawStage1 {
    let string_field = |name: &str| -> Option<String> {
        field_re(name)
            .captures(text)
            .and_then(|c| c.get(1))
            .map(|m| m.as_str().replace("\\\"", "\"").replace("\\n", "\n"))
    };

    RawStage1 {
        ipa: string_field("ipa"),
        pos: string_field("pos").or_else(|| string_field("part_of_speech")),
        primary_meaning: string_field("primary_meaning"),
        metaphor: None,
        anchor: None,
        location: string_field("location"),
        explanation: string_field("explanation"),
        comparison: None,
        homonyms: Vec::new(),
        korean_keywords: Vec::new(),
    }
}

fn validate(result: &Stage1Result) -> Result<(), PipelineError> {
    if result.korean_keywords.is_empty() {
        return Err(PipelineError::Parsing(
            "stage1 output has empty korean_keywords".to_string(),
        ));
    }
    if result.comparison.vs.trim().is_empty() || result.comparison.nuance.trim().is_empty() {
        return Err(PipelineError::Parsing(
            "stage1 comparison is missing vs/nuance".to_string(),
        ));
    }
    for homonym in &result.homonyms {
        if homonym.meaning.trim().is_empty() {
            return Err(PipelineError::Parsing(
                "stage1 homonym entry is missing meaning".to_string(),
            ));
        }
    }
    if result.primary_meaning.trim().is_empty() || result.ipa.trim().is_empty() {
        return Err(PipelineError::Parsing(
            "stage1 output is missing ipa/primary_meaning".to_string(),
        ));
    }
    Ok(())
}

fn from_raw(raw: RawStage1) -> Result<Stage1Result, PipelineError> {
    let missing = |field: &str| PipelineError::Parsing(format!("stage1 output is missing required field '{field}'"));
    let pos = raw
        .pos
        .as_deref()
        .map(|s| PartOfSpeech::from_str(s).unwrap_or(PartOfSpeech::Unknown))
        .unwrap_or(PartOfSpeech::Unknown);

    Ok(Stage1Result {
        ipa: raw.ipa.ok_or_else(|| missing("ipa"))?,
        pos,
        primary_meaning: raw.primary_meaning.ok_or_else(|| missing("primary_meaning"))?,
        metaphor: raw.metaphor.ok_or_else(|| missing("metaphor"))?,
        anchor: raw.anchor.ok_or_else(|| missing("anchor"))?,
        location: raw.location.ok_or_else(|| missing("location"))?,
        explanation: raw.explanation.ok_or_else(|| missing("explanation"))?,
        comparison: raw.comparison.ok_or_else(|| missing("comparison"))?,
        homonyms: raw.homonyms,
        korean_keywords: raw.korean_keywords,
    })
}

/// Parses raw Stage-1 model output into a validated `Stage1Result`.
///
/// Tries, in order: direct strict deserialization, a repair pass
/// (trailing commas, missing commas between adjacent values), then a
/// best-effort per-field regex extraction for text that still isn't
/// valid JSON at all. Every path runs the same `validate`, so a
/// best-effort extraction that's still missing a required field surfaces
/// the same structured "missing field" error a cleanly-parsed-but-empty
/// response would.
pub fn parse(raw: &str) -> Result<Stage1Result, PipelineError> {
    let text = extract_json_text(raw)
        .ok_or_else(|| PipelineError::Parsing("no JSON object found in stage1 output".to_string()))?;

    if let Ok(result) = serde_json::from_str::<Stage1Result>(&text) {
        validate(&result)?;
        return Ok(result);
    }

    let repaired = repair(&text);
    if let Ok(result) = serde_json::from_str::<Stage1Result>(&repaired) {
        validate(&result)?;
        return Ok(result);
    }

    let raw_struct: RawStage1 = match serde_json::from_str(&repaired) {
        Ok(raw) => raw,
        Err(e) => {
            tracing::warn!(
                error = %e,
                "stage1 output unrecoverable as JSON, falling back to per-field regex extraction"
            );
            extract_partial(&repaired)
        }
    };
    let result = from_raw(raw_struct)?;
    validate(&result)?;
    Ok(result)
}
