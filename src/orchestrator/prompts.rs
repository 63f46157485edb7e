//! Prompt construction for the two model calls. Kept intentionally
//! small: the orchestrator owns wiring the pipeline together, not
//! prompt engineering.

use crate::models::{Stage1Result, VocabularyItem};

pub const STAGE1_SYSTEM_PROMPT: &str =
    "You are a Korean language nuance analyst. Respond with a single JSON object matching the requested schema, nothing else.";

pub const STAGE2_SYSTEM_PROMPT: &str =
    "You are a Korean flashcard writer. Respond with tab-separated rows, one per tab, nothing else.";

pub fn stage1_user_prompt(item: &VocabularyItem) -> String {
    format!(
        "Analyze the Korean term \"{}\" (part of speech: {}). \
         Return JSON with fields: ipa, pos, primary_meaning, metaphor, anchor, \
         location, explanation, comparison (vs, nuance), homonyms, korean_keywords.",
        item.term, item.pos
    )
}

pub fn stage2_user_prompt(item: &VocabularyItem, stage1: &Stage1Result) -> String {
    format!(
        "Generate flashcard rows for the term \"{}\" using this semantic analysis: {}. \
         Emit one tab-separated row per tab (Scene, Usage-Comparison, Hanja, Grammar, \
         Formal-Casual, Example, Cultural) with columns: position, term_with_ipa, \
         term_number, tab_name, primer, front, back, tags, honorific_level.",
        item.term,
        stage1.canonical_json()
    )
}
