//! Trait seams for out-of-scope collaborators: vocabulary ingress and
//! flashcard export. Neither belongs to the processing engine itself —
//! a CSV/DB-backed ingress and a multi-format exporter sit on the other
//! side of these traits in a full deployment — but the engine needs a
//! stable contract to hand results to and pull items from.

use crate::error::PipelineError;
use crate::models::{Stage2Row, VocabularyItem};

/// Supplies the vocabulary items a batch run processes. A CSV reader,
/// a database query, or (in tests) a fixed `Vec` all implement this the
/// same way.
pub trait VocabularyIngress: Send + Sync {
    fn items(&self) -> Vec<VocabularyItem>;
}

/// An in-memory ingress for tests and small scripted runs.
pub struct VecIngress(pub Vec<VocabularyItem>);

impl VocabularyIngress for VecIngress {
    fn items(&self) -> Vec<VocabularyItem> {
        self.0.clone()
    }
}

/// Hands finished flashcard rows to whatever export format a caller
/// wants. This crate ships only the canonical TSV encoder since TSV is
/// already the Stage-2 wire format; a CSV/Anki/JSON exporter is an
/// out-of-scope collaborator implementing the same trait.
pub trait FlashcardExporter: Send + Sync {
    fn export(&self, rows: &[Stage2Row]) -> Result<(), PipelineError>;
}

/// Writes rows as TSV to anything implementing `std::io::Write`.
pub struct TsvExporter<W> {
    writer: std::sync::Mutex<W>,
}

impl<W> TsvExporter<W> {
    pub fn new(writer: W) -> Self {
        Self { writer: std::sync::Mutex::new(writer) }
    }
}

impl<W: std::io::Write + Send> FlashcardExporter for TsvExporter<W> {
    fn export(&self, rows: &[Stage2Row]) -> Result<(), PipelineError> {
        let tsv = crate::parser::stage2::serialize(rows);
        let mut writer = self.writer.lock().map_err(|_| PipelineError::Cache("exporter lock poisoned".to_string()))?;
        writer
            .write_all(tsv.as_bytes())
            .map_err(|e| PipelineError::Cache(format!("failed to write export: {e}")))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::models::{PartOfSpeech, TabName};

    #[test]
    fn vec_ingress_returns_its_items_in_order() {
        let ingress = VecIngress(vec![
            VocabularyItem::new(1, "안녕", PartOfSpeech::Noun),
            VocabularyItem::new(2, "가다", PartOfSpeech::Verb),
        ]);
        let items = ingress.items();
        assert_eq!(items.len(), 2);
        assert_eq!(items[0].position, 1);
        assert_eq!(items[1].position, 2);
    }

    #[test]
    fn tsv_exporter_writes_canonical_rows() {
        let row = Stage2Row {
            position: 1,
            term_with_ipa: "안녕".into(),
            term_number: 1,
            tab_name: TabName::Scene,
            primer: "p".into(),
            front: "f".into(),
            back: "b".into(),
            tags: "t".into(),
            honorific_level: "casual".into(),
        };
        let buf: Vec<u8> = Vec::new();
        let exporter = TsvExporter::new(buf);
        exporter.export(&[row]).unwrap();
        let written = exporter.writer.lock().unwrap().clone();
        let text = String::from_utf8(written).unwrap();
        assert!(text.contains("안녕"));
        assert!(text.starts_with("position\t"));
    }
}
