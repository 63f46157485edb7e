//! Stage-2 (Flashcard) output parsing: tab-separated rows, one per tab.
//!
//! The strict variant (reject the whole response on any malformed row)
//! was considered and rejected — a single model hiccup on one tab
//! shouldn't discard seven otherwise-good rows. This parser is
//! tolerant: it skips individually malformed rows and only fails the
//! whole response if zero rows survive.

use crate::error::PipelineError;
use crate::models::{unescape, Stage2Result, Stage2Row, TabName};

/// `spec.md` §4.5: "require >=8 columns" — the 9th (`honorific_level`)
/// is the only field tolerated as absent, defaulting to empty.
const MIN_COLUMNS: usize = 8;

fn looks_like_header(line: &str) -> bool {
    let lower = line.to_ascii_lowercase();
    lower.starts_with("position\t") || lower.starts_with("position,")
}

fn parse_row(line: &str) -> Option<Stage2Row> {
    let fields: Vec<&str> = line.split('\t').collect();
    if fields.len() < MIN_COLUMNS {
        return None;
    }
    let position: u64 = fields[0].trim().parse().ok()?;
    let term_with_ipa = unescape(fields[1]);
    let term_number: u32 = fields[2].trim().parse().ok()?;
    let tab_name = TabName::parse(fields[3])?;
    let primer = unescape(fields[4]);
    let front = unescape(fields[5]);
    let back = unescape(fields[6]);
    let tags = unescape(fields[7]);
    let honorific_level = fields.get(8).map(|f| unescape(f)).unwrap_or_default();

    Some(Stage2Row {
        position,
        term_with_ipa,
        term_number,
        tab_name,
        primer,
        front,
        back,
        tags,
        honorific_level,
    })
}

/// Parses raw Stage-2 model output into a `Stage2Result`.
///
/// An optional header row is recognized and skipped. Each remaining
/// line is parsed independently; a line with too few columns or an
/// out-of-enumeration `tab_name` is dropped rather than failing the
/// batch. The response is rejected only when no row parses at all.
pub fn parse(raw: &str) -> Result<Stage2Result, PipelineError> {
    let mut lines = raw.lines().peekable();
    if let Some(first) = lines.peek() {
        if looks_like_header(first) {
            lines.next();
        }
    }

    let rows: Vec<Stage2Row> = lines
        .map(str::trim_end)
        .filter(|line| !line.trim().is_empty())
        .filter_map(parse_row)
        .collect();

    if rows.is_empty() {
        return Err(PipelineError::Parsing(
            "stage2 output contained no valid rows".to_string(),
        ));
    }

    Ok(Stage2Result { rows })
}

/// Encodes flashcard rows back into the canonical TSV wire format — the
/// counterpart to `parse`, and the encoder a `FlashcardExporter` wraps
/// when the export format is TSV itself rather than a derived format.
pub fn serialize(rows: &[Stage2Row]) -> String {
    Stage2Result { rows: rows.to_vec() }.to_tsv()
}

#[cfg(test)]
mod tests {
    use super::*;

    fn row(position: u64, tab: TabName) -> Stage2Row {
        Stage2Row {
            position,
            term_with_ipa: "안녕 [an.njʌŋ]".into(),
            term_number: 1,
            tab_name: tab,
            primer: "greeting context".into(),
            front: "안녕".into(),
            back: "hello".into(),
            tags: "greeting,casual".into(),
            honorific_level: "casual".into(),
        }
    }

    fn to_line(r: &Stage2Row) -> String {
        format!(
            "{}\t{}\t{}\t{}\t{}\t{}\t{}\t{}\t{}",
            r.position,
            r.term_with_ipa,
            r.term_number,
            r.tab_name.as_str(),
            r.primer,
            r.front,
            r.back,
            r.tags,
            r.honorific_level
        )
    }

    #[test]
    fn parses_rows_without_header() {
        let line = to_line(&row(1, TabName::Scene));
        let result = parse(&line).expect("parses");
        assert_eq!(result.rows.len(), 1);
    }

    #[test]
    fn skips_recognized_header() {
        let body = format!(
            "position\tterm\tterm_number\ttab_name\tprimer\tfront\tback\ttags\thonorific_level\n{}",
            to_line(&row(1, TabName::Hanja))
        );
        let result = parse(&body).expect("parses");
        assert_eq!(result.rows.len(), 1);
    }

    #[test]
    fn drops_row_with_invalid_tab_name_but_keeps_others() {
        let mut bad = to_line(&row(1, TabName::Scene));
        bad = bad.replacen("Scene", "NotARealTab", 1);
        let good = to_line(&row(2, TabName::Grammar));
        let body = format!("{bad}\n{good}");
        let result = parse(&body).expect("parses");
        assert_eq!(result.rows.len(), 1);
        assert_eq!(result.rows[0].position, 2);
    }

    #[test]
    fn eight_columns_defaults_honorific_level() {
        let line = "1\t안녕 [an.njʌŋ]\t1\tScene\tgreeting context\t안녕\thello\tgreeting,casual";
        let result = parse(line).expect("parses with 8 columns");
        assert_eq!(result.rows[0].honorific_level, "");
    }

    #[test]
    fn rejects_when_every_row_is_malformed() {
        assert!(parse("garbage\tnot\tenough\tcolumns").is_err());
    }

    #[test]
    fn rejects_empty_input() {
        assert!(parse("").is_err());
    }

    #[test]
    fn serialize_then_parse_round_trips_rows() {
        let rows = vec![row(1, TabName::Scene), row(2, TabName::Grammar)];
        let tsv = serialize(&rows);
        let result = parse(&tsv).expect("parses its own output");
        assert_eq!(result.rows, rows);
    }
}
