//! Sheet-row extraction, normalization, and per-entity validation.
//!
//! Everything here is format-tolerant by design: the source spreadsheet is
//! edited by organizers, so headers arrive in mixed case and two languages,
//! dates and times in whatever shape a human typed them. Rows that cannot be
//! normalized into a valid record are dropped whole and reported, never
//! half-inserted.

use std::collections::HashMap;

use chrono::{DateTime, NaiveDate, NaiveDateTime, NaiveTime, Timelike};
use konf_core::{EntityKind, Exhibitor, Participant, ProgramItem};
use thiserror::Error;
use tracing::warn;

pub const CRATE_NAME: &str = "konf-ingest";

/// Column-name aliases recognized per logical field, tried in order.
/// Matching is against lower-cased headers, so these are all lower case.
pub mod aliases {
    pub const PROGRAM_DAY: &[&str] = &["dag"];
    pub const PROGRAM_START: &[&str] = &["start"];
    pub const PROGRAM_END: &[&str] = &["end"];
    pub const PROGRAM_TITLE: &[&str] = &["tittel", "title"];
    pub const PROGRAM_DESCRIPTION: &[&str] = &["beskrivelse", "description"];
    pub const PROGRAM_LOCATION: &[&str] = &["sted", "location"];
    pub const PROGRAM_CATEGORY: &[&str] = &["category"];

    pub const PARTICIPANT_NAME: &[&str] = &["navn", "name"];
    pub const PARTICIPANT_COMPANY: &[&str] = &["bedrift", "company"];

    pub const EXHIBITOR_COMPANY_NAME: &[&str] = &["bedriftsnavn", "company"];
    pub const EXHIBITOR_STAND_NUMBER: &[&str] = &["standnummer", "stand"];
}

#[derive(Debug, Error)]
pub enum IngestError {
    #[error("csv decode failed: {0}")]
    Csv(#[from] csv::Error),
}

/// Result of looking one logical field up in a row. A present-but-empty cell
/// is `Missing`, same as an absent column.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum FieldValue {
    Found(String),
    Missing,
}

impl FieldValue {
    pub fn into_option(self) -> Option<String> {
        match self {
            FieldValue::Found(value) => Some(value),
            FieldValue::Missing => None,
        }
    }

    pub fn is_missing(&self) -> bool {
        matches!(self, FieldValue::Missing)
    }
}

/// One parsed spreadsheet row: lower-cased trimmed header -> trimmed cell.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct SheetRow {
    cells: HashMap<String, String>,
    /// 1-based position among the sheet's data rows, header excluded (the
    /// header sits on spreadsheet row 1, so the spreadsheet row is `line + 1`).
    /// Assigned before empty rows are filtered so rejected rows keep their
    /// original data-row number.
    line: usize,
}

impl SheetRow {
    /// Build a row directly from header/cell pairs. Headers are normalized
    /// the same way `parse_rows` normalizes them.
    pub fn from_cells<'a>(line: usize, cells: impl IntoIterator<Item = (&'a str, &'a str)>) -> Self {
        let mut row = SheetRow {
            cells: HashMap::new(),
            line,
        };
        for (header, value) in cells {
            let header = normalize_header(header);
            if header.is_empty() {
                continue;
            }
            let slot = row.cells.entry(header).or_default();
            if slot.is_empty() {
                *slot = value.trim().to_string();
            }
        }
        row
    }

    pub fn line(&self) -> usize {
        self.line
    }

    /// First non-empty value among the aliased columns, or `Missing`.
    pub fn field(&self, aliases: &[&str]) -> FieldValue {
        for alias in aliases {
            if let Some(value) = self.cells.get(*alias) {
                if !value.is_empty() {
                    return FieldValue::Found(value.clone());
                }
            }
        }
        FieldValue::Missing
    }

    /// True when every cell is empty after trimming.
    pub fn is_empty(&self) -> bool {
        self.cells.values().all(|value| value.is_empty())
    }
}

fn normalize_header(header: &str) -> String {
    header.trim_start_matches('\u{feff}').trim().to_lowercase()
}

/// Decode one sheet's CSV text into rows, dropping fully-empty rows.
///
/// Headers are matched case-insensitively; extra columns are carried along
/// and simply never looked up. Short records are padded with missing cells
/// rather than rejected. Duplicate headers keep the first non-empty cell.
pub fn parse_rows(csv_text: &str) -> Result<Vec<SheetRow>, IngestError> {
    let mut reader = csv::ReaderBuilder::new()
        .flexible(true)
        .from_reader(csv_text.as_bytes());
    let headers: Vec<String> = reader
        .headers()?
        .iter()
        .map(normalize_header)
        .collect();

    let mut rows = Vec::new();
    for (index, record) in reader.records().enumerate() {
        let record = record?;
        let mut row = SheetRow {
            cells: HashMap::new(),
            line: index + 1,
        };
        for (position, header) in headers.iter().enumerate() {
            if header.is_empty() {
                continue;
            }
            let value = record.get(position).unwrap_or("").trim();
            let slot = row.cells.entry(header.clone()).or_default();
            if slot.is_empty() {
                *slot = value.to_string();
            }
        }
        if !row.is_empty() {
            rows.push(row);
        }
    }
    Ok(rows)
}

/// Day-first date formats tried in order, then year-first. Ambiguous
/// `DD/MM` vs `MM/DD` deliberately resolves day-first (European sheets).
const DATE_FORMATS: [&str; 6] = [
    "%Y-%m-%d",
    "%d.%m.%Y",
    "%d/%m/%Y",
    "%d-%m-%Y",
    "%Y.%m.%d",
    "%Y/%m/%d",
];

/// Fallbacks for cells carrying a full timestamp; only the date survives.
const DATETIME_FORMATS: [&str; 3] = [
    "%Y-%m-%d %H:%M:%S",
    "%Y-%m-%dT%H:%M:%S",
    "%d.%m.%Y %H:%M",
];

/// Normalize a free-form date string into a calendar date, or `None` when no
/// known format matches or the date is calendar-invalid.
pub fn normalize_date(raw: &str) -> Option<NaiveDate> {
    let raw = raw.trim();
    // All accepted formats carry a four-digit year; chrono alone would also
    // accept "1.2.26" as year 26.
    if raw.is_empty() || !has_four_digit_run(raw) {
        return None;
    }
    for format in DATE_FORMATS {
        if let Ok(date) = NaiveDate::parse_from_str(raw, format) {
            return Some(date);
        }
    }
    if let Ok(stamp) = DateTime::parse_from_rfc3339(raw) {
        return Some(stamp.date_naive());
    }
    for format in DATETIME_FORMATS {
        if let Ok(stamp) = NaiveDateTime::parse_from_str(raw, format) {
            return Some(stamp.date());
        }
    }
    None
}

fn has_four_digit_run(raw: &str) -> bool {
    raw.as_bytes()
        .windows(4)
        .any(|window| window.iter().all(u8::is_ascii_digit))
}

/// Normalize a free-form time-of-day string into a wall-clock time, or
/// `None` when no known format matches. Seconds are dropped; there is no
/// timezone handling, these are venue-local values.
pub fn normalize_time(raw: &str) -> Option<NaiveTime> {
    let raw = raw.trim();
    if raw.is_empty() {
        return None;
    }
    for format in ["%H:%M", "%H.%M"] {
        if let Ok(time) = NaiveTime::parse_from_str(raw, format) {
            return Some(time);
        }
    }
    // Bare 3-4 digit values ("930", "0930") split at the minute boundary.
    if (3..=4).contains(&raw.len()) && raw.bytes().all(|b| b.is_ascii_digit()) {
        let (hour, minute) = raw.split_at(raw.len() - 2);
        return NaiveTime::from_hms_opt(hour.parse().ok()?, minute.parse().ok()?, 0);
    }
    if let Ok(time) = NaiveTime::parse_from_str(raw, "%H:%M:%S") {
        return time.with_second(0);
    }
    None
}

/// Tidy a comma-separated label list into canonical `a, b, c` form.
pub fn normalize_category(raw: &str) -> Option<String> {
    let labels: Vec<&str> = raw
        .split(',')
        .map(str::trim)
        .filter(|label| !label.is_empty())
        .collect();
    if labels.is_empty() {
        None
    } else {
        Some(labels.join(", "))
    }
}

/// A row dropped by validation, with the reason surfaced to the caller.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RowRejection {
    pub line: usize,
    pub reason: String,
}

impl std::fmt::Display for RowRejection {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "row {}: {}", self.line, self.reason)
    }
}

/// Retained records plus the rejections that explain every dropped row.
#[derive(Debug, Clone, Default)]
pub struct ParseOutcome<T> {
    pub records: Vec<T>,
    pub rejected: Vec<RowRejection>,
}

/// Validate program rows: `dag`, `start`, and `tittel` are required; a row
/// failing any of them is dropped whole. External ids are `p1..pN` over the
/// retained rows.
pub fn parse_program_rows(rows: &[SheetRow]) -> ParseOutcome<ProgramItem> {
    collect_rows(rows, EntityKind::Program, |row, external_id| {
        let day_raw = required_field(row, aliases::PROGRAM_DAY, "dag")?;
        let day = normalize_date(&day_raw)
            .ok_or_else(|| format!("unparseable date '{day_raw}' in required column 'dag'"))?;
        let start_raw = required_field(row, aliases::PROGRAM_START, "start")?;
        let starts_at = normalize_time(&start_raw)
            .ok_or_else(|| format!("unparseable time '{start_raw}' in required column 'start'"))?;
        let title = required_field(row, aliases::PROGRAM_TITLE, "tittel")?;

        // Optional fields never reject the row; an unparseable optional time
        // is simply omitted.
        let ends_at = row
            .field(aliases::PROGRAM_END)
            .into_option()
            .and_then(|raw| normalize_time(&raw));
        let category = row
            .field(aliases::PROGRAM_CATEGORY)
            .into_option()
            .and_then(|raw| normalize_category(&raw));

        Ok(ProgramItem {
            external_id,
            day,
            starts_at,
            ends_at,
            title,
            description: row.field(aliases::PROGRAM_DESCRIPTION).into_option(),
            location: row.field(aliases::PROGRAM_LOCATION).into_option(),
            category,
        })
    })
}

/// Validate participant rows: `navn` is required. External ids are `d1..dN`.
pub fn parse_participant_rows(rows: &[SheetRow]) -> ParseOutcome<Participant> {
    collect_rows(rows, EntityKind::Participants, |row, external_id| {
        let name = required_field(row, aliases::PARTICIPANT_NAME, "navn")?;
        Ok(Participant {
            external_id,
            name,
            company: row.field(aliases::PARTICIPANT_COMPANY).into_option(),
        })
    })
}

/// Validate exhibitor rows: `bedriftsnavn` is required. External ids are
/// `u1..uN`.
pub fn parse_exhibitor_rows(rows: &[SheetRow]) -> ParseOutcome<Exhibitor> {
    collect_rows(rows, EntityKind::Exhibitors, |row, external_id| {
        let company_name = required_field(row, aliases::EXHIBITOR_COMPANY_NAME, "bedriftsnavn")?;
        Ok(Exhibitor {
            external_id,
            company_name,
            stand_number: row.field(aliases::EXHIBITOR_STAND_NUMBER).into_option(),
        })
    })
}

fn required_field(row: &SheetRow, aliases: &[&str], label: &str) -> Result<String, String> {
    row.field(aliases)
        .into_option()
        .ok_or_else(|| format!("missing required column '{label}'"))
}

fn collect_rows<T>(
    rows: &[SheetRow],
    kind: EntityKind,
    build: impl Fn(&SheetRow, String) -> Result<T, String>,
) -> ParseOutcome<T> {
    let mut outcome = ParseOutcome {
        records: Vec::with_capacity(rows.len()),
        rejected: Vec::new(),
    };
    for row in rows {
        let external_id = format!("{}{}", kind.id_prefix(), outcome.records.len() + 1);
        match build(row, external_id) {
            Ok(record) => outcome.records.push(record),
            Err(reason) => {
                warn!(entity = %kind, line = row.line, %reason, "dropping sheet row");
                outcome.rejected.push(RowRejection {
                    line: row.line,
                    reason,
                });
            }
        }
    }
    outcome
}

#[cfg(test)]
mod tests {
    use super::*;

    fn fmt_date(date: NaiveDate) -> String {
        date.format("%Y-%m-%d").to_string()
    }

    fn fmt_time(time: NaiveTime) -> String {
        time.format("%H:%M").to_string()
    }

    #[test]
    fn date_formats_normalize_to_iso() {
        for raw in ["2026-03-15", "15/03/2026", "15.03.2026", "2026/03/15"] {
            let date = normalize_date(raw).unwrap_or_else(|| panic!("{raw} should parse"));
            assert_eq!(fmt_date(date), "2026-03-15", "input {raw}");
        }
    }

    #[test]
    fn ambiguous_day_month_resolves_day_first() {
        let date = normalize_date("03/04/2026").expect("parses");
        assert_eq!(fmt_date(date), "2026-04-03");
    }

    #[test]
    fn unpadded_components_are_accepted() {
        assert_eq!(fmt_date(normalize_date("5.3.2026").unwrap()), "2026-03-05");
        assert_eq!(fmt_date(normalize_date("2026-3-5").unwrap()), "2026-03-05");
    }

    #[test]
    fn timestamp_cells_keep_only_the_date() {
        assert_eq!(
            fmt_date(normalize_date("2026-03-15T09:30:00").unwrap()),
            "2026-03-15"
        );
        assert_eq!(
            fmt_date(normalize_date("2026-03-15 09:30:00").unwrap()),
            "2026-03-15"
        );
    }

    #[test]
    fn bad_dates_are_unparseable() {
        for raw in ["not-a-date", "", "  ", "2026-13-01", "32.01.2026", "1.2.26"] {
            assert_eq!(normalize_date(raw), None, "input {raw:?}");
        }
    }

    #[test]
    fn time_formats_normalize_to_hh_mm() {
        for raw in ["9:30", "09:30", "9.30", "0930", "09:30:00"] {
            let time = normalize_time(raw).unwrap_or_else(|| panic!("{raw} should parse"));
            assert_eq!(fmt_time(time), "09:30", "input {raw}");
        }
        assert_eq!(fmt_time(normalize_time("930").unwrap()), "09:30");
    }

    #[test]
    fn seconds_are_dropped() {
        let time = normalize_time("14:05:59").expect("parses");
        assert_eq!(time, NaiveTime::from_hms_opt(14, 5, 0).unwrap());
    }

    #[test]
    fn bad_times_are_unparseable() {
        for raw in ["", "  ", "25:00", "9:61", "noon", "12345"] {
            assert_eq!(normalize_time(raw), None, "input {raw:?}");
        }
    }

    #[test]
    fn category_lists_are_tidied() {
        assert_eq!(
            normalize_category(" keynote ,  ai,  ").as_deref(),
            Some("keynote, ai")
        );
        assert_eq!(normalize_category(" , ,"), None);
    }

    #[test]
    fn field_lookup_is_case_insensitive_and_ordered() {
        let row = SheetRow::from_cells(1, [("Tittel", "Åpning"), ("Title", "Opening")]);
        assert_eq!(
            row.field(aliases::PROGRAM_TITLE),
            FieldValue::Found("Åpning".to_string())
        );

        let row = SheetRow::from_cells(1, [("TITLE", "Opening"), ("Extra", "ignored")]);
        assert_eq!(
            row.field(aliases::PROGRAM_TITLE),
            FieldValue::Found("Opening".to_string())
        );
    }

    #[test]
    fn empty_cells_count_as_missing() {
        let row = SheetRow::from_cells(1, [("dag", "   "), ("start", "9:00")]);
        assert!(row.field(aliases::PROGRAM_DAY).is_missing());
        assert_eq!(
            row.field(aliases::PROGRAM_START),
            FieldValue::Found("9:00".to_string())
        );
    }

    #[test]
    fn parse_rows_drops_fully_empty_rows_and_strips_bom() {
        let csv = "\u{feff}Dag,Start,Tittel\n15.03.2026,9.30,Åpning\n,,\n16.03.2026,10:00,Keynote\n";
        let rows = parse_rows(csv).expect("decodes");
        assert_eq!(rows.len(), 2);
        assert_eq!(rows[0].line(), 1);
        // Line numbers keep the empty row's slot so later rows don't shift.
        assert_eq!(rows[1].line(), 3);
        assert_eq!(
            rows[0].field(aliases::PROGRAM_DAY),
            FieldValue::Found("15.03.2026".to_string())
        );
    }

    #[test]
    fn short_records_are_padded_not_rejected() {
        let csv = "navn,bedrift\nKari Nordmann\nOla Hansen,Bedrift AS\n";
        let rows = parse_rows(csv).expect("decodes");
        assert_eq!(rows.len(), 2);
        assert!(rows[0].field(aliases::PARTICIPANT_COMPANY).is_missing());
        assert_eq!(
            rows[1].field(aliases::PARTICIPANT_COMPANY),
            FieldValue::Found("Bedrift AS".to_string())
        );
    }

    #[test]
    fn program_rows_missing_required_fields_are_dropped_whole() {
        let csv = "dag,start,tittel\n15.03.2026,9.30,Åpning\n,10:00,Keynote\n";
        let rows = parse_rows(csv).expect("decodes");
        let outcome = parse_program_rows(&rows);

        assert_eq!(outcome.records.len(), 1);
        let item = &outcome.records[0];
        assert_eq!(item.external_id, "p1");
        assert_eq!(fmt_date(item.day), "2026-03-15");
        assert_eq!(fmt_time(item.starts_at), "09:30");
        assert_eq!(item.title, "Åpning");

        assert_eq!(outcome.rejected.len(), 1);
        assert_eq!(outcome.rejected[0].line, 2);
        assert!(outcome.rejected[0].reason.contains("dag"));
    }

    #[test]
    fn external_ids_are_sequential_over_retained_rows() {
        let csv = "dag,start,tittel\n15.03.2026,9:00,A\nbad-date,9:30,B\n15.03.2026,10:00,C\n";
        let rows = parse_rows(csv).expect("decodes");
        let outcome = parse_program_rows(&rows);
        let ids: Vec<&str> = outcome
            .records
            .iter()
            .map(|item| item.external_id.as_str())
            .collect();
        assert_eq!(ids, ["p1", "p2"]);
        assert_eq!(outcome.rejected[0].line, 2);
    }

    #[test]
    fn program_optional_fields_survive_and_bad_end_time_is_omitted() {
        let row = SheetRow::from_cells(
            1,
            [
                ("dag", "15.03.2026"),
                ("start", "9:00"),
                ("end", "not a time"),
                ("tittel", "Åpning"),
                ("Beskrivelse", "Velkommen"),
                ("Sted", "Hovedscenen"),
                ("category", "keynote,ai"),
            ],
        );
        let outcome = parse_program_rows(std::slice::from_ref(&row));
        let item = &outcome.records[0];
        assert_eq!(item.ends_at, None);
        assert_eq!(item.description.as_deref(), Some("Velkommen"));
        assert_eq!(item.location.as_deref(), Some("Hovedscenen"));
        assert_eq!(item.category.as_deref(), Some("keynote, ai"));
    }

    #[test]
    fn participant_rows_require_name_only() {
        let csv = "Navn,Bedrift\nKari Nordmann,Bedrift AS\n,Uten Navn AS\nOla Hansen,\n";
        let rows = parse_rows(csv).expect("decodes");
        let outcome = parse_participant_rows(&rows);

        assert_eq!(outcome.records.len(), 2);
        assert_eq!(outcome.records[0].external_id, "d1");
        assert_eq!(outcome.records[0].company.as_deref(), Some("Bedrift AS"));
        assert_eq!(outcome.records[1].external_id, "d2");
        assert_eq!(outcome.records[1].company, None);
        assert_eq!(outcome.rejected.len(), 1);
        assert!(outcome.rejected[0].reason.contains("navn"));
    }

    #[test]
    fn exhibitor_rows_require_company_name_only() {
        let csv = "bedriftsnavn,standnummer\nTech AS,A-12\nStand Uten Navn,\n";
        let rows = parse_rows(csv).expect("decodes");
        let outcome = parse_exhibitor_rows(&rows);

        assert_eq!(outcome.records.len(), 2);
        assert_eq!(outcome.records[0].external_id, "u1");
        assert_eq!(outcome.records[0].stand_number.as_deref(), Some("A-12"));
        assert_eq!(outcome.records[1].stand_number, None);
        assert!(outcome.rejected.is_empty());
    }

    #[test]
    fn exhibitor_english_aliases_match() {
        let row = SheetRow::from_cells(1, [("Company", "Tech AS"), ("Stand", "B-4")]);
        let outcome = parse_exhibitor_rows(std::slice::from_ref(&row));
        assert_eq!(outcome.records[0].company_name, "Tech AS");
        assert_eq!(outcome.records[0].stand_number.as_deref(), Some("B-4"));
    }
}
