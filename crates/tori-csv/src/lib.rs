//! CSV report normalization: header + untyped rows, malformed input surfaced as errors.

use std::collections::HashSet;

use csv::{ReaderBuilder, StringRecord};
use thiserror::Error;
use tori_core::{RawReport, ReportRow, TableSchema};
use tracing::debug;

const UTF8_BOM: &[u8] = b"\xEF\xBB\xBF";

#[derive(Debug, Error)]
pub enum ParseError {
    #[error("report has no header line")]
    MissingHeader,
    #[error("header repeats column {column:?}")]
    DuplicateHeader { column: String },
    #[error("row {row} (line {line}) has {found} fields, header has {expected}")]
    ColumnCount {
        row: usize,
        line: u64,
        expected: usize,
        found: usize,
    },
    #[error("malformed csv at row {row}")]
    Csv {
        row: usize,
        #[source]
        source: csv::Error,
    },
}

impl ParseError {
    /// 1-based data row index the error refers to; the header is row 0.
    pub fn row(&self) -> Option<usize> {
        match self {
            ParseError::ColumnCount { row, .. } | ParseError::Csv { row, .. } => Some(*row),
            ParseError::MissingHeader | ParseError::DuplicateHeader { .. } => None,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ParsedReport {
    pub header: TableSchema,
    pub rows: Vec<ReportRow>,
}

#[derive(Debug, Clone, Copy)]
pub struct CsvNormalizer {
    delimiter: u8,
}

impl Default for CsvNormalizer {
    fn default() -> Self {
        Self { delimiter: b',' }
    }
}

impl CsvNormalizer {
    pub fn with_delimiter(delimiter: u8) -> Self {
        Self { delimiter }
    }

    pub fn parse(&self, raw: &RawReport) -> Result<ParsedReport, ParseError> {
        let bytes = raw.as_bytes();
        let bytes = bytes.strip_prefix(UTF8_BOM).unwrap_or(bytes);
        if bytes.iter().all(u8::is_ascii_whitespace) {
            return Err(ParseError::MissingHeader);
        }

        let mut reader = ReaderBuilder::new()
            .delimiter(self.delimiter)
            .has_headers(true)
            .flexible(true)
            .from_reader(bytes);

        let header_record = reader
            .headers()
            .map_err(|source| ParseError::Csv { row: 0, source })?
            .clone();
        let header = header_schema(&header_record)?;

        let mut rows: Vec<ReportRow> = Vec::new();
        let mut record = StringRecord::new();
        let mut row = 0usize;
        loop {
            row += 1;
            let more = reader
                .read_record(&mut record)
                .map_err(|source| ParseError::Csv { row, source })?;
            if !more {
                break;
            }
            if record.len() != header.len() {
                return Err(ParseError::ColumnCount {
                    row,
                    line: record.position().map(|p| p.line()).unwrap_or_default(),
                    expected: header.len(),
                    found: record.len(),
                });
            }
            rows.push(
                header
                    .columns()
                    .iter()
                    .zip(record.iter())
                    .map(|(column, value)| (column.as_str(), value))
                    .collect(),
            );
        }

        debug!(columns = header.len(), rows = rows.len(), "parsed report csv");
        Ok(ParsedReport { header, rows })
    }
}

/// Blank header cells are named `Unnamed: <index>` after their 0-based position.
fn header_schema(record: &StringRecord) -> Result<TableSchema, ParseError> {
    if record.is_empty() {
        return Err(ParseError::MissingHeader);
    }
    let names: Vec<String> = record
        .iter()
        .enumerate()
        .map(|(idx, column)| {
            if column.trim().is_empty() {
                format!("Unnamed: {idx}")
            } else {
                column.to_string()
            }
        })
        .collect();
    let mut seen = HashSet::new();
    for column in &names {
        if !seen.insert(column.as_str()) {
            return Err(ParseError::DuplicateHeader {
                column: column.clone(),
            });
        }
    }
    Ok(TableSchema::new(names))
}
