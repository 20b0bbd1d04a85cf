//! Identifier list loading.
//!
//! The list is a CSV/TSV file or a spreadsheet (first sheet) with a header
//! row; one named column holds the product identifiers. Order is preserved
//! because checkpoints are positions in this list.

use std::mem::take;
use std::path::{Path, PathBuf};

use calamine::{open_workbook_auto, Data, Reader};

const WORKBOOK_EXTENSIONS: &[&str] = &["xlsx", "xlsm", "xlsb", "xls", "ods"];

#[derive(Debug, thiserror::Error)]
pub enum IdentifierError {
    #[error("failed to read identifier file {path}: {source}")]
    Read {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error("failed to read workbook {path}: {reason}")]
    Workbook { path: PathBuf, reason: String },

    #[error("identifier file {0} is empty")]
    Empty(PathBuf),

    #[error("column '{column}' not found in {path} (found: {found})")]
    MissingColumn {
        path: PathBuf,
        column: String,
        found: String,
    },
}

/// Read the `column` values from `path`, skipping blank cells.
///
/// Spreadsheets are picked by extension; anything else is read as text.
pub async fn load_identifiers(path: &Path, column: &str) -> Result<Vec<String>, IdentifierError> {
    let rows = if is_workbook(path) {
        let owned = path.to_path_buf();
        tokio::task::spawn_blocking(move || read_workbook(&owned))
            .await
            .map_err(|e| IdentifierError::Workbook {
                path: path.to_path_buf(),
                reason: e.to_string(),
            })??
    } else {
        let text = tokio::fs::read_to_string(path)
            .await
            .map_err(|source| IdentifierError::Read {
                path: path.to_path_buf(),
                source,
            })?;
        let text = text.strip_prefix('\u{feff}').unwrap_or(&text);
        parse_rows(text, separator_for(path, text))
    };

    let identifiers = identifiers_from_rows(rows, column).map_err(|e| match e {
        ColumnLookup::Empty => IdentifierError::Empty(path.to_path_buf()),
        ColumnLookup::Missing(found) => IdentifierError::MissingColumn {
            path: path.to_path_buf(),
            column: column.to_string(),
            found,
        },
    })?;

    tracing::info!(
        "Loaded {} identifiers from {}",
        identifiers.len(),
        path.display()
    );
    Ok(identifiers)
}

enum ColumnLookup {
    Empty,
    Missing(String),
}

fn is_workbook(path: &Path) -> bool {
    path.extension()
        .and_then(|e| e.to_str())
        .is_some_and(|ext| WORKBOOK_EXTENSIONS.iter().any(|w| ext.eq_ignore_ascii_case(w)))
}

/// Cells of the first worksheet as text.
fn read_workbook(path: &Path) -> Result<Vec<Vec<String>>, IdentifierError> {
    let workbook_err = |reason: String| IdentifierError::Workbook {
        path: path.to_path_buf(),
        reason,
    };

    let mut workbook = open_workbook_auto(path).map_err(|e| workbook_err(e.to_string()))?;
    let range = workbook
        .worksheet_range_at(0)
        .ok_or_else(|| workbook_err("workbook has no sheets".to_string()))?
        .map_err(|e| workbook_err(e.to_string()))?;

    Ok(range
        .rows()
        .map(|row| row.iter().map(cell_text).collect())
        .collect())
}

/// Whole numbers lose the trailing ".0" spreadsheets give them.
fn cell_text(cell: &Data) -> String {
    match cell {
        Data::Empty => String::new(),
        Data::Int(n) => n.to_string(),
        Data::Float(f) if f.fract() == 0.0 && f.abs() < 1e15 => format!("{}", *f as i64),
        other => other.to_string(),
    }
}

#[cfg(test)]
fn identifiers_from_text(text: &str, sep: char, column: &str) -> Result<Vec<String>, ColumnLookup> {
    identifiers_from_rows(parse_rows(text, sep), column)
}

fn identifiers_from_rows(rows: Vec<Vec<String>>, column: &str) -> Result<Vec<String>, ColumnLookup> {
    let mut rows = rows.into_iter();
    let header = rows.next().ok_or(ColumnLookup::Empty)?;

    let position = header
        .iter()
        .position(|h| h.trim().eq_ignore_ascii_case(column))
        .ok_or_else(|| ColumnLookup::Missing(header.join(", ")))?;

    Ok(rows
        .filter_map(|row| row.into_iter().nth(position))
        .map(|cell| cell.trim().to_string())
        .filter(|cell| !cell.is_empty())
        .collect())
}

/// Tab for `.tsv`/`.tab` files or a tab-separated header, comma otherwise.
fn separator_for(path: &Path, text: &str) -> char {
    let by_ext = path
        .extension()
        .and_then(|e| e.to_str())
        .is_some_and(|e| e.eq_ignore_ascii_case("tsv") || e.eq_ignore_ascii_case("tab"));
    let header = text.lines().next().unwrap_or_default();
    if by_ext || (header.contains('\t') && !header.contains(',')) {
        '\t'
    } else {
        ','
    }
}

/// Quote-aware row splitter; tolerates CRLF and drops empty lines.
fn parse_rows(text: &str, sep: char) -> Vec<Vec<String>> {
    let mut rows = Vec::new();
    let mut field = String::new();
    let mut row = Vec::new();
    let mut in_quotes = false;
    let mut chars = text.chars().peekable();

    while let Some(ch) = chars.next() {
        match ch {
            '"' if in_quotes => {
                if matches!(chars.peek(), Some('"')) {
                    chars.next();
                    field.push('"');
                } else {
                    in_quotes = false;
                }
            }
            '"' => in_quotes = true,
            c if c == sep && !in_quotes => row.push(take(&mut field)),
            '\n' | '\r' if !in_quotes => {
                if ch == '\r' && matches!(chars.peek(), Some('\n')) {
                    chars.next();
                }
                row.push(take(&mut field));
                if row.len() == 1 && row[0].is_empty() {
                    row.clear();
                } else {
                    rows.push(take(&mut row));
                }
            }
            _ => field.push(ch),
        }
    }

    if !field.is_empty() || !row.is_empty() {
        row.push(field);
        rows.push(row);
    }

    rows
}
