//! Ledger spreadsheet I/O. All reads go through calamine; in-place writes go
//! through edit_xlsx so existing workbook content and styles survive; the
//! structural edits edit_xlsx cannot express (row deletion, hidden column)
//! are done by `sheet_xml` on the saved package.

use calamine::{open_workbook_auto, Data, DataType, Range, Reader};
use edit_xlsx::{Format, FormatAlignType, WorkSheetRow, Write};
use std::collections::HashSet;
use std::fs::OpenOptions;
use std::io;
use std::path::Path;

use crate::error::EngineError;
use crate::paths;
use crate::sheet_xml;
use crate::types::{DocumentRecord, FIELD_COLUMNS};

/// Rows 1-3 are header; row 3 doubles as the style template.
pub const TEMPLATE_ROW: u32 = 3;
pub const FIRST_DATA_ROW: u32 = 4;
/// Hidden provenance column.
pub const SOURCE_PATH_COLUMN: u32 = 14;
/// Fallback template row height when the template carries none.
pub const BASE_ROW_HEIGHT: f64 = 45.0;
pub const MAX_ROW_HEIGHT: f64 = 150.0;

/// Column index to Excel letter (0→A, 1→B, 25→Z, 26→AA).
pub fn col_index_to_letter(index: u32) -> String {
    let mut n = index;
    let mut s = String::new();
    loop {
        let r = (n % 26) as u8;
        s.insert(0, (b'A' + r) as char);
        if n < 26 {
            break;
        }
        n = n / 26 - 1;
    }
    s
}

/// One persisted data row, 1-based sheet row index.
#[derive(Debug, Clone)]
pub struct LedgerRow {
    pub row: u32,
    pub fields: Vec<String>,
    pub source_path: String,
}

impl LedgerRow {
    /// A data row must have content somewhere in columns 2-13; the serial
    /// and provenance columns alone do not count.
    pub fn has_content(&self) -> bool {
        self.fields.iter().skip(1).any(|f| !f.is_empty())
    }
}

/// Open the ledger and return its first worksheet range together with the
/// sheet name (the ledger is a single-sheet workbook).
pub fn load_range(path: &Path) -> Result<(String, Range<Data>), EngineError> {
    if !path.exists() {
        return Err(EngineError::LedgerMissing(path.to_path_buf()));
    }
    let mut workbook = open_workbook_auto(path)
        .map_err(|e| EngineError::Workbook(format!("could not open ledger: {}", e)))?;
    let name = workbook
        .sheet_names()
        .first()
        .cloned()
        .ok_or(EngineError::NoWorksheet)?;
    let range = workbook
        .worksheet_range(&name)
        .map_err(|e| EngineError::Workbook(format!("sheet not found: {}", e)))?;
    Ok((name, range))
}

/// Trimmed text of a cell, 1-based row/col; absent cells read as "".
pub fn cell_text(range: &Range<Data>, row: u32, col: u32) -> String {
    range
        .get_value((row - 1, col - 1))
        .and_then(|v| v.as_string())
        .unwrap_or_default()
        .trim()
        .to_string()
}

/// Last populated 1-based row of the range, 0 when the sheet is empty.
pub fn last_row(range: &Range<Data>) -> u32 {
    range.end().map(|(r, _)| r + 1).unwrap_or(0)
}

/// Scan backward for the last row at/after the template row that has a
/// non-blank serial and at least one non-blank field in columns 2..=max_col.
/// Returns 0 when no such row exists.
pub fn find_last_valid_row(range: &Range<Data>, max_col: u32) -> u32 {
    let last = last_row(range);
    for row in (TEMPLATE_ROW..=last).rev() {
        if cell_text(range, row, 1).is_empty() {
            continue;
        }
        if (2..=max_col).any(|c| !cell_text(range, row, c).is_empty()) {
            return row;
        }
    }
    0
}

/// Lenient serial parse: "12", "12.0" -> 12; anything else -> 0.
pub fn coerce_serial(text: &str) -> u32 {
    text.trim()
        .parse::<f64>()
        .ok()
        .filter(|f| f.is_finite() && *f >= 0.0)
        .map(|f| f as u32)
        .unwrap_or(0)
}

/// Row height from content length: one estimated line per 25 chars at 15
/// units each, never below the template height, capped so runaway cells do
/// not blow up the sheet.
pub fn estimate_row_height(longest_field_len: usize, base: f64) -> f64 {
    let est_lines = (longest_field_len as f64 / 25.0) + 1.0;
    base.max(est_lines * 15.0).min(MAX_ROW_HEIGHT)
}

/// Normalized provenance keys currently recorded in column 14, read fresh
/// from the file.
pub fn read_processed_paths(path: &Path) -> Result<HashSet<String>, EngineError> {
    let (_, range) = load_range(path)?;
    let mut set = HashSet::new();
    for row in FIRST_DATA_ROW..=last_row(&range) {
        let v = cell_text(&range, row, SOURCE_PATH_COLUMN);
        if !v.is_empty() {
            set.insert(paths::normalize(&v));
        }
    }
    Ok(set)
}

/// Every sheet row in the data region, including blank ones (callers filter
/// with [`LedgerRow::has_content`]).
pub fn read_data_rows(path: &Path) -> Result<Vec<LedgerRow>, EngineError> {
    let (_, range) = load_range(path)?;
    let mut rows = Vec::new();
    for row in FIRST_DATA_ROW..=last_row(&range) {
        let fields: Vec<String> = (1..=FIELD_COLUMNS as u32)
            .map(|c| cell_text(&range, row, c))
            .collect();
        let source_path = cell_text(&range, row, SOURCE_PATH_COLUMN);
        rows.push(LedgerRow { row, fields, source_path });
    }
    Ok(rows)
}

/// Header text per field column: the lowest non-blank cell within the three
/// header rows, so merged two-tier headers resolve to their most specific
/// caption.
pub fn read_headers(path: &Path) -> Result<Vec<String>, EngineError> {
    let (_, range) = load_range(path)?;
    let mut headers = Vec::with_capacity(FIELD_COLUMNS);
    for col in 1..=FIELD_COLUMNS as u32 {
        let mut text = String::new();
        for row in (1..=TEMPLATE_ROW).rev() {
            let v = cell_text(&range, row, col);
            if !v.is_empty() {
                text = v;
                break;
            }
        }
        headers.push(text);
    }
    Ok(headers)
}

/// Probe the ledger for writability up front so a locked file aborts the
/// operation before any mutation, not halfway through one.
pub fn ensure_writable(path: &Path) -> Result<(), EngineError> {
    match OpenOptions::new().write(true).open(path) {
        Ok(_) => Ok(()),
        Err(e) if e.kind() == io::ErrorKind::PermissionDenied => {
            Err(EngineError::LedgerBusy(path.to_path_buf()))
        }
        Err(e) if e.kind() == io::ErrorKind::NotFound => {
            Err(EngineError::LedgerMissing(path.to_path_buf()))
        }
        Err(e) => Err(e.into()),
    }
}

pub fn open_for_edit(path: &Path) -> Result<edit_xlsx::Workbook, EngineError> {
    edit_xlsx::Workbook::from_path(path).map_err(|e| {
        let msg = e.to_string();
        if msg.contains("permission") || msg.contains("Permission") {
            EngineError::LedgerBusy(path.to_path_buf())
        } else {
            EngineError::Workbook(format!("could not open ledger: {}", msg))
        }
    })
}

pub fn save_workbook(workbook: &mut edit_xlsx::Workbook, path: &Path) -> Result<(), EngineError> {
    workbook.save_as(path).map_err(|e| {
        let msg = e.to_string();
        if msg.contains("Permission denied") || msg.contains("being used") {
            EngineError::LedgerBusy(path.to_path_buf())
        } else {
            EngineError::Workbook(format!("could not save ledger: {}", msg))
        }
    })
}

/// Default data-cell format when the template row has none for a column:
/// small font, top-left aligned so multi-line text stays readable.
fn data_cell_format() -> Format {
    Format::default()
        .set_size(9)
        .set_align(FormatAlignType::Top)
        .set_align(FormatAlignType::Left)
}

/// Per-column formats of the template row, read in a separate read-only
/// open so the later edit pass starts from a clean workbook.
fn read_template_formats(
    path: &Path,
    sheet: &str,
    template_row: u32,
) -> Result<Vec<Option<Format>>, EngineError> {
    use edit_xlsx::Read;
    let mut workbook = open_for_edit(path)?;
    workbook.finish();
    let worksheet = workbook
        .get_worksheet_by_name(sheet)
        .map_err(|e| EngineError::Workbook(format!("sheet not found: {}", e)))?;
    let mut formats = Vec::with_capacity(FIELD_COLUMNS);
    for col in 1..=FIELD_COLUMNS as u32 {
        let fmt = worksheet
            .read_cell((template_row, col))
            .ok()
            .and_then(|cell| cell.format);
        formats.push(fmt);
    }
    Ok(formats)
}

/// Append records to the ledger, or wipe and rewrite the data region when
/// `overwrite` is set. Rows are styled per-column from the template row,
/// serials continue densely from the last valid row, provenance lands in the
/// hidden column. Returns the number of rows written.
///
/// The whole batch is prepared against the in-memory workbook and committed
/// with a single save; a locked ledger surfaces as `LedgerBusy` with nothing
/// partially written. In overwrite mode the new rows replace the old data
/// region in that same save, and any leftover rows beyond it are trimmed
/// afterwards.
pub fn append_or_replace(
    ledger: &Path,
    records: &[DocumentRecord],
    overwrite: bool,
) -> Result<usize, EngineError> {
    ensure_writable(ledger)?;
    let (sheet, range) = load_range(ledger)?;
    let sheet_end = last_row(&range);

    let (template_row, mut serial, start_row) = if overwrite {
        (TEMPLATE_ROW, 0u32, FIRST_DATA_ROW)
    } else {
        let last_valid = find_last_valid_row(&range, FIELD_COLUMNS as u32);
        if last_valid >= TEMPLATE_ROW {
            let serial = coerce_serial(&cell_text(&range, last_valid, 1));
            (last_valid, serial, (last_valid + 1).max(FIRST_DATA_ROW))
        } else {
            (TEMPLATE_ROW, 0u32, FIRST_DATA_ROW)
        }
    };

    let template_formats = read_template_formats(ledger, &sheet, template_row)?;
    let fallback = data_cell_format();

    let mut workbook = open_for_edit(ledger)?;
    let worksheet = workbook
        .get_worksheet_mut_by_name(&sheet)
        .map_err(|e| EngineError::Workbook(format!("sheet not found: {}", e)))?;

    let mut row = start_row;
    let mut wrote = 0usize;
    for record in records {
        // Defensive re-check; extraction already drops noise rows.
        if !record.fields.iter().skip(1).any(|f| !f.is_empty()) {
            continue;
        }
        serial += 1;
        for (i, value) in record.fields.iter().enumerate() {
            let text = if i == 0 { serial.to_string() } else { value.clone() };
            let cell_ref = format!("{}{}", col_index_to_letter(i as u32), row);
            let fmt = template_formats[i].as_ref().unwrap_or(&fallback);
            worksheet
                .write_string_with_format(&cell_ref, text, fmt)
                .map_err(|e| EngineError::Workbook(e.to_string()))?;
        }
        let provenance_ref = format!(
            "{}{}",
            col_index_to_letter(SOURCE_PATH_COLUMN - 1),
            row
        );
        worksheet
            .write_string(&provenance_ref, record.source_path.display().to_string())
            .map_err(|e| EngineError::Workbook(e.to_string()))?;

        let height = estimate_row_height(record.longest_field_len(), BASE_ROW_HEIGHT);
        let row_format = template_formats[0].as_ref().unwrap_or(&fallback);
        let _ = worksheet.set_row_height_with_format(row, height, row_format);

        wrote += 1;
        row += 1;
    }

    save_workbook(&mut workbook, ledger)?;
    if overwrite && sheet_end >= row {
        // Overwrite lands the new batch on top of the old data region
        // first; stale rows past it come out only after that save, so an
        // interrupted run never leaves the ledger emptied.
        let doomed: std::collections::BTreeSet<u32> = (row..=sheet_end).collect();
        sheet_xml::delete_rows(ledger, &doomed)?;
    }
    sheet_xml::hide_column(ledger, SOURCE_PATH_COLUMN)?;
    Ok(wrote)
}

/// Rewrite the serial column so data rows carry a dense 1-based sequence and
/// content-free rows carry none. Returns true when anything changed.
pub fn rewrite_serials(ledger: &Path) -> Result<bool, EngineError> {
    let rows = read_data_rows(ledger)?;
    let mut expected = Vec::new();
    let mut serial = 0u32;
    let mut dirty = false;
    for r in &rows {
        let want = if r.has_content() {
            serial += 1;
            serial.to_string()
        } else {
            String::new()
        };
        if coerce_serial(&r.fields[0]) != coerce_serial(&want) || (want.is_empty() && !r.fields[0].is_empty()) {
            dirty = true;
        }
        expected.push((r.row, want));
    }
    if !dirty {
        return Ok(false);
    }

    let (sheet, _) = load_range(ledger)?;
    let template_formats = read_template_formats(ledger, &sheet, TEMPLATE_ROW)?;
    let fallback = data_cell_format();
    let mut workbook = open_for_edit(ledger)?;
    let worksheet = workbook
        .get_worksheet_mut_by_name(&sheet)
        .map_err(|e| EngineError::Workbook(format!("sheet not found: {}", e)))?;
    for (row, want) in expected {
        let cell_ref = format!("A{}", row);
        let fmt = template_formats[0].as_ref().unwrap_or(&fallback);
        worksheet
            .write_string_with_format(&cell_ref, want, fmt)
            .map_err(|e| EngineError::Workbook(e.to_string()))?;
    }
    save_workbook(&mut workbook, ledger)?;
    sheet_xml::hide_column(ledger, SOURCE_PATH_COLUMN)?;
    Ok(true)
}
