use serde::{Deserialize, Serialize};
use std::path::PathBuf;

/// Number of semantic field columns in every record (and ledger columns 1-13).
pub const FIELD_COLUMNS: usize = 13;

/// One extracted table row: 13 trimmed field values plus the owning document.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DocumentRecord {
    pub fields: Vec<String>,
    pub source_path: PathBuf,
}

impl DocumentRecord {
    /// Build a record from raw cell texts. Cells are sanitized (cell-end
    /// markers and control characters stripped, then trimmed) and padded or
    /// truncated to exactly [`FIELD_COLUMNS`] values. Returns `None` when
    /// every field besides the first is blank - such rows are header noise,
    /// not data.
    pub fn from_cells(cells: Vec<String>, source_path: PathBuf) -> Option<Self> {
        let mut fields: Vec<String> = cells.into_iter().map(|c| sanitize_field(&c)).collect();
        fields.resize(FIELD_COLUMNS, String::new());
        if !fields.iter().skip(1).any(|f| !f.is_empty()) {
            return None;
        }
        Some(DocumentRecord { fields, source_path })
    }

    /// Longest field length in chars, used by the row height model.
    pub fn longest_field_len(&self) -> usize {
        self.fields.iter().map(|f| f.chars().count()).max().unwrap_or(0)
    }
}

/// Strip the automation cell-end markers and control characters, then trim.
pub fn sanitize_field(raw: &str) -> String {
    raw.chars()
        .filter(|&c| c != '\r' && c != '\x07' && (!c.is_control() || c == '\n' || c == '\t'))
        .collect::<String>()
        .trim()
        .to_string()
}

/// Per-document extraction diagnostic. Structural issues never abort a batch.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub enum WarningKind {
    NoTable,
    TooFewRows,
    Unreadable,
}

#[derive(Debug, Clone, Serialize)]
pub struct ExtractionWarning {
    pub path: PathBuf,
    pub kind: WarningKind,
    pub detail: Option<String>,
}

/// How a batch run ended. Cancellations are deliberate stops, distinct from
/// failure in the final report.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub enum RunStatus {
    Completed,
    CancelledByUser,
    StoppedForRestore,
    Failed,
}

impl RunStatus {
    pub fn succeeded(self) -> bool {
        matches!(self, RunStatus::Completed)
    }
}

/// Outcome of `run_batch` / `update_single`.
#[derive(Debug, Clone, Serialize)]
pub struct BatchReport {
    pub status: RunStatus,
    pub files_seen: usize,
    pub records_written: usize,
    pub orphans_removed: usize,
    pub warnings: Vec<ExtractionWarning>,
}

impl BatchReport {
    pub fn empty(status: RunStatus) -> Self {
        BatchReport {
            status,
            files_seen: 0,
            records_written: 0,
            orphans_removed: 0,
            warnings: Vec::new(),
        }
    }
}

/// Outcome of a reverse sync pass. A zero-write run is reported, never
/// silent: the skipped counts tell the operator the matching heuristic could
/// not align any records.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct ReverseSyncReport {
    pub files_updated: usize,
    pub cells_changed: usize,
    pub unmatched: usize,
    pub ambiguous: usize,
    /// Documents whose sync or save failed; their rows stay as they were.
    pub files_failed: usize,
}

/// The two observation channels a caller gets: human-readable log lines and
/// a `(done, total, status_text)` progress triple.
pub trait Reporter: Send + Sync {
    fn log(&self, line: &str);
    fn progress(&self, done: usize, total: usize, status: &str);
}

/// Reporter that discards everything.
pub struct NullReporter;

impl Reporter for NullReporter {
    fn log(&self, _line: &str) {}
    fn progress(&self, _done: usize, _total: usize, _status: &str) {}
}
