use std::path::PathBuf;
use thiserror::Error;

use crate::automation::AutomationError;

/// Engine-level error taxonomy. Per-document trouble is reported through
/// warnings and log lines instead; anything here aborts the current
/// operation before a partial ledger write can land.
#[derive(Debug, Error)]
pub enum EngineError {
    /// The ledger is locked by another process (typically open in a
    /// spreadsheet app). Actionable: close the file and retry.
    #[error("ledger file is in use, close it and retry: {}", .0.display())]
    LedgerBusy(PathBuf),

    #[error("source file or folder not found: {}", .0.display())]
    SourceMissing(PathBuf),

    #[error("target ledger not found: {}", .0.display())]
    LedgerMissing(PathBuf),

    #[error("ledger workbook has no worksheet")]
    NoWorksheet,

    #[error("no update columns recognized in the ledger header, refusing to write back")]
    NoUpdateColumns,

    #[error("a batch operation is running, pause or wait before undo/redo")]
    BatchInFlight,

    #[error("nothing to undo")]
    NothingToUndo,

    #[error("nothing to redo")]
    NothingToRedo,

    #[error("workbook error: {0}")]
    Workbook(String),

    #[error("worksheet xml error: {0}")]
    SheetXml(String),

    #[error(transparent)]
    Automation(#[from] AutomationError),

    #[error(transparent)]
    Io(#[from] std::io::Error),
}
