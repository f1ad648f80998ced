//! Consolidates defect-record tables from Word documents into a styled
//! Excel ledger, keeps the ledger reconciled with the documents on disk,
//! pushes outcome edits back into the documents, and wraps every mutation
//! in a file-level undo/redo snapshot.

pub mod app_state;
pub mod automation;
pub mod control;
pub mod docx;
pub mod engine;
pub mod error;
pub mod excel;
pub mod paths;
pub mod services;
pub mod sheet_xml;
pub mod snapshot;
pub mod types;

pub use engine::{Engine, RunMode};
pub use error::EngineError;
pub use types::{BatchReport, DocumentRecord, Reporter, ReverseSyncReport, RunStatus};
