//! The document-automation collaborator, reduced to the capability set the
//! engine needs: open a document, read/write cells of its first table, close
//! with or without saving, plus process-level liveness and kill controls.
//! Any implementation offering these traits is sufficient; the engine never
//! assumes a specific product.

use std::path::Path;
use thiserror::Error;

#[derive(Debug, Error)]
pub enum AutomationError {
    /// The remote-call channel to the automation host died. This specific
    /// signature forces an immediate session restart rather than a bare
    /// retry.
    #[error("automation host remote call unavailable")]
    RemoteCallUnavailable,

    #[error("could not start automation session: {0}")]
    SessionStart(String),

    #[error("could not open document {path}: {reason}")]
    Open { path: String, reason: String },

    #[error("cell ({1},{2}) read failed: {0}")]
    CellRead(String, u32, u32),

    #[error("cell ({1},{2}) write failed: {0}")]
    CellWrite(String, u32, u32),

    #[error("could not save document: {0}")]
    Save(String),

    #[error("document xml is malformed: {0}")]
    Malformed(String),

    #[error(transparent)]
    Io(#[from] std::io::Error),
}

impl AutomationError {
    pub fn is_remote_unavailable(&self) -> bool {
        matches!(self, AutomationError::RemoteCallUnavailable)
    }
}

/// An open document. Row/column indices are 1-based, matching the automation
/// products this abstracts over.
pub trait DocumentHandle {
    /// Number of tables in the document body.
    fn table_count(&self) -> u32;

    /// Row count of the first table (including its header row).
    fn row_count(&self) -> u32;

    fn read_cell(&self, row: u32, col: u32) -> Result<String, AutomationError>;

    fn write_cell(&mut self, row: u32, col: u32, text: &str) -> Result<(), AutomationError>;

    /// Close the document. Pending writes are persisted only when `save` is
    /// true; a read-only pass must close without saving.
    fn close(self: Box<Self>, save: bool) -> Result<(), AutomationError>;
}

/// One live automation session. Not safe for concurrent use; the engine
/// drives at most one active session at a time.
pub trait AutomationSession {
    fn open(&mut self, path: &Path) -> Result<Box<dyn DocumentHandle>, AutomationError>;

    fn is_alive(&self) -> bool;

    /// Terminate the session. Idempotent, best effort.
    fn shutdown(&mut self);
}

/// Factory plus process-level controls for the automation host.
pub trait AutomationHost: Send + Sync {
    fn create_session(&self) -> Result<Box<dyn AutomationSession>, AutomationError>;

    /// Forcibly terminate every instance of the host process. Best effort,
    /// used before session (re)creation and during batch cleanup.
    fn force_kill_all(&self);
}
