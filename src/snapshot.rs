//! File-level undo/redo for the ledger. Every mutation is preceded by a
//! timestamped backup copy; undo and redo swap whole files, so they work
//! across process restarts and never depend on in-memory workbook state.
//! Backups are kept indefinitely.

use chrono::Local;
use log::info;
use serde::{Deserialize, Serialize};
use std::fs;
use std::io;
use std::path::{Path, PathBuf};

use crate::error::EngineError;

const STACKS_FILE: &str = "stacks.json";

/// Stack contents persisted beside the backups, so undo history survives
/// process restarts.
#[derive(Debug, Default, Serialize, Deserialize)]
struct Stacks {
    undo: Vec<PathBuf>,
    redo: Vec<PathBuf>,
}

#[derive(Debug)]
pub struct SnapshotManager {
    backup_dir: PathBuf,
    undo: Vec<PathBuf>,
    redo: Vec<PathBuf>,
}

impl SnapshotManager {
    pub fn new(backup_dir: PathBuf) -> Result<Self, EngineError> {
        fs::create_dir_all(&backup_dir)?;
        let mut stacks = match fs::read_to_string(backup_dir.join(STACKS_FILE)) {
            Ok(text) => serde_json::from_str(&text).unwrap_or_default(),
            Err(_) => Stacks::default(),
        };
        // A backup someone deleted by hand is no longer restorable.
        stacks.undo.retain(|p| p.exists());
        stacks.redo.retain(|p| p.exists());
        Ok(SnapshotManager {
            backup_dir,
            undo: stacks.undo,
            redo: stacks.redo,
        })
    }

    fn persist(&self) {
        let stacks = Stacks {
            undo: self.undo.clone(),
            redo: self.redo.clone(),
        };
        if let Ok(json) = serde_json::to_string_pretty(&stacks) {
            let _ = fs::write(self.backup_dir.join(STACKS_FILE), json);
        }
    }

    /// Per-user data directory fallback when no explicit backup dir is
    /// configured.
    pub fn default_dir() -> PathBuf {
        dirs::data_dir()
            .unwrap_or_else(|| PathBuf::from("."))
            .join("defect-ledger")
            .join("backups")
    }

    pub fn can_undo(&self) -> bool {
        !self.undo.is_empty()
    }

    pub fn can_redo(&self) -> bool {
        !self.redo.is_empty()
    }

    /// Copy the ledger into the backup dir under a timestamped name; a
    /// counter suffix resolves same-second collisions.
    fn snapshot(&self, ledger: &Path) -> Result<PathBuf, EngineError> {
        let stamp = Local::now().format("%Y%m%d_%H%M%S").to_string();
        let mut candidate = self.backup_dir.join(format!("ledger_{}.bak.xlsx", stamp));
        let mut n = 1u32;
        while candidate.exists() {
            candidate = self
                .backup_dir
                .join(format!("ledger_{}_{}.bak.xlsx", stamp, n));
            n += 1;
        }
        fs::copy(ledger, &candidate)?;
        Ok(candidate)
    }

    /// Call before the first mutation of an operation. Any redo history is
    /// invalidated by new work.
    pub fn record_pre_mutation(&mut self, ledger: &Path) -> Result<(), EngineError> {
        let backup = self.snapshot(ledger)?;
        info!("snapshot taken: {}", backup.display());
        self.undo.push(backup);
        self.redo.clear();
        self.persist();
        Ok(())
    }

    pub fn undo(&mut self, ledger: &Path) -> Result<PathBuf, EngineError> {
        let target = self.undo.last().cloned().ok_or(EngineError::NothingToUndo)?;
        let current = self.snapshot(ledger)?;
        restore(&target, ledger)?;
        self.undo.pop();
        self.redo.push(current);
        self.persist();
        info!("restored {}", target.display());
        Ok(target)
    }

    pub fn redo(&mut self, ledger: &Path) -> Result<PathBuf, EngineError> {
        let target = self.redo.last().cloned().ok_or(EngineError::NothingToRedo)?;
        let current = self.snapshot(ledger)?;
        restore(&target, ledger)?;
        self.redo.pop();
        self.undo.push(current);
        self.persist();
        info!("restored {}", target.display());
        Ok(target)
    }
}

/// Restore via copy-to-temp plus rename so a crash mid-restore leaves the
/// ledger either old or new, never truncated.
fn restore(backup: &Path, ledger: &Path) -> Result<(), EngineError> {
    let tmp = ledger.with_extension("restore.tmp");
    fs::copy(backup, &tmp)?;
    match fs::rename(&tmp, ledger) {
        Ok(()) => Ok(()),
        Err(e) => {
            let _ = fs::remove_file(&tmp);
            if e.kind() == io::ErrorKind::PermissionDenied {
                Err(EngineError::LedgerBusy(ledger.to_path_buf()))
            } else {
                Err(e.into())
            }
        }
    }
}
