//! Top-level orchestration: enumerate source documents, extract, reconcile,
//! write the ledger, reverse-sync, undo/redo. One mutating operation runs at
//! a time; a backup snapshot is taken right before the first real mutation
//! of each run, so a no-op run leaves both the ledger and the undo stack
//! untouched.

use log::info;
use std::collections::HashSet;
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};
use std::thread;
use std::time::Duration;
use walkdir::WalkDir;

use crate::automation::AutomationHost;
use crate::control::{Controls, StopReason};
use crate::error::EngineError;
use crate::excel;
use crate::paths;
use crate::services::{extractor, reconciler, reverse_sync};
use crate::snapshot::SnapshotManager;
use crate::types::{BatchReport, Reporter, ReverseSyncReport, RunStatus};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RunMode {
    /// Wipe the data region and rebuild it from every document found.
    Overwrite,
    /// Reconcile orphans, then append rows only for documents the ledger
    /// has not recorded yet.
    Incremental,
}

pub struct Engine {
    host: Box<dyn AutomationHost>,
    snapshots: Mutex<SnapshotManager>,
    controls: Arc<Controls>,
    running: AtomicBool,
}

struct RunGuard<'a>(&'a AtomicBool);

impl Drop for RunGuard<'_> {
    fn drop(&mut self) {
        self.0.store(false, Ordering::SeqCst);
    }
}

impl Engine {
    pub fn new(host: Box<dyn AutomationHost>, backup_dir: PathBuf) -> Result<Self, EngineError> {
        Ok(Engine {
            host,
            snapshots: Mutex::new(SnapshotManager::new(backup_dir)?),
            controls: Arc::new(Controls::new()),
            running: AtomicBool::new(false),
        })
    }

    /// Shared pause/cancel flags, safe to hand to a UI or signal handler.
    pub fn controls(&self) -> Arc<Controls> {
        self.controls.clone()
    }

    fn begin_run(&self) -> Result<RunGuard<'_>, EngineError> {
        if self.running.swap(true, Ordering::SeqCst) {
            return Err(EngineError::BatchInFlight);
        }
        self.controls.reset();
        Ok(RunGuard(&self.running))
    }

    /// Extract every document under `source` and consolidate into `ledger`.
    pub fn run_batch(
        &self,
        source: &Path,
        ledger: &Path,
        mode: RunMode,
        reporter: &dyn Reporter,
    ) -> Result<BatchReport, EngineError> {
        let _guard = self.begin_run()?;
        excel::ensure_writable(ledger)?;

        let files = enumerate_documents(source)?;
        let mut report = BatchReport::empty(RunStatus::Completed);
        report.files_seen = files.len();
        info!("found {} documents under {}", files.len(), source.display());

        let current_keys: HashSet<String> = files
            .iter()
            .map(|p| paths::normalize_path(p))
            .collect();

        // Snapshot lazily: the first closure call per run copies the ledger
        // aside, later calls are no-ops.
        let mut snapshotted = false;
        let mut ensure_snapshot = |snaps: &Mutex<SnapshotManager>| -> Result<(), EngineError> {
            if !snapshotted {
                snaps.lock().unwrap().record_pre_mutation(ledger)?;
                snapshotted = true;
            }
            Ok(())
        };

        let to_extract: Vec<PathBuf> = match mode {
            RunMode::Overwrite => files,
            RunMode::Incremental => {
                let plan = reconciler::plan(ledger, &current_keys)?;
                if !plan.is_noop() {
                    ensure_snapshot(&self.snapshots)?;
                    let outcome = reconciler::apply(ledger, &plan, reporter)?;
                    report.orphans_removed = outcome.orphans_removed;
                }
                let processed = excel::read_processed_paths(ledger)?;
                files
                    .into_iter()
                    .filter(|p| !processed.contains(&paths::normalize_path(p)))
                    .collect()
            }
        };

        let outcome = extractor::extract_batch(
            self.host.as_ref(),
            &to_extract,
            &self.controls,
            reporter,
        )?;
        report.warnings = outcome.warnings;

        if let Some(reason) = outcome.stopped {
            report.status = stop_status(reason);
            reporter.log("run stopped before the ledger write");
            return Ok(report);
        }

        let rebuild = mode == RunMode::Overwrite;
        if rebuild || !outcome.records.is_empty() {
            ensure_snapshot(&self.snapshots)?;
            report.records_written = excel::append_or_replace(ledger, &outcome.records, rebuild)?;
        }

        reporter.log(&format!(
            "batch done: {} files, {} rows written, {} orphans removed, {} warnings",
            report.files_seen,
            report.records_written,
            report.orphans_removed,
            report.warnings.len()
        ));
        Ok(report)
    }

    /// Re-extract one document and replace its ledger rows in place.
    pub fn update_single(
        &self,
        document: &Path,
        ledger: &Path,
        reporter: &dyn Reporter,
    ) -> Result<BatchReport, EngineError> {
        let _guard = self.begin_run()?;
        if !document.is_file() {
            return Err(EngineError::SourceMissing(document.to_path_buf()));
        }
        excel::ensure_writable(ledger)?;

        let key = paths::normalize_path(document);
        let doomed: std::collections::BTreeSet<u32> = excel::read_data_rows(ledger)?
            .iter()
            .filter(|r| paths::normalize(&r.source_path) == key)
            .map(|r| r.row)
            .collect();

        let outcome = extractor::extract_batch(
            self.host.as_ref(),
            std::slice::from_ref(&document.to_path_buf()),
            &self.controls,
            reporter,
        )?;

        let mut report = BatchReport::empty(RunStatus::Completed);
        report.files_seen = 1;
        report.warnings = outcome.warnings;
        if let Some(reason) = outcome.stopped {
            report.status = stop_status(reason);
            return Ok(report);
        }

        if doomed.is_empty() && outcome.records.is_empty() {
            return Ok(report);
        }

        self.snapshots.lock().unwrap().record_pre_mutation(ledger)?;
        if !doomed.is_empty() {
            crate::sheet_xml::delete_rows(ledger, &doomed)?;
            report.orphans_removed = doomed.len();
        }
        report.records_written = excel::append_or_replace(ledger, &outcome.records, false)?;
        excel::rewrite_serials(ledger)?;
        Ok(report)
    }

    /// Push ledger outcome columns back into the source documents. The
    /// ledger itself is read-only here, so no snapshot is taken.
    pub fn reverse_sync(
        &self,
        ledger: &Path,
        keywords: &reverse_sync::Keywords,
        reporter: &dyn Reporter,
    ) -> Result<ReverseSyncReport, EngineError> {
        let _guard = self.begin_run()?;
        reverse_sync::reverse_sync(self.host.as_ref(), ledger, keywords, reporter)
    }

    pub fn undo(&self, ledger: &Path) -> Result<PathBuf, EngineError> {
        self.yield_running_batch()?;
        self.snapshots.lock().unwrap().undo(ledger)
    }

    pub fn redo(&self, ledger: &Path) -> Result<PathBuf, EngineError> {
        self.yield_running_batch()?;
        self.snapshots.lock().unwrap().redo(ledger)
    }

    /// A restore during an active batch is allowed only when the batch is
    /// paused: it is asked to stop, and the restore waits for it to yield
    /// the ledger.
    fn yield_running_batch(&self) -> Result<(), EngineError> {
        if !self.running.load(Ordering::SeqCst) {
            return Ok(());
        }
        if !self.controls.is_paused() {
            return Err(EngineError::BatchInFlight);
        }
        self.controls.request_stop(StopReason::Restore);
        while self.running.load(Ordering::SeqCst) {
            thread::sleep(Duration::from_millis(50));
        }
        Ok(())
    }
}

/// All Word documents under `source` (or `source` itself when it is a
/// file), sorted for deterministic processing order. Owner/lock files
/// (`~$...`) are skipped.
pub fn enumerate_documents(source: &Path) -> Result<Vec<PathBuf>, EngineError> {
    if !source.exists() {
        return Err(EngineError::SourceMissing(source.to_path_buf()));
    }
    if source.is_file() {
        return Ok(vec![source.to_path_buf()]);
    }
    let mut files: Vec<PathBuf> = WalkDir::new(source)
        .into_iter()
        .filter_map(|e| e.ok())
        .filter(|e| e.file_type().is_file())
        .map(|e| e.into_path())
        .filter(|p| is_document(p))
        .collect();
    files.sort();
    Ok(files)
}

/// A stop forced by a pending restore is not a user cancellation; undo and
/// redo rely on the caller seeing the difference.
fn stop_status(reason: StopReason) -> RunStatus {
    match reason {
        StopReason::Cancel => RunStatus::CancelledByUser,
        StopReason::Restore => RunStatus::StoppedForRestore,
    }
}

fn is_document(path: &Path) -> bool {
    let name = match path.file_name().and_then(|n| n.to_str()) {
        Some(n) => n,
        None => return false,
    };
    if name.starts_with("~$") {
        return false;
    }
    matches!(
        path.extension().and_then(|e| e.to_str()),
        Some(ext) if ext.eq_ignore_ascii_case("docx") || ext.eq_ignore_ascii_case("doc")
    )
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::fs;
    use tempfile::tempdir;

    #[test]
    fn document_filter() {
        assert!(is_document(Path::new("检查记录.docx")));
        assert!(is_document(Path::new("report.DOC")));
        assert!(!is_document(Path::new("~$检查记录.docx")));
        assert!(!is_document(Path::new("notes.txt")));
        assert!(!is_document(Path::new("ledger.xlsx")));
    }

    #[test]
    fn enumeration_recurses_and_sorts() {
        let dir = tempdir().unwrap();
        fs::create_dir(dir.path().join("sub")).unwrap();
        fs::write(dir.path().join("b.docx"), b"x").unwrap();
        fs::write(dir.path().join("sub/a.docx"), b"x").unwrap();
        fs::write(dir.path().join("~$b.docx"), b"x").unwrap();
        fs::write(dir.path().join("skip.txt"), b"x").unwrap();

        let files = enumerate_documents(dir.path()).unwrap();
        let names: Vec<_> = files
            .iter()
            .map(|p| p.strip_prefix(dir.path()).unwrap().to_string_lossy().into_owned())
            .collect();
        assert_eq!(names, vec!["b.docx", "sub/a.docx"]);
    }

    #[test]
    fn restore_stop_is_not_a_cancellation() {
        assert_eq!(stop_status(StopReason::Restore), RunStatus::StoppedForRestore);
        assert_eq!(stop_status(StopReason::Cancel), RunStatus::CancelledByUser);
    }

    #[test]
    fn missing_source_is_an_error() {
        assert!(matches!(
            enumerate_documents(Path::new("/no/such/dir")),
            Err(EngineError::SourceMissing(_))
        ));
    }
}
