//! Batch extraction over an automation host. Documents are processed one at
//! a time through a shared session; per-document failures are retried,
//! degraded to warnings, and never abort the batch. The one failure class
//! treated specially is a dead remote-call channel, which gets the host
//! killed and the session rebuilt; when that happens on consecutive
//! documents, the current document is retried in throwaway sessions of its
//! own so a poisoned host state cannot leak across files.

use log::{info, warn};
use std::fs;
use std::path::{Path, PathBuf};
use tempfile::TempDir;

use crate::automation::{AutomationError, AutomationHost, AutomationSession, DocumentHandle};
use crate::control::{Controls, StopReason};
use crate::error::EngineError;
use crate::types::{DocumentRecord, ExtractionWarning, Reporter, WarningKind, FIELD_COLUMNS};

/// Attempts per document before it is written off as unreadable.
const MAX_ATTEMPTS: u32 = 3;
/// Documents in a row with remote-call failures before the current one is
/// retried in sessions of its own.
const ISOLATION_THRESHOLD: u32 = 2;

#[derive(Debug)]
pub struct ExtractionOutcome {
    pub records: Vec<DocumentRecord>,
    pub warnings: Vec<ExtractionWarning>,
    /// `Some` when the batch ended early on request; records gathered up to
    /// that point are still valid.
    pub stopped: Option<StopReason>,
}

/// Read every table row of every file. Session-start failure is the only
/// hard error; everything per-document becomes a warning.
pub fn extract_batch(
    host: &dyn AutomationHost,
    files: &[PathBuf],
    controls: &Controls,
    reporter: &dyn Reporter,
) -> Result<ExtractionOutcome, EngineError> {
    let mut pipeline = Pipeline::new(host)?;
    let mut outcome = ExtractionOutcome {
        records: Vec::new(),
        warnings: Vec::new(),
        stopped: None,
    };

    let total = files.len();
    for (index, path) in files.iter().enumerate() {
        if let Some(reason) = controls.checkpoint() {
            info!("batch stopped at document boundary: {:?}", reason);
            outcome.stopped = Some(reason);
            break;
        }
        reporter.progress(index, total, &format!("reading {}", path.display()));

        match pipeline.process_document(index, path) {
            Ok(read) => {
                match read.diagnostic {
                    Some(kind) => {
                        let detail = match kind {
                            WarningKind::NoTable => "no table found",
                            WarningKind::TooFewRows => "table has no data rows",
                            _ => "unusable document",
                        };
                        reporter.log(&format!("{}: {}", detail, path.display()));
                        outcome.warnings.push(ExtractionWarning {
                            path: path.clone(),
                            kind,
                            detail: None,
                        });
                    }
                    None => outcome.records.extend(read.records),
                }
            }
            Err(e) => {
                warn!("giving up on {}: {}", path.display(), e);
                reporter.log(&format!("skipped unreadable document: {}", path.display()));
                outcome.warnings.push(ExtractionWarning {
                    path: path.clone(),
                    kind: WarningKind::Unreadable,
                    detail: Some(e.to_string()),
                });
            }
        }
        reporter.progress(index + 1, total, "");
    }

    pipeline.shutdown();
    Ok(outcome)
}

struct DocumentRead {
    records: Vec<DocumentRecord>,
    diagnostic: Option<WarningKind>,
}

struct Pipeline<'a> {
    host: &'a dyn AutomationHost,
    session: Option<Box<dyn AutomationSession>>,
    consecutive_remote_failures: u32,
    isolation: bool,
    scratch: Option<TempDir>,
}

impl<'a> Pipeline<'a> {
    fn new(host: &'a dyn AutomationHost) -> Result<Self, EngineError> {
        let session = host.create_session()?;
        Ok(Pipeline {
            host,
            session: Some(session),
            consecutive_remote_failures: 0,
            isolation: false,
            scratch: None,
        })
    }

    fn shutdown(&mut self) {
        if let Some(mut session) = self.session.take() {
            session.shutdown();
        }
        self.host.force_kill_all();
        self.scratch = None;
    }

    fn process_document(
        &mut self,
        index: usize,
        path: &Path,
    ) -> Result<DocumentRead, AutomationError> {
        let mut last_error = AutomationError::SessionStart("no attempts made".into());
        let mut remote_failed = false;
        for attempt in 1..=MAX_ATTEMPTS {
            // First attempt opens the original; later ones fall back to a
            // short-named scratch copy, which sidesteps path-length and
            // encoding trouble in the automation layer.
            let open_path = if attempt == 1 {
                path.to_path_buf()
            } else {
                match self.scratch_copy(index, path) {
                    Ok(p) => p,
                    Err(e) => {
                        warn!("scratch copy of {} failed: {}", path.display(), e);
                        path.to_path_buf()
                    }
                }
            };

            match self.try_once(&open_path, path) {
                Ok(read) => {
                    self.consecutive_remote_failures = 0;
                    if self.isolation {
                        info!("recovered via isolated session: {}", path.display());
                        self.isolation = false;
                    }
                    return Ok(read);
                }
                Err(e) => {
                    warn!(
                        "attempt {}/{} on {} failed: {}",
                        attempt,
                        MAX_ATTEMPTS,
                        path.display(),
                        e
                    );
                    if e.is_remote_unavailable() {
                        // One count per document, however many attempts it
                        // burns; the counter tracks distinct offenders.
                        if !remote_failed {
                            remote_failed = true;
                            self.note_remote_failure(path);
                        }
                        self.recover_from_remote_failure();
                    }
                    last_error = e;
                }
            }
        }
        self.isolation = false;
        Err(last_error)
    }

    fn try_once(&mut self, open_path: &Path, origin: &Path) -> Result<DocumentRead, AutomationError> {
        if self.isolation {
            // The isolated document runs in throwaway sessions; a poisoned
            // host state cannot leak across files.
            let mut session = self.host.create_session()?;
            let result = read_document(session.as_mut(), open_path, origin);
            session.shutdown();
            return result;
        }

        let rebuild = match &self.session {
            Some(s) => !s.is_alive(),
            None => true,
        };
        if rebuild {
            if let Some(mut old) = self.session.take() {
                old.shutdown();
            }
            self.session = Some(self.host.create_session()?);
        }
        let session = self.session.as_mut().unwrap();
        read_document(session.as_mut(), open_path, origin)
    }

    /// Dead remote channels on consecutive documents point at the host, not
    /// the files; the current document then runs isolated until it resolves.
    fn note_remote_failure(&mut self, path: &Path) {
        self.consecutive_remote_failures += 1;
        if !self.isolation && self.consecutive_remote_failures >= ISOLATION_THRESHOLD {
            info!(
                "remote-call failures on {} documents in a row, isolating {}",
                self.consecutive_remote_failures,
                path.display()
            );
            self.isolation = true;
        }
    }

    fn recover_from_remote_failure(&mut self) {
        if let Some(mut session) = self.session.take() {
            session.shutdown();
        }
        self.host.force_kill_all();
    }

    fn scratch_copy(&mut self, index: usize, path: &Path) -> Result<PathBuf, AutomationError> {
        if self.scratch.is_none() {
            self.scratch = Some(TempDir::new()?);
        }
        let dir = self.scratch.as_ref().unwrap();
        let name = path
            .file_name()
            .map(|n| n.to_string_lossy().into_owned())
            .unwrap_or_else(|| "document.docx".to_string());
        let target = dir
            .path()
            .join(format!("{:04}_{}", index, sanitize_file_name(&name)));
        fs::copy(path, &target)?;
        Ok(target)
    }
}

/// Open one document, read its first table, close without saving.
fn read_document(
    session: &mut dyn AutomationSession,
    open_path: &Path,
    origin: &Path,
) -> Result<DocumentRead, AutomationError> {
    let doc = session.open(open_path)?;
    let read = read_first_table(doc.as_ref(), origin);
    doc.close(false)?;
    read
}

fn read_first_table(
    doc: &dyn DocumentHandle,
    origin: &Path,
) -> Result<DocumentRead, AutomationError> {
    if doc.table_count() == 0 {
        return Ok(DocumentRead {
            records: Vec::new(),
            diagnostic: Some(WarningKind::NoTable),
        });
    }
    let rows = doc.row_count();
    if rows < 2 {
        return Ok(DocumentRead {
            records: Vec::new(),
            diagnostic: Some(WarningKind::TooFewRows),
        });
    }

    let mut records = Vec::new();
    for row in 2..=rows {
        let mut cells = Vec::with_capacity(FIELD_COLUMNS);
        for col in 1..=FIELD_COLUMNS as u32 {
            // A torn cell degrades to blank; one bad cell must not sink
            // the rest of the row.
            cells.push(doc.read_cell(row, col).unwrap_or_default());
        }
        if let Some(record) = DocumentRecord::from_cells(cells, origin.to_path_buf()) {
            records.push(record);
        }
    }
    Ok(DocumentRead {
        records,
        diagnostic: None,
    })
}

/// Replace anything outside a conservative ASCII set so the scratch name is
/// safe for any automation product.
fn sanitize_file_name(name: &str) -> String {
    name.chars()
        .map(|c| {
            if c.is_ascii_alphanumeric() || c == '.' || c == '-' || c == '_' {
                c
            } else {
                '_'
            }
        })
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::types::NullReporter;
    use std::collections::HashMap;
    use std::sync::atomic::{AtomicU32, Ordering};
    use std::sync::Mutex;

    /// Scripted stand-in for a real automation product. Each path maps to a
    /// behavior; open failures are consumed one at a time so a path can fail
    /// N times and then succeed.
    #[derive(Default)]
    struct MockState {
        tables: Mutex<HashMap<String, Vec<Vec<String>>>>,
        no_table: Mutex<Vec<String>>,
        open_failures: Mutex<HashMap<String, u32>>,
        sessions_created: AtomicU32,
        kills: AtomicU32,
    }

    #[derive(Default)]
    struct MockHost {
        state: std::sync::Arc<MockState>,
    }

    impl MockHost {
        fn with_table(self, path: &str, rows: Vec<Vec<&str>>) -> Self {
            self.state.tables.lock().unwrap().insert(
                path.to_string(),
                rows.into_iter()
                    .map(|r| r.into_iter().map(String::from).collect())
                    .collect(),
            );
            self
        }

        fn failing_opens(self, path: &str, count: u32) -> Self {
            self.state
                .open_failures
                .lock()
                .unwrap()
                .insert(path.to_string(), count);
            self
        }

        fn without_table(self, path: &str) -> Self {
            self.state.no_table.lock().unwrap().push(path.to_string());
            self
        }

        fn kills(&self) -> u32 {
            self.state.kills.load(Ordering::SeqCst)
        }

        fn sessions_created(&self) -> u32 {
            self.state.sessions_created.load(Ordering::SeqCst)
        }
    }

    impl AutomationHost for MockHost {
        fn create_session(&self) -> Result<Box<dyn AutomationSession>, AutomationError> {
            self.state.sessions_created.fetch_add(1, Ordering::SeqCst);
            Ok(Box::new(MockSession {
                host: self.state.clone(),
            }))
        }

        fn force_kill_all(&self) {
            self.state.kills.fetch_add(1, Ordering::SeqCst);
        }
    }

    struct MockSession {
        host: std::sync::Arc<MockState>,
    }

    impl AutomationSession for MockSession {
        fn open(&mut self, path: &Path) -> Result<Box<dyn DocumentHandle>, AutomationError> {
            let key = path.to_string_lossy().into_owned();
            let host = &self.host;
            {
                let mut failures = host.open_failures.lock().unwrap();
                if let Some(left) = failures.get_mut(&key) {
                    if *left > 0 {
                        *left -= 1;
                        return Err(AutomationError::RemoteCallUnavailable);
                    }
                }
            }
            if host.no_table.lock().unwrap().contains(&key) {
                return Ok(Box::new(MockDoc { rows: Vec::new(), tables: 0 }));
            }
            match host.tables.lock().unwrap().get(&key) {
                Some(rows) => Ok(Box::new(MockDoc { rows: rows.clone(), tables: 1 })),
                None => Err(AutomationError::Open {
                    path: key,
                    reason: "not scripted".into(),
                }),
            }
        }

        fn is_alive(&self) -> bool {
            true
        }

        fn shutdown(&mut self) {}
    }

    struct MockDoc {
        rows: Vec<Vec<String>>,
        tables: u32,
    }

    impl DocumentHandle for MockDoc {
        fn table_count(&self) -> u32 {
            self.tables
        }

        fn row_count(&self) -> u32 {
            self.rows.len() as u32
        }

        fn read_cell(&self, row: u32, col: u32) -> Result<String, AutomationError> {
            self.rows
                .get(row as usize - 1)
                .and_then(|r| r.get(col as usize - 1))
                .cloned()
                .ok_or_else(|| AutomationError::CellRead("missing".into(), row, col))
        }

        fn write_cell(&mut self, row: u32, col: u32, _text: &str) -> Result<(), AutomationError> {
            Err(AutomationError::CellWrite("read-only mock".into(), row, col))
        }

        fn close(self: Box<Self>, _save: bool) -> Result<(), AutomationError> {
            Ok(())
        }
    }

    fn paths(names: &[&str]) -> Vec<PathBuf> {
        names.iter().map(PathBuf::from).collect()
    }

    #[derive(Default)]
    struct RecordingReporter {
        lines: Mutex<Vec<String>>,
    }

    impl Reporter for RecordingReporter {
        fn log(&self, line: &str) {
            self.lines.lock().unwrap().push(line.to_string());
        }

        fn progress(&self, _done: usize, _total: usize, _status: &str) {}
    }

    #[test]
    fn extracts_data_rows_and_skips_header() {
        let host = MockHost::default().with_table(
            "a.docx",
            vec![
                vec!["序号", "位置", "描述"],
                vec!["1", "pump room", "valve leak"],
                vec!["2", "deck 3", "loose rail"],
            ],
        );
        let controls = Controls::new();
        let outcome =
            extract_batch(&host, &paths(&["a.docx"]), &controls, &NullReporter).unwrap();
        assert_eq!(outcome.records.len(), 2);
        assert_eq!(outcome.records[0].fields[1], "pump room");
        assert_eq!(outcome.records[1].source_path, PathBuf::from("a.docx"));
        assert!(outcome.warnings.is_empty());
        assert!(outcome.stopped.is_none());
    }

    #[test]
    fn remote_failure_kills_host_and_retries() {
        let host = MockHost::default()
            .with_table("a.docx", vec![vec!["h"], vec!["1", "deck", "x"]])
            .failing_opens("a.docx", 1);
        let controls = Controls::new();
        let outcome =
            extract_batch(&host, &paths(&["a.docx"]), &controls, &NullReporter).unwrap();
        assert_eq!(outcome.records.len(), 1);
        assert!(host.kills() >= 1);
    }

    #[test]
    fn persistent_failure_becomes_unreadable_warning() {
        let host = MockHost::default()
            .with_table("bad.docx", vec![vec!["h"], vec!["1", "x", "y"]])
            .failing_opens("bad.docx", 10)
            .with_table("good.docx", vec![vec!["h"], vec!["1", "deck", "ok"]]);
        let controls = Controls::new();
        let outcome = extract_batch(
            &host,
            &paths(&["bad.docx", "good.docx"]),
            &controls,
            &NullReporter,
        )
        .unwrap();
        assert_eq!(outcome.records.len(), 1);
        assert_eq!(outcome.warnings.len(), 1);
        assert_eq!(outcome.warnings[0].kind, WarningKind::Unreadable);
        // Each remote failure kills the session; every retry and the good
        // document each get a fresh one.
        assert_eq!(host.sessions_created(), 4);
        assert!(host.kills() >= 3);
    }

    #[test]
    fn recovered_document_does_not_poison_the_shared_session() {
        // One document failing repeatedly counts once, so no isolation: the
        // next document rides the session the last retry rebuilt.
        let host = MockHost::default()
            .with_table("flaky.docx", vec![vec!["h"], vec!["1", "deck", "x"]])
            .failing_opens("flaky.docx", 2)
            .with_table("good.docx", vec![vec!["h"], vec!["1", "deck", "ok"]]);
        let controls = Controls::new();
        let outcome = extract_batch(
            &host,
            &paths(&["flaky.docx", "good.docx"]),
            &controls,
            &NullReporter,
        )
        .unwrap();
        assert_eq!(outcome.records.len(), 2);
        assert!(outcome.warnings.is_empty());
        // Initial session plus one rebuild per remote failure; good.docx
        // opens no session of its own.
        assert_eq!(host.sessions_created(), 3);
    }

    #[test]
    fn second_offending_document_is_isolated_then_released() {
        let host = MockHost::default()
            .with_table("bad.docx", vec![vec!["h"], vec!["1", "x", "y"]])
            .failing_opens("bad.docx", 10)
            .with_table("flaky.docx", vec![vec!["h"], vec!["1", "deck", "x"]])
            .failing_opens("flaky.docx", 1)
            .with_table("good.docx", vec![vec!["h"], vec!["1", "deck", "ok"]]);
        let controls = Controls::new();
        let outcome = extract_batch(
            &host,
            &paths(&["bad.docx", "flaky.docx", "good.docx"]),
            &controls,
            &NullReporter,
        )
        .unwrap();
        assert_eq!(outcome.records.len(), 2);
        assert_eq!(outcome.warnings.len(), 1);
        // bad.docx: initial session plus two rebuilds. flaky.docx: one
        // rebuild, then its second failed document in a row trips
        // isolation, so the retry runs in a throwaway session. good.docx:
        // isolation released, back on a shared session.
        assert_eq!(host.sessions_created(), 6);
    }

    #[test]
    fn missing_table_is_a_warning_not_an_error() {
        let host = MockHost::default()
            .without_table("empty.docx")
            .with_table("full.docx", vec![vec!["h"], vec!["1", "deck", "ok"]]);
        let controls = Controls::new();
        let reporter = RecordingReporter::default();
        let outcome = extract_batch(
            &host,
            &paths(&["empty.docx", "full.docx"]),
            &controls,
            &reporter,
        )
        .unwrap();
        assert_eq!(outcome.records.len(), 1);
        assert_eq!(outcome.warnings.len(), 1);
        assert_eq!(outcome.warnings[0].kind, WarningKind::NoTable);
        // The run log names the skipped document, not just the warning list.
        let lines = reporter.lines.lock().unwrap();
        assert!(lines.iter().any(|l| l.contains("no table") && l.contains("empty.docx")));
    }

    #[test]
    fn stop_request_ends_batch_at_boundary() {
        let host = MockHost::default()
            .with_table("a.docx", vec![vec!["h"], vec!["1", "deck", "ok"]])
            .with_table("b.docx", vec![vec!["h"], vec!["1", "deck", "ok"]]);
        let controls = Controls::new();
        controls.request_stop(StopReason::Cancel);
        let outcome = extract_batch(
            &host,
            &paths(&["a.docx", "b.docx"]),
            &controls,
            &NullReporter,
        )
        .unwrap();
        assert_eq!(outcome.stopped, Some(StopReason::Cancel));
        assert!(outcome.records.is_empty());
    }

    #[test]
    fn scratch_names_are_ascii_safe() {
        assert_eq!(sanitize_file_name("隐患 台账(3).docx"), "______3_.docx");
    }
}
