//! Snapshot-based undo/redo around real batch runs.

mod common;

use std::fs;
use std::path::Path;

use tempfile::tempdir;

use defect_ledger::docx::DocxAutomation;
use defect_ledger::types::NullReporter;
use defect_ledger::{Engine, EngineError, RunMode};

fn engine(backup_dir: &Path) -> Engine {
    Engine::new(Box::new(DocxAutomation), backup_dir.to_path_buf()).unwrap()
}

#[test]
fn undo_reverts_a_batch_and_redo_reapplies_it() {
    let dir = tempdir().unwrap();
    let src = dir.path().join("docs");
    fs::create_dir(&src).unwrap();
    common::write_table_docx(
        &src.join("a.docx"),
        &[common::doc_row(&["1", "2024-01-02", "泵房", "设备", "阀门泄漏"])],
    );
    let ledger = dir.path().join("ledger.xlsx");
    common::write_empty_ledger(&ledger);
    let before_run = fs::read(&ledger).unwrap();

    let engine = engine(&dir.path().join("backups"));
    engine
        .run_batch(&src, &ledger, RunMode::Overwrite, &NullReporter)
        .unwrap();
    let after_run = fs::read(&ledger).unwrap();
    assert_ne!(before_run, after_run);

    engine.undo(&ledger).unwrap();
    assert_eq!(fs::read(&ledger).unwrap(), before_run);

    engine.redo(&ledger).unwrap();
    assert_eq!(fs::read(&ledger).unwrap(), after_run);
}

#[test]
fn a_new_mutation_invalidates_redo() {
    let dir = tempdir().unwrap();
    let src = dir.path().join("docs");
    fs::create_dir(&src).unwrap();
    common::write_table_docx(
        &src.join("a.docx"),
        &[common::doc_row(&["1", "2024-01-02", "泵房", "设备", "阀门泄漏"])],
    );
    let ledger = dir.path().join("ledger.xlsx");
    common::write_empty_ledger(&ledger);

    let engine = engine(&dir.path().join("backups"));
    engine
        .run_batch(&src, &ledger, RunMode::Overwrite, &NullReporter)
        .unwrap();
    engine.undo(&ledger).unwrap();

    // Mutating again forks history; the undone run is gone for good.
    engine
        .run_batch(&src, &ledger, RunMode::Overwrite, &NullReporter)
        .unwrap();
    assert!(matches!(
        engine.redo(&ledger),
        Err(EngineError::NothingToRedo)
    ));
}

#[test]
fn undo_with_no_history_refuses() {
    let dir = tempdir().unwrap();
    let ledger = dir.path().join("ledger.xlsx");
    common::write_empty_ledger(&ledger);
    let engine = engine(&dir.path().join("backups"));
    assert!(matches!(
        engine.undo(&ledger),
        Err(EngineError::NothingToUndo)
    ));
}

#[test]
fn chained_undo_walks_back_through_runs() {
    let dir = tempdir().unwrap();
    let src = dir.path().join("docs");
    fs::create_dir(&src).unwrap();
    common::write_table_docx(
        &src.join("a.docx"),
        &[common::doc_row(&["1", "2024-01-02", "泵房", "设备", "阀门泄漏"])],
    );
    let ledger = dir.path().join("ledger.xlsx");
    common::write_empty_ledger(&ledger);
    let v0 = fs::read(&ledger).unwrap();

    let engine = engine(&dir.path().join("backups"));
    engine
        .run_batch(&src, &ledger, RunMode::Overwrite, &NullReporter)
        .unwrap();
    let v1 = fs::read(&ledger).unwrap();

    common::write_table_docx(
        &src.join("b.docx"),
        &[common::doc_row(&["1", "2024-01-05", "机舱", "电气", "线缆破损"])],
    );
    engine
        .run_batch(&src, &ledger, RunMode::Incremental, &NullReporter)
        .unwrap();
    let v2 = fs::read(&ledger).unwrap();
    assert_ne!(v1, v2);

    engine.undo(&ledger).unwrap();
    assert_eq!(fs::read(&ledger).unwrap(), v1);
    engine.undo(&ledger).unwrap();
    assert_eq!(fs::read(&ledger).unwrap(), v0);
}
