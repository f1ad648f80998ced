use log::error;
use std::env;
use std::path::{Path, PathBuf};
use std::process::ExitCode;

use defect_ledger::app_state::AppState;
use defect_ledger::docx::DocxAutomation;
use defect_ledger::services::reverse_sync::Keywords;
use defect_ledger::snapshot::SnapshotManager;
use defect_ledger::types::Reporter;
use defect_ledger::{Engine, EngineError, RunMode};

struct StdoutReporter;

impl Reporter for StdoutReporter {
    fn log(&self, line: &str) {
        println!("{}", line);
    }

    fn progress(&self, done: usize, total: usize, status: &str) {
        if total > 0 && !status.is_empty() {
            println!("[{}/{}] {}", done, total, status);
        }
    }
}

fn usage() -> &'static str {
    "usage:\n  \
     defect-ledger run <source-dir> <ledger.xlsx>      rebuild the ledger from scratch\n  \
     defect-ledger sync [source-dir] [ledger.xlsx]     reconcile and append new documents\n  \
     defect-ledger update <document> [ledger.xlsx]     re-extract one document\n  \
     defect-ledger reverse-sync [ledger.xlsx]          push outcome columns back into documents\n  \
     defect-ledger undo [ledger.xlsx]\n  \
     defect-ledger redo [ledger.xlsx]\n\n\
     omitted paths default to the ones from the previous run"
}

fn main() -> ExitCode {
    env_logger::Builder::from_env(env_logger::Env::default().default_filter_or("info")).init();
    match run() {
        Ok(()) => ExitCode::SUCCESS,
        Err(e) => {
            error!("{}", e);
            eprintln!("error: {}", e);
            ExitCode::FAILURE
        }
    }
}

fn run() -> Result<(), EngineError> {
    let args: Vec<String> = env::args().skip(1).collect();
    let command = args.first().map(String::as_str).unwrap_or("");

    let state_path = AppState::default_path();
    let mut state = AppState::load(&state_path);

    let engine = Engine::new(
        Box::new(DocxAutomation),
        SnapshotManager::default_dir(),
    )?;
    let reporter = StdoutReporter;

    match command {
        "run" | "sync" => {
            let source = resolve_path(args.get(1), state.source_path.as_deref(), "source folder")?;
            let ledger = resolve_path(args.get(2), state.ledger_path.as_deref(), "ledger file")?;
            let mode = if command == "run" {
                RunMode::Overwrite
            } else {
                RunMode::Incremental
            };
            let report = engine.run_batch(&source, &ledger, mode, &reporter)?;
            remember(&mut state, &state_path, Some(source), ledger);
            println!("{}", serde_json::to_string_pretty(&report).unwrap_or_default());
        }
        "update" => {
            let document = resolve_path(args.get(1), None, "document")?;
            let ledger = resolve_path(args.get(2), state.ledger_path.as_deref(), "ledger file")?;
            let report = engine.update_single(&document, &ledger, &reporter)?;
            remember(&mut state, &state_path, None, ledger);
            println!("{}", serde_json::to_string_pretty(&report).unwrap_or_default());
        }
        "reverse-sync" => {
            let ledger = resolve_path(args.get(1), state.ledger_path.as_deref(), "ledger file")?;
            let report = engine.reverse_sync(&ledger, &Keywords::default(), &reporter)?;
            remember(&mut state, &state_path, None, ledger);
            if report.files_updated == 0 {
                println!(
                    "no documents changed ({} unmatched, {} ambiguous rows); \
                     check that locating fields match between ledger and documents",
                    report.unmatched, report.ambiguous
                );
            }
            println!("{}", serde_json::to_string_pretty(&report).unwrap_or_default());
        }
        "undo" => {
            let ledger = resolve_path(args.get(1), state.ledger_path.as_deref(), "ledger file")?;
            let restored = engine.undo(&ledger)?;
            println!("restored ledger from {}", restored.display());
        }
        "redo" => {
            let ledger = resolve_path(args.get(1), state.ledger_path.as_deref(), "ledger file")?;
            let restored = engine.redo(&ledger)?;
            println!("restored ledger from {}", restored.display());
        }
        _ => {
            eprintln!("{}", usage());
            std::process::exit(2);
        }
    }
    Ok(())
}

fn resolve_path(
    arg: Option<&String>,
    remembered: Option<&Path>,
    what: &str,
) -> Result<PathBuf, EngineError> {
    match arg {
        Some(a) => Ok(PathBuf::from(a)),
        None => remembered
            .map(Path::to_path_buf)
            .ok_or_else(|| EngineError::SourceMissing(PathBuf::from(what))),
    }
}

fn remember(state: &mut AppState, state_path: &Path, source: Option<PathBuf>, ledger: PathBuf) {
    if let Some(s) = source {
        state.source_path = Some(s);
    }
    state.ledger_path = Some(ledger);
    if let Err(e) = state.save(state_path) {
        log::warn!("could not save session state: {}", e);
    }
}
