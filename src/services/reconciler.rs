//! Ledger/source reconciliation: rows whose provenance no longer points at
//! an existing source document are deleted, partially-blanked rows are
//! pruned, and the serial column is rewritten densely afterwards. Planning
//! is split from applying so the caller can snapshot the ledger only when
//! something will actually change; a consistent ledger stays byte-for-byte
//! untouched.

use log::info;
use std::collections::{BTreeSet, HashSet};
use std::path::Path;

use crate::error::EngineError;
use crate::excel;
use crate::paths;
use crate::sheet_xml;
use crate::types::Reporter;

#[derive(Debug, Default)]
pub struct ReconcilePlan {
    doomed: BTreeSet<u32>,
    removals: Vec<(u32, String)>,
    pub orphans: usize,
    pub partials: usize,
    serials_stale: bool,
}

impl ReconcilePlan {
    pub fn is_noop(&self) -> bool {
        self.doomed.is_empty() && !self.serials_stale
    }
}

#[derive(Debug, Default, Clone, Copy)]
pub struct ReconcileOutcome {
    pub orphans_removed: usize,
    pub partials_pruned: usize,
    pub serials_rewritten: bool,
}

/// Decide which data rows must go: orphans (provenance key absent from
/// `current_paths`) and partials (a serial or provenance entry without
/// content). Also notes whether surviving rows need their serials redone.
pub fn plan(ledger: &Path, current_paths: &HashSet<String>) -> Result<ReconcilePlan, EngineError> {
    let rows = excel::read_data_rows(ledger)?;
    let mut plan = ReconcilePlan::default();

    for row in &rows {
        if !row.source_path.is_empty()
            && !current_paths.contains(&paths::normalize(&row.source_path))
        {
            plan.doomed.insert(row.row);
            plan.removals.push((row.row, row.source_path.clone()));
            plan.orphans += 1;
        } else if !row.has_content()
            && (!row.fields[0].is_empty() || !row.source_path.is_empty())
        {
            plan.doomed.insert(row.row);
            plan.partials += 1;
        }
    }

    // Dense 1..N over the survivors with content, blank elsewhere.
    let mut serial = 0u32;
    for row in &rows {
        if plan.doomed.contains(&row.row) {
            continue;
        }
        if row.has_content() {
            serial += 1;
            if excel::coerce_serial(&row.fields[0]) != serial {
                plan.serials_stale = true;
            }
        } else if !row.fields[0].is_empty() {
            plan.serials_stale = true;
        }
    }

    Ok(plan)
}

pub fn apply(
    ledger: &Path,
    plan: &ReconcilePlan,
    reporter: &dyn Reporter,
) -> Result<ReconcileOutcome, EngineError> {
    let mut outcome = ReconcileOutcome::default();
    if plan.is_noop() {
        return Ok(outcome);
    }

    if !plan.doomed.is_empty() {
        excel::ensure_writable(ledger)?;
        for (row, source) in &plan.removals {
            reporter.log(&format!("removing row {}: source gone: {}", row, source));
        }
        sheet_xml::delete_rows(ledger, &plan.doomed)?;
        outcome.orphans_removed = plan.orphans;
        outcome.partials_pruned = plan.partials;
        info!(
            "deleted {} rows ({} orphans, {} partials)",
            plan.doomed.len(),
            plan.orphans,
            plan.partials
        );
    }

    outcome.serials_rewritten = excel::rewrite_serials(ledger)?;
    Ok(outcome)
}

/// Plan and apply in one step.
pub fn reconcile(
    ledger: &Path,
    current_paths: &HashSet<String>,
    reporter: &dyn Reporter,
) -> Result<ReconcileOutcome, EngineError> {
    let plan = plan(ledger, current_paths)?;
    apply(ledger, &plan, reporter)
}
