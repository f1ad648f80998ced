//! Reverse sync: push outcome fields (status, close-out, resolution) from
//! ledger rows back into the source documents they came from. Document rows
//! carry no stable id, so rows are aligned heuristically: key columns build
//! a primary key, the remaining base columns break collisions by score, and
//! anything ambiguous is skipped rather than guessed. Only safe, attributed
//! writes land.

use log::{info, warn};
use std::collections::{HashMap, HashSet};
use std::path::{Path, PathBuf};

use crate::automation::{AutomationHost, DocumentHandle};
use crate::error::EngineError;
use crate::excel;
use crate::paths;
use crate::types::{sanitize_field, Reporter, ReverseSyncReport, FIELD_COLUMNS};

/// Header keywords that classify ledger columns. Both vocabularies ship
/// bilingual defaults and are injectable for ledgers with unusual headers.
#[derive(Debug, Clone)]
pub struct Keywords {
    pub update: Vec<String>,
    pub key: Vec<String>,
}

impl Default for Keywords {
    fn default() -> Self {
        // Outcome vocabulary must not overlap locating captions: the bare
        // 整改 stem also appears in 整改要求/整改期限, which identify a row
        // rather than record its outcome.
        let update = [
            "销号", "闭环", "整改情况", "处理", "状态", "完成情况", "落实",
            "closed", "close-out", "status", "outcome", "resolution",
        ];
        let key = [
            "地点", "位置", "区域", "类型", "描述", "内容", "部位",
            "发现时间", "日期", "时间",
            "location", "area", "type", "desc", "date", "found", "discover",
        ];
        Keywords {
            update: update.iter().map(|s| s.to_string()).collect(),
            key: key.iter().map(|s| s.to_string()).collect(),
        }
    }
}

/// Field-column roles, 0-based indices into a record's 13 fields. The
/// serial column never participates: document-local numbering and ledger
/// serials drift apart by design of the consolidation.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ColumnRoles {
    pub update: Vec<usize>,
    pub key: Vec<usize>,
    pub base: Vec<usize>,
}

pub fn classify_columns(headers: &[String], keywords: &Keywords) -> ColumnRoles {
    let mut update = Vec::new();
    let mut key = Vec::new();
    let mut base = Vec::new();
    for (i, header) in headers.iter().enumerate().take(FIELD_COLUMNS) {
        if i == 0 {
            continue;
        }
        let h = header.to_lowercase();
        if keywords.update.iter().any(|k| h.contains(&k.to_lowercase())) {
            update.push(i);
            continue;
        }
        base.push(i);
        if keywords.key.iter().any(|k| h.contains(&k.to_lowercase())) {
            key.push(i);
        }
    }
    ColumnRoles { update, key, base }
}

/// Matching normalization: trimmed, control characters dropped, internal
/// whitespace collapsed, casefolded. Looser than storage sanitization on
/// purpose; cosmetic edits must not break row identity.
pub fn normalize_text(s: &str) -> String {
    s.chars()
        .filter(|c| !c.is_control())
        .collect::<String>()
        .split_whitespace()
        .collect::<Vec<_>>()
        .join(" ")
        .to_lowercase()
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RowMatch {
    /// Index into the candidate slice.
    Matched(usize),
    Unmatched,
    Ambiguous,
}

fn primary_key(fields: &[String], key_cols: &[usize]) -> String {
    let parts: Vec<String> = key_cols
        .iter()
        .map(|&c| normalize_text(&fields[c]))
        .filter(|p| !p.is_empty())
        .collect();
    parts.join("\u{1}")
}

fn signature_equal(a: &[String], b: &[String], base_cols: &[usize]) -> bool {
    base_cols
        .iter()
        .all(|&c| normalize_text(&a[c]) == normalize_text(&b[c]))
}

fn score(ledger: &[String], doc: &[String], base_cols: &[usize]) -> usize {
    base_cols
        .iter()
        .filter(|&&c| {
            let a = normalize_text(&ledger[c]);
            !a.is_empty() && a == normalize_text(&doc[c])
        })
        .count()
}

fn best_scored(
    ledger: &[String],
    candidates: &[(usize, &[String])],
    base_cols: &[usize],
    threshold: usize,
) -> RowMatch {
    let mut best = 0usize;
    let mut best_idx = None;
    let mut tied = false;
    for (idx, doc) in candidates {
        let s = score(ledger, doc, base_cols);
        if s > best {
            best = s;
            best_idx = Some(*idx);
            tied = false;
        } else if s == best && s > 0 {
            tied = true;
        }
    }
    if best < threshold {
        return RowMatch::Unmatched;
    }
    if tied {
        return RowMatch::Ambiguous;
    }
    match best_idx {
        Some(i) => RowMatch::Matched(i),
        None => RowMatch::Unmatched,
    }
}

fn div_ceil(n: usize, d: usize) -> usize {
    (n + d - 1) / d
}

/// Align one ledger row against the document's not-yet-claimed rows. Each
/// table row is usable at most once per sync pass, so already-matched rows
/// are excluded up front.
pub fn match_row(
    ledger_fields: &[String],
    doc_rows: &[Vec<String>],
    roles: &ColumnRoles,
    used: &HashSet<usize>,
) -> RowMatch {
    let all: Vec<(usize, &[String])> = doc_rows
        .iter()
        .enumerate()
        .filter(|(i, _)| !used.contains(i))
        .map(|(i, r)| (i, r.as_slice()))
        .collect();

    let pk = primary_key(ledger_fields, &roles.key);
    if !pk.is_empty() {
        let cands: Vec<(usize, &[String])> = all
            .iter()
            .filter(|(_, r)| primary_key(r, &roles.key) == pk)
            .cloned()
            .collect();
        if cands.len() == 1 && signature_equal(ledger_fields, cands[0].1, &roles.base) {
            return RowMatch::Matched(cands[0].0);
        }
        if !cands.is_empty() {
            // Key collision: demand a clear winner on base-field agreement.
            let threshold = 2.max(div_ceil(roles.base.len(), 3));
            return best_scored(ledger_fields, &cands, &roles.base, threshold);
        }
    }

    // No usable key: a stricter whole-table scan.
    let threshold = 3.max(div_ceil(roles.base.len(), 2));
    best_scored(ledger_fields, &all, &roles.base, threshold)
}

/// Push update-column values from the ledger back into every source
/// document it references. The ledger itself is never written.
pub fn reverse_sync(
    host: &dyn AutomationHost,
    ledger: &Path,
    keywords: &Keywords,
    reporter: &dyn Reporter,
) -> Result<ReverseSyncReport, EngineError> {
    let headers = excel::read_headers(ledger)?;
    let roles = classify_columns(&headers, keywords);
    if roles.update.is_empty() {
        return Err(EngineError::NoUpdateColumns);
    }
    info!(
        "column roles: update={:?} key={:?} base={:?}",
        roles.update, roles.key, roles.base
    );

    // Group ledger rows by provenance so each document opens once.
    let mut by_doc: HashMap<String, (PathBuf, Vec<Vec<String>>)> = HashMap::new();
    let mut order: Vec<String> = Vec::new();
    for row in excel::read_data_rows(ledger)? {
        if !row.has_content() || row.source_path.is_empty() {
            continue;
        }
        let norm = paths::normalize(&row.source_path);
        let entry = by_doc
            .entry(norm.clone())
            .or_insert_with(|| (PathBuf::from(&row.source_path), Vec::new()));
        if entry.1.is_empty() {
            order.push(norm);
        }
        entry.1.push(row.fields);
    }

    let mut report = ReverseSyncReport::default();
    let mut session = host.create_session()?;
    let total = order.len();

    for (done, norm) in order.iter().enumerate() {
        let (doc_path, ledger_rows) = &by_doc[norm];
        reporter.progress(done, total, &format!("syncing {}", doc_path.display()));

        if !doc_path.exists() {
            warn!("source gone, rows left untouched: {}", doc_path.display());
            report.unmatched += ledger_rows.len();
            continue;
        }

        let mut doc = match session.open(doc_path) {
            Ok(d) => d,
            Err(e) => {
                warn!("could not open {}: {}", doc_path.display(), e);
                reporter.log(&format!("skipped document: {}", doc_path.display()));
                report.unmatched += ledger_rows.len();
                continue;
            }
        };

        match sync_document(doc.as_mut(), ledger_rows, &roles, &mut report) {
            Ok(changed) => match doc.close(changed > 0) {
                Ok(()) if changed > 0 => {
                    report.files_updated += 1;
                    report.cells_changed += changed;
                    reporter.log(&format!(
                        "updated {} cells in {}",
                        changed,
                        doc_path.display()
                    ));
                }
                Ok(()) => {}
                Err(e) => {
                    // A failed save loses this document's writes, nothing
                    // more; the rest of the pass proceeds.
                    warn!("could not save {}: {}", doc_path.display(), e);
                    reporter.log(&format!("save failed, skipped: {}", doc_path.display()));
                    report.files_failed += 1;
                }
            },
            Err(e) => {
                warn!("sync of {} failed: {}", doc_path.display(), e);
                // Discard partial writes; the document stays as it was.
                let _ = doc.close(false);
                report.unmatched += ledger_rows.len();
                report.files_failed += 1;
            }
        }
    }

    session.shutdown();
    host.force_kill_all();
    reporter.progress(total, total, "reverse sync finished");
    Ok(report)
}

/// Returns the number of cells written. Nothing is saved here; the caller
/// decides based on the count.
fn sync_document(
    doc: &mut dyn DocumentHandle,
    ledger_rows: &[Vec<String>],
    roles: &ColumnRoles,
    report: &mut ReverseSyncReport,
) -> Result<usize, EngineError> {
    if doc.table_count() == 0 || doc.row_count() < 2 {
        report.unmatched += ledger_rows.len();
        return Ok(0);
    }

    // Cache the table once; matching reads every cell repeatedly.
    let rows = doc.row_count();
    let mut doc_rows: Vec<Vec<String>> = Vec::with_capacity(rows as usize - 1);
    for row in 2..=rows {
        let mut cells = Vec::with_capacity(FIELD_COLUMNS);
        for col in 1..=FIELD_COLUMNS as u32 {
            cells.push(sanitize_field(&doc.read_cell(row, col).unwrap_or_default()));
        }
        doc_rows.push(cells);
    }

    let mut changed = 0usize;
    let mut used: HashSet<usize> = HashSet::new();
    for ledger_fields in ledger_rows {
        match match_row(ledger_fields, &doc_rows, roles, &used) {
            RowMatch::Matched(idx) => {
                used.insert(idx);
                let table_row = idx as u32 + 2;
                for &col in &roles.update {
                    let want = &ledger_fields[col];
                    if normalize_text(want) != normalize_text(&doc_rows[idx][col]) {
                        doc.write_cell(table_row, col as u32 + 1, want)?;
                        changed += 1;
                    }
                }
            }
            RowMatch::Unmatched => report.unmatched += 1,
            RowMatch::Ambiguous => report.ambiguous += 1,
        }
    }
    Ok(changed)
}
