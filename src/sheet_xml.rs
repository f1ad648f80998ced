//! Worksheet-XML surgery on the ledger package: structural edits that the
//! workbook editing crate does not expose (deleting whole rows, flagging a
//! column hidden). Works the same way as the docx save path: transform the
//! one XML part, copy every other package part untouched, replace the file
//! atomically.

use std::collections::BTreeSet;
use std::fs::File;
use std::io::{Read as IoRead, Write as IoWrite};
use std::path::Path;

use quick_xml::events::attributes::Attribute;
use quick_xml::events::{BytesStart, Event};
use quick_xml::{Reader, Writer};
use regex::Regex;
use zip::read::ZipArchive;
use zip::write::SimpleFileOptions;
use zip::ZipWriter;

use crate::error::EngineError;

/// Mark a 1-based column hidden on the ledger's worksheet. Any existing
/// single-column `<col>` entry for that column is replaced; ranged entries
/// spanning it are left alone (the template ledgers this engine maintains
/// only carry single-column entries).
pub fn hide_column(ledger: &Path, col: u32) -> Result<(), EngineError> {
    rewrite_worksheet(ledger, |xml| {
        let entry = format!(
            "<col min=\"{0}\" max=\"{0}\" width=\"9\" hidden=\"1\" customWidth=\"1\"/>",
            col
        );
        let existing = Regex::new(&format!(
            "<col [^>]*min=\"{0}\"[^>]*max=\"{0}\"[^>]*/>",
            col
        ))
        .map_err(|e| EngineError::SheetXml(e.to_string()))?;
        let xml = existing.replace_all(xml, "").into_owned();
        if let Some(pos) = xml.find("<cols>") {
            let insert_at = pos + "<cols>".len();
            let mut out = xml.clone();
            out.insert_str(insert_at, &entry);
            Ok(out)
        } else if let Some(pos) = xml.find("<sheetData") {
            let mut out = xml.clone();
            out.insert_str(pos, &format!("<cols>{}</cols>", entry));
            Ok(out)
        } else {
            Err(EngineError::SheetXml("no sheetData element".to_string()))
        }
    })
}

/// Delete the given 1-based rows from the worksheet and shift every later
/// row (and its cell references) up so indices stay dense. The `dimension`
/// element is left stale on purpose; spreadsheet apps recompute it.
pub fn delete_rows(ledger: &Path, rows: &BTreeSet<u32>) -> Result<(), EngineError> {
    if rows.is_empty() {
        return Ok(());
    }
    let doomed: Vec<u32> = rows.iter().copied().collect();
    rewrite_worksheet(ledger, |xml| shift_rows_xml(xml, &doomed))
}

fn shift_for(doomed: &[u32], row: u32) -> u32 {
    doomed.iter().take_while(|&&d| d < row).count() as u32
}

fn shift_rows_xml(xml: &str, doomed: &[u32]) -> Result<String, EngineError> {
    let mut reader = Reader::from_str(xml);
    let mut writer = Writer::new(Vec::new());

    let mut last_row = 0u32;
    let mut current_new_row: Option<u32> = None;

    loop {
        let event = reader
            .read_event()
            .map_err(|e| EngineError::SheetXml(e.to_string()))?;
        match &event {
            Event::Start(e) | Event::Empty(e) if e.name().as_ref() == b"row" => {
                let row_num = row_attr(e)?.unwrap_or(last_row + 1);
                last_row = row_num;
                if doomed.binary_search(&row_num).is_ok() {
                    if matches!(event, Event::Start(_)) {
                        skip_subtree(&mut reader, b"row")?;
                    }
                    continue;
                }
                let new_row = row_num - shift_for(doomed, row_num);
                current_new_row = Some(new_row);
                let rewritten = rewrite_attr(e, b"r", &new_row.to_string());
                let ev = if matches!(event, Event::Start(_)) {
                    Event::Start(rewritten)
                } else {
                    current_new_row = None;
                    Event::Empty(rewritten)
                };
                writer
                    .write_event(ev)
                    .map_err(|e| EngineError::SheetXml(e.to_string()))?;
                continue;
            }
            Event::Start(e) | Event::Empty(e) if e.name().as_ref() == b"c" => {
                if let Some(new_row) = current_new_row {
                    if let Some(col_letters) = cell_attr(e)? {
                        let new_ref = format!("{}{}", col_letters, new_row);
                        let rewritten = rewrite_attr(e, b"r", &new_ref);
                        let ev = if matches!(event, Event::Start(_)) {
                            Event::Start(rewritten)
                        } else {
                            Event::Empty(rewritten)
                        };
                        writer
                            .write_event(ev)
                            .map_err(|e| EngineError::SheetXml(e.to_string()))?;
                        continue;
                    }
                }
            }
            Event::End(e) if e.name().as_ref() == b"row" => {
                current_new_row = None;
            }
            Event::Eof => break,
            _ => {}
        }
        writer
            .write_event(event)
            .map_err(|e| EngineError::SheetXml(e.to_string()))?;
    }
    String::from_utf8(writer.into_inner())
        .map_err(|e| EngineError::SheetXml(e.to_string()))
}

/// Read the numeric `r` attribute of a `<row>` element.
fn row_attr(e: &BytesStart) -> Result<Option<u32>, EngineError> {
    match e.try_get_attribute("r") {
        Ok(Some(attr)) => {
            let v = attr_text(&attr)?;
            v.parse::<u32>()
                .map(Some)
                .map_err(|_| EngineError::SheetXml(format!("bad row index '{}'", v)))
        }
        Ok(None) => Ok(None),
        Err(e) => Err(EngineError::SheetXml(e.to_string())),
    }
}

/// Read the column-letter part of a cell's `r` attribute ("A5" -> "A").
fn cell_attr(e: &BytesStart) -> Result<Option<String>, EngineError> {
    match e.try_get_attribute("r") {
        Ok(Some(attr)) => {
            let v = attr_text(&attr)?;
            let letters: String = v.chars().take_while(|c| c.is_ascii_alphabetic()).collect();
            Ok(Some(letters))
        }
        Ok(None) => Ok(None),
        Err(e) => Err(EngineError::SheetXml(e.to_string())),
    }
}

fn attr_text(attr: &Attribute) -> Result<String, EngineError> {
    String::from_utf8(attr.value.to_vec()).map_err(|e| EngineError::SheetXml(e.to_string()))
}

/// Copy the element, replacing one attribute's value and keeping the rest.
fn rewrite_attr(e: &BytesStart, key: &[u8], value: &str) -> BytesStart<'static> {
    let name = String::from_utf8_lossy(e.name().as_ref()).into_owned();
    let mut out = BytesStart::new(name);
    let mut replaced = false;
    for attr in e.attributes().flatten() {
        if attr.key.as_ref() == key {
            out.push_attribute((key, value.as_bytes()));
            replaced = true;
        } else {
            out.push_attribute((attr.key.as_ref(), attr.value.as_ref()));
        }
    }
    if !replaced {
        out.push_attribute((key, value.as_bytes()));
    }
    out
}

fn skip_subtree(reader: &mut Reader<&[u8]>, name: &[u8]) -> Result<(), EngineError> {
    let mut depth = 1u32;
    loop {
        match reader
            .read_event()
            .map_err(|e| EngineError::SheetXml(e.to_string()))?
        {
            Event::Start(e) if e.name().as_ref() == name => depth += 1,
            Event::End(e) if e.name().as_ref() == name => {
                depth -= 1;
                if depth == 0 {
                    return Ok(());
                }
            }
            Event::Eof => {
                return Err(EngineError::SheetXml("unterminated row element".to_string()))
            }
            _ => {}
        }
    }
}

/// Locate the first worksheet part in the package.
fn worksheet_part_name<R: IoRead + std::io::Seek>(
    archive: &mut ZipArchive<R>,
) -> Result<String, EngineError> {
    let mut parts: Vec<String> = (0..archive.len())
        .filter_map(|i| archive.by_index(i).ok().map(|e| e.name().replace('\\', "/")))
        .filter(|n| n.starts_with("xl/worksheets/") && n.ends_with(".xml"))
        .collect();
    parts.sort();
    parts
        .into_iter()
        .next()
        .ok_or_else(|| EngineError::SheetXml("no worksheet part in package".to_string()))
}

/// Apply `transform` to the first worksheet XML part and rewrite the
/// package around it. A locked ledger surfaces as `LedgerBusy`.
fn rewrite_worksheet(
    ledger: &Path,
    transform: impl FnOnce(&str) -> Result<String, EngineError>,
) -> Result<(), EngineError> {
    let file = File::open(ledger).map_err(|e| busy_or_io(ledger, e))?;
    let mut archive =
        ZipArchive::new(file).map_err(|e| EngineError::SheetXml(format!("invalid zip: {}", e)))?;
    let sheet_part = worksheet_part_name(&mut archive)?;
    // The part name is unique within the package, so the closure fires once.
    let mut transform = Some(transform);

    let temp_path = ledger.with_extension("tmp.xlsx");
    let out = File::create(&temp_path).map_err(|e| busy_or_io(ledger, e))?;
    let mut zip_writer = ZipWriter::new(out);
    let opts = SimpleFileOptions::default().compression_method(zip::CompressionMethod::Deflated);

    for i in 0..archive.len() {
        let mut entry = archive
            .by_index(i)
            .map_err(|e| EngineError::SheetXml(format!("entry {}: {}", i, e)))?;
        let name = entry.name().replace('\\', "/");
        let mut data = Vec::new();
        entry.read_to_end(&mut data)?;
        zip_writer
            .start_file(&name, opts)
            .map_err(|e| EngineError::SheetXml(e.to_string()))?;
        if name == sheet_part {
            let apply = transform
                .take()
                .ok_or_else(|| EngineError::SheetXml("duplicate worksheet part".to_string()))?;
            let xml = String::from_utf8(data).map_err(|e| EngineError::SheetXml(e.to_string()))?;
            let out_xml = apply(&xml)?;
            zip_writer.write_all(out_xml.as_bytes())?;
        } else {
            zip_writer.write_all(&data)?;
        }
    }
    zip_writer
        .finish()
        .map_err(|e| EngineError::SheetXml(e.to_string()))?;
    std::fs::rename(&temp_path, ledger).map_err(|e| busy_or_io(ledger, e))?;
    Ok(())
}

fn busy_or_io(ledger: &Path, e: std::io::Error) -> EngineError {
    if e.kind() == std::io::ErrorKind::PermissionDenied {
        EngineError::LedgerBusy(ledger.to_path_buf())
    } else {
        EngineError::Io(e)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn shift_removes_rows_and_renumbers() {
        let xml = r#"<worksheet><sheetData><row r="1"><c r="A1"><v>1</v></c></row><row r="2"><c r="A2"><v>2</v></c></row><row r="3"><c r="A3"><v>3</v></c></row></sheetData></worksheet>"#;
        let out = shift_rows_xml(xml, &[2]).unwrap();
        assert!(!out.contains("<v>2</v>"));
        assert!(out.contains(r#"<row r="1">"#));
        assert!(out.contains(r#"<row r="2"><c r="A2"><v>3</v></c></row>"#));
    }

    #[test]
    fn shift_handles_multiple_deletes() {
        let xml = r#"<worksheet><sheetData><row r="4"><c r="B4"/></row><row r="5"><c r="B5"/></row><row r="6"><c r="B6"/></row><row r="7"><c r="B7"/></row></sheetData></worksheet>"#;
        let out = shift_rows_xml(xml, &[4, 6]).unwrap();
        assert!(out.contains(r#"<row r="4"><c r="B4"/></row>"#));
        assert!(out.contains(r#"<row r="5"><c r="B5"/></row>"#));
        assert!(!out.contains(r#"r="6""#));
        assert!(!out.contains(r#"r="7""#));
    }

    #[test]
    fn untouched_rows_pass_through() {
        let xml = r#"<worksheet><sheetData><row r="1" ht="45" customHeight="1"><c r="A1" t="s"><v>0</v></c></row></sheetData></worksheet>"#;
        let out = shift_rows_xml(xml, &[9]).unwrap();
        assert!(out.contains(r#"ht="45""#));
        assert!(out.contains(r#"t="s""#));
    }

    fn write_package(path: &Path, sheet_xml: &str) {
        let out = File::create(path).unwrap();
        let mut writer = ZipWriter::new(out);
        let opts = SimpleFileOptions::default();
        writer.start_file("[Content_Types].xml", opts).unwrap();
        writer.write_all(b"<Types/>").unwrap();
        writer.start_file("xl/worksheets/sheet1.xml", opts).unwrap();
        writer.write_all(sheet_xml.as_bytes()).unwrap();
        writer.finish().unwrap();
    }

    fn read_sheet_part(path: &Path) -> String {
        let mut archive = ZipArchive::new(File::open(path).unwrap()).unwrap();
        let mut entry = archive.by_name("xl/worksheets/sheet1.xml").unwrap();
        let mut xml = String::new();
        entry.read_to_string(&mut xml).unwrap();
        xml
    }

    #[test]
    fn hide_column_rewrites_the_package_in_place() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("book.xlsx");
        write_package(
            &path,
            r#"<worksheet><sheetData><row r="1"><c r="A1"><v>1</v></c></row></sheetData></worksheet>"#,
        );

        hide_column(&path, 14).unwrap();
        let xml = read_sheet_part(&path);
        assert!(xml.contains(r#"min="14" max="14""#));
        assert!(xml.contains(r#"hidden="1""#));

        // Running it again must not duplicate the entry.
        hide_column(&path, 14).unwrap();
        let xml = read_sheet_part(&path);
        assert_eq!(xml.matches(r#"min="14""#).count(), 1);
        assert!(xml.contains("<v>1</v>"));
    }
}
