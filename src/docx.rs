//! In-process implementation of the automation traits over `.docx` files.
//! Reads and writes the first table of `word/document.xml` directly through
//! the package zip, so no external automation product is required. Row and
//! column indices are 1-based to match the trait contract.

use std::collections::BTreeMap;
use std::fs::File;
use std::io::{Read as IoRead, Write as IoWrite};
use std::path::{Path, PathBuf};

use quick_xml::events::{BytesEnd, BytesStart, BytesText, Event};
use quick_xml::{Reader, Writer};
use zip::read::ZipArchive;
use zip::write::SimpleFileOptions;
use zip::ZipWriter;

use crate::automation::{AutomationError, AutomationHost, AutomationSession, DocumentHandle};

const DOCUMENT_PART: &str = "word/document.xml";

/// Automation host backed by direct package access. Sessions are cheap and
/// always alive; `force_kill_all` is a no-op since nothing runs out of
/// process.
pub struct DocxAutomation;

impl AutomationHost for DocxAutomation {
    fn create_session(&self) -> Result<Box<dyn AutomationSession>, AutomationError> {
        Ok(Box::new(DocxSession { alive: true }))
    }

    fn force_kill_all(&self) {}
}

pub struct DocxSession {
    alive: bool,
}

impl AutomationSession for DocxSession {
    fn open(&mut self, path: &Path) -> Result<Box<dyn DocumentHandle>, AutomationError> {
        if !self.alive {
            return Err(AutomationError::RemoteCallUnavailable);
        }
        let doc = DocxDocument::open(path)?;
        Ok(Box::new(doc))
    }

    fn is_alive(&self) -> bool {
        self.alive
    }

    fn shutdown(&mut self) {
        self.alive = false;
    }
}

pub struct DocxDocument {
    path: PathBuf,
    xml: String,
    table_count: u32,
    rows: Vec<Vec<String>>,
    pending: BTreeMap<(u32, u32), String>,
}

impl DocxDocument {
    pub fn open(path: &Path) -> Result<Self, AutomationError> {
        let xml = read_document_xml(path)?;
        let (table_count, rows) = parse_first_table(&xml)?;
        Ok(DocxDocument {
            path: path.to_path_buf(),
            xml,
            table_count,
            rows,
            pending: BTreeMap::new(),
        })
    }
}

impl DocumentHandle for DocxDocument {
    fn table_count(&self) -> u32 {
        self.table_count
    }

    fn row_count(&self) -> u32 {
        self.rows.len() as u32
    }

    fn read_cell(&self, row: u32, col: u32) -> Result<String, AutomationError> {
        if row == 0 || col == 0 {
            return Err(AutomationError::CellRead("index is 1-based".into(), row, col));
        }
        let r = self
            .rows
            .get((row - 1) as usize)
            .ok_or_else(|| AutomationError::CellRead("no such row".into(), row, col))?;
        let c = r
            .get((col - 1) as usize)
            .ok_or_else(|| AutomationError::CellRead("no such cell".into(), row, col))?;
        Ok(c.clone())
    }

    fn write_cell(&mut self, row: u32, col: u32, text: &str) -> Result<(), AutomationError> {
        let r = self
            .rows
            .get_mut((row - 1) as usize)
            .ok_or_else(|| AutomationError::CellWrite("no such row".into(), row, col))?;
        let c = r
            .get_mut((col - 1) as usize)
            .ok_or_else(|| AutomationError::CellWrite("no such cell".into(), row, col))?;
        *c = text.to_string();
        self.pending.insert((row, col), text.to_string());
        Ok(())
    }

    fn close(self: Box<Self>, save: bool) -> Result<(), AutomationError> {
        if !save || self.pending.is_empty() {
            return Ok(());
        }
        let updated = apply_cell_writes(&self.xml, &self.pending)?;
        replace_document_xml(&self.path, &updated)
            .map_err(|e| AutomationError::Save(e.to_string()))
    }
}

fn read_document_xml(path: &Path) -> Result<String, AutomationError> {
    let file = File::open(path).map_err(|e| AutomationError::Open {
        path: path.display().to_string(),
        reason: e.to_string(),
    })?;
    let mut archive = ZipArchive::new(file).map_err(|e| AutomationError::Open {
        path: path.display().to_string(),
        reason: format!("not a docx package: {}", e),
    })?;
    let mut entry = archive.by_name(DOCUMENT_PART).map_err(|e| AutomationError::Open {
        path: path.display().to_string(),
        reason: format!("missing {}: {}", DOCUMENT_PART, e),
    })?;
    let mut xml = String::new();
    entry
        .read_to_string(&mut xml)
        .map_err(|e| AutomationError::Malformed(e.to_string()))?;
    Ok(xml)
}

/// Walk `document.xml` once and return (table count, first table's cell
/// texts). Only rows and cells of the outermost first table are collected;
/// nested tables do not contribute rows or text.
fn parse_first_table(xml: &str) -> Result<(u32, Vec<Vec<String>>), AutomationError> {
    let mut reader = Reader::from_str(xml);
    let mut table_count = 0u32;
    let mut tbl_nest = 0u32;
    let mut in_first = false;
    let mut in_text = false;
    let mut rows: Vec<Vec<String>> = Vec::new();

    loop {
        match reader
            .read_event()
            .map_err(|e| AutomationError::Malformed(e.to_string()))?
        {
            Event::Start(e) => match e.name().as_ref() {
                b"w:tbl" => {
                    if tbl_nest == 0 {
                        table_count += 1;
                        in_first = table_count == 1;
                    }
                    tbl_nest += 1;
                }
                b"w:tr" if in_first && tbl_nest == 1 => rows.push(Vec::new()),
                b"w:tc" if in_first && tbl_nest == 1 => {
                    if let Some(row) = rows.last_mut() {
                        row.push(String::new());
                    }
                }
                b"w:t" if in_first && tbl_nest == 1 => in_text = true,
                _ => {}
            },
            Event::End(e) => match e.name().as_ref() {
                b"w:tbl" => {
                    tbl_nest = tbl_nest.saturating_sub(1);
                    if tbl_nest == 0 {
                        in_first = false;
                    }
                }
                b"w:t" => in_text = false,
                _ => {}
            },
            Event::Text(t) => {
                if in_text && in_first && tbl_nest == 1 {
                    if let Some(cell) = rows.last_mut().and_then(|r| r.last_mut()) {
                        let piece = t
                            .unescape()
                            .map_err(|e| AutomationError::Malformed(e.to_string()))?;
                        cell.push_str(&piece);
                    }
                }
            }
            Event::Eof => break,
            _ => {}
        }
    }
    Ok((table_count, rows))
}

/// Re-emit `document.xml` with the pending cell texts substituted. The first
/// text run of a target cell receives the new value; any further runs in the
/// cell are blanked so the old text cannot linger. A target cell with no run
/// at all gets one injected at the end of its first paragraph.
fn apply_cell_writes(
    xml: &str,
    writes: &BTreeMap<(u32, u32), String>,
) -> Result<String, AutomationError> {
    let mut reader = Reader::from_str(xml);
    let mut writer = Writer::new(Vec::new());

    let mut table_count = 0u32;
    let mut tbl_nest = 0u32;
    let mut in_first = false;
    let mut row = 0u32;
    let mut col = 0u32;
    let mut target: Option<&String> = None;
    let mut wrote = false;
    let mut in_text = false;
    let mut paragraphs_closed = 0u32;

    loop {
        let event = reader
            .read_event()
            .map_err(|e| AutomationError::Malformed(e.to_string()))?;
        match &event {
            Event::Start(e) => match e.name().as_ref() {
                b"w:tbl" => {
                    if tbl_nest == 0 {
                        table_count += 1;
                        in_first = table_count == 1;
                    }
                    tbl_nest += 1;
                }
                b"w:tr" if in_first && tbl_nest == 1 => {
                    row += 1;
                    col = 0;
                }
                b"w:tc" if in_first && tbl_nest == 1 => {
                    col += 1;
                    target = writes.get(&(row, col));
                    wrote = false;
                    paragraphs_closed = 0;
                }
                b"w:t" if target.is_some() && tbl_nest == 1 => {
                    in_text = true;
                    emit(&mut writer, &event)?;
                    if !wrote {
                        emit(&mut writer, &Event::Text(BytesText::new(target.unwrap())))?;
                        wrote = true;
                    }
                    continue;
                }
                _ => {}
            },
            Event::End(e) => match e.name().as_ref() {
                b"w:tbl" => {
                    tbl_nest = tbl_nest.saturating_sub(1);
                    if tbl_nest == 0 {
                        in_first = false;
                    }
                }
                b"w:t" => in_text = false,
                b"w:p" if target.is_some() && tbl_nest == 1 => {
                    paragraphs_closed += 1;
                    if !wrote && paragraphs_closed == 1 {
                        inject_run(&mut writer, target.unwrap())?;
                        wrote = true;
                    }
                }
                b"w:tc" if in_first && tbl_nest == 1 => target = None,
                _ => {}
            },
            Event::Text(_) => {
                // Original text inside a rewritten cell is dropped; the
                // replacement was emitted alongside the first run above.
                if in_text && target.is_some() {
                    continue;
                }
            }
            Event::Eof => break,
            _ => {}
        }
        emit(&mut writer, &event)?;
    }

    String::from_utf8(writer.into_inner()).map_err(|e| AutomationError::Malformed(e.to_string()))
}

fn emit(writer: &mut Writer<Vec<u8>>, event: &Event<'_>) -> Result<(), AutomationError> {
    writer
        .write_event(event.clone())
        .map_err(|e| AutomationError::Malformed(e.to_string()))
}

fn inject_run(writer: &mut Writer<Vec<u8>>, text: &str) -> Result<(), AutomationError> {
    emit(writer, &Event::Start(BytesStart::new("w:r")))?;
    let mut t = BytesStart::new("w:t");
    t.push_attribute(("xml:space", "preserve"));
    emit(writer, &Event::Start(t))?;
    emit(writer, &Event::Text(BytesText::new(text)))?;
    emit(writer, &Event::End(BytesEnd::new("w:t")))?;
    emit(writer, &Event::End(BytesEnd::new("w:r")))?;
    Ok(())
}

/// Rewrite the docx package with a new `word/document.xml`, leaving every
/// other part untouched. Writes a sibling temp file then renames over the
/// original so a failed save never truncates the document.
fn replace_document_xml(path: &Path, document_xml: &str) -> Result<(), AutomationError> {
    let file = File::open(path)?;
    let mut archive =
        ZipArchive::new(file).map_err(|e| AutomationError::Save(format!("invalid zip: {}", e)))?;

    let temp_path = path.with_extension("tmp.docx");
    let out = File::create(&temp_path)?;
    let mut zip_writer = ZipWriter::new(out);
    let opts = SimpleFileOptions::default().compression_method(zip::CompressionMethod::Deflated);

    for i in 0..archive.len() {
        let mut entry = archive
            .by_index(i)
            .map_err(|e| AutomationError::Save(format!("entry {}: {}", i, e)))?;
        let name = entry.name().replace('\\', "/");
        zip_writer
            .start_file(&name, opts)
            .map_err(|e| AutomationError::Save(e.to_string()))?;
        if name == DOCUMENT_PART {
            zip_writer
                .write_all(document_xml.as_bytes())
                .map_err(|e| AutomationError::Save(e.to_string()))?;
        } else {
            let mut data = Vec::new();
            entry.read_to_end(&mut data)?;
            zip_writer
                .write_all(&data)
                .map_err(|e| AutomationError::Save(e.to_string()))?;
        }
    }
    zip_writer
        .finish()
        .map_err(|e| AutomationError::Save(e.to_string()))?;
    std::fs::rename(&temp_path, path)?;
    Ok(())
}

#[cfg(test)]
pub mod test_support {
    //! Minimal WordprocessingML fixtures for unit and integration tests.

    use std::io::Write as IoWrite;
    use std::path::Path;

    use zip::write::SimpleFileOptions;
    use zip::ZipWriter;

    pub fn table_xml(rows: &[Vec<&str>]) -> String {
        let mut body = String::from("<w:tbl>");
        for row in rows {
            body.push_str("<w:tr>");
            for cell in row {
                body.push_str("<w:tc><w:p><w:r><w:t>");
                body.push_str(&quick_xml::escape::escape(*cell));
                body.push_str("</w:t></w:r></w:p></w:tc>");
            }
            body.push_str("</w:tr>");
        }
        body.push_str("</w:tbl>");
        body
    }

    pub fn document_xml(body: &str) -> String {
        format!(
            "<?xml version=\"1.0\" encoding=\"UTF-8\" standalone=\"yes\"?>\
             <w:document xmlns:w=\"http://schemas.openxmlformats.org/wordprocessingml/2006/main\">\
             <w:body>{}</w:body></w:document>",
            body
        )
    }

    /// Write a docx package containing the given body XML.
    pub fn write_docx(path: &Path, body: &str) {
        let file = std::fs::File::create(path).expect("create docx");
        let mut zip = ZipWriter::new(file);
        let opts = SimpleFileOptions::default();
        zip.start_file("[Content_Types].xml", opts).unwrap();
        zip.write_all(
            b"<?xml version=\"1.0\"?><Types xmlns=\"http://schemas.openxmlformats.org/package/2006/content-types\">\
              <Default Extension=\"xml\" ContentType=\"application/xml\"/></Types>",
        )
        .unwrap();
        zip.start_file("word/document.xml", opts).unwrap();
        zip.write_all(document_xml(body).as_bytes()).unwrap();
        zip.finish().unwrap();
    }

    /// Write a docx whose first table holds a header row plus the given data
    /// rows, 13 columns wide.
    pub fn write_table_docx(path: &Path, data_rows: &[Vec<&str>]) {
        let mut rows: Vec<Vec<&str>> = vec![vec!["h"; 13]];
        rows.extend(data_rows.iter().cloned());
        write_docx(path, &table_xml(&rows));
    }
}
