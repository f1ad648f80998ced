//! Shared fixtures: a minimal WordprocessingML package builder and a styled
//! three-header-row ledger workbook.
#![allow(dead_code)]

use std::io::Write as IoWrite;
use std::path::Path;

use rust_xlsxwriter::{Format, Workbook};
use zip::write::SimpleFileOptions;
use zip::ZipWriter;

pub const HEADERS: [&str; 13] = [
    "序号",
    "发现时间",
    "地点",
    "隐患类型",
    "隐患描述",
    "整改要求",
    "责任部门",
    "责任人",
    "整改期限",
    "复查人",
    "复查时间",
    "备注",
    "销号情况",
];

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
    let doc = format!(
        "<?xml version=\"1.0\" encoding=\"UTF-8\" standalone=\"yes\"?>\
         <w:document xmlns:w=\"http://schemas.openxmlformats.org/wordprocessingml/2006/main\">\
         <w:body>{}</w:body></w:document>",
        body
    );
    zip.write_all(doc.as_bytes()).unwrap();
    zip.finish().unwrap();
}

/// A document whose first table has the standard 13-column header row plus
/// the given data rows.
pub fn write_table_docx(path: &Path, data_rows: &[Vec<&str>]) {
    let mut rows: Vec<Vec<&str>> = vec![HEADERS.to_vec()];
    rows.extend(data_rows.iter().cloned());
    write_docx(path, &table_xml(&rows));
}

/// A document with no table at all.
pub fn write_tableless_docx(path: &Path) {
    write_docx(path, "<w:p><w:r><w:t>no table here</w:t></w:r></w:p>");
}

/// Empty ledger: title in row 1, captions in row 3 (the style template row),
/// no data rows yet.
pub fn write_empty_ledger(path: &Path) {
    let mut workbook = Workbook::new();
    let sheet = workbook.add_worksheet();
    sheet.set_name("台账").unwrap();

    let title = Format::new().set_bold().set_font_size(14);
    sheet
        .write_string_with_format(0, 0, "隐患整改台账", &title)
        .unwrap();

    let caption = Format::new()
        .set_bold()
        .set_font_size(10)
        .set_background_color(0xD9E1F2);
    for (col, header) in HEADERS.iter().enumerate() {
        sheet
            .write_string_with_format(2, col as u16, *header, &caption)
            .unwrap();
    }
    sheet.set_row_height(2, 30).unwrap();
    workbook.save(path).unwrap();
}

/// A data row for [`write_table_docx`], padded to 13 columns.
pub fn doc_row(values: &[&'static str]) -> Vec<&'static str> {
    let mut row = values.to_vec();
    while row.len() < 13 {
        row.push("");
    }
    row
}
