//! Diagnostic dump of a ledger: header roles, then every data row with its
//! serial, fields, and (normally hidden) provenance path.

use std::env;
use std::path::PathBuf;
use std::process::ExitCode;

use defect_ledger::excel;
use defect_ledger::services::reverse_sync::{classify_columns, Keywords};

fn main() -> ExitCode {
    env_logger::init();
    let path = match env::args().nth(1) {
        Some(p) => PathBuf::from(p),
        None => {
            eprintln!("usage: dump_ledger <ledger.xlsx>");
            return ExitCode::FAILURE;
        }
    };

    let headers = match excel::read_headers(&path) {
        Ok(h) => h,
        Err(e) => {
            eprintln!("error: {}", e);
            return ExitCode::FAILURE;
        }
    };
    let roles = classify_columns(&headers, &Keywords::default());
    println!("headers: {:?}", headers);
    println!(
        "roles: update={:?} key={:?} base={:?}",
        roles.update, roles.key, roles.base
    );

    match excel::read_data_rows(&path) {
        Ok(rows) => {
            for row in rows.iter().filter(|r| r.has_content()) {
                println!(
                    "row {:>4} | serial {:>4} | {} | {}",
                    row.row,
                    row.fields[0],
                    row.fields[1..]
                        .iter()
                        .map(|f| f.replace('\n', "\\n"))
                        .collect::<Vec<_>>()
                        .join(" | "),
                    row.source_path
                );
            }
            ExitCode::SUCCESS
        }
        Err(e) => {
            eprintln!("error: {}", e);
            ExitCode::FAILURE
        }
    }
}
