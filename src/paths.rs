//! Canonical path keys for set membership and provenance comparison.

use std::path::{Component, Path};

/// Normalize a path string into a comparison key: separators unified,
/// `.`/`..` components resolved lexically, case-folded. Two spellings of
/// the same filesystem entry always produce the same key. Pure, no I/O.
pub fn normalize(path: &str) -> String {
    let unified = path.trim().replace('\\', "/");
    let p = Path::new(&unified);
    let mut parts: Vec<String> = Vec::new();
    let mut prefix = String::new();
    for comp in p.components() {
        match comp {
            Component::Prefix(pre) => {
                prefix = pre.as_os_str().to_string_lossy().replace('\\', "/");
            }
            Component::RootDir => prefix.push('/'),
            Component::CurDir => {}
            Component::ParentDir => {
                if parts.pop().is_none() {
                    parts.push("..".to_string());
                }
            }
            Component::Normal(s) => parts.push(s.to_string_lossy().into_owned()),
        }
    }
    let mut key = prefix;
    key.push_str(&parts.join("/"));
    key.to_lowercase()
}

/// Normalize an owned/borrowed `Path` the same way as [`normalize`].
pub fn normalize_path(path: &Path) -> String {
    normalize(&path.to_string_lossy())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn separators_and_case_fold() {
        assert_eq!(normalize("C:\\Docs\\A.docx"), normalize("c:/docs/a.docx"));
    }

    #[test]
    fn dot_components_resolve() {
        assert_eq!(normalize("/data/./sub/../a.docx"), "/data/a.docx");
        assert_eq!(normalize("data/sub/../a.docx"), "data/a.docx");
    }

    #[test]
    fn trailing_whitespace_trimmed() {
        assert_eq!(normalize("  /data/a.docx "), "/data/a.docx");
    }

    #[test]
    fn distinct_paths_stay_distinct() {
        assert_ne!(normalize("/data/a.docx"), normalize("/data/b.docx"));
    }
}
