#![forbid(unsafe_code)]

use crate::error::BatchError;
use anyhow::{Context, Result};
use std::fs;
use std::path::Path;

const BOM: char = '\u{feff}';

/// Trims every line and drops blanks and `#` comments. Order and duplicates
/// are kept.
pub fn normalize_query_lines<I, S>(lines: I) -> Vec<String>
where
    I: IntoIterator<Item = S>,
    S: AsRef<str>,
{
    lines
        .into_iter()
        .filter_map(|line| {
            let query = line.as_ref().trim();
            if query.is_empty() || query.starts_with('#') {
                None
            } else {
                Some(query.to_string())
            }
        })
        .collect()
}

/// Reads one query per line. Invalid UTF-8 is replaced rather than rejected.
pub fn read_queries_file(path: &Path) -> Result<Vec<String>> {
    if !path.exists() {
        return Err(BatchError::QueriesFileNotFound(path.to_path_buf()).into());
    }
    let bytes = fs::read(path).with_context(|| format!("reading {}", path.display()))?;
    let text = String::from_utf8_lossy(&bytes);
    let text = text.strip_prefix(BOM).unwrap_or(&text);
    Ok(normalize_query_lines(text.lines()))
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::tempdir;

    #[test]
    fn normalize_drops_blanks_and_comments() {
        let lines = ["cat videos", "#comment", "", "   ", "  dog videos  ", "  # indented"];
        assert_eq!(
            normalize_query_lines(lines),
            vec!["cat videos".to_string(), "dog videos".to_string()]
        );
    }

    #[test]
    fn normalize_keeps_duplicates_in_order() {
        let out = normalize_query_lines(vec!["b", "a", "b"]);
        assert_eq!(out, vec!["b", "a", "b"]);
    }

    #[test]
    fn normalize_never_grows_input() {
        let lines = vec!["x", "", "#y", "z", "\t"];
        let out = normalize_query_lines(&lines);
        assert!(out.len() <= lines.len());
        assert!(out.iter().all(|q| !q.is_empty() && !q.starts_with('#')));
    }

    #[test]
    fn read_queries_file_strips_bom_and_bad_bytes() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("list.txt");
        let mut bytes = "\u{feff}first\r\n# skip\r\n".as_bytes().to_vec();
        bytes.extend_from_slice(b"caf\xff\n\nlast\n");
        fs::write(&path, bytes).unwrap();

        let queries = read_queries_file(&path).unwrap();
        assert_eq!(queries, vec!["first", "caf\u{fffd}", "last"]);
    }

    #[test]
    fn read_queries_file_reports_missing_file() {
        let dir = tempdir().unwrap();
        let err = read_queries_file(&dir.path().join("missing.txt")).unwrap_err();
        assert!(matches!(
            err.downcast_ref::<BatchError>(),
            Some(BatchError::QueriesFileNotFound(_))
        ));
    }
}
