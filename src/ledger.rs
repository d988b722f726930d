#![forbid(unsafe_code)]

//! The per-run CSV ledger: one row per query, written as the search
//! progresses and read back when a later run resumes from it.

use crate::error::BatchError;
use crate::models::{RunPaths, SearchRow, is_downloadable_url};
use crate::storage::make_run_dir;
use crate::ytdlp::{MediaService, NetworkBudget, entry_to_row};
use anyhow::{Context, Result};
use std::fs::{self, File};
use std::io::Write;
use std::path::Path;
use tracing::warn;

pub const CSV_FILENAME: &str = "output.csv";
pub const HEADER: [&str; 4] = ["query", "video_url", "video_id", "title"];
pub const NO_RESULTS: &str = "NO RESULTS";
const BOM: &str = "\u{feff}";

/// Searches every query and records the outcome in a fresh run directory.
/// Search failures become `ERROR:` rows and never stop the batch. Only
/// resolved rows are returned.
pub fn build_run_csv(
    queries: &[String],
    service: &dyn MediaService,
    base_run_dir: Option<&Path>,
    mut on_status: Option<&mut dyn FnMut(&str)>,
) -> Result<(RunPaths, Vec<SearchRow>)> {
    let run_dir = make_run_dir(base_run_dir)?;
    let csv_path = run_dir.join(CSV_FILENAME);

    let mut file =
        File::create(&csv_path).with_context(|| format!("creating {}", csv_path.display()))?;
    file.write_all(BOM.as_bytes())
        .with_context(|| format!("writing {}", csv_path.display()))?;
    let mut writer = csv::Writer::from_writer(file);
    writer.write_record(HEADER)?;
    writer.flush()?;

    let mut notify = |message: &str| {
        if let Some(callback) = on_status.as_mut() {
            callback(message);
        }
    };

    let mut rows = Vec::new();
    for query in queries {
        notify(&format!("Searching: {query}"));

        let record = match service.search_first(query, NetworkBudget::SEARCH) {
            Err(err) => {
                let message = format!("ERROR: {err}");
                warn!(%query, error = %err, "search failed");
                notify(&format!("  -> {message}"));
                [query.as_str(), "", "", message.as_str()].map(str::to_string)
            }
            Ok(None) => {
                notify(&format!("  -> {NO_RESULTS}"));
                [query.as_str(), "", "", NO_RESULTS].map(str::to_string)
            }
            Ok(Some(entry)) => {
                let row = entry_to_row(query, &entry);
                notify(&format!("  -> {} [{}]", row.title, row.video_id));
                let record = [
                    row.query.clone(),
                    row.video_url.clone(),
                    row.video_id.clone(),
                    row.title.clone(),
                ];
                rows.push(row);
                record
            }
        };

        writer.write_record(&record)?;
        writer.flush()?;
    }

    Ok((RunPaths { run_dir, csv_path }, rows))
}

/// Reads a ledger back, keeping only downloadable rows in file order.
pub fn load_rows_from_csv(csv_path: &Path) -> Result<Vec<SearchRow>> {
    if !csv_path.exists() {
        return Err(BatchError::LedgerNotFound(csv_path.to_path_buf()).into());
    }

    let bytes = fs::read(csv_path).with_context(|| format!("reading {}", csv_path.display()))?;
    let text = String::from_utf8_lossy(&bytes);
    let text = text.strip_prefix(BOM).unwrap_or(&text);

    let mut reader = csv::ReaderBuilder::new()
        .flexible(true)
        .from_reader(text.as_bytes());
    let headers = reader
        .headers()
        .with_context(|| format!("reading header of {}", csv_path.display()))?
        .clone();
    let column = |name: &str| headers.iter().position(|header| header.trim() == name);

    let (Some(query_idx), Some(url_idx)) = (column("query"), column("video_url")) else {
        return Err(BatchError::MalformedLedger {
            path: csv_path.to_path_buf(),
            found: headers.iter().map(str::to_string).collect(),
        }
        .into());
    };
    let id_idx = column("video_id");
    let title_idx = column("title");

    let mut rows = Vec::new();
    for record in reader.records() {
        let record = record.with_context(|| format!("parsing {}", csv_path.display()))?;
        let field = |idx: Option<usize>| {
            idx.and_then(|idx| record.get(idx))
                .unwrap_or("")
                .trim()
                .to_string()
        };

        let video_url = field(Some(url_idx));
        if !is_downloadable_url(&video_url) {
            continue;
        }
        rows.push(SearchRow {
            query: field(Some(query_idx)),
            video_url,
            video_id: field(id_idx),
            title: field(title_idx),
        });
    }

    Ok(rows)
}
