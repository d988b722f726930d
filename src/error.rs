#![forbid(unsafe_code)]

use std::path::PathBuf;
use thiserror::Error;

/// Conditions callers need to tell apart. Raised through `anyhow`, so use
/// `err.downcast_ref::<BatchError>()` to inspect them.
#[derive(Debug, Error)]
pub enum BatchError {
    #[error("Missing queries file: {}", .0.display())]
    QueriesFileNotFound(PathBuf),

    #[error("Missing CSV file: {}", .0.display())]
    LedgerNotFound(PathBuf),

    #[error("{} missing columns [\"query\", \"video_url\"]; found: {found:?}", .path.display())]
    MalformedLedger { path: PathBuf, found: Vec<String> },

    #[error("No downloadable rows found in {}", .0.display())]
    EmptyLedger(PathBuf),

    #[error("Unsupported mode: {0}")]
    UnsupportedMode(String),

    #[error("No input provided. Use --queries-file, --query, or --from-csv.")]
    NoInput,

    #[error("No queries provided.")]
    NoQueries,

    #[error("{0} is not installed or not in PATH")]
    ToolMissing(String),

    #[error("{tool} failed (code={code:?}): {stderr}")]
    ToolFailed {
        tool: String,
        code: Option<i32>,
        stderr: String,
    },
}
