#![forbid(unsafe_code)]

//! Batch search-and-download pipeline built on yt-dlp.
//!
//! Queries are normalized, resolved to their first search hit, recorded in a
//! per-run CSV ledger and then downloaded one after another. Front ends drive
//! the pipeline through [`job::run_job`] or [`job::spawn_job`].

pub mod config;
pub mod download;
pub mod error;
pub mod ffmpeg;
pub mod job;
pub mod ledger;
pub mod models;
pub mod queries;
pub mod storage;
pub mod ytdlp;

pub use error::BatchError;
pub use models::{DownloadMode, RunPaths, SearchRow};
