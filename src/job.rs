#![forbid(unsafe_code)]

//! Runs the whole pipeline on one background worker and reports back over a
//! one-way event channel. Front ends build a [`JobConfig`] up front; the
//! worker never reads anything else they own. The only shared state is the
//! cancellation flag.

use crate::download::{DownloadEvent, DownloadSettings, DownloadSummary, download_rows};
use crate::error::BatchError;
use crate::ledger::{build_run_csv, load_rows_from_csv};
use crate::models::{DownloadMode, RunPaths, SearchRow};
use crate::queries::{normalize_query_lines, read_queries_file};
use crate::ytdlp::MediaService;
use anyhow::Result;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use tokio::sync::mpsc::{self, UnboundedReceiver, UnboundedSender};
use tokio::task::JoinHandle;
use tracing::debug;

/// Where the rows of a job come from.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum JobInput {
    QueriesFile(PathBuf),
    Queries(Vec<String>),
    /// Free text, one query per line.
    QueriesText(String),
    FromCsv(PathBuf),
}

/// Snapshot of everything a run needs, taken when the run starts.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct JobConfig {
    pub mode: DownloadMode,
    pub out_dir: PathBuf,
    pub base_run_dir: Option<PathBuf>,
    pub input: JobInput,
    pub skip_existing: bool,
    /// `false` only builds (or loads) the ledger.
    pub download: bool,
    pub ffmpeg_location: Option<PathBuf>,
}

#[derive(Debug, Clone, PartialEq)]
pub enum JobEvent {
    Status(String),
    LedgerBuilt(RunPaths),
    Download(DownloadEvent),
    Finished(JobSummary),
    Failed(String),
}

#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct JobSummary {
    pub run: Option<RunPaths>,
    pub rows: usize,
    pub download: Option<DownloadSummary>,
}

/// Shared stop request. Setting it is safe from any thread; the worker reads
/// it between rows.
#[derive(Debug, Clone, Default)]
pub struct CancelFlag(Arc<AtomicBool>);

impl CancelFlag {
    pub fn cancel(&self) {
        self.0.store(true, Ordering::Relaxed);
    }

    pub fn is_cancelled(&self) -> bool {
        self.0.load(Ordering::Relaxed)
    }

    pub fn as_atomic(&self) -> &AtomicBool {
        &self.0
    }
}

/// Runs one job to completion on the current thread.
pub fn run_job(
    config: &JobConfig,
    service: &dyn MediaService,
    cancel: &AtomicBool,
    emit: &mut dyn FnMut(JobEvent),
) -> Result<JobSummary> {
    let mut summary = JobSummary::default();

    let rows = match &config.input {
        JobInput::FromCsv(path) => load_ledger(path, emit)?,
        JobInput::QueriesFile(path) => {
            emit(JobEvent::Status(format!(
                "Reading queries file: {}",
                path.display()
            )));
            let queries = read_queries_file(path)?;
            build_ledger(&queries, config, service, emit, &mut summary)?
        }
        JobInput::Queries(lines) => {
            let queries = normalize_query_lines(lines);
            build_ledger(&queries, config, service, emit, &mut summary)?
        }
        JobInput::QueriesText(text) => {
            // Only typed-in text rejects an empty list; other inputs still
            // write a header-only ledger.
            let queries = normalize_query_lines(text.lines());
            if queries.is_empty() {
                return Err(BatchError::NoQueries.into());
            }
            build_ledger(&queries, config, service, emit, &mut summary)?
        }
    };
    summary.rows = rows.len();

    if rows.is_empty() {
        return Ok(summary);
    }
    if !config.download {
        emit(JobEvent::Status("Download skipped.".to_string()));
        return Ok(summary);
    }

    let settings = DownloadSettings {
        mode: config.mode,
        out_dir: config.out_dir.clone(),
        skip_existing: config.skip_existing,
        ffmpeg_location: config.ffmpeg_location.clone(),
    };
    let outcome = download_rows(&rows, &settings, service, cancel, &mut |event| {
        emit(JobEvent::Download(event))
    })?;
    summary.download = Some(outcome);

    Ok(summary)
}

fn load_ledger(path: &Path, emit: &mut dyn FnMut(JobEvent)) -> Result<Vec<SearchRow>> {
    emit(JobEvent::Status(format!("Loading CSV: {}", path.display())));
    let rows = load_rows_from_csv(path)?;
    if rows.is_empty() {
        return Err(BatchError::EmptyLedger(path.to_path_buf()).into());
    }
    emit(JobEvent::Status(format!(
        "Loaded {} rows from {}",
        rows.len(),
        path.display()
    )));
    Ok(rows)
}

fn build_ledger(
    queries: &[String],
    config: &JobConfig,
    service: &dyn MediaService,
    emit: &mut dyn FnMut(JobEvent),
    summary: &mut JobSummary,
) -> Result<Vec<SearchRow>> {
    let mut on_status = |message: &str| emit(JobEvent::Status(message.to_string()));
    let (run, rows) = build_run_csv(
        queries,
        service,
        config.base_run_dir.as_deref(),
        Some(&mut on_status),
    )?;

    emit(JobEvent::LedgerBuilt(run.clone()));
    emit(JobEvent::Status(format!("Run folder: {}", run.run_dir.display())));
    emit(JobEvent::Status(format!("CSV: {}", run.csv_path.display())));
    emit(JobEvent::Status(format!("Valid rows: {}", rows.len())));
    summary.run = Some(run);
    Ok(rows)
}

/// Handle to a job running in the background.
pub struct JobHandle {
    pub events: UnboundedReceiver<JobEvent>,
    pub cancel: CancelFlag,
    pub task: JoinHandle<()>,
}

/// Starts `config` on a blocking worker. The receiver always ends with
/// exactly one `Finished` or `Failed` event. Must be called inside a tokio
/// runtime.
pub fn spawn_job(config: JobConfig, service: Arc<dyn MediaService>) -> JobHandle {
    let (tx, rx) = mpsc::unbounded_channel();
    let cancel = CancelFlag::default();
    let worker_cancel = cancel.clone();

    let task = tokio::task::spawn_blocking(move || {
        worker(&config, service.as_ref(), worker_cancel.as_atomic(), &tx)
    });

    JobHandle {
        events: rx,
        cancel,
        task,
    }
}

fn worker(
    config: &JobConfig,
    service: &dyn MediaService,
    cancel: &AtomicBool,
    tx: &UnboundedSender<JobEvent>,
) {
    // A closed receiver only means nobody is listening any more.
    let mut emit = |event: JobEvent| {
        let _ = tx.send(event);
    };
    match run_job(config, service, cancel, &mut emit) {
        Ok(summary) => {
            debug!(?summary, "job finished");
            emit(JobEvent::Finished(summary));
        }
        Err(err) => {
            debug!(error = %format!("{err:#}"), "job failed");
            emit(JobEvent::Failed(format!("{err:#}")));
        }
    }
}
