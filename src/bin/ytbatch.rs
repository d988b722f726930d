#![forbid(unsafe_code)]

//! Command-line front end: builds a run CSV from search queries (or loads an
//! existing one) and downloads every resolved row with yt-dlp.
//!
//! Exit status is 0 on success and 2 on any fatal error.

use anyhow::{Result, bail};
use clap::{Args, Parser};
use std::io::{self, Write};
use std::path::{Path, PathBuf};
use std::pin::pin;
use std::process::ExitCode;
use std::str::FromStr;
use std::sync::Arc;
use tracing::Level;
use tracing_subscriber::FmtSubscriber;
use ytbatch::BatchError;
use ytbatch::config::{SettingsOverrides, resolve_settings};
use ytbatch::download::DownloadEvent;
use ytbatch::ffmpeg::find_bundled_ffmpeg_dir;
use ytbatch::job::{JobConfig, JobEvent, JobInput, JobSummary, spawn_job};
use ytbatch::models::DownloadMode;
use ytbatch::ytdlp::{ProgressEvent, YtDlp};

const DEFAULT_QUERIES_FILE: &str = "list.txt";
const PROGRESS_WIDTH: usize = 110;
const MIB: f64 = 1024.0 * 1024.0;

/// ytbatch: build run CSV from queries and download with yt-dlp.
#[derive(Parser, Debug)]
#[command(name = "ytbatch", version)]
struct Cli {
    /// What to download for each result.
    #[arg(long, default_value = "audio-mp3", value_parser = DownloadMode::from_str)]
    mode: DownloadMode,

    /// Output folder for downloaded files. [default: downloads]
    #[arg(long)]
    out_dir: Option<PathBuf>,

    #[command(flatten)]
    input: InputArgs,

    /// Base directory for per-run folders (CSV). Default: per-user cache.
    #[arg(long)]
    run_dir: Option<PathBuf>,

    /// Only build the CSV; do not download.
    #[arg(long)]
    no_download: bool,

    /// Skip downloads if a file with the same [video_id] already exists in out-dir.
    #[arg(long)]
    skip_existing: bool,

    /// yt-dlp executable to run. [default: yt-dlp on PATH]
    #[arg(long = "yt-dlp")]
    ytdlp: Option<PathBuf>,

    /// Settings file with YTBATCH_* variables.
    #[arg(long)]
    env_file: Option<PathBuf>,

    /// Log debug diagnostics to stderr.
    #[arg(long, short)]
    verbose: bool,
}

#[derive(Args, Debug, Default)]
#[group(required = false, multiple = false)]
struct InputArgs {
    /// Path to file containing one query per line.
    #[arg(long)]
    queries_file: Option<PathBuf>,

    /// A single query (repeatable).
    #[arg(long)]
    query: Vec<String>,

    /// Skip search and download directly from an existing output.csv.
    #[arg(long)]
    from_csv: Option<PathBuf>,
}

#[tokio::main]
async fn main() -> ExitCode {
    let cli = Cli::parse();
    match run(cli).await {
        Ok(()) => ExitCode::SUCCESS,
        Err(err) => {
            eprintln!("Fatal error: {err:#}");
            ExitCode::from(2)
        }
    }
}

async fn run(cli: Cli) -> Result<()> {
    let settings = resolve_settings(SettingsOverrides {
        base_run_dir: cli.run_dir.as_deref().map(absolute),
        out_dir: cli.out_dir.as_deref().map(absolute),
        ytdlp: cli.ytdlp.clone(),
        log_level: cli.verbose.then(|| "debug".to_string()),
        env_path: cli.env_file.clone(),
    })?;
    init_tracing(&settings.log_level);

    let input = resolve_input(&cli.input, Path::new(DEFAULT_QUERIES_FILE))?;
    let service = YtDlp::new(&settings.ytdlp);
    if !(cli.no_download && matches!(input, JobInput::FromCsv(_))) {
        service.ensure_available()?;
    }

    let out_dir = absolute(&settings.out_dir);
    let config = JobConfig {
        mode: cli.mode,
        out_dir: out_dir.clone(),
        base_run_dir: Some(settings.base_run_dir.clone()),
        input,
        skip_existing: cli.skip_existing,
        download: !cli.no_download,
        ffmpeg_location: find_bundled_ffmpeg_dir(),
    };

    let mut handle = spawn_job(config, Arc::new(service));
    let mut console = Console::default();
    let mut interrupt = pin!(tokio::signal::ctrl_c());

    loop {
        tokio::select! {
            event = handle.events.recv() => match event {
                Some(JobEvent::Finished(summary)) => {
                    console.finish(&summary, &out_dir, cli.no_download);
                }
                Some(JobEvent::Failed(message)) => {
                    console.end_progress();
                    bail!("{message}");
                }
                Some(event) => console.render(&event),
                None => break,
            },
            _ = &mut interrupt, if !handle.cancel.is_cancelled() => {
                handle.cancel.cancel();
                console.status("Cancelling after the current download...");
            }
        }
    }

    Ok(())
}

fn init_tracing(level: &str) {
    let level = Level::from_str(level).unwrap_or(Level::WARN);
    let subscriber = FmtSubscriber::builder()
        .with_max_level(level)
        .with_writer(io::stderr)
        .finish();
    let _ = tracing::subscriber::set_global_default(subscriber);
}

fn absolute(path: &Path) -> PathBuf {
    std::path::absolute(path).unwrap_or_else(|_| path.to_path_buf())
}

/// Picks the single input source, falling back to `list.txt` in the working
/// directory.
fn resolve_input(input: &InputArgs, default_list: &Path) -> Result<JobInput> {
    if let Some(path) = &input.from_csv {
        return Ok(JobInput::FromCsv(absolute(path)));
    }
    if let Some(path) = &input.queries_file {
        return Ok(JobInput::QueriesFile(absolute(path)));
    }
    if !input.query.is_empty() {
        return Ok(JobInput::Queries(input.query.clone()));
    }
    if default_list.exists() {
        return Ok(JobInput::QueriesFile(absolute(default_list)));
    }
    Err(BatchError::NoInput.into())
}

/// Single updating progress line, e.g. ` 42.10%    3.20MB/   7.60MB   1.05MB/s  ETA    4s`.
fn format_progress_line(event: &ProgressEvent) -> String {
    match event {
        ProgressEvent::Downloading {
            downloaded,
            total,
            speed,
            eta,
        } => {
            let downloaded_mb = *downloaded as f64 / MIB;
            let mut line = match (event.percent(), total) {
                (Some(percent), Some(total)) => format!(
                    "{percent:6.2}%  {downloaded_mb:7.2}MB/{:7.2}MB",
                    *total as f64 / MIB
                ),
                _ => format!("{downloaded_mb:7.2}MB"),
            };
            if let Some(speed) = speed.filter(|speed| *speed > 0.0) {
                line.push_str(&format!("  {:5.2}MB/s", speed / MIB));
            }
            if let Some(eta) = eta.filter(|eta| *eta > 0) {
                line.push_str(&format!("  ETA {eta:4}s"));
            }
            line
        }
        ProgressEvent::PostProcessing => "Download finished. Post-processing...".to_string(),
    }
}

/// Stdout rendering of job events.
#[derive(Default)]
struct Console {
    progress_active: bool,
}

impl Console {
    fn status(&mut self, message: &str) {
        self.end_progress();
        println!("{message}");
    }

    fn end_progress(&mut self) {
        if self.progress_active {
            println!();
            self.progress_active = false;
        }
    }

    fn render(&mut self, event: &JobEvent) {
        match event {
            JobEvent::Status(message) => self.status(message),
            JobEvent::Download(DownloadEvent::Progress { event, .. }) => {
                let line = format_progress_line(event);
                print!("\r{line:<PROGRESS_WIDTH$}");
                let _ = io::stdout().flush();
                self.progress_active = true;
                if matches!(event, ProgressEvent::PostProcessing) {
                    self.end_progress();
                }
            }
            JobEvent::Download(download) => {
                if let Some(line) = download.status_line() {
                    self.status(&line);
                }
            }
            JobEvent::LedgerBuilt(_) | JobEvent::Finished(_) | JobEvent::Failed(_) => {}
        }
    }

    fn finish(&mut self, summary: &JobSummary, out_dir: &Path, no_download: bool) {
        match summary.download {
            Some(download) if download.cancelled => self.status(&format!(
                "Stopped early. {} downloaded, {} skipped. Output: {}",
                download.downloaded,
                download.skipped,
                out_dir.display()
            )),
            Some(_) => self.status(&format!("All done. Output: {}", out_dir.display())),
            None if no_download && summary.rows > 0 => {}
            None => self.status("Nothing to download."),
        }
    }
}
