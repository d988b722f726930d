#![forbid(unsafe_code)]

//! The search/download service the pipeline delegates to, and its yt-dlp
//! implementation.
//!
//! yt-dlp is driven as a subprocess. Searches use `--dump-single-json` on a
//! `ytsearch1:` term; downloads stream a custom `--progress-template` on
//! stdout which is parsed back into [`ProgressEvent`]s.

use crate::error::BatchError;
use crate::models::{DownloadMode, SearchRow};
use anyhow::{Context, Result};
use serde::Deserialize;
use std::io::{self, BufRead, BufReader, ErrorKind, Read};
use std::path::{Path, PathBuf};
#[cfg(unix)]
use std::os::unix::process::CommandExt;
use std::process::{Command, Stdio};
use std::thread;
use tracing::debug;

pub const WATCH_URL_PREFIX: &str = "https://www.youtube.com/watch?v=";
pub const OUTPUT_TEMPLATE: &str = "%(title).80s [%(id)s].%(ext)s";
pub const MP3_QUALITY: &str = "192";
const PROGRESS_MARKER: &str = "ytbatch-progress|";
const PROGRESS_TEMPLATE: &str = "download:ytbatch-progress|%(progress.status)s|%(progress.downloaded_bytes)s|%(progress.total_bytes)s|%(progress.total_bytes_estimate)s|%(progress.speed)s|%(progress.eta)s";
const POSTPROCESS_TEMPLATE: &str = "postprocess:ytbatch-progress|postprocess|%(progress.status)s";

/// Timeout and retry budget handed to yt-dlp.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct NetworkBudget {
    pub socket_timeout: u32,
    pub retries: u32,
}

impl NetworkBudget {
    pub const SEARCH: NetworkBudget = NetworkBudget {
        socket_timeout: 15,
        retries: 3,
    };
    pub const DOWNLOAD: NetworkBudget = NetworkBudget {
        socket_timeout: 30,
        retries: 3,
    };
}

/// First hit of a flat search.
#[derive(Debug, Clone, Default, PartialEq, Eq, Deserialize)]
pub struct SearchEntry {
    #[serde(default)]
    pub id: Option<String>,
    #[serde(default)]
    pub title: Option<String>,
    #[serde(default)]
    pub url: Option<String>,
}

#[derive(Debug, Deserialize)]
struct SearchListing {
    #[serde(default)]
    entries: Option<Vec<SearchEntry>>,
}

/// Maps a search hit to a ledger row, rebuilding a watch URL when the
/// service only returned an id or a relative path.
pub fn entry_to_row(query: &str, entry: &SearchEntry) -> SearchRow {
    let field = |value: &Option<String>| value.as_deref().unwrap_or("").trim().to_string();
    let video_id = field(&entry.id);
    let title = field(&entry.title);
    let mut url = field(&entry.url);

    if !url.is_empty() && !url.starts_with("http") {
        let key = if video_id.is_empty() { &url } else { &video_id };
        url = format!("{WATCH_URL_PREFIX}{key}");
    }

    SearchRow {
        query: query.to_string(),
        video_url: url,
        video_id,
        title,
    }
}

/// Post-processing step applied after a download.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum PostProcessor {
    ExtractAudio {
        codec: &'static str,
        quality: &'static str,
    },
}

/// Fully resolved download configuration for one mode.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DownloadOptions {
    pub output_template: PathBuf,
    pub format: &'static str,
    pub postprocessors: Vec<PostProcessor>,
    pub merge_output_format: Option<&'static str>,
    pub budget: NetworkBudget,
    pub ffmpeg_location: Option<PathBuf>,
}

impl DownloadOptions {
    pub fn for_mode(mode: DownloadMode, out_dir: &Path, ffmpeg_location: Option<PathBuf>) -> Self {
        let (format, postprocessors, merge_output_format) = match mode {
            DownloadMode::AudioMp3 => (
                "bestaudio/best",
                vec![PostProcessor::ExtractAudio {
                    codec: "mp3",
                    quality: MP3_QUALITY,
                }],
                None,
            ),
            DownloadMode::AudioOriginal => ("bestaudio/best", Vec::new(), None),
            DownloadMode::VideoOriginal => ("bestvideo+bestaudio/best", Vec::new(), Some("mp4")),
        };

        Self {
            output_template: out_dir.join(OUTPUT_TEMPLATE),
            format,
            postprocessors,
            merge_output_format,
            budget: NetworkBudget::DOWNLOAD,
            ffmpeg_location,
        }
    }

    /// Command-line arguments, excluding the URL.
    pub fn to_args(&self) -> Vec<String> {
        let mut args = vec![
            "--format".to_string(),
            self.format.to_string(),
            "--output".to_string(),
            self.output_template.to_string_lossy().into_owned(),
            "--no-playlist".to_string(),
            "--no-warnings".to_string(),
            "--newline".to_string(),
            "--progress".to_string(),
            "--progress-template".to_string(),
            PROGRESS_TEMPLATE.to_string(),
            "--progress-template".to_string(),
            POSTPROCESS_TEMPLATE.to_string(),
            "--socket-timeout".to_string(),
            self.budget.socket_timeout.to_string(),
            "--retries".to_string(),
            self.budget.retries.to_string(),
        ];

        for processor in &self.postprocessors {
            match processor {
                PostProcessor::ExtractAudio { codec, quality } => {
                    args.extend([
                        "--extract-audio".to_string(),
                        "--audio-format".to_string(),
                        codec.to_string(),
                        "--audio-quality".to_string(),
                        format!("{quality}K"),
                    ]);
                }
            }
        }

        if let Some(container) = self.merge_output_format {
            args.extend(["--merge-output-format".to_string(), container.to_string()]);
        }

        if let Some(location) = &self.ffmpeg_location {
            args.extend([
                "--ffmpeg-location".to_string(),
                location.to_string_lossy().into_owned(),
            ]);
        }

        args
    }
}

/// One progress report from an active transfer.
#[derive(Debug, Clone, PartialEq)]
pub enum ProgressEvent {
    Downloading {
        downloaded: u64,
        total: Option<u64>,
        speed: Option<f64>,
        eta: Option<u64>,
    },
    /// The transfer finished and post-processing started.
    PostProcessing,
}

impl ProgressEvent {
    /// `downloaded / total * 100` when the total is known.
    pub fn percent(&self) -> Option<f64> {
        match self {
            ProgressEvent::Downloading {
                downloaded,
                total: Some(total),
                ..
            } if *total > 0 => Some(*downloaded as f64 / *total as f64 * 100.0),
            _ => None,
        }
    }
}

/// Parses one line emitted through our progress templates. Anything else
/// yt-dlp prints yields `None`.
pub fn parse_progress_line(line: &str) -> Option<ProgressEvent> {
    let rest = line.trim().strip_prefix(PROGRESS_MARKER)?;
    let mut fields = rest.split('|');
    match fields.next()? {
        "downloading" => {
            let downloaded = fields.next().and_then(parse_number).unwrap_or(0.0) as u64;
            let total = fields.next().and_then(parse_number);
            let estimate = fields.next().and_then(parse_number);
            let speed = fields.next().and_then(parse_number);
            let eta = fields.next().and_then(parse_number);
            Some(ProgressEvent::Downloading {
                downloaded,
                total: total.or(estimate).map(|value| value as u64),
                speed,
                eta: eta.map(|value| value as u64),
            })
        }
        "finished" | "postprocess" => Some(ProgressEvent::PostProcessing),
        _ => None,
    }
}

fn parse_number(value: &str) -> Option<f64> {
    value
        .trim()
        .parse::<f64>()
        .ok()
        .filter(|number| number.is_finite() && *number >= 0.0)
}

/// The external search/download engine.
pub trait MediaService: Send + Sync {
    /// Returns the best match for `query` without downloading anything.
    fn search_first(&self, query: &str, budget: NetworkBudget) -> Result<Option<SearchEntry>>;

    /// Downloads `url`, reporting progress while the transfer runs. Fails
    /// when the service reports an error.
    fn download(
        &self,
        url: &str,
        options: &DownloadOptions,
        on_progress: &mut dyn FnMut(ProgressEvent),
    ) -> Result<()>;
}

/// [`MediaService`] backed by the `yt-dlp` executable.
#[derive(Debug, Clone)]
pub struct YtDlp {
    program: PathBuf,
}

impl YtDlp {
    pub fn new(program: impl Into<PathBuf>) -> Self {
        Self {
            program: program.into(),
        }
    }

    /// On unix the child gets its own process group: a terminal Ctrl-C must
    /// reach only ytbatch, never the transfer in flight.
    fn command(&self) -> Command {
        let mut command = Command::new(&self.program);
        #[cfg(unix)]
        command.process_group(0);
        command
    }

    fn tool_name(&self) -> String {
        self.program.to_string_lossy().into_owned()
    }

    fn spawn_error(&self, err: std::io::Error) -> anyhow::Error {
        if err.kind() == ErrorKind::NotFound {
            BatchError::ToolMissing(self.tool_name()).into()
        } else {
            anyhow::Error::new(err).context(format!("running {}", self.tool_name()))
        }
    }

    /// Runs `yt-dlp --version` so a missing install fails before any work.
    pub fn ensure_available(&self) -> Result<()> {
        let status = self
            .command()
            .arg("--version")
            .stdout(Stdio::null())
            .stderr(Stdio::null())
            .status()
            .map_err(|err| self.spawn_error(err))?;
        if !status.success() {
            return Err(BatchError::ToolFailed {
                tool: self.tool_name(),
                code: status.code(),
                stderr: "--version returned a failure status".to_string(),
            }
            .into());
        }
        Ok(())
    }
}

impl MediaService for YtDlp {
    fn search_first(&self, query: &str, budget: NetworkBudget) -> Result<Option<SearchEntry>> {
        let mut command = self.command();
        command
            .arg("--dump-single-json")
            .arg("--flat-playlist")
            .arg("--skip-download")
            .arg("--no-warnings")
            .arg("--quiet")
            .arg("--default-search")
            .arg("ytsearch")
            .arg("--socket-timeout")
            .arg(budget.socket_timeout.to_string())
            .arg("--retries")
            .arg(budget.retries.to_string())
            .arg(format!("ytsearch1:{query}"));
        debug!(?command, "searching");

        let output = command.output().map_err(|err| self.spawn_error(err))?;
        if !output.status.success() {
            return Err(BatchError::ToolFailed {
                tool: self.tool_name(),
                code: output.status.code(),
                stderr: last_line(&String::from_utf8_lossy(&output.stderr)),
            }
            .into());
        }

        let listing: SearchListing = serde_json::from_slice(&output.stdout)
            .with_context(|| format!("parsing search results for {query:?}"))?;
        Ok(listing.entries.unwrap_or_default().into_iter().next())
    }

    fn download(
        &self,
        url: &str,
        options: &DownloadOptions,
        on_progress: &mut dyn FnMut(ProgressEvent),
    ) -> Result<()> {
        let mut command = self.command();
        command
            .args(options.to_args())
            .arg("--")
            .arg(url)
            .stdout(Stdio::piped())
            .stderr(Stdio::piped());
        debug!(?command, "downloading");

        let mut child = command.spawn().map_err(|err| self.spawn_error(err))?;

        // Drained on its own thread so a chatty stderr cannot block stdout.
        let stderr_reader = child.stderr.take().map(|mut stderr| {
            thread::spawn(move || {
                let mut buffer = String::new();
                let _ = stderr.read_to_string(&mut buffer);
                buffer
            })
        });

        let relayed = match child.stdout.take() {
            Some(stdout) => relay_progress(stdout, on_progress),
            None => Ok(()),
        };
        if let Err(err) = relayed {
            let _ = child.kill();
            let _ = child.wait();
            return Err(anyhow::Error::new(err).context("reading yt-dlp output"));
        }

        let status = child.wait().context("waiting for yt-dlp")?;
        let stderr = stderr_reader
            .and_then(|handle| handle.join().ok())
            .unwrap_or_default();

        if !status.success() {
            return Err(BatchError::ToolFailed {
                tool: self.tool_name(),
                code: status.code(),
                stderr: last_line(&stderr),
            }
            .into());
        }
        Ok(())
    }
}

fn relay_progress(
    stdout: impl Read,
    on_progress: &mut dyn FnMut(ProgressEvent),
) -> io::Result<()> {
    for line in BufReader::new(stdout).lines() {
        if let Some(event) = parse_progress_line(&line?) {
            on_progress(event);
        }
    }
    Ok(())
}

fn last_line(text: &str) -> String {
    text.lines()
        .map(str::trim)
        .filter(|line| !line.is_empty())
        .last()
        .unwrap_or("unknown error")
        .to_string()
}
