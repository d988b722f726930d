#![forbid(unsafe_code)]

//! Sequential download of resolved rows with skip-existing and cooperative
//! cancellation.

use crate::models::{DownloadMode, SearchRow};
use crate::ytdlp::{DownloadOptions, MediaService, ProgressEvent};
use anyhow::{Context, Result};
use std::fs;
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicBool, Ordering};
use tracing::warn;
use walkdir::WalkDir;

/// How to download a batch.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DownloadSettings {
    pub mode: DownloadMode,
    pub out_dir: PathBuf,
    pub skip_existing: bool,
    pub ffmpeg_location: Option<PathBuf>,
}

/// What happened to each row, in order.
#[derive(Debug, Clone, PartialEq)]
pub enum DownloadEvent {
    Started {
        index: usize,
        total: usize,
        label: String,
    },
    Progress {
        index: usize,
        event: ProgressEvent,
    },
    Skipped {
        index: usize,
    },
    Completed {
        index: usize,
    },
    Cancelled,
}

impl DownloadEvent {
    /// Status line shown for row transitions. Progress has its own rendering.
    pub fn status_line(&self) -> Option<String> {
        match self {
            DownloadEvent::Started {
                index,
                total,
                label,
            } => Some(format!("[{}/{}] {}", index + 1, total, label)),
            DownloadEvent::Skipped { .. } => Some("Skipping (already exists).".to_string()),
            DownloadEvent::Completed { .. } => Some("Done.".to_string()),
            DownloadEvent::Cancelled => Some("Cancelled.".to_string()),
            DownloadEvent::Progress { .. } => None,
        }
    }
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct DownloadSummary {
    pub downloaded: usize,
    pub skipped: usize,
    pub cancelled: bool,
}

/// True when `out_dir` holds a file named `…[<video_id>].<ext>`. An empty id
/// never matches.
pub fn is_already_downloaded(out_dir: &Path, video_id: &str) -> bool {
    if video_id.is_empty() || !out_dir.is_dir() {
        return false;
    }
    let needle = format!("[{video_id}].");

    WalkDir::new(out_dir)
        .min_depth(1)
        .max_depth(1)
        .into_iter()
        .filter_map(|entry| match entry {
            Ok(entry) => Some(entry),
            Err(err) => {
                warn!(error = %err, "skipping unreadable entry");
                None
            }
        })
        .filter(|entry| entry.file_type().is_file())
        .any(|entry| entry.file_name().to_string_lossy().contains(&needle))
}

/// Downloads each row in order. `cancel` is checked before every row, so a
/// transfer already running always finishes. The first download failure
/// aborts the batch; files already written stay on disk.
pub fn download_rows(
    rows: &[SearchRow],
    settings: &DownloadSettings,
    service: &dyn MediaService,
    cancel: &AtomicBool,
    on_event: &mut dyn FnMut(DownloadEvent),
) -> Result<DownloadSummary> {
    fs::create_dir_all(&settings.out_dir)
        .with_context(|| format!("creating {}", settings.out_dir.display()))?;
    let options = DownloadOptions::for_mode(
        settings.mode,
        &settings.out_dir,
        settings.ffmpeg_location.clone(),
    );

    let mut summary = DownloadSummary::default();
    let total = rows.len();

    for (index, row) in rows.iter().enumerate() {
        if cancel.load(Ordering::Relaxed) {
            summary.cancelled = true;
            on_event(DownloadEvent::Cancelled);
            break;
        }

        on_event(DownloadEvent::Started {
            index,
            total,
            label: row.label().to_string(),
        });

        if settings.skip_existing && is_already_downloaded(&settings.out_dir, &row.video_id) {
            summary.skipped += 1;
            on_event(DownloadEvent::Skipped { index });
            continue;
        }

        service
            .download(&row.video_url, &options, &mut |event| {
                if !cancel.load(Ordering::Relaxed) {
                    on_event(DownloadEvent::Progress { index, event });
                }
            })
            .with_context(|| format!("downloading {}", row.video_url))?;

        summary.downloaded += 1;
        on_event(DownloadEvent::Completed { index });
    }

    Ok(summary)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::ytdlp::{NetworkBudget, SearchEntry};
    use anyhow::bail;
    use std::sync::Mutex;
    use tempfile::tempdir;

    /// Records requested URLs, writes `<id>` files, and fails for URLs
    /// containing "fail".
    #[derive(Default)]
    struct RecordingService {
        requested: Mutex<Vec<String>>,
        cancel_after_first: Option<std::sync::Arc<AtomicBool>>,
    }

    impl MediaService for RecordingService {
        fn search_first(&self, _query: &str, _budget: NetworkBudget) -> Result<Option<SearchEntry>> {
            Ok(None)
        }

        fn download(
            &self,
            url: &str,
            options: &DownloadOptions,
            on_progress: &mut dyn FnMut(ProgressEvent),
        ) -> Result<()> {
            self.requested.lock().unwrap().push(url.to_string());
            if url.contains("fail") {
                bail!("HTTP Error 403: Forbidden");
            }
            on_progress(ProgressEvent::Downloading {
                downloaded: 5,
                total: Some(10),
                speed: Some(1.0),
                eta: Some(5),
            });
            if let Some(flag) = &self.cancel_after_first {
                flag.store(true, Ordering::Relaxed);
            }
            on_progress(ProgressEvent::PostProcessing);

            let id = url.rsplit('=').next().unwrap_or("x");
            let dir = options.output_template.parent().unwrap();
            fs::write(dir.join(format!("Title [{id}].mp3")), b"audio")?;
            Ok(())
        }
    }

    fn row(query: &str, id: &str) -> SearchRow {
        SearchRow {
            query: query.to_string(),
            video_url: format!("https://www.youtube.com/watch?v={id}"),
            video_id: id.to_string(),
            title: format!("{query} title"),
        }
    }

    fn settings(out_dir: &Path, skip_existing: bool) -> DownloadSettings {
        DownloadSettings {
            mode: DownloadMode::AudioMp3,
            out_dir: out_dir.to_path_buf(),
            skip_existing,
            ffmpeg_location: None,
        }
    }

    #[test]
    fn existing_file_with_id_in_brackets_is_detected() {
        let dir = tempdir().unwrap();
        fs::write(dir.path().join("Some Song [abc123].mp3"), b"").unwrap();
        fs::write(dir.path().join("Other [zzz].webm.part"), b"").unwrap();

        assert!(is_already_downloaded(dir.path(), "abc123"));
        assert!(!is_already_downloaded(dir.path(), "abc12"));
        assert!(!is_already_downloaded(dir.path(), ""));
        assert!(!is_already_downloaded(&dir.path().join("missing"), "abc123"));
    }

    #[test]
    fn existence_ignores_title_and_extension() {
        let dir = tempdir().unwrap();
        fs::write(dir.path().join("Totally different [abc123].m4a"), b"").unwrap();
        fs::create_dir(dir.path().join("folder [dir999].d")).unwrap();
        assert!(is_already_downloaded(dir.path(), "abc123"));
        assert!(!is_already_downloaded(dir.path(), "dir999"));
    }

    #[test]
    fn downloads_every_row_and_relays_progress() -> Result<()> {
        let dir = tempdir()?;
        let out = dir.path().join("out");
        let service = RecordingService::default();
        let rows = vec![row("a", "aaaaaa"), row("b", "bbbbbb")];
        let cancel = AtomicBool::new(false);

        let mut events = Vec::new();
        let summary = download_rows(
            &rows,
            &settings(&out, false),
            &service,
            &cancel,
            &mut |event| events.push(event),
        )?;

        assert_eq!(
            summary,
            DownloadSummary {
                downloaded: 2,
                skipped: 0,
                cancelled: false
            }
        );
        assert!(out.join("Title [aaaaaa].mp3").is_file());
        assert_eq!(events.len(), 8);
        assert_eq!(events[0].status_line().as_deref(), Some("[1/2] a title"));
        assert!(matches!(
            &events[1],
            DownloadEvent::Progress { index: 0, event } if event.percent() == Some(50.0)
        ));
        assert_eq!(events[3], DownloadEvent::Completed { index: 0 });
        assert_eq!(events[4].status_line().as_deref(), Some("[2/2] b title"));
        Ok(())
    }

    #[test]
    fn skip_existing_avoids_service_call() -> Result<()> {
        let dir = tempdir()?;
        fs::write(dir.path().join("Old name [aaaaaa].opus"), b"")?;
        let service = RecordingService::default();
        let rows = vec![row("a", "aaaaaa"), row("b", "")];
        let cancel = AtomicBool::new(false);

        let mut events = Vec::new();
        let summary = download_rows(
            &rows,
            &settings(dir.path(), true),
            &service,
            &cancel,
            &mut |event| events.push(event),
        )?;

        assert_eq!(summary.skipped, 1);
        assert_eq!(summary.downloaded, 1);
        assert_eq!(events[1], DownloadEvent::Skipped { index: 0 });
        assert_eq!(
            service.requested.lock().unwrap().as_slice(),
            &["https://www.youtube.com/watch?v=".to_string()]
        );
        Ok(())
    }

    #[test]
    fn skip_existing_off_downloads_again() -> Result<()> {
        let dir = tempdir()?;
        fs::write(dir.path().join("Old [aaaaaa].mp3"), b"")?;
        let service = RecordingService::default();
        let cancel = AtomicBool::new(false);
        let summary = download_rows(
            &[row("a", "aaaaaa")],
            &settings(dir.path(), false),
            &service,
            &cancel,
            &mut |_| {},
        )?;
        assert_eq!(summary.downloaded, 1);
        Ok(())
    }

    #[test]
    fn cancel_stops_at_next_row_boundary() -> Result<()> {
        let dir = tempdir()?;
        let cancel = std::sync::Arc::new(AtomicBool::new(false));
        let service = RecordingService {
            cancel_after_first: Some(cancel.clone()),
            ..RecordingService::default()
        };
        let rows = vec![row("a", "aaaaaa"), row("b", "bbbbbb")];

        let mut events = Vec::new();
        let summary = download_rows(
            &rows,
            &settings(dir.path(), false),
            &service,
            &cancel,
            &mut |event| events.push(event),
        )?;

        assert_eq!(summary.downloaded, 1);
        assert!(summary.cancelled);
        assert_eq!(service.requested.lock().unwrap().len(), 1);
        // Progress after the flag flips is dropped; the in-flight row still completes.
        assert!(!events.contains(&DownloadEvent::Progress {
            index: 0,
            event: ProgressEvent::PostProcessing
        }));
        assert_eq!(events.last(), Some(&DownloadEvent::Cancelled));
        assert!(dir.path().join("Title [aaaaaa].mp3").is_file());
        Ok(())
    }

    #[test]
    fn failure_aborts_remaining_rows_and_keeps_finished_files() {
        let dir = tempdir().unwrap();
        let service = RecordingService::default();
        let rows = vec![row("a", "aaaaaa"), row("b", "fail"), row("c", "cccccc")];
        let cancel = AtomicBool::new(false);

        let err = download_rows(
            &rows,
            &settings(dir.path(), false),
            &service,
            &cancel,
            &mut |_| {},
        )
        .unwrap_err();

        assert!(format!("{err:#}").contains("HTTP Error 403"));
        assert_eq!(service.requested.lock().unwrap().len(), 2);
        assert!(dir.path().join("Title [aaaaaa].mp3").is_file());
    }
}
