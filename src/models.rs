#![forbid(unsafe_code)]

//! Plain data shared by every stage of a run.

use crate::error::BatchError;
use serde::{Deserialize, Serialize};
use std::fmt;
use std::path::PathBuf;
use std::str::FromStr;

/// What to fetch for each resolved row.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum DownloadMode {
    #[default]
    AudioMp3,
    AudioOriginal,
    VideoOriginal,
}

impl DownloadMode {
    pub const ALL: [DownloadMode; 3] = [
        DownloadMode::AudioMp3,
        DownloadMode::AudioOriginal,
        DownloadMode::VideoOriginal,
    ];

    pub fn as_str(self) -> &'static str {
        match self {
            DownloadMode::AudioMp3 => "audio-mp3",
            DownloadMode::AudioOriginal => "audio-original",
            DownloadMode::VideoOriginal => "video-original",
        }
    }
}

impl fmt::Display for DownloadMode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for DownloadMode {
    type Err = BatchError;

    fn from_str(value: &str) -> Result<Self, Self::Err> {
        DownloadMode::ALL
            .into_iter()
            .find(|mode| mode.as_str() == value.trim())
            .ok_or_else(|| BatchError::UnsupportedMode(value.to_string()))
    }
}

/// One resolved query. Rows are never mutated after construction.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SearchRow {
    pub query: String,
    pub video_url: String,
    #[serde(default)]
    pub video_id: String,
    #[serde(default)]
    pub title: String,
}

impl SearchRow {
    /// A row is downloadable when its URL is present and is not one of the
    /// ledger sentinels.
    pub fn is_downloadable(&self) -> bool {
        is_downloadable_url(&self.video_url)
    }

    /// Human readable name used in status lines.
    pub fn label(&self) -> &str {
        [&self.title, &self.query, &self.video_url]
            .into_iter()
            .find(|value| !value.is_empty())
            .map(String::as_str)
            .unwrap_or("")
    }
}

pub(crate) fn is_downloadable_url(url: &str) -> bool {
    let upper = url.trim().to_uppercase();
    !upper.is_empty() && !upper.starts_with("ERROR") && !upper.starts_with("NO RESULTS")
}

/// Location of one ledger on disk.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RunPaths {
    pub run_dir: PathBuf,
    pub csv_path: PathBuf,
}
