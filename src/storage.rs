#![forbid(unsafe_code)]

//! Where run directories live and how they are named.

use anyhow::{Context, Result};
use chrono::{DateTime, Local};
use std::fs;
use std::io::ErrorKind;
use std::path::{Path, PathBuf};

pub const APP_NAME: &str = "ytbatch";
pub const RUNS_SUBDIR: &str = "runs";
const TIMESTAMP_FORMAT: &str = "%Y-%m-%d_%H%M%S";

/// Per-user cache directory, falling back to a relative folder on platforms
/// without one.
pub fn default_base_run_dir() -> PathBuf {
    dirs::cache_dir()
        .map(|dir| dir.join(APP_NAME))
        .unwrap_or_else(|| PathBuf::from(APP_NAME))
}

/// Creates `<base>/runs/<YYYY-MM-DD_HHMMSS>`. A second run inside the same
/// second gets a `-2`, `-3`, ... suffix instead of sharing the directory.
pub fn make_run_dir(base_dir: Option<&Path>) -> Result<PathBuf> {
    let base = base_dir
        .map(Path::to_path_buf)
        .unwrap_or_else(default_base_run_dir);
    make_run_dir_at(&base, Local::now())
}

fn make_run_dir_at(base: &Path, now: DateTime<Local>) -> Result<PathBuf> {
    let runs = base.join(RUNS_SUBDIR);
    fs::create_dir_all(&runs).with_context(|| format!("creating {}", runs.display()))?;

    let stamp = now.format(TIMESTAMP_FORMAT).to_string();
    let mut attempt = 1u32;
    loop {
        let name = if attempt == 1 {
            stamp.clone()
        } else {
            format!("{stamp}-{attempt}")
        };
        let candidate = runs.join(name);
        match fs::create_dir(&candidate) {
            Ok(()) => return Ok(candidate),
            Err(err) if err.kind() == ErrorKind::AlreadyExists => attempt += 1,
            Err(err) => {
                return Err(err).with_context(|| format!("creating {}", candidate.display()));
            }
        }
    }
}
