#![forbid(unsafe_code)]

//! Locates an `ffmpeg/` directory shipped next to the executable so yt-dlp
//! can transcode without a system-wide install.

use std::env;
use std::path::{Path, PathBuf};

pub const BUNDLE_SUBDIR: &str = "ffmpeg";

#[cfg(windows)]
const FFMPEG_BIN: &str = "ffmpeg.exe";
#[cfg(not(windows))]
const FFMPEG_BIN: &str = "ffmpeg";
#[cfg(windows)]
const FFPROBE_BIN: &str = "ffprobe.exe";
#[cfg(not(windows))]
const FFPROBE_BIN: &str = "ffprobe";

/// Returns `<exe dir>/ffmpeg` when it holds both `ffmpeg` and `ffprobe`.
/// `None` lets yt-dlp fall back to whatever is on PATH.
pub fn find_bundled_ffmpeg_dir() -> Option<PathBuf> {
    let exe_dir = env::current_exe()
        .ok()
        .and_then(|exe| exe.parent().map(Path::to_path_buf));
    find_ffmpeg_dir_in(exe_dir.iter().map(PathBuf::as_path))
}

pub fn find_ffmpeg_dir_in<'a>(bases: impl IntoIterator<Item = &'a Path>) -> Option<PathBuf> {
    bases.into_iter().find_map(|base| {
        let dir = base.join(BUNDLE_SUBDIR);
        (dir.join(FFMPEG_BIN).is_file() && dir.join(FFPROBE_BIN).is_file()).then_some(dir)
    })
}
