#![forbid(unsafe_code)]

use crate::storage::default_base_run_dir;
use anyhow::{Context, Result};
use std::{
    collections::HashMap,
    env, fs,
    io::ErrorKind,
    path::{Path, PathBuf},
};

pub const DEFAULT_ENV_PATH: &str = ".env";
pub const DEFAULT_OUT_DIR: &str = "downloads";
pub const DEFAULT_YTDLP: &str = "yt-dlp";
pub const DEFAULT_LOG_LEVEL: &str = "warn";

const RUN_DIR_KEY: &str = "YTBATCH_RUN_DIR";
const OUT_DIR_KEY: &str = "YTBATCH_OUT_DIR";
const YTDLP_KEY: &str = "YTBATCH_YTDLP";
const LOG_KEY: &str = "YTBATCH_LOG";
const KEY_PREFIX: &str = "YTBATCH_";

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Settings {
    pub base_run_dir: PathBuf,
    pub out_dir: PathBuf,
    pub ytdlp: PathBuf,
    pub log_level: String,
}

/// Values given on the command line. They win over the environment and the
/// `.env` file.
#[derive(Debug, Clone, Default)]
pub struct SettingsOverrides {
    pub base_run_dir: Option<PathBuf>,
    pub out_dir: Option<PathBuf>,
    pub ytdlp: Option<PathBuf>,
    pub log_level: Option<String>,
    pub env_path: Option<PathBuf>,
}

pub fn resolve_settings(overrides: SettingsOverrides) -> Result<Settings> {
    let env_path = overrides
        .env_path
        .clone()
        .unwrap_or_else(|| PathBuf::from(DEFAULT_ENV_PATH));
    let file_vars = read_env_file(&env_path)?;
    Ok(build_settings(&file_vars, env_var_string, overrides))
}

fn build_settings(
    file_vars: &HashMap<String, String>,
    env_lookup: impl Fn(&str) -> Option<String>,
    overrides: SettingsOverrides,
) -> Settings {
    let base_run_dir = overrides
        .base_run_dir
        .or_else(|| lookup_value(RUN_DIR_KEY, file_vars, &env_lookup).map(PathBuf::from))
        .unwrap_or_else(default_base_run_dir);
    let out_dir = overrides
        .out_dir
        .or_else(|| lookup_value(OUT_DIR_KEY, file_vars, &env_lookup).map(PathBuf::from))
        .unwrap_or_else(|| PathBuf::from(DEFAULT_OUT_DIR));
    let ytdlp = overrides
        .ytdlp
        .or_else(|| lookup_value(YTDLP_KEY, file_vars, &env_lookup).map(PathBuf::from))
        .unwrap_or_else(|| PathBuf::from(DEFAULT_YTDLP));
    let log_level = overrides
        .log_level
        .map(|value| value.trim().to_string())
        .filter(|value| !value.is_empty())
        .or_else(|| lookup_value(LOG_KEY, file_vars, &env_lookup))
        .unwrap_or_else(|| DEFAULT_LOG_LEVEL.to_string());

    Settings {
        base_run_dir,
        out_dir,
        ytdlp,
        log_level,
    }
}

fn env_var_string(key: &str) -> Option<String> {
    env::var(key).ok().and_then(non_blank)
}

fn non_blank(value: String) -> Option<String> {
    let trimmed = value.trim();
    if trimmed.is_empty() {
        None
    } else {
        Some(trimmed.to_string())
    }
}

fn lookup_value(
    key: &str,
    file_vars: &HashMap<String, String>,
    env_lookup: &impl Fn(&str) -> Option<String>,
) -> Option<String> {
    env_lookup(key).or_else(|| file_vars.get(key).cloned().and_then(non_blank))
}

/// Collects `YTBATCH_*` assignments from a dotenv-style file. Other keys
/// are ignored and a missing file yields nothing.
pub fn read_env_file(path: &Path) -> Result<HashMap<String, String>> {
    let content = match fs::read_to_string(path) {
        Ok(content) => content,
        Err(err) if err.kind() == ErrorKind::NotFound => return Ok(HashMap::new()),
        Err(err) => {
            return Err(err).with_context(|| format!("reading settings file {}", path.display()));
        }
    };

    Ok(content
        .lines()
        .filter_map(parse_assignment)
        .filter(|(key, _)| key.starts_with(KEY_PREFIX))
        .map(|(key, value)| (key.to_string(), value.to_string()))
        .collect())
}

/// `KEY=value`, optionally prefixed with `export`. Comments and lines
/// without `=` yield `None`.
fn parse_assignment(line: &str) -> Option<(&str, &str)> {
    let line = line.trim();
    if line.starts_with('#') {
        return None;
    }
    let line = line.strip_prefix("export ").unwrap_or(line);
    let (key, value) = line.split_once('=')?;
    let key = key.trim();
    (!key.is_empty()).then(|| (key, unquote(value.trim())))
}

fn unquote(value: &str) -> &str {
    ['"', '\'']
        .into_iter()
        .find_map(|quote| value.strip_prefix(quote)?.strip_suffix(quote))
        .unwrap_or(value)
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::{TempDir, tempdir};

    fn env_file(contents: &str) -> (TempDir, PathBuf) {
        let dir = tempdir().unwrap();
        let path = dir.path().join(DEFAULT_ENV_PATH);
        fs::write(&path, contents).unwrap();
        (dir, path)
    }

    fn settings_from(contents: &str) -> Settings {
        let (_dir, path) = env_file(contents);
        let vars = read_env_file(&path).unwrap();
        build_settings(&vars, |_| None, SettingsOverrides::default())
    }

    #[test]
    fn defaults_apply_without_any_source() {
        let settings = build_settings(&HashMap::new(), |_| None, SettingsOverrides::default());
        assert_eq!(settings.out_dir, PathBuf::from(DEFAULT_OUT_DIR));
        assert_eq!(settings.ytdlp, PathBuf::from(DEFAULT_YTDLP));
        assert_eq!(settings.base_run_dir, default_base_run_dir());
        assert_eq!(settings.log_level, DEFAULT_LOG_LEVEL);
    }

    #[test]
    fn env_file_values_are_used() {
        let settings = settings_from(
            "YTBATCH_RUN_DIR=\"/tmp/runs\"\nYTBATCH_OUT_DIR='/music'\nYTBATCH_YTDLP=/opt/yt-dlp\n",
        );
        assert_eq!(settings.base_run_dir, PathBuf::from("/tmp/runs"));
        assert_eq!(settings.out_dir, PathBuf::from("/music"));
        assert_eq!(settings.ytdlp, PathBuf::from("/opt/yt-dlp"));
    }

    #[test]
    fn read_env_file_keeps_only_ytbatch_assignments() {
        let (_dir, path) = env_file(
            r#"
            export YTBATCH_LOG="debug"
            # YTBATCH_YTDLP=/commented/out
            YTBATCH_RUN_DIR
            YTBATCH_OUT_DIR =  'out'
            HOME=/elsewhere
            "#,
        );
        let vars = read_env_file(&path).unwrap();
        assert_eq!(
            vars,
            HashMap::from([
                (LOG_KEY.to_string(), "debug".to_string()),
                (OUT_DIR_KEY.to_string(), "out".to_string()),
            ])
        );
    }

    #[test]
    fn unquote_needs_matching_pair() {
        assert_eq!(unquote("\"/music\""), "/music");
        assert_eq!(unquote("'/music'"), "/music");
        assert_eq!(unquote("\"/music'"), "\"/music'");
        assert_eq!(unquote("\""), "\"");
    }

    #[test]
    fn read_env_file_missing_file_returns_empty() {
        let dir = tempdir().unwrap();
        let vars = read_env_file(&dir.path().join("missing.env")).unwrap();
        assert!(vars.is_empty());
    }

    #[test]
    fn override_beats_env_beats_file() {
        let mut vars = HashMap::new();
        vars.insert(OUT_DIR_KEY.to_string(), "/file-out".to_string());
        vars.insert(YTDLP_KEY.to_string(), "/file-ytdlp".to_string());
        vars.insert(LOG_KEY.to_string(), "info".to_string());

        let settings = build_settings(
            &vars,
            |key| (key == YTDLP_KEY).then(|| "/env-ytdlp".to_string()),
            SettingsOverrides {
                out_dir: Some(PathBuf::from("/cli-out")),
                ..SettingsOverrides::default()
            },
        );

        assert_eq!(settings.out_dir, PathBuf::from("/cli-out"));
        assert_eq!(settings.ytdlp, PathBuf::from("/env-ytdlp"));
        assert_eq!(settings.log_level, "info");
    }

    #[test]
    fn blank_values_are_ignored() {
        let settings = build_settings(
            &HashMap::from([(LOG_KEY.to_string(), "  ".to_string())]),
            |_| None,
            SettingsOverrides {
                log_level: Some("   ".into()),
                ..SettingsOverrides::default()
            },
        );
        assert_eq!(settings.log_level, DEFAULT_LOG_LEVEL);
    }
}
