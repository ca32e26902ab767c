//! Config file loading for CLI defaults.
//!
//! The file holds `key = value` lines. Strings are double-quoted, integers
//! and booleans are bare, `#` starts a comment outside strings, and the
//! status list is comma-separated. Values from the file override the
//! built-in defaults; command-line flags override both.

use std::env;
use std::fs;
use std::path::{Path, PathBuf};
use std::time::Duration;

use anyhow::{Context, Result, bail};
use webmirror_core::CrawlConfig;

/// Values read from a config file. Absent keys leave the defaults alone.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct FileConfig {
    pub html_dir: Option<PathBuf>,
    pub other_dir: Option<PathBuf>,
    pub backup_dir: Option<PathBuf>,
    pub database: Option<PathBuf>,
    pub batch_size: Option<usize>,
    pub max_file_size: Option<u64>,
    pub min_progress_size: Option<u64>,
    pub max_host_workers: Option<usize>,
    pub per_host_concurrency: Option<usize>,
    pub http_timeout_secs: Option<u64>,
    pub retryable_statuses: Option<Vec<u16>>,
    pub retry_max_attempts: Option<u32>,
    pub retry_base_delay_ms: Option<u64>,
    pub retry_max_delay_ms: Option<u64>,
    pub retry_multiplier: Option<f32>,
    pub max_depth: Option<u32>,
    pub max_localise_links: Option<usize>,
    pub same_host_only: Option<bool>,
    pub max_restarts: Option<u32>,
    pub restart_window_secs: Option<u64>,
}

impl FileConfig {
    /// Copies every value present in the file onto `config`.
    pub fn apply(&self, config: &mut CrawlConfig) {
        fn set<T: Clone>(slot: &mut T, value: Option<&T>) {
            if let Some(value) = value {
                slot.clone_from(value);
            }
        }
        set(&mut config.html_dir, self.html_dir.as_ref());
        set(&mut config.other_dir, self.other_dir.as_ref());
        set(&mut config.backup_dir, self.backup_dir.as_ref());
        set(&mut config.database, self.database.as_ref());
        set(&mut config.batch_size, self.batch_size.as_ref());
        set(&mut config.max_file_size, self.max_file_size.as_ref());
        set(&mut config.min_progress_size, self.min_progress_size.as_ref());
        set(&mut config.max_host_workers, self.max_host_workers.as_ref());
        set(&mut config.per_host_concurrency, self.per_host_concurrency.as_ref());
        set(&mut config.retryable_statuses, self.retryable_statuses.as_ref());
        set(&mut config.retry.max_attempts, self.retry_max_attempts.as_ref());
        set(&mut config.retry.multiplier, self.retry_multiplier.as_ref());
        set(&mut config.max_depth, self.max_depth.as_ref());
        set(&mut config.max_localise_links, self.max_localise_links.as_ref());
        set(&mut config.same_host_only, self.same_host_only.as_ref());
        set(&mut config.supervision.max_restarts, self.max_restarts.as_ref());
        if let Some(secs) = self.http_timeout_secs {
            config.http_timeout = Duration::from_secs(secs);
        }
        if let Some(ms) = self.retry_base_delay_ms {
            config.retry.base_delay = Duration::from_millis(ms);
        }
        if let Some(ms) = self.retry_max_delay_ms {
            config.retry.max_delay = Duration::from_millis(ms);
        }
        if let Some(secs) = self.restart_window_secs {
            config.supervision.window = Duration::from_secs(secs);
        }
    }
}

/// Resolves the default config path.
///
/// Priority:
/// 1. `$XDG_CONFIG_HOME/webmirror/config.toml`
/// 2. `$HOME/.config/webmirror/config.toml`
#[must_use]
pub fn resolve_default_config_path() -> Option<PathBuf> {
    if let Some(xdg_config_home) = env_var_non_empty_os("XDG_CONFIG_HOME") {
        return Some(
            PathBuf::from(xdg_config_home)
                .join("webmirror")
                .join("config.toml"),
        );
    }

    let home = env_var_non_empty_os("HOME")?;
    Some(
        PathBuf::from(home)
            .join(".config")
            .join("webmirror")
            .join("config.toml"),
    )
}

fn env_var_non_empty_os(name: &str) -> Option<std::ffi::OsString> {
    let value = env::var_os(name)?;
    if value.is_empty() { None } else { Some(value) }
}

/// Loads `explicit`, or the default config file when it exists.
///
/// An explicit path that does not exist is an error; a missing default file
/// is not.
pub fn load_config(explicit: Option<&Path>) -> Result<Option<(PathBuf, FileConfig)>> {
    if let Some(path) = explicit {
        return Ok(Some((path.to_path_buf(), load_file_config(path)?)));
    }
    let Some(path) = resolve_default_config_path() else {
        return Ok(None);
    };
    if !path.exists() {
        return Ok(None);
    }
    let config = load_file_config(&path)?;
    Ok(Some((path, config)))
}

fn load_file_config(path: &Path) -> Result<FileConfig> {
    let raw = fs::read_to_string(path)
        .with_context(|| format!("Failed to read config file '{}'", path.display()))?;
    parse_config_str(&raw)
        .with_context(|| format!("Failed to parse config file '{}'", path.display()))
}

pub(crate) fn parse_config_str(raw: &str) -> Result<FileConfig> {
    let mut cfg = FileConfig::default();
    for (line_index, raw_line) in raw.lines().enumerate() {
        let line_no = line_index + 1;
        let line = strip_inline_comment(raw_line).trim();
        if line.is_empty() {
            continue;
        }

        let Some((raw_key, raw_value)) = line.split_once('=') else {
            bail!("Invalid config syntax on line {line_no}: expected key = value");
        };
        let key = raw_key.trim();
        let value = raw_value.trim();
        let invalid = || format!("Invalid `{key}` value on line {line_no}");

        match key {
            "html_dir" => cfg.html_dir = Some(parse_path(value).with_context(invalid)?),
            "other_dir" => cfg.other_dir = Some(parse_path(value).with_context(invalid)?),
            "backup_dir" => cfg.backup_dir = Some(parse_path(value).with_context(invalid)?),
            "database" => cfg.database = Some(parse_path(value).with_context(invalid)?),
            "batch_size" => cfg.batch_size = Some(parse_integer(value).with_context(invalid)?),
            "max_file_size" => {
                cfg.max_file_size = Some(parse_integer(value).with_context(invalid)?);
            }
            "min_progress_size" => {
                cfg.min_progress_size = Some(parse_integer(value).with_context(invalid)?);
            }
            "max_host_workers" => {
                cfg.max_host_workers = Some(parse_integer(value).with_context(invalid)?);
            }
            "per_host_concurrency" => {
                cfg.per_host_concurrency = Some(parse_integer(value).with_context(invalid)?);
            }
            "http_timeout_secs" => {
                cfg.http_timeout_secs = Some(parse_integer(value).with_context(invalid)?);
            }
            "retryable_statuses" => {
                cfg.retryable_statuses = Some(parse_status_list(value).with_context(invalid)?);
            }
            "retry_max_attempts" => {
                cfg.retry_max_attempts = Some(parse_integer(value).with_context(invalid)?);
            }
            "retry_base_delay_ms" => {
                cfg.retry_base_delay_ms = Some(parse_integer(value).with_context(invalid)?);
            }
            "retry_max_delay_ms" => {
                cfg.retry_max_delay_ms = Some(parse_integer(value).with_context(invalid)?);
            }
            "retry_multiplier" => {
                cfg.retry_multiplier = Some(parse_float(value).with_context(invalid)?);
            }
            "max_depth" => cfg.max_depth = Some(parse_integer(value).with_context(invalid)?),
            "max_localise_links" => {
                cfg.max_localise_links = Some(parse_integer(value).with_context(invalid)?);
            }
            "same_host_only" => {
                cfg.same_host_only = Some(parse_boolean(value).with_context(invalid)?);
            }
            "max_restarts" => cfg.max_restarts = Some(parse_integer(value).with_context(invalid)?),
            "restart_window_secs" => {
                cfg.restart_window_secs = Some(parse_integer(value).with_context(invalid)?);
            }
            unknown => {
                bail!("Unknown configuration key: '{unknown}' on line {line_no}");
            }
        }
    }
    Ok(cfg)
}

fn strip_inline_comment(line: &str) -> &str {
    let mut in_string = false;
    for (index, ch) in line.char_indices() {
        match ch {
            '"' => in_string = !in_string,
            '#' if !in_string => return &line[..index],
            _ => {}
        }
    }
    line
}

fn parse_string_literal(raw_value: &str) -> Result<String> {
    if raw_value.len() < 2 || !raw_value.starts_with('"') || !raw_value.ends_with('"') {
        bail!("Expected double-quoted string");
    }
    Ok(raw_value[1..raw_value.len() - 1].to_string())
}

fn parse_path(raw_value: &str) -> Result<PathBuf> {
    let value = parse_string_literal(raw_value)?;
    if value.trim().is_empty() {
        bail!("Expected a non-empty path");
    }
    Ok(PathBuf::from(value))
}

fn parse_integer<T: TryFrom<u64>>(raw_value: &str) -> Result<T> {
    let token = raw_value.trim();
    if token.is_empty() {
        bail!("Expected integer value");
    }
    let value = token.replace('_', "").parse::<i128>()?;
    if value < 0 {
        bail!("Expected non-negative integer");
    }
    let value =
        u64::try_from(value).map_err(|_| anyhow::anyhow!("Integer value out of range for u64"))?;
    T::try_from(value).map_err(|_| anyhow::anyhow!("Integer value {value} out of range"))
}

fn parse_float(raw_value: &str) -> Result<f32> {
    let value: f32 = raw_value.trim().parse()?;
    if !value.is_finite() {
        bail!("Expected a finite number");
    }
    Ok(value)
}

fn parse_status_list(raw_value: &str) -> Result<Vec<u16>> {
    let list = if raw_value.starts_with('"') {
        parse_string_literal(raw_value)?
    } else {
        raw_value.to_string()
    };
    list.split(',')
        .map(str::trim)
        .filter(|token| !token.is_empty())
        .map(|token| {
            token
                .parse::<u16>()
                .with_context(|| format!("Invalid status code '{token}'"))
        })
        .collect()
}

fn parse_boolean(raw_value: &str) -> Result<bool> {
    match raw_value.trim() {
        "true" => Ok(true),
        "false" => Ok(false),
        _ => bail!("Expected 'true' or 'false'"),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parse_config_partial_fields() {
        let cfg = parse_config_str(
            r#"
max_depth = 4
html_dir = "/srv/mirror/html"
"#,
        )
        .expect("partial config should parse");
        assert_eq!(cfg.max_depth, Some(4));
        assert_eq!(cfg.html_dir, Some(PathBuf::from("/srv/mirror/html")));
        assert!(cfg.other_dir.is_none());
    }

    #[test]
    fn test_parse_config_supports_inline_comments() {
        let cfg = parse_config_str(
            r#"
per_host_concurrency = 1 # be gentle
database = "/tmp/#not-a-comment.db" # real comment
"#,
        )
        .expect("config with comments should parse");
        assert_eq!(cfg.per_host_concurrency, Some(1));
        assert_eq!(cfg.database, Some(PathBuf::from("/tmp/#not-a-comment.db")));
    }

    #[test]
    fn test_parse_config_status_list() {
        let cfg = parse_config_str("retryable_statuses = 429, 503").unwrap();
        assert_eq!(cfg.retryable_statuses, Some(vec![429, 503]));
        let cfg = parse_config_str(r#"retryable_statuses = "500,502""#).unwrap();
        assert_eq!(cfg.retryable_statuses, Some(vec![500, 502]));
    }

    #[test]
    fn test_parse_config_rejects_unknown_keys() {
        let err = parse_config_str("\nunknown_key = 123").expect_err("unknown key error expected");
        assert!(err.to_string().contains("Unknown configuration key"));
        assert!(err.to_string().contains("unknown_key"));
        assert!(err.to_string().contains("line 2"));
    }

    #[test]
    fn test_parse_config_rejects_numeric_values_with_trailing_tokens() {
        let err = parse_config_str("batch_size = 4 trailing")
            .expect_err("expected trailing token error");
        assert!(err.to_string().contains("batch_size"));
    }

    #[test]
    fn test_parse_config_rejects_unquoted_path() {
        let err = parse_config_str("html_dir = /srv/html").expect_err("path must be quoted");
        assert!(err.to_string().contains("html_dir"));
    }

    #[test]
    fn test_parse_config_rejects_invalid_boolean() {
        let err = parse_config_str("same_host_only = yes").expect_err("invalid boolean expected");
        assert!(err.to_string().contains("same_host_only"));
    }

    #[test]
    fn test_parse_config_rejects_negative_integer() {
        let err = parse_config_str("max_depth = -1").expect_err("negative depth");
        assert!(err.to_string().contains("max_depth"));
    }

    #[test]
    fn test_parse_config_rejects_missing_equals() {
        let err = parse_config_str("max_depth 3").expect_err("syntax error expected");
        assert!(err.to_string().contains("line 1"));
    }

    #[test]
    fn test_apply_overrides_only_present_values() {
        let cfg = parse_config_str(
            r"
http_timeout_secs = 30
retry_base_delay_ms = 250
restart_window_secs = 10
same_host_only = false
",
        )
        .unwrap();
        let mut config = CrawlConfig::default();
        cfg.apply(&mut config);

        assert_eq!(config.http_timeout, Duration::from_secs(30));
        assert_eq!(config.retry.base_delay, Duration::from_millis(250));
        assert_eq!(config.supervision.window, Duration::from_secs(10));
        assert!(!config.same_host_only);
        assert_eq!(config.html_dir, CrawlConfig::default().html_dir);
        assert_eq!(config.batch_size, CrawlConfig::default().batch_size);
    }

    #[test]
    fn test_load_config_explicit_missing_file_is_error() {
        let err = load_config(Some(Path::new("/nonexistent/webmirror.conf")))
            .expect_err("missing explicit config");
        assert!(err.to_string().contains("Failed to read config file"));
    }

    #[test]
    fn test_load_config_reads_explicit_file() {
        let dir = tempfile::TempDir::new().unwrap();
        let path = dir.path().join("config.toml");
        fs::write(&path, "max_restarts = 2\n").unwrap();

        let (loaded_from, cfg) = load_config(Some(&path)).unwrap().unwrap();

        assert_eq!(loaded_from, path);
        assert_eq!(cfg.max_restarts, Some(2));
    }
}
