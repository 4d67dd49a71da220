use std::path::{Path, PathBuf};

use anyhow::{Context, Result};
use cue_config::LogConfig;
use tracing_appender::non_blocking::WorkerGuard;
use tracing_appender::rolling;
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt, EnvFilter};

/// Prefix of every file written by the rolling appender.
const LOG_FILE_PREFIX: &str = "cue.log";

/// Logging settings, usually taken from the `[log]` table of `cue.toml`.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct LogOptions {
    /// Default filter directive when neither `CUE_LOG` nor `RUST_LOG` is set.
    pub filter: String,
    pub dir: Option<PathBuf>,
    pub retention_days: u64,
}

impl Default for LogOptions {
    fn default() -> Self {
        Self {
            filter: "info".into(),
            dir: None,
            retention_days: 7,
        }
    }
}

impl From<&LogConfig> for LogOptions {
    fn from(config: &LogConfig) -> Self {
        Self {
            filter: config.filter.clone(),
            dir: config.dir.clone(),
            retention_days: config.retention_days,
        }
    }
}

/// Return the log directory path.
///
/// Precedence: `CUE_LOG_DIR` env var > `configured` > platform default.
/// macOS: `~/Library/Logs/cue/`
/// Linux: `$XDG_DATA_HOME/cue/logs/` or `~/.local/share/cue/logs/`
pub fn log_dir(configured: Option<&Path>) -> PathBuf {
    if let Ok(dir) = std::env::var("CUE_LOG_DIR") {
        return PathBuf::from(dir);
    }
    if let Some(dir) = configured {
        return dir.to_path_buf();
    }

    #[cfg(target_os = "macos")]
    {
        if let Some(home) = dirs::home_dir() {
            return home.join("Library").join("Logs").join("cue");
        }
    }

    #[cfg(not(target_os = "macos"))]
    {
        if let Some(data) = dirs::data_dir() {
            return data.join("cue").join("logs");
        }
    }

    PathBuf::from("logs")
}

/// Remove log files older than `max_age_days` from `log_path`.
///
/// Only names starting with `cue.log` are considered, so a shared directory
/// keeps its other files.
fn cleanup_old_logs(log_path: &Path, max_age_days: u64) {
    let cutoff =
        std::time::SystemTime::now() - std::time::Duration::from_secs(max_age_days * 86400);
    let Ok(entries) = std::fs::read_dir(log_path) else {
        return;
    };
    for entry in entries.flatten() {
        let name = entry.file_name();
        if !name.to_string_lossy().starts_with(LOG_FILE_PREFIX) {
            continue;
        }
        let modified = entry.metadata().and_then(|meta| meta.modified());
        if matches!(modified, Ok(modified) if modified < cutoff) {
            let _ = std::fs::remove_file(entry.path());
        }
    }
}

fn env_filter(default: &str) -> Result<EnvFilter> {
    if let Ok(filter) = EnvFilter::try_from_env("CUE_LOG") {
        return Ok(filter);
    }
    if let Ok(filter) = EnvFilter::try_from_env("RUST_LOG") {
        return Ok(filter);
    }
    EnvFilter::try_new(default).with_context(|| format!("invalid log filter {:?}", default))
}

/// Initialize the logging subsystem.
///
/// Output goes to a daily rolling file in [`log_dir`] only; the terminal
/// belongs to the frame loop. Keep the returned guard alive for the life of
/// the process so buffered lines are flushed on exit.
pub fn init(options: &LogOptions) -> Result<WorkerGuard> {
    let filter = env_filter(&options.filter)?;

    let log_path = log_dir(options.dir.as_deref());
    std::fs::create_dir_all(&log_path)
        .with_context(|| format!("failed to create log directory {}", log_path.display()))?;
    cleanup_old_logs(&log_path, options.retention_days);

    let file_appender = rolling::daily(&log_path, LOG_FILE_PREFIX);
    let (writer, guard) = tracing_appender::non_blocking(file_appender);
    let file_layer = tracing_subscriber::fmt::layer()
        .with_writer(writer)
        .with_ansi(false)
        .with_target(true);

    tracing_subscriber::registry()
        .with(filter)
        .with(file_layer)
        .try_init()
        .context("failed to install tracing subscriber")?;

    tracing::info!(dir = %log_path.display(), "logging initialised");
    Ok(guard)
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Mutex;

    // Serialize env-mutating tests to avoid data races.
    static ENV_LOCK: Mutex<()> = Mutex::new(());

    fn with_log_dir_env<R>(value: Option<&str>, f: impl FnOnce() -> R) -> R {
        let _guard = ENV_LOCK.lock().unwrap();
        let original = std::env::var("CUE_LOG_DIR").ok();
        match value {
            Some(v) => unsafe { std::env::set_var("CUE_LOG_DIR", v) },
            None => unsafe { std::env::remove_var("CUE_LOG_DIR") },
        }
        let out = f();
        match original {
            Some(v) => unsafe { std::env::set_var("CUE_LOG_DIR", v) },
            None => unsafe { std::env::remove_var("CUE_LOG_DIR") },
        }
        out
    }

    #[test]
    fn log_dir_env_beats_config() {
        let dir = with_log_dir_env(Some("/tmp/cue-env-logs"), || {
            log_dir(Some(Path::new("/tmp/cue-config-logs")))
        });
        assert_eq!(dir, PathBuf::from("/tmp/cue-env-logs"));
    }

    #[test]
    fn log_dir_uses_config_without_env() {
        let dir = with_log_dir_env(None, || log_dir(Some(Path::new("/tmp/cue-config-logs"))));
        assert_eq!(dir, PathBuf::from("/tmp/cue-config-logs"));
    }

    #[test]
    fn log_dir_platform_default() {
        let dir = with_log_dir_env(None, || log_dir(None));

        #[cfg(target_os = "macos")]
        {
            let expected = dirs::home_dir().unwrap().join("Library/Logs/cue");
            assert_eq!(dir, expected);
        }

        #[cfg(not(target_os = "macos"))]
        assert!(dir.ends_with("cue/logs") || dir == PathBuf::from("logs"));
    }

    #[test]
    fn default_options() {
        let options = LogOptions::default();
        assert_eq!(options.filter, "info");
        assert_eq!(options.retention_days, 7);
        assert!(options.dir.is_none());
    }

    #[test]
    fn options_from_config_table() {
        let config = LogConfig {
            filter: "cue_core=trace".into(),
            dir: Some(PathBuf::from("/tmp/cue-logs")),
            retention_days: 3,
        };
        let options = LogOptions::from(&config);
        assert_eq!(options.filter, "cue_core=trace");
        assert_eq!(options.dir, Some(PathBuf::from("/tmp/cue-logs")));
        assert_eq!(options.retention_days, 3);
        assert_eq!(LogOptions::from(&LogConfig::default()), LogOptions::default());
    }

    #[test]
    fn bad_default_filter_is_an_error() {
        let _guard = ENV_LOCK.lock().unwrap();
        if std::env::var("CUE_LOG").is_ok() || std::env::var("RUST_LOG").is_ok() {
            return;
        }
        assert!(env_filter("cue_core=notalevel").is_err());
        assert!(env_filter("cue_core=debug,info").is_ok());
    }

    #[test]
    fn cleanup_old_logs_removes_stale_files() {
        let tmp = std::env::temp_dir().join("cue-test-cleanup");
        let _ = std::fs::create_dir_all(&tmp);

        let cue_a = tmp.join("cue.log.2025-01-01");
        let cue_b = tmp.join("cue.log.2025-01-02");
        let other = tmp.join("other.txt");
        std::fs::write(&cue_a, "a").unwrap();
        std::fs::write(&cue_b, "b").unwrap();
        std::fs::write(&other, "c").unwrap();

        // max_age_days=0 means cutoff is "now", so all matching files get cleaned
        cleanup_old_logs(&tmp, 0);
        assert!(!cue_a.exists(), "cue log file should be deleted");
        assert!(!cue_b.exists(), "cue log file should be deleted");
        assert!(other.exists(), "unrelated file should be preserved");

        let _ = std::fs::remove_dir_all(&tmp);
    }
}
