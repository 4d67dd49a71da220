use std::fs;
use std::path::{Path, PathBuf};

use anyhow::{bail, Context, Result};
use serde::{Deserialize, Serialize};

/// Environment variable naming the config file to load.
pub const CONFIG_ENV: &str = "CUE_CONFIG";
/// File loaded from the working directory when `CUE_CONFIG` is unset.
pub const DEFAULT_CONFIG_FILE: &str = "cue.toml";

/// Runtime configuration loaded from `cue.toml`.
#[derive(Debug, Clone, PartialEq, Default, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct Config {
    #[serde(default)]
    pub frame: FrameConfig,
    #[serde(default)]
    pub timers: TimerConfig,
    #[serde(default)]
    pub log: LogConfig,
}

/// Frame loop pacing.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(deny_unknown_fields, default)]
pub struct FrameConfig {
    /// Target interval between frames, in milliseconds.
    pub tick_ms: u64,
    /// Longest `dt` a single frame may report, in seconds.
    pub max_dt: f64,
}

impl Default for FrameConfig {
    fn default() -> Self {
        Self {
            tick_ms: 16,
            max_dt: 0.25,
        }
    }
}

/// Repeating timer behaviour when a frame spans several periods.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(deny_unknown_fields, default)]
pub struct TimerConfig {
    pub catch_up: bool,
    /// Most fires per update when `catch_up` is on.
    pub max_catch_up: u32,
}

impl Default for TimerConfig {
    fn default() -> Self {
        Self {
            catch_up: false,
            max_catch_up: 8,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(deny_unknown_fields, default)]
pub struct LogConfig {
    pub filter: String,
    pub dir: Option<PathBuf>,
    pub retention_days: u64,
}

impl Default for LogConfig {
    fn default() -> Self {
        Self {
            filter: "info".into(),
            dir: None,
            retention_days: 7,
        }
    }
}

impl Config {
    /// Parse and validate config TOML.
    pub fn from_toml_str(input: &str) -> Result<Self> {
        let config: Self = toml::from_str(input).context("failed to parse config TOML")?;
        config.validate()?;
        Ok(config)
    }

    /// Load and validate a config file from disk.
    pub fn from_path(path: &Path) -> Result<Self> {
        let raw = fs::read_to_string(path)
            .with_context(|| format!("failed to read config at {}", path.display()))?;

        Self::from_toml_str(&raw).with_context(|| format!("invalid config at {}", path.display()))
    }

    /// Load the file named by `CUE_CONFIG`, or `cue.toml` in the working
    /// directory. A missing file yields the defaults; a broken one is an
    /// error.
    pub fn load() -> Result<Self> {
        let path = config_path();
        if !path.exists() {
            return Ok(Self::default());
        }
        Self::from_path(&path)
    }

    /// Validate semantic constraints.
    pub fn validate(&self) -> Result<()> {
        if self.frame.tick_ms == 0 {
            bail!("frame.tick_ms must be at least 1");
        }
        if !(self.frame.max_dt.is_finite() && self.frame.max_dt > 0.0) {
            bail!("frame.max_dt must be a positive number of seconds");
        }
        if self.timers.max_catch_up == 0 {
            bail!("timers.max_catch_up must be at least 1");
        }
        if self.log.filter.trim().is_empty() {
            bail!("log.filter must not be empty");
        }
        if let Some(dir) = &self.log.dir {
            if dir.as_os_str().is_empty() {
                bail!("log.dir must not be empty when set");
            }
        }
        Ok(())
    }
}

/// Path of the config file [`Config::load`] reads.
pub fn config_path() -> PathBuf {
    match std::env::var(CONFIG_ENV) {
        Ok(path) if !path.trim().is_empty() => PathBuf::from(path),
        _ => PathBuf::from(DEFAULT_CONFIG_FILE),
    }
}
