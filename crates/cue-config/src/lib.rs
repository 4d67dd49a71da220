//! Configuration types and loaders for cue.
//!
//! This crate owns the on-disk `cue.toml` schema so the core and the
//! application shell share a single source of truth.

pub mod settings;

pub use settings::{config_path, Config, FrameConfig, LogConfig, TimerConfig};
