//! Logging setup for alive-hook
//!
//! Console and/or file output through `tracing-subscriber`. The engine only
//! emits `tracing` events; the agent decides where they go.

use serde::{Deserialize, Serialize};
use std::fs::OpenOptions;
use std::path::PathBuf;
use std::sync::Mutex;
use tracing_subscriber::{fmt, prelude::*, EnvFilter, Layer, Registry};

type BoxedLayer = Box<dyn Layer<Registry> + Send + Sync>;

/// The `[logging]` table of `alive.toml`
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct LogConfig {
    /// Log to stderr
    pub console_enabled: bool,
    pub file_enabled: bool,
    pub file_path: String,
    pub timestamps: bool,
    /// Source file and line on every event
    pub file_info: bool,
    pub show_target: bool,
    pub ansi_colors: bool,
    /// `EnvFilter` directive, overridden by `RUST_LOG`
    pub level: String,
}

impl Default for LogConfig {
    fn default() -> Self {
        Self {
            console_enabled: true,
            file_enabled: false,
            file_path: "alive-hook.log".to_string(),
            timestamps: true,
            file_info: false,
            show_target: true,
            ansi_colors: true,
            level: "info".to_string(),
        }
    }
}

impl LogConfig {
    /// Verbose output with file/line info
    pub fn debug() -> Self {
        Self {
            level: "debug".to_string(),
            file_info: true,
            ..Default::default()
        }
    }

    /// Bare console lines, no colors or timestamps
    pub fn minimal() -> Self {
        Self {
            file_path: String::new(),
            timestamps: false,
            show_target: false,
            ansi_colors: false,
            ..Default::default()
        }
    }

    pub fn with_file(mut self, path: &str) -> Self {
        self.file_enabled = true;
        self.file_path = path.to_string();
        self
    }

    pub fn with_level(mut self, level: &str) -> Self {
        self.level = level.to_string();
        self
    }

    fn filter(&self) -> EnvFilter {
        EnvFilter::try_from_default_env()
            .or_else(|_| EnvFilter::try_new(&self.level))
            .unwrap_or_else(|_| EnvFilter::new("info"))
    }
}

fn console_layer(config: &LogConfig) -> BoxedLayer {
    let layer = fmt::layer()
        .with_ansi(config.ansi_colors)
        .with_target(config.show_target)
        .with_file(config.file_info)
        .with_line_number(config.file_info)
        .with_writer(std::io::stderr);
    if config.timestamps {
        layer.boxed()
    } else {
        layer.without_time().boxed()
    }
}

fn file_layer(config: &LogConfig) -> Option<BoxedLayer> {
    if !config.file_enabled || config.file_path.is_empty() {
        return None;
    }
    let file = match OpenOptions::new()
        .create(true)
        .append(true)
        .open(&config.file_path)
    {
        Ok(file) => file,
        Err(e) => {
            eprintln!("alive-hook: cannot open log file {}: {}", config.file_path, e);
            return None;
        }
    };
    Some(
        fmt::layer()
            .with_ansi(false)
            .with_target(config.show_target)
            .with_file(config.file_info)
            .with_line_number(config.file_info)
            .with_writer(Mutex::new(file))
            .boxed(),
    )
}

/// Install the global subscriber described by `config`
///
/// Only the first call has an effect.
pub fn init_logging(config: &LogConfig) {
    let mut layers: Vec<BoxedLayer> = Vec::new();
    if config.console_enabled {
        layers.push(console_layer(config));
    }
    layers.extend(file_layer(config));

    let _ = tracing_subscriber::registry()
        .with(layers)
        .with(config.filter())
        .try_init();
}

/// Logging for the in-process agent
///
/// Without an explicit log file, events also go to
/// `{cwd}/alive-hook-{pid}.log`.
pub fn init_agent_logging(base: &LogConfig) {
    let mut config = base.clone();
    if !config.file_enabled {
        let mut path = std::env::current_dir().unwrap_or_else(|_| PathBuf::from("."));
        path.push(format!("alive-hook-{}.log", std::process::id()));
        config.file_enabled = true;
        config.file_path = path.to_string_lossy().into_owned();
    }
    init_logging(&config);
}

pub fn init_debug_logging() {
    init_logging(&LogConfig::debug());
}
