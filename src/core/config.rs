use crate::core::table::{DvfsTable, LevelSpec};
use anyhow::{Context, Result};
use serde::Deserialize;
use std::path::{Path, PathBuf};

pub const DEFAULT_CONFIG_PATH: &str = "/etc/g3dgov/config.toml";

#[derive(Debug, Clone, Deserialize)]
pub struct Settings {
    #[serde(default)]
    pub daemon: DaemonSettings,

    #[serde(default)]
    pub dvfs: DvfsSettings,

    #[serde(default)]
    pub asv: AsvSettings,

    pub platform: PlatformSettings,

    /// Optional override of the built-in operating-point table.
    #[serde(default)]
    pub table: Vec<LevelSpec>,
}

#[derive(Debug, Clone, Deserialize)]
pub struct DaemonSettings {
    #[serde(default = "default_log_level")]
    pub log_level: String,

    /// Sampling tick period.
    #[serde(default = "default_tick_interval")]
    pub tick_interval_ms: u64,
}

#[derive(Debug, Clone, Deserialize)]
pub struct DvfsSettings {
    /// Ticks per utilization window.
    #[serde(default = "default_window_ticks")]
    pub window_ticks: u32,

    /// Level whose up-step needs the windowed figure to confirm. Set to a
    /// clock outside the table to disable the guard.
    #[serde(default = "default_checkpoint_clock")]
    pub checkpoint_clock_mhz: u32,

    /// Clock forced at startup before sampling begins.
    pub initial_clock_mhz: Option<u32>,
}

#[derive(Debug, Clone, Deserialize)]
pub struct AsvSettings {
    #[serde(default)]
    pub enabled: bool,

    /// Per-chip voltage table exported by the platform.
    pub voltage_table: Option<PathBuf>,
}

#[derive(Debug, Clone, Deserialize)]
pub struct PlatformSettings {
    /// Clock rate request file (MHz).
    pub clock_rate: PathBuf,

    /// Clock stability flag file; nonzero while the divider is settling.
    pub clock_stable: Option<PathBuf>,

    #[serde(default = "default_stable_timeout")]
    pub clock_stable_timeout_ms: u64,

    /// Regulator microvolt file.
    pub regulator: PathBuf,

    /// Memory-bandwidth QoS request file (MB/s, -1 = unconstrained).
    pub bandwidth: Option<PathBuf>,

    /// Cumulative "busy_ns total_ns" counter file.
    pub load: PathBuf,
}

fn default_log_level() -> String {
    "info".to_string()
}

fn default_tick_interval() -> u64 {
    100
}

fn default_window_ticks() -> u32 {
    5
}

fn default_checkpoint_clock() -> u32 {
    450
}

fn default_stable_timeout() -> u64 {
    100
}

impl Default for DaemonSettings {
    fn default() -> Self {
        Self {
            log_level: default_log_level(),
            tick_interval_ms: default_tick_interval(),
        }
    }
}

impl Default for DvfsSettings {
    fn default() -> Self {
        Self {
            window_ticks: default_window_ticks(),
            checkpoint_clock_mhz: default_checkpoint_clock(),
            initial_clock_mhz: None,
        }
    }
}

impl Default for AsvSettings {
    fn default() -> Self {
        Self {
            enabled: false,
            voltage_table: None,
        }
    }
}

impl Settings {
    pub fn load<P: AsRef<Path>>(path: P) -> Result<Self> {
        let path = path.as_ref();

        let content = std::fs::read_to_string(path)
            .with_context(|| format!("Failed to read {}", path.display()))?;

        toml::from_str(&content).context("Failed to parse config.toml")
    }

    /// The configured table, or the built-in one when no override is given.
    pub fn build_table(&self) -> Result<DvfsTable> {
        if self.table.is_empty() {
            Ok(DvfsTable::mali_t604())
        } else {
            DvfsTable::from_specs(&self.table).context("Invalid [[table]] override")
        }
    }
}
