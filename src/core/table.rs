use anyhow::{Result, bail};
use serde::Deserialize;
use std::time::Duration;

/// One row of the DVFS table as it appears in the config file.
#[derive(Debug, Clone, Deserialize)]
pub struct LevelSpec {
    pub voltage_uv: u32,
    pub clock_mhz: u32,
    pub min_threshold: u8,
    pub max_threshold: u8,
    /// Voltage restored when ASV calibration is disabled. Falls back to
    /// `voltage_uv` when omitted.
    pub default_voltage_uv: Option<u32>,
}

#[derive(Debug, Clone)]
pub struct DvfsLevel {
    pub voltage_uv: u32,
    pub default_voltage_uv: u32,
    pub clock_mhz: u32,
    pub min_threshold: u8,
    pub max_threshold: u8,
    pub time_in_state: Duration,
}

/// Ordered table of operating points, index 0 = lowest performance.
///
/// Clocks must be strictly increasing and voltages non-decreasing with the
/// index. Thresholds are hand-tuned hysteresis bands and may overlap.
#[derive(Debug, Clone)]
pub struct DvfsTable {
    levels: Vec<DvfsLevel>,
}

/// Mali-T604 operating points: (µV, MHz, min%, max%) plus the pre-calibration
/// default voltage.
const MALI_T604_TABLE: [(u32, u32, u8, u8, u32); 7] = [
    (912_500, 100, 0, 70, 925_000),
    (925_000, 160, 50, 65, 925_000),
    (1_025_000, 266, 60, 78, 1_025_000),
    (1_075_000, 350, 70, 80, 1_075_000),
    (1_125_000, 400, 70, 80, 1_125_000),
    (1_150_000, 450, 76, 99, 1_150_000),
    (1_250_000, 533, 99, 100, 1_200_000),
];

impl DvfsTable {
    pub fn from_specs(specs: &[LevelSpec]) -> Result<Self> {
        if specs.is_empty() {
            bail!("DVFS table must contain at least one level");
        }

        let levels: Vec<DvfsLevel> = specs
            .iter()
            .map(|s| DvfsLevel {
                voltage_uv: s.voltage_uv,
                default_voltage_uv: s.default_voltage_uv.unwrap_or(s.voltage_uv),
                clock_mhz: s.clock_mhz,
                min_threshold: s.min_threshold,
                max_threshold: s.max_threshold,
                time_in_state: Duration::ZERO,
            })
            .collect();

        for pair in levels.windows(2) {
            if pair[1].clock_mhz <= pair[0].clock_mhz {
                bail!(
                    "DVFS table clocks must be strictly increasing ({} MHz follows {} MHz)",
                    pair[1].clock_mhz,
                    pair[0].clock_mhz
                );
            }
            if pair[1].voltage_uv < pair[0].voltage_uv {
                bail!(
                    "DVFS table voltages must be non-decreasing ({} uV follows {} uV)",
                    pair[1].voltage_uv,
                    pair[0].voltage_uv
                );
            }
        }

        Ok(Self { levels })
    }

    /// Built-in table for the Mali-T604 G3D block.
    pub fn mali_t604() -> Self {
        let levels = MALI_T604_TABLE
            .iter()
            .map(|&(voltage_uv, clock_mhz, min, max, default_uv)| DvfsLevel {
                voltage_uv,
                default_voltage_uv: default_uv,
                clock_mhz,
                min_threshold: min,
                max_threshold: max,
                time_in_state: Duration::ZERO,
            })
            .collect();
        Self { levels }
    }

    pub fn len(&self) -> usize {
        self.levels.len()
    }

    pub fn is_empty(&self) -> bool {
        self.levels.is_empty()
    }

    /// Highest selectable step.
    pub fn max_step(&self) -> usize {
        self.levels.len() - 1
    }

    /// Panics on an out-of-range step: all steps are derived internally, so
    /// this is an invariant violation, not a recoverable condition.
    pub fn level(&self, step: usize) -> &DvfsLevel {
        &self.levels[step]
    }

    pub fn levels(&self) -> &[DvfsLevel] {
        &self.levels
    }

    pub fn level_for_clock(&self, clock_mhz: u32) -> Option<usize> {
        self.levels.iter().position(|l| l.clock_mhz == clock_mhz)
    }

    pub fn set_voltage(&mut self, step: usize, voltage_uv: u32) {
        self.levels[step].voltage_uv = voltage_uv;
    }

    pub fn restore_default_voltages(&mut self) {
        for level in &mut self.levels {
            level.voltage_uv = level.default_voltage_uv;
        }
    }

    pub fn add_time_in_state(&mut self, step: usize, elapsed: Duration) {
        self.levels[step].time_in_state += elapsed;
    }

    /// (clock MHz, cumulative time) pairs, lowest level first.
    pub fn time_in_state(&self) -> Vec<(u32, Duration)> {
        self.levels
            .iter()
            .map(|l| (l.clock_mhz, l.time_in_state))
            .collect()
    }

    pub fn reset_time_in_state(&mut self) {
        for level in &mut self.levels {
            level.time_in_state = Duration::ZERO;
        }
    }
}
