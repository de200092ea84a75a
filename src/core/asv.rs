use crate::core::table::DvfsTable;
use tracing::{debug, info};

/// Adaptive supply voltage calibration state.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AsvStatus {
    NotInit,
    Init,
    DisableRequested,
}

/// Source of per-chip calibrated voltages, typically backed by e-fuse data
/// exposed by the platform.
pub trait VoltageCalibrator {
    /// Calibrated voltage in µV for the given clock, or `None` while the
    /// calibration data is unavailable.
    fn query(&self, clock_mhz: u32) -> Option<u32>;
}

/// Rewrites table voltages from a calibration source.
///
/// A pass is all-or-nothing: if any level's query comes back unavailable the
/// whole pass is abandoned, existing voltages stay in effect, and the state
/// remains `NotInit` so the next evaluation retries.
pub struct AsvCalibrator {
    source: Box<dyn VoltageCalibrator + Send>,
}

impl AsvCalibrator {
    pub fn new(source: Box<dyn VoltageCalibrator + Send>) -> Self {
        Self { source }
    }

    /// Runs one step of the calibration state machine. Called at the start of
    /// every evaluation, before the level decision.
    pub fn service(&self, status: AsvStatus, table: &mut DvfsTable) -> AsvStatus {
        match status {
            AsvStatus::DisableRequested => {
                table.restore_default_voltages();
                info!(target: "g3dgov::asv", "Calibration disabled, default voltage table restored");
                AsvStatus::Init
            }
            AsvStatus::NotInit => {
                let mut voltages = Vec::with_capacity(table.len());
                for level in table.levels() {
                    match self.source.query(level.clock_mhz) {
                        Some(uv) => voltages.push(uv),
                        None => {
                            debug!(
                                target: "g3dgov::asv",
                                "Calibration unavailable for {} MHz, pass deferred",
                                level.clock_mhz
                            );
                            return AsvStatus::NotInit;
                        }
                    }
                }
                for (step, uv) in voltages.into_iter().enumerate() {
                    table.set_voltage(step, uv);
                }
                info!(target: "g3dgov::asv", "Calibrated voltages committed for {} levels", table.len());
                AsvStatus::Init
            }
            AsvStatus::Init => AsvStatus::Init,
        }
    }
}
