use crate::core::table::DvfsTable;
use anyhow::Result;
use std::time::Instant;
use tracing::debug;

/// Memory-throughput reservation accompanying an operating point.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BandwidthFloor {
    Unconstrained,
    MegabytesPerSec(u32),
}

const BANDWIDTH_PER_MHZ: u32 = 16;
const BANDWIDTH_MAX: u32 = 6400;

/// Bandwidth floor for a step: proportional to the clock, capped, and absent
/// entirely at the lowest level.
pub fn bandwidth_floor(table: &DvfsTable, step: usize) -> BandwidthFloor {
    if step == 0 {
        BandwidthFloor::Unconstrained
    } else {
        let bw = (table.level(step).clock_mhz * BANDWIDTH_PER_MHZ).min(BANDWIDTH_MAX);
        BandwidthFloor::MegabytesPerSec(bw)
    }
}

pub trait ClockController {
    fn set_clock(&mut self, clock_mhz: u32) -> Result<()>;
}

pub trait PowerRail {
    fn set_voltage(&mut self, microvolts: u32) -> Result<()>;
    fn voltage(&mut self) -> Result<u32>;
}

pub trait BandwidthQos {
    fn request(&mut self, floor: BandwidthFloor) -> Result<()>;
}

#[derive(Debug, Clone, Copy)]
struct Applied {
    step: usize,
    voltage_uv: u32,
    clock_mhz: u32,
}

/// Applies a target level through the platform collaborators.
///
/// Ordering is direction-dependent: going up, voltage is raised before the
/// clock so the clock never exceeds what the present voltage supports; going
/// down, the bandwidth floor and clock drop before the voltage. A repeated
/// target is a no-op (single-entry memoization).
pub struct LevelApplier {
    clock: Box<dyn ClockController + Send>,
    rail: Box<dyn PowerRail + Send>,
    qos: Box<dyn BandwidthQos + Send>,
    last: Option<Applied>,
    last_transition: Instant,
}

impl LevelApplier {
    pub fn new(
        clock: Box<dyn ClockController + Send>,
        rail: Box<dyn PowerRail + Send>,
        qos: Box<dyn BandwidthQos + Send>,
    ) -> Self {
        Self {
            clock,
            rail,
            qos,
            last: None,
            last_transition: Instant::now(),
        }
    }

    pub fn apply(&mut self, table: &mut DvfsTable, step: usize) -> Result<()> {
        assert!(step < table.len(), "DVFS level {step} out of range");

        if self.last.map(|a| a.step) == Some(step) {
            return Ok(());
        }

        // Account the time spent at the outgoing level before switching.
        if let Some(prev) = self.last {
            table.add_time_in_state(prev.step, self.last_transition.elapsed());
        }

        let level = table.level(step);
        let target = Applied {
            step,
            voltage_uv: level.voltage_uv,
            clock_mhz: level.clock_mhz,
        };
        let floor = bandwidth_floor(table, step);
        let ascending = self.last.is_none_or(|a| step > a.step);

        if ascending {
            self.set_voltage(target.voltage_uv)?;
            self.set_clock(target.clock_mhz)?;
            self.qos.request(floor)?;
        } else {
            self.qos.request(floor)?;
            self.set_clock(target.clock_mhz)?;
            self.set_voltage(target.voltage_uv)?;
        }

        debug!(
            target: "g3dgov::dvfs",
            "Applied level {} ({} MHz, {} uV, {:?})",
            step, target.clock_mhz, target.voltage_uv, floor
        );

        self.last = Some(target);
        self.last_transition = Instant::now();
        Ok(())
    }

    /// Drops the memory-bandwidth reservation; the applied level is otherwise
    /// left in place. Used when sampling is disabled.
    pub fn release_bandwidth(&mut self) -> Result<()> {
        self.qos.request(BandwidthFloor::Unconstrained)
    }

    /// Folds the time spent at the currently applied level into the table, so
    /// an export sees up-to-date figures.
    pub fn flush_time_in_state(&mut self, table: &mut DvfsTable) {
        if let Some(applied) = self.last {
            table.add_time_in_state(applied.step, self.last_transition.elapsed());
            self.last_transition = Instant::now();
        }
    }

    fn set_voltage(&mut self, microvolts: u32) -> Result<()> {
        // Adjacent levels may share a voltage; skip the redundant rail call.
        if self.last.map(|a| a.voltage_uv) == Some(microvolts) {
            return Ok(());
        }
        self.rail.set_voltage(microvolts)
    }

    fn set_clock(&mut self, clock_mhz: u32) -> Result<()> {
        if self.last.map(|a| a.clock_mhz) == Some(clock_mhz) {
            return Ok(());
        }
        self.clock.set_clock(clock_mhz)
    }
}
