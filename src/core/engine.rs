use crate::core::apply::LevelApplier;
use crate::core::asv::{AsvCalibrator, AsvStatus};
use crate::core::controller::{DvfsController, Evaluation};
use crate::core::lock::{FrequencyLockManager, LockConflict};
use crate::core::sampler::UtilizationSampler;
use crate::core::table::DvfsTable;
use anyhow::{Context, Result};
use std::sync::{Arc, Mutex};
use std::time::Duration;
use tracing::{debug, info, warn};

/// Governor status fields, readable at any time under the short lock.
#[derive(Debug, Clone, Copy)]
pub struct DvfsStatus {
    pub current_step: usize,
    /// Instantaneous utilization of the latest tick.
    pub utilization: u8,
    pub locks: FrequencyLockManager,
    pub asv: AsvStatus,
}

/// State shared between the evaluation worker and external callers. Guarded
/// by one mutex, held only for field reads and writes.
#[derive(Debug)]
pub struct DvfsShared {
    pub status: DvfsStatus,
    pub(crate) sampler: UtilizationSampler,
    /// Latched on window completion, consumed by the next evaluation.
    pub(crate) window_pending: bool,
}

impl DvfsShared {
    pub fn record_sample(&mut self, busy: Duration, idle: Duration) {
        let out = self.sampler.record(busy, idle);
        self.status.utilization = out.utilization;
        if out.window_complete {
            self.window_pending = true;
        }
    }

    pub fn set_upper_lock(&mut self, level: usize) -> Result<(), LockConflict> {
        self.status.locks.set_upper(level)?;
        info!(target: "g3dgov::dvfs", "Upper lock set at level {}", level);
        Ok(())
    }

    pub fn clear_upper_lock(&mut self) {
        self.status.locks.clear_upper();
        info!(target: "g3dgov::dvfs", "Upper lock cleared");
    }

    pub fn set_under_lock(&mut self, level: usize) -> Result<(), LockConflict> {
        self.status.locks.set_under(level)?;
        info!(target: "g3dgov::dvfs", "Under lock set at level {}", level);
        Ok(())
    }

    pub fn clear_under_lock(&mut self) {
        self.status.locks.clear_under();
        info!(target: "g3dgov::dvfs", "Under lock cleared");
    }
}

/// The per-device DVFS context: owns the table and the collaborators, lives
/// from device attach to detach. All mutation funnels through the evaluation
/// worker, which owns this struct exclusively.
pub struct DvfsEngine {
    shared: Arc<Mutex<DvfsShared>>,
    table: DvfsTable,
    controller: DvfsController,
    asv: Option<AsvCalibrator>,
    applier: LevelApplier,
    enabled: bool,
}

impl DvfsEngine {
    pub fn new(
        table: DvfsTable,
        window_ticks: u32,
        checkpoint_clock_mhz: Option<u32>,
        applier: LevelApplier,
        asv: Option<AsvCalibrator>,
    ) -> Self {
        let checkpoint = checkpoint_clock_mhz.and_then(|mhz| {
            let step = table.level_for_clock(mhz);
            if step.is_none() {
                warn!(
                    target: "g3dgov::dvfs",
                    "Checkpoint clock {} MHz not in the table, double-confirmation disabled",
                    mhz
                );
            }
            step
        });

        let shared = Arc::new(Mutex::new(DvfsShared {
            status: DvfsStatus {
                // The device starts at maximum performance until the first
                // evaluation lowers it.
                current_step: table.max_step(),
                utilization: 100,
                locks: FrequencyLockManager::default(),
                asv: if asv.is_some() {
                    AsvStatus::NotInit
                } else {
                    AsvStatus::Init
                },
            },
            sampler: UtilizationSampler::new(window_ticks),
            window_pending: false,
        }));

        Self {
            shared,
            table,
            controller: DvfsController::new(checkpoint),
            asv,
            applier,
            enabled: false,
        }
    }

    /// Handle to the shared status, for readers outside the worker.
    pub fn shared(&self) -> Arc<Mutex<DvfsShared>> {
        Arc::clone(&self.shared)
    }

    pub fn clocks(&self) -> Vec<u32> {
        self.table.levels().iter().map(|l| l.clock_mhz).collect()
    }

    pub fn record_sample(&self, busy: Duration, idle: Duration) {
        self.shared.lock().unwrap().record_sample(busy, idle);
    }

    /// One controller evaluation: service calibration, decide the next step,
    /// apply it. Runs to completion; never cancelled mid-flight.
    pub fn evaluate(&mut self) -> Result<()> {
        if !self.enabled {
            return Ok(());
        }

        if let Some(asv) = &self.asv {
            let status = self.shared.lock().unwrap().status.asv;
            if status != AsvStatus::Init {
                let next = asv.service(status, &mut self.table);
                self.shared.lock().unwrap().status.asv = next;
            }
        }

        let (eval, locks) = {
            let mut sh = self.shared.lock().unwrap();
            let eval = Evaluation {
                step: sh.status.current_step,
                utilization: sh.status.utilization,
                windowed_utilization: sh.sampler.windowed(),
                window_complete: sh.window_pending,
            };
            sh.window_pending = false;
            (eval, sh.status.locks)
        };

        let next = self.controller.decide(&self.table, eval, &locks);
        if next != eval.step {
            debug!(
                target: "g3dgov::dvfs",
                "Step {} -> {} (util {}%, windowed {}%)",
                eval.step, next, eval.utilization, eval.windowed_utilization
            );
            self.shared.lock().unwrap().status.current_step = next;
        }

        self.applier.apply(&mut self.table, next)
    }

    /// Enables or disables the governor. A forced clock resets the sampling
    /// window and applies the matching level immediately, whether enabling or
    /// disabling. Disabling releases the bandwidth floor but keeps the current
    /// step.
    pub fn enable(&mut self, on: bool, forced_clock_mhz: Option<u32>) -> Result<()> {
        if let Some(mhz) = forced_clock_mhz {
            let step = self
                .table
                .level_for_clock(mhz)
                .with_context(|| format!("no DVFS level for {mhz} MHz"))?;
            {
                let mut sh = self.shared.lock().unwrap();
                sh.sampler.reset();
                sh.window_pending = false;
                sh.status.utilization = 0;
                sh.status.current_step = step;
            }
            self.applier.apply(&mut self.table, step)?;
        }

        if on != self.enabled {
            self.enabled = on;
            if on {
                info!(target: "g3dgov::dvfs", "DVFS enabled");
            } else {
                self.applier.release_bandwidth()?;
                info!(target: "g3dgov::dvfs", "DVFS disabled, bandwidth floor released");
            }
        }
        Ok(())
    }

    pub fn current_level(&self) -> usize {
        self.shared.lock().unwrap().status.current_step
    }

    pub fn current_utilization(&self) -> u8 {
        self.shared.lock().unwrap().status.utilization
    }

    pub fn set_upper_lock(&self, level: usize) -> Result<(), LockConflict> {
        assert!(level < self.table.len(), "lock level {level} out of range");
        self.shared.lock().unwrap().set_upper_lock(level)
    }

    pub fn clear_upper_lock(&self) {
        self.shared.lock().unwrap().clear_upper_lock();
    }

    pub fn set_under_lock(&self, level: usize) -> Result<(), LockConflict> {
        assert!(level < self.table.len(), "lock level {level} out of range");
        self.shared.lock().unwrap().set_under_lock(level)
    }

    pub fn clear_under_lock(&self) {
        self.shared.lock().unwrap().clear_under_lock();
    }

    pub fn upper_lock_clock(&self) -> Option<u32> {
        let locked = self.shared.lock().unwrap().status.locks.upper();
        locked.map(|l| self.table.level(l).clock_mhz)
    }

    pub fn under_lock_clock(&self) -> Option<u32> {
        let locked = self.shared.lock().unwrap().status.locks.under();
        locked.map(|l| self.table.level(l).clock_mhz)
    }

    /// Requests recalibration (true) or a return to the default voltage table
    /// (false). Takes effect at the next evaluation.
    pub fn set_asv_enabled(&self, enabled: bool) {
        if self.asv.is_none() {
            warn!(target: "g3dgov::asv", "No calibration source configured, request ignored");
            return;
        }
        let mut sh = self.shared.lock().unwrap();
        sh.status.asv = if enabled {
            AsvStatus::NotInit
        } else {
            AsvStatus::DisableRequested
        };
    }

    pub fn export_time_in_state(&mut self) -> Vec<(u32, Duration)> {
        self.applier.flush_time_in_state(&mut self.table);
        self.table.time_in_state()
    }

    pub fn reset_time_in_state(&mut self) {
        self.applier.flush_time_in_state(&mut self.table);
        self.table.reset_time_in_state();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::core::apply::tests::{Call, recording_applier};
    use crate::core::asv::VoltageCalibrator;
    use crate::core::table::DvfsTable;
    use std::collections::HashMap;

    const MS: Duration = Duration::from_millis(1);

    struct MapCalibrator(HashMap<u32, u32>);

    impl VoltageCalibrator for MapCalibrator {
        fn query(&self, clock_mhz: u32) -> Option<u32> {
            self.0.get(&clock_mhz).copied()
        }
    }

    fn engine_with_window(window: u32) -> (DvfsEngine, crate::core::apply::tests::Recorder) {
        let (applier, rec) = recording_applier();
        let mut engine = DvfsEngine::new(
            DvfsTable::mali_t604(),
            window,
            Some(450),
            applier,
            None,
        );
        engine.enable(true, None).unwrap();
        (engine, rec)
    }

    /// Feeds one tick at the given utilization and evaluates.
    fn tick(engine: &mut DvfsEngine, util: u8) {
        engine.record_sample(u32::from(util) * MS, u32::from(100 - util) * MS);
        engine.evaluate().unwrap();
    }

    #[test]
    fn settles_one_level_per_completed_window_at_half_load() {
        // Window length 1: every tick completes a window.
        let (mut engine, _rec) = engine_with_window(1);
        assert_eq!(engine.current_level(), 6);

        let mut levels = Vec::new();
        for _ in 0..8 {
            tick(&mut engine, 50);
            levels.push(engine.current_level());
        }
        // One level per evaluation down to level 1 (min_threshold 50), then
        // steady.
        assert_eq!(levels, vec![5, 4, 3, 2, 1, 1, 1, 1]);
    }

    #[test]
    fn under_lock_floors_the_step() {
        let (mut engine, _rec) = engine_with_window(1);
        engine.set_under_lock(3).unwrap();

        for _ in 0..10 {
            tick(&mut engine, 0);
            assert!(engine.current_level() >= 3);
        }
        assert_eq!(engine.current_level(), 3);
    }

    #[test]
    fn upper_lock_round_trip_restores_range() {
        let (mut engine, _rec) = engine_with_window(1);
        engine.set_upper_lock(2).unwrap();

        // High load cannot climb past the lock.
        for _ in 0..10 {
            tick(&mut engine, 100);
        }
        assert_eq!(engine.current_level(), 2);
        assert_eq!(engine.upper_lock_clock(), Some(266));

        engine.clear_upper_lock();
        for _ in 0..10 {
            tick(&mut engine, 100);
        }
        assert_eq!(engine.current_level(), 6);
        assert_eq!(engine.upper_lock_clock(), None);
    }

    #[test]
    fn lock_conflict_leaves_both_locks_unchanged() {
        let (engine, _rec) = engine_with_window(1);
        engine.set_under_lock(2).unwrap();
        assert!(engine.set_upper_lock(4).is_err());
        assert_eq!(engine.under_lock_clock(), Some(266));
        assert_eq!(engine.upper_lock_clock(), None);
    }

    #[test]
    fn step_stays_in_bounds_for_arbitrary_utilization() {
        let (mut engine, _rec) = engine_with_window(2);
        let pattern = [0, 100, 37, 99, 1, 100, 100, 0, 0, 64, 100, 12];
        for util in pattern.iter().cycle().take(60) {
            tick(&mut engine, *util);
            let level = engine.current_level();
            assert!(level <= 6);
        }
    }

    #[test]
    fn calibration_deferred_until_source_complete() {
        let table = DvfsTable::mali_t604();
        let all: HashMap<u32, u32> = table
            .levels()
            .iter()
            .map(|l| (l.clock_mhz, l.voltage_uv - 12_500))
            .collect();
        let mut partial = all.clone();
        partial.remove(&266);

        let (applier, rec) = recording_applier();
        let asv = AsvCalibrator::new(Box::new(MapCalibrator(partial)));
        let mut engine = DvfsEngine::new(table, 1, Some(450), applier, Some(asv));
        engine.enable(true, None).unwrap();

        tick(&mut engine, 50);
        assert_eq!(
            engine.shared().lock().unwrap().status.asv,
            AsvStatus::NotInit
        );

        // Swap in a complete source by re-requesting calibration on a fresh
        // engine is overkill; instead verify the deferred pass kept the stock
        // voltage in the apply stream.
        tick(&mut engine, 50);
        assert!(
            rec.calls()
                .iter()
                .any(|c| *c == Call::Voltage(1_150_000) || *c == Call::Voltage(1_125_000)),
            "stock voltages remain in effect while calibration is deferred"
        );
    }

    #[test]
    fn calibration_commits_once_and_is_not_retried() {
        let table = DvfsTable::mali_t604();
        let all: HashMap<u32, u32> = table
            .levels()
            .iter()
            .map(|l| (l.clock_mhz, l.voltage_uv - 12_500))
            .collect();

        let (applier, rec) = recording_applier();
        let asv = AsvCalibrator::new(Box::new(MapCalibrator(all)));
        let mut engine = DvfsEngine::new(table, 1, Some(450), applier, Some(asv));
        engine.enable(true, None).unwrap();

        tick(&mut engine, 50);
        assert_eq!(engine.shared().lock().unwrap().status.asv, AsvStatus::Init);

        // First post-calibration transition uses the calibrated voltage.
        assert!(rec.calls().contains(&Call::Voltage(1_150_000 - 12_500)));
    }

    #[test]
    fn asv_disable_restores_default_voltages() {
        let table = DvfsTable::mali_t604();
        let all: HashMap<u32, u32> = table
            .levels()
            .iter()
            .map(|l| (l.clock_mhz, l.voltage_uv - 12_500))
            .collect();

        let (applier, rec) = recording_applier();
        let asv = AsvCalibrator::new(Box::new(MapCalibrator(all)));
        let mut engine = DvfsEngine::new(table, 1, Some(450), applier, Some(asv));
        engine.enable(true, None).unwrap();

        tick(&mut engine, 50);
        engine.set_asv_enabled(false);
        rec.clear();

        // Next evaluations walk down with the default voltage table restored.
        tick(&mut engine, 50);
        assert!(rec.calls().contains(&Call::Voltage(1_125_000)));
    }

    #[test]
    fn forced_clock_resets_window_and_applies_level() {
        let (mut engine, rec) = engine_with_window(3);
        tick(&mut engine, 50);
        rec.clear();

        engine.enable(true, Some(266)).unwrap();
        assert_eq!(engine.current_level(), 2);
        assert_eq!(engine.current_utilization(), 0);
        assert!(rec.calls().contains(&Call::Clock(266)));
    }

    #[test]
    fn unknown_forced_clock_is_an_error() {
        let (mut engine, _rec) = engine_with_window(1);
        assert!(engine.enable(true, Some(123)).is_err());
    }

    #[test]
    fn disable_releases_bandwidth_and_keeps_step() {
        let (mut engine, rec) = engine_with_window(1);
        tick(&mut engine, 50);
        let level = engine.current_level();
        rec.clear();

        engine.enable(false, None).unwrap();
        assert_eq!(
            rec.calls(),
            vec![Call::Bandwidth(
                crate::core::apply::BandwidthFloor::Unconstrained
            )]
        );
        assert_eq!(engine.current_level(), level);

        // Disabled: evaluations are no-ops.
        rec.clear();
        tick(&mut engine, 100);
        assert!(rec.calls().is_empty());
        assert_eq!(engine.current_level(), level);
    }

    #[test]
    fn export_and_reset_time_in_state() {
        let (mut engine, _rec) = engine_with_window(1);
        tick(&mut engine, 50);
        std::thread::sleep(Duration::from_millis(5));
        tick(&mut engine, 50);

        let export = engine.export_time_in_state();
        assert_eq!(export.len(), 7);
        assert_eq!(export[5].0, 450);
        assert!(export[5].1 >= Duration::from_millis(5));

        engine.reset_time_in_state();
        assert!(
            engine
                .export_time_in_state()
                .iter()
                .all(|&(_, t)| t < Duration::from_millis(5))
        );
    }
}
