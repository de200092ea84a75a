use crate::core::lock::FrequencyLockManager;
use crate::core::table::DvfsTable;
use tracing::debug;

/// Inputs to one level decision.
#[derive(Debug, Clone, Copy)]
pub struct Evaluation {
    pub step: usize,
    /// Instantaneous utilization of the latest tick.
    pub utilization: u8,
    /// Utilization over the last completed sampling window.
    pub windowed_utilization: u8,
    /// Whether the sampling window completed since the previous decision.
    pub window_complete: bool,
}

/// Hysteresis state machine over the table indices.
///
/// Up-steps react to the per-tick utilization figure every evaluation;
/// down-steps only fire on a completed window, against the windowed figure.
/// The checkpoint level additionally requires the windowed figure to confirm
/// an up-step before the table is walked past it.
#[derive(Debug, Clone, Copy)]
pub struct DvfsController {
    checkpoint: Option<usize>,
}

impl DvfsController {
    pub fn new(checkpoint: Option<usize>) -> Self {
        Self { checkpoint }
    }

    pub fn decide(
        &self,
        table: &DvfsTable,
        eval: Evaluation,
        locks: &FrequencyLockManager,
    ) -> usize {
        let step = eval.step;
        let level = table.level(step);
        let mut next = step;

        if eval.utilization > level.max_threshold {
            if step < table.max_step() {
                let confirmed = self.checkpoint != Some(step)
                    || eval.windowed_utilization > level.max_threshold;
                if confirmed {
                    next = step + 1;
                } else {
                    debug!(
                        target: "g3dgov::dvfs",
                        "Up-step held at checkpoint {} (windowed {}% <= {}%)",
                        step, eval.windowed_utilization, level.max_threshold
                    );
                }
            }
        } else if eval.window_complete
            && step > 0
            && eval.windowed_utilization < level.min_threshold
        {
            next = step - 1;
        }

        locks.clamp(next, table.max_step())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn eval(step: usize, util: u8, windowed: u8, complete: bool) -> Evaluation {
        Evaluation {
            step,
            utilization: util,
            windowed_utilization: windowed,
            window_complete: complete,
        }
    }

    fn controller() -> DvfsController {
        // Checkpoint at the 450 MHz level of the built-in table.
        DvfsController::new(Some(5))
    }

    #[test]
    fn up_step_on_high_utilization() {
        let table = DvfsTable::mali_t604();
        let locks = FrequencyLockManager::default();
        // Level 2 max threshold is 78.
        let next = controller().decide(&table, eval(2, 80, 0, false), &locks);
        assert_eq!(next, 3);
    }

    #[test]
    fn no_up_step_at_ceiling() {
        let table = DvfsTable::mali_t604();
        let locks = FrequencyLockManager::default();
        let next = controller().decide(&table, eval(6, 100, 100, true), &locks);
        assert_eq!(next, 6);
    }

    #[test]
    fn checkpoint_requires_windowed_confirmation() {
        let table = DvfsTable::mali_t604();
        let locks = FrequencyLockManager::default();

        // Level 5 (450 MHz) max threshold is 99: the per-tick spike alone must
        // not advance past the checkpoint.
        let next = controller().decide(&table, eval(5, 100, 90, false), &locks);
        assert_eq!(next, 5);

        // With the windowed figure also above threshold, it advances.
        let next = controller().decide(&table, eval(5, 100, 100, false), &locks);
        assert_eq!(next, 6);
    }

    #[test]
    fn down_step_only_on_completed_window() {
        let table = DvfsTable::mali_t604();
        let locks = FrequencyLockManager::default();

        // Level 4 min threshold is 70.
        let next = controller().decide(&table, eval(4, 50, 50, false), &locks);
        assert_eq!(next, 4, "no down-step mid-window");

        let next = controller().decide(&table, eval(4, 50, 50, true), &locks);
        assert_eq!(next, 3);
    }

    #[test]
    fn no_down_step_at_floor() {
        let table = DvfsTable::mali_t604();
        let locks = FrequencyLockManager::default();
        let next = controller().decide(&table, eval(0, 0, 0, true), &locks);
        assert_eq!(next, 0);
    }

    #[test]
    fn idempotent_between_window_completions() {
        let table = DvfsTable::mali_t604();
        let locks = FrequencyLockManager::default();

        // Utilization in the dead band, window not complete: stays put no
        // matter how often it is evaluated.
        let e = eval(3, 75, 75, false);
        assert_eq!(controller().decide(&table, e, &locks), 3);
        assert_eq!(controller().decide(&table, e, &locks), 3);
    }

    #[test]
    fn clamped_by_locks_after_decision() {
        let table = DvfsTable::mali_t604();

        let mut locks = FrequencyLockManager::default();
        locks.set_upper(2).unwrap();
        let next = controller().decide(&table, eval(2, 90, 90, false), &locks);
        assert_eq!(next, 2, "upper lock caps the up-step");

        let mut locks = FrequencyLockManager::default();
        locks.set_under(3).unwrap();
        let next = controller().decide(&table, eval(3, 0, 0, true), &locks);
        assert_eq!(next, 3, "under lock holds the down-step");
    }

    #[test]
    fn settles_where_min_threshold_no_longer_exceeded() {
        // Feeding 50% with a completed window every evaluation walks down one
        // level at a time from the top until min_threshold(step) <= 50.
        let table = DvfsTable::mali_t604();
        let locks = FrequencyLockManager::default();
        let ctl = controller();

        let mut step = 6;
        for _ in 0..10 {
            step = ctl.decide(&table, eval(step, 50, 50, true), &locks);
        }
        // min thresholds: 0, 50, 60, 70, 70, 76, 99 -> settles at level 1.
        assert_eq!(step, 1);
        assert!(table.level(step).min_threshold <= 50);
    }
}
