use std::time::Duration;

/// Result of feeding one scheduling tick into the sampler.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct SampleOutcome {
    /// Utilization of this tick's sample alone.
    pub utilization: u8,
    /// True when this tick filled the window. Down-step decisions are only
    /// eligible on a completed window.
    pub window_complete: bool,
}

/// Accumulates busy/idle time into fixed-length windows.
///
/// Every tick yields the instantaneous utilization of that sample; once per
/// window the accumulated figure is recomputed. The two are deliberately kept
/// separate: the per-tick figure drives up-steps, the windowed figure drives
/// down-steps and the checkpoint confirmation.
#[derive(Debug, Clone)]
pub struct UtilizationSampler {
    window_len: u32,
    ticks: u32,
    busy: Duration,
    idle: Duration,
    windowed: u8,
}

impl UtilizationSampler {
    pub fn new(window_len: u32) -> Self {
        Self {
            window_len: window_len.max(1),
            ticks: 0,
            busy: Duration::ZERO,
            idle: Duration::ZERO,
            windowed: 0,
        }
    }

    pub fn record(&mut self, busy: Duration, idle: Duration) -> SampleOutcome {
        if self.ticks < self.window_len {
            self.ticks += 1;
            self.busy += busy;
            self.idle += idle;
        } else {
            self.busy = busy;
            self.idle = idle;
            self.ticks = 1;
        }

        let window_complete = self.ticks == self.window_len;
        if window_complete {
            let total = self.busy + self.idle;
            // Zero denominator: leave the windowed figure unchanged.
            if !total.is_zero() {
                self.windowed = ratio_percent(self.busy, total);
            }
        }

        let sample_total = busy + idle;
        let utilization = if sample_total.is_zero() {
            0
        } else {
            ratio_percent(busy, sample_total)
        };

        SampleOutcome {
            utilization,
            window_complete,
        }
    }

    /// Utilization over the most recently completed window.
    pub fn windowed(&self) -> u8 {
        self.windowed
    }

    pub fn reset(&mut self) {
        self.ticks = 0;
        self.busy = Duration::ZERO;
        self.idle = Duration::ZERO;
        self.windowed = 0;
    }
}

fn ratio_percent(part: Duration, total: Duration) -> u8 {
    (part.as_nanos() * 100 / total.as_nanos()).min(100) as u8
}
