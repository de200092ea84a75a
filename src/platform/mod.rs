pub mod sysfs;

use anyhow::Result;
use std::time::Duration;

/// One scheduling tick's worth of GPU activity.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct GpuLoad {
    pub busy: Duration,
    pub idle: Duration,
}

/// Source of busy/idle figures, polled once per tick.
pub trait LoadSource {
    /// `None` while the source has no usable delta yet (first read, counter
    /// wrap).
    fn sample(&mut self) -> Result<Option<GpuLoad>>;
}
