use super::{GpuLoad, LoadSource};
use crate::core::apply::{BandwidthFloor, BandwidthQos, ClockController, PowerRail};
use crate::core::asv::VoltageCalibrator;
use crate::core::config::PlatformSettings;
use anyhow::{Context, Result, bail};
use std::collections::HashMap;
use std::fs;
use std::path::{Path, PathBuf};
use std::time::{Duration, Instant};
use tracing::{debug, warn};

fn read_u64(path: &Path) -> Result<u64> {
    let content = fs::read_to_string(path)
        .with_context(|| format!("Failed to read {}", path.display()))?;
    content
        .trim()
        .parse()
        .with_context(|| format!("Malformed value in {}", path.display()))
}

fn write_value(path: &Path, value: impl std::fmt::Display) -> Result<()> {
    fs::write(path, value.to_string())
        .with_context(|| format!("Failed to write {}", path.display()))
}

/// Clock rate control over sysfs, with a bounded wait on the stability flag.
pub struct SysfsClock {
    rate_path: PathBuf,
    stable_path: Option<PathBuf>,
    stable_timeout: Duration,
}

impl SysfsClock {
    const STABLE_POLL: Duration = Duration::from_micros(500);

    pub fn new(settings: &PlatformSettings) -> Result<Self> {
        if !settings.clock_rate.exists() {
            bail!("Clock rate file {} not present", settings.clock_rate.display());
        }
        Ok(Self {
            rate_path: settings.clock_rate.clone(),
            stable_path: settings.clock_stable.clone(),
            stable_timeout: Duration::from_millis(settings.clock_stable_timeout_ms),
        })
    }

    /// Polls the divider status until it reports stable. Bounded: reports a
    /// failure on timeout instead of spinning forever.
    fn wait_stable(&self) -> Result<()> {
        let Some(path) = &self.stable_path else {
            return Ok(());
        };

        let deadline = Instant::now() + self.stable_timeout;
        loop {
            if read_u64(path)? == 0 {
                return Ok(());
            }
            if Instant::now() >= deadline {
                bail!(
                    "Clock failed to stabilise within {:?} ({})",
                    self.stable_timeout,
                    path.display()
                );
            }
            std::thread::sleep(Self::STABLE_POLL);
        }
    }
}

impl ClockController for SysfsClock {
    fn set_clock(&mut self, clock_mhz: u32) -> Result<()> {
        write_value(&self.rate_path, clock_mhz)?;
        self.wait_stable()?;
        debug!(target: "g3dgov::platform", "Clock set to {} MHz", clock_mhz);
        Ok(())
    }
}

/// Regulator microvolt control over sysfs.
pub struct SysfsRail {
    path: PathBuf,
}

impl SysfsRail {
    /// Fails when the regulator is not readable, so DVFS never starts against
    /// a missing rail.
    pub fn new(settings: &PlatformSettings) -> Result<Self> {
        let rail = Self {
            path: settings.regulator.clone(),
        };
        let uv = read_u64(&rail.path).context("Failed to initialise GPU regulator")?;
        debug!(target: "g3dgov::platform", "Regulator at {} uV", uv);
        Ok(rail)
    }
}

impl PowerRail for SysfsRail {
    fn set_voltage(&mut self, microvolts: u32) -> Result<()> {
        write_value(&self.path, microvolts)?;
        debug!(target: "g3dgov::platform", "Voltage set to {} uV", microvolts);
        Ok(())
    }

    fn voltage(&mut self) -> Result<u32> {
        Ok(read_u64(&self.path)? as u32)
    }
}

/// Memory-bandwidth QoS request file; -1 drops the constraint.
pub struct SysfsBandwidth {
    path: PathBuf,
}

impl SysfsBandwidth {
    pub fn new(path: PathBuf) -> Self {
        Self { path }
    }
}

impl BandwidthQos for SysfsBandwidth {
    fn request(&mut self, floor: BandwidthFloor) -> Result<()> {
        match floor {
            BandwidthFloor::Unconstrained => write_value(&self.path, -1),
            BandwidthFloor::MegabytesPerSec(mbps) => write_value(&self.path, mbps),
        }
    }
}

/// Stand-in for platforms without a QoS interface.
pub struct NoBandwidth;

impl BandwidthQos for NoBandwidth {
    fn request(&mut self, _floor: BandwidthFloor) -> Result<()> {
        Ok(())
    }
}

/// Calibrated voltages from a TOML file mapping clock (MHz) to µV:
///
/// ```toml
/// [voltages]
/// 100 = 887500
/// 160 = 900000
/// ```
///
/// The file is re-read on every query so a pass deferred while the platform
/// is still exporting the data succeeds on a later cycle.
pub struct FileCalibrator {
    path: PathBuf,
}

#[derive(serde::Deserialize)]
struct CalibrationFile {
    voltages: HashMap<String, u32>,
}

impl FileCalibrator {
    pub fn new(path: PathBuf) -> Self {
        Self { path }
    }
}

impl VoltageCalibrator for FileCalibrator {
    fn query(&self, clock_mhz: u32) -> Option<u32> {
        let content = fs::read_to_string(&self.path).ok()?;
        let parsed: CalibrationFile = match toml::from_str(&content) {
            Ok(p) => p,
            Err(e) => {
                warn!(target: "g3dgov::asv", "Malformed voltage table {}: {}", self.path.display(), e);
                return None;
            }
        };
        parsed.voltages.get(&clock_mhz.to_string()).copied()
    }
}

/// Busy/total counters from a cumulative "busy_ns total_ns" file, turned into
/// per-tick deltas. The first read primes the counters; a wrap or reset
/// re-primes and drops that sample.
pub struct SysfsLoadSource {
    path: PathBuf,
    last: Option<(u64, u64)>,
}

impl SysfsLoadSource {
    pub fn new(settings: &PlatformSettings) -> Result<Self> {
        if !settings.load.exists() {
            bail!("Load counter file {} not present", settings.load.display());
        }
        Ok(Self {
            path: settings.load.clone(),
            last: None,
        })
    }
}

impl LoadSource for SysfsLoadSource {
    fn sample(&mut self) -> Result<Option<GpuLoad>> {
        let content = fs::read_to_string(&self.path)
            .with_context(|| format!("Failed to read {}", self.path.display()))?;
        let parts: Vec<u64> = content
            .split_whitespace()
            .filter_map(|s| s.parse().ok())
            .collect();

        if parts.len() < 2 {
            return Ok(None);
        }
        let (busy, total) = (parts[0], parts[1]);

        let Some((last_busy, last_total)) = self.last else {
            self.last = Some((busy, total));
            return Ok(None);
        };

        if busy < last_busy || total < last_total {
            debug!(target: "g3dgov::platform", "Load counter wrapped, re-priming");
            self.last = Some((busy, total));
            return Ok(None);
        }

        let delta_busy = busy - last_busy;
        let delta_total = total - last_total;
        self.last = Some((busy, total));

        if delta_total == 0 {
            return Ok(None);
        }

        Ok(Some(GpuLoad {
            busy: Duration::from_nanos(delta_busy),
            idle: Duration::from_nanos(delta_total - delta_busy),
        }))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write;

    fn temp_file(name: &str, content: &str) -> PathBuf {
        let path = std::env::temp_dir().join(format!("g3dgov-test-{}-{}", std::process::id(), name));
        let mut f = fs::File::create(&path).unwrap();
        f.write_all(content.as_bytes()).unwrap();
        path
    }

    #[test]
    fn load_source_primes_then_yields_deltas() {
        let path = temp_file("load", "1000 2000\n");
        let settings = PlatformSettings {
            clock_rate: path.clone(),
            clock_stable: None,
            clock_stable_timeout_ms: 10,
            regulator: path.clone(),
            bandwidth: None,
            load: path.clone(),
        };
        let mut source = SysfsLoadSource::new(&settings).unwrap();

        assert_eq!(source.sample().unwrap(), None, "first read primes");

        fs::write(&path, "1600 3000\n").unwrap();
        let load = source.sample().unwrap().unwrap();
        assert_eq!(load.busy, Duration::from_nanos(600));
        assert_eq!(load.idle, Duration::from_nanos(400));

        // Counter reset: sample dropped, counters re-primed.
        fs::write(&path, "10 20\n").unwrap();
        assert_eq!(source.sample().unwrap(), None);

        fs::remove_file(&path).ok();
    }

    #[test]
    fn clock_stable_wait_times_out() {
        let rate = temp_file("rate", "0\n");
        let stable = temp_file("stable", "1\n");
        let settings = PlatformSettings {
            clock_rate: rate.clone(),
            clock_stable: Some(stable.clone()),
            clock_stable_timeout_ms: 5,
            regulator: rate.clone(),
            bandwidth: None,
            load: rate.clone(),
        };
        let mut clock = SysfsClock::new(&settings).unwrap();

        let err = clock.set_clock(266).unwrap_err();
        assert!(err.to_string().contains("stabilise"));

        fs::write(&stable, "0\n").unwrap();
        assert!(clock.set_clock(350).is_ok());

        fs::remove_file(&rate).ok();
        fs::remove_file(&stable).ok();
    }

    #[test]
    fn file_calibrator_reports_missing_clock_as_unavailable() {
        let path = temp_file(
            "asv",
            "[voltages]\n100 = 887500\n160 = 900000\n",
        );
        let cal = FileCalibrator::new(path.clone());
        assert_eq!(cal.query(100), Some(887_500));
        assert_eq!(cal.query(266), None);

        fs::remove_file(&path).ok();
    }

    #[test]
    fn missing_regulator_fails_initialisation() {
        let settings = PlatformSettings {
            clock_rate: PathBuf::from("/nonexistent"),
            clock_stable: None,
            clock_stable_timeout_ms: 10,
            regulator: PathBuf::from("/nonexistent-regulator"),
            bandwidth: None,
            load: PathBuf::from("/nonexistent"),
        };
        assert!(SysfsRail::new(&settings).is_err());
    }
}
