use crate::core::apply::{BandwidthQos, LevelApplier};
use crate::core::asv::AsvCalibrator;
use crate::core::config::Settings;
use crate::core::engine::{DvfsEngine, DvfsShared};
use crate::core::lock::LockConflict;
use crate::platform::sysfs::{
    FileCalibrator, NoBandwidth, SysfsBandwidth, SysfsClock, SysfsLoadSource, SysfsRail,
};
use crate::platform::LoadSource;
use anyhow::{Context, Result, anyhow};
use std::sync::{Arc, Mutex};
use std::time::Duration;
use tokio::sync::{mpsc, oneshot};
use tokio::task::JoinHandle;
use tracing::{debug, error, info, warn};

/// Commands processed by the single evaluation worker. The worker owns the
/// engine, so at most one decision or level application is ever in flight and
/// none is cancelled mid-transition.
enum WorkerCmd {
    Evaluate,
    Enable {
        on: bool,
        forced_clock_mhz: Option<u32>,
        ack: oneshot::Sender<Result<()>>,
    },
    SetAsvEnabled {
        enabled: bool,
        ack: oneshot::Sender<()>,
    },
    ExportTimeInState {
        reply: oneshot::Sender<Vec<(u32, Duration)>>,
    },
    ResetTimeInState {
        ack: oneshot::Sender<()>,
    },
    /// Stops the worker even while handle clones (and their senders) are
    /// still alive.
    Shutdown,
}

async fn worker_loop(mut engine: DvfsEngine, mut rx: mpsc::Receiver<WorkerCmd>) {
    while let Some(cmd) = rx.recv().await {
        match cmd {
            WorkerCmd::Evaluate => {
                if let Err(e) = engine.evaluate() {
                    error!(target: "g3dgov::daemon", "Evaluation failed: {:?}", e);
                }
            }
            WorkerCmd::Enable {
                on,
                forced_clock_mhz,
                ack,
            } => {
                let _ = ack.send(engine.enable(on, forced_clock_mhz));
            }
            WorkerCmd::SetAsvEnabled { enabled, ack } => {
                engine.set_asv_enabled(enabled);
                let _ = ack.send(());
            }
            WorkerCmd::ExportTimeInState { reply } => {
                let _ = reply.send(engine.export_time_in_state());
            }
            WorkerCmd::ResetTimeInState { ack } => {
                engine.reset_time_in_state();
                let _ = ack.send(());
            }
            WorkerCmd::Shutdown => break,
        }
    }
    debug!(target: "g3dgov::daemon", "Evaluation worker stopped");
}

/// Cloneable front to the governor: status reads go straight to the shared
/// state under the short lock, everything that touches the table or the
/// collaborators goes through the worker queue.
#[derive(Clone)]
pub struct DvfsHandle {
    shared: Arc<Mutex<DvfsShared>>,
    clocks: Arc<Vec<u32>>,
    tx: mpsc::Sender<WorkerCmd>,
}

impl DvfsHandle {
    /// Feeds one tick of busy/idle time and schedules an evaluation. A full
    /// queue means evaluations are already pending, so the nudge coalesces.
    pub fn record_utilization_sample(&self, busy: Duration, idle: Duration) {
        self.shared.lock().unwrap().record_sample(busy, idle);
        let _ = self.tx.try_send(WorkerCmd::Evaluate);
    }

    pub fn get_current_utilization(&self) -> u8 {
        self.shared.lock().unwrap().status.utilization
    }

    pub fn get_current_level(&self) -> usize {
        self.shared.lock().unwrap().status.current_step
    }

    pub fn set_upper_lock(&self, level: usize) -> Result<(), LockConflict> {
        assert!(level < self.clocks.len(), "lock level {level} out of range");
        self.shared.lock().unwrap().set_upper_lock(level)
    }

    pub fn clear_upper_lock(&self) {
        self.shared.lock().unwrap().clear_upper_lock();
    }

    pub fn set_under_lock(&self, level: usize) -> Result<(), LockConflict> {
        assert!(level < self.clocks.len(), "lock level {level} out of range");
        self.shared.lock().unwrap().set_under_lock(level)
    }

    pub fn clear_under_lock(&self) {
        self.shared.lock().unwrap().clear_under_lock();
    }

    pub fn get_upper_lock_clock(&self) -> Option<u32> {
        let locked = self.shared.lock().unwrap().status.locks.upper();
        locked.map(|l| self.clocks[l])
    }

    pub fn get_under_lock_clock(&self) -> Option<u32> {
        let locked = self.shared.lock().unwrap().status.locks.under();
        locked.map(|l| self.clocks[l])
    }

    /// Enables or disables the governor, optionally forcing a clock first.
    /// Resolves only after any in-flight evaluation has completed.
    pub async fn enable(&self, on: bool, forced_clock_mhz: Option<u32>) -> Result<()> {
        let (ack, done) = oneshot::channel();
        self.tx
            .send(WorkerCmd::Enable {
                on,
                forced_clock_mhz,
                ack,
            })
            .await
            .map_err(|_| anyhow!("Evaluation worker gone"))?;
        done.await.context("Evaluation worker gone")?
    }

    pub async fn set_asv_enabled(&self, enabled: bool) -> Result<()> {
        let (ack, done) = oneshot::channel();
        self.tx
            .send(WorkerCmd::SetAsvEnabled { enabled, ack })
            .await
            .map_err(|_| anyhow!("Evaluation worker gone"))?;
        done.await.context("Evaluation worker gone")
    }

    pub async fn export_time_in_state(&self) -> Result<Vec<(u32, Duration)>> {
        let (reply, result) = oneshot::channel();
        self.tx
            .send(WorkerCmd::ExportTimeInState { reply })
            .await
            .map_err(|_| anyhow!("Evaluation worker gone"))?;
        result.await.context("Evaluation worker gone")
    }

    pub async fn reset_time_in_state(&self) -> Result<()> {
        let (ack, done) = oneshot::channel();
        self.tx
            .send(WorkerCmd::ResetTimeInState { ack })
            .await
            .map_err(|_| anyhow!("Evaluation worker gone"))?;
        done.await.context("Evaluation worker gone")
    }
}

async fn tick_loop(
    handle: DvfsHandle,
    load: Arc<Mutex<Box<dyn LoadSource + Send>>>,
    period: Duration,
) {
    // First tick one full period out, like a relative timer start.
    let mut ticker = tokio::time::interval_at(tokio::time::Instant::now() + period, period);
    ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
    loop {
        ticker.tick().await;
        let sample = load.lock().unwrap().sample();
        match sample {
            Ok(Some(l)) => handle.record_utilization_sample(l.busy, l.idle),
            Ok(None) => debug!(target: "g3dgov::daemon", "No usable load sample this tick"),
            Err(e) => warn!(target: "g3dgov::daemon", "Load sample failed: {:?}", e),
        }
    }
}

pub struct Daemon {
    handle: DvfsHandle,
    worker: JoinHandle<()>,
    tick: Option<JoinHandle<()>>,
    tick_period: Duration,
    load: Arc<Mutex<Box<dyn LoadSource + Send>>>,
}

impl Daemon {
    pub fn new(
        engine: DvfsEngine,
        load: Box<dyn LoadSource + Send>,
        tick_period: Duration,
    ) -> Self {
        let shared = engine.shared();
        let clocks = Arc::new(engine.clocks());
        let (tx, rx) = mpsc::channel(4);
        let worker = tokio::spawn(worker_loop(engine, rx));

        Self {
            handle: DvfsHandle { shared, clocks, tx },
            worker,
            tick: None,
            tick_period,
            load: Arc::new(Mutex::new(load)),
        }
    }

    pub fn handle(&self) -> DvfsHandle {
        self.handle.clone()
    }

    /// Turns the governor on or off. Enabling starts the periodic tick
    /// source; disabling cancels it first, then waits for the worker to
    /// finish any in-flight transition and release the bandwidth floor.
    pub async fn set_enabled(&mut self, on: bool, forced_clock_mhz: Option<u32>) -> Result<()> {
        if !on && let Some(tick) = self.tick.take() {
            tick.abort();
        }

        self.handle.enable(on, forced_clock_mhz).await?;

        if on && self.tick.is_none() {
            self.tick = Some(tokio::spawn(tick_loop(
                self.handle.clone(),
                Arc::clone(&self.load),
                self.tick_period,
            )));
            debug!(
                target: "g3dgov::daemon",
                "Tick source started ({} ms period)",
                self.tick_period.as_millis()
            );
        }
        Ok(())
    }

    pub async fn shutdown(mut self) -> Result<()> {
        self.set_enabled(false, None).await?;
        let Daemon { handle, worker, .. } = self;
        let _ = handle.tx.send(WorkerCmd::Shutdown).await;
        worker.await.context("Evaluation worker panicked")
    }
}

/// Builds the engine from config and platform collaborators and runs until
/// interrupted. A missing clock or regulator surfaces here and the governor
/// never starts; the device stays at its reset operating point.
pub async fn run(settings: &Settings) -> Result<()> {
    let table = settings.build_table()?;

    let clock = SysfsClock::new(&settings.platform).context("Clock controller unavailable")?;
    let rail = SysfsRail::new(&settings.platform).context("GPU regulator unavailable")?;
    let qos: Box<dyn BandwidthQos + Send> = match &settings.platform.bandwidth {
        Some(path) => Box::new(SysfsBandwidth::new(path.clone())),
        None => Box::new(NoBandwidth),
    };
    let load = SysfsLoadSource::new(&settings.platform).context("Load counters unavailable")?;

    let asv = if settings.asv.enabled {
        match &settings.asv.voltage_table {
            Some(path) => Some(AsvCalibrator::new(Box::new(FileCalibrator::new(
                path.clone(),
            )))),
            None => {
                warn!(target: "g3dgov::asv", "ASV enabled without a voltage table, running on defaults");
                None
            }
        }
    } else {
        None
    };

    let applier = LevelApplier::new(Box::new(clock), Box::new(rail), qos);
    let engine = DvfsEngine::new(
        table,
        settings.dvfs.window_ticks,
        Some(settings.dvfs.checkpoint_clock_mhz),
        applier,
        asv,
    );

    let mut daemon = Daemon::new(
        engine,
        Box::new(load),
        Duration::from_millis(settings.daemon.tick_interval_ms),
    );
    daemon
        .set_enabled(true, settings.dvfs.initial_clock_mhz)
        .await?;

    wait_for_shutdown().await;

    info!(target: "g3dgov::daemon", "Shutting down");
    daemon.shutdown().await
}

async fn wait_for_shutdown() {
    let mut sigterm = match tokio::signal::unix::signal(tokio::signal::unix::SignalKind::terminate())
    {
        Ok(s) => s,
        Err(e) => {
            error!(target: "g3dgov::daemon", "Failed to install SIGTERM handler: {:?}", e);
            let _ = tokio::signal::ctrl_c().await;
            return;
        }
    };

    tokio::select! {
        _ = tokio::signal::ctrl_c() => {}
        _ = sigterm.recv() => {}
    }
}
