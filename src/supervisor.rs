//! Worker supervision.
//!
//! The supervisor owns one [`SensorDescriptor`] per configured sensor. Once a
//! second it checks every worker; a worker that died is replaced by a fresh
//! instance built from the same settings, so a crash costs the sensor its
//! in-memory state and nothing else. Shutdown stops the workers in
//! configuration order and disconnects the broker last.

use crate::config::{Config, SensorConfig};
use crate::error::Result;
use crate::sensors::{Devices, Sensor, Worker, describe};
use log::{debug, info, warn};
use std::time::Duration;
use tokio::time::MissedTickBehavior;
use tokio_util::sync::CancellationToken;

/// Period of the liveness check.
pub const LIVENESS_INTERVAL: Duration = Duration::from_secs(1);

/// A worker that keeps failing is reported at warn level on its first
/// restart and then every this many restarts.
const RESTART_WARN_EVERY: u32 = 60;

/// A configured sensor and its current worker.
pub struct SensorDescriptor {
    config: SensorConfig,
    worker: Option<Worker>,
    restarts: u32,
}

impl SensorDescriptor {
    pub fn config(&self) -> &SensorConfig {
        &self.config
    }

    /// Whether a worker task is currently running for this sensor.
    pub fn is_running(&self) -> bool {
        self.worker.as_ref().is_some_and(Worker::is_alive)
    }

    pub fn restarts(&self) -> u32 {
        self.restarts
    }
}

/// Requests a running [`Supervisor`] to shut down.
#[derive(Clone)]
pub struct StopHandle(CancellationToken);

impl StopHandle {
    pub fn stop(&self) {
        self.0.cancel();
    }
}

pub struct Supervisor {
    descriptors: Vec<SensorDescriptor>,
    devices: Devices,
    stop: CancellationToken,
    stop_grace: Duration,
}

impl Supervisor {
    pub fn new(config: &Config, devices: Devices) -> Self {
        let descriptors = config
            .sensors
            .iter()
            .cloned()
            .map(|config| SensorDescriptor {
                config,
                worker: None,
                restarts: 0,
            })
            .collect();

        Self {
            descriptors,
            devices,
            stop: CancellationToken::new(),
            stop_grace: Duration::from_secs(config.supervisor.stop_grace),
        }
    }

    pub fn stop_handle(&self) -> StopHandle {
        StopHandle(self.stop.clone())
    }

    pub fn stop(&self) {
        self.stop.cancel();
    }

    pub fn descriptors(&self) -> &[SensorDescriptor] {
        &self.descriptors
    }

    /// Start the broker connection and every worker, supervise until
    /// stopped, then shut down.
    pub async fn run(mut self) -> Result<()> {
        if let Err(e) = self.start() {
            self.shutdown().await;
            return Err(e);
        }

        let mut liveness = tokio::time::interval(LIVENESS_INTERVAL);
        liveness.set_missed_tick_behavior(MissedTickBehavior::Delay);

        loop {
            tokio::select! {
                _ = self.stop.cancelled() => break,
                _ = liveness.tick() => self.check_workers(),
            }
        }

        self.shutdown().await;
        Ok(())
    }

    /// Connect the broker and spawn one worker per descriptor.
    pub fn start(&mut self) -> Result<()> {
        info!("[Supervisor] Starting {} sensor(s)", self.descriptors.len());
        self.devices.broker.clone().connect()?;

        for descriptor in &mut self.descriptors {
            descriptor.worker = Some(spawn(&descriptor.config, &self.devices));
        }
        Ok(())
    }

    /// Replace every worker that died. Workers that retired because the host
    /// cannot serve their sensor are dropped instead.
    pub fn check_workers(&mut self) {
        for descriptor in &mut self.descriptors {
            let Some(worker) = descriptor.worker.as_ref() else {
                continue;
            };
            if worker.is_alive() {
                continue;
            }

            if worker.is_retired() {
                warn!(
                    "[Supervisor] {} is unsupported on this host, not restarting",
                    worker.name()
                );
                descriptor.worker = None;
                continue;
            }

            descriptor.restarts += 1;
            if descriptor.restarts == 1 || descriptor.restarts % RESTART_WARN_EVERY == 0 {
                warn!(
                    "[Supervisor] {} is not running, restarting (restart #{})",
                    worker.name(),
                    descriptor.restarts
                );
            } else {
                debug!(
                    "[Supervisor] Restarting {} (restart #{})",
                    worker.name(),
                    descriptor.restarts
                );
            }
            descriptor.worker = Some(spawn(&descriptor.config, &self.devices));
        }
    }

    /// Stop all workers in order, then disconnect the broker.
    pub async fn shutdown(&mut self) {
        info!("[Supervisor] Shutting down");
        for descriptor in &mut self.descriptors {
            if let Some(worker) = descriptor.worker.take() {
                worker.stop(self.stop_grace).await;
            }
        }

        self.devices.broker.disconnect().await;
        info!("[Supervisor] All workers stopped");
    }
}

fn spawn(config: &SensorConfig, devices: &Devices) -> Worker {
    Worker::start(describe(config), Sensor::new(config, devices))
}
