//! Garage door worker.
//!
//! The door has a limit switch at each end of its travel. Every 0.5 s both
//! switches are sampled and fed to a [`DoorTracker`]:
//!
//! | top | bottom | state                                            |
//! |-----|--------|--------------------------------------------------|
//! | 0   | 1      | `open`                                           |
//! | 1   | 0      | `closed`                                         |
//! | 1   | 1      | `closing` after `open`, `opening` after `closed` |
//! | 1   | 1      | `stopped` once 30 s passed since travel began    |
//! | 1   | 1      | otherwise the previous state is held             |
//! | 0   | 0      | previous state is held                           |
//!
//! A [`DoorReporter`] decides what is published: `unknown` is the only
//! visible state while the broker is disconnected, and otherwise the state is
//! published on every change and at least once per `rate` seconds.
//!
//! Any message on `<topic>/actuate` energises the actuator line for one
//! second. Requests arriving during a pulse are ignored.

use super::Devices;
use crate::broker::{
    ConnectHandler, ConnectInfo, Message, MessageBroker, MessageHandler, Registration,
};
use crate::config::GarageDoorSettings;
use crate::error::Result;
use crate::hardware::{Level, LineMode};
use log::{debug, info, warn};
use rumqttc::QoS;
use std::sync::Arc;
use std::time::Duration;
use strum::{AsRefStr, Display};
use tokio::sync::mpsc;
use tokio::time::{Instant, MissedTickBehavior};
use tokio_util::sync::CancellationToken;

/// Sampling period of the limit switches.
pub const POLL_INTERVAL: Duration = Duration::from_millis(500);

/// Travel time after which a door between the switches counts as stopped.
pub const STOPPED_AFTER: Duration = Duration::from_secs(30);

/// How long the actuator line stays energised per request.
pub const PULSE_LENGTH: Duration = Duration::from_secs(1);

const ACTUATION_QUEUE: usize = 8;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Display, AsRefStr)]
#[strum(serialize_all = "lowercase")]
pub enum DoorState {
    Unknown,
    Closing,
    Closed,
    Opening,
    Open,
    Stopped,
}

/// Door state derived from the limit switches.
#[derive(Debug)]
pub struct DoorTracker {
    state: DoorState,
    /// When the current travel began. Starts at creation, so a door found
    /// between the switches is reported `stopped` only after a full window.
    travel_start: Instant,
}

impl DoorTracker {
    pub fn new(now: Instant) -> Self {
        Self {
            state: DoorState::Unknown,
            travel_start: now,
        }
    }

    pub fn state(&self) -> DoorState {
        self.state
    }

    /// Feed one sample of the switches and return the resulting state.
    pub fn update(&mut self, top: bool, bottom: bool, now: Instant) -> DoorState {
        self.state = match (top, bottom) {
            (false, true) => DoorState::Open,
            (true, false) => DoorState::Closed,
            (true, true) => match self.state {
                DoorState::Open => {
                    self.travel_start = now;
                    DoorState::Closing
                }
                DoorState::Closed => {
                    self.travel_start = now;
                    DoorState::Opening
                }
                _ if now.duration_since(self.travel_start) > STOPPED_AFTER => DoorState::Stopped,
                held => held,
            },
            (false, false) => self.state,
        };
        self.state
    }
}

/// Decides when the door state is published.
#[derive(Debug)]
pub struct DoorReporter {
    reported: DoorState,
    last_report: Instant,
    interval: Duration,
}

impl DoorReporter {
    pub fn new(interval: Duration, now: Instant) -> Self {
        Self {
            reported: DoorState::Unknown,
            last_report: now,
            interval,
        }
    }

    /// The externally visible state.
    pub fn reported(&self) -> DoorState {
        self.reported
    }

    /// Returns the state to publish now, if any.
    pub fn report(&mut self, state: DoorState, connected: bool, now: Instant) -> Option<DoorState> {
        if !connected {
            self.reported = DoorState::Unknown;
            return None;
        }

        if state != self.reported || now.duration_since(self.last_report) > self.interval {
            self.reported = state;
            self.last_report = now;
            return Some(state);
        }
        None
    }
}

/// One-shot actuator pulse.
#[derive(Debug, Default)]
pub struct ActuationTimer {
    release_at: Option<Instant>,
}

impl ActuationTimer {
    /// Arm the timer. Returns `false` if a pulse is already in progress.
    pub fn arm(&mut self, now: Instant) -> bool {
        if self.release_at.is_some() {
            return false;
        }
        self.release_at = Some(now + PULSE_LENGTH);
        true
    }

    pub fn is_armed(&self) -> bool {
        self.release_at.is_some()
    }

    pub fn release_at(&self) -> Option<Instant> {
        self.release_at
    }

    pub fn disarm(&mut self) {
        self.release_at = None;
    }
}

/// Re-subscribes to the actuation topic on every (re)connect.
struct Resubscribe {
    topic: String,
}

impl ConnectHandler for Resubscribe {
    fn on_connect(&self, broker: &dyn MessageBroker, _info: &ConnectInfo) {
        if let Err(e) = broker.subscribe(&self.topic, QoS::ExactlyOnce) {
            warn!("[Door] Failed to subscribe to {}: {}", self.topic, e);
        }
    }
}

/// Forwards actuation requests to the worker task.
struct ActuationRequests {
    tx: mpsc::Sender<()>,
}

impl MessageHandler for ActuationRequests {
    fn on_message(&self, message: &Message) {
        debug!("[Door] Actuation requested on {}", message.topic);
        if self.tx.try_send(()).is_err() {
            debug!("[Door] Actuation queue full, dropping request");
        }
    }
}

pub struct GarageDoor {
    settings: GarageDoorSettings,
    devices: Devices,
}

impl GarageDoor {
    pub fn new(settings: GarageDoorSettings, devices: Devices) -> Self {
        Self { settings, devices }
    }

    pub fn actuate_topic(&self) -> String {
        format!("{}/actuate", self.settings.topic)
    }

    pub(super) async fn run(self, cancel: CancellationToken) -> Result<()> {
        info!(
            "[Door] garagedoor started for topic '{}'",
            self.settings.topic
        );

        let hardware = &self.devices.hardware;
        let lines = self.settings.gpio;
        hardware.set_line_mode(lines.top, LineMode::Input).await?;
        hardware.set_line_mode(lines.bot, LineMode::Input).await?;
        hardware.write_line(lines.act, Level::Low).await?;
        hardware.set_line_mode(lines.act, LineMode::Output).await?;

        let broker = &self.devices.broker;
        let actuate_topic = self.actuate_topic();
        let (tx, actuations) = mpsc::channel(ACTUATION_QUEUE);
        let resubscribe = Arc::new(Resubscribe {
            topic: actuate_topic.clone(),
        });
        let _registration = Registration::new(broker.clone())
            .route(&actuate_topic, Arc::new(ActuationRequests { tx }))
            .on_connect(resubscribe.clone());

        if broker.is_connected() {
            resubscribe.on_connect(
                broker.as_ref(),
                &ConnectInfo {
                    session_present: false,
                },
            );
        }

        let mut timer = ActuationTimer::default();
        let result = self.poll_loop(&mut timer, actuations, &cancel).await;

        if timer.is_armed() {
            debug!("[Door] Releasing actuator on exit");
            hardware.write_line(lines.act, Level::Low).await?;
        }
        result
    }

    async fn poll_loop(
        &self,
        timer: &mut ActuationTimer,
        mut actuations: mpsc::Receiver<()>,
        cancel: &CancellationToken,
    ) -> Result<()> {
        let hardware = &self.devices.hardware;
        let act = self.settings.gpio.act;

        let now = Instant::now();
        let mut tracker = DoorTracker::new(now);
        let mut reporter = DoorReporter::new(Duration::from_secs(self.settings.rate), now);

        let mut ticker = tokio::time::interval(POLL_INTERVAL);
        ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);

        loop {
            tokio::select! {
                _ = cancel.cancelled() => return Ok(()),
                _ = ticker.tick() => self.poll(&mut tracker, &mut reporter).await?,
                Some(()) = actuations.recv() => {
                    if timer.arm(Instant::now()) {
                        info!("[Door] {} actuating", self.settings.topic);
                        hardware.write_line(act, Level::High).await?;
                    } else {
                        debug!("[Door] Received actuation while actuating");
                    }
                }
                _ = tokio::time::sleep_until(timer.release_at().unwrap_or_else(Instant::now)),
                    if timer.is_armed() =>
                {
                    hardware.write_line(act, Level::Low).await?;
                    timer.disarm();
                }
            }
        }
    }

    async fn poll(&self, tracker: &mut DoorTracker, reporter: &mut DoorReporter) -> Result<()> {
        let hardware = &self.devices.hardware;
        let top = hardware.read_line(self.settings.gpio.top).await?.is_high();
        let bottom = hardware.read_line(self.settings.gpio.bot).await?.is_high();

        let now = Instant::now();
        let state = tracker.update(top, bottom, now);
        let broker = &self.devices.broker;

        if let Some(state) = reporter.report(state, broker.is_connected(), now) {
            info!("[Door] {} {}", self.settings.topic, state);
            if let Err(e) = broker.publish(&self.settings.topic, state.to_string(), QoS::AtLeastOnce)
            {
                warn!("[Door] Failed to publish {}: {}", self.settings.topic, e);
            }
        }
        Ok(())
    }
}
