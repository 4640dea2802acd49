//! In-memory collaborators for unit tests.

use crate::broker::{
    BrokerError, ConnectHandler, ConnectInfo, HandlerRegistry, Message, MessageBroker,
    MessageHandler,
};
use crate::hardware::{
    BusHandle, HardwareAccess, HardwareError, Level, LineMode, ThermometerBus, ThermometerError,
};
use async_trait::async_trait;
use parking_lot::Mutex;
use rumqttc::QoS;
use std::collections::{HashMap, VecDeque};
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::time::Duration;

#[derive(Default)]
pub struct FakeHardware {
    inputs: Mutex<HashMap<u32, Level>>,
    writes: Mutex<Vec<(u32, Level)>>,
    modes: Mutex<Vec<(u32, LineMode)>>,
    frames: Mutex<VecDeque<Vec<u8>>>,
    idle_frame: Mutex<Vec<u8>>,
    bus_reads: AtomicUsize,
    completed_reads: AtomicUsize,
    read_delay: Mutex<Duration>,
    opened: AtomicUsize,
    closed: AtomicUsize,
    failing_line_reads: AtomicUsize,
}

impl FakeHardware {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn set_input(&self, line: u32, level: Level) {
        self.inputs.lock().insert(line, level);
    }

    /// Queue frames returned by successive bus reads.
    pub fn push_frames(&self, frames: impl IntoIterator<Item = Vec<u8>>) {
        self.frames.lock().extend(frames);
    }

    /// Frame returned once the queue is empty (default: nothing).
    pub fn set_idle_frame(&self, frame: Vec<u8>) {
        *self.idle_frame.lock() = frame;
    }

    /// Make every bus read take `delay` before answering.
    pub fn set_read_delay(&self, delay: Duration) {
        *self.read_delay.lock() = delay;
    }

    /// Make the next `count` line reads fail.
    pub fn fail_line_reads(&self, count: usize) {
        self.failing_line_reads.store(count, Ordering::SeqCst);
    }

    pub fn writes_to(&self, line: u32) -> Vec<Level> {
        self.writes
            .lock()
            .iter()
            .filter(|(l, _)| *l == line)
            .map(|(_, level)| *level)
            .collect()
    }

    pub fn mode_changes(&self) -> usize {
        self.modes.lock().len()
    }

    pub fn bus_reads(&self) -> usize {
        self.bus_reads.load(Ordering::SeqCst)
    }

    /// Bus reads that ran to completion.
    pub fn completed_reads(&self) -> usize {
        self.completed_reads.load(Ordering::SeqCst)
    }

    pub fn opened(&self) -> usize {
        self.opened.load(Ordering::SeqCst)
    }

    pub fn closed(&self) -> usize {
        self.closed.load(Ordering::SeqCst)
    }
}

#[async_trait]
impl HardwareAccess for FakeHardware {
    async fn set_line_mode(&self, line: u32, mode: LineMode) -> Result<(), HardwareError> {
        self.modes.lock().push((line, mode));
        Ok(())
    }

    async fn write_line(&self, line: u32, level: Level) -> Result<(), HardwareError> {
        self.writes.lock().push((line, level));
        Ok(())
    }

    async fn read_line(&self, line: u32) -> Result<Level, HardwareError> {
        let failing = self.failing_line_reads.load(Ordering::SeqCst);
        if failing > 0 {
            self.failing_line_reads.store(failing - 1, Ordering::SeqCst);
            return Err(HardwareError::Io(std::io::Error::other("injected failure")));
        }
        Ok(self
            .inputs
            .lock()
            .get(&line)
            .copied()
            .unwrap_or(Level::Low))
    }

    async fn open_bus_device(&self, _bus: u32, _addr: u32) -> Result<BusHandle, HardwareError> {
        let handle = self.opened.fetch_add(1, Ordering::SeqCst);
        Ok(BusHandle(handle as u32))
    }

    async fn read_bus_block(
        &self,
        _handle: BusHandle,
        count: usize,
    ) -> Result<Vec<u8>, HardwareError> {
        self.bus_reads.fetch_add(1, Ordering::SeqCst);
        let delay = *self.read_delay.lock();
        if !delay.is_zero() {
            tokio::time::sleep(delay).await;
        }
        self.completed_reads.fetch_add(1, Ordering::SeqCst);
        let mut frame = self
            .frames
            .lock()
            .pop_front()
            .unwrap_or_else(|| self.idle_frame.lock().clone());
        frame.truncate(count);
        Ok(frame)
    }

    async fn close_bus_device(&self, _handle: BusHandle) -> Result<(), HardwareError> {
        self.closed.fetch_add(1, Ordering::SeqCst);
        Ok(())
    }
}

pub struct FakeBroker {
    connected: AtomicBool,
    published: Mutex<Vec<(String, String, QoS)>>,
    subscribed: Mutex<Vec<(String, QoS)>>,
    on_connect: HandlerRegistry<(), dyn ConnectHandler>,
    routes: HandlerRegistry<String, dyn MessageHandler>,
    connects: AtomicUsize,
    disconnects: AtomicUsize,
    handlers_at_disconnect: Mutex<Option<usize>>,
}

impl FakeBroker {
    pub fn new() -> Self {
        Self {
            connected: AtomicBool::new(false),
            published: Mutex::new(Vec::new()),
            subscribed: Mutex::new(Vec::new()),
            on_connect: HandlerRegistry::new("on-connect callbacks"),
            routes: HandlerRegistry::new("message routes"),
            connects: AtomicUsize::new(0),
            disconnects: AtomicUsize::new(0),
            handlers_at_disconnect: Mutex::new(None),
        }
    }

    pub fn set_connected(&self, connected: bool) {
        self.connected.store(connected, Ordering::SeqCst);
    }

    /// Simulate an accepted CONNACK.
    pub fn fire_connect(&self) {
        self.set_connected(true);
        let info = ConnectInfo {
            session_present: false,
        };
        for handler in self.on_connect.snapshot(&()) {
            handler.on_connect(self, &info);
        }
    }

    /// Simulate an incoming publish.
    pub fn deliver(&self, topic: &str, payload: &[u8]) {
        let message = Message {
            topic: topic.to_string(),
            payload: payload.to_vec(),
        };
        for handler in self.routes.snapshot(&topic.to_string()) {
            handler.on_message(&message);
        }
    }

    pub fn published_on(&self, topic: &str) -> Vec<(String, QoS)> {
        self.published
            .lock()
            .iter()
            .filter(|(t, _, _)| t == topic)
            .map(|(_, payload, qos)| (payload.clone(), *qos))
            .collect()
    }

    pub fn subscriptions(&self) -> Vec<(String, QoS)> {
        self.subscribed.lock().clone()
    }

    pub fn on_connect_count(&self) -> usize {
        self.on_connect.len()
    }

    pub fn route_count(&self) -> usize {
        self.routes.len()
    }

    pub fn connects(&self) -> usize {
        self.connects.load(Ordering::SeqCst)
    }

    pub fn disconnects(&self) -> usize {
        self.disconnects.load(Ordering::SeqCst)
    }

    /// Number of registered callbacks when `disconnect` was last called.
    pub fn handlers_at_disconnect(&self) -> Option<usize> {
        *self.handlers_at_disconnect.lock()
    }
}

#[async_trait]
impl MessageBroker for FakeBroker {
    fn connect(self: Arc<Self>) -> Result<(), BrokerError> {
        self.connects.fetch_add(1, Ordering::SeqCst);
        Ok(())
    }

    async fn disconnect(&self) {
        self.disconnects.fetch_add(1, Ordering::SeqCst);
        *self.handlers_at_disconnect.lock() = Some(self.on_connect.len() + self.routes.len());
        self.set_connected(false);
    }

    fn is_connected(&self) -> bool {
        self.connected.load(Ordering::SeqCst)
    }

    fn publish(&self, topic: &str, payload: String, qos: QoS) -> Result<(), BrokerError> {
        self.published.lock().push((topic.to_string(), payload, qos));
        Ok(())
    }

    fn subscribe(&self, topic: &str, qos: QoS) -> Result<(), BrokerError> {
        self.subscribed.lock().push((topic.to_string(), qos));
        Ok(())
    }

    fn register_on_connect(&self, handler: Arc<dyn ConnectHandler>) {
        self.on_connect.register((), handler);
    }

    fn unregister_on_connect(&self, handler: &Arc<dyn ConnectHandler>) {
        self.on_connect.unregister(&(), handler);
    }

    fn add_route(&self, topic: &str, handler: Arc<dyn MessageHandler>) {
        self.routes.register(topic.to_string(), handler);
    }

    fn remove_route(&self, topic: &str, handler: &Arc<dyn MessageHandler>) {
        self.routes.unregister(&topic.to_string(), handler);
    }
}

pub struct FakeThermometers {
    ids: Vec<String>,
    celsius: Mutex<f64>,
    hidden_listings: AtomicUsize,
}

impl FakeThermometers {
    pub fn new(ids: &[&str], celsius: f64) -> Self {
        Self {
            ids: ids.iter().map(|id| id.to_string()).collect(),
            celsius: Mutex::new(celsius),
            hidden_listings: AtomicUsize::new(0),
        }
    }

    /// Report an empty bus for the next `count` listings.
    pub fn hide_for(&self, count: usize) {
        self.hidden_listings.store(count, Ordering::SeqCst);
    }
}

#[async_trait]
impl ThermometerBus for FakeThermometers {
    async fn sensor_ids(&self) -> Result<Vec<String>, ThermometerError> {
        let hidden = self.hidden_listings.load(Ordering::SeqCst);
        if hidden > 0 {
            self.hidden_listings.store(hidden - 1, Ordering::SeqCst);
            return Ok(Vec::new());
        }
        Ok(self.ids.clone())
    }

    async fn read_celsius(&self, id: &str) -> Result<f64, ThermometerError> {
        if !self.ids.iter().any(|known| known == id) {
            return Err(ThermometerError::NotFound(id.to_string()));
        }
        Ok(*self.celsius.lock())
    }
}
