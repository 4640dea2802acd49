//! Connection to the MQTT broker.
//!
//! Workers never touch the MQTT client directly: they get an
//! `Arc<dyn MessageBroker>` and publish, subscribe and register callbacks
//! through it. The broker fans every accepted connect out to the registered
//! [`ConnectHandler`]s and routes incoming publishes to [`MessageHandler`]s
//! by exact topic.
//!
//! Callbacks run on the broker's network task. They must not block; the
//! usual body is a single non-blocking `subscribe`.

mod client;
mod registry;

pub use client::MqttBroker;
pub use registry::HandlerRegistry;

use async_trait::async_trait;
use rumqttc::QoS;
use std::sync::Arc;
use thiserror::Error;

use crate::instance_lock::LifecycleError;

#[derive(Debug, Error)]
pub enum BrokerError {
    #[error("MQTT client request failed: {0}")]
    Client(#[from] rumqttc::ClientError),

    #[error("cannot read TLS file '{path}': {source}")]
    Tls {
        path: String,
        source: std::io::Error,
    },

    #[error("invalid TLS material in '{path}': {reason}")]
    InvalidTls { path: String, reason: String },

    #[error("already connected")]
    AlreadyConnected,

    #[error(transparent)]
    Lifecycle(#[from] LifecycleError),
}

/// Metadata of an accepted connection.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ConnectInfo {
    pub session_present: bool,
}

/// An incoming publish.
#[derive(Debug, Clone)]
pub struct Message {
    pub topic: String,
    pub payload: Vec<u8>,
}

/// Invoked on every accepted (re)connect.
pub trait ConnectHandler: Send + Sync {
    fn on_connect(&self, broker: &dyn MessageBroker, info: &ConnectInfo);
}

/// Invoked for every publish received on a routed topic.
pub trait MessageHandler: Send + Sync {
    fn on_message(&self, message: &Message);
}

#[async_trait]
pub trait MessageBroker: Send + Sync {
    /// Start connecting in the background. Completion is observed through
    /// the registered [`ConnectHandler`]s.
    fn connect(self: Arc<Self>) -> Result<(), BrokerError>;

    /// Disconnect gracefully and stop the network task. Safe to call when
    /// not connected.
    async fn disconnect(&self);

    fn is_connected(&self) -> bool;

    /// Queue a publish without waiting for the network.
    fn publish(&self, topic: &str, payload: String, qos: QoS) -> Result<(), BrokerError>;

    /// Queue a subscribe without waiting for the network.
    fn subscribe(&self, topic: &str, qos: QoS) -> Result<(), BrokerError>;

    fn register_on_connect(&self, handler: Arc<dyn ConnectHandler>);

    fn unregister_on_connect(&self, handler: &Arc<dyn ConnectHandler>);

    fn add_route(&self, topic: &str, handler: Arc<dyn MessageHandler>);

    fn remove_route(&self, topic: &str, handler: &Arc<dyn MessageHandler>);
}

/// Broker callbacks owned by one worker.
///
/// Everything added through a `Registration` is removed again when it is
/// dropped, which happens when the owning worker task ends for any reason,
/// including a panic.
pub struct Registration {
    broker: Arc<dyn MessageBroker>,
    on_connect: Vec<Arc<dyn ConnectHandler>>,
    routes: Vec<(String, Arc<dyn MessageHandler>)>,
}

impl Registration {
    pub fn new(broker: Arc<dyn MessageBroker>) -> Self {
        Self {
            broker,
            on_connect: Vec::new(),
            routes: Vec::new(),
        }
    }

    pub fn on_connect(mut self, handler: Arc<dyn ConnectHandler>) -> Self {
        self.broker.register_on_connect(handler.clone());
        self.on_connect.push(handler);
        self
    }

    pub fn route(mut self, topic: impl Into<String>, handler: Arc<dyn MessageHandler>) -> Self {
        let topic = topic.into();
        self.broker.add_route(&topic, handler.clone());
        self.routes.push((topic, handler));
        self
    }
}

impl Drop for Registration {
    fn drop(&mut self) {
        for handler in &self.on_connect {
            self.broker.unregister_on_connect(handler);
        }
        for (topic, handler) in &self.routes {
            self.broker.remove_route(topic, handler);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::testing::FakeBroker;

    struct Noop;

    impl ConnectHandler for Noop {
        fn on_connect(&self, _broker: &dyn MessageBroker, _info: &ConnectInfo) {}
    }

    impl MessageHandler for Noop {
        fn on_message(&self, _message: &Message) {}
    }

    #[test]
    fn test_registration_unregisters_on_drop() {
        let broker = Arc::new(FakeBroker::new());
        let handler = Arc::new(Noop);

        let registration = Registration::new(broker.clone())
            .on_connect(handler.clone())
            .route("door/actuate", handler.clone());
        assert_eq!(broker.on_connect_count(), 1);
        assert_eq!(broker.route_count(), 1);

        drop(registration);
        assert_eq!(broker.on_connect_count(), 0);
        assert_eq!(broker.route_count(), 0);
    }
}
