//! rumqttc-backed broker connection.

use super::{
    BrokerError, ConnectHandler, ConnectInfo, HandlerRegistry, Message, MessageBroker,
    MessageHandler,
};
use crate::config::{MqttConfig, TlsConfig};
use crate::instance_lock::{BROKER_SLOT, InstanceLock, InstanceSlot};
use async_trait::async_trait;
use log::{debug, error, info, warn};
use parking_lot::Mutex;
use rumqttc::tokio_rustls::rustls::{self, ClientConfig, RootCertStore};
use rumqttc::{
    AsyncClient, ConnAck, ConnectReturnCode, Event, EventLoop, MqttOptions, Outgoing, Packet,
    Publish, QoS, TlsConfiguration, Transport,
};
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use std::time::Duration;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;

/// Delay before polling again after a connection error (which reconnects).
const RECONNECT_DELAY: Duration = Duration::from_secs(5);

/// How long `disconnect` waits for the DISCONNECT packet to go out.
const DISCONNECT_TIMEOUT: Duration = Duration::from_secs(2);

struct NetworkTask {
    cancel: CancellationToken,
    handle: JoinHandle<EventLoop>,
}

/// The process's single MQTT connection.
pub struct MqttBroker {
    client: AsyncClient,
    host: String,
    port: u16,
    /// Parked here while the network task is not running.
    event_loop: Mutex<Option<EventLoop>>,
    network: Mutex<Option<NetworkTask>>,
    connected: AtomicBool,
    on_connect: HandlerRegistry<(), dyn ConnectHandler>,
    routes: HandlerRegistry<String, dyn MessageHandler>,
    _instance: InstanceLock,
}

impl MqttBroker {
    /// Create the broker connection. Fails if one already exists.
    pub fn new(config: &MqttConfig) -> Result<Self, BrokerError> {
        Self::with_slot(config, &BROKER_SLOT)
    }

    fn with_slot(config: &MqttConfig, slot: &'static InstanceSlot) -> Result<Self, BrokerError> {
        let instance = slot.acquire()?;

        let client_id = config
            .clientid
            .clone()
            .filter(|id| !id.trim().is_empty())
            .unwrap_or_else(|| {
                let id = uuid::Uuid::new_v4().simple().to_string();
                format!("garage-{}", &id[..12])
            });

        let mut options = MqttOptions::new(&client_id, &config.host, config.port);
        options.set_keep_alive(Duration::from_secs(30));

        if let Some(tls) = &config.tls
            && let Some(ca) = &tls.ca
        {
            let tls_config = tls_client_config(tls, ca)?;
            options.set_transport(Transport::Tls(TlsConfiguration::Rustls(Arc::new(
                tls_config,
            ))));
        }

        let (client, event_loop) = AsyncClient::new(options, 100);

        Ok(Self {
            client,
            host: config.host.clone(),
            port: config.port,
            event_loop: Mutex::new(Some(event_loop)),
            network: Mutex::new(None),
            connected: AtomicBool::new(false),
            on_connect: HandlerRegistry::new("on-connect callbacks"),
            routes: HandlerRegistry::new("message routes"),
            _instance: instance,
        })
    }

    /// Drive the event loop until cancelled or a graceful disconnect went out.
    async fn run_network(
        self: Arc<Self>,
        mut event_loop: EventLoop,
        cancel: CancellationToken,
    ) -> EventLoop {
        info!("[MQTT] Starting network loop");

        loop {
            let event = tokio::select! {
                _ = cancel.cancelled() => break,
                event = event_loop.poll() => event,
            };

            match event {
                Ok(Event::Incoming(Packet::ConnAck(ack))) => self.handle_connack(&ack),
                Ok(Event::Incoming(Packet::Publish(publish))) => self.dispatch(&publish),
                Ok(Event::Incoming(Packet::Disconnect)) => {
                    warn!("[MQTT] Broker closed the connection");
                    self.connected.store(false, Ordering::SeqCst);
                }
                Ok(Event::Outgoing(Outgoing::Disconnect)) => {
                    info!("[MQTT] Disconnected");
                    self.connected.store(false, Ordering::SeqCst);
                    break;
                }
                Ok(_) => {}
                Err(e) => {
                    if self.connected.swap(false, Ordering::SeqCst) {
                        error!("[MQTT] Connection lost: {:?}", e);
                    } else {
                        warn!("[MQTT] Connection error: {:?}", e);
                    }
                    tokio::select! {
                        _ = cancel.cancelled() => break,
                        _ = tokio::time::sleep(RECONNECT_DELAY) => {}
                    }
                }
            }
        }

        self.connected.store(false, Ordering::SeqCst);
        event_loop
    }

    fn handle_connack(&self, ack: &ConnAck) {
        if ack.code != ConnectReturnCode::Success {
            warn!("[MQTT] Connection refused: {:?}", ack.code);
            return;
        }

        info!("[MQTT] Connected to {}:{}", self.host, self.port);
        self.connected.store(true, Ordering::SeqCst);

        let info = ConnectInfo {
            session_present: ack.session_present,
        };
        for handler in self.on_connect.snapshot(&()) {
            handler.on_connect(self, &info);
        }
    }

    fn dispatch(&self, publish: &Publish) {
        let handlers = self.routes.snapshot(&publish.topic);
        if handlers.is_empty() {
            debug!("[MQTT] No route for {}", publish.topic);
            return;
        }

        let message = Message {
            topic: publish.topic.clone(),
            payload: publish.payload.to_vec(),
        };
        for handler in handlers {
            handler.on_message(&message);
        }
    }
}

#[async_trait]
impl MessageBroker for MqttBroker {
    fn connect(self: Arc<Self>) -> Result<(), BrokerError> {
        let event_loop = self.event_loop.lock().take();
        let Some(event_loop) = event_loop else {
            return Err(BrokerError::AlreadyConnected);
        };

        info!("[MQTT] Connecting to {} port {}", self.host, self.port);

        let cancel = CancellationToken::new();
        let handle = tokio::spawn(self.clone().run_network(event_loop, cancel.clone()));
        *self.network.lock() = Some(NetworkTask { cancel, handle });
        Ok(())
    }

    async fn disconnect(&self) {
        info!("[MQTT] Disconnect");

        let network = self.network.lock().take();
        let Some(mut network) = network else {
            debug!("[MQTT] Network loop not running");
            return;
        };

        if let Err(e) = self.client.try_disconnect() {
            debug!("[MQTT] Could not queue disconnect: {}", e);
        }

        let finished = match tokio::time::timeout(DISCONNECT_TIMEOUT, &mut network.handle).await {
            Ok(finished) => finished,
            Err(_) => {
                debug!("[MQTT] Disconnect not acknowledged, stopping network loop");
                network.cancel.cancel();
                network.handle.await
            }
        };

        match finished {
            Ok(event_loop) => *self.event_loop.lock() = Some(event_loop),
            Err(e) => error!("[MQTT] Network loop failed: {}", e),
        }
        self.connected.store(false, Ordering::SeqCst);
    }

    fn is_connected(&self) -> bool {
        self.connected.load(Ordering::SeqCst)
    }

    fn publish(&self, topic: &str, payload: String, qos: QoS) -> Result<(), BrokerError> {
        debug!("[MQTT] Publishing to {}: {}", topic, payload);
        self.client
            .try_publish(topic, qos, false, payload.into_bytes())
            .map_err(BrokerError::from)
    }

    fn subscribe(&self, topic: &str, qos: QoS) -> Result<(), BrokerError> {
        info!("[MQTT] Subscribing to {}", topic);
        self.client
            .try_subscribe(topic, qos)
            .map_err(BrokerError::from)
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

fn read_tls_file(path: &str) -> Result<Vec<u8>, BrokerError> {
    std::fs::read(path).map_err(|source| BrokerError::Tls {
        path: path.to_string(),
        source,
    })
}

fn invalid_tls(path: &str, reason: impl ToString) -> BrokerError {
    BrokerError::InvalidTls {
        path: path.to_string(),
        reason: reason.to_string(),
    }
}

fn read_certificates(
    path: &str,
) -> Result<Vec<rustls::pki_types::CertificateDer<'static>>, BrokerError> {
    let pem = read_tls_file(path)?;
    let certs = rustls_pemfile::certs(&mut pem.as_slice())
        .collect::<Result<Vec<_>, _>>()
        .map_err(|e| invalid_tls(path, e))?;
    if certs.is_empty() {
        return Err(invalid_tls(path, "no certificates found"));
    }
    Ok(certs)
}

/// Build the client TLS setup, restricted to TLS 1.2.
fn tls_client_config(tls: &TlsConfig, ca: &str) -> Result<ClientConfig, BrokerError> {
    let mut roots = RootCertStore::empty();
    for cert in read_certificates(ca)? {
        roots.add(cert).map_err(|e| invalid_tls(ca, e))?;
    }

    let builder = ClientConfig::builder_with_protocol_versions(&[&rustls::version::TLS12])
        .with_root_certificates(roots);

    match (&tls.client_ca, &tls.client_key) {
        (Some(cert), Some(key)) => {
            let chain = read_certificates(cert)?;
            let pem = read_tls_file(key)?;
            let private_key = rustls_pemfile::private_key(&mut pem.as_slice())
                .map_err(|e| invalid_tls(key, e))?
                .ok_or_else(|| invalid_tls(key, "no private key found"))?;
            builder
                .with_client_auth_cert(chain, private_key)
                .map_err(|e| invalid_tls(key, e))
        }
        (None, None) => Ok(builder.with_no_client_auth()),
        _ => {
            warn!("[MQTT] client_ca and client_key must be set together, ignoring them");
            Ok(builder.with_no_client_auth())
        }
    }
}
