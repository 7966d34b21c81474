//! The pub/sub capability a binding needs from a broker client.

use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use bytes::Bytes;
use tokio::sync::mpsc;

use crate::error::BrokerError;
use crate::memory::MemoryBroker;
use crate::mqtt::MqttClient;
use crate::nats::NatsClient;

/// Options passed to every connect attempt.
#[derive(Debug, Clone)]
pub struct ConnectOptions {
    pub client_id: String,
    pub keep_alive: Duration,
    pub username: Option<String>,
    pub password: Option<String>,
}

impl Default for ConnectOptions {
    fn default() -> Self {
        Self {
            client_id: "asyncbridge".to_string(),
            keep_alive: Duration::from_secs(30),
            username: None,
            password: None,
        }
    }
}

/// Asynchronous notifications from a live connection.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum BrokerEvent {
    Message { topic: String, payload: Bytes },
    /// The broker or transport reported a failure; the session is unusable.
    Error(String),
    /// The broker closed the connection.
    Closed,
}

/// A connected session plus its event stream.
pub struct BrokerLink {
    pub session: Box<dyn BrokerSession>,
    pub events: mpsc::UnboundedReceiver<BrokerEvent>,
}

/// Establishes sessions. Returns only once the broker handshake completed.
#[async_trait]
pub trait BrokerClient: Send + Sync {
    async fn connect(&self, url: &str, options: &ConnectOptions)
        -> Result<BrokerLink, BrokerError>;
}

/// Operations on an established session.
///
/// `subscribe` returns once the broker acknowledged the subscription.
#[async_trait]
pub trait BrokerSession: Send {
    async fn subscribe(&mut self, topic: &str) -> Result<(), BrokerError>;

    async fn unsubscribe(&mut self, topic: &str) -> Result<(), BrokerError>;

    async fn publish(&mut self, topic: &str, payload: Bytes) -> Result<(), BrokerError>;

    async fn close(&mut self);
}

/// Pick a client implementation from a server protocol name.
///
/// `memory` yields a fresh in-process loopback broker.
pub fn client_for_protocol(protocol: &str) -> Result<Arc<dyn BrokerClient>, BrokerError> {
    match protocol.to_ascii_lowercase().as_str() {
        "mqtt" | "tcp" => Ok(Arc::new(MqttClient)),
        "nats" => Ok(Arc::new(NatsClient)),
        "memory" => Ok(Arc::new(MemoryBroker::new())),
        other => Err(BrokerError::UnsupportedProtocol(other.to_string())),
    }
}

/// Split `scheme://host[:port]` into host and port.
pub(crate) fn split_host_port(url: &str, default_port: u16) -> Result<(String, u16), BrokerError> {
    let authority = url.split_once("://").map(|(_, rest)| rest).unwrap_or(url);
    let authority = authority.split('/').next().unwrap_or_default();
    if authority.is_empty() {
        return Err(BrokerError::InvalidUrl(url.to_string()));
    }

    match authority.rsplit_once(':') {
        Some((host, port)) if !host.is_empty() => {
            let port = port
                .parse::<u16>()
                .map_err(|_| BrokerError::InvalidUrl(url.to_string()))?;
            Ok((host.to_string(), port))
        }
        Some(_) => Err(BrokerError::InvalidUrl(url.to_string())),
        None => Ok((authority.to_string(), default_port)),
    }
}
