//! NATS client on top of `async-nats`.

use std::collections::HashMap;

use async_trait::async_trait;
use bytes::Bytes;
use futures_util::StreamExt;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;

use crate::client::{BrokerClient, BrokerEvent, BrokerLink, BrokerSession, ConnectOptions};
use crate::error::BrokerError;

/// Connects to `nats://` servers.
pub struct NatsClient;

#[async_trait]
impl BrokerClient for NatsClient {
    async fn connect(
        &self,
        url: &str,
        options: &ConnectOptions,
    ) -> Result<BrokerLink, BrokerError> {
        let (tx, rx) = mpsc::unbounded_channel();

        let callback_tx = tx.clone();
        let mut nats_options = async_nats::ConnectOptions::new()
            .name(&options.client_id)
            .event_callback(move |event| {
                let tx = callback_tx.clone();
                async move {
                    let forwarded = match event {
                        async_nats::Event::Disconnected => Some(BrokerEvent::Closed),
                        async_nats::Event::ServerError(e) => Some(BrokerEvent::Error(e.to_string())),
                        async_nats::Event::ClientError(e) => Some(BrokerEvent::Error(e.to_string())),
                        _ => None,
                    };
                    if let Some(event) = forwarded {
                        let _ = tx.send(event);
                    }
                }
            });
        if let (Some(user), Some(password)) = (&options.username, &options.password) {
            nats_options = nats_options.user_and_password(user.clone(), password.clone());
        }

        let client = nats_options
            .connect(url)
            .await
            .map_err(|e| BrokerError::ConnectFailed(e.to_string()))?;

        tracing::info!(url = %url, "established NATS connection");

        Ok(BrokerLink {
            session: Box::new(NatsSession {
                client,
                events: tx,
                forwarders: HashMap::new(),
            }),
            events: rx,
        })
    }
}

struct NatsSession {
    client: async_nats::Client,
    events: mpsc::UnboundedSender<BrokerEvent>,
    /// One forwarding task per subscribed subject.
    forwarders: HashMap<String, JoinHandle<()>>,
}

#[async_trait]
impl BrokerSession for NatsSession {
    async fn subscribe(&mut self, topic: &str) -> Result<(), BrokerError> {
        let mut subscriber = self
            .client
            .subscribe(topic.to_string())
            .await
            .map_err(|e| BrokerError::SubscribeFailed(e.to_string()))?;

        // A flush round-trip means the server has processed the SUB.
        self.client
            .flush()
            .await
            .map_err(|e| BrokerError::SubscribeFailed(e.to_string()))?;

        let events = self.events.clone();
        let forwarder = tokio::spawn(async move {
            while let Some(message) = subscriber.next().await {
                let event = BrokerEvent::Message {
                    topic: message.subject.to_string(),
                    payload: message.payload,
                };
                if events.send(event).is_err() {
                    break;
                }
            }
        });

        if let Some(previous) = self.forwarders.insert(topic.to_string(), forwarder) {
            previous.abort();
        }
        Ok(())
    }

    async fn unsubscribe(&mut self, topic: &str) -> Result<(), BrokerError> {
        // Dropping the subscriber inside the task sends UNSUB.
        if let Some(forwarder) = self.forwarders.remove(topic) {
            forwarder.abort();
        }
        Ok(())
    }

    async fn publish(&mut self, topic: &str, payload: Bytes) -> Result<(), BrokerError> {
        self.client
            .publish(topic.to_string(), payload)
            .await
            .map_err(|e| BrokerError::PublishFailed(e.to_string()))
    }

    async fn close(&mut self) {
        for (_, forwarder) in self.forwarders.drain() {
            forwarder.abort();
        }
        if let Err(e) = self.client.flush().await {
            tracing::debug!(error = %e, "NATS flush on close failed");
        }
    }
}

impl Drop for NatsSession {
    fn drop(&mut self) {
        for forwarder in self.forwarders.values() {
            forwarder.abort();
        }
    }
}
