//! MQTT 3.1.1 client on top of `rumqttc`.
//!
//! The event loop is polled by a background task that forwards publishes and
//! completes pending subscribe acknowledgements. `rumqttc` reconnects by
//! itself when polled after an error; the task stops instead and lets the
//! connection manager own the retry policy.

use std::collections::VecDeque;
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use bytes::Bytes;
use parking_lot::Mutex;
use rumqttc::{
    AsyncClient, ConnectReturnCode, Event, EventLoop, MqttOptions, Outgoing, Packet, QoS,
    SubscribeReasonCode,
};
use tokio::sync::{mpsc, oneshot};
use tokio::task::JoinHandle;

use crate::client::{
    split_host_port, BrokerClient, BrokerEvent, BrokerLink, BrokerSession, ConnectOptions,
};
use crate::error::BrokerError;

const DEFAULT_PORT: u16 = 1883;
const REQUEST_CAPACITY: usize = 16;
const MIN_KEEP_ALIVE: Duration = Duration::from_secs(5);
const DISCONNECT_GRACE: Duration = Duration::from_millis(500);

/// Subscribers waiting for their SUBACK, in request order.
type PendingAcks = Arc<Mutex<VecDeque<oneshot::Sender<Result<(), String>>>>>;

/// Connects to `mqtt://` and `tcp://` servers.
pub struct MqttClient;

#[async_trait]
impl BrokerClient for MqttClient {
    async fn connect(
        &self,
        url: &str,
        options: &ConnectOptions,
    ) -> Result<BrokerLink, BrokerError> {
        let (host, port) = split_host_port(url, DEFAULT_PORT)?;

        let mut mqtt_options = MqttOptions::new(options.client_id.clone(), host, port);
        mqtt_options
            .set_keep_alive(options.keep_alive.max(MIN_KEEP_ALIVE))
            .set_clean_session(true);
        if let (Some(user), Some(password)) = (&options.username, &options.password) {
            mqtt_options.set_credentials(user.clone(), password.clone());
        }

        let (client, mut eventloop) = AsyncClient::new(mqtt_options, REQUEST_CAPACITY);
        wait_for_connack(&mut eventloop).await?;
        tracing::info!(url = %url, "established MQTT connection");

        let (tx, rx) = mpsc::unbounded_channel();
        let pending: PendingAcks = Arc::new(Mutex::new(VecDeque::new()));
        let poller = tokio::spawn(poll_loop(eventloop, tx, Arc::clone(&pending)));

        Ok(BrokerLink {
            session: Box::new(MqttSession {
                client,
                pending,
                poller,
            }),
            events: rx,
        })
    }
}

async fn wait_for_connack(eventloop: &mut EventLoop) -> Result<(), BrokerError> {
    loop {
        match eventloop.poll().await {
            Ok(Event::Incoming(Packet::ConnAck(ack))) => {
                return if ack.code == ConnectReturnCode::Success {
                    Ok(())
                } else {
                    Err(BrokerError::ConnectFailed(format!(
                        "broker refused connection: {:?}",
                        ack.code
                    )))
                };
            }
            Ok(_) => continue,
            Err(e) => return Err(BrokerError::ConnectFailed(e.to_string())),
        }
    }
}

async fn poll_loop(
    mut eventloop: EventLoop,
    events: mpsc::UnboundedSender<BrokerEvent>,
    pending: PendingAcks,
) {
    loop {
        match eventloop.poll().await {
            Ok(Event::Incoming(Packet::Publish(publish))) => {
                let event = BrokerEvent::Message {
                    topic: publish.topic,
                    payload: publish.payload,
                };
                if events.send(event).is_err() {
                    return;
                }
            }
            Ok(Event::Incoming(Packet::SubAck(ack))) => {
                let result = if ack
                    .return_codes
                    .iter()
                    .any(|code| matches!(code, SubscribeReasonCode::Failure))
                {
                    Err("broker rejected subscription".to_string())
                } else {
                    Ok(())
                };
                if let Some(waiter) = pending.lock().pop_front() {
                    let _ = waiter.send(result);
                }
            }
            Ok(Event::Incoming(Packet::Disconnect)) => {
                let _ = events.send(BrokerEvent::Closed);
                return;
            }
            // Our own disconnect; the session is closing.
            Ok(Event::Outgoing(Outgoing::Disconnect)) => return,
            Ok(_) => {}
            Err(e) => {
                tracing::debug!(error = %e, "MQTT event loop stopped");
                let _ = events.send(BrokerEvent::Error(e.to_string()));
                return;
            }
        }
    }
}

struct MqttSession {
    client: AsyncClient,
    pending: PendingAcks,
    poller: JoinHandle<()>,
}

#[async_trait]
impl BrokerSession for MqttSession {
    async fn subscribe(&mut self, topic: &str) -> Result<(), BrokerError> {
        let (ack_tx, ack_rx) = oneshot::channel();
        self.pending.lock().push_back(ack_tx);

        if let Err(e) = self.client.subscribe(topic, QoS::AtLeastOnce).await {
            self.pending.lock().pop_back();
            return Err(BrokerError::SubscribeFailed(e.to_string()));
        }

        match ack_rx.await {
            Ok(Ok(())) => Ok(()),
            Ok(Err(reason)) => Err(BrokerError::SubscribeFailed(reason)),
            Err(_) => Err(BrokerError::Closed),
        }
    }

    async fn unsubscribe(&mut self, topic: &str) -> Result<(), BrokerError> {
        self.client
            .unsubscribe(topic)
            .await
            .map_err(|e| BrokerError::SubscribeFailed(e.to_string()))
    }

    async fn publish(&mut self, topic: &str, payload: Bytes) -> Result<(), BrokerError> {
        self.client
            .publish(topic, QoS::AtLeastOnce, false, payload.to_vec())
            .await
            .map_err(|e| BrokerError::PublishFailed(e.to_string()))
    }

    async fn close(&mut self) {
        if self.client.disconnect().await.is_ok() {
            let _ = tokio::time::timeout(DISCONNECT_GRACE, &mut self.poller).await;
        }
        self.poller.abort();
    }
}

impl Drop for MqttSession {
    fn drop(&mut self) {
        self.poller.abort();
    }
}
