//! Bridges application payloads and broker messages for one binding.

use std::sync::Arc;

use bytes::Bytes;
use serde::Serialize;
use serde_json::Value;
use tokio::sync::{broadcast, mpsc, watch};

use asyncbridge_spec::{Action, Binding, PayloadSchema};
use asyncbridge_telemetry::{log_dispatch_error, log_message_forwarded, log_validation_failure};
use asyncbridge_validator::validate;

use crate::client::{client_for_protocol, BrokerClient};
use crate::codec;
use crate::connection::{ConnectionManager, ConnectionSettings, InboundHandler, SubscribeOutcome};
use crate::error::{BrokerError, DispatchError};
use crate::status::{StateChange, Status, StatusReporter};

/// One received and validated broker message.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct OutputMessage {
    pub payload: Value,
    pub topic: String,
}

/// Where received messages go. Called once per message, in delivery order.
pub trait OutputSink: Send + 'static {
    fn emit(&mut self, message: OutputMessage);
}

impl OutputSink for mpsc::UnboundedSender<OutputMessage> {
    fn emit(&mut self, message: OutputMessage) {
        if self.send(message).is_err() {
            tracing::debug!("output sink dropped, discarding message");
        }
    }
}

/// Decodes, validates and forwards inbound messages on the connection actor.
struct InboundRoute<S> {
    content_type: Option<String>,
    schema: PayloadSchema,
    status: StatusReporter,
    sink: S,
}

impl<S: OutputSink> InboundHandler for InboundRoute<S> {
    fn on_message(&mut self, topic: String, payload: Bytes) {
        let decoded = codec::decode(self.content_type.as_deref(), &payload);
        self.status.record_received(decoded.fallback);
        if decoded.fallback {
            let content_type = self.content_type.as_deref().unwrap_or("application/json");
            tracing::warn!(
                topic = %topic,
                content_type = %content_type,
                "payload did not decode, forwarding as text"
            );
            self.status.record_error(format!(
                "message on '{}' is not valid {}; forwarded as text",
                topic, content_type
            ));
        }

        if let Err(e) = validate(&decoded.value, &self.schema) {
            log_validation_failure!(topic = %topic, error = %e, "dropping inbound message");
            self.status
                .record_error(format!("inbound message on '{}' dropped: {}", topic, e));
            return;
        }

        log_message_forwarded!(topic = %topic);
        self.sink.emit(OutputMessage {
            payload: decoded.value,
            topic,
        });
    }
}

/// The runtime side of a [`Binding`]: one connection plus dispatch rules.
pub struct Dispatcher {
    binding: Binding,
    connection: ConnectionManager,
}

impl Dispatcher {
    /// Build a dispatcher over an explicit broker client. Starts `Idle`.
    pub fn new(
        binding: Binding,
        client: Arc<dyn BrokerClient>,
        settings: ConnectionSettings,
        sink: impl OutputSink,
    ) -> Self {
        let status = StatusReporter::new(binding.operation_id.as_str());
        let route = InboundRoute {
            content_type: binding.content_type.clone(),
            schema: binding.payload_schema.clone(),
            status: status.clone(),
            sink,
        };
        let connection = ConnectionManager::spawn(
            client,
            binding.server_url.clone(),
            binding.topic.clone(),
            settings,
            status,
            route,
        );
        Self {
            binding,
            connection,
        }
    }

    /// Build a dispatcher with the client matching the binding's protocol.
    pub fn for_binding(
        binding: Binding,
        settings: ConnectionSettings,
        sink: impl OutputSink,
    ) -> Result<Self, BrokerError> {
        let client = client_for_protocol(&binding.protocol)?;
        Ok(Self::new(binding, client, settings, sink))
    }

    pub fn binding(&self) -> &Binding {
        &self.binding
    }

    pub async fn connect(&self) -> Result<(), DispatchError> {
        self.connection.connect().await
    }

    /// Idempotent: at most one subscribe request is ever outstanding.
    pub async fn ensure_subscribed(&self) -> Result<SubscribeOutcome, DispatchError> {
        self.connection
            .ensure_subscribed()
            .await
            .inspect_err(|e| self.record_failure(e))
    }

    /// Validate, encode and publish `payload` on a `send` binding.
    pub async fn publish(&self, payload: &Value) -> Result<(), DispatchError> {
        self.try_publish(payload)
            .await
            .inspect_err(|e| self.record_failure(e))
    }

    async fn try_publish(&self, payload: &Value) -> Result<(), DispatchError> {
        if self.binding.action != Action::Send {
            return Err(DispatchError::WrongAction {
                operation: self.binding.operation_id.clone(),
                action: self.binding.action,
            });
        }

        if let Err(e) = validate(payload, &self.binding.payload_schema) {
            log_validation_failure!(topic = %self.binding.topic, error = %e, "rejecting outbound payload");
            return Err(e.into());
        }

        let bytes = codec::encode(self.binding.content_type.as_deref(), payload)?;
        self.connection.publish(bytes).await
    }

    /// Host entry point for an application payload.
    ///
    /// `receive` bindings only ensure the subscription. `send` bindings
    /// ensure it first when `subscribe_before_publish` is set, then publish.
    pub async fn handle_input(&self, payload: &Value) -> Result<(), DispatchError> {
        match self.binding.action {
            Action::Receive => {
                self.connect().await?;
                self.ensure_subscribed().await.map(|_| ())
            }
            Action::Send => {
                if self.binding.subscribe_before_publish {
                    self.ensure_subscribed().await?;
                }
                self.publish(payload).await
            }
        }
    }

    pub fn status(&self) -> Status {
        self.connection.status().snapshot()
    }

    pub fn watch_status(&self) -> watch::Receiver<Status> {
        self.connection.status().watch()
    }

    pub fn transitions(&self) -> broadcast::Receiver<StateChange> {
        self.connection.status().transitions()
    }

    /// Tear the binding down. Safe to call more than once.
    pub async fn teardown(&self) {
        self.connection.teardown().await;
    }

    fn record_failure(&self, error: &DispatchError) {
        match error {
            // Already recorded by the connection actor.
            DispatchError::SubscribeFailed(_) | DispatchError::PublishFailed(_) => {}
            DispatchError::Closed => {}
            other => {
                log_dispatch_error!(
                    operation = %self.binding.operation_id,
                    topic = %self.binding.topic,
                    error = %other
                );
                self.connection.status().record_error(other.to_string());
            }
        }
    }
}
