//! Host adapter: the lifecycle a host runtime drives for one binding.
//!
//! The host owns the lifecycle and calls in: [`BridgeNode::start`] when the
//! node is deployed, [`BridgeNode::handle_input`] for each application
//! message and [`BridgeNode::close`] when the node is removed.

use std::time::Duration;

use asyncbridge_broker::{
    ConnectionSettings, ConnectionState, Dispatcher, Indicator, OutputSink, StateChange, Status,
};
use asyncbridge_spec::{resolve_selection, Binding, Document, Selection};
use asyncbridge_telemetry::log_binding_resolved;
use serde_json::Value;
use tokio::sync::broadcast;

use crate::config::BridgeConfig;
use crate::error::BridgeError;
use crate::source::load_document;

pub struct BridgeNode {
    dispatcher: Dispatcher,
}

impl BridgeNode {
    /// Resolve `selection` against `document` and build an idle node.
    pub fn new(
        document: &Document,
        selection: &Selection,
        settings: ConnectionSettings,
        sink: impl OutputSink,
    ) -> Result<Self, BridgeError> {
        let binding = resolve_selection(document, selection)?;
        log_binding_resolved!(
            server_url = %binding.server_url,
            topic = %binding.topic,
            operation = %binding.operation_id,
            action = %binding.action
        );
        let dispatcher = Dispatcher::for_binding(binding, settings, sink)?;
        Ok(Self { dispatcher })
    }

    /// Load the configured document and build an idle node.
    pub fn from_config(config: &BridgeConfig, sink: impl OutputSink) -> Result<Self, BridgeError> {
        let (_, document) = load_document(&config.document.path)?;
        Self::new(
            &document,
            &config.selection,
            config.connection.settings(),
            sink,
        )
    }

    pub fn binding(&self) -> &Binding {
        self.dispatcher.binding()
    }

    /// Whether this node keeps a subscription open.
    pub fn listens(&self) -> bool {
        let binding = self.binding();
        binding.is_receive() || binding.subscribe_before_publish
    }

    /// Start connecting and register the subscription if the node listens.
    pub async fn start(&self) -> Result<(), BridgeError> {
        self.dispatcher.connect().await?;
        if self.listens() {
            self.dispatcher.ensure_subscribed().await?;
        }
        Ok(())
    }

    /// Wait until the connection is up. Returns false after `timeout`, or if
    /// the node was closed first.
    pub async fn wait_connected(&self, timeout: Duration) -> bool {
        let mut status = self.dispatcher.watch_status();
        let settled = async {
            status
                .wait_for(|s| {
                    matches!(s.state, ConnectionState::Connected | ConnectionState::Closed)
                })
                .await
                .map(|s| s.state == ConnectionState::Connected)
        };
        let connected = matches!(tokio::time::timeout(timeout, settled).await, Ok(Ok(true)));
        connected
    }

    pub async fn handle_input(&self, payload: &Value) -> Result<(), BridgeError> {
        self.dispatcher.handle_input(payload).await?;
        Ok(())
    }

    pub fn status(&self) -> Status {
        self.dispatcher.status()
    }

    pub fn indicator(&self) -> Indicator {
        self.dispatcher.status().indicator()
    }

    pub fn transitions(&self) -> broadcast::Receiver<StateChange> {
        self.dispatcher.transitions()
    }

    /// Tear the binding down. Safe to call more than once.
    pub async fn close(&self) {
        self.dispatcher.teardown().await;
    }
}
