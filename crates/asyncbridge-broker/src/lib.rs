//! Broker runtime for AsyncAPI bindings.
//!
//! Turns a resolved [`Binding`](asyncbridge_spec::Binding) into a live client:
//! - [`client`]: the pub/sub capability, with MQTT, NATS and in-memory implementations
//! - [`connection`]: the per-binding connect/reconnect state machine
//! - [`dispatcher`]: validated publish, idempotent subscribe, ordered inbound delivery
//! - [`status`]: observable connection state

pub mod client;
pub mod codec;
pub mod connection;
pub mod dispatcher;
pub mod error;
pub mod memory;
pub mod mqtt;
pub mod nats;
pub mod status;

pub use client::{
    client_for_protocol, BrokerClient, BrokerEvent, BrokerLink, BrokerSession, ConnectOptions,
};
pub use connection::{ConnectionManager, ConnectionSettings, InboundHandler, SubscribeOutcome};
pub use dispatcher::{Dispatcher, OutputMessage, OutputSink};
pub use error::{BrokerError, DispatchError};
pub use memory::MemoryBroker;
pub use mqtt::MqttClient;
pub use nats::NatsClient;
pub use status::{ConnectionState, Indicator, StateChange, Status, StatusReporter};
