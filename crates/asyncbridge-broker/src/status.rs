//! Connection status snapshots for observers.
//!
//! The connection actor is the only writer. Consumers poll a snapshot, watch
//! the latest value, or subscribe to every state transition.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use tokio::sync::{broadcast, watch};

const TRANSITION_CAPACITY: usize = 64;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ConnectionState {
    Idle,
    Connecting,
    Connected,
    Error,
    Disconnected,
    /// Terminal. Entered on teardown.
    Closed,
}

impl ConnectionState {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Idle => "idle",
            Self::Connecting => "connecting",
            Self::Connected => "connected",
            Self::Error => "error",
            Self::Disconnected => "disconnected",
            Self::Closed => "closed",
        }
    }
}

impl std::fmt::Display for ConnectionState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Read-only snapshot of one binding's connection.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct Status {
    pub state: ConnectionState,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub last_error: Option<String>,
    /// True only while the broker has acknowledged the binding's subscription.
    pub subscribed: bool,
    pub messages_received: u64,
    pub messages_published: u64,
    /// Inbound payloads that did not match their content type.
    pub decode_fallbacks: u64,
    pub reconnect_attempts: u64,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub last_activity: Option<DateTime<Utc>>,
}

impl Default for Status {
    fn default() -> Self {
        Self {
            state: ConnectionState::Idle,
            last_error: None,
            subscribed: false,
            messages_received: 0,
            messages_published: 0,
            decode_fallbacks: 0,
            reconnect_attempts: 0,
            last_activity: None,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Fill {
    Green,
    Yellow,
    Red,
    Grey,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Shape {
    Dot,
    Ring,
}

/// A host status badge.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Indicator {
    pub fill: Fill,
    pub shape: Shape,
    pub text: String,
}

impl Status {
    pub fn indicator(&self) -> Indicator {
        let (fill, shape, text) = match self.state {
            ConnectionState::Connected => (Fill::Green, Shape::Dot, "connected".to_string()),
            ConnectionState::Connecting => (Fill::Yellow, Shape::Ring, "connecting".to_string()),
            ConnectionState::Error => (
                Fill::Red,
                Shape::Ring,
                match &self.last_error {
                    Some(e) => format!("error: {}", e),
                    None => "error".to_string(),
                },
            ),
            ConnectionState::Disconnected => (Fill::Red, Shape::Ring, "disconnected".to_string()),
            ConnectionState::Idle => (Fill::Grey, Shape::Ring, "idle".to_string()),
            ConnectionState::Closed => (Fill::Grey, Shape::Ring, "closed".to_string()),
        };
        Indicator { fill, shape, text }
    }
}

/// One observed state transition.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct StateChange {
    pub from: ConnectionState,
    pub to: ConnectionState,
}

/// Shared writer for a binding's [`Status`]. Frozen once `Closed`.
#[derive(Clone)]
pub struct StatusReporter {
    status: Arc<watch::Sender<Status>>,
    transitions: broadcast::Sender<StateChange>,
    /// Set by teardown; only `Closed` may follow.
    closing: Arc<AtomicBool>,
    label: Arc<str>,
}

impl StatusReporter {
    /// `label` identifies the binding in log lines.
    pub fn new(label: impl Into<Arc<str>>) -> Self {
        let (status, _) = watch::channel(Status::default());
        let (transitions, _) = broadcast::channel(TRANSITION_CAPACITY);
        Self {
            status: Arc::new(status),
            transitions,
            closing: Arc::new(AtomicBool::new(false)),
            label: label.into(),
        }
    }

    pub fn snapshot(&self) -> Status {
        self.status.borrow().clone()
    }

    pub fn state(&self) -> ConnectionState {
        self.status.borrow().state
    }

    pub fn watch(&self) -> watch::Receiver<Status> {
        self.status.subscribe()
    }

    pub fn transitions(&self) -> broadcast::Receiver<StateChange> {
        self.transitions.subscribe()
    }

    /// Refuse every transition except the final move to `Closed`.
    pub fn begin_close(&self) {
        self.closing.store(true, Ordering::SeqCst);
    }

    /// Move to `to`. Returns false for no-op transitions, and for anything
    /// but `Closed` once closing has begun.
    pub fn transition(&self, to: ConnectionState) -> bool {
        let mut from = to;
        let changed = self.status.send_if_modified(|status| {
            if status.state == ConnectionState::Closed || status.state == to {
                return false;
            }
            if to != ConnectionState::Closed && self.closing.load(Ordering::SeqCst) {
                return false;
            }
            from = status.state;
            status.state = to;
            if matches!(
                to,
                ConnectionState::Error | ConnectionState::Disconnected | ConnectionState::Closed
            ) {
                status.subscribed = false;
            }
            true
        });

        if changed {
            asyncbridge_telemetry::log_connection_state!(
                binding = %self.label,
                from = %from,
                to = %to
            );
            let _ = self.transitions.send(StateChange { from, to });
        }
        changed
    }

    pub fn record_error(&self, error: impl Into<String>) {
        let error = error.into();
        self.update(|status| status.last_error = Some(error));
    }

    pub fn set_subscribed(&self, subscribed: bool) {
        self.update(|status| status.subscribed = subscribed);
    }

    pub fn record_received(&self, fallback: bool) {
        self.update(|status| {
            status.messages_received += 1;
            if fallback {
                status.decode_fallbacks += 1;
            }
            status.last_activity = Some(Utc::now());
        });
    }

    pub fn record_published(&self) {
        self.update(|status| {
            status.messages_published += 1;
            status.last_activity = Some(Utc::now());
        });
    }

    pub fn record_reconnect_attempt(&self) {
        self.update(|status| status.reconnect_attempts += 1);
    }

    fn update(&self, f: impl FnOnce(&mut Status)) {
        self.status.send_if_modified(|status| {
            if status.state == ConnectionState::Closed {
                return false;
            }
            f(status);
            true
        });
    }
}
