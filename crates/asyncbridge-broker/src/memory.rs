//! In-process loopback broker.
//!
//! Publishes are routed to every session whose subscription filter matches,
//! using MQTT wildcard rules. Counters and fault switches make connection
//! behaviour reproducible without a network.

use std::collections::HashMap;
use std::sync::Arc;

use async_trait::async_trait;
use bytes::Bytes;
use parking_lot::Mutex;
use tokio::sync::mpsc;

use crate::client::{BrokerClient, BrokerEvent, BrokerLink, BrokerSession, ConnectOptions};
use crate::error::BrokerError;

/// Operation counters, incremented only for requests that reached the broker.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct MemoryStats {
    pub connect_attempts: u64,
    pub connects: u64,
    pub subscribes: u64,
    pub unsubscribes: u64,
    pub publishes: u64,
    pub closes: u64,
}

#[derive(Default)]
struct Faults {
    failing_connects: u32,
    stall_connects: bool,
    stall_publishes: bool,
    fail_subscribes: bool,
    fail_publishes: bool,
}

struct SessionEntry {
    events: mpsc::UnboundedSender<BrokerEvent>,
    filters: Vec<String>,
}

#[derive(Default)]
struct Inner {
    next_id: u64,
    sessions: HashMap<u64, SessionEntry>,
    stats: MemoryStats,
    faults: Faults,
    published: Vec<(String, Bytes)>,
}

/// A shared in-memory broker. Clones refer to the same broker.
#[derive(Clone, Default)]
pub struct MemoryBroker {
    inner: Arc<Mutex<Inner>>,
}

impl MemoryBroker {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn stats(&self) -> MemoryStats {
        self.inner.lock().stats.clone()
    }

    /// Fail the next `n` connect attempts.
    pub fn fail_next_connects(&self, n: u32) {
        self.inner.lock().faults.failing_connects = n;
    }

    /// Make connect attempts hang until the caller gives up.
    pub fn stall_connects(&self, stall: bool) {
        self.inner.lock().faults.stall_connects = stall;
    }

    /// Make publishes hang until the caller gives up.
    pub fn stall_publishes(&self, stall: bool) {
        self.inner.lock().faults.stall_publishes = stall;
    }

    pub fn fail_subscribes(&self, fail: bool) {
        self.inner.lock().faults.fail_subscribes = fail;
    }

    pub fn fail_publishes(&self, fail: bool) {
        self.inner.lock().faults.fail_publishes = fail;
    }

    /// Number of open sessions.
    pub fn sessions(&self) -> usize {
        self.inner.lock().sessions.len()
    }

    /// Every message published through a session, in order.
    pub fn published(&self) -> Vec<(String, Bytes)> {
        self.inner.lock().published.clone()
    }

    /// Deliver a message as if another client had published it.
    ///
    /// Returns the number of sessions that received it.
    pub fn deliver(&self, topic: &str, payload: impl Into<Bytes>) -> usize {
        let payload = payload.into();
        self.inner.lock().route(topic, &payload)
    }

    /// Close every session as if the broker went away cleanly.
    pub fn disconnect_all(&self) {
        let sessions: Vec<_> = self.inner.lock().sessions.drain().collect();
        for (_, entry) in sessions {
            let _ = entry.events.send(BrokerEvent::Closed);
        }
    }

    /// Report a transport error on every session and drop them.
    pub fn inject_error(&self, cause: &str) {
        let sessions: Vec<_> = self.inner.lock().sessions.drain().collect();
        for (_, entry) in sessions {
            let _ = entry.events.send(BrokerEvent::Error(cause.to_string()));
        }
    }
}

impl Inner {
    fn route(&mut self, topic: &str, payload: &Bytes) -> usize {
        let mut delivered = 0;
        for entry in self.sessions.values() {
            if entry.filters.iter().any(|f| topic_matches(f, topic)) {
                let event = BrokerEvent::Message {
                    topic: topic.to_string(),
                    payload: payload.clone(),
                };
                if entry.events.send(event).is_ok() {
                    delivered += 1;
                }
            }
        }
        delivered
    }
}

#[async_trait]
impl BrokerClient for MemoryBroker {
    async fn connect(
        &self,
        url: &str,
        _options: &ConnectOptions,
    ) -> Result<BrokerLink, BrokerError> {
        let stall = {
            let mut inner = self.inner.lock();
            inner.stats.connect_attempts += 1;
            if inner.faults.failing_connects > 0 {
                inner.faults.failing_connects -= 1;
                return Err(BrokerError::ConnectFailed(format!(
                    "connection refused by {}",
                    url
                )));
            }
            inner.faults.stall_connects
        };
        if stall {
            std::future::pending::<()>().await;
        }

        let (tx, rx) = mpsc::unbounded_channel();
        let id = {
            let mut inner = self.inner.lock();
            let id = inner.next_id;
            inner.next_id += 1;
            inner.stats.connects += 1;
            inner.sessions.insert(
                id,
                SessionEntry {
                    events: tx,
                    filters: Vec::new(),
                },
            );
            id
        };

        Ok(BrokerLink {
            session: Box::new(MemorySession {
                id,
                broker: self.clone(),
            }),
            events: rx,
        })
    }
}

struct MemorySession {
    id: u64,
    broker: MemoryBroker,
}

#[async_trait]
impl BrokerSession for MemorySession {
    async fn subscribe(&mut self, topic: &str) -> Result<(), BrokerError> {
        let mut inner = self.broker.inner.lock();
        if inner.faults.fail_subscribes {
            return Err(BrokerError::SubscribeFailed(format!(
                "subscription to '{}' rejected",
                topic
            )));
        }
        let entry = inner.sessions.get_mut(&self.id).ok_or(BrokerError::Closed)?;
        entry.filters.push(topic.to_string());
        inner.stats.subscribes += 1;
        Ok(())
    }

    async fn unsubscribe(&mut self, topic: &str) -> Result<(), BrokerError> {
        let mut inner = self.broker.inner.lock();
        let entry = inner.sessions.get_mut(&self.id).ok_or(BrokerError::Closed)?;
        entry.filters.retain(|f| f != topic);
        inner.stats.unsubscribes += 1;
        Ok(())
    }

    async fn publish(&mut self, topic: &str, payload: Bytes) -> Result<(), BrokerError> {
        let stall = self.broker.inner.lock().faults.stall_publishes;
        if stall {
            std::future::pending::<()>().await;
        }
        let mut inner = self.broker.inner.lock();
        if !inner.sessions.contains_key(&self.id) {
            return Err(BrokerError::Closed);
        }
        if inner.faults.fail_publishes {
            return Err(BrokerError::PublishFailed(format!(
                "broker rejected publish to '{}'",
                topic
            )));
        }
        inner.stats.publishes += 1;
        inner.published.push((topic.to_string(), payload.clone()));
        inner.route(topic, &payload);
        Ok(())
    }

    async fn close(&mut self) {
        let mut inner = self.broker.inner.lock();
        if inner.sessions.remove(&self.id).is_some() {
            inner.stats.closes += 1;
        }
    }
}

impl Drop for MemorySession {
    fn drop(&mut self) {
        self.broker.inner.lock().sessions.remove(&self.id);
    }
}

/// MQTT topic filter matching: `+` matches one level, a trailing `#` any number.
pub fn topic_matches(filter: &str, topic: &str) -> bool {
    let filter_levels: Vec<&str> = filter.split('/').collect();
    let topic_levels: Vec<&str> = topic.split('/').collect();

    let mut t = 0;
    for (f, level) in filter_levels.iter().enumerate() {
        match *level {
            "#" => return f == filter_levels.len() - 1,
            "+" => {
                if t >= topic_levels.len() {
                    return false;
                }
            }
            exact => {
                if t >= topic_levels.len() || topic_levels[t] != exact {
                    return false;
                }
            }
        }
        t += 1;
    }
    t == topic_levels.len()
}
