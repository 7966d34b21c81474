//! Per-binding connection state machine.
//!
//! Each binding gets one actor task that owns the broker session. Commands,
//! broker events, timers and the shutdown signal are all serialized through
//! that task, so state transitions never interleave.

use std::sync::Arc;
use std::time::Duration;

use bytes::Bytes;
use parking_lot::Mutex;
use tokio::sync::{mpsc, oneshot, watch};
use tokio::task::JoinHandle;

use crate::client::{BrokerClient, BrokerEvent, BrokerLink, BrokerSession, ConnectOptions};
use crate::error::{BrokerError, DispatchError};
use crate::status::{ConnectionState, StatusReporter};

const COMMAND_CAPACITY: usize = 16;

/// Timing and client options for one connection.
#[derive(Debug, Clone)]
pub struct ConnectionSettings {
    pub options: ConnectOptions,
    /// Bound on a single connect attempt, and on subscribe, publish and close round-trips.
    pub connect_timeout: Duration,
    /// Fixed wait between a failure and the next attempt.
    pub reconnect_period: Duration,
}

impl Default for ConnectionSettings {
    fn default() -> Self {
        Self {
            options: ConnectOptions::default(),
            connect_timeout: Duration::from_millis(5000),
            reconnect_period: Duration::from_millis(2000),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SubscribeOutcome {
    /// The broker acknowledged a new subscription.
    Subscribed,
    /// A subscription was already live; nothing was sent.
    AlreadySubscribed,
    /// Not connected yet; the subscription is issued after the handshake.
    Pending,
}

/// Receives broker messages, in delivery order, on the actor task.
pub trait InboundHandler: Send + 'static {
    fn on_message(&mut self, topic: String, payload: Bytes);
}

impl<F> InboundHandler for F
where
    F: FnMut(String, Bytes) + Send + 'static,
{
    fn on_message(&mut self, topic: String, payload: Bytes) {
        self(topic, payload)
    }
}

type Reply<T> = oneshot::Sender<Result<T, DispatchError>>;

enum Command {
    Connect,
    Subscribe(Reply<SubscribeOutcome>),
    Publish { payload: Bytes, reply: Reply<()> },
}

/// Handle to a binding's connection actor.
pub struct ConnectionManager {
    commands: mpsc::Sender<Command>,
    shutdown: watch::Sender<bool>,
    status: StatusReporter,
    task: Mutex<Option<JoinHandle<()>>>,
    close_timeout: Duration,
}

impl ConnectionManager {
    /// Start the actor in `Idle`. Nothing is attempted until [`connect`](Self::connect).
    pub fn spawn(
        client: Arc<dyn BrokerClient>,
        url: impl Into<String>,
        topic: impl Into<String>,
        settings: ConnectionSettings,
        status: StatusReporter,
        inbound: impl InboundHandler,
    ) -> Self {
        let (command_tx, command_rx) = mpsc::channel(COMMAND_CAPACITY);
        let (shutdown_tx, shutdown_rx) = watch::channel(false);
        // Unsubscribe and close each get one timeout, plus slack for the actor to wake.
        let close_timeout = settings.connect_timeout * 3;

        let actor = Actor {
            client,
            url: url.into(),
            topic: topic.into(),
            settings,
            status: status.clone(),
            commands: command_rx,
            shutdown: shutdown_rx,
            inbound: Box::new(inbound),
            want_connected: false,
            want_subscribed: false,
            subscribed: false,
        };
        let task = tokio::spawn(actor.run());

        Self {
            commands: command_tx,
            shutdown: shutdown_tx,
            status,
            task: Mutex::new(Some(task)),
            close_timeout,
        }
    }

    /// Start connecting. A no-op while connecting or connected.
    pub async fn connect(&self) -> Result<(), DispatchError> {
        self.ensure_open()?;
        self.commands
            .send(Command::Connect)
            .await
            .map_err(|_| DispatchError::Closed)
    }

    /// Make sure exactly one subscription to the topic is live.
    pub async fn ensure_subscribed(&self) -> Result<SubscribeOutcome, DispatchError> {
        self.request(Command::Subscribe).await
    }

    /// Publish raw bytes. Fails with `NotConnected` unless connected.
    pub async fn publish(&self, payload: Bytes) -> Result<(), DispatchError> {
        self.request(|reply| Command::Publish { payload, reply })
            .await
    }

    pub fn status(&self) -> &StatusReporter {
        &self.status
    }

    /// Stop the actor, unsubscribe and close, then freeze the status in `Closed`.
    ///
    /// Idempotent. Once this returns, no further transition or inbound
    /// message is observed.
    pub async fn teardown(&self) {
        self.status.begin_close();
        let _ = self.shutdown.send(true);

        let task = self.task.lock().take();
        if let Some(mut task) = task {
            if tokio::time::timeout(self.close_timeout, &mut task)
                .await
                .is_err()
            {
                tracing::warn!("connection actor did not stop in time, aborting");
                task.abort();
            }
        }

        self.status.transition(ConnectionState::Closed);
    }

    fn ensure_open(&self) -> Result<(), DispatchError> {
        if *self.shutdown.borrow() || self.status.state() == ConnectionState::Closed {
            Err(DispatchError::Closed)
        } else {
            Ok(())
        }
    }

    async fn request<T>(
        &self,
        command: impl FnOnce(Reply<T>) -> Command,
    ) -> Result<T, DispatchError> {
        self.ensure_open()?;
        let (tx, rx) = oneshot::channel();
        self.commands
            .send(command(tx))
            .await
            .map_err(|_| DispatchError::Closed)?;
        rx.await.map_err(|_| DispatchError::Closed)?
    }
}

enum Flow {
    Continue,
    Shutdown,
}

enum Attempt {
    Up(BrokerLink),
    Failed(BrokerError),
    Shutdown,
}

struct Actor {
    client: Arc<dyn BrokerClient>,
    url: String,
    topic: String,
    settings: ConnectionSettings,
    status: StatusReporter,
    commands: mpsc::Receiver<Command>,
    shutdown: watch::Receiver<bool>,
    inbound: Box<dyn InboundHandler>,
    want_connected: bool,
    /// A subscription was requested and must be restored after every handshake.
    want_subscribed: bool,
    subscribed: bool,
}

impl Actor {
    async fn run(mut self) {
        loop {
            let flow = if self.want_connected {
                self.connect_cycle().await
            } else {
                self.idle().await
            };
            if let Flow::Shutdown = flow {
                break;
            }
        }
        tracing::debug!(url = %self.url, topic = %self.topic, "connection actor stopped");
    }

    fn stop_requested(&self, changed: Result<(), watch::error::RecvError>) -> bool {
        changed.is_err() || self.shutting_down()
    }

    fn shutting_down(&self) -> bool {
        *self.shutdown.borrow()
    }

    async fn idle(&mut self) -> Flow {
        tokio::select! {
            biased;
            changed = self.shutdown.changed() => {
                if self.stop_requested(changed) {
                    return Flow::Shutdown;
                }
            }
            command = self.commands.recv() => match command {
                Some(command) => self.handle_offline(command),
                None => return Flow::Shutdown,
            },
        }
        Flow::Continue
    }

    async fn connect_cycle(&mut self) -> Flow {
        self.status.transition(ConnectionState::Connecting);
        tracing::info!(url = %self.url, "connecting to broker");

        match self.attempt().await {
            Attempt::Shutdown => Flow::Shutdown,
            // A teardown that raced the attempt wins over its result.
            Attempt::Up(mut link) if self.shutting_down() => {
                let _ = tokio::time::timeout(self.settings.connect_timeout, link.session.close())
                    .await;
                Flow::Shutdown
            }
            Attempt::Failed(_) if self.shutting_down() => Flow::Shutdown,
            Attempt::Failed(e) => {
                tracing::warn!(
                    url = %self.url,
                    error = %e,
                    retry_ms = self.settings.reconnect_period.as_millis() as u64,
                    "broker connection failed, will retry"
                );
                self.status.record_error(e.to_string());
                self.status.transition(ConnectionState::Error);
                self.backoff().await
            }
            Attempt::Up(link) => {
                self.status.transition(ConnectionState::Connected);
                match self.serve(link).await {
                    Flow::Shutdown => Flow::Shutdown,
                    Flow::Continue => self.backoff().await,
                }
            }
        }
    }

    async fn attempt(&mut self) -> Attempt {
        let client = Arc::clone(&self.client);
        let url = self.url.clone();
        let options = self.settings.options.clone();
        let timeout = self.settings.connect_timeout;

        let attempt = async move {
            match tokio::time::timeout(timeout, client.connect(&url, &options)).await {
                Ok(result) => result,
                Err(_) => Err(BrokerError::ConnectTimeout {
                    timeout_ms: timeout.as_millis() as u64,
                }),
            }
        };
        tokio::pin!(attempt);

        loop {
            tokio::select! {
                biased;
                changed = self.shutdown.changed() => {
                    if self.stop_requested(changed) {
                        return Attempt::Shutdown;
                    }
                }
                Some(command) = self.commands.recv() => self.handle_offline(command),
                result = &mut attempt => {
                    return match result {
                        Ok(link) => Attempt::Up(link),
                        Err(e) => Attempt::Failed(e),
                    };
                }
            }
        }
    }

    /// Run a live session until it is lost (`Continue`) or shut down.
    async fn serve(&mut self, link: BrokerLink) -> Flow {
        let BrokerLink {
            mut session,
            mut events,
        } = link;
        self.subscribed = false;

        if self.want_subscribed {
            // Failure is recorded in the status; the next request retries.
            let _ = self.subscribe(session.as_mut()).await;
        }

        loop {
            tokio::select! {
                biased;
                changed = self.shutdown.changed() => {
                    if self.stop_requested(changed) {
                        self.close_session(session.as_mut()).await;
                        return Flow::Shutdown;
                    }
                }
                Some(command) = self.commands.recv() => {
                    self.handle_online(command, session.as_mut()).await;
                }
                event = events.recv() => match event {
                    Some(BrokerEvent::Message { topic, payload }) => {
                        self.inbound.on_message(topic, payload);
                    }
                    Some(BrokerEvent::Error(cause)) => {
                        tracing::warn!(url = %self.url, error = %cause, "broker reported an error");
                        self.status.record_error(cause);
                        self.lose(session.as_mut(), ConnectionState::Error).await;
                        return Flow::Continue;
                    }
                    Some(BrokerEvent::Closed) | None => {
                        tracing::info!(url = %self.url, "broker closed the connection");
                        self.lose(session.as_mut(), ConnectionState::Disconnected).await;
                        return Flow::Continue;
                    }
                },
            }
        }
    }

    async fn backoff(&mut self) -> Flow {
        let sleep = tokio::time::sleep(self.settings.reconnect_period);
        tokio::pin!(sleep);

        loop {
            tokio::select! {
                biased;
                changed = self.shutdown.changed() => {
                    if self.stop_requested(changed) {
                        return Flow::Shutdown;
                    }
                }
                Some(command) = self.commands.recv() => self.handle_offline(command),
                _ = &mut sleep => {
                    self.status.record_reconnect_attempt();
                    return Flow::Continue;
                }
            }
        }
    }

    fn handle_offline(&mut self, command: Command) {
        match command {
            Command::Connect => self.want_connected = true,
            Command::Subscribe(reply) => {
                self.want_subscribed = true;
                let _ = reply.send(Ok(SubscribeOutcome::Pending));
            }
            // Never reaches the broker client.
            Command::Publish { reply, .. } => {
                let _ = reply.send(Err(DispatchError::NotConnected));
            }
        }
    }

    async fn handle_online(&mut self, command: Command, session: &mut dyn BrokerSession) {
        match command {
            Command::Connect => {}
            Command::Subscribe(reply) => {
                self.want_subscribed = true;
                let result = if self.subscribed {
                    Ok(SubscribeOutcome::AlreadySubscribed)
                } else {
                    self.subscribe(session)
                        .await
                        .map(|()| SubscribeOutcome::Subscribed)
                        .map_err(|e| DispatchError::SubscribeFailed(e.to_string()))
                };
                let _ = reply.send(result);
            }
            Command::Publish { payload, reply } => {
                let publish = tokio::time::timeout(
                    self.settings.connect_timeout,
                    session.publish(&self.topic, payload),
                );
                let result = match publish.await.unwrap_or_else(|_| {
                    Err(BrokerError::PublishFailed(format!(
                        "publish timed out after {}ms",
                        self.settings.connect_timeout.as_millis()
                    )))
                }) {
                    Ok(()) => {
                        self.status.record_published();
                        Ok(())
                    }
                    Err(e) => {
                        self.status.record_error(e.to_string());
                        Err(DispatchError::PublishFailed(e.to_string()))
                    }
                };
                let _ = reply.send(result);
            }
        }
    }

    async fn subscribe(&mut self, session: &mut dyn BrokerSession) -> Result<(), BrokerError> {
        let result =
            match tokio::time::timeout(self.settings.connect_timeout, session.subscribe(&self.topic))
                .await
            {
                Ok(result) => result,
                Err(_) => Err(BrokerError::SubscribeFailed(
                    "timed out waiting for acknowledgement".to_string(),
                )),
            };

        match result {
            Ok(()) => {
                self.subscribed = true;
                self.status.set_subscribed(true);
                tracing::info!(topic = %self.topic, "subscribed");
                Ok(())
            }
            Err(e) => {
                asyncbridge_telemetry::log_dispatch_error!(topic = %self.topic, error = %e);
                self.status.record_error(e.to_string());
                Err(e)
            }
        }
    }

    async fn lose(&mut self, session: &mut dyn BrokerSession, state: ConnectionState) {
        self.subscribed = false;
        self.status.transition(state);
        let _ = tokio::time::timeout(self.settings.connect_timeout, session.close()).await;
    }

    async fn close_session(&mut self, session: &mut dyn BrokerSession) {
        let bound = self.settings.connect_timeout;
        if self.subscribed {
            if let Ok(Err(e)) = tokio::time::timeout(bound, session.unsubscribe(&self.topic)).await
            {
                tracing::debug!(topic = %self.topic, error = %e, "unsubscribe on close failed");
            }
            self.subscribed = false;
        }
        let _ = tokio::time::timeout(bound, session.close()).await;
    }
}
