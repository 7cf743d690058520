//! Connection manager
//!
//! Single-task state machine. Every input (caller commands, open results,
//! transport events, retry timer fires) arrives on one inbox and is handled to
//! completion before the next one, so the state, the registry and the
//! transport handle have exactly one writer and need no locking.
//!
//! ```text
//!            connect                 open ok
//!   Closed ───────────► Connecting ───────────► Connected
//!     ▲  ▲                  │ open failed           │ peer close / error
//!     │  │                  ▼                       ▼
//!     │  └──── Errored ◄────┘        (Errored) ──► Closed ──► policy
//!     │                                                         │
//!     │ attempts exhausted              retry timer             ▼
//!     └───────────────────────── Connecting ◄──────────── Reconnecting
//!
//!   Connected ── disconnect ──► Closing ── close event ──► Closed
//! ```
//!
//! Connection ids tag every open result and transport event; anything
//! carrying an id other than the current attempt or link is stale and
//! ignored, which keeps at most one transport live.

use std::ops::ControlFlow;
use std::sync::Arc;

use anyhow::{anyhow, Result};
use tokio::sync::{broadcast, mpsc, oneshot, watch};
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};

use crate::backoff::ReconnectPolicy;
use crate::client::ConnectError;
use crate::config::TransportConfig;
use crate::metrics::ConnectionMetrics;
use crate::registry::SubscriptionRegistry;
use crate::router::MessageRouter;
use crate::state::{ConnectionState, StatusChange, TransitionReason};
use crate::transport::{Connector, Link, Transport, TransportEvent};

pub(crate) type ConnectReply = oneshot::Sender<Result<(), ConnectError>>;

pub(crate) enum Command {
    Connect(ConnectReply),
    Disconnect(oneshot::Sender<()>),
    Subscribe {
        channel: String,
        reply: oneshot::Sender<bool>,
    },
    Unsubscribe {
        channel: String,
        reply: oneshot::Sender<bool>,
    },
    Send {
        text: String,
        reply: oneshot::Sender<bool>,
    },
    Channels(oneshot::Sender<Vec<String>>),
    Shutdown(oneshot::Sender<()>),
}

pub(crate) enum ManagerEvent {
    Command(Command),
    Opened { id: u64, result: Result<Link> },
    Transport { id: u64, event: TransportEvent },
    RetryTimer { generation: u64 },
}

/// Channels the manager publishes through
pub(crate) struct ManagerOutputs {
    pub state_tx: watch::Sender<ConnectionState>,
    pub changes: broadcast::Sender<StatusChange>,
    pub metrics: Arc<ConnectionMetrics>,
}

struct PendingAttempt {
    id: u64,
    task: JoinHandle<()>,
    waiters: Vec<ConnectReply>,
}

struct ActiveLink {
    id: u64,
    transport: Box<dyn Transport>,
    pump: JoinHandle<()>,
}

struct RetryTimer {
    generation: u64,
    task: JoinHandle<()>,
}

pub(crate) struct ConnectionManager {
    config: TransportConfig,
    connector: Arc<dyn Connector>,
    router: MessageRouter,
    registry: SubscriptionRegistry,
    policy: ReconnectPolicy,
    state: ConnectionState,
    outputs: ManagerOutputs,
    /// Weak so that spawned tasks never keep the inbox open on their own
    inbox: mpsc::WeakUnboundedSender<ManagerEvent>,
    next_id: u64,
    attempt: Option<PendingAttempt>,
    link: Option<ActiveLink>,
    retry: Option<RetryTimer>,
    retry_generation: u64,
}

impl ConnectionManager {
    pub(crate) fn new(
        config: TransportConfig,
        connector: Arc<dyn Connector>,
        router: MessageRouter,
        outputs: ManagerOutputs,
        inbox: mpsc::WeakUnboundedSender<ManagerEvent>,
    ) -> Self {
        let policy = ReconnectPolicy::new(&config);
        Self {
            config,
            connector,
            router,
            registry: SubscriptionRegistry::new(),
            policy,
            state: ConnectionState::Closed,
            outputs,
            inbox,
            next_id: 0,
            attempt: None,
            link: None,
            retry: None,
            retry_generation: 0,
        }
    }

    pub(crate) async fn run(mut self, mut inbox_rx: mpsc::UnboundedReceiver<ManagerEvent>) {
        info!(endpoint = self.config.endpoint(), "connection_manager_started");

        let mut shutdown_ack = None;
        while let Some(event) = inbox_rx.recv().await {
            match event {
                ManagerEvent::Command(command) => {
                    if let ControlFlow::Break(ack) = self.handle_command(command) {
                        shutdown_ack = Some(ack);
                        break;
                    }
                }
                ManagerEvent::Opened { id, result } => self.on_opened(id, result),
                ManagerEvent::Transport { id, event } => self.on_transport_event(id, event),
                ManagerEvent::RetryTimer { generation } => self.on_retry_timer(generation),
            }
        }

        // Explicit shutdown, or every client handle dropped
        self.teardown();
        info!(
            metrics = %self.outputs.metrics.summary(),
            "connection_manager_stopped"
        );
        if let Some(ack) = shutdown_ack {
            let _ = ack.send(());
        }
    }

    /// `Break` carries the shutdown acknowledgement; `run` tears down and
    /// answers it once the loop has ended.
    fn handle_command(&mut self, command: Command) -> ControlFlow<oneshot::Sender<()>> {
        match command {
            Command::Connect(reply) => self.connect(Some(reply), TransitionReason::ConnectRequested),
            Command::Disconnect(ack) => {
                self.disconnect();
                let _ = ack.send(());
            }
            Command::Subscribe { channel, reply } => {
                let _ = reply.send(self.subscribe(&channel));
            }
            Command::Unsubscribe { channel, reply } => {
                let _ = reply.send(self.unsubscribe(&channel));
            }
            Command::Send { text, reply } => {
                let _ = reply.send(self.send(text));
            }
            Command::Channels(reply) => {
                let _ = reply.send(self.registry.channels());
            }
            Command::Shutdown(ack) => return ControlFlow::Break(ack),
        }
        ControlFlow::Continue(())
    }

    // =========================================================================
    // CALLER OPERATIONS
    // =========================================================================

    fn connect(&mut self, waiter: Option<ConnectReply>, reason: TransitionReason) {
        match self.state {
            ConnectionState::Connected => {
                if let Some(waiter) = waiter {
                    let _ = waiter.send(Ok(()));
                }
                return;
            }
            ConnectionState::Connecting => {
                // Coalesce onto the attempt already in flight
                if let (Some(attempt), Some(waiter)) = (self.attempt.as_mut(), waiter) {
                    attempt.waiters.push(waiter);
                }
                return;
            }
            ConnectionState::Reconnecting => self.cancel_retry(),
            ConnectionState::Closing => self.release_link(false),
            ConnectionState::Closed | ConnectionState::Errored => {}
        }
        self.start_attempt(waiter, reason);
    }

    fn disconnect(&mut self) {
        self.cancel_retry();

        match self.state {
            ConnectionState::Connected => {
                self.transition(ConnectionState::Closing, TransitionReason::DisconnectRequested);
                if let Some(link) = self.link.as_mut() {
                    link.transport.close();
                }
            }
            ConnectionState::Connecting => {
                self.abort_attempt(ConnectError::Aborted);
                self.transition(ConnectionState::Closed, TransitionReason::AttemptAborted);
            }
            ConnectionState::Reconnecting | ConnectionState::Errored => {
                self.transition(ConnectionState::Closed, TransitionReason::DisconnectRequested);
            }
            ConnectionState::Closing | ConnectionState::Closed => {}
        }
    }

    fn subscribe(&mut self, channel: &str) -> bool {
        if channel.trim().is_empty() {
            debug!("blank_channel_ignored");
            return false;
        }
        let wire = live_wire(self.state, &mut self.link);
        // Only a channel not yet live on this link produces a write
        let writes = wire.is_some() && !self.registry.is_live(channel);
        let live = self.registry.subscribe(channel, wire);
        if writes {
            self.outputs.metrics.record_write(live);
        }
        live
    }

    fn unsubscribe(&mut self, channel: &str) -> bool {
        if channel.trim().is_empty() {
            return false;
        }
        let wire = live_wire(self.state, &mut self.link);
        let online = wire.is_some();
        let sent = self.registry.unsubscribe(channel, wire);
        if online {
            self.outputs.metrics.record_write(sent);
        }
        sent
    }

    fn send(&mut self, text: String) -> bool {
        match live_wire(self.state, &mut self.link) {
            Some(wire) => {
                let accepted = wire.send_text(text);
                self.outputs.metrics.record_write(accepted);
                accepted
            }
            None => false,
        }
    }

    // =========================================================================
    // ATTEMPTS
    // =========================================================================

    fn start_attempt(&mut self, waiter: Option<ConnectReply>, reason: TransitionReason) {
        self.next_id += 1;
        let id = self.next_id;

        self.outputs.metrics.record_connect_attempt();
        self.transition(ConnectionState::Connecting, reason);

        let connector = self.connector.clone();
        let endpoint = self.config.endpoint().to_string();
        let limit = self.config.connect_timeout();
        let inbox = self.inbox.clone();

        let task = tokio::spawn(async move {
            let result = match limit {
                Some(limit) => match tokio::time::timeout(limit, connector.open(&endpoint)).await {
                    Ok(result) => result,
                    Err(_) => Err(anyhow!("connect timeout after {}ms", limit.as_millis())),
                },
                None => connector.open(&endpoint).await,
            };
            if let Some(tx) = inbox.upgrade() {
                let _ = tx.send(ManagerEvent::Opened { id, result });
            }
        });

        self.attempt = Some(PendingAttempt {
            id,
            task,
            waiters: waiter.into_iter().collect(),
        });
    }

    fn on_opened(&mut self, id: u64, result: Result<Link>) {
        let attempt = match self.attempt.take() {
            Some(attempt) if attempt.id == id => attempt,
            other => {
                self.attempt = other;
                if let Ok(mut link) = result {
                    debug!(id, "stale_open_closed");
                    link.transport.close();
                }
                return;
            }
        };

        match result {
            Ok(Link {
                mut transport,
                events,
            }) => {
                self.policy.reset();
                self.outputs.metrics.record_connect_success();
                self.transition(ConnectionState::Connected, TransitionReason::OpenSucceeded);

                let replayed = self.registry.replay_all(transport.as_mut());
                self.outputs
                    .metrics
                    .record_replay(replayed, self.registry.len());
                info!(
                    id,
                    channels = self.registry.len(),
                    replayed,
                    "subscriptions_replayed"
                );

                // Inbound frames start flowing only after replay frames are queued
                let pump = self.spawn_pump(id, events);
                self.link = Some(ActiveLink {
                    id,
                    transport,
                    pump,
                });

                for waiter in attempt.waiters {
                    let _ = waiter.send(Ok(()));
                }
            }
            Err(e) => {
                warn!(id, error = %e, "connect_failed");
                self.outputs.metrics.record_connect_failure();
                self.transition(ConnectionState::Errored, TransitionReason::OpenFailed);
                self.transition(ConnectionState::Closed, TransitionReason::OpenFailed);

                let error = ConnectError::Open(format!("{:#}", e));
                for waiter in attempt.waiters {
                    let _ = waiter.send(Err(error.clone()));
                }

                self.schedule_retry();
            }
        }
    }

    fn abort_attempt(&mut self, error: ConnectError) {
        if let Some(attempt) = self.attempt.take() {
            attempt.task.abort();
            debug!(id = attempt.id, error = %error, "connect_attempt_aborted");
            for waiter in attempt.waiters {
                let _ = waiter.send(Err(error.clone()));
            }
        }
    }

    fn spawn_pump(
        &self,
        id: u64,
        mut events: mpsc::UnboundedReceiver<TransportEvent>,
    ) -> JoinHandle<()> {
        let inbox = self.inbox.clone();
        tokio::spawn(async move {
            while let Some(event) = events.recv().await {
                let terminal = !matches!(event, TransportEvent::Frame(_));
                let Some(tx) = inbox.upgrade() else {
                    return;
                };
                if tx.send(ManagerEvent::Transport { id, event }).is_err() || terminal {
                    return;
                }
            }
            // Sender dropped without a close event
            if let Some(tx) = inbox.upgrade() {
                let _ = tx.send(ManagerEvent::Transport {
                    id,
                    event: TransportEvent::Closed(None),
                });
            }
        })
    }

    fn release_link(&mut self, graceful: bool) {
        self.registry.mark_offline();
        if let Some(mut link) = self.link.take() {
            if graceful {
                link.transport.close();
            }
            link.pump.abort();
        }
    }

    // =========================================================================
    // TRANSPORT EVENTS
    // =========================================================================

    fn on_transport_event(&mut self, id: u64, event: TransportEvent) {
        if self.link.as_ref().map(|link| link.id) != Some(id) {
            return;
        }

        match event {
            TransportEvent::Frame(text) => self.router.handle_frame(&text),
            TransportEvent::Closed(reason) => {
                self.release_link(false);
                if self.state == ConnectionState::Closing {
                    self.transition(ConnectionState::Closed, TransitionReason::CloseCompleted);
                } else {
                    info!(id, reason = ?reason, "connection_lost");
                    self.outputs.metrics.record_unplanned_disconnect();
                    self.transition(ConnectionState::Closed, TransitionReason::ServerClose);
                    self.schedule_retry();
                }
            }
            TransportEvent::Error(error) => {
                self.release_link(false);
                if self.state == ConnectionState::Closing {
                    self.transition(ConnectionState::Closed, TransitionReason::CloseCompleted);
                } else {
                    warn!(id, error = %error, "transport_error");
                    self.outputs.metrics.record_unplanned_disconnect();
                    self.transition(ConnectionState::Errored, TransitionReason::TransportError);
                    self.transition(ConnectionState::Closed, TransitionReason::TransportError);
                    self.schedule_retry();
                }
            }
        }
    }

    // =========================================================================
    // RECONNECT POLICY
    // =========================================================================

    fn schedule_retry(&mut self) {
        let Some(delay) = self.policy.next_delay() else {
            self.outputs.metrics.record_retries_exhausted();
            warn!(
                attempts = self.policy.attempt(),
                "reconnect_attempts_exhausted"
            );
            return;
        };

        self.retry_generation += 1;
        let generation = self.retry_generation;
        self.outputs.metrics.record_retry_scheduled();
        self.transition(ConnectionState::Reconnecting, TransitionReason::RetryScheduled);
        info!(
            attempt = self.policy.attempt(),
            max_attempts = self.policy.max_attempts(),
            delay_ms = delay.as_millis() as u64,
            "reconnect_scheduled"
        );

        let inbox = self.inbox.clone();
        let task = tokio::spawn(async move {
            tokio::time::sleep(delay).await;
            if let Some(tx) = inbox.upgrade() {
                let _ = tx.send(ManagerEvent::RetryTimer { generation });
            }
        });
        self.retry = Some(RetryTimer { generation, task });
    }

    fn cancel_retry(&mut self) {
        if let Some(timer) = self.retry.take() {
            timer.task.abort();
            debug!(generation = timer.generation, "reconnect_timer_cancelled");
        }
    }

    fn on_retry_timer(&mut self, generation: u64) {
        match &self.retry {
            Some(timer) if timer.generation == generation => {}
            _ => return,
        }
        self.retry = None;

        if self.state == ConnectionState::Reconnecting {
            self.start_attempt(None, TransitionReason::RetryTimerFired);
        }
    }

    // =========================================================================
    // LIFECYCLE
    // =========================================================================

    fn teardown(&mut self) {
        self.cancel_retry();
        self.abort_attempt(ConnectError::Shutdown);
        self.release_link(true);
        self.registry.clear();
        self.transition(ConnectionState::Closed, TransitionReason::Shutdown);
    }

    fn transition(&mut self, next: ConnectionState, reason: TransitionReason) {
        let prev = self.state;
        if prev == next {
            return;
        }
        self.state = next;

        let attempt = self.policy.attempt();
        self.outputs.state_tx.send_replace(next);
        // No subscribers is fine
        let _ = self.outputs.changes.send(StatusChange {
            from: prev,
            to: next,
            reason,
            attempt,
        });

        info!(
            from = %prev,
            to = %next,
            reason = %reason,
            attempt,
            "connection_transition"
        );
    }
}

/// The transport, but only while `Connected`
fn live_wire(
    state: ConnectionState,
    link: &mut Option<ActiveLink>,
) -> Option<&mut dyn Transport> {
    if state != ConnectionState::Connected {
        return None;
    }
    link.as_mut()
        .map(|active| -> &mut dyn Transport { active.transport.as_mut() })
}
