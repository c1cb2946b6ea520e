//! # ConnectionWorker: single-connection supervisor.
//!
//! One worker owns one connection end to end: its adapter session, its
//! lifecycle state, its backoff bookkeeping and its mapping pipelines.
//! Workers never share mutable state; coordination happens over channels.
//!
//! ## Loop shape
//! ```text
//! Registry ──► WorkerHandle ──► ConnectionWorker::run()
//!
//! loop {
//!   ├─► Uninitialized/Closed/Failed → wait for a command
//!   ├─► Connecting   → adapter connect (with deadline)
//!   │     ├─► Ok        → Connected (session loop)
//!   │     ├─► transient → Reconnecting
//!   │     └─► permanent → Failed
//!   ├─► Reconnecting → sleep backoff, acquire reconnect slot
//!   └─► commands (close/test/delete/outbound) serviced at every wait
//! }
//! ```
//!
//! ## Rules
//! - The backoff delay is computed from the consecutive-failure count and
//!   never from the previous jittered delay.
//! - The failure count resets only after the connection stayed up for the
//!   stability window, or on an explicit open.
//! - A reconnect slot is acquired after the delay elapsed and is held
//!   until the resulting connect attempt resolves.
//! - Close and delete are honored at every wait point, backoff included.

use std::sync::Arc;
use std::time::Duration;

use tokio::sync::{mpsc, oneshot, watch, Semaphore, TryAcquireError};
use tokio::sync::{AcquireError, OwnedSemaphorePermit};
use tokio::task::JoinHandle;
use tokio::time::{self, Instant};
use tracing::{debug, info, warn};

use crate::adapter::{AdapterSession, ProtocolAdapter, SessionEvent};
use crate::config::RuntimeConfig;
use crate::dispatch::{CommandDispatcher, DispatchOutcome, SignalInterceptor};
use crate::error::ConnectError;
use crate::events::{Bus, Event, EventKind};
use crate::mapping::{InboundOutcome, InboundPipeline, MapperRegistry, OutboundPipeline};
use crate::model::{Connection, DesiredState, Signal};

use super::ConnectionState;

/// Header naming the wire address validation replies are published to.
const REPLY_TO_HEADER: &str = "reply-to";

/// Commands a worker accepts over its channel.
#[derive(Debug)]
pub enum WorkerCommand {
    /// Start (or restart after `Closed`/`Failed`) the connect loop.
    Open,
    /// Graceful close; the reply fires once the connection is `Closed`.
    Close {
        /// Acknowledged after the state reached `Closed`.
        reply: oneshot::Sender<()>,
    },
    /// Dry-run connectivity probe; no durable session is kept.
    Test {
        /// Probe outcome.
        reply: oneshot::Sender<Result<(), ConnectError>>,
    },
    /// Stop the worker for good; pending work is dropped.
    Delete,
    /// Publish a domain signal to the connection's matching targets.
    Outbound(Signal),
}

/// Shared services handed to every worker by the registry.
#[derive(Clone)]
pub struct RoutingContext {
    /// Status-event bus.
    pub bus: Bus,
    /// Mapper registry shared across connections.
    pub mappers: Arc<MapperRegistry>,
    /// Validation hook applied before internal dispatch.
    pub interceptor: Arc<dyn SignalInterceptor>,
    /// Platform-side command channel inbound signals are forwarded to.
    pub commands: mpsc::Sender<Signal>,
    /// Process-wide reconnect slot gate (`None` = unlimited).
    pub reconnect_gate: Option<Arc<Semaphore>>,
}

/// Channel ends the registry keeps per worker.
#[derive(Debug)]
pub struct WorkerHandle {
    /// Command channel into the worker.
    pub commands: mpsc::Sender<WorkerCommand>,
    /// Live view of the worker's lifecycle state.
    pub state: watch::Receiver<ConnectionState>,
    /// Join handle of the worker task.
    pub join: JoinHandle<()>,
}

/// What a wait point resolved to.
enum Step {
    Command(Option<WorkerCommand>),
    Session(Option<SessionEvent>),
}

enum Gate {
    Permit(Result<OwnedSemaphorePermit, AcquireError>),
    Command(Option<WorkerCommand>),
}

/// Whether the worker keeps running after a phase.
enum Flow {
    Continue,
    Exit,
}

/// Supervises one connection: lifecycle, backoff and traffic.
pub struct ConnectionWorker {
    connection: Arc<Connection>,
    adapter: Arc<dyn ProtocolAdapter>,
    config: RuntimeConfig,
    bus: Bus,
    gate: Option<Arc<Semaphore>>,
    inbound: InboundPipeline,
    outbound: OutboundPipeline,
    dispatcher: CommandDispatcher,
    rx: mpsc::Receiver<WorkerCommand>,
    state: watch::Sender<ConnectionState>,
    /// Consecutive failures in the current episode.
    failure_count: u32,
    /// Delay chosen for the pending reconnect.
    pending_delay: Duration,
    /// Slot held from backoff end until the connect attempt resolves.
    reconnect_permit: Option<OwnedSemaphorePermit>,
}

impl ConnectionWorker {
    /// Spawns a worker for the connection and returns its handle.
    ///
    /// A connection with `DesiredState::Open` starts connecting
    /// immediately; otherwise the worker parks in `Uninitialized` until a
    /// command arrives.
    pub fn launch(
        connection: Arc<Connection>,
        adapter: Arc<dyn ProtocolAdapter>,
        ctx: RoutingContext,
        config: RuntimeConfig,
    ) -> WorkerHandle {
        let (cmd_tx, cmd_rx) = mpsc::channel(config.command_queue_capacity.max(1));
        let (state_tx, state_rx) = watch::channel(ConnectionState::Uninitialized);

        let inbound = InboundPipeline::new(
            Arc::clone(&connection),
            Arc::clone(&ctx.mappers),
            ctx.bus.clone(),
            config.mapping_failure_threshold,
            config.mapping_failure_window,
        );
        let outbound = OutboundPipeline::new(
            Arc::clone(&connection),
            Arc::clone(&ctx.mappers),
            ctx.bus.clone(),
            config.publish_attempts,
        );
        let dispatcher = CommandDispatcher::new(
            Arc::clone(&connection),
            Arc::clone(&ctx.interceptor),
            ctx.commands.clone(),
            ctx.bus.clone(),
        );

        let worker = ConnectionWorker {
            connection,
            adapter,
            config,
            bus: ctx.bus,
            gate: ctx.reconnect_gate,
            inbound,
            outbound,
            dispatcher,
            rx: cmd_rx,
            state: state_tx,
            failure_count: 0,
            pending_delay: Duration::ZERO,
            reconnect_permit: None,
        };
        let join = tokio::spawn(worker.run());

        WorkerHandle {
            commands: cmd_tx,
            state: state_rx,
            join,
        }
    }

    /// Runs the worker until deletion or channel loss.
    async fn run(mut self) {
        info!(connection = %self.connection.id, "connection worker started");

        if self.connection.desired == DesiredState::Open {
            self.transition(ConnectionState::Connecting, Some("desired state is open"));
        }

        loop {
            // Copy the state out so the watch guard is not held across awaits.
            let state = *self.state.borrow();
            let flow = match state {
                ConnectionState::Connecting => self.connecting().await,
                ConnectionState::Reconnecting => self.reconnecting().await,
                _ => self.idle().await,
            };
            if matches!(flow, Flow::Exit) {
                break;
            }
        }

        info!(connection = %self.connection.id, "connection worker stopped");
    }

    /// Parks in `Uninitialized`/`Closed`/`Failed` until a command arrives.
    async fn idle(&mut self) -> Flow {
        match self.rx.recv().await {
            None | Some(WorkerCommand::Delete) => Flow::Exit,
            Some(WorkerCommand::Open) => {
                // An explicit open starts a fresh failure episode.
                self.failure_count = 0;
                self.transition(ConnectionState::Connecting, Some("open requested"));
                Flow::Continue
            }
            Some(WorkerCommand::Close { reply }) => {
                if *self.state.borrow() != ConnectionState::Closed {
                    self.transition(ConnectionState::Closed, Some("close requested"));
                }
                let _ = reply.send(());
                Flow::Continue
            }
            Some(WorkerCommand::Test { reply }) => {
                let prior = *self.state.borrow();
                self.transition(ConnectionState::TestingConnection, None);
                let outcome = match self.connect_once(true).await {
                    Ok(mut session) => {
                        let _ = session.close().await;
                        Ok(())
                    }
                    Err(err) => Err(err),
                };
                self.transition(prior, Some("test finished"));
                let _ = reply.send(outcome);
                Flow::Continue
            }
            Some(WorkerCommand::Outbound(signal)) => {
                debug!(
                    connection = %self.connection.id,
                    signal = %signal.name, "not connected, outbound signal dropped"
                );
                Flow::Continue
            }
        }
    }

    /// One connect attempt; on success runs the session loop.
    async fn connecting(&mut self) -> Flow {
        let result = self.connect_once(false).await;
        // The reconnect slot covers exactly one attempt.
        self.reconnect_permit = None;

        match result {
            Ok(session) => {
                self.transition(ConnectionState::Connected, None);
                self.connected(session).await
            }
            Err(err) if err.is_retryable() => {
                self.schedule_reconnect(&err.to_string());
                Flow::Continue
            }
            Err(err) => {
                warn!(
                    connection = %self.connection.id,
                    error = %err, "permanent connect failure"
                );
                self.transition(ConnectionState::Failed, Some(&err.to_string()));
                Flow::Continue
            }
        }
    }

    /// Session loop: commands and session events, first come first served.
    async fn connected(&mut self, mut session: Box<dyn AdapterSession>) -> Flow {
        let since = Instant::now();

        loop {
            let step = tokio::select! {
                cmd = self.rx.recv() => Step::Command(cmd),
                ev = session.next_event() => Step::Session(ev),
            };

            match step {
                Step::Command(None) | Step::Command(Some(WorkerCommand::Delete)) => {
                    let _ = session.close().await;
                    return Flow::Exit;
                }
                Step::Command(Some(WorkerCommand::Close { reply })) => {
                    self.disconnect(session).await;
                    let _ = reply.send(());
                    return Flow::Continue;
                }
                Step::Command(Some(WorkerCommand::Open)) => {}
                Step::Command(Some(WorkerCommand::Test { reply })) => {
                    let _ = reply.send(Err(ConnectError::permanent(
                        "connection is open; close it before testing",
                    )));
                }
                Step::Command(Some(WorkerCommand::Outbound(signal))) => {
                    self.outbound.deliver(session.as_mut(), &signal).await;
                }
                Step::Session(Some(SessionEvent::Inbound {
                    source_index,
                    message,
                })) => match self.inbound.process(source_index, &message) {
                    InboundOutcome::Signals(signals) => {
                        for signal in signals {
                            if let DispatchOutcome::Rejected(reply) =
                                self.dispatcher.dispatch(signal).await
                            {
                                self.send_reply(session.as_mut(), reply).await;
                            }
                        }
                    }
                    InboundOutcome::Failed {
                        dead_letter: Some((address, payload)),
                    } => {
                        if let Err(err) = session.publish(&address, payload).await {
                            warn!(
                                connection = %self.connection.id,
                                address = %address,
                                error = %err, "dead-letter publish failed"
                            );
                        }
                    }
                    _ => {}
                },
                Step::Session(Some(SessionEvent::Lost { reason })) => {
                    self.session_lost(since, &reason);
                    return Flow::Continue;
                }
                Step::Session(None) => {
                    self.session_lost(since, "session ended");
                    return Flow::Continue;
                }
            }
        }
    }

    /// Sleeps out the backoff delay, then takes a reconnect slot.
    async fn reconnecting(&mut self) -> Flow {
        let sleep = time::sleep(self.pending_delay);
        tokio::pin!(sleep);
        loop {
            let step = tokio::select! {
                _ = &mut sleep => break,
                cmd = self.rx.recv() => cmd,
            };
            match step {
                None | Some(WorkerCommand::Delete) => return Flow::Exit,
                Some(WorkerCommand::Close { reply }) => {
                    self.close_without_session(reply);
                    return Flow::Continue;
                }
                Some(WorkerCommand::Open) => {}
                Some(WorkerCommand::Test { reply }) => {
                    let _ = reply.send(Err(ConnectError::transient("reconnect in progress")));
                }
                Some(WorkerCommand::Outbound(signal)) => {
                    debug!(
                        connection = %self.connection.id,
                        signal = %signal.name, "not connected, outbound signal dropped"
                    );
                }
            }
        }

        if let Some(gate) = self.gate.clone() {
            match Arc::clone(&gate).try_acquire_owned() {
                Ok(permit) => self.reconnect_permit = Some(permit),
                Err(TryAcquireError::Closed) => return Flow::Exit,
                Err(TryAcquireError::NoPermits) => {
                    self.bus.publish(
                        Event::now(EventKind::ReconnectQueued)
                            .with_connection(&self.connection.id)
                            .with_attempt(self.failure_count),
                    );
                    debug!(
                        connection = %self.connection.id,
                        "reconnect slots exhausted, waiting"
                    );
                    let acquire = gate.acquire_owned();
                    tokio::pin!(acquire);
                    loop {
                        let step = tokio::select! {
                            res = &mut acquire => Gate::Permit(res),
                            cmd = self.rx.recv() => Gate::Command(cmd),
                        };
                        match step {
                            Gate::Permit(Ok(permit)) => {
                                self.reconnect_permit = Some(permit);
                                break;
                            }
                            Gate::Permit(Err(_)) => return Flow::Exit,
                            Gate::Command(None) | Gate::Command(Some(WorkerCommand::Delete)) => {
                                return Flow::Exit;
                            }
                            Gate::Command(Some(WorkerCommand::Close { reply })) => {
                                self.close_without_session(reply);
                                return Flow::Continue;
                            }
                            Gate::Command(Some(WorkerCommand::Open)) => {}
                            Gate::Command(Some(WorkerCommand::Test { reply })) => {
                                let _ = reply
                                    .send(Err(ConnectError::transient("reconnect in progress")));
                            }
                            Gate::Command(Some(WorkerCommand::Outbound(_))) => {}
                        }
                    }
                }
            }
        }

        self.transition(ConnectionState::Connecting, Some("retrying"));
        Flow::Continue
    }

    /// Graceful close: flush within the grace window, then drop.
    async fn disconnect(&mut self, mut session: Box<dyn AdapterSession>) {
        self.transition(ConnectionState::Disconnecting, None);
        match time::timeout(self.config.shutdown_grace, session.close()).await {
            Ok(Ok(())) => {}
            Ok(Err(err)) => {
                warn!(
                    connection = %self.connection.id,
                    error = %err, "session close reported an error"
                );
            }
            Err(_) => {
                warn!(
                    connection = %self.connection.id,
                    grace = ?self.config.shutdown_grace,
                    "close exceeded the grace window, dropping session"
                );
            }
        }
        self.transition(ConnectionState::Closed, None);
    }

    /// One adapter connect attempt under the configured deadline.
    async fn connect_once(&self, dry_run: bool) -> Result<Box<dyn AdapterSession>, ConnectError> {
        match self.config.connect_deadline() {
            Some(deadline) => {
                match time::timeout(deadline, self.adapter.connect(&self.connection, dry_run)).await
                {
                    Ok(result) => result,
                    Err(_) => Err(ConnectError::Timeout { timeout: deadline }),
                }
            }
            None => self.adapter.connect(&self.connection, dry_run).await,
        }
    }

    /// Graceful close with no live session. The trace still walks through
    /// `Disconnecting` even though there is nothing to flush.
    fn close_without_session(&mut self, reply: oneshot::Sender<()>) {
        self.transition(ConnectionState::Disconnecting, Some("close requested"));
        self.transition(ConnectionState::Closed, None);
        let _ = reply.send(());
    }

    /// Session loss bookkeeping: stability reset, then reconnect.
    fn session_lost(&mut self, since: Instant, reason: &str) {
        if since.elapsed() >= self.config.reconnect.stability_window {
            self.failure_count = 0;
        }
        self.schedule_reconnect(reason);
    }

    /// Picks the next backoff delay and enters `Reconnecting`.
    fn schedule_reconnect(&mut self, reason: &str) {
        let delay = self.config.reconnect.next(self.failure_count);
        let attempt = self.failure_count.saturating_add(1);
        self.failure_count = attempt;
        self.pending_delay = delay;

        self.transition(ConnectionState::Reconnecting, Some(reason));
        self.bus.publish(
            Event::now(EventKind::ReconnectScheduled)
                .with_connection(&self.connection.id)
                .with_delay(delay)
                .with_attempt(attempt)
                .with_reason(reason),
        );
    }

    /// Applies a state transition and publishes `StateChanged`.
    fn transition(&mut self, to: ConnectionState, reason: Option<&str>) {
        let prior = *self.state.borrow();
        if prior == to {
            return;
        }
        debug_assert!(
            ConnectionState::transition_allowed(prior, to),
            "illegal transition {prior} -> {to}"
        );
        self.state.send_replace(to);
        info!(
            connection = %self.connection.id,
            from = %prior, to = %to, "connection state changed"
        );
        let mut event = Event::now(EventKind::StateChanged)
            .with_connection(&self.connection.id)
            .with_transition(prior, to);
        if let Some(reason) = reason {
            event = event.with_reason(reason);
        }
        self.bus.publish(event);
    }

    /// Publishes a validation reply to the originator's reply-to address.
    async fn send_reply(&self, session: &mut dyn AdapterSession, reply: Signal) {
        let Some(address) = reply.headers.get(REPLY_TO_HEADER).cloned() else {
            debug!(
                connection = %self.connection.id,
                "rejection reply has no reply-to address, dropped"
            );
            return;
        };
        let payload = match serde_json::to_vec(&reply.payload) {
            Ok(bytes) => bytes,
            Err(err) => {
                warn!(connection = %self.connection.id, error = %err, "reply serialization failed");
                return;
            }
        };
        let message = crate::model::ExternalMessage::new(payload)
            .with_content_type("application/json")
            .with_header("correlation-id", reply.correlation_id.to_string());
        if let Err(err) = session.publish(&address, message).await {
            warn!(
                connection = %self.connection.id,
                address = %address,
                error = %err, "reply publish failed"
            );
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::adapter::MemoryBroker;
    use crate::dispatch::DefaultInterceptor;
    use crate::model::{ConnectionType, Endpoint, Source, Target};
    use crate::policies::ReconnectPolicy;

    fn test_config() -> RuntimeConfig {
        RuntimeConfig {
            reconnect: ReconnectPolicy {
                base: Duration::from_secs(1),
                max: Duration::from_secs(60),
                jitter: 0.2,
                stability_window: Duration::from_secs(10),
            },
            ..RuntimeConfig::default()
        }
    }

    fn routing(broker: &MemoryBroker) -> (RoutingContext, mpsc::Receiver<Signal>, Bus) {
        let _ = broker;
        let (platform_tx, platform_rx) = mpsc::channel(32);
        let bus = Bus::new(256);
        let ctx = RoutingContext {
            bus: bus.clone(),
            mappers: Arc::new(MapperRegistry::new()),
            interceptor: Arc::new(DefaultInterceptor),
            commands: platform_tx,
            reconnect_gate: None,
        };
        (ctx, platform_rx, bus)
    }

    fn open_connection(id: &str) -> Arc<Connection> {
        let mut source = Source::new("in/telemetry", vec!["svc:device".into()]);
        source.mapping = Some("batch".into());
        let mut target = Target::new("out/events", vec!["svc:twin".into()]);
        target.mapping = Some("batch".into());
        Arc::new(
            Connection::builder(id, ConnectionType::Mqtt, Endpoint::anonymous("mem://hub"))
                .source(source)
                .target(target)
                .mapping("batch", "json")
                .desired(DesiredState::Open)
                .build(),
        )
    }

    async fn wait_for(handle: &mut WorkerHandle, state: ConnectionState) {
        handle
            .state
            .wait_for(|s| *s == state)
            .await
            .expect("worker exited before reaching the expected state");
    }

    #[tokio::test(start_paused = true)]
    async fn open_connection_connects_on_launch() {
        let broker = MemoryBroker::new();
        let (ctx, _platform, _bus) = routing(&broker);
        let connection = open_connection("w1");
        let adapter = Arc::new(broker.adapter(ConnectionType::Mqtt));

        let mut handle = ConnectionWorker::launch(connection, adapter, ctx, test_config());
        wait_for(&mut handle, ConnectionState::Connected).await;
        assert!(broker.has_session(&"w1".into()));
    }

    #[tokio::test(start_paused = true)]
    async fn transient_failure_backs_off_then_reconnects() {
        let broker = MemoryBroker::new();
        let (ctx, _platform, bus) = routing(&broker);
        let mut events = bus.subscribe();
        let connection = open_connection("w2");
        broker.script_connect(&connection.id, Err(ConnectError::transient("broker down")));
        let adapter = Arc::new(broker.adapter(ConnectionType::Mqtt));

        let mut handle = ConnectionWorker::launch(connection, adapter, ctx, test_config());
        wait_for(&mut handle, ConnectionState::Connected).await;
        assert_eq!(broker.connect_attempts(&"w2".into()), 2);

        // First attempt of the episode: delay within ±20% of the 1s base.
        let mut scheduled = None;
        while let Ok(ev) = events.try_recv() {
            if ev.kind == EventKind::ReconnectScheduled {
                scheduled = Some(ev);
            }
        }
        let ev = scheduled.expect("reconnect must be scheduled");
        assert_eq!(ev.attempt, Some(1));
        let delay = ev.delay.unwrap();
        assert!(delay >= Duration::from_millis(800) && delay <= Duration::from_millis(1200));
    }

    #[tokio::test(start_paused = true)]
    async fn permanent_failure_parks_in_failed_until_reopened() {
        let broker = MemoryBroker::new();
        let (ctx, _platform, _bus) = routing(&broker);
        let connection = open_connection("w3");
        broker.script_connect(&connection.id, Err(ConnectError::permanent("bad credentials")));
        let adapter = Arc::new(broker.adapter(ConnectionType::Mqtt));

        let mut handle = ConnectionWorker::launch(connection, adapter, ctx, test_config());
        wait_for(&mut handle, ConnectionState::Failed).await;
        assert_eq!(broker.connect_attempts(&"w3".into()), 1);

        // No automatic retry out of Failed; an explicit open recovers.
        handle.commands.send(WorkerCommand::Open).await.unwrap();
        wait_for(&mut handle, ConnectionState::Connected).await;
    }

    #[tokio::test(start_paused = true)]
    async fn session_loss_triggers_reconnect() {
        let broker = MemoryBroker::new();
        let (ctx, _platform, bus) = routing(&broker);
        let mut events = bus.subscribe();
        let connection = open_connection("w4");
        let adapter = Arc::new(broker.adapter(ConnectionType::Mqtt));

        let mut handle = ConnectionWorker::launch(connection, adapter, ctx, test_config());
        wait_for(&mut handle, ConnectionState::Connected).await;

        broker.drop_session(&"w4".into(), "keepalive lost");
        wait_for(&mut handle, ConnectionState::Reconnecting).await;
        wait_for(&mut handle, ConnectionState::Connected).await;
        assert_eq!(broker.connect_attempts(&"w4".into()), 2);

        let mut saw_reconnecting = false;
        while let Ok(ev) = events.try_recv() {
            if ev.kind == EventKind::StateChanged
                && ev.new_state == Some(ConnectionState::Reconnecting)
            {
                saw_reconnecting = true;
            }
        }
        assert!(saw_reconnecting);
    }

    #[tokio::test(start_paused = true)]
    async fn close_acknowledges_after_reaching_closed() {
        let broker = MemoryBroker::new();
        let (ctx, _platform, _bus) = routing(&broker);
        let connection = open_connection("w5");
        let adapter = Arc::new(broker.adapter(ConnectionType::Mqtt));

        let mut handle = ConnectionWorker::launch(connection, adapter, ctx, test_config());
        wait_for(&mut handle, ConnectionState::Connected).await;

        let (tx, rx) = oneshot::channel();
        handle
            .commands
            .send(WorkerCommand::Close { reply: tx })
            .await
            .unwrap();
        rx.await.unwrap();
        assert_eq!(*handle.state.borrow(), ConnectionState::Closed);
        assert!(!broker.has_session(&"w5".into()));
    }

    #[tokio::test(start_paused = true)]
    async fn close_during_backoff_passes_through_disconnecting() {
        let broker = MemoryBroker::new();
        let (ctx, _platform, bus) = routing(&broker);
        let mut events = bus.subscribe();
        let connection = open_connection("w12");
        broker.script_connect(&connection.id, Err(ConnectError::transient("broker down")));
        let adapter = Arc::new(broker.adapter(ConnectionType::Mqtt));

        let mut handle = ConnectionWorker::launch(connection, adapter, ctx, test_config());
        wait_for(&mut handle, ConnectionState::Reconnecting).await;

        let (tx, rx) = oneshot::channel();
        handle
            .commands
            .send(WorkerCommand::Close { reply: tx })
            .await
            .unwrap();
        rx.await.unwrap();
        assert_eq!(*handle.state.borrow(), ConnectionState::Closed);

        // Closing while waiting out the backoff still walks Disconnecting.
        let mut trace = Vec::new();
        while let Ok(ev) = events.try_recv() {
            if ev.kind == EventKind::StateChanged {
                trace.push(ev.new_state.unwrap());
            }
        }
        let tail: Vec<_> = trace
            .iter()
            .skip_while(|s| **s != ConnectionState::Disconnecting)
            .copied()
            .collect();
        assert_eq!(
            tail,
            vec![ConnectionState::Disconnecting, ConnectionState::Closed]
        );
    }

    #[tokio::test(start_paused = true)]
    async fn test_command_probes_without_keeping_a_session() {
        let broker = MemoryBroker::new();
        let (ctx, _platform, _bus) = routing(&broker);
        let connection = Arc::new(
            Connection::builder("w6", ConnectionType::Mqtt, Endpoint::anonymous("mem://hub"))
                .build(),
        );
        let adapter = Arc::new(broker.adapter(ConnectionType::Mqtt));

        let handle = ConnectionWorker::launch(connection, adapter, ctx, test_config());
        let (tx, rx) = oneshot::channel();
        handle
            .commands
            .send(WorkerCommand::Test { reply: tx })
            .await
            .unwrap();
        rx.await.unwrap().unwrap();

        assert_eq!(broker.dry_run_count(), 1);
        assert!(!broker.has_session(&"w6".into()));
        assert_eq!(*handle.state.borrow(), ConnectionState::Uninitialized);
    }

    #[tokio::test(start_paused = true)]
    async fn inbound_traffic_reaches_the_platform_channel() {
        let broker = MemoryBroker::new();
        let (ctx, mut platform, _bus) = routing(&broker);
        let connection = open_connection("w7");
        let adapter = Arc::new(broker.adapter(ConnectionType::Mqtt));

        let mut handle = ConnectionWorker::launch(connection, adapter, ctx, test_config());
        wait_for(&mut handle, ConnectionState::Connected).await;

        broker.inject(
            &"w7".into(),
            0,
            crate::model::ExternalMessage::new(br#"{"temp": 21}"#.to_vec()),
        );
        let signal = platform.recv().await.unwrap();
        assert_eq!(signal.payload["temp"], 21);
        assert_eq!(signal.authorization_subjects, vec!["svc:device".to_string()]);
    }

    #[tokio::test(start_paused = true)]
    async fn outbound_command_publishes_to_matching_targets() {
        let broker = MemoryBroker::new();
        let (ctx, _platform, _bus) = routing(&broker);
        let connection = open_connection("w8");
        let adapter = Arc::new(broker.adapter(ConnectionType::Mqtt));

        let mut handle = ConnectionWorker::launch(connection, adapter, ctx, test_config());
        wait_for(&mut handle, ConnectionState::Connected).await;

        let signal = Signal::event("things.twin.modified", serde_json::json!({"v": 2}))
            .with_subjects(vec!["svc:twin".into()]);
        handle
            .commands
            .send(WorkerCommand::Outbound(signal))
            .await
            .unwrap();

        // The publish lands once the worker serviced the command.
        while broker.published().is_empty() {
            tokio::time::sleep(Duration::from_millis(5)).await;
        }
        let published = broker.published();
        assert_eq!(published.len(), 1);
        assert_eq!(published[0].0, "out/events");
    }

    #[tokio::test(start_paused = true)]
    async fn exhausted_gate_queues_until_a_slot_frees() {
        let broker = MemoryBroker::new();
        let (mut ctx, _platform, bus) = routing(&broker);
        let gate = Arc::new(Semaphore::new(0));
        ctx.reconnect_gate = Some(Arc::clone(&gate));
        let mut events = bus.subscribe();

        let connection = open_connection("w9");
        broker.script_connect(&connection.id, Err(ConnectError::transient("blip")));
        let adapter = Arc::new(broker.adapter(ConnectionType::Mqtt));

        let mut handle = ConnectionWorker::launch(connection, adapter, ctx, test_config());
        wait_for(&mut handle, ConnectionState::Reconnecting).await;

        // Past its own delay the worker still waits for a slot.
        loop {
            let ev = events.recv().await.unwrap();
            if ev.kind == EventKind::ReconnectQueued {
                break;
            }
        }
        assert_eq!(*handle.state.borrow(), ConnectionState::Reconnecting);
        assert_eq!(broker.connect_attempts(&"w9".into()), 1);

        gate.add_permits(1);
        wait_for(&mut handle, ConnectionState::Connected).await;
        assert_eq!(broker.connect_attempts(&"w9".into()), 2);
    }

    #[tokio::test(start_paused = true)]
    async fn stable_uptime_resets_the_failure_count() {
        let broker = MemoryBroker::new();
        let (ctx, _platform, bus) = routing(&broker);
        let mut events = bus.subscribe();
        let connection = open_connection("w11");
        broker.script_connect(&connection.id, Err(ConnectError::transient("blip")));
        let adapter = Arc::new(broker.adapter(ConnectionType::Mqtt));

        let mut handle = ConnectionWorker::launch(connection, adapter, ctx, test_config());
        wait_for(&mut handle, ConnectionState::Connected).await;

        // Stay connected past the stability window, then lose the session.
        tokio::time::sleep(Duration::from_secs(11)).await;
        broker.drop_session(&"w11".into(), "keepalive lost");
        wait_for(&mut handle, ConnectionState::Reconnecting).await;
        wait_for(&mut handle, ConnectionState::Connected).await;

        // Both episodes start from a fresh failure count.
        let mut attempts = Vec::new();
        while let Ok(ev) = events.try_recv() {
            if ev.kind == EventKind::ReconnectScheduled {
                attempts.push(ev.attempt.unwrap());
            }
        }
        assert_eq!(attempts, vec![1, 1]);
    }

    #[tokio::test(start_paused = true)]
    async fn delete_during_backoff_exits_promptly() {
        let broker = MemoryBroker::new();
        let (ctx, _platform, _bus) = routing(&broker);
        let connection = open_connection("w10");
        for _ in 0..8 {
            broker.script_connect(&connection.id, Err(ConnectError::transient("down")));
        }
        let adapter = Arc::new(broker.adapter(ConnectionType::Mqtt));

        let handle = ConnectionWorker::launch(connection, adapter, ctx, test_config());
        handle.commands.send(WorkerCommand::Delete).await.unwrap();
        handle.join.await.unwrap();
    }
}
