// ── Bridge ──
//
// Public handle plus the single event-loop task that owns every piece of
// mirror state. Remote calls run in helper tasks that post their results
// back to the loop tagged with the epoch they were issued under.

use std::sync::Arc;

use chrono::{DateTime, Utc};
use tokio::sync::broadcast::error::RecvError;
use tokio::sync::{Mutex, broadcast, mpsc, oneshot, watch};
use tokio::task::JoinHandle;
use tokio::time::{Instant, Interval, MissedTickBehavior};
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, trace, warn};

use flumirror_api::{Broker, EventReceiver, InboundMessage, RemoteNode, Upstream, UpstreamEvent};

use crate::command::{CommandKind, CommandOutcome, CommandResult, CommandRouter, ComponentCommand};
use crate::config::BridgeConfig;
use crate::coordinator::{ConnectionState, ReconnectCoordinator};
use crate::error::{CoreError, RouteError};
use crate::model::{Action, ComponentRecord, PollOutcome};
use crate::projection::Projector;
use crate::publisher::{Destinations, Publisher};
use crate::store::{ComponentSnapshot, FetchTicket, PollResponder};
use crate::stream::ComponentStream;
use crate::tree::{Outbound, TreeListenerManager};

type Responder<T> = oneshot::Sender<Result<T, CoreError>>;

/// Requests and helper-task results handled by the event loop.
enum LoopMessage {
    Connect {
        respond: Responder<()>,
    },
    Connected {
        epoch: u64,
        result: Result<RemoteNode, flumirror_api::Error>,
        events: EventReceiver,
        respond: Responder<()>,
    },
    Disconnect {
        respond: oneshot::Sender<()>,
    },
    Poll {
        component: String,
        respond: Option<PollResponder>,
    },
    DetailFetched {
        ticket: FetchTicket,
        result: Result<RemoteNode, flumirror_api::Error>,
    },
    Execute {
        command: ComponentCommand,
        respond: Option<Responder<CommandResult>>,
    },
    Executed {
        epoch: u64,
        kind: CommandKind,
        target: String,
        result: Result<CommandResult, CoreError>,
        respond: Option<Responder<CommandResult>>,
    },
}

/// Mirrors the manager's state tree onto a broker.
///
/// Cheap to clone; clones drive the same event loop. The loop stops when
/// [`shutdown`](Self::shutdown) is called or the last clone is dropped.
#[derive(Clone)]
pub struct Bridge {
    inner: Arc<BridgeInner>,
}

struct BridgeInner {
    config: BridgeConfig,
    commands: mpsc::UnboundedSender<LoopMessage>,
    state: watch::Receiver<ConnectionState>,
    components: watch::Receiver<ComponentSnapshot>,
    last_snapshot: watch::Receiver<Option<DateTime<Utc>>>,
    outcomes: broadcast::Sender<CommandOutcome>,
    cancel: CancellationToken,
    task: Mutex<Option<JoinHandle<()>>>,
}

impl Drop for BridgeInner {
    fn drop(&mut self) {
        self.cancel.cancel();
    }
}

impl Bridge {
    /// Spawn the event loop. Must be called within a tokio runtime.
    /// The bridge starts disconnected; call [`connect`](Self::connect).
    pub fn start(config: BridgeConfig, upstream: Arc<dyn Upstream>, broker: Arc<dyn Broker>) -> Self {
        let (commands, rx) = mpsc::unbounded_channel();
        let (outcomes, _) = broadcast::channel(64);
        let cancel = CancellationToken::new();

        let projector = if config.translate_messages {
            Projector::translating()
        } else {
            Projector::default()
        };
        let coordinator = ReconnectCoordinator::new();
        let tree = TreeListenerManager::new(
            Arc::clone(&upstream),
            projector.clone(),
            config.flow.clone(),
            config.detail_release.clone(),
        );
        let publisher = Publisher::new(Arc::clone(&broker), Destinations::new(&config.prefix));

        let state = coordinator.subscribe();
        let components = tree.subscribe_components();
        let last_snapshot = publisher.subscribe_last_snapshot();

        let event_loop = EventLoop {
            config: config.clone(),
            upstream,
            projector,
            coordinator,
            tree,
            publisher,
            rx,
            tx: commands.clone(),
            events: None,
            inbound: Some(broker.subscribe()),
            timer: None,
            outcomes: outcomes.clone(),
            cancel: cancel.clone(),
        };
        let task = tokio::spawn(event_loop.run());

        Self {
            inner: Arc::new(BridgeInner {
                config,
                commands,
                state,
                components,
                last_snapshot,
                outcomes,
                cancel,
                task: Mutex::new(Some(task)),
            }),
        }
    }

    pub fn config(&self) -> &BridgeConfig {
        &self.inner.config
    }

    // ── Lifecycle ────────────────────────────────────────────────────

    /// Connect to the manager and mirror its state. Resolves once the
    /// mirror is attached and the first snapshot is out, or with the
    /// classified connection error.
    pub async fn connect(&self) -> Result<(), CoreError> {
        let (respond, rx) = oneshot::channel();
        self.send(LoopMessage::Connect { respond })?;
        rx.await.map_err(|_| CoreError::Shutdown)?
    }

    /// Drop the upstream session and empty the mirror.
    pub async fn disconnect(&self) {
        let (respond, rx) = oneshot::channel();
        if self.send(LoopMessage::Disconnect { respond }).is_ok() {
            let _ = rx.await;
        }
    }

    /// Stop the event loop and wait for it to finish.
    pub async fn shutdown(&self) {
        self.inner.cancel.cancel();
        let handle = self.inner.task.lock().await.take();
        if let Some(handle) = handle {
            let _ = handle.await;
        }
    }

    pub fn connection_state(&self) -> ConnectionState {
        *self.inner.state.borrow()
    }

    /// Subscribe to connection state transitions.
    pub fn state_changes(&self) -> watch::Receiver<ConnectionState> {
        self.inner.state.clone()
    }

    // ── Requests ─────────────────────────────────────────────────────

    /// Ensure a detail subscription for `component` and get its snapshot.
    /// The detail fields are also published, as for a broker poll.
    pub async fn poll(&self, component: &str) -> Result<PollOutcome, CoreError> {
        let (respond, rx) = oneshot::channel();
        self.send(LoopMessage::Poll {
            component: component.to_owned(),
            respond: Some(respond),
        })?;
        rx.await.map_err(|_| CoreError::Shutdown)?
    }

    /// Validate and run a command, waiting for the remote outcome.
    pub async fn execute(&self, command: ComponentCommand) -> Result<CommandResult, CoreError> {
        let (respond, rx) = oneshot::channel();
        self.send(LoopMessage::Execute {
            command,
            respond: Some(respond),
        })?;
        rx.await.map_err(|_| CoreError::Shutdown)?
    }

    fn send(&self, message: LoopMessage) -> Result<(), CoreError> {
        self.inner.commands.send(message).map_err(|_| CoreError::Shutdown)
    }

    // ── Observation ──────────────────────────────────────────────────

    pub fn components(&self) -> Arc<Vec<Arc<ComponentRecord>>> {
        self.inner.components.borrow().clone()
    }

    pub fn component(&self, name: &str) -> Option<Arc<ComponentRecord>> {
        self.inner
            .components
            .borrow()
            .iter()
            .find(|record| record.name == name)
            .cloned()
    }

    pub fn component_stream(&self) -> ComponentStream {
        ComponentStream::new(self.inner.components.clone())
    }

    /// Outcomes of every command, whether sent by the broker or through
    /// [`execute`](Self::execute).
    pub fn command_outcomes(&self) -> broadcast::Receiver<CommandOutcome> {
        self.inner.outcomes.subscribe()
    }

    /// When the last full snapshot was published.
    pub fn last_snapshot(&self) -> Option<DateTime<Utc>> {
        *self.inner.last_snapshot.borrow()
    }
}

// ── Event loop ───────────────────────────────────────────────────────

struct EventLoop {
    config: BridgeConfig,
    upstream: Arc<dyn Upstream>,
    projector: Projector,
    coordinator: ReconnectCoordinator,
    tree: TreeListenerManager,
    publisher: Publisher,
    rx: mpsc::UnboundedReceiver<LoopMessage>,
    tx: mpsc::UnboundedSender<LoopMessage>,
    events: Option<EventReceiver>,
    inbound: Option<broadcast::Receiver<InboundMessage>>,
    timer: Option<Interval>,
    outcomes: broadcast::Sender<CommandOutcome>,
    cancel: CancellationToken,
}

impl EventLoop {
    async fn run(mut self) {
        debug!("bridge event loop started");
        loop {
            tokio::select! {
                biased;
                () = self.cancel.cancelled() => break,
                message = self.rx.recv() => match message {
                    Some(message) => self.handle_message(message),
                    None => break,
                },
                event = next_event(&mut self.events) => self.handle_upstream(event),
                inbound = next_inbound(&mut self.inbound) => self.handle_inbound(inbound),
                () = next_tick(&mut self.timer) => self.publish_snapshot(),
            }
        }

        if self.coordinator.is_connected() {
            self.teardown("bridge shut down");
            self.upstream.close().await;
        }
        debug!("bridge event loop stopped");
    }

    fn handle_message(&mut self, message: LoopMessage) {
        match message {
            LoopMessage::Connect { respond } => self.begin_connect(respond),
            LoopMessage::Connected {
                epoch,
                result,
                events,
                respond,
            } => self.finish_connect(epoch, result, events, respond),
            LoopMessage::Disconnect { respond } => self.disconnect(respond),
            LoopMessage::Poll { component, respond } => self.poll(&component, respond),
            LoopMessage::DetailFetched { ticket, result } => {
                if ticket.epoch != self.coordinator.epoch() {
                    debug!(component = %ticket.component, epoch = ticket.epoch, "discarding detail state from an old epoch");
                    if let Ok(detail) = &result {
                        self.upstream.forget(detail);
                    }
                    return;
                }
                self.tree.finish_poll(&ticket, result);
                self.flush();
            }
            LoopMessage::Execute { command, respond } => self.execute(command, respond),
            LoopMessage::Executed {
                epoch,
                kind,
                target,
                result,
                respond,
            } => self.finish_execute(epoch, kind, target, result, respond),
        }
    }

    // ── Connection ───────────────────────────────────────────────────

    fn begin_connect(&mut self, respond: Responder<()>) {
        let epoch = match self.coordinator.begin_connect() {
            Ok(epoch) => epoch,
            Err(e) => {
                let _ = respond.send(Err(e));
                return;
            }
        };

        let (events_tx, events) = mpsc::unbounded_channel();
        let upstream = Arc::clone(&self.upstream);
        let tx = self.tx.clone();
        tokio::spawn(async move {
            let result = upstream.connect(events_tx).await;
            let _ = tx.send(LoopMessage::Connected {
                epoch,
                result,
                events,
                respond,
            });
        });
    }

    fn finish_connect(
        &mut self,
        epoch: u64,
        result: Result<RemoteNode, flumirror_api::Error>,
        events: EventReceiver,
        respond: Responder<()>,
    ) {
        if epoch != self.coordinator.epoch() {
            debug!(epoch, "connect attempt was abandoned");
            if result.is_ok() && self.coordinator.state() == ConnectionState::Disconnected {
                let upstream = Arc::clone(&self.upstream);
                tokio::spawn(async move { upstream.close().await });
            }
            let _ = respond.send(Err(CoreError::NotConnected));
            return;
        }

        let planet = match result {
            Ok(planet) => planet,
            Err(e) => {
                self.coordinator.connect_failed(epoch);
                let err = CoreError::from(e);
                warn!(epoch, error = %err, kind = ?err.connect_failure_kind(), "connection to manager failed");
                let _ = respond.send(Err(err));
                return;
            }
        };

        for waiter in self.tree.attach(planet, epoch) {
            let _ = waiter.send(Err(CoreError::UpstreamLost));
        }
        self.events = Some(events);
        self.coordinator.connected(epoch);

        self.publish_snapshot();
        self.start_timer();
        self.publisher.publish_lifecycle(Action::Connected);
        self.flush();
        info!(epoch, components = self.tree.components().len(), "mirroring manager state");
        let _ = respond.send(Ok(()));
    }

    /// Answers once the upstream session is closed, so a following
    /// connect never races the close.
    fn disconnect(&mut self, respond: oneshot::Sender<()>) {
        match self.coordinator.state() {
            ConnectionState::Connected => {
                self.teardown("disconnect requested");
                let upstream = Arc::clone(&self.upstream);
                tokio::spawn(async move {
                    upstream.close().await;
                    let _ = respond.send(());
                });
                return;
            }
            ConnectionState::Connecting => self.coordinator.reset(),
            ConnectionState::Disconnected => {}
        }
        let _ = respond.send(());
    }

    /// Stop the timer, detach everything and report the loss.
    fn teardown(&mut self, reason: &str) {
        self.events = None;
        self.timer = None;
        for waiter in self.tree.detach_all() {
            let _ = waiter.send(Err(CoreError::UpstreamLost));
        }
        if self.coordinator.disconnected() {
            warn!(reason, "mirror torn down");
            self.publisher.publish_lifecycle(Action::Disconnected);
        }
    }

    fn handle_upstream(&mut self, event: Option<UpstreamEvent>) {
        match event {
            Some(UpstreamEvent::Notify(notification)) => {
                if !self.coordinator.is_live(notification.listener.epoch) {
                    trace!(listener = %notification.listener, "dropping notification from an old epoch");
                    return;
                }
                notification
                    .change
                    .dispatch(&mut self.tree, notification.listener, &notification.node);
                self.flush();
            }
            Some(UpstreamEvent::Disconnected { reason }) => self.teardown(&reason),
            None => self.teardown("upstream event channel closed"),
        }
    }

    // ── Publishing ───────────────────────────────────────────────────

    fn start_timer(&mut self) {
        let period = self.config.snapshot_interval;
        if period.is_zero() {
            self.timer = None;
            return;
        }
        let mut timer = tokio::time::interval_at(Instant::now() + period, period);
        timer.set_missed_tick_behavior(MissedTickBehavior::Delay);
        self.timer = Some(timer);
    }

    fn publish_snapshot(&mut self) {
        let records = self.tree.records();
        self.publisher.publish_snapshot(&records);
    }

    fn flush(&mut self) {
        for item in self.tree.take_outbox() {
            match item {
                Outbound::Change(envelope) => {
                    self.publisher.publish_change(&envelope);
                }
                Outbound::Detail {
                    component,
                    key,
                    value,
                } => {
                    self.publisher.publish_detail(&component, &key, value);
                }
            }
        }
    }

    // ── Polls and commands ───────────────────────────────────────────

    fn poll(&mut self, component: &str, respond: Option<PollResponder>) {
        if !self.coordinator.is_connected() {
            debug!(component, "poll while disconnected");
            if let Some(respond) = respond {
                let _ = respond.send(Err(CoreError::NotConnected));
            }
            return;
        }

        if let Some((ticket, node)) = self.tree.begin_poll(component, respond) {
            let upstream = Arc::clone(&self.upstream);
            let tx = self.tx.clone();
            tokio::spawn(async move {
                let result = upstream.fetch_detail_state(&node).await;
                let _ = tx.send(LoopMessage::DetailFetched { ticket, result });
            });
        }
        self.flush();
    }

    fn execute(&mut self, command: ComponentCommand, respond: Option<Responder<CommandResult>>) {
        let kind = command.kind();
        let target = command.target();

        if !self.coordinator.is_connected() {
            self.reject(Some(kind), target, RouteError::NotConnected, respond);
            return;
        }
        let dispatch = match CommandRouter::resolve(command, self.tree.components()) {
            Ok(dispatch) => dispatch,
            Err(e) => {
                self.reject(Some(kind), target, e, respond);
                return;
            }
        };

        let epoch = self.coordinator.epoch();
        let upstream = Arc::clone(&self.upstream);
        let projector = self.projector.clone();
        let tx = self.tx.clone();
        tokio::spawn(async move {
            let result = CommandRouter::run(upstream, projector, dispatch).await;
            let _ = tx.send(LoopMessage::Executed {
                epoch,
                kind,
                target,
                result,
                respond,
            });
        });
    }

    /// Report a finished command, unless the session it ran in is gone.
    fn finish_execute(
        &self,
        epoch: u64,
        kind: CommandKind,
        target: String,
        result: Result<CommandResult, CoreError>,
        respond: Option<Responder<CommandResult>>,
    ) {
        if !self.coordinator.is_live(epoch) {
            debug!(command = %kind, target = %target, epoch, "discarding command outcome from an old epoch");
            if let Some(respond) = respond {
                let _ = respond.send(Err(CoreError::UpstreamLost));
            }
            return;
        }

        let _ = self.outcomes.send(CommandOutcome {
            kind: Some(kind),
            target,
            result: result.as_ref().cloned().map_err(ToString::to_string),
        });
        if let Some(respond) = respond {
            let _ = respond.send(result);
        }
    }

    fn reject(
        &self,
        kind: Option<CommandKind>,
        target: String,
        error: RouteError,
        respond: Option<Responder<CommandResult>>,
    ) {
        warn!(command = ?kind, target = %target, error = %error, "command rejected");
        let _ = self.outcomes.send(CommandOutcome {
            kind,
            target,
            result: Err(error.to_string()),
        });
        if let Some(respond) = respond {
            let _ = respond.send(Err(CoreError::Rejected(error)));
        }
    }

    fn handle_inbound(&mut self, inbound: Result<InboundMessage, RecvError>) {
        let message = match inbound {
            Ok(message) => message,
            Err(RecvError::Lagged(skipped)) => {
                warn!(skipped, "inbound messages dropped; the bridge fell behind");
                return;
            }
            Err(RecvError::Closed) => {
                warn!("broker inbound channel closed");
                self.inbound = None;
                return;
            }
        };

        if message.destination == self.config.poll_destination {
            match poll_target(&message.body) {
                Some(component) => self.poll(&component, None),
                None => warn!(body = %message.body, "poll request without a component name"),
            }
        } else if message.destination == self.config.command_destination {
            match CommandRouter::parse(&message.body) {
                Ok(command) => self.execute(command, None),
                Err(e) => self.reject(None, String::new(), e, None),
            }
        } else {
            trace!(destination = %message.destination, "ignoring message");
        }
    }
}

/// Component name from a poll body: the bare name, or a JSON string.
fn poll_target(body: &str) -> Option<String> {
    let body = body.trim();
    let name = if body.starts_with('"') {
        serde_json::from_str::<String>(body).ok()?
    } else {
        body.to_owned()
    };
    let name = name.trim();
    (!name.is_empty()).then(|| name.to_owned())
}

async fn next_event(events: &mut Option<EventReceiver>) -> Option<UpstreamEvent> {
    match events {
        Some(rx) => rx.recv().await,
        None => std::future::pending().await,
    }
}

async fn next_inbound(
    inbound: &mut Option<broadcast::Receiver<InboundMessage>>,
) -> Result<InboundMessage, RecvError> {
    match inbound {
        Some(rx) => rx.recv().await,
        None => std::future::pending().await,
    }
}

async fn next_tick(timer: &mut Option<Interval>) {
    match timer {
        Some(timer) => {
            timer.tick().await;
        }
        None => std::future::pending::<()>().await,
    }
}
