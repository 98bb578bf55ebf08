//! In-process [`Upstream`] backed by a scriptable state tree.
//!
//! Used by tests. Every mutation helper
//! applies the change to the cached node and delivers it to the listeners
//! attached to that node, exactly like a wire transport would.

use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex, PoisonError};

use async_trait::async_trait;
use dashmap::{DashMap, DashSet};
use tokio::sync::watch;

use crate::error::{ConnectFailureKind, Error};
use crate::listen::{EventSender, ListenerId, ListenerRegistry, NodeChange, Subscription, UpstreamEvent};
use crate::node::{Fields, NodeId, RemoteNode, RemoteValue};
use crate::upstream::{RemoteOp, Upstream};

/// A remote operation recorded by [`MemoryUpstream`].
#[derive(Debug, Clone, PartialEq)]
pub struct RecordedCall {
    pub component: String,
    pub op: RemoteOp,
}

/// Scriptable in-memory upstream. Cheap to clone; clones share state.
#[derive(Clone)]
pub struct MemoryUpstream {
    inner: Arc<Inner>,
}

struct Inner {
    planet: RemoteNode,
    listeners: ListenerRegistry,
    events: Mutex<Option<EventSender>>,
    connect_failure: Mutex<Option<(ConnectFailureKind, String)>>,
    detail_states: DashMap<NodeId, RemoteNode>,
    detail_failures: DashMap<NodeId, String>,
    /// Detail roots handed out and not yet forgotten.
    held_details: DashSet<NodeId>,
    invoke_failures: DashMap<String, String>,
    calls: Mutex<Vec<RecordedCall>>,
    detail_fetches: AtomicUsize,
    connects: AtomicUsize,
    /// `true` while detail fetches may complete.
    detail_gate: watch::Sender<bool>,
    /// `true` while invocations may complete.
    invoke_gate: watch::Sender<bool>,
}

impl Default for MemoryUpstream {
    fn default() -> Self {
        Self::new()
    }
}

impl MemoryUpstream {
    /// An upstream with an empty planet.
    pub fn new() -> Self {
        let planet = RemoteNode::from_pairs([
            ("name", RemoteValue::from("planet")),
            ("flows", RemoteValue::List(Vec::new())),
        ]);
        let (detail_gate, _) = watch::channel(true);
        let (invoke_gate, _) = watch::channel(true);

        Self {
            inner: Arc::new(Inner {
                planet,
                listeners: ListenerRegistry::new(),
                events: Mutex::new(None),
                connect_failure: Mutex::new(None),
                detail_states: DashMap::new(),
                detail_failures: DashMap::new(),
                held_details: DashSet::new(),
                invoke_failures: DashMap::new(),
                calls: Mutex::new(Vec::new()),
                detail_fetches: AtomicUsize::new(0),
                connects: AtomicUsize::new(0),
                detail_gate,
                invoke_gate,
            }),
        }
    }

    pub fn planet(&self) -> RemoteNode {
        self.inner.planet.clone()
    }

    // ── Tree scripting ───────────────────────────────────────────────

    /// Append a new, empty flow to the planet.
    pub fn add_flow(&self, name: &str) -> RemoteNode {
        let flow = RemoteNode::from_pairs([
            ("name", RemoteValue::from(name)),
            ("components", RemoteValue::List(Vec::new())),
            ("parent", RemoteValue::Node(self.inner.planet.clone())),
        ]);
        self.append(&self.inner.planet, "flows", flow.clone().into());
        flow
    }

    pub fn remove_flow(&self, flow: &RemoteNode) {
        self.remove(&self.inner.planet, "flows", &flow.clone().into());
    }

    /// Append a component with the given name and mood to `flow`.
    pub fn add_component(&self, flow: &RemoteNode, name: &str, mood: i64) -> RemoteNode {
        let component = Self::component(flow, name, mood);
        self.append(flow, "components", component.clone().into());
        component
    }

    /// Build a component node without attaching it to the tree.
    pub fn component(flow: &RemoteNode, name: &str, mood: i64) -> RemoteNode {
        RemoteNode::from_pairs([
            ("name", RemoteValue::from(name)),
            ("mood", RemoteValue::from(mood)),
            ("workerName", RemoteValue::from("localhost")),
            ("messages", RemoteValue::List(Vec::new())),
            ("parent", RemoteValue::Node(flow.clone())),
        ])
    }

    pub fn remove_component(&self, flow: &RemoteNode, component: &RemoteNode) {
        self.remove(flow, "components", &component.clone().into());
    }

    /// Overwrite a field and notify listeners on `node`.
    pub fn set(&self, node: &RemoteNode, key: &str, value: RemoteValue) {
        node.set(key, value.clone());
        self.deliver(node, &NodeChange::ValueSet {
            key: key.to_owned(),
            value,
        });
    }

    /// Append to a list field and notify listeners on `node`.
    pub fn append(&self, node: &RemoteNode, key: &str, value: RemoteValue) {
        node.append(key, value.clone());
        self.deliver(node, &NodeChange::ChildAdded {
            key: key.to_owned(),
            value,
        });
    }

    /// Remove from a list field and notify listeners on `node`.
    pub fn remove(&self, node: &RemoteNode, key: &str, value: &RemoteValue) {
        if node.remove(key, value) {
            self.deliver(node, &NodeChange::ChildRemoved {
                key: key.to_owned(),
                value: value.clone(),
            });
        }
    }

    /// Detail state returned by [`Upstream::fetch_detail_state`] for `component`.
    pub fn set_detail_state(&self, component: &RemoteNode, detail: RemoteNode) {
        self.inner.detail_failures.remove(&component.id());
        self.inner.detail_states.insert(component.id(), detail);
    }

    /// Make detail fetches for `component` fail with `message`.
    pub fn fail_detail_state(&self, component: &RemoteNode, message: &str) {
        self.inner
            .detail_failures
            .insert(component.id(), message.to_owned());
    }

    /// Make every invocation of `method` fail with `message`.
    pub fn fail_invocations(&self, method: &str, message: &str) {
        self.inner
            .invoke_failures
            .insert(method.to_owned(), message.to_owned());
    }

    /// Make the next [`Upstream::connect`] fail.
    pub fn fail_next_connect(&self, kind: ConnectFailureKind, message: &str) {
        *lock(&self.inner.connect_failure) = Some((kind, message.to_owned()));
    }

    /// Block detail fetches until [`release_detail_fetches`](Self::release_detail_fetches).
    pub fn hold_detail_fetches(&self) {
        self.inner.detail_gate.send_replace(false);
    }

    pub fn release_detail_fetches(&self) {
        self.inner.detail_gate.send_replace(true);
    }

    /// Block invocations after they are recorded, until
    /// [`release_invocations`](Self::release_invocations).
    pub fn hold_invocations(&self) {
        self.inner.invoke_gate.send_replace(false);
    }

    pub fn release_invocations(&self) {
        self.inner.invoke_gate.send_replace(true);
    }

    /// Simulate the link dropping: listeners are discarded and the
    /// session owner receives `Disconnected`.
    pub fn drop_connection(&self, reason: &str) {
        self.inner.listeners.clear();
        self.inner.held_details.clear();
        if let Some(events) = lock(&self.inner.events).take() {
            let _ = events.send(UpstreamEvent::Disconnected {
                reason: reason.to_owned(),
            });
        }
    }

    // ── Inspection ───────────────────────────────────────────────────

    pub fn is_connected(&self) -> bool {
        lock(&self.inner.events).is_some()
    }

    pub fn connect_count(&self) -> usize {
        self.inner.connects.load(Ordering::SeqCst)
    }

    pub fn detail_fetch_count(&self) -> usize {
        self.inner.detail_fetches.load(Ordering::SeqCst)
    }

    /// Detail roots fetched and not yet passed to [`Upstream::forget`].
    pub fn held_detail_states(&self) -> usize {
        self.inner.held_details.len()
    }

    pub fn active_listeners(&self) -> usize {
        self.inner.listeners.active_count()
    }

    /// Active listeners attached to one node.
    pub fn listeners_on(&self, node: &RemoteNode) -> usize {
        self.inner.listeners.targets(node.id()).len()
    }

    pub fn calls(&self) -> Vec<RecordedCall> {
        lock(&self.inner.calls).clone()
    }

    /// Send a notification tagged with an arbitrary listener id, bypassing
    /// the registry. Lets tests replay notifications from a dead session.
    pub fn inject(&self, listener: ListenerId, node: &RemoteNode, change: NodeChange) {
        if let Some(events) = lock(&self.inner.events).as_ref() {
            let _ = events.send(UpstreamEvent::Notify(crate::listen::Notification {
                listener,
                node: node.clone(),
                change,
            }));
        }
    }

    fn deliver(&self, node: &RemoteNode, change: &NodeChange) {
        if let Some(events) = lock(&self.inner.events).as_ref() {
            self.inner.listeners.deliver(events, node, change);
        }
    }
}

fn lock<T>(mutex: &Mutex<T>) -> std::sync::MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(PoisonError::into_inner)
}

#[async_trait]
impl Upstream for MemoryUpstream {
    async fn connect(&self, events: EventSender) -> Result<RemoteNode, Error> {
        self.inner.connects.fetch_add(1, Ordering::SeqCst);

        if let Some((kind, message)) = lock(&self.inner.connect_failure).take() {
            return Err(match kind {
                ConnectFailureKind::Refused => Error::ConnectionRefused { message },
                ConnectFailureKind::TransportFailed => Error::ConnectionFailed { message },
                ConnectFailureKind::Other => Error::Remote {
                    method: "getPlanetState".into(),
                    message,
                },
            });
        }

        *lock(&self.inner.events) = Some(events);
        Ok(self.inner.planet.clone())
    }

    fn watch(&self, node: &RemoteNode, listener: ListenerId) -> Subscription {
        self.inner.listeners.register(node.id(), listener)
    }

    async fn fetch_detail_state(&self, component: &RemoteNode) -> Result<RemoteNode, Error> {
        self.inner.detail_fetches.fetch_add(1, Ordering::SeqCst);

        let mut gate = self.inner.detail_gate.subscribe();
        if gate.wait_for(|open| *open).await.is_err() {
            return Err(Error::Disconnected);
        }

        if let Some(message) = self.inner.detail_failures.get(&component.id()) {
            return Err(Error::Remote {
                method: "getUIState".into(),
                message: message.value().clone(),
            });
        }

        let detail = self
            .inner
            .detail_states
            .get(&component.id())
            .map(|detail| detail.value().clone())
            .ok_or_else(|| Error::Remote {
                method: "getUIState".into(),
                message: format!(
                    "component {} has no detail state",
                    component.name().unwrap_or_default()
                ),
            })?;
        self.inner.held_details.insert(detail.id());
        Ok(detail)
    }

    fn forget(&self, detail: &RemoteNode) {
        self.inner.held_details.remove(&detail.id());
    }

    async fn invoke(&self, component: &RemoteNode, op: RemoteOp) -> Result<RemoteValue, Error> {
        lock(&self.inner.calls).push(RecordedCall {
            component: component.name().unwrap_or_default(),
            op: op.clone(),
        });

        let mut gate = self.inner.invoke_gate.subscribe();
        if gate.wait_for(|open| *open).await.is_err() {
            return Err(Error::Disconnected);
        }

        if let Some(message) = self.inner.invoke_failures.get(op.method()) {
            return Err(Error::Remote {
                method: op.method().to_owned(),
                message: message.value().clone(),
            });
        }

        Ok(RemoteValue::Scalar(serde_json::Value::Null))
    }

    async fn close(&self) {
        self.drop_connection("closed by client");
    }
}

/// Build a detail-state node from `(key, value)` pairs.
pub fn detail_state<K, V, I>(pairs: I) -> RemoteNode
where
    K: Into<String>,
    V: Into<RemoteValue>,
    I: IntoIterator<Item = (K, V)>,
{
    RemoteNode::new(
        pairs
            .into_iter()
            .map(|(k, v)| (k.into(), v.into()))
            .collect::<Fields>(),
    )
}
