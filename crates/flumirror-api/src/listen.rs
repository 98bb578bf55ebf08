//! Change-listener registration and notification delivery.
//!
//! Listeners are registered per node and identified by a caller-chosen
//! [`ListenerId`]. Registration returns a [`Subscription`]; dropping or
//! cancelling it detaches the listener. Transports deliver notifications
//! for every active listener as [`UpstreamEvent::Notify`] on the session's
//! event channel.

use std::fmt;

use dashmap::DashMap;
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;

use crate::node::{NodeId, RemoteNode, RemoteValue};

// ── ListenerId ───────────────────────────────────────────────────────

/// Identity of one registered listener.
///
/// `epoch` is echoed back untouched so the registering side can reject
/// notifications that belong to a connection it has already torn down.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct ListenerId {
    pub epoch: u64,
    pub seq: u64,
}

impl fmt::Display for ListenerId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}:{}", self.epoch, self.seq)
    }
}

// ── Notifications ────────────────────────────────────────────────────

/// A single mutation observed on a node.
#[derive(Debug, Clone)]
pub enum NodeChange {
    /// `key` was overwritten with `value`.
    ValueSet { key: String, value: RemoteValue },
    /// `value` was appended to the list under `key`.
    ChildAdded { key: String, value: RemoteValue },
    /// `value` was removed from the list under `key`.
    ChildRemoved { key: String, value: RemoteValue },
}

impl NodeChange {
    pub fn key(&self) -> &str {
        match self {
            Self::ValueSet { key, .. }
            | Self::ChildAdded { key, .. }
            | Self::ChildRemoved { key, .. } => key,
        }
    }

    /// Hand this change to the matching [`StateListener`] hook.
    pub fn dispatch<L: StateListener + ?Sized>(self, listener: &mut L, id: ListenerId, node: &RemoteNode) {
        match self {
            Self::ValueSet { key, value } => listener.on_value_set(id, node, &key, value),
            Self::ChildAdded { key, value } => listener.on_child_added(id, node, &key, value),
            Self::ChildRemoved { key, value } => listener.on_child_removed(id, node, &key, value),
        }
    }
}

/// Callback contract for node notifications.
pub trait StateListener {
    fn on_value_set(&mut self, id: ListenerId, node: &RemoteNode, key: &str, value: RemoteValue);
    fn on_child_added(&mut self, id: ListenerId, node: &RemoteNode, key: &str, value: RemoteValue);
    fn on_child_removed(&mut self, id: ListenerId, node: &RemoteNode, key: &str, value: RemoteValue);
}

/// A change delivered to one listener.
#[derive(Debug, Clone)]
pub struct Notification {
    pub listener: ListenerId,
    pub node: RemoteNode,
    pub change: NodeChange,
}

/// Everything an upstream session pushes at its owner.
#[derive(Debug, Clone)]
pub enum UpstreamEvent {
    Notify(Notification),
    /// The link dropped. Every node handle from this session is stale.
    Disconnected { reason: String },
}

pub type EventSender = mpsc::UnboundedSender<UpstreamEvent>;
pub type EventReceiver = mpsc::UnboundedReceiver<UpstreamEvent>;

// ── Subscription ─────────────────────────────────────────────────────

/// Handle to an attached listener. Detaches on [`cancel`](Self::cancel) or drop.
#[derive(Debug)]
pub struct Subscription {
    listener: ListenerId,
    node: NodeId,
    token: CancellationToken,
}

impl Subscription {
    pub fn listener(&self) -> ListenerId {
        self.listener
    }

    pub fn node(&self) -> NodeId {
        self.node
    }

    pub fn is_active(&self) -> bool {
        !self.token.is_cancelled()
    }

    pub fn cancel(self) {
        // Drop does the work.
    }
}

impl Drop for Subscription {
    fn drop(&mut self) {
        self.token.cancel();
    }
}

// ── ListenerRegistry ─────────────────────────────────────────────────

/// Transport-side bookkeeping of which listeners watch which node.
///
/// Cancelled subscriptions are pruned lazily, on the next delivery to
/// the same node or on [`active_count`](Self::active_count).
#[derive(Default)]
pub struct ListenerRegistry {
    by_node: DashMap<NodeId, Vec<(ListenerId, CancellationToken)>>,
}

impl ListenerRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn register(&self, node: NodeId, listener: ListenerId) -> Subscription {
        let token = CancellationToken::new();
        self.by_node
            .entry(node)
            .or_default()
            .push((listener, token.clone()));
        Subscription {
            listener,
            node,
            token,
        }
    }

    /// Active listeners on `node`, in registration order.
    pub fn targets(&self, node: NodeId) -> Vec<ListenerId> {
        let Some(mut entry) = self.by_node.get_mut(&node) else {
            return Vec::new();
        };
        entry.retain(|(_, token)| !token.is_cancelled());
        entry.iter().map(|(id, _)| *id).collect()
    }

    /// Deliver `change` on `node` to every active listener through `events`.
    /// Returns how many listeners were notified.
    pub fn deliver(&self, events: &EventSender, node: &RemoteNode, change: &NodeChange) -> usize {
        let targets = self.targets(node.id());
        for listener in &targets {
            let _ = events.send(UpstreamEvent::Notify(Notification {
                listener: *listener,
                node: node.clone(),
                change: change.clone(),
            }));
        }
        targets.len()
    }

    pub fn active_count(&self) -> usize {
        self.by_node.iter_mut().for_each(|mut entry| {
            entry.retain(|(_, token)| !token.is_cancelled());
        });
        self.by_node.iter().map(|entry| entry.len()).sum()
    }

    /// Drop every registration (session teardown).
    pub fn clear(&self) {
        for entry in self.by_node.iter() {
            for (_, token) in entry.iter() {
                token.cancel();
            }
        }
        self.by_node.clear();
    }
}
