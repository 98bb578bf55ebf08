//! The upstream collaborator contract.
//!
//! An [`Upstream`] owns one session with the state owner (the manager):
//! it hands out the root of the state tree, lets callers attach change
//! listeners to any node it returned, fetches per-component detail state
//! on demand and relays remote operations.

use async_trait::async_trait;

use crate::error::Error;
use crate::listen::{EventSender, ListenerId, Subscription};
use crate::node::{RemoteNode, RemoteValue};

/// A remote operation against one component.
#[derive(Debug, Clone, PartialEq)]
pub enum RemoteOp {
    /// Invoke an arbitrary method on the component.
    Call {
        method: String,
        params: Vec<serde_json::Value>,
    },
    Start,
    Stop,
}

impl RemoteOp {
    /// Method name as reported in logs and errors.
    pub fn method(&self) -> &str {
        match self {
            Self::Call { method, .. } => method,
            Self::Start => "componentStart",
            Self::Stop => "componentStop",
        }
    }
}

#[async_trait]
pub trait Upstream: Send + Sync {
    /// Open a session and fetch the root (planet) node.
    ///
    /// Notifications for every listener attached during this session, and
    /// the final [`UpstreamEvent::Disconnected`](crate::UpstreamEvent), are
    /// sent through `events`.
    async fn connect(&self, events: EventSender) -> Result<RemoteNode, Error>;

    /// Attach a listener to `node`. Registration is local and cannot fail;
    /// the listener stays attached until the returned handle is dropped.
    fn watch(&self, node: &RemoteNode, listener: ListenerId) -> Subscription;

    /// Fetch the nested detail state of a component. The transport keeps
    /// the returned tree current until it is passed to [`forget`](Self::forget).
    async fn fetch_detail_state(&self, component: &RemoteNode) -> Result<RemoteNode, Error>;

    /// Stop tracking a detail-state root returned by
    /// [`fetch_detail_state`](Self::fetch_detail_state). Nodes reachable
    /// only through it may be dropped from the transport's cache.
    fn forget(&self, detail: &RemoteNode);

    /// Run `op` against `component` and return its result.
    async fn invoke(&self, component: &RemoteNode, op: RemoteOp) -> Result<RemoteValue, Error>;

    /// Close the session. A `Disconnected` event follows.
    async fn close(&self);
}
