//! Websocket client for the streaming-server manager.
//!
//! Requests are JSON objects `{"id", "method", "params"}` answered by
//! `{"id", "result"}` or `{"id", "error": {"kind", "message"}}`. The
//! manager also pushes state notifications
//! `{"notify": "set"|"append"|"remove", "node", "key", "value"}` for the
//! nodes it has handed out; the client applies them to its node cache and
//! relays them to the listeners attached to that node.
//!
//! The cache holds what is reachable from its roots: the planet and every
//! detail state handed out and not yet forgotten. Nodes that drop out of
//! that set are evicted as soon as a notification or a `forget` detaches
//! them.

use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use std::time::Duration;

use async_trait::async_trait;
use dashmap::DashMap;
use futures_util::{Sink, SinkExt, Stream, StreamExt};
use secrecy::{ExposeSecret, SecretString};
use serde::Deserialize;
use serde_json::{Value, json};
use tokio::sync::{mpsc, oneshot};
use tokio::task::JoinHandle;
use tokio_tungstenite::tungstenite;
use tokio_util::sync::CancellationToken;
use url::Url;

use crate::error::Error;
use crate::listen::{EventSender, ListenerId, ListenerRegistry, NodeChange, Subscription, UpstreamEvent};
use crate::node::{NodeId, RemoteNode, RemoteValue};
use crate::upstream::{RemoteOp, Upstream};
use crate::wire::{self, NodeCache};

/// How to reach and authenticate against the manager.
#[derive(Debug, Clone)]
pub struct ManagerConfig {
    /// Websocket endpoint, e.g. `ws://localhost:7531/manager`.
    pub url: Url,
    pub username: String,
    pub password: SecretString,
    /// Per-request timeout.
    pub timeout: Duration,
}

// Replies are decoded on the socket task, so node handles in a reply exist
// before any notification that follows it is applied.
type Reply = Result<RemoteValue, Error>;

/// [`Upstream`] over the manager websocket protocol.
///
/// One client serves one session at a time; `connect` after a
/// disconnect starts a fresh session with an empty node cache.
pub struct ManagerClient {
    config: ManagerConfig,
    shared: Arc<Shared>,
}

struct Shared {
    nodes: NodeCache,
    /// Cache roots by id. Locked for every cache mutation, so an eviction
    /// never runs between decoding a subtree and attaching it.
    roots: Mutex<HashMap<NodeId, Root>>,
    listeners: ListenerRegistry,
    pending: DashMap<u64, Pending>,
    next_request: AtomicU64,
    next_generation: AtomicU64,
    session: Mutex<Option<Session>>,
}

struct Root {
    node: RemoteNode,
    /// Replies that handed this node out, minus `forget` calls.
    holds: usize,
}

struct Pending {
    method: String,
    /// Keep the decoded node as a cache root.
    retain: bool,
    reply: oneshot::Sender<Reply>,
}

struct Session {
    generation: u64,
    outbound: mpsc::UnboundedSender<String>,
    cancel: CancellationToken,
    /// Socket task; `close` waits on it so teardown has run on return.
    pump: Option<JoinHandle<()>>,
    /// Set once the handshake succeeded; notifications flow only after that.
    events: Option<EventSender>,
}

impl ManagerClient {
    pub fn new(config: ManagerConfig) -> Self {
        Self {
            config,
            shared: Arc::new(Shared {
                nodes: NodeCache::new(),
                roots: Mutex::new(HashMap::new()),
                listeners: ListenerRegistry::new(),
                pending: DashMap::new(),
                next_request: AtomicU64::new(1),
                next_generation: AtomicU64::new(1),
                session: Mutex::new(None),
            }),
        }
    }

    pub fn config(&self) -> &ManagerConfig {
        &self.config
    }

    /// Number of nodes currently cached for the open session.
    pub fn cached_nodes(&self) -> usize {
        self.shared.nodes.len()
    }

    /// Issue one request and wait for its reply.
    async fn request(&self, method: &str, params: Value, retain: bool) -> Reply {
        let id = self.shared.next_request.fetch_add(1, Ordering::Relaxed);
        let body = json!({ "id": id, "method": method, "params": params }).to_string();

        let (tx, rx) = oneshot::channel();
        self.shared.pending.insert(id, Pending {
            method: method.to_owned(),
            retain,
            reply: tx,
        });

        let sent = self
            .shared
            .session()
            .as_ref()
            .is_some_and(|session| session.outbound.send(body).is_ok());
        if !sent {
            self.shared.pending.remove(&id);
            return Err(Error::Disconnected);
        }

        tracing::debug!(id, method, "manager request");
        match tokio::time::timeout(self.config.timeout, rx).await {
            Ok(Ok(reply)) => reply,
            Ok(Err(_)) => Err(Error::Disconnected),
            Err(_) => {
                self.shared.pending.remove(&id);
                Err(Error::Timeout {
                    timeout_secs: self.config.timeout.as_secs(),
                })
            }
        }
    }

    async fn handshake(&self) -> Result<RemoteNode, Error> {
        self.request(
            "authenticate",
            json!({
                "username": self.config.username,
                "password": self.config.password.expose_secret(),
            }),
            false,
        )
        .await?;

        let planet = self.request("getPlanetState", json!({}), true).await?;
        expect_node("getPlanetState", planet)
    }

    /// Install a fresh session around `ws` and start its socket task.
    /// Whatever the previous session left in the cache is dropped.
    fn start_session<S>(&self, ws: S) -> (u64, CancellationToken)
    where
        S: Stream<Item = Result<tungstenite::Message, tungstenite::Error>>
            + Sink<tungstenite::Message, Error = tungstenite::Error>
            + Send
            + 'static,
    {
        let (outbound, outbound_rx) = mpsc::unbounded_channel();
        let cancel = CancellationToken::new();
        let generation = self.shared.next_generation.fetch_add(1, Ordering::Relaxed);

        {
            let mut roots = self.shared.roots();
            roots.clear();
            self.shared.nodes.clear();
            self.shared.listeners.clear();
            let previous = self.shared.session().replace(Session {
                generation,
                outbound,
                cancel: cancel.clone(),
                pump: None,
                events: None,
            });
            if let Some(previous) = previous {
                tracing::debug!(generation = previous.generation, "replacing an open manager session");
                previous.cancel.cancel();
            }
        }

        let pump = tokio::spawn(pump(Arc::clone(&self.shared), generation, ws, outbound_rx, cancel.clone()));
        if let Some(session) = self
            .shared
            .session()
            .as_mut()
            .filter(|session| session.generation == generation)
        {
            session.pump = Some(pump);
        }
        (generation, cancel)
    }
}

impl Shared {
    fn session(&self) -> MutexGuard<'_, Option<Session>> {
        self.session.lock().unwrap_or_else(PoisonError::into_inner)
    }

    // Lock order: `roots` before `session`.
    fn roots(&self) -> MutexGuard<'_, HashMap<NodeId, Root>> {
        self.roots.lock().unwrap_or_else(PoisonError::into_inner)
    }

    fn is_current(&self, generation: u64) -> bool {
        self.session()
            .as_ref()
            .is_some_and(|session| session.generation == generation)
    }

    /// Evict everything no root reaches any more.
    fn sweep(&self, roots: &HashMap<NodeId, Root>) {
        let evicted = self.nodes.retain_reachable(roots.values().map(|root| &root.node));
        if evicted > 0 {
            tracing::trace!(evicted, cached = self.nodes.len(), "evicted detached nodes");
        }
    }

    fn handle_incoming(&self, generation: u64, text: &str) {
        let incoming: Incoming = match serde_json::from_str(text) {
            Ok(incoming) => incoming,
            Err(e) => {
                tracing::debug!(error = %e, "unparseable manager frame");
                return;
            }
        };

        match incoming {
            Incoming::Reply(reply) => self.complete(generation, reply),
            Incoming::Notify(notify) => self.apply(generation, notify),
        }
    }

    fn complete(&self, generation: u64, reply: ReplyFrame) {
        let Some((_, pending)) = self.pending.remove(&reply.id) else {
            tracing::debug!(id = reply.id, "reply for unknown request");
            return;
        };

        let result = match reply.error {
            None => self.decode_reply(generation, reply.result, pending.retain),
            Some(failure) => Err(match failure.kind {
                FailureKind::Refused => Error::ConnectionRefused {
                    message: failure.message,
                },
                FailureKind::Failed => Error::ConnectionFailed {
                    message: failure.message,
                },
                FailureKind::Remote => Error::Remote {
                    method: pending.method,
                    message: failure.message,
                },
            }),
        };

        // Nobody is waiting any more; do not keep the tree alive for them.
        if let Err(Ok(RemoteValue::Node(node))) = pending.reply.send(result) {
            if pending.retain {
                self.release_root(&node);
            }
        }
    }

    fn decode_reply(&self, generation: u64, value: Value, retain: bool) -> Reply {
        let mut roots = self.roots();
        if !self.is_current(generation) {
            return Err(Error::Disconnected);
        }
        let decoded = wire::decode_value(value, &self.nodes)?;
        if let (true, RemoteValue::Node(node)) = (retain, &decoded) {
            roots
                .entry(node.id())
                .or_insert_with(|| Root {
                    node: node.clone(),
                    holds: 0,
                })
                .holds += 1;
        }
        Ok(decoded)
    }

    /// Drop one hold on `node`; the subtree goes once nothing holds it.
    /// Handles from an earlier session are ignored.
    fn release_root(&self, node: &RemoteNode) {
        let mut roots = self.roots();
        let Some(root) = roots.get_mut(&node.id()) else {
            return;
        };
        if !root.node.same_handle(node) {
            return;
        }
        root.holds = root.holds.saturating_sub(1);
        if root.holds == 0 {
            roots.remove(&node.id());
            self.sweep(&roots);
        }
    }

    fn apply(&self, generation: u64, notify: NotifyFrame) {
        let Some((node, change)) = self.apply_to_cache(generation, notify) else {
            return;
        };
        let events = self.session().as_ref().and_then(|s| s.events.clone());
        if let Some(events) = events {
            self.listeners.deliver(&events, &node, &change);
        }
    }

    fn apply_to_cache(&self, generation: u64, notify: NotifyFrame) -> Option<(RemoteNode, NodeChange)> {
        let roots = self.roots();
        if !self.is_current(generation) {
            tracing::trace!(generation, "notification from a closed session");
            return None;
        }
        let Some(node) = self.nodes.get(NodeId(notify.node)) else {
            tracing::debug!(node = notify.node, "notification for unknown node");
            return None;
        };
        let value = match wire::decode_value(notify.value, &self.nodes) {
            Ok(value) => value,
            Err(e) => {
                tracing::warn!(error = %e, node = %node.id(), key = %notify.key, "dropping notification");
                return None;
            }
        };

        let key = notify.key;
        let change = match notify.notify {
            NotifyKind::Set => {
                let replaced = node.get(&key);
                node.set(&key, value.clone());
                if replaced.is_some_and(|old| holds_nodes(&old)) {
                    self.sweep(&roots);
                }
                NodeChange::ValueSet { key, value }
            }
            NotifyKind::Append => {
                node.append(&key, value.clone());
                NodeChange::ChildAdded { key, value }
            }
            NotifyKind::Remove => {
                if !node.remove(&key, &value) {
                    tracing::debug!(node = %node.id(), key = %key, "remove of absent value");
                }
                // Also drops entries decoding an unknown reference created.
                self.sweep(&roots);
                NodeChange::ChildRemoved { key, value }
            }
        };
        Some((node, change))
    }

    /// End the session: fail outstanding requests, drop listeners and the
    /// node cache, and tell the session owner.
    /// A late teardown from an older session's socket task is ignored.
    fn teardown(&self, generation: u64, reason: &str) {
        let session = {
            let mut current = self.session();
            match current.as_ref() {
                Some(s) if s.generation != generation => return,
                Some(_) => current.take(),
                None => None,
            }
        };

        let ids: Vec<u64> = self.pending.iter().map(|entry| *entry.key()).collect();
        for id in ids {
            if let Some((_, pending)) = self.pending.remove(&id) {
                let _ = pending.reply.send(Err(Error::Disconnected));
            }
        }
        self.listeners.clear();
        {
            let mut roots = self.roots();
            roots.clear();
            self.nodes.clear();
        }

        if let Some(events) = session.and_then(|s| s.events) {
            tracing::info!(reason, "manager session ended");
            let _ = events.send(UpstreamEvent::Disconnected {
                reason: reason.to_owned(),
            });
        }
    }
}

fn holds_nodes(value: &RemoteValue) -> bool {
    let mut nodes = Vec::new();
    value.collect_nodes(&mut nodes);
    !nodes.is_empty()
}

#[async_trait]
impl Upstream for ManagerClient {
    async fn connect(&self, events: EventSender) -> Result<RemoteNode, Error> {
        let url = &self.config.url;
        tracing::info!(url = %url, user = %self.config.username, "connecting to manager");

        let (ws, _response) = tokio::time::timeout(self.config.timeout, tokio_tungstenite::connect_async(url.as_str()))
            .await
            .map_err(|_| Error::Timeout {
                timeout_secs: self.config.timeout.as_secs(),
            })?
            .map_err(|e| Error::ConnectionFailed { message: e.to_string() })?;

        let (generation, cancel) = self.start_session(ws);

        match self.handshake().await {
            Ok(planet) => {
                if let Some(session) = self.shared.session().as_mut() {
                    session.events = Some(events);
                }
                tracing::info!(planet = %planet.id(), "manager session established");
                Ok(planet)
            }
            Err(e) => {
                cancel.cancel();
                self.shared.teardown(generation, "handshake failed");
                Err(match e {
                    Error::Disconnected => Error::ConnectionFailed {
                        message: "manager closed the connection during the handshake".into(),
                    },
                    other => other,
                })
            }
        }
    }

    fn watch(&self, node: &RemoteNode, listener: ListenerId) -> Subscription {
        self.shared.listeners.register(node.id(), listener)
    }

    async fn fetch_detail_state(&self, component: &RemoteNode) -> Result<RemoteNode, Error> {
        let reply = self
            .request(
                "componentCallRemote",
                json!({ "component": wire::node_ref(component), "method": "getUIState", "args": [] }),
                true,
            )
            .await?;
        expect_node("getUIState", reply)
    }

    fn forget(&self, detail: &RemoteNode) {
        self.shared.release_root(detail);
    }

    async fn invoke(&self, component: &RemoteNode, op: RemoteOp) -> Result<RemoteValue, Error> {
        let target = wire::node_ref(component);
        let (method, params) = match op {
            RemoteOp::Call { method, params } => (
                "componentCallRemote",
                json!({ "component": target, "method": method, "args": params }),
            ),
            RemoteOp::Start => ("componentStart", json!({ "component": target })),
            RemoteOp::Stop => ("componentStop", json!({ "component": target })),
        };
        self.request(method, params, false).await
    }

    /// Returns once the socket task has torn the session down.
    async fn close(&self) {
        let (cancel, pump) = {
            let mut session = self.shared.session();
            match session.as_mut() {
                Some(s) => (s.cancel.clone(), s.pump.take()),
                None => return,
            }
        };
        cancel.cancel();
        if let Some(pump) = pump {
            if let Err(e) = pump.await {
                tracing::warn!(error = %e, "manager socket task failed");
            }
        }
    }
}

fn expect_node(method: &str, value: RemoteValue) -> Result<RemoteNode, Error> {
    match value {
        RemoteValue::Node(node) => Ok(node),
        other => Err(Error::UnexpectedReply {
            method: method.to_owned(),
            message: format!("expected a state node, got {:?}", other.shape()),
        }),
    }
}

/// Single task owning the socket: writes queued requests, reads replies
/// and notifications, and tears the session down when the link ends.
async fn pump<S>(
    shared: Arc<Shared>,
    generation: u64,
    ws: S,
    mut outbound: mpsc::UnboundedReceiver<String>,
    cancel: CancellationToken,
) where
    S: Stream<Item = Result<tungstenite::Message, tungstenite::Error>>
        + Sink<tungstenite::Message, Error = tungstenite::Error>
        + Send
        + 'static,
{
    let (mut write, mut read) = ws.split();

    let reason = loop {
        tokio::select! {
            biased;
            () = cancel.cancelled() => {
                let _ = write.close().await;
                break "closed by client".to_owned();
            }
            request = outbound.recv() => {
                let Some(request) = request else {
                    break "client dropped".to_owned();
                };
                if let Err(e) = write.send(tungstenite::Message::text(request)).await {
                    break e.to_string();
                }
            }
            message = read.next() => match message {
                Some(Ok(tungstenite::Message::Text(text))) => shared.handle_incoming(generation, &text),
                Some(Ok(tungstenite::Message::Close(frame))) => {
                    break frame.map_or_else(|| "closed by manager".to_owned(), |f| f.reason.to_string());
                }
                Some(Ok(_)) => {}
                Some(Err(e)) => break e.to_string(),
                None => break "stream ended".to_owned(),
            },
        }
    };

    shared.teardown(generation, &reason);
}

// ── Wire frames ──────────────────────────────────────────────────────

#[derive(Debug, Deserialize)]
#[serde(untagged)]
enum Incoming {
    Notify(NotifyFrame),
    Reply(ReplyFrame),
}

#[derive(Debug, Deserialize)]
struct NotifyFrame {
    notify: NotifyKind,
    node: u64,
    key: String,
    #[serde(default)]
    value: Value,
}

#[derive(Debug, Clone, Copy, Deserialize)]
#[serde(rename_all = "lowercase")]
enum NotifyKind {
    Set,
    Append,
    Remove,
}

#[derive(Debug, Deserialize)]
struct ReplyFrame {
    id: u64,
    #[serde(default)]
    result: Value,
    #[serde(default)]
    error: Option<RemoteFailure>,
}

#[derive(Debug, Deserialize)]
struct RemoteFailure {
    kind: FailureKind,
    message: String,
}

#[derive(Debug, Clone, Copy, Deserialize)]
#[serde(rename_all = "lowercase")]
enum FailureKind {
    Refused,
    Failed,
    Remote,
}

#[cfg(test)]
#[allow(clippy::unwrap_used)]
mod tests {
    use super::*;

    fn client() -> ManagerClient {
        ManagerClient::new(ManagerConfig {
            url: Url::parse("ws://127.0.0.1:9/manager").unwrap(),
            username: "user".into(),
            password: "test".to_owned().into(),
            timeout: Duration::from_secs(1),
        })
    }

    /// Install session 1 by hand, as if the handshake had just finished.
    fn open_session(client: &ManagerClient) -> mpsc::UnboundedReceiver<UpstreamEvent> {
        let (events, rx) = mpsc::unbounded_channel();
        *client.shared.session() = Some(Session {
            generation: 1,
            outbound: mpsc::unbounded_channel().0,
            cancel: CancellationToken::new(),
            pump: None,
            events: Some(events),
        });
        rx
    }

    /// Feed a reply for a request that asked to keep its node, and return it.
    fn retained_reply(client: &ManagerClient, id: u64, result: &Value) -> RemoteNode {
        let (tx, mut rx) = oneshot::channel();
        client.shared.pending.insert(id, Pending {
            method: "getUIState".into(),
            retain: true,
            reply: tx,
        });
        client
            .shared
            .handle_incoming(1, &json!({ "id": id, "result": result }).to_string());
        rx.try_recv().unwrap().unwrap().as_node().unwrap().clone()
    }

    fn planet(client: &ManagerClient) -> RemoteNode {
        retained_reply(
            client,
            1,
            &json!({
                "$node": 1,
                "fields": {
                    "name": "planet",
                    "flows": [{
                        "$node": 2,
                        "fields": { "name": "default", "parent": { "$node": 1 }, "components": [] }
                    }]
                }
            }),
        )
    }

    #[test]
    fn parses_incoming_frames() {
        let notify: Incoming =
            serde_json::from_str(r#"{"notify":"append","node":3,"key":"components","value":{"$node":4}}"#).unwrap();
        assert!(matches!(notify, Incoming::Notify(NotifyFrame { notify: NotifyKind::Append, node: 3, .. })));

        let reply: Incoming = serde_json::from_str(r#"{"id":7,"error":{"kind":"refused","message":"no"}}"#).unwrap();
        assert!(matches!(reply, Incoming::Reply(ReplyFrame { id: 7, error: Some(_), .. })));
    }

    #[test]
    fn replies_complete_pending_requests() {
        let client = client();
        let _events = open_session(&client);
        let (tx, mut rx) = oneshot::channel();
        client.shared.pending.insert(7, Pending {
            method: "componentStop".into(),
            retain: false,
            reply: tx,
        });

        client
            .shared
            .handle_incoming(1, r#"{"id":7,"error":{"kind":"remote","message":"not running"}}"#);

        assert!(matches!(
            rx.try_recv().unwrap(),
            Err(Error::Remote { method, message }) if method == "componentStop" && message == "not running"
        ));
    }

    #[test]
    fn notifications_update_cached_nodes() {
        let client = client();
        let mut rx = open_session(&client);
        let flow = planet(&client).children("flows").pop().unwrap();
        let _sub = client.watch(&flow, ListenerId { epoch: 1, seq: 1 });

        client.shared.handle_incoming(
            1,
            r#"{"notify":"append","node":2,"key":"components","value":{"$node":9,"fields":{"name":"enc1"}}}"#,
        );

        let children = flow.children("components");
        assert_eq!(children.len(), 1);
        assert_eq!(children[0].name().as_deref(), Some("enc1"));
        assert!(matches!(rx.try_recv().unwrap(), UpstreamEvent::Notify(n) if n.change.key() == "components"));
    }

    #[test]
    fn removed_components_leave_the_cache() {
        let client = client();
        let _events = open_session(&client);
        let flow = planet(&client).children("flows").pop().unwrap();
        assert_eq!(client.cached_nodes(), 2);

        for id in 100..1100 {
            let component = json!({ "$node": id, "fields": { "name": format!("c{id}"), "parent": { "$node": 2 } } });
            client.shared.handle_incoming(
                1,
                &json!({ "notify": "append", "node": 2, "key": "components", "value": component }).to_string(),
            );
            client.shared.handle_incoming(
                1,
                &json!({ "notify": "remove", "node": 2, "key": "components", "value": { "$node": id } }).to_string(),
            );
        }

        assert!(flow.children("components").is_empty());
        assert_eq!(client.cached_nodes(), 2);
    }

    #[test]
    fn forgotten_detail_state_leaves_the_cache() {
        let client = client();
        let _events = open_session(&client);
        let _planet = planet(&client);
        let detail = json!({
            "$node": 50,
            "fields": { "bitrate": 1, "feeders": [{ "$node": 51, "fields": { "parent": { "$node": 50 } } }] }
        });

        // Two fetches hand out the same tree; it stays until both are forgotten.
        let first = retained_reply(&client, 2, &detail);
        let second = retained_reply(&client, 3, &detail);
        assert!(first.same_handle(&second));
        assert_eq!(client.cached_nodes(), 4);

        client.forget(&first);
        assert_eq!(client.cached_nodes(), 4);
        client.forget(&second);
        assert_eq!(client.cached_nodes(), 2);
        assert!(client.shared.nodes.get(NodeId(51)).is_none());
    }

    #[test]
    fn forget_ignores_handles_from_an_earlier_session() {
        let client = client();
        let _events = open_session(&client);
        let _planet = planet(&client);
        let old = retained_reply(&client, 2, &json!({ "$node": 50, "fields": { "bitrate": 1 } }));

        client.shared.teardown(1, "link lost");
        let _events = open_session(&client);
        let _planet = planet(&client);
        let new = retained_reply(&client, 3, &json!({ "$node": 50, "fields": { "bitrate": 2 } }));

        client.forget(&old);
        assert_eq!(client.cached_nodes(), 3);
        assert!(client.shared.nodes.get(NodeId(50)).unwrap().same_handle(&new));
    }

    #[test]
    fn frames_from_a_closed_session_are_ignored() {
        let client = client();
        let _events = open_session(&client);
        let flow = planet(&client).children("flows").pop().unwrap();

        client.shared.handle_incoming(
            0,
            r#"{"notify":"append","node":2,"key":"components","value":{"$node":9,"fields":{"name":"ghost"}}}"#,
        );

        assert!(flow.children("components").is_empty());
        assert_eq!(client.cached_nodes(), 2);
    }

    #[test]
    fn unclaimed_replies_do_not_pin_nodes() {
        let client = client();
        let _events = open_session(&client);
        let _planet = planet(&client);
        let (tx, rx) = oneshot::channel();
        client.shared.pending.insert(4, Pending {
            method: "getUIState".into(),
            retain: true,
            reply: tx,
        });
        drop(rx);

        client
            .shared
            .handle_incoming(1, r#"{"id":4,"result":{"$node":60,"fields":{"bitrate":1}}}"#);

        assert_eq!(client.cached_nodes(), 2);
    }

    #[test]
    fn teardown_fails_pending_and_reports_disconnect() {
        let client = client();
        let mut rx = open_session(&client);
        let _planet = planet(&client);
        let (tx, mut reply) = oneshot::channel();
        client.shared.pending.insert(9, Pending {
            method: "getUIState".into(),
            retain: true,
            reply: tx,
        });

        client.shared.teardown(1, "link lost");

        assert!(matches!(reply.try_recv().unwrap(), Err(Error::Disconnected)));
        assert!(matches!(rx.try_recv().unwrap(), UpstreamEvent::Disconnected { reason } if reason == "link lost"));
        assert_eq!(client.cached_nodes(), 0);
    }

    #[tokio::test]
    async fn requests_fail_without_a_session() {
        let client = client();
        let planet = RemoteNode::new(Default::default());
        assert!(matches!(
            client.fetch_detail_state(&planet).await,
            Err(Error::Disconnected)
        ));
    }
}
