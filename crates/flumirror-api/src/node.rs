//! Local handles onto the upstream state tree.
//!
//! A [`RemoteNode`] is a cached copy of one node in the manager's state
//! tree (planet, flow, component or detail state). The transport owns the
//! cache and applies remote notifications to it; everyone else only reads.
//! Values stored in a node are tagged once, when the transport decodes
//! them, as a [`RemoteValue`].

use std::fmt;
use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};

use arc_swap::ArcSwap;
use indexmap::IndexMap;
use serde::{Deserialize, Serialize};

/// Field map of a node, in upstream insertion order.
pub type Fields = IndexMap<String, RemoteValue>;

// Locally allocated ids start high so they never collide with small
// wire ids handed out by a manager.
static NEXT_LOCAL_ID: AtomicU64 = AtomicU64::new(1 << 40);

// ── NodeId ───────────────────────────────────────────────────────────

/// Remote identity of a node. Two handles with the same id refer to the
/// same upstream entity, whatever their cached contents.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct NodeId(pub u64);

impl NodeId {
    /// Allocate an id for a node that does not come off the wire.
    pub fn fresh() -> Self {
        Self(NEXT_LOCAL_ID.fetch_add(1, Ordering::Relaxed))
    }
}

impl fmt::Display for NodeId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "#{}", self.0)
    }
}

// ── RemoteNode ───────────────────────────────────────────────────────

/// Cheaply cloneable handle to a cached upstream node.
///
/// Reads are lock-free snapshots of the field map; equality and hashing
/// use the remote id only.
#[derive(Clone)]
pub struct RemoteNode {
    inner: Arc<NodeInner>,
}

struct NodeInner {
    id: NodeId,
    fields: ArcSwap<Fields>,
}

impl RemoteNode {
    /// Build a detached node with a freshly allocated id.
    pub fn new(fields: Fields) -> Self {
        Self::with_id(NodeId::fresh(), fields)
    }

    pub fn with_id(id: NodeId, fields: Fields) -> Self {
        Self {
            inner: Arc::new(NodeInner {
                id,
                fields: ArcSwap::from_pointee(fields),
            }),
        }
    }

    /// Convenience constructor from `(key, value)` pairs.
    pub fn from_pairs<K, V, I>(pairs: I) -> Self
    where
        K: Into<String>,
        V: Into<RemoteValue>,
        I: IntoIterator<Item = (K, V)>,
    {
        Self::new(
            pairs
                .into_iter()
                .map(|(k, v)| (k.into(), v.into()))
                .collect(),
        )
    }

    pub fn id(&self) -> NodeId {
        self.inner.id
    }

    /// Whether both handles share one cache entry, not just one remote id.
    pub fn same_handle(&self, other: &Self) -> bool {
        Arc::ptr_eq(&self.inner, &other.inner)
    }

    /// Point-in-time copy of every field.
    pub fn fields(&self) -> Arc<Fields> {
        self.inner.fields.load_full()
    }

    pub fn keys(&self) -> Vec<String> {
        self.inner.fields.load().keys().cloned().collect()
    }

    pub fn get(&self, key: &str) -> Option<RemoteValue> {
        self.inner.fields.load().get(key).cloned()
    }

    pub fn contains_key(&self, key: &str) -> bool {
        self.inner.fields.load().contains_key(key)
    }

    /// The `name` field, if it is a string.
    pub fn name(&self) -> Option<String> {
        self.get("name").and_then(|v| v.as_str().map(str::to_owned))
    }

    /// Child nodes stored in the list under `key`. Non-node elements are skipped.
    pub fn children(&self, key: &str) -> Vec<RemoteNode> {
        match self.inner.fields.load().get(key) {
            Some(RemoteValue::List(items)) => {
                items.iter().filter_map(RemoteValue::as_node).cloned().collect()
            }
            _ => Vec::new(),
        }
    }

    /// Every node held in a field, directly or inside a list.
    pub fn linked_nodes(&self) -> Vec<RemoteNode> {
        let mut out = Vec::new();
        for value in self.inner.fields.load().values() {
            value.collect_nodes(&mut out);
        }
        out
    }

    // ── Mutation (transport side only) ───────────────────────────────

    /// Overwrite `key` with `value`.
    pub fn set(&self, key: &str, value: RemoteValue) {
        self.inner.fields.rcu(|fields| {
            let mut next = Fields::clone(fields);
            next.insert(key.to_owned(), value.clone());
            next
        });
    }

    /// Append `value` to the list under `key`, creating the list if needed.
    pub fn append(&self, key: &str, value: RemoteValue) {
        self.inner.fields.rcu(|fields| {
            let mut next = Fields::clone(fields);
            match next.get_mut(key) {
                Some(RemoteValue::List(items)) => items.push(value.clone()),
                _ => {
                    next.insert(key.to_owned(), RemoteValue::List(vec![value.clone()]));
                }
            }
            next
        });
    }

    /// Remove the first element equal to `value` from the list under `key`.
    /// Returns `true` if something was removed.
    pub fn remove(&self, key: &str, value: &RemoteValue) -> bool {
        let mut removed = false;
        self.inner.fields.rcu(|fields| {
            removed = false;
            let mut next = Fields::clone(fields);
            if let Some(RemoteValue::List(items)) = next.get_mut(key) {
                if let Some(pos) = items.iter().position(|item| item == value) {
                    items.remove(pos);
                    removed = true;
                }
            }
            next
        });
        removed
    }

    /// Drop `key` entirely. Returns `true` if it was present.
    pub fn unset(&self, key: &str) -> bool {
        let mut removed = false;
        self.inner.fields.rcu(|fields| {
            let mut next = Fields::clone(fields);
            removed = next.shift_remove(key).is_some();
            next
        });
        removed
    }

    /// Replace the whole field map (used when a fresh copy arrives off the wire).
    pub fn replace_fields(&self, fields: Fields) {
        self.inner.fields.store(Arc::new(fields));
    }
}

impl PartialEq for RemoteNode {
    fn eq(&self, other: &Self) -> bool {
        self.inner.id == other.inner.id
    }
}

impl Eq for RemoteNode {}

impl std::hash::Hash for RemoteNode {
    fn hash<H: std::hash::Hasher>(&self, state: &mut H) {
        self.inner.id.hash(state);
    }
}

// Nodes may point back at their parent, so Debug never descends.
impl fmt::Debug for RemoteNode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("RemoteNode")
            .field("id", &self.inner.id)
            .field("keys", &self.keys())
            .finish()
    }
}

// ── RemoteValue ──────────────────────────────────────────────────────

/// Shape tag for a value held by a node, fixed when the value is decoded.
#[derive(Debug, Clone, PartialEq)]
pub enum RemoteValue {
    /// Plain JSON data, mirrored verbatim.
    Scalar(serde_json::Value),
    /// A keyed child node.
    Node(RemoteNode),
    /// An ordered list of values (children, messages, scalars).
    List(Vec<RemoteValue>),
    /// A diagnostic message record.
    Message(Message),
}

/// Discriminant of a [`RemoteValue`], without the payload.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ValueShape {
    Scalar,
    KeyedNode,
    OrderedChildList,
    Message,
}

impl RemoteValue {
    pub fn shape(&self) -> ValueShape {
        match self {
            Self::Scalar(_) => ValueShape::Scalar,
            Self::Node(_) => ValueShape::KeyedNode,
            Self::List(_) => ValueShape::OrderedChildList,
            Self::Message(_) => ValueShape::Message,
        }
    }

    pub fn as_node(&self) -> Option<&RemoteNode> {
        match self {
            Self::Node(node) => Some(node),
            _ => None,
        }
    }

    /// Push every node in this value, descending into lists.
    pub fn collect_nodes(&self, out: &mut Vec<RemoteNode>) {
        match self {
            Self::Node(node) => out.push(node.clone()),
            Self::List(items) => {
                for item in items {
                    item.collect_nodes(out);
                }
            }
            Self::Scalar(_) | Self::Message(_) => {}
        }
    }

    pub fn as_list(&self) -> Option<&[RemoteValue]> {
        match self {
            Self::List(items) => Some(items),
            _ => None,
        }
    }

    pub fn as_scalar(&self) -> Option<&serde_json::Value> {
        match self {
            Self::Scalar(v) => Some(v),
            _ => None,
        }
    }

    pub fn as_str(&self) -> Option<&str> {
        self.as_scalar().and_then(serde_json::Value::as_str)
    }

    pub fn as_i64(&self) -> Option<i64> {
        self.as_scalar().and_then(serde_json::Value::as_i64)
    }
}

impl From<serde_json::Value> for RemoteValue {
    fn from(v: serde_json::Value) -> Self {
        Self::Scalar(v)
    }
}

impl From<&str> for RemoteValue {
    fn from(v: &str) -> Self {
        Self::Scalar(serde_json::Value::String(v.to_owned()))
    }
}

impl From<String> for RemoteValue {
    fn from(v: String) -> Self {
        Self::Scalar(serde_json::Value::String(v))
    }
}

impl From<i64> for RemoteValue {
    fn from(v: i64) -> Self {
        Self::Scalar(serde_json::Value::from(v))
    }
}

impl From<bool> for RemoteValue {
    fn from(v: bool) -> Self {
        Self::Scalar(serde_json::Value::Bool(v))
    }
}

impl From<RemoteNode> for RemoteValue {
    fn from(v: RemoteNode) -> Self {
        Self::Node(v)
    }
}

impl From<Message> for RemoteValue {
    fn from(v: Message) -> Self {
        Self::Message(v)
    }
}

impl<T: Into<RemoteValue>> From<Vec<T>> for RemoteValue {
    fn from(v: Vec<T>) -> Self {
        Self::List(v.into_iter().map(Into::into).collect())
    }
}

// ── Message ──────────────────────────────────────────────────────────

/// Severity of a component [`Message`].
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum MessageLevel {
    Error,
    #[serde(alias = "warn")]
    Warning,
    Info,
}

impl fmt::Display for MessageLevel {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(match self {
            Self::Error => "error",
            Self::Warning => "warning",
            Self::Info => "info",
        })
    }
}

/// One translatable fragment: a printf-style format and its arguments.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Translatable {
    pub format: String,
    #[serde(default)]
    pub args: Vec<serde_json::Value>,
}

/// A diagnostic message attached to a component.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Message {
    /// Upstream message id, passed through verbatim.
    pub id: serde_json::Value,
    pub level: MessageLevel,
    #[serde(default = "default_priority")]
    pub priority: i64,
    #[serde(default)]
    pub translatables: Vec<Translatable>,
    #[serde(default)]
    pub description: Option<String>,
    /// Seconds since the Unix epoch.
    #[serde(default)]
    pub timestamp: Option<i64>,
    #[serde(default)]
    pub debug: Option<String>,
}

fn default_priority() -> i64 {
    50
}

impl fmt::Display for Message {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "[{}] ", self.level)?;
        if self.translatables.is_empty() {
            write!(f, "message {}", self.id)
        } else {
            let formats: Vec<&str> = self.translatables.iter().map(|t| t.format.as_str()).collect();
            f.write_str(&formats.join(" "))
        }
    }
}
