//! JSON encoding of state-tree values on the manager link.
//!
//! Tagged objects carry the shape of a value:
//!
//! - `{"$node": 12, "fields": {...}}` is a node; without `fields` it is a
//!   reference to a node already sent (e.g. a `parent` back-pointer),
//! - `{"$message": {...}}` is a component message,
//! - arrays are ordered lists,
//! - anything else is a scalar.

use std::collections::HashSet;

use dashmap::DashMap;
use serde_json::{Map, Value, json};

use crate::error::Error;
use crate::node::{Fields, Message, NodeId, RemoteNode, RemoteValue};

pub const NODE_TAG: &str = "$node";
pub const MESSAGE_TAG: &str = "$message";
const PARENT_KEY: &str = "parent";

/// Identity map from wire ids to local node handles.
///
/// The same wire id always resolves to the same [`RemoteNode`], so
/// notifications addressed to a node reach every holder of its handle.
#[derive(Default)]
pub struct NodeCache {
    nodes: DashMap<NodeId, RemoteNode>,
}

impl NodeCache {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn get(&self, id: NodeId) -> Option<RemoteNode> {
        self.nodes.get(&id).map(|node| node.value().clone())
    }

    /// Handle for `id`, created on first sight. `fields`, when present,
    /// replace whatever the cache held.
    pub fn resolve(&self, id: NodeId, fields: Option<Fields>) -> RemoteNode {
        let node = self
            .nodes
            .entry(id)
            .or_insert_with(|| RemoteNode::with_id(id, Fields::new()))
            .value()
            .clone();
        if let Some(fields) = fields {
            node.replace_fields(fields);
        }
        node
    }

    pub fn len(&self) -> usize {
        self.nodes.len()
    }

    pub fn is_empty(&self) -> bool {
        self.nodes.is_empty()
    }

    /// Evict every node not reachable from `roots` and return how many
    /// went. Evicted nodes lose their `parent` back-pointer so a detached
    /// subtree does not keep itself alive; handles held elsewhere stay
    /// readable.
    pub fn retain_reachable<'a, I>(&self, roots: I) -> usize
    where
        I: IntoIterator<Item = &'a RemoteNode>,
    {
        let mut reachable = HashSet::new();
        let mut stack: Vec<RemoteNode> = roots.into_iter().cloned().collect();
        while let Some(node) = stack.pop() {
            if reachable.insert(node.id()) {
                stack.extend(node.linked_nodes());
            }
        }

        let before = self.nodes.len();
        self.nodes.retain(|id, node| {
            let keep = reachable.contains(id);
            if !keep {
                node.unset(PARENT_KEY);
            }
            keep
        });
        before.saturating_sub(self.nodes.len())
    }

    /// Forget every node. Field maps are emptied so parent/child cycles
    /// between cached nodes are released.
    pub fn clear(&self) {
        for entry in self.nodes.iter() {
            entry.value().replace_fields(Fields::new());
        }
        self.nodes.clear();
    }
}

/// Decode a wire value, resolving node references through `cache`.
pub fn decode_value(value: Value, cache: &NodeCache) -> Result<RemoteValue, Error> {
    match value {
        Value::Array(items) => Ok(RemoteValue::List(
            items
                .into_iter()
                .map(|item| decode_value(item, cache))
                .collect::<Result<_, _>>()?,
        )),
        Value::Object(map) if map.contains_key(NODE_TAG) => decode_node(map, cache).map(RemoteValue::Node),
        Value::Object(mut map) if map.contains_key(MESSAGE_TAG) => {
            let raw = map.remove(MESSAGE_TAG).unwrap_or(Value::Null);
            let message: Message = serde_json::from_value(raw.clone()).map_err(|e| Error::Deserialization {
                message: format!("invalid message: {e}"),
                body: raw.to_string(),
            })?;
            Ok(RemoteValue::Message(message))
        }
        scalar => Ok(RemoteValue::Scalar(scalar)),
    }
}

fn decode_node(mut map: Map<String, Value>, cache: &NodeCache) -> Result<RemoteNode, Error> {
    let id = map
        .get(NODE_TAG)
        .and_then(Value::as_u64)
        .ok_or_else(|| Error::Deserialization {
            message: "node id must be an unsigned integer".into(),
            body: Value::Object(map.clone()).to_string(),
        })?;

    let fields = match map.remove("fields") {
        None => None,
        Some(Value::Object(raw)) => {
            let mut fields = Fields::with_capacity(raw.len());
            for (key, value) in raw {
                fields.insert(key, decode_value(value, cache)?);
            }
            Some(fields)
        }
        Some(other) => {
            return Err(Error::Deserialization {
                message: format!("fields of node {id} must be an object"),
                body: other.to_string(),
            });
        }
    };

    Ok(cache.resolve(NodeId(id), fields))
}

/// Reference to a node, as sent in request parameters.
pub fn node_ref(node: &RemoteNode) -> Value {
    json!({ NODE_TAG: node.id().0 })
}

#[cfg(test)]
#[allow(clippy::unwrap_used)]
mod tests {
    use super::*;
    use crate::node::MessageLevel;

    #[test]
    fn back_references_share_one_handle() {
        let cache = NodeCache::new();
        let planet = decode_value(
            json!({
                "$node": 1,
                "fields": {
                    "name": "planet",
                    "flows": [{
                        "$node": 2,
                        "fields": { "name": "default", "parent": { "$node": 1 }, "components": [] }
                    }]
                }
            }),
            &cache,
        )
        .unwrap();

        let planet = planet.as_node().unwrap().clone();
        let flow = planet.children("flows").pop().unwrap();
        let parent = flow.get("parent").unwrap();

        assert_eq!(parent.as_node(), Some(&planet));
        // The back-reference sees the fields filled in afterwards.
        assert_eq!(parent.as_node().unwrap().name().as_deref(), Some("planet"));
        assert_eq!(cache.len(), 2);
    }

    #[test]
    fn decodes_messages_and_scalars() {
        let cache = NodeCache::new();
        let value = decode_value(
            json!([
                { "$message": { "id": "m1", "level": "error", "translatables": [] } },
                42,
                { "plain": "object" }
            ]),
            &cache,
        )
        .unwrap();

        let items = value.as_list().unwrap();
        assert!(matches!(&items[0], RemoteValue::Message(m) if m.level == MessageLevel::Error));
        assert_eq!(items[1].as_i64(), Some(42));
        assert_eq!(items[2].as_scalar().unwrap()["plain"], "object");
    }

    #[test]
    fn rejects_bad_node_ids() {
        let cache = NodeCache::new();
        assert!(decode_value(json!({ "$node": "x" }), &cache).is_err());
        assert!(decode_value(json!({ "$node": 3, "fields": [] }), &cache).is_err());
    }

    #[test]
    fn unreachable_subtrees_are_evicted() {
        let cache = NodeCache::new();
        let flow = decode_value(
            json!({
                "$node": 2,
                "fields": {
                    "name": "default",
                    "components": [
                        { "$node": 3, "fields": { "name": "enc1", "parent": { "$node": 2 } } },
                        { "$node": 4, "fields": { "name": "enc2", "parent": { "$node": 2 } } }
                    ]
                }
            }),
            &cache,
        )
        .unwrap();
        let flow = flow.as_node().unwrap().clone();
        let enc1 = cache.get(NodeId(3)).unwrap();
        flow.remove("components", &RemoteValue::Node(enc1.clone()));

        assert_eq!(cache.retain_reachable([&flow]), 1);
        assert_eq!(cache.len(), 2);
        assert!(cache.get(NodeId(3)).is_none());
        assert!(cache.get(NodeId(4)).is_some());
        // The evicted handle is still readable but no longer points up.
        assert_eq!(enc1.name().as_deref(), Some("enc1"));
        assert!(!enc1.contains_key("parent"));
        assert!(cache.get(NodeId(4)).unwrap().contains_key("parent"));
    }

    #[test]
    fn clear_forgets_nodes() {
        let cache = NodeCache::new();
        let node = cache.resolve(NodeId(5), Some(Fields::from([("name".to_owned(), "x".into())])));
        cache.clear();

        assert!(cache.is_empty());
        assert!(node.keys().is_empty());
        assert_eq!(node_ref(&node), json!({ "$node": 5 }));
    }
}
