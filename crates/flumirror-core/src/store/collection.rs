// ── Mirrored component set ──
//
// Owned by the event loop. Every mutation rebuilds the snapshot that
// observers receive through a `watch` channel.

use std::collections::HashMap;
use std::sync::Arc;

use indexmap::IndexMap;
use tokio::sync::watch;

use flumirror_api::{NodeId, RemoteNode, Subscription};

use crate::model::ComponentRecord;

pub(crate) type ComponentSnapshot = Arc<Vec<Arc<ComponentRecord>>>;

/// One mirrored component: its record, its node and the listener on it.
///
/// The record exists exactly as long as the listener does; dropping the
/// entry detaches the listener.
#[derive(Debug)]
pub(crate) struct MirroredComponent {
    pub(crate) node: RemoteNode,
    pub(crate) record: Arc<ComponentRecord>,
    pub(crate) listener: Subscription,
}

/// Result of [`ComponentSet::update`].
#[derive(Debug)]
pub(crate) struct Updated {
    pub(crate) old_name: String,
    /// Entry that held the new name before a rename, listener still attached.
    pub(crate) displaced: Option<MirroredComponent>,
}

pub(crate) struct ComponentSet {
    /// Primary storage, in mirror order: component name -> entry.
    by_name: IndexMap<String, MirroredComponent>,

    /// Secondary index: remote node -> component name.
    by_node: HashMap<NodeId, String>,

    snapshot: watch::Sender<ComponentSnapshot>,
}

impl ComponentSet {
    pub(crate) fn new() -> Self {
        let (snapshot, _) = watch::channel(Arc::new(Vec::new()));
        Self {
            by_name: IndexMap::new(),
            by_node: HashMap::new(),
            snapshot,
        }
    }

    /// Insert an entry. A previous entry with the same name is returned
    /// (its listener still attached until the caller drops it).
    pub(crate) fn insert(&mut self, entry: MirroredComponent) -> Option<MirroredComponent> {
        let name = entry.record.name.clone();
        let previous = self.by_name.insert(name.clone(), entry);
        if let Some(previous) = &previous {
            self.by_node.remove(&previous.node.id());
        }
        if let Some(entry) = self.by_name.get(&name) {
            self.by_node.insert(entry.node.id(), name);
        }
        self.rebuild_snapshot();
        previous
    }

    /// Replace the record of the component mirrored from `node`. A name
    /// change re-keys the entry; another component already holding the new
    /// name is taken out and handed back in [`Updated::displaced`].
    pub(crate) fn update(&mut self, node: NodeId, record: Arc<ComponentRecord>) -> Option<Updated> {
        let old_name = self.by_node.get(&node)?.clone();
        let mut displaced = None;

        if old_name == record.name {
            if let Some(entry) = self.by_name.get_mut(&old_name) {
                entry.record = record;
            }
        } else {
            let (_, mut entry) = self.by_name.shift_remove_entry(&old_name)?;
            entry.record = Arc::clone(&record);
            displaced = self.by_name.insert(record.name.clone(), entry);
            if let Some(displaced) = &displaced {
                self.by_node.remove(&displaced.node.id());
            }
            self.by_node.insert(node, record.name.clone());
        }

        self.rebuild_snapshot();
        Some(Updated { old_name, displaced })
    }

    pub(crate) fn remove_node(&mut self, node: NodeId) -> Option<MirroredComponent> {
        let name = self.by_node.remove(&node)?;
        let entry = self.by_name.shift_remove(&name);
        self.rebuild_snapshot();
        entry
    }

    pub(crate) fn get(&self, name: &str) -> Option<&MirroredComponent> {
        self.by_name.get(name)
    }

    #[cfg(test)]
    pub(crate) fn name_of(&self, node: NodeId) -> Option<&str> {
        self.by_node.get(&node).map(String::as_str)
    }

    pub(crate) fn contains_node(&self, node: NodeId) -> bool {
        self.by_node.contains_key(&node)
    }

    pub(crate) fn nodes(&self) -> Vec<RemoteNode> {
        self.by_name.values().map(|entry| entry.node.clone()).collect()
    }

    pub(crate) fn iter(&self) -> impl Iterator<Item = &MirroredComponent> {
        self.by_name.values()
    }

    pub(crate) fn len(&self) -> usize {
        self.by_name.len()
    }

    #[cfg(test)]
    pub(crate) fn is_empty(&self) -> bool {
        self.by_name.is_empty()
    }

    /// Drop every entry, detaching their listeners.
    pub(crate) fn clear(&mut self) {
        self.by_name.clear();
        self.by_node.clear();
        self.rebuild_snapshot();
    }

    pub(crate) fn snapshot(&self) -> ComponentSnapshot {
        self.snapshot.borrow().clone()
    }

    pub(crate) fn subscribe(&self) -> watch::Receiver<ComponentSnapshot> {
        self.snapshot.subscribe()
    }

    fn rebuild_snapshot(&self) {
        let records: Vec<Arc<ComponentRecord>> = self
            .by_name
            .values()
            .map(|entry| Arc::clone(&entry.record))
            .collect();
        self.snapshot.send_replace(Arc::new(records));
    }
}

#[cfg(test)]
#[allow(clippy::unwrap_used)]
mod tests {
    use super::*;
    use flumirror_api::{ListenerId, MemoryUpstream, Upstream};
    use indexmap::IndexMap;

    fn record(name: &str) -> Arc<ComponentRecord> {
        Arc::new(ComponentRecord {
            name: name.into(),
            mood: Some(0),
            attributes: IndexMap::new(),
            messages: None,
        })
    }

    fn entry(upstream: &MemoryUpstream, node: &RemoteNode, seq: u64) -> MirroredComponent {
        MirroredComponent {
            node: node.clone(),
            record: record(&node.name().unwrap()),
            listener: upstream.watch(node, ListenerId { epoch: 1, seq }),
        }
    }

    #[test]
    fn insert_remove_and_snapshot() {
        let upstream = MemoryUpstream::new();
        let flow = upstream.add_flow("default");
        let a = MemoryUpstream::component(&flow, "a", 0);
        let b = MemoryUpstream::component(&flow, "b", 0);

        let mut set = ComponentSet::new();
        let rx = set.subscribe();
        set.insert(entry(&upstream, &a, 1));
        set.insert(entry(&upstream, &b, 2));

        assert_eq!(set.len(), 2);
        assert_eq!(rx.borrow().len(), 2);
        assert_eq!(upstream.active_listeners(), 2);

        let removed = set.remove_node(a.id()).unwrap();
        assert_eq!(removed.record.name, "a");
        drop(removed);
        assert_eq!(upstream.listeners_on(&a), 0);
        assert_eq!(set.snapshot().len(), 1);
        assert!(set.remove_node(a.id()).is_none());
    }

    #[test]
    fn rename_rekeys_entry() {
        let upstream = MemoryUpstream::new();
        let flow = upstream.add_flow("default");
        let a = MemoryUpstream::component(&flow, "a", 0);

        let mut set = ComponentSet::new();
        set.insert(entry(&upstream, &a, 1));

        let updated = set.update(a.id(), record("renamed")).unwrap();
        assert_eq!(updated.old_name, "a");
        assert!(updated.displaced.is_none());
        assert!(set.get("a").is_none());
        assert_eq!(set.name_of(a.id()), Some("renamed"));
        assert_eq!(set.snapshot()[0].name, "renamed");
    }

    #[test]
    fn rename_onto_a_taken_name_hands_back_the_other_entry() {
        let upstream = MemoryUpstream::new();
        let flow = upstream.add_flow("default");
        let a = MemoryUpstream::component(&flow, "a", 0);
        let b = MemoryUpstream::component(&flow, "b", 0);

        let mut set = ComponentSet::new();
        set.insert(entry(&upstream, &a, 1));
        set.insert(entry(&upstream, &b, 2));

        let updated = set.update(a.id(), record("b")).unwrap();
        let displaced = updated.displaced.unwrap();
        assert_eq!(displaced.node, b);
        assert!(!set.contains_node(b.id()));
        assert_eq!(set.name_of(a.id()), Some("b"));
        assert_eq!(set.len(), 1);

        drop(displaced);
        assert_eq!(upstream.listeners_on(&b), 0);
    }

    #[test]
    fn clear_detaches_everything() {
        let upstream = MemoryUpstream::new();
        let flow = upstream.add_flow("default");
        let a = MemoryUpstream::component(&flow, "a", 0);

        let mut set = ComponentSet::new();
        set.insert(entry(&upstream, &a, 1));
        set.clear();

        assert!(set.is_empty());
        assert_eq!(upstream.active_listeners(), 0);
        assert!(set.snapshot().is_empty());
    }
}
