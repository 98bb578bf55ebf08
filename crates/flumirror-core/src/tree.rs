//! Listener lifecycle across the planet, flow, component and detail levels.
//!
//! The manager owns the mirrored component set and the detail
//! subscription table. Notifications are fed to it through
//! [`StateListener`]; whatever must go downstream is queued in an outbox
//! the event loop drains after each call.

use std::collections::{HashMap, HashSet};
use std::sync::Arc;

use indexmap::IndexMap;
use serde_json::Value;
use tokio::sync::watch;
use tracing::{debug, info, trace, warn};

use flumirror_api::{ListenerId, NodeId, RemoteNode, RemoteValue, StateListener, Subscription, Upstream};

use crate::config::{DetailRelease, FlowSelection};
use crate::error::{CoreError, ProjectionError};
use crate::model::{Action, ChangeEnvelope, DetailSnapshot, PollOutcome};
use crate::projection::Projector;
use crate::store::{
    Begin, Commit, ComponentSet, ComponentSnapshot, DetailSubscription, FetchTicket, MirroredComponent,
    PollResponder, ShadowSubscriptionTable, Updated,
};

/// Something the event loop must publish.
#[derive(Debug, Clone, PartialEq)]
pub(crate) enum Outbound {
    Change(ChangeEnvelope),
    Detail {
        component: String,
        key: String,
        value: Result<Value, ProjectionError>,
    },
}

#[derive(Debug, Clone, PartialEq, Eq)]
enum Target {
    Planet,
    Flow,
    Component,
    Detail(String),
}

struct AttachedFlow {
    node: RemoteNode,
    listener: Subscription,
}

pub(crate) struct TreeListenerManager {
    upstream: Arc<dyn Upstream>,
    projector: Projector,
    flows: FlowSelection,
    release: DetailRelease,
    epoch: u64,
    next_seq: u64,
    targets: HashMap<ListenerId, Target>,
    planet: Option<(RemoteNode, Subscription)>,
    flow: Option<AttachedFlow>,
    components: ComponentSet,
    details: ShadowSubscriptionTable,
    outbox: Vec<Outbound>,
}

impl TreeListenerManager {
    pub(crate) fn new(
        upstream: Arc<dyn Upstream>,
        projector: Projector,
        flows: FlowSelection,
        release: DetailRelease,
    ) -> Self {
        Self {
            upstream,
            projector,
            flows,
            release,
            epoch: 0,
            next_seq: 0,
            targets: HashMap::new(),
            planet: None,
            flow: None,
            components: ComponentSet::new(),
            details: ShadowSubscriptionTable::new(),
            outbox: Vec::new(),
        }
    }

    // ── Attach / detach ──────────────────────────────────────────────

    /// Mirror `planet` under a new epoch. Existing components are not
    /// announced; the connect-time snapshot covers them.
    pub(crate) fn attach(&mut self, planet: RemoteNode, epoch: u64) -> Vec<PollResponder> {
        let mut abandoned = self.detach_all();
        self.epoch = epoch;
        abandoned.extend(self.details.reset(epoch));

        let listener = self.watch(&planet, Target::Planet);
        self.planet = Some((planet, listener));
        self.select_flow(false);

        info!(
            epoch,
            flow = self.flow_name().as_deref().unwrap_or("<none>"),
            components = self.components.len(),
            "mirror attached"
        );
        abandoned
    }

    /// Detach every listener, top-down, and empty the mirror. Returns the
    /// waiters of detail fetches that will never complete.
    pub(crate) fn detach_all(&mut self) -> Vec<PollResponder> {
        self.planet = None;
        self.flow = None;
        self.components.clear();
        let abandoned = self.details.reset(self.epoch);
        self.targets.clear();
        abandoned
    }

    fn watch(&mut self, node: &RemoteNode, target: Target) -> Subscription {
        let id = self.next_listener_id();
        self.targets.insert(id, target);
        self.upstream.watch(node, id)
    }

    fn next_listener_id(&mut self) -> ListenerId {
        self.next_seq += 1;
        ListenerId {
            epoch: self.epoch,
            seq: self.next_seq,
        }
    }

    fn forget(&mut self, listener: &Subscription) {
        self.targets.remove(&listener.listener());
    }

    // ── Flows ────────────────────────────────────────────────────────

    fn desired_flow(&self) -> Option<RemoteNode> {
        let (planet, _) = self.planet.as_ref()?;
        let flows = planet.children("flows");
        let names: Vec<Option<String>> = flows.iter().map(RemoteNode::name).collect();
        let index = self.flows.pick(names.iter().map(Option::as_deref))?;
        flows.get(index).cloned()
    }

    /// Re-evaluate which flow is mirrored and switch if needed.
    fn select_flow(&mut self, announce: bool) {
        let desired = self.desired_flow();
        let current = self.flow.as_ref().map(|flow| flow.node.id());
        if desired.as_ref().map(RemoteNode::id) == current {
            return;
        }

        if let Some(flow) = self.flow.take() {
            info!(flow = flow.node.name().as_deref().unwrap_or("?"), "flow no longer mirrored");
            self.forget(&flow.listener);
            drop(flow);
            for node in self.components.nodes() {
                self.remove_component(node.id(), announce);
            }
        }

        match desired {
            Some(node) => self.attach_flow(node, announce),
            None => debug!(preferred = self.flows.preferred(), "no flow to mirror"),
        }
    }

    fn attach_flow(&mut self, node: RemoteNode, announce: bool) {
        let listener = self.watch(&node, Target::Flow);
        let children = node.children("components");
        debug!(flow = node.name().as_deref().unwrap_or("?"), components = children.len(), "attaching flow");
        self.flow = Some(AttachedFlow { node, listener });

        for component in children {
            self.add_component(component, announce);
        }
    }

    fn flow_name(&self) -> Option<String> {
        self.flow.as_ref().and_then(|flow| flow.node.name())
    }

    /// Bring the mirror in line with the flow's whole component list.
    fn sync_components(&mut self) {
        let Some(flow) = &self.flow else {
            return;
        };
        let upstream = flow.node.children("components");
        let present: HashSet<NodeId> = upstream.iter().map(RemoteNode::id).collect();

        for node in self.components.nodes() {
            if !present.contains(&node.id()) {
                self.remove_component(node.id(), true);
            }
        }
        for node in upstream {
            self.add_component(node, true);
        }
    }

    // ── Components ───────────────────────────────────────────────────

    fn add_component(&mut self, node: RemoteNode, announce: bool) {
        if self.components.contains_node(node.id()) {
            trace!(node = %node.id(), "component already mirrored");
            return;
        }

        let record = Arc::new(self.projector.component(&node));
        let listener = self.watch(&node, Target::Component);
        let displaced = self.components.insert(MirroredComponent {
            node,
            record: Arc::clone(&record),
            listener,
        });
        if let Some(displaced) = displaced {
            warn!(component = %record.name, "two components share a name; keeping the newest");
            self.forget(&displaced.listener);
            self.release_detail(&record.name, "component replaced");
        }

        debug!(component = %record.name, mood = ?record.mood, "component mirrored");
        if announce {
            self.outbox
                .push(Outbound::Change(ChangeEnvelope::record(Action::Add, record)));
        }
    }

    fn remove_component(&mut self, node: NodeId, announce: bool) {
        let Some(entry) = self.components.remove_node(node) else {
            return;
        };
        self.forget(&entry.listener);
        let name = entry.record.name.clone();
        drop(entry);

        self.release_detail(&name, "component removed");
        debug!(component = %name, "component no longer mirrored");
        if announce {
            self.outbox.push(Outbound::Change(ChangeEnvelope::removed(name)));
        }
    }

    fn component_changed(&mut self, node: &RemoteNode, key: &str, action: Action) {
        if !self.components.contains_node(node.id()) {
            return;
        }
        let record = Arc::new(self.projector.component(node));
        let Some(Updated { old_name, displaced }) = self.components.update(node.id(), Arc::clone(&record)) else {
            return;
        };
        if old_name != record.name {
            self.release_detail(&old_name, "component renamed");
        }
        if let Some(displaced) = displaced {
            warn!(component = %record.name, renamed_from = %old_name, "rename collides with another component; dropping it");
            self.forget(&displaced.listener);
            drop(displaced);
            self.release_detail(&record.name, "component replaced");
            self.outbox
                .push(Outbound::Change(ChangeEnvelope::removed(record.name.clone())));
        }

        self.outbox
            .push(Outbound::Change(ChangeEnvelope::record(action, Arc::clone(&record))));

        if action == Action::Change && key == "mood" {
            if let Some(code) = record.mood {
                if self.release.releases(code) {
                    self.release_detail(&record.name, "mood changed");
                }
            }
        }
    }

    // ── Detail state ─────────────────────────────────────────────────

    fn release_detail(&mut self, name: &str, reason: &str) {
        if let Some(sub) = self.details.get(name) {
            let id = sub.listener.listener();
            self.targets.remove(&id);
        }
        let released = self.details.release(name);
        if released.held() {
            info!(component = %name, reason, "released detail subscription");
        }
        if let Some(detail) = &released.detail {
            self.upstream.forget(detail);
        }
        for waiter in released.waiters.unwrap_or_default() {
            let _ = waiter.send(Err(CoreError::DetailReleased { name: name.to_owned() }));
        }
    }

    /// Start a detail poll. Returns the fetch the caller must run, if any.
    pub(crate) fn begin_poll(
        &mut self,
        name: &str,
        waiter: Option<PollResponder>,
    ) -> Option<(FetchTicket, RemoteNode)> {
        let Some(component) = self.components.get(name).map(|entry| entry.node.clone()) else {
            warn!(component = %name, "poll for a component that is not mirrored");
            if let Some(waiter) = waiter {
                let _ = waiter.send(Err(CoreError::ComponentNotFound { name: name.to_owned() }));
            }
            return None;
        };

        match self.details.begin(name, waiter) {
            Begin::Existing { node, waiter } => {
                debug!(component = %name, "replaying detail state");
                let snapshot = self.queue_detail_snapshot(name, &node);
                if let Some(waiter) = waiter {
                    let _ = waiter.send(Ok(PollOutcome {
                        subscribed_now: false,
                        snapshot,
                    }));
                }
                None
            }
            Begin::Joined => {
                debug!(component = %name, "joined detail fetch in flight");
                None
            }
            Begin::Fetch(ticket) => Some((ticket, component)),
        }
    }

    /// Complete a detail fetch started by [`begin_poll`](Self::begin_poll).
    pub(crate) fn finish_poll(&mut self, ticket: &FetchTicket, result: Result<RemoteNode, flumirror_api::Error>) {
        let name = ticket.component.clone();
        let detail = match result {
            Ok(detail) => detail,
            Err(e) => {
                warn!(component = %name, error = %e, "detail state fetch failed");
                for waiter in self.details.fail(ticket).unwrap_or_default() {
                    let _ = waiter.send(Err(fetch_error(&e)));
                }
                return;
            }
        };

        let id = self.next_listener_id();
        let upstream = Arc::clone(&self.upstream);
        let commit = self.details.commit(ticket, || DetailSubscription {
            node: detail.clone(),
            listener: upstream.watch(&detail, id),
        });

        match commit {
            Commit::Committed(waiters) => {
                self.targets.insert(id, Target::Detail(name.clone()));
                info!(component = %name, "subscribed to detail state");
                let snapshot = self.queue_detail_snapshot(&name, &detail);
                answer(waiters, &snapshot);
            }
            Commit::Abandoned => {
                debug!(component = %name, epoch = ticket.epoch, "discarding stale detail state");
                self.upstream.forget(&detail);
            }
        }
    }

    fn queue_detail_snapshot(&mut self, name: &str, node: &RemoteNode) -> DetailSnapshot {
        let mut fields = IndexMap::new();
        for (key, value) in self.projector.detail(node) {
            if let Ok(projected) = &value {
                fields.insert(key.clone(), projected.clone());
            }
            self.outbox.push(Outbound::Detail {
                component: name.to_owned(),
                key,
                value,
            });
        }
        DetailSnapshot {
            component: name.to_owned(),
            fields,
        }
    }

    fn detail_changed(&mut self, id: ListenerId, name: &str, key: &str, value: Option<RemoteValue>) {
        if !self.details.is_live(name, id) {
            trace!(component = %name, listener = %id, "change for a released detail subscription");
            return;
        }
        // List changes republish the whole list.
        let value = match value {
            Some(value) => value,
            None => match self.details.get(name).and_then(|sub| sub.node.get(key)) {
                Some(value) => value,
                None => return,
            },
        };
        self.outbox.push(Outbound::Detail {
            component: name.to_owned(),
            key: key.to_owned(),
            value: self.projector.detail_value(key, &value),
        });
    }

    // ── Accessors ────────────────────────────────────────────────────

    pub(crate) fn take_outbox(&mut self) -> Vec<Outbound> {
        std::mem::take(&mut self.outbox)
    }

    pub(crate) fn components(&self) -> &ComponentSet {
        &self.components
    }

    pub(crate) fn records(&self) -> ComponentSnapshot {
        self.components.snapshot()
    }

    pub(crate) fn subscribe_components(&self) -> watch::Receiver<ComponentSnapshot> {
        self.components.subscribe()
    }

    #[cfg(test)]
    pub(crate) fn detail_count(&self) -> usize {
        self.details.len()
    }

    #[cfg(test)]
    pub(crate) fn is_empty(&self) -> bool {
        self.components.is_empty() && self.details.is_empty() && self.targets.is_empty()
    }
}

impl StateListener for TreeListenerManager {
    fn on_value_set(&mut self, id: ListenerId, node: &RemoteNode, key: &str, value: RemoteValue) {
        match self.targets.get(&id).cloned() {
            Some(Target::Planet) if key == "flows" => self.select_flow(true),
            Some(Target::Flow) if key == "components" => self.sync_components(),
            Some(Target::Flow) if key == "name" => self.select_flow(true),
            Some(Target::Component) => self.component_changed(node, key, Action::Change),
            Some(Target::Detail(name)) => self.detail_changed(id, &name, key, Some(value)),
            Some(Target::Planet | Target::Flow) => {}
            None => trace!(listener = %id, "notification for a detached listener"),
        }
    }

    fn on_child_added(&mut self, id: ListenerId, node: &RemoteNode, key: &str, value: RemoteValue) {
        match self.targets.get(&id).cloned() {
            Some(Target::Planet) if key == "flows" => self.select_flow(true),
            Some(Target::Flow) if key == "components" => match value {
                RemoteValue::Node(component) => self.add_component(component, true),
                _ => warn!(key, "non-node value appended to a flow's components"),
            },
            Some(Target::Component) => self.component_changed(node, key, Action::Update),
            Some(Target::Detail(name)) => self.detail_changed(id, &name, key, None),
            Some(Target::Planet | Target::Flow) => {}
            None => trace!(listener = %id, "notification for a detached listener"),
        }
    }

    fn on_child_removed(&mut self, id: ListenerId, node: &RemoteNode, key: &str, value: RemoteValue) {
        match self.targets.get(&id).cloned() {
            Some(Target::Planet) if key == "flows" => self.select_flow(true),
            Some(Target::Flow) if key == "components" => {
                if let Some(component) = value.as_node() {
                    self.remove_component(component.id(), true);
                }
            }
            Some(Target::Component) => self.component_changed(node, key, Action::Update),
            Some(Target::Detail(name)) => self.detail_changed(id, &name, key, None),
            Some(Target::Planet | Target::Flow) => {}
            None => trace!(listener = %id, "notification for a detached listener"),
        }
    }
}

/// Answer the waiters of a committed fetch; the first one created it.
fn answer(waiters: Vec<PollResponder>, snapshot: &DetailSnapshot) {
    for (index, waiter) in waiters.into_iter().enumerate() {
        let _ = waiter.send(Ok(PollOutcome {
            subscribed_now: index == 0,
            snapshot: snapshot.clone(),
        }));
    }
}

fn fetch_error(err: &flumirror_api::Error) -> CoreError {
    match err {
        flumirror_api::Error::Remote { method, message } => CoreError::Remote {
            method: method.clone(),
            message: message.clone(),
        },
        flumirror_api::Error::Disconnected => CoreError::UpstreamLost,
        other => CoreError::Remote {
            method: "getUIState".into(),
            message: other.to_string(),
        },
    }
}
