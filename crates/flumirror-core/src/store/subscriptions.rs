// ── Shadow subscription table ──
//
// At most one detail-state subscription per component name. A fetch in
// flight is recorded as pending so concurrent polls join it instead of
// issuing a second remote call.

use std::collections::HashMap;

use tokio::sync::oneshot;

use flumirror_api::{ListenerId, RemoteNode, Subscription};

use crate::error::CoreError;
use crate::model::PollOutcome;

pub(crate) type PollResponder = oneshot::Sender<Result<PollOutcome, CoreError>>;

/// Identifies one detail fetch. Completions are matched against the
/// table's epoch and the pending sequence number before they commit.
#[derive(Debug, Clone, PartialEq, Eq)]
pub(crate) struct FetchTicket {
    pub(crate) component: String,
    pub(crate) epoch: u64,
    pub(crate) seq: u64,
}

#[derive(Debug)]
pub(crate) struct DetailSubscription {
    pub(crate) node: RemoteNode,
    pub(crate) listener: Subscription,
}

struct PendingFetch {
    seq: u64,
    waiters: Vec<PollResponder>,
}

pub(crate) enum Begin {
    /// Already subscribed; the live detail node and the caller's waiter.
    Existing {
        node: RemoteNode,
        waiter: Option<PollResponder>,
    },
    /// A fetch is already in flight; the waiter was queued on it.
    Joined,
    /// The caller must fetch and then [`commit`](ShadowSubscriptionTable::commit).
    Fetch(FetchTicket),
}

pub(crate) enum Commit {
    Committed(Vec<PollResponder>),
    /// The ticket belongs to an old epoch or a released fetch.
    Abandoned,
}

/// What [`ShadowSubscriptionTable::release`] took out of the table.
pub(crate) struct Released {
    /// Root of the dropped subscription, for the transport to forget.
    pub(crate) detail: Option<RemoteNode>,
    /// Waiters of an abandoned fetch, if one was in flight.
    pub(crate) waiters: Option<Vec<PollResponder>>,
}

impl Released {
    pub(crate) fn held(&self) -> bool {
        self.detail.is_some() || self.waiters.is_some()
    }
}

pub(crate) struct ShadowSubscriptionTable {
    epoch: u64,
    next_seq: u64,
    active: HashMap<String, DetailSubscription>,
    pending: HashMap<String, PendingFetch>,
}

impl ShadowSubscriptionTable {
    pub(crate) fn new() -> Self {
        Self {
            epoch: 0,
            next_seq: 0,
            active: HashMap::new(),
            pending: HashMap::new(),
        }
    }

    /// Drop every subscription and start a new epoch. Returns the waiters
    /// of abandoned fetches so the caller can fail them.
    pub(crate) fn reset(&mut self, epoch: u64) -> Vec<PollResponder> {
        self.epoch = epoch;
        self.active.clear();
        self.pending
            .drain()
            .flat_map(|(_, pending)| pending.waiters)
            .collect()
    }

    pub(crate) fn begin(&mut self, component: &str, waiter: Option<PollResponder>) -> Begin {
        if let Some(active) = self.active.get(component) {
            return Begin::Existing {
                node: active.node.clone(),
                waiter,
            };
        }

        if let Some(pending) = self.pending.get_mut(component) {
            pending.waiters.extend(waiter);
            return Begin::Joined;
        }

        self.next_seq += 1;
        self.pending.insert(
            component.to_owned(),
            PendingFetch {
                seq: self.next_seq,
                waiters: waiter.into_iter().collect(),
            },
        );
        Begin::Fetch(FetchTicket {
            component: component.to_owned(),
            epoch: self.epoch,
            seq: self.next_seq,
        })
    }

    /// Store the subscription built by `attach`, unless the ticket is
    /// stale.
    ///
    /// A current ticket implies there is no active entry for the
    /// component: `begin` opens a fetch only when none exists, concurrent
    /// polls join that fetch, and only this ticket's commit can add one.
    pub(crate) fn commit<F>(&mut self, ticket: &FetchTicket, attach: F) -> Commit
    where
        F: FnOnce() -> DetailSubscription,
    {
        if !self.is_current(ticket) {
            return Commit::Abandoned;
        }
        let waiters = self
            .pending
            .remove(&ticket.component)
            .map(|pending| pending.waiters)
            .unwrap_or_default();

        debug_assert!(!self.active.contains_key(&ticket.component));
        self.active.insert(ticket.component.clone(), attach());
        Commit::Committed(waiters)
    }

    /// Forget a failed fetch. `None` if the ticket is no longer current.
    pub(crate) fn fail(&mut self, ticket: &FetchTicket) -> Option<Vec<PollResponder>> {
        if !self.is_current(ticket) {
            return None;
        }
        self.pending
            .remove(&ticket.component)
            .map(|pending| pending.waiters)
    }

    /// Detach and forget the component's subscription, and abandon any
    /// fetch in flight for it.
    pub(crate) fn release(&mut self, component: &str) -> Released {
        Released {
            detail: self.active.remove(component).map(|sub| sub.node),
            waiters: self.pending.remove(component).map(|p| p.waiters),
        }
    }

    pub(crate) fn get(&self, component: &str) -> Option<&DetailSubscription> {
        self.active.get(component)
    }

    /// Whether `listener` is the live listener of `component`'s subscription.
    pub(crate) fn is_live(&self, component: &str, listener: ListenerId) -> bool {
        self.active
            .get(component)
            .is_some_and(|sub| sub.listener.listener() == listener && sub.listener.is_active())
    }

    #[cfg(test)]
    pub(crate) fn len(&self) -> usize {
        self.active.len()
    }

    #[cfg(test)]
    pub(crate) fn is_empty(&self) -> bool {
        self.active.is_empty() && self.pending.is_empty()
    }

    fn is_current(&self, ticket: &FetchTicket) -> bool {
        ticket.epoch == self.epoch
            && self
                .pending
                .get(&ticket.component)
                .is_some_and(|pending| pending.seq == ticket.seq)
    }
}
