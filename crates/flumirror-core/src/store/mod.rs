// ── Mirror state ──
//
// Owned by the bridge event loop; nothing here is shared across tasks
// except the `watch` snapshot of the component set.

mod collection;
mod subscriptions;

pub(crate) use collection::{ComponentSet, ComponentSnapshot, MirroredComponent, Updated};
pub(crate) use subscriptions::{
    Begin, Commit, DetailSubscription, FetchTicket, PollResponder, ShadowSubscriptionTable,
};
