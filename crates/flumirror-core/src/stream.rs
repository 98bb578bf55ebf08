// ── Reactive component stream ──
//
// Observers of the mirrored component set, backed by the `watch`
// channel the event loop updates on every mutation.

use std::pin::Pin;
use std::sync::Arc;
use std::task::{Context, Poll};

use futures_core::Stream;
use tokio::sync::watch;
use tokio_stream::wrappers::WatchStream;

use crate::model::ComponentRecord;

type Snapshot = Arc<Vec<Arc<ComponentRecord>>>;

/// A subscription to the mirrored component set.
pub struct ComponentStream {
    current: Snapshot,
    receiver: watch::Receiver<Snapshot>,
}

impl ComponentStream {
    pub(crate) fn new(receiver: watch::Receiver<Snapshot>) -> Self {
        let current = receiver.borrow().clone();
        Self { current, receiver }
    }

    /// The snapshot captured at creation or at the last `changed()`.
    pub fn current(&self) -> &Snapshot {
        &self.current
    }

    pub fn latest(&self) -> Snapshot {
        self.receiver.borrow().clone()
    }

    /// Wait for the next change. `None` once the bridge is gone.
    pub async fn changed(&mut self) -> Option<Snapshot> {
        self.receiver.changed().await.ok()?;
        let snap = self.receiver.borrow_and_update().clone();
        self.current = snap.clone();
        Some(snap)
    }

    pub fn into_stream(self) -> ComponentWatchStream {
        ComponentWatchStream {
            inner: WatchStream::new(self.receiver),
        }
    }
}

/// `Stream` of component-set snapshots.
pub struct ComponentWatchStream {
    inner: WatchStream<Snapshot>,
}

impl Stream for ComponentWatchStream {
    type Item = Snapshot;

    fn poll_next(mut self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Option<Self::Item>> {
        Pin::new(&mut self.inner).poll_next(cx)
    }
}
