use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex, PoisonError};
use std::time::Duration;

use async_trait::async_trait;
use tokio::sync::{Notify, broadcast};

use super::{Broker, InboundMessage};
use crate::error::Error;

/// One frame accepted by [`MemoryBroker::publish`].
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Published {
    pub destination: String,
    pub body: String,
}

impl Published {
    /// Body parsed as JSON, or `Null` if it is not JSON.
    pub fn json(&self) -> serde_json::Value {
        serde_json::from_str(&self.body).unwrap_or(serde_json::Value::Null)
    }
}

/// In-process [`Broker`] that records every publish.
///
/// Inbound traffic is simulated with [`inject`](Self::inject).
#[derive(Clone)]
pub struct MemoryBroker {
    inner: Arc<Inner>,
}

struct Inner {
    published: Mutex<Vec<Published>>,
    changed: Notify,
    connected: AtomicBool,
    inbound: broadcast::Sender<InboundMessage>,
}

impl Default for MemoryBroker {
    fn default() -> Self {
        Self::new()
    }
}

impl MemoryBroker {
    pub fn new() -> Self {
        let (inbound, _) = broadcast::channel(256);
        Self {
            inner: Arc::new(Inner {
                published: Mutex::new(Vec::new()),
                changed: Notify::new(),
                connected: AtomicBool::new(true),
                inbound,
            }),
        }
    }

    /// Deliver a frame as if it arrived on `destination`.
    pub fn inject(&self, destination: &str, body: &str) {
        let _ = self.inner.inbound.send(InboundMessage {
            destination: destination.to_owned(),
            body: body.to_owned(),
        });
    }

    /// Toggle the simulated link. Publishing fails while it is down.
    pub fn set_connected(&self, connected: bool) {
        self.inner.connected.store(connected, Ordering::SeqCst);
    }

    pub fn published(&self) -> Vec<Published> {
        self.lock().clone()
    }

    /// Publishes to one destination, oldest first.
    pub fn published_to(&self, destination: &str) -> Vec<Published> {
        self.lock()
            .iter()
            .filter(|p| p.destination == destination)
            .cloned()
            .collect()
    }

    pub fn clear(&self) {
        self.lock().clear();
    }

    /// Wait until the publish log satisfies `predicate`, or `timeout` passes.
    /// Returns whether the predicate held.
    pub async fn wait_for<F>(&self, timeout: Duration, mut predicate: F) -> bool
    where
        F: FnMut(&[Published]) -> bool,
    {
        let wait = async {
            loop {
                let notified = self.inner.changed.notified();
                tokio::pin!(notified);
                notified.as_mut().enable();

                if predicate(&self.lock()) {
                    return;
                }
                notified.await;
            }
        };
        tokio::time::timeout(timeout, wait).await.is_ok()
    }

    fn lock(&self) -> std::sync::MutexGuard<'_, Vec<Published>> {
        self.inner
            .published
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
    }
}

#[async_trait]
impl Broker for MemoryBroker {
    fn publish(&self, destination: &str, body: String) -> Result<(), Error> {
        if !self.is_connected() {
            return Err(Error::BrokerUnavailable);
        }
        self.lock().push(Published {
            destination: destination.to_owned(),
            body,
        });
        self.inner.changed.notify_waiters();
        Ok(())
    }

    fn subscribe(&self) -> broadcast::Receiver<InboundMessage> {
        self.inner.inbound.subscribe()
    }

    fn is_connected(&self) -> bool {
        self.inner.connected.load(Ordering::SeqCst)
    }

    async fn shutdown(&self) {
        self.set_connected(false);
    }
}

#[cfg(test)]
#[allow(clippy::unwrap_used)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn records_and_filters_publishes() {
        let broker = MemoryBroker::new();
        broker.publish("/a", "{}".into()).unwrap();
        broker.publish("/b", r#"{"x":1}"#.into()).unwrap();

        assert_eq!(broker.published().len(), 2);
        assert_eq!(broker.published_to("/b")[0].json()["x"], 1);
    }

    #[tokio::test]
    async fn publish_fails_while_down() {
        let broker = MemoryBroker::new();
        broker.set_connected(false);
        assert!(matches!(broker.publish("/a", "{}".into()), Err(Error::BrokerUnavailable)));
        assert!(broker.published().is_empty());
    }

    #[tokio::test]
    async fn wait_for_wakes_on_publish() {
        let broker = MemoryBroker::new();
        let publisher = broker.clone();
        tokio::spawn(async move {
            tokio::task::yield_now().await;
            publisher.publish("/a", "{}".into()).unwrap();
        });

        assert!(broker.wait_for(Duration::from_secs(5), |log| log.len() == 1).await);
        assert!(!broker.wait_for(Duration::from_millis(10), |log| log.len() == 2).await);
    }

    #[tokio::test]
    async fn inject_reaches_subscribers() {
        let broker = MemoryBroker::new();
        let mut rx = broker.subscribe();
        broker.inject("/flumotion/poll", "{}");
        assert_eq!(rx.recv().await.unwrap().destination, "/flumotion/poll");
    }
}
