//! Serialization of mirror events onto broker destinations.
//!
//! Every publish is independent: an encoding failure or a broker outage
//! drops that one frame with a log line and nothing else.

use std::sync::Arc;

use chrono::{DateTime, Utc};
use serde::Serialize;
use serde_json::Value;
use tokio::sync::watch;
use tracing::{debug, trace, warn};

use flumirror_api::Broker;

use crate::error::ProjectionError;
use crate::model::{Action, ChangeEnvelope, ComponentRecord};

/// Outbound destination names under one prefix.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Destinations {
    prefix: String,
}

impl Destinations {
    pub fn new(prefix: &str) -> Self {
        Self {
            prefix: prefix.trim_end_matches('/').to_owned(),
        }
    }

    pub fn initial(&self) -> String {
        format!("{}/components/initial", self.prefix)
    }

    pub fn changes(&self) -> String {
        format!("{}/components/changes", self.prefix)
    }

    pub fn uistate(&self, component: &str, key: &str) -> String {
        format!("{}/components/uistate/{component}/{key}", self.prefix)
    }
}

pub(crate) struct Publisher {
    broker: Arc<dyn Broker>,
    destinations: Destinations,
    last_snapshot: watch::Sender<Option<DateTime<Utc>>>,
}

impl Publisher {
    pub(crate) fn new(broker: Arc<dyn Broker>, destinations: Destinations) -> Self {
        let (last_snapshot, _) = watch::channel(None);
        Self {
            broker,
            destinations,
            last_snapshot,
        }
    }

    pub(crate) fn subscribe_last_snapshot(&self) -> watch::Receiver<Option<DateTime<Utc>>> {
        self.last_snapshot.subscribe()
    }

    /// Publish the full component set. Returns whether it went out.
    pub(crate) fn publish_snapshot(&self, records: &[Arc<ComponentRecord>]) -> bool {
        let sent = self.send(&self.destinations.initial(), records);
        if sent {
            self.last_snapshot.send_replace(Some(Utc::now()));
            trace!(components = records.len(), "snapshot published");
        }
        sent
    }

    pub(crate) fn publish_change(&self, envelope: &ChangeEnvelope) -> bool {
        debug!(action = %envelope.action, "publishing change");
        self.send(&self.destinations.changes(), envelope)
    }

    pub(crate) fn publish_lifecycle(&self, action: Action) -> bool {
        self.publish_change(&ChangeEnvelope::lifecycle(action))
    }

    pub(crate) fn publish_detail(&self, component: &str, key: &str, value: Result<Value, ProjectionError>) -> bool {
        match value {
            Ok(value) => self.send(&self.destinations.uistate(component, key), &value),
            Err(e) => {
                warn!(component, key, error = %e, "detail value not publishable; dropped");
                false
            }
        }
    }

    fn send<T: Serialize + ?Sized>(&self, destination: &str, body: &T) -> bool {
        let body = match serde_json::to_string(body) {
            Ok(body) => body,
            Err(e) => {
                warn!(destination, error = %e, "failed to encode body; dropped");
                return false;
            }
        };
        match self.broker.publish(destination, body) {
            Ok(()) => true,
            Err(e) => {
                warn!(destination, error = %e, "publish failed; dropped");
                false
            }
        }
    }
}

#[cfg(test)]
#[allow(clippy::unwrap_used)]
mod tests {
    use super::*;
    use flumirror_api::MemoryBroker;
    use indexmap::IndexMap;
    use serde_json::json;

    fn publisher(broker: &MemoryBroker) -> Publisher {
        Publisher::new(Arc::new(broker.clone()), Destinations::new("/flumotion"))
    }

    #[test]
    fn destinations() {
        let d = Destinations::new("/flumotion/");
        assert_eq!(d.initial(), "/flumotion/components/initial");
        assert_eq!(d.changes(), "/flumotion/components/changes");
        assert_eq!(d.uistate("enc1", "bitrate"), "/flumotion/components/uistate/enc1/bitrate");
    }

    #[test]
    fn snapshot_records_time() {
        let broker = MemoryBroker::new();
        let publisher = publisher(&broker);
        let last = publisher.subscribe_last_snapshot();
        let record = Arc::new(ComponentRecord {
            name: "enc1".into(),
            mood: Some(0),
            attributes: IndexMap::new(),
            messages: None,
        });

        assert!(publisher.publish_snapshot(&[record]));
        assert!(last.borrow().is_some());
        assert_eq!(
            broker.published_to("/flumotion/components/initial")[0].json(),
            json!([{ "name": "enc1", "mood": 0 }])
        );
    }

    #[test]
    fn failures_are_contained() {
        let broker = MemoryBroker::new();
        let publisher = publisher(&broker);

        let bad = Err(ProjectionError::NestedNode { key: "stats".into() });
        assert!(!publisher.publish_detail("enc1", "stats", bad));
        assert!(publisher.publish_detail("enc1", "bitrate", Ok(json!(1))));

        broker.set_connected(false);
        assert!(!publisher.publish_lifecycle(Action::Disconnected));
        broker.set_connected(true);
        assert!(publisher.publish_lifecycle(Action::Connected));

        let log = broker.published();
        assert_eq!(log.len(), 2);
        assert_eq!(log[1].json(), json!({ "action": "connected", "component": null }));
    }
}
