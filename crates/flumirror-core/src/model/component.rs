use indexmap::IndexMap;
use serde::Serialize;
use serde_json::Value;

use flumirror_api::MessageLevel;

use super::Mood;

/// Local shadow of one component, in the shape published downstream.
///
/// Serializes as a flat object: `name`, `mood`, every other mirrored
/// attribute, then the expanded `messages`.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct ComponentRecord {
    pub name: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub mood: Option<i64>,
    #[serde(flatten)]
    pub attributes: IndexMap<String, Value>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub messages: Option<Vec<MessageRecord>>,
}

impl ComponentRecord {
    /// The decoded mood, if the code is a known one.
    pub fn mood(&self) -> Option<Mood> {
        self.mood.and_then(Mood::from_code)
    }

    pub fn attribute(&self, key: &str) -> Option<&Value> {
        self.attributes.get(key)
    }
}

/// One diagnostic message attached to a component.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct MessageRecord {
    pub id: Value,
    pub text: String,
    pub description: Option<String>,
    pub timestamp: Option<i64>,
    pub debug: Option<String>,
    pub level: MessageLevel,
    pub priority: i64,
}

/// Projected detail state of one component, keyed by field name.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct DetailSnapshot {
    pub component: String,
    pub fields: IndexMap<String, Value>,
}

/// Result of a detail poll.
#[derive(Debug, Clone, PartialEq)]
pub struct PollOutcome {
    /// `true` when this poll created the detail subscription.
    pub subscribed_now: bool,
    pub snapshot: DetailSnapshot,
}
