use std::sync::Arc;

use serde::Serialize;
use strum::Display;

use super::ComponentRecord;

/// Kind of a change envelope.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Display)]
#[serde(rename_all = "lowercase")]
#[strum(serialize_all = "lowercase")]
pub enum Action {
    Add,
    Remove,
    /// A scalar attribute of the component changed.
    Change,
    /// One of the component's child lists changed (e.g. `messages`).
    Update,
    Connected,
    Disconnected,
}

/// What an envelope says about the component.
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(untagged)]
pub enum ChangePayload {
    Record(Arc<ComponentRecord>),
    Name(String),
    None,
}

/// Body published on the changes destination.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct ChangeEnvelope {
    pub action: Action,
    pub component: ChangePayload,
}

impl ChangeEnvelope {
    pub fn record(action: Action, record: Arc<ComponentRecord>) -> Self {
        Self {
            action,
            component: ChangePayload::Record(record),
        }
    }

    pub fn removed(name: impl Into<String>) -> Self {
        Self {
            action: Action::Remove,
            component: ChangePayload::Name(name.into()),
        }
    }

    pub fn lifecycle(action: Action) -> Self {
        Self {
            action,
            component: ChangePayload::None,
        }
    }
}
