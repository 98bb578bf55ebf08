// ── Inbound commands ──
//
// Wire shape of command messages, their validated form, and the
// outcomes reported back to observers.

mod router;

use std::fmt;

use serde::Deserialize;
use serde_json::Value;
use strum::{Display, EnumString};

use crate::error::RouteError;
use crate::model::{ComponentRecord, Mood};

pub use router::CommandRouter;
pub(crate) use router::Dispatch;

/// The allow-list of command names.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Display, EnumString)]
#[strum(serialize_all = "camelCase")]
pub enum CommandKind {
    ComponentCallRemote,
    InvokeOnComponents,
    ComponentStart,
    ComponentStop,
}

/// A command message as received, before validation.
#[derive(Debug, Clone, PartialEq, Deserialize)]
pub struct CommandMessage {
    pub command: String,
    #[serde(default)]
    pub component: Value,
    #[serde(default)]
    pub method: Option<String>,
    #[serde(default)]
    pub params: Option<Vec<Value>>,
}

impl CommandMessage {
    pub fn from_json(body: &str) -> Result<Self, RouteError> {
        serde_json::from_str(body).map_err(|e| RouteError::Malformed(e.to_string()))
    }
}

/// A validated command.
#[derive(Debug, Clone, PartialEq)]
pub enum ComponentCommand {
    CallRemote {
        component: String,
        method: String,
        params: Vec<Value>,
    },
    InvokeOnComponents {
        selector: Selector,
        method: String,
        params: Vec<Value>,
    },
    Start {
        component: String,
    },
    Stop {
        component: String,
    },
}

impl ComponentCommand {
    pub fn kind(&self) -> CommandKind {
        match self {
            Self::CallRemote { .. } => CommandKind::ComponentCallRemote,
            Self::InvokeOnComponents { .. } => CommandKind::InvokeOnComponents,
            Self::Start { .. } => CommandKind::ComponentStart,
            Self::Stop { .. } => CommandKind::ComponentStop,
        }
    }

    /// Human-readable target, for logs and outcomes.
    pub fn target(&self) -> String {
        match self {
            Self::CallRemote { component, .. } | Self::Start { component } | Self::Stop { component } => {
                component.clone()
            }
            Self::InvokeOnComponents { selector, .. } => selector.to_string(),
        }
    }
}

impl TryFrom<CommandMessage> for ComponentCommand {
    type Error = RouteError;

    fn try_from(message: CommandMessage) -> Result<Self, RouteError> {
        let kind: CommandKind = message
            .command
            .parse()
            .map_err(|_| RouteError::UnknownCommand(message.command.clone()))?;
        let missing = |field| RouteError::MissingField {
            command: kind.to_string(),
            field,
        };
        let params = message.params.unwrap_or_default();

        let command = match kind {
            CommandKind::InvokeOnComponents => Self::InvokeOnComponents {
                selector: Selector::from_json(&message.component)?,
                method: message.method.filter(|m| !m.is_empty()).ok_or_else(|| missing("method"))?,
                params,
            },
            _ => {
                let component = message
                    .component
                    .as_str()
                    .filter(|name| !name.is_empty())
                    .map(str::to_owned)
                    .ok_or_else(|| missing("component"))?;
                match kind {
                    CommandKind::ComponentStart => Self::Start { component },
                    CommandKind::ComponentStop => Self::Stop { component },
                    _ => Self::CallRemote {
                        component,
                        method: message.method.filter(|m| !m.is_empty()).ok_or_else(|| missing("method"))?,
                        params,
                    },
                }
            }
        };
        Ok(command)
    }
}

/// Which components an `invokeOnComponents` command addresses.
///
/// On the wire: `"*"` for every component, a name or an array of names,
/// or an object `{"names": [...], "mood": "sad"}` whose criteria must all
/// hold.
#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub struct Selector {
    pub names: Option<Vec<String>>,
    pub mood: Option<Mood>,
}

impl Selector {
    pub fn all() -> Self {
        Self::default()
    }

    pub fn from_json(value: &Value) -> Result<Self, RouteError> {
        let invalid = || RouteError::InvalidSelector(value.to_string());
        match value {
            Value::String(s) if s == "*" => Ok(Self::all()),
            Value::String(s) if !s.is_empty() => Ok(Self {
                names: Some(vec![s.clone()]),
                mood: None,
            }),
            Value::Array(items) => Ok(Self {
                names: Some(names(items).ok_or_else(invalid)?),
                mood: None,
            }),
            Value::Object(map) => {
                let names = match map.get("names") {
                    None => None,
                    Some(Value::Array(items)) => Some(names(items).ok_or_else(invalid)?),
                    Some(_) => return Err(invalid()),
                };
                let mood = match map.get("mood") {
                    None => None,
                    Some(Value::String(s)) => Some(s.parse().map_err(|_| invalid())?),
                    Some(Value::Number(n)) => Some(n.as_i64().and_then(Mood::from_code).ok_or_else(invalid)?),
                    Some(_) => return Err(invalid()),
                };
                Ok(Self { names, mood })
            }
            _ => Err(RouteError::MissingField {
                command: CommandKind::InvokeOnComponents.to_string(),
                field: "component",
            }),
        }
    }

    pub fn matches(&self, record: &ComponentRecord) -> bool {
        self.names.as_ref().is_none_or(|names| names.contains(&record.name))
            && self.mood.is_none_or(|mood| record.mood() == Some(mood))
    }
}

fn names(items: &[Value]) -> Option<Vec<String>> {
    items.iter().map(|item| item.as_str().map(str::to_owned)).collect()
}

impl fmt::Display for Selector {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match (&self.names, self.mood) {
            (None, None) => f.write_str("*"),
            (Some(names), None) => f.write_str(&names.join(",")),
            (None, Some(mood)) => write!(f, "mood={mood}"),
            (Some(names), Some(mood)) => write!(f, "{} mood={mood}", names.join(",")),
        }
    }
}

/// Result of one remote invocation in a batch.
#[derive(Debug, Clone, PartialEq)]
pub struct BatchItem {
    pub component: String,
    pub result: Result<Value, String>,
}

/// What a dispatched command returned.
#[derive(Debug, Clone, PartialEq)]
pub enum CommandResult {
    Value(Value),
    Batch(Vec<BatchItem>),
}

/// Broadcast to observers once a command finishes or is rejected.
#[derive(Debug, Clone, PartialEq)]
pub struct CommandOutcome {
    pub kind: Option<CommandKind>,
    pub target: String,
    pub result: Result<CommandResult, String>,
}

impl CommandOutcome {
    pub fn is_success(&self) -> bool {
        self.result.is_ok()
    }
}
