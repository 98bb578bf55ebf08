//! Projection of remote state nodes into the JSON shapes published
//! downstream.
//!
//! Every projection skips the `parent` back-pointer, which is the only
//! thing that makes the remote tree cyclic. Nested state nodes are only
//! expanded under the well-known detail keys; anywhere else they are a
//! [`ProjectionError`].

use std::fmt::Write as _;
use std::sync::Arc;

use indexmap::IndexMap;
use serde_json::{Map, Value};
use tracing::warn;

use flumirror_api::{Message, RemoteNode, RemoteValue};

use crate::error::ProjectionError;
use crate::model::{ComponentRecord, DetailSnapshot, MessageRecord};

/// Key holding the back-pointer to the owning node.
pub const PARENT_KEY: &str = "parent";

/// Detail keys whose list elements are nested nodes, expanded recursively.
pub const EXPANDED_DETAIL_KEYS: [&str; 3] = ["feeders", "eaters", "clients"];

/// Renders the human-readable text of a component message.
pub trait Translator: Send + Sync {
    fn translate(&self, message: &Message) -> String;
}

/// Applies each translatable's printf-style format to its arguments and
/// concatenates the results. Supports `%s`, `%d`, `%i`, `%f`, `%r` and `%%`.
#[derive(Debug, Clone, Copy, Default)]
pub struct FormatTranslator;

impl Translator for FormatTranslator {
    fn translate(&self, message: &Message) -> String {
        message
            .translatables
            .iter()
            .map(|t| format_printf(&t.format, &t.args))
            .collect()
    }
}

fn format_printf(format: &str, args: &[Value]) -> String {
    let mut out = String::with_capacity(format.len());
    let mut args = args.iter();
    let mut chars = format.chars().peekable();

    while let Some(c) = chars.next() {
        if c != '%' {
            out.push(c);
            continue;
        }
        match chars.peek().copied() {
            Some('%') => {
                chars.next();
                out.push('%');
            }
            Some(spec @ ('s' | 'd' | 'i' | 'f' | 'r')) => {
                chars.next();
                match args.next() {
                    Some(arg) => render_arg(&mut out, spec, arg),
                    None => {
                        out.push('%');
                        out.push(spec);
                    }
                }
            }
            _ => out.push('%'),
        }
    }
    out
}

fn render_arg(out: &mut String, spec: char, arg: &Value) {
    match (spec, arg) {
        ('r', _) => {
            let _ = write!(out, "{arg}");
        }
        ('d' | 'i', Value::Number(n)) => match n.as_i64() {
            Some(i) => {
                let _ = write!(out, "{i}");
            }
            None => {
                let _ = write!(out, "{}", n.as_f64().unwrap_or_default().trunc());
            }
        },
        ('f', Value::Number(n)) => {
            let _ = write!(out, "{:.6}", n.as_f64().unwrap_or_default());
        }
        (_, Value::String(s)) => out.push_str(s),
        _ => {
            let _ = write!(out, "{arg}");
        }
    }
}

/// Turns remote nodes into publishable records.
#[derive(Clone, Default)]
pub struct Projector {
    translator: Option<Arc<dyn Translator>>,
}

impl std::fmt::Debug for Projector {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Projector")
            .field("translator", &self.translator.is_some())
            .finish()
    }
}

impl Projector {
    pub fn new(translator: Option<Arc<dyn Translator>>) -> Self {
        Self { translator }
    }

    /// A projector using [`FormatTranslator`].
    pub fn translating() -> Self {
        Self::new(Some(Arc::new(FormatTranslator)))
    }

    /// Project a component node. Attributes with no flat projection are
    /// logged and left out.
    pub fn component(&self, node: &RemoteNode) -> ComponentRecord {
        let fields = node.fields();
        let mut record = ComponentRecord {
            name: node.name().unwrap_or_default(),
            mood: None,
            attributes: IndexMap::with_capacity(fields.len()),
            messages: None,
        };

        for (key, value) in fields.iter() {
            match key.as_str() {
                PARENT_KEY | "name" => {}
                "mood" if value.as_i64().is_some() => record.mood = value.as_i64(),
                "messages" => {
                    record.messages = Some(
                        value
                            .as_list()
                            .unwrap_or_default()
                            .iter()
                            .filter_map(|item| match item {
                                RemoteValue::Message(message) => Some(self.message(message)),
                                _ => None,
                            })
                            .collect(),
                    );
                }
                _ => match self.flat(key, value, false) {
                    Ok(projected) => {
                        record.attributes.insert(key.clone(), projected);
                    }
                    Err(e) => warn!(component = %record.name, error = %e, "attribute left out of projection"),
                },
            }
        }
        record
    }

    pub fn message(&self, message: &Message) -> MessageRecord {
        let text = match &self.translator {
            Some(translator) => translator.translate(message),
            None => message.to_string(),
        };
        MessageRecord {
            id: message.id.clone(),
            text,
            description: message.description.clone(),
            timestamp: message.timestamp,
            debug: message.debug.clone(),
            level: message.level,
            priority: message.priority,
        }
    }

    /// Project every field of a detail-state node, one result per key.
    pub fn detail(&self, node: &RemoteNode) -> Vec<(String, Result<Value, ProjectionError>)> {
        node.fields()
            .iter()
            .filter(|(key, _)| key.as_str() != PARENT_KEY)
            .map(|(key, value)| (key.clone(), self.detail_value(key, value)))
            .collect()
    }

    /// Project a detail-state node, keeping only the fields that project.
    pub fn detail_snapshot(&self, component: &str, node: &RemoteNode) -> DetailSnapshot {
        DetailSnapshot {
            component: component.to_owned(),
            fields: self
                .detail(node)
                .into_iter()
                .filter_map(|(key, value)| value.ok().map(|v| (key, v)))
                .collect(),
        }
    }

    /// Project one detail-state field.
    pub fn detail_value(&self, key: &str, value: &RemoteValue) -> Result<Value, ProjectionError> {
        self.flat(key, value, EXPANDED_DETAIL_KEYS.contains(&key))
    }

    /// Best-effort projection of a remote call result. Nodes become `null`.
    pub fn result_value(&self, value: &RemoteValue) -> Value {
        self.flat("result", value, false).unwrap_or(Value::Null)
    }

    fn flat(&self, key: &str, value: &RemoteValue, expand: bool) -> Result<Value, ProjectionError> {
        match value {
            RemoteValue::Scalar(v) => Ok(v.clone()),
            RemoteValue::Message(message) => Ok(serde_json::to_value(self.message(message)).unwrap_or_default()),
            RemoteValue::List(items) => items
                .iter()
                .map(|item| self.flat(key, item, expand))
                .collect::<Result<Vec<_>, _>>()
                .map(Value::Array),
            RemoteValue::Node(node) if expand => self.nested(node).map(Value::Object),
            RemoteValue::Node(_) => Err(ProjectionError::NestedNode { key: key.to_owned() }),
        }
    }

    fn nested(&self, node: &RemoteNode) -> Result<Map<String, Value>, ProjectionError> {
        let mut map = Map::new();
        for (key, value) in node.fields().iter() {
            if key != PARENT_KEY {
                map.insert(key.clone(), self.detail_value(key, value)?);
            }
        }
        Ok(map)
    }
}

#[cfg(test)]
#[allow(clippy::unwrap_used)]
mod tests {
    use super::*;
    use flumirror_api::{MessageLevel, Translatable};
    use pretty_assertions::assert_eq;
    use serde_json::json;

    fn warning() -> Message {
        Message {
            id: json!(1),
            level: MessageLevel::Warning,
            priority: 50,
            translatables: vec![Translatable {
                format: "Could not open %s (%d%% done)".into(),
                args: vec![json!("/dev/video0"), json!(40)],
            }],
            description: Some("device busy".into()),
            timestamp: Some(1_200_000_000),
            debug: None,
        }
    }

    #[test]
    fn component_projection_expands_messages_and_drops_parent() {
        let flow = RemoteNode::from_pairs([("name", "default")]);
        let node = RemoteNode::from_pairs([
            ("name", RemoteValue::from("enc1")),
            ("mood", RemoteValue::from(4_i64)),
            ("workerName", RemoteValue::from("localhost")),
            ("pid", RemoteValue::from(4242_i64)),
            ("messages", RemoteValue::List(vec![warning().into()])),
            ("parent", RemoteValue::Node(flow)),
        ]);

        let record = Projector::translating().component(&node);

        assert_eq!(record.name, "enc1");
        assert_eq!(record.mood, Some(4));
        assert_eq!(record.attributes.get("parent"), None);
        assert_eq!(record.attribute("workerName"), Some(&json!("localhost")));
        assert_eq!(record.attribute("pid"), Some(&json!(4242)));

        let messages = record.messages.as_ref().unwrap();
        assert_eq!(messages.len(), 1);
        assert_eq!(messages[0].text, "Could not open /dev/video0 (40% done)");
        assert_eq!(messages[0].level, MessageLevel::Warning);

        let json = serde_json::to_value(&record).unwrap();
        assert_eq!(json["messages"][0]["id"], 1);
        assert_eq!(json["messages"][0]["level"], "warning");
        assert_eq!(json["messages"][0]["description"], "device busy");
        assert!(json.get("parent").is_none());
    }

    #[test]
    fn untranslated_messages_use_plain_rendering() {
        let record = Projector::default().message(&warning());
        assert_eq!(record.text, "[warning] Could not open %s (%d%% done)");
    }

    #[test]
    fn nested_node_attribute_is_left_out() {
        let node = RemoteNode::from_pairs([
            ("name", RemoteValue::from("enc1")),
            ("config", RemoteValue::Node(RemoteNode::from_pairs([("a", 1_i64)]))),
        ]);
        let record = Projector::default().component(&node);
        assert!(record.attributes.is_empty());
    }

    #[test]
    fn detail_projection_expands_well_known_lists() {
        let feeder = RemoteNode::from_pairs([
            ("feederName", RemoteValue::from("video")),
            ("clients", RemoteValue::List(vec![RemoteNode::from_pairs([("client", "c1")]).into()])),
        ]);
        let parent = RemoteNode::from_pairs([("name", "enc1")]);
        let detail = RemoteNode::from_pairs([
            ("feeders", RemoteValue::List(vec![feeder.into()])),
            ("bitrate", RemoteValue::from(128_000_i64)),
            ("stats", RemoteValue::Node(RemoteNode::from_pairs([("x", 1_i64)]))),
            ("parent", RemoteValue::Node(parent)),
        ]);

        let projected = Projector::default().detail(&detail);
        let keys: Vec<&str> = projected.iter().map(|(k, _)| k.as_str()).collect();
        assert_eq!(keys, ["feeders", "bitrate", "stats"]);

        assert_eq!(
            projected[0].1.clone().unwrap(),
            json!([{ "feederName": "video", "clients": [{ "client": "c1" }] }])
        );
        assert_eq!(projected[1].1.clone().unwrap(), json!(128_000));
        assert_eq!(
            projected[2].1,
            Err(ProjectionError::NestedNode { key: "stats".into() })
        );

        let snapshot = Projector::default().detail_snapshot("enc1", &detail);
        assert_eq!(snapshot.fields.len(), 2);
    }

    #[test]
    fn printf_leaves_missing_args_verbatim() {
        assert_eq!(format_printf("%s and %s", &[json!("a")]), "a and %s");
        assert_eq!(format_printf("100%", &[]), "100%");
        assert_eq!(format_printf("%r", &[json!("q")]), "\"q\"");
        assert_eq!(format_printf("%d", &[json!(2.7)]), "2");
    }
}
