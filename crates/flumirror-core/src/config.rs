// ── Runtime bridge configuration ──
//
// These types describe *what* the bridge mirrors and *where* it publishes.
// They never touch disk; the binary builds a `BridgeConfig` from its
// profile and hands it in.

use std::time::Duration;

use crate::model::Mood;

/// Which flow of the planet is mirrored.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum FlowSelection {
    /// Mirror only the flow with this name; nothing while it is absent.
    Named(String),
    /// Prefer the named flow, otherwise fall back to the first flow.
    NamedOrFirst(String),
}

impl Default for FlowSelection {
    fn default() -> Self {
        Self::NamedOrFirst("default".into())
    }
}

impl FlowSelection {
    pub fn preferred(&self) -> &str {
        match self {
            Self::Named(name) | Self::NamedOrFirst(name) => name,
        }
    }

    /// Index of the flow to mirror among `names`, in enumeration order.
    pub fn pick<'a, I>(&self, names: I) -> Option<usize>
    where
        I: IntoIterator<Item = Option<&'a str>>,
    {
        let names: Vec<Option<&str>> = names.into_iter().collect();
        let preferred = names.iter().position(|name| *name == Some(self.preferred()));
        match self {
            Self::Named(_) => preferred,
            Self::NamedOrFirst(_) => preferred.or((!names.is_empty()).then_some(0)),
        }
    }
}

/// When a component's detail subscription is dropped on a mood change.
#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub enum DetailRelease {
    /// Any mood other than happy, including codes this build does not know.
    #[default]
    AnyUnhappy,
    /// Only the listed moods.
    Moods(Vec<Mood>),
    Never,
}

impl DetailRelease {
    pub fn releases(&self, code: i64) -> bool {
        match self {
            Self::AnyUnhappy => Mood::from_code(code) != Some(Mood::Happy),
            Self::Moods(moods) => Mood::from_code(code).is_some_and(|mood| moods.contains(&mood)),
            Self::Never => false,
        }
    }
}

/// Configuration for one bridge instance.
#[derive(Debug, Clone)]
pub struct BridgeConfig {
    /// Root of every outbound destination (e.g. `/flumotion`).
    pub prefix: String,
    /// Inbound destination carrying poll requests.
    pub poll_destination: String,
    /// Inbound destination carrying command messages.
    pub command_destination: String,
    pub flow: FlowSelection,
    /// Period of the full snapshot. Zero publishes only at connect time.
    pub snapshot_interval: Duration,
    pub detail_release: DetailRelease,
    /// Render message text through the format translator. When off, the
    /// plain string rendering of each message is used.
    pub translate_messages: bool,
}

impl Default for BridgeConfig {
    fn default() -> Self {
        Self::with_prefix("/flumotion")
    }
}

impl BridgeConfig {
    /// Defaults with every destination derived from `prefix`.
    pub fn with_prefix(prefix: &str) -> Self {
        let prefix = prefix.trim_end_matches('/').to_owned();
        Self {
            poll_destination: format!("{prefix}/poll"),
            command_destination: format!("{prefix}/command"),
            prefix,
            flow: FlowSelection::default(),
            snapshot_interval: Duration::from_secs(5),
            detail_release: DetailRelease::default(),
            translate_messages: true,
        }
    }

    /// Destinations the broker link must subscribe to.
    pub fn inbound_destinations(&self) -> Vec<String> {
        vec![self.poll_destination.clone(), self.command_destination.clone()]
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn flow_selection_prefers_named_flow() {
        let names = [Some("aux"), Some("default")];
        assert_eq!(FlowSelection::default().pick(names), Some(1));
        assert_eq!(FlowSelection::default().pick([Some("aux")]), Some(0));
        assert_eq!(FlowSelection::Named("default".into()).pick([Some("aux")]), None);
        assert_eq!(FlowSelection::default().pick(Vec::<Option<&str>>::new()), None);
    }

    #[test]
    fn release_policy() {
        assert!(!DetailRelease::AnyUnhappy.releases(0));
        assert!(DetailRelease::AnyUnhappy.releases(5));
        assert!(DetailRelease::AnyUnhappy.releases(42));

        let only_sad = DetailRelease::Moods(vec![Mood::Sad]);
        assert!(only_sad.releases(5));
        assert!(!only_sad.releases(4));
        assert!(!DetailRelease::Never.releases(5));
    }

    #[test]
    fn destinations_follow_prefix() {
        let config = BridgeConfig::with_prefix("/site/");
        assert_eq!(config.prefix, "/site");
        assert_eq!(config.inbound_destinations(), ["/site/poll", "/site/command"]);
    }
}
