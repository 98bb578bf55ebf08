use serde::{Deserialize, Serialize};
use strum::{Display, EnumIter, EnumString};

/// Lifecycle status of a component, as reported in its `mood` field.
///
/// Only `Happy` means the component is running normally; every other
/// mood is a transitional or failed state.
#[derive(
    Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize, Display, EnumString, EnumIter,
)]
#[serde(rename_all = "lowercase")]
#[strum(serialize_all = "lowercase", ascii_case_insensitive)]
pub enum Mood {
    Happy,
    Hungry,
    Waking,
    Sleeping,
    Lost,
    Sad,
}

impl Mood {
    /// Decode the wire code. Unknown codes yield `None`.
    pub fn from_code(code: i64) -> Option<Self> {
        Some(match code {
            0 => Self::Happy,
            1 => Self::Hungry,
            2 => Self::Waking,
            3 => Self::Sleeping,
            4 => Self::Lost,
            5 => Self::Sad,
            _ => return None,
        })
    }

    pub fn code(self) -> i64 {
        match self {
            Self::Happy => 0,
            Self::Hungry => 1,
            Self::Waking => 2,
            Self::Sleeping => 3,
            Self::Lost => 4,
            Self::Sad => 5,
        }
    }

    pub fn is_happy(self) -> bool {
        self == Self::Happy
    }
}

#[cfg(test)]
#[allow(clippy::unwrap_used)]
mod tests {
    use super::*;
    use strum::IntoEnumIterator;

    #[test]
    fn codes_round_trip() {
        for mood in Mood::iter() {
            assert_eq!(Mood::from_code(mood.code()), Some(mood));
        }
        assert_eq!(Mood::from_code(9), None);
    }

    #[test]
    fn parses_names_case_insensitively() {
        assert_eq!("SAD".parse::<Mood>().unwrap(), Mood::Sad);
        assert_eq!(Mood::Lost.to_string(), "lost");
    }
}
