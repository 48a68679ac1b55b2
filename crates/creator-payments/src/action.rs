//! Monetization Actions
//!
//! The kinds of paid/credit-funded actions a viewer can perform, where they
//! happen, and which credit counter funds each of them.

use serde::{Deserialize, Serialize};
use std::str::FromStr;

use crate::error::PaymentError;

/// Delimiter between a target id and its sub-key (`post123::🔥`)
pub const SUB_KEY_DELIMITER: &str = "::";

/// A monetization action performed against creator content
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "UPPERCASE")]
pub enum ActionKind {
    Reaction,
    Vote,
    Tip,
    Boost,
    Spin,
}

impl ActionKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            ActionKind::Reaction => "REACTION",
            ActionKind::Vote => "VOTE",
            ActionKind::Tip => "TIP",
            ActionKind::Boost => "BOOST",
            ActionKind::Spin => "SPIN",
        }
    }

    /// Credit counter that funds one of these actions
    pub fn credit_kind(&self) -> CreditKind {
        match self {
            ActionKind::Tip | ActionKind::Reaction | ActionKind::Vote => CreditKind::Tips,
            ActionKind::Boost => CreditKind::Boosts,
            ActionKind::Spin => CreditKind::Spins,
        }
    }

    /// Maximum entries per viewer and base target, `None` when uncapped
    pub fn cap(&self) -> Option<u32> {
        match self {
            ActionKind::Reaction => Some(10),
            ActionKind::Vote => Some(20),
            ActionKind::Tip | ActionKind::Boost | ActionKind::Spin => None,
        }
    }
}

impl FromStr for ActionKind {
    type Err = PaymentError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_ascii_lowercase().as_str() {
            "reaction" => Ok(ActionKind::Reaction),
            "vote" => Ok(ActionKind::Vote),
            "tip" => Ok(ActionKind::Tip),
            "boost" => Ok(ActionKind::Boost),
            "spin" => Ok(ActionKind::Spin),
            other => Err(PaymentError::UnknownMode(other.to_string())),
        }
    }
}

impl std::fmt::Display for ActionKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Surface the action was performed on
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "UPPERCASE")]
pub enum Source {
    #[default]
    Feed,
    Live,
}

impl Source {
    pub fn as_str(&self) -> &'static str {
        match self {
            Source::Feed => "FEED",
            Source::Live => "LIVE",
        }
    }
}

impl FromStr for Source {
    type Err = PaymentError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_ascii_lowercase().as_str() {
            "feed" => Ok(Source::Feed),
            "live" => Ok(Source::Live),
            other => Err(PaymentError::WebhookParse(format!("unknown source '{other}'"))),
        }
    }
}

/// Credit counters held per user
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum CreditKind {
    Tips,
    Boosts,
    Spins,
}

impl CreditKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            CreditKind::Tips => "tips",
            CreditKind::Boosts => "boosts",
            CreditKind::Spins => "spins",
        }
    }

    /// Action a pack of these credits is sold as
    pub fn action(&self) -> ActionKind {
        match self {
            CreditKind::Tips => ActionKind::Tip,
            CreditKind::Boosts => ActionKind::Boost,
            CreditKind::Spins => ActionKind::Spin,
        }
    }
}

impl std::fmt::Display for CreditKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Split `post123::🔥` into (`post123`, `Some("🔥")`)
pub fn split_target(target_id: &str) -> (&str, Option<&str>) {
    match target_id.split_once(SUB_KEY_DELIMITER) {
        Some((base, sub)) if !sub.is_empty() => (base, Some(sub)),
        Some((base, _)) => (base, None),
        None => (target_id, None),
    }
}
