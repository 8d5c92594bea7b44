use std::{fmt, str::FromStr};

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use thiserror::Error;

macro_rules! id_newtype {
    ($name:ident) => {
        #[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
        pub struct $name(pub i64);
    };
}

id_newtype!(UserId);
id_newtype!(ParticipantId);
id_newtype!(CategoryId);
id_newtype!(OptionId);

impl CategoryId {
    /// Sentinel stored in the session state while no category is active.
    pub const LOBBY: CategoryId = CategoryId(0);

    pub fn is_lobby(self) -> bool {
        self.0 == 0
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Phase {
    #[default]
    Lobby,
    #[serde(alias = "vote")]
    Voting,
    Results,
}

impl Phase {
    pub fn as_str(self) -> &'static str {
        match self {
            Phase::Lobby => "lobby",
            Phase::Voting => "voting",
            Phase::Results => "results",
        }
    }
}

impl fmt::Display for Phase {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Error)]
#[error("unknown {kind} '{value}'")]
pub struct UnknownVariant {
    pub kind: &'static str,
    pub value: String,
}

impl FromStr for Phase {
    type Err = UnknownVariant;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_ascii_lowercase().as_str() {
            "lobby" => Ok(Phase::Lobby),
            "voting" | "vote" => Ok(Phase::Voting),
            "results" => Ok(Phase::Results),
            other => Err(UnknownVariant {
                kind: "phase",
                value: other.to_string(),
            }),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Role {
    Admin,
    #[default]
    Participant,
}

impl Role {
    pub fn as_str(self) -> &'static str {
        match self {
            Role::Admin => "admin",
            Role::Participant => "participant",
        }
    }

    pub fn is_admin(self) -> bool {
        matches!(self, Role::Admin)
    }
}

impl FromStr for Role {
    type Err = UnknownVariant;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_ascii_lowercase().as_str() {
            "admin" => Ok(Role::Admin),
            "participant" => Ok(Role::Participant),
            other => Err(UnknownVariant {
                kind: "role",
                value: other.to_string(),
            }),
        }
    }
}

/// What a forced advance does when the current category is the last one.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum AdvancePolicy {
    /// Start over at the first category.
    Wrap,
    /// Stay where we are.
    #[default]
    Halt,
}

impl AdvancePolicy {
    pub fn as_str(self) -> &'static str {
        match self {
            AdvancePolicy::Wrap => "wrap",
            AdvancePolicy::Halt => "halt",
        }
    }
}

impl FromStr for AdvancePolicy {
    type Err = UnknownVariant;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_ascii_lowercase().as_str() {
            "wrap" => Ok(AdvancePolicy::Wrap),
            "halt" => Ok(AdvancePolicy::Halt),
            other => Err(UnknownVariant {
                kind: "advance policy",
                value: other.to_string(),
            }),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Participant {
    pub participant_id: ParticipantId,
    pub name: String,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Category {
    pub category_id: CategoryId,
    pub title: String,
    pub ordering: i64,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct VoteOption {
    pub option_id: OptionId,
    pub category_id: CategoryId,
    pub name: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub image: Option<String>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SessionState {
    pub current_category_id: CategoryId,
    pub phase: Phase,
    pub locked: bool,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub updated_at: Option<DateTime<Utc>>,
}

impl SessionState {
    pub fn in_lobby(&self) -> bool {
        self.current_category_id.is_lobby() || self.phase == Phase::Lobby
    }

    pub fn accepts_votes(&self) -> bool {
        !self.current_category_id.is_lobby() && self.phase == Phase::Voting && !self.locked
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Profile {
    pub user_id: UserId,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub participant_id: Option<ParticipantId>,
    pub role: Role,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn legacy_vote_phase_decodes_as_voting() {
        let phase: Phase = serde_json::from_str("\"vote\"").expect("phase");
        assert_eq!(phase, Phase::Voting);
        assert_eq!(serde_json::to_string(&phase).expect("json"), "\"voting\"");
        assert_eq!("vote".parse::<Phase>(), Ok(Phase::Voting));
    }

    #[test]
    fn lobby_sentinel_blocks_votes_even_when_phase_is_voting() {
        let state = SessionState {
            current_category_id: CategoryId::LOBBY,
            phase: Phase::Voting,
            locked: false,
            updated_at: None,
        };
        assert!(state.in_lobby());
        assert!(!state.accepts_votes());
    }

    #[test]
    fn rejects_unknown_policy() {
        let err = "loop".parse::<AdvancePolicy>().expect_err("should fail");
        assert_eq!(err.to_string(), "unknown advance policy 'loop'");
    }
}
