use std::{fmt, str::FromStr};

use serde::{Deserialize, Serialize};

use crate::{
    domain::{
        Category, CategoryId, OptionId, ParticipantId, Phase, Role, SessionState, UnknownVariant,
        UserId, VoteOption,
    },
    routes::AppRoute,
};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ChangeTable {
    SessionState,
    Votes,
    Participants,
}

impl ChangeTable {
    pub fn as_str(self) -> &'static str {
        match self {
            ChangeTable::SessionState => "session_state",
            ChangeTable::Votes => "votes",
            ChangeTable::Participants => "participants",
        }
    }
}

impl FromStr for ChangeTable {
    type Err = UnknownVariant;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim() {
            "session_state" => Ok(ChangeTable::SessionState),
            "votes" => Ok(ChangeTable::Votes),
            "participants" => Ok(ChangeTable::Participants),
            other => Err(UnknownVariant {
                kind: "table",
                value: other.to_string(),
            }),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ChangeKind {
    Insert,
    Update,
    Delete,
}

impl ChangeKind {
    pub fn as_str(self) -> &'static str {
        match self {
            ChangeKind::Insert => "insert",
            ChangeKind::Update => "update",
            ChangeKind::Delete => "delete",
        }
    }
}

impl FromStr for ChangeKind {
    type Err = UnknownVariant;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim() {
            "insert" => Ok(ChangeKind::Insert),
            "update" => Ok(ChangeKind::Update),
            "delete" => Ok(ChangeKind::Delete),
            other => Err(UnknownVariant {
                kind: "change kind",
                value: other.to_string(),
            }),
        }
    }
}

/// Change notifications carry no row data: subscribers re-fetch whatever
/// they render.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "type", content = "payload", rename_all = "snake_case")]
pub enum ServerEvent {
    Changed { table: ChangeTable, kind: ChangeKind },
    /// The subscriber fell behind and missed events.
    Resync,
}

/// Per-table, per-kind subscription. Empty lists match everything.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct SubscriptionFilter {
    pub tables: Vec<ChangeTable>,
    pub kinds: Vec<ChangeKind>,
}

impl SubscriptionFilter {
    pub fn all() -> Self {
        Self::default()
    }

    pub fn tables(tables: &[ChangeTable]) -> Self {
        Self {
            tables: tables.to_vec(),
            kinds: Vec::new(),
        }
    }

    pub fn with_kinds(mut self, kinds: &[ChangeKind]) -> Self {
        self.kinds = kinds.to_vec();
        self
    }

    pub fn matches(&self, event: &ServerEvent) -> bool {
        match event {
            ServerEvent::Changed { table, kind } => {
                (self.tables.is_empty() || self.tables.contains(table))
                    && (self.kinds.is_empty() || self.kinds.contains(kind))
            }
            ServerEvent::Resync => true,
        }
    }

    /// Parses the comma separated `tables` / `kinds` query values of `/ws`.
    pub fn parse(tables: Option<&str>, kinds: Option<&str>) -> Result<Self, UnknownVariant> {
        Ok(Self {
            tables: parse_list(tables)?,
            kinds: parse_list(kinds)?,
        })
    }

    pub fn query_pairs(&self) -> Vec<(&'static str, String)> {
        let mut pairs = Vec::new();
        if !self.tables.is_empty() {
            let joined = self
                .tables
                .iter()
                .map(|t| t.as_str())
                .collect::<Vec<_>>()
                .join(",");
            pairs.push(("tables", joined));
        }
        if !self.kinds.is_empty() {
            let joined = self
                .kinds
                .iter()
                .map(|k| k.as_str())
                .collect::<Vec<_>>()
                .join(",");
            pairs.push(("kinds", joined));
        }
        pairs
    }
}

fn parse_list<T: FromStr<Err = UnknownVariant>>(raw: Option<&str>) -> Result<Vec<T>, UnknownVariant> {
    let Some(raw) = raw else {
        return Ok(Vec::new());
    };
    raw.split(',')
        .map(str::trim)
        .filter(|item| !item.is_empty())
        .map(T::from_str)
        .collect()
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Identity {
    pub user_id: UserId,
    pub username: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub participant_id: Option<ParticipantId>,
    pub role: Role,
}

impl Identity {
    pub fn is_admin(&self) -> bool {
        self.role.is_admin()
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RegisterRequest {
    pub email: String,
    pub password: String,
    pub username: String,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RegisterResponse {
    pub user_id: UserId,
    pub message: String,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SignInRequest {
    pub email: String,
    pub password: String,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SignInResponse {
    pub token: String,
    pub identity: Identity,
    pub route: AppRoute,
    pub message: String,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SubmitVoteRequest {
    pub category_id: CategoryId,
    pub option_id: OptionId,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum VoteOutcome {
    Recorded,
    /// A vote for this category already existed; `option_id` is that vote.
    AlreadyVoted,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SubmitVoteResponse {
    pub outcome: VoteOutcome,
    pub category_id: CategoryId,
    pub option_id: OptionId,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct AdvanceRequest {
    #[serde(default)]
    pub force: bool,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct TransitionResponse {
    pub state: SessionState,
    /// False when the command left the session state untouched.
    pub moved: bool,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LockRequest {
    pub locked: bool,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ClearScope {
    Votes,
    All,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ClearRequest {
    pub scope: ClearScope,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ClearResponse {
    pub votes_deleted: u64,
    pub participants_deleted: u64,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct VoteProgress {
    pub category_id: CategoryId,
    pub voted_count: u64,
    pub total_participants: u64,
}

impl VoteProgress {
    pub fn everyone_voted(&self) -> bool {
        self.total_participants > 0 && self.voted_count == self.total_participants
    }
}

/// The host's "Next" control: open only while voting and once every
/// participant has voted.
pub fn next_gate_open(state: &SessionState, progress: Option<&VoteProgress>) -> bool {
    if state.phase != Phase::Voting || state.current_category_id.is_lobby() {
        return false;
    }
    progress
        .filter(|p| p.category_id == state.current_category_id)
        .is_some_and(VoteProgress::everyone_voted)
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RankedOption {
    pub rank: u32,
    pub option_id: OptionId,
    pub name: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub image: Option<String>,
    pub vote_count: u64,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct CategoryLeader {
    pub option_id: OptionId,
    pub name: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub image: Option<String>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct CategoryStanding {
    pub category: Category,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub leader: Option<CategoryLeader>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct HostSnapshot {
    pub state: SessionState,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub category: Option<Category>,
    pub options: Vec<VoteOption>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub progress: Option<VoteProgress>,
    pub next_enabled: bool,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct VoteSnapshot {
    pub state: SessionState,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub category: Option<Category>,
    pub options: Vec<VoteOption>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub voted_option: Option<OptionId>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "phase", rename_all = "snake_case")]
pub enum ScreenSnapshot {
    Lobby,
    Voting {
        category: Category,
        options: Vec<VoteOption>,
    },
    Results {
        category: Category,
        top: Vec<RankedOption>,
    },
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ResultsSnapshot {
    pub state: SessionState,
    pub standings: Vec<CategoryStanding>,
}

impl fmt::Display for ChangeTable {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl fmt::Display for ChangeKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn voting_state(category: i64) -> SessionState {
        SessionState {
            current_category_id: CategoryId(category),
            phase: Phase::Voting,
            locked: false,
            updated_at: None,
        }
    }

    #[test]
    fn next_gate_requires_everyone_and_at_least_one_participant() {
        let state = voting_state(1);
        let progress = |voted, total| VoteProgress {
            category_id: CategoryId(1),
            voted_count: voted,
            total_participants: total,
        };
        assert!(!next_gate_open(&state, Some(&progress(0, 0))));
        assert!(!next_gate_open(&state, Some(&progress(1, 2))));
        assert!(next_gate_open(&state, Some(&progress(2, 2))));
        assert!(!next_gate_open(&state, None));

        let mut results = state.clone();
        results.phase = Phase::Results;
        assert!(!next_gate_open(&results, Some(&progress(2, 2))));
    }

    #[test]
    fn next_gate_ignores_progress_for_another_category() {
        let progress = VoteProgress {
            category_id: CategoryId(1),
            voted_count: 2,
            total_participants: 2,
        };
        assert!(!next_gate_open(&voting_state(2), Some(&progress)));
    }

    #[test]
    fn filter_parses_query_and_matches_events() {
        let filter =
            SubscriptionFilter::parse(Some("session_state, votes"), Some("update")).expect("filter");
        assert_eq!(
            filter.tables,
            vec![ChangeTable::SessionState, ChangeTable::Votes]
        );
        assert!(filter.matches(&ServerEvent::Changed {
            table: ChangeTable::SessionState,
            kind: ChangeKind::Update,
        }));
        assert!(!filter.matches(&ServerEvent::Changed {
            table: ChangeTable::Votes,
            kind: ChangeKind::Insert,
        }));
        assert!(filter.matches(&ServerEvent::Resync));

        assert!(SubscriptionFilter::parse(Some("winners"), None).is_err());
    }

    #[test]
    fn changed_event_wire_shape() {
        let event = ServerEvent::Changed {
            table: ChangeTable::Votes,
            kind: ChangeKind::Insert,
        };
        let json = serde_json::to_value(&event).expect("json");
        assert_eq!(
            json,
            serde_json::json!({
                "type": "changed",
                "payload": { "table": "votes", "kind": "insert" }
            })
        );
    }
}
