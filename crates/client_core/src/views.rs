//! Per-view client state and plain-text rendering.

use shared::{
    domain::{Category, CategoryId, OptionId, Phase, VoteOption},
    protocol::{
        HostSnapshot, Identity, ResultsSnapshot, ScreenSnapshot, SubmitVoteRequest,
        SubmitVoteResponse, VoteOutcome, VoteSnapshot,
    },
};
use thiserror::Error;
use tracing::{debug, info};

use crate::{ClientError, VotingApi};

/// Checks run locally before a vote is sent.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Error)]
pub enum VoteGuard {
    #[error("no participant is linked to this account")]
    NoParticipant,
    #[error("voting is closed")]
    Closed,
    #[error("voting is locked")]
    Locked,
    #[error("choose an option first")]
    NothingSelected,
    #[error("that option is not on the ballot")]
    UnknownOption,
    #[error("you already voted in this category")]
    AlreadyVoted,
    #[error("a vote is already being submitted")]
    Submitting,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum BallotStatus {
    #[default]
    NotVoted,
    Submitting,
    Voted,
}

/// What the vote page shows.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum VoteScreen {
    Loading,
    Waiting,
    Ballot {
        category: Category,
        options: Vec<VoteOption>,
        selected: Option<OptionId>,
        submitting: bool,
    },
    Registered {
        category: Category,
        choice: Option<VoteOption>,
    },
    Closed {
        category: Category,
    },
}

/// Ballot state for one participant. The selection and status belong to a
/// single (category, phase); a snapshot for a different pair starts over.
#[derive(Debug, Clone, Default)]
pub struct VoteView {
    snapshot: Option<VoteSnapshot>,
    round: Option<(CategoryId, Phase)>,
    selected: Option<OptionId>,
    status: BallotStatus,
    voted_option: Option<OptionId>,
    options_cache: Vec<VoteOption>,
    pub message: Option<String>,
    pub error: Option<String>,
}

impl VoteView {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn status(&self) -> BallotStatus {
        self.status
    }

    pub fn selected(&self) -> Option<OptionId> {
        self.selected
    }

    pub fn apply(&mut self, snapshot: VoteSnapshot) {
        let round = (
            snapshot.state.current_category_id,
            snapshot.state.phase,
        );
        let same_category = self.round.map(|(category, _)| category) == Some(round.0);
        if self.round != Some(round) {
            debug!(category_id = round.0 .0, phase = %round.1, "ballot round changed");
            self.round = Some(round);
            self.selected = None;
            self.error = None;
            self.message = None;
            if !same_category {
                self.voted_option = None;
                self.options_cache.clear();
            }
            if self.status != BallotStatus::Submitting {
                self.status = BallotStatus::NotVoted;
            }
        }
        if !snapshot.options.is_empty() {
            self.options_cache = snapshot.options.clone();
        }
        if let Some(option) = snapshot.voted_option {
            self.voted_option = Some(option);
            self.status = BallotStatus::Voted;
        }
        self.snapshot = Some(snapshot);
    }

    pub fn select(&mut self, option_id: OptionId) -> Result<(), VoteGuard> {
        let snapshot = self.snapshot.as_ref().ok_or(VoteGuard::Closed)?;
        if snapshot.state.phase != Phase::Voting {
            return Err(VoteGuard::Closed);
        }
        if !snapshot.options.iter().any(|o| o.option_id == option_id) {
            return Err(VoteGuard::UnknownOption);
        }
        self.selected = Some(option_id);
        Ok(())
    }

    /// Runs the local guards and moves to `Submitting`.
    pub fn begin_submit(&mut self, identity: &Identity) -> Result<SubmitVoteRequest, VoteGuard> {
        if identity.participant_id.is_none() {
            return Err(VoteGuard::NoParticipant);
        }
        match self.status {
            BallotStatus::Submitting => return Err(VoteGuard::Submitting),
            BallotStatus::Voted => return Err(VoteGuard::AlreadyVoted),
            BallotStatus::NotVoted => {}
        }
        let snapshot = self.snapshot.as_ref().ok_or(VoteGuard::Closed)?;
        let category = snapshot.category.as_ref().ok_or(VoteGuard::Closed)?;
        if !snapshot.state.accepts_votes() {
            return Err(if snapshot.state.locked && snapshot.state.phase == Phase::Voting {
                VoteGuard::Locked
            } else {
                VoteGuard::Closed
            });
        }
        let option_id = self.selected.ok_or(VoteGuard::NothingSelected)?;

        self.status = BallotStatus::Submitting;
        self.error = None;
        Ok(SubmitVoteRequest {
            category_id: category.category_id,
            option_id,
        })
    }

    pub fn finish_submit(&mut self, result: &Result<SubmitVoteResponse, ClientError>) {
        match result {
            Ok(response) if self.round.map(|(category, _)| category) != Some(response.category_id) => {
                // The round moved on while the request was in flight.
                self.status = BallotStatus::NotVoted;
            }
            Ok(response) => {
                self.status = BallotStatus::Voted;
                self.voted_option = Some(response.option_id);
                self.message = Some(match response.outcome {
                    VoteOutcome::Recorded => "vote registered".into(),
                    VoteOutcome::AlreadyVoted => "your vote was already registered".into(),
                });
            }
            Err(err) => {
                self.status = BallotStatus::NotVoted;
                self.error = Some(err.to_string());
            }
        }
    }

    /// Guards, sends and records the outcome of the selected vote.
    pub async fn submit<A>(
        &mut self,
        api: &A,
        identity: &Identity,
    ) -> Result<SubmitVoteResponse, ClientError>
    where
        A: VotingApi + ?Sized,
    {
        let request = match self.begin_submit(identity) {
            Ok(request) => request,
            Err(guard) => {
                self.error = Some(guard.to_string());
                return Err(guard.into());
            }
        };
        let result = api.submit_vote(&request).await;
        self.finish_submit(&result);
        if let Ok(response) = &result {
            info!(
                category_id = response.category_id.0,
                outcome = ?response.outcome,
                "vote submitted"
            );
        }
        result
    }

    pub fn render(&self) -> VoteScreen {
        let Some(snapshot) = &self.snapshot else {
            return VoteScreen::Loading;
        };
        let Some(category) = snapshot.category.clone() else {
            return VoteScreen::Waiting;
        };
        if snapshot.state.in_lobby() {
            return VoteScreen::Waiting;
        }
        match snapshot.state.phase {
            Phase::Lobby => VoteScreen::Waiting,
            Phase::Results => VoteScreen::Closed { category },
            Phase::Voting if self.status == BallotStatus::Voted => VoteScreen::Registered {
                choice: self
                    .voted_option
                    .and_then(|id| self.options_cache.iter().find(|o| o.option_id == id))
                    .cloned(),
                category,
            },
            Phase::Voting => VoteScreen::Ballot {
                category,
                options: snapshot.options.clone(),
                selected: self.selected,
                submitting: self.status == BallotStatus::Submitting,
            },
        }
    }
}

pub fn render_vote(screen: &VoteScreen) -> Vec<String> {
    match screen {
        VoteScreen::Loading => vec!["Loading...".into()],
        VoteScreen::Waiting => vec!["Waiting for the host to start voting.".into()],
        VoteScreen::Ballot {
            category,
            options,
            selected,
            submitting,
        } => {
            let mut lines = vec![format!("Vote: {}", category.title)];
            for option in options {
                let marker = if *selected == Some(option.option_id) { ">" } else { " " };
                lines.push(format!("{marker} [{}] {}", option.option_id.0, option.name));
            }
            if *submitting {
                lines.push("Submitting...".into());
            }
            lines
        }
        VoteScreen::Registered { category, choice } => {
            let mut lines = vec![format!("{}: vote registered.", category.title)];
            if let Some(choice) = choice {
                lines.push(format!("You picked {}.", choice.name));
            }
            lines.push("Waiting for the next category.".into());
            lines
        }
        VoteScreen::Closed { category } => {
            vec![format!("{}: voting is closed.", category.title)]
        }
    }
}

/// Host panel derived from a snapshot. `next_enabled` is computed by the
/// server from the same progress shown here.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct HostPanel {
    pub lines: Vec<String>,
    pub next_enabled: bool,
    pub can_show_results: bool,
}

pub fn host_panel(snapshot: &HostSnapshot) -> HostPanel {
    let state = &snapshot.state;
    let mut lines = Vec::new();
    match &snapshot.category {
        Some(category) if !state.in_lobby() => {
            lines.push(format!("Category: {} ({})", category.title, state.phase));
            for option in &snapshot.options {
                lines.push(format!("  [{}] {}", option.option_id.0, option.name));
            }
        }
        _ => lines.push("Lobby: waiting for participants.".into()),
    }
    if let Some(progress) = &snapshot.progress {
        lines.push(format!(
            "Voted: {}/{}",
            progress.voted_count, progress.total_participants
        ));
    }
    if state.locked {
        lines.push("Voting is locked.".into());
    }
    HostPanel {
        lines,
        next_enabled: snapshot.next_enabled,
        can_show_results: !state.current_category_id.is_lobby() && state.phase != Phase::Results,
    }
}

pub fn render_screen(snapshot: &ScreenSnapshot, join_url: &str) -> Vec<String> {
    match snapshot {
        ScreenSnapshot::Lobby => vec![
            "Welcome! Voting starts soon.".into(),
            format!("Join at {join_url}"),
        ],
        ScreenSnapshot::Voting { category, options } => {
            let mut lines = vec![format!("Now voting: {}", category.title)];
            lines.extend(options.iter().map(|o| format!("  {}", o.name)));
            lines
        }
        ScreenSnapshot::Results { category, top } => {
            let mut lines = vec![format!("Results: {}", category.title)];
            lines.extend(top.iter().map(|r| {
                let noun = if r.vote_count == 1 { "vote" } else { "votes" };
                format!("  #{} {} ({} {noun})", r.rank, r.name, r.vote_count)
            }));
            lines
        }
    }
}

pub fn render_results(snapshot: &ResultsSnapshot) -> Vec<String> {
    snapshot
        .standings
        .iter()
        .map(|standing| match &standing.leader {
            Some(leader) => format!("{}: {}", standing.category.title, leader.name),
            None => format!("{}: no votes yet", standing.category.title),
        })
        .collect()
}

#[cfg(test)]
#[path = "tests/views_tests.rs"]
mod tests;
