use super::*;
use shared::{
    domain::{ParticipantId, Role, SessionState, UserId},
    error::ApiError,
    protocol::{CategoryLeader, CategoryStanding, RankedOption, VoteProgress},
};

fn category(id: i64) -> Category {
    Category {
        category_id: CategoryId(id),
        title: format!("Category {id}"),
        ordering: id,
    }
}

fn options(category_id: i64) -> Vec<VoteOption> {
    (1..=3)
        .map(|n| VoteOption {
            option_id: OptionId(category_id * 10 + n),
            category_id: CategoryId(category_id),
            name: format!("option {n}"),
            image: None,
        })
        .collect()
}

fn state(category_id: i64, phase: Phase, locked: bool) -> SessionState {
    SessionState {
        current_category_id: CategoryId(category_id),
        phase,
        locked,
        updated_at: None,
    }
}

fn snapshot(category_id: i64, phase: Phase, voted: Option<i64>) -> VoteSnapshot {
    VoteSnapshot {
        state: state(category_id, phase, false),
        category: (category_id != 0).then(|| category(category_id)),
        options: if phase == Phase::Voting && category_id != 0 {
            options(category_id)
        } else {
            Vec::new()
        },
        voted_option: voted.map(OptionId),
    }
}

fn participant() -> Identity {
    Identity {
        user_id: UserId(1),
        username: "ana".into(),
        participant_id: Some(ParticipantId(7)),
        role: Role::Participant,
    }
}

fn recorded(category_id: i64, option_id: i64) -> Result<SubmitVoteResponse, ClientError> {
    Ok(SubmitVoteResponse {
        outcome: VoteOutcome::Recorded,
        category_id: CategoryId(category_id),
        option_id: OptionId(option_id),
    })
}

#[test]
fn lobby_renders_waiting() {
    let mut view = VoteView::new();
    assert_eq!(view.render(), VoteScreen::Loading);
    view.apply(snapshot(0, Phase::Lobby, None));
    assert_eq!(view.render(), VoteScreen::Waiting);
    assert_eq!(
        view.begin_submit(&participant()),
        Err(VoteGuard::Closed)
    );
}

#[test]
fn ballot_moves_through_submitting_to_voted() {
    let mut view = VoteView::new();
    view.apply(snapshot(1, Phase::Voting, None));
    assert_eq!(
        view.begin_submit(&participant()),
        Err(VoteGuard::NothingSelected)
    );

    view.select(OptionId(12)).expect("select");
    let request = view.begin_submit(&participant()).expect("request");
    assert_eq!(request.category_id, CategoryId(1));
    assert_eq!(request.option_id, OptionId(12));
    assert_eq!(view.status(), BallotStatus::Submitting);
    assert_eq!(
        view.begin_submit(&participant()),
        Err(VoteGuard::Submitting)
    );

    view.finish_submit(&recorded(1, 12));
    assert_eq!(view.status(), BallotStatus::Voted);
    match view.render() {
        VoteScreen::Registered { choice, .. } => {
            assert_eq!(choice.map(|o| o.option_id), Some(OptionId(12)));
        }
        other => panic!("expected registered, got {other:?}"),
    }
    assert_eq!(
        view.begin_submit(&participant()),
        Err(VoteGuard::AlreadyVoted)
    );
}

#[test]
fn already_voted_lands_in_the_same_state_as_recorded() {
    let mut view = VoteView::new();
    view.apply(snapshot(1, Phase::Voting, None));
    view.select(OptionId(11)).expect("select");
    view.begin_submit(&participant()).expect("request");
    view.finish_submit(&Ok(SubmitVoteResponse {
        outcome: VoteOutcome::AlreadyVoted,
        category_id: CategoryId(1),
        option_id: OptionId(13),
    }));
    assert_eq!(view.status(), BallotStatus::Voted);
    assert!(matches!(
        view.render(),
        VoteScreen::Registered { choice: Some(ref o), .. } if o.option_id == OptionId(13)
    ));
}

#[test]
fn failed_submit_returns_to_not_voted_with_message() {
    let mut view = VoteView::new();
    view.apply(snapshot(1, Phase::Voting, None));
    view.select(OptionId(11)).expect("select");
    view.begin_submit(&participant()).expect("request");
    view.finish_submit(&Err(ClientError::Api(ApiError::conflict(
        "category is no longer active",
    ))));
    assert_eq!(view.status(), BallotStatus::NotVoted);
    assert_eq!(view.error.as_deref(), Some("category is no longer active"));
}

#[test]
fn new_category_resets_selection_and_status() {
    let mut view = VoteView::new();
    view.apply(snapshot(1, Phase::Voting, None));
    view.select(OptionId(11)).expect("select");
    view.begin_submit(&participant()).expect("request");
    view.finish_submit(&recorded(1, 11));

    view.apply(snapshot(2, Phase::Voting, None));
    assert_eq!(view.status(), BallotStatus::NotVoted);
    assert_eq!(view.selected(), None);
    assert!(matches!(view.render(), VoteScreen::Ballot { selected: None, .. }));
}

#[test]
fn server_side_vote_is_respected_after_refresh() {
    let mut view = VoteView::new();
    view.apply(snapshot(2, Phase::Voting, Some(21)));
    assert_eq!(view.status(), BallotStatus::Voted);
    assert_eq!(
        view.begin_submit(&participant()),
        Err(VoteGuard::AlreadyVoted)
    );
}

#[test]
fn results_phase_never_offers_options() {
    let mut view = VoteView::new();
    view.apply(snapshot(1, Phase::Voting, None));
    view.select(OptionId(11)).expect("select");

    view.apply(snapshot(1, Phase::Results, None));
    assert_eq!(view.selected(), None);
    assert_eq!(view.select(OptionId(11)), Err(VoteGuard::Closed));
    assert!(matches!(view.render(), VoteScreen::Closed { .. }));
    assert_eq!(
        render_vote(&view.render()),
        vec!["Category 1: voting is closed.".to_string()]
    );
}

#[test]
fn locked_ballot_and_missing_participant_are_guarded() {
    let mut view = VoteView::new();
    let mut locked = snapshot(1, Phase::Voting, None);
    locked.state.locked = true;
    view.apply(locked);
    view.select(OptionId(11)).expect("select");
    assert_eq!(view.begin_submit(&participant()), Err(VoteGuard::Locked));

    let unlinked = Identity {
        participant_id: None,
        ..participant()
    };
    assert_eq!(view.begin_submit(&unlinked), Err(VoteGuard::NoParticipant));
    assert_eq!(view.select(OptionId(99)), Err(VoteGuard::UnknownOption));
}

#[test]
fn stale_response_after_round_change_does_not_mark_voted() {
    let mut view = VoteView::new();
    view.apply(snapshot(1, Phase::Voting, None));
    view.select(OptionId(11)).expect("select");
    view.begin_submit(&participant()).expect("request");

    view.apply(snapshot(2, Phase::Voting, None));
    view.finish_submit(&recorded(1, 11));
    assert_eq!(view.status(), BallotStatus::NotVoted);
}

#[test]
fn host_panel_reflects_progress_and_gate() {
    let snapshot = HostSnapshot {
        state: state(1, Phase::Voting, false),
        category: Some(category(1)),
        options: options(1),
        progress: Some(VoteProgress {
            category_id: CategoryId(1),
            voted_count: 2,
            total_participants: 3,
        }),
        next_enabled: false,
    };
    let panel = host_panel(&snapshot);
    assert!(!panel.next_enabled);
    assert!(panel.can_show_results);
    assert!(panel.lines.contains(&"Voted: 2/3".to_string()));

    let lobby = HostSnapshot {
        state: state(0, Phase::Lobby, false),
        category: None,
        options: Vec::new(),
        progress: None,
        next_enabled: false,
    };
    let panel = host_panel(&lobby);
    assert!(!panel.can_show_results);
    assert_eq!(panel.lines, vec!["Lobby: waiting for participants.".to_string()]);
}

#[test]
fn screen_and_results_rendering() {
    let lines = render_screen(&ScreenSnapshot::Lobby, "http://vote.local/");
    assert_eq!(lines[1], "Join at http://vote.local/");

    let results = ScreenSnapshot::Results {
        category: category(1),
        top: vec![
            RankedOption {
                rank: 1,
                option_id: OptionId(12),
                name: "option 2".into(),
                image: None,
                vote_count: 3,
            },
            RankedOption {
                rank: 2,
                option_id: OptionId(11),
                name: "option 1".into(),
                image: None,
                vote_count: 1,
            },
        ],
    };
    let lines = render_screen(&results, "");
    assert_eq!(lines[1], "  #1 option 2 (3 votes)");
    assert_eq!(lines[2], "  #2 option 1 (1 vote)");

    let standings = ResultsSnapshot {
        state: state(2, Phase::Results, false),
        standings: vec![
            CategoryStanding {
                category: category(1),
                leader: Some(CategoryLeader {
                    option_id: OptionId(12),
                    name: "option 2".into(),
                    image: None,
                }),
            },
            CategoryStanding {
                category: category(2),
                leader: None,
            },
        ],
    };
    assert_eq!(
        render_results(&standings),
        vec![
            "Category 1: option 2".to_string(),
            "Category 2: no votes yet".to_string()
        ]
    );
}
