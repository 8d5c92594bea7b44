use shared::{
    domain::{CategoryId, OptionId, Phase},
    error::ApiError,
    protocol::{
        ChangeKind, ChangeTable, Identity, RankedOption, SubmitVoteResponse, VoteOutcome,
        VoteProgress,
    },
};
use storage::{OptionTally, VoteInsert};
use tracing::{debug, info, warn};

use crate::{
    internal,
    session::{load_state, require_admin, require_participant},
    ApiContext,
};

pub const TOP_N: u32 = 3;

/// Records one vote per participant per category. A repeated submission is
/// not an error: it reports `AlreadyVoted` with the choice that was kept,
/// even once the phase has moved on.
pub async fn submit_vote(
    ctx: &ApiContext,
    identity: &Identity,
    category_id: CategoryId,
    option_id: OptionId,
) -> Result<SubmitVoteResponse, ApiError> {
    let participant_id = require_participant(identity)?;

    let _writer = ctx.write_lock().await;
    if let Some(existing) = ctx
        .storage
        .vote_for(participant_id, category_id)
        .await
        .map_err(internal)?
    {
        debug!(
            participant_id = participant_id.0,
            category_id = category_id.0,
            "vote already on record"
        );
        return Ok(SubmitVoteResponse {
            outcome: VoteOutcome::AlreadyVoted,
            category_id,
            option_id: existing,
        });
    }

    let state = load_state(ctx).await?;
    if state.phase != Phase::Voting || state.current_category_id.is_lobby() {
        return Err(ApiError::conflict("voting is closed"));
    }
    if state.locked {
        return Err(ApiError::conflict("voting is locked"));
    }
    if state.current_category_id != category_id {
        warn!(
            participant_id = participant_id.0,
            submitted = category_id.0,
            current = state.current_category_id.0,
            "stale vote submission"
        );
        return Err(ApiError::conflict("category is no longer active"));
    }
    let option = ctx
        .storage
        .option(option_id)
        .await
        .map_err(internal)?
        .filter(|option| option.category_id == category_id)
        .ok_or_else(|| ApiError::validation("option does not belong to the active category"))?;

    let inserted = ctx
        .storage
        .insert_vote(participant_id, category_id, option.option_id)
        .await
        .map_err(internal)?;
    let response = match inserted {
        VoteInsert::Inserted => {
            info!(
                participant_id = participant_id.0,
                category_id = category_id.0,
                "vote recorded"
            );
            ctx.publish(ChangeTable::Votes, ChangeKind::Insert);
            SubmitVoteResponse {
                outcome: VoteOutcome::Recorded,
                category_id,
                option_id: option.option_id,
            }
        }
        VoteInsert::AlreadyVoted { option_id } => {
            debug!(
                participant_id = participant_id.0,
                category_id = category_id.0,
                "duplicate vote ignored"
            );
            SubmitVoteResponse {
                outcome: VoteOutcome::AlreadyVoted,
                category_id,
                option_id,
            }
        }
    };
    Ok(response)
}

pub async fn vote_progress(
    ctx: &ApiContext,
    identity: &Identity,
    category_id: CategoryId,
) -> Result<VoteProgress, ApiError> {
    require_admin(identity)?;
    ctx.storage
        .vote_progress(category_id)
        .await
        .map_err(internal)
}

pub async fn top3(ctx: &ApiContext, category_id: CategoryId) -> Result<Vec<RankedOption>, ApiError> {
    ctx.storage
        .category(category_id)
        .await
        .map_err(internal)?
        .ok_or_else(|| ApiError::not_found("category not found"))?;
    let tallies = ctx
        .storage
        .option_tallies(category_id, TOP_N)
        .await
        .map_err(internal)?;
    Ok(rank(tallies))
}

pub(crate) fn rank(tallies: Vec<OptionTally>) -> Vec<RankedOption> {
    tallies
        .into_iter()
        .zip(1u32..)
        .map(|(tally, rank)| RankedOption {
            rank,
            option_id: tally.option_id,
            name: tally.name,
            image: tally.image,
            vote_count: tally.vote_count,
        })
        .collect()
}
