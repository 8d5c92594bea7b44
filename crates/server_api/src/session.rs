//! Host commands. Each one reads the session state, decides, and writes the
//! singleton row while holding the writer lock.

use shared::{
    domain::{AdvancePolicy, Category, CategoryId, ParticipantId, Phase, SessionState},
    error::ApiError,
    protocol::{
        next_gate_open, ChangeKind, ChangeTable, ClearResponse, ClearScope, Identity,
        TransitionResponse,
    },
};
use tracing::{info, warn};

use crate::{internal, ApiContext};

pub fn require_admin(identity: &Identity) -> Result<(), ApiError> {
    if identity.is_admin() {
        Ok(())
    } else {
        warn!(user_id = identity.user_id.0, "host command from non-admin");
        Err(ApiError::forbidden("host access required"))
    }
}

/// Voting endpoints are for participants only; hosts get a participant row
/// too but never a ballot.
pub fn require_participant(identity: &Identity) -> Result<ParticipantId, ApiError> {
    let participant_id = identity
        .participant_id
        .ok_or_else(|| ApiError::forbidden("no participant is linked to this account"))?;
    if identity.is_admin() {
        return Err(ApiError::forbidden("hosts do not vote"));
    }
    Ok(participant_id)
}

pub async fn open_voting(
    ctx: &ApiContext,
    identity: &Identity,
) -> Result<TransitionResponse, ApiError> {
    require_admin(identity)?;
    let _writer = ctx.write_lock().await;
    let state = load_state(ctx).await?;

    let category_id = if state.current_category_id.is_lobby() {
        first_category(ctx)
            .await?
            .map(|c| c.category_id)
            .ok_or_else(|| ApiError::conflict("there are no categories to vote on"))?
    } else {
        state.current_category_id
    };
    write(ctx, &state, category_id, Phase::Voting, false).await
}

pub async fn show_results(
    ctx: &ApiContext,
    identity: &Identity,
) -> Result<TransitionResponse, ApiError> {
    require_admin(identity)?;
    let _writer = ctx.write_lock().await;
    let state = load_state(ctx).await?;
    if state.current_category_id.is_lobby() {
        return Err(ApiError::conflict("no category is active"));
    }
    write(ctx, &state, state.current_category_id, Phase::Results, state.locked).await
}

/// Moves to the next category. Without `force` the host may only advance
/// once every participant has voted. At the last category a forced advance
/// follows the configured [`AdvancePolicy`]; everything else is a no-op.
pub async fn advance(
    ctx: &ApiContext,
    identity: &Identity,
    force: bool,
) -> Result<TransitionResponse, ApiError> {
    require_admin(identity)?;
    let _writer = ctx.write_lock().await;
    let state = load_state(ctx).await?;

    if !force {
        let progress = if state.current_category_id.is_lobby() {
            None
        } else {
            Some(
                ctx.storage
                    .vote_progress(state.current_category_id)
                    .await
                    .map_err(internal)?,
            )
        };
        if !next_gate_open(&state, progress.as_ref()) {
            return Err(ApiError::conflict("not every participant has voted"));
        }
    }

    let categories = ctx.storage.list_categories().await.map_err(internal)?;
    let target = match next_after(&categories, state.current_category_id) {
        Some(next) => Some(next),
        None if force && ctx.advance_policy == AdvancePolicy::Wrap => categories.first(),
        None => None,
    };

    let Some(target) = target else {
        info!(
            category_id = state.current_category_id.0,
            force, "advance requested with no next category"
        );
        return Ok(TransitionResponse {
            state,
            moved: false,
        });
    };
    write(ctx, &state, target.category_id, Phase::Voting, false).await
}

pub async fn reset_to_lobby(
    ctx: &ApiContext,
    identity: &Identity,
) -> Result<TransitionResponse, ApiError> {
    require_admin(identity)?;
    let _writer = ctx.write_lock().await;
    let state = load_state(ctx).await?;
    write(ctx, &state, CategoryId::LOBBY, Phase::Lobby, false).await
}

pub async fn set_locked(
    ctx: &ApiContext,
    identity: &Identity,
    locked: bool,
) -> Result<TransitionResponse, ApiError> {
    require_admin(identity)?;
    let _writer = ctx.write_lock().await;
    let state = load_state(ctx).await?;
    write(ctx, &state, state.current_category_id, state.phase, locked).await
}

pub async fn clear(
    ctx: &ApiContext,
    identity: &Identity,
    scope: ClearScope,
) -> Result<ClearResponse, ApiError> {
    require_admin(identity)?;
    let _writer = ctx.write_lock().await;

    let response = match scope {
        ClearScope::Votes => ClearResponse {
            votes_deleted: ctx.storage.clear_votes().await.map_err(internal)?,
            participants_deleted: 0,
        },
        ClearScope::All => {
            let cleared = ctx
                .storage
                .clear_participants_and_votes()
                .await
                .map_err(internal)?;
            ClearResponse {
                votes_deleted: cleared.votes,
                participants_deleted: cleared.participants,
            }
        }
    };
    info!(
        ?scope,
        votes = response.votes_deleted,
        participants = response.participants_deleted,
        "cleared"
    );

    ctx.publish(ChangeTable::Votes, ChangeKind::Delete);
    if scope == ClearScope::All {
        ctx.publish(ChangeTable::Participants, ChangeKind::Delete);
    }
    Ok(response)
}

pub(crate) async fn load_state(ctx: &ApiContext) -> Result<SessionState, ApiError> {
    ctx.storage
        .session_state()
        .await
        .map_err(internal)?
        .ok_or_else(|| ApiError::not_found("session state is not initialized"))
}

async fn first_category(ctx: &ApiContext) -> Result<Option<Category>, ApiError> {
    Ok(ctx
        .storage
        .list_categories()
        .await
        .map_err(internal)?
        .into_iter()
        .next())
}

/// From the lobby (or an id that no longer exists) the next category is the
/// first one.
fn next_after(categories: &[Category], current: CategoryId) -> Option<&Category> {
    match categories.iter().position(|c| c.category_id == current) {
        Some(index) => categories.get(index + 1),
        None => categories.first(),
    }
}

async fn write(
    ctx: &ApiContext,
    before: &SessionState,
    category_id: CategoryId,
    phase: Phase,
    locked: bool,
) -> Result<TransitionResponse, ApiError> {
    let state = ctx
        .storage
        .write_session_state(category_id, phase, locked)
        .await
        .map_err(internal)?;
    info!(
        from_category = before.current_category_id.0,
        from_phase = %before.phase,
        to_category = state.current_category_id.0,
        to_phase = %state.phase,
        locked = state.locked,
        "session state changed"
    );
    ctx.publish(ChangeTable::SessionState, ChangeKind::Update);
    Ok(TransitionResponse { state, moved: true })
}

#[cfg(test)]
mod tests {
    use super::*;

    fn categories() -> Vec<Category> {
        [(3, 1), (1, 2), (2, 2)]
            .into_iter()
            .map(|(id, ordering)| Category {
                category_id: CategoryId(id),
                title: format!("c{id}"),
                ordering,
            })
            .collect()
    }

    #[test]
    fn next_after_follows_presentation_order() {
        let categories = categories();
        let ids = |c: Option<&Category>| c.map(|c| c.category_id.0);
        assert_eq!(ids(next_after(&categories, CategoryId::LOBBY)), Some(3));
        assert_eq!(ids(next_after(&categories, CategoryId(3))), Some(1));
        assert_eq!(ids(next_after(&categories, CategoryId(1))), Some(2));
        assert_eq!(ids(next_after(&categories, CategoryId(2))), None);
    }
}
