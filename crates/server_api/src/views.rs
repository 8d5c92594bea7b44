//! Read-side projections. Each view is rebuilt from storage on request; the
//! clients call these after every change notification.

use std::collections::HashMap;

use shared::{
    domain::{Category, CategoryId, Phase, SessionState, VoteOption},
    error::ApiError,
    protocol::{
        next_gate_open, CategoryLeader, CategoryStanding, HostSnapshot, Identity,
        ResultsSnapshot, ScreenSnapshot, VoteSnapshot,
    },
};

use crate::{
    internal,
    session::{load_state, require_admin, require_participant},
    voting::{rank, TOP_N},
    ApiContext,
};

pub async fn current_state(ctx: &ApiContext) -> Result<SessionState, ApiError> {
    load_state(ctx).await
}

pub async fn list_categories(ctx: &ApiContext) -> Result<Vec<Category>, ApiError> {
    ctx.storage.list_categories().await.map_err(internal)
}

pub async fn list_options(
    ctx: &ApiContext,
    category_id: CategoryId,
) -> Result<Vec<VoteOption>, ApiError> {
    ctx.storage
        .category(category_id)
        .await
        .map_err(internal)?
        .ok_or_else(|| ApiError::not_found("category not found"))?;
    ctx.storage
        .options_for_category(category_id)
        .await
        .map_err(internal)
}

pub async fn host_snapshot(ctx: &ApiContext, identity: &Identity) -> Result<HostSnapshot, ApiError> {
    require_admin(identity)?;
    let state = load_state(ctx).await?;
    let category = ctx
        .storage
        .category(state.current_category_id)
        .await
        .map_err(internal)?;

    let (options, progress) = match &category {
        Some(category) => (
            ctx.storage
                .options_for_category(category.category_id)
                .await
                .map_err(internal)?,
            Some(
                ctx.storage
                    .vote_progress(category.category_id)
                    .await
                    .map_err(internal)?,
            ),
        ),
        None => (Vec::new(), None),
    };

    Ok(HostSnapshot {
        next_enabled: next_gate_open(&state, progress.as_ref()),
        state,
        category,
        options,
        progress,
    })
}

/// Options are only handed out while the ballot is open.
pub async fn vote_snapshot(ctx: &ApiContext, identity: &Identity) -> Result<VoteSnapshot, ApiError> {
    let participant_id = require_participant(identity)?;
    let state = load_state(ctx).await?;
    let category = ctx
        .storage
        .category(state.current_category_id)
        .await
        .map_err(internal)?;

    let Some(category) = category else {
        return Ok(VoteSnapshot {
            state,
            category: None,
            options: Vec::new(),
            voted_option: None,
        });
    };

    let voted_option = ctx
        .storage
        .vote_for(participant_id, category.category_id)
        .await
        .map_err(internal)?;
    let options = if state.phase == Phase::Voting {
        ctx.storage
            .options_for_category(category.category_id)
            .await
            .map_err(internal)?
    } else {
        Vec::new()
    };

    Ok(VoteSnapshot {
        state,
        category: Some(category),
        options,
        voted_option,
    })
}

pub async fn screen_snapshot(ctx: &ApiContext) -> Result<ScreenSnapshot, ApiError> {
    let state = load_state(ctx).await?;
    if state.in_lobby() {
        return Ok(ScreenSnapshot::Lobby);
    }
    let Some(category) = ctx
        .storage
        .category(state.current_category_id)
        .await
        .map_err(internal)?
    else {
        return Ok(ScreenSnapshot::Lobby);
    };

    if state.phase == Phase::Results {
        let tallies = ctx
            .storage
            .option_tallies(category.category_id, TOP_N)
            .await
            .map_err(internal)?;
        return Ok(ScreenSnapshot::Results {
            category,
            top: rank(tallies),
        });
    }

    let options = ctx
        .storage
        .options_for_category(category.category_id)
        .await
        .map_err(internal)?;
    Ok(ScreenSnapshot::Voting { category, options })
}

/// Per-category leaders without vote counts.
pub async fn results_snapshot(ctx: &ApiContext) -> Result<ResultsSnapshot, ApiError> {
    let state = load_state(ctx).await?;
    let categories = ctx.storage.list_categories().await.map_err(internal)?;
    let mut leaders: HashMap<_, _> = ctx
        .storage
        .category_leaders()
        .await
        .map_err(internal)?
        .into_iter()
        .map(|tally| (tally.category_id, tally))
        .collect();

    let standings = categories
        .into_iter()
        .map(|category| {
            let leader = leaders
                .remove(&category.category_id)
                .map(|tally| CategoryLeader {
                    option_id: tally.option_id,
                    name: tally.name,
                    image: tally.image,
                });
            CategoryStanding { category, leader }
        })
        .collect();

    Ok(ResultsSnapshot { state, standings })
}
