//! The voting service: the single owner of the session state.
//!
//! Every mutation runs under one writer lock and publishes a
//! [`ServerEvent::Changed`] after it commits. Reads go straight to storage.

use std::sync::Arc;

use shared::{
    domain::AdvancePolicy,
    error::{ApiError, ErrorCode},
    protocol::{ChangeKind, ChangeTable, ServerEvent},
};
use storage::Storage;
use tokio::sync::{broadcast, Mutex, MutexGuard};
use tracing::debug;

pub mod auth;
pub mod session;
pub mod views;
pub mod voting;

pub use auth::{register, resolve_identity, sign_in, AuthConfig};
pub use session::{advance, clear, open_voting, reset_to_lobby, set_locked, show_results};
pub use views::{
    current_state, host_snapshot, list_categories, list_options, results_snapshot,
    screen_snapshot, vote_snapshot,
};
pub use voting::{submit_vote, top3, vote_progress};

pub const DEFAULT_EVENT_BUFFER: usize = 256;

#[derive(Clone)]
pub struct ApiContext {
    pub storage: Storage,
    pub auth: AuthConfig,
    pub advance_policy: AdvancePolicy,
    changes: broadcast::Sender<ServerEvent>,
    writer: Arc<Mutex<()>>,
}

impl ApiContext {
    pub fn new(
        storage: Storage,
        auth: AuthConfig,
        advance_policy: AdvancePolicy,
        event_buffer: usize,
    ) -> Self {
        let (changes, _) = broadcast::channel(event_buffer.max(1));
        Self {
            storage,
            auth,
            advance_policy,
            changes,
            writer: Arc::new(Mutex::new(())),
        }
    }

    pub fn subscribe(&self) -> broadcast::Receiver<ServerEvent> {
        self.changes.subscribe()
    }

    pub(crate) async fn write_lock(&self) -> MutexGuard<'_, ()> {
        self.writer.lock().await
    }

    pub(crate) fn publish(&self, table: ChangeTable, kind: ChangeKind) {
        // No subscribers is not an error.
        let delivered = self
            .changes
            .send(ServerEvent::Changed { table, kind })
            .unwrap_or(0);
        debug!(%table, %kind, delivered, "change published");
    }
}

pub(crate) fn internal(err: anyhow::Error) -> ApiError {
    ApiError::new(ErrorCode::Internal, err.to_string())
}

#[cfg(test)]
#[path = "tests/mod_tests.rs"]
mod tests;
