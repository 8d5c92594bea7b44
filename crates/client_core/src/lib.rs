//! Client side of the voting service: an HTTP/websocket client, the
//! session provider and per-view state.
//!
//! Views never patch local state from notifications. A notification only
//! triggers a re-fetch of the relevant snapshot, see [`watch_view`].

use std::{future::Future, sync::Arc};

use async_trait::async_trait;
use futures::StreamExt;
use reqwest::{Client, RequestBuilder, Response};
use serde::de::DeserializeOwned;
use shared::{
    domain::CategoryId,
    error::ApiError,
    protocol::{
        AdvanceRequest, ClearRequest, ClearResponse, ClearScope, HostSnapshot, Identity,
        LockRequest, RankedOption, RegisterRequest, RegisterResponse, ResultsSnapshot,
        ScreenSnapshot, ServerEvent, SignInRequest, SignInResponse, SubmitVoteRequest,
        SubmitVoteResponse, SubscriptionFilter, TransitionResponse, VoteProgress, VoteSnapshot,
    },
};
use tokio::{
    sync::{mpsc, watch, RwLock},
    task::JoinHandle,
};
use tokio_tungstenite::{connect_async, tungstenite::Message};
use tracing::{debug, info, warn};
use url::Url;

pub mod error;
pub mod session;
pub mod views;

pub use error::ClientError;
pub use session::{AuthStatus, SessionProvider};

const SUBSCRIPTION_BUFFER: usize = 64;

/// Reported by a [`LiveView`] once its change subscription has closed.
pub const SUBSCRIPTION_LOST: &str = "change subscription lost";

/// Host commands that change the session state.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum HostCommand {
    OpenVoting,
    ShowResults,
    ResetToLobby,
    Advance { force: bool },
    SetLocked(bool),
}

#[async_trait]
pub trait VotingApi: Send + Sync {
    async fn register(&self, req: &RegisterRequest) -> Result<RegisterResponse, ClientError>;
    /// Signs in and keeps the returned token for later calls.
    async fn sign_in(&self, req: &SignInRequest) -> Result<SignInResponse, ClientError>;
    async fn sign_out(&self);
    async fn me(&self) -> Result<Identity, ClientError>;
    async fn host_snapshot(&self) -> Result<HostSnapshot, ClientError>;
    async fn vote_snapshot(&self) -> Result<VoteSnapshot, ClientError>;
    async fn screen_snapshot(&self) -> Result<ScreenSnapshot, ClientError>;
    async fn results_snapshot(&self) -> Result<ResultsSnapshot, ClientError>;
    async fn submit_vote(&self, req: &SubmitVoteRequest)
        -> Result<SubmitVoteResponse, ClientError>;
    async fn vote_progress(&self, category_id: CategoryId) -> Result<VoteProgress, ClientError>;
    async fn top3(&self, category_id: CategoryId) -> Result<Vec<RankedOption>, ClientError>;
    async fn host_command(&self, command: HostCommand) -> Result<TransitionResponse, ClientError>;
    async fn clear(&self, scope: ClearScope) -> Result<ClearResponse, ClientError>;
    async fn subscribe(&self, filter: SubscriptionFilter) -> Result<Subscription, ClientError>;
}

pub struct VotingClient {
    http: Client,
    server_url: String,
    token: RwLock<Option<String>>,
}

impl VotingClient {
    pub fn new(server_url: &str) -> Result<Arc<Self>, ClientError> {
        Url::parse(server_url)?;
        Ok(Arc::new(Self {
            http: Client::new(),
            server_url: server_url.trim_end_matches('/').to_string(),
            token: RwLock::new(None),
        }))
    }

    /// Reuses a token from an earlier sign-in.
    pub async fn with_token(&self, token: impl Into<String>) {
        *self.token.write().await = Some(token.into());
    }

    pub async fn token(&self) -> Option<String> {
        self.token.read().await.clone()
    }

    fn url(&self, path: &str) -> String {
        format!("{}{path}", self.server_url)
    }

    fn ws_url(&self, filter: &SubscriptionFilter) -> Result<Url, ClientError> {
        let mut url = Url::parse(&self.url("/ws"))?;
        let scheme = match url.scheme() {
            "https" => "wss",
            "http" => "ws",
            other => {
                return Err(ClientError::Subscription(format!(
                    "server_url must start with http:// or https://, got {other}://"
                )))
            }
        };
        url.set_scheme(scheme)
            .map_err(|_| ClientError::Subscription(format!("cannot switch {url} to {scheme}")))?;
        {
            let mut query = url.query_pairs_mut();
            for (key, value) in filter.query_pairs() {
                query.append_pair(key, &value);
            }
        }
        if url.query() == Some("") {
            url.set_query(None);
        }
        Ok(url)
    }

    async fn authorized(&self, builder: RequestBuilder) -> Result<RequestBuilder, ClientError> {
        let token = self.token().await.ok_or(ClientError::NotSignedIn)?;
        Ok(builder.bearer_auth(token))
    }

    async fn get_json<T: DeserializeOwned>(&self, path: &str) -> Result<T, ClientError> {
        decode(self.http.get(self.url(path)).send().await?).await
    }

    async fn get_json_authorized<T: DeserializeOwned>(&self, path: &str) -> Result<T, ClientError> {
        let builder = self.authorized(self.http.get(self.url(path))).await?;
        decode(builder.send().await?).await
    }

    async fn post_json_authorized<B, T>(&self, path: &str, body: &B) -> Result<T, ClientError>
    where
        B: serde::Serialize + Sync,
        T: DeserializeOwned,
    {
        let builder = self.authorized(self.http.post(self.url(path))).await?;
        decode(builder.json(body).send().await?).await
    }
}

/// Maps non-success responses to [`ClientError::Api`] when the body is an
/// [`ApiError`].
async fn decode<T: DeserializeOwned>(response: Response) -> Result<T, ClientError> {
    let status = response.status();
    if status.is_success() {
        return Ok(response.json().await?);
    }
    let body = response.text().await.unwrap_or_default();
    match serde_json::from_str::<ApiError>(&body) {
        Ok(err) => Err(ClientError::Api(err)),
        Err(_) => Err(ClientError::Unexpected {
            status: status.as_u16(),
            body,
        }),
    }
}

#[async_trait]
impl VotingApi for VotingClient {
    async fn register(&self, req: &RegisterRequest) -> Result<RegisterResponse, ClientError> {
        let response = self
            .http
            .post(self.url("/auth/register"))
            .json(req)
            .send()
            .await?;
        decode(response).await
    }

    async fn sign_in(&self, req: &SignInRequest) -> Result<SignInResponse, ClientError> {
        let response = self
            .http
            .post(self.url("/auth/signin"))
            .json(req)
            .send()
            .await?;
        let body: SignInResponse = decode(response).await?;
        *self.token.write().await = Some(body.token.clone());
        info!(user_id = body.identity.user_id.0, "signed in");
        Ok(body)
    }

    async fn sign_out(&self) {
        self.token.write().await.take();
    }

    async fn me(&self) -> Result<Identity, ClientError> {
        self.get_json_authorized("/auth/me").await
    }

    async fn host_snapshot(&self) -> Result<HostSnapshot, ClientError> {
        self.get_json_authorized("/views/host").await
    }

    async fn vote_snapshot(&self) -> Result<VoteSnapshot, ClientError> {
        self.get_json_authorized("/views/vote").await
    }

    async fn screen_snapshot(&self) -> Result<ScreenSnapshot, ClientError> {
        self.get_json("/views/screen").await
    }

    async fn results_snapshot(&self) -> Result<ResultsSnapshot, ClientError> {
        self.get_json("/views/results").await
    }

    async fn submit_vote(
        &self,
        req: &SubmitVoteRequest,
    ) -> Result<SubmitVoteResponse, ClientError> {
        self.post_json_authorized("/votes", req).await
    }

    async fn vote_progress(&self, category_id: CategoryId) -> Result<VoteProgress, ClientError> {
        self.get_json_authorized(&format!("/categories/{}/progress", category_id.0))
            .await
    }

    async fn top3(&self, category_id: CategoryId) -> Result<Vec<RankedOption>, ClientError> {
        self.get_json(&format!("/categories/{}/top3", category_id.0))
            .await
    }

    async fn host_command(&self, command: HostCommand) -> Result<TransitionResponse, ClientError> {
        let empty = serde_json::json!({});
        match command {
            HostCommand::OpenVoting => self.post_json_authorized("/host/open", &empty).await,
            HostCommand::ShowResults => self.post_json_authorized("/host/results", &empty).await,
            HostCommand::ResetToLobby => self.post_json_authorized("/host/reset", &empty).await,
            HostCommand::Advance { force } => {
                self.post_json_authorized("/host/advance", &AdvanceRequest { force })
                    .await
            }
            HostCommand::SetLocked(locked) => {
                self.post_json_authorized("/host/lock", &LockRequest { locked })
                    .await
            }
        }
    }

    async fn clear(&self, scope: ClearScope) -> Result<ClearResponse, ClientError> {
        self.post_json_authorized("/host/clear", &ClearRequest { scope })
            .await
    }

    async fn subscribe(&self, filter: SubscriptionFilter) -> Result<Subscription, ClientError> {
        let ws_url = self.ws_url(&filter)?;
        let (ws_stream, _) = connect_async(ws_url.as_str())
            .await
            .map_err(|e| ClientError::Subscription(format!("{ws_url}: {e}")))?;
        let (_, mut ws_reader) = ws_stream.split();
        let (tx, rx) = mpsc::channel(SUBSCRIPTION_BUFFER);
        debug!(%ws_url, "subscribed to changes");

        let reader = tokio::spawn(async move {
            while let Some(msg) = ws_reader.next().await {
                let event = match msg {
                    Ok(Message::Text(text)) => match serde_json::from_str::<ServerEvent>(&text) {
                        Ok(event) => event,
                        Err(err) => {
                            warn!(%err, "ignoring malformed change notification");
                            continue;
                        }
                    },
                    Ok(Message::Close(_)) => break,
                    Ok(_) => continue,
                    Err(err) => {
                        warn!(%err, "change subscription dropped");
                        break;
                    }
                };
                if tx.send(event).await.is_err() {
                    break;
                }
            }
        });

        Ok(Subscription::new(rx, reader))
    }
}

/// A live change subscription. Dropping it closes the socket reader.
pub struct Subscription {
    events: mpsc::Receiver<ServerEvent>,
    reader: Option<JoinHandle<()>>,
}

impl Subscription {
    pub fn new(events: mpsc::Receiver<ServerEvent>, reader: JoinHandle<()>) -> Self {
        Self {
            events,
            reader: Some(reader),
        }
    }

    /// A subscription fed directly from a channel, with no socket behind it.
    pub fn from_channel(events: mpsc::Receiver<ServerEvent>) -> Self {
        Self {
            events,
            reader: None,
        }
    }

    pub async fn next(&mut self) -> Option<ServerEvent> {
        self.events.recv().await
    }

    /// Drops every notification already queued and reports how many there were.
    pub fn drain(&mut self) -> usize {
        let mut drained = 0;
        while self.events.try_recv().is_ok() {
            drained += 1;
        }
        drained
    }
}

impl Drop for Subscription {
    fn drop(&mut self) {
        if let Some(reader) = self.reader.take() {
            reader.abort();
        }
    }
}

#[derive(Debug, Clone, PartialEq)]
pub enum ViewState<T> {
    Loading,
    Ready(T),
    Failed(String),
}

/// A snapshot kept current by [`watch_view`]. Dropping it stops the driver.
pub struct LiveView<T> {
    state: watch::Receiver<ViewState<T>>,
    driver: JoinHandle<()>,
}

impl<T> LiveView<T> {
    pub fn state(&self) -> watch::Receiver<ViewState<T>> {
        self.state.clone()
    }

    pub async fn changed(&mut self) -> Option<ViewState<T>>
    where
        T: Clone,
    {
        self.state.changed().await.ok()?;
        Some(self.state.borrow_and_update().clone())
    }
}

impl<T> Drop for LiveView<T> {
    fn drop(&mut self) {
        self.driver.abort();
    }
}

/// Fetches once, then re-fetches after each notification. Fetches run one
/// at a time on a single task, and notifications that queued up during a
/// fetch are folded into the next one. When the subscription ends the view
/// is left as [`ViewState::Failed`] with [`SUBSCRIPTION_LOST`].
pub fn watch_view<T, F, Fut>(mut subscription: Subscription, mut fetch: F) -> LiveView<T>
where
    T: Send + Sync + 'static,
    F: FnMut() -> Fut + Send + 'static,
    Fut: Future<Output = Result<T, ClientError>> + Send,
{
    let (tx, rx) = watch::channel(ViewState::Loading);
    let driver = tokio::spawn(async move {
        publish(&tx, fetch().await);
        while let Some(event) = subscription.next().await {
            let folded = subscription.drain();
            debug!(?event, folded, "refreshing view");
            publish(&tx, fetch().await);
            if tx.is_closed() {
                return;
            }
        }
        warn!("change subscription ended, view is no longer live");
        let _ = tx.send(ViewState::Failed(SUBSCRIPTION_LOST.into()));
    });
    LiveView { state: rx, driver }
}

fn publish<T>(tx: &watch::Sender<ViewState<T>>, result: Result<T, ClientError>) {
    let next = match result {
        Ok(snapshot) => ViewState::Ready(snapshot),
        Err(err) => {
            warn!(%err, "view refresh failed");
            ViewState::Failed(err.to_string())
        }
    };
    let _ = tx.send(next);
}

#[cfg(test)]
#[path = "tests/lib_tests.rs"]
mod tests;
