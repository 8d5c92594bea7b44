use super::*;
use axum::{
    extract::{
        ws::{Message as AxumMessage, WebSocket, WebSocketUpgrade},
        RawQuery, State,
    },
    http::{HeaderMap, StatusCode},
    response::IntoResponse,
    routing::{get, post},
    Json, Router,
};
use shared::{
    domain::{Category, OptionId, ParticipantId, Phase, Role, SessionState, UserId, VoteOption},
    protocol::{ChangeKind, ChangeTable, VoteOutcome},
    routes::AppRoute,
};
use std::{
    sync::{
        atomic::{AtomicUsize, Ordering},
        Mutex as StdMutex,
    },
    time::Duration,
};
use tokio::net::TcpListener;

use crate::views::{BallotStatus, VoteView};

type StubError = (StatusCode, Json<ApiError>);

#[derive(Clone, Default)]
struct StubState {
    seen_auth: Arc<StdMutex<Vec<String>>>,
    ws_query: Arc<StdMutex<Option<String>>>,
}

fn identity() -> Identity {
    Identity {
        user_id: UserId(5),
        username: "ana".into(),
        participant_id: Some(ParticipantId(9)),
        role: Role::Participant,
    }
}

fn record_auth(state: &StubState, headers: &HeaderMap) {
    if let Some(value) = headers.get("authorization").and_then(|v| v.to_str().ok()) {
        state
            .seen_auth
            .lock()
            .expect("lock")
            .push(value.to_string());
    }
}

async fn stub_sign_in(Json(req): Json<SignInRequest>) -> Result<Json<SignInResponse>, StubError> {
    if req.password != "secret-pass" {
        return Err((
            StatusCode::UNAUTHORIZED,
            Json(ApiError::unauthorized("invalid email or password")),
        ));
    }
    Ok(Json(SignInResponse {
        token: "tok-1".into(),
        identity: identity(),
        route: AppRoute::Vote,
        message: "signed in".into(),
    }))
}

async fn stub_register() -> StubError {
    (
        StatusCode::CONFLICT,
        Json(ApiError::conflict("email is already registered")),
    )
}

async fn stub_me(State(state): State<StubState>, headers: HeaderMap) -> Json<Identity> {
    record_auth(&state, &headers);
    Json(identity())
}

async fn stub_vote_view(State(state): State<StubState>, headers: HeaderMap) -> Json<VoteSnapshot> {
    record_auth(&state, &headers);
    Json(VoteSnapshot {
        state: SessionState {
            current_category_id: CategoryId(1),
            phase: Phase::Voting,
            locked: false,
            updated_at: None,
        },
        category: Some(Category {
            category_id: CategoryId(1),
            title: "Costume".into(),
            ordering: 0,
        }),
        options: vec![VoteOption {
            option_id: OptionId(3),
            category_id: CategoryId(1),
            name: "red".into(),
            image: None,
        }],
        voted_option: None,
    })
}

async fn stub_vote(
    State(state): State<StubState>,
    headers: HeaderMap,
    Json(req): Json<SubmitVoteRequest>,
) -> Json<SubmitVoteResponse> {
    record_auth(&state, &headers);
    Json(SubmitVoteResponse {
        outcome: VoteOutcome::Recorded,
        category_id: req.category_id,
        option_id: req.option_id,
    })
}

async fn stub_ws(
    ws: WebSocketUpgrade,
    State(state): State<StubState>,
    RawQuery(query): RawQuery,
) -> impl IntoResponse {
    *state.ws_query.lock().expect("lock") = query;
    ws.on_upgrade(stub_ws_connection)
}

async fn stub_ws_connection(mut socket: WebSocket) {
    let event = ServerEvent::Changed {
        table: ChangeTable::Votes,
        kind: ChangeKind::Insert,
    };
    let text = serde_json::to_string(&event).expect("json");
    if socket
        .send(AxumMessage::Text("not json".into()))
        .await
        .is_err()
    {
        return;
    }
    if socket.send(AxumMessage::Text(text)).await.is_err() {
        return;
    }
    while let Some(Ok(_)) = socket.recv().await {}
}

async fn spawn_stub() -> (String, StubState) {
    let state = StubState::default();
    let app = Router::new()
        .route("/auth/signin", post(stub_sign_in))
        .route("/auth/register", post(stub_register))
        .route("/auth/me", get(stub_me))
        .route("/views/vote", get(stub_vote_view))
        .route("/votes", post(stub_vote))
        .route("/ws", get(stub_ws))
        .with_state(state.clone());
    let listener = TcpListener::bind("127.0.0.1:0").await.expect("bind");
    let addr = listener.local_addr().expect("addr");
    tokio::spawn(async move {
        let _ = axum::serve(listener, app).await;
    });
    (format!("http://{addr}/"), state)
}

#[tokio::test]
async fn sign_in_keeps_token_for_authorized_calls() {
    let (server_url, stub) = spawn_stub().await;
    let client = VotingClient::new(&server_url).expect("client");
    let session = SessionProvider::new(Arc::clone(&client));

    let route = session
        .sign_in("ana@example.com", "secret-pass")
        .await
        .expect("sign in");
    assert_eq!(route, AppRoute::Vote);
    let status = session.status();
    assert!(!status.loading);
    assert_eq!(status.identity, Some(identity()));
    assert_eq!(status.message.as_deref(), Some("signed in"));

    client.vote_snapshot().await.expect("vote view");
    assert_eq!(
        stub.seen_auth.lock().expect("lock").as_slice(),
        ["Bearer tok-1".to_string()]
    );
    assert_eq!(session.route(AppRoute::Host), AppRoute::Vote);
}

#[tokio::test]
async fn failed_auth_surfaces_server_message() {
    let (server_url, _stub) = spawn_stub().await;
    let client = VotingClient::new(&server_url).expect("client");
    let session = SessionProvider::new(client);

    let err = session
        .sign_in("ana@example.com", "wrong")
        .await
        .expect_err("rejected");
    assert_eq!(
        err.api().map(|e| e.code),
        Some(shared::error::ErrorCode::Unauthorized)
    );
    let status = session.status();
    assert_eq!(status.error.as_deref(), Some("invalid email or password"));
    assert!(status.identity.is_none());

    session
        .register("ana@example.com", "secret-pass", "ana")
        .await
        .expect_err("duplicate");
    assert_eq!(
        session.status().error.as_deref(),
        Some("email is already registered")
    );
}

#[tokio::test]
async fn sign_out_forgets_identity_and_token() {
    let (server_url, _stub) = spawn_stub().await;
    let client = VotingClient::new(&server_url).expect("client");
    let session = SessionProvider::new(Arc::clone(&client));
    session
        .sign_in("ana@example.com", "secret-pass")
        .await
        .expect("sign in");

    assert_eq!(session.sign_out().await, AppRoute::Home);
    assert!(session.identity().is_none());
    assert!(matches!(client.me().await, Err(ClientError::NotSignedIn)));
    assert_eq!(session.route(AppRoute::Vote), AppRoute::SignIn);
}

#[tokio::test]
async fn restored_token_is_sent_and_identity_refreshed() {
    let (server_url, stub) = spawn_stub().await;
    let client = VotingClient::new(&server_url).expect("client");
    client.with_token("tok-saved").await;
    let session = SessionProvider::new(Arc::clone(&client));

    let identity = session.refresh().await.expect("me");
    assert_eq!(identity.username, "ana");
    assert_eq!(
        stub.seen_auth.lock().expect("lock").as_slice(),
        ["Bearer tok-saved".to_string()]
    );
}

#[tokio::test]
async fn vote_view_submits_through_the_client() {
    let (server_url, _stub) = spawn_stub().await;
    let client = VotingClient::new(&server_url).expect("client");
    client.with_token("tok-1").await;

    let mut view = VoteView::new();
    view.apply(client.vote_snapshot().await.expect("snapshot"));
    view.select(OptionId(3)).expect("select");
    let response = view
        .submit(client.as_ref(), &identity())
        .await
        .expect("submit");
    assert_eq!(response.outcome, VoteOutcome::Recorded);
    assert_eq!(view.status(), BallotStatus::Voted);

    let err = view
        .submit(client.as_ref(), &identity())
        .await
        .expect_err("second submit is guarded locally");
    assert!(matches!(err, ClientError::Guard(_)));
}

#[tokio::test]
async fn subscription_passes_filter_and_skips_malformed_frames() {
    let (server_url, stub) = spawn_stub().await;
    let client = VotingClient::new(&server_url).expect("client");

    let filter = SubscriptionFilter::tables(&[ChangeTable::Votes, ChangeTable::SessionState]);
    let mut subscription = client.subscribe(filter).await.expect("subscribe");
    let event = tokio::time::timeout(Duration::from_secs(5), subscription.next())
        .await
        .expect("event in time")
        .expect("event");
    assert_eq!(
        event,
        ServerEvent::Changed {
            table: ChangeTable::Votes,
            kind: ChangeKind::Insert,
        }
    );
    assert_eq!(
        stub.ws_query.lock().expect("lock").as_deref(),
        Some("tables=votes%2Csession_state")
    );
}

#[tokio::test]
async fn watch_view_refetches_once_per_batch_of_notifications() {
    let (tx, rx) = mpsc::channel(8);
    let fetches = Arc::new(AtomicUsize::new(0));
    let counter = Arc::clone(&fetches);
    let mut view = watch_view(Subscription::from_channel(rx), move || {
        let counter = Arc::clone(&counter);
        async move { Ok::<_, ClientError>(counter.fetch_add(1, Ordering::SeqCst) + 1) }
    });

    assert_eq!(view.changed().await, Some(ViewState::Ready(1)));

    let changed = ServerEvent::Changed {
        table: ChangeTable::SessionState,
        kind: ChangeKind::Update,
    };
    tx.send(changed.clone()).await.expect("send");
    assert_eq!(view.changed().await, Some(ViewState::Ready(2)));

    tx.send(ServerEvent::Resync).await.expect("send");
    assert_eq!(view.changed().await, Some(ViewState::Ready(3)));

    drop(tx);
    tokio::time::sleep(Duration::from_millis(50)).await;
    assert_eq!(fetches.load(Ordering::SeqCst), 3);
}

#[tokio::test]
async fn watch_view_reports_fetch_failures() {
    let (_tx, rx) = mpsc::channel(1);
    let mut view = watch_view(Subscription::from_channel(rx), || async {
        Err::<(), _>(ClientError::NotSignedIn)
    });
    assert_eq!(
        view.changed().await,
        Some(ViewState::Failed("not signed in".into()))
    );
}

#[test]
fn ws_url_follows_server_scheme() {
    let client = VotingClient::new("https://vote.example.com/").expect("client");
    let url = client
        .ws_url(&SubscriptionFilter::all().with_kinds(&[ChangeKind::Insert]))
        .expect("url");
    assert_eq!(url.as_str(), "wss://vote.example.com/ws?kinds=insert");

    let client = VotingClient::new("http://127.0.0.1:8443").expect("client");
    let url = client.ws_url(&SubscriptionFilter::all()).expect("url");
    assert_eq!(url.as_str(), "ws://127.0.0.1:8443/ws");
}

#[tokio::test]
async fn closed_subscription_leaves_the_view_failed() {
    let (tx, rx) = mpsc::channel(1);
    let mut view = watch_view(Subscription::from_channel(rx), || async {
        Ok::<_, ClientError>(7)
    });
    assert_eq!(view.changed().await, Some(ViewState::Ready(7)));

    drop(tx);
    assert_eq!(
        view.changed().await,
        Some(ViewState::Failed(SUBSCRIPTION_LOST.into()))
    );
    assert_eq!(view.changed().await, None);
    assert_eq!(
        *view.state().borrow(),
        ViewState::Failed(SUBSCRIPTION_LOST.into())
    );
}
