use std::sync::Arc;

use anyhow::{anyhow, bail, Result};
use clap::{Args, Parser, Subcommand};
use client_core::{
    views::{host_panel, render_results, render_screen, render_vote, VoteView},
    watch_view, ClientError, HostCommand, SessionProvider, ViewState, VotingApi, VotingClient,
    SUBSCRIPTION_LOST,
};
use shared::{
    domain::{CategoryId, OptionId},
    error::ErrorCode,
    protocol::{ChangeTable, ClearScope, HostSnapshot, SubscriptionFilter},
    routes::AppRoute,
};
use tokio::io::{AsyncBufReadExt, BufReader};
use tracing::warn;
use tracing_subscriber::EnvFilter;

#[derive(Parser, Debug)]
struct Cli {
    #[arg(long, env = "VOTE_SERVER_URL", default_value = "http://127.0.0.1:8443")]
    server_url: String,
    #[command(subcommand)]
    command: Command,
}

#[derive(Args, Debug, Clone)]
struct Credentials {
    #[arg(long, env = "VOTE_EMAIL")]
    email: String,
    #[arg(long, env = "VOTE_PASSWORD", hide_env_values = true)]
    password: String,
}

#[derive(Subcommand, Debug)]
enum Command {
    Register {
        #[arg(long)]
        email: String,
        #[arg(long)]
        password: String,
        #[arg(long)]
        username: String,
    },
    /// Shared display: follows the session live.
    Screen {
        #[arg(long, default_value = "http://127.0.0.1:8443/vote")]
        join_url: String,
    },
    /// Per-category winners, live.
    Results,
    /// The current top three options of one category, with counts.
    Top3 { category_id: i64 },
    /// Interactive ballot. Type an option id and press enter to vote.
    Vote {
        #[command(flatten)]
        credentials: Credentials,
    },
    Host {
        #[command(flatten)]
        credentials: Credentials,
        #[command(subcommand)]
        action: HostAction,
    },
}

#[derive(Subcommand, Debug, Clone, Copy)]
enum HostAction {
    /// Print the host panel, and keep printing it with --watch.
    Status {
        #[arg(long)]
        watch: bool,
    },
    /// How many participants have voted in a category.
    Progress { category_id: i64 },
    Open,
    Results,
    Next {
        /// Advance even if not everyone has voted.
        #[arg(long)]
        force: bool,
    },
    Lock,
    Unlock,
    Reset,
    ClearVotes,
    ClearAll,
}

#[tokio::main]
async fn main() -> Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("warn")))
        .init();

    let cli = Cli::parse();
    let client = VotingClient::new(&cli.server_url)?;
    let session = SessionProvider::new(Arc::clone(&client));

    match cli.command {
        Command::Register {
            email,
            password,
            username,
        } => {
            session.register(&email, &password, &username).await?;
            if let Some(message) = session.status().message {
                println!("{message}");
            }
        }
        Command::Screen { join_url } => watch_screen(&client, &join_url).await?,
        Command::Results => watch_results(&client).await?,
        Command::Top3 { category_id } => {
            let top = client.top3(CategoryId(category_id)).await?;
            if top.is_empty() {
                println!("no options");
            }
            for ranked in top {
                println!("#{} {} ({})", ranked.rank, ranked.name, ranked.vote_count);
            }
        }
        Command::Vote { credentials } => {
            sign_in(&session, &credentials, AppRoute::Vote).await?;
            run_ballot(&client, &session).await?;
        }
        Command::Host {
            credentials,
            action,
        } => {
            sign_in(&session, &credentials, AppRoute::Host).await?;
            run_host(&client, action).await?;
        }
    }
    Ok(())
}

async fn sign_in(
    session: &SessionProvider<VotingClient>,
    credentials: &Credentials,
    wanted: AppRoute,
) -> Result<()> {
    session
        .sign_in(&credentials.email, &credentials.password)
        .await?;
    let route = session.route(wanted);
    if route != wanted {
        return Err(anyhow!(
            "this account cannot open {}, it belongs on {}",
            wanted.path(),
            route.path()
        ));
    }
    Ok(())
}

fn print_block(lines: &[String]) {
    println!("----");
    for line in lines {
        println!("{line}");
    }
}

fn print_panel(snapshot: &HostSnapshot) {
    let panel = host_panel(snapshot);
    print_block(&panel.lines);
    println!("next: {}", if panel.next_enabled { "ready" } else { "waiting" });
    if panel.can_show_results {
        println!("results: available");
    }
}

fn is_conflict(err: &ClientError) -> bool {
    err.api().is_some_and(|api| api.code == ErrorCode::Conflict)
}

async fn watch_screen(client: &Arc<VotingClient>, join_url: &str) -> Result<()> {
    let subscription = client
        .subscribe(SubscriptionFilter::tables(&[
            ChangeTable::SessionState,
            ChangeTable::Votes,
        ]))
        .await?;
    let api = Arc::clone(client);
    let mut view = watch_view(subscription, move || {
        let api = Arc::clone(&api);
        async move { api.screen_snapshot().await }
    });
    loop {
        tokio::select! {
            _ = tokio::signal::ctrl_c() => return Ok(()),
            state = view.changed() => match state {
                Some(ViewState::Ready(snapshot)) => print_block(&render_screen(&snapshot, join_url)),
                Some(ViewState::Failed(err)) => warn!(%err, "screen refresh failed"),
                Some(ViewState::Loading) => {}
                None => bail!(SUBSCRIPTION_LOST),
            },
        }
    }
}

async fn watch_results(client: &Arc<VotingClient>) -> Result<()> {
    let subscription = client
        .subscribe(SubscriptionFilter::tables(&[
            ChangeTable::SessionState,
            ChangeTable::Votes,
        ]))
        .await?;
    let api = Arc::clone(client);
    let mut view = watch_view(subscription, move || {
        let api = Arc::clone(&api);
        async move { api.results_snapshot().await }
    });
    loop {
        tokio::select! {
            _ = tokio::signal::ctrl_c() => return Ok(()),
            state = view.changed() => match state {
                Some(ViewState::Ready(snapshot)) => print_block(&render_results(&snapshot)),
                Some(ViewState::Failed(err)) => warn!(%err, "results refresh failed"),
                Some(ViewState::Loading) => {}
                None => bail!(SUBSCRIPTION_LOST),
            },
        }
    }
}

async fn run_ballot(
    client: &Arc<VotingClient>,
    session: &SessionProvider<VotingClient>,
) -> Result<()> {
    let identity = session
        .identity()
        .ok_or_else(|| anyhow!("sign-in did not return an identity"))?;
    let subscription = client
        .subscribe(SubscriptionFilter::tables(&[
            ChangeTable::SessionState,
            ChangeTable::Votes,
            ChangeTable::Participants,
        ]))
        .await?;
    let api = Arc::clone(client);
    let mut live = watch_view(subscription, move || {
        let api = Arc::clone(&api);
        async move { api.vote_snapshot().await }
    });

    let mut ballot = VoteView::new();
    let mut stdin = BufReader::new(tokio::io::stdin()).lines();
    loop {
        tokio::select! {
            _ = tokio::signal::ctrl_c() => return Ok(()),
            state = live.changed() => match state {
                Some(ViewState::Ready(snapshot)) => {
                    ballot.apply(snapshot);
                    print_block(&render_vote(&ballot.render()));
                }
                Some(ViewState::Failed(err)) => warn!(%err, "ballot refresh failed"),
                Some(ViewState::Loading) => {}
                None => bail!(SUBSCRIPTION_LOST),
            },
            line = stdin.next_line() => {
                let Some(line) = line? else {
                    return Ok(());
                };
                let Ok(id) = line.trim().parse::<i64>() else {
                    println!("enter the number of an option");
                    continue;
                };
                if let Err(guard) = ballot.select(OptionId(id)) {
                    println!("{guard}");
                    continue;
                }
                match ballot.submit(client.as_ref(), &identity).await {
                    Ok(_) => {
                        if let Some(message) = &ballot.message {
                            println!("{message}");
                        }
                    }
                    Err(err) => println!("{err}"),
                }
                print_block(&render_vote(&ballot.render()));
            }
        }
    }
}

async fn run_host(client: &Arc<VotingClient>, action: HostAction) -> Result<()> {
    let command = match action {
        HostAction::Status { watch } => return host_status(client, watch).await,
        HostAction::Progress { category_id } => {
            let progress = client.vote_progress(CategoryId(category_id)).await?;
            println!(
                "voted {}/{}",
                progress.voted_count, progress.total_participants
            );
            return Ok(());
        }
        HostAction::ClearVotes | HostAction::ClearAll => {
            let scope = if matches!(action, HostAction::ClearAll) {
                ClearScope::All
            } else {
                ClearScope::Votes
            };
            let cleared = client.clear(scope).await?;
            println!(
                "deleted {} votes and {} participants",
                cleared.votes_deleted, cleared.participants_deleted
            );
            return Ok(());
        }
        HostAction::Open => HostCommand::OpenVoting,
        HostAction::Results => HostCommand::ShowResults,
        HostAction::Next { force } => HostCommand::Advance { force },
        HostAction::Lock => HostCommand::SetLocked(true),
        HostAction::Unlock => HostCommand::SetLocked(false),
        HostAction::Reset => HostCommand::ResetToLobby,
    };

    let response = match client.host_command(command).await {
        Ok(response) => response,
        Err(err) if is_conflict(&err) && matches!(action, HostAction::Next { force: false }) => {
            bail!("{err} (use --force to advance anyway)");
        }
        Err(err) => return Err(err.into()),
    };
    if !response.moved {
        println!("nothing to advance to");
    }
    let state = response.state;
    println!(
        "category {} / {}{}",
        state.current_category_id.0,
        state.phase,
        if state.locked { " (locked)" } else { "" }
    );
    Ok(())
}

async fn host_status(client: &Arc<VotingClient>, watch: bool) -> Result<()> {
    if !watch {
        print_panel(&client.host_snapshot().await?);
        return Ok(());
    }

    let subscription = client.subscribe(SubscriptionFilter::all()).await?;
    let api = Arc::clone(client);
    let mut view = watch_view(subscription, move || {
        let api = Arc::clone(&api);
        async move { api.host_snapshot().await }
    });
    loop {
        tokio::select! {
            _ = tokio::signal::ctrl_c() => return Ok(()),
            state = view.changed() => match state {
                Some(ViewState::Ready(snapshot)) => print_panel(&snapshot),
                Some(ViewState::Failed(err)) => warn!(%err, "host refresh failed"),
                Some(ViewState::Loading) => {}
                None => bail!(SUBSCRIPTION_LOST),
            },
        }
    }
}
