use std::{fs, path::PathBuf};

use anyhow::{bail, Context, Result};
use clap::{Parser, Subcommand};
use serde::Deserialize;
use shared::domain::{CategoryId, Phase, Role};
use storage::Storage;
use tracing::info;
use tracing_subscriber::EnvFilter;

/// Out-of-band administration. Changes made here bypass the server's change
/// feed, so connected clients only see them on their next refresh.
#[derive(Parser, Debug)]
struct Cli {
    #[arg(long, env = "DATABASE_URL", default_value = "sqlite://./data/vote.db")]
    database_url: String,
    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand, Debug)]
enum Command {
    /// Load categories and their options from a TOML file.
    Seed { file: PathBuf },
    /// Give an account the host role.
    Promote { email: String },
    /// Return an account to the participant role.
    Demote { email: String },
    ResetSession,
    ClearVotes,
    /// Delete votes and participants; accounts are relinked on next sign-in.
    ClearAll,
    ListCategories,
    ListParticipants,
}

#[derive(Debug, Deserialize, PartialEq)]
struct SeedFile {
    #[serde(default)]
    categories: Vec<SeedCategory>,
}

#[derive(Debug, Deserialize, PartialEq)]
struct SeedCategory {
    title: String,
    ordering: Option<i64>,
    #[serde(default)]
    options: Vec<SeedOption>,
}

#[derive(Debug, Deserialize, PartialEq)]
struct SeedOption {
    name: String,
    image: Option<String>,
}

fn parse_seed(raw: &str) -> Result<SeedFile> {
    let seed: SeedFile = toml::from_str(raw).context("invalid seed file")?;
    for category in &seed.categories {
        if category.title.trim().is_empty() {
            bail!("category titles must not be empty");
        }
        if category.options.is_empty() {
            bail!("category '{}' has no options", category.title);
        }
    }
    Ok(seed)
}

async fn apply_seed(storage: &Storage, seed: &SeedFile) -> Result<(usize, usize)> {
    let existing = storage.list_categories().await?.len() as i64;
    let mut option_count = 0;
    for (index, category) in seed.categories.iter().enumerate() {
        let ordering = category.ordering.unwrap_or(existing + index as i64);
        let category_id = storage
            .create_category(category.title.trim(), ordering)
            .await?;
        for option in &category.options {
            storage
                .create_option(category_id, option.name.trim(), option.image.as_deref())
                .await?;
            option_count += 1;
        }
        info!(category_id = category_id.0, title = %category.title, "category seeded");
    }
    Ok((seed.categories.len(), option_count))
}

async fn set_role(storage: &Storage, email: &str, role: Role) -> Result<()> {
    if !storage.set_role_by_email(email.trim(), role).await? {
        bail!("no account is registered with {email}");
    }
    println!("{email} is now {}", role.as_str());
    Ok(())
}

#[tokio::main]
async fn main() -> Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("warn")))
        .init();

    let cli = Cli::parse();
    let storage = Storage::new(&cli.database_url).await?;

    match cli.command {
        Command::Seed { file } => {
            let raw = fs::read_to_string(&file)
                .with_context(|| format!("failed to read {}", file.display()))?;
            let seed = parse_seed(&raw)?;
            let (categories, options) = apply_seed(&storage, &seed).await?;
            println!("seeded {categories} categories with {options} options");
        }
        Command::Promote { email } => set_role(&storage, &email, Role::Admin).await?,
        Command::Demote { email } => set_role(&storage, &email, Role::Participant).await?,
        Command::ResetSession => {
            let state = storage
                .write_session_state(CategoryId::LOBBY, Phase::Lobby, false)
                .await?;
            println!("session reset to {}", state.phase);
        }
        Command::ClearVotes => {
            let deleted = storage.clear_votes().await?;
            println!("deleted {deleted} votes");
        }
        Command::ClearAll => {
            let cleared = storage.clear_participants_and_votes().await?;
            println!(
                "deleted {} votes and {} participants",
                cleared.votes, cleared.participants
            );
        }
        Command::ListCategories => {
            for category in storage.list_categories().await? {
                let options = storage.options_for_category(category.category_id).await?;
                println!(
                    "{}\t{}\t{} options",
                    category.category_id.0,
                    category.title,
                    options.len()
                );
            }
        }
        Command::ListParticipants => {
            for participant in storage.list_participants().await? {
                println!("{}\t{}", participant.participant_id.0, participant.name);
            }
        }
    }

    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    const SEED: &str = r#"
[[categories]]
title = "Best costume"

[[categories.options]]
name = "Pirate"
image = "https://img.example/pirate.png"

[[categories.options]]
name = "Robot"

[[categories]]
title = "Best dance"
ordering = 10

[[categories.options]]
name = "Waltz"
"#;

    #[test]
    fn parses_nested_options() {
        let seed = parse_seed(SEED).expect("seed");
        assert_eq!(seed.categories.len(), 2);
        assert_eq!(seed.categories[0].options.len(), 2);
        assert_eq!(
            seed.categories[0].options[0].image.as_deref(),
            Some("https://img.example/pirate.png")
        );
        assert_eq!(seed.categories[1].ordering, Some(10));
    }

    #[test]
    fn rejects_categories_without_options() {
        let err = parse_seed("[[categories]]\ntitle = \"Empty\"\n").expect_err("no options");
        assert!(err.to_string().contains("has no options"));
    }

    #[tokio::test]
    async fn seeding_appends_in_presentation_order() {
        let storage = Storage::new("sqlite::memory:").await.expect("db");
        let seed = parse_seed(SEED).expect("seed");
        assert_eq!(apply_seed(&storage, &seed).await.expect("apply"), (2, 3));

        let titles: Vec<_> = storage
            .list_categories()
            .await
            .expect("categories")
            .into_iter()
            .map(|c| c.title)
            .collect();
        assert_eq!(titles, ["Best costume", "Best dance"]);
    }

    #[tokio::test]
    async fn promoting_an_unknown_email_fails() {
        let storage = Storage::new("sqlite::memory:").await.expect("db");
        assert!(set_role(&storage, "nobody@example.com", Role::Admin)
            .await
            .is_err());
    }
}
