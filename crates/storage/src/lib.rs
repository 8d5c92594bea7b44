use anyhow::{Context, Result};
use chrono::{DateTime, Utc};
use sqlx::{
    sqlite::{SqliteConnectOptions, SqlitePoolOptions},
    Pool, Row, Sqlite,
};
use std::{
    fs,
    path::{Path, PathBuf},
    str::FromStr,
};

use shared::{
    domain::{
        Category, CategoryId, OptionId, Participant, ParticipantId, Phase, Profile, Role,
        SessionState, UserId, VoteOption,
    },
    protocol::VoteProgress,
};

const ADMIN_PARTICIPANTS: &str =
    "SELECT participant_id FROM profiles WHERE role = 'admin' AND participant_id IS NOT NULL";

#[derive(Clone)]
pub struct Storage {
    pool: Pool<Sqlite>,
}

#[derive(Debug, Clone)]
pub struct StoredUser {
    pub user_id: UserId,
    pub email: String,
    pub username: String,
    pub password_hash: String,
    pub created_at: DateTime<Utc>,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ProfileOutcome {
    pub profile: Profile,
    pub participant_created: bool,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum VoteInsert {
    Inserted,
    AlreadyVoted { option_id: OptionId },
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct OptionTally {
    pub category_id: CategoryId,
    pub option_id: OptionId,
    pub name: String,
    pub image: Option<String>,
    pub vote_count: u64,
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct ClearedRows {
    pub votes: u64,
    pub participants: u64,
}

impl Storage {
    pub async fn new(database_url: &str) -> Result<Self> {
        ensure_sqlite_parent_dir_exists(database_url)?;

        let connect_options = SqliteConnectOptions::from_str(database_url)?
            .create_if_missing(true)
            .foreign_keys(true);
        let pool = SqlitePoolOptions::new()
            .max_connections(5)
            .connect_with(connect_options)
            .await?;
        sqlx::migrate!("./migrations").run(&pool).await?;
        Ok(Self { pool })
    }

    pub fn pool(&self) -> &Pool<Sqlite> {
        &self.pool
    }

    pub async fn health_check(&self) -> Result<()> {
        let _: i64 = sqlx::query_scalar("SELECT 1")
            .fetch_one(&self.pool)
            .await
            .context("sqlite ping failed")?;
        Ok(())
    }

    /// Returns `None` when the email is already registered.
    pub async fn create_user(
        &self,
        email: &str,
        username: &str,
        password_hash: &str,
    ) -> Result<Option<UserId>> {
        let row = sqlx::query(
            "INSERT INTO users (email, username, password_hash) VALUES (?, ?, ?)
             ON CONFLICT(email) DO NOTHING
             RETURNING id",
        )
        .bind(email)
        .bind(username)
        .bind(password_hash)
        .fetch_optional(&self.pool)
        .await
        .context("failed to insert user")?;
        Ok(row.map(|r| UserId(r.get::<i64, _>(0))))
    }

    pub async fn user_by_email(&self, email: &str) -> Result<Option<StoredUser>> {
        let row = sqlx::query(
            "SELECT id, email, username, password_hash, created_at FROM users WHERE email = ?",
        )
        .bind(email)
        .fetch_optional(&self.pool)
        .await
        .context("failed to load user by email")?;
        Ok(row.map(|r| stored_user(&r)))
    }

    pub async fn user_by_id(&self, user_id: UserId) -> Result<Option<StoredUser>> {
        let row = sqlx::query(
            "SELECT id, email, username, password_hash, created_at FROM users WHERE id = ?",
        )
        .bind(user_id.0)
        .fetch_optional(&self.pool)
        .await
        .context("failed to load user")?;
        Ok(row.map(|r| stored_user(&r)))
    }

    pub async fn profile(&self, user_id: UserId) -> Result<Option<Profile>> {
        let row = sqlx::query("SELECT user_id, participant_id, role FROM profiles WHERE user_id = ?")
            .bind(user_id.0)
            .fetch_optional(&self.pool)
            .await
            .context("failed to load profile")?;
        row.map(|r| profile_from_row(&r)).transpose()
    }

    /// Idempotent: an existing profile with a participant is returned as is,
    /// otherwise a participant is created and linked in the same transaction.
    pub async fn get_or_create_profile(
        &self,
        user_id: UserId,
        participant_name: &str,
    ) -> Result<ProfileOutcome> {
        let mut tx = self.pool.begin().await?;

        let existing =
            sqlx::query("SELECT user_id, participant_id, role FROM profiles WHERE user_id = ?")
                .bind(user_id.0)
                .fetch_optional(&mut *tx)
                .await
                .context("failed to load profile")?;
        if let Some(row) = existing {
            let profile = profile_from_row(&row)?;
            if profile.participant_id.is_some() {
                tx.commit().await?;
                return Ok(ProfileOutcome {
                    profile,
                    participant_created: false,
                });
            }
        }

        let participant_id: i64 =
            sqlx::query_scalar("INSERT INTO participants (name) VALUES (?) RETURNING id")
                .bind(participant_name)
                .fetch_one(&mut *tx)
                .await
                .context("failed to insert participant")?;

        let row = sqlx::query(
            "INSERT INTO profiles (user_id, participant_id, role) VALUES (?, ?, 'participant')
             ON CONFLICT(user_id) DO UPDATE SET participant_id = excluded.participant_id
             RETURNING user_id, participant_id, role",
        )
        .bind(user_id.0)
        .bind(participant_id)
        .fetch_one(&mut *tx)
        .await
        .context("failed to upsert profile")?;
        let profile = profile_from_row(&row)?;

        tx.commit().await?;
        Ok(ProfileOutcome {
            profile,
            participant_created: true,
        })
    }

    /// Role assignment happens out-of-band; returns false for unknown emails.
    pub async fn set_role_by_email(&self, email: &str, role: Role) -> Result<bool> {
        let Some(user) = self.user_by_email(email).await? else {
            return Ok(false);
        };
        sqlx::query(
            "INSERT INTO profiles (user_id, role) VALUES (?, ?)
             ON CONFLICT(user_id) DO UPDATE SET role = excluded.role",
        )
        .bind(user.user_id.0)
        .bind(role.as_str())
        .execute(&self.pool)
        .await
        .context("failed to update role")?;
        Ok(true)
    }

    pub async fn create_participant(&self, name: &str) -> Result<ParticipantId> {
        let id: i64 = sqlx::query_scalar("INSERT INTO participants (name) VALUES (?) RETURNING id")
            .bind(name)
            .fetch_one(&self.pool)
            .await
            .context("failed to insert participant")?;
        Ok(ParticipantId(id))
    }

    pub async fn list_participants(&self) -> Result<Vec<Participant>> {
        let rows = sqlx::query("SELECT id, name FROM participants ORDER BY id ASC")
            .fetch_all(&self.pool)
            .await?;
        Ok(rows
            .into_iter()
            .map(|r| Participant {
                participant_id: ParticipantId(r.get::<i64, _>(0)),
                name: r.get::<String, _>(1),
            })
            .collect())
    }

    pub async fn create_category(&self, title: &str, ordering: i64) -> Result<CategoryId> {
        let id: i64 =
            sqlx::query_scalar("INSERT INTO categories (title, ordering) VALUES (?, ?) RETURNING id")
                .bind(title)
                .bind(ordering)
                .fetch_one(&self.pool)
                .await
                .context("failed to insert category")?;
        Ok(CategoryId(id))
    }

    pub async fn create_option(
        &self,
        category_id: CategoryId,
        name: &str,
        image: Option<&str>,
    ) -> Result<OptionId> {
        let id: i64 = sqlx::query_scalar(
            "INSERT INTO options (category_id, name, image) VALUES (?, ?, ?) RETURNING id",
        )
        .bind(category_id.0)
        .bind(name)
        .bind(image)
        .fetch_one(&self.pool)
        .await
        .context("failed to insert option")?;
        Ok(OptionId(id))
    }

    /// Categories in presentation order: `ordering`, then id.
    pub async fn list_categories(&self) -> Result<Vec<Category>> {
        let rows = sqlx::query("SELECT id, title, ordering FROM categories ORDER BY ordering ASC, id ASC")
            .fetch_all(&self.pool)
            .await
            .context("failed to list categories")?;
        Ok(rows.iter().map(category_from_row).collect())
    }

    pub async fn category(&self, category_id: CategoryId) -> Result<Option<Category>> {
        if category_id.is_lobby() {
            return Ok(None);
        }
        let row = sqlx::query("SELECT id, title, ordering FROM categories WHERE id = ?")
            .bind(category_id.0)
            .fetch_optional(&self.pool)
            .await
            .context("failed to load category")?;
        Ok(row.as_ref().map(category_from_row))
    }

    pub async fn options_for_category(&self, category_id: CategoryId) -> Result<Vec<VoteOption>> {
        let rows = sqlx::query(
            "SELECT id, category_id, name, image FROM options WHERE category_id = ? ORDER BY id ASC",
        )
        .bind(category_id.0)
        .fetch_all(&self.pool)
        .await
        .context("failed to list options")?;
        Ok(rows.iter().map(option_from_row).collect())
    }

    pub async fn option(&self, option_id: OptionId) -> Result<Option<VoteOption>> {
        let row = sqlx::query("SELECT id, category_id, name, image FROM options WHERE id = ?")
            .bind(option_id.0)
            .fetch_optional(&self.pool)
            .await
            .context("failed to load option")?;
        Ok(row.as_ref().map(option_from_row))
    }

    /// `None` only if the singleton row has been removed out-of-band.
    pub async fn session_state(&self) -> Result<Option<SessionState>> {
        let row = sqlx::query(
            "SELECT current_category_id, phase, locked, updated_at FROM session_state WHERE id = 1",
        )
        .fetch_optional(&self.pool)
        .await
        .context("failed to load session state")?;
        row.map(|r| session_state_from_row(&r)).transpose()
    }

    pub async fn write_session_state(
        &self,
        current_category_id: CategoryId,
        phase: Phase,
        locked: bool,
    ) -> Result<SessionState> {
        let row = sqlx::query(
            "INSERT INTO session_state (id, current_category_id, phase, locked, updated_at)
             VALUES (1, ?, ?, ?, ?)
             ON CONFLICT(id) DO UPDATE SET
                current_category_id = excluded.current_category_id,
                phase = excluded.phase,
                locked = excluded.locked,
                updated_at = excluded.updated_at
             RETURNING current_category_id, phase, locked, updated_at",
        )
        .bind(current_category_id.0)
        .bind(phase.as_str())
        .bind(locked)
        .bind(Utc::now())
        .fetch_one(&self.pool)
        .await
        .context("failed to write session state")?;
        session_state_from_row(&row)
    }

    /// The UNIQUE (participant_id, category_id) constraint makes a second
    /// insert a no-op; the existing choice is reported back.
    pub async fn insert_vote(
        &self,
        participant_id: ParticipantId,
        category_id: CategoryId,
        option_id: OptionId,
    ) -> Result<VoteInsert> {
        let result = sqlx::query(
            "INSERT INTO votes (participant_id, category_id, option_id) VALUES (?, ?, ?)
             ON CONFLICT(participant_id, category_id) DO NOTHING",
        )
        .bind(participant_id.0)
        .bind(category_id.0)
        .bind(option_id.0)
        .execute(&self.pool)
        .await
        .context("failed to insert vote")?;

        if result.rows_affected() > 0 {
            return Ok(VoteInsert::Inserted);
        }
        let existing = self
            .vote_for(participant_id, category_id)
            .await?
            .context("vote conflict without an existing vote")?;
        Ok(VoteInsert::AlreadyVoted {
            option_id: existing,
        })
    }

    pub async fn vote_for(
        &self,
        participant_id: ParticipantId,
        category_id: CategoryId,
    ) -> Result<Option<OptionId>> {
        let row = sqlx::query("SELECT option_id FROM votes WHERE participant_id = ? AND category_id = ?")
            .bind(participant_id.0)
            .bind(category_id.0)
            .fetch_optional(&self.pool)
            .await
            .context("failed to load vote")?;
        Ok(row.map(|r| OptionId(r.get::<i64, _>(0))))
    }

    pub async fn count_votes(&self) -> Result<u64> {
        let count: i64 = sqlx::query_scalar("SELECT COUNT(*) FROM votes")
            .fetch_one(&self.pool)
            .await?;
        Ok(to_count(count))
    }

    /// Participants linked to admin profiles count neither as voters nor as
    /// votes.
    pub async fn vote_progress(&self, category_id: CategoryId) -> Result<VoteProgress> {
        let voted: i64 = sqlx::query_scalar(&format!(
            "SELECT COUNT(*) FROM votes WHERE category_id = ? AND participant_id NOT IN ({ADMIN_PARTICIPANTS})"
        ))
        .bind(category_id.0)
        .fetch_one(&self.pool)
        .await
        .context("failed to count votes")?;
        let total: i64 = sqlx::query_scalar(&format!(
            "SELECT COUNT(*) FROM participants WHERE id NOT IN ({ADMIN_PARTICIPANTS})"
        ))
        .fetch_one(&self.pool)
        .await
        .context("failed to count participants")?;
        Ok(VoteProgress {
            category_id,
            voted_count: to_count(voted),
            total_participants: to_count(total),
        })
    }

    /// Options ranked by vote count, ties broken by option id.
    pub async fn option_tallies(&self, category_id: CategoryId, limit: u32) -> Result<Vec<OptionTally>> {
        let rows = sqlx::query(
            "SELECT category_id, option_id, option_name, option_image, vote_count
             FROM winners_view
             WHERE category_id = ?
             ORDER BY vote_count DESC, option_id ASC
             LIMIT ?",
        )
        .bind(category_id.0)
        .bind(limit)
        .fetch_all(&self.pool)
        .await
        .context("failed to rank options")?;
        Ok(rows.iter().map(tally_from_row).collect())
    }

    /// The leading option of every category that has at least one vote.
    pub async fn category_leaders(&self) -> Result<Vec<OptionTally>> {
        let rows = sqlx::query(
            "SELECT category_id, option_id, option_name, option_image, vote_count
             FROM winners_view
             WHERE vote_count > 0
             ORDER BY category_id ASC, vote_count DESC, option_id ASC",
        )
        .fetch_all(&self.pool)
        .await
        .context("failed to load category leaders")?;

        let mut leaders: Vec<OptionTally> = Vec::new();
        for tally in rows.iter().map(tally_from_row) {
            if leaders.last().map(|l| l.category_id) != Some(tally.category_id) {
                leaders.push(tally);
            }
        }
        Ok(leaders)
    }

    pub async fn clear_votes(&self) -> Result<u64> {
        let result = sqlx::query("DELETE FROM votes")
            .execute(&self.pool)
            .await
            .context("failed to clear votes")?;
        Ok(result.rows_affected())
    }

    /// Deletes every vote and participant; profiles survive unlinked and get
    /// a fresh participant on their next sign-in.
    pub async fn clear_participants_and_votes(&self) -> Result<ClearedRows> {
        let mut tx = self.pool.begin().await?;
        let votes = sqlx::query("DELETE FROM votes")
            .execute(&mut *tx)
            .await
            .context("failed to clear votes")?
            .rows_affected();
        sqlx::query("UPDATE profiles SET participant_id = NULL")
            .execute(&mut *tx)
            .await
            .context("failed to unlink profiles")?;
        let participants = sqlx::query("DELETE FROM participants")
            .execute(&mut *tx)
            .await
            .context("failed to clear participants")?
            .rows_affected();
        tx.commit().await?;
        Ok(ClearedRows {
            votes,
            participants,
        })
    }
}

fn to_count(value: i64) -> u64 {
    u64::try_from(value).unwrap_or_default()
}

fn stored_user(r: &sqlx::sqlite::SqliteRow) -> StoredUser {
    StoredUser {
        user_id: UserId(r.get::<i64, _>(0)),
        email: r.get::<String, _>(1),
        username: r.get::<String, _>(2),
        password_hash: r.get::<String, _>(3),
        created_at: r.get::<DateTime<Utc>, _>(4),
    }
}

fn profile_from_row(r: &sqlx::sqlite::SqliteRow) -> Result<Profile> {
    let role = r
        .get::<String, _>(2)
        .parse::<Role>()
        .context("invalid role stored in profiles")?;
    Ok(Profile {
        user_id: UserId(r.get::<i64, _>(0)),
        participant_id: r.get::<Option<i64>, _>(1).map(ParticipantId),
        role,
    })
}

fn category_from_row(r: &sqlx::sqlite::SqliteRow) -> Category {
    Category {
        category_id: CategoryId(r.get::<i64, _>(0)),
        title: r.get::<String, _>(1),
        ordering: r.get::<i64, _>(2),
    }
}

fn option_from_row(r: &sqlx::sqlite::SqliteRow) -> VoteOption {
    VoteOption {
        option_id: OptionId(r.get::<i64, _>(0)),
        category_id: CategoryId(r.get::<i64, _>(1)),
        name: r.get::<String, _>(2),
        image: r.get::<Option<String>, _>(3),
    }
}

fn tally_from_row(r: &sqlx::sqlite::SqliteRow) -> OptionTally {
    OptionTally {
        category_id: CategoryId(r.get::<i64, _>(0)),
        option_id: OptionId(r.get::<i64, _>(1)),
        name: r.get::<String, _>(2),
        image: r.get::<Option<String>, _>(3),
        vote_count: to_count(r.get::<i64, _>(4)),
    }
}

fn session_state_from_row(r: &sqlx::sqlite::SqliteRow) -> Result<SessionState> {
    let phase = r
        .get::<String, _>(1)
        .parse::<Phase>()
        .context("invalid phase stored in session_state")?;
    Ok(SessionState {
        current_category_id: CategoryId(r.get::<i64, _>(0)),
        phase,
        locked: r.get::<bool, _>(2),
        updated_at: r.get::<Option<DateTime<Utc>>, _>(3),
    })
}

fn ensure_sqlite_parent_dir_exists(database_url: &str) -> Result<()> {
    let Some(path) = sqlite_path(database_url) else {
        return Ok(());
    };

    let Some(parent) = path.parent() else {
        return Ok(());
    };

    fs::create_dir_all(parent).with_context(|| {
        format!(
            "failed to create parent directory '{}' for database url '{database_url}'",
            parent.display()
        )
    })?;

    Ok(())
}

fn sqlite_path(database_url: &str) -> Option<PathBuf> {
    if database_url.starts_with("sqlite::memory:") || !database_url.starts_with("sqlite:") {
        return None;
    }

    let path = database_url
        .trim_start_matches("sqlite://")
        .trim_start_matches("sqlite:")
        .split('?')
        .next()
        .unwrap_or_default();

    if path.is_empty() {
        return None;
    }

    Some(Path::new(path).to_path_buf())
}

#[cfg(test)]
#[path = "tests/lib_tests.rs"]
mod tests;
