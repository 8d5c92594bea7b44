use argon2::{
    password_hash::{PasswordHash, PasswordHasher, PasswordVerifier, SaltString},
    Argon2,
};
use chrono::{Duration, Utc};
use jsonwebtoken::{decode, encode, DecodingKey, EncodingKey, Header, Validation};
use serde::{Deserialize, Serialize};
use shared::{
    domain::{Profile, UserId},
    error::ApiError,
    protocol::{
        ChangeKind, ChangeTable, Identity, RegisterRequest, RegisterResponse, SignInRequest,
        SignInResponse,
    },
    routes::AppRoute,
};
use storage::StoredUser;
use tracing::{info, warn};
use uuid::Uuid;

use crate::{internal, ApiContext};

const MIN_PASSWORD_LEN: usize = 6;
const FALLBACK_PARTICIPANT_NAME: &str = "Participant";

#[derive(Debug, Clone)]
pub struct AuthConfig {
    pub jwt_secret: String,
    pub token_ttl_seconds: i64,
}

#[derive(Debug, Serialize, Deserialize)]
struct Claims {
    sub: String,
    iat: i64,
    exp: i64,
}

pub async fn register(
    ctx: &ApiContext,
    req: &RegisterRequest,
) -> Result<RegisterResponse, ApiError> {
    let email = normalize_email(&req.email);
    let username = req.username.trim();
    if email.is_empty() || !email.contains('@') {
        return Err(ApiError::validation("a valid email is required"));
    }
    if username.is_empty() {
        return Err(ApiError::validation("username is required"));
    }
    if req.password.chars().count() < MIN_PASSWORD_LEN {
        return Err(ApiError::validation(format!(
            "password must have at least {MIN_PASSWORD_LEN} characters"
        )));
    }

    let password_hash = hash_password(&req.password)?;
    let user_id = ctx
        .storage
        .create_user(&email, username, &password_hash)
        .await
        .map_err(internal)?
        .ok_or_else(|| ApiError::conflict("email is already registered"))?;
    info!(user_id = user_id.0, "user registered");

    Ok(RegisterResponse {
        user_id,
        message: "registration complete, sign in to continue".into(),
    })
}

pub async fn sign_in(ctx: &ApiContext, req: &SignInRequest) -> Result<SignInResponse, ApiError> {
    let email = normalize_email(&req.email);
    let user = ctx
        .storage
        .user_by_email(&email)
        .await
        .map_err(internal)?
        .filter(|user| verify_password(&req.password, &user.password_hash))
        .ok_or_else(|| {
            warn!("rejected sign-in");
            ApiError::unauthorized("invalid email or password")
        })?;

    let profile = ensure_profile(ctx, &user).await?;
    let identity = identity_of(&user, &profile);
    let token = issue_token(&ctx.auth, user.user_id)?;
    info!(user_id = user.user_id.0, role = identity.role.as_str(), "signed in");

    Ok(SignInResponse {
        token,
        route: AppRoute::home_for(&identity),
        identity,
        message: "signed in".into(),
    })
}

/// Validates a bearer token and returns the identity behind it. The role is
/// read from the profile on every call.
pub async fn resolve_identity(ctx: &ApiContext, token: &str) -> Result<Identity, ApiError> {
    let user_id = verify_token(&ctx.auth, token)?;
    let user = ctx
        .storage
        .user_by_id(user_id)
        .await
        .map_err(internal)?
        .ok_or_else(|| ApiError::unauthorized("account no longer exists"))?;
    let profile = ensure_profile(ctx, &user).await?;
    Ok(identity_of(&user, &profile))
}

async fn ensure_profile(ctx: &ApiContext, user: &StoredUser) -> Result<Profile, ApiError> {
    if let Some(profile) = ctx.storage.profile(user.user_id).await.map_err(internal)? {
        if profile.participant_id.is_some() {
            return Ok(profile);
        }
    }

    let _writer = ctx.write_lock().await;
    let outcome = ctx
        .storage
        .get_or_create_profile(user.user_id, &participant_name(user))
        .await
        .map_err(internal)?;
    if outcome.participant_created {
        info!(
            user_id = user.user_id.0,
            participant_id = outcome.profile.participant_id.map(|p| p.0),
            "participant created"
        );
        ctx.publish(ChangeTable::Participants, ChangeKind::Insert);
    }
    Ok(outcome.profile)
}

fn identity_of(user: &StoredUser, profile: &Profile) -> Identity {
    Identity {
        user_id: user.user_id,
        username: user.username.clone(),
        participant_id: profile.participant_id,
        role: profile.role,
    }
}

fn participant_name(user: &StoredUser) -> String {
    let username = user.username.trim();
    if !username.is_empty() {
        return username.to_string();
    }
    user.email
        .split('@')
        .next()
        .filter(|prefix| !prefix.is_empty())
        .unwrap_or(FALLBACK_PARTICIPANT_NAME)
        .to_string()
}

fn normalize_email(raw: &str) -> String {
    raw.trim().to_ascii_lowercase()
}

pub fn issue_token(cfg: &AuthConfig, user_id: UserId) -> Result<String, ApiError> {
    let now = Utc::now();
    let claims = Claims {
        sub: user_id.0.to_string(),
        iat: now.timestamp(),
        exp: (now + Duration::seconds(cfg.token_ttl_seconds)).timestamp(),
    };
    encode(
        &Header::default(),
        &claims,
        &EncodingKey::from_secret(cfg.jwt_secret.as_bytes()),
    )
    .map_err(|e| internal(anyhow::anyhow!("token signing failed: {e}")))
}

pub fn verify_token(cfg: &AuthConfig, token: &str) -> Result<UserId, ApiError> {
    let data = decode::<Claims>(
        token,
        &DecodingKey::from_secret(cfg.jwt_secret.as_bytes()),
        &Validation::default(),
    )
    .map_err(|_| ApiError::unauthorized("invalid or expired session"))?;
    data.claims
        .sub
        .parse::<i64>()
        .map(UserId)
        .map_err(|_| ApiError::unauthorized("invalid or expired session"))
}

/// Argon2id with default parameters, stored as a PHC string.
pub fn hash_password(password: &str) -> Result<String, ApiError> {
    let salt = SaltString::encode_b64(Uuid::new_v4().as_bytes())
        .map_err(|e| internal(anyhow::anyhow!("salt encoding failed: {e}")))?;
    Argon2::default()
        .hash_password(password.as_bytes(), &salt)
        .map(|hash| hash.to_string())
        .map_err(|e| internal(anyhow::anyhow!("password hashing failed: {e}")))
}

/// False for a wrong password and for anything that is not a PHC string.
pub fn verify_password(password: &str, stored: &str) -> bool {
    let Ok(parsed) = PasswordHash::new(stored) else {
        return false;
    };
    Argon2::default()
        .verify_password(password.as_bytes(), &parsed)
        .is_ok()
}
