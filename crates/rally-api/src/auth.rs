use std::sync::Arc;

use argon2::password_hash::{SaltString, rand_core::OsRng};
use argon2::{Argon2, PasswordHash, PasswordHasher, PasswordVerifier};
use axum::{Json, extract::State, http::StatusCode, response::IntoResponse};
use jsonwebtoken::{EncodingKey, Header, encode};
use uuid::Uuid;

use rally_core::Coordinator;
use rally_db::Database;
use rally_db::queries::CreateUserOutcome;
use rally_types::api::{
    Claims, LoginRequest, LoginResponse, RegisterRequest, RegisterResponse,
};

use crate::error::{ApiError, bad_request, conflict, internal, unauthorized};

/// Tokens expire after this; clients log in again rather than refresh.
const TOKEN_TTL_DAYS: i64 = 30;

pub type AppState = Arc<AppStateInner>;

pub struct AppStateInner {
    pub db: Arc<Database>,
    pub coordinator: Coordinator,
    pub jwt_secret: String,
}

pub async fn register(
    State(state): State<AppState>,
    Json(req): Json<RegisterRequest>,
) -> Result<impl IntoResponse, ApiError> {
    let username = req.username.trim().to_string();
    if username.len() < 3 || username.len() > 32 {
        return Err(bad_request("username must be 3 to 32 characters"));
    }
    if req.password.len() < 8 {
        return Err(bad_request("password must be at least 8 characters"));
    }

    let user_id = Uuid::new_v4();
    let db = state.db.clone();
    let name = username.clone();
    let password = req.password;
    // Argon2 is deliberately slow; keep it off the runtime threads together
    // with the insert. Uniqueness is settled by the insert itself, so two
    // racing registrations cannot both win.
    let outcome = tokio::task::spawn_blocking(move || {
        let salt = SaltString::generate(&mut OsRng);
        let hash = Argon2::default()
            .hash_password(password.as_bytes(), &salt)
            .map_err(|e| anyhow::anyhow!("password hashing failed: {}", e))?
            .to_string();
        db.create_user(&user_id.to_string(), &name, &hash)
    })
    .await
    .map_err(internal)?
    .map_err(internal)?;

    if matches!(outcome, CreateUserOutcome::UsernameTaken) {
        return Err(conflict("username is taken"));
    }

    let token = issue_token(&state.jwt_secret, user_id, &username).map_err(internal)?;
    Ok((StatusCode::CREATED, Json(RegisterResponse { user_id, token })))
}

pub async fn login(
    State(state): State<AppState>,
    Json(req): Json<LoginRequest>,
) -> Result<impl IntoResponse, ApiError> {
    let db = state.db.clone();
    let username = req.username.trim().to_string();
    let password = req.password;

    let verified = tokio::task::spawn_blocking(move || {
        let Some(user) = db.get_user_by_username(&username)? else {
            return anyhow::Ok(None);
        };
        let parsed = PasswordHash::new(&user.password)
            .map_err(|e| anyhow::anyhow!("stored password hash unreadable: {}", e))?;
        let matches = Argon2::default()
            .verify_password(password.as_bytes(), &parsed)
            .is_ok();
        Ok(matches.then_some(user))
    })
    .await
    .map_err(internal)?
    .map_err(internal)?;

    // Unknown user and wrong password get the same answer.
    let Some(user) = verified else {
        return Err(unauthorized());
    };

    let user_id: Uuid = user.id.parse().map_err(internal)?;
    let token = issue_token(&state.jwt_secret, user_id, &user.username).map_err(internal)?;

    Ok(Json(LoginResponse {
        user_id,
        username: user.username,
        token,
    }))
}

fn issue_token(secret: &str, user_id: Uuid, username: &str) -> anyhow::Result<String> {
    let expires = chrono::Utc::now() + chrono::Duration::days(TOKEN_TTL_DAYS);
    let claims = Claims {
        sub: user_id,
        username: username.to_string(),
        exp: expires.timestamp() as usize,
    };
    let token = encode(
        &Header::default(),
        &claims,
        &EncodingKey::from_secret(secret.as_bytes()),
    )?;
    Ok(token)
}
