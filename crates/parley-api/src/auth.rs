use std::sync::Arc;

use argon2::{
    Argon2, PasswordHash, PasswordHasher, PasswordVerifier,
    password_hash::{SaltString, rand_core::OsRng},
};
use axum::{Json, extract::State, http::StatusCode, response::IntoResponse};
use jsonwebtoken::{EncodingKey, Header, encode};
use tracing::{info, warn};
use uuid::Uuid;

use parley_db::Database;
use parley_types::api::{
    Claims, CreateUserRequest, CreateUserResponse, LoginRequest, LoginResponse,
};
use parley_types::models::Role;

use crate::users::user_from_row;

pub type AppState = Arc<AppStateInner>;

pub struct AppStateInner {
    pub db: Arc<Database>,
    pub jwt_secret: String,
}

pub async fn login(
    State(state): State<AppState>,
    Json(req): Json<LoginRequest>,
) -> Result<impl IntoResponse, StatusCode> {
    let row = state
        .db
        .get_user_by_email(&req.email)
        .map_err(|_| StatusCode::INTERNAL_SERVER_ERROR)?
        .ok_or_else(|| {
            warn!("Login failed: no account for {}", req.email);
            StatusCode::UNAUTHORIZED
        })?;

    // Verify password
    let parsed_hash =
        PasswordHash::new(&row.password).map_err(|_| StatusCode::INTERNAL_SERVER_ERROR)?;

    Argon2::default()
        .verify_password(req.password.as_bytes(), &parsed_hash)
        .map_err(|_| {
            warn!("Login failed: bad password for {}", req.email);
            StatusCode::UNAUTHORIZED
        })?;

    let user_id: Uuid = row
        .id
        .parse()
        .map_err(|_| StatusCode::INTERNAL_SERVER_ERROR)?;
    let role = Role::parse(&row.role);

    let token = create_token(&state.jwt_secret, user_id, role)
        .map_err(|_| StatusCode::INTERNAL_SERVER_ERROR)?;

    // A successful login counts as activity. Presence itself stays owned by
    // the relay session lifecycle.
    if let Err(e) = state.db.touch_last_seen(&row.id, chrono::Utc::now()) {
        warn!("Failed to stamp last_seen for {}: {}", row.id, e);
    }

    info!("Login successful for {}", req.email);

    Ok(Json(LoginResponse {
        access_token: token,
        token_type: "bearer".into(),
        user: user_from_row(row),
    }))
}

/// Self-service account creation.
pub async fn create_user(
    State(state): State<AppState>,
    Json(req): Json<CreateUserRequest>,
) -> Result<impl IntoResponse, StatusCode> {
    create_account(&state, req, Role::Customer).await
}

/// Shared by public signup and the admin create endpoint.
pub(crate) async fn create_account(
    state: &AppState,
    req: CreateUserRequest,
    role: Role,
) -> Result<(StatusCode, Json<CreateUserResponse>), StatusCode> {
    // Validate input
    if req.email.len() < 3 || !req.email.contains('@') {
        return Err(StatusCode::BAD_REQUEST);
    }
    if req.password.len() < 8 {
        return Err(StatusCode::BAD_REQUEST);
    }

    // Check if email is taken
    if state
        .db
        .get_user_by_email(&req.email)
        .map_err(|_| StatusCode::INTERNAL_SERVER_ERROR)?
        .is_some()
    {
        return Err(StatusCode::CONFLICT);
    }

    let password_hash = hash_password(&req.password)?;
    let user_id = Uuid::new_v4();

    state
        .db
        .create_user(
            &user_id.to_string(),
            &req.email,
            req.username.as_deref(),
            &password_hash,
            role,
        )
        .map_err(|_| StatusCode::INTERNAL_SERVER_ERROR)?;

    info!("Created {} account for {}", role.as_str(), req.email);

    Ok((
        StatusCode::CREATED,
        Json(CreateUserResponse {
            id: user_id,
            email: req.email,
        }),
    ))
}

pub(crate) fn hash_password(password: &str) -> Result<String, StatusCode> {
    // Hash with Argon2id
    let salt = SaltString::generate(&mut OsRng);
    let argon2 = Argon2::default();
    argon2
        .hash_password(password.as_bytes(), &salt)
        .map(|h| h.to_string())
        .map_err(|_| StatusCode::INTERNAL_SERVER_ERROR)
}

fn create_token(secret: &str, user_id: Uuid, role: Role) -> anyhow::Result<String> {
    let claims = Claims {
        sub: user_id,
        role,
        exp: (chrono::Utc::now() + chrono::Duration::days(30)).timestamp() as usize,
    };

    let token = encode(
        &Header::default(),
        &claims,
        &EncodingKey::from_secret(secret.as_bytes()),
    )?;

    Ok(token)
}
