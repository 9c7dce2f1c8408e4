use axum::{Extension, Json, extract::State, http::StatusCode, response::IntoResponse};
use chrono::{DateTime, NaiveDateTime, Utc};
use tracing::warn;

use parley_db::models::UserRow;
use parley_types::api::{ChangePasswordRequest, Claims};
use parley_types::models::{Role, User};

use crate::auth::{AppState, hash_password};

pub async fn me(
    State(state): State<AppState>,
    Extension(claims): Extension<Claims>,
) -> Result<impl IntoResponse, StatusCode> {
    let row = state
        .db
        .get_user_by_id(&claims.sub.to_string())
        .map_err(|_| StatusCode::INTERNAL_SERVER_ERROR)?
        .ok_or(StatusCode::UNAUTHORIZED)?;

    Ok(Json(user_from_row(row)))
}

pub async fn change_password(
    State(state): State<AppState>,
    Extension(claims): Extension<Claims>,
    Json(req): Json<ChangePasswordRequest>,
) -> Result<impl IntoResponse, StatusCode> {
    if req.new_password.len() < 8 {
        return Err(StatusCode::BAD_REQUEST);
    }

    let password_hash = hash_password(&req.new_password)?;

    state
        .db
        .update_password(&claims.sub.to_string(), &password_hash)
        .map_err(|_| StatusCode::INTERNAL_SERVER_ERROR)?;

    Ok(StatusCode::NO_CONTENT)
}

/// User directory with presence fields, for picking a chat peer.
pub async fn list_users(
    State(state): State<AppState>,
    Extension(_claims): Extension<Claims>,
) -> Result<impl IntoResponse, StatusCode> {
    let rows = state
        .db
        .list_users()
        .map_err(|_| StatusCode::INTERNAL_SERVER_ERROR)?;

    let users: Vec<User> = rows.into_iter().map(user_from_row).collect();
    Ok(Json(users))
}

/// Convert a DB row into the API user model. Password hashes never leave
/// this boundary.
pub(crate) fn user_from_row(row: UserRow) -> User {
    User {
        id: row.id.parse().unwrap_or_else(|e| {
            warn!("Corrupt user id '{}': {}", row.id, e);
            uuid::Uuid::default()
        }),
        email: row.email,
        username: row.username,
        role: Role::parse(&row.role),
        is_first_login: row.is_first_login,
        created_at: parse_db_time(&row.created_at).unwrap_or_else(|| {
            warn!("Corrupt created_at '{}' on user '{}'", row.created_at, row.id);
            DateTime::default()
        }),
        is_online: row.is_online,
        last_seen: row.last_seen.as_deref().and_then(parse_db_time),
    }
}

/// Timestamps come in two shapes: RFC 3339 written by our code, and
/// SQLite's `datetime('now')` default (`YYYY-MM-DD HH:MM:SS`, no timezone,
/// UTC by convention).
pub(crate) fn parse_db_time(s: &str) -> Option<DateTime<Utc>> {
    s.parse::<DateTime<Utc>>().ok().or_else(|| {
        NaiveDateTime::parse_from_str(s, "%Y-%m-%d %H:%M:%S")
            .ok()
            .map(|ndt| ndt.and_utc())
    })
}
