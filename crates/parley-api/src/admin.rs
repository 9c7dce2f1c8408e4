use axum::{Extension, Json, extract::State, http::StatusCode, response::IntoResponse};
use chrono::{Duration, NaiveTime, Utc};
use tracing::error;

use parley_types::api::{AdminStats, Claims, CreateUserRequest};
use parley_types::models::{Role, User};

use crate::auth::{AppState, create_account};
use crate::users::user_from_row;

fn require_admin(claims: &Claims) -> Result<(), StatusCode> {
    if claims.role != Role::Admin {
        return Err(StatusCode::FORBIDDEN);
    }
    Ok(())
}

/// Admin-provisioned customer account.
pub async fn create_customer(
    State(state): State<AppState>,
    Extension(claims): Extension<Claims>,
    Json(req): Json<CreateUserRequest>,
) -> Result<impl IntoResponse, StatusCode> {
    require_admin(&claims)?;
    create_account(&state, req, Role::Customer).await
}

pub async fn list_customers(
    State(state): State<AppState>,
    Extension(claims): Extension<Claims>,
) -> Result<impl IntoResponse, StatusCode> {
    require_admin(&claims)?;

    let rows = state
        .db
        .list_users_by_role(Role::Customer)
        .map_err(|_| StatusCode::INTERNAL_SERVER_ERROR)?;

    let users: Vec<User> = rows.into_iter().map(user_from_row).collect();
    Ok(Json(users))
}

pub async fn stats(
    State(state): State<AppState>,
    Extension(claims): Extension<Claims>,
) -> Result<impl IntoResponse, StatusCode> {
    require_admin(&claims)?;

    let db = state.db.clone();
    let stats = tokio::task::spawn_blocking(move || -> anyhow::Result<AdminStats> {
        let midnight = Utc::now().date_naive().and_time(NaiveTime::MIN).and_utc();
        let day_ago = Utc::now() - Duration::hours(24);

        Ok(AdminStats {
            total_users: db.count_users_by_role(Role::Customer)?,
            total_messages: db.count_messages()?,
            messages_today: db.count_messages_since(midnight)?,
            active_users: db.count_distinct_senders_since(day_ago)?,
        })
    })
    .await
    .map_err(|e| {
        error!("spawn_blocking join error: {}", e);
        StatusCode::INTERNAL_SERVER_ERROR
    })?
    .map_err(|_| StatusCode::INTERNAL_SERVER_ERROR)?;

    Ok(Json(stats))
}
