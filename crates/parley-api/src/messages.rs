use std::sync::Arc;

use axum::{
    Extension, Json,
    extract::{Path, Query, State},
    http::StatusCode,
    response::IntoResponse,
};
use serde::Deserialize;
use tracing::{error, warn};
use uuid::Uuid;

use parley_db::models::MessageRow;
use parley_types::api::{Claims, MarkReadRequest, MarkReadResponse};
use parley_types::models::{DeliveryStatus, Message, Role};

use crate::auth::AppStateInner;
use crate::users::parse_db_time;

#[derive(Debug, Deserialize)]
pub struct HistoryQuery {
    #[serde(default = "default_limit")]
    pub limit: u32,
}

fn default_limit() -> u32 {
    200
}

/// Conversation history for a user: everything they sent or received,
/// oldest first. Users see their own history; admins see anyone's.
pub async fn get_messages(
    State(state): State<Arc<AppStateInner>>,
    Path(user_id): Path<Uuid>,
    Query(query): Query<HistoryQuery>,
    Extension(claims): Extension<Claims>,
) -> Result<impl IntoResponse, StatusCode> {
    if claims.sub != user_id && claims.role != Role::Admin {
        return Err(StatusCode::FORBIDDEN);
    }

    // Run the bulk read off the async runtime
    let db = state.db.clone();
    let uid = user_id.to_string();
    let limit = query.limit.min(1000);

    let rows = tokio::task::spawn_blocking(move || db.messages_for_user(&uid, limit))
        .await
        .map_err(|e| {
            error!("spawn_blocking join error: {}", e);
            StatusCode::INTERNAL_SERVER_ERROR
        })?
        .map_err(|_| StatusCode::INTERNAL_SERVER_ERROR)?;

    let messages: Vec<Message> = rows.into_iter().map(message_from_row).collect();
    Ok(Json(messages))
}

/// Read-receipt collaborator: bulk-advance every unread message from
/// `sender_id` to `receiver_id` to `read`. Mutates the store directly;
/// deliberately not routed through the dispatcher.
pub async fn mark_read(
    State(state): State<Arc<AppStateInner>>,
    Extension(claims): Extension<Claims>,
    Json(req): Json<MarkReadRequest>,
) -> Result<impl IntoResponse, StatusCode> {
    // Only the recipient can acknowledge reading their own messages.
    if claims.sub != req.receiver_id && claims.role != Role::Admin {
        return Err(StatusCode::FORBIDDEN);
    }

    let db = state.db.clone();
    let sender = req.sender_id.to_string();
    let receiver = req.receiver_id.to_string();

    let updated = tokio::task::spawn_blocking(move || {
        db.mark_read(&sender, &receiver, chrono::Utc::now())
    })
    .await
    .map_err(|e| {
        error!("spawn_blocking join error: {}", e);
        StatusCode::INTERNAL_SERVER_ERROR
    })?
    .map_err(|_| StatusCode::INTERNAL_SERVER_ERROR)?;

    Ok(Json(MarkReadResponse { updated }))
}

fn message_from_row(row: MessageRow) -> Message {
    Message {
        id: row.id.parse().unwrap_or_else(|e| {
            warn!("Corrupt message id '{}': {}", row.id, e);
            Uuid::default()
        }),
        sender_id: row.sender_id.parse().unwrap_or_else(|e| {
            warn!("Corrupt sender_id '{}' on message '{}': {}", row.sender_id, row.id, e);
            Uuid::default()
        }),
        receiver_id: row.receiver_id.parse().unwrap_or_else(|e| {
            warn!("Corrupt receiver_id '{}' on message '{}': {}", row.receiver_id, row.id, e);
            Uuid::default()
        }),
        content: row.content,
        created_at: parse_db_time(&row.created_at).unwrap_or_else(|| {
            warn!("Corrupt created_at '{}' on message '{}'", row.created_at, row.id);
            chrono::DateTime::default()
        }),
        delivery_status: DeliveryStatus::parse(&row.status).unwrap_or_else(|| {
            warn!("Corrupt status '{}' on message '{}'", row.status, row.id);
            DeliveryStatus::Sent
        }),
        read_at: row.read_at.as_deref().and_then(parse_db_time),
    }
}
