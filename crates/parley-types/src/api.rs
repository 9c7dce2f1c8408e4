use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::models::{Role, User};

// -- JWT Claims --

/// JWT claims shared across parley-api (REST middleware) and the WebSocket
/// upgrade check in parley-server. Canonical definition lives here in
/// parley-types to eliminate duplication.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Claims {
    pub sub: Uuid,
    pub role: Role,
    pub exp: usize,
}

// -- Auth --

#[derive(Debug, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct LoginRequest {
    pub email: String,
    pub password: String,
}

#[derive(Debug, Serialize)]
pub struct LoginResponse {
    pub access_token: String,
    pub token_type: String,
    pub user: User,
}

#[derive(Debug, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct CreateUserRequest {
    pub email: String,
    pub password: String,
    pub username: Option<String>,
}

#[derive(Debug, Serialize)]
pub struct CreateUserResponse {
    pub id: Uuid,
    pub email: String,
}

#[derive(Debug, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct ChangePasswordRequest {
    pub new_password: String,
}

// -- Messages --

/// Read-receipt collaborator surface: marks every unread message from
/// `sender_id` to `receiver_id` as read.
#[derive(Debug, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct MarkReadRequest {
    pub sender_id: Uuid,
    pub receiver_id: Uuid,
}

#[derive(Debug, Serialize)]
pub struct MarkReadResponse {
    pub updated: usize,
}

// -- Admin --

#[derive(Debug, Serialize)]
pub struct AdminStats {
    pub total_users: usize,
    pub total_messages: usize,
    pub messages_today: usize,
    pub active_users: usize,
}
