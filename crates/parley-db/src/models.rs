/// Database row types — these map directly to SQLite rows.
/// Distinct from parley-types API models to keep the DB layer independent.

pub struct UserRow {
    pub id: String,
    pub email: String,
    pub username: Option<String>,
    pub password: String,
    pub role: String,
    pub is_first_login: bool,
    pub created_at: String,
    pub is_online: bool,
    pub last_seen: Option<String>,
}

pub struct MessageRow {
    pub id: String,
    pub sender_id: String,
    pub receiver_id: String,
    pub content: String,
    pub status: String,
    pub read_at: Option<String>,
    pub created_at: String,
}
