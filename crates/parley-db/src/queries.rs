use crate::Database;
use crate::models::{MessageRow, UserRow};
use anyhow::Result;
use chrono::{DateTime, SecondsFormat, Utc};
use parley_types::models::{DeliveryStatus, Role};
use rusqlite::Connection;
use uuid::Uuid;

/// Store timestamp format: RFC 3339 with microseconds and a `Z` suffix.
/// Fixed-width, so lexicographic order equals chronological order.
pub fn format_timestamp(at: DateTime<Utc>) -> String {
    at.to_rfc3339_opts(SecondsFormat::Micros, true)
}

impl Database {
    // -- Users --

    pub fn create_user(
        &self,
        id: &str,
        email: &str,
        username: Option<&str>,
        password_hash: &str,
        role: Role,
    ) -> Result<()> {
        self.with_conn(|conn| {
            conn.execute(
                "INSERT INTO users (id, email, username, password, role) VALUES (?1, ?2, ?3, ?4, ?5)",
                rusqlite::params![id, email, username, password_hash, role.as_str()],
            )?;
            Ok(())
        })
    }

    pub fn get_user_by_email(&self, email: &str) -> Result<Option<UserRow>> {
        self.with_conn(|conn| query_user(conn, "email", email))
    }

    pub fn get_user_by_id(&self, id: &str) -> Result<Option<UserRow>> {
        self.with_conn(|conn| query_user(conn, "id", id))
    }

    pub fn update_password(&self, id: &str, password_hash: &str) -> Result<()> {
        self.with_conn(|conn| {
            conn.execute(
                "UPDATE users SET password = ?2, is_first_login = 0 WHERE id = ?1",
                rusqlite::params![id, password_hash],
            )?;
            Ok(())
        })
    }

    pub fn touch_last_seen(&self, id: &str, at: DateTime<Utc>) -> Result<()> {
        self.with_conn(|conn| {
            conn.execute(
                "UPDATE users SET last_seen = ?2 WHERE id = ?1",
                rusqlite::params![id, format_timestamp(at)],
            )?;
            Ok(())
        })
    }

    pub fn list_users(&self) -> Result<Vec<UserRow>> {
        self.with_conn(|conn| query_users(conn, None))
    }

    pub fn list_users_by_role(&self, role: Role) -> Result<Vec<UserRow>> {
        self.with_conn(|conn| query_users(conn, Some(role)))
    }

    // -- Presence --

    /// Flip a user online. Idempotent: re-flipping an online user writes the
    /// same value.
    pub fn set_online(&self, user_id: &str) -> Result<()> {
        self.with_conn(|conn| {
            conn.execute("UPDATE users SET is_online = 1 WHERE id = ?1", [user_id])?;
            Ok(())
        })
    }

    /// Flip a user offline, stamping `last_seen`. Only the online→offline
    /// transition writes the timestamp.
    pub fn set_offline(&self, user_id: &str, at: DateTime<Utc>) -> Result<()> {
        self.with_conn(|conn| {
            conn.execute(
                "UPDATE users SET is_online = 0, last_seen = ?2 WHERE id = ?1",
                rusqlite::params![user_id, format_timestamp(at)],
            )?;
            Ok(())
        })
    }

    pub fn presence(&self, user_id: &str) -> Result<Option<(bool, Option<String>)>> {
        self.with_conn(|conn| {
            conn.query_row(
                "SELECT is_online, last_seen FROM users WHERE id = ?1",
                [user_id],
                |row| Ok((row.get(0)?, row.get(1)?)),
            )
            .optional()
        })
    }

    // -- Messages --

    /// Append a message to the durable store. The store assigns `id` and
    /// `created_at`; new messages always start as `sent`.
    pub fn append_message(
        &self,
        sender_id: &str,
        receiver_id: &str,
        content: &str,
    ) -> Result<MessageRow> {
        let row = MessageRow {
            id: Uuid::new_v4().to_string(),
            sender_id: sender_id.to_string(),
            receiver_id: receiver_id.to_string(),
            content: content.to_string(),
            status: DeliveryStatus::Sent.as_str().to_string(),
            read_at: None,
            created_at: format_timestamp(Utc::now()),
        };

        self.with_conn(|conn| {
            conn.execute(
                "INSERT INTO messages (id, sender_id, receiver_id, content, status, created_at)
                 VALUES (?1, ?2, ?3, ?4, ?5, ?6)",
                rusqlite::params![
                    row.id,
                    row.sender_id,
                    row.receiver_id,
                    row.content,
                    row.status,
                    row.created_at
                ],
            )?;
            Ok(())
        })?;

        Ok(row)
    }

    /// All messages the user sent or received, oldest first. Insertion order
    /// (rowid) breaks created_at ties.
    pub fn messages_for_user(&self, user_id: &str, limit: u32) -> Result<Vec<MessageRow>> {
        self.with_conn(|conn| {
            let mut stmt = conn.prepare(
                "SELECT id, sender_id, receiver_id, content, status, read_at, created_at
                 FROM messages
                 WHERE sender_id = ?1 OR receiver_id = ?1
                 ORDER BY created_at ASC, rowid ASC
                 LIMIT ?2",
            )?;

            let rows = stmt
                .query_map(rusqlite::params![user_id, limit], map_message_row)?
                .collect::<std::result::Result<Vec<_>, _>>()?;

            Ok(rows)
        })
    }

    pub fn get_message(&self, id: &str) -> Result<Option<MessageRow>> {
        self.with_conn(|conn| {
            let mut stmt = conn.prepare(
                "SELECT id, sender_id, receiver_id, content, status, read_at, created_at
                 FROM messages WHERE id = ?1",
            )?;
            stmt.query_row([id], map_message_row).optional()
        })
    }

    /// Advance a message `sent → delivered`. The guard keeps the transition
    /// monotonic: a message already `delivered` or `read` is left alone.
    /// Returns the number of rows moved (0 or 1).
    pub fn mark_delivered(&self, message_id: &str) -> Result<usize> {
        self.with_conn(|conn| {
            let n = conn.execute(
                "UPDATE messages SET status = 'delivered' WHERE id = ?1 AND status = 'sent'",
                [message_id],
            )?;
            Ok(n)
        })
    }

    /// Read-receipt bulk update: every not-yet-read message from `sender_id`
    /// to `receiver_id` moves to `read`, stamping `read_at` exactly once.
    pub fn mark_read(&self, sender_id: &str, receiver_id: &str, at: DateTime<Utc>) -> Result<usize> {
        self.with_conn(|conn| {
            let n = conn.execute(
                "UPDATE messages SET status = 'read', read_at = ?3
                 WHERE sender_id = ?1 AND receiver_id = ?2 AND status != 'read'",
                rusqlite::params![sender_id, receiver_id, format_timestamp(at)],
            )?;
            Ok(n)
        })
    }

    // -- Admin counts --

    pub fn count_users_by_role(&self, role: Role) -> Result<usize> {
        self.with_conn(|conn| {
            let n: i64 = conn.query_row(
                "SELECT COUNT(*) FROM users WHERE role = ?1",
                [role.as_str()],
                |row| row.get(0),
            )?;
            Ok(n as usize)
        })
    }

    pub fn count_messages(&self) -> Result<usize> {
        self.with_conn(|conn| {
            let n: i64 = conn.query_row("SELECT COUNT(*) FROM messages", [], |row| row.get(0))?;
            Ok(n as usize)
        })
    }

    pub fn count_messages_since(&self, since: DateTime<Utc>) -> Result<usize> {
        self.with_conn(|conn| {
            let n: i64 = conn.query_row(
                "SELECT COUNT(*) FROM messages WHERE created_at >= ?1",
                [format_timestamp(since)],
                |row| row.get(0),
            )?;
            Ok(n as usize)
        })
    }

    pub fn count_distinct_senders_since(&self, since: DateTime<Utc>) -> Result<usize> {
        self.with_conn(|conn| {
            let n: i64 = conn.query_row(
                "SELECT COUNT(DISTINCT sender_id) FROM messages WHERE created_at >= ?1",
                [format_timestamp(since)],
                |row| row.get(0),
            )?;
            Ok(n as usize)
        })
    }
}

fn query_user(conn: &Connection, column: &str, value: &str) -> Result<Option<UserRow>> {
    // `column` is a compile-time constant from the callers above, never user input.
    let sql = format!(
        "SELECT id, email, username, password, role, is_first_login, created_at, is_online, last_seen
         FROM users WHERE {} = ?1",
        column
    );
    let mut stmt = conn.prepare(&sql)?;
    stmt.query_row([value], map_user_row).optional()
}

fn query_users(conn: &Connection, role: Option<Role>) -> Result<Vec<UserRow>> {
    let rows = match role {
        Some(role) => {
            let mut stmt = conn.prepare(
                "SELECT id, email, username, password, role, is_first_login, created_at, is_online, last_seen
                 FROM users WHERE role = ?1 ORDER BY created_at ASC",
            )?;
            stmt.query_map([role.as_str()], map_user_row)?
                .collect::<std::result::Result<Vec<_>, _>>()?
        }
        None => {
            let mut stmt = conn.prepare(
                "SELECT id, email, username, password, role, is_first_login, created_at, is_online, last_seen
                 FROM users ORDER BY created_at ASC",
            )?;
            stmt.query_map([], map_user_row)?
                .collect::<std::result::Result<Vec<_>, _>>()?
        }
    };

    Ok(rows)
}

fn map_user_row(row: &rusqlite::Row<'_>) -> rusqlite::Result<UserRow> {
    Ok(UserRow {
        id: row.get(0)?,
        email: row.get(1)?,
        username: row.get(2)?,
        password: row.get(3)?,
        role: row.get(4)?,
        is_first_login: row.get(5)?,
        created_at: row.get(6)?,
        is_online: row.get(7)?,
        last_seen: row.get(8)?,
    })
}

fn map_message_row(row: &rusqlite::Row<'_>) -> rusqlite::Result<MessageRow> {
    Ok(MessageRow {
        id: row.get(0)?,
        sender_id: row.get(1)?,
        receiver_id: row.get(2)?,
        content: row.get(3)?,
        status: row.get(4)?,
        read_at: row.get(5)?,
        created_at: row.get(6)?,
    })
}

/// Extension trait for optional query results
trait OptionalExt<T> {
    fn optional(self) -> Result<Option<T>>;
}

impl<T> OptionalExt<T> for std::result::Result<T, rusqlite::Error> {
    fn optional(self) -> Result<Option<T>> {
        match self {
            Ok(val) => Ok(Some(val)),
            Err(rusqlite::Error::QueryReturnedNoRows) => Ok(None),
            Err(e) => Err(e.into()),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn test_db() -> Database {
        let db = Database::open_in_memory().unwrap();
        db.create_user("alice", "alice@example.com", Some("alice"), "hash", Role::Customer)
            .unwrap();
        db.create_user("bob", "bob@example.com", Some("bob"), "hash", Role::Customer)
            .unwrap();
        db
    }

    #[test]
    fn append_assigns_id_and_starts_sent() {
        let db = test_db();
        let row = db.append_message("alice", "bob", "hi").unwrap();

        assert!(!row.id.is_empty());
        assert_eq!(row.status, "sent");
        assert!(row.read_at.is_none());

        let stored = db.get_message(&row.id).unwrap().unwrap();
        assert_eq!(stored.content, "hi");
        assert_eq!(stored.created_at, row.created_at);
    }

    #[test]
    fn mark_delivered_is_monotonic() {
        let db = test_db();
        let row = db.append_message("alice", "bob", "hi").unwrap();

        assert_eq!(db.mark_delivered(&row.id).unwrap(), 1);
        // Second attempt is a no-op, not a regression.
        assert_eq!(db.mark_delivered(&row.id).unwrap(), 0);

        db.mark_read("alice", "bob", Utc::now()).unwrap();
        // A read message never moves back to delivered.
        assert_eq!(db.mark_delivered(&row.id).unwrap(), 0);
        let stored = db.get_message(&row.id).unwrap().unwrap();
        assert_eq!(stored.status, "read");
    }

    #[test]
    fn mark_read_stamps_read_at_once() {
        let db = test_db();
        let row = db.append_message("alice", "bob", "hi").unwrap();

        let first = Utc::now();
        assert_eq!(db.mark_read("alice", "bob", first).unwrap(), 1);
        let stored = db.get_message(&row.id).unwrap().unwrap();
        let stamped = stored.read_at.clone().unwrap();

        // Already-read messages are skipped; read_at keeps its first value.
        assert_eq!(db.mark_read("alice", "bob", Utc::now()).unwrap(), 0);
        let stored = db.get_message(&row.id).unwrap().unwrap();
        assert_eq!(stored.read_at.unwrap(), stamped);
    }

    #[test]
    fn mark_read_only_touches_matching_pair() {
        let db = test_db();
        let a_to_b = db.append_message("alice", "bob", "hi").unwrap();
        let b_to_a = db.append_message("bob", "alice", "hey").unwrap();

        assert_eq!(db.mark_read("alice", "bob", Utc::now()).unwrap(), 1);
        assert_eq!(db.get_message(&a_to_b.id).unwrap().unwrap().status, "read");
        assert_eq!(db.get_message(&b_to_a.id).unwrap().unwrap().status, "sent");
    }

    #[test]
    fn history_includes_sent_and_received() {
        let db = test_db();
        db.append_message("alice", "bob", "one").unwrap();
        db.append_message("bob", "alice", "two").unwrap();
        db.append_message("alice", "bob", "three").unwrap();

        let history = db.messages_for_user("alice", 100).unwrap();
        let contents: Vec<&str> = history.iter().map(|m| m.content.as_str()).collect();
        assert_eq!(contents, vec!["one", "two", "three"]);
    }

    #[test]
    fn presence_flips_are_idempotent() {
        let db = test_db();

        db.set_online("alice").unwrap();
        db.set_online("alice").unwrap();
        let (online, _) = db.presence("alice").unwrap().unwrap();
        assert!(online);

        let at = Utc::now();
        db.set_offline("alice", at).unwrap();
        let (online, last_seen) = db.presence("alice").unwrap().unwrap();
        assert!(!online);
        assert_eq!(last_seen.unwrap(), format_timestamp(at));
    }

    #[test]
    fn counts_reflect_inserts() {
        let db = test_db();
        let before = Utc::now() - chrono::Duration::minutes(1);
        db.append_message("alice", "bob", "hi").unwrap();
        db.append_message("bob", "alice", "hey").unwrap();

        assert_eq!(db.count_users_by_role(Role::Customer).unwrap(), 2);
        assert_eq!(db.count_messages().unwrap(), 2);
        assert_eq!(db.count_messages_since(before).unwrap(), 2);
        assert_eq!(db.count_distinct_senders_since(before).unwrap(), 2);
    }
}
