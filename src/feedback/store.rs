//! Persistent SQLite store for feedback entries, authorized groups and reminders.

use std::path::PathBuf;
use std::sync::{Mutex, MutexGuard};

use chrono::{DateTime, Duration, Utc};
use rusqlite::{Connection, OptionalExtension, Row, params};
use tracing::{debug, info};

use crate::feedback::error::StorageError;
use crate::feedback::reminders::ReminderState;

/// Where the store keeps its data.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum StorageLocation {
    Memory,
    File(PathBuf),
}

/// The media message a feedback entry points at.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct MediaRef {
    pub message_id: i64,
    /// Public `t.me` link to the message.
    pub link: String,
}

/// A feedback entry that has not been persisted yet.
#[derive(Debug, Clone, PartialEq)]
pub struct NewFeedback {
    pub group_id: i64,
    pub user_id: i64,
    pub username: Option<String>,
    pub display_name: String,
    pub media_ref: MediaRef,
    pub created_at: DateTime<Utc>,
}

/// A stored feedback entry.
#[derive(Debug, Clone, PartialEq)]
pub struct FeedbackEntry {
    pub id: i64,
    pub group_id: i64,
    pub user_id: i64,
    pub username: Option<String>,
    pub display_name: String,
    pub media_ref: MediaRef,
    pub created_at: DateTime<Utc>,
}

/// A group the owner enabled for tracking.
#[derive(Debug, Clone, PartialEq)]
pub struct AuthorizedGroup {
    pub group_id: i64,
    pub title: String,
    pub added_at: DateTime<Utc>,
}

/// Durable event store. Every method is atomic on its own.
pub struct EventStore {
    conn: Mutex<Connection>,
}

const FEEDBACK_COLUMNS: &str =
    "id, group_id, user_id, username, display_name, message_id, message_link, created_at";

const REMINDER_COLUMNS: &str = "group_id, text, interval_secs, next_fire_at, active, created_at";

impl EventStore {
    /// Open (or create) the store at the given location.
    pub fn open(location: &StorageLocation) -> Result<Self, StorageError> {
        let conn = match location {
            StorageLocation::Memory => Connection::open_in_memory()?,
            StorageLocation::File(path) => Connection::open(path)?,
        };
        let store = Self { conn: Mutex::new(conn) };
        store.init_schema()?;

        let (entries, groups) = store.counts()?;
        info!("Opened store {:?} ({} feedback entries, {} groups)", location, entries, groups);
        Ok(store)
    }

    /// In-memory store, mostly for tests.
    pub fn in_memory() -> Result<Self, StorageError> {
        Self::open(&StorageLocation::Memory)
    }

    fn conn(&self) -> Result<MutexGuard<'_, Connection>, StorageError> {
        self.conn.lock().map_err(|_| StorageError::Unavailable)
    }

    fn init_schema(&self) -> Result<(), StorageError> {
        let conn = self.conn()?;
        conn.execute_batch(
            r#"
            CREATE TABLE IF NOT EXISTS groups (
                group_id INTEGER PRIMARY KEY,
                title TEXT NOT NULL,
                added_at INTEGER NOT NULL
            );

            CREATE TABLE IF NOT EXISTS feedback (
                id INTEGER PRIMARY KEY AUTOINCREMENT,
                group_id INTEGER NOT NULL,
                user_id INTEGER NOT NULL,
                username TEXT,
                display_name TEXT NOT NULL,
                message_id INTEGER NOT NULL,
                message_link TEXT NOT NULL,
                created_at INTEGER NOT NULL
            );

            CREATE TABLE IF NOT EXISTS reminders (
                group_id INTEGER PRIMARY KEY,
                text TEXT NOT NULL,
                interval_secs INTEGER NOT NULL,
                next_fire_at INTEGER NOT NULL,
                active INTEGER NOT NULL DEFAULT 1,
                created_at INTEGER NOT NULL
            );

            CREATE INDEX IF NOT EXISTS idx_feedback_created_at ON feedback(created_at);
            CREATE INDEX IF NOT EXISTS idx_feedback_group_user ON feedback(group_id, user_id);
            CREATE INDEX IF NOT EXISTS idx_reminders_due ON reminders(active, next_fire_at);
            "#,
        )?;
        Ok(())
    }

    fn counts(&self) -> Result<(usize, usize), StorageError> {
        let conn = self.conn()?;
        let entries: i64 = conn.query_row("SELECT COUNT(*) FROM feedback", [], |row| row.get(0))?;
        let groups: i64 = conn.query_row("SELECT COUNT(*) FROM groups", [], |row| row.get(0))?;
        Ok((entries as usize, groups as usize))
    }

    /// Trivial round-trip that keeps the connection warm.
    pub fn heartbeat(&self) -> Result<(), StorageError> {
        let conn = self.conn()?;
        conn.query_row("SELECT 1", [], |row| row.get::<_, i64>(0))?;
        Ok(())
    }

    // ==================== FEEDBACK ====================

    /// Persist a feedback entry, returning its id.
    pub fn save(&self, entry: &NewFeedback) -> Result<i64, StorageError> {
        let conn = self.conn()?;
        conn.execute(
            "INSERT INTO feedback (group_id, user_id, username, display_name, message_id, message_link, created_at)
             VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7)",
            params![
                entry.group_id,
                entry.user_id,
                entry.username,
                entry.display_name,
                entry.media_ref.message_id,
                entry.media_ref.link,
                entry.created_at.timestamp_millis(),
            ],
        )?;
        Ok(conn.last_insert_rowid())
    }

    /// Entries of a group created at or after `since`, oldest first.
    pub fn list_since(
        &self,
        group_id: i64,
        since: DateTime<Utc>,
    ) -> Result<Vec<FeedbackEntry>, StorageError> {
        let conn = self.conn()?;
        let mut stmt = conn.prepare(&format!(
            "SELECT {FEEDBACK_COLUMNS} FROM feedback
             WHERE group_id = ?1 AND created_at >= ?2
             ORDER BY created_at ASC, id ASC"
        ))?;
        let rows = stmt.query_map(params![group_id, since.timestamp_millis()], feedback_from_row)?;
        Ok(rows.collect::<Result<Vec<_>, _>>()?)
    }

    /// Entries of one user in a group created at or after `since`, oldest first.
    pub fn list_for_user(
        &self,
        group_id: i64,
        user_id: i64,
        since: DateTime<Utc>,
    ) -> Result<Vec<FeedbackEntry>, StorageError> {
        let conn = self.conn()?;
        let mut stmt = conn.prepare(&format!(
            "SELECT {FEEDBACK_COLUMNS} FROM feedback
             WHERE group_id = ?1 AND user_id = ?2 AND created_at >= ?3
             ORDER BY created_at ASC, id ASC"
        ))?;
        let rows = stmt.query_map(
            params![group_id, user_id, since.timestamp_millis()],
            feedback_from_row,
        )?;
        Ok(rows.collect::<Result<Vec<_>, _>>()?)
    }

    /// Most recent user id recorded under `username` (case-insensitive, no `@`) in a group.
    pub fn find_user_by_username(
        &self,
        group_id: i64,
        username: &str,
    ) -> Result<Option<i64>, StorageError> {
        let conn = self.conn()?;
        let user_id = conn
            .query_row(
                "SELECT user_id FROM feedback
                 WHERE group_id = ?1 AND LOWER(username) = LOWER(?2)
                 ORDER BY created_at DESC LIMIT 1",
                params![group_id, username.trim_start_matches('@')],
                |row| row.get(0),
            )
            .optional()?;
        Ok(user_id)
    }

    /// Delete every entry created strictly before `cutoff`.
    pub fn delete_older_than(&self, cutoff: DateTime<Utc>) -> Result<usize, StorageError> {
        let conn = self.conn()?;
        let deleted = conn.execute(
            "DELETE FROM feedback WHERE created_at < ?1",
            params![cutoff.timestamp_millis()],
        )?;
        Ok(deleted)
    }

    /// Delete every entry of a group.
    pub fn wipe(&self, group_id: i64) -> Result<usize, StorageError> {
        let conn = self.conn()?;
        let deleted = conn.execute("DELETE FROM feedback WHERE group_id = ?1", params![group_id])?;
        info!("🗑 Wiped {} feedback entries of group {}", deleted, group_id);
        Ok(deleted)
    }

    // ==================== GROUPS ====================

    pub fn is_authorized(&self, group_id: i64) -> Result<bool, StorageError> {
        let conn = self.conn()?;
        let found = conn
            .query_row("SELECT 1 FROM groups WHERE group_id = ?1", params![group_id], |_| Ok(()))
            .optional()?;
        Ok(found.is_some())
    }

    /// Authorize a group. Re-authorizing only refreshes the title.
    pub fn authorize(
        &self,
        group_id: i64,
        title: &str,
        now: DateTime<Utc>,
    ) -> Result<AuthorizedGroup, StorageError> {
        let conn = self.conn()?;
        conn.execute(
            "INSERT INTO groups (group_id, title, added_at) VALUES (?1, ?2, ?3)
             ON CONFLICT(group_id) DO UPDATE SET title = excluded.title",
            params![group_id, title, now.timestamp_millis()],
        )?;
        let group = conn.query_row(
            "SELECT group_id, title, added_at FROM groups WHERE group_id = ?1",
            params![group_id],
            |row| {
                Ok(AuthorizedGroup {
                    group_id: row.get(0)?,
                    title: row.get(1)?,
                    added_at: millis_to_utc(row, 2)?,
                })
            },
        )?;
        Ok(group)
    }

    // ==================== REMINDERS ====================

    pub fn get_reminder(&self, group_id: i64) -> Result<Option<ReminderState>, StorageError> {
        let conn = self.conn()?;
        let reminder = conn
            .query_row(
                &format!("SELECT {REMINDER_COLUMNS} FROM reminders WHERE group_id = ?1"),
                params![group_id],
                reminder_from_row,
            )
            .optional()?;
        Ok(reminder)
    }

    /// Create or replace the group's reminder. It first fires one interval from `now`.
    pub fn upsert_reminder(
        &self,
        group_id: i64,
        text: &str,
        interval: Duration,
        now: DateTime<Utc>,
    ) -> Result<ReminderState, StorageError> {
        let reminder = ReminderState::new(group_id, text, interval, now);
        let conn = self.conn()?;
        conn.execute(
            "INSERT INTO reminders (group_id, text, interval_secs, next_fire_at, active, created_at)
             VALUES (?1, ?2, ?3, ?4, 1, ?5)
             ON CONFLICT(group_id) DO UPDATE SET
                text = excluded.text,
                interval_secs = excluded.interval_secs,
                next_fire_at = excluded.next_fire_at,
                active = 1,
                created_at = excluded.created_at",
            params![
                reminder.group_id,
                reminder.text,
                reminder.interval.num_seconds(),
                reminder.next_fire_at.timestamp_millis(),
                reminder.created_at.timestamp_millis(),
            ],
        )?;
        Ok(reminder)
    }

    /// Deactivate the group's reminder. Returns false if none was active.
    pub fn deactivate_reminder(&self, group_id: i64) -> Result<bool, StorageError> {
        let conn = self.conn()?;
        let changed = conn.execute(
            "UPDATE reminders SET active = 0 WHERE group_id = ?1 AND active = 1",
            params![group_id],
        )?;
        Ok(changed == 1)
    }

    /// Active reminders of authorized groups whose `next_fire_at <= now`.
    pub fn due_reminders(&self, now: DateTime<Utc>) -> Result<Vec<ReminderState>, StorageError> {
        let conn = self.conn()?;
        let mut stmt = conn.prepare(
            "SELECT r.group_id, r.text, r.interval_secs, r.next_fire_at, r.active, r.created_at
             FROM reminders r
             JOIN groups g ON g.group_id = r.group_id
             WHERE r.active = 1 AND r.next_fire_at <= ?1
             ORDER BY r.next_fire_at ASC",
        )?;
        let rows = stmt.query_map(params![now.timestamp_millis()], reminder_from_row)?;
        Ok(rows.collect::<Result<Vec<_>, _>>()?)
    }

    /// Advance a due reminder to `now + interval` in one compare-and-set update.
    ///
    /// Returns false if another tick already claimed this occurrence or the
    /// reminder was replaced or deactivated in the meantime.
    pub fn claim_reminder(
        &self,
        reminder: &ReminderState,
        now: DateTime<Utc>,
    ) -> Result<bool, StorageError> {
        let next = reminder.next_after(now);
        let conn = self.conn()?;
        let changed = conn.execute(
            "UPDATE reminders SET next_fire_at = ?1
             WHERE group_id = ?2 AND active = 1 AND next_fire_at = ?3",
            params![
                next.timestamp_millis(),
                reminder.group_id,
                reminder.next_fire_at.timestamp_millis(),
            ],
        )?;
        debug!("Claim reminder of group {}: {}", reminder.group_id, changed == 1);
        Ok(changed == 1)
    }
}

impl EventStore {
    /// Hide or restore the feedback table to simulate a storage outage.
    #[cfg(test)]
    pub(crate) fn set_feedback_offline(&self, offline: bool) {
        let sql = if offline {
            "ALTER TABLE feedback RENAME TO feedback_offline"
        } else {
            "ALTER TABLE feedback_offline RENAME TO feedback"
        };
        self.conn().unwrap().execute_batch(sql).unwrap();
    }
}

fn millis_to_utc(row: &Row<'_>, idx: usize) -> rusqlite::Result<DateTime<Utc>> {
    let ms: i64 = row.get(idx)?;
    DateTime::from_timestamp_millis(ms).ok_or(rusqlite::Error::IntegralValueOutOfRange(idx, ms))
}

fn feedback_from_row(row: &Row<'_>) -> rusqlite::Result<FeedbackEntry> {
    Ok(FeedbackEntry {
        id: row.get(0)?,
        group_id: row.get(1)?,
        user_id: row.get(2)?,
        username: row.get(3)?,
        display_name: row.get(4)?,
        media_ref: MediaRef {
            message_id: row.get(5)?,
            link: row.get(6)?,
        },
        created_at: millis_to_utc(row, 7)?,
    })
}

fn reminder_from_row(row: &Row<'_>) -> rusqlite::Result<ReminderState> {
    let secs: i64 = row.get(2)?;
    Ok(ReminderState {
        group_id: row.get(0)?,
        text: row.get(1)?,
        interval: Duration::try_seconds(secs).ok_or(rusqlite::Error::IntegralValueOutOfRange(2, secs))?,
        next_fire_at: millis_to_utc(row, 3)?,
        active: row.get(4)?,
        created_at: millis_to_utc(row, 5)?,
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::TimeZone;

    fn at(hour: u32) -> DateTime<Utc> {
        Utc.with_ymd_and_hms(2024, 3, 10, hour, 0, 0).unwrap()
    }

    fn entry(group_id: i64, user_id: i64, username: &str, created_at: DateTime<Utc>) -> NewFeedback {
        NewFeedback {
            group_id,
            user_id,
            username: Some(username.to_string()),
            display_name: username.to_uppercase(),
            media_ref: MediaRef {
                message_id: 42,
                link: "https://t.me/c/123/42".to_string(),
            },
            created_at,
        }
    }

    #[test]
    fn test_save_assigns_increasing_ids() {
        let store = EventStore::in_memory().unwrap();
        let first = store.save(&entry(-1, 10, "alice", at(1))).unwrap();
        let second = store.save(&entry(-1, 10, "alice", at(2))).unwrap();
        assert!(second > first);
    }

    #[test]
    fn test_list_since_is_ordered_and_scoped() {
        let store = EventStore::in_memory().unwrap();
        store.save(&entry(-1, 10, "alice", at(5))).unwrap();
        store.save(&entry(-1, 11, "bob", at(3))).unwrap();
        store.save(&entry(-2, 12, "carol", at(4))).unwrap();
        store.save(&entry(-1, 10, "alice", at(1))).unwrap();

        let entries = store.list_since(-1, at(2)).unwrap();
        let hours: Vec<_> = entries.iter().map(|e| e.created_at).collect();
        assert_eq!(hours, vec![at(3), at(5)]);
        assert!(entries.iter().all(|e| e.group_id == -1));
    }

    #[test]
    fn test_list_for_user() {
        let store = EventStore::in_memory().unwrap();
        store.save(&entry(-1, 10, "alice", at(2))).unwrap();
        store.save(&entry(-1, 11, "bob", at(3))).unwrap();
        store.save(&entry(-1, 10, "alice", at(4))).unwrap();

        let entries = store.list_for_user(-1, 10, at(0)).unwrap();
        assert_eq!(entries.len(), 2);
        assert!(entries.iter().all(|e| e.user_id == 10));
    }

    #[test]
    fn test_find_user_by_username_is_case_insensitive() {
        let store = EventStore::in_memory().unwrap();
        store.save(&entry(-1, 10, "Alice", at(2))).unwrap();

        assert_eq!(store.find_user_by_username(-1, "@alice").unwrap(), Some(10));
        assert_eq!(store.find_user_by_username(-1, "ALICE").unwrap(), Some(10));
        assert_eq!(store.find_user_by_username(-2, "alice").unwrap(), None);
    }

    #[test]
    fn test_delete_older_than_is_idempotent() {
        let store = EventStore::in_memory().unwrap();
        store.save(&entry(-1, 10, "alice", at(1))).unwrap();
        store.save(&entry(-1, 11, "bob", at(5))).unwrap();

        assert_eq!(store.delete_older_than(at(3)).unwrap(), 1);
        assert_eq!(store.delete_older_than(at(3)).unwrap(), 0);
        assert_eq!(store.list_since(-1, at(0)).unwrap().len(), 1);
    }

    #[test]
    fn test_authorize_keeps_added_at() {
        let store = EventStore::in_memory().unwrap();
        assert!(!store.is_authorized(-1).unwrap());

        let first = store.authorize(-1, "Old title", at(1)).unwrap();
        let second = store.authorize(-1, "New title", at(9)).unwrap();

        assert!(store.is_authorized(-1).unwrap());
        assert_eq!(second.title, "New title");
        assert_eq!(second.added_at, first.added_at);
    }

    #[test]
    fn test_reminder_upsert_replaces_and_reactivates() {
        let store = EventStore::in_memory().unwrap();
        store.upsert_reminder(-1, "first", Duration::hours(2), at(0)).unwrap();
        assert!(store.deactivate_reminder(-1).unwrap());
        assert!(!store.deactivate_reminder(-1).unwrap());

        store.upsert_reminder(-1, "second", Duration::hours(1), at(3)).unwrap();
        let reminder = store.get_reminder(-1).unwrap().unwrap();
        assert!(reminder.active);
        assert_eq!(reminder.text, "second");
        assert_eq!(reminder.next_fire_at, at(4));
    }

    #[test]
    fn test_due_reminders_require_authorized_group() {
        let store = EventStore::in_memory().unwrap();
        store.upsert_reminder(-1, "hello", Duration::hours(1), at(0)).unwrap();
        assert!(store.due_reminders(at(2)).unwrap().is_empty());

        store.authorize(-1, "group", at(0)).unwrap();
        assert_eq!(store.due_reminders(at(2)).unwrap().len(), 1);
    }

    #[test]
    fn test_claim_reminder_only_once() {
        let store = EventStore::in_memory().unwrap();
        store.authorize(-1, "group", at(0)).unwrap();
        store.upsert_reminder(-1, "hello", Duration::hours(1), at(0)).unwrap();

        let due = store.due_reminders(at(1)).unwrap();
        assert!(store.claim_reminder(&due[0], at(1)).unwrap());
        assert!(!store.claim_reminder(&due[0], at(1)).unwrap());
        assert_eq!(store.get_reminder(-1).unwrap().unwrap().next_fire_at, at(2));
    }

    #[test]
    fn test_file_store_persists() {
        let dir = tempfile::tempdir().unwrap();
        let location = StorageLocation::File(dir.path().join("feedback.db"));
        {
            let store = EventStore::open(&location).unwrap();
            store.authorize(-1, "group", at(0)).unwrap();
        }
        let store = EventStore::open(&location).unwrap();
        assert!(store.is_authorized(-1).unwrap());
        store.heartbeat().unwrap();
    }
}
