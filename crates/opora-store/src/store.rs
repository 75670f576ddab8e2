use std::path::Path;
use std::sync::Mutex;

use rusqlite::{Connection, OpenFlags};
use tracing::debug;

use opora_core::types::{GroupId, RawMessage};

use crate::db::init_db;
use crate::error::{Result, StoreError};

/// Outcome of an idempotent insert.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum InsertOutcome {
    Inserted,
    Duplicate,
}

/// Thread-safe handle over the primary SQLite database.
///
/// Wraps a single connection in a `Mutex`; individual operations that touch
/// several rows run inside one SQLite transaction. Callers needing per-group
/// serialization hold the group guard around whole read-modify-write
/// sequences — the store itself only guarantees per-call atomicity.
pub struct Store {
    pub(crate) db: Mutex<Connection>,
}

impl Store {
    /// Open (or create) the store at `path` and initialise the schema.
    pub fn open(path: impl AsRef<Path>, busy_timeout_ms: u64) -> Result<Self> {
        let conn = Connection::open(path)?;
        conn.busy_timeout(std::time::Duration::from_millis(busy_timeout_ms))?;
        conn.pragma_update(None, "journal_mode", "WAL")?;
        init_db(&conn)?;
        Ok(Self {
            db: Mutex::new(conn),
        })
    }

    /// In-memory store for tests.
    pub fn open_in_memory() -> Result<Self> {
        let conn = Connection::open_with_flags(
            "file::memory:",
            OpenFlags::SQLITE_OPEN_READ_WRITE
                | OpenFlags::SQLITE_OPEN_CREATE
                | OpenFlags::SQLITE_OPEN_URI,
        )?;
        init_db(&conn)?;
        Ok(Self {
            db: Mutex::new(conn),
        })
    }

    // --- raw messages ------------------------------------------------------

    /// Idempotent insert keyed on (group_id, message_id). A second insert of
    /// the same key is reported as `Duplicate`, not an error.
    pub fn insert_raw_message(&self, m: &RawMessage) -> Result<InsertOutcome> {
        let db = self.db.lock().unwrap();
        let image_paths = serde_json::to_string(&m.image_paths)?;
        let n = db.execute(
            "INSERT OR IGNORE INTO raw_messages
             (group_id, message_id, ts, sender_hash, sender_name, content_text,
              image_paths, reply_to_id, reaction_count, from_bot)
             VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10)",
            rusqlite::params![
                m.group_id.as_str(),
                m.message_id,
                m.ts,
                m.sender_hash,
                m.sender_name,
                m.content_text,
                image_paths,
                m.reply_to_id,
                m.reaction_count,
                m.from_bot,
            ],
        )?;
        Ok(if n == 0 {
            InsertOutcome::Duplicate
        } else {
            InsertOutcome::Inserted
        })
    }

    pub fn get_message(&self, group_id: &GroupId, message_id: &str) -> Result<Option<RawMessage>> {
        let db = self.db.lock().unwrap();
        match db.query_row(
            "SELECT group_id, message_id, ts, sender_hash, sender_name, content_text,
                    image_paths, reply_to_id, reaction_count, from_bot
             FROM raw_messages WHERE group_id = ?1 AND message_id = ?2",
            rusqlite::params![group_id.as_str(), message_id],
            row_to_message,
        ) {
            Ok(m) => Ok(Some(m)),
            Err(rusqlite::Error::QueryReturnedNoRows) => Ok(None),
            Err(e) => Err(StoreError::Database(e)),
        }
    }

    /// The `k` messages preceding `before_ts` in a group, oldest first.
    /// Used as the gate's recent context.
    pub fn get_recent_messages(
        &self,
        group_id: &GroupId,
        before_ts: i64,
        k: usize,
    ) -> Result<Vec<RawMessage>> {
        let db = self.db.lock().unwrap();
        let mut stmt = db.prepare(
            "SELECT group_id, message_id, ts, sender_hash, sender_name, content_text,
                    image_paths, reply_to_id, reaction_count, from_bot
             FROM raw_messages
             WHERE group_id = ?1 AND ts < ?2
             ORDER BY ts DESC
             LIMIT ?3",
        )?;
        let mut rows: Vec<RawMessage> = stmt
            .query_map(
                rusqlite::params![group_id.as_str(), before_ts, k as i64],
                row_to_message,
            )?
            .filter_map(|r| r.ok())
            .collect();
        rows.reverse();
        Ok(rows)
    }

    /// True if `message_id` exists in the group's history.
    pub fn message_exists(&self, group_id: &GroupId, message_id: &str) -> Result<bool> {
        let db = self.db.lock().unwrap();
        let n: i64 = db.query_row(
            "SELECT COUNT(*) FROM raw_messages WHERE group_id = ?1 AND message_id = ?2",
            rusqlite::params![group_id.as_str(), message_id],
            |row| row.get(0),
        )?;
        Ok(n > 0)
    }

    // --- buffers -----------------------------------------------------------

    pub fn get_buffer(&self, group_id: &GroupId) -> Result<String> {
        let db = self.db.lock().unwrap();
        match db.query_row(
            "SELECT buffer_text FROM group_buffers WHERE group_id = ?1",
            rusqlite::params![group_id.as_str()],
            |row| row.get(0),
        ) {
            Ok(text) => Ok(text),
            Err(rusqlite::Error::QueryReturnedNoRows) => Ok(String::new()),
            Err(e) => Err(StoreError::Database(e)),
        }
    }

    /// Last writer wins; callers serialise per group via the group guard.
    pub fn set_buffer(&self, group_id: &GroupId, text: &str) -> Result<()> {
        let db = self.db.lock().unwrap();
        let now = opora_core::now_ms();
        db.execute(
            "INSERT INTO group_buffers (group_id, buffer_text, updated_at)
             VALUES (?1, ?2, ?3)
             ON CONFLICT(group_id) DO UPDATE SET buffer_text = ?2, updated_at = ?3",
            rusqlite::params![group_id.as_str(), text, now],
        )?;
        Ok(())
    }

    // --- reactions ---------------------------------------------------------

    /// Idempotent upsert of a reaction tuple.
    pub fn upsert_reaction(
        &self,
        group_id: &GroupId,
        target_ts: i64,
        target_author: &str,
        sender_hash: &str,
        emoji: &str,
        is_positive: bool,
    ) -> Result<()> {
        let db = self.db.lock().unwrap();
        let now = opora_core::now_ms();
        db.execute(
            "INSERT OR REPLACE INTO reactions
             (group_id, target_ts, target_author, sender_hash, emoji, is_positive, created_at)
             VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7)",
            rusqlite::params![
                group_id.as_str(),
                target_ts,
                target_author,
                sender_hash,
                emoji,
                is_positive,
                now
            ],
        )?;
        Ok(())
    }

    /// Delete the exact reaction tuple (reaction-remove).
    pub fn delete_reaction(
        &self,
        group_id: &GroupId,
        target_ts: i64,
        target_author: &str,
        sender_hash: &str,
        emoji: &str,
    ) -> Result<()> {
        let db = self.db.lock().unwrap();
        db.execute(
            "DELETE FROM reactions
             WHERE group_id = ?1 AND target_ts = ?2 AND target_author = ?3
               AND sender_hash = ?4 AND emoji = ?5",
            rusqlite::params![group_id.as_str(), target_ts, target_author, sender_hash, emoji],
        )?;
        Ok(())
    }

    /// Positive-reaction count for the message at `ts` in a group.
    pub fn count_positive_reactions(&self, group_id: &GroupId, ts: i64) -> Result<u32> {
        let db = self.db.lock().unwrap();
        let n: i64 = db.query_row(
            "SELECT COUNT(*) FROM reactions
             WHERE group_id = ?1 AND target_ts = ?2 AND is_positive = 1",
            rusqlite::params![group_id.as_str(), ts],
            |row| row.get(0),
        )?;
        Ok(n as u32)
    }

    // --- reply ledger ------------------------------------------------------

    /// Record that a reply to (group, message) was sent. Returns `Duplicate`
    /// when a prior send already claimed the key, in which case the caller
    /// must not send again.
    pub fn claim_reply(&self, group_id: &GroupId, message_id: &str) -> Result<InsertOutcome> {
        let db = self.db.lock().unwrap();
        let now = opora_core::now_ms();
        let n = db.execute(
            "INSERT OR IGNORE INTO replies (group_id, message_id, sent_at)
             VALUES (?1, ?2, ?3)",
            rusqlite::params![group_id.as_str(), message_id, now],
        )?;
        Ok(if n == 0 {
            InsertOutcome::Duplicate
        } else {
            InsertOutcome::Inserted
        })
    }

    /// Release a claimed reply key after a failed send so a retry can claim
    /// it again.
    pub fn release_reply(&self, group_id: &GroupId, message_id: &str) -> Result<()> {
        let db = self.db.lock().unwrap();
        db.execute(
            "DELETE FROM replies WHERE group_id = ?1 AND message_id = ?2",
            rusqlite::params![group_id.as_str(), message_id],
        )?;
        Ok(())
    }

    // --- group docs --------------------------------------------------------

    pub fn set_group_docs(&self, group_id: &GroupId, urls: &[String]) -> Result<()> {
        let db = self.db.lock().unwrap();
        let json = serde_json::to_string(urls)?;
        let now = opora_core::now_ms();
        db.execute(
            "INSERT INTO group_docs (group_id, urls, updated_at)
             VALUES (?1, ?2, ?3)
             ON CONFLICT(group_id) DO UPDATE SET urls = ?2, updated_at = ?3",
            rusqlite::params![group_id.as_str(), json, now],
        )?;
        Ok(())
    }

    pub fn get_group_docs(&self, group_id: &GroupId) -> Result<Vec<String>> {
        let db = self.db.lock().unwrap();
        match db.query_row(
            "SELECT urls FROM group_docs WHERE group_id = ?1",
            rusqlite::params![group_id.as_str()],
            |row| row.get::<_, String>(0),
        ) {
            Ok(json) => Ok(serde_json::from_str(&json)?),
            Err(rusqlite::Error::QueryReturnedNoRows) => Ok(Vec::new()),
            Err(e) => Err(StoreError::Database(e)),
        }
    }

    // --- group wipe --------------------------------------------------------

    /// Remove every trace of a group: messages, buffer, cases with evidence,
    /// reactions, reply ledger, docs, links. Runs in one transaction.
    pub fn delete_group_data(&self, group_id: &GroupId) -> Result<()> {
        let mut db = self.db.lock().unwrap();
        let tx = db.transaction()?;
        let gid = group_id.as_str();
        tx.execute(
            "DELETE FROM case_evidence WHERE case_id IN
             (SELECT case_id FROM cases WHERE group_id = ?1)",
            [gid],
        )?;
        tx.execute("DELETE FROM cases WHERE group_id = ?1", [gid])?;
        tx.execute("DELETE FROM raw_messages WHERE group_id = ?1", [gid])?;
        tx.execute("DELETE FROM group_buffers WHERE group_id = ?1", [gid])?;
        tx.execute("DELETE FROM reactions WHERE group_id = ?1", [gid])?;
        tx.execute("DELETE FROM replies WHERE group_id = ?1", [gid])?;
        tx.execute("DELETE FROM group_docs WHERE group_id = ?1", [gid])?;
        tx.execute("DELETE FROM admin_group_links WHERE group_id = ?1", [gid])?;
        tx.execute("DELETE FROM history_tokens WHERE group_id = ?1", [gid])?;
        tx.commit()?;
        debug!(group = %group_id, "group data wiped");
        Ok(())
    }
}

pub(crate) fn row_to_message(row: &rusqlite::Row<'_>) -> rusqlite::Result<RawMessage> {
    let image_paths: String = row.get(6)?;
    Ok(RawMessage {
        group_id: GroupId::from(row.get::<_, String>(0)?),
        message_id: row.get(1)?,
        ts: row.get(2)?,
        sender_hash: row.get(3)?,
        sender_name: row.get(4)?,
        content_text: row.get(5)?,
        image_paths: serde_json::from_str(&image_paths).unwrap_or_default(),
        reply_to_id: row.get(7)?,
        reaction_count: row.get::<_, i64>(8)? as u32,
        from_bot: row.get(9)?,
    })
}
